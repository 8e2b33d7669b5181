//! Readiness reactor
//!
//! Provides:
//! - One acceptor thread distributing inbound sockets round-robin
//! - N worker threads, each owning a `mio::Poll` and its connections
//! - Shared buffer pools for reads, staged writes and frame reassembly
//! - The `ProtocolHandler` seam where per-process state machines plug in
//!
//! A connection and its paired peer always live on the same worker, so relay
//! and cascading close never cross threads.

mod acceptor;
mod context;
mod pool;
mod session;
mod socket;
mod worker;

pub use context::{ConnectionContext, PostWrite, PostWriteQueue};
pub use mio::Token;
pub use pool::{BufferPool, BufferPools, PoolStats};
pub use session::Session;
pub use socket::{bind_listener, SocketOptions};

use crate::config::ReactorConfig;
use crate::tunnel::{FRAME_OVERHEAD, MAX_FRAME_SIZE};
use acceptor::{Acceptor, AcceptorHandle};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info};
use worker::{Worker, WorkerHandle};

/// Reactor errors
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Unknown connection {0:?}")]
    UnknownConnection(Token),

    #[error("Invalid reactor state: {0}")]
    State(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Per-process protocol state machine driven by the workers.
///
/// Every callback runs on the worker owning `token`. An `Err` closes that
/// connection (cascading to its peer) and never reaches the worker loop.
pub trait ProtocolHandler: Send + Sync + 'static {
    /// State attached to each connection
    type State: Send + 'static;

    /// Initial state of an accepted connection
    fn accepted(&self) -> Self::State;

    /// Bytes read from `token`. Reading is suspended until something re-arms it.
    fn handle_read(
        &self,
        session: &mut Session<Self::State>,
        token: Token,
        data: &[u8],
    ) -> crate::Result<()>;

    /// An outbound connect started with `Session::connect` completed
    fn on_connect_success(&self, session: &mut Session<Self::State>, token: Token)
        -> crate::Result<()>;

    /// An outbound connect failed; the connection is closed afterwards
    fn on_connect_fail(
        &self,
        session: &mut Session<Self::State>,
        token: Token,
        error: io::Error,
    ) -> crate::Result<()>;

    /// A `PostWrite::Callback` fired
    fn on_flushed(&self, _session: &mut Session<Self::State>, _token: Token) -> crate::Result<()> {
        Ok(())
    }
}

impl BufferPools {
    /// Size the three pools from configuration
    pub fn from_config(config: &ReactorConfig) -> Self {
        Self::new(
            BufferPool::new("read", config.read_pool_size, config.read_buffer_size),
            BufferPool::new(
                "write",
                config.write_pool_size,
                config.read_buffer_size + FRAME_OVERHEAD,
            ),
            BufferPool::new("frame", config.frame_pool_size, MAX_FRAME_SIZE),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New,
    Running,
    Stopped,
}

/// Acceptor plus worker pool bound to one listen address
pub struct Reactor<H: ProtocolHandler> {
    local_addr: SocketAddr,
    lifecycle: Lifecycle,
    pools: Arc<BufferPools>,
    acceptor: Option<Acceptor>,
    acceptor_handle: Option<AcceptorHandle>,
    workers: Vec<Worker<H>>,
    handles: Vec<WorkerHandle>,
    threads: Vec<JoinHandle<()>>,
}

impl<H: ProtocolHandler> Reactor<H> {
    /// Bind the listen socket and build the workers; nothing runs until `start`
    pub fn new(listen: SocketAddr, config: &ReactorConfig, handler: H) -> Result<Self, ReactorError> {
        let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
        let listener = socket::bind_listener(listen, backlog)
            .map_err(|source| ReactorError::Bind { addr: listen, source })?;
        let local_addr = listener.local_addr()?;

        let pools = Arc::new(BufferPools::from_config(config));
        let options = SocketOptions {
            nodelay: config.tcp_nodelay,
            keepalive: config.tcp_keepalive,
        };
        let handler = Arc::new(handler);

        let mut workers = Vec::with_capacity(config.workers);
        let mut handles = Vec::with_capacity(config.workers);
        for id in 0..config.workers.max(1) {
            let (worker, handle) =
                Worker::new(id, Arc::clone(&handler), Arc::clone(&pools), options)?;
            workers.push(worker);
            handles.push(handle);
        }

        let (acceptor, acceptor_handle) = Acceptor::new(listener, handles.clone())?;

        Ok(Self {
            local_addr,
            lifecycle: Lifecycle::New,
            pools,
            acceptor: Some(acceptor),
            acceptor_handle: Some(acceptor_handle),
            workers,
            handles,
            threads: Vec::new(),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }

    pub fn pools(&self) -> &BufferPools {
        &self.pools
    }

    /// Spawn the worker threads, then the acceptor
    pub fn start(&mut self) -> Result<(), ReactorError> {
        if self.lifecycle != Lifecycle::New {
            return Err(ReactorError::State("start requires a new reactor"));
        }
        let Some(acceptor) = self.acceptor.take() else {
            return Err(ReactorError::State("acceptor already consumed"));
        };

        for worker in self.workers.drain(..) {
            let name = format!("worker-{}", self.threads.len());
            let thread = thread::Builder::new().name(name).spawn(move || worker.run())?;
            self.threads.push(thread);
        }
        let thread = thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || acceptor.run())?;
        self.threads.push(thread);

        self.lifecycle = Lifecycle::Running;
        info!(
            "Reactor listening on {} with {} workers",
            self.local_addr,
            self.handles.len()
        );
        Ok(())
    }

    /// Stop accepting, stop every worker and join all threads
    pub fn shutdown(&mut self) -> Result<(), ReactorError> {
        if self.lifecycle != Lifecycle::Running {
            return Err(ReactorError::State("shutdown requires a running reactor"));
        }
        self.lifecycle = Lifecycle::Stopped;

        // the waker must outlive the join: dropping it discards the pending wake
        let acceptor = self.acceptor_handle.take();
        if let Some(acceptor) = &acceptor {
            acceptor.stop()?;
        }
        // acceptor thread is spawned last
        if let Some(thread) = self.threads.pop() {
            join(thread);
        }
        drop(acceptor);

        for handle in &self.handles {
            if let Err(e) = handle.stop() {
                error!("Failed to stop worker {}: {}", handle.id(), e);
            }
        }
        for thread in self.threads.drain(..) {
            join(thread);
        }

        for handle in &self.handles {
            debug!("Worker {} accepted {} connections", handle.id(), handle.accepted());
        }
        self.pools.log_stats();
        info!("Reactor on {} stopped", self.local_addr);
        Ok(())
    }
}

impl<H: ProtocolHandler> Drop for Reactor<H> {
    fn drop(&mut self) {
        if self.lifecycle == Lifecycle::Running {
            let _ = self.shutdown();
        }
    }
}

fn join(thread: JoinHandle<()>) {
    let name = thread.thread().name().unwrap_or("reactor").to_string();
    if thread.join().is_err() {
        error!("Thread {} panicked", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;

    /// Echoes every read back, re-arming only once the echo has flushed
    struct Echo;

    impl ProtocolHandler for Echo {
        type State = ();

        fn accepted(&self) -> Self::State {}

        fn handle_read(
            &self,
            session: &mut Session<()>,
            token: Token,
            data: &[u8],
        ) -> crate::Result<()> {
            let ctx = session.get_mut(token).ok_or(crate::Error::ConnectionClosed)?;
            assert!(!ctx.is_read_armed());
            ctx.write_buf.extend_from_slice(data);
            session.after_write(token, PostWrite::ReadSelf);
            Ok(())
        }

        fn on_connect_success(&self, _: &mut Session<()>, _: Token) -> crate::Result<()> {
            Ok(())
        }

        fn on_connect_fail(&self, _: &mut Session<()>, _: Token, _: io::Error) -> crate::Result<()> {
            Ok(())
        }
    }

    /// Connects every inbound connection to `target` and greets it once connected
    struct Announce {
        target: SocketAddr,
    }

    #[derive(Debug, PartialEq)]
    enum Leg {
        Inbound,
        Outbound,
    }

    impl ProtocolHandler for Announce {
        type State = Leg;

        fn accepted(&self) -> Leg {
            Leg::Inbound
        }

        fn handle_read(&self, session: &mut Session<Leg>, token: Token, _: &[u8]) -> crate::Result<()> {
            session.connect(token, self.target, Leg::Outbound)?;
            Ok(())
        }

        fn on_connect_success(&self, session: &mut Session<Leg>, token: Token) -> crate::Result<()> {
            let ctx = session.get_mut(token).ok_or(crate::Error::ConnectionClosed)?;
            assert_eq!(ctx.state, Leg::Outbound);
            ctx.write_buf.extend_from_slice(b"hello");
            Ok(())
        }

        fn on_connect_fail(&self, _: &mut Session<Leg>, _: Token, _: io::Error) -> crate::Result<()> {
            Ok(())
        }
    }

    fn small_config() -> ReactorConfig {
        ReactorConfig {
            workers: 2,
            read_buffer_size: 7,
            read_pool_size: 2,
            write_pool_size: 2,
            frame_pool_size: 1,
            ..ReactorConfig::default()
        }
    }

    #[test]
    fn test_lifecycle_order() {
        let mut reactor = Reactor::new("127.0.0.1:0".parse().unwrap(), &small_config(), Echo).unwrap();
        assert_ne!(reactor.local_addr().port(), 0);
        assert!(matches!(reactor.shutdown(), Err(ReactorError::State(_))));

        reactor.start().unwrap();
        assert!(reactor.is_running());
        assert!(matches!(reactor.start(), Err(ReactorError::State(_))));

        reactor.shutdown().unwrap();
        assert!(!reactor.is_running());
        assert!(matches!(reactor.shutdown(), Err(ReactorError::State(_))));
    }

    #[test]
    fn test_echo_across_workers_with_small_reads() {
        let mut reactor = Reactor::new("127.0.0.1:0".parse().unwrap(), &small_config(), Echo).unwrap();
        reactor.start().unwrap();

        // more clients than pooled buffers, payloads larger than one read
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut clients: Vec<std::net::TcpStream> = (0..5)
            .map(|_| std::net::TcpStream::connect(reactor.local_addr()).unwrap())
            .collect();

        for client in &mut clients {
            client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            client.write_all(&payload).unwrap();
        }
        for client in &mut clients {
            let mut echoed = vec![0u8; payload.len()];
            client.read_exact(&mut echoed).unwrap();
            assert_eq!(echoed, payload);
        }

        reactor.shutdown().unwrap();
        assert!(reactor.pools().read.stats().misses > 0);
    }

    #[test]
    fn test_shutdown_closes_connections() {
        let mut reactor = Reactor::new("127.0.0.1:0".parse().unwrap(), &small_config(), Echo).unwrap();
        reactor.start().unwrap();

        let mut client = std::net::TcpStream::connect(reactor.local_addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();

        reactor.shutdown().unwrap();
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_write_staged_on_connect_is_flushed() {
        let target = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let handler = Announce {
            target: target.local_addr().unwrap(),
        };
        let mut reactor = Reactor::new("127.0.0.1:0".parse().unwrap(), &small_config(), handler).unwrap();
        reactor.start().unwrap();

        let mut client = std::net::TcpStream::connect(reactor.local_addr()).unwrap();
        client.write_all(b"go").unwrap();

        let (mut outbound, _) = target.accept().unwrap();
        outbound.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut greeting = [0u8; 5];
        outbound.read_exact(&mut greeting).unwrap();
        assert_eq!(&greeting, b"hello");

        reactor.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_returns_promptly() {
        let mut reactor = Reactor::new("127.0.0.1:0".parse().unwrap(), &small_config(), Echo).unwrap();
        reactor.start().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let stopper = thread::spawn(move || {
            let _ = tx.send(reactor.shutdown().is_ok());
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
        stopper.join().unwrap();
    }
}
