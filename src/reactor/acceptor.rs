//! Accept loop
//!
//! A single thread accepts inbound connections and hands them to workers in
//! round-robin order.

use super::worker::WorkerHandle;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// Back-off before retrying a listener that failed with a resource error
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

pub(crate) struct AcceptorHandle {
    waker: Waker,
    shutdown: Arc<AtomicBool>,
}

impl AcceptorHandle {
    pub(crate) fn stop(&self) -> io::Result<()> {
        self.shutdown.store(true, Ordering::Release);
        self.waker.wake()
    }
}

pub(crate) struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    workers: Vec<WorkerHandle>,
    next: usize,
    shutdown: Arc<AtomicBool>,
}

impl Acceptor {
    pub(crate) fn new(
        mut listener: TcpListener,
        workers: Vec<WorkerHandle>,
    ) -> io::Result<(Self, AcceptorHandle)> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = AcceptorHandle {
            waker,
            shutdown: Arc::clone(&shutdown),
        };
        let acceptor = Self {
            poll,
            listener,
            workers,
            next: 0,
            shutdown,
        };
        Ok((acceptor, handle))
    }

    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(128);
        match self.listener.local_addr() {
            Ok(addr) => info!("Accepting connections on {}", addr),
            Err(e) => warn!("Listener has no local address: {}", e),
        }

        // set while the accept queue may still hold connections
        let mut backlog = false;
        while !self.shutdown.load(Ordering::Acquire) {
            let timeout = backlog.then_some(ACCEPT_RETRY_DELAY);
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("Acceptor poll failed: {}", e);
                break;
            }

            if backlog || events.iter().any(|event| event.token() == LISTENER) {
                backlog = !self.accept_all();
            }
        }

        debug!("Acceptor stopped");
    }

    /// Drain the accept queue; readiness is edge-triggered
    ///
    /// Returns false when accepting stopped on a resource error such as
    /// EMFILE, leaving connections queued that no new edge will announce.
    fn accept_all(&mut self) -> bool {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let worker = &self.workers[self.next];
                    self.next = (self.next + 1) % self.workers.len();
                    trace!("Accepted {} for worker {}", addr, worker.id());
                    if let Err(e) = worker.dispatch(stream) {
                        warn!("Failed to wake worker {}: {}", worker.id(), e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if is_transient(&e) => {
                    debug!("Accept aborted by peer: {}", e);
                }
                Err(e) => {
                    warn!(
                        "Accept failed: {}; retrying in {:?}",
                        e, ACCEPT_RETRY_DELAY
                    );
                    return false;
                }
            }
        }
    }
}

/// Errors that concern one queued connection rather than the listener
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_accept_errors() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
        ] {
            assert!(is_transient(&io::Error::from(kind)));
        }

        // EMFILE and ENFILE stop the drain and schedule a retry
        assert!(!is_transient(&io::Error::from_raw_os_error(24)));
        assert!(!is_transient(&io::Error::from_raw_os_error(23)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
    }
}
