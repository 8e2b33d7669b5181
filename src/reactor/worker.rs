//! Worker event loop
//!
//! Each worker owns one `mio::Poll` and every connection registered with it.
//! Accepted sockets arrive through the worker's inbox and are registered on
//! the worker thread itself, so registration never races the poll call.

use super::context::PostWrite;
use super::pool::BufferPools;
use super::session::{Session, WAKER};
use super::socket::{self, ConnectProgress, SocketOptions};
use super::ProtocolHandler;
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

const EVENTS_CAPACITY: usize = 1024;

/// Shared side of a worker, used by the acceptor and the reactor
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    id: usize,
    inbox: Arc<Mutex<VecDeque<TcpStream>>>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    accepted: Arc<AtomicU64>,
}

impl WorkerHandle {
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Hand an accepted socket to the worker
    pub(crate) fn dispatch(&self, stream: TcpStream) -> io::Result<()> {
        self.inbox.lock().push_back(stream);
        self.waker.wake()
    }

    pub(crate) fn stop(&self) -> io::Result<()> {
        self.shutdown.store(true, Ordering::Release);
        self.waker.wake()
    }

    pub(crate) fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

pub(crate) struct Worker<H: ProtocolHandler> {
    id: usize,
    poll: Poll,
    handler: Arc<H>,
    pools: Arc<BufferPools>,
    session: Session<H::State>,
    inbox: Arc<Mutex<VecDeque<TcpStream>>>,
    shutdown: Arc<AtomicBool>,
    accepted: Arc<AtomicU64>,
}

impl<H: ProtocolHandler> Worker<H> {
    pub(crate) fn new(
        id: usize,
        handler: Arc<H>,
        pools: Arc<BufferPools>,
        options: SocketOptions,
    ) -> io::Result<(Self, WorkerHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let registry = poll.registry().try_clone()?;

        let handle = WorkerHandle {
            id,
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            accepted: Arc::new(AtomicU64::new(0)),
        };
        let worker = Self {
            id,
            poll,
            handler,
            pools: Arc::clone(&pools),
            session: Session::new(id, registry, pools, options),
            inbox: Arc::clone(&handle.inbox),
            shutdown: Arc::clone(&handle.shutdown),
            accepted: Arc::clone(&handle.accepted),
        };
        Ok((worker, handle))
    }

    /// Run until stopped, then force-close every owned connection
    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        debug!("Worker {} started", self.id);

        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("Worker {} poll failed: {}", self.id, e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => self.drain_inbox(),
                    token => self.dispatch(token, event),
                }
                self.settle();
            }
        }

        let remaining = self.session.len();
        self.session.close_all();
        self.inbox.lock().clear();
        info!(
            "Worker {} stopped: {} accepted, {} closed at shutdown",
            self.id,
            self.accepted.load(Ordering::Relaxed),
            remaining
        );
    }

    fn drain_inbox(&mut self) {
        let streams: Vec<TcpStream> = self.inbox.lock().drain(..).collect();
        for stream in streams {
            let state = self.handler.accepted();
            match self.session.accept(stream, state) {
                Ok(token) => {
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    trace!("Worker {} registered {:?}", self.id, token);
                }
                Err(e) => warn!("Worker {} failed to set up accepted socket: {}", self.id, e),
            }
        }
    }

    fn dispatch(&mut self, token: Token, event: &Event) {
        let Some(ctx) = self.session.get(token) else {
            trace!("Worker {} event for stale {:?}", self.id, token);
            return;
        };

        if ctx.is_connecting() {
            if event.is_writable() || event.is_error() || event.is_write_closed() {
                self.finish_connect(token);
            }
            return;
        }

        // flush before reading to bound buffered state
        if event.is_writable() || event.is_error() {
            self.handle_write(token);
        }
        if event.is_readable() || event.is_read_closed() {
            self.handle_read(token);
        }
    }

    fn handle_read(&mut self, token: Token) {
        match self.session.get(token) {
            Some(ctx) if ctx.is_read_armed() => {}
            _ => return,
        }
        let Some(mut buf) = self.session.take_read_buf(token) else {
            return;
        };
        // zero-filled once per buffer; the length is kept across reads
        let size = buf.capacity().max(self.pools.read.buffer_size());
        if buf.len() < size {
            buf.resize(size, 0);
        }

        let result = match self.session.context_mut(token) {
            Some(ctx) => loop {
                match ctx.stream_mut().read(&mut buf) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    other => break other,
                }
            },
            None => return,
        };

        match result {
            Ok(0) => {
                trace!("Worker {} {:?} reached end of stream", self.id, token);
                self.session.restore_read_buf(token, buf);
                self.session.close(token);
            }
            Ok(n) => {
                if let Some(ctx) = self.session.context_mut(token) {
                    ctx.disarm_read();
                }
                self.session.mark_dirty(token);
                trace!("Worker {} {:?} read {} bytes", self.id, token, n);

                let outcome = self.handler.handle_read(&mut self.session, token, &buf[..n]);
                self.session.restore_read_buf(token, buf);
                if let Err(e) = outcome {
                    debug!("Worker {} closing {:?}: {}", self.id, token, e);
                    self.session.close(token);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("Worker {} {:?} spurious read wakeup", self.id, token);
                self.session.restore_read_buf(token, buf);
            }
            Err(e) => {
                debug!("Worker {} read error on {:?}: {}", self.id, token, e);
                self.session.restore_read_buf(token, buf);
                self.session.close(token);
            }
        }
    }

    fn handle_write(&mut self, token: Token) {
        let Some(ctx) = self.session.context_mut(token) else {
            return;
        };
        if !ctx.has_pending_write() {
            return;
        }

        match ctx.flush() {
            Ok(true) => {}
            Ok(false) => {
                trace!(
                    "Worker {} {:?} short write, {} bytes left",
                    self.id,
                    token,
                    ctx.write_buf.len()
                );
                return;
            }
            Err(e) => {
                debug!("Worker {} write error on {:?}: {}", self.id, token, e);
                self.session.close(token);
                return;
            }
        }

        self.pools.write.refresh(&mut ctx.write_buf);
        let actions = ctx.take_post_write();
        self.session.mark_dirty(token);

        for action in actions {
            if !self.session.contains(token) {
                return;
            }
            match action {
                PostWrite::Callback => self.run_callback(token),
                // re-queued if the callback staged another write
                other => self.session.after_write(token, other),
            }
        }
    }

    fn finish_connect(&mut self, token: Token) {
        let Some(ctx) = self.session.context_mut(token) else {
            return;
        };

        match socket::finish_connect(ctx.stream()) {
            ConnectProgress::Pending => {}
            ConnectProgress::Connected => {
                ctx.set_connected();
                self.session.mark_dirty(token);
                trace!("Worker {} {:?} connected", self.id, token);

                if let Err(e) = self.handler.on_connect_success(&mut self.session, token) {
                    debug!("Worker {} closing {:?} after connect: {}", self.id, token, e);
                    self.session.close(token);
                }
            }
            ConnectProgress::Failed(err) => {
                debug!("Worker {} connect failed on {:?}: {}", self.id, token, err);
                if let Err(e) = self.handler.on_connect_fail(&mut self.session, token, err) {
                    debug!("Worker {} connect failure handler for {:?}: {}", self.id, token, e);
                }
                self.session.close(token);
            }
        }
    }

    fn run_callback(&mut self, token: Token) {
        if let Err(e) = self.handler.on_flushed(&mut self.session, token) {
            debug!("Worker {} closing {:?} after flush: {}", self.id, token, e);
            self.session.close(token);
        }
    }

    /// Run deferred callbacks and apply interest changes until quiescent
    fn settle(&mut self) {
        loop {
            while let Some(token) = self.session.pop_ready_callback() {
                if self.session.contains(token) {
                    self.run_callback(token);
                }
            }

            for (token, e) in self.session.sync_interest() {
                warn!("Worker {} failed to update interest for {:?}: {}", self.id, token, e);
                self.session.close(token);
            }

            if !self.session.has_dirty() {
                break;
            }
        }
    }
}
