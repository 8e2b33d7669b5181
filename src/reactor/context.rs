//! Per-connection state owned by a worker

use super::pool::BufferPools;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr};
use tracing::trace;

/// Continuation run once a connection's staged write has fully flushed.
///
/// Variant order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PostWrite {
    /// Invoke `ProtocolHandler::on_flushed`
    Callback,
    /// Re-arm read interest on the paired connection
    ReadPeer,
    /// Re-arm own read interest
    ReadSelf,
    /// Close this connection
    CloseSelf,
}

/// Deduplicated, ordered set of pending continuations
#[derive(Debug, Default)]
pub struct PostWriteQueue {
    pending: BTreeSet<PostWrite>,
}

impl PostWriteQueue {
    pub fn push(&mut self, action: PostWrite) {
        self.pending.insert(action);
    }

    pub fn contains(&self, action: PostWrite) -> bool {
        self.pending.contains(&action)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove and return every pending action in execution order
    pub fn take(&mut self) -> Vec<PostWrite> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }
}

/// Result of closing a context
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CloseOutcome {
    AlreadyClosed,
    Closed { peer: Option<Token> },
}

/// One socket plus its buffers and protocol state
pub struct ConnectionContext<S> {
    token: Token,
    stream: TcpStream,
    remote: Option<SocketAddr>,
    /// Role-specific protocol state
    pub state: S,
    /// Staged outbound bytes; writes coalesce here until flushed
    pub write_buf: BytesMut,
    /// Frame reassembly carry-over
    pub scratch: BytesMut,
    pub(crate) read_buf: BytesMut,
    peer: Option<Token>,
    post_write: PostWriteQueue,
    read_armed: bool,
    rearm: bool,
    /// Set once the write buffer drains; the writable edge is consumed
    drained: bool,
    connecting: bool,
    registered: Option<Interest>,
    closed: bool,
}

impl<S> ConnectionContext<S> {
    pub(crate) fn new(
        token: Token,
        stream: TcpStream,
        state: S,
        pools: &BufferPools,
        connecting: bool,
    ) -> Self {
        let remote = if connecting {
            None
        } else {
            stream.peer_addr().ok()
        };
        Self {
            token,
            stream,
            remote,
            state,
            write_buf: pools.write.get(),
            scratch: pools.frame.get(),
            read_buf: pools.read.get(),
            peer: None,
            post_write: PostWriteQueue::default(),
            read_armed: false,
            rearm: false,
            drained: false,
            connecting,
            registered: None,
            closed: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// The other end of this logical pipe, if paired
    pub fn peer(&self) -> Option<Token> {
        self.peer
    }

    /// Remote address, known once connected
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Local address the socket is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn is_read_armed(&self) -> bool {
        self.read_armed
    }

    /// Whether staged bytes are waiting to be flushed
    pub fn has_pending_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// Connect completion consumes the writable edge the socket was
    /// registered for, so the first staged write must re-register.
    pub(crate) fn set_connected(&mut self) {
        self.connecting = false;
        self.drained = true;
        self.remote = self.stream.peer_addr().ok();
    }

    pub(crate) fn set_peer(&mut self, peer: Token) {
        debug_assert!(self.peer.is_none(), "peer is set once");
        self.peer = Some(peer);
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub(crate) fn arm_read(&mut self) {
        self.read_armed = true;
        self.rearm = true;
    }

    pub(crate) fn disarm_read(&mut self) {
        self.read_armed = false;
    }

    pub(crate) fn queue(&mut self, action: PostWrite) {
        self.post_write.push(action);
    }

    /// Continuations waiting for the staged write to flush
    pub fn post_write(&self) -> &PostWriteQueue {
        &self.post_write
    }

    pub(crate) fn take_post_write(&mut self) -> Vec<PostWrite> {
        self.post_write.take()
    }

    /// Write staged bytes until drained or the socket would block.
    ///
    /// Returns `Ok(true)` once the buffer is empty; a short write leaves the
    /// tail staged and returns `Ok(false)`.
    pub(crate) fn flush(&mut self) -> io::Result<bool> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.drained = true;
        Ok(true)
    }

    fn desired_interest(&self) -> Option<Interest> {
        let read = self.read_armed.then_some(Interest::READABLE);
        let write = (self.connecting || !self.write_buf.is_empty()).then_some(Interest::WRITABLE);
        match (read, write) {
            (Some(r), Some(w)) => Some(r | w),
            (r, w) => r.or(w),
        }
    }

    /// Bring the poller registration in line with what the connection waits for.
    ///
    /// Readiness is edge-triggered. A re-armed read always re-registers so the
    /// poller reports data left unread by the last read, and bytes staged
    /// after a full flush re-register so a fresh writable edge is reported.
    pub(crate) fn sync_interest(&mut self, registry: &Registry) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        let desired = self.desired_interest();
        let rearm = std::mem::take(&mut self.rearm) && self.read_armed;
        let rewrite = std::mem::take(&mut self.drained) && !self.write_buf.is_empty();
        if desired == self.registered && !rearm && !rewrite {
            return Ok(());
        }

        match (self.registered, desired) {
            (None, Some(interest)) => registry.register(&mut self.stream, self.token, interest)?,
            (Some(_), Some(interest)) => {
                registry.reregister(&mut self.stream, self.token, interest)?
            }
            (Some(_), None) => registry.deregister(&mut self.stream)?,
            (None, None) => {}
        }
        trace!(
            "Connection {:?} interest {:?} -> {:?}",
            self.token,
            self.registered,
            desired
        );
        self.registered = desired;
        Ok(())
    }

    /// Release the socket and buffers. Only the first call has any effect.
    pub(crate) fn close(&mut self, registry: &Registry, pools: &BufferPools) -> CloseOutcome {
        if self.closed {
            return CloseOutcome::AlreadyClosed;
        }
        self.closed = true;
        self.read_armed = false;
        self.post_write.take();

        if self.registered.take().is_some() {
            let _ = registry.deregister(&mut self.stream);
        }
        if !self.connecting {
            let _ = self.stream.shutdown(Shutdown::Both);
        }

        pools.read.return_back(std::mem::take(&mut self.read_buf));
        pools.write.return_back(std::mem::take(&mut self.write_buf));
        pools.frame.return_back(std::mem::take(&mut self.scratch));

        CloseOutcome::Closed { peer: self.peer }
    }
}

impl<S> std::fmt::Debug for ConnectionContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("token", &self.token)
            .field("remote", &self.remote)
            .field("peer", &self.peer)
            .field("read_armed", &self.read_armed)
            .field("pending_write", &self.write_buf.len())
            .field("connecting", &self.connecting)
            .field("closed", &self.closed)
            .finish()
    }
}
