//! Handler-facing view of a worker's connections
//!
//! A `Session` is everything a protocol handler may touch while it handles an
//! event: the contexts owned by the current worker, outbound connects on the
//! same worker, read re-arming, post-write continuations and closing.
//! Interest changes are collected and applied by the worker once the handler
//! returns.

use super::context::{CloseOutcome, ConnectionContext, PostWrite};
use super::pool::BufferPools;
use super::socket::{self, SocketOptions};
use super::ReactorError;
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Registry, Token};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Token reserved for the worker's waker
pub(crate) const WAKER: Token = Token(0);

pub struct Session<S> {
    worker_id: usize,
    registry: Registry,
    pools: Arc<BufferPools>,
    options: SocketOptions,
    contexts: HashMap<Token, ConnectionContext<S>>,
    next_token: usize,
    dirty: Vec<Token>,
    ready_callbacks: VecDeque<Token>,
}

impl<S> Session<S> {
    pub(crate) fn new(
        worker_id: usize,
        registry: Registry,
        pools: Arc<BufferPools>,
        options: SocketOptions,
    ) -> Self {
        Self {
            worker_id,
            registry,
            pools,
            options,
            contexts: HashMap::new(),
            next_token: WAKER.0 + 1,
            dirty: Vec::new(),
            ready_callbacks: VecDeque::new(),
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Number of live connections on this worker
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn contains(&self, token: Token) -> bool {
        self.contexts.contains_key(&token)
    }

    pub fn get(&self, token: Token) -> Option<&ConnectionContext<S>> {
        self.contexts.get(&token)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut ConnectionContext<S>> {
        let ctx = self.contexts.get_mut(&token)?;
        self.dirty.push(token);
        Some(ctx)
    }

    /// Borrow two distinct connections at once
    pub fn pair_mut(
        &mut self,
        a: Token,
        b: Token,
    ) -> Option<(&mut ConnectionContext<S>, &mut ConnectionContext<S>)> {
        if a == b {
            return None;
        }
        let [Some(first), Some(second)] = self.contexts.get_disjoint_mut([&a, &b]) else {
            return None;
        };
        self.dirty.push(a);
        self.dirty.push(b);
        Some((first, second))
    }

    /// Open an outbound connection paired with `origin`.
    ///
    /// The new connection lives on this worker; completion is reported
    /// through `ProtocolHandler::on_connect_success` or `on_connect_fail`.
    pub fn connect(
        &mut self,
        origin: Token,
        addr: SocketAddr,
        state: S,
    ) -> Result<Token, ReactorError> {
        if !self.contexts.contains_key(&origin) {
            return Err(ReactorError::UnknownConnection(origin));
        }
        let stream = socket::connect(addr, &self.options)
            .map_err(|source| ReactorError::Connect { addr, source })?;

        let token = self.insert(stream, state, true);
        if let Some(ctx) = self.contexts.get_mut(&token) {
            ctx.set_peer(origin);
        }
        if let Some(ctx) = self.contexts.get_mut(&origin) {
            ctx.set_peer(token);
        }
        debug!(
            "Worker {} connecting {:?} to {} for {:?}",
            self.worker_id, token, addr, origin
        );
        Ok(token)
    }

    /// Re-arm read interest
    pub fn arm_read(&mut self, token: Token) {
        if let Some(ctx) = self.contexts.get_mut(&token) {
            ctx.arm_read();
            self.dirty.push(token);
        }
    }

    /// Run `action` once the connection's staged write has flushed, or right
    /// away when nothing is staged.
    pub fn after_write(&mut self, token: Token, action: PostWrite) {
        let Some(ctx) = self.contexts.get_mut(&token) else {
            return;
        };
        if ctx.has_pending_write() {
            ctx.queue(action);
            self.dirty.push(token);
            return;
        }

        match action {
            PostWrite::Callback => self.ready_callbacks.push_back(token),
            PostWrite::ReadPeer => {
                if let Some(peer) = ctx.peer() {
                    self.arm_read(peer);
                }
            }
            PostWrite::ReadSelf => self.arm_read(token),
            PostWrite::CloseSelf => self.close(token),
        }
    }

    /// Close a connection and schedule its peer to close after the peer's
    /// pending write. Closing an unknown or already closed token does nothing.
    pub fn close(&mut self, token: Token) {
        let Some(mut ctx) = self.contexts.remove(&token) else {
            return;
        };
        let CloseOutcome::Closed { peer } = ctx.close(&self.registry, &self.pools) else {
            return;
        };
        debug!(
            "Worker {} closed {:?} ({})",
            self.worker_id,
            token,
            ctx.remote_addr()
                .map_or_else(|| "unconnected".to_string(), |a| a.to_string())
        );

        if let Some(peer) = peer {
            if let Some(peer_ctx) = self.contexts.get_mut(&peer) {
                peer_ctx.disarm_read();
                self.dirty.push(peer);
            }
            self.after_write(peer, PostWrite::CloseSelf);
        }
    }

    pub(crate) fn accept(&mut self, stream: TcpStream, state: S) -> io::Result<Token> {
        self.options.apply(&stream)?;
        let token = self.insert(stream, state, false);
        self.arm_read(token);
        Ok(token)
    }

    fn insert(&mut self, stream: TcpStream, state: S, connecting: bool) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        let ctx = ConnectionContext::new(token, stream, state, &self.pools, connecting);
        self.contexts.insert(token, ctx);
        self.dirty.push(token);
        token
    }

    pub(crate) fn context_mut(&mut self, token: Token) -> Option<&mut ConnectionContext<S>> {
        self.contexts.get_mut(&token)
    }

    pub(crate) fn mark_dirty(&mut self, token: Token) {
        self.dirty.push(token);
    }

    /// Detach the read buffer so the handler can borrow the session freely
    pub(crate) fn take_read_buf(&mut self, token: Token) -> Option<BytesMut> {
        self.contexts
            .get_mut(&token)
            .map(|ctx| std::mem::take(&mut ctx.read_buf))
    }

    /// Put a read buffer back as is, or return it to the pool if its owner
    /// is gone
    pub(crate) fn restore_read_buf(&mut self, token: Token, buf: BytesMut) {
        match self.contexts.get_mut(&token) {
            Some(ctx) => ctx.read_buf = buf,
            None => self.pools.read.return_back(buf),
        }
    }

    pub(crate) fn pop_ready_callback(&mut self) -> Option<Token> {
        self.ready_callbacks.pop_front()
    }

    /// Apply pending interest changes; returns connections whose
    /// registration failed.
    pub(crate) fn sync_interest(&mut self) -> Vec<(Token, io::Error)> {
        let mut failed = Vec::new();
        let mut dirty = std::mem::take(&mut self.dirty);
        dirty.sort_unstable();
        dirty.dedup();

        for token in dirty {
            if let Some(ctx) = self.contexts.get_mut(&token) {
                if let Err(e) = ctx.sync_interest(&self.registry) {
                    failed.push((token, e));
                }
            }
        }
        failed
    }

    pub(crate) fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Close every connection regardless of pending writes
    pub(crate) fn close_all(&mut self) {
        let tokens: Vec<Token> = self.contexts.keys().copied().collect();
        for token in tokens {
            if let Some(mut ctx) = self.contexts.remove(&token) {
                ctx.close(&self.registry, &self.pools);
                trace!("Worker {} force-closed {:?}", self.worker_id, token);
            }
        }
        self.dirty.clear();
        self.ready_callbacks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::pool::BufferPool;
    use mio::Poll;
    use std::io::Read;

    fn session(poll: &Poll) -> Session<&'static str> {
        let pools = BufferPools::new(
            BufferPool::new("read", 8, 64),
            BufferPool::new("write", 8, 70),
            BufferPool::new("frame", 8, 128),
        );
        Session::new(
            0,
            poll.registry().try_clone().unwrap(),
            Arc::new(pools),
            SocketOptions::default(),
        )
    }

    fn accepted_pair(
        session: &mut Session<&'static str>,
        listener: &std::net::TcpListener,
        state: &'static str,
    ) -> (Token, std::net::TcpStream) {
        let remote = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (local, _) = listener.accept().unwrap();
        local.set_nonblocking(true).unwrap();
        let token = session.accept(TcpStream::from_std(local), state).unwrap();
        (token, remote)
    }

    #[test]
    fn test_read_buf_keeps_length_between_reads() {
        let poll = Poll::new().unwrap();
        let mut session = session(&poll);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let (token, _remote) = accepted_pair(&mut session, &listener, "a");

        let mut buf = session.take_read_buf(token).unwrap();
        buf.resize(64, 0);
        session.restore_read_buf(token, buf);
        assert_eq!(session.take_read_buf(token).unwrap().len(), 64);

        // a buffer whose owner is gone goes back to the pool emptied
        let mut orphan = BytesMut::with_capacity(64);
        orphan.resize(64, 7);
        let available = session.pools.read.available();
        session.restore_read_buf(Token(999), orphan);
        assert_eq!(session.pools.read.available(), available + 1);
        assert!(session.pools.read.get().is_empty());
    }

    #[test]
    fn test_accept_arms_read() {
        let poll = Poll::new().unwrap();
        let mut session = session(&poll);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let (token, _remote) = accepted_pair(&mut session, &listener, "a");
        assert_ne!(token, WAKER);
        assert!(session.get(token).unwrap().is_read_armed());
        assert!(session.sync_interest().is_empty());
    }

    #[test]
    fn test_close_cascades_after_peer_write() {
        let poll = Poll::new().unwrap();
        let mut session = session(&poll);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let (a, _remote_a) = accepted_pair(&mut session, &listener, "a");
        let target = listener.local_addr().unwrap();
        let b = session.connect(a, target, "b").unwrap();
        assert_eq!(session.get(a).unwrap().peer(), Some(b));
        assert_eq!(session.get(b).unwrap().peer(), Some(a));

        session.get_mut(a).unwrap().write_buf.extend_from_slice(b"reply");
        session.close(b);

        // peer has a pending reply, so it only closes once that flushes
        let peer = session.get(a).unwrap();
        assert!(!peer.is_read_armed());
        assert!(peer.post_write().contains(PostWrite::CloseSelf));

        session.close(b);
        assert_eq!(session.len(), 1);
    }

    #[test]
    fn test_close_cascades_immediately_without_pending_write() {
        let poll = Poll::new().unwrap();
        let mut session = session(&poll);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let (a, mut remote_a) = accepted_pair(&mut session, &listener, "a");
        let b = session.connect(a, listener.local_addr().unwrap(), "b").unwrap();

        session.close(b);
        assert!(session.is_empty());

        let mut buf = [0u8; 4];
        assert_eq!(remote_a.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_after_write_runs_now_when_idle() {
        let poll = Poll::new().unwrap();
        let mut session = session(&poll);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let (a, _remote_a) = accepted_pair(&mut session, &listener, "a");
        let b = session.connect(a, listener.local_addr().unwrap(), "b").unwrap();

        session.get_mut(a).unwrap().disarm_read();
        session.after_write(b, PostWrite::ReadPeer);
        assert!(session.get(a).unwrap().is_read_armed());

        session.after_write(a, PostWrite::Callback);
        assert_eq!(session.pop_ready_callback(), Some(a));
        assert_eq!(session.pop_ready_callback(), None);
    }

    #[test]
    fn test_pair_mut_rejects_same_token() {
        let poll = Poll::new().unwrap();
        let mut session = session(&poll);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

        let (a, _remote_a) = accepted_pair(&mut session, &listener, "a");
        assert!(session.pair_mut(a, a).is_none());

        let b = session.connect(a, listener.local_addr().unwrap(), "b").unwrap();
        let (first, second) = session.pair_mut(a, b).unwrap();
        assert_eq!(first.state, "a");
        assert_eq!(second.state, "b");
    }
}
