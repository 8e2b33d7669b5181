//! Client process protocol handler
//!
//! Every accepted socket is a local SOCKS5 client. A CONNECT request opens a
//! paired upstream connection to the tunnel server on the same worker:
//!
//! ```text
//! local:    AwaitingAuth -> AwaitingRequest -> Relaying
//! upstream: Connecting -> AwaitingAuthReply -> Relaying
//! ```
//!
//! Once both sides relay, local bytes are framed and encrypted towards the
//! server, upstream frames are decrypted towards the local peer.

use crate::config::{ClientConfig, CryptoConfig};
use crate::crypto::{CipherSuite, Md5TokenAuthenticator, TokenAuthenticator};
use crate::protocol::{AuthReply, AuthRequest, ReplyCode};
use crate::proxy::socks5::{self, AuthMethod, Command, Reply};
use crate::proxy::Address;
use crate::reactor::{PostWrite, ProtocolHandler, Session, Token};
use crate::tunnel::FrameCodec;
use std::io;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Local SOCKS5 connection phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    AwaitingAuth,
    AwaitingRequest,
    Relaying,
}

/// Upstream tunnel connection phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamPhase {
    Connecting,
    AwaitingAuthReply,
    Relaying,
}

/// Upstream tunnel connection state; owns the frame codec of the pair
pub struct UpstreamState {
    pub phase: UpstreamPhase,
    pub target: Address,
    codec: FrameCodec,
}

/// Per-connection state of the client process
pub enum ClientState {
    Local(LocalState),
    Upstream(UpstreamState),
}

pub struct ClientHandler {
    server: SocketAddr,
    token: Vec<u8>,
    suite: CipherSuite,
    local_dns_resolve: bool,
}

impl ClientHandler {
    pub fn new(
        server: SocketAddr,
        token: Vec<u8>,
        suite: CipherSuite,
        local_dns_resolve: bool,
    ) -> Self {
        Self {
            server,
            token,
            suite,
            local_dns_resolve,
        }
    }

    /// Build a handler using MD5 tokens
    pub fn from_config(client: &ClientConfig, crypto: &CryptoConfig) -> crate::Result<Self> {
        let suite = CipherSuite::new(crypto.cipher_kind()?, &crypto.secret)?;
        let token = Md5TokenAuthenticator::new().generate(&client.key);
        Ok(Self::new(
            client.server_addr()?,
            token,
            suite,
            client.local_dns_resolve,
        ))
    }

    fn socks_greeting(
        &self,
        session: &mut Session<ClientState>,
        token: Token,
        data: &[u8],
    ) -> crate::Result<()> {
        let method = socks5::select_method(data)?;
        let ctx = session.get_mut(token).ok_or(crate::Error::ConnectionClosed)?;
        ctx.write_buf.extend_from_slice(&socks5::method_reply(method));

        if method == AuthMethod::NoAcceptable {
            warn!("SOCKS client {:?} offered no acceptable method", ctx.remote_addr());
            session.after_write(token, PostWrite::CloseSelf);
        } else {
            ctx.state = ClientState::Local(LocalState::AwaitingRequest);
            session.after_write(token, PostWrite::ReadSelf);
        }
        Ok(())
    }

    fn socks_request(
        &self,
        session: &mut Session<ClientState>,
        token: Token,
        data: &[u8],
    ) -> crate::Result<()> {
        let request = socks5::parse_request(data)?;
        if request.command != Command::Connect {
            warn!("SOCKS command {:?} not supported", request.command);
            return reply_and_close(session, token, Reply::CommandNotSupported);
        }

        let target = if self.local_dns_resolve {
            request.address.resolve_domain()
        } else {
            request.address
        };
        debug!("CONNECT {} via {}", target, self.server);

        let (encryptor, decryptor) = self.suite.client_ciphers();
        let upstream = ClientState::Upstream(UpstreamState {
            phase: UpstreamPhase::Connecting,
            target,
            codec: FrameCodec::new(encryptor, decryptor),
        });
        if let Err(e) = session.connect(token, self.server, upstream) {
            warn!("Cannot reach tunnel server: {}", e);
            return reply_and_close(session, token, Reply::GeneralFailure);
        }
        Ok(())
    }

    fn tunnel_reply(
        &self,
        session: &mut Session<ClientState>,
        token: Token,
        data: &[u8],
    ) -> crate::Result<()> {
        let local = peer_of(session, token)?;
        let (reply, consumed) = match AuthReply::parse(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Malformed tunnel reply: {}", e);
                socks_reply(session, local, Reply::GeneralFailure, None);
                session.close(token);
                return Ok(());
            }
        };

        if reply.code != ReplyCode::Success {
            info!("Tunnel server refused connection: {:?}", reply.code);
            socks_reply(session, local, reply.code.to_socks(), None);
            session.close(token);
            return Ok(());
        }

        let (upstream_ctx, local_ctx) = session
            .pair_mut(token, local)
            .ok_or(crate::Error::ConnectionClosed)?;
        let ClientState::Upstream(upstream) = &mut upstream_ctx.state else {
            return Err(crate::Error::ConnectionClosed);
        };

        socks5::write_reply(&mut local_ctx.write_buf, Reply::Succeeded, reply.bound.as_ref());
        upstream.phase = UpstreamPhase::Relaying;
        local_ctx.state = ClientState::Local(LocalState::Relaying);
        debug!("Tunnel to {} established", upstream.target);

        // relay frames coalesced with the reply
        let rest = &data[consumed..];
        if !rest.is_empty() {
            upstream
                .codec
                .decrypt(&mut upstream_ctx.scratch, rest, &mut local_ctx.write_buf)?;
        }

        session.after_write(local, PostWrite::Callback);
        Ok(())
    }

    /// local -> upstream: frame and encrypt
    fn relay_outbound(
        &self,
        session: &mut Session<ClientState>,
        token: Token,
        data: &[u8],
    ) -> crate::Result<()> {
        let upstream = peer_of(session, token)?;
        let upstream_ctx = session
            .get_mut(upstream)
            .ok_or(crate::Error::ConnectionClosed)?;
        let ClientState::Upstream(state) = &mut upstream_ctx.state else {
            return Err(crate::Error::ConnectionClosed);
        };

        state.codec.encrypt(data, &mut upstream_ctx.write_buf)?;
        session.after_write(upstream, PostWrite::ReadPeer);
        Ok(())
    }

    /// upstream -> local: reassemble and decrypt
    fn relay_inbound(
        &self,
        session: &mut Session<ClientState>,
        token: Token,
        data: &[u8],
    ) -> crate::Result<()> {
        let local = peer_of(session, token)?;
        let (upstream_ctx, local_ctx) = session
            .pair_mut(token, local)
            .ok_or(crate::Error::ConnectionClosed)?;
        let ClientState::Upstream(state) = &mut upstream_ctx.state else {
            return Err(crate::Error::ConnectionClosed);
        };

        state
            .codec
            .decrypt(&mut upstream_ctx.scratch, data, &mut local_ctx.write_buf)?;
        session.after_write(local, PostWrite::ReadPeer);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Local(LocalState),
    Upstream(UpstreamPhase),
}

impl ProtocolHandler for ClientHandler {
    type State = ClientState;

    fn accepted(&self) -> ClientState {
        ClientState::Local(LocalState::AwaitingAuth)
    }

    fn handle_read(
        &self,
        session: &mut Session<ClientState>,
        token: Token,
        data: &[u8],
    ) -> crate::Result<()> {
        let phase = match &session.get(token).ok_or(crate::Error::ConnectionClosed)?.state {
            ClientState::Local(state) => Phase::Local(*state),
            ClientState::Upstream(upstream) => Phase::Upstream(upstream.phase),
        };

        match phase {
            Phase::Local(LocalState::AwaitingAuth) => self.socks_greeting(session, token, data),
            Phase::Local(LocalState::AwaitingRequest) => self.socks_request(session, token, data),
            Phase::Local(LocalState::Relaying) => self.relay_outbound(session, token, data),
            Phase::Upstream(UpstreamPhase::AwaitingAuthReply) => {
                self.tunnel_reply(session, token, data)
            }
            Phase::Upstream(UpstreamPhase::Relaying) => self.relay_inbound(session, token, data),
            Phase::Upstream(UpstreamPhase::Connecting) => Err(crate::Error::ConnectionClosed),
        }
    }

    fn on_connect_success(&self, session: &mut Session<ClientState>, token: Token) -> crate::Result<()> {
        let ctx = session.get_mut(token).ok_or(crate::Error::ConnectionClosed)?;
        let ClientState::Upstream(upstream) = &mut ctx.state else {
            return Err(crate::Error::ConnectionClosed);
        };

        AuthRequest::new(self.token.clone(), upstream.target.clone()).encode(&mut ctx.write_buf)?;
        upstream.phase = UpstreamPhase::AwaitingAuthReply;
        session.after_write(token, PostWrite::ReadSelf);
        Ok(())
    }

    fn on_connect_fail(
        &self,
        session: &mut Session<ClientState>,
        token: Token,
        error: io::Error,
    ) -> crate::Result<()> {
        warn!("Connect to tunnel server {} failed: {}", self.server, error);
        let local = peer_of(session, token)?;
        socks_reply(session, local, Reply::GeneralFailure, None);
        Ok(())
    }

    /// SOCKS success reply flushed: start relaying both ways
    fn on_flushed(&self, session: &mut Session<ClientState>, token: Token) -> crate::Result<()> {
        let relaying = matches!(
            session.get(token).map(|ctx| &ctx.state),
            Some(ClientState::Local(LocalState::Relaying))
        );
        if relaying {
            let upstream = peer_of(session, token)?;
            session.arm_read(token);
            session.arm_read(upstream);
        }
        Ok(())
    }
}

fn peer_of(session: &Session<ClientState>, token: Token) -> crate::Result<Token> {
    session
        .get(token)
        .and_then(|ctx| ctx.peer())
        .ok_or(crate::Error::ConnectionClosed)
}

/// Stage a SOCKS5 reply on the local connection
fn socks_reply(
    session: &mut Session<ClientState>,
    local: Token,
    reply: Reply,
    bound: Option<&Address>,
) {
    if let Some(ctx) = session.get_mut(local) {
        socks5::write_reply(&mut ctx.write_buf, reply, bound);
    }
}

fn reply_and_close(
    session: &mut Session<ClientState>,
    token: Token,
    reply: Reply,
) -> crate::Result<()> {
    socks_reply(session, token, reply, None);
    session.after_write(token, PostWrite::CloseSelf);
    Ok(())
}
