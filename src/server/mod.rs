//! Server process protocol handler
//!
//! Every accepted socket is a tunnel client. After a valid auth frame the
//! server connects to the requested target on the same worker, replies with
//! the outbound socket's bound address and relays:
//!
//! ```text
//! tunnel client: AwaitingAuth -> Connecting -> Relaying
//! target:        Relaying
//! ```

use crate::config::{CryptoConfig, ServerConfig};
use crate::crypto::{CipherSuite, Md5TokenAuthenticator, TokenAuthenticator};
use crate::protocol::{AuthReply, AuthRequest, ConnectionType, ReplyCode};
use crate::proxy::Address;
use crate::reactor::{PostWrite, ProtocolHandler, Session, Token};
use crate::tunnel::FrameCodec;
use std::io;
use std::sync::Arc;
use tracing::{debug, info};

/// Tunnel client connection phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelPhase {
    AwaitingAuth,
    Connecting,
    Relaying,
}

/// Tunnel client connection state; owns the frame codec of the pair
pub struct TunnelState {
    pub phase: TunnelPhase,
    codec: FrameCodec,
}

/// Per-connection state of the server process
pub enum ServerState {
    TunnelClient(TunnelState),
    /// Outbound connection to the requested target
    Target,
}

pub struct ServerHandler {
    authenticator: Arc<dyn TokenAuthenticator>,
    suite: CipherSuite,
}

impl ServerHandler {
    pub fn new(authenticator: Arc<dyn TokenAuthenticator>, suite: CipherSuite) -> Self {
        Self {
            authenticator,
            suite,
        }
    }

    /// Build a handler with an MD5 authenticator holding the configured keys.
    ///
    /// The authenticator is returned too so keys can be managed at runtime.
    pub fn from_config(
        server: &ServerConfig,
        crypto: &CryptoConfig,
    ) -> crate::Result<(Self, Arc<dyn TokenAuthenticator>)> {
        let suite = CipherSuite::new(crypto.cipher_kind()?, &crypto.secret)?;
        let authenticator: Arc<dyn TokenAuthenticator> =
            Arc::new(Md5TokenAuthenticator::with_keys(&server.keys));
        Ok((Self::new(Arc::clone(&authenticator), suite), authenticator))
    }

    fn authenticate(
        &self,
        session: &mut Session<ServerState>,
        token: Token,
        data: &[u8],
    ) -> crate::Result<()> {
        let request = AuthRequest::parse(data, self.authenticator.token_len())?;
        let remote = session.get(token).and_then(|ctx| ctx.remote_addr());

        if !self.authenticator.verify(&request.token) {
            info!("Token authentication failed from {:?}", remote);
            return reply_and_close(session, token, ReplyCode::AuthFail);
        }
        if request.connection_type != ConnectionType::Tcp {
            info!("Connection type {:?} not supported", request.connection_type);
            return reply_and_close(session, token, ReplyCode::ConnectionTypeNotSupported);
        }

        let target = match request.address.resolve() {
            Ok(addr) => addr,
            Err(e) => {
                info!("Resolving {} failed: {}", request.address, e);
                return reply_and_close(session, token, ReplyCode::HostUnreachable);
            }
        };

        if let Err(e) = session.connect(token, target, ServerState::Target) {
            info!("Connect to target {} failed: {}", target, e);
            return reply_and_close(session, token, ReplyCode::HostUnreachable);
        }
        debug!("Tunnel from {:?} connecting to {}", remote, request.address);

        if let Some(ServerState::TunnelClient(state)) =
            session.get_mut(token).map(|ctx| &mut ctx.state)
        {
            state.phase = TunnelPhase::Connecting;
        }
        Ok(())
    }

    /// tunnel client -> target: reassemble and decrypt
    fn relay_to_target(
        &self,
        session: &mut Session<ServerState>,
        token: Token,
        data: &[u8],
    ) -> crate::Result<()> {
        let target = peer_of(session, token)?;
        let (client_ctx, target_ctx) = session
            .pair_mut(token, target)
            .ok_or(crate::Error::ConnectionClosed)?;
        let ServerState::TunnelClient(state) = &mut client_ctx.state else {
            return Err(crate::Error::ConnectionClosed);
        };

        state
            .codec
            .decrypt(&mut client_ctx.scratch, data, &mut target_ctx.write_buf)?;
        session.after_write(target, PostWrite::ReadPeer);
        Ok(())
    }

    /// target -> tunnel client: frame and encrypt
    fn relay_to_client(
        &self,
        session: &mut Session<ServerState>,
        token: Token,
        data: &[u8],
    ) -> crate::Result<()> {
        let client = peer_of(session, token)?;
        let client_ctx = session
            .get_mut(client)
            .ok_or(crate::Error::ConnectionClosed)?;
        let ServerState::TunnelClient(state) = &mut client_ctx.state else {
            return Err(crate::Error::ConnectionClosed);
        };

        state.codec.encrypt(data, &mut client_ctx.write_buf)?;
        session.after_write(client, PostWrite::ReadPeer);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Tunnel(TunnelPhase),
    Target,
}

impl ProtocolHandler for ServerHandler {
    type State = ServerState;

    fn accepted(&self) -> ServerState {
        let (encryptor, decryptor) = self.suite.server_ciphers();
        ServerState::TunnelClient(TunnelState {
            phase: TunnelPhase::AwaitingAuth,
            codec: FrameCodec::new(encryptor, decryptor),
        })
    }

    fn handle_read(
        &self,
        session: &mut Session<ServerState>,
        token: Token,
        data: &[u8],
    ) -> crate::Result<()> {
        let phase = match &session.get(token).ok_or(crate::Error::ConnectionClosed)?.state {
            ServerState::TunnelClient(state) => Phase::Tunnel(state.phase),
            ServerState::Target => Phase::Target,
        };

        match phase {
            Phase::Tunnel(TunnelPhase::AwaitingAuth) => self.authenticate(session, token, data),
            Phase::Tunnel(TunnelPhase::Relaying) => self.relay_to_target(session, token, data),
            Phase::Tunnel(TunnelPhase::Connecting) => Err(crate::Error::ConnectionClosed),
            Phase::Target => self.relay_to_client(session, token, data),
        }
    }

    fn on_connect_success(&self, session: &mut Session<ServerState>, token: Token) -> crate::Result<()> {
        let client = peer_of(session, token)?;
        let (target_ctx, client_ctx) = session
            .pair_mut(token, client)
            .ok_or(crate::Error::ConnectionClosed)?;
        let ServerState::TunnelClient(state) = &mut client_ctx.state else {
            return Err(crate::Error::ConnectionClosed);
        };

        let bound = Address::from(target_ctx.local_addr()?);
        debug!("Target {:?} connected, bound {}", target_ctx.remote_addr(), bound);
        AuthReply::success(bound).encode(&mut client_ctx.write_buf)?;
        state.phase = TunnelPhase::Relaying;

        session.after_write(client, PostWrite::Callback);
        Ok(())
    }

    fn on_connect_fail(
        &self,
        session: &mut Session<ServerState>,
        token: Token,
        error: io::Error,
    ) -> crate::Result<()> {
        info!("Connect to target failed: {}", error);
        let client = peer_of(session, token)?;
        stage_reply(session, client, ReplyCode::HostUnreachable)
    }

    /// Success reply flushed: start relaying both ways
    fn on_flushed(&self, session: &mut Session<ServerState>, token: Token) -> crate::Result<()> {
        let relaying = matches!(
            session.get(token).map(|ctx| &ctx.state),
            Some(ServerState::TunnelClient(TunnelState {
                phase: TunnelPhase::Relaying,
                ..
            }))
        );
        if relaying {
            let target = peer_of(session, token)?;
            session.arm_read(token);
            session.arm_read(target);
        }
        Ok(())
    }
}

fn peer_of(session: &Session<ServerState>, token: Token) -> crate::Result<Token> {
    session
        .get(token)
        .and_then(|ctx| ctx.peer())
        .ok_or(crate::Error::ConnectionClosed)
}

fn stage_reply(session: &mut Session<ServerState>, client: Token, code: ReplyCode) -> crate::Result<()> {
    if let Some(ctx) = session.get_mut(client) {
        AuthReply::failure(code).encode(&mut ctx.write_buf)?;
    }
    Ok(())
}

fn reply_and_close(session: &mut Session<ServerState>, token: Token, code: ReplyCode) -> crate::Result<()> {
    stage_reply(session, token, code)?;
    session.after_write(token, PostWrite::CloseSelf);
    Ok(())
}
