//! PORT accept loop and init exchange
//!
//! Each accepted connection performs the asymmetric init: the client's
//! sealed header derives the session key, the double-sealed token
//! authenticates the user, and registration allocates a fresh per-peer TCP
//! listener on the external address whose ephemeral port becomes the
//! peer-ID. The server init reply goes back on the accepted socket; the data
//! stream is the single connection accepted on the per-peer listener.

use super::server::{run_port_session, PORT_INPUT_CAPACITY};
use crate::buffer::{Buffer, PacketPool};
use crate::config::{NodeConfig, PortConfig};
use crate::crypto::{Symmetric, SYMMETRIC_OVERHEAD};
use crate::proto::port::{build_server_init, parse_client_init, PortClientInit, PORT_CLIENT_INIT_WIRE};
use crate::proto::{Protocol, ProtocolError, ReturnCode};
use crate::token::{TokenError, ViridianToken};
use crate::tunnel::TunnelNetwork;
use crate::viridian::{RegistrationError, SessionHandle, ViridianDirectory};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct PortListener {
    config: Arc<NodeConfig>,
    directory: Arc<ViridianDirectory>,
    pool: Arc<PacketPool>,
    tunnel: mpsc::Sender<Buffer>,
    network: TunnelNetwork,
    external_ip: IpAddr,
}

impl PortListener {
    pub fn new(
        config: Arc<NodeConfig>,
        directory: Arc<ViridianDirectory>,
        pool: Arc<PacketPool>,
        tunnel: mpsc::Sender<Buffer>,
        network: TunnelNetwork,
        external_ip: IpAddr,
    ) -> Arc<Self> {
        Arc::new(Self { config, directory, pool, tunnel, network, external_ip })
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!("PORT listening on {addr}"),
            Err(err) => warn!("PORT listener address unavailable: {err}"),
        }

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let this = self.clone();
                    let token = cancel.clone();
                    tokio::spawn(this.handle_client(stream, peer, token));
                }
                Err(err) => {
                    warn!("PORT accept failed: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        debug!("PORT listener stopped");
    }

    async fn handle_client(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr, listener_token: CancellationToken) {
        debug!("PORT connection from {peer}");

        let deadline = self.config.port.timeout;
        let mut init_wire = [0u8; PORT_CLIENT_INIT_WIRE];
        if let Err(err) = timed_read(&mut stream, &mut init_wire, deadline).await {
            debug!("PORT init from {peer} aborted: {err}");
            return;
        }
        let (session_key, init) = match parse_client_init(&self.config.keys.private, Buffer::from_slice(&init_wire)) {
            Ok(parsed) => parsed,
            Err(err) => {
                // No session key was derived; there is nothing to seal a
                // reply with.
                warn!("PORT init from {peer} rejected: {err}");
                return;
            }
        };
        let cipher = Symmetric::new(&session_key);

        let session = match self.initialize(&mut stream, &cipher, init, &listener_token).await {
            Ok(session) => session,
            Err(err) => {
                warn!("PORT init from {peer} failed: {err}");
                self.reply_init(&mut stream, &cipher, err.return_code(), 0).await;
                return;
            }
        };
        let (handle, peer_listener, input) = session;
        let peer_id = handle.peer_id;
        info!("PORT viridian from {peer} registered as peer {peer_id}");

        self.reply_init(&mut stream, &cipher, ReturnCode::Success, peer_id).await;
        drop(stream);

        // The data channel is the one connection the client dials against
        // the per-peer listener.
        let accepted = tokio::select! {
            _ = handle.cancel.cancelled() => None,
            accepted = timeout(deadline, peer_listener.accept()) => match accepted {
                Ok(Ok((data_stream, _))) => Some(data_stream),
                _ => None,
            },
        };
        let Some(data_stream) = accepted else {
            debug!("PORT peer {peer_id} never opened its data connection");
            self.directory.delete(peer_id, false).await;
            return;
        };
        if let Err(err) = apply_keepalive(&data_stream, &self.config.port) {
            debug!("PORT peer {peer_id} keepalive setup failed: {err}");
        }

        run_port_session(
            self.config.clone(),
            self.pool.clone(),
            self.directory.clone(),
            data_stream,
            cipher,
            peer_id,
            input,
            self.tunnel.clone(),
            self.network,
            handle.cancel.clone(),
        )
        .await;

        // Keep the per-peer listener bound for the whole session so its
        // port, and with it the peer-ID, stays ours.
        drop(peer_listener);
    }

    /// Token read and validation, then directory registration.
    async fn initialize(
        &self,
        stream: &mut TcpStream,
        cipher: &Symmetric,
        init: PortClientInit,
        listener_token: &CancellationToken,
    ) -> Result<(SessionHandle, TcpListener, mpsc::Receiver<Buffer>), ProtocolError> {
        if init.client_version < self.config.major_version {
            return Err(ProtocolError::UnsupportedVersion {
                required: self.config.major_version,
                got: init.client_version,
            });
        }

        let deadline = self.config.port.timeout;
        let mut token_wire = vec![0u8; init.token_length as usize + SYMMETRIC_OVERHEAD];
        timed_read(stream, &mut token_wire, deadline).await?;

        let sealed = cipher
            .decrypt(Buffer::from_slice(&token_wire), None)
            .map_err(ProtocolError::TokenDecrypt)?;
        let token_plain = self
            .config
            .keys
            .server_cipher()
            .decrypt(sealed, None)
            .map_err(ProtocolError::TokenDecrypt)?;
        let token = ViridianToken::parse(token_plain.slice())?;

        let mut tail = vec![0u8; init.tail_length as usize];
        timed_read(stream, &mut tail, deadline).await?;

        let expiry = token.remaining_subscription().map_err(|err| match err {
            TokenError::SubscriptionExpired => ProtocolError::Registration(RegistrationError::SubscriptionExpired),
            other => ProtocolError::Token(other),
        })?;

        let external_ip = self.external_ip;
        let session_parent = listener_token.clone();
        let (handle, (peer_listener, input)) = self
            .directory
            .clone()
            .add(&token.name, &token.identifier, token.is_admin, expiry, Protocol::Port, move || async move {
                let peer_listener = TcpListener::bind((external_ip, 0)).await?;
                let peer_id = peer_listener.local_addr()?.port();
                let (input_tx, input_rx) = mpsc::channel(PORT_INPUT_CAPACITY);
                let handle = SessionHandle { peer_id, cancel: session_parent.child_token(), input: input_tx };
                Ok((handle, (peer_listener, input_rx)))
            })
            .await?;

        Ok((handle, peer_listener, input))
    }

    async fn reply_init(&self, stream: &mut TcpStream, cipher: &Symmetric, status: ReturnCode, peer_id: u16) {
        match build_server_init(cipher, status, peer_id, self.config.port.max_tail_length, &self.pool) {
            Ok(frame) => {
                let _ = timeout(self.config.port.timeout, stream.write_all(frame.slice())).await;
                self.pool.put(frame);
            }
            Err(err) => warn!("PORT init reply framing failed: {err}"),
        }
    }
}

async fn timed_read(stream: &mut TcpStream, into: &mut [u8], deadline: Duration) -> io::Result<()> {
    match timeout(deadline, stream.read_exact(into)).await {
        Ok(result) => result.map(|_| ()),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "init read deadline exceeded")),
    }
}

fn apply_keepalive(stream: &TcpStream, config: &PortConfig) -> io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(config.keepalive_idle)
        .with_interval(config.keepalive_interval)
        .with_retries(config.keepalive_count);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
