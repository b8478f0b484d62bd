//! TYPHOON receive loop and init handling
//!
//! One UDP socket accepts init datagrams from the world. A source with a
//! live session is ignored here — its traffic flows over the per-peer socket
//! dialed back at it during init, whose ephemeral local port doubles as the
//! peer-ID. Failed inits answer with an error init after the advertised
//! interval, except when no session key could be derived, in which case the
//! datagram is dropped without a trace.

use super::server::{run_typhoon_session, Consistency, TYPHOON_INPUT_CAPACITY};
use crate::buffer::{Buffer, PacketPool};
use crate::config::NodeConfig;
use crate::crypto::Symmetric;
use crate::proto::typhoon::{build_server_init, parse_client_init, TyphoonClientInit};
use crate::proto::{Protocol, ProtocolError, ReturnCode};
use crate::token::{TokenError, ViridianToken};
use crate::tunnel::TunnelNetwork;
use crate::viridian::{RegistrationError, SessionHandle, ViridianDirectory};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct TyphoonListener {
    config: Arc<NodeConfig>,
    directory: Arc<ViridianDirectory>,
    pool: Arc<PacketPool>,
    tunnel: mpsc::Sender<Buffer>,
    network: TunnelNetwork,
    external_ip: IpAddr,
    /// Sources with an init or session in flight; entries die with their
    /// session token.
    sessions: Mutex<HashMap<SocketAddr, CancellationToken>>,
}

impl TyphoonListener {
    pub fn new(
        config: Arc<NodeConfig>,
        directory: Arc<ViridianDirectory>,
        pool: Arc<PacketPool>,
        tunnel: mpsc::Sender<Buffer>,
        network: TunnelNetwork,
        external_ip: IpAddr,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            directory,
            pool,
            tunnel,
            network,
            external_ip,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(self: Arc<Self>, socket: UdpSocket, cancel: CancellationToken) {
        let socket = Arc::new(socket);
        match socket.local_addr() {
            Ok(addr) => info!("TYPHOON listening on {addr}"),
            Err(err) => warn!("TYPHOON listener address unavailable: {err}"),
        }

        loop {
            let mut datagram = self.pool.get_full();
            let received = tokio::select! {
                _ = cancel.cancelled() => { self.pool.put(datagram); break }
                received = socket.recv_from(datagram.slice_mut()) => received,
            };
            let (length, source) = match received {
                Ok(received) => received,
                Err(err) => {
                    warn!("TYPHOON receive failed: {err}");
                    self.pool.put(datagram);
                    continue;
                }
            };
            let datagram = datagram.rebuffer(0, length);

            {
                let mut sessions = self.sessions.lock().await;
                sessions.retain(|_, token| !token.is_cancelled());
                if sessions.contains_key(&source) {
                    // Already mid-init or established; the per-peer socket
                    // owns this conversation.
                    self.pool.put(datagram);
                    continue;
                }
            }

            match parse_client_init(&self.config.keys.private, datagram) {
                Ok((session_key, init, token)) => {
                    let session_token = cancel.child_token();
                    self.sessions.lock().await.insert(source, session_token.clone());
                    let this = self.clone();
                    let listener_socket = socket.clone();
                    tokio::spawn(this.handle_init(listener_socket, source, session_key, init, token, session_token));
                }
                Err(err) => {
                    // No session key, no reply: stay indistinguishable from
                    // a closed port.
                    debug!("TYPHOON datagram from {source} ignored: {err}");
                }
            }
        }
        debug!("TYPHOON listener stopped");
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_init(
        self: Arc<Self>,
        listener_socket: Arc<UdpSocket>,
        source: SocketAddr,
        session_key: crate::crypto::SymmetricKey,
        init: TyphoonClientInit,
        token: Buffer,
        session_token: CancellationToken,
    ) {
        let cipher = Symmetric::new(&session_key);

        match self.initialize(source, init, token, &session_token).await {
            Ok((handle, socket, input)) => {
                let peer_id = handle.peer_id;
                info!("TYPHOON viridian from {source} registered as peer {peer_id}");
                run_typhoon_session(
                    self.config.clone(),
                    self.pool.clone(),
                    self.directory.clone(),
                    socket,
                    cipher,
                    peer_id,
                    Consistency { pkt_no: init.pkt_no, next_in: init.next_in },
                    input,
                    self.tunnel.clone(),
                    self.network,
                    handle.cancel.clone(),
                )
                .await;
            }
            Err(err) => {
                session_token.cancel();
                let code = err.return_code();
                if code == ReturnCode::UnknownError {
                    debug!("TYPHOON init from {source} dropped silently: {err}");
                    return;
                }
                warn!("TYPHOON init from {source} failed: {err}");

                // The error reply is held back the advertised interval, so
                // rejects are as unhurried as accepts.
                sleep(Duration::from_millis(init.next_in as u64)).await;
                match build_server_init(&cipher, init.pkt_no, code, 0, init.next_in, self.config.typhoon.max_tail_length, &self.pool) {
                    Ok(frame) => {
                        let _ = listener_socket.send_to(frame.slice(), source).await;
                        self.pool.put(frame);
                    }
                    Err(err) => warn!("TYPHOON error reply framing failed: {err}"),
                }
            }
        }
    }

    async fn initialize(
        &self,
        source: SocketAddr,
        init: TyphoonClientInit,
        token: Buffer,
        session_token: &CancellationToken,
    ) -> Result<(SessionHandle, Arc<UdpSocket>, mpsc::Receiver<Buffer>), ProtocolError> {
        if init.client_version < self.config.major_version {
            return Err(ProtocolError::UnsupportedVersion {
                required: self.config.major_version,
                got: init.client_version,
            });
        }
        let typhoon = &self.config.typhoon;
        if !(typhoon.min_next_in..=typhoon.max_next_in).contains(&init.next_in) {
            return Err(ProtocolError::NextInOutOfRange(init.next_in));
        }

        let token_plain = self
            .config
            .keys
            .server_cipher()
            .decrypt(token, None)
            .map_err(ProtocolError::TokenDecrypt)?;
        let token = ViridianToken::parse(token_plain.slice())?;

        let expiry = token.remaining_subscription().map_err(|err| match err {
            TokenError::SubscriptionExpired => ProtocolError::Registration(RegistrationError::SubscriptionExpired),
            other => ProtocolError::Token(other),
        })?;

        let external_ip = self.external_ip;
        let session_token = session_token.clone();
        let (handle, (socket, input)) = self
            .directory
            .clone()
            .add(&token.name, &token.identifier, token.is_admin, expiry, Protocol::Typhoon, move || async move {
                let socket = UdpSocket::bind((external_ip, 0)).await?;
                socket.connect(source).await?;
                let peer_id = socket.local_addr()?.port();
                let (input_tx, input_rx) = mpsc::channel(TYPHOON_INPUT_CAPACITY);
                let handle = SessionHandle { peer_id, cancel: session_token, input: input_tx };
                Ok((handle, (Arc::new(socket), input_rx)))
            })
            .await?;

        Ok((handle, socket, input))
    }
}
