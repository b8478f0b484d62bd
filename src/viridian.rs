//! Connected viridian registry
//!
//! One record per live client session, indexed both by peer-ID (how the
//! tunnel addresses traffic) and by token identifier (how the metaserver
//! names users). The registry enforces the occupancy quotas, keeps a single
//! session per identifier by evicting the older one, and arms a one-shot
//! expiry task for every non-privileged subscription.

use crate::buffer::Buffer;
use crate::proto::Protocol;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("viridian quota exhausted")]
    QuotaExceeded,

    #[error("subscription already expired")]
    SubscriptionExpired,

    #[error("peer id {0} already registered")]
    PeerIdCollision(u16),

    #[error("session handle allocation failed: {0}")]
    Handle(#[from] io::Error),
}

/// What the protocol layer's handle factory allocates per session: the
/// peer-ID derived from the per-peer socket's local port, the cancellation
/// token tearing the session down, and the sender feeding it egress packets.
#[derive(Clone)]
pub struct SessionHandle {
    pub peer_id: u16,
    pub cancel: CancellationToken,
    pub input: mpsc::Sender<Buffer>,
}

struct Viridian {
    name: String,
    identifier: String,
    is_admin: bool,
    protocol: Protocol,
    cancel: CancellationToken,
    input: mpsc::Sender<Buffer>,
    expiry: Option<JoinHandle<()>>,
}

/// Registry snapshot of one session, for lookups and logs.
#[derive(Clone, Debug)]
pub struct ViridianInfo {
    pub name: String,
    pub identifier: String,
    pub is_admin: bool,
    pub peer_id: u16,
    pub protocol: Protocol,
}

#[derive(Default)]
struct Inner {
    by_peer: HashMap<u16, Viridian>,
    by_identifier: HashMap<String, u16>,
}

/// Both maps always agree: every entry appears in each, and the identifier
/// map points at the peer-ID the session is stored under.
pub struct ViridianDirectory {
    max_viridians: usize,
    max_admins: usize,
    inner: Mutex<Inner>,
}

impl ViridianDirectory {
    pub fn new(max_viridians: usize, max_admins: usize) -> Arc<Self> {
        Arc::new(Self { max_viridians, max_admins, inner: Mutex::new(Inner::default()) })
    }

    /// Register a new session.
    ///
    /// An existing session under the same identifier is evicted first, then
    /// the quotas apply: non-privileged viridians may occupy at most
    /// `max_viridians` slots of the total, privileged ones the remainder.
    /// The factory allocates the per-peer socket and reports the handle plus
    /// whatever session resources the caller keeps; a non-privileged session
    /// gets a detached expiry task firing `delete(peer_id, true)`.
    pub async fn add<F, Fut, R>(
        self: Arc<Self>,
        name: &str,
        identifier: &str,
        is_admin: bool,
        expiry: Option<Duration>,
        protocol: Protocol,
        factory: F,
    ) -> Result<(SessionHandle, R), RegistrationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = io::Result<(SessionHandle, R)>>,
    {
        let mut inner = self.inner.lock().await;

        if let Some(&old_peer) = inner.by_identifier.get(identifier) {
            info!("Evicting viridian {identifier} (peer {old_peer}) in favour of a new session");
            Self::remove_locked(&mut inner, old_peer);
        }

        let occupied = inner.by_peer.len();
        if !is_admin && occupied >= self.max_viridians {
            return Err(RegistrationError::QuotaExceeded);
        }
        if occupied >= self.max_viridians + self.max_admins {
            return Err(RegistrationError::QuotaExceeded);
        }

        let (handle, resources) = factory().await?;
        if inner.by_peer.contains_key(&handle.peer_id) {
            handle.cancel.cancel();
            return Err(RegistrationError::PeerIdCollision(handle.peer_id));
        }

        let expiry_task = expiry.map(|after| {
            let directory = Arc::clone(&self);
            let peer_id = handle.peer_id;
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                directory.delete(peer_id, true).await;
            })
        });

        inner.by_peer.insert(
            handle.peer_id,
            Viridian {
                name: name.to_string(),
                identifier: identifier.to_string(),
                is_admin,
                protocol,
                cancel: handle.cancel.clone(),
                input: handle.input.clone(),
                expiry: expiry_task,
            },
        );
        inner.by_identifier.insert(identifier.to_string(), handle.peer_id);

        info!(
            "Registered viridian {name} ({identifier}) as peer {} over {protocol}, {} sessions live",
            handle.peer_id,
            inner.by_peer.len()
        );
        Ok((handle, resources))
    }

    /// Look up a session, but only under the protocol it registered with.
    pub async fn get(&self, peer_id: u16, protocol: Protocol) -> Option<ViridianInfo> {
        let inner = self.inner.lock().await;
        inner.by_peer.get(&peer_id).filter(|v| v.protocol == protocol).map(|v| ViridianInfo {
            name: v.name.clone(),
            identifier: v.identifier.clone(),
            is_admin: v.is_admin,
            peer_id,
            protocol: v.protocol,
        })
    }

    /// Route an egress packet into the session's bounded channel. The packet
    /// comes back when the peer is unknown or its channel is saturated, so
    /// the caller can return it to the pool.
    pub async fn send_to(&self, peer_id: u16, packet: Buffer) -> Result<(), Buffer> {
        let inner = self.inner.lock().await;
        match inner.by_peer.get(&peer_id) {
            Some(viridian) => viridian.input.try_send(packet).map_err(|err| match err {
                TrySendError::Full(packet) | TrySendError::Closed(packet) => packet,
            }),
            None => Err(packet),
        }
    }

    /// Tear one session down: drop it from both maps, disarm the expiry
    /// task, cancel the session token.
    pub async fn delete(&self, peer_id: u16, timed_out: bool) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = Self::remove_locked(&mut inner, peer_id);
        if removed {
            if timed_out {
                warn!("Viridian peer {peer_id} removed: subscription ran out");
            } else {
                debug!("Viridian peer {peer_id} removed");
            }
        }
        removed
    }

    /// Tear every session down.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        let peers: Vec<u16> = inner.by_peer.keys().copied().collect();
        for peer_id in peers {
            Self::remove_locked(&mut inner, peer_id);
        }
        info!("Viridian directory cleared");
    }

    pub async fn count(&self) -> usize {
        self.inner.lock().await.by_peer.len()
    }

    fn remove_locked(inner: &mut Inner, peer_id: u16) -> bool {
        let Some(viridian) = inner.by_peer.remove(&peer_id) else {
            return false;
        };
        // The identifier may already point at a replacement session.
        if inner.by_identifier.get(&viridian.identifier) == Some(&peer_id) {
            inner.by_identifier.remove(&viridian.identifier);
        }
        if let Some(task) = viridian.expiry {
            task.abort();
        }
        viridian.cancel.cancel();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(peer_id: u16) -> (SessionHandle, mpsc::Receiver<Buffer>) {
        let (tx, rx) = mpsc::channel(2);
        (SessionHandle { peer_id, cancel: CancellationToken::new(), input: tx }, rx)
    }

    async fn register(
        directory: &Arc<ViridianDirectory>,
        identifier: &str,
        is_admin: bool,
        peer_id: u16,
    ) -> Result<(SessionHandle, mpsc::Receiver<Buffer>), RegistrationError> {
        directory
            .clone()
            .add(identifier, identifier, is_admin, None, Protocol::Port, || async move { Ok(handle(peer_id)) })
            .await
    }

    #[tokio::test]
    async fn test_quotas() {
        let directory = ViridianDirectory::new(2, 1);

        register(&directory, "u1", false, 10).await.unwrap();
        register(&directory, "u2", false, 11).await.unwrap();
        assert!(matches!(register(&directory, "u3", false, 12).await, Err(RegistrationError::QuotaExceeded)));

        // Privileged sessions may use the overflow slot, once.
        register(&directory, "a1", true, 13).await.unwrap();
        assert!(matches!(register(&directory, "a2", true, 14).await, Err(RegistrationError::QuotaExceeded)));
        assert_eq!(directory.count().await, 3);
    }

    #[tokio::test]
    async fn test_duplicate_identifier_evicts() {
        let directory = ViridianDirectory::new(1, 0);

        let (old, _old_rx) = register(&directory, "u1", false, 10).await.unwrap();
        let (new, _new_rx) = register(&directory, "u1", false, 11).await.unwrap();

        assert!(old.cancel.is_cancelled());
        assert!(!new.cancel.is_cancelled());
        assert!(directory.get(10, Protocol::Port).await.is_none());
        assert!(directory.get(11, Protocol::Port).await.is_some());

        // A late teardown of the evicted session must not unmap the new one.
        directory.delete(10, false).await;
        assert!(directory.get(11, Protocol::Port).await.is_some());
        assert_eq!(directory.count().await, 1);
    }

    #[tokio::test]
    async fn test_protocol_filter() {
        let directory = ViridianDirectory::new(4, 0);
        register(&directory, "u1", false, 10).await.unwrap();
        assert!(directory.get(10, Protocol::Port).await.is_some());
        assert!(directory.get(10, Protocol::Typhoon).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_expiry_fires() {
        let directory = ViridianDirectory::new(4, 0);
        let (session, _rx) = directory
            .clone()
            .add("u1", "u1", false, Some(Duration::from_millis(50)), Protocol::Port, || async move {
                Ok(handle(10))
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(directory.get(10, Protocol::Port).await.is_none());
        assert!(session.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_send_to_routes_and_backpressures() {
        let directory = ViridianDirectory::new(4, 0);
        let (_, mut rx) = register(&directory, "u1", false, 10).await.unwrap();

        directory.send_to(10, Buffer::from_slice(b"one")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().slice(), b"one");

        // Unknown peer hands the packet back.
        assert!(directory.send_to(99, Buffer::from_slice(b"x")).await.is_err());

        // Saturated channel hands the packet back.
        directory.send_to(10, Buffer::from_slice(b"a")).await.unwrap();
        directory.send_to(10, Buffer::from_slice(b"b")).await.unwrap();
        assert!(directory.send_to(10, Buffer::from_slice(b"c")).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_cancels_everything() {
        let directory = ViridianDirectory::new(4, 0);
        let (first, _rx1) = register(&directory, "u1", false, 10).await.unwrap();
        let (second, _rx2) = register(&directory, "u2", false, 11).await.unwrap();

        directory.clear().await;
        assert_eq!(directory.count().await, 0);
        assert!(first.cancel.is_cancelled());
        assert!(second.cancel.is_cancelled());
    }
}
