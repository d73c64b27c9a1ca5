//! In-process loopback transport.
//!
//! A hub that wires sidecar endpoints together in one process: friend
//! messages and complete filetransfer sessions (connect → pull → chunked
//! data → zero-length EOF → close) are delivered over per-endpoint dispatch
//! threads, mimicking the Carrier runtime's callback threading. Backs the
//! end-to-end tests and the binary's standalone development mode; a real
//! Carrier binding plugs in behind the same `Transport` trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Sender};

use super::{
    FileTransferInfo, FriendInfo, FtHandle, FtState, Transport, TransportError, TransportEvents,
};

/// Chunk ceiling for `ft_send`, standing in for the wire MAX_USER_DATA_LEN.
const LOOPBACK_CHUNK: usize = 1024;

enum Delivery {
    ConnectionStatus(bool),
    Ready,
    FriendAdded(FriendInfo),
    FriendConnection {
        peer: String,
        online: bool,
    },
    FriendMessage {
        peer: String,
        bytes: Vec<u8>,
        msg_id: String,
        ts: i64,
        offline: bool,
    },
    FriendRequest {
        peer: String,
        greeting: String,
    },
    FtConnect {
        peer: String,
        handle: FtHandle,
        info: FileTransferInfo,
    },
    FtState {
        handle: FtHandle,
        state: FtState,
    },
    FtPull {
        handle: FtHandle,
        fileid: String,
        offset: u64,
    },
    FtData {
        handle: FtHandle,
        fileid: String,
        bytes: Vec<u8>,
    },
    FtCancel {
        handle: FtHandle,
        fileid: String,
        status: i32,
        reason: String,
    },
}

struct PeerSlot {
    tx: Sender<Delivery>,
}

struct TransferLink {
    remote_peer: String,
    remote_handle: FtHandle,
    info: FileTransferInfo,
}

struct HubInner {
    peers: Mutex<HashMap<String, PeerSlot>>,
    transfers: Mutex<HashMap<u64, TransferLink>>,
    next_handle: AtomicU64,
}

/// Process-wide loopback hub. Cheap to clone.
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                peers: Mutex::new(HashMap::new()),
                transfers: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    /// Create an endpoint for `user_id`. Call `bind` to go online.
    pub fn endpoint(&self, user_id: &str, address: &str) -> Arc<LoopbackEndpoint> {
        Arc::new(LoopbackEndpoint {
            hub: self.inner.clone(),
            user_id: user_id.to_string(),
            address: address.to_string(),
        })
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer's view of the hub. Implements the outbound `Transport` verbs.
pub struct LoopbackEndpoint {
    hub: Arc<HubInner>,
    user_id: String,
    address: String,
}

impl LoopbackEndpoint {
    /// Register with the hub and start delivering callbacks to `events` on a
    /// dedicated dispatch thread. Every registered endpoint is mutually
    /// friended, matching a development hub where all peers know each other.
    pub fn bind(&self, events: Arc<dyn TransportEvents>) {
        let (tx, rx) = unbounded::<Delivery>();

        let thread_name = format!("loopback-{}", self.user_id);
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                while let Ok(delivery) = rx.recv() {
                    dispatch(&*events, delivery);
                }
            })
            .expect("spawn loopback dispatch thread");

        let mut introductions: Vec<(Sender<Delivery>, FriendInfo)> = Vec::new();
        {
            let mut peers = self.hub.peers.lock().unwrap();
            for (other_id, slot) in peers.iter() {
                introductions.push((slot.tx.clone(), friend_record(other_id)));
            }
            peers.insert(self.user_id.clone(), PeerSlot { tx: tx.clone() });
        }

        let _ = tx.send(Delivery::ConnectionStatus(true));
        let _ = tx.send(Delivery::Ready);

        for (other_tx, other_info) in introductions {
            // Both sides learn about each other and see each other online.
            let _ = other_tx.send(Delivery::FriendAdded(friend_record(&self.user_id)));
            let _ = other_tx.send(Delivery::FriendConnection {
                peer: self.user_id.clone(),
                online: true,
            });
            let _ = tx.send(Delivery::FriendConnection {
                peer: other_info.friendid.clone(),
                online: true,
            });
            let _ = tx.send(Delivery::FriendAdded(other_info));
        }
    }

    /// Leave the hub. Remaining peers see this endpoint go offline.
    pub fn unregister(&self) {
        let remaining: Vec<Sender<Delivery>> = {
            let mut peers = self.hub.peers.lock().unwrap();
            peers.remove(&self.user_id);
            peers.values().map(|slot| slot.tx.clone()).collect()
        };
        for tx in remaining {
            let _ = tx.send(Delivery::FriendConnection {
                peer: self.user_id.clone(),
                online: false,
            });
        }
    }

    /// Deliver a friend request to `peer` (test/dev helper).
    pub fn request_friend(&self, peer: &str, greeting: &str) -> Result<(), TransportError> {
        self.deliver(
            peer,
            Delivery::FriendRequest {
                peer: self.user_id.clone(),
                greeting: greeting.to_string(),
            },
        )
    }

    fn deliver(&self, peer: &str, delivery: Delivery) -> Result<(), TransportError> {
        let peers = self.hub.peers.lock().unwrap();
        let slot = peers
            .get(peer)
            .ok_or_else(|| TransportError::PeerUnreachable(peer.to_string()))?;
        slot.tx
            .send(delivery)
            .map_err(|_| TransportError::PeerUnreachable(peer.to_string()))
    }

    fn link(&self, handle: FtHandle) -> Result<(String, FtHandle, String), TransportError> {
        let transfers = self.hub.transfers.lock().unwrap();
        let link = transfers.get(&handle.0).ok_or(TransportError::BadHandle)?;
        Ok((
            link.remote_peer.clone(),
            link.remote_handle,
            link.info.fileid.clone(),
        ))
    }

    fn drop_link(&self, handle: FtHandle) -> Option<(String, FtHandle)> {
        let mut transfers = self.hub.transfers.lock().unwrap();
        let link = transfers.remove(&handle.0)?;
        transfers.remove(&link.remote_handle.0);
        Some((link.remote_peer, link.remote_handle))
    }
}

impl Transport for LoopbackEndpoint {
    fn send_friend_message(&self, peer: &str, bytes: &[u8]) -> Result<String, TransportError> {
        let msg_id = uuid::Uuid::new_v4().to_string();
        self.deliver(
            peer,
            Delivery::FriendMessage {
                peer: self.user_id.clone(),
                bytes: bytes.to_vec(),
                msg_id: msg_id.clone(),
                ts: chrono::Utc::now().timestamp(),
                offline: false,
            },
        )?;
        Ok(msg_id)
    }

    fn accept_friend(&self, _peer: &str) -> Result<(), TransportError> {
        // Hub peers are mutually friended on bind; accept is a no-op here.
        Ok(())
    }

    fn set_self_info(&self, _info: &FriendInfo) -> Result<(), TransportError> {
        Ok(())
    }

    fn self_user_id(&self) -> String {
        self.user_id.clone()
    }

    fn self_address(&self) -> String {
        self.address.clone()
    }

    fn friends(&self) -> Vec<FriendInfo> {
        let peers = self.hub.peers.lock().unwrap();
        peers
            .keys()
            .filter(|id| *id != &self.user_id)
            .map(|id| friend_record(id))
            .collect()
    }

    fn max_transfer_chunk(&self) -> usize {
        LOOPBACK_CHUNK
    }

    fn ft_fileid(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    fn ft_new(&self, peer: &str, info: &FileTransferInfo) -> Result<FtHandle, TransportError> {
        {
            let peers = self.hub.peers.lock().unwrap();
            if !peers.contains_key(peer) {
                return Err(TransportError::PeerUnreachable(peer.to_string()));
            }
        }

        let local = FtHandle(self.hub.next_handle.fetch_add(1, Ordering::Relaxed));
        let remote = FtHandle(self.hub.next_handle.fetch_add(1, Ordering::Relaxed));

        let mut transfers = self.hub.transfers.lock().unwrap();
        transfers.insert(
            local.0,
            TransferLink {
                remote_peer: peer.to_string(),
                remote_handle: remote,
                info: info.clone(),
            },
        );
        transfers.insert(
            remote.0,
            TransferLink {
                remote_peer: self.user_id.clone(),
                remote_handle: local,
                info: info.clone(),
            },
        );
        Ok(local)
    }

    fn ft_connect(&self, handle: FtHandle) -> Result<(), TransportError> {
        let (remote_peer, remote_handle, _fileid) = self.link(handle)?;
        let info = {
            let transfers = self.hub.transfers.lock().unwrap();
            transfers
                .get(&handle.0)
                .map(|l| l.info.clone())
                .ok_or(TransportError::BadHandle)?
        };
        // The connecting side sees itself enter `connecting`; the remote gets
        // the inbound connect callback and decides whether to accept.
        let _ = self.deliver(
            &self.user_id,
            Delivery::FtState {
                handle,
                state: FtState::Connecting,
            },
        );
        self.deliver(
            &remote_peer,
            Delivery::FtConnect {
                peer: self.user_id.clone(),
                handle: remote_handle,
                info,
            },
        )
    }

    fn ft_accept_connect(&self, handle: FtHandle) -> Result<(), TransportError> {
        let (remote_peer, remote_handle, _fileid) = self.link(handle)?;
        let _ = self.deliver(
            &self.user_id,
            Delivery::FtState {
                handle,
                state: FtState::Connected,
            },
        );
        self.deliver(
            &remote_peer,
            Delivery::FtState {
                handle: remote_handle,
                state: FtState::Connected,
            },
        )
    }

    fn ft_pull(&self, handle: FtHandle, fileid: &str, offset: u64) -> Result<(), TransportError> {
        let (remote_peer, remote_handle, _) = self.link(handle)?;
        self.deliver(
            &remote_peer,
            Delivery::FtPull {
                handle: remote_handle,
                fileid: fileid.to_string(),
                offset,
            },
        )
    }

    fn ft_send(&self, handle: FtHandle, fileid: &str, bytes: &[u8]) -> Result<usize, TransportError> {
        if bytes.len() > LOOPBACK_CHUNK {
            return Err(TransportError::SendFailed(-7));
        }
        let (remote_peer, remote_handle, _) = self.link(handle)?;
        self.deliver(
            &remote_peer,
            Delivery::FtData {
                handle: remote_handle,
                fileid: fileid.to_string(),
                bytes: bytes.to_vec(),
            },
        )?;
        Ok(bytes.len())
    }

    fn ft_cancel(&self, handle: FtHandle, fileid: &str, status: i32, reason: &str) {
        if let Some((remote_peer, remote_handle)) = self.drop_link(handle) {
            let _ = self.deliver(
                &remote_peer,
                Delivery::FtCancel {
                    handle: remote_handle,
                    fileid: fileid.to_string(),
                    status,
                    reason: reason.to_string(),
                },
            );
        }
    }

    fn ft_close(&self, handle: FtHandle) {
        if let Some((remote_peer, remote_handle)) = self.drop_link(handle) {
            let _ = self.deliver(
                &remote_peer,
                Delivery::FtState {
                    handle: remote_handle,
                    state: FtState::Closed,
                },
            );
        }
    }
}

fn friend_record(user_id: &str) -> FriendInfo {
    FriendInfo {
        friendid: user_id.to_string(),
        name: user_id.to_string(),
        status: 1,
        ..FriendInfo::default()
    }
}

fn dispatch(events: &dyn TransportEvents, delivery: Delivery) {
    match delivery {
        Delivery::ConnectionStatus(connected) => events.on_connection_status(connected),
        Delivery::Ready => events.on_ready(),
        Delivery::FriendAdded(info) => events.on_friend_added(&info),
        Delivery::FriendConnection { peer, online } => events.on_friend_connection(&peer, online),
        Delivery::FriendMessage {
            peer,
            bytes,
            msg_id,
            ts,
            offline,
        } => events.on_friend_message(&peer, &bytes, &msg_id, ts, offline),
        Delivery::FriendRequest { peer, greeting } => events.on_friend_request(&peer, &greeting),
        Delivery::FtConnect { peer, handle, info } => {
            events.on_filetransfer_connect(&peer, handle, &info)
        }
        Delivery::FtState { handle, state } => events.on_ft_state_changed(handle, state),
        Delivery::FtPull {
            handle,
            fileid,
            offset,
        } => events.on_ft_pull(handle, &fileid, offset),
        Delivery::FtData {
            handle,
            fileid,
            bytes,
        } => events.on_ft_data(handle, &fileid, &bytes),
        Delivery::FtCancel {
            handle,
            fileid,
            status,
            reason,
        } => events.on_ft_cancel(handle, &fileid, status, &reason),
    }
}
