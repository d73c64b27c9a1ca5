//! Transport seam for the Carrier runtime.
//!
//! The sidecar never touches Carrier directly: outbound verbs go through the
//! `Transport` trait, inbound callbacks arrive through `TransportEvents`.
//! A single transport delivers its friend callbacks serially on its own loop
//! thread; filetransfer callbacks may arrive on ephemeral I/O threads.

pub mod loopback;

use thiserror::Error;

/// Stable identity of a filetransfer handle. Unique per live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FtHandle(pub u64);

impl std::fmt::Display for FtHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ft#{}", self.0)
    }
}

/// Friend record as the transport reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FriendInfo {
    pub friendid: String,
    pub name: String,
    pub gender: String,
    pub phone: String,
    pub email: String,
    pub description: String,
    pub region: String,
    pub label: String,
    /// 0 = offline, 1 = online.
    pub status: u8,
    pub presence: i32,
}

/// Metadata exchanged when opening a filetransfer session.
#[derive(Debug, Clone, Default)]
pub struct FileTransferInfo {
    pub fileid: String,
    pub filename: String,
    pub media_type: String,
    pub size: u64,
}

/// Filetransfer connection states as the transport reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtState {
    Connecting,
    Connected,
    Closed,
    Failed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),
    #[error("transport not ready")]
    NotReady,
    #[error("send failed (errno {0})")]
    SendFailed(i32),
    #[error("unknown transfer handle")]
    BadHandle,
}

impl TransportError {
    /// Transport-level error code, for logs and the fallback decision.
    pub fn errno(&self) -> i32 {
        match self {
            TransportError::PeerUnreachable(_) => 1,
            TransportError::NotReady => 2,
            TransportError::SendFailed(code) => *code,
            TransportError::BadHandle => 3,
        }
    }
}

/// Outbound verbs the core calls on the Carrier node.
pub trait Transport: Send + Sync {
    /// Send one friend message. Returns the transport message id.
    fn send_friend_message(&self, peer: &str, bytes: &[u8]) -> Result<String, TransportError>;

    fn accept_friend(&self, peer: &str) -> Result<(), TransportError>;

    fn set_self_info(&self, info: &FriendInfo) -> Result<(), TransportError>;

    fn self_user_id(&self) -> String;

    fn self_address(&self) -> String;

    /// Snapshot of the transport's current friend list.
    fn friends(&self) -> Vec<FriendInfo>;

    /// Largest chunk `ft_send` accepts in one call (MAX_USER_DATA_LEN).
    fn max_transfer_chunk(&self) -> usize;

    /// Allocate a fileid for a new outbound transfer.
    fn ft_fileid(&self) -> String;

    fn ft_new(&self, peer: &str, info: &FileTransferInfo) -> Result<FtHandle, TransportError>;

    fn ft_connect(&self, handle: FtHandle) -> Result<(), TransportError>;

    fn ft_accept_connect(&self, handle: FtHandle) -> Result<(), TransportError>;

    fn ft_pull(&self, handle: FtHandle, fileid: &str, offset: u64) -> Result<(), TransportError>;

    fn ft_send(&self, handle: FtHandle, fileid: &str, bytes: &[u8]) -> Result<usize, TransportError>;

    fn ft_cancel(&self, handle: FtHandle, fileid: &str, status: i32, reason: &str);

    fn ft_close(&self, handle: FtHandle);
}

/// Inbound callbacks the core consumes. Implemented by the sidecar runtime.
///
/// Friend callbacks for one transport arrive serially; implementations must
/// not block the transport loop thread. Filetransfer callbacks run on
/// ephemeral I/O threads and may block on file I/O.
pub trait TransportEvents: Send + Sync {
    fn on_connection_status(&self, connected: bool);
    fn on_ready(&self);
    fn on_friend_connection(&self, peer: &str, online: bool);
    fn on_friend_info(&self, peer: &str, info: &FriendInfo);
    fn on_friend_added(&self, info: &FriendInfo);
    fn on_friend_presence(&self, peer: &str, presence: i32);
    fn on_friend_message(&self, peer: &str, bytes: &[u8], msg_id: &str, ts: i64, offline: bool);
    fn on_friend_request(&self, peer: &str, greeting: &str);
    fn on_friend_invite(&self, peer: &str, data: &[u8]);
    fn on_friend_list(&self, info: &FriendInfo);
    fn on_filetransfer_connect(&self, peer: &str, handle: FtHandle, info: &FileTransferInfo);
    fn on_ft_state_changed(&self, handle: FtHandle, state: FtState);
    fn on_ft_pull(&self, handle: FtHandle, fileid: &str, offset: u64);
    fn on_ft_data(&self, handle: FtHandle, fileid: &str, bytes: &[u8]);
    fn on_ft_cancel(&self, handle: FtHandle, fileid: &str, status: i32, reason: &str);
}
