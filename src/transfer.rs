//! File-transfer session machine.
//!
//! One `TransferSession` per live transport handle, registered in a
//! process-wide `SessionMap` and taken out on any terminal state. The
//! sender blocks its caller on two condition gates (`connect_done`, then
//! `transfer_done`); the receiver assembles chunks into the media
//! directory and completes on the zero-length EOF frame. Timeouts are the
//! only defense against a wedged transport; there is no retry within a
//! session.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::codec::sanitize_filename;
use crate::dispatch::SendError;
use crate::transport::{FileTransferInfo, FtHandle, FtState, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connecting,
    Connected,
    Completed,
    Failed,
    Canceled,
    Closed,
}

impl SessionState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Failed
                | SessionState::Canceled
                | SessionState::Closed
        )
    }
}

/// Resolved wait budgets for the sender's two gates.
#[derive(Debug, Clone, Copy)]
pub struct TransferWaits {
    pub connect: Duration,
    pub transfer: Duration,
}

impl Default for TransferWaits {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(8000),
            transfer: Duration::from_millis(15000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub ok: bool,
    pub detail: String,
}

/// One-shot cross-thread handoff. The first signal wins; later signals are
/// ignored so a late transport callback cannot clobber the outcome.
pub struct Gate {
    slot: Mutex<Option<GateOutcome>>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    pub fn signal(&self, ok: bool, detail: &str) {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(GateOutcome {
                ok,
                detail: detail.to_string(),
            });
            self.cv.notify_all();
        }
    }

    /// Block until signaled or the deadline passes. None on timeout.
    pub fn wait(&self, timeout: Duration) -> Option<GateOutcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _res) = self.cv.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
        }
    }
}

/// Completed receiver transfer, ready to surface as an event.
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub peer: String,
    pub path: PathBuf,
    pub filename: String,
    pub media_type: String,
    pub size: u64,
}

pub enum DataOutcome {
    Progress,
    Completed(CompletedTransfer),
    WriteFailed(String),
}

pub struct TransferSession {
    pub role: Role,
    pub peer: String,
    pub fileid: String,
    pub filename: String,
    pub media_type: String,
    pub expected_size: u64,
    pub connect_done: Gate,
    pub transfer_done: Gate,
    source_path: Option<PathBuf>,
    target_path: Option<PathBuf>,
    transferred: AtomicU64,
    state: Mutex<SessionState>,
    target: Mutex<Option<File>>,
}

impl TransferSession {
    pub fn sender(
        peer: &str,
        fileid: &str,
        filename: &str,
        media_type: &str,
        source_path: &Path,
        expected_size: u64,
    ) -> Self {
        Self {
            role: Role::Sender,
            peer: peer.to_string(),
            fileid: fileid.to_string(),
            filename: filename.to_string(),
            media_type: media_type.to_string(),
            expected_size,
            connect_done: Gate::new(),
            transfer_done: Gate::new(),
            source_path: Some(source_path.to_path_buf()),
            target_path: None,
            transferred: AtomicU64::new(0),
            state: Mutex::new(SessionState::Created),
            target: Mutex::new(None),
        }
    }

    pub fn receiver(
        peer: &str,
        fileid: &str,
        filename: &str,
        media_type: &str,
        target_path: PathBuf,
        target: File,
        expected_size: u64,
    ) -> Self {
        Self {
            role: Role::Receiver,
            peer: peer.to_string(),
            fileid: fileid.to_string(),
            filename: filename.to_string(),
            media_type: media_type.to_string(),
            expected_size,
            connect_done: Gate::new(),
            transfer_done: Gate::new(),
            source_path: None,
            target_path: Some(target_path),
            transferred: AtomicU64::new(0),
            state: Mutex::new(SessionState::Created),
            target: Mutex::new(Some(target)),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Transition unless already terminal.
    fn advance(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap();
        if !state.is_terminal() {
            *state = next;
        }
    }

    /// Close any open file streams.
    fn close_streams(&self) {
        *self.target.lock().unwrap() = None;
    }

    /// Sender side: answer the transport's pull by streaming the source
    /// file from `offset` in transport-sized chunks, then the EOF frame.
    /// Runs on an ephemeral transport I/O thread.
    pub fn serve_pull(&self, transport: &dyn Transport, handle: FtHandle, offset: u64) {
        let path = match &self.source_path {
            Some(p) => p.clone(),
            None => {
                tracing::warn!("pull on a receiver session {}", handle);
                return;
            }
        };

        let chunk = transport.max_transfer_chunk().max(1);
        let mut remaining = self.expected_size.saturating_sub(offset);

        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("transfer source open failed: {}: {}", path.display(), e);
                transport.ft_cancel(handle, &self.fileid, -1, "send_chunk_failed");
                self.advance(SessionState::Canceled);
                self.transfer_done.signal(false, "send_chunk_failed");
                return;
            }
        };
        if offset > 0 {
            if let Err(e) = file.seek(SeekFrom::Start(offset)) {
                tracing::warn!("transfer source seek failed: {}", e);
                transport.ft_cancel(handle, &self.fileid, -1, "send_chunk_failed");
                self.advance(SessionState::Canceled);
                self.transfer_done.signal(false, "send_chunk_failed");
                return;
            }
        }

        let mut buf = vec![0u8; chunk];
        while remaining > 0 {
            let want = remaining.min(chunk as u64) as usize;
            let got = match file.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("transfer source read failed: {}", e);
                    transport.ft_cancel(handle, &self.fileid, -1, "send_chunk_failed");
                    self.advance(SessionState::Canceled);
                    self.transfer_done.signal(false, "send_chunk_failed");
                    return;
                }
            };
            match transport.ft_send(handle, &self.fileid, &buf[..got]) {
                Ok(sent) if sent == got => {
                    self.transferred.fetch_add(sent as u64, Ordering::Relaxed);
                    remaining -= sent as u64;
                }
                Ok(_) | Err(_) => {
                    transport.ft_cancel(handle, &self.fileid, -1, "send_chunk_failed");
                    self.advance(SessionState::Canceled);
                    self.transfer_done.signal(false, "send_chunk_failed");
                    return;
                }
            }
        }

        // Zero-length frame marks EOF on the wire.
        match transport.ft_send(handle, &self.fileid, &[]) {
            Ok(_) => {
                self.advance(SessionState::Completed);
                self.transfer_done.signal(true, "send_complete");
            }
            Err(e) => {
                tracing::warn!("transfer finish failed for {}: {}", self.peer, e);
                self.transfer_done.signal(false, "send_finish_failed");
            }
        }
    }

    /// Receiver side: append one data frame. The zero-length frame closes
    /// the target and completes the session; frames after EOF are ignored.
    pub fn accept_data(&self, bytes: &[u8]) -> DataOutcome {
        if bytes.is_empty() {
            self.close_streams();
            self.advance(SessionState::Completed);
            self.transfer_done.signal(true, "receive_complete");
            return DataOutcome::Completed(CompletedTransfer {
                peer: self.peer.clone(),
                path: self.target_path.clone().unwrap_or_default(),
                filename: self.filename.clone(),
                media_type: self.media_type.clone(),
                size: self.transferred(),
            });
        }

        let mut target = self.target.lock().unwrap();
        match target.as_mut() {
            Some(file) => {
                if let Err(e) = file.write_all(bytes) {
                    return DataOutcome::WriteFailed(e.to_string());
                }
                self.transferred.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                DataOutcome::Progress
            }
            None => {
                tracing::warn!("data frame after EOF from {}, ignored", self.peer);
                DataOutcome::Progress
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Session registry
// ---------------------------------------------------------------------------

/// Process-wide sessions keyed by transport handle. The map exclusively
/// owns sessions; callbacks borrow. At most one session per handle.
pub struct SessionMap {
    inner: Mutex<HashMap<FtHandle, Arc<TransferSession>>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, handle: FtHandle, session: Arc<TransferSession>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.insert(handle, session).is_some() {
            tracing::warn!("replaced live transfer session for {}", handle);
        }
    }

    pub fn get(&self, handle: FtHandle) -> Option<Arc<TransferSession>> {
        self.inner.lock().unwrap().get(&handle).cloned()
    }

    pub fn take(&self, handle: FtHandle) -> Option<Arc<TransferSession>> {
        self.inner.lock().unwrap().remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionMap {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Sender entry and callback drivers
// ---------------------------------------------------------------------------

/// Send one file over the transport's side channel. Blocks the caller on
/// the connect gate and then the transfer gate; these are the dispatcher's
/// only legitimate blocks.
pub fn send_file(
    transport: &dyn Transport,
    sessions: &SessionMap,
    peer: &str,
    source_path: &Path,
    filename: &str,
    media_type: &str,
    waits: TransferWaits,
) -> Result<(), SendError> {
    let size = std::fs::metadata(source_path)
        .map_err(|_| SendError::FileNotReadable(source_path.display().to_string()))?
        .len();

    let fileid = transport.ft_fileid();
    let info = FileTransferInfo {
        fileid: fileid.clone(),
        filename: filename.to_string(),
        media_type: media_type.to_string(),
        size,
    };

    let handle = transport
        .ft_new(peer, &info)
        .map_err(|e| SendError::FiletransferNotOk(e.to_string()))?;

    let session = Arc::new(TransferSession::sender(
        peer,
        &fileid,
        filename,
        media_type,
        source_path,
        size,
    ));
    sessions.register(handle, session.clone());

    if let Err(e) = transport.ft_connect(handle) {
        sessions.take(handle);
        transport.ft_close(handle);
        return Err(SendError::FiletransferNotOk(e.to_string()));
    }

    match session.connect_done.wait(waits.connect) {
        // On timeout the session stays registered; the transport's cancel
        // or state callback reaps it later.
        None => return Err(SendError::FiletransferConnectTimeout),
        Some(outcome) if !outcome.ok => {
            sessions.take(handle);
            transport.ft_close(handle);
            return Err(SendError::FiletransferNotOk(outcome.detail));
        }
        Some(_) => {}
    }

    match session.transfer_done.wait(waits.transfer) {
        None => Err(SendError::FiletransferSendTimeout),
        Some(outcome) => {
            sessions.take(handle);
            transport.ft_close(handle);
            if outcome.ok {
                tracing::info!(
                    "transfer to {} complete: {} ({} bytes)",
                    peer,
                    filename,
                    session.transferred()
                );
                Ok(())
            } else {
                Err(SendError::FiletransferNotOk(outcome.detail))
            }
        }
    }
}

/// Receiver side: allocate a session for an inbound transfer connect and
/// accept it. The target lands in the media directory under a
/// timestamp-prefixed sanitized name.
pub fn accept_incoming(
    transport: &dyn Transport,
    sessions: &SessionMap,
    media_dir: &Path,
    peer: &str,
    handle: FtHandle,
    info: &FileTransferInfo,
) -> anyhow::Result<Arc<TransferSession>> {
    let name = sanitize_filename(&info.filename);
    std::fs::create_dir_all(media_dir)
        .with_context(|| format!("creating media dir {}", media_dir.display()))?;
    let target_path = media_dir.join(format!("{}_{}", chrono::Utc::now().timestamp(), name));
    let target = File::create(&target_path)
        .with_context(|| format!("creating transfer target {}", target_path.display()))?;

    let session = Arc::new(TransferSession::receiver(
        peer,
        &info.fileid,
        &name,
        &info.media_type,
        target_path,
        target,
        info.size,
    ));
    sessions.register(handle, session.clone());

    transport
        .ft_accept_connect(handle)
        .context("accepting inbound transfer connect")?;
    Ok(session)
}

/// Translate a transport state code into session transitions. Terminal
/// states always take the session out of the map, close both streams, and
/// close the transport handle.
pub fn on_state_changed(
    transport: &dyn Transport,
    sessions: &SessionMap,
    handle: FtHandle,
    state: FtState,
) {
    let session = match sessions.get(handle) {
        Some(s) => s,
        None => return,
    };

    match state {
        FtState::Connecting => session.advance(SessionState::Connecting),
        FtState::Connected => {
            session.advance(SessionState::Connected);
            if session.role == Role::Receiver {
                if let Err(e) = transport.ft_pull(handle, &session.fileid, 0) {
                    tracing::warn!("pull request failed for {}: {}", handle, e);
                }
            }
            session.connect_done.signal(true, "connected");
        }
        FtState::Closed | FtState::Failed => {
            sessions.take(handle);
            session.close_streams();
            transport.ft_close(handle);
            let detail = if state == FtState::Failed {
                session.advance(SessionState::Failed);
                "failed"
            } else {
                session.advance(SessionState::Closed);
                "closed"
            };
            session.connect_done.signal(false, detail);
            session.transfer_done.signal(false, detail);
        }
    }
}

/// Peer-initiated cancel. Always surfaced as failure to a waiting sender.
pub fn on_cancel(
    transport: &dyn Transport,
    sessions: &SessionMap,
    handle: FtHandle,
    status: i32,
    reason: &str,
) {
    if let Some(session) = sessions.take(handle) {
        tracing::warn!(
            "transfer {} canceled by peer {} (status {}): {}",
            handle,
            session.peer,
            status,
            reason
        );
        session.advance(SessionState::Canceled);
        session.close_streams();
        let detail = format!("canceled:{}", reason);
        session.connect_done.signal(false, &detail);
        session.transfer_done.signal(false, &detail);
        transport.ft_close(handle);
    }
}
