//! Sidecar runtime: owns the core components, implements the transport
//! callback surface, and exposes the operations the HTTP transport calls.
//!
//! Construction order matters: persistence first, then the trackers, then
//! the dispatcher. The transport is bound to the runtime by the caller
//! (`endpoint.bind(sidecar)` for the loopback hub) once `start` returns.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::config::SidecarConfig;
use crate::dispatch::{Dispatcher, MediaRequest, SendError, StatusRequest};
use crate::events::{EventQueue, IncomingMessage, StatusCounters, StatusSnapshot};
use crate::geo::GeoProbe;
use crate::prefs::PeerPrefs;
use crate::presence::FriendRegistry;
use crate::relay::RelayClient;
use crate::router::InboundRouter;
use crate::state::db::{DbConfig, FriendDb};
use crate::state::profile::{profile_path, SelfProfile};
use crate::state::welcomed::WelcomedPeers;
use crate::transfer::{self, DataOutcome, Role, SessionMap};
use crate::transport::{
    FileTransferInfo, FriendInfo, FtHandle, FtState, Transport, TransportEvents,
};

pub struct Sidecar {
    transport: Arc<dyn Transport>,
    sessions: Arc<SessionMap>,
    prefs: Arc<PeerPrefs>,
    queue: Arc<EventQueue>,
    router: InboundRouter,
    friends: Arc<FriendRegistry>,
    welcomed: WelcomedPeers,
    profile: Mutex<SelfProfile>,
    counters: Arc<StatusCounters>,
    dispatcher: Dispatcher,
    ready: AtomicBool,
    connected: AtomicBool,
    media_dir: PathBuf,
    user_id: String,
    address: String,
}

impl Sidecar {
    /// Wire up the runtime. The one fatal startup condition is an
    /// unusable data directory or relay configuration.
    pub fn start(config: &SidecarConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

        let user_id = transport.self_user_id();
        let address = transport.self_address();

        // Profile: refresh the transport identity fields and push our
        // listed fields back to the transport.
        let profile_file = profile_path(&config.data_dir);
        let mut profile = SelfProfile::load(&profile_file);
        profile.profile.carrier_user_id = user_id.clone();
        profile.profile.carrier_address = address.clone();
        if profile.profile.started_at.is_empty() {
            profile.profile.started_at = chrono::Utc::now().to_rfc3339();
        }
        if let Err(e) = profile.save(&profile_file) {
            tracing::warn!("profile save failed: {}", e);
        }
        let self_info = FriendInfo {
            friendid: user_id.clone(),
            name: profile.profile.name.clone(),
            gender: profile.profile.gender.clone(),
            phone: profile.profile.phone.clone(),
            email: profile.profile.email.clone(),
            description: profile.profile.description.clone(),
            region: profile.profile.region.clone(),
            ..FriendInfo::default()
        };
        if let Err(e) = transport.set_self_info(&self_info) {
            tracing::warn!("set_self_info failed: {}", e);
        }

        let counters = Arc::new(StatusCounters::new());
        let prefs = Arc::new(PeerPrefs::new());
        let queue = Arc::new(EventQueue::new());
        let sessions = Arc::new(SessionMap::new());

        let db_config = DbConfig::load(&config.data_dir);
        let geo = Arc::new(if !db_config.crawler_url.is_empty() {
            GeoProbe::with_crawler_url(&db_config.crawler_url, db_config.crawler_refresh_seconds)
        } else if !db_config.crawler_path.is_empty() {
            GeoProbe::with_crawler_file(
                PathBuf::from(&db_config.crawler_path),
                db_config.crawler_refresh_seconds,
            )
        } else {
            GeoProbe::disabled()
        });
        let friends = Arc::new(FriendRegistry::new(
            &config.data_dir,
            FriendDb::from_config(&db_config),
            geo,
            counters.clone(),
        ));

        let router = InboundRouter::new(
            &config.data_dir,
            chrono::Utc::now().timestamp(),
            prefs.clone(),
            queue.clone(),
            counters.clone(),
        );

        let dispatcher = Dispatcher::new(
            transport.clone(),
            sessions.clone(),
            prefs.clone(),
            friends.clone(),
            RelayClient::new(&config.relay_url)?,
            config.waits(),
        );

        let sidecar = Arc::new(Self {
            transport: transport.clone(),
            sessions,
            prefs,
            queue,
            router,
            friends,
            welcomed: WelcomedPeers::load(&config.data_dir),
            profile: Mutex::new(profile),
            counters,
            dispatcher,
            ready: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            media_dir: config.data_dir.join("media"),
            user_id,
            address,
        });

        // Seed the friend mirror from whatever the transport already knows.
        for info in transport.friends() {
            sidecar.friends.upsert(&info);
        }

        tracing::info!(
            "sidecar started: user {} data_dir {}",
            sidecar.user_id,
            config.data_dir.display()
        );
        Ok(sidecar)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> StatusSnapshot {
        self.counters.snapshot()
    }

    pub fn drain_events(&self) -> Vec<IncomingMessage> {
        self.queue.drain()
    }

    pub fn send_text(&self, peer: &str, text: &str) -> Result<(), SendError> {
        self.dispatcher.send_text(peer, text)
    }

    pub fn send_media(&self, req: &MediaRequest) -> Result<(), SendError> {
        self.dispatcher.send_media(req)
    }

    pub fn send_status(&self, req: &StatusRequest) -> Result<(), SendError> {
        self.dispatcher.send_status(req)
    }

    /// Greet a peer exactly once across restarts.
    fn maybe_welcome(&self, peer: &str) {
        let message = self.profile.lock().unwrap().welcome_message.clone();
        if message.is_empty() || !self.welcomed.mark(peer) {
            return;
        }
        match self.transport.send_friend_message(peer, message.as_bytes()) {
            Ok(_) => tracing::info!("welcomed {}", peer),
            Err(e) => tracing::warn!("welcome to {} failed: {}", peer, e),
        }
    }
}

impl TransportEvents for Sidecar {
    fn on_connection_status(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
        tracing::info!(
            "carrier connection {}",
            if connected { "established" } else { "lost" }
        );
    }

    fn on_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
        tracing::info!("carrier node ready");
    }

    fn on_friend_connection(&self, peer: &str, online: bool) {
        self.friends.friend_connection(peer, online);
        if online {
            self.maybe_welcome(peer);
        }
    }

    fn on_friend_info(&self, _peer: &str, info: &FriendInfo) {
        self.friends.upsert(info);
    }

    fn on_friend_added(&self, info: &FriendInfo) {
        self.friends.upsert(info);
    }

    fn on_friend_presence(&self, peer: &str, presence: i32) {
        self.friends.friend_presence(peer, presence);
    }

    fn on_friend_message(&self, peer: &str, bytes: &[u8], msg_id: &str, ts: i64, offline: bool) {
        self.router.handle_message(peer, bytes, msg_id, ts, offline);
    }

    fn on_friend_request(&self, peer: &str, greeting: &str) {
        tracing::info!("friend request from {}: {}", peer, greeting);
        if let Err(e) = self.transport.accept_friend(peer) {
            tracing::warn!("accepting {} failed: {}", peer, e);
            return;
        }
        if self.friends.get(peer).is_none() {
            self.friends.upsert(&FriendInfo {
                friendid: peer.to_string(),
                ..FriendInfo::default()
            });
        }
        self.maybe_welcome(peer);
    }

    fn on_friend_invite(&self, peer: &str, data: &[u8]) {
        tracing::info!("friend invite from {} ({} bytes)", peer, data.len());
    }

    fn on_friend_list(&self, info: &FriendInfo) {
        self.friends.upsert(info);
    }

    fn on_filetransfer_connect(&self, peer: &str, handle: FtHandle, info: &FileTransferInfo) {
        tracing::info!(
            "inbound transfer from {}: {} ({} bytes)",
            peer,
            info.filename,
            info.size
        );
        if let Err(e) = transfer::accept_incoming(
            &*self.transport,
            &self.sessions,
            &self.media_dir,
            peer,
            handle,
            info,
        ) {
            tracing::warn!("accepting transfer from {} failed: {}", peer, e);
            self.sessions.take(handle);
            self.transport.ft_close(handle);
        }
    }

    fn on_ft_state_changed(&self, handle: FtHandle, state: FtState) {
        transfer::on_state_changed(&*self.transport, &self.sessions, handle, state);
    }

    fn on_ft_pull(&self, handle: FtHandle, _fileid: &str, offset: u64) {
        let session = match self.sessions.get(handle) {
            Some(s) => s,
            None => return,
        };
        if session.role != Role::Sender {
            tracing::warn!("pull callback on receiver session {}", handle);
            return;
        }
        session.serve_pull(&*self.transport, handle, offset);
    }

    fn on_ft_data(&self, handle: FtHandle, fileid: &str, bytes: &[u8]) {
        let session = match self.sessions.get(handle) {
            Some(s) => s,
            None => return,
        };
        match session.accept_data(bytes) {
            DataOutcome::Progress => {}
            DataOutcome::Completed(done) => {
                self.sessions.take(handle);
                self.transport.ft_close(handle);
                tracing::info!(
                    "transfer from {} complete: {} ({} bytes)",
                    done.peer,
                    done.filename,
                    done.size
                );
                self.queue.push(IncomingMessage {
                    peer: done.peer,
                    media_path: done.path.display().to_string(),
                    media_type: done.media_type,
                    filename: done.filename,
                    size: done.size,
                    ts: chrono::Utc::now().timestamp(),
                    ..IncomingMessage::default()
                });
            }
            DataOutcome::WriteFailed(e) => {
                tracing::warn!("transfer write failed: {}", e);
                self.sessions.take(handle);
                self.transport.ft_cancel(handle, fileid, -1, "write_failed");
                self.transport.ft_close(handle);
            }
        }
    }

    fn on_ft_cancel(&self, handle: FtHandle, _fileid: &str, status: i32, reason: &str) {
        transfer::on_cancel(&*self.transport, &self.sessions, handle, status, reason);
    }
}
