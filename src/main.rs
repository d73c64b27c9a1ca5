mod codec;
mod config;
mod dedup;
mod dispatch;
mod events;
mod geo;
mod prefs;
mod presence;
mod relay;
mod router;
mod runtime;
mod server;
mod state;
mod transfer;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use config::SidecarConfig;
use runtime::Sidecar;
use state::profile::{profile_path, SelfProfile};
use transport::loopback::LoopbackHub;

#[derive(Parser)]
#[command(
    name = "beagle-sidecar",
    version,
    about = "Beagle sidecar — loopback HTTP bridge for a Carrier p2p node"
)]
struct Cli {
    /// Loopback API port
    #[arg(long)]
    port: Option<u16>,

    /// Bearer token required on every API request
    #[arg(long)]
    token: Option<String>,

    /// State directory (profile, friend state, media, logs)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// JSON config file (default: BEAGLE_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for rolling log files (default: stderr logging)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn prune_old_logs(log_dir: &std::path::Path, keep_days: u64) {
    let cutoff = std::time::SystemTime::now()
        .checked_sub(std::time::Duration::from_secs(keep_days * 86400))
        .unwrap_or(std::time::UNIX_EPOCH);

    if let Ok(entries) = std::fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            // tracing_appender rolling::daily names files "sidecar.log.YYYY-MM-DD"
            let is_sidecar_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("sidecar.log"))
                .unwrap_or(false);
            if is_sidecar_log {
                if let Ok(meta) = std::fs::metadata(&path) {
                    if let Ok(modified) = meta.modified() {
                        if modified < cutoff {
                            let _ = std::fs::remove_file(&path);
                        }
                    }
                }
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = SidecarConfig::load(cli.config.as_deref())?.with_overrides(
        cli.port,
        cli.token.as_deref(),
        cli.data_dir.as_deref(),
        cli.log_dir.as_deref(),
    );

    // Rolling file logs when a log dir is configured, stderr otherwise.
    let _guard;
    match &config.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            prune_old_logs(log_dir, 7);

            let file_appender = tracing_appender::rolling::daily(log_dir, "sidecar.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            _guard = Some(guard);

            tracing_subscriber::fmt()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_env_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive("beagle_sidecar=info".parse()?),
                )
                .init();
        }
        None => {
            _guard = None;
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive("beagle_sidecar=info".parse()?),
                )
                .init();
        }
    }

    if let Some(sdk_root) = &config.sdk_root {
        tracing::info!("carrier SDK root: {}", sdk_root.display());
    }

    // Standalone mode runs against the in-process loopback hub; a real
    // Carrier binding plugs in behind the same Transport trait.
    let user_id = {
        let profile = SelfProfile::load(&profile_path(&config.data_dir));
        if profile.profile.carrier_user_id.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            profile.profile.carrier_user_id
        }
    };
    let address = format!("loopback:{}", user_id);

    let hub = LoopbackHub::new();
    let endpoint = hub.endpoint(&user_id, &address);
    let sidecar = Sidecar::start(&config, endpoint.clone())?;
    endpoint.bind(sidecar.clone() as Arc<dyn transport::TransportEvents>);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(server::serve(sidecar, &config))?;

    endpoint.unregister();
    tracing::info!("sidecar shutdown complete");
    Ok(())
}
