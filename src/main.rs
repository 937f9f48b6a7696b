//! HAMSTR station binary.
//!
//! Runs either side of the bridge: the server sits next to an Internet
//! connection and serves NOSTR operations to radio peers; the client
//! sends requests over the air and prints what comes back.

use clap::Parser;
use hamstr::config::{Role, StationConfig};
use hamstr::nostr::{NoteRequest, NoteRequestType, UnconfiguredGateway};
use hamstr::station::Station;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "hamstr", version, about = "NOSTR over amateur radio")]
struct Args {
    /// Role: client or server
    #[arg(short, long, default_value = "server")]
    role: String,

    /// Station configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend override: packet, vara, reticulum
    #[arg(short, long)]
    backend: Option<String>,

    /// Our callsign, e.g. N0CALL-1
    #[arg(long)]
    callsign: Option<String>,

    /// Server station callsign (client role)
    #[arg(long)]
    remote: Option<String>,

    /// Fetch this many notes and print them (client role)
    #[arg(long)]
    get_notes: Option<u32>,

    /// Note request type: 1 following, 2 user, 3 global, 4 text,
    /// 5 hashtag, 6 user search
    #[arg(long, default_value = "1")]
    note_type: u8,

    /// Extra request parameter (npub, hashtag, search text)
    #[arg(long)]
    params: Option<String>,

    /// Publish the signed note event JSON from this file (client role)
    #[arg(long)]
    publish: Option<PathBuf>,

    /// Send the zap request (kind 9734 JSON) from this file (client role)
    #[arg(long)]
    zap: Option<PathBuf>,
}

fn build_config(args: &Args) -> Result<StationConfig, String> {
    let mut cfg = match &args.config {
        Some(path) => StationConfig::load(path).map_err(|e| e.to_string())?,
        None => {
            let callsign = args
                .callsign
                .as_deref()
                .ok_or("either --config or --callsign is required")?;
            StationConfig {
                role: Role::Server,
                backend: hamstr::BackendKind::Packet,
                callsign: callsign.parse().map_err(|e| format!("{e}"))?,
                remote: None,
                tnc: Default::default(),
                vara: Default::default(),
                mesh: Default::default(),
                protocol: Default::default(),
            }
        }
    };

    cfg.role = match args.role.as_str() {
        "client" => Role::Client,
        "server" => Role::Server,
        other => return Err(format!("invalid role '{other}', use client or server")),
    };
    if let Some(backend) = &args.backend {
        cfg.backend = backend.parse()?;
    }
    if let Some(callsign) = &args.callsign {
        cfg.callsign = callsign.parse().map_err(|e| format!("{e}"))?;
    }
    if let Some(remote) = &args.remote {
        cfg.remote = Some(remote.parse().map_err(|e| format!("{e}"))?);
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hamstr=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let cfg = match build_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Configuration error: {e}");
            return;
        }
    };

    info!("════════════════════════════════════════════════════════════");
    info!("  HAMSTR v{VERSION} - NOSTR over amateur radio");
    info!("════════════════════════════════════════════════════════════");
    info!(
        "Role: {:?} | Backend: {} | Callsign: {}",
        cfg.role, cfg.backend, cfg.callsign
    );

    let role = cfg.role;
    let mut station = match Station::new(cfg, UnconfiguredGateway).await {
        Ok(station) => station,
        Err(e) => {
            error!("Failed to start station: {e}");
            return;
        }
    };

    match role {
        Role::Server => {
            let (running, shutdown) = station.shutdown_handle();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutdown requested");
                running.store(false, Ordering::SeqCst);
                shutdown.notify_waiters();
                // Hard exit if the clean path wedges mid-transfer.
                tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                error!("Force exiting due to shutdown timeout");
                std::process::exit(1);
            });
            if let Err(e) = station.run_server().await {
                error!("Server error: {e}");
            }
            info!("Server stopped");
        }
        Role::Client => {
            if let Some(count) = args.get_notes {
                let request_type = match NoteRequestType::try_from(args.note_type) {
                    Ok(ty) => ty,
                    Err(v) => {
                        error!("Invalid note type {v}");
                        return;
                    }
                };
                let request = NoteRequest {
                    request_type,
                    count,
                    params: args.params.clone(),
                };
                match station.fetch_notes(request).await {
                    Ok(body) => println!("{body}"),
                    Err(e) => error!("Request failed: {e}"),
                }
            } else if let Some(path) = &args.publish {
                match std::fs::read_to_string(path) {
                    Ok(note) => match station.publish_note(&note).await {
                        Ok(true) => info!("Note published"),
                        Ok(false) => error!("Note publication failed"),
                        Err(e) => error!("Note publication failed: {e}"),
                    },
                    Err(e) => error!("Cannot read {}: {e}", path.display()),
                }
            } else if let Some(path) = &args.zap {
                match std::fs::read_to_string(path) {
                    Ok(zap) => match station.send_zap(&zap).await {
                        Ok(body) => println!("{body}"),
                        Err(e) => error!("Zap failed: {e}"),
                    },
                    Err(e) => error!("Cannot read {}: {e}", path.display()),
                }
            } else {
                error!("Client role needs one of --get-notes, --publish, --zap");
            }
        }
    }
}
