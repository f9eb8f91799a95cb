//! Telecall CLI Application

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use devices::SyntheticDevices;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use telecall_core::prelude::*;
use telecall_core::{stun_only, NegotiationState, DEFAULT_STUN_URLS};
use tracing_subscriber::EnvFilter;

mod devices;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the call identifier two participants share
    CallId {
        /// First participant
        a: String,
        /// Second participant
        b: String,
    },

    /// Fetch ICE servers from a credential endpoint
    IceServers {
        /// HTTPS endpoint returning a JSON array of ICE servers
        #[arg(long, env = "TELECALL_ICE_ENDPOINT")]
        endpoint: String,

        /// Bearer token sent with the request
        #[arg(long, env = "TELECALL_ICE_TOKEN")]
        token: Option<String>,
    },

    /// Run a caller and a callee in this process over an in-memory store
    Loopback {
        /// Caller participant id
        #[arg(long, default_value = "doc1")]
        caller: String,

        /// Callee participant id
        #[arg(long, default_value = "pat2")]
        callee: String,

        /// Skip video
        #[arg(long)]
        audio_only: bool,

        /// Do not use public STUN servers (host candidates only)
        #[arg(long)]
        offline: bool,

        /// Seconds to wait for the connection
        #[arg(long, default_value_t = 20)]
        timeout_secs: u64,
    },
}

#[derive(Serialize)]
struct LoopbackReport {
    caller: CallStatus,
    callee: CallStatus,
    caller_remote_tracks: usize,
    callee_remote_tracks: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("telecall=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CallId { a, b } => {
            println!("{}", CallId::for_participants(&ParticipantId::from(a), &ParticipantId::from(b)));
        }
        Commands::IceServers { endpoint, token } => {
            handle_ice_servers(endpoint, token).await?;
        }
        Commands::Loopback {
            caller,
            callee,
            audio_only,
            offline,
            timeout_secs,
        } => {
            let config = CallConfig {
                video: !audio_only,
                stun_fallback: if offline {
                    Vec::new()
                } else {
                    CallConfig::default().stun_fallback
                },
                ..CallConfig::default()
            };
            handle_loopback(caller, callee, config, Duration::from_secs(timeout_secs)).await?;
        }
    }

    Ok(())
}

async fn handle_ice_servers(endpoint: String, token: Option<String>) -> Result<()> {
    let provider = HttpIceCredentialProvider::new(endpoint, token)?;
    let servers = match provider.fetch().await {
        Ok(servers) => servers,
        Err(e) => {
            tracing::warn!(error = %e, "Credential fetch failed, showing STUN-only fallback");
            let fallback: Vec<String> = DEFAULT_STUN_URLS.iter().map(|url| (*url).to_string()).collect();
            stun_only(&fallback)
        }
    };
    println!("{}", serde_json::to_string_pretty(&servers)?);
    Ok(())
}

async fn handle_loopback(
    caller_id: String,
    callee_id: String,
    config: CallConfig,
    timeout: Duration,
) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let signaling = SignalingChannel::new(store.clone(), store.clone());
    let devices = Arc::new(SyntheticDevices::default());
    let factory = Arc::new(WebRtcPeerConnectionFactory::new()?.with_silence_pump());
    let deps = CallDependencies::new(
        signaling,
        Arc::new(StaticIceServers::default()),
        factory,
        devices.clone(),
    );
    let controller = CallController::new(deps, config.clone());

    let caller = controller.place_call(CallParticipants::new(caller_id.as_str(), callee_id.as_str()));
    let callee = controller.join_call(CallParticipants::new(callee_id.as_str(), caller_id.as_str()));
    tracing::info!(call_id = %caller.call_id(), "Loopback call started");

    let (caller_status, callee_status) =
        tokio::time::timeout(timeout, async { tokio::join!(caller.wait_connected(), callee.wait_connected()) })
            .await
            .context("timed out waiting for the connection")?;
    if caller_status.negotiation != NegotiationState::Connected
        || callee_status.negotiation != NegotiationState::Connected
    {
        caller.hang_up().await;
        callee.hang_up().await;
        bail!(
            "call ended before connecting: {}",
            caller_status
                .last_error
                .or(callee_status.last_error)
                .unwrap_or_else(|| "no error recorded".to_string())
        );
    }
    tracing::info!("Both sides connected");

    // Give RTP a moment to announce the remote tracks
    tokio::time::sleep(Duration::from_secs(1)).await;

    let muted = !caller.toggle_microphone().await?;
    tracing::info!(muted, "Caller microphone toggled");
    if config.video {
        let facing = caller.switch_camera().await?;
        tracing::info!(?facing, "Caller camera switched");
    }

    let caller_remote_tracks = caller.media().remote.map_or(0, |s| s.tracks.len());
    let callee_remote_tracks = callee.media().remote.map_or(0, |s| s.tracks.len());

    let report = LoopbackReport {
        caller: caller.hang_up().await,
        callee: callee.hang_up().await,
        caller_remote_tracks,
        callee_remote_tracks,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if devices.open_tracks() != 0 {
        bail!("{} capture tracks left open", devices.open_tracks());
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_call_id() {
        let cli = Cli::try_parse_from(["telecall", "call-id", "pat2", "doc1"]).unwrap();
        assert!(matches!(cli.command, Commands::CallId { ref a, ref b } if a == "pat2" && b == "doc1"));
    }

    #[test]
    fn test_parse_loopback_defaults() {
        let cli = Cli::try_parse_from(["telecall", "loopback", "--audio-only"]).unwrap();
        match cli.command {
            Commands::Loopback {
                caller,
                callee,
                audio_only,
                offline,
                timeout_secs,
            } => {
                assert_eq!(caller, "doc1");
                assert_eq!(callee, "pat2");
                assert!(audio_only);
                assert!(!offline);
                assert_eq!(timeout_secs, 20);
            }
            _ => panic!("expected loopback"),
        }
    }

    #[test]
    fn test_ice_servers_requires_endpoint() {
        assert!(Cli::try_parse_from(["telecall", "ice-servers"]).is_err());
    }
}
