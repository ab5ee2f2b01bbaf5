//! Mesh loopback demo
//!
//! Runs several participants in one process, connected through an in-process
//! signaling relay and real webrtc-rs peer connections. Every participant
//! greets every other one over the data channel and waits for an ack.
//!
//! # Usage
//!
//! ```bash
//! # Three participants, host candidates only
//! cargo run --bin mesh_loopback
//!
//! # Five participants with a public STUN server and debug logs
//! RUST_LOG=remotemedia_mesh=debug cargo run --bin mesh_loopback -- \
//!   --participants 5 \
//!   --stun-servers stun:stun.l.google.com:19302
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use remotemedia_mesh::primitive::rtc::RtcPrimitiveFactory;
use remotemedia_mesh::{
    Capabilities, IceServer, LocalRelay, MeshConfig, MeshEvent, MeshOrchestrator,
    RelayTransport,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const GREETING: &str = "greeting";
const ACK: &str = "ack";

/// Time to keep serving peers after our own exchange completed
const LINGER: Duration = Duration::from_millis(500);

/// RemoteMedia mesh loopback
///
/// Builds a full mesh between local participants and exchanges data-channel
/// greetings over it.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of participants in the room
    #[arg(short, long, default_value_t = 3, env = "MESH_PARTICIPANTS")]
    participants: usize,

    /// Greeting text sent to every other participant
    #[arg(short, long, default_value = "hello", env = "MESH_MESSAGE")]
    message: String,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 30, env = "MESH_TIMEOUT_SECS")]
    timeout_secs: u64,

    /// STUN servers (comma-separated); host candidates are enough locally
    #[arg(long, value_delimiter = ',', env = "MESH_STUN_SERVERS")]
    stun_servers: Vec<String>,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false, env = "MESH_JSON_LOGS")]
    json_logs: bool,
}

#[derive(Debug, Default)]
struct Tally {
    acks_received: usize,
    acks_sent: usize,
}

impl Tally {
    fn complete(&self, others: usize) -> bool {
        self.acks_received >= others && self.acks_sent >= others
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    if args.participants < 2 {
        bail!("need at least 2 participants, got {}", args.participants);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        participants = args.participants,
        stun_servers = ?args.stun_servers,
        "Mesh loopback starting"
    );

    let config = MeshConfig::default().with_ice_servers(
        args.stun_servers
            .iter()
            .map(|url| IceServer::stun(url.clone()))
            .collect(),
    );
    config.validate().context("invalid mesh configuration")?;

    let factory = Arc::new(RtcPrimitiveFactory::new().context("failed to build WebRTC API")?);
    let relay = LocalRelay::new();

    let sessions: Vec<String> = (1..=args.participants)
        .map(|i| format!("participant-{}", i))
        .collect();

    // Everyone joins the relay before anyone starts offering
    let joined: Vec<_> = sessions.iter().map(|s| relay.join(s.as_str())).collect();

    let mut tasks = Vec::new();
    for (index, (transport, inbound)) in joined.into_iter().enumerate() {
        let (mesh, events) = MeshOrchestrator::new(
            transport,
            inbound,
            config.clone(),
            Capabilities::default(),
            factory.clone(),
        )?;
        let earlier = sessions[..index].to_vec();
        let message = args.message.clone();
        let others = args.participants - 1;
        let timeout = Duration::from_secs(args.timeout_secs);

        tasks.push(tokio::spawn(async move {
            let session = mesh.session_id().to_string();
            let result =
                tokio::time::timeout(timeout, participate(mesh, events, earlier, message, others))
                    .await;
            (session, result)
        }));
    }

    let mut failed = 0;
    for task in tasks {
        let (session, result) = task.await.context("participant task panicked")?;
        match result {
            Ok(Ok(tally)) => info!(
                session = %session,
                acks_received = tally.acks_received,
                acks_sent = tally.acks_sent,
                "Participant done"
            ),
            Ok(Err(e)) => {
                warn!(session = %session, "Participant failed: {:#}", e);
                failed += 1;
            }
            Err(_) => {
                warn!(session = %session, "Participant timed out");
                failed += 1;
            }
        }
        relay.leave(&session);
    }

    if failed > 0 {
        bail!("{} of {} participants did not complete", failed, args.participants);
    }
    info!("Full mesh established, all greetings acknowledged");
    Ok(())
}

async fn participate(
    mut mesh: MeshOrchestrator<RelayTransport>,
    mut events: mpsc::UnboundedReceiver<MeshEvent>,
    earlier: Vec<String>,
    message: String,
    others: usize,
) -> anyhow::Result<Tally> {
    let session = mesh.session_id().to_string();
    let label = mesh.registry().config().default_channel_label.clone();
    let greeting = json!({ "from": session, "text": message });

    // Offer to everyone who joined before us; later participants offer to us.
    // Greetings to our own offers queue until the channel opens.
    mesh.join_call(&earlier).await?;
    mesh.send_directly_to_all(&label, GREETING, greeting.clone())
        .await;

    let mut tally = Tally::default();
    while !tally.complete(others) {
        if !mesh.step().await? {
            bail!("signaling closed");
        }

        while let Ok(event) = events.try_recv() {
            match event {
                MeshEvent::ChannelOpen { peer, label: opened } => {
                    let answerer = mesh
                        .registry()
                        .peer(peer.handle)
                        .is_some_and(|p| !p.is_offerer());
                    if answerer && opened == label {
                        mesh.send_directly(peer.handle, &label, GREETING, greeting.clone())
                            .await?;
                    }
                }
                MeshEvent::ChannelMessage {
                    peer,
                    label: channel,
                    message,
                } => match message.kind.as_str() {
                    GREETING => {
                        info!(session = %session, from = %peer.id, payload = %message.payload, "Greeting received");
                        mesh.send_directly(peer.handle, &channel, ACK, json!({ "from": session }))
                            .await?;
                        tally.acks_sent += 1;
                    }
                    ACK => {
                        debug!(session = %session, from = %peer.id, "Ack received");
                        tally.acks_received += 1;
                    }
                    other => debug!("Ignoring channel message of type {}", other),
                },
                MeshEvent::IceFailed(peer) => {
                    warn!(session = %session, peer = %peer.id, "ICE failed, restarting");
                    mesh.restart_ice(peer.handle).await?;
                }
                MeshEvent::PeerError { peer, error } => {
                    warn!(session = %session, peer = %peer.id, "Peer error: {}", error);
                }
                other => debug!(session = %session, "{:?}", other),
            }
        }
    }

    // Others may still be waiting on frames we just queued
    let _ = tokio::time::timeout(LINGER, async {
        while let Ok(true) = mesh.step().await {}
    })
    .await;
    mesh.leave_call().await;

    Ok(tally)
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("remotemedia_mesh=info,mesh_loopback=info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
