use anyhow::Context;
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use sfu_call::calls::media::HeadlessMediaEngine;
use sfu_call::config::ClientConfig;
use sfu_call::credentials::StaticCredentials;
use sfu_call::socket::TokioWebSocketTransportFactory;
use sfu_call::{Client, RemoteParty};
use std::sync::Arc;

// Signaling probe: connects to the call server with a headless media engine,
// optionally dials someone, and logs every call state change.
//
// Usage:
//   sfu-call --url wss://sfu.example.com/ws --token <jwt>
//   SFU_TOKEN=<jwt> sfu-call --url wss://sfu.example.com/ws --call bob

#[derive(Parser, Debug)]
#[command(name = "sfu-call", about = "Headless SFU call client")]
struct Args {
    /// WebSocket URL of the signaling server.
    #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
    url: String,

    /// Bearer token used for the signaling handshake.
    #[arg(long, env = "SFU_TOKEN", hide_env_values = true)]
    token: String,

    /// User id to call once connected.
    #[arg(long)]
    call: Option<String>,

    /// Device id sent when answering calls.
    #[arg(long, default_value = "sfu-call-cli")]
    device_id: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = ClientConfig {
        server_url: args.url,
        device_id: args.device_id,
        ..Default::default()
    };
    let client = Client::new(
        config,
        Arc::new(TokioWebSocketTransportFactory::new()),
        Arc::new(StaticCredentials::new(args.token)),
        Arc::new(HeadlessMediaEngine::default()),
    )
    .await;

    let mut snapshots = client.calls().watch();
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            match serde_json::to_string(&snapshot) {
                Ok(json) => info!("Call state: {json}"),
                Err(e) => warn!("Could not render call state: {e}"),
            }
        }
    });

    let mut failures = client.events().call_failed.subscribe();
    tokio::spawn(async move {
        while let Ok(failure) = failures.recv().await {
            error!("Call failed: {}", failure.message);
        }
    });

    client
        .connect()
        .await
        .context("could not connect to the signaling server")?;

    if let Some(user) = args.call {
        info!("Calling {user}");
        client.calls().dial(RemoteParty::user(user))?;
    }

    let runner = client.clone();
    let run_loop = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Ctrl-C received, hanging up.");
    if client.calls().snapshot() != Default::default() {
        client.calls().hang_up()?;
    }
    client.disconnect().await;
    run_loop.await.context("run loop panicked")?;
    Ok(())
}
