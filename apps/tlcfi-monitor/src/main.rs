//! # TLC-FI Monitor
//!
//! Connects to a TLC facility, logs every client event and, when configured
//! as a control application, asks for control once the session is set up.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  main                                                                   │
//! │   ├── session task: client.start_session()                             │
//! │   └── loop                                                              │
//! │        ├── every 100 ms ──► client.update_state()                      │
//! │        ├── Initialized  ──► request_session_start_control()            │
//! │        ├── EndControlRequestReceived ──► confirm_end_control()         │
//! │        └── Ctrl+C       ──► end_session()                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage: `tlcfi-monitor [--config <path>]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tlcfi_client::{ClientConfig, ClientEvent, ClientEventEmitter, TlcfiClient};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Logs events and hands the ones the monitor acts on to the main loop.
struct LoggingEmitter {
    actions: mpsc::UnboundedSender<ClientEvent>,
}

impl ClientEventEmitter for LoggingEmitter {
    fn emit(&self, event: &ClientEvent) {
        match event {
            ClientEvent::FatalError { message } => error!(%message, "Client stopped"),
            ClientEvent::LostControl { expected: false } => warn!("Lost control unexpectedly"),
            ClientEvent::SessionEnded { expected } => info!(expected, "Session ended"),
            other => info!(event = ?other, "Client event"),
        }
        if matches!(
            event,
            ClientEvent::Initialized | ClientEvent::EndControlRequestReceived
        ) {
            // The main loop is gone during shutdown.
            let _ = self.actions.send(event.clone());
        }
    }
}

fn config_path_from_args() -> anyhow::Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let value = args.next().context("--config needs a path")?;
                path = Some(PathBuf::from(value));
            }
            other => bail!("unknown argument '{}'; usage: tlcfi-monitor [--config <path>]", other),
        }
    }
    Ok(path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config = ClientConfig::load(config_path_from_args()?).context("loading configuration")?;
    info!(
        remote = %config.remote.socket_address(),
        intersection = %config.intersection_id(),
        application_type = %config.application_type(),
        "Configuration loaded"
    );

    let (actions_tx, mut actions) = mpsc::unbounded_channel();
    let client = TlcfiClient::builder(config)
        .with_emitter(Arc::new(LoggingEmitter { actions: actions_tx }))
        .build()?;

    let runner = client.clone();
    let mut session_task = tokio::spawn(async move { runner.start_session().await });
    let mut flush = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = flush.tick() => client.update_state(),
            Some(event) = actions.recv() => match event {
                ClientEvent::Initialized if client.config().is_control_application() => {
                    if let Err(e) = client.request_session_start_control().await {
                        warn!(error = %e, "Requesting control failed");
                    }
                }
                ClientEvent::EndControlRequestReceived => client.confirm_end_control(),
                _ => {}
            },
            result = &mut session_task => {
                match result? {
                    Ok(()) => info!("Session loop finished"),
                    Err(e) => error!(error = %e, "Session loop stopped"),
                }
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, ending session");
                break;
            }
        }
    }

    client.end_session().await;
    if let Err(e) = session_task.await? {
        warn!(error = %e, "Session loop ended with an error");
    }
    info!("Monitor stopped");
    Ok(())
}
