mod settings;
mod transport;

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relay_consumer::{CheckpointOptions, Consumer, ConsumerError, Event, HandlerError, Reply};
use tracing::{info, warn};

use crate::settings::{RelaySettings, SettingsError};
use crate::transport::HttpConnector;

/// Consume a Server-Sent Events stream, printing each event as a JSON line
/// and checkpointing progress so a restart resumes where it left off.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
struct Args {
    /// Event stream URL.
    #[arg(long)]
    url: Option<String>,

    /// Checkpoint store: `memory://`, `sqlite::memory:` or `sqlite://<path>`.
    #[arg(long)]
    store: Option<String>,

    /// Handled events between checkpoint writes.
    #[arg(long)]
    checkpoint_every: Option<u32>,

    /// Extra request header as `name: value`. Repeatable.
    #[arg(long = "header", value_name = "NAME: VALUE")]
    headers: Vec<String>,

    /// Settings file (defaults to ~/.relay/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

impl Args {
    /// Flags take precedence over file and environment settings.
    fn apply(&self, settings: &mut RelaySettings) -> Result<(), SettingsError> {
        if let Some(url) = &self.url {
            settings.stream.url.clone_from(url);
        }
        if let Some(store) = &self.store {
            settings.checkpoint.store_url = Some(store.clone());
        }
        if let Some(every) = self.checkpoint_every {
            settings.checkpoint.messages = every;
        }
        for header in &self.headers {
            let (name, value) = header.split_once(':').ok_or_else(|| SettingsError::InvalidValue {
                key: "header".into(),
                message: format!("expected `name: value`, got {header:?}"),
            })?;
            let _ = settings
                .stream
                .headers
                .insert(name.trim().to_string(), value.trim().to_string());
        }
        if let Some(level) = &self.log_level {
            settings.telemetry.log_level.clone_from(level);
        }
        if self.json_logs {
            settings.telemetry.json = true;
        }
        Ok(())
    }
}

/// Write the event to stdout as one JSON line. A closed stdout is fatal.
fn print_event(event: &Event) -> Reply {
    let line = match serde_json::to_string(event) {
        Ok(line) => line,
        Err(e) => return Reply::Ready(Err(HandlerError::Fatal(e.to_string()))),
    };
    let mut stdout = std::io::stdout().lock();
    match writeln!(stdout, "{line}").and_then(|()| stdout.flush()) {
        Ok(()) => Reply::ack(),
        Err(e) => Reply::Ready(Err(HandlerError::Fatal(format!("stdout: {e}")))),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings =
        settings::load_settings(args.config.as_deref()).context("failed to load settings")?;
    args.apply(&mut settings)?;
    relay_telemetry::init_telemetry(&settings.telemetry)?;
    settings.validate()?;

    info!(url = %settings.stream.url, "starting relay");

    let idle_timeout = (settings.stream.idle_timeout_ms > 0)
        .then(|| Duration::from_millis(settings.stream.idle_timeout_ms));
    let connector = HttpConnector::new(
        &settings.stream.url,
        &settings.stream.headers,
        Duration::from_millis(settings.stream.connect_timeout_ms),
        idle_timeout,
    )?
    .reconnect_on_eof(settings.stream.reconnect_on_eof);

    let mut consumer = Consumer::with_config(settings.consumer.clone())?;
    if let Some(store_url) = &settings.checkpoint.store_url {
        let options = CheckpointOptions::from_url(store_url)?
            .messages(settings.checkpoint.messages)
            .on_failure(settings.checkpoint.on_failure.clone());
        let _ = consumer.checkpoint(options)?;
    } else {
        warn!("no checkpoint store configured, progress will not be saved");
    }

    consumer.consume(connector).await?.on_event(print_event)?;

    let token = consumer.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            token.cancel();
        }
    });

    let result = consumer.run().await;
    let snapshot = consumer.liveness().snapshot();
    info!(
        events = snapshot.events_handled,
        checkpoints = snapshot.checkpoints_written,
        reconnects = snapshot.reconnects,
        "relay stopped"
    );

    match result {
        Ok(()) | Err(ConsumerError::Cancelled) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
