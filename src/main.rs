use anyhow::{Context, Result};
use clap::Parser;
use event_relay::config::{self, WebhookSettings};
use event_relay::server::{self, StaticSources};
use event_relay::sink::FileEventSink;
use event_relay::stats::MetricsStats;
use event_relay::webhook::WebhookTransformer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let settings = WebhookSettings::from_config(&cfg);
    let sink = Arc::new(FileEventSink::new(&cfg.app.data_dir));
    let webhook = WebhookTransformer::new(settings.clone(), sink, Arc::new(MetricsStats))?;

    let sources = StaticSources::from_config(&cfg.sources);
    for source_type in sources.source_types() {
        webhook.register(&source_type);
    }

    #[cfg(unix)]
    spawn_reload_on_hangup(args.config.clone(), settings);

    let listener = tokio::net::TcpListener::bind(&cfg.app.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.app.listen_addr))?;
    info!(addr = %cfg.app.listen_addr, "listening for webhooks");

    let app = server::router(webhook.clone(), Arc::new(sources));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(?err, "failed to listen for ctrl-c");
            }
        })
        .await
        .context("serving webhooks")?;

    webhook.shutdown().await;
    info!("stopped");
    Ok(())
}

/// Re-read the config file on SIGHUP and apply the reloadable settings.
#[cfg(unix)]
fn spawn_reload_on_hangup(path: PathBuf, settings: WebhookSettings) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(err) => {
                error!(?err, "cannot install SIGHUP handler");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match config::load(Some(&path)) {
                Ok(cfg) => {
                    settings.reload(&cfg);
                    info!(path = %path.display(), "webhook settings reloaded");
                }
                Err(err) => error!(?err, "config reload failed, keeping current settings"),
            }
        }
    });
}
