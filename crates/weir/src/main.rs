use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use weir::{api, config, forwarder::Forwarder, loki, metrics_server, App};

/// A log ingestion gateway: durable per-tenant WAL buffering in front of a
/// Loki-compatible sink.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Path to the YAML configuration file. SIGHUP reloads it in place.
    #[arg(long, env = "WEIR_CONFIG", default_value = "weir.yaml")]
    config: PathBuf,
}

const SINK_PROBE_INTERVAL: Duration = Duration::from_secs(15);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let loaded = config::load(&cli.config)?;
    install_tracing(&loaded.server.log_level);

    let snapshot = config::Snapshot::build(loaded).context("validating configuration")?;
    let handle = config::Handle::new(snapshot);
    let prom = metrics_server::install();

    let app = Arc::new(App::new(handle.clone()));
    tracing::info!(config = %cli.config.display(), "starting weir");

    match app.wal.recover().await {
        Ok(report) => {
            app.health.note_recovered(true);
            tracing::info!(
                tenants = report.tenants,
                segments = report.segments,
                purged = report.purged,
                "WAL recovery complete"
            );
        }
        Err(err) => {
            app.health.note_recovered(false);
            tracing::error!(?err, "WAL recovery failed; gateway will stay unready");
        }
    }

    let cancel = tokio_util::sync::CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received ctrl-c, initiating shutdown");
        ctrl_c_token.cancel();
    });

    tokio::spawn(config::watch_reload(
        handle.clone(),
        cli.config.clone(),
        cancel.clone(),
    ));

    let sink = loki::Client::new(&handle.snapshot().config.loki)
        .context("building sink client")?;

    // Sink readiness prober feeding the /readyz sink probe.
    let prober = {
        let sink = sink.clone();
        let health = app.health.clone();
        let cancel = cancel.clone();
        spawn_supervised("sink-prober", cancel.clone(), move || {
            let sink = sink.clone();
            let health = health.clone();
            let cancel = cancel.clone();
            async move {
                loop {
                    if sink.ready().await {
                        health.note_sink_ok();
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(SINK_PROBE_INTERVAL) => (),
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        })
    };

    let forwarder = {
        let wal = app.wal.clone();
        let sink = sink.clone();
        let config = handle.clone();
        let health = app.health.clone();
        let status = app.forwarder_status.clone();
        let cancel_outer = cancel.clone();
        spawn_supervised("forwarder", cancel.clone(), move || {
            let forwarder = Forwarder::new(
                wal.clone(),
                sink.clone(),
                config.clone(),
                health.clone(),
                status.clone(),
            );
            forwarder.run(cancel_outer.clone())
        })
    };

    let server = handle.snapshot().config.server.clone();
    let listener = tokio::net::TcpListener::bind((server.host.as_str(), server.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", server.host, server.port))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let router = api::build_router(app.clone(), prom);
    axum::serve(listener, router)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .context("serving HTTP")?;

    // In-flight admissions have drained; give the forwarder its grace
    // period to finish the current push. Sealed segments stay on disk for
    // delivery after restart.
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = forwarder.await;
        let _ = prober.await;
    })
    .await;
    tracing::info!("shutdown complete");
    Ok(())
}

fn install_tracing(default_level: &str) {
    use tracing_subscriber::Layer;

    let directive = default_level
        .parse()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO.into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(directive)
                .from_env_lossy(),
        );
    tracing_subscriber::registry().with(fmt_layer).init();
}

/// Run a background task, restarting it with exponential backoff if it
/// panics. Background faults must never take the process down.
fn spawn_supervised<F, Fut>(
    name: &'static str,
    cancel: tokio_util::sync::CancellationToken,
    mut task: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut delay = Duration::from_secs(1);
        loop {
            let run = tokio::spawn(task());
            match run.await {
                Ok(()) => return,
                Err(err) if err.is_panic() => {
                    tracing::error!(task = name, ?err, "background task panicked; restarting");
                }
                Err(_) => return,
            }
            if cancel.is_cancelled() {
                return;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(60));
        }
    })
}
