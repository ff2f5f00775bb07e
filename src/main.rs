use chrono::Utc;
use rust_tradewatch::api::{run_server, StatusState};
use rust_tradewatch::config::AppConfig;
use rust_tradewatch::constants::topics;
use rust_tradewatch::engine::Pipeline;
use rust_tradewatch::transport::jsonl::{JsonlAlertSink, JsonlSource};
use rust_tradewatch::transport::{AlertSink, TradeSource};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Setup Logging (stderr, so alerts on stdout stay clean)
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting TradeWatch...");

    // Load Configuration
    let config = AppConfig::load().map_err(|e| {
        error!("❌ Configuration rejected: {}", e);
        e
    })?;
    info!("Loaded Configuration: {:?}", config);

    if config.runtime.workers > 1 {
        warn!(
            "⚠️ JSONL input is a single partition; running 1 worker instead of {}",
            config.runtime.workers
        );
    }

    info!(
        "Topics: {} <- {}, {} -> {}",
        topics::TRADES_RAW,
        config
            .transport
            .input
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "stdin".to_string()),
        topics::SIGNALS_ALERTS,
        config
            .transport
            .output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "stdout".to_string())
    );

    let source: Box<dyn TradeSource> = match &config.transport.input {
        Some(path) => Box::new(JsonlSource::open(path).await?),
        None => Box::new(JsonlSource::stdin()),
    };
    let sink: Arc<dyn AlertSink> = match &config.transport.output {
        Some(path) => Arc::new(JsonlAlertSink::append_to(path).await?),
        None => Arc::new(JsonlAlertSink::stdout()),
    };

    let pipeline = Pipeline::new(config.clone());
    let cancel = pipeline.cancel_token();

    // Late trades side channel
    pipeline.bus().log_late_trades();

    // Start Status API
    if let Some(bind) = config.http_bind.clone() {
        let state = Arc::new(StatusState {
            metrics: pipeline.metrics(),
            started_at: Utc::now(),
            window_size_ms: config.window_size_ms,
            workers: 1,
        });
        let api_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_server(state, &bind, api_cancel).await {
                error!("❌ [API] Status server failed: {}", e);
            }
        });
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Ctrl-C received, shutting down gracefully...");
            shutdown.cancel();
        }
    });

    let report = pipeline.run(vec![source], sink).await?;
    cancel.cancel();

    info!(
        "📊 Summary: {}",
        serde_json::to_string(&report).unwrap_or_else(|_| format!("{:?}", report))
    );
    if report.metrics.alerting_degraded() {
        warn!(
            "⚠️ {} alert(s) could not be delivered",
            report.metrics.publish_failures
        );
    }
    Ok(())
}
