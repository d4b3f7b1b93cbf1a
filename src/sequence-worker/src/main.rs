//! Sequence worker: runs the drip-sequence scheduler.
//!
//! Wires the in-memory stores, the logging delivery provider and the template
//! renderer together, then ticks until ctrl-c.

use std::net::SocketAddr;
use std::sync::Arc;

use campaign_core::config::AppConfig;
use campaign_core::event_bus::{EventSink, TracingSink};
use campaign_delivery::{DeliveryRetryManager, InMemoryAttemptStore, LoggingProvider, RetryPolicy};
use campaign_sequences::recipients::{InMemoryRecipients, Recipient};
use campaign_sequences::rendering::TemplateRenderer;
use campaign_sequences::schedule::Schedule;
use campaign_sequences::seed::seed_demo_sequences;
use campaign_sequences::types::TriggerType;
use campaign_sequences::{
    Collaborators, InMemoryEnrollmentStore, InMemorySequenceStore, SequenceScheduler, StepAdvancer,
    TriggerEnroller,
};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sequence-worker")]
#[command(about = "Advances drip sequences and redelivers failed messages")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "SEQUENCES__NODE_ID")]
    node_id: Option<String>,

    /// Seconds between scheduler ticks (overrides config)
    #[arg(long, env = "SEQUENCES__SEQUENCES__TICK_INTERVAL_SECS")]
    tick_interval: Option<u64>,

    /// Max enrollments advanced per tick (overrides config)
    #[arg(long, env = "SEQUENCES__SEQUENCES__BATCH_LIMIT")]
    batch_limit: Option<usize>,

    /// Concurrent advances per tick (overrides config)
    #[arg(long, env = "SEQUENCES__SEQUENCES__WORKER_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Sender address used by the logging provider
    #[arg(long, default_value = "noreply@example.com")]
    sender: String,

    /// Seed demo sequences and recipients
    #[arg(long, default_value_t = false)]
    demo: bool,

    /// Run a single tick and exit
    #[arg(long, default_value_t = false)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sequence_worker=info,campaign_sequences=info,campaign_delivery=info,analytics=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Sequence worker starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(secs) = cli.tick_interval {
        config.sequences.tick_interval_secs = secs;
    }
    if let Some(limit) = cli.batch_limit {
        config.sequences.batch_limit = limit;
    }
    if let Some(concurrency) = cli.concurrency {
        config.sequences.worker_concurrency = concurrency;
    }

    info!(
        node_id = %config.node_id,
        tick_interval_secs = config.sequences.tick_interval_secs,
        batch_limit = config.sequences.batch_limit,
        worker_concurrency = config.sequences.worker_concurrency,
        max_attempts = config.delivery.max_attempts,
        "Configuration loaded"
    );

    if config.metrics.enabled {
        if let Err(e) = start_metrics(&config) {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    let sequences = InMemorySequenceStore::new();
    let enrollments = InMemoryEnrollmentStore::new();
    let recipients = InMemoryRecipients::new();
    let renderer = TemplateRenderer::new();
    let provider = Arc::new(LoggingProvider::new(cli.sender));
    let event_sink: Arc<dyn EventSink> = Arc::new(TracingSink::new(config.node_id.clone()));

    let retries = Arc::new(
        DeliveryRetryManager::new(
            Arc::new(InMemoryAttemptStore::new()),
            provider.clone(),
            RetryPolicy::from_config(&config.delivery),
            config.sequences.provider_timeout(),
        )
        .with_event_sink(event_sink.clone()),
    );
    let advancer = Arc::new(
        StepAdvancer::new(
            Arc::new(sequences.clone()),
            Arc::new(enrollments.clone()),
            Collaborators {
                recipients: Arc::new(recipients.clone()),
                signals: Arc::new(recipients.clone()),
                renderer: Arc::new(renderer.clone()),
                provider,
            },
            retries.clone(),
            config.sequences.clone(),
        )
        .with_event_sink(event_sink.clone()),
    );

    if cli.demo {
        let enroller = TriggerEnroller::new(
            Arc::new(sequences.clone()),
            Arc::new(enrollments.clone()),
            Arc::new(recipients.clone()),
            Arc::new(recipients.clone()),
            Schedule::from_config(&config.sequences),
        )
        .with_event_sink(event_sink);
        seed_demo_sequences(&sequences, &renderer).await?;
        seed_demo_recipients(&recipients, &enroller).await?;
    }

    let scheduler = SequenceScheduler::new(
        Arc::new(enrollments),
        advancer,
        retries,
        config.sequences.clone(),
        &config.delivery,
    );

    if cli.once {
        let report = scheduler.tick(Utc::now()).await?;
        info!(?report, "Single tick finished");
        return Ok(());
    }

    info!("Sequence worker is ready");
    scheduler
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await;

    info!("Sequence worker stopped");
    Ok(())
}

fn start_metrics(config: &AppConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.metrics.host.parse()?, config.metrics.port);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(port = config.metrics.port, "Metrics exporter started");
    Ok(())
}

async fn seed_demo_recipients(
    recipients: &InMemoryRecipients,
    enroller: &TriggerEnroller,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let demo = [
        ("demo-ada", "ada@example.com", "Ada", true),
        ("demo-grace", "grace@example.com", "Grace", false),
        ("demo-linus", "linus@example.com", "Linus", true),
    ];
    for (id, email, first_name, trial) in demo {
        recipients.upsert(Recipient::new(id, email).with_attribute("first_name", first_name));
        enroller.enroll(id, &TriggerType::Signup, now).await?;
        if trial {
            recipients.add_tag(id, "trial");
            enroller
                .enroll(id, &TriggerType::TagAdded { tag: "trial".to_string() }, now)
                .await?;
        }
    }
    info!(count = demo.len(), "Demo recipients enrolled");
    Ok(())
}
