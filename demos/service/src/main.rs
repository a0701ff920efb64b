use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use clap::Parser;
use jobkeeper::{prelude::*, store::memory::InMemoryStore};
use jobkeeper_redis::RedisStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Runs a job queue with monitoring and scheduled maintenance")]
struct Args {
    /// Redis used to persist jobs, alerts and metrics. State is kept in memory when not set.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,
    #[arg(long, env = "JOBKEEPER_NAMESPACE", default_value = "jobkeeper")]
    namespace: String,
    #[arg(long, env = "JOBKEEPER_POLL_INTERVAL_MS", default_value_t = 5000)]
    poll_interval_ms: u64,
    #[arg(long, env = "JOBKEEPER_MAX_CONCURRENT_JOBS", default_value_t = 5)]
    max_concurrent_jobs: usize,
    #[arg(long, env = "JOBKEEPER_MONITOR_INTERVAL_SECS", default_value_t = 60)]
    monitor_interval_secs: u64,
    /// Comma separated addresses emailed on critical alerts.
    #[arg(long, env = "JOBKEEPER_ALERT_RECIPIENTS", value_delimiter = ',')]
    alert_recipients: Vec<String>,
    #[arg(long, env = "JOBKEEPER_MAIL_FROM", default_value = "noreply@example.com")]
    mail_from: String,
    /// Queue the daily maintenance jobs once at startup.
    #[arg(long)]
    maintenance_on_start: bool,
}

/// Stands in for the application specific jobs, which only log what they would do.
struct Simulated;

#[async_trait]
impl Processor for Simulated {
    async fn process(&self, job: &Job) -> Result<serde_json::Value, BoxError> {
        let result = match &job.payload {
            JobPayload::RefreshLeaderboard => serde_json::json!({ "refreshed": true }),
            JobPayload::WarmCache { keys } => serde_json::json!({ "warmed": keys }),
            JobPayload::AggregateAnalytics { window_hours } => {
                serde_json::json!({ "window_hours": window_hours })
            }
            other => return Err(format!("unexpected {} job", other.kind()).into()),
        };
        tracing::info!(job_id = %job.id, kind = %job.kind(), "Processed {}", job.kind());
        Ok(result)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let store: Arc<dyn Store> = match &args.redis_url {
        Some(url) => Arc::new(RedisStore::connect(url).await?),
        None => {
            tracing::warn!("No redis configured, state will not survive a restart");
            Arc::new(InMemoryStore::new())
        }
    };
    let keyspace = Keyspace::new(&args.namespace);

    let queue = JobQueue::with_store(
        QueueConfig::default()
            .with_poll_interval(Duration::from_millis(args.poll_interval_ms))
            .with_max_concurrent_jobs(args.max_concurrent_jobs)
            .with_keyspace(keyspace.clone()),
        store.clone(),
    );
    let mailer: Arc<dyn Mailer> = Arc::new(LogMailer);
    EmailProcessor::new(mailer.clone())
        .with_from(&args.mail_from)
        .register(&queue)?;
    queue.register_processor(
        JobKind::Cleanup,
        Arc::new(CleanupProcessor::new(store.clone(), keyspace.clone())),
    )?;
    let simulated = Arc::new(Simulated);
    for kind in [
        JobKind::RefreshLeaderboard,
        JobKind::WarmCache,
        JobKind::AggregateAnalytics,
    ] {
        queue.register_processor(kind, simulated.clone())?;
    }

    let recovered = queue.recover().await?;
    tracing::info!(recovered, "Queue ready");
    queue.start()?;

    let monitor = Monitor::builder(queue.clone())
        .with_config(
            MonitorConfig::default()
                .with_interval(Duration::from_secs(args.monitor_interval_secs))
                .with_alert_recipients(args.alert_recipients.clone())
                .with_alert_from(&args.mail_from),
        )
        .with_store(store.clone())
        .with_database(store.clone())
        .with_mailer(mailer)
        .build();
    monitor.restore().await?;
    monitor.start()?;

    let token = CancellationToken::new();
    let maintenance = MaintenanceScheduler::new(queue.clone())?.spawn(token.clone());
    if args.maintenance_on_start {
        daily_maintenance(&queue).await?;
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    token.cancel();
    maintenance.await?;
    monitor.stop().await?;
    queue.stop().await?;
    println!("{}", monitor.generate_health_report()?);
    Ok(())
}
