mod args;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use serde_json::Value;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use leaseq_core::{EnqueueOptions, QueueName};
use leaseq_events::WakeBus;
use leaseq_infra::{PgNotifyWakeBus, PostgresJobStore, Queue, Settings};

use crate::args::{Args, Command};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    leaseq_observability::init();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                tracing::warn!(%error, "ctrl-c handler failed");
            }
            cancel.cancel();
        });
    }

    match run(args, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!("command failed: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, cancel: CancellationToken) -> Result<()> {
    let settings = Settings::from_env().context("reading configuration")?;
    let queue_name = match args.queue {
        Some(name) => QueueName::new(name).context("invalid --queue")?,
        None => settings.queue.clone(),
    };

    let store = PostgresJobStore::connect(&settings.database_url, 4)
        .await
        .context("connecting to Postgres")?;

    if let Command::InitSchema = args.command {
        store.ensure_schema().await.context("creating schema")?;
        return Ok(());
    }

    let wake = wake_bus(&settings, &store).await;
    let mut queue: Queue<Value> = Queue::new(
        queue_name,
        Arc::new(store.clone()),
        settings.queue_config,
    )?;
    if let Some(bus) = wake {
        queue = queue.with_wake_bus(bus);
    }

    match args.command {
        Command::InitSchema => {}
        Command::Stats => {
            let stats = queue.stats().await?;
            print_json(&stats)?;
        }
        Command::Enqueue {
            data,
            tag,
            priority,
            unique_tag,
        } => {
            let data: Value = serde_json::from_str(&data).context("payload is not JSON")?;
            let mut options = EnqueueOptions::new();
            if let Some(tag) = tag {
                options = options.tag(tag);
            }
            if let Some(priority) = priority {
                options = options.priority(priority);
            }
            if let Some(policy) = unique_tag {
                options = options.unique_tag(policy.into());
            }
            let job = queue.enqueue(data, options).await?;
            print_json(&job)?;
        }
        Command::Exhausted { limit } => {
            for job in queue.exhausted(limit).await? {
                print_json(&job)?;
            }
        }
        Command::Revive { id } => match queue.revive(id).await? {
            Some(job) => print_json(&job)?,
            None => anyhow::bail!("job {id} not found or still leased"),
        },
        Command::Cancel { id } => {
            let removed = queue.cancel(id).await?;
            tracing::info!(job_id = %id, removed, "cancel");
        }
        Command::CancelTag { tag } => {
            let removed = queue.cancel_by_tag(&tag).await?;
            tracing::info!(tag = %tag, removed, "cancel by tag");
        }
        Command::Drain { batch } => drain(&queue, batch, cancel).await?,
    }

    Ok(())
}

/// Prefer Redis when configured, otherwise `LISTEN`/`NOTIFY`. A missing bus
/// only costs latency, so failures are logged and ignored.
async fn wake_bus(settings: &Settings, store: &PostgresJobStore) -> Option<Arc<dyn WakeBus>> {
    if let Some(bus) = redis_wake_bus(settings) {
        return Some(bus);
    }
    match PgNotifyWakeBus::connect(store.pool().clone()).await {
        Ok(bus) => Some(Arc::new(bus)),
        Err(error) => {
            tracing::warn!(%error, "postgres wake bus unavailable; polling only");
            None
        }
    }
}

#[cfg(feature = "redis")]
fn redis_wake_bus(settings: &Settings) -> Option<Arc<dyn WakeBus>> {
    use leaseq_infra::RedisPubSubWakeBus;

    let url = settings.redis_url.as_ref()?;
    match RedisPubSubWakeBus::new(url, RedisPubSubWakeBus::DEFAULT_CHANNEL) {
        Ok(bus) => Some(Arc::new(bus)),
        Err(error) => {
            tracing::warn!(%error, "redis wake bus unavailable");
            None
        }
    }
}

#[cfg(not(feature = "redis"))]
fn redis_wake_bus(settings: &Settings) -> Option<Arc<dyn WakeBus>> {
    if settings.redis_url.is_some() {
        tracing::warn!("REDIS_URL set but built without the redis feature");
    }
    None
}

async fn drain(queue: &Queue<Value>, batch: usize, cancel: CancellationToken) -> Result<()> {
    let mut batches = queue.batch_consumer(batch, cancel);
    let mut drained = 0u64;

    while let Some(next) = batches.next().await {
        let jobs = match next {
            Ok(jobs) => jobs,
            // The consumer backs off on its own; keep going.
            Err(error) => {
                tracing::warn!(%error, "dequeue failed");
                continue;
            }
        };
        for job in &jobs {
            tracing::info!(
                job_id = %job.id,
                tag = job.tag.as_deref(),
                tries = job.tries,
                data = %job.data,
                "drained"
            );
        }
        queue.acknowledge_many(&jobs).await?;
        drained += jobs.len() as u64;
    }

    tracing::info!(queue = %queue.name(), drained, "drain stopped");
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
