mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use reelflow_notion::{NotionClient, RateLimiter};
use reelflow_observability::{init_process_logging, ProcessKind};
use reelflow_registry::ChannelRegistry;
use reelflow_server::AppState;
use reelflow_store::TaskStore;
use reelflow_sync::{PushLoop, WebhookProcessor};
use reelflow_tools::ToolRunner;
use reelflow_vault::Vault;
use reelflow_worker::{Dispatcher, PipelineConfig, WorkerConfig, WorkerGate, WorkerLoop};
use reelflow_workspace::Workspace;

use config::DaemonConfig;

const QUOTA_RETENTION_DAYS: i64 = 7;
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let config = DaemonConfig::from_env()?;
    let (_log_guard, log_info) =
        init_process_logging(ProcessKind::Daemon, &config.logs_dir, 14)?;
    info!(logs_dir = %log_info.logs_dir, "logging initialized");

    // Infrastructure failures from here to the end of wiring are fatal;
    // everything after runs until shutdown and survives task-level errors.
    let vault = Arc::new(Vault::from_key_base64(&config.crypto_key).context("CRYPTO_KEY")?);

    let store = TaskStore::connect(&config.db_url).await.context("DB_URL")?;
    store.migrate().await?;

    let registry = ChannelRegistry::load(&config.channels_file, vault.clone())
        .await
        .context("channel configuration")?;
    for channel in registry.snapshot().await.iter() {
        store.upsert_channel(channel).await?;
    }

    let limiter = Arc::new(RateLimiter::planning_default());
    let notion = NotionClient::new(config.planning_api_token.clone(), limiter);
    let processor = Arc::new(WebhookProcessor::new(
        store.clone(),
        notion.clone(),
        registry.clone(),
    ));

    let shutdown = CancellationToken::new();
    let mut joins = Vec::new();

    // Initial sweep over the configured planning databases, so a restart
    // catches anything queued while we were down.
    for database_id in &config.planning_database_ids {
        match notion.query_database(database_id, None).await {
            Ok(results) => {
                let pages = results
                    .get("results")
                    .and_then(|r| r.as_array())
                    .cloned()
                    .unwrap_or_default();
                info!(database_id, pages = pages.len(), "startup sweep");
                for page in pages {
                    let Some(page_id) = page.get("id").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    if let Err(e) = processor.process_page(page_id).await {
                        warn!(page_id, error = %e, "startup sweep entry failed");
                    }
                }
            }
            Err(e) => warn!(database_id, error = %e, "startup sweep query failed"),
        }
    }

    // HTTP surface: webhook ingest and review actions.
    let server_state = AppState {
        store: store.clone(),
        processor: processor.clone(),
        webhook_secret: config.webhook_secret.clone(),
    };
    let bind_addr = config.bind_addr;
    let server_shutdown = shutdown.clone();
    joins.push(tokio::spawn(async move {
        tokio::select! {
            result = reelflow_server::serve(bind_addr, server_state) => {
                if let Err(e) = result {
                    error!(error = %e, "http server exited");
                }
            }
            _ = server_shutdown.cancelled() => {}
        }
    }));

    // Worker loops share one gate: the video ceiling and the image
    // exhaustion flag are process-local state.
    let gate = Arc::new(WorkerGate::new(
        store.clone(),
        config.quota_tz,
        config.max_concurrent_video,
        config.alert_webhook_url.clone(),
    ));
    let workspace = Workspace::new(&config.workspace_root);
    let tools = ToolRunner::new(&config.tools_dir, std::env::current_dir()?);

    for index in 0..config.worker_count {
        let dispatcher = Dispatcher::new(
            store.clone(),
            tools.clone(),
            workspace.clone(),
            registry.clone(),
            PipelineConfig::default(),
        );
        let worker = WorkerLoop::new(
            store.clone(),
            registry.clone(),
            dispatcher,
            gate.clone(),
            WorkerConfig {
                name: format!("{}-{index}", config.worker_name),
                poll_interval: config.poll_interval,
            },
            shutdown.clone(),
        );
        joins.push(tokio::spawn(worker.run()));
    }

    // Outward sync: authoritative state overwrites the planning side.
    let push = PushLoop::new(
        store.clone(),
        notion.clone(),
        config.sync_interval,
        shutdown.clone(),
    );
    joins.push(tokio::spawn(push.run()));

    // Stale-claim sweeper, on the same cadence the workers poll at. A row
    // orphaned by a crashed worker becomes claimable again on the first
    // claim round after it crosses the stale threshold, not an hour later.
    let sweeper_store = store.clone();
    let stale_after = config.stale_claim_after;
    let sweep_interval = config.poll_interval;
    let sweeper_shutdown = shutdown.clone();
    joins.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(sweep_interval) => {}
                _ = sweeper_shutdown.cancelled() => break,
            }
            match sweeper_store.reclaim_stale(stale_after).await {
                Ok(0) => {}
                Ok(n) => warn!(reclaimed = n, "stalled claims returned to the queue"),
                Err(e) => warn!(error = %e, "stale reclaim failed"),
            }
        }
    }));

    // Housekeeping: quota-row retention.
    let maintenance_store = store.clone();
    let maintenance_shutdown = shutdown.clone();
    joins.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {}
                _ = maintenance_shutdown.cancelled() => break,
            }
            match maintenance_store.quota_purge(QUOTA_RETENTION_DAYS).await {
                Ok(0) => {}
                Ok(n) => info!(purged = n, "old quota rows removed"),
                Err(e) => warn!(error = %e, "quota purge failed"),
            }
        }
    }));

    info!(workers = config.worker_count, addr = %config.bind_addr, "reelflow daemon up");

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown signal received, draining");
    shutdown.cancel();

    for join in joins {
        if let Err(e) = join.await {
            warn!(error = %e, "task join failed during shutdown");
        }
    }
    info!("shutdown complete");
    Ok(())
}
