//! `davq-node`: a server node running the dispatch loops, the heartbeat and
//! the maintenance cycles until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;

use davq_core::{Clock, SystemClock};
use davq_infra::config::default_sources;
use davq_infra::{
    NodeRegistry, PostgresDatabase, ServerConfig, WorkDispatcher, install_schema, load_config,
};
use davq_observability::LogFormat;
use davq_queue::{Database, InMemoryLockCache, LockCache, Services};
use davq_work::{LoggingNotifier, Notifier, schedule_group_cacher, schedule_revision_cleanup};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config(default_sources()).context("failed to load configuration")?;
    davq_observability::init(config.log_format.parse().unwrap_or(LogFormat::Json));
    tracing::info!(config = ?config, "starting node");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let postgres = PostgresDatabase::connect(&config.database_url, config.max_connections)
        .await
        .context("failed to connect to the database")?;

    let registry = Arc::new(davq_work::registry());
    install_schema(postgres.pool(), &registry.tables())
        .await
        .context("failed to install schema")?;
    let database: Arc<dyn Database> = Arc::new(postgres);

    let node = Arc::new(NodeRegistry::for_current_process(
        Arc::clone(&database),
        Arc::clone(&clock),
        config.hostname.clone(),
        config.port,
    ));
    node.register().await.context("failed to register node")?;
    let heartbeat = Arc::clone(&node).spawn_heartbeat(config.queue.heartbeat_interval);

    let services = Services::new()
        .with::<Arc<dyn Notifier>>(Arc::new(LoggingNotifier))
        .with(lock_cache(&config, &clock)?);

    let dispatcher = Arc::new(
        WorkDispatcher::new(
            Arc::clone(&database),
            registry,
            Arc::clone(&clock),
            config.queue.clone(),
        )
        .with_services(services),
    );
    seed_maintenance(&dispatcher).await?;

    let handle = Arc::clone(&dispatcher).spawn();
    tracing::info!(loops = handle.loops(), "node running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    handle.shutdown().await;
    heartbeat.stop().await;
    node.unregister().await.context("failed to unregister node")?;
    let stats = serde_json::to_string(&dispatcher.stats())?;
    tracing::info!(stats = %stats, "node stopped");
    Ok(())
}

/// Lock cache shared with other nodes when Redis is configured.
fn lock_cache(
    config: &ServerConfig,
    clock: &Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn LockCache>> {
    match config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        Some(url) => {
            let cache = davq_infra::RedisLockCache::new(url).context("invalid redis url")?;
            Ok(Arc::new(cache))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            tracing::warn!("redis_url set but built without the redis feature; locks are local");
            Ok(Arc::new(InMemoryLockCache::new(Arc::clone(clock))))
        }
        None => Ok(Arc::new(InMemoryLockCache::new(Arc::clone(clock)))),
    }
}

/// Make sure every self-rescheduling cycle has a pending record.
async fn seed_maintenance(dispatcher: &WorkDispatcher) -> anyhow::Result<()> {
    let queuer = dispatcher.queuer();
    let mut txn = dispatcher.database().begin().await?;
    schedule_revision_cleanup(&*queuer, &mut *txn).await?;
    schedule_group_cacher(&*queuer, &mut *txn).await?;
    txn.commit().await?;
    Ok(())
}
