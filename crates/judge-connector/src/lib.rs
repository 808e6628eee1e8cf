//! Judge connector: keeps a session with each configured dispatcher,
//! feeds received work into a bounded worker pool, syncs problem data
//! into a local cache and streams ordered progress back.

pub mod cache;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod languages;
pub mod normalize;
pub mod queue;
pub mod scratch;
pub mod session;
pub mod sysinfo;
pub mod task;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use crate::cache::DataCache;
use crate::config::Config;
use crate::dispatch::DispatchClient;
use crate::engine::ExecutionEngine;
use crate::queue::WorkerPool;
use crate::scratch::{NoMount, ScratchMount, TmpfsMount};
use crate::session::{Session, SessionSettings};
use crate::task::TaskEnv;

pub use crate::error::JudgeError;

/// Run every host session until `shutdown` flips, then let queued and
/// in-flight tasks wind down.
pub async fn run(
    config: Config,
    engine: Arc<dyn ExecutionEngine>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    std::fs::create_dir_all(&config.tmp_dir)
        .with_context(|| format!("failed to create {}", config.tmp_dir.display()))?;
    std::fs::create_dir_all(&config.cache_dir)
        .with_context(|| format!("failed to create {}", config.cache_dir.display()))?;

    let mounter: Arc<dyn ScratchMount> = if config.tmpfs {
        Arc::new(TmpfsMount)
    } else {
        Arc::new(NoMount)
    };
    let cache = Arc::new(DataCache::new(&config.cache_dir));
    let (queue, pool) = WorkerPool::start(config.concurrency, config.queue_capacity);

    let mut sessions = Vec::with_capacity(config.hosts.len());
    for host in &config.hosts {
        let client = Arc::new(DispatchClient::new(host)?);
        let env = Arc::new(TaskEnv {
            host: host.host.clone(),
            tmp_root: config.tmp_dir.clone(),
            tmpfs_size: config.tmpfs_size.clone(),
            detail: host.detail,
            debug: config.debug,
            cache: Arc::clone(&cache),
            source: client.clone(),
            engine: Arc::clone(&engine),
            mounter: Arc::clone(&mounter),
        });
        tokio::spawn(
            Arc::clone(&client).keepalive(config.keepalive_interval(), shutdown.clone()),
        );
        let session = Session::new(client, env, queue.clone(), SessionSettings::new(&config, host));
        sessions.push(tokio::spawn(session.run(shutdown.clone())));
        info!(host = %host.host, url = %host.server_url, "session started");
    }
    drop(queue);

    for session in sessions {
        let _ = session.await;
    }
    info!("all sessions stopped, waiting for workers");
    pool.join().await;
    Ok(())
}
