use pds_core::config::Config;
use pds_core::types::{Signal, SyncDir};
use pds_drive::AuthProvider;
use pds_store::Store;
use pds_watch::{ExcludeSet, LiveWatcher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::processor::Processor;
use crate::SyncRootResolver;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] pds_store::Error),
    #[error("drive login failed: {0}")]
    Drive(#[from] pds_drive::DriveError),
    #[error("watcher error: {0}")]
    Watch(#[from] pds_watch::Error),
    #[error("classifier error: {0}")]
    Classify(#[from] pds_classify::Error),
    #[error("config error: {0}")]
    Config(#[from] pds_core::error::Error),
}

/// CLI-only flags that are never written back to the config file and never
/// change once the engine starts (§4.6, §7.2 `start`).
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub no_watch: bool,
    pub start_paused: bool,
}

/// The Engine (C7): owns the Store, the logged-in DriveClient and the
/// Processor, and drives the control loop that ties the Watcher and
/// Classifier into the job queue (§4.6).
pub struct Engine {
    store: Store,
    processor: Arc<Processor>,
    roots: SyncRootResolver,
    exclude: RwLock<ExcludeSet>,
    paused: AtomicBool,
    stop_requested: AtomicBool,
    no_watch: bool,
    config: Mutex<Config>,
    config_path: PathBuf,
}

impl Engine {
    /// Exposed for the metrics endpoint (queue depth per `JobState`).
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Exposed for the metrics endpoint (per-error-class retry counters).
    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    pub async fn bootstrap(
        config: Config,
        config_path: PathBuf,
        options: EngineOptions,
        auth: Arc<dyn AuthProvider>,
    ) -> Result<Arc<Self>> {
        let store = Store::open(&config.state_db_path).await?;
        let recovered = store.startup_recovery().await?;
        if recovered > 0 {
            info!(recovered, "startup recovery: reset in-flight jobs to PENDING");
        }

        let drive = login_with_retry(auth.as_ref()).await?;
        let exclude = ExcludeSet::compile(&config.exclude_patterns)?;
        let roots = SyncRootResolver::new(config.sync_dirs.clone());
        let processor = Processor::new(
            store.clone(),
            drive,
            config.sync_concurrency,
            roots.clone(),
            config.dry_run,
        );

        Ok(Arc::new(Self {
            store,
            processor,
            roots,
            exclude: RwLock::new(exclude),
            paused: AtomicBool::new(options.start_paused),
            stop_requested: AtomicBool::new(false),
            no_watch: options.no_watch,
            config: Mutex::new(config),
            config_path,
        }))
    }

    /// Run until a Stop signal arrives (via the in-store signal queue or an
    /// OS SIGINT/SIGTERM), then drain in-flight work for up to `grace`
    /// before returning.
    pub async fn run(self: &Arc<Self>, grace: Duration) -> Result<()> {
        self.run_initial_scan().await?;

        let mut live_handles = Vec::new();
        if !self.no_watch {
            for sync_dir in self.roots.sync_dirs().to_vec() {
                let this = Arc::clone(self);
                live_handles.push(tokio::spawn(async move {
                    if let Err(e) = this.run_live_watch(sync_dir).await {
                        error!("live watcher exited: {e}");
                    }
                }));
            }
        }

        let os_signal = os_shutdown_signal();
        tokio::pin!(os_signal);

        let mut tick = tokio::time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                _ = &mut os_signal => {
                    info!("received shutdown signal");
                    break;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.drain_signals().await {
                        error!("signal drain failed: {e}");
                    }
                    if self.stop_requested.load(Ordering::Relaxed) {
                        info!("stop requested via signal queue");
                        break;
                    }
                    if !self.paused.load(Ordering::Relaxed) {
                        self.processor.tick().await;
                    }
                }
            }
        }

        for handle in live_handles {
            handle.abort();
        }

        self.wait_for_drain(grace).await;
        Ok(())
    }

    async fn run_initial_scan(&self) -> Result<()> {
        let exclude = self.exclude.read().unwrap().clone();
        let rename_window_ms = self.config.lock().await.rename_window_ms;
        for sync_dir in self.roots.sync_dirs() {
            let root = PathBuf::from(&sync_dir.source_path);
            let current = pds_watch::scan_dir(&root, &exclude)?;
            let known = pds_classify::known_tokens_under(&self.store, &sync_dir.source_path).await?;
            let diffed = pds_watch::diff_scan(&current, &known);
            if diffed.is_empty() {
                continue;
            }
            let job_ids =
                pds_classify::classify_and_persist(&self.store, sync_dir, &diffed, rename_window_ms).await?;
            info!(count = job_ids.len(), root = %sync_dir.source_path, "initial scan enqueued jobs");
        }
        Ok(())
    }

    async fn run_live_watch(self: &Arc<Self>, sync_dir: SyncDir) -> Result<()> {
        let settle = Duration::from_millis(self.config.lock().await.write_settle_ms);
        let exclude = self.exclude.read().unwrap().clone();
        let root = PathBuf::from(&sync_dir.source_path);

        let (_watcher, mut batches) = LiveWatcher::start(root, exclude, settle)?;
        while let Some(batch) = batches.recv().await {
            let known = pds_classify::known_tokens_under(&self.store, &sync_dir.source_path).await?;
            let diffed: Vec<_> = batch
                .iter()
                .filter_map(|change| pds_watch::diff_live(change, &known))
                .collect();
            if diffed.is_empty() {
                continue;
            }
            let rename_window_ms = self.config.lock().await.rename_window_ms;
            match pds_classify::classify_and_persist(&self.store, &sync_dir, &diffed, rename_window_ms).await {
                Ok(ids) => info!(count = ids.len(), "live batch enqueued jobs"),
                Err(e) => error!("failed to classify live batch: {e}"),
            }
        }
        Ok(())
    }

    async fn drain_signals(&self) -> Result<()> {
        for signal in self.store.receive_signals().await? {
            match signal {
                Signal::Pause => {
                    self.paused.store(true, Ordering::Relaxed);
                    info!("paused");
                }
                Signal::Resume => {
                    self.paused.store(false, Ordering::Relaxed);
                    info!("resumed");
                }
                Signal::Stop => {
                    // `run()`'s select loop checks this flag right after
                    // draining signals and breaks out of the control loop.
                    self.stop_requested.store(true, Ordering::Relaxed);
                }
                Signal::Reload => {
                    if let Err(e) = self.reload_from_disk().await {
                        error!("reload failed: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    async fn reload_from_disk(&self) -> Result<()> {
        let new_config = Config::load(&self.config_path)?;
        self.apply_reload(new_config).await
    }

    /// Apply a new config: `sync_concurrency` and `exclude_patterns` take
    /// effect immediately; a `sync_dirs` change is logged and ignored,
    /// since the live watchers were already spawned against the old list.
    pub async fn apply_reload(&self, new_config: Config) -> Result<()> {
        let mut current = self.config.lock().await;

        if current.sync_dirs != new_config.sync_dirs {
            warn!("sync_dirs changed in config reload; restart required to take effect");
        }

        if current.sync_concurrency != new_config.sync_concurrency {
            self.processor.resize(new_config.sync_concurrency);
            info!(
                from = current.sync_concurrency,
                to = new_config.sync_concurrency,
                "sync_concurrency reloaded"
            );
        }

        if current.exclude_patterns != new_config.exclude_patterns {
            let exclude = ExcludeSet::compile(&new_config.exclude_patterns)?;
            *self.exclude.write().unwrap() = exclude;
            info!("exclude_patterns reloaded");
        }

        current.sync_concurrency = new_config.sync_concurrency;
        current.exclude_patterns = new_config.exclude_patterns;
        current.write_settle_ms = new_config.write_settle_ms;
        current.rename_window_ms = new_config.rename_window_ms;
        current.dry_run = new_config.dry_run;
        Ok(())
    }

    async fn wait_for_drain(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.processor.idle() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        warn!("shutdown grace period elapsed with jobs still in flight");
    }
}

/// Retry `login` with the fixed backoff sequence from §6 on a connection
/// failure; any other error is fatal to startup.
async fn login_with_retry(
    auth: &dyn AuthProvider,
) -> std::result::Result<Arc<dyn pds_drive::DriveClient>, pds_drive::DriveError> {
    const BACKOFF_SECS: [u64; 5] = [1, 4, 16, 64, 256];

    let mut attempt = 0;
    loop {
        match auth.login().await {
            Ok(client) => return Ok(client),
            Err(pds_drive::DriveError::ConnectionReset(msg)) if attempt < BACKOFF_SECS.len() => {
                warn!(attempt, "login connection failed: {msg}, retrying");
                tokio::time::sleep(Duration::from_secs(BACKOFF_SECS[attempt])).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn os_shutdown_signal() -> impl std::future::Future<Output = ()> {
    async {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to install SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
