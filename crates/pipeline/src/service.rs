//! Ingest service and main loop for hlsforge
//!
//! Queue front-end for uploads. Requests are processed one at a time; each
//! runs through the orchestrator and, when a catalog is attached, the
//! published asset is registered under the requested title and owner.

use crate::catalog::{Catalog, CatalogError, Registration, Visibility};
use crate::config::{Config, ConfigError};
use crate::exec::CommandRunner;
use crate::orchestrator::{JobError, PublishedAsset, TranscodeOrchestrator};
use crate::progress::{new_shared_progress, SharedProgress};
use crate::startup::{run_startup_checks, StartupError};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

const QUEUE_CAPACITY: usize = 100;

/// Error type for service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// The transcode job failed
    #[error("Job failed: {0}")]
    Job(#[from] JobError),

    /// The asset was published but could not be registered
    #[error("Catalog registration failed: {0}")]
    Catalog(#[from] CatalogError),

    /// The queue no longer accepts requests
    #[error("ingest queue is closed")]
    Closed,
}

/// One upload waiting to be transcoded
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub source: PathBuf,
    /// Empty means the full planned ladder
    pub qualities: Vec<String>,
    /// Defaults to the source file stem
    pub title: Option<String>,
    pub owner: String,
    pub visibility: Visibility,
}

impl IngestRequest {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            qualities: Vec::new(),
            title: None,
            owner: "admin".to_string(),
            visibility: Visibility::Private,
        }
    }

    fn title(&self) -> String {
        self.title.clone().unwrap_or_else(|| {
            self.source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "untitled".to_string())
        })
    }
}

type Reply = oneshot::Sender<Result<PublishedAsset, ServiceError>>;

/// Service state containing all runtime components
pub struct IngestService {
    orchestrator: Arc<TranscodeOrchestrator>,
    catalog: Option<Arc<dyn Catalog>>,
    progress: SharedProgress,
    /// `None` once the queue is closed
    tx: Mutex<Option<mpsc::Sender<(IngestRequest, Reply)>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<(IngestRequest, Reply)>>,
}

impl IngestService {
    /// Run startup checks, then build the service
    pub fn new(cfg: &Config, runner: Arc<dyn CommandRunner>) -> Result<Self, ServiceError> {
        cfg.validate()?;
        run_startup_checks(cfg, runner.as_ref())?;
        Ok(Self::new_without_checks(cfg, runner))
    }

    /// Build the service without preflight checks
    pub fn new_without_checks(cfg: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        let progress = new_shared_progress();
        let orchestrator = Arc::new(TranscodeOrchestrator::new(cfg, runner, progress.clone()));
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);

        Self {
            orchestrator,
            catalog: None,
            progress,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn orchestrator(&self) -> &TranscodeOrchestrator {
        &self.orchestrator
    }

    pub fn progress(&self) -> SharedProgress {
        self.progress.clone()
    }

    /// Queue a request; the receiver resolves once it has been processed
    pub async fn submit(
        &self,
        request: IngestRequest,
    ) -> Result<oneshot::Receiver<Result<PublishedAsset, ServiceError>>, ServiceError> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| ServiceError::Closed)?
            .clone()
            .ok_or(ServiceError::Closed)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.progress.write().await.queue_len += 1;
        if tx.send((request, reply_tx)).await.is_err() {
            let mut progress = self.progress.write().await;
            progress.queue_len = progress.queue_len.saturating_sub(1);
            return Err(ServiceError::Closed);
        }
        Ok(reply_rx)
    }

    /// Stop accepting requests. Already queued requests are still processed.
    pub fn close(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }

    /// Queue `requests`, close the queue and process them, returning one
    /// result per request in order.
    ///
    /// Submission runs alongside the main loop, so any number of requests
    /// fits through the bounded queue.
    pub async fn ingest_all(
        &self,
        requests: Vec<IngestRequest>,
    ) -> Vec<Result<PublishedAsset, ServiceError>> {
        let feed = async {
            let mut replies = Vec::with_capacity(requests.len());
            for request in requests {
                replies.push(self.submit(request).await);
            }
            self.close();
            replies
        };
        let (replies, ()) = tokio::join!(feed, self.run());

        let mut results = Vec::with_capacity(replies.len());
        for reply in replies {
            results.push(match reply {
                Ok(rx) => rx.await.unwrap_or(Err(ServiceError::Closed)),
                Err(e) => Err(e),
            });
        }
        results
    }

    /// Run the main loop until the queue is closed and drained
    pub async fn run(&self) {
        let mut rx = self.rx.lock().await;
        while let Some((request, reply)) = rx.recv().await {
            {
                let mut progress = self.progress.write().await;
                progress.queue_len = progress.queue_len.saturating_sub(1);
            }

            let result = self.process(request).await;
            if reply.send(result).is_err() {
                warn!("ingest requester went away before the result was ready");
            }
        }
        info!("ingest queue drained");
    }

    async fn process(&self, request: IngestRequest) -> Result<PublishedAsset, ServiceError> {
        info!(source = %request.source.display(), "processing upload");
        let asset = self
            .orchestrator
            .transcode(&request.source, &request.qualities)
            .await?;

        if let Some(catalog) = &self.catalog {
            let registration = Registration::from_published(
                &asset,
                &request.title(),
                &request.owner,
                request.visibility,
            );
            if let Err(e) = catalog.register(registration) {
                error!(
                    short_id = %asset.short_id,
                    error = %e,
                    "asset published but not registered; recover it with an orphan import"
                );
                return Err(e.into());
            }
            info!(short_id = %asset.short_id, owner = %request.owner, "asset registered");
        }

        Ok(asset)
    }
}
