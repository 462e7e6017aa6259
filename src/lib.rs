pub mod audio;
pub mod config;
pub mod database;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod server;
pub mod speakers;
pub mod status;
pub mod uploader;

pub use config::Config;
pub use error::AppError;

use database::Database;
use ingest::IngestStore;
use pipeline::stage::StageModels;
use pipeline::PipelineRunner;
use speakers::SpeakerRegistry;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Install the tracing subscriber, honoring `RUST_LOG`. Call once from the
/// embedding application's entry point.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// The assembled service: database, ingestion store, speaker registry, and
/// pipeline scheduler behind the HTTP surface.
///
/// The inference models are injected by the embedding application; this crate
/// treats them as opaque stage functions.
pub struct Meetscribe {
    pub db: Arc<Database>,
    pub store: Arc<IngestStore>,
    pub registry: Arc<SpeakerRegistry>,
    runner: Arc<PipelineRunner>,
    cancel: CancellationToken,
}

impl Meetscribe {
    pub fn init(data_dir: &Path, config: Config, models: StageModels) -> Result<Self, AppError> {
        std::fs::create_dir_all(data_dir)?;
        let db = Arc::new(Database::new(&data_dir.join("meetscribe.db"))?);
        let store = Arc::new(IngestStore::new(db.clone(), data_dir)?);
        let registry = Arc::new(SpeakerRegistry::new(db.clone()));
        let config = Arc::new(config);
        let runner = Arc::new(PipelineRunner::new(
            db.clone(),
            config,
            models,
            registry.clone(),
        ));

        log::info!("Meetscribe initialized at {:?}", data_dir);

        Ok(Self {
            db,
            store,
            registry,
            runner,
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the background pipeline scheduler. Call once.
    pub fn start_scheduler(&self) -> tokio::task::JoinHandle<()> {
        let runner = self.runner.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            runner.run_scheduler(cancel).await;
        })
    }

    /// The ingestion/status HTTP router.
    pub fn router(&self) -> axum::Router {
        server::router(server::AppState {
            db: self.db.clone(),
            store: self.store.clone(),
        })
    }

    /// Bind and serve the HTTP surface until shutdown.
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), AppError> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        log::info!("Listening on {}", addr);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Re-trigger a failed run from its failed stage.
    pub fn resume_run(&self, run_id: i64) -> Result<(), AppError> {
        pipeline::resume_run(&self.db, run_id)
    }

    /// Request shutdown. Queued runs stop cleanly; an in-progress stage
    /// finishes first and cancellation lands at the next stage boundary.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
