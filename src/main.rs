use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use job_coordinator::{FileUiGenerator, TrainingCoordinator};
use luantra::{routes, AppState, LuantraConfig};
use ml_service::{BlobStore, GcsBlobStore, LocalBlobStore, VertexClient};
use state_store::{spawn_autosave, SessionStore};

#[derive(Parser, Debug)]
#[command(name = "luantra", version, about = "Luantra training platform server")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "LUANTRA_CONFIG", default_value = "luantra.toml")]
    config: PathBuf,

    /// Override the bind address from the config
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    info!("Luantra {} starting up", luantra::VERSION);

    let mut config = LuantraConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    info!("Configuration loaded:");
    info!("  - Bind: {}", config.server.bind);
    info!("  - State file: {}", config.server.state_file.display());
    info!("  - Vertex project: {} ({})", config.vertex.project_id, config.vertex.region);
    info!("  - Poll interval: {}s", config.coordinator.poll_interval_secs);

    let store = Arc::new(
        SessionStore::load(&config.server.state_file)
            .await
            .context("loading platform state")?,
    );

    let service = Arc::new(VertexClient::new(config.vertex.clone()).context("creating Vertex AI client")?);
    let blobs: Arc<dyn BlobStore> = match &config.server.gcs_bucket {
        Some(bucket) => Arc::new(
            GcsBlobStore::new(bucket.clone(), config.vertex.access_token.clone())
                .context("creating GCS client")?,
        ),
        None => {
            warn!(
                "No GCS bucket configured, keeping uploads in {}",
                config.server.upload_dir.display()
            );
            Arc::new(LocalBlobStore::new(config.server.upload_dir.clone()))
        }
    };
    let ui = Arc::new(FileUiGenerator::new(config.server.ui_dir.clone()));

    let coordinator = Arc::new(TrainingCoordinator::new(
        Arc::clone(&store),
        service,
        ui,
        config.coordinator.clone(),
    ));
    let sweep = coordinator.start_background().await;
    let autosave = spawn_autosave(Arc::clone(&store), config.coordinator.autosave_interval());

    let bind = config.server.bind.clone();
    let state = AppState::new(config, Arc::clone(&store), coordinator, blobs);
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!("Listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            warn!("Shutdown signal received");
        })
        .await
        .context("server error")?;

    sweep.abort();
    autosave.abort();
    if let Err(e) = store.save().await {
        error!("Final state save failed: {}", e);
    }

    info!("Luantra shutdown complete");
    Ok(())
}
