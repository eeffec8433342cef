use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use kiln_core::{
    caption::{self, CaptionGenerator, Captioner},
    imagine::{self, ImageGenerator, ImagePipeline},
    synthesize::{self, SpeechSynthesizer, Synthesizer},
    transcribe::{self, SpeechRecognizer, Transcriber},
    video::{VideoGenerator, VideoPipeline},
    DeviceMap, HealthChecker, InferencePool, ModelLike, ModelManager, ServiceKind, Settings,
};
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::Gateway;

mod api;
mod error;

#[derive(Parser, Debug)]
#[command(author, version, about = "Kiln model inference server")]
struct Args {
    /// Service to expose
    #[arg(long, env = "SERVICE")]
    service: ServiceKind,

    /// Hub repository of the model, defaults to the service's standard model
    #[arg(long, env = "MODEL_ID")]
    model: Option<String>,

    /// cpu, auto, cuda[:N], metal[:N] or a bare ordinal
    #[arg(long, env = "DEVICE", default_value = "auto")]
    device: DeviceMap,

    #[arg(long, env = "HUGGINGFACE_HUB_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,

    /// Host address to bind the server to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Upper bound on inference calls running at once
    #[arg(long, env = "MAX_CONCURRENT_GENERATIONS", default_value_t = kiln_core::config::DEFAULT_MAX_CONCURRENT_GENERATIONS)]
    max_concurrent_generations: usize,

    /// Seconds a request waits for inference, 0 waits forever
    #[arg(long, env = "GENERATION_TIMEOUT", default_value_t = kiln_core::config::DEFAULT_GENERATION_TIMEOUT_SECS)]
    generation_timeout: u64,

    /// Prefix every route is served under
    #[arg(long, env = "ROOT_PATH")]
    root_path: Option<String>,
}

impl Args {
    fn settings(&self) -> Settings {
        let defaults = Settings::new(self.service);
        Settings {
            model_id: self.model.clone().unwrap_or(defaults.model_id),
            device_map: self.device,
            hf_token: self.hf_token.clone(),
            max_concurrent_generations: self.max_concurrent_generations,
            generation_timeout: (self.generation_timeout > 0)
                .then(|| Duration::from_secs(self.generation_timeout)),
            ..defaults
        }
    }
}

fn init_tracing(level: &str) {
    let level = level.to_ascii_lowercase();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("kiln_server={level},kiln_core={level},tower_http={level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let settings = args.settings();
    info!(
        "Starting {} with model {} on {}",
        settings.service.display_name(),
        settings.model_id,
        settings.device_map
    );
    let pool = InferencePool::new(
        settings.max_concurrent_generations,
        settings.generation_timeout,
    );
    let root_path = args.root_path.as_deref();
    let model_id = settings.model_id.as_str();

    let bind_address = format!("{}:{}", args.host, args.port);

    match settings.service {
        ServiceKind::Caption => {
            let models = Arc::new(ModelManager::<dyn Captioner>::new(model_id));
            models
                .initialize(&settings, |api, device_map| {
                    kiln_core::load_captioner(model_id, api, device_map)
                })
                .await?;
            let checker = HealthChecker::new(&settings, models.clone())
                .with_extra("supported_formats", caption::SUPPORTED_IMAGE_FORMATS);
            let generator = Arc::new(CaptionGenerator::new(Arc::clone(&models), pool));
            let app = api::create_router(Gateway::Caption(generator), checker, root_path);
            serve(&bind_address, app, models).await
        }
        ServiceKind::Imagine => {
            let models = Arc::new(ModelManager::<dyn ImagePipeline>::new(model_id));
            models
                .initialize(&settings, |api, device_map| {
                    kiln_core::load_image_pipeline(model_id, api, device_map)
                })
                .await?;
            let checker = HealthChecker::new(&settings, models.clone())
                .with_extra("default_width", imagine::DEFAULT_WIDTH)
                .with_extra("default_height", imagine::DEFAULT_HEIGHT);
            let generator = Arc::new(ImageGenerator::new(Arc::clone(&models), pool));
            let app = api::create_router(Gateway::Imagine(generator), checker, root_path);
            serve(&bind_address, app, models).await
        }
        ServiceKind::Transcribe => {
            let models = Arc::new(ModelManager::<dyn SpeechRecognizer>::new(model_id));
            models
                .initialize(&settings, |api, device_map| {
                    kiln_core::load_recognizer(model_id, api, device_map)
                })
                .await?;
            let checker = HealthChecker::new(&settings, models.clone())
                .with_extra("supported_formats", transcribe::SUPPORTED_AUDIO_FORMATS)
                .with_extra("chunk_duration_sec", transcribe::CHUNK_DURATION_SEC)
                .with_extra("target_sample_rate", transcribe::TARGET_SAMPLE_RATE);
            let transcriber = Arc::new(Transcriber::new(Arc::clone(&models), pool));
            let app = api::create_router(Gateway::Transcribe(transcriber), checker, root_path);
            serve(&bind_address, app, models).await
        }
        ServiceKind::Synthesize => {
            let models = Arc::new(ModelManager::<dyn SpeechSynthesizer>::new(model_id));
            models
                .initialize(&settings, |api, device_map| {
                    kiln_core::load_synthesizer(model_id, api, device_map)
                })
                .await?;
            let checker = HealthChecker::new(&settings, models.clone())
                .with_extra("supported_voices", synthesize::voice_names());
            let synthesizer = Arc::new(Synthesizer::new(Arc::clone(&models), pool));
            let app = api::create_router(Gateway::Synthesize(synthesizer), checker, root_path);
            serve(&bind_address, app, models).await
        }
        ServiceKind::Video => {
            let models = Arc::new(ModelManager::<dyn VideoPipeline>::new(model_id));
            models
                .initialize(&settings, |api, device_map| {
                    kiln_core::load_video_pipeline(model_id, api, device_map)
                })
                .await?;
            let checker = HealthChecker::new(&settings, models.clone())
                .with_extra("max_concurrent_generations", pool.max_concurrent())
                .with_extra(
                    "generation_timeout",
                    json!(pool.timeout().map(|t| t.as_secs())),
                );
            let generator = Arc::new(VideoGenerator::new(Arc::clone(&models), pool));
            let app = api::create_router(Gateway::Video(generator), checker, root_path);
            serve(&bind_address, app, models).await
        }
    }
}

/// Serves until a shutdown signal arrives, then releases the model.
async fn serve<R>(bind_address: &str, app: axum::Router, models: Arc<ModelManager<R>>) -> Result<()>
where
    R: ModelLike + ?Sized,
{
    let listener = TcpListener::bind(bind_address).await?;
    info!("Started server on {}", listener.local_addr()?);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    models.cleanup().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting graceful shutdown"),
        _ = terminate => info!("Received terminate signal, starting graceful shutdown"),
    }
}
