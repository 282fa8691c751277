use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, info};

use crate::auth::TokenHolder;
use crate::clip::ClipSubsystem;
use crate::config::{Config, ZsadBackend};
use crate::health::HealthState;
use crate::http_client::{ApiClient, ReqwestTransport};
use crate::inference::{ClassifierBackend, InferenceDispatcher, NoneBackend, SiglipBackend, TritonBackend};
use crate::media::{frame_tap, OverlayUpdater, PipelineHandle};
use crate::signaling::SignalingClient;

/// Owns every component handle, built once at startup as a single
/// long-lived process. Components communicate through one-way channels
/// rather than calling back into each other.
pub struct Agent {
    config: Arc<Config>,
    pipeline: Arc<PipelineHandle>,
    overlay: Arc<OverlayUpdater>,
    dispatcher: Arc<InferenceDispatcher>,
    frame_rx: tokio::sync::mpsc::Receiver<crate::media::Frame>,
    signaling: SignalingClient,
    health: Arc<HealthState>,
}

impl Agent {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let pipeline = Arc::new(PipelineHandle::new(&config)?);

        let http = reqwest::Client::new();
        let transport: Arc<dyn crate::http_client::HttpTransport> = Arc::new(ReqwestTransport::new(http));
        let token = Arc::new(TokenHolder::new(transport.clone()));
        let api = Arc::new(ApiClient::new(transport, token.clone(), config.server_base_url.clone()));

        let clip = Arc::new(ClipSubsystem::new(config.clone(), api, token.clone()));

        let (signaling, outbound) = SignalingClient::new(config.clone(), token, pipeline.clone());

        let backend: Arc<dyn ClassifierBackend> = match config.zsad_backend {
            ZsadBackend::Siglip => Arc::new(SiglipBackend::new(&config)),
            ZsadBackend::Triton => Arc::new(TritonBackend::new(&config)),
            ZsadBackend::None => Arc::new(NoneBackend),
        };

        let overlay = Arc::new(OverlayUpdater::new(pipeline.clone()));
        let (dispatcher, dispatcher_frame_rx) =
            InferenceDispatcher::new(config.clone(), backend, Some(overlay.clone()), outbound, clip);

        let frame_rx = frame_tap::install(&pipeline, config.video_width, config.video_height);

        let health = Arc::new(HealthState::default());

        tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher.run(dispatcher_frame_rx).await;
            }
        });

        Ok(Agent {
            config,
            pipeline,
            overlay,
            dispatcher,
            frame_rx,
            signaling,
            health,
        })
    }

    pub fn health_state(&self) -> Arc<HealthState> {
        self.health.clone()
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.clone()
    }

    /// Starts the pipeline and every background task, then drives the
    /// frame tap -> dispatcher bridge until the process is asked to stop.
    /// Never returns under normal operation.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.pipeline.start()?;
        self.health.pipeline_playing.store(true, Ordering::Relaxed);

        let overlay_default = OverlayUpdater::default_text(&self.config);
        info!(text = overlay_default, "pipeline started");
        self.overlay.update(overlay_default.to_string());

        let signaling = self.signaling;
        let signaling_connected = self.health.clone();
        tokio::spawn(async move {
            signaling_connected.signaling_connected.store(true, Ordering::Relaxed);
            signaling.run().await;
        });

        while let Some(frame) = self.frame_rx.recv().await {
            self.dispatcher.offer(frame);
        }

        error!("frame tap channel closed, pipeline likely stopped");
        Ok(())
    }
}
