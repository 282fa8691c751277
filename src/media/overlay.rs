use std::sync::Arc;

use gstreamer::prelude::*;
use tracing::warn;

use crate::config::Config;
use crate::config::ZsadBackend;
use crate::media::pipeline::PipelineHandle;

/// Mutates `zsad_overlay`'s `text` property. GStreamer element properties
/// must be touched from the main-loop thread that owns the pipeline's GLib
/// context, so every update is marshalled through `glib::idle_add` rather
/// than set directly from whatever task calls `update`.
pub struct OverlayUpdater {
    pipeline: Arc<PipelineHandle>,
}

impl OverlayUpdater {
    pub fn new(pipeline: Arc<PipelineHandle>) -> Self {
        OverlayUpdater { pipeline }
    }

    /// Default banner text reflecting which backend is active, shown before
    /// the first classification result arrives.
    pub fn default_text(config: &Config) -> &'static str {
        match config.zsad_backend {
            ZsadBackend::Triton => "ZSAD TRITON ON",
            ZsadBackend::Siglip if config.zero_shot_enabled => "ZSAD ON",
            _ => "ZSAD OFF",
        }
    }

    pub fn update(&self, text: String) {
        let pipeline = self.pipeline.clone();
        glib::idle_add(move || {
            match pipeline.by_name("zsad_overlay") {
                Some(overlay) => overlay.set_property("text", &text),
                None => warn!("zsad_overlay missing, cannot update text"),
            }
            glib::ControlFlow::Break
        });
    }
}
