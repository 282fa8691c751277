use std::path::Path;

use anyhow::{Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::AgentError;

/// Owns the running media graph. Named elements (`zsad_sink`, `rtp_sink`,
/// `rtp_pay`, `zsad_overlay`, `clip_sink`) are looked up by name on demand
/// rather than cached.
pub struct PipelineHandle {
    pipeline: gst::Pipeline,
    rtp_ssrc: u32,
    _bus_watch: gst::bus::BusWatchGuard,
}

impl PipelineHandle {
    /// Builds the source -> tee -> (appsink | overlay -> encoder -> tee ->
    /// (rtp_sink | splitmuxsink)) graph as one textual description submitted
    /// to `gst::parse::launch`.
    pub fn new(config: &Config) -> Result<Self> {
        let rtp_ssrc = resolve_rtp_ssrc(config);
        let description = build_pipeline_description(config, rtp_ssrc);
        info!(pipeline = %description, "building media pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| AgentError::Pipeline(format!("failed to parse pipeline description: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| AgentError::Pipeline("parsed element graph is not a gst::Pipeline".into()))?;

        if pipeline.by_name("zsad_sink").is_none() {
            warn!("zsad_sink not found in pipeline");
        }
        if pipeline.by_name("zsad_overlay").is_none() {
            warn!("zsad_overlay not found in pipeline");
        }

        let bus_watch = Self::setup_bus_watch(&pipeline)?;

        Ok(PipelineHandle {
            pipeline,
            rtp_ssrc,
            _bus_watch: bus_watch,
        })
    }

    pub fn start(&self) -> Result<()> {
        info!("starting media pipeline");
        self.pipeline
            .set_state(gst::State::Playing)
            .context("failed to set pipeline to Playing")?;
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        info!("stopping media pipeline");
        self.pipeline
            .set_state(gst::State::Null)
            .context("failed to set pipeline to Null")?;
        Ok(())
    }

    pub fn pipeline(&self) -> &gst::Pipeline {
        &self.pipeline
    }

    pub fn by_name(&self, name: &str) -> Option<gst::Element> {
        self.pipeline.by_name(name)
    }

    pub fn rtp_ssrc(&self) -> u32 {
        self.rtp_ssrc
    }

    /// Mutates `rtp_sink`/`rtp_pay` live. Before the first call, `rtp_sink`
    /// points at `0.0.0.0:5004` so no packets leak.
    pub fn configure_rtp_sink(&self, host: &str, port: u16, pt: u8) {
        let (Some(rtp_sink), Some(rtp_pay)) =
            (self.by_name("rtp_sink"), self.by_name("rtp_pay"))
        else {
            error!("rtp_sink/rtp_pay not present in pipeline");
            return;
        };

        info!(host, port, pt, "reconfiguring rtp sink");
        rtp_sink.set_property("host", host);
        rtp_sink.set_property("port", port as i32);
        rtp_pay.set_property("pt", pt as i32);
        rtp_pay.set_property("ssrc", self.rtp_ssrc);
    }

    fn setup_bus_watch(pipeline: &gst::Pipeline) -> Result<gst::bus::BusWatchGuard> {
        let bus = pipeline
            .bus()
            .ok_or_else(|| AgentError::Pipeline("pipeline has no bus".into()))?;
        let watch = bus
            .add_watch(move |_, msg| {
                use gst::MessageView;
                match msg.view() {
                    MessageView::Error(err) => {
                        error!(error = %err.error(), debug = ?err.debug(), "gstreamer error");
                    }
                    MessageView::Warning(warn_msg) => {
                        warn!(warning = %warn_msg.error(), "gstreamer warning");
                    }
                    MessageView::Eos(_) => {
                        info!("end of stream");
                    }
                    _ => {}
                }
                gst::glib::ControlFlow::Continue
            })
            .map_err(|e| AgentError::Pipeline(format!("failed to add bus watch: {e}")))?;
        Ok(watch)
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        debug!("dropping media pipeline");
        let _ = self.stop();
    }
}

fn resolve_rtp_ssrc(config: &Config) -> u32 {
    if let Some(ssrc) = config.rtp_ssrc {
        return ssrc;
    }
    rand::thread_rng().gen_range(100_000..=4_294_967_295u32)
}

/// Platform-aware source element selection.
fn build_source_description(config: &Config) -> String {
    if let Some(ref override_source) = config.gst_source_override {
        return override_source.clone();
    }

    let video_source = config.video_source.as_str();
    let source = if video_source.starts_with("/dev/video") {
        if cfg!(target_os = "macos") {
            "avfvideosrc".to_string()
        } else {
            format!("v4l2src device={video_source}")
        }
    } else if matches!(video_source.to_lowercase().as_str(), "rpi" | "libcamera") {
        "libcamerasrc".to_string()
    } else if video_source.to_lowercase().starts_with("avf") {
        match video_source.split_once(':') {
            Some((_, idx)) if idx.chars().all(|c| c.is_ascii_digit()) => {
                format!("avfvideosrc device-index={idx}")
            }
            _ => "avfvideosrc".to_string(),
        }
    } else {
        "autovideosrc".to_string()
    };

    format!(
        "{source} ! video/x-raw,width={w},height={h},framerate={fps}/1 ! videoconvert ! video/x-raw,format=RGB",
        w = config.video_width,
        h = config.video_height,
        fps = config.video_fps,
    )
}

fn build_pipeline_description(config: &Config, rtp_ssrc: u32) -> String {
    let source_pipeline = build_source_description(config);

    let overlay_pipeline = "videoconvert ! textoverlay name=zsad_overlay \
        font-desc=\"Sans 24\" halignment=left valignment=top shaded-background=true text=\"\" ! "
        .to_string();

    let encoder_pipeline = format!(
        "videoconvert ! video/x-raw,format=I420 ! x264enc tune=zerolatency speed-preset=faster \
         bitrate=8000 vbv-buf-capacity=12000 key-int-max=30 bframes=0 threads=4 \
         sliced-threads=true pass=cbr ! video/x-h264,profile={profile} ! ",
        profile = config.h264_profile
    );

    let rtp_pipeline = if config.clip_enabled {
        let segment_ns = (config.clip_segment_sec * 1_000_000_000.0) as u64;
        let segments_dir = config.segments_dir();
        std::fs::create_dir_all(&segments_dir).ok();
        let location = Path::new(&segments_dir).join("segment_%05d.mp4");
        format!(
            "{encoder_pipeline}tee name=enc_t \
             enc_t. ! queue ! rtph264pay name=rtp_pay config-interval=1 pt=96 mtu=1200 ssrc={ssrc} ! \
             udpsink name=rtp_sink host=0.0.0.0 port=5004 async=false sync=false \
             enc_t. ! queue ! h264parse config-interval=1 ! \
             splitmuxsink name=clip_sink muxer=mp4mux max-size-time={segment_ns} \
             max-files={max_files} location=\"{location}\"",
            ssrc = rtp_ssrc,
            max_files = config.clip_max_segments,
            location = location.display(),
        )
    } else {
        format!(
            "{encoder_pipeline}rtph264pay name=rtp_pay config-interval=1 pt=96 mtu=1200 ssrc={rtp_ssrc} ! \
             udpsink name=rtp_sink host=0.0.0.0 port=5004 async=false sync=false"
        )
    };

    if config.local_display {
        format!(
            "{source_pipeline} ! tee name=t \
             t. ! queue ! appsink name=zsad_sink emit-signals=true max-buffers=1 drop=true sync=false \
             t. ! queue ! {overlay_pipeline}tee name=dt \
             dt. ! queue ! {rtp_pipeline} \
             dt. ! queue ! videoconvert ! autovideosink sync=false"
        )
    } else {
        format!(
            "{source_pipeline} ! tee name=t \
             t. ! queue ! appsink name=zsad_sink emit-signals=true max-buffers=1 drop=true sync=false \
             t. ! queue ! {overlay_pipeline}{rtp_pipeline}"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn base_config() -> Config {
        for (k, _) in std::env::vars() {
            if k.starts_with("NUVION_") {
                std::env::remove_var(k);
            }
        }
        Config::from_env().unwrap()
    }

    #[test]
    #[serial]
    fn source_selection_picks_v4l2_for_dev_video_on_linux() {
        let cfg = base_config();
        let desc = build_source_description(&cfg);
        if cfg!(target_os = "linux") {
            assert!(desc.starts_with("v4l2src device=/dev/video0"));
        }
    }

    #[test]
    #[serial]
    fn source_selection_picks_libcamera() {
        std::env::set_var("NUVION_VIDEO_SOURCE", "rpi");
        let cfg = base_config();
        let desc = build_source_description(&cfg);
        assert!(desc.starts_with("libcamerasrc"));
        std::env::remove_var("NUVION_VIDEO_SOURCE");
    }

    #[test]
    #[serial]
    fn source_selection_honors_explicit_override() {
        std::env::set_var("NUVION_GST_SOURCE", "videotestsrc ! video/x-raw,format=RGB");
        let cfg = base_config();
        let desc = build_source_description(&cfg);
        assert_eq!(desc, "videotestsrc ! video/x-raw,format=RGB");
        std::env::remove_var("NUVION_GST_SOURCE");
    }

    #[test]
    #[serial]
    fn clip_disabled_omits_splitmuxsink_branch() {
        std::env::set_var("NUVION_CLIP_ENABLED", "false");
        let cfg = base_config();
        let desc = build_pipeline_description(&cfg, 12345);
        assert!(!desc.contains("splitmuxsink"));
        assert!(desc.contains("rtp_sink"));
        std::env::remove_var("NUVION_CLIP_ENABLED");
    }

    #[test]
    #[serial]
    fn clip_enabled_includes_split_muxer_with_configured_segment_count() {
        let cfg = base_config();
        let desc = build_pipeline_description(&cfg, 12345);
        assert!(desc.contains("splitmuxsink"));
        assert!(desc.contains(&format!("max-files={}", cfg.clip_max_segments)));
    }
}
