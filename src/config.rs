use std::env;
use std::path::PathBuf;

use thiserror::Error;

/// Selected anomaly-classification collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZsadBackend {
    Siglip,
    Triton,
    None,
}

impl ZsadBackend {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "triton" => ZsadBackend::Triton,
            "none" => ZsadBackend::None,
            _ => ZsadBackend::Siglip,
        }
    }
}

/// Triton HTTP v2 inference settings, consulted only when `zsad_backend == triton`.
#[derive(Debug, Clone)]
pub struct TritonConfig {
    pub url: String,
    pub model_name: String,
    pub input_name: String,
    pub output_name: String,
    pub input_format: String,
    pub input_width: u32,
    pub input_height: u32,
    pub input_dtype: String,
    pub input_scale: f64,
    pub output_mode: String,
    pub output_activation: String,
    pub labels: Vec<String>,
    pub threshold: f64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
}

/// Immutable configuration snapshot, resolved once at startup from
/// `NUVION_*` environment variables. Any pairing/setup wizard that produces
/// those variables runs as a separate, earlier step; this crate only
/// consumes the flat env-var contract it ultimately produces.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_base_url: String,
    pub device_username: String,
    pub device_password: String,

    pub video_source: String,
    pub gst_source_override: Option<String>,
    pub video_width: i32,
    pub video_height: i32,
    pub video_fps: i32,
    pub local_display: bool,

    pub rtp_remote_ip_override: Option<String>,
    pub rtp_ssrc: Option<u32>,
    pub h264_profile: String,
    pub h264_profile_level_id: String,
    pub h264_packetization_mode: i32,
    pub h264_level_asymmetry_allowed: i32,

    pub zsad_backend: ZsadBackend,
    pub zero_shot_enabled: bool,
    pub zero_shot_model: String,
    pub zero_shot_labels: Vec<String>,
    pub zero_shot_anomaly_labels: Vec<String>,
    pub zero_shot_threshold: f64,
    pub zero_shot_sample_interval_sec: f64,

    pub triton: TritonConfig,

    pub anomaly_min_interval_sec: f64,
    pub production_labels: Vec<String>,
    pub production_confidence_threshold: f64,
    pub production_dedup_sec: f64,

    pub clip_enabled: bool,
    pub clip_pre_sec: f64,
    pub clip_post_sec: f64,
    pub clip_segment_sec: f64,
    pub clip_max_segments: u32,
    pub clip_output_dir: PathBuf,
    pub clip_cooldown_sec: f64,
    pub clip_content_type: String,
    pub ffmpeg_path_override: Option<String>,

    pub line_id: Option<i64>,
    pub process_id: Option<i64>,

    pub outbound_queue_max: usize,

    /// [AMBIENT] operator health/metrics surface (src/health.rs), not part
    /// of the signaling/media wire contract.
    pub health_bind_addr: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            server_base_url: env_str("NUVION_SERVER_BASE_URL", "http://localhost:8080"),
            device_username: env_str("NUVION_DEVICE_USERNAME", "device"),
            device_password: env_str("NUVION_DEVICE_PASSWORD", "password"),

            video_source: env_str("NUVION_VIDEO_SOURCE", "/dev/video0"),
            gst_source_override: env_opt_str("NUVION_GST_SOURCE"),
            video_width: env_i32("NUVION_VIDEO_WIDTH", 640)?,
            video_height: env_i32("NUVION_VIDEO_HEIGHT", 480)?,
            video_fps: env_i32("NUVION_VIDEO_FPS", 30)?,
            local_display: env_bool("NUVION_LOCAL_DISPLAY", false),

            rtp_remote_ip_override: env_opt_str("NUVION_RTP_REMOTE_IP"),
            rtp_ssrc: match env_opt_str("NUVION_RTP_SSRC") {
                Some(v) => Some(v.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                    key: "NUVION_RTP_SSRC",
                    value: v,
                })?),
                None => None,
            },
            h264_profile: env_str("NUVION_H264_PROFILE", "baseline"),
            h264_profile_level_id: env_str("NUVION_H264_PROFILE_LEVEL_ID", "64001f"),
            h264_packetization_mode: env_i32("NUVION_H264_PACKETIZATION_MODE", 1)?,
            h264_level_asymmetry_allowed: env_i32("NUVION_H264_LEVEL_ASYMMETRY_ALLOWED", 1)?,

            zsad_backend: ZsadBackend::parse(&env_str("NUVION_ZSAD_BACKEND", "siglip")),
            zero_shot_enabled: env_bool("NUVION_ZERO_SHOT_ENABLED", false),
            zero_shot_model: env_str("NUVION_ZERO_SHOT_MODEL", "google/siglip2-base-patch16-224"),
            zero_shot_labels: parse_csv(&env_str("NUVION_ZERO_SHOT_LABELS", "normal,defect")),
            zero_shot_anomaly_labels: parse_csv(&env_str(
                "NUVION_ZERO_SHOT_ANOMALY_LABELS",
                "defect,broken,crack,scratch",
            )),
            zero_shot_threshold: env_f64("NUVION_ZERO_SHOT_THRESHOLD", 0.7)?,
            zero_shot_sample_interval_sec: env_f64("NUVION_ZERO_SHOT_SAMPLE_SEC", 2.0)?,

            triton: TritonConfig {
                url: env_str("NUVION_TRITON_URL", "localhost:8000"),
                model_name: env_str("NUVION_TRITON_MODEL", "zsad"),
                input_name: env_str("NUVION_TRITON_INPUT", "INPUT__0"),
                output_name: env_str("NUVION_TRITON_OUTPUT", "OUTPUT__0"),
                input_format: env_str("NUVION_TRITON_INPUT_FORMAT", "NHWC").to_uppercase(),
                input_width: env_i32("NUVION_TRITON_INPUT_WIDTH", 224)? as u32,
                input_height: env_i32("NUVION_TRITON_INPUT_HEIGHT", 224)? as u32,
                input_dtype: env_str("NUVION_TRITON_INPUT_DTYPE", "FP32"),
                input_scale: env_f64("NUVION_TRITON_INPUT_SCALE", 255.0)?,
                output_mode: env_str("NUVION_TRITON_OUTPUT_MODE", "score").to_lowercase(),
                output_activation: env_str("NUVION_TRITON_OUTPUT_ACTIVATION", "sigmoid")
                    .to_lowercase(),
                labels: parse_csv(&env_str("NUVION_TRITON_LABELS", "")),
                threshold: env_f64("NUVION_TRITON_THRESHOLD", 0.7)?,
            },

            anomaly_min_interval_sec: env_f64("NUVION_ANOMALY_MIN_INTERVAL_SEC", 5.0)?,
            production_labels: parse_csv(&env_str("NUVION_PRODUCTION_LABELS", "")),
            production_confidence_threshold: env_f64(
                "NUVION_PRODUCTION_CONFIDENCE_THRESHOLD",
                0.5,
            )?,
            production_dedup_sec: env_f64("NUVION_PRODUCTION_DEDUP_SEC", 3.0)?,

            clip_enabled: env_bool("NUVION_CLIP_ENABLED", true),
            clip_pre_sec: env_f64("NUVION_CLIP_PRE_SEC", 5.0)?,
            clip_post_sec: env_f64("NUVION_CLIP_POST_SEC", 5.0)?,
            clip_segment_sec: env_f64("NUVION_CLIP_SEGMENT_SEC", 1.0)?,
            clip_max_segments: env_i32("NUVION_CLIP_MAX_SEGMENTS", 30)? as u32,
            clip_output_dir: PathBuf::from(env_str("NUVION_CLIP_OUTPUT_DIR", "/tmp/nuvion_clips")),
            clip_cooldown_sec: env_f64("NUVION_CLIP_COOLDOWN_SEC", 10.0)?,
            clip_content_type: env_str("NUVION_CLIP_CONTENT_TYPE", "video/mp4"),
            ffmpeg_path_override: env_opt_str("NUVION_FFMPEG_PATH"),

            line_id: env_opt_i64("NUVION_LINE_ID")?,
            process_id: env_opt_i64("NUVION_PROCESS_ID")?,

            outbound_queue_max: env_i32("NUVION_STOMP_QUEUE_MAX", 200)? as usize,

            health_bind_addr: env_str("NUVION_HEALTH_BIND_ADDR", "127.0.0.1:9090"),
        })
    }

    pub fn segments_dir(&self) -> PathBuf {
        self.clip_output_dir.join("segments")
    }

    pub fn clips_dir(&self) -> PathBuf {
        self.clip_output_dir.join("clips")
    }
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt_str(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_i32(key: &str, default: i32) -> Result<i32, ConfigError> {
    match env::var(key) {
        Ok(v) => v.parse::<i32>().map_err(|_| ConfigError::InvalidValue {
            key: leak(key),
            value: v,
        }),
        Err(_) => Ok(default),
    }
}

fn env_f64(key: &str, default: f64) -> Result<f64, ConfigError> {
    match env::var(key) {
        Ok(v) => v.parse::<f64>().map_err(|_| ConfigError::InvalidValue {
            key: leak(key),
            value: v,
        }),
        Err(_) => Ok(default),
    }
}

fn env_opt_i64(key: &str) -> Result<Option<i64>, ConfigError> {
    match env_opt_str(key) {
        Some(v) => v
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: leak(key),
                value: v,
            }),
        None => Ok(None),
    }
}

fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(|item| item.to_string())
        .collect()
}

/// Env var keys are all `'static` string literals at call sites; this just
/// threads that lifetime through the `Result` without an allocation.
fn leak(key: &str) -> &'static str {
    Box::leak(key.to_string().into_boxed_str())
}
