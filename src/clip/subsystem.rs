use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::Url;
use serde_json::{json, Value};
use tokio::fs;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::auth::TokenHolder;
use crate::clip::muxer::{concat_segments, resolve_ffmpeg_path};
use crate::clip::segments::{collect_segments, now_secs};
use crate::config::Config;
use crate::http_client::{ApiClient, Method};

struct ClipGuardState {
    in_progress: bool,
    last_started: f64,
}

/// Clip capture/upload subsystem. Owns the in-progress/cooldown guard that
/// the dispatcher consults before triggering a clip.
pub struct ClipSubsystem {
    config: Arc<Config>,
    api: Arc<ApiClient>,
    token: Arc<TokenHolder>,
    http: reqwest::Client,
    guard: Mutex<ClipGuardState>,
}

impl ClipSubsystem {
    pub fn new(config: Arc<Config>, api: Arc<ApiClient>, token: Arc<TokenHolder>) -> Self {
        ClipSubsystem {
            config,
            api,
            token,
            http: reqwest::Client::new(),
            guard: Mutex::new(ClipGuardState {
                in_progress: false,
                last_started: 0.0,
            }),
        }
    }

    /// Requests an upload URL and, if granted, spawns the capture/upload
    /// worker in the background. Returns the object name synchronously so
    /// the caller can stamp `clipObject`/`clipStatus` on the alert it is
    /// about to send, while the actual capture and upload proceed
    /// asynchronously.
    pub async fn start_clip_upload(self: &Arc<Self>) -> Option<String> {
        if !self.config.clip_enabled {
            return None;
        }

        let now = now_secs();
        {
            let mut guard = self.guard.lock();
            if guard.in_progress {
                return None;
            }
            if now - guard.last_started < self.config.clip_cooldown_sec {
                return None;
            }
            guard.in_progress = true;
            guard.last_started = now;
        }

        let payload = json!({"type": "CLIP", "contentType": self.config.clip_content_type});
        let response = self
            .api
            .request(Method::Post, "/devices/media/upload-url", Some(payload), &self.config)
            .await;

        let data = response.and_then(|v| v.get("data").cloned());
        let (object_name, upload_url) = match extract_upload_meta(data) {
            Some(pair) => pair,
            None => {
                self.guard.lock().in_progress = false;
                return None;
            }
        };

        let this = self.clone();
        let object_for_worker = object_name.clone();
        tokio::spawn(async move {
            this.capture_and_upload_clip(object_for_worker, upload_url, now)
                .await;
        });

        Some(object_name)
    }

    async fn capture_and_upload_clip(&self, object_name: String, upload_url: String, detected_at: f64) {
        let clip_path = self.build_clip_from_segments(detected_at).await;

        match clip_path {
            None => {
                self.update_clip_status(&object_name, "FAILED").await;
            }
            Some(path) => {
                let ok = self.upload_file_to_url(&upload_url, &path).await;
                self.update_clip_status(&object_name, if ok { "READY" } else { "FAILED" })
                    .await;
                let _ = fs::remove_file(&path).await;
            }
        }

        self.guard.lock().in_progress = false;
    }

    async fn build_clip_from_segments(&self, detected_at: f64) -> Option<PathBuf> {
        let ffmpeg_path = resolve_ffmpeg_path(&self.config).await?;

        let pre_count = ((self.config.clip_pre_sec / self.config.clip_segment_sec).ceil() as usize).max(1);
        let post_count = ((self.config.clip_post_sec / self.config.clip_segment_sec).ceil() as usize).max(1);

        let segments_dir = self.config.segments_dir();
        let pre_segments = collect_segments(&segments_dir, Some(detected_at), None, pre_count);

        tokio::time::sleep(Duration::from_secs_f64(
            self.config.clip_post_sec + self.config.clip_segment_sec,
        ))
        .await;

        let post_segments = collect_segments(&segments_dir, None, Some(detected_at), post_count);

        let mut paths: Vec<PathBuf> = pre_segments.iter().map(|s| s.path.clone()).collect();
        for seg in &post_segments {
            if !paths.contains(&seg.path) {
                paths.push(seg.path.clone());
            }
        }

        if paths.is_empty() {
            warn!("no segments available for clip");
            return None;
        }

        let clips_dir = self.config.clips_dir();
        if let Err(e) = fs::create_dir_all(&clips_dir).await {
            warn!(error = %e, "failed to create clips directory");
            return None;
        }

        let ts = detected_at as i64;
        let list_file = clips_dir.join(format!("concat_{ts}.txt"));
        let output_path = clips_dir.join(format!("clip_{ts}.mp4"));

        match concat_segments(&ffmpeg_path, &paths, &list_file, &output_path).await {
            Ok(()) => Some(output_path),
            Err(e) => {
                warn!(error = %e, "ffmpeg concat failed");
                None
            }
        }
    }

    /// Bearer token is attached only when the upload host matches the
    /// signaling server's host. A presigned URL to object storage must not
    /// receive the device's credentials.
    async fn upload_file_to_url(&self, upload_url: &str, path: &PathBuf) -> bool {
        let bytes = match fs::read(path).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to read clip file for upload");
                return false;
            }
        };

        let mut builder = self
            .http
            .put(upload_url)
            .header("Content-Type", self.config.clip_content_type.clone())
            .body(bytes);

        if same_host(&self.config.server_base_url, upload_url) {
            if let Some(token) = self.token.get() {
                builder = builder.bearer_auth(token);
            }
        }

        match builder.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "clip upload request failed");
                false
            }
        }
    }

    async fn update_clip_status(&self, object_name: &str, status: &str) {
        let payload = json!({"objectName": object_name, "status": status});
        info!(object_name, status, "patching clip status");
        let _ = self
            .api
            .request(Method::Patch, "/devices/media/clip-status", Some(payload), &self.config)
            .await;
    }
}

fn extract_upload_meta(data: Option<Value>) -> Option<(String, String)> {
    let data = data?;
    let object_name = data.get("objectName")?.as_str()?.to_string();
    let upload_url = data.get("uploadUrl")?.as_str()?.to_string();
    Some((object_name, upload_url))
}

fn same_host(server_base_url: &str, upload_url: &str) -> bool {
    let server_host = Url::parse(server_base_url).ok().and_then(|u| u.host_str().map(str::to_string));
    let upload_host = Url::parse(upload_url).ok().and_then(|u| u.host_str().map(str::to_string));
    matches!((server_host, upload_host), (Some(a), Some(b)) if a == b)
}
