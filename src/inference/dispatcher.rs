use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

use crate::clip::ClipSubsystem;
use crate::config::Config;
use crate::inference::backend::ClassifierBackend;
use crate::media::{Frame, OverlayUpdater};
use crate::signaling::OutboundHandle;

const ANOMALY_DESTINATION: &str = "/app/device/anomaly";
const PRODUCTION_DESTINATION: &str = "/app/device/production";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    Normal,
    Defect,
}

impl AlertStatus {
    fn as_str(self) -> &'static str {
        match self {
            AlertStatus::Normal => "NORMAL",
            AlertStatus::Defect => "DEFECT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
        }
    }
}

struct DispatcherState {
    last_sent_status: Option<AlertStatus>,
    last_sent_timestamp: f64,
    last_sample_timestamp: f64,
    last_production_timestamp: f64,
}

/// Owns the capacity-1 frame channel, runs classification in a single
/// worker, debounces DEFECT/NORMAL transitions, and emits alerts plus an
/// overlay string.
pub struct InferenceDispatcher {
    config: Arc<Config>,
    backend: Arc<dyn ClassifierBackend>,
    /// The dispatcher runs identically with no display attached.
    overlay: Option<Arc<OverlayUpdater>>,
    outbound: OutboundHandle,
    clip: Arc<ClipSubsystem>,
    frame_tx: mpsc::Sender<Frame>,
    state: Mutex<DispatcherState>,
}

impl InferenceDispatcher {
    pub fn new(
        config: Arc<Config>,
        backend: Arc<dyn ClassifierBackend>,
        overlay: Option<Arc<OverlayUpdater>>,
        outbound: OutboundHandle,
        clip: Arc<ClipSubsystem>,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (frame_tx, frame_rx) = mpsc::channel(1);
        let dispatcher = Arc::new(InferenceDispatcher {
            config,
            backend,
            overlay,
            outbound,
            clip,
            frame_tx,
            state: Mutex::new(DispatcherState {
                last_sent_status: None,
                last_sent_timestamp: 0.0,
                last_sample_timestamp: 0.0,
                last_production_timestamp: 0.0,
            }),
        });
        (dispatcher, frame_rx)
    }

    /// Non-blocking; rejects frames arriving faster than
    /// `zero_shot_sample_interval_sec` and silently drops on a full channel.
    pub fn offer(&self, frame: Frame) {
        if !self.backend.is_ready() {
            return;
        }

        let now = crate::clip::segments::now_secs();
        {
            let mut state = self.state.lock();
            if now - state.last_sample_timestamp < self.config.zero_shot_sample_interval_sec {
                return;
            }
            state.last_sample_timestamp = now;
        }

        let _ = self.frame_tx.try_send(frame);
    }

    /// Runs forever, pulling frames off `frame_rx` and classifying them one
    /// at a time. Intended to be spawned alongside the frame tap.
    pub async fn run(self: Arc<Self>, mut frame_rx: mpsc::Receiver<Frame>) {
        while let Some(frame) = frame_rx.recv().await {
            let Some(result) = self.backend.classify(&frame).await else {
                continue;
            };

            let is_anomaly = self.backend.is_anomaly(&result);
            let status = if is_anomaly {
                AlertStatus::Defect
            } else {
                AlertStatus::Normal
            };

            if let Some(overlay) = &self.overlay {
                overlay.update(format!(
                    "{} {} {:.2}",
                    status.as_str(),
                    result.label,
                    result.score
                ));
            }

            let message = if is_anomaly {
                self.backend.defect_message(&result)
            } else {
                self.backend.recovered_message(&result)
            };
            let severity = if is_anomaly { Severity::Warning } else { Severity::Info };
            self.send_status(status, &result.label, &message, severity).await;

            self.maybe_report_production(&result.label, result.score).await;
        }
    }

    /// Debounce algorithm: suppress the very first alert if it is NORMAL,
    /// always emit on a status change, and otherwise only repeat a DEFECT
    /// after `anomaly_min_interval_sec` has elapsed.
    async fn send_status(&self, status: AlertStatus, label: &str, message: &str, severity: Severity) {
        let now = crate::clip::segments::now_secs();

        let (status_changed, should_emit) = {
            let state = self.state.lock();
            let status_changed = state.last_sent_status.map(|s| s != status).unwrap_or(true);

            if state.last_sent_status.is_none() && status == AlertStatus::Normal {
                (status_changed, false)
            } else if status_changed {
                (status_changed, true)
            } else if status == AlertStatus::Defect
                && now - state.last_sent_timestamp >= self.config.anomaly_min_interval_sec
            {
                (status_changed, true)
            } else {
                (status_changed, false)
            }
        };

        if !should_emit {
            return;
        }

        let (clip_object, clip_status) = if status == AlertStatus::Defect && status_changed {
            match self.clip.start_clip_upload().await {
                Some(object) => (Some(object), Some("UPLOADING".to_string())),
                None => (None, None),
            }
        } else {
            (None, None)
        };

        let payload = json!({
            "anomalyType": label,
            "anomalyStatus": status.as_str(),
            "message": message,
            "severity": severity.as_str(),
            "lineId": self.config.line_id,
            "processId": self.config.process_id,
            "snapshotObject": null,
            "clipObject": clip_object,
            "clipStatus": clip_status,
        });

        if !self.outbound.enqueue(ANOMALY_DESTINATION, payload) {
            return;
        }

        let mut state = self.state.lock();
        state.last_sent_status = Some(status);
        state.last_sent_timestamp = now;
        info!(status = status.as_str(), changed = status_changed, "sent anomaly status");
    }

    async fn maybe_report_production(&self, label: &str, score: f64) {
        if self.config.production_labels.is_empty() {
            return;
        }
        let label_lower = label.to_lowercase();
        if !self
            .config
            .production_labels
            .iter()
            .any(|l| l.to_lowercase() == label_lower)
        {
            return;
        }
        if score < self.config.production_confidence_threshold {
            return;
        }

        let now = crate::clip::segments::now_secs();
        {
            let mut state = self.state.lock();
            if now - state.last_production_timestamp < self.config.production_dedup_sec {
                return;
            }
            state.last_production_timestamp = now;
        }

        let payload = json!({
            "count": 1,
            "lineId": self.config.line_id,
            "processId": self.config.process_id,
        });
        self.outbound.enqueue(PRODUCTION_DESTINATION, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenHolder;
    use crate::http_client::{ApiClient, HttpTransport, PreparedRequest, TransportResponse};
    use crate::inference::backend::{ClassifierResult, NoneBackend};
    use async_trait::async_trait;

    struct StubTransport;

    #[async_trait]
    impl HttpTransport for StubTransport {
        async fn execute(&self, _req: PreparedRequest) -> Result<TransportResponse, String> {
            Ok(TransportResponse { status: 200, json: None })
        }
    }

    struct AlwaysDefectBackend;

    #[async_trait]
    impl ClassifierBackend for AlwaysDefectBackend {
        fn is_ready(&self) -> bool {
            true
        }
        async fn classify(&self, _frame: &Frame) -> Option<ClassifierResult> {
            Some(ClassifierResult {
                label: "defect".to_string(),
                score: 0.9,
                labels: vec!["defect".to_string()],
                scores: vec![0.9],
            })
        }
        fn is_anomaly(&self, _result: &ClassifierResult) -> bool {
            true
        }
        fn defect_message(&self, result: &ClassifierResult) -> String {
            format!("Zero-shot anomaly: {} ({:.2})", result.label, result.score)
        }
        fn recovered_message(&self, result: &ClassifierResult) -> String {
            format!("Recovered to normal: {} ({:.2})", result.label, result.score)
        }
    }

    fn test_config() -> Arc<Config> {
        std::env::remove_var("NUVION_CLIP_ENABLED");
        std::env::set_var("NUVION_CLIP_ENABLED", "false");
        let cfg = Arc::new(Config::from_env().unwrap());
        std::env::remove_var("NUVION_CLIP_ENABLED");
        cfg
    }

    fn harness() -> (Arc<InferenceDispatcher>, mpsc::Receiver<Frame>, mpsc::Receiver<(String, serde_json::Value)>) {
        let config = test_config();
        let transport: Arc<dyn HttpTransport> = Arc::new(StubTransport);
        let token = Arc::new(TokenHolder::new(transport.clone()));
        let api = Arc::new(ApiClient::new(transport, token.clone(), config.server_base_url.clone()));
        let clip = Arc::new(ClipSubsystem::new(config.clone(), api, token));
        let (outbound_tx, outbound_rx) = mpsc::channel(10);
        let outbound = OutboundHandle::new(outbound_tx);

        let backend: Arc<dyn ClassifierBackend> = Arc::new(AlwaysDefectBackend);
        let (dispatcher, frame_rx) = InferenceDispatcher::new(config, backend, None, outbound, clip);
        (dispatcher, frame_rx, outbound_rx)
    }

    #[tokio::test]
    async fn first_normal_status_is_suppressed() {
        let (dispatcher, _frame_rx, mut outbound_rx) = harness();
        dispatcher
            .send_status(AlertStatus::Normal, "normal", "recovered", Severity::Info)
            .await;
        assert!(outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn first_defect_is_emitted_and_repeat_is_debounced() {
        let (dispatcher, _frame_rx, mut outbound_rx) = harness();
        dispatcher
            .send_status(AlertStatus::Defect, "defect", "anomaly", Severity::Warning)
            .await;
        assert!(outbound_rx.try_recv().is_ok());

        dispatcher
            .send_status(AlertStatus::Defect, "defect", "anomaly", Severity::Warning)
            .await;
        assert!(outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn status_change_to_normal_always_emits() {
        let (dispatcher, _frame_rx, mut outbound_rx) = harness();
        dispatcher
            .send_status(AlertStatus::Defect, "defect", "anomaly", Severity::Warning)
            .await;
        let _ = outbound_rx.try_recv();

        dispatcher
            .send_status(AlertStatus::Normal, "defect", "recovered", Severity::Info)
            .await;
        assert!(outbound_rx.try_recv().is_ok());
    }
}
