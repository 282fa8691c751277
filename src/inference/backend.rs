use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::{Config, TritonConfig};
use crate::media::Frame;

/// Top classification plus the full label/score ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierResult {
    pub label: String,
    pub score: f64,
    pub labels: Vec<String>,
    pub scores: Vec<f64>,
}

/// Frame-level anomaly classifier collaborator. This crate only consumes
/// whichever backend `zsad_backend` selects; it never trains or chooses
/// the underlying model.
#[async_trait]
pub trait ClassifierBackend: Send + Sync {
    fn is_ready(&self) -> bool;
    async fn classify(&self, frame: &Frame) -> Option<ClassifierResult>;

    /// Per-backend anomaly rule: siglip additionally requires label
    /// membership, triton is a bare score threshold.
    fn is_anomaly(&self, result: &ClassifierResult) -> bool;

    /// Backend-specific alert message for a DEFECT classification.
    fn defect_message(&self, result: &ClassifierResult) -> String;

    /// Backend-specific alert message for a NORMAL classification.
    fn recovered_message(&self, result: &ClassifierResult) -> String;
}

/// Zero-shot vision-language classifier. Loading a SigLIP checkpoint
/// requires a local ML runtime this agent does not carry, so this backend
/// always reports `ready=false` and every `classify` call returns `None`
/// without producing an alert.
pub struct SiglipBackend {
    labels: Vec<String>,
    anomaly_labels: Vec<String>,
    threshold: f64,
}

impl SiglipBackend {
    pub fn new(config: &Config) -> Self {
        if config.zero_shot_enabled {
            warn!(
                model = %config.zero_shot_model,
                "zero-shot dependencies not available on this agent, disabling siglip backend"
            );
        }
        SiglipBackend {
            labels: config.zero_shot_labels.clone(),
            anomaly_labels: config.zero_shot_anomaly_labels.clone(),
            threshold: config.zero_shot_threshold,
        }
    }

}

#[async_trait]
impl ClassifierBackend for SiglipBackend {
    fn is_ready(&self) -> bool {
        false
    }

    async fn classify(&self, _frame: &Frame) -> Option<ClassifierResult> {
        let _ = &self.labels;
        None
    }

    /// `label ∈ anomaly_labels ∧ score ≥ threshold`, case-insensitive
    /// label match.
    fn is_anomaly(&self, result: &ClassifierResult) -> bool {
        let label = result.label.to_lowercase();
        self.anomaly_labels.iter().any(|l| l.to_lowercase() == label) && result.score >= self.threshold
    }

    fn defect_message(&self, result: &ClassifierResult) -> String {
        format!("Zero-shot anomaly: {} ({:.2})", result.label, result.score)
    }

    fn recovered_message(&self, result: &ClassifierResult) -> String {
        format!("Recovered to normal: {} ({:.2})", result.label, result.score)
    }
}

/// Remote Triton Inference Server HTTP v2 client. Frames are nearest-
/// neighbor resized and intensity-scaled client-side, then posted as a
/// plain JSON tensor payload.
pub struct TritonBackend {
    client: reqwest::Client,
    config: TritonConfig,
}

impl TritonBackend {
    pub fn new(config: &Config) -> Self {
        TritonBackend {
            client: reqwest::Client::new(),
            config: config.triton.clone(),
        }
    }

    fn infer_url(&self) -> String {
        let base = if self.config.url.starts_with("http") {
            self.config.url.clone()
        } else {
            format!("http://{}", self.config.url)
        };
        format!("{base}/v2/models/{}/infer", self.config.model_name)
    }

    fn preprocess(&self, frame: &Frame) -> (Vec<f64>, Vec<i64>) {
        let target_w = self.config.input_width as i32;
        let target_h = self.config.input_height as i32;
        let resized = nearest_neighbor_resize(frame, target_w, target_h);

        let scaled: Vec<f64> = resized.iter().map(|&b| b as f64 / self.config.input_scale).collect();

        if self.config.input_format == "NCHW" {
            let mut planar = vec![0.0f64; scaled.len()];
            let plane_len = (target_w * target_h) as usize;
            for (i, chunk) in scaled.chunks(3).enumerate() {
                for (c, &value) in chunk.iter().enumerate() {
                    planar[c * plane_len + i] = value;
                }
            }
            (planar, vec![1, 3, target_h as i64, target_w as i64])
        } else {
            (scaled, vec![1, target_h as i64, target_w as i64, 3])
        }
    }

    fn activate(&self, scores: &[f64]) -> Vec<f64> {
        match self.config.output_activation.as_str() {
            "softmax" => {
                let max = scores.iter().cloned().fold(f64::MIN, f64::max);
                let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
                let sum: f64 = exps.iter().sum();
                exps.iter().map(|e| e / sum).collect()
            }
            "sigmoid" => scores.iter().map(|s| 1.0 / (1.0 + (-s).exp())).collect(),
            _ => scores.to_vec(),
        }
    }
}

#[async_trait]
impl ClassifierBackend for TritonBackend {
    fn is_ready(&self) -> bool {
        true
    }

    async fn classify(&self, frame: &Frame) -> Option<ClassifierResult> {
        let (data, shape) = self.preprocess(frame);

        let body = json!({
            "inputs": [{
                "name": self.config.input_name,
                "shape": shape,
                "datatype": self.config.input_dtype,
                "data": data,
            }],
            "outputs": [{"name": self.config.output_name}],
        });

        let response = self
            .client
            .post(self.infer_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| warn!(error = %e, "triton inference request failed"))
            .ok()?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "triton inference returned error status");
            return None;
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| warn!(error = %e, "triton response was not valid json"))
            .ok()?;

        let output = parsed
            .get("outputs")
            .and_then(Value::as_array)
            .and_then(|outputs| outputs.first())?;
        let raw_scores: Vec<f64> = output
            .get("data")
            .and_then(Value::as_array)?
            .iter()
            .filter_map(Value::as_f64)
            .collect();

        if raw_scores.is_empty() {
            return None;
        }

        if self.config.output_mode == "score" {
            return Some(ClassifierResult {
                label: "ANOMALY".to_string(),
                score: raw_scores[0],
                labels: vec!["ANOMALY".to_string()],
                scores: raw_scores,
            });
        }

        let activated = self.activate(&raw_scores);
        let top_idx = activated
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let label = if self.config.labels.len() == activated.len() {
            self.config.labels[top_idx].clone()
        } else {
            format!("class_{top_idx}")
        };

        Some(ClassifierResult {
            label,
            score: activated[top_idx],
            labels: self.config.labels.clone(),
            scores: activated,
        })
    }

    /// `score ≥ triton_threshold`; no label-membership check for this
    /// backend.
    fn is_anomaly(&self, result: &ClassifierResult) -> bool {
        result.score >= self.config.threshold
    }

    fn defect_message(&self, result: &ClassifierResult) -> String {
        format!("Triton anomaly score={:.2}", result.score)
    }

    fn recovered_message(&self, result: &ClassifierResult) -> String {
        format!("Triton recovered: {} ({:.2})", result.label, result.score)
    }
}

/// No-op classifier for `zsad_backend=none`: always unready, never alerts.
pub struct NoneBackend;

#[async_trait]
impl ClassifierBackend for NoneBackend {
    fn is_ready(&self) -> bool {
        false
    }

    async fn classify(&self, _frame: &Frame) -> Option<ClassifierResult> {
        None
    }

    fn is_anomaly(&self, _result: &ClassifierResult) -> bool {
        false
    }

    fn defect_message(&self, _result: &ClassifierResult) -> String {
        String::new()
    }

    fn recovered_message(&self, _result: &ClassifierResult) -> String {
        String::new()
    }
}

fn nearest_neighbor_resize(frame: &Frame, target_w: i32, target_h: i32) -> Vec<u8> {
    let (src_w, src_h) = (frame.width as usize, frame.height as usize);
    let (dst_w, dst_h) = (target_w as usize, target_h as usize);
    let mut out = vec![0u8; dst_w * dst_h * 3];

    for y in 0..dst_h {
        let src_y = (y * src_h / dst_h.max(1)).min(src_h.saturating_sub(1));
        for x in 0..dst_w {
            let src_x = (x * src_w / dst_w.max(1)).min(src_w.saturating_sub(1));
            let src_idx = (src_y * src_w + src_x) * 3;
            let dst_idx = (y * dst_w + x) * 3;
            if src_idx + 2 < frame.rgb.len() {
                out[dst_idx..dst_idx + 3].copy_from_slice(&frame.rgb[src_idx..src_idx + 3]);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(w: i32, h: i32) -> Frame {
        Frame {
            width: w,
            height: h,
            rgb: vec![128u8; (w * h * 3) as usize],
        }
    }

    #[tokio::test]
    async fn none_backend_never_reports_ready_or_classifies() {
        let backend = NoneBackend;
        assert!(!backend.is_ready());
        assert!(backend.classify(&frame(4, 4)).await.is_none());
    }

    fn siglip_backend(anomaly_labels: &[&str], threshold: f64) -> SiglipBackend {
        SiglipBackend {
            labels: vec!["normal".to_string(), "defect".to_string()],
            anomaly_labels: anomaly_labels.iter().map(|s| s.to_string()).collect(),
            threshold,
        }
    }

    #[test]
    fn siglip_is_anomaly_requires_label_membership_and_score() {
        let backend = siglip_backend(&["defect", "crack"], 0.7);

        let high_score_anomaly_label = ClassifierResult {
            label: "defect".to_string(),
            score: 0.9,
            labels: vec![],
            scores: vec![],
        };
        assert!(backend.is_anomaly(&high_score_anomaly_label));

        let high_score_unlisted_label = ClassifierResult {
            label: "normal".to_string(),
            score: 0.95,
            labels: vec![],
            scores: vec![],
        };
        assert!(
            !backend.is_anomaly(&high_score_unlisted_label),
            "a high score alone must not trigger an anomaly for a label outside anomaly_labels"
        );

        let low_score_anomaly_label = ClassifierResult {
            label: "defect".to_string(),
            score: 0.3,
            labels: vec![],
            scores: vec![],
        };
        assert!(!backend.is_anomaly(&low_score_anomaly_label));
    }

    #[test]
    fn siglip_is_anomaly_label_match_is_case_insensitive() {
        let backend = siglip_backend(&["Defect"], 0.5);
        let result = ClassifierResult {
            label: "DEFECT".to_string(),
            score: 0.8,
            labels: vec![],
            scores: vec![],
        };
        assert!(backend.is_anomaly(&result));
    }

    #[test]
    fn siglip_messages_use_expected_format() {
        let backend = siglip_backend(&["defect"], 0.7);
        let result = ClassifierResult {
            label: "defect".to_string(),
            score: 0.876,
            labels: vec![],
            scores: vec![],
        };
        assert_eq!(backend.defect_message(&result), "Zero-shot anomaly: defect (0.88)");
        assert_eq!(backend.recovered_message(&result), "Recovered to normal: defect (0.88)");
    }

    #[test]
    fn triton_is_anomaly_ignores_label_and_uses_threshold_only() {
        let backend = TritonBackend {
            client: reqwest::Client::new(),
            config: TritonConfig {
                url: "localhost:8000".to_string(),
                model_name: "zsad".to_string(),
                input_name: "INPUT__0".to_string(),
                output_name: "OUTPUT__0".to_string(),
                input_format: "NHWC".to_string(),
                input_width: 224,
                input_height: 224,
                input_dtype: "FP32".to_string(),
                input_scale: 255.0,
                output_mode: "score".to_string(),
                output_activation: "sigmoid".to_string(),
                labels: vec![],
                threshold: 0.7,
            },
        };
        let above = ClassifierResult {
            label: "whatever".to_string(),
            score: 0.71,
            labels: vec![],
            scores: vec![],
        };
        let below = ClassifierResult {
            label: "whatever".to_string(),
            score: 0.69,
            labels: vec![],
            scores: vec![],
        };
        assert!(backend.is_anomaly(&above));
        assert!(!backend.is_anomaly(&below));
        assert_eq!(backend.defect_message(&above), "Triton anomaly score=0.71");
        assert_eq!(backend.recovered_message(&above), "Triton recovered: whatever (0.71)");
    }

    #[tokio::test]
    async fn siglip_backend_degrades_gracefully_without_local_model() {
        std::env::remove_var("NUVION_ZERO_SHOT_ENABLED");
        let config = Config::from_env().unwrap();
        let backend = SiglipBackend::new(&config);
        assert!(!backend.is_ready());
        assert!(backend.classify(&frame(8, 8)).await.is_none());
    }

    #[test]
    fn nearest_neighbor_resize_produces_requested_dimensions() {
        let f = frame(10, 10);
        let resized = nearest_neighbor_resize(&f, 4, 4);
        assert_eq!(resized.len(), 4 * 4 * 3);
    }

    #[test]
    fn sigmoid_activation_matches_logistic_curve() {
        let backend = TritonBackend {
            client: reqwest::Client::new(),
            config: TritonConfig {
                url: "localhost:8000".to_string(),
                model_name: "zsad".to_string(),
                input_name: "INPUT__0".to_string(),
                output_name: "OUTPUT__0".to_string(),
                input_format: "NHWC".to_string(),
                input_width: 224,
                input_height: 224,
                input_dtype: "FP32".to_string(),
                input_scale: 255.0,
                output_mode: "labels".to_string(),
                output_activation: "sigmoid".to_string(),
                labels: vec![],
                threshold: 0.7,
            },
        };
        let activated = backend.activate(&[0.0]);
        assert!((activated[0] - 0.5).abs() < 1e-9);
    }
}
