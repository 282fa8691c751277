use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::auth::TokenHolder;
use crate::config::Config;
use crate::media::pipeline::PipelineHandle;
use crate::signaling::frame::{
    build_connect_frame, build_send_frame, build_subscribe_frame, unpack_frame, unwrap_inbound,
    wrap_outbound,
};

const RECONNECT_DELAY: Duration = Duration::from_secs(10);
const COMMAND_SUBSCRIPTION_ID: &str = "sub-command";
const COMMAND_DESTINATION: &str = "/user/queue/command";

/// Non-blocking handle to the bounded outbound queue. Clone freely - every
/// clone shares the same bounded channel, so producers never block and a
/// full queue simply drops the message.
#[derive(Clone)]
pub struct OutboundHandle {
    tx: mpsc::Sender<(String, Value)>,
}

impl OutboundHandle {
    pub fn new(tx: mpsc::Sender<(String, Value)>) -> Self {
        OutboundHandle { tx }
    }

    /// `enqueue(destination, payload) -> bool`. Returns `false` if the
    /// queue is full; callers never wait.
    pub fn enqueue(&self, destination: impl Into<String>, payload: Value) -> bool {
        let destination = destination.into();
        match self.tx.try_send((destination.clone(), payload)) {
            Ok(()) => true,
            Err(_) => {
                warn!(destination = %destination, "outbound queue full, dropping message");
                false
            }
        }
    }
}

/// Forever-loop supervisor for the signaling session. The outbound queue
/// is created once and outlives individual WebSocket sessions: messages
/// enqueued while disconnected wait for the next session to flush.
pub struct SignalingClient {
    config: Arc<Config>,
    token: Arc<TokenHolder>,
    pipeline: Arc<PipelineHandle>,
    outbound_tx: mpsc::Sender<(String, Value)>,
    outbound_rx: mpsc::Receiver<(String, Value)>,
}

impl SignalingClient {
    pub fn new(
        config: Arc<Config>,
        token: Arc<TokenHolder>,
        pipeline: Arc<PipelineHandle>,
    ) -> (Self, OutboundHandle) {
        let (tx, rx) = mpsc::channel(config.outbound_queue_max);
        (
            SignalingClient {
                config,
                token,
                pipeline,
                outbound_tx: tx.clone(),
                outbound_rx: rx,
            },
            OutboundHandle::new(tx),
        )
    }

    /// Runs the reconnect-forever supervisor. Never returns under normal
    /// operation; intended to be spawned as its own background task.
    pub async fn run(mut self) {
        loop {
            if let Err(e) = self.run_session().await {
                error!(error = %e, "signaling session ended");
            }
            info!("reconnecting signaling session in {:?}", RECONNECT_DELAY);
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn run_session(&mut self) -> Result<(), String> {
        let token = match self.token.get() {
            Some(t) => t,
            None => self
                .token
                .refresh(&self.config)
                .await
                .ok_or_else(|| "login failed".to_string())?,
        };

        let ws_url = build_ws_url(&self.config.server_base_url);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| format!("connect failed: {e}"))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let open_frame = ws_rx
            .next()
            .await
            .ok_or("connection closed before open frame")?
            .map_err(|e| e.to_string())?;
        if open_frame.to_text().unwrap_or("") != "o" {
            return Err(format!("sockjs did not open: {open_frame:?}"));
        }
        info!("sockjs session open");

        ws_tx
            .send(Message::Text(wrap_outbound(&build_connect_frame(&token))))
            .await
            .map_err(|e| e.to_string())?;

        let connected_msg = ws_rx
            .next()
            .await
            .ok_or("connection closed before CONNECTED")?
            .map_err(|e| e.to_string())?;
        let connected_text = connected_msg.to_text().unwrap_or("");
        let frames = unwrap_inbound(connected_text);
        if !frames.iter().any(|f| f.contains("CONNECTED")) {
            return Err(format!("stomp connect failed: {connected_text}"));
        }
        info!("stomp connected");

        ws_tx
            .send(Message::Text(wrap_outbound(&build_subscribe_frame(
                COMMAND_DESTINATION,
                COMMAND_SUBSCRIPTION_ID,
            ))))
            .await
            .map_err(|e| e.to_string())?;

        loop {
            tokio::select! {
                outbound = self.outbound_rx.recv() => {
                    let Some((destination, payload)) = outbound else {
                        return Err("outbound queue closed".to_string());
                    };
                    let frame = build_send_frame(&destination, &payload);
                    if let Err(e) = ws_tx.send(Message::Text(wrap_outbound(&frame))).await {
                        return Err(format!("send failed: {e}"));
                    }
                }
                incoming = ws_rx.next() => {
                    let Some(msg) = incoming else {
                        return Err("websocket closed".to_string());
                    };
                    let msg = msg.map_err(|e| e.to_string())?;
                    let Message::Text(text) = msg else { continue };
                    for raw_frame in unwrap_inbound(&text) {
                        let Some(frame) = unpack_frame(&raw_frame) else { continue };
                        if frame.header("destination") == Some(COMMAND_DESTINATION) {
                            self.handle_command(&frame.body).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_command(&self, body: &str) {
        let Ok(value) = serde_json::from_str::<Value>(body) else {
            warn!("malformed command frame, skipping");
            return;
        };
        if value.get("type").and_then(Value::as_str) != Some("RTP_ENDPOINT_READY") {
            return;
        }

        if let Some(broadcast_id) = value.get("broadcastId").and_then(Value::as_str) {
            if broadcast_id != self.config.device_username {
                return;
            }
        }

        let mut ip = value.get("ip").and_then(Value::as_str).map(str::to_string);
        let mut port = value.get("port").and_then(Value::as_u64).map(|p| p as u16);
        let mut pt = value
            .get("payloadType")
            .and_then(Value::as_u64)
            .map(|p| p as u8);

        if ip.is_none() || port.is_none() || pt.is_none() {
            if let Some(sdp) = value.get("sdp").and_then(Value::as_str) {
                if let Some((sdp_ip, sdp_port, sdp_pt)) = parse_rtp_sdp(sdp) {
                    ip = ip.or(Some(sdp_ip));
                    port = port.or(Some(sdp_port));
                    pt = pt.or(Some(sdp_pt));
                }
            }
        }

        let (Some(mut ip), Some(port), Some(pt)) = (ip, port, pt) else {
            warn!("RTP_ENDPOINT_READY missing ip/port/payloadType and no usable sdp");
            return;
        };

        if let Some(override_ip) = &self.config.rtp_remote_ip_override {
            info!(ip = %override_ip, "overriding RTP destination via config");
            ip = override_ip.clone();
        } else if ip == "0.0.0.0" {
            ip = extract_host_from_server_url(&self.config.server_base_url);
            info!(ip = %ip, "substituting signaling host for 0.0.0.0 RTP destination");
        }

        info!(ip = %ip, port, pt, "reconfiguring rtp sink");
        self.pipeline.configure_rtp_sink(&ip, port, pt);

        let payload = json!({
            "broadcastId": self.config.device_username,
            "kind": "video",
            "rtpParameters": build_rtp_parameters(&self.config, pt, self.pipeline.rtp_ssrc()),
        });
        let handle = OutboundHandle::new(self.outbound_tx.clone());
        handle.enqueue("/app/broadcast/start", payload);
    }
}

fn build_ws_url(server_base_url: &str) -> String {
    let scheme_swapped = server_base_url.replacen("http", "ws", 1);
    let mut rng = rand::thread_rng();
    let digits: String = (0..3)
        .map(|_| std::char::from_digit(rng.gen_range(0..10), 10).unwrap())
        .collect();
    const ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let alnum: String = (0..8)
        .map(|_| ALNUM[rng.gen_range(0..ALNUM.len())] as char)
        .collect();
    format!("{scheme_swapped}/signaling/{digits}/{alnum}/websocket")
}

fn extract_host_from_server_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Parses `c=`, `m=video`, and `a=rtpmap:*H264*` lines out of an SDP
/// answer. Tolerant and total: a malformed or partial SDP yields `None`
/// rather than an error - a missing field is an expected transient, not a
/// fault.
pub fn parse_rtp_sdp(sdp: &str) -> Option<(String, u16, u8)> {
    let lines: Vec<&str> = sdp.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    let ip = lines
        .iter()
        .find(|l| l.starts_with("c="))
        .and_then(|l| l.split_whitespace().nth(2))
        .map(str::to_string)?;

    let m_line = lines.iter().find(|l| l.starts_with("m=video"))?;
    let m_parts: Vec<&str> = m_line.split_whitespace().collect();
    if m_parts.len() < 4 {
        return None;
    }
    let port: u16 = m_parts[1].parse().ok()?;
    let mut pt: u8 = m_parts[3].parse().ok()?;

    if let Some(rtpmap) = lines
        .iter()
        .find(|l| l.starts_with("a=rtpmap:") && l.contains("H264"))
    {
        if let Some(first) = rtpmap.split_whitespace().next() {
            if let Some(pt_str) = first.split(':').nth(1) {
                if let Ok(parsed) = pt_str.parse::<u8>() {
                    pt = parsed;
                }
            }
        }
    }

    Some((ip, port, pt))
}

/// Builds the `rtpParameters` object sent in `/app/broadcast/start`.
pub fn build_rtp_parameters(config: &Config, payload_type: u8, ssrc: u32) -> Value {
    json!({
        "codecs": [{
            "mimeType": "video/H264",
            "payloadType": payload_type,
            "clockRate": 90000,
            "parameters": {
                "packetization-mode": config.h264_packetization_mode,
                "profile-level-id": config.h264_profile_level_id,
                "level-asymmetry-allowed": config.h264_level_asymmetry_allowed,
            },
            "rtcpFeedback": [
                {"type": "nack"},
                {"type": "nack", "parameter": "pli"},
                {"type": "ccm", "parameter": "fir"},
                {"type": "goog-remb"},
            ],
        }],
        "encodings": [{"ssrc": ssrc}],
        "headerExtensions": [],
        "rtcp": {
            "cname": format!("nuvion-{}", config.device_username),
            "reducedSize": true,
        },
    })
}
