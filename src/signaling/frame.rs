//! SockJS/STOMP-ish framing for the signaling channel.
//!
//! Inbound WebSocket text messages are wrapped as `a[<json array of raw
//! frames>]`; outbound messages are wrapped as `[<raw frame>]`. Each raw
//! frame is a newline-delimited header block, a blank line, and a
//! NUL-terminated body.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Builds a `CONNECT` frame with `accept-version`, `heart-beat`, and the
/// bearer `Authorization` header.
pub fn build_connect_frame(token: &str) -> String {
    format!(
        "CONNECT\naccept-version:1.2,1.1,1.0\nheart-beat:10000,10000\nAuthorization:Bearer {}\n\n\x00",
        token
    )
}

/// Builds a `SUBSCRIBE` frame for `destination` with the given `id`.
pub fn build_subscribe_frame(destination: &str, id: &str) -> String {
    format!(
        "SUBSCRIBE\nid:{}\ndestination:{}\n\n\x00",
        id, destination
    )
}

/// Builds a `SEND` frame carrying a JSON body to `destination`.
pub fn build_send_frame(destination: &str, payload: &Value) -> String {
    format!(
        "SEND\ndestination:{}\ncontent-type:application/json\n\n{}\x00",
        destination, payload
    )
}

/// Parses one raw STOMP-ish frame string (header block, blank line,
/// NUL-terminated body) into its command, headers, and body.
pub fn unpack_frame(raw: &str) -> Option<StompFrame> {
    let trimmed = raw.trim_end_matches('\0');
    let mut parts = trimmed.splitn(2, "\n\n");
    let head = parts.next()?;
    let body = parts.next().unwrap_or("").to_string();

    let mut lines = head.lines();
    let command = lines.next()?.to_string();
    let headers = lines
        .filter_map(|line| {
            let mut kv = line.splitn(2, ':');
            let k = kv.next()?.to_string();
            let v = kv.next().unwrap_or("").to_string();
            Some((k, v))
        })
        .collect();

    Some(StompFrame {
        command,
        headers,
        body,
    })
}

/// Unwraps an inbound `a[<json array>]` WebSocket payload into its raw
/// frame strings. Returns an empty vec for any other message shape (e.g.
/// heartbeats) so a malformed or unrecognized frame is skipped rather than
/// aborting the session.
pub fn unwrap_inbound(message: &str) -> Vec<String> {
    let Some(rest) = message.strip_prefix("a[") else {
        return Vec::new();
    };
    let json_str = format!("[{}", rest);
    serde_json::from_str::<Vec<String>>(&json_str).unwrap_or_default()
}

/// Wraps a single raw frame string as the outbound `[<raw frame>]` payload.
pub fn wrap_outbound(frame: &str) -> String {
    serde_json::to_string(&vec![frame]).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frame_carries_required_headers() {
        let frame = build_connect_frame("tok123");
        assert!(frame.starts_with("CONNECT\n"));
        assert!(frame.contains("accept-version:1.2,1.1,1.0"));
        assert!(frame.contains("heart-beat:10000,10000"));
        assert!(frame.contains("Authorization:Bearer tok123"));
        assert!(frame.ends_with('\0'));
    }

    #[test]
    fn unpack_frame_splits_headers_and_body() {
        let raw = "MESSAGE\ndestination:/user/queue/command\nsubscription:sub-command\n\n{\"type\":\"RTP_ENDPOINT_READY\"}\x00";
        let frame = unpack_frame(raw).unwrap();
        assert_eq!(frame.command, "MESSAGE");
        assert_eq!(
            frame.header("destination"),
            Some("/user/queue/command")
        );
        assert_eq!(frame.body, "{\"type\":\"RTP_ENDPOINT_READY\"}");
    }

    #[test]
    fn unwrap_inbound_extracts_frame_array() {
        let raw = "a[\"CONNECTED\\nversion:1.2\\n\\n\\u0000\"]";
        let frames = unwrap_inbound(raw);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with("CONNECTED"));
    }

    #[test]
    fn unwrap_inbound_ignores_non_a_bracket_messages() {
        assert!(unwrap_inbound("h").is_empty());
        assert!(unwrap_inbound("o").is_empty());
    }

    #[test]
    fn wrap_outbound_produces_single_element_array() {
        let wrapped = wrap_outbound("SEND\n\n\x00");
        assert_eq!(wrapped, "[\"SEND\\n\\n\\u0000\"]");
    }
}
