pub mod client;
pub mod frame;

pub use client::{build_rtp_parameters, parse_rtp_sdp, OutboundHandle, SignalingClient};
