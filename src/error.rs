use thiserror::Error;

/// Fatal construction errors from the media pipeline. Every other failure
/// category (auth, network, upload, muxer, classifier, signaling) is
/// logged and absorbed at its own call site rather than surfaced as a
/// typed error, since the policy there is "log and continue" rather than
/// "match on category".
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("pipeline error: {0}")]
    Pipeline(String),
}
