/// Failures at the three external boundaries of a sync cycle.
///
/// Every variant is recoverable at cycle granularity; none of them should
/// take the process down.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("malformed portal data: {0}")]
    MalformedData(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl SyncError {
    /// Per-consumption-type failures that only blank out that type.
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::MalformedData(_))
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::MalformedData(e.to_string())
        } else {
            Self::Fetch(e.to_string())
        }
    }
}

impl From<rumqttc::ClientError> for SyncError {
    fn from(e: rumqttc::ClientError) -> Self {
        Self::Transport(e.to_string())
    }
}
