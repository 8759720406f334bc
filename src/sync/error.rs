/// Failure classes surfaced by a synchronization cycle.
///
/// Internal helpers propagate `anyhow::Error`; the orchestrator classifies the
/// failure into one of these before logging or reporting it.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("panel API error: {0}")]
    Api(String),

    #[error("no active subscription")]
    NoSubscription,

    #[error("profile store rejected {operation}: {reason}")]
    ProfileStore { operation: &'static str, reason: String },

    #[error("engine call failed: {0}")]
    Engine(String),

    #[error("cache write failed: {0}")]
    Cache(String),
}

impl SyncError {
    /// True for fetch failures that are expected to clear on a later trigger.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Classify a fetch failure: panel-reported errors stay `Api`, anything
    /// else is treated as a transport failure.
    pub fn from_fetch(e: &anyhow::Error) -> Self {
        match e.downcast_ref::<Self>() {
            Some(Self::Api(reason)) => Self::Api(reason.clone()),
            _ => Self::Network(format!("{e:#}")),
        }
    }
}
