//! Error taxonomy for trial setup, local training and aggregation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FedError {
    /// Invalid options, unknown dataset defaults or mismatched metric name sets.
    /// Fatal before the first round.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown model '{0}' (registered: {1})")]
    UnknownModel(String, String),

    /// A single client's local step failed. The server drops the client for
    /// the round instead of propagating this.
    #[error("client {client_id} failed local training: {reason}")]
    ClientTraining { client_id: String, reason: String },

    /// Upstream contract breach: negative weights, diverging key sets or
    /// parameter shapes that do not line up.
    #[error("aggregation invariant violated: {0}")]
    AggregationInvariant(String),

    #[error("data error: {0}")]
    Data(String),

    #[error("metrics sink error: {0}")]
    Sink(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl FedError {
    pub fn config(msg: impl Into<String>) -> Self { FedError::Configuration(msg.into()) }
    pub fn invariant(msg: impl Into<String>) -> Self { FedError::AggregationInvariant(msg.into()) }

    /// Fatal errors abort the trial; client training failures do not.
    pub fn is_fatal(&self) -> bool { !matches!(self, FedError::ClientTraining { .. }) }
}

pub type Result<T> = std::result::Result<T, FedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_training_is_recoverable() {
        let e = FedError::ClientTraining { client_id: "f_001".into(), reason: "nan loss".into() };
        assert!(!e.is_fatal());
        assert!(FedError::config("clients_per_round must be > 0").is_fatal());
        assert!(e.to_string().contains("f_001"));
    }
}
