use std::fmt;

use thiserror::Error;

use crate::external::document_store::DocumentStoreError;
use crate::external::market_data::MarketDataError;

/// Pipeline stage a symbol failure happened in, used for the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Aggregate,
    Render,
    Publish,
    Sync,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Aggregate => "aggregate",
            Stage::Render => "render",
            Stage::Publish => "publish",
            Stage::Sync => "sync",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Data fetch error: {0}")]
    DataFetch(#[from] MarketDataError),
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
    #[error("Render error: {0}")]
    Render(String),
    #[error("Publish error: {0}")]
    Publish(#[from] std::io::Error),
    #[error("Sync error: {0}")]
    Sync(#[from] DocumentStoreError),
}

impl PipelineError {
    /// Stage a per-symbol error belongs to. Config errors never reach a symbol.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Config(_) | PipelineError::DataFetch(_) => Stage::Fetch,
            PipelineError::InsufficientData(_) => Stage::Aggregate,
            PipelineError::Render(_) => Stage::Render,
            PipelineError::Publish(_) => Stage::Publish,
            PipelineError::Sync(_) => Stage::Sync,
        }
    }
}

impl From<csv::Error> for PipelineError {
    fn from(value: csv::Error) -> Self {
        PipelineError::Render(format!("csv: {}", value))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid field `{field}`: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_mapping() {
        let err = PipelineError::InsufficientData("1 bar".into());
        assert_eq!(err.stage(), Stage::Aggregate);

        let err = PipelineError::DataFetch(MarketDataError::Empty("JM2601".into()));
        assert_eq!(err.stage(), Stage::Fetch);
        assert_eq!(err.stage().to_string(), "fetch");
    }

    #[test]
    fn test_invalid_config_message() {
        let err = ConfigError::invalid("freq", "unsupported interval 7m");
        assert_eq!(err.to_string(), "invalid field `freq`: unsupported interval 7m");
    }
}
