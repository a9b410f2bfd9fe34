//! Unified error type for llmapp operations.
//!
//! Each service client keeps its own error enum; [`LlmAppError`] wraps them so
//! every public operation returns one `Result` type, whether it talks to the
//! database, the hub, MLflow or DataHub.

use std::path::PathBuf;

use crate::catalog::CatalogError;
use crate::hub::HubError;
use crate::mlflow::MlflowError;
use crate::promote::PromotionError;
use crate::security::SecurityError;
use crate::shard::ShardError;

#[derive(Debug, thiserror::Error)]
pub enum LlmAppError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error("inference function '{function}' returned no rows")]
    EmptyResult { function: String },

    #[error("malformed inference result: {0}")]
    MalformedResult(String),

    #[error("no model class could load '{model}': {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("model '{0}' has no tokenizer files")]
    MissingTokenizer(String),

    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Mlflow(#[from] MlflowError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Shard(#[from] ShardError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Promotion(#[from] PromotionError),
}

impl LlmAppError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LlmAppError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmAppError>;

/// Render an error and all of its sources, outermost first.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": caused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
