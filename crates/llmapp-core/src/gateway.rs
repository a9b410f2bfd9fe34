//! Inference gateway: runs a prompt through the database-resident inference
//! function and records the exchange.
//!
//! The database does all the work (retrieval, embedding lookup, generation);
//! the gateway only builds the call, destructures its JSON result and hands
//! the prompt/answer pair to a [`PromptTracker`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{error_chain, LlmAppError, Result};
use crate::request::{InferenceRequest, InferenceResult, PromptLogRecord};
use crate::security::SecretString;
use crate::tracking::PromptTracker;

/// Something that can evaluate an inference request into the function's raw
/// JSON result.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn invoke(&self, request: &InferenceRequest) -> Result<serde_json::Value>;

    fn backend_name(&self) -> &str;
}

/// Calls `{schema}.{function}(prompt, task, model, use_topk)` over SQL and
/// reads the JSON-encoded result column.
pub struct SqlInferenceBackend {
    url: SecretString,
    schema: String,
    max_connections: u32,
}

impl SqlInferenceBackend {
    pub fn new(url: impl Into<SecretString>, schema: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            schema: schema.into(),
            max_connections: 5,
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// The statement sent for `function`. Identifiers cannot be bound as
    /// parameters, so both are validated before interpolation.
    pub fn statement(&self, function: &str) -> Result<String> {
        check_identifier("schema", &self.schema)?;
        check_identifier("inference function", function)?;
        Ok(format!(
            "SELECT CAST(to_json({schema}.{function}($1, $2, $3, $4)) AS TEXT) AS {function}",
            schema = self.schema,
            function = function
        ))
    }
}

#[async_trait]
impl InferenceBackend for SqlInferenceBackend {
    async fn invoke(&self, request: &InferenceRequest) -> Result<serde_json::Value> {
        use sqlx::Row;

        let function = request.inference_function_name.trim();
        let statement = self.statement(function)?;

        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(self.url.expose())
            .await?;

        let row = sqlx::query(&statement)
            .bind(request.prompt.as_str())
            .bind(request.task.as_str())
            .bind(request.model_name.as_str())
            .bind(request.topk_indicator())
            .fetch_optional(&pool)
            .await;
        pool.close().await;

        let Some(row) = row? else {
            return Err(LlmAppError::EmptyResult {
                function: function.to_string(),
            });
        };

        // Unquoted aliases are case-folded by the server; read by position.
        let text: Option<String> = row.try_get(0usize)?;
        decode_result_column(function, text)
    }

    fn backend_name(&self) -> &str {
        "sql"
    }
}

/// Parse the JSON text the inference function's result column holds.
pub fn decode_result_column(function: &str, text: Option<String>) -> Result<serde_json::Value> {
    let text = text.ok_or_else(|| LlmAppError::EmptyResult {
        function: function.to_string(),
    })?;
    serde_json::from_str(&text)
        .map_err(|e| LlmAppError::MalformedResult(format!("result is not JSON: {}", e)))
}

/// SQL identifiers accepted for the schema and function names.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_identifier(kind: &str, name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(LlmAppError::InvalidRequest(format!(
            "{} '{}' is not a valid SQL identifier",
            kind, name
        )))
    }
}

/// Entry point for running inference tasks.
#[derive(Clone)]
pub struct InferenceGateway {
    backend: Arc<dyn InferenceBackend>,
    tracker: Arc<dyn PromptTracker>,
}

impl InferenceGateway {
    pub fn new(backend: Arc<dyn InferenceBackend>, tracker: Arc<dyn PromptTracker>) -> Self {
        Self { backend, tracker }
    }

    /// Run one prompt and return the answer with its source document.
    ///
    /// Tracking happens after the answer is extracted; a tracking failure is
    /// logged and does not fail the call.
    pub async fn run_task(&self, request: &InferenceRequest) -> Result<InferenceResult> {
        request.validate()?;
        info!(
            "Running {} with {} via {} backend",
            request.task,
            request.model_name,
            self.backend.backend_name()
        );

        let result = match self.invoke_and_extract(request).await {
            Ok(result) => result,
            Err(e) => {
                error!("Inference failed: {}", error_chain(&e));
                return Err(e);
            }
        };
        debug!("Inference returned doc_url={:?}", result.doc_url);

        let record = PromptLogRecord::from_exchange(&request.model_name, &request.prompt, &result);
        if let Err(e) = self
            .tracker
            .track_prompts(&record, request.request_experiment())
            .await
        {
            warn!("Prompt tracking failed: {}", error_chain(&e));
        }

        Ok(result)
    }

    async fn invoke_and_extract(&self, request: &InferenceRequest) -> Result<InferenceResult> {
        let raw = self.backend.invoke(request).await?;
        InferenceResult::from_json(&raw)
    }
}
