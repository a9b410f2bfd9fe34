//! Request and result types for the inference gateway.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{LlmAppError, Result};

/// Name of the database function invoked when a request does not override it.
pub const DEFAULT_INFERENCE_FUNCTION: &str = "run_llm_inference_task";

/// Experiment that receives prompt tracking records.
pub const DEFAULT_TRACKING_EXPERIMENT: &str = "llm_inference_tracking";

/// Pipeline task understood by the inference function.
///
/// Tasks use the hub's kebab-case names; anything unrecognised is carried
/// through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Task {
    Summarization,
    QuestionAnswering,
    TextGeneration,
    Other(String),
}

impl Task {
    pub fn as_str(&self) -> &str {
        match self {
            Task::Summarization => "summarization",
            Task::QuestionAnswering => "question-answering",
            Task::TextGeneration => "text-generation",
            Task::Other(name) => name,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Task {
    fn from(s: String) -> Self {
        match s.as_str() {
            "summarization" => Task::Summarization,
            "question-answering" => Task::QuestionAnswering,
            "text-generation" => Task::TextGeneration,
            _ => Task::Other(s),
        }
    }
}

impl From<Task> for String {
    fn from(task: Task) -> Self {
        task.as_str().to_string()
    }
}

impl FromStr for Task {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Task::from(s.trim().to_string()))
    }
}

/// One call into the inference function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub prompt: String,
    pub task: Task,
    pub model_name: String,
    pub experiment_name: String,
    /// Restrict retrieval context to the top-k most similar documents
    pub use_topk: bool,
    pub inference_function_name: String,
}

impl InferenceRequest {
    pub fn new(prompt: impl Into<String>, task: Task, model_name: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            task,
            model_name: model_name.into(),
            experiment_name: DEFAULT_TRACKING_EXPERIMENT.to_string(),
            use_topk: true,
            inference_function_name: DEFAULT_INFERENCE_FUNCTION.to_string(),
        }
    }

    pub fn with_experiment(mut self, experiment_name: impl Into<String>) -> Self {
        self.experiment_name = experiment_name.into();
        self
    }

    pub fn with_topk(mut self, use_topk: bool) -> Self {
        self.use_topk = use_topk;
        self
    }

    pub fn with_inference_function(mut self, name: impl Into<String>) -> Self {
        self.inference_function_name = name.into();
        self
    }

    /// Check the request before any I/O happens.
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(LlmAppError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }
        if self.model_name.trim().is_empty() {
            return Err(LlmAppError::InvalidRequest(
                "model name must not be empty".to_string(),
            ));
        }
        if self.inference_function_name.trim().is_empty() {
            return Err(LlmAppError::InvalidRequest(
                "inference function name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The top-k flag as the database function expects it.
    pub fn topk_indicator(&self) -> &'static str {
        if self.use_topk {
            "y"
        } else {
            "n"
        }
    }

    /// Experiment the caller attributed this request to, if any.
    pub fn request_experiment(&self) -> Option<&str> {
        let name = self.experiment_name.trim();
        (!name.is_empty()).then_some(name)
    }
}

/// Answer returned by the inference function, with the source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub doc_url: Option<String>,
    pub answer: String,
}

impl InferenceResult {
    /// Destructure the function's result object.
    ///
    /// `result` is required; `doc_url` may be absent or null. A non-string
    /// `result` is kept as its JSON text.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            LlmAppError::MalformedResult(format!("expected an object, got {}", value))
        })?;

        let answer = match object.get("result") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => {
                return Err(LlmAppError::MalformedResult(
                    "missing 'result' field".to_string(),
                ))
            }
            Some(other) => other.to_string(),
        };

        let doc_url = match object.get("doc_url") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => {
                return Err(LlmAppError::MalformedResult(format!(
                    "'doc_url' must be a string or null, got {}",
                    other
                )))
            }
        };

        Ok(Self { doc_url, answer })
    }
}

/// Prompt/response pairs written to the tracking store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptLogRecord {
    pub model_name: String,
    pub inputs: Vec<String>,
    /// JSON-encoded answers, one per input
    pub outputs: Vec<String>,
}

impl PromptLogRecord {
    pub fn from_exchange(model_name: &str, prompt: &str, result: &InferenceResult) -> Self {
        let encoded = serde_json::Value::String(result.answer.clone()).to_string();
        Self {
            model_name: model_name.to_string(),
            inputs: vec![prompt.to_string()],
            outputs: vec![encoded],
        }
    }

    /// Table in MLflow's `split` layout: one row per prompt.
    pub fn to_table(&self) -> serde_json::Value {
        let data: Vec<serde_json::Value> = self
            .inputs
            .iter()
            .zip(self.outputs.iter())
            .map(|(input, output)| serde_json::json!([self.model_name, input, output]))
            .collect();
        serde_json::json!({
            "columns": ["model", "inputs", "outputs"],
            "data": data,
        })
    }
}
