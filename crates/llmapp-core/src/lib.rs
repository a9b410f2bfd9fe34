//! # llmapp Core
//!
//! Service plumbing behind the llmapp demo: the database-backed inference
//! gateway, MLflow tracking and registry access, Hugging Face Hub
//! publishing, and DataHub metadata emission.
//!
//! Nothing in this crate runs a model. Every computation is delegated to an
//! external service; the crate marshals requests into those services and
//! turns their responses into typed values.
//!
//! ## Modules
//!
//! - [`gateway`]: Runs a prompt through the database-resident inference function
//! - [`selection`]: Resolves the champion model from the registry, with fallback
//! - [`publish`]: Pushes a pretrained model and its tokenizer to the hub
//! - [`promote`]: Logs, registers and aliases a model in the staging namespace
//! - [`catalog`]: Emits model card metadata to DataHub
//! - [`hub`] / [`mlflow`]: REST clients for the Hugging Face Hub and MLflow
//! - [`shard`]: Safetensors re-sharding under a maximum shard size
//! - [`dedup`]: Content-hash keyed de-duplication of UI requests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use llmapp_core::gateway::{InferenceGateway, SqlInferenceBackend};
//! use llmapp_core::tracking::NoopPromptTracker;
//! use llmapp_core::{InferenceRequest, Task};
//!
//! let backend = SqlInferenceBackend::new("postgres://localhost/llm", "public");
//! let gateway = InferenceGateway::new(Arc::new(backend), Arc::new(NoopPromptTracker));
//!
//! let request = InferenceRequest::new("What is Tanzu?", Task::Summarization, "tanzuhuggingface/dev");
//! let result = gateway.run_task(&request).await?;
//! println!("{} ({:?})", result.answer, result.doc_url);
//! ```

pub mod card;
pub mod catalog;
pub mod dedup;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod mlflow;
pub mod promote;
pub mod publish;
pub mod request;
pub mod security;
pub mod selection;
pub mod shard;
pub mod tracking;

pub use error::{LlmAppError, Result};
pub use request::{InferenceRequest, InferenceResult, PromptLogRecord, Task};
pub use security::SecretString;
