//! Champion model lookup in the model registry.

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::error_chain;
use crate::mlflow::MlflowClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionConfig {
    pub model_name: String,
    pub model_stage: String,
    pub model_alias: String,
    pub fallback_model_name: String,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            model_name: "tanzuhuggingface-dev".to_string(),
            model_stage: "Staging".to_string(),
            model_alias: "champion".to_string(),
            fallback_model_name: "tanzuhuggingface/dev".to_string(),
        }
    }
}

impl SelectionConfig {
    /// Name of the registered model that carries the alias.
    pub fn registry_name(&self) -> String {
        format!("{}-{}", self.model_name, self.model_stage.to_lowercase())
    }
}

/// Picks the base LLM for question answering.
pub struct ModelSelector {
    mlflow: Option<Arc<MlflowClient>>,
    config: SelectionConfig,
}

impl ModelSelector {
    pub fn new(mlflow: Option<Arc<MlflowClient>>, config: SelectionConfig) -> Self {
        Self { mlflow, config }
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Resolve the model behind the champion alias, or the fallback.
    ///
    /// Never fails: every lookup problem is logged and answered with the
    /// configured fallback identifier.
    pub async fn select_base_llm(&self) -> String {
        let fallback = &self.config.fallback_model_name;
        let Some(mlflow) = &self.mlflow else {
            warn!("No tracking URI configured; using fallback model {}", fallback);
            return fallback.clone();
        };

        let name = self.config.registry_name();
        let body = match mlflow
            .registered_model_alias(&name, &self.config.model_alias)
            .await
        {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    "Alias lookup for {}@{} failed ({}); using fallback model {}",
                    name,
                    self.config.model_alias,
                    error_chain(&e),
                    fallback
                );
                return fallback.clone();
            }
        };

        match resolve_source(&body) {
            Some(model) => {
                info!("Selected {} from {}@{}", model, name, self.config.model_alias);
                model
            }
            None => {
                warn!(
                    "Alias response for {} has no model source; using fallback model {}",
                    name, fallback
                );
                fallback.clone()
            }
        }
    }
}

/// Model identifier from an alias lookup response: `model_version.source`,
/// else `model_version.source_model_name`. Blank values do not count.
pub fn resolve_source(body: &serde_json::Value) -> Option<String> {
    let version = body.get("model_version")?;
    ["source", "source_model_name"]
        .iter()
        .filter_map(|key| version.get(*key).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}
