//! Service clients wired from configuration.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{info, warn};

use llmapp_core::gateway::{InferenceGateway, SqlInferenceBackend};
use llmapp_core::hub::HubClient;
use llmapp_core::mlflow::MlflowClient;
use llmapp_core::selection::{ModelSelector, SelectionConfig};
use llmapp_core::tracking::{MlflowPromptTracker, NoopPromptTracker, PromptTracker};

use crate::config::{Config, RegistryConfig, ENV_DB_URI, ENV_TRACKING_URI};

impl From<&RegistryConfig> for SelectionConfig {
    fn from(registry: &RegistryConfig) -> Self {
        SelectionConfig {
            model_name: registry.model_name.clone(),
            model_stage: registry.model_stage.clone(),
            model_alias: registry.model_alias.clone(),
            fallback_model_name: registry.fallback_model_name.clone(),
        }
    }
}

/// MLflow client when a tracking URI is configured.
pub fn mlflow_client(config: &Config) -> Result<Option<Arc<MlflowClient>>> {
    match config.tracking.uri.as_deref().map(str::trim) {
        Some(uri) if !uri.is_empty() => {
            let client = MlflowClient::with_connect_timeout(uri, config.http.connect_timeout())?;
            Ok(Some(Arc::new(client)))
        }
        _ => Ok(None),
    }
}

/// MLflow client, failing when no tracking URI is configured.
pub fn require_mlflow(config: &Config) -> Result<Arc<MlflowClient>> {
    mlflow_client(config)?.ok_or_else(|| {
        anyhow!(
            "no tracking server configured (set {} or tracking.uri)",
            ENV_TRACKING_URI
        )
    })
}

/// Gateway over the configured database, tracking prompts in MLflow when
/// available.
pub fn inference_gateway(config: &Config) -> Result<InferenceGateway> {
    let uri = config.database.uri.clone().ok_or_else(|| {
        anyhow!(
            "no database configured (set {} or database.uri)",
            ENV_DB_URI
        )
    })?;
    let backend = SqlInferenceBackend::new(uri, config.database.schema.clone())
        .with_max_connections(config.database.max_connections);

    let tracker: Arc<dyn PromptTracker> = match mlflow_client(config)? {
        Some(mlflow) => {
            info!(
                "Tracking prompts in {} (experiment {})",
                mlflow.base_url(),
                config.tracking.experiment
            );
            Arc::new(prompt_tracker(mlflow, config))
        }
        None => {
            warn!("No tracking server configured; prompts will not be tracked");
            Arc::new(NoopPromptTracker)
        }
    };

    Ok(InferenceGateway::new(Arc::new(backend), tracker))
}

fn prompt_tracker(mlflow: Arc<MlflowClient>, config: &Config) -> MlflowPromptTracker {
    MlflowPromptTracker::new(mlflow, config.tracking.experiment.clone())
}

pub fn model_selector(config: &Config) -> Result<ModelSelector> {
    Ok(ModelSelector::new(
        mlflow_client(config)?,
        SelectionConfig::from(&config.registry),
    ))
}

pub fn hub_client(config: &Config) -> Result<Arc<HubClient>> {
    let client = HubClient::with_connect_timeout(
        &config.hub.endpoint,
        config.hub.token.clone(),
        config.http.connect_timeout(),
    )?;
    Ok(Arc::new(client))
}
