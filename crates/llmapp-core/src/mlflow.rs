//! MLflow REST client: experiments, runs, proxied artifacts and the model
//! registry.
//!
//! Two traits split the surface so callers can be tested against in-memory
//! fakes: [`ExperimentTracker`] for runs and artifacts, [`ModelRegistry`] for
//! registered models, versions and aliases. [`MlflowClient`] implements both
//! against a tracking server's `/api/2.0/mlflow` endpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{error_chain, Result};

const API_PREFIX: &str = "/api/2.0/mlflow";
const ARTIFACTS_PREFIX: &str = "/api/2.0/mlflow-artifacts/artifacts";

#[derive(Debug, Error)]
pub enum MlflowError {
    #[error("HTTP error")]
    Http(#[from] reqwest::Error),

    #[error("cannot read artifact file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("MLflow API error ({status}) {error_code}: {message}")]
    Api {
        status: u16,
        error_code: String,
        message: String,
    },

    #[error("unsupported artifact URI '{0}' (expected mlflow-artifacts:)")]
    UnsupportedArtifactUri(String),

    #[error("unexpected MLflow response: {0}")]
    Decode(String),
}

impl MlflowError {
    pub fn error_code(&self) -> Option<&str> {
        match self {
            MlflowError::Api { error_code, .. } => Some(error_code),
            _ => None,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        self.error_code() == Some("RESOURCE_ALREADY_EXISTS")
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            MlflowError::Api {
                status, error_code, ..
            } => error_code == "RESOURCE_DOES_NOT_EXIST" || *status == 404,
            _ => false,
        }
    }
}

/// Terminal state written when a run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
    #[serde(default)]
    pub run_name: Option<String>,
    pub artifact_uri: String,
}

impl RunInfo {
    /// `runs:/` URI of an artifact path inside this run.
    pub fn artifact_model_uri(&self, artifact_path: &str) -> String {
        format!("runs:/{}/{}", self.run_id, artifact_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Runs and artifacts.
#[async_trait]
pub trait ExperimentTracker: Send + Sync {
    /// Look an experiment up by name, creating it when missing.
    async fn get_or_create_experiment(&self, name: &str) -> std::result::Result<String, MlflowError>;

    async fn start_run(
        &self,
        experiment_id: &str,
        run_name: &str,
    ) -> std::result::Result<RunInfo, MlflowError>;

    async fn end_run(&self, run_id: &str, status: RunStatus) -> std::result::Result<(), MlflowError>;

    async fn set_tag(&self, run_id: &str, key: &str, value: &str)
        -> std::result::Result<(), MlflowError>;

    /// Store `content` at `artifact_path` relative to the run's artifact root.
    async fn log_artifact(
        &self,
        run: &RunInfo,
        artifact_path: &str,
        content: Vec<u8>,
    ) -> std::result::Result<(), MlflowError>;

    /// Stream the local file at `local` to `artifact_path`.
    async fn log_artifact_file(
        &self,
        run: &RunInfo,
        artifact_path: &str,
        local: &Path,
    ) -> std::result::Result<(), MlflowError>;
}

/// Registered models, versions and aliases.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Create a registered model; an existing one with the same name is kept.
    async fn create_registered_model(&self, name: &str) -> std::result::Result<(), MlflowError>;

    async fn create_model_version(
        &self,
        name: &str,
        source: &str,
        run_id: Option<&str>,
    ) -> std::result::Result<ModelVersion, MlflowError>;

    async fn set_registered_model_alias(
        &self,
        name: &str,
        alias: &str,
        version: &str,
    ) -> std::result::Result<(), MlflowError>;
}

/// Client for an MLflow tracking server.
pub struct MlflowClient {
    client: reqwest::Client,
    base_url: String,
}

impl MlflowClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_connect_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(MlflowError::from)?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}{}/{}", self.base_url, API_PREFIX, endpoint)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> std::result::Result<serde_json::Value, MlflowError> {
        let resp = self
            .client
            .post(self.api_url(endpoint))
            .json(body)
            .send()
            .await?;
        decode_response(resp).await
    }

    async fn get_json(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> std::result::Result<serde_json::Value, MlflowError> {
        let resp = self
            .client
            .get(self.api_url(endpoint))
            .query(query)
            .send()
            .await?;
        decode_response(resp).await
    }

    /// Raw response of the alias lookup endpoint.
    pub async fn registered_model_alias(
        &self,
        name: &str,
        alias: &str,
    ) -> std::result::Result<serde_json::Value, MlflowError> {
        self.get_json(
            "registered-models/alias",
            &[("name", name), ("alias", alias)],
        )
        .await
    }

    pub async fn get_model_version_by_alias(
        &self,
        name: &str,
        alias: &str,
    ) -> std::result::Result<ModelVersion, MlflowError> {
        let body = self.registered_model_alias(name, alias).await?;
        field(&body, "model_version")
    }

    /// URL that the artifact proxy serves `artifact_path` of `run` under.
    pub fn artifact_url(&self, run: &RunInfo, artifact_path: &str) -> std::result::Result<String, MlflowError> {
        let root = artifact_proxy_path(&run.artifact_uri)?;
        let relative = artifact_path.trim_start_matches('/');
        Ok(format!(
            "{}{}/{}/{}",
            self.base_url, ARTIFACTS_PREFIX, root, relative
        ))
    }
}

#[async_trait]
impl ExperimentTracker for MlflowClient {
    async fn get_or_create_experiment(&self, name: &str) -> std::result::Result<String, MlflowError> {
        match self
            .get_json("experiments/get-by-name", &[("experiment_name", name)])
            .await
        {
            Ok(body) => {
                let id: String = field(&body["experiment"], "experiment_id")?;
                Ok(id)
            }
            Err(e) if e.is_not_found() => {
                debug!("Creating MLflow experiment {}", name);
                match self
                    .post_json("experiments/create", &serde_json::json!({ "name": name }))
                    .await
                {
                    Ok(body) => field(&body, "experiment_id"),
                    // Lost a race with another creator
                    Err(e) if e.is_already_exists() => {
                        let body = self
                            .get_json("experiments/get-by-name", &[("experiment_name", name)])
                            .await?;
                        field(&body["experiment"], "experiment_id")
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn start_run(
        &self,
        experiment_id: &str,
        run_name: &str,
    ) -> std::result::Result<RunInfo, MlflowError> {
        let body = self
            .post_json(
                "runs/create",
                &serde_json::json!({
                    "experiment_id": experiment_id,
                    "run_name": run_name,
                    "start_time": chrono::Utc::now().timestamp_millis(),
                    "tags": [{ "key": "mlflow.runName", "value": run_name }],
                }),
            )
            .await?;
        field(&body["run"], "info")
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> std::result::Result<(), MlflowError> {
        self.post_json(
            "runs/update",
            &serde_json::json!({
                "run_id": run_id,
                "status": status.as_str(),
                "end_time": chrono::Utc::now().timestamp_millis(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn set_tag(
        &self,
        run_id: &str,
        key: &str,
        value: &str,
    ) -> std::result::Result<(), MlflowError> {
        self.post_json(
            "runs/set-tag",
            &serde_json::json!({ "run_id": run_id, "key": key, "value": value }),
        )
        .await?;
        Ok(())
    }

    async fn log_artifact(
        &self,
        run: &RunInfo,
        artifact_path: &str,
        content: Vec<u8>,
    ) -> std::result::Result<(), MlflowError> {
        let url = self.artifact_url(run, artifact_path)?;
        debug!("Uploading artifact {} ({} bytes)", artifact_path, content.len());
        let resp = self.client.put(&url).body(content).send().await?;
        decode_response(resp).await?;
        Ok(())
    }

    async fn log_artifact_file(
        &self,
        run: &RunInfo,
        artifact_path: &str,
        local: &Path,
    ) -> std::result::Result<(), MlflowError> {
        let url = self.artifact_url(run, artifact_path)?;
        let io_err = |source| MlflowError::Io {
            path: local.to_path_buf(),
            source,
        };
        let file = tokio::fs::File::open(local).await.map_err(io_err)?;
        let size = file.metadata().await.map_err(io_err)?.len();
        debug!("Streaming artifact {} ({} bytes)", artifact_path, size);
        let resp = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(reqwest::Body::from(file))
            .send()
            .await?;
        decode_response(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl ModelRegistry for MlflowClient {
    async fn create_registered_model(&self, name: &str) -> std::result::Result<(), MlflowError> {
        match self
            .post_json("registered-models/create", &serde_json::json!({ "name": name }))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => {
                debug!("Registered model {} already exists", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn create_model_version(
        &self,
        name: &str,
        source: &str,
        run_id: Option<&str>,
    ) -> std::result::Result<ModelVersion, MlflowError> {
        let mut body = serde_json::json!({ "name": name, "source": source });
        if let Some(run_id) = run_id {
            body["run_id"] = serde_json::Value::String(run_id.to_string());
        }
        let resp = self.post_json("model-versions/create", &body).await?;
        field(&resp, "model_version")
    }

    async fn set_registered_model_alias(
        &self,
        name: &str,
        alias: &str,
        version: &str,
    ) -> std::result::Result<(), MlflowError> {
        self.post_json(
            "registered-models/alias",
            &serde_json::json!({ "name": name, "alias": alias, "version": version }),
        )
        .await?;
        Ok(())
    }
}

/// Run `work` inside a tracked run, ending it `FINISHED` or `FAILED`.
///
/// A failure to end the run is logged; the outcome of `work` wins.
pub async fn with_run<T, F, Fut>(
    tracker: &dyn ExperimentTracker,
    experiment_id: &str,
    run_name: &str,
    work: F,
) -> Result<T>
where
    F: FnOnce(RunInfo) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let run = tracker.start_run(experiment_id, run_name).await?;
    let run_id = run.run_id.clone();
    let outcome = work(run).await;
    let status = if outcome.is_ok() {
        RunStatus::Finished
    } else {
        RunStatus::Failed
    };
    if let Err(e) = tracker.end_run(&run_id, status).await {
        warn!(
            "Failed to end run {} ({}): {}",
            run_name,
            run_id,
            error_chain(&e)
        );
    }
    outcome
}

/// Strip the `mlflow-artifacts:` scheme (and any authority) from an
/// artifact URI, leaving the path the artifact proxy expects.
pub fn artifact_proxy_path(artifact_uri: &str) -> std::result::Result<String, MlflowError> {
    let rest = artifact_uri
        .strip_prefix("mlflow-artifacts:")
        .ok_or_else(|| MlflowError::UnsupportedArtifactUri(artifact_uri.to_string()))?;
    let rest = match rest.strip_prefix("//") {
        Some(with_authority) => match with_authority.find('/') {
            Some(idx) => &with_authority[idx..],
            None => "",
        },
        None => rest,
    };
    let path = rest.trim_matches('/');
    if path.is_empty() {
        return Err(MlflowError::UnsupportedArtifactUri(artifact_uri.to_string()));
    }
    Ok(path.to_string())
}

async fn decode_response(
    resp: reqwest::Response,
) -> std::result::Result<serde_json::Value, MlflowError> {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();

    if !status.is_success() {
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
        let error_code = parsed["error_code"]
            .as_str()
            .unwrap_or("UNKNOWN")
            .to_string();
        let message = parsed["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or(text);
        return Err(MlflowError::Api {
            status: status.as_u16(),
            error_code,
            message,
        });
    }

    if text.trim().is_empty() {
        return Ok(serde_json::Value::Object(Default::default()));
    }
    serde_json::from_str(&text).map_err(|e| MlflowError::Decode(e.to_string()))
}

fn field<T: serde::de::DeserializeOwned>(
    body: &serde_json::Value,
    name: &str,
) -> std::result::Result<T, MlflowError> {
    let value = body
        .get(name)
        .ok_or_else(|| MlflowError::Decode(format!("missing '{}' in {}", name, body)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| MlflowError::Decode(format!("'{}': {}", name, e)))
}
