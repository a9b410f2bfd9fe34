//! Promotion of a hub model into the registry's staging namespace.
//!
//! A promotion logs the model as a `transformers` pipeline artifact in a
//! tracked run, registers a version from that run, copies the version into
//! `{name}-staging` and points the `champion` alias at the copy. Each step
//! advances a [`PromotionStage`]; nothing is rolled back on failure, and the
//! error reports the last stage that completed.

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::{error_chain, LlmAppError, Result};
use crate::hub::{HubClient, RepoId};
use crate::mlflow::{ExperimentTracker, ModelRegistry, RunInfo, RunStatus};
use crate::publish::FileRole;
use crate::security::resolve_in_dir;

pub const CHAMPION_ALIAS: &str = "champion";
pub const PROMOTION_RUN: &str = "promote_model_to_staging";
pub const LOG_MODEL_HISTORY_TAG: &str = "mlflow.log-model.history";

/// Registry name for a hub model: `org/name` becomes `org-name`.
pub fn registered_model_name(model_name: &str) -> String {
    model_name.replace('/', "-")
}

pub fn staging_model_name(registered_name: &str) -> String {
    format!("{}-staging", registered_name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionSpec {
    pub model_name: String,
    /// Pipeline task; also the artifact path inside the run
    pub pipeline_name: String,
    pub persist_model_copy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PromotionStage {
    Started,
    Logged,
    Registered,
    Staged,
    Aliased,
}

impl fmt::Display for PromotionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PromotionStage::Started => "started",
            PromotionStage::Logged => "logged",
            PromotionStage::Registered => "registered",
            PromotionStage::Staged => "staged",
            PromotionStage::Aliased => "aliased",
        })
    }
}

#[derive(Debug, Error)]
#[error("promotion failed after stage '{stage}'")]
pub struct PromotionError {
    pub stage: PromotionStage,
    #[source]
    pub source: Box<LlmAppError>,
}

impl PromotionError {
    fn at(stage: PromotionStage, source: impl Into<LlmAppError>) -> Self {
        Self {
            stage,
            source: Box::new(source.into()),
        }
    }
}

/// Hub model resolved to a pinned revision and file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformersPipeline {
    pub task: String,
    pub model_name: String,
    pub revision: String,
    pub files: Vec<String>,
}

/// Whether an artifact carries the weights or only references the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPersistence {
    FullCopy,
    LinkOnly,
}

/// Where promoted models come from.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn describe(&self, model_name: &str, task: &str) -> Result<TransformersPipeline>;

    /// Download `file` into `dir`, returning the local path.
    async fn fetch_to(
        &self,
        model_name: &str,
        revision: &str,
        file: &str,
        dir: &Path,
    ) -> Result<PathBuf>;
}

#[async_trait]
impl ModelSource for HubClient {
    async fn describe(&self, model_name: &str, task: &str) -> Result<TransformersPipeline> {
        let repo: RepoId = model_name.parse()?;
        let info = self.model_info(&repo, None).await?;
        Ok(TransformersPipeline {
            task: task.to_string(),
            model_name: model_name.to_string(),
            revision: info.revision().to_string(),
            files: info.files().map(str::to_string).collect(),
        })
    }

    async fn fetch_to(
        &self,
        model_name: &str,
        revision: &str,
        file: &str,
        dir: &Path,
    ) -> Result<PathBuf> {
        let repo: RepoId = model_name.parse()?;
        Ok(self.download_to(&repo, revision, file, dir).await?)
    }
}

#[derive(Serialize)]
struct MlModel<'a> {
    artifact_path: &'a str,
    flavors: BTreeMap<&'static str, serde_json::Value>,
    model_uuid: String,
    run_id: &'a str,
    utc_time_created: String,
}

fn model_uuid(run_id: &str, artifact_path: &str, persistence: ModelPersistence, created: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(artifact_path.as_bytes());
    hasher.update([persistence as u8]);
    hasher.update(created.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Render the `MLmodel` descriptor for a pipeline artifact.
pub fn mlmodel_descriptor(
    pipeline: &TransformersPipeline,
    persistence: ModelPersistence,
    run: &RunInfo,
    artifact_path: &str,
) -> std::result::Result<String, serde_yaml::Error> {
    let created = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string();
    let mut transformers = serde_json::json!({
        "code": null,
        "components": ["tokenizer"],
        "framework": "pt",
        "source_model_name": pipeline.model_name,
        "source_model_revision": pipeline.revision,
        "task": pipeline.task,
    });
    if persistence == ModelPersistence::FullCopy {
        transformers["model_binary"] = serde_json::json!("model");
    }

    let mut flavors = BTreeMap::new();
    flavors.insert(
        "python_function",
        serde_json::json!({"loader_module": "mlflow.transformers"}),
    );
    flavors.insert("transformers", transformers);

    serde_yaml::to_string(&MlModel {
        artifact_path,
        flavors,
        model_uuid: model_uuid(&run.run_id, artifact_path, persistence, &created),
        run_id: &run.run_id,
        utc_time_created: created,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionReport {
    pub run_id: String,
    pub registered_name: String,
    pub registered_version: String,
    pub staging_name: String,
    pub staging_version: String,
    pub alias: String,
    /// Model artifacts logged: 2 with a full copy, 1 link-only
    pub artifacts_logged: usize,
}

pub struct ModelPromoter {
    source: Arc<dyn ModelSource>,
    tracker: Arc<dyn ExperimentTracker>,
    registry: Arc<dyn ModelRegistry>,
    experiment: String,
    /// Full copies are downloaded here, one subdirectory per run
    staging_dir: PathBuf,
}

impl ModelPromoter {
    pub fn new(
        source: Arc<dyn ModelSource>,
        tracker: Arc<dyn ExperimentTracker>,
        registry: Arc<dyn ModelRegistry>,
        experiment: impl Into<String>,
    ) -> Self {
        Self {
            source,
            tracker,
            registry,
            experiment: experiment.into(),
            staging_dir: std::env::temp_dir(),
        }
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    pub async fn promote_model_to_staging(
        &self,
        spec: &PromotionSpec,
    ) -> std::result::Result<PromotionReport, PromotionError> {
        let start = PromotionStage::Started;
        let experiment_id = self
            .tracker
            .get_or_create_experiment(&self.experiment)
            .await
            .map_err(|e| PromotionError::at(start, e))?;
        let run = self
            .tracker
            .start_run(&experiment_id, PROMOTION_RUN)
            .await
            .map_err(|e| PromotionError::at(start, e))?;

        let mut stage = start;
        let outcome = self.run_stages(&run, spec, &mut stage).await;

        let status = if outcome.is_ok() {
            RunStatus::Finished
        } else {
            RunStatus::Failed
        };
        if let Err(e) = self.tracker.end_run(&run.run_id, status).await {
            warn!(
                "Failed to end promotion run {}: {}",
                run.run_id,
                error_chain(&e)
            );
        }

        outcome.map_err(|e| {
            let err = PromotionError::at(stage, e);
            warn!("{}", error_chain(&err));
            err
        })
    }

    async fn run_stages(
        &self,
        run: &RunInfo,
        spec: &PromotionSpec,
        stage: &mut PromotionStage,
    ) -> Result<PromotionReport> {
        let artifact_path = spec.pipeline_name.as_str();
        let pipeline = self
            .source
            .describe(&spec.model_name, &spec.pipeline_name)
            .await?;

        let mut history = Vec::new();
        if spec.persist_model_copy {
            history.push(
                self.log_model(run, &pipeline, ModelPersistence::FullCopy, artifact_path)
                    .await?,
            );
        }
        history.push(
            self.log_model(run, &pipeline, ModelPersistence::LinkOnly, artifact_path)
                .await?,
        );
        self.tracker
            .set_tag(
                &run.run_id,
                LOG_MODEL_HISTORY_TAG,
                &serde_json::Value::Array(history.clone()).to_string(),
            )
            .await?;
        *stage = PromotionStage::Logged;

        let registered_name = registered_model_name(&spec.model_name);
        self.registry.create_registered_model(&registered_name).await?;
        let registered = self
            .registry
            .create_model_version(
                &registered_name,
                &run.artifact_model_uri(artifact_path),
                Some(&run.run_id),
            )
            .await?;
        *stage = PromotionStage::Registered;
        info!("Registered {} version {}", registered_name, registered.version);

        let staging_name = staging_model_name(&registered_name);
        self.registry.create_registered_model(&staging_name).await?;
        let staged = self
            .registry
            .create_model_version(
                &staging_name,
                &format!("models:/{}/{}", registered_name, registered.version),
                Some(&run.run_id),
            )
            .await?;
        *stage = PromotionStage::Staged;

        self.registry
            .set_registered_model_alias(&staging_name, CHAMPION_ALIAS, &staged.version)
            .await?;
        *stage = PromotionStage::Aliased;
        info!(
            "{}@{} now points to version {}",
            staging_name, CHAMPION_ALIAS, staged.version
        );

        Ok(PromotionReport {
            run_id: run.run_id.clone(),
            registered_name,
            registered_version: registered.version,
            staging_name,
            staging_version: staged.version,
            alias: CHAMPION_ALIAS.to_string(),
            artifacts_logged: history.len(),
        })
    }

    /// Log one pipeline artifact; returns its history entry.
    async fn log_model(
        &self,
        run: &RunInfo,
        pipeline: &TransformersPipeline,
        persistence: ModelPersistence,
        artifact_path: &str,
    ) -> Result<serde_json::Value> {
        if persistence == ModelPersistence::FullCopy {
            let staging = resolve_in_dir(&self.staging_dir, &format!("promote-{}", run.run_id))?;
            let copied = self
                .copy_model_files(run, pipeline, artifact_path, &staging)
                .await;
            if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", staging.display(), e);
                }
            }
            copied?;
        }

        let descriptor = mlmodel_descriptor(pipeline, persistence, run, artifact_path)
            .map_err(|e| LlmAppError::MalformedResult(format!("MLmodel: {}", e)))?;
        self.tracker
            .log_artifact(
                run,
                &format!("{}/MLmodel", artifact_path),
                descriptor.into_bytes(),
            )
            .await?;
        info!(
            "Logged {} ({:?}) at {}",
            pipeline.model_name, persistence, artifact_path
        );

        Ok(serde_json::json!({
            "run_id": run.run_id,
            "artifact_path": artifact_path,
            "utc_time_created": chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            "flavors": {"transformers": {"source_model_name": pipeline.model_name}},
        }))
    }

    /// Stream each model and tokenizer file through `staging` into the
    /// run's artifacts. Files are removed once uploaded.
    async fn copy_model_files(
        &self,
        run: &RunInfo,
        pipeline: &TransformersPipeline,
        artifact_path: &str,
        staging: &Path,
    ) -> Result<()> {
        tokio::fs::create_dir_all(staging)
            .await
            .map_err(|e| LlmAppError::io(staging, e))?;
        for file in &pipeline.files {
            let dest = match FileRole::classify(file) {
                Some(FileRole::Model) => format!("{}/model/{}", artifact_path, file),
                Some(FileRole::Tokenizer) => {
                    format!("{}/components/tokenizer/{}", artifact_path, file)
                }
                None => continue,
            };
            let local = self
                .source
                .fetch_to(&pipeline.model_name, &pipeline.revision, file, staging)
                .await?;
            self.tracker.log_artifact_file(run, &dest, &local).await?;
            tokio::fs::remove_file(&local)
                .await
                .map_err(|e| LlmAppError::io(&local, e))?;
        }
        Ok(())
    }
}
