//! Publishing a pretrained model and its tokenizer to the hub.
//!
//! The model is resolved through an ordered list of task-specific model
//! classes, snapshotted into a local working directory, re-sharded, and
//! pushed to the target repository as two commits: model files first, then
//! tokenizer files.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{error_chain, LlmAppError, Result};
use crate::hub::{CommitInfo, HubClient, ModelInfo, RepoId, UploadFile};
use crate::security::{prepare_workdir, resolve_in_dir};
use crate::shard::{self, ShardReport};

pub const MODEL_COMMIT_MESSAGE: &str = "Upload model";
pub const TOKENIZER_COMMIT_MESSAGE: &str = "Upload tokenizer";

/// Model head a pretrained checkpoint is loaded as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelClass {
    CausalLm,
    QuestionAnswering,
    Generic,
}

impl ModelClass {
    /// Task-specific classes, in the order they are tried.
    pub const TASK_SPECIFIC: [ModelClass; 2] = [ModelClass::CausalLm, ModelClass::QuestionAnswering];

    /// Whether a checkpoint declaring `architectures` loads as this class.
    pub fn accepts(&self, architectures: &[String]) -> bool {
        let suffixes: &[&str] = match self {
            ModelClass::CausalLm => &["ForCausalLM", "LMHeadModel"],
            ModelClass::QuestionAnswering => &["ForQuestionAnswering"],
            ModelClass::Generic => return true,
        };
        architectures
            .iter()
            .any(|arch| suffixes.iter().any(|s| arch.ends_with(s)))
    }
}

impl fmt::Display for ModelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelClass::CausalLm => "causal-lm",
            ModelClass::QuestionAnswering => "question-answering",
            ModelClass::Generic => "generic",
        })
    }
}

/// Hub metadata of a pretrained checkpoint, fetched once per publish.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub model_name: String,
    pub info: ModelInfo,
    pub architectures: Vec<String>,
}

/// A checkpoint resolved to a model class.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub class: ModelClass,
    pub info: ModelInfo,
    pub architectures: Vec<String>,
}

#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn fetch(&self, model_name: &str) -> Result<Checkpoint>;

    async fn load(&self, checkpoint: &Checkpoint, class: ModelClass) -> Result<LoadedModel>;
}

/// Try the task-specific classes in order, then the generic class once.
pub async fn select_model_class(loader: &dyn ModelLoader, model_name: &str) -> Result<LoadedModel> {
    let checkpoint = loader.fetch(model_name).await?;
    for class in ModelClass::TASK_SPECIFIC {
        match loader.load(&checkpoint, class).await {
            Ok(loaded) => {
                info!("Loaded {} as {}", model_name, class);
                return Ok(loaded);
            }
            Err(e) => debug!("{} does not load as {}: {}", model_name, class, error_chain(&e)),
        }
    }
    warn!(
        "No task-specific class loads {}; falling back to {}",
        model_name,
        ModelClass::Generic
    );
    loader.load(&checkpoint, ModelClass::Generic).await
}

/// Resolves classes from the `architectures` declared in the checkpoint's
/// `config.json`.
pub struct HubModelLoader {
    hub: Arc<HubClient>,
}

impl HubModelLoader {
    pub fn new(hub: Arc<HubClient>) -> Self {
        Self { hub }
    }
}

#[derive(Deserialize)]
struct ModelConfig {
    #[serde(default)]
    architectures: Vec<String>,
}

#[async_trait]
impl ModelLoader for HubModelLoader {
    async fn fetch(&self, model_name: &str) -> Result<Checkpoint> {
        let repo: RepoId = model_name.parse()?;
        let info = self.hub.model_info(&repo, None).await?;
        let raw = self.hub.download(&repo, info.revision(), "config.json").await?;
        let config: ModelConfig = serde_json::from_slice(&raw).map_err(|e| LlmAppError::ModelLoad {
            model: model_name.to_string(),
            reason: format!("config.json: {}", e),
        })?;
        Ok(Checkpoint {
            model_name: model_name.to_string(),
            info,
            architectures: config.architectures,
        })
    }

    async fn load(&self, checkpoint: &Checkpoint, class: ModelClass) -> Result<LoadedModel> {
        if !class.accepts(&checkpoint.architectures) {
            return Err(LlmAppError::ModelLoad {
                model: checkpoint.model_name.clone(),
                reason: format!(
                    "architectures {:?} do not fit {}",
                    checkpoint.architectures, class
                ),
            });
        }
        Ok(LoadedModel {
            class,
            info: checkpoint.info.clone(),
            architectures: checkpoint.architectures.clone(),
        })
    }
}

/// Which save a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Model,
    Tokenizer,
}

impl FileRole {
    /// Classify a repository file. Nested paths and files neither save
    /// produces (README, .gitattributes, ...) are `None`.
    pub fn classify(path: &str) -> Option<FileRole> {
        if path.contains('/') {
            return None;
        }
        let is_tokenizer = path.starts_with("tokenizer")
            || path.starts_with("vocab.")
            || path.starts_with("chat_template")
            || matches!(
                path,
                "special_tokens_map.json" | "added_tokens.json" | "merges.txt" | "spiece.model"
            )
            || path.ends_with(".model")
            || path.ends_with(".tiktoken");
        if is_tokenizer {
            return Some(FileRole::Tokenizer);
        }

        let is_model = matches!(path, "config.json" | "generation_config.json")
            || path.ends_with(".safetensors")
            || path.ends_with(".safetensors.index.json")
            || path.ends_with(".bin")
            || path.ends_with(".bin.index.json")
            || path.ends_with(".h5")
            || path.ends_with(".msgpack")
            || path.ends_with(".py");
        is_model.then_some(FileRole::Model)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPublicationSpec {
    pub repo_name: String,
    pub pretrained_model_name: String,
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub workdir: PathBuf,
    /// Maximum tensor bytes per safetensors shard
    pub max_shard_size: u64,
}

impl PublishSettings {
    pub fn new(workdir: impl Into<PathBuf>, max_shard_size: &str) -> Result<Self> {
        Ok(Self {
            workdir: workdir.into(),
            max_shard_size: shard::parse_shard_size(max_shard_size)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PublishReport {
    pub repo_name: String,
    pub model_class: ModelClass,
    pub local_dir: PathBuf,
    pub model_files: Vec<String>,
    pub tokenizer_files: Vec<String>,
    pub model_commit: CommitInfo,
    pub tokenizer_commit: CommitInfo,
    pub reshard: Option<ShardReport>,
}

pub struct ModelPublisher {
    hub: Arc<HubClient>,
    loader: Arc<dyn ModelLoader>,
    settings: PublishSettings,
}

impl ModelPublisher {
    pub fn new(hub: Arc<HubClient>, loader: Arc<dyn ModelLoader>, settings: PublishSettings) -> Self {
        Self {
            hub,
            loader,
            settings,
        }
    }

    /// Push `spec.pretrained_model_name` to `spec.repo_name`.
    pub async fn publish_model(&self, spec: &ModelPublicationSpec) -> Result<PublishReport> {
        let target: RepoId = spec.repo_name.parse()?;
        let source: RepoId = spec.pretrained_model_name.parse()?;

        let repo_url = self.hub.create_repo(&target, true).await?;
        info!("Publishing {} to {}", source, repo_url);

        let loaded = select_model_class(self.loader.as_ref(), &spec.pretrained_model_name).await?;

        let workdir = prepare_workdir(&self.settings.workdir)?;
        let local_dir = resolve_in_dir(&workdir, &source.to_string())?;
        if local_dir.exists() {
            tokio::fs::remove_dir_all(&local_dir)
                .await
                .map_err(|e| LlmAppError::io(&local_dir, e))?;
        }
        tokio::fs::create_dir_all(&local_dir)
            .await
            .map_err(|e| LlmAppError::io(&local_dir, e))?;

        let revision = loaded.info.revision().to_string();
        let mut has_tokenizer = false;
        for file in loaded.info.files() {
            let Some(role) = FileRole::classify(file) else {
                continue;
            };
            has_tokenizer |= role == FileRole::Tokenizer;
            self.hub
                .download_to(&source, &revision, file, &local_dir)
                .await?;
        }
        if !has_tokenizer {
            return Err(LlmAppError::MissingTokenizer(
                spec.pretrained_model_name.clone(),
            ));
        }

        let max = self.settings.max_shard_size;
        let shard_dir = local_dir.clone();
        let reshard = tokio::task::spawn_blocking(move || shard::reshard_dir(&shard_dir, max))
            .await
            .map_err(|e| LlmAppError::io(&local_dir, std::io::Error::other(e)))??;
        if let Some(report) = &reshard {
            info!(
                "Re-sharded {} into {} file(s)",
                source,
                report.files.len()
            );
        }

        let (model_files, tokenizer_files) = snapshot_files(&local_dir).await?;
        let model_commit = self
            .push(&target, &local_dir, &model_files, MODEL_COMMIT_MESSAGE)
            .await?;
        let tokenizer_commit = self
            .push(&target, &local_dir, &tokenizer_files, TOKENIZER_COMMIT_MESSAGE)
            .await?;

        Ok(PublishReport {
            repo_name: target.to_string(),
            model_class: loaded.class,
            local_dir,
            model_files,
            tokenizer_files,
            model_commit,
            tokenizer_commit,
            reshard,
        })
    }

    async fn push(
        &self,
        repo: &RepoId,
        dir: &Path,
        files: &[String],
        message: &str,
    ) -> Result<CommitInfo> {
        let mut uploads = Vec::with_capacity(files.len());
        for name in files {
            uploads.push(UploadFile::prepare(&dir.join(name), name).await?);
        }
        Ok(self.hub.push_files(repo, &uploads, message).await?)
    }
}

/// Model and tokenizer files in a snapshot directory, sorted.
async fn snapshot_files(dir: &Path) -> Result<(Vec<String>, Vec<String>)> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| LlmAppError::io(dir, e))?;
    let mut model = Vec::new();
    let mut tokenizer = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| LlmAppError::io(dir, e))?
    {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        match FileRole::classify(&name) {
            Some(FileRole::Model) => model.push(name),
            Some(FileRole::Tokenizer) => tokenizer.push(name),
            None => {}
        }
    }
    model.sort();
    tokenizer.sort();
    Ok((model, tokenizer))
}
