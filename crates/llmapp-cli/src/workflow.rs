//! Model publishing workflow
//!
//! Publishes a pretrained model to the hub, promotes it into the staging
//! registry and emits its metadata to the catalog. Each step is a tracked
//! run; the first failure stops the workflow.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use llmapp_core::catalog::{send_metadata, MetadataSpec};
use llmapp_core::hub::HubClient;
use llmapp_core::mlflow::{with_run, ExperimentTracker};
use llmapp_core::promote::{ModelPromoter, PromotionReport, PromotionSpec};
use llmapp_core::publish::{HubModelLoader, ModelPublicationSpec, ModelPublisher, PublishReport, PublishSettings};
use llmapp_core::security::SecretString;

use crate::config::Config;
use crate::services;

pub const PUBLISH_RUN: &str = "publish_model";
pub const METADATA_RUN: &str = "send_metadata";

/// Parse a yes/no flag. Anything unrecognised is an error.
pub fn parse_yes_no(value: &str) -> std::result::Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" | "1" => Ok(true),
        "no" | "n" | "false" | "0" => Ok(false),
        other => Err(format!("expected yes or no, got '{}'", other)),
    }
}

/// Positional arguments of `llmapp publish`.
#[derive(Debug, Clone, PartialEq, Eq, clap::Args)]
pub struct PublishArgs {
    /// Target repository, also the registered model name (e.g. tanzuhuggingface/dev)
    pub model_name: String,

    /// Pretrained model to copy from (e.g. google/flan-t5-base)
    pub pretrained_model_name: String,

    /// Catalog platform (e.g. huggingface)
    pub platform: String,

    /// Catalog environment (e.g. DEV, PROD)
    pub env: String,

    /// Catalog GMS server URL
    pub gms_server: String,

    /// Description used when the model card has no body
    pub model_description: String,

    /// Pipeline task logged with the model (e.g. summarization)
    pub pipeline_name: String,

    /// Log a full copy of the weights (yes/no)
    #[arg(value_parser = parse_yes_no, action = clap::ArgAction::Set)]
    pub persist: bool,
}

impl PublishArgs {
    pub fn publication_spec(&self) -> ModelPublicationSpec {
        ModelPublicationSpec {
            repo_name: self.model_name.clone(),
            pretrained_model_name: self.pretrained_model_name.clone(),
        }
    }

    pub fn promotion_spec(&self) -> PromotionSpec {
        PromotionSpec {
            model_name: self.model_name.clone(),
            pipeline_name: self.pipeline_name.clone(),
            persist_model_copy: self.persist,
        }
    }

    pub fn metadata_spec(&self) -> MetadataSpec {
        let description = self.model_description.trim();
        MetadataSpec {
            model_name: self.model_name.clone(),
            platform: self.platform.clone(),
            env: self.env.clone(),
            gms_server: self.gms_server.clone(),
            model_description: (!description.is_empty()).then(|| description.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub publish: PublishReport,
    pub promotion: PromotionReport,
}

pub struct PublishWorkflow {
    hub: Arc<HubClient>,
    publisher: ModelPublisher,
    promoter: ModelPromoter,
    tracker: Arc<dyn ExperimentTracker>,
    experiment: String,
    catalog_token: Option<SecretString>,
    connect_timeout: Duration,
}

impl PublishWorkflow {
    pub fn new(
        hub: Arc<HubClient>,
        publisher: ModelPublisher,
        promoter: ModelPromoter,
        tracker: Arc<dyn ExperimentTracker>,
        experiment: impl Into<String>,
    ) -> Self {
        Self {
            hub,
            publisher,
            promoter,
            tracker,
            experiment: experiment.into(),
            catalog_token: None,
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_catalog_token(mut self, token: Option<SecretString>) -> Self {
        self.catalog_token = token;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Wire every step against the services named in `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let hub = services::hub_client(config)?;
        let mlflow = services::require_mlflow(config)?;
        let experiment = config.tracking.workflow_experiment.clone();

        let settings = PublishSettings::new(&config.hub.workdir, &config.hub.max_shard_size)?;
        let publisher = ModelPublisher::new(
            hub.clone(),
            Arc::new(HubModelLoader::new(hub.clone())),
            settings,
        );
        let promoter = ModelPromoter::new(hub.clone(), mlflow.clone(), mlflow.clone(), experiment.clone())
            .with_staging_dir(&config.hub.workdir);

        Ok(Self::new(hub, publisher, promoter, mlflow, experiment)
            .with_catalog_token(config.catalog.token.clone())
            .with_connect_timeout(config.http.connect_timeout()))
    }

    pub async fn run(&self, args: &PublishArgs) -> Result<WorkflowReport> {
        let experiment_id = self.tracker.get_or_create_experiment(&self.experiment).await?;

        let publication = args.publication_spec();
        let publish = with_run(self.tracker.as_ref(), &experiment_id, PUBLISH_RUN, |_run| {
            self.publisher.publish_model(&publication)
        })
        .await?;
        info!(
            "Published {} ({} model files, {} tokenizer files)",
            publish.repo_name,
            publish.model_files.len(),
            publish.tokenizer_files.len()
        );

        let promotion = self.promoter.promote_model_to_staging(&args.promotion_spec()).await?;
        info!(
            "Promoted {} version {} as {}",
            promotion.staging_name, promotion.staging_version, promotion.alias
        );

        let metadata = args.metadata_spec();
        with_run(self.tracker.as_ref(), &experiment_id, METADATA_RUN, |_run| {
            send_metadata(
                &self.hub,
                &metadata,
                self.catalog_token.clone(),
                self.connect_timeout,
            )
        })
        .await?;
        info!("Sent metadata for {} to {}", metadata.model_name, metadata.gms_server);

        Ok(WorkflowReport { publish, promotion })
    }
}
