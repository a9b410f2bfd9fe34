//! Prompt/response tracking.
//!
//! Every completed inference is recorded as a table artifact in a dedicated
//! run of one fixed tracking experiment. The experiment a caller attributed
//! the request to is kept as a run tag.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::error_chain;
use crate::mlflow::{ExperimentTracker, MlflowError, RunStatus};
use crate::request::PromptLogRecord;

pub const TRACK_PROMPTS_RUN: &str = "track_prompts";
pub const PROMPT_TABLE_ARTIFACT: &str = "prompt_tracking.json";
/// Run tag holding the experiment the caller attributed the request to.
pub const REQUEST_EXPERIMENT_TAG: &str = "llmapp.request_experiment";

#[async_trait]
pub trait PromptTracker: Send + Sync {
    /// Record one exchange. `request_experiment` is the caller's label for
    /// the request, not where the record is stored.
    async fn track_prompts(
        &self,
        record: &PromptLogRecord,
        request_experiment: Option<&str>,
    ) -> Result<(), MlflowError>;
}

/// Records prompts as a `prompt_tracking.json` table in MLflow.
pub struct MlflowPromptTracker {
    tracker: Arc<dyn ExperimentTracker>,
    experiment: String,
}

impl MlflowPromptTracker {
    pub fn new(tracker: Arc<dyn ExperimentTracker>, experiment: impl Into<String>) -> Self {
        Self {
            tracker,
            experiment: experiment.into(),
        }
    }

    pub fn experiment(&self) -> &str {
        &self.experiment
    }
}

#[async_trait]
impl PromptTracker for MlflowPromptTracker {
    async fn track_prompts(
        &self,
        record: &PromptLogRecord,
        request_experiment: Option<&str>,
    ) -> Result<(), MlflowError> {
        let experiment_id = self
            .tracker
            .get_or_create_experiment(&self.experiment)
            .await?;
        let run = self
            .tracker
            .start_run(&experiment_id, TRACK_PROMPTS_RUN)
            .await?;

        let table = record.to_table().to_string().into_bytes();
        let mut logged = Ok(());
        if let Some(label) = request_experiment {
            logged = self
                .tracker
                .set_tag(&run.run_id, REQUEST_EXPERIMENT_TAG, label)
                .await;
        }
        if logged.is_ok() {
            logged = self
                .tracker
                .log_artifact(&run, PROMPT_TABLE_ARTIFACT, table)
                .await;
        }

        let status = if logged.is_ok() {
            RunStatus::Finished
        } else {
            RunStatus::Failed
        };
        if let Err(e) = self.tracker.end_run(&run.run_id, status).await {
            warn!(
                "Failed to close tracking run {}: {}",
                run.run_id,
                error_chain(&e)
            );
        }
        logged?;

        debug!(
            "Tracked {} prompt(s) for {} in experiment {}",
            record.inputs.len(),
            record.model_name,
            self.experiment
        );
        Ok(())
    }
}

/// Discards records. Used when no tracking server is configured.
pub struct NoopPromptTracker;

#[async_trait]
impl PromptTracker for NoopPromptTracker {
    async fn track_prompts(
        &self,
        _record: &PromptLogRecord,
        _request_experiment: Option<&str>,
    ) -> Result<(), MlflowError> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingTracker;
    use super::*;
    use crate::request::{InferenceResult, DEFAULT_TRACKING_EXPERIMENT};

    fn record() -> PromptLogRecord {
        let result = InferenceResult {
            doc_url: Some("https://docs.example/tanzu".into()),
            answer: "Tanzu is a platform.".into(),
        };
        PromptLogRecord::from_exchange("tanzuhuggingface/dev", "What is Tanzu?", &result)
    }

    #[tokio::test]
    async fn test_tracks_prompt_table() {
        let store = Arc::new(RecordingTracker::default());
        let tracker = MlflowPromptTracker::new(store.clone(), DEFAULT_TRACKING_EXPERIMENT);

        tracker
            .track_prompts(&record(), Some("llm_summary"))
            .await
            .unwrap();

        assert_eq!(
            store.experiments.lock().unwrap().as_slice(),
            [DEFAULT_TRACKING_EXPERIMENT]
        );
        assert_eq!(
            store.tags.lock().unwrap().as_slice(),
            [(REQUEST_EXPERIMENT_TAG.to_string(), "llm_summary".to_string())]
        );
        assert_eq!(store.runs.lock().unwrap().as_slice(), [TRACK_PROMPTS_RUN]);
        assert_eq!(store.artifact_paths(), vec![PROMPT_TABLE_ARTIFACT]);

        let artifacts = store.artifacts.lock().unwrap();
        let table: serde_json::Value = serde_json::from_slice(&artifacts[0].2).unwrap();
        assert_eq!(table["data"][0][1], "What is Tanzu?");
        assert_eq!(table["data"][0][2], "\"Tanzu is a platform.\"");

        let ended = store.ended.lock().unwrap();
        assert_eq!(ended[0].1, RunStatus::Finished);
    }

    #[tokio::test]
    async fn test_failed_upload_marks_run_failed() {
        let store = Arc::new(RecordingTracker::failing_artifacts());
        let tracker = MlflowPromptTracker::new(store.clone(), "x");

        let err = tracker.track_prompts(&record(), None).await.unwrap_err();
        assert!(matches!(err, MlflowError::Api { status: 503, .. }));
        assert_eq!(store.ended.lock().unwrap()[0].1, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_every_request_lands_in_one_experiment() {
        let store = Arc::new(RecordingTracker::default());
        let tracker = MlflowPromptTracker::new(store.clone(), "prompts");

        tracker
            .track_prompts(&record(), Some("testinference123"))
            .await
            .unwrap();
        tracker
            .track_prompts(&record(), Some("llm_summary"))
            .await
            .unwrap();
        tracker.track_prompts(&record(), None).await.unwrap();

        assert_eq!(
            store.experiments.lock().unwrap().as_slice(),
            ["prompts", "prompts", "prompts"]
        );
        assert_eq!(store.tags.lock().unwrap().len(), 2);
        assert_eq!(store.artifact_paths().len(), 3);
    }

    #[tokio::test]
    async fn test_noop_tracker() {
        assert!(NoopPromptTracker
            .track_prompts(&record(), Some("x"))
            .await
            .is_ok());
    }
}
