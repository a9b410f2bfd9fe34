//! Web UI routes
//!
//! Serves the demo page and the two form endpoints behind it: file
//! summarization and the question bot.

use bytes::Buf;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use warp::http::StatusCode;
use warp::multipart::FormData;
use warp::{Filter, Rejection, Reply};

use llmapp_core::dedup::{content_key, RequestDeduplicator};
use llmapp_core::error::error_chain;
use llmapp_core::gateway::InferenceGateway;
use llmapp_core::selection::ModelSelector;
use llmapp_core::{InferenceRequest, Task};

use crate::config::{DedupConfig, UiConfig};
use crate::render::{self, Tab};

/// Largest accepted upload
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
const MAX_QUESTION_BYTES: u64 = 16 * 1024;
const UPLOAD_FIELD: &str = "file";

// =============================================================================
// State and request types
// =============================================================================

pub struct AppState {
    pub gateway: InferenceGateway,
    pub selector: ModelSelector,
    pub ui: UiConfig,
    pub inference_function: String,
    pub dedup: Option<RwLock<RequestDeduplicator>>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        gateway: InferenceGateway,
        selector: ModelSelector,
        ui: UiConfig,
        inference_function: impl Into<String>,
        dedup: &DedupConfig,
    ) -> Self {
        Self {
            gateway,
            selector,
            ui,
            inference_function: inference_function.into(),
            dedup: dedup
                .enabled
                .then(|| RwLock::new(RequestDeduplicator::new(dedup.capacity))),
        }
    }

    fn request(&self, prompt: &str, model_name: &str, experiment: &str) -> InferenceRequest {
        InferenceRequest::new(prompt, Task::Summarization, model_name)
            .with_experiment(experiment)
            .with_inference_function(&self.inference_function)
    }

    async fn cached(&self, key: &str) -> Option<String> {
        let dedup = self.dedup.as_ref()?;
        let cached = dedup.read().await.get(key).map(str::to_string);
        cached
    }

    async fn remember(&self, key: String, fragment: &str) {
        if let Some(dedup) = &self.dedup {
            dedup.write().await.insert(key, fragment.to_string());
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AskForm {
    #[serde(default)]
    pub question: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

// =============================================================================
// Routes
// =============================================================================

/// Build the complete UI route tree
pub fn ui_routes(state: SharedState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let index = warp::path::end()
        .and(warp::get())
        .map(|| warp::reply::html(render::page(Tab::Summarize, None)));

    let summarize = warp::path("summarize")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::multipart::form().max_length(MAX_UPLOAD_BYTES))
        .and(with_state(state.clone()))
        .and_then(handle_summarize);

    let ask = warp::path("ask")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_QUESTION_BYTES))
        .and(warp::body::form())
        .and(with_state(state))
        .and_then(handle_ask);

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| {
            warp::reply::json(&HealthResponse {
                status: "ok".to_string(),
            })
        });

    index.or(summarize).or(ask).or(health)
}

// =============================================================================
// Filters
// =============================================================================

fn with_state(state: SharedState) -> impl Filter<Extract = (SharedState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

// =============================================================================
// Handlers
// =============================================================================

async fn handle_summarize(form: FormData, state: SharedState) -> Result<warp::reply::Response, Infallible> {
    let upload = match read_upload(form).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            return Ok(page_response(
                StatusCode::BAD_REQUEST,
                Tab::Summarize,
                &render::error_card("no file was uploaded"),
            ))
        }
        Err(e) => {
            warn!("Failed to read upload: {}", error_chain(&e));
            return Ok(page_response(
                StatusCode::BAD_REQUEST,
                Tab::Summarize,
                &render::error_card("the upload could not be read"),
            ));
        }
    };

    let content = match String::from_utf8(upload) {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => {
            return Ok(page_response(
                StatusCode::BAD_REQUEST,
                Tab::Summarize,
                &render::error_card("the uploaded file is empty"),
            ))
        }
        Err(_) => {
            return Ok(page_response(
                StatusCode::BAD_REQUEST,
                Tab::Summarize,
                &render::error_card("the uploaded file is not UTF-8 text"),
            ))
        }
    };

    let key = content_key("summarize", content.as_bytes());
    if let Some(fragment) = state.cached(&key).await {
        debug!("Serving repeated upload from cache");
        return Ok(page_response(StatusCode::OK, Tab::Summarize, &fragment));
    }

    info!("Summarizing uploaded file ({} bytes)", content.len());
    let request = state
        .request(&content, &state.ui.summary_model, &state.ui.upload_experiment)
        .with_topk(state.ui.upload_topk);

    match state.gateway.run_task(&request).await {
        Ok(result) => {
            let fragment = render::summary_card(&result.answer);
            state.remember(key, &fragment).await;
            Ok(page_response(StatusCode::OK, Tab::Summarize, &fragment))
        }
        Err(e) => Ok(page_response(
            StatusCode::BAD_GATEWAY,
            Tab::Summarize,
            &render::error_card(&error_chain(&e)),
        )),
    }
}

async fn handle_ask(form: AskForm, state: SharedState) -> Result<warp::reply::Response, Infallible> {
    let question = form.question.trim();
    if question.is_empty() {
        return Ok(page_response(
            StatusCode::BAD_REQUEST,
            Tab::Ask,
            &render::error_card("question must not be empty"),
        ));
    }

    let selected_model = state.selector.select_base_llm().await;
    let key = content_key("ask", format!("{}\n{}", selected_model, question).as_bytes());
    if let Some(fragment) = state.cached(&key).await {
        debug!("Serving repeated question from cache");
        return Ok(page_response(StatusCode::OK, Tab::Ask, &fragment));
    }

    info!("Answering question with {}", selected_model);
    let matched = state
        .request(question, &selected_model, &state.ui.question_experiment)
        .with_topk(state.ui.question_topk);
    let matched = match state.gateway.run_task(&matched).await {
        Ok(result) => result,
        Err(e) => {
            return Ok(page_response(
                StatusCode::BAD_GATEWAY,
                Tab::Ask,
                &render::error_card(&error_chain(&e)),
            ))
        }
    };

    let mut fragment = [
        render::model_name_card(&selected_model),
        render::matched_documents_card(&matched.answer, matched.doc_url.as_deref()),
    ]
    .concat();

    // The matched answer is shown even when the summary call fails
    let summary = state.request(question, &state.ui.summary_model, &state.ui.question_experiment);
    let summary = match state.gateway.run_task(&summary).await {
        Ok(result) => result,
        Err(e) => {
            fragment.push_str(&render::error_card(&error_chain(&e)));
            return Ok(page_response(StatusCode::BAD_GATEWAY, Tab::Ask, &fragment));
        }
    };

    fragment.push_str(&render::model_name_card(&state.ui.summary_model));
    fragment.push_str(&render::summary_card(&summary.answer));
    state.remember(key, &fragment).await;
    Ok(page_response(StatusCode::OK, Tab::Ask, &fragment))
}

// =============================================================================
// Helpers
// =============================================================================

/// Contents of the `file` part, if the form has one.
async fn read_upload(form: FormData) -> Result<Option<Vec<u8>>, warp::Error> {
    let mut form = std::pin::pin!(form);
    while let Some(part) = form.try_next().await? {
        if part.name() != UPLOAD_FIELD {
            continue;
        }
        let data = part
            .stream()
            .try_fold(Vec::new(), |mut acc, mut buf| async move {
                while buf.has_remaining() {
                    let chunk = buf.chunk();
                    let len = chunk.len();
                    acc.extend_from_slice(chunk);
                    buf.advance(len);
                }
                Ok::<_, warp::Error>(acc)
            })
            .await?;
        return Ok(Some(data));
    }
    Ok(None)
}

fn page_response(status: StatusCode, tab: Tab, fragment: &str) -> warp::reply::Response {
    warp::reply::with_status(warp::reply::html(render::page(tab, Some(fragment))), status).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use llmapp_core::gateway::InferenceBackend;
    use llmapp_core::selection::SelectionConfig;
    use llmapp_core::tracking::NoopPromptTracker;
    use llmapp_core::LlmAppError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        calls: Mutex<Vec<(String, String, String, String)>>,
        fail: AtomicBool,
        failing_model: Mutex<Option<String>>,
    }

    #[async_trait]
    impl InferenceBackend for FakeBackend {
        async fn invoke(&self, request: &InferenceRequest) -> llmapp_core::Result<serde_json::Value> {
            self.calls.lock().unwrap().push((
                request.prompt.clone(),
                request.model_name.clone(),
                request.experiment_name.clone(),
                request.topk_indicator().to_string(),
            ));
            let model_down =
                self.failing_model.lock().unwrap().as_deref() == Some(request.model_name.as_str());
            if self.fail.load(Ordering::SeqCst) || model_down {
                return Err(LlmAppError::EmptyResult {
                    function: request.inference_function_name.clone(),
                });
            }
            Ok(serde_json::json!({
                "doc_url": "https://docs.example/tanzu",
                "result": format!("answer from {}", request.model_name),
            }))
        }

        fn backend_name(&self) -> &str {
            "fake"
        }
    }

    fn setup(dedup_enabled: bool) -> (SharedState, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::default());
        let gateway = InferenceGateway::new(backend.clone(), Arc::new(NoopPromptTracker));
        let selector = ModelSelector::new(
            None,
            SelectionConfig {
                fallback_model_name: "acme/fallback".into(),
                ..Default::default()
            },
        );
        let dedup = DedupConfig {
            enabled: dedup_enabled,
            capacity: 8,
        };
        let state = AppState::new(
            gateway,
            selector,
            UiConfig::default(),
            "run_llm_inference_task",
            &dedup,
        );
        (Arc::new(state), backend)
    }

    fn multipart_body(field: &str, content: &str) -> String {
        format!(
            "--BOUNDARY\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"notes.txt\"\r\n\
Content-Type: text/plain\r\n\r\n{}\r\n--BOUNDARY--\r\n",
            field, content
        )
    }

    fn body_text(resp: &warp::http::Response<bytes::Bytes>) -> String {
        String::from_utf8(resp.body().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_index_page() {
        let (state, _) = setup(true);
        let routes = ui_routes(state);

        let resp = warp::test::request().method("GET").path("/").reply(&routes).await;

        assert_eq!(resp.status(), StatusCode::OK);
        let html = body_text(&resp);
        assert!(html.contains(render::PAGE_TITLE));
        assert!(html.contains("name='question'"));
        assert!(html.contains("name='file'"));
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = setup(true);
        let routes = ui_routes(state);

        let resp = warp::test::request().method("GET").path("/health").reply(&routes).await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body: HealthResponse = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body.status, "ok");
    }

    #[tokio::test]
    async fn test_ask_renders_both_answers() {
        let (state, backend) = setup(true);
        let routes = ui_routes(state);

        let resp = warp::test::request()
            .method("POST")
            .path("/ask")
            .header("content-type", "application/x-www-form-urlencoded")
            .body("question=What+is+Tanzu%3F")
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let html = body_text(&resp);
        assert!(html.contains("<p class='card-text'>acme/fallback</p>"));
        assert!(html.contains("\"answer from acme/fallback...\""));
        assert!(html.contains("href=\"https://docs.example/tanzu\""));
        assert!(html.contains("<p class='card-text'>tanzuhuggingface/dev</p>"));
        assert!(html.contains("<p class='card-text'>answer from tanzuhuggingface/dev</p>"));

        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0],
            (
                "What is Tanzu?".to_string(),
                "acme/fallback".to_string(),
                "llm_summary".to_string(),
                "y".to_string()
            )
        );
        assert_eq!(calls[1].1, "tanzuhuggingface/dev");
        assert_eq!(calls[1].2, "llm_summary");
        assert_eq!(calls[1].3, "y");
    }

    #[tokio::test]
    async fn test_ask_keeps_matched_answer_when_summary_fails() {
        let (state, backend) = setup(true);
        *backend.failing_model.lock().unwrap() = Some("tanzuhuggingface/dev".into());
        let routes = ui_routes(state);

        let ask = || {
            warp::test::request()
                .method("POST")
                .path("/ask")
                .header("content-type", "application/x-www-form-urlencoded")
                .body("question=What+is+Tanzu%3F")
        };
        let resp = ask().reply(&routes).await;

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let html = body_text(&resp);
        assert!(html.contains("<p class='card-text'>acme/fallback</p>"));
        assert!(html.contains("\"answer from acme/fallback...\""));
        assert!(html.contains("Request failed"));
        assert!(!html.contains("<h4 class='card-title'>Summary</h4>"));
        let matched_at = html.find("Matched Documents").unwrap();
        assert!(matched_at < html.find("Request failed").unwrap());

        // Partial answers are not cached
        *backend.failing_model.lock().unwrap() = None;
        let resp = ask().reply(&routes).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(backend.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_repeated_question_is_not_rerun() {
        let (state, backend) = setup(true);
        let routes = ui_routes(state);

        for _ in 0..2 {
            let resp = warp::test::request()
                .method("POST")
                .path("/ask")
                .header("content-type", "application/x-www-form-urlencoded")
                .body("question=What+is+Tanzu%3F")
                .reply(&routes)
                .await;
            assert_eq!(resp.status(), StatusCode::OK);
        }

        assert_eq!(backend.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_question_without_dedup() {
        let (state, backend) = setup(false);
        let routes = ui_routes(state);

        for _ in 0..2 {
            warp::test::request()
                .method("POST")
                .path("/ask")
                .header("content-type", "application/x-www-form-urlencoded")
                .body("question=What+is+Tanzu%3F")
                .reply(&routes)
                .await;
        }

        assert_eq!(backend.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_empty_question_rejected() {
        let (state, backend) = setup(true);
        let routes = ui_routes(state);

        let resp = warp::test::request()
            .method("POST")
            .path("/ask")
            .header("content-type", "application/x-www-form-urlencoded")
            .body("question=+++")
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(&resp).contains("question must not be empty"));
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_summarize_upload() {
        let (state, backend) = setup(true);
        let routes = ui_routes(state);

        let resp = warp::test::request()
            .method("POST")
            .path("/summarize")
            .header("content-type", "multipart/form-data; boundary=BOUNDARY")
            .body(multipart_body("file", "Tanzu release notes"))
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let html = body_text(&resp);
        assert!(html.contains("<h4 class='card-title'>Summary</h4>"));
        assert!(html.contains("answer from tanzuhuggingface/dev"));

        let calls = backend.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            (
                "Tanzu release notes".to_string(),
                "tanzuhuggingface/dev".to_string(),
                "testinference123".to_string(),
                "n".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_summarize_without_file_part() {
        let (state, backend) = setup(true);
        let routes = ui_routes(state);

        let resp = warp::test::request()
            .method("POST")
            .path("/summarize")
            .header("content-type", "multipart/form-data; boundary=BOUNDARY")
            .body(multipart_body("attachment", "Tanzu release notes"))
            .reply(&routes)
            .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(&resp).contains("no file was uploaded"));
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_inference_is_not_cached() {
        let (state, backend) = setup(true);
        backend.fail.store(true, Ordering::SeqCst);
        let routes = ui_routes(state);

        let resp = warp::test::request()
            .method("POST")
            .path("/summarize")
            .header("content-type", "multipart/form-data; boundary=BOUNDARY")
            .body(multipart_body("file", "notes"))
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(body_text(&resp).contains("Request failed"));

        backend.fail.store(false, Ordering::SeqCst);
        let resp = warp::test::request()
            .method("POST")
            .path("/summarize")
            .header("content-type", "multipart/form-data; boundary=BOUNDARY")
            .body(multipart_body("file", "notes"))
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(backend.calls.lock().unwrap().len(), 2);
    }
}
