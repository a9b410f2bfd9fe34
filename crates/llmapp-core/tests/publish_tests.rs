//! End-to-end publishing against an in-process fake of the hub REST API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use llmapp_core::hub::HubClient;
use llmapp_core::publish::{
    HubModelLoader, ModelClass, ModelPublicationSpec, ModelPublisher, PublishSettings,
};
use llmapp_core::LlmAppError;
use tempfile::TempDir;
use warp::Filter;

// =============================================================================
// Fake hub
// =============================================================================

#[derive(Default)]
struct HubState {
    base_url: Mutex<String>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    commits: Mutex<Vec<Vec<serde_json::Value>>>,
    lfs_uploads: Mutex<Vec<(String, usize)>>,
    verified: Mutex<usize>,
    info_requests: Mutex<usize>,
    downloads: Mutex<Vec<String>>,
}

/// Safetensors file with one `U8` tensor per entry.
fn safetensors(tensors: &[(&str, usize)]) -> Vec<u8> {
    let mut header = serde_json::Map::new();
    let mut data = Vec::new();
    for (name, len) in tensors {
        let start = data.len();
        data.extend(std::iter::repeat(1u8).take(*len));
        header.insert(
            name.to_string(),
            serde_json::json!({"dtype": "U8", "shape": [len], "data_offsets": [start, data.len()]}),
        );
    }
    let mut header = serde_json::to_vec(&header).unwrap();
    while header.len() % 8 != 0 {
        header.push(b' ');
    }
    let mut out = (header.len() as u64).to_le_bytes().to_vec();
    out.extend_from_slice(&header);
    out.extend_from_slice(&data);
    out
}

fn seed_model(state: &HubState, with_tokenizer: bool) {
    let mut files = state.files.lock().unwrap();
    files.insert(
        "config.json".into(),
        br#"{"architectures": ["T5ForConditionalGeneration"]}"#.to_vec(),
    );
    files.insert("model.safetensors".into(), safetensors(&[("a", 8), ("b", 8)]));
    files.insert("README.md".into(), b"# base".to_vec());
    if with_tokenizer {
        files.insert("tokenizer.json".into(), br#"{"version": "1.0"}"#.to_vec());
        files.insert("special_tokens_map.json".into(), b"{}".to_vec());
    }
}

async fn start_fake_hub(state: Arc<HubState>) -> String {
    let create = warp::path!("api" / "repos" / "create")
        .and(warp::post())
        .map(|| warp::reply::with_status("exists", warp::http::StatusCode::CONFLICT));

    let s = state.clone();
    let info = warp::path!("api" / "models" / String / String)
        .and(warp::get())
        .map(move |ns: String, name: String| {
            *s.info_requests.lock().unwrap() += 1;
            let files = s.files.lock().unwrap();
            let mut siblings: Vec<_> = files
                .keys()
                .map(|f| serde_json::json!({"rfilename": f}))
                .collect();
            siblings.push(serde_json::json!({"rfilename": ".gitattributes"}));
            warp::reply::json(&serde_json::json!({
                "id": format!("{}/{}", ns, name),
                "sha": "rev1",
                "siblings": siblings,
            }))
        });

    let s = state.clone();
    let resolve = warp::path!(String / String / "resolve" / String / String)
        .and(warp::get())
        .map(move |_ns: String, _name: String, rev: String, file: String| {
            assert_eq!(rev, "rev1");
            s.downloads.lock().unwrap().push(file.clone());
            match s.files.lock().unwrap().get(&file) {
                Some(bytes) => warp::http::Response::builder()
                    .status(200)
                    .body(bytes.clone())
                    .unwrap(),
                None => warp::http::Response::builder()
                    .status(404)
                    .body(Vec::new())
                    .unwrap(),
            }
        });

    let preupload = warp::path!("api" / "models" / String / String / "preupload" / String)
        .and(warp::post())
        .and(warp::body::json())
        .map(|_ns: String, _name: String, _rev: String, body: serde_json::Value| {
            let files: Vec<_> = body["files"]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|f| {
                    let path = f["path"].as_str().unwrap_or_default().to_string();
                    let mode = if path.ends_with(".safetensors") { "lfs" } else { "regular" };
                    serde_json::json!({"path": path, "uploadMode": mode})
                })
                .collect();
            warp::reply::json(&serde_json::json!({"files": files}))
        });

    let s = state.clone();
    let batch = warp::path!(String / String / "info" / "lfs" / "objects" / "batch")
        .and(warp::post())
        .and(warp::body::bytes())
        .map(move |_ns: String, repo: String, body: bytes::Bytes| {
            assert!(repo.ends_with(".git"));
            let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
            let base = s.base_url.lock().unwrap().clone();
            let objects: Vec<_> = body["objects"]
                .as_array()
                .unwrap()
                .iter()
                .map(|o| {
                    let oid = o["oid"].as_str().unwrap();
                    serde_json::json!({
                        "oid": oid,
                        "size": o["size"],
                        "actions": {
                            "upload": {"href": format!("{}/lfs-upload/{}", base, oid)},
                            "verify": {"href": format!("{}/lfs-verify", base)}
                        }
                    })
                })
                .collect();
            warp::reply::json(&serde_json::json!({"objects": objects}))
        });

    let s = state.clone();
    let upload = warp::path!("lfs-upload" / String)
        .and(warp::put())
        .and(warp::body::bytes())
        .map(move |oid: String, body: bytes::Bytes| {
            s.lfs_uploads.lock().unwrap().push((oid, body.len()));
            warp::reply()
        });

    let s = state.clone();
    let verify = warp::path!("lfs-verify").and(warp::post()).map(move || {
        *s.verified.lock().unwrap() += 1;
        warp::reply()
    });

    let s = state.clone();
    let commit = warp::path!("api" / "models" / String / String / "commit" / String)
        .and(warp::post())
        .and(warp::body::bytes())
        .map(move |_ns: String, _name: String, _rev: String, body: bytes::Bytes| {
            let lines: Vec<serde_json::Value> = std::str::from_utf8(&body)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect();
            let mut commits = s.commits.lock().unwrap();
            commits.push(lines);
            warp::reply::json(&serde_json::json!({
                "commitOid": format!("c{}", commits.len()),
                "commitUrl": "http://hub/commit"
            }))
        });

    let routes = create
        .map(|r| Box::new(r) as Box<dyn warp::Reply>)
        .or(info.map(|r| Box::new(r) as Box<dyn warp::Reply>))
        .unify()
        .or(preupload.map(|r| Box::new(r) as Box<dyn warp::Reply>))
        .unify()
        .or(commit.map(|r| Box::new(r) as Box<dyn warp::Reply>))
        .unify()
        .or(batch.map(|r| Box::new(r) as Box<dyn warp::Reply>))
        .unify()
        .or(upload.map(|r| Box::new(r) as Box<dyn warp::Reply>))
        .unify()
        .or(verify.map(|r| Box::new(r) as Box<dyn warp::Reply>))
        .unify()
        .or(resolve.map(|r| Box::new(r) as Box<dyn warp::Reply>))
        .unify();

    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    let base = format!("http://{}", addr);
    *state.base_url.lock().unwrap() = base.clone();
    base
}

fn publisher(base: &str, workdir: &TempDir, max_shard_size: &str) -> ModelPublisher {
    let hub = Arc::new(HubClient::new(base, Some("hf_test".into())));
    let loader = Arc::new(HubModelLoader::new(hub.clone()));
    let settings = PublishSettings::new(workdir.path(), max_shard_size).unwrap();
    ModelPublisher::new(hub, loader, settings)
}

fn commit_paths(commit: &[serde_json::Value]) -> Vec<(String, String)> {
    let mut paths: Vec<_> = commit
        .iter()
        .skip(1)
        .map(|line| {
            (
                line["key"].as_str().unwrap().to_string(),
                line["value"]["path"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    paths.sort();
    paths
}

// =============================================================================
// Publishing
// =============================================================================

#[tokio::test]
async fn publish_pushes_model_then_tokenizer() {
    let state = Arc::new(HubState::default());
    seed_model(&state, true);
    let base = start_fake_hub(state.clone()).await;
    let workdir = TempDir::new().unwrap();

    let report = publisher(&base, &workdir, "2GB")
        .publish_model(&ModelPublicationSpec {
            repo_name: "tanzuhuggingface/dev".into(),
            pretrained_model_name: "google/flan-t5-base".into(),
        })
        .await
        .unwrap();

    assert_eq!(report.repo_name, "tanzuhuggingface/dev");
    assert_eq!(report.model_class, ModelClass::Generic);
    assert!(report.reshard.is_none());
    assert_eq!(report.model_files, vec!["config.json", "model.safetensors"]);
    assert_eq!(
        report.tokenizer_files,
        vec!["special_tokens_map.json", "tokenizer.json"]
    );
    assert_eq!(report.model_commit.commit_oid, "c1");
    assert_eq!(report.tokenizer_commit.commit_oid, "c2");

    let commits = state.commits.lock().unwrap();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0][0]["key"], "header");
    assert_eq!(commits[0][0]["value"]["summary"], "Upload model");
    assert_eq!(
        commit_paths(&commits[0]),
        vec![
            ("file".to_string(), "config.json".to_string()),
            ("lfsFile".to_string(), "model.safetensors".to_string()),
        ]
    );
    assert_eq!(commits[1][0]["value"]["summary"], "Upload tokenizer");
    assert_eq!(
        commit_paths(&commits[1]),
        vec![
            ("file".to_string(), "special_tokens_map.json".to_string()),
            ("file".to_string(), "tokenizer.json".to_string()),
        ]
    );

    assert_eq!(state.lfs_uploads.lock().unwrap().len(), 1);
    assert_eq!(*state.verified.lock().unwrap(), 1);

    // The generic fallback takes three attempts over one checkpoint fetch
    assert_eq!(*state.info_requests.lock().unwrap(), 1);
    let config_downloads = state
        .downloads
        .lock()
        .unwrap()
        .iter()
        .filter(|f| f.as_str() == "config.json")
        .count();
    assert_eq!(config_downloads, 2);
    assert!(!report.local_dir.join("README.md").exists());
}

#[tokio::test]
async fn publish_reshards_large_weights() {
    let state = Arc::new(HubState::default());
    seed_model(&state, true);
    let base = start_fake_hub(state.clone()).await;
    let workdir = TempDir::new().unwrap();

    let report = publisher(&base, &workdir, "10")
        .publish_model(&ModelPublicationSpec {
            repo_name: "tanzuhuggingface/dev".into(),
            pretrained_model_name: "google/flan-t5-base".into(),
        })
        .await
        .unwrap();

    let reshard = report.reshard.expect("weights should be re-sharded");
    assert_eq!(reshard.files.len(), 2);
    assert_eq!(
        report.model_files,
        vec![
            "config.json",
            "model-00001-of-00002.safetensors",
            "model-00002-of-00002.safetensors",
            "model.safetensors.index.json",
        ]
    );
    assert_eq!(state.lfs_uploads.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn publish_without_tokenizer_fails() {
    let state = Arc::new(HubState::default());
    seed_model(&state, false);
    let base = start_fake_hub(state.clone()).await;
    let workdir = TempDir::new().unwrap();

    let err = publisher(&base, &workdir, "2GB")
        .publish_model(&ModelPublicationSpec {
            repo_name: "tanzuhuggingface/dev".into(),
            pretrained_model_name: "google/flan-t5-base".into(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, LlmAppError::MissingTokenizer(_)));
    assert!(state.commits.lock().unwrap().is_empty());
}

#[tokio::test]
async fn publish_rejects_invalid_repo_name() {
    let state = Arc::new(HubState::default());
    let base = start_fake_hub(state).await;
    let workdir = TempDir::new().unwrap();

    let err = publisher(&base, &workdir, "2GB")
        .publish_model(&ModelPublicationSpec {
            repo_name: "../escape".into(),
            pretrained_model_name: "google/flan-t5-base".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LlmAppError::Hub(_)));
}
