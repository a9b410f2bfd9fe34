//! Hugging Face Hub REST client.
//!
//! Covers what publishing and promotion need: repository creation, model
//! info, file download, and commits. Small files are committed inline as
//! base64; files the hub asks to store in LFS go through the LFS batch API
//! first and are referenced from the commit by their sha256 oid.

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::card::ModelCard;
use crate::security::{resolve_in_dir, SecretString, SecurityError};

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
pub const DEFAULT_REVISION: &str = "main";

/// Bytes of each file sent to the preupload endpoint.
const SAMPLE_SIZE: usize = 512;
const LFS_CONTENT_TYPE: &str = "application/vnd.git-lfs+json";

#[derive(Debug, Error)]
pub enum HubError {
    #[error("HTTP error")]
    Http(#[from] reqwest::Error),

    #[error("Hub API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("invalid repository id '{0}'")]
    InvalidRepoId(String),

    #[error("unexpected hub response: {0}")]
    Decode(String),

    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    UnsafePath(#[from] SecurityError),
}

impl HubError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        HubError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            HubError::Api { status, .. } => Some(*status),
            HubError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// `namespace/name` identifier of a model repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoId {
    namespace: Option<String>,
    name: String,
}

impl RepoId {
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn valid_repo_part(part: &str) -> bool {
    !part.is_empty()
        && part != "."
        && part != ".."
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl FromStr for RepoId {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || HubError::InvalidRepoId(s.to_string());
        match s.split_once('/') {
            Some((namespace, name)) => {
                if !valid_repo_part(namespace) || !valid_repo_part(name) {
                    return Err(invalid());
                }
                Ok(RepoId {
                    namespace: Some(namespace.to_string()),
                    name: name.to_string(),
                })
            }
            None if valid_repo_part(s) => Ok(RepoId {
                namespace: None,
                name: s.to_string(),
            }),
            None => Err(invalid()),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sibling {
    pub rfilename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    #[serde(alias = "modelId")]
    pub id: String,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub siblings: Vec<Sibling>,
    #[serde(default)]
    pub pipeline_tag: Option<String>,
}

impl ModelInfo {
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.siblings.iter().map(|s| s.rfilename.as_str())
    }

    /// Commit sha, or `main` when the hub did not report one.
    pub fn revision(&self) -> &str {
        self.sha.as_deref().unwrap_or(DEFAULT_REVISION)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    #[serde(default)]
    pub commit_oid: String,
    #[serde(default)]
    pub commit_url: String,
}

/// Local file prepared for a commit.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub path_in_repo: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub sha256: String,
    sample: Vec<u8>,
}

impl UploadFile {
    /// Size, sha256 and leading sample of a local file.
    pub async fn prepare(local_path: &Path, path_in_repo: &str) -> Result<Self, HubError> {
        let path = local_path.to_path_buf();
        let hashed = tokio::task::spawn_blocking(move || hash_file(&path))
            .await
            .map_err(|e| HubError::io(local_path, std::io::Error::other(e)))?
            .map_err(|e| HubError::io(local_path, e))?;
        let (size, sha256, sample) = hashed;
        Ok(Self {
            path_in_repo: path_in_repo.replace('\\', "/"),
            local_path: local_path.to_path_buf(),
            size,
            sha256,
            sample,
        })
    }
}

fn hash_file(path: &Path) -> std::io::Result<(u64, String, Vec<u8>)> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut sample = vec![0u8; SAMPLE_SIZE];
    let mut filled = 0;
    while filled < SAMPLE_SIZE {
        let n = file.read(&mut sample[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    sample.truncate(filled);

    let mut hasher = Sha256::new();
    hasher.update(&sample);
    let rest = std::io::copy(&mut file, &mut hasher)?;
    Ok((filled as u64 + rest, hex::encode(hasher.finalize()), sample))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    Regular,
    Lfs,
}

#[derive(Deserialize)]
struct PreuploadResponse {
    files: Vec<PreuploadFile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreuploadFile {
    path: String,
    upload_mode: UploadMode,
}

#[derive(Deserialize)]
struct LfsBatchResponse {
    objects: Vec<LfsObject>,
}

#[derive(Deserialize)]
struct LfsObject {
    oid: String,
    #[serde(default)]
    actions: Option<LfsActions>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct LfsActions {
    #[serde(default)]
    upload: Option<LfsAction>,
    #[serde(default)]
    verify: Option<LfsAction>,
}

#[derive(Deserialize)]
struct LfsAction {
    href: String,
    #[serde(default)]
    header: std::collections::HashMap<String, String>,
}

/// Client for a Hugging Face Hub endpoint.
pub struct HubClient {
    client: reqwest::Client,
    endpoint: String,
    token: Option<SecretString>,
}

impl HubClient {
    pub fn new(endpoint: &str, token: Option<SecretString>) -> Self {
        Self::with_client(endpoint, token, reqwest::Client::new())
    }

    pub fn with_connect_timeout(
        endpoint: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, HubError> {
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self::with_client(endpoint, token, client))
    }

    pub fn with_client(endpoint: &str, token: Option<SecretString>, client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose()),
            None => builder,
        }
    }

    /// Create a model repository. With `exist_ok`, an existing repository
    /// is not an error. Returns the repository URL.
    pub async fn create_repo(&self, repo: &RepoId, exist_ok: bool) -> Result<String, HubError> {
        let url = format!("{}/api/repos/create", self.endpoint);
        let mut body = serde_json::json!({
            "name": repo.name(),
            "type": "model",
            "private": false,
        });
        if let Some(ns) = repo.namespace() {
            body["organization"] = serde_json::Value::String(ns.to_string());
        }

        let resp = self.authorized(self.client.post(&url)).json(&body).send().await?;
        let repo_url = format!("{}/{}", self.endpoint, repo);
        if resp.status() == reqwest::StatusCode::CONFLICT && exist_ok {
            debug!("Repository {} already exists", repo);
            return Ok(repo_url);
        }
        let value: serde_json::Value = json_or_error(resp).await?;
        Ok(value["url"].as_str().map(str::to_string).unwrap_or(repo_url))
    }

    pub async fn model_info(&self, repo: &RepoId, revision: Option<&str>) -> Result<ModelInfo, HubError> {
        let url = match revision {
            Some(rev) => format!("{}/api/models/{}/revision/{}", self.endpoint, repo, rev),
            None => format!("{}/api/models/{}", self.endpoint, repo),
        };
        let resp = self.authorized(self.client.get(&url)).send().await?;
        json_or_error(resp).await
    }

    fn resolve_url(&self, repo: &RepoId, revision: &str, filename: &str) -> String {
        format!("{}/{}/resolve/{}/{}", self.endpoint, repo, revision, filename)
    }

    /// Download a file into memory.
    pub async fn download(&self, repo: &RepoId, revision: &str, filename: &str) -> Result<Vec<u8>, HubError> {
        self.download_optional(repo, revision, filename)
            .await?
            .ok_or_else(|| HubError::Api {
                status: 404,
                message: format!("{} not found in {}", filename, repo),
            })
    }

    /// Download a file into memory; a missing file is `None`.
    pub async fn download_optional(
        &self,
        repo: &RepoId,
        revision: &str,
        filename: &str,
    ) -> Result<Option<Vec<u8>>, HubError> {
        let url = self.resolve_url(repo, revision, filename);
        let resp = self.authorized(self.client.get(&url)).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp).await?;
        Ok(Some(resp.bytes().await?.to_vec()))
    }

    /// Stream a file to `dir/filename`, creating parent directories.
    pub async fn download_to(
        &self,
        repo: &RepoId,
        revision: &str,
        filename: &str,
        dir: &Path,
    ) -> Result<PathBuf, HubError> {
        let target = resolve_in_dir(dir, filename)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HubError::io(parent, e))?;
        }

        let url = self.resolve_url(repo, revision, filename);
        let resp = self.authorized(self.client.get(&url)).send().await?;
        let mut resp = check_status(resp).await?;

        let mut file = tokio::fs::File::create(&target)
            .await
            .map_err(|e| HubError::io(&target, e))?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| HubError::io(&target, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| HubError::io(&target, e))?;

        debug!("Downloaded {} ({} bytes)", filename, written);
        Ok(target)
    }

    /// README of the repository parsed as a model card; `None` when the
    /// repository has no README.
    pub async fn load_model_card(&self, repo: &RepoId) -> Result<Option<ModelCard>, HubError> {
        let Some(bytes) = self
            .download_optional(repo, DEFAULT_REVISION, "README.md")
            .await?
        else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&bytes);
        Ok(Some(ModelCard::parse(&text)))
    }

    async fn preupload(
        &self,
        repo: &RepoId,
        files: &[UploadFile],
    ) -> Result<Vec<UploadMode>, HubError> {
        let url = format!("{}/api/models/{}/preupload/{}", self.endpoint, repo, DEFAULT_REVISION);
        let engine = base64::engine::general_purpose::STANDARD;
        let body = serde_json::json!({
            "files": files.iter().map(|f| serde_json::json!({
                "path": f.path_in_repo,
                "size": f.size,
                "sample": engine.encode(&f.sample),
            })).collect::<Vec<_>>(),
        });
        let resp = self.authorized(self.client.post(&url)).json(&body).send().await?;
        let parsed: PreuploadResponse = json_or_error(resp).await?;

        files
            .iter()
            .map(|f| {
                parsed
                    .files
                    .iter()
                    .find(|p| p.path == f.path_in_repo)
                    .map(|p| p.upload_mode)
                    .ok_or_else(|| {
                        HubError::Decode(format!("no upload mode for {}", f.path_in_repo))
                    })
            })
            .collect()
    }

    async fn upload_lfs(&self, repo: &RepoId, files: &[&UploadFile]) -> Result<(), HubError> {
        if files.is_empty() {
            return Ok(());
        }
        let url = format!("{}/{}.git/info/lfs/objects/batch", self.endpoint, repo);
        let body = serde_json::json!({
            "operation": "upload",
            "transfers": ["basic"],
            "hash_algo": "sha256",
            "objects": files.iter().map(|f| serde_json::json!({
                "oid": f.sha256,
                "size": f.size,
            })).collect::<Vec<_>>(),
        });
        let resp = self
            .authorized(self.client.post(&url))
            .header(reqwest::header::ACCEPT, LFS_CONTENT_TYPE)
            .header(reqwest::header::CONTENT_TYPE, LFS_CONTENT_TYPE)
            .body(body.to_string())
            .send()
            .await?;
        let batch: LfsBatchResponse = json_or_error(resp).await?;

        for object in batch.objects {
            if let Some(error) = object.error {
                return Err(HubError::Api {
                    status: error["code"].as_u64().unwrap_or(500) as u16,
                    message: error["message"].as_str().unwrap_or("LFS error").to_string(),
                });
            }
            let Some(file) = files.iter().find(|f| f.sha256 == object.oid) else {
                return Err(HubError::Decode(format!("unexpected LFS object {}", object.oid)));
            };
            let Some(actions) = object.actions else {
                debug!("{} already stored in LFS", file.path_in_repo);
                continue;
            };

            if let Some(upload) = actions.upload {
                info!("Uploading {} ({} bytes) to LFS", file.path_in_repo, file.size);
                let content = tokio::fs::File::open(&file.local_path)
                    .await
                    .map_err(|e| HubError::io(&file.local_path, e))?;
                let mut request = self.client.put(&upload.href);
                for (name, value) in &upload.header {
                    request = request.header(name.as_str(), value.as_str());
                }
                let resp = request
                    .header(reqwest::header::CONTENT_LENGTH, file.size)
                    .body(reqwest::Body::from(content))
                    .send()
                    .await?;
                check_status(resp).await?;
            }

            if let Some(verify) = actions.verify {
                let mut request = self.authorized(self.client.post(&verify.href));
                for (name, value) in &verify.header {
                    request = request.header(name.as_str(), value.as_str());
                }
                let resp = request
                    .header(reqwest::header::CONTENT_TYPE, LFS_CONTENT_TYPE)
                    .body(serde_json::json!({"oid": file.sha256, "size": file.size}).to_string())
                    .send()
                    .await?;
                check_status(resp).await?;
            }
        }
        Ok(())
    }

    /// Commit local files to the repository's main branch.
    pub async fn push_files(
        &self,
        repo: &RepoId,
        files: &[UploadFile],
        message: &str,
    ) -> Result<CommitInfo, HubError> {
        let modes = self.preupload(repo, files).await?;
        let lfs: Vec<&UploadFile> = files
            .iter()
            .zip(&modes)
            .filter(|(_, mode)| **mode == UploadMode::Lfs)
            .map(|(f, _)| f)
            .collect();
        self.upload_lfs(repo, &lfs).await?;

        let mut lines = vec![serde_json::json!({
            "key": "header",
            "value": {"summary": message, "description": ""},
        })];
        for (file, mode) in files.iter().zip(&modes) {
            lines.push(commit_line(file, *mode).await?);
        }
        let body = to_ndjson(&lines);

        let url = format!("{}/api/models/{}/commit/{}", self.endpoint, repo, DEFAULT_REVISION);
        let resp = self
            .authorized(self.client.post(&url))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let commit: CommitInfo = json_or_error(resp).await?;
        info!(
            "Committed {} file(s) to {}: {}",
            files.len(),
            repo,
            message
        );
        Ok(commit)
    }
}

async fn commit_line(file: &UploadFile, mode: UploadMode) -> Result<serde_json::Value, HubError> {
    Ok(match mode {
        UploadMode::Lfs => serde_json::json!({
            "key": "lfsFile",
            "value": {
                "path": file.path_in_repo,
                "algo": "sha256",
                "oid": file.sha256,
                "size": file.size,
            },
        }),
        UploadMode::Regular => {
            let content = tokio::fs::read(&file.local_path)
                .await
                .map_err(|e| HubError::io(&file.local_path, e))?;
            serde_json::json!({
                "key": "file",
                "value": {
                    "path": file.path_in_repo,
                    "encoding": "base64",
                    "content": base64::engine::general_purpose::STANDARD.encode(content),
                },
            })
        }
    })
}

fn to_ndjson(lines: &[serde_json::Value]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(&line.to_string());
        out.push('\n');
    }
    out
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, HubError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or(text);
    Err(HubError::Api { status, message })
}

async fn json_or_error<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, HubError> {
    let resp = check_status(resp).await?;
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| HubError::Decode(e.to_string()))
}
