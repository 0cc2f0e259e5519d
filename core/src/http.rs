//! HTTP side of a NodeTool server
//!
//! The session client only needs two things from HTTP: fetching the bytes
//! behind an output URI, and cancelling a job by id. Both sit behind traits
//! so hosts can provide their own (cached, proxied) implementations.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Client as HttpClient, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::config::ClientConfig;
use crate::error::{NodetoolError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("nodetool-rs/", env!("CARGO_PKG_VERSION"));

/// Given a URI, fetch bytes
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>>;
}

/// Given a job id, request cancellation
#[async_trait]
pub trait JobCanceller: Send + Sync {
    async fn cancel_job(&self, job_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct WorkflowList {
    #[serde(default)]
    workflows: Vec<WorkflowSummary>,
}

pub struct ApiClient {
    base_url: Option<Url>,
    auth_token: Option<String>,
    http: HttpClient,
}

impl ApiClient {
    pub fn new(base_url: Option<&str>, auth_token: Option<String>) -> Result<Self> {
        let base_url = base_url
            .map(|raw| {
                Url::parse(raw).map_err(|e| {
                    NodetoolError::configuration(format!("invalid api_base_url {}: {}", raw, e))
                })
            })
            .transpose()?;
        let http = HttpClient::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            base_url,
            auth_token,
            http,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(config.api_base_url.as_deref(), config.auth_token.clone())
    }

    fn base_url(&self) -> Result<&Url> {
        self.base_url
            .as_ref()
            .ok_or_else(|| NodetoolError::configuration("api_base_url is not configured"))
    }

    /// Absolute URL for an http(s) or server-relative URI
    pub fn resolve(&self, uri: &str) -> Result<Url> {
        resolve_uri(self.base_url.as_ref(), uri)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        let url = api_url(self.base_url()?, "/api/workflows/")?;
        let response = check_status(self.request(reqwest::Method::GET, url).send().await?).await?;
        let list: WorkflowList = response.json().await?;
        crate::debug_log!("listed {} workflows", list.workflows.len());
        Ok(list.workflows)
    }

    pub async fn resolve_workflow_id(&self, name: &str) -> Result<String> {
        let workflows = self.list_workflows().await?;
        match_workflow(&workflows, name).map(|w| w.id.clone())
    }
}

#[async_trait]
impl AssetFetcher for ApiClient {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>> {
        if let Some(bytes) = decode_data_uri(uri)? {
            return Ok(bytes);
        }
        let url = self.resolve(uri)?;
        crate::debug_log!("fetching asset {}", url);
        let response = check_status(self.request(reqwest::Method::GET, url).send().await?).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl JobCanceller for ApiClient {
    async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let url = api_url(self.base_url()?, &format!("/api/jobs/{}/cancel", job_id))?;
        check_status(self.request(reqwest::Method::POST, url).send().await?).await?;
        crate::info_log!("cancel requested for job {}", job_id);
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            format!("authentication failed ({})", status)
        }
        StatusCode::NOT_FOUND => format!("not found: {}", body.trim()),
        _ => format!("{}: {}", status, body.trim()),
    };
    Err(NodetoolError::Http {
        status: Some(status.as_u16()),
        message,
    })
}

fn resolve_uri(base: Option<&Url>, uri: &str) -> Result<Url> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Url::parse(uri)
            .map_err(|e| NodetoolError::configuration(format!("invalid uri {}: {}", uri, e)));
    }
    if uri.starts_with('/') {
        let base = base
            .ok_or_else(|| NodetoolError::configuration("api_base_url is not configured"))?;
        return api_url(base, uri);
    }
    Err(NodetoolError::configuration(format!("unsupported uri: {}", uri)))
}

/// Server path under `base`, keeping any prefix the base carries
/// (`http://host/nodetool` + `/api/x` is `http://host/nodetool/api/x`)
fn api_url(base: &Url, path: &str) -> Result<Url> {
    let mut root = base.clone();
    if !root.path().ends_with('/') {
        let with_slash = format!("{}/", root.path());
        root.set_path(&with_slash);
    }
    root.join(path.trim_start_matches('/'))
        .map_err(|e| NodetoolError::configuration(format!("invalid path {}: {}", path, e)))
}

/// Payload of a `data:` URI. `Ok(None)` when `uri` is not a data URI.
pub fn decode_data_uri(uri: &str) -> Result<Option<Vec<u8>>> {
    let Some(rest) = uri.strip_prefix("data:") else {
        return Ok(None);
    };
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| NodetoolError::serialization("data uri without payload separator"))?;
    if header.split(';').any(|part| part.eq_ignore_ascii_case("base64")) {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| NodetoolError::serialization(format!("bad base64 in data uri: {}", e)))?;
        Ok(Some(bytes))
    } else {
        Ok(Some(payload.as_bytes().to_vec()))
    }
}

fn match_workflow<'a>(workflows: &'a [WorkflowSummary], name: &str) -> Result<&'a WorkflowSummary> {
    let matches: Vec<&WorkflowSummary> = workflows
        .iter()
        .filter(|w| w.name.eq_ignore_ascii_case(name))
        .collect();
    match matches.as_slice() {
        [only] => Ok(*only),
        [] => Err(NodetoolError::configuration(format!(
            "no workflow named '{}'",
            name
        ))),
        many => Err(NodetoolError::configuration(format!(
            "workflow name '{}' is ambiguous ({} matches)",
            name,
            many.len()
        ))),
    }
}
