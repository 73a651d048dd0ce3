//! Remote execution service spoken to over HTTP/JSON.
//!
//! * `POST {base}/sandboxes` provisions and answers `{"endpoint": ".."}`
//! * `POST {endpoint}/execute` runs code and answers a [`BackendOutput`]
//! * `DELETE {endpoint}` tears the sandbox down
//!
//! A sandbox provisioned elsewhere in the chain is addressed as
//! `{base}/sandboxes/{id}`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{BackendCall, BackendError, BackendKind, BackendOutput, ExecutionBackend};
use crate::config::BackendEndpoint;
use crate::registry::SandboxConfig;
use crate::sandbox::Sandbox;

#[derive(Debug, Deserialize)]
struct ProvisionResponse {
    #[serde(default)]
    endpoint: Option<String>,
}

pub struct HttpBackend {
    kind: BackendKind,
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(kind: BackendKind, endpoint: &BackendEndpoint) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("enclave/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            kind,
            base_url: endpoint.url.trim_end_matches('/').to_string(),
            token: endpoint.token.clone(),
            client,
        })
    }

    fn sandbox_url(&self, sandbox: &Sandbox) -> String {
        if sandbox.backend == self.kind {
            sandbox.endpoint.trim_end_matches('/').to_string()
        } else {
            format!("{}/sandboxes/{}", self.base_url, sandbox.id)
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ExecutionBackend for HttpBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn provision(&self, config: &SandboxConfig) -> Result<String, BackendError> {
        let url = format!("{}/sandboxes", self.base_url);
        debug!(url = %url, sandbox_id = %config.sandbox_id, "provisioning");
        let resp = self
            .authorize(self.client.post(&url).json(&json!({
                "sandbox_id": config.sandbox_id,
                "agent_id": config.agent_id,
                "ttl_days": config.ttl_days,
                "capabilities": config.capabilities,
                "limits": config.limits,
                "packages": config.packages,
            })))
            .send()
            .await?;
        let body: ProvisionResponse = ensure_success(resp)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        Ok(body
            .endpoint
            .unwrap_or_else(|| format!("{}/sandboxes/{}", self.base_url, config.sandbox_id)))
    }

    async fn execute(
        &self,
        sandbox: &Sandbox,
        call: &BackendCall,
    ) -> Result<BackendOutput, BackendError> {
        let url = format!("{}/execute", self.sandbox_url(sandbox));
        let resp = self
            .authorize(self.client.post(&url).json(call))
            .send()
            .await?;
        ensure_success(resp)
            .await?
            .json::<BackendOutput>()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))
    }

    async fn destroy(&self, endpoint: &str) -> Result<(), BackendError> {
        let resp = self.authorize(self.client.delete(endpoint)).send().await?;
        ensure_success(resp).await.map(|_| ())
    }
}
