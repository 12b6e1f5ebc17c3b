use anyhow::{Context, Result, anyhow};
use reqwest::{Response, Url};
use std::collections::HashMap;
use std::time::Duration;

use crate::model::{Cid, RemotePinStatus};

/// Remote content-store operations used by the tracker.
///
/// Workers race every call against the operation's cancellation token and
/// drop the future when it fires, so implementations must tolerate being
/// abandoned at any `.await` point and must not block the executor.
#[async_trait::async_trait]
pub trait IpfsClient: Send + Sync {
    async fn pin_add(&self, cid: &Cid) -> Result<()>;
    async fn pin_rm(&self, cid: &Cid) -> Result<()>;
    async fn pin_ls_all(&self) -> Result<HashMap<String, RemotePinStatus>>;
    async fn pin_ls_single(&self, cid: &Cid) -> Result<RemotePinStatus>;
}

#[derive(Clone)]
pub struct Client {
    base: Url,
    http: reqwest::Client,
}

impl Client {
    pub fn new(api_url: &str, timeout: Option<Duration>) -> Result<Self> {
        let base = Url::parse(api_url).with_context(|| format!("invalid ipfs api url {api_url}"))?;
        let mut builder = reqwest::Client::builder().user_agent("pin-tracker/0.1");
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        let http = builder.build().context("build_http_client")?;
        Ok(Self { base, http })
    }

    async fn post(&self, path: &str, query: &[(&str, &str)]) -> Result<Response> {
        let url = self.base.join(path)?;
        let resp = self.http.post(url).query(query).send().await?;
        Ok(resp)
    }

    pub async fn pin_add(&self, cid: &Cid) -> Result<()> {
        let resp = self
            .post("/api/v0/pin/add", &[("arg", cid.as_str()), ("recursive", "true")])
            .await?;
        ok_or_message(resp).await?;
        Ok(())
    }

    pub async fn pin_rm(&self, cid: &Cid) -> Result<()> {
        let resp = self
            .post("/api/v0/pin/rm", &[("arg", cid.as_str()), ("recursive", "true")])
            .await?;
        match ok_or_message(resp).await {
            Ok(_) => Ok(()),
            // Already gone is what we wanted
            Err(e) if is_not_pinned(&e) => {
                tracing::debug!(%cid, "pin_rm_not_pinned");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn pin_ls_all(&self) -> Result<HashMap<String, RemotePinStatus>> {
        let resp = self.post("/api/v0/pin/ls", &[("type", "all")]).await?;
        let val: serde_json::Value = ok_or_message(resp).await?.json().await?;
        Ok(parse_pin_ls(&val))
    }

    /// Lightweight per-CID pin check using /api/v0/pin/ls?arg=<cid>.
    pub async fn pin_ls_single(&self, cid: &Cid) -> Result<RemotePinStatus> {
        let resp = self
            .post("/api/v0/pin/ls", &[("arg", cid.as_str()), ("type", "all")])
            .await?;
        let resp = match ok_or_message(resp).await {
            Ok(resp) => resp,
            Err(e) if is_not_pinned(&e) => return Ok(RemotePinStatus::Unpinned),
            Err(e) => return Err(e),
        };
        let val: serde_json::Value = resp.json().await?;
        Ok(parse_pin_ls(&val)
            .remove(cid.as_str())
            .unwrap_or(RemotePinStatus::Unpinned))
    }
}

/// The daemon reports failures as `{"Message": "...", "Code": 0, "Type": "error"}`
/// with a non-2xx status; surface the message rather than the bare status.
async fn ok_or_message(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("Message").and_then(|m| m.as_str()).map(str::to_owned))
        .unwrap_or(body);
    Err(anyhow!("ipfs returned {status}: {message}"))
}

fn is_not_pinned(e: &anyhow::Error) -> bool {
    e.to_string().contains("not pinned")
}

fn parse_pin_ls(val: &serde_json::Value) -> HashMap<String, RemotePinStatus> {
    let mut out = HashMap::new();

    // Older Kubo: Keys map
    if let Some(keys) = val.get("Keys").and_then(|k| k.as_object()) {
        for (cid, obj) in keys {
            let t = obj.get("Type").and_then(|t| t.as_str()).unwrap_or("recursive");
            out.insert(cid.clone(), RemotePinStatus::from_ipfs_type(t));
        }
    }

    // Newer Kubo: Pins array
    if let Some(arr) = val.get("Pins").and_then(|a| a.as_array()) {
        for v in arr {
            if let Some(cid) = v.get("Cid").and_then(|c| c.as_str()) {
                let t = v.get("Type").and_then(|t| t.as_str()).unwrap_or("recursive");
                out.insert(cid.to_string(), RemotePinStatus::from_ipfs_type(t));
            }
        }
    }

    out
}

#[async_trait::async_trait]
impl IpfsClient for Client {
    async fn pin_add(&self, cid: &Cid) -> Result<()> {
        self.pin_add(cid).await
    }

    async fn pin_rm(&self, cid: &Cid) -> Result<()> {
        self.pin_rm(cid).await
    }

    async fn pin_ls_all(&self) -> Result<HashMap<String, RemotePinStatus>> {
        self.pin_ls_all().await
    }

    async fn pin_ls_single(&self, cid: &Cid) -> Result<RemotePinStatus> {
        self.pin_ls_single(cid).await
    }
}
