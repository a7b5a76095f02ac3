use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// -----------------------------------------------------------------------------
// Wire types
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    pub name: String,
    pub role: &'static str,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub keepalive: u16,
    pub mtu: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(rename = "allocatedAddress")]
    pub address: String,
    pub status: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceParams {
    pub address: Vec<String>,
    #[serde(default)]
    pub listen_port: Option<u16>,
    pub mtu: u16,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerEntry {
    pub public_key: String,
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub keepalive: Option<u16>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub interface: InterfaceParams,
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    leader: Option<String>,
}

// -----------------------------------------------------------------------------
// Client
// -----------------------------------------------------------------------------

/// Blocking HTTP client for the controller API. Writes landing on a
/// follower are retried once against the leader address the follower
/// names in its NOT_LEADER reply.
#[derive(Clone)]
pub struct ControllerClient {
    base: String,
    token: Option<String>,
    client: Client,
}

impl ControllerClient {
    pub fn new(base: &str, token: Option<String>) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    pub fn register(&self, body: &RegisterBody) -> Result<NodeInfo> {
        let resp = self.execute(Method::POST, "/nodes", Some(serde_json::to_value(body)?))?;
        Ok(resp.json()?)
    }

    pub fn fetch_config(&self, id: &str) -> Result<NodeConfig> {
        let resp = self.execute(Method::GET, &format!("/nodes/{}/config", id), None)?;
        Ok(resp.json()?)
    }

    pub fn report_status(&self, id: &str, status: &str) -> Result<()> {
        self.execute(
            Method::PUT,
            &format!("/nodes/{}", id),
            Some(serde_json::json!({ "status": status })),
        )?;
        Ok(())
    }

    fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response> {
        let url = format!("{}{}", self.base, path);
        let resp = self.send(method.clone(), &url, body.as_ref())?;

        if resp.status() == StatusCode::MISDIRECTED_REQUEST {
            let err: ErrorBody = resp.json().unwrap_or_default();
            let Some(leader) = err.leader else {
                bail!("controller is not the leader and named no leader");
            };

            println!("[agent] redirected to leader at {}", leader);
            let url = format!("{}{}", leader.trim_end_matches('/'), path);
            let resp = self.send(method, &url, body.as_ref())?;
            return check(resp);
        }

        check(resp)
    }

    fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Response> {
        let mut req: RequestBuilder = self.client.request(method, url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        req.send().with_context(|| format!("requesting {url}"))
    }
}

fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let err: ErrorBody = resp.json().unwrap_or_default();
    if err.code.is_empty() {
        bail!("controller returned {status}");
    }
    bail!("controller returned {status} ({}): {}", err.code, err.error)
}

// -----------------------------------------------------------------------------
// Retry policy
// -----------------------------------------------------------------------------

pub const MAX_RETRIES: u32 = 3;
pub const BACKOFF_BASE: Duration = Duration::from_secs(2);

pub fn next_delay(current: Duration, cap: Duration) -> Duration {
    (current * 2).min(cap)
}

/// Runs `op` up to `max_retries` times with exponential backoff capped
/// at `cap`. The caller logs and carries on after the final failure; the
/// next tick retries from scratch.
pub fn with_backoff<T>(
    label: &str,
    max_retries: u32,
    base: Duration,
    cap: Duration,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay = base.min(cap);
    let mut attempt = 0;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_retries {
                    return Err(err);
                }
                eprintln!(
                    "[agent] {} failed (attempt {}/{}): {:#}; retrying in {:?}",
                    label, attempt, max_retries, err, delay
                );
                thread::sleep(delay);
                delay = next_delay(delay, cap);
            }
        }
    }
}
