use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers one notification payload to the wearable device.
#[async_trait]
pub trait WearableSender: Send + Sync {
    async fn send(&self, payload: &str) -> anyhow::Result<()>;
}

/// Posts payloads to a bridge endpoint that renders them on the wearable.
pub struct HttpWearableSender {
    client: Client,
    endpoint: String,
}

impl HttpWearableSender {
    pub fn new(endpoint: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build wearable http client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl WearableSender for HttpWearableSender {
    async fn send(&self, payload: &str) -> anyhow::Result<()> {
        let res = self
            .client
            .post(&self.endpoint)
            .json(&wearable_body(payload))
            .send()
            .await
            .with_context(|| format!("post to {}", self.endpoint))?;
        ensure_delivered(&res)
    }
}

fn ensure_delivered(res: &Response) -> anyhow::Result<()> {
    if !res.status().is_success() {
        anyhow::bail!("http_{}", res.status().as_u16());
    }
    Ok(())
}

/// Used when no wearable endpoint is configured.
pub struct LogSender;

#[async_trait]
impl WearableSender for LogSender {
    async fn send(&self, payload: &str) -> anyhow::Result<()> {
        info!("no wearable configured; dropping {} byte notification", payload.len());
        Ok(())
    }
}

/// JSON payloads are forwarded as-is; anything else is wrapped as plain text.
fn wearable_body(payload: &str) -> Value {
    match serde_json::from_str::<Value>(payload) {
        Ok(v @ Value::Object(_)) => v,
        _ => json!({ "text": payload }),
    }
}
