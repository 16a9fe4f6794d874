use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};

use crate::wearable::REQUEST_TIMEOUT;

/// Remote notification gateway: which groups a user receives pushes for.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn register_user(
        &self,
        user_id: &str,
        groups: &[String],
        registration_id: &str,
    ) -> anyhow::Result<()>;

    async fn remove_user_from_group(&self, user_id: &str, group: &str) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum GatewayEnv {
    Sandbox,
    Production,
}

pub struct HttpGatewayClient {
    client: Client,
    base: Url,
    sender_id: String,
    env: GatewayEnv,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterUserRequest<'a> {
    sender_id: &'a str,
    user_id: &'a str,
    user_type: &'static str,
    groups: &'a [String],
    registration_id: &'a str,
    environment: GatewayEnv,
}

#[derive(Deserialize)]
struct GatewayError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl HttpGatewayClient {
    pub fn new(base_url: &str, sender_id: &str, env: GatewayEnv) -> anyhow::Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("invalid gateway url '{base_url}'"))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("invalid gateway url '{base_url}': not a base url");
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build gateway http client")?;
        Ok(Self {
            client,
            base,
            sender_id: sender_id.to_string(),
            env,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("gateway url cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn check_response(res: Response) -> anyhow::Result<()> {
    let status = res.status();
    if status.is_success() {
        return Ok(());
    }
    match res.json::<GatewayError>().await {
        Ok(GatewayError { code, description }) => anyhow::bail!(
            "gateway error code={} description={}",
            code.as_deref().unwrap_or("?"),
            description.as_deref().unwrap_or("?")
        ),
        Err(_) => anyhow::bail!("http_{}", status.as_u16()),
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn register_user(
        &self,
        user_id: &str,
        groups: &[String],
        registration_id: &str,
    ) -> anyhow::Result<()> {
        let url = self.endpoint(&["v2", "users"])?;
        let body = RegisterUserRequest {
            sender_id: &self.sender_id,
            user_id,
            user_type: "OTHER",
            groups,
            registration_id,
            environment: self.env,
        };
        let res = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("register_user request")?;
        check_response(res).await
    }

    async fn remove_user_from_group(&self, user_id: &str, group: &str) -> anyhow::Result<()> {
        let url = self.endpoint(&["v2", "users", user_id, "groups", group])?;
        let res = self
            .client
            .delete(url)
            .query(&[("senderId", self.sender_id.as_str())])
            .send()
            .await
            .context("remove_user_from_group request")?;
        check_response(res).await
    }
}
