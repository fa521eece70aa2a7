use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Response;
use serde::de::DeserializeOwned;

use crate::error::{ClientError, Result};
use crate::model::{GatewayBotResponse, User};

/// The REST lookups the gateway core leans on.
///
/// [`Http`] implements it against the real API; tests and offline tools can
/// plug in their own through
/// [`ClientBuilder::entity_lookup`](crate::client::ClientBuilder::entity_lookup).
#[async_trait]
pub trait EntityLookup: Send + Sync {
    async fn current_user(&self) -> Result<User>;
}

pub struct Http {
    client: reqwest::Client,
    pub base_url: String,
}

impl Http {
    pub fn new(token: &str, base_url: String) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let auth_value = HeaderValue::from_str(&format!("Bot {}", token))
            .map_err(|_| ClientError::Api("token contains characters not allowed in a header".into()))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            client: reqwest::Client::builder().default_headers(headers).build()?,
            base_url,
        })
    }

    /// Gateway URL plus the recommended shard count and identify budget.
    pub async fn get_gateway_bot(&self) -> Result<GatewayBotResponse> {
        let url = format!("{}/gateway/bot", self.base_url);
        parse(self.client.get(&url).send().await?).await
    }

    pub async fn get_me(&self) -> Result<User> {
        let url = format!("{}/users/@me", self.base_url);
        parse(self.client.get(&url).send().await?).await
    }
}

#[async_trait]
impl EntityLookup for Http {
    async fn current_user(&self) -> Result<User> {
        self.get_me().await
    }
}

async fn parse<T: DeserializeOwned>(res: Response) -> Result<T> {
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(ClientError::Api(format!("HTTP {}: {}", status.as_u16(), body)));
    }
    Ok(res.json().await?)
}
