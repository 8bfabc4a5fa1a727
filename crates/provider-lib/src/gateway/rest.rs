//! HTTP gateway for the container instance management API

use super::{ContainerGroupGateway, GatewayError, LogOptions};
use crate::aci;
use crate::error::{ProviderError, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://management.azure.com";
pub const API_VERSION: &str = "2021-10-01";

/// Configuration for the REST gateway
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Management endpoint (e.g., "https://management.azure.com")
    pub endpoint: String,
    pub subscription_id: String,
    pub resource_group: String,
    /// Bearer token sent with every request
    pub access_token: String,
    pub api_version: String,
    /// Request timeout
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            subscription_id: String::new(),
            resource_group: String::new(),
            access_token: String::new(),
            api_version: API_VERSION.to_string(),
            request_timeout: Duration::from_secs(30),
            user_agent: concat!("aci-provider/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// One page of a list response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Logs {
    #[serde(default)]
    content: String,
}

/// `ContainerGroupGateway` over the management REST API
pub struct RestGateway {
    client: Client,
    base_url: Url,
    config: RestConfig,
}

impl RestGateway {
    pub fn new(config: RestConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ProviderError::configuration(format!("failed to create HTTP client: {e}")))?;

        let base_url = Url::parse(&config.endpoint).map_err(|e| {
            ProviderError::configuration(format!("invalid endpoint {:?}: {e}", config.endpoint))
        })?;

        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    /// Get the endpoint URL
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn url(&self, path: &str) -> std::result::Result<Url, GatewayError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| GatewayError::Transport(format!("invalid path {path:?}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("api-version", &self.config.api_version);
        Ok(url)
    }

    fn group_path(&self, name: &str) -> String {
        format!(
            "subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerInstance/containerGroups/{}",
            self.config.subscription_id, self.config.resource_group, name
        )
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.config.access_token)
    }

    async fn send(&self, request: RequestBuilder) -> std::result::Result<Response, GatewayError> {
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> std::result::Result<T, GatewayError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }

    /// Follow `nextLink` until the listing is exhausted
    async fn list_all<T: DeserializeOwned>(&self, first: Url) -> std::result::Result<Vec<T>, GatewayError> {
        let mut items = Vec::new();
        let mut next = Some(first);

        while let Some(url) = next.take() {
            let page: Page<T> = self.json(self.request(Method::GET, url)).await?;
            items.extend(page.value);
            next = match page.next_link.filter(|link| !link.is_empty()) {
                Some(link) => Some(
                    Url::parse(&link)
                        .map_err(|e| GatewayError::Decode(format!("invalid nextLink {link:?}: {e}")))?,
                ),
                None => None,
            };
        }

        Ok(items)
    }
}

#[async_trait]
impl ContainerGroupGateway for RestGateway {
    async fn create_group(
        &self,
        name: &str,
        group: &aci::ContainerGroup,
    ) -> std::result::Result<aci::ContainerGroup, GatewayError> {
        let url = self.url(&self.group_path(name))?;
        debug!(group = %name, "Creating container group");
        self.json(self.request(Method::PUT, url).json(group)).await
    }

    async fn get_group(&self, name: &str) -> std::result::Result<aci::ContainerGroup, GatewayError> {
        let url = self.url(&self.group_path(name))?;
        self.json(self.request(Method::GET, url)).await
    }

    async fn list_groups(&self) -> std::result::Result<Vec<aci::ContainerGroup>, GatewayError> {
        let path = format!(
            "subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerInstance/containerGroups",
            self.config.subscription_id, self.config.resource_group
        );
        self.list_all(self.url(&path)?).await
    }

    async fn delete_group(&self, name: &str) -> std::result::Result<(), GatewayError> {
        let url = self.url(&self.group_path(name))?;
        debug!(group = %name, "Deleting container group");
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    async fn exec_command(
        &self,
        group: &str,
        container: &str,
        request: &aci::ExecRequest,
    ) -> std::result::Result<aci::ExecResponse, GatewayError> {
        let path = format!("{}/containers/{}/exec", self.group_path(group), container);
        let url = self.url(&path)?;
        self.json(self.request(Method::POST, url).json(request)).await
    }

    async fn container_logs(
        &self,
        group: &str,
        container: &str,
        options: &LogOptions,
    ) -> std::result::Result<String, GatewayError> {
        let path = format!("{}/containers/{}/logs", self.group_path(group), container);
        let mut url = self.url(&path)?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(tail) = options.tail {
                query.append_pair("tail", &tail.to_string());
            }
            if options.timestamps {
                query.append_pair("timestamps", "true");
            }
        }

        let logs: Logs = self.json(self.request(Method::GET, url)).await?;
        Ok(logs.content)
    }

    async fn list_capabilities(
        &self,
        region: &str,
    ) -> std::result::Result<Vec<aci::Capability>, GatewayError> {
        let path = format!(
            "subscriptions/{}/providers/Microsoft.ContainerInstance/locations/{}/capabilities",
            self.config.subscription_id, region
        );
        self.list_all(self.url(&path)?).await
    }
}
