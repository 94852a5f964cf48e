//! Drone REST API client
//!
//! Implements [`BuildClient`] over HTTP. Every request carries the access
//! token as an OAuth2 bearer credential.

use async_trait::async_trait;
use downstream_core::{BuildClient, ClientError, ClientResult, ParameterSet, RemoteBuild};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

/// Drone client configuration
#[derive(Debug, Clone)]
pub struct DroneConfig {
    /// Server URL, e.g. `https://drone.example.com`
    pub server: String,
    /// Personal access token
    pub token: String,
}

impl DroneConfig {
    pub fn new(server: &str, token: &str) -> Self {
        DroneConfig {
            server: server.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }
}

/// Drone API client
pub struct DroneClient {
    config: DroneConfig,
    http_client: reqwest::Client,
}

impl DroneClient {
    /// Create a new client
    pub fn new(config: DroneConfig) -> ClientResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("drone-downstream/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        Ok(DroneClient {
            config,
            http_client,
        })
    }

    pub fn server(&self) -> &str {
        &self.config.server
    }

    fn request(&self, method: Method, owner: &str, name: &str, path: &str) -> RequestBuilder {
        let url = format!(
            "{}/api/repos/{}/{}/{}",
            self.config.server, owner, name, path
        );
        debug!("{} {}", method, url);
        self.http_client
            .request(method, url)
            .bearer_auth(&self.config.token)
    }

    async fn execute(&self, request: RequestBuilder) -> ClientResult<String> {
        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        let url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(url));
        }
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }
        Ok(body)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> ClientResult<T> {
        let body = self.execute(request).await?;
        serde_json::from_str(&body).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

fn query(params: &ParameterSet) -> Vec<(&str, &str)> {
    params.iter().collect()
}

#[async_trait]
impl BuildClient for DroneClient {
    async fn last_build(&self, owner: &str, name: &str, branch: &str) -> ClientResult<RemoteBuild> {
        let mut request = self.request(Method::GET, owner, name, "builds/latest");
        if !branch.is_empty() {
            request = request.query(&[("branch", branch)]);
        }
        self.fetch(request).await
    }

    async fn build(&self, owner: &str, name: &str, number: i64) -> ClientResult<RemoteBuild> {
        let request = self.request(Method::GET, owner, name, &format!("builds/{number}"));
        self.fetch(request).await
    }

    async fn list_builds(
        &self,
        owner: &str,
        name: &str,
        page: u32,
    ) -> ClientResult<Vec<RemoteBuild>> {
        let request = self
            .request(Method::GET, owner, name, "builds")
            .query(&[("page", page)]);
        self.fetch(request).await
    }

    async fn restart_build(
        &self,
        owner: &str,
        name: &str,
        number: i64,
        params: &ParameterSet,
    ) -> ClientResult<RemoteBuild> {
        let request = self
            .request(Method::POST, owner, name, &format!("builds/{number}"))
            .query(&query(params));
        self.fetch(request).await
    }

    async fn fork_build(
        &self,
        owner: &str,
        name: &str,
        build: &RemoteBuild,
        params: &ParameterSet,
    ) -> ClientResult<RemoteBuild> {
        let request = self
            .request(Method::POST, owner, name, "builds")
            .query(&[("branch", build.source.as_str()), ("commit", build.after.as_str())])
            .query(&query(params));
        self.fetch(request).await
    }

    async fn promote_build(
        &self,
        owner: &str,
        name: &str,
        number: i64,
        environment: &str,
        params: &ParameterSet,
    ) -> ClientResult<RemoteBuild> {
        let request = self
            .request(Method::POST, owner, name, &format!("builds/{number}/promote"))
            .query(&[("target", environment)])
            .query(&query(params));
        self.fetch(request).await
    }

    async fn cancel_build(&self, owner: &str, name: &str, number: i64) -> ClientResult<()> {
        let request = self.request(Method::DELETE, owner, name, &format!("builds/{number}"));
        self.execute(request).await.map(|_| ())
    }
}
