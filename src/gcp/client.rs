//! GCP Client
//!
//! Compute Engine REST client combining authentication and HTTP. Implements
//! [`ComputeApi`] so the provisioning core can drive real infrastructure.

use super::auth::GcpCredentials;
use super::error::ApiError;
use super::http::GcpHttpClient;
use crate::provision::api::ComputeApi;
use crate::provision::descriptor::{ResourceKind, ResourceRef, Scope};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Public Compute Engine endpoint
pub const DEFAULT_ENDPOINT: &str = "https://compute.googleapis.com";

/// Compute Engine client bound to one project
#[derive(Clone)]
pub struct GcpClient {
    pub credentials: GcpCredentials,
    pub http: GcpHttpClient,
    pub project_id: String,
    endpoint: String,
}

impl GcpClient {
    /// Create a client with credentials from the environment or ADC
    pub async fn new(project_id: &str) -> Result<Self> {
        let credentials = GcpCredentials::from_env()
            .await
            .context("Failed to initialize GCP credentials")?;

        Self::with_credentials(credentials, project_id)
    }

    pub fn with_credentials(credentials: GcpCredentials, project_id: &str) -> Result<Self> {
        let http = GcpHttpClient::new()?;

        Ok(Self {
            credentials,
            http,
            project_id: project_id.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        })
    }

    /// Point the client at another API root (emulators, tests)
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self> {
        let parsed = url::Url::parse(endpoint)
            .with_context(|| format!("Invalid API endpoint '{}'", endpoint))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("API endpoint '{}' must use http or https", endpoint);
        }
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        Ok(self)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn token(&self) -> Result<String, ApiError> {
        self.credentials
            .get_token()
            .await
            .map_err(|e| ApiError::Auth(format!("{:#}", e)))
    }

    // =========================================================================
    // Compute Engine URL helpers
    // =========================================================================

    /// Build Compute Engine API URL
    pub fn compute_url(&self, path: &str) -> String {
        format!(
            "{}/compute/v1/projects/{}/{}",
            self.endpoint, self.project_id, path
        )
    }

    /// Collection URL, e.g. `.../regions/us-central1/subnetworks`
    pub fn collection_url(&self, kind: ResourceKind, scope: &Scope) -> String {
        self.compute_url(&format!("{}/{}", scope.path(), kind.collection()))
    }

    pub fn resource_url(&self, resource: &ResourceRef) -> String {
        format!(
            "{}/{}",
            self.collection_url(resource.kind, &resource.scope),
            urlencoding::encode(&resource.name)
        )
    }

    pub fn operation_url(&self, scope: &Scope, name: &str) -> String {
        self.compute_url(&format!(
            "{}/operations/{}",
            scope.path(),
            urlencoding::encode(name)
        ))
    }
}

#[async_trait]
impl ComputeApi for GcpClient {
    fn project(&self) -> &str {
        &self.project_id
    }

    async fn get(&self, resource: &ResourceRef) -> Result<Value, ApiError> {
        let token = self.token().await?;
        self.http.get(&self.resource_url(resource), &token).await
    }

    async fn insert(&self, kind: ResourceKind, scope: &Scope, body: &Value) -> Result<Value, ApiError> {
        let token = self.token().await?;
        // requestId lets the API deduplicate a resubmitted insert
        let url = format!(
            "{}?requestId={}",
            self.collection_url(kind, scope),
            uuid::Uuid::new_v4()
        );
        self.http.post(&url, &token, Some(body)).await
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<Value, ApiError> {
        let token = self.token().await?;
        self.http.delete(&self.resource_url(resource), &token).await
    }

    async fn invoke(&self, resource: &ResourceRef, verb: &str, body: &Value) -> Result<Value, ApiError> {
        let token = self.token().await?;
        let url = format!("{}/{}", self.resource_url(resource), verb);
        self.http.post(&url, &token, Some(body)).await
    }

    async fn patch(&self, resource: &ResourceRef, body: &Value) -> Result<Value, ApiError> {
        let token = self.token().await?;
        self.http.patch(&self.resource_url(resource), &token, body).await
    }

    async fn get_operation(&self, scope: &Scope, name: &str) -> Result<Value, ApiError> {
        let token = self.token().await?;
        self.http.get(&self.operation_url(scope, name), &token).await
    }
}
