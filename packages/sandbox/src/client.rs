// ABOUTME: Entry point of the sandbox client
// ABOUTME: Holds configuration and the transport, and signs control-plane requests

use std::sync::Arc;

use skiff_config::ClientConfig;
use skiff_transport::{ApiRequest, ApiResponse, HttpTransport, Method, Transport};
use tracing::debug;

use crate::error::Result;
use crate::sandbox::SandboxApi;
use crate::templates::TemplateApi;

const API_KEY_HEADER: &str = "X-API-Key";

/// Authenticated handle to the platform; cheap to clone
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
}

impl Client {
    /// Build a client from the process environment.
    ///
    /// Fails with `Validation` when `E2B_API_KEY` is absent.
    pub fn new() -> Result<Self> {
        Self::with_config(ClientConfig::from_env()?)
    }

    pub fn with_api_key(api_key: impl Into<String>) -> Result<Self> {
        Self::with_config(ClientConfig::with_api_key(api_key))
    }

    pub fn with_config(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = HttpTransport::new(&config)?;
        Ok(Self::from_parts(config, Arc::new(transport)))
    }

    /// Use a caller-supplied transport, e.g. a recording or in-memory one
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, transport))
    }

    fn from_parts(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        debug!(base_url = %config.base_url, "Created sandbox client");
        Self {
            config: Arc::new(config),
            transport,
        }
    }

    pub fn sandboxes(&self) -> SandboxApi {
        SandboxApi::new(self.clone())
    }

    pub fn templates(&self) -> TemplateApi {
        TemplateApi::new(self.clone())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// A control-plane request carrying the API key
    pub(crate) fn request(&self, method: Method, path: &str) -> ApiRequest {
        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        ApiRequest::new(method, url).header(API_KEY_HEADER, self.config.api_key())
    }

    pub(crate) async fn send(&self, request: ApiRequest) -> skiff_transport::Result<ApiResponse> {
        self.transport.send(request).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;

    #[test]
    fn test_blank_api_key_is_rejected() {
        let err = Client::with_api_key("   ").unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
    }

    #[test]
    fn test_control_requests_are_signed() {
        let client = Client::with_config(
            ClientConfig::with_api_key("key-123").base_url("http://localhost:9999/"),
        )
        .expect("valid config");

        let request = client.request(Method::Get, "/sandboxes");
        assert_eq!(request.url, "http://localhost:9999/sandboxes");
        assert_eq!(request.header_value("x-api-key"), Some("key-123"));
    }

    #[test]
    fn test_debug_output_hides_key() {
        let client = Client::with_api_key("super-secret").expect("valid config");
        assert!(!format!("{:?}", client).contains("super-secret"));
    }
}
