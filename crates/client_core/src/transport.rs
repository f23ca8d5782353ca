use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::AUTHORIZATION, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{domain::Identity, error::ApiError};
use tracing::debug;

use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
        }
    }
}

/// A fully resolved call against the offers API.
#[derive(Clone, PartialEq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub endpoint: String,
    pub body: Option<Value>,
    authorization: String,
}

impl ApiRequest {
    pub fn new(
        method: HttpMethod,
        endpoint: impl Into<String>,
        identity: &Identity,
        body: Option<Value>,
    ) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            body,
            authorization: identity.bearer(),
        }
    }

    pub fn json<T: Serialize>(
        method: HttpMethod,
        endpoint: impl Into<String>,
        identity: &Identity,
        body: &T,
    ) -> Result<Self, CallError> {
        let body = serde_json::to_value(body)
            .map_err(|err| CallError::Decode(format!("failed to encode request body: {err}")))?;
        Ok(Self::new(method, endpoint, identity, Some(body)))
    }

    pub fn authorization(&self) -> &str {
        &self.authorization
    }

    /// Shell command reproducing this request, for pasting into a terminal.
    pub fn curl(&self) -> String {
        let mut command = format!("curl -X {} '{}'", self.method.as_str(), self.endpoint);
        if self.body.is_some() {
            command.push_str(" \\\n  -H 'Content-Type: application/json'");
        }
        command.push_str(&format!(" \\\n  -H 'Authorization: {}'", self.authorization));
        if let Some(body) = &self.body {
            let pretty = serde_json::to_string_pretty(body).unwrap_or_else(|_| body.to_string());
            command.push_str(&format!(" \\\n  -d '{pretty}'"));
        }
        command
    }
}

impl std::fmt::Debug for ApiRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRequest")
            .field("method", &self.method)
            .field("endpoint", &self.endpoint)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns a non-2xx answer into [`CallError::Server`].
    pub fn ensure_success(self) -> Result<Self, CallError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(CallError::Server {
            error: ApiError::from_response(self.status, &self.body),
            response: self,
        })
    }
}

/// Seam between the controller and the network.
///
/// Implementations return any response they received, whatever its status;
/// only failures to get a response at all (or to read it) are errors.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, CallError>;
}

pub struct HttpTransport {
    http: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, CallError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| CallError::Transport(format!("failed to build http client: {err}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, CallError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.http.get(&request.endpoint),
            HttpMethod::Post => self.http.post(&request.endpoint),
            HttpMethod::Put => self.http.put(&request.endpoint),
        }
        .header(AUTHORIZATION, request.authorization());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| CallError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|err| CallError::Transport(format!("failed to read response: {err}")))?;
        debug!(
            method = request.method.as_str(),
            endpoint = %request.endpoint,
            status,
            "http: response received"
        );

        Ok(ApiResponse::new(status, parse_body(status, &text)?))
    }
}

/// Error pages are kept as text; a 2xx that is not JSON is a decode failure.
fn parse_body(status: u16, text: &str) -> Result<Value, CallError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    match serde_json::from_str(text) {
        Ok(value) => Ok(value),
        Err(_) if !(200..300).contains(&status) => Ok(Value::String(text.to_string())),
        Err(err) => Err(CallError::Decode(err.to_string())),
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
