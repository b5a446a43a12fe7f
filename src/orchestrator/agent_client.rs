//! HTTP client for the in-VM agent's control API.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;

use crate::models::provider::Provider;
use crate::protocol::{
    CredentialStatusResponse, DebugOptions, GetCredentialsResponse, OpenUrlRequest,
    StartAuthRequest, StartAuthResponse, TestAuthResponse,
};
use crate::{AppError, Result};

/// Talks to the agent listening on `agent_port` of a VM.
#[derive(Debug, Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    port: u16,
    request_timeout: Duration,
}

impl AgentClient {
    /// Build a client for agents listening on `port`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(port: u16, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| AppError::Config(format!("cannot build agent client: {err}")))?;
        Ok(Self {
            http,
            port,
            request_timeout,
        })
    }

    fn url(&self, vm_ip: &str, path: &str) -> String {
        format!("http://{vm_ip}:{}{path}", self.port)
    }

    /// Probe `GET /health`; `true` only on HTTP 200.
    pub async fn is_healthy(&self, vm_ip: &str, timeout: Duration) -> bool {
        match self
            .http
            .get(self.url(vm_ip, "/health"))
            .timeout(timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(_) => false,
        }
    }

    /// Ask the agent to start the provider's CLI login.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Agent` on transport failure or a non-2xx answer.
    pub async fn start_auth(
        &self,
        vm_ip: &str,
        provider: Provider,
        session_id: &str,
        debug: Option<DebugOptions>,
    ) -> Result<StartAuthResponse> {
        let resp = self
            .http
            .post(self.url(vm_ip, &format!("/auth/{provider}")))
            .timeout(self.request_timeout)
            .json(&StartAuthRequest {
                session_id: session_id.to_owned(),
                debug,
            })
            .send()
            .await
            .map_err(|err| AppError::Agent(format!("start-auth request failed: {err}")))?;
        decode(resp, "start-auth").await
    }

    /// Poll `GET /credentials/status`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NetworkTransient` on transport failure,
    /// `AppError::Agent` on a non-2xx answer.
    pub async fn credential_status(
        &self,
        vm_ip: &str,
        session_id: &str,
    ) -> Result<CredentialStatusResponse> {
        let resp = self
            .http
            .get(self.url(vm_ip, &format!("/credentials/status?sessionId={session_id}")))
            .timeout(self.request_timeout)
            .send()
            .await?;
        decode(resp, "credentials/status").await
    }

    /// Fetch the credential payload with `GET /credentials/get`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Agent` on transport failure or a non-2xx answer.
    pub async fn get_credentials(
        &self,
        vm_ip: &str,
        session_id: &str,
    ) -> Result<GetCredentialsResponse> {
        let resp = self
            .http
            .get(self.url(vm_ip, &format!("/credentials/get?sessionId={session_id}")))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|err| AppError::Agent(format!("credentials/get request failed: {err}")))?;
        decode(resp, "credentials/get").await
    }

    /// Relay `GET /oauth-url`, returning the agent's status and body unchanged.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NetworkTransient` on transport failure.
    pub async fn oauth_url(&self, vm_ip: &str, session_id: &str) -> Result<(StatusCode, Value)> {
        let resp = self
            .http
            .get(self.url(vm_ip, &format!("/oauth-url?sessionId={session_id}")))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    /// Relay `POST /open-url`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NetworkTransient` on transport failure.
    pub async fn open_url(
        &self,
        vm_ip: &str,
        url: &str,
        session_id: &str,
    ) -> Result<(StatusCode, Value)> {
        let resp = self
            .http
            .post(self.url(vm_ip, "/open-url"))
            .timeout(self.request_timeout)
            .json(&OpenUrlRequest {
                url: url.to_owned(),
                session_id: Some(session_id.to_owned()),
            })
            .send()
            .await?;
        let status = resp.status();
        let body = resp.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    /// Ask a worker VM's agent whether installed credentials are usable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NetworkTransient` or `AppError::Agent` on failure.
    pub async fn test_auth(&self, vm_ip: &str, provider: Provider) -> Result<bool> {
        let resp = self
            .http
            .get(self.url(vm_ip, &format!("/test-auth/{provider}")))
            .timeout(self.request_timeout)
            .send()
            .await?;
        let body: TestAuthResponse = decode(resp, "test-auth").await?;
        Ok(body.valid)
    }
}

async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response, what: &str) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(AppError::Agent(format!("{what} returned {status}: {text}")));
    }
    resp.json()
        .await
        .map_err(|err| AppError::Agent(format!("{what} returned malformed body: {err}")))
}
