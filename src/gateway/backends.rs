// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! HTTP model backends
//!
//! - **Ollama**: `POST /api/generate`, probe `GET /api/tags`, always local
//! - **OpenAI-compatible**: `POST /chat/completions` with a bearer key; local
//!   when the endpoint is a loopback address (LM Studio, llama.cpp server)
//! - **Anthropic**: `POST /messages` with `x-api-key`, always remote
//!
//! Status mapping is shared: 429 is a rate limit, 5xx and transport failures
//! mean unavailable, anything unparsable is an invalid response.

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::{Host, Url};

use super::backend::{BackendError, BackendKind, ModelBackend};
use super::prompt::AssembledPrompt;
use crate::config::BackendConfig;
use crate::errors::{EngineError, EngineResult};
use crate::session::Role;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Whether `endpoint` points at this machine
pub fn is_loopback(endpoint: &str) -> bool {
    match Url::parse(endpoint).ok().and_then(|u| u.host().map(|h| h.to_owned())) {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-success HTTP status to a backend error
fn status_error(backend: &str, response: &Response) -> BackendError {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        BackendError::RateLimited {
            backend: backend.to_string(),
            retry_after: retry_after(response),
        }
    } else if status.is_server_error()
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || status == StatusCode::NOT_FOUND
    {
        BackendError::unavailable(backend, format!("HTTP {}", status))
    } else {
        BackendError::invalid(backend, format!("HTTP {}", status))
    }
}

fn transport_error(backend: &str, err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::unavailable(backend, "request timed out")
    } else {
        BackendError::unavailable(backend, err)
    }
}

/// Upper bound on an availability check, whatever the request timeout
pub const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(3);

fn http_client(timeout: Duration) -> EngineResult<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| EngineError::Config(format!("HTTP client: {}", e)))
}

// ---------------------------------------------------------------------------
// Ollama

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: String,
    system: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    num_predict: usize,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

pub struct OllamaBackend {
    client: Client,
    availability_timeout: Duration,
    name: String,
    endpoint: String,
    model: String,
    context_window: usize,
    max_response_tokens: usize,
}

impl OllamaBackend {
    pub fn new(config: &BackendConfig, timeout: Duration) -> EngineResult<Self> {
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        info!(
            "Ollama backend {} configured: endpoint={}, model={}",
            config.name, endpoint, config.model
        );
        Ok(Self {
            client: http_client(timeout)?,
            availability_timeout: timeout.min(AVAILABILITY_TIMEOUT),
            name: config.name.clone(),
            endpoint,
            model: config.model.clone(),
            context_window: config.context_window,
            max_response_tokens: config.max_response_tokens,
        })
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Ollama
    }

    fn is_local(&self) -> bool {
        true
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn max_response_tokens(&self) -> usize {
        self.max_response_tokens
    }

    async fn probe(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/tags", self.endpoint))
            .timeout(self.availability_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Ollama probe for {} failed: {}", self.name, e);
                false
            }
        }
    }

    async fn invoke(
        &self,
        prompt: &AssembledPrompt,
        max_tokens: usize,
        _credential: Option<&SecretString>,
    ) -> Result<String, BackendError> {
        let request = OllamaRequest {
            model: &self.model,
            prompt: prompt.render_text(),
            system: &prompt.system,
            stream: false,
            options: OllamaOptions {
                num_predict: max_tokens,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.endpoint))
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        if !response.status().is_success() {
            return Err(status_error(&self.name, &response));
        }

        let body: OllamaResponse = response
            .json()
            .await
            .map_err(|e| BackendError::invalid(&self.name, e))?;
        Ok(body.response.trim().to_string())
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: usize,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

pub struct OpenAiCompatibleBackend {
    client: Client,
    availability_timeout: Duration,
    name: String,
    endpoint: String,
    model: String,
    local: bool,
    context_window: usize,
    max_response_tokens: usize,
}

impl OpenAiCompatibleBackend {
    pub fn new(config: &BackendConfig, timeout: Duration) -> EngineResult<Self> {
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        let local = is_loopback(&endpoint);
        info!(
            "OpenAI-compatible backend {} configured: endpoint={}, model={}, local={}",
            config.name, endpoint, config.model, local
        );
        Ok(Self {
            client: http_client(timeout)?,
            availability_timeout: timeout.min(AVAILABILITY_TIMEOUT),
            name: config.name.clone(),
            endpoint,
            model: config.model.clone(),
            local,
            context_window: config.context_window,
            max_response_tokens: config.max_response_tokens,
        })
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::OpenAiCompatible
    }

    fn is_local(&self) -> bool {
        self.local
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn max_response_tokens(&self) -> usize {
        self.max_response_tokens
    }

    async fn probe(&self) -> bool {
        // Any answer below 500 means the server is up; auth is checked on invoke
        match self
            .client
            .get(format!("{}/models", self.endpoint))
            .timeout(self.availability_timeout)
            .send()
            .await
        {
            Ok(resp) => !resp.status().is_server_error(),
            Err(e) => {
                debug!("Probe for {} failed: {}", self.name, e);
                false
            }
        }
    }

    async fn invoke(
        &self,
        prompt: &AssembledPrompt,
        max_tokens: usize,
        credential: Option<&SecretString>,
    ) -> Result<String, BackendError> {
        let mut messages = Vec::with_capacity(prompt.turns.len() + 1);
        if !prompt.system.is_empty() {
            messages.push(ChatMessage {
                role: Role::System.as_str().to_string(),
                content: prompt.system.clone(),
            });
        }
        messages.extend(prompt.turns.iter().map(|t| ChatMessage {
            role: t.role.as_str().to_string(),
            content: t.content.clone(),
        }));

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .json(&ChatRequest {
                model: &self.model,
                messages,
                max_tokens,
            });
        if let Some(key) = credential {
            request = request.bearer_auth(key.expose_secret());
        } else if !self.local {
            return Err(BackendError::MissingCredential(self.name.clone()));
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        if !response.status().is_success() {
            return Err(status_error(&self.name, &response));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::invalid(&self.name, e))?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| BackendError::invalid(&self.name, "response contained no choices"))
    }
}

// ---------------------------------------------------------------------------
// Anthropic

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

pub struct AnthropicBackend {
    client: Client,
    availability_timeout: Duration,
    name: String,
    endpoint: String,
    model: String,
    context_window: usize,
    max_response_tokens: usize,
}

impl AnthropicBackend {
    pub fn new(config: &BackendConfig, timeout: Duration) -> EngineResult<Self> {
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        info!(
            "Anthropic backend {} configured: endpoint={}, model={}",
            config.name, endpoint, config.model
        );
        Ok(Self {
            client: http_client(timeout)?,
            availability_timeout: timeout.min(AVAILABILITY_TIMEOUT),
            name: config.name.clone(),
            endpoint,
            model: config.model.clone(),
            context_window: config.context_window,
            max_response_tokens: config.max_response_tokens,
        })
    }
}

#[async_trait]
impl ModelBackend for AnthropicBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Anthropic
    }

    fn is_local(&self) -> bool {
        false
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn max_response_tokens(&self) -> usize {
        self.max_response_tokens
    }

    async fn probe(&self) -> bool {
        match self
            .client
            .get(format!("{}/models", self.endpoint))
            .timeout(self.availability_timeout)
            .send()
            .await
        {
            Ok(resp) => !resp.status().is_server_error(),
            Err(e) => {
                debug!("Probe for {} failed: {}", self.name, e);
                false
            }
        }
    }

    async fn invoke(
        &self,
        prompt: &AssembledPrompt,
        max_tokens: usize,
        credential: Option<&SecretString>,
    ) -> Result<String, BackendError> {
        let key = credential.ok_or_else(|| BackendError::MissingCredential(self.name.clone()))?;

        // The messages API has no system role inside the turn list
        let messages = prompt
            .turns
            .iter()
            .filter(|t| t.role != Role::System)
            .map(|t| ChatMessage {
                role: t.role.as_str().to_string(),
                content: t.content.clone(),
            })
            .collect();

        let response = self
            .client
            .post(format!("{}/messages", self.endpoint))
            .header("x-api-key", key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&MessagesRequest {
                model: &self.model,
                max_tokens,
                system: &prompt.system,
                messages,
            })
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        if !response.status().is_success() {
            return Err(status_error(&self.name, &response));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| BackendError::invalid(&self.name, e))?;
        let text: String = body
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(BackendError::invalid(&self.name, "response contained no text"));
        }
        Ok(text.trim().to_string())
    }
}

/// Build the backend described by `config`
pub fn build_backend(config: &BackendConfig, timeout: Duration) -> EngineResult<Arc<dyn ModelBackend>> {
    let backend: Arc<dyn ModelBackend> = match config.kind {
        BackendKind::Ollama => Arc::new(OllamaBackend::new(config, timeout)?),
        BackendKind::OpenAiCompatible => Arc::new(OpenAiCompatibleBackend::new(config, timeout)?),
        BackendKind::Anthropic => Arc::new(AnthropicBackend::new(config, timeout)?),
    };
    Ok(backend)
}
