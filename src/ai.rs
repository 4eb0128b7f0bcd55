//! Chat-completion collaborator for analyzing sandbox failures.
//!
//! The engine never calls this module itself; the CLI asks it to explain a
//! failed run when `ai_module.auto_report_errors` is set. The lifecycle
//! hooks exist so the agent registers and cleans up like any other module.

use serde::{Deserialize, Serialize};

use crate::config::types::SandboxConfiguration;
use crate::error::{Result, SandboxError};
use crate::module::{Module, ModuleCtx, ModuleState, ModuleType};

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// Talks to an OpenAI-compatible chat-completions endpoint.
pub struct AiAgent {
    state: ModuleState,
    active: bool,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    system_prompt: String,
    client: Option<reqwest::blocking::Client>,
}

impl AiAgent {
    pub fn new() -> Self {
        Self {
            state: ModuleState::Uninitialized,
            active: false,
            api_key: String::new(),
            base_url: String::new(),
            model: String::new(),
            temperature: 0.0,
            max_tokens: 0,
            system_prompt: String::new(),
            client: None,
        }
    }

    /// True when the agent has a key and a client and can answer queries.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Asks the model to explain a sandbox failure. `context` carries
    /// whatever surrounding detail the caller has (config summary, captured
    /// output).
    pub fn analyze_error(&self, message: &str, context: &str) -> Result<String> {
        if !self.active {
            return Err(SandboxError::Config(
                "AI module is not active".to_string(),
            ));
        }
        let prompt = format!(
            "A sandbox run failed with the following error:\n{}\n\nContext:\n{}\n\
             Explain the likely cause and suggest a fix.",
            message, context
        );
        self.query(&prompt)
    }

    fn query(&self, prompt: &str) -> Result<String> {
        let client = self.client.as_ref().ok_or_else(|| {
            SandboxError::Config("AI client is not initialized".to_string())
        })?;

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: self.system_prompt.clone(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt.to_string(),
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        log::debug!("querying {} with model {}", url, self.model);

        let response = client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|e| SandboxError::Resource(format!("AI request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SandboxError::Resource(format!(
                "AI endpoint returned {}",
                status
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| SandboxError::Resource(format!("malformed AI response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| SandboxError::Resource("AI response had no choices".to_string()))
    }
}

impl Default for AiAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for AiAgent {
    fn name(&self) -> &'static str {
        "ai-agent"
    }

    fn module_type(&self) -> ModuleType {
        ModuleType::Ai
    }

    fn description(&self) -> &'static str {
        "chat-completion assistant that analyzes sandbox failures"
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn is_enabled(&self, config: &SandboxConfiguration) -> bool {
        config.ai_module.enabled
    }

    fn initialize(&mut self, ctx: &ModuleCtx) -> Result<()> {
        let ai = &ctx.config.ai_module;
        if !ai.enabled {
            log::info!("AI module is disabled");
            self.state = ModuleState::Initialized;
            return Ok(());
        }

        self.base_url = ai.base_url.clone();
        self.model = ai.model.clone();
        self.temperature = ai.temperature;
        self.max_tokens = ai.max_tokens;
        self.system_prompt = ai.system_prompt.clone();

        match std::env::var(&ai.api_key_env) {
            Ok(key) if !key.is_empty() => self.api_key = key,
            _ => {
                log::warn!(
                    "AI API key not found in ${}, module will stay inactive",
                    ai.api_key_env
                );
                self.state = ModuleState::Initialized;
                return Ok(());
            }
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| SandboxError::Resource(format!("build HTTP client: {}", e)))?;
        self.client = Some(client);
        self.active = true;

        log::info!("AI agent ready (model {}, endpoint {})", self.model, self.base_url);
        self.state = ModuleState::Initialized;
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &ModuleCtx) -> Result<()> {
        self.client = None;
        self.active = false;
        self.state = ModuleState::Stopped;
        Ok(())
    }
}
