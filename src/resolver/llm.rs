//! LLM-backed interpreter. Builds requests for Anthropic or
//! OpenAI-compatible APIs and reads back a JSON array of candidates.

use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{Intent, TextInterpreter};
use crate::command::CommandDef;
use crate::error::AppError;
use crate::registry::catalog::param_schema;
use crate::settings::{LlmProvider, LlmProviderConfig, Settings};

/// Resolved provider details ready for making an API call.
#[derive(Debug, Clone)]
pub struct ResolvedProvider {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub provider: LlmProvider,
}

impl ResolvedProvider {
    /// Resolve a provider config into concrete URL / key / model values.
    pub fn from_config(config: &LlmProviderConfig) -> Result<Self, AppError> {
        let api_key = config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::Config {
                message: "No API key configured for the LLM interpreter".into(),
            })?
            .to_string();

        match config.provider {
            LlmProvider::Anthropic => Ok(Self {
                url: "https://api.anthropic.com/v1/messages".to_string(),
                api_key,
                model: config
                    .model
                    .clone()
                    .unwrap_or_else(|| "claude-sonnet-4-20250514".to_string()),
                provider: LlmProvider::Anthropic,
            }),
            LlmProvider::OpenAiCompatible => {
                let base = config
                    .base_url
                    .as_deref()
                    .unwrap_or("https://api.openai.com/v1");
                let base = base.trim_end_matches('/');
                Ok(Self {
                    url: format!("{base}/chat/completions"),
                    api_key,
                    model: config.model.clone().unwrap_or_else(|| "gpt-4o".to_string()),
                    provider: LlmProvider::OpenAiCompatible,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Sampling {
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Build the HTTP request for a single-turn completion.
pub fn build_request(
    client: &reqwest::Client,
    provider: &ResolvedProvider,
    system_prompt: &str,
    user_text: &str,
    sampling: Sampling,
) -> reqwest::RequestBuilder {
    match provider.provider {
        LlmProvider::Anthropic => {
            let body = json!({
                "model": provider.model,
                "max_tokens": sampling.max_tokens,
                "temperature": sampling.temperature,
                "system": system_prompt,
                "messages": [{ "role": "user", "content": user_text }],
            });
            client
                .post(&provider.url)
                .header("x-api-key", &provider.api_key)
                .header("anthropic-version", "2023-06-01")
                .header("content-type", "application/json")
                .json(&body)
        }
        LlmProvider::OpenAiCompatible => {
            let body = json!({
                "model": provider.model,
                "max_tokens": sampling.max_tokens,
                "temperature": sampling.temperature,
                "messages": [
                    { "role": "system", "content": system_prompt },
                    { "role": "user", "content": user_text },
                ],
            });
            client
                .post(&provider.url)
                .header("Authorization", format!("Bearer {}", provider.api_key))
                .header("content-type", "application/json")
                .json(&body)
        }
    }
}

/// Pull the assistant text out of a provider response.
pub fn response_text(provider: LlmProvider, json: &Value) -> Result<String, AppError> {
    let text = match provider {
        LlmProvider::Anthropic => json
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            }),
        LlmProvider::OpenAiCompatible => json
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string),
    };
    text.ok_or_else(|| AppError::Interpreter {
        message: "response carried no text".into(),
    })
}

#[derive(Deserialize)]
struct RawCandidate {
    command: String,
    #[serde(default)]
    params: Map<String, Value>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Parse the first JSON array in `text` into intents. Models like to wrap
/// JSON in prose or code fences.
pub fn parse_candidates(text: &str) -> Result<Vec<Intent>, AppError> {
    let bad = |message: String| AppError::Interpreter { message };
    let start = text
        .find('[')
        .ok_or_else(|| bad("no JSON array in response".into()))?;
    let end = text
        .rfind(']')
        .filter(|end| *end > start)
        .ok_or_else(|| bad("unterminated JSON array in response".into()))?;
    let slice = text
        .get(start..=end)
        .ok_or_else(|| bad("no JSON array in response".into()))?;
    let raw: Vec<RawCandidate> =
        serde_json::from_str(slice).map_err(|e| bad(format!("bad candidate list: {e}")))?;
    Ok(raw
        .into_iter()
        .map(|c| Intent::new(c.command, c.confidence.unwrap_or(0.5)).with_params(c.params))
        .collect())
}

pub fn system_prompt(commands: &[CommandDef]) -> String {
    let catalog: Vec<Value> = commands
        .iter()
        .map(|def| {
            json!({
                "name": def.identifier,
                "description": def.description,
                "parameters": param_schema(def.params),
            })
        })
        .collect();
    format!(
        "You translate video editing requests into commands.\n\
         Available commands (JSON Schema for parameters):\n{}\n\n\
         Reply with only a JSON array of candidates, most likely first:\n\
         [{{\"command\": \"<name>\", \"params\": {{...}}, \"confidence\": 0.0-1.0}}]\n\
         Positions are seconds or HH:MM:SS:FF. Omit parameters the user did not state.\n\
         Reply [] if nothing fits.",
        serde_json::to_string_pretty(&catalog).unwrap_or_else(|_| "[]".into())
    )
}

pub struct LlmInterpreter {
    client: reqwest::Client,
    provider: ResolvedProvider,
    sampling: Sampling,
}

impl LlmInterpreter {
    pub fn new(config: &LlmProviderConfig, settings: &Settings) -> Result<Self, AppError> {
        Ok(Self {
            client: reqwest::Client::new(),
            provider: ResolvedProvider::from_config(config)?,
            sampling: Sampling {
                temperature: settings.temperature,
                max_tokens: settings.max_tokens,
            },
        })
    }

    async fn complete(&self, text: &str, commands: &[CommandDef]) -> Result<Vec<Intent>, AppError> {
        let prompt = system_prompt(commands);
        let response = build_request(&self.client, &self.provider, &prompt, text, self.sampling)
            .send()
            .await
            .map_err(|e| AppError::Interpreter {
                message: format!("API request failed: {e}"),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Interpreter {
                message: format!("API error {status}: {body}"),
            });
        }

        let json: Value = response.json().await.map_err(|e| AppError::Interpreter {
            message: format!("Failed to parse response: {e}"),
        })?;
        let reply = response_text(self.provider.provider, &json)?;
        parse_candidates(&reply)
    }
}

impl TextInterpreter for LlmInterpreter {
    fn name(&self) -> &'static str {
        "llm"
    }

    fn interpret<'a>(
        &'a self,
        text: &'a str,
        commands: &'a [CommandDef],
    ) -> BoxFuture<'a, Result<Vec<Intent>, AppError>> {
        Box::pin(self.complete(text, commands))
    }
}
