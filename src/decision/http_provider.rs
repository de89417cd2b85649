//! OpenAI-compatible chat-completions decision provider
//!
//! The context goes out as a JSON user message. The reply is expected to be
//! free-form reasoning followed by a JSON array of decisions.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ProviderSettings;
use crate::domain::{Action, ActionKind};
use crate::error::{Result, TraderError};

use super::{DecisionContext, DecisionOutput, DecisionProvider};

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a disciplined crypto futures trader.
You receive the account, open positions, market data, candidate instruments,
recent performance and risk limits as JSON.

First write a short analysis as plain text. Then output one JSON array of
decisions, for example:
[
  {"symbol": "BTCUSDT", "action": "open_short", "leverage": 5, "position_size_usd": 500,
   "stop_loss": 97000, "take_profit": 91000, "confidence": 80, "reasoning": "trend down"},
  {"symbol": "ETHUSDT", "action": "close_long", "reasoning": "take profit"}
]

action is one of: open_long, open_short, close_long, close_short, hold, wait.
Opens must set leverage, position_size_usd, stop_loss and take_profit and stay
within the leverage caps, notional caps (multiples of account equity) and max
open positions in "limits"."#;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// One decision as models write it
#[derive(Debug, Deserialize)]
struct RawDecision {
    #[serde(alias = "instrument")]
    symbol: String,
    #[serde(alias = "kind")]
    action: String,
    #[serde(default)]
    leverage: Option<u32>,
    #[serde(default, alias = "size_usd")]
    position_size_usd: Option<Decimal>,
    #[serde(default)]
    stop_loss: Option<Decimal>,
    #[serde(default)]
    take_profit: Option<Decimal>,
    #[serde(default)]
    confidence: Option<u8>,
    #[serde(default, alias = "rationale")]
    reasoning: String,
}

impl RawDecision {
    fn into_action(self) -> Result<Action> {
        let kind: ActionKind = self
            .action
            .parse()
            .map_err(|e: String| TraderError::InvalidDecision(format!("{}: {}", self.symbol, e)))?;
        if self.symbol.trim().is_empty() {
            return Err(TraderError::InvalidDecision(
                "decision without symbol".to_string(),
            ));
        }

        let positive = |v: Option<Decimal>| v.filter(|p| *p > Decimal::ZERO);
        Ok(Action {
            instrument: self.symbol.trim().to_ascii_uppercase(),
            kind,
            size_usd: self.position_size_usd.unwrap_or(Decimal::ZERO),
            leverage: self.leverage.unwrap_or(0),
            stop_loss: positive(self.stop_loss),
            take_profit: positive(self.take_profit),
            confidence: self.confidence.map(|c| c.min(100)),
            rationale: self.reasoning,
        })
    }
}

/// Byte range of the first balanced JSON array, ignoring brackets in strings
fn find_json_array(text: &str) -> Option<(usize, usize)> {
    let start = text.find('[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, start + offset + 1));
                }
            }
            _ => {}
        }
    }
    None
}

/// Split a model reply into reasoning and validated actions.
pub fn parse_decision_reply(reply: &str) -> Result<DecisionOutput> {
    // Typographic quotes break JSON parsing.
    let reply = reply
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    let (start, end) = find_json_array(&reply).ok_or_else(|| {
        TraderError::InvalidDecision("no JSON decision array in reply".to_string())
    })?;

    let raw: Vec<RawDecision> = serde_json::from_str(&reply[start..end])
        .map_err(|e| TraderError::InvalidDecision(format!("decision array: {}", e)))?;

    let actions = raw
        .into_iter()
        .map(RawDecision::into_action)
        .collect::<Result<Vec<_>>>()?;

    let reasoning = reply[..start]
        .trim()
        .trim_end_matches("```json")
        .trim()
        .to_string();

    Ok(DecisionOutput { reasoning, actions })
}

/// Decision provider backed by a chat-completions endpoint
pub struct HttpDecisionProvider {
    http: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    system_prompt: String,
}

impl HttpDecisionProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .map_err(|e| TraderError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: format!(
                "{}/chat/completions",
                settings.base_url.trim_end_matches('/')
            ),
            model: settings.model.clone(),
            api_key: settings
                .api_key
                .as_ref()
                .filter(|k| !k.is_empty())
                .map(|k| k.expose().to_string()),
            system_prompt: settings
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        })
    }

    async fn chat(&self, user: String) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: self.system_prompt.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user,
                },
            ],
            temperature: 0.5,
        };

        let mut builder = self.http.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "decision provider error: {}", body);
            return Err(TraderError::TransientNetwork(format!(
                "decision provider http {}: {}",
                status, body
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| TraderError::InvalidDecision(format!("chat response: {}", e)))?;

        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| TraderError::InvalidDecision("chat response had no choices".to_string()))
    }
}

#[async_trait]
impl DecisionProvider for HttpDecisionProvider {
    async fn decide(&self, context: &DecisionContext) -> Result<DecisionOutput> {
        let user = serde_json::to_string_pretty(context)?;
        debug!(agent = %context.agent_id, cycle = context.cycle, model = %self.model, "requesting decision");
        let reply = self.chat(user).await?;
        let output = parse_decision_reply(&reply)?;
        debug!(
            agent = %context.agent_id,
            cycle = context.cycle,
            actions = output.actions.len(),
            "decision received"
        );
        Ok(output)
    }
}
