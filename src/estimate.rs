//! Pre-admission token estimates for common inference payloads.
//!
//! No tokenizer is bundled; text is costed at roughly four characters per
//! token, which is close enough for budgeting against a per-minute quota.
//! The structure of the estimate follows how completion endpoints bill:
//! prompt tokens plus `n * max_tokens` reserved for the reply.

use serde_json::Value;

use crate::error::{Error, Result};

const CHARS_PER_TOKEN: u64 = 4;
/// Reply budget assumed when a completion payload has no `max_tokens`.
pub const DEFAULT_MAX_TOKENS: u64 = 15;
/// Per-message framing overhead in chat payloads.
const MESSAGE_OVERHEAD: u64 = 4;
/// Every chat reply is primed with an assistant header.
const REPLY_PRIMING: u64 = 2;

/// Estimated tokens for a piece of text.
pub fn text_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(CHARS_PER_TOKEN)
}

fn value_tokens(value: &Value) -> u64 {
    match value {
        Value::String(s) => text_tokens(s),
        Value::Null => 0,
        other => text_tokens(&other.to_string()),
    }
}

/// Estimate the cost of `payload` sent to `endpoint` (e.g.
/// `"chat/completions"`, `"completions"`, `"embeddings"`).
///
/// # Errors
///
/// Fails for unknown endpoints and for payloads missing the field the
/// endpoint reads (`messages`, `prompt` or `input`). Oversized `n` or
/// `max_tokens` saturate at `u64::MAX`, which the queue then rejects as
/// exceeding the quota.
pub fn estimate_tokens(endpoint: &str, payload: &Value) -> Result<u64> {
    if endpoint.ends_with("completions") {
        let max_tokens = payload
            .get("max_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_TOKENS);
        let n = payload.get("n").and_then(Value::as_u64).unwrap_or(1);
        let completion_tokens = n.saturating_mul(max_tokens);

        if endpoint.starts_with("chat/") {
            let messages = payload
                .get("messages")
                .and_then(Value::as_array)
                .ok_or_else(|| Error::Other("chat payload has no messages array".to_string()))?;
            let mut tokens: u64 = 0;
            for message in messages {
                tokens = tokens.saturating_add(MESSAGE_OVERHEAD);
                if let Some(fields) = message.as_object() {
                    for (key, value) in fields {
                        tokens = tokens.saturating_add(value_tokens(value));
                        // A name replaces the role token.
                        if key == "name" {
                            tokens = tokens.saturating_sub(1);
                        }
                    }
                }
            }
            return Ok(tokens
                .saturating_add(REPLY_PRIMING)
                .saturating_add(completion_tokens));
        }

        return match payload.get("prompt") {
            Some(Value::String(prompt)) => {
                Ok(text_tokens(prompt).saturating_add(completion_tokens))
            }
            Some(Value::Array(prompts)) => {
                let prompt_tokens = prompts
                    .iter()
                    .map(value_tokens)
                    .fold(0u64, u64::saturating_add);
                let reply_tokens = completion_tokens.saturating_mul(prompts.len() as u64);
                Ok(prompt_tokens.saturating_add(reply_tokens))
            }
            _ => Err(Error::Other(
                "completion payload needs a string or list prompt".to_string(),
            )),
        };
    }

    if endpoint == "embeddings" {
        return match payload.get("input") {
            Some(Value::String(input)) => Ok(text_tokens(input)),
            Some(Value::Array(inputs)) => {
                Ok(inputs.iter().map(value_tokens).fold(0, u64::saturating_add))
            }
            _ => Err(Error::Other(
                "embedding payload needs a string or list input".to_string(),
            )),
        };
    }

    Err(Error::Other(format!(
        "no token estimate for endpoint {endpoint}"
    )))
}
