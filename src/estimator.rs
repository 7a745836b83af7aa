//! Token cost estimation for admission decisions.
//!
//! Chat-completion counting follows the OpenAI cookbooks:
//! - https://github.com/openai/openai-cookbook/blob/main/examples/How_to_count_tokens_with_tiktoken.ipynb
//! - https://github.com/openai/openai-cookbook/blob/main/examples/api_request_parallel_processor.py
//!
//! The remaining request kinds return a conservative fixed placeholder until
//! real per-kind tokenizers replace them behind [`TokenCost`].

use serde::Deserialize;
use thiserror::Error;
use tiktoken_rs::{CoreBPE, tokenizer};
use tracing::{debug, warn};

/// Assumed "most recent" pinned versions for unpinned model names. Affects
/// overhead constants and encoder selection only, never scheduler lookup.
const GPT_3_5_DEFAULT: &str = "gpt-3.5-turbo-0613";
const GPT_4_DEFAULT: &str = "gpt-4-0613";

/// Response allowance when the request does not set `max_tokens`.
const DEFAULT_MAX_TOKENS: i64 = 15;

/// Flat estimate for kinds without real counting yet.
const PLACEHOLDER_TOKENS: u32 = 1000;

#[derive(Debug, Error)]
pub enum EstimatorError {
    #[error("no encoding for model: {model}")]
    UnknownEncoding { model: String },
    #[error("unexpected model for chat completions: {model}")]
    UnknownModel { model: String },
}

/// Per-request-kind token cost. The dispatcher charges the returned value
/// against the model's token budget before forwarding.
pub trait TokenCost {
    fn required_tokens(&self) -> Result<u32, EstimatorError>;
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: i64,
    #[serde(default)]
    pub n: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct EmbeddingRequest {
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct EditsRequest {
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AudioRequest {
    #[serde(default)]
    pub model: String,
}

impl TokenCost for ChatCompletionRequest {
    fn required_tokens(&self) -> Result<u32, EstimatorError> {
        let bpe = encoder_for_model(&self.model)?;

        let model = match self.model.as_str() {
            "gpt-3.5-turbo" => {
                debug!(assumed = GPT_3_5_DEFAULT, "gpt-3.5-turbo may update over time");
                GPT_3_5_DEFAULT
            }
            "gpt-4" => {
                debug!(assumed = GPT_4_DEFAULT, "gpt-4 may update over time");
                GPT_4_DEFAULT
            }
            other => other,
        };

        // Every reply is primed with <|start|>assistant<|message|>.
        const TOKENS_PER_REQUEST: i64 = 3;

        let (tokens_per_message, tokens_per_name): (i64, i64) = match model {
            // Every message follows <|start|>{role/name}\n{content}<|end|>\n;
            // if there's a name, the role is omitted.
            "gpt-3.5-turbo-0301" => (4, -1),
            "gpt-3.5-turbo-0613"
            | "gpt-3.5-turbo-16k-0613"
            | "gpt-4-0314"
            | "gpt-4-32k-0314"
            | "gpt-4-0613"
            | "gpt-4-32k-0613" => (3, 1),
            other if other.contains("gpt-3.5-turbo") || other.contains("gpt-4") => {
                warn!(model = other, "unexpected version, tokens based on historical assumptions");
                (3, 1)
            }
            other => {
                return Err(EstimatorError::UnknownModel {
                    model: other.to_string(),
                });
            }
        };

        let mut num_tokens: i64 = 0;
        for message in &self.messages {
            num_tokens += tokens_per_message;
            num_tokens += encoded_len(bpe, &message.content);
            num_tokens += encoded_len(bpe, &message.role);
            num_tokens += encoded_len(bpe, &message.name);
            if !message.name.is_empty() {
                num_tokens += tokens_per_name;
            }
        }
        num_tokens += TOKENS_PER_REQUEST;

        // Response tokens: n * max_tokens.
        let n = self.n.max(1);
        let max_tokens = if self.max_tokens < 1 {
            DEFAULT_MAX_TOKENS
        } else {
            self.max_tokens
        };
        num_tokens = num_tokens.saturating_add(n.saturating_mul(max_tokens));

        Ok(clamp_i64_to_u32(num_tokens.max(0)))
    }
}

impl TokenCost for CompletionRequest {
    fn required_tokens(&self) -> Result<u32, EstimatorError> {
        Ok(PLACEHOLDER_TOKENS)
    }
}

impl TokenCost for EmbeddingRequest {
    fn required_tokens(&self) -> Result<u32, EstimatorError> {
        Ok(PLACEHOLDER_TOKENS)
    }
}

impl TokenCost for EditsRequest {
    fn required_tokens(&self) -> Result<u32, EstimatorError> {
        Ok(PLACEHOLDER_TOKENS)
    }
}

impl TokenCost for AudioRequest {
    fn required_tokens(&self) -> Result<u32, EstimatorError> {
        Ok(PLACEHOLDER_TOKENS)
    }
}

fn encoder_for_model(model: &str) -> Result<&'static CoreBPE, EstimatorError> {
    let tokenizer =
        tokenizer::get_tokenizer(model).ok_or_else(|| EstimatorError::UnknownEncoding {
            model: model.to_string(),
        })?;
    Ok(match tokenizer {
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    })
}

fn encoded_len(bpe: &CoreBPE, text: &str) -> i64 {
    clamp_usize_to_i64(bpe.encode_with_special_tokens(text).len())
}

fn clamp_usize_to_i64(value: usize) -> i64 {
    if value > usize::try_from(i64::MAX).unwrap_or(usize::MAX) {
        i64::MAX
    } else {
        value as i64
    }
}

fn clamp_i64_to_u32(value: i64) -> u32 {
    if value > i64::from(u32::MAX) {
        u32::MAX
    } else {
        value as u32
    }
}
