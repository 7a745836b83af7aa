//! OpenAI-family dispatcher: body parsing, scheduler hand-off, forwarding.

use axum::body::to_bytes;
use axum::http::{Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RouteConfig;
use crate::error::ProxyError;
use crate::estimator::{
    AudioRequest, ChatCompletionRequest, CompletionRequest, EditsRequest, EmbeddingRequest,
    TokenCost,
};
use crate::providers::{ForwardError, ProviderDispatcher, Upstream, plain_error};
use crate::scheduler::{self, SchedulerMap, SubmitError, Verdict};

/// Bodies are buffered so the model field can be parsed before the bytes are
/// replayed upstream.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub struct OpenAi {
    upstream: Upstream,
    schedulers: SchedulerMap,
}

impl OpenAi {
    pub fn new(config: &RouteConfig, client: reqwest::Client) -> Result<Self, ProxyError> {
        if config.provider != "openai" {
            return Err(ProxyError::Config(format!(
                "initializing OpenAI provider with config for '{}'",
                config.provider
            )));
        }
        Ok(Self {
            upstream: Upstream::new(&config.forward, client)?,
            schedulers: scheduler::init_schedulers(&config.provider, &config.models)?,
        })
    }
}

/// How a parsed request enters (or bypasses) admission control.
///
/// OpenAI rate limits by model, and `model` is mostly a body parameter of the
/// same name. Exceptions:
/// - `/v1/images/*` has no model parameter; the implied model is DALL-E 2 and
///   image traffic is not rate limited here.
/// - `/v1/files` and `/v1/fine-tunes` carry no (or differently-used) model.
/// - `/v1/moderations` has a model parameter but no rate limit.
enum Admission {
    Bypass,
    Scheduled {
        model: String,
        request: Box<dyn TokenCost + Send + Sync>,
    },
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Admission::Bypass => f.write_str("Bypass"),
            Admission::Scheduled { model, .. } => {
                f.debug_struct("Scheduled").field("model", model).finish()
            }
        }
    }
}

#[derive(Debug, Error)]
enum ParseError {
    #[error("error reading request body: {0}")]
    Read(axum::Error),
    #[error("error reading request body, {path}: {reason}")]
    Decode { path: String, reason: String },
}

fn decode<T: DeserializeOwned>(path: &str, body: &Bytes) -> Result<T, ParseError> {
    serde_json::from_slice(body).map_err(|err| ParseError::Decode {
        path: path.to_string(),
        reason: json_reason(&err),
    })
}

/// Stable wording for truncated bodies; clients match on it.
fn json_reason(err: &serde_json::Error) -> String {
    if err.is_eof() {
        "unexpected end of JSON input".to_string()
    } else {
        err.to_string()
    }
}

/// Identifies the request kind by path and parses the body into it. Only POST
/// bodies reach this point.
fn parse_request(path: &str, body: &Bytes) -> Result<Admission, ParseError> {
    if path.contains("/v1/files")
        || path.contains("/v1/fine-tunes")
        || path.contains("/v1/moderations")
        || path.contains("/v1/images")
    {
        return Ok(Admission::Bypass);
    }

    if path.contains("/v1/audio") {
        let request: AudioRequest = decode(path, body)?;
        return Ok(Admission::Scheduled {
            model: request.model.clone(),
            request: Box::new(request),
        });
    }

    if path.ends_with("/v1/chat/completions") {
        let request: ChatCompletionRequest = decode(path, body)?;
        return Ok(Admission::Scheduled {
            model: request.model.clone(),
            request: Box::new(request),
        });
    }

    if path.ends_with("/v1/completions") {
        let request: CompletionRequest = decode(path, body)?;
        return Ok(Admission::Scheduled {
            model: request.model.clone(),
            request: Box::new(request),
        });
    }

    if path.ends_with("/v1/embeddings") {
        let request: EmbeddingRequest = decode(path, body)?;
        return Ok(Admission::Scheduled {
            model: request.model.clone(),
            request: Box::new(request),
        });
    }

    if path.ends_with("/v1/edits") {
        warn!(path, "deprecated OpenAI endpoint");
        let request: EditsRequest = decode(path, body)?;
        return Ok(Admission::Scheduled {
            model: request.model.clone().unwrap_or_default(),
            request: Box::new(request),
        });
    }

    warn!(path, "unexpected OpenAI endpoint");
    Ok(Admission::Bypass)
}

#[async_trait::async_trait]
impl ProviderDispatcher for OpenAi {
    async fn dispatch(&self, req: axum::extract::Request) -> Response {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();

        let body = match to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let err = ParseError::Read(err);
                debug!(%path, reason = %err, "bad request");
                return plain_error(StatusCode::BAD_REQUEST, format!("LLProxy: {err}"));
            }
        };

        // Only POST requests have rate limits; everything else is relayed
        // untouched.
        let admission = if parts.method == Method::POST {
            match parse_request(&path, &body) {
                Ok(admission) => admission,
                Err(err) => {
                    debug!(%path, reason = %err, "bad request");
                    return plain_error(StatusCode::BAD_REQUEST, format!("LLProxy: {err}"));
                }
            }
        } else {
            Admission::Bypass
        };

        if let Admission::Scheduled { model, request } = admission {
            // An absent model means nothing to rate limit against; relay it.
            if !model.is_empty() {
                if let Some(response) = self.admit(&path, &model, request.as_ref()).await {
                    return response;
                }
            }
        }

        match self.upstream.forward(&parts, body).await {
            Ok(response) => response,
            Err(err @ ForwardError::InvalidPath { .. }) => {
                debug!(%path, reason = %err, "bad request");
                plain_error(StatusCode::BAD_REQUEST, format!("LLProxy: {err}"))
            }
            Err(err) => {
                info!(%path, reason = %err, "provider error");
                plain_error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("LLMProxy: Error forwarding request: {err}"),
                )
            }
        }
    }
}

impl OpenAi {
    /// Runs the admission protocol for one scheduled request. `None` means
    /// the caller owns capacity and must forward; `Some` is a terminal
    /// rejection response.
    async fn admit(&self, path: &str, model: &str, request: &(dyn TokenCost + Send + Sync)) -> Option<Response> {
        let Some(scheduler) = self.schedulers.get(model) else {
            debug!(path, model, reason = "NoSchedulerForModel", "rejecting request");
            return Some(plain_error(
                StatusCode::BAD_REQUEST,
                format!("LLMProxy: No scheduler found for model '{model}'"),
            ));
        };

        let tokens = match request.required_tokens() {
            Ok(tokens) => tokens,
            Err(err) => {
                debug!(path, model, reason = %err, "rejecting request");
                return Some(plain_error(
                    StatusCode::BAD_REQUEST,
                    "LLMProxy: could not extract tokens for request",
                ));
            }
        };

        // Duplicates a scheduler-side check so an impossible request never
        // occupies a queue slot.
        let config = scheduler.config();
        if config.rpm < 1.0 || config.tpm < f64::from(tokens) {
            debug!(path, model, tokens, reason = "RequestTooLarge", "rejecting request");
            return Some(plain_error(
                StatusCode::BAD_REQUEST,
                format!("LLProxy: Request too large for model '{model}'"),
            ));
        }

        let verdict = match scheduler.submit(tokens) {
            Ok(verdict) => verdict,
            Err(SubmitError::QueueFull) => {
                debug!(path, model, tokens, reason = "QueueFull", "rejecting request");
                return Some(plain_error(
                    StatusCode::TOO_MANY_REQUESTS,
                    format!("LLMProxy: RateLimit exceeded for model '{model}'"),
                ));
            }
        };

        match verdict.await {
            Ok(Verdict::Ready) => None,
            Ok(Verdict::RateLimit) => {
                debug!(path, model, tokens, reason = "RateLimit", "rejecting request");
                Some(plain_error(
                    StatusCode::TOO_MANY_REQUESTS,
                    format!("LLMProxy: RateLimit exceeded for model '{model}'"),
                ))
            }
            Ok(Verdict::RequestTooLarge) => {
                debug!(path, model, tokens, reason = "RequestTooLarge", "rejecting request");
                Some(plain_error(
                    StatusCode::BAD_REQUEST,
                    format!("LLProxy: Request too large for model '{model}'"),
                ))
            }
            // The admission loop vanished before answering; treat the
            // reservation as shed.
            Err(_) => Some(plain_error(
                StatusCode::TOO_MANY_REQUESTS,
                format!("LLMProxy: RateLimit exceeded for model '{model}'"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_reports_truncated_json() {
        let err = parse_request("/openai/v1/chat/completions", &Bytes::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "error reading request body, /openai/v1/chat/completions: unexpected end of JSON input"
        );
    }

    #[test]
    fn chat_completions_are_scheduled_under_their_model() {
        let body = Bytes::from_static(
            br#"{"model": "gpt-3.5-turbo", "messages": [{"role": "system", "content": "test"}]}"#,
        );
        match parse_request("/openai/v1/chat/completions", &body).expect("parse") {
            Admission::Scheduled { model, request } => {
                assert_eq!(model, "gpt-3.5-turbo");
                assert_eq!(request.required_tokens().expect("tokens"), 23);
            }
            Admission::Bypass => panic!("chat completions must be scheduled"),
        }
    }

    #[test]
    fn unrecognized_endpoints_bypass_the_scheduler() {
        let body = Bytes::from_static(b"not json");
        assert!(matches!(
            parse_request("/openai/badroute", &body),
            Ok(Admission::Bypass)
        ));
    }

    #[test]
    fn moderations_files_and_images_bypass_the_scheduler() {
        for path in [
            "/openai/v1/moderations",
            "/openai/v1/files",
            "/openai/v1/fine-tunes",
            "/openai/v1/images/generations",
        ] {
            assert!(matches!(
                parse_request(path, &Bytes::new()),
                Ok(Admission::Bypass)
            ));
        }
    }

    #[test]
    fn completions_path_is_not_mistaken_for_chat() {
        let body = Bytes::from_static(br#"{"model": "text-davinci-003"}"#);
        match parse_request("/openai/v1/completions", &body).expect("parse") {
            Admission::Scheduled { model, request } => {
                assert_eq!(model, "text-davinci-003");
                assert_eq!(request.required_tokens().expect("tokens"), 1000);
            }
            Admission::Bypass => panic!("completions must be scheduled"),
        }
    }
}
