mod openai;

pub use openai::OpenAi;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{self, HeaderValue};
use axum::http::{HeaderMap, StatusCode, request};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;

use crate::error::ProxyError;

/// One dispatcher per configured route. Translates inbound HTTP into
/// scheduler reservations and relays admitted requests upstream.
#[async_trait]
pub trait ProviderDispatcher: Send + Sync {
    async fn dispatch(&self, req: axum::extract::Request) -> Response;
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid request path '{path}'")]
    InvalidPath { path: String },
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
}

/// Upstream half of the proxy, shared by all providers: rewrites the URL,
/// relays headers and body, and streams the response back.
#[derive(Clone)]
pub struct Upstream {
    base: reqwest::Url,
    client: reqwest::Client,
}

impl Upstream {
    pub fn new(base_url: &str, client: reqwest::Client) -> Result<Self, ProxyError> {
        let base = reqwest::Url::parse(base_url).map_err(|err| {
            ProxyError::Config(format!("bad provider base url '{base_url}': {err}"))
        })?;
        Ok(Self { base, client })
    }

    /// Forwards the request to `base` with the first path segment stripped,
    /// preserving method, query, headers, and body. The upstream status and
    /// headers are copied back verbatim and the body is streamed.
    pub async fn forward(
        &self,
        parts: &request::Parts,
        body: Bytes,
    ) -> Result<Response, ForwardError> {
        let path = parts.uri.path();
        let stripped = strip_route_segment(path).ok_or_else(|| ForwardError::InvalidPath {
            path: path.to_string(),
        })?;

        let mut url = self.base.clone();
        url.set_path(&stripped);
        url.set_query(parts.uri.query());

        let mut headers = parts.headers.clone();
        // Transport-owned fields; the client recomputes both.
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let upstream = self
            .client
            .request(parts.method.clone(), url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream.headers() {
            // The relay re-frames the body itself.
            if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
                continue;
            }
            response_headers.append(name, value.clone());
        }

        let stream = upstream
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

/// `/<route>/v1/foo` becomes `/v1/foo`: exactly the original minus its first
/// segment. A path without a route segment is not forwardable.
fn strip_route_segment(path: &str) -> Option<String> {
    let rest = path.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }
    let remainder = match rest.split_once('/') {
        Some((_route, remainder)) => remainder,
        None => "",
    };
    Some(format!("/{remainder}"))
}

/// Newline-terminated plain text, the wire format clients parse errors from.
pub(crate) fn plain_error(status: StatusCode, message: impl AsRef<str>) -> Response {
    let mut response = Response::new(Body::from(format!("{}\n", message.as_ref())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response.headers_mut().insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_exactly_the_first_segment() {
        assert_eq!(
            strip_route_segment("/openai/v1/chat/completions").as_deref(),
            Some("/v1/chat/completions")
        );
        assert_eq!(strip_route_segment("/openai/").as_deref(), Some("/"));
        assert_eq!(strip_route_segment("/openai").as_deref(), Some("/"));
        assert_eq!(strip_route_segment("/"), None);
        assert_eq!(strip_route_segment(""), None);
    }
}
