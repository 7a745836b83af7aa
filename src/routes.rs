//! Static route table: first path segment to provider dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use tracing::info;

use crate::config::Config;
use crate::error::ProxyError;
use crate::providers::{OpenAi, ProviderDispatcher};

/// Built once at startup, read-only afterwards.
pub struct RouteTable {
    routes: HashMap<String, Arc<dyn ProviderDispatcher>>,
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RouteTable {
    pub fn build(config: &Config, client: reqwest::Client) -> Result<Self, ProxyError> {
        let mut routes: HashMap<String, Arc<dyn ProviderDispatcher>> = HashMap::new();
        for (route, route_config) in &config.routes {
            info!(provider = %route_config.provider, route = %route, "initializing provider");
            let dispatcher: Arc<dyn ProviderDispatcher> = match route_config.provider.as_str() {
                "openai" => Arc::new(OpenAi::new(route_config, client.clone())?),
                other => {
                    return Err(ProxyError::Config(format!(
                        "unexpected provider: '{other}', currently supported providers: [openai]"
                    )));
                }
            };
            // Route keys are path segments; tolerate configs written with
            // surrounding slashes.
            let segment = route.trim_matches('/').to_string();
            info!(route = %segment, "creating route");
            routes.insert(segment, dispatcher);
        }
        Ok(Self { routes })
    }

    pub fn get(&self, route: &str) -> Option<&Arc<dyn ProviderDispatcher>> {
        self.routes.get(route)
    }
}

/// Main proxy router: every path under a configured `/<route>` lands on that
/// route's dispatcher, with or without a trailing sub-path.
pub fn router(table: RouteTable) -> Router {
    Router::new()
        .route("/:route", any(dispatch_route))
        .route("/:route/*rest", any(dispatch_route))
        .with_state(Arc::new(table))
}

async fn dispatch_route(State(table): State<Arc<RouteTable>>, req: Request) -> Response {
    let route = req
        .uri()
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("")
        .to_string();
    match table.get(&route) {
        Some(dispatcher) => dispatcher.dispatch(req).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, RouteConfig};

    fn route_config(provider: &str) -> RouteConfig {
        let mut models = HashMap::new();
        models.insert(
            "gpt-3.5-turbo".to_string(),
            ModelConfig {
                max_queue_size: 10,
                max_queue_wait: 1.0,
                rpm: 60.0,
                tpm: 60000.0,
                cpm: 0.0,
            },
        );
        RouteConfig {
            forward: "https://fake-testing-host.com".to_string(),
            provider: provider.to_string(),
            models,
        }
    }

    #[tokio::test]
    async fn builds_table_and_normalizes_route_keys() {
        let mut config = Config::default();
        config
            .routes
            .insert("/openai/".to_string(), route_config("openai"));

        let table = RouteTable::build(&config, reqwest::Client::new()).expect("build");
        assert!(table.get("openai").is_some());
        assert!(table.get("other").is_none());
    }

    #[tokio::test]
    async fn unknown_provider_family_fails_startup() {
        let mut config = Config::default();
        config
            .routes
            .insert("mystery".to_string(), route_config("mystery-ai"));

        let err = RouteTable::build(&config, reqwest::Client::new()).unwrap_err();
        assert!(err.to_string().contains("unexpected provider"));
    }

    #[tokio::test]
    async fn scheduler_rates_at_or_below_one_fail_startup() {
        let mut config = Config::default();
        let mut route = route_config("openai");
        route
            .models
            .get_mut("gpt-3.5-turbo")
            .expect("model")
            .rpm = 1.0;
        config.routes.insert("openai".to_string(), route);

        assert!(RouteTable::build(&config, reqwest::Client::new()).is_err());
    }
}
