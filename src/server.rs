use anyhow::{anyhow, Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::handler::Handler;
use axum::http::{Method, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::routing::{any_service, MethodFilter, MethodRouter};
use axum::Router;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::services::ServeDir;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, instrument, Level};

use crate::actions::ActionRegistry;
use crate::config::Config;
use crate::dispatch::{dispatch, guard_layer, RuleRoute, Shared};
use crate::post_action::ResultStore;
use crate::rules::{Action, Rule};

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
}

/// `/users/{id}` -> `/users/:id`
pub fn route_path(path: &str) -> String {
    PLACEHOLDER.replace_all(path, ":$1").into_owned()
}

fn method_filter(methods: &[Method]) -> Result<Option<MethodFilter>> {
    let mut filter: Option<MethodFilter> = None;
    for method in methods {
        let f = MethodFilter::try_from(method.clone()).map_err(|e| anyhow!("unsupported method {}: {}", method, e))?;
        filter = Some(match filter {
            Some(prev) => prev.or(f),
            None => f,
        });
    }
    Ok(filter)
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found\n")
}

/// Builds the application router, one route per rule.
pub fn build_router(rules: Vec<Rule>, shared: Arc<Shared>) -> Result<Router> {
    let mut app = Router::new();
    let mut by_path: BTreeMap<String, MethodRouter> = BTreeMap::new();
    let mut root_directory = false;

    for rule in rules {
        let path = rule.on.path.clone();
        let limit = usize::try_from(rule.max_request_body()?).unwrap_or(usize::MAX);
        let methods = rule.methods()?;
        let name = rule.display_name().to_string();
        let route = RuleRoute {
            rule: Arc::new(rule),
            shared: shared.clone(),
        };

        if let Action::ServeDirectory(dir) = &route.rule.action {
            info!(rule = %name, "serving directory {} on {}", dir.display(), path);
            let service = ServiceBuilder::new()
                .layer(from_fn_with_state(route.clone(), guard_layer))
                .service(ServeDir::new(dir));
            if path == "/" {
                app = app.fallback_service(service);
                root_directory = true;
            } else {
                app = app.nest_service(path.trim_end_matches('/'), service);
            }
            continue;
        }

        let service = ServiceBuilder::new()
            .layer(DefaultBodyLimit::max(limit))
            .service(dispatch.with_state(route));
        let key = route_path(&path);
        let router = by_path.remove(&key).unwrap_or_else(MethodRouter::new);
        let router = match method_filter(&methods)? {
            Some(filter) => router.on_service(filter, service),
            None => any_service(service),
        };
        info!(rule = %name, ?methods, "registered {}", key);
        by_path.insert(key, router);
    }

    for (path, router) in by_path {
        app = app.route(&path, router);
    }
    if !root_directory {
        app = app.fallback(not_found);
    }
    Ok(app)
}

/// Shared state for the routes, built from the configuration.
pub fn shared_state(config: &Config, actions: ActionRegistry) -> Result<Arc<Shared>> {
    Ok(Arc::new(Shared {
        actions,
        results: ResultStore::new(config.server.data_dir.clone(), config.data_retention()?),
        expose_errors: config.server.expose_errors,
    }))
}

/// Binds the listener and serves until ctrl+c.
#[instrument(name = "server", skip_all)]
pub async fn serve(config: Config, rules: Vec<Rule>) -> Result<()> {
    let shared = shared_state(&config, ActionRegistry::new(config.smtp.clone()))?;
    let mut app = build_router(rules, shared)?;
    if config.server.access_log {
        app = app.layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );
    }

    let listener = TcpListener::bind(&config.server.address)
        .await
        .with_context(|| format!("error binding {}", config.server.address))?;
    info!("listening on http://{}", config.server.address);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("ctrl+c received");
    }
}
