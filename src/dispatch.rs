//! The per-rule request pipeline: guard, extract, execute, render.

use anyhow::anyhow;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

use crate::actions::ActionRegistry;
use crate::error::DispatchError;
use crate::post_action::ResultStore;
use crate::rules::Rule;
use crate::{guard, request, response};

/// State shared by every route.
pub struct Shared {
    pub actions: ActionRegistry,
    pub results: ResultStore,
    pub expose_errors: bool,
}

/// A rule together with the shared state, cloned into each route.
#[derive(Clone)]
pub struct RuleRoute {
    pub rule: Arc<Rule>,
    pub shared: Arc<Shared>,
}

pub async fn dispatch(State(route): State<RuleRoute>, req: Request) -> Response {
    let span = info_span!("rule", rule = %route.rule.display_name(), path = %req.uri().path());
    async move {
        match handle(&route, req).await {
            Ok(response) => response,
            Err(e) => e.into_http(route.shared.expose_errors),
        }
    }
    .instrument(span)
    .await
}

async fn handle(route: &RuleRoute, req: Request) -> Result<Response, DispatchError> {
    let rule = &route.rule;
    let limit = rule.max_request_body()?;
    guard::check(rule.with.as_ref(), limit, req.headers())?;

    let ctx = request::extract(req, &rule.args, limit).await?;

    let kind = rule.action.kind();
    let actioner = route
        .shared
        .actions
        .resolve(&rule.action)
        .ok_or_else(|| anyhow!("no handler for action '{}'", kind))?;
    let result = actioner.execute(rule, &ctx).await?;
    if !result.succeeded() {
        info!(action = actioner.name(), code = result.code, "action failed");
    }

    let response = response::render(&result, &rule.respond, &ctx)?;

    if let Some(post) = rule.post_action.clone() {
        let shared = route.shared.clone();
        tokio::spawn(
            async move {
                shared.results.run(&post, &shared.actions, &ctx).await;
            }
            .in_current_span(),
        );
    }
    Ok(response)
}

/// Applies the access guard in front of routes not handled by [`dispatch`].
pub async fn guard_layer(State(route): State<RuleRoute>, req: Request, next: Next) -> Response {
    let checked = route
        .rule
        .max_request_body()
        .map_err(DispatchError::from)
        .and_then(|limit| guard::check(route.rule.with.as_ref(), limit, req.headers()));
    match checked {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_http(route.shared.expose_errors),
    }
}
