use anyhow::{bail, Result};
use axum::http::header::LOCATION;
use axum::http::StatusCode;
use tracing::warn;

use super::{ActionResult, Actioner};
use crate::request::RequestContext;
use crate::rules::{Action, Rule};
use crate::templating;

pub struct RedirectAction;

#[async_trait::async_trait]
impl Actioner for RedirectAction {
    fn name(&self) -> &'static str {
        "redirect"
    }

    /// A location that fails to render yields an empty result rather than an error.
    async fn execute(&self, rule: &Rule, ctx: &RequestContext) -> Result<ActionResult> {
        let (template, status) = match &rule.action {
            Action::RedirectPermanent(t) => (t, StatusCode::MOVED_PERMANENTLY),
            Action::RedirectTemporary(t) => (t, StatusCode::FOUND),
            _ => bail!("rule '{}' has no redirect", rule.display_name()),
        };
        let location = match templating::render(template, ctx) {
            Ok(location) => location,
            Err(e) => {
                warn!("error rendering redirect location '{}': {:#}", template, e);
                return Ok(ActionResult::default());
            }
        };

        let mut result = ActionResult {
            success_http_status: Some(status.as_u16()),
            ..Default::default()
        };
        result.success_headers.insert(LOCATION.to_string(), location);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(action: Action) -> Rule {
        Rule {
            name: None,
            on: Default::default(),
            action,
            args: Default::default(),
            with: None,
            respond: Default::default(),
            post_action: None,
        }
    }

    fn ctx() -> RequestContext {
        let mut ctx = RequestContext::default();
        ctx.input
            .path_variables
            .insert("redir".to_string(), "https://example.com".to_string());
        ctx
    }

    #[tokio::test]
    async fn test_temporary_and_permanent() {
        let temporary = RedirectAction
            .execute(&rule(Action::RedirectTemporary("{{ .Input.URLPlaceholders.redir }}".into())), &ctx())
            .await
            .unwrap();
        assert_eq!(temporary.success_http_status, Some(302));
        assert_eq!(
            temporary.success_headers.get("location").map(String::as_str),
            Some("https://example.com")
        );

        let permanent = RedirectAction
            .execute(&rule(Action::RedirectPermanent("/elsewhere".into())), &ctx())
            .await
            .unwrap();
        assert_eq!(permanent.success_http_status, Some(301));
    }

    #[tokio::test]
    async fn test_render_failure_gives_empty_result() {
        let result = RedirectAction
            .execute(&rule(Action::RedirectTemporary("{{ broken ".into())), &ctx())
            .await
            .unwrap();
        assert_eq!(result, ActionResult::default());
    }
}
