//! Turns an [`ActionResult`] and the rule's `respond` block into the HTTP response.

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use std::collections::HashMap;

use crate::actions::ActionResult;
use crate::request::RequestContext;
use crate::rules::Respond;
use crate::templating;

pub const DEFAULT_ON_SUCCESS_TEMPLATE: &str = "{{ Action.SuccessBody }}";
pub const DEFAULT_ON_ERROR_TEMPLATE: &str = "{{ Action.ErrorBody }}";

pub const SECURITY_HEADERS: [(&str, &str); 4] = [
    (
        "Content-Security-Policy",
        "default-src 'self'; style-src 'self' 'unsafe-inline'",
    ),
    ("Strict-Transport-Security", "max-age=63072000; includeSubDomains"),
    ("X-Frame-Options", "DENY"),
    ("X-Content-Type-Options", "nosniff"),
];

/// Merges header layers, highest precedence first. Names compare case-insensitively
/// and the first layer to set a name wins.
pub fn merge_headers<'a, I>(layers: I) -> Result<HeaderMap>
where
    I: IntoIterator<Item = Vec<(&'a str, &'a str)>>,
{
    let mut merged = HeaderMap::new();
    for layer in layers {
        for (name, value) in layer {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name '{}'", name))?;
            if merged.contains_key(&name) {
                continue;
            }
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header '{}'", name))?;
            merged.insert(name, value);
        }
    }
    Ok(merged)
}

fn pairs(map: &HashMap<String, String>) -> Vec<(&str, &str)> {
    map.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
}

fn default_content_type(body: &str) -> &'static str {
    let head: String = body.trim_start().chars().take(15).collect::<String>().to_ascii_lowercase();
    if head.starts_with("<!doctype html") || head.starts_with("<html") {
        "text/html; charset=utf-8"
    } else {
        "text/plain; charset=utf-8"
    }
}

/// Renders the final response. Errors here are internal errors.
pub fn render(result: &ActionResult, respond: &Respond, ctx: &RequestContext) -> Result<Response> {
    let succeeded = result.succeeded();
    let spec = respond.branch(succeeded);
    let (default_template, engine_status, default_status, engine_headers) = if succeeded {
        (
            DEFAULT_ON_SUCCESS_TEMPLATE,
            result.success_http_status,
            StatusCode::OK,
            &result.success_headers,
        )
    } else {
        (
            DEFAULT_ON_ERROR_TEMPLATE,
            result.error_http_status,
            StatusCode::BAD_REQUEST,
            &result.error_headers,
        )
    };

    let status = match spec.status().or(engine_status.filter(|s| *s != 0)) {
        Some(code) => StatusCode::from_u16(code).with_context(|| format!("invalid http status {}", code))?,
        None => default_status,
    };
    let body = templating::render_with_action(spec.body().unwrap_or(default_template), ctx, result)
        .context("error rendering response body")?;
    let rule_headers = templating::render_map(&spec.headers, ctx).context("error rendering response headers")?;

    let content_type = [(CONTENT_TYPE.as_str(), default_content_type(&body))];
    let headers = merge_headers([
        pairs(&rule_headers),
        pairs(engine_headers),
        SECURITY_HEADERS.to_vec(),
        content_type.to_vec(),
    ])?;

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ResponseSpec;
    use axum::body::to_bytes;

    async fn body_of(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn respond(success: ResponseSpec, error: ResponseSpec) -> Respond {
        Respond {
            on_success: success,
            on_error: error,
        }
    }

    #[tokio::test]
    async fn test_defaults() {
        let ok = render(&ActionResult::success("fine\n"), &Respond::default(), &RequestContext::default()).unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.headers()["x-frame-options"], "DENY");
        assert_eq!(ok.headers()["content-type"], "text/plain; charset=utf-8");
        assert_eq!(body_of(ok).await, "fine\n");

        let failed = ActionResult {
            success_body: "ignored".to_string(),
            code: 3,
            ..Default::default()
        };
        let err = render(&failed, &Respond::default(), &RequestContext::default()).unwrap();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_of(err).await, "");
    }

    #[tokio::test]
    async fn test_status_precedence() {
        let mut result = ActionResult::success("body");
        result.success_http_status = Some(302);
        let ctx = RequestContext::default();

        let engine = render(&result, &Respond::default(), &ctx).unwrap();
        assert_eq!(engine.status(), StatusCode::FOUND);

        let rule = respond(
            ResponseSpec {
                http_status: Some(201),
                ..Default::default()
            },
            ResponseSpec::default(),
        );
        let overridden = render(&result, &rule, &ctx).unwrap();
        assert_eq!(overridden.status(), StatusCode::CREATED);
        assert_eq!(body_of(overridden).await, "body");

        let zero = respond(
            ResponseSpec {
                http_status: Some(0),
                ..Default::default()
            },
            ResponseSpec::default(),
        );
        assert_eq!(render(&result, &zero, &ctx).unwrap().status(), StatusCode::FOUND);
    }

    #[tokio::test]
    async fn test_body_templates() {
        let mut ctx = RequestContext::default();
        ctx.meta.method = "POST".to_string();
        let rule = respond(
            ResponseSpec {
                body_template: Some("{{ .Meta.Method }}: {{ .Action.SuccessBody }}".to_string()),
                ..Default::default()
            },
            ResponseSpec {
                body_template: Some("failed with {{ Action.Code }}".to_string()),
                ..Default::default()
            },
        );
        let ok = render(&ActionResult::success("done"), &rule, &ctx).unwrap();
        assert_eq!(body_of(ok).await, "POST: done");

        let failed = ActionResult {
            code: 7,
            ..Default::default()
        };
        let err = render(&failed, &rule, &ctx).unwrap();
        assert_eq!(body_of(err).await, "failed with 7");
    }

    #[tokio::test]
    async fn test_header_precedence() {
        let mut ctx = RequestContext::default();
        ctx.meta.user_agent = "test-agent".to_string();
        let mut result = ActionResult::success("<html><body>hi</body></html>");
        result.success_headers.insert("X-Source".to_string(), "engine".to_string());
        result.success_headers.insert("X-Engine-Only".to_string(), "yes".to_string());
        result.success_headers.insert("x-frame-options".to_string(), "SAMEORIGIN".to_string());

        let mut rule_headers = HashMap::new();
        rule_headers.insert("x-source".to_string(), "rule {{ .Meta.UserAgent }}".to_string());
        let rule = respond(
            ResponseSpec {
                headers: rule_headers,
                ..Default::default()
            },
            ResponseSpec::default(),
        );

        let response = render(&result, &rule, &ctx).unwrap();
        let headers = response.headers();
        assert_eq!(headers["x-source"], "rule test-agent");
        assert_eq!(headers.get_all("x-source").iter().count(), 1);
        assert_eq!(headers["x-engine-only"], "yes");
        assert_eq!(headers["x-frame-options"], "SAMEORIGIN");
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["content-type"], "text/html; charset=utf-8");
    }

    #[test]
    fn test_render_failure_is_error() {
        let rule = respond(
            ResponseSpec {
                body_template: Some("{{ Action.SuccessBody ".to_string()),
                ..Default::default()
            },
            ResponseSpec::default(),
        );
        assert!(render(&ActionResult::success("x"), &rule, &RequestContext::default()).is_err());
    }
}
