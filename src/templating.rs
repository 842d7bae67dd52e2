//! Template rendering for rule content, response bodies and headers.
//!
//! Templates are minijinja templates rendered against the request context. Go-style
//! leading-dot references such as `{{ .Meta.UserAgent }}` are accepted and treated as
//! `{{ Meta.UserAgent }}`, so rules written for the dot syntax keep working.

use anyhow::Result;
use lazy_static::lazy_static;
use minijinja::value::{Value, ValueKind};
use minijinja::{Environment, UndefinedBehavior};
use regex::{Captures, Regex};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;

use crate::actions::ActionResult;
use crate::request::{Input, Meta, RequestContext};

lazy_static! {
    static ref ENV: Environment<'static> = build_environment();
    static ref TAG: Regex = Regex::new(r"(?s)(\{\{|\{%)(.*?)(\}\}|%\})").unwrap();
    static ref LEADING_DOT: Regex = Regex::new(r"(^|[\s(,\[|!=<>])\.([A-Za-z_])").unwrap();
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TemplateData<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'a ActionResult>,
    meta: &'a Meta,
    input: &'a Input,
}

fn build_environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.set_undefined_behavior(UndefinedBehavior::Chainable);
    env.add_function("ToUpper", |s: String| s.to_uppercase());
    env.add_function("ToLower", |s: String| s.to_lowercase());
    env.add_function("Default", default_value);
    env
}

/// `Default(fallback, value)`: the fallback replaces empty strings, lists and maps,
/// `false`, and missing values. Anything else is passed through.
fn default_value(fallback: Value, value: Value) -> Value {
    match value.kind() {
        ValueKind::Undefined | ValueKind::None => fallback,
        ValueKind::String | ValueKind::Seq | ValueKind::Map => {
            if value.len() == Some(0) {
                fallback
            } else {
                value
            }
        }
        ValueKind::Bool if !value.is_true() => fallback,
        _ => value,
    }
}

/// Rewrites `.Foo.Bar` references inside template tags to `Foo.Bar`.
fn normalize(template: &str) -> Cow<'_, str> {
    TAG.replace_all(template, |caps: &Captures| {
        format!(
            "{}{}{}",
            &caps[1],
            LEADING_DOT.replace_all(&caps[2], "${1}${2}"),
            &caps[3]
        )
    })
}

fn render_data(template: &str, data: &TemplateData<'_>) -> Result<String> {
    Ok(ENV.render_str(&normalize(template), data)?)
}

/// Renders a template against the request context.
pub fn render(template: &str, ctx: &RequestContext) -> Result<String> {
    render_data(
        template,
        &TemplateData {
            action: None,
            meta: &ctx.meta,
            input: &ctx.input,
        },
    )
}

/// Renders a response body template; `Action` is available in addition to the context.
pub fn render_with_action(template: &str, ctx: &RequestContext, action: &ActionResult) -> Result<String> {
    render_data(
        template,
        &TemplateData {
            action: Some(action),
            meta: &ctx.meta,
            input: &ctx.input,
        },
    )
}

/// Renders every value of a map, keeping the keys.
pub fn render_map(map: &HashMap<String, String>, ctx: &RequestContext) -> Result<HashMap<String, String>> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), render(v, ctx)?)))
        .collect()
}

/// Renders a template against an arbitrary serializable value.
pub fn render_value<S: Serialize>(template: &str, value: S) -> Result<String> {
    Ok(ENV.render_str(&normalize(template), value)?)
}

/// Compiles a template without rendering it. Used to reject broken rules at load time.
pub fn check(template: &str) -> Result<()> {
    ENV.template_from_str(&normalize(template))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mock_context() -> RequestContext {
        let mut ctx = RequestContext::default();
        ctx.meta.method = "GET".to_string();
        ctx.meta.url = "/some/path".to_string();
        ctx.meta.user_agent = "test-agent".to_string();
        ctx.meta
            .headers
            .insert("X-My-Header".to_string(), "gotest".to_string());
        ctx.input.form.insert("Field1".to_string(), "Field Value 1".to_string());
        ctx.input
            .query_params
            .insert("Param1".to_string(), "Param Value 1".to_string());
        ctx.input
            .path_variables
            .insert("id".to_string(), "42".to_string());
        ctx.input.json = json!({"jkey1": "json value 1", "nested": {"nkey1": "nvalue1"}});
        ctx
    }

    #[test]
    fn test_render_dot_syntax() {
        let ctx = mock_context();
        assert_eq!(
            render("hello {{.Meta.UserAgent}}", &ctx).unwrap(),
            "hello test-agent"
        );
        assert_eq!(
            render("{{ .Input.JSON.nested.nkey1 }}/{{ .Input.URLPlaceholders.id }}", &ctx).unwrap(),
            "nvalue1/42"
        );
    }

    #[test]
    fn test_render_plain_syntax_and_helpers() {
        let ctx = mock_context();
        assert_eq!(render("{{ ToUpper(Meta.Method) }}", &ctx).unwrap(), "GET");
        assert_eq!(render("{{ ToLower(Input.Form.Field1) }}", &ctx).unwrap(), "field value 1");
        assert_eq!(render("{{ Input.Params.Param1 | upper }}", &ctx).unwrap(), "PARAM VALUE 1");
        assert_eq!(
            render(r#"{{ Default("none", Input.Form.missing) }}"#, &ctx).unwrap(),
            "none"
        );
        assert_eq!(
            render(r#"{{ Default("none", Input.Form.Field1) }}"#, &ctx).unwrap(),
            "Field Value 1"
        );
    }

    #[test]
    fn test_render_block_tags_with_dots() {
        let ctx = mock_context();
        let out = render("{% if .Input.Form.Field1 %}yes{% else %}no{% endif %}", &ctx).unwrap();
        assert_eq!(out, "yes");
    }

    #[test]
    fn test_render_is_deterministic() {
        let ctx = mock_context();
        let tpl = "{{ Meta.URL }} {{ Meta.Headers['X-My-Header'] }}";
        let first = render(tpl, &ctx).unwrap();
        for _ in 0..5 {
            assert_eq!(render(tpl, &ctx).unwrap(), first);
        }
        assert_eq!(first, "/some/path gotest");
    }

    #[test]
    fn test_trailing_newline_kept() {
        let ctx = mock_context();
        assert_eq!(render("line\n", &ctx).unwrap(), "line\n");
    }

    #[test]
    fn test_render_with_action() {
        let ctx = mock_context();
        let action = ActionResult {
            success_body: "all good".to_string(),
            error_body: "bad".to_string(),
            code: 3,
            ..Default::default()
        };
        let out = render_with_action("{{ .Action.SuccessBody }}|{{ .Action.ErrorBody }}|{{ .Action.Code }}", &ctx, &action).unwrap();
        assert_eq!(out, "all good|bad|3");
    }

    #[test]
    fn test_broken_template_is_error() {
        let ctx = mock_context();
        assert!(render("{{ Meta.Method ", &ctx).is_err());
        assert!(check("{% if %}").is_err());
        assert!(check("{{ .Meta.Method }}").is_ok());
    }

    #[test]
    fn test_render_map() {
        let ctx = mock_context();
        let mut headers = HashMap::new();
        headers.insert("X-Agent".to_string(), "{{ .Meta.UserAgent }}".to_string());
        let out = render_map(&headers, &ctx).unwrap();
        assert_eq!(out.get("X-Agent").map(String::as_str), Some("test-agent"));
    }
}
