use anyhow::{bail, Context, Result};
use axum::http::header::CONTENT_TYPE;
use serde::Serialize;

use super::{ActionResult, Actioner};
use crate::embedded::BUTTONS_PAGE;
use crate::request::RequestContext;
use crate::rules::{Action, Button, Rule};
use crate::templating;

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ButtonView<'a> {
    name: &'a str,
    #[serde(rename = "URL")]
    url: &'a str,
    classes: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ButtonsPage<'a> {
    title: &'a str,
    buttons: Vec<ButtonView<'a>>,
}

pub struct ButtonsAction;

impl ButtonsAction {
    pub fn render(title: &str, buttons: &[Button], template: &str) -> Result<String> {
        let page = ButtonsPage {
            title,
            buttons: buttons
                .iter()
                .map(|b| ButtonView {
                    name: &b.name,
                    url: &b.url,
                    classes: &b.classes,
                })
                .collect(),
        };
        templating::render_value(template, page)
    }
}

#[async_trait::async_trait]
impl Actioner for ButtonsAction {
    fn name(&self) -> &'static str {
        "render.buttons"
    }

    async fn execute(&self, rule: &Rule, _ctx: &RequestContext) -> Result<ActionResult> {
        let Action::RenderButtons(buttons) = &rule.action else {
            bail!("rule '{}' has no buttons", rule.display_name());
        };
        let custom = match &rule.args.template_path {
            Some(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("error reading template '{}'", path.display()))?,
            ),
            None => None,
        };
        let html = Self::render(
            rule.name.as_deref().unwrap_or_default(),
            buttons,
            custom.as_deref().unwrap_or(BUTTONS_PAGE),
        )?;

        let mut result = ActionResult::success(html);
        result
            .success_headers
            .insert(CONTENT_TYPE.to_string(), "text/html; charset=utf-8".to_string());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Args;

    fn rule(template: Option<std::path::PathBuf>) -> Rule {
        Rule {
            name: Some("Lights".to_string()),
            on: Default::default(),
            action: Action::RenderButtons(vec![
                Button {
                    name: "On".to_string(),
                    url: "/lights/on".to_string(),
                    classes: "btn-lg".to_string(),
                },
                Button {
                    name: "Off & out".to_string(),
                    url: "/lights/off".to_string(),
                    classes: String::new(),
                },
            ]),
            args: Args {
                template_path: template,
                ..Default::default()
            },
            with: None,
            respond: Default::default(),
            post_action: None,
        }
    }

    #[tokio::test]
    async fn test_builtin_page() {
        let result = ButtonsAction.execute(&rule(None), &RequestContext::default()).await.unwrap();
        assert!(result.success_body.contains("<title>Lights</title>"));
        assert!(result.success_body.contains(r#"href="/lights/on""#));
        assert!(result.success_body.contains("Off &amp; out"));
        assert_eq!(
            result.success_headers.get("content-type").map(String::as_str),
            Some("text/html; charset=utf-8")
        );
    }

    #[tokio::test]
    async fn test_custom_template_is_read_per_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buttons.html");
        std::fs::write(&path, "{{ Title }}:{% for b in Buttons %}{{ b.Name }};{% endfor %}").unwrap();
        let rule = rule(Some(path.clone()));
        let first = ButtonsAction.execute(&rule, &RequestContext::default()).await.unwrap();
        assert_eq!(first.success_body, "Lights:On;Off & out;");

        std::fs::write(&path, "changed {{ Buttons | length }}").unwrap();
        let second = ButtonsAction.execute(&rule, &RequestContext::default()).await.unwrap();
        assert_eq!(second.success_body, "changed 2");
    }

    #[tokio::test]
    async fn test_missing_template_is_an_error() {
        let rule = rule(Some(std::path::PathBuf::from("/definitely/not/here.html")));
        assert!(ButtonsAction.execute(&rule, &RequestContext::default()).await.is_err());
    }
}
