use anyhow::{bail, Result};

use super::{ActionResult, Actioner};
use crate::request::RequestContext;
use crate::rules::{Action, Rule};
use crate::templating;

pub struct ContentAction;

#[async_trait::async_trait]
impl Actioner for ContentAction {
    fn name(&self) -> &'static str {
        "answer.content"
    }

    async fn execute(&self, rule: &Rule, ctx: &RequestContext) -> Result<ActionResult> {
        let Action::AnswerContent(template) = &rule.action else {
            bail!("rule '{}' has no content", rule.display_name());
        };
        Ok(ActionResult::success(templating::render(template, ctx)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(content: &str) -> Rule {
        Rule {
            name: None,
            on: Default::default(),
            action: Action::AnswerContent(content.to_string()),
            args: Default::default(),
            with: None,
            respond: Default::default(),
            post_action: None,
        }
    }

    #[tokio::test]
    async fn test_answer_content() {
        let mut ctx = RequestContext::default();
        ctx.meta.user_agent = "test-agent".to_string();
        let result = ContentAction.execute(&rule("hello {{.Meta.UserAgent}}"), &ctx).await.unwrap();
        assert_eq!(result, ActionResult::success("hello test-agent"));
    }

    #[tokio::test]
    async fn test_render_failure_is_an_error() {
        assert!(ContentAction
            .execute(&rule("{{ Meta.UserAgent "), &RequestContext::default())
            .await
            .is_err());
    }
}
