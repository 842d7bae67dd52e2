use anyhow::{bail, Context, Result};
use std::io::ErrorKind;

use super::{ActionResult, Actioner};
use crate::request::RequestContext;
use crate::rules::{Action, Rule};
use crate::templating;

pub struct FileAction;

#[async_trait::async_trait]
impl Actioner for FileAction {
    fn name(&self) -> &'static str {
        "answer.file"
    }

    /// A missing file is an action failure with code 404, not an engine error. The
    /// HTTP status is left to the rule or the default error status.
    async fn execute(&self, rule: &Rule, ctx: &RequestContext) -> Result<ActionResult> {
        let Action::AnswerFile(path) = &rule.action else {
            bail!("rule '{}' has no file", rule.display_name());
        };
        let content = match tokio::fs::read(path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(ActionResult {
                    code: 404,
                    error_body: format!("file {} not found\n", path.display()),
                    ..Default::default()
                });
            }
            Err(e) => return Err(e).with_context(|| format!("error reading file '{}'", path.display())),
        };

        if rule.args.enable_templating {
            let rendered = templating::render(&content, ctx)
                .with_context(|| format!("error rendering file '{}'", path.display()))?;
            return Ok(ActionResult::success(rendered));
        }
        Ok(ActionResult::success(content))
    }
}
