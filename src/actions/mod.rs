pub mod buttons;
pub mod capture;
pub mod content;
pub mod email;
pub mod file;
pub mod process;
pub mod redirect;
pub mod script;

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SmtpConfig;
use crate::request::RequestContext;
use crate::rules::{Action, Rule};

pub use buttons::ButtonsAction;
pub use content::ContentAction;
pub use email::{EmailAction, Mailer, OutgoingEmail, SmtpMailer};
pub use file::FileAction;
pub use redirect::RedirectAction;
pub use script::ScriptAction;

/// Normalised outcome of an action. `code == 0` means success.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionResult {
    pub success_body: String,
    pub error_body: String,
    pub code: i32,
    #[serde(rename = "SuccessHTTPStatus", skip_serializing_if = "Option::is_none")]
    pub success_http_status: Option<u16>,
    #[serde(rename = "ErrorHTTPStatus", skip_serializing_if = "Option::is_none")]
    pub error_http_status: Option<u16>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub success_headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub error_headers: HashMap<String, String>,
}

impl ActionResult {
    pub fn succeeded(&self) -> bool {
        self.code == 0
    }

    pub fn success(body: impl Into<String>) -> Self {
        Self {
            success_body: body.into(),
            ..Default::default()
        }
    }

    /// A failed result carrying `code` and an HTTP status for the error branch.
    pub fn failure(code: i32, http_status: u16, body: impl Into<String>) -> Self {
        Self {
            error_body: body.into(),
            code,
            error_http_status: Some(http_status),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
pub trait Actioner: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, rule: &Rule, ctx: &RequestContext) -> Result<ActionResult>;
}

/// One instance of every action variant, shared by all routes.
pub struct ActionRegistry {
    script: ScriptAction,
    email: EmailAction,
    content: ContentAction,
    file: FileAction,
    redirect: RedirectAction,
    buttons: ButtonsAction,
}

impl ActionRegistry {
    pub fn new(smtp: Option<SmtpConfig>) -> Self {
        Self::with_mailer(smtp, Arc::new(SmtpMailer))
    }

    pub fn with_mailer(smtp: Option<SmtpConfig>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            script: ScriptAction,
            email: EmailAction::new(smtp, mailer),
            content: ContentAction,
            file: FileAction,
            redirect: RedirectAction,
            buttons: ButtonsAction,
        }
    }

    /// The variant executing `action`. Directories are served by the router and have none.
    pub fn resolve(&self, action: &Action) -> Option<&dyn Actioner> {
        match action {
            Action::RunScript(_) => Some(&self.script),
            Action::SendEmail(_) => Some(&self.email),
            Action::AnswerContent(_) => Some(&self.content),
            Action::AnswerFile(_) => Some(&self.file),
            Action::RedirectPermanent(_) | Action::RedirectTemporary(_) => Some(&self.redirect),
            Action::RenderButtons(_) => Some(&self.buttons),
            Action::ServeDirectory(_) => None,
        }
    }

    pub fn email(&self) -> &EmailAction {
        &self.email
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_resolve_variants() {
        let registry = ActionRegistry::new(None);
        let cases = [
            (Action::RunScript("echo".into()), Some("run.script")),
            (Action::AnswerContent("x".into()), Some("answer.content")),
            (Action::AnswerFile(PathBuf::from("/x")), Some("answer.file")),
            (Action::RedirectPermanent("/x".into()), Some("redirect")),
            (Action::RedirectTemporary("/x".into()), Some("redirect")),
            (Action::RenderButtons(vec![]), Some("render.buttons")),
            (Action::SendEmail(Default::default()), Some("send.email")),
            (Action::ServeDirectory(PathBuf::from("/x")), None),
        ];
        for (action, expected) in cases {
            assert_eq!(registry.resolve(&action).map(|a| a.name()), expected);
        }
    }

    #[test]
    fn test_result_helpers() {
        assert!(ActionResult::success("ok").succeeded());
        let failed = ActionResult::failure(1, 400, "nope");
        assert!(!failed.succeeded());
        assert_eq!(failed.error_http_status, Some(400));
    }
}
