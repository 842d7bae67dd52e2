use anyhow::{anyhow, bail, Context, Result};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use tracing::{debug, info};

use super::{ActionResult, Actioner};
use crate::config::SmtpConfig;
use crate::request::RequestContext;
use crate::rules::{Action, Email, Rule};
use crate::templating;

/// A fully rendered email, ready for delivery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub cc: String,
    pub bcc: String,
    pub subject: String,
    pub body: String,
}

#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, smtp: &SmtpConfig, email: &OutgoingEmail) -> Result<()>;
}

fn mailbox(addr: &str) -> Result<Mailbox> {
    let address: Address = addr.parse().map_err(|e| anyhow!("invalid address '{}': {}", addr, e))?;
    Ok(Mailbox::new(None, address))
}

/// Plain SMTP delivery through lettre.
pub struct SmtpMailer;

#[async_trait::async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, smtp: &SmtpConfig, email: &OutgoingEmail) -> Result<()> {
        let mut builder = Message::builder()
            .from(mailbox(&email.from)?)
            .to(mailbox(&email.to)?)
            .subject(email.subject.as_str())
            .header(ContentType::TEXT_PLAIN);
        if !email.cc.is_empty() {
            builder = builder.cc(mailbox(&email.cc)?);
        }
        if !email.bcc.is_empty() {
            builder = builder.bcc(mailbox(&email.bcc)?);
        }
        let message = builder.body(email.body.clone()).context("error building email")?;

        let mut transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(smtp.server.as_str()).port(smtp.port);
        if !smtp.username.is_empty() {
            transport = transport.credentials(Credentials::new(smtp.username.clone(), smtp.password.clone()));
        }
        transport.build().send(message).await?;
        Ok(())
    }
}

pub struct EmailAction {
    smtp: Option<SmtpConfig>,
    mailer: Arc<dyn Mailer>,
}

impl EmailAction {
    pub fn new(smtp: Option<SmtpConfig>, mailer: Arc<dyn Mailer>) -> Self {
        Self { smtp, mailer }
    }

    /// Renders, validates and delivers `email`. Invalid addresses and delivery
    /// problems are action failures with status 400.
    pub async fn send(&self, email: &Email, ctx: &RequestContext) -> Result<ActionResult> {
        let render = |field: &str, template: &str| {
            templating::render(template, ctx).with_context(|| format!("error rendering email {}", field))
        };
        let from = if !email.from.is_empty() {
            render("from", &email.from)?
        } else {
            match self.smtp.as_ref().map(|s| s.from.as_str()).filter(|f| !f.is_empty()) {
                Some(from) => from.to_string(),
                None => bail!("no email from specified"),
            }
        };
        let outgoing = OutgoingEmail {
            from,
            to: render("to", &email.to)?,
            cc: render("cc", &email.cc)?,
            bcc: render("bcc", &email.bcc)?,
            subject: render("subject", &email.subject)?,
            body: render("body", &email.body)?,
        };

        for (label, addr) in [
            ("from", &outgoing.from),
            ("to", &outgoing.to),
            ("cc", &outgoing.cc),
            ("bcc", &outgoing.bcc),
        ] {
            if !addr.is_empty() && addr.parse::<Address>().is_err() {
                debug!("email {} '{}' rejected", label, addr);
                return Ok(ActionResult::failure(
                    1,
                    400,
                    format!("email {} is not a valid email address", label),
                ));
            }
        }

        let Some(smtp) = &self.smtp else {
            bail!("no smtp server configured");
        };
        if let Err(e) = self.mailer.send(smtp, &outgoing).await {
            return Ok(ActionResult::failure(1, 400, format!("SMTP connection error: {:#}", e)));
        }
        info!(to = %outgoing.to, "email sent");
        Ok(ActionResult::success("email sent"))
    }
}

#[async_trait::async_trait]
impl Actioner for EmailAction {
    fn name(&self) -> &'static str {
        "send.email"
    }

    async fn execute(&self, rule: &Rule, ctx: &RequestContext) -> Result<ActionResult> {
        let Action::SendEmail(email) = &rule.action else {
            bail!("rule '{}' has no email", rule.display_name());
        };
        self.send(email, ctx).await
    }
}
