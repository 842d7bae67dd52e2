use anyhow::{anyhow, bail, Context, Result};
use axum::http::Method;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info_span};

use crate::embedded::RULES_SCHEMA;
use crate::templating;
use crate::units;

pub const DEFAULT_MAX_REQUEST_BODY: &str = "512KB";

// ---- Rules file schema ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct On {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Args {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(rename = "cwd", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(rename = "template", default, skip_serializing_if = "Option::is_none")]
    pub template_path: Option<PathBuf>,
    #[serde(rename = "templating", default)]
    pub enable_templating: bool,
    #[serde(rename = "file_uploads", default)]
    pub enable_file_uploads: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Email {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub cc: String,
    #[serde(default)]
    pub bcc: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

impl Email {
    /// Every field is a template.
    pub fn templates(&self) -> [&str; 6] {
        [
            self.from.as_str(),
            self.to.as_str(),
            self.cc.as_str(),
            self.bcc.as_str(),
            self.subject.as_str(),
            self.body.as_str(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Button {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub classes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password: String,
}

/// Algorithm applied to a supplied basic-auth password before comparing it with the
/// stored one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HashAlgorithm {
    #[default]
    None,
    Sha256,
    Sha512,
}

impl serde::Serialize for HashAlgorithm {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let s = match self {
            HashAlgorithm::None => "none",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        };
        serializer.serialize_str(s)
    }
}

impl<'de> serde::Deserialize<'de> for HashAlgorithm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "" | "none" => Ok(HashAlgorithm::None),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            _ => Err(serde::de::Error::unknown_variant(&s, &["none", "sha256", "sha512"])),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct With {
    #[serde(rename = "auth_basic", default)]
    pub auth_basic_users: Vec<User>,
    #[serde(rename = "auth_hashing", default)]
    pub auth_hash_algorithm: HashAlgorithm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_request_body: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(rename = "body", default, skip_serializing_if = "Option::is_none")]
    pub body_template: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ResponseSpec {
    /// The declared status; `0` counts as not declared.
    pub fn status(&self) -> Option<u16> {
        self.http_status.filter(|s| *s != 0)
    }

    pub fn body(&self) -> Option<&str> {
        self.body_template.as_deref().filter(|b| !b.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Respond {
    #[serde(default)]
    pub on_success: ResponseSpec,
    #[serde(default)]
    pub on_error: ResponseSpec,
}

impl Respond {
    pub fn branch(&self, succeeded: bool) -> &ResponseSpec {
        if succeeded {
            &self.on_success
        } else {
            &self.on_error
        }
    }
}

/// Secondary action run after the response has been produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostAction {
    #[serde(rename = "run.script", default, skip_serializing_if = "Option::is_none")]
    pub run_script: Option<String>,
    #[serde(rename = "send.email", default, skip_serializing_if = "Option::is_none")]
    pub send_email: Option<Email>,
    #[serde(default)]
    pub args: Args,
}

/// The `do` block as written in the rules file: every action field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDo {
    #[serde(rename = "run.script", default, skip_serializing_if = "Option::is_none")]
    pub run_script: Option<String>,
    #[serde(rename = "send.email", default, skip_serializing_if = "Option::is_none")]
    pub send_email: Option<Email>,
    #[serde(rename = "answer.content", default, skip_serializing_if = "Option::is_none")]
    pub answer_content: Option<String>,
    #[serde(rename = "answer.file", default, skip_serializing_if = "Option::is_none")]
    pub answer_file: Option<PathBuf>,
    #[serde(rename = "redirect.permanent", default, skip_serializing_if = "Option::is_none")]
    pub redirect_permanent: Option<String>,
    #[serde(rename = "redirect.temporary", default, skip_serializing_if = "Option::is_none")]
    pub redirect_temporary: Option<String>,
    #[serde(rename = "serve.directory", default, skip_serializing_if = "Option::is_none")]
    pub serve_directory: Option<PathBuf>,
    #[serde(rename = "render.buttons", default, skip_serializing_if = "Option::is_none")]
    pub render_buttons: Option<Vec<Button>>,
    #[serde(default)]
    pub args: Args,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    RunScript,
    SendEmail,
    AnswerContent,
    AnswerFile,
    RedirectPermanent,
    RedirectTemporary,
    ServeDirectory,
    RenderButtons,
}

impl ActionKind {
    /// Order in which action fields are looked at when resolving a `do` block.
    pub const PRECEDENCE: [ActionKind; 8] = [
        ActionKind::RunScript,
        ActionKind::SendEmail,
        ActionKind::AnswerContent,
        ActionKind::AnswerFile,
        ActionKind::RedirectPermanent,
        ActionKind::RedirectTemporary,
        ActionKind::ServeDirectory,
        ActionKind::RenderButtons,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::RunScript => "run.script",
            ActionKind::SendEmail => "send.email",
            ActionKind::AnswerContent => "answer.content",
            ActionKind::AnswerFile => "answer.file",
            ActionKind::RedirectPermanent => "redirect.permanent",
            ActionKind::RedirectTemporary => "redirect.temporary",
            ActionKind::ServeDirectory => "serve.directory",
            ActionKind::RenderButtons => "render.buttons",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single action bound to a rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    RunScript(String),
    SendEmail(Email),
    AnswerContent(String),
    AnswerFile(PathBuf),
    RedirectPermanent(String),
    RedirectTemporary(String),
    ServeDirectory(PathBuf),
    RenderButtons(Vec<Button>),
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::RunScript(_) => ActionKind::RunScript,
            Action::SendEmail(_) => ActionKind::SendEmail,
            Action::AnswerContent(_) => ActionKind::AnswerContent,
            Action::AnswerFile(_) => ActionKind::AnswerFile,
            Action::RedirectPermanent(_) => ActionKind::RedirectPermanent,
            Action::RedirectTemporary(_) => ActionKind::RedirectTemporary,
            Action::ServeDirectory(_) => ActionKind::ServeDirectory,
            Action::RenderButtons(_) => ActionKind::RenderButtons,
        }
    }
}

fn non_empty(s: &Option<String>) -> bool {
    s.as_deref().is_some_and(|s| !s.is_empty())
}

fn non_empty_path(p: &Option<PathBuf>) -> bool {
    p.as_deref().is_some_and(|p| !p.as_os_str().is_empty())
}

impl RawDo {
    fn is_populated(&self, kind: ActionKind) -> bool {
        match kind {
            ActionKind::RunScript => non_empty(&self.run_script),
            ActionKind::SendEmail => self.send_email.is_some(),
            ActionKind::AnswerContent => non_empty(&self.answer_content),
            ActionKind::AnswerFile => non_empty_path(&self.answer_file),
            ActionKind::RedirectPermanent => non_empty(&self.redirect_permanent),
            ActionKind::RedirectTemporary => non_empty(&self.redirect_temporary),
            ActionKind::ServeDirectory => non_empty_path(&self.serve_directory),
            ActionKind::RenderButtons => self.render_buttons.as_ref().is_some_and(|b| !b.is_empty()),
        }
    }

    /// Populated action fields, in precedence order.
    pub fn populated(&self) -> Vec<ActionKind> {
        ActionKind::PRECEDENCE
            .into_iter()
            .filter(|kind| self.is_populated(*kind))
            .collect()
    }

    /// Takes the first populated action field in precedence order.
    pub fn resolve(mut self) -> Option<(Action, Args)> {
        let kind = *self.populated().first()?;
        let action = match kind {
            ActionKind::RunScript => Action::RunScript(self.run_script.take()?),
            ActionKind::SendEmail => Action::SendEmail(self.send_email.take()?),
            ActionKind::AnswerContent => Action::AnswerContent(self.answer_content.take()?),
            ActionKind::AnswerFile => Action::AnswerFile(self.answer_file.take()?),
            ActionKind::RedirectPermanent => Action::RedirectPermanent(self.redirect_permanent.take()?),
            ActionKind::RedirectTemporary => Action::RedirectTemporary(self.redirect_temporary.take()?),
            ActionKind::ServeDirectory => Action::ServeDirectory(self.serve_directory.take()?),
            ActionKind::RenderButtons => Action::RenderButtons(self.render_buttons.take()?),
        };
        Some((action, self.args))
    }
}

/// A rule as written in the rules file, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<On>,
    #[serde(rename = "do", default, skip_serializing_if = "Option::is_none")]
    pub action: Option<RawDo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with: Option<With>,
    #[serde(default)]
    pub respond: Respond,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_action: Option<PostAction>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesDocument {
    #[serde(default)]
    pub rules: Vec<RawRule>,
}

/// A validated rule. Immutable once loaded and shared by all requests hitting its route.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: Option<String>,
    pub on: On,
    pub action: Action,
    pub args: Args,
    pub with: Option<With>,
    pub respond: Respond,
    pub post_action: Option<PostAction>,
}

impl Rule {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.on.path)
    }

    /// Body ceiling in bytes, from `with.max_request_body` or the 512KB default.
    pub fn max_request_body(&self) -> Result<u64> {
        let raw = self
            .with
            .as_ref()
            .and_then(|w| w.max_request_body.as_deref())
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_MAX_REQUEST_BODY);
        units::parse_bytes(raw).with_context(|| format!("error parsing max_request_body '{}'", raw))
    }

    pub fn methods(&self) -> Result<Vec<Method>> {
        self.on
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_uppercase().as_bytes())
                    .map_err(|_| anyhow!("invalid http method '{}'", m))
            })
            .collect()
    }

    fn check_templates(&self) -> Result<()> {
        let mut templates: Vec<&str> = Vec::new();
        match &self.action {
            Action::RunScript(t)
            | Action::AnswerContent(t)
            | Action::RedirectPermanent(t)
            | Action::RedirectTemporary(t) => templates.push(t),
            Action::SendEmail(email) => templates.extend(email.templates()),
            Action::AnswerFile(_) | Action::ServeDirectory(_) | Action::RenderButtons(_) => {}
        }
        if let Some(post) = &self.post_action {
            templates.extend(post.run_script.as_deref());
            if let Some(email) = &post.send_email {
                templates.extend(email.templates());
            }
        }
        for spec in [&self.respond.on_success, &self.respond.on_error] {
            templates.extend(spec.body());
            templates.extend(spec.headers.values().map(String::as_str));
        }
        for template in templates {
            templating::check(template).with_context(|| format!("invalid template '{}'", template))?;
        }
        Ok(())
    }
}

impl TryFrom<RawRule> for Rule {
    type Error = anyhow::Error;

    fn try_from(raw: RawRule) -> Result<Self> {
        let on = raw.on.ok_or_else(|| anyhow!("missing the 'on' section"))?;
        if !on.path.starts_with('/') {
            bail!("path '{}' must start with '/'", on.path);
        }
        let has_placeholders = path_segments(&on.path)?
            .iter()
            .any(|s| matches!(s, Segment::Placeholder(_)));
        let raw_do = raw.action.unwrap_or_default();
        let populated = raw_do.populated();
        if populated.len() > 1 {
            let names: Vec<&str> = populated.iter().map(|k| k.as_str()).collect();
            bail!("more than one action in the 'do' section: {}", names.join(", "));
        }
        let (action, args) = raw_do.resolve().ok_or_else(|| {
            let valid: Vec<&str> = ActionKind::PRECEDENCE.iter().map(|k| k.as_str()).collect();
            anyhow!("missing a valid action in the 'do' section. Use one of '{}'", valid.join(", "))
        })?;

        if has_placeholders && matches!(action, Action::ServeDirectory(_)) {
            bail!("serve.directory path '{}' must not contain placeholders", on.path);
        }

        if let Some(post) = &raw.post_action {
            if !non_empty(&post.run_script) && post.send_email.is_none() {
                bail!("post_action needs 'run.script' or 'send.email'");
            }
        }

        let rule = Rule {
            name: raw.name.filter(|n| !n.is_empty()),
            on,
            action,
            args,
            with: raw.with,
            respond: raw.respond,
            post_action: raw.post_action,
        };
        rule.max_request_body()?;
        rule.methods()?;
        rule.check_templates()?;
        Ok(rule)
    }
}

// ---- Loading and validation ----

/// Validates a rules document against the embedded JSON schema.
pub fn validate_schema(document: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(RULES_SCHEMA).context("parsing embedded rules schema")?;
    let compiled = JSONSchema::compile(&schema).map_err(|e| anyhow!("invalid rules schema: {}", e))?;
    if let Err(errors) = compiled.validate(document) {
        let messages: Vec<String> = errors
            .map(|e| format!("{} (at '{}')", e, e.instance_path))
            .collect();
        for message in &messages {
            error!("schema validation: {}", message);
        }
        bail!("invalid rules: {}", messages.join("; "));
    }
    debug!("successfully validated against schema");
    Ok(())
}

/// Parses, schema-validates and converts a YAML rules document.
pub fn parse_rules(yaml: &str) -> Result<Vec<Rule>> {
    let document: Value = serde_yaml::from_str(yaml).context("error parsing rules yaml")?;
    validate_schema(&document)?;
    let document: RulesDocument = serde_json::from_value(document).context("error decoding rules")?;
    if document.rules.is_empty() {
        bail!("no rules specified");
    }

    let mut rules = Vec::with_capacity(document.rules.len());
    let mut failures = Vec::new();
    for (index, raw) in document.rules.into_iter().enumerate() {
        let name = raw.name.clone().unwrap_or_default();
        match Rule::try_from(raw) {
            Ok(rule) => rules.push(rule),
            Err(e) => {
                error!("rule {} '{}': {:#}", index, name, e);
                failures.push(format!("rule {} '{}': {:#}", index, name, e));
            }
        }
    }
    if !failures.is_empty() {
        bail!("invalid rules: {}", failures.join("; "));
    }
    check_route_overlaps(&rules)?;
    Ok(rules)
}

/// One segment of a rule path: literal text or a whole-segment `{name}` placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Static(&'a str),
    Placeholder(&'a str),
}

fn path_segments(path: &str) -> Result<Vec<Segment<'_>>> {
    if path.contains(['*', ':']) {
        bail!("path '{}' must not contain '*' or ':'", path);
    }
    let mut names = HashSet::new();
    let mut segments = Vec::new();
    for segment in path.split('/').skip(1) {
        match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(name) => {
                let valid = name.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                if !valid {
                    bail!("path '{}' has an invalid placeholder '{{{}}}'", path, name);
                }
                if !names.insert(name) {
                    bail!("path '{}' uses placeholder '{}' twice", path, name);
                }
                segments.push(Segment::Placeholder(name));
            }
            None if segment.contains(['{', '}']) => {
                bail!("path '{}': a placeholder must span a whole path segment", path);
            }
            None => segments.push(Segment::Static(segment)),
        }
    }
    Ok(segments)
}

/// `/item/{id}` and `/item/{key}` share the shape `/item/{}`.
fn route_shape(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| match s {
            Segment::Static(text) => format!("/{}", text),
            Segment::Placeholder(_) => "/{}".to_string(),
        })
        .collect()
}

/// Placeholder names that two paths put at the same position after a common prefix.
/// The router cannot hold both.
fn placeholder_conflict<'a>(a: &[Segment<'a>], b: &[Segment<'a>]) -> Option<(&'a str, &'a str)> {
    for (x, y) in a.iter().zip(b) {
        match (x, y) {
            (Segment::Static(x), Segment::Static(y)) if x == y => {}
            (Segment::Placeholder(x), Segment::Placeholder(y)) if x == y => {}
            (Segment::Placeholder(x), Segment::Placeholder(y)) => return Some((x, y)),
            _ => return None,
        }
    }
    None
}

/// Rejects rule sets the router cannot hold. Two rules may share a path shape only
/// when both list methods, none of them overlap and the placeholder names agree. A
/// served directory owns every path below it.
fn check_route_overlaps(rules: &[Rule]) -> Result<()> {
    let mut routed: Vec<(&Rule, Vec<Segment>)> = Vec::new();
    let mut directories: Vec<&Rule> = Vec::new();
    for rule in rules {
        if matches!(rule.action, Action::ServeDirectory(_)) {
            directories.push(rule);
        } else {
            routed.push((rule, path_segments(&rule.on.path)?));
        }
    }

    let mut any_method: HashSet<String> = HashSet::new();
    let mut seen: HashSet<(String, Method)> = HashSet::new();
    let mut shapes: HashSet<String> = HashSet::new();
    for (index, (rule, segments)) in routed.iter().enumerate() {
        let path = rule.on.path.as_str();
        for (other, other_segments) in &routed[..index] {
            if let Some((theirs, ours)) = placeholder_conflict(other_segments, segments) {
                bail!(
                    "rule '{}': path '{}' names placeholder '{}' where rule '{}' ('{}') names '{}'",
                    rule.display_name(),
                    path,
                    ours,
                    other.display_name(),
                    other.on.path,
                    theirs
                );
            }
        }

        let shape = route_shape(segments);
        let methods = rule.methods()?;
        if any_method.contains(&shape) || (methods.is_empty() && shapes.contains(&shape)) {
            bail!("rule '{}': path '{}' is bound by more than one rule", rule.display_name(), path);
        }
        if methods.is_empty() {
            any_method.insert(shape.clone());
        }
        for method in methods {
            if !seen.insert((shape.clone(), method.clone())) {
                bail!("rule '{}': {} {} is bound by more than one rule", rule.display_name(), method, path);
            }
        }
        shapes.insert(shape);
    }

    let mut root_directory = false;
    for (index, dir) in directories.iter().enumerate() {
        let prefix = dir.on.path.trim_end_matches('/');
        if prefix.is_empty() {
            // served as the fallback, below every route
            if root_directory {
                bail!("rule '{}': more than one directory is served on '/'", dir.display_name());
            }
            root_directory = true;
            continue;
        }
        let below = format!("{}/", prefix);
        let other_directories = directories
            .iter()
            .enumerate()
            .filter(|(other, _)| *other != index)
            .map(|(_, dir)| *dir);
        let clash = routed
            .iter()
            .map(|(rule, _)| *rule)
            .chain(other_directories)
            .find(|other| other.on.path == prefix || other.on.path.starts_with(&below));
        if let Some(other) = clash {
            bail!(
                "rule '{}': path '{}' lies in the directory served by rule '{}' on '{}'",
                other.display_name(),
                other.on.path,
                dir.display_name(),
                dir.on.path
            );
        }
    }
    Ok(())
}

/// Reads and validates the rules file.
pub fn load(path: &Path) -> Result<Vec<Rule>> {
    let _span = info_span!("rules", file = %path.display()).entered();
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("error reading rules file '{}'", path.display()))?;
    parse_rules(&yaml).with_context(|| format!("error loading rules file '{}'", path.display()))
}

/// Returns the rules file converted to pretty printed JSON.
pub fn dump_json(path: &Path) -> Result<String> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("error reading rules file '{}'", path.display()))?;
    let document: Value = serde_yaml::from_str(&yaml).context("error parsing rules yaml")?;
    Ok(serde_json::to_string_pretty(&document)?)
}
