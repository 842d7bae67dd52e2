use anyhow::{anyhow, bail, Context, Result};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::TempPath;
use tracing::{debug, info};

use super::process::{self, ProcessRunSpec};
use super::{ActionResult, Actioner};
use crate::request::RequestContext;
use crate::rules::{Action, Args, Rule};
use crate::templating;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub fn default_interpreter() -> &'static str {
    if cfg!(windows) {
        "powershell"
    } else {
        "sh"
    }
}

/// How an interpreter gets its script: arguments, stdin, and any batch file that
/// must outlive the run.
#[derive(Debug)]
pub struct Invocation {
    pub args: Vec<String>,
    pub stdin_script: Option<String>,
    pub batch_file: Option<TempPath>,
}

/// `C:\Windows\System32\cmd.exe` -> `cmd`
fn interpreter_kind(interpreter: &str) -> String {
    Path::new(interpreter)
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

pub fn invocation(interpreter: &str, script: &str) -> Result<Invocation> {
    match interpreter_kind(interpreter).as_str() {
        "powershell" | "pwsh" => Ok(Invocation {
            args: ["-NoProfile", "-NonInteractive", "-Command", "-"]
                .into_iter()
                .map(String::from)
                .collect(),
            stdin_script: Some(script.to_string()),
            batch_file: None,
        }),
        // cmd ignores stdin once /Q /C are given, so the script goes to a batch file
        "cmd" => {
            let mut file = tempfile::Builder::new()
                .prefix("httpe_")
                .suffix(".bat")
                .tempfile()
                .context("error creating temporary batch file")?;
            file.write_all(script.as_bytes())
                .with_context(|| format!("error saving script to {}", file.path().display()))?;
            let path = file.into_temp_path();
            let arg = path
                .to_str()
                .ok_or_else(|| anyhow!("batch file path is not valid unicode"))?
                .to_string();
            Ok(Invocation {
                args: vec!["/Q".to_string(), "/C".to_string(), arg],
                stdin_script: None,
                batch_file: Some(path),
            })
        }
        _ => Ok(Invocation {
            args: Vec::new(),
            stdin_script: Some(script.to_string()),
            batch_file: None,
        }),
    }
}

/// Renders `template` against the request and runs it with the interpreter named in `args`.
pub async fn run_script(template: &str, args: &Args, ctx: &RequestContext) -> Result<ActionResult> {
    let script = templating::render(template, ctx).context("error rendering script")?;
    let interpreter = args
        .interpreter
        .as_deref()
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| default_interpreter());
    let invocation = invocation(interpreter, &script)?;
    let spec = ProcessRunSpec {
        interpreter: interpreter.to_string(),
        args: invocation.args,
        working_dir: args
            .working_dir
            .clone()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(std::env::temp_dir),
        timeout: Duration::from_secs(args.timeout_seconds.filter(|t| *t > 0).unwrap_or(DEFAULT_TIMEOUT_SECS)),
        stdin_script: invocation.stdin_script,
    };
    debug!(interpreter, cwd = %spec.working_dir.display(), "running script");

    let outcome = process::run(&spec).await;
    // the batch file goes away here, whatever the outcome
    drop(invocation.batch_file);
    let outcome = outcome?;

    let Some(code) = outcome.exit_code else {
        bail!("{}", outcome.messages.join(", "));
    };
    if code != 0 {
        info!(code, "script exited with a non-zero code");
    }
    Ok(ActionResult {
        success_body: outcome.stdout,
        error_body: outcome.stderr,
        code,
        ..Default::default()
    })
}

pub struct ScriptAction;

#[async_trait::async_trait]
impl Actioner for ScriptAction {
    fn name(&self) -> &'static str {
        "run.script"
    }

    async fn execute(&self, rule: &Rule, ctx: &RequestContext) -> Result<ActionResult> {
        let Action::RunScript(template) = &rule.action else {
            bail!("rule '{}' has no script", rule.display_name());
        };
        run_script(template, &rule.args, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_args() {
        let ps = invocation("powershell", "Get-Date").unwrap();
        assert_eq!(ps.args, vec!["-NoProfile", "-NonInteractive", "-Command", "-"]);
        assert_eq!(ps.stdin_script.as_deref(), Some("Get-Date"));

        let pwsh = invocation("/opt/microsoft/powershell/7/pwsh", "x").unwrap();
        assert_eq!(pwsh.args.len(), 4);

        let sh = invocation("/bin/sh", "echo 1").unwrap();
        assert!(sh.args.is_empty());
        assert_eq!(sh.stdin_script.as_deref(), Some("echo 1"));
        assert!(sh.batch_file.is_none());
    }

    #[test]
    fn test_cmd_uses_batch_file() {
        let cmd = invocation("CMD.EXE", "echo hi").unwrap();
        assert_eq!(&cmd.args[..2], &["/Q".to_string(), "/C".to_string()]);
        assert!(cmd.stdin_script.is_none());
        let path = cmd.batch_file.as_ref().unwrap().to_path_buf();
        assert!(path.to_string_lossy().ends_with(".bat"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "echo hi");
        drop(cmd);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        fn rule(script: &str, args: Args) -> Rule {
            Rule {
                name: None,
                on: Default::default(),
                action: Action::RunScript(script.to_string()),
                args,
                with: None,
                respond: Default::default(),
                post_action: None,
            }
        }

        #[tokio::test]
        async fn test_script_success() {
            let mut ctx = RequestContext::default();
            ctx.input.form.insert("name".to_string(), "world".to_string());
            let result = ScriptAction
                .execute(&rule("echo hello {{ .Input.Form.name }}", Args::default()), &ctx)
                .await
                .unwrap();
            assert_eq!(result.success_body, "hello world\n");
            assert_eq!(result.code, 0);
        }

        #[tokio::test]
        async fn test_script_exit_code_is_not_an_error() {
            let result = ScriptAction
                .execute(&rule("exit 3", Args::default()), &RequestContext::default())
                .await
                .unwrap();
            assert_eq!(result.code, 3);
            assert_eq!(result.error_body, "");
        }

        #[tokio::test]
        async fn test_script_timeout_is_an_error() {
            let args = Args {
                timeout_seconds: Some(1),
                ..Default::default()
            };
            let err = ScriptAction
                .execute(&rule("sleep 5", args), &RequestContext::default())
                .await
                .unwrap_err()
                .to_string();
            assert!(err.contains("timeout"), "{}", err);
            assert!(err.contains("killed"), "{}", err);
        }

        #[tokio::test]
        async fn test_script_interpreter_and_cwd() {
            let dir = tempfile::tempdir().unwrap();
            let args = Args {
                interpreter: Some("bash".to_string()),
                working_dir: Some(dir.path().to_path_buf()),
                ..Default::default()
            };
            let result = ScriptAction
                .execute(&rule("echo $BASH_VERSION >/dev/null; pwd", args), &RequestContext::default())
                .await
                .unwrap();
            assert_eq!(
                std::path::PathBuf::from(result.success_body.trim()).canonicalize().unwrap(),
                dir.path().canonicalize().unwrap()
            );
        }

        #[tokio::test]
        async fn test_script_render_error_propagates() {
            let err = ScriptAction
                .execute(&rule("echo {{ Meta.Method ", Args::default()), &RequestContext::default())
                .await
                .unwrap_err();
            assert!(err.to_string().contains("error rendering script"));
        }
    }
}
