//! Secondary actions run after the response, with their results kept in the data directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

use crate::actions::script::run_script;
use crate::actions::{ActionRegistry, ActionResult};
use crate::request::RequestContext;
use crate::rules::{ActionKind, PostAction};

pub const RESULT_PREFIX: &str = "post_action_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostActionRecord {
    pub action: String,
    pub success_body: String,
    pub error_body: String,
    pub code: i32,
    pub internal_error: String,
}

impl PostActionRecord {
    fn new(kind: ActionKind, outcome: Result<ActionResult>) -> Self {
        match outcome {
            Ok(result) => Self {
                action: kind.to_string(),
                success_body: result.success_body,
                error_body: result.error_body,
                code: result.code,
                internal_error: String::new(),
            },
            Err(e) => Self {
                action: kind.to_string(),
                internal_error: format!("{:#}", e),
                ..Default::default()
            },
        }
    }
}

/// Runs the script and the email of `post`, in that order, when present.
pub async fn execute(post: &PostAction, actions: &ActionRegistry, ctx: &RequestContext) -> Vec<PostActionRecord> {
    let mut records = Vec::new();
    if let Some(script) = post.run_script.as_deref().filter(|s| !s.is_empty()) {
        debug!("starting post action run.script");
        let outcome = run_script(script, &post.args, ctx).await;
        records.push(PostActionRecord::new(ActionKind::RunScript, outcome));
    }
    if let Some(email) = &post.send_email {
        debug!("starting post action send.email");
        let outcome = actions.email().send(email, ctx).await;
        records.push(PostActionRecord::new(ActionKind::SendEmail, outcome));
    }
    records
}

/// Where post action results are written and how long they are kept.
#[derive(Debug, Clone)]
pub struct ResultStore {
    pub data_dir: PathBuf,
    pub retention: Duration,
}

impl ResultStore {
    pub fn new(data_dir: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            data_dir: data_dir.into(),
            retention,
        }
    }

    /// Writes `records` as a JSON array to a new, uniquely named file.
    pub async fn write(&self, records: &[PostActionRecord]) -> Result<PathBuf> {
        let name = format!(
            "{}{}_{}.json",
            RESULT_PREFIX,
            chrono::Utc::now().format("%Y%m%d%H%M%S"),
            uuid::Uuid::new_v4().simple()
        );
        let path = self.data_dir.join(name);
        let json = serde_json::to_vec_pretty(records)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("error writing post action result to '{}'", path.display()))?;
        Ok(path)
    }

    /// Deletes result files older than the retention. Returns how many were deleted.
    pub async fn purge(&self) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(self.retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut deleted = 0;
        let mut entries = tokio::fs::read_dir(&self.data_dir)
            .await
            .with_context(|| format!("error reading data directory '{}'", self.data_dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if !is_result_file(&entry.path()) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            if modified < cutoff {
                tokio::fs::remove_file(entry.path()).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Runs `post`, stores its results, then purges old result files.
    pub async fn run(&self, post: &PostAction, actions: &ActionRegistry, ctx: &RequestContext) {
        let records = execute(post, actions, ctx).await;
        match self.write(&records).await {
            Ok(path) => debug!("post action result written to {}", path.display()),
            Err(e) => error!("{:#}", e),
        }
        match self.purge().await {
            Ok(n) => info!("deleted {} files from data directory", n),
            Err(e) => error!("error cleaning data directory: {:#}", e),
        }
    }
}

fn is_result_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(RESULT_PREFIX) && n.ends_with(".json"))
}
