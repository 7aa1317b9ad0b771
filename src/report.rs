use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::db;
use crate::scoring::AnswerRecord;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub score_pct: i64,
    pub correct: i64,
    pub total: i64,
    pub lacking_skills: Vec<String>,
}

/// Everything the report collaborator needs to render one finished
/// attempt. Deterministic: identical input produces an identical artifact.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportInput {
    pub attempt_id: String,
    pub school_name: String,
    pub student_id: String,
    pub student_name: String,
    pub teacher_name: String,
    pub skill_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_sec: i64,
    pub answers: Vec<AnswerRecord>,
    pub summary: ReportSummary,
}

#[derive(Debug, Clone)]
pub struct RenderedReport {
    /// Workspace-relative artifact reference stored on the attempt.
    pub path: String,
    pub sha256: String,
}

pub trait ReportRenderer {
    fn render(&self, input: &ReportInput) -> anyhow::Result<RenderedReport>;
}

/// Writes the attempt report as canonical JSON under `<workspace>/reports`.
/// PDF layout belongs to the desktop shell, which renders from this
/// artifact; the answer list may be arbitrarily long.
pub struct FsReportRenderer {
    workspace: PathBuf,
}

impl FsReportRenderer {
    pub fn new(workspace: &Path) -> FsReportRenderer {
        FsReportRenderer {
            workspace: workspace.to_path_buf(),
        }
    }
}

impl ReportRenderer for FsReportRenderer {
    fn render(&self, input: &ReportInput) -> anyhow::Result<RenderedReport> {
        let dir = self.workspace.join("reports");
        fs::create_dir_all(&dir).context("create reports dir")?;

        let rel = format!("reports/attempt_{}.json", input.attempt_id);
        let bytes = serde_json::to_vec_pretty(input)?;
        fs::write(self.workspace.join(&rel), &bytes).context("write report artifact")?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(RenderedReport {
            path: rel,
            sha256: format!("{:x}", hasher.finalize()),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub from: String,
    #[serde(default)]
    pub user: Option<String>,
}

/// Reads `notify.smtp` from settings; `None` (no transport configured)
/// turns notification into a silent no-op.
pub fn smtp_from_settings(conn: &Connection) -> anyhow::Result<Option<SmtpConfig>> {
    let Some(value) = db::settings_get_json(conn, "notify.smtp")? else {
        return Ok(None);
    };
    Ok(serde_json::from_value(value).ok())
}

pub trait Notifier: Send {
    /// Best-effort delivery. `Ok(false)` means "no transport, skipped".
    fn notify(&self, to: &str, subject: &str, body: &str, artifact: &str)
        -> anyhow::Result<bool>;
}

/// Queues outgoing mail as JSON lines in `<workspace>/outbox.jsonl` for the
/// external relay to pick up and attach the artifact.
pub struct OutboxNotifier {
    workspace: PathBuf,
    smtp: Option<SmtpConfig>,
}

impl OutboxNotifier {
    pub fn new(workspace: &Path, smtp: Option<SmtpConfig>) -> OutboxNotifier {
        OutboxNotifier {
            workspace: workspace.to_path_buf(),
            smtp,
        }
    }
}

impl Notifier for OutboxNotifier {
    fn notify(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        artifact: &str,
    ) -> anyhow::Result<bool> {
        let Some(smtp) = &self.smtp else {
            return Ok(false);
        };

        let line = serde_json::json!({
            "queuedAt": Utc::now().to_rfc3339(),
            "from": smtp.from,
            "to": to,
            "subject": subject,
            "body": body,
            "attachment": artifact,
        });
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.workspace.join("outbox.jsonl"))
            .context("open outbox")?;
        writeln!(file, "{}", line).context("append outbox line")?;
        Ok(true)
    }
}

/// Fire-and-forget: runs off the request thread so a slow or broken
/// transport can never block or fail the submitting student's response.
pub fn notify_in_background(
    notifier: Box<dyn Notifier>,
    to: String,
    subject: String,
    body: String,
    artifact: String,
) {
    std::thread::spawn(move || match notifier.notify(&to, &subject, &body, &artifact) {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(to = %to, "no mail transport configured; notification skipped")
        }
        Err(e) => tracing::warn!(to = %to, error = %e, "teacher notification failed"),
    });
}
