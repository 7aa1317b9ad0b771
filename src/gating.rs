use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

/// Outcome of the sequential-mastery check. `reason` is user-facing and
/// names the blocking prerequisite when the unlock is refused.
#[derive(Debug, Clone)]
pub struct UnlockDecision {
    pub allowed: bool,
    pub reason: String,
}

impl UnlockDecision {
    fn allow() -> UnlockDecision {
        UnlockDecision {
            allowed: true,
            reason: String::new(),
        }
    }

    fn refuse(reason: String) -> UnlockDecision {
        UnlockDecision {
            allowed: false,
            reason,
        }
    }
}

/// Whether `teacher_id` may flip the (student, skill) entitlement to
/// allowed. The previous skill in the sequence must be passed, or have a
/// remediation upload from this teacher newer than the latest failed
/// attempt. Runs on the teacher path only; chairman edits bypass it.
pub fn can_unlock(
    conn: &Connection,
    teacher_id: &str,
    student_id: &str,
    skill_id: &str,
) -> anyhow::Result<UnlockDecision> {
    let order_index: Option<i64> = conn
        .query_row(
            "SELECT order_index FROM skills WHERE id = ?",
            [skill_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(order_index) = order_index else {
        return Ok(UnlockDecision::refuse("Skill not found.".to_string()));
    };

    // No active predecessor means no prerequisite (covers the first skill).
    let prev: Option<(String, String)> = conn
        .query_row(
            "SELECT id, name FROM skills WHERE is_active = 1 AND order_index = ?",
            [order_index - 1],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((prev_id, prev_name)) = prev else {
        return Ok(UnlockDecision::allow());
    };

    let latest: Option<(String, Option<i64>)> = conn
        .query_row(
            "SELECT finished_at, passed FROM attempts
             WHERE student_id = ? AND skill_id = ? AND finished_at IS NOT NULL
             ORDER BY finished_at DESC LIMIT 1",
            (student_id, &prev_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((finished_at, passed)) = latest else {
        return Ok(UnlockDecision::refuse(format!(
            "Cannot unlock: student hasn't attempted previous skill ({}) yet.",
            prev_name
        )));
    };

    if passed == Some(1) {
        return Ok(UnlockDecision::allow());
    }

    let remediation: Option<String> = conn
        .query_row(
            "SELECT uploaded_at FROM remediation_uploads
             WHERE teacher_id = ? AND student_id = ? AND skill_id = ?
             ORDER BY uploaded_at DESC LIMIT 1",
            (teacher_id, student_id, &prev_id),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(uploaded_at) = remediation {
        if let (Some(uploaded), Some(finished)) =
            (parse_instant(&uploaded_at), parse_instant(&finished_at))
        {
            if uploaded > finished {
                return Ok(UnlockDecision::allow());
            }
        }
    }

    Ok(UnlockDecision::refuse(format!(
        "Cannot unlock next skill: previous skill ({}) is FAIL. Upload remediation for that skill first.",
        prev_name
    )))
}

fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
