use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("skillportal.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            role TEXT NOT NULL,
            name TEXT NOT NULL,
            teacher_id TEXT,
            email TEXT,
            FOREIGN KEY(teacher_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_teacher ON users(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS skills(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            order_index INTEGER NOT NULL,
            duration_min INTEGER,
            pass_pct INTEGER,
            is_active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_skills_order ON skills(order_index)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            id TEXT PRIMARY KEY,
            skill_id TEXT NOT NULL,
            qtype TEXT NOT NULL,
            prompt TEXT NOT NULL,
            options_json TEXT,
            answer_json TEXT,
            meta_json TEXT,
            FOREIGN KEY(skill_id) REFERENCES skills(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_skill ON questions(skill_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS entitlements(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            skill_id TEXT NOT NULL,
            allowed INTEGER NOT NULL DEFAULT 0,
            unlocked_at TEXT,
            locked_reason TEXT,
            UNIQUE(student_id, skill_id),
            FOREIGN KEY(student_id) REFERENCES users(id),
            FOREIGN KEY(skill_id) REFERENCES skills(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entitlements_student ON entitlements(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attempts(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            skill_id TEXT NOT NULL,
            iso_year INTEGER NOT NULL,
            iso_week INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            duration_sec INTEGER,
            score REAL,
            correct_count INTEGER,
            total_count INTEGER,
            passed INTEGER,
            answers_json TEXT,
            report_path TEXT,
            report_sha256 TEXT,
            FOREIGN KEY(student_id) REFERENCES users(id),
            FOREIGN KEY(teacher_id) REFERENCES users(id),
            FOREIGN KEY(skill_id) REFERENCES skills(id)
        )",
        [],
    )?;
    // Workspaces created before artifact digests were recorded lack the column.
    ensure_attempts_report_sha256(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attempts_student ON attempts(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attempts_teacher ON attempts(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attempts_student_week ON attempts(student_id, iso_year, iso_week)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attempts_student_skill ON attempts(student_id, skill_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS remediation_uploads(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            skill_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            stored_path TEXT NOT NULL,
            uploaded_at TEXT NOT NULL,
            note TEXT,
            FOREIGN KEY(teacher_id) REFERENCES users(id),
            FOREIGN KEY(student_id) REFERENCES users(id),
            FOREIGN KEY(skill_id) REFERENCES skills(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_remediation_student_skill
         ON remediation_uploads(student_id, skill_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_attempts_report_sha256(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "attempts", "report_sha256")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE attempts ADD COLUMN report_sha256 TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeeklyScope {
    Student,
    StudentSkill,
}

#[derive(Debug, Clone, Copy)]
pub struct WeeklyAccess {
    pub limit: i64,
    pub scope: WeeklyScope,
}

/// Weekly attempt quota. Defaults to one attempt per student per ISO week.
pub fn weekly_access(conn: &Connection) -> anyhow::Result<WeeklyAccess> {
    let mut access = WeeklyAccess {
        limit: 1,
        scope: WeeklyScope::Student,
    };
    if let Some(v) = settings_get_json(conn, "access.weekly")? {
        if let Some(limit) = v.get("limit").and_then(|x| x.as_i64()) {
            access.limit = limit;
        }
        if let Some("student_skill") = v.get("scope").and_then(|x| x.as_str()) {
            access.scope = WeeklyScope::StudentSkill;
        }
    }
    Ok(access)
}

/// Fallback time box for skills without their own duration.
pub fn default_duration_min(conn: &Connection) -> anyhow::Result<i64> {
    let configured = settings_get_json(conn, "test.defaults")?
        .and_then(|v| v.get("durationMin").and_then(|x| x.as_i64()));
    Ok(configured.unwrap_or(20))
}

pub fn school_name(conn: &Connection) -> anyhow::Result<String> {
    let configured =
        settings_get_json(conn, "school.name")?.and_then(|v| v.as_str().map(|s| s.to_string()));
    Ok(configured.unwrap_or_else(|| "Al Thaghr School".to_string()))
}
