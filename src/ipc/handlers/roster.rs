use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, db_err, opt_str, principal, require_role};
use crate::ipc::types::{AppState, Request, Role};

fn handle_teachers_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let p = match principal(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(req, &p, Role::Chairman) {
        return resp;
    }

    let teacher_id = match opt_str(req, "teacherId").filter(|s| !s.trim().is_empty()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing teacherId", None),
    };
    let name = match opt_str(req, "name").filter(|s| !s.trim().is_empty()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    let email = opt_str(req, "email").filter(|s| !s.trim().is_empty());

    let exists: Option<String> = match conn
        .query_row("SELECT id FROM users WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    if exists.is_some() {
        return err(&req.id, "already_exists", "user id already exists", None);
    }

    if let Err(e) = conn.execute(
        "INSERT INTO users(id, role, name, email) VALUES(?, 'teacher', ?, ?)",
        (&teacher_id, name.trim(), &email),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "teacherId": teacher_id }))
}

/// Creates any missing entitlement rows for one student across the active
/// catalog. Only the first skill in the sequence starts unlocked.
fn seed_entitlements(conn: &Connection, student_id: &str) -> anyhow::Result<()> {
    let mut stmt =
        conn.prepare("SELECT id, order_index FROM skills WHERE is_active = 1 ORDER BY order_index")?;
    let skills = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    for (skill_id, order_index) in skills {
        let allowed = order_index == 1;
        let unlocked_at = allowed.then(|| Utc::now().to_rfc3339());
        conn.execute(
            "INSERT INTO entitlements(id, student_id, skill_id, allowed, unlocked_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(student_id, skill_id) DO NOTHING",
            (
                Uuid::new_v4().to_string(),
                student_id,
                &skill_id,
                allowed as i64,
                unlocked_at,
            ),
        )?;
    }
    Ok(())
}

fn handle_students_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let p = match principal(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(req, &p, Role::Chairman) {
        return resp;
    }

    let Some(rows) = req.params.get("rows").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing rows", None);
    };

    let mut created: i64 = 0;
    let mut updated: i64 = 0;

    for row in rows {
        let student_id = row
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let name = row
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let teacher_id = row
            .get("teacherId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        if student_id.is_empty() || name.is_empty() {
            continue;
        }

        let existing: Option<String> = match conn
            .query_row(
                "SELECT id FROM users WHERE id = ? AND role = 'student'",
                [&student_id],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return db_err(req, e),
        };

        let write = if existing.is_some() {
            // Keep the current teacher when the row omits one.
            conn.execute(
                "UPDATE users SET name = ?, teacher_id = COALESCE(?, teacher_id) WHERE id = ?",
                (&name, &teacher_id, &student_id),
            )
            .map(|_| updated += 1)
        } else {
            conn.execute(
                "INSERT INTO users(id, role, name, teacher_id) VALUES(?, 'student', ?, ?)",
                (&student_id, &name, &teacher_id),
            )
            .map(|_| created += 1)
        };
        if let Err(e) = write {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }

        if let Err(e) = seed_entitlements(conn, &student_id) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "created": created, "updated": updated }))
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let p = match principal(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(req, &p, Role::Chairman) {
        return resp;
    }

    let role_filter = opt_str(req, "role");
    let sql = match &role_filter {
        Some(_) => {
            "SELECT id, role, name, teacher_id, email FROM users WHERE role = ? ORDER BY name"
        }
        None => "SELECT id, role, name, teacher_id, email FROM users ORDER BY role, name",
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return db_err(req, e),
    };

    let map_row = |r: &rusqlite::Row| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "role": r.get::<_, String>(1)?,
            "name": r.get::<_, String>(2)?,
            "teacherId": r.get::<_, Option<String>>(3)?,
            "email": r.get::<_, Option<String>>(4)?,
        }))
    };
    let rows = match &role_filter {
        Some(role) => stmt.query_map([role], map_row),
        None => stmt.query_map([], map_row),
    };
    let users = match rows.and_then(|it| it.collect::<Result<Vec<_>, _>>()) {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };

    ok(&req.id, json!({ "users": users }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let p = match principal(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(req, &p, Role::Teacher) {
        return resp;
    }

    let mut stmt = match conn.prepare(
        "SELECT id, name FROM users WHERE role = 'student' AND teacher_id = ? ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return db_err(req, e),
    };
    let students = match stmt
        .query_map([&p.user_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };

    ok(&req.id, json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.add" => Some(handle_teachers_add(state, req)),
        "students.import" => Some(handle_students_import(state, req)),
        "users.list" => Some(handle_users_list(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        _ => None,
    }
}
