use rusqlite::{Connection, OptionalExtension};

use crate::ipc::error::err;
use crate::ipc::types::{AppState, Principal, Request, Role};

pub fn db_conn<'a>(
    state: &'a AppState,
    req: &Request,
) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn opt_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

pub fn opt_i64(req: &Request, key: &str) -> Option<i64> {
    req.params.get(key).and_then(|v| v.as_i64())
}

pub fn opt_bool(req: &Request, key: &str) -> Option<bool> {
    req.params.get(key).and_then(|v| v.as_bool())
}

pub fn principal(req: &Request) -> Result<Principal, serde_json::Value> {
    Principal::from_params(&req.params)
        .ok_or_else(|| err(&req.id, "bad_params", "missing or malformed principal", None))
}

pub fn require_role(
    req: &Request,
    p: &Principal,
    role: Role,
) -> Result<(), serde_json::Value> {
    if p.role == role {
        Ok(())
    } else {
        Err(err(
            &req.id,
            "forbidden",
            format!("{} access only", role.as_str()),
            None,
        ))
    }
}

/// Resolves a student owned by `teacher_id`. Missing and not-owned both
/// answer `not_found` so one teacher cannot probe another's roster.
pub fn owned_student(
    conn: &Connection,
    req: &Request,
    teacher_id: &str,
    student_id: &str,
) -> Result<String, serde_json::Value> {
    let name: Option<String> = conn
        .query_row(
            "SELECT name FROM users WHERE id = ? AND role = 'student' AND teacher_id = ?",
            (student_id, teacher_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    name.ok_or_else(|| err(&req.id, "not_found", "student not found", None))
}

pub fn db_err(req: &Request, e: impl std::fmt::Display) -> serde_json::Value {
    err(&req.id, "db_query_failed", e.to_string(), None)
}
