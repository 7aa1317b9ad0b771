use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::gating;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, db_err, opt_bool, opt_str, owned_student, principal, require_role, required_str,
};
use crate::ipc::types::{AppState, Request, Role};

fn handle_entitlements_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let p = match principal(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match p.role {
        Role::Teacher => {
            if let Err(resp) = owned_student(conn, req, &p.user_id, &student_id) {
                return resp;
            }
        }
        Role::Chairman => {}
        Role::Student => {
            if p.user_id != student_id {
                return err(&req.id, "not_found", "student not found", None);
            }
        }
    }

    let mut stmt = match conn.prepare(
        "SELECT e.skill_id, s.name, s.order_index, e.allowed, e.unlocked_at, e.locked_reason
         FROM entitlements e JOIN skills s ON s.id = e.skill_id
         WHERE e.student_id = ?
         ORDER BY s.order_index",
    ) {
        Ok(s) => s,
        Err(e) => return db_err(req, e),
    };
    let entitlements = match stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "skillId": r.get::<_, String>(0)?,
                "skillName": r.get::<_, String>(1)?,
                "orderIndex": r.get::<_, i64>(2)?,
                "allowed": r.get::<_, i64>(3)? != 0,
                "unlockedAt": r.get::<_, Option<String>>(4)?,
                "lockedReason": r.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };

    ok(&req.id, json!({ "entitlements": entitlements }))
}

fn handle_gating_check(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let skill_id = match required_str(req, "skillId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = owned_student(conn, req, &p.user_id, &student_id) {
        return resp;
    }

    match gating::can_unlock(conn, &p.user_id, &student_id, &skill_id) {
        Ok(decision) => ok(
            &req.id,
            json!({ "canUnlock": decision.allowed, "reason": decision.reason }),
        ),
        Err(e) => db_err(req, e),
    }
}

fn handle_entitlements_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let p = match principal(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let skill_id = match required_str(req, "skillId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(allowed) = opt_bool(req, "allowed") else {
        return err(&req.id, "bad_params", "missing allowed", None);
    };
    let locked_reason = opt_str(req, "lockedReason").filter(|s| !s.trim().is_empty());

    match p.role {
        Role::Teacher => {
            if let Err(resp) = owned_student(conn, req, &p.user_id, &student_id) {
                return resp;
            }
            if allowed {
                // Sequential-mastery gate applies to the teacher path only.
                match gating::can_unlock(conn, &p.user_id, &student_id, &skill_id) {
                    Ok(decision) if !decision.allowed => {
                        return err(&req.id, "unlock_refused", decision.reason, None);
                    }
                    Ok(_) => {}
                    Err(e) => return db_err(req, e),
                }
            }
        }
        // Chairman catalog tooling bypasses the gate.
        Role::Chairman => {
            let exists: Option<String> = match conn
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
            if exists.is_none() {
                return err(&req.id, "not_found", "student not found", None);
            }
        }
        Role::Student => return err(&req.id, "forbidden", "teacher or chairman access only", None),
    }

    let skill_exists: Option<String> = match conn
        .query_row("SELECT id FROM skills WHERE id = ?", [&skill_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    if skill_exists.is_none() {
        return err(&req.id, "not_found", "skill not found", None);
    }

    let existing: Option<(String, Option<String>)> = match conn
        .query_row(
            "SELECT id, unlocked_at FROM entitlements WHERE student_id = ? AND skill_id = ?",
            (&student_id, &skill_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };

    let write = match existing {
        Some((entitlement_id, unlocked_at)) => {
            // `unlocked_at` is written once, on the first grant, and kept
            // through later locks for auditing.
            let stamp = if allowed && unlocked_at.is_none() {
                Some(Utc::now().to_rfc3339())
            } else {
                unlocked_at
            };
            let reason = if allowed { None } else { locked_reason };
            conn.execute(
                "UPDATE entitlements SET allowed = ?, unlocked_at = ?, locked_reason = ?
                 WHERE id = ?",
                (allowed as i64, stamp, reason, &entitlement_id),
            )
        }
        None => {
            let stamp = allowed.then(|| Utc::now().to_rfc3339());
            let reason = if allowed { None } else { locked_reason };
            conn.execute(
                "INSERT INTO entitlements(id, student_id, skill_id, allowed, unlocked_at, locked_reason)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &student_id,
                    &skill_id,
                    allowed as i64,
                    stamp,
                    reason,
                ),
            )
        }
    };
    if let Err(e) = write {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "skillId": skill_id, "allowed": allowed }),
    )
}

fn handle_remediation_add(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let skill_id = match required_str(req, "skillId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let filename = match required_str(req, "filename") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let stored_path = match required_str(req, "storedPath") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let note = opt_str(req, "note").filter(|s| !s.trim().is_empty());

    if let Err(resp) = owned_student(conn, req, &p.user_id, &student_id) {
        return resp;
    }
    let skill_exists: Option<String> = match conn
        .query_row("SELECT id FROM skills WHERE id = ?", [&skill_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    if skill_exists.is_none() {
        return err(&req.id, "not_found", "skill not found", None);
    }

    let upload_id = Uuid::new_v4().to_string();
    let uploaded_at = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO remediation_uploads(id, teacher_id, student_id, skill_id, filename, stored_path, uploaded_at, note)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &upload_id,
            &p.user_id,
            &student_id,
            &skill_id,
            &filename,
            &stored_path,
            &uploaded_at,
            &note,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "uploadId": upload_id, "uploadedAt": uploaded_at }),
    )
}

fn handle_remediation_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let p = match principal(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match p.role {
        Role::Teacher => {
            if let Err(resp) = owned_student(conn, req, &p.user_id, &student_id) {
                return resp;
            }
        }
        Role::Chairman => {}
        Role::Student => {
            if p.user_id != student_id {
                return err(&req.id, "not_found", "student not found", None);
            }
        }
    }

    let mut stmt = match conn.prepare(
        "SELECT r.id, r.teacher_id, r.skill_id, s.name, r.filename, r.stored_path, r.uploaded_at, r.note
         FROM remediation_uploads r JOIN skills s ON s.id = r.skill_id
         WHERE r.student_id = ?
         ORDER BY r.uploaded_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return db_err(req, e),
    };
    let uploads = match stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "teacherId": r.get::<_, String>(1)?,
                "skillId": r.get::<_, String>(2)?,
                "skillName": r.get::<_, String>(3)?,
                "filename": r.get::<_, String>(4)?,
                "storedPath": r.get::<_, String>(5)?,
                "uploadedAt": r.get::<_, String>(6)?,
                "note": r.get::<_, Option<String>>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };

    ok(&req.id, json!({ "uploads": uploads }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "entitlements.list" => Some(handle_entitlements_list(state, req)),
        "entitlements.set" => Some(handle_entitlements_set(state, req)),
        "gating.check" => Some(handle_gating_check(state, req)),
        "remediation.add" => Some(handle_remediation_add(state, req)),
        "remediation.list" => Some(handle_remediation_list(state, req)),
        _ => None,
    }
}
