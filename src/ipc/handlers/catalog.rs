use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, db_err, opt_bool, opt_i64, opt_str, principal, require_role, required_str,
};
use crate::ipc::types::{AppState, Principal, Request, Role};
use crate::scoring::QuestionType;

fn handle_skills_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(resp) = principal(req) {
        return resp;
    }

    let include_inactive = opt_bool(req, "includeInactive").unwrap_or(false);
    let sql = if include_inactive {
        "SELECT id, name, order_index, duration_min, pass_pct, is_active
         FROM skills ORDER BY order_index"
    } else {
        "SELECT id, name, order_index, duration_min, pass_pct, is_active
         FROM skills WHERE is_active = 1 ORDER BY order_index"
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return db_err(req, e),
    };
    let skills = match stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "orderIndex": r.get::<_, i64>(2)?,
                "durationMin": r.get::<_, Option<i64>>(3)?,
                "passPct": r.get::<_, Option<i64>>(4)?,
                "isActive": r.get::<_, i64>(5)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };

    ok(&req.id, json!({ "skills": skills }))
}

fn handle_skills_add(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let name = match opt_str(req, "name").filter(|s| !s.trim().is_empty()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    let order_index = match opt_i64(req, "orderIndex") {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing orderIndex", None),
    };
    let duration_min = opt_i64(req, "durationMin").filter(|v| *v > 0);
    let pass_pct = opt_i64(req, "passPct");

    let skill_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO skills(id, name, order_index, duration_min, pass_pct, is_active)
         VALUES(?, ?, ?, ?, ?, 1)",
        (&skill_id, &name, order_index, duration_min, pass_pct),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    // Entitlement rows for the whole roster; only a skill introduced at
    // the head of the sequence starts unlocked.
    let allowed = order_index == 1;
    let unlocked_at = allowed.then(|| chrono::Utc::now().to_rfc3339());
    let students: Vec<String> = match conn
        .prepare("SELECT id FROM users WHERE role = 'student'")
        .and_then(|mut stmt| {
            stmt.query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()
        }) {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    for student_id in &students {
        if let Err(e) = conn.execute(
            "INSERT INTO entitlements(id, student_id, skill_id, allowed, unlocked_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(student_id, skill_id) DO NOTHING",
            (
                Uuid::new_v4().to_string(),
                student_id,
                &skill_id,
                allowed as i64,
                &unlocked_at,
            ),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "skillId": skill_id }))
}

fn handle_skills_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let skill_id = match required_str(req, "skillId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<String> = match conn
        .query_row("SELECT id FROM skills WHERE id = ?", [&skill_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "skill not found", None);
    }

    if let Some(name) = opt_str(req, "name").filter(|s| !s.trim().is_empty()) {
        if let Err(e) = conn.execute(
            "UPDATE skills SET name = ? WHERE id = ?",
            (name.trim(), &skill_id),
        ) {
            return db_err(req, e);
        }
    }
    if let Some(order_index) = opt_i64(req, "orderIndex") {
        if let Err(e) = conn.execute(
            "UPDATE skills SET order_index = ? WHERE id = ?",
            (order_index, &skill_id),
        ) {
            return db_err(req, e);
        }
    }
    if req.params.get("durationMin").is_some() {
        let duration_min = opt_i64(req, "durationMin").filter(|v| *v > 0);
        if let Err(e) = conn.execute(
            "UPDATE skills SET duration_min = ? WHERE id = ?",
            (duration_min, &skill_id),
        ) {
            return db_err(req, e);
        }
    }
    if req.params.get("passPct").is_some() {
        let pass_pct = opt_i64(req, "passPct");
        if let Err(e) = conn.execute(
            "UPDATE skills SET pass_pct = ? WHERE id = ?",
            (pass_pct, &skill_id),
        ) {
            return db_err(req, e);
        }
    }
    if let Some(is_active) = opt_bool(req, "isActive") {
        if let Err(e) = conn.execute(
            "UPDATE skills SET is_active = ? WHERE id = ?",
            (is_active as i64, &skill_id),
        ) {
            return db_err(req, e);
        }
    }

    ok(&req.id, json!({ "skillId": skill_id }))
}

struct ValidQuestion {
    options_json: Option<String>,
    answer_json: String,
}

/// Enforces the per-type answer-key shape at the door so the scorer never
/// sees a key that cannot match its question type.
fn validate_question(
    qtype: &str,
    options: Option<&Vec<String>>,
    answer: Option<&serde_json::Value>,
) -> Result<ValidQuestion, String> {
    let parsed = QuestionType::parse(qtype);
    if parsed == QuestionType::Unknown {
        return Err(format!("unknown qtype: {}", qtype));
    }

    let options_json = match options {
        Some(opts) if !opts.is_empty() => Some(
            serde_json::to_string(opts).map_err(|e| format!("bad options: {}", e))?,
        ),
        _ => None,
    };
    let option_count = options.map(|o| o.len() as i64);

    let in_range = |i: i64| -> bool {
        match option_count {
            Some(n) => i >= 0 && i < n,
            None => i >= 0,
        }
    };
    let as_index = |v: &serde_json::Value| -> Option<i64> {
        match v {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    };

    let answer_json = if parsed.is_single_choice() {
        let idx = answer
            .and_then(as_index)
            .ok_or_else(|| "answer must be a single option index".to_string())?;
        let valid = if parsed == QuestionType::TrueFalse && option_count.is_none() {
            idx == 0 || idx == 1
        } else {
            in_range(idx)
        };
        if !valid {
            return Err(format!("answer index {} out of range", idx));
        }
        idx.to_string()
    } else if parsed == QuestionType::McqMulti {
        let items = answer
            .and_then(|v| v.as_array())
            .ok_or_else(|| "answer must be an array of option indices".to_string())?;
        if items.is_empty() {
            return Err("answer must list at least one option index".to_string());
        }
        let mut indices = Vec::with_capacity(items.len());
        for item in items {
            let idx =
                as_index(item).ok_or_else(|| "answer indices must be integers".to_string())?;
            if !in_range(idx) {
                return Err(format!("answer index {} out of range", idx));
            }
            indices.push(idx);
        }
        serde_json::to_string(&indices).map_err(|e| e.to_string())?
    } else {
        // short_text
        let text = answer
            .and_then(|v| v.as_str())
            .map(|s| s.trim())
            .unwrap_or("");
        if text.is_empty() {
            return Err("short_text answer key must be non-empty".to_string());
        }
        serde_json::to_string(text).map_err(|e| e.to_string())?
    };

    Ok(ValidQuestion {
        options_json,
        answer_json,
    })
}

fn options_from_value(v: Option<&serde_json::Value>) -> Option<Vec<String>> {
    match v {
        Some(serde_json::Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(|x| x.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        ),
        // Import rows carry pipe-joined option cells.
        Some(serde_json::Value::String(s)) => Some(
            s.split('|')
                .map(|x| x.trim().to_string())
                .filter(|x| !x.is_empty())
                .collect(),
        ),
        _ => None,
    }
}

fn require_catalog_editor(req: &Request, p: &Principal) -> Result<(), serde_json::Value> {
    if p.role == Role::Teacher || p.role == Role::Chairman {
        Ok(())
    } else {
        Err(err(&req.id, "forbidden", "teacher or chairman access only", None))
    }
}

fn handle_questions_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let p = match principal(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_catalog_editor(req, &p) {
        return resp;
    }

    let skill_id = match required_str(req, "skillId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let qtype = match required_str(req, "qtype") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let prompt = match opt_str(req, "prompt").filter(|s| !s.trim().is_empty()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing prompt", None),
    };

    let skill_exists: Option<String> = match conn
        .query_row(
            "SELECT id FROM skills WHERE id = ? AND is_active = 1",
            [&skill_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    if skill_exists.is_none() {
        return err(&req.id, "not_found", "skill not found", None);
    }

    let options = options_from_value(req.params.get("options"));
    let valid = match validate_question(&qtype, options.as_ref(), req.params.get("answer")) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let meta_json = req
        .params
        .get("meta")
        .filter(|v| !v.is_null())
        .map(|v| v.to_string());

    let question_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO questions(id, skill_id, qtype, prompt, options_json, answer_json, meta_json)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &question_id,
            &skill_id,
            &qtype,
            &prompt,
            &valid.options_json,
            &valid.answer_json,
            &meta_json,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "questionId": question_id }))
}

fn handle_questions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let p = match principal(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    // Answer keys ride along here, so students never get this view.
    if let Err(resp) = require_catalog_editor(req, &p) {
        return resp;
    }

    let skill_id = opt_str(req, "skillId");
    let limit = opt_i64(req, "limit").unwrap_or(200).clamp(1, 1000);

    let sql = match &skill_id {
        Some(_) => {
            "SELECT id, skill_id, qtype, prompt, options_json, answer_json, meta_json
             FROM questions WHERE skill_id = ? ORDER BY rowid DESC LIMIT ?"
        }
        None => {
            "SELECT id, skill_id, qtype, prompt, options_json, answer_json, meta_json
             FROM questions ORDER BY rowid DESC LIMIT ?"
        }
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return db_err(req, e),
    };

    let map_row = |r: &rusqlite::Row| -> rusqlite::Result<serde_json::Value> {
        let options_json: Option<String> = r.get(4)?;
        let answer_json: Option<String> = r.get(5)?;
        let meta_json: Option<String> = r.get(6)?;
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "skillId": r.get::<_, String>(1)?,
            "qtype": r.get::<_, String>(2)?,
            "prompt": r.get::<_, String>(3)?,
            "options": options_json
                .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok()),
            "answer": answer_json
                .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok()),
            "meta": meta_json
                .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok()),
        }))
    };
    let rows = match &skill_id {
        Some(sid) => stmt.query_map(rusqlite::params![sid, limit], map_row),
        None => stmt.query_map([limit], map_row),
    };
    let questions = match rows.and_then(|it| it.collect::<Result<Vec<_>, _>>()) {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };

    ok(&req.id, json!({ "questions": questions }))
}

fn handle_questions_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let p = match principal(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_catalog_editor(req, &p) {
        return resp;
    }

    let Some(rows) = req.params.get("rows").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing rows", None);
    };
    let default_skill_id = opt_str(req, "defaultSkillId");

    let mut created: i64 = 0;
    let mut skipped: i64 = 0;

    for row in rows {
        let qtype = row
            .get("qtype")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let prompt = row
            .get("prompt")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if qtype.is_empty() || prompt.is_empty() {
            skipped += 1;
            continue;
        }

        // Row skill id, then row skill name, then the import default.
        let mut skill_id = row
            .get("skillId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if skill_id.is_none() {
            if let Some(name) = row
                .get("skillName")
                .and_then(|v| v.as_str())
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
            {
                skill_id = match conn
                    .query_row("SELECT id FROM skills WHERE name = ?", [name], |r| {
                        r.get::<_, String>(0)
                    })
                    .optional()
                {
                    Ok(v) => v,
                    Err(e) => return db_err(req, e),
                };
            }
        }
        let skill_id = match skill_id.or_else(|| default_skill_id.clone()) {
            Some(v) => v,
            None => {
                skipped += 1;
                continue;
            }
        };
        let known: Option<String> = match conn
            .query_row("SELECT id FROM skills WHERE id = ?", [&skill_id], |r| {
                r.get(0)
            })
            .optional()
        {
            Ok(v) => v,
            Err(e) => return db_err(req, e),
        };
        if known.is_none() {
            skipped += 1;
            continue;
        }

        let options = options_from_value(row.get("options"));
        let valid = match validate_question(&qtype, options.as_ref(), row.get("answer")) {
            Ok(v) => v,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        let meta_json = row
            .get("meta")
            .filter(|v| !v.is_null())
            .map(|v| v.to_string());

        if let Err(e) = conn.execute(
            "INSERT INTO questions(id, skill_id, qtype, prompt, options_json, answer_json, meta_json)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &skill_id,
                &qtype,
                &prompt,
                &valid.options_json,
                &valid.answer_json,
                &meta_json,
            ),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        created += 1;
    }

    ok(&req.id, json!({ "created": created, "skipped": skipped }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "skills.list" => Some(handle_skills_list(state, req)),
        "skills.add" => Some(handle_skills_add(state, req)),
        "skills.update" => Some(handle_skills_update(state, req)),
        "questions.add" => Some(handle_questions_add(state, req)),
        "questions.list" => Some(handle_questions_list(state, req)),
        "questions.import" => Some(handle_questions_import(state, req)),
        _ => None,
    }
}
