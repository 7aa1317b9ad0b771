use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::db::{self, WeeklyScope};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, db_err, opt_bool, opt_i64, opt_str, principal, require_role, required_str};
use crate::ipc::types::{AppState, Request, Role};
use crate::report::{self, FsReportRenderer, OutboxNotifier, ReportInput, ReportRenderer, ReportSummary};
use crate::scoring;

struct QuestionRow {
    id: String,
    qtype: String,
    prompt: String,
    options_json: Option<String>,
    answer_json: Option<String>,
    meta_json: Option<String>,
}

fn load_questions(conn: &Connection, skill_id: &str) -> anyhow::Result<Vec<QuestionRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, qtype, prompt, options_json, answer_json, meta_json
         FROM questions WHERE skill_id = ? ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([skill_id], |r| {
            Ok(QuestionRow {
                id: r.get(0)?,
                qtype: r.get(1)?,
                prompt: r.get(2)?,
                options_json: r.get(3)?,
                answer_json: r.get(4)?,
                meta_json: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// `(skill_name, score)` pairs over every finished attempt, the input of
/// the lacking-skills derivation.
fn finished_history(conn: &Connection, student_id: &str) -> anyhow::Result<Vec<(String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT s.name, a.score FROM attempts a
         JOIN skills s ON s.id = a.skill_id
         WHERE a.student_id = ? AND a.finished_at IS NOT NULL",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<f64>>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(name, score)| (name, score.unwrap_or(0.0)))
        .collect())
}

fn handle_attempts_start(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let p = match principal(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(req, &p, Role::Student) {
        return resp;
    }
    let skill_id = match required_str(req, "skillId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let student: Option<Option<String>> = match conn
        .query_row(
            "SELECT teacher_id FROM users WHERE id = ? AND role = 'student'",
            [&p.user_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    let Some(teacher_id) = student else {
        return err(&req.id, "not_found", "student not found", None);
    };
    let Some(teacher_id) = teacher_id else {
        return err(
            &req.id,
            "no_teacher_assigned",
            "No teacher selected. Ask the chairman to assign your teacher.",
            None,
        );
    };

    let allowed: Option<i64> = match conn
        .query_row(
            "SELECT allowed FROM entitlements WHERE student_id = ? AND skill_id = ?",
            (&p.user_id, &skill_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    if allowed != Some(1) {
        return err(
            &req.id,
            "skill_locked",
            "This skill is locked. Your teacher must allow it.",
            None,
        );
    }

    let now = Utc::now();
    let (iso_year, iso_week) = scoring::iso_year_week(now);
    let access = match db::weekly_access(conn) {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    let used: i64 = {
        let count = match access.scope {
            WeeklyScope::Student => conn.query_row(
                "SELECT COUNT(*) FROM attempts
                 WHERE student_id = ? AND iso_year = ? AND iso_week = ?",
                (&p.user_id, iso_year, iso_week),
                |r| r.get(0),
            ),
            WeeklyScope::StudentSkill => conn.query_row(
                "SELECT COUNT(*) FROM attempts
                 WHERE student_id = ? AND iso_year = ? AND iso_week = ? AND skill_id = ?",
                (&p.user_id, iso_year, iso_week, &skill_id),
                |r| r.get(0),
            ),
        };
        match count {
            Ok(v) => v,
            Err(e) => return db_err(req, e),
        }
    };
    if used >= access.limit {
        return err(
            &req.id,
            "weekly_limit_reached",
            "Weekly access limit reached.",
            Some(json!({ "limit": access.limit, "used": used })),
        );
    }

    let skill: Option<(String, Option<i64>)> = match conn
        .query_row(
            "SELECT name, duration_min FROM skills WHERE id = ? AND is_active = 1",
            [&skill_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    let Some((skill_name, duration_min)) = skill else {
        return err(&req.id, "not_found", "skill not found", None);
    };

    let questions = match load_questions(conn, &skill_id) {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    if questions.is_empty() {
        return err(
            &req.id,
            "no_questions",
            "No questions yet for this skill.",
            None,
        );
    }

    let duration_min = match duration_min {
        Some(v) => v,
        None => match db::default_duration_min(conn) {
            Ok(v) => v,
            Err(e) => return db_err(req, e),
        },
    };

    let attempt_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO attempts(id, student_id, teacher_id, skill_id, iso_year, iso_week, started_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &attempt_id,
            &p.user_id,
            &teacher_id,
            &skill_id,
            iso_year,
            iso_week,
            now.to_rfc3339(),
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    // Display payload only: answer keys never leave the daemon here.
    let question_views: Vec<serde_json::Value> = questions
        .iter()
        .map(|q| {
            json!({
                "id": q.id,
                "qtype": q.qtype,
                "prompt": q.prompt,
                "options": q.options_json.as_deref()
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok()),
                "meta": q.meta_json.as_deref()
                    .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok()),
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "attemptId": attempt_id,
            "skillId": skill_id,
            "skillName": skill_name,
            "durationMin": duration_min,
            "startedAt": now.to_rfc3339(),
            "isoYear": iso_year,
            "isoWeek": iso_week,
            "questions": question_views,
        }),
    )
}

/// Result payload for a finished attempt, rebuilt from the stored row so
/// a replayed submit returns byte-identical scoring.
fn finished_result(
    conn: &Connection,
    req: &Request,
    attempt_id: &str,
) -> Result<serde_json::Value, serde_json::Value> {
    let row: Option<(String, String, String, Option<String>, Option<i64>, Option<f64>, Option<i64>, Option<i64>, Option<i64>, Option<String>, Option<String>)> =
        conn.query_row(
            "SELECT a.student_id, a.skill_id, a.started_at, a.finished_at, a.duration_sec,
                    a.score, a.correct_count, a.total_count, a.passed, a.answers_json, a.report_path
             FROM attempts a WHERE a.id = ?",
            [attempt_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                    r.get(9)?,
                    r.get(10)?,
                ))
            },
        )
        .optional()
        .map_err(|e| db_err(req, e))?;
    let Some((
        student_id,
        skill_id,
        started_at,
        finished_at,
        duration_sec,
        score,
        correct_count,
        total_count,
        passed,
        answers_json,
        report_path,
    )) = row
    else {
        return Err(err(&req.id, "not_found", "attempt not found", None));
    };

    let skill_name: String = conn
        .query_row("SELECT name FROM skills WHERE id = ?", [&skill_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| db_err(req, e))?
        .unwrap_or_else(|| "-".to_string());

    let history = finished_history(conn, &student_id).map_err(|e| db_err(req, e))?;
    let lacking = scoring::lacking_skills(&history);

    let score = score.unwrap_or(0.0);
    let answers = answers_json
        .as_deref()
        .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
        .unwrap_or_else(|| json!([]));

    Ok(json!({
        "attemptId": attempt_id,
        "skillId": skill_id,
        "skillName": skill_name,
        "startedAt": started_at,
        "finishedAt": finished_at,
        "durationSec": duration_sec,
        "score": score,
        "scorePct": (score * 100.0).round() as i64,
        "correct": correct_count.unwrap_or(0),
        "total": total_count.unwrap_or(0),
        "passed": passed == Some(1),
        "lackingSkills": lacking,
        "reportPath": report_path,
        "answers": answers,
    }))
}

fn handle_attempts_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let p = match principal(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_role(req, &p, Role::Student) {
        return resp;
    }
    let attempt_id = match required_str(req, "attemptId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let row: Option<(String, String, String, String, Option<String>)> = match conn
        .query_row(
            "SELECT student_id, teacher_id, skill_id, started_at, finished_at
             FROM attempts WHERE id = ?",
            [&attempt_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    let Some((student_id, teacher_id, skill_id, started_at_raw, finished_at)) = row else {
        return err(&req.id, "not_found", "attempt not found", None);
    };
    if student_id != p.user_id {
        // Ownership failures read as absence; existence must not leak.
        return err(&req.id, "not_found", "attempt not found", None);
    }

    // Idempotent replay: a finished attempt's result is returned as-is,
    // with no second scoring or report side effect.
    if finished_at.is_some() {
        return match finished_result(conn, req, &attempt_id) {
            Ok(result) => ok(&req.id, result),
            Err(resp) => resp,
        };
    }

    let skill: Option<(String, Option<i64>, Option<i64>)> = match conn
        .query_row(
            "SELECT name, duration_min, pass_pct FROM skills WHERE id = ?",
            [&skill_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    let Some((skill_name, duration_min, pass_pct)) = skill else {
        return err(&req.id, "not_found", "skill not found", None);
    };
    let duration_min = match duration_min {
        Some(v) => v,
        None => match db::default_duration_min(conn) {
            Ok(v) => v,
            Err(e) => return db_err(req, e),
        },
    };

    let Some(started_at) = parse_instant(&started_at_raw) else {
        return err(&req.id, "internal", "corrupt attempt start timestamp", None);
    };
    let now = Utc::now();
    let finished = scoring::clamp_finish(started_at, now, duration_min);
    let duration_sec = (finished - started_at).num_seconds();

    let questions = match load_questions(conn, &skill_id) {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    let submitted = req.params.get("answers");

    let mut records = Vec::with_capacity(questions.len());
    let mut correct: i64 = 0;
    for q in &questions {
        let qtype = scoring::QuestionType::parse(&q.qtype);
        let key = scoring::parse_answer_key(qtype, q.answer_json.as_deref());
        let raw = submitted.and_then(|a| a.get(&q.id));
        let answer = scoring::parse_submitted(raw);
        let record = scoring::score_question(&q.id, &q.prompt, &q.qtype, &key, &answer);
        if record.is_correct {
            correct += 1;
        }
        records.push(record);
    }
    let total = questions.len() as i64;
    let score = if total > 0 {
        correct as f64 / total as f64
    } else {
        0.0
    };
    let passed = scoring::is_passing(score, pass_pct);

    let answers_json = match serde_json::to_string(&records) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "internal", e.to_string(), None),
    };

    // Conditional update guards the open -> finished transition; a racing
    // duplicate submit loses the race and replays the winner's result.
    let changed = match conn.execute(
        "UPDATE attempts
         SET finished_at = ?, duration_sec = ?, score = ?, correct_count = ?, total_count = ?,
             passed = ?, answers_json = ?
         WHERE id = ? AND finished_at IS NULL",
        (
            finished.to_rfc3339(),
            duration_sec,
            score,
            correct,
            total,
            passed as i64,
            &answers_json,
            &attempt_id,
        ),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };
    if changed == 0 {
        return match finished_result(conn, req, &attempt_id) {
            Ok(result) => ok(&req.id, result),
            Err(resp) => resp,
        };
    }

    let history = match finished_history(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    let lacking = scoring::lacking_skills(&history);

    let student_name: String = conn
        .query_row("SELECT name FROM users WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .unwrap_or_else(|_| "-".to_string());
    let teacher: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT name, email FROM users WHERE id = ? AND role = 'teacher'",
            [&teacher_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .unwrap_or(None);
    let teacher_name = teacher
        .as_ref()
        .map(|(name, _)| name.clone())
        .unwrap_or_else(|| "-".to_string());

    let mut report_path: Option<String> = None;
    if let Some(workspace) = state.workspace.as_ref() {
        let school_name = db::school_name(conn).unwrap_or_else(|_| "-".to_string());
        let input = ReportInput {
            attempt_id: attempt_id.clone(),
            school_name,
            student_id: student_id.clone(),
            student_name: student_name.clone(),
            teacher_name: teacher_name.clone(),
            skill_name: skill_name.clone(),
            started_at,
            finished_at: finished,
            duration_sec,
            answers: records.clone(),
            summary: ReportSummary {
                score_pct: (score * 100.0).round() as i64,
                correct,
                total,
                lacking_skills: lacking.clone(),
            },
        };
        match FsReportRenderer::new(workspace).render(&input) {
            Ok(rendered) => {
                if let Err(e) = conn.execute(
                    "UPDATE attempts SET report_path = ?, report_sha256 = ? WHERE id = ?",
                    (&rendered.path, &rendered.sha256, &attempt_id),
                ) {
                    tracing::warn!(attempt = %attempt_id, error = %e, "failed to record report reference");
                } else {
                    report_path = Some(rendered.path);
                }
            }
            // The attempt is already scored; a broken renderer must not
            // undo the submission.
            Err(e) => tracing::warn!(attempt = %attempt_id, error = %e, "report render failed"),
        }

        if let Some((_, Some(email))) = teacher {
            let smtp = report::smtp_from_settings(conn).unwrap_or(None);
            let notifier = Box::new(OutboxNotifier::new(workspace, smtp));
            report::notify_in_background(
                notifier,
                email,
                format!("Student test report - {} - {}", student_name, skill_name),
                "Attached is the report for the completed test.".to_string(),
                report_path.clone().unwrap_or_default(),
            );
        }
    }

    ok(
        &req.id,
        json!({
            "attemptId": attempt_id,
            "skillId": skill_id,
            "skillName": skill_name,
            "startedAt": started_at.to_rfc3339(),
            "finishedAt": finished.to_rfc3339(),
            "durationSec": duration_sec,
            "score": score,
            "scorePct": (score * 100.0).round() as i64,
            "correct": correct,
            "total": total,
            "passed": passed,
            "lackingSkills": lacking,
            "reportPath": report_path,
            "answers": serde_json::to_value(&records).unwrap_or_else(|_| json!([])),
        }),
    )
}

fn handle_attempts_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let p = match principal(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let attempt_id = match required_str(req, "attemptId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let owners: Option<(String, String, Option<String>)> = match conn
        .query_row(
            "SELECT student_id, teacher_id, finished_at FROM attempts WHERE id = ?",
            [&attempt_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    let Some((student_id, teacher_id, finished_at)) = owners else {
        return err(&req.id, "not_found", "attempt not found", None);
    };
    let visible = match p.role {
        Role::Student => p.user_id == student_id,
        Role::Teacher => p.user_id == teacher_id,
        Role::Chairman => true,
    };
    if !visible {
        return err(&req.id, "not_found", "attempt not found", None);
    }
    if finished_at.is_none() {
        return ok(
            &req.id,
            json!({ "attemptId": attempt_id, "finished": false }),
        );
    }

    match finished_result(conn, req, &attempt_id) {
        Ok(mut result) => {
            result["finished"] = json!(true);
            ok(&req.id, result)
        }
        Err(resp) => resp,
    }
}

fn handle_attempts_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let p = match principal(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let mut conditions: Vec<&str> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    match p.role {
        Role::Student => {
            conditions.push("a.student_id = ?");
            params.push(Value::Text(p.user_id.clone()));
        }
        Role::Teacher => {
            conditions.push("a.teacher_id = ?");
            params.push(Value::Text(p.user_id.clone()));
            if let Some(student_id) = opt_str(req, "studentId") {
                conditions.push("a.student_id = ?");
                params.push(Value::Text(student_id));
            }
        }
        Role::Chairman => {
            if let Some(student_id) = opt_str(req, "studentId") {
                conditions.push("a.student_id = ?");
                params.push(Value::Text(student_id));
            }
            if let Some(teacher_id) = opt_str(req, "teacherId") {
                conditions.push("a.teacher_id = ?");
                params.push(Value::Text(teacher_id));
            }
        }
    }
    if opt_bool(req, "finishedOnly").unwrap_or(false) {
        conditions.push("a.finished_at IS NOT NULL");
    }
    let limit = opt_i64(req, "limit").unwrap_or(200).clamp(1, 1000);
    params.push(Value::Integer(limit));

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    let sql = format!(
        "SELECT a.id, a.student_id, a.teacher_id, a.skill_id, s.name,
                a.iso_year, a.iso_week, a.started_at, a.finished_at, a.duration_sec,
                a.score, a.correct_count, a.total_count, a.passed, a.report_path
         FROM attempts a JOIN skills s ON s.id = a.skill_id
         {} ORDER BY a.started_at DESC LIMIT ?",
        where_clause
    );

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return db_err(req, e),
    };
    let attempts = match stmt
        .query_map(params_from_iter(params), |r| {
            let score: Option<f64> = r.get(10)?;
            let passed: Option<i64> = r.get(13)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "teacherId": r.get::<_, String>(2)?,
                "skillId": r.get::<_, String>(3)?,
                "skillName": r.get::<_, String>(4)?,
                "isoYear": r.get::<_, i64>(5)?,
                "isoWeek": r.get::<_, i64>(6)?,
                "startedAt": r.get::<_, String>(7)?,
                "finishedAt": r.get::<_, Option<String>>(8)?,
                "durationSec": r.get::<_, Option<i64>>(9)?,
                "score": score,
                "correct": r.get::<_, Option<i64>>(11)?,
                "total": r.get::<_, Option<i64>>(12)?,
                "passed": passed.map(|v| v != 0),
                "reportPath": r.get::<_, Option<String>>(14)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };

    ok(&req.id, json!({ "attempts": attempts }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attempts.start" => Some(handle_attempts_start(state, req)),
        "attempts.submit" => Some(handle_attempts_submit(state, req)),
        "attempts.get" => Some(handle_attempts_get(state, req)),
        "attempts.list" => Some(handle_attempts_list(state, req)),
        _ => None,
    }
}
