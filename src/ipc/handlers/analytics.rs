use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, db_err, opt_str, owned_student, principal, require_role};
use crate::ipc::types::{AppState, Request, Role};
use crate::scoring;

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

fn mean(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

/// Per-skill progress rows for the student dashboard: allowed flag,
/// finished-attempt count, best percent, last finished timestamp.
fn handle_student_progress(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let p = match principal(req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let student_id = match p.role {
        Role::Student => p.user_id.clone(),
        Role::Teacher => {
            let Some(student_id) = opt_str(req, "studentId") else {
                return err(&req.id, "bad_params", "missing studentId", None);
            };
            if let Err(resp) = owned_student(conn, req, &p.user_id, &student_id) {
                return resp;
            }
            student_id
        }
        Role::Chairman => match opt_str(req, "studentId") {
            Some(v) => v,
            None => return err(&req.id, "bad_params", "missing studentId", None),
        },
    };

    let allowed_by_skill: HashMap<String, bool> = {
        let mut stmt = match conn
            .prepare("SELECT skill_id, allowed FROM entitlements WHERE student_id = ?")
        {
            Ok(s) => s,
            Err(e) => return db_err(req, e),
        };
        match stmt
            .query_map([&student_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0))
            })
            .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        {
            Ok(v) => v,
            Err(e) => return db_err(req, e),
        }
    };

    struct FinishedAttempt {
        skill_id: String,
        score: f64,
        finished_at: String,
    }
    let finished: Vec<FinishedAttempt> = {
        let mut stmt = match conn.prepare(
            "SELECT skill_id, score, finished_at FROM attempts
             WHERE student_id = ? AND finished_at IS NOT NULL
             ORDER BY finished_at",
        ) {
            Ok(s) => s,
            Err(e) => return db_err(req, e),
        };
        match stmt
            .query_map([&student_id], |r| {
                Ok(FinishedAttempt {
                    skill_id: r.get(0)?,
                    score: r.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                    finished_at: r.get(2)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return db_err(req, e),
        }
    };

    let mut stmt = match conn
        .prepare("SELECT id, name, order_index FROM skills WHERE is_active = 1 ORDER BY order_index")
    {
        Ok(s) => s,
        Err(e) => return db_err(req, e),
    };
    let skills: Vec<(String, String, i64)> = match stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };

    let mut history: Vec<(String, f64)> = Vec::with_capacity(finished.len());
    let by_name: HashMap<&str, &str> = skills
        .iter()
        .map(|(id, name, _)| (id.as_str(), name.as_str()))
        .collect();
    for a in &finished {
        if let Some(name) = by_name.get(a.skill_id.as_str()) {
            history.push((name.to_string(), a.score));
        }
    }

    let progress: Vec<serde_json::Value> = skills
        .iter()
        .map(|(skill_id, name, order_index)| {
            let sk: Vec<&FinishedAttempt> = finished
                .iter()
                .filter(|a| &a.skill_id == skill_id)
                .collect();
            let best = sk
                .iter()
                .map(|a| a.score)
                .fold(0.0_f64, f64::max);
            json!({
                "skillId": skill_id,
                "skillName": name,
                "orderIndex": order_index,
                // Missing entitlement row reads as locked.
                "allowed": allowed_by_skill.get(skill_id).copied().unwrap_or(false),
                "times": sk.len(),
                "bestPct": (best * 100.0).round() as i64,
                "last": sk.last().map(|a| a.finished_at.clone()),
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "progress": progress,
            "lackingSkills": scoring::lacking_skills(&history),
        }),
    )
}

fn finished_scores_by(
    conn: &Connection,
    column: &str,
) -> anyhow::Result<HashMap<String, Vec<f64>>> {
    // column is one of our own literals, never caller input.
    let sql = format!(
        "SELECT {}, score FROM attempts WHERE finished_at IS NOT NULL",
        column
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<f64>>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut grouped: HashMap<String, Vec<f64>> = HashMap::new();
    for (id, score) in rows {
        grouped.entry(id).or_default().push(score.unwrap_or(0.0));
    }
    Ok(grouped)
}

fn handle_teacher_overview(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let finished: Vec<(String, f64)> = {
        let mut stmt = match conn.prepare(
            "SELECT student_id, score FROM attempts
             WHERE teacher_id = ? AND finished_at IS NOT NULL",
        ) {
            Ok(s) => s,
            Err(e) => return db_err(req, e),
        };
        match stmt
            .query_map([&p.user_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return db_err(req, e),
        }
    };
    let all_scores: Vec<f64> = finished.iter().map(|(_, s)| *s).collect();
    let avg_score = if all_scores.is_empty() {
        0.0
    } else {
        round2(100.0 * mean(&all_scores))
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name FROM users WHERE role = 'student' AND teacher_id = ? ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return db_err(req, e),
    };
    let students: Vec<(String, String)> = match stmt
        .query_map([&p.user_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };

    let student_rows: Vec<serde_json::Value> = students
        .iter()
        .map(|(id, name)| {
            let scores: Vec<f64> = finished
                .iter()
                .filter(|(sid, _)| sid == id)
                .map(|(_, s)| *s)
                .collect();
            let avg = if scores.is_empty() {
                0.0
            } else {
                round1(100.0 * mean(&scores))
            };
            json!({
                "studentId": id,
                "name": name,
                "attempts": scores.len(),
                "avgPct": avg,
            })
        })
        .collect();

    ok(
        &req.id,
        json!({ "avgScorePct": avg_score, "students": student_rows }),
    )
}

fn handle_chairman_overview(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let by_teacher = match finished_scores_by(conn, "teacher_id") {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };
    let by_student = match finished_scores_by(conn, "student_id") {
        Ok(v) => v,
        Err(e) => return db_err(req, e),
    };

    let users: Vec<(String, String, String)> = {
        let mut stmt = match conn
            .prepare("SELECT id, role, name FROM users WHERE role IN ('teacher', 'student')")
        {
            Ok(s) => s,
            Err(e) => return db_err(req, e),
        };
        match stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return db_err(req, e),
        }
    };

    let mut teacher_perf: Vec<serde_json::Value> = Vec::new();
    let mut student_perf: Vec<serde_json::Value> = Vec::new();
    for (id, role, name) in &users {
        let (grouped, out) = if role == "teacher" {
            (&by_teacher, &mut teacher_perf)
        } else {
            (&by_student, &mut student_perf)
        };
        let scores = grouped.get(id).map(|v| v.as_slice()).unwrap_or(&[]);
        let avg = if scores.is_empty() {
            0.0
        } else {
            round2(100.0 * mean(scores))
        };
        out.push(json!({
            "id": id,
            "name": name,
            "attempts": scores.len(),
            "avgPct": avg,
        }));
    }

    // Best teachers first; weakest students first.
    teacher_perf.sort_by(|a, b| {
        let av = a["avgPct"].as_f64().unwrap_or(0.0);
        let bv = b["avgPct"].as_f64().unwrap_or(0.0);
        bv.partial_cmp(&av).unwrap_or(std::cmp::Ordering::Equal)
    });
    student_perf.sort_by(|a, b| {
        let av = a["avgPct"].as_f64().unwrap_or(0.0);
        let bv = b["avgPct"].as_f64().unwrap_or(0.0);
        av.partial_cmp(&bv).unwrap_or(std::cmp::Ordering::Equal)
    });

    ok(
        &req.id,
        json!({ "teachers": teacher_perf, "students": student_perf }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analytics.student.progress" => Some(handle_student_progress(state, req)),
        "analytics.teacher.overview" => Some(handle_teacher_overview(state, req)),
        "analytics.chairman.overview" => Some(handle_chairman_overview(state, req)),
        _ => None,
    }
}
