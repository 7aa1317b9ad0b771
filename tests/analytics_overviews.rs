mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{chairman, request_ok, spawn_sidecar, student, teacher, temp_dir};

fn take_attempt(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student_id: &str,
    skill_id: &str,
    correct_n: usize,
) {
    let started = request_ok(
        stdin,
        reader,
        &format!("{}-start", id),
        "attempts.start",
        json!({ "principal": student(student_id), "skillId": skill_id }),
    );
    let mut answers = serde_json::Map::new();
    for (i, q) in started["questions"]
        .as_array()
        .expect("questions")
        .iter()
        .enumerate()
    {
        let qid = q["id"].as_str().expect("qid").to_string();
        answers.insert(qid, json!(if i < correct_n { 0 } else { 1 }));
    }
    request_ok(
        stdin,
        reader,
        &format!("{}-submit", id),
        "attempts.submit",
        json!({
            "principal": student(student_id),
            "attemptId": started["attemptId"],
            "answers": answers,
        }),
    );
}

#[test]
fn overviews_aggregate_and_rank_performance() {
    let dir = temp_dir("skillportald-overviews");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": dir.to_string_lossy() }),
    );

    let skill = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "skills.add",
        json!({ "principal": chairman(), "name": "Skill 1", "orderIndex": 1 }),
    )["skillId"]
        .as_str()
        .expect("skillId")
        .to_string();
    for q in 0..2 {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("q-{}", q),
            "questions.add",
            json!({
                "principal": chairman(),
                "skillId": skill,
                "qtype": "mcq_single",
                "prompt": format!("question {}", q),
                "options": ["right", "wrong"],
                "answer": 0,
            }),
        );
    }
    for (i, t) in ["t001", "t002"].iter().enumerate() {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("t-{}", i),
            "teachers.add",
            json!({ "principal": chairman(), "teacherId": t, "name": format!("Teacher {}", t) }),
        );
    }
    request_ok(
        &mut stdin,
        &mut reader,
        "s",
        "students.import",
        json!({
            "principal": chairman(),
            "rows": [
                { "studentId": "s001", "name": "Student One", "teacherId": "t001" },
                { "studentId": "s002", "name": "Student Two", "teacherId": "t001" },
                { "studentId": "s003", "name": "Student Three", "teacherId": "t002" },
            ],
        }),
    );

    take_attempt(&mut stdin, &mut reader, "a1", "s001", &skill, 1); // 0.5
    take_attempt(&mut stdin, &mut reader, "a2", "s002", &skill, 0); // 0.0
    take_attempt(&mut stdin, &mut reader, "a3", "s003", &skill, 2); // 1.0

    let overview = request_ok(
        &mut stdin,
        &mut reader,
        "teacher-overview",
        "analytics.teacher.overview",
        json!({ "principal": teacher("t001") }),
    );
    assert_eq!(overview["avgScorePct"].as_f64(), Some(25.0));
    let rows = overview["students"].as_array().expect("students");
    assert_eq!(rows.len(), 2);
    let s1 = rows
        .iter()
        .find(|r| r["studentId"].as_str() == Some("s001"))
        .expect("s001");
    assert_eq!(s1["avgPct"].as_f64(), Some(50.0));
    assert_eq!(s1["attempts"].as_i64(), Some(1));

    let overview = request_ok(
        &mut stdin,
        &mut reader,
        "chairman-overview",
        "analytics.chairman.overview",
        json!({ "principal": chairman() }),
    );
    let teachers: Vec<&str> = overview["teachers"]
        .as_array()
        .expect("teachers")
        .iter()
        .map(|r| r["id"].as_str().expect("id"))
        .collect();
    assert_eq!(teachers, vec!["t002", "t001"]);
    let students: Vec<&str> = overview["students"]
        .as_array()
        .expect("students")
        .iter()
        .map(|r| r["id"].as_str().expect("id"))
        .collect();
    assert_eq!(students, vec!["s002", "s001", "s003"]);

    let _ = child.kill();
}
