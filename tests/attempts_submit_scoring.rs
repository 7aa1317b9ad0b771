mod test_support;

use serde_json::json;
use std::time::Duration;
use test_support::{chairman, request_ok, spawn_sidecar, student, temp_dir};

#[test]
fn submit_scores_report_and_notify() {
    let dir = temp_dir("skillportald-submit");
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
        json!({
            "principal": chairman(),
            "name": "Basics",
            "orderIndex": 1,
            "durationMin": 15,
            "passPct": 80,
        }),
    )["skillId"]
        .as_str()
        .expect("skillId")
        .to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "questions.add",
        json!({
            "principal": chairman(),
            "skillId": skill,
            "qtype": "mcq_single",
            "prompt": "Pick the sky color",
            "options": ["Red", "Blue", "Green"],
            "answer": 1,
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "questions.add",
        json!({
            "principal": chairman(),
            "skillId": skill,
            "qtype": "short_text",
            "prompt": "Capital of France?",
            "answer": "paris",
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.add",
        json!({
            "principal": chairman(),
            "teacherId": "t001",
            "name": "Teacher One",
            "email": "t001@school.example",
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.import",
        json!({
            "principal": chairman(),
            "rows": [
                { "studentId": "s001", "name": "Student One", "teacherId": "t001" },
                { "studentId": "s002", "name": "Student Two", "teacherId": "t001" },
            ],
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "config.set",
        json!({
            "principal": chairman(),
            "key": "notify.smtp",
            "value": { "host": "mail.school.example", "from": "portal@school.example" },
        }),
    );

    let started = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attempts.start",
        json!({ "principal": student("s001"), "skillId": skill }),
    );
    assert_eq!(started["durationMin"].as_i64(), Some(15));
    let questions = started["questions"].as_array().expect("questions");
    let q1 = questions[0]["id"].as_str().expect("q1 id").to_string();
    let q2 = questions[1]["id"].as_str().expect("q2 id").to_string();
    let attempt_id = started["attemptId"].as_str().expect("attemptId").to_string();

    // Index arrives as a string, text in the wrong case; both still match.
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attempts.submit",
        json!({
            "principal": student("s001"),
            "attemptId": attempt_id,
            "answers": { q1.as_str(): "1", q2.as_str(): "Paris" },
        }),
    );
    assert_eq!(result["score"].as_f64(), Some(1.0));
    assert_eq!(result["scorePct"].as_i64(), Some(100));
    assert_eq!(result["correct"].as_i64(), Some(2));
    assert_eq!(result["total"].as_i64(), Some(2));
    assert_eq!(result["passed"].as_bool(), Some(true));
    assert!(result["durationSec"].as_i64().expect("durationSec") >= 0);

    let answers = result["answers"].as_array().expect("answers");
    assert_eq!(answers.len(), 2);
    assert_eq!(answers[0]["isCorrect"].as_bool(), Some(true));
    assert_eq!(answers[0]["studentAnswer"].as_str(), Some("1"));
    assert_eq!(answers[1]["studentAnswer"].as_str(), Some("Paris"));

    // Report artifact lands in the workspace and matches the result.
    let report_path = result["reportPath"].as_str().expect("reportPath");
    assert_eq!(report_path, format!("reports/attempt_{}.json", attempt_id));
    let raw = std::fs::read_to_string(dir.join(report_path)).expect("read report");
    let report: serde_json::Value = serde_json::from_str(&raw).expect("parse report");
    assert_eq!(report["attemptId"].as_str(), Some(attempt_id.as_str()));
    assert_eq!(report["studentName"].as_str(), Some("Student One"));
    assert_eq!(report["teacherName"].as_str(), Some("Teacher One"));
    assert_eq!(report["skillName"].as_str(), Some("Basics"));
    assert_eq!(report["summary"]["scorePct"].as_i64(), Some(100));
    assert_eq!(report["answers"].as_array().map(|a| a.len()), Some(2));

    // Notification is queued off-thread; give it a moment.
    let outbox = dir.join("outbox.jsonl");
    let mut line = String::new();
    for _ in 0..100 {
        if let Ok(raw) = std::fs::read_to_string(&outbox) {
            if raw.contains('\n') {
                line = raw;
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(!line.is_empty(), "outbox.jsonl never appeared");
    let mail: serde_json::Value =
        serde_json::from_str(line.lines().next().expect("line")).expect("parse outbox");
    assert_eq!(mail["to"].as_str(), Some("t001@school.example"));
    assert_eq!(mail["from"].as_str(), Some("portal@school.example"));
    assert_eq!(mail["attachment"].as_str(), Some(report_path));

    // A wrong sheet fails against the 80% bar.
    let started = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attempts.start",
        json!({ "principal": student("s002"), "skillId": skill }),
    );
    let questions = started["questions"].as_array().expect("questions");
    let q1 = questions[0]["id"].as_str().expect("q1 id").to_string();
    let q2 = questions[1]["id"].as_str().expect("q2 id").to_string();
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "attempts.submit",
        json!({
            "principal": student("s002"),
            "attemptId": started["attemptId"],
            "answers": { q1.as_str(): 0, q2.as_str(): "London" },
        }),
    );
    assert_eq!(result["score"].as_f64(), Some(0.0));
    assert_eq!(result["passed"].as_bool(), Some(false));
    let answers = result["answers"].as_array().expect("answers");
    assert_eq!(answers[0]["correctAnswer"].as_str(), Some("1"));
    assert_eq!(answers[1]["correctAnswer"].as_str(), Some("paris"));

    let _ = child.kill();
}
