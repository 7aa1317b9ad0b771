mod test_support;

use serde_json::json;
use test_support::{chairman, request_ok, spawn_sidecar, student, temp_dir};

#[test]
fn duplicate_submit_replays_the_stored_result() {
    let dir = temp_dir("skillportald-idempotent");
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
        json!({ "principal": chairman(), "name": "Basics", "orderIndex": 1, "passPct": 80 }),
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
            "qtype": "true_false",
            "prompt": "Water boils at 100C at sea level",
            "answer": 1,
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.add",
        json!({ "principal": chairman(), "teacherId": "t001", "name": "Teacher One" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.import",
        json!({
            "principal": chairman(),
            "rows": [{ "studentId": "s001", "name": "Student One", "teacherId": "t001" }],
        }),
    );

    let started = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attempts.start",
        json!({ "principal": student("s001"), "skillId": skill }),
    );
    let qid = started["questions"][0]["id"]
        .as_str()
        .expect("qid")
        .to_string();

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attempts.submit",
        json!({
            "principal": student("s001"),
            "attemptId": started["attemptId"],
            "answers": { qid.as_str(): 1 },
        }),
    );
    // The second sheet would be a perfect fail, but it must be ignored.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attempts.submit",
        json!({
            "principal": student("s001"),
            "attemptId": started["attemptId"],
            "answers": { qid.as_str(): 0 },
        }),
    );

    for field in [
        "attemptId",
        "skillId",
        "skillName",
        "startedAt",
        "finishedAt",
        "durationSec",
        "score",
        "scorePct",
        "correct",
        "total",
        "passed",
        "reportPath",
        "answers",
    ] {
        assert_eq!(first[field], second[field], "field {} diverged on replay", field);
    }
    assert_eq!(first["score"].as_f64(), Some(1.0));

    // Exactly one report artifact, no duplicate render.
    let reports: Vec<_> = std::fs::read_dir(dir.join("reports"))
        .expect("reports dir")
        .collect();
    assert_eq!(reports.len(), 1);

    let _ = child.kill();
}
