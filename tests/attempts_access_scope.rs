mod test_support;

use serde_json::json;
use test_support::{chairman, request_err, request_ok, spawn_sidecar, student, teacher, temp_dir};

#[test]
fn attempts_are_invisible_outside_their_owners() {
    let dir = temp_dir("skillportald-scope");
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
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "questions.add",
        json!({
            "principal": chairman(),
            "skillId": skill,
            "qtype": "mcq_single",
            "prompt": "pick a",
            "options": ["a", "b"],
            "answer": 0,
        }),
    );
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
        "4",
        "students.import",
        json!({
            "principal": chairman(),
            "rows": [
                { "studentId": "s001", "name": "Student One", "teacherId": "t001" },
                { "studentId": "s002", "name": "Student Two", "teacherId": "t002" },
            ],
        }),
    );

    let started = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "attempts.start",
        json!({ "principal": student("s001"), "skillId": skill }),
    );
    let attempt_id = started["attemptId"].as_str().expect("attemptId").to_string();
    let qid = started["questions"][0]["id"]
        .as_str()
        .expect("qid")
        .to_string();

    // Another student cannot submit, or even observe, this attempt.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "attempts.submit",
        json!({
            "principal": student("s002"),
            "attemptId": attempt_id,
            "answers": { qid.as_str(): 0 },
        }),
    );
    assert_eq!(e["code"].as_str(), Some("not_found"));
    let e = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "attempts.get",
        json!({ "principal": student("s002"), "attemptId": attempt_id }),
    );
    assert_eq!(e["code"].as_str(), Some("not_found"));
    let e = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "attempts.get",
        json!({ "principal": teacher("t002"), "attemptId": attempt_id }),
    );
    assert_eq!(e["code"].as_str(), Some("not_found"));

    // The owning teacher and the chairman see the open attempt.
    let open = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attempts.get",
        json!({ "principal": teacher("t001"), "attemptId": attempt_id }),
    );
    assert_eq!(open["finished"].as_bool(), Some(false));
    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attempts.get",
        json!({ "principal": chairman(), "attemptId": attempt_id }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "attempts.submit",
        json!({
            "principal": student("s001"),
            "attemptId": attempt_id,
            "answers": { qid.as_str(): 0 },
        }),
    );
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "attempts.get",
        json!({ "principal": student("s001"), "attemptId": attempt_id }),
    );
    assert_eq!(got["finished"].as_bool(), Some(true));
    assert_eq!(got["score"].as_f64(), Some(1.0));

    // Listing is scoped by role.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "attempts.list",
        json!({ "principal": teacher("t001") }),
    );
    assert_eq!(listed["attempts"].as_array().map(|a| a.len()), Some(1));
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "attempts.list",
        json!({ "principal": teacher("t002") }),
    );
    assert_eq!(listed["attempts"].as_array().map(|a| a.len()), Some(0));
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "attempts.list",
        json!({ "principal": student("s001"), "finishedOnly": true }),
    );
    let rows = listed["attempts"].as_array().expect("attempts");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["skillName"].as_str(), Some("Skill 1"));
    assert_eq!(rows[0]["passed"].as_bool(), Some(true));

    // Role gates on admin surfaces.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "16",
        "teachers.add",
        json!({ "principal": teacher("t001"), "teacherId": "t009", "name": "X" }),
    );
    assert_eq!(e["code"].as_str(), Some("forbidden"));
    let e = request_err(
        &mut stdin,
        &mut reader,
        "17",
        "config.set",
        json!({ "principal": teacher("t001"), "key": "school.name", "value": "X" }),
    );
    assert_eq!(e["code"].as_str(), Some("forbidden"));
    let e = request_err(
        &mut stdin,
        &mut reader,
        "18",
        "analytics.teacher.overview",
        json!({ "principal": student("s001") }),
    );
    assert_eq!(e["code"].as_str(), Some("forbidden"));
    let e = request_err(
        &mut stdin,
        &mut reader,
        "19",
        "attempts.start",
        json!({ "principal": teacher("t001"), "skillId": skill }),
    );
    assert_eq!(e["code"].as_str(), Some("forbidden"));

    // Cross-roster reads collapse to absence, not denial.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "20",
        "entitlements.list",
        json!({ "principal": teacher("t002"), "studentId": "s001" }),
    );
    assert_eq!(e["code"].as_str(), Some("not_found"));

    let _ = child.kill();
}
