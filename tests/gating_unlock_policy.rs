mod test_support;

use serde_json::json;
use std::time::Duration;
use test_support::{chairman, request_err, request_ok, spawn_sidecar, student, teacher, temp_dir};

#[test]
fn unlock_requires_pass_or_remediation() {
    let dir = temp_dir("skillportald-gating");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": dir.to_string_lossy() }),
    );

    let skill1 = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "skills.add",
        json!({ "principal": chairman(), "name": "Letters", "orderIndex": 1, "passPct": 80 }),
    )["skillId"]
        .as_str()
        .expect("skillId")
        .to_string();
    let skill2 = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "skills.add",
        json!({ "principal": chairman(), "name": "Words", "orderIndex": 2, "passPct": 80 }),
    )["skillId"]
        .as_str()
        .expect("skillId")
        .to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "questions.add",
        json!({
            "principal": chairman(),
            "skillId": skill1,
            "qtype": "mcq_single",
            "prompt": "pick b",
            "options": ["a", "b"],
            "answer": 1,
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "teachers.add",
        json!({ "principal": chairman(), "teacherId": "t001", "name": "Teacher One" }),
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

    // First skill in the sequence has no predecessor to gate on.
    let check = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "gating.check",
        json!({ "principal": teacher("t001"), "studentId": "s001", "skillId": skill1 }),
    );
    assert_eq!(check["canUnlock"].as_bool(), Some(true));

    // Next skill is blocked until the previous one was even attempted.
    let check = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "gating.check",
        json!({ "principal": teacher("t001"), "studentId": "s001", "skillId": skill2 }),
    );
    assert_eq!(check["canUnlock"].as_bool(), Some(false));
    let reason = check["reason"].as_str().expect("reason");
    assert!(reason.contains("hasn't attempted"), "reason: {}", reason);
    assert!(reason.contains("Letters"), "reason: {}", reason);

    let e = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "entitlements.set",
        json!({
            "principal": teacher("t001"),
            "studentId": "s001",
            "skillId": skill2,
            "allowed": true,
        }),
    );
    assert_eq!(e["code"].as_str(), Some("unlock_refused"));

    // s001 fails the previous skill.
    let started = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attempts.start",
        json!({ "principal": student("s001"), "skillId": skill1 }),
    );
    let qid = started["questions"][0]["id"]
        .as_str()
        .expect("qid")
        .to_string();
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "attempts.submit",
        json!({
            "principal": student("s001"),
            "attemptId": started["attemptId"],
            "answers": { qid.as_str(): 0 },
        }),
    );
    assert_eq!(result["passed"].as_bool(), Some(false));

    let check = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "gating.check",
        json!({ "principal": teacher("t001"), "studentId": "s001", "skillId": skill2 }),
    );
    assert_eq!(check["canUnlock"].as_bool(), Some(false));
    let reason = check["reason"].as_str().expect("reason");
    assert!(reason.contains("FAIL"), "reason: {}", reason);
    assert!(reason.contains("Letters"), "reason: {}", reason);

    // Remediation uploaded after the failed attempt reopens the gate.
    std::thread::sleep(Duration::from_millis(20));
    request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "remediation.add",
        json!({
            "principal": teacher("t001"),
            "studentId": "s001",
            "skillId": skill1,
            "filename": "letters-worksheet.pdf",
            "storedPath": "uploads/letters-worksheet.pdf",
        }),
    );
    let check = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "gating.check",
        json!({ "principal": teacher("t001"), "studentId": "s001", "skillId": skill2 }),
    );
    assert_eq!(check["canUnlock"].as_bool(), Some(true));
    request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "entitlements.set",
        json!({
            "principal": teacher("t001"),
            "studentId": "s001",
            "skillId": skill2,
            "allowed": true,
        }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "entitlements.list",
        json!({ "principal": teacher("t001"), "studentId": "s001" }),
    );
    let rows = listed["entitlements"].as_array().expect("rows");
    let row2 = rows
        .iter()
        .find(|r| r["skillId"].as_str() == Some(skill2.as_str()))
        .expect("skill2 row");
    assert_eq!(row2["allowed"].as_bool(), Some(true));
    let unlocked_at = row2["unlockedAt"].as_str().expect("unlockedAt").to_string();

    // Locking again keeps the original unlock stamp and records the reason.
    request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "entitlements.set",
        json!({
            "principal": teacher("t001"),
            "studentId": "s001",
            "skillId": skill2,
            "allowed": false,
            "lockedReason": "On hold",
        }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "entitlements.list",
        json!({ "principal": teacher("t001"), "studentId": "s001" }),
    );
    let row2 = listed["entitlements"]
        .as_array()
        .expect("rows")
        .iter()
        .find(|r| r["skillId"].as_str() == Some(skill2.as_str()))
        .cloned()
        .expect("skill2 row");
    assert_eq!(row2["allowed"].as_bool(), Some(false));
    assert_eq!(row2["lockedReason"].as_str(), Some("On hold"));
    assert_eq!(row2["unlockedAt"].as_str(), Some(unlocked_at.as_str()));

    // A clean pass unlocks without any remediation.
    let started = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "attempts.start",
        json!({ "principal": student("s002"), "skillId": skill1 }),
    );
    let qid = started["questions"][0]["id"]
        .as_str()
        .expect("qid")
        .to_string();
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "attempts.submit",
        json!({
            "principal": student("s002"),
            "attemptId": started["attemptId"],
            "answers": { qid.as_str(): 1 },
        }),
    );
    assert_eq!(result["passed"].as_bool(), Some(true));
    let check = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "gating.check",
        json!({ "principal": teacher("t001"), "studentId": "s002", "skillId": skill2 }),
    );
    assert_eq!(check["canUnlock"].as_bool(), Some(true));

    // Unknown skill never unlocks.
    let check = request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "gating.check",
        json!({ "principal": teacher("t001"), "studentId": "s001", "skillId": "missing" }),
    );
    assert_eq!(check["canUnlock"].as_bool(), Some(false));

    let _ = child.kill();
}
