use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionType {
    McqSingle,
    McqMulti,
    TrueFalse,
    ImageMcqSingle,
    VideoCuedMcqSingle,
    ShortText,
    Unknown,
}

impl QuestionType {
    pub fn parse(tag: &str) -> QuestionType {
        match tag {
            "mcq_single" => QuestionType::McqSingle,
            "mcq_multi" => QuestionType::McqMulti,
            "true_false" => QuestionType::TrueFalse,
            "image_mcq_single" => QuestionType::ImageMcqSingle,
            "video_cued_mcq_single" => QuestionType::VideoCuedMcqSingle,
            "short_text" => QuestionType::ShortText,
            _ => QuestionType::Unknown,
        }
    }

    /// Single-selection variants share one scoring rule; the cue medium
    /// only matters to the presentation layer.
    pub fn is_single_choice(self) -> bool {
        matches!(
            self,
            QuestionType::McqSingle
                | QuestionType::TrueFalse
                | QuestionType::ImageMcqSingle
                | QuestionType::VideoCuedMcqSingle
        )
    }
}

/// Answer key, shaped per question type. Parsed from the stored JSON;
/// anything that does not match its type's shape degrades to `Missing`,
/// which always scores incorrect.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerKey {
    Index(i64),
    IndexSet(Vec<i64>),
    Text(String),
    Missing,
}

pub fn parse_answer_key(qtype: QuestionType, raw: Option<&str>) -> AnswerKey {
    let Some(raw) = raw else {
        return AnswerKey::Missing;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return AnswerKey::Missing;
    };
    if qtype.is_single_choice() {
        return match value_as_index(&value) {
            Some(i) => AnswerKey::Index(i),
            None => AnswerKey::Missing,
        };
    }
    match qtype {
        QuestionType::McqMulti => match value.as_array() {
            Some(items) => {
                let mut indices = Vec::with_capacity(items.len());
                for item in items {
                    match value_as_index(item) {
                        Some(i) => indices.push(i),
                        None => return AnswerKey::Missing,
                    }
                }
                AnswerKey::IndexSet(indices)
            }
            None => AnswerKey::Missing,
        },
        QuestionType::ShortText => match value.as_str() {
            Some(s) => AnswerKey::Text(s.to_string()),
            None => AnswerKey::Missing,
        },
        _ => AnswerKey::Missing,
    }
}

/// What the student sent for one question. Raw payload values are kept
/// lenient: numbers, numeric strings and arrays of either are accepted,
/// and anything else scores incorrect rather than failing the submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submitted {
    Index(i64),
    IndexSet(Vec<i64>),
    Text(String),
    Blank,
}

pub fn parse_submitted(raw: Option<&serde_json::Value>) -> Submitted {
    match raw {
        None | Some(serde_json::Value::Null) => Submitted::Blank,
        Some(serde_json::Value::Number(n)) => match n.as_i64() {
            Some(i) => Submitted::Index(i),
            None => Submitted::Blank,
        },
        Some(serde_json::Value::String(s)) => Submitted::Text(s.clone()),
        Some(serde_json::Value::Array(items)) => {
            let mut indices = Vec::with_capacity(items.len());
            for item in items {
                match value_as_index(item) {
                    Some(i) => indices.push(i),
                    None => return Submitted::Blank,
                }
            }
            Submitted::IndexSet(indices)
        }
        Some(_) => Submitted::Blank,
    }
}

fn value_as_index(v: &serde_json::Value) -> Option<i64> {
    match v {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Per-question record persisted on the attempt and echoed into the
/// report artifact. Kept redundantly with the question table so history
/// stays stable when questions are later edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRecord {
    pub question_id: String,
    pub prompt: String,
    pub qtype: String,
    pub student_answer: String,
    pub correct_answer: String,
    pub is_correct: bool,
}

pub fn score_question(
    question_id: &str,
    prompt: &str,
    qtype_tag: &str,
    key: &AnswerKey,
    submitted: &Submitted,
) -> AnswerRecord {
    let qtype = QuestionType::parse(qtype_tag);

    let (is_correct, student_disp, correct_disp) = if qtype.is_single_choice() {
        let chosen = submitted_as_index(submitted);
        let is_correct = match (chosen, key) {
            (Some(c), AnswerKey::Index(k)) => c == *k,
            _ => false,
        };
        (
            is_correct,
            display_submitted(submitted),
            match key {
                AnswerKey::Index(k) => k.to_string(),
                _ => "-".to_string(),
            },
        )
    } else {
        match qtype {
            QuestionType::McqMulti => {
                let mut chosen = match submitted {
                    Submitted::IndexSet(v) => v.clone(),
                    Submitted::Index(i) => vec![*i],
                    _ => Vec::new(),
                };
                chosen.sort_unstable();
                chosen.dedup();
                let (is_correct, correct_disp) = match key {
                    AnswerKey::IndexSet(k) => {
                        let mut expected = k.clone();
                        expected.sort_unstable();
                        expected.dedup();
                        (chosen == expected, display_indices(&expected))
                    }
                    // Keyless question never awards the mark.
                    _ => (false, "-".to_string()),
                };
                (is_correct, display_indices(&chosen), correct_disp)
            }
            QuestionType::ShortText => {
                let given = match submitted {
                    Submitted::Text(s) => s.clone(),
                    _ => String::new(),
                };
                let (is_correct, correct_disp) = match key {
                    AnswerKey::Text(k) => {
                        let target = k.trim().to_lowercase();
                        // An empty key must never match a blank submission.
                        let is_correct =
                            !target.is_empty() && given.trim().to_lowercase() == target;
                        (is_correct, k.clone())
                    }
                    _ => (false, "-".to_string()),
                };
                let student_disp = if given.is_empty() { "-".to_string() } else { given };
                (is_correct, student_disp, correct_disp)
            }
            // Unrecognized type: fail closed, but keep the literals for audit.
            _ => (false, display_submitted(submitted), "-".to_string()),
        }
    };

    AnswerRecord {
        question_id: question_id.to_string(),
        prompt: prompt.to_string(),
        qtype: qtype_tag.to_string(),
        student_answer: student_disp,
        correct_answer: correct_disp,
        is_correct,
    }
}

fn submitted_as_index(submitted: &Submitted) -> Option<i64> {
    match submitted {
        Submitted::Index(i) => Some(*i),
        Submitted::Text(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn display_submitted(submitted: &Submitted) -> String {
    match submitted {
        Submitted::Index(i) => i.to_string(),
        Submitted::Text(s) if !s.trim().is_empty() => s.clone(),
        Submitted::IndexSet(v) if !v.is_empty() => display_indices(v),
        _ => "-".to_string(),
    }
}

fn display_indices(indices: &[i64]) -> String {
    if indices.is_empty() {
        return "-".to_string();
    }
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn iso_year_week(at: DateTime<Utc>) -> (i32, u32) {
    let iso = at.iso_week();
    (iso.year(), iso.week())
}

/// A late submission is clamped to the allotted window, never extended.
pub fn clamp_finish(
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
    duration_min: i64,
) -> DateTime<Utc> {
    let cutoff = started_at + Duration::minutes(duration_min);
    if now < cutoff {
        now
    } else {
        cutoff
    }
}

/// Pass rule: score (as a percent) at or above the skill's threshold.
/// Skills without a threshold always pass.
pub fn is_passing(score: f64, pass_pct: Option<i64>) -> bool {
    match pass_pct {
        Some(p) => score * 100.0 >= (p as f64) - 1e-9,
        None => true,
    }
}

/// Names of the (up to) three skills with the lowest mean score across a
/// student's finished attempts, ascending by mean. Ties break by name so
/// the derivation is stable. Pure over `(skill_name, score)` history.
pub fn lacking_skills(history: &[(String, f64)]) -> Vec<String> {
    let mut by_skill: HashMap<&str, (f64, usize)> = HashMap::new();
    for (name, score) in history {
        let entry = by_skill.entry(name.as_str()).or_insert((0.0, 0));
        entry.0 += score;
        entry.1 += 1;
    }

    let mut means: Vec<(f64, &str)> = by_skill
        .into_iter()
        .map(|(name, (sum, n))| (sum / n as f64, name))
        .collect();
    means.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.cmp(b.1))
    });

    means.into_iter().take(3).map(|(_, n)| n.to_string()).collect()
}
