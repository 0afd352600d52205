//! Evaluation score parsing and best-model selection.

use serde::{Deserialize, Serialize};

use crate::error::ScoreError;

/// Score of one candidate model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    /// Model path as seen by the evaluation pod.
    pub model: String,
    /// MMLU reports `average_score`; MT-Bench reports `overall_score`.
    #[serde(alias = "overall_score")]
    pub average_score: f64,
}

/// Output of a finished stage.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage: String,
    pub logs: String,
    /// Parsed scores, for evaluation stages.
    pub scores: Vec<ScoreRecord>,
}

/// Parses evaluation output into score records.
///
/// The output is expected to be a JSON array. Python `repr` output is
/// accepted as a fallback: single-quoted strings are requoted, while
/// double-quoted ones (used by Python when the value contains `'`) are kept.
/// Extra fields in each record are ignored.
///
/// # Errors
///
/// - `ScoreError::Malformed` if the text is not an array of records
/// - `ScoreError::Empty` if the array is empty
pub fn parse_scores(output: &str) -> Result<Vec<ScoreRecord>, ScoreError> {
    let text = output.trim();
    let records: Vec<ScoreRecord> = match serde_json::from_str(text) {
        Ok(records) => records,
        Err(strict) => serde_json::from_str(&requote_python_literal(text)).map_err(|_| {
            ScoreError::Malformed {
                reason: strict.to_string(),
            }
        })?,
    };

    if records.is_empty() {
        return Err(ScoreError::Empty);
    }
    Ok(records)
}

/// Rewrites single-quoted Python string literals as JSON strings.
fn requote_python_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    // Quote character of the string literal being copied, if any.
    let mut open: Option<char> = None;

    while let Some(c) = chars.next() {
        match (open, c) {
            (None, '\'') => {
                open = Some('\'');
                out.push('"');
            }
            (None, '"') => {
                open = Some('"');
                out.push('"');
            }
            (None, _) => out.push(c),
            (Some(quote), '\\') => match chars.next() {
                Some('\'') if quote == '\'' => out.push('\''),
                Some(escaped) => {
                    out.push('\\');
                    out.push(escaped);
                }
                None => out.push('\\'),
            },
            (Some('\''), '\'') => {
                open = None;
                out.push('"');
            }
            (Some('\''), '"') => out.push_str("\\\""),
            (Some('"'), '"') => {
                open = None;
                out.push('"');
            }
            (Some(_), _) => out.push(c),
        }
    }
    out
}

/// Picks the highest-scoring record. Ties go to the first one.
pub fn select_best(records: &[ScoreRecord]) -> Option<&ScoreRecord> {
    records.iter().fold(None, |best, record| match best {
        Some(current) if current.average_score >= record.average_score => Some(current),
        _ => Some(record),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selects_highest_score() {
        let records = parse_scores(
            r#"[{"model":"a","average_score":0.7},{"model":"b","average_score":0.9}]"#,
        )
        .expect("scores");
        assert_eq!(select_best(&records).map(|r| r.model.as_str()), Some("b"));
    }

    #[test]
    fn test_tie_keeps_first() {
        let records = vec![
            ScoreRecord {
                model: "first".to_string(),
                average_score: 0.5,
            },
            ScoreRecord {
                model: "second".to_string(),
                average_score: 0.5,
            },
        ];
        assert_eq!(select_best(&records).map(|r| r.model.as_str()), Some("first"));
        assert!(select_best(&[]).is_none());
    }

    #[test]
    fn test_single_quote_fallback() {
        let records =
            parse_scores("[{'model': '/output/model/hf_format/samples_64', 'average_score': 0.41}]")
                .expect("scores");
        assert_eq!(records[0].model, "/output/model/hf_format/samples_64");
    }

    #[test]
    fn test_python_repr_with_apostrophe_in_path() {
        let records = parse_scores(
            r#"[{'model': "/output/model/hf_format/o'brien", 'average_score': 0.5}, {'model': 'say "hi"', 'average_score': 0.2}]"#,
        )
        .expect("scores");
        assert_eq!(records[0].model, "/output/model/hf_format/o'brien");
        assert_eq!(records[1].model, r#"say "hi""#);
    }

    #[test]
    fn test_python_repr_escaped_quote() {
        let records = parse_scores(r#"[{'model': 'it\'s "x"', 'average_score': 1.0}]"#)
            .expect("scores");
        assert_eq!(records[0].model, r#"it's "x""#);
    }

    #[test]
    fn test_mt_bench_overall_score() {
        let records = parse_scores(
            r#"[{"report_title":"SKILLS EVALUATION REPORT","model":"m","judge_model":"j","overall_score":6.5,"turn_scores":[6.0,7.0]}]"#,
        )
        .expect("scores");
        assert_eq!(records[0].average_score, 6.5);
    }

    #[test]
    fn test_malformed_output() {
        assert!(matches!(
            parse_scores("Traceback (most recent call last):"),
            Err(ScoreError::Malformed { .. })
        ));
        assert!(matches!(
            parse_scores(r#"[{"model":"a"}]"#),
            Err(ScoreError::Malformed { .. })
        ));
        assert!(matches!(parse_scores("[]"), Err(ScoreError::Empty)));
    }
}
