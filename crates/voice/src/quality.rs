//! Synthesis-quality heuristics for the quality-analysis endpoint.
//!
//! Scores text for how well it will synthesize: length, sentence shape,
//! unpronounceable tokens, SSML-hostile characters. Below the caller's
//! threshold, the report carries concrete recommendations and cleaned
//! alternatives.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub score: f32,
    pub passed: bool,
    pub recommendations: Vec<String>,
    pub alternatives: Vec<String>,
}

const MAX_COMFORTABLE_CHARS: usize = 500;
const MAX_SENTENCE_WORDS: usize = 30;

pub fn analyze(text: &str, threshold: f32) -> QualityReport {
    let mut score: f32 = 1.0;
    let mut recommendations = Vec::new();
    let mut alternatives = Vec::new();

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return QualityReport {
            score: 0.0,
            passed: false,
            recommendations: vec!["text is empty".to_string()],
            alternatives: Vec::new(),
        };
    }

    if trimmed.chars().count() > MAX_COMFORTABLE_CHARS {
        score -= 0.2;
        recommendations.push(format!(
            "text is long ({} chars); synthesis sounds better under {MAX_COMFORTABLE_CHARS}",
            trimmed.chars().count()
        ));
    }

    let longest_sentence = trimmed
        .split(['.', '!', '?'])
        .map(|s| s.split_whitespace().count())
        .max()
        .unwrap_or(0);
    if longest_sentence > MAX_SENTENCE_WORDS {
        score -= 0.2;
        recommendations
            .push("break sentences above 30 words; long clauses flatten intonation".to_string());
    }

    let digit_run = trimmed
        .split(|c: char| !c.is_ascii_digit())
        .map(str::len)
        .max()
        .unwrap_or(0);
    if digit_run >= 7 {
        score -= 0.15;
        recommendations.push(
            "spell out long digit runs (phone numbers, ids) for natural pacing".to_string(),
        );
    }

    let shouty = trimmed
        .split_whitespace()
        .filter(|w| w.len() > 3 && w.chars().all(|c| c.is_ascii_uppercase()))
        .count();
    if shouty > 0 {
        score -= 0.1;
        recommendations.push("all-caps words are spelled letter by letter; use lowercase".to_string());
        alternatives.push(trimmed.to_lowercase());
    }

    let markupish = trimmed.chars().filter(|c| matches!(c, '<' | '>' | '{' | '}' | '|')).count();
    if markupish > 0 {
        score -= 0.15;
        recommendations.push("strip markup characters before synthesis".to_string());
        alternatives.push(
            trimmed
                .chars()
                .filter(|c| !matches!(c, '<' | '>' | '{' | '}' | '|'))
                .collect(),
        );
    }

    if !trimmed.ends_with(['.', '!', '?']) {
        score -= 0.05;
        recommendations.push("terminal punctuation improves the closing contour".to_string());
        alternatives.push(format!("{trimmed}."));
    }

    let score = score.clamp(0.0, 1.0);
    QualityReport {
        score,
        passed: score >= threshold,
        recommendations,
        alternatives,
    }
}
