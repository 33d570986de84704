//! Trigger rules: match transcript text against user-defined keywords and
//! instantiate the winning rule's template.
//!
//! Matching is tolerant of how speech-to-text renders punctuation and
//! spacing: keywords are compared width-folded (full-width to half-width),
//! case-insensitively and ignoring whitespace, and the transcript is split
//! into sentences on both ASCII and CJK delimiters.

use crate::error::PipelineError;
use regex::Regex;
use serde::{Deserialize, Serialize};

const VALUE_PLACEHOLDER: &str = "{value}";
const INPUT_PLACEHOLDER: &str = "{input}";
const SENTENCE_DELIMITERS: [char; 12] =
    [',', '，', '。', '.', '!', '！', '?', '？', ';', '；', ':', '：'];

/// Rule ids that ship by default and may not be removed.
const LOCKED_RULE_IDS: [&str; 2] = ["translate", "polish"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRule {
    pub id: String,
    pub title: String,
    pub enabled: bool,
    pub auto_apply: bool,
    /// Locked rules are always evaluated and cannot be deleted by edits.
    pub locked: bool,
    /// Literal keyword, optionally containing a single `{value}` capture.
    pub keyword: String,
    /// Output template; `{value}` and `{input}` are substituted on match.
    pub template: String,
    /// Candidate values, in preference order, used when the keyword has no
    /// placeholder capture.
    pub variables: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMatchMode {
    Keyword,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMatch {
    pub rule_id: String,
    pub rule_title: String,
    pub keyword: String,
    pub value: String,
    pub mode: TriggerMatchMode,
}

/// Result of evaluating the rule list against one transcript.
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub final_text: String,
    pub matches: Vec<TriggerMatch>,
}

impl TriggerRule {
    pub fn defaults() -> Vec<TriggerRule> {
        vec![
            TriggerRule {
                id: "translate".to_string(),
                title: "Translate".to_string(),
                enabled: true,
                auto_apply: false,
                locked: true,
                keyword: "translate to {value}".to_string(),
                template: "Translate into {value}: {input}".to_string(),
                variables: vec!["English".to_string()],
            },
            TriggerRule {
                id: "polish".to_string(),
                title: "Polish".to_string(),
                enabled: true,
                auto_apply: false,
                locked: true,
                keyword: "polish as {value}".to_string(),
                template: "Rewrite in a {value} register: {input}".to_string(),
                variables: vec!["casual".to_string()],
            },
        ]
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.keyword.trim().is_empty() {
            return Err(PipelineError::Validation(format!(
                "trigger rule '{}' has an empty keyword",
                self.title
            )));
        }
        if self.keyword.matches(VALUE_PLACEHOLDER).count() > 1 {
            return Err(PipelineError::Validation(format!(
                "trigger rule '{}' has more than one {{value}} placeholder",
                self.title
            )));
        }
        if !self.variables.iter().any(|value| !value.trim().is_empty()) {
            return Err(PipelineError::Validation(format!(
                "trigger rule '{}' needs at least one non-empty variable",
                self.title
            )));
        }
        Ok(())
    }

    /// Validate a full rule list as it would be saved: every rule valid,
    /// and the locked default rules still present.
    pub fn validate_all(rules: &[TriggerRule]) -> Result<(), PipelineError> {
        for id in LOCKED_RULE_IDS {
            let present = rules.iter().any(|rule| rule.id == id && rule.locked);
            if !present {
                return Err(PipelineError::Validation(format!(
                    "built-in trigger rule '{id}' cannot be removed"
                )));
            }
        }
        for rule in rules {
            rule.validate()?;
        }
        Ok(())
    }
}

/// Evaluate rules in configured order. All matches are recorded; the first
/// matching rule supplies the final text. No match leaves the transcript
/// unchanged.
pub fn resolve(transcript: &str, rules: &[TriggerRule]) -> TriggerOutcome {
    let sentences = split_sentences(transcript);
    let mut matches = Vec::new();
    let mut final_text: Option<String> = None;

    for rule in rules.iter().filter(|rule| rule.enabled) {
        let matched = match_keyword(rule, &sentences).map(|value| (value, TriggerMatchMode::Keyword)).or_else(|| {
            rule.auto_apply
                .then(|| (transcript.trim().to_string(), TriggerMatchMode::Auto))
        });

        let Some((value, mode)) = matched else {
            continue;
        };
        tracing::debug!(rule = %rule.id, %value, ?mode, "trigger rule matched");

        if final_text.is_none() {
            let input = if mode == TriggerMatchMode::Keyword {
                remove_keyword_phrase(transcript, &rule.keyword)
            } else {
                transcript.trim().to_string()
            };
            final_text = Some(instantiate(&rule.template, &value, &input));
        }

        matches.push(TriggerMatch {
            rule_id: rule.id.clone(),
            rule_title: rule.title.clone(),
            keyword: rule.keyword.clone(),
            value,
            mode,
        });
    }

    TriggerOutcome {
        final_text: final_text.unwrap_or_else(|| transcript.to_string()),
        matches,
    }
}

fn instantiate(template: &str, value: &str, input: &str) -> String {
    template
        .replace(VALUE_PLACEHOLDER, value)
        .replace(INPUT_PLACEHOLDER, input)
}

fn split_sentences(input: &str) -> Vec<String> {
    input
        .split(SENTENCE_DELIMITERS)
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

/// Keyword match for one rule. With a `{value}` placeholder the captured
/// run of text becomes the value; without one the value is picked from the
/// rule's variable list.
fn match_keyword(rule: &TriggerRule, sentences: &[String]) -> Option<String> {
    let keyword = rule.keyword.trim();
    if keyword.is_empty() {
        return None;
    }

    if let Some((prefix, suffix)) = split_placeholder(keyword) {
        return sentences
            .iter()
            .find_map(|sentence| capture_value(sentence, prefix, suffix));
    }

    let normalized_keyword = normalize_for_compare(keyword);
    if normalized_keyword.is_empty() {
        return None;
    }
    let sentence = sentences
        .iter()
        .find(|sentence| normalize_for_compare(sentence).contains(&normalized_keyword))?;
    select_variable(sentence, &rule.variables).or_else(|| first_non_empty_variable(rule))
}

/// Pick the variable occurring earliest in the sentence, preferring the
/// longest at equal positions; fall back to the first non-empty entry.
fn select_variable(sentence: &str, variables: &[String]) -> Option<String> {
    let normalized_sentence = normalize_for_compare(sentence);
    if normalized_sentence.is_empty() {
        return None;
    }

    let mut best: Option<(usize, usize, String)> = None;
    for variable in variables {
        let trimmed = variable.trim();
        if trimmed.is_empty() {
            continue;
        }
        let normalized = normalize_for_compare(trimmed);
        if normalized.is_empty() {
            continue;
        }
        if let Some(start) = normalized_sentence.find(&normalized) {
            let length = normalized.chars().count();
            let better = match best.as_ref() {
                Some((best_start, best_len, _)) => {
                    start < *best_start || (start == *best_start && length > *best_len)
                }
                None => true,
            };
            if better {
                best = Some((start, length, trimmed.to_string()));
            }
        }
    }
    best.map(|(_, _, value)| value)
}

fn first_non_empty_variable(rule: &TriggerRule) -> Option<String> {
    rule.variables
        .iter()
        .find_map(|value| (!value.trim().is_empty()).then(|| value.trim().to_string()))
}

/// Strip the matched keyword phrase so templates can reference the spoken
/// content without the command words.
fn remove_keyword_phrase(input: &str, keyword: &str) -> String {
    let keyword = keyword.trim();
    if keyword.is_empty() {
        return input.trim().to_string();
    }

    let pattern = if let Some((prefix, suffix)) = split_placeholder(keyword) {
        build_capture_pattern(prefix, suffix)
    } else {
        let keyword_pattern = normalize_for_pattern(keyword);
        if keyword_pattern.is_empty() {
            return input.trim().to_string();
        }
        format!("(?i){keyword_pattern}")
    };
    let cleaned = match Regex::new(&pattern) {
        Ok(re) => re.replace(input, "").into_owned(),
        Err(_) => input.to_string(),
    };
    cleaned.trim().to_string()
}

/// Split a keyword around its single `{value}` placeholder. Returns None
/// for keywords without one; keywords with several never pass validation.
fn split_placeholder(keyword: &str) -> Option<(&str, &str)> {
    let mut parts = keyword.split(VALUE_PLACEHOLDER);
    let prefix = parts.next()?;
    let suffix = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((prefix, suffix))
}

fn capture_value(sentence: &str, prefix: &str, suffix: &str) -> Option<String> {
    let pattern = build_capture_pattern(prefix, suffix);
    let regex = Regex::new(&pattern).ok()?;
    let captures = regex.captures(sentence)?;
    let value = captures.name("value")?.as_str();
    let value = normalize_value(value);
    (!value.is_empty()).then_some(value)
}

fn build_capture_pattern(prefix: &str, suffix: &str) -> String {
    let prefix_pattern = normalize_for_pattern(prefix);
    let suffix_pattern = normalize_for_pattern(suffix);
    // Lazy capture when a suffix anchors the end, greedy otherwise.
    let value_pattern = if suffix_pattern.is_empty() {
        r"[^,，。！？!?.;；:：]+"
    } else {
        r"[^,，。！？!?.;；:：]+?"
    };
    format!("(?i){prefix_pattern}\\s*(?P<value>{value_pattern})\\s*{suffix_pattern}")
}

/// Turn literal text into a pattern matching it width-folded, caseless and
/// with arbitrary whitespace between characters.
fn normalize_for_pattern(text: &str) -> String {
    let mut pattern = String::new();
    for ch in text.chars().filter_map(fold_char) {
        if !pattern.is_empty() {
            pattern.push_str(r"\s*");
        }
        pattern.push_str(&regex::escape(&ch.to_string()));
    }
    pattern
}

fn normalize_for_compare(text: &str) -> String {
    text.chars().filter_map(fold_char).collect()
}

fn normalize_value(value: &str) -> String {
    let trimmed = value.trim();
    let trimmed = trimmed.trim_matches(|ch: char| matches!(ch, '-' | '_' | '.' | ','));
    trimmed.trim().to_string()
}

/// Fold a character for matching: full-width forms to half-width,
/// whitespace dropped, ASCII lowercased.
fn fold_char(ch: char) -> Option<char> {
    let folded = match ch {
        '\u{3000}' => ' ',
        '\u{FF01}'..='\u{FF5E}' => char::from_u32((ch as u32).saturating_sub(0xFEE0)).unwrap_or(ch),
        _ => ch,
    };
    if folded.is_whitespace() {
        None
    } else {
        Some(folded.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(keyword: &str, template: &str, variables: &[&str]) -> TriggerRule {
        TriggerRule {
            id: "test".to_string(),
            title: "Test".to_string(),
            enabled: true,
            auto_apply: false,
            locked: false,
            keyword: keyword.to_string(),
            template: template.to_string(),
            variables: variables.iter().map(|value| value.to_string()).collect(),
        }
    }

    #[test]
    fn two_placeholders_fail_validation() {
        let rule = rule("say {value} and {value}", "{value}", &["x"]);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn literal_keyword_passes_validation() {
        rule("polish", "{input}", &["casual"]).validate().unwrap();
    }

    #[test]
    fn empty_variables_fail_validation() {
        let rule = rule("polish", "{input}", &["  "]);
        assert!(rule.validate().is_err());
    }

    #[test]
    fn removing_locked_default_fails_validation() {
        let mut rules = TriggerRule::defaults();
        rules.retain(|rule| rule.id != "polish");
        assert!(TriggerRule::validate_all(&rules).is_err());
    }

    #[test]
    fn placeholder_capture_feeds_template() {
        let rules = vec![rule(
            "email to {value}",
            "Draft an email to {value}",
            &["boss"],
        )];
        let outcome = resolve("please send email to boss", &rules);
        assert_eq!(outcome.final_text, "Draft an email to boss");
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].value, "boss");
        assert_eq!(outcome.matches[0].mode, TriggerMatchMode::Keyword);
    }

    #[test]
    fn first_matching_rule_wins_final_text() {
        let mut first = rule("email to {value}", "first {value}", &["x"]);
        first.id = "first".to_string();
        let mut second = rule("email", "second {value}", &["x"]);
        second.id = "second".to_string();
        let outcome = resolve("email to boss", &[first, second]);
        assert_eq!(outcome.final_text, "first boss");
        assert_eq!(outcome.matches.len(), 2);
        assert_eq!(outcome.matches[0].rule_id, "first");
        assert_eq!(outcome.matches[1].rule_id, "second");
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut disabled = rule("email", "never", &["x"]);
        disabled.enabled = false;
        let outcome = resolve("email to boss", &[disabled]);
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.final_text, "email to boss");
    }

    #[test]
    fn auto_rule_captures_whole_transcript() {
        let mut auto = rule("never spoken", "summary of: {value}", &["x"]);
        auto.auto_apply = true;
        let outcome = resolve("today we shipped the release", &[auto]);
        assert_eq!(outcome.final_text, "summary of: today we shipped the release");
        assert_eq!(outcome.matches[0].mode, TriggerMatchMode::Auto);
    }

    #[test]
    fn no_match_returns_raw_transcript() {
        let rules = vec![rule("translate to {value}", "{value}", &["English"])];
        let outcome = resolve("just a plain note", &rules);
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.final_text, "just a plain note");
    }

    #[test]
    fn literal_keyword_selects_earliest_variable() {
        let rules = vec![rule(
            "rewrite",
            "Rewrite as {value}: {input}",
            &["casual", "formal"],
        )];
        let outcome = resolve("rewrite this as formal please", &rules);
        assert_eq!(outcome.matches[0].value, "formal");
    }

    #[test]
    fn literal_keyword_falls_back_to_first_variable() {
        let rules = vec![rule("rewrite", "{value}", &["casual", "formal"])];
        let outcome = resolve("please rewrite this", &rules);
        assert_eq!(outcome.matches[0].value, "casual");
    }

    #[test]
    fn sentences_split_on_full_and_half_width_punctuation() {
        let sentences = split_sentences("first，second；third。fourth!");
        assert_eq!(sentences, vec!["first", "second", "third", "fourth"]);
    }

    #[test]
    fn full_width_keyword_still_matches() {
        let rules = vec![rule("翻译为{value}", "译文({value}): {input}", &["英文"])];
        let outcome = resolve("帮我翻译为日文。今天天气不错", &rules);
        assert_eq!(outcome.matches[0].value, "日文");
    }

    #[test]
    fn keyword_phrase_is_stripped_from_input() {
        let rules = vec![rule(
            "translate to {value}",
            "[{value}] {input}",
            &["English"],
        )];
        let outcome = resolve("translate to French, the meeting is at noon", &rules);
        assert!(outcome.final_text.starts_with("[French]"));
        assert!(outcome.final_text.contains("the meeting is at noon"));
        assert!(!outcome.final_text.contains("translate"));
    }

    #[test]
    fn capture_is_bounded_by_sentence_delimiters() {
        let rules = vec![rule("email to {value}", "{value}", &["x"])];
        let outcome = resolve("send email to boss, then call mom", &rules);
        assert_eq!(outcome.final_text, "boss");
    }
}
