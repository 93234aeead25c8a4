//! Value enrichment for low-information milestone updates.
//!
//! A milestone whose value is just "done" or "fixed" says nothing on its own.
//! The descriptive tokens of its key are prefixed to the value instead, so
//! `project_x_api_update_milestone_…` + `done` becomes `Api Update done`.

use std::collections::HashSet;

use tracing::debug;

use crate::keys::milestone_root;

/// Values that carry no information without their key.
pub const LOW_INFORMATION_VALUES: &[&str] =
    &["finished", "completed", "started", "done", "updated", "fixed"];

/// Key vocabulary that only describes structure.
const STRUCTURAL_TOKENS: &[&str] = &["project", "milestone"];

/// Whether `value` is one of the bare status words.
pub fn is_low_information(value: &str) -> bool {
    let normalized = value.trim().to_lowercase();
    LOW_INFORMATION_VALUES.contains(&normalized.as_str())
}

/// Rewrite a low-information `value` using descriptive tokens from `final_key`.
///
/// Tokens of the project root (`resolved_root`, or the key's own milestone
/// root), structural words, status words, and numeric or date tokens are
/// skipped. Returns `value` unchanged when nothing descriptive remains.
pub fn enrich_value(value: &str, final_key: &str, resolved_root: Option<&str>) -> String {
    if !is_low_information(value) {
        return value.to_string();
    }

    let key = final_key.to_lowercase();
    let root = resolved_root
        .map(str::to_lowercase)
        .unwrap_or_else(|| milestone_root(&key).to_string());

    let excluded: HashSet<&str> = root
        .split('_')
        .chain(STRUCTURAL_TOKENS.iter().copied())
        .chain(LOW_INFORMATION_VALUES.iter().copied())
        .collect();

    let descriptive: Vec<String> = key
        .split('_')
        .filter(|token| !token.is_empty())
        .filter(|token| !is_numeric_token(token))
        .filter(|token| !excluded.contains(token))
        .map(capitalize)
        .collect();

    if descriptive.is_empty() {
        return value.to_string();
    }

    let enriched = format!("{} {value}", descriptive.join(" "));
    debug!(%final_key, original = %value, %enriched, "enriched milestone value");
    enriched
}

/// Digits, optionally separated by dashes (`1234`, `2024-05-01`).
fn is_numeric_token(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
        && token.chars().all(|c| c.is_ascii_digit() || c == '-')
}

fn capitalize(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
