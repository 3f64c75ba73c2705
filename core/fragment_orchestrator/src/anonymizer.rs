use once_cell::sync::Lazy;
use regex::Regex;
use shared_types::{Entity, EntityKind, EntityMap, EntityMapping};
use std::collections::HashMap;

/// Token shape of a placeholder, e.g. "PERSON_1" or "CREDIT_CARD_2".
static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z][A-Z_]*_\d+\b").unwrap());

/// Build the entity map by walking detected spans in order. Placeholders are
/// numbered per kind starting at 1; a repeated original reuses its first
/// placeholder so the map stays a bijection. Code blocks are isolated, not
/// anonymized, and are skipped here.
pub fn build_entity_map(entities: &[Entity]) -> EntityMap {
    let mut counters: HashMap<EntityKind, usize> = HashMap::new();
    let mut entries: Vec<EntityMapping> = Vec::new();

    let mut ordered: Vec<&Entity> = entities
        .iter()
        .filter(|e| e.kind != EntityKind::CodeBlock)
        .collect();
    ordered.sort_by_key(|e| (e.start, e.end));

    for entity in ordered {
        if entries.iter().any(|m| m.original == entity.text) {
            continue;
        }
        let n = counters.entry(entity.kind).or_insert(0);
        *n += 1;
        entries.push(EntityMapping {
            original: entity.text.clone(),
            placeholder: format!("{}_{}", entity.kind.label(), n),
            kind: entity.kind,
        });
    }

    EntityMap { entries }
}

/// Replace every mapped original with its placeholder. Longer originals are
/// substituted first so an original that contains another is not clobbered.
pub fn anonymize_text(text: &str, map: &EntityMap) -> String {
    let mut entries: Vec<&EntityMapping> = map.entries.iter().collect();
    entries.sort_by_key(|m| std::cmp::Reverse(m.original.len()));

    let mut out = text.to_string();
    for entry in entries {
        out = out.replace(&entry.original, &entry.placeholder);
    }
    out
}

/// Invert the entity map on `text` using whole-word boundary matching.
/// Placeholder-shaped tokens absent from the map are left verbatim and
/// returned so the aggregator can flag them in the quality diagnostics.
pub fn restore(text: &str, map: &EntityMap) -> (String, Vec<String>) {
    let mut out = String::with_capacity(text.len());
    let mut unmatched = Vec::new();
    let mut last = 0;

    for m in PLACEHOLDER_RE.find_iter(text) {
        out.push_str(&text[last..m.start()]);
        match map.original_for(m.as_str()) {
            Some(original) => out.push_str(original),
            None => {
                unmatched.push(m.as_str().to_string());
                out.push_str(m.as_str());
            }
        }
        last = m.end();
    }
    out.push_str(&text[last..]);

    (out, unmatched)
}

/// Number of characters `restore` would substitute into `text`, alongside
/// how many of those belong to entries whose original appears in any of the
/// given raw provider responses. Drives the privacy score.
pub fn restoration_leakage(text: &str, map: &EntityMap, raw_responses: &[&str]) -> (usize, usize) {
    let mut restored_chars = 0;
    let mut leaked_chars = 0;

    for m in PLACEHOLDER_RE.find_iter(text) {
        if let Some(original) = map.original_for(m.as_str()) {
            restored_chars += original.len();
            if raw_responses.iter().any(|r| r.contains(original)) {
                leaked_chars += original.len();
            }
        }
    }

    (restored_chars, leaked_chars)
}
