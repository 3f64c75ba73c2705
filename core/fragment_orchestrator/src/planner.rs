use crate::anonymizer;
use crate::errors::{PipelineError, PipelineResult};
use crate::router::{self, RegistrySnapshot};
use once_cell::sync::Lazy;
use regex::Regex;
use shared_types::{
    DetectionReport, EntityKind, EntityMap, FragmentKind, FragmentSpec, FragmentationPlan,
    FragmentationStrategy, PipelineConfig, PrivacyLevel,
};

/// Providers recommended per fragment; the router still makes the final
/// assignment at dispatch time.
const RECOMMENDED_PROVIDERS: usize = 3;

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z][A-Z_]*_\d+\b").unwrap());

/// Sensitivity thresholds, shifted by the requested privacy level.
fn pass_through_threshold(level: PrivacyLevel) -> f64 {
    match level {
        PrivacyLevel::Low => 0.3,
        PrivacyLevel::Medium => 0.2,
        PrivacyLevel::High => 0.1,
    }
}

fn pii_isolate_threshold(level: PrivacyLevel) -> f64 {
    match level {
        PrivacyLevel::Low => 0.6,
        PrivacyLevel::Medium => 0.5,
        PrivacyLevel::High => 0.35,
    }
}

pub fn select_strategy(report: &DetectionReport, level: PrivacyLevel) -> FragmentationStrategy {
    let has_pii = report.has_pii();

    if report.sensitivity_score < pass_through_threshold(level) && !report.has_code {
        FragmentationStrategy::PassThrough
    } else if report.has_code && has_pii {
        FragmentationStrategy::Hybrid
    } else if report.has_code {
        FragmentationStrategy::CodeIsolate
    } else if has_pii && report.sensitivity_score >= pii_isolate_threshold(level) {
        FragmentationStrategy::PiiIsolate
    } else {
        FragmentationStrategy::SemanticSplit
    }
}

/// Produce the fragmentation plan for one query. Deterministic given the
/// same query, report, configuration, and registry snapshot.
pub fn plan(
    query: &str,
    report: &DetectionReport,
    cfg: &PipelineConfig,
    snapshot: &RegistrySnapshot,
) -> PipelineResult<FragmentationPlan> {
    if query.trim().is_empty() {
        return Err(PipelineError::PlanUnfeasible(
            "query is empty after stripping".to_string(),
        ));
    }

    let strategy = select_strategy(report, cfg.privacy_level);

    if strategy == FragmentationStrategy::PassThrough {
        let fragments = vec![FragmentSpec {
            id: "f1".to_string(),
            anonymized_text: query.to_string(),
            kind: FragmentKind::General,
            recommended_providers: router::recommend_for_kind(
                snapshot,
                FragmentKind::General,
                RECOMMENDED_PROVIDERS,
            ),
        }];
        return Ok(FragmentationPlan {
            strategy,
            fragments,
            entity_map: EntityMap::default(),
        });
    }

    let entity_map = anonymizer::build_entity_map(&report.entities);
    let mut pieces = generate_pieces(query, report, &entity_map, strategy, cfg.chunk_size_cap);
    clamp_fragments(&mut pieces, cfg.max_fragments);

    let fragments: Vec<FragmentSpec> = pieces
        .into_iter()
        .enumerate()
        .map(|(i, (text, kind))| FragmentSpec {
            id: format!("f{}", i + 1),
            anonymized_text: text,
            kind,
            recommended_providers: router::recommend_for_kind(
                snapshot,
                kind,
                RECOMMENDED_PROVIDERS,
            ),
        })
        .collect();

    debug_assert!(!fragments.is_empty());
    Ok(FragmentationPlan {
        strategy,
        fragments,
        entity_map,
    })
}

fn generate_pieces(
    query: &str,
    report: &DetectionReport,
    map: &EntityMap,
    strategy: FragmentationStrategy,
    cap: usize,
) -> Vec<(String, FragmentKind)> {
    match strategy {
        FragmentationStrategy::PassThrough => unreachable!("handled by caller"),
        FragmentationStrategy::SemanticSplit => {
            let anonymized = anonymizer::anonymize_text(query, map);
            semantic_split(&anonymized, cap)
        }
        FragmentationStrategy::PiiIsolate => {
            let anonymized = anonymizer::anonymize_text(query, map);
            isolate_pii_sentences(&anonymized, cap)
        }
        FragmentationStrategy::CodeIsolate | FragmentationStrategy::Hybrid => {
            let mut pieces = Vec::new();
            for (text, is_code) in split_code_regions(query, report) {
                let anonymized = anonymizer::anonymize_text(&text, map);
                if is_code {
                    pieces.push((anonymized, FragmentKind::Code));
                } else if anonymized.trim().is_empty() {
                    continue;
                } else if strategy == FragmentationStrategy::Hybrid {
                    pieces.extend(isolate_pii_sentences(&anonymized, cap));
                } else {
                    pieces.extend(pack_general(&split_sentences(&anonymized), cap));
                }
            }
            pieces
        }
    }
}

/// Split the query into alternating prose/code regions using the detected
/// CODE_BLOCK spans, preserving document order.
fn split_code_regions(query: &str, report: &DetectionReport) -> Vec<(String, bool)> {
    let mut blocks: Vec<(usize, usize)> = report
        .entities
        .iter()
        .filter(|e| e.kind == EntityKind::CodeBlock)
        .map(|e| (e.start, e.end))
        .collect();
    blocks.sort_unstable();

    let mut regions = Vec::new();
    let mut cursor = 0;
    for (start, end) in blocks {
        let start = start.max(cursor).min(query.len());
        let end = end.clamp(start, query.len());
        if start > cursor {
            regions.push((query[cursor..start].to_string(), false));
        }
        regions.push((query[start..end].to_string(), true));
        cursor = end;
    }
    if cursor < query.len() {
        regions.push((query[cursor..].to_string(), false));
    }
    regions
}

/// Greedy sentence packing targeting two to three general fragments.
fn semantic_split(text: &str, cap: usize) -> Vec<(String, FragmentKind)> {
    let sentences = split_sentences(text);
    let mut pieces = pack_general(&sentences, cap);

    if pieces.len() == 1 && sentences.len() >= 2 {
        let half = sentences.len().div_ceil(2);
        pieces = vec![
            (sentences[..half].join(" "), FragmentKind::General),
            (sentences[half..].join(" "), FragmentKind::General),
        ];
    }
    while pieces.len() > 3 {
        merge_tail_pair(&mut pieces);
    }
    pieces
}

/// Every sentence carrying a placeholder becomes its own PII_BEARING
/// fragment; runs of clean sentences are greedily packed into GENERAL
/// fragments bounded by the chunk cap.
fn isolate_pii_sentences(text: &str, cap: usize) -> Vec<(String, FragmentKind)> {
    let mut pieces = Vec::new();
    let mut clean_run: Vec<String> = Vec::new();

    for sentence in split_sentences(text) {
        if PLACEHOLDER_RE.is_match(&sentence) {
            pieces.extend(pack_general(&clean_run, cap));
            clean_run.clear();
            pieces.push((sentence, FragmentKind::PiiBearing));
        } else {
            clean_run.push(sentence);
        }
    }
    pieces.extend(pack_general(&clean_run, cap));
    pieces
}

fn pack_general(sentences: &[String], cap: usize) -> Vec<(String, FragmentKind)> {
    let mut pieces = Vec::new();
    let mut current = String::new();

    for sentence in sentences {
        for chunk in split_oversized(sentence, cap) {
            if current.is_empty() {
                current = chunk;
            } else if current.len() + 1 + chunk.len() <= cap {
                current.push(' ');
                current.push_str(&chunk);
            } else {
                pieces.push((std::mem::take(&mut current), FragmentKind::General));
                current = chunk;
            }
        }
    }
    if !current.is_empty() {
        pieces.push((current, FragmentKind::General));
    }
    pieces
}

/// A single sentence longer than the cap is hard-split at word boundaries.
fn split_oversized(sentence: &str, cap: usize) -> Vec<String> {
    if sentence.len() <= cap {
        return vec![sentence.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for word in sentence.split_whitespace() {
        if !current.is_empty() && current.len() + 1 + word.len() > cap {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Clamp to `max_fragments` by merging from the tail, preferring adjacent
/// fragments of the same kind.
fn clamp_fragments(pieces: &mut Vec<(String, FragmentKind)>, max_fragments: usize) {
    let max = max_fragments.max(1);
    while pieces.len() > max {
        let same_kind_idx = (0..pieces.len() - 1)
            .rev()
            .find(|&i| pieces[i].1 == pieces[i + 1].1);
        match same_kind_idx {
            Some(i) => merge_at(pieces, i),
            None => merge_tail_pair(pieces),
        }
    }
}

fn merge_tail_pair(pieces: &mut Vec<(String, FragmentKind)>) {
    if pieces.len() >= 2 {
        let i = pieces.len() - 2;
        merge_at(pieces, i);
    }
}

fn merge_at(pieces: &mut Vec<(String, FragmentKind)>, i: usize) {
    let (tail_text, _) = pieces.remove(i + 1);
    pieces[i].0.push('\n');
    pieces[i].0.push_str(&tail_text);
}

/// Locale-aware-enough sentence splitter: terminal punctuation followed by
/// whitespace ends a sentence unless the preceding token is a known
/// abbreviation.
pub fn split_sentences(text: &str) -> Vec<String> {
    const ABBREVIATIONS: &[&str] = &[
        "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "e.g", "i.e",
    ];

    let mut sentences = Vec::new();
    let mut start = 0;
    let chars: Vec<(usize, char)> = text.char_indices().collect();

    for (pos, &(idx, ch)) in chars.iter().enumerate() {
        if !matches!(ch, '.' | '!' | '?' | ';') {
            continue;
        }
        let next = chars.get(pos + 1).map(|&(_, c)| c);
        let at_boundary = next.map(|c| c.is_whitespace()).unwrap_or(true);
        if !at_boundary {
            continue;
        }

        if ch == '.' {
            let prev_word: String = text[start..idx]
                .split_whitespace()
                .last()
                .unwrap_or("")
                .trim_end_matches('.')
                .to_ascii_lowercase();
            if ABBREVIATIONS.contains(&prev_word.as_str()) {
                continue;
            }
        }

        let end = idx + ch.len_utf8();
        let sentence = text[start..end].trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        start = end;
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DetectionEngine;
    use crate::router::ProviderRegistry;
    use shared_types::{ProviderCircuitBreakerConfig, ProviderConfig};

    fn snapshot() -> std::sync::Arc<RegistrySnapshot> {
        let providers = vec![
            ProviderConfig {
                id: "alpha".to_string(),
                base_url: "http://alpha.local".to_string(),
                api_key: None,
                model_name: "m".to_string(),
                capabilities: vec!["general".to_string(), "sensitive".to_string()],
                weight: 0.8,
                cost_per_1k_tokens: 0.2,
            },
            ProviderConfig {
                id: "bravo".to_string(),
                base_url: "http://bravo.local".to_string(),
                api_key: None,
                model_name: "m".to_string(),
                capabilities: vec!["general".to_string(), "code".to_string()],
                weight: 0.8,
                cost_per_1k_tokens: 0.4,
            },
        ];
        ProviderRegistry::new(providers, ProviderCircuitBreakerConfig::default()).snapshot()
    }

    fn analyze(query: &str) -> shared_types::DetectionReport {
        DetectionEngine::with_defaults().analyze(query).unwrap()
    }

    #[test]
    fn empty_query_is_unfeasible() {
        let report = shared_types::DetectionReport::empty();
        let err = plan("   \n ", &report, &PipelineConfig::default(), &snapshot()).unwrap_err();
        assert!(matches!(err, PipelineError::PlanUnfeasible(_)));
    }

    #[test]
    fn clean_query_passes_through_unchanged() {
        let query = "What is the capital of France?";
        let report = analyze(query);
        let plan = plan(query, &report, &PipelineConfig::default(), &snapshot()).unwrap();

        assert_eq!(plan.strategy, FragmentationStrategy::PassThrough);
        assert_eq!(plan.fragments.len(), 1);
        assert_eq!(plan.fragments[0].anonymized_text, query);
        assert!(plan.entity_map.is_empty());
    }

    #[test]
    fn pii_query_isolates_pii_sentences() {
        let query = "My name is Sarah Johnson, email sarah@example.com; summarize GDPR basics.";
        let report = analyze(query);
        let plan = plan(query, &report, &PipelineConfig::default(), &snapshot()).unwrap();

        assert_eq!(plan.strategy, FragmentationStrategy::PiiIsolate);
        assert!(plan.fragments.len() >= 2);
        assert!(plan
            .fragments
            .iter()
            .any(|f| f.kind == FragmentKind::PiiBearing));

        for fragment in &plan.fragments {
            assert!(!fragment.anonymized_text.contains("Sarah Johnson"));
            assert!(!fragment.anonymized_text.contains("sarah@example.com"));
        }
        assert_eq!(plan.entity_map.placeholder_for("Sarah Johnson"), Some("PERSON_1"));
        assert_eq!(
            plan.entity_map.placeholder_for("sarah@example.com"),
            Some("EMAIL_1")
        );
    }

    #[test]
    fn code_with_pii_selects_hybrid() {
        let query = "Please review the function below and email feedback to dev@example.com.\n\
                     ```python\ndef add(a, b):\n    return a + b\n```\nThanks a lot.";
        let report = analyze(query);
        let plan = plan(query, &report, &PipelineConfig::default(), &snapshot()).unwrap();

        assert_eq!(plan.strategy, FragmentationStrategy::Hybrid);
        assert!(plan.fragments.iter().any(|f| f.kind == FragmentKind::Code));
        assert!(plan
            .fragments
            .iter()
            .any(|f| f.kind == FragmentKind::PiiBearing));
        for fragment in &plan.fragments {
            assert!(!fragment.anonymized_text.contains("dev@example.com"));
        }
    }

    #[test]
    fn code_only_selects_code_isolate() {
        let query = "Explain this snippet.\n```rust\nfn main() {\n    println!(\"hi\");\n}\n```";
        let report = analyze(query);
        let plan = plan(query, &report, &PipelineConfig::default(), &snapshot()).unwrap();

        assert_eq!(plan.strategy, FragmentationStrategy::CodeIsolate);
        let code = plan
            .fragments
            .iter()
            .find(|f| f.kind == FragmentKind::Code)
            .expect("code fragment");
        assert!(code.anonymized_text.contains("fn main"));
    }

    #[test]
    fn semantic_split_targets_two_to_three_fragments() {
        // One mild entity keeps the score above the pass-through threshold
        // without crossing into PII isolation.
        let query = "Alice Brown leads the grid team. Solar power keeps growing worldwide. \
                     Wind energy complements it well. Storage remains the hardest part. \
                     Policy determines the pace.";
        let report = analyze(query);
        let cfg = PipelineConfig {
            chunk_size_cap: 80,
            ..PipelineConfig::default()
        };
        let plan = plan(query, &report, &cfg, &snapshot()).unwrap();

        assert_eq!(plan.strategy, FragmentationStrategy::SemanticSplit);
        assert!((2..=3).contains(&plan.fragments.len()), "got {}", plan.fragments.len());
        assert!(plan
            .fragments
            .iter()
            .all(|f| f.kind == FragmentKind::General));
    }

    #[test]
    fn fragment_count_is_clamped_by_tail_merge() {
        let query = "My SSN is 123-45-6789. Alice Brown helps me. Contact a@b.co today. \
                     Call 555-123-4567 soon. Card 4111 1111 1111 1111 is on file. \
                     Write to Carol Jones too.";
        let report = analyze(query);
        let cfg = PipelineConfig {
            max_fragments: 3,
            ..PipelineConfig::default()
        };
        let plan = plan(query, &report, &cfg, &snapshot()).unwrap();

        assert!(plan.fragments.len() <= 3);
        assert!(!plan.fragments.is_empty());
        for fragment in &plan.fragments {
            assert!(!fragment.anonymized_text.contains("123-45-6789"));
        }
    }

    #[test]
    fn plans_are_deterministic() {
        let query = "My name is Sarah Johnson, email sarah@example.com; summarize GDPR basics.";
        let report = analyze(query);
        let cfg = PipelineConfig::default();
        let snap = snapshot();

        let a = plan(query, &report, &cfg, &snap).unwrap();
        let b = plan(query, &report, &cfg, &snap).unwrap();
        assert_eq!(a.strategy, b.strategy);
        assert_eq!(a.fragments, b.fragments);
        assert_eq!(a.entity_map.entries, b.entity_map.entries);
    }

    #[test]
    fn sentence_splitter_respects_abbreviations() {
        let sentences = split_sentences("Dr. Smith arrived. He was late.");
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0], "Dr. Smith arrived.");

        let sentences = split_sentences("One sentence only");
        assert_eq!(sentences.len(), 1);
    }

    #[test]
    fn sentence_splitter_breaks_on_semicolons() {
        let sentences = split_sentences("redact my data; summarize the rest.");
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0], "redact my data;");
    }

    #[test]
    fn high_privacy_level_lowers_pass_through_threshold() {
        // A single short entity keeps the score under the medium threshold
        // but over the high one.
        let query = "Please email a reply to a@b.co about renewable subsidies and timelines.";
        let report = analyze(query);
        assert!(report.sensitivity_score < 0.3);

        assert_eq!(
            select_strategy(&report, PrivacyLevel::Low),
            FragmentationStrategy::PassThrough
        );
        assert_ne!(
            select_strategy(&report, PrivacyLevel::High),
            FragmentationStrategy::PassThrough
        );
    }
}
