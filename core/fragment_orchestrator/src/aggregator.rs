use crate::anonymizer;
use crate::errors::{PipelineError, PipelineResult};
use shared_types::{
    AggregatedResponse, FragmentKind, FragmentResult, FragmentStatus, FragmentationPlan,
    ProviderConfig, ProviderUsage,
};
use std::collections::{HashMap, HashSet};

const W_PROVIDER: f64 = 0.3;
const W_LENGTH: f64 = 0.2;
const W_COHERENCE: f64 = 0.2;
const W_TYPE_MATCH: f64 = 0.2;
const W_LATENCY: f64 = 0.1;

/// Confidence gap beyond which overlapping adjacent results collapse to
/// the stronger one.
const CONFIDENCE_GAP: f64 = 0.15;
const OVERLAP_JACCARD: f64 = 0.7;

const LENGTH_SATURATION: f64 = 1200.0;

/// Indicator phrases for refusal/apology boilerplate.
const REFUSAL_PHRASES: &[&str] = &[
    "i'm sorry",
    "i am sorry",
    "i apologize",
    "i cannot",
    "i can't",
    "i am unable",
    "i won't be able",
    "as an ai",
];

const TYPE_MISMATCH_SCORE: f64 = 0.6;
const UNKNOWN_PROVIDER_WEIGHT: f64 = 0.5;

/// Confidence-weighted ensemble merge: score each OK result, concatenate in
/// plan order collapsing high-gap overlaps, restore anonymized tokens, and
/// account for privacy, quality, cost, and latency.
pub fn aggregate(
    plan: &FragmentationPlan,
    results: Vec<FragmentResult>,
    providers: &[ProviderConfig],
    fragment_timeout_ms: u64,
) -> PipelineResult<AggregatedResponse> {
    let kinds: HashMap<&str, FragmentKind> = plan
        .fragments
        .iter()
        .map(|f| (f.id.as_str(), f.kind))
        .collect();
    let order: HashMap<&str, usize> = plan
        .fragments
        .iter()
        .enumerate()
        .map(|(i, f)| (f.id.as_str(), i))
        .collect();

    let mut per_fragment = results;
    for result in per_fragment.iter_mut() {
        if result.status == FragmentStatus::Ok {
            let kind = kinds
                .get(result.fragment_id.as_str())
                .copied()
                .unwrap_or(FragmentKind::General);
            result.confidence = composite_confidence(result, kind, providers, fragment_timeout_ms);
        }
    }
    per_fragment.sort_by_key(|r| order.get(r.fragment_id.as_str()).copied().unwrap_or(usize::MAX));

    let ok: Vec<&FragmentResult> = per_fragment.iter().filter(|r| r.is_ok()).collect();
    if ok.is_empty() {
        return Err(PipelineError::AggregationEmpty);
    }

    let merged = merge_in_plan_order(&ok);
    let (final_text, unmatched) = anonymizer::restore(&merged, &plan.entity_map);

    let raw_texts: Vec<&str> = ok.iter().map(|r| r.response_text.as_str()).collect();
    let (restored_chars, leaked_chars) =
        anonymizer::restoration_leakage(&merged, &plan.entity_map, &raw_texts);
    let privacy_score = if restored_chars == 0 {
        1.0
    } else {
        1.0 - leaked_chars as f64 / restored_chars as f64
    };

    let quality_score = ok.iter().map(|r| r.confidence).sum::<f64>() / ok.len() as f64;
    let total_cost = per_fragment.iter().map(|r| r.cost).sum();
    let total_latency_ms = per_fragment.iter().map(|r| r.latency_ms).max().unwrap_or(0);

    let mut diagnostics: Vec<String> = Vec::new();
    for placeholder in unmatched {
        diagnostics.push(format!("unrestored placeholder left verbatim: {placeholder}"));
    }
    for result in per_fragment.iter().filter(|r| !r.is_ok()) {
        diagnostics.push(format!(
            "fragment {} ended {:?} on provider {}",
            result.fragment_id, result.status, result.provider_id
        ));
    }

    let mut usage: HashMap<&str, usize> = HashMap::new();
    for result in &per_fragment {
        *usage.entry(result.provider_id.as_str()).or_insert(0) += 1;
    }
    let mut per_provider: Vec<ProviderUsage> = usage
        .into_iter()
        .map(|(provider_id, fragments_handled)| ProviderUsage {
            provider_id: provider_id.to_string(),
            fragments_handled,
        })
        .collect();
    per_provider.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));

    Ok(AggregatedResponse {
        final_text,
        privacy_score,
        quality_score,
        total_cost,
        total_latency_ms,
        per_fragment,
        per_provider,
        diagnostics,
    })
}

fn composite_confidence(
    result: &FragmentResult,
    kind: FragmentKind,
    providers: &[ProviderConfig],
    fragment_timeout_ms: u64,
) -> f64 {
    let provider = providers.iter().find(|p| p.id == result.provider_id);
    let provider_weight = provider
        .map(|p| p.weight.clamp(0.0, 1.0))
        .unwrap_or(UNKNOWN_PROVIDER_WEIGHT);

    let length_score = (result.response_text.len() as f64 / LENGTH_SATURATION).clamp(0.0, 1.0);
    let coherence_score = coherence(&result.response_text);

    let type_match = match provider {
        Some(p) if p.capabilities.iter().any(|c| c == kind.required_capability()) => 1.0,
        _ => TYPE_MISMATCH_SCORE,
    };

    let latency_score =
        1.0 - (result.latency_ms as f64 / fragment_timeout_ms.max(1) as f64).clamp(0.0, 1.0);

    W_PROVIDER * provider_weight
        + W_LENGTH * length_score
        + W_COHERENCE * coherence_score
        + W_TYPE_MATCH * type_match
        + W_LATENCY * latency_score
}

/// 1 minus the fraction of tokens belonging to refusal/apology phrases.
fn coherence(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let total_tokens = lower.split_whitespace().count();
    if total_tokens == 0 {
        return 0.0;
    }

    let mut refusal_tokens = 0;
    for phrase in REFUSAL_PHRASES {
        let phrase_tokens = phrase.split_whitespace().count();
        refusal_tokens += lower.matches(phrase).count() * phrase_tokens;
    }

    (1.0 - refusal_tokens as f64 / total_tokens as f64).clamp(0.0, 1.0)
}

fn merge_in_plan_order(ok: &[&FragmentResult]) -> String {
    let mut kept: Vec<&FragmentResult> = Vec::with_capacity(ok.len());

    for result in ok {
        match kept.last() {
            Some(prev)
                if (prev.confidence - result.confidence).abs() > CONFIDENCE_GAP
                    && token_jaccard(&prev.response_text, &result.response_text)
                        > OVERLAP_JACCARD =>
            {
                // Overlapping content with a clear confidence gap: keep only
                // the stronger reply.
                if result.confidence > prev.confidence {
                    kept.pop();
                    kept.push(result);
                }
            }
            _ => kept.push(result),
        }
    }

    kept.iter()
        .map(|r| r.response_text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn token_jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = a.to_lowercase().split_whitespace().map(String::from).collect();
    let set_b: HashSet<String> = b.to_lowercase().split_whitespace().map(String::from).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}
