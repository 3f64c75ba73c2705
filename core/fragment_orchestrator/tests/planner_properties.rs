use fragment_orchestrator::anonymizer;
use fragment_orchestrator::detection::DetectionEngine;
use fragment_orchestrator::planner;
use fragment_orchestrator::router::ProviderRegistry;
use once_cell::sync::Lazy;
use proptest::prelude::*;
use regex::Regex;
use shared_types::{
    EntityKind, EntityMap, EntityMapping, FragmentationStrategy, PipelineConfig,
    PrivacyLevel, ProviderCircuitBreakerConfig, ProviderConfig,
};
use std::sync::Arc;

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z][A-Z_]*_\d+\b").unwrap());

const NEUTRAL_SENTENCES: &[&str] = &[
    "the quarterly report is due soon.",
    "please summarize the key findings.",
    "we should compare vendor options carefully.",
    "the migration plan still needs another review.",
    "budget estimates look reasonable this quarter.",
    "deployment is scheduled for next week.",
];

const PII_SENTENCES: &[&str] = &[
    "my name is Alice Brown and i need help.",
    "contact me at user@example.com for details.",
    "my ssn is 123-45-6789.",
    "the card 4111 1111 1111 1111 has expired.",
    "call 555-123-4567 tomorrow morning.",
];

fn registry_snapshot() -> Arc<fragment_orchestrator::router::RegistrySnapshot> {
    let providers = vec![
        ProviderConfig {
            id: "alpha".to_string(),
            base_url: "http://alpha.local".to_string(),
            api_key: None,
            model_name: "m".to_string(),
            capabilities: vec![
                "general".to_string(),
                "sensitive".to_string(),
                "code".to_string(),
            ],
            weight: 0.9,
            cost_per_1k_tokens: 0.1,
        },
        ProviderConfig {
            id: "bravo".to_string(),
            base_url: "http://bravo.local".to_string(),
            api_key: None,
            model_name: "m".to_string(),
            capabilities: vec!["general".to_string(), "sensitive".to_string()],
            weight: 0.9,
            cost_per_1k_tokens: 0.3,
        },
    ];
    ProviderRegistry::new(providers, ProviderCircuitBreakerConfig::default()).snapshot()
}

fn privacy_level_strategy() -> impl Strategy<Value = PrivacyLevel> {
    prop::sample::select(vec![PrivacyLevel::Low, PrivacyLevel::Medium, PrivacyLevel::High])
}

fn query_strategy() -> impl Strategy<Value = String> {
    let neutral = prop::collection::vec(prop::sample::select(NEUTRAL_SENTENCES.to_vec()), 0..5);
    let pii = prop::sample::subsequence(PII_SENTENCES.to_vec(), 0..PII_SENTENCES.len());
    (neutral, pii, any::<bool>()).prop_filter_map(
        "query must be non-empty",
        |(neutral, pii, pii_first)| {
            let mut sentences: Vec<&str> = Vec::new();
            if pii_first {
                sentences.extend(pii.iter());
                sentences.extend(neutral.iter());
            } else {
                sentences.extend(neutral.iter());
                sentences.extend(pii.iter());
            }
            if sentences.is_empty() {
                None
            } else {
                Some(sentences.join(" "))
            }
        },
    )
}

proptest! {
    /// Anonymization invariant and placeholder closure: no fragment of a
    /// fragmenting plan contains a mapped original, and every placeholder
    /// occurring in a fragment is a key of the inverse map.
    #[test]
    fn fragments_never_leak_mapped_originals(
        query in query_strategy(),
        level in privacy_level_strategy(),
        max_fragments in 1usize..=6,
        chunk_size_cap in 120usize..=400,
    ) {
        let report = DetectionEngine::with_defaults().analyze(&query).unwrap();
        let cfg = PipelineConfig {
            max_fragments,
            chunk_size_cap,
            privacy_level: level,
            ..PipelineConfig::default()
        };
        let snapshot = registry_snapshot();
        let plan = planner::plan(&query, &report, &cfg, &snapshot).unwrap();

        prop_assert!(!plan.fragments.is_empty());
        prop_assert!(plan.fragments.len() <= max_fragments);

        if plan.strategy != FragmentationStrategy::PassThrough {
            for fragment in &plan.fragments {
                for original in plan.entity_map.originals() {
                    prop_assert!(
                        !fragment.anonymized_text.contains(original),
                        "fragment {:?} leaks {:?}",
                        fragment.id,
                        original
                    );
                }
                for m in PLACEHOLDER_RE.find_iter(&fragment.anonymized_text) {
                    prop_assert!(
                        plan.entity_map.original_for(m.as_str()).is_some(),
                        "placeholder {:?} missing from entity map",
                        m.as_str()
                    );
                }
            }
        }
    }

    /// Determinism: the same query, report, policy, and registry snapshot
    /// always produce the same plan.
    #[test]
    fn planning_is_deterministic(
        query in query_strategy(),
        level in privacy_level_strategy(),
        max_fragments in 1usize..=6,
    ) {
        let engine = DetectionEngine::with_defaults();
        let cfg = PipelineConfig {
            max_fragments,
            privacy_level: level,
            ..PipelineConfig::default()
        };
        let snapshot = registry_snapshot();

        let report_a = engine.analyze(&query).unwrap();
        let report_b = engine.analyze(&query).unwrap();
        prop_assert_eq!(&report_a.entities, &report_b.entities);

        let plan_a = planner::plan(&query, &report_a, &cfg, &snapshot).unwrap();
        let plan_b = planner::plan(&query, &report_b, &cfg, &snapshot).unwrap();
        prop_assert_eq!(plan_a.strategy, plan_b.strategy);
        prop_assert_eq!(plan_a.fragments, plan_b.fragments);
        prop_assert_eq!(plan_a.entity_map.entries, plan_b.entity_map.entries);
    }
}

const KINDS: &[EntityKind] = &[
    EntityKind::Person,
    EntityKind::Email,
    EntityKind::Phone,
    EntityKind::Location,
    EntityKind::Organization,
];

const SEPARATORS: &[&str] = &[" ", ", ", " | ", "\n", " and then "];

fn entity_map_strategy() -> impl Strategy<Value = EntityMap> {
    prop::collection::vec(prop::sample::select(KINDS.to_vec()), 1..=6).prop_map(|kinds| {
        let mut counters = std::collections::HashMap::new();
        let entries = kinds
            .into_iter()
            .enumerate()
            .map(|(i, kind)| {
                let n = counters.entry(kind).or_insert(0usize);
                *n += 1;
                EntityMapping {
                    original: format!("span{i}content"),
                    placeholder: format!("{}_{}", kind.label(), n),
                    kind,
                }
            })
            .collect();
        EntityMap { entries }
    })
}

proptest! {
    /// Restoration round-trip: for a text made of mapped originals joined
    /// by arbitrary non-placeholder separators, anonymize then restore is
    /// the identity.
    #[test]
    fn restore_inverts_anonymize(
        map in entity_map_strategy(),
        separator_picks in prop::collection::vec(prop::sample::select(SEPARATORS.to_vec()), 0..8),
    ) {
        let originals: Vec<&str> = map.originals().collect();
        let mut text = String::new();
        for (i, original) in originals.iter().enumerate() {
            if i > 0 {
                let sep = separator_picks
                    .get(i - 1)
                    .copied()
                    .unwrap_or(" ");
                text.push_str(sep);
            }
            text.push_str(original);
        }

        let anonymized = anonymizer::anonymize_text(&text, &map);
        for original in &originals {
            prop_assert!(!anonymized.contains(original));
        }

        let (restored, unmatched) = anonymizer::restore(&anonymized, &map);
        prop_assert_eq!(restored, text);
        prop_assert!(unmatched.is_empty());
    }
}
