use crate::errors::{PipelineError, PipelineResult};
use once_cell::sync::Lazy;
use regex::Regex;
use shared_types::{DetectionReport, Entity, EntityKind};
use std::sync::Arc;

/// Black-box PII recognizer interface.
pub trait PiiDetector: Send + Sync {
    fn detect(&self, text: &str) -> PipelineResult<Vec<Entity>>;
}

/// Output of the code-language classifier.
#[derive(Debug, Clone, Default)]
pub struct CodeReport {
    pub has_code: bool,
    pub language: Option<String>,
    /// Spans of detected code, reported as CODE_BLOCK entities.
    pub blocks: Vec<Entity>,
}

/// Black-box code-language classifier interface.
pub trait CodeClassifier: Send + Sync {
    fn classify(&self, text: &str) -> PipelineResult<CodeReport>;
}

/// Black-box named-entity recognizer interface.
pub trait EntityRecognizer: Send + Sync {
    fn recognize(&self, text: &str) -> PipelineResult<Vec<Entity>>;
}

/// Runs the three recognizers, merges and deduplicates their spans, and
/// computes the sensitivity score. Deterministic for a given input and
/// recognizer set.
pub struct DetectionEngine {
    pii: Arc<dyn PiiDetector>,
    code: Arc<dyn CodeClassifier>,
    ner: Arc<dyn EntityRecognizer>,
}

impl DetectionEngine {
    pub fn new(
        pii: Arc<dyn PiiDetector>,
        code: Arc<dyn CodeClassifier>,
        ner: Arc<dyn EntityRecognizer>,
    ) -> Self {
        DetectionEngine { pii, code, ner }
    }

    /// Engine backed by the built-in regex recognizers.
    pub fn with_defaults() -> Self {
        DetectionEngine::new(
            Arc::new(RegexPiiDetector),
            Arc::new(RegexCodeClassifier),
            Arc::new(HeuristicEntityRecognizer),
        )
    }

    pub fn analyze(&self, query: &str) -> PipelineResult<DetectionReport> {
        let mut spans = self.pii.detect(query)?;
        spans.extend(self.ner.recognize(query)?);
        let code = self.code.classify(query)?;

        let mut entities = dedup_spans(spans);

        // Code spans are kept alongside PII spans even when they nest: code
        // isolation needs the block boundaries while anonymization still has
        // to rewrite PII occurring inside a block.
        let mut blocks = dedup_spans(code.blocks);
        entities.append(&mut blocks);
        entities.sort_by_key(|e| (e.start, e.end));

        let sensitivity_score = sensitivity_score(query, &entities, code.has_code);

        Ok(DetectionReport {
            entities,
            has_code: code.has_code,
            code_language: code.language,
            sensitivity_score,
        })
    }
}

/// Deduplicate overlapping spans: retain the higher-confidence span,
/// tie-break by longer span, then earlier start.
fn dedup_spans(mut spans: Vec<Entity>) -> Vec<Entity> {
    spans.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| (b.end - b.start).cmp(&(a.end - a.start)))
            .then_with(|| a.start.cmp(&b.start))
    });

    let mut kept: Vec<Entity> = Vec::with_capacity(spans.len());
    for span in spans {
        let overlaps = kept
            .iter()
            .any(|k| span.start < k.end && k.start < span.end);
        if !overlaps {
            kept.push(span);
        }
    }

    kept.sort_by_key(|e| (e.start, e.end));
    kept
}

fn sensitivity_score(query: &str, entities: &[Entity], has_code: bool) -> f64 {
    if query.is_empty() {
        return 0.0;
    }

    let pii: Vec<&Entity> = entities
        .iter()
        .filter(|e| e.kind != EntityKind::CodeBlock)
        .collect();

    let pii_span_count = pii.len() as f64;
    let has_high_risk = if pii.iter().any(|e| e.kind.is_high_risk()) {
        1.0
    } else {
        0.0
    };
    let code_present = if has_code { 1.0 } else { 0.0 };
    let entity_chars: usize = pii.iter().map(|e| e.end - e.start).sum();
    let entity_density = entity_chars as f64 / query.len() as f64;

    (0.2 * pii_span_count + 0.3 * has_high_risk + 0.2 * code_present + 0.3 * entity_density)
        .clamp(0.0, 1.0)
}

fn push_matches(
    out: &mut Vec<Entity>,
    re: &Regex,
    text: &str,
    kind: EntityKind,
    confidence: f64,
) {
    for m in re.find_iter(text) {
        out.push(Entity {
            kind,
            start: m.start(),
            end: m.end(),
            text: m.as_str().to_string(),
            confidence,
        });
    }
}

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+\d{1,2}[ .-]?)?(?:\(\d{3}\)|\b\d{3})[ .-]\d{3}[ .-]\d{4}\b").unwrap()
});
static SSN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static CREDIT_CARD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b").unwrap());
static API_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:sk|pk|rk)-[A-Za-z0-9]{16,}\b|\bAKIA[0-9A-Z]{16}\b|\bgh[pousr]_[A-Za-z0-9]{20,}\b")
        .unwrap()
});
static MEDICAL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:MRN|NHS)[- ]?\d{6,10}\b").unwrap());
static ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b\d{1,5}\s+[A-Z][a-z]+(?:\s[A-Z][a-z]+)*\s(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr)\b",
    )
    .unwrap()
});

/// Regex-backed PII recognizer for structured identifiers.
pub struct RegexPiiDetector;

impl PiiDetector for RegexPiiDetector {
    fn detect(&self, text: &str) -> PipelineResult<Vec<Entity>> {
        let mut out = Vec::new();
        push_matches(&mut out, &EMAIL_RE, text, EntityKind::Email, 0.95);
        push_matches(&mut out, &SSN_RE, text, EntityKind::Ssn, 0.97);
        push_matches(&mut out, &CREDIT_CARD_RE, text, EntityKind::CreditCard, 0.9);
        push_matches(&mut out, &API_KEY_RE, text, EntityKind::ApiKey, 0.95);
        push_matches(&mut out, &MEDICAL_ID_RE, text, EntityKind::MedicalId, 0.92);
        push_matches(&mut out, &PHONE_RE, text, EntityKind::Phone, 0.85);
        push_matches(&mut out, &ADDRESS_RE, text, EntityKind::Address, 0.8);
        Ok(out)
    }
}

static FENCED_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```([A-Za-z0-9_+-]*)\n?(.*?)```").unwrap());
static CODE_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:def |class |import |from \S+ import|fn |let mut |pub fn |function |const |#include|public class )")
        .unwrap()
});

fn guess_language(snippet: &str) -> Option<String> {
    if snippet.contains("def ") || snippet.contains("import ") && snippet.contains(':') {
        Some("python".to_string())
    } else if snippet.contains("fn ") || snippet.contains("let mut ") || snippet.contains("::") {
        Some("rust".to_string())
    } else if snippet.contains("function ") || snippet.contains("=>") || snippet.contains("const ")
    {
        Some("javascript".to_string())
    } else if snippet.contains("public class") || snippet.contains("System.out") {
        Some("java".to_string())
    } else if snippet.contains("#include") {
        Some("c".to_string())
    } else {
        None
    }
}

/// Fenced-block and keyword-line code classifier.
pub struct RegexCodeClassifier;

impl CodeClassifier for RegexCodeClassifier {
    fn classify(&self, text: &str) -> PipelineResult<CodeReport> {
        let mut blocks = Vec::new();
        let mut language = None;

        for caps in FENCED_CODE_RE.captures_iter(text) {
            let whole = caps.get(0).expect("group 0 always present");
            let tag = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let body = caps.get(2).map(|m| m.as_str()).unwrap_or("");

            if language.is_none() {
                language = if tag.is_empty() {
                    guess_language(body)
                } else {
                    Some(tag.to_ascii_lowercase())
                };
            }

            blocks.push(Entity {
                kind: EntityKind::CodeBlock,
                start: whole.start(),
                end: whole.end(),
                text: whole.as_str().to_string(),
                confidence: 0.98,
            });
        }

        // Unfenced heuristic: a run of code-looking lines counts as one block.
        if blocks.is_empty() {
            if let Some(m) = CODE_LINE_RE.find(text) {
                let start = m.start();
                let mut end = text.len();
                // Extend to the last line that still looks like code (indented
                // or matching a code keyword).
                let mut cursor = start;
                for line in text[start..].split_inclusive('\n') {
                    let looks_like_code = CODE_LINE_RE.is_match(line)
                        || line.starts_with("    ")
                        || line.starts_with('\t')
                        || line.trim().is_empty();
                    if !looks_like_code {
                        end = cursor;
                        break;
                    }
                    cursor += line.len();
                }
                if end > start {
                    let body = &text[start..end];
                    if language.is_none() {
                        language = guess_language(body);
                    }
                    blocks.push(Entity {
                        kind: EntityKind::CodeBlock,
                        start,
                        end,
                        text: body.to_string(),
                        confidence: 0.8,
                    });
                }
            }
        }

        Ok(CodeReport {
            has_code: !blocks.is_empty(),
            language,
            blocks,
        })
    }
}

static INTRODUCED_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?i:my name is|i am|this is)\s+([A-Z][a-z]+(?:\s[A-Z][a-z]+)+)").unwrap()
});
static NAME_BIGRAM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][a-z]+\s[A-Z][a-z]+\b").unwrap());
static ORGANIZATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z][A-Za-z&]+(?:\s[A-Z][A-Za-z&]+)*\s(?:Inc|Corp|Corporation|Ltd|LLC|GmbH)\b")
        .unwrap()
});

/// Capitalization-pattern entity recognizer for people and organizations.
pub struct HeuristicEntityRecognizer;

impl EntityRecognizer for HeuristicEntityRecognizer {
    fn recognize(&self, text: &str) -> PipelineResult<Vec<Entity>> {
        let mut out = Vec::new();

        for caps in INTRODUCED_NAME_RE.captures_iter(text) {
            if let Some(name) = caps.get(1) {
                out.push(Entity {
                    kind: EntityKind::Person,
                    start: name.start(),
                    end: name.end(),
                    text: name.as_str().to_string(),
                    confidence: 0.9,
                });
            }
        }

        push_matches(
            &mut out,
            &ORGANIZATION_RE,
            text,
            EntityKind::Organization,
            0.75,
        );
        push_matches(&mut out, &NAME_BIGRAM_RE, text, EntityKind::Person, 0.6);

        Ok(out)
    }
}

/// Recognizer stub that always fails; used to exercise the soft-failure path.
pub struct UnavailableDetector;

impl PiiDetector for UnavailableDetector {
    fn detect(&self, _text: &str) -> PipelineResult<Vec<Entity>> {
        Err(PipelineError::DetectionUnavailable(
            "recognizer backend unreachable".to_string(),
        ))
    }
}
