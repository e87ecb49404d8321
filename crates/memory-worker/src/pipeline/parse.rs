//! Parse: fault-tolerant extraction of `<observation>` and `<summary>` blocks.
//!
//! Every field goes through the same ladder: exact XML tag, tolerant tag
//! (attributes, surrounding whitespace), then a `## field` markdown header.
//! Template placeholders such as `[short title]` count as missing. Missing
//! fields never drop a block; an observation is always kept with whatever
//! was found.
//!
//! Metrics: the exact tag is a success, a lower rung (or a type recovered
//! from free text) is a fallback, and a field left empty is a failure.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::PipelineError;
use crate::memory_db::{ObservationType, ParsedObservation, ParsedSummary, QueueItemKind};
use crate::metrics;

/// Type used when the model's type is missing or not a known value.
pub const FALLBACK_TYPE: ObservationType = ObservationType::Discovery;

lazy_static! {
    static ref OBSERVATION_BLOCK: Regex =
        Regex::new(r"(?is)<observation>(.*?)</observation>").expect("valid regex");
    static ref SUMMARY_BLOCK: Regex =
        Regex::new(r"(?is)<summary>(.*?)</summary>").expect("valid regex");
    static ref SKIP_SUMMARY: Regex =
        Regex::new(r#"<skip_summary\s+reason="([^"]+)"\s*/>"#).expect("valid regex");
    /// Compiled per field name on first use.
    static ref FIELD_LADDERS: Mutex<HashMap<&'static str, Arc<Vec<Regex>>>> =
        Mutex::new(HashMap::new());
    static ref LIST_PATTERNS: Mutex<HashMap<&'static str, Regex>> = Mutex::new(HashMap::new());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Fallback,
    Failure,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Fallback => "fallback",
            Outcome::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FieldMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub fallbacks: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ParseMetrics {
    pub total_attempts: u64,
    pub successful_extractions: u64,
    pub fallbacks_used: u64,
    pub failures: u64,
    pub fields: BTreeMap<String, FieldMetrics>,
}

impl ParseMetrics {
    /// Share of extractions that produced a value, through the exact tag or
    /// a fallback. 100 before anything was parsed.
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            return 100.0;
        }
        (self.successful_extractions + self.fallbacks_used) as f64 / self.total_attempts as f64
            * 100.0
    }

    fn track(&mut self, field: &str, outcome: Outcome) {
        self.total_attempts += 1;
        let entry = self.fields.entry(field.to_string()).or_default();
        entry.attempts += 1;
        match outcome {
            Outcome::Success => {
                self.successful_extractions += 1;
                entry.successes += 1;
            }
            Outcome::Fallback => {
                self.fallbacks_used += 1;
                entry.fallbacks += 1;
            }
            Outcome::Failure => {
                self.failures += 1;
                entry.failures += 1;
            }
        }
        metrics::inc_parse_outcome(outcome.as_str());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SummaryOutcome {
    Found(ParsedSummary),
    Skipped { reason: String },
    Missing,
}

/// Result of parsing one model response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutput {
    pub observations: Vec<ParsedObservation>,
    pub summary: Option<ParsedSummary>,
    pub skip_reason: Option<String>,
    pub fallbacks_used: u64,
    pub fields_extracted: u64,
}

impl ParseOutput {
    pub fn structure_count(&self) -> usize {
        self.observations.len() + usize::from(self.summary.is_some())
    }
}

/// Per-call bookkeeping folded into the shared metrics at the end.
#[derive(Default)]
struct Tally {
    entries: Vec<(String, Outcome)>,
}

impl Tally {
    fn record(&mut self, field: &str, outcome: Outcome) {
        self.entries.push((field.to_string(), outcome));
    }

    fn count(&self, outcome: Outcome) -> u64 {
        self.entries.iter().filter(|(_, o)| *o == outcome).count() as u64
    }
}

pub struct ResponseParser {
    strict: bool,
    metrics: Mutex<ParseMetrics>,
}

impl ResponseParser {
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            metrics: Mutex::new(ParseMetrics::default()),
        }
    }

    pub fn metrics(&self) -> ParseMetrics {
        self.metrics.lock().clone()
    }

    pub fn reset_metrics(&self) {
        *self.metrics.lock() = ParseMetrics::default();
    }

    /// Parse everything the response contains. In strict mode a response
    /// without any structure (and without an explicit summary skip) fails.
    pub fn parse(&self, text: &str, kind: QueueItemKind) -> Result<ParseOutput, PipelineError> {
        let mut tally = Tally::default();
        let observations = parse_observations(text, &mut tally);
        let summary = if kind == QueueItemKind::Summarize || SUMMARY_BLOCK.is_match(text) {
            parse_summary(text, &mut tally)
        } else {
            SummaryOutcome::Missing
        };

        let mut output = ParseOutput {
            observations,
            fallbacks_used: tally.count(Outcome::Fallback),
            fields_extracted: tally.count(Outcome::Success),
            ..Default::default()
        };
        match summary {
            SummaryOutcome::Found(summary) => output.summary = Some(summary),
            SummaryOutcome::Skipped { reason } => {
                info!("Summary skipped by model: {}", reason);
                output.skip_reason = Some(reason);
            }
            SummaryOutcome::Missing => {}
        }

        if output.structure_count() == 0 && output.skip_reason.is_none() && self.strict {
            tally.record("response", Outcome::Failure);
            self.fold(tally);
            return Err(PipelineError::MalformedOutput(format!(
                "no observation or summary in {} chars of output",
                text.len()
            )));
        }

        self.fold(tally);
        Ok(output)
    }

    fn fold(&self, tally: Tally) {
        let mut metrics = self.metrics.lock();
        for (field, outcome) in tally.entries {
            metrics.track(&field, outcome);
        }
        if metrics.total_attempts > 0 && metrics.total_attempts % 100 == 0 {
            info!(
                "Parse metrics: {:.1}% success over {} extractions, {} fallbacks",
                metrics.success_rate(),
                metrics.total_attempts,
                metrics.fallbacks_used
            );
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new(false)
    }
}

fn parse_observations(text: &str, tally: &mut Tally) -> Vec<ParsedObservation> {
    OBSERVATION_BLOCK
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|block| {
            let content = block.as_str();
            let obs_type = extract_type(content, tally);
            let mut concepts = extract_list(content, "concepts", "concept", tally);
            let before = concepts.len();
            concepts.retain(|c| !c.eq_ignore_ascii_case(obs_type.as_str()));
            if concepts.len() != before {
                debug!("Removed observation type {} from concepts", obs_type.as_str());
            }

            ParsedObservation {
                obs_type,
                title: extract_section(content, "title", tally),
                subtitle: extract_section(content, "subtitle", tally),
                narrative: extract_section(content, "narrative", tally),
                facts: extract_list(content, "facts", "fact", tally),
                concepts,
                files_read: extract_list(content, "files_read", "file", tally),
                files_modified: extract_list(content, "files_modified", "file", tally),
            }
        })
        .collect()
}

fn parse_summary(text: &str, tally: &mut Tally) -> SummaryOutcome {
    if let Some(caps) = SKIP_SUMMARY.captures(text) {
        let reason = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        return SummaryOutcome::Skipped { reason };
    }
    let content = match SUMMARY_BLOCK.captures(text).and_then(|caps| caps.get(1)) {
        Some(block) => block.as_str(),
        None => return SummaryOutcome::Missing,
    };

    // A summary is always kept, even with every field missing
    SummaryOutcome::Found(ParsedSummary {
        request: extract_section(content, "request", tally),
        investigated: extract_section(content, "investigated", tally),
        learned: extract_section(content, "learned", tally),
        completed: extract_section(content, "completed", tally),
        next_steps: extract_section(content, "next_steps", tally),
        notes: extract_section(content, "notes", tally),
    })
}

fn is_placeholder(value: &str) -> bool {
    value.starts_with('[') || value.ends_with(']')
}

fn field_ladder(field: &'static str) -> Arc<Vec<Regex>> {
    let mut cache = FIELD_LADDERS.lock();
    let ladder = cache.entry(field).or_insert_with(|| {
        let escaped = regex::escape(field);
        let patterns = [
            format!(r"(?is)<{f}>(.*?)</{f}>", f = escaped),
            format!(r"(?is)<{f}(?:\s[^>]*)?>\s*(.*?)\s*</{f}>", f = escaped),
            format!(r"(?i)##\s*{f}\s+([^#]+)", f = escaped),
        ];
        Arc::new(patterns.iter().filter_map(|p| Regex::new(p).ok()).collect())
    });
    Arc::clone(ladder)
}

fn list_pattern(key: &'static str, pattern: impl FnOnce() -> String) -> Option<Regex> {
    let mut cache = LIST_PATTERNS.lock();
    if let Some(re) = cache.get(key) {
        return Some(re.clone());
    }
    let re = Regex::new(&pattern()).ok()?;
    cache.insert(key, re.clone());
    Some(re)
}

/// The value and whether it took a lower rung of the ladder to find it.
fn find_section(content: &str, field: &'static str) -> Option<(String, Outcome)> {
    for (rung, re) in field_ladder(field).iter().enumerate() {
        if let Some(value) = re.captures(content).and_then(|caps| caps.get(1)) {
            let trimmed = value.as_str().trim();
            if !trimmed.is_empty() && !is_placeholder(trimmed) {
                let outcome = if rung == 0 { Outcome::Success } else { Outcome::Fallback };
                return Some((trimmed.to_string(), outcome));
            }
        }
    }
    None
}

fn extract_section(content: &str, field: &'static str, tally: &mut Tally) -> Option<String> {
    match find_section(content, field) {
        Some((value, outcome)) => {
            tally.record(field, outcome);
            Some(value)
        }
        None => {
            tally.record(field, Outcome::Failure);
            None
        }
    }
}

fn extract_type(content: &str, tally: &mut Tally) -> ObservationType {
    let Some((raw, found)) = find_section(content, "type") else {
        tally.record("type", Outcome::Failure);
        warn!("Observation without type, using {}", FALLBACK_TYPE.as_str());
        return FALLBACK_TYPE;
    };
    let normalized = raw.to_lowercase();
    if let Some(obs_type) = ObservationType::parse(&normalized) {
        tally.record("type", found);
        return obs_type;
    }
    let recovered = ObservationType::ALL
        .iter()
        .copied()
        .find(|t| normalized.contains(t.as_str()));
    match recovered {
        Some(obs_type) => {
            tally.record("type", Outcome::Fallback);
            obs_type
        }
        None => {
            tally.record("type_validation", Outcome::Failure);
            warn!(
                "Invalid observation type {:?}, using {}",
                raw,
                FALLBACK_TYPE.as_str()
            );
            FALLBACK_TYPE
        }
    }
}

fn extract_list(
    content: &str,
    container: &'static str,
    element: &'static str,
    tally: &mut Tally,
) -> Vec<String> {
    let container_re = list_pattern(container, || {
        format!(r"(?is)<{c}>(.*?)</{c}>", c = regex::escape(container))
    });
    let element_re = list_pattern(element, || {
        format!(r"(?i)<{e}>([^<]+)</{e}>", e = regex::escape(element))
    });
    let (Some(container_re), Some(element_re)) = (container_re, element_re) else {
        tally.record(container, Outcome::Failure);
        return Vec::new();
    };

    let Some(inner) = container_re.captures(content).and_then(|caps| caps.get(1)) else {
        tally.record(container, Outcome::Failure);
        return Vec::new();
    };
    let values: Vec<String> = element_re
        .captures_iter(inner.as_str())
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|v| !v.is_empty() && !is_placeholder(v))
        .collect();

    if values.is_empty() {
        tally.record(container, Outcome::Failure);
    } else {
        tally.record(container, Outcome::Success);
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
Some preamble the model added.
<observation>
  <type>bugfix</type>
  <title>Fixed token refresh race</title>
  <subtitle>Refresh now holds the session lock</subtitle>
  <facts>
    <fact>auth/refresh.rs takes the session mutex</fact>
    <fact>[Concise, self-contained statement]</fact>
  </facts>
  <narrative>Two requests refreshed at once and one lost.</narrative>
  <concepts>
    <concept>problem-solution</concept>
    <concept>bugfix</concept>
  </concepts>
  <files_read><file>auth/session.rs</file></files_read>
  <files_modified><file>auth/refresh.rs</file></files_modified>
</observation>
<observation>
  <type>Feature: new endpoint</type>
  <title>[**title**: Short title]</title>
</observation>
"#;

    #[test]
    fn test_parses_observations_with_fallbacks() {
        let parser = ResponseParser::new(false);
        let output = parser.parse(FULL, QueueItemKind::Observation).unwrap();
        assert_eq!(output.observations.len(), 2);

        let first = &output.observations[0];
        assert_eq!(first.obs_type, ObservationType::Bugfix);
        assert_eq!(first.title.as_deref(), Some("Fixed token refresh race"));
        assert_eq!(first.facts, vec!["auth/refresh.rs takes the session mutex"]);
        assert_eq!(first.concepts, vec!["problem-solution"]);
        assert_eq!(first.files_modified, vec!["auth/refresh.rs"]);

        let second = &output.observations[1];
        assert_eq!(second.obs_type, ObservationType::Feature);
        assert_eq!(second.title, None);
        assert!(second.facts.is_empty());
        assert!(output.fallbacks_used > 0);
        assert!(output.summary.is_none());
    }

    #[test]
    fn test_unknown_type_falls_back() {
        let parser = ResponseParser::new(false);
        let output = parser
            .parse(
                "<observation><type>musing</type><title>t</title></observation>",
                QueueItemKind::Observation,
            )
            .unwrap();
        assert_eq!(output.observations[0].obs_type, FALLBACK_TYPE);
        assert_eq!(parser.metrics().fields["type_validation"].failures, 1);
    }

    #[test]
    fn test_tolerant_tag_and_markdown_fallbacks() {
        let content = "<title class=\"x\">\n  Spaced title \n</title>\n## narrative\nExplained in markdown\n";
        let mut tally = Tally::default();
        assert_eq!(
            extract_section(content, "title", &mut tally).as_deref(),
            Some("Spaced title")
        );
        assert_eq!(
            extract_section(content, "narrative", &mut tally).as_deref(),
            Some("Explained in markdown")
        );
        assert_eq!(extract_section(content, "subtitle", &mut tally), None);
        assert_eq!(tally.count(Outcome::Success), 0);
        assert_eq!(tally.count(Outcome::Fallback), 2);
        assert_eq!(tally.count(Outcome::Failure), 1);
    }

    #[test]
    fn test_field_regexes_are_compiled_once() {
        let first = field_ladder("narrative");
        let second = field_ladder("narrative");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_summary_with_missing_fields_is_kept() {
        let parser = ResponseParser::new(false);
        let output = parser
            .parse(
                "<summary><request>Add login</request><learned>[placeholder]</learned></summary>",
                QueueItemKind::Summarize,
            )
            .unwrap();
        let summary = output.summary.unwrap();
        assert_eq!(summary.request.as_deref(), Some("Add login"));
        assert_eq!(summary.learned, None);
        assert_eq!(summary.next_steps, None);
    }

    #[test]
    fn test_skip_summary() {
        let parser = ResponseParser::new(true);
        let output = parser
            .parse(
                r#"<skip_summary reason="no meaningful work" />"#,
                QueueItemKind::Summarize,
            )
            .unwrap();
        assert!(output.summary.is_none());
        assert_eq!(output.skip_reason.as_deref(), Some("no meaningful work"));
    }

    #[test]
    fn test_strict_mode_rejects_empty_response() {
        let lenient = ResponseParser::new(false);
        assert_eq!(
            lenient.parse("nothing worth recording", QueueItemKind::Observation).unwrap(),
            ParseOutput::default()
        );

        let strict = ResponseParser::new(true);
        let err = strict
            .parse("nothing worth recording", QueueItemKind::Observation)
            .unwrap_err();
        assert!(matches!(err, PipelineError::MalformedOutput(_)));
        assert!(!err.is_contract_violation());
        assert_eq!(strict.metrics().failures, 1);
    }

    #[test]
    fn test_success_rate_counts_missing_fields() {
        let parser = ResponseParser::new(false);
        assert_eq!(parser.metrics().success_rate(), 100.0);
        parser
            .parse(
                "<observation><type>change</type><title>Renamed config</title></observation>",
                QueueItemKind::Observation,
            )
            .unwrap();
        let metrics = parser.metrics();
        // type and title found; subtitle, narrative and four lists missing
        assert_eq!(metrics.total_attempts, 8);
        assert_eq!(metrics.successful_extractions, 2);
        assert_eq!(metrics.failures, 6);
        assert_eq!(metrics.success_rate(), 25.0);

        parser.parse(FULL, QueueItemKind::Observation).unwrap();
        let metrics = parser.metrics();
        assert!(metrics.fallbacks_used > 0);
        assert!(metrics.success_rate() < 100.0);
    }
}
