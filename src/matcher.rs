//! Request matching logic.
//!
//! Evaluates one mock's request criteria against one incoming request and
//! classifies the result as [`MatchLevel::None`], [`MatchLevel::Partial`]
//! or [`MatchLevel::Full`].

use crate::config::{Body, RequestCriteria};
use bytes::Bytes;
use http::Request;
use percent_encoding::percent_decode_str;
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// How completely a request satisfied a mock's criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum MatchLevel {
    /// Method or path differ, or partial matching is disabled.
    #[default]
    None,
    /// Method and path matched, some other criterion did not.
    Partial,
    /// Every declared criterion matched.
    Full,
}

/// Path values resolved by an outer router.
///
/// When attached to a request as an extension, a non-empty value here wins
/// over the value captured from a `{name}` template segment.
#[derive(Debug, Clone, Default)]
pub struct PathValues(pub HashMap<String, String>);

/// Values read off the concrete request during one match attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedData {
    /// Path parameters extracted from template matching
    pub path_params: HashMap<String, String>,
    /// Query parameters checked by the criteria
    pub query_params: HashMap<String, String>,
    /// Headers checked by the criteria, keyed by lowercase name
    pub headers: HashMap<String, String>,
}

impl CapturedData {
    /// Captured path parameter, or `""` when absent.
    pub fn path_value(&self, key: &str) -> &str {
        self.path_params.get(key).map(String::as_str).unwrap_or("")
    }

    /// Captured query parameter, or `""` when absent.
    pub fn query_value(&self, key: &str) -> &str {
        self.query_params.get(key).map(String::as_str).unwrap_or("")
    }

    /// Captured header (case-insensitive), or `""` when absent.
    pub fn header_value(&self, key: &str) -> &str {
        self.headers
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Diagnostic trail of one match attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchLog(Vec<String>);

impl MatchLog {
    pub fn push(&mut self, line: impl Into<String>) {
        self.0.push(line.into());
    }

    /// Record a failed check on `part`.
    pub fn mismatch(&mut self, part: &str, expected: &str, actual: &str) {
        let line = match (expected.is_empty(), actual.is_empty()) {
            (true, false) => format!("NO MATCH {} expected empty but got {}", part, actual),
            (false, true) => format!("NO MATCH {} expected {} but got empty", part, expected),
            _ => format!("NO MATCH {} expected {} but got {}", part, expected, actual),
        };
        self.0.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MatchLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("\n"))
    }
}

/// Result of evaluating one request against one mock.
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub level: MatchLevel,
    pub captured: CapturedData,
    pub log: MatchLog,
}

/// Compiled request criteria.
#[derive(Debug, Clone)]
pub struct RequestMatcher {
    criteria: RequestCriteria,
    template: Option<PathTemplate>,
}

#[derive(Debug, Clone)]
struct PathTemplate {
    segments: Vec<TemplateSegment>,
}

#[derive(Debug, Clone)]
enum TemplateSegment {
    Literal(String),
    Param(String),
}

impl PathTemplate {
    fn parse(template: &str) -> Self {
        let segments = template
            .split('/')
            .map(|segment| {
                match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    Some(name) => TemplateSegment::Param(name.to_string()),
                    None => TemplateSegment::Literal(segment.to_string()),
                }
            })
            .collect();
        Self { segments }
    }

    /// Segments are percent-decoded one by one, so an encoded `/` stays
    /// inside its segment.
    fn matches(&self, path: &str, params: &mut HashMap<String, String>) -> bool {
        let actual: Vec<&str> = path.split('/').collect();
        if actual.len() != self.segments.len() {
            return false;
        }

        for (segment, raw) in self.segments.iter().zip(actual) {
            let value = percent_decode_str(raw).decode_utf8_lossy();
            match segment {
                TemplateSegment::Param(name) => {
                    params.insert(name.clone(), value.into_owned());
                }
                TemplateSegment::Literal(literal) => {
                    if literal.as_str() != value {
                        return false;
                    }
                }
            }
        }
        true
    }
}

impl RequestMatcher {
    pub fn new(criteria: RequestCriteria) -> Self {
        let template = criteria
            .is_template()
            .then(|| PathTemplate::parse(&criteria.path));
        Self { criteria, template }
    }

    pub fn criteria(&self) -> &RequestCriteria {
        &self.criteria
    }

    /// Evaluate `request` against the criteria.
    ///
    /// Method and path mismatches are always [`MatchLevel::None`]. Any
    /// other failed check yields [`MatchLevel::Partial`] when
    /// `partial_matching` is set and [`MatchLevel::None`] otherwise.
    pub fn evaluate(&self, request: &Request<Bytes>, partial_matching: bool) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();
        let criteria = &self.criteria;

        let method = request.method().as_str();
        if criteria.method != method {
            outcome.log.mismatch("METHOD", &criteria.method, method);
            return outcome;
        }

        let path = request.uri().path();
        if !self.matches_path(path, &mut outcome.captured) {
            outcome.log.mismatch("PATH", &criteria.path, path);
            return outcome;
        }

        let satisfied = self.matches_query(request, &mut outcome)
            && self.matches_path_params(request, &mut outcome)
            && self.matches_headers(request, &mut outcome)
            && matches_body(criteria.body.as_ref(), request.body(), &mut outcome.log);

        if satisfied {
            outcome.log.push("MATCH");
            outcome.level = MatchLevel::Full;
        } else if partial_matching {
            outcome.level = MatchLevel::Partial;
        }
        outcome
    }

    fn matches_path(&self, path: &str, captured: &mut CapturedData) -> bool {
        match &self.template {
            Some(template) => template.matches(path, &mut captured.path_params),
            None => self.criteria.path == percent_decode_str(path).decode_utf8_lossy(),
        }
    }

    fn matches_query(&self, request: &Request<Bytes>, outcome: &mut MatchOutcome) -> bool {
        if self.criteria.query_params.is_empty() {
            return true;
        }

        let query = parse_query_string(request.uri().query().unwrap_or(""));
        for (key, expected) in sorted(&self.criteria.query_params) {
            let actual = query.get(key).map(String::as_str).unwrap_or("");
            outcome
                .captured
                .query_params
                .insert(key.clone(), actual.to_string());
            if actual != expected {
                outcome
                    .log
                    .mismatch(&format!("QUERY PARAM [{}]", key), expected, actual);
                return false;
            }
        }
        true
    }

    fn matches_path_params(&self, request: &Request<Bytes>, outcome: &mut MatchOutcome) -> bool {
        let routed = request.extensions().get::<PathValues>();
        for (key, expected) in sorted(&self.criteria.path_params) {
            let actual = routed
                .and_then(|values| values.0.get(key))
                .filter(|value| !value.is_empty())
                .cloned()
                .unwrap_or_else(|| outcome.captured.path_value(key).to_string());
            outcome
                .captured
                .path_params
                .insert(key.clone(), actual.clone());
            if &actual != expected {
                outcome
                    .log
                    .mismatch(&format!("PATH PARAM [{}]", key), expected, &actual);
                return false;
            }
        }
        true
    }

    fn matches_headers(&self, request: &Request<Bytes>, outcome: &mut MatchOutcome) -> bool {
        for (name, expected) in sorted(&self.criteria.headers) {
            let actual = request
                .headers()
                .get(name.as_str())
                .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
                .unwrap_or_default();
            outcome
                .captured
                .headers
                .insert(name.to_ascii_lowercase(), actual.clone());
            if &actual != expected {
                outcome
                    .log
                    .mismatch(&format!("HEADER [{}]", name), expected, &actual);
                return false;
            }
        }
        true
    }
}

fn matches_body(expected: Option<&Body>, actual: &Bytes, log: &mut MatchLog) -> bool {
    let matched = match expected {
        None => return true,
        Some(Body::Text(text)) => actual.as_ref() == text.as_bytes(),
        Some(Body::Bytes(raw)) => actual == raw,
        Some(Body::Structured(value)) => {
            let expected = match canonical_json(value) {
                Ok(encoded) => encoded,
                Err(e) => {
                    log.push(format!("NO MATCH BODY expected value cannot be encoded: {}", e));
                    return false;
                }
            };
            match canonical_body(actual) {
                Ok(encoded) => encoded == expected,
                Err(e) => {
                    log.push(format!("NO MATCH BODY cannot be parsed: {}", e));
                    return false;
                }
            }
        }
    };

    if !matched {
        let expected = expected.map(|b| b.to_string()).unwrap_or_default();
        log.mismatch("BODY", &expected, &String::from_utf8_lossy(actual));
    }
    matched
}

/// Rebuild `value` with sorted object keys and integral floats as integers.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(object) => {
            let sorted: BTreeMap<&String, Value> = object
                .iter()
                .map(|(key, value)| (key, canonicalize(value)))
                .collect();
            let mut canonical = Map::new();
            for (key, value) in sorted {
                canonical.insert(key.clone(), value);
            }
            Value::Object(canonical)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(number) => Value::Number(canonical_number(number)),
        other => other.clone(),
    }
}

fn canonical_number(number: &Number) -> Number {
    const EXACT: f64 = 9_007_199_254_740_992.0;
    match number.as_f64() {
        Some(float) if number.is_f64() && float.fract() == 0.0 && float.abs() < EXACT => {
            Number::from(float as i64)
        }
        _ => number.clone(),
    }
}

/// Canonical JSON encoding of a structured value.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&canonicalize(value))
}

/// Decode a JSON payload and return its canonical encoding.
pub fn canonical_body(raw: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let value: Value = serde_json::from_slice(raw)?;
    canonical_json(&value)
}

/// Parse a query string, keeping the first value of repeated keys.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(key.into_owned())
            .or_insert_with(|| value.into_owned());
    }
    params
}

fn sorted(map: &HashMap<String, String>) -> BTreeMap<&String, &String> {
    map.iter().collect()
}
