//! Mock definitions and registry settings.
//!
//! Defines the request criteria, response definitions and bodies a mock is
//! built from, and decodes them from JSON or YAML files, directories and
//! glob patterns.

use crate::error::{LoadError, ValidationError};
use base64::Engine;
use bytes::Bytes;
use globset::GlobBuilder;
use http::{HeaderName, HeaderValue};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

/// HTTP methods a mock may declare.
pub const METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// Prefix used in log lines and mock info headers.
pub const DEFAULT_LOG_HEADER: &str = "HTTPTestMock";

const MOCK_EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];

/// A request or response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Compared and written as UTF-8 text.
    Text(String),
    /// Compared and written byte-for-byte.
    Bytes(Bytes),
    /// Compared after canonicalization, written as JSON.
    Structured(serde_json::Value),
}

impl Body {
    /// Build a structured body from any serializable value.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Body::from)
    }

    fn decode(value: Option<serde_json::Value>, encoded: Option<String>) -> Result<Option<Self>, String> {
        match (value, encoded) {
            (Some(_), Some(_)) => Err("body and body_base64 are mutually exclusive".to_string()),
            (None, Some(encoded)) => base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map(|raw| Some(Body::Bytes(Bytes::from(raw))))
                .map_err(|e| format!("invalid body_base64: {}", e)),
            (Some(value), None) => Ok(Some(Body::from(value))),
            (None, None) => Ok(None),
        }
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_string())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Text(text)
    }
}

impl From<Vec<u8>> for Body {
    fn from(raw: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(raw))
    }
}

impl From<Bytes> for Body {
    fn from(raw: Bytes) -> Self {
        Body::Bytes(raw)
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(text) => Body::Text(text),
            other => Body::Structured(other),
        }
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Text(text) => f.write_str(text),
            Body::Bytes(raw) => write!(f, "<{} bytes>", raw.len()),
            Body::Structured(value) => write!(f, "{}", value),
        }
    }
}

/// A single mock definition, as decoded from a file or built in code.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MockDefinition {
    /// Identifier used in logs; defaults to the file stem when loaded.
    #[serde(default)]
    pub name: String,

    /// Request criteria
    pub request: RequestCriteria,

    /// Response to return
    pub response: ResponseDefinition,

    /// Whether hits are counted and asserted
    #[serde(default)]
    pub assertion: bool,

    /// Expected number of hits per test when assertion is enabled
    #[serde(default)]
    pub expected_hits: u64,

    /// File the definition was loaded from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl MockDefinition {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            request: RequestCriteria {
                method: method.into(),
                path: path.into(),
                ..RequestCriteria::default()
            },
            response: ResponseDefinition::default(),
            assertion: false,
            expected_hits: 0,
            source: None,
        }
    }

    /// Validate the definition, collecting every problem found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut reasons = self.request.problems();
        reasons.extend(self.response.problems());
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(self.display_name(), reasons.join("; ")))
        }
    }

    /// The mock name, falling back to the request line.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("{} {}", self.request.method, self.request.path)
        } else {
            self.name.clone()
        }
    }
}

impl fmt::Display for MockDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = self
            .source
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let parts = Parts::default()
            .set("name", &self.name)
            .set("from", source)
            .set("req", self.request.to_string())
            .set("resp", self.response.to_string());
        write!(f, "Mock: {}", parts)
    }
}

/// Criteria an incoming request is matched against.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "RawRequestCriteria")]
pub struct RequestCriteria {
    /// HTTP method, compared case-sensitively
    pub method: String,
    /// Route template; `{name}` segments capture path parameters
    pub path: String,
    pub query_params: HashMap<String, String>,
    pub path_params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Option<Body>,
    /// Serve this mock even when only method and path matched
    pub partial_match: bool,
}

impl RequestCriteria {
    /// Whether the path contains `{name}` placeholders.
    pub fn is_template(&self) -> bool {
        self.path.contains('{')
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.method.is_empty() {
            problems.push("request method is required".to_string());
        } else if !METHODS.contains(&self.method.as_str()) {
            problems.push(format!(
                "request method {:?} is not one of {}",
                self.method,
                METHODS.join(" ")
            ));
        }
        if self.path.is_empty() {
            problems.push("request path is required".to_string());
        }
        problems.extend(header_problems("request", &self.headers));
        problems
    }
}

impl fmt::Display for RequestCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.body.as_ref().map(|b| b.to_string()).unwrap_or_default();
        let parts = Parts::default()
            .set("method", &self.method)
            .set("path", &self.path)
            .set("query_params", map_text(&self.query_params))
            .set("path_params", map_text(&self.path_params))
            .set("headers", map_text(&self.headers))
            .set("body", body);
        write!(f, "Req: {}", parts)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRequestCriteria {
    #[serde(default)]
    method: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    query_params: HashMap<String, String>,
    #[serde(default)]
    path_params: HashMap<String, String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
    #[serde(default)]
    body_base64: Option<String>,
    #[serde(default)]
    partial_match: bool,
}

impl TryFrom<RawRequestCriteria> for RequestCriteria {
    type Error = String;

    fn try_from(raw: RawRequestCriteria) -> Result<Self, Self::Error> {
        Ok(Self {
            body: Body::decode(raw.body, raw.body_base64)?,
            method: raw.method,
            path: raw.path,
            query_params: raw.query_params,
            path_params: raw.path_params,
            headers: raw.headers,
            partial_match: raw.partial_match,
        })
    }
}

/// Response returned when a mock matches.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "RawResponseDefinition")]
pub struct ResponseDefinition {
    /// HTTP status code (100-599)
    pub status: u16,
    pub body: Option<Body>,
    pub headers: HashMap<String, String>,
    /// Artificial latency before anything is written
    pub delay_ms: u64,
}

impl ResponseDefinition {
    pub fn delay(&self) -> Option<Duration> {
        (self.delay_ms > 0).then(|| Duration::from_millis(self.delay_ms))
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.status == 0 {
            problems.push("response status is required".to_string());
        } else if !(100..=599).contains(&self.status) {
            problems.push(format!("response status {} is out of range 100-599", self.status));
        }
        problems.extend(header_problems("response", &self.headers));
        problems
    }
}

impl fmt::Display for ResponseDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = http::StatusCode::from_u16(self.status)
            .map(|s| s.to_string())
            .unwrap_or_else(|_| self.status.to_string());
        let body = self.body.as_ref().map(|b| b.to_string()).unwrap_or_default();
        let delay = if self.delay_ms > 0 {
            self.delay_ms.to_string()
        } else {
            String::new()
        };
        let parts = Parts::default()
            .set("status", status)
            .set("body", body)
            .set("headers", map_text(&self.headers))
            .set("delay_ms", delay);
        write!(f, "Resp: {}", parts)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResponseDefinition {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    body: Option<serde_json::Value>,
    #[serde(default)]
    body_base64: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    delay_ms: u64,
}

impl TryFrom<RawResponseDefinition> for ResponseDefinition {
    type Error = String;

    fn try_from(raw: RawResponseDefinition) -> Result<Self, Self::Error> {
        Ok(Self {
            body: Body::decode(raw.body, raw.body_base64)?,
            status: raw.status,
            headers: raw.headers,
            delay_ms: raw.delay_ms,
        })
    }
}

fn header_problems(side: &str, headers: &HashMap<String, String>) -> Vec<String> {
    let mut problems = Vec::new();
    for (name, value) in headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err() {
            problems.push(format!("{} header name {:?} is invalid", side, name));
        }
        if HeaderValue::from_str(value).is_err() {
            problems.push(format!("{} header {:?} has an invalid value", side, name));
        }
    }
    problems.sort();
    problems
}

/// Registry-wide behavior.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Report mocks that matched only method and path as candidates (400)
    /// instead of treating them as unmatched (404)
    pub partial_matching: bool,

    /// Log matched mocks
    pub log_matches: bool,

    /// Log unmatched requests and partial candidates
    pub log_unmatched: bool,

    /// Prefix for log lines
    pub log_header: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            partial_matching: true,
            log_matches: true,
            log_unmatched: true,
            log_header: DEFAULT_LOG_HEADER.to_string(),
        }
    }
}

/// Ordered `[key: value]` pairs, skipping empty values.
#[derive(Default)]
struct Parts(Vec<(&'static str, String)>);

impl Parts {
    fn set(mut self, key: &'static str, value: impl Into<String>) -> Self {
        let value = value.into();
        if value.is_empty() {
            return self;
        }
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(part) => part.1 = value,
            None => self.0.push((key, value)),
        }
        self
    }
}

impl fmt::Display for Parts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self
            .0
            .iter()
            .map(|(k, v)| format!("[{}: {}]", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        f.write_str(&text)
    }
}

fn map_text(map: &HashMap<String, String>) -> String {
    map.iter()
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Decode one mock from JSON (content starting with `{`) or YAML.
pub fn parse_mock(data: &[u8], path: &Path) -> Result<MockDefinition, LoadError> {
    let content = data.trim_ascii_start();
    if content.is_empty() {
        return Err(LoadError::Empty {
            path: path.to_path_buf(),
        });
    }
    if content[0] == b'{' {
        serde_json::from_slice(content).map_err(|source| LoadError::Json {
            path: path.to_path_buf(),
            source,
        })
    } else {
        serde_yaml::from_slice(content).map_err(|source| LoadError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Read a single mock file. Unnamed mocks are named after the file stem.
pub fn read_mock(path: &Path) -> Result<MockDefinition, LoadError> {
    let data = std::fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut mock = parse_mock(&data, path)?;
    if mock.name.is_empty() {
        mock.name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    mock.source = Some(path.to_path_buf());
    Ok(mock)
}

/// Read every mock file directly inside `dir`, in file name order.
///
/// Subdirectories and files without a `.json`, `.yaml` or `.yml`
/// extension are skipped.
pub fn read_mock_dir(dir: &Path) -> Result<Vec<MockDefinition>, Vec<LoadError>> {
    let entries = std::fs::read_dir(dir).map_err(|source| {
        vec![LoadError::Io {
            path: dir.to_path_buf(),
            source,
        }]
    })?;

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && has_mock_extension(path))
        .collect();
    files.sort();

    collect(files.iter().map(|path| read_mock(path).map(|mock| vec![mock])))
}

/// Load mocks from files, directories or glob patterns.
///
/// Errors from every source are aggregated.
pub fn load_mocks<P: AsRef<Path>>(sources: &[P]) -> Result<Vec<MockDefinition>, Vec<LoadError>> {
    let mut results = Vec::new();
    for source in sources {
        let source = source.as_ref();
        let paths = match expand_source(source) {
            Ok(paths) => paths,
            Err(errors) => {
                results.push(Err(errors));
                continue;
            }
        };
        for path in paths {
            if path.is_dir() {
                results.push(read_mock_dir(&path));
            } else {
                results.push(read_mock(&path).map(|mock| vec![mock]).map_err(|e| vec![e]));
            }
        }
    }

    let mut mocks = Vec::new();
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(found) => mocks.extend(found),
            Err(failed) => errors.extend(failed),
        }
    }
    if errors.is_empty() {
        Ok(mocks)
    } else {
        Err(errors)
    }
}

fn collect<I>(results: I) -> Result<Vec<MockDefinition>, Vec<LoadError>>
where
    I: Iterator<Item = Result<Vec<MockDefinition>, LoadError>>,
{
    let mut mocks = Vec::new();
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(found) => mocks.extend(found),
            Err(e) => errors.push(e),
        }
    }
    if errors.is_empty() {
        Ok(mocks)
    } else {
        Err(errors)
    }
}

fn has_mock_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| MOCK_EXTENSIONS.contains(&ext.as_str()))
}

fn is_pattern(text: &str) -> bool {
    text.contains(['*', '?', '[', '{'])
}

/// Resolve a source to concrete paths. Literal paths must exist; patterns
/// may expand to nothing.
///
/// Patterns are walked from their literal prefix, no deeper than the
/// pattern reaches unless it contains `**`. Symlinks are not followed.
fn expand_source(source: &Path) -> Result<Vec<PathBuf>, Vec<LoadError>> {
    let text = source.to_string_lossy();
    if !is_pattern(&text) {
        std::fs::metadata(source).map_err(|e| {
            vec![LoadError::Io {
                path: source.to_path_buf(),
                source: e,
            }]
        })?;
        return Ok(vec![source.to_path_buf()]);
    }

    let matcher = GlobBuilder::new(&text)
        .literal_separator(true)
        .build()
        .map_err(|e| {
            vec![LoadError::Pattern {
                pattern: text.to_string(),
                source: e,
            }]
        })?
        .compile_matcher();

    let base: PathBuf = source
        .components()
        .take_while(|c| !is_pattern(&c.as_os_str().to_string_lossy()))
        .collect();
    let root = if base.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        base.clone()
    };

    let mut walker = WalkDir::new(&root).follow_links(false).min_depth(1);
    if !text.contains("**") {
        walker = walker.max_depth(source.components().count() - base.components().count());
    }

    let mut found = Vec::new();
    let mut errors = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().unwrap_or(root.as_path()).to_path_buf();
                errors.push(LoadError::Io {
                    path,
                    source: e.into(),
                });
                continue;
            }
        };
        let Ok(relative) = entry.path().strip_prefix(&root) else {
            continue;
        };
        let candidate = base.join(relative);
        if !matcher.is_match(&candidate) {
            continue;
        }
        if entry.file_type().is_dir() || has_mock_extension(&candidate) {
            found.push(candidate);
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    found.sort();
    Ok(found)
}
