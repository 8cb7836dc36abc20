use crate::record::{parse_count, Pass, Record, Sequence};
use crate::store::path_component;
use crate::ReconcileError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{info, warn};

/// Why an extractor call produced no sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionFailure {
    /// The source throttled us.
    RateLimited { retry_after_ms: Option<u64> },
    /// The source answered with nothing usable (empty feed, missing page).
    Unavailable(String),
    /// The operator declined to continue.
    Aborted,
    Other(String),
}

impl ExtractionFailure {
    /// Failures that count toward the context-switch threshold.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExtractionFailure::RateLimited { .. } | ExtractionFailure::Unavailable(_))
    }
}

impl fmt::Display for ExtractionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionFailure::RateLimited { retry_after_ms: Some(ms) } => {
                write!(f, "rate limited (retry after {}ms)", ms)
            }
            ExtractionFailure::RateLimited { retry_after_ms: None } => write!(f, "rate limited"),
            ExtractionFailure::Unavailable(e) => write!(f, "unavailable: {}", e),
            ExtractionFailure::Aborted => write!(f, "aborted by operator"),
            ExtractionFailure::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ExtractionFailure {}

/// Source of raw sequences for one account. Calls may be slow and may fail.
pub trait Extractor {
    fn primary_pass(&mut self, account: &str) -> Result<Sequence, ExtractionFailure>;
    fn secondary_pass(&mut self, account: &str) -> Result<Sequence, ExtractionFailure>;
    /// Move to a fresh, isolated execution context.
    fn switch_context(&mut self) -> Result<(), ExtractionFailure>;
    /// Block until the operator supplies new credentials or aborts.
    fn request_credentials(&mut self) -> Result<(), ExtractionFailure>;

    fn pass(&mut self, account: &str, pass: Pass) -> Result<Sequence, ExtractionFailure> {
        match pass {
            Pass::Primary => self.primary_pass(account),
            Pass::Secondary => self.secondary_pass(account),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
}

/// Credential material an extractor runs under. Owned by the caller and
/// handed to the extractor at construction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionContext {
    pub label: String,
    cookies: Vec<Cookie>,
}

impl SessionContext {
    pub fn new(label: impl Into<String>, cookies: Vec<Cookie>) -> Self {
        Self {
            label: label.into(),
            cookies,
        }
    }

    /// Unauthenticated context used after a fallback switch.
    pub fn anonymous() -> Self {
        Self::new("anonymous", Vec::new())
    }

    /// Parse either a `name=value; name2=value2` header or a tab-separated
    /// (Netscape) cookie export. Only cookies whose domain contains
    /// `domain_filter` are kept from an export.
    pub fn parse(label: impl Into<String>, text: &str, domain_filter: Option<&str>) -> Result<Self, ReconcileError> {
        let cookies = if text.contains('\t') {
            parse_cookie_export(text, domain_filter)
        } else {
            parse_cookie_header(text)
        };
        if cookies.is_empty() {
            return Err(ReconcileError::Config("no cookies could be parsed".to_string()));
        }
        Ok(Self::new(label, cookies))
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.iter().find(|c| c.name == name).map(|c| c.value.as_str())
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn is_authenticated(&self) -> bool {
        !self.cookies.is_empty()
    }
}

fn parse_cookie_header(text: &str) -> Vec<Cookie> {
    text.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(Cookie {
                name: name.to_string(),
                value: value.trim().to_string(),
                domain: None,
            })
        })
        .collect()
}

fn parse_cookie_export(text: &str, domain_filter: Option<&str>) -> Vec<Cookie> {
    text.lines()
        .map(str::trim)
        .filter_map(|line| {
            let line = match line.strip_prefix("#HttpOnly_") {
                Some(rest) => rest,
                None if line.is_empty() || line.starts_with('#') => return None,
                None => line,
            };
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 7 {
                return None;
            }
            let domain = fields[0];
            if domain_filter.is_some_and(|d| !domain.contains(d)) {
                return None;
            }
            Some(Cookie {
                name: fields[5].to_string(),
                value: fields[6].to_string(),
                domain: Some(domain.to_string()),
            })
        })
        .collect()
}

/// A recorded metric value: either a number or feed text such as `"1.2K"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawValue {
    Number(f64),
    Text(String),
}

impl RawValue {
    fn value(&self) -> Option<f64> {
        match self {
            RawValue::Number(n) if n.is_finite() => Some(*n),
            RawValue::Number(_) => None,
            RawValue::Text(t) => parse_count(t),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    item_id: String,
    #[serde(default)]
    metrics: BTreeMap<String, Option<RawValue>>,
}

#[derive(Debug, Deserialize)]
struct RawPass {
    captured_at: Option<String>,
    followers: Option<RawValue>,
    #[serde(default)]
    records: Vec<RawRecord>,
}

/// Replays passes recorded as `<dir>/<account>/primary.json` and
/// `<dir>/<account>/secondary.json`.
pub struct ReplayExtractor {
    context: SessionContext,
    dir: PathBuf,
    credentials: Box<dyn BufRead>,
    domain_filter: Option<String>,
    switched: bool,
}

impl ReplayExtractor {
    pub fn new(context: SessionContext, dir: impl Into<PathBuf>) -> Self {
        Self {
            context,
            dir: dir.into(),
            credentials: Box::new(io::BufReader::new(io::stdin())),
            domain_filter: None,
            switched: false,
        }
    }

    /// Read pasted credentials from `source` instead of stdin.
    pub fn with_credential_source(mut self, source: Box<dyn BufRead>) -> Self {
        self.credentials = source;
        self
    }

    pub fn with_domain_filter(mut self, domain: impl Into<String>) -> Self {
        self.domain_filter = Some(domain.into());
        self
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    fn load(&self, account: &str, pass: Pass) -> Result<Sequence, ExtractionFailure> {
        let path = self.dir.join(path_component(account)).join(format!("{}.json", pass));
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ExtractionFailure::Unavailable(format!("{} not recorded", path.display())));
            }
            Err(e) => return Err(ExtractionFailure::Other(format!("{}: {}", path.display(), e))),
        };
        let raw: RawPass = serde_json::from_str(&text)
            .map_err(|e| ExtractionFailure::Other(format!("{}: {}", path.display(), e)))?;
        if raw.records.is_empty() {
            return Err(ExtractionFailure::Unavailable(format!("{} pass returned no items", pass)));
        }

        let records = raw
            .records
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                r.metrics.iter().fold(Record::new(r.item_id.clone(), i), |record, (name, value)| {
                    record.with_metric(name, value.as_ref().and_then(RawValue::value))
                })
            })
            .collect();

        let mut sequence = Sequence::new(account, pass, records)
            .with_followers(raw.followers.as_ref().and_then(RawValue::value));
        if let Some(captured_at) = raw.captured_at {
            sequence.captured_at = captured_at;
        }
        info!(
            account,
            %pass,
            items = sequence.len(),
            context = %self.context.label,
            "pass replayed"
        );
        Ok(sequence)
    }
}

impl Extractor for ReplayExtractor {
    fn primary_pass(&mut self, account: &str) -> Result<Sequence, ExtractionFailure> {
        self.load(account, Pass::Primary)
    }

    fn secondary_pass(&mut self, account: &str) -> Result<Sequence, ExtractionFailure> {
        self.load(account, Pass::Secondary)
    }

    fn switch_context(&mut self) -> Result<(), ExtractionFailure> {
        if self.switched {
            return Err(ExtractionFailure::Unavailable(
                "already running in the fallback context".to_string(),
            ));
        }
        warn!(from = %self.context.label, "switching to anonymous context");
        self.context = SessionContext::anonymous();
        self.switched = true;
        Ok(())
    }

    fn request_credentials(&mut self) -> Result<(), ExtractionFailure> {
        eprintln!("Credentials required. Paste cookies (header or tab-separated export), then an empty line:");
        let _ = io::stderr().flush();

        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let read = self
                .credentials
                .read_line(&mut line)
                .map_err(|e| ExtractionFailure::Other(e.to_string()))?;
            let line = line.trim_end_matches(['\r', '\n']);
            if read == 0 || line.is_empty() {
                break;
            }
            lines.push(line.to_string());
        }
        if lines.is_empty() {
            return Err(ExtractionFailure::Aborted);
        }

        let context = SessionContext::parse("operator", &lines.join("\n"), self.domain_filter.as_deref())
            .map_err(|_| ExtractionFailure::Aborted)?;
        info!(cookies = context.cookies().len(), "credentials accepted");
        self.context = context;
        self.switched = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cookie_header() {
        let ctx = SessionContext::parse("main", "sessionid=abc; csrftoken=xyz ;=skip; bare", None).unwrap();
        assert_eq!(ctx.cookies().len(), 2);
        assert_eq!(ctx.cookie("sessionid"), Some("abc"));
        assert_eq!(ctx.cookie("csrftoken"), Some("xyz"));
    }

    #[test]
    fn test_parse_cookie_export_filters_domain() {
        let text = "# Netscape HTTP Cookie File\n\
                    .example.com\tTRUE\t/\tTRUE\t0\tsessionid\tabc\n\
                    #HttpOnly_.example.com\tTRUE\t/\tTRUE\t0\tds_user_id\t42\n\
                    .other.org\tTRUE\t/\tTRUE\t0\ttrack\tnope\n\
                    short\tline";
        let ctx = SessionContext::parse("main", text, Some("example.com")).unwrap();
        assert_eq!(ctx.cookies().len(), 2);
        assert_eq!(ctx.cookie("ds_user_id"), Some("42"));
        assert_eq!(ctx.cookie("track"), None);
    }

    #[test]
    fn test_parse_rejects_empty_input() {
        assert!(SessionContext::parse("main", "  ", None).is_err());
    }

    fn write_pass(dir: &std::path::Path, account: &str, pass: &str, body: &str) {
        let account_dir = dir.join(account);
        fs::create_dir_all(&account_dir).unwrap();
        fs::write(account_dir.join(format!("{}.json", pass)), body).unwrap();
    }

    #[test]
    fn test_replay_parses_text_counts() {
        let dir = tempfile::tempdir().unwrap();
        write_pass(
            dir.path(),
            "acct",
            "primary",
            r#"{ "captured_at": "2025-01-01T00:00:00Z", "followers": "12.5K",
                 "records": [ { "item_id": "a", "metrics": { "likes": "1,204", "views": 30000, "comments": null } },
                              { "item_id": "b", "metrics": { "likes": "garbage" } } ] }"#,
        );
        let mut extractor = ReplayExtractor::new(SessionContext::anonymous(), dir.path());
        let seq = extractor.primary_pass("acct").unwrap();
        assert_eq!(seq.pass, Pass::Primary);
        assert_eq!(seq.followers, Some(12_500.0));
        assert_eq!(seq.captured_at, "2025-01-01T00:00:00Z");
        assert_eq!(seq.records[0].get("likes"), Some(1204.0));
        assert_eq!(seq.records[0].get("views"), Some(30_000.0));
        assert_eq!(seq.records[0].get("comments"), None);
        assert_eq!(seq.records[1].get("likes"), None);
        assert_eq!(seq.records[1].position, 1);
    }

    #[test]
    fn test_replay_missing_or_empty_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        write_pass(dir.path(), "acct", "secondary", r#"{ "records": [] }"#);
        let mut extractor = ReplayExtractor::new(SessionContext::anonymous(), dir.path());
        assert!(matches!(extractor.secondary_pass("acct"), Err(ExtractionFailure::Unavailable(_))));
        assert!(matches!(extractor.primary_pass("acct"), Err(ExtractionFailure::Unavailable(_))));
        assert!(matches!(extractor.primary_pass("nobody"), Err(ExtractionFailure::Unavailable(_))));
    }

    #[test]
    fn test_replay_account_cannot_leave_recording_dir() {
        let root = tempfile::tempdir().unwrap();
        let recordings = root.path().join("recordings");
        let body = r#"{ "records": [ { "item_id": "a", "metrics": { "likes": 1 } } ] }"#;
        write_pass(root.path(), "outside", "primary", body);
        write_pass(&recordings, "team_acct", "primary", body);

        let mut extractor = ReplayExtractor::new(SessionContext::anonymous(), &recordings);
        assert!(matches!(extractor.primary_pass("../outside"), Err(ExtractionFailure::Unavailable(_))));
        assert_eq!(extractor.primary_pass("team/acct").unwrap().len(), 1);
    }

    #[test]
    fn test_switch_context_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = SessionContext::parse("main", "sessionid=abc", None).unwrap();
        let mut extractor = ReplayExtractor::new(ctx, dir.path());
        extractor.switch_context().unwrap();
        assert!(!extractor.context().is_authenticated());
        assert!(extractor.switch_context().is_err());
    }

    #[test]
    fn test_request_credentials_from_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut extractor = ReplayExtractor::new(SessionContext::anonymous(), dir.path())
            .with_credential_source(Box::new(io::Cursor::new("sessionid=new; csrftoken=t\n\n")));
        extractor.switch_context().unwrap();
        extractor.request_credentials().unwrap();
        assert_eq!(extractor.context().cookie("sessionid"), Some("new"));
        extractor.switch_context().unwrap();
    }

    #[test]
    fn test_request_credentials_abort_on_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut extractor = ReplayExtractor::new(SessionContext::anonymous(), dir.path())
            .with_credential_source(Box::new(io::Cursor::new("\n")));
        assert_eq!(extractor.request_credentials(), Err(ExtractionFailure::Aborted));
    }
}
