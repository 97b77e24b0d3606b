//! Sub-request path decoding and response shaping.
//!
//! Arbitrary per-job requests arrive as a path-encoded job triple plus a
//! method name, with exactly one fixed-name exception (`pvcls`, a mounted
//! filesystem listing with no job context). The two branches are kept
//! explicit; a new bare method name is a 400, not a guess.

use rustc_hash::FxHashMap;
use serde_json::json;

use crate::error::{AdapterError, AdapterResult};

/// Parsed query string, one value list per key.
pub type QueryString = FxHashMap<String, Vec<String>>;

/// Response of a sub-request, already shaped for the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubResponse {
    pub code: u16,
    pub content_type: Option<&'static str>,
    pub body: Option<String>,
}

impl SubResponse {
    pub fn status(code: u16) -> Self {
        Self {
            code,
            content_type: None,
            body: None,
        }
    }

    pub fn text(code: u16, body: impl Into<String>) -> Self {
        Self {
            code,
            content_type: Some("text/plain"),
            body: Some(body.into()),
        }
    }

    pub fn json(code: u16, value: &serde_json::Value) -> Self {
        Self {
            code,
            content_type: Some("application/json"),
            body: Some(value.to_string()),
        }
    }
}

/// The job triple plus method encoded in a sub-request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPath {
    pub name: String,
    pub number: String,
    pub job_id: String,
    pub method: String,
}

/// Character set allowed in a job-path segment. Segments end up inside
/// shell commands (scancel, tail paths), so anything a shell could
/// interpret is rejected at decode time.
fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

impl JobPath {
    /// Decode `{name}/{number}/{job_id}/{method}`, tolerating outer
    /// slashes. Anything but exactly four segments, or a segment with
    /// characters outside `[A-Za-z0-9_.-]`, is malformed.
    pub fn parse(path: &str) -> AdapterResult<Self> {
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        let [name, number, job_id, method] = parts.as_slice() else {
            return Err(AdapterError::BadRequestPath(path.to_string()));
        };
        if !parts.iter().all(|p| valid_segment(p)) {
            return Err(AdapterError::BadRequestPath(path.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            number: number.to_string(),
            job_id: job_id.to_string(),
            method: method.to_string(),
        })
    }
}

/// First value of a query-string key.
pub fn qs_first<'a>(qs: &'a QueryString, key: &str) -> Option<&'a str> {
    qs.get(key).and_then(|v| v.first()).map(String::as_str)
}

/// Line count for `tail`: caller's value if above the 2-line minimum,
/// else 100.
pub fn tail_lines(qs: &QueryString) -> u32 {
    qs_first(qs, "lines")
        .and_then(|raw| raw.parse().ok())
        .filter(|n| *n > 1)
        .unwrap_or(100)
}

/// Build the listing command for `pvcls`.
///
/// "PVC" here is just a locally mounted path; the subpath is treated as
/// absolute. A fake `/data` prefix is prepended to every entry because
/// that is what upstream expects and strips. The path is shell-quoted;
/// unlike job-path segments it may legitimately contain slashes and
/// spaces, so it cannot go through [`JobPath`]'s character filter.
pub fn pvcls_command(qs: &QueryString) -> String {
    let path = qs_first(qs, "path")
        .and_then(|p| shlex::try_quote(p).ok())
        .map(|q| q.into_owned())
        .unwrap_or_default();
    let details = qs_first(qs, "details").is_some_and(|d| d.eq_ignore_ascii_case("true"));

    if details {
        format!(
            "cd / && /usr/bin/find {path} -type d -maxdepth 1 \
             -exec /bin/stat -c \"%Y %s /data%n/\" {{}} \\; && \
             /usr/bin/find {path} -type f -maxdepth 1 \
             -exec /bin/stat -c \"%Y %s /data%n\" {{}} \\;"
        )
    } else {
        format!(
            "cd / && /usr/bin/find {path} -type d -maxdepth 1 \
             -exec /bin/echo /data{{}}/ \\; && \
             /usr/bin/find {path} -type f -maxdepth 1 \
             -exec /bin/echo /data{{}} \\;"
        )
    }
}

/// Fixed `info` descriptor for batch jobs. The URL is filled in only
/// when the cluster advertises an interactive jobs domain.
pub fn info_body(jobs_domain: Option<&str>, name: &str) -> serde_json::Value {
    let url = jobs_domain
        .map(|domain| format!("https://{name}.{domain}/"))
        .unwrap_or_default();
    json!({
        "about": "",
        "help": "",
        "url": url,
        "actions": {},
    })
}
