//! Repository locator parsing.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::SubmitError;

const SCHEME_URL: &str = r"^(?P<scheme>[A-Za-z][A-Za-z0-9+.\-]*)://(?P<rest>.*)$";
const SCP_STYLE: &str = r"^[A-Za-z0-9._\-]+@(?P<host>[A-Za-z0-9.\-]+):(?P<path>[^/].*)$";
const GITHUB_SHORTHAND: &str = r"^[A-Za-z0-9_.\-]+/[A-Za-z0-9_.\-]+$";

const REMOTE_SCHEMES: [&str; 4] = ["http", "https", "ssh", "git"];

/// Where the repository lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorKind {
    Remote,
    Local,
}

/// A syntactically valid repository reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoLocator {
    /// The input as given
    pub raw: String,
    /// The form handed to the source fetcher
    pub normalized: String,
    /// Last path segment without `.git`
    pub name: String,
    pub kind: LocatorKind,
}

fn invalid(raw: &str, reason: impl Into<String>) -> SubmitError {
    SubmitError::InvalidLocator {
        locator: raw.to_string(),
        reason: reason.into(),
    }
}

fn compile(raw: &str, pattern: &str) -> Result<Regex, SubmitError> {
    Regex::new(pattern).map_err(|e| invalid(raw, format!("locator pattern: {e}")))
}

/// Derive the repository name from a path: last non-empty segment, `.git`
/// suffix removed.
fn repo_name(path: &str) -> Option<String> {
    let segment = path
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default();
    let name = segment.strip_suffix(".git").unwrap_or(segment);
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

impl RepoLocator {
    /// Parse and normalize a repository locator.
    pub fn parse(raw: &str) -> Result<Self, SubmitError> {
        if raw.is_empty() {
            return Err(invalid(raw, "locator is empty"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(invalid(raw, "locator contains whitespace"));
        }

        if let Some(caps) = compile(raw, SCHEME_URL)?.captures(raw) {
            let scheme = caps["scheme"].to_ascii_lowercase();
            let rest = &caps["rest"];

            if scheme == "file" {
                let name =
                    repo_name(rest).ok_or_else(|| invalid(raw, "file URL has no repository path"))?;
                return Ok(Self {
                    raw: raw.to_string(),
                    normalized: raw.to_string(),
                    name,
                    kind: LocatorKind::Local,
                });
            }
            if !REMOTE_SCHEMES.contains(&scheme.as_str()) {
                return Err(invalid(raw, format!("unsupported scheme {scheme:?}")));
            }

            let (host, path) = rest
                .split_once('/')
                .ok_or_else(|| invalid(raw, "URL has no repository path"))?;
            if host.is_empty() {
                return Err(invalid(raw, "URL has no host"));
            }
            let name = repo_name(path).ok_or_else(|| invalid(raw, "URL has no repository path"))?;
            return Ok(Self {
                raw: raw.to_string(),
                normalized: raw.to_string(),
                name,
                kind: LocatorKind::Remote,
            });
        }

        if raw.contains("://") {
            return Err(invalid(raw, "malformed URL"));
        }

        if let Some(caps) = compile(raw, SCP_STYLE)?.captures(raw) {
            let name = repo_name(&caps["path"])
                .ok_or_else(|| invalid(raw, "scp-style locator has no repository path"))?;
            return Ok(Self {
                raw: raw.to_string(),
                normalized: raw.to_string(),
                name,
                kind: LocatorKind::Remote,
            });
        }

        if raw.starts_with('/') {
            let name = repo_name(raw).ok_or_else(|| invalid(raw, "path has no final segment"))?;
            return Ok(Self {
                raw: raw.to_string(),
                normalized: raw.to_string(),
                name,
                kind: LocatorKind::Local,
            });
        }

        if compile(raw, GITHUB_SHORTHAND)?.is_match(raw) {
            let name = repo_name(raw).ok_or_else(|| invalid(raw, "shorthand has no repository name"))?;
            return Ok(Self {
                raw: raw.to_string(),
                normalized: format!("https://github.com/{raw}"),
                name,
                kind: LocatorKind::Remote,
            });
        }

        Err(invalid(raw, "not a URL, scp-style address, absolute path or owner/name"))
    }
}

impl std::fmt::Display for RepoLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.normalized)
    }
}
