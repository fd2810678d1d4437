//! Cache key types and validation.

use std::fmt;
use std::str::FromStr;

/// The two Bazel remote cache namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// Action Cache.
    Ac,
    /// Content-Addressable Storage.
    Cas,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ac => "ac",
            Self::Cas => "cas",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheKind {
    type Err = ();

    /// Only the exact lowercase path segments are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ac" => Ok(Self::Ac),
            "cas" => Ok(Self::Cas),
            _ => Err(()),
        }
    }
}

/// A validated SHA-256 hex digest, normalised to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest(String);

impl Digest {
    /// Accepts exactly 64 hex characters in either case.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one blob in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: CacheKind,
    pub digest: Digest,
    remote: String,
}

impl CacheKey {
    /// `namespace` must already be sanitised (see [`sanitize_namespace`]).
    pub fn new(namespace: &str, kind: CacheKind, digest: Digest) -> Self {
        let remote = format!("{namespace}-{kind}-{digest}");
        Self {
            kind,
            digest,
            remote,
        }
    }

    /// Key under which the entry lives in the remote store.
    pub fn remote_key(&self) -> &str {
        &self.remote
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.digest)
    }
}

const DEFAULT_NAMESPACE: &str = "bazel-remote-cache";

/// Make a namespace safe for use inside remote keys.
pub fn sanitize_namespace(s: &str) -> String {
    let cleaned: String = s
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        DEFAULT_NAMESPACE.to_string()
    } else {
        cleaned
    }
}
