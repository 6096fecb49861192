//! Workflow registry types (§3.1, §4.1).

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    /// `registry/path@sha256:<64-hex>` — tags are never accepted.
    static ref DIGEST_RE: Regex =
        Regex::new(r"^[A-Za-z0-9._-]+(/[A-Za-z0-9._-]+)+@sha256:[a-f0-9]{64}$")
            .expect("digest regex is valid");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub project: String,
    pub name: String,
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub workflow_name: String,
    pub version: String,
    pub image_digest: String,
    pub graphs: Vec<GraphRef>,
    pub inputs_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRef {
    pub name: String,
    pub entry: String,
}

impl GraphRef {
    /// `module:function` — exactly one `:` splitting a module path from an identifier.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::error::Error::InvalidGraphRef(
                "graph name must not be empty".to_string(),
            ));
        }
        let parts: Vec<&str> = self.entry.split(':').collect();
        match parts.as_slice() {
            [module, ident] if !module.is_empty() && !ident.is_empty() => Ok(()),
            _ => Err(crate::error::Error::InvalidGraphRef(format!(
                "entry '{}' must be exactly one 'module:function' pair",
                self.entry
            ))),
        }
    }
}

pub fn validate_digest(digest: &str) -> crate::error::Result<()> {
    if DIGEST_RE.is_match(digest) {
        Ok(())
    } else {
        Err(crate::error::Error::InvalidImage(format!(
            "'{digest}' is not a bare digest reference (registry/path@sha256:<64 hex>)"
        )))
    }
}

/// Matches a digest's `host/path` prefix against the configured allow-list
/// glob patterns (§4.1). Patterns may end in `/*` to match one extra path
/// segment.
pub fn matches_allow_list(digest: &str, patterns: &[String]) -> bool {
    let host_path = digest.split('@').next().unwrap_or(digest);
    patterns.iter().any(|pattern| {
        glob::Pattern::new(pattern)
            .map(|p| p.matches(host_path))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_digest() {
        let digest = format!("quay.io/ambient_code/echo@sha256:{}", "a".repeat(64));
        assert!(validate_digest(&digest).is_ok());
    }

    #[test]
    fn rejects_tag_reference() {
        assert!(validate_digest("quay.io/ambient_code/echo:latest").is_err());
    }

    #[test]
    fn rejects_short_hash() {
        assert!(validate_digest("quay.io/ambient_code/echo@sha256:abc").is_err());
    }

    #[test]
    fn allow_list_matches_glob_with_wildcard_segment() {
        let digest = format!("quay.io/ambient_code/echo@sha256:{}", "a".repeat(64));
        assert!(matches_allow_list(
            &digest,
            &["quay.io/ambient_code/*".to_string()]
        ));
        assert!(!matches_allow_list(
            &digest,
            &["docker.io/library/*".to_string()]
        ));
    }

    #[test]
    fn graph_ref_requires_single_colon() {
        assert!(GraphRef {
            name: "main".to_string(),
            entry: "app:build".to_string()
        }
        .validate()
        .is_ok());
        assert!(GraphRef {
            name: "main".to_string(),
            entry: "app::build".to_string()
        }
        .validate()
        .is_err());
        assert!(GraphRef {
            name: String::new(),
            entry: "app:build".to_string()
        }
        .validate()
        .is_err());
    }
}
