//! Canonical hostname parsing.
//!
//! Identifiers take the form `service-machine-site.project.domain[-suffix]`.
//! The top (dash-joined) segment must match `service-machine-site`; the
//! remainder is dot-joined `project.domain`, with an optional `-suffix`
//! trailing the domain's own final dot-label — not the first dash found
//! anywhere in `project.domain`, since `project` itself may contain dashes
//! (e.g. `mlab-sandbox`).

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use thiserror::Error;

static TOP_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z]+-[a-z0-9]+-[a-z0-9]+$").expect("static regex"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostnameError {
    #[error("invalid hostname: {0}")]
    InvalidHostname(String),
}

/// A parsed `service-machine-site.project.domain[-suffix]` identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hostname {
    pub service: String,
    pub machine: String,
    pub site: String,
    pub project: String,
    pub domain: String,
    pub suffix: Option<String>,
}

impl Hostname {
    /// Parses a canonical hostname string.
    ///
    /// The top segment (before the first `.`) must match
    /// `^[a-z]+-[a-z0-9]+-[a-z0-9]+$`. The label right after it is `project`
    /// (itself free to contain dashes, e.g. `mlab-sandbox`); everything
    /// after that is `domain`, optionally followed by `-suffix` attached to
    /// `domain`'s own final dot-label only — a dash anywhere earlier (inside
    /// `project`, or inside an interior domain label) is not mistaken for
    /// the suffix separator.
    pub fn parse(raw: &str) -> Result<Self, HostnameError> {
        let (top, rest) = raw
            .split_once('.')
            .ok_or_else(|| HostnameError::InvalidHostname(raw.to_string()))?;

        if !TOP_SEGMENT.is_match(top) {
            return Err(HostnameError::InvalidHostname(raw.to_string()));
        }
        let mut parts = top.splitn(3, '-');
        let service = parts.next().unwrap().to_string();
        let machine = parts.next().unwrap().to_string();
        let site = parts.next().unwrap().to_string();

        let (project, domain_and_suffix) = rest
            .split_once('.')
            .ok_or_else(|| HostnameError::InvalidHostname(raw.to_string()))?;

        let (domain_prefix, final_label) = match domain_and_suffix.rsplit_once('.') {
            Some((prefix, last)) => (Some(prefix), last),
            None => (None, domain_and_suffix),
        };
        let (final_label, suffix) = match final_label.split_once('-') {
            Some((label, suffix)) => (label, Some(suffix.to_string())),
            None => (final_label, None),
        };
        let domain = match domain_prefix {
            Some(prefix) => format!("{prefix}.{final_label}"),
            None => final_label.to_string(),
        };

        Ok(Hostname {
            service,
            machine,
            site,
            project: project.to_string(),
            domain,
            suffix,
        })
    }
}

impl fmt::Display for Hostname {
    /// Reconstructs the canonical string, dropping any suffix — this is
    /// what makes `parse(canonical(x)) == x` hold modulo a stripped suffix.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}.{}.{}",
            self.service, self.machine, self.site, self.project, self.domain
        )
    }
}
