//! Version selection requested by clients through a header.

use http::{HeaderMap, HeaderValue};
use regex::Regex;
use std::cmp::Ordering;
use std::sync::LazyLock;

pub const POLICY_VERSION_HEADER: &str = "x-apx-policy-version";
pub const POLICY_VERSION_USED_HEADER: &str = "x-apx-policy-version-used";
pub const LATEST: &str = "latest";

static SEMVER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-((?:0|[1-9]\d*|\d*[a-zA-Z-][0-9a-zA-Z-]*)(?:\.(?:0|[1-9]\d*|\d*[a-zA-Z-][0-9a-zA-Z-]*))*))?(?:\+([0-9a-zA-Z-]+(?:\.[0-9a-zA-Z-]+)*))?$",
    )
    .expect("semver pattern is valid")
});

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("invalid policy version {0:?}, expected semver or \"latest\"")]
pub struct InvalidVersion(pub String);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionSelector {
    /// Follow the canary split.
    Latest,
    /// Pin an exact version.
    Exact(String),
}

impl VersionSelector {
    /// An empty value selects `latest`.
    pub fn parse(raw: &str) -> Result<Self, InvalidVersion> {
        let raw = raw.trim();
        if raw.is_empty() || raw == LATEST {
            return Ok(VersionSelector::Latest);
        }
        if SEMVER.is_match(raw) {
            return Ok(VersionSelector::Exact(raw.to_string()));
        }
        Err(InvalidVersion(raw.to_string()))
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self, InvalidVersion> {
        match headers.get(POLICY_VERSION_HEADER) {
            None => Ok(VersionSelector::Latest),
            Some(value) => {
                let raw = value
                    .to_str()
                    .map_err(|_| InvalidVersion(String::from_utf8_lossy(value.as_bytes()).into()))?;
                Self::parse(raw)
            }
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            VersionSelector::Latest => LATEST,
            VersionSelector::Exact(version) => version,
        }
    }

    /// Echoes the selector back to the client.
    pub fn set_used_header(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(self.as_str()) {
            headers.insert(POLICY_VERSION_USED_HEADER, value);
        }
    }
}

/// Orders version strings by their numeric semver components, so `10.0.0`
/// sorts after `2.0.0`. A release sorts after its pre-releases. Strings that
/// are not semver fall back to plain string order.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn split(version: &str) -> (Option<Vec<u64>>, Option<&str>) {
        let version = version.trim_start_matches('v');
        let version = version.split_once('+').map_or(version, |(core, _)| core);
        let (core, pre) = match version.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (version, None),
        };
        let numbers = core.split('.').map(|part| part.parse().ok()).collect();
        (numbers, pre)
    }

    let (a_core, a_pre) = split(a);
    let (b_core, b_pre) = split(b);
    match (a_core, b_core) {
        (Some(a_core), Some(b_core)) => a_core
            .cmp(&b_core)
            .then_with(|| match (a_pre, b_pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a_pre), Some(b_pre)) => a_pre.cmp(b_pre),
            })
            .then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(VersionSelector::parse("").unwrap(), VersionSelector::Latest);
        assert_eq!(
            VersionSelector::parse("latest").unwrap(),
            VersionSelector::Latest
        );
        assert_eq!(
            VersionSelector::parse("1.2.3-rc.1+build.5").unwrap(),
            VersionSelector::Exact("1.2.3-rc.1+build.5".into())
        );

        for bad in ["v1.0.0", "1.0", "01.0.0", "LATEST", "1.0.0-"] {
            assert_eq!(
                VersionSelector::parse(bad),
                Err(InvalidVersion(bad.into())),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            VersionSelector::from_headers(&headers).unwrap(),
            VersionSelector::Latest
        );

        headers.insert("X-Apx-Policy-Version", HeaderValue::from_static("2.0.0"));
        let selector = VersionSelector::from_headers(&headers).unwrap();
        assert_eq!(selector, VersionSelector::Exact("2.0.0".into()));

        let mut response = HeaderMap::new();
        selector.set_used_header(&mut response);
        assert_eq!(response.get("X-Apx-Policy-Version-Used").unwrap(), "2.0.0");
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("10.0.0", "2.0.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0-rc.1", "1.0.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0-alpha", "1.0.0-beta"), Ordering::Less);
        assert_eq!(compare_versions("v2.0.0", "10.0.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0", "1.0.0"), Ordering::Equal);

        let mut versions = vec!["10.0.0", "2.0.0", "1.0.0-rc.1", "1.0.0"];
        versions.sort_by(|a, b| compare_versions(a, b));
        assert_eq!(versions, vec!["1.0.0-rc.1", "1.0.0", "2.0.0", "10.0.0"]);
    }
}
