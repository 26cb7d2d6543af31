use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BuildFarmError, Result};

/// Version control location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsInfo {
    pub url: String,
    pub branch: String,
}

fn vcs_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // scheme://anything or scp-like user@host:path
        Regex::new(r"^(?:(?:https?|git|ssh|file)://\S+|[\w.-]+@[\w.-]+:\S+)$")
            .expect("vcs url pattern is valid")
    })
}

impl VcsInfo {
    pub fn new(url: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            branch: branch.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.url.is_empty() && self.branch.is_empty()
    }

    pub fn validate(&self, what: &str) -> Result<()> {
        if !vcs_url_pattern().is_match(&self.url) {
            return Err(BuildFarmError::InvalidVcs(format!(
                "{} url \"{}\" is not a valid repository location",
                what, self.url
            )));
        }
        if self.branch.trim().is_empty() || self.branch.chars().any(char::is_whitespace) {
            return Err(BuildFarmError::InvalidVcs(format!(
                "{} branch \"{}\" is not valid",
                what, self.branch
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub architectures: Vec<String>,
    /// Continuous integration packages are built from an upstream checkout.
    #[serde(default)]
    pub ci: bool,
    pub vcs: VcsInfo,
    #[serde(default)]
    pub upstream_vcs: VcsInfo,
}

impl Package {
    pub fn validate(&self) -> Result<()> {
        validate_name("package", &self.name)?;
        validate_architectures(&self.architectures)?;
        self.vcs.validate("packaging")?;
        if self.ci {
            self.upstream_vcs.validate("upstream")?;
        } else if !self.upstream_vcs.is_empty() {
            self.upstream_vcs.validate("upstream")?;
        }
        Ok(())
    }

    pub fn supports(&self, arch: &str) -> bool {
        self.architectures.iter().any(|a| a == arch)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    #[serde(rename = "descr", default)]
    pub description: String,
    #[serde(rename = "archs")]
    pub architectures: Vec<String>,
    pub vcs: VcsInfo,
}

impl Image {
    pub fn validate(&self) -> Result<()> {
        validate_name("image", &self.name)?;
        validate_architectures(&self.architectures)?;
        self.vcs.validate("image")
    }

    pub fn supports(&self, arch: &str) -> bool {
        self.architectures.iter().any(|a| a == arch)
    }
}

/// Build root definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chroot {
    /// Distribution (fedora, epel, ...)
    pub release: String,
    /// Version (23, rawhide, ...)
    pub version: String,
    #[serde(rename = "arch")]
    pub architecture: String,
    pub active: bool,
}

impl Chroot {
    pub fn new(
        release: impl Into<String>,
        version: impl Into<String>,
        architecture: impl Into<String>,
    ) -> Self {
        Self {
            release: release.into(),
            version: version.into(),
            architecture: architecture.into(),
            active: true,
        }
    }

    pub fn key(release: &str, version: &str, arch: &str) -> String {
        format!("{}-{}-{}", release, version, arch)
    }

    pub fn name(&self) -> String {
        Self::key(&self.release, &self.version, &self.architecture)
    }
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() || name.contains('/') || name.chars().any(char::is_whitespace) {
        return Err(BuildFarmError::InvalidArgument(format!(
            "{} name \"{}\" is not valid",
            kind, name
        )));
    }
    Ok(())
}

fn validate_architectures(archs: &[String]) -> Result<()> {
    if archs.is_empty() {
        return Err(BuildFarmError::InvalidArgument(
            "at least one architecture is required".to_string(),
        ));
    }
    if let Some(bad) = archs
        .iter()
        .find(|a| a.trim().is_empty() || a.contains('/'))
    {
        return Err(BuildFarmError::InvalidArgument(format!(
            "architecture \"{}\" is not valid",
            bad
        )));
    }
    Ok(())
}

/// Append the architectures of `incoming` missing from `existing`, keeping
/// the original order.
pub(crate) fn merge_architectures(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut merged = existing.to_vec();
    for arch in incoming {
        if !merged.contains(arch) {
            merged.push(arch.clone());
        }
    }
    merged
}
