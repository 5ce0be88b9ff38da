//! Artifacts produced by chain steps.
//!
//! An [`Artifact`] is one path-backed unit of output (kernel image, initrd,
//! symbol map, unified kernel image, ...) plus its installation state. Steps
//! exchange artifacts by *kind* rather than by concrete type: a signing step
//! asks for "signable" and receives whichever kernel or UKI was produced last.
//!
//! - [`store`] - ordered, kind-filterable collection owned by a chain run
//! - [`filesystem`] - copy helpers backing the step context primitives

pub mod filesystem;
pub mod store;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use store::ArtifactStore;

/// Closed set of artifact kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Kernel build configuration.
    Config,
    /// `System.map` symbol table.
    Symbols,
    Initrd,
    /// Bare kernel image (signable).
    Kernel,
    /// Unified kernel image (signable).
    Uki,
    /// Any other file.
    File,
}

impl ArtifactKind {
    /// Kinds that carry a `signed` flag and are accepted by signing steps.
    pub fn is_signable(self) -> bool {
        match self {
            ArtifactKind::Kernel | ArtifactKind::Uki => true,
            ArtifactKind::Config
            | ArtifactKind::Symbols
            | ArtifactKind::Initrd
            | ArtifactKind::File => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Config => "config",
            ArtifactKind::Symbols => "symbols",
            ArtifactKind::Initrd => "initrd",
            ArtifactKind::Kernel => "kernel",
            ArtifactKind::Uki => "uki",
            ArtifactKind::File => "file",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a step asks for when it names an input.
///
/// `Signable` and `AnyFile` are the "specializing" queries: they match every
/// kind that is-a signable artifact, or every file-backed artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindQuery {
    Exact(ArtifactKind),
    Signable,
    AnyFile,
}

impl KindQuery {
    pub fn matches(self, kind: ArtifactKind) -> bool {
        match self {
            KindQuery::Exact(want) => want == kind,
            KindQuery::Signable => kind.is_signable(),
            KindQuery::AnyFile => true,
        }
    }
}

impl FromStr for KindQuery {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let query = match s.trim().to_ascii_lowercase().as_str() {
            "config" => KindQuery::Exact(ArtifactKind::Config),
            "symbols" => KindQuery::Exact(ArtifactKind::Symbols),
            "initrd" => KindQuery::Exact(ArtifactKind::Initrd),
            "kernel" => KindQuery::Exact(ArtifactKind::Kernel),
            "uki" => KindQuery::Exact(ArtifactKind::Uki),
            "signable" => KindQuery::Signable,
            "file" => KindQuery::AnyFile,
            other => {
                return Err(Error::InvalidArtifact {
                    reason: format!(
                        "unknown artifact kind '{other}'; expected one of: config, symbols, initrd, kernel, uki, signable, file"
                    ),
                })
            }
        };
        Ok(query)
    }
}

impl From<ArtifactKind> for KindQuery {
    fn from(kind: ArtifactKind) -> Self {
        KindQuery::Exact(kind)
    }
}

/// One produced unit of output.
///
/// `kind` and `origin` are fixed at construction. `path`, `installed` and the
/// signing flag may be changed by later steps working on a derived copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    kind: ArtifactKind,
    #[serde(default)]
    origin: String,
    pub path: PathBuf,
    #[serde(default)]
    pub installed: bool,
    #[serde(default = "default_autoprune")]
    pub autoprune: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signed: Option<bool>,
}

fn default_autoprune() -> bool {
    true
}

impl Artifact {
    pub fn new(kind: ArtifactKind, origin: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            origin: origin.into(),
            path: path.into(),
            installed: false,
            autoprune: true,
            signed: kind.is_signable().then_some(false),
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    /// Name of the step that produced this artifact.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Some` only for signable kinds.
    pub fn signed(&self) -> Option<bool> {
        self.signed
    }

    pub fn set_signed(&mut self, signed: bool) -> Result<()> {
        if !self.kind.is_signable() {
            return Err(Error::InvalidArtifact {
                reason: format!(
                    "{} artifact '{}' cannot carry a signature",
                    self.kind,
                    self.path.display()
                ),
            });
        }
        self.signed = Some(signed);
        Ok(())
    }

    pub fn with_installed(mut self, installed: bool) -> Self {
        self.installed = installed;
        self
    }

    pub fn with_autoprune(mut self, autoprune: bool) -> Self {
        self.autoprune = autoprune;
        self
    }

    pub(crate) fn reattribute(&mut self, origin: &str) {
        self.origin = origin.to_string();
    }

    /// Check the artifact contract: attributed, absolute path, signing flag
    /// present exactly for signable kinds.
    pub fn validate(&self) -> Result<()> {
        if self.origin.is_empty() {
            return Err(Error::InvalidArtifact {
                reason: format!("artifact '{}' has no origin step", self.path.display()),
            });
        }
        if !self.path.is_absolute() {
            return Err(Error::InvalidArtifact {
                reason: format!(
                    "artifact path '{}' from step '{}' must be absolute",
                    self.path.display(),
                    self.origin
                ),
            });
        }
        if self.kind.is_signable() != self.signed.is_some() {
            return Err(Error::InvalidArtifact {
                reason: format!(
                    "{} artifact '{}' has an inconsistent signing flag",
                    self.kind,
                    self.path.display()
                ),
            });
        }
        Ok(())
    }
}
