//! The contract every chain step implements.
//!
//! A step is described by a [`StepDescriptor`]: which chain settings it
//! introduces, which settings and artifact kinds it requires or merely
//! accepts, and which host tools it calls. The engine resolves those
//! declarations against the chain configuration and the artifact store, then
//! hands the step a [`StepContext`] holding only what it asked for.
//!
//! Steps come from two places (see [`crate::registry`]):
//! - built-in Rust implementations in [`crate::steps`]
//! - TOML manifests describing an external command ([`manifest`])

pub mod context;
pub mod manifest;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Deserialize;

use crate::artifact::{Artifact, KindQuery};
use crate::config::is_reserved_key;
use crate::error::{Error, Result};

pub use context::{CopyOptions, StepContext};

/// Type tag of a chain setting a step declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    /// Must name an existing regular file.
    File,
    /// Must name an existing directory.
    Dir,
    /// Free-form string.
    String,
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionType::File => write!(f, "file"),
            OptionType::Dir => write!(f, "dir"),
            OptionType::String => write!(f, "string"),
        }
    }
}

/// Declared schema of a step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepDescriptor {
    pub name: String,
    pub description: Option<String>,
    /// Chain-level settings this step introduces.
    pub options: BTreeMap<String, OptionType>,
    pub required_config: BTreeSet<String>,
    pub optional_config: BTreeSet<String>,
    /// Artifact kind names (see [`KindQuery`]).
    pub required_inputs: BTreeSet<String>,
    pub optional_inputs: BTreeSet<String>,
    /// Host executables checked before the chain starts.
    pub required_tools: Vec<String>,
}

impl StepDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn option(mut self, name: impl Into<String>, ty: OptionType) -> Self {
        self.options.insert(name.into(), ty);
        self
    }

    pub fn requires_config<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_config.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn accepts_config<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_config.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn requires_inputs<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_inputs.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn accepts_inputs<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_inputs.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn requires_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_tools.extend(tools.into_iter().map(Into::into));
        self
    }

    /// Every input name with its parsed query and whether it is required.
    pub fn input_queries(&self) -> Result<Vec<(&str, KindQuery, bool)>> {
        let required = self.required_inputs.iter().map(|n| (n, true));
        let optional = self.optional_inputs.iter().map(|n| (n, false));
        required
            .chain(optional)
            .map(|(name, req)| {
                name.parse::<KindQuery>()
                    .map(|query| (name.as_str(), query, req))
            })
            .collect()
    }

    /// Every config key with whether it is required.
    pub fn config_keys(&self) -> impl Iterator<Item = (&str, bool)> {
        self.required_config
            .iter()
            .map(|k| (k.as_str(), true))
            .chain(self.optional_config.iter().map(|k| (k.as_str(), false)))
    }

    /// Check the descriptor schema. Called once when a step is loaded.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::invalid_module(&self.name, reason);

        if self.name.trim().is_empty() {
            return Err(invalid("'name' is required".into()));
        }
        if self.name.chars().any(char::is_whitespace) {
            return Err(invalid("'name' must not contain whitespace".into()));
        }
        if let Some(desc) = &self.description {
            if desc.trim().is_empty() {
                return Err(invalid("'description' must not be empty when set".into()));
            }
        }

        let both_config: Vec<_> = self
            .required_config
            .intersection(&self.optional_config)
            .cloned()
            .collect();
        if !both_config.is_empty() {
            return Err(invalid(format!(
                "settings can be either required or optional, not both: {}",
                both_config.join(", ")
            )));
        }

        let both_inputs: Vec<_> = self
            .required_inputs
            .intersection(&self.optional_inputs)
            .cloned()
            .collect();
        if !both_inputs.is_empty() {
            return Err(invalid(format!(
                "inputs can be either required or optional, not both: {}",
                both_inputs.join(", ")
            )));
        }

        for (name, _) in self.config_keys() {
            if name.trim().is_empty() {
                return Err(invalid("config keys must not be empty".into()));
            }
        }

        self.input_queries()
            .map_err(|e| invalid(format!("bad input declaration: {e}")))?;

        for name in self.options.keys() {
            if name.trim().is_empty() {
                return Err(invalid("option names must not be empty".into()));
            }
            if is_reserved_key(name) {
                return Err(invalid(format!(
                    "option '{name}' is a core setting and cannot be redeclared"
                )));
            }
        }

        Ok(())
    }
}

/// What a step returns: zero, one or many artifacts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StepOutput {
    #[default]
    Nothing,
    One(Artifact),
    Many(Vec<Artifact>),
}

impl StepOutput {
    pub fn into_vec(self) -> Vec<Artifact> {
        match self {
            StepOutput::Nothing => Vec::new(),
            StepOutput::One(artifact) => vec![artifact],
            StepOutput::Many(artifacts) => artifacts,
        }
    }
}

impl From<Artifact> for StepOutput {
    fn from(artifact: Artifact) -> Self {
        StepOutput::One(artifact)
    }
}

impl From<Vec<Artifact>> for StepOutput {
    fn from(artifacts: Vec<Artifact>) -> Self {
        StepOutput::Many(artifacts)
    }
}

impl From<Option<Artifact>> for StepOutput {
    fn from(artifact: Option<Artifact>) -> Self {
        artifact.map_or(StepOutput::Nothing, StepOutput::One)
    }
}

/// A pluggable unit of work in a chain.
pub trait Step {
    fn descriptor(&self) -> &StepDescriptor;

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepOutput>;

    /// Removal hook for artifacts this step produced with `autoprune = false`.
    ///
    /// `None` means the step has no hook.
    fn prune(&self, _artifact: &Artifact) -> Option<Result<()>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactKind;

    #[test]
    fn overlapping_config_sets_are_rejected() {
        let desc = StepDescriptor::new("signing/sbsigntools")
            .requires_config(["sbkey", "sbcert"])
            .accepts_config(["sbkey"]);
        let err = desc.validate().unwrap_err();
        assert!(err.to_string().contains("sbkey"));
    }

    #[test]
    fn overlapping_inputs_are_rejected() {
        let desc = StepDescriptor::new("layout/plain")
            .requires_inputs(["kernel"])
            .accepts_inputs(["kernel", "initrd"]);
        assert!(matches!(
            desc.validate(),
            Err(Error::InvalidModule { .. })
        ));
    }

    #[test]
    fn unknown_input_kind_is_rejected() {
        let desc = StepDescriptor::new("x/y").requires_inputs(["firmware"]);
        assert!(desc.validate().is_err());
    }

    #[test]
    fn core_options_cannot_be_redeclared() {
        let desc = StepDescriptor::new("x/y").option("esp", OptionType::Dir);
        assert!(desc.validate().is_err());
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(StepDescriptor::new("  ").validate().is_err());
        assert!(StepDescriptor::new("kernel/chimera").validate().is_ok());
    }

    #[test]
    fn input_queries_mark_requiredness() {
        let desc = StepDescriptor::new("layout/plain")
            .requires_inputs(["kernel"])
            .accepts_inputs(["initrd"]);
        let queries = desc.input_queries().unwrap();
        assert_eq!(
            queries,
            vec![
                ("kernel", KindQuery::Exact(ArtifactKind::Kernel), true),
                ("initrd", KindQuery::Exact(ArtifactKind::Initrd), false),
            ]
        );
    }

    #[test]
    fn output_normalization() {
        let a = Artifact::new(ArtifactKind::Initrd, "s", "/i");
        assert_eq!(StepOutput::from(a.clone()).into_vec().len(), 1);
        assert_eq!(StepOutput::from(vec![a.clone(), a]).into_vec().len(), 2);
        assert!(StepOutput::from(None).into_vec().is_empty());
        assert!(StepOutput::Nothing.into_vec().is_empty());
    }
}
