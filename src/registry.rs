//! Step name resolution.
//!
//! A step name such as `initrd/booster` is looked up as
//! `<dir>/initrd/booster.toml` in each search directory, in order, and then
//! in the table of built-in steps. The first match wins, so an administrator
//! can shadow a built-in step with a manifest of the same name.
//!
//! Loaded steps are validated once and cached; loading the same name again
//! returns the identical instance.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::step::manifest::ManifestStep;
use crate::step::Step;

/// Manifest directories searched before the built-in steps.
pub const DEFAULT_STEP_PATHS: &[&str] = &[
    "/etc/bootchain/steps",
    "/usr/local/lib/bootchain/steps",
    "/usr/lib/bootchain/steps",
];

/// Where a step name resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepSource {
    Manifest(PathBuf),
    Builtin,
}

pub struct Registry {
    search_paths: Vec<PathBuf>,
    builtins: BTreeMap<String, Arc<dyn Step>>,
    loaded: HashMap<String, Arc<dyn Step>>,
}

impl Registry {
    pub fn new<I, P>(search_paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            search_paths: search_paths.into_iter().map(Into::into).collect(),
            builtins: BTreeMap::new(),
            loaded: HashMap::new(),
        }
    }

    /// Registry with the default search path and every built-in step.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new(DEFAULT_STEP_PATHS.iter().copied());
        crate::steps::register_all(&mut registry)?;
        Ok(registry)
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Add a built-in step. Its descriptor is validated here.
    pub fn register(&mut self, step: Arc<dyn Step>) -> Result<()> {
        step.descriptor().validate()?;
        let name = step.descriptor().name.clone();
        check_name(&name)
            .map_err(|_| Error::invalid_module(&name, "name is not a valid step path"))?;
        if self.builtins.contains_key(&name) {
            return Err(Error::invalid_module(
                &name,
                "a built-in step with this name is already registered",
            ));
        }
        self.builtins.insert(name, step);
        Ok(())
    }

    /// Names of registered built-in steps.
    pub fn builtin_names(&self) -> impl Iterator<Item = &str> {
        self.builtins.keys().map(String::as_str)
    }

    pub fn resolve(&self, name: &str) -> Result<StepSource> {
        check_name(name)?;
        let relative = format!("{name}.toml");
        for dir in &self.search_paths {
            let candidate = dir.join(&relative);
            if candidate.is_file() {
                return Ok(StepSource::Manifest(candidate));
            }
        }
        if self.builtins.contains_key(name) {
            return Ok(StepSource::Builtin);
        }
        Err(Error::ModuleNotFound {
            name: name.to_string(),
        })
    }

    pub fn load(&mut self, name: &str) -> Result<Arc<dyn Step>> {
        if let Some(step) = self.loaded.get(name) {
            return Ok(Arc::clone(step));
        }

        let step = match self.resolve(name)? {
            StepSource::Manifest(path) => {
                tracing::debug!(step = name, path = %path.display(), "loading step manifest");
                load_manifest(name, &path)?
            }
            StepSource::Builtin => self
                .builtins
                .get(name)
                .cloned()
                .ok_or_else(|| Error::ModuleNotFound {
                    name: name.to_string(),
                })?,
        };

        self.loaded.insert(name.to_string(), Arc::clone(&step));
        Ok(step)
    }
}

fn load_manifest(name: &str, path: &Path) -> Result<Arc<dyn Step>> {
    let step = ManifestStep::load(path)?;
    let descriptor = step.descriptor();
    if descriptor.name != name {
        return Err(Error::invalid_module(
            name,
            format!(
                "manifest '{}' declares name '{}'",
                path.display(),
                descriptor.name
            ),
        ));
    }
    descriptor.validate()?;
    Ok(Arc::new(step))
}

/// Step names are relative paths of plain segments.
fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('/')
        && name
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..");
    if valid {
        Ok(())
    } else {
        Err(Error::ModuleNotFound {
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::testing::FnStep;
    use crate::step::StepDescriptor;
    use std::fs;
    use tempfile::TempDir;

    fn write_manifest(dir: &Path, name: &str, body: &str) {
        let path = dir.join(format!("{name}.toml"));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn load_returns_identical_cached_instance() {
        let mut registry = Registry::new(Vec::<PathBuf>::new());
        registry.register(FnStep::noop("kernel/test").arc()).unwrap();

        let first = registry.load("kernel/test").unwrap();
        let second = registry.load("kernel/test").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unknown_and_unsafe_names_are_not_found() {
        let mut registry = Registry::new(Vec::<PathBuf>::new());
        for name in ["nope/missing", "../etc/passwd", "/abs", "a//b", ""] {
            let err = registry.load(name).err().unwrap();
            assert!(
                matches!(err, Error::ModuleNotFound { .. }),
                "{name}: {err}"
            );
        }
    }

    #[test]
    fn first_search_path_wins_over_later_and_builtins() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let manifest = "name = \"initrd/booster\"\ncommand = [\"true\"]\n";
        write_manifest(first.path(), "initrd/booster", manifest);
        write_manifest(second.path(), "initrd/booster", manifest);

        let mut registry = Registry::new([first.path(), second.path()]);
        registry.register(FnStep::noop("initrd/booster").arc()).unwrap();

        assert_eq!(
            registry.resolve("initrd/booster").unwrap(),
            StepSource::Manifest(first.path().join("initrd/booster.toml"))
        );
        let step = registry.load("initrd/booster").unwrap();
        assert_eq!(step.descriptor().required_tools, vec!["true".to_string()]);
    }

    #[test]
    fn manifest_name_must_match_requested_name() {
        let dir = TempDir::new().unwrap();
        write_manifest(
            dir.path(),
            "initrd/dracut",
            "name = \"initrd/other\"\ncommand = [\"true\"]\n",
        );
        let mut registry = Registry::new([dir.path()]);
        let err = registry.load("initrd/dracut").err().unwrap();
        assert!(matches!(err, Error::InvalidModule { .. }));
    }

    #[test]
    fn invalid_manifest_schema_is_rejected_at_load() {
        let dir = TempDir::new().unwrap();
        write_manifest(
            dir.path(),
            "x/y",
            "name = \"x/y\"\ncommand = [\"true\"]\nrequired_config = [\"a\"]\noptional_config = [\"a\"]\n",
        );
        let mut registry = Registry::new([dir.path()]);
        assert!(matches!(
            registry.load("x/y"),
            Err(Error::InvalidModule { .. })
        ));
    }

    #[test]
    fn register_validates_and_rejects_duplicates() {
        let mut registry = Registry::new(Vec::<PathBuf>::new());
        let bad = StepDescriptor::new("x/y")
            .requires_inputs(["kernel"])
            .accepts_inputs(["kernel"]);
        assert!(registry
            .register(FnStep::new(bad, |_| Ok(Default::default())).arc())
            .is_err());

        registry.register(FnStep::noop("x/y").arc()).unwrap();
        assert!(registry.register(FnStep::noop("x/y").arc()).is_err());
        assert_eq!(registry.builtin_names().collect::<Vec<_>>(), vec!["x/y"]);
    }

    #[test]
    fn builtin_registry_has_all_steps() {
        let registry = Registry::builtin().unwrap();
        let names: Vec<_> = registry.builtin_names().collect();
        for expected in [
            "kernel/chimera",
            "initrd/booster",
            "initrd/mkinitcpio",
            "initrd/initramfs-tools",
            "uki/ukify",
            "signing/sbsigntools",
            "signing/uefisign",
            "layout/plain",
            "layout/bls-type-2",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }
}
