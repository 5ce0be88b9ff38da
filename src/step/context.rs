//! Execution context handed to a step.
//!
//! The context replaces process-wide working-directory state: relative paths
//! resolve against the step's own scratch directory, and commands are spawned
//! with that directory as their working directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::filesystem::{copy_file, copy_tree};
use crate::artifact::{Artifact, ArtifactKind};
use crate::config::SettingValue;
use crate::error::{Error, Result};
use crate::os_release::OsRelease;
use crate::process::Cmd;

/// Flags for [`StepContext::copy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyOptions {
    /// Required to copy a directory.
    pub recursive: bool,
    /// Copy symlink targets instead of the links themselves.
    pub follow_symlinks: bool,
}

impl CopyOptions {
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            ..Self::default()
        }
    }
}

pub struct StepContext<'a> {
    step: &'a str,
    chain: &'a str,
    kver: &'a str,
    esp: &'a Path,
    boot: &'a Path,
    os_release: &'a OsRelease,
    cwd: PathBuf,
    inputs: BTreeMap<String, Artifact>,
    config: BTreeMap<String, SettingValue>,
}

impl<'a> StepContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        step: &'a str,
        chain: &'a str,
        kver: &'a str,
        esp: &'a Path,
        boot: &'a Path,
        os_release: &'a OsRelease,
        cwd: PathBuf,
        inputs: BTreeMap<String, Artifact>,
        config: BTreeMap<String, SettingValue>,
    ) -> Self {
        Self {
            step,
            chain,
            kver,
            esp,
            boot,
            os_release,
            cwd,
            inputs,
            config,
        }
    }

    pub fn step_name(&self) -> &str {
        self.step
    }

    pub fn chain_name(&self) -> &str {
        self.chain
    }

    pub fn kver(&self) -> &str {
        self.kver
    }

    /// EFI system partition mount point.
    pub fn esp(&self) -> &Path {
        self.esp
    }

    pub fn boot(&self) -> &Path {
        self.boot
    }

    pub fn os_release(&self) -> &OsRelease {
        self.os_release
    }

    /// Scratch directory of this step.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Bound input for a declared input name, if one was available.
    pub fn input(&self, name: &str) -> Option<&Artifact> {
        self.inputs.get(name)
    }

    pub fn require_input(&self, name: &str) -> Result<&Artifact> {
        self.input(name).ok_or_else(|| {
            Error::execution(self.step, format!("input '{name}' is not bound"))
        })
    }

    pub fn inputs(&self) -> impl Iterator<Item = (&str, &Artifact)> {
        self.inputs.iter().map(|(name, artifact)| (name.as_str(), artifact))
    }

    /// Resolved value of a declared setting.
    pub fn setting(&self, key: &str) -> Option<&SettingValue> {
        self.config.get(key)
    }

    pub fn require_setting(&self, key: &str) -> Result<&SettingValue> {
        self.setting(key).ok_or_else(|| {
            Error::execution(self.step, format!("setting '{key}' is not set"))
        })
    }

    pub fn settings(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.config.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Absolute form of `path`, relative paths taken from the scratch dir.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    /// New artifact attributed to this step.
    pub fn artifact(&self, kind: ArtifactKind, path: impl AsRef<Path>) -> Artifact {
        Artifact::new(kind, self.step, self.resolve(path))
    }

    /// Copy of `artifact` attributed to this step. Callers then override
    /// `path`, `installed` or the signing flag.
    pub fn derive(&self, artifact: &Artifact) -> Artifact {
        let mut derived = artifact.clone();
        derived.reattribute(self.step);
        derived
    }

    /// Copy a file or (with `recursive`) a directory. Copying into an
    /// existing directory places the source inside it. Returns the created
    /// path.
    pub fn copy(
        &self,
        src: impl AsRef<Path>,
        dst: impl AsRef<Path>,
        opts: CopyOptions,
    ) -> Result<PathBuf> {
        let src = self.resolve(src);
        let dst = self.resolve(dst);

        let meta = if opts.follow_symlinks {
            fs::metadata(&src)
        } else {
            fs::symlink_metadata(&src)
        }
        .map_err(|e| Error::io(&src, e))?;

        if meta.is_dir() {
            if !opts.recursive {
                return Err(Error::execution(
                    self.step,
                    format!(
                        "'{}' is a directory; copy requires the recursive flag",
                        src.display()
                    ),
                ));
            }
            copy_tree(&src, &dst, opts.follow_symlinks).map_err(|e| Error::io(&src, e))
        } else {
            copy_file(&src, &dst, opts.follow_symlinks).map_err(|e| Error::io(&src, e))
        }
    }

    pub fn mkdir(&self, path: impl AsRef<Path>, parents: bool) -> Result<PathBuf> {
        let path = self.resolve(path);
        let result = if parents {
            fs::create_dir_all(&path)
        } else {
            fs::create_dir(&path)
        };
        result.map_err(|e| Error::io(&path, e))?;
        Ok(path)
    }

    /// External command running in this step's scratch directory.
    pub fn command(&self, program: impl AsRef<std::ffi::OsStr>) -> Cmd {
        Cmd::new(program)
            .for_step(self.step)
            .current_dir(&self.cwd)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    /// Borrowed state a test context points into.
    pub(crate) struct Fixture {
        pub temp: TempDir,
        pub esp: PathBuf,
        pub boot: PathBuf,
        pub scratch: PathBuf,
        pub os_release: OsRelease,
    }

    impl Fixture {
        pub(crate) fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let esp = temp.path().join("efi");
            let boot = temp.path().join("boot");
            let scratch = temp.path().join("scratch");
            for dir in [&esp, &boot, &scratch] {
                fs::create_dir_all(dir).unwrap();
            }
            Self {
                temp,
                esp,
                boot,
                scratch,
                os_release: OsRelease::parse("ID=chimera\n"),
            }
        }

        pub(crate) fn context<'a>(
            &'a self,
            step: &'a str,
            inputs: BTreeMap<String, Artifact>,
            config: BTreeMap<String, SettingValue>,
        ) -> StepContext<'a> {
            StepContext::new(
                step,
                "A",
                "6.6.1",
                &self.esp,
                &self.boot,
                &self.os_release,
                self.scratch.clone(),
                inputs,
                config,
            )
        }
    }

    #[test]
    fn relative_paths_resolve_against_scratch() {
        let fx = Fixture::new();
        let ctx = fx.context("kernel/chimera", BTreeMap::new(), BTreeMap::new());
        assert_eq!(ctx.resolve("vmlinuz"), fx.scratch.join("vmlinuz"));
        assert_eq!(ctx.resolve("/boot/x"), PathBuf::from("/boot/x"));

        let artifact = ctx.artifact(ArtifactKind::Kernel, "vmlinuz");
        assert_eq!(artifact.origin(), "kernel/chimera");
        assert_eq!(artifact.path, fx.scratch.join("vmlinuz"));
    }

    #[test]
    fn derive_reattributes_origin() {
        let fx = Fixture::new();
        let ctx = fx.context("layout/plain", BTreeMap::new(), BTreeMap::new());
        let kernel = Artifact::new(ArtifactKind::Kernel, "kernel/chimera", "/tmp/vmlinuz");

        let mut installed = ctx.derive(&kernel);
        installed.path = PathBuf::from("/boot/vmlinuz-6.6.1");
        installed.installed = true;

        assert_eq!(installed.origin(), "layout/plain");
        assert_eq!(installed.kind(), ArtifactKind::Kernel);
        assert_eq!(kernel.origin(), "kernel/chimera");
        assert!(!kernel.installed);
    }

    #[test]
    fn copying_a_directory_requires_recursive() {
        let fx = Fixture::new();
        let ctx = fx.context("x/y", BTreeMap::new(), BTreeMap::new());
        ctx.mkdir("tree/sub", true).unwrap();
        fs::write(fx.scratch.join("tree/sub/f"), "x").unwrap();

        let err = ctx
            .copy("tree", "copy", CopyOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::ModuleExecution { .. }));

        let out = ctx.copy("tree", "copy", CopyOptions::recursive()).unwrap();
        assert!(out.join("sub/f").is_file());
    }

    #[test]
    fn copy_keeps_symlinks_unless_followed() {
        let fx = Fixture::new();
        let ctx = fx.context("x/y", BTreeMap::new(), BTreeMap::new());
        fs::write(fx.scratch.join("real"), "data").unwrap();
        symlink("real", fx.scratch.join("link")).unwrap();

        let kept = ctx.copy("link", "kept", CopyOptions::default()).unwrap();
        assert!(kept.is_symlink());

        let opts = CopyOptions {
            follow_symlinks: true,
            ..CopyOptions::default()
        };
        let deref = ctx.copy("link", "deref", opts).unwrap();
        assert!(!deref.is_symlink());
    }

    #[test]
    fn mkdir_without_parents_fails_on_missing_parent() {
        let fx = Fixture::new();
        let ctx = fx.context("x/y", BTreeMap::new(), BTreeMap::new());
        assert!(ctx.mkdir("a/b", false).is_err());
        assert!(ctx.mkdir("a/b", true).unwrap().is_dir());
    }

    #[test]
    fn commands_run_in_scratch() {
        let fx = Fixture::new();
        let ctx = fx.context("x/y", BTreeMap::new(), BTreeMap::new());
        ctx.command("touch").arg("out").run().unwrap();
        assert!(fx.scratch.join("out").is_file());
    }

    #[test]
    fn missing_bindings_are_execution_errors() {
        let fx = Fixture::new();
        let ctx = fx.context("x/y", BTreeMap::new(), BTreeMap::new());
        assert!(ctx.input("kernel").is_none());
        assert!(matches!(
            ctx.require_setting("sbkey"),
            Err(Error::ModuleExecution { .. })
        ));
    }
}
