//! Kernel images shipped by distribution packages.

use std::path::{Path, PathBuf};

use crate::artifact::ArtifactKind;
use crate::config::SettingValue;
use crate::error::{Error, Result};
use crate::step::{CopyOptions, OptionType, Step, StepContext, StepDescriptor, StepOutput};

pub const DEFAULT_MODULES_DIR: &str = "/usr/lib/modules";

/// Picks up `config-<kver>`, `vmlinuz-<kver>` and, when present,
/// `System.map-<kver>` from `<ModulesDir>/<kver>/boot`, the layout Chimera
/// Linux kernel packages install.
pub struct Chimera {
    descriptor: StepDescriptor,
}

impl Default for Chimera {
    fn default() -> Self {
        Self {
            descriptor: StepDescriptor::new("kernel/chimera")
                .describe("Kernel image, config and symbols from a packaged kernel")
                .option("ModulesDir", OptionType::Dir)
                .accepts_config(["ModulesDir"]),
        }
    }
}

impl Step for Chimera {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepOutput> {
        let modules = ctx
            .setting("ModulesDir")
            .and_then(SettingValue::as_path)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MODULES_DIR));
        let kver = ctx.kver().to_string();
        let source = modules.join(&kver).join("boot");

        let vmlinuz = source.join(format!("vmlinuz-{kver}"));
        if !vmlinuz.is_file() {
            return Err(Error::execution(
                ctx.step_name(),
                format!("kernel {kver} is not installed ('{}' missing)", vmlinuz.display()),
            ));
        }

        let opts = CopyOptions {
            follow_symlinks: true,
            ..CopyOptions::default()
        };
        let config = ctx.copy(source.join(format!("config-{kver}")), "config", opts)?;
        let kernel = ctx.copy(&vmlinuz, "kernel", opts)?;

        let mut out = vec![
            ctx.artifact(ArtifactKind::Config, config),
            ctx.artifact(ArtifactKind::Kernel, kernel),
        ];

        let symbols = source.join(format!("System.map-{kver}"));
        if symbols.is_file() {
            let symbols = ctx.copy(&symbols, "System.map", opts)?;
            out.push(ctx.artifact(ArtifactKind::Symbols, symbols));
        }

        Ok(out.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::context::tests::Fixture;
    use std::collections::BTreeMap;
    use std::fs;

    fn modules_tree(fx: &Fixture, with_map: bool) -> PathBuf {
        let modules = fx.temp.path().join("modules");
        let boot = modules.join("6.6.1/boot");
        fs::create_dir_all(&boot).unwrap();
        fs::write(boot.join("config-6.6.1"), "CONFIG_EFI=y\n").unwrap();
        fs::write(boot.join("vmlinuz-6.6.1"), "kernel").unwrap();
        if with_map {
            fs::write(boot.join("System.map-6.6.1"), "ffff T _start\n").unwrap();
        }
        modules
    }

    fn config(modules: PathBuf) -> BTreeMap<String, SettingValue> {
        BTreeMap::from([("ModulesDir".to_string(), SettingValue::Path(modules))])
    }

    #[test]
    fn copies_kernel_and_config_into_scratch() {
        let fx = Fixture::new();
        let modules = modules_tree(&fx, false);
        let mut ctx = fx.context("kernel/chimera", BTreeMap::new(), config(modules));

        let out = Chimera::default().execute(&mut ctx).unwrap().into_vec();
        let kinds: Vec<_> = out.iter().map(|a| a.kind()).collect();
        assert_eq!(kinds, vec![ArtifactKind::Config, ArtifactKind::Kernel]);
        assert_eq!(out[1].path, fx.scratch.join("kernel"));
        assert_eq!(fs::read_to_string(&out[1].path).unwrap(), "kernel");
        assert_eq!(out[1].signed(), Some(false));
        assert!(!out[1].installed);
    }

    #[test]
    fn picks_up_system_map_when_present() {
        let fx = Fixture::new();
        let modules = modules_tree(&fx, true);
        let mut ctx = fx.context("kernel/chimera", BTreeMap::new(), config(modules));

        let out = Chimera::default().execute(&mut ctx).unwrap().into_vec();
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].kind(), ArtifactKind::Symbols);
    }

    #[test]
    fn missing_kernel_is_execution_error() {
        let fx = Fixture::new();
        let modules = fx.temp.path().join("empty");
        fs::create_dir_all(&modules).unwrap();
        let mut ctx = fx.context("kernel/chimera", BTreeMap::new(), config(modules));

        let err = Chimera::default().execute(&mut ctx).unwrap_err();
        assert!(matches!(err, Error::ModuleExecution { .. }));
    }
}
