//! Initrd generators.
//!
//! Each step writes `initrd.img` into its scratch directory and returns it
//! as an Initrd artifact; installing it is left to a layout step.

use crate::artifact::{Artifact, ArtifactKind};
use crate::error::Result;
use crate::step::{OptionType, Step, StepContext, StepDescriptor, StepOutput};

const INITRD_NAME: &str = "initrd.img";

fn initrd(ctx: &StepContext<'_>) -> Artifact {
    ctx.artifact(ArtifactKind::Initrd, INITRD_NAME)
}

pub struct Booster {
    descriptor: StepDescriptor,
}

impl Default for Booster {
    fn default() -> Self {
        Self {
            descriptor: StepDescriptor::new("initrd/booster")
                .describe("Build an initrd with booster")
                .option("BoosterConfFile", OptionType::File)
                .accepts_config(["BoosterConfFile"])
                .requires_tools(["booster"]),
        }
    }
}

impl Step for Booster {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepOutput> {
        let initrd = initrd(ctx);
        ctx.command("booster")
            .args(["build", "--kernel-version", ctx.kver()])
            .opt_arg("--config", ctx.setting("BoosterConfFile"))
            .arg_path(&initrd.path)
            .run()?;
        Ok(initrd.into())
    }
}

pub struct Mkinitcpio {
    descriptor: StepDescriptor,
}

impl Default for Mkinitcpio {
    fn default() -> Self {
        Self {
            descriptor: StepDescriptor::new("initrd/mkinitcpio")
                .describe("Build an initrd with mkinitcpio")
                .option("MkinitcpioConfig", OptionType::File)
                .option("MkinitcpioHookDir", OptionType::Dir)
                .accepts_config(["MkinitcpioConfig", "MkinitcpioHookDir"])
                .requires_tools(["mkinitcpio"]),
        }
    }
}

impl Step for Mkinitcpio {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepOutput> {
        let initrd = initrd(ctx);
        ctx.command("mkinitcpio")
            .args(["--kernel", ctx.kver(), "-g"])
            .arg_path(&initrd.path)
            .opt_arg("-c", ctx.setting("MkinitcpioConfig"))
            .opt_arg("-D", ctx.setting("MkinitcpioHookDir"))
            .run()?;
        Ok(initrd.into())
    }
}

/// Debian's `mkinitramfs`.
pub struct InitramfsTools {
    descriptor: StepDescriptor,
}

impl Default for InitramfsTools {
    fn default() -> Self {
        Self {
            descriptor: StepDescriptor::new("initrd/initramfs-tools")
                .describe("Build an initrd with initramfs-tools")
                .requires_tools(["mkinitramfs"]),
        }
    }
}

impl Step for InitramfsTools {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepOutput> {
        let initrd = initrd(ctx);
        ctx.command("mkinitramfs")
            .arg("-o")
            .arg_path(&initrd.path)
            .arg(ctx.kver())
            .run()?;
        Ok(initrd.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_are_valid() {
        for step in [
            &Booster::default() as &dyn Step,
            &Mkinitcpio::default(),
            &InitramfsTools::default(),
        ] {
            let descriptor = step.descriptor();
            descriptor.validate().unwrap();
            assert!(descriptor.required_inputs.is_empty());
            assert_eq!(descriptor.required_tools.len(), 1);
        }
    }

    #[test]
    fn declared_options_are_accepted_settings() {
        let descriptor = Mkinitcpio::default().descriptor().clone();
        for option in descriptor.options.keys() {
            assert!(descriptor.optional_config.contains(option));
        }
        assert_eq!(descriptor.options["MkinitcpioHookDir"], OptionType::Dir);
    }
}
