//! Unified kernel images.

use crate::artifact::ArtifactKind;
use crate::error::Result;
use crate::step::{OptionType, Step, StepContext, StepDescriptor, StepOutput};

/// Combines the latest kernel, initrd and an optional command line into a
/// UKI with systemd's `ukify`.
pub struct Ukify {
    descriptor: StepDescriptor,
}

impl Default for Ukify {
    fn default() -> Self {
        Self {
            descriptor: StepDescriptor::new("uki/ukify")
                .describe("Build a unified kernel image with ukify")
                .option("Cmdline", OptionType::String)
                .accepts_config(["Cmdline"])
                .requires_inputs(["kernel"])
                .accepts_inputs(["initrd"])
                .requires_tools(["ukify"]),
        }
    }
}

impl Step for Ukify {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepOutput> {
        let kernel = ctx.require_input("kernel")?;
        let uki = ctx.artifact(ArtifactKind::Uki, "uki.efi");

        ctx.command("ukify")
            .arg("build")
            .arg("--linux")
            .arg_path(&kernel.path)
            .opt_arg("--initrd", ctx.input("initrd").map(|initrd| initrd.path.as_os_str()))
            .opt_arg("--cmdline", ctx.setting("Cmdline"))
            .arg("--output")
            .arg_path(&uki.path)
            .run()?;

        Ok(uki.into())
    }
}
