//! Install layouts: the only built-in steps that write outside the scratch
//! tree and mark their outputs installed.

use crate::artifact::Artifact;
use crate::error::Result;
use crate::step::{CopyOptions, Step, StepContext, StepDescriptor, StepOutput};

/// Copy `input` to `dest` and return the installed artifact.
fn install(ctx: &StepContext<'_>, input: &Artifact, dest: std::path::PathBuf) -> Result<Artifact> {
    let opts = CopyOptions {
        follow_symlinks: true,
        ..CopyOptions::default()
    };
    ctx.copy(&input.path, &dest, opts)?;
    let mut out = ctx.derive(input);
    out.path = dest;
    out.installed = true;
    Ok(out)
}

/// Separate kernel, initrd, config and symbol files in `boot`, named the
/// way Debian-style bootloader scripts expect.
pub struct Plain {
    descriptor: StepDescriptor,
}

impl Default for Plain {
    fn default() -> Self {
        Self {
            descriptor: StepDescriptor::new("layout/plain")
                .describe("Install separate kernel files in /boot")
                .requires_inputs(["kernel"])
                .accepts_inputs(["initrd", "config", "symbols"]),
        }
    }
}

const PLAIN_FILES: &[(&str, &str)] = &[
    ("kernel", "vmlinuz"),
    ("initrd", "initrd.img"),
    ("config", "config"),
    ("symbols", "System.map"),
];

impl Step for Plain {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepOutput> {
        let boot = ctx.mkdir(ctx.boot(), true)?;
        let mut out = Vec::new();
        for (input, prefix) in PLAIN_FILES {
            if let Some(artifact) = ctx.input(input) {
                let dest = boot.join(format!("{prefix}-{}", ctx.kver()));
                out.push(install(ctx, artifact, dest)?);
            }
        }
        Ok(out.into())
    }
}

/// Boot Loader Specification type #2: the UKI goes to `$ESP/EFI/Linux`,
/// where compliant bootloaders discover it.
pub struct BlsType2 {
    descriptor: StepDescriptor,
}

impl Default for BlsType2 {
    fn default() -> Self {
        Self {
            descriptor: StepDescriptor::new("layout/bls-type-2")
                .describe("Install a unified kernel image into $ESP/EFI/Linux")
                .requires_inputs(["uki"]),
        }
    }
}

impl Step for BlsType2 {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepOutput> {
        let uki = ctx.require_input("uki")?;
        let dir = ctx.mkdir(ctx.esp().join("EFI/Linux"), true)?;
        let name = format!(
            "{}-{}-{}.efi",
            ctx.os_release().id(),
            ctx.chain_name(),
            ctx.kver()
        );
        Ok(install(ctx, uki, dir.join(name))?.into())
    }
}
