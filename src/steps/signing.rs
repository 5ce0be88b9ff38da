//! Secure Boot signing of kernels and UKIs.
//!
//! Both steps take the latest signable artifact and return a signed copy in
//! their scratch directory, derived from the input so the kind is kept.

use std::ffi::OsString;

use crate::artifact::Artifact;
use crate::error::Result;
use crate::step::{Step, StepContext, StepDescriptor, StepOutput};

fn signing_descriptor(name: &str, description: &str, tool: &str) -> StepDescriptor {
    StepDescriptor::new(name)
        .describe(description)
        .requires_config(["sbkey", "sbcert"])
        .requires_inputs(["signable"])
        .requires_tools([tool])
}

/// Signed copy of `input` at `file_name` in the scratch directory.
fn signed_output(ctx: &StepContext<'_>, input: &Artifact, file_name: OsString) -> Artifact {
    let mut out = ctx.derive(input);
    out.path = ctx.resolve(file_name);
    out.installed = false;
    out
}

pub struct Sbsigntools {
    descriptor: StepDescriptor,
}

impl Default for Sbsigntools {
    fn default() -> Self {
        Self {
            descriptor: signing_descriptor(
                "signing/sbsigntools",
                "Sign an EFI binary with sbsign",
                "sbsign",
            ),
        }
    }
}

impl Step for Sbsigntools {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepOutput> {
        let input = ctx.require_input("signable")?;
        let mut name = input
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("image"));
        name.push(".signed");
        let mut out = signed_output(ctx, input, name);

        ctx.command("sbsign")
            .arg("--key")
            .arg(ctx.require_setting("sbkey")?)
            .arg("--cert")
            .arg(ctx.require_setting("sbcert")?)
            .arg("--output")
            .arg_path(&out.path)
            .arg_path(&input.path)
            .run()?;

        out.set_signed(true)?;
        Ok(out.into())
    }
}

/// FreeBSD's `uefisign`.
pub struct Uefisign {
    descriptor: StepDescriptor,
}

impl Default for Uefisign {
    fn default() -> Self {
        Self {
            descriptor: signing_descriptor(
                "signing/uefisign",
                "Sign an EFI binary with uefisign",
                "uefisign",
            ),
        }
    }
}

impl Step for Uefisign {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepOutput> {
        let input = ctx.require_input("signable")?;
        let mut out = signed_output(ctx, input, OsString::from("signed.efi"));

        ctx.command("uefisign")
            .arg("-c")
            .arg(ctx.require_setting("sbcert")?)
            .arg("-k")
            .arg(ctx.require_setting("sbkey")?)
            .arg("-o")
            .arg_path(&out.path)
            .arg_path(&input.path)
            .run()?;

        out.set_signed(true)?;
        Ok(out.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactKind;
    use crate::step::context::tests::Fixture;
    use std::collections::BTreeMap;

    #[test]
    fn signing_steps_need_keys_and_a_signable_input() {
        for descriptor in [
            Sbsigntools::default().descriptor().clone(),
            Uefisign::default().descriptor().clone(),
        ] {
            descriptor.validate().unwrap();
            let required: Vec<_> = descriptor.required_config.iter().cloned().collect();
            assert_eq!(required, vec!["sbcert".to_string(), "sbkey".to_string()]);
            assert!(descriptor.required_inputs.contains("signable"));
        }
    }

    #[test]
    fn signed_output_keeps_kind_and_moves_into_scratch() {
        let fx = Fixture::new();
        let ctx = fx.context("signing/sbsigntools", BTreeMap::new(), BTreeMap::new());
        let uki = Artifact::new(ArtifactKind::Uki, "uki/ukify", "/tmp/uki.efi").with_installed(true);

        let out = signed_output(&ctx, &uki, OsString::from("uki.efi.signed"));
        assert_eq!(out.kind(), ArtifactKind::Uki);
        assert_eq!(out.origin(), "signing/sbsigntools");
        assert_eq!(out.path, fx.scratch.join("uki.efi.signed"));
        assert!(!out.installed);
        assert_eq!(out.signed(), Some(false));
    }
}
