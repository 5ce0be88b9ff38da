//! Host tool checks run before a chain starts.
//!
//! A chain that would fail halfway through because `sbsign` is missing
//! should fail before its first step instead, while the scratch tree is
//! still empty.

use crate::error::{Error, Result};

/// Check if a command exists in `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that every tool a step declares is available.
///
/// Returns a [`Error::ModuleExecution`] for `step` listing all missing tools.
pub fn check_required_tools<S: AsRef<str>>(step: &str, tools: &[S]) -> Result<()> {
    let missing: Vec<&str> = tools
        .iter()
        .map(AsRef::as_ref)
        .filter(|tool| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        return Err(Error::execution(
            step,
            format!("missing required host tools: {}", missing.join(", ")),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_lists_missing() {
        assert!(check_required_tools("x/y", &["sh"]).is_ok());
        let err = check_required_tools("x/y", &["sh", "nonexistent_tool_xyz", "another_xyz"])
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("nonexistent_tool_xyz"));
        assert!(msg.contains("another_xyz"));
    }
}
