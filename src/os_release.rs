//! Host `os-release` metadata, used by layout steps to name installed files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Standard locations, in lookup order.
pub const OS_RELEASE_PATHS: &[&str] = &["/etc/os-release", "/usr/lib/os-release"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    fields: BTreeMap<String, String>,
}

impl OsRelease {
    /// Load from the first existing path in `candidates`.
    pub fn load_from(candidates: &[PathBuf]) -> Result<Self> {
        let path = candidates.iter().find(|p| p.is_file()).ok_or_else(|| {
            Error::config(format!(
                "no os-release file found (checked {})",
                candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;
        Self::read(path)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut fields = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                fields.insert(key.trim().to_string(), unquote(value.trim()).to_string());
            }
        }
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// `ID`, falling back to `linux` as os-release(5) specifies.
    pub fn id(&self) -> &str {
        self.get("ID").unwrap_or("linux")
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_quoted_and_bare_values() {
        let release = OsRelease::parse(
            "# comment\nNAME=\"Chimera Linux\"\nID=chimera\n\nPRETTY_NAME='Chimera'\nBROKEN\n",
        );
        assert_eq!(release.get("NAME"), Some("Chimera Linux"));
        assert_eq!(release.id(), "chimera");
        assert_eq!(release.get("PRETTY_NAME"), Some("Chimera"));
        assert_eq!(release.get("BROKEN"), None);
    }

    #[test]
    fn id_defaults_to_linux() {
        assert_eq!(OsRelease::parse("NAME=x\n").id(), "linux");
    }

    #[test]
    fn load_uses_first_existing_candidate() {
        let temp = TempDir::new().unwrap();
        let second = temp.path().join("usr-os-release");
        fs::write(&second, "ID=void\n").unwrap();

        let release =
            OsRelease::load_from(&[temp.path().join("missing"), second.clone()]).unwrap();
        assert_eq!(release.id(), "void");

        let err = OsRelease::load_from(&[temp.path().join("missing")]).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
