//! Chain configuration.
//!
//! The TOML file has an optional `[global]` table and one or more
//! `[[chains]]` entries:
//!
//! ```toml
//! [global]
//! sbkey = "/etc/bootchain/db.key"
//! sbcert = "/etc/bootchain/db.crt"
//!
//! [[chains]]
//! name = "uki"
//! links = ["kernel/chimera", "initrd/booster", "uki/ukify", "signing/sbsigntools", "layout/bls-type-2"]
//! Cmdline = "root=LABEL=root rw quiet"
//! ```
//!
//! Each chain accepts the core settings plus whatever options its linked
//! steps declare. Global settings apply to every chain that accepts them and
//! are overridden by chain-level values. Values are type-checked here, so
//! the engine only ever sees a sanitized [`ChainConfig`].

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::step::OptionType;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/bootchain/config.toml";
pub const DEFAULT_STATE_DIR: &str = "/var/lib/bootchain";
pub const DEFAULT_KEEP: usize = 2;

/// Settings every chain accepts regardless of its links.
pub const CORE_OPTIONS: &[(&str, OptionType)] = &[
    ("esp", OptionType::Dir),
    ("boot", OptionType::Dir),
    ("sbcert", OptionType::File),
    ("sbkey", OptionType::File),
];

const STRUCTURAL_KEYS: &[&str] = &["name", "links", "keep"];

/// True for keys a step may not declare as its own option.
pub fn is_reserved_key(key: &str) -> bool {
    CORE_OPTIONS.iter().any(|(core, _)| *core == key) || STRUCTURAL_KEYS.contains(&key)
}

/// A type-checked setting value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    Path(PathBuf),
    Text(String),
}

impl SettingValue {
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            SettingValue::Path(path) => Some(path),
            SettingValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Path(_) => None,
            SettingValue::Text(text) => Some(text),
        }
    }

    pub fn as_os_str(&self) -> &OsStr {
        match self {
            SettingValue::Path(path) => path.as_os_str(),
            SettingValue::Text(text) => OsStr::new(text),
        }
    }
}

impl AsRef<OsStr> for SettingValue {
    fn as_ref(&self) -> &OsStr {
        self.as_os_str()
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Path(path) => write!(f, "{}", path.display()),
            SettingValue::Text(text) => f.write_str(text),
        }
    }
}

/// One sanitized chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub name: String,
    pub links: Vec<String>,
    pub esp: Option<PathBuf>,
    pub boot: Option<PathBuf>,
    /// Kernel versions kept by the retention policy; `0` keeps all.
    pub keep: usize,
    /// Every other accepted setting, including `sbcert`/`sbkey`.
    pub settings: BTreeMap<String, SettingValue>,
}

impl ChainConfig {
    pub fn new<I, S>(name: impl Into<String>, links: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            links: links.into_iter().map(Into::into).collect(),
            esp: None,
            boot: None,
            keep: DEFAULT_KEEP,
            settings: BTreeMap::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: SettingValue) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// Value of a setting as a step sees it, `esp`/`boot` included.
    pub fn lookup(&self, key: &str) -> Option<SettingValue> {
        match key {
            "esp" => self.esp.clone().map(SettingValue::Path),
            "boot" => self.boot.clone().map(SettingValue::Path),
            _ => self.settings.get(key).cloned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
}

impl Config {
    /// Load and sanitize the configuration file. `None` means the default
    /// location.
    pub fn load(path: Option<&Path>, registry: &mut Registry) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        if !path.exists() {
            return Err(Error::config(format!(
                "configuration file '{}' does not exist",
                path.display()
            )));
        }
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_toml_str(&content, registry)
            .map_err(|e| match e {
                Error::Configuration(msg) => {
                    Error::config(format!("{}: {msg}", path.display()))
                }
                other => other,
            })
    }

    pub fn from_toml_str(content: &str, registry: &mut Registry) -> Result<Self> {
        let raw: toml::Table = toml::from_str(content).map_err(|e| Error::config(e.to_string()))?;
        Self::sanitize(raw, registry)
    }

    /// Validate a raw table against the options declared by each chain's
    /// linked steps.
    pub fn sanitize(mut raw: toml::Table, registry: &mut Registry) -> Result<Self> {
        let global = match raw.remove("global") {
            None => toml::Table::new(),
            Some(toml::Value::Table(table)) => table,
            Some(_) => return Err(Error::config("'global' must be a table")),
        };
        let chains = match raw.remove("chains") {
            Some(toml::Value::Array(chains)) if !chains.is_empty() => chains,
            Some(toml::Value::Array(_)) | None => {
                return Err(Error::config("at least one [[chains]] entry is required"))
            }
            Some(_) => return Err(Error::config("'chains' must be an array of tables")),
        };
        for key in raw.keys() {
            tracing::warn!(key = %key, "ignoring unknown top-level configuration key");
        }

        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(chains.len());
        for (index, chain) in chains.into_iter().enumerate() {
            let toml::Value::Table(table) = chain else {
                return Err(Error::config(format!("chains[{index}] must be a table")));
            };
            let chain = sanitize_chain(table, &global, registry)?;
            if !seen.insert(chain.name.clone()) {
                return Err(Error::config(format!(
                    "chain '{}' is defined more than once",
                    chain.name
                )));
            }
            out.push(chain);
        }
        Ok(Self { chains: out })
    }

    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|chain| chain.name == name)
    }

    /// Chains named in `names` (all chains when empty), first occurrence
    /// order, duplicates removed. An unknown name is a configuration error.
    pub fn select(&self, names: &[String]) -> Result<Vec<&ChainConfig>> {
        if names.is_empty() {
            return Ok(self.chains.iter().collect());
        }
        let mut seen = BTreeSet::new();
        let mut selected = Vec::new();
        for name in names {
            let chain = self
                .chain(name)
                .ok_or_else(|| Error::config(format!("unknown chain '{name}'")))?;
            if seen.insert(name.as_str()) {
                selected.push(chain);
            }
        }
        Ok(selected)
    }
}

/// Safe to use as a single file name under the state directory.
fn is_safe_chain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\0')
        && !name.starts_with('.')
}

fn sanitize_chain(
    mut table: toml::Table,
    global: &toml::Table,
    registry: &mut Registry,
) -> Result<ChainConfig> {
    let name = match table.remove("name") {
        Some(toml::Value::String(name)) => name,
        Some(_) => return Err(Error::config("chain 'name' must be a string")),
        None => return Err(Error::config("every chain needs a 'name'")),
    };
    if !is_safe_chain_name(&name) {
        return Err(Error::config(format!(
            "chain name '{name}' must be a plain file name"
        )));
    }

    let links = match table.remove("links") {
        Some(toml::Value::Array(links)) => links
            .into_iter()
            .map(|link| match link {
                toml::Value::String(link) => Ok(link),
                _ => Err(Error::config(format!(
                    "chain '{name}': links must be step names"
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(Error::config(format!("chain '{name}': 'links' must be an array"))),
        None => return Err(Error::config(format!("chain '{name}' has no 'links'"))),
    };
    if links.is_empty() {
        return Err(Error::config(format!("chain '{name}' has no links")));
    }

    let mut accepted: BTreeMap<String, OptionType> = CORE_OPTIONS
        .iter()
        .map(|(key, ty)| (key.to_string(), *ty))
        .collect();
    let mut required = Vec::new();
    for link in &links {
        let step = registry.load(link)?;
        let descriptor = step.descriptor();
        for (option, ty) in &descriptor.options {
            match accepted.get(option) {
                Some(existing) if existing != ty => {
                    return Err(Error::config(format!(
                        "chain '{name}': option '{option}' is declared as {existing} and as {ty} (by '{link}')"
                    )));
                }
                _ => {
                    accepted.insert(option.clone(), *ty);
                }
            }
        }
        for key in &descriptor.required_config {
            required.push((link.clone(), key.clone()));
        }
    }

    let mut merged: BTreeMap<String, toml::Value> = BTreeMap::new();
    for (key, value) in global {
        if accepted.contains_key(key) || key == "keep" {
            merged.insert(key.clone(), value.clone());
        } else {
            tracing::debug!(chain = %name, key = %key, "global setting not used by this chain");
        }
    }
    for (key, value) in table {
        if accepted.contains_key(&key) || key == "keep" {
            merged.insert(key, value);
        } else {
            tracing::warn!(chain = %name, key = %key, "ignoring unknown configuration key");
        }
    }

    let keep = match merged.remove("keep") {
        None => DEFAULT_KEEP,
        Some(toml::Value::Integer(keep)) => usize::try_from(keep).map_err(|_| {
            Error::config(format!("chain '{name}': 'keep' must not be negative"))
        })?,
        Some(_) => {
            return Err(Error::config(format!(
                "chain '{name}': 'keep' must be an integer"
            )))
        }
    };

    let mut settings = BTreeMap::new();
    for (key, value) in merged {
        let ty = accepted[&key];
        settings.insert(key.clone(), check_setting(&name, &key, ty, &value)?);
    }

    let esp = settings.remove("esp").and_then(into_path);
    let boot = settings.remove("boot").and_then(into_path);
    let chain = ChainConfig {
        name,
        links,
        esp,
        boot,
        keep,
        settings,
    };

    for (link, key) in required {
        if chain.lookup(&key).is_none() {
            return Err(Error::config(format!(
                "chain '{}': link '{link}' requires setting '{key}'",
                chain.name
            )));
        }
    }

    Ok(chain)
}

fn into_path(value: SettingValue) -> Option<PathBuf> {
    match value {
        SettingValue::Path(path) => Some(path),
        SettingValue::Text(_) => None,
    }
}

fn check_setting(
    chain: &str,
    key: &str,
    ty: OptionType,
    value: &toml::Value,
) -> Result<SettingValue> {
    let text = value.as_str().ok_or_else(|| {
        Error::config(format!(
            "chain '{chain}': setting '{key}' must be a string ({ty})"
        ))
    })?;
    match ty {
        OptionType::String => Ok(SettingValue::Text(text.to_string())),
        // Paths are canonicalized here: steps resolve relative paths against
        // their scratch directory, not the directory bootchain was run from.
        OptionType::File => match fs::canonicalize(text) {
            Ok(path) if path.is_file() => Ok(SettingValue::Path(path)),
            _ => Err(Error::config(format!(
                "chain '{chain}': setting '{key}' must name an existing file, got '{text}'"
            ))),
        },
        OptionType::Dir => match fs::canonicalize(text) {
            Ok(path) if path.is_dir() => Ok(SettingValue::Path(path)),
            _ => Err(Error::config(format!(
                "chain '{chain}': setting '{key}' must name an existing directory, got '{text}'"
            ))),
        },
    }
}
