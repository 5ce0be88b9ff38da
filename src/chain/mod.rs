//! The pipeline engine.
//!
//! A [`Chain`] is one configured chain bound to one kernel version. Running
//! it creates a scratch tree with one directory per link, executes the links
//! in order against a shared [`ArtifactStore`], and removes the scratch tree
//! again however the run ends.
//!
//! Inputs are bound by kind with "latest wins": when several artifacts match
//! a declared input, the most recently appended one is handed to the step.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::artifact::{Artifact, ArtifactStore};
use crate::config::{ChainConfig, SettingValue};
use crate::error::{Error, Result};
use crate::os_release::{OsRelease, OS_RELEASE_PATHS};
use crate::preflight::check_required_tools;
use crate::prune::Pruner;
use crate::registry::Registry;
use crate::run_store::RunStore;
use crate::step::{Step, StepContext};

/// `until` value that stops right after the scratch tree is created and
/// keeps it on disk.
pub const PREPARE_SENTINEL: &str = "prepare";

/// Conventional ESP mount points, in lookup order.
pub const ESP_CANDIDATES: &[&str] = &["/efi", "/boot/efi", "/boot"];
pub const DEFAULT_BOOT: &str = "/boot";

/// Host facts a chain is resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEnv {
    pub esp_candidates: Vec<PathBuf>,
    pub boot_default: PathBuf,
    pub os_release_paths: Vec<PathBuf>,
}

impl Default for HostEnv {
    fn default() -> Self {
        Self {
            esp_candidates: ESP_CANDIDATES.iter().map(PathBuf::from).collect(),
            boot_default: PathBuf::from(DEFAULT_BOOT),
            os_release_paths: OS_RELEASE_PATHS.iter().map(PathBuf::from).collect(),
        }
    }
}

/// How a run ended, when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every link ran.
    Completed,
    /// The `until` pattern matched link `at`; later links did not run.
    Stopped { at: String },
    /// Only the scratch tree was created. It is left on disk.
    Prepared { scratch: PathBuf },
}

/// Check an `until` value before any chain runs.
pub fn check_until(until: &str) -> Result<()> {
    if until != PREPARE_SENTINEL {
        until_pattern(until)?;
    }
    Ok(())
}

fn until_pattern(until: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(until)
        .map_err(|e| Error::config(format!("invalid --until pattern '{until}': {e}")))
}

/// What a chain that ran without error did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub outcome: RunOutcome,
    /// Files of the previous run for the same kver that were removed.
    pub removed: Vec<PathBuf>,
    /// Installed artifacts now recorded. Empty unless the run completed.
    pub installed: Vec<Artifact>,
}

/// Run `chains` in order, recording every completed run.
///
/// A chain-local failure (see [`Error::is_chain_local`]) is reported in the
/// chain's slot and the next chain still runs. Any other failure is
/// reported the same way but stops the remaining chains, which are then
/// missing from the result.
///
/// # Arguments
///
/// * `chains` - Chains resolved with [`Chain::new`], run in this order
/// * `until` - Optional stop pattern, as for [`Chain::run`]
/// * `registry` - Used to look up prune hooks while reconciling
/// * `runs` - Where completed runs are recorded
///
/// # Example
///
/// ```rust,ignore
/// let results = run_chains(chains, None, &mut registry, &runs);
/// let failed = results.iter().filter(|(_, r)| r.is_err()).count();
/// ```
pub fn run_chains(
    chains: Vec<Chain>,
    until: Option<&str>,
    registry: &mut Registry,
    runs: &RunStore,
) -> Vec<(String, Result<ChainReport>)> {
    let mut results = Vec::with_capacity(chains.len());
    for chain in chains {
        let name = chain.name().to_string();
        let result = run_and_record(chain, until, registry, runs);
        let fatal = match &result {
            Ok(_) => false,
            Err(e) => {
                tracing::error!(chain = %name, error = %e, "chain failed");
                !e.is_chain_local()
            }
        };
        results.push((name, result));
        if fatal {
            break;
        }
    }
    results
}

fn run_and_record(
    mut chain: Chain,
    until: Option<&str>,
    registry: &mut Registry,
    runs: &RunStore,
) -> Result<ChainReport> {
    let outcome = chain.run(until)?;
    if outcome != RunOutcome::Completed {
        return Ok(ChainReport {
            outcome,
            removed: Vec::new(),
            installed: Vec::new(),
        });
    }

    let name = chain.name().to_string();
    let kver = chain.kver().to_string();
    let store = chain.into_store();
    let removed = Pruner::new(runs, registry).reconcile(&name, &kver, &store)?;
    Ok(ChainReport {
        outcome,
        removed,
        installed: store.installed().cloned().collect(),
    })
}

struct Link {
    name: String,
    step: Arc<dyn Step>,
}

pub struct Chain {
    config: ChainConfig,
    kver: String,
    esp: PathBuf,
    boot: PathBuf,
    os_release: OsRelease,
    links: Vec<Link>,
    store: ArtifactStore,
}

impl Chain {
    pub fn new(
        kver: &str,
        config: &ChainConfig,
        registry: &mut Registry,
        host: &HostEnv,
    ) -> Result<Self> {
        if kver.is_empty() || kver.contains('/') {
            return Err(Error::config(format!("invalid kernel version '{kver}'")));
        }

        let esp = match &config.esp {
            Some(esp) => esp.clone(),
            None => host
                .esp_candidates
                .iter()
                .find(|dir| dir.is_dir())
                .map(|dir| fs::canonicalize(dir).map_err(|e| Error::io(dir, e)))
                .transpose()?
                .ok_or_else(|| {
                    Error::config(format!(
                        "chain '{}': no 'esp' configured and none of {} exists",
                        config.name,
                        host.esp_candidates
                            .iter()
                            .map(|p| p.display().to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ))
                })?,
        };
        let boot = config
            .boot
            .clone()
            .unwrap_or_else(|| host.boot_default.clone());
        let os_release = OsRelease::load_from(&host.os_release_paths)?;

        let links = config
            .links
            .iter()
            .map(|name| -> Result<Link> {
                Ok(Link {
                    name: name.clone(),
                    step: registry.load(name)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config: config.clone(),
            kver: kver.to_string(),
            esp,
            boot,
            os_release,
            links,
            store: ArtifactStore::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kver(&self) -> &str {
        &self.kver
    }

    pub fn esp(&self) -> &Path {
        &self.esp
    }

    pub fn boot(&self) -> &Path {
        &self.boot
    }

    /// Artifacts produced so far.
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn into_store(self) -> ArtifactStore {
        self.store
    }

    /// Execute the links in order against a fresh scratch tree.
    ///
    /// Each link gets its own directory under the scratch tree as working
    /// directory, the latest stored artifact for each declared input, and
    /// the declared settings. Its output is appended to the store before
    /// the next link runs. The scratch tree is removed when the run ends,
    /// whether it failed or not.
    ///
    /// # Arguments
    ///
    /// * `until` - Glob matched against link names; the run stops after the
    ///   first link it matches. [`PREPARE_SENTINEL`] stops before any link
    ///   runs and keeps the scratch tree.
    ///
    /// # Returns
    ///
    /// * `Ok(RunOutcome::Completed)` when every link ran
    /// * `Ok(RunOutcome::Stopped { .. })` when `until` matched a link
    /// * `Ok(RunOutcome::Prepared { .. })` for the prepare sentinel
    /// * `Err` for a missing tool or input, or a failing link
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let mut chain = Chain::new("6.6.1", &config, &mut registry, &HostEnv::default())?;
    /// if chain.run(Some("initrd/*"))? == RunOutcome::Completed {
    ///     runs.store(chain.name(), chain.kver(), chain.store())?;
    /// }
    /// ```
    pub fn run(&mut self, until: Option<&str>) -> Result<RunOutcome> {
        let prepare_only = until == Some(PREPARE_SENTINEL);
        let pattern = match until {
            Some(until) if !prepare_only => Some(until_pattern(until)?),
            _ => None,
        };

        if !prepare_only {
            for link in &self.links {
                check_required_tools(&link.name, &link.step.descriptor().required_tools)?;
            }
        }

        let scratch = tempfile::Builder::new()
            .prefix(&format!("chain-{}-{}.", self.config.name, self.kver))
            .tempdir()
            .map_err(|e| Error::io(std::env::temp_dir(), e))?;
        for link in &self.links {
            let dir = scratch.path().join(&link.name);
            fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }

        if prepare_only {
            let scratch = scratch.keep();
            tracing::info!(chain = %self.config.name, scratch = %scratch.display(), "scratch tree prepared");
            return Ok(RunOutcome::Prepared { scratch });
        }

        let mut outcome = RunOutcome::Completed;
        for index in 0..self.links.len() {
            let name = self.links[index].name.clone();
            let step = Arc::clone(&self.links[index].step);

            tracing::info!(chain = %self.config.name, kver = %self.kver, step = %name, "running step");
            // On error `scratch` is dropped here, which removes the tree.
            self.run_link(&name, step.as_ref(), scratch.path().join(&name))?;
            tracing::info!(chain = %self.config.name, step = %name, artifacts = self.store.len(), "step finished");

            if pattern.as_ref().is_some_and(|p| p.matches(&name)) {
                tracing::info!(chain = %self.config.name, step = %name, "stopping at --until match");
                outcome = RunOutcome::Stopped { at: name };
                break;
            }
        }

        if let Err(e) = scratch.close() {
            tracing::warn!(chain = %self.config.name, error = %e, "failed to remove scratch tree");
        }
        Ok(outcome)
    }

    fn run_link(&mut self, name: &str, step: &dyn Step, cwd: PathBuf) -> Result<()> {
        let descriptor = step.descriptor();

        let mut inputs = BTreeMap::new();
        for (input, query, required) in descriptor.input_queries()? {
            match self.store.latest(query) {
                Some(artifact) => {
                    tracing::debug!(step = name, input, path = %artifact.path.display(), "bound input");
                    inputs.insert(input.to_string(), artifact.clone());
                }
                None if required => {
                    return Err(Error::execution(
                        name,
                        format!("required input '{input}' was not produced by an earlier link"),
                    ));
                }
                None => tracing::debug!(step = name, input, "optional input not available"),
            }
        }

        let mut config: BTreeMap<String, SettingValue> = BTreeMap::new();
        for (key, required) in descriptor.config_keys() {
            match self.config.lookup(key) {
                Some(value) => {
                    config.insert(key.to_string(), value);
                }
                None if required => {
                    return Err(Error::execution(
                        name,
                        format!("required setting '{key}' is missing from the sanitized configuration"),
                    ));
                }
                None => {}
            }
        }

        let output = {
            let mut ctx = StepContext::new(
                name,
                &self.config.name,
                &self.kver,
                &self.esp,
                &self.boot,
                &self.os_release,
                cwd,
                inputs,
                config,
            );
            step.execute(&mut ctx)?
        };

        self.store.extend(output.into_vec())
    }
}
