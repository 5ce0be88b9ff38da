//! Removal of installed files that are no longer wanted.
//!
//! Two situations lead here:
//! - a finished run for a (chain, kver) no longer installs a path the
//!   previous run for the same pair installed (an orphan)
//! - a chain holds more kernel versions than its `keep` setting allows, or
//!   the operator prunes one version explicitly

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::artifact::filesystem::canonical_install_path;
use crate::artifact::{Artifact, ArtifactStore};
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::run_store::RunStore;

pub struct Pruner<'a> {
    runs: &'a RunStore,
    registry: &'a mut Registry,
}

impl<'a> Pruner<'a> {
    pub fn new(runs: &'a RunStore, registry: &'a mut Registry) -> Self {
        Self { runs, registry }
    }

    /// Paths the previous run for `chain`/`kver` installed that `current`
    /// does not. Empty when there is no previous run.
    ///
    /// Both sides are compared in canonical form, so reaching the same file
    /// through a symlinked mount point is not an orphan.
    pub fn orphaned_paths(
        &self,
        chain: &str,
        kver: &str,
        current: &ArtifactStore,
    ) -> Result<BTreeSet<PathBuf>> {
        let previous = match self.runs.get(chain, kver) {
            Ok(run) => run,
            Err(e) if e.is_not_found() => return Ok(BTreeSet::new()),
            Err(e) => return Err(e),
        };

        let current: BTreeSet<PathBuf> = current
            .installed()
            .map(|a| canonical_install_path(&a.path))
            .collect();
        Ok(previous
            .artifacts
            .into_iter()
            .map(|a| canonical_install_path(&a.path))
            .filter(|path| !current.contains(path))
            .collect())
    }

    /// Delete every orphaned path. Already-missing files are fine; other
    /// failures are logged and skipped. Returns the paths removed.
    pub fn prune_orphans(
        &self,
        chain: &str,
        kver: &str,
        current: &ArtifactStore,
    ) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for path in self.orphaned_paths(chain, kver, current)? {
            match fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(chain, kver, path = %path.display(), "removed orphaned file");
                    removed.push(path);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(chain, kver, path = %path.display(), error = %e, "could not remove orphaned file");
                }
            }
        }
        Ok(removed)
    }

    /// Prune orphans left by the previous run, then record `current` as the
    /// run for `chain`/`kver`.
    ///
    /// If the process dies between the two, the next run re-derives the
    /// same orphans from the still-stored previous record.
    pub fn reconcile(
        &self,
        chain: &str,
        kver: &str,
        current: &ArtifactStore,
    ) -> Result<Vec<PathBuf>> {
        let removed = self.prune_orphans(chain, kver, current)?;
        self.runs.store(chain, kver, current)?;
        Ok(removed)
    }

    /// Remove one installed artifact, through its origin step's hook when
    /// the artifact opted out of automatic removal.
    pub fn prune_artifact(&mut self, artifact: &Artifact) -> Result<()> {
        if !artifact.autoprune {
            let step = self.registry.load(artifact.origin())?;
            return match step.prune(artifact) {
                Some(result) => result,
                None => Err(Error::execution(
                    artifact.origin(),
                    format!(
                        "'{}' is not auto-pruned but the step has no prune hook",
                        artifact.path.display()
                    ),
                )),
            };
        }

        if artifact.path.is_dir() {
            return Err(Error::execution(
                artifact.origin(),
                format!(
                    "{} artifact '{}' is not a file and cannot be pruned",
                    artifact.kind(),
                    artifact.path.display()
                ),
            ));
        }
        match fs::remove_file(&artifact.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&artifact.path, e)),
        }
    }

    /// Prune every artifact of the stored run. The record itself stays.
    pub fn prune_run(&mut self, chain: &str, kver: &str) -> Result<()> {
        let run = self.runs.get(chain, kver)?;
        for artifact in &run.artifacts {
            self.prune_artifact(artifact)?;
        }
        Ok(())
    }

    /// Prune the run's files and delete its record.
    pub fn prune_kver(&mut self, chain: &str, kver: &str) -> Result<()> {
        self.prune_run(chain, kver)?;
        self.runs.delete(chain, kver)?;
        tracing::info!(chain, kver, "pruned run");
        Ok(())
    }

    /// Keep the `keep` highest kernel versions of `chain` and prune the rest.
    ///
    /// Versions are ordered as strings, highest first. Each pruned version
    /// has its files removed through [`Pruner::prune_artifact`] and its
    /// record deleted.
    ///
    /// # Arguments
    ///
    /// * `chain` - Chain whose stored runs are considered
    /// * `keep` - Number of versions to retain; `0` retains all
    ///
    /// # Returns
    ///
    /// * `Ok` with the pruned versions, highest first
    /// * `Err` on the first version that could not be pruned; versions
    ///   before it stay pruned
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// // Stored: 6.6.0, 6.6.1, 6.6.2
    /// let pruned = Pruner::new(&runs, &mut registry).apply_retention("A", 2)?;
    /// assert_eq!(pruned, vec!["6.6.0"]);
    /// ```
    pub fn apply_retention(&mut self, chain: &str, keep: usize) -> Result<Vec<String>> {
        if keep == 0 {
            return Ok(Vec::new());
        }
        let mut kvers = self.runs.kvers(chain)?;
        kvers.sort_by_key(|kver| Reverse(kver.clone()));

        let mut pruned = Vec::new();
        for kver in kvers.into_iter().skip(keep) {
            self.prune_kver(chain, &kver)?;
            pruned.push(kver);
        }
        Ok(pruned)
    }
}
