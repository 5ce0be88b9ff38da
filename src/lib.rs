//! Build, install and prune a kernel's boot artifacts through configurable
//! chains of steps.
//!
//! A *chain* is an ordered list of steps ("links") run for one kernel
//! version. Steps exchange typed [`Artifact`]s through a shared
//! [`ArtifactStore`]: a kernel step produces a kernel image, an initrd step
//! an initrd, a signing step a signed copy of whatever signable image came
//! last, and a layout step installs the results into `/boot` or the ESP.
//! After a completed run the installed artifacts are recorded per
//! (chain, kernel version) so the next run can remove what it no longer
//! produces.
//!
//! # Architecture
//!
//! ```text
//! config ──► Config { chains }            (sanitized against step options)
//!              │
//! registry ──► Arc<dyn Step>              (manifests in search dirs, then built-ins)
//!              │
//! chain ─────► Chain::run(until)          (scratch tree, latest-wins inputs)
//!              │
//! prune ─────► Pruner::reconcile          (orphans removed, then run stored)
//!              │
//! run_store ─► runs/<chain>.json          (fs2-locked, atomic replace)
//! ```

pub mod artifact;
pub mod chain;
pub mod config;
pub mod error;
pub mod os_release;
pub mod preflight;
pub mod process;
pub mod prune;
pub mod registry;
pub mod run_store;
pub mod step;
pub mod steps;

pub use artifact::{Artifact, ArtifactKind, ArtifactStore, KindQuery};
pub use chain::{run_chains, Chain, ChainReport, HostEnv, RunOutcome, PREPARE_SENTINEL};
pub use config::{ChainConfig, Config, SettingValue};
pub use error::{Error, Result};
pub use prune::Pruner;
pub use registry::Registry;
pub use run_store::{PersistedRun, RunStore};
pub use step::{CopyOptions, Step, StepContext, StepDescriptor, StepOutput};
