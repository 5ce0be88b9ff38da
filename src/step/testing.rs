//! Closure-backed steps for unit tests.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use crate::artifact::Artifact;
use crate::error::Result;
use crate::step::{Step, StepContext, StepDescriptor, StepOutput};

type ExecFn = Box<dyn Fn(&mut StepContext<'_>) -> Result<StepOutput>>;
type PruneFn = Box<dyn Fn(&Artifact) -> Result<()>>;

pub(crate) struct FnStep {
    descriptor: StepDescriptor,
    exec: ExecFn,
    prune: Option<PruneFn>,
}

impl FnStep {
    pub(crate) fn new(
        descriptor: StepDescriptor,
        exec: impl Fn(&mut StepContext<'_>) -> Result<StepOutput> + 'static,
    ) -> Self {
        Self {
            descriptor,
            exec: Box::new(exec),
            prune: None,
        }
    }

    pub(crate) fn noop(name: &str) -> Self {
        Self::new(StepDescriptor::new(name), |_| Ok(StepOutput::Nothing))
    }

    pub(crate) fn with_prune(mut self, hook: impl Fn(&Artifact) -> Result<()> + 'static) -> Self {
        self.prune = Some(Box::new(hook));
        self
    }

    pub(crate) fn arc(self) -> Arc<dyn Step> {
        Arc::new(self)
    }
}

impl Step for FnStep {
    fn descriptor(&self) -> &StepDescriptor {
        &self.descriptor
    }

    fn execute(&self, ctx: &mut StepContext<'_>) -> Result<StepOutput> {
        (self.exec)(ctx)
    }

    fn prune(&self, artifact: &Artifact) -> Option<Result<()>> {
        self.prune.as_ref().map(|hook| hook(artifact))
    }
}

/// Shared invocation counter for asserting whether a step body ran.
#[derive(Clone, Default)]
pub(crate) struct Calls(Rc<Cell<usize>>);

impl Calls {
    pub(crate) fn hit(&self) {
        self.0.set(self.0.get() + 1);
    }

    pub(crate) fn count(&self) -> usize {
        self.0.get()
    }
}
