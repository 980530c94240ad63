//! Lowering driver.
//!
//! [`Lowerer`] pairs a frozen [`OpRegistry`] with a backend and is what the graph compiler calls
//! for each node. Both are borrowed, so one registry serves any number of compiling threads.

use std::fmt;

use crate::attrs::AttrBag;
use crate::backend::{Backend, LayoutRewrite, TensorInfo};
use crate::error::{LoweringError, LoweringResult};
use crate::fusion::OpPattern;
use crate::registry::OpRegistry;
use crate::target::{Target, TargetScope};

type Tensor<B> = <B as crate::backend::TensorExprLib>::Tensor;
type Schedule<B> = <B as crate::backend::ScheduleLib>::Schedule;

/// Result of compute lowering for one node.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeOutcome<T> {
    Computed(T),
    /// No compute rule is registered; the IR builds the expression itself.
    Deferred,
}

impl<T> ComputeOutcome<T> {
    pub fn is_deferred(&self) -> bool {
        matches!(self, ComputeOutcome::Deferred)
    }

    pub fn computed(self) -> Option<T> {
        match self {
            ComputeOutcome::Computed(tensor) => Some(tensor),
            ComputeOutcome::Deferred => None,
        }
    }
}

/// Everything [`Lowerer::lower`] produces for a node.
pub struct LoweredNode<B: Backend> {
    pub output: ComputeOutcome<Tensor<B>>,
    /// Present when the node was computed here and its operator has a schedule rule.
    pub schedule: Option<Schedule<B>>,
    pub pattern: OpPattern,
}

impl<B: Backend> fmt::Debug for LoweredNode<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoweredNode")
            .field("output", &self.output)
            .field("schedule", &self.schedule)
            .field("pattern", &self.pattern)
            .finish()
    }
}

pub struct Lowerer<'a, B: Backend> {
    registry: &'a OpRegistry<B>,
    backend: &'a B,
}

impl<'a, B: Backend> Clone for Lowerer<'a, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, B: Backend> Copy for Lowerer<'a, B> {}

impl<'a, B: Backend> Lowerer<'a, B> {
    pub fn new(registry: &'a OpRegistry<B>, backend: &'a B) -> Self {
        Self { registry, backend }
    }

    pub fn registry(&self) -> &'a OpRegistry<B> {
        self.registry
    }

    pub fn backend(&self) -> &'a B {
        self.backend
    }

    /// Builds the output expression for `op`, or reports [`ComputeOutcome::Deferred`].
    pub fn compute(
        &self,
        op: &str,
        attrs: &AttrBag,
        inputs: &[Tensor<B>],
    ) -> LoweringResult<ComputeOutcome<Tensor<B>>> {
        let entry = self.registry.lookup(op)?;
        let Some(compute) = entry.compute() else {
            tracing::trace!(op, "no compute rule, deferring to the IR");
            return Ok(ComputeOutcome::Deferred);
        };
        let output = compute(&attrs.view(entry.name()), inputs, self.backend)?;
        Ok(ComputeOutcome::Computed(output))
    }

    /// Schedules `outs` for `target`. The target is active for exactly the duration of the call.
    pub fn schedule(
        &self,
        op: &str,
        attrs: &AttrBag,
        outs: &[Tensor<B>],
        target: &str,
    ) -> LoweringResult<Schedule<B>> {
        let entry = self.registry.lookup(op)?;
        let schedule = entry.schedule().ok_or_else(|| LoweringError::MissingSchedule {
            op: op.to_string(),
        })?;
        let scope = TargetScope::enter(Target::parse(target)?);
        schedule(&attrs.view(entry.name()), outs, &scope, self.backend)
    }

    /// Proposes a layout rewrite; operators without a hook stay unchanged.
    pub fn alter_layout(
        &self,
        op: &str,
        attrs: &AttrBag,
        inputs: &[Tensor<B>],
        tinfos: &[TensorInfo],
    ) -> LoweringResult<Option<LayoutRewrite<Tensor<B>>>> {
        let entry = self.registry.lookup(op)?;
        match entry.alter_layout() {
            Some(alter) => alter(&attrs.view(entry.name()), inputs, tinfos, self.backend),
            None => Ok(None),
        }
    }

    pub fn pattern(&self, op: &str) -> LoweringResult<OpPattern> {
        let pattern = self.registry.lookup(op)?.pattern();
        if crate::env::fusion_disabled() {
            return Ok(OpPattern::Opaque);
        }
        Ok(pattern)
    }

    /// Compute, then schedule the computed output for `target`, then classify.
    pub fn lower(
        &self,
        op: &str,
        attrs: &AttrBag,
        inputs: &[Tensor<B>],
        target: &str,
    ) -> LoweringResult<LoweredNode<B>> {
        let entry = self.registry.lookup(op)?;
        let output = self.compute(op, attrs, inputs)?;
        let schedule = match (&output, entry.schedule()) {
            (ComputeOutcome::Computed(out), Some(_)) => Some(self.schedule(
                op,
                attrs,
                std::slice::from_ref(out),
                target,
            )?),
            _ => None,
        };
        Ok(LoweredNode {
            output,
            schedule,
            pattern: self.pattern(op)?,
        })
    }
}
