//! Operator registry.
//!
//! Registration happens once, on a plain owned [`RegistryBuilder`]; [`RegistryBuilder::freeze`]
//! turns it into an immutable [`OpRegistry`] that compilation threads query concurrently. Each
//! operator owns up to four slots (compute, schedule, alter-layout, pattern). Registering a slot
//! creates the entry if needed and overwrites only that slot, so the last registration wins and
//! the order of registrations across different slots does not matter.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::attrs::AttrView;
use crate::backend::{Backend, LayoutRewrite, TensorInfo};
use crate::config::LoweringOverrides;
use crate::error::{LoweringError, LoweringResult};
use crate::fusion::OpPattern;
use crate::target::TargetScope;

type Tensor<B> = <B as crate::backend::TensorExprLib>::Tensor;
type Schedule<B> = <B as crate::backend::ScheduleLib>::Schedule;

/// Builds the output expression of an operator from its attributes and ordered inputs.
pub type ComputeFn<B> =
    Arc<dyn Fn(&AttrView<'_>, &[Tensor<B>], &B) -> LoweringResult<Tensor<B>> + Send + Sync>;

/// Picks and invokes a schedule template for the operator's outputs under an active target.
pub type ScheduleFn<B> = Arc<
    dyn Fn(&AttrView<'_>, &[Tensor<B>], &TargetScope, &B) -> LoweringResult<Schedule<B>>
        + Send
        + Sync,
>;

/// Proposes a layout-specialised replacement node during layout optimisation.
pub type AlterLayoutFn<B> = Arc<
    dyn Fn(
            &AttrView<'_>,
            &[Tensor<B>],
            &[TensorInfo],
            &B,
        ) -> LoweringResult<Option<LayoutRewrite<Tensor<B>>>>
        + Send
        + Sync,
>;

/// Registry slot targeted by a [`Registration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Compute,
    Schedule,
    AlterLayout,
    Pattern,
}

impl Slot {
    pub fn as_str(self) -> &'static str {
        match self {
            Slot::Compute => "compute",
            Slot::Schedule => "schedule",
            Slot::AlterLayout => "alter_layout",
            Slot::Pattern => "pattern",
        }
    }
}

/// One `(operator, slot, value)` registration.
pub enum Registration<B: Backend> {
    Compute(String, ComputeFn<B>),
    Schedule(String, ScheduleFn<B>),
    AlterLayout(String, AlterLayoutFn<B>),
    Pattern(String, OpPattern),
}

impl<B: Backend> Registration<B> {
    pub fn compute<F>(name: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&AttrView<'_>, &[Tensor<B>], &B) -> LoweringResult<Tensor<B>> + Send + Sync + 'static,
    {
        Registration::Compute(name.into(), Arc::new(compute))
    }

    pub fn schedule<F>(name: impl Into<String>, schedule: F) -> Self
    where
        F: Fn(&AttrView<'_>, &[Tensor<B>], &TargetScope, &B) -> LoweringResult<Schedule<B>>
            + Send
            + Sync
            + 'static,
    {
        Registration::Schedule(name.into(), Arc::new(schedule))
    }

    pub fn alter_layout<F>(name: impl Into<String>, alter: F) -> Self
    where
        F: Fn(
                &AttrView<'_>,
                &[Tensor<B>],
                &[TensorInfo],
                &B,
            ) -> LoweringResult<Option<LayoutRewrite<Tensor<B>>>>
            + Send
            + Sync
            + 'static,
    {
        Registration::AlterLayout(name.into(), Arc::new(alter))
    }

    pub fn pattern(name: impl Into<String>, pattern: OpPattern) -> Self {
        Registration::Pattern(name.into(), pattern)
    }

    pub fn name(&self) -> &str {
        match self {
            Registration::Compute(name, _)
            | Registration::Schedule(name, _)
            | Registration::AlterLayout(name, _)
            | Registration::Pattern(name, _) => name,
        }
    }

    pub fn slot(&self) -> Slot {
        match self {
            Registration::Compute(..) => Slot::Compute,
            Registration::Schedule(..) => Slot::Schedule,
            Registration::AlterLayout(..) => Slot::AlterLayout,
            Registration::Pattern(..) => Slot::Pattern,
        }
    }
}

/// Capabilities registered for one operator.
pub struct RegistryEntry<B: Backend> {
    name: String,
    compute: Option<ComputeFn<B>>,
    schedule: Option<ScheduleFn<B>>,
    alter_layout: Option<AlterLayoutFn<B>>,
    pattern: Option<OpPattern>,
}

impl<B: Backend> RegistryEntry<B> {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            compute: None,
            schedule: None,
            alter_layout: None,
            pattern: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compute(&self) -> Option<&ComputeFn<B>> {
        self.compute.as_ref()
    }

    pub fn schedule(&self) -> Option<&ScheduleFn<B>> {
        self.schedule.as_ref()
    }

    pub fn alter_layout(&self) -> Option<&AlterLayoutFn<B>> {
        self.alter_layout.as_ref()
    }

    /// Pattern as registered, if any.
    pub fn registered_pattern(&self) -> Option<OpPattern> {
        self.pattern
    }

    /// Pattern seen by the fusion pass; operators without one are fusion boundaries.
    pub fn pattern(&self) -> OpPattern {
        self.pattern.unwrap_or(OpPattern::Opaque)
    }

    pub fn has_slot(&self, slot: Slot) -> bool {
        match slot {
            Slot::Compute => self.compute.is_some(),
            Slot::Schedule => self.schedule.is_some(),
            Slot::AlterLayout => self.alter_layout.is_some(),
            Slot::Pattern => self.pattern.is_some(),
        }
    }
}

impl<B: Backend> fmt::Debug for RegistryEntry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .field("compute", &self.compute.is_some())
            .field("schedule", &self.schedule.is_some())
            .field("alter_layout", &self.alter_layout.is_some())
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Mutable registration-phase view of the registry.
pub struct RegistryBuilder<B: Backend> {
    entries: HashMap<String, RegistryEntry<B>>,
}

impl<B: Backend> RegistryBuilder<B> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn register_compute<F>(&mut self, name: &str, compute: F) -> &mut Self
    where
        F: Fn(&AttrView<'_>, &[Tensor<B>], &B) -> LoweringResult<Tensor<B>> + Send + Sync + 'static,
    {
        self.register(Registration::compute(name, compute))
    }

    pub fn register_schedule<F>(&mut self, name: &str, schedule: F) -> &mut Self
    where
        F: Fn(&AttrView<'_>, &[Tensor<B>], &TargetScope, &B) -> LoweringResult<Schedule<B>>
            + Send
            + Sync
            + 'static,
    {
        self.register(Registration::schedule(name, schedule))
    }

    pub fn register_alter_layout<F>(&mut self, name: &str, alter: F) -> &mut Self
    where
        F: Fn(
                &AttrView<'_>,
                &[Tensor<B>],
                &[TensorInfo],
                &B,
            ) -> LoweringResult<Option<LayoutRewrite<Tensor<B>>>>
            + Send
            + Sync
            + 'static,
    {
        self.register(Registration::alter_layout(name, alter))
    }

    pub fn register_pattern(&mut self, name: &str, pattern: OpPattern) -> &mut Self {
        self.register(Registration::pattern(name, pattern))
    }

    /// Applies a single registration, replacing only the slot it targets.
    pub fn register(&mut self, registration: Registration<B>) -> &mut Self {
        let slot = registration.slot();
        let name = registration.name().to_string();
        let entry = self
            .entries
            .entry(name)
            .or_insert_with_key(|name| RegistryEntry::new(name));
        if entry.has_slot(slot) {
            tracing::debug!(op = %entry.name, slot = slot.as_str(), "replacing registered slot");
        }

        match registration {
            Registration::Compute(_, compute) => entry.compute = Some(compute),
            Registration::Schedule(_, schedule) => entry.schedule = Some(schedule),
            Registration::AlterLayout(_, alter) => entry.alter_layout = Some(alter),
            Registration::Pattern(_, pattern) => entry.pattern = Some(pattern),
        }
        self
    }

    /// Applies registrations in iteration order.
    pub fn extend<I>(&mut self, registrations: I) -> &mut Self
    where
        I: IntoIterator<Item = Registration<B>>,
    {
        for registration in registrations {
            self.register(registration);
        }
        self
    }

    /// Re-registers configured fusion patterns on top of what is already present.
    pub fn apply_overrides(&mut self, overrides: &LoweringOverrides) -> &mut Self {
        for (name, pattern) in overrides.patterns() {
            self.register_pattern(name, pattern);
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Ends the registration phase.
    pub fn freeze(self) -> OpRegistry<B> {
        tracing::debug!(operators = self.entries.len(), "operator registry frozen");
        OpRegistry {
            entries: self.entries,
        }
    }
}

impl<B: Backend> Default for RegistryBuilder<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable operator registry shared by compilation passes.
pub struct OpRegistry<B: Backend> {
    entries: HashMap<String, RegistryEntry<B>>,
}

impl<B: Backend> OpRegistry<B> {
    pub fn builder() -> RegistryBuilder<B> {
        RegistryBuilder::new()
    }

    /// Registry holding the built-in neural-network operator table.
    pub fn with_nn_ops() -> Self {
        let mut builder = RegistryBuilder::new();
        builder.extend(crate::ops::nn_registrations::<B>());
        builder.freeze()
    }

    /// Built-in table with configured pattern overrides applied last.
    pub fn with_nn_ops_and_overrides(overrides: &LoweringOverrides) -> Self {
        let mut builder = RegistryBuilder::new();
        builder
            .extend(crate::ops::nn_registrations::<B>())
            .apply_overrides(overrides);
        builder.freeze()
    }

    pub fn lookup(&self, name: &str) -> LoweringResult<&RegistryEntry<B>> {
        tracing::trace!(op = name, "registry lookup");
        self.entries
            .get(name)
            .ok_or_else(|| LoweringError::unknown_operator(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered operator names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<B: Backend> fmt::Debug for OpRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRegistry")
            .field("operators", &self.names())
            .finish()
    }
}
