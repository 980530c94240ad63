//! Operator registry and lowering dispatch for a neural-network graph compiler.
//!
//! Each graph operator owns up to four registry slots: a compute rule that builds its output
//! expression, a schedule rule that picks a target-specific schedule template, an optional
//! layout-alteration hook, and a fusion pattern. [`Lowerer`] dispatches graph nodes through a
//! frozen [`OpRegistry`] onto a [`Backend`].

pub mod attrs;
pub mod backend;
pub mod config;
mod env;
pub mod error;
pub mod fusion;
pub mod layout;
pub mod lower;
pub mod ops;
pub mod registry;
pub mod target;

pub use attrs::{AttrBag, AttrValue, AttrView};
pub use backend::{
    Backend, Dim, LayoutRewrite, ScheduleLib, ScheduleTemplate, TensorExprLib, TensorInfo,
};
pub use config::LoweringOverrides;
pub use error::{ErrorKind, LoweringError, LoweringResult};
pub use fusion::{can_fuse, FusionRejectReason, OpPattern};
pub use layout::Layout4D;
pub use lower::{ComputeOutcome, LoweredNode, Lowerer};
pub use registry::{OpRegistry, Registration, RegistryBuilder, RegistryEntry, Slot};
pub use target::{Target, TargetScope};
