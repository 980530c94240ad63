//! Built-in neural-network operator table.
//!
//! [`nn_registrations`] enumerates every `(operator, slot, value)` triple the compiler ships with;
//! [`crate::registry::OpRegistry::with_nn_ops`] folds it into a frozen registry.

pub mod conv;
pub mod nn;
pub mod norm;

use crate::attrs::AttrView;
use crate::backend::{Backend, ScheduleTemplate};
use crate::error::{LoweringError, LoweringResult, PrimitiveResultExt};
use crate::fusion::OpPattern;
use crate::registry::Registration;
use crate::target::TargetScope;

/// Operator names of the built-in table.
pub mod names {
    pub const RELU: &str = "relu";
    pub const LEAKY_RELU: &str = "leaky_relu";
    pub const PRELU: &str = "prelu";
    pub const FLATTEN: &str = "flatten";
    pub const PAD: &str = "pad";
    pub const LAYOUT_TRANSFORM: &str = "__layout_transform__";
    pub const SOFTMAX: &str = "softmax";
    pub const LOG_SOFTMAX: &str = "log_softmax";
    pub const DENSE: &str = "dense";
    pub const CONV2D: &str = "conv2d";
    pub const CONV2D_NCHWC: &str = "_contrib_conv2d_NCHWc";
    pub const CONV2D_TRANSPOSE: &str = "conv2d_transpose";
    pub const MAX_POOL2D: &str = "max_pool2d";
    pub const AVG_POOL2D: &str = "avg_pool2d";
    pub const GLOBAL_MAX_POOL2D: &str = "global_max_pool2d";
    pub const GLOBAL_AVG_POOL2D: &str = "global_avg_pool2d";
    pub const UPSAMPLING: &str = "upsampling";
    pub const LRN: &str = "lrn";
    pub const L2_NORMALIZE: &str = "l2_normalize";
}

/// The built-in registration list, in registration order.
pub fn nn_registrations<B: Backend>() -> Vec<Registration<B>> {
    let mut registrations = Vec::new();
    nn::register(&mut registrations);
    conv::register(&mut registrations);
    norm::register(&mut registrations);
    registrations
}

/// Registers a schedule that always uses `template`, plus the operator's fusion pattern.
pub(crate) fn push_fixed<B: Backend>(
    registrations: &mut Vec<Registration<B>>,
    name: &str,
    template: ScheduleTemplate,
    pattern: OpPattern,
) {
    registrations.push(Registration::schedule(name, fixed_schedule::<B>(template)));
    registrations.push(Registration::pattern(name, pattern));
}

pub(crate) fn fixed_schedule<B: Backend>(
    template: ScheduleTemplate,
) -> impl Fn(&AttrView<'_>, &[B::Tensor], &TargetScope, &B) -> LoweringResult<B::Schedule>
       + Send
       + Sync
       + 'static {
    move |attrs, outs, scope, backend| run_template(attrs, outs, scope, backend, &template)
}

pub(crate) fn run_template<B: Backend>(
    attrs: &AttrView<'_>,
    outs: &[B::Tensor],
    scope: &TargetScope,
    backend: &B,
    template: &ScheduleTemplate,
) -> LoweringResult<B::Schedule> {
    tracing::debug!(
        op = attrs.op(),
        template = template.name(),
        active = %scope.target(),
        "schedule dispatch"
    );
    backend.schedule(scope, template, outs).for_op(attrs.op())
}

/// Positional input `index`, or [`LoweringError::MissingInput`].
pub(crate) fn input<'a, T>(op: &str, inputs: &'a [T], index: usize) -> LoweringResult<&'a T> {
    inputs.get(index).ok_or_else(|| LoweringError::MissingInput {
        op: op.to_string(),
        index,
    })
}

/// Reads an int pair whose components must be at least `min`.
pub(crate) fn usize_pair(attrs: &AttrView<'_>, key: &str, min: i64) -> LoweringResult<[usize; 2]> {
    let pair = attrs.get_int_pair(key)?;
    if pair.iter().any(|&value| value < min) {
        return Err(LoweringError::invalid_attribute(
            attrs.op(),
            key,
            format!("({}, {})", pair[0], pair[1]),
            format!("components must be >= {min}"),
        ));
    }
    Ok([pair[0] as usize, pair[1] as usize])
}

pub(crate) fn non_negative(attrs: &AttrView<'_>, key: &str, value: i64) -> LoweringResult<usize> {
    usize::try_from(value).map_err(|_| {
        LoweringError::invalid_attribute(attrs.op(), key, value.to_string(), "must be >= 0")
    })
}
