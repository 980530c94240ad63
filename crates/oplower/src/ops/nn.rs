//! Activations, softmax, dense, pooling and shape operators.
//!
//! Apart from `dense`, none of these register a compute slot: the IR builds their elementwise
//! or structural expressions itself and only asks the registry for a schedule and a pattern.

use crate::attrs::AttrView;
use crate::backend::{Backend, ScheduleTemplate};
use crate::error::{LoweringResult, PrimitiveResultExt};
use crate::fusion::OpPattern;
use crate::registry::Registration;

use super::names::*;
use super::{input, push_fixed};

pub(crate) fn register<B: Backend>(registrations: &mut Vec<Registration<B>>) {
    push_fixed(registrations, RELU, ScheduleTemplate::Broadcast, OpPattern::Elemwise);
    push_fixed(registrations, LEAKY_RELU, ScheduleTemplate::Broadcast, OpPattern::Elemwise);
    push_fixed(registrations, PRELU, ScheduleTemplate::Broadcast, OpPattern::Broadcast);
    push_fixed(registrations, FLATTEN, ScheduleTemplate::Broadcast, OpPattern::Injective);
    push_fixed(registrations, PAD, ScheduleTemplate::Broadcast, OpPattern::Injective);
    push_fixed(
        registrations,
        LAYOUT_TRANSFORM,
        ScheduleTemplate::Injective,
        OpPattern::Injective,
    );

    // Softmax is never fused, whatever the consumer.
    push_fixed(registrations, SOFTMAX, ScheduleTemplate::Softmax, OpPattern::Opaque);
    push_fixed(registrations, LOG_SOFTMAX, ScheduleTemplate::Softmax, OpPattern::Opaque);

    registrations.push(Registration::compute(DENSE, compute_dense::<B>));
    push_fixed(
        registrations,
        DENSE,
        ScheduleTemplate::Dense,
        OpPattern::OutElemwiseFusable,
    );

    for pool in [MAX_POOL2D, AVG_POOL2D] {
        push_fixed(
            registrations,
            pool,
            ScheduleTemplate::Pool,
            OpPattern::OutElemwiseFusable,
        );
    }
    for pool in [GLOBAL_MAX_POOL2D, GLOBAL_AVG_POOL2D] {
        push_fixed(
            registrations,
            pool,
            ScheduleTemplate::GlobalPool,
            OpPattern::OutElemwiseFusable,
        );
    }

    push_fixed(
        registrations,
        UPSAMPLING,
        ScheduleTemplate::Injective,
        OpPattern::Injective,
    );
}

/// `dense(data, weight[, bias])`; the bias input is consumed only when `use_bias` is set.
pub fn compute_dense<B: Backend>(
    attrs: &AttrView<'_>,
    inputs: &[B::Tensor],
    backend: &B,
) -> LoweringResult<B::Tensor> {
    let op = attrs.op();
    let use_bias = attrs.get_bool("use_bias")?;
    let data = input(op, inputs, 0)?;
    let weight = input(op, inputs, 1)?;
    let bias = if use_bias {
        Some(input(op, inputs, 2)?)
    } else {
        None
    };
    backend.dense(data, weight, bias).for_op(op)
}
