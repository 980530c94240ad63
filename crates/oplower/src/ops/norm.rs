//! Local response normalisation and L2 normalisation.

use crate::attrs::AttrView;
use crate::backend::{Backend, ScheduleTemplate};
use crate::error::{LoweringResult, PrimitiveResultExt};
use crate::fusion::OpPattern;
use crate::registry::Registration;

use super::names::{L2_NORMALIZE, LRN};
use super::{input, push_fixed};

pub(crate) fn register<B: Backend>(registrations: &mut Vec<Registration<B>>) {
    registrations.push(Registration::compute(LRN, compute_lrn::<B>));
    push_fixed(registrations, LRN, ScheduleTemplate::Lrn, OpPattern::Opaque);

    registrations.push(Registration::compute(L2_NORMALIZE, compute_l2_normalize::<B>));
    push_fixed(
        registrations,
        L2_NORMALIZE,
        ScheduleTemplate::L2Normalize,
        OpPattern::OutElemwiseFusable,
    );
}

pub fn compute_lrn<B: Backend>(
    attrs: &AttrView<'_>,
    inputs: &[B::Tensor],
    backend: &B,
) -> LoweringResult<B::Tensor> {
    let op = attrs.op();
    let size = attrs.get_int("size")?;
    let axis = attrs.get_int("axis")?;
    let alpha = attrs.get_float("alpha")?;
    let beta = attrs.get_float("beta")?;
    let bias = attrs.get_float("bias")?;
    let data = input(op, inputs, 0)?;
    backend
        .lrn(data, size, axis, alpha, beta, bias)
        .for_op(op)
}

pub fn compute_l2_normalize<B: Backend>(
    attrs: &AttrView<'_>,
    inputs: &[B::Tensor],
    backend: &B,
) -> LoweringResult<B::Tensor> {
    let op = attrs.op();
    let eps = attrs.get_float("eps")?;
    let axis = attrs.get_int_tuple("axis")?;
    let data = input(op, inputs, 0)?;
    backend.l2_normalize(data, eps, &axis).for_op(op)
}
