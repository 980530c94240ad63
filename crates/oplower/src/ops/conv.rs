//! Convolution lowering: conv2d, packed NCHWc conv2d and conv2d_transpose.
//!
//! All attribute validation and path selection happens before the first tensor-expression call,
//! so a rejected node leaves no half-built expressions behind.

use crate::attrs::AttrView;
use crate::backend::{Backend, LayoutRewrite, ScheduleTemplate, TensorExprLib, TensorInfo};
use crate::error::{LoweringError, LoweringResult, PrimitiveResultExt};
use crate::fusion::OpPattern;
use crate::layout::Layout4D;
use crate::registry::Registration;
use crate::target::TargetScope;

use super::names::{CONV2D, CONV2D_NCHWC, CONV2D_TRANSPOSE};
use super::{input, non_negative, run_template, usize_pair};

pub(crate) fn register<B: Backend>(registrations: &mut Vec<Registration<B>>) {
    registrations.push(Registration::compute(CONV2D, compute_conv2d::<B>));
    registrations.push(Registration::schedule(CONV2D, schedule_conv2d::<B>));
    registrations.push(Registration::alter_layout(CONV2D, alter_conv2d_layout::<B>));
    registrations.push(Registration::pattern(CONV2D, OpPattern::OutElemwiseFusable));

    registrations.push(Registration::compute(CONV2D_NCHWC, compute_conv2d_nchwc::<B>));
    registrations.push(Registration::schedule(CONV2D_NCHWC, schedule_conv2d_nchwc::<B>));
    registrations.push(Registration::pattern(CONV2D_NCHWC, OpPattern::OutElemwiseFusable));

    registrations.push(Registration::compute(
        CONV2D_TRANSPOSE,
        compute_conv2d_transpose::<B>,
    ));
    registrations.push(Registration::schedule(
        CONV2D_TRANSPOSE,
        schedule_conv2d_transpose::<B>,
    ));
    registrations.push(Registration::pattern(
        CONV2D_TRANSPOSE,
        OpPattern::OutElemwiseFusable,
    ));
}

/// Convolution primitive chosen for a conv2d node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvPath {
    Standard,
    Depthwise,
}

/// `groups == 1` is a standard convolution; `groups == in_channels == channels` is depthwise.
/// Depthwise kernels exist only for NCHW; every other grouping is rejected.
pub fn select_conv_path(
    op: &str,
    layout: Layout4D,
    groups: i64,
    channels: i64,
    in_channels: impl FnOnce() -> LoweringResult<usize>,
) -> LoweringResult<ConvPath> {
    if groups == 1 {
        return Ok(ConvPath::Standard);
    }

    let in_channels = in_channels()?;
    let depthwise = usize::try_from(groups).is_ok_and(|groups| groups == in_channels)
        && groups == channels;
    if !depthwise {
        return Err(LoweringError::UnsupportedGrouping {
            op: op.to_string(),
            groups,
            channels: Some(channels),
            in_channels: Some(in_channels),
        });
    }
    if layout != Layout4D::NCHW {
        return Err(LoweringError::unsupported_layout(op, layout.as_str()));
    }
    Ok(ConvPath::Depthwise)
}

fn parse_layout(attrs: &AttrView<'_>) -> LoweringResult<Layout4D> {
    let raw = attrs.get_str("layout")?;
    Layout4D::parse(raw).ok_or_else(|| LoweringError::unsupported_layout(attrs.op(), raw))
}

fn require_unit_dilation(attrs: &AttrView<'_>, dilation: [i64; 2]) -> LoweringResult<()> {
    if dilation != [1, 1] {
        return Err(LoweringError::invalid_attribute(
            attrs.op(),
            "dilation",
            format!("({}, {})", dilation[0], dilation[1]),
            "only (1, 1) is supported",
        ));
    }
    Ok(())
}

/// `channels` is `None` for operators that do not carry the attribute.
fn require_single_group(
    attrs: &AttrView<'_>,
    groups: i64,
    channels: Option<i64>,
) -> LoweringResult<()> {
    if groups != 1 {
        return Err(LoweringError::UnsupportedGrouping {
            op: attrs.op().to_string(),
            groups,
            channels,
            in_channels: None,
        });
    }
    Ok(())
}

fn const_dim<L: TensorExprLib>(
    op: &str,
    backend: &L,
    tensor: &L::Tensor,
    axis: usize,
) -> LoweringResult<usize> {
    backend
        .shape(tensor)
        .get(axis)
        .and_then(|dim| dim.as_const())
        .ok_or_else(|| LoweringError::NonConstantDim {
            op: op.to_string(),
            axis,
        })
}

/// Inserts two singleton axes into a 1-D bias at `axis` and adds it to `out`.
fn add_bias<L: TensorExprLib>(
    op: &str,
    backend: &L,
    out: L::Tensor,
    bias: Option<&L::Tensor>,
    axis: usize,
) -> LoweringResult<L::Tensor> {
    let Some(bias) = bias else {
        return Ok(out);
    };
    let bias = backend.expand_dims(bias, axis, 2).for_op(op)?;
    backend.broadcast_add(&out, &bias).for_op(op)
}

pub fn compute_conv2d<B: Backend>(
    attrs: &AttrView<'_>,
    inputs: &[B::Tensor],
    backend: &B,
) -> LoweringResult<B::Tensor> {
    let op = attrs.op();
    // Presence only; range checks follow the dilation check.
    attrs.get_int_pair("padding")?;
    attrs.get_int_pair("strides")?;
    let dilation = attrs.get_int_pair("dilation")?;
    let groups = attrs.get_int("groups")?;
    let channels = attrs.get_int("channels")?;
    let layout = parse_layout(attrs)?;
    let use_bias = attrs.get_bool("use_bias")?;

    let [dilation_h, dilation_w] = dilation;
    if dilation_h < 1 || dilation_w < 1 {
        return Err(LoweringError::invalid_attribute(
            op,
            "dilation",
            format!("({dilation_h}, {dilation_w})"),
            "dilation must be positive",
        ));
    }
    let padding = usize_pair(attrs, "padding", 0)?;
    let strides = usize_pair(attrs, "strides", 1)?;

    // Grouping is settled from the data input alone, ahead of the kernel and bias lookups.
    let data = input(op, inputs, 0)?;
    let path = select_conv_path(op, layout, groups, channels, || {
        const_dim(op, backend, data, layout.channel_axis())
    })?;
    let kernel = input(op, inputs, 1)?;
    let bias = if use_bias {
        Some(input(op, inputs, 2)?)
    } else {
        None
    };
    tracing::debug!(op, ?path, %layout, ?dilation, "conv2d compute dispatch");

    let dilated;
    let kernel = if dilation == [1, 1] {
        kernel
    } else {
        let strides = layout.dilation_strides(dilation_h as usize, dilation_w as usize);
        dilated = backend.dilate(kernel, &strides).for_op(op)?;
        &dilated
    };

    let out = match path {
        ConvPath::Standard => backend.conv2d(data, kernel, strides, padding, layout),
        ConvPath::Depthwise => backend.depthwise_conv2d_nchw(data, kernel, strides, padding),
    }
    .for_op(op)?;
    add_bias(op, backend, out, bias, layout.bias_expand_axis())
}

pub fn schedule_conv2d<B: Backend>(
    attrs: &AttrView<'_>,
    outs: &[B::Tensor],
    scope: &TargetScope,
    backend: &B,
) -> LoweringResult<B::Schedule> {
    let groups = attrs.get_int("groups")?;
    let layout = attrs.get_str("layout")?;
    // Mirrors compute: any grouped conv that survived compute is depthwise NCHW.
    let template = match (groups, layout) {
        (1, "NCHW") => ScheduleTemplate::Conv2dNchw,
        (1, "NHWC") => ScheduleTemplate::Conv2dNhwc,
        _ => ScheduleTemplate::DepthwiseConv2dNchw,
    };
    run_template(attrs, outs, scope, backend, &template)
}

/// Forwards to the tensor-expression library's conv2d layout rewrite.
pub fn alter_conv2d_layout<B: Backend>(
    attrs: &AttrView<'_>,
    inputs: &[B::Tensor],
    tinfos: &[TensorInfo],
    backend: &B,
) -> LoweringResult<Option<LayoutRewrite<B::Tensor>>> {
    let rewrite = backend
        .alter_conv2d_layout(attrs.bag(), inputs, tinfos)
        .for_op(attrs.op())?;
    if let Some(rewrite) = &rewrite {
        tracing::debug!(op = attrs.op(), rewritten = %rewrite.op, "conv2d layout altered");
    }
    Ok(rewrite)
}

pub fn compute_conv2d_nchwc<B: Backend>(
    attrs: &AttrView<'_>,
    inputs: &[B::Tensor],
    backend: &B,
) -> LoweringResult<B::Tensor> {
    let op = attrs.op();
    let padding = usize_pair(attrs, "padding", 0)?;
    let strides = usize_pair(attrs, "strides", 1)?;
    let dilation = attrs.get_int_pair("dilation")?;
    let kernel_size = usize_pair(attrs, "kernel_size", 1)?;
    let groups = attrs.get_int("groups")?;
    let channels = attrs.get_int("channels")?;
    let use_bias = attrs.get_bool("use_bias")?;

    require_unit_dilation(attrs, dilation)?;
    require_single_group(attrs, groups, Some(channels))?;
    let channels = non_negative(attrs, "channels", channels)?;

    let data = input(op, inputs, 0)?;
    let kernel = input(op, inputs, 1)?;
    let bias = if use_bias {
        Some(input(op, inputs, 2)?)
    } else {
        None
    };

    let out = backend
        .conv2d_nchwc(data, kernel, channels, kernel_size, strides, padding)
        .for_op(op)?;
    add_bias(op, backend, out, bias, 1)
}

pub fn schedule_conv2d_nchwc<B: Backend>(
    attrs: &AttrView<'_>,
    outs: &[B::Tensor],
    scope: &TargetScope,
    backend: &B,
) -> LoweringResult<B::Schedule> {
    let groups = attrs.get_int("groups")?;
    let channels = attrs.get_int("channels")?;
    require_single_group(attrs, groups, Some(channels))?;

    let kernel_size = usize_pair(attrs, "kernel_size", 1)?;
    let padding = usize_pair(attrs, "padding", 0)?;
    let strides = usize_pair(attrs, "strides", 1)?;
    let template = ScheduleTemplate::Conv2dNchwc {
        channels: non_negative(attrs, "channels", channels)?,
        kernel_size,
        strides,
        padding,
    };
    run_template(attrs, outs, scope, backend, &template)
}

pub fn compute_conv2d_transpose<B: Backend>(
    attrs: &AttrView<'_>,
    inputs: &[B::Tensor],
    backend: &B,
) -> LoweringResult<B::Tensor> {
    let op = attrs.op();
    let padding = usize_pair(attrs, "padding", 0)?;
    let strides = usize_pair(attrs, "strides", 1)?;
    let dilation = attrs.get_int_pair("dilation")?;
    let groups = attrs.get_int("groups")?;
    let layout = attrs.get_str("layout")?;
    let use_bias = attrs.get_bool("use_bias")?;
    let output_padding = usize_pair(attrs, "output_padding", 0)?;

    if layout != Layout4D::NCHW.as_str() {
        return Err(LoweringError::unsupported_layout(op, layout));
    }
    require_unit_dilation(attrs, dilation)?;
    require_single_group(attrs, groups, None)?;

    let data = input(op, inputs, 0)?;
    let kernel = input(op, inputs, 1)?;
    let bias = if use_bias {
        Some(input(op, inputs, 2)?)
    } else {
        None
    };

    let out = backend
        .conv2d_transpose_nchw(data, kernel, strides, padding)
        .for_op(op)?;
    let out = add_bias(op, backend, out, bias, 1)?;
    // Output padding only grows the trailing edge of the spatial axes.
    let [pad_h, pad_w] = output_padding;
    backend.pad(&out, &[0, 0, 0, 0], &[0, 0, pad_h, pad_w]).for_op(op)
}

pub fn schedule_conv2d_transpose<B: Backend>(
    attrs: &AttrView<'_>,
    outs: &[B::Tensor],
    scope: &TargetScope,
    backend: &B,
) -> LoweringResult<B::Schedule> {
    run_template(
        attrs,
        outs,
        scope,
        backend,
        &ScheduleTemplate::Conv2dTransposeNchw,
    )
}
