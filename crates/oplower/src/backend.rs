//! Contracts for the external tensor-expression library and target-aware scheduler.
//!
//! Lowering policies never build loop nests or schedules themselves; they pick which primitive
//! or template to invoke and with which arguments. Implementations of these traits supply the
//! actual expression graph and scheduling machinery.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::attrs::AttrBag;
use crate::layout::Layout4D;
use crate::target::TargetScope;

/// One dimension of a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Const(usize),
    Symbolic(String),
}

impl Dim {
    pub fn as_const(&self) -> Option<usize> {
        match self {
            Dim::Const(value) => Some(*value),
            Dim::Symbolic(_) => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Const(value) => write!(f, "{value}"),
            Dim::Symbolic(name) => write!(f, "?{name}"),
        }
    }
}

impl From<usize> for Dim {
    fn from(value: usize) -> Self {
        Dim::Const(value)
    }
}

/// Shape and element type observed for an operator input during layout optimisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub shape: Vec<Dim>,
    pub dtype: String,
}

impl TensorInfo {
    pub fn new(shape: impl IntoIterator<Item = usize>, dtype: impl Into<String>) -> Self {
        Self {
            shape: shape.into_iter().map(Dim::Const).collect(),
            dtype: dtype.into(),
        }
    }
}

/// Replacement operator proposed by a layout-alteration hook.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutRewrite<T> {
    pub op: String,
    pub attrs: AttrBag,
    pub inputs: Vec<T>,
}

/// Tensor-expression primitives consumed by compute lowering.
pub trait TensorExprLib: Send + Sync {
    type Tensor: Clone + fmt::Debug + Send + Sync + 'static;

    fn shape(&self, tensor: &Self::Tensor) -> Vec<Dim>;

    fn dense(
        &self,
        data: &Self::Tensor,
        weight: &Self::Tensor,
        bias: Option<&Self::Tensor>,
    ) -> Result<Self::Tensor>;

    /// Inserts `strides[i] - 1` zeros between neighbouring elements along axis `i`.
    fn dilate(&self, tensor: &Self::Tensor, strides: &[usize]) -> Result<Self::Tensor>;

    fn conv2d(
        &self,
        data: &Self::Tensor,
        kernel: &Self::Tensor,
        strides: [usize; 2],
        padding: [usize; 2],
        layout: Layout4D,
    ) -> Result<Self::Tensor>;

    fn depthwise_conv2d_nchw(
        &self,
        data: &Self::Tensor,
        kernel: &Self::Tensor,
        strides: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self::Tensor>;

    /// Channel-blocked convolution over packed `NCHW[x]c` data.
    fn conv2d_nchwc(
        &self,
        data: &Self::Tensor,
        kernel: &Self::Tensor,
        channels: usize,
        kernel_size: [usize; 2],
        strides: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self::Tensor>;

    fn conv2d_transpose_nchw(
        &self,
        data: &Self::Tensor,
        kernel: &Self::Tensor,
        strides: [usize; 2],
        padding: [usize; 2],
    ) -> Result<Self::Tensor>;

    fn expand_dims(
        &self,
        tensor: &Self::Tensor,
        axis: usize,
        num_newaxis: usize,
    ) -> Result<Self::Tensor>;

    fn broadcast_add(&self, lhs: &Self::Tensor, rhs: &Self::Tensor) -> Result<Self::Tensor>;

    /// Zero-pads each axis by `before[i]` leading and `after[i]` trailing elements.
    fn pad(&self, tensor: &Self::Tensor, before: &[usize], after: &[usize])
        -> Result<Self::Tensor>;

    fn lrn(
        &self,
        data: &Self::Tensor,
        size: i64,
        axis: i64,
        alpha: f64,
        beta: f64,
        bias: f64,
    ) -> Result<Self::Tensor>;

    fn l2_normalize(&self, data: &Self::Tensor, eps: f64, axis: &[i64]) -> Result<Self::Tensor>;

    /// Proposes a layout-specialised replacement for a conv2d node, or `None` to keep it.
    fn alter_conv2d_layout(
        &self,
        attrs: &AttrBag,
        inputs: &[Self::Tensor],
        tinfos: &[TensorInfo],
    ) -> Result<Option<LayoutRewrite<Self::Tensor>>>;
}

/// Named schedule templates understood by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScheduleTemplate {
    Softmax,
    Dense,
    Conv2dNchw,
    Conv2dNhwc,
    DepthwiseConv2dNchw,
    Conv2dNchwc {
        channels: usize,
        kernel_size: [usize; 2],
        strides: [usize; 2],
        padding: [usize; 2],
    },
    Conv2dTransposeNchw,
    Pool,
    GlobalPool,
    Injective,
    Lrn,
    L2Normalize,
    Broadcast,
}

impl ScheduleTemplate {
    pub fn name(&self) -> &'static str {
        match self {
            ScheduleTemplate::Softmax => "schedule_softmax",
            ScheduleTemplate::Dense => "schedule_dense",
            ScheduleTemplate::Conv2dNchw => "schedule_conv2d_nchw",
            ScheduleTemplate::Conv2dNhwc => "schedule_conv2d_nhwc",
            ScheduleTemplate::DepthwiseConv2dNchw => "schedule_depthwise_conv2d_nchw",
            ScheduleTemplate::Conv2dNchwc { .. } => "schedule_conv2d_nchwc",
            ScheduleTemplate::Conv2dTransposeNchw => "schedule_conv2d_transpose_nchw",
            ScheduleTemplate::Pool => "schedule_pool",
            ScheduleTemplate::GlobalPool => "schedule_global_pool",
            ScheduleTemplate::Injective => "schedule_injective",
            ScheduleTemplate::Lrn => "schedule_lrn",
            ScheduleTemplate::L2Normalize => "schedule_l2_normalize",
            ScheduleTemplate::Broadcast => "schedule_broadcast",
        }
    }
}

/// Target-aware scheduler. Called only while `scope` is the innermost active target.
pub trait ScheduleLib: TensorExprLib {
    type Schedule: fmt::Debug + Send + 'static;

    fn schedule(
        &self,
        scope: &TargetScope,
        template: &ScheduleTemplate,
        outs: &[Self::Tensor],
    ) -> Result<Self::Schedule>;
}

/// Everything the lowering driver needs from the outside world.
pub trait Backend: ScheduleLib + 'static {}

impl<T: ScheduleLib + 'static> Backend for T {}
