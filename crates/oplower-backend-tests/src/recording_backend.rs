use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use oplower::{
    AttrBag, Dim, Layout4D, LayoutRewrite, ScheduleLib, ScheduleTemplate, Target, TargetScope,
    TensorExprLib, TensorInfo,
};

/// Opaque tensor handle issued by [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordedTensor {
    pub id: usize,
    pub shape: Vec<Dim>,
}

impl RecordedTensor {
    pub fn dims(&self) -> Vec<Option<usize>> {
        self.shape.iter().map(Dim::as_const).collect()
    }
}

/// One tensor-expression or scheduler call, with tensors identified by handle id.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Dense {
        data: usize,
        weight: usize,
        bias: Option<usize>,
    },
    Dilate {
        tensor: usize,
        strides: Vec<usize>,
    },
    Conv2d {
        data: usize,
        kernel: usize,
        strides: [usize; 2],
        padding: [usize; 2],
        layout: Layout4D,
    },
    DepthwiseConv2dNchw {
        data: usize,
        kernel: usize,
        strides: [usize; 2],
        padding: [usize; 2],
    },
    Conv2dNchwc {
        data: usize,
        kernel: usize,
        channels: usize,
        kernel_size: [usize; 2],
        strides: [usize; 2],
        padding: [usize; 2],
    },
    Conv2dTransposeNchw {
        data: usize,
        kernel: usize,
        strides: [usize; 2],
        padding: [usize; 2],
    },
    ExpandDims {
        tensor: usize,
        axis: usize,
        num_newaxis: usize,
    },
    BroadcastAdd {
        lhs: usize,
        rhs: usize,
    },
    Pad {
        tensor: usize,
        before: Vec<usize>,
        after: Vec<usize>,
    },
    Lrn {
        data: usize,
        size: i64,
        axis: i64,
        alpha: f64,
        beta: f64,
        bias: f64,
    },
    L2Normalize {
        data: usize,
        eps: f64,
        axis: Vec<i64>,
    },
    AlterConv2dLayout {
        inputs: Vec<usize>,
    },
    Schedule {
        template: ScheduleTemplate,
        target: String,
        outs: Vec<usize>,
    },
}

impl RecordedCall {
    pub fn name(&self) -> &'static str {
        match self {
            RecordedCall::Dense { .. } => "dense",
            RecordedCall::Dilate { .. } => "dilate",
            RecordedCall::Conv2d { .. } => "conv2d",
            RecordedCall::DepthwiseConv2dNchw { .. } => "depthwise_conv2d_nchw",
            RecordedCall::Conv2dNchwc { .. } => "conv2d_nchwc",
            RecordedCall::Conv2dTransposeNchw { .. } => "conv2d_transpose_nchw",
            RecordedCall::ExpandDims { .. } => "expand_dims",
            RecordedCall::BroadcastAdd { .. } => "broadcast_add",
            RecordedCall::Pad { .. } => "pad",
            RecordedCall::Lrn { .. } => "lrn",
            RecordedCall::L2Normalize { .. } => "l2_normalize",
            RecordedCall::AlterConv2dLayout { .. } => "alter_conv2d_layout",
            RecordedCall::Schedule { .. } => "schedule",
        }
    }
}

/// What [`RecordingBackend::schedule`] hands back: the template it was asked for and the
/// target that was active at the time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSchedule {
    pub template: &'static str,
    pub target: String,
    pub keys: Vec<String>,
    pub scope_depth: usize,
}

/// Test-only backend that records every call and fabricates result handles with plausible
/// shapes.
#[derive(Default)]
pub struct RecordingBackend {
    next_id: AtomicUsize,
    calls: Mutex<Vec<RecordedCall>>,
    failing: Mutex<Option<&'static str>>,
    nchwc_block: Option<usize>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `alter_conv2d_layout` propose a packed `NCHW{block}c` convolution for NCHW nodes.
    pub fn with_nchwc_block(mut self, block: usize) -> Self {
        self.nchwc_block = Some(block);
        self
    }

    /// Makes the named primitive (as in [`RecordedCall::name`]) fail after recording the call.
    pub fn fail_on(&self, primitive: &'static str) {
        *self.failing.lock().expect("backend mutex poisoned") = Some(primitive);
    }

    /// A fresh input tensor of constant shape.
    pub fn tensor(&self, shape: &[usize]) -> RecordedTensor {
        self.tensor_with_dims(shape.iter().copied().map(Dim::Const).collect())
    }

    pub fn tensor_with_dims(&self, shape: Vec<Dim>) -> RecordedTensor {
        RecordedTensor {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            shape,
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("backend mutex poisoned").clone()
    }

    pub fn call_names(&self) -> Vec<&'static str> {
        self.calls().iter().map(RecordedCall::name).collect()
    }

    pub fn clear(&self) {
        self.calls.lock().expect("backend mutex poisoned").clear();
    }

    fn record(&self, call: RecordedCall) -> Result<()> {
        let name = call.name();
        self.calls.lock().expect("backend mutex poisoned").push(call);
        if *self.failing.lock().expect("backend mutex poisoned") == Some(name) {
            bail!("injected failure in {name}");
        }
        Ok(())
    }
}

fn const_dims(tensor: &RecordedTensor, rank: usize) -> Result<Vec<usize>> {
    if tensor.shape.len() != rank {
        bail!(
            "expected rank {rank}, got shape of rank {} for tensor {}",
            tensor.shape.len(),
            tensor.id
        );
    }
    tensor
        .shape
        .iter()
        .map(|dim| {
            dim.as_const()
                .ok_or_else(|| anyhow!("symbolic dimension {dim} in tensor {}", tensor.id))
        })
        .collect()
}

fn conv_out(input: usize, kernel: usize, stride: usize, pad: usize) -> Result<usize> {
    let padded = input + 2 * pad;
    if stride == 0 || padded < kernel {
        bail!("kernel {kernel} does not fit input {input} with padding {pad}");
    }
    Ok((padded - kernel) / stride + 1)
}

impl TensorExprLib for RecordingBackend {
    type Tensor = RecordedTensor;

    fn shape(&self, tensor: &RecordedTensor) -> Vec<Dim> {
        tensor.shape.clone()
    }

    fn dense(
        &self,
        data: &RecordedTensor,
        weight: &RecordedTensor,
        bias: Option<&RecordedTensor>,
    ) -> Result<RecordedTensor> {
        self.record(RecordedCall::Dense {
            data: data.id,
            weight: weight.id,
            bias: bias.map(|bias| bias.id),
        })?;
        let batch = data.shape.first().cloned().unwrap_or(Dim::Const(1));
        let units = weight.shape.first().cloned().unwrap_or(Dim::Const(1));
        Ok(self.tensor_with_dims(vec![batch, units]))
    }

    fn dilate(&self, tensor: &RecordedTensor, strides: &[usize]) -> Result<RecordedTensor> {
        self.record(RecordedCall::Dilate {
            tensor: tensor.id,
            strides: strides.to_vec(),
        })?;
        let dims = const_dims(tensor, strides.len())?;
        let shape = dims
            .iter()
            .zip(strides)
            .map(|(&dim, &stride)| if dim == 0 { 0 } else { (dim - 1) * stride + 1 })
            .collect::<Vec<_>>();
        Ok(self.tensor(&shape))
    }

    fn conv2d(
        &self,
        data: &RecordedTensor,
        kernel: &RecordedTensor,
        strides: [usize; 2],
        padding: [usize; 2],
        layout: Layout4D,
    ) -> Result<RecordedTensor> {
        self.record(RecordedCall::Conv2d {
            data: data.id,
            kernel: kernel.id,
            strides,
            padding,
            layout,
        })?;
        let d = const_dims(data, 4)?;
        let k = const_dims(kernel, 4)?;
        let shape = match layout {
            // data NCHW, kernel OIHW
            Layout4D::NCHW => [
                d[0],
                k[0],
                conv_out(d[2], k[2], strides[0], padding[0])?,
                conv_out(d[3], k[3], strides[1], padding[1])?,
            ],
            // data NHWC, kernel HWIO
            Layout4D::NHWC => [
                d[0],
                conv_out(d[1], k[0], strides[0], padding[0])?,
                conv_out(d[2], k[1], strides[1], padding[1])?,
                k[3],
            ],
        };
        Ok(self.tensor(&shape))
    }

    fn depthwise_conv2d_nchw(
        &self,
        data: &RecordedTensor,
        kernel: &RecordedTensor,
        strides: [usize; 2],
        padding: [usize; 2],
    ) -> Result<RecordedTensor> {
        self.record(RecordedCall::DepthwiseConv2dNchw {
            data: data.id,
            kernel: kernel.id,
            strides,
            padding,
        })?;
        let d = const_dims(data, 4)?;
        let k = const_dims(kernel, 4)?;
        Ok(self.tensor(&[
            d[0],
            d[1] * k[1],
            conv_out(d[2], k[2], strides[0], padding[0])?,
            conv_out(d[3], k[3], strides[1], padding[1])?,
        ]))
    }

    fn conv2d_nchwc(
        &self,
        data: &RecordedTensor,
        kernel: &RecordedTensor,
        channels: usize,
        kernel_size: [usize; 2],
        strides: [usize; 2],
        padding: [usize; 2],
    ) -> Result<RecordedTensor> {
        self.record(RecordedCall::Conv2dNchwc {
            data: data.id,
            kernel: kernel.id,
            channels,
            kernel_size,
            strides,
            padding,
        })?;
        let d = const_dims(data, 5)?;
        let block = d[4].max(1);
        Ok(self.tensor(&[
            d[0],
            channels / block,
            conv_out(d[2], kernel_size[0], strides[0], padding[0])?,
            conv_out(d[3], kernel_size[1], strides[1], padding[1])?,
            block,
        ]))
    }

    fn conv2d_transpose_nchw(
        &self,
        data: &RecordedTensor,
        kernel: &RecordedTensor,
        strides: [usize; 2],
        padding: [usize; 2],
    ) -> Result<RecordedTensor> {
        self.record(RecordedCall::Conv2dTransposeNchw {
            data: data.id,
            kernel: kernel.id,
            strides,
            padding,
        })?;
        let d = const_dims(data, 4)?;
        // kernel IOHW
        let k = const_dims(kernel, 4)?;
        let out = |input: usize, kernel: usize, stride: usize, pad: usize| {
            (input.saturating_sub(1) * stride + kernel)
                .checked_sub(2 * pad)
                .ok_or_else(|| anyhow!("padding {pad} exceeds transposed output"))
        };
        Ok(self.tensor(&[
            d[0],
            k[1],
            out(d[2], k[2], strides[0], padding[0])?,
            out(d[3], k[3], strides[1], padding[1])?,
        ]))
    }

    fn expand_dims(
        &self,
        tensor: &RecordedTensor,
        axis: usize,
        num_newaxis: usize,
    ) -> Result<RecordedTensor> {
        self.record(RecordedCall::ExpandDims {
            tensor: tensor.id,
            axis,
            num_newaxis,
        })?;
        if axis > tensor.shape.len() {
            bail!("axis {axis} out of range for rank {}", tensor.shape.len());
        }
        let mut shape = tensor.shape.clone();
        shape.splice(axis..axis, std::iter::repeat(Dim::Const(1)).take(num_newaxis));
        Ok(self.tensor_with_dims(shape))
    }

    fn broadcast_add(&self, lhs: &RecordedTensor, rhs: &RecordedTensor) -> Result<RecordedTensor> {
        self.record(RecordedCall::BroadcastAdd {
            lhs: lhs.id,
            rhs: rhs.id,
        })?;
        Ok(self.tensor_with_dims(lhs.shape.clone()))
    }

    fn pad(
        &self,
        tensor: &RecordedTensor,
        before: &[usize],
        after: &[usize],
    ) -> Result<RecordedTensor> {
        self.record(RecordedCall::Pad {
            tensor: tensor.id,
            before: before.to_vec(),
            after: after.to_vec(),
        })?;
        let dims = const_dims(tensor, before.len())?;
        let shape = dims
            .iter()
            .zip(before.iter().zip(after))
            .map(|(dim, (lo, hi))| dim + lo + hi)
            .collect::<Vec<_>>();
        Ok(self.tensor(&shape))
    }

    fn lrn(
        &self,
        data: &RecordedTensor,
        size: i64,
        axis: i64,
        alpha: f64,
        beta: f64,
        bias: f64,
    ) -> Result<RecordedTensor> {
        self.record(RecordedCall::Lrn {
            data: data.id,
            size,
            axis,
            alpha,
            beta,
            bias,
        })?;
        Ok(self.tensor_with_dims(data.shape.clone()))
    }

    fn l2_normalize(&self, data: &RecordedTensor, eps: f64, axis: &[i64]) -> Result<RecordedTensor> {
        self.record(RecordedCall::L2Normalize {
            data: data.id,
            eps,
            axis: axis.to_vec(),
        })?;
        Ok(self.tensor_with_dims(data.shape.clone()))
    }

    fn alter_conv2d_layout(
        &self,
        attrs: &AttrBag,
        inputs: &[RecordedTensor],
        _tinfos: &[TensorInfo],
    ) -> Result<Option<LayoutRewrite<RecordedTensor>>> {
        self.record(RecordedCall::AlterConv2dLayout {
            inputs: inputs.iter().map(|tensor| tensor.id).collect(),
        })?;
        let Some(block) = self.nchwc_block else {
            return Ok(None);
        };
        let nchw = attrs.view("conv2d").get_str("layout").ok() == Some("NCHW");
        if !nchw {
            return Ok(None);
        }
        let attrs = attrs
            .clone()
            .with("layout", format!("NCHW{block}c"))
            .with("kernel_layout", format!("OIHW{block}i{block}o"));
        Ok(Some(LayoutRewrite {
            op: "_contrib_conv2d_NCHWc".to_string(),
            attrs,
            inputs: inputs.to_vec(),
        }))
    }
}

impl ScheduleLib for RecordingBackend {
    type Schedule = RecordedSchedule;

    fn schedule(
        &self,
        scope: &TargetScope,
        template: &ScheduleTemplate,
        outs: &[RecordedTensor],
    ) -> Result<RecordedSchedule> {
        let current =
            Target::current().ok_or_else(|| anyhow!("schedule requested with no active target"))?;
        self.record(RecordedCall::Schedule {
            template: template.clone(),
            target: current.to_string(),
            outs: outs.iter().map(|tensor| tensor.id).collect(),
        })?;
        Ok(RecordedSchedule {
            template: template.name(),
            target: current.to_string(),
            keys: current.keys().to_vec(),
            scope_depth: scope.depth(),
        })
    }
}
