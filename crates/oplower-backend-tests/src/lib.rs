//! Test doubles and attribute fixtures shared by oplower's integration tests.

pub mod recording_backend;

pub use recording_backend::{RecordedCall, RecordedSchedule, RecordedTensor, RecordingBackend};

use oplower::AttrBag;

/// A complete conv2d attribute set: 3x3-style stride 1, no padding, no dilation, one group.
pub fn conv2d_attrs(layout: &str, channels: i64) -> AttrBag {
    AttrBag::new()
        .with("channels", channels)
        .with("kernel_size", [3, 3])
        .with("strides", [1, 1])
        .with("padding", [0, 0])
        .with("dilation", [1, 1])
        .with("groups", 1)
        .with("layout", layout)
        .with("use_bias", false)
}

/// conv2d_transpose attributes with zero output padding.
pub fn conv2d_transpose_attrs(channels: i64) -> AttrBag {
    conv2d_attrs("NCHW", channels).with("output_padding", [0, 0])
}

/// Packed-layout convolution attributes as produced by the conv2d layout rewrite.
pub fn conv2d_nchwc_attrs(channels: i64, block: usize) -> AttrBag {
    conv2d_attrs(&format!("NCHW{block}c"), channels)
}
