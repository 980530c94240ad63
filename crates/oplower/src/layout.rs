//! Tensor layout helpers.
//!
//! Convolution lowering supports two canonical activation layouts. This module maps a layout
//! to the axes the lowering policies touch: the channel axis, the spatial axes that receive
//! kernel dilation, and the axis at which a per-channel bias is broadcast.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout4D {
    NCHW,
    NHWC,
}

impl Layout4D {
    /// Parses a layout attribute; only the exact spellings `NCHW` and `NHWC` are accepted.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "NCHW" => Some(Layout4D::NCHW),
            "NHWC" => Some(Layout4D::NHWC),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Layout4D::NCHW => "NCHW",
            Layout4D::NHWC => "NHWC",
        }
    }

    pub const fn channel_axis(self) -> usize {
        match self {
            Layout4D::NCHW => 1,
            Layout4D::NHWC => 3,
        }
    }

    /// Per-axis zero-insertion strides that dilate a kernel by `(dh, dw)` spatially.
    pub const fn dilation_strides(self, dh: usize, dw: usize) -> [usize; 4] {
        match self {
            Layout4D::NCHW => [1, 1, dh, dw],
            Layout4D::NHWC => [1, dh, dw, 1],
        }
    }

    /// Axis at which two singleton axes are inserted so a 1-D bias broadcasts over the output.
    pub const fn bias_expand_axis(self) -> usize {
        match self {
            Layout4D::NCHW => 1,
            Layout4D::NHWC => 0,
        }
    }
}

impl fmt::Display for Layout4D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_exact() {
        assert_eq!(Layout4D::parse("NCHW"), Some(Layout4D::NCHW));
        assert_eq!(Layout4D::parse("NHWC"), Some(Layout4D::NHWC));
        assert_eq!(Layout4D::parse("nchw"), None);
        assert_eq!(Layout4D::parse("NCHW8c"), None);
    }

    #[test]
    fn dilation_touches_spatial_axes_only() {
        assert_eq!(Layout4D::NCHW.dilation_strides(2, 3), [1, 1, 2, 3]);
        assert_eq!(Layout4D::NHWC.dilation_strides(2, 3), [1, 2, 3, 1]);
    }

    #[test]
    fn channel_and_bias_axes() {
        assert_eq!(Layout4D::NCHW.channel_axis(), 1);
        assert_eq!(Layout4D::NHWC.channel_axis(), 3);
        assert_eq!(Layout4D::NCHW.bias_expand_axis(), 1);
        assert_eq!(Layout4D::NHWC.bias_expand_axis(), 0);
    }
}
