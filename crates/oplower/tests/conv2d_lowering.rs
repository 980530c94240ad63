use oplower::ops::names::{CONV2D, CONV2D_NCHWC, CONV2D_TRANSPOSE};
use oplower::{AttrBag, Dim, ErrorKind, Layout4D, Lowerer, LoweringError, OpRegistry};
use oplower_backend_tests::{
    conv2d_attrs, conv2d_nchwc_attrs, conv2d_transpose_attrs, RecordedCall, RecordedTensor,
    RecordingBackend,
};

fn compute(
    backend: &RecordingBackend,
    op: &str,
    attrs: &AttrBag,
    inputs: &[RecordedTensor],
) -> Result<RecordedTensor, LoweringError> {
    let registry = OpRegistry::with_nn_ops();
    let lowerer = Lowerer::new(&registry, backend);
    lowerer
        .compute(op, attrs, inputs)
        .map(|outcome| outcome.computed().expect("operator has a compute rule"))
}

#[test]
fn unit_dilation_passes_raw_kernel() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 3, 8, 8]);
    let kernel = backend.tensor(&[4, 3, 3, 3]);

    let out = compute(
        &backend,
        CONV2D,
        &conv2d_attrs("NCHW", 4),
        &[data.clone(), kernel.clone()],
    )
    .unwrap();

    assert_eq!(
        backend.calls(),
        vec![RecordedCall::Conv2d {
            data: data.id,
            kernel: kernel.id,
            strides: [1, 1],
            padding: [0, 0],
            layout: Layout4D::NCHW,
        }]
    );
    assert_eq!(out.dims(), vec![Some(1), Some(4), Some(6), Some(6)]);
}

#[test]
fn nchw_dilation_dilates_spatial_kernel_axes() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 3, 8, 8]);
    let kernel = backend.tensor(&[4, 3, 3, 3]);
    let attrs = conv2d_attrs("NCHW", 4).with("dilation", [2, 1]);

    let out = compute(&backend, CONV2D, &attrs, &[data.clone(), kernel.clone()]).unwrap();

    let calls = backend.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[0],
        RecordedCall::Dilate {
            tensor: kernel.id,
            strides: vec![1, 1, 2, 1],
        }
    );
    match &calls[1] {
        RecordedCall::Conv2d {
            data: conv_data,
            kernel: conv_kernel,
            ..
        } => {
            assert_eq!(*conv_data, data.id);
            assert_ne!(*conv_kernel, kernel.id, "conv must use the dilated kernel");
        }
        other => panic!("expected conv2d, got {other:?}"),
    }
    // Dilated kernel is 5x3.
    assert_eq!(out.dims(), vec![Some(1), Some(4), Some(4), Some(6)]);
}

#[test]
fn nhwc_dilation_uses_channels_last_strides() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 12, 12, 3]);
    let kernel = backend.tensor(&[3, 3, 3, 4]);
    let attrs = conv2d_attrs("NHWC", 4).with("dilation", [2, 3]);

    compute(&backend, CONV2D, &attrs, &[data, kernel.clone()]).unwrap();

    assert_eq!(
        backend.calls()[0],
        RecordedCall::Dilate {
            tensor: kernel.id,
            strides: vec![1, 2, 3, 1],
        }
    );
    assert_eq!(backend.call_names(), vec!["dilate", "conv2d"]);
}

#[test]
fn non_positive_dilation_fails_before_any_primitive() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 3, 8, 8]);
    let kernel = backend.tensor(&[4, 3, 3, 3]);

    for dilation in [[0, 1], [1, -2]] {
        let attrs = conv2d_attrs("NCHW", 4).with("dilation", dilation);
        let err = compute(&backend, CONV2D, &attrs, &[data.clone(), kernel.clone()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAttribute, "{dilation:?}");
        assert!(err.to_string().contains("dilation"));
    }
    assert!(backend.calls().is_empty());
}

#[test]
fn grouping_selects_standard_depthwise_or_rejects() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 4, 8, 8]);
    let kernel = backend.tensor(&[4, 1, 3, 3]);

    for groups in [0, 2] {
        let attrs = conv2d_attrs("NCHW", 4).with("groups", groups);
        let err = compute(&backend, CONV2D, &attrs, &[data.clone(), kernel.clone()]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedGrouping, "groups={groups}");
        assert!(err.to_string().contains(&format!("groups={groups}")));
    }
    assert!(backend.calls().is_empty());

    let attrs = conv2d_attrs("NCHW", 4).with("groups", 4);
    let out = compute(&backend, CONV2D, &attrs, &[data.clone(), kernel.clone()]).unwrap();
    assert_eq!(
        backend.calls(),
        vec![RecordedCall::DepthwiseConv2dNchw {
            data: data.id,
            kernel: kernel.id,
            strides: [1, 1],
            padding: [0, 0],
        }]
    );
    assert_eq!(out.dims(), vec![Some(1), Some(4), Some(6), Some(6)]);
}

#[test]
fn depthwise_requires_nchw() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 8, 8, 4]);
    let kernel = backend.tensor(&[3, 3, 4, 1]);
    let attrs = conv2d_attrs("NHWC", 4).with("groups", 4);

    let err = compute(&backend, CONV2D, &attrs, &[data, kernel]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedLayout);
    assert!(backend.calls().is_empty());
}

#[test]
fn grouped_conv_needs_constant_input_channels() {
    let backend = RecordingBackend::new();
    let data = backend.tensor_with_dims(vec![
        Dim::Const(1),
        Dim::Symbolic("c".to_string()),
        Dim::Const(8),
        Dim::Const(8),
    ]);
    let kernel = backend.tensor(&[4, 1, 3, 3]);
    let attrs = conv2d_attrs("NCHW", 4).with("groups", 4);

    let err = compute(&backend, CONV2D, &attrs, &[data, kernel]).unwrap_err();
    assert!(matches!(
        err,
        LoweringError::NonConstantDim { ref op, axis: 1 } if op == CONV2D
    ));
}

#[test]
fn bias_is_expanded_on_the_channel_axis() {
    for (layout, data_shape, kernel_shape, axis) in [
        ("NCHW", [1, 3, 8, 8], [4, 3, 3, 3], 1),
        ("NHWC", [1, 8, 8, 3], [3, 3, 3, 4], 0),
    ] {
        let backend = RecordingBackend::new();
        let data = backend.tensor(&data_shape);
        let kernel = backend.tensor(&kernel_shape);
        let bias = backend.tensor(&[4]);
        let attrs = conv2d_attrs(layout, 4).with("use_bias", true);

        compute(&backend, CONV2D, &attrs, &[data, kernel, bias.clone()]).unwrap();

        let calls = backend.calls();
        assert_eq!(
            backend.call_names(),
            vec!["conv2d", "expand_dims", "broadcast_add"],
            "{layout}"
        );
        assert_eq!(
            calls[1],
            RecordedCall::ExpandDims {
                tensor: bias.id,
                axis,
                num_newaxis: 2,
            },
            "{layout}"
        );
    }
}

#[test]
fn bias_input_required_when_enabled() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 3, 8, 8]);
    let kernel = backend.tensor(&[4, 3, 3, 3]);
    let attrs = conv2d_attrs("NCHW", 4).with("use_bias", true);

    let err = compute(&backend, CONV2D, &attrs, &[data, kernel]).unwrap_err();
    assert!(matches!(err, LoweringError::MissingInput { index: 2, .. }));
    assert!(backend.calls().is_empty());
}

#[test]
fn attribute_errors_are_distinct() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 3, 8, 8]);
    let kernel = backend.tensor(&[4, 3, 3, 3]);
    let inputs = [data, kernel];

    let missing = AttrBag::from_iter(
        conv2d_attrs("NCHW", 4)
            .iter()
            .filter(|(key, _)| *key != "groups")
            .map(|(key, value)| (key.to_string(), value.clone())),
    );
    let err = compute(&backend, CONV2D, &missing, &inputs).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingAttribute);
    assert!(err.to_string().contains("groups"));

    let wrong_type = conv2d_attrs("NCHW", 4).with("groups", "many");
    let err = compute(&backend, CONV2D, &wrong_type, &inputs).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AttributeType);

    let bad_layout = conv2d_attrs("NCW", 4);
    let err = compute(&backend, CONV2D, &bad_layout, &inputs).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedLayout);
    assert!(err.to_string().contains("NCW"));

    let negative_padding = conv2d_attrs("NCHW", 4).with("padding", [-1, 0]);
    let err = compute(&backend, CONV2D, &negative_padding, &inputs).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAttribute);

    assert!(backend.calls().is_empty());
}

#[test]
fn graph_json_string_attributes_are_coerced() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 3, 8, 8]);
    let kernel = backend.tensor(&[4, 3, 3, 3]);
    let attrs = AttrBag::from_json_str(
        r#"{
            "channels": "4",
            "kernel_size": "(3, 3)",
            "strides": "(2, 2)",
            "padding": "[1,1]",
            "dilation": "(1, 1)",
            "groups": "1",
            "layout": "NCHW",
            "use_bias": "False"
        }"#,
    )
    .unwrap();

    let out = compute(&backend, CONV2D, &attrs, &[data, kernel]).unwrap();
    assert_eq!(out.dims(), vec![Some(1), Some(4), Some(4), Some(4)]);
}

#[test]
fn primitive_failures_carry_the_operator() {
    let backend = RecordingBackend::new();
    backend.fail_on("conv2d");
    let data = backend.tensor(&[1, 3, 8, 8]);
    let kernel = backend.tensor(&[4, 3, 3, 3]);

    let err = compute(&backend, CONV2D, &conv2d_attrs("NCHW", 4), &[data, kernel]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Primitive);
    assert!(err.to_string().starts_with(CONV2D));
    let source = std::error::Error::source(&err).expect("primitive error has a source");
    assert!(source.to_string().contains("injected failure"));
}

#[test]
fn packed_conv_forwards_block_parameters() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 2, 8, 8, 4]);
    let kernel = backend.tensor(&[2, 2, 3, 3, 4, 4]);
    let bias = backend.tensor(&[8]);
    let attrs = conv2d_nchwc_attrs(8, 4)
        .with("padding", [1, 1])
        .with("use_bias", true);

    let out = compute(
        &backend,
        CONV2D_NCHWC,
        &attrs,
        &[data.clone(), kernel.clone(), bias.clone()],
    )
    .unwrap();

    let calls = backend.calls();
    assert_eq!(
        calls[0],
        RecordedCall::Conv2dNchwc {
            data: data.id,
            kernel: kernel.id,
            channels: 8,
            kernel_size: [3, 3],
            strides: [1, 1],
            padding: [1, 1],
        }
    );
    assert_eq!(
        calls[1],
        RecordedCall::ExpandDims {
            tensor: bias.id,
            axis: 1,
            num_newaxis: 2,
        }
    );
    assert_eq!(calls.len(), 3);
    assert_eq!(out.dims(), vec![Some(1), Some(2), Some(8), Some(8), Some(4)]);
}

#[test]
fn packed_conv_rejects_dilation_and_grouping() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 2, 8, 8, 4]);
    let kernel = backend.tensor(&[2, 2, 3, 3, 4, 4]);
    let inputs = [data, kernel];

    let dilated = conv2d_nchwc_attrs(8, 4).with("dilation", [2, 2]);
    let err = compute(&backend, CONV2D_NCHWC, &dilated, &inputs).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAttribute);

    let grouped = conv2d_nchwc_attrs(8, 4).with("groups", 2);
    let err = compute(&backend, CONV2D_NCHWC, &grouped, &inputs).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedGrouping);

    assert!(backend.calls().is_empty());
}

#[test]
fn transpose_output_padding_pads_trailing_spatial_edges() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 4, 5, 5]);
    let kernel = backend.tensor(&[4, 2, 3, 3]);
    let attrs = conv2d_transpose_attrs(2)
        .with("strides", [2, 2])
        .with("output_padding", [1, 2]);

    let out = compute(
        &backend,
        CONV2D_TRANSPOSE,
        &attrs,
        &[data.clone(), kernel.clone()],
    )
    .unwrap();

    let calls = backend.calls();
    assert_eq!(
        calls[0],
        RecordedCall::Conv2dTransposeNchw {
            data: data.id,
            kernel: kernel.id,
            strides: [2, 2],
            padding: [0, 0],
        }
    );
    match &calls[1] {
        RecordedCall::Pad { before, after, .. } => {
            assert_eq!(before, &vec![0, 0, 0, 0]);
            assert_eq!(after, &vec![0, 0, 1, 2]);
        }
        other => panic!("expected pad, got {other:?}"),
    }
    assert_eq!(out.dims(), vec![Some(1), Some(2), Some(12), Some(13)]);
}

#[test]
fn transpose_adds_bias_before_output_padding() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 4, 5, 5]);
    let kernel = backend.tensor(&[4, 2, 3, 3]);
    let bias = backend.tensor(&[2]);
    let attrs = conv2d_transpose_attrs(2).with("use_bias", true);

    compute(&backend, CONV2D_TRANSPOSE, &attrs, &[data, kernel, bias]).unwrap();

    assert_eq!(
        backend.call_names(),
        vec!["conv2d_transpose_nchw", "expand_dims", "broadcast_add", "pad"]
    );
}

#[test]
fn transpose_restrictions() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 4, 5, 5]);
    let kernel = backend.tensor(&[4, 2, 3, 3]);
    let inputs = [data, kernel];

    let cases = [
        (
            conv2d_transpose_attrs(2).with("layout", "NHWC"),
            ErrorKind::UnsupportedLayout,
        ),
        (
            conv2d_transpose_attrs(2).with("dilation", [1, 2]),
            ErrorKind::InvalidAttribute,
        ),
        (
            conv2d_transpose_attrs(2).with("groups", 2),
            ErrorKind::UnsupportedGrouping,
        ),
    ];
    for (attrs, kind) in cases {
        let err = compute(&backend, CONV2D_TRANSPOSE, &attrs, &inputs).unwrap_err();
        assert_eq!(err.kind(), kind);
    }
    assert!(backend.calls().is_empty());
}

fn without(attrs: AttrBag, key: &str) -> AttrBag {
    attrs
        .iter()
        .filter(|(name, _)| *name != key)
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

#[test]
fn transpose_does_not_read_channels() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 4, 5, 5]);
    let kernel = backend.tensor(&[4, 2, 3, 3]);
    let attrs = without(conv2d_transpose_attrs(2), "channels").with("output_padding", [1, 1]);
    assert!(!attrs.contains("channels"));

    let out = compute(&backend, CONV2D_TRANSPOSE, &attrs, &[data.clone(), kernel.clone()]).unwrap();
    assert_eq!(out.dims(), vec![Some(1), Some(2), Some(8), Some(8)]);

    let grouped = attrs.with("groups", 2);
    let err = compute(&backend, CONV2D_TRANSPOSE, &grouped, &[data, kernel]).unwrap_err();
    assert!(matches!(
        err,
        LoweringError::UnsupportedGrouping {
            groups: 2,
            channels: None,
            in_channels: None,
            ..
        }
    ));
    assert!(err.to_string().contains("channels=unknown"));
}

#[test]
fn grouping_is_rejected_before_bias_lookup() {
    let backend = RecordingBackend::new();
    let data = backend.tensor(&[1, 4, 8, 8]);
    let kernel = backend.tensor(&[4, 2, 3, 3]);
    let attrs = conv2d_attrs("NCHW", 4)
        .with("groups", 2)
        .with("use_bias", true);

    let err = compute(&backend, CONV2D, &attrs, &[data, kernel]).unwrap_err();
    assert!(matches!(
        err,
        LoweringError::UnsupportedGrouping {
            groups: 2,
            channels: Some(4),
            in_channels: Some(4),
            ..
        }
    ));
    assert!(backend.calls().is_empty());
}
