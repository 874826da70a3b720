mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;

use common::{
    forward_attrs, scratch, CountingAllocator, FakePrimitive, ForwardViews, Harness, SCRATCH_PTR,
};
use conv_rs::{
    ActivationMode, CachedRunner, CallArg, ConvArgs, ConvKind, DeviceAddress, DeviceContext,
    ElementType, ErrorKind, FlatView, FusedConvArgs, GraphConvArgs, RunnerState, StridedView,
};

fn forward_args<'a>(views: &'a ForwardViews, scratch: &'a FlatView) -> ConvArgs<'a> {
    ConvArgs {
        operand0: &views.input,
        operand1: &views.kernel,
        output: &views.output,
        scratch,
    }
}

fn cached_runner(h: &Harness, device: u64, uid: i64) -> anyhow::Result<Arc<CachedRunner>> {
    h.dispatcher
        .runners()
        .executor(DeviceContext::new(device))?
        .get(uid)?
        .ok_or_else(|| anyhow::anyhow!("no runner cached for uid {uid}"))
}

fn ptrs(addresses: &[DeviceAddress]) -> Vec<u64> {
    addresses.iter().map(|address| address.ptr).collect()
}

#[test]
fn static_algorithm_runs_once_without_allocating() -> anyhow::Result<()> {
    let h = Harness::new(FakePrimitive::default());
    let views = ForwardViews::new();
    let scratch = scratch(1024);
    let mut attrs = forward_attrs(1, 3);
    attrs.backend_config.workspace_size = 1024;

    h.dispatcher
        .conv(ConvKind::Forward, &h.options(0), forward_args(&views, &scratch), &attrs)?;

    let runs = h.primitive.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].kind, ConvKind::Forward);
    assert_eq!(runs[0].algo_id, 3);
    assert_eq!(ptrs(&runs[0].operands), vec![0x1000, 0x2000]);
    assert_eq!(ptrs(&runs[0].results), vec![0x3000]);
    assert_eq!(runs[0].scratch, DeviceAddress::new(SCRATCH_PTR, 1024));
    assert!(h.counting.requests().is_empty());
    assert_eq!(h.primitive.benchmarks.load(Ordering::SeqCst), 0);

    let config = h.primitive.last_config().expect("compiled config");
    assert_eq!(config.algorithm.workspace_size, Some(1024));
    assert_eq!(config.static_scratch_size, 1024);
    assert_eq!(
        config.window.dimensions.iter().map(|d| d.size).collect::<Vec<_>>(),
        vec![3, 3]
    );
    Ok(())
}

#[test]
fn runner_is_built_once_per_device_and_uid() -> anyhow::Result<()> {
    let h = Harness::new(FakePrimitive::default());
    let views = ForwardViews::new();
    let scratch = scratch(0);
    let attrs = forward_attrs(11, 1);

    for _ in 0..3 {
        h.dispatcher
            .conv(ConvKind::Forward, &h.options(0), forward_args(&views, &scratch), &attrs)?;
    }
    assert_eq!(h.primitive.compiles.load(Ordering::SeqCst), 1);

    h.dispatcher
        .conv(ConvKind::Forward, &h.options(1), forward_args(&views, &scratch), &attrs)?;
    assert_eq!(h.primitive.compiles.load(Ordering::SeqCst), 2);
    assert_eq!(h.primitive.runs().len(), 4);

    let stats = h.dispatcher.runners().stats();
    assert_eq!(stats.executors, 2);
    assert_eq!(stats.hits, 2);
    Ok(())
}

#[test]
#[cfg(feature = "runtime-autotune")]
fn unset_algorithm_autotunes_and_grows_scratch() -> anyhow::Result<()> {
    let h = Harness::new(FakePrimitive::with_autotune_result(7, 4096));
    let views = ForwardViews::new();
    let scratch = scratch(1024);
    let attrs = forward_attrs(2, -1);

    h.dispatcher
        .conv(ConvKind::Forward, &h.options(0), forward_args(&views, &scratch), &attrs)?;

    assert_eq!(h.primitive.benchmarks.load(Ordering::SeqCst), 1);
    assert_eq!(h.counting.requests(), vec![4096]);
    assert_eq!(h.counting.live.load(Ordering::SeqCst), 0);

    let runs = h.primitive.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].algo_id, 7);
    assert_eq!(
        runs[0].scratch,
        DeviceAddress::new(CountingAllocator::BASE, 4096)
    );

    // The plan was compiled against the placeholder, never the sentinel.
    let config = h.primitive.last_config().expect("compiled config");
    assert_eq!(config.algorithm.algo_id, 0);

    let runner = cached_runner(&h, 0, 2)?;
    assert_eq!(runner.state(), RunnerState::AlgorithmRefined);
    let algorithm = runner.algorithm()?;
    assert_eq!(algorithm.algo_id, 7);
    assert!(algorithm.tensor_ops_enabled());
    assert_eq!(algorithm.workspace_size, Some(4096));
    Ok(())
}

#[test]
#[cfg(feature = "runtime-autotune")]
fn tuned_runner_is_not_benchmarked_again() -> anyhow::Result<()> {
    let h = Harness::new(FakePrimitive::with_autotune_result(7, 4096));
    let views = ForwardViews::new();
    let scratch = scratch(1024);
    let attrs = forward_attrs(3, -1);

    for _ in 0..2 {
        h.dispatcher
            .conv(ConvKind::Forward, &h.options(0), forward_args(&views, &scratch), &attrs)?;
    }

    assert_eq!(h.primitive.benchmarks.load(Ordering::SeqCst), 1);
    // Grown scratch is per call, so the second call allocates again.
    assert_eq!(h.counting.requests(), vec![4096, 4096]);
    assert_eq!(h.counting.live.load(Ordering::SeqCst), 0);
    let runs = h.primitive.runs();
    assert!(runs.iter().all(|run| run.algo_id == 7));
    assert_eq!(runs[1].scratch.size, 4096);
    assert_eq!(cached_runner(&h, 0, 3)?.refinement_count(), 1);
    Ok(())
}

#[test]
#[cfg(feature = "runtime-autotune")]
fn autotuned_scratch_within_static_buffer_is_not_grown() -> anyhow::Result<()> {
    let h = Harness::new(FakePrimitive::with_autotune_result(5, 512));
    let views = ForwardViews::new();
    let scratch = scratch(1024);

    h.dispatcher.conv(
        ConvKind::Forward,
        &h.options(0),
        forward_args(&views, &scratch),
        &forward_attrs(4, -1),
    )?;

    assert!(h.counting.requests().is_empty());
    let runs = h.primitive.runs();
    assert_eq!(runs[0].algo_id, 5);
    assert_eq!(runs[0].scratch, DeviceAddress::new(SCRATCH_PTR, 1024));
    Ok(())
}

#[test]
#[cfg(feature = "runtime-autotune")]
fn negative_autotune_result_is_internal_error() -> anyhow::Result<()> {
    let h = Harness::new(FakePrimitive::with_autotune_result(-3, 0));
    let views = ForwardViews::new();
    let scratch = scratch(0);

    let err = h
        .dispatcher
        .conv(
            ConvKind::Forward,
            &h.options(0),
            forward_args(&views, &scratch),
            &forward_attrs(5, -1),
        )
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("-3"), "{err}");
    assert!(h.primitive.runs().is_empty());
    assert_eq!(cached_runner(&h, 0, 5)?.state(), RunnerState::Built);
    Ok(())
}

#[test]
#[cfg(feature = "runtime-autotune")]
fn concurrent_unset_algorithm_calls_settle_on_one_algorithm() -> anyhow::Result<()> {
    const THREADS: usize = 8;
    let h = Harness::new(FakePrimitive::with_autotune_result(7, 4096));
    let views = ForwardViews::new();
    let scratch = scratch(1024);
    let attrs = forward_attrs(12, -1);
    let barrier = Barrier::new(THREADS);

    thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    h.dispatcher.conv(
                        ConvKind::Forward,
                        &h.options(0),
                        forward_args(&views, &scratch),
                        &attrs,
                    )
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("worker panicked"))
            .collect::<Result<Vec<_>, _>>()
    })?;

    let benchmarks = h.primitive.benchmarks.load(Ordering::SeqCst);
    assert!((1..=THREADS).contains(&benchmarks), "{benchmarks} benchmarks");
    assert_eq!(h.primitive.compiles.load(Ordering::SeqCst), 1);
    let runs = h.primitive.runs();
    assert_eq!(runs.len(), THREADS);
    assert!(runs.iter().all(|run| run.algo_id == 7));

    let runner = cached_runner(&h, 0, 12)?;
    assert_eq!(runner.state(), RunnerState::AlgorithmRefined);
    assert_eq!(runner.algorithm()?.algo_id, 7);

    // Settled runners never go back to benchmarking or the sentinel.
    h.dispatcher
        .conv(ConvKind::Forward, &h.options(0), forward_args(&views, &scratch), &attrs)?;
    assert_eq!(h.primitive.benchmarks.load(Ordering::SeqCst), benchmarks);
    assert!(h.primitive.runs().iter().all(|run| run.algo_id >= 0));
    assert_eq!(h.counting.live.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
#[cfg(feature = "runtime-autotune")]
fn autotune_level_zero_refuses_to_benchmark() -> anyhow::Result<()> {
    let mut h = Harness::new(FakePrimitive::with_autotune_result(7, 4096));
    h.debug.autotune_level = 0;
    let views = ForwardViews::new();
    let scratch = scratch(0);

    let err = h
        .dispatcher
        .conv(
            ConvKind::Forward,
            &h.options(0),
            forward_args(&views, &scratch),
            &forward_attrs(13, -1),
        )
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("autotune level 0"), "{err}");
    assert_eq!(h.primitive.benchmarks.load(Ordering::SeqCst), 0);
    assert!(h.primitive.runs().is_empty());
    assert!(h.counting.requests().is_empty());
    assert_eq!(cached_runner(&h, 0, 13)?.state(), RunnerState::Built);

    // A static algorithm is unaffected by the level.
    h.dispatcher.conv(
        ConvKind::Forward,
        &h.options(0),
        forward_args(&views, &scratch),
        &forward_attrs(14, 2),
    )?;
    assert_eq!(h.primitive.runs().len(), 1);
    Ok(())
}

#[test]
#[cfg(feature = "runtime-autotune")]
fn primitive_without_benchmarking_fails_autotuning() {
    let h = Harness::new(FakePrimitive::default());
    let views = ForwardViews::new();
    let scratch = scratch(0);

    let err = h
        .dispatcher
        .conv(
            ConvKind::Forward,
            &h.options(0),
            forward_args(&views, &scratch),
            &forward_attrs(6, -1),
        )
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Unimplemented);
    assert!(err.to_string().contains("runtime autotuning"), "{err}");
    assert!(h.primitive.runs().is_empty());
}

#[test]
fn unhealthy_stream_after_run_is_internal_error() {
    let h = Harness::new(FakePrimitive::default());
    h.stream.ok.store(false, Ordering::SeqCst);
    let views = ForwardViews::new();
    let scratch = scratch(0);

    let err = h
        .dispatcher
        .conv(
            ConvKind::Forward,
            &h.options(0),
            forward_args(&views, &scratch),
            &forward_attrs(7, 1),
        )
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("stream not ok"), "{err}");
    assert_eq!(h.primitive.runs().len(), 1);
}

#[test]
#[cfg(feature = "runtime-autotune")]
fn failed_scratch_allocation_is_reported() {
    let h = Harness::new(FakePrimitive::with_autotune_result(2, 1 << 20));
    h.counting.fail.store(true, Ordering::SeqCst);
    let views = ForwardViews::new();
    let scratch = scratch(16);

    let err = h
        .dispatcher
        .conv(
            ConvKind::Forward,
            &h.options(0),
            forward_args(&views, &scratch),
            &forward_attrs(8, -1),
        )
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert!(err.to_string().contains("scratch allocation"), "{err}");
    assert_eq!(h.counting.requests(), vec![1 << 20]);
    assert!(h.primitive.runs().is_empty());
}

#[test]
fn invalid_layout_fails_before_compiling_and_is_retried() -> anyhow::Result<()> {
    let h = Harness::new(FakePrimitive::default());
    let views = ForwardViews::new();
    let scratch = scratch(0);
    let mut attrs = forward_attrs(9, 1);
    attrs.backend_config.operand_1_layout = vec![2, 1, 0];

    let err = h
        .dispatcher
        .conv(ConvKind::Forward, &h.options(0), forward_args(&views, &scratch), &attrs)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.to_string().contains("convolution descriptor"), "{err}");
    assert_eq!(h.primitive.compiles.load(Ordering::SeqCst), 0);

    attrs.backend_config.operand_1_layout = vec![3, 2, 1, 0];
    h.dispatcher
        .conv(ConvKind::Forward, &h.options(0), forward_args(&views, &scratch), &attrs)?;
    assert_eq!(h.primitive.compiles.load(Ordering::SeqCst), 1);
    assert_eq!(h.dispatcher.runners().stats().failed_builds, 1);
    Ok(())
}

#[test]
fn mismatched_window_spans_are_rejected() {
    let h = Harness::new(FakePrimitive::default());
    let views = ForwardViews::new();
    let scratch = scratch(0);
    let mut attrs = forward_attrs(10, 1);
    attrs.window.rhs_dilation = vec![1];

    let err = h
        .dispatcher
        .conv(ConvKind::Forward, &h.options(0), forward_args(&views, &scratch), &attrs)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.to_string().contains("rhs_dilation"), "{err}");
}

#[test]
fn compile_failure_leaves_no_runner_behind() -> anyhow::Result<()> {
    let primitive = FakePrimitive::default();
    primitive.fail_next_compiles.store(1, Ordering::SeqCst);
    let h = Harness::new(primitive);
    let views = ForwardViews::new();
    let scratch = scratch(0);
    let attrs = forward_attrs(12, 1);

    let err = h
        .dispatcher
        .conv(ConvKind::Forward, &h.options(0), forward_args(&views, &scratch), &attrs)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(h
        .dispatcher
        .runners()
        .executor(DeviceContext::new(0))?
        .get(12)?
        .is_none());

    h.dispatcher
        .conv(ConvKind::Forward, &h.options(0), forward_args(&views, &scratch), &attrs)?;
    assert_eq!(h.primitive.runs().len(), 1);
    Ok(())
}

#[test]
fn backward_input_maps_roles() -> anyhow::Result<()> {
    let h = Harness::new(FakePrimitive::default());
    let output_grad = StridedView::dense(ElementType::F32, vec![1, 6, 8, 8], 0x3000);
    let kernel = StridedView::dense(ElementType::F32, vec![6, 4, 3, 3], 0x2000);
    let input_grad = StridedView::dense(ElementType::F32, vec![1, 4, 8, 8], 0x1000);
    let scratch = scratch(0);

    h.dispatcher.conv(
        ConvKind::BackwardInput,
        &h.options(0),
        ConvArgs {
            operand0: &output_grad,
            operand1: &kernel,
            output: &input_grad,
            scratch: &scratch,
        },
        &forward_attrs(13, 1),
    )?;

    let config = h.primitive.last_config().expect("compiled config");
    assert_eq!(config.kind, ConvKind::BackwardInput);
    assert_eq!(config.input_shape.dims, vec![1, 4, 8, 8]);
    assert_eq!(config.output_shape.dims, vec![1, 6, 8, 8]);
    assert!(config.fusion.is_none());
    let runs = h.primitive.runs();
    assert_eq!(ptrs(&runs[0].operands), vec![0x3000, 0x2000]);
    assert_eq!(ptrs(&runs[0].results), vec![0x1000]);
    Ok(())
}

#[test]
fn plain_entry_point_rejects_fused_kinds() {
    let h = Harness::new(FakePrimitive::default());
    let views = ForwardViews::new();
    let scratch = scratch(0);

    let err = h
        .dispatcher
        .conv(
            ConvKind::ForwardActivation,
            &h.options(0),
            forward_args(&views, &scratch),
            &forward_attrs(14, 1),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(h.primitive.compiles.load(Ordering::SeqCst), 0);
}

#[test]
fn fused_conv_passes_bias_and_activation() -> anyhow::Result<()> {
    let h = Harness::new(FakePrimitive::default());
    let views = ForwardViews::new();
    let bias = FlatView::new(0x4000, 24);
    let scratch = scratch(0);

    h.dispatcher.conv_fused(
        &h.options(0),
        FusedConvArgs {
            operand0: &views.input,
            operand1: &views.kernel,
            bias: &bias,
            output: &views.output,
            scratch: &scratch,
        },
        &forward_attrs(15, 1),
        ActivationMode::LeakyRelu,
        0.1,
    )?;

    let runs = h.primitive.runs();
    assert_eq!(runs[0].kind, ConvKind::ForwardActivation);
    assert_eq!(ptrs(&runs[0].operands), vec![0x1000, 0x2000, 0x4000]);

    let fusion = h
        .primitive
        .last_config()
        .and_then(|config| config.fusion)
        .expect("fusion config");
    assert_eq!(fusion.mode, ActivationMode::LeakyRelu);
    assert_eq!(fusion.leakyrelu_alpha, 0.1);
    assert_eq!(fusion.side_input_scale, 0.0);
    Ok(())
}

#[test]
fn fused_side_input_conv_orders_side_input_after_bias() -> anyhow::Result<()> {
    let h = Harness::new(FakePrimitive::default());
    let views = ForwardViews::new();
    let bias = FlatView::new(0x4000, 24);
    let side_input = StridedView::dense(ElementType::F32, vec![1, 6, 8, 8], 0x5000);
    let scratch = scratch(0);

    h.dispatcher.conv_fused_side_input(
        &h.options(0),
        FusedConvArgs {
            operand0: &views.input,
            operand1: &views.kernel,
            bias: &bias,
            output: &views.output,
            scratch: &scratch,
        },
        &side_input,
        &forward_attrs(16, 1),
        ActivationMode::Relu,
        0.5,
    )?;

    let runs = h.primitive.runs();
    assert_eq!(ptrs(&runs[0].operands), vec![0x1000, 0x2000, 0x4000, 0x5000]);
    let fusion = h
        .primitive
        .last_config()
        .and_then(|config| config.fusion)
        .expect("fusion config");
    assert_eq!(fusion.mode, ActivationMode::Relu);
    assert_eq!(fusion.side_input_scale, 0.5);
    assert_eq!(fusion.leakyrelu_alpha, 0.0);
    Ok(())
}

#[test]
fn graph_conv_forwards_extra_operands_and_aux_outputs() -> anyhow::Result<()> {
    let h = Harness::new(FakePrimitive::default());
    let views = ForwardViews::new();
    let remaining = vec![
        CallArg::from(StridedView::dense(ElementType::F32, vec![6], 0x6000)),
        CallArg::from(views.output.clone()),
        CallArg::from(StridedView::dense(ElementType::F32, vec![1], 0x7000)),
        CallArg::from(FlatView::new(SCRATCH_PTR, 256)),
    ];

    h.dispatcher.conv_forward_graph(
        &h.options(0),
        GraphConvArgs {
            operand0: &views.input,
            operand1: &views.kernel,
            remaining: &remaining,
        },
        &forward_attrs(17, 1),
        1,
        "scale_and_max",
    )?;

    let runs = h.primitive.runs();
    assert_eq!(runs[0].kind, ConvKind::ForwardGraph);
    assert_eq!(ptrs(&runs[0].operands), vec![0x1000, 0x2000, 0x6000]);
    assert_eq!(ptrs(&runs[0].results), vec![0x3000, 0x7000]);
    assert_eq!(runs[0].scratch, DeviceAddress::new(SCRATCH_PTR, 256));

    let config = h.primitive.last_config().expect("compiled config");
    assert_eq!(config.serialized_graph.as_deref(), Some("scale_and_max"));
    assert!(config.fusion.is_none());
    Ok(())
}

#[test]
fn graph_conv_with_undecodable_output_fails() {
    let h = Harness::new(FakePrimitive::default());
    let views = ForwardViews::new();
    let remaining = vec![CallArg::I64(4), CallArg::from(FlatView::new(SCRATCH_PTR, 0))];

    let err = h
        .dispatcher
        .conv_forward_graph(
            &h.options(0),
            GraphConvArgs {
                operand0: &views.input,
                operand1: &views.kernel,
                remaining: &remaining,
            },
            &forward_attrs(18, 1),
            0,
            "g",
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(err.to_string().contains("output buffer"), "{err}");
    assert_eq!(h.primitive.compiles.load(Ordering::SeqCst), 0);
}
