#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conv_rs::autotune::{AutotuneResult, BenchmarkRequest};
use conv_rs::config::ConvConfig;
use conv_rs::descriptor::{build_descriptor, DescriptorOperands, FusionAttrs};
use conv_rs::{
    CachedRunner, CompiledConv, ConvBackendConfig, ConvCallAttrs, ConvDimensionNumbers,
    ConvDispatcher, ConvError, ConvKind, ConvLaunch, ConvPrimitive, ConvResult, DebugOptions,
    DeviceAddress, DeviceAllocator, DeviceContext, DeviceStream, ElementType, FlatView,
    RunOptions, StridedView, WindowAttrs,
};

#[derive(Debug)]
pub struct FakePlan {
    pub serial: usize,
}

impl CompiledConv for FakePlan {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRun {
    pub kind: ConvKind,
    pub algo_id: i64,
    pub operands: Vec<DeviceAddress>,
    pub results: Vec<DeviceAddress>,
    pub scratch: DeviceAddress,
}

/// Device primitive that records every call instead of touching a device.
#[derive(Default)]
pub struct FakePrimitive {
    pub compiles: AtomicUsize,
    pub benchmarks: AtomicUsize,
    pub fail_next_compiles: AtomicUsize,
    pub compile_delay: Mutex<Option<Duration>>,
    pub autotune_result: Mutex<Option<AutotuneResult>>,
    pub runs: Mutex<Vec<RecordedRun>>,
    pub configs: Mutex<Vec<ConvConfig>>,
}

impl FakePrimitive {
    pub fn with_autotune_result(algo_id: i64, scratch_bytes: u64) -> Self {
        let primitive = Self::default();
        *primitive.autotune_result.lock().unwrap() = Some(AutotuneResult {
            algo_id,
            tensor_ops_enabled: true,
            scratch_bytes,
            run_time: Some(Duration::from_micros(42)),
        });
        primitive
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.lock().unwrap().clone()
    }

    pub fn last_config(&self) -> Option<ConvConfig> {
        self.configs.lock().unwrap().last().cloned()
    }
}

impl ConvPrimitive for FakePrimitive {
    fn name(&self) -> &str {
        "fake"
    }

    fn compile(&self, config: &ConvConfig) -> ConvResult<Arc<dyn CompiledConv>> {
        if let Some(delay) = *self.compile_delay.lock().unwrap() {
            std::thread::sleep(delay);
        }
        let pending_failures = self.fail_next_compiles.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_next_compiles
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(ConvError::internal("fake compile failure"));
        }
        let serial = self.compiles.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().unwrap().push(config.clone());
        Ok(Arc::new(FakePlan { serial }))
    }

    fn run(&self, launch: &ConvLaunch<'_>) -> ConvResult<()> {
        assert!(launch.plan.as_any().downcast_ref::<FakePlan>().is_some());
        self.runs.lock().unwrap().push(RecordedRun {
            kind: launch.config.kind,
            algo_id: launch.algorithm.algo_id,
            operands: launch.operands.to_vec(),
            results: launch.results.to_vec(),
            scratch: launch.scratch,
        });
        Ok(())
    }

    fn benchmark(&self, request: &BenchmarkRequest<'_>) -> ConvResult<AutotuneResult> {
        assert!(!request.operands.is_empty());
        assert!(!request.results.is_empty());
        self.benchmarks.fetch_add(1, Ordering::SeqCst);
        self.autotune_result
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ConvError::unimplemented("benchmark", "no result configured"))
    }
}

pub struct FakeStream {
    pub ok: AtomicBool,
}

impl FakeStream {
    pub fn healthy() -> Self {
        Self {
            ok: AtomicBool::new(true),
        }
    }
}

impl DeviceStream for FakeStream {
    fn is_ok(&self) -> bool {
        self.ok.load(Ordering::SeqCst)
    }
}

/// Allocator that hands out fake addresses and records requested sizes.
#[derive(Default)]
pub struct CountingAllocator {
    next_ptr: AtomicU64,
    pub requests: Mutex<Vec<u64>>,
    pub live: AtomicI64,
    pub fail: AtomicBool,
}

impl CountingAllocator {
    pub const BASE: u64 = 0xdead_0000;

    pub fn requests(&self) -> Vec<u64> {
        self.requests.lock().unwrap().clone()
    }
}

impl DeviceAllocator for CountingAllocator {
    fn allocate(&self, _device_ordinal: i32, bytes: u64) -> ConvResult<DeviceAddress> {
        self.requests.lock().unwrap().push(bytes);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConvError::resource_exhausted(format!(
                "cannot allocate {bytes} bytes"
            )));
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        let offset = self.next_ptr.fetch_add(bytes.max(1), Ordering::SeqCst);
        Ok(DeviceAddress::new(Self::BASE + offset, bytes))
    }

    fn deallocate(&self, _device_ordinal: i32, _address: DeviceAddress) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub primitive: Arc<FakePrimitive>,
    pub dispatcher: ConvDispatcher,
    pub stream: FakeStream,
    pub counting: Arc<CountingAllocator>,
    pub allocator: Arc<dyn DeviceAllocator>,
    pub debug: DebugOptions,
}

impl Harness {
    pub fn new(primitive: FakePrimitive) -> Self {
        let primitive = Arc::new(primitive);
        let counting = Arc::new(CountingAllocator::default());
        let allocator: Arc<dyn DeviceAllocator> = counting.clone();
        Self {
            dispatcher: ConvDispatcher::new(primitive.clone()),
            primitive,
            stream: FakeStream::healthy(),
            counting,
            allocator,
            debug: DebugOptions::default(),
        }
    }

    pub fn options(&self, device: u64) -> RunOptions<'_> {
        RunOptions {
            device: DeviceContext::new(device),
            device_ordinal: 0,
            stream: &self.stream,
            allocator: &self.allocator,
            debug_options: &self.debug,
        }
    }
}

/// Forward 2-D convolution views: NCHW input [1,4,8,8], OIHW kernel [6,4,3,3],
/// output [1,6,8,8].
pub struct ForwardViews {
    pub input: StridedView,
    pub kernel: StridedView,
    pub output: StridedView,
}

impl ForwardViews {
    pub fn new() -> Self {
        Self {
            input: StridedView::dense(ElementType::F32, vec![1, 4, 8, 8], 0x1000),
            kernel: StridedView::dense(ElementType::F32, vec![6, 4, 3, 3], 0x2000),
            output: StridedView::dense(ElementType::F32, vec![1, 6, 8, 8], 0x3000),
        }
    }
}

pub const SCRATCH_PTR: u64 = 0x9000;

pub fn scratch(bytes: u64) -> FlatView {
    FlatView::new(SCRATCH_PTR, bytes)
}

pub fn forward_attrs(uid: i64, algorithm: i64) -> ConvCallAttrs {
    let mut window = WindowAttrs::unit(2);
    window.padding = vec![1, 1];
    ConvCallAttrs {
        uid,
        conv_dims: ConvDimensionNumbers::nchw(2),
        window,
        backend_config: ConvBackendConfig {
            algorithm,
            tensor_ops_enabled: false,
            is_cudnn_frontend: false,
            is_cudnn_reordered_int8: false,
            knob_ids: vec![],
            knob_values: vec![],
            operand_0_layout: vec![3, 2, 1, 0],
            operand_1_layout: vec![3, 2, 1, 0],
            result_layout: vec![3, 2, 1, 0],
            workspace_size: -1,
        },
        feature_group_count: 1,
        result_scale: 1.0,
    }
}

/// Builds a runner the way the dispatcher does, for tests driving the cache directly.
pub fn build_runner(primitive: &dyn ConvPrimitive, uid: i64) -> ConvResult<CachedRunner> {
    let views = ForwardViews::new();
    let scratch = scratch(0);
    let descriptor = build_descriptor(
        ConvKind::Forward,
        DescriptorOperands {
            operand0: &views.input,
            operand1: &views.kernel,
            output: &views.output,
            scratch: &scratch,
        },
        &forward_attrs(uid, 1),
        &FusionAttrs::default(),
    )?;
    let config = ConvConfig::from_descriptor(&descriptor)?;
    let plan = primitive.compile(&config)?;
    Ok(CachedRunner::new(config, plan))
}
