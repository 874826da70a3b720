use std::any::Any;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use conv_rs::autotune::{AutotuneConfig, AutotuneResult, BenchmarkRequest};
use conv_rs::config::ConvConfig;
use conv_rs::{
    AlgorithmDesc, CompiledConv, ConvError, ConvKind, ConvLaunch, ConvPrimitive, ConvResult,
    DeviceAddress, ElementType, OwnedDeviceMemory,
};
use smallvec::SmallVec;

use crate::cudnn::{
    cudnn, ActivationDescriptor, AlgoPerf, ConvDescriptor, CudnnContext, FilterDescriptor,
    HandleGuard, TensorDescriptor, CUDNN_DETERMINISTIC,
};
use crate::layout::{
    activation_spec, check_supported, compute_type, conv_geometry, cudnn_data_type,
    filter_geometry, role_pointers, tensor_geometry, ActivationSpec, RolePointers,
    TensorGeometry, CUDNN_CONVOLUTION_FWD_ALGO_IMPLICIT_PRECOMP_GEMM, CUDNN_DATA_FLOAT,
    CUDNN_DEFAULT_MATH, CUDNN_TENSOR_OP_MATH,
};

/// Upper bound on candidates any cuDNN find call reports.
const MAX_ALGO_CANDIDATES: usize = 8;

/// [`ConvPrimitive`] on the legacy cuDNN convolution API.
pub struct CudnnConvPrimitive {
    context: Arc<CudnnContext>,
}

impl CudnnConvPrimitive {
    pub fn new(context: Arc<CudnnContext>) -> Self {
        Self { context }
    }

    /// Primitive on the process-wide CUDA context.
    pub fn from_process() -> ConvResult<Self> {
        Ok(Self::new(cudnn()?))
    }

    pub fn context(&self) -> &Arc<CudnnContext> {
        &self.context
    }
}

struct FusedDescriptors {
    spec: ActivationSpec,
    bias: TensorDescriptor,
    activation: ActivationDescriptor,
}

/// Descriptors built once per cached runner.
pub struct CudnnConvPlan {
    kind: ConvKind,
    double_scale: bool,
    input: TensorDescriptor,
    filter: FilterDescriptor,
    output: TensorDescriptor,
    conv: ConvDescriptor,
    fused: Option<FusedDescriptors>,
}

impl fmt::Debug for CudnnConvPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudnnConvPlan")
            .field("kind", &self.kind)
            .field("double_scale", &self.double_scale)
            .field("fused", &self.fused.as_ref().map(|fused| fused.spec))
            .finish()
    }
}

impl CompiledConv for CudnnConvPlan {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Host scaling factor in the width cuDNN expects for the tensor type.
enum Scale {
    F32(f32),
    F64(f64),
}

impl Scale {
    fn new(value: f64, double: bool) -> Self {
        if double {
            Scale::F64(value)
        } else {
            Scale::F32(value as f32)
        }
    }

    fn as_ptr(&self) -> *const c_void {
        match self {
            Scale::F32(value) => value as *const f32 as *const c_void,
            Scale::F64(value) => value as *const f64 as *const c_void,
        }
    }
}

fn math_type(algorithm: &AlgorithmDesc) -> i32 {
    if algorithm.tensor_ops_enabled() {
        CUDNN_TENSOR_OP_MATH
    } else {
        CUDNN_DEFAULT_MATH
    }
}

fn algo_id(algorithm: &AlgorithmDesc) -> ConvResult<i32> {
    i32::try_from(algorithm.algo_id)
        .ok()
        .filter(|id| *id >= 0)
        .ok_or_else(|| {
            ConvError::invalid_argument(format!(
                "{} is not a cuDNN algorithm id",
                algorithm.algo_id
            ))
        })
}

fn bias_geometry(config: &ConvConfig) -> ConvResult<TensorGeometry> {
    let features = config.output_shape.dim(config.dnums.output_feature_dim)?;
    let features = i32::try_from(features).map_err(|_| {
        ConvError::invalid_argument(format!("{features} bias features do not fit cuDNN"))
    })?;
    let rank = (config.spatial_rank() + 2).max(4);
    let mut dims = vec![1; rank];
    let mut strides = vec![1; rank];
    dims[1] = features;
    strides[0] = features;
    Ok(TensorGeometry { dims, strides })
}

fn plan_of<'a>(plan: &'a dyn CompiledConv) -> ConvResult<&'a CudnnConvPlan> {
    plan.as_any()
        .downcast_ref::<CudnnConvPlan>()
        .ok_or_else(|| ConvError::internal(format!("plan {plan:?} was not compiled by cuDNN")))
}

fn device_ptr(address: DeviceAddress) -> *mut c_void {
    address.ptr as *mut c_void
}

impl ConvPrimitive for CudnnConvPrimitive {
    fn name(&self) -> &str {
        "cudnn"
    }

    fn compile(&self, config: &ConvConfig) -> ConvResult<Arc<dyn CompiledConv>> {
        check_supported(config)?;
        let dnums = &config.dnums;
        let input_type = config.input_shape.element_type;

        let input_geometry = tensor_geometry(
            &config.input_shape,
            dnums.input_batch_dim,
            dnums.input_feature_dim,
            &dnums.input_spatial_dims,
        )?;
        let output_geometry = tensor_geometry(
            &config.output_shape,
            dnums.output_batch_dim,
            dnums.output_feature_dim,
            &dnums.output_spatial_dims,
        )?;
        let filter_geometry = filter_geometry(&config.filter_shape, dnums)?;
        let conv_geometry = conv_geometry(&config.window)?;
        let groups = i32::try_from(config.feature_group_count).map_err(|_| {
            ConvError::invalid_argument(format!(
                "feature_group_count {} does not fit cuDNN",
                config.feature_group_count
            ))
        })?;

        let ctx = &self.context;
        let input = ctx.tensor_descriptor(cudnn_data_type(input_type)?, &input_geometry)?;
        let output = ctx.tensor_descriptor(
            cudnn_data_type(config.output_shape.element_type)?,
            &output_geometry,
        )?;
        let filter = ctx.filter_descriptor(
            cudnn_data_type(config.filter_shape.element_type)?,
            &filter_geometry,
        )?;
        let conv = ctx.conv_descriptor(
            &conv_geometry,
            compute_type(input_type),
            groups,
            math_type(&config.algorithm),
        )?;

        let fused = match &config.fusion {
            Some(fusion) => {
                let spec = activation_spec(fusion)?;
                let bias_type = match config.output_shape.element_type {
                    ElementType::S8 | ElementType::U8 => CUDNN_DATA_FLOAT,
                    other => cudnn_data_type(other)?,
                };
                Some(FusedDescriptors {
                    spec,
                    bias: ctx.tensor_descriptor(bias_type, &bias_geometry(config)?)?,
                    activation: ctx.activation_descriptor(spec.mode, spec.coef)?,
                })
            }
            None => None,
        };

        log::debug!(
            "compiled cuDNN {} plan: input {:?} filter {:?} ({:?}) output {:?}",
            config.kind.as_str(),
            input_geometry.dims,
            filter_geometry.dims,
            filter_geometry.format,
            output_geometry.dims
        );
        Ok(Arc::new(CudnnConvPlan {
            kind: config.kind,
            double_scale: input_type == ElementType::F64,
            input,
            filter,
            output,
            conv,
            fused,
        }))
    }

    fn run(&self, launch: &ConvLaunch<'_>) -> ConvResult<()> {
        let plan = plan_of(launch.plan)?;
        let ptrs = role_pointers(plan.kind, launch.operands, launch.results)?;
        let algo = algo_id(launch.algorithm)?;

        let handle = self.context.lock()?;
        handle.set_stream(launch.stream.raw_handle())?;
        handle.set_math_type(&plan.conv, math_type(launch.algorithm))?;

        let alpha = Scale::new(launch.config.conv_result_scale, plan.double_scale);
        let beta = Scale::new(0.0, plan.double_scale);
        let workspace = device_ptr(launch.scratch);
        let workspace_bytes = launch.scratch.size as usize;
        let fns = &handle.lib.fns;

        log::trace!(
            "cuDNN {} convolution with algorithm {algo}, workspace {workspace_bytes} bytes",
            plan.kind.as_str()
        );
        // SAFETY: descriptors are live for the plan's lifetime, device pointers come from
        // the caller's buffers, and the handle is exclusively held.
        let status = unsafe {
            match plan.kind {
                ConvKind::Forward => (fns.forward)(
                    handle.raw(),
                    alpha.as_ptr(),
                    plan.input.raw(),
                    device_ptr(ptrs.input),
                    plan.filter.raw(),
                    device_ptr(ptrs.filter),
                    plan.conv.raw(),
                    algo,
                    workspace,
                    workspace_bytes,
                    beta.as_ptr(),
                    plan.output.raw(),
                    device_ptr(ptrs.output),
                ),
                ConvKind::BackwardInput => (fns.backward_data)(
                    handle.raw(),
                    alpha.as_ptr(),
                    plan.filter.raw(),
                    device_ptr(ptrs.filter),
                    plan.output.raw(),
                    device_ptr(ptrs.output),
                    plan.conv.raw(),
                    algo,
                    workspace,
                    workspace_bytes,
                    beta.as_ptr(),
                    plan.input.raw(),
                    device_ptr(ptrs.input),
                ),
                ConvKind::BackwardFilter => (fns.backward_filter)(
                    handle.raw(),
                    alpha.as_ptr(),
                    plan.input.raw(),
                    device_ptr(ptrs.input),
                    plan.output.raw(),
                    device_ptr(ptrs.output),
                    plan.conv.raw(),
                    algo,
                    workspace,
                    workspace_bytes,
                    beta.as_ptr(),
                    plan.filter.raw(),
                    device_ptr(ptrs.filter),
                ),
                ConvKind::ForwardActivation => {
                    return self.run_fused(&handle, plan, launch, ptrs, algo);
                }
                ConvKind::ForwardGraph => {
                    return Err(ConvError::unimplemented(
                        "cudnn convolution",
                        "epilogue graphs need the cuDNN frontend",
                    ))
                }
            }
        };
        handle.lib.check(status, plan.kind.as_str())
    }

    fn benchmark(&self, request: &BenchmarkRequest<'_>) -> ConvResult<AutotuneResult> {
        let plan = plan_of(request.plan)?;
        let ptrs = role_pointers(plan.kind, request.operands, request.results)?;
        let autotune = request.autotune;
        let device = autotune.device_config;

        let workspace = match OwnedDeviceMemory::allocate(
            device.allocator,
            device.device_ordinal,
            autotune.scratch_limit_bytes,
        ) {
            Ok(memory) => Some(memory),
            Err(err) => {
                log::warn!(
                    "benchmarking {} convolution without scratch: {err}",
                    plan.kind.as_str()
                );
                None
            }
        };
        let workspace_address = workspace
            .as_ref()
            .map(OwnedDeviceMemory::address)
            .unwrap_or_default();

        let stream = request.stream.raw_handle();
        let driver = self.context.driver();
        for result in buffers_to_initialize(autotune, request.results) {
            let bytes = usize::try_from(result.size).map_err(|_| {
                ConvError::invalid_argument(format!("result buffer of {} bytes", result.size))
            })?;
            driver.zero_async(result.ptr, bytes, stream)?;
        }

        let handle = self.context.lock()?;
        handle.set_stream(stream)?;
        handle.set_math_type(&plan.conv, CUDNN_TENSOR_OP_MATH)?;
        let mut perfs = [AlgoPerf::default(); MAX_ALGO_CANDIDATES];
        let found = find_algorithms(&handle, plan, ptrs, workspace_address, &mut perfs)?;

        let identity_only = plan.fused.as_ref().is_some_and(|fused| fused.spec.is_identity());
        let candidates: SmallVec<[AlgoPerf; MAX_ALGO_CANDIDATES]> = perfs[..found]
            .iter()
            .copied()
            .filter(|perf| perf.status == 0)
            .filter(|perf| (perf.memory as u64) <= workspace_address.size)
            .filter(|perf| !autotune.deterministic_ops || perf.determinism == CUDNN_DETERMINISTIC)
            .filter(|perf| {
                !identity_only
                    || i64::from(perf.algo) == CUDNN_CONVOLUTION_FWD_ALGO_IMPLICIT_PRECOMP_GEMM
            })
            .collect();
        log::debug!(
            "cuDNN reported {found} algorithms for {} convolution, {} usable",
            plan.kind.as_str(),
            candidates.len()
        );

        // cuDNN sorts find results by time.
        let best = candidates.first().ok_or_else(|| {
            ConvError::internal(format!(
                "no cuDNN algorithm for {} convolution ran within {} scratch bytes",
                plan.kind.as_str(),
                workspace_address.size
            ))
        })?;
        Ok(AutotuneResult {
            algo_id: i64::from(best.algo),
            tensor_ops_enabled: best.math_type != CUDNN_DEFAULT_MATH,
            scratch_bytes: best.memory as u64,
            run_time: Duration::try_from_secs_f32(best.time / 1000.0).ok(),
        })
    }
}

impl CudnnConvPrimitive {
    fn run_fused(
        &self,
        handle: &HandleGuard<'_>,
        plan: &CudnnConvPlan,
        launch: &ConvLaunch<'_>,
        ptrs: RolePointers,
        algo: i32,
    ) -> ConvResult<()> {
        let fused = plan.fused.as_ref().ok_or_else(|| {
            ConvError::internal("forward activation plan was compiled without fusion descriptors")
        })?;
        let fusion = launch.config.fusion.ok_or_else(|| {
            ConvError::internal("forward activation config carries no fusion parameters")
        })?;
        if fused.spec.is_identity()
            && i64::from(algo) != CUDNN_CONVOLUTION_FWD_ALGO_IMPLICIT_PRECOMP_GEMM
        {
            return Err(ConvError::unimplemented(
                "cudnn convolution",
                format!(
                    "identity activation requires algorithm {CUDNN_CONVOLUTION_FWD_ALGO_IMPLICIT_PRECOMP_GEMM}, got {algo}"
                ),
            ));
        }
        let bias = launch
            .operands
            .get(2)
            .copied()
            .ok_or_else(|| ConvError::internal("fused convolution is missing its bias buffer"))?;
        // Without a side input the output doubles as z and is scaled by zero.
        let (side_input, side_scale) = match launch.operands.get(3) {
            Some(side_input) => (*side_input, fusion.side_input_scale),
            None => (ptrs.output, 0.0),
        };

        let alpha1 = Scale::new(launch.config.conv_result_scale, plan.double_scale);
        let alpha2 = Scale::new(side_scale, plan.double_scale);
        let fns = &handle.lib.fns;
        // SAFETY: as in `run`; the bias and side input pointers come from the call's operands.
        let status = unsafe {
            (fns.bias_activation_forward)(
                handle.raw(),
                alpha1.as_ptr(),
                plan.input.raw(),
                device_ptr(ptrs.input),
                plan.filter.raw(),
                device_ptr(ptrs.filter),
                plan.conv.raw(),
                algo,
                device_ptr(launch.scratch),
                launch.scratch.size as usize,
                alpha2.as_ptr(),
                plan.output.raw(),
                device_ptr(side_input),
                fused.bias.raw(),
                device_ptr(bias),
                fused.activation.raw(),
                plan.output.raw(),
                device_ptr(ptrs.output),
            )
        };
        handle
            .lib
            .check(status, "cudnnConvolutionBiasActivationForward")
    }
}

fn find_algorithms(
    handle: &HandleGuard<'_>,
    plan: &CudnnConvPlan,
    ptrs: RolePointers,
    workspace: DeviceAddress,
    perfs: &mut [AlgoPerf; MAX_ALGO_CANDIDATES],
) -> ConvResult<usize> {
    let fns = &handle.lib.fns;
    let mut returned = 0i32;
    let requested = MAX_ALGO_CANDIDATES as i32;
    // SAFETY: descriptors are live, `perfs` holds `requested` entries and the workspace
    // range is either a live allocation or empty.
    let (status, call) = unsafe {
        match plan.kind {
            ConvKind::Forward | ConvKind::ForwardActivation => (
                (fns.find_forward_ex)(
                    handle.raw(),
                    plan.input.raw(),
                    device_ptr(ptrs.input),
                    plan.filter.raw(),
                    device_ptr(ptrs.filter),
                    plan.conv.raw(),
                    plan.output.raw(),
                    device_ptr(ptrs.output),
                    requested,
                    &mut returned as *mut i32,
                    perfs.as_mut_ptr(),
                    device_ptr(workspace),
                    workspace.size as usize,
                ),
                "cudnnFindConvolutionForwardAlgorithmEx",
            ),
            ConvKind::BackwardInput => (
                (fns.find_backward_data_ex)(
                    handle.raw(),
                    plan.filter.raw(),
                    device_ptr(ptrs.filter),
                    plan.output.raw(),
                    device_ptr(ptrs.output),
                    plan.conv.raw(),
                    plan.input.raw(),
                    device_ptr(ptrs.input),
                    requested,
                    &mut returned as *mut i32,
                    perfs.as_mut_ptr(),
                    device_ptr(workspace),
                    workspace.size as usize,
                ),
                "cudnnFindConvolutionBackwardDataAlgorithmEx",
            ),
            ConvKind::BackwardFilter => (
                (fns.find_backward_filter_ex)(
                    handle.raw(),
                    plan.input.raw(),
                    device_ptr(ptrs.input),
                    plan.output.raw(),
                    device_ptr(ptrs.output),
                    plan.conv.raw(),
                    plan.filter.raw(),
                    device_ptr(ptrs.filter),
                    requested,
                    &mut returned as *mut i32,
                    perfs.as_mut_ptr(),
                    device_ptr(workspace),
                    workspace.size as usize,
                ),
                "cudnnFindConvolutionBackwardFilterAlgorithmEx",
            ),
            ConvKind::ForwardGraph => {
                return Err(ConvError::unimplemented(
                    "benchmark",
                    "epilogue graphs need the cuDNN frontend",
                ))
            }
        }
    };
    handle.lib.check(status, call)?;
    Ok(usize::try_from(returned).unwrap_or(0).min(MAX_ALGO_CANDIDATES))
}

/// Result buffers zeroed before benchmarking so candidates never read stale output.
fn buffers_to_initialize<'a>(
    autotune: &AutotuneConfig<'_>,
    results: &'a [DeviceAddress],
) -> &'a [DeviceAddress] {
    if autotune.should_init_buffers() {
        results
    } else {
        &[]
    }
}
