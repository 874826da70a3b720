use std::ffi::{c_char, c_void, CStr};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use conv_rs::{ConvError, ConvResult};
use libloading::Library;

use crate::device::CudaDriver;
use crate::layout::{ConvGeometry, FilterGeometry, TensorGeometry};

pub(crate) type CudnnStatus = i32;
pub(crate) type CudnnHandle = *mut c_void;
pub(crate) type TensorDesc = *mut c_void;
pub(crate) type FilterDesc = *mut c_void;
pub(crate) type ConvDesc = *mut c_void;
pub(crate) type ActivationDesc = *mut c_void;

const CUDNN_STATUS_SUCCESS: CudnnStatus = 0;
const CUDNN_NOT_PROPAGATE_NAN: i32 = 0;

/// `cudnnConvolution{Fwd,BwdData,BwdFilter}AlgoPerf_t`; the three share one layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AlgoPerf {
    pub algo: i32,
    pub status: CudnnStatus,
    pub time: f32,
    pub memory: usize,
    pub determinism: i32,
    pub math_type: i32,
    pub reserved: [i32; 3],
}

pub(crate) const CUDNN_DETERMINISTIC: i32 = 1;

type CreateFn = unsafe extern "C" fn(handle: *mut CudnnHandle) -> CudnnStatus;
type DestroyFn = unsafe extern "C" fn(handle: CudnnHandle) -> CudnnStatus;
type SetStreamFn = unsafe extern "C" fn(handle: CudnnHandle, stream: *mut c_void) -> CudnnStatus;
type GetErrorStringFn = unsafe extern "C" fn(status: CudnnStatus) -> *const c_char;
type CreateDescFn = unsafe extern "C" fn(desc: *mut *mut c_void) -> CudnnStatus;
type DestroyDescFn = unsafe extern "C" fn(desc: *mut c_void) -> CudnnStatus;
type SetTensorNdFn = unsafe extern "C" fn(
    desc: TensorDesc,
    data_type: i32,
    nb_dims: i32,
    dims: *const i32,
    strides: *const i32,
) -> CudnnStatus;
type SetFilterNdFn = unsafe extern "C" fn(
    desc: FilterDesc,
    data_type: i32,
    format: i32,
    nb_dims: i32,
    dims: *const i32,
) -> CudnnStatus;
type SetConvolutionNdFn = unsafe extern "C" fn(
    desc: ConvDesc,
    array_length: i32,
    pads: *const i32,
    strides: *const i32,
    dilations: *const i32,
    mode: i32,
    compute_type: i32,
) -> CudnnStatus;
type SetConvolutionGroupCountFn = unsafe extern "C" fn(desc: ConvDesc, groups: i32) -> CudnnStatus;
type SetConvolutionMathTypeFn = unsafe extern "C" fn(desc: ConvDesc, math: i32) -> CudnnStatus;
type SetActivationFn = unsafe extern "C" fn(
    desc: ActivationDesc,
    mode: i32,
    nan_opt: i32,
    coef: f64,
) -> CudnnStatus;
pub(crate) type ConvolutionForwardFn = unsafe extern "C" fn(
    handle: CudnnHandle,
    alpha: *const c_void,
    x_desc: TensorDesc,
    x: *const c_void,
    w_desc: FilterDesc,
    w: *const c_void,
    conv_desc: ConvDesc,
    algo: i32,
    workspace: *mut c_void,
    workspace_bytes: usize,
    beta: *const c_void,
    y_desc: TensorDesc,
    y: *mut c_void,
) -> CudnnStatus;
pub(crate) type ConvolutionBackwardDataFn = unsafe extern "C" fn(
    handle: CudnnHandle,
    alpha: *const c_void,
    w_desc: FilterDesc,
    w: *const c_void,
    dy_desc: TensorDesc,
    dy: *const c_void,
    conv_desc: ConvDesc,
    algo: i32,
    workspace: *mut c_void,
    workspace_bytes: usize,
    beta: *const c_void,
    dx_desc: TensorDesc,
    dx: *mut c_void,
) -> CudnnStatus;
pub(crate) type ConvolutionBackwardFilterFn = unsafe extern "C" fn(
    handle: CudnnHandle,
    alpha: *const c_void,
    x_desc: TensorDesc,
    x: *const c_void,
    dy_desc: TensorDesc,
    dy: *const c_void,
    conv_desc: ConvDesc,
    algo: i32,
    workspace: *mut c_void,
    workspace_bytes: usize,
    beta: *const c_void,
    dw_desc: FilterDesc,
    dw: *mut c_void,
) -> CudnnStatus;
pub(crate) type ConvolutionBiasActivationForwardFn = unsafe extern "C" fn(
    handle: CudnnHandle,
    alpha1: *const c_void,
    x_desc: TensorDesc,
    x: *const c_void,
    w_desc: FilterDesc,
    w: *const c_void,
    conv_desc: ConvDesc,
    algo: i32,
    workspace: *mut c_void,
    workspace_bytes: usize,
    alpha2: *const c_void,
    z_desc: TensorDesc,
    z: *const c_void,
    bias_desc: TensorDesc,
    bias: *const c_void,
    activation_desc: ActivationDesc,
    y_desc: TensorDesc,
    y: *mut c_void,
) -> CudnnStatus;
pub(crate) type FindForwardExFn = unsafe extern "C" fn(
    handle: CudnnHandle,
    x_desc: TensorDesc,
    x: *const c_void,
    w_desc: FilterDesc,
    w: *const c_void,
    conv_desc: ConvDesc,
    y_desc: TensorDesc,
    y: *mut c_void,
    requested: i32,
    returned: *mut i32,
    results: *mut AlgoPerf,
    workspace: *mut c_void,
    workspace_bytes: usize,
) -> CudnnStatus;
pub(crate) type FindBackwardDataExFn = unsafe extern "C" fn(
    handle: CudnnHandle,
    w_desc: FilterDesc,
    w: *const c_void,
    dy_desc: TensorDesc,
    dy: *const c_void,
    conv_desc: ConvDesc,
    dx_desc: TensorDesc,
    dx: *mut c_void,
    requested: i32,
    returned: *mut i32,
    results: *mut AlgoPerf,
    workspace: *mut c_void,
    workspace_bytes: usize,
) -> CudnnStatus;
pub(crate) type FindBackwardFilterExFn = unsafe extern "C" fn(
    handle: CudnnHandle,
    x_desc: TensorDesc,
    x: *const c_void,
    dy_desc: TensorDesc,
    dy: *const c_void,
    conv_desc: ConvDesc,
    dw_desc: FilterDesc,
    dw: *mut c_void,
    requested: i32,
    returned: *mut i32,
    results: *mut AlgoPerf,
    workspace: *mut c_void,
    workspace_bytes: usize,
) -> CudnnStatus;

pub(crate) struct CudnnFns {
    create: CreateFn,
    destroy: DestroyFn,
    set_stream: SetStreamFn,
    get_error_string: GetErrorStringFn,
    create_tensor_desc: CreateDescFn,
    destroy_tensor_desc: DestroyDescFn,
    set_tensor_nd: SetTensorNdFn,
    create_filter_desc: CreateDescFn,
    destroy_filter_desc: DestroyDescFn,
    set_filter_nd: SetFilterNdFn,
    create_conv_desc: CreateDescFn,
    destroy_conv_desc: DestroyDescFn,
    set_convolution_nd: SetConvolutionNdFn,
    set_group_count: SetConvolutionGroupCountFn,
    set_math_type: SetConvolutionMathTypeFn,
    create_activation_desc: CreateDescFn,
    destroy_activation_desc: DestroyDescFn,
    set_activation: SetActivationFn,
    pub(crate) forward: ConvolutionForwardFn,
    pub(crate) backward_data: ConvolutionBackwardDataFn,
    pub(crate) backward_filter: ConvolutionBackwardFilterFn,
    pub(crate) bias_activation_forward: ConvolutionBiasActivationForwardFn,
    pub(crate) find_forward_ex: FindForwardExFn,
    pub(crate) find_backward_data_ex: FindBackwardDataExFn,
    pub(crate) find_backward_filter_ex: FindBackwardFilterExFn,
}

/// Loaded cuDNN library plus one handle.
///
/// cuDNN handles are not thread safe; every call that uses the handle or mutates a
/// descriptor goes through [`CudnnContext::lock`].
pub struct CudnnContext {
    lib: Arc<CudnnLibrary>,
    handle: Mutex<usize>,
    driver: Arc<CudaDriver>,
}

pub(crate) struct CudnnLibrary {
    _lib: Library,
    pub(crate) fns: CudnnFns,
}

/// Exclusive access to the cuDNN handle.
pub(crate) struct HandleGuard<'a> {
    guard: MutexGuard<'a, usize>,
    pub(crate) lib: &'a CudnnLibrary,
}

impl HandleGuard<'_> {
    pub(crate) fn raw(&self) -> CudnnHandle {
        *self.guard as CudnnHandle
    }

    pub(crate) fn set_stream(&self, stream: u64) -> ConvResult<()> {
        // SAFETY: the handle is live and exclusively borrowed; the stream comes from the
        // caller's run options.
        unsafe {
            self.lib.check(
                (self.lib.fns.set_stream)(self.raw(), stream as *mut c_void),
                "cudnnSetStream",
            )
        }
    }

    pub(crate) fn set_math_type(&self, desc: &ConvDescriptor, math_type: i32) -> ConvResult<()> {
        // SAFETY: the descriptor is live; descriptor mutation is serialized by the handle lock.
        unsafe {
            self.lib.check(
                (self.lib.fns.set_math_type)(desc.raw(), math_type),
                "cudnnSetConvolutionMathType",
            )
        }
    }
}

impl Drop for CudnnContext {
    fn drop(&mut self) {
        let handle = match self.handle.get_mut() {
            Ok(handle) => *handle,
            Err(poisoned) => *poisoned.into_inner(),
        };
        if handle != 0 {
            // SAFETY: the handle was created once by this context and is destroyed once.
            let _ = unsafe { (self.lib.fns.destroy)(handle as CudnnHandle) };
        }
    }
}

static CUDNN_CONTEXT: OnceLock<Result<Arc<CudnnContext>, String>> = OnceLock::new();

/// Process-wide cuDNN context on the process-wide CUDA driver.
pub fn cudnn() -> ConvResult<Arc<CudnnContext>> {
    let state = CUDNN_CONTEXT.get_or_init(|| {
        crate::device::driver()
            .and_then(CudnnContext::new)
            .map(Arc::new)
            .map_err(|err| err.to_string())
    });
    match state {
        Ok(ctx) => Ok(Arc::clone(ctx)),
        Err(message) => Err(ConvError::internal(format!(
            "cudnn runtime unavailable: {message}"
        ))),
    }
}

impl CudnnContext {
    pub fn new(driver: Arc<CudaDriver>) -> ConvResult<Self> {
        let lib = Arc::new(CudnnLibrary::load()?);
        driver.ensure_current()?;
        let mut handle: CudnnHandle = std::ptr::null_mut();
        // SAFETY: cudnnCreate initializes the out pointer.
        unsafe {
            lib.check((lib.fns.create)(&mut handle as *mut CudnnHandle), "cudnnCreate")?;
        }
        log::debug!("created cuDNN handle");
        Ok(Self {
            lib,
            handle: Mutex::new(handle as usize),
            driver,
        })
    }

    pub fn driver(&self) -> &Arc<CudaDriver> {
        &self.driver
    }

    pub(crate) fn lock(&self) -> ConvResult<HandleGuard<'_>> {
        self.driver.ensure_current()?;
        let guard = self
            .handle
            .lock()
            .map_err(|_| ConvError::internal("cudnn handle lock poisoned"))?;
        Ok(HandleGuard {
            guard,
            lib: &self.lib,
        })
    }

    pub(crate) fn tensor_descriptor(
        &self,
        data_type: i32,
        geometry: &TensorGeometry,
    ) -> ConvResult<TensorDescriptor> {
        let fns = &self.lib.fns;
        let desc = TensorDescriptor(self.create(
            fns.create_tensor_desc,
            fns.destroy_tensor_desc,
            "cudnnCreateTensorDescriptor",
        )?);
        // SAFETY: dims/strides outlive the call and hold `nb_dims` entries.
        unsafe {
            self.lib.check(
                (fns.set_tensor_nd)(
                    desc.raw(),
                    data_type,
                    geometry.dims.len() as i32,
                    geometry.dims.as_ptr(),
                    geometry.strides.as_ptr(),
                ),
                "cudnnSetTensorNdDescriptor",
            )?;
        }
        Ok(desc)
    }

    pub(crate) fn filter_descriptor(
        &self,
        data_type: i32,
        geometry: &FilterGeometry,
    ) -> ConvResult<FilterDescriptor> {
        let fns = &self.lib.fns;
        let desc = FilterDescriptor(self.create(
            fns.create_filter_desc,
            fns.destroy_filter_desc,
            "cudnnCreateFilterDescriptor",
        )?);
        // SAFETY: dims outlive the call and hold `nb_dims` entries.
        unsafe {
            self.lib.check(
                (fns.set_filter_nd)(
                    desc.raw(),
                    data_type,
                    geometry.format.as_raw(),
                    geometry.dims.len() as i32,
                    geometry.dims.as_ptr(),
                ),
                "cudnnSetFilterNdDescriptor",
            )?;
        }
        Ok(desc)
    }

    pub(crate) fn conv_descriptor(
        &self,
        geometry: &ConvGeometry,
        compute_type: i32,
        groups: i32,
        math_type: i32,
    ) -> ConvResult<ConvDescriptor> {
        let fns = &self.lib.fns;
        let desc = ConvDescriptor(self.create(
            fns.create_conv_desc,
            fns.destroy_conv_desc,
            "cudnnCreateConvolutionDescriptor",
        )?);
        // SAFETY: the span arrays outlive the call and hold `array_length` entries.
        unsafe {
            self.lib.check(
                (fns.set_convolution_nd)(
                    desc.raw(),
                    geometry.padding.len() as i32,
                    geometry.padding.as_ptr(),
                    geometry.strides.as_ptr(),
                    geometry.dilations.as_ptr(),
                    geometry.mode,
                    compute_type,
                ),
                "cudnnSetConvolutionNdDescriptor",
            )?;
            self.lib.check(
                (fns.set_group_count)(desc.raw(), groups),
                "cudnnSetConvolutionGroupCount",
            )?;
            self.lib.check(
                (fns.set_math_type)(desc.raw(), math_type),
                "cudnnSetConvolutionMathType",
            )?;
        }
        Ok(desc)
    }

    pub(crate) fn activation_descriptor(
        &self,
        mode: i32,
        coef: f64,
    ) -> ConvResult<ActivationDescriptor> {
        let fns = &self.lib.fns;
        let desc = ActivationDescriptor(self.create(
            fns.create_activation_desc,
            fns.destroy_activation_desc,
            "cudnnCreateActivationDescriptor",
        )?);
        // SAFETY: the descriptor was just created and is exclusively owned.
        unsafe {
            self.lib.check(
                (fns.set_activation)(desc.raw(), mode, CUDNN_NOT_PROPAGATE_NAN, coef),
                "cudnnSetActivationDescriptor",
            )?;
        }
        Ok(desc)
    }

    fn create(
        &self,
        create: CreateDescFn,
        destroy: DestroyDescFn,
        call: &str,
    ) -> ConvResult<RawDescriptor> {
        let mut raw: *mut c_void = std::ptr::null_mut();
        // SAFETY: `raw` is a valid out pointer.
        unsafe {
            self.lib.check(create(&mut raw as *mut *mut c_void), call)?;
        }
        Ok(RawDescriptor {
            raw: raw as usize,
            destroy,
            _lib: Arc::clone(&self.lib),
        })
    }
}

impl CudnnLibrary {
    fn load() -> ConvResult<Self> {
        let lib = load_cudnn_library()?;
        let fns = CudnnFns {
            create: load_cudnn_symbol(&lib, b"cudnnCreate\0")?,
            destroy: load_cudnn_symbol(&lib, b"cudnnDestroy\0")?,
            set_stream: load_cudnn_symbol(&lib, b"cudnnSetStream\0")?,
            get_error_string: load_cudnn_symbol(&lib, b"cudnnGetErrorString\0")?,
            create_tensor_desc: load_cudnn_symbol(&lib, b"cudnnCreateTensorDescriptor\0")?,
            destroy_tensor_desc: load_cudnn_symbol(&lib, b"cudnnDestroyTensorDescriptor\0")?,
            set_tensor_nd: load_cudnn_symbol(&lib, b"cudnnSetTensorNdDescriptor\0")?,
            create_filter_desc: load_cudnn_symbol(&lib, b"cudnnCreateFilterDescriptor\0")?,
            destroy_filter_desc: load_cudnn_symbol(&lib, b"cudnnDestroyFilterDescriptor\0")?,
            set_filter_nd: load_cudnn_symbol(&lib, b"cudnnSetFilterNdDescriptor\0")?,
            create_conv_desc: load_cudnn_symbol(&lib, b"cudnnCreateConvolutionDescriptor\0")?,
            destroy_conv_desc: load_cudnn_symbol(&lib, b"cudnnDestroyConvolutionDescriptor\0")?,
            set_convolution_nd: load_cudnn_symbol(&lib, b"cudnnSetConvolutionNdDescriptor\0")?,
            set_group_count: load_cudnn_symbol(&lib, b"cudnnSetConvolutionGroupCount\0")?,
            set_math_type: load_cudnn_symbol(&lib, b"cudnnSetConvolutionMathType\0")?,
            create_activation_desc: load_cudnn_symbol(
                &lib,
                b"cudnnCreateActivationDescriptor\0",
            )?,
            destroy_activation_desc: load_cudnn_symbol(
                &lib,
                b"cudnnDestroyActivationDescriptor\0",
            )?,
            set_activation: load_cudnn_symbol(&lib, b"cudnnSetActivationDescriptor\0")?,
            forward: load_cudnn_symbol(&lib, b"cudnnConvolutionForward\0")?,
            backward_data: load_cudnn_symbol(&lib, b"cudnnConvolutionBackwardData\0")?,
            backward_filter: load_cudnn_symbol(&lib, b"cudnnConvolutionBackwardFilter\0")?,
            bias_activation_forward: load_cudnn_symbol(
                &lib,
                b"cudnnConvolutionBiasActivationForward\0",
            )?,
            find_forward_ex: load_cudnn_symbol(
                &lib,
                b"cudnnFindConvolutionForwardAlgorithmEx\0",
            )?,
            find_backward_data_ex: load_cudnn_symbol(
                &lib,
                b"cudnnFindConvolutionBackwardDataAlgorithmEx\0",
            )?,
            find_backward_filter_ex: load_cudnn_symbol(
                &lib,
                b"cudnnFindConvolutionBackwardFilterAlgorithmEx\0",
            )?,
        };
        Ok(Self { _lib: lib, fns })
    }

    pub(crate) fn check(&self, status: CudnnStatus, call: &str) -> ConvResult<()> {
        if status == CUDNN_STATUS_SUCCESS {
            return Ok(());
        }
        // SAFETY: cudnnGetErrorString returns a static NUL-terminated string.
        let message = unsafe {
            let ptr = (self.fns.get_error_string)(status);
            if ptr.is_null() {
                String::new()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        };
        Err(ConvError::internal(format!(
            "cuDNN call {call} failed with status {status} {message}"
        )))
    }
}

/// Owned cuDNN descriptor of any kind, destroyed on drop.
pub(crate) struct RawDescriptor {
    raw: usize,
    destroy: DestroyDescFn,
    _lib: Arc<CudnnLibrary>,
}

impl Drop for RawDescriptor {
    fn drop(&mut self) {
        if self.raw != 0 {
            // SAFETY: the descriptor was created by the paired create call and is destroyed once.
            let _ = unsafe { (self.destroy)(self.raw as *mut c_void) };
            self.raw = 0;
        }
    }
}

macro_rules! descriptor_type {
    ($name:ident, $raw:ty) => {
        pub(crate) struct $name(RawDescriptor);

        impl $name {
            pub(crate) fn raw(&self) -> $raw {
                self.0.raw as $raw
            }
        }
    };
}

descriptor_type!(TensorDescriptor, TensorDesc);
descriptor_type!(FilterDescriptor, FilterDesc);
descriptor_type!(ConvDescriptor, ConvDesc);
descriptor_type!(ActivationDescriptor, ActivationDesc);

const CUDNN_LIBRARIES: [&str; 5] = [
    "libcudnn.so.9",
    "libcudnn.so.8",
    "libcudnn.so",
    "cudnn64_9.dll",
    "cudnn64_8.dll",
];

fn load_cudnn_library() -> ConvResult<Library> {
    for name in CUDNN_LIBRARIES {
        // SAFETY: dynamic library probing only.
        if let Ok(lib) = unsafe { Library::new(name) } {
            log::debug!("loaded cuDNN from {name}");
            return Ok(lib);
        }
    }
    Err(ConvError::internal(format!(
        "no cuDNN library found (tried {})",
        CUDNN_LIBRARIES.join(", ")
    )))
}

fn load_cudnn_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> ConvResult<T> {
    // SAFETY: symbol type is expected to match the cuDNN API.
    let symbol = unsafe { lib.get::<T>(name) }.map_err(|err| {
        ConvError::internal(format!(
            "failed to resolve cuDNN symbol {}: {err}",
            String::from_utf8_lossy(name)
        ))
    })?;
    Ok(*symbol)
}
