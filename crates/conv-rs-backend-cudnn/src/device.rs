use std::ffi::c_void;
use std::fmt;
use std::sync::{Arc, OnceLock};

use conv_rs::{ConvError, ConvResult, DeviceAddress, DeviceAllocator, DeviceStream};
use libloading::Library;

type CuResult = i32;
type CuDevice = i32;
type CuContext = *mut c_void;
type CuDevicePtr = u64;
type CuStream = *mut c_void;

const CUDA_SUCCESS: CuResult = 0;
const CUDA_ERROR_OUT_OF_MEMORY: CuResult = 2;
const CUDA_ERROR_NOT_READY: CuResult = 600;
const CU_STREAM_NON_BLOCKING: u32 = 1;

const DRIVER_LIBRARIES: [&str; 4] = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];

type InitFn = unsafe extern "C" fn(u32) -> CuResult;
type DeviceGetFn = unsafe extern "C" fn(*mut CuDevice, i32) -> CuResult;
type CtxCreateFn = unsafe extern "C" fn(*mut CuContext, u32, CuDevice) -> CuResult;
type CtxFn = unsafe extern "C" fn(CuContext) -> CuResult;
type MemAllocFn = unsafe extern "C" fn(*mut CuDevicePtr, usize) -> CuResult;
type MemFreeFn = unsafe extern "C" fn(CuDevicePtr) -> CuResult;
type CopyToDeviceFn = unsafe extern "C" fn(CuDevicePtr, *const c_void, usize) -> CuResult;
type CopyToHostFn = unsafe extern "C" fn(*mut c_void, CuDevicePtr, usize) -> CuResult;
type MemsetFn = unsafe extern "C" fn(CuDevicePtr, u8, usize) -> CuResult;
type MemsetAsyncFn = unsafe extern "C" fn(CuDevicePtr, u8, usize, CuStream) -> CuResult;
type StreamCreateFn = unsafe extern "C" fn(*mut CuStream, u32) -> CuResult;
type StreamFn = unsafe extern "C" fn(CuStream) -> CuResult;

/// Driver entry points used by the convolution backend.
struct DriverFns {
    init: InitFn,
    device_get: DeviceGetFn,
    ctx_create: CtxCreateFn,
    ctx_destroy: CtxFn,
    ctx_set_current: CtxFn,
    mem_alloc: MemAllocFn,
    mem_free: MemFreeFn,
    copy_to_device: CopyToDeviceFn,
    copy_to_host: CopyToHostFn,
    memset: MemsetFn,
    memset_async: MemsetAsyncFn,
    stream_create: StreamCreateFn,
    stream_destroy: StreamFn,
    stream_query: StreamFn,
    stream_synchronize: StreamFn,
}

impl DriverFns {
    fn load(lib: &Library) -> ConvResult<Self> {
        Ok(Self {
            init: load_symbol(lib, b"cuInit\0")?,
            device_get: load_symbol(lib, b"cuDeviceGet\0")?,
            ctx_create: load_symbol(lib, b"cuCtxCreate_v2\0")?,
            ctx_destroy: load_symbol(lib, b"cuCtxDestroy_v2\0")?,
            ctx_set_current: load_symbol(lib, b"cuCtxSetCurrent\0")?,
            mem_alloc: load_symbol(lib, b"cuMemAlloc_v2\0")?,
            mem_free: load_symbol(lib, b"cuMemFree_v2\0")?,
            copy_to_device: load_symbol(lib, b"cuMemcpyHtoD_v2\0")?,
            copy_to_host: load_symbol(lib, b"cuMemcpyDtoH_v2\0")?,
            memset: load_symbol(lib, b"cuMemsetD8_v2\0")?,
            memset_async: load_symbol(lib, b"cuMemsetD8Async\0")?,
            stream_create: load_symbol(lib, b"cuStreamCreate\0")?,
            stream_destroy: load_symbol(lib, b"cuStreamDestroy_v2\0")?,
            stream_query: load_symbol(lib, b"cuStreamQuery\0")?,
            stream_synchronize: load_symbol(lib, b"cuStreamSynchronize\0")?,
        })
    }
}

/// CUDA driver API bound to one context on device ordinal 0.
pub struct CudaDriver {
    _lib: Library,
    fns: DriverFns,
    // Raw handles are kept as usize so the driver is Send + Sync.
    ctx: usize,
    ordinal: i32,
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        if self.ctx == 0 {
            return;
        }
        // SAFETY: the context is owned by this driver and destroyed once.
        let code = unsafe { (self.fns.ctx_destroy)(self.context()) };
        if code != CUDA_SUCCESS {
            log::warn!("cuCtxDestroy_v2 failed with code {code}");
        }
    }
}

impl fmt::Debug for CudaDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaDriver")
            .field("ordinal", &self.ordinal)
            .finish()
    }
}

static CUDA_DRIVER: OnceLock<ConvResult<Arc<CudaDriver>>> = OnceLock::new();

/// `true` when the CUDA driver library loads and a context can be created.
pub fn is_available() -> bool {
    driver().is_ok()
}

/// Process-wide driver, created on first use. A failed initialization is not retried.
pub fn driver() -> ConvResult<Arc<CudaDriver>> {
    CUDA_DRIVER
        .get_or_init(|| CudaDriver::open(0).map(Arc::new))
        .clone()
        .map_err(|err| err.context("CUDA driver unavailable"))
}

impl CudaDriver {
    fn open(ordinal: i32) -> ConvResult<Self> {
        let lib = load_cuda_library()?;
        let fns = DriverFns::load(&lib)?;
        let mut device: CuDevice = 0;
        let mut ctx: CuContext = std::ptr::null_mut();
        // SAFETY: out pointers are valid locals; calls follow the driver API contract.
        unsafe {
            check_cuda((fns.init)(0), "cuInit")?;
            check_cuda((fns.device_get)(&mut device, ordinal), "cuDeviceGet")?;
            check_cuda((fns.ctx_create)(&mut ctx, 0, device), "cuCtxCreate_v2")?;
        }
        let driver = Self {
            _lib: lib,
            fns,
            ctx: ctx as usize,
            ordinal,
        };
        driver.ensure_current()?;
        log::debug!("created CUDA context on device ordinal {ordinal}");
        Ok(driver)
    }

    pub fn ordinal(&self) -> i32 {
        self.ordinal
    }

    pub fn ensure_current(&self) -> ConvResult<()> {
        // SAFETY: the context was created by this driver and lives until drop.
        unsafe {
            check_cuda(
                (self.fns.ctx_set_current)(self.context()),
                "cuCtxSetCurrent",
            )
        }
    }

    /// Raw allocation; the caller owns the returned pointer.
    pub fn mem_alloc(&self, bytes: usize) -> ConvResult<u64> {
        self.ensure_current()?;
        let mut ptr: CuDevicePtr = 0;
        // SAFETY: `ptr` is a valid out pointer.
        let code = unsafe { (self.fns.mem_alloc)(&mut ptr, bytes) };
        match code {
            CUDA_SUCCESS => Ok(ptr),
            CUDA_ERROR_OUT_OF_MEMORY => Err(ConvError::resource_exhausted(format!(
                "cuMemAlloc_v2 could not allocate {bytes} bytes"
            ))),
            code => Err(ConvError::internal(format!(
                "cuMemAlloc_v2 returned CUDA error {code}"
            ))),
        }
    }

    pub fn mem_free(&self, ptr: u64) -> ConvResult<()> {
        if ptr == 0 {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: `ptr` was returned by `mem_alloc` and is freed once by its owner.
        unsafe { check_cuda((self.fns.mem_free)(ptr), "cuMemFree_v2") }
    }

    pub fn alloc_and_upload(self: &Arc<Self>, bytes: &[u8]) -> ConvResult<DeviceBuffer> {
        let buffer = self.alloc(bytes.len())?;
        if !bytes.is_empty() {
            // SAFETY: destination holds `bytes.len()` bytes and the host slice is valid.
            unsafe {
                check_cuda(
                    (self.fns.copy_to_device)(buffer.ptr, bytes.as_ptr().cast(), bytes.len()),
                    "cuMemcpyHtoD_v2",
                )?;
            }
        }
        Ok(buffer)
    }

    pub fn alloc_zeroed(self: &Arc<Self>, bytes: usize) -> ConvResult<DeviceBuffer> {
        let buffer = self.alloc(bytes)?;
        if bytes != 0 {
            // SAFETY: memset count is bounded by the allocation size.
            unsafe {
                check_cuda(
                    (self.fns.memset)(buffer.ptr, 0, bytes),
                    "cuMemsetD8_v2",
                )?;
            }
        }
        Ok(buffer)
    }

    /// Enqueues a zero fill of `bytes` at `ptr` on the raw stream handle `stream`.
    pub fn zero_async(&self, ptr: u64, bytes: usize, stream: u64) -> ConvResult<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.ensure_current()?;
        // SAFETY: the caller owns a device range of at least `bytes` at `ptr`.
        unsafe {
            check_cuda(
                (self.fns.memset_async)(ptr, 0, bytes, stream as CuStream),
                "cuMemsetD8Async",
            )
        }
    }

    pub fn download(&self, ptr: u64, bytes: usize) -> ConvResult<Vec<u8>> {
        self.ensure_current()?;
        let mut host = vec![0u8; bytes];
        if bytes != 0 {
            // SAFETY: the device range is valid for `bytes`; the host buffer is writable.
            unsafe {
                check_cuda(
                    (self.fns.copy_to_host)(host.as_mut_ptr().cast(), ptr, bytes),
                    "cuMemcpyDtoH_v2",
                )?;
            }
        }
        Ok(host)
    }

    fn alloc(self: &Arc<Self>, bytes: usize) -> ConvResult<DeviceBuffer> {
        let ptr = self.mem_alloc(bytes)?;
        Ok(DeviceBuffer {
            driver: Arc::clone(self),
            ptr,
            bytes,
        })
    }

    pub fn create_stream(self: &Arc<Self>) -> ConvResult<CudaStream> {
        self.ensure_current()?;
        let mut stream: CuStream = std::ptr::null_mut();
        // SAFETY: `stream` is a valid out pointer.
        unsafe {
            check_cuda(
                (self.fns.stream_create)(&mut stream, CU_STREAM_NON_BLOCKING),
                "cuStreamCreate",
            )?;
        }
        Ok(CudaStream {
            driver: Arc::clone(self),
            stream: stream as usize,
        })
    }

    fn context(&self) -> CuContext {
        self.ctx as CuContext
    }
}

/// Device allocation freed on drop. Used for test data and benchmarking buffers.
pub struct DeviceBuffer {
    driver: Arc<CudaDriver>,
    ptr: CuDevicePtr,
    bytes: usize,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl DeviceBuffer {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn device_ptr(&self) -> u64 {
        self.ptr
    }

    pub fn address(&self) -> DeviceAddress {
        DeviceAddress::new(self.ptr, self.bytes as u64)
    }

    pub fn read_to_vec(&self) -> ConvResult<Vec<u8>> {
        self.driver.download(self.ptr, self.bytes)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.driver.mem_free(self.ptr) {
            log::warn!("failed to free device buffer {:#x}: {err}", self.ptr);
        }
    }
}

/// Owned CUDA stream. Reports unhealthy once the stream has recorded an error.
pub struct CudaStream {
    driver: Arc<CudaDriver>,
    stream: usize,
}

impl fmt::Debug for CudaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaStream")
            .field("stream", &self.stream)
            .finish()
    }
}

impl CudaStream {
    pub fn synchronize(&self) -> ConvResult<()> {
        self.driver.ensure_current()?;
        // SAFETY: the stream is owned by this value and valid until drop.
        unsafe {
            check_cuda(
                (self.driver.fns.stream_synchronize)(self.handle()),
                "cuStreamSynchronize",
            )
        }
    }

    fn handle(&self) -> CuStream {
        self.stream as CuStream
    }
}

impl DeviceStream for CudaStream {
    fn is_ok(&self) -> bool {
        if self.driver.ensure_current().is_err() {
            return false;
        }
        // SAFETY: the stream is owned by this value and valid until drop.
        let code = unsafe { (self.driver.fns.stream_query)(self.handle()) };
        matches!(code, CUDA_SUCCESS | CUDA_ERROR_NOT_READY)
    }

    fn raw_handle(&self) -> u64 {
        self.stream as u64
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        // SAFETY: the stream is destroyed once by its owner.
        let code = unsafe { (self.driver.fns.stream_destroy)(self.handle()) };
        if code != CUDA_SUCCESS {
            log::warn!("cuStreamDestroy_v2 failed with code {code}");
        }
    }
}

/// [`DeviceAllocator`] backed by `cuMemAlloc`/`cuMemFree` on the driver's device.
#[derive(Debug, Clone)]
pub struct CudaAllocator {
    driver: Arc<CudaDriver>,
}

impl CudaAllocator {
    pub fn new(driver: Arc<CudaDriver>) -> Self {
        Self { driver }
    }

    fn check_ordinal(&self, device_ordinal: i32) -> ConvResult<()> {
        if device_ordinal != self.driver.ordinal() {
            return Err(ConvError::invalid_argument(format!(
                "allocator serves device ordinal {}, got request for {device_ordinal}",
                self.driver.ordinal()
            )));
        }
        Ok(())
    }
}

impl DeviceAllocator for CudaAllocator {
    fn allocate(&self, device_ordinal: i32, bytes: u64) -> ConvResult<DeviceAddress> {
        self.check_ordinal(device_ordinal)?;
        let len = usize::try_from(bytes).map_err(|_| {
            ConvError::resource_exhausted(format!("{bytes} bytes exceed the host address space"))
        })?;
        let ptr = self.driver.mem_alloc(len)?;
        Ok(DeviceAddress::new(ptr, bytes))
    }

    fn deallocate(&self, device_ordinal: i32, address: DeviceAddress) {
        if self.check_ordinal(device_ordinal).is_err() {
            log::warn!(
                "dropping deallocation of {:#x} for foreign device ordinal {device_ordinal}",
                address.ptr
            );
            return;
        }
        if let Err(err) = self.driver.mem_free(address.ptr) {
            log::warn!("failed to free device memory {:#x}: {err}", address.ptr);
        }
    }
}

fn load_cuda_library() -> ConvResult<Library> {
    DRIVER_LIBRARIES
        .iter()
        // SAFETY: library probe only; no symbols are invoked here.
        .find_map(|name| unsafe { Library::new(name) }.ok())
        .ok_or_else(|| {
            ConvError::internal(format!(
                "no CUDA driver library found (tried {})",
                DRIVER_LIBRARIES.join(", ")
            ))
        })
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> ConvResult<T> {
    // SAFETY: the caller names the symbol with its driver API signature.
    match unsafe { lib.get::<T>(name) } {
        Ok(symbol) => Ok(*symbol),
        Err(err) => Err(ConvError::internal(format!(
            "CUDA symbol {} is missing: {err}",
            String::from_utf8_lossy(&name[..name.len().saturating_sub(1)])
        ))),
    }
}

fn check_cuda(code: CuResult, op: &str) -> ConvResult<()> {
    match code {
        CUDA_SUCCESS => Ok(()),
        code => Err(ConvError::internal(format!("{op} returned CUDA error {code}"))),
    }
}
