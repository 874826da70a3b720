//! cuDNN device primitive for `conv-rs`.
//!
//! The CUDA driver and cuDNN are loaded with `libloading` on first use, so the crate builds and
//! links on hosts without a GPU. Call [`is_available`] before touching the device.

mod cudnn;
mod device;
pub(crate) mod layout;
mod primitive;

use std::sync::Arc;

use conv_rs::{ConvResult, DebugOptions, DeviceAllocator, DeviceContext, DeviceStream, RunOptions};

pub use cudnn::{cudnn, CudnnContext};
pub use device::{driver, is_available, CudaAllocator, CudaDriver, CudaStream, DeviceBuffer};
pub use primitive::{CudnnConvPlan, CudnnConvPrimitive};

/// Everything a host runtime needs to dispatch convolutions on the process GPU.
#[derive(Clone)]
pub struct CudnnDevice {
    pub context: DeviceContext,
    pub primitive: Arc<CudnnConvPrimitive>,
    pub allocator: Arc<dyn DeviceAllocator>,
}

impl CudnnDevice {
    /// Binds the process CUDA context. `DeviceContext` is keyed by the device ordinal.
    pub fn open() -> ConvResult<Self> {
        let context = cudnn()?;
        let driver = Arc::clone(context.driver());
        let ordinal = driver.ordinal();
        Ok(Self {
            context: DeviceContext::new(ordinal as u64),
            primitive: Arc::new(CudnnConvPrimitive::new(context)),
            allocator: Arc::new(CudaAllocator::new(driver)),
        })
    }

    pub fn ordinal(&self) -> i32 {
        self.primitive.context().driver().ordinal()
    }

    /// Per-call options on `stream` with the process-wide `CONV_RS_*` debug options.
    pub fn run_options<'a>(&'a self, stream: &'a dyn DeviceStream) -> RunOptions<'a> {
        RunOptions {
            device: self.context,
            device_ordinal: self.ordinal(),
            stream,
            allocator: &self.allocator,
            debug_options: DebugOptions::process(),
        }
    }
}
