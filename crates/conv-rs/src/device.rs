//! Contracts with the device-side collaborators: compute primitive, stream, allocator.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::autotune::{AutotuneResult, BenchmarkRequest};
use crate::buffer::DeviceAddress;
use crate::config::ConvConfig;
use crate::descriptor::AlgorithmDesc;
use crate::error::{ConvError, ConvResult};
use crate::options::DebugOptions;

/// Identity of one device executor. Each context gets its own runner table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceContext(u64);

impl DeviceContext {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Queue that device work is enqueued on.
pub trait DeviceStream: Send + Sync {
    /// `false` once the stream entered an error state; all later work on it is invalid.
    fn is_ok(&self) -> bool;

    /// Native stream handle, `0` for the default stream.
    fn raw_handle(&self) -> u64 {
        0
    }
}

/// Device memory allocator owned by the host runtime.
pub trait DeviceAllocator: Send + Sync {
    fn allocate(&self, device_ordinal: i32, bytes: u64) -> ConvResult<DeviceAddress>;

    fn deallocate(&self, device_ordinal: i32, address: DeviceAddress);
}

/// Device memory released back to its allocator when dropped.
pub struct OwnedDeviceMemory {
    allocator: Arc<dyn DeviceAllocator>,
    device_ordinal: i32,
    address: DeviceAddress,
}

impl OwnedDeviceMemory {
    pub fn allocate(
        allocator: &Arc<dyn DeviceAllocator>,
        device_ordinal: i32,
        bytes: u64,
    ) -> ConvResult<Self> {
        let address = allocator.allocate(device_ordinal, bytes)?;
        if address.size < bytes {
            allocator.deallocate(device_ordinal, address);
            return Err(ConvError::internal(format!(
                "allocator returned {} bytes for a request of {bytes}",
                address.size
            )));
        }
        Ok(Self {
            allocator: Arc::clone(allocator),
            device_ordinal,
            address,
        })
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }
}

impl fmt::Debug for OwnedDeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedDeviceMemory")
            .field("device_ordinal", &self.device_ordinal)
            .field("address", &self.address)
            .finish()
    }
}

impl Drop for OwnedDeviceMemory {
    fn drop(&mut self) {
        self.allocator.deallocate(self.device_ordinal, self.address);
    }
}

/// Primitive-specific compiled plan. Opaque to the dispatcher.
pub trait CompiledConv: Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

/// One invocation of a compiled plan.
pub struct ConvLaunch<'a> {
    pub config: &'a ConvConfig,
    pub plan: &'a dyn CompiledConv,
    pub algorithm: &'a AlgorithmDesc,
    /// operand0, operand1, [bias], [side input], [extra fusion operands].
    pub operands: &'a [DeviceAddress],
    /// Main result first, then auxiliary outputs.
    pub results: &'a [DeviceAddress],
    pub scratch: DeviceAddress,
    pub stream: &'a dyn DeviceStream,
}

/// The device convolution library.
pub trait ConvPrimitive: Send + Sync {
    fn name(&self) -> &str;

    /// Builds the reusable plan for a config. Called at most once per cached runner.
    fn compile(&self, config: &ConvConfig) -> ConvResult<Arc<dyn CompiledConv>>;

    /// Enqueues the convolution. Returns once the work is enqueued.
    fn run(&self, launch: &ConvLaunch<'_>) -> ConvResult<()>;

    /// Times candidate algorithms on the given buffers and returns the best one.
    fn benchmark(&self, request: &BenchmarkRequest<'_>) -> ConvResult<AutotuneResult> {
        let _ = request;
        Err(ConvError::unimplemented(
            "benchmark",
            format!("device primitive `{}` cannot benchmark algorithms", self.name()),
        ))
    }
}

/// Per-call execution context supplied by the host runtime.
#[derive(Clone, Copy)]
pub struct RunOptions<'a> {
    pub device: DeviceContext,
    pub device_ordinal: i32,
    pub stream: &'a dyn DeviceStream,
    pub allocator: &'a Arc<dyn DeviceAllocator>,
    pub debug_options: &'a DebugOptions,
}
