//! Convolution execution dispatcher for compiled numerical programs.
//!
//! A convolution custom call arrives with argument views and decoded attributes. The
//! dispatcher builds a [`descriptor::ConvolutionDescriptor`] on the first call for a
//! `(device, uid)` pair, compiles it through the device [`device::ConvPrimitive`] and
//! caches the resulting runner. Calls compiled without an algorithm choice are autotuned
//! at runtime, and scratch memory is grown per call when the chosen algorithm needs more
//! than the compiler reserved.

pub mod attrs;
pub mod autotune;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod invoker;
pub mod options;
pub mod registry;
pub mod shape;

pub use attrs::{
    ActivationMode, ConvBackendConfig, ConvCallAttrs, ConvCustomCallAttrs, ConvDimensionNumbers,
    WindowAttrs,
};
pub use buffer::{CallArg, DeviceAddress, FlatView, StridedView};
pub use cache::{CachedRunner, RunnerCache, RunnerCacheStats, RunnerState};
pub use descriptor::{AlgorithmDesc, ConvKind, ConvolutionDescriptor};
pub use device::{
    CompiledConv, ConvLaunch, ConvPrimitive, DeviceAllocator, DeviceContext, DeviceStream,
    OwnedDeviceMemory, RunOptions,
};
pub use dispatch::{ConvArgs, ConvDispatcher, FusedConvArgs, GraphConvArgs};
pub use error::{ConvError, ConvResult, ErrorKind};
pub use options::DebugOptions;
pub use registry::{register_conv_custom_calls, CustomCallRegistry};
pub use shape::{ElementType, Layout, Shape};
