//! Runtime autotuning fallback for calls compiled without an algorithm choice.

use std::sync::Arc;
use std::time::Duration;

use crate::buffer::DeviceAddress;
use crate::cache::{CachedRunner, RunnerState};
use crate::config::ConvConfig;
use crate::descriptor::AlgorithmDesc;
use crate::device::{
    CompiledConv, ConvPrimitive, DeviceAllocator, DeviceContext, DeviceStream, RunOptions,
};
use crate::error::{ConvError, ConvResult};
use crate::invoker::ConvBuffers;
use crate::options::DebugOptions;

/// Device and allocator a benchmarking pass may use for temporary buffers.
#[derive(Clone, Copy)]
pub struct DeviceConfig<'a> {
    pub device: DeviceContext,
    pub device_ordinal: i32,
    pub allocator: &'a Arc<dyn DeviceAllocator>,
}

#[derive(Clone, Copy)]
pub struct AutotuneConfig<'a> {
    pub device_config: DeviceConfig<'a>,
    pub autotune_level: u32,
    pub deterministic_ops: bool,
    pub scratch_limit_bytes: u64,
}

impl<'a> AutotuneConfig<'a> {
    pub fn new(device_config: DeviceConfig<'a>, debug_options: &DebugOptions) -> Self {
        Self {
            device_config,
            autotune_level: debug_options.autotune_level,
            deterministic_ops: debug_options.deterministic_ops,
            scratch_limit_bytes: debug_options.autotune_scratch_limit_bytes,
        }
    }

    /// Level 0 turns the runtime autotuner off.
    pub fn is_enabled(&self) -> bool {
        self.autotune_level > 0
    }

    /// From level 2 on, result buffers are zeroed before candidates are timed.
    pub fn should_init_buffers(&self) -> bool {
        self.autotune_level >= 2
    }
}

/// Winner of a benchmarking pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AutotuneResult {
    pub algo_id: i64,
    pub tensor_ops_enabled: bool,
    pub scratch_bytes: u64,
    pub run_time: Option<Duration>,
}

/// Everything a primitive needs to benchmark candidates on the call's real buffers.
pub struct BenchmarkRequest<'a> {
    pub config: &'a ConvConfig,
    pub plan: &'a dyn CompiledConv,
    pub autotune: &'a AutotuneConfig<'a>,
    pub operands: &'a [DeviceAddress],
    pub results: &'a [DeviceAddress],
    pub stream: &'a dyn DeviceStream,
}

/// Makes sure `runner` carries a tuned algorithm and returns the scratch bytes it needs.
///
/// A runner is tuned once; later calls reuse the stored algorithm and its workspace size.
/// Two callers racing on an untuned runner may both benchmark, last write wins.
pub(crate) fn ensure_tuned(
    primitive: &dyn ConvPrimitive,
    runner: &CachedRunner,
    buffers: &ConvBuffers,
    options: &RunOptions<'_>,
) -> ConvResult<u64> {
    if runner.state() == RunnerState::AlgorithmRefined {
        let algorithm = runner.algorithm()?;
        return Ok(algorithm.workspace_size.unwrap_or(buffers.scratch.size));
    }
    let result = pick_best_algorithm(primitive, runner, buffers, options)?;
    if result.algo_id < 0 {
        return Err(ConvError::internal(format!(
            "runtime autotuner returned invalid algorithm id {}",
            result.algo_id
        )));
    }
    log::info!(
        "runtime autotuning picked algorithm {} (tensor ops: {}, scratch: {} bytes) for {} convolution",
        result.algo_id,
        result.tensor_ops_enabled,
        result.scratch_bytes,
        runner.config().kind.as_str()
    );
    let mut algorithm = AlgorithmDesc::new(result.algo_id, result.tensor_ops_enabled);
    algorithm.workspace_size = Some(result.scratch_bytes);
    runner.set_algorithm(algorithm)?;
    Ok(result.scratch_bytes)
}

#[cfg(feature = "runtime-autotune")]
fn pick_best_algorithm(
    primitive: &dyn ConvPrimitive,
    runner: &CachedRunner,
    buffers: &ConvBuffers,
    options: &RunOptions<'_>,
) -> ConvResult<AutotuneResult> {
    let device_config = DeviceConfig {
        device: options.device,
        device_ordinal: options.device_ordinal,
        allocator: options.allocator,
    };
    let autotune = AutotuneConfig::new(device_config, options.debug_options);
    if !autotune.is_enabled() {
        return Err(ConvError::internal(
            "failed to run runtime autotuner: autotuning is disabled at autotune level 0",
        ));
    }
    let request = BenchmarkRequest {
        config: runner.config(),
        plan: runner.plan(),
        autotune: &autotune,
        operands: &buffers.operands,
        results: &buffers.results,
        stream: options.stream,
    };
    primitive
        .benchmark(&request)
        .map_err(|err| err.context("runtime autotuning"))
}

#[cfg(not(feature = "runtime-autotune"))]
fn pick_best_algorithm(
    _primitive: &dyn ConvPrimitive,
    _runner: &CachedRunner,
    _buffers: &ConvBuffers,
    _options: &RunOptions<'_>,
) -> ConvResult<AutotuneResult> {
    Err(ConvError::internal(
        "failed to run runtime autotuner: this build has no runtime autotuning support",
    ))
}
