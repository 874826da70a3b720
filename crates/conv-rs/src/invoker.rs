use smallvec::SmallVec;

use crate::buffer::{DeviceAddress, FlatView, StridedView};
use crate::cache::CachedRunner;
use crate::device::{ConvLaunch, ConvPrimitive, OwnedDeviceMemory, RunOptions};
use crate::error::{ConvError, ConvResult};

/// Argument views of one convolution call, in calling-convention roles.
#[derive(Debug, Clone, Copy)]
pub struct ConvCall<'a> {
    pub operand0: &'a StridedView,
    pub operand1: &'a StridedView,
    pub bias: Option<&'a FlatView>,
    pub side_input: Option<&'a StridedView>,
    pub extra_operands: &'a [StridedView],
    /// Main result first, then auxiliary outputs.
    pub outputs: &'a [StridedView],
    pub scratch: &'a FlatView,
}

/// Device addresses in the order the device primitive expects them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvBuffers {
    pub operands: SmallVec<[DeviceAddress; 8]>,
    pub results: SmallVec<[DeviceAddress; 4]>,
    pub scratch: DeviceAddress,
}

impl ConvBuffers {
    /// operand0, operand1, [bias], [side input], [extra operands]; outputs; scratch.
    pub fn assemble(call: &ConvCall<'_>) -> Self {
        let mut operands = SmallVec::new();
        operands.push(call.operand0.address);
        operands.push(call.operand1.address);
        if let Some(bias) = call.bias {
            operands.push(bias.address);
        }
        if let Some(side_input) = call.side_input {
            operands.push(side_input.address);
        }
        operands.extend(call.extra_operands.iter().map(|operand| operand.address));

        Self {
            operands,
            results: call.outputs.iter().map(|output| output.address).collect(),
            scratch: call.scratch.address,
        }
    }
}

/// Runs the cached runner, growing scratch for this call when `scratch_size` exceeds the
/// static scratch buffer. Grown scratch is released when the call returns.
pub(crate) fn execute(
    primitive: &dyn ConvPrimitive,
    runner: &CachedRunner,
    buffers: &ConvBuffers,
    scratch_size: u64,
    options: &RunOptions<'_>,
) -> ConvResult<()> {
    if scratch_size > buffers.scratch.size {
        log::debug!(
            "growing conv scratch from {} to {scratch_size} bytes on device ordinal {}",
            buffers.scratch.size,
            options.device_ordinal
        );
        let grown =
            OwnedDeviceMemory::allocate(options.allocator, options.device_ordinal, scratch_size)
                .map_err(|err| err.context("scratch allocation"))?;
        let scratch = DeviceAddress::new(grown.address().ptr, scratch_size);
        return launch(primitive, runner, buffers, scratch, options);
    }
    launch(primitive, runner, buffers, buffers.scratch, options)
}

fn launch(
    primitive: &dyn ConvPrimitive,
    runner: &CachedRunner,
    buffers: &ConvBuffers,
    scratch: DeviceAddress,
    options: &RunOptions<'_>,
) -> ConvResult<()> {
    let algorithm = runner.algorithm()?;
    primitive.run(&ConvLaunch {
        config: runner.config(),
        plan: runner.plan(),
        algorithm: &algorithm,
        operands: &buffers.operands,
        results: &buffers.results,
        scratch,
        stream: options.stream,
    })?;
    if !options.stream.is_ok() {
        log::warn!(
            "device stream on ordinal {} is in an error state after {} convolution",
            options.device_ordinal,
            runner.config().kind.as_str()
        );
        return Err(ConvError::internal("run options stream not ok"));
    }
    Ok(())
}
