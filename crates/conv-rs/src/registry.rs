//! Name -> handler table the host runtime dispatches convolution custom calls through.

use std::collections::HashMap;

use crate::attrs::{required, ConvCustomCallAttrs};
use crate::buffer::{CallArg, FlatView, FromCallArg, StridedView};
use crate::descriptor::ConvKind;
use crate::device::RunOptions;
use crate::dispatch::{ConvArgs, ConvDispatcher, FusedConvArgs, GraphConvArgs};
use crate::error::{ConvError, ConvResult};

pub const CONV_FORWARD: &str = "gpu.conv.forward";
pub const CONV_BACKWARD_INPUT: &str = "gpu.conv.backward.input";
pub const CONV_BACKWARD_FILTER: &str = "gpu.conv.backward.filter";
pub const CONV_FORWARD_FUSED: &str = "gpu.conv.forward.fused";
pub const CONV_FORWARD_FUSED_SIDE_INPUT: &str = "gpu.conv.forward.fused.side_input";
pub const CONV_FORWARD_GRAPH: &str = "gpu.conv.forward.graph";

/// Signature every registered convolution handler has.
pub type ConvHandler =
    fn(&ConvDispatcher, &RunOptions<'_>, &[CallArg], &ConvCustomCallAttrs) -> ConvResult<()>;

#[derive(Default)]
pub struct CustomCallRegistry {
    handlers: HashMap<String, ConvHandler>,
}

impl CustomCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, returning the handler it replaced.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: ConvHandler,
    ) -> Option<ConvHandler> {
        self.handlers.insert(name.into(), handler)
    }

    pub fn get(&self, name: &str) -> Option<ConvHandler> {
        self.handlers.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn call(
        &self,
        name: &str,
        dispatcher: &ConvDispatcher,
        options: &RunOptions<'_>,
        args: &[CallArg],
        attrs: &ConvCustomCallAttrs,
    ) -> ConvResult<()> {
        let handler = self.get(name).ok_or_else(|| {
            ConvError::unimplemented("custom_call", format!("no handler registered for `{name}`"))
        })?;
        handler(dispatcher, options, args, attrs)
    }
}

/// Registers the six convolution custom calls.
pub fn register_conv_custom_calls(registry: &mut CustomCallRegistry) {
    registry.register(CONV_FORWARD, conv_forward);
    registry.register(CONV_BACKWARD_INPUT, conv_backward_input);
    registry.register(CONV_BACKWARD_FILTER, conv_backward_filter);
    registry.register(CONV_FORWARD_FUSED, conv_forward_fused);
    registry.register(CONV_FORWARD_FUSED_SIDE_INPUT, conv_forward_fused_side_input);
    registry.register(CONV_FORWARD_GRAPH, conv_forward_graph);
}

fn check_arity(name: &str, args: &[CallArg], expected: usize) -> ConvResult<()> {
    if args.len() != expected {
        return Err(ConvError::invalid_argument(format!(
            "{name} expects {expected} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

fn arg<T: FromCallArg>(args: &[CallArg], index: usize, role: &str) -> ConvResult<T> {
    let value = args.get(index).ok_or_else(|| {
        ConvError::invalid_argument(format!("missing {role} argument at index {index}"))
    })?;
    T::from_call_arg(value).ok_or_else(|| {
        ConvError::internal(format!(
            "failed to decode {role} argument {index}: got {}",
            value.type_name()
        ))
    })
}

fn plain_conv(
    kind: ConvKind,
    name: &str,
    dispatcher: &ConvDispatcher,
    options: &RunOptions<'_>,
    args: &[CallArg],
    attrs: &ConvCustomCallAttrs,
) -> ConvResult<()> {
    check_arity(name, args, 4)?;
    let operand0: StridedView = arg(args, 0, "operand0")?;
    let operand1: StridedView = arg(args, 1, "operand1")?;
    let output: StridedView = arg(args, 2, "output")?;
    let scratch: FlatView = arg(args, 3, "scratch")?;
    dispatcher.conv(
        kind,
        options,
        ConvArgs {
            operand0: &operand0,
            operand1: &operand1,
            output: &output,
            scratch: &scratch,
        },
        &attrs.common,
    )
}

fn conv_forward(
    dispatcher: &ConvDispatcher,
    options: &RunOptions<'_>,
    args: &[CallArg],
    attrs: &ConvCustomCallAttrs,
) -> ConvResult<()> {
    plain_conv(ConvKind::Forward, CONV_FORWARD, dispatcher, options, args, attrs)
}

fn conv_backward_input(
    dispatcher: &ConvDispatcher,
    options: &RunOptions<'_>,
    args: &[CallArg],
    attrs: &ConvCustomCallAttrs,
) -> ConvResult<()> {
    plain_conv(
        ConvKind::BackwardInput,
        CONV_BACKWARD_INPUT,
        dispatcher,
        options,
        args,
        attrs,
    )
}

fn conv_backward_filter(
    dispatcher: &ConvDispatcher,
    options: &RunOptions<'_>,
    args: &[CallArg],
    attrs: &ConvCustomCallAttrs,
) -> ConvResult<()> {
    plain_conv(
        ConvKind::BackwardFilter,
        CONV_BACKWARD_FILTER,
        dispatcher,
        options,
        args,
        attrs,
    )
}

fn conv_forward_fused(
    dispatcher: &ConvDispatcher,
    options: &RunOptions<'_>,
    args: &[CallArg],
    attrs: &ConvCustomCallAttrs,
) -> ConvResult<()> {
    check_arity(CONV_FORWARD_FUSED, args, 5)?;
    let activation_mode = required(&attrs.activation_mode, "activation_mode")?;
    let leakyrelu_alpha = required(&attrs.leakyrelu_alpha, "leakyrelu_alpha")?;
    let operand0: StridedView = arg(args, 0, "operand0")?;
    let operand1: StridedView = arg(args, 1, "operand1")?;
    let bias: FlatView = arg(args, 2, "bias")?;
    let output: StridedView = arg(args, 3, "output")?;
    let scratch: FlatView = arg(args, 4, "scratch")?;
    dispatcher.conv_fused(
        options,
        FusedConvArgs {
            operand0: &operand0,
            operand1: &operand1,
            bias: &bias,
            output: &output,
            scratch: &scratch,
        },
        &attrs.common,
        activation_mode,
        leakyrelu_alpha,
    )
}

fn conv_forward_fused_side_input(
    dispatcher: &ConvDispatcher,
    options: &RunOptions<'_>,
    args: &[CallArg],
    attrs: &ConvCustomCallAttrs,
) -> ConvResult<()> {
    check_arity(CONV_FORWARD_FUSED_SIDE_INPUT, args, 6)?;
    let activation_mode = required(&attrs.activation_mode, "activation_mode")?;
    let side_input_scale = required(&attrs.side_input_scale, "side_input_scale")?;
    let operand0: StridedView = arg(args, 0, "operand0")?;
    let operand1: StridedView = arg(args, 1, "operand1")?;
    let bias: FlatView = arg(args, 2, "bias")?;
    let side_input: StridedView = arg(args, 3, "side_input")?;
    let output: StridedView = arg(args, 4, "output")?;
    let scratch: FlatView = arg(args, 5, "scratch")?;
    dispatcher.conv_fused_side_input(
        options,
        FusedConvArgs {
            operand0: &operand0,
            operand1: &operand1,
            bias: &bias,
            output: &output,
            scratch: &scratch,
        },
        &side_input,
        &attrs.common,
        activation_mode,
        side_input_scale,
    )
}

fn conv_forward_graph(
    dispatcher: &ConvDispatcher,
    options: &RunOptions<'_>,
    args: &[CallArg],
    attrs: &ConvCustomCallAttrs,
) -> ConvResult<()> {
    let n_aux_outputs = required(&attrs.n_aux_outputs, "n_aux_outputs")?;
    let serialized_graph = attrs.serialized_graph.as_deref().ok_or_else(|| {
        ConvError::invalid_argument("missing required attribute `serialized_graph`")
    })?;
    if args.len() < 2 {
        return Err(ConvError::invalid_argument(format!(
            "{CONV_FORWARD_GRAPH} expects at least 2 arguments, got {}",
            args.len()
        )));
    }
    let operand0: StridedView = arg(args, 0, "operand0")?;
    let operand1: StridedView = arg(args, 1, "operand1")?;
    dispatcher.conv_forward_graph(
        options,
        GraphConvArgs {
            operand0: &operand0,
            operand1: &operand1,
            remaining: &args[2..],
        },
        &attrs.common,
        n_aux_outputs,
        serialized_graph,
    )
}
