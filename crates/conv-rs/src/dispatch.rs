//! Typed entry points for every convolution variant and the pipeline they share.

use std::sync::Arc;

use crate::attrs::{ActivationMode, ConvCallAttrs};
use crate::autotune;
use crate::buffer::{CallArg, FlatView, FromCallArg, StridedView};
use crate::cache::{CachedRunner, RunnerCache};
use crate::config::ConvConfig;
use crate::descriptor::{
    build_descriptor, ConvKind, DescriptorOperands, FusionAttrs, DEFAULT_ALGORITHM,
    UNSET_ALGORITHM,
};
use crate::device::{ConvPrimitive, RunOptions};
use crate::error::{ConvError, ConvResult};
use crate::invoker::{self, ConvBuffers, ConvCall};

/// Arguments of the plain forward / backward-input / backward-filter variants.
#[derive(Debug, Clone, Copy)]
pub struct ConvArgs<'a> {
    pub operand0: &'a StridedView,
    pub operand1: &'a StridedView,
    pub output: &'a StridedView,
    pub scratch: &'a FlatView,
}

/// Arguments of the fused forward variants.
#[derive(Debug, Clone, Copy)]
pub struct FusedConvArgs<'a> {
    pub operand0: &'a StridedView,
    pub operand1: &'a StridedView,
    pub bias: &'a FlatView,
    pub output: &'a StridedView,
    pub scratch: &'a FlatView,
}

/// Arguments of the epilogue-graph variant: two fixed operands plus the remaining list.
#[derive(Debug, Clone, Copy)]
pub struct GraphConvArgs<'a> {
    pub operand0: &'a StridedView,
    pub operand1: &'a StridedView,
    /// Extra operands, outputs, then scratch; see [`slice_graph_args`].
    pub remaining: &'a [CallArg],
}

/// Remaining arguments of a graph convolution split by role.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphArgs {
    pub extra_operands: Vec<StridedView>,
    pub outputs: Vec<StridedView>,
    pub scratch: FlatView,
}

/// Splits `args` (length N) into extra operands `[0, N-k-2)`, outputs `[N-k-2, N-1)` and
/// scratch `N-1`, where `k = n_aux_outputs`.
pub fn slice_graph_args(args: &[CallArg], n_aux_outputs: i32) -> ConvResult<GraphArgs> {
    let n_aux = usize::try_from(n_aux_outputs).map_err(|_| {
        ConvError::invalid_argument(format!(
            "n_aux_outputs must be non-negative, got {n_aux_outputs}"
        ))
    })?;
    let n = args.len();
    if n < n_aux + 2 {
        return Err(ConvError::invalid_argument(format!(
            "convolution graph needs at least {} remaining arguments for {n_aux} auxiliary outputs, got {n}",
            n_aux + 2
        )));
    }
    let outputs_start = n - n_aux - 2;

    let extra_operands = (0..outputs_start)
        .map(|idx| graph_arg::<StridedView>(args, idx, "operand"))
        .collect::<ConvResult<Vec<_>>>()?;
    let outputs = (outputs_start..n - 1)
        .map(|idx| graph_arg::<StridedView>(args, idx, "output"))
        .collect::<ConvResult<Vec<_>>>()?;
    let scratch = graph_arg::<FlatView>(args, n - 1, "scratch")?;

    Ok(GraphArgs {
        extra_operands,
        outputs,
        scratch,
    })
}

fn graph_arg<T: FromCallArg>(args: &[CallArg], index: usize, role: &str) -> ConvResult<T> {
    T::from_call_arg(&args[index]).ok_or_else(|| {
        ConvError::internal(format!(
            "failed to get {role} buffer for convolution graph (argument {index} is a {})",
            args[index].type_name()
        ))
    })
}

/// Convolution dispatcher for one device primitive.
///
/// Owns the runner cache; callers identify the device executor through
/// [`RunOptions::device`] and each call site through the `uid` attribute.
pub struct ConvDispatcher {
    primitive: Arc<dyn ConvPrimitive>,
    runners: RunnerCache,
}

impl ConvDispatcher {
    pub fn new(primitive: Arc<dyn ConvPrimitive>) -> Self {
        Self {
            primitive,
            runners: RunnerCache::new(),
        }
    }

    pub fn primitive(&self) -> &Arc<dyn ConvPrimitive> {
        &self.primitive
    }

    pub fn runners(&self) -> &RunnerCache {
        &self.runners
    }

    /// Plain forward, backward-input or backward-filter convolution.
    pub fn conv(
        &self,
        kind: ConvKind,
        options: &RunOptions<'_>,
        args: ConvArgs<'_>,
        attrs: &ConvCallAttrs,
    ) -> ConvResult<()> {
        if !matches!(
            kind,
            ConvKind::Forward | ConvKind::BackwardInput | ConvKind::BackwardFilter
        ) {
            return Err(ConvError::invalid_argument(format!(
                "{} convolution needs its dedicated entry point",
                kind.as_str()
            )));
        }
        let outputs = std::slice::from_ref(args.output);
        let call = ConvCall {
            operand0: args.operand0,
            operand1: args.operand1,
            bias: None,
            side_input: None,
            extra_operands: &[],
            outputs,
            scratch: args.scratch,
        };
        self.do_conv(kind, options, call, attrs, FusionAttrs::default())
    }

    /// Forward convolution with bias and fused activation.
    pub fn conv_fused(
        &self,
        options: &RunOptions<'_>,
        args: FusedConvArgs<'_>,
        attrs: &ConvCallAttrs,
        activation_mode: ActivationMode,
        leakyrelu_alpha: f64,
    ) -> ConvResult<()> {
        let call = ConvCall {
            operand0: args.operand0,
            operand1: args.operand1,
            bias: Some(args.bias),
            side_input: None,
            extra_operands: &[],
            outputs: std::slice::from_ref(args.output),
            scratch: args.scratch,
        };
        let fusion = FusionAttrs {
            activation_mode: Some(activation_mode),
            leakyrelu_alpha: Some(leakyrelu_alpha),
            ..FusionAttrs::default()
        };
        self.do_conv(ConvKind::ForwardActivation, options, call, attrs, fusion)
    }

    /// Forward convolution with bias, scaled side input and fused activation.
    pub fn conv_fused_side_input(
        &self,
        options: &RunOptions<'_>,
        args: FusedConvArgs<'_>,
        side_input: &StridedView,
        attrs: &ConvCallAttrs,
        activation_mode: ActivationMode,
        side_input_scale: f64,
    ) -> ConvResult<()> {
        let call = ConvCall {
            operand0: args.operand0,
            operand1: args.operand1,
            bias: Some(args.bias),
            side_input: Some(side_input),
            extra_operands: &[],
            outputs: std::slice::from_ref(args.output),
            scratch: args.scratch,
        };
        let fusion = FusionAttrs {
            activation_mode: Some(activation_mode),
            side_input_scale: Some(side_input_scale),
            ..FusionAttrs::default()
        };
        self.do_conv(ConvKind::ForwardActivation, options, call, attrs, fusion)
    }

    /// Forward convolution followed by a serialized epilogue graph.
    pub fn conv_forward_graph(
        &self,
        options: &RunOptions<'_>,
        args: GraphConvArgs<'_>,
        attrs: &ConvCallAttrs,
        n_aux_outputs: i32,
        serialized_graph: &str,
    ) -> ConvResult<()> {
        let sliced = slice_graph_args(args.remaining, n_aux_outputs)?;
        let call = ConvCall {
            operand0: args.operand0,
            operand1: args.operand1,
            bias: None,
            side_input: None,
            extra_operands: &sliced.extra_operands,
            outputs: &sliced.outputs,
            scratch: &sliced.scratch,
        };
        let fusion = FusionAttrs {
            serialized_graph: Some(serialized_graph.to_string()),
            ..FusionAttrs::default()
        };
        self.do_conv(ConvKind::ForwardGraph, options, call, attrs, fusion)
    }

    fn do_conv(
        &self,
        kind: ConvKind,
        options: &RunOptions<'_>,
        call: ConvCall<'_>,
        attrs: &ConvCallAttrs,
        fusion: FusionAttrs,
    ) -> ConvResult<()> {
        let output = call.outputs.first().ok_or_else(|| {
            ConvError::invalid_argument(format!(
                "{} convolution has no output buffer",
                kind.as_str()
            ))
        })?;
        let runtime_autotuning = attrs.backend_config.algorithm == UNSET_ALGORITHM;

        let runner = self.runners.get_or_create(options.device, attrs.uid, || {
            // The placeholder keeps the plan legal if autotuning never replaces it.
            let mut attrs = attrs.clone();
            if runtime_autotuning {
                attrs.backend_config.algorithm = DEFAULT_ALGORITHM;
            }
            let descriptor = build_descriptor(
                kind,
                DescriptorOperands {
                    operand0: call.operand0,
                    operand1: call.operand1,
                    output,
                    scratch: call.scratch,
                },
                &attrs,
                &fusion,
            )
            .map_err(|err| err.context("convolution descriptor"))?;
            let config = ConvConfig::from_descriptor(&descriptor)
                .map_err(|err| err.context("convolution config"))?;
            let plan = self.primitive.compile(&config)?;
            Ok(CachedRunner::new(config, plan))
        })?;

        let buffers = ConvBuffers::assemble(&call);
        let scratch_size = if runtime_autotuning {
            autotune::ensure_tuned(self.primitive.as_ref(), &runner, &buffers, options)?
        } else {
            buffers.scratch.size
        };
        invoker::execute(
            self.primitive.as_ref(),
            &runner,
            &buffers,
            scratch_size,
            options,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::ElementType;

    fn strided(ptr: u64) -> CallArg {
        CallArg::Strided(StridedView::dense(ElementType::F32, vec![2, 2], ptr))
    }

    #[test]
    fn graph_slicing_assigns_roles_by_position() {
        // 3 extra operands, main output + 2 aux outputs, scratch.
        let mut args: Vec<CallArg> = (1..=6).map(|i| strided(i * 0x100)).collect();
        args.push(CallArg::Flat(FlatView::new(0x700, 512)));
        let sliced = slice_graph_args(&args, 2).unwrap();
        assert_eq!(sliced.extra_operands.len(), args.len() - 2 - 2);
        assert_eq!(sliced.outputs.len(), 3);
        assert_eq!(sliced.outputs[0].address.ptr, 0x400);
        assert_eq!(sliced.scratch, FlatView::new(0x700, 512));
    }

    #[test]
    fn graph_slicing_names_failing_role() {
        let args = vec![strided(0x100), CallArg::I64(1), CallArg::Flat(FlatView::new(0x300, 8))];
        let err = slice_graph_args(&args, 0).unwrap_err();
        assert!(err.to_string().contains("output buffer"), "{err}");

        let args = vec![CallArg::F64(1.0), strided(0x200), strided(0x300)];
        let err = slice_graph_args(&args, 0).unwrap_err();
        assert!(err.to_string().contains("operand buffer"), "{err}");

        let args = vec![strided(0x200), CallArg::I64(0)];
        let err = slice_graph_args(&args, 0).unwrap_err();
        assert!(err.to_string().contains("scratch buffer"), "{err}");

        assert!(slice_graph_args(&args, 1).is_err());
        assert!(slice_graph_args(&args, -1).is_err());
    }
}
