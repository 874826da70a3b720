//! Descriptor construction from decoded attributes and argument views.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::attrs::{ActivationMode, ConvCallAttrs, ConvDimensionNumbers};
use crate::buffer::{FlatView, StridedView};
use crate::error::{ConvError, ConvResult};
use crate::shape::Shape;

/// Algorithm id the compiler emits when it wants the runtime to autotune.
pub const UNSET_ALGORITHM: i64 = -1;
/// Placeholder algorithm installed while runtime autotuning is pending.
pub const DEFAULT_ALGORITHM: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvKind {
    Forward,
    BackwardInput,
    BackwardFilter,
    ForwardActivation,
    ForwardGraph,
}

impl ConvKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConvKind::Forward => "forward",
            ConvKind::BackwardInput => "backward_input",
            ConvKind::BackwardFilter => "backward_filter",
            ConvKind::ForwardActivation => "forward_activation",
            ConvKind::ForwardGraph => "forward_graph",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowDimension {
    pub size: i64,
    pub stride: i64,
    pub padding_low: i64,
    pub padding_high: i64,
    pub base_dilation: i64,
    pub window_dilation: i64,
    pub window_reversal: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub dimensions: Vec<WindowDimension>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MathType {
    #[default]
    Default,
    TensorOp,
}

/// Algorithm choice plus the knobs that parameterize it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlgorithmDesc {
    pub algo_id: i64,
    pub math_type: MathType,
    pub is_cudnn_frontend: bool,
    pub tuning_knobs: BTreeMap<i64, i64>,
    /// `None` when the compiler gave no hint; `Some(0)` is an explicit zero.
    pub workspace_size: Option<u64>,
}

impl AlgorithmDesc {
    pub fn new(algo_id: i64, tensor_ops_enabled: bool) -> Self {
        Self {
            algo_id,
            math_type: if tensor_ops_enabled {
                MathType::TensorOp
            } else {
                MathType::Default
            },
            is_cudnn_frontend: false,
            tuning_knobs: BTreeMap::new(),
            workspace_size: None,
        }
    }

    pub fn tensor_ops_enabled(&self) -> bool {
        self.math_type == MathType::TensorOp
    }
}

/// Backend-specific part of the descriptor. Optional fields stay `None` unless the
/// corresponding attribute was supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvBackendOptions {
    pub algorithm: AlgorithmDesc,
    pub conv_result_scale: f64,
    pub reordered_int8_nchw_vect: bool,
    pub activation_mode: Option<ActivationMode>,
    pub side_input_scale: Option<f64>,
    pub leakyrelu_alpha: Option<f64>,
    pub serialized_graph: Option<String>,
}

/// Canonical description of one convolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvolutionDescriptor {
    pub kind: ConvKind,
    pub operand0_shape: Shape,
    pub operand1_shape: Shape,
    pub result_shape: Shape,
    pub dnums: ConvDimensionNumbers,
    pub window: Window,
    pub feature_group_count: i64,
    pub scratch_size: u64,
    pub backend_config: ConvBackendOptions,
}

/// Optional attributes of the fused variants, present only when the variant binds them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusionAttrs {
    pub activation_mode: Option<ActivationMode>,
    pub side_input_scale: Option<f64>,
    pub leakyrelu_alpha: Option<f64>,
    pub serialized_graph: Option<String>,
}

/// Argument views a descriptor is derived from.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorOperands<'a> {
    pub operand0: &'a StridedView,
    pub operand1: &'a StridedView,
    pub output: &'a StridedView,
    pub scratch: &'a FlatView,
}

/// Builds the descriptor for one convolution call.
///
/// Window sizes are taken from the kernel (`operand1`) shape at the kernel spatial
/// dimensions, not from an attribute. All window spans must match the spatial rank.
pub fn build_descriptor(
    kind: ConvKind,
    operands: DescriptorOperands<'_>,
    attrs: &ConvCallAttrs,
    fusion: &FusionAttrs,
) -> ConvResult<ConvolutionDescriptor> {
    let backend = &attrs.backend_config;

    let operand0_shape = apply_layout(operands.operand0, &backend.operand_0_layout, "operand 0")?;
    let operand1_shape = apply_layout(operands.operand1, &backend.operand_1_layout, "operand 1")?;
    let result_shape = apply_layout(operands.output, &backend.result_layout, "result")?;

    let dnums = attrs.conv_dims.clone();
    let spatial_rank = dnums.spatial_rank();
    if dnums.kernel_spatial_dims.len() != spatial_rank
        || dnums.output_spatial_dims.len() != spatial_rank
    {
        return Err(ConvError::invalid_argument(format!(
            "spatial dimension counts disagree: input {}, kernel {}, output {}",
            spatial_rank,
            dnums.kernel_spatial_dims.len(),
            dnums.output_spatial_dims.len()
        )));
    }
    attrs.window.validate(spatial_rank)?;

    let w = &attrs.window;
    let mut window = Window::default();
    for (index, &kernel_dim) in dnums.kernel_spatial_dims.iter().enumerate() {
        window.dimensions.push(WindowDimension {
            size: operand1_shape.dim(kernel_dim)?,
            stride: w.window_strides[index],
            padding_low: w.padding[index],
            padding_high: w.padding[index],
            base_dilation: w.lhs_dilation[index],
            window_dilation: w.rhs_dilation[index],
            window_reversal: w.window_reversal[index],
        });
    }

    let mut algorithm = AlgorithmDesc::new(backend.algorithm, backend.tensor_ops_enabled);
    algorithm.is_cudnn_frontend = backend.is_cudnn_frontend;
    algorithm.tuning_knobs = backend.tuning_knobs()?;
    if backend.workspace_size >= 0 {
        algorithm.workspace_size = Some(backend.workspace_size as u64);
    }

    Ok(ConvolutionDescriptor {
        kind,
        operand0_shape,
        operand1_shape,
        result_shape,
        dnums,
        window,
        feature_group_count: attrs.feature_group_count,
        scratch_size: operands.scratch.size_in_bytes(),
        backend_config: ConvBackendOptions {
            algorithm,
            conv_result_scale: attrs.result_scale,
            reordered_int8_nchw_vect: backend.is_cudnn_reordered_int8,
            activation_mode: fusion.activation_mode,
            side_input_scale: fusion.side_input_scale,
            leakyrelu_alpha: fusion.leakyrelu_alpha,
            serialized_graph: fusion.serialized_graph.clone(),
        },
    })
}

fn apply_layout(view: &StridedView, minor_to_major: &[i64], what: &str) -> ConvResult<Shape> {
    let shape = view.to_shape();
    Shape::with_dense_layout(shape.element_type, &shape.dims, minor_to_major)
        .map_err(|err| err.context(what))
}
