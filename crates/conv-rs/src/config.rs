use crate::attrs::{ActivationMode, ConvDimensionNumbers};
use crate::descriptor::{AlgorithmDesc, ConvKind, ConvolutionDescriptor, Window};
use crate::error::{ConvError, ConvResult};
use crate::shape::Shape;

/// Epilogue parameters of the forward-with-activation kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionConfig {
    pub mode: ActivationMode,
    /// Zero when the call has no side input.
    pub side_input_scale: f64,
    pub leakyrelu_alpha: f64,
}

/// Execution config derived once from a descriptor and compiled by the device primitive.
///
/// Shapes are expressed by role (input/filter/output) rather than by argument position;
/// see [`ConvConfig::from_descriptor`] for the per-kind mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvConfig {
    pub kind: ConvKind,
    pub input_shape: Shape,
    pub filter_shape: Shape,
    pub output_shape: Shape,
    pub dnums: ConvDimensionNumbers,
    pub window: Window,
    pub feature_group_count: i64,
    pub conv_result_scale: f64,
    pub reordered_int8_nchw_vect: bool,
    pub fusion: Option<FusionConfig>,
    pub serialized_graph: Option<String>,
    /// Algorithm from the descriptor; the runner keeps the live copy.
    pub algorithm: AlgorithmDesc,
    pub static_scratch_size: u64,
}

impl ConvConfig {
    /// Role mapping per kind:
    /// - forward kinds: input = operand0, filter = operand1, output = result
    /// - backward input: input = result, filter = operand1, output = operand0
    /// - backward filter: input = operand0, filter = result, output = operand1
    pub fn from_descriptor(descriptor: &ConvolutionDescriptor) -> ConvResult<Self> {
        let (input_shape, filter_shape, output_shape) = match descriptor.kind {
            ConvKind::Forward | ConvKind::ForwardActivation | ConvKind::ForwardGraph => (
                &descriptor.operand0_shape,
                &descriptor.operand1_shape,
                &descriptor.result_shape,
            ),
            ConvKind::BackwardInput => (
                &descriptor.result_shape,
                &descriptor.operand1_shape,
                &descriptor.operand0_shape,
            ),
            ConvKind::BackwardFilter => (
                &descriptor.operand0_shape,
                &descriptor.result_shape,
                &descriptor.operand1_shape,
            ),
        };

        let dnums = &descriptor.dnums;
        let spatial_rank = dnums.spatial_rank();
        if descriptor.window.dimensions.len() != spatial_rank {
            return Err(ConvError::invalid_argument(format!(
                "window has {} dimensions but convolution has {spatial_rank} spatial dimensions",
                descriptor.window.dimensions.len()
            )));
        }
        check_role(
            "input",
            input_shape,
            spatial_rank,
            &[dnums.input_batch_dim, dnums.input_feature_dim],
            &dnums.input_spatial_dims,
        )?;
        check_role(
            "filter",
            filter_shape,
            spatial_rank,
            &[dnums.kernel_in_feature_dim, dnums.kernel_out_feature_dim],
            &dnums.kernel_spatial_dims,
        )?;
        check_role(
            "output",
            output_shape,
            spatial_rank,
            &[dnums.output_batch_dim, dnums.output_feature_dim],
            &dnums.output_spatial_dims,
        )?;

        if descriptor.feature_group_count < 1 {
            return Err(ConvError::invalid_argument(format!(
                "feature_group_count must be positive, got {}",
                descriptor.feature_group_count
            )));
        }
        let input_features = input_shape.dim(dnums.input_feature_dim)?;
        if input_features % descriptor.feature_group_count != 0 {
            return Err(ConvError::invalid_argument(format!(
                "input feature count {input_features} is not divisible by feature_group_count {}",
                descriptor.feature_group_count
            )));
        }

        let backend = &descriptor.backend_config;
        let fusion = match descriptor.kind {
            ConvKind::ForwardActivation => Some(FusionConfig {
                mode: backend.activation_mode.unwrap_or_default(),
                side_input_scale: backend.side_input_scale.unwrap_or(0.0),
                leakyrelu_alpha: backend.leakyrelu_alpha.unwrap_or(0.0),
            }),
            _ => None,
        };
        if descriptor.kind == ConvKind::ForwardGraph && backend.serialized_graph.is_none() {
            return Err(ConvError::invalid_argument(
                "forward graph convolution requires a serialized graph",
            ));
        }

        Ok(Self {
            kind: descriptor.kind,
            input_shape: input_shape.clone(),
            filter_shape: filter_shape.clone(),
            output_shape: output_shape.clone(),
            dnums: dnums.clone(),
            window: descriptor.window.clone(),
            feature_group_count: descriptor.feature_group_count,
            conv_result_scale: backend.conv_result_scale,
            reordered_int8_nchw_vect: backend.reordered_int8_nchw_vect,
            fusion,
            serialized_graph: backend.serialized_graph.clone(),
            algorithm: backend.algorithm.clone(),
            static_scratch_size: descriptor.scratch_size,
        })
    }

    pub fn spatial_rank(&self) -> usize {
        self.dnums.spatial_rank()
    }
}

fn check_role(
    role: &str,
    shape: &Shape,
    spatial_rank: usize,
    fixed_dims: &[i64],
    spatial_dims: &[i64],
) -> ConvResult<()> {
    let layout = shape.layout.as_ref().ok_or_else(|| {
        ConvError::invalid_argument(format!("{role} shape {shape} has no layout"))
    })?;
    layout
        .check_permutation(shape.rank())
        .map_err(|err| err.context(&format!("{role} shape {shape}")))?;
    if shape.rank() != spatial_rank + 2 {
        return Err(ConvError::invalid_argument(format!(
            "{role} shape {shape} has rank {}, expected {}",
            shape.rank(),
            spatial_rank + 2
        )));
    }
    let mut seen = vec![false; shape.rank()];
    for &dim in fixed_dims.iter().chain(spatial_dims) {
        let idx = usize::try_from(dim)
            .ok()
            .filter(|idx| *idx < shape.rank())
            .ok_or_else(|| {
                ConvError::invalid_argument(format!(
                    "{role} dimension number {dim} out of range for shape {shape}"
                ))
            })?;
        if seen[idx] {
            return Err(ConvError::invalid_argument(format!(
                "{role} dimension number {dim} is assigned twice"
            )));
        }
        seen[idx] = true;
    }
    Ok(())
}
