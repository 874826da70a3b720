//! Already-decoded attribute records attached to convolution custom calls.
//!
//! The host runtime owns the wire encoding; these are the plain structures it hands over.
//! They derive `Deserialize` so hosts that carry attributes as JSON can decode them directly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConvError, ConvResult};

/// Logical axis assignment for input, kernel and output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvDimensionNumbers {
    pub input_batch_dim: i64,
    pub input_feature_dim: i64,
    pub input_spatial_dims: Vec<i64>,
    pub kernel_in_feature_dim: i64,
    pub kernel_out_feature_dim: i64,
    pub kernel_spatial_dims: Vec<i64>,
    pub output_batch_dim: i64,
    pub output_feature_dim: i64,
    pub output_spatial_dims: Vec<i64>,
}

impl ConvDimensionNumbers {
    pub fn spatial_rank(&self) -> usize {
        self.input_spatial_dims.len()
    }

    /// `NCHW`-style numbering for `spatial_rank` spatial dimensions: batch/out-feature at
    /// 0, feature/in-feature at 1, spatial dims after.
    pub fn nchw(spatial_rank: usize) -> Self {
        let spatial = (2..2 + spatial_rank as i64).collect::<Vec<_>>();
        Self {
            input_batch_dim: 0,
            input_feature_dim: 1,
            input_spatial_dims: spatial.clone(),
            kernel_in_feature_dim: 1,
            kernel_out_feature_dim: 0,
            kernel_spatial_dims: spatial.clone(),
            output_batch_dim: 0,
            output_feature_dim: 1,
            output_spatial_dims: spatial,
        }
    }
}

/// Backend hints selected by the compiler (algorithm, math mode, layouts, tuning knobs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvBackendConfig {
    /// `-1` requests runtime autotuning.
    pub algorithm: i64,
    pub tensor_ops_enabled: bool,
    pub is_cudnn_frontend: bool,
    pub is_cudnn_reordered_int8: bool,
    #[serde(default)]
    pub knob_ids: Vec<i64>,
    #[serde(default)]
    pub knob_values: Vec<i64>,
    pub operand_0_layout: Vec<i64>,
    pub operand_1_layout: Vec<i64>,
    pub result_layout: Vec<i64>,
    /// Negative means "no hint".
    #[serde(default = "unset_workspace_size")]
    pub workspace_size: i64,
}

fn unset_workspace_size() -> i64 {
    -1
}

impl ConvBackendConfig {
    /// Tuning knobs as an id -> value association; later duplicates overwrite earlier ones.
    pub fn tuning_knobs(&self) -> ConvResult<BTreeMap<i64, i64>> {
        if self.knob_ids.len() != self.knob_values.len() {
            return Err(ConvError::invalid_argument(format!(
                "backend config has {} knob ids but {} knob values",
                self.knob_ids.len(),
                self.knob_values.len()
            )));
        }
        Ok(self
            .knob_ids
            .iter()
            .copied()
            .zip(self.knob_values.iter().copied())
            .collect())
    }
}

/// Per-spatial-dimension window spans, applied positionally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowAttrs {
    pub window_strides: Vec<i64>,
    /// Symmetric: each value is used for both low and high padding.
    pub padding: Vec<i64>,
    pub lhs_dilation: Vec<i64>,
    pub rhs_dilation: Vec<i64>,
    pub window_reversal: Vec<bool>,
}

impl WindowAttrs {
    /// Unit strides/dilations, zero padding, no reversal.
    pub fn unit(spatial_rank: usize) -> Self {
        Self {
            window_strides: vec![1; spatial_rank],
            padding: vec![0; spatial_rank],
            lhs_dilation: vec![1; spatial_rank],
            rhs_dilation: vec![1; spatial_rank],
            window_reversal: vec![false; spatial_rank],
        }
    }

    pub fn validate(&self, spatial_rank: usize) -> ConvResult<()> {
        let spans = [
            ("window_strides", self.window_strides.len()),
            ("padding", self.padding.len()),
            ("lhs_dilation", self.lhs_dilation.len()),
            ("rhs_dilation", self.rhs_dilation.len()),
            ("window_reversal", self.window_reversal.len()),
        ];
        for (name, len) in spans {
            if len != spatial_rank {
                return Err(ConvError::invalid_argument(format!(
                    "window attribute `{name}` has {len} entries, expected spatial rank {spatial_rank}"
                )));
            }
        }
        Ok(())
    }
}

/// Fused activation applied by the forward-with-activation variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMode {
    #[default]
    None,
    Sigmoid,
    Relu,
    Relu6,
    ReluX,
    Tanh,
    BandPass,
    Elu,
    LeakyRelu,
    GeluExact,
}

/// Attributes shared by every convolution custom call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvCallAttrs {
    /// Caller-assigned id, stable across executions of one compiled program.
    pub uid: i64,
    pub conv_dims: ConvDimensionNumbers,
    #[serde(flatten)]
    pub window: WindowAttrs,
    pub backend_config: ConvBackendConfig,
    pub feature_group_count: i64,
    pub result_scale: f64,
}

/// Full attribute record of a convolution custom call: the shared attributes plus the
/// optional ones only some variants carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvCustomCallAttrs {
    #[serde(flatten)]
    pub common: ConvCallAttrs,
    #[serde(default)]
    pub activation_mode: Option<ActivationMode>,
    #[serde(default)]
    pub side_input_scale: Option<f64>,
    #[serde(default)]
    pub leakyrelu_alpha: Option<f64>,
    #[serde(default)]
    pub n_aux_outputs: Option<i32>,
    #[serde(default)]
    pub serialized_graph: Option<String>,
}

impl ConvCustomCallAttrs {
    pub fn new(common: ConvCallAttrs) -> Self {
        Self {
            common,
            activation_mode: None,
            side_input_scale: None,
            leakyrelu_alpha: None,
            n_aux_outputs: None,
            serialized_graph: None,
        }
    }
}

pub(crate) fn required<T: Clone>(value: &Option<T>, name: &str) -> ConvResult<T> {
    value
        .clone()
        .ok_or_else(|| ConvError::invalid_argument(format!("missing required attribute `{name}`")))
}
