//! Pure translation of a [`ConvConfig`] into cuDNN descriptor parameters.

use conv_rs::config::{ConvConfig, FusionConfig};
use conv_rs::descriptor::Window;
use conv_rs::{
    ActivationMode, ConvDimensionNumbers, ConvError, ConvKind, ConvResult, DeviceAddress,
    ElementType, Shape,
};

pub(crate) const CUDNN_DATA_FLOAT: i32 = 0;
pub(crate) const CUDNN_DATA_DOUBLE: i32 = 1;
pub(crate) const CUDNN_DATA_HALF: i32 = 2;
pub(crate) const CUDNN_DATA_INT8: i32 = 3;
pub(crate) const CUDNN_DATA_INT32: i32 = 4;
pub(crate) const CUDNN_DATA_UINT8: i32 = 6;
pub(crate) const CUDNN_DATA_BFLOAT16: i32 = 9;
pub(crate) const CUDNN_DATA_FP8_E4M3: i32 = 12;
pub(crate) const CUDNN_DATA_FP8_E5M2: i32 = 13;

pub(crate) const CUDNN_CONVOLUTION: i32 = 0;
pub(crate) const CUDNN_CROSS_CORRELATION: i32 = 1;

pub(crate) const CUDNN_DEFAULT_MATH: i32 = 0;
pub(crate) const CUDNN_TENSOR_OP_MATH: i32 = 1;

pub(crate) const CUDNN_ACTIVATION_SIGMOID: i32 = 0;
pub(crate) const CUDNN_ACTIVATION_RELU: i32 = 1;
pub(crate) const CUDNN_ACTIVATION_TANH: i32 = 2;
pub(crate) const CUDNN_ACTIVATION_CLIPPED_RELU: i32 = 3;
pub(crate) const CUDNN_ACTIVATION_ELU: i32 = 4;
pub(crate) const CUDNN_ACTIVATION_IDENTITY: i32 = 5;

/// The only forward algorithm cuDNN accepts with an identity activation.
pub(crate) const CUDNN_CONVOLUTION_FWD_ALGO_IMPLICIT_PRECOMP_GEMM: i64 = 1;

/// cuDNN tensors need at least four dimensions.
const MIN_CUDNN_RANK: usize = 4;

pub(crate) fn cudnn_data_type(element_type: ElementType) -> ConvResult<i32> {
    match element_type {
        ElementType::F32 => Ok(CUDNN_DATA_FLOAT),
        ElementType::F64 => Ok(CUDNN_DATA_DOUBLE),
        ElementType::F16 => Ok(CUDNN_DATA_HALF),
        ElementType::Bf16 => Ok(CUDNN_DATA_BFLOAT16),
        ElementType::S8 => Ok(CUDNN_DATA_INT8),
        ElementType::S32 => Ok(CUDNN_DATA_INT32),
        ElementType::U8 => Ok(CUDNN_DATA_UINT8),
        ElementType::F8E4m3 => Ok(CUDNN_DATA_FP8_E4M3),
        ElementType::F8E5m2 => Ok(CUDNN_DATA_FP8_E5M2),
        ElementType::Pred => Err(ConvError::unimplemented(
            "cudnn convolution",
            "pred tensors are not supported",
        )),
    }
}

/// Accumulation type of the convolution descriptor for inputs of `element_type`.
pub(crate) fn compute_type(element_type: ElementType) -> i32 {
    match element_type {
        ElementType::F64 => CUDNN_DATA_DOUBLE,
        ElementType::S8 | ElementType::U8 | ElementType::S32 => CUDNN_DATA_INT32,
        _ => CUDNN_DATA_FLOAT,
    }
}

/// Dimensions and element strides in cuDNN's `N, C, spatial...` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TensorGeometry {
    pub dims: Vec<i32>,
    pub strides: Vec<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FilterFormat {
    /// Spatial dimensions innermost.
    Nchw,
    /// Input feature dimension innermost.
    Nhwc,
}

impl FilterFormat {
    pub(crate) fn as_raw(self) -> i32 {
        match self {
            FilterFormat::Nchw => 0,
            FilterFormat::Nhwc => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FilterGeometry {
    pub format: FilterFormat,
    /// `K, C, spatial...`
    pub dims: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConvGeometry {
    pub padding: Vec<i32>,
    pub strides: Vec<i32>,
    pub dilations: Vec<i32>,
    pub mode: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ActivationSpec {
    pub mode: i32,
    pub coef: f64,
}

impl ActivationSpec {
    pub(crate) fn is_identity(&self) -> bool {
        self.mode == CUDNN_ACTIVATION_IDENTITY
    }
}

fn to_i32(value: i64, what: &str) -> ConvResult<i32> {
    i32::try_from(value).map_err(|_| {
        ConvError::invalid_argument(format!("{what} {value} does not fit a cuDNN descriptor"))
    })
}

fn shape_dim(shape: &Shape, dim: i64) -> ConvResult<usize> {
    usize::try_from(dim)
        .ok()
        .filter(|idx| *idx < shape.rank())
        .ok_or_else(|| {
            ConvError::invalid_argument(format!("dimension {dim} out of range for shape {shape}"))
        })
}

/// Builds the strided descriptor geometry of an activation tensor, reading logical axes
/// through `batch`, `feature` and `spatial`. One-dimensional convolutions gain a trailing
/// unit spatial dimension.
pub(crate) fn tensor_geometry(
    shape: &Shape,
    batch: i64,
    feature: i64,
    spatial: &[i64],
) -> ConvResult<TensorGeometry> {
    let layout = shape.layout.as_ref().ok_or_else(|| {
        ConvError::invalid_argument(format!("shape {shape} has no layout"))
    })?;
    let physical = layout.dense_strides(&shape.dims)?;

    let mut dims = Vec::with_capacity(MIN_CUDNN_RANK.max(spatial.len() + 2));
    let mut strides = Vec::with_capacity(dims.capacity());
    for &axis in std::iter::once(&batch)
        .chain(std::iter::once(&feature))
        .chain(spatial)
    {
        let idx = shape_dim(shape, axis)?;
        dims.push(to_i32(shape.dims[idx], "dimension size")?);
        strides.push(to_i32(physical[idx], "stride")?);
    }
    while dims.len() < MIN_CUDNN_RANK {
        dims.push(1);
        strides.push(1);
    }
    Ok(TensorGeometry { dims, strides })
}

/// Filter descriptors carry no strides, so the physical layout must be one of the two
/// packed formats cuDNN knows.
pub(crate) fn filter_geometry(
    shape: &Shape,
    dnums: &ConvDimensionNumbers,
) -> ConvResult<FilterGeometry> {
    let layout = shape.layout.as_ref().ok_or_else(|| {
        ConvError::invalid_argument(format!("filter shape {shape} has no layout"))
    })?;
    let out_feature = dnums.kernel_out_feature_dim;
    let in_feature = dnums.kernel_in_feature_dim;
    let spatial = &dnums.kernel_spatial_dims;

    let nchw: Vec<i64> = spatial
        .iter()
        .rev()
        .copied()
        .chain([in_feature, out_feature])
        .collect();
    let nhwc: Vec<i64> = std::iter::once(in_feature)
        .chain(spatial.iter().rev().copied())
        .chain(std::iter::once(out_feature))
        .collect();
    let format = if layout.minor_to_major == nchw {
        FilterFormat::Nchw
    } else if layout.minor_to_major == nhwc {
        FilterFormat::Nhwc
    } else {
        return Err(ConvError::unimplemented(
            "cudnn convolution",
            format!(
                "filter layout {:?} is neither NCHW nor NHWC for dimension numbers {dnums:?}",
                layout.minor_to_major
            ),
        ));
    };

    let mut dims = Vec::with_capacity(MIN_CUDNN_RANK.max(spatial.len() + 2));
    for &axis in [out_feature, in_feature].iter().chain(spatial) {
        let idx = shape_dim(shape, axis)?;
        dims.push(to_i32(shape.dims[idx], "filter dimension size")?);
    }
    while dims.len() < MIN_CUDNN_RANK {
        dims.push(1);
    }
    Ok(FilterGeometry { format, dims })
}

pub(crate) fn conv_geometry(window: &Window) -> ConvResult<ConvGeometry> {
    let mut geometry = ConvGeometry {
        padding: Vec::new(),
        strides: Vec::new(),
        dilations: Vec::new(),
        mode: CUDNN_CROSS_CORRELATION,
    };
    let reversed = window
        .dimensions
        .iter()
        .filter(|dim| dim.window_reversal)
        .count();
    if reversed == window.dimensions.len() && reversed > 0 {
        geometry.mode = CUDNN_CONVOLUTION;
    } else if reversed != 0 {
        return Err(ConvError::unimplemented(
            "cudnn convolution",
            "window reversal must apply to all spatial dimensions or none",
        ));
    }
    for dim in &window.dimensions {
        if dim.base_dilation != 1 {
            return Err(ConvError::unimplemented(
                "cudnn convolution",
                format!("base dilation {} is not supported", dim.base_dilation),
            ));
        }
        geometry.padding.push(to_i32(dim.padding_low, "padding")?);
        geometry.strides.push(to_i32(dim.stride, "window stride")?);
        geometry
            .dilations
            .push(to_i32(dim.window_dilation, "window dilation")?);
    }
    // Matches the unit spatial dimension added to 1-D tensors.
    while geometry.padding.len() < MIN_CUDNN_RANK - 2 {
        geometry.padding.push(0);
        geometry.strides.push(1);
        geometry.dilations.push(1);
    }
    Ok(geometry)
}

pub(crate) fn activation_spec(fusion: &FusionConfig) -> ConvResult<ActivationSpec> {
    let (mode, coef) = match fusion.mode {
        ActivationMode::None => (CUDNN_ACTIVATION_IDENTITY, 0.0),
        ActivationMode::Sigmoid => (CUDNN_ACTIVATION_SIGMOID, 0.0),
        ActivationMode::Relu => (CUDNN_ACTIVATION_RELU, 0.0),
        ActivationMode::Relu6 => (CUDNN_ACTIVATION_CLIPPED_RELU, 6.0),
        // The clip value of ReluX travels in the alpha attribute.
        ActivationMode::ReluX => (CUDNN_ACTIVATION_CLIPPED_RELU, fusion.leakyrelu_alpha),
        ActivationMode::Tanh => (CUDNN_ACTIVATION_TANH, 0.0),
        ActivationMode::Elu => (CUDNN_ACTIVATION_ELU, 1.0),
        other => {
            return Err(ConvError::unimplemented(
                "cudnn convolution",
                format!("activation {other:?} has no fused cuDNN equivalent"),
            ))
        }
    };
    Ok(ActivationSpec { mode, coef })
}

/// Device pointers by convolution role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RolePointers {
    pub input: DeviceAddress,
    pub filter: DeviceAddress,
    pub output: DeviceAddress,
}

/// Maps positional buffers to roles, mirroring the role mapping of [`ConvConfig`].
pub(crate) fn role_pointers(
    kind: ConvKind,
    operands: &[DeviceAddress],
    results: &[DeviceAddress],
) -> ConvResult<RolePointers> {
    let (op0, op1, result) = match (operands.first(), operands.get(1), results.first()) {
        (Some(op0), Some(op1), Some(result)) => (*op0, *op1, *result),
        _ => {
            return Err(ConvError::internal(format!(
                "{} convolution needs two operands and a result, got {} and {}",
                kind.as_str(),
                operands.len(),
                results.len()
            )))
        }
    };
    Ok(match kind {
        ConvKind::BackwardInput => RolePointers {
            input: result,
            filter: op1,
            output: op0,
        },
        ConvKind::BackwardFilter => RolePointers {
            input: op0,
            filter: result,
            output: op1,
        },
        ConvKind::Forward | ConvKind::ForwardActivation | ConvKind::ForwardGraph => {
            RolePointers {
                input: op0,
                filter: op1,
                output: result,
            }
        }
    })
}

/// Rejects configs this backend cannot express before any descriptor is created.
pub(crate) fn check_supported(config: &ConvConfig) -> ConvResult<()> {
    if config.kind == ConvKind::ForwardGraph {
        return Err(ConvError::unimplemented(
            "cudnn convolution",
            "epilogue graphs need the cuDNN frontend",
        ));
    }
    if config.reordered_int8_nchw_vect {
        return Err(ConvError::unimplemented(
            "cudnn convolution",
            "reordered int8 NCHW_VECT_C filters are not supported",
        ));
    }
    if !config.algorithm.tuning_knobs.is_empty() {
        return Err(ConvError::unimplemented(
            "cudnn convolution",
            "frontend tuning knobs are not supported",
        ));
    }
    Ok(())
}
