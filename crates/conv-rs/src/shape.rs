use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConvError, ConvResult};

/// Element types understood by the convolution runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Pred,
    S8,
    S32,
    U8,
    F16,
    Bf16,
    F32,
    F64,
    F8E4m3,
    F8E5m2,
}

impl ElementType {
    pub fn byte_width(self) -> usize {
        match self {
            ElementType::Pred
            | ElementType::S8
            | ElementType::U8
            | ElementType::F8E4m3
            | ElementType::F8E5m2 => 1,
            ElementType::F16 | ElementType::Bf16 => 2,
            ElementType::S32 | ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }
}

/// Physical dimension order, most-minor first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    pub minor_to_major: Vec<i64>,
}

impl Layout {
    /// Row-major layout for `rank` dimensions (last logical dim is most minor).
    pub fn row_major(rank: usize) -> Self {
        Self {
            minor_to_major: (0..rank as i64).rev().collect(),
        }
    }

    /// Checks that the layout names every dimension of a rank-`rank` shape exactly once.
    pub fn check_permutation(&self, rank: usize) -> ConvResult<()> {
        let minor_to_major = &self.minor_to_major;
        if minor_to_major.len() != rank {
            return Err(ConvError::invalid_argument(format!(
                "layout {minor_to_major:?} has {} entries but the shape has rank {rank}",
                minor_to_major.len()
            )));
        }
        let mut seen = vec![false; rank];
        for &dim in minor_to_major {
            match usize::try_from(dim).ok().filter(|idx| *idx < rank) {
                Some(idx) if !seen[idx] => seen[idx] = true,
                _ => {
                    return Err(ConvError::invalid_argument(format!(
                        "layout {minor_to_major:?} is not a permutation of {rank} dimensions"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Element strides per logical dimension for a dense array with this layout.
    pub fn dense_strides(&self, dims: &[i64]) -> ConvResult<Vec<i64>> {
        self.check_permutation(dims.len())?;
        let mut strides = vec![0i64; dims.len()];
        let mut running = 1i64;
        for &dim in &self.minor_to_major {
            let idx = dim as usize;
            strides[idx] = running;
            running = running.saturating_mul(dims[idx].max(1));
        }
        Ok(strides)
    }
}

/// Array shape with an optional explicit physical layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub element_type: ElementType,
    pub dims: Vec<i64>,
    pub layout: Option<Layout>,
}

impl Shape {
    pub fn new(element_type: ElementType, dims: Vec<i64>) -> Self {
        Self {
            element_type,
            dims,
            layout: None,
        }
    }

    /// Builds a shape with a dense layout; `minor_to_major` must be a permutation of the
    /// dimension indices.
    pub fn with_dense_layout(
        element_type: ElementType,
        dims: &[i64],
        minor_to_major: &[i64],
    ) -> ConvResult<Self> {
        if let Some(bad) = dims.iter().find(|dim| **dim < 0) {
            return Err(ConvError::invalid_argument(format!(
                "shape dimensions must be non-negative, got {bad} in {dims:?}"
            )));
        }
        let layout = Layout {
            minor_to_major: minor_to_major.to_vec(),
        };
        layout.check_permutation(dims.len())?;
        Ok(Self {
            element_type,
            dims: dims.to_vec(),
            layout: Some(layout),
        })
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dim(&self, index: i64) -> ConvResult<i64> {
        usize::try_from(index)
            .ok()
            .and_then(|idx| self.dims.get(idx).copied())
            .ok_or_else(|| {
                ConvError::invalid_argument(format!(
                    "dimension index {index} out of range for shape {self}"
                ))
            })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{:?}", self.element_type, self.dims)?;
        if let Some(layout) = &self.layout {
            write!(f, "{{{:?}}}", layout.minor_to_major)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_layout_rejects_non_permutations() {
        let dims = [2, 3, 4, 5];
        assert!(Shape::with_dense_layout(ElementType::F32, &dims, &[3, 2, 1, 0]).is_ok());
        assert!(Shape::with_dense_layout(ElementType::F32, &dims, &[3, 2, 1]).is_err());
        assert!(Shape::with_dense_layout(ElementType::F32, &dims, &[3, 3, 1, 0]).is_err());
        assert!(Shape::with_dense_layout(ElementType::F32, &dims, &[4, 2, 1, 0]).is_err());
        assert!(Shape::with_dense_layout(ElementType::F32, &dims, &[-1, 2, 1, 0]).is_err());
    }

    #[test]
    fn dense_strides_follow_minor_to_major() {
        // NHWC physical order for logical NCHW dims.
        let layout = Layout {
            minor_to_major: vec![1, 3, 2, 0],
        };
        assert_eq!(layout.dense_strides(&[2, 3, 4, 5]).unwrap(), vec![60, 1, 15, 3]);
        assert_eq!(
            Layout::row_major(3).dense_strides(&[2, 3, 4]).unwrap(),
            vec![12, 4, 1]
        );
    }

    #[test]
    fn dense_strides_reject_out_of_range_layouts() {
        let layout = Layout {
            minor_to_major: vec![9, 2, 1, 0],
        };
        let err = layout.dense_strides(&[2, 3, 4, 5]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("not a permutation"), "{err}");
    }
}
