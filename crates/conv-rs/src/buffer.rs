use crate::shape::{ElementType, Shape};

/// Untyped device memory range. The dispatcher never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceAddress {
    pub ptr: u64,
    pub size: u64,
}

impl DeviceAddress {
    pub fn new(ptr: u64, size: u64) -> Self {
        Self { ptr, size }
    }
}

/// Typed view of a caller-owned device buffer with logical sizes and element strides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StridedView {
    pub element_type: ElementType,
    pub sizes: Vec<i64>,
    pub strides: Vec<i64>,
    pub address: DeviceAddress,
}

impl StridedView {
    pub fn new(
        element_type: ElementType,
        sizes: Vec<i64>,
        strides: Vec<i64>,
        address: DeviceAddress,
    ) -> Self {
        Self {
            element_type,
            sizes,
            strides,
            address,
        }
    }

    /// Row-major dense view; strides are derived from `sizes`.
    pub fn dense(element_type: ElementType, sizes: Vec<i64>, ptr: u64) -> Self {
        let mut strides = vec![1i64; sizes.len()];
        for idx in (0..sizes.len().saturating_sub(1)).rev() {
            strides[idx] = strides[idx + 1].saturating_mul(sizes[idx + 1].max(1));
        }
        let bytes = sizes
            .iter()
            .fold(element_type.byte_width() as u64, |acc, dim| {
                acc.saturating_mul(u64::try_from(*dim).unwrap_or(0))
            });
        Self {
            element_type,
            sizes,
            strides,
            address: DeviceAddress::new(ptr, bytes),
        }
    }

    /// Logical shape of the view, without a physical layout.
    pub fn to_shape(&self) -> Shape {
        Shape::new(self.element_type, self.sizes.clone())
    }

    pub fn to_flat(&self) -> FlatView {
        FlatView {
            address: self.address,
        }
    }
}

/// Untyped byte view of a caller-owned device buffer (bias and scratch arguments).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlatView {
    pub address: DeviceAddress,
}

impl FlatView {
    pub fn new(ptr: u64, size_in_bytes: u64) -> Self {
        Self {
            address: DeviceAddress::new(ptr, size_in_bytes),
        }
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.address.size
    }
}

/// One positional argument of a custom call as handed over by the host runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArg {
    Strided(StridedView),
    Flat(FlatView),
    I64(i64),
    F64(f64),
}

impl CallArg {
    pub fn type_name(&self) -> &'static str {
        match self {
            CallArg::Strided(_) => "strided memref",
            CallArg::Flat(_) => "flat memref",
            CallArg::I64(_) => "i64 scalar",
            CallArg::F64(_) => "f64 scalar",
        }
    }
}

/// Typed decoding of a [`CallArg`]. Returns `None` when the argument cannot be viewed as
/// `Self`.
pub trait FromCallArg: Sized {
    fn from_call_arg(arg: &CallArg) -> Option<Self>;
}

impl FromCallArg for StridedView {
    fn from_call_arg(arg: &CallArg) -> Option<Self> {
        match arg {
            CallArg::Strided(view) => Some(view.clone()),
            _ => None,
        }
    }
}

impl FromCallArg for FlatView {
    fn from_call_arg(arg: &CallArg) -> Option<Self> {
        match arg {
            CallArg::Strided(view) => Some(view.to_flat()),
            CallArg::Flat(view) => Some(*view),
            _ => None,
        }
    }
}

impl From<StridedView> for CallArg {
    fn from(view: StridedView) -> Self {
        CallArg::Strided(view)
    }
}

impl From<FlatView> for CallArg {
    fn from(view: FlatView) -> Self {
        CallArg::Flat(view)
    }
}
