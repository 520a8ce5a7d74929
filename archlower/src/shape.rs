use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

use crate::common::{DimSize, ElemCount};
use crate::registry::{ConvParams, OpParams, Padding, PoolParams};

/// The shape of the tensor flowing between two pipeline steps.
///
/// Exactly one variant is active at a time. [OpParams::Flatten] is the only
/// operator which turns a [TensorShape::FeatureMap] into a [TensorShape::Flat].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorShape {
    FeatureMap {
        channels: DimSize,
        height: DimSize,
        width: DimSize,
    },
    Flat {
        features: DimSize,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("expected a feature map, got flat shape {found}")]
    ExpectedFeatureMap { found: TensorShape },
    #[error("expected a flattened shape, got feature map {found}")]
    ExpectedFlat { found: TensorShape },
    #[error("stride must be positive, got {stride}")]
    NonPositiveStride { stride: i64 },
    #[error("computed {axis} is {computed}, which is not positive")]
    NonPositiveDim { axis: &'static str, computed: i64 },
    #[error("computed {axis} is {computed}, which does not fit in 32 bits")]
    DimTooLarge { axis: &'static str, computed: i64 },
    #[error("{param} mismatch: expected {expected}, actual {actual}")]
    CountMismatch {
        param: &'static str,
        expected: ElemCount,
        actual: ElemCount,
    },
    #[error("operand shapes differ: {left} vs. {right}")]
    OperandMismatch {
        left: TensorShape,
        right: TensorShape,
    },
    #[error("pipeline output must be {expected}, got {actual}")]
    OutputMismatch {
        expected: TensorShape,
        actual: TensorShape,
    },
    #[error("{volume} elements do not fit in a single feature vector")]
    TooLarge { volume: ElemCount },
    #[error("{shape} has more elements than a buffer can count")]
    VolumeOverflow { shape: TensorShape },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid shape {0:?}; expected CxHxW or a feature count")]
pub struct ParseShapeError(String);

impl TensorShape {
    pub fn feature_map(channels: DimSize, height: DimSize, width: DimSize) -> Self {
        TensorShape::FeatureMap {
            channels,
            height,
            width,
        }
    }

    pub fn flat(features: DimSize) -> Self {
        TensorShape::Flat { features }
    }

    pub fn is_flat(&self) -> bool {
        matches!(self, TensorShape::Flat { .. })
    }

    pub fn dims(&self) -> Vec<DimSize> {
        match *self {
            TensorShape::FeatureMap {
                channels,
                height,
                width,
            } => vec![channels, height, width],
            TensorShape::Flat { features } => vec![features],
        }
    }

    /// The number of elements a buffer needs to hold this shape, or `None` if the count
    /// overflows [ElemCount].
    pub fn volume(&self) -> Option<ElemCount> {
        self.dims()
            .iter()
            .try_fold(1, |acc: ElemCount, d| acc.checked_mul(d.get().into()))
    }

    /// Like [TensorShape::volume], but an overflow is a [ShapeError::VolumeOverflow].
    pub fn element_count(&self) -> Result<ElemCount, ShapeError> {
        self.volume()
            .ok_or(ShapeError::VolumeOverflow { shape: *self })
    }
}

impl Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorShape::FeatureMap {
                channels,
                height,
                width,
            } => write!(f, "{channels}x{height}x{width}"),
            TensorShape::Flat { features } => write!(f, "{features}"),
        }
    }
}

impl FromStr for TensorShape {
    type Err = ParseShapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseShapeError(s.to_owned());
        let dims = s
            .split('x')
            .map(|part| part.trim().parse::<DimSize>().map_err(|_| err()))
            .collect::<Result<Vec<_>, _>>()?;
        match dims[..] {
            [features] => Ok(TensorShape::flat(features)),
            [channels, height, width] => Ok(TensorShape::feature_map(channels, height, width)),
            _ => Err(err()),
        }
    }
}

/// Infer the output shape of an operator applied to `inputs`.
///
/// `inputs` holds one shape for unary operators and two for [OpParams::Add]. The output's
/// element count is checked to fit in [ElemCount].
pub fn infer(params: &OpParams, inputs: &[TensorShape]) -> Result<TensorShape, ShapeError> {
    debug_assert_eq!(inputs.len(), usize::from(params.kind().arity()));
    let output = infer_kind(params, inputs)?;
    output.element_count()?;
    Ok(output)
}

fn infer_kind(params: &OpParams, inputs: &[TensorShape]) -> Result<TensorShape, ShapeError> {
    let input = inputs[0];
    match params {
        OpParams::Conv(conv) => infer_conv(conv, input),
        OpParams::MaxPool(pool) | OpParams::AvgPool(pool) => infer_pool(pool, input),
        OpParams::GlobalAvgPool => {
            let (channels, _, _) = spatial(input)?;
            Ok(TensorShape::feature_map(
                channels,
                DimSize::MIN,
                DimSize::MIN,
            ))
        }
        OpParams::Flatten { in_features } => {
            let volume = input.element_count()?;
            if let Some(declared) = in_features {
                check_count("in_features", declared.get().into(), volume)?;
            }
            let features = u32::try_from(volume)
                .ok()
                .and_then(DimSize::new)
                .ok_or(ShapeError::TooLarge { volume })?;
            Ok(TensorShape::flat(features))
        }
        OpParams::Activation => Ok(input),
        OpParams::Linear {
            in_features,
            out_features,
        } => {
            let TensorShape::Flat { features } = input else {
                return Err(ShapeError::ExpectedFlat { found: input });
            };
            if let Some(declared) = in_features {
                check_count("in_features", declared.get().into(), features.get().into())?;
            }
            Ok(TensorShape::flat(*out_features))
        }
        OpParams::Add { .. } => {
            let other = inputs[1];
            if input != other {
                return Err(ShapeError::OperandMismatch {
                    left: input,
                    right: other,
                });
            }
            Ok(input)
        }
    }
}

fn infer_conv(conv: &ConvParams, input: TensorShape) -> Result<TensorShape, ShapeError> {
    let (channels, height, width) = spatial(input)?;
    if let Some(declared) = conv.in_channels {
        check_count("in_channels", declared.get().into(), channels.get().into())?;
    }
    let stride = positive_stride(conv.stride)?;
    let axis = |name: &'static str, size: DimSize| -> Result<DimSize, ShapeError> {
        let size = i64::from(size.get());
        let computed = match conv.padding {
            Padding::Same => divrem::DivCeil::div_ceil(size, stride),
            Padding::Explicit(pad) => window_out(size, conv.kernel_size, stride, pad),
        };
        positive_dim(name, computed)
    };
    Ok(TensorShape::feature_map(
        conv.out_channels,
        axis("height", height)?,
        axis("width", width)?,
    ))
}

fn infer_pool(pool: &PoolParams, input: TensorShape) -> Result<TensorShape, ShapeError> {
    let (channels, height, width) = spatial(input)?;
    let stride = positive_stride(pool.stride)?;
    let overlapping = i64::from(pool.kernel_size.get()) != stride;
    let axis = |name: &'static str, size: DimSize| -> Result<DimSize, ShapeError> {
        let size = i64::from(size.get());
        let computed = if overlapping {
            window_out(size, pool.kernel_size, stride, 0)
        } else {
            divrem::DivFloor::div_floor(size, stride)
        };
        positive_dim(name, computed)
    };
    Ok(TensorShape::feature_map(
        channels,
        axis("height", height)?,
        axis("width", width)?,
    ))
}

/// `floor((in + 2*pad - kernel) / stride) + 1`
fn window_out(size: i64, kernel: DimSize, stride: i64, pad: u32) -> i64 {
    let numerator = size + 2 * i64::from(pad) - i64::from(kernel.get());
    divrem::DivFloor::div_floor(numerator, stride) + 1
}

fn spatial(shape: TensorShape) -> Result<(DimSize, DimSize, DimSize), ShapeError> {
    match shape {
        TensorShape::FeatureMap {
            channels,
            height,
            width,
        } => Ok((channels, height, width)),
        TensorShape::Flat { .. } => Err(ShapeError::ExpectedFeatureMap { found: shape }),
    }
}

fn positive_stride(stride: i64) -> Result<i64, ShapeError> {
    if stride <= 0 {
        return Err(ShapeError::NonPositiveStride { stride });
    }
    Ok(stride)
}

fn positive_dim(axis: &'static str, computed: i64) -> Result<DimSize, ShapeError> {
    match u32::try_from(computed) {
        Ok(dim) => DimSize::new(dim).ok_or(ShapeError::NonPositiveDim { axis, computed }),
        Err(_) if computed > 0 => Err(ShapeError::DimTooLarge { axis, computed }),
        Err(_) => Err(ShapeError::NonPositiveDim { axis, computed }),
    }
}

fn check_count(
    param: &'static str,
    expected: ElemCount,
    actual: ElemCount,
) -> Result<(), ShapeError> {
    if expected != actual {
        return Err(ShapeError::CountMismatch {
            param,
            expected,
            actual,
        });
    }
    Ok(())
}

pub mod macros {
    pub mod internal {
        use crate::common::DimSize;

        pub trait IntoDimSize {
            fn into_dim_size(self) -> DimSize;
        }

        impl IntoDimSize for DimSize {
            fn into_dim_size(self) -> DimSize {
                self
            }
        }

        impl IntoDimSize for u32 {
            fn into_dim_size(self) -> DimSize {
                DimSize::new(self).unwrap()
            }
        }
    }

    /// Build a [TensorShape](crate::shape::TensorShape) from literal dimensions.
    ///
    /// Three dimensions give a feature map; one gives a flat vector.
    #[macro_export]
    macro_rules! tshape {
        ($c:expr, $h:expr, $w:expr $(,)?) => {{
            use $crate::shape::macros::internal::IntoDimSize;
            $crate::shape::TensorShape::feature_map(
                ($c).into_dim_size(),
                ($h).into_dim_size(),
                ($w).into_dim_size(),
            )
        }};
        ($f:expr $(,)?) => {{
            use $crate::shape::macros::internal::IntoDimSize;
            $crate::shape::TensorShape::flat(($f).into_dim_size())
        }};
    }
}
