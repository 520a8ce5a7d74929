//! Operator kinds, their parameter schemas and the kernel contracts they lower to.
//!
//! Every kind has exactly one [OperatorDef] and one [KernelSignature]. The real kernel
//! bodies are supplied by the synthesis backend; this module only describes their
//! calling convention. A conforming kernel is deterministic in its inputs and scalar
//! arguments and writes exactly the element count of its step's output shape.

use log::{debug, warn};
use nonzero::nonzero as nz;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::IntoEnumIterator;

use crate::common::DimSize;
use crate::error::CompileError;
use crate::syntax::{Block, ParamValue};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::IntoStaticStr,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum OperatorKind {
    Conv,
    MaxPool,
    AvgPool,
    GlobalAvgPool,
    Flatten,
    #[strum(serialize = "relu")]
    Activation,
    Linear,
    Add,
}

/// Parameters of a block after defaults are filled in and types are checked.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpParams {
    Conv(ConvParams),
    MaxPool(PoolParams),
    AvgPool(PoolParams),
    GlobalAvgPool,
    Flatten {
        in_features: Option<DimSize>,
    },
    Activation,
    Linear {
        in_features: Option<DimSize>,
        out_features: DimSize,
    },
    Add {
        with: Operand,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvParams {
    pub out_channels: DimSize,
    pub kernel_size: DimSize,
    pub stride: i64,
    pub padding: Padding,
    pub in_channels: Option<DimSize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolParams {
    pub kernel_size: DimSize,
    pub stride: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Padding {
    Explicit(u32),
    /// Pad so that a stride-1 window keeps the input's spatial size.
    Same,
}

/// The second operand of an elementwise combine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    /// The pipeline's external input.
    Input,
    /// The output of an earlier step.
    Step(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamType {
    PositiveInt,
    NonNegativeInt,
    Int,
    /// A non-negative integer or the string `"same"`.
    Padding,
    /// The string `"input"` or a step index.
    Operand,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamDefault {
    Required,
    /// Absent unless given; only used to cross-check an inferred value.
    Unchecked,
    Int(i64),
    Str(&'static str),
    /// Derived from another parameter or the operator name.
    Derived(&'static str),
}

#[derive(Debug)]
pub struct ParamSchema {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub ty: ParamType,
    pub default: ParamDefault,
}

/// A scalar argument passed to a kernel after its buffer arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ScalarArg {
    Channels,
    InChannels,
    InH,
    InW,
    OutChannels,
    OutH,
    OutW,
    KernelSize,
    Stride,
    Padding,
    Size,
    InFeatures,
    OutFeatures,
}

/// The C calling convention of a kernel:
/// `symbol(const float* in0[, const float* in1], float* out[, const float* weights,
/// const float* bias], int scalars...)`.
#[derive(Debug)]
pub struct KernelSignature {
    pub symbol: &'static str,
    pub weighted: bool,
    pub scalars: &'static [ScalarArg],
}

#[derive(Debug)]
pub struct OperatorDef {
    pub kind: OperatorKind,
    /// Names accepted in descriptions. The first is canonical.
    pub names: &'static [&'static str],
    pub params: &'static [ParamSchema],
    /// `None` for operators which only reinterpret a buffer.
    pub kernel: Option<KernelSignature>,
}

/// Maps operator names to their definitions.
#[derive(Debug)]
pub struct OperatorRegistry {
    defs: Vec<OperatorDef>,
}

/// Reads and type-checks a [Block]'s raw parameters against an [OperatorDef]'s schema.
struct ParamReader<'a> {
    step: usize,
    def: &'a OperatorDef,
    block: &'a Block,
    consumed: Vec<&'a str>,
}

const POOL_PARAMS: &[ParamSchema] = &[
    ParamSchema {
        name: "kernel_size",
        aliases: &["kernel"],
        ty: ParamType::PositiveInt,
        default: ParamDefault::Int(2),
    },
    ParamSchema {
        name: "stride",
        aliases: &[],
        ty: ParamType::Int,
        default: ParamDefault::Derived("kernel_size"),
    },
];

const POOL_SCALARS: &[ScalarArg] = &[
    ScalarArg::Channels,
    ScalarArg::InH,
    ScalarArg::InW,
    ScalarArg::OutH,
    ScalarArg::OutW,
    ScalarArg::KernelSize,
    ScalarArg::Stride,
];

/// Parameters which some generators attach to every block without meaning anything.
const IGNORED_PARAMS: &[&str] = &["filter"];

impl OperatorKind {
    /// The number of tensor inputs.
    pub fn arity(&self) -> u8 {
        match self {
            OperatorKind::Add => 2,
            _ => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        self.into()
    }
}

impl OpParams {
    pub fn kind(&self) -> OperatorKind {
        match self {
            OpParams::Conv(_) => OperatorKind::Conv,
            OpParams::MaxPool(_) => OperatorKind::MaxPool,
            OpParams::AvgPool(_) => OperatorKind::AvgPool,
            OpParams::GlobalAvgPool => OperatorKind::GlobalAvgPool,
            OpParams::Flatten { .. } => OperatorKind::Flatten,
            OpParams::Activation => OperatorKind::Activation,
            OpParams::Linear { .. } => OperatorKind::Linear,
            OpParams::Add { .. } => OperatorKind::Add,
        }
    }
}

impl fmt::Display for OpParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())?;
        match self {
            OpParams::Conv(conv) => write!(
                f,
                "(out_channels={}, kernel_size={}, stride={}, padding={})",
                conv.out_channels, conv.kernel_size, conv.stride, conv.padding
            ),
            OpParams::MaxPool(pool) | OpParams::AvgPool(pool) => write!(
                f,
                "(kernel_size={}, stride={})",
                pool.kernel_size, pool.stride
            ),
            OpParams::Linear { out_features, .. } => write!(f, "(out_features={out_features})"),
            OpParams::Add { with } => match with {
                Operand::Input => write!(f, "(with=input)"),
                Operand::Step(j) => write!(f, "(with={j})"),
            },
            OpParams::GlobalAvgPool | OpParams::Flatten { .. } | OpParams::Activation => Ok(()),
        }
    }
}

impl fmt::Display for Padding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Padding::Explicit(p) => write!(f, "{p}"),
            Padding::Same => write!(f, "same"),
        }
    }
}

impl OperatorDef {
    fn standard(kind: OperatorKind) -> Self {
        match kind {
            OperatorKind::Conv => OperatorDef {
                kind,
                names: &["conv", "convolution"],
                params: &[
                    ParamSchema {
                        name: "out_channels",
                        aliases: &["filter", "filters"],
                        ty: ParamType::PositiveInt,
                        default: ParamDefault::Required,
                    },
                    ParamSchema {
                        name: "kernel_size",
                        aliases: &["kernel"],
                        ty: ParamType::PositiveInt,
                        default: ParamDefault::Derived("operator name, else 3"),
                    },
                    ParamSchema {
                        name: "stride",
                        aliases: &[],
                        ty: ParamType::Int,
                        default: ParamDefault::Int(1),
                    },
                    ParamSchema {
                        name: "padding",
                        aliases: &["pad"],
                        ty: ParamType::Padding,
                        default: ParamDefault::Int(0),
                    },
                    ParamSchema {
                        name: "in_channels",
                        aliases: &[],
                        ty: ParamType::PositiveInt,
                        default: ParamDefault::Unchecked,
                    },
                ],
                kernel: Some(KernelSignature {
                    symbol: "conv",
                    weighted: true,
                    scalars: &[
                        ScalarArg::InChannels,
                        ScalarArg::InH,
                        ScalarArg::InW,
                        ScalarArg::OutChannels,
                        ScalarArg::OutH,
                        ScalarArg::OutW,
                        ScalarArg::KernelSize,
                        ScalarArg::Stride,
                        ScalarArg::Padding,
                    ],
                }),
            },
            OperatorKind::MaxPool => OperatorDef {
                kind,
                names: &["max_pool", "maxpool"],
                params: POOL_PARAMS,
                kernel: Some(KernelSignature {
                    symbol: "max_pool",
                    weighted: false,
                    scalars: POOL_SCALARS,
                }),
            },
            OperatorKind::AvgPool => OperatorDef {
                kind,
                names: &["avg_pool", "average_pool"],
                params: POOL_PARAMS,
                kernel: Some(KernelSignature {
                    symbol: "avg_pool",
                    weighted: false,
                    scalars: POOL_SCALARS,
                }),
            },
            OperatorKind::GlobalAvgPool => OperatorDef {
                kind,
                names: &["global_avg_pool"],
                params: &[],
                kernel: Some(KernelSignature {
                    symbol: "global_avg_pool",
                    weighted: false,
                    scalars: &[ScalarArg::Channels, ScalarArg::InH, ScalarArg::InW],
                }),
            },
            OperatorKind::Flatten => OperatorDef {
                kind,
                names: &["flatten"],
                params: &[ParamSchema {
                    name: "in_features",
                    aliases: &[],
                    ty: ParamType::PositiveInt,
                    default: ParamDefault::Unchecked,
                }],
                kernel: None,
            },
            OperatorKind::Activation => OperatorDef {
                kind,
                names: &["relu", "activation"],
                params: &[],
                kernel: Some(KernelSignature {
                    symbol: "relu",
                    weighted: false,
                    scalars: &[ScalarArg::Size],
                }),
            },
            OperatorKind::Linear => OperatorDef {
                kind,
                names: &["linear", "dense"],
                params: &[
                    ParamSchema {
                        name: "out_features",
                        aliases: &[],
                        ty: ParamType::PositiveInt,
                        default: ParamDefault::Required,
                    },
                    ParamSchema {
                        name: "in_features",
                        aliases: &[],
                        ty: ParamType::PositiveInt,
                        default: ParamDefault::Unchecked,
                    },
                ],
                kernel: Some(KernelSignature {
                    symbol: "linear",
                    weighted: true,
                    scalars: &[ScalarArg::InFeatures, ScalarArg::OutFeatures],
                }),
            },
            OperatorKind::Add => OperatorDef {
                kind,
                names: &["add", "elementwise_add", "elementwise_combine", "combine"],
                params: &[ParamSchema {
                    name: "with",
                    aliases: &["operand"],
                    ty: ParamType::Operand,
                    default: ParamDefault::Str("input"),
                }],
                kernel: Some(KernelSignature {
                    symbol: "add",
                    weighted: false,
                    scalars: &[ScalarArg::Size],
                }),
            },
        }
    }

    pub fn arity(&self) -> u8 {
        self.kind.arity()
    }

    fn schema(&self, name: &str) -> &'static ParamSchema {
        self.params
            .iter()
            .find(|p| p.name == name)
            .unwrap_or_else(|| panic!("{} has no parameter {name}", self.kind))
    }
}

impl OperatorRegistry {
    /// A registry holding one definition per [OperatorKind].
    pub fn standard() -> Self {
        OperatorRegistry {
            defs: OperatorKind::iter().map(OperatorDef::standard).collect(),
        }
    }

    pub fn defs(&self) -> &[OperatorDef] {
        &self.defs
    }

    pub fn get(&self, kind: OperatorKind) -> &OperatorDef {
        self.defs
            .iter()
            .find(|d| d.kind == kind)
            .expect("registry holds every kind")
    }

    /// Look up an operator by a name written in a description.
    ///
    /// Names of the form `NxN_conv` select [OperatorKind::Conv] and also carry a
    /// kernel size, which is returned alongside the definition.
    pub fn lookup(&self, name: &str) -> Option<(&OperatorDef, Option<DimSize>)> {
        // `elementwise-combine` and `elementwise_combine` name the same kind.
        let lowered = name.to_ascii_lowercase().replace('-', "_");
        if let Some(def) = self
            .defs
            .iter()
            .find(|d| d.names.contains(&lowered.as_str()))
        {
            return Some((def, None));
        }
        let kernel_size = square_conv_kernel(&lowered)?;
        Some((self.get(OperatorKind::Conv), Some(kernel_size)))
    }

    /// Resolve the block at index `step` into typed parameters.
    pub fn resolve(&self, step: usize, block: &Block) -> Result<OpParams, CompileError> {
        let Some((def, name_kernel)) = self.lookup(&block.kind) else {
            return Err(CompileError::UnknownOperator {
                step,
                name: block.kind.clone(),
            });
        };
        let mut reader = ParamReader {
            step,
            def,
            block,
            consumed: vec![],
        };
        let params = match def.kind {
            OperatorKind::Conv => {
                let out_channels = reader.positive("out_channels")?;
                let out_channels = reader.required("out_channels", out_channels)?;
                let kernel_size = match (reader.positive("kernel_size")?, name_kernel) {
                    (Some(k), Some(from_name)) if k != from_name => {
                        return Err(reader.error(
                            "kernel_size",
                            format!("{k} contradicts the operator name {}", block.kind),
                        ));
                    }
                    (Some(k), _) | (None, Some(k)) => k,
                    (None, None) => nz!(3u32),
                };
                OpParams::Conv(ConvParams {
                    out_channels,
                    kernel_size,
                    stride: reader.int("stride")?.unwrap_or(1),
                    padding: reader.padding("padding")?.unwrap_or(Padding::Explicit(0)),
                    in_channels: reader.positive("in_channels")?,
                })
            }
            OperatorKind::MaxPool | OperatorKind::AvgPool => {
                let kernel_size = reader.positive("kernel_size")?;
                let stride = reader.int("stride")?;
                let kernel_size = match (kernel_size, stride) {
                    (Some(k), _) => k,
                    (None, Some(s)) => u32::try_from(s)
                        .ok()
                        .and_then(DimSize::new)
                        .unwrap_or(nz!(2u32)),
                    (None, None) => nz!(2u32),
                };
                let pool = PoolParams {
                    kernel_size,
                    stride: stride.unwrap_or_else(|| kernel_size.get().into()),
                };
                if def.kind == OperatorKind::MaxPool {
                    OpParams::MaxPool(pool)
                } else {
                    OpParams::AvgPool(pool)
                }
            }
            OperatorKind::GlobalAvgPool => OpParams::GlobalAvgPool,
            OperatorKind::Flatten => OpParams::Flatten {
                in_features: reader.positive("in_features")?,
            },
            OperatorKind::Activation => OpParams::Activation,
            OperatorKind::Linear => {
                let out_features = reader.positive("out_features")?;
                OpParams::Linear {
                    out_features: reader.required("out_features", out_features)?,
                    in_features: reader.positive("in_features")?,
                }
            }
            OperatorKind::Add => OpParams::Add {
                with: reader.operand("with")?.unwrap_or(Operand::Input),
            },
        };
        reader.finish();
        Ok(params)
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        OperatorRegistry::standard()
    }
}

/// Parses `NxN_conv` names, returning `N`.
fn square_conv_kernel(name: &str) -> Option<DimSize> {
    let dims = name.strip_suffix("_conv")?;
    let (h, w) = dims.split_once('x')?;
    if h != w {
        return None;
    }
    h.parse::<DimSize>().ok()
}

impl<'a> ParamReader<'a> {
    /// Returns the raw value under `name` or one of its aliases.
    fn raw(&mut self, name: &'static str) -> Result<Option<&'a ParamValue>, CompileError> {
        let schema = self.def.schema(name);
        let mut found: Option<(&'a str, &'a ParamValue)> = None;
        for key in std::iter::once(&schema.name).chain(schema.aliases) {
            if let Some((k, v)) = self.block.params.get_key_value(*key) {
                if let Some((prev, _)) = found {
                    return Err(self.error(name, format!("given as both `{prev}` and `{k}`")));
                }
                found = Some((k.as_str(), v));
                self.consumed.push(k.as_str());
            }
        }
        Ok(found.map(|(_, v)| v))
    }

    fn int(&mut self, name: &'static str) -> Result<Option<i64>, CompileError> {
        debug_assert_eq!(self.def.schema(name).ty, ParamType::Int);
        match self.raw(name)? {
            None => Ok(None),
            Some(ParamValue::Int(v)) => Ok(Some(*v)),
            Some(other) => Err(self.type_error(name, "an integer", other)),
        }
    }

    fn positive(&mut self, name: &'static str) -> Result<Option<DimSize>, CompileError> {
        debug_assert_eq!(self.def.schema(name).ty, ParamType::PositiveInt);
        match self.raw(name)? {
            None => Ok(None),
            Some(ParamValue::Int(v)) => u32::try_from(*v)
                .ok()
                .and_then(DimSize::new)
                .map(Some)
                .ok_or_else(|| self.error(name, format!("must be a positive integer, got {v}"))),
            Some(other) => Err(self.type_error(name, "a positive integer", other)),
        }
    }

    fn padding(&mut self, name: &'static str) -> Result<Option<Padding>, CompileError> {
        debug_assert_eq!(self.def.schema(name).ty, ParamType::Padding);
        match self.raw(name)? {
            None => Ok(None),
            Some(ParamValue::Int(v)) => u32::try_from(*v)
                .map(|p| Some(Padding::Explicit(p)))
                .map_err(|_| self.error(name, format!("must not be negative, got {v}"))),
            Some(ParamValue::Str(s)) if s.eq_ignore_ascii_case("same") => Ok(Some(Padding::Same)),
            Some(ParamValue::Str(s)) if s.eq_ignore_ascii_case("valid") => {
                Ok(Some(Padding::Explicit(0)))
            }
            Some(other) => Err(self.type_error(name, "an integer or 'same'", other)),
        }
    }

    fn operand(&mut self, name: &'static str) -> Result<Option<Operand>, CompileError> {
        debug_assert_eq!(self.def.schema(name).ty, ParamType::Operand);
        match self.raw(name)? {
            None => Ok(None),
            Some(ParamValue::Str(s)) if s.eq_ignore_ascii_case("input") => Ok(Some(Operand::Input)),
            Some(ParamValue::Int(v)) => usize::try_from(*v)
                .map(|i| Some(Operand::Step(i)))
                .map_err(|_| self.error(name, format!("step index must not be negative, got {v}"))),
            Some(other) => Err(self.type_error(name, "'input' or a step index", other)),
        }
    }

    fn required<T>(&self, name: &'static str, value: Option<T>) -> Result<T, CompileError> {
        debug_assert_eq!(self.def.schema(name).default, ParamDefault::Required);
        value.ok_or_else(|| self.error(name, "is required".to_owned()))
    }

    fn error(&self, param: &'static str, reason: String) -> CompileError {
        CompileError::Parameter {
            step: self.step,
            kind: self.def.kind,
            param,
            reason,
        }
    }

    fn type_error(&self, param: &'static str, expected: &str, got: &ParamValue) -> CompileError {
        self.error(
            param,
            format!("expected {expected}, got {} {got}", got.type_name()),
        )
    }

    /// Report parameters nothing consumed.
    fn finish(self) {
        for (key, value) in &self.block.params {
            if self.consumed.contains(&key.as_str()) {
                continue;
            }
            if IGNORED_PARAMS.contains(&key.as_str()) {
                debug!(
                    "step {}: ignoring `{key}: {value}` on {}",
                    self.step, self.def.kind
                );
            } else {
                warn!(
                    "step {}: {} has no parameter `{key}`; ignoring it",
                    self.step, self.def.kind
                );
            }
        }
    }
}
