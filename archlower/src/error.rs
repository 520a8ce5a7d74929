use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::ElemCount;
use crate::registry::OperatorKind;
use crate::shape::ShapeError;
use crate::syntax::SyntaxError;

/// Why a description failed to compile. Compilation never yields a partial plan.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("syntax error at {0}")]
    Syntax(#[from] SyntaxError),
    #[error("step {step}: unknown operator `{name}`")]
    UnknownOperator { step: usize, name: String },
    #[error("step {step} ({kind}): parameter `{param}` {reason}")]
    Parameter {
        step: usize,
        kind: OperatorKind,
        param: &'static str,
        reason: String,
    },
    #[error("{site}: {source}")]
    Shape { site: Site, source: ShapeError },
    #[error("step {step} ({kind}): {reason}")]
    Dependency {
        step: usize,
        kind: OperatorKind,
        reason: String,
    },
    #[error("{site} needs {required} elements, but buffers hold at most {ceiling}")]
    Capacity {
        site: Site,
        required: ElemCount,
        ceiling: ElemCount,
    },
}

/// The part of a pipeline an error is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Site {
    Input,
    Step(usize, OperatorKind),
    Output,
}

impl CompileError {
    /// The index of the block at fault, if the error is tied to one.
    pub fn step(&self) -> Option<usize> {
        match self {
            CompileError::Syntax(_) => None,
            CompileError::UnknownOperator { step, .. }
            | CompileError::Parameter { step, .. }
            | CompileError::Dependency { step, .. } => Some(*step),
            CompileError::Shape { site, .. } | CompileError::Capacity { site, .. } => match site {
                Site::Step(step, _) => Some(*step),
                Site::Input | Site::Output => None,
            },
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Site::Input => write!(f, "the pipeline input"),
            Site::Step(step, kind) => write!(f, "step {step} ({kind})"),
            Site::Output => write!(f, "the pipeline output"),
        }
    }
}
