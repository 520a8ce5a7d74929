use super::c_utils::{kernel_declaration, DUMMY_BIAS, DUMMY_WEIGHTS};
use crate::common::{ElemCount, MAX_BIAS_SIZE, MAX_WEIGHT_SIZE};
use crate::registry::{OperatorKind, OperatorRegistry};

use std::fmt;

/// Writes everything above the top function: includes, size macros, kernel
/// prototypes and the dummy parameter arrays.
pub struct HeaderEmitter {
    pub buffer_ceiling: ElemCount,
    pub input_capacity: ElemCount,
    pub output_capacity: ElemCount,
    pub kinds: Vec<OperatorKind>,
}

impl HeaderEmitter {
    pub fn new(buffer_ceiling: ElemCount) -> Self {
        Self {
            buffer_ceiling,
            input_capacity: buffer_ceiling,
            output_capacity: buffer_ceiling,
            kinds: vec![],
        }
    }

    pub fn emit<W: fmt::Write>(&self, registry: &OperatorRegistry, out: &mut W) -> fmt::Result {
        out.write_str("#include <cstddef>\n\n")?;
        writeln!(out, "#define MAX_FEAT_SIZE {}", self.buffer_ceiling)?;
        writeln!(out, "#define MAX_INPUT_SIZE {}", self.input_capacity)?;
        writeln!(out, "#define MAX_OUTPUT_SIZE {}", self.output_capacity)?;
        writeln!(out, "#define MAX_WEIGHT_SIZE {MAX_WEIGHT_SIZE}")?;
        writeln!(out, "#define MAX_BIAS_SIZE {MAX_BIAS_SIZE}")?;

        let defs = self
            .kinds
            .iter()
            .map(|&kind| registry.get(kind))
            .filter(|def| def.kernel.is_some())
            .collect::<Vec<_>>();
        if !defs.is_empty() {
            out.write_str("\n// Kernel declarations\n")?;
        }
        let mut weighted = false;
        for def in defs {
            if let Some(sig) = &def.kernel {
                weighted |= sig.weighted;
                writeln!(out, "{}", kernel_declaration(sig, def.arity()))?;
            }
        }

        if weighted {
            out.write_str("\n// Placeholder parameters so synthesis sizes weight memories\n")?;
            writeln!(out, "const float {DUMMY_WEIGHTS}[MAX_WEIGHT_SIZE] = {{ 0.1f }};")?;
            writeln!(out, "const float {DUMMY_BIAS}[MAX_BIAS_SIZE] = {{ 0.1f }};")?;
        }
        Ok(())
    }
}
