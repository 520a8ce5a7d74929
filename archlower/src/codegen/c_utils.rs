use std::fmt;

use crate::common::ElemCount;
use crate::planner::SlotId;
use crate::registry::{KernelSignature, ScalarArg};
use crate::utils::{indent, join_into_string};

pub const INPUT_PORT: &str = "input_gmem";
pub const OUTPUT_PORT: &str = "output_gmem";
pub const DUMMY_WEIGHTS: &str = "dummy_weights";
pub const DUMMY_BIAS: &str = "dummy_bias";

/// A `float` buffer visible in the top function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CBuffer {
    /// A pointer parameter mapped to global memory.
    Port { name: &'static str },
    /// An on-chip `static` array backing a pipeline slot.
    StaticArray { name: String, size: ElemCount },
}

impl CBuffer {
    pub fn slot(slot: SlotId, size: ElemCount) -> Self {
        CBuffer::StaticArray {
            name: format!("buffer_{}", slot.name()),
            size,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CBuffer::Port { name } => name,
            CBuffer::StaticArray { name, .. } => name,
        }
    }

    /// Writes the declaration. Ports are declared in the function signature, so only
    /// arrays emit anything.
    pub fn emit<W: fmt::Write>(&self, w: &mut W, depth: usize) -> fmt::Result {
        match self {
            CBuffer::Port { .. } => Ok(()),
            CBuffer::StaticArray { name, size } => {
                writeln!(w, "{}static float {name}[{size}];", indent(depth))
            }
        }
    }
}

/// Emit a loop copying `count` elements from `from` to `to`.
pub fn emit_copy<W: fmt::Write>(
    w: &mut W,
    from: &CBuffer,
    to: &CBuffer,
    count: ElemCount,
    depth: usize,
) -> fmt::Result {
    writeln!(
        w,
        "{}for (int i = 0; i < {count}; ++i) {}[i] = {}[i];",
        indent(depth),
        to.name(),
        from.name()
    )
}

/// Render the C prototype of a kernel taking `arity` input tensors.
pub fn kernel_declaration(sig: &KernelSignature, arity: u8) -> String {
    let mut params = match arity {
        1 => vec!["const float* input".to_owned()],
        _ => vec!["const float* a".to_owned(), "const float* b".to_owned()],
    };
    params.push("float* output".to_owned());
    if sig.weighted {
        params.push("const float* weights".to_owned());
        params.push("const float* bias".to_owned());
    }
    params.extend(sig.scalars.iter().map(|s| format!("int {}", scalar_name(*s))));
    format!("void {}({});", sig.symbol, join_into_string(params, ", "))
}

pub fn scalar_name(arg: ScalarArg) -> &'static str {
    arg.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{OperatorKind, OperatorRegistry};

    fn declaration(kind: OperatorKind) -> String {
        let registry = OperatorRegistry::standard();
        let def = registry.get(kind);
        kernel_declaration(def.kernel.as_ref().unwrap(), def.arity())
    }

    #[test]
    fn test_declarations_follow_kernel_contracts() {
        assert_eq!(
            declaration(OperatorKind::Conv),
            "void conv(const float* input, float* output, const float* weights, \
             const float* bias, int in_channels, int in_h, int in_w, int out_channels, \
             int out_h, int out_w, int kernel_size, int stride, int padding);"
        );
        assert_eq!(
            declaration(OperatorKind::MaxPool),
            "void max_pool(const float* input, float* output, int channels, int in_h, \
             int in_w, int out_h, int out_w, int kernel_size, int stride);"
        );
        assert_eq!(
            declaration(OperatorKind::GlobalAvgPool),
            "void global_avg_pool(const float* input, float* output, int channels, \
             int in_h, int in_w);"
        );
        assert_eq!(
            declaration(OperatorKind::Activation),
            "void relu(const float* input, float* output, int size);"
        );
        assert_eq!(
            declaration(OperatorKind::Linear),
            "void linear(const float* input, float* output, const float* weights, \
             const float* bias, int in_features, int out_features);"
        );
        assert_eq!(
            declaration(OperatorKind::Add),
            "void add(const float* a, const float* b, float* output, int size);"
        );
    }

    #[test]
    fn test_flatten_has_no_kernel() {
        let registry = OperatorRegistry::standard();
        assert!(registry.get(OperatorKind::Flatten).kernel.is_none());
    }

    #[test]
    fn test_slot_buffers() {
        let buf = CBuffer::slot(SlotId(1), 3072);
        assert_eq!(buf.name(), "buffer_b");
        let mut out = String::new();
        buf.emit(&mut out, 1).unwrap();
        assert_eq!(out, "    static float buffer_b[3072];\n");

        let mut out = String::new();
        emit_copy(
            &mut out,
            &CBuffer::Port { name: INPUT_PORT },
            &buf,
            3072,
            1,
        )
        .unwrap();
        assert_eq!(
            out,
            "    for (int i = 0; i < 3072; ++i) buffer_b[i] = input_gmem[i];\n"
        );
    }
}
