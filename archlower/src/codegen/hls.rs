use super::c_utils::{
    emit_copy, CBuffer, DUMMY_BIAS, DUMMY_WEIGHTS, INPUT_PORT, OUTPUT_PORT,
};
use super::header::HeaderEmitter;
use super::CodeGen;
use crate::common::ElemCount;
use crate::lower::{BufferRef, PipelinePlan, Step};
use crate::pprint::{pprint_write, PlanPrintStyle};
use crate::registry::{OpParams, OperatorRegistry, Padding, ScalarArg};
use crate::shape::TensorShape;
use crate::syntax::Architecture;
use crate::utils::{indent, join_into_string, LinePrefixWrite};

use std::fmt::{self, Write};

pub const TOP_FUNCTION: &str = "top_function";

/// Vendor-specific attributes attached to the top function's ports and buffers.
///
/// Implementations see only names and sizes, never the pipeline itself.
pub trait InterfaceBoilerplate {
    /// Lines declaring `port` as a global-memory port of `depth` elements.
    fn port_attributes(&self, port: &str, bundle: usize, depth: &str) -> Vec<String>;

    /// Lines declaring the control interface.
    fn control_attributes(&self) -> Vec<String>;

    /// Lines binding an on-chip buffer to a memory resource.
    fn buffer_attributes(&self, buffer: &str, capacity: ElemCount) -> Vec<String>;
}

/// Pragmas understood by Vitis HLS.
#[derive(Debug, Default, Clone, Copy)]
pub struct VitisHls;

/// Renders a [PipelinePlan] as a synthesizable C++ top function.
pub struct HlsCodeGenerator<'a, I: InterfaceBoilerplate = VitisHls> {
    plan: &'a PipelinePlan,
    architecture: Option<&'a Architecture>,
    registry: OperatorRegistry,
    interface: I,
    ports: [CBuffer; 2],
    buffers: Vec<CBuffer>,
}

impl InterfaceBoilerplate for VitisHls {
    fn port_attributes(&self, port: &str, bundle: usize, depth: &str) -> Vec<String> {
        vec![format!(
            "#pragma HLS INTERFACE m_axi port={port} bundle=gmem{bundle} depth={depth}"
        )]
    }

    fn control_attributes(&self) -> Vec<String> {
        vec!["#pragma HLS INTERFACE s_axilite port=return".to_owned()]
    }

    fn buffer_attributes(&self, buffer: &str, _capacity: ElemCount) -> Vec<String> {
        vec![format!(
            "#pragma HLS BIND_STORAGE variable={buffer} type=RAM_2P"
        )]
    }
}

impl<'a> HlsCodeGenerator<'a, VitisHls> {
    pub fn new(plan: &'a PipelinePlan) -> Self {
        HlsCodeGenerator {
            plan,
            architecture: None,
            registry: OperatorRegistry::standard(),
            interface: VitisHls,
            ports: [
                CBuffer::Port { name: INPUT_PORT },
                CBuffer::Port { name: OUTPUT_PORT },
            ],
            buffers: plan
                .slots
                .iter()
                .map(|slot| CBuffer::slot(slot.id, slot.capacity))
                .collect(),
        }
    }
}

impl<'a, I: InterfaceBoilerplate> HlsCodeGenerator<'a, I> {
    pub fn with_interface<J: InterfaceBoilerplate>(self, interface: J) -> HlsCodeGenerator<'a, J> {
        HlsCodeGenerator {
            plan: self.plan,
            architecture: self.architecture,
            registry: self.registry,
            interface,
            ports: self.ports,
            buffers: self.buffers,
        }
    }

    /// Echo `architecture` in the generated file's leading comment.
    pub fn with_architecture(mut self, architecture: &'a Architecture) -> Self {
        self.architecture = Some(architecture);
        self
    }

    fn buffer(&self, buffer: BufferRef) -> &CBuffer {
        match buffer {
            BufferRef::ExternalInput => &self.ports[0],
            BufferRef::ExternalOutput => &self.ports[1],
            BufferRef::Slot(slot) => &self.buffers[slot.0],
        }
    }

    fn emit_attributes<W: Write>(&self, lines: Vec<String>, out: &mut W) -> fmt::Result {
        for line in lines {
            writeln!(out, "{}{line}", indent(1))?;
        }
        Ok(())
    }

    fn emit_top<W: Write>(&self, out: &mut W) -> fmt::Result {
        let plan = self.plan;
        writeln!(
            out,
            "void {TOP_FUNCTION}(float* {INPUT_PORT}, float* {OUTPUT_PORT}) {{"
        )?;
        self.emit_attributes(
            self.interface
                .port_attributes(INPUT_PORT, 0, "MAX_INPUT_SIZE"),
            out,
        )?;
        self.emit_attributes(
            self.interface
                .port_attributes(OUTPUT_PORT, 1, "MAX_OUTPUT_SIZE"),
            out,
        )?;
        self.emit_attributes(self.interface.control_attributes(), out)?;

        if !self.buffers.is_empty() {
            writeln!(out)?;
            writeln!(out, "{}// On-chip buffers between steps", indent(1))?;
            for buffer in &self.buffers {
                buffer.emit(out, 1)?;
            }
            for (buffer, slot) in self.buffers.iter().zip(&plan.slots) {
                self.emit_attributes(
                    self.interface
                        .buffer_attributes(buffer.name(), slot.capacity),
                    out,
                )?;
            }
        }

        if let Some(load) = &plan.load {
            writeln!(out)?;
            writeln!(out, "{}// Load {} input", indent(1), load.shape)?;
            emit_copy(
                out,
                self.buffer(load.from),
                self.buffer(load.to),
                load.shape.volume().ok_or(fmt::Error)?,
                1,
            )?;
        }

        for step in &plan.steps {
            writeln!(out)?;
            self.emit_step(step, out)?;
        }

        writeln!(out)?;
        writeln!(out, "{}// Store {} output", indent(1), plan.store.shape)?;
        emit_copy(
            out,
            self.buffer(plan.store.from),
            self.buffer(plan.store.to),
            plan.store.shape.volume().ok_or(fmt::Error)?,
            1,
        )?;
        writeln!(out, "}}")
    }

    fn emit_step<W: Write>(&self, step: &Step, out: &mut W) -> fmt::Result {
        let shapes = join_into_string(&step.input_shapes, ", ");
        let output = self.buffer(BufferRef::Slot(step.output));
        let Some(sig) = &self.registry.get(step.kind).kernel else {
            return writeln!(
                out,
                "{}// Step {}: {} {shapes} -> {} reinterprets {} in place",
                indent(1),
                step.index,
                step.params,
                step.output_shape,
                output.name()
            );
        };

        writeln!(
            out,
            "{}// Step {}: {} {shapes} -> {}",
            indent(1),
            step.index,
            step.params,
            step.output_shape
        )?;
        let mut args = step
            .inputs
            .iter()
            .map(|&b| self.buffer(b).name().to_owned())
            .collect::<Vec<_>>();
        args.push(output.name().to_owned());
        if sig.weighted {
            args.push(DUMMY_WEIGHTS.to_owned());
            args.push(DUMMY_BIAS.to_owned());
        }
        for &scalar in sig.scalars {
            args.push(scalar_value(scalar, step).ok_or(fmt::Error)?.to_string());
        }
        writeln!(out, "{}{}({});", indent(1), sig.symbol, args.join(", "))
    }
}

impl<I: InterfaceBoilerplate> CodeGen for HlsCodeGenerator<'_, I> {
    fn emit<W: Write>(&self, include_plan: Option<PlanPrintStyle>, out: &mut W) -> fmt::Result {
        writeln!(out, "// Auto-generated HLS pipeline")?;
        if let Some(architecture) = self.architecture {
            writeln!(out, "// Architecture: {architecture}")?;
        }
        if let Some(style) = include_plan {
            writeln!(out, "//")?;
            let mut commenting_out = LinePrefixWrite::new(&mut *out, "// ");
            pprint_write(&mut commenting_out, self.plan, style)?;
        }
        writeln!(out)?;

        let mut header = HeaderEmitter::new(self.plan.buffer_ceiling);
        header.input_capacity = self.plan.input_capacity;
        header.output_capacity = self.plan.output_capacity;
        header.kinds = self.plan.kinds_used();
        header.emit(&self.registry, out)?;
        writeln!(out)?;

        self.emit_top(out)
    }
}

/// The value passed for a kernel's scalar argument. `None` if the step's shapes or
/// parameters don't carry it.
fn scalar_value(arg: ScalarArg, step: &Step) -> Option<i64> {
    let input = step.input_shapes[0];
    let output = step.output_shape;
    let value: u32 = match arg {
        ScalarArg::Channels | ScalarArg::InChannels => feature_map(input)?.0,
        ScalarArg::InH => feature_map(input)?.1,
        ScalarArg::InW => feature_map(input)?.2,
        ScalarArg::OutChannels => feature_map(output)?.0,
        ScalarArg::OutH => feature_map(output)?.1,
        ScalarArg::OutW => feature_map(output)?.2,
        ScalarArg::KernelSize => match &step.params {
            OpParams::Conv(conv) => conv.kernel_size.get(),
            OpParams::MaxPool(pool) | OpParams::AvgPool(pool) => pool.kernel_size.get(),
            _ => return None,
        },
        ScalarArg::Stride => {
            return match &step.params {
                OpParams::Conv(conv) => Some(conv.stride),
                OpParams::MaxPool(pool) | OpParams::AvgPool(pool) => Some(pool.stride),
                _ => None,
            }
        }
        ScalarArg::Padding => match &step.params {
            OpParams::Conv(conv) => match conv.padding {
                Padding::Explicit(pad) => pad,
                Padding::Same => conv.kernel_size.get() / 2,
            },
            _ => return None,
        },
        ScalarArg::Size => return output.volume().and_then(|v| i64::try_from(v).ok()),
        ScalarArg::InFeatures => flat(input)?,
        ScalarArg::OutFeatures => flat(output)?,
    };
    Some(i64::from(value))
}

fn feature_map(shape: TensorShape) -> Option<(u32, u32, u32)> {
    match shape {
        TensorShape::FeatureMap {
            channels,
            height,
            width,
        } => Some((channels.get(), height.get(), width.get())),
        TensorShape::Flat { .. } => None,
    }
}

fn flat(shape: TensorShape) -> Option<u32> {
    match shape {
        TensorShape::Flat { features } => Some(features.get()),
        TensorShape::FeatureMap { .. } => None,
    }
}
