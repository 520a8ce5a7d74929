use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::ElemCount;
use crate::config::PipelineConfig;
use crate::error::{CompileError, Site};
use crate::planner::{BufferPlanner, BufferSlot, SlotId, StepUsage, ValueRef};
use crate::registry::{OpParams, Operand, OperatorKind, OperatorRegistry};
use crate::shape::{self, ShapeError, TensorShape};
use crate::syntax::{self, Architecture};

/// A statically scheduled pipeline: every step bound to the slots it reads and writes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePlan {
    pub input_shape: TensorShape,
    pub slots: Vec<BufferSlot>,
    /// Copies the external input into the first slot. Absent when there are no steps.
    pub load: Option<Transfer>,
    pub steps: Vec<Step>,
    pub store: Transfer,
    pub buffer_ceiling: ElemCount,
    pub input_capacity: ElemCount,
    pub output_capacity: ElemCount,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub kind: OperatorKind,
    pub params: OpParams,
    /// One buffer for unary operators; the chained value then the second operand for
    /// [OperatorKind::Add].
    pub inputs: Vec<BufferRef>,
    pub output: SlotId,
    pub input_shapes: Vec<TensorShape>,
    pub output_shape: TensorShape,
}

/// A bulk copy between two buffers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub from: BufferRef,
    pub to: BufferRef,
    pub shape: TensorShape,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferRef {
    ExternalInput,
    ExternalOutput,
    Slot(SlotId),
}

/// A block after kind, parameter and shape resolution, before slots are bound.
struct Resolved {
    params: OpParams,
    reads: Vec<ValueRef>,
    input_shapes: Vec<TensorShape>,
    output_shape: TensorShape,
    output_volume: ElemCount,
}

impl PipelinePlan {
    /// The shape copied to the external output.
    pub fn output_shape(&self) -> TensorShape {
        self.store.shape
    }

    /// The distinct operator kinds used, in order of first use.
    pub fn kinds_used(&self) -> Vec<OperatorKind> {
        self.steps.iter().map(|s| s.kind).unique().collect()
    }

    /// Slots kept out of the ping-pong rotation because a combine reads them late.
    pub fn retained_slots(&self) -> Vec<SlotId> {
        self.steps
            .iter()
            .filter_map(|step| match step.inputs[..] {
                [chained, BufferRef::Slot(operand)] if chained != BufferRef::Slot(operand) => {
                    Some(operand)
                }
                _ => None,
            })
            .unique()
            .sorted()
            .collect()
    }

    /// The plan's `bincode` encoding. Equal plans encode to equal bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }
}

impl fmt::Display for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferRef::ExternalInput => write!(f, "in"),
            BufferRef::ExternalOutput => write!(f, "out"),
            BufferRef::Slot(slot) => write!(f, "{slot}"),
        }
    }
}

/// Lower an [Architecture] into a [PipelinePlan].
pub fn compile(
    architecture: &Architecture,
    registry: &OperatorRegistry,
    config: &PipelineConfig,
) -> Result<PipelinePlan, CompileError> {
    let input_shape = config.input_shape;
    let input_volume = input_shape
        .element_count()
        .map_err(|source| CompileError::Shape {
            site: Site::Input,
            source,
        })?;
    if input_volume > config.input_capacity {
        return Err(CompileError::Capacity {
            site: Site::Input,
            required: input_volume,
            ceiling: config.input_capacity,
        });
    }

    let mut resolved: Vec<Resolved> = Vec::with_capacity(architecture.len());
    for (i, block) in architecture.blocks.iter().enumerate() {
        let params = registry.resolve(i, block)?;
        let kind = params.kind();
        let shape_of = |value: ValueRef| match value {
            ValueRef::Input => input_shape,
            ValueRef::Step(j) => resolved[j].output_shape,
        };

        let mut reads = vec![match i {
            0 => ValueRef::Input,
            _ => ValueRef::Step(i - 1),
        }];
        if let OpParams::Add { with } = params {
            reads.push(match with {
                Operand::Input => ValueRef::Input,
                Operand::Step(j) if j < i => ValueRef::Step(j),
                Operand::Step(j) => {
                    let reason = if j == i {
                        "names its own output as an operand".to_owned()
                    } else {
                        format!("names the output of step {j}, which runs later")
                    };
                    return Err(CompileError::Dependency {
                        step: i,
                        kind,
                        reason,
                    });
                }
            });
        }

        let input_shapes = reads.iter().map(|&r| shape_of(r)).collect::<Vec<_>>();
        let (output_shape, output_volume) = shape::infer(&params, &input_shapes)
            .and_then(|shape| Ok((shape, shape.element_count()?)))
            .map_err(|source| CompileError::Shape {
                site: Site::Step(i, kind),
                source,
            })?;
        debug!(
            "step {i}: {} `{}` [{}] -> {output_shape}",
            kind,
            block.kind,
            input_shapes.iter().join(", ")
        );
        resolved.push(Resolved {
            params,
            reads,
            input_shapes,
            output_shape,
            output_volume,
        });
    }

    let final_shape = resolved.last().map_or(input_shape, |r| r.output_shape);
    let final_volume = resolved.last().map_or(input_volume, |r| r.output_volume);
    let final_site = match resolved.len().checked_sub(1) {
        Some(last) => Site::Step(last, resolved[last].params.kind()),
        None => Site::Output,
    };
    if let Some(expected) = config.expected_output {
        if expected != final_shape {
            return Err(CompileError::Shape {
                site: final_site,
                source: ShapeError::OutputMismatch {
                    expected,
                    actual: final_shape,
                },
            });
        }
    }
    let usages = resolved
        .iter()
        .map(|r| StepUsage::new(r.params.kind(), r.output_volume, r.reads.clone()))
        .collect::<Vec<_>>();
    let assignment = BufferPlanner::new(config.buffer_ceiling).plan(input_volume, &usages)?;
    if final_volume > config.output_capacity {
        return Err(CompileError::Capacity {
            site: Site::Output,
            required: final_volume,
            ceiling: config.output_capacity,
        });
    }

    let bind = |value: ValueRef| {
        BufferRef::Slot(
            assignment
                .slot_of(value)
                .expect("planner assigns every value a slot"),
        )
    };

    let load = assignment.input.map(|slot| Transfer {
        from: BufferRef::ExternalInput,
        to: BufferRef::Slot(slot),
        shape: input_shape,
    });
    let store = Transfer {
        from: match resolved.len() {
            0 => BufferRef::ExternalInput,
            n => bind(ValueRef::Step(n - 1)),
        },
        to: BufferRef::ExternalOutput,
        shape: final_shape,
    };
    let steps = resolved
        .into_iter()
        .zip(&assignment.outputs)
        .enumerate()
        .map(|(index, (r, &output))| Step {
            index,
            kind: r.params.kind(),
            inputs: r.reads.iter().map(|&v| bind(v)).collect(),
            params: r.params,
            output,
            input_shapes: r.input_shapes,
            output_shape: r.output_shape,
        })
        .collect::<Vec<_>>();

    info!(
        "lowered {} steps: {input_shape} -> {final_shape} using {} slots",
        steps.len(),
        assignment.slots.len()
    );
    Ok(PipelinePlan {
        input_shape,
        slots: assignment.slots,
        load,
        steps,
        store,
        buffer_ceiling: config.buffer_ceiling,
        input_capacity: config.input_capacity,
        output_capacity: config.output_capacity,
    })
}

/// Parse `text` and lower it with the standard operator registry.
pub fn compile_str(text: &str, config: &PipelineConfig) -> Result<PipelinePlan, CompileError> {
    let architecture = syntax::parse(text)?;
    compile(&architecture, &OperatorRegistry::standard(), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConvParams, Padding};
    use crate::sample::strategies::arb_architecture;
    use crate::syntax::ParamValue;
    use crate::tshape;
    use nonzero::nonzero as nz;
    use proptest::prelude::*;

    fn slot(i: usize) -> BufferRef {
        BufferRef::Slot(SlotId(i))
    }

    #[test]
    fn test_relu_then_same_conv() {
        let plan = compile_str(
            "Block(relu, {}) -> Block(conv, {'out_channels': 32, 'kernel': 5, 'stride': 1, 'pad': 'same'})",
            &PipelineConfig::default(),
        )
        .unwrap();
        assert_eq!(plan.slots.len(), 2);
        assert_eq!(plan.steps[0].kind, OperatorKind::Activation);
        assert_eq!(plan.steps[0].inputs, vec![slot(0)]);
        assert_eq!(plan.steps[0].output, SlotId(1));
        assert_eq!(plan.steps[0].output_shape, tshape![3, 32, 32]);
        assert_eq!(plan.steps[1].inputs, vec![slot(1)]);
        assert_eq!(plan.steps[1].output, SlotId(0));
        assert_eq!(plan.steps[1].output_shape, tshape![32, 32, 32]);
        assert_eq!(
            plan.steps[1].params,
            OpParams::Conv(ConvParams {
                out_channels: nz!(32u32),
                kernel_size: nz!(5u32),
                stride: 1,
                padding: Padding::Same,
                in_channels: None,
            })
        );
        assert_eq!(
            plan.load,
            Some(Transfer {
                from: BufferRef::ExternalInput,
                to: slot(0),
                shape: tshape![3, 32, 32],
            })
        );
        assert_eq!(plan.store.from, slot(0));
        assert_eq!(plan.output_shape(), tshape![32, 32, 32]);
    }

    const RESIDUAL: &str = "Block('5x5_conv', {'filter': 32, 'padding': 'same'}) \
        -> Block('relu', {'filter': 32}) \
        -> Block('3x3_conv', {'filter': 32, 'padding': 'same'}) \
        -> Block('add', {'filter': 32})";

    #[test]
    fn test_residual_add_with_mismatched_input_fails() {
        let err = compile_str(RESIDUAL, &PipelineConfig::default()).unwrap_err();
        assert_eq!(
            err,
            CompileError::Shape {
                site: Site::Step(3, OperatorKind::Add),
                source: ShapeError::OperandMismatch {
                    left: tshape![32, 32, 32],
                    right: tshape![3, 32, 32],
                },
            }
        );
    }

    #[test]
    fn test_residual_add_retains_input_slot() {
        let config = PipelineConfig::new(tshape![32, 32, 32]);
        let plan = compile_str(RESIDUAL, &config).unwrap();
        assert_eq!(plan.slots.len(), 3);
        assert_eq!(plan.slots[0].live_until, 3);
        assert_eq!(plan.steps[3].inputs, vec![slot(1), slot(0)]);
        assert_eq!(plan.steps[3].output, SlotId(2));
        assert_eq!(plan.retained_slots(), vec![SlotId(0)]);
    }

    #[test]
    fn test_flatten_count_mismatch_reports_both_counts() {
        let err = compile_str(
            "Block(conv, {'filter': 64, 'padding': 'same'}) -> Block(max_pool, {'kernel_size': 2}) \
             -> Block(flatten, {'in_features': 3136}) -> Block(linear, {'out_features': 10})",
            &PipelineConfig::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            CompileError::Shape {
                site: Site::Step(2, OperatorKind::Flatten),
                source: ShapeError::CountMismatch {
                    param: "in_features",
                    expected: 3136,
                    actual: 64 * 16 * 16,
                },
            }
        );
    }

    #[test]
    fn test_classifier_head() {
        let plan = compile_str(
            "conv(filter=16, kernel=3, padding=1) -> global_avg_pool() -> flatten() -> dense(out_features=10)",
            &PipelineConfig::default(),
        )
        .unwrap();
        assert_eq!(
            plan.steps.iter().map(|s| s.output_shape).collect::<Vec<_>>(),
            vec![tshape![16, 32, 32], tshape![16, 1, 1], tshape![16], tshape![10]]
        );
        assert_eq!(plan.steps[2].output, plan.steps[1].output);
        assert_eq!(plan.output_shape(), tshape![10]);
        assert_eq!(plan.slots.len(), 2);
    }

    #[test]
    fn test_empty_architecture_copies_input() {
        let plan = compile_str("", &PipelineConfig::default()).unwrap();
        assert!(plan.slots.is_empty());
        assert!(plan.steps.is_empty());
        assert_eq!(plan.load, None);
        assert_eq!(
            plan.store,
            Transfer {
                from: BufferRef::ExternalInput,
                to: BufferRef::ExternalOutput,
                shape: tshape![3, 32, 32],
            }
        );
    }

    #[test]
    fn test_oversized_step_fails_without_a_plan() {
        let err = compile_str(
            "Block(conv, {'filter': 256, 'padding': 'same'})",
            &PipelineConfig::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            CompileError::Capacity {
                site: Site::Step(0, OperatorKind::Conv),
                required: 256 * 32 * 32,
                ceiling: 131072,
            }
        );
    }

    #[test]
    fn test_huge_conv_output_is_an_error_not_a_wrap() {
        let err = compile_str(
            "conv(out_channels=4000000000, kernel=1, padding=2000000000)",
            &PipelineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::Shape {
                site: Site::Step(0, OperatorKind::Conv),
                source: ShapeError::VolumeOverflow { .. },
            }
        ));
    }

    #[test]
    fn test_huge_input_shape_is_an_error_not_a_wrap() {
        let input = "4000000000x4000000000x4000000000"
            .parse::<TensorShape>()
            .unwrap();
        let err = compile_str("relu", &PipelineConfig::new(input)).unwrap_err();
        assert_eq!(
            err,
            CompileError::Shape {
                site: Site::Input,
                source: ShapeError::VolumeOverflow { shape: input },
            }
        );
    }

    #[test]
    fn test_port_capacities_are_checked() {
        let mut config = PipelineConfig::default();
        config.input_capacity = 1000;
        let err = compile_str("relu()", &config).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Capacity {
                site: Site::Input,
                ..
            }
        ));

        let mut config = PipelineConfig::default();
        config.output_capacity = 1000;
        let err = compile_str("relu()", &config).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Capacity {
                site: Site::Output,
                ..
            }
        ));
    }

    #[test]
    fn test_expected_output_is_enforced() {
        let config = PipelineConfig::default().expecting(tshape![10]);
        let err = compile_str("relu()", &config).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Shape {
                site: Site::Step(0, OperatorKind::Activation),
                source: ShapeError::OutputMismatch { .. },
            }
        ));
        let err = compile_str("", &config).unwrap_err();
        assert_eq!(err.step(), None);
    }

    #[test]
    fn test_combine_cannot_name_itself_or_later_steps() {
        let err = compile_str("relu() -> add(with=1)", &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, CompileError::Dependency { step: 1, .. }));
        let err = compile_str("relu() -> add(with=5)", &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, CompileError::Dependency { step: 1, .. }));
    }

    #[test]
    fn test_combine_with_an_earlier_step() {
        let plan = compile_str(
            "relu() -> conv(out_channels=3, padding='same') -> relu() -> add(with=0)",
            &PipelineConfig::default(),
        )
        .unwrap();
        let add = &plan.steps[3];
        assert_eq!(add.inputs[1], BufferRef::Slot(plan.steps[0].output));
        assert_ne!(add.output, plan.steps[0].output);
        assert_eq!(plan.slots.len(), 3);
    }

    #[test]
    fn test_unknown_operator_aborts() {
        let err = compile_str("relu() -> softmax()", &PipelineConfig::default()).unwrap_err();
        assert_eq!(
            err,
            CompileError::UnknownOperator {
                step: 1,
                name: "softmax".to_owned()
            }
        );
    }

    #[test]
    fn test_flatten_only_pipeline_still_ping_pongs() {
        let plan = compile_str("flatten", &PipelineConfig::default()).unwrap();
        assert_eq!(plan.slots.len(), 2);
        assert_eq!(plan.steps[0].output, SlotId(0));
        assert_eq!(plan.store.from, slot(0));
        assert_eq!(plan.output_shape(), tshape![3072]);
    }

    #[test]
    fn test_hyphenated_combine_name() {
        let plan = compile_str(
            "relu -> Block('elementwise-combine', {'filter': 3})",
            &PipelineConfig::default(),
        )
        .unwrap();
        assert_eq!(plan.steps[1].kind, OperatorKind::Add);
        assert_eq!(plan.slots.len(), 3);
    }

    #[test]
    fn test_compiling_twice_is_byte_identical() {
        let config = PipelineConfig::new(tshape![32, 32, 32]);
        let a = compile_str(RESIDUAL, &config).unwrap().to_bytes().unwrap();
        let b = compile_str(RESIDUAL, &config).unwrap().to_bytes().unwrap();
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn test_sampled_architectures_compile_deterministically(arch in arb_architecture()) {
            let registry = OperatorRegistry::standard();
            let config = PipelineConfig::default();
            let plan = compile(&arch, &registry, &config).unwrap();
            let again = compile(&arch, &registry, &config).unwrap();
            prop_assert_eq!(plan.to_bytes().unwrap(), again.to_bytes().unwrap());
            let reparsed = compile_str(&arch.to_string(), &config).unwrap();
            prop_assert_eq!(reparsed, plan);
        }

        #[test]
        fn test_sampled_chains_use_two_slots(arch in arb_architecture()) {
            let plan = compile(&arch, &OperatorRegistry::standard(), &PipelineConfig::default())
                .unwrap();
            prop_assert_eq!(plan.slots.len(), 2);
            prop_assert!(plan.retained_slots().is_empty());
            prop_assert!(plan.output_shape().is_flat());
        }

        #[test]
        fn test_wrong_flatten_count_is_caught(arch in arb_architecture()) {
            let mut arch = arch;
            let at = arch.blocks.iter().position(|b| b.kind == "flatten").unwrap();
            let ParamValue::Int(declared) = arch.blocks[at].params["in_features"] else {
                panic!("sampled flatten without in_features");
            };
            arch.blocks[at]
                .params
                .insert("in_features".to_owned(), ParamValue::Int(declared + 1));
            let err = compile(&arch, &OperatorRegistry::standard(), &PipelineConfig::default())
                .unwrap_err();
            prop_assert_eq!(
                err,
                CompileError::Shape {
                    site: Site::Step(at, OperatorKind::Flatten),
                    source: ShapeError::CountMismatch {
                        param: "in_features",
                        expected: (declared + 1) as ElemCount,
                        actual: declared as ElemCount,
                    },
                }
            );
        }
    }
}
