//! Assignment of pipeline values to a small set of reusable on-chip buffer slots.
//!
//! Values are the loaded pipeline input and the output of each step. They are placed in
//! definition order by a linear scan: a slot is free for a value defined at time `t` once
//! every value in it has been read for the last time before `t`. The highest-numbered
//! free slot wins, and a new slot opens only when none is free. A plain chain therefore
//! ping-pongs between two slots, while a value read again much later keeps its slot out
//! of the rotation until that read.
//!
//! Steps with no kernel (flatten) reinterpret their input in place: their output shares
//! the input's slot and extends its lifetime.

use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::ElemCount;
use crate::error::{CompileError, Site};
use crate::registry::OperatorKind;
use crate::utils::ascii_name;

/// Index of a buffer slot. Slots are numbered from zero in the order they are opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub usize);

/// A value flowing through the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueRef {
    Input,
    Step(usize),
}

/// What the planner needs to know about one step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepUsage {
    pub kind: OperatorKind,
    /// Element count of the step's output.
    pub volume: ElemCount,
    pub reads: Vec<ValueRef>,
    /// If set, the output lives in the slot of `reads[0]` and no data moves.
    pub aliases_input: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferSlot {
    pub id: SlotId,
    /// The largest element count ever written into this slot.
    pub capacity: ElemCount,
    /// The last step index which reads a value held in this slot. The final store to
    /// the external output counts as the step after the last one.
    pub live_until: usize,
}

/// The planner's result: which slot holds each value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferAssignment {
    pub slots: Vec<BufferSlot>,
    /// The slot the pipeline input is loaded into. `None` only when there are no steps.
    pub input: Option<SlotId>,
    /// The output slot of each step.
    pub outputs: Vec<SlotId>,
}

#[derive(Clone, Debug)]
pub struct BufferPlanner {
    ceiling: ElemCount,
}

/// Times are shifted so that the input load happens at time 0, step `i` at time `i + 1`
/// and the final store at time `steps.len() + 1`.
type Time = usize;

struct SlotState {
    /// The last time any value in the slot is read.
    busy_until: Time,
    capacity: ElemCount,
}

impl SlotId {
    /// The lowercase name used for the slot's buffer in generated code.
    pub fn name(&self) -> String {
        ascii_name(self.0)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", ascii_name(self.0).to_ascii_uppercase())
    }
}

impl ValueRef {
    fn defined_at(&self) -> Time {
        match self {
            ValueRef::Input => 0,
            ValueRef::Step(i) => i + 1,
        }
    }
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueRef::Input => write!(f, "the pipeline input"),
            ValueRef::Step(i) => write!(f, "the output of step {i}"),
        }
    }
}

impl StepUsage {
    pub fn new(kind: OperatorKind, volume: ElemCount, reads: Vec<ValueRef>) -> Self {
        StepUsage {
            kind,
            volume,
            reads,
            aliases_input: kind == OperatorKind::Flatten,
        }
    }
}

impl BufferPlanner {
    pub fn new(ceiling: ElemCount) -> Self {
        BufferPlanner { ceiling }
    }

    pub fn ceiling(&self) -> ElemCount {
        self.ceiling
    }

    /// Assign every value to a slot, then check the assignment by replaying it.
    ///
    /// Each step must only read values defined before it. The last step's output is
    /// read once more by the final store.
    pub fn plan(
        &self,
        input_volume: ElemCount,
        steps: &[StepUsage],
    ) -> Result<BufferAssignment, CompileError> {
        if steps.is_empty() {
            return Ok(BufferAssignment {
                slots: vec![],
                input: None,
                outputs: vec![],
            });
        }

        let last_reads = last_reads(steps)?;

        if input_volume > self.ceiling {
            return Err(CompileError::Capacity {
                site: Site::Input,
                required: input_volume,
                ceiling: self.ceiling,
            });
        }
        let mut states: Vec<SlotState> = vec![];
        let input = allocate(&mut states, 0, last_reads[0], input_volume);
        debug!("pipeline input -> slot {input}");

        let mut outputs: Vec<SlotId> = Vec::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if step.volume > self.ceiling {
                return Err(CompileError::Capacity {
                    site: Site::Step(i, step.kind),
                    required: step.volume,
                    ceiling: self.ceiling,
                });
            }
            let defined_at = ValueRef::Step(i).defined_at();
            let slot = if step.aliases_input {
                let source = match step.reads.first() {
                    Some(ValueRef::Input) => input,
                    Some(ValueRef::Step(j)) => outputs[*j],
                    None => {
                        return Err(CompileError::Dependency {
                            step: i,
                            kind: step.kind,
                            reason: "reinterprets a value but reads none".to_owned(),
                        })
                    }
                };
                let state = &mut states[source.0];
                state.busy_until = state.busy_until.max(last_reads[defined_at]);
                state.capacity = state.capacity.max(step.volume);
                source
            } else {
                allocate(&mut states, defined_at, last_reads[defined_at], step.volume)
            };
            debug!(
                "step {i} ({}) reads [{}] -> slot {slot}",
                step.kind,
                step.reads.iter().join(", ")
            );
            outputs.push(slot);
        }

        // A non-empty pipeline always declares its ping-pong pair, even when every step
        // reinterprets the input in place.
        if states.len() < 2 {
            let capacity = states[0].capacity;
            debug!("slot B reserved as the ping-pong partner of slot A");
            states.push(SlotState {
                busy_until: 0,
                capacity,
            });
        }

        let assignment = BufferAssignment {
            slots: states
                .into_iter()
                .enumerate()
                .map(|(i, state)| BufferSlot {
                    id: SlotId(i),
                    capacity: state.capacity,
                    live_until: state.busy_until.saturating_sub(1),
                })
                .collect(),
            input: Some(input),
            outputs,
        };
        assignment.validate(steps)?;
        info!(
            "planned {} steps into {} slots",
            steps.len(),
            assignment.slots.len()
        );
        Ok(assignment)
    }
}

impl BufferAssignment {
    pub fn slot_of(&self, value: ValueRef) -> Option<SlotId> {
        match value {
            ValueRef::Input => self.input,
            ValueRef::Step(i) => self.outputs.get(i).copied(),
        }
    }

    /// Replay the schedule, checking that every read finds its value still in place and
    /// that no step overwrites a slot it reads.
    pub fn validate(&self, steps: &[StepUsage]) -> Result<(), CompileError> {
        let mut contents: Vec<Vec<ValueRef>> = vec![vec![]; self.slots.len()];
        if let Some(input) = self.input {
            contents[input.0].push(ValueRef::Input);
        }
        for (i, step) in steps.iter().enumerate() {
            let dependency = |reason: String| CompileError::Dependency {
                step: i,
                kind: step.kind,
                reason,
            };
            let Some(&out) = self.outputs.get(i) else {
                return Err(dependency("has no output slot".to_owned()));
            };
            for &read in &step.reads {
                let slot = self
                    .slot_of(read)
                    .ok_or_else(|| dependency(format!("reads {read}, which has no slot")))?;
                if !contents[slot.0].contains(&read) {
                    return Err(dependency(format!(
                        "reads {read} from slot {slot} after it was overwritten"
                    )));
                }
                if slot == out && !step.aliases_input {
                    return Err(dependency(format!(
                        "writes slot {slot} while reading {read} from it"
                    )));
                }
            }
            if step.aliases_input {
                contents[out.0].push(ValueRef::Step(i));
            } else {
                contents[out.0] = vec![ValueRef::Step(i)];
            }
        }
        if let Some(last) = steps.len().checked_sub(1) {
            let out = self.outputs[last];
            if !contents[out.0].contains(&ValueRef::Step(last)) {
                return Err(CompileError::Dependency {
                    step: last,
                    kind: steps[last].kind,
                    reason: format!("result in slot {out} is gone before the final store"),
                });
            }
        }
        Ok(())
    }
}

/// Compute, for each value indexed by its definition time, the last time it is read.
/// Unread values are "read" when defined.
fn last_reads(steps: &[StepUsage]) -> Result<Vec<Time>, CompileError> {
    let mut last: Vec<Time> = (0..=steps.len()).collect();
    for (i, step) in steps.iter().enumerate() {
        let now = ValueRef::Step(i).defined_at();
        for read in &step.reads {
            if let ValueRef::Step(j) = *read {
                if j >= i {
                    return Err(CompileError::Dependency {
                        step: i,
                        kind: step.kind,
                        reason: format!("reads {read}, which is not computed yet"),
                    });
                }
            }
            let slot = &mut last[read.defined_at()];
            *slot = (*slot).max(now);
        }
    }
    last[steps.len()] = steps.len() + 1;
    Ok(last)
}

/// Place a value defined at `defined_at` and last read at `read_until`.
fn allocate(
    states: &mut Vec<SlotState>,
    defined_at: Time,
    read_until: Time,
    volume: ElemCount,
) -> SlotId {
    let idx = match states.iter().rposition(|s| s.busy_until < defined_at) {
        Some(idx) => idx,
        None => {
            states.push(SlotState {
                busy_until: 0,
                capacity: 0,
            });
            states.len() - 1
        }
    };
    let state = &mut states[idx];
    state.busy_until = read_until;
    state.capacity = state.capacity.max(volume);
    SlotId(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chain(kinds: &[OperatorKind], volume: ElemCount) -> Vec<StepUsage> {
        kinds
            .iter()
            .enumerate()
            .map(|(i, &kind)| {
                let prev = if i == 0 {
                    ValueRef::Input
                } else {
                    ValueRef::Step(i - 1)
                };
                StepUsage::new(kind, volume, vec![prev])
            })
            .collect()
    }

    fn ids(slots: &[SlotId]) -> Vec<usize> {
        slots.iter().map(|s| s.0).collect()
    }

    #[test]
    fn test_chain_ping_pongs() {
        let steps = chain(
            &[
                OperatorKind::Conv,
                OperatorKind::Activation,
                OperatorKind::MaxPool,
                OperatorKind::Conv,
            ],
            100,
        );
        let plan = BufferPlanner::new(1000).plan(50, &steps).unwrap();
        assert_eq!(plan.input, Some(SlotId(0)));
        assert_eq!(ids(&plan.outputs), vec![1, 0, 1, 0]);
        assert_eq!(plan.slots.len(), 2);
        assert_eq!(plan.slots[0].capacity, 100);
        assert_eq!(plan.slots[0].live_until, 4);
        assert_eq!(plan.slots[1].live_until, 3);
    }

    #[test]
    fn test_combine_with_input_retains_a_slot() {
        let mut steps = chain(
            &[
                OperatorKind::Conv,
                OperatorKind::Activation,
                OperatorKind::Conv,
            ],
            10,
        );
        steps.push(StepUsage::new(
            OperatorKind::Add,
            10,
            vec![ValueRef::Step(2), ValueRef::Input],
        ));
        let plan = BufferPlanner::new(10).plan(10, &steps).unwrap();
        assert_eq!(ids(&plan.outputs), vec![1, 2, 1, 2]);
        assert_eq!(plan.slots.len(), 3);
        assert_eq!(plan.slots[0].live_until, 3);
    }

    #[test]
    fn test_flatten_shares_its_input_slot() {
        let steps = chain(
            &[
                OperatorKind::Conv,
                OperatorKind::Flatten,
                OperatorKind::Linear,
            ],
            64,
        );
        let plan = BufferPlanner::new(64).plan(8, &steps).unwrap();
        assert_eq!(ids(&plan.outputs), vec![1, 1, 0]);
        assert_eq!(plan.slots[1].live_until, 2);
    }

    #[test]
    fn test_leading_flatten_reinterprets_the_input_slot() {
        let steps = chain(&[OperatorKind::Flatten, OperatorKind::Linear], 12);
        let plan = BufferPlanner::new(64).plan(12, &steps).unwrap();
        assert_eq!(plan.input, Some(SlotId(0)));
        assert_eq!(ids(&plan.outputs), vec![0, 1]);
    }

    #[test]
    fn test_flatten_only_chain_keeps_a_ping_pong_pair() {
        let steps = chain(&[OperatorKind::Flatten, OperatorKind::Flatten], 12);
        let plan = BufferPlanner::new(64).plan(12, &steps).unwrap();
        assert_eq!(ids(&plan.outputs), vec![0, 0]);
        assert_eq!(plan.slots.len(), 2);
        assert_eq!(plan.slots[1].capacity, 12);
        assert_eq!(plan.slots[1].live_until, 0);
        plan.validate(&steps).unwrap();
    }

    #[test]
    fn test_no_steps_means_no_slots() {
        let plan = BufferPlanner::new(1).plan(1000, &[]).unwrap();
        assert!(plan.slots.is_empty());
        assert_eq!(plan.input, None);
    }

    #[test]
    fn test_value_over_ceiling_fails() {
        let mut steps = chain(&[OperatorKind::Activation, OperatorKind::Conv], 50);
        steps[1].volume = 51;
        let err = BufferPlanner::new(50).plan(50, &steps).unwrap_err();
        assert_eq!(
            err,
            CompileError::Capacity {
                site: Site::Step(1, OperatorKind::Conv),
                required: 51,
                ceiling: 50
            }
        );
        let err = BufferPlanner::new(50).plan(51, &steps).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Capacity {
                site: Site::Input,
                ..
            }
        ));
    }

    #[test]
    fn test_forward_read_is_a_dependency_error() {
        let steps = vec![
            StepUsage::new(OperatorKind::Conv, 4, vec![ValueRef::Input]),
            StepUsage::new(
                OperatorKind::Add,
                4,
                vec![ValueRef::Step(0), ValueRef::Step(1)],
            ),
        ];
        let err = BufferPlanner::new(4).plan(4, &steps).unwrap_err();
        assert!(matches!(err, CompileError::Dependency { step: 1, .. }));
    }

    #[test]
    fn test_validate_catches_clobbered_reads() {
        let steps = vec![
            StepUsage::new(OperatorKind::Conv, 4, vec![ValueRef::Input]),
            StepUsage::new(
                OperatorKind::Add,
                4,
                vec![ValueRef::Step(0), ValueRef::Input],
            ),
        ];
        let bad = BufferAssignment {
            slots: vec![
                BufferSlot {
                    id: SlotId(0),
                    capacity: 4,
                    live_until: 2,
                },
                BufferSlot {
                    id: SlotId(1),
                    capacity: 4,
                    live_until: 1,
                },
            ],
            input: Some(SlotId(0)),
            outputs: vec![SlotId(0), SlotId(1)],
        };
        let err = bad.validate(&steps).unwrap_err();
        assert!(matches!(err, CompileError::Dependency { step: 0, .. }));
    }

    #[test]
    fn test_slot_display() {
        assert_eq!(SlotId(0).to_string(), "A");
        assert_eq!(SlotId(1).name(), "b");
    }

    fn arb_chain_kinds() -> impl Strategy<Value = Vec<OperatorKind>> {
        prop::collection::vec(any::<OperatorKind>(), 1..24)
    }

    prop_compose! {
        fn arb_dag()(len in 1..20usize)(
            reads in prop::collection::vec((any::<prop::sample::Index>(), any::<Option<prop::sample::Index>>()), len),
            volumes in prop::collection::vec(1..=100u64, len),
        ) -> Vec<StepUsage> {
            reads
                .into_iter()
                .zip(volumes)
                .enumerate()
                .map(|(i, ((first, second), volume))| {
                    // Value `k` is the input for k == 0, else step k - 1.
                    let value = |idx: prop::sample::Index| match idx.index(i + 1) {
                        0 => ValueRef::Input,
                        k => ValueRef::Step(k - 1),
                    };
                    match second {
                        Some(second) => StepUsage::new(
                            OperatorKind::Add,
                            volume,
                            vec![value(first), value(second)],
                        ),
                        None => StepUsage::new(OperatorKind::Conv, volume, vec![value(first)]),
                    }
                })
                .collect()
        }
    }

    proptest! {
        #[test]
        fn test_chains_use_exactly_two_slots(kinds in arb_chain_kinds()) {
            let steps = chain(&kinds, 16);
            let plan = BufferPlanner::new(16).plan(16, &steps).unwrap();
            prop_assert_eq!(plan.slots.len(), 2);
        }

        #[test]
        fn test_combine_on_input_uses_three_slots(chain_len in 1..16usize) {
            let mut steps = chain(&vec![OperatorKind::Conv; chain_len], 8);
            steps.push(StepUsage::new(
                OperatorKind::Add,
                8,
                vec![ValueRef::Step(chain_len - 1), ValueRef::Input],
            ));
            let plan = BufferPlanner::new(8).plan(8, &steps).unwrap();
            prop_assert_eq!(plan.slots.len(), 3);
            let input_slot = plan.input.unwrap();
            prop_assert_eq!(plan.slots[input_slot.0].live_until, chain_len);
        }

        #[test]
        fn test_any_dag_plans_and_validates(steps in arb_dag()) {
            let planner = BufferPlanner::new(100);
            let plan = planner.plan(100, &steps).unwrap();
            prop_assert_eq!(&plan, &planner.plan(100, &steps).unwrap());
            for (step, slot) in steps.iter().zip(&plan.outputs) {
                prop_assert!(plan.slots[slot.0].capacity >= step.volume);
                for read in &step.reads {
                    let read_slot = plan.slot_of(*read).unwrap();
                    prop_assert_ne!(read_slot, *slot);
                }
            }
        }
    }
}
