use nonzero::nonzero as nz;
use serde::{Deserialize, Serialize};

use crate::common::{ElemCount, MAX_FEAT_SIZE};
use crate::shape::TensorShape;

/// Settings for compiling one pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub input_shape: TensorShape,
    /// The largest element count any on-chip slot may hold.
    pub buffer_ceiling: ElemCount,
    /// Element capacity of the external input port.
    pub input_capacity: ElemCount,
    /// Element capacity of the external output port.
    pub output_capacity: ElemCount,
    /// If set, the final step must produce exactly this shape.
    pub expected_output: Option<TensorShape>,
}

impl PipelineConfig {
    pub fn new(input_shape: TensorShape) -> Self {
        PipelineConfig {
            input_shape,
            ..Default::default()
        }
    }

    /// Sets the slot ceiling and both port capacities to `ceiling`.
    pub fn with_ceiling(mut self, ceiling: ElemCount) -> Self {
        self.buffer_ceiling = ceiling;
        self.input_capacity = ceiling;
        self.output_capacity = ceiling;
        self
    }

    pub fn expecting(mut self, output: TensorShape) -> Self {
        self.expected_output = Some(output);
        self
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            input_shape: TensorShape::feature_map(nz!(3u32), nz!(32u32), nz!(32u32)),
            buffer_ceiling: MAX_FEAT_SIZE,
            input_capacity: MAX_FEAT_SIZE,
            output_capacity: MAX_FEAT_SIZE,
            expected_output: None,
        }
    }
}
