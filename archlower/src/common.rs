use std::num::NonZeroU32;

pub type DimSize = NonZeroU32;

/// A count of `float` elements held by a buffer.
pub type ElemCount = u64;

/// `32 * 32 * 128`, the largest feature map the default pipeline buffers hold.
pub const MAX_FEAT_SIZE: ElemCount = 32 * 32 * 128;

/// Number of elements in the dummy weight array handed to weighted kernels.
pub const MAX_WEIGHT_SIZE: ElemCount = 128 * 128 * 5 * 5;

/// Number of elements in the dummy bias array handed to weighted kernels.
pub const MAX_BIAS_SIZE: ElemCount = 1024;
