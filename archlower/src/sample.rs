//! Random architectures which are valid by construction.
//!
//! The sampler tracks the running shape while it draws blocks. It stays in feature-map
//! mode (convolutions, pooling, activations) until it draws a flatten, then continues in
//! flat mode (linear layers and activations). Every sample ends in a linear classifier,
//! and every declared `in_channels`/`in_features` matches the shape that reaches it.

use log::debug;
use rand::Rng;

use crate::syntax::{Architecture, Block};

const CONV_KERNELS: [i64; 2] = [3, 5];
const CONV_CHANNELS: [i64; 3] = [32, 64, 128];
const LINEAR_FEATURES: [i64; 3] = [128, 256, 512];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleOptions {
    pub input_channels: u32,
    /// Height and width of the (square) input.
    pub input_size: u32,
    /// Upper bound on the number of drawn blocks. At least three are drawn, and the
    /// closing flatten and classifier are added on top when needed.
    pub max_depth: usize,
}

#[derive(Clone, Copy, Debug)]
enum Running {
    FeatureMap { channels: i64, size: i64 },
    Flat { features: i64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Draw {
    Conv,
    Relu,
    MaxPool,
    GlobalAvgPool,
    Flatten,
    Linear,
}

impl Default for SampleOptions {
    fn default() -> Self {
        SampleOptions {
            input_channels: 3,
            input_size: 32,
            max_depth: 7,
        }
    }
}

/// Draw one architecture which compiles against a
/// `input_channels x input_size x input_size` input.
pub fn sample_architecture<R: Rng + ?Sized>(rng: &mut R, options: &SampleOptions) -> Architecture {
    let mut blocks = vec![];
    let mut running = Running::FeatureMap {
        channels: options.input_channels.into(),
        size: options.input_size.into(),
    };

    let depth = rng.gen_range(3..=options.max_depth.max(3));
    for _ in 0..depth {
        let draw = match running {
            Running::FeatureMap { size, .. } => {
                let mut candidates =
                    vec![Draw::Conv, Draw::Relu, Draw::GlobalAvgPool, Draw::Flatten];
                if size >= 2 {
                    candidates.push(Draw::MaxPool);
                }
                pick(rng, &candidates)
            }
            Running::Flat { .. } => pick(rng, &[Draw::Linear, Draw::Relu]),
        };
        let (block, next) = draw_block(rng, draw, running);
        blocks.push(block);
        running = next;
    }

    if let Running::FeatureMap { .. } = running {
        let (block, next) = draw_block(rng, Draw::Flatten, running);
        blocks.push(block);
        running = next;
    }
    if blocks.last().map(|b| b.kind.as_str()) != Some("linear") {
        let (block, _) = draw_block(rng, Draw::Linear, running);
        blocks.push(block);
    }

    let architecture = Architecture::new(blocks);
    debug!("sampled {architecture}");
    architecture
}

fn draw_block<R: Rng + ?Sized>(rng: &mut R, draw: Draw, running: Running) -> (Block, Running) {
    match (draw, running) {
        (Draw::Conv, Running::FeatureMap { channels, size }) => {
            let kernel = pick(rng, &CONV_KERNELS);
            let out_channels = pick(rng, &CONV_CHANNELS);
            let block = Block::new("conv")
                .with("in_channels", channels)
                .with("out_channels", out_channels)
                .with("kernel_size", kernel);
            // Explicit paddings which would shrink the map to nothing are never drawn.
            let paddings = [0, 1]
                .into_iter()
                .filter(|pad| size + 2 * pad >= kernel)
                .collect::<Vec<i64>>();
            let choice = rng.gen_range(0..=paddings.len());
            match paddings.get(choice) {
                Some(&pad) => (
                    block.with("padding", pad),
                    Running::FeatureMap {
                        channels: out_channels,
                        size: size + 2 * pad - kernel + 1,
                    },
                ),
                None => (
                    block.with("padding", "same"),
                    Running::FeatureMap {
                        channels: out_channels,
                        size,
                    },
                ),
            }
        }
        (Draw::MaxPool, Running::FeatureMap { channels, size }) => (
            Block::new("max_pool").with("kernel_size", 2),
            Running::FeatureMap {
                channels,
                size: size / 2,
            },
        ),
        (Draw::GlobalAvgPool, Running::FeatureMap { channels, .. }) => (
            Block::new("global_avg_pool"),
            Running::FeatureMap { channels, size: 1 },
        ),
        (Draw::Flatten, Running::FeatureMap { channels, size }) => {
            let features = channels * size * size;
            (
                Block::new("flatten").with("in_features", features),
                Running::Flat { features },
            )
        }
        (Draw::Linear, Running::Flat { features }) => {
            let out_features = pick(rng, &LINEAR_FEATURES);
            (
                Block::new("linear")
                    .with("in_features", features)
                    .with("out_features", out_features),
                Running::Flat {
                    features: out_features,
                },
            )
        }
        (Draw::Relu, _) => (Block::new("relu"), running),
        (draw, running) => unreachable!("cannot draw {draw:?} after {running:?}"),
    }
}

fn pick<T: Copy, R: Rng + ?Sized>(rng: &mut R, items: &[T]) -> T {
    items[rng.gen_range(0..items.len())]
}


#[cfg(test)]
mod tests {
    use super::strategies::arb_architecture;
    use super::*;
    use crate::syntax::{parse, ParamValue};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_same_seed_same_architecture() {
        let options = SampleOptions::default();
        let a = sample_architecture(&mut StdRng::seed_from_u64(7), &options);
        let b = sample_architecture(&mut StdRng::seed_from_u64(7), &options);
        assert_eq!(a, b);
    }

    #[test]
    fn test_flat_input_mode_only_draws_linear_or_relu() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..32 {
            let (block, _) = draw_block(&mut rng, Draw::Relu, Running::Flat { features: 10 });
            assert_eq!(block.kind, "relu");
            let (block, next) = draw_block(&mut rng, Draw::Linear, Running::Flat { features: 10 });
            assert_eq!(block.params["in_features"], ParamValue::Int(10));
            assert!(matches!(next, Running::Flat { .. }));
        }
    }

    #[test]
    fn test_conv_on_a_tiny_map_never_shrinks_it_away() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..64 {
            let (block, next) = draw_block(
                &mut rng,
                Draw::Conv,
                Running::FeatureMap {
                    channels: 8,
                    size: 1,
                },
            );
            let Running::FeatureMap { size, .. } = next else {
                panic!("conv left feature-map mode");
            };
            assert!(size >= 1, "{block:?} shrank the map to {size}");
        }
    }

    proptest! {
        #[test]
        fn test_samples_end_in_a_classifier(arch in arb_architecture()) {
            prop_assert!(arch.len() >= 3);
            let last = arch.blocks.last().unwrap();
            prop_assert_eq!(last.kind.as_str(), "linear");
            prop_assert_eq!(
                arch.blocks.iter().filter(|b| b.kind == "flatten").count(),
                1
            );
        }

        #[test]
        fn test_samples_print_as_parseable_text(arch in arb_architecture()) {
            prop_assert_eq!(parse(&arch.to_string()).unwrap(), arch);
        }
    }
}
