#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::{fs, time};

use archlower::codegen::{CodeGen, HlsCodeGenerator};
use archlower::common::ElemCount;
use archlower::pprint::{pprint_string, PlanPrintStyle};
use archlower::registry::OperatorRegistry;
use archlower::sample::{sample_architecture, SampleOptions};
use archlower::shape::TensorShape;
use archlower::syntax::Architecture;
use archlower::{compile, PipelineConfig, PipelinePlan};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Architecture description files. Reads stdin if neither files nor --arch are given
    files: Vec<PathBuf>,

    /// Architecture description given inline
    #[arg(long, conflicts_with = "files")]
    arch: Option<String>,

    /// Compile this many randomly sampled architectures instead of reading descriptions
    #[arg(long, conflicts_with_all = ["files", "arch"])]
    sample: Option<usize>,

    /// Seed for --sample. Drawn at random (and logged) if omitted
    #[arg(long, requires = "sample")]
    seed: Option<u64>,

    /// Most blocks drawn per sampled architecture, before the closing classifier
    #[arg(long, default_value_t = 7)]
    max_depth: usize,

    /// Shape of the pipeline input, as CxHxW or a feature count
    #[arg(long, default_value = "3x32x32")]
    input_shape: TensorShape,

    /// Largest element count any on-chip buffer may hold
    #[arg(long, default_value_t = archlower::common::MAX_FEAT_SIZE)]
    buffer_ceiling: ElemCount,

    /// Capacity of the input port (defaults to the buffer ceiling)
    #[arg(long)]
    input_capacity: Option<ElemCount>,

    /// Capacity of the output port (defaults to the buffer ceiling)
    #[arg(long)]
    output_capacity: Option<ElemCount>,

    /// Fail unless the pipeline produces this shape
    #[arg(long)]
    expected_output: Option<TensorShape>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::C)]
    format: OutputFormat,

    // Include the plan as a comment in generated C
    #[arg(long, default_value_t = false)]
    include_plan: bool,

    /// Plan style
    #[arg(long, value_enum, default_value_t = PlanPrintStyle::Compact)]
    plan_style: PlanPrintStyle,

    /// Output file, or a directory when compiling several files
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Number of architectures to compile in parallel
    #[arg(long, short)]
    jobs: Option<usize>,
}

#[derive(Clone, Copy, PartialEq, ValueEnum)]
enum OutputFormat {
    C,
    Plan,
    Bincode,
    /// The description itself, one architecture per line
    Arch,
}

/// One architecture description and where it came from.
struct Source {
    name: String,
    /// File name, without extension, for output written to a directory.
    stem: String,
    text: String,
}

impl OutputFormat {
    fn extension(&self) -> &'static str {
        match self {
            OutputFormat::C => "cpp",
            OutputFormat::Plan => "txt",
            OutputFormat::Bincode => "bin",
            OutputFormat::Arch => "arch",
        }
    }
}

impl Args {
    fn config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new(self.input_shape).with_ceiling(self.buffer_ceiling);
        if let Some(capacity) = self.input_capacity {
            config.input_capacity = capacity;
        }
        if let Some(capacity) = self.output_capacity {
            config.output_capacity = capacity;
        }
        config.expected_output = self.expected_output;
        config
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    run(&args)
}

fn run(args: &Args) -> Result<()> {
    let sources = read_sources(args)?;
    let config = args.config();
    let registry = OperatorRegistry::standard();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.jobs.unwrap_or(0))
        .build()
        .context("failed to start worker threads")?;
    let start_time = time::Instant::now();
    let rendered = pool.install(|| {
        sources
            .par_iter()
            .map(|source| {
                compile_source(source, &registry, &config, args)
                    .with_context(|| format!("failed to compile {}", source.name))
            })
            .collect::<Vec<_>>()
    });
    info!(
        "compiled {} architectures in {:?}",
        sources.len(),
        start_time.elapsed()
    );

    let outputs = rendered.into_iter().collect::<Result<Vec<_>>>()?;
    write_outputs(args, &sources, &outputs)
}

fn read_sources(args: &Args) -> Result<Vec<Source>> {
    if let Some(count) = args.sample {
        return sample_sources(args, count);
    }
    if let Some(text) = &args.arch {
        return Ok(vec![Source {
            name: "<arch>".to_owned(),
            stem: "arch".to_owned(),
            text: text.clone(),
        }]);
    }
    if args.files.is_empty() {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("failed to read stdin")?;
        return Ok(vec![Source {
            name: "<stdin>".to_owned(),
            stem: "stdin".to_owned(),
            text,
        }]);
    }
    args.files
        .iter()
        .map(|path| {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let Some(stem) = path.file_stem() else {
                bail!("cannot name the output for {}", path.display());
            };
            Ok(Source {
                name: path.display().to_string(),
                stem: stem.to_string_lossy().into_owned(),
                text,
            })
        })
        .collect()
}

fn sample_sources(args: &Args, count: usize) -> Result<Vec<Source>> {
    let TensorShape::FeatureMap {
        channels,
        height,
        width,
    } = args.input_shape
    else {
        bail!("--sample needs a CxHxW input shape, got {}", args.input_shape);
    };
    if height != width {
        bail!("--sample needs a square input, got {}", args.input_shape);
    }
    let options = SampleOptions {
        input_channels: channels.get(),
        input_size: height.get(),
        max_depth: args.max_depth,
    };
    let seed = args.seed.unwrap_or_else(rand::random);
    info!("sampling {count} architectures with seed {seed}");
    let mut rng = StdRng::seed_from_u64(seed);
    Ok((0..count)
        .map(|i| Source {
            name: format!("<sample {i}>"),
            stem: format!("sample-{i}"),
            text: sample_architecture(&mut rng, &options).to_string(),
        })
        .collect())
}

fn compile_source(
    source: &Source,
    registry: &OperatorRegistry,
    config: &PipelineConfig,
    args: &Args,
) -> Result<Vec<u8>> {
    let architecture: Architecture = source.text.parse()?;
    let plan = compile(&architecture, registry, config)?;
    info!(
        "{}: {} steps, {} slots, output {}",
        source.name,
        plan.steps.len(),
        plan.slots.len(),
        plan.output_shape()
    );
    render(&architecture, &plan, args)
}

fn render(architecture: &Architecture, plan: &PipelinePlan, args: &Args) -> Result<Vec<u8>> {
    Ok(match args.format {
        OutputFormat::C => {
            let plan_style = args.include_plan.then_some(args.plan_style);
            HlsCodeGenerator::new(plan)
                .with_architecture(architecture)
                .emit_string(plan_style)?
                .into_bytes()
        }
        OutputFormat::Plan => pprint_string(plan, args.plan_style).into_bytes(),
        OutputFormat::Bincode => plan.to_bytes()?,
        OutputFormat::Arch => format!("{architecture}\n").into_bytes(),
    })
}

fn write_outputs(args: &Args, sources: &[Source], outputs: &[Vec<u8>]) -> Result<()> {
    let Some(output) = &args.output else {
        let mut stdout = io::stdout().lock();
        for (source, bytes) in sources.iter().zip(outputs) {
            let commented = matches!(args.format, OutputFormat::C | OutputFormat::Plan);
            if sources.len() > 1 && commented {
                writeln!(stdout, "// ===== {}", source.name)?;
            }
            stdout.write_all(bytes)?;
        }
        return Ok(());
    };

    if sources.len() == 1 && !output.is_dir() {
        return write_file(output, &outputs[0]);
    }
    let mut stems: HashMap<&str, &str> = HashMap::new();
    for source in sources {
        if let Some(earlier) = stems.insert(&source.stem, &source.name) {
            bail!(
                "{earlier} and {} would both be written to {}.{}",
                source.name,
                output.join(&source.stem).display(),
                args.format.extension()
            );
        }
    }
    fs::create_dir_all(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    for (source, bytes) in sources.iter().zip(outputs) {
        let dest = output.join(format!("{}.{}", source.stem, args.format.extension()));
        write_file(&dest, bytes)?;
    }
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    info!("writing {}", path.display());
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}
