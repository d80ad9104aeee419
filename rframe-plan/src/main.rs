#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

use std::path::PathBuf;

use clap::Parser;
use rframe::{
    config::{PipelineDesc, RenderConfig},
    descriptor::{DescriptorBindingSpec, descriptor_pool_sizes},
    shader::read_spirv,
};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Info,
    Debug,
    #[default]
    Warn,
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            // Off never installs a subscriber
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Print the descriptor plan for a TOML pipeline description without
/// touching a GPU.
#[derive(clap::Parser, Debug)]
struct CliArgs {
    /// Pipeline description file.
    pipeline: PathBuf,
    /// Render config file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Override `frames_in_flight` from the render config.
    #[arg(short, long)]
    frames: Option<u32>,
    /// Skip reading the referenced SPIR-V files.
    #[arg(long)]
    skip_shaders: bool,
    #[arg(short, long, default_value = "warn")]
    tracing_log_level: TracingLogLevel,
}

fn main() -> eyre::Result<()> {
    let cli_args = CliArgs::parse();

    if cli_args.tracing_log_level != TracingLogLevel::Off {
        let stdout_log = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        tracing_subscriber::registry()
            .with(stdout_log.with_filter(
                tracing_subscriber::filter::LevelFilter::from_level(
                    cli_args.tracing_log_level.into(),
                ),
            ))
            .init();
    }
    tracing::debug!("cli_args: {cli_args:#?}");

    let mut config = match &cli_args.config {
        Some(path) => RenderConfig::load(path)?,
        None => RenderConfig::default(),
    };
    if let Some(frames) = cli_args.frames {
        config.frames_in_flight = frames;
    }
    let frames = config.frames()?;

    let desc = PipelineDesc::load(&cli_args.pipeline)?;
    tracing::info!("Loaded pipeline description {}", cli_args.pipeline.display());

    println!("Pipeline: {}", desc.name);
    println!("Frames in flight: {frames}");
    println!(
        "Depth candidates: {:?}",
        config.depth_format_candidates()
    );

    println!("Shaders:");
    for shader in &desc.shaders {
        if cli_args.skip_shaders {
            println!("  {:?}: {}", shader.stage, shader.path.display());
        } else {
            let words = read_spirv(&shader.path)?;
            println!(
                "  {:?}: {} ({} words)",
                shader.stage,
                shader.path.display(),
                words.len()
            );
        }
    }

    let specs = desc.binding_specs();
    print_plan(&specs, frames.get())
}

fn print_plan(specs: &[DescriptorBindingSpec], frames: u32) -> eyre::Result<()> {
    println!("Bindings:");
    for spec in specs {
        println!(
            "  {:>3}  {:<24} count {:<5} stages {:?}",
            spec.binding,
            format!("{:?}", spec.kind),
            spec.count,
            spec.stages
        );
    }

    println!("Descriptor pool (max sets {frames}):");
    for size in descriptor_pool_sizes(specs)? {
        println!("  {:?} x {}", size.ty, size.descriptor_count);
    }

    let writes: Vec<&DescriptorBindingSpec> = specs
        .iter()
        .filter(|s| s.count > 0 && s.kind.is_buffer())
        .collect();
    let unsupported = specs
        .iter()
        .filter(|s| s.count > 0 && !s.kind.is_buffer())
        .count();
    println!("Writes per frame: {}", writes.len());
    for spec in &writes {
        println!(
            "  binding {} -> {} descriptor(s)",
            spec.binding, spec.count
        );
    }
    if unsupported > 0 {
        tracing::warn!(
            "{unsupported} binding(s) use non-buffer descriptors and cannot be written"
        );
    }
    Ok(())
}
