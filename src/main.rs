use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gltf_vtt::{
    config::{Config, DEFAULT_CONFIG_FILE},
    container,
    inspect,
    pipeline::{Pipeline, Selection},
    textures::{self, TextureScope},
    tools::ProcessRunner,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gltf_vtt")]
#[command(about = "Validate and batch-optimize glb models for virtual tabletops")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log filter, e.g. `debug` or `gltf_vtt=trace`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the optimization pipeline
    Run {
        #[arg(long, value_enum)]
        mode: Option<Mode>,

        /// Profile name from the configuration
        #[arg(long)]
        profile: Option<String>,

        /// File name inside the source directory (single mode)
        #[arg(long)]
        input: Option<String>,
    },

    /// Check containers for unsafe external references
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print the directives the worker would receive for a file
    Plan {
        file: PathBuf,

        #[arg(long)]
        profile: Option<String>,
    },

    /// Downscale the embedded textures of a glb
    Textures {
        input: PathBuf,
        output: PathBuf,

        #[arg(long)]
        max_edge: u32,

        /// Resize every image, not only the ones materials sample
        #[arg(long)]
        all: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Single,
    Batch,
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("failed to load {}", path.display()))
}

fn run(
    config: &Path,
    mode: Option<Mode>,
    profile: Option<&str>,
    input: Option<String>,
) -> Result<bool> {
    let config = load_config(config)?;
    let pipeline = Pipeline::new(&config, profile)?;

    let selection = match (mode, input) {
        (Some(Mode::Batch), _) | (None, None) => Selection::Batch,
        (Some(Mode::Single) | None, Some(name)) => Selection::Single(name),
        (Some(Mode::Single), None) => anyhow::bail!("single mode needs --input"),
    };

    let report = pipeline.run(&selection, &mut ProcessRunner)?;
    for outcome in &report.outcomes {
        match &outcome.error {
            Some(err) => println!("{}: {} ({err})", outcome.file, outcome.state),
            None => println!("{}: {}", outcome.file, outcome.state),
        }
    }
    Ok(report.failed() == 0)
}

fn validate(files: &[PathBuf]) -> bool {
    let mut all_ok = true;
    for file in files {
        match container::validate(file) {
            Ok(()) => println!("{}: ok", file.display()),
            Err(e) => {
                all_ok = false;
                println!("{}: rejected: {e}", file.display());
            }
        }
    }
    all_ok
}

fn plan(config: &Path, file: &Path, profile: Option<&str>) -> Result<()> {
    let config = load_config(config)?;
    let (name, profile) = config.select_profile(profile)?;
    let inspection = inspect::inspect(file, &config.tuning)?;

    let Some(plan) = inspection.plan(profile, &config.tuning) else {
        println!("{}: no triangle geometry", file.display());
        return Ok(());
    };
    plan.manifold.flag(&file.display().to_string());

    let d = &plan.directives;
    println!("file:               {}", file.display());
    println!("profile:            {name}");
    println!("vertices:           {}", plan.stats.vertex_count);
    println!("merge distance:     {}", d.merge_distance);
    match d.decimation_ratio {
        Some(r) => println!("decimation ratio:   {r:.4}"),
        None => println!("decimation ratio:   none"),
    }
    println!("floor offset:       {}", d.floor_offset);
    match d.normalization_scale {
        Some(s) => println!("normalization:      x{s}"),
        None => println!("normalization:      none"),
    }
    println!(
        "manifold:           {} boundary, {} non-manifold edges",
        plan.manifold.boundary_edges, plan.manifold.non_manifold_edges
    );
    for t in &plan.textures {
        println!(
            "texture {}: {}x{} -> {}x{}",
            t.image, t.from.0, t.from.1, t.to.0, t.to.1
        );
    }
    Ok(())
}

fn resize_textures(input: &Path, output: &Path, max_edge: u32, all: bool) -> Result<()> {
    container::validate(input).with_context(|| format!("refusing {}", input.display()))?;

    let file = File::open(input).with_context(|| format!("failed to open {}", input.display()))?;
    let mut reader = BufReader::new(file);
    let scope = if all { TextureScope::All } else { TextureScope::Used };

    let (bytes, resized) = textures::downscale(&mut reader, max_edge, scope)?;
    std::fs::write(output, bytes)
        .with_context(|| format!("failed to write {}", output.display()))?;

    info!(resized = resized.len(), output = %output.display(), "textures written");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let result = match cli.command {
        Command::Run {
            mode,
            profile,
            input,
        } => run(&cli.config, mode, profile.as_deref(), input),
        Command::Validate { files } => Ok(validate(&files)),
        Command::Plan { file, profile } => {
            plan(&cli.config, &file, profile.as_deref()).map(|()| true)
        }
        Command::Textures {
            input,
            output,
            max_edge,
            all,
        } => resize_textures(&input, &output, max_edge, all).map(|()| true),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
