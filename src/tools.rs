//! Invocations of the external mesh worker and compressor.
//!
//! Every call is a literal argument vector handed to the OS; no shell ever
//! sees a file name or a configuration value.

use std::{
    ffi::{OsStr, OsString},
    fmt, io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
};

use tracing::debug;

use crate::{
    config::{CompressionMode, Paths, Profile},
    policy::Tuning,
};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The executable itself could not be found.
    #[error("executable not found: {}", program.display())]
    Missing { program: PathBuf },

    #[error("{} exited with {status}", program.display())]
    Failed { program: PathBuf, status: String },

    #[error("{} exited successfully but wrote no output at {}", program.display(), path.display())]
    NoOutput { program: PathBuf, path: PathBuf },

    #[error("failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Worker,
    Compressor,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Worker => "worker",
            Stage::Compressor => "compressor",
        })
    }
}

/// One fully formed external call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub stage: Stage,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// File the tool must leave behind on success.
    pub output: PathBuf,
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

impl Invocation {
    pub fn worker(
        paths: &Paths,
        profile: &Profile,
        tuning: &Tuning,
        input: &Path,
        output: &Path,
    ) -> Self {
        let mut args: Vec<OsString> = Vec::new();
        let mut push = |a: &dyn AsRef<OsStr>| args.push(a.as_ref().to_os_string());

        push(&"--background");
        // an uncaught exception in the script must fail the process
        push(&"--python-exit-code");
        push(&"1");
        push(&"--python");
        push(&paths.worker_script);
        push(&"--");
        push(&"--input");
        push(&input);
        push(&"--output");
        push(&output);
        push(&"--target");
        push(&profile.target_vertices.to_string());
        push(&"--maxtex");
        push(&profile.max_texture_edge.to_string());
        push(&"--normalize");
        push(&flag(profile.normalize));
        push(&"--matte");
        push(&flag(profile.matte));
        push(&"--merge-distance");
        push(&tuning.merge_distance.to_string());
        push(&"--min-ratio");
        push(&tuning.min_decimation_ratio.to_string());
        push(&"--roughness");
        push(&tuning.matte_roughness.to_string());
        push(&"--coat");
        push(&tuning.matte_coat_weight.to_string());
        push(&"--subsurface");
        push(&tuning.matte_subsurface_weight.to_string());

        Self {
            stage: Stage::Worker,
            program: paths.mesh_host.clone(),
            args,
            output: output.to_path_buf(),
        }
    }

    /// `None` when the mode disables compression.
    pub fn compressor(
        paths: &Paths,
        mode: CompressionMode,
        tuning: &Tuning,
        input: &Path,
        output: &Path,
    ) -> Option<Self> {
        let mode_flag = mode.flag()?;
        let args = vec![
            OsString::from("-i"),
            input.as_os_str().to_os_string(),
            OsString::from("-o"),
            output.as_os_str().to_os_string(),
            OsString::from("-si"),
            OsString::from(tuning.compressor_simplify_ratio.to_string()),
            OsString::from(mode_flag),
        ];

        Some(Self {
            stage: Stage::Compressor,
            program: paths.compressor.clone(),
            args,
            output: output.to_path_buf(),
        })
    }
}

/// Runs invocations to completion.
pub trait ToolRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<(), ToolError>;
}

/// Blocking `std::process` runner. Child output is inherited so the tools'
/// own logs stay visible.
#[derive(Debug, Default)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    fn run(&mut self, invocation: &Invocation) -> Result<(), ToolError> {
        debug!(
            program = %invocation.program.display(),
            args = ?invocation.args,
            "spawning {}",
            invocation.stage
        );

        let status = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .status()
            .map_err(|source| match source.kind() {
                io::ErrorKind::NotFound => ToolError::Missing {
                    program: invocation.program.clone(),
                },
                _ => ToolError::Spawn {
                    program: invocation.program.clone(),
                    source,
                },
            })?;

        check_status(invocation, status)
    }
}

fn check_status(invocation: &Invocation, status: ExitStatus) -> Result<(), ToolError> {
    if status.success() {
        Ok(())
    } else {
        Err(ToolError::Failed {
            program: invocation.program.clone(),
            status: status.to_string(),
        })
    }
}

/// A zero exit without the promised file still counts as a failure.
pub fn ensure_output(invocation: &Invocation) -> Result<(), ToolError> {
    if invocation.output.is_file() {
        Ok(())
    } else {
        Err(ToolError::NoOutput {
            program: invocation.program.clone(),
            path: invocation.output.clone(),
        })
    }
}
