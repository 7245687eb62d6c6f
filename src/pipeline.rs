//! Batch orchestration: validate each file, run the mesh worker and the
//! compressor inside a private temp dir, then place the result.
//!
//! A failure in one file never stops the batch. The only errors returned from
//! [`Pipeline::run`] are the ones that would fail every file the same way: a
//! bad profile, a missing worker script or worker executable, or roots that
//! cannot be created.

use std::{
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use tempfile::{NamedTempFile, TempDir};
use tracing::{Level, debug, error, info, warn};

use crate::{
    config::{Config, Profile},
    container,
    error::{Error, Result},
    inspect,
    tools::{self, Invocation, ToolError, ToolRunner},
};

const TEMP_PREFIX: &str = "gltf_vtt-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// One file name inside the source directory.
    Single(String),
    /// Every `.glb` in the source directory.
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Pending,
    Validated,
    Processed,
    Compressed,
    Done,
    Failed,
    Skipped,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileState::Pending => "pending",
            FileState::Validated => "validated",
            FileState::Processed => "processed",
            FileState::Compressed => "compressed",
            FileState::Done => "done",
            FileState::Failed => "failed",
            FileState::Skipped => "skipped",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOutcome {
    pub file: String,
    pub state: FileState,
    pub output: Option<PathBuf>,
    pub error: Option<String>,
}

impl FileOutcome {
    fn new(file: &str) -> Self {
        Self {
            file: file.to_string(),
            state: FileState::Pending,
            output: None,
            error: None,
        }
    }

    fn fail(&mut self, err: &Error) {
        error!(file = %self.file, error = %err, "processing failed");
        self.state = FileState::Failed;
        self.error = Some(err.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub profile: String,
    pub outcomes: Vec<FileOutcome>,
}

impl BatchReport {
    fn count(&self, state: FileState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn done(&self) -> usize {
        self.count(FileState::Done)
    }

    pub fn failed(&self) -> usize {
        self.count(FileState::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(FileState::Skipped)
    }
}

/// Reduces a user-supplied name to a bare `.glb` file name.
///
/// Anything before the last `/` or `\` is dropped, so the result can only
/// name a file directly inside the source directory.
pub fn sanitize_file_name(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw).trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    if has_glb_extension(base) {
        Some(base.to_string())
    } else {
        Some(format!("{base}.glb"))
    }
}

fn has_glb_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("glb"))
}

/// `model.glb` -> `model_optimized.glb`
pub fn output_name(file: &str) -> String {
    let path = Path::new(file);
    let stem = path
        .file_stem()
        .map_or_else(|| file.into(), |s| s.to_string_lossy());
    match path.extension() {
        Some(ext) => format!("{stem}_optimized.{}", ext.to_string_lossy()),
        None => format!("{stem}_optimized.glb"),
    }
}

/// Resolves the selection to file names inside `source_dir`, in processing
/// order.
pub fn collect_files(selection: &Selection, source_dir: &Path) -> Result<Vec<String>> {
    match selection {
        Selection::Single(raw) => {
            let name = sanitize_file_name(raw)
                .ok_or_else(|| Error::Config(format!("invalid input file name '{raw}'")))?;
            Ok(vec![name])
        }
        Selection::Batch => {
            let mut names = Vec::new();
            for entry in fs::read_dir(source_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    warn!(file = ?name, "skipping non UTF-8 file name");
                    continue;
                };
                if has_glb_extension(name) {
                    names.push(name.to_string());
                }
            }
            names.sort();
            Ok(names)
        }
    }
}

/// One file's trip through the toolchain. Owns the temp dir, which is removed
/// when the task is closed or dropped.
struct FileTask<'a> {
    name: &'a str,
    source: PathBuf,
    workspace: TempDir,
    final_output: PathBuf,
    profile: &'a Profile,
}

impl<'a> FileTask<'a> {
    fn new(name: &'a str, config: &Config, profile: &'a Profile) -> io::Result<Self> {
        let workspace = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir_in(&config.paths.temp_dir)?;
        debug!(file = name, workspace = %workspace.path().display(), "created temp dir");

        Ok(Self {
            name,
            source: config.paths.source_dir.join(name),
            workspace,
            final_output: config.paths.output_dir.join(output_name(name)),
            profile,
        })
    }

    fn worker_output(&self) -> PathBuf {
        self.workspace.path().join(self.name)
    }

    fn compressed_output(&self) -> PathBuf {
        self.workspace.path().join(output_name(self.name))
    }

    fn close(self) {
        let path = self.workspace.path().to_path_buf();
        if let Err(e) = self.workspace.close() {
            warn!(file = self.name, workspace = %path.display(), error = %e, "failed to remove temp dir");
        }
    }
}

pub struct Pipeline<'a> {
    config: &'a Config,
    profile_name: &'a str,
    profile: &'a Profile,
}

impl<'a> Pipeline<'a> {
    /// Resolves the profile up front; an unknown name fails before any file
    /// is touched.
    pub fn new(config: &'a Config, requested: Option<&str>) -> Result<Self> {
        let (profile_name, profile) = config.select_profile(requested)?;
        Ok(Self {
            config,
            profile_name,
            profile,
        })
    }

    pub fn profile(&self) -> (&str, &Profile) {
        (self.profile_name, self.profile)
    }

    /// Checks the worker script and creates the directory roots.
    pub fn prepare(&self) -> Result<()> {
        let paths = &self.config.paths;

        if !paths.worker_script.is_file() {
            return Err(Error::NotFound {
                what: "worker script",
                path: paths.worker_script.clone(),
            });
        }

        if !paths.source_dir.is_dir() {
            warn!(dir = %paths.source_dir.display(), "source directory missing, creating it");
            fs::create_dir_all(&paths.source_dir).map_err(|_| Error::NotFound {
                what: "source directory",
                path: paths.source_dir.clone(),
            })?;
        }
        fs::create_dir_all(&paths.output_dir)?;
        fs::create_dir_all(&paths.temp_dir)?;

        Ok(())
    }

    pub fn run<T: ToolRunner>(&self, selection: &Selection, runner: &mut T) -> Result<BatchReport> {
        self.prepare()?;

        let files = collect_files(selection, &self.config.paths.source_dir)?;
        let mut report = BatchReport {
            profile: self.profile_name.to_string(),
            outcomes: Vec::with_capacity(files.len()),
        };

        if files.is_empty() {
            info!(dir = %self.config.paths.source_dir.display(), "no files to process");
            return Ok(report);
        }

        info!(
            profile = self.profile_name,
            files = files.len(),
            compression = %self.profile.compression,
            "starting batch"
        );

        for name in &files {
            let outcome = self.process_file(name, runner)?;
            report.outcomes.push(outcome);
        }

        info!(
            done = report.done(),
            failed = report.failed(),
            skipped = report.skipped(),
            "batch complete"
        );
        Ok(report)
    }

    /// `Err` only for conditions that abort the whole run.
    fn process_file<T: ToolRunner>(&self, name: &str, runner: &mut T) -> Result<FileOutcome> {
        let mut outcome = FileOutcome::new(name);
        let source = self.config.paths.source_dir.join(name);

        if !source.is_file() {
            warn!(file = name, path = %source.display(), "input not found, skipping");
            outcome.state = FileState::Skipped;
            outcome.error = Some(format!("not found: {}", source.display()));
            return Ok(outcome);
        }

        if let Err(source_err) = container::validate(&source) {
            outcome.fail(&Error::Validation {
                path: source,
                source: source_err,
            });
            return Ok(outcome);
        }
        outcome.state = FileState::Validated;
        self.preflight(name, &source);

        let task = match FileTask::new(name, self.config, self.profile) {
            Ok(task) => task,
            Err(e) => {
                outcome.fail(&Error::from(e));
                return Ok(outcome);
            }
        };

        let started = Instant::now();
        let result = self.run_stages(&task, runner, &mut outcome);
        task.close();

        match result {
            Ok(()) => {
                info!(
                    file = name,
                    output = %outcome.output.as_deref().unwrap_or(Path::new("")).display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "done"
                );
                Ok(outcome)
            }
            // compressor absence is handled in place, so this is the worker
            Err(Error::Tool(ToolError::Missing { program })) => {
                error!(program = %program.display(), "mesh host not found, aborting run");
                Err(Error::Tool(ToolError::Missing { program }))
            }
            Err(e) => {
                outcome.fail(&e);
                Ok(outcome)
            }
        }
    }

    fn run_stages<T: ToolRunner>(
        &self,
        task: &FileTask<'_>,
        runner: &mut T,
        outcome: &mut FileOutcome,
    ) -> Result<()> {
        let paths = &self.config.paths;
        let tuning = &self.config.tuning;

        let worker = Invocation::worker(
            paths,
            task.profile,
            tuning,
            &task.source,
            &task.worker_output(),
        );
        info!(file = task.name, "running mesh worker");
        runner.run(&worker)?;
        tools::ensure_output(&worker)?;
        outcome.state = FileState::Processed;

        let staged = match Invocation::compressor(
            paths,
            task.profile.compression,
            tuning,
            &worker.output,
            &task.compressed_output(),
        ) {
            None => {
                debug!(file = task.name, "compression disabled, copying worker output");
                worker.output
            }
            Some(compressor) => match runner.run(&compressor) {
                Ok(()) => {
                    tools::ensure_output(&compressor)?;
                    outcome.state = FileState::Compressed;
                    compressor.output
                }
                Err(ToolError::Missing { program }) => {
                    warn!(
                        file = task.name,
                        program = %program.display(),
                        "compressor not found, copying uncompressed output"
                    );
                    worker.output
                }
                Err(e) => return Err(e.into()),
            },
        };

        place_output(&staged, &task.final_output)?;
        outcome.output = Some(task.final_output.clone());
        outcome.state = FileState::Done;
        Ok(())
    }

    /// Measures the file ahead of the worker: non-manifold geometry is
    /// always reported, the planned directives only at debug verbosity.
    /// Failures here never affect the file.
    fn preflight(&self, name: &str, source: &Path) {
        let inspection = match inspect::inspect(source, &self.config.tuning) {
            Ok(inspection) => inspection,
            Err(e) => {
                debug!(file = name, error = %e, "could not inspect file");
                return;
            }
        };
        inspection.manifold.flag(name);

        if !tracing::enabled!(Level::DEBUG) {
            return;
        }
        let Some(plan) = inspection.plan(self.profile, &self.config.tuning) else {
            debug!(file = name, "no triangle geometry");
            return;
        };

        let d = &plan.directives;
        debug!(
            file = name,
            vertices = plan.stats.vertex_count,
            merge_distance = d.merge_distance,
            decimation_ratio = ?d.decimation_ratio,
            floor_offset = d.floor_offset,
            normalization_scale = ?d.normalization_scale,
            "planned directives"
        );
        for t in &plan.textures {
            debug!(
                file = name,
                image = %t.image,
                "texture {}x{} -> {}x{}",
                t.from.0,
                t.from.1,
                t.to.0,
                t.to.1
            );
        }
    }
}

/// Copies `staged` to `dest` through a sibling temp file, so `dest` is either
/// absent or complete.
fn place_output(staged: &Path, dest: &Path) -> Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    io::copy(&mut fs::File::open(staged)?, &mut tmp)?;
    tmp.flush()?;
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}
