use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use gltf_vtt::{
    config::Config,
    pipeline::{BatchReport, FileState, Pipeline, Selection},
    tools::{Invocation, Stage, ToolError, ToolRunner},
    Error,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;

/// Stands in for the mesh host and the compressor. The worker copies its
/// input, the compressor writes a marker.
#[derive(Default)]
struct ScriptedRunner {
    calls: Vec<Invocation>,
    missing: Vec<Stage>,
    /// Input file names the worker exits non-zero on.
    worker_fails_on: Vec<&'static str>,
    /// Worker exits 0 without writing anything.
    worker_silent: bool,
    compressor_fails: bool,
}

fn arg_after(inv: &Invocation, flag: &str) -> PathBuf {
    let pos = inv.args.iter().position(|a| a == flag).unwrap();
    PathBuf::from(&inv.args[pos + 1])
}

impl ToolRunner for ScriptedRunner {
    fn run(&mut self, inv: &Invocation) -> Result<(), ToolError> {
        self.calls.push(inv.clone());
        if self.missing.contains(&inv.stage) {
            return Err(ToolError::Missing {
                program: inv.program.clone(),
            });
        }
        assert!(inv.output.parent().unwrap().is_dir());

        let failed = || ToolError::Failed {
            program: inv.program.clone(),
            status: "exit status: 1".into(),
        };
        let input = arg_after(inv, if inv.stage == Stage::Worker { "--input" } else { "-i" });

        match inv.stage {
            Stage::Worker => {
                let name = input.file_name().unwrap().to_str().unwrap();
                if self.worker_fails_on.contains(&name) {
                    return Err(failed());
                }
                if !self.worker_silent {
                    fs::copy(&input, &inv.output).unwrap();
                }
            }
            Stage::Compressor => {
                if self.compressor_fails {
                    return Err(failed());
                }
                fs::write(&inv.output, b"compressed").unwrap();
            }
        }
        Ok(())
    }
}

impl ScriptedRunner {
    fn stages(&self) -> Vec<Stage> {
        self.calls.iter().map(|c| c.stage).collect()
    }
}

struct Fixture {
    root: TempDir,
    config: Config,
}

impl Fixture {
    fn new(compression: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("scripts")).unwrap();
        fs::write(root.path().join("scripts/blender_worker.py"), b"").unwrap();
        fs::create_dir_all(root.path().join("source")).unwrap();

        let text = json!({
            "paths": {
                "mesh_host": "blender",
                "compressor": "bin/gltfpack",
                "source_dir": "source",
                "output_dir": "out",
                "temp_dir": "tmp"
            },
            "profiles": {
                "token": {
                    "target_vertices": 40000,
                    "max_texture_edge": 1024,
                    "normalize": true,
                    "matte": true,
                    "compression": compression
                }
            },
            "default_profile": "token"
        })
        .to_string();
        let config = Config::from_json(&text, root.path()).unwrap();
        Self { root, config }
    }

    fn source(&self, name: &str) -> PathBuf {
        self.config.paths.source_dir.join(name)
    }

    fn output(&self, name: &str) -> PathBuf {
        self.config.paths.output_dir.join(name)
    }

    fn add_glb(&self, name: &str, document: &Value) -> Vec<u8> {
        let bytes = glb(document);
        fs::write(self.source(name), &bytes).unwrap();
        bytes
    }

    fn add_model(&self, name: &str) -> Vec<u8> {
        self.add_glb(name, &json!({"asset": {"version": "2.0"}}))
    }

    fn temp_entries(&self) -> usize {
        fs::read_dir(&self.config.paths.temp_dir).unwrap().count()
    }

    fn run(&self, selection: Selection, runner: &mut ScriptedRunner) -> gltf_vtt::Result<BatchReport> {
        Pipeline::new(&self.config, None)?.run(&selection, runner)
    }
}

fn glb(document: &Value) -> Vec<u8> {
    glb_with_bin(document, &[])
}

fn glb_with_bin(document: &Value, bin: &[u8]) -> Vec<u8> {
    let mut json = serde_json::to_vec(document).unwrap();
    while json.len() % 4 != 0 {
        json.push(b' ');
    }
    let bin_chunk = if bin.is_empty() { 0 } else { 8 + bin.len() };
    let mut out = Vec::new();
    out.extend_from_slice(b"glTF");
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&((12 + 8 + json.len() + bin_chunk) as u32).to_le_bytes());
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(b"JSON");
    out.extend_from_slice(&json);
    if !bin.is_empty() {
        out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
        out.extend_from_slice(b"BIN\0");
        out.extend_from_slice(bin);
    }
    out
}

/// One open triangle: every edge is a boundary edge.
fn triangle_glb() -> Vec<u8> {
    let mut bin = Vec::new();
    for v in [0.0f32, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0] {
        bin.extend_from_slice(&v.to_le_bytes());
    }
    let doc = json!({
        "asset": {"version": "2.0"},
        "scene": 0,
        "scenes": [{"nodes": [0]}],
        "nodes": [{"mesh": 0}],
        "meshes": [{"primitives": [{"attributes": {"POSITION": 0}}]}],
        "buffers": [{"byteLength": bin.len()}],
        "bufferViews": [{"buffer": 0, "byteOffset": 0, "byteLength": bin.len()}],
        "accessors": [{
            "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
            "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 0.0]
        }]
    });
    glb_with_bin(&doc, &bin)
}

/// Shared buffer the fmt subscriber writes into.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

fn parent_of(path: &Path) -> PathBuf {
    path.parent().unwrap().to_path_buf()
}

#[test]
fn batch_continues_after_a_worker_failure() {
    let fx = Fixture::new("maximum");
    fx.add_model("a.glb");
    fx.add_model("b.glb");
    let mut runner = ScriptedRunner {
        worker_fails_on: vec!["a.glb"],
        ..Default::default()
    };

    let report = fx.run(Selection::Batch, &mut runner).unwrap();

    let states: Vec<_> = report
        .outcomes
        .iter()
        .map(|o| (o.file.as_str(), o.state))
        .collect();
    assert_eq!(states, vec![("a.glb", FileState::Failed), ("b.glb", FileState::Done)]);
    assert_eq!(report.failed(), 1);
    assert!(report.outcomes[0].error.as_deref().unwrap().contains("exit status: 1"));

    assert!(!fx.output("a_optimized.glb").exists());
    assert_eq!(fs::read(fx.output("b_optimized.glb")).unwrap(), b"compressed");
    assert_eq!(
        report.outcomes[1].output.as_deref(),
        Some(fx.output("b_optimized.glb").as_path())
    );

    assert_eq!(runner.stages(), vec![Stage::Worker, Stage::Worker, Stage::Compressor]);
    // each file gets its own workspace, and nothing is left behind
    let first = parent_of(&runner.calls[0].output);
    let second = parent_of(&runner.calls[1].output);
    assert_ne!(first, second);
    assert_eq!(parent_of(&first), fx.config.paths.temp_dir);
    assert_eq!(fx.temp_entries(), 0);
}

#[test]
fn compressor_writes_inside_the_workspace() {
    let fx = Fixture::new("standard");
    fx.add_model("dragon.glb");
    let mut runner = ScriptedRunner::default();

    fx.run(Selection::Batch, &mut runner).unwrap();

    let worker = &runner.calls[0];
    let compressor = &runner.calls[1];
    assert_eq!(arg_after(worker, "--input"), fx.source("dragon.glb"));
    assert_eq!(worker.output.file_name().unwrap(), "dragon.glb");
    assert_eq!(arg_after(compressor, "-i"), worker.output);
    assert_eq!(compressor.output.file_name().unwrap(), "dragon_optimized.glb");
    assert_eq!(parent_of(&compressor.output), parent_of(&worker.output));
    assert_eq!(compressor.args.last().unwrap(), "-c");
}

#[test]
fn missing_worker_executable_aborts_the_run() {
    let fx = Fixture::new("maximum");
    fx.add_model("a.glb");
    fx.add_model("b.glb");
    let mut runner = ScriptedRunner {
        missing: vec![Stage::Worker],
        ..Default::default()
    };

    let err = fx.run(Selection::Batch, &mut runner).unwrap_err();

    assert!(matches!(err, Error::Tool(ToolError::Missing { .. })));
    assert_eq!(runner.calls.len(), 1);
    assert_eq!(fx.temp_entries(), 0);
}

#[test]
fn missing_compressor_falls_back_to_a_copy() {
    let fx = Fixture::new("maximum");
    let original = fx.add_model("a.glb");
    let mut runner = ScriptedRunner {
        missing: vec![Stage::Compressor],
        ..Default::default()
    };

    let report = fx.run(Selection::Batch, &mut runner).unwrap();

    assert_eq!(report.outcomes[0].state, FileState::Done);
    assert_eq!(fs::read(fx.output("a_optimized.glb")).unwrap(), original);
}

#[test]
fn disabled_compression_copies_the_worker_output() {
    let fx = Fixture::new("none");
    let original = fx.add_model("a.glb");
    let mut runner = ScriptedRunner::default();

    let report = fx.run(Selection::Batch, &mut runner).unwrap();

    assert_eq!(runner.stages(), vec![Stage::Worker]);
    assert_eq!(report.outcomes[0].state, FileState::Done);
    assert_eq!(fs::read(fx.output("a_optimized.glb")).unwrap(), original);
}

#[test]
fn compressor_failure_fails_the_file() {
    let fx = Fixture::new("maximum");
    fx.add_model("a.glb");
    let mut runner = ScriptedRunner {
        compressor_fails: true,
        ..Default::default()
    };

    let report = fx.run(Selection::Batch, &mut runner).unwrap();

    assert_eq!(report.outcomes[0].state, FileState::Failed);
    assert!(!fx.output("a_optimized.glb").exists());
    assert_eq!(fx.temp_entries(), 0);
}

#[test]
fn worker_without_output_fails_the_file() {
    let fx = Fixture::new("maximum");
    fx.add_model("a.glb");
    let mut runner = ScriptedRunner {
        worker_silent: true,
        ..Default::default()
    };

    let report = fx.run(Selection::Batch, &mut runner).unwrap();

    assert_eq!(report.outcomes[0].state, FileState::Failed);
    assert_eq!(runner.stages(), vec![Stage::Worker]);
}

#[test]
fn unsafe_container_never_reaches_the_worker() {
    let fx = Fixture::new("maximum");
    fx.add_glb(
        "evil.glb",
        &json!({"asset": {"version": "2.0"}, "images": [{"uri": "../../secrets.png"}]}),
    );
    fx.add_model("good.glb");
    let mut runner = ScriptedRunner::default();

    let report = fx.run(Selection::Batch, &mut runner).unwrap();

    assert_eq!(report.outcomes[0].file, "evil.glb");
    assert_eq!(report.outcomes[0].state, FileState::Failed);
    assert!(report.outcomes[0]
        .error
        .as_deref()
        .unwrap()
        .contains("Unsafe image URI detected"));
    assert_eq!(report.outcomes[1].state, FileState::Done);
    assert!(runner
        .calls
        .iter()
        .all(|c| c.stage != Stage::Worker || arg_after(c, "--input") == fx.source("good.glb")));
}

#[test]
fn single_selection_strips_directories() {
    let fx = Fixture::new("maximum");
    fx.add_model("b.glb");
    let mut runner = ScriptedRunner::default();

    let report = fx
        .run(Selection::Single("../../b".into()), &mut runner)
        .unwrap();

    assert_eq!(report.outcomes[0].file, "b.glb");
    assert_eq!(report.outcomes[0].state, FileState::Done);
    assert_eq!(arg_after(&runner.calls[0], "--input"), fx.source("b.glb"));
}

#[test]
fn missing_single_input_is_skipped() {
    let fx = Fixture::new("maximum");
    let mut runner = ScriptedRunner::default();

    let report = fx.run(Selection::Single("ghost".into()), &mut runner).unwrap();

    assert_eq!(report.outcomes[0].file, "ghost.glb");
    assert_eq!(report.outcomes[0].state, FileState::Skipped);
    assert_eq!(report.skipped(), 1);
    assert_eq!(report.failed(), 0);
    assert!(runner.calls.is_empty());
}

#[test]
fn empty_batch_succeeds() {
    let fx = Fixture::new("maximum");
    fs::write(fx.source("readme.txt"), b"not a model").unwrap();
    let mut runner = ScriptedRunner::default();

    let report = fx.run(Selection::Batch, &mut runner).unwrap();

    assert!(report.outcomes.is_empty());
    assert_eq!(report.profile, "token");
    assert!(fx.config.paths.output_dir.is_dir());
}

#[test]
fn unknown_profile_is_fatal() {
    let fx = Fixture::new("maximum");
    match Pipeline::new(&fx.config, Some("tile")) {
        Err(Error::Config(msg)) => assert!(msg.contains("token")),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("unknown profile accepted"),
    }
}

#[test]
fn missing_worker_script_is_fatal() {
    let fx = Fixture::new("maximum");
    fx.add_model("a.glb");
    fs::remove_file(fx.root.path().join("scripts/blender_worker.py")).unwrap();
    let mut runner = ScriptedRunner::default();

    let err = fx.run(Selection::Batch, &mut runner).unwrap_err();

    assert!(matches!(err, Error::NotFound { what: "worker script", .. }));
    assert!(runner.calls.is_empty());
}

#[test]
fn missing_source_directory_is_created() {
    let fx = Fixture::new("maximum");
    fs::remove_dir(&fx.config.paths.source_dir).unwrap();
    let mut runner = ScriptedRunner::default();

    let report = fx.run(Selection::Batch, &mut runner).unwrap();

    assert!(report.outcomes.is_empty());
    assert!(fx.config.paths.source_dir.is_dir());
}

#[test]
fn open_mesh_is_reported_at_default_verbosity() {
    let fx = Fixture::new("maximum");
    fs::write(fx.source("tri.glb"), triangle_glb()).unwrap();
    fx.add_model("empty.glb");
    let mut runner = ScriptedRunner::default();

    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    let report = tracing::subscriber::with_default(subscriber, || {
        fx.run(Selection::Batch, &mut runner).unwrap()
    });

    assert_eq!(report.done(), 2);
    let text = logs.text();
    let warnings: Vec<&str> = text
        .lines()
        .filter(|line| line.contains("non-manifold geometry"))
        .collect();
    assert_eq!(warnings.len(), 1, "{text}");
    assert!(warnings[0].contains("WARN"));
    assert!(warnings[0].contains("tri.glb"));
    assert!(!text.contains("planned directives"));
}
