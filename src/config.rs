//! The JSON configuration document: tool locations, directory roots,
//! profiles and tuning thresholds.

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Deserializer};

use crate::{
    error::{Error, Result},
    policy::Tuning,
};

pub const DEFAULT_CONFIG_FILE: &str = "gltf_vtt.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    /// Skip the compressor, the worker output is copied as is.
    None,
    /// Quantize with the compressor's default codec (`-c`).
    Standard,
    /// Quantize with extra compression (`-cc`).
    #[default]
    Maximum,
}

impl CompressionMode {
    pub fn enabled(self) -> bool {
        self != CompressionMode::None
    }

    pub fn flag(self) -> Option<&'static str> {
        match self {
            CompressionMode::None => None,
            CompressionMode::Standard => Some("-c"),
            CompressionMode::Maximum => Some("-cc"),
        }
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompressionMode::None => "none",
            CompressionMode::Standard => "standard",
            CompressionMode::Maximum => "maximum",
        })
    }
}

/// Accepts `true`/`false` as well as the `0`/`1` older configs use.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => Ok(b),
        Flag::Int(0) => Ok(false),
        Flag::Int(1) => Ok(true),
        Flag::Int(n) => Err(serde::de::Error::custom(format!(
            "expected 0 or 1, found {n}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Profile {
    #[serde(alias = "target_v")]
    pub target_vertices: u64,
    #[serde(alias = "res")]
    pub max_texture_edge: u32,
    #[serde(alias = "norm", deserialize_with = "flag")]
    pub normalize: bool,
    #[serde(deserialize_with = "flag")]
    pub matte: bool,
    #[serde(default)]
    pub compression: CompressionMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Paths {
    /// Mesh-editing host, either a path or a bare command looked up on `PATH`.
    #[serde(alias = "blender_exe")]
    pub mesh_host: PathBuf,
    #[serde(default = "default_worker_script")]
    pub worker_script: PathBuf,
    #[serde(alias = "meshopt_exe")]
    pub compressor: PathBuf,
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
}

fn default_worker_script() -> PathBuf {
    PathBuf::from("scripts/blender_worker.py")
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub paths: Paths,
    pub profiles: BTreeMap<String, Profile>,
    #[serde(default)]
    pub default_profile: Option<String>,
    #[serde(default)]
    pub tuning: Tuning,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound {
                what: "config file",
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json(&text, base)
    }

    /// Parses `text` and resolves relative paths against `base`.
    pub fn from_json(text: &str, base: &Path) -> Result<Self> {
        let mut config: Config = serde_json::from_str(text)
            .map_err(|e| Error::Config(format!("invalid config: {e}")))?;

        config.tuning.check().map_err(Error::Config)?;
        if config.profiles.is_empty() {
            return Err(Error::Config("no profiles defined".into()));
        }

        let paths = &mut config.paths;
        // a bare command name such as `blender` stays a PATH lookup
        if paths.mesh_host.components().count() > 1 {
            paths.mesh_host = resolve(base, &paths.mesh_host);
        }
        paths.worker_script = resolve(base, &paths.worker_script);
        paths.compressor = resolve(base, &paths.compressor);
        paths.source_dir = resolve(base, &paths.source_dir);
        paths.output_dir = resolve(base, &paths.output_dir);
        paths.temp_dir = resolve(base, &paths.temp_dir);

        Ok(config)
    }

    /// Picks the profile named on the command line, falling back to
    /// `default_profile`.
    pub fn select_profile(&self, requested: Option<&str>) -> Result<(&str, &Profile)> {
        let name = requested
            .or(self.default_profile.as_deref())
            .ok_or_else(|| {
                Error::Config(format!(
                    "no profile selected, choose one of: {}",
                    self.profile_names().join(", ")
                ))
            })?;

        self.profiles
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| {
                Error::Config(format!(
                    "invalid profile '{name}', choose one of: {}",
                    self.profile_names().join(", ")
                ))
            })
    }

    pub fn profile_names(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
