use std::path::PathBuf;

use crate::{container::ValidationError, tools::ToolError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An input file, directory or required executable is absent.
    #[error("{what} not found: {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    #[error("validation failed for {}: {source}", path.display())]
    Validation {
        path: PathBuf,
        #[source]
        source: ValidationError,
    },

    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Missing or invalid configuration, or an unknown profile.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("texture processing failed: {0}")]
    Texture(String),

    #[error(transparent)]
    Gltf(#[from] gltf::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

