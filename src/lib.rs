pub mod config;
pub mod container;
pub mod error;
pub mod inspect;
pub mod pipeline;
pub mod policy;
pub mod shading;
pub mod textures;
pub mod tools;
pub mod uri;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::{
        config::{CompressionMode, Config, Profile},
        container::{ValidationError, validate},
        error::{Error, Result},
        inspect::{Inspection, Plan, inspect},
        pipeline::{BatchReport, FileState, Pipeline, Selection},
        textures::{TextureScope, downscale},
        tools::{ProcessRunner, ToolRunner},
        uri::is_safe,
    };
}
