//! Pre-flight validation of untrusted glTF/GLB containers.
//!
//! Only enough of the container is read to enumerate the `uri` fields of
//! `buffers` and `images`. Nothing else in the document is interpreted.

use std::{
    fmt,
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use serde_json::Value;

use crate::uri;

const GLB_MAGIC: [u8; 4] = *b"glTF";
const CHUNK_JSON: u32 = 0x4E4F_534A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Buffer,
    Image,
}

impl ReferenceKind {
    fn array(self) -> &'static str {
        match self {
            ReferenceKind::Buffer => "buffers",
            ReferenceKind::Image => "images",
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceKind::Buffer => f.write_str("buffer"),
            ReferenceKind::Image => f.write_str("image"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("invalid GLB magic {0:?}")]
    BadMagic([u8; 4]),

    #[error("first GLB chunk has type {0:#010x}, expected JSON")]
    NotJsonChunk(u32),

    #[error("Unsafe {kind} URI detected ({}[{index}]): {uri}", .kind.array())]
    UnsafeUri {
        kind: ReferenceKind,
        index: usize,
        uri: String,
    },

    /// Truncated data, IO failures and JSON syntax errors, with the cause
    /// folded into the message.
    #[error("malformed container: {0}")]
    Malformed(String),
}

impl ValidationError {
    fn malformed(context: &str, err: impl fmt::Display) -> Self {
        ValidationError::Malformed(format!("{context}: {err}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Binary,
    Text,
    Other,
}

fn format_of(path: &Path) -> Format {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("glb") => Format::Binary,
        Some("gltf") => Format::Text,
        _ => Format::Other,
    }
}

/// Checks every external reference of the container at `path`.
///
/// Files that are neither `.glb` nor `.gltf` pass without being opened.
pub fn validate(path: &Path) -> Result<(), ValidationError> {
    if !path.exists() {
        return Err(ValidationError::NotFound(path.to_path_buf()));
    }

    let document = match format_of(path) {
        Format::Binary => read_glb_json(path)?,
        Format::Text => read_gltf_json(path)?,
        Format::Other => return Ok(()),
    };

    check_document(&document)
}

fn read_u32(reader: &mut impl Read, what: &str) -> Result<u32, ValidationError> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|e| ValidationError::malformed(what, e))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_glb_json(path: &Path) -> Result<Value, ValidationError> {
    let file = File::open(path).map_err(|e| ValidationError::malformed("open", e))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| ValidationError::malformed("GLB header", e))?;
    if magic != GLB_MAGIC {
        return Err(ValidationError::BadMagic(magic));
    }
    let _version = read_u32(&mut reader, "GLB header")?;
    let _length = read_u32(&mut reader, "GLB header")?;

    let chunk_length = read_u32(&mut reader, "chunk header")?;
    let chunk_type = read_u32(&mut reader, "chunk header")?;
    if chunk_type != CHUNK_JSON {
        return Err(ValidationError::NotJsonChunk(chunk_type));
    }

    // `take` keeps a lying length field from driving a huge allocation
    let mut json = Vec::new();
    reader
        .take(u64::from(chunk_length))
        .read_to_end(&mut json)
        .map_err(|e| ValidationError::malformed("JSON chunk", e))?;
    if json.len() != chunk_length as usize {
        return Err(ValidationError::Malformed(format!(
            "JSON chunk: expected {chunk_length} bytes, found {}",
            json.len()
        )));
    }

    serde_json::from_slice(&json).map_err(|e| ValidationError::malformed("JSON chunk", e))
}

fn read_gltf_json(path: &Path) -> Result<Value, ValidationError> {
    let file = File::open(path).map_err(|e| ValidationError::malformed("open", e))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| ValidationError::malformed("glTF JSON", e))
}

/// Runs the URI checker over `buffers[*].uri` and `images[*].uri`.
pub fn check_document(document: &Value) -> Result<(), ValidationError> {
    for kind in [ReferenceKind::Buffer, ReferenceKind::Image] {
        let Some(entries) = document.get(kind.array()).and_then(Value::as_array) else {
            continue;
        };

        for (index, entry) in entries.iter().enumerate() {
            let Some(uri) = entry.get("uri") else {
                continue;
            };
            let Some(uri) = uri.as_str() else {
                return Err(ValidationError::Malformed(format!(
                    "{}[{index}].uri is not a string",
                    kind.array()
                )));
            };
            if !uri::is_safe(uri) {
                return Err(ValidationError::UnsafeUri {
                    kind,
                    index,
                    uri: uri.to_string(),
                });
            }
        }
    }

    Ok(())
}
