//! Classification of resource references found inside a container.
//!
//! A reference is only resolved relative to the directory holding the
//! container, so anything that could name a file outside that directory is
//! refused: absolute paths, drive letters, `scheme://` forms and `..`
//! segments, including their percent-encoded spellings.

use std::path::Path;

use percent_encoding::percent_decode_str;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriKind {
    /// `data:` URI, the payload lives inside the container.
    DataEmbedded,
    /// Plain relative path that stays below the container's directory.
    Relative,
    /// Relative path with a `..` segment or a backslash-separated one.
    Traversal,
    /// Absolute path or anything carrying a scheme or drive letter.
    Absolute,
}

impl UriKind {
    pub fn is_safe(self) -> bool {
        matches!(self, UriKind::DataEmbedded | UriKind::Relative)
    }
}

pub fn classify(uri: &str) -> UriKind {
    if uri.starts_with("data:") {
        return UriKind::DataEmbedded;
    }

    // decode exactly once, the same as a glTF loader does before opening the file
    let decoded = percent_decode_str(uri).decode_utf8_lossy();

    if Path::new(decoded.as_ref()).is_absolute()
        || decoded.contains(':')
        || decoded.starts_with('/')
        || decoded.starts_with('\\')
    {
        return UriKind::Absolute;
    }

    let normalized = decoded.replace('\\', "/");
    if normalized.split('/').any(|segment| segment == "..") {
        UriKind::Traversal
    } else {
        UriKind::Relative
    }
}

pub fn is_safe(uri: &str) -> bool {
    classify(uri).is_safe()
}
