use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("{}: file too small to be a valid executable ({len} bytes)", path.display())]
    TooSmall { path: PathBuf, len: usize },

    #[error("{}: missing MZ signature", path.display())]
    BadDosSignature { path: PathBuf },

    #[error("{}: invalid PE header offset {offset:#x}", path.display())]
    BadHeaderOffset { path: PathBuf, offset: u32 },

    #[error("{}: missing PE signature", path.display())]
    BadPeSignature { path: PathBuf },

    #[error("{}: unsupported optional header magic {magic:#x}", path.display())]
    UnsupportedMagic { path: PathBuf, magic: u16 },

    #[error("{}: optional header too small ({size:#x} bytes)", path.display())]
    OptionalHeaderTooSmall { path: PathBuf, size: u16 },

    #[error("{}: truncated {what}", path.display())]
    Truncated { path: PathBuf, what: &'static str },

    #[error("Report parse error: {0}")]
    ParseError(String),

    #[error("Lookup context building error: {0}")]
    ContextDeductionError(String),

    #[error("Could not scan directory: {0}")]
    ScanError(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    CsvError(#[from] csv::Error),
}

/// Lossy conversion used wherever a path ends up in a report
pub fn path_to_string<P: AsRef<Path>>(p: P) -> String {
    p.as_ref().to_string_lossy().into_owned()
}

/// Strip the verbatim prefix that `canonicalize` adds on Windows
pub fn decanonicalize(s: &str) -> String {
    s.strip_prefix(r"\\?\").unwrap_or(s).to_owned()
}

/// Canonical path in a form a user would type
pub fn readable_canonical_path<P: AsRef<Path>>(p: P) -> Result<String, LookupError> {
    Ok(decanonicalize(&path_to_string(fs_err::canonicalize(p)?)))
}

/// Canonical path with the verbatim prefix removed, if the file exists
pub(crate) fn absolute_path<P: AsRef<Path>>(p: P) -> Result<PathBuf, LookupError> {
    Ok(PathBuf::from(readable_canonical_path(p)?))
}
