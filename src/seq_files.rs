use crate::HandlerError;
use itertools::Itertools;
use std::fs;
use std::path::{Path, PathBuf};

/// Read-file suffixes recognised as sequencing output, longest first.
pub const SEQUENCE_EXTENSIONS: [&str; 4] = [".fastq.gz", ".fq.gz", ".fastq", ".fq"];

/// True iff `name` ends with one of the sequencing read suffixes (case-sensitive).
pub fn is_sequence_file(name: &str) -> bool {
    sequence_extension(name).is_some()
}

/// The matching read suffix of `name`, if any.
pub fn sequence_extension(name: &str) -> Option<&'static str> {
    SEQUENCE_EXTENSIONS
        .iter()
        .copied()
        .find(|ext| name.len() > ext.len() && name.ends_with(ext))
}

/// Base name of `path` as an owned string, empty if it has none.
pub fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Sorted names of the sequence files directly inside `dir`.
///
/// A missing directory yields an empty list rather than an error.
pub fn list_sequence_files(dir: &Path) -> Result<Vec<String>, HandlerError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_sequence_file(&name) {
            names.push(name);
        }
    }

    Ok(names.into_iter().sorted().collect())
}

/// Sorted immediate subdirectories of `dir`.
pub fn list_subdirectories(dir: &Path) -> Result<Vec<PathBuf>, HandlerError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut subdirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            subdirs.push(path);
        }
    }
    subdirs.sort();
    Ok(subdirs)
}

pub fn has_sequence_files_directly(dir: &Path) -> Result<bool, HandlerError> {
    Ok(!list_sequence_files(dir)?.is_empty())
}

pub fn has_sequence_files_in_children(dir: &Path) -> Result<bool, HandlerError> {
    for subdir in list_subdirectories(dir)? {
        if has_sequence_files_directly(&subdir)? {
            return Ok(true);
        }
    }
    Ok(false)
}
