//! Managed regions inside files pigate does not own outright.
//!
//! A managed region is delimited by a begin and an end marker line. Each run
//! deletes every existing region and appends one fresh copy, so content
//! outside the markers survives and repeated runs never duplicate.

use std::fs;
use std::path::Path;

use crate::error::TemplateError;
use crate::install::{existing_mode, install_file, RenderOutcome, PUBLIC_MODE};

/// Marker pair for one named region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedBlock {
    name: String,
}

impl ManagedBlock {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn begin_marker(&self) -> String {
        format!("# BEGIN pigate {}", self.name)
    }

    pub fn end_marker(&self) -> String {
        format!("# END pigate {}", self.name)
    }

    /// `body` wrapped in this block's markers, newline-terminated.
    pub fn wrap(&self, body: &str) -> String {
        let body = body.trim_end_matches('\n');
        format!("{}\n{}\n{}\n", self.begin_marker(), body, self.end_marker())
    }
}

/// Remove every region between `begin` and `end` (inclusive) from `text`.
///
/// Returns the remaining text and the number of regions removed, or `Err`
/// with the offending marker when a begin marker is never closed.
pub fn strip_managed_block(text: &str, begin: &str, end: &str) -> Result<(String, usize), String> {
    let mut kept = String::with_capacity(text.len());
    let mut removed = 0;
    let mut inside = false;

    for line in text.split_inclusive('\n') {
        let marker = line.trim();
        if inside {
            if marker == end {
                inside = false;
                removed += 1;
            }
            continue;
        }
        if marker == begin {
            inside = true;
            continue;
        }
        kept.push_str(line);
    }

    if inside {
        return Err(begin.to_string());
    }
    Ok((kept, removed))
}

/// Delete every managed region from the file at `path`.
///
/// A missing file is a no-op. An unterminated region is an error and leaves
/// the file untouched.
pub fn remove_managed_block(path: &Path, begin: &str, end: &str) -> Result<usize, TemplateError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(TemplateError::Install {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let (kept, removed) = strip_managed_block(&text, begin, end).map_err(|marker| {
        TemplateError::UnterminatedBlock {
            path: path.to_path_buf(),
            marker,
        }
    })?;

    if removed > 0 {
        let mode = existing_mode(path).unwrap_or(PUBLIC_MODE);
        install_file(path, &kept, mode)?;
        tracing::debug!(path = %path.display(), removed, "Removed managed regions");
    }
    Ok(removed)
}

/// Replace the file's managed region for `block` with `body`.
///
/// Existing regions are dropped, trailing blank lines are collapsed and one
/// fresh region is appended after a blank separator line. The file's mode
/// is preserved.
pub fn upsert_managed_block(
    path: &Path,
    block: &ManagedBlock,
    body: &str,
) -> Result<RenderOutcome, TemplateError> {
    let current = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(source) => {
            return Err(TemplateError::Install {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let (kept, _) = strip_managed_block(&current, &block.begin_marker(), &block.end_marker())
        .map_err(|marker| TemplateError::UnterminatedBlock {
            path: path.to_path_buf(),
            marker,
        })?;

    let kept = kept.trim_end_matches('\n');
    let mut next = String::with_capacity(kept.len() + body.len() + 64);
    if !kept.is_empty() {
        next.push_str(kept);
        next.push_str("\n\n");
    }
    next.push_str(&block.wrap(body));

    let mode = existing_mode(path).unwrap_or(PUBLIC_MODE);
    install_file(path, &next, mode)
}
