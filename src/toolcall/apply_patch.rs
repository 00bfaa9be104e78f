//! apply_patch body validation.
//!
//! The patch format is line-oriented: an envelope of `*** Begin Patch` /
//! `*** End Patch`, per-file sections introduced by `*** Add File: `,
//! `*** Delete File: ` or `*** Update File: ` (optionally followed by
//! `*** Move to: `), update hunks delimited by `@@`, and change lines
//! prefixed with space, `+` or `-`. Validation is purely syntactic; file
//! contents are never interpreted.

use std::fmt;

/// A patch validation failure with the 1-based line it occurred on.
#[derive(Debug, PartialEq, Eq)]
pub struct PatchError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for PatchError {}

const BEGIN: &str = "*** Begin Patch";
const END: &str = "*** End Patch";
const ADD: &str = "*** Add File: ";
const DELETE: &str = "*** Delete File: ";
const UPDATE: &str = "*** Update File: ";
const MOVE_TO: &str = "*** Move to: ";
const EOF_MARKER: &str = "*** End of File";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Add,
    Delete,
    Update { in_hunk: bool },
}

/// Validate an apply_patch body.
///
/// # Errors
///
/// Returns [`PatchError`] on the first structural violation.
pub fn validate_patch(body: &str) -> Result<(), PatchError> {
    let mut lines = body.lines().enumerate().peekable();

    let Some((_, first)) = lines.next() else {
        return Err(err(1, "empty patch body"));
    };
    if first.trim_end() != BEGIN {
        return Err(err(1, format!("patch must start with '{BEGIN}'")));
    }

    let mut section = Section::None;
    let mut saw_end = false;
    let mut file_count = 0usize;

    for (idx, raw_line) in lines {
        let line_no = idx + 1;
        let line = raw_line.trim_end_matches('\r');

        if saw_end {
            if !line.trim().is_empty() {
                return Err(err(line_no, format!("content after '{END}'")));
            }
            continue;
        }

        if line == END {
            if let Section::Update { in_hunk: false } = section {
                return Err(err(line_no, "update section has no hunks"));
            }
            saw_end = true;
            continue;
        }

        if let Some(path) = line.strip_prefix(ADD) {
            require_path(line_no, path)?;
            finish_section(line_no, section)?;
            section = Section::Add;
            file_count += 1;
            continue;
        }
        if let Some(path) = line.strip_prefix(DELETE) {
            require_path(line_no, path)?;
            finish_section(line_no, section)?;
            section = Section::Delete;
            file_count += 1;
            continue;
        }
        if let Some(path) = line.strip_prefix(UPDATE) {
            require_path(line_no, path)?;
            finish_section(line_no, section)?;
            section = Section::Update { in_hunk: false };
            file_count += 1;
            continue;
        }
        if let Some(path) = line.strip_prefix(MOVE_TO) {
            require_path(line_no, path)?;
            if !matches!(section, Section::Update { in_hunk: false }) {
                return Err(err(
                    line_no,
                    format!("'{MOVE_TO}' is only valid directly after an update header"),
                ));
            }
            continue;
        }
        if line == EOF_MARKER {
            if !matches!(section, Section::Update { .. }) {
                return Err(err(
                    line_no,
                    format!("'{EOF_MARKER}' is only valid inside an update section"),
                ));
            }
            continue;
        }

        match section {
            Section::None => {
                return Err(err(line_no, "content before any file header"));
            }
            Section::Add => {
                if !line.starts_with('+') {
                    return Err(err(line_no, "added file lines must start with '+'"));
                }
            }
            Section::Delete => {
                return Err(err(line_no, "delete sections carry no body lines"));
            }
            Section::Update { ref mut in_hunk } => {
                if line.starts_with("@@") {
                    *in_hunk = true;
                } else if *in_hunk {
                    if !matches!(line.as_bytes().first(), Some(b' ' | b'+' | b'-')) {
                        return Err(err(
                            line_no,
                            "hunk lines must start with space, '+' or '-'",
                        ));
                    }
                } else {
                    return Err(err(line_no, "update content must follow an '@@' hunk header"));
                }
            }
        }
    }

    if !saw_end {
        return Err(err(
            body.lines().count().max(1),
            format!("patch must end with '{END}'"),
        ));
    }
    if file_count == 0 {
        return Err(err(2, "patch contains no file sections"));
    }
    Ok(())
}

fn finish_section(line_no: usize, section: Section) -> Result<(), PatchError> {
    if let Section::Update { in_hunk: false } = section {
        return Err(err(line_no, "update section has no hunks"));
    }
    Ok(())
}

fn require_path(line_no: usize, path: &str) -> Result<(), PatchError> {
    if path.trim().is_empty() {
        return Err(err(line_no, "file header is missing a path"));
    }
    Ok(())
}

fn err(line: usize, message: impl Into<String>) -> PatchError {
    PatchError {
        line,
        message: message.into(),
    }
}
