use std::fmt;
use std::path::PathBuf;

use synod_core::SynodError;

/// A parsed diff for a single file.
///
/// # Examples
///
/// ```
/// use synod_patch::diff::parse_unified_diff;
///
/// let diff = "--- a/app.py\n\
///             +++ b/app.py\n\
///             @@ -1,2 +1,1 @@\n\
///             -import os\n\
///             \x20import sys\n";
/// let files = parse_unified_diff(diff).unwrap();
/// assert_eq!(files.len(), 1);
/// assert_eq!(files[0].hunks.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct FileDiff {
    /// Path in the old version, `a/` prefix stripped.
    pub old_path: PathBuf,
    /// Path in the new version, `b/` prefix stripped.
    pub new_path: PathBuf,
    /// Hunks in file order.
    pub hunks: Vec<DiffHunk>,
    /// Whether the diff creates the file.
    pub is_new_file: bool,
    /// Whether the diff deletes the file.
    pub is_deleted_file: bool,
}

impl fmt::Display for FileDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} hunks)", self.new_path.display(), self.hunks.len())
    }
}

/// One hunk: a target line range plus its prefixed body lines.
#[derive(Debug, Clone)]
pub struct DiffHunk {
    /// First line of the hunk in the old file (1-based).
    pub old_start: u32,
    /// Number of old-file lines the hunk covers.
    pub old_lines: u32,
    /// First line of the hunk in the new file (1-based).
    pub new_start: u32,
    /// Number of new-file lines the hunk produces.
    pub new_lines: u32,
    /// Body lines with their ` `/`-`/`+` prefix intact.
    pub lines: Vec<String>,
}

/// Parse a unified diff string into per-file entries.
///
/// Accepts both full `git diff` output and bare `---`/`+++` patches, which
/// is what code generation models usually produce. Binary file sections are
/// skipped.
///
/// # Errors
///
/// Returns [`SynodError::Malformed`] for an unreadable hunk header or a
/// body line with an unknown prefix.
///
/// # Examples
///
/// ```
/// use synod_patch::diff::parse_unified_diff;
///
/// assert!(parse_unified_diff("").unwrap().is_empty());
/// ```
pub fn parse_unified_diff(input: &str) -> Result<Vec<FileDiff>, SynodError> {
    let mut files: Vec<FileDiff> = Vec::new();
    let mut current: Option<FileDiff> = None;
    let mut current_hunk: Option<DiffHunk> = None;
    let mut is_binary = false;

    for line in input.lines() {
        if line.starts_with("diff --git ") {
            flush_hunk(&mut current, &mut current_hunk);
            if let Some(file) = current.take() {
                if !is_binary {
                    files.push(file);
                }
            }
            is_binary = false;
            current = Some(empty_file_diff());
            continue;
        }

        // Model-produced patches usually start straight at the `---` header.
        if line.starts_with("--- ") && current.is_none() {
            current = Some(empty_file_diff());
        }

        let Some(file) = current.as_mut() else {
            continue;
        };

        if line.starts_with("Binary files ") && line.ends_with(" differ") {
            is_binary = true;
            continue;
        }
        if line.starts_with("new file mode") {
            file.is_new_file = true;
            continue;
        }
        if line.starts_with("deleted file mode") {
            file.is_deleted_file = true;
            continue;
        }
        if line.starts_with("index ") || line.starts_with("similarity index") {
            continue;
        }

        if let Some(path) = line.strip_prefix("--- ") {
            file.old_path = parse_path(path);
            if path == "/dev/null" {
                file.is_new_file = true;
            }
            continue;
        }
        if let Some(path) = line.strip_prefix("+++ ") {
            file.new_path = parse_path(path);
            if path == "/dev/null" {
                file.is_deleted_file = true;
            }
            continue;
        }

        if line.starts_with("@@ ") {
            flush_hunk(&mut current, &mut current_hunk);
            let (old_start, old_lines, new_start, new_lines) = parse_hunk_header(line)?;
            current_hunk = Some(DiffHunk {
                old_start,
                old_lines,
                new_start,
                new_lines,
                lines: Vec::new(),
            });
            continue;
        }

        if line == "\\ No newline at end of file" {
            continue;
        }

        if let Some(hunk) = current_hunk.as_mut() {
            if line.starts_with('+') || line.starts_with('-') || line.starts_with(' ') {
                hunk.lines.push(line.to_string());
            } else if line.is_empty() {
                // Some tools strip the single space off blank context lines.
                hunk.lines.push(" ".to_string());
            } else {
                return Err(SynodError::Malformed(format!(
                    "unexpected diff body line: {line}"
                )));
            }
        }
    }

    flush_hunk(&mut current, &mut current_hunk);
    if let Some(file) = current.take() {
        if !is_binary {
            files.push(file);
        }
    }

    Ok(files)
}

/// Apply one file's hunks to `content` and return the patched text.
///
/// Every context and removed line is verified against the original before
/// anything is emitted; a mismatch rejects the whole diff rather than
/// producing a silently corrupted file. Trailing-newline presence is
/// preserved.
///
/// # Errors
///
/// Returns [`SynodError::Malformed`] when a hunk is out of range, hunks
/// overlap, or a context line does not match the file.
pub fn apply_file_diff(content: &str, diff: &FileDiff) -> Result<String, SynodError> {
    let original: Vec<&str> = content.lines().collect();
    let mut patched: Vec<String> = Vec::new();
    let mut cursor = 0usize;

    for hunk in &diff.hunks {
        // An insertion hunk (`old_lines == 0`) targets the position after
        // `old_start`; everything else targets `old_start` itself.
        let hunk_start = if hunk.old_lines == 0 {
            hunk.old_start as usize
        } else {
            (hunk.old_start as usize).saturating_sub(1)
        };

        if hunk_start < cursor {
            return Err(SynodError::Malformed(format!(
                "overlapping hunk at line {}",
                hunk.old_start
            )));
        }
        if hunk_start > original.len() {
            return Err(SynodError::Malformed(format!(
                "hunk at line {} beyond end of file ({} lines)",
                hunk.old_start,
                original.len()
            )));
        }

        patched.extend(original[cursor..hunk_start].iter().map(|s| s.to_string()));

        let mut pos = hunk_start;
        for line in &hunk.lines {
            let (marker, text) = line.split_at(1);
            match marker {
                " " | "-" => {
                    let actual = original.get(pos).ok_or_else(|| {
                        SynodError::Malformed(format!(
                            "hunk at line {} runs past end of file",
                            hunk.old_start
                        ))
                    })?;
                    if *actual != text {
                        return Err(SynodError::Malformed(format!(
                            "context mismatch at line {}: expected {text:?}, found {actual:?}",
                            pos + 1
                        )));
                    }
                    if marker == " " {
                        patched.push(text.to_string());
                    }
                    pos += 1;
                }
                "+" => patched.push(text.to_string()),
                _ => {
                    return Err(SynodError::Malformed(format!(
                        "unknown diff line prefix: {line}"
                    )))
                }
            }
        }
        cursor = pos;
    }

    patched.extend(original[cursor..].iter().map(|s| s.to_string()));

    let mut result = patched.join("\n");
    if content.ends_with('\n') || content.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

fn empty_file_diff() -> FileDiff {
    FileDiff {
        old_path: PathBuf::new(),
        new_path: PathBuf::new(),
        hunks: Vec::new(),
        is_new_file: false,
        is_deleted_file: false,
    }
}

fn flush_hunk(current: &mut Option<FileDiff>, hunk: &mut Option<DiffHunk>) {
    if let Some(h) = hunk.take() {
        if let Some(file) = current.as_mut() {
            file.hunks.push(h);
        }
    }
}

fn parse_path(raw: &str) -> PathBuf {
    let normalized = raw.trim_matches('"');
    if normalized == "/dev/null" {
        return PathBuf::from("/dev/null");
    }
    let stripped = normalized
        .strip_prefix("a/")
        .or_else(|| normalized.strip_prefix("b/"))
        .unwrap_or(normalized);
    PathBuf::from(stripped)
}

fn parse_hunk_header(line: &str) -> Result<(u32, u32, u32, u32), SynodError> {
    let inner = line
        .strip_prefix("@@ ")
        .and_then(|s| {
            let end = s.find(" @@")?;
            Some(&s[..end])
        })
        .ok_or_else(|| SynodError::Malformed(format!("invalid hunk header: {line}")))?;

    let parts: Vec<&str> = inner.split(' ').collect();
    if parts.len() != 2 {
        return Err(SynodError::Malformed(format!("invalid hunk header: {line}")));
    }

    let old = parts[0]
        .strip_prefix('-')
        .ok_or_else(|| SynodError::Malformed(format!("invalid old range in hunk: {line}")))?;
    let new = parts[1]
        .strip_prefix('+')
        .ok_or_else(|| SynodError::Malformed(format!("invalid new range in hunk: {line}")))?;

    let (old_start, old_lines) = parse_range(old, line)?;
    let (new_start, new_lines) = parse_range(new, line)?;
    Ok((old_start, old_lines, new_start, new_lines))
}

fn parse_range(range: &str, context: &str) -> Result<(u32, u32), SynodError> {
    if let Some((start, count)) = range.split_once(',') {
        let s = start
            .parse()
            .map_err(|_| SynodError::Malformed(format!("invalid range number in: {context}")))?;
        let c = count
            .parse()
            .map_err(|_| SynodError::Malformed(format!("invalid range count in: {context}")))?;
        Ok((s, c))
    } else {
        let s = range
            .parse()
            .map_err(|_| SynodError::Malformed(format!("invalid range number in: {context}")))?;
        Ok((s, 1))
    }
}
