//! Filesystem helpers shared by the write buffer, the archive pipeline
//! and the directory listing.

use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use zip::write::SimpleFileOptions;

use crate::error::EngineError;

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_directory: bool,
}

// ═══════════════════════════════════════════════════════════════
//  Path validation
// ═══════════════════════════════════════════════════════════════

/// Check that `segment` is a single, plain path component
/// (no separators, no `.`/`..`, not empty).
pub fn validate_segment(segment: &str, what: &str) -> Result<(), EngineError> {
    if segment.is_empty() {
        return Err(EngineError::validation(format!("{what} is empty")));
    }
    let mut components = Path::new(segment).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == segment && !segment.contains(['/', '\\']) => {
            Ok(())
        }
        _ => Err(EngineError::validation(format!("{what} '{segment}' is not a plain name"))),
    }
}

/// Resolve a relative path below `base`, refusing anything that could
/// step outside of it. Empty input resolves to `base` itself.
pub fn resolve_under(base: &Path, relative: &str) -> Result<PathBuf, EngineError> {
    let mut out = base.to_path_buf();
    for component in Path::new(relative.trim_matches('/')).components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            _ => {
                return Err(EngineError::validation(format!(
                    "path '{relative}' escapes the storage directory"
                )));
            }
        }
    }
    Ok(out)
}

// ═══════════════════════════════════════════════════════════════
//  Hidden files
// ═══════════════════════════════════════════════════════════════

/// Platform hidden-file check: dot-prefixed name, or the hidden
/// attribute on Windows.
pub fn is_hidden(path: &Path, metadata: &Metadata) -> bool {
    let dotted = path
        .file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false);
    dotted || has_hidden_attribute(metadata)
}

#[cfg(windows)]
fn has_hidden_attribute(metadata: &Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    metadata.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0
}

#[cfg(not(windows))]
fn has_hidden_attribute(_metadata: &Metadata) -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════
//  Listing
// ═══════════════════════════════════════════════════════════════

/// List `<base>/<relative>`, hidden entries excluded, sorted by name.
/// A missing directory lists as empty.
pub fn list_directory(base: &Path, relative: &str) -> Result<Vec<DirEntryInfo>, EngineError> {
    let dir = resolve_under(base, relative)?;
    let read = match fs::read_dir(&dir) {
        Ok(r) => r,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(EngineError::from(e).with_context(dir.display())),
    };

    let mut entries = Vec::new();
    for entry in read {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let path = entry.path();
        if is_hidden(&path, &metadata) {
            continue;
        }
        entries.push(DirEntryInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_directory: metadata.is_dir(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

// ═══════════════════════════════════════════════════════════════
//  Append
// ═══════════════════════════════════════════════════════════════

/// Append `text` to `path`, creating the parent directory and the file
/// as needed.
pub fn append_text(path: &Path, text: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(text.as_bytes())?;
    f.flush()
}

// ═══════════════════════════════════════════════════════════════
//  Zip
// ═══════════════════════════════════════════════════════════════

/// True when `dir` has no entries at all (hidden ones included).
pub fn is_empty_dir(dir: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(dir)?.next().is_none())
}

/// Compress `src_dir` into `dest`, rooted at the directory's own name.
///
/// Hidden files and subtrees are skipped, empty sub-directories become
/// explicit directory entries. The archive is written next to `dest`
/// with a `.tmp` suffix and renamed into place. Returns the number of
/// entries written.
pub fn zip_directory(src_dir: &Path, dest: &Path) -> io::Result<usize> {
    let root_name = src_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no name"))?;

    let tmp = tmp_path(dest);
    let result = write_zip(src_dir, &root_name, &tmp);
    match result {
        Ok(count) => {
            fs::rename(&tmp, dest)?;
            Ok(count)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_zip(src_dir: &Path, root_name: &str, tmp: &Path) -> io::Result<usize> {
    let file = File::create(tmp)?;
    let mut zip = zip::ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut count = 0;
    add_tree(&mut zip, src_dir, root_name, options, &mut count)?;
    zip.finish().map_err(io::Error::other)?;
    Ok(count)
}

fn add_tree<W: io::Write + io::Seek>(
    zip: &mut zip::ZipWriter<W>,
    dir: &Path,
    entry_name: &str,
    options: SimpleFileOptions,
    count: &mut usize,
) -> io::Result<()> {
    zip.add_directory(format!("{entry_name}/"), options)
        .map_err(io::Error::other)?;
    *count += 1;

    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    children.sort_by_key(|c| c.file_name());

    for child in children {
        let path = child.path();
        let metadata = child.metadata()?;
        if is_hidden(&path, &metadata) {
            continue;
        }
        let name = format!("{entry_name}/{}", child.file_name().to_string_lossy());
        if metadata.is_dir() {
            add_tree(zip, &path, &name, options, count)?;
        } else {
            zip.start_file(name, options).map_err(io::Error::other)?;
            let mut src = File::open(&path)?;
            io::copy(&mut src, zip)?;
            *count += 1;
        }
    }
    Ok(())
}
