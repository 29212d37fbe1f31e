//! JSON persistence with NaN sanitization.
//!
//! Documents are sanitized, serialized in memory and only then written to
//! disk through a temporary file in the target directory that is renamed
//! over the target. A failed save never leaves a truncated file behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use tempfile::{Builder, NamedTempFile};
use tracing::debug;

use crate::error::{Error, Result};
use crate::value::{Map, Value};

/// Indentation used for every persisted document
const INDENT: &[u8] = b"   ";

/// Replace every NaN float with `Null`, at any depth.
///
/// The input is left untouched; a new document is returned.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Float(f) if f.is_nan() => Value::Null,
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize(v)))
                .collect::<Map>(),
        ),
        other => other.clone(),
    }
}

/// Fail on the first value JSON cannot represent
fn check_representable(value: &Value, path: &mut String) -> Result<()> {
    match value {
        Value::Float(f) if !f.is_finite() => Err(Error::Serialization {
            path: path.clone(),
            reason: format!("non-finite float {}", f),
        }),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let len = path.len();
                path.push_str(&format!("[{}]", i));
                check_representable(item, path)?;
                path.truncate(len);
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, item) in map {
                let len = path.len();
                path.push('.');
                path.push_str(key);
                check_representable(item, path)?;
                path.truncate(len);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Serialize with sorted keys and a 3-space indent
pub fn to_json_string(value: &Value) -> Result<String> {
    check_representable(value, &mut String::from("$"))?;

    let mut buf = Vec::new();
    let formatter = PrettyFormatter::with_indent(INDENT);
    let mut serializer = Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|e| Error::Serialization {
            path: "$".to_string(),
            reason: e.to_string(),
        })?;

    String::from_utf8(buf).map_err(|e| Error::Serialization {
        path: "$".to_string(),
        reason: e.to_string(),
    })
}

/// Temporary sibling of `target` carrying the mode the target should end up
/// with: the current mode of an existing target, otherwise the umask default
fn sibling_temp_file(parent: &Path, target: &Path) -> std::io::Result<NamedTempFile> {
    let existing = fs::metadata(target).ok().map(|m| m.permissions());

    let mut builder = Builder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if existing.is_none() {
            builder.permissions(fs::Permissions::from_mode(0o666));
        }
    }

    let tmp = builder.tempfile_in(parent)?;
    if let Some(permissions) = existing {
        tmp.as_file().set_permissions(permissions)?;
    }
    Ok(tmp)
}

/// Replace `path` with `contents` atomically.
///
/// The parent directory must already exist. An existing file keeps its
/// permissions.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !parent.is_dir() {
        return Err(Error::io_write(
            path,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("parent directory {} does not exist", parent.display()),
            ),
        ));
    }

    let mut tmp = sibling_temp_file(&parent, path).map_err(|e| Error::io_write(path, e))?;
    tmp.write_all(contents).map_err(|e| Error::io_write(path, e))?;
    tmp.as_file().sync_all().map_err(|e| Error::io_write(path, e))?;
    tmp.persist(path).map_err(|e| Error::io_write(path, e.error))?;
    Ok(())
}

/// Sanitize `data` and write it to `file_path` as JSON
pub fn save_data(data: &Value, file_path: &Path) -> Result<()> {
    let sanitized = sanitize(data);
    let text = to_json_string(&sanitized)?;
    write_atomic(file_path, text.as_bytes())?;
    debug!(path = %file_path.display(), bytes = text.len(), "saved json document");
    Ok(())
}

/// Read a JSON document from disk
pub fn load_data(file_path: &Path) -> Result<Value> {
    let content = fs::read_to_string(file_path).map_err(|e| Error::io_read(file_path, e))?;
    Ok(serde_json::from_str(&content)?)
}

/// Newest file with the given extension, by lexicographic file name.
///
/// Files are saved with sortable timestamp names, so the last one is the
/// most recent. Returns `None` when the directory is missing or empty.
pub fn latest_file(dir: &Path, extension: &str) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::io_read(dir, e))? {
        let path = entry.map_err(|e| Error::io_read(dir, e))?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files.pop())
}
