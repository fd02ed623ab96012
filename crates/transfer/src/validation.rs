use std::path::{Component, Path};

use crate::TransferError;

/// Checks that a peer-supplied file name stays inside the output directory.
///
/// Subdirectories are allowed. Rejects:
/// - Empty names and names without a file component (`.`, `./`)
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
/// - Embedded NUL bytes
pub fn validate_file_name(file_name: &str) -> Result<(), TransferError> {
    if file_name.is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }
    if file_name.contains('\0') {
        return Err(TransferError::InvalidPath(format!(
            "NUL byte in file name: {file_name:?}"
        )));
    }

    let path = Path::new(file_name);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {file_name}"
        )));
    }

    let mut has_name = false;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {file_name}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {file_name}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {file_name}"
                )));
            }
            Component::Normal(_) => has_name = true,
            Component::CurDir => {}
        }
    }

    if !has_name {
        return Err(TransferError::InvalidPath(format!(
            "no file name in {file_name:?}"
        )));
    }
    Ok(())
}
