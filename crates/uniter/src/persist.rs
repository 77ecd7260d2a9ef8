//! CBOR files for the agent's private state.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uniter_core::fs::write_atomic;
use uniter_core::CoreError;

use crate::error::{Result, UniterError};

/// Read a CBOR value, returning `None` if the file does not exist.
pub(crate) fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(data) => ciborium::from_reader(data.as_slice())
            .map(Some)
            .map_err(|e| UniterError::Serialization(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CoreError::io(format!("cannot read {}", path.display()), e).into()),
    }
}

/// Atomically replace `path` with the CBOR encoding of `value`, creating the
/// parent directory if needed.
pub(crate) fn write<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| CoreError::io(format!("cannot create {}", parent.display()), e))?;
    }
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| UniterError::Serialization(e.to_string()))?;
    write_atomic(path, &buf)?;
    Ok(())
}
