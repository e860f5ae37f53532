use crate::error::{ErrorCode, Result, ScataError};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::BTreeMap,
    fs,
    io::{BufWriter, Read as _, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Write-once storage for generated artifacts.
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `name`. Fails with `already_exists` if the name
    /// is taken.
    fn put(&self, name: &str, bytes: &[u8]) -> Result<()>;
    fn get(&self, name: &str) -> Result<Vec<u8>>;
    fn exists(&self, name: &str) -> bool;
    /// Names starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(ScataError::new(
            ErrorCode::InvalidInput,
            format!("Invalid blob name '{name}'"),
        ));
    }
    Ok(())
}

fn already_exists(name: &str) -> ScataError {
    ScataError::new(ErrorCode::AlreadyExists, format!("Blob '{name}' already exists"))
}

fn not_found(name: &str) -> ScataError {
    ScataError::new(ErrorCode::NotFound, format!("Blob '{name}' not found"))
}

/// Blobs as files in one directory.
#[derive(Debug, Clone)]
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| {
            ScataError::io(
                &format!("Could not create blob directory '{}'", root.display()),
                e,
            )
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl BlobStore for DirBlobStore {
    fn put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        validate_name(name)?;
        let destination = self.path_of(name);
        if destination.exists() {
            return Err(already_exists(name));
        }
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{name}."))
            .suffix(".part")
            .tempfile_in(&self.root)
            .map_err(|e| ScataError::io(&format!("Could not create a temporary file for '{name}'"), e))?;
        let write = |tmp: &mut tempfile::NamedTempFile| -> std::io::Result<()> {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            writer.write_all(bytes)?;
            writer.flush()
        };
        write(&mut tmp).map_err(|e| ScataError::io(&format!("Could not write blob '{name}'"), e))?;
        // Links without replacing; the loser of a race sees AlreadyExists.
        match tmp.persist_noclobber(&destination) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Err(already_exists(name)),
            Err(e) => Err(ScataError::io(
                &format!("Could not finalize blob '{}'", destination.display()),
                e.error,
            )),
        }
    }

    fn get(&self, name: &str) -> Result<Vec<u8>> {
        validate_name(name)?;
        let path = self.path_of(name);
        if !path.exists() {
            return Err(not_found(name));
        }
        fs::read(&path)
            .map_err(|e| ScataError::io(&format!("Could not read blob '{}'", path.display()), e))
    }

    fn exists(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.path_of(name).is_file()
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            ScataError::io(
                &format!("Could not list blob directory '{}'", self.root.display()),
                e,
            )
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(prefix) && !name.ends_with(".part") && entry.path().is_file() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// In-memory blobs, used by tests and embedding callers.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.blobs
            .lock()
            .map_err(|_| ScataError::new(ErrorCode::Internal, "Blob store lock poisoned"))
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        validate_name(name)?;
        let mut blobs = self.lock()?;
        if blobs.contains_key(name) {
            return Err(already_exists(name));
        }
        blobs.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.lock()?.get(name).cloned().ok_or_else(|| not_found(name))
    }

    fn exists(&self, name: &str) -> bool {
        self.lock().map(|b| b.contains_key(name)).unwrap_or(false)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Stores `value` as gzip-compressed JSON.
pub fn write_blob<T: Serialize + ?Sized>(store: &dyn BlobStore, name: &str, value: &T) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    serde_json::to_writer(&mut encoder, value)?;
    let bytes = encoder
        .finish()
        .map_err(|e| ScataError::io(&format!("Could not compress blob '{name}'"), e))?;
    store.put(name, &bytes)
}

pub fn read_blob<T: DeserializeOwned>(store: &dyn BlobStore, name: &str) -> Result<T> {
    let bytes = store.get(name)?;
    let mut text = Vec::new();
    GzDecoder::new(bytes.as_slice())
        .read_to_end(&mut text)
        .map_err(|e| ScataError::io(&format!("Could not decompress blob '{name}'"), e))?;
    serde_json::from_slice(&text).map_err(|e| {
        ScataError::new(
            ErrorCode::InvalidInput,
            format!("Could not parse blob '{name}': {e}"),
        )
    })
}
