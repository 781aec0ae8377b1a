//! Persistent result cache keyed by input fingerprints.
//!
//! A task opts into caching by declaring a cache key, which names the version
//! of its action. Before such a task runs, its resolved input values are
//! folded into a BLAKE3 fingerprint together with the task path and the cache
//! key. A stored entry with a matching fingerprint short-circuits execution:
//! the recorded output values are decoded and installed into the task's
//! property cells, and the task completes as up to date. After a cacheable
//! task succeeds, its outputs are snapshotted under the new fingerprint.
//!
//! The cache file is CBOR. A missing or unreadable file is treated as an
//! empty cache, never as a build failure; an entry that fails to decode is
//! treated as a miss for its task.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::CacheError;
use crate::model::{Model, TaskId};
use crate::property::PropertyKind;

/// One recorded run of a cacheable task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct CacheEntry {
    /// Fingerprint of the inputs that produced these outputs.
    pub(crate) fingerprint: Hash32,
    /// Encoded output values, by property name.
    pub(crate) outputs: Vec<(String, Vec<u8>)>,
}

/// The on-disk cache: the latest recorded entry per task path.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct ResultCache {
    entries: HashMap<String, CacheEntry>,
}

impl ResultCache {
    /// Loads the cache from disk. Anything that prevents reading a usable
    /// cache — a missing file, an I/O error, a file that no longer decodes —
    /// yields an empty cache. The cache layer changes performance only, so it
    /// must never turn a working build into a failing one.
    pub(crate) fn load(path: &Utf8Path) -> Self {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    tracing::warn!(
                        "ignoring unreadable cache file '{path}': {err}"
                    );
                }
                return Self::default();
            }
        };

        match ciborium::de::from_reader(bytes.as_slice()) {
            Ok(cache) => cache,
            Err(err) => {
                tracing::warn!("discarding unreadable cache file: {err}");
                Self::default()
            }
        }
    }

    pub(crate) fn save(&self, path: &Utf8Path) -> Result<(), CacheError> {
        let write_err = |source| CacheError::Write {
            path: path.to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let mut buffer = Vec::new();
        ciborium::ser::into_writer(self, &mut buffer)
            .map_err(|err| CacheError::Encode(err.to_string()))?;
        fs::write(path, buffer).map_err(write_err)
    }

    /// Returns the recorded entry for `task_path` if its fingerprint matches.
    pub(crate) fn lookup(
        &self,
        task_path: &str,
        fingerprint: &Hash32,
    ) -> Option<&CacheEntry> {
        self.entries
            .get(task_path)
            .filter(|entry| entry.fingerprint == *fingerprint)
    }

    pub(crate) fn insert(
        &mut self,
        task_path: &str,
        fingerprint: Hash32,
        outputs: Vec<(String, Vec<u8>)>,
    ) {
        self.entries.insert(
            task_path.to_string(),
            CacheEntry {
                fingerprint,
                outputs,
            },
        );
    }
}

/// Computes the input fingerprint of a task, or `None` if the task is not
/// cacheable.
///
/// The fingerprint folds the task path, the cache key, and every input
/// property's name and resolved value hash, in declaration order. An input
/// that cannot resolve contributes a fixed marker instead of a value hash, so
/// two runs with the same unresolvable input still fingerprint identically.
pub(crate) fn fingerprint(model: &Model, task: TaskId) -> Option<Hash32> {
    let data = model.task(task);
    let key = data.cache_key.as_ref()?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(data.path.as_bytes());
    hasher.update(&[0]);
    hasher.update(key.as_bytes());

    for &prop in &data.properties {
        let cell = model.cell(prop);
        if cell.kind != PropertyKind::Input {
            continue;
        }
        hasher.update(&[0]);
        hasher.update(cell.name.as_bytes());
        hasher.update(&[0]);
        match model.resolve(prop) {
            Ok(value) => hasher.update(value.hash.as_bytes()),
            Err(_) => hasher.update(b"unset"),
        };
    }

    Some(hasher.finalize().into())
}

/// Encodes the resolved output values of a task for storage. Outputs the
/// action never produced are omitted.
pub(crate) fn snapshot(
    model: &Model,
    task: TaskId,
) -> Result<Vec<(String, Vec<u8>)>, CacheError> {
    let mut outputs = Vec::new();
    for &prop in &model.task(task).properties {
        let cell = model.cell(prop);
        if cell.kind != PropertyKind::Output {
            continue;
        }
        let Ok(value) = model.resolve(prop) else {
            continue;
        };
        let bytes = (cell.vtable.encode)(&value)?;
        outputs.push((cell.name.to_string(), bytes));
    }
    Ok(outputs)
}

/// Decodes a recorded entry and installs its values into the task's output
/// cells, finalizing them as if the action had run.
pub(crate) fn restore(
    model: &Model,
    task: TaskId,
    entry: &CacheEntry,
) -> Result<(), CacheError> {
    let data = model.task(task);
    let mut restored = Vec::with_capacity(entry.outputs.len());

    for (name, bytes) in &entry.outputs {
        let Some(&prop) = data.property_names.get(name.as_str()) else {
            return Err(CacheError::Decode(format!(
                "cache entry for '{}' names unknown property '{name}'",
                data.path,
            )));
        };
        let cell = model.cell(prop);
        let value = (cell.vtable.decode)(bytes)?;
        restored.push((prop, value));
    }

    // Install only after every value decoded, so a bad entry leaves no
    // partially restored task behind.
    for (prop, value) in restored {
        model.install(prop, value);
    }
    Ok(())
}
