// Index persistence
// A binary vector blob plus a JSON metadata file. Both are staged in full before
// either is renamed into place, and the replaced blob is kept as `<stem>.vectors.prev`
// until the metadata rename commits the save. A save torn between the two renames
// reloads as the previous pair instead of losing the index.


use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::VectorRecord;
use super::store::FlatStore;
use crate::{RagError, Result};

const MAGIC: &[u8; 4] = b"CVIX";
pub const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 20;

/// Locations of the two companion files for one index instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFiles {
    pub vectors: PathBuf,
    pub metadata: PathBuf,
    /// Blob replaced by an in-flight save
    pub previous_vectors: PathBuf,
}

impl IndexFiles {
    #[inline]
    pub fn new(dir: &Path, stem: &str) -> Self {
        Self {
            vectors: dir.join(format!("{stem}.vectors")),
            metadata: dir.join(format!("{stem}.meta.json")),
            previous_vectors: dir.join(format!("{stem}.vectors.prev")),
        }
    }

    #[inline]
    pub fn both_exist(&self) -> bool {
        self.vectors.exists() && self.metadata.exists()
    }

    #[inline]
    pub fn none_exist(&self) -> bool {
        !self.vectors.exists() && !self.metadata.exists() && !self.previous_vectors.exists()
    }
}

/// Persisted metadata, borrowed from live index state for writing
#[derive(Debug, Serialize)]
pub struct MetadataRef<'a> {
    pub format_version: u32,
    pub vector_count: usize,
    pub dimension: Option<usize>,
    pub rebuild_count: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub records: &'a [VectorRecord],
    pub conversations: &'a BTreeMap<String, BTreeSet<usize>>,
}

/// Persisted metadata as read back from disk
#[derive(Debug, Deserialize)]
pub struct Metadata {
    pub format_version: u32,
    pub vector_count: usize,
    pub dimension: Option<usize>,
    #[serde(default)]
    pub rebuild_count: u64,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    pub records: Vec<VectorRecord>,
    pub conversations: BTreeMap<String, BTreeSet<usize>>,
}

/// Write both files
///
/// The metadata rename is the commit point: until it lands, the old metadata still
/// matches `previous_vectors`.
#[inline]
pub fn save(files: &IndexFiles, store: &FlatStore, metadata: &MetadataRef<'_>) -> Result<()> {
    let staged_vectors = stage(&files.vectors, &encode_vectors(store))?;
    let staged_metadata = stage(&files.metadata, &serde_json::to_vec(metadata)?)?;

    if files.vectors.exists() {
        fs::rename(&files.vectors, &files.previous_vectors)?;
    }
    staged_vectors.persist(&files.vectors).map_err(|e| e.error)?;
    staged_metadata.persist(&files.metadata).map_err(|e| e.error)?;

    if let Err(e) = fs::remove_file(&files.previous_vectors) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", files.previous_vectors.display(), e);
        }
    }

    debug!(
        "Persisted {} vectors and {} records to {}",
        store.len(),
        metadata.records.len(),
        files.metadata.display()
    );
    Ok(())
}

/// Load and cross-check both files
///
/// Returns `Ok(None)` when no file exists and [`RagError::IndexCorruption`] when the
/// metadata is missing or unreadable, or matches neither the current nor the
/// previous vector blob.
#[inline]
pub fn load(files: &IndexFiles) -> Result<Option<(FlatStore, Metadata)>> {
    if files.none_exist() {
        return Ok(None);
    }
    if !files.metadata.exists() {
        return Err(RagError::IndexCorruption(
            "vector blob exists without its metadata file".to_string(),
        ));
    }

    let json = fs::read(&files.metadata)?;
    let metadata: Metadata = serde_json::from_slice(&json)
        .map_err(|e| RagError::IndexCorruption(format!("unreadable metadata: {e}")))?;

    let mut last_error = RagError::IndexCorruption(
        "metadata file exists without a vector blob".to_string(),
    );
    for blob in [&files.vectors, &files.previous_vectors] {
        if !blob.exists() {
            continue;
        }
        match fs::read(blob)
            .map_err(RagError::from)
            .and_then(|bytes| decode_vectors(&bytes))
            .and_then(|store| validate(&store, &metadata).map(|()| store))
        {
            Ok(store) => {
                if blob == &files.previous_vectors {
                    warn!(
                        "Recovered index from {} after an interrupted save",
                        blob.display()
                    );
                }
                return Ok(Some((store, metadata)));
            }
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

fn validate(store: &FlatStore, metadata: &Metadata) -> Result<()> {
    let corrupt = |message: String| Err(RagError::IndexCorruption(message));

    if metadata.format_version != FORMAT_VERSION {
        return corrupt(format!(
            "unsupported metadata version {}",
            metadata.format_version
        ));
    }
    if metadata.vector_count != store.len() || metadata.records.len() != store.len() {
        return corrupt(format!(
            "metadata lists {} vectors and {} records, blob holds {}",
            metadata.vector_count,
            metadata.records.len(),
            store.len()
        ));
    }
    if !store.is_empty() && metadata.dimension != store.dimension() {
        return corrupt("metadata dimension disagrees with vector blob".to_string());
    }

    for (slot, record) in metadata.records.iter().enumerate() {
        let registered = metadata
            .conversations
            .get(&record.conversation_id)
            .is_some_and(|slots| slots.contains(&slot));
        if record.slot_index != slot || !registered {
            return corrupt(format!("record {} is not registered at slot {slot}", record.chunk_id));
        }
    }

    let registered_slots: usize = metadata.conversations.values().map(BTreeSet::len).sum();
    if registered_slots != store.len() {
        return corrupt(format!(
            "conversation index lists {registered_slots} slots for {} vectors",
            store.len()
        ));
    }
    Ok(())
}

fn encode_vectors(store: &FlatStore) -> Vec<u8> {
    let dimension = store.dimension().unwrap_or(0);
    let mut bytes = Vec::with_capacity(HEADER_LEN + store.raw().len() * 4);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&u32::try_from(dimension).unwrap_or(u32::MAX).to_le_bytes());
    bytes.extend_from_slice(&(store.len() as u64).to_le_bytes());
    for value in store.raw() {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vectors(bytes: &[u8]) -> Result<FlatStore> {
    let corrupt = |message: &str| RagError::IndexCorruption(format!("vector blob: {message}"));

    let header = bytes.get(..HEADER_LEN).ok_or_else(|| corrupt("truncated header"))?;
    let (magic, rest) = header.split_at(4);
    if magic != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let (version, rest) = rest.split_at(4);
    let (dimension, count) = rest.split_at(4);

    let version = u32::from_le_bytes(version.try_into().map_err(|_| corrupt("header"))?);
    if version != FORMAT_VERSION {
        return Err(corrupt("unsupported version"));
    }
    let dimension = u32::from_le_bytes(dimension.try_into().map_err(|_| corrupt("header"))?) as usize;
    let count = u64::from_le_bytes(count.try_into().map_err(|_| corrupt("header"))?);
    let count = usize::try_from(count).map_err(|_| corrupt("vector count overflows"))?;

    let body = bytes.get(HEADER_LEN..).unwrap_or_default();
    let expected_len = dimension
        .checked_mul(count)
        .and_then(|components| components.checked_mul(4))
        .ok_or_else(|| corrupt("size overflows"))?;
    if body.len() != expected_len {
        return Err(corrupt("length disagrees with header"));
    }

    if count == 0 {
        return Ok(FlatStore::new());
    }

    let data = body
        .chunks_exact(4)
        .map(|raw| {
            raw.try_into()
                .map(f32::from_le_bytes)
                .map_err(|_| corrupt("component"))
        })
        .collect::<Result<Vec<f32>>>()?;
    FlatStore::from_raw(dimension, data)
}

/// Write `bytes` to a synced temp file next to `path`, ready to be renamed over it
fn stage(path: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    Ok(file)
}
