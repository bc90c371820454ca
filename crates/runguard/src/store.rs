//! Filesystem-backed collaborator for the queue and the offload policy.
//!
//! Directory layout:
//!
//! ```text
//! {root}/
//!   mutations/
//!     {session_id}/
//!       {key}.json        # latest drained QueueEntry for that key
//!   offload/
//!     {reference_id}.txt  # full payload of an offloaded tool result
//! ```
//!
//! Session ids, keys and reference ids are percent-encoded into file names,
//! so `a/b` and `a_b` land in different files.
//!
//! Every write goes to its own temp file first and is renamed into place,
//! so readers never observe a half-written file. Draining the same entry
//! twice, even concurrently, rewrites identical bytes, which keeps the drain
//! idempotent.

use crate::error::GovernResult;
use crate::policy::offload::{ResultStore, StoreFuture};
use crate::queue::{Drain, DrainFuture, QueueEntry};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// [`Drain`] and [`ResultStore`] rooted at a local directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

/// Percent-encode an arbitrary id into a single path component.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes
/// `%XX`. The mapping is injective, so distinct ids never share a file. The
/// empty id maps to a bare `%`, which no other id produces.
fn file_stem(raw: &str) -> String {
    if raw.is_empty() {
        return "%".to_string();
    }
    let mut stem = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

/// Atomic write: uniquely named temp file in the same directory, then
/// rename into place. Concurrent writers of one path never share a temp
/// file; the last rename wins.
async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let path = path.to_path_buf();
    let contents = contents.to_vec();
    tokio::task::spawn_blocking(move || {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".runguard-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.write_all(&contents)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file a drained mutation is written to.
    pub fn mutation_path(&self, session_id: &str, key: &str) -> PathBuf {
        self.root
            .join("mutations")
            .join(file_stem(session_id))
            .join(format!("{}.json", file_stem(key)))
    }

    /// Path of an offloaded payload.
    pub fn offload_path(&self, id: &str) -> PathBuf {
        self.root.join("offload").join(format!("{}.txt", file_stem(id)))
    }

    /// Read back the last drained mutation for `(session_id, key)`.
    /// Returns `None` if nothing was drained for it.
    pub async fn load_mutation(
        &self,
        session_id: &str,
        key: &str,
    ) -> GovernResult<Option<QueueEntry>> {
        let path = self.mutation_path(session_id, key);
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read back an offloaded payload by its reference id.
    pub async fn load_offloaded(&self, id: &str) -> GovernResult<Option<String>> {
        match tokio::fs::read_to_string(self.offload_path(id)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drain for DirectoryStore {
    fn drain<'a>(&'a self, entry: &'a QueueEntry) -> DrainFuture<'a> {
        Box::pin(async move {
            let path = self.mutation_path(&entry.session_id, &entry.key);
            let json = serde_json::to_string_pretty(entry)
                .map_err(|e| format!("Failed to serialize mutation: {e}"))?;
            write_atomic(&path, json.as_bytes())
                .await
                .map_err(|e| format!("Failed to write {}: {e}", path.display()))?;
            debug!(id = entry.id, path = %path.display(), "Mutation drained");
            Ok(())
        })
    }
}

impl ResultStore for DirectoryStore {
    fn store<'a>(&'a self, id: &'a str, content: &'a str) -> StoreFuture<'a> {
        Box::pin(async move {
            let path = self.offload_path(id);
            write_atomic(&path, content.as_bytes())
                .await
                .map_err(|e| format!("Failed to write {}: {e}", path.display()))?;
            debug!(id, path = %path.display(), "Offloaded result stored");
            Ok(())
        })
    }
}
