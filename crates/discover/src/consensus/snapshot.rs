//! Snapshot data and the file snapshot store

use std::fs;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use openraft::SnapshotMeta;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::log_store::{StoreError, decode, encode};
use super::types::TypeConfig;

const SNAPSHOT_EXTENSION: &str = "snap";

/// In-memory snapshot payload - implements AsyncRead/Write/Seek for openraft
#[derive(Debug, Clone, Default)]
pub struct SnapshotBuffer {
    /// Serialized application state
    pub data: Vec<u8>,
    position: usize,
}

impl SnapshotBuffer {
    /// Wrap existing snapshot bytes
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }
}

impl tokio::io::AsyncRead for SnapshotBuffer {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // A seek may leave the cursor past the end; that reads as EOF
        let start = self.position.min(self.data.len());
        let remaining = &self.data[start..];
        let to_read = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..to_read]);
        self.position += to_read;
        Poll::Ready(Ok(()))
    }
}

impl tokio::io::AsyncWrite for SnapshotBuffer {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // Writes land at the cursor so chunked installs may seek
        let position = self.position;
        let end = position + buf.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[position..end].copy_from_slice(buf);
        self.position = end;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl tokio::io::AsyncSeek for SnapshotBuffer {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let target = match position {
            SeekFrom::Start(pos) => i128::from(pos),
            SeekFrom::End(offset) => self.data.len() as i128 + i128::from(offset),
            SeekFrom::Current(offset) => self.position as i128 + i128::from(offset),
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of snapshot",
            ));
        }
        self.position = usize::try_from(target)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "seek out of range"))?;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.position as u64))
    }
}

impl std::marker::Unpin for SnapshotBuffer {}

/// On-disk snapshot layout
#[derive(Serialize, Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<TypeConfig>,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

/// Directory of snapshot files, newest last
///
/// Files are named `<sequence>-<snapshot id>.snap` with a zero-padded
/// sequence, so lexical order is creation order. Only the newest `retain`
/// files are kept.
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
    next_sequence: AtomicU64,
}

impl SnapshotStore {
    /// Open (or create) the snapshot directory
    pub fn open(dir: impl AsRef<Path>, retain: usize) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            retain: retain.max(1),
            next_sequence: AtomicU64::new(0),
        };

        let next = store
            .list()?
            .last()
            .and_then(|path| Self::sequence_of(path))
            .map_or(0, |sequence| sequence + 1);
        store.next_sequence.store(next, Ordering::Release);

        Ok(store)
    }

    fn sequence_of(path: &Path) -> Option<u64> {
        path.file_name()?
            .to_str()?
            .split_once('-')
            .and_then(|(sequence, _)| sequence.parse().ok())
    }

    fn file_name(sequence: u64, snapshot_id: &str) -> String {
        let id: String = snapshot_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!("{sequence:020}-{id}.{SNAPSHOT_EXTENSION}")
    }

    /// Snapshot files, oldest first
    pub fn list(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(SNAPSHOT_EXTENSION)
                && Self::sequence_of(&path).is_some()
            {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Persist a snapshot and prune older ones
    pub fn save(&self, meta: &SnapshotMeta<TypeConfig>, data: &[u8]) -> Result<PathBuf, StoreError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
        let path = self.dir.join(Self::file_name(sequence, &meta.snapshot_id));
        let tmp = path.with_extension("tmp");

        let encoded = encode(&StoredSnapshot {
            meta: meta.clone(),
            data: data.to_vec(),
        })?;
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &path)?;

        debug!("Saved snapshot {} to {}", meta.snapshot_id, path.display());

        self.prune()?;
        Ok(path)
    }

    /// Newest stored snapshot
    pub fn latest(&self) -> Result<Option<(SnapshotMeta<TypeConfig>, Vec<u8>)>, StoreError> {
        let Some(path) = self.list()?.pop() else {
            return Ok(None);
        };

        let stored: StoredSnapshot = decode(&fs::read(&path)?)?;
        Ok(Some((stored.meta, stored.data)))
    }

    fn prune(&self) -> Result<(), StoreError> {
        let files = self.list()?;
        let excess = files.len().saturating_sub(self.retain);

        for path in &files[..excess] {
            if let Err(e) = fs::remove_file(path) {
                warn!("Failed to prune snapshot {}: {}", path.display(), e);
            }
        }

        Ok(())
    }
}
