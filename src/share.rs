//! # Shares
//!
//! A share is a named directory synchronized with a set of authorized peers.
//! [`Share`] owns everything that touches the share's files on disk:
//! - Path validation (relative paths only, no `..`, no writes through symlinks)
//! - Object creation and removal
//! - Fixed-size chunk reads and writes for content transfer; incoming content
//!   lands in a partial sibling file and replaces the target only once its
//!   digest checks out
//! - Shallow (mtime) and deep (SHA-1) change detection against the metadata store
//! - The member set: authorized peers with a live session
//!
//! It is driven exclusively by its [`crate::sync::ShareEngine`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::crypto;
use crate::error::{SessionError, ShareError};
use crate::message::{Digest, Message};
use crate::session::Session;
use crate::storage::MetadataStore;

/// Size of one transfer chunk in bytes.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Suffix of the sibling file an incoming transfer is written to.
pub const PARTIAL_SUFFIX: &str = ".lumesync-part";

pub fn is_partial(relative: &str) -> bool {
    relative.ends_with(PARTIAL_SUFFIX)
}

pub fn partial_name(relative: &str) -> String {
    format!("{}{}", relative, PARTIAL_SUFFIX)
}

/// Share name, root and authorized fingerprints as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareSpec {
    pub name: String,
    pub root: PathBuf,
    pub authorized: HashSet<String>,
}

/// One entry found while walking the share tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub is_directory: bool,
}

pub struct Share {
    name: String,
    root: PathBuf,
    authorized: HashSet<String>,
    members: HashMap<String, Session>,
    store: Arc<dyn MetadataStore>,
}

impl Share {
    pub fn new(spec: ShareSpec, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            name: spec.name,
            root: spec.root,
            authorized: spec.authorized,
            members: HashMap::new(),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_authorized(&self, fingerprint: &str) -> bool {
        self.authorized.contains(fingerprint)
    }

    /// Map a share-relative path to its location on disk.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, ShareError> {
        let path = Path::new(relative);
        let mut resolved = self.root.clone();
        let mut depth = 0;

        for component in path.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                _ => return Err(ShareError::InvalidPath(relative.to_string())),
            }
        }

        if depth == 0 {
            return Err(ShareError::InvalidPath(relative.to_string()));
        }
        Ok(resolved)
    }

    /// [`Share::resolve`] for paths about to be modified: none of the
    /// components that already exist below the root may be a symlink.
    pub async fn resolve_for_write(&self, relative: &str) -> Result<PathBuf, ShareError> {
        let resolved = self.resolve(relative)?;
        let mut current = self.root.clone();

        for component in Path::new(relative).components() {
            let Component::Normal(part) = component else {
                continue;
            };
            current.push(part);
            match tokio::fs::symlink_metadata(&current).await {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(ShareError::Symlinked(relative.to_string()));
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(resolved)
    }

    /// Share-relative form of an absolute path, `/`-separated.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let stripped = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = stripped
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    /// Create an empty file. Returns `false` when a file already exists there.
    pub async fn create_file(&self, relative: &str) -> Result<bool, ShareError> {
        let path = self.resolve_for_write(relative).await?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => return Err(ShareError::NameConflict(path)),
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        debug!("[{}] created file {}", self.name, relative);
        Ok(true)
    }

    /// Create a directory and any missing parents. Returns `false` when the
    /// directory already exists.
    pub async fn create_directory(&self, relative: &str) -> Result<bool, ShareError> {
        let path = self.resolve_for_write(relative).await?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => return Ok(false),
            Ok(_) => return Err(ShareError::NameConflict(path)),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tokio::fs::create_dir_all(&path).await?;
        debug!("[{}] created directory {}", self.name, relative);
        Ok(true)
    }

    /// Write `data` at chunk `index`. The file is created if needed and never
    /// truncated here; see [`Share::truncate`].
    pub async fn write_chunk(&self, relative: &str, index: u64, data: &[u8]) -> Result<(), ShareError> {
        if data.len() > CHUNK_SIZE {
            return Err(ShareError::OversizedChunk { len: data.len() });
        }
        let offset = chunk_offset(relative, index)?;
        let path = self.resolve_for_write(relative).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read chunk `index` together with the current file size. Only the last
    /// chunk may be shorter than [`CHUNK_SIZE`]. Index 0 of an empty file is an
    /// empty chunk.
    pub async fn read_chunk(&self, relative: &str, index: u64) -> Result<(Bytes, u64), ShareError> {
        let offset = chunk_offset(relative, index)?;
        let path = self.resolve(relative)?;
        let mut file = tokio::fs::File::open(&path).await?;
        let size = file.metadata().await?.len();

        if offset >= size && !(index == 0 && size == 0) {
            return Err(ShareError::ChunkOutOfRange {
                path: relative.to_string(),
                index,
            });
        }

        let len = (size - offset).min(CHUNK_SIZE as u64) as usize;
        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok((Bytes::from(buf), size))
    }

    pub async fn truncate(&self, relative: &str, len: u64) -> Result<(), ShareError> {
        let path = self.resolve_for_write(relative).await?;
        let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
        file.set_len(len).await?;
        Ok(())
    }

    /// Remove a file or a whole directory tree and forget its metadata.
    /// Returns `false` when nothing was there.
    pub async fn remove(&self, relative: &str) -> Result<bool, ShareError> {
        let path = self.resolve_for_write(relative).await?;
        let removed = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                tokio::fs::remove_dir_all(&path).await?;
                true
            }
            Ok(_) => {
                tokio::fs::remove_file(&path).await?;
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        self.store.forget(&self.name, relative)?;
        Ok(removed)
    }

    /// Whether a regular file exists at `relative`.
    pub async fn file_exists(&self, relative: &str) -> Result<bool, ShareError> {
        let path = self.resolve(relative)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Err(ShareError::NameConflict(path)),
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Write chunk `index` of incoming content for `relative` into its
    /// partial file.
    pub async fn write_partial(&self, relative: &str, index: u64, data: &[u8]) -> Result<(), ShareError> {
        self.write_chunk(&partial_name(relative), index, data).await
    }

    /// Cut the partial file to `total_size` and, if its digest matches
    /// `expected`, move it over the target. A mismatching partial file is
    /// deleted and `None` returned.
    pub async fn commit_partial(
        &self,
        relative: &str,
        total_size: u64,
        expected: Option<Digest>,
    ) -> Result<Option<Digest>, ShareError> {
        let partial = partial_name(relative);
        self.truncate(&partial, total_size).await?;
        let digest = self.digest(&partial).await?;
        if expected.is_some_and(|expected| expected != digest) {
            self.discard_partial(relative).await?;
            return Ok(None);
        }

        let from = self.resolve_for_write(&partial).await?;
        let to = self.resolve_for_write(relative).await?;
        tokio::fs::rename(&from, &to).await?;
        Ok(Some(digest))
    }

    /// Delete the partial file of `relative`, if any.
    pub async fn discard_partial(&self, relative: &str) -> Result<(), ShareError> {
        let path = self.resolve_for_write(&partial_name(relative)).await?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete partial files left behind by transfers that never finished.
    pub async fn clear_partials(&self) -> Result<usize, ShareError> {
        let mut cleared = 0;
        for entry in self.walk(None).await? {
            if !entry.is_directory && is_partial(&entry.path) {
                tokio::fs::remove_file(self.resolve(&entry.path)?).await?;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Current modification time of an object, in UTC.
    pub async fn mod_time(&self, relative: &str) -> Result<DateTime<Utc>, ShareError> {
        let path = self.resolve(relative)?;
        let modified = tokio::fs::metadata(&path).await?.modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }

    /// Whether the modification time differs from the recorded one. A file
    /// with no recorded time counts as changed.
    pub async fn check_shallow(&self, relative: &str) -> Result<bool, ShareError> {
        let current = self.mod_time(relative).await?;
        let stored = self.store.stored_mod_time(&self.name, relative)?;
        Ok(stored != Some(current))
    }

    /// Hash the file and compare with the recorded digest. Returns whether
    /// it changed along with the fresh digest.
    pub async fn check_deep(&self, relative: &str) -> Result<(bool, Digest), ShareError> {
        let digest = self.digest(relative).await?;
        let stored = self.store.stored_hash(&self.name, relative)?;
        let changed = stored.as_deref() != Some(&digest[..]);
        Ok((changed, digest))
    }

    pub async fn digest(&self, relative: &str) -> Result<Digest, ShareError> {
        let path = self.resolve(relative)?;
        Ok(crypto::hash_file(&path).await?)
    }

    /// Record the current modification time and, for files, the digest.
    pub async fn record(&self, relative: &str, digest: Option<Digest>) -> Result<(), ShareError> {
        let mod_time = self.mod_time(relative).await?;
        self.store.set_mod_time(&self.name, relative, mod_time)?;
        if let Some(digest) = digest {
            self.store.set_hash(&self.name, relative, &digest)?;
        }
        Ok(())
    }

    /// Digest last recorded for a file, if it is well formed.
    pub fn stored_digest(&self, relative: &str) -> Result<Option<Digest>, ShareError> {
        Ok(self
            .store
            .stored_hash(&self.name, relative)?
            .and_then(|bytes| bytes.try_into().ok()))
    }

    pub fn is_known(&self, relative: &str) -> Result<bool, ShareError> {
        Ok(self.store.stored_mod_time(&self.name, relative)?.is_some())
    }

    pub fn forget(&self, relative: &str) -> Result<(), ShareError> {
        self.store.forget(&self.name, relative)?;
        Ok(())
    }

    /// Every path the store has a record for.
    pub fn known_paths(&self) -> Result<Vec<String>, ShareError> {
        Ok(self.store.known_paths(&self.name)?)
    }

    /// Walk the tree below `relative` (or the whole share when `None`),
    /// parents before children, siblings in name order. Partial files are
    /// left out.
    pub async fn scan(&self, relative: Option<&str>) -> Result<Vec<Entry>, ShareError> {
        let mut entries = self.walk(relative).await?;
        entries.retain(|entry| entry.is_directory || !is_partial(&entry.path));
        Ok(entries)
    }

    async fn walk(&self, relative: Option<&str>) -> Result<Vec<Entry>, ShareError> {
        let start = match relative {
            Some(relative) => self.resolve(relative)?,
            None => self.root.clone(),
        };

        let mut entries = Vec::new();
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let mut children = Vec::new();
            let mut read_dir = tokio::fs::read_dir(&dir).await?;
            while let Some(child) = read_dir.next_entry().await? {
                let is_directory = child.file_type().await?.is_dir();
                children.push((child.path(), is_directory));
            }
            children.sort();

            let mut subdirs = Vec::new();
            for (path, is_directory) in children {
                let Some(relative) = self.relative(&path) else {
                    continue;
                };
                entries.push(Entry {
                    path: relative,
                    is_directory,
                });
                if is_directory {
                    subdirs.push(path);
                }
            }
            pending.extend(subdirs.into_iter().rev());
        }

        Ok(entries)
    }

    /// Add an authorized peer's session. Returns whether it was newly added.
    pub fn add_member(&mut self, session: Session) -> bool {
        let fingerprint = session.identity().fingerprint.clone();
        if !self.is_authorized(&fingerprint) {
            warn!(
                "[{}] refusing {}: not authorized for this share",
                self.name,
                session.identity().short()
            );
            return false;
        }

        if let Some(existing) = self.members.get(&fingerprint) {
            if existing.is_live() {
                warn!("[{}] {} is already a member", self.name, session.identity().short());
                return false;
            }
        }

        debug!("[{}] member {} added", self.name, session.identity().short());
        self.members.insert(fingerprint, session);
        true
    }

    pub fn remove_member(&mut self, fingerprint: &str) -> bool {
        match self.members.remove(fingerprint) {
            Some(session) => {
                debug!("[{}] member {} removed", self.name, session.identity().short());
                true
            }
            None => {
                warn!("[{}] {} is not a member", self.name, fingerprint);
                false
            }
        }
    }

    pub fn is_member(&self, fingerprint: &str) -> bool {
        self.members.contains_key(fingerprint)
    }

    pub fn member(&self, fingerprint: &str) -> Option<&Session> {
        self.members.get(fingerprint)
    }

    pub fn members(&self) -> impl Iterator<Item = &Session> {
        self.members.values()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Drop members whose session has ended.
    pub fn prune_dead_members(&mut self) -> usize {
        let before = self.members.len();
        self.members.retain(|_, session| session.is_live());
        let pruned = before - self.members.len();
        if pruned > 0 {
            debug!("[{}] pruned {} dead member(s)", self.name, pruned);
        }
        pruned
    }

    /// Send `message` to every live member. Members whose send fails are
    /// dropped.
    pub async fn broadcast(&mut self, message: Message) {
        self.prune_dead_members();
        let members: Vec<(String, Session)> = self
            .members
            .iter()
            .map(|(fingerprint, session)| (fingerprint.clone(), session.clone()))
            .collect();

        for (fingerprint, session) in members {
            if let Err(e) = session.send(message.clone()).await {
                warn!("[{}] dropping member {}: {}", self.name, session.identity().short(), e);
                self.members.remove(&fingerprint);
            }
        }
    }

    /// Send `message` to one member, dropping it if the send fails.
    pub async fn send_to(&mut self, fingerprint: &str, message: Message) -> bool {
        let Some(session) = self.members.get(fingerprint).cloned() else {
            return false;
        };
        match session.send(message).await {
            Ok(()) => true,
            Err(e) => {
                warn!("[{}] dropping member {}: {}", self.name, session.identity().short(), e);
                self.members.remove(fingerprint);
                false
            }
        }
    }

    /// Queue `message` for one member without waiting. A full queue is
    /// reported as [`SessionError::QueueFull`]; any other failure drops the
    /// member.
    pub fn try_send_to(&mut self, fingerprint: &str, message: Message) -> Result<(), SessionError> {
        let Some(session) = self.members.get(fingerprint).cloned() else {
            return Err(SessionError::TransportClosed);
        };
        match session.try_send(message) {
            Err(SessionError::QueueFull) => Err(SessionError::QueueFull),
            Err(e) => {
                warn!("[{}] dropping member {}: {}", self.name, session.identity().short(), e);
                self.members.remove(fingerprint);
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Drop every member.
    pub fn clear_members(&mut self) {
        self.members.clear();
    }
}

fn chunk_offset(relative: &str, index: u64) -> Result<u64, ShareError> {
    index
        .checked_mul(CHUNK_SIZE as u64)
        .ok_or_else(|| ShareError::ChunkOutOfRange {
            path: relative.to_string(),
            index,
        })
}
