//! Tree entries: file nodes with their staging lifecycle, and directories
//! that materialize children lazily from a cached entry listing.

use crate::drive::DriveCapability;
use crate::error::FsError;
use crate::staging::{RemoteObjectRef, StagingCache};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const ROOT_INO: u64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

/// Seed record for a not-yet-materialized directory entry. Files carry the
/// remote object they are backed by; directories carry their own listing.
#[derive(Clone)]
pub enum EntrySpec {
    File(RemoteObjectRef),
    Dir(DirManifest),
}

/// Raw entry-kind listing of one directory, keyed by child name.
pub type DirManifest = BTreeMap<String, EntrySpec>;

#[derive(Clone)]
pub enum NodeRef {
    File(Arc<FileNode>),
    Dir(Arc<DirectoryNode>),
}

impl NodeRef {
    pub fn ino(&self) -> u64 {
        match self {
            NodeRef::File(f) => f.ino(),
            NodeRef::Dir(d) => d.ino(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            NodeRef::File(_) => NodeKind::File,
            NodeRef::Dir(_) => NodeKind::Dir,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            NodeRef::File(f) => f.size(),
            NodeRef::Dir(_) => 0,
        }
    }
}

/// Shared inode numbering and the ino -> node index the transport addresses
/// nodes by. Owned by the filesystem root, threaded into directory lookups so
/// materialization and registration happen under the directory lock.
pub struct NodeTable {
    next_ino: AtomicU64,
    nodes: Mutex<HashMap<u64, NodeRef>>,
}

impl NodeTable {
    pub fn new() -> Self {
        Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register(&self, node: NodeRef) {
        self.nodes.lock().unwrap().insert(node.ino(), node);
    }

    pub fn get(&self, ino: u64) -> Option<NodeRef> {
        self.nodes.lock().unwrap().get(&ino).cloned()
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

// ===== files =====

struct FileState {
    drive: Arc<dyn DriveCapability>,
    remote: Option<RemoteObjectRef>,
    /// Some exactly while the node is Open; at most one cache ever exists.
    cache: Option<StagingCache>,
}

/// One file in the tree. A single lock serializes open/read/write/flush/
/// release, which makes the synchronous network calls underneath effectively
/// exclusive per file; distinct files never block each other. The cached size
/// lives outside the lock so attribute queries never wait behind a download.
pub struct FileNode {
    name: String,
    ino: u64,
    size: AtomicU64,
    inner: tokio::sync::Mutex<FileState>,
}

impl FileNode {
    pub fn new(
        name: &str,
        ino: u64,
        drive: Arc<dyn DriveCapability>,
        remote: Option<RemoteObjectRef>,
    ) -> Arc<Self> {
        let size = remote.as_ref().map(|r| r.size).unwrap_or(0);
        Arc::new(Self {
            name: name.to_string(),
            ino,
            size: AtomicU64::new(size),
            inner: tokio::sync::Mutex::new(FileState {
                drive,
                remote,
                cache: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Last-known size: the staged length while open, the remote object's
    /// size otherwise.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Load the staging cache. Opening an already-open node shares the one
    /// spool, so reads always observe writes made through this node.
    pub async fn open(&self) -> Result<(), FsError> {
        let mut st = self.inner.lock().await;
        if let Some(cache) = st.cache.as_mut() {
            // an explicit flush leaves the cache empty; re-open reloads it
            cache.ensure_loaded().await?;
            if let Some(len) = cache.staged_len() {
                self.size.store(len, Ordering::Relaxed);
            }
            return Ok(());
        }
        let mut cache = StagingCache::new(st.drive.clone(), st.remote.clone());
        // on failure the cache drops here and the node stays Closed
        cache.ensure_loaded().await?;
        if let Some(len) = cache.staged_len() {
            self.size.store(len, Ordering::Relaxed);
        }
        st.cache = Some(cache);
        Ok(())
    }

    pub async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, FsError> {
        let mut st = self.inner.lock().await;
        let Some(cache) = st.cache.as_mut() else {
            return Err(FsError::NotOpen);
        };
        cache.read(offset, len).await
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let mut st = self.inner.lock().await;
        let Some(cache) = st.cache.as_mut() else {
            return Err(FsError::NotOpen);
        };
        let n = cache.write(offset, data).await?;
        if let Some(len) = cache.staged_len() {
            self.size.store(len, Ordering::Relaxed);
        }
        Ok(n)
    }

    /// Persist the staged content; the node stays Open. On failure the spool
    /// is untouched so the caller may retry or eventually release.
    pub async fn flush(&self) -> Result<(), FsError> {
        let mut st = self.inner.lock().await;
        let Some(cache) = st.cache.as_mut() else {
            return Err(FsError::NotOpen);
        };
        let remote = cache.flush().await?;
        self.size.store(remote.size, Ordering::Relaxed);
        st.remote = Some(remote);
        Ok(())
    }

    /// Close the node: attempt an implicit flush of still-staged content,
    /// then discard the cache regardless of the outcome. A failed implicit
    /// flush is surfaced to the caller but never wedges the node.
    pub async fn release(&self) -> Result<(), FsError> {
        let mut st = self.inner.lock().await;
        let Some(mut cache) = st.cache.take() else {
            return Ok(());
        };
        if !cache.is_ready() {
            return Ok(());
        }
        match cache.flush().await {
            Ok(remote) => {
                self.size.store(remote.size, Ordering::Relaxed);
                st.remote = Some(remote);
                Ok(())
            }
            Err(e) => {
                // the node closes on the remote object's old content, so the
                // reported size must fall back to it as well
                let remote_size = st.remote.as_ref().map(|r| r.size).unwrap_or(0);
                self.size.store(remote_size, Ordering::Relaxed);
                log::warn!("release: implicit flush of {} failed: {e}", self.name);
                Err(e)
            }
        }
    }
}

// ===== directories =====

struct DirState {
    /// Cached entry-kind listing driving lazy construction.
    entries: BTreeMap<String, EntrySpec>,
    /// Memoized children; repeated lookups return the same instance so lock
    /// identity and any open staging cache survive.
    children: HashMap<String, NodeRef>,
}

pub struct DirectoryNode {
    name: String,
    ino: u64,
    parent_ino: u64,
    state: Mutex<DirState>,
}

/// Snapshot entry returned by `list`. `ino` is only present for children
/// that have been materialized; listing alone never constructs nodes.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
    pub ino: Option<u64>,
}

impl DirectoryNode {
    pub fn new(name: &str, ino: u64, parent_ino: u64, manifest: DirManifest) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ino,
            parent_ino,
            state: Mutex::new(DirState {
                entries: manifest,
                children: HashMap::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn parent_ino(&self) -> u64 {
        self.parent_ino
    }

    /// Resolve a child, constructing it from the entry listing on first use.
    /// Materialize-and-memoize happens atomically under the directory lock:
    /// two concurrent lookups for the same name get the same node instance.
    pub fn lookup_child(&self, name: &str, table: &NodeTable) -> Option<NodeRef> {
        let mut st = self.state.lock().unwrap();
        if let Some(node) = st.children.get(name) {
            return Some(node.clone());
        }
        let spec = st.entries.get(name)?.clone();
        let node = match spec {
            EntrySpec::File(remote) => {
                let drive = remote.drive.clone();
                NodeRef::File(FileNode::new(name, table.alloc_ino(), drive, Some(remote)))
            }
            EntrySpec::Dir(manifest) => NodeRef::Dir(DirectoryNode::new(
                name,
                table.alloc_ino(),
                self.ino,
                manifest,
            )),
        };
        table.register(node.clone());
        st.children.insert(name.to_string(), node.clone());
        Some(node)
    }

    /// Register a brand-new child created at runtime (already materialized).
    pub fn insert_child(&self, name: &str, node: NodeRef, table: &NodeTable) -> Result<(), FsError> {
        let mut st = self.state.lock().unwrap();
        if st.children.contains_key(name) || st.entries.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        table.register(node.clone());
        st.children.insert(name.to_string(), node);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        let st = self.state.lock().unwrap();
        st.children.contains_key(name) || st.entries.contains_key(name)
    }

    /// Point-in-time snapshot of the known entries, in name order. Sizes for
    /// materialized children reflect their current state; everything else
    /// comes from the cached listing. No children are constructed.
    pub fn list(&self) -> Vec<DirEntry> {
        let st = self.state.lock().unwrap();
        let mut out: BTreeMap<String, DirEntry> = BTreeMap::new();
        for (name, spec) in &st.entries {
            let (kind, size) = match spec {
                EntrySpec::File(remote) => (NodeKind::File, remote.size),
                EntrySpec::Dir(_) => (NodeKind::Dir, 0),
            };
            out.insert(
                name.clone(),
                DirEntry {
                    name: name.clone(),
                    kind,
                    size,
                    ino: None,
                },
            );
        }
        for (name, node) in &st.children {
            out.insert(
                name.clone(),
                DirEntry {
                    name: name.clone(),
                    kind: node.kind(),
                    size: node.size(),
                    ino: Some(node.ino()),
                },
            );
        }
        out.into_values().collect()
    }
}
