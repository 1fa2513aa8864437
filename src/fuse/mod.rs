//! FUSE adapter and request handling
//!
//! Implements the `rfuse3` `Filesystem` trait for `FilesystemRoot`, mapping
//! kernel requests onto the core handler surface and the core error taxonomy
//! onto errno values. File handles are stateless (`fh = 0`): all per-file
//! state lives in the node itself, and open files are served with direct I/O
//! so every read and write round-trips through the staging spool.

pub mod mount;

use crate::error::FsError;
use crate::vfs::fs::{FilesystemRoot, NodeAttr};
use crate::vfs::node::NodeKind;
use bytes::Bytes;
use rfuse3::Result as FuseResult;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyCreated, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{Errno, FileType as FuseFileType, SetAttr, Timestamp};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use futures_util::stream::{self, Stream};

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 4096;
// FOPEN_DIRECT_IO from the FUSE ABI: bypass the kernel page cache so reads
// always observe writes made through the staging spool.
const FOPEN_DIRECT_IO: u32 = 1 << 0;

fn errno_of(e: &FsError) -> Errno {
    match e {
        FsError::NotFound => libc::ENOENT.into(),
        FsError::NotOpen => libc::EBADF.into(),
        FsError::NotDirectory => libc::ENOTDIR.into(),
        FsError::IsDirectory => libc::EISDIR.into(),
        FsError::AlreadyExists => libc::EEXIST.into(),
        FsError::AllocationFailed(_) => libc::ENOSPC.into(),
        FsError::OutOfRange { .. } => libc::EINVAL.into(),
        FsError::Load(_) | FsError::Flush(_) | FsError::Io(_) => libc::EIO.into(),
    }
}

fn kind_to_fuse(kind: NodeKind) -> FuseFileType {
    match kind {
        NodeKind::Dir => FuseFileType::Directory,
        NodeKind::File => FuseFileType::RegularFile,
    }
}

fn attr_to_fuse(attr: &NodeAttr, uid: u32, gid: u32) -> rfuse3::raw::reply::FileAttr {
    // times and permissions are synthesized: drives carry neither
    let now = Timestamp::from(SystemTime::now());
    let perm = match attr.kind {
        NodeKind::Dir => 0o755,
        NodeKind::File => 0o644,
    } as u16;
    let blocks = attr.size.div_ceil(512);
    rfuse3::raw::reply::FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks,
        atime: now,
        mtime: now,
        ctime: now,
        #[cfg(target_os = "macos")]
        crtime: now,
        kind: kind_to_fuse(attr.kind),
        perm,
        nlink: 1,
        uid,
        gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: BLOCK_SIZE,
    }
}

/// Full readdirplus listing: "." and ".." followed by every resolvable child.
/// Each entry's offset is its position in the listing, so a stream resumed at
/// any offset continues exactly where the previous one stopped even when an
/// entry was skipped.
fn plus_entries(
    fs: &FilesystemRoot,
    ino: u64,
    uid: u32,
    gid: u32,
) -> FuseResult<Vec<DirectoryEntryPlus>> {
    let entries = FilesystemRoot::readdir(fs, ino).map_err(|e| errno_of(&e))?;
    let parent_ino = FilesystemRoot::parent_of(fs, ino).map_err(|e| errno_of(&e))?;
    let self_attr = FilesystemRoot::getattr(fs, ino).map_err(|e| errno_of(&e))?;
    let parent_attr = FilesystemRoot::getattr(fs, parent_ino).map_err(|e| errno_of(&e))?;

    let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(entries.len() + 2);
    all.push(DirectoryEntryPlus {
        inode: ino,
        generation: 0,
        kind: FuseFileType::Directory,
        name: OsString::from("."),
        offset: 1,
        attr: attr_to_fuse(&self_attr, uid, gid),
        entry_ttl: TTL,
        attr_ttl: TTL,
    });
    all.push(DirectoryEntryPlus {
        inode: parent_ino,
        generation: 0,
        kind: FuseFileType::Directory,
        name: OsString::from(".."),
        offset: 2,
        attr: attr_to_fuse(&parent_attr, uid, gid),
        entry_ttl: TTL,
        attr_ttl: TTL,
    });
    // readdirplus is readdir+lookup, so materializing here is in contract
    for e in &entries {
        let Ok(attr) = FilesystemRoot::lookup(fs, ino, &e.name) else {
            continue;
        };
        let offset = all.len() as i64 + 1;
        all.push(DirectoryEntryPlus {
            inode: attr.ino,
            generation: 0,
            kind: kind_to_fuse(attr.kind),
            name: OsString::from(e.name.clone()),
            offset,
            attr: attr_to_fuse(&attr, uid, gid),
            entry_ttl: TTL,
            attr_ttl: TTL,
        });
    }
    Ok(all)
}

impl Filesystem for FilesystemRoot {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        // conservative: one full staging write per request
        let max_write = NonZeroU32::new(1024 * 1024).unwrap();
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let name = name.to_string_lossy();
        let attr = FilesystemRoot::lookup(self, parent, name.as_ref()).map_err(|e| errno_of(&e))?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr: attr_to_fuse(&attr, req.uid, req.gid),
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let attr = FilesystemRoot::getattr(self, ino).map_err(|e| errno_of(&e))?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: attr_to_fuse(&attr, req.uid, req.gid),
        })
    }

    // Only a size-preserving setattr can be honored: remote objects are
    // replaced whole on flush, and truncation is not part of the core
    // contract. Mode/time changes are accepted as no-ops.
    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let attr = FilesystemRoot::getattr(self, ino).map_err(|e| errno_of(&e))?;
        if let Some(size) = set_attr.size {
            if size != attr.size {
                return Err(libc::EOPNOTSUPP.into());
            }
        }
        Ok(ReplyAttr {
            ttl: TTL,
            attr: attr_to_fuse(&attr, req.uid, req.gid),
        })
    }

    async fn open(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        FilesystemRoot::open(self, ino).await.map_err(|e| errno_of(&e))?;
        Ok(ReplyOpen {
            fh: 0,
            flags: FOPEN_DIRECT_IO,
        })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let attr = FilesystemRoot::getattr(self, ino).map_err(|e| errno_of(&e))?;
        if attr.kind != NodeKind::Dir {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = FilesystemRoot::read(self, ino, offset, size as usize)
            .await
            .map_err(|e| errno_of(&e))?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let n = FilesystemRoot::write(self, ino, offset, data)
            .await
            .map_err(|e| errno_of(&e))? as u32;
        Ok(ReplyWrite { written: n })
    }

    async fn flush(&self, _req: Request, ino: u64, _fh: u64, _lock_owner: u64) -> FuseResult<()> {
        match FilesystemRoot::flush(self, ino).await {
            Ok(()) => Ok(()),
            // flushing a closed handle is a no-op, matching close-after-flush
            Err(FsError::NotOpen) => Ok(()),
            Err(e) => Err(errno_of(&e)),
        }
    }

    async fn release(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        match FilesystemRoot::release(self, ino).await {
            Ok(()) => Ok(()),
            // the node is closed either way; surface the implicit-flush error
            Err(e) => Err(errno_of(&e)),
        }
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let name = name.to_string_lossy();
        // the kernel gives no size hint at create time; allocate for an
        // empty file and let the first flush consume real quota
        let attr = FilesystemRoot::create(self, parent, name.as_ref(), 0)
            .await
            .map_err(|e| errno_of(&e))?;
        FilesystemRoot::open(self, attr.ino)
            .await
            .map_err(|e| errno_of(&e))?;
        Ok(ReplyCreated {
            ttl: TTL,
            attr: attr_to_fuse(&attr, req.uid, req.gid),
            generation: 0,
            fh: 0,
            flags: FOPEN_DIRECT_IO,
        })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let entries = FilesystemRoot::readdir(self, ino).map_err(|e| errno_of(&e))?;
        let parent_ino = FilesystemRoot::parent_of(self, ino).map_err(|e| errno_of(&e))?;

        // "." and ".." first; offset is the offset of the previous entry
        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(entries.len() + 2);
        all.push(DirectoryEntry {
            inode: ino,
            kind: FuseFileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        all.push(DirectoryEntry {
            inode: parent_ino,
            kind: FuseFileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });
        for (i, e) in entries.iter().enumerate() {
            all.push(DirectoryEntry {
                // unmaterialized children have no inode yet; the kernel only
                // trusts these values with readdirplus, which materializes
                inode: e.ino.unwrap_or(0),
                kind: kind_to_fuse(e.kind),
                name: OsString::from(e.name.clone()),
                offset: (i as i64) + 3,
            });
        }

        let start = if offset <= 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let stream_iter = stream::iter(slice.into_iter().map(Ok));
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream_iter);
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let all = plus_entries(self, ino, req.uid, req.gid)?;

        let start = if offset == 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all[start..].to_vec()
        };
        let stream_iter = stream::iter(slice.into_iter().map(Ok));
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream_iter);
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        let (used, total) = self.space().await;
        let blocks = total / BLOCK_SIZE as u64;
        let bfree = total.saturating_sub(used) / BLOCK_SIZE as u64;
        Ok(ReplyStatFs {
            blocks,
            bfree,
            bavail: bfree,
            files: 0,
            ffree: u64::MAX,
            bsize: BLOCK_SIZE,
            namelen: 255,
            frsize: BLOCK_SIZE,
        })
    }

    // ===== no-op surfaces: handles are stateless, data syncs on flush =====

    async fn fsync(&self, _req: Request, _ino: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn releasedir(&self, _req: Request, _ino: u64, _fh: u64, _flags: u32) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(&self, _req: Request, _ino: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn forget(&self, _req: Request, _ino: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}
