//! In-memory filesystem.
//!
//! The bootstrap root filesystem: files are byte vectors under a
//! shared/exclusive lock, folders are plain [`FolderMixin`] nodes.
//! Reads clip to `[offset, offset + len) ∩ [0, size)`; writes extend
//! the vector as needed.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::RwLock;

use super::node::{
    FolderMixin, Node, NodeAccess, NodeOps, NodeStat, VfsDriver, VfsMount, VfsNodeType,
};
use crate::error::{OsResult, OsStatus};
use crate::sync::RcuShared;

/// Preferred block size reported by `stat`.
const RAMFS_BLOCK_SIZE: u64 = 512;

/// File content behind a shared/exclusive lock.
struct RamFile {
    data: RwLock<Vec<u8>>,
}

impl NodeOps for RamFile {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> OsResult<usize> {
        let data = self.data.read();
        let size = data.len() as u64;
        if offset >= size {
            return Ok(0);
        }

        let take = buffer.len().min((size - offset) as usize);
        buffer[..take].copy_from_slice(&data[offset as usize..offset as usize + take]);
        Ok(take)
    }

    fn write(&self, offset: u64, payload: &[u8]) -> OsResult<usize> {
        let mut data = self.data.write();
        let end = offset
            .checked_add(payload.len() as u64)
            .ok_or(OsStatus::InvalidSpan)? as usize;

        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(payload);
        Ok(payload.len())
    }

    fn truncate(&self, size: u64) -> OsResult {
        self.data.write().resize(size as usize, 0);
        Ok(())
    }

    fn stat(&self) -> OsResult<NodeStat> {
        let size = self.data.read().len() as u64;
        Ok(NodeStat {
            logical: size,
            block_size: RAMFS_BLOCK_SIZE,
            blocks: size.div_ceil(RAMFS_BLOCK_SIZE),
            access: NodeAccess::RW.bits(),
        })
    }
}

/// Folder node: just the mixin.
struct RamFolder {
    mixin: FolderMixin,
}

impl NodeOps for RamFolder {
    fn stat(&self) -> OsResult<NodeStat> {
        Ok(NodeStat {
            logical: self.mixin.count() as u64,
            block_size: RAMFS_BLOCK_SIZE,
            blocks: 0,
            access: NodeAccess::RW.bits(),
        })
    }

    fn folder(&self) -> Option<&FolderMixin> {
        Some(&self.mixin)
    }
}

/// One mounted ramfs instance.
pub struct RamFsMount {
    root: RcuShared<Node>,
}

impl RamFsMount {
    fn make_file(name: &str) -> RcuShared<Node> {
        Node::new(
            String::from(name),
            VfsNodeType::File,
            NodeAccess::RW,
            Box::new(RamFile {
                data: RwLock::new(Vec::new()),
            }),
        )
    }

    fn make_folder(name: &str) -> RcuShared<Node> {
        Node::new(
            String::from(name),
            VfsNodeType::Folder,
            NodeAccess::RW,
            Box::new(RamFolder {
                mixin: FolderMixin::new(),
            }),
        )
    }
}

impl VfsMount for RamFsMount {
    fn driver_name(&self) -> &'static str {
        "ramfs"
    }

    fn root(&self) -> OsResult<RcuShared<Node>> {
        Ok(self.root.clone())
    }

    fn create_file(&self, name: &str) -> OsResult<RcuShared<Node>> {
        Ok(Self::make_file(name))
    }

    fn create_folder(&self, name: &str) -> OsResult<RcuShared<Node>> {
        Ok(Self::make_folder(name))
    }
}

/// The ramfs driver singleton.
pub struct RamFs;

impl RamFs {
    pub fn instance() -> &'static RamFs {
        static INSTANCE: RamFs = RamFs;
        &INSTANCE
    }
}

impl VfsDriver for RamFs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn mount(&self) -> OsResult<Arc<dyn VfsMount>> {
        let mount = Arc::new_cyclic(|weak: &Weak<RamFsMount>| {
            let root = RamFsMount::make_folder("");
            let mount_ref: Weak<dyn VfsMount> = weak.clone();
            root.init(None, mount_ref);
            RamFsMount { root }
        });
        Ok(mount)
    }
}
