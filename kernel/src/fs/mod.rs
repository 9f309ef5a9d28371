//! Virtual file system.
//!
//! An RCU-protected node graph with pluggable drivers. Path resolution
//! walks from the root taking shared folder locks inside an RCU guard;
//! structural changes lock only the parent folder. Mount bookkeeping is
//! the one place that takes the exclusive VFS-wide lock.

pub mod blockdev;
pub mod interface;
pub mod node;
pub mod path;
pub mod ramfs;
pub mod tarfs;

pub use blockdev::{BlockDevice, MemoryBlockDevice};
pub use interface::{
    OsGuid, OS_FILE_GUID, OS_FOLDER_GUID, OS_IDENTIFY_GUID, OS_ITERATOR_GUID,
};
pub use node::{
    query, DirEntry, IdentifyInfo, Node, NodeAccess, NodeStat, SeekMode, VfsDriver, VfsHandle,
    VfsMount, VfsNodeType,
};
pub use path::{verify_path_text, VfsPath};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use lazy_static::lazy_static;
use spin::RwLock;

use crate::error::{OsResult, OsStatus};
use crate::sync::{kernel_domain, RcuGuard, RcuShared};

/// The mounted tree.
pub struct VfsRoot {
    root: RcuShared<Node>,
    /// Keeps every mount alive; nodes reference their mount weakly.
    mounts: RwLock<BTreeMap<VfsPath, Arc<dyn VfsMount>>>,
}

impl VfsRoot {
    /// A fresh tree with a ramfs root.
    pub fn new() -> OsResult<VfsRoot> {
        let mount = ramfs::RamFs::instance().mount()?;
        let root = mount.root()?;

        let mut mounts = BTreeMap::new();
        mounts.insert(VfsPath::root(), mount);

        Ok(VfsRoot {
            root,
            mounts: RwLock::new(mounts),
        })
    }

    /// The root node.
    pub fn root(&self) -> RcuShared<Node> {
        self.root.clone()
    }

    /// Resolve `path` to a node.
    ///
    /// Iterative so deep trees cannot exhaust the kernel stack; the RCU
    /// guard keeps every node observed during the walk alive.
    pub fn lookup(&self, path: &VfsPath) -> OsResult<RcuShared<Node>> {
        let _guard = RcuGuard::new(kernel_domain());

        let mut current = self.root.clone();
        for segment in path.segments() {
            let next = {
                let folder = current
                    .folder()
                    .map_err(|_| OsStatus::TraverseNonFolder)?;
                folder.lookup(segment).ok_or(OsStatus::NotFound)?
            };
            current = next;
        }

        Ok(current)
    }

    /// Resolve the parent folder of `path`.
    fn lookup_parent(&self, path: &VfsPath) -> OsResult<RcuShared<Node>> {
        if path.is_root() {
            return Err(OsStatus::InvalidPath);
        }

        let parent = self.lookup(&path.parent())?;
        parent.folder()?;
        Ok(parent)
    }

    /// Create a file node at `path` through the owning mount's driver.
    pub fn create(&self, path: &VfsPath) -> OsResult<RcuShared<Node>> {
        let parent = self.lookup_parent(path)?;
        let name = path.name();
        let folder = parent.folder()?;

        let mount = parent.mount()?;
        let node = mount.create_file(name)?;
        node.init(Some(parent.downgrade()), Arc::downgrade(&mount));

        folder.insert(name, node.clone())?;
        Ok(node)
    }

    /// Create a folder node at `path`.
    pub fn mkdir(&self, path: &VfsPath) -> OsResult<RcuShared<Node>> {
        let parent = self.lookup_parent(path)?;
        let name = path.name();
        let folder = parent.folder()?;

        let mount = parent.mount()?;
        let node = mount.create_folder(name)?;
        node.init(Some(parent.downgrade()), Arc::downgrade(&mount));

        folder.insert(name, node.clone())?;
        Ok(node)
    }

    /// Recursive mkdir: create every missing component of `path`.
    pub fn mkpath(&self, path: &VfsPath) -> OsResult<RcuShared<Node>> {
        let mut current = VfsPath::root();
        let mut node = self.root.clone();

        for segment in path.segments() {
            current = current.join(segment)?;
            node = match self.lookup(&current) {
                Ok(existing) => {
                    existing.folder()?;
                    existing
                }
                Err(OsStatus::NotFound) => self.mkdir(&current)?,
                Err(status) => return Err(status),
            };
        }

        Ok(node)
    }

    /// Unlink a non-folder node from its parent.
    pub fn remove(&self, node: &RcuShared<Node>) -> OsResult {
        if node.is_folder() {
            return Err(OsStatus::InvalidType);
        }

        let parent = node.parent().ok_or(OsStatus::NotAvailable)?;
        parent.folder()?.remove(node.name()).map(drop)
    }

    /// Unlink an empty folder from its parent.
    pub fn rmdir(&self, node: &RcuShared<Node>) -> OsResult {
        let folder = node.folder()?;
        if !folder.is_empty() {
            return Err(OsStatus::HandleLocked);
        }
        if self.mounts.read().values().any(|mount| {
            mount
                .root()
                .map(|root| root.ptr_eq(node))
                .unwrap_or(false)
        }) {
            return Err(OsStatus::HandleLocked);
        }

        let parent = node.parent().ok_or(OsStatus::NotAvailable)?;
        parent.folder()?.remove(node.name()).map(drop)
    }

    /// Open `path` as a file stream.
    pub fn open(&self, path: &VfsPath, access: NodeAccess) -> OsResult<Arc<VfsHandle>> {
        let node = self.lookup(path)?;
        if node.node_type() != VfsNodeType::File {
            return Err(OsStatus::InvalidType);
        }
        node::query(&node, OS_FILE_GUID, access, &[])
    }

    /// Open `path` for directory iteration.
    pub fn opendir(&self, path: &VfsPath) -> OsResult<Arc<VfsHandle>> {
        let node = self.lookup(path)?;
        node.folder()?;
        node::query(&node, OS_ITERATOR_GUID, NodeAccess::R, &[])
    }

    /// Mount `driver`'s parameterless mount at `path`.
    ///
    /// Takes the exclusive mount lock, resolves the parent, asks the
    /// driver for a fresh mount, and links its root at `path.name()`.
    pub fn add_mount(
        &self,
        driver: &dyn VfsDriver,
        path: &VfsPath,
    ) -> OsResult<Arc<dyn VfsMount>> {
        let mount = driver.mount()?;
        self.add_mount_with(mount.clone(), path)?;
        Ok(mount)
    }

    /// Mount a pre-created mount at `path`.
    ///
    /// The driver's parameterised `create_mount` runs at the call site
    /// so driver-specific data (a backing block device, parse options)
    /// is supplied by the caller.
    pub fn add_mount_with(&self, mount: Arc<dyn VfsMount>, path: &VfsPath) -> OsResult {
        let mut mounts = self.mounts.write();
        if mounts.contains_key(path) {
            return Err(OsStatus::AlreadyExists);
        }

        let parent = self.lookup_parent(path)?;
        let name = path.name();

        let root = mount.root()?;
        root.init(Some(parent.downgrade()), Arc::downgrade(&mount));
        parent.folder()?.insert(name, root)?;

        mounts.insert(path.clone(), mount);
        Ok(())
    }

    /// Link an externally constructed device node at `path`.
    pub fn mkdevice(&self, path: &VfsPath, device: RcuShared<Node>) -> OsResult {
        let parent = self.lookup_parent(path)?;
        let name = path.name();

        let mount = parent.mount()?;
        device.init(Some(parent.downgrade()), Arc::downgrade(&mount));
        parent.folder()?.insert(name, device)
    }

    /// Open a device interface on the node at `path`.
    pub fn device(
        &self,
        path: &VfsPath,
        guid: OsGuid,
        data: &[u8],
        access: NodeAccess,
    ) -> OsResult<Arc<VfsHandle>> {
        let node = self.lookup(path)?;
        node::query(&node, guid, access, data)
    }
}

lazy_static! {
    /// The system VFS.
    pub static ref VFS_ROOT: VfsRoot = VfsRoot::new().expect("root ramfs mount cannot fail");
}

/// The system VFS.
pub fn vfs_root() -> &'static VfsRoot {
    &VFS_ROOT
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::format;
    use alloc::vec::Vec;

    use super::*;

    fn fresh_vfs() -> VfsRoot {
        VfsRoot::new().unwrap()
    }

    fn path(text: &str) -> VfsPath {
        VfsPath::new(text).unwrap()
    }

    #[test]
    fn mkdir_then_lookup_returns_the_folder() {
        let vfs = fresh_vfs();
        vfs.mkdir(&path("test")).unwrap();

        let node = vfs.lookup(&path("test")).unwrap();
        assert_eq!(node.name(), "test");
        assert!(node.is_folder());
    }

    #[test]
    fn remove_makes_lookup_fail() {
        let vfs = fresh_vfs();
        vfs.mkdir(&path("tmp")).unwrap();
        let file = vfs.create(&path("tmp\0scratch")).unwrap();

        vfs.remove(&file).unwrap();
        assert_eq!(
            vfs.lookup(&path("tmp\0scratch")).unwrap_err(),
            OsStatus::NotFound
        );
    }

    #[test]
    fn create_requires_the_parent_chain() {
        let vfs = fresh_vfs();
        assert_eq!(
            vfs.create(&path("missing\0file")).unwrap_err(),
            OsStatus::NotFound
        );

        vfs.mkpath(&path("a\0b\0c")).unwrap();
        vfs.create(&path("a\0b\0c\0file")).unwrap();
        assert!(vfs.lookup(&path("a\0b\0c\0file")).is_ok());

        // mkpath over existing components is idempotent.
        vfs.mkpath(&path("a\0b")).unwrap();
    }

    #[test]
    fn traverse_through_a_file_is_rejected() {
        let vfs = fresh_vfs();
        vfs.create(&path("plain")).unwrap();
        assert_eq!(
            vfs.lookup(&path("plain\0below")).unwrap_err(),
            OsStatus::TraverseNonFolder
        );
    }

    #[test]
    fn duplicate_create_already_exists() {
        let vfs = fresh_vfs();
        vfs.create(&path("once")).unwrap();
        assert_eq!(
            vfs.create(&path("once")).unwrap_err(),
            OsStatus::AlreadyExists
        );
    }

    #[test]
    fn rmdir_refuses_populated_folders() {
        let vfs = fresh_vfs();
        let folder = vfs.mkdir(&path("full")).unwrap();
        vfs.create(&path("full\0entry")).unwrap();

        assert_eq!(vfs.rmdir(&folder).unwrap_err(), OsStatus::HandleLocked);

        let entry = vfs.lookup(&path("full\0entry")).unwrap();
        vfs.remove(&entry).unwrap();
        vfs.rmdir(&folder).unwrap();
        assert_eq!(vfs.lookup(&path("full")).unwrap_err(), OsStatus::NotFound);
    }

    #[test]
    fn directory_iteration_and_invalidation() {
        let vfs = fresh_vfs();
        vfs.mkdir(&path("dir")).unwrap();
        vfs.create(&path("dir\0alpha")).unwrap();
        vfs.create(&path("dir\0beta")).unwrap();

        let iter = vfs.opendir(&path("dir")).unwrap();
        assert_eq!(iter.next_entry().unwrap().name, "alpha");

        // A structural change invalidates the outstanding iterator.
        vfs.create(&path("dir\0gamma")).unwrap();
        assert_eq!(iter.next_entry().unwrap_err(), OsStatus::InvalidData);

        // A fresh iterator sees all three and then completes.
        let iter = vfs.opendir(&path("dir")).unwrap();
        let mut names = Vec::new();
        while let Ok(entry) = iter.next_entry() {
            names.push(entry.name);
        }
        assert_eq!(names, ["alpha", "beta", "gamma"]);
        assert_eq!(iter.next_entry().unwrap_err(), OsStatus::Completed);
    }

    #[test]
    fn tarfs_mounts_into_the_tree() {
        let vfs = fresh_vfs();
        vfs.mkdir(&path("mnt")).unwrap();

        let archive = tarfs::tests::build_archive(&[
            ("readme", b'0', b"archived"),
        ]);
        let mount = tarfs::TarFs::instance()
            .create_mount(
                MemoryBlockDevice::new(archive),
                tarfs::TarParseOptions::default(),
            )
            .unwrap();
        vfs.add_mount_with(mount, &path("mnt\0initrd")).unwrap();

        let handle = vfs
            .open(&path("mnt\0initrd\0readme"), NodeAccess::R)
            .unwrap();
        let mut buffer = [0u8; 16];
        let read = handle.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..read], b"archived");

        // Mounting at the same path twice is rejected.
        let again = tarfs::TarFs::instance()
            .create_mount(
                MemoryBlockDevice::new(tarfs::tests::build_archive(&[])),
                tarfs::TarParseOptions::default(),
            )
            .unwrap();
        assert_eq!(
            vfs.add_mount_with(again, &path("mnt\0initrd")).unwrap_err(),
            OsStatus::AlreadyExists
        );
    }

    #[test]
    fn identify_reports_driver_and_interfaces() {
        let vfs = fresh_vfs();
        let file = vfs.create(&path("about")).unwrap();

        let handle = node::query(&file, OS_IDENTIFY_GUID, NodeAccess::empty(), &[]).unwrap();
        let info = handle.identify().unwrap();
        assert_eq!(info.name, "about");
        assert_eq!(info.driver, "ramfs");

        let mut guids = [OsGuid::NULL; 1];
        assert_eq!(handle.interfaces(&mut guids).unwrap_err(), OsStatus::MoreData);

        let mut guids = [OsGuid::NULL; 8];
        let count = handle.interfaces(&mut guids).unwrap();
        assert!(guids[..count].contains(&OS_FILE_GUID));
        assert!(guids[..count].contains(&OS_IDENTIFY_GUID));
        assert!(!guids[..count].contains(&OS_FOLDER_GUID));
    }

    #[test]
    fn device_nodes_stream_but_do_not_seek() {
        use super::node::testing::{StreamDevice, STREAM_DEVICE_GUID};

        let vfs = fresh_vfs();
        vfs.mkdir(&path("dev")).unwrap();
        vfs.mkdevice(&path("dev\0loop"), StreamDevice::node("loop"))
            .unwrap();

        let handle = vfs
            .device(&path("dev\0loop"), STREAM_DEVICE_GUID, &[], NodeAccess::RW)
            .unwrap();

        // Streams read and write without a cursor.
        assert_eq!(handle.write(b"ping").unwrap(), 4);
        let mut buffer = [0u8; 8];
        assert_eq!(handle.read(&mut buffer).unwrap(), 4);
        assert_eq!(&buffer[..4], b"ping");
        assert_eq!(handle.read(&mut buffer).unwrap(), 0, "stream drained");

        // No position exists to move: the resource refuses the seek,
        // whichever origin is asked for.
        for mode in [SeekMode::Absolute, SeekMode::Relative, SeekMode::End] {
            assert_eq!(handle.seek(mode, 0).unwrap_err(), OsStatus::NotSupported);
        }

        // The device interface shows up in identify enumeration.
        let node = vfs.lookup(&path("dev\0loop")).unwrap();
        let identify =
            node::query(&node, OS_IDENTIFY_GUID, NodeAccess::empty(), &[]).unwrap();
        let mut guids = [OsGuid::NULL; 8];
        let count = identify.interfaces(&mut guids).unwrap();
        assert!(guids[..count].contains(&STREAM_DEVICE_GUID));

        // Interfaces the device does not list are still rejected.
        let bogus = OsGuid::new(9, 9, 9, 9, 9);
        assert_eq!(
            vfs.device(&path("dev\0loop"), bogus, &[], NodeAccess::R)
                .unwrap_err(),
            OsStatus::InterfaceNotSupported
        );
    }

    #[test]
    fn unsupported_interface_is_reported() {
        let vfs = fresh_vfs();
        let file = vfs.create(&path("leaf")).unwrap();

        let bogus = OsGuid::new(1, 2, 3, 4, 5);
        assert_eq!(
            node::query(&file, bogus, NodeAccess::R, &[]).unwrap_err(),
            OsStatus::InterfaceNotSupported
        );
        assert_eq!(
            node::query(&file, OS_FOLDER_GUID, NodeAccess::R, &[]).unwrap_err(),
            OsStatus::InvalidType
        );
    }

    /// Concurrent create/remove against a reader storm under RCU: no
    /// reader may ever observe a freed node, and the surviving children
    /// must equal the ledger of successful creates minus removes.
    #[test]
    fn concurrent_mutation_soak() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc as StdArc;
        use std::thread;

        let vfs = StdArc::new(fresh_vfs());
        vfs.mkdir(&path("soak")).unwrap();

        let stop = StdArc::new(AtomicBool::new(false));

        let mut readers = Vec::new();
        for reader in 0..10 {
            let vfs = StdArc::clone(&vfs);
            let stop = StdArc::clone(&stop);
            readers.push(thread::spawn(move || {
                let mut index = reader;
                while !stop.load(Ordering::Relaxed) {
                    let name = path(&format!("soak\0entry-{}", index % 50));
                    if let Ok(node) = vfs.lookup(&name) {
                        // Touch the node; RCU must keep it alive.
                        assert!(node.name().starts_with("entry-"));
                    }
                    index += 1;
                }
            }));
        }

        let drainer = {
            let stop = StdArc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    crate::sync::kernel_domain().synchronize();
                    thread::yield_now();
                }
            })
        };

        // Writer: alternate create and remove over 500 pseudo-random
        // paths, keeping a ledger of what should survive.
        let mut ledger = std::collections::BTreeSet::new();
        let mut state = 0x243f_6a88u64;
        for _ in 0..500 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let slot = (state >> 33) % 50;
            let name = format!("entry-{}", slot);
            let full = path(&format!("soak\0entry-{}", slot));

            if ledger.contains(&name) {
                let node = vfs.lookup(&full).unwrap();
                vfs.remove(&node).unwrap();
                ledger.remove(&name);
            } else {
                vfs.create(&full).unwrap();
                ledger.insert(name);
            }
        }

        stop.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }
        drainer.join().unwrap();

        let soak = vfs.lookup(&path("soak")).unwrap();
        let mut survivors = soak.folder().unwrap().child_names();
        survivors.sort();
        let mut expected: Vec<_> = ledger.into_iter().collect();
        expected.sort();
        assert_eq!(survivors, expected);
    }
}
