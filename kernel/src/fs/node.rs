//! The VFS node graph.
//!
//! Nodes are published through [`RcuShared`] pointers: parents hold
//! strong references to children in their folder map, children hold
//! weak references back, and lookups inside an RCU guard can never
//! observe a freed node. Structural mutation takes the exclusive side
//! of the owning folder's lock only.
//!
//! Behaviour is split between a small per-driver vtable ([`NodeOps`])
//! and the closed interface table this module owns; a handle is minted
//! by looking the requested GUID up in that table.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use super::interface::{
    OsGuid, OS_FILE_GUID, OS_FOLDER_GUID, OS_IDENTIFY_GUID, OS_ITERATOR_GUID,
};
use crate::error::{OsResult, OsStatus};
use crate::sync::{kernel_domain, RcuGuard, RcuShared, RcuWeak};

/// Node classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsNodeType {
    File,
    Folder,
    Link,
}

bitflags::bitflags! {
    /// Rights a node supports or a handle was granted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl NodeAccess {
    pub const R: NodeAccess = NodeAccess::READ;
    pub const RW: NodeAccess = NodeAccess::READ.union(NodeAccess::WRITE);
}

/// `stat` output for a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStat {
    /// Logical byte count of the content.
    pub logical: u64,
    /// Preferred block size of the backing store.
    pub block_size: u64,
    /// Blocks occupied on the backing store.
    pub blocks: u64,
    /// Rights the node supports.
    pub access: u8,
}

/// One directory entry as returned by iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub node_type: VfsNodeType,
}

/// Driver-specific node behaviour.
///
/// The default method bodies report `NotSupported`, so a driver
/// implements only what its node type actually carries.
pub trait NodeOps: Send + Sync {
    /// Read into `buffer` at `offset`, clipped to the content size.
    fn read(&self, _offset: u64, _buffer: &mut [u8]) -> OsResult<usize> {
        Err(OsStatus::NotSupported)
    }

    /// Write `data` at `offset`, extending the content when needed.
    fn write(&self, _offset: u64, _data: &[u8]) -> OsResult<usize> {
        Err(OsStatus::NotSupported)
    }

    /// Cut or extend the content to exactly `size` bytes.
    fn truncate(&self, _size: u64) -> OsResult {
        Err(OsStatus::NotSupported)
    }

    fn stat(&self) -> OsResult<NodeStat>;

    /// The folder mixin, for folder nodes.
    fn folder(&self) -> Option<&FolderMixin> {
        None
    }

    /// Extra device interfaces beyond the closed core table.
    fn device_interfaces(&self) -> &[OsGuid] {
        &[]
    }

    /// Mint the handle state for a device interface from
    /// [`device_interfaces`](Self::device_interfaces).
    fn query_device(&self, _guid: OsGuid, _data: &[u8]) -> OsResult<()> {
        Err(OsStatus::InterfaceNotSupported)
    }
}

/// Mounted filesystem instance.
pub trait VfsMount: Send + Sync {
    fn driver_name(&self) -> &'static str;

    /// The mount's root folder node.
    fn root(&self) -> OsResult<RcuShared<Node>>;

    /// Create a file node (not yet linked into a folder).
    fn create_file(&self, _name: &str) -> OsResult<RcuShared<Node>> {
        Err(OsStatus::NotSupported)
    }

    /// Create a folder node (not yet linked into a folder).
    fn create_folder(&self, _name: &str) -> OsResult<RcuShared<Node>> {
        Err(OsStatus::NotSupported)
    }
}

/// Filesystem driver: names itself and creates mounts.
pub trait VfsDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create a mount with no parameters; drivers needing media reject
    /// this and are mounted through their parameterised constructor.
    fn mount(&self) -> OsResult<Arc<dyn VfsMount>> {
        Err(OsStatus::NotSupported)
    }
}

/// A node in the graph.
pub struct Node {
    name: String,
    node_type: VfsNodeType,
    /// Weak back edge; the strong edges run parent to child.
    parent: Mutex<Option<RcuWeak<Node>>>,
    /// The owning mount, weakly: the VFS mount table keeps it alive.
    mount: Mutex<Weak<dyn VfsMount>>,
    /// Rights the node supports at most.
    access: NodeAccess,
    ops: Box<dyn NodeOps>,
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("node_type", &self.node_type)
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Build and publish a node.
    pub fn new(
        name: String,
        node_type: VfsNodeType,
        access: NodeAccess,
        ops: Box<dyn NodeOps>,
    ) -> RcuShared<Node> {
        // Nodes start detached; the dangling weak is replaced by init.
        let detached: Weak<dyn VfsMount> = Weak::<super::ramfs::RamFsMount>::new();
        RcuShared::new(
            kernel_domain(),
            Node {
                name,
                node_type,
                parent: Mutex::new(None),
                mount: Mutex::new(detached),
                access,
                ops,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_type(&self) -> VfsNodeType {
        self.node_type
    }

    pub fn access(&self) -> NodeAccess {
        self.access
    }

    pub fn ops(&self) -> &dyn NodeOps {
        &*self.ops
    }

    pub fn folder(&self) -> OsResult<&FolderMixin> {
        self.ops.folder().ok_or(OsStatus::InvalidType)
    }

    pub fn is_folder(&self) -> bool {
        self.ops.folder().is_some()
    }

    /// Attach to a parent and mount when linked into the tree.
    pub fn init(&self, parent: Option<RcuWeak<Node>>, mount: Weak<dyn VfsMount>) {
        *self.parent.lock() = parent;
        *self.mount.lock() = mount;
    }

    pub fn parent(&self) -> Option<RcuShared<Node>> {
        self.parent.lock().as_ref().and_then(RcuWeak::upgrade)
    }

    pub fn mount(&self) -> OsResult<Arc<dyn VfsMount>> {
        self.mount.lock().upgrade().ok_or(OsStatus::NotAvailable)
    }

    pub fn driver_name(&self) -> &'static str {
        self.mount
            .lock()
            .upgrade()
            .map(|mount| mount.driver_name())
            .unwrap_or("detached")
    }
}

/// Children map and iterator-invalidation generation of a folder.
pub struct FolderMixin {
    entries: RwLock<FolderEntries>,
}

struct FolderEntries {
    children: BTreeMap<String, RcuShared<Node>>,
    generation: u64,
}

impl FolderMixin {
    pub fn new() -> FolderMixin {
        FolderMixin {
            entries: RwLock::new(FolderEntries {
                children: BTreeMap::new(),
                generation: 0,
            }),
        }
    }

    /// Snapshot lookup under the shared lock.
    pub fn lookup(&self, name: &str) -> Option<RcuShared<Node>> {
        let _guard = RcuGuard::new(kernel_domain());
        self.entries.read().children.get(name).cloned()
    }

    /// Link a child. Structural change: exclusive lock, bumps the
    /// generation.
    pub fn insert(&self, name: &str, node: RcuShared<Node>) -> OsResult {
        let mut entries = self.entries.write();
        if entries.children.contains_key(name) {
            return Err(OsStatus::AlreadyExists);
        }
        entries.children.insert(String::from(name), node);
        entries.generation += 1;
        Ok(())
    }

    /// Unlink a child. Structural change: exclusive lock, bumps the
    /// generation.
    pub fn remove(&self, name: &str) -> OsResult<RcuShared<Node>> {
        let mut entries = self.entries.write();
        let node = entries.children.remove(name).ok_or(OsStatus::NotFound)?;
        entries.generation += 1;
        Ok(node)
    }

    pub fn generation(&self) -> u64 {
        self.entries.read().generation
    }

    pub fn count(&self) -> usize {
        self.entries.read().children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().children.is_empty()
    }

    /// The first entry ordered after `cursor` (exclusive), or the first
    /// entry overall when `cursor` is `None`.
    pub fn next_after(&self, cursor: Option<&str>) -> Option<(String, RcuShared<Node>)> {
        let _guard = RcuGuard::new(kernel_domain());
        let entries = self.entries.read();
        let mut range = match cursor {
            Some(cursor) => entries
                .children
                .range::<str, _>((core::ops::Bound::Excluded(cursor), core::ops::Bound::Unbounded)),
            None => entries.children.range::<str, _>(..),
        };
        range
            .next()
            .map(|(name, node)| (name.clone(), node.clone()))
    }

    /// Names of every child, for diagnostics and tests.
    pub fn child_names(&self) -> Vec<String> {
        self.entries.read().children.keys().cloned().collect()
    }
}

impl Default for FolderMixin {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------
// Handles and the interface table
// ---------------------------------------------------------------------

/// Directory iterator position.
#[derive(Debug)]
struct DirIterState {
    generation: u64,
    cursor: Option<String>,
}

/// Interface-specific handle state.
#[derive(Debug)]
enum HandleState {
    File { offset: Mutex<u64> },
    Folder,
    Iterator { state: Mutex<DirIterState> },
    Identify,
    Device,
}

/// Seek origins for [`VfsHandle::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    Absolute,
    Relative,
    End,
}

impl SeekMode {
    pub fn from_raw(raw: u64) -> OsResult<SeekMode> {
        match raw {
            0 => Ok(SeekMode::Absolute),
            1 => Ok(SeekMode::Relative),
            2 => Ok(SeekMode::End),
            _ => Err(OsStatus::InvalidInput),
        }
    }
}

/// Identify payload: the node's own name and its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyInfo {
    pub name: String,
    pub driver: &'static str,
    pub node_type: VfsNodeType,
}

/// A minted handle: node, granted rights, and the interface it answers.
#[derive(Debug)]
pub struct VfsHandle {
    node: RcuShared<Node>,
    access: NodeAccess,
    interface: OsGuid,
    state: HandleState,
}

/// One row of the closed interface table.
pub struct InterfaceEntry {
    pub guid: OsGuid,
    factory: fn(&RcuShared<Node>, NodeAccess) -> OsResult<HandleState>,
}

/// The closed table of core interfaces. Device interfaces extend it
/// through [`NodeOps::device_interfaces`].
static INTERFACE_TABLE: &[InterfaceEntry] = &[
    InterfaceEntry {
        guid: OS_FILE_GUID,
        factory: |node, _access| {
            if node.node_type() != VfsNodeType::File {
                return Err(OsStatus::InvalidType);
            }
            Ok(HandleState::File {
                offset: Mutex::new(0),
            })
        },
    },
    InterfaceEntry {
        guid: OS_FOLDER_GUID,
        factory: |node, _access| {
            node.folder()?;
            Ok(HandleState::Folder)
        },
    },
    InterfaceEntry {
        guid: OS_ITERATOR_GUID,
        factory: |node, _access| {
            let folder = node.folder()?;
            Ok(HandleState::Iterator {
                state: Mutex::new(DirIterState {
                    generation: folder.generation(),
                    cursor: None,
                }),
            })
        },
    },
    InterfaceEntry {
        guid: OS_IDENTIFY_GUID,
        factory: |_node, _access| Ok(HandleState::Identify),
    },
];

/// Mint a handle for `guid` against `node`.
///
/// Unknown GUIDs are offered to the node's device interfaces before
/// failing with `InterfaceNotSupported`. Requested access beyond what
/// the node supports is `AccessDenied`.
pub fn query(
    node: &RcuShared<Node>,
    guid: OsGuid,
    access: NodeAccess,
    data: &[u8],
) -> OsResult<Arc<VfsHandle>> {
    if !node.access().contains(access) {
        return Err(OsStatus::AccessDenied);
    }

    for entry in INTERFACE_TABLE {
        if entry.guid == guid {
            let state = (entry.factory)(node, access)?;
            return Ok(Arc::new(VfsHandle {
                node: node.clone(),
                access,
                interface: guid,
                state,
            }));
        }
    }

    if node.ops().device_interfaces().contains(&guid) {
        node.ops().query_device(guid, data)?;
        return Ok(Arc::new(VfsHandle {
            node: node.clone(),
            access,
            interface: guid,
            state: HandleState::Device,
        }));
    }

    Err(OsStatus::InterfaceNotSupported)
}

/// All interfaces `node` answers, core table first.
pub fn list_interfaces(node: &RcuShared<Node>) -> Vec<OsGuid> {
    let mut interfaces = Vec::new();
    for entry in INTERFACE_TABLE {
        if (entry.factory)(node, NodeAccess::empty()).is_ok() {
            interfaces.push(entry.guid);
        }
    }
    interfaces.extend_from_slice(node.ops().device_interfaces());
    interfaces
}

impl VfsHandle {
    pub fn node(&self) -> &RcuShared<Node> {
        &self.node
    }

    pub fn access(&self) -> NodeAccess {
        self.access
    }

    pub fn interface(&self) -> OsGuid {
        self.interface
    }

    fn file_offset(&self) -> OsResult<&Mutex<u64>> {
        match &self.state {
            HandleState::File { offset } => Ok(offset),
            _ => Err(OsStatus::FunctionNotSupported),
        }
    }

    /// Read at the handle cursor, advancing it. Device streams carry no
    /// cursor and read from the live end instead.
    pub fn read(&self, buffer: &mut [u8]) -> OsResult<usize> {
        if !self.access.contains(NodeAccess::READ) {
            return Err(OsStatus::AccessDenied);
        }

        match &self.state {
            HandleState::File { offset } => {
                let mut position = offset.lock();
                let read = self.node.ops().read(*position, buffer)?;
                *position += read as u64;
                Ok(read)
            }
            HandleState::Device => self.node.ops().read(0, buffer),
            _ => Err(OsStatus::FunctionNotSupported),
        }
    }

    /// Write at the handle cursor, advancing it. Device streams append
    /// at the live end.
    pub fn write(&self, data: &[u8]) -> OsResult<usize> {
        if !self.access.contains(NodeAccess::WRITE) {
            return Err(OsStatus::AccessDenied);
        }

        match &self.state {
            HandleState::File { offset } => {
                let mut position = offset.lock();
                let written = self.node.ops().write(*position, data)?;
                *position += written as u64;
                Ok(written)
            }
            HandleState::Device => self.node.ops().write(0, data),
            _ => Err(OsStatus::FunctionNotSupported),
        }
    }

    /// Move the handle cursor; returns the new absolute position.
    ///
    /// A device stream has no position to move: the resource refuses
    /// with `NotSupported` rather than faking one.
    pub fn seek(&self, mode: SeekMode, delta: i64) -> OsResult<u64> {
        if matches!(self.state, HandleState::Device) {
            return Err(OsStatus::NotSupported);
        }

        let offset = self.file_offset()?;
        let mut position = offset.lock();

        let base = match mode {
            SeekMode::Absolute => 0,
            SeekMode::Relative => *position as i64,
            SeekMode::End => self.node.ops().stat()?.logical as i64,
        };
        let target = base.checked_add(delta).ok_or(OsStatus::InvalidSpan)?;
        if target < 0 {
            return Err(OsStatus::OutOfBounds);
        }

        *position = target as u64;
        Ok(*position)
    }

    pub fn stat(&self) -> OsResult<NodeStat> {
        self.node.ops().stat()
    }

    /// Produce the next directory entry.
    ///
    /// A structural change to the folder after the iterator was minted
    /// invalidates it: the stored generation no longer matches and the
    /// iterator reports `InvalidData`.
    pub fn next_entry(&self) -> OsResult<DirEntry> {
        let HandleState::Iterator { state } = &self.state else {
            return Err(OsStatus::FunctionNotSupported);
        };

        let folder = self.node.folder()?;
        let mut state = state.lock();

        if folder.generation() != state.generation {
            return Err(OsStatus::InvalidData);
        }

        let Some((name, child)) = folder.next_after(state.cursor.as_deref()) else {
            return Err(OsStatus::Completed);
        };

        state.cursor = Some(name.clone());
        Ok(DirEntry {
            name,
            node_type: child.node_type(),
        })
    }

    /// Identify payload for [`OS_IDENTIFY_GUID`] handles.
    pub fn identify(&self) -> OsResult<IdentifyInfo> {
        if !matches!(self.state, HandleState::Identify) {
            return Err(OsStatus::FunctionNotSupported);
        }

        Ok(IdentifyInfo {
            name: String::from(self.node.name()),
            driver: self.node.driver_name(),
            node_type: self.node.node_type(),
        })
    }

    /// Enumerate the node's interfaces into `buffer`. Returns the
    /// number available; `MoreData` when the buffer was too small, with
    /// the prefix filled in.
    pub fn interfaces(&self, buffer: &mut [OsGuid]) -> OsResult<usize> {
        if !matches!(self.state, HandleState::Identify) {
            return Err(OsStatus::FunctionNotSupported);
        }

        let all = list_interfaces(&self.node);
        let take = all.len().min(buffer.len());
        buffer[..take].copy_from_slice(&all[..take]);

        if take < all.len() {
            return Err(OsStatus::MoreData);
        }
        Ok(all.len())
    }
}
