//! Read-only tar filesystem.
//!
//! Parses a POSIX.1-1988 ustar image from a block device at mount time
//! into a `path → (header, offset)` map and materialises the node tree
//! from it. File reads go straight to the device; nothing is cached and
//! the archive is never modified.
//!
//! Type flags map as `'0'` → file and `'5'` → folder; every other entry
//! kind is ignored. Tar's `/` separator is translated to the VFS `\0`
//! separator on the way in.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};

use super::blockdev::BlockDevice;
use super::node::{
    FolderMixin, Node, NodeAccess, NodeOps, NodeStat, VfsDriver, VfsMount, VfsNodeType,
};
use super::path::VfsPath;
use crate::error::{OsResult, OsStatus};
use crate::sync::RcuShared;

/// Tar block granularity; headers and data are padded to this.
pub const TAR_BLOCK_SIZE: usize = 512;

/// Size of the meaningful header prefix.
pub const TAR_HEADER_SIZE: usize = 500;

const NAME_LEN: usize = 100;
const PREFIX_LEN: usize = 155;

/// Parse a bounded octal ASCII field, stopping at the first non-digit.
fn tar_number(field: &[u8]) -> u64 {
    let mut value = 0u64;
    for &byte in field {
        if !(b'0'..=b'7').contains(&byte) {
            break;
        }
        value = value * 8 + (byte - b'0') as u64;
    }
    value
}

fn field_str(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).unwrap_or("")
}

/// The 500-byte ustar header.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TarPosixHeader {
    pub name: [u8; NAME_LEN],
    pub mode: [u8; 8],
    pub uid: [u8; 8],
    pub gid: [u8; 8],
    pub size: [u8; 12],
    pub mtime: [u8; 12],
    pub checksum: [u8; 8],
    pub typeflag: u8,
    pub linkname: [u8; 100],
    pub magic: [u8; 6],
    pub version: [u8; 2],
    pub uname: [u8; 32],
    pub gname: [u8; 32],
    pub devmajor: [u8; 8],
    pub devminor: [u8; 8],
    pub prefix: [u8; PREFIX_LEN],
}

const _: () = assert!(core::mem::size_of::<TarPosixHeader>() == TAR_HEADER_SIZE);

impl TarPosixHeader {
    /// Reinterpret the front of a 512-byte block.
    pub fn from_block(block: &[u8; TAR_BLOCK_SIZE]) -> TarPosixHeader {
        // SAFETY: the header is plain bytes and fits in the block.
        unsafe { core::ptr::read_unaligned(block.as_ptr() as *const TarPosixHeader) }
    }

    pub fn size(&self) -> u64 {
        tar_number(&self.size)
    }

    pub fn reported_checksum(&self) -> u64 {
        tar_number(&self.checksum)
    }

    /// Sum of all header bytes with the checksum field read as eight
    /// ASCII spaces.
    pub fn actual_checksum(&self) -> u64 {
        let mut total = 0u64;

        let mut sum = |bytes: &[u8]| {
            for &byte in bytes {
                total += byte as u64;
            }
        };

        sum(&self.name);
        sum(&self.mode);
        sum(&self.uid);
        sum(&self.gid);
        sum(&self.size);
        sum(&self.mtime);
        sum(&[b' '; 8]);
        sum(&[self.typeflag]);
        sum(&self.linkname);
        sum(&self.magic);
        sum(&self.version);
        sum(&self.uname);
        sum(&self.gname);
        sum(&self.devmajor);
        sum(&self.devminor);
        sum(&self.prefix);

        total
    }

    pub fn node_type(&self) -> Option<VfsNodeType> {
        match self.typeflag {
            b'0' => Some(VfsNodeType::File),
            b'5' => Some(VfsNodeType::Folder),
            _ => None,
        }
    }

    pub fn is_ustar(&self) -> bool {
        self.magic.starts_with(b"ustar")
    }

    /// Translate the tar path (`prefix/name`, `/`-separated) into a
    /// [`VfsPath`].
    pub fn vfs_path(&self) -> OsResult<VfsPath> {
        let name = field_str(&self.name);
        let prefix = field_str(&self.prefix);

        let mut joined = String::new();
        if !prefix.is_empty() {
            joined.push_str(prefix);
            joined.push('/');
        }
        joined.push_str(name);

        let trimmed = joined.trim_matches('/');
        let mut path = VfsPath::root();
        for segment in trimmed.split('/').filter(|s| !s.is_empty()) {
            path = path.join(segment)?;
        }
        Ok(path)
    }
}

/// Mount-time options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarParseOptions {
    /// Accept headers whose checksum does not verify.
    pub ignore_checksum: bool,
}

/// One archive member.
#[derive(Debug, Clone)]
pub struct TarEntry {
    pub header: TarPosixHeader,
    /// Byte offset of the member's data within the device.
    pub offset: u64,
}

/// Parse the archive's member table.
///
/// Stops at the end-of-archive marker (a zero block) or the end of the
/// device. Non-ustar blocks are skipped; checksum failures are
/// `ChecksumError` unless `ignore_checksum` is set.
pub fn parse_tar(
    media: &dyn BlockDevice,
    options: TarParseOptions,
) -> OsResult<BTreeMap<VfsPath, TarEntry>> {
    let mut entries = BTreeMap::new();
    let mut offset = 0u64;
    let size = media.size();

    while offset + TAR_BLOCK_SIZE as u64 <= size {
        let mut block = [0u8; TAR_BLOCK_SIZE];
        media.read_at(offset, &mut block)?;
        offset += TAR_BLOCK_SIZE as u64;

        if block.iter().all(|&byte| byte == 0) {
            break;
        }

        let header = TarPosixHeader::from_block(&block);
        if !header.is_ustar() {
            continue;
        }

        if !options.ignore_checksum && header.actual_checksum() != header.reported_checksum() {
            return Err(OsStatus::ChecksumError);
        }

        let data_blocks = (header.size() as usize).div_ceil(TAR_BLOCK_SIZE) as u64;
        let data_offset = offset;
        offset += data_blocks * TAR_BLOCK_SIZE as u64;

        if header.node_type().is_none() {
            continue;
        }

        let path = header.vfs_path()?;
        if path.is_root() {
            continue;
        }

        entries.insert(
            path,
            TarEntry {
                header,
                offset: data_offset,
            },
        );
    }

    Ok(entries)
}

/// A file member: reads clip to the member size and go to the device.
struct TarFile {
    media: Arc<dyn BlockDevice>,
    offset: u64,
    size: u64,
}

impl NodeOps for TarFile {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> OsResult<usize> {
        if offset >= self.size {
            return Ok(0);
        }

        let take = buffer.len().min((self.size - offset) as usize);
        self.media.read_at(self.offset + offset, &mut buffer[..take])?;
        Ok(take)
    }

    fn stat(&self) -> OsResult<NodeStat> {
        Ok(NodeStat {
            logical: self.size,
            block_size: TAR_BLOCK_SIZE as u64,
            blocks: self.size.div_ceil(TAR_BLOCK_SIZE as u64),
            access: NodeAccess::R.bits(),
        })
    }
}

/// A folder member (or an intermediate path component).
struct TarFolder {
    mixin: FolderMixin,
}

impl NodeOps for TarFolder {
    fn stat(&self) -> OsResult<NodeStat> {
        Ok(NodeStat {
            logical: self.mixin.count() as u64,
            block_size: TAR_BLOCK_SIZE as u64,
            blocks: 0,
            access: NodeAccess::R.bits(),
        })
    }

    fn folder(&self) -> Option<&FolderMixin> {
        Some(&self.mixin)
    }
}

/// One mounted archive.
pub struct TarFsMount {
    root: RcuShared<Node>,
}

impl TarFsMount {
    fn make_folder(name: &str) -> RcuShared<Node> {
        Node::new(
            String::from(name),
            VfsNodeType::Folder,
            NodeAccess::R,
            Box::new(TarFolder {
                mixin: FolderMixin::new(),
            }),
        )
    }

    /// Walk to the folder for `path`'s parent, creating intermediate
    /// folders for path components the archive never listed.
    fn ensure_parent(
        root: &RcuShared<Node>,
        mount: &Weak<dyn VfsMount>,
        path: &VfsPath,
    ) -> OsResult<RcuShared<Node>> {
        let mut current = root.clone();
        let segments: alloc::vec::Vec<&str> = path.segments().collect();

        for segment in &segments[..segments.len().saturating_sub(1)] {
            let next = {
                let folder = current.folder()?;
                match folder.lookup(segment) {
                    Some(child) => child,
                    None => {
                        let fresh = Self::make_folder(segment);
                        fresh.init(Some(current.downgrade()), mount.clone());
                        folder.insert(segment, fresh.clone())?;
                        fresh
                    }
                }
            };
            current = next;
        }

        Ok(current)
    }
}

impl VfsMount for TarFsMount {
    fn driver_name(&self) -> &'static str {
        "tarfs"
    }

    fn root(&self) -> OsResult<RcuShared<Node>> {
        Ok(self.root.clone())
    }
}

/// The tarfs driver singleton.
pub struct TarFs;

impl TarFs {
    pub fn instance() -> &'static TarFs {
        static INSTANCE: TarFs = TarFs;
        &INSTANCE
    }

    /// Create a mount over `media`, parsing the whole member table up
    /// front.
    pub fn create_mount(
        &self,
        media: Arc<dyn BlockDevice>,
        options: TarParseOptions,
    ) -> OsResult<Arc<dyn VfsMount>> {
        let entries = parse_tar(&*media, options)?;

        let mut error = None;
        let mount = Arc::new_cyclic(|weak: &Weak<TarFsMount>| {
            let mount_ref: Weak<dyn VfsMount> = weak.clone();
            let root = TarFsMount::make_folder("");
            root.init(None, mount_ref.clone());

            // BTreeMap order guarantees parents sort before children,
            // but entries may skip levels; ensure_parent fills gaps.
            for (path, entry) in &entries {
                let result = (|| -> OsResult {
                    let parent = TarFsMount::ensure_parent(&root, &mount_ref, path)?;
                    let folder = parent.folder()?;
                    let name = path.name();

                    if folder.lookup(name).is_some() {
                        // Listed after being created as an intermediate.
                        return Ok(());
                    }

                    let node = match entry.header.node_type() {
                        Some(VfsNodeType::Folder) => TarFsMount::make_folder(name),
                        Some(VfsNodeType::File) => Node::new(
                            String::from(name),
                            VfsNodeType::File,
                            NodeAccess::R,
                            Box::new(TarFile {
                                media: media.clone(),
                                offset: entry.offset,
                                size: entry.header.size(),
                            }),
                        ),
                        _ => return Ok(()),
                    };
                    node.init(Some(parent.downgrade()), mount_ref.clone());
                    folder.insert(name, node)
                })();

                if let Err(status) = result {
                    error.get_or_insert(status);
                }
            }

            TarFsMount { root }
        });

        match error {
            Some(status) => Err(status),
            None => Ok(mount),
        }
    }
}

impl VfsDriver for TarFs {
    fn name(&self) -> &'static str {
        "tarfs"
    }

    // A parameterless mount has no media to parse.
}

#[cfg(all(test, not(target_os = "none")))]
pub mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::fs::blockdev::MemoryBlockDevice;

    /// Build a ustar header block for tests.
    pub fn make_header(name: &str, size: u64, typeflag: u8) -> [u8; TAR_BLOCK_SIZE] {
        let mut block = [0u8; TAR_BLOCK_SIZE];

        let name_bytes = name.as_bytes();
        block[..name_bytes.len().min(NAME_LEN)]
            .copy_from_slice(&name_bytes[..name_bytes.len().min(NAME_LEN)]);

        block[100..108].copy_from_slice(b"0000644\0");
        let size_field = alloc::format!("{:011o}\0", size);
        block[124..136].copy_from_slice(size_field.as_bytes());
        block[136..148].copy_from_slice(b"00000000000\0");
        block[156] = typeflag;
        block[257..263].copy_from_slice(b"ustar\0");
        block[263..265].copy_from_slice(b"00");

        // Checksum with the field as spaces, then patch it in.
        block[148..156].copy_from_slice(b"        ");
        let checksum: u64 = block.iter().map(|&b| b as u64).sum();
        let checksum_field = alloc::format!("{:06o}\0 ", checksum);
        block[148..156].copy_from_slice(&checksum_field.as_bytes()[..8]);

        block
    }

    /// Assemble an archive from (name, typeflag, data) members.
    pub fn build_archive(members: &[(&str, u8, &[u8])]) -> Vec<u8> {
        let mut archive = Vec::new();
        for &(name, typeflag, data) in members {
            archive.extend_from_slice(&make_header(name, data.len() as u64, typeflag));
            archive.extend_from_slice(data);
            let pad = data.len().next_multiple_of(TAR_BLOCK_SIZE) - data.len();
            archive.extend(core::iter::repeat(0).take(pad));
        }
        archive.extend(core::iter::repeat(0).take(2 * TAR_BLOCK_SIZE));
        archive
    }

    #[test]
    fn checksum_of_a_blank_header() {
        // All fields zero, checksum treated as eight spaces.
        let header = TarPosixHeader::from_block(&[0u8; TAR_BLOCK_SIZE]);
        assert_eq!(header.actual_checksum(), 8 * 0x20);

        let mut block = [0u8; TAR_BLOCK_SIZE];
        block[156] = b'0';
        let header = TarPosixHeader::from_block(&block);
        assert_eq!(header.actual_checksum(), 8 * 0x20 + 0x30);
    }

    #[test]
    fn octal_fields_parse() {
        assert_eq!(tar_number(b"0000644\0"), 0o644);
        assert_eq!(tar_number(b"00000000013\0"), 11);
        assert_eq!(tar_number(b"\0\0\0"), 0);
        assert_eq!(tar_number(b"12x4"), 0o12);
    }

    #[test]
    fn tar_paths_translate_separators() {
        let block = make_header("usr/share/doc/", 0, b'5');
        let header = TarPosixHeader::from_block(&block);
        let path = header.vfs_path().unwrap();
        assert_eq!(path.as_str(), "usr\0share\0doc");
    }

    #[test]
    fn parse_collects_files_and_folders() {
        let archive = build_archive(&[
            ("boot/", b'5', b""),
            ("boot/init", b'0', b"#!init\n"),
            ("boot/link", b'2', b""),
        ]);
        let media = MemoryBlockDevice::new(archive);

        let entries = parse_tar(&*media, TarParseOptions::default()).unwrap();
        assert_eq!(entries.len(), 2, "symlink member is ignored");
        assert!(entries.contains_key(&VfsPath::new("boot").unwrap()));
        assert!(entries.contains_key(&VfsPath::new("boot\0init").unwrap()));
    }

    #[test]
    fn corrupt_checksum_is_rejected_unless_ignored() {
        let mut archive = build_archive(&[("file", b'0', b"data")]);
        archive[148] = b'7';

        let media = MemoryBlockDevice::new(archive);
        assert_eq!(
            parse_tar(&*media, TarParseOptions::default()).unwrap_err(),
            OsStatus::ChecksumError
        );

        let relaxed = TarParseOptions {
            ignore_checksum: true,
        };
        assert_eq!(parse_tar(&*media, relaxed).unwrap().len(), 1);
    }

    #[test]
    fn mounted_archive_reads_files() {
        let archive = build_archive(&[
            ("etc/", b'5', b""),
            ("etc/motd", b'0', b"hello from tar\n"),
            ("deep/nested/file", b'0', b"x"),
        ]);
        let media = MemoryBlockDevice::new(archive);

        let mount = TarFs::instance()
            .create_mount(media, TarParseOptions::default())
            .unwrap();
        let root = mount.root().unwrap();

        let etc = root.folder().unwrap().lookup("etc").unwrap();
        let motd = etc.folder().unwrap().lookup("motd").unwrap();

        let mut buffer = [0u8; 64];
        let read = motd.ops().read(0, &mut buffer).unwrap();
        assert_eq!(&buffer[..read], b"hello from tar\n");

        // Intermediate folders materialise even when unlisted.
        let deep = root.folder().unwrap().lookup("deep").unwrap();
        let nested = deep.folder().unwrap().lookup("nested").unwrap();
        assert!(nested.folder().unwrap().lookup("file").is_some());

        // The archive is read-only.
        assert_eq!(
            motd.ops().write(0, b"nope").unwrap_err(),
            OsStatus::NotSupported
        );
    }
}
