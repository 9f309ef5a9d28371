//! File and directory system calls.

use alloc::vec;

use super::CallContext;
use crate::error::{OsResult, OsStatus};
use crate::fs::{self, vfs_root, NodeAccess, SeekMode, VfsNodeType};
use crate::object::{HandleAccess, HandleType, ObjectRef};

// Access bits of OsFileOpenMode.
const OPEN_READ: u64 = 1 << 0;
const OPEN_WRITE: u64 = 1 << 1;
const OPEN_APPEND: u64 = 1 << 2;
const OPEN_TRUNCATE: u64 = 1 << 3;

// Creation disposition in bits 8-15.
const CREATE_ALWAYS: u64 = 1;
const OPEN_EXISTING: u64 = 2;
const OPEN_ALWAYS: u64 = 3;

/// 0x10: open or create a file and mint a node handle.
pub fn file_open(call: &CallContext, arg0: u64, arg1: u64, arg2: u64, _arg3: u64) -> OsResult<u64> {
    let path = call.read_path(arg0, arg1)?;
    let mode = arg2;

    if mode >> 16 != 0 {
        return Err(OsStatus::InvalidInput);
    }

    // Append and truncate imply write access.
    let wants_write = mode & (OPEN_WRITE | OPEN_APPEND | OPEN_TRUNCATE) != 0;
    let mut access = NodeAccess::empty();
    if mode & OPEN_READ != 0 {
        access |= NodeAccess::READ;
    }
    if wants_write {
        access |= NodeAccess::WRITE;
    }
    if access.is_empty() {
        return Err(OsStatus::InvalidInput);
    }

    let creation = (mode >> 8) & 0xff;
    let vfs = vfs_root();

    let node = match vfs.lookup(&path) {
        Ok(existing) => match creation {
            CREATE_ALWAYS => {
                existing.ops().truncate(0)?;
                existing
            }
            OPEN_EXISTING | OPEN_ALWAYS | 0 => existing,
            _ => return Err(OsStatus::InvalidInput),
        },
        Err(OsStatus::NotFound) => match creation {
            CREATE_ALWAYS | OPEN_ALWAYS => vfs.create(&path)?,
            OPEN_EXISTING | 0 => return Err(OsStatus::NotFound),
            _ => return Err(OsStatus::InvalidInput),
        },
        Err(status) => return Err(status),
    };

    if node.node_type() != VfsNodeType::File {
        return Err(OsStatus::InvalidType);
    }

    let handle = fs::query(&node, fs::OS_FILE_GUID, access, &[])?;

    if mode & OPEN_TRUNCATE != 0 && creation != CREATE_ALWAYS {
        node.ops().truncate(0)?;
    }
    if mode & OPEN_APPEND != 0 {
        handle.seek(SeekMode::End, 0)?;
    }

    let mut rights = HandleAccess::STAT;
    if access.contains(NodeAccess::READ) {
        rights |= HandleAccess::READ;
    }
    if access.contains(NodeAccess::WRITE) {
        rights |= HandleAccess::WRITE;
    }

    let minted = call
        .process
        .handles()
        .insert(ObjectRef::Node(handle), rights);
    Ok(minted.raw())
}

/// 0x11: close a node handle.
pub fn file_close(call: &CallContext, arg0: u64, _arg1: u64, _arg2: u64, _arg3: u64) -> OsResult<u64> {
    let handle = crate::object::OsHandle(arg0);
    call.process
        .handles()
        .get_typed(handle, HandleType::Node)?;
    call.process.handles().close(handle)?;
    Ok(0)
}

/// The file calls accept plain node handles and device stream handles;
/// everything else is a type error.
fn file_handle(
    call: &CallContext,
    raw: u64,
) -> OsResult<alloc::sync::Arc<crate::fs::VfsHandle>> {
    let entry = call.process.handles().get(crate::object::OsHandle(raw))?;
    match &entry.object {
        ObjectRef::Node(handle) | ObjectRef::Device(handle) => Ok(handle.clone()),
        _ => Err(OsStatus::InvalidType),
    }
}

/// 0x12: read from the handle cursor into `[arg1, arg2)`.
pub fn file_read(call: &CallContext, arg0: u64, arg1: u64, arg2: u64, _arg3: u64) -> OsResult<u64> {
    let handle = file_handle(call, arg0)?;

    if arg2 < arg1 {
        return Err(OsStatus::InvalidSpan);
    }
    let length = ((arg2 - arg1) as usize).min(super::MAX_STAGED_COPY);
    if length == 0 {
        return Ok(0);
    }

    let mut buffer = vec![0u8; length];
    let read = handle.read(&mut buffer)?;
    if read == 0 {
        return Err(OsStatus::EndOfFile);
    }

    call.copy_to_user(arg1, &buffer[..read])?;
    Ok(read as u64)
}

/// 0x13: write `[arg1, arg2)` at the handle cursor.
pub fn file_write(call: &CallContext, arg0: u64, arg1: u64, arg2: u64, _arg3: u64) -> OsResult<u64> {
    let handle = file_handle(call, arg0)?;
    let payload = call.copy_from_user(arg1, arg2)?;
    let written = handle.write(&payload)?;
    Ok(written as u64)
}

/// 0x14: move the handle cursor.
pub fn file_seek(call: &CallContext, arg0: u64, arg1: u64, arg2: u64, _arg3: u64) -> OsResult<u64> {
    let handle = file_handle(call, arg0)?;
    let mode = SeekMode::from_raw(arg1)?;
    handle.seek(mode, arg2 as i64)
}

/// Wire layout of FileStat output.
#[repr(C)]
#[derive(Clone, Copy)]
struct OsFileStat {
    logical: u64,
    block_size: u64,
    blocks: u64,
    access: u64,
}

/// 0x15: stat the node behind a handle.
pub fn file_stat(call: &CallContext, arg0: u64, arg1: u64, _arg2: u64, _arg3: u64) -> OsResult<u64> {
    let handle = file_handle(call, arg0)?;
    let stat = handle.stat()?;

    let wire = OsFileStat {
        logical: stat.logical,
        block_size: stat.block_size,
        blocks: stat.blocks,
        access: stat.access as u64,
    };
    // SAFETY: plain repr(C) integers, no padding.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &wire as *const OsFileStat as *const u8,
            core::mem::size_of::<OsFileStat>(),
        )
    };
    call.copy_to_user(arg1, bytes)?;
    Ok(0)
}

/// 0x20: open a directory iterator over `[arg0, arg1)`.
pub fn dir_iter(call: &CallContext, arg0: u64, arg1: u64, _arg2: u64, _arg3: u64) -> OsResult<u64> {
    let path = call.read_path(arg0, arg1)?;
    let iterator = vfs_root().opendir(&path)?;

    let minted = call
        .process
        .handles()
        .insert(ObjectRef::Node(iterator), HandleAccess::READ);
    Ok(minted.raw())
}

/// Wire layout of one directory entry.
#[repr(C)]
#[derive(Clone, Copy)]
struct OsDirEntry {
    kind: u32,
    name_len: u32,
    name: [u8; 248],
}

/// 0x21: produce the next directory entry into `arg1`.
pub fn dir_next(call: &CallContext, arg0: u64, arg1: u64, _arg2: u64, _arg3: u64) -> OsResult<u64> {
    let entry = call
        .process
        .handles()
        .get_typed(crate::object::OsHandle(arg0), HandleType::Node)?;
    let ObjectRef::Node(iterator) = &entry.object else {
        return Err(OsStatus::InvalidType);
    };

    let item = iterator.next_entry()?;

    let mut wire = OsDirEntry {
        kind: match item.node_type {
            VfsNodeType::File => 0,
            VfsNodeType::Folder => 1,
            VfsNodeType::Link => 2,
        },
        name_len: 0,
        name: [0; 248],
    };
    let name = item.name.as_bytes();
    if name.len() > wire.name.len() {
        return Err(OsStatus::MoreData);
    }
    wire.name[..name.len()].copy_from_slice(name);
    wire.name_len = name.len() as u32;

    // SAFETY: plain repr(C) integers and bytes, no padding.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &wire as *const OsDirEntry as *const u8,
            core::mem::size_of::<OsDirEntry>(),
        )
    };
    call.copy_to_user(arg1, bytes)?;
    Ok(0)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::tests::{invoke, with_kernel_context, CONTEXT_LOCK};
    use super::super::{OsCallResult, SyscallFunction};
    use super::*;
    use crate::fs::VfsPath;

    fn path_args(text: &str) -> (u64, u64) {
        (text.as_ptr() as u64, text.as_ptr() as u64 + text.len() as u64)
    }

    fn open(text: &str, mode: u64) -> OsCallResult {
        let (front, back) = path_args(text);
        invoke(SyscallFunction::FileOpen, [front, back, mode, 0])
    }

    #[test]
    fn file_read_hits_end_of_file() {
        let _serial = CONTEXT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        with_kernel_context("eof-test", || {
            // Seed a 9-byte file through the VFS.
            let path = VfsPath::new("eof-file").unwrap();
            let node = vfs_root().create(&path).unwrap();
            node.ops().write(0, b"Welcome.\n").unwrap();

            let opened = open("eof-file", OPEN_READ | (OPEN_EXISTING << 8));
            assert_eq!(opened.status, 0);
            let handle = opened.value;

            // A 256-byte read returns the 9 available bytes.
            let mut buffer = [0u8; 256];
            let front = buffer.as_mut_ptr() as u64;
            let read = invoke(SyscallFunction::FileRead, [handle, front, front + 256, 0]);
            assert_eq!(read.status, 0);
            assert_eq!(read.value, 9);
            assert_eq!(&buffer[..9], b"Welcome.\n");

            // The cursor sits at the end: the next read is EndOfFile.
            let eof = invoke(SyscallFunction::FileRead, [handle, front, front + 256, 0]);
            assert_eq!(eof.status, OsStatus::EndOfFile.code());

            let closed = invoke(SyscallFunction::FileClose, [handle, 0, 0, 0]);
            assert_eq!(closed.status, 0);
        });
    }

    #[test]
    fn open_modes_create_truncate_append() {
        let _serial = CONTEXT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        with_kernel_context("open-modes", || {
            // OpenExisting on a missing file fails.
            let missing = open("mode-file", OPEN_READ | (OPEN_EXISTING << 8));
            assert_eq!(missing.status, OsStatus::NotFound.code());

            // OpenAlways creates it.
            let created = open("mode-file", OPEN_WRITE | (OPEN_ALWAYS << 8));
            assert_eq!(created.status, 0);

            let payload = b"0123456789";
            let front = payload.as_ptr() as u64;
            let wrote = invoke(
                SyscallFunction::FileWrite,
                [created.value, front, front + 10, 0],
            );
            assert_eq!(wrote.value, 10);

            // Append mode opens with the cursor at the end.
            let append = open(
                "mode-file",
                OPEN_READ | OPEN_WRITE | OPEN_APPEND | (OPEN_EXISTING << 8),
            );
            assert_eq!(append.status, 0);
            let position = invoke(SyscallFunction::FileSeek, [append.value, 1, 0, 0]);
            assert_eq!(position.value, 10);

            // CreateAlways truncates the existing content.
            let truncated = open("mode-file", OPEN_READ | (CREATE_ALWAYS << 8));
            assert_eq!(truncated.status, 0);

            let mut stat = [0u8; 32];
            let stat_res = invoke(
                SyscallFunction::FileStat,
                [truncated.value, stat.as_mut_ptr() as u64, 0, 0],
            );
            assert_eq!(stat_res.status, 0);
            let logical = u64::from_le_bytes(stat[..8].try_into().unwrap());
            assert_eq!(logical, 0);
        });
    }

    #[test]
    fn seek_modes_resolve_against_size() {
        let _serial = CONTEXT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        with_kernel_context("seek-modes", || {
            let path = VfsPath::new("seek-file").unwrap();
            let node = vfs_root().create(&path).unwrap();
            node.ops().write(0, b"abcdef").unwrap();

            let opened = open("seek-file", OPEN_READ | (OPEN_EXISTING << 8));
            let handle = opened.value;

            // Absolute, relative, then end-based.
            assert_eq!(invoke(SyscallFunction::FileSeek, [handle, 0, 4, 0]).value, 4);
            assert_eq!(
                invoke(SyscallFunction::FileSeek, [handle, 1, (-2i64) as u64, 0]).value,
                2
            );
            assert_eq!(
                invoke(SyscallFunction::FileSeek, [handle, 2, (-1i64) as u64, 0]).value,
                5
            );
            // Unknown mode.
            assert_eq!(
                invoke(SyscallFunction::FileSeek, [handle, 9, 0, 0]).status,
                OsStatus::InvalidInput.code()
            );
        });
    }

    #[test]
    fn seek_on_a_stream_device_is_not_supported() {
        let _serial = CONTEXT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        with_kernel_context("device-seek", || {
            use crate::fs::node::testing::{StreamDevice, STREAM_DEVICE_GUID};

            let vfs = vfs_root();
            vfs.mkdir(&VfsPath::new("dev-seek").unwrap()).unwrap();
            vfs.mkdevice(
                &VfsPath::new("dev-seek\0tty").unwrap(),
                StreamDevice::node("tty"),
            )
            .unwrap();

            let stream = vfs
                .device(
                    &VfsPath::new("dev-seek\0tty").unwrap(),
                    STREAM_DEVICE_GUID,
                    &[],
                    NodeAccess::RW,
                )
                .unwrap();
            stream.write(b"queued").unwrap();

            let call = super::super::CallContext::current().unwrap();
            let handle = call.process.handles().insert(
                ObjectRef::Device(stream),
                HandleAccess::READ | HandleAccess::WRITE | HandleAccess::STAT,
            );
            drop(call);

            // The stream reads through the file surface...
            let mut buffer = [0u8; 16];
            let front = buffer.as_mut_ptr() as u64;
            let read = invoke(
                SyscallFunction::FileRead,
                [handle.raw(), front, front + 16, 0],
            );
            assert_eq!(read.status, 0);
            assert_eq!(&buffer[..read.value as usize], b"queued");

            // ...but has no position for FileSeek to move.
            for mode in 0..3u64 {
                let result = invoke(SyscallFunction::FileSeek, [handle.raw(), mode, 0, 0]);
                assert_eq!(result.status, OsStatus::NotSupported.code());
            }
        });
    }

    #[test]
    fn directory_iteration_over_syscalls() {
        let _serial = CONTEXT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        with_kernel_context("dir-iter", || {
            let vfs = vfs_root();
            vfs.mkdir(&VfsPath::new("iter-dir").unwrap()).unwrap();
            vfs.create(&VfsPath::new("iter-dir\0one").unwrap()).unwrap();
            vfs.mkdir(&VfsPath::new("iter-dir\0two").unwrap()).unwrap();

            let (front, back) = path_args("iter-dir\0one");
            // DirIter over a file path is a type error.
            let bad = invoke(SyscallFunction::DirIter, [front, back, 0, 0]);
            assert_eq!(bad.status, OsStatus::InvalidType.code());

            let (front, back) = path_args("iter-dir");
            let iter = invoke(SyscallFunction::DirIter, [front, back, 0, 0]);
            assert_eq!(iter.status, 0);

            let mut entry = [0u8; core::mem::size_of::<OsDirEntry>()];
            let out = entry.as_mut_ptr() as u64;

            let first = invoke(SyscallFunction::DirNext, [iter.value, out, 0, 0]);
            assert_eq!(first.status, 0);
            let name_len = u32::from_le_bytes(entry[4..8].try_into().unwrap()) as usize;
            assert_eq!(&entry[8..8 + name_len], b"one");

            let second = invoke(SyscallFunction::DirNext, [iter.value, out, 0, 0]);
            assert_eq!(second.status, 0);

            let done = invoke(SyscallFunction::DirNext, [iter.value, out, 0, 0]);
            assert_eq!(done.status, OsStatus::Completed.code());
        });
    }
}
