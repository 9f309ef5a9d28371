//! End-to-end surface test: a tar boot archive mounted into the VFS,
//! driven through the system call table the way userspace would.

use std::sync::Mutex;

use obsidian_kernel::fs::{
    tarfs::{TarFs, TarParseOptions},
    MemoryBlockDevice, VfsPath,
};
use obsidian_kernel::isr::IsrContext;
use obsidian_kernel::object::{HandleType, OsHandle};
use obsidian_kernel::process::{process_table, Privilege, ThreadState};
use obsidian_kernel::syscall::{
    dispatch_system_call, install_system_calls, OsCallResult, SyscallFunction, SystemCallContext,
};
use obsidian_kernel::OsStatus;

/// All tests in this binary share the CPU-0 current-thread slot.
static CPU_LOCK: Mutex<()> = Mutex::new(());

fn invoke(function: SyscallFunction, args: [u64; 4]) -> OsCallResult {
    let mut context = SystemCallContext {
        function: function as u8 as u64,
        arg0: args[0],
        arg1: args[1],
        arg2: args[2],
        arg3: args[3],
        rip: 0,
        rflags: 0,
    };
    dispatch_system_call(&mut context)
}

fn with_kernel_context<R>(name: &str, body: impl FnOnce() -> R) -> R {
    install_system_calls();

    let process = process_table().create_process(name, Privilege::Supervisor);
    let thread = process_table()
        .create_thread(&process, "surface", IsrContext::default())
        .unwrap();
    thread.set_state(ThreadState::Running);
    obsidian_kernel::sched::set_current_thread(Some(thread));

    let result = body();
    obsidian_kernel::sched::set_current_thread(None);
    result
}

// --- minimal ustar builder -------------------------------------------

fn tar_header(name: &str, size: u64, typeflag: u8) -> [u8; 512] {
    let mut block = [0u8; 512];
    block[..name.len()].copy_from_slice(name.as_bytes());
    block[100..108].copy_from_slice(b"0000644\0");
    let size_field = format!("{:011o}\0", size);
    block[124..136].copy_from_slice(size_field.as_bytes());
    block[136..148].copy_from_slice(b"00000000000\0");
    block[156] = typeflag;
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");

    block[148..156].copy_from_slice(b"        ");
    let checksum: u64 = block.iter().map(|&b| b as u64).sum();
    let checksum_field = format!("{:06o}\0 ", checksum);
    block[148..156].copy_from_slice(&checksum_field.as_bytes()[..8]);
    block
}

fn build_archive(members: &[(&str, u8, &[u8])]) -> Vec<u8> {
    let mut archive = Vec::new();
    for &(name, typeflag, data) in members {
        archive.extend_from_slice(&tar_header(name, data.len() as u64, typeflag));
        archive.extend_from_slice(data);
        let pad = data.len().next_multiple_of(512) - data.len();
        archive.extend(std::iter::repeat(0).take(pad));
    }
    archive.extend(std::iter::repeat(0).take(1024));
    archive
}

fn path_args(text: &str) -> (u64, u64) {
    (text.as_ptr() as u64, text.as_ptr() as u64 + text.len() as u64)
}

#[test]
fn boot_archive_through_the_syscall_surface() {
    let _serial = CPU_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    // Stage the archive under /surface-initrd.
    let archive = build_archive(&[
        ("etc/", b'5', b""),
        ("etc/hostname", b'0', b"obsidian\n"),
        ("boot/", b'5', b""),
        ("boot/init", b'0', b"\x7fELF stub"),
    ]);
    let vfs = obsidian_kernel::fs::vfs_root();
    let mount = TarFs::instance()
        .create_mount(MemoryBlockDevice::new(archive), TarParseOptions::default())
        .unwrap();
    vfs.add_mount_with(mount, &VfsPath::new("surface-initrd").unwrap())
        .unwrap();

    with_kernel_context("surface", || {
        // Open read-only; write mode must be refused by the tar driver.
        let (front, back) = path_args("surface-initrd\0etc\0hostname");
        let denied = invoke(SyscallFunction::FileOpen, [front, back, 0b11 | (2 << 8), 0]);
        assert_eq!(denied.status, OsStatus::AccessDenied.code());

        let opened = invoke(SyscallFunction::FileOpen, [front, back, 0b01 | (2 << 8), 0]);
        assert_eq!(opened.status, 0);
        let handle = opened.value;
        assert_eq!(OsHandle(handle).handle_type(), HandleType::Node);

        // Read it all, then hit end of file.
        let mut buffer = [0u8; 64];
        let buf = buffer.as_mut_ptr() as u64;
        let read = invoke(SyscallFunction::FileRead, [handle, buf, buf + 64, 0]);
        assert_eq!(read.status, 0);
        assert_eq!(&buffer[..read.value as usize], b"obsidian\n");

        let eof = invoke(SyscallFunction::FileRead, [handle, buf, buf + 64, 0]);
        assert_eq!(eof.status, OsStatus::EndOfFile.code());

        // Rewind and stat.
        let rewound = invoke(SyscallFunction::FileSeek, [handle, 0, 0, 0]);
        assert_eq!(rewound.value, 0);
        let mut stat = [0u8; 32];
        let stat_result = invoke(
            SyscallFunction::FileStat,
            [handle, stat.as_mut_ptr() as u64, 0, 0],
        );
        assert_eq!(stat_result.status, 0);
        assert_eq!(u64::from_le_bytes(stat[..8].try_into().unwrap()), 9);

        invoke(SyscallFunction::FileClose, [handle, 0, 0, 0]);

        // Enumerate the archive root.
        let (front, back) = path_args("surface-initrd");
        let iter = invoke(SyscallFunction::DirIter, [front, back, 0, 0]);
        assert_eq!(iter.status, 0);

        let mut names = Vec::new();
        loop {
            let mut entry = [0u8; 256];
            let result = invoke(
                SyscallFunction::DirNext,
                [iter.value, entry.as_mut_ptr() as u64, 0, 0],
            );
            if result.status == OsStatus::Completed.code() {
                break;
            }
            assert_eq!(result.status, 0);
            let len = u32::from_le_bytes(entry[4..8].try_into().unwrap()) as usize;
            names.push(String::from_utf8(entry[8..8 + len].to_vec()).unwrap());
        }
        assert_eq!(names, ["boot", "etc"]);
    });
}

#[test]
fn invalid_paths_are_rejected_at_the_boundary() {
    let _serial = CPU_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    with_kernel_context("bad-paths", || {
        for text in ["\0etc", "etc\0", "etc\0\0x", "a\0.\0b", "a/b"] {
            let (front, back) = path_args(text);
            let result = invoke(SyscallFunction::FileOpen, [front, back, 0b01, 0]);
            assert_eq!(
                result.status,
                OsStatus::InvalidPath.code(),
                "path {:?} must be rejected",
                text
            );
        }
    });
}

#[test]
fn processes_signal_their_handles_on_exit() {
    let _serial = CPU_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    with_kernel_context("lifecycle", || {
        use obsidian_kernel::object::{
            handle_wait, HandleAccess, ObjectRef, OS_TIMEOUT_INSTANT,
        };

        let call_process = obsidian_kernel::sched::current_thread()
            .unwrap()
            .process()
            .unwrap();

        let child = process_table().create_process("short-lived", Privilege::User);
        let handle = call_process
            .handles()
            .insert(ObjectRef::Process(child.clone()), HandleAccess::ALL);

        assert_eq!(
            handle_wait(call_process.handles(), handle, OS_TIMEOUT_INSTANT).unwrap_err(),
            OsStatus::Timeout
        );

        process_table().exit_process(&child, 0);
        handle_wait(call_process.handles(), handle, OS_TIMEOUT_INSTANT).unwrap();
        call_process.handles().close(handle).unwrap();
        assert!(!process_table().contains(child.id()));
    });
}
