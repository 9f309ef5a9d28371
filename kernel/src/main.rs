//! Obsidian kernel boot binary.
//!
//! Wires the library together on bare metal: ingest the boot handoff,
//! bring up memory management, install the interrupt and syscall
//! surfaces, mount the boot archive, and hand the CPU to the scheduler.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod launch {
    extern crate alloc;

    use alloc::vec::Vec;

    use bootloader_api::config::{BootloaderConfig, Mapping};
    use bootloader_api::info::{MemoryRegionKind, Optional};
    use bootloader_api::BootInfo;

    use obsidian_kernel::arch::x86_64::{apic, gdt, pat, syscall as arch_syscall, CpuFeatures};
    use obsidian_kernel::elf::ElfImage;
    use obsidian_kernel::fs::{
        tarfs::{TarFs, TarParseOptions},
        MemoryBlockDevice, NodeAccess, VfsPath,
    };
    use obsidian_kernel::isr;
    use obsidian_kernel::mm::{
        self,
        heap::{KernelHeap, TlsfBlock, TlsfHeap},
        kalloc,
        layout::SystemMemoryLayout,
        paging::{AddressMapping, DirectMap, PageTables},
        phys::{layout_bitmap_size, PageAllocator},
        LaunchInfo, MemoryMapEntry, MemoryMapEntryKind, MemoryRange, MemoryType, PageFlags,
        PhysicalAddress, VirtualAddress, PAGE_SIZE,
    };
    use obsidian_kernel::process::{process_table, Privilege};
    use obsidian_kernel::sched;
    use obsidian_kernel::syscall;

    use core::mem::MaybeUninit;

    use spin::Mutex;

    /// Pages for the TLSF heap arena.
    const HEAP_PAGES: usize = 4096;

    /// Block metadata nodes for the kernel heap.
    const HEAP_NODES: usize = 8192;

    /// Pages per syscall/interrupt stack.
    const STACK_PAGES: usize = 16;

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    static PAGE_ALLOCATOR: Mutex<Option<PageAllocator>> = Mutex::new(None);

    fn optional(value: &Optional<u64>) -> u64 {
        match value {
            Optional::Some(value) => *value,
            Optional::None => 0,
        }
    }

    /// Digest the bootloader handoff into the kernel's own form.
    fn launch_info(boot_info: &BootInfo) -> LaunchInfo {
        let mut memory_map = Vec::new();
        for region in boot_info.memory_regions.iter() {
            let kind = match region.kind {
                MemoryRegionKind::Usable => MemoryMapEntryKind::Usable,
                MemoryRegionKind::Bootloader => MemoryMapEntryKind::BootloaderReclaimable,
                _ => MemoryMapEntryKind::Reserved,
            };
            memory_map.push(MemoryMapEntry {
                kind,
                range: MemoryRange::from_raw(region.start, region.end),
            });
        }

        let initrd_base = optional(&boot_info.ramdisk_addr);
        LaunchInfo {
            kernel_physical_base: PhysicalAddress::new(boot_info.kernel_addr),
            kernel_virtual_base: VirtualAddress::new(boot_info.kernel_image_offset),
            hhdm_offset: optional(&boot_info.physical_memory_offset),
            rsdp_address: PhysicalAddress::new(optional(&boot_info.rsdp_addr)),
            memory_map,
            stack: MemoryRange::from_raw(0, 0),
            initrd: MemoryRange::from_raw(
                initrd_base,
                initrd_base + boot_info.ramdisk_len,
            ),
            early_memory: MemoryRange::from_raw(0, 0),
        }
    }

    fn hhdm_ptr(info: &LaunchInfo, addr: PhysicalAddress) -> *mut u8 {
        (addr.as_u64() + info.hhdm_offset) as *mut u8
    }

    /// Build the PFA: bitmap arena out of the first usable range, then
    /// reserve the kernel, the initrd, and the bitmap itself.
    fn init_physical_memory(info: &LaunchInfo) -> PageAllocator {
        let layout = SystemMemoryLayout::from_entries(&info.memory_map);
        let bitmap_bytes = layout_bitmap_size(&layout);
        let bitmap_pages = bitmap_bytes.div_ceil(PAGE_SIZE);

        // Early memory: carve the bitmap from the largest usable range.
        let host = layout
            .usable
            .iter()
            .copied()
            .max_by_key(MemoryRange::size)
            .expect("no usable memory in the boot map");
        assert!(host.pages() as usize > bitmap_pages * 2);

        let bitmap_phys = host.front;
        // SAFETY: the range is usable RAM reachable through the direct
        // map and nothing else owns it yet.
        let bitmap = unsafe {
            core::slice::from_raw_parts_mut(hhdm_ptr(info, bitmap_phys), bitmap_bytes)
        };

        let mut pfa = PageAllocator::new(&layout, bitmap);
        pfa.mark_used(MemoryRange::new(
            bitmap_phys,
            bitmap_phys.offset((bitmap_pages * PAGE_SIZE) as u64),
        ));
        if !info.initrd.is_empty() {
            pfa.mark_used(info.initrd.page_align_inward());
        }
        pfa
    }

    /// Stand the TLSF heap up over a PFA-backed arena.
    fn init_heap(info: &LaunchInfo, pfa: &mut PageAllocator) {
        let arena = pfa.alloc4k(HEAP_PAGES);
        assert!(arena.is_valid(), "out of memory for the kernel heap");

        let node_bytes = HEAP_NODES * core::mem::size_of::<TlsfBlock>();
        let node_pages = node_bytes.div_ceil(PAGE_SIZE);
        let node_phys = pfa.alloc4k(node_pages);
        assert!(node_phys.is_valid());

        // SAFETY: freshly allocated PFA pages seen through the direct
        // map, handed to the heap for its exclusive use.
        let nodes = unsafe {
            core::slice::from_raw_parts_mut(
                hhdm_ptr(info, node_phys) as *mut MaybeUninit<TlsfBlock>,
                HEAP_NODES,
            )
        };

        let range = MemoryRange::new(arena, arena.offset((HEAP_PAGES * PAGE_SIZE) as u64));
        let tlsf = TlsfHeap::create(range, nodes).expect("tlsf arena rejected");
        kalloc::install_heap(KernelHeap::new(tlsf, hhdm_ptr(info, arena)));
    }

    /// Allocate a kernel stack and return its top.
    fn alloc_stack(info: &LaunchInfo, pfa: &mut PageAllocator) -> u64 {
        let base = pfa.alloc4k(STACK_PAGES);
        assert!(base.is_valid());
        hhdm_ptr(info, base) as u64 + (STACK_PAGES * PAGE_SIZE) as u64
    }

    fn install_exception_handlers() {
        let table = isr::shared_isr_table();

        table.install(6, |context| {
            panic!("invalid opcode at {:#x}", context.rip);
        });
        table.install(8, |context| {
            panic!("double fault, rsp {:#x}", context.rsp);
        });
        table.install(13, |context| {
            panic!(
                "general protection fault at {:#x} error {:#x}",
                context.rip, context.error
            );
        });
        table.install(14, |context| {
            let address = x86_64::registers::control::Cr2::read_raw();
            panic!(
                "page fault at {:#x} touching {:#x} error {:#x}",
                context.rip, address, context.error
            );
        });
    }

    /// Map the boot archive and spawn the initial user process from
    /// `boot\0init` if present.
    fn launch_init(info: &LaunchInfo) {
        if info.initrd.is_empty() {
            log::warn!("no initrd supplied, staying idle");
            return;
        }

        // SAFETY: the initrd range comes from the bootloader and was
        // reserved in the PFA.
        let bytes = unsafe {
            core::slice::from_raw_parts(
                hhdm_ptr(info, info.initrd.front),
                info.initrd.size() as usize,
            )
        };

        let vfs = obsidian_kernel::fs::vfs_root();
        let media = MemoryBlockDevice::new(bytes.to_vec());
        let mount = TarFs::instance()
            .create_mount(media, TarParseOptions::default())
            .expect("boot archive failed to parse");
        let path = VfsPath::new("initrd").expect("static path");
        vfs.add_mount_with(mount, &path).expect("initrd mount");

        let init_path = VfsPath::new("initrd\0boot\0init").expect("static path");
        let Ok(handle) = vfs.open(&init_path, NodeAccess::R) else {
            log::warn!("boot archive has no init binary");
            return;
        };

        let size = handle.stat().expect("stat init").logical as usize;
        let mut image = alloc::vec![0u8; size];
        let mut done = 0;
        while done < size {
            let read = handle.read(&mut image[done..]).expect("read init");
            if read == 0 {
                break;
            }
            done += read;
        }

        match spawn_user_process(info, &image) {
            Ok(()) => log::info!("init process staged"),
            Err(status) => log::error!("init launch failed: {}", status),
        }
    }

    /// Build a user process from an ELF image: fresh root table sharing
    /// the kernel half, segments mapped per their flags, one thread
    /// queued at the entry point.
    fn spawn_user_process(
        info: &LaunchInfo,
        image: &[u8],
    ) -> obsidian_kernel::OsResult<()> {
        use obsidian_kernel::isr::IsrContext;

        let elf = ElfImage::parse(image)?;
        let segments = elf.load_segments()?;

        let mut pfa_slot = PAGE_ALLOCATOR.lock();
        let pfa = pfa_slot.as_mut().ok_or(obsidian_kernel::OsStatus::NotAvailable)?;

        let mapper = DirectMap {
            offset: info.hhdm_offset,
        };
        let mut tables = PageTables::new(pfa, mapper)?;

        // Share the kernel half: copy the top 256 root entries from the
        // boot tables.
        let boot_root = x86_64::registers::control::Cr3::read().0.start_address().as_u64();
        // SAFETY: both roots are live table frames in the direct map.
        unsafe {
            let src = (boot_root + info.hhdm_offset) as *const u64;
            let dst = (tables.root().as_u64() + info.hhdm_offset) as *mut u64;
            core::ptr::copy_nonoverlapping(src.add(256), dst.add(256), 256);
        }

        let process = process_table().create_process("init", Privilege::User);

        for segment in &segments {
            let pages = segment.size / PAGE_SIZE;
            let backing = pfa.alloc4k(pages);
            if !backing.is_valid() {
                return Err(obsidian_kernel::OsStatus::OutOfMemory);
            }

            // SAFETY: fresh PFA pages in the direct map.
            unsafe {
                core::ptr::write_bytes(hhdm_ptr(info, backing), 0, segment.size);
                let data = elf.segment_bytes(segment);
                let skew = (segment.file_vaddr.as_u64() - segment.vaddr.as_u64()) as usize;
                core::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    hhdm_ptr(info, backing).add(skew),
                    data.len(),
                );
            }

            let mapping = AddressMapping::new(segment.vaddr, backing, segment.size);
            tables.map(pfa, mapping, segment.flags, MemoryType::WriteBack)?;

            let mut vm = process.vm().lock();
            vm.user_va.mark_used(obsidian_kernel::mm::VirtualRange::from_raw(
                segment.vaddr.as_u64(),
                segment.vaddr.as_u64() + segment.size as u64,
            ));
            vm.mappings.push(mapping);
        }

        // A 64 KiB user stack below the canonical hole.
        let stack_pages = 16;
        let stack_backing = pfa.alloc4k(stack_pages);
        if !stack_backing.is_valid() {
            return Err(obsidian_kernel::OsStatus::OutOfMemory);
        }
        let stack_range = {
            let mut vm = process.vm().lock();
            vm.user_va.alloc4k(stack_pages, None)
        };
        tables.map(
            pfa,
            AddressMapping::new(stack_range.front, stack_backing, stack_pages * PAGE_SIZE),
            PageFlags::USER_DATA,
            MemoryType::WriteBack,
        )?;

        process.vm().lock().page_root = tables.root();

        let mut context = IsrContext::default();
        context.rip = elf.entry().as_u64();
        context.rsp = stack_range.back.as_u64();
        context.rflags = 1 << 9;
        context.cs = (gdt::selectors().user_code.0 | 0b11) as u64;
        context.ss = (gdt::selectors().user_data.0 | 0b11) as u64;

        let thread = process_table().create_thread(&process, "main", context)?;

        // The thread's kernel-side syscall stack, released on exit.
        let kernel_stack = pfa.alloc4k(STACK_PAGES);
        if !kernel_stack.is_valid() {
            return Err(obsidian_kernel::OsStatus::OutOfMemory);
        }
        thread.set_syscall_stack(AddressMapping::new(
            VirtualAddress::new(kernel_stack.as_u64() + info.hhdm_offset),
            kernel_stack,
            STACK_PAGES * PAGE_SIZE,
        ));

        sched::scheduler().enqueue(&thread);
        Ok(())
    }

    pub fn main(boot_info: &'static mut BootInfo) -> ! {
        let info = launch_info(boot_info);
        mm::set_hhdm_offset(info.hhdm_offset);

        obsidian_kernel::logger::init(log::LevelFilter::Info);
        log::info!(
            "obsidian starting, hhdm at {:#x}, {} memory map entries",
            info.hhdm_offset,
            info.memory_map.len()
        );

        gdt::init();
        install_exception_handlers();
        // SAFETY: the GDT above provides the kernel code descriptor.
        unsafe { isr::idt::init() };

        let features = CpuFeatures::detect();
        if features.pat {
            // SAFETY: PAT verified by CPUID, caches coherent at boot.
            unsafe { pat::program_pat() };
        }

        let mut pfa = init_physical_memory(&info);
        init_heap(&info, &mut pfa);

        let syscall_stack = alloc_stack(&info, &mut pfa);
        let interrupt_stack = alloc_stack(&info, &mut pfa);
        gdt::set_interrupt_stack(x86_64::VirtAddr::new(interrupt_stack));
        // SAFETY: a dedicated mapped stack for this CPU.
        unsafe { arch_syscall::install_syscall_stack(syscall_stack) };
        arch_syscall::init();

        *PAGE_ALLOCATOR.lock() = Some(pfa);

        apic::mask_legacy_pic();
        sched::set_apic_base(apic::LocalApic::default_mmio_base().as_u64() + info.hhdm_offset);

        syscall::install_system_calls();
        launch_init(&info);

        obsidian_kernel::logger::flush();

        let vector = sched::start(isr::local_isr_table()).expect("scheduling vector");
        log::info!("scheduler armed on vector {}", vector);

        // SAFETY: tables, handlers, and stacks are all installed.
        unsafe { core::arch::asm!("sti") };
        loop {
            obsidian_kernel::logger::flush();
            x86_64::instructions::hlt();
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
bootloader_api::entry_point!(launch::main, config = &launch::BOOTLOADER_CONFIG);

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    // Push the reason straight to the serial port; the ring may hold
    // unflushed context from before the failure.
    log::error!("kernel panic: {}", info);
    obsidian_kernel::logger::flush();

    loop {
        core::hint::spin_loop();
    }
}

/// Host builds only exist so tooling can link the binary target.
#[cfg(not(target_os = "none"))]
fn main() {
    println!("obsidian-kernel is a bare-metal image; run the test suite instead");
}
