//! Kernel binary: multiboot entry point and boot orchestration.
//!
//! The bootloader drops us in `_start` with the magic number in eax and
//! the boot information block in ebx. Everything needed from the block is
//! copied out before paging comes up, because the block can live anywhere
//! in physical memory.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use arrayvec::ArrayVec;

    use kernel::memory::frames::FRAME_ALLOCATOR;
    use kernel::memory::paging::{self, PageFlags};
    use kernel::memory::{self, PAGE_SIZE, addr_to_page, page_to_addr};
    use kernel::multiboot::{self, BootInfo, MemMapEntry};
    use kernel::tasks::scheduler;
    use kernel::tasks::task::{PageDir, Privilege, Task};
    use kernel::{arch, gdt, hcf, interrupts, println, warn};

    core::arch::global_asm!(
        r#"
        .section .multiboot
        .align 4
        .long 0x1BADB002
        .long 0x00000003
        .long -(0x1BADB002 + 0x00000003)

        .section .bss
        .align 16
        boot_stack_bottom:
        .skip 0x4000
        boot_stack_top:

        .section .text
        .global _start
        _start:
            mov esp, offset boot_stack_top
            push ebx
            push eax
            call kernel_main
        2:
            cli
            hlt
            jmp 2b
        "#
    );

    unsafe extern "C" {
        static __KERNEL_BEGIN: u8;
        static __KERNEL_END: u8;
    }

    fn kernel_begin() -> u32 {
        unsafe { (&raw const __KERNEL_BEGIN) as usize as u32 }
    }

    fn kernel_end() -> u32 {
        unsafe { (&raw const __KERNEL_END) as usize as u32 }
    }

    #[unsafe(no_mangle)]
    extern "C" fn kernel_main(magic: u32, boot_info: *const BootInfo) -> ! {
        println!();

        if magic != multiboot::BOOTLOADER_MAGIC {
            panic!("unknown multiboot magic {:#x}", magic);
        }

        let boot = unsafe { &*boot_info };
        unsafe {
            boot.dump();
        }

        // Copy everything out; the block is not referenced again once
        // memory management owns the machine.
        let mem_upper = boot.mem_upper;
        let mmaps: ArrayVec<MemMapEntry, { multiboot::MAX_MEMORY_MAP_ENTRIES }> =
            unsafe { boot.collect_memory_map() };
        assert!(!mmaps.is_empty(), "empty memory map");

        let mut initrd = None;
        let modules = unsafe { boot.modules() };
        if let Some(module) = modules.first() {
            if modules.len() > 1 {
                warn!("found more than one module, using the first as the initial ramdisk");
            }
            initrd = Some((module.mod_start, module.mod_end));
        }

        kernel_setup(mem_upper, &mmaps, initrd)
    }

    fn kernel_setup(mem_upper: u32, mmaps: &[MemMapEntry], initrd: Option<(u32, u32)>) -> ! {
        let begin = kernel_begin();
        let end = kernel_end();
        assert!(
            begin % PAGE_SIZE == 0,
            "expected the kernel to start on a page boundary"
        );
        assert!(end - begin <= PAGE_SIZE, "kernel does not fit within a 4MB page");
        println!(
            "Kernel is {} KB large (physical range: {:#x} - {:#x})",
            (end - begin) >> 10,
            begin,
            end
        );

        memory::frames::init(mem_upper, mmaps, begin);
        println!("Num available frames: {}", memory::frames::num_free());

        paging::init(begin);
        memory::heap::init();

        gdt::init();
        interrupts::init();
        scheduler::init();

        kernel::selftest::run();

        match initrd {
            Some((start, end)) if start < end => spawn_userboot(start, end),
            _ => warn!("no initial ramdisk found, nothing to run in user space"),
        }

        // The timer starts preempting from here on; this loop is the main
        // kernel task, the fallback when no user task can run.
        arch::enable_interrupts();
        hcf();
    }

    /// Load the initial ramdisk as the first user program.
    ///
    /// One page is allocated for it; anything beyond that is the program's
    /// own problem, via syscalls. Which page it lands on is not guaranteed,
    /// so userboot must be position-independent code.
    fn spawn_userboot(initrd_start: u32, initrd_end: u32) {
        assert!(!arch::interrupts_enabled());
        println!("Initrd start: {:#x}", initrd_start);
        println!("Initrd end (inclusive): {:#x}", initrd_end);

        let mut user_pd = unsafe { &*paging::kernel_directory() }.duplicate();

        let user_page = unsafe { &*paging::kernel_directory() }
            .next_free_entry(1)
            .expect("no free virtual page for userboot");
        let user_start = page_to_addr(user_page);

        let frame = FRAME_ALLOCATOR.lock().next_free().expect("no physical frame for userboot");
        user_pd.map(user_start, page_to_addr(frame), PageFlags::USER);

        let len = (initrd_end - initrd_start).min(PAGE_SIZE);
        copy_initrd(&mut user_pd, user_start, initrd_start, len);

        let mut task = Task::new(
            Privilege::User,
            PageDir::Owned(user_pd),
            Some(scheduler::main_kernel_task()),
        );
        task.record_owned_frame(frame);
        task.set_entry(user_start);

        println!("userboot entry: {:#x}", user_start);
        scheduler::with(|s| {
            let id = s.insert_task(task);
            s.register_task(id);
            println!("initial user task: {}", id);
        });
    }

    /// Copy the initrd bytes into the user page. The source is physical
    /// memory the kernel directory may not map, so any missing super-pages
    /// are identity-mapped for the duration of the copy.
    fn copy_initrd(user_pd: &mut paging::PageDirectory, user_start: u32, initrd_start: u32, len: u32) {
        let kernel_dir = unsafe { &mut *paging::kernel_directory() };

        let first = addr_to_page(initrd_start);
        let last = addr_to_page(initrd_start + len - 1);
        let mut transient: ArrayVec<u32, 4> = ArrayVec::new();
        for page in first..=last {
            let addr = page_to_addr(page);
            if !kernel_dir.is_mapped(addr) {
                kernel_dir.map(addr, addr, PageFlags::empty());
                transient.push(addr);
            }
        }

        unsafe {
            paging::copy_between(
                paging::kernel_directory(),
                user_pd as *mut paging::PageDirectory,
                initrd_start,
                user_start,
                len as usize,
            )
            .expect("copying the initial ramdisk failed");
        }

        for addr in transient {
            kernel_dir.unmap(addr);
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        arch::disable_interrupts();
        println!();
        println!("KERNEL PANIC: {}", info);
        hcf();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
