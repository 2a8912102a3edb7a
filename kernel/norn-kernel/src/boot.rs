//! Boot path: from the UEFI handoff to a running scheduler.
//!
//! Initialisation order is rigid — each stage only uses services the
//! previous stages installed:
//!
//! 1. validate the handoff magic,
//! 2. bootstrap bump allocator over the UEFI memory map,
//! 3. page-table reconstruction (identity mapping still active),
//! 4. buddy allocator seeded from the map minus the bump prefix,
//! 5. kernel heap (bin allocator) on top of the buddy,
//! 6. ACPI discovery (RSDP validation),
//! 7. per-CPU area and GS base,
//! 8. interrupt dispatch table (spurious + timer),
//! 9. filesystem root from the initramfs,
//! 10. scheduler with its idle thread, initial process, first switch.

use norn_boot::BootInfo;
use norn_boot::memmap::{MemoryMap, MemoryType};
use norn_core::addr::{DIRECT_MAP_BASE, PhysAddr, VirtAddr};
use norn_mm::bump::BumpAllocator;
use norn_mm::mapper::{PageAttr, PageMapper};
use norn_mm::{MmError, PAGE_SIZE};

use crate::arch::PageTableMapper;

/// Timer interrupt vector.
pub const TIMER_VECTOR: u8 = 0x20;

/// Builds the kernel's own page tables while the loader's identity
/// mapping is still active.
///
/// Every physical range the map describes is mapped into the direct map
/// at `dm_base` ([`DIRECT_MAP_BASE`] in the kernel); `norn_reserved`
/// descriptors with a virtual address additionally keep their
/// loader-assigned mapping (the kernel image and handoff structures).
/// Returns the new root table.
pub fn reconstruct_page_tables(
    bump: &mut BumpAllocator,
    map: &MemoryMap,
    dm_base: u64,
) -> Result<PhysAddr, MmError> {
    // The identity mapping is live, so table frames are reachable at
    // their physical addresses.
    let mut mapper = PageTableMapper::new(0);
    let root = bump.alloc_pages(1)?;
    // SAFETY: The frame was just allocated; zeroing it prepares an empty
    // top-level table.
    unsafe { core::ptr::write_bytes(root.as_u64() as *mut u8, 0, PAGE_SIZE) };

    let mut map_range =
        |mapper: &mut PageTableMapper,
         bump: &mut BumpAllocator,
         virt: VirtAddr,
         phys: PhysAddr,
         bytes: u64,
         attr: PageAttr|
         -> Result<(), MmError> {
            let pages = bytes.div_ceil(PAGE_SIZE as u64);
            for i in 0..pages {
                let offset = i * PAGE_SIZE as u64;
                // SAFETY: root is the valid table allocated above; the
                // bump allocator returns unused zeroed-by-us frames.
                unsafe {
                    mapper
                        .map(root, virt + offset, phys + offset, attr, &mut || {
                            let frame = bump.alloc_pages(1)?;
                            core::ptr::write_bytes(frame.as_u64() as *mut u8, 0, PAGE_SIZE);
                            Ok(frame)
                        })?
                        .ignore();
                }
            }
            Ok(())
        };

    for desc in map.iter() {
        let phys = desc.start();
        // Direct map for everything the kernel may ever touch.
        map_range(
            &mut mapper,
            bump,
            VirtAddr::new(dm_base + phys.as_u64()),
            phys,
            desc.size(),
            PageAttr::WRITABLE | PageAttr::GLOBAL,
        )?;

        // Loader-assigned mappings (kernel image, handoff records).
        if desc.memory_type() == MemoryType::NornReserved && desc.virtual_start != 0 {
            map_range(
                &mut mapper,
                bump,
                VirtAddr::new(desc.virtual_start),
                phys,
                desc.size(),
                PageAttr::WRITABLE | PageAttr::EXECUTABLE | PageAttr::GLOBAL,
            )?;
        }
    }
    Ok(root)
}

/// Timer interrupt handler: request a reschedule of the running task.
///
/// The EOI is sent by the dispatch epilogue (directly, or through the
/// reschedule it triggers).
pub fn timer_handler(_ctx: &mut crate::interrupts::IrqContext) {
    glue::timer_tick();
}

/// Yields forever. The parking spot for threads that exited.
pub fn reschedule_forever() -> ! {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    loop {
        glue::schedule();
        crate::arch::x86_64::instructions::hlt();
    }
    #[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
    panic!("reschedule_forever on a host build");
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod glue {
    //! Bridges between the global scheduler instance, the interrupt
    //! dispatcher and the process layer.

    use core::cell::UnsafeCell;
    use core::ptr::NonNull;

    use norn_sched::scheduler::CpuScheduler;
    use norn_sched::thread::Thread;

    use crate::arch::x86_64::context::X86SchedArch;
    use crate::interrupts::{TaskHooks, TaskSummary};

    /// The BSP scheduler cell. One instance per CPU once APs boot; each
    /// CPU reaches only its own.
    ///
    /// Deliberately not behind a lock: the scheduler is per-CPU state
    /// serialised by the preemption/IRQ discipline, and a lock would
    /// self-deadlock the moment `preempt_schedule` re-enables interrupts
    /// with the lock held.
    struct SchedulerCell(UnsafeCell<Option<CpuScheduler<X86SchedArch>>>);

    // SAFETY: Each CPU only touches its own cell (BSP-only today).
    unsafe impl Sync for SchedulerCell {}

    static SCHEDULER: SchedulerCell = SchedulerCell(UnsafeCell::new(None));

    /// Installs the scheduler with its idle thread.
    pub fn init() {
        let mut sched = CpuScheduler::new(X86SchedArch);
        sched.init_idle(Thread::new_idle());
        // SAFETY: Single-threaded boot; nothing else reaches the cell yet.
        unsafe { *SCHEDULER.0.get() = Some(sched) };
        crate::proc::register_current_thread_fn(current_thread);
    }

    /// Runs a closure on this CPU's scheduler.
    pub fn with<R>(f: impl FnOnce(&mut CpuScheduler<X86SchedArch>) -> R) -> Option<R> {
        // SAFETY: Per-CPU access under the preemption/IRQ discipline;
        // nested interrupt paths never re-enter `with` while a mutable
        // borrow is live (the preemption counter blocks reentry).
        unsafe { (*SCHEDULER.0.get()).as_mut().map(f) }
    }

    /// Scheduler-side current thread, for the process layer.
    pub fn current_thread() -> Option<NonNull<Thread>> {
        // SAFETY: Reading the current slot is a single pointer read.
        unsafe { (*SCHEDULER.0.get()).as_ref().and_then(CpuScheduler::current) }
    }

    /// Timer-tick entry.
    pub fn timer_tick() {
        let _ = with(CpuScheduler::timer_tick);
    }

    /// Voluntary reschedule.
    pub fn schedule() {
        let _ = with(|s| s.schedule(false));
    }

    /// The dispatcher's view of the scheduler.
    pub struct KernelTaskHooks;

    impl TaskHooks for KernelTaskHooks {
        fn swap_in_irq(&self, value: bool) -> bool {
            current_thread()
                // SAFETY: The scheduler keeps the current thread alive.
                .map(|t| unsafe { t.as_ref() }.set_in_irq(value))
                .unwrap_or(false)
        }

        fn need_resched(&self) -> bool {
            current_thread()
                // SAFETY: As above.
                .map(|t| unsafe { t.as_ref() }.need_resched())
                .unwrap_or(false)
        }

        fn preemption_allowed(&self) -> bool {
            with(|s| s.preemption_allowed()).unwrap_or(false)
        }

        fn preempt_schedule(&self) {
            let _ = with(CpuScheduler::preempt_schedule);
        }

        fn send_eoi(&self) {
            crate::arch::x86_64::instructions::lapic_eoi();
        }

        fn current_task(&self) -> Option<TaskSummary> {
            current_thread().map(|t| {
                // SAFETY: As above.
                let t = unsafe { t.as_ref() };
                let mut name = [0u8; 16];
                let bytes = t.name().as_bytes();
                name[..bytes.len()].copy_from_slice(bytes);
                TaskSummary {
                    tid: t.tid.0,
                    name,
                    kstack_base: t.kstack.map_or(0, |k| k.base.as_u64()),
                    kstack_size: t.kstack.map_or(0, |k| k.size as u64),
                }
            })
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod entry {
    //! The kernel entry proper.

    use super::*;
    use norn_core::sync::irq;
    use norn_core::{kinfo, percpu};
    use norn_mm::buddy::{self, BuddyAllocator, GlobalFrameSource};
    use norn_sched::thread::KERNEL_STACK_PAGES;

    use crate::interrupts::{self, IrqContext, SPURIOUS_VECTOR};

    /// C-ABI dispatch shim the interrupt stubs call.
    #[unsafe(no_mangle)]
    pub extern "C" fn norn_dispatch_interrupt(ctx: &mut IrqContext) {
        interrupts::dispatch(&super::glue::KernelTaskHooks, ctx);
    }

    /// TLB flush for a single page.
    fn invlpg(virt: VirtAddr) {
        // SAFETY: INVLPG on any address is harmless in ring 0.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) virt.as_u64(), options(nostack, preserves_flags));
        }
    }

    /// Loads a new root page table.
    unsafe fn write_cr3(root: PhysAddr) {
        // SAFETY: The caller guarantees `root` maps the executing code
        // and stack.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
        }
    }

    unsafe extern "C" {
        /// GDT/IDT/TSS setup (arch contract, assembly side).
        fn norn_arch_early_init();
        /// Enters ring 3 at `entry` with the given stack (IRETQ path).
        fn norn_enter_user(entry: u64, user_sp: u64) -> !;
    }

    /// First thread body: build and enter the initial user process.
    fn init_thread() {
        let process = crate::proc::create_initial_process(
            "/bin/init",
            &["/bin/init"],
            &["PATH=/bin"],
            &mut GlobalFrameSource,
        )
        .expect("failed to create the initial process");
        let entry = process.entry;
        let user_sp = process.user_sp;
        crate::proc::set_current_process(process);
        kinfo!("entering user space at {entry}");
        // SAFETY: entry/user_sp come from a freshly built process image.
        unsafe { norn_enter_user(entry.as_u64(), user_sp.as_u64()) }
    }

    /// The kernel entry, jumped to by the UEFI loader.
    ///
    /// # Safety
    ///
    /// `boot_info` must be the loader-built handoff record, and this must
    /// be the only CPU running kernel code.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn norn_kernel_main(boot_info: &'static BootInfo) -> ! {
        boot_info.validate().expect("bad boot handoff magic");

        // SAFETY: Single-threaded early boot; the contract function only
        // touches CPU-local tables.
        unsafe { norn_arch_early_init() };

        // Stage 2-3: bootstrap allocation and page-table reconstruction.
        let mut bump =
            BumpAllocator::new(&boot_info.memory_map).expect("no usable memory region");
        let root = reconstruct_page_tables(&mut bump, &boot_info.memory_map, DIRECT_MAP_BASE)
            .expect("page-table reconstruction failed");
        // SAFETY: The new tables map the kernel image at its linked
        // addresses and all physical memory in the direct map.
        unsafe { write_cr3(root) };
        norn_mm::mapper::register_tlb_flush(invlpg);
        kinfo!("page tables reconstructed (root {root})");

        // Stage 4: the buddy allocator owns physical memory from here.
        let mut buddy = BuddyAllocator::new(DIRECT_MAP_BASE);
        // SAFETY: The map describes real memory; the bump prefix holds
        // live page tables and is excluded.
        unsafe { buddy.init_from_map(&boot_info.memory_map, Some(bump.issued())) };
        buddy::init(buddy);

        // Stage 6: ACPI. A bad table is fatal during init.
        let rsdp_virt = boot_info.rsdp.to_virt();
        // SAFETY: The direct map covers the RSDP.
        let rsdp_bytes = unsafe {
            core::slice::from_raw_parts(rsdp_virt.as_ptr::<u8>(), norn_acpi::rsdp::Rsdp2::SIZE)
        };
        let directory =
            norn_acpi::rsdp::parse_rsdp(rsdp_bytes).expect("invalid ACPI RSDP");
        kinfo!(
            "ACPI tables at {:#x} (xsdt={})",
            directory.address,
            directory.is_xsdt
        );

        // Stage 7: per-CPU storage for the BSP.
        let percpu_len = percpu::MAX_CPUS * 16;
        // SAFETY: The loader reserved the per-CPU area; one CPU is live.
        unsafe {
            percpu::init(boot_info.percpu_base, percpu_len, 1)
                .expect("per-CPU area setup failed");
            percpu::local_init(0);
        }

        // Stage 8: interrupt dispatch.
        interrupts::set_handler(SPURIOUS_VECTOR, interrupts::spurious_handler)
            .expect("spurious vector already taken");
        interrupts::set_handler(TIMER_VECTOR, timer_handler)
            .expect("timer vector already taken");

        // Stage 9: filesystem root from the initramfs image.
        let initramfs = boot_info.initramfs;
        // SAFETY: The direct map covers the image.
        let image = unsafe {
            core::slice::from_raw_parts(
                initramfs.addr.to_virt().as_ptr::<u8>(),
                initramfs.size as usize,
            )
        };
        norn_fs::vfs::init(unpack_initramfs(image));

        // Stage 10: scheduler, init thread, first switch.
        glue::init();
        let stack_phys = buddy::with(|b| {
            b.alloc_pages(KERNEL_STACK_PAGES, norn_mm::zone::Zone::Normal)
        })
        .expect("no memory for the init thread stack");
        let stack_base = stack_phys.to_virt();
        // SAFETY: The freshly allocated stack block is unaliased.
        let stack = unsafe {
            core::slice::from_raw_parts_mut(
                stack_base.as_mut_ptr::<u8>(),
                KERNEL_STACK_PAGES * PAGE_SIZE,
            )
        };
        let thread = crate::proc::create_kernel_thread("init", init_thread, stack_base, stack);
        let first = glue::with(|s| s.spawn(thread)).expect("scheduler not installed");

        irq::enable();
        kinfo!("entering the scheduler");
        glue::with(|s| {
            // SAFETY: The thread context was seeded by create_kernel_thread.
            unsafe { s.initial_switch_to(first) }
        });
        // The initial switch does not return.
        crate::arch::x86_64::instructions::halt_forever();
    }

    /// Initramfs unpacking is an external collaborator (CPIO loader);
    /// until it is linked in, the root is the empty directory.
    fn unpack_initramfs(_image: &[u8]) -> alloc::sync::Arc<norn_fs::vfs::Dentry> {
        norn_fs::vfs::Dentry::dir("", alloc::vec::Vec::new())
    }
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
mod glue {
    //! Host stand-ins so shared code paths compile off-target.

    /// Host stand-in: there is no global scheduler.
    pub fn timer_tick() {}

    /// Host stand-in: nothing to schedule.
    pub fn schedule() {}
}
