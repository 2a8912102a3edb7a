//! Process and kernel-thread creation.
//!
//! [`create_initial_process`] loads an ELF from the filesystem into a
//! fresh [`MemoryMap`], allocates the user stack VMA and builds the
//! startup stack; the resulting [`Process`] is entered by the scheduler
//! through the initial-task trampoline. Kernel threads get a two-page
//! kernel stack pre-seeded so the first context switch lands in
//! [`kernel_thread_trampoline`](crate::arch::x86_64::context::kernel_thread_trampoline).
//!
//! In this version a single user process exists at a time and no two
//! threads share a memory map, so the current process lives behind one
//! IRQ-saving lock.

pub mod elf;
pub mod stack;

use alloc::boxed::Box;
use alloc::vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use norn_core::addr::VirtAddr;
use norn_core::sync::IrqSpinLock;
use norn_fs::FsError;
use norn_fs::fd::{FdTable, File};
use norn_fs::vfs::{Dentry, NULL_DEV_OPS};
use norn_mm::vma::{MemoryMap, VmFlags};
use norn_mm::{FrameSource, MmError, PAGE_SIZE};
use norn_sched::thread::{KernelStack, Thread};

use crate::arch::PageTableMapper;
use crate::arch::x86_64::context::{kernel_thread_trampoline, seed_switch_frame};
use elf::LoadedImage;
use stack::{AT_ENTRY, AT_PAGESZ, AT_RANDOM, AuxEntry, StackCreator, StackError};

/// Top of the user stack (one page below the canonical hole).
pub const USER_STACK_TOP: u64 = 0x7FFF_FFFF_F000;

/// User stack size: 80 KiB.
pub const USER_STACK_SIZE: usize = 80 * 1024;

/// The page-table mapper user processes run on.
pub type ProcessMap = MemoryMap<PageTableMapper>;

/// Errors from process creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// Filesystem lookup or read failed.
    Fs(FsError),
    /// The executable image is malformed.
    InvalidElf,
    /// Memory allocation or mapping failed.
    Mm(MmError),
    /// The startup stack did not fit its VMA.
    Stack(StackError),
}

impl From<FsError> for ProcError {
    fn from(e: FsError) -> Self {
        Self::Fs(e)
    }
}

impl From<MmError> for ProcError {
    fn from(e: MmError) -> Self {
        Self::Mm(e)
    }
}

impl From<elf::InvalidElf> for ProcError {
    fn from(_: elf::InvalidElf) -> Self {
        Self::InvalidElf
    }
}

impl From<StackError> for ProcError {
    fn from(e: StackError) -> Self {
        Self::Stack(e)
    }
}

/// A user process.
pub struct Process {
    /// The process memory map.
    pub mm: ProcessMap,
    /// Open file descriptors.
    pub fds: FdTable,
    /// Address registered by `set_tid_address`, if any.
    pub tid_address: Option<VirtAddr>,
    /// ELF entry point.
    pub entry: VirtAddr,
    /// Initial user stack pointer.
    pub user_sp: VirtAddr,
}

// SAFETY: A process is owned by one CPU at a time; the CURRENT_PROCESS
// lock serialises all access.
unsafe impl Send for Process {}

/// Copies `bytes` into user memory at `va` through the page table.
fn copy_to_user(
    mm: &ProcessMap,
    dm_offset: u64,
    va: VirtAddr,
    bytes: &[u8],
) -> Result<(), MmError> {
    let mut written = 0usize;
    while written < bytes.len() {
        let cursor = va + written as u64;
        let (phys, _) = mm.translate(cursor).ok_or(MmError::NotMapped)?;
        let page_rest = PAGE_SIZE - cursor.page_offset() as usize;
        let chunk = page_rest.min(bytes.len() - written);
        // SAFETY: `translate` resolved a mapped frame; the chunk stays
        // within that page.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes[written..].as_ptr(),
                (dm_offset + phys.as_u64()) as *mut u8,
                chunk,
            );
        }
        written += chunk;
    }
    Ok(())
}

/// Maps every loadable segment and copies its file bytes in.
///
/// Memory beyond `filesz` stays zero (fresh pages are zero-filled).
fn load_segments(
    mm: &mut ProcessMap,
    image: &LoadedImage,
    file: &[u8],
    frames: &mut impl FrameSource,
) -> Result<(), ProcError> {
    for seg in image.segments.iter() {
        let vma = mm.map(seg.vaddr, seg.memsz as usize, seg.flags, frames)?;
        mm.insert(vma);
        let data = &file[seg.offset as usize..(seg.offset + seg.filesz) as usize];
        copy_to_user(mm, frames.dm_offset(), seg.vaddr, data)?;
    }
    Ok(())
}

/// Pseudo-random bytes for `AT_RANDOM`.
///
/// A 64-bit xorshift seeded from the cycle counter; user libc only uses
/// these as stack-protector canaries.
fn random_bytes() -> [u8; 16] {
    let mut state = crate::arch::x86_64::instructions::tsc_ns() | 0x5DEECE66D;
    let mut out = [0u8; 16];
    for chunk in out.chunks_mut(8) {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        chunk.copy_from_slice(&state.to_le_bytes());
    }
    out
}

/// Builds a process from an in-memory executable image.
pub fn create_process_from_image(
    file: &[u8],
    argv: &[&str],
    envp: &[&str],
    frames: &mut impl FrameSource,
) -> Result<Process, ProcError> {
    let image = elf::parse(file)?;

    // Fresh top-level page table.
    let root = frames.alloc_page()?;
    // SAFETY: The frame was just allocated and is reachable at the
    // source's dm offset.
    unsafe {
        core::ptr::write_bytes((frames.dm_offset() + root.as_u64()) as *mut u8, 0, PAGE_SIZE);
    }
    let mut mm = MemoryMap::new(PageTableMapper::new(frames.dm_offset()), root);

    load_segments(&mut mm, &image, file, frames)?;

    // Anonymous rw stack VMA just below the canonical hole.
    let stack_base = VirtAddr::new(USER_STACK_TOP - USER_STACK_SIZE as u64);
    let stack_vma = mm.map(stack_base, USER_STACK_SIZE, VmFlags::RW, frames)?;
    mm.insert(stack_vma);

    // Build the startup stack in a scratch image, then copy it in.
    let mut scratch = vec![0u8; USER_STACK_SIZE];
    let creator = StackCreator::new(&mut scratch, stack_base)?;
    let random = random_bytes();
    let user_sp = creator.finalize(
        argv,
        envp,
        &[
            AuxEntry {
                key: AT_PAGESZ,
                value: PAGE_SIZE as u64,
            },
            AuxEntry {
                key: AT_ENTRY,
                value: image.entry.as_u64(),
            },
        ],
        &[(AT_RANDOM, &random)],
    )?;
    copy_to_user(&mm, frames.dm_offset(), stack_base, &scratch)?;

    Ok(Process {
        mm,
        fds: std_fd_table()?,
        tid_address: None,
        entry: image.entry,
        user_sp,
    })
}

/// A descriptor table with stdin/stdout/stderr wired to the console
/// device, so the first `openat` gets descriptor 3 as programs expect.
pub fn std_fd_table() -> Result<FdTable, FsError> {
    let mut fds = FdTable::new();
    for _ in 0..3 {
        fds.install(File::open(Dentry::chardev("console", NULL_DEV_OPS))?)?;
    }
    Ok(fds)
}

/// Loads an executable from the filesystem and builds its process.
pub fn create_initial_process(
    path: &str,
    argv: &[&str],
    envp: &[&str],
    frames: &mut impl FrameSource,
) -> Result<Process, ProcError> {
    let dentry = norn_fs::vfs::resolve(path)?;
    create_process_from_image(&dentry.content, argv, envp, frames)
}

/// Creates a kernel thread whose first switch enters `entry`.
///
/// `stack` is the writable view of the thread's kernel stack pages and
/// `stack_base` their virtual base address (identical through the direct
/// map in the kernel).
pub fn create_kernel_thread(
    name: &str,
    entry: fn(),
    stack_base: VirtAddr,
    stack: &mut [u8],
) -> Box<Thread> {
    let mut thread = Thread::new(name);
    let top = stack_base + stack.len() as u64;
    let sp = seed_switch_frame(stack, top, kernel_thread_trampoline as usize as u64);
    thread.arch.kernel_sp = sp.as_u64();
    thread.kstack = Some(KernelStack {
        base: stack_base,
        size: stack.len(),
    });
    thread.entry = Some(entry);
    thread
}

// ---------------------------------------------------------------------------
// Current process / thread glue
// ---------------------------------------------------------------------------

/// The (single) current user process.
static CURRENT_PROCESS: IrqSpinLock<Option<Process>> = IrqSpinLock::new(None);

/// Installs the current process.
pub fn set_current_process(process: Process) {
    *CURRENT_PROCESS.lock() = Some(process);
}

/// Removes and returns the current process.
pub fn take_current_process() -> Option<Process> {
    CURRENT_PROCESS.lock().take()
}

/// Executes a closure on the current process, if one exists.
pub fn with_current_process<R>(f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    CURRENT_PROCESS.lock().as_mut().map(f)
}

/// Registered accessor for the scheduler's current thread.
static CURRENT_THREAD_FN: AtomicPtr<()> = AtomicPtr::new(no_current_thread as *mut ());

fn no_current_thread() -> Option<NonNull<Thread>> {
    None
}

/// Registers the scheduler-side current-thread accessor.
pub fn register_current_thread_fn(f: fn() -> Option<NonNull<Thread>>) {
    CURRENT_THREAD_FN.store(f as *mut (), Ordering::Release);
}

fn current_thread() -> Option<NonNull<Thread>> {
    let ptr = CURRENT_THREAD_FN.load(Ordering::Acquire);
    // SAFETY: Only valid accessors are ever stored.
    let f: fn() -> Option<NonNull<Thread>> = unsafe { core::mem::transmute(ptr) };
    f()
}

/// Entry function of the current kernel thread, for the trampoline.
pub fn current_thread_entry() -> Option<fn()> {
    // SAFETY: The scheduler keeps the current thread alive.
    current_thread().and_then(|t| unsafe { t.as_ref() }.entry)
}

/// Terminates the current thread: marks it dead and reschedules forever.
pub fn exit_current_thread() -> ! {
    if let Some(t) = current_thread() {
        // SAFETY: The scheduler keeps the current thread alive.
        unsafe { (*t.as_ptr()).state = norn_sched::thread::ThreadState::Dead };
    }
    crate::boot::reschedule_forever()
}

#[cfg(test)]
mod tests {
    use super::*;
    use norn_core::addr::PhysAddr;
    use std::alloc::Layout;

    struct TestFrames {
        base: *mut u8,
        layout: Layout,
        pages: usize,
        next: usize,
    }

    impl TestFrames {
        fn new(pages: usize) -> Self {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: Non-zero, valid layout.
            let base = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!base.is_null());
            Self {
                base,
                layout,
                pages,
                next: 0,
            }
        }
    }

    impl Drop for TestFrames {
        fn drop(&mut self) {
            // SAFETY: Allocated with the stored layout.
            unsafe { std::alloc::dealloc(self.base, self.layout) };
        }
    }

    impl FrameSource for TestFrames {
        fn alloc_page(&mut self) -> Result<PhysAddr, MmError> {
            if self.next == self.pages {
                return Err(MmError::OutOfMemory);
            }
            let addr = PhysAddr::new((self.next * PAGE_SIZE) as u64);
            self.next += 1;
            Ok(addr)
        }

        fn free_page(&mut self, _page: PhysAddr) {}

        fn dm_offset(&self) -> u64 {
            self.base as u64
        }
    }

    /// Reads one byte of user memory through the page table.
    fn read_user_u8(p: &Process, frames: &TestFrames, va: u64) -> u8 {
        let (phys, _) = p.mm.translate(VirtAddr::new(va)).unwrap();
        // SAFETY: phys points into the TestFrames buffer.
        unsafe { *((frames.dm_offset() + phys.as_u64()) as *const u8) }
    }

    fn read_user_u64(p: &Process, frames: &TestFrames, va: u64) -> u64 {
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = read_user_u8(p, frames, va + i as u64);
        }
        u64::from_le_bytes(bytes)
    }

    #[test]
    fn process_from_elf_image() {
        let code: Vec<u8> = (0..128u32).map(|i| i as u8).collect();
        let image = elf::tests::build_elf(0x40_0080, &[(0x40_0000, 5, &code, 128)]);
        let mut frames = TestFrames::new(256);

        let p = create_process_from_image(&image, &["/bin/init"], &[], &mut frames).unwrap();
        assert_eq!(p.entry.as_u64(), 0x40_0080);

        // The heap markers start collapsed at the fixed base.
        assert_eq!(p.mm.brk.start.as_u64(), 0x8000_0000);
        assert_eq!(p.mm.brk.end.as_u64(), 0x8000_0000);

        // Code bytes arrived at their destination.
        for off in [0u64, 1, 63, 127] {
            assert_eq!(read_user_u8(&p, &frames, 0x40_0000 + off), off as u8);
        }

        // The code VMA carries r-x, the stack VMA rw-.
        let code_vma = p.mm.find(VirtAddr::new(0x40_0000)).unwrap();
        assert_eq!(code_vma.flags, VmFlags::READ | VmFlags::EXEC);
        let stack_vma = p
            .mm
            .find(VirtAddr::new(USER_STACK_TOP - 0x1000))
            .unwrap();
        assert_eq!(stack_vma.flags, VmFlags::RW);
        assert_eq!(stack_vma.len(), USER_STACK_SIZE as u64);

        // The startup stack: aligned SP, argc, argv[0] dereferences.
        let sp = p.user_sp.as_u64();
        assert_eq!(sp % 16, 0);
        assert_eq!(read_user_u64(&p, &frames, sp), 1);
        let argv0 = read_user_u64(&p, &frames, sp + 8);
        let expected = b"/bin/init\0";
        for (i, &b) in expected.iter().enumerate() {
            assert_eq!(read_user_u8(&p, &frames, argv0 + i as u64), b);
        }
    }

    #[test]
    fn bss_is_zero_filled() {
        let data = [0xFFu8; 16];
        let image = elf::tests::build_elf(0x40_0000, &[(0x60_0000, 6, &data, 0x2000)]);
        let mut frames = TestFrames::new(256);
        let p = create_process_from_image(&image, &[], &[], &mut frames).unwrap();

        // File bytes present, bss beyond them zero.
        assert_eq!(read_user_u8(&p, &frames, 0x60_0000), 0xFF);
        assert_eq!(read_user_u8(&p, &frames, 0x60_000F), 0xFF);
        assert_eq!(read_user_u8(&p, &frames, 0x60_0010), 0);
        assert_eq!(read_user_u8(&p, &frames, 0x60_1FFF), 0);
    }

    #[test]
    fn malformed_image_is_rejected() {
        let mut frames = TestFrames::new(64);
        let result = create_process_from_image(b"not an elf", &[], &[], &mut frames);
        assert_eq!(result.err(), Some(ProcError::InvalidElf));
    }

    #[test]
    fn kernel_thread_stack_seeding() {
        let mut stack = vec![0u8; 2 * PAGE_SIZE];
        let base = VirtAddr::new(0xFFFF_8880_0010_0000);
        fn entry() {}
        let thread = create_kernel_thread("worker", entry, base, &mut stack);

        assert_eq!(thread.name(), "worker");
        let kstack = thread.kstack.unwrap();
        assert_eq!(kstack.base, base);
        assert_eq!(kstack.size, 2 * PAGE_SIZE);
        // The saved SP sits one switch frame below the stack top.
        let frame = core::mem::size_of::<crate::arch::x86_64::context::SwitchFrame>();
        assert_eq!(thread.arch.kernel_sp, kstack.top().as_u64() - frame as u64);
        assert!(thread.entry.is_some());
    }
}
