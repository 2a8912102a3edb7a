//! Structured fault dumps.
//!
//! The default exception handler funnels here: the register file, the
//! current task, a frame-pointer backtrace and the kernel-stack-overflow
//! heuristic are formatted through the kernel log before the CPU halts.

use core::fmt::Write;

use norn_core::kprint;

use super::{IrqContext, TaskSummary};

/// Guard window below a kernel stack treated as an overflow signature.
const STACK_GUARD_SIZE: u64 = 4096;

/// Register file at exception entry, in the stub's push order.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RegisterFile {
    /// General-purpose registers.
    pub rax: u64,
    /// See `rax`.
    pub rbx: u64,
    /// See `rax`.
    pub rcx: u64,
    /// See `rax`.
    pub rdx: u64,
    /// See `rax`.
    pub rsi: u64,
    /// See `rax`.
    pub rdi: u64,
    /// Frame pointer.
    pub rbp: u64,
    /// See `rax`.
    pub r8: u64,
    /// See `rax`.
    pub r9: u64,
    /// See `rax`.
    pub r10: u64,
    /// See `rax`.
    pub r11: u64,
    /// See `rax`.
    pub r12: u64,
    /// See `rax`.
    pub r13: u64,
    /// See `rax`.
    pub r14: u64,
    /// See `rax`.
    pub r15: u64,
    /// Instruction pointer at the fault.
    pub rip: u64,
    /// Stack pointer at the fault.
    pub rsp: u64,
    /// RFLAGS at the fault.
    pub rflags: u64,
}

/// Exception mnemonic for vectors 0..32.
pub const fn exception_name(vector: u8) -> &'static str {
    match vector {
        0x00 => "#DE divide error",
        0x01 => "#DB debug",
        0x02 => "NMI",
        0x03 => "#BP breakpoint",
        0x04 => "#OF overflow",
        0x05 => "#BR bound range",
        0x06 => "#UD invalid opcode",
        0x07 => "#NM device not available",
        0x08 => "#DF double fault",
        0x0A => "#TS invalid TSS",
        0x0B => "#NP segment not present",
        0x0C => "#SS stack fault",
        0x0D => "#GP general protection",
        0x0E => "#PF page fault",
        0x10 => "#MF x87 floating point",
        0x11 => "#AC alignment check",
        0x12 => "#MC machine check",
        0x13 => "#XM SIMD floating point",
        _ => "unknown exception",
    }
}

/// Walks a frame-pointer chain, collecting return addresses.
///
/// Each frame is `[saved rbp][return address]` at ascending addresses.
/// The walk stops at a null frame pointer, when `valid` rejects a frame
/// address, or when `out` is full. Returns the number of frames written.
///
/// # Safety
///
/// Every frame address accepted by `valid` must be readable memory
/// holding two `u64` values.
pub unsafe fn collect_backtrace(
    mut rbp: u64,
    out: &mut [u64],
    valid: impl Fn(u64) -> bool,
) -> usize {
    let mut count = 0;
    while count < out.len() && rbp != 0 && rbp % 8 == 0 && valid(rbp) {
        // SAFETY: `valid` accepted the frame address.
        let (next_rbp, ret) = unsafe {
            let p = rbp as *const u64;
            (p.read(), p.add(1).read())
        };
        if ret == 0 {
            break;
        }
        out[count] = ret;
        count += 1;
        if next_rbp <= rbp {
            // A frame chain must ascend; anything else is corruption.
            break;
        }
        rbp = next_rbp;
    }
    count
}

/// Returns `true` when the fault address is in the guard window below
/// the task's kernel stack, the signature of a kernel stack overflow.
pub fn is_stack_overflow(task: &TaskSummary, fault_addr: u64) -> bool {
    task.kstack_base != 0
        && fault_addr < task.kstack_base
        && task.kstack_base - fault_addr <= STACK_GUARD_SIZE
}

/// Formats the full dump into `out`.
pub fn write_dump(
    out: &mut dyn Write,
    ctx: &IrqContext,
    task: Option<&TaskSummary>,
    backtrace: &[u64],
) -> core::fmt::Result {
    let r = &ctx.regs;
    writeln!(
        out,
        "FAULT: {} (vector {:#04x}, error {:#x})",
        exception_name(ctx.vector),
        ctx.vector,
        ctx.error_code
    )?;
    if let Some(addr) = ctx.fault_addr {
        writeln!(out, "  fault address: {addr:#018x}")?;
    }
    match task {
        Some(task) => {
            let name_len = task.name.iter().position(|&b| b == 0).unwrap_or(16);
            let name = core::str::from_utf8(&task.name[..name_len]).unwrap_or("<invalid>");
            writeln!(out, "  task: {} (tid {})", name, task.tid)?;
            if let Some(addr) = ctx.fault_addr {
                if is_stack_overflow(task, addr) {
                    writeln!(out, "  likely KERNEL STACK OVERFLOW (guard page hit)")?;
                }
            }
        }
        None => writeln!(out, "  task: <none>")?,
    }
    writeln!(out, "  RIP={:#018x} RSP={:#018x} RFL={:#010x}", r.rip, r.rsp, r.rflags)?;
    writeln!(out, "  RAX={:#018x} RBX={:#018x} RCX={:#018x}", r.rax, r.rbx, r.rcx)?;
    writeln!(out, "  RDX={:#018x} RSI={:#018x} RDI={:#018x}", r.rdx, r.rsi, r.rdi)?;
    writeln!(out, "  RBP={:#018x} R8 ={:#018x} R9 ={:#018x}", r.rbp, r.r8, r.r9)?;
    writeln!(out, "  R10={:#018x} R11={:#018x} R12={:#018x}", r.r10, r.r11, r.r12)?;
    writeln!(out, "  R13={:#018x} R14={:#018x} R15={:#018x}", r.r13, r.r14, r.r15)?;
    if !backtrace.is_empty() {
        writeln!(out, "  backtrace:")?;
        for (i, addr) in backtrace.iter().enumerate() {
            writeln!(out, "    #{i}: {addr:#018x}")?;
        }
    }
    Ok(())
}

/// Prints the dump to the kernel log.
///
/// Backtraces are only collected on a kernel target, where the frame
/// chain lies in mapped kernel memory.
pub fn report(ctx: &IrqContext, task: Option<&TaskSummary>) {
    let mut frames = [0u64; 16];
    let mut count = {
        #[cfg(all(target_os = "none", target_arch = "x86_64"))]
        {
            // SAFETY: Kernel frame pointers stay within the mapped kernel
            // half; the validity filter rejects user addresses.
            unsafe {
                collect_backtrace(ctx.regs.rbp, &mut frames, |a| {
                    a >= norn_core::addr::DIRECT_MAP_BASE
                })
            }
        }
        #[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
        {
            let _ = &mut frames;
            0
        }
    };
    // A return address outside .text means the chain left Rust code;
    // everything after it is noise.
    if let Some(bad) = frames[..count]
        .iter()
        .position(|&ret| !crate::arch::x86_64::layout::text_contains(ret))
    {
        count = bad;
    }

    struct LogSink;
    impl Write for LogSink {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            kprint!("{s}");
            Ok(())
        }
    }
    let _ = write_dump(&mut LogSink, ctx, task, &frames[..count]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_names() {
        assert_eq!(exception_name(0x0E), "#PF page fault");
        assert_eq!(exception_name(0x08), "#DF double fault");
        assert_eq!(exception_name(0x1F), "unknown exception");
    }

    #[test]
    fn backtrace_walks_fake_chain() {
        // Build three frames in a buffer: each is [next_rbp][ret].
        let mut stack = [0u64; 16];
        let base = stack.as_ptr() as u64;
        // Frame 0 at slot 0, frame 1 at slot 4, frame 2 at slot 8.
        stack[0] = base + 4 * 8; // next rbp
        stack[1] = 0x1111; // ret
        stack[4] = base + 8 * 8;
        stack[5] = 0x2222;
        stack[8] = 0; // chain end
        stack[9] = 0x3333;

        let mut out = [0u64; 8];
        let range = base..base + (16 * 8);
        // SAFETY: The filter confines the walk to the buffer.
        let n = unsafe { collect_backtrace(base, &mut out, |a| range.contains(&a)) };
        assert_eq!(n, 3);
        assert_eq!(&out[..3], &[0x1111, 0x2222, 0x3333]);
    }

    #[test]
    fn backtrace_stops_at_invalid_frame() {
        let mut stack = [0u64; 4];
        let base = stack.as_ptr() as u64;
        stack[0] = 0xDEAD_0000; // next rbp outside the valid range
        stack[1] = 0xAAAA;

        let mut out = [0u64; 8];
        let range = base..base + (4 * 8);
        // SAFETY: The filter confines the walk to the buffer.
        let n = unsafe { collect_backtrace(base, &mut out, |a| range.contains(&a)) };
        assert_eq!(n, 1);
        assert_eq!(out[0], 0xAAAA);
    }

    #[test]
    fn backtrace_of_null_rbp_is_empty() {
        let mut out = [0u64; 4];
        // SAFETY: A null frame pointer is rejected before any read.
        let n = unsafe { collect_backtrace(0, &mut out, |_| true) };
        assert_eq!(n, 0);
    }

    #[test]
    fn overflow_heuristic() {
        let task = TaskSummary {
            tid: 3,
            name: *b"worker\0\0\0\0\0\0\0\0\0\0",
            kstack_base: 0x1_0000,
            kstack_size: 0x2000,
        };
        // Just below the base: overflow.
        assert!(is_stack_overflow(&task, 0xFFF8));
        assert!(is_stack_overflow(&task, 0xF000));
        // Below the guard page: unrelated fault.
        assert!(!is_stack_overflow(&task, 0xEFFF));
        // Inside the stack: unrelated.
        assert!(!is_stack_overflow(&task, 0x1_1000));
    }

    #[test]
    fn dump_contains_key_lines() {
        let mut ctx = IrqContext::default();
        ctx.vector = 0x0E;
        ctx.error_code = 0x2;
        ctx.fault_addr = Some(0xF000);
        ctx.regs.rip = 0xFFFF_FFFF_8010_1234;

        let task = TaskSummary {
            tid: 7,
            name: *b"init\0\0\0\0\0\0\0\0\0\0\0\0",
            kstack_base: 0x1_0000,
            kstack_size: 0x2000,
        };

        let mut out = String::new();
        write_dump(&mut out, &ctx, Some(&task), &[0x1234, 0x5678]).unwrap();
        assert!(out.contains("#PF page fault"));
        assert!(out.contains("task: init (tid 7)"));
        assert!(out.contains("KERNEL STACK OVERFLOW"));
        assert!(out.contains("RIP=0xffffffff80101234"));
        assert!(out.contains("#0: 0x0000000000001234"));
    }
}
