//! Narrow shims around privileged hardware access.
//!
//! Everything the kernel core needs from the machine goes through this
//! module: TSC reads, the current CPU number, IPIs, the one-shot timer and
//! TLB maintenance. Under `cfg(test)` each shim is a recording double, so
//! the rest of the kernel runs unmodified on the host.
//!
//! Device-level code (LAPIC/IOAPIC register programming, serial ports) is
//! not implemented here; the boot layer registers its implementations via
//! [`register_platform`].

use spin::Mutex;

/// IPI vectors the kernel core requests from the platform.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IpiVector {
    /// Drain the remote ready-queue (`Rq`) of the target CPU.
    Rrq,
    /// Remote kernel entry: take the hazard path (TLB shootdown, recall).
    Rke,
    /// RCU acceleration: pass through a quiescent state soon.
    Idl,
}

/// Function table the boot layer installs for operations that touch
/// platform devices. Plain function pointers: the console sink list is the
/// only place the kernel uses trait objects.
#[derive(Debug, Copy, Clone)]
pub struct PlatformOps {
    pub send_ipi: fn(cpu: usize, vector: IpiVector),
    pub send_nmi: fn(cpu: usize),
    /// Arm the one-shot timer of the given CPU for an absolute TSC deadline.
    pub set_timer: fn(deadline_tsc: u64),
    /// Calibrated TSC frequency in kHz.
    pub tsc_freq_khz: u64,
    /// Enter the ACPI sleep state (SLP_TYPa/SLP_TYPb). Returns false when
    /// the transition failed.
    pub suspend: fn(slp_typa: u8, slp_typb: u8) -> bool,
    /// The FACS waking vector programmed for resume.
    pub waking_vector: fn() -> u64,
}

/// ACPI suspend through the platform. Fails when no platform is
/// registered.
pub fn acpi_suspend(slp_typa: u8, slp_typb: u8) -> bool {
    PLATFORM.lock().map_or(false, |p| (p.suspend)(slp_typa, slp_typb))
}

pub fn waking_vector() -> u64 {
    PLATFORM.lock().map_or(0, |p| (p.waking_vector)())
}

static PLATFORM: Mutex<Option<PlatformOps>> = Mutex::new(None);

/// Whether VMX was detected and enabled during bring-up.
static FEAT_VMX: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(cfg!(test));

pub fn set_vmx(enabled: bool) {
    FEAT_VMX.store(enabled, core::sync::atomic::Ordering::SeqCst);
}

pub fn has_vmx() -> bool {
    FEAT_VMX.load(core::sync::atomic::Ordering::SeqCst)
}

/// Installs the platform operations. Called once by the boot layer before
/// the first hypercall can happen.
pub fn register_platform(ops: PlatformOps) {
    *PLATFORM.lock() = Some(ops);
}

pub fn tsc_freq_khz() -> u64 {
    PLATFORM.lock().map(|p| p.tsc_freq_khz).unwrap_or(1_000_000)
}

#[cfg(not(test))]
mod imp {
    use super::*;

    pub fn cpu_id() -> usize {
        // Each CPU writes its number into IA32_TSC_AUX during bring-up.
        unsafe { x86::msr::rdmsr(x86::msr::IA32_TSC_AUX) as usize }
    }

    pub fn rdtsc() -> u64 {
        unsafe { x86::time::rdtsc() }
    }

    pub fn send_ipi(cpu: usize, vector: IpiVector) {
        if let Some(ops) = *PLATFORM.lock() {
            (ops.send_ipi)(cpu, vector);
        }
    }

    pub fn send_nmi(cpu: usize) {
        if let Some(ops) = *PLATFORM.lock() {
            (ops.send_nmi)(cpu);
        }
    }

    pub fn set_timer(deadline_tsc: u64) {
        if let Some(ops) = *PLATFORM.lock() {
            (ops.set_timer)(deadline_tsc);
        }
    }

    pub fn enable_interrupts() {
        unsafe { x86::irq::enable() };
    }

    pub fn disable_interrupts() {
        unsafe { x86::irq::disable() };
    }

    pub fn pause() {
        core::hint::spin_loop();
    }

    /// Spins until the condition holds.
    pub fn busy_wait(mut cond: impl FnMut() -> bool) {
        while !cond() {
            pause();
        }
    }

    /// Reload CR3 with the given root and PCID bits.
    pub unsafe fn make_current(cr3: u64) {
        core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack));
    }

    pub fn read_cr2() -> u64 {
        let val: u64;
        unsafe { core::arch::asm!("mov {}, cr2", out(reg) val, options(nostack)) };
        val
    }

    pub unsafe fn write_cr2(val: u64) {
        core::arch::asm!("mov cr2, {}", in(reg) val, options(nostack));
    }

    pub fn clflush(addr: *const u8, size: usize) {
        for offset in (0..size).step_by(64) {
            unsafe {
                core::arch::asm!("clflush [{}]", in(reg) addr.add(offset), options(nostack));
            }
        }
    }

    /// Single-context INVEPT for the given EPT pointer.
    pub fn invept(eptp: u64) {
        let desc: [u64; 2] = [eptp, 0];
        unsafe {
            core::arch::asm!(
                "invept {}, [{}]",
                in(reg) 1u64, // single-context
                in(reg) &desc,
                options(nostack)
            );
        }
    }

    /// Single-context INVVPID for the given VPID.
    pub fn invvpid(vpid: u16) {
        let desc: [u64; 2] = [vpid as u64, 0];
        unsafe {
            core::arch::asm!(
                "invvpid {}, [{}]",
                in(reg) 1u64, // single-context
                in(reg) &desc,
                options(nostack)
            );
        }
    }

    /// Flush the entire TLB of the current CPU by reloading CR3.
    pub fn flush_tlb() {
        unsafe {
            core::arch::asm!(
                "mov {tmp}, cr3",
                "mov cr3, {tmp}",
                tmp = out(reg) _,
                options(nostack)
            );
        }
    }
}

#[cfg(test)]
mod imp {
    use super::*;
    use core::sync::atomic::{
        AtomicU64,
        Ordering,
    };
    use std::cell::Cell;
    use std::vec::Vec;

    std::thread_local! {
        static CPU_ID: Cell<usize> = Cell::new(0);
    }

    static TSC: AtomicU64 = AtomicU64::new(0);

    /// Everything the kernel asked the machine to do, for test inspection.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum HwEvent {
        Ipi(usize, IpiVector),
        Nmi(usize),
        Timer(u64),
        Cr3(u64),
        Invept(u64),
        Invvpid(u16),
        FlushTlb(usize),
    }

    pub static HW_EVENTS: Mutex<Vec<HwEvent>> = Mutex::new(Vec::new());

    /// Test helper: run a closure as the given CPU.
    pub fn with_cpu<R>(cpu: usize, f: impl FnOnce() -> R) -> R {
        CPU_ID.with(|c| {
            let prev = c.replace(cpu);
            let r = f();
            c.set(prev);
            r
        })
    }

    /// Test helper: drain the recorded hardware events.
    pub fn drain_hw_events() -> Vec<HwEvent> {
        core::mem::take(&mut *HW_EVENTS.lock())
    }

    pub fn cpu_id() -> usize {
        CPU_ID.with(|c| c.get())
    }

    pub fn rdtsc() -> u64 {
        // Strictly monotonic fake TSC.
        TSC.fetch_add(1000, Ordering::SeqCst) + 1000
    }

    pub fn send_ipi(cpu: usize, vector: IpiVector) {
        HW_EVENTS.lock().push(HwEvent::Ipi(cpu, vector));
    }

    pub fn send_nmi(cpu: usize) {
        HW_EVENTS.lock().push(HwEvent::Nmi(cpu));
    }

    pub fn set_timer(deadline_tsc: u64) {
        HW_EVENTS.lock().push(HwEvent::Timer(deadline_tsc));
    }

    pub fn enable_interrupts() {}

    pub fn disable_interrupts() {}

    pub fn pause() {}

    /// No remote CPUs run in hosted tests; the awaited action is recorded
    /// in [`HW_EVENTS`] instead.
    pub fn busy_wait(_cond: impl FnMut() -> bool) {}

    pub unsafe fn make_current(cr3: u64) {
        HW_EVENTS.lock().push(HwEvent::Cr3(cr3));
    }

    pub fn read_cr2() -> u64 {
        0
    }

    pub unsafe fn write_cr2(_val: u64) {}

    pub fn clflush(_addr: *const u8, _size: usize) {}

    pub fn invept(eptp: u64) {
        HW_EVENTS.lock().push(HwEvent::Invept(eptp));
    }

    pub fn invvpid(vpid: u16) {
        HW_EVENTS.lock().push(HwEvent::Invvpid(vpid));
    }

    pub fn flush_tlb() {
        HW_EVENTS.lock().push(HwEvent::FlushTlb(cpu_id()));
    }
}

pub use imp::*;
