//! Core of the Muon x86-64 microhypervisor.
//!
//! The crate is a library on purpose: the (out-of-tree) boot and arch layer
//! calls into [`syscall::dispatch`] on hypercall entry, [`ec_vmx`] on VM
//! exit and the page-fault handlers in [`space`]. All hardware access goes
//! through the narrow shims in [`arch`], which have recording doubles under
//! `cfg(test)` so the kernel logic runs and is tested on the host.

#![cfg_attr(not(test), no_std)]
#![deny(clippy::all)]
#![allow(
    clippy::new_without_default,
    clippy::missing_safety_doc,
    clippy::redundant_pub_crate
)]

#[allow(unused)]
#[cfg_attr(test, macro_use)]
#[cfg(test)]
extern crate std;

#[allow(unused)]
#[macro_use]
extern crate alloc;

pub mod arch;
pub mod bootstrap;
pub mod capability;
pub mod cmdline;
pub mod config;
pub mod console;
pub mod counter;
pub mod cpulocal;
pub mod cpuset;
pub mod ec;
pub mod ec_vmx;
pub mod gsi;
pub mod hazards;
pub mod kalloc;
pub mod kobject;
pub mod kp;
pub mod mdb;
pub mod pagetable;
pub mod pci;
pub mod pd;
pub mod pt;
pub mod rcu;
pub mod refcount;
pub mod regs;
pub mod sc;
pub mod sm;
pub mod space;
pub mod syscall;
pub mod timeout;
pub mod vmx;

#[cfg(test)]
mod tests;

#[cfg(test)]
pub(crate) mod test_util {
    use spin::{
        Mutex,
        MutexGuard,
    };

    /// Kernel state (RCU batches, scheduler queues, per-CPU blocks) is
    /// global; tests touching it take this lock to serialize.
    static GLOBAL: Mutex<()> = Mutex::new(());

    pub fn lock() -> MutexGuard<'static, ()> {
        GLOBAL.lock()
    }
}
