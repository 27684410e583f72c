//! Global system interrupts, backed by kernel semaphores.
//!
//! Every GSI owns one semaphore in the kernel PD. User SMs chain to it;
//! the interrupt path submits the semaphore. The IOAPIC/MSI register
//! programming itself lives behind [`GsiOps`], registered by the boot
//! layer.

use crate::config::NUM_GSI;
use crate::pd::Pd;
use crate::sm::Sm;
use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::{
    Mutex,
    Once,
};

/// Routing operations provided by the interrupt-controller driver.
#[derive(Debug, Copy, Clone)]
pub struct GsiOps {
    /// Whether the GSI is wired through an IOAPIC (as opposed to MSI).
    pub is_ioapic: fn(gsi: usize) -> bool,
    /// Programs polarity/trigger overrides for an IOAPIC pin.
    pub set_polarity: fn(gsi: usize, level: bool, active_low: bool),
    /// Routes the GSI to the CPU for the given requester ID. Returns the
    /// MSI address/data pair for non-IOAPIC GSIs.
    pub route: fn(gsi: usize, cpu: usize, rid: u32) -> (u64, u64),
    /// Unmasks the GSI.
    pub unmask: fn(gsi: usize),
}

static OPS: Mutex<Option<GsiOps>> = Mutex::new(None);
static SMS: Once<Vec<&'static Sm>> = Once::new();

pub struct Gsi;

impl Gsi {
    /// Registers the routing driver.
    pub fn register(ops: GsiOps) {
        *OPS.lock() = Some(ops);
    }

    /// Creates the kernel semaphores. Requires the kernel PD.
    pub fn setup() {
        SMS.call_once(|| {
            (0..NUM_GSI)
                .map(|gsi| {
                    &*Box::leak(Sm::create(
                        Pd::kern(),
                        gsi as u64,
                        0,
                        core::ptr::null_mut(),
                        gsi as u64,
                    ))
                })
                .collect()
        });
    }

    pub fn sm(gsi: usize) -> Option<&'static Sm> {
        SMS.get().and_then(|sms| sms.get(gsi).copied())
    }

    /// Whether the SM is one of the kernel GSI semaphores; returns its
    /// GSI number.
    pub fn gsi_of(sm: &Sm) -> Option<usize> {
        let gsi = sm.value as usize;
        match Self::sm(gsi) {
            Some(known) if core::ptr::eq(known, sm) => Some(gsi),
            _ => None,
        }
    }

    pub fn is_ioapic(gsi: usize) -> bool {
        OPS.lock().map_or(false, |ops| (ops.is_ioapic)(gsi))
    }

    pub fn set_polarity(gsi: usize, level: bool, active_low: bool) {
        if let Some(ops) = *OPS.lock() {
            (ops.set_polarity)(gsi, level, active_low);
        }
    }

    pub fn route(gsi: usize, cpu: usize, rid: u32) -> (u64, u64) {
        OPS.lock().map_or((0, 0), |ops| (ops.route)(gsi, cpu, rid))
    }

    pub fn unmask(gsi: usize) {
        if let Some(ops) = *OPS.lock() {
            (ops.unmask)(gsi);
        }
    }

    /// Interrupt path: a GSI fired.
    pub fn handle(gsi: usize) {
        if let Some(sm) = Self::sm(gsi) {
            sm.submit();
        }
    }
}
