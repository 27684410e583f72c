//! Kernel bring-up: wiring the core together once the boot layer has the
//! machine in a sane state.

use crate::cmdline::Cmdline;
use crate::console;
use crate::cpulocal::Cpu;
use crate::ec::{
    Continuation,
    Ec,
    ReturnPath,
};
use crate::gsi::Gsi;
use crate::kobject::Object;
use crate::pd::Pd;
use crate::sc::Sc;
use crate::space::SpaceObj;
use alloc::boxed::Box;
use libmuon::consts::{
    ROOT_EC_SEL,
    ROOT_PD_SEL,
    ROOT_SC_SEL,
};
use libmuon::hypercall::Status;
use libmuon::qpd::Qpd;
use log::info;

/// One-time setup on the bootstrap CPU. The boot layer has parsed the
/// command line and counted the CPUs.
pub fn init_bsp(cmdline: &str, online_cpus: usize) -> Result<(), Status> {
    let opts = Cmdline::parse(cmdline);

    console::init(if opts.verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Info
    });

    Cpu::set_online(online_cpus);

    crate::arch::set_vmx(!opts.novmx);

    Pd::setup(!opts.nopcid).map_err(|_| Status::BadPar)?;
    Gsi::setup();

    init_cpu(0)?;

    info!("muon core up ({} CPUs)", online_cpus);
    Ok(())
}

/// Per-CPU setup: the idle EC and its always-enqueued SC.
pub fn init_cpu(cpu: usize) -> Result<(), Status> {
    Ec::setup_idle(cpu)?;

    let idle = Ec::remote(cpu).expect("idle EC just created");
    let sc = Sc::create(Pd::kern(), cpu as u64, idle, cpu, 0, u64::MAX).ok_or(Status::BadCap)?;
    let sc = Box::leak(sc);

    if cpu == Cpu::id() {
        sc.ready_enqueue(crate::arch::rdtsc(), true);
    } else {
        sc.remote_enqueue(true);
    }

    Ok(())
}

/// Creates the roottask's PD/EC/SC triple and schedules it. The boot
/// layer loaded the roottask image and knows its entry point.
pub fn launch_root(entry_ip: u64, stack: u64, utcb: u64) -> Result<(), Status> {
    let root = Pd::root();

    SpaceObj::insert_root(root.kobj()).map_err(|_| Status::BadPar)?;
    root.make_current();

    let ec = Ec::create(
        root,
        ROOT_EC_SEL,
        root,
        Cpu::id(),
        0,
        utcb,
        stack,
        crate::ec::EcCreation {
            global: true,
            ..Default::default()
        },
    )?;
    let ec = Box::leak(ec);

    // The roottask starts directly at its entry point; there is nobody to
    // send a startup message to.
    {
        let regs = unsafe { ec.regs_mut() };
        regs.set_ip(entry_ip);
        regs.set_pt(Cpu::id() as u64);
    }
    ec.set_continuation(Continuation::RetUser(ReturnPath::Sysret));

    SpaceObj::insert_root(ec.kobj()).map_err(|_| Status::BadPar)?;

    let sc = Sc::create(
        root,
        ROOT_SC_SEL,
        ec,
        Cpu::id(),
        Qpd::DEFAULT_PRIO as u8,
        Qpd::DEFAULT_QUANTUM * crate::arch::tsc_freq_khz() / 1000,
    )
    .ok_or(Status::BadCap)?;
    let sc = Box::leak(sc);

    SpaceObj::insert_root(sc.kobj()).map_err(|_| Status::BadPar)?;
    sc.ready_enqueue(crate::arch::rdtsc(), true);

    info!(
        "roottask: PD sel {} EC sel {} SC sel {} entry {:#x}",
        ROOT_PD_SEL, ROOT_EC_SEL, ROOT_SC_SEL, entry_ip
    );

    Ok(())
}
