//! End-to-end scenarios exercising the kernel core on the host: spaces,
//! delegation, IPC through portals, cross-CPU scheduling and object
//! retirement.

use crate::arch;
use crate::arch::HwEvent;
use crate::capability::capability_cast;
use crate::cpulocal::Cpu;
use crate::ec::{
    Continuation,
    Ec,
    EcCreation,
    Exit,
    ReturnPath,
};
use crate::kobject::Object;
use crate::pagetable::hpt::Hpt;
use crate::pd::Pd;
use crate::pt::Pt;
use crate::rcu::Rcu;
use crate::sc::Sc;
use crate::sm::Sm;
use crate::space::{
    SpaceMem,
    SpaceObj,
    Subspace,
};
use crate::syscall;
use crate::hazards::HZD_RCU;
use alloc::boxed::Box;
use libmuon::crd::{
    Crd,
    CrdKind,
};
use libmuon::hypercall::{
    Hypercall,
    Status,
};
use libmuon::mem::PAGE_BITS;
use libmuon::mtd::Mtd;
use spin::Once;

static ENV: Once<()> = Once::new();

/// Sets up kernel PD, root PD and the CPU-0 idle EC exactly once.
fn test_env() {
    ENV.call_once(|| {
        arch::with_cpu(0, || {
            Cpu::set_online(2);
            Pd::setup(false).unwrap();
            crate::gsi::Gsi::setup();
            crate::bootstrap::init_cpu(0).unwrap();
            SpaceObj::insert_root(Pd::root().kobj()).unwrap();
            Pd::root().make_current();
        });
    });
}

fn settle_rcu() {
    for _ in 0..6 {
        Rcu::update();
        if Cpu::hazard() & HZD_RCU != 0 {
            Rcu::quiet();
        }
    }
}

fn fresh_pd(sel: u64) -> &'static Pd {
    let pd = Box::leak(Pd::create(Pd::root(), sel, Pd::PERM_ALL, false).unwrap());
    pd
}

/// Scenario: map 4 KiB through the memory space, look it up, unmap it.
#[test]
fn test_memory_space_roundtrip() {
    let _guard = crate::test_util::lock();
    test_env();

    arch::with_cpu(0, || {
        let pd = fresh_pd(0x900);
        let vaddr = 0x1000u64;
        let paddr = 0xCAFE_0000u64;

        let cleanup = pd
            .mem()
            .insert(vaddr, 0, Hpt::PTE_P | Hpt::PTE_W, paddr)
            .unwrap();
        assert!(!cleanup.need_tlb_flush());

        let (phys, size) = pd.mem().lookup(vaddr).unwrap();
        assert_eq!(paddr, phys);
        assert_eq!(4096, size);

        let mut cleanup = pd.mem().insert(vaddr, 0, 0, 0).unwrap();
        assert!(cleanup.need_tlb_flush());
        assert!(pd.mem().lookup(vaddr).is_none());

        cleanup.ignore_tlb_flush();
        cleanup.release(&crate::kalloc::BuddyAlloc);
    });
}

/// Scenario: delegate a writable page from PD A to PD B, then revoke only
/// the write permission from A's side.
#[test]
fn test_delegate_then_revoke_write() {
    let _guard = crate::test_util::lock();
    test_env();

    arch::with_cpu(0, || {
        let pd_a = fresh_pd(0x901);
        let pd_b = fresh_pd(0x902);

        let page = 0x345u64; // page number, physical identity in the kernel PD

        // Seed A from the kernel PD.
        let mut cleanup = pd_a
            .delegate::<SpaceMem>(Pd::kern(), page, page, 0, 0x7, 0)
            .unwrap();
        cleanup.ignore_tlb_flush();
        cleanup.release(&crate::kalloc::BuddyAlloc);

        // A -> B with RWX.
        let del_window = Crd::new(CrdKind::Mem, page, 0, 0x7);
        let src_crd = Crd::new(CrdKind::Mem, page, 0, 0x7);
        let mapped = pd_b.del_crd(pd_a, del_window, src_crd, 0, 0).unwrap();
        assert_eq!(CrdKind::Mem, mapped.kind());
        assert_eq!(0x7, mapped.attr());

        let vaddr = page << PAGE_BITS;
        let mapping = pd_b.mem().hpt().lookup(vaddr);
        assert!(mapping.present());
        assert_ne!(0, mapping.attr & Hpt::PTE_W, "B must see the page writable");

        // Revoke W from A's subtree (children only).
        pd_a.rev_crd(Crd::new(CrdKind::Mem, page, 0, 0x2), false).unwrap();

        let mapping = pd_b.mem().hpt().lookup(vaddr);
        assert!(mapping.present(), "read permission survives");
        assert_eq!(0, mapping.attr & Hpt::PTE_W, "write permission is gone");

        // A's own node keeps its attributes; B's child lost W.
        let node_a = pd_a.mem().generic().tree_lookup(page, false);
        assert_eq!(0x7, unsafe { (*node_a).attr() });
        let node_b = pd_b.mem().generic().tree_lookup(page, false);
        assert_eq!(0x5, unsafe { (*node_b).attr() });
        unsafe {
            assert_eq!((*node_b).depth(), (*node_a).depth() + 1);
            // The child's physical range nests inside the parent's.
            assert!((*node_b).node_phys >= (*node_a).node_phys);
            assert!(
                (*node_b).node_phys + (*node_b).size()
                    <= (*node_a).node_phys + (*node_a).size()
            );
        }

        // Revoking the same range again is a no-op.
        pd_a.rev_crd(Crd::new(CrdKind::Mem, page, 0, 0x2), false).unwrap();
        assert!(pd_b.mem().hpt().lookup(vaddr).present());

        // Full self-revoke on A: B loses everything below A.
        pd_a.rev_crd(Crd::new(CrdKind::Mem, page, 0, 0x7), true).unwrap();
        assert!(!pd_b.mem().hpt().lookup(vaddr).present());
        assert!(pd_b.mem().generic().tree_lookup(page, false).is_null());
    });
}

/// Scenario: translate finds the image of a delegated region in the
/// receiver.
#[test]
fn test_translate_finds_ancestor_image() {
    let _guard = crate::test_util::lock();
    test_env();

    arch::with_cpu(0, || {
        let pd_a = fresh_pd(0x903);
        let pd_b = fresh_pd(0x904);

        let page = 0x500u64;

        let mut cleanup = pd_a
            .delegate::<SpaceMem>(Pd::kern(), page, page, 2, 0x7, 0)
            .unwrap();
        cleanup.ignore_tlb_flush();
        cleanup.release(&crate::kalloc::BuddyAlloc);

        // A -> B at a different base.
        let rcv_page = 0x700u64;
        let mapped = pd_b
            .del_crd(
                pd_a,
                Crd::new(CrdKind::Mem, rcv_page, 2, 0x7),
                Crd::new(CrdKind::Mem, page, 2, 0x7),
                0,
                0,
            )
            .unwrap();
        assert!(!mapped.is_null());

        // Translating B's region in A yields A's base again.
        let xlt = pd_a.xlt_crd(pd_b, Crd::new(CrdKind::Mem, 0, 0x1f, 0x1f), Crd::new(CrdKind::Mem, rcv_page, 0, 0x7));
        assert!(!xlt.is_null());
        assert_eq!(page, xlt.base());
    });
}

/// Kernel-originated event message round-trip: an exception turns into a
/// pseudo-call through the event portal, with MTD-selected register
/// transfer in both directions.
#[test]
fn test_portal_event_roundtrip() {
    let _guard = crate::test_util::lock();
    test_env();

    arch::with_cpu(0, || {
        let root = Pd::root();

        // Local handler EC with a UTCB, portal at event offset 3.
        let handler = Box::leak(
            Ec::create(
                root,
                0x910,
                root,
                0,
                0x100,
                0x4000_0000,
                0,
                EcCreation::default(),
            )
            .unwrap(),
        );
        SpaceObj::insert_root(handler.kobj()).unwrap();

        let caller = Box::leak(
            Ec::create(
                root,
                0x911,
                root,
                0,
                0x200,
                0x4000_1000,
                0,
                EcCreation {
                    global: true,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        SpaceObj::insert_root(caller.kobj()).unwrap();

        let pt = Box::leak(
            Pt::create(
                root,
                0x200 + 3,
                handler,
                Mtd::GPR_ACDB | Mtd::RIP_LEN,
                0x1234,
            )
            .unwrap(),
        );
        pt.set_id(0x77);
        SpaceObj::insert_root(pt.kobj()).unwrap();

        // The caller runs on its own SC.
        caller.set_continuation(Continuation::RetUser(ReturnPath::Iret));
        let caller_sc = Box::leak(Sc::create(root, 0x912, caller, 0, 10, 1000).unwrap());
        caller_sc.ready_enqueue(arch::rdtsc(), true);
        Sc::schedule(false);
        assert!(core::ptr::eq(Ec::current(), caller));

        {
            let regs = unsafe { caller.regs_mut() };
            regs.rax = 1;
            regs.rcx = 2;
            regs.rdx = 3;
            regs.rbx = 4;
            regs.rip = 0x4567;
            regs.inst_len = 2;
        }
        Cpu::clr_hazard(u32::MAX);

        let exit = syscall::handle_exception(3, 0, 0);

        // The handler runs at the portal IP with the caller's state in
        // its UTCB.
        assert_eq!(Exit::UserSysret, exit);
        assert!(core::ptr::eq(Ec::current(), handler));
        assert_eq!(0x1234, handler.regs().rip);
        assert_eq!(0x77, handler.regs().rdi, "portal id is delivered");

        let frame = handler.utcb().unwrap().frame();
        assert_eq!(1, frame.rax);
        assert_eq!(2, frame.rcx);
        assert_eq!(3, frame.rdx);
        assert_eq!(4, frame.rbx);
        assert_eq!(0x4567, frame.rip);

        // The handler writes a result and replies.
        {
            let utcb = unsafe { handler.utcb_mut() }.unwrap();
            let frame = utcb.frame_mut();
            frame.mtd = Mtd::GPR_ACDB;
            frame.rax = 42;
            utcb.set_counts(0, 0);

            let regs = unsafe { handler.regs_mut() };
            regs.rdi = Hypercall::Reply.val();
        }

        let exit = syscall::handle_syscall();

        assert_eq!(Exit::UserIret, exit);
        assert!(core::ptr::eq(Ec::current(), caller));

        let regs = caller.regs();
        assert_eq!(42, regs.rax, "handler result is visible");
        assert_eq!(2, regs.rcx);
        assert_eq!(3, regs.rdx);
        assert_eq!(4, regs.rbx, "untouched registers are restored");

        // The handler is an idle portal target again; the caller's SC
        // carried the whole round-trip.
        assert_eq!(Continuation::None_, handler.continuation());
        assert!(handler.rcap().is_none());
        assert!(caller.partner().is_none());
        assert!(core::ptr::eq(Sc::current().unwrap(), caller_sc));

        // Leave the CPU on its idle SC for the next test.
        Sc::schedule(true);
    });
}

/// Scenario 4: portal call round-trip through the `call` hypercall. A
/// global EC calls an idle local EC; payload travels caller to callee
/// and back; the caller resumes past the hypercall instruction.
#[test]
fn test_call_hypercall_roundtrip() {
    let _guard = crate::test_util::lock();
    test_env();

    arch::with_cpu(0, || {
        let root = Pd::root();

        let handler = Box::leak(
            Ec::create(
                root,
                0x980,
                root,
                0,
                0x300,
                0x4000_4000,
                0,
                EcCreation::default(),
            )
            .unwrap(),
        );
        SpaceObj::insert_root(handler.kobj()).unwrap();

        let caller = Box::leak(
            Ec::create(
                root,
                0x981,
                root,
                0,
                0x400,
                0x4000_5000,
                0,
                EcCreation {
                    global: true,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        SpaceObj::insert_root(caller.kobj()).unwrap();

        let pt = Box::leak(Pt::create(root, 0x985, handler, Mtd::NONE, 0x2222).unwrap());
        pt.set_id(0x99);
        SpaceObj::insert_root(pt.kobj()).unwrap();

        // The caller runs on its own SC.
        caller.set_continuation(Continuation::RetUser(ReturnPath::Sysret));
        let caller_sc = Box::leak(Sc::create(root, 0x986, caller, 0, 11, 1000).unwrap());
        caller_sc.ready_enqueue(arch::rdtsc(), true);
        Sc::schedule(false);
        assert!(core::ptr::eq(Ec::current(), caller));
        Cpu::clr_hazard(u32::MAX);

        // The entry layer saves RIP already past the two-byte hypercall
        // instruction, as the SYSCALL microcode does.
        const CALL_IP: u64 = 0x7000;
        const INSN_LEN: u64 = 2;
        {
            let regs = unsafe { caller.regs_mut() };
            regs.rip = CALL_IP + INSN_LEN;
            regs.inst_len = INSN_LEN;
            regs.rdi = (0x985u64 << 8) | Hypercall::Call.val();
        }
        {
            let utcb = unsafe { caller.utcb_mut() }.unwrap();
            utcb.set_untyped_items(&[0xaa, 0xbb]);
        }

        let exit = syscall::handle_syscall();

        // The handler picked the call up at the portal IP, with the
        // portal id and the caller payload.
        assert_eq!(Exit::UserSysret, exit);
        assert!(core::ptr::eq(Ec::current(), handler));
        assert_eq!(0x2222, handler.regs().rip);
        assert_eq!(0x99, handler.regs().rdi);
        assert_eq!(&[0xaa, 0xbb], handler.utcb().unwrap().untyped_items());

        // The handler replies with a result payload.
        {
            let utcb = unsafe { handler.utcb_mut() }.unwrap();
            utcb.set_untyped_items(&[42]);

            let regs = unsafe { handler.regs_mut() };
            regs.rdi = Hypercall::Reply.val();
        }

        let exit = syscall::handle_syscall();

        assert_eq!(Exit::UserSysret, exit);
        assert!(core::ptr::eq(Ec::current(), caller));
        assert_eq!(&[42], caller.utcb().unwrap().untyped_items());

        // The caller resumes past the hypercall instruction.
        assert_eq!(CALL_IP + INSN_LEN, caller.regs().rip);

        // The linkage is fully torn down again.
        assert_eq!(Continuation::None_, handler.continuation());
        assert!(handler.rcap().is_none());
        assert!(caller.partner().is_none());

        // Leave the CPU on its idle SC for the next test.
        Sc::schedule(true);
    });
}

/// Scenario 5: an SC created for a foreign CPU lands in that CPU's
/// cross-CPU queue, wakes it, and is enqueued there.
#[test]
fn test_cross_cpu_enqueue() {
    let _guard = crate::test_util::lock();
    test_env();

    arch::with_cpu(0, || {
        let root = Pd::root();

        let ec = Box::leak(
            Ec::create(
                root,
                0x920,
                root,
                1,
                0,
                0,
                0,
                EcCreation {
                    global: true,
                    ..Default::default()
                },
            )
            .unwrap(),
        );

        let sc = Box::leak(Sc::create(root, 0x921, ec, 1, 10, 1000).unwrap());

        arch::drain_hw_events();
        sc.remote_enqueue(true);

        // The target CPU got a wake-up and the RRQ hazard.
        let events = arch::drain_hw_events();
        assert!(events.contains(&HwEvent::Nmi(1)));
        assert_ne!(0, Cpu::hazard_of(1) & crate::hazards::HZD_RRQ);

        // On the target's next kernel entry the SC enters the real run
        // queue.
        arch::with_cpu(1, || {
            Sc::rrq_handler();
        });
        assert!(sc.queued());
    });
}

/// Scenario: strict priority scheduling with round-robin inside one
/// priority.
#[test]
fn test_scheduler_strict_priority() {
    let _guard = crate::test_util::lock();
    test_env();

    arch::with_cpu(0, || {
        Cpu::clr_hazard(u32::MAX);
        let root = Pd::root();

        let make_runnable = |sel: u64, prio: u8| {
            let ec = Box::leak(
                Ec::create(
                    root,
                    sel,
                    root,
                    0,
                    0,
                    0,
                    0,
                    EcCreation {
                        global: true,
                        ..Default::default()
                    },
                )
                .unwrap(),
            );
            ec.set_continuation(Continuation::RetUser(ReturnPath::Sysret));
            &*Box::leak(Sc::create(root, sel + 1, ec, 0, prio, 1000).unwrap())
        };

        let low = make_runnable(0x930, 5);
        let high = make_runnable(0x932, 9);
        let high2 = make_runnable(0x934, 9);

        low.ready_enqueue(arch::rdtsc(), true);
        high.ready_enqueue(arch::rdtsc(), true);
        high2.ready_enqueue(arch::rdtsc(), true);

        // Highest priority first; round-robin between equals.
        Sc::schedule(false);
        assert!(core::ptr::eq(Sc::current().unwrap(), high));

        Sc::schedule(false);
        assert!(core::ptr::eq(Sc::current().unwrap(), high2));

        Sc::schedule(false);
        assert!(core::ptr::eq(Sc::current().unwrap(), high));

        // Drop both high SCs; the low one finally runs.
        Sc::schedule(true);
        assert!(core::ptr::eq(Sc::current().unwrap(), high2));
        Sc::schedule(true);
        assert!(core::ptr::eq(Sc::current().unwrap(), low));

        // Park the low SC as well so later tests start from idle.
        Sc::schedule(true);
    });
}

/// Scenario 6: the last capability is revoked on CPU 0 while CPU 1 still
/// holds a reference. The free callback runs exactly once, and only after
/// both CPUs have passed a quiescent state.
#[test]
fn test_object_revocation_retires() {
    let _guard = crate::test_util::lock();
    test_env();

    arch::with_cpu(0, || {
        Cpu::set_online(2);
        let root = Pd::root();

        let sm = Box::leak(Sm::create(root, 0x940, 0, core::ptr::null_mut(), 0));
        SpaceObj::insert_root(sm.kobj()).unwrap();

        // CPU 1 takes a transient reference that outlives the revoke.
        // With the count held, the reclamation callback signals the
        // semaphore instead of dropping the memory, which makes the
        // grace-period boundary observable.
        let held = arch::with_cpu(1, || crate::kobject::Refptr::new(&*sm).unwrap());

        // The capability resolves before the revoke.
        assert!(capability_cast::<Sm>(root.obj().lookup(0x940), 0).is_some());

        root.rev_crd(Crd::new(CrdKind::Obj, 0x940, 0, 0x1f), true).unwrap();

        // The slot reads as null; the object space never faults.
        assert!(capability_cast::<Sm>(root.obj().lookup(0x940), 0).is_none());

        // Revoking again is a no-op.
        root.rev_crd(Crd::new(CrdKind::Obj, 0x940, 0, 0x1f), true).unwrap();

        // CPU 0 alone cannot finish the grace period.
        settle_rcu();
        assert_eq!(0, sm.reset(), "no reclamation before CPU 1 quiesces");

        // Once CPU 1 passes through quiescent states as well, the
        // callback fires, exactly once.
        let mut fired = 0;
        for _ in 0..10 {
            arch::with_cpu(1, || {
                Rcu::update();
                if Cpu::hazard() & HZD_RCU != 0 {
                    Rcu::quiet();
                }
            });
            Rcu::update();
            if Cpu::hazard() & HZD_RCU != 0 {
                Rcu::quiet();
            }
            fired += sm.reset();
        }
        assert_eq!(1, fired, "the free callback ran exactly once");

        // Dropping the transient reference retires the object for good
        // after another grace period.
        drop(held);
        for _ in 0..10 {
            arch::with_cpu(1, || {
                Rcu::update();
                if Cpu::hazard() & HZD_RCU != 0 {
                    Rcu::quiet();
                }
            });
            Rcu::update();
            if Cpu::hazard() & HZD_RCU != 0 {
                Rcu::quiet();
            }
        }
    });
}

/// Status codes travel in the low byte of the first register.
#[test]
fn test_bad_hypercall_status() {
    let _guard = crate::test_util::lock();
    test_env();

    arch::with_cpu(0, || {
        let root = Pd::root();

        let ec = Box::leak(
            Ec::create(
                root,
                0x950,
                root,
                0,
                0,
                0x4000_3000,
                0,
                EcCreation {
                    global: true,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        ec.set_continuation(Continuation::RetUser(ReturnPath::Sysret));
        ec.make_current();
        Cpu::clr_hazard(u32::MAX);

        // Call through an empty selector: BAD_CAP.
        unsafe { ec.regs_mut() }.rdi = (0xdead << 8) | Hypercall::Call.val();
        let exit = syscall::handle_syscall();
        assert_eq!(Exit::UserSysret, exit);
        assert_eq!(Status::BadCap, Status::from(ec.regs().rdi));
    });
}

/// Semaphores: counts are consumed without blocking; empty semaphores
/// block the EC until an up, FIFO order.
#[test]
fn test_semaphore_block_and_wake() {
    let _guard = crate::test_util::lock();
    test_env();

    arch::with_cpu(0, || {
        Cpu::clr_hazard(u32::MAX);
        let root = Pd::root();

        let sm = Box::leak(Sm::create(root, 0x960, 1, core::ptr::null_mut(), 0));

        let waiter = Box::leak(
            Ec::create(
                root,
                0x961,
                root,
                0,
                0,
                0,
                0,
                EcCreation {
                    global: true,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        waiter.set_continuation(Continuation::RetUser(ReturnPath::Sysret));

        // Keep something runnable around for when the waiter blocks.
        let dummy = Box::leak(
            Ec::create(
                root,
                0x963,
                root,
                0,
                0,
                0,
                0,
                EcCreation {
                    global: true,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        dummy.set_continuation(Continuation::RetUser(ReturnPath::Sysret));
        let dummy_sc = Box::leak(Sc::create(root, 0x964, dummy, 0, 1, 1000).unwrap());
        dummy_sc.ready_enqueue(arch::rdtsc(), true);

        // The initial count is consumed without blocking.
        assert!(!sm.dn(false, 0, waiter, true));
        assert!(!waiter.blocked());

        // The next down blocks the waiter and schedules away.
        assert!(sm.dn(false, 0, waiter, true));
        assert!(waiter.blocked());

        // Up wakes it again.
        sm.up(None, None);
        assert!(!waiter.blocked());
    });
}

/// A bounded semaphore wait wakes the EC with a timeout status once the
/// deadline passes.
#[test]
fn test_semaphore_timeout() {
    let _guard = crate::test_util::lock();
    test_env();

    arch::with_cpu(0, || {
        Cpu::clr_hazard(u32::MAX);
        let root = Pd::root();

        let sm = Box::leak(Sm::create(root, 0x970, 0, core::ptr::null_mut(), 0));

        let waiter = Box::leak(
            Ec::create(
                root,
                0x971,
                root,
                0,
                0,
                0,
                0,
                EcCreation {
                    global: true,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        waiter.set_continuation(Continuation::RetUser(ReturnPath::Sysret));

        let dummy = Box::leak(
            Ec::create(
                root,
                0x973,
                root,
                0,
                0,
                0,
                0,
                EcCreation {
                    global: true,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        dummy.set_continuation(Continuation::RetUser(ReturnPath::Sysret));
        let dummy_sc = Box::leak(Sc::create(root, 0x974, dummy, 0, 1, 1000).unwrap());
        dummy_sc.ready_enqueue(arch::rdtsc(), true);

        // Block with a deadline that is already close; the fake TSC only
        // moves forward.
        let deadline = arch::rdtsc() + 1;
        assert!(sm.dn(false, deadline, waiter, true));
        assert!(waiter.blocked());
        assert!(waiter.timeout.active());

        crate::timeout::Timeout::check();

        assert!(!waiter.blocked(), "the timeout released the waiter");
        assert!(!waiter.timeout.active());
        assert_eq!(
            Continuation::SysFinish(Status::ComTim, false),
            waiter.continuation()
        );
    });
}
