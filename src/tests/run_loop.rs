//! The entry/exit loop: TLB maintenance, early returns and host state.

use crate::msr::Msr;
use crate::test_utils::mock::{MockEvent, MockHal, MockPlatform};
use crate::test_utils::{exit_with, io_exit, setup_host, setup_machine};
use crate::vmx::vmcs::VmcsHostNW;
use crate::{
    ExitEvent, Machine, MachineConfig, StateGroups, VmxError, VmxExitReason, VmxHal,
};

fn is_invept(event: &MockEvent) -> bool {
    matches!(event, MockEvent::Invept { .. })
}

fn is_invvpid(event: &MockEvent) -> bool {
    matches!(event, MockEvent::Invvpid { .. })
}

#[test]
fn test_invalidations_coalesce() {
    let platform = MockPlatform::install(1);
    let machine = setup_machine(&platform, MachineConfig::default());
    let mut vcpu = machine.create_vcpu(0).unwrap();

    assert_eq!(vcpu.run(), Ok(ExitEvent::Halted));
    assert_eq!(platform.count(is_invept), 1);
    assert_eq!(platform.count(is_invvpid), 1);

    platform.clear_events();
    for _ in 0..5 {
        machine.invalidate_all();
    }
    assert_eq!(vcpu.run(), Ok(ExitEvent::Halted));
    assert_eq!(
        platform.count(|e| *e
            == MockEvent::Invept {
                cpu: 0,
                eptp: machine.eptp()
            }),
        1
    );

    platform.clear_events();
    assert_eq!(vcpu.run(), Ok(ExitEvent::Halted));
    assert_eq!(platform.count(is_invept), 0);
    assert_eq!(platform.count(is_invvpid), 0);
}

#[test]
fn test_migration_refreshes_host_state_and_tlbs() {
    let platform = MockPlatform::install(2);
    let machine = Machine::new(setup_host(&platform, 2), MachineConfig::default()).unwrap();
    let mut vcpu = machine.create_vcpu(0).unwrap();
    let vmcs = platform.current_on(0).unwrap();

    // Invalidating on CPU 0 leaves CPU 1 with stale translations.
    assert_eq!(vcpu.run(), Ok(ExitEvent::Halted));
    assert_eq!(
        platform.vmcs_field(vmcs, VmcsHostNW::TR_BASE),
        MockHal::host_state().tr_base
    );

    MockPlatform::bind_cpu(1);
    platform.clear_events();
    assert_eq!(vcpu.run(), Ok(ExitEvent::Halted));
    assert_eq!(platform.count(|e| matches!(e, MockEvent::Invept { cpu: 1, .. })), 1);
    assert_eq!(platform.count(|e| matches!(e, MockEvent::Invvpid { cpu: 1, .. })), 1);
    assert_eq!(
        platform.vmcs_field(vmcs, VmcsHostNW::TR_BASE),
        MockHal::host_state().tr_base
    );
    assert_eq!(
        platform.vmcs_field(vmcs, VmcsHostNW::GDTR_BASE),
        MockHal::host_state().gdtr_base
    );

    platform.clear_events();
    assert_eq!(vcpu.run(), Ok(ExitEvent::Halted));
    assert_eq!(platform.count(is_invept), 0);
    assert_eq!(platform.count(is_invvpid), 0);

    // CPU 0 already flushed this generation.
    MockPlatform::bind_cpu(0);
    platform.clear_events();
    assert_eq!(vcpu.run(), Ok(ExitEvent::Halted));
    assert_eq!(platform.count(is_invept), 0);
    assert_eq!(platform.count(is_invvpid), 1);
}

#[test]
fn test_kick_returns_after_handled_exit() {
    let platform = MockPlatform::install(1);
    let machine = setup_machine(&platform, MachineConfig::default());
    let mut vcpu = machine.create_vcpu(0).unwrap();

    platform.push_guest(exit_with(VmxExitReason::EXTERNAL_INTERRUPT, 0, 0));
    platform.push_guest(exit_with(VmxExitReason::EXTERNAL_INTERRUPT, 0, 0));
    let kicker = vcpu.kicker();
    std::thread::spawn(move || kicker.kick()).join().unwrap();

    assert_eq!(vcpu.run(), Ok(ExitEvent::None));
    assert_eq!(platform.pending_guest_steps(), 1);
    // The kick is consumed.
    assert_eq!(vcpu.run(), Ok(ExitEvent::Halted));
    assert_eq!(platform.pending_guest_steps(), 0);
}

#[test]
fn test_kick_is_answered_by_any_return() {
    let platform = MockPlatform::install(1);
    let machine = setup_machine(&platform, MachineConfig::default());
    let mut vcpu = machine.create_vcpu(0).unwrap();

    platform.push_guest(io_exit(0x80, 1, false));
    platform.push_guest(exit_with(VmxExitReason::EXTERNAL_INTERRUPT, 0, 0));
    vcpu.kicker().kick();
    assert!(matches!(vcpu.run(), Ok(ExitEvent::IoAccess(_))));

    // The next run is not cut short by the old kick.
    assert_eq!(vcpu.run(), Ok(ExitEvent::Halted));
    assert_eq!(platform.pending_guest_steps(), 0);
}

#[test]
fn test_yield_returns_after_handled_exit() {
    let platform = MockPlatform::install(1);
    let machine = setup_machine(&platform, MachineConfig::default());
    let mut vcpu = machine.create_vcpu(0).unwrap();

    platform.push_guest(exit_with(VmxExitReason::WBINVD, 0, 2));
    platform.request_yield(1);
    assert_eq!(vcpu.run(), Ok(ExitEvent::None));
    assert_eq!(vcpu.get_state(StateGroups::GPRS).unwrap().rip, 0xfff2);
    assert_eq!(vcpu.run(), Ok(ExitEvent::Halted));
}

#[test]
fn test_host_state_survives_the_guest() {
    let platform = MockPlatform::install(1);
    let machine = setup_machine(&platform, MachineConfig::default());
    let mut vcpu = machine.create_vcpu(0).unwrap();
    let host_lstar = platform.msr(Msr::IA32_LSTAR as u32);
    MockHal::write_dr(0, 0xaaaa);
    MockHal::write_cr2(0xbbbb);

    let mut state = vcpu.get_state(StateGroups::ALL).unwrap();
    state.dr[0] = 0x1000;
    state.cr2 = 0x2000;
    state.xcr0 = 0x3;
    vcpu.set_state(&state, StateGroups::DRS | StateGroups::CRS).unwrap();

    platform.push_guest(|guest| {
        assert_eq!(MockHal::read_dr(0), 0x1000);
        assert_eq!(MockHal::read_cr2(), 0x2000);
        assert_eq!(MockHal::xcr0(), 0x3);
        assert!(!MockHal::irq_save_disable());
        MockHal::write_dr(0, 0x3000);
        MockHal::write_cr2(0x4000);
        MockHal::wrmsr(Msr::IA32_LSTAR as u32, 0xdead_0000);
        guest.exit(VmxExitReason::HLT, 0, 1);
    });
    assert_eq!(vcpu.run(), Ok(ExitEvent::Halted));

    assert_eq!(MockHal::read_dr(0), 0xaaaa);
    assert_eq!(MockHal::read_cr2(), 0xbbbb);
    assert_eq!(MockHal::xcr0(), 0x7);
    assert_eq!(platform.msr(Msr::IA32_LSTAR as u32), host_lstar);
    // Interrupts are enabled again.
    assert!(MockHal::irq_save_disable());
    MockHal::irq_restore(true);
    assert_eq!(MockPlatform::preempt_depth(), 0);

    let state = vcpu.get_state(StateGroups::DRS | StateGroups::CRS).unwrap();
    assert_eq!(state.dr[0], 0x3000);
    assert_eq!(state.cr2, 0x4000);
    assert_eq!(state.xcr0, 0x3);
}

#[test]
fn test_guest_state_cache_is_dropped_on_entry() {
    let platform = MockPlatform::install(1);
    let machine = setup_machine(&platform, MachineConfig::default());
    let mut vcpu = machine.create_vcpu(0).unwrap();

    vcpu.get_state(StateGroups::GPRS | StateGroups::SEGS).unwrap();
    assert_eq!(vcpu.cached_groups(), StateGroups::ALL);
    vcpu.run().unwrap();
    assert_eq!(vcpu.cached_groups(), StateGroups::empty());
    vcpu.get_state(StateGroups::GPRS).unwrap();
    assert_eq!(vcpu.cached_groups(), StateGroups::GPRS);
}

#[test]
fn test_failed_guest_state_is_reported() {
    let platform = MockPlatform::install(1);
    let machine = setup_machine(&platform, MachineConfig::default());
    let mut vcpu = machine.create_vcpu(0).unwrap();

    platform.push_guest(|guest| guest.fail_entry(VmxExitReason::INVALID_GUEST_STATE));
    assert_eq!(vcpu.run(), Ok(ExitEvent::InvalidState { code: 33 }));
    assert!(!vcpu.is_poisoned());
    // Still never launched, so the next entry is a VMLAUNCH again.
    platform.clear_events();
    assert_eq!(vcpu.run(), Ok(ExitEvent::Halted));
    assert!(platform.events().iter().any(|e| matches!(
        e,
        MockEvent::Entry {
            launched: false,
            ..
        }
    )));
}

#[test]
fn test_entry_failure_poisons_until_reset() {
    let platform = MockPlatform::install(1);
    let machine = setup_machine(&platform, MachineConfig::default());
    let mut vcpu = machine.create_vcpu(0).unwrap();

    // VM-instruction error 7: invalid control fields.
    platform.fail_next_entry(7);
    match vcpu.run() {
        Err(VmxError::EntryFailed(msg)) => {
            assert!(msg.starts_with("VMLAUNCH failed on CPU 0"), "{}", msg)
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert!(vcpu.is_poisoned());
    assert_eq!(vcpu.run(), Err(VmxError::VcpuPoisoned));
    assert_eq!(MockPlatform::preempt_depth(), 0);

    vcpu.reset().unwrap();
    assert!(!vcpu.is_poisoned());
    assert_eq!(vcpu.run(), Ok(ExitEvent::Halted));
}

#[test]
fn test_unexpected_exit_poisons() {
    let platform = MockPlatform::install(1);
    let machine = setup_machine(&platform, MachineConfig::default());
    let mut vcpu = machine.create_vcpu(0).unwrap();

    platform.push_guest(exit_with(VmxExitReason::RDTSC, 0, 2));
    assert_eq!(vcpu.run(), Err(VmxError::UnhandledExit(16)));
    assert_eq!(vcpu.run(), Err(VmxError::VcpuPoisoned));

    // A reason the processor does not define at all.
    vcpu.reset().unwrap();
    platform.push_guest(|guest| {
        guest.exit(VmxExitReason::HLT, 0, 1);
        guest.write(crate::vmx::vmcs::VmcsReadOnly32::EXIT_REASON, 35);
    });
    assert_eq!(vcpu.run(), Err(VmxError::UnhandledExit(35)));
    assert!(vcpu.is_poisoned());
}

#[test]
fn test_preemption_timer_is_armed() {
    let platform = MockPlatform::install(1);
    let config = MachineConfig {
        preemption_timer: Some(5000),
        ..Default::default()
    };
    let machine = setup_machine(&platform, config);
    assert_eq!(machine.preemption_timer(), Some(5000));
    let mut vcpu = machine.create_vcpu(0).unwrap();

    platform.push_guest(|guest| {
        assert_eq!(
            guest.read(crate::vmx::vmcs::VmcsGuest32::VMX_PREEMPTION_TIMER_VALUE),
            5000
        );
        guest.exit(VmxExitReason::PREEMPTION_TIMER, 0, 0);
    });
    assert_eq!(vcpu.run(), Ok(ExitEvent::None));
}
