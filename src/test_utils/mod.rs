//! Test doubles for the host kernel and the VMX hardware.

pub mod mock;

use std::sync::Arc;

use crate::vmx::VmxExitReason;
use crate::{Machine, MachineConfig, VmxHost};

use self::mock::{MockGuest, MockHal, MockPlatform};

/// Brings up VMX on `cpus` simulated CPUs and routes IPIs to their mailboxes.
pub fn setup_host(platform: &MockPlatform, cpus: usize) -> Arc<VmxHost<MockHal>> {
    let host = VmxHost::<MockHal>::probe(cpus).unwrap();
    for cpu in 0..cpus {
        MockPlatform::bind_cpu(cpu);
        host.enable_current().unwrap();
    }
    MockPlatform::bind_cpu(0);
    let ipi_host = host.clone();
    platform.on_ipi(move |cpu| {
        ipi_host.cpu(cpu).drain_evictions();
    });
    host
}

pub fn setup_machine(platform: &MockPlatform, config: MachineConfig) -> Arc<Machine<MockHal>> {
    Machine::new(setup_host(platform, 1), config).unwrap()
}

/// A guest step exiting with `reason` after an instruction of `len` bytes.
pub fn exit_with(
    reason: VmxExitReason,
    qualification: u64,
    len: u32,
) -> impl FnOnce(&mut MockGuest) + Send + 'static {
    move |guest| guest.exit(reason, qualification, len)
}

/// `OUT DX, AL` or `IN AL, DX` style access of `size` bytes to `port`.
pub fn io_exit(port: u16, size: u8, is_in: bool) -> impl FnOnce(&mut MockGuest) + Send + 'static {
    let qualification = (port as u64) << 16 | (is_in as u64) << 3 | (size as u64 - 1);
    exit_with(VmxExitReason::IO_INSTRUCTION, qualification, 1)
}
