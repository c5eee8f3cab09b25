use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use super::asid::AsidSpace;
use super::caps::VmxCapabilities;
use super::percpu::{EvictRequest, VmxPerCpuState};
use crate::{HostPhysAddr, Result, VmxHal};

/// Spins before an unacknowledged eviction is reported.
const EVICT_WARN_SPINS: usize = 1 << 24;

/// Process-wide VMX state: capabilities, per-CPU states and the VPID space.
///
/// Built once at boot and shared by every [`Machine`](super::Machine).
pub struct VmxHost<H: VmxHal> {
    caps: VmxCapabilities,
    cpus: Vec<VmxPerCpuState<H>>,
    asids: AsidSpace,
}

impl<H: VmxHal> VmxHost<H> {
    pub fn new(caps: VmxCapabilities, cpu_count: usize) -> Arc<Self> {
        let asids = AsidSpace::new(caps.max_asid);
        Arc::new(Self {
            caps,
            cpus: (0..cpu_count).map(VmxPerCpuState::new).collect(),
            asids,
        })
    }

    /// Probes the capabilities on the current CPU and builds the host state.
    pub fn probe(cpu_count: usize) -> Result<Arc<Self>> {
        Ok(Self::new(VmxCapabilities::probe::<H>()?, cpu_count))
    }

    pub fn caps(&self) -> &VmxCapabilities {
        &self.caps
    }

    pub fn asids(&self) -> &AsidSpace {
        &self.asids
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Per-CPU state of `cpu_id`.
    ///
    /// # Panics
    ///
    /// Panics if `cpu_id` is not below [`VmxHost::cpu_count`].
    pub fn cpu(&self, cpu_id: usize) -> &VmxPerCpuState<H> {
        &self.cpus[cpu_id]
    }

    /// Turns on VMX on the calling CPU.
    pub fn enable_current(&self) -> Result<()> {
        self.cpu(H::current_cpu_id()).hardware_enable(&self.caps)
    }

    pub fn disable_current(&self) -> Result<()> {
        self.cpu(H::current_cpu_id()).hardware_disable()
    }

    /// Has `target` VMCLEAR `vmcs` and waits until it did.
    ///
    /// There is no timeout: a CPU that never answers is a platform failure.
    /// While waiting, the local mailbox is served so that two CPUs evicting
    /// from each other cannot deadlock.
    pub(crate) fn evict_remote(&self, target: usize, vmcs: HostPhysAddr) {
        let local = self.cpu(H::current_cpu_id());
        let ack = Arc::new(AtomicBool::new(false));
        self.cpu(target).post_eviction(EvictRequest {
            vmcs,
            ack: ack.clone(),
        });
        H::send_ipi(target);

        let mut spins = 0usize;
        while !ack.load(Ordering::Acquire) {
            local.drain_evictions();
            core::hint::spin_loop();
            spins += 1;
            if spins == EVICT_WARN_SPINS {
                warn!(
                    "[VMX] CPU {} still waiting for CPU {} to evict VMCS {:#x}",
                    local.cpu_id(),
                    target,
                    vmcs
                );
                spins = 0;
            }
        }
        debug!(
            "[VMX] CPU {} evicted VMCS {:#x} from CPU {}",
            local.cpu_id(),
            vmcs,
            target
        );
    }
}
