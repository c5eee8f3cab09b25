use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::RwLock;

use super::cpuid::{CpuidOverride, CpuidTable};
use super::exit::ExitHandlerTable;
use super::host::VmxHost;
use super::vcpu::VirtualCpu;
use crate::{HostPhysAddr, Result, VmxHal};

/// Virtual TPR policy of a guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TprPolicy {
    /// CR8 accesses are virtualized by the engine.
    pub enabled: bool,
    /// `run` returns [`ExitEvent::TprChanged`](super::ExitEvent::TprChanged)
    /// when the guest writes CR8.
    pub notify: bool,
}

/// How a [`Machine`] is set up.
#[derive(Debug, Clone, Default)]
pub struct MachineConfig {
    /// Root of the guest's EPT hierarchy, maintained by the caller.
    pub ept_root: HostPhysAddr,
    pub cpuid: CpuidTable,
    pub tpr: TprPolicy,
    /// VMX-preemption timer value armed before every entry, if any.
    pub preemption_timer: Option<u32>,
}

/// One guest: the vCPUs share its second-level address space and settings.
pub struct Machine<H: VmxHal> {
    host: Arc<VmxHost<H>>,
    ept_root: HostPhysAddr,
    /// Bumped every time guest-physical mappings change.
    ept_generation: AtomicU64,
    /// Physical CPUs that still hold translations of an older generation.
    ept_stale: Vec<AtomicBool>,
    cpuid: RwLock<CpuidTable>,
    tpr: RwLock<TprPolicy>,
    preemption_timer: Option<u32>,
    exits: ExitHandlerTable<H>,
}

impl<H: VmxHal> Machine<H> {
    /// EPT page-walk length, minus one, in bits 5:3 of the EPTP.
    const EPT_WALK_LENGTH: u64 = (4 - 1) << 3;

    pub fn new(host: Arc<VmxHost<H>>, config: MachineConfig) -> Result<Arc<Self>> {
        let exits = ExitHandlerTable::new();
        exits.validate()?;
        let ept_stale = (0..host.cpu_count()).map(|_| AtomicBool::new(false)).collect();
        let preemption_timer = config
            .preemption_timer
            .filter(|_| host.caps().preemption_timer);
        debug!(
            "[VMX] new machine, EPT root {:#x}, {} CPUID overrides",
            config.ept_root,
            config.cpuid.len()
        );
        Ok(Arc::new(Self {
            host,
            ept_root: config.ept_root,
            // Every vCPU starts at 0, so its first run invalidates.
            ept_generation: AtomicU64::new(1),
            ept_stale,
            cpuid: RwLock::new(config.cpuid),
            tpr: RwLock::new(config.tpr),
            preemption_timer,
            exits,
        }))
    }

    pub fn host(&self) -> &Arc<VmxHost<H>> {
        &self.host
    }

    /// EPT pointer: root, memory type and a 4-level walk.
    pub fn eptp(&self) -> u64 {
        self.ept_root.as_usize() as u64 | self.host.caps().eptp_memtype | Self::EPT_WALK_LENGTH
    }

    /// Declares every cached guest-physical translation stale.
    ///
    /// Each vCPU invalidates before it next enters the guest; any number of
    /// calls between two runs costs that vCPU a single INVEPT.
    pub fn invalidate_all(&self) {
        let generation = self.ept_generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("[VMX] EPT generation {}", generation);
    }

    pub fn ept_generation(&self) -> u64 {
        self.ept_generation.load(Ordering::Acquire)
    }

    /// Marks every CPU but `except` as needing a local INVEPT.
    pub(crate) fn mark_ept_stale(&self, except: usize) {
        for (cpu, stale) in self.ept_stale.iter().enumerate() {
            if cpu != except {
                stale.store(true, Ordering::Release);
            }
        }
    }

    /// Clears and returns the pending INVEPT flag of `cpu`.
    pub(crate) fn take_ept_stale(&self, cpu: usize) -> bool {
        self.ept_stale[cpu].swap(false, Ordering::AcqRel)
    }

    pub fn set_cpuid_override(
        &self,
        leaf: u32,
        subleaf: Option<u32>,
        action: CpuidOverride,
    ) -> Result {
        self.cpuid.write().set(leaf, subleaf, action)
    }

    pub fn remove_cpuid_override(&self, leaf: u32, subleaf: Option<u32>) -> bool {
        self.cpuid.write().remove(leaf, subleaf)
    }

    pub(crate) fn cpuid(&self) -> spin::RwLockReadGuard<'_, CpuidTable> {
        self.cpuid.read()
    }

    pub fn tpr_policy(&self) -> TprPolicy {
        *self.tpr.read()
    }

    pub fn set_tpr_policy(&self, policy: TprPolicy) {
        *self.tpr.write() = policy;
    }

    pub fn preemption_timer(&self) -> Option<u32> {
        self.preemption_timer
    }

    pub(crate) fn exits(&self) -> &ExitHandlerTable<H> {
        &self.exits
    }

    /// Creates vCPU `id` of this machine.
    pub fn create_vcpu(self: &Arc<Self>, id: u32) -> Result<VirtualCpu<H>> {
        VirtualCpu::new(self.clone(), id)
    }
}
