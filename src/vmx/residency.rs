//! Ownership of a VMCS by physical CPUs.
//!
//! A VMCS may be current on at most one CPU. [`Vmcs::enter`] makes it current
//! on the calling CPU, evicting it from wherever it was, and returns a
//! [`VmcsGuard`] that keeps preemption off until it is dropped. The VMCS stays
//! current after the guard goes away so the next run on the same CPU skips
//! the reload.

use alloc::sync::Arc;

use super::as_vmx_err;
use super::host::VmxHost;
use super::structs::VmxRegion;
use super::vmcs::{VmcsField, WritableField};
use crate::{HostPhysAddr, Result, VmxError, VmxHal};

/// Where a VMCS is current, as seen from the calling CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Not current anywhere; the next load starts with VMLAUNCH.
    NotLoaded,
    /// Current on the calling CPU.
    LoadedLocal,
    /// Current on another CPU, which must VMCLEAR it first.
    LoadedRemote(usize),
}

/// A VMCS region together with its residency bookkeeping.
pub(crate) struct Vmcs<H: VmxHal> {
    region: VmxRegion<H>,
    host: Arc<VmxHost<H>>,
    resident_on: Option<usize>,
    launched: bool,
    depth: usize,
}

impl<H: VmxHal> Vmcs<H> {
    /// Allocates a revision-stamped VMCS in the clear state.
    pub fn new(host: Arc<VmxHost<H>>) -> Result<Self> {
        let region = VmxRegion::new(host.caps().revision_id, false)?;
        H::vmclear(region.phys_addr()).map_err(|_| VmxError::InvalidVmcsPtr)?;
        Ok(Self {
            region,
            host,
            resident_on: None,
            launched: false,
            depth: 0,
        })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.region.phys_addr()
    }

    pub fn host(&self) -> &Arc<VmxHost<H>> {
        &self.host
    }

    pub fn residency(&self) -> Residency {
        match self.resident_on {
            None => Residency::NotLoaded,
            Some(cpu) if cpu == H::current_cpu_id() => Residency::LoadedLocal,
            Some(cpu) => Residency::LoadedRemote(cpu),
        }
    }

    /// Makes this VMCS current on the calling CPU.
    ///
    /// Blocks until a remote owner has cleared it. Preemption stays disabled
    /// until the returned guard is dropped.
    pub fn enter(&mut self) -> Result<VmcsGuard<'_, H>> {
        H::preempt_disable();
        let cpu = H::current_cpu_id();
        if let Err(err) = self.load(cpu) {
            H::preempt_enable();
            return Err(err);
        }
        self.depth = 1;
        Ok(VmcsGuard { vmcs: self, cpu })
    }

    fn load(&mut self, cpu: usize) -> Result {
        let paddr = self.phys_addr();
        match self.resident_on {
            Some(owner) if owner != cpu => {
                self.host.evict_remote(owner, paddr);
                self.resident_on = None;
            }
            _ => {}
        }
        if self.resident_on.is_none() {
            // Cleared VMCSs are in the clear launch state.
            self.launched = false;
        }

        let percpu = self.host.cpu(cpu);
        if percpu.current_vmcs() != Some(paddr) {
            H::vmptrld(paddr).map_err(as_vmx_err::<H>)?;
            percpu.set_current_vmcs(Some(paddr));
            trace!("[VMX] CPU {} loaded VMCS {:#x}", cpu, paddr);
        }
        self.resident_on = Some(cpu);
        Ok(())
    }
}

impl<H: VmxHal> Drop for Vmcs<H> {
    fn drop(&mut self) {
        if self.resident_on.is_none() {
            return;
        }
        match self.enter() {
            Ok(guard) => {
                if let Err(err) = guard.destroy() {
                    error!("[VMX] failed to clear VMCS on drop: {:?}", err);
                }
            }
            Err(err) => error!("[VMX] failed to load VMCS on drop: {:?}", err),
        }
    }
}

/// Proof that a VMCS is current on this CPU with preemption disabled.
///
/// Every VMREAD and VMWRITE goes through a guard.
pub(crate) struct VmcsGuard<'a, H: VmxHal> {
    vmcs: &'a mut Vmcs<H>,
    cpu: usize,
}

impl<H: VmxHal> VmcsGuard<'_, H> {
    #[inline]
    pub fn read<F: VmcsField>(&self, field: F) -> Result<F::Value> {
        H::vmread(field.encoding())
            .map(F::decode)
            .map_err(as_vmx_err::<H>)
    }

    #[inline]
    pub fn write<F: WritableField>(&self, field: F, value: F::Value) -> Result {
        H::vmwrite(field.encoding(), F::encode(value)).map_err(as_vmx_err::<H>)
    }

    /// The CPU the VMCS is current on.
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn host(&self) -> &Arc<VmxHost<H>> {
        &self.vmcs.host
    }

    /// Whether the next entry uses VMRESUME.
    pub fn launched(&self) -> bool {
        self.vmcs.launched
    }

    pub fn mark_launched(&mut self) {
        self.vmcs.launched = true;
    }

    /// Nested acquisition; the VMCS is already current here.
    pub fn enter(&mut self) -> VmcsGuard<'_, H> {
        H::preempt_disable();
        self.vmcs.depth += 1;
        VmcsGuard {
            vmcs: &mut *self.vmcs,
            cpu: self.cpu,
        }
    }

    /// VMCLEARs the VMCS so that its memory can be released.
    ///
    /// Only the outermost guard may do this.
    pub fn destroy(self) -> Result {
        if self.vmcs.depth != 1 {
            return Err(VmxError::InvalidInput(alloc::format!(
                "VMCS destroyed while entered {} times",
                self.vmcs.depth
            )));
        }
        let paddr = self.vmcs.phys_addr();
        let percpu = self.vmcs.host.cpu(self.cpu);
        H::vmclear(paddr).map_err(as_vmx_err::<H>)?;
        if percpu.current_vmcs() == Some(paddr) {
            percpu.set_current_vmcs(None);
        }
        trace!("[VMX] CPU {} cleared VMCS {:#x}", self.cpu, paddr);
        self.vmcs.resident_on = None;
        self.vmcs.launched = false;
        Ok(())
    }
}

impl<H: VmxHal> Drop for VmcsGuard<'_, H> {
    fn drop(&mut self) {
        self.vmcs.depth -= 1;
        if self.vmcs.depth == 0 && self.vmcs.resident_on.is_some() {
            self.vmcs.resident_on = Some(self.cpu);
        }
        H::preempt_enable();
    }
}
