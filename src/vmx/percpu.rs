use alloc::collections::VecDeque;
use alloc::format;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bit_field::BitField;
use spin::Mutex;
use x86_64::registers::control::Cr4Flags;

use super::caps::VmxCapabilities;
use super::structs::{FeatureControl, FeatureControlFlags, VmxRegion};
use crate::msr::Msr;
use crate::{HostPhysAddr, Result, VmxError, VmxHal};

/// Request to VMCLEAR a VMCS that is current on another CPU.
#[derive(Debug)]
pub(crate) struct EvictRequest {
    pub vmcs: HostPhysAddr,
    pub ack: Arc<AtomicBool>,
}

/// Represents the per-CPU state for Virtual Machine Extensions (VMX).
///
/// Besides the VMXON region, each CPU owns a mailbox of eviction requests
/// posted by other CPUs that want to load a VMCS still current here.
#[derive(Debug)]
pub struct VmxPerCpuState<H: VmxHal> {
    cpu_id: usize,
    /// The VMXON region for this CPU.
    vmx_region: Mutex<VmxRegion<H>>,
    /// Physical address of the current VMCS, 0 if none.
    current_vmcs: AtomicUsize,
    mailbox: Mutex<VecDeque<EvictRequest>>,
}

impl<H: VmxHal> VmxPerCpuState<H> {
    pub fn new(cpu_id: usize) -> Self {
        Self {
            cpu_id,
            vmx_region: Mutex::new(unsafe { VmxRegion::uninit() }),
            current_vmcs: AtomicUsize::new(0),
            mailbox: Mutex::new(VecDeque::new()),
        }
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    pub fn is_enabled(&self) -> bool {
        H::read_cr4() & Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits() != 0
    }

    /// Turns on VMX operation. Must run on the CPU this state belongs to.
    pub fn hardware_enable(&self, caps: &VmxCapabilities) -> Result<()> {
        debug_assert_eq!(H::current_cpu_id(), self.cpu_id);
        if !H::cpuid(1, 0).ecx.get_bit(5) {
            return Err(VmxError::UnsupportedFeature(
                "CPU does not support feature VMX".into(),
            ));
        }
        if self.is_enabled() {
            return Err(VmxError::VmxAlreadyEnabled);
        }

        // Enable VMXON, if required.
        let ctrl = FeatureControl::read::<H>();
        let locked = ctrl.contains(FeatureControlFlags::LOCKED);
        let vmxon_outside = ctrl.contains(FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX);
        if !locked {
            FeatureControl::write::<H>(
                ctrl | FeatureControlFlags::LOCKED | FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX,
            )
        } else if !vmxon_outside {
            return Err(VmxError::UnsupportedFeature("VMX disabled by BIOS".into()));
        }

        // Check control registers are in a VMX-friendly state. (SDM Vol. 3C, Appendix A.7, A.8)
        macro_rules! cr_is_valid {
            ($value: expr, $crx: ident) => {{
                use Msr::*;
                let value = $value;
                paste::paste! {
                    let fixed0 = [<IA32_VMX_ $crx _FIXED0>].read::<H>();
                    let fixed1 = [<IA32_VMX_ $crx _FIXED1>].read::<H>();
                }
                (value & fixed0 == fixed0) && (value & !fixed1 == 0)
            }};
        }
        if !cr_is_valid!(H::read_cr0(), CR0) {
            return Err(VmxError::InvalidVmcsConfig(
                "host CR0 is not valid in VMX operation".into(),
            ));
        }
        let cr4 = H::read_cr4() | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
        if !cr_is_valid!(cr4, CR4) {
            return Err(VmxError::InvalidVmcsConfig(
                "host CR4 is not valid in VMX operation".into(),
            ));
        }

        let mut region = self.vmx_region.lock();
        *region = VmxRegion::new(caps.revision_id, false)?;

        // Enable VMX using the VMXE bit.
        H::write_cr4(cr4);
        // Execute VMXON.
        if let Err(err) = H::vmxon(region.phys_addr()) {
            H::write_cr4(cr4 & !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits());
            return Err(VmxError::VmxInstructionError(format!(
                "VMX instruction vmxon failed: {:?}",
                err
            )));
        }
        info!("[VMX] CPU {} succeeded to turn on VMX.", self.cpu_id);

        Ok(())
    }

    pub fn hardware_disable(&self) -> Result<()> {
        if !self.is_enabled() {
            return Err(VmxError::VmxNotEnabled);
        }

        // Nobody may be waiting on us once VMX is off.
        self.drain_evictions();

        // Execute VMXOFF.
        H::vmxoff().map_err(|err| {
            VmxError::VmxInstructionError(format!("VMX instruction vmxoff failed: {:?}", err))
        })?;
        // Remove VMXE bit in CR4.
        H::write_cr4(H::read_cr4() & !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits());
        info!("[VMX] CPU {} succeeded to turn off VMX.", self.cpu_id);

        *self.vmx_region.lock() = unsafe { VmxRegion::uninit() };
        Ok(())
    }

    /// The VMCS last made current on this CPU by this engine.
    pub(crate) fn current_vmcs(&self) -> Option<HostPhysAddr> {
        match self.current_vmcs.load(Ordering::Relaxed) {
            0 => None,
            paddr => Some(HostPhysAddr::from(paddr)),
        }
    }

    pub(crate) fn set_current_vmcs(&self, vmcs: Option<HostPhysAddr>) {
        self.current_vmcs
            .store(vmcs.map_or(0, |p| p.as_usize()), Ordering::Relaxed);
    }

    /// Queues a VMCLEAR of `vmcs` on this CPU. The caller then kicks the CPU
    /// and waits for `ack`.
    pub(crate) fn post_eviction(&self, request: EvictRequest) {
        self.mailbox.lock().push_back(request);
    }

    /// Performs the VMCLEARs other CPUs asked for. Must run on this CPU, from
    /// the handler of the IPI sent by [`VmxHal::send_ipi`].
    ///
    /// Returns the number of requests served.
    pub fn drain_evictions(&self) -> usize {
        let mut served = 0;
        loop {
            let Some(request) = self.mailbox.lock().pop_front() else {
                break;
            };
            if self.current_vmcs() == Some(request.vmcs) {
                self.set_current_vmcs(None);
            }
            match H::vmclear(request.vmcs) {
                Ok(()) => trace!(
                    "[VMX] CPU {} evicted VMCS {:#x}",
                    self.cpu_id, request.vmcs
                ),
                Err(err) => error!(
                    "[VMX] CPU {} failed to evict VMCS {:#x}: {:?}",
                    self.cpu_id, request.vmcs, err
                ),
            }
            request.ack.store(true, Ordering::Release);
            served += 1;
        }
        served
    }
}
