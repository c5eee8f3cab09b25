use alloc::format;

use bit_field::BitField;
use x86::controlregs::Xcr0;
use x86_64::registers::control::{Cr0Flags, Cr4Flags};

use super::definitions::{InvEptType, InvVpidType};
use super::structs::{EptVpidCap, VmxBasic};
use super::vmcs::controls::{
    EntryControls as EntryCtrl, ExitControls as ExitCtrl, PinbasedControls as PinCtrl,
    PrimaryControls as CpuCtrl, SecondaryControls as CpuCtrl2,
};
use crate::frame::PAGE_SIZE;
use crate::msr::Msr;
use crate::{Result, VmxError, VmxHal};

/// EPT paging-structure memory types. (SDM Vol. 3C, Section 24.6.11)
const EPT_MEMORY_TYPE_UC: u64 = 0;
const EPT_MEMORY_TYPE_WB: u64 = 6;

/// VMX capabilities of the platform, computed once and never changed.
#[derive(Debug, Clone)]
pub struct VmxCapabilities {
    /// VMCS revision identifier stamped into every VMCS and VMXON region.
    pub revision_id: u32,
    pub pinbased_ctls: u32,
    pub procbased_ctls: u32,
    pub procbased_ctls2: u32,
    pub entry_ctls: u32,
    pub exit_ctls: u32,
    /// CR0 bits that must be 1 in VMX operation, PE and PG excepted.
    pub cr0_fixed0: u64,
    /// CR0 bits that may be 1 in VMX operation.
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
    /// Memory type field of the EPT pointer.
    pub eptp_memtype: u64,
    pub invept_op: InvEptType,
    pub invvpid_op: InvVpidType,
    /// Largest VPID handed to a guest.
    pub max_asid: u16,
    /// XCR0 components a guest may enable.
    pub xcr0_mask: u64,
    pub mxcsr_mask: u32,
    /// Whether each VM entry must flush the L1D cache through the MSR-load list.
    pub l1d_flush: bool,
    /// Whether the VMX-preemption timer can be armed.
    pub preemption_timer: bool,
    /// Whether CR8 can be backed by a virtual-APIC page instead of exiting.
    pub tpr_shadow: bool,
}

impl VmxCapabilities {
    /// Default MXCSR mask when FXSAVE reports none. (SDM Vol. 1, Section 11.6.6)
    const DEFAULT_MXCSR_MASK: u32 = 0xffbf;
    const MAX_ASID: u16 = 0xffff;

    /// Reads the VMX capability MSRs of the current processor.
    pub fn probe<H: VmxHal>() -> Result<Self> {
        let basic = VmxBasic::read::<H>();
        if basic.region_size as usize != PAGE_SIZE {
            return Err(VmxError::UnsupportedFeature(
                "VMX region size is not 4K".into(),
            ));
        }
        if basic.mem_type != VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK {
            return Err(VmxError::UnsupportedFeature(
                "VMX memory type is not write-back".into(),
            ));
        }
        if basic.is_32bit_address {
            return Err(VmxError::UnsupportedFeature(
                "32-bit VMX not supported".into(),
            ));
        }
        if !basic.io_exit_info {
            return Err(VmxError::UnsupportedFeature(
                "IO exit info not supported".into(),
            ));
        }

        let (true_pin, true_proc, true_exit, true_entry) = if basic.vmx_flex_controls {
            (
                Msr::IA32_VMX_TRUE_PINBASED_CTLS,
                Msr::IA32_VMX_TRUE_PROCBASED_CTLS,
                Msr::IA32_VMX_TRUE_EXIT_CTLS,
                Msr::IA32_VMX_TRUE_ENTRY_CTLS,
            )
        } else {
            (
                Msr::IA32_VMX_PINBASED_CTLS,
                Msr::IA32_VMX_PROCBASED_CTLS,
                Msr::IA32_VMX_EXIT_CTLS,
                Msr::IA32_VMX_ENTRY_CTLS,
            )
        };

        // Intercept NMIs and external interrupts, allow the preemption timer.
        let pinbased_ctls = resolve_controls(
            "pin-based",
            true_pin.read::<H>(),
            (PinCtrl::EXTERNAL_INTERRUPT_EXITING | PinCtrl::NMI_EXITING | PinCtrl::VIRTUAL_NMIS)
                .bits(),
            0,
        )?;
        let preemption_timer = true_pin
            .read::<H>()
            .get_bit(32 + PinCtrl::VMX_PREEMPTION_TIMER.bits().trailing_zeros() as usize);

        // Intercept HLT, I/O, MONITOR/MWAIT, RDPMC and CR8. A vCPU lifts the CR8
        // intercepts when its machine shadows the TPR.
        let procbased_ctls = resolve_controls(
            "primary processor-based",
            true_proc.read::<H>(),
            (CpuCtrl::HLT_EXITING
                | CpuCtrl::UNCOND_IO_EXITING
                | CpuCtrl::MWAIT_EXITING
                | CpuCtrl::MONITOR_EXITING
                | CpuCtrl::RDPMC_EXITING
                | CpuCtrl::CR8_LOAD_EXITING
                | CpuCtrl::CR8_STORE_EXITING
                | CpuCtrl::USE_TSC_OFFSETTING
                | CpuCtrl::USE_MSR_BITMAPS
                | CpuCtrl::SECONDARY_CONTROLS)
                .bits(),
            (CpuCtrl::CR3_LOAD_EXITING
                | CpuCtrl::CR3_STORE_EXITING
                | CpuCtrl::USE_IO_BITMAPS
                | CpuCtrl::RDTSC_EXITING
                | CpuCtrl::INVLPG_EXITING)
                .bits(),
        )?;

        let tpr_shadow = true_proc
            .read::<H>()
            .get_bit(32 + CpuCtrl::USE_TPR_SHADOW.bits().trailing_zeros() as usize);

        let procbased_ctls2 = resolve_controls(
            "secondary processor-based",
            Msr::IA32_VMX_PROCBASED_CTLS2.read::<H>(),
            (CpuCtrl2::ENABLE_EPT | CpuCtrl2::ENABLE_VPID | CpuCtrl2::UNRESTRICTED_GUEST).bits(),
            0,
        )?;

        // Load the guest's DR7, PAT and EFER on entry; save them and switch to
        // a 64-bit host on exit.
        let entry_ctls = resolve_controls(
            "VM-entry",
            true_entry.read::<H>(),
            (EntryCtrl::LOAD_DEBUG_CONTROLS | EntryCtrl::LOAD_IA32_PAT | EntryCtrl::LOAD_IA32_EFER)
                .bits(),
            EntryCtrl::IA32E_MODE_GUEST.bits(),
        )?;
        let exit_ctls = resolve_controls(
            "VM-exit",
            true_exit.read::<H>(),
            (ExitCtrl::SAVE_DEBUG_CONTROLS
                | ExitCtrl::HOST_ADDRESS_SPACE_SIZE
                | ExitCtrl::SAVE_IA32_PAT
                | ExitCtrl::LOAD_IA32_PAT
                | ExitCtrl::SAVE_IA32_EFER
                | ExitCtrl::LOAD_IA32_EFER)
                .bits(),
            // External interrupts stay pending until the host re-enables them.
            ExitCtrl::ACK_INTERRUPT_ON_EXIT.bits(),
        )?;

        let ept = EptVpidCap::read::<H>();
        if !ept.contains(EptVpidCap::PAGE_WALK_4) {
            return Err(VmxError::UnsupportedFeature(
                "4-level EPT walks not supported".into(),
            ));
        }
        if !ept.contains(EptVpidCap::INVEPT) {
            return Err(VmxError::UnsupportedFeature("INVEPT not supported".into()));
        }
        if !ept.contains(EptVpidCap::INVVPID) {
            return Err(VmxError::UnsupportedFeature("INVVPID not supported".into()));
        }
        let eptp_memtype = if ept.contains(EptVpidCap::MEMORY_TYPE_WB) {
            EPT_MEMORY_TYPE_WB
        } else if ept.contains(EptVpidCap::MEMORY_TYPE_UC) {
            EPT_MEMORY_TYPE_UC
        } else {
            return Err(VmxError::UnsupportedFeature(
                "no usable EPT memory type".into(),
            ));
        };
        let invept_op = if ept.contains(EptVpidCap::INVEPT_SINGLE_CONTEXT) {
            InvEptType::SingleContext
        } else {
            InvEptType::Global
        };
        let invvpid_op = if ept.contains(EptVpidCap::INVVPID_SINGLE_CONTEXT) {
            InvVpidType::SingleContext
        } else {
            InvVpidType::AllContext
        };

        // Unrestricted guests may run with PE and PG clear.
        let relaxed = (Cr0Flags::PAGING | Cr0Flags::PROTECTED_MODE_ENABLE).bits();
        let cr0_fixed0 = Msr::IA32_VMX_CR0_FIXED0.read::<H>() & !relaxed;
        let cr0_fixed1 = Msr::IA32_VMX_CR0_FIXED1.read::<H>() | relaxed;
        let cr4_fixed0 = Msr::IA32_VMX_CR4_FIXED0.read::<H>();
        let cr4_fixed1 = Msr::IA32_VMX_CR4_FIXED1.read::<H>();

        let xcr0_mask = if H::read_cr4() & Cr4Flags::OSXSAVE.bits() != 0 {
            H::xcr0()
                & (Xcr0::XCR0_FPU_MMX_STATE | Xcr0::XCR0_SSE_STATE | Xcr0::XCR0_AVX_STATE).bits()
        } else {
            Xcr0::XCR0_FPU_MMX_STATE.bits()
        };

        // CPUID.(EAX=07H,ECX=0):EDX[28] enumerates IA32_FLUSH_CMD, and
        // IA32_ARCH_CAPABILITIES[3] says flushing on entry is not needed.
        let leaf7 = H::cpuid(7, 0);
        let has_flush_cmd = leaf7.edx.get_bit(28);
        let has_arch_caps = leaf7.edx.get_bit(29);
        let skip_l1dfl =
            has_arch_caps && Msr::IA32_ARCH_CAPABILITIES.read::<H>().get_bit(3);
        let l1d_flush = has_flush_cmd && !skip_l1dfl;

        let caps = Self {
            revision_id: basic.revision_id,
            pinbased_ctls,
            procbased_ctls,
            procbased_ctls2,
            entry_ctls,
            exit_ctls,
            cr0_fixed0,
            cr0_fixed1,
            cr4_fixed0,
            cr4_fixed1,
            eptp_memtype,
            invept_op,
            invvpid_op,
            max_asid: Self::MAX_ASID,
            xcr0_mask,
            mxcsr_mask: Self::DEFAULT_MXCSR_MASK,
            l1d_flush,
            preemption_timer,
            tpr_shadow,
        };
        debug!("[VMX] probed capabilities: {:#x?}", caps);
        Ok(caps)
    }

    /// CR0 bits a guest write must keep within `[fixed0, fixed1]`.
    pub fn cr0_is_valid(&self, value: u64) -> bool {
        value & self.cr0_fixed0 == self.cr0_fixed0 && value & !self.cr0_fixed1 == 0
    }

    pub fn cr4_is_valid(&self, value: u64) -> bool {
        value & self.cr4_fixed0 == self.cr4_fixed0 && value & !self.cr4_fixed1 == 0
    }
}

/// Resolves a VMX control word against its capability MSR.
///
/// The low half of `cap` holds the allowed-0 settings (bits that must be 1),
/// the high half the allowed-1 settings (bits that may be 1). Bits in neither
/// `set` nor `clear` take their default. (SDM Vol. 3D, Appendix A.3)
pub fn resolve_controls(name: &str, cap: u64, set: u32, clear: u32) -> Result<u32> {
    let allowed0 = cap as u32;
    let allowed1 = (cap >> 32) as u32;
    if (set & clear) != 0 {
        return Err(VmxError::InvalidVmcsConfig(format!(
            "{name} controls: bits {:#x} are both set and cleared",
            set & clear
        )));
    }
    if (allowed1 & set) != set {
        // failed if set 0-bits in allowed1
        return Err(VmxError::UnsupportedFeature(format!(
            "{name} controls: can not set bits {:#x}",
            set & !allowed1
        )));
    }
    if (allowed0 & clear) != 0 {
        // failed if clear 1-bits in allowed0
        return Err(VmxError::UnsupportedFeature(format!(
            "{name} controls: can not clear bits {:#x}",
            allowed0 & clear
        )));
    }
    // SDM Vol. 3C, Section 31.5.1, Algorithm 3
    let flexible = !allowed0 & allowed1; // therefore must be 0 if set
    let unknown = flexible & !(set | clear); // otherwise 0
    let default = unknown & allowed0; // 0 = default
    Ok(allowed0 | default | set)
}
