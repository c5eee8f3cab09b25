//! Architectural constants of VMX operation.

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
/// VMX basic exit reasons. (SDM Vol. 3D, Appendix C)
pub enum VmxExitReason {
    EXCEPTION_NMI = 0,
    EXTERNAL_INTERRUPT = 1,
    TRIPLE_FAULT = 2,
    INIT = 3,
    SIPI = 4,
    SMI = 5,
    OTHER_SMI = 6,
    INTERRUPT_WINDOW = 7,
    NMI_WINDOW = 8,
    TASK_SWITCH = 9,
    CPUID = 10,
    GETSEC = 11,
    HLT = 12,
    INVD = 13,
    INVLPG = 14,
    RDPMC = 15,
    RDTSC = 16,
    RSM = 17,
    VMCALL = 18,
    VMCLEAR = 19,
    VMLAUNCH = 20,
    VMPTRLD = 21,
    VMPTRST = 22,
    VMREAD = 23,
    VMRESUME = 24,
    VMWRITE = 25,
    VMOFF = 26,
    VMON = 27,
    CR_ACCESS = 28,
    DR_ACCESS = 29,
    IO_INSTRUCTION = 30,
    MSR_READ = 31,
    MSR_WRITE = 32,
    INVALID_GUEST_STATE = 33,
    MSR_LOAD_FAIL = 34,
    MWAIT_INSTRUCTION = 36,
    MONITOR_TRAP_FLAG = 37,
    MONITOR_INSTRUCTION = 39,
    PAUSE_INSTRUCTION = 40,
    MCE_DURING_VMENTRY = 41,
    TPR_BELOW_THRESHOLD = 43,
    APIC_ACCESS = 44,
    VIRTUALIZED_EOI = 45,
    GDTR_IDTR = 46,
    LDTR_TR = 47,
    EPT_VIOLATION = 48,
    EPT_MISCONFIG = 49,
    INVEPT = 50,
    RDTSCP = 51,
    PREEMPTION_TIMER = 52,
    INVVPID = 53,
    WBINVD = 54,
    XSETBV = 55,
    APIC_WRITE = 56,
    RDRAND = 57,
    INVPCID = 58,
    VMFUNC = 59,
    ENCLS = 60,
    RDSEED = 61,
    PML_FULL = 62,
    XSAVES = 63,
    XRSTORS = 64,
    SPP_EVENT = 66,
    UMWAIT = 67,
    TPAUSE = 68,
    LOADIWKEY = 69,
}
}

impl VmxExitReason {
    /// Every basic exit reason, in numeric order.
    pub const ALL: &'static [VmxExitReason] = &[
        Self::EXCEPTION_NMI,
        Self::EXTERNAL_INTERRUPT,
        Self::TRIPLE_FAULT,
        Self::INIT,
        Self::SIPI,
        Self::SMI,
        Self::OTHER_SMI,
        Self::INTERRUPT_WINDOW,
        Self::NMI_WINDOW,
        Self::TASK_SWITCH,
        Self::CPUID,
        Self::GETSEC,
        Self::HLT,
        Self::INVD,
        Self::INVLPG,
        Self::RDPMC,
        Self::RDTSC,
        Self::RSM,
        Self::VMCALL,
        Self::VMCLEAR,
        Self::VMLAUNCH,
        Self::VMPTRLD,
        Self::VMPTRST,
        Self::VMREAD,
        Self::VMRESUME,
        Self::VMWRITE,
        Self::VMOFF,
        Self::VMON,
        Self::CR_ACCESS,
        Self::DR_ACCESS,
        Self::IO_INSTRUCTION,
        Self::MSR_READ,
        Self::MSR_WRITE,
        Self::INVALID_GUEST_STATE,
        Self::MSR_LOAD_FAIL,
        Self::MWAIT_INSTRUCTION,
        Self::MONITOR_TRAP_FLAG,
        Self::MONITOR_INSTRUCTION,
        Self::PAUSE_INSTRUCTION,
        Self::MCE_DURING_VMENTRY,
        Self::TPR_BELOW_THRESHOLD,
        Self::APIC_ACCESS,
        Self::VIRTUALIZED_EOI,
        Self::GDTR_IDTR,
        Self::LDTR_TR,
        Self::EPT_VIOLATION,
        Self::EPT_MISCONFIG,
        Self::INVEPT,
        Self::RDTSCP,
        Self::PREEMPTION_TIMER,
        Self::INVVPID,
        Self::WBINVD,
        Self::XSETBV,
        Self::APIC_WRITE,
        Self::RDRAND,
        Self::INVPCID,
        Self::VMFUNC,
        Self::ENCLS,
        Self::RDSEED,
        Self::PML_FULL,
        Self::XSAVES,
        Self::XRSTORS,
        Self::SPP_EVENT,
        Self::UMWAIT,
        Self::TPAUSE,
        Self::LOADIWKEY,
    ];

    /// One past the largest basic exit reason.
    pub const LIMIT: usize = Self::LOADIWKEY as usize + 1;
}

/// VM instruction error numbers. (SDM Vol. 3C, Section 31.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxInstructionError(u32);

impl VmxInstructionError {
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            0 => "OK",
            1 => "VMCALL executed in VMX root operation",
            2 => "VMCLEAR with invalid physical address",
            3 => "VMCLEAR with VMXON pointer",
            4 => "VMLAUNCH with non-clear VMCS",
            5 => "VMRESUME with non-launched VMCS",
            6 => "VMRESUME after VMXOFF (VMXOFF and VMXON between VMLAUNCH and VMRESUME)",
            7 => "VM entry with invalid control field(s)",
            8 => "VM entry with invalid host-state field(s)",
            9 => "VMPTRLD with invalid physical address",
            10 => "VMPTRLD with VMXON pointer",
            11 => "VMPTRLD with incorrect VMCS revision identifier",
            12 => "VMREAD/VMWRITE from/to unsupported VMCS component",
            13 => "VMWRITE to read-only VMCS component",
            15 => "VMXON executed in VMX root operation",
            16 => "VM entry with invalid executive-VMCS pointer",
            17 => "VM entry with non-launched executive VMCS",
            18 => "VM entry with executive-VMCS pointer not VMXON pointer (when attempting to deactivate the dual-monitor treatment of SMIs and SMM)",
            19 => "VMCALL with non-clear VMCS (when attempting to activate the dual-monitor treatment of SMIs and SMM)",
            20 => "VMCALL with invalid VM-exit control fields",
            22 => "VMCALL with incorrect MSEG revision identifier (when attempting to activate the dual-monitor treatment of SMIs and SMM)",
            23 => "VMXOFF under dual-monitor treatment of SMIs and SMM",
            24 => "VMCALL with invalid SMM-monitor features (when attempting to activate the dual-monitor treatment of SMIs and SMM)",
            25 => "VM entry with invalid VM-execution control fields in executive VMCS (when attempting to return from SMM)",
            26 => "VM entry with events blocked by MOV SS",
            28 => "Invalid operand to INVEPT/INVVPID",
            _ => "[INVALID]",
        }
    }
}

impl From<u32> for VmxInstructionError {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// INVEPT operation types. (SDM Vol. 3C, Section 30.3)
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvEptType {
    /// Invalidate mappings associated with one EPTP.
    SingleContext = 1,
    /// Invalidate mappings associated with all EPTPs.
    Global = 2,
}

/// INVVPID operation types. (SDM Vol. 3C, Section 30.3)
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum InvVpidType {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContext = 2,
    SingleContextRetainGlobals = 3,
}

/// Interruption types of the VM-entry and IDT-vectoring information fields.
/// (SDM Vol. 3C, Section 24.8.3)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxInterruptionType {
    External = 0,
    NMI = 2,
    HardException = 3,
    SoftIntr = 4,
    PrivSoft = 5,
    SoftException = 6,
    Other = 7,
}

impl VmxInterruptionType {
    /// Whether a hardware exception with `vector` pushes an error code:
    /// #DF, #TS, #NP, #SS, #GP, #PF, #AC and #SX.
    pub const fn vector_has_error_code(vector: u8) -> bool {
        matches!(vector, 8 | 10..=14 | 17 | 30)
    }

    /// Software events need the instruction length in the VM-entry
    /// instruction-length field.
    pub const fn is_soft(&self) -> bool {
        matches!(
            *self,
            Self::SoftIntr | Self::PrivSoft | Self::SoftException
        )
    }

    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x7 {
            0 => Self::External,
            2 => Self::NMI,
            3 => Self::HardException,
            4 => Self::SoftIntr,
            5 => Self::PrivSoft,
            6 => Self::SoftException,
            _ => Self::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_table_is_sorted_and_complete() {
        assert!(VmxExitReason::ALL.windows(2).all(|w| (w[0] as u32) < (w[1] as u32)));
        assert_eq!(VmxExitReason::ALL.len(), 66);
        for &reason in VmxExitReason::ALL {
            assert_eq!(VmxExitReason::try_from(reason as u32), Ok(reason));
        }
        assert!(VmxExitReason::try_from(35).is_err());
    }

    #[test]
    fn error_code_vectors() {
        let with_code: [u8; 8] = [8, 10, 11, 12, 13, 14, 17, 30];
        for v in 0..32u8 {
            assert_eq!(
                VmxInterruptionType::vector_has_error_code(v),
                with_code.contains(&v),
                "vector {v}"
            );
        }
    }

    #[test]
    fn instruction_error_strings() {
        assert_eq!(
            VmxInstructionError::from(4).as_str(),
            "VMLAUNCH with non-clear VMCS"
        );
        assert_eq!(VmxInstructionError::from(99).as_str(), "[INVALID]");
    }
}
