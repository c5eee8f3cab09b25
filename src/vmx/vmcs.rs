//! VMCS field encodings and the decoders of exit information.
//!
//! Every field belongs to one enum per (owner, width) group; the width fixes
//! the value type and only guest, host and control groups are writable. Fields
//! are read and written through a [`VmcsGuard`](super::residency::VmcsGuard),
//! which proves that the VMCS is current on this CPU.

#![allow(non_camel_case_types)]
#![allow(dead_code)]

use bit_field::BitField;

use super::definitions::{VmxExitReason, VmxInstructionError, VmxInterruptionType};
use super::residency::VmcsGuard;
use crate::{Result, VmxHal};

/// A VMCS component with a fixed encoding and width.
pub trait VmcsField: Copy + core::fmt::Debug {
    type Value: Copy;

    fn encoding(self) -> u32;
    fn decode(raw: u64) -> Self::Value;
    fn encode(value: Self::Value) -> u64;
}

/// A VMCS component VMWRITE accepts.
pub trait WritableField: VmcsField {}

macro_rules! vmcs_fields {
    (
        $(#[$meta:meta])*
        $name:ident: $value:ty, $access:ident {
            $($field:ident = $enc:literal,)*
        }
    ) => {
        $(#[$meta])*
        #[repr(u32)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($field = $enc,)*
        }

        impl VmcsField for $name {
            type Value = $value;

            #[inline(always)]
            fn encoding(self) -> u32 {
                self as u32
            }

            #[inline(always)]
            fn decode(raw: u64) -> $value {
                raw as $value
            }

            #[inline(always)]
            fn encode(value: $value) -> u64 {
                value as u64
            }
        }

        vmcs_fields!(@access $name $access);
    };
    (@access $name:ident RW) => {
        impl WritableField for $name {}
    };
    (@access $name:ident RO) => {};
}

vmcs_fields! {
    /// 16-Bit Control Fields. (SDM Vol. 3D, Appendix B.1.1)
    VmcsControl16: u16, RW {
        VPID = 0x0,
        POSTED_INTERRUPT_NOTIFICATION_VECTOR = 0x2,
        EPTP_INDEX = 0x4,
    }
}

vmcs_fields! {
    /// 16-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.1.2)
    VmcsGuest16: u16, RW {
        ES_SELECTOR = 0x800,
        CS_SELECTOR = 0x802,
        SS_SELECTOR = 0x804,
        DS_SELECTOR = 0x806,
        FS_SELECTOR = 0x808,
        GS_SELECTOR = 0x80a,
        LDTR_SELECTOR = 0x80c,
        TR_SELECTOR = 0x80e,
        INTERRUPT_STATUS = 0x810,
        PML_INDEX = 0x812,
    }
}

vmcs_fields! {
    /// 16-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.1.3)
    VmcsHost16: u16, RW {
        ES_SELECTOR = 0xc00,
        CS_SELECTOR = 0xc02,
        SS_SELECTOR = 0xc04,
        DS_SELECTOR = 0xc06,
        FS_SELECTOR = 0xc08,
        GS_SELECTOR = 0xc0a,
        TR_SELECTOR = 0xc0c,
    }
}

vmcs_fields! {
    /// 64-Bit Control Fields. (SDM Vol. 3D, Appendix B.2.1)
    VmcsControl64: u64, RW {
        IO_BITMAP_A_ADDR = 0x2000,
        IO_BITMAP_B_ADDR = 0x2002,
        MSR_BITMAPS_ADDR = 0x2004,
        VMEXIT_MSR_STORE_ADDR = 0x2006,
        VMEXIT_MSR_LOAD_ADDR = 0x2008,
        VMENTRY_MSR_LOAD_ADDR = 0x200a,
        EXECUTIVE_VMCS_PTR = 0x200c,
        PML_ADDR = 0x200e,
        TSC_OFFSET = 0x2010,
        VIRT_APIC_ADDR = 0x2012,
        APIC_ACCESS_ADDR = 0x2014,
        POSTED_INTERRUPT_DESC_ADDR = 0x2016,
        VM_FUNCTION_CONTROLS = 0x2018,
        EPTP = 0x201a,
        EOI_EXIT0 = 0x201c,
        EOI_EXIT1 = 0x201e,
        EOI_EXIT2 = 0x2020,
        EOI_EXIT3 = 0x2022,
        EPTP_LIST_ADDR = 0x2024,
        VMREAD_BITMAP = 0x2026,
        VMWRITE_BITMAP = 0x2028,
        VIRT_EXCEPTION_INFO_ADDR = 0x202a,
        XSS_EXITING_BITMAP = 0x202c,
        ENCLS_EXITING_BITMAP = 0x202e,
        SUBPAGE_PERM_TABLE_PTR = 0x2030,
        TSC_MULTIPLIER = 0x2032,
    }
}

vmcs_fields! {
    /// 64-Bit Read-Only Data Field. (SDM Vol. 3D, Appendix B.2.2)
    VmcsReadOnly64: u64, RO {
        GUEST_PHYSICAL_ADDR = 0x2400,
    }
}

vmcs_fields! {
    /// 64-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.2.3)
    VmcsGuest64: u64, RW {
        LINK_PTR = 0x2800,
        IA32_DEBUGCTL = 0x2802,
        IA32_PAT = 0x2804,
        IA32_EFER = 0x2806,
        IA32_PERF_GLOBAL_CTRL = 0x2808,
        PDPTE0 = 0x280a,
        PDPTE1 = 0x280c,
        PDPTE2 = 0x280e,
        PDPTE3 = 0x2810,
        IA32_BNDCFGS = 0x2812,
        IA32_RTIT_CTL = 0x2814,
    }
}

vmcs_fields! {
    /// 64-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.2.4)
    VmcsHost64: u64, RW {
        IA32_PAT = 0x2c00,
        IA32_EFER = 0x2c02,
        IA32_PERF_GLOBAL_CTRL = 0x2c04,
    }
}

vmcs_fields! {
    /// 32-Bit Control Fields. (SDM Vol. 3D, Appendix B.3.1)
    VmcsControl32: u32, RW {
        PINBASED_EXEC_CONTROLS = 0x4000,
        PRIMARY_PROCBASED_EXEC_CONTROLS = 0x4002,
        EXCEPTION_BITMAP = 0x4004,
        PAGE_FAULT_ERR_CODE_MASK = 0x4006,
        PAGE_FAULT_ERR_CODE_MATCH = 0x4008,
        CR3_TARGET_COUNT = 0x400a,
        VMEXIT_CONTROLS = 0x400c,
        VMEXIT_MSR_STORE_COUNT = 0x400e,
        VMEXIT_MSR_LOAD_COUNT = 0x4010,
        VMENTRY_CONTROLS = 0x4012,
        VMENTRY_MSR_LOAD_COUNT = 0x4014,
        VMENTRY_INTERRUPTION_INFO_FIELD = 0x4016,
        VMENTRY_EXCEPTION_ERR_CODE = 0x4018,
        VMENTRY_INSTRUCTION_LEN = 0x401a,
        TPR_THRESHOLD = 0x401c,
        SECONDARY_PROCBASED_EXEC_CONTROLS = 0x401e,
        PLE_GAP = 0x4020,
        PLE_WINDOW = 0x4022,
    }
}

vmcs_fields! {
    /// 32-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.3.2)
    VmcsReadOnly32: u32, RO {
        VM_INSTRUCTION_ERROR = 0x4400,
        EXIT_REASON = 0x4402,
        VMEXIT_INTERRUPTION_INFO = 0x4404,
        VMEXIT_INTERRUPTION_ERR_CODE = 0x4406,
        IDT_VECTORING_INFO = 0x4408,
        IDT_VECTORING_ERR_CODE = 0x440a,
        VMEXIT_INSTRUCTION_LEN = 0x440c,
        VMEXIT_INSTRUCTION_INFO = 0x440e,
    }
}

vmcs_fields! {
    /// 32-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.3.3)
    VmcsGuest32: u32, RW {
        ES_LIMIT = 0x4800,
        CS_LIMIT = 0x4802,
        SS_LIMIT = 0x4804,
        DS_LIMIT = 0x4806,
        FS_LIMIT = 0x4808,
        GS_LIMIT = 0x480a,
        LDTR_LIMIT = 0x480c,
        TR_LIMIT = 0x480e,
        GDTR_LIMIT = 0x4810,
        IDTR_LIMIT = 0x4812,
        ES_ACCESS_RIGHTS = 0x4814,
        CS_ACCESS_RIGHTS = 0x4816,
        SS_ACCESS_RIGHTS = 0x4818,
        DS_ACCESS_RIGHTS = 0x481a,
        FS_ACCESS_RIGHTS = 0x481c,
        GS_ACCESS_RIGHTS = 0x481e,
        LDTR_ACCESS_RIGHTS = 0x4820,
        TR_ACCESS_RIGHTS = 0x4822,
        INTERRUPTIBILITY_STATE = 0x4824,
        ACTIVITY_STATE = 0x4826,
        SMBASE = 0x4828,
        IA32_SYSENTER_CS = 0x482a,
        VMX_PREEMPTION_TIMER_VALUE = 0x482e,
    }
}

vmcs_fields! {
    /// 32-Bit Host-State Field. (SDM Vol. 3D, Appendix B.3.4)
    VmcsHost32: u32, RW {
        IA32_SYSENTER_CS = 0x4c00,
    }
}

vmcs_fields! {
    /// Natural-Width Control Fields. (SDM Vol. 3D, Appendix B.4.1)
    VmcsControlNW: u64, RW {
        CR0_GUEST_HOST_MASK = 0x6000,
        CR4_GUEST_HOST_MASK = 0x6002,
        CR0_READ_SHADOW = 0x6004,
        CR4_READ_SHADOW = 0x6006,
        CR3_TARGET_VALUE0 = 0x6008,
        CR3_TARGET_VALUE1 = 0x600a,
        CR3_TARGET_VALUE2 = 0x600c,
        CR3_TARGET_VALUE3 = 0x600e,
    }
}

vmcs_fields! {
    /// Natural-Width Read-Only Data Fields. (SDM Vol. 3D, Appendix B.4.2)
    VmcsReadOnlyNW: u64, RO {
        EXIT_QUALIFICATION = 0x6400,
        IO_RCX = 0x6402,
        IO_RSI = 0x6404,
        IO_RDI = 0x6406,
        IO_RIP = 0x6408,
        GUEST_LINEAR_ADDR = 0x640a,
    }
}

vmcs_fields! {
    /// Natural-Width Guest-State Fields. (SDM Vol. 3D, Appendix B.4.3)
    VmcsGuestNW: u64, RW {
        CR0 = 0x6800,
        CR3 = 0x6802,
        CR4 = 0x6804,
        ES_BASE = 0x6806,
        CS_BASE = 0x6808,
        SS_BASE = 0x680a,
        DS_BASE = 0x680c,
        FS_BASE = 0x680e,
        GS_BASE = 0x6810,
        LDTR_BASE = 0x6812,
        TR_BASE = 0x6814,
        GDTR_BASE = 0x6816,
        IDTR_BASE = 0x6818,
        DR7 = 0x681a,
        RSP = 0x681c,
        RIP = 0x681e,
        RFLAGS = 0x6820,
        PENDING_DBG_EXCEPTIONS = 0x6822,
        IA32_SYSENTER_ESP = 0x6824,
        IA32_SYSENTER_EIP = 0x6826,
    }
}

vmcs_fields! {
    /// Natural-Width Host-State Fields. (SDM Vol. 3D, Appendix B.4.4)
    VmcsHostNW: u64, RW {
        CR0 = 0x6c00,
        CR3 = 0x6c02,
        CR4 = 0x6c04,
        FS_BASE = 0x6c06,
        GS_BASE = 0x6c08,
        TR_BASE = 0x6c0a,
        GDTR_BASE = 0x6c0c,
        IDTR_BASE = 0x6c0e,
        IA32_SYSENTER_ESP = 0x6c10,
        IA32_SYSENTER_EIP = 0x6c12,
        RSP = 0x6c14,
        RIP = 0x6c16,
    }
}

pub mod controls {
    pub use x86::vmx::vmcs::control::{
        EntryControls, ExitControls, PinbasedControls, PrimaryControls, SecondaryControls,
    };

    bitflags::bitflags! {
        /// Guest interruptibility state. (SDM Vol. 3C, Section 24.4.2, Table 24-3)
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct InterruptibilityState: u32 {
            const BLOCKING_BY_STI = 1 << 0;
            const BLOCKING_BY_MOV_SS = 1 << 1;
            const BLOCKING_BY_SMI = 1 << 2;
            const BLOCKING_BY_NMI = 1 << 3;
            const ENCLAVE_INTERRUPTION = 1 << 4;
        }
    }
}

/// Reads the VM-instruction error of the current VMCS.
///
/// Used on the VMfail path, where no guard may be at hand.
pub fn instruction_error<H: VmxHal>() -> VmxInstructionError {
    let raw = H::vmread(VmcsReadOnly32::VM_INSTRUCTION_ERROR.encoding()).unwrap_or(0);
    VmxInstructionError::from(raw as u32)
}

/// VM-Exit Informations. (SDM Vol. 3C, Section 24.9.1)
#[derive(Debug, Clone, Copy)]
pub struct VmxExitInfo {
    /// VM-entry failure. (0 = true VM exit; 1 = VM-entry failure)
    pub entry_failure: bool,
    /// Basic exit reason, as reported.
    pub raw_reason: u32,
    /// Basic exit reason, if known to this engine.
    pub exit_reason: Option<VmxExitReason>,
    /// For VM exits resulting from instruction execution, this field receives
    /// the length in bytes of the instruction whose execution led to the VM exit.
    pub exit_instruction_length: u32,
    /// Guest `RIP` where the VM exit occurs.
    pub guest_rip: u64,
}

impl VmxExitInfo {
    pub fn decode(raw_exit_reason: u32, instruction_length: u32, guest_rip: u64) -> Self {
        let raw_reason = raw_exit_reason.get_bits(0..16);
        Self {
            entry_failure: raw_exit_reason.get_bit(31),
            raw_reason,
            exit_reason: VmxExitReason::try_from(raw_reason).ok(),
            exit_instruction_length: instruction_length,
            guest_rip,
        }
    }
}

pub fn exit_info<H: VmxHal>(vmcs: &VmcsGuard<'_, H>) -> Result<VmxExitInfo> {
    Ok(VmxExitInfo::decode(
        vmcs.read(VmcsReadOnly32::EXIT_REASON)?,
        vmcs.read(VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN)?,
        vmcs.read(VmcsGuestNW::RIP)?,
    ))
}

pub fn exit_qualification<H: VmxHal>(vmcs: &VmcsGuard<'_, H>) -> Result<u64> {
    vmcs.read(VmcsReadOnlyNW::EXIT_QUALIFICATION)
}

/// VM-Entry/VM-Exit Interruption-Information Field. (SDM Vol. 3C, Section 24.8.3, 24.9.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxInterruptInfo {
    /// Vector of interrupt or exception.
    pub vector: u8,
    /// Determines details of how the injection is performed.
    pub int_type: VmxInterruptionType,
    /// For hardware exceptions that would have delivered an error code on the stack.
    pub err_code: Option<u32>,
    /// Whether the field is valid.
    pub valid: bool,
}

impl VmxInterruptInfo {
    /// Builds the information for a hardware exception.
    pub fn exception(vector: u8, err_code: Option<u32>) -> Self {
        Self {
            vector,
            int_type: VmxInterruptionType::HardException,
            err_code: if VmxInterruptionType::vector_has_error_code(vector) {
                Some(err_code.unwrap_or(0))
            } else {
                None
            },
            valid: true,
        }
    }

    pub fn new(vector: u8, int_type: VmxInterruptionType, err_code: Option<u32>) -> Self {
        Self {
            vector,
            int_type,
            err_code,
            valid: true,
        }
    }

    /// Decodes the interruption information and, when bit 11 says one is
    /// present, the associated error code.
    pub fn decode(info: u32, err_code: u32) -> Self {
        Self {
            vector: info.get_bits(0..8) as u8,
            int_type: VmxInterruptionType::from_bits(info.get_bits(8..11) as u8),
            err_code: if info.get_bit(11) {
                Some(err_code)
            } else {
                None
            },
            valid: info.get_bit(31),
        }
    }

    /// Raw bits for the VM-entry interruption-information field.
    pub fn bits(&self) -> u32 {
        let mut bits = self.vector as u32;
        bits.set_bits(8..11, self.int_type as u32);
        bits.set_bit(11, self.err_code.is_some());
        bits.set_bit(31, self.valid);
        bits
    }
}

pub fn interrupt_exit_info<H: VmxHal>(vmcs: &VmcsGuard<'_, H>) -> Result<VmxInterruptInfo> {
    Ok(VmxInterruptInfo::decode(
        vmcs.read(VmcsReadOnly32::VMEXIT_INTERRUPTION_INFO)?,
        vmcs.read(VmcsReadOnly32::VMEXIT_INTERRUPTION_ERR_CODE)?,
    ))
}

/// Event that was being delivered when the exit happened, if any.
/// (SDM Vol. 3C, Section 27.2.4)
pub fn idt_vectoring_info<H: VmxHal>(
    vmcs: &VmcsGuard<'_, H>,
) -> Result<Option<VmxInterruptInfo>> {
    let info = VmxInterruptInfo::decode(
        vmcs.read(VmcsReadOnly32::IDT_VECTORING_INFO)?,
        vmcs.read(VmcsReadOnly32::IDT_VECTORING_ERR_CODE)?,
    );
    Ok(info.valid.then_some(info))
}

/// Writes the VM-entry event injection fields. (SDM Vol. 3C, Section 24.8.3)
pub fn inject_event<H: VmxHal>(
    vmcs: &VmcsGuard<'_, H>,
    info: &VmxInterruptInfo,
    instr_len: u32,
) -> Result {
    if let Some(err_code) = info.err_code {
        vmcs.write(VmcsControl32::VMENTRY_EXCEPTION_ERR_CODE, err_code)?;
    }
    if info.int_type.is_soft() {
        vmcs.write(VmcsControl32::VMENTRY_INSTRUCTION_LEN, instr_len)?;
    }
    vmcs.write(VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD, info.bits())
}

/// Exit Qualification for I/O Instructions. (SDM Vol. 3C, Section 27.2.1, Table 27-5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxIoExitInfo {
    /// Size of access in bytes: 1, 2 or 4.
    pub access_size: u8,
    /// Direction of the attempted access.
    pub is_in: bool,
    /// String instruction (INS, OUTS).
    pub is_string: bool,
    /// REP prefixed.
    pub is_repeat: bool,
    /// Port number.
    pub port: u16,
}

impl VmxIoExitInfo {
    pub fn decode(qualification: u64) -> Self {
        Self {
            access_size: qualification.get_bits(0..3) as u8 + 1,
            is_in: qualification.get_bit(3),
            is_string: qualification.get_bit(4),
            is_repeat: qualification.get_bit(5),
            port: qualification.get_bits(16..32) as u16,
        }
    }
}

pub fn io_exit_info<H: VmxHal>(vmcs: &VmcsGuard<'_, H>) -> Result<VmxIoExitInfo> {
    exit_qualification(vmcs).map(VmxIoExitInfo::decode)
}

/// VM-Exit Instruction-Information Field for INS and OUTS.
/// (SDM Vol. 3C, Section 27.2.5, Table 27-8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxIoInstructionInfo {
    /// Address size in bytes: 2, 4 or 8.
    pub address_size: u8,
    /// Segment register encoding (ES = 0 ... GS = 5).
    pub segment: u8,
}

impl VmxIoInstructionInfo {
    pub fn decode(info: u32) -> Self {
        Self {
            address_size: 2 << info.get_bits(7..10),
            segment: info.get_bits(15..18) as u8,
        }
    }
}

pub fn io_instruction_info<H: VmxHal>(vmcs: &VmcsGuard<'_, H>) -> Result<VmxIoInstructionInfo> {
    vmcs.read(VmcsReadOnly32::VMEXIT_INSTRUCTION_INFO)
        .map(VmxIoInstructionInfo::decode)
}

/// Exit Qualification for Control-Register Accesses. (SDM Vol. 3C, Section 27.2.1, Table 27-3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrAccessInfo {
    /// Number of control register.
    pub cr_number: u8,
    /// Access type: 0 = MOV to CR, 1 = MOV from CR, 2 = CLTS, 3 = LMSW.
    pub access_type: u8,
    /// LMSW operand type: 0 = register, 1 = memory.
    pub lmsw_op_type: u8,
    /// For MOV CR, the general-purpose register.
    pub gpr: u8,
    /// For LMSW, the LMSW source data.
    pub lmsw_source_data: u16,
}

impl CrAccessInfo {
    pub const MOV_TO_CR: u8 = 0;
    pub const MOV_FROM_CR: u8 = 1;
    pub const CLTS: u8 = 2;
    pub const LMSW: u8 = 3;

    pub fn decode(qualification: u64) -> Self {
        Self {
            cr_number: qualification.get_bits(0..4) as u8,
            access_type: qualification.get_bits(4..6) as u8,
            lmsw_op_type: qualification.get_bits(6..7) as u8,
            gpr: qualification.get_bits(8..12) as u8,
            lmsw_source_data: qualification.get_bits(16..32) as u16,
        }
    }
}

pub fn cr_access_info<H: VmxHal>(vmcs: &VmcsGuard<'_, H>) -> Result<CrAccessInfo> {
    exit_qualification(vmcs).map(CrAccessInfo::decode)
}

/// Exit Qualification for EPT Violations. (SDM Vol. 3C, Section 27.2.1, Table 27-7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EptViolationInfo {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub fault_guest_paddr: u64,
}

impl EptViolationInfo {
    pub fn decode(qualification: u64, gpa: u64) -> Self {
        Self {
            read: qualification.get_bit(0),
            write: qualification.get_bit(1),
            execute: qualification.get_bit(2),
            fault_guest_paddr: gpa,
        }
    }
}

pub fn ept_violation_info<H: VmxHal>(vmcs: &VmcsGuard<'_, H>) -> Result<EptViolationInfo> {
    Ok(EptViolationInfo::decode(
        exit_qualification(vmcs)?,
        vmcs.read(VmcsReadOnly64::GUEST_PHYSICAL_ADDR)?,
    ))
}

/// Sets or clears `bits` in a 32-bit control field.
pub fn update_control<H: VmxHal>(
    vmcs: &VmcsGuard<'_, H>,
    field: VmcsControl32,
    bits: u32,
    enable: bool,
) -> Result {
    let ctrl = vmcs.read(field)?;
    let new = if enable { ctrl | bits } else { ctrl & !bits };
    if new != ctrl {
        vmcs.write(field, new)?;
    }
    Ok(())
}
