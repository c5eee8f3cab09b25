//! Classification and handling of VM exits.
//!
//! Every basic exit reason maps to exactly one handler. A handler either
//! finishes the exit in the engine, hands an [`ExitEvent`] to the caller of
//! `run`, or declares the exit fatal.

use bit_field::BitField;
use x86_64::registers::control::Cr0Flags;

use super::cpuid::{self, CpuidContext, CpuidOutcome};
use super::definitions::{VmxExitReason, VmxInterruptionType};
use super::machine::Machine;
use super::residency::VmcsGuard;
use super::state::{self, SegmentAttrib, SegmentReg};
use super::vcpu::VcpuInner;
use super::vmcs::controls::{InterruptibilityState, PrimaryControls};
use super::vmcs::{
    self, CrAccessInfo, VmcsControl32, VmcsControl64, VmcsGuest32, VmcsGuest64, VmcsGuestNW,
    VmxExitInfo,
};
use crate::msr::Msr;
use crate::{GuestPhysAddr, Result, VmxError, VmxHal};

bitflags::bitflags! {
    /// Kind of access that hit a missing or insufficient EPT mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// An I/O port access the caller has to carry out.
///
/// The guest RIP still points at the instruction; the caller moves it to
/// `next_rip` through `set_state` once the access is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoAccess {
    pub port: u16,
    pub write: bool,
    /// Operand size in bytes: 1, 2 or 4.
    pub size: u8,
    /// Address size in bytes: 2, 4 or 8.
    pub address_size: u8,
    pub rep: bool,
    pub string: bool,
    /// Segment of the memory operand of INS/OUTS.
    pub segment: Option<SegmentReg>,
    pub next_rip: u64,
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitEvent {
    /// Nothing for the caller; it may simply run again.
    None,
    /// The guest executed HLT with no interrupt to take.
    Halted,
    IoAccess(IoAccess),
    /// RDMSR of an MSR the engine does not service.
    RdMsr { msr: u32, next_rip: u64 },
    /// WRMSR of an MSR the engine does not service.
    WrMsr { msr: u32, value: u64, next_rip: u64 },
    /// EPT violation at `gpa`.
    MemoryFault {
        gpa: GuestPhysAddr,
        perm: MemoryAccess,
    },
    TprChanged { tpr: u64 },
    /// The guest can take a maskable interrupt now.
    InterruptWindowOpen,
    /// The guest can take an NMI now.
    NmiWindowOpen,
    /// Triple fault.
    Shutdown,
    /// VM entry failed on the guest state; `code` is the basic exit reason.
    InvalidState { code: u32 },
}

/// Outcome of one exit handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitAction {
    Handled,
    ReturnToCaller(ExitEvent),
    /// The exit cannot happen under this engine's controls.
    Fatal(u32),
}

pub(crate) struct ExitContext<'a, 'g, H: VmxHal> {
    pub vmcs: &'a VmcsGuard<'g, H>,
    pub vcpu: &'a mut VcpuInner<H>,
    pub machine: &'a Machine<H>,
    pub info: VmxExitInfo,
}

type ExitHandler<H> = fn(&mut ExitContext<'_, '_, H>) -> Result<ExitAction>;

/// Exit reason to handler map.
pub(crate) struct ExitHandlerTable<H: VmxHal> {
    handlers: [Option<ExitHandler<H>>; VmxExitReason::LIMIT],
}

impl<H: VmxHal> ExitHandlerTable<H> {
    pub fn new() -> Self {
        let mut handlers = [None; VmxExitReason::LIMIT];
        for &reason in VmxExitReason::ALL {
            handlers[reason as usize] = Some(handler_for::<H>(reason));
        }
        Self { handlers }
    }

    /// Checks that every known exit reason has a handler.
    pub fn validate(&self) -> Result {
        match VmxExitReason::ALL
            .iter()
            .find(|r| self.handlers[**r as usize].is_none())
        {
            Some(reason) => Err(VmxError::InvalidVmcsConfig(alloc::format!(
                "no handler for exit {:?}",
                reason
            ))),
            None => Ok(()),
        }
    }

    pub fn dispatch(&self, cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
        let raw = cx.info.raw_reason;
        match self.handlers.get(raw as usize).copied().flatten() {
            Some(handler) => handler(cx),
            None => Ok(ExitAction::Fatal(raw)),
        }
    }
}

fn handler_for<H: VmxHal>(reason: VmxExitReason) -> ExitHandler<H> {
    use VmxExitReason::*;
    match reason {
        EXCEPTION_NMI => handle_exception_nmi,
        EXTERNAL_INTERRUPT => handle_external_interrupt,
        TRIPLE_FAULT => handle_triple_fault,
        INTERRUPT_WINDOW => handle_interrupt_window,
        NMI_WINDOW => handle_nmi_window,
        CPUID => handle_cpuid,
        HLT => handle_hlt,
        INVD | WBINVD => handle_skip,
        GETSEC | RSM | RDPMC | VMCALL | VMCLEAR | VMLAUNCH | VMPTRLD | VMPTRST | VMREAD
        | VMRESUME | VMWRITE | VMOFF | VMON | INVEPT | INVVPID | VMFUNC | MWAIT_INSTRUCTION
        | MONITOR_INSTRUCTION => handle_invalid_opcode,
        CR_ACCESS => handle_cr_access,
        IO_INSTRUCTION => handle_io,
        MSR_READ => handle_rdmsr,
        MSR_WRITE => handle_wrmsr,
        INVALID_GUEST_STATE | MSR_LOAD_FAIL | MCE_DURING_VMENTRY => handle_entry_failure,
        EPT_VIOLATION => handle_ept_violation,
        XSETBV => handle_xsetbv,
        PREEMPTION_TIMER => handle_preemption_timer,
        INIT | SIPI | SMI | OTHER_SMI | TASK_SWITCH | INVLPG | RDTSC | DR_ACCESS
        | MONITOR_TRAP_FLAG | PAUSE_INSTRUCTION | TPR_BELOW_THRESHOLD | APIC_ACCESS
        | VIRTUALIZED_EOI | GDTR_IDTR | LDTR_TR | EPT_MISCONFIG | RDTSCP | APIC_WRITE
        | RDRAND | INVPCID | ENCLS | RDSEED | PML_FULL | XSAVES | XRSTORS | SPP_EVENT
        | UMWAIT | TPAUSE | LOADIWKEY => handle_unexpected,
    }
}

impl<H: VmxHal> ExitContext<'_, '_, H> {
    fn next_rip(&self) -> u64 {
        self.info.guest_rip + self.info.exit_instruction_length as u64
    }

    /// Moves past the exiting instruction, which also ends an STI or MOV SS
    /// interrupt shadow.
    fn advance_rip(&mut self) -> Result {
        self.vmcs.write(VmcsGuestNW::RIP, self.next_rip())?;
        let intr = self.vmcs.read(VmcsGuest32::INTERRUPTIBILITY_STATE)?;
        let shadow =
            (InterruptibilityState::BLOCKING_BY_STI | InterruptibilityState::BLOCKING_BY_MOV_SS)
                .bits();
        if intr & shadow != 0 {
            self.vmcs
                .write(VmcsGuest32::INTERRUPTIBILITY_STATE, intr & !shadow)?;
        }
        Ok(())
    }

    fn inject_gp(&mut self) -> ExitAction {
        warn!(
            "[VMX] injecting #GP into vCPU {} at {:#x} (exit {:?})",
            self.vcpu.id, self.info.guest_rip, self.info.exit_reason
        );
        self.vcpu.raise_exception(x86::irq::GENERAL_PROTECTION_FAULT_VECTOR, Some(0));
        ExitAction::Handled
    }

    fn inject_ud(&mut self) -> ExitAction {
        warn!(
            "[VMX] injecting #UD into vCPU {} at {:#x} (exit {:?})",
            self.vcpu.id, self.info.guest_rip, self.info.exit_reason
        );
        self.vcpu.raise_exception(x86::irq::INVALID_OPCODE_VECTOR, None);
        ExitAction::Handled
    }

    fn guest_cpl(&self) -> Result<u8> {
        Ok(SegmentAttrib(self.vmcs.read(VmcsGuest32::SS_ACCESS_RIGHTS)?).dpl())
    }

    fn read_gpr(&self, index: u8) -> Result<u64> {
        if index == 4 {
            self.vmcs.read(VmcsGuestNW::RSP)
        } else {
            Ok(self.vcpu.ctx.regs.get_reg_of_index(index))
        }
    }

    fn write_gpr(&mut self, index: u8, value: u64) -> Result {
        if index == 4 {
            self.vmcs.write(VmcsGuestNW::RSP, value)
        } else {
            self.vcpu.ctx.regs.set_reg_of_index(index, value);
            Ok(())
        }
    }
}

fn handle_unexpected<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    error!(
        "[VMX] unexpected exit {:?} of vCPU {} at {:#x}",
        cx.info.exit_reason, cx.vcpu.id, cx.info.guest_rip
    );
    Ok(ExitAction::Fatal(cx.info.raw_reason))
}

/// The interrupt is still pending and fires once the host enables interrupts.
fn handle_external_interrupt<H: VmxHal>(_cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    Ok(ExitAction::Handled)
}

fn handle_triple_fault<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    warn!("[VMX] vCPU {} triple fault at {:#x}", cx.vcpu.id, cx.info.guest_rip);
    Ok(ExitAction::ReturnToCaller(ExitEvent::Shutdown))
}

fn handle_preemption_timer<H: VmxHal>(_cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    Ok(ExitAction::ReturnToCaller(ExitEvent::None))
}

fn handle_skip<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    cx.advance_rip()?;
    Ok(ExitAction::Handled)
}

/// Nested VMX, SMX and the monitor instructions are not offered to guests.
fn handle_invalid_opcode<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    Ok(cx.inject_ud())
}

fn handle_exception_nmi<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    let intr = vmcs::interrupt_exit_info(cx.vmcs)?;
    if intr.int_type == VmxInterruptionType::NMI {
        H::host_nmi();
        return Ok(ExitAction::Handled);
    }
    // The exception bitmap is empty, so no guest exception lands here.
    error!(
        "[VMX] unexpected guest exception #{} in vCPU {}",
        intr.vector, cx.vcpu.id
    );
    Ok(ExitAction::Fatal(cx.info.raw_reason))
}

fn handle_entry_failure<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    Ok(ExitAction::ReturnToCaller(ExitEvent::InvalidState {
        code: cx.info.raw_reason,
    }))
}

fn handle_interrupt_window<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    vmcs::update_control(
        cx.vmcs,
        VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS,
        PrimaryControls::INTERRUPT_WINDOW_EXITING.bits(),
        false,
    )?;
    cx.vcpu.int_window = false;
    Ok(ExitAction::ReturnToCaller(ExitEvent::InterruptWindowOpen))
}

fn handle_nmi_window<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    vmcs::update_control(
        cx.vmcs,
        VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS,
        PrimaryControls::NMI_WINDOW_EXITING.bits(),
        false,
    )?;
    cx.vcpu.nmi_window = false;
    Ok(ExitAction::ReturnToCaller(ExitEvent::NmiWindowOpen))
}

fn handle_cpuid<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    let regs = &cx.vcpu.ctx.regs;
    let (leaf, subleaf) = (regs.eax(), regs.ecx());
    let ctx = CpuidContext {
        vcpu_id: cx.vcpu.id,
        guest_cr4: state::read_cr4(cx.vmcs)?,
        guest_xcr0: cx.vcpu.ctx.xstate.guest_xcr0(),
        xcr0_mask: cx.machine.host().caps().xcr0_mask,
    };
    let outcome = cpuid::emulate::<H>(leaf, subleaf, &ctx, &cx.machine.cpuid());
    match outcome {
        CpuidOutcome::Exit => {
            trace!("[VMX] CPUID({:#x}, {:#x}) left to the caller", leaf, subleaf);
            Ok(ExitAction::ReturnToCaller(ExitEvent::None))
        }
        CpuidOutcome::Complete(res) => {
            trace!("[VMX] CPUID({:#x}, {:#x}): {:x?}", leaf, subleaf, res);
            let regs = &mut cx.vcpu.ctx.regs;
            regs.rax = res.eax as u64;
            regs.rbx = res.ebx as u64;
            regs.rcx = res.ecx as u64;
            regs.rdx = res.edx as u64;
            cx.advance_rip()?;
            Ok(ExitAction::Handled)
        }
    }
}

fn handle_hlt<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    cx.advance_rip()?;
    let rflags = cx.vmcs.read(VmcsGuestNW::RFLAGS)?;
    if cx.vcpu.has_deliverable_interrupt(rflags) {
        return Ok(ExitAction::Handled);
    }
    Ok(ExitAction::ReturnToCaller(ExitEvent::Halted))
}

fn handle_cr_access<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    let access = vmcs::cr_access_info(cx.vmcs)?;
    let caps = cx.machine.host().caps();
    match (access.access_type, access.cr_number) {
        (CrAccessInfo::MOV_TO_CR, 0) => {
            let value = cx.read_gpr(access.gpr)?;
            set_cr0(cx, value)
        }
        (CrAccessInfo::MOV_TO_CR, 4) => {
            let value = cx.read_gpr(access.gpr)?;
            if !state::cr4_acceptable(caps, value) {
                return Ok(cx.inject_gp());
            }
            debug!("[VMX] vCPU {} CR4 <- {:#x}", cx.vcpu.id, value);
            cx.vcpu.ctx.flush_tlb |= state::write_cr4(cx.vmcs, caps, value)?;
            cx.advance_rip()?;
            Ok(ExitAction::Handled)
        }
        (CrAccessInfo::MOV_TO_CR, 8) => {
            let value = cx.read_gpr(access.gpr)?;
            if value > 0xf {
                return Ok(cx.inject_gp());
            }
            cx.vcpu.ctx.set_cr8(value);
            cx.advance_rip()?;
            if cx.machine.tpr_policy().notify {
                return Ok(ExitAction::ReturnToCaller(ExitEvent::TprChanged { tpr: value }));
            }
            Ok(ExitAction::Handled)
        }
        (CrAccessInfo::MOV_FROM_CR, 8) => {
            let value = cx.vcpu.ctx.cr8();
            cx.write_gpr(access.gpr, value)?;
            cx.advance_rip()?;
            Ok(ExitAction::Handled)
        }
        (CrAccessInfo::CLTS, _) => {
            let cr0 = state::read_cr0(cx.vmcs)? & !Cr0Flags::TASK_SWITCHED.bits();
            set_cr0(cx, cr0)
        }
        (CrAccessInfo::LMSW, _) => {
            // LMSW loads PE, MP, EM and TS but cannot clear PE.
            let cr0 = state::read_cr0(cx.vmcs)?;
            let value = (cr0 & !0xe) | (access.lmsw_source_data as u64 & 0xf);
            set_cr0(cx, value)
        }
        _ => {
            error!(
                "[VMX] unexpected CR access of vCPU {}: {:?}",
                cx.vcpu.id, access
            );
            Ok(ExitAction::Fatal(cx.info.raw_reason))
        }
    }
}

fn set_cr0<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>, value: u64) -> Result<ExitAction> {
    if !state::cr0_acceptable(value) {
        return Ok(cx.inject_gp());
    }
    debug!("[VMX] vCPU {} CR0 <- {:#x}", cx.vcpu.id, value);
    cx.vcpu.ctx.flush_tlb |= state::write_cr0(cx.vmcs, cx.machine.host().caps(), value)?;
    cx.advance_rip()?;
    Ok(ExitAction::Handled)
}

fn handle_io<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    let io = vmcs::io_exit_info(cx.vmcs)?;
    let (address_size, segment) = if io.is_string {
        let info = vmcs::io_instruction_info(cx.vmcs)?;
        // INS always writes through ES.
        let segment = if io.is_in {
            SegmentReg::ES
        } else {
            SegmentReg::ALL[info.segment as usize % 6]
        };
        (info.address_size, Some(segment))
    } else {
        let cs = SegmentAttrib(cx.vmcs.read(VmcsGuest32::CS_ACCESS_RIGHTS)?);
        let size = if cs.is_long() {
            8
        } else if cs.is_default_32() {
            4
        } else {
            2
        };
        (size, None)
    };
    Ok(ExitAction::ReturnToCaller(ExitEvent::IoAccess(IoAccess {
        port: io.port,
        write: !io.is_in,
        size: io.access_size,
        address_size,
        rep: io.is_repeat,
        string: io.is_string,
        segment,
        next_rip: cx.next_rip(),
    })))
}

/// MSRs that read as zero and ignore writes.
const IGNORED_MSRS: [Msr; 3] = [
    Msr::IA32_BIOS_SIGN_ID,
    Msr::IA32_PLATFORM_ID,
    Msr::IA32_UMWAIT_CONTROL,
];

fn is_ignored(msr: u32) -> bool {
    IGNORED_MSRS.iter().any(|m| *m as u32 == msr)
}

/// Each byte of the PAT must be a valid memory type. (SDM Vol. 3A, Section 13.12.2)
fn pat_is_valid(pat: u64) -> bool {
    pat.to_le_bytes()
        .iter()
        .all(|ty| matches!(ty, 0 | 1 | 4 | 5 | 6 | 7))
}

fn handle_rdmsr<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    let msr = cx.vcpu.ctx.regs.ecx();
    let value = match Msr::try_from(msr) {
        Ok(Msr::IA32_TSC) => {
            let offset = cx.vmcs.read(VmcsControl64::TSC_OFFSET)?;
            H::rdtsc().wrapping_add(offset)
        }
        Ok(Msr::IA32_PAT) => cx.vmcs.read(VmcsGuest64::IA32_PAT)?,
        Ok(Msr::IA32_MISC_ENABLE) => cx.vcpu.ctx.misc_enable,
        _ if is_ignored(msr) => 0,
        _ => {
            trace!("[VMX] RDMSR {:#x} left to the caller", msr);
            return Ok(ExitAction::ReturnToCaller(ExitEvent::RdMsr {
                msr,
                next_rip: cx.next_rip(),
            }));
        }
    };
    cx.vcpu.ctx.regs.set_edx_eax(value);
    cx.advance_rip()?;
    Ok(ExitAction::Handled)
}

fn handle_wrmsr<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    let msr = cx.vcpu.ctx.regs.ecx();
    let value = cx.vcpu.ctx.regs.get_edx_eax();
    match Msr::try_from(msr) {
        Ok(Msr::IA32_TSC) => {
            cx.vmcs
                .write(VmcsControl64::TSC_OFFSET, value.wrapping_sub(H::rdtsc()))?;
        }
        Ok(Msr::IA32_PAT) => {
            if !pat_is_valid(value) {
                return Ok(cx.inject_gp());
            }
            cx.vmcs.write(VmcsGuest64::IA32_PAT, value)?;
        }
        Ok(Msr::IA32_MISC_ENABLE) => {}
        _ if is_ignored(msr) => {}
        _ => {
            trace!("[VMX] WRMSR {:#x} <- {:#x} left to the caller", msr, value);
            return Ok(ExitAction::ReturnToCaller(ExitEvent::WrMsr {
                msr,
                value,
                next_rip: cx.next_rip(),
            }));
        }
    }
    cx.advance_rip()?;
    Ok(ExitAction::Handled)
}

fn handle_xsetbv<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    let index = cx.vcpu.ctx.regs.ecx();
    let value = cx.vcpu.ctx.regs.get_edx_eax();
    let caps = cx.machine.host().caps();
    if index != 0 || cx.guest_cpl()? != 0 || !state::xcr0_acceptable(caps, value) {
        return Ok(cx.inject_gp());
    }
    debug!("[VMX] vCPU {} XCR0 <- {:#x}", cx.vcpu.id, value);
    cx.vcpu.ctx.xstate.set_guest_xcr0(value);
    cx.advance_rip()?;
    Ok(ExitAction::Handled)
}

fn handle_ept_violation<H: VmxHal>(cx: &mut ExitContext<'_, '_, H>) -> Result<ExitAction> {
    let qualification = vmcs::exit_qualification(cx.vmcs)?;
    // The fault hit while an IRET was unblocking NMIs; block them again
    // so the retried IRET does it. (SDM Vol. 3C, Section 28.2.3)
    if qualification.get_bit(12) && cx.vcpu.reinject.is_none() {
        let intr = cx.vmcs.read(VmcsGuest32::INTERRUPTIBILITY_STATE)?;
        cx.vmcs.write(
            VmcsGuest32::INTERRUPTIBILITY_STATE,
            intr | InterruptibilityState::BLOCKING_BY_NMI.bits(),
        )?;
    }
    let fault = vmcs::ept_violation_info(cx.vmcs)?;
    let mut perm = MemoryAccess::empty();
    perm.set(MemoryAccess::READ, fault.read);
    perm.set(MemoryAccess::WRITE, fault.write);
    perm.set(MemoryAccess::EXECUTE, fault.execute);
    Ok(ExitAction::ReturnToCaller(ExitEvent::MemoryFault {
        gpa: fault.fault_guest_paddr,
        perm,
    }))
}
