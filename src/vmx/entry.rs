//! VM entry trampoline.
//!
//! `vmx_enter_guest` saves the host callee-saved registers, points the VMCS
//! host RSP at them and executes VMLAUNCH or VMRESUME with the guest GPRs
//! loaded. The VMCS host RIP is `vmx_exit_guest`, which stores the guest GPRs
//! back, unwinds the saved host frame and returns 0 to the caller of
//! `vmx_enter_guest`. A VMfail returns 1 without entering the guest.

use core::arch::global_asm;
use core::mem::offset_of;

use x86::vmx::{Result, VmFail};

use crate::regs::GeneralRegisters;

/// VMCS encoding of the host RSP field.
const VMCS_HOST_RSP: u64 = 0x6c14;

unsafe extern "sysv64" {
    fn vmx_enter_guest(regs: *mut GeneralRegisters, launched: u64) -> u64;
    fn vmx_exit_guest();
}

/// Runs the guest until the next VM exit.
///
/// # Safety
///
/// The VMCS of the guest must be current on this CPU, with its host-state
/// area filled in and host RIP set to [`exit_stub_address`].
pub unsafe fn enter_guest(regs: &mut GeneralRegisters, launched: bool) -> Result<()> {
    match unsafe { vmx_enter_guest(regs, launched as u64) } {
        0 => Ok(()),
        _ => Err(VmFail::VmFailValid),
    }
}

/// Address the processor jumps to on VM exit.
pub fn exit_stub_address() -> u64 {
    vmx_exit_guest as usize as u64
}

global_asm!(
    r#"
    .globl vmx_enter_guest
    .globl vmx_exit_guest

vmx_enter_guest:
    push    rbp
    push    rbx
    push    r12
    push    r13
    push    r14
    push    r15
    push    rdi

    mov     rax, {host_rsp}
    vmwrite rax, rsp
    jbe     .Lentry_failed

    test    rsi, rsi
    mov     rax, [rdi + {rax}]
    mov     rcx, [rdi + {rcx}]
    mov     rdx, [rdi + {rdx}]
    mov     rbx, [rdi + {rbx}]
    mov     rbp, [rdi + {rbp}]
    mov     rsi, [rdi + {rsi}]
    mov     r8,  [rdi + {r8}]
    mov     r9,  [rdi + {r9}]
    mov     r10, [rdi + {r10}]
    mov     r11, [rdi + {r11}]
    mov     r12, [rdi + {r12}]
    mov     r13, [rdi + {r13}]
    mov     r14, [rdi + {r14}]
    mov     r15, [rdi + {r15}]
    mov     rdi, [rdi + {rdi}]
    jnz     .Lresume

    vmlaunch
    jmp     .Lentry_failed

.Lresume:
    vmresume

.Lentry_failed:
    pop     rdi
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rbx
    pop     rbp
    mov     rax, 1
    ret

vmx_exit_guest:
    push    rdi
    mov     rdi, [rsp + 8]
    mov     [rdi + {rax}], rax
    mov     [rdi + {rcx}], rcx
    mov     [rdi + {rdx}], rdx
    mov     [rdi + {rbx}], rbx
    mov     [rdi + {rbp}], rbp
    mov     [rdi + {rsi}], rsi
    mov     [rdi + {r8}],  r8
    mov     [rdi + {r9}],  r9
    mov     [rdi + {r10}], r10
    mov     [rdi + {r11}], r11
    mov     [rdi + {r12}], r12
    mov     [rdi + {r13}], r13
    mov     [rdi + {r14}], r14
    mov     [rdi + {r15}], r15
    pop     rax
    mov     [rdi + {rdi}], rax

    pop     rdi
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rbx
    pop     rbp
    xor     eax, eax
    ret
"#,
    host_rsp = const VMCS_HOST_RSP,
    rax = const offset_of!(GeneralRegisters, rax),
    rcx = const offset_of!(GeneralRegisters, rcx),
    rdx = const offset_of!(GeneralRegisters, rdx),
    rbx = const offset_of!(GeneralRegisters, rbx),
    rbp = const offset_of!(GeneralRegisters, rbp),
    rsi = const offset_of!(GeneralRegisters, rsi),
    rdi = const offset_of!(GeneralRegisters, rdi),
    r8 = const offset_of!(GeneralRegisters, r8),
    r9 = const offset_of!(GeneralRegisters, r9),
    r10 = const offset_of!(GeneralRegisters, r10),
    r11 = const offset_of!(GeneralRegisters, r11),
    r12 = const offset_of!(GeneralRegisters, r12),
    r13 = const offset_of!(GeneralRegisters, r13),
    r14 = const offset_of!(GeneralRegisters, r14),
    r15 = const offset_of!(GeneralRegisters, r15),
);
