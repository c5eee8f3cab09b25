//! VMX instructions not wrapped by the `x86` crate.

use core::arch::asm;

use bit_field::BitField;
use x86::vmx::{Result, VmFail};

use super::definitions::{InvEptType, InvVpidType};

/// Decodes RFLAGS after a VMX instruction. (SDM Vol. 3C, Section 31.2)
#[inline(always)]
fn vmx_capture_status() -> Result<()> {
    let flags: u64;
    unsafe { asm!("pushfq; pop {}", out(reg) flags) };

    if flags.get_bit(0) {
        Err(VmFail::VmFailInvalid)
    } else if flags.get_bit(6) {
        Err(VmFail::VmFailValid)
    } else {
        Ok(())
    }
}

/// Invalidate Translations Derived from EPT. (SDM Vol. 3C, Section 30.3)
///
/// # Safety
///
/// VMX operation must be enabled on the current CPU.
pub unsafe fn invept(inv_type: InvEptType, eptp: u64) -> Result<()> {
    let descriptor: [u64; 2] = [eptp, 0];
    unsafe {
        asm!(
            "invept {0}, [{1}]",
            in(reg) inv_type as u64,
            in(reg) &descriptor,
            options(nostack),
        )
    };
    vmx_capture_status()
}

/// Invalidate Translations Based on VPID. (SDM Vol. 3C, Section 30.3)
///
/// # Safety
///
/// VMX operation must be enabled on the current CPU.
pub unsafe fn invvpid(inv_type: InvVpidType, vpid: u16, address: u64) -> Result<()> {
    let descriptor: [u64; 2] = [vpid as u64, address];
    unsafe {
        asm!(
            "invvpid {0}, [{1}]",
            in(reg) inv_type as u64,
            in(reg) &descriptor,
            options(nostack),
        )
    };
    vmx_capture_status()
}
