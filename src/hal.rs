use core::arch::asm;

use bit_field::BitField;
use raw_cpuid::CpuIdResult;
use x86::bits64::vmx;
use x86::dtables::{self, DescriptorTablePointer};
use x86::segmentation::SegmentSelector;
use x86::vmx::Result as VmResult;
use x86_64::instructions::interrupts;
use x86_64::registers::control::{Cr0, Cr3, Cr4};

use crate::msr::Msr;
use crate::regs::GeneralRegisters;
use crate::vmx::definitions::{InvEptType, InvVpidType};
use crate::vmx::{entry, instructions};
use crate::xstate::XSaveArea;
use crate::{HostPhysAddr, HostVirtAddr};

/// Host register state written into the VMCS host-state area.
///
/// Only the fields that differ between physical CPUs (TR, GDTR, IDTR and the
/// FS/GS bases) need to be refreshed when a vCPU migrates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub es: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub fs: u16,
    pub gs: u16,
    pub tr: u16,
    pub fs_base: u64,
    pub gs_base: u64,
    pub tr_base: u64,
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub sysenter_cs: u32,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub efer: u64,
    pub pat: u64,
    /// Where the processor resumes the host after a VM exit.
    pub rip: u64,
}

/// The interfaces the VMX engine needs from the host kernel and the processor.
///
/// Host services have no default and must be provided by the kernel. Hardware
/// operations default to the real instructions; a kernel normally only
/// implements the first group.
pub trait VmxHal: Sized + 'static {
    /// Allocates a 4K-sized physical frame.
    fn alloc_frame() -> Option<HostPhysAddr>;
    /// Deallocates a frame returned by [`VmxHal::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr);
    /// Converts a host physical address to a virtual address usable by the kernel.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;
    /// Index of the physical CPU the caller is running on.
    fn current_cpu_id() -> usize;
    /// Disables preemption on the current CPU. Calls nest.
    fn preempt_disable();
    /// Re-enables preemption on the current CPU.
    fn preempt_enable();
    /// Interrupts `cpu_id` so that it calls
    /// [`VmxPerCpuState::drain_evictions`](crate::VmxPerCpuState::drain_evictions).
    fn send_ipi(cpu_id: usize);

    /// Whether the scheduler wants the CPU back; polled after each handled exit.
    fn should_yield() -> bool {
        false
    }

    /// Disables local interrupts, returning whether they were enabled.
    fn irq_save_disable() -> bool {
        let enabled = interrupts::are_enabled();
        interrupts::disable();
        enabled
    }

    fn irq_restore(enabled: bool) {
        if enabled {
            interrupts::enable();
        }
    }

    /// Hands an NMI that arrived while the guest was running back to the host.
    fn host_nmi() {
        unsafe { asm!("int 2") }
    }

    fn rdmsr(msr: u32) -> u64 {
        unsafe { x86::msr::rdmsr(msr) }
    }

    fn wrmsr(msr: u32, value: u64) {
        unsafe { x86::msr::wrmsr(msr, value) }
    }

    fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
        raw_cpuid::cpuid!(leaf, subleaf)
    }

    fn rdtsc() -> u64 {
        unsafe { x86::time::rdtsc() }
    }

    fn read_cr0() -> u64 {
        Cr0::read_raw()
    }

    fn read_cr4() -> u64 {
        Cr4::read_raw()
    }

    fn write_cr4(value: u64) {
        unsafe { Cr4::write_raw(value) }
    }

    fn read_cr2() -> u64 {
        let value: u64;
        unsafe { asm!("mov {}, cr2", out(reg) value, options(nomem, nostack)) };
        value
    }

    fn write_cr2(value: u64) {
        unsafe { asm!("mov cr2, {}", in(reg) value, options(nomem, nostack)) };
    }

    /// Reads DR0-DR3 (`index` 0..=3) or DR6 (`index` 6).
    fn read_dr(index: u8) -> u64 {
        let value: u64;
        unsafe {
            match index {
                0 => asm!("mov {}, dr0", out(reg) value, options(nomem, nostack)),
                1 => asm!("mov {}, dr1", out(reg) value, options(nomem, nostack)),
                2 => asm!("mov {}, dr2", out(reg) value, options(nomem, nostack)),
                3 => asm!("mov {}, dr3", out(reg) value, options(nomem, nostack)),
                6 => asm!("mov {}, dr6", out(reg) value, options(nomem, nostack)),
                _ => panic!("Illegal debug register index {index}"),
            }
        }
        value
    }

    fn write_dr(index: u8, value: u64) {
        unsafe {
            match index {
                0 => asm!("mov dr0, {}", in(reg) value, options(nomem, nostack)),
                1 => asm!("mov dr1, {}", in(reg) value, options(nomem, nostack)),
                2 => asm!("mov dr2, {}", in(reg) value, options(nomem, nostack)),
                3 => asm!("mov dr3, {}", in(reg) value, options(nomem, nostack)),
                6 => asm!("mov dr6, {}", in(reg) value, options(nomem, nostack)),
                _ => panic!("Illegal debug register index {index}"),
            }
        }
    }

    fn xcr0() -> u64 {
        let (lo, hi): (u32, u32);
        unsafe {
            asm!("xgetbv", in("ecx") 0, out("eax") lo, out("edx") hi, options(nomem, nostack))
        };
        (hi as u64) << 32 | lo as u64
    }

    fn set_xcr0(value: u64) {
        unsafe {
            asm!(
                "xsetbv",
                in("ecx") 0,
                in("eax") value as u32,
                in("edx") (value >> 32) as u32,
                options(nomem, nostack),
            )
        };
    }

    /// Saves the components in `mask` into `area` with XSAVE.
    fn fpu_save(area: &mut XSaveArea, mask: u64) {
        unsafe {
            asm!(
                "xsave64 [{}]",
                in(reg) area as *mut XSaveArea,
                in("eax") mask as u32,
                in("edx") (mask >> 32) as u32,
                options(nostack),
            )
        };
    }

    /// Restores the components in `mask` from `area` with XRSTOR.
    fn fpu_restore(area: &XSaveArea, mask: u64) {
        unsafe {
            asm!(
                "xrstor64 [{}]",
                in(reg) area as *const XSaveArea,
                in("eax") mask as u32,
                in("edx") (mask >> 32) as u32,
                options(nostack),
            )
        };
    }

    fn vmxon(paddr: HostPhysAddr) -> VmResult<()> {
        unsafe { vmx::vmxon(paddr.as_usize() as u64) }
    }

    fn vmxoff() -> VmResult<()> {
        unsafe { vmx::vmxoff() }
    }

    fn vmptrld(paddr: HostPhysAddr) -> VmResult<()> {
        unsafe { vmx::vmptrld(paddr.as_usize() as u64) }
    }

    fn vmclear(paddr: HostPhysAddr) -> VmResult<()> {
        unsafe { vmx::vmclear(paddr.as_usize() as u64) }
    }

    fn vmread(field: u32) -> VmResult<u64> {
        unsafe { vmx::vmread(field) }
    }

    fn vmwrite(field: u32, value: u64) -> VmResult<()> {
        unsafe { vmx::vmwrite(field, value) }
    }

    fn invept(inv_type: InvEptType, eptp: u64) -> VmResult<()> {
        unsafe { instructions::invept(inv_type, eptp) }
    }

    fn invvpid(inv_type: InvVpidType, vpid: u16) -> VmResult<()> {
        unsafe { instructions::invvpid(inv_type, vpid, 0) }
    }

    /// Enters the guest with the GPRs in `regs` and stores them back on VM exit.
    ///
    /// Uses VMRESUME when `launched`, VMLAUNCH otherwise. Returns `Ok` once the
    /// guest has exited, or the VMfail status if the instruction itself failed.
    fn vm_entry(regs: &mut GeneralRegisters, launched: bool) -> VmResult<()> {
        unsafe { entry::enter_guest(regs, launched) }
    }

    /// Snapshot of the current CPU's host state.
    fn host_state() -> HostState {
        let mut gdtp = DescriptorTablePointer::<u64>::default();
        let mut idtp = DescriptorTablePointer::<u64>::default();
        unsafe {
            dtables::sgdt(&mut gdtp);
            dtables::sidt(&mut idtp);
        }
        let tr = unsafe { x86::task::tr() };

        HostState {
            cr0: Cr0::read_raw(),
            cr3: Cr3::read_raw().0.start_address().as_u64(),
            cr4: Cr4::read_raw(),
            es: x86::segmentation::es().bits(),
            cs: x86::segmentation::cs().bits(),
            ss: x86::segmentation::ss().bits(),
            ds: x86::segmentation::ds().bits(),
            fs: x86::segmentation::fs().bits(),
            gs: x86::segmentation::gs().bits(),
            tr: tr.bits(),
            fs_base: Msr::IA32_FS_BASE.read::<Self>(),
            gs_base: Msr::IA32_GS_BASE.read::<Self>(),
            tr_base: tr_base(tr, &gdtp),
            gdtr_base: gdtp.base as u64,
            idtr_base: idtp.base as u64,
            sysenter_cs: Msr::IA32_SYSENTER_CS.read::<Self>() as u32,
            sysenter_esp: Msr::IA32_SYSENTER_ESP.read::<Self>(),
            sysenter_eip: Msr::IA32_SYSENTER_EIP.read::<Self>(),
            efer: Msr::IA32_EFER.read::<Self>(),
            pat: Msr::IA32_PAT.read::<Self>(),
            rip: entry::exit_stub_address(),
        }
    }
}

fn tr_base(tr: SegmentSelector, gdt: &DescriptorTablePointer<u64>) -> u64 {
    let index = tr.index() as usize;
    let table_len = (gdt.limit as usize + 1) / core::mem::size_of::<u64>();
    let table = unsafe { core::slice::from_raw_parts(gdt.base, table_len) };
    let entry = table[index];
    if entry & (1 << 47) != 0 {
        // present
        let base_low = entry.get_bits(16..40) | entry.get_bits(56..64) << 24;
        let base_high = table[index + 1] & 0xffff_ffff;
        base_low | base_high << 32
    } else {
        0
    }
}
