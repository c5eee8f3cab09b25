//! Guest register state: the snapshot exchanged with callers and its mapping
//! onto VMCS fields and the host-side copies of what the VMCS lacks.

use alloc::format;

use bit_field::BitField;
use x86::controlregs::Xcr0;
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::model_specific::EferFlags;

use super::caps::VmxCapabilities;
use super::residency::VmcsGuard;
use super::structs::{MsrList, VirtApicPage};
use super::vmcs::controls::EntryControls;
use super::vmcs::{
    self, VmcsControl32, VmcsControlNW, VmcsGuest16, VmcsGuest32, VmcsGuest64, VmcsGuestNW,
};
use crate::msr::Msr;
use crate::regs::GeneralRegisters;
use crate::xstate::{FpuState, XState};
use crate::{Result, VmxError, VmxHal};

bitflags::bitflags! {
    /// Groups of guest state transferred by `get_state` and `set_state`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateGroups: u32 {
        /// General-purpose registers, RSP, RIP and RFLAGS.
        const GPRS = 1 << 0;
        /// Segment registers, GDTR and IDTR.
        const SEGS = 1 << 1;
        /// CR0, CR2, CR3, CR4, CR8 and XCR0.
        const CRS = 1 << 2;
        /// DR0-DR3, DR6 and DR7.
        const DRS = 1 << 3;
        const MSRS = 1 << 4;
        /// Interruptibility and activity state.
        const INTR = 1 << 5;
        const FPU = 1 << 6;
        const ALL = Self::GPRS.bits()
            | Self::SEGS.bits()
            | Self::CRS.bits()
            | Self::DRS.bits()
            | Self::MSRS.bits()
            | Self::INTR.bits()
            | Self::FPU.bits();
    }
}

/// Segment access rights in the VMCS format. (SDM Vol. 3C, Section 24.4.1, Table 24-2)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentAttrib(pub u32);

impl SegmentAttrib {
    pub const UNUSABLE: Self = Self(1 << 16);
    /// Present, read/write data, accessed.
    pub const DATA: Self = Self(0x93);
    /// Present, execute/read code, accessed.
    pub const CODE: Self = Self(0x9b);
    /// Present, busy 32-bit TSS.
    pub const TSS_BUSY: Self = Self(0x8b);
    /// Present, LDT.
    pub const LDT: Self = Self(0x82);

    pub fn seg_type(&self) -> u8 {
        self.0.get_bits(0..4) as u8
    }

    /// Code or data segment, as opposed to a system one.
    pub fn is_code_or_data(&self) -> bool {
        self.0.get_bit(4)
    }

    pub fn dpl(&self) -> u8 {
        self.0.get_bits(5..7) as u8
    }

    pub fn present(&self) -> bool {
        self.0.get_bit(7)
    }

    pub fn is_long(&self) -> bool {
        self.0.get_bit(13)
    }

    pub fn is_default_32(&self) -> bool {
        self.0.get_bit(14)
    }

    pub fn granularity(&self) -> bool {
        self.0.get_bit(15)
    }

    pub fn unusable(&self) -> bool {
        self.0.get_bit(16)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub attrib: SegmentAttrib,
}

impl Segment {
    /// Real-mode style segment with a 64K limit, as after RESET.
    pub const fn flat16(attrib: SegmentAttrib) -> Self {
        Self {
            selector: 0,
            base: 0,
            limit: 0xffff,
            attrib,
        }
    }
}

/// Segment registers, in VMCS encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentReg {
    ES = 0,
    CS = 1,
    SS = 2,
    DS = 3,
    FS = 4,
    GS = 5,
    LDTR = 6,
    TR = 7,
}

impl SegmentReg {
    pub const ALL: [SegmentReg; 8] = [
        Self::ES,
        Self::CS,
        Self::SS,
        Self::DS,
        Self::FS,
        Self::GS,
        Self::LDTR,
        Self::TR,
    ];
}

macro_rules! segment_fields {
    ($($seg:ident),*) => {
        paste::paste! {
            fn read_segment<H: VmxHal>(vmcs: &VmcsGuard<'_, H>, seg: SegmentReg) -> Result<Segment> {
                match seg {
                    $(SegmentReg::$seg => Ok(Segment {
                        selector: vmcs.read(VmcsGuest16::[<$seg _SELECTOR>])?,
                        base: vmcs.read(VmcsGuestNW::[<$seg _BASE>])?,
                        limit: vmcs.read(VmcsGuest32::[<$seg _LIMIT>])?,
                        attrib: SegmentAttrib(vmcs.read(VmcsGuest32::[<$seg _ACCESS_RIGHTS>])?),
                    }),)*
                }
            }

            fn write_segment<H: VmxHal>(
                vmcs: &VmcsGuard<'_, H>,
                seg: SegmentReg,
                value: &Segment,
            ) -> Result {
                match seg {
                    $(SegmentReg::$seg => {
                        vmcs.write(VmcsGuest16::[<$seg _SELECTOR>], value.selector)?;
                        vmcs.write(VmcsGuestNW::[<$seg _BASE>], value.base)?;
                        vmcs.write(VmcsGuest32::[<$seg _LIMIT>], value.limit)?;
                        vmcs.write(VmcsGuest32::[<$seg _ACCESS_RIGHTS>], value.attrib.0)?;
                    })*
                }
                Ok(())
            }
        }
    };
}

segment_fields!(ES, CS, SS, DS, FS, GS, LDTR, TR);

/// Architectural state of one guest CPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcpuState {
    pub regs: GeneralRegisters,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,

    pub segs: [Segment; 8],
    pub gdtr_base: u64,
    pub gdtr_limit: u32,
    pub idtr_base: u64,
    pub idtr_limit: u32,

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub xcr0: u64,

    pub dr: [u64; 4],
    pub dr6: u64,
    pub dr7: u64,

    pub efer: u64,
    pub pat: u64,
    pub sysenter_cs: u32,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub fmask: u64,
    pub kernel_gs_base: u64,

    pub interruptibility: u32,
    pub activity: u32,

    pub fpu: FpuState,
}

impl VcpuState {
    pub fn seg(&self, seg: SegmentReg) -> &Segment {
        &self.segs[seg as usize]
    }

    pub fn seg_mut(&mut self, seg: SegmentReg) -> &mut Segment {
        &mut self.segs[seg as usize]
    }

    /// Architectural state after RESET. (SDM Vol. 3A, Section 10.1.1, Table 10-1)
    pub fn reset() -> Self {
        let mut segs = [Segment::flat16(SegmentAttrib::DATA); 8];
        segs[SegmentReg::CS as usize] = Segment {
            selector: 0xf000,
            base: 0xffff_0000,
            limit: 0xffff,
            attrib: SegmentAttrib::CODE,
        };
        segs[SegmentReg::LDTR as usize] = Segment::flat16(SegmentAttrib::LDT);
        segs[SegmentReg::TR as usize] = Segment::flat16(SegmentAttrib::TSS_BUSY);
        Self {
            regs: GeneralRegisters::default(),
            rsp: 0,
            rip: 0xfff0,
            rflags: 0x2,
            segs,
            gdtr_base: 0,
            gdtr_limit: 0xffff,
            idtr_base: 0,
            idtr_limit: 0xffff,
            cr0: (Cr0Flags::NOT_WRITE_THROUGH
                | Cr0Flags::CACHE_DISABLE
                | Cr0Flags::EXTENSION_TYPE)
                .bits(),
            cr2: 0,
            cr3: 0,
            cr4: 0,
            cr8: 0,
            xcr0: Xcr0::XCR0_FPU_MMX_STATE.bits(),
            dr: [0; 4],
            dr6: 0xffff_0ff0,
            dr7: 0x400,
            efer: 0,
            pat: 0x0007_0406_0007_0406,
            sysenter_cs: 0,
            sysenter_esp: 0,
            sysenter_eip: 0,
            star: 0,
            lstar: 0,
            cstar: 0,
            fmask: 0,
            kernel_gs_base: 0,
            interruptibility: 0,
            activity: 0,
            fpu: FpuState::reset(),
        }
    }
}

/// Guest state kept by the host because the VMCS has no field for it.
pub(crate) struct GuestContext<H: VmxHal> {
    pub regs: GeneralRegisters,
    pub cr2: u64,
    /// CR8 when the processor cannot shadow the TPR.
    cr8: u64,
    /// Holds CR8 instead when it can.
    pub vapic: Option<VirtApicPage<H>>,
    pub dr: [u64; 4],
    pub dr6: u64,
    pub xstate: XState,
    pub msrs: MsrList<H>,
    pub misc_enable: u64,
    /// Groups that the caller's last transfer left valid.
    pub cached: StateGroups,
    /// Set when a paging-relevant change requires a VPID flush before entry.
    pub flush_tlb: bool,
}

impl<H: VmxHal> GuestContext<H> {
    pub fn new(caps: &VmxCapabilities, misc_enable: u64) -> Result<Self> {
        Ok(Self {
            regs: GeneralRegisters::default(),
            cr2: 0,
            cr8: 0,
            vapic: caps.tpr_shadow.then(VirtApicPage::new).transpose()?,
            dr: [0; 4],
            dr6: 0xffff_0ff0,
            xstate: XState::new(caps.xcr0_mask),
            msrs: MsrList::new(caps.l1d_flush)?,
            misc_enable,
            cached: StateGroups::empty(),
            flush_tlb: true,
        })
    }

    pub fn cr8(&self) -> u64 {
        self.vapic.as_ref().map_or(self.cr8, VirtApicPage::cr8)
    }

    pub fn set_cr8(&mut self, value: u64) {
        match self.vapic.as_mut() {
            Some(vapic) => vapic.set_cr8(value),
            None => self.cr8 = value,
        }
    }
}

const CR0_PAGING_BITS: u64 = Cr0Flags::PAGING.bits()
    | Cr0Flags::WRITE_PROTECT.bits()
    | Cr0Flags::CACHE_DISABLE.bits()
    | Cr0Flags::NOT_WRITE_THROUGH.bits();
const CR4_PAGING_BITS: u64 = Cr4Flags::PAGE_GLOBAL.bits()
    | Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits()
    | Cr4Flags::PAGE_SIZE_EXTENSION.bits();
const EFER_PAGING_BITS: u64 = EferFlags::NO_EXECUTE_ENABLE.bits()
    | EferFlags::LONG_MODE_ACTIVE.bits()
    | EferFlags::LONG_MODE_ENABLE.bits();

/// CR0 bits the host owns: those it forces plus those VMX pins.
fn cr0_owned(caps: &VmxCapabilities) -> (u64, u64) {
    let forced1 = (Cr0Flags::NUMERIC_ERROR | Cr0Flags::EXTENSION_TYPE).bits() | caps.cr0_fixed0;
    let forced0 = (Cr0Flags::CACHE_DISABLE | Cr0Flags::NOT_WRITE_THROUGH).bits() | !caps.cr0_fixed1;
    (forced1, forced0)
}

fn cr4_owned(caps: &VmxCapabilities) -> (u64, u64) {
    let forced1 = Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits() | caps.cr4_fixed0;
    (forced1, !caps.cr4_fixed1)
}

/// Whether a guest may load `value` into CR0. (SDM Vol. 3A, Section 2.5)
pub(crate) fn cr0_acceptable(value: u64) -> bool {
    let pe = value & Cr0Flags::PROTECTED_MODE_ENABLE.bits() != 0;
    let pg = value & Cr0Flags::PAGING.bits() != 0;
    let cd = value & Cr0Flags::CACHE_DISABLE.bits() != 0;
    let nw = value & Cr0Flags::NOT_WRITE_THROUGH.bits() != 0;
    value >> 32 == 0 && !(pg && !pe) && !(nw && !cd)
}

/// Whether a guest may load `value` into CR4.
pub(crate) fn cr4_acceptable(caps: &VmxCapabilities, value: u64) -> bool {
    let vmxe = Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
    value & vmxe == 0 && value & !(caps.cr4_fixed1 | caps.cr4_fixed0) == 0
}

/// Whether XSETBV may load `value` into XCR0. (SDM Vol. 1, Section 13.3)
pub(crate) fn xcr0_acceptable(caps: &VmxCapabilities, value: u64) -> bool {
    let x87 = Xcr0::XCR0_FPU_MMX_STATE.bits();
    let sse = Xcr0::XCR0_SSE_STATE.bits();
    let avx = Xcr0::XCR0_AVX_STATE.bits();
    value & x87 != 0 && value & !caps.xcr0_mask == 0 && !(value & avx != 0 && value & sse == 0)
}

/// Loads a guest CR0: the guest reads back `value` through the shadow, the
/// processor runs with the forced bits. Returns whether paging changed.
pub(crate) fn write_cr0<H: VmxHal>(
    vmcs: &VmcsGuard<'_, H>,
    caps: &VmxCapabilities,
    value: u64,
) -> Result<bool> {
    let (forced1, forced0) = cr0_owned(caps);
    let effective = (value | forced1) & !forced0;
    let old = vmcs.read(VmcsGuestNW::CR0)?;
    vmcs.write(VmcsGuestNW::CR0, effective)?;
    vmcs.write(VmcsControlNW::CR0_GUEST_HOST_MASK, forced1 | forced0)?;
    vmcs.write(VmcsControlNW::CR0_READ_SHADOW, value)?;
    if old & Cr0Flags::PAGING.bits() != effective & Cr0Flags::PAGING.bits() {
        debug!("[VMX] guest CR0.PG {}", effective & Cr0Flags::PAGING.bits() != 0);
    }
    let efer_changed = sync_long_mode(vmcs, effective & Cr0Flags::PAGING.bits() != 0)?;
    Ok((old ^ effective) & CR0_PAGING_BITS != 0 || efer_changed)
}

/// Long mode is active exactly when paging is on and LME is set.
/// (SDM Vol. 3A, Section 10.8.5)
fn sync_long_mode<H: VmxHal>(vmcs: &VmcsGuard<'_, H>, paging: bool) -> Result<bool> {
    let efer = vmcs.read(VmcsGuest64::IA32_EFER)?;
    let lma = paging && efer & EferFlags::LONG_MODE_ENABLE.bits() != 0;
    let want = if lma {
        efer | EferFlags::LONG_MODE_ACTIVE.bits()
    } else {
        efer & !EferFlags::LONG_MODE_ACTIVE.bits()
    };
    if want == efer {
        return Ok(false);
    }
    debug!("[VMX] guest EFER.LMA {}", lma);
    write_efer(vmcs, want)
}

pub(crate) fn write_cr4<H: VmxHal>(
    vmcs: &VmcsGuard<'_, H>,
    caps: &VmxCapabilities,
    value: u64,
) -> Result<bool> {
    let (forced1, forced0) = cr4_owned(caps);
    let shadow = value & !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
    let effective = (shadow | forced1) & !forced0;
    let old = vmcs.read(VmcsGuestNW::CR4)?;
    vmcs.write(VmcsGuestNW::CR4, effective)?;
    vmcs.write(VmcsControlNW::CR4_GUEST_HOST_MASK, forced1 | forced0)?;
    vmcs.write(VmcsControlNW::CR4_READ_SHADOW, shadow)?;
    Ok((old ^ effective) & CR4_PAGING_BITS != 0)
}

fn guest_visible(effective: u64, shadow: u64, mask: u64) -> u64 {
    (shadow & mask) | (effective & !mask)
}

/// CR0 as the guest reads it.
pub(crate) fn read_cr0<H: VmxHal>(vmcs: &VmcsGuard<'_, H>) -> Result<u64> {
    Ok(guest_visible(
        vmcs.read(VmcsGuestNW::CR0)?,
        vmcs.read(VmcsControlNW::CR0_READ_SHADOW)?,
        vmcs.read(VmcsControlNW::CR0_GUEST_HOST_MASK)?,
    ))
}

/// CR4 as the guest reads it, never with VMXE.
pub(crate) fn read_cr4<H: VmxHal>(vmcs: &VmcsGuard<'_, H>) -> Result<u64> {
    let cr4 = guest_visible(
        vmcs.read(VmcsGuestNW::CR4)?,
        vmcs.read(VmcsControlNW::CR4_READ_SHADOW)?,
        vmcs.read(VmcsControlNW::CR4_GUEST_HOST_MASK)?,
    );
    Ok(cr4 & !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits())
}

/// Loads the guest EFER and keeps the IA-32e mode entry control equal to LMA.
/// Returns whether paging changed.
pub(crate) fn write_efer<H: VmxHal>(vmcs: &VmcsGuard<'_, H>, value: u64) -> Result<bool> {
    let old = vmcs.read(VmcsGuest64::IA32_EFER)?;
    vmcs.write(VmcsGuest64::IA32_EFER, value)?;
    vmcs::update_control(
        vmcs,
        VmcsControl32::VMENTRY_CONTROLS,
        EntryControls::IA32E_MODE_GUEST.bits(),
        value & EferFlags::LONG_MODE_ACTIVE.bits() != 0,
    )?;
    Ok((old ^ value) & EFER_PAGING_BITS != 0)
}

/// Copies the requested groups out of the VMCS and `ctx` into `state`.
pub(crate) fn export<H: VmxHal>(
    vmcs: &VmcsGuard<'_, H>,
    ctx: &mut GuestContext<H>,
    groups: StateGroups,
    state: &mut VcpuState,
) -> Result {
    if groups.contains(StateGroups::GPRS) {
        state.regs = ctx.regs;
        state.rsp = vmcs.read(VmcsGuestNW::RSP)?;
        state.rip = vmcs.read(VmcsGuestNW::RIP)?;
        state.rflags = vmcs.read(VmcsGuestNW::RFLAGS)?;
    }
    if groups.contains(StateGroups::SEGS) {
        for seg in SegmentReg::ALL {
            state.segs[seg as usize] = read_segment(vmcs, seg)?;
        }
        state.gdtr_base = vmcs.read(VmcsGuestNW::GDTR_BASE)?;
        state.gdtr_limit = vmcs.read(VmcsGuest32::GDTR_LIMIT)?;
        state.idtr_base = vmcs.read(VmcsGuestNW::IDTR_BASE)?;
        state.idtr_limit = vmcs.read(VmcsGuest32::IDTR_LIMIT)?;
    }
    if groups.contains(StateGroups::CRS) {
        state.cr0 = read_cr0(vmcs)?;
        state.cr2 = ctx.cr2;
        state.cr3 = vmcs.read(VmcsGuestNW::CR3)?;
        state.cr4 = read_cr4(vmcs)?;
        state.cr8 = ctx.cr8();
        state.xcr0 = ctx.xstate.guest_xcr0();
    }
    if groups.contains(StateGroups::DRS) {
        state.dr = ctx.dr;
        state.dr6 = ctx.dr6;
        state.dr7 = vmcs.read(VmcsGuestNW::DR7)?;
    }
    if groups.contains(StateGroups::MSRS) {
        state.efer = vmcs.read(VmcsGuest64::IA32_EFER)?;
        state.pat = vmcs.read(VmcsGuest64::IA32_PAT)?;
        state.sysenter_cs = vmcs.read(VmcsGuest32::IA32_SYSENTER_CS)?;
        state.sysenter_esp = vmcs.read(VmcsGuestNW::IA32_SYSENTER_ESP)?;
        state.sysenter_eip = vmcs.read(VmcsGuestNW::IA32_SYSENTER_EIP)?;
        let msr = |m| ctx.msrs.get(m).unwrap_or(0);
        state.star = msr(Msr::IA32_STAR);
        state.lstar = msr(Msr::IA32_LSTAR);
        state.cstar = msr(Msr::IA32_CSTAR);
        state.fmask = msr(Msr::IA32_FMASK);
        state.kernel_gs_base = msr(Msr::IA32_KERNEL_GSBASE);
    }
    if groups.contains(StateGroups::INTR) {
        state.interruptibility = vmcs.read(VmcsGuest32::INTERRUPTIBILITY_STATE)?;
        state.activity = vmcs.read(VmcsGuest32::ACTIVITY_STATE)?;
    }
    if groups.contains(StateGroups::FPU) {
        state.fpu = ctx.xstate.guest_fpu();
    }
    ctx.cached |= groups;
    Ok(())
}

/// Writes the requested groups of `state` into the VMCS and `ctx`.
///
/// Control registers and XCR0 are checked first, so a rejected snapshot
/// leaves the vCPU untouched.
pub(crate) fn import<H: VmxHal>(
    vmcs: &VmcsGuard<'_, H>,
    ctx: &mut GuestContext<H>,
    caps: &VmxCapabilities,
    groups: StateGroups,
    state: &VcpuState,
) -> Result {
    if groups.contains(StateGroups::CRS) {
        if !cr0_acceptable(state.cr0) {
            return Err(VmxError::InvalidInput(format!("CR0 {:#x}", state.cr0)));
        }
        if !cr4_acceptable(caps, state.cr4) {
            return Err(VmxError::InvalidInput(format!("CR4 {:#x}", state.cr4)));
        }
        if !xcr0_acceptable(caps, state.xcr0) {
            return Err(VmxError::InvalidInput(format!("XCR0 {:#x}", state.xcr0)));
        }
        if state.cr8 > 0xf {
            return Err(VmxError::InvalidInput(format!("CR8 {:#x}", state.cr8)));
        }
    }

    let mut flush = false;
    if groups.contains(StateGroups::GPRS) {
        ctx.regs = state.regs;
        vmcs.write(VmcsGuestNW::RSP, state.rsp)?;
        vmcs.write(VmcsGuestNW::RIP, state.rip)?;
        // Bit 1 of RFLAGS is reserved as 1.
        vmcs.write(VmcsGuestNW::RFLAGS, state.rflags | 0x2)?;
    }
    if groups.contains(StateGroups::SEGS) {
        for seg in SegmentReg::ALL {
            write_segment(vmcs, seg, &state.segs[seg as usize])?;
        }
        vmcs.write(VmcsGuestNW::GDTR_BASE, state.gdtr_base)?;
        vmcs.write(VmcsGuest32::GDTR_LIMIT, state.gdtr_limit)?;
        vmcs.write(VmcsGuestNW::IDTR_BASE, state.idtr_base)?;
        vmcs.write(VmcsGuest32::IDTR_LIMIT, state.idtr_limit)?;
    }
    if groups.contains(StateGroups::CRS) {
        flush |= write_cr0(vmcs, caps, state.cr0)?;
        flush |= write_cr4(vmcs, caps, state.cr4)?;
        if vmcs.read(VmcsGuestNW::CR3)? != state.cr3 {
            vmcs.write(VmcsGuestNW::CR3, state.cr3)?;
            flush = true;
        }
        ctx.cr2 = state.cr2;
        ctx.set_cr8(state.cr8);
        ctx.xstate.set_guest_xcr0(state.xcr0);
    }
    if groups.contains(StateGroups::DRS) {
        ctx.dr = state.dr;
        ctx.dr6 = state.dr6;
        vmcs.write(VmcsGuestNW::DR7, state.dr7)?;
    }
    if groups.contains(StateGroups::MSRS) {
        flush |= write_efer(vmcs, state.efer)?;
        vmcs.write(VmcsGuest64::IA32_PAT, state.pat)?;
        vmcs.write(VmcsGuest32::IA32_SYSENTER_CS, state.sysenter_cs)?;
        vmcs.write(VmcsGuestNW::IA32_SYSENTER_ESP, state.sysenter_esp)?;
        vmcs.write(VmcsGuestNW::IA32_SYSENTER_EIP, state.sysenter_eip)?;
        ctx.msrs.set(Msr::IA32_STAR, state.star);
        ctx.msrs.set(Msr::IA32_LSTAR, state.lstar);
        ctx.msrs.set(Msr::IA32_CSTAR, state.cstar);
        ctx.msrs.set(Msr::IA32_FMASK, state.fmask);
        ctx.msrs.set(Msr::IA32_KERNEL_GSBASE, state.kernel_gs_base);
    }
    if groups.contains(StateGroups::INTR) {
        vmcs.write(VmcsGuest32::INTERRUPTIBILITY_STATE, state.interruptibility)?;
        vmcs.write(VmcsGuest32::ACTIVITY_STATE, state.activity)?;
    }
    if groups.contains(StateGroups::FPU) {
        ctx.xstate.set_guest_fpu(&state.fpu, caps.mxcsr_mask);
    }
    if flush {
        ctx.flush_tlb = true;
    }
    ctx.cached |= groups;
    Ok(())
}
