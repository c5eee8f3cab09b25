use bit_field::BitField;
use bitflags::bitflags;

use crate::frame::{PAGE_SIZE, PhysFrame};
use crate::msr::Msr;
use crate::{HostPhysAddr, Result, VmxHal};

/// VMCS/VMXON region in 4K size. (SDM Vol. 3C, Section 24.2)
#[derive(Debug)]
pub struct VmxRegion<H: VmxHal> {
    frame: PhysFrame<H>,
}

impl<H: VmxHal> VmxRegion<H> {
    pub const unsafe fn uninit() -> Self {
        Self {
            frame: unsafe { PhysFrame::uninit() },
        }
    }

    pub fn new(revision_id: u32, shadow_indicator: bool) -> Result<Self> {
        let frame = PhysFrame::alloc_zero()?;
        unsafe {
            (*(frame.as_mut_ptr() as *mut u32))
                .set_bits(0..=30, revision_id)
                .set_bit(31, shadow_indicator);
        }
        Ok(Self { frame })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }

    pub fn is_allocated(&self) -> bool {
        self.frame.is_allocated()
    }
}

/// MSR-Bitmap Address. (SDM Vol. 3C, Section 24.6.9)
///
/// One bit per MSR and direction; a set bit makes the access exit.
#[derive(Debug)]
pub struct MsrBitmap<H: VmxHal> {
    frame: PhysFrame<H>,
}

impl<H: VmxHal> MsrBitmap<H> {
    const WRITE_OFFSET: usize = 0x800;
    const HIGH_OFFSET: usize = 0x400;

    pub fn intercept_all() -> Result<Self> {
        let mut frame = PhysFrame::alloc()?;
        frame.fill(u8::MAX);
        Ok(Self { frame })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }

    fn bitmap(&self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.frame.as_mut_ptr(), PAGE_SIZE) }
    }

    fn locate(msr: u32, is_write: bool) -> Option<(usize, usize)> {
        let mut offset = if msr <= 0x1fff {
            0
        } else if (0xc000_0000..=0xc000_1fff).contains(&msr) {
            Self::HIGH_OFFSET
        } else {
            return None;
        };
        if is_write {
            offset += Self::WRITE_OFFSET;
        }
        let msr = (msr & 0x1fff) as usize;
        Some((offset + msr / 8, msr % 8))
    }

    fn set_intercept(&mut self, msr: u32, is_write: bool, intercept: bool) {
        if let Some((byte, bit)) = Self::locate(msr, is_write) {
            self.bitmap()[byte].set_bit(bit, intercept);
        }
    }

    pub fn set_read_intercept(&mut self, msr: u32, intercept: bool) {
        self.set_intercept(msr, false, intercept);
    }

    pub fn set_write_intercept(&mut self, msr: u32, intercept: bool) {
        self.set_intercept(msr, true, intercept);
    }

    /// Whether an access to `msr` exits. MSRs outside both ranges always do.
    pub fn is_intercepted(&self, msr: u32, is_write: bool) -> bool {
        match Self::locate(msr, is_write) {
            Some((byte, bit)) => self.bitmap()[byte].get_bit(bit),
            None => true,
        }
    }
}

/// Entry of a VM-entry MSR-load or VM-exit MSR-store area.
/// (SDM Vol. 3C, Section 24.7.2, Table 24-15)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct MsrEntry {
    index: u32,
    _reserved: u32,
    data: u64,
}

/// Guest MSRs the processor swaps automatically: loaded on VM entry and
/// stored back on VM exit, using the same area.
///
/// When requested, an extra `IA32_FLUSH_CMD` entry sits past the stored ones
/// so that every entry flushes the L1D cache without it being stored on exit.
#[derive(Debug)]
pub struct MsrList<H: VmxHal> {
    frame: PhysFrame<H>,
    l1d_flush: bool,
}

impl<H: VmxHal> MsrList<H> {
    /// MSRs switched between host and guest on every entry and exit.
    pub const GUEST_MSRS: [Msr; 5] = [
        Msr::IA32_STAR,
        Msr::IA32_LSTAR,
        Msr::IA32_CSTAR,
        Msr::IA32_FMASK,
        Msr::IA32_KERNEL_GSBASE,
    ];

    const L1D_FLUSH: u64 = 1;

    pub fn new(l1d_flush: bool) -> Result<Self> {
        let frame = PhysFrame::alloc_zero()?;
        let mut list = Self { frame, l1d_flush };
        for (i, msr) in Self::GUEST_MSRS.iter().enumerate() {
            list.entries()[i].index = *msr as u32;
        }
        if l1d_flush {
            let i = Self::GUEST_MSRS.len();
            list.entries()[i].index = Msr::IA32_FLUSH_CMD as u32;
            list.entries()[i].data = Self::L1D_FLUSH;
        }
        Ok(list)
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }

    fn entries(&self) -> &mut [MsrEntry] {
        unsafe {
            core::slice::from_raw_parts_mut(
                self.frame.as_mut_ptr() as *mut MsrEntry,
                Self::GUEST_MSRS.len() + 1,
            )
        }
    }

    /// Number of entries stored on VM exit.
    pub fn exit_count(&self) -> u32 {
        Self::GUEST_MSRS.len() as u32
    }

    /// Number of entries loaded on VM entry.
    pub fn entry_count(&self) -> u32 {
        self.exit_count() + self.l1d_flush as u32
    }

    pub fn get(&self, msr: Msr) -> Option<u64> {
        self.entries()[..Self::GUEST_MSRS.len()]
            .iter()
            .find(|e| e.index == msr as u32)
            .map(|e| e.data)
    }

    /// Returns `false` if `msr` is not switched through this list.
    pub fn set(&mut self, msr: Msr, value: u64) -> bool {
        match self.entries()[..Self::GUEST_MSRS.len()]
            .iter_mut()
            .find(|e| e.index == msr as u32)
        {
            Some(entry) => {
                entry.data = value;
                true
            }
            None => false,
        }
    }
}

/// Virtual-APIC page. With the TPR shadow enabled, the processor serves guest
/// CR8 accesses from its VTPR byte. (SDM Vol. 3C, Section 30.1.1)
#[derive(Debug)]
pub struct VirtApicPage<H: VmxHal> {
    frame: PhysFrame<H>,
}

impl<H: VmxHal> VirtApicPage<H> {
    const VTPR_OFFSET: usize = 0x80;

    pub fn new() -> Result<Self> {
        Ok(Self {
            frame: PhysFrame::alloc_zero()?,
        })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }

    fn vtpr(&self) -> *mut u32 {
        unsafe { self.frame.as_mut_ptr().add(Self::VTPR_OFFSET) as *mut u32 }
    }

    /// CR8 view of the VTPR: its bits 7:4.
    pub fn cr8(&self) -> u64 {
        (unsafe { self.vtpr().read_volatile() } >> 4 & 0xf) as u64
    }

    pub fn set_cr8(&mut self, value: u64) {
        unsafe { self.vtpr().write_volatile((value as u32 & 0xf) << 4) }
    }
}

/// Reporting Register of Basic VMX Capabilities. (SDM Vol. 3D, Appendix A.1)
#[derive(Debug)]
pub struct VmxBasic {
    /// The 31-bit VMCS revision identifier used by the processor.
    pub revision_id: u32,
    /// The number of bytes that software should allocate for the VMXON region
    /// and any VMCS region.
    pub region_size: u16,
    /// The width of the physical addresses that may be used for the VMXON
    /// region, each VMCS, and data structures referenced by pointers in a VMCS.
    pub is_32bit_address: bool,
    /// The memory type that should be used for the VMCS, for data structures
    /// referenced by pointers in the VMCS.
    pub mem_type: u8,
    /// The processor reports information in the VM-exit instruction-information
    /// field on VM exits due to execution of the INS and OUTS instructions.
    pub io_exit_info: bool,
    /// If any VMX controls that default to 1 may be cleared to 0.
    pub vmx_flex_controls: bool,
}

impl VmxBasic {
    pub const VMX_MEMORY_TYPE_WRITE_BACK: u8 = 6;

    pub fn from_bits(msr: u64) -> Self {
        Self {
            revision_id: msr.get_bits(0..31) as u32,
            region_size: msr.get_bits(32..45) as u16,
            is_32bit_address: msr.get_bit(48),
            mem_type: msr.get_bits(50..54) as u8,
            io_exit_info: msr.get_bit(54),
            vmx_flex_controls: msr.get_bit(55),
        }
    }

    /// Read the current IA32_VMX_BASIC flags.
    pub fn read<H: VmxHal>() -> Self {
        Self::from_bits(Msr::IA32_VMX_BASIC.read::<H>())
    }
}

bitflags! {
    /// IA32_FEATURE_CONTROL flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureControlFlags: u64 {
       /// Lock bit: when set, locks this MSR from being written. when clear,
       /// VMXON causes a #GP.
       const LOCKED = 1 << 0;
       /// Enable VMX inside SMX operation.
       const VMXON_ENABLED_INSIDE_SMX = 1 << 1;
       /// Enable VMX outside SMX operation.
       const VMXON_ENABLED_OUTSIDE_SMX = 1 << 2;
   }
}

/// Control Features in Intel 64 Processor. (SDM Vol. 3C, Section 23.7)
pub struct FeatureControl;

impl FeatureControl {
    /// Read the current IA32_FEATURE_CONTROL flags.
    pub fn read<H: VmxHal>() -> FeatureControlFlags {
        FeatureControlFlags::from_bits_truncate(Msr::IA32_FEATURE_CONTROL.read::<H>())
    }

    /// Write IA32_FEATURE_CONTROL flags, preserving reserved values.
    pub fn write<H: VmxHal>(flags: FeatureControlFlags) {
        let old_value = Msr::IA32_FEATURE_CONTROL.read::<H>();
        let reserved = old_value & !(FeatureControlFlags::all().bits());
        let new_value = reserved | flags.bits();
        unsafe { Msr::IA32_FEATURE_CONTROL.write::<H>(new_value) };
    }
}

bitflags! {
    /// Reporting Register of EPT and VPID Capabilities. (SDM Vol. 3D, Appendix A.10)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptVpidCap: u64 {
        const EXECUTE_ONLY = 1 << 0;
        const PAGE_WALK_4 = 1 << 6;
        const MEMORY_TYPE_UC = 1 << 8;
        const MEMORY_TYPE_WB = 1 << 14;
        const PDE_2M = 1 << 16;
        const PDPTE_1G = 1 << 17;
        const INVEPT = 1 << 20;
        const ACCESSED_DIRTY = 1 << 21;
        const INVEPT_SINGLE_CONTEXT = 1 << 25;
        const INVEPT_ALL_CONTEXT = 1 << 26;
        const INVVPID = 1 << 32;
        const INVVPID_INDIVIDUAL_ADDRESS = 1 << 40;
        const INVVPID_SINGLE_CONTEXT = 1 << 41;
        const INVVPID_ALL_CONTEXT = 1 << 42;
        const INVVPID_SINGLE_CONTEXT_RETAIN_GLOBALS = 1 << 43;
    }
}

impl EptVpidCap {
    pub fn read<H: VmxHal>() -> Self {
        Self::from_bits_truncate(Msr::IA32_VMX_EPT_VPID_CAP.read::<H>())
    }
}
