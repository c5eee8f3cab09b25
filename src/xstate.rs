use alloc::boxed::Box;

use x86::controlregs::Xcr0;

use crate::VmxHal;

/// Size of the XSAVE buffer kept per context. Covers the legacy region, the
/// header and every component in the allowed XCR0 mask (x87, SSE, AVX).
const XSAVE_AREA_SIZE: usize = 4096;
const XSAVE_LEGACY_SIZE: usize = 512;
const XSAVE_HEADER_SIZE: usize = 64;

/// Default x87 control word after FNINIT.
const FCW_DEFAULT: u16 = 0x037f;
/// Default MXCSR after reset: all exceptions masked.
const MXCSR_DEFAULT: u32 = 0x1f80;

/// The legacy FXSAVE region (x87 and SSE state), as exchanged with callers.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpuState {
    pub fcw: u16,
    pub fsw: u16,
    /// Abridged tag word.
    pub ftw: u8,
    _reserved0: u8,
    pub fop: u16,
    pub fip: u64,
    pub fdp: u64,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    /// ST0-ST7 / MM0-MM7, 10 significant bytes each.
    pub st: [[u8; 16]; 8],
    pub xmm: [[u8; 16]; 16],
    _reserved1: [[u8; 16]; 6],
}

const _: () = assert!(core::mem::size_of::<FpuState>() == XSAVE_LEGACY_SIZE);

impl FpuState {
    pub const fn zeroed() -> Self {
        Self {
            fcw: 0,
            fsw: 0,
            ftw: 0,
            _reserved0: 0,
            fop: 0,
            fip: 0,
            fdp: 0,
            mxcsr: 0,
            mxcsr_mask: 0,
            st: [[0; 16]; 8],
            xmm: [[0; 16]; 16],
            _reserved1: [[0; 16]; 6],
        }
    }

    /// State after processor reset.
    pub const fn reset() -> Self {
        let mut fpu = Self::zeroed();
        fpu.fcw = FCW_DEFAULT;
        fpu.mxcsr = MXCSR_DEFAULT;
        fpu
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::reset()
    }
}

/// An XSAVE buffer.
#[repr(C, align(64))]
pub struct XSaveArea {
    legacy: FpuState,
    xstate_bv: u64,
    xcomp_bv: u64,
    _reserved: [u64; 6],
    _extended: [u8; XSAVE_AREA_SIZE - XSAVE_LEGACY_SIZE - XSAVE_HEADER_SIZE],
}

impl XSaveArea {
    fn new_boxed() -> Box<Self> {
        Box::new(Self {
            legacy: FpuState::reset(),
            xstate_bv: 0,
            xcomp_bv: 0,
            _reserved: [0; 6],
            _extended: [0; XSAVE_AREA_SIZE - XSAVE_LEGACY_SIZE - XSAVE_HEADER_SIZE],
        })
    }

    pub fn legacy(&self) -> &FpuState {
        &self.legacy
    }

    pub fn legacy_mut(&mut self) -> &mut FpuState {
        &mut self.legacy
    }

    pub fn xstate_bv(&self) -> u64 {
        self.xstate_bv
    }
}

/// Host and guest extended processor state of one vCPU.
///
/// The guest's XCR0 and FPU registers are only live on the processor between
/// [`XState::switch_to_guest`] and [`XState::switch_to_host`].
pub struct XState {
    host_xcr0: u64,
    guest_xcr0: u64,
    /// Components this engine lets the guest enable.
    mask: u64,
    host_area: Box<XSaveArea>,
    guest_area: Box<XSaveArea>,
}

impl XState {
    pub fn new(mask: u64) -> Self {
        Self {
            host_xcr0: 0,
            guest_xcr0: Xcr0::XCR0_FPU_MMX_STATE.bits(),
            mask,
            host_area: XSaveArea::new_boxed(),
            guest_area: XSaveArea::new_boxed(),
        }
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn guest_xcr0(&self) -> u64 {
        self.guest_xcr0
    }

    /// Sets the guest XCR0, keeping it within the allowed mask and with x87 enabled.
    pub fn set_guest_xcr0(&mut self, xcr0: u64) {
        self.guest_xcr0 = (xcr0 & self.mask) | Xcr0::XCR0_FPU_MMX_STATE.bits();
    }

    /// Save the host FPU state and XCR0, load the guest ones.
    pub fn switch_to_guest<H: VmxHal>(&mut self) {
        self.host_xcr0 = H::xcr0();
        H::fpu_save(&mut self.host_area, self.host_xcr0);
        H::fpu_restore(&self.guest_area, self.mask);
        if self.guest_xcr0 != self.host_xcr0 {
            H::set_xcr0(self.guest_xcr0);
        }
    }

    /// Save the guest FPU state and XCR0, load the host ones.
    pub fn switch_to_host<H: VmxHal>(&mut self) {
        if self.guest_xcr0 != self.host_xcr0 {
            H::set_xcr0(self.host_xcr0);
        }
        H::fpu_save(&mut self.guest_area, self.mask);
        H::fpu_restore(&self.host_area, self.host_xcr0);
    }

    pub fn guest_fpu(&self) -> FpuState {
        *self.guest_area.legacy()
    }

    /// Replaces the guest's legacy FPU region.
    ///
    /// MXCSR is clipped to what the host supports, and every allowed component
    /// is marked present so the next XRSTOR consumes the new image instead of
    /// a stale or initial one.
    pub fn set_guest_fpu(&mut self, fpu: &FpuState, host_mxcsr_mask: u32) {
        let area = &mut self.guest_area;
        area.legacy = *fpu;
        area.legacy.mxcsr_mask &= host_mxcsr_mask;
        area.legacy.mxcsr &= host_mxcsr_mask;
        area.xstate_bv = self.mask;
        area.xcomp_bv = 0;
    }

    #[cfg(test)]
    pub fn guest_area(&self) -> &XSaveArea {
        &self.guest_area
    }
}
