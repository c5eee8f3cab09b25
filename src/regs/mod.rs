mod diff;

pub use diff::GeneralRegistersDiff;

/// General-purpose registers of a guest, in the order the entry trampoline
/// loads and stores them.
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    _unused_rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

// The entry trampoline hard-codes these offsets.
const _: () = {
    assert!(core::mem::offset_of!(GeneralRegisters, rax) == 0);
    assert!(core::mem::offset_of!(GeneralRegisters, rbx) == 24);
    assert!(core::mem::offset_of!(GeneralRegisters, rdi) == 56);
    assert!(core::mem::offset_of!(GeneralRegisters, r15) == 120);
    assert!(core::mem::size_of::<GeneralRegisters>() == 128);
};

macro_rules! define_sub_registers {
    ($($reg:ident => $r32:ident, $r16:ident, $r8l:ident $(, $r8h:ident)?);* $(;)?) => {
        paste::paste! {
            impl GeneralRegisters {
                $(
                    #[doc = concat!("Low 32 bits of `", stringify!($reg), "`.")]
                    pub const fn $r32(&self) -> u32 {
                        self.$reg as u32
                    }

                    #[doc = concat!("Writes the low 32 bits of `", stringify!($reg), "`, zeroing the upper half.")]
                    pub fn [<set_ $r32>](&mut self, value: u32) {
                        self.$reg = value as u64;
                    }

                    pub const fn $r16(&self) -> u16 {
                        self.$reg as u16
                    }

                    pub fn [<set_ $r16>](&mut self, value: u16) {
                        self.$reg = (self.$reg & !0xffff) | value as u64;
                    }

                    pub const fn $r8l(&self) -> u8 {
                        self.$reg as u8
                    }

                    pub fn [<set_ $r8l>](&mut self, value: u8) {
                        self.$reg = (self.$reg & !0xff) | value as u64;
                    }

                    $(
                        pub const fn $r8h(&self) -> u8 {
                            (self.$reg >> 8) as u8
                        }

                        pub fn [<set_ $r8h>](&mut self, value: u8) {
                            self.$reg = (self.$reg & !0xff00) | (value as u64) << 8;
                        }
                    )?
                )*
            }
        }
    };
}

define_sub_registers! {
    rax => eax, ax, al, ah;
    rcx => ecx, cx, cl, ch;
    rdx => edx, dx, dl, dh;
    rbx => ebx, bx, bl, bh;
    rbp => ebp, bp, bpl;
    rsi => esi, si, sil;
    rdi => edi, di, dil;
    r8 => r8d, r8w, r8b;
    r9 => r9d, r9w, r9b;
    r10 => r10d, r10w, r10b;
    r11 => r11d, r11w, r11b;
    r12 => r12d, r12w, r12b;
    r13 => r13d, r13w, r13b;
    r14 => r14d, r14w, r14b;
    r15 => r15d, r15w, r15b;
}

impl GeneralRegisters {
    /// Names of the registers, indexed by their encoding in instruction operands.
    pub const REGISTER_NAMES: [&'static str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];

    /// Returns the name of the register with encoding `index`.
    pub fn register_name(index: u8) -> &'static str {
        Self::REGISTER_NAMES[index as usize]
    }

    /// Returns the register with encoding `index`.
    ///
    /// Panics for index 4 (RSP lives in the VMCS) and for indices above 15.
    pub fn get_reg_of_index(&self, index: u8) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => panic!("Illegal index of GeneralRegisters: {index}"),
        }
    }

    /// Sets the register with encoding `index`. Same restrictions as
    /// [`GeneralRegisters::get_reg_of_index`].
    pub fn set_reg_of_index(&mut self, index: u8, value: u64) {
        match index {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            15 => self.r15 = value,
            _ => panic!("Illegal index of GeneralRegisters: {index}"),
        }
    }

    /// `EDX:EAX`, as consumed by WRMSR and XSETBV.
    pub fn get_edx_eax(&self) -> u64 {
        (self.edx() as u64) << 32 | self.eax() as u64
    }

    /// Splits `value` into `EDX:EAX`, as produced by RDMSR.
    pub fn set_edx_eax(&mut self, value: u64) {
        self.set_eax(value as u32);
        self.set_edx((value >> 32) as u32);
    }
}
