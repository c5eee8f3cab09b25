//! CPUID as seen by the guest.

use alloc::vec::Vec;

use bit_field::BitField;
use raw_cpuid::CpuIdResult;

use crate::{Result, VmxError, VmxHal};

/// Largest standard leaf reported to the guest.
pub(crate) const MAX_BASIC_LEAF: u32 = 0x16;

const HYPERVISOR_LEAF_BASE: u32 = 0x4000_0000;
const HYPERVISOR_LEAF_LIMIT: u32 = 0x4000_00ff;
const HYPERVISOR_SIGNATURE: &[u8; 12] = b"RVMRVMRVMRVM";

/// How one CPUID leaf deviates from what the engine computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuidOverride {
    /// Clear the bits of `del`, then set the bits of `set`.
    Mask { del: CpuIdResult, set: CpuIdResult },
    /// Leave the instruction to the caller.
    Exit,
}

#[derive(Debug, Clone)]
struct CpuidEntry {
    leaf: u32,
    /// `None` matches every subleaf.
    subleaf: Option<u32>,
    action: CpuidOverride,
}

/// Per-guest CPUID overrides, looked up by `(leaf, subleaf)`.
#[derive(Debug, Clone, Default)]
pub struct CpuidTable {
    entries: Vec<CpuidEntry>,
}

impl CpuidTable {
    pub const MAX_ENTRIES: usize = 32;

    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Installs an override, replacing any for the same leaf and subleaf.
    pub fn set(&mut self, leaf: u32, subleaf: Option<u32>, action: CpuidOverride) -> Result {
        if let CpuidOverride::Mask { del, set } = &action {
            let overlap = (del.eax & set.eax)
                | (del.ebx & set.ebx)
                | (del.ecx & set.ecx)
                | (del.edx & set.edx);
            if overlap != 0 {
                return Err(VmxError::InvalidInput(alloc::format!(
                    "CPUID {leaf:#x}: delete and set masks overlap"
                )));
            }
        }
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.leaf == leaf && e.subleaf == subleaf)
        {
            entry.action = action;
            return Ok(());
        }
        if self.entries.len() == Self::MAX_ENTRIES {
            return Err(VmxError::NoSpace);
        }
        self.entries.push(CpuidEntry {
            leaf,
            subleaf,
            action,
        });
        Ok(())
    }

    /// Returns whether an override was removed.
    pub fn remove(&mut self, leaf: u32, subleaf: Option<u32>) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.leaf == leaf && e.subleaf == subleaf));
        self.entries.len() != before
    }

    /// Finds the override for `(leaf, subleaf)`, preferring an exact subleaf
    /// match over a wildcard one.
    pub fn lookup(&self, leaf: u32, subleaf: u32) -> Option<&CpuidOverride> {
        self.entries
            .iter()
            .find(|e| e.leaf == leaf && e.subleaf == Some(subleaf))
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|e| e.leaf == leaf && e.subleaf.is_none())
            })
            .map(|e| &e.action)
    }
}

/// Guest state CPUID results depend on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CpuidContext {
    pub vcpu_id: u32,
    pub guest_cr4: u64,
    pub guest_xcr0: u64,
    pub xcr0_mask: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CpuidOutcome {
    Complete(CpuIdResult),
    /// Forced to the caller by an [`CpuidOverride::Exit`] entry.
    Exit,
}

fn is_hypervisor_leaf(leaf: u32) -> bool {
    (HYPERVISOR_LEAF_BASE..=HYPERVISOR_LEAF_LIMIT).contains(&leaf)
}

/// Computes the guest's view of `(leaf, subleaf)`: host values, filtered to
/// what the engine virtualizes, then the per-guest overrides.
pub(crate) fn emulate<H: VmxHal>(
    leaf: u32,
    subleaf: u32,
    ctx: &CpuidContext,
    table: &CpuidTable,
) -> CpuidOutcome {
    let over = table.lookup(leaf, subleaf);
    if matches!(over, Some(CpuidOverride::Exit)) && leaf != 0 && !is_hypervisor_leaf(leaf) {
        return CpuidOutcome::Exit;
    }

    let mut res = filtered::<H>(leaf, subleaf, ctx);
    if let Some(CpuidOverride::Mask { del, set }) = over {
        if !is_hypervisor_leaf(leaf) {
            res.eax = (res.eax & !del.eax) | set.eax;
            res.ebx = (res.ebx & !del.ebx) | set.ebx;
            res.ecx = (res.ecx & !del.ecx) | set.ecx;
            res.edx = (res.edx & !del.edx) | set.edx;
        }
    }
    CpuidOutcome::Complete(res)
}

const ZERO: CpuIdResult = CpuIdResult {
    eax: 0,
    ebx: 0,
    ecx: 0,
    edx: 0,
};

fn filtered<H: VmxHal>(leaf: u32, subleaf: u32, ctx: &CpuidContext) -> CpuIdResult {
    if is_hypervisor_leaf(leaf) {
        return hypervisor_leaf(leaf);
    }
    if leaf > MAX_BASIC_LEAF && leaf < HYPERVISOR_LEAF_BASE {
        return ZERO;
    }

    let mut res = H::cpuid(leaf, subleaf);
    match leaf {
        0 => res.eax = res.eax.min(MAX_BASIC_LEAF),
        1 => {
            // Initial APIC ID.
            res.ebx.set_bits(24..32, ctx.vcpu_id & 0xff);
            // VMX, SMX, EIST, TM2, PDCM, PCID, TSC-deadline.
            for bit in [5, 6, 7, 8, 15, 17, 24] {
                res.ecx.set_bit(bit, false);
            }
            res.ecx.set_bit(27, ctx.guest_cr4.get_bit(18));
            // Hypervisor present.
            res.ecx.set_bit(31, true);
            // DS, ACPI, TM.
            for bit in [21, 22, 29] {
                res.edx.set_bit(bit, false);
            }
        }
        5 | 6 => res = ZERO,
        7 if subleaf == 0 => {
            res.ebx.set_bit(10, false); // INVPCID
            res.ecx.set_bit(5, false); // WAITPKG
            res.ecx.set_bit(16, false); // LA57
            // IBRS/IBPB, STIBP, L1D_FLUSH, SSBD.
            for bit in [26, 27, 28, 31] {
                res.edx.set_bit(bit, false);
            }
        }
        0xd if subleaf == 0 => {
            res.eax = ctx.xcr0_mask as u32;
            res.edx = (ctx.xcr0_mask >> 32) as u32;
            res.ebx = xsave_size::<H>(ctx.guest_xcr0);
            res.ecx = xsave_size::<H>(ctx.xcr0_mask);
        }
        // XSAVES
        0xd if subleaf == 1 => {
            res.eax.set_bit(3, false);
        }
        0xd if subleaf >= 2 && !ctx.xcr0_mask.get_bit(subleaf as usize % 64) => res = ZERO,
        // RDTSCP
        0x8000_0001 => {
            res.edx.set_bit(27, false);
        }
        _ => {}
    }
    res
}

/// Size of an XSAVE area holding the components of `xcr0`.
fn xsave_size<H: VmxHal>(xcr0: u64) -> u32 {
    // Legacy region and XSAVE header.
    let mut size = 512 + 64;
    for component in 2..63 {
        if xcr0.get_bit(component) {
            let info = H::cpuid(0xd, component as u32);
            size = size.max(info.ebx + info.eax);
        }
    }
    size
}

fn hypervisor_leaf(leaf: u32) -> CpuIdResult {
    if leaf != HYPERVISOR_LEAF_BASE {
        return ZERO;
    }
    let word = |i: usize| {
        u32::from_le_bytes([
            HYPERVISOR_SIGNATURE[i],
            HYPERVISOR_SIGNATURE[i + 1],
            HYPERVISOR_SIGNATURE[i + 2],
            HYPERVISOR_SIGNATURE[i + 3],
        ])
    };
    CpuIdResult {
        eax: HYPERVISOR_LEAF_BASE + 1,
        ebx: word(0),
        ecx: word(4),
        edx: word(8),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock::{MockHal, MockPlatform};

    fn ctx() -> CpuidContext {
        CpuidContext {
            vcpu_id: 3,
            guest_cr4: 0,
            guest_xcr0: 1,
            xcr0_mask: 7,
        }
    }

    fn complete(outcome: CpuidOutcome) -> CpuIdResult {
        match outcome {
            CpuidOutcome::Complete(res) => res,
            CpuidOutcome::Exit => panic!("unexpected CPUID exit"),
        }
    }

    fn mask(del_ecx: u32, set_ecx: u32) -> CpuidOverride {
        CpuidOverride::Mask {
            del: CpuIdResult { ecx: del_ecx, ..ZERO },
            set: CpuIdResult { ecx: set_ecx, ..ZERO },
        }
    }

    #[test]
    fn table_rules() {
        let mut table = CpuidTable::new();
        assert!(matches!(
            table.set(1, None, mask(0b11, 0b10)),
            Err(VmxError::InvalidInput(_))
        ));
        table.set(1, None, mask(0b01, 0b10)).unwrap();
        table.set(1, None, mask(0b100, 0)).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(1, 7), Some(&mask(0b100, 0)));

        table.set(1, Some(7), CpuidOverride::Exit).unwrap();
        assert_eq!(table.lookup(1, 7), Some(&CpuidOverride::Exit));
        assert_eq!(table.lookup(1, 0), Some(&mask(0b100, 0)));
        assert!(table.remove(1, Some(7)));
        assert!(!table.remove(1, Some(7)));

        for leaf in 2..=CpuidTable::MAX_ENTRIES as u32 {
            table.set(leaf, None, CpuidOverride::Exit).unwrap();
        }
        assert_eq!(table.set(0x100, None, CpuidOverride::Exit), Err(VmxError::NoSpace));
        // Replacing still works on a full table.
        table.set(2, None, mask(0, 1)).unwrap();
    }

    #[test]
    fn standard_leaves_are_filtered() {
        let platform = MockPlatform::install(1);
        platform.set_cpuid(
            1,
            CpuIdResult {
                eax: 0x906ea,
                ebx: 0,
                ecx: u32::MAX,
                edx: u32::MAX,
            },
        );
        let table = CpuidTable::new();

        let leaf0 = complete(emulate::<MockHal>(0, 0, &ctx(), &table));
        assert_eq!(leaf0.eax, MAX_BASIC_LEAF);

        let leaf1 = complete(emulate::<MockHal>(1, 0, &ctx(), &table));
        assert_eq!(leaf1.eax, 0x906ea);
        assert_eq!(leaf1.ebx >> 24, 3);
        assert!(!leaf1.ecx.get_bit(5));
        assert!(!leaf1.ecx.get_bit(27));
        assert!(leaf1.ecx.get_bit(31));
        assert!(!leaf1.edx.get_bit(22));

        let osxsave = CpuidContext {
            guest_cr4: 1 << 18,
            ..ctx()
        };
        assert!(complete(emulate::<MockHal>(1, 0, &osxsave, &table)).ecx.get_bit(27));
        assert_eq!(complete(emulate::<MockHal>(0x17, 0, &ctx(), &table)), ZERO);
    }

    #[test]
    fn hypervisor_signature() {
        let _platform = MockPlatform::install(1);
        let mut table = CpuidTable::new();
        table.set(HYPERVISOR_LEAF_BASE, None, CpuidOverride::Exit).unwrap();
        let res = complete(emulate::<MockHal>(HYPERVISOR_LEAF_BASE, 0, &ctx(), &table));
        assert_eq!(res.eax, HYPERVISOR_LEAF_BASE + 1);
        assert_eq!(&res.ebx.to_le_bytes(), b"RVMR");
        assert_eq!(&res.ecx.to_le_bytes(), b"VMRV");
        assert_eq!(&res.edx.to_le_bytes(), b"MRVM");
        assert_eq!(
            complete(emulate::<MockHal>(HYPERVISOR_LEAF_BASE + 1, 0, &ctx(), &table)),
            ZERO
        );
    }

    #[test]
    fn overrides_apply_last() {
        let platform = MockPlatform::install(1);
        platform.set_cpuid(1, CpuIdResult { ecx: 0b1, ..ZERO });
        let mut table = CpuidTable::new();
        table.set(1, None, mask(0b1, 0b10 | (1 << 5))).unwrap();
        table.set(0, None, CpuidOverride::Exit).unwrap();
        table.set(6, None, CpuidOverride::Exit).unwrap();

        let leaf1 = complete(emulate::<MockHal>(1, 0, &ctx(), &table));
        assert_eq!(leaf1.ecx & 0b111, 0b10);
        assert!(leaf1.ecx.get_bit(5));
        // Leaf 0 is always serviced.
        assert!(matches!(
            emulate::<MockHal>(0, 0, &ctx(), &table),
            CpuidOutcome::Complete(_)
        ));
        assert_eq!(emulate::<MockHal>(6, 0, &ctx(), &table), CpuidOutcome::Exit);

        // Same input, same output.
        assert_eq!(
            emulate::<MockHal>(1, 0, &ctx(), &table),
            emulate::<MockHal>(1, 0, &ctx(), &table)
        );
    }
}
