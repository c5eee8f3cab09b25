use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::{Result, VmxError};

/// An address-space identifier (VPID) owned by one vCPU.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Asid(u16);

impl Asid {
    pub fn value(&self) -> u16 {
        self.0
    }
}

/// Process-wide allocator of VPIDs.
///
/// VPID 0 tags the host's own translations and is never handed out, so a
/// space of `max` has exactly `max` identifiers to give.
#[derive(Debug)]
pub struct AsidSpace {
    max: u16,
    bitmap: Mutex<Vec<u64>>,
}

impl AsidSpace {
    pub fn new(max: u16) -> Self {
        let mut bitmap = vec![0u64; (max as usize + 1).div_ceil(64)];
        bitmap[0] |= 1;
        Self {
            max,
            bitmap: Mutex::new(bitmap),
        }
    }

    pub fn max(&self) -> u16 {
        self.max
    }

    pub fn alloc(&self) -> Result<Asid> {
        let mut bitmap = self.bitmap.lock();
        for (i, word) in bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let asid = i * 64 + bit;
            if asid > self.max as usize {
                break;
            }
            *word |= 1 << bit;
            return Ok(Asid(asid as u16));
        }
        Err(VmxError::AsidExhausted)
    }

    pub fn free(&self, asid: Asid) {
        let index = asid.0 as usize;
        let mut bitmap = self.bitmap.lock();
        debug_assert!(bitmap[index / 64] & (1 << (index % 64)) != 0);
        bitmap[index / 64] &= !(1 << (index % 64));
    }

    /// Number of identifiers currently handed out.
    pub fn in_use(&self) -> usize {
        let bitmap = self.bitmap.lock();
        bitmap.iter().map(|w| w.count_ones() as usize).sum::<usize>() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_reserved() {
        let space = AsidSpace::new(4);
        let ids: Vec<_> = (0..4).map(|_| space.alloc().unwrap()).collect();
        assert_eq!(
            ids.iter().map(Asid::value).collect::<Vec<_>>(),
            [1, 2, 3, 4]
        );
        assert_eq!(space.alloc(), Err(VmxError::AsidExhausted));
    }

    #[test]
    fn freed_ids_are_reused() {
        let space = AsidSpace::new(130);
        let ids: Vec<_> = (0..130).map(|_| space.alloc().unwrap()).collect();
        assert_eq!(space.in_use(), 130);
        assert_eq!(space.alloc(), Err(VmxError::AsidExhausted));

        let mut ids = ids.into_iter();
        let seventy = ids.nth(69).unwrap();
        assert_eq!(seventy.value(), 70);
        space.free(seventy);
        assert_eq!(space.alloc().unwrap().value(), 70);
        assert_eq!(space.alloc(), Err(VmxError::AsidExhausted));
    }
}
