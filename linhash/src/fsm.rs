//! The free-space map: a bit-packed allocator for overflow slots.

use bitvec::prelude::{BitVec, Lsb0};
use pow2::Pow2;
use tracing::trace;

use crate::channel::Channel;
use crate::error::{Error, Result};

/// The size of one FSM page: 32 bytes, covering 256 slots.
const FSM_PAGE_SIZE: Pow2 = Pow2::from_exponent(5);
const FSM_PAGE_LEN: usize = 32;
const SLOTS_PER_PAGE: u32 = (FSM_PAGE_LEN * 8) as u32;

/// Tracks which overflow slots are taken.
///
/// One bit per slot, 1 meaning taken. Bit `k` of byte `j` of FSM page `p`
/// covers slot `p * 256 + j * 8 + k`, so bits run little-endian within each
/// byte. Pages materialize lazily: a slot beyond the end of the file reads
/// as free. Allocation is first-fit; freeing is constant-time.
///
/// The whole file is mirrored in memory. Every mutation writes the affected
/// 32-byte page back through the channel before returning.
pub struct FreeSpaceMap<C> {
    chan: C,
    bits: BitVec<u8, Lsb0>,
}

impl<C> FreeSpaceMap<C> {
    pub(crate) fn into_channel(self) -> C {
        self.chan
    }

    /// Number of slots covered by the allocated FSM pages.
    pub fn slot_count(&self) -> usize {
        self.bits.len()
    }

    /// Number of slots currently marked taken.
    pub fn taken(&self) -> usize {
        self.bits.count_ones()
    }

    /// True if `slot`'s bit is 0 or lies beyond the allocated FSM pages.
    pub fn is_free(&self, slot: u32) -> bool {
        self.bits.get(slot as usize).map(|bit| !*bit).unwrap_or(true)
    }

    /// The lowest free slot. This may be one past the end of the allocated
    /// FSM pages, which implicitly reads as free.
    pub fn find_free_page(&self) -> u32 {
        for (index, &byte) in self.bits.as_raw_slice().iter().enumerate() {
            if byte != 0xFF {
                return (index * 8) as u32 + (!byte).trailing_zeros();
            }
        }
        self.bits.len() as u32
    }
}

impl<C: Channel> FreeSpaceMap<C> {
    /// Loads the map from its channel. The file length must be a whole
    /// number of FSM pages.
    pub(crate) fn load(chan: C) -> Result<Self> {
        let len = chan.len()?;
        if len % FSM_PAGE_LEN as u64 != 0 {
            return Err(Error::Corruption(format!(
                "FSM file length {len} is not a multiple of {FSM_PAGE_LEN}"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        chan.read_exact_at(&mut buf, 0)?;
        Ok(Self {
            chan,
            bits: BitVec::from_vec(buf),
        })
    }

    /// Marks `slot` taken, materializing FSM pages up to it as needed.
    /// Taking a slot that is already taken is a corruption error.
    pub fn take(&mut self, slot: u32) -> Result<()> {
        let index = slot as usize;
        if index >= self.bits.len() {
            // Grow the mirror out to the page containing `slot`. The
            // intermediate pages stay all-zero; on disk they materialize
            // through the zero-extending page write below.
            let pages = (slot / SLOTS_PER_PAGE + 1) as usize;
            self.bits.resize(pages * FSM_PAGE_LEN * 8, false);
        } else if self.bits[index] {
            return Err(Error::Corruption(format!(
                "overflow slot {slot} is already taken"
            )));
        }
        self.bits.set(index, true);
        trace!(slot, "take overflow slot");
        self.write_page_of(slot)
    }

    /// Clears `slot`'s bit. The slot must exist and be taken.
    pub fn free(&mut self, slot: u32) -> Result<()> {
        let index = slot as usize;
        if index >= self.bits.len() {
            return Err(Error::Corruption(format!(
                "overflow slot {slot} is beyond the allocated FSM pages"
            )));
        }
        if !self.bits[index] {
            return Err(Error::Corruption(format!(
                "overflow slot {slot} is already free"
            )));
        }
        self.bits.set(index, false);
        trace!(slot, "free overflow slot");
        self.write_page_of(slot)
    }

    /// [`Self::find_free_page`] followed by [`Self::take`].
    pub fn take_free_page(&mut self) -> Result<u32> {
        let slot = self.find_free_page();
        self.take(slot)?;
        Ok(slot)
    }

    fn write_page_of(&self, slot: u32) -> Result<()> {
        let page = (slot / SLOTS_PER_PAGE) as u64;
        let start = page as usize * FSM_PAGE_LEN;
        let raw = &self.bits.as_raw_slice()[start..start + FSM_PAGE_LEN];
        self.chan
            .write_all_at(raw, page << FSM_PAGE_SIZE.exponent())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemChannel;

    fn fsm() -> FreeSpaceMap<MemChannel> {
        FreeSpaceMap::load(MemChannel::new()).unwrap()
    }

    #[test]
    fn allocation_is_first_fit() {
        let mut fsm = fsm();
        for expected in 0..16 {
            assert_eq!(fsm.take_free_page().unwrap(), expected);
        }
        fsm.free(3).unwrap();
        fsm.free(11).unwrap();
        assert_eq!(fsm.take_free_page().unwrap(), 3);
        assert_eq!(fsm.take_free_page().unwrap(), 11);
        assert_eq!(fsm.take_free_page().unwrap(), 16);
    }

    #[test]
    fn state_transition_errors() {
        let mut fsm = fsm();
        fsm.take(0).unwrap();
        assert!(matches!(fsm.take(0), Err(Error::Corruption(_))));
        fsm.free(0).unwrap();
        assert!(matches!(fsm.free(0), Err(Error::Corruption(_))));
        assert!(matches!(fsm.free(12345), Err(Error::Corruption(_))));
    }

    #[test]
    fn pages_materialize_lazily() {
        let mut fsm = fsm();
        assert!(fsm.is_free(5000));
        fsm.take(5000).unwrap();
        assert!(!fsm.is_free(5000));
        assert!(fsm.is_free(4999));

        // Slot 5000 lives on FSM page 19; the file covers pages 0..=19.
        let chan = fsm.into_channel();
        assert_eq!(chan.len().unwrap(), 20 * FSM_PAGE_LEN as u64);
    }

    #[test]
    fn survives_reload() {
        let mut fsm = fsm();
        for _ in 0..300 {
            fsm.take_free_page().unwrap();
        }
        fsm.free(17).unwrap();
        fsm.free(299).unwrap();

        let reloaded = FreeSpaceMap::load(fsm.into_channel()).unwrap();
        assert_eq!(reloaded.taken(), 298);
        assert_eq!(reloaded.find_free_page(), 17);
        assert!(reloaded.is_free(299));
        assert!(!reloaded.is_free(298));
    }

    #[test]
    fn load_rejects_ragged_files() {
        let chan = MemChannel::new();
        chan.write_all_at(&[0u8; 33], 0).unwrap();
        assert!(matches!(
            FreeSpaceMap::load(chan),
            Err(Error::Corruption(_))
        ));
    }
}
