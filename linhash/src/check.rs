//! Structural consistency checks, compiled only into test builds.

use crate::channel::Channel;
use crate::DiskMap;

impl<C: Channel> DiskMap<C> {
    #[cfg(not(test))]
    #[inline(always)]
    pub(crate) fn assert_invariants(&self) {}

    /// Re-verifies the map's structural invariants: file size against the
    /// page accounting, per-chain key uniqueness, chain pointers landing on
    /// overflow pages inside the file, and exact agreement between the FSM
    /// bits and the overflow pages actually linked.
    #[cfg(test)]
    #[inline(never)]
    pub(crate) fn assert_invariants(&self) {
        use std::collections::HashSet;

        use crate::{page_offset, MAX_HASH_BITS};

        let meta = &self.meta;
        assert!((1..=MAX_HASH_BITS).contains(&meta.hash_bits));
        assert!(u64::from(meta.split_index) < 1u64 << (meta.hash_bits - 1));

        // The file is exactly as long as the derived page count says.
        assert_eq!(
            self.data.len().unwrap(),
            page_offset(meta.data_pages()),
            "data file length disagrees with the metadata"
        );

        let mut linked_slots: HashSet<u32> = HashSet::new();
        for bucket in 0..meta.buckets_num() {
            let mut page_num = meta.bucket_page_num(bucket);
            let mut keys: HashSet<Vec<u8>> = HashSet::new();
            let mut head = true;
            loop {
                // decode() itself checks the free-space accounting of the page.
                let page = self.read_page(page_num).unwrap();
                for item in page.items() {
                    assert!(
                        keys.insert(item.key.clone()),
                        "key appears twice in the chain of bucket {bucket}"
                    );
                    assert_eq!(
                        meta.bucket_index(item.hash),
                        bucket,
                        "item stored in the wrong bucket"
                    );
                }
                if !head {
                    let slot = meta.slot_for_overflow_page(page_num).unwrap();
                    assert!(
                        !self.fsm.is_free(slot),
                        "linked overflow page {page_num} has a free FSM slot"
                    );
                    assert!(
                        linked_slots.insert(slot),
                        "overflow page {page_num} is linked twice"
                    );
                }
                match page.next_page {
                    Some(next) => {
                        assert!(
                            u64::from(next) < meta.data_pages(),
                            "chain pointer {next} is beyond the data file"
                        );
                        page_num = u64::from(next);
                        head = false;
                    }
                    None => break,
                }
            }
        }

        // Every taken FSM slot is referenced by exactly one chain.
        for slot in 0..self.fsm.slot_count() as u32 {
            if !self.fsm.is_free(slot) {
                assert!(
                    linked_slots.contains(&slot),
                    "FSM slot {slot} is taken but no chain links its page"
                );
            }
        }
    }
}
