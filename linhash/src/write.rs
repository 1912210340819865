//! Writing to the map: insert, overwrite, remove, and bucket splitting.

use tracing::{trace, trace_span};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::pages::{Item, Page, MAX_ITEM_LEN};
use crate::read::check_key;
use crate::{byte_array_hash, page_offset, DiskMap, MAX_HASH_BITS};

impl<C: Channel> DiskMap<C> {
    /// Inserts `value` under `key`, replacing any existing value.
    ///
    /// The bucket chain is walked once, carrying the last page examined and
    /// the first page seen with room for the new item. If an existing item
    /// had to be dropped because the new value no longer fits beside its
    /// neighbors, the rest of the walk only looks for room. If no page in
    /// the chain has room, a fresh overflow page is linked at the tail.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let _span = trace_span!("DiskMap::put").entered();

        check_key(key)?;
        let item = Item::new(byte_array_hash(key), key, value);
        let item_size = item.size();
        if item_size > MAX_ITEM_LEN {
            return Err(Error::InvalidArgument(format!(
                "key and value encode to {item_size} bytes, the maximum is {MAX_ITEM_LEN}"
            )));
        }

        let bucket = self.meta.bucket_index(item.hash);
        let mut page_num = self.meta.bucket_page_num(bucket);
        let mut free_page: Option<(u64, Page)> = None;
        let mut displaced = false;

        let (tail_num, mut tail) = loop {
            let mut page = self.read_page(page_num)?;

            if !displaced {
                if let Some(index) = page.find(item.hash, key) {
                    let old_size = page.items()[index].size();
                    if page.free_space() + old_size >= item_size {
                        page.replace(index, item);
                        self.write_page(page_num, &page)?;
                        self.assert_invariants();
                        return Ok(());
                    }
                    // The new value no longer fits beside its neighbors.
                    // Drop the old item and keep walking for room.
                    page.remove_item(index);
                    self.write_page(page_num, &page)?;
                    displaced = true;
                    trace!(page_num, "displaced item from its page");
                }
            }

            if free_page.is_none() && item_size <= page.free_space() {
                free_page = Some((page_num, page.clone()));
            }

            match page.next_page {
                Some(next) if !(displaced && free_page.is_some()) => page_num = u64::from(next),
                _ => break (page_num, page),
            }
        };

        if let Some((free_num, mut free)) = free_page {
            free.add_item(item);
            self.write_page(free_num, &free)?;
            self.assert_invariants();
            return Ok(());
        }

        // No page in the chain has room: link a fresh overflow page at the
        // tail. Pages are persisted before the metadata, the metadata
        // before the FSM bit.
        let (slot, new_page_num) = self.reserve_overflow_slot()?;
        trace!(slot, new_page_num, "linking new overflow page");

        let mut new_page = Page::empty();
        new_page.add_item(item);
        tail.next_page = Some(new_page_num as u32);

        self.write_page(tail_num, &tail)?;
        self.write_page(new_page_num, &new_page)?;
        self.write_metadata()?;
        self.fsm.take(slot)?;
        self.assert_invariants();
        Ok(())
    }

    /// Removes `key`. Removing an absent key is a no-op.
    ///
    /// An overflow page left empty by the removal is spliced out of its
    /// chain and its FSM slot is cleared; the predecessor page is persisted
    /// before the slot is freed. Bucket pages stay in place even when
    /// empty, and the overflow counters in the metadata are never
    /// decremented; the physical slot is reclaimed through the FSM alone.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        let _span = trace_span!("DiskMap::remove").entered();

        check_key(key)?;
        let hash = byte_array_hash(key);
        let bucket = self.meta.bucket_index(hash);
        let mut page_num = self.meta.bucket_page_num(bucket);
        if page_num >= self.meta.data_pages() {
            return Ok(());
        }

        let mut prev: Option<(u64, Page)> = None;
        loop {
            let mut page = self.read_page(page_num)?;
            let Some(index) = page.find(hash, key) else {
                match page.next_page {
                    Some(next) => {
                        prev = Some((page_num, page));
                        page_num = u64::from(next);
                        continue;
                    }
                    None => return Ok(()),
                }
            };

            page.remove_item(index);

            match prev {
                Some((prev_num, mut prev_page)) if page.is_empty() => {
                    prev_page.next_page = page.next_page;
                    self.write_page(prev_num, &prev_page)?;
                    let slot = self.meta.slot_for_overflow_page(page_num)?;
                    self.fsm.free(slot)?;
                    trace!(page_num, slot, "spliced out empty overflow page");
                }
                _ => {
                    self.write_page(page_num, &page)?;
                }
            }
            self.assert_invariants();
            return Ok(());
        }
    }

    /// Splits bucket `split_index`, rehashing its items with one extra hash
    /// bit and moving those with the new bit set into the buddy bucket at
    /// `split_index + 2^(hash_bits - 1)`.
    ///
    /// The buddy bucket page is materialized by growing the data file;
    /// bucket pages are never tracked by the FSM. Surviving items are
    /// repacked into the existing chain, and overflow pages that empty out
    /// are spliced and freed. Nothing calls this automatically; the growth
    /// policy belongs to the caller.
    pub fn split(&mut self) -> Result<()> {
        let _span = trace_span!("DiskMap::split").entered();

        if self.meta.hash_bits >= MAX_HASH_BITS {
            return Err(Error::NotSupported(
                "cannot split: every hash bit is already addressable".into(),
            ));
        }

        let round_buckets = 1u64 << (self.meta.hash_bits - 1);
        let split_bucket = u64::from(self.meta.split_index);
        let buddy_bucket = split_bucket + round_buckets;
        // Buddy position under the current counters. Allocations made after
        // the split state advances land in a later stripe and cannot move it.
        let buddy_page_num = self.meta.bucket_page_num(buddy_bucket);

        // Collect the whole chain of the splitting bucket.
        let mut chain: Vec<(u64, Page)> = Vec::new();
        let mut next = Some(self.meta.bucket_page_num(split_bucket));
        while let Some(page_num) = next {
            let page = self.read_page(page_num)?;
            next = page.next_page.map(u64::from);
            chain.push((page_num, page));
        }

        // Partition the items on the hash bit this round introduces.
        let mut low: Vec<Item> = Vec::new();
        let mut high: Vec<Item> = Vec::new();
        for (_, page) in &chain {
            for item in page.items() {
                let full = (item.hash as u32 as u64) & ((1u64 << self.meta.hash_bits) - 1);
                if full & round_buckets != 0 {
                    high.push(item.clone());
                } else {
                    low.push(item.clone());
                }
            }
        }
        trace!(
            split_bucket,
            buddy_bucket,
            buddy_page_num,
            low = low.len(),
            high = high.len(),
            "splitting bucket"
        );

        // Advance the split state first so overflow allocated while
        // repacking goes to the stripe after this round's bucket pages.
        self.meta.split_index += 1;
        if u64::from(self.meta.split_index) == round_buckets {
            self.meta.hash_bits += 1;
            self.meta.split_index = 0;
        }

        // Repack the surviving items into the existing chain, densely from
        // the head. Packing a subset of the chain's items in order never
        // needs more pages than the chain already has.
        let low_pages = pack_items(low);
        debug_assert!(low_pages.len() <= chain.len());
        for &(page_num, _) in &chain[low_pages.len()..] {
            let slot = self.meta.slot_for_overflow_page(page_num)?;
            self.fsm.free(slot)?;
            trace!(page_num, slot, "freed overflow page emptied by the split");
        }

        // Lay out the buddy chain: the bucket page first, then whatever
        // overflow it needs, which may reuse slots freed just above.
        let high_pages = pack_items(high);
        let mut buddy_nums: Vec<u64> = vec![buddy_page_num];
        for _ in 1..high_pages.len() {
            let (slot, page_num) = self.reserve_overflow_slot()?;
            self.fsm.take(slot)?;
            buddy_nums.push(page_num);
        }

        let low_nums: Vec<u64> = chain[..low_pages.len()].iter().map(|&(num, _)| num).collect();
        self.write_chain(&low_nums, low_pages)?;
        self.write_chain(&buddy_nums, high_pages)?;
        self.write_metadata()?;
        self.assert_invariants();
        Ok(())
    }

    /// Writes `pages` to the page numbers in `nums`, linking them in order.
    fn write_chain(&self, nums: &[u64], pages: Vec<Page>) -> Result<()> {
        debug_assert_eq!(nums.len(), pages.len());
        for (index, mut page) in pages.into_iter().enumerate() {
            page.next_page = nums.get(index + 1).map(|&next| next as u32);
            self.write_page(nums[index], &page)?;
        }
        Ok(())
    }

    /// Picks the overflow slot for a new page and maps it to its page
    /// number, without touching the FSM bit.
    ///
    /// A fresh slot (one past everything ever accounted) extends the active
    /// level's counter; a lower slot reuses a page that its own level still
    /// accounts for, since `remove` never decrements the counters.
    fn reserve_overflow_slot(&mut self) -> Result<(u32, u64)> {
        let slot = self.fsm.find_free_page();
        if u64::from(slot) == self.meta.total_overflow_pages() {
            let point = self.meta.active_split_point();
            self.meta.overflow_pages[point] += 1;
        }
        let page_num = self.meta.overflow_page_for_slot(slot)?;
        Ok((slot, page_num))
    }

    /// Serializes and writes one page.
    pub(crate) fn write_page(&self, page_num: u64, page: &Page) -> Result<()> {
        self.data.write_all_at(&page.encode(), page_offset(page_num))?;
        Ok(())
    }

    /// Writes the metadata record at offset 0.
    pub(crate) fn write_metadata(&self) -> Result<()> {
        self.data.write_all_at(&self.meta.encode(), 0)?;
        Ok(())
    }
}

/// Packs `items` into as few pages as they fit in, in order. Always yields
/// at least one (possibly empty) page, since every bucket keeps its bucket
/// page.
fn pack_items(items: Vec<Item>) -> Vec<Page> {
    let mut pages: Vec<Page> = Vec::new();
    let mut current = Page::empty();
    for item in items {
        if item.size() > current.free_space() {
            pages.push(current);
            current = Page::empty();
        }
        current.add_item(item);
    }
    pages.push(current);
    pages
}
