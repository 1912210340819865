//! Creating and reopening maps.

use std::collections::HashSet;
use std::path::Path;

use tracing::{trace, trace_span};

use crate::channel::{Channel, FileChannel};
use crate::error::{Error, Result};
use crate::fsm::FreeSpaceMap;
use crate::pages::Page;
use crate::{page_offset, DiskMap, Metadata, METADATA_LEN, PAGE_SIZE};

impl DiskMap<FileChannel> {
    /// Creates a new map on disk, truncating any existing files at the two
    /// paths, and opens it.
    pub fn create(data_path: &Path, fsm_path: &Path, initial_size: u32) -> Result<Self> {
        let data = FileChannel::create(data_path)?;
        let fsm = FileChannel::create(fsm_path)?;
        Self::create_with_channels(data, fsm, initial_size)
    }

    /// Opens an existing map from its data and FSM files.
    pub fn open(data_path: &Path, fsm_path: &Path) -> Result<Self> {
        let data = FileChannel::open(data_path)?;
        let fsm = FileChannel::open(fsm_path)?;
        Self::open_with_channels(data, fsm)
    }
}

impl<C: Channel> DiskMap<C> {
    /// Creates a new map over a pair of empty channels.
    ///
    /// `initial_size` is rounded up to a power of two and becomes the bucket
    /// count. Every bucket page is written out empty, then the metadata
    /// record.
    pub fn create_with_channels(data: C, fsm: C, initial_size: u32) -> Result<Self> {
        let _span = trace_span!("DiskMap::create").entered();

        if initial_size == 0 {
            return Err(Error::InvalidArgument(
                "initial size must be at least 1".into(),
            ));
        }
        if data.len()? != 0 {
            return Err(Error::InvalidArgument("data channel is not empty".into()));
        }
        if fsm.len()? != 0 {
            return Err(Error::InvalidArgument("FSM channel is not empty".into()));
        }

        let buckets = if initial_size == 1 {
            1
        } else {
            initial_size.next_power_of_two()
        };
        let meta = Metadata::for_initial(buckets);
        trace!(buckets, hash_bits = meta.hash_bits, "creating map");

        let empty = Page::empty().encode();
        for page in 0..u64::from(buckets) {
            data.write_all_at(&empty, page_offset(page))?;
        }
        data.write_all_at(&meta.encode(), 0)?;

        let map = Self {
            data,
            fsm: FreeSpaceMap::load(fsm)?,
            meta,
        };
        map.assert_invariants();
        Ok(map)
    }

    /// Opens a map from channels that already contain one.
    ///
    /// Beyond decoding the metadata, this verifies that the data file has
    /// exactly the derived number of pages and that the FSM file agrees
    /// with the overflow pages actually linked into bucket chains.
    pub fn open_with_channels(data: C, fsm: C) -> Result<Self> {
        let _span = trace_span!("DiskMap::open").entered();

        let data_len = data.len()?;
        if data_len < METADATA_LEN as u64 {
            return Err(Error::Corruption(format!(
                "data file is {data_len} bytes, smaller than the metadata record"
            )));
        }
        let mut meta_buf = [0u8; METADATA_LEN];
        data.read_exact_at(&mut meta_buf, 0)?;
        let meta = Metadata::decode(&meta_buf)?;

        let expected = METADATA_LEN as u64 + (meta.data_pages() << PAGE_SIZE.exponent());
        if data_len != expected {
            return Err(Error::Corruption(format!(
                "data file is {data_len} bytes, expected {expected} for {} pages",
                meta.data_pages()
            )));
        }
        trace!(
            hash_bits = meta.hash_bits,
            split_index = meta.split_index,
            pages = meta.data_pages(),
            "reopening map"
        );

        let map = Self {
            data,
            fsm: FreeSpaceMap::load(fsm)?,
            meta,
        };
        map.verify_fsm()?;
        map.assert_invariants();
        Ok(map)
    }

    /// Rebuilds the set of overflow slots referenced by the bucket chains
    /// and compares it with the FSM file. The two must agree exactly.
    fn verify_fsm(&self) -> Result<()> {
        let mut linked: HashSet<u32> = HashSet::new();

        for bucket in 0..self.meta.buckets_num() {
            let mut page_num = self.meta.bucket_page_num(bucket);
            let mut head = true;
            loop {
                let page = self.read_page(page_num)?;
                if !head {
                    let slot = self.meta.slot_for_overflow_page(page_num)?;
                    if !linked.insert(slot) {
                        return Err(Error::Corruption(format!(
                            "overflow page {page_num} is linked by more than one chain"
                        )));
                    }
                }
                match page.next_page {
                    Some(next) if u64::from(next) < self.meta.data_pages() => {
                        page_num = u64::from(next);
                        head = false;
                    }
                    Some(next) => {
                        return Err(Error::Corruption(format!(
                            "chain pointer to page {next} is beyond the data file"
                        )));
                    }
                    None => break,
                }
            }
        }

        let upper = linked
            .iter()
            .max()
            .map_or(0, |max| max + 1)
            .max(self.fsm.slot_count() as u32);
        for slot in 0..upper {
            let taken = !self.fsm.is_free(slot);
            if taken != linked.contains(&slot) {
                return Err(Error::Corruption(format!(
                    "FSM slot {slot}: on-disk bit disagrees with the bucket chains"
                )));
            }
        }
        Ok(())
    }
}
