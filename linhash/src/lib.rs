//! Reads and writes linear-hashing page files: a single-writer, disk-backed
//! map from opaque byte keys to opaque byte values.
//!
//! A map is stored across two files. The _data file_ starts with a fixed
//! 137-byte metadata record and is followed by 256-byte pages. Each hash
//! bucket owns one _bucket page_ and a singly linked chain of _overflow
//! pages_; items (key, value, and the key's cached hash) are packed into
//! pages back to back. The _FSM file_ is a bit-packed free-space map with
//! one bit per overflow slot, so overflow pages released by `remove` can be
//! handed out again without rewriting the file.
//!
//! Linear hashing grows the table one bucket at a time: `split` rehashes a
//! single bucket using one extra hash bit and appends its buddy bucket page,
//! without ever rehashing the whole file. The addressing state needed for
//! this (`hash_bits`, `split_index`, and one overflow counter per level)
//! lives in the metadata record, and every physical page position is derived
//! from it.
//!
//! The map is not safe for concurrent use and does not claim crash
//! consistency; writes within one operation are ordered (pages, then
//! metadata, then the FSM) only to keep the damage from a torn operation
//! small.
//!
//! # References
//! * W. Litwin, _Linear Hashing: A New Tool for File and Table Addressing_,
//!   VLDB 1980.

#![forbid(unused_must_use)]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod check;
mod error;
mod fsm;
mod open;
mod pages;
mod read;
mod write;

#[cfg(test)]
mod tests;

pub use channel::{Channel, FileChannel};
pub use error::{Error, Result};
pub use fsm::FreeSpaceMap;
pub use pages::{MAX_ITEM_LEN, MAX_KEY_LEN, PAGE_HEADER_LEN, PAGE_LEN};

use pow2::Pow2;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::{BE, I32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// The size of every data page. Fixed by the on-disk format.
pub const PAGE_SIZE: Pow2 = Pow2::from_exponent(8);
const_assert_eq!(PAGE_LEN, 256);

/// The largest number of hash bits the metadata can represent. One overflow
/// counter is kept per level, hence the 33-entry counter array.
pub(crate) const MAX_HASH_BITS: u8 = 33;

/// Number of per-level overflow counters in the metadata record.
pub(crate) const LEVELS: usize = MAX_HASH_BITS as usize;

/// Size of the metadata record at the start of the data file.
pub(crate) const METADATA_LEN: usize = core::mem::size_of::<MetadataRecord>();
const_assert_eq!(METADATA_LEN, 137);

/// Byte offset of a data page within the data file.
pub(crate) fn page_offset(page: u64) -> u64 {
    METADATA_LEN as u64 + (page << PAGE_SIZE.exponent())
}

/// The hash persisted with every item and compared on lookup.
///
/// A polynomial hash with multiplier 31 over the *signed* value of each byte,
/// with wrapping 32-bit arithmetic, starting from 1. The exact definition is
/// part of the on-disk contract: changing it would orphan every item in
/// every existing file.
pub fn byte_array_hash(bytes: &[u8]) -> i32 {
    let mut hash: i32 = 1;
    for &b in bytes {
        hash = hash.wrapping_mul(31).wrapping_add((b as i8) as i32);
    }
    hash
}

/// The on-disk form of the metadata record at offset 0 of the data file.
/// All integers are big-endian.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct MetadataRecord {
    hash_bits: u8,
    split_index: I32<BE>,
    overflow_pages: [I32<BE>; LEVELS],
}

/// The decoded addressing state of a map.
///
/// `hash_bits` is the number of hash bits currently addressable;
/// `split_index` is the next bucket to split in the current round; and
/// `overflow_pages[i]` counts the overflow pages allocated while level `i`
/// was active. Every physical page position is derived from these fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Metadata {
    pub(crate) hash_bits: u8,
    pub(crate) split_index: u32,
    pub(crate) overflow_pages: [u32; LEVELS],
}

impl Metadata {
    /// The state for a freshly created map with `buckets_num` buckets.
    /// `buckets_num` must be a power of two.
    pub(crate) fn for_initial(buckets_num: u32) -> Self {
        // Bit length, so that a single bucket still gets one hash bit.
        let hash_bits = (u32::BITS - buckets_num.leading_zeros()) as u8;
        Self {
            hash_bits,
            split_index: 0,
            overflow_pages: [0; LEVELS],
        }
    }

    pub(crate) fn decode(buf: &[u8; METADATA_LEN]) -> Result<Self> {
        // Cannot fail: the buffer length is exactly the record length.
        let record = MetadataRecord::read_from_bytes(buf.as_slice()).unwrap();

        let hash_bits = record.hash_bits;
        if hash_bits == 0 || hash_bits > MAX_HASH_BITS {
            return Err(Error::Corruption(format!(
                "metadata holds {hash_bits} hash bits, outside 1..={MAX_HASH_BITS}"
            )));
        }

        let split_index = record.split_index.get();
        if split_index < 0 || (split_index as u64) >= 1u64 << (hash_bits - 1) {
            return Err(Error::Corruption(format!(
                "metadata split index {split_index} is outside the current round"
            )));
        }

        let mut overflow_pages = [0u32; LEVELS];
        for (level, counter) in record.overflow_pages.iter().enumerate() {
            let count = counter.get();
            if count < 0 {
                return Err(Error::Corruption(format!(
                    "metadata overflow counter for level {level} is negative ({count})"
                )));
            }
            overflow_pages[level] = count as u32;
        }

        Ok(Self {
            hash_bits,
            split_index: split_index as u32,
            overflow_pages,
        })
    }

    pub(crate) fn encode(&self) -> [u8; METADATA_LEN] {
        let record = MetadataRecord {
            hash_bits: self.hash_bits,
            split_index: I32::new(self.split_index as i32),
            overflow_pages: self.overflow_pages.map(|n| I32::new(n as i32)),
        };
        let mut buf = [0u8; METADATA_LEN];
        buf.copy_from_slice(record.as_bytes());
        buf
    }

    /// Number of addressable buckets: `2^(hash_bits - 1) + split_index`.
    pub(crate) fn buckets_num(&self) -> u64 {
        (1u64 << (self.hash_bits - 1)) + self.split_index as u64
    }

    /// Total overflow pages accounted across all levels.
    pub(crate) fn total_overflow_pages(&self) -> u64 {
        self.overflow_pages.iter().map(|&n| n as u64).sum()
    }

    /// The level whose overflow counter the next allocation belongs to.
    pub(crate) fn active_split_point(&self) -> usize {
        if self.split_index == 0 {
            (self.hash_bits - 1) as usize
        } else {
            self.hash_bits as usize
        }
    }

    /// Maps a key hash to its bucket.
    ///
    /// Buckets already split in the current round address with the full
    /// `hash_bits` bits; the rest still address with one bit fewer.
    pub(crate) fn bucket_index(&self, hash: i32) -> u64 {
        let bits = u32::from(self.hash_bits);
        let full = (hash as u32 as u64) & ((1u64 << bits) - 1);
        let half = full & !(1u64 << (bits - 1));
        if half < self.split_index as u64 {
            full
        } else {
            half
        }
    }

    /// Maps a bucket to its physical page number.
    ///
    /// The highest set bit of the bucket index tells how many complete
    /// stripes of overflow pages precede the bucket page.
    pub(crate) fn bucket_page_num(&self, bucket_index: u64) -> u64 {
        if bucket_index == 0 {
            return 0;
        }
        let top = bucket_index.ilog2() as usize;
        let preceding: u64 = self.overflow_pages[..=top].iter().map(|&n| n as u64).sum();
        bucket_index + preceding
    }

    /// Maps an FSM slot to its overflow page number.
    ///
    /// Slots are numbered densely in allocation-stripe order; the stripe for
    /// level `i` sits directly after the `2^i` bucket pages of that level.
    pub(crate) fn overflow_page_for_slot(&self, slot: u32) -> Result<u64> {
        let point = self.active_split_point();
        let mut covered = 0u64;
        for (level, &count) in self.overflow_pages[..=point].iter().enumerate() {
            covered += count as u64;
            if (slot as u64) < covered {
                return Ok(slot as u64 + (1u64 << level));
            }
        }
        Err(Error::Corruption(format!(
            "overflow slot {slot} is beyond every level counter"
        )))
    }

    /// Maps an overflow page number back to its FSM slot.
    pub(crate) fn slot_for_overflow_page(&self, page: u64) -> Result<u32> {
        let point = self.active_split_point();
        let mut covered = 0u64;
        for (level, &count) in self.overflow_pages[..=point].iter().enumerate() {
            covered += count as u64;
            let buckets = 1u64 << level;
            if page < covered + buckets {
                // Cross-check against the forward mapping: bucket pages and
                // reserved buddy positions fall through to the error below.
                if let Some(slot) = page.checked_sub(buckets).and_then(|s| u32::try_from(s).ok()) {
                    if matches!(self.overflow_page_for_slot(slot), Ok(p) if p == page) {
                        return Ok(slot);
                    }
                }
                return Err(Error::Corruption(format!(
                    "page {page} is not an overflow page"
                )));
            }
        }
        Err(Error::Corruption(format!(
            "page {page} is beyond every overflow stripe"
        )))
    }

    /// Number of pages the data file holds.
    ///
    /// Dense (`buckets + overflow`) whenever `split_index == 0`. During a
    /// split round with overflow already allocated at the active level, the
    /// file additionally reserves the buddy bucket positions of the round,
    /// because the active stripe starts after all `2^point` bucket pages.
    pub(crate) fn data_pages(&self) -> u64 {
        let point = self.active_split_point();
        if self.split_index != 0 && self.overflow_pages[point] > 0 {
            (1u64 << point) + self.total_overflow_pages()
        } else {
            self.buckets_num() + self.total_overflow_pages()
        }
    }
}

/// A disk-backed map from byte keys to byte values, addressed by linear
/// hashing over 256-byte pages.
///
/// The map owns its two channels for its whole lifetime: `C` is the channel
/// type, [`FileChannel`] by default. [`DiskMap::create`] and
/// [`DiskMap::open`] work on file paths; the `*_with_channels` constructors
/// accept any [`Channel`].
///
/// A `DiskMap` must not be shared between writers; callers serialize access
/// externally.
pub struct DiskMap<C = FileChannel> {
    /// Channel holding the metadata record and all data pages.
    data: C,
    /// The overflow-slot allocator, backed by its own channel.
    fsm: FreeSpaceMap<C>,
    /// In-memory copy of the metadata record at offset 0.
    meta: Metadata,
}

impl<C> DiskMap<C> {
    /// Number of hash bits currently addressable.
    pub fn hash_bits(&self) -> u8 {
        self.meta.hash_bits
    }

    /// The next bucket to be split.
    pub fn split_index(&self) -> u32 {
        self.meta.split_index
    }

    /// Number of addressable buckets.
    pub fn num_buckets(&self) -> u64 {
        self.meta.buckets_num()
    }

    /// Total overflow pages accounted in the metadata. Pages freed by
    /// `remove` stay accounted; only their FSM bits are cleared.
    pub fn num_overflow_pages(&self) -> u64 {
        self.meta.total_overflow_pages()
    }

    /// Number of pages in the data file.
    pub fn num_data_pages(&self) -> u64 {
        self.meta.data_pages()
    }

    /// Read-only view of the free-space map.
    pub fn free_space_map(&self) -> &FreeSpaceMap<C> {
        &self.fsm
    }

    /// Closes the map. The data channel is dropped first, then the FSM
    /// channel; field order encodes that.
    pub fn close(self) -> Result<()> {
        Ok(())
    }

    /// Extracts the underlying channels `(data, fsm)`, consuming the map.
    pub fn into_channels(self) -> (C, C) {
        (self.data, self.fsm.into_channel())
    }
}

#[test]
fn hash_golden_values() {
    assert_eq!(byte_array_hash(b""), 1);
    assert_eq!(byte_array_hash(&[0]), 31);
    assert_eq!(byte_array_hash(&[1, 2, 3]), 30817);
    assert_eq!(byte_array_hash(b"abc"), 126145);
    // Bytes are hashed as signed values.
    assert_eq!(byte_array_hash(&[0x80]), -97);
    assert_eq!(byte_array_hash(&[0xff]), 30);
}

#[test]
fn initial_metadata_bit_lengths() {
    assert_eq!(Metadata::for_initial(1).hash_bits, 1);
    assert_eq!(Metadata::for_initial(2).hash_bits, 2);
    assert_eq!(Metadata::for_initial(4).hash_bits, 3);
    assert_eq!(Metadata::for_initial(256).hash_bits, 9);

    // 2^(hash_bits - 1) recovers the bucket count while split_index == 0.
    for buckets in [1u32, 2, 4, 8, 64] {
        let meta = Metadata::for_initial(buckets);
        assert_eq!(meta.buckets_num(), buckets as u64);
    }
}

#[test]
fn bucket_index_splits_on_the_top_bit() {
    let mut meta = Metadata::for_initial(4);
    assert_eq!(meta.hash_bits, 3);

    // No bucket split yet: everything addresses with two bits.
    assert_eq!(meta.bucket_index(0b101), 0b01);
    assert_eq!(meta.bucket_index(0b110), 0b10);

    // Buckets below the split pointer use the full three bits.
    meta.split_index = 2;
    assert_eq!(meta.bucket_index(0b101), 0b101);
    assert_eq!(meta.bucket_index(0b001), 0b001);
    assert_eq!(meta.bucket_index(0b110), 0b10);
    assert_eq!(meta.bucket_index(0b111), 0b11);
}

#[test]
fn bucket_pages_interleave_with_overflow_stripes() {
    let mut meta = Metadata::for_initial(4);
    meta.overflow_pages[0] = 2;
    meta.overflow_pages[1] = 3;

    assert_eq!(meta.bucket_page_num(0), 0);
    assert_eq!(meta.bucket_page_num(1), 3);
    assert_eq!(meta.bucket_page_num(2), 7);
    assert_eq!(meta.bucket_page_num(3), 8);
}

#[test]
fn slot_mapping_round_trips() {
    let mut meta = Metadata::for_initial(4);
    meta.split_index = 1;
    meta.overflow_pages[0] = 2;
    meta.overflow_pages[1] = 3;
    meta.overflow_pages[2] = 4;
    meta.overflow_pages[3] = 2;

    assert_eq!(meta.overflow_page_for_slot(0).unwrap(), 1);
    assert_eq!(meta.overflow_page_for_slot(2).unwrap(), 4);
    assert_eq!(meta.overflow_page_for_slot(5).unwrap(), 9);

    for slot in 0..11u32 {
        let page = meta.overflow_page_for_slot(slot).unwrap();
        assert_eq!(meta.slot_for_overflow_page(page).unwrap(), slot);
    }

    // Bucket pages are not overflow pages.
    assert!(meta.slot_for_overflow_page(0).is_err());
    assert!(meta.slot_for_overflow_page(meta.bucket_page_num(1)).is_err());
}

#[test]
fn metadata_record_round_trips() {
    let mut meta = Metadata::for_initial(8);
    meta.split_index = 3;
    meta.overflow_pages[2] = 7;
    meta.overflow_pages[4] = 1;

    let decoded = Metadata::decode(&meta.encode()).unwrap();
    assert_eq!(decoded, meta);
}

#[test]
fn metadata_decode_rejects_bad_fields() {
    let meta = Metadata::for_initial(4);

    let mut zeroed_bits = meta.encode();
    zeroed_bits[0] = 0;
    assert!(matches!(
        Metadata::decode(&zeroed_bits),
        Err(Error::Corruption(_))
    ));

    let mut wild_split = meta.encode();
    wild_split[1..5].copy_from_slice(&100i32.to_be_bytes());
    assert!(matches!(
        Metadata::decode(&wild_split),
        Err(Error::Corruption(_))
    ));

    let mut negative_counter = meta.encode();
    negative_counter[5..9].copy_from_slice(&(-1i32).to_be_bytes());
    assert!(matches!(
        Metadata::decode(&negative_counter),
        Err(Error::Corruption(_))
    ));
}
