//! Data pages and the items packed into them.

use static_assertions::const_assert_eq;
use zerocopy::byteorder::{BE, I32, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};

/// Size of every data page.
pub const PAGE_LEN: usize = 256;

/// Size of the page header: item count, free space, next-page pointer.
pub const PAGE_HEADER_LEN: usize = 8;

/// Free space in a page with no items, and therefore also the largest item
/// a page can hold.
pub const MAX_ITEM_LEN: usize = PAGE_LEN - PAGE_HEADER_LEN;

/// Size of an encoded item header: hash plus the two length prefixes.
pub(crate) const ITEM_HEADER_LEN: usize = 8;

/// The largest key the map accepts: an item holding it must still fit in a
/// page even with an empty value.
pub const MAX_KEY_LEN: usize = MAX_ITEM_LEN - ITEM_HEADER_LEN;

/// `next_page` value marking the end of a chain.
const NO_NEXT_PAGE: i32 = -1;

/// On-disk page header, big-endian.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct PageHeader {
    items_count: U16<BE>,
    free_space: U16<BE>,
    next_page: I32<BE>,
}
const_assert_eq!(core::mem::size_of::<PageHeader>(), PAGE_HEADER_LEN);

/// On-disk item header, big-endian. The key and value bytes follow.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct ItemHeader {
    hash: I32<BE>,
    key_len: U16<BE>,
    value_len: U16<BE>,
}
const_assert_eq!(core::mem::size_of::<ItemHeader>(), ITEM_HEADER_LEN);

/// A key/value entry together with the key's cached hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Item {
    pub(crate) hash: i32,
    pub(crate) key: Vec<u8>,
    pub(crate) value: Vec<u8>,
}

impl Item {
    pub(crate) fn new(hash: i32, key: &[u8], value: &[u8]) -> Self {
        Self {
            hash,
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    /// Encoded size: header plus both byte arrays.
    pub(crate) fn size(&self) -> usize {
        ITEM_HEADER_LEN + self.key.len() + self.value.len()
    }

    /// Key equality: equal hashes and byte-wise equal keys.
    pub(crate) fn matches(&self, hash: i32, key: &[u8]) -> bool {
        self.hash == hash && self.key == key
    }
}

/// The in-memory form of one data page.
///
/// Pages are transient values: read, mutated, re-serialized whole, and
/// dropped. The items keep insertion order; `free_space` accounts for every
/// byte not covered by the header or an item.
#[derive(Clone, Debug)]
pub(crate) struct Page {
    items: Vec<Item>,
    free_space: u16,
    /// Page number of the next page in the chain, if any.
    pub(crate) next_page: Option<u32>,
}

impl Page {
    /// A page with no items and no successor.
    pub(crate) fn empty() -> Self {
        Self {
            items: Vec::new(),
            free_space: MAX_ITEM_LEN as u16,
            next_page: None,
        }
    }

    pub(crate) fn free_space(&self) -> usize {
        self.free_space as usize
    }

    pub(crate) fn items(&self) -> &[Item] {
        &self.items
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Index of the item matching `(hash, key)`, if present.
    pub(crate) fn find(&self, hash: i32, key: &[u8]) -> Option<usize> {
        self.items.iter().position(|item| item.matches(hash, key))
    }

    /// Appends `item`. The caller must have checked that it fits.
    pub(crate) fn add_item(&mut self, item: Item) {
        debug_assert!(item.size() <= self.free_space as usize);
        self.free_space -= item.size() as u16;
        self.items.push(item);
    }

    /// Removes and returns the item at `index`, shifting the tail down.
    pub(crate) fn remove_item(&mut self, index: usize) -> Item {
        let item = self.items.remove(index);
        self.free_space += item.size() as u16;
        item
    }

    /// Overwrites the item at `index`, keeping its position.
    pub(crate) fn replace(&mut self, index: usize, item: Item) {
        let old_size = self.items[index].size();
        debug_assert!(self.free_space as usize + old_size >= item.size());
        self.free_space = (self.free_space as usize + old_size - item.size()) as u16;
        self.items[index] = item;
    }

    /// Decodes a page image. `page_num` is only used in error messages.
    pub(crate) fn decode(buf: &[u8; PAGE_LEN], page_num: u64) -> Result<Self> {
        // Cannot fail: the buffer is larger than the unaligned header.
        let (header, mut body) = PageHeader::ref_from_prefix(buf.as_slice()).unwrap();

        let items_count = usize::from(header.items_count.get());
        let free_space = header.free_space.get();
        let next_page = match header.next_page.get() {
            NO_NEXT_PAGE => None,
            next if next >= 0 => Some(next as u32),
            next => {
                return Err(Error::Corruption(format!(
                    "page {page_num}: negative next-page pointer {next}"
                )));
            }
        };
        if usize::from(free_space) > MAX_ITEM_LEN {
            return Err(Error::Corruption(format!(
                "page {page_num}: free space {free_space} exceeds the page body"
            )));
        }

        let mut items = Vec::with_capacity(items_count);
        for index in 0..items_count {
            let Ok((item_header, rest)) = ItemHeader::ref_from_prefix(body) else {
                return Err(Error::Corruption(format!(
                    "page {page_num}: header of item {index} overruns the page"
                )));
            };
            let key_len = usize::from(item_header.key_len.get());
            let value_len = usize::from(item_header.value_len.get());
            if key_len + value_len > rest.len() {
                return Err(Error::Corruption(format!(
                    "page {page_num}: item {index} overruns the page"
                )));
            }
            let (key, rest) = rest.split_at(key_len);
            let (value, rest) = rest.split_at(value_len);
            items.push(Item {
                hash: item_header.hash.get(),
                key: key.to_vec(),
                value: value.to_vec(),
            });
            body = rest;
        }

        let used: usize = items.iter().map(Item::size).sum();
        if usize::from(free_space) + used + PAGE_HEADER_LEN != PAGE_LEN {
            return Err(Error::Corruption(format!(
                "page {page_num}: free space {free_space} does not account for {used} item bytes"
            )));
        }

        Ok(Self {
            items,
            free_space,
            next_page,
        })
    }

    /// Serializes the page into a fresh 256-byte image. Bytes past the last
    /// item are left zeroed; their on-disk contents are undefined.
    pub(crate) fn encode(&self) -> [u8; PAGE_LEN] {
        let mut buf = [0u8; PAGE_LEN];
        let header = PageHeader {
            items_count: U16::new(self.items.len() as u16),
            free_space: U16::new(self.free_space),
            next_page: I32::new(self.next_page.map_or(NO_NEXT_PAGE, |next| next as i32)),
        };
        buf[..PAGE_HEADER_LEN].copy_from_slice(header.as_bytes());

        let mut at = PAGE_HEADER_LEN;
        for item in &self.items {
            let item_header = ItemHeader {
                hash: I32::new(item.hash),
                key_len: U16::new(item.key.len() as u16),
                value_len: U16::new(item.value.len() as u16),
            };
            buf[at..at + ITEM_HEADER_LEN].copy_from_slice(item_header.as_bytes());
            at += ITEM_HEADER_LEN;
            buf[at..at + item.key.len()].copy_from_slice(&item.key);
            at += item.key.len();
            buf[at..at + item.value.len()].copy_from_slice(&item.value);
            at += item.value.len();
        }
        buf
    }
}
