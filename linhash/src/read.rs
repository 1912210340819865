//! Reading from the map.

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::pages::{Page, MAX_KEY_LEN, PAGE_LEN};
use crate::{byte_array_hash, page_offset, DiskMap};

impl<C: Channel> DiskMap<C> {
    /// Looks up `key`, returning a copy of its value.
    ///
    /// Walks the bucket's page chain and returns the first item whose hash
    /// and key bytes both match.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        let hash = byte_array_hash(key);
        let bucket = self.meta.bucket_index(hash);
        let mut page_num = self.meta.bucket_page_num(bucket);
        if page_num >= self.meta.data_pages() {
            return Ok(None);
        }
        loop {
            let page = self.read_page(page_num)?;
            if let Some(index) = page.find(hash, key) {
                return Ok(Some(page.items()[index].value.clone()));
            }
            match page.next_page {
                Some(next) => page_num = u64::from(next),
                None => return Ok(None),
            }
        }
    }

    /// Reads and decodes the page at `page_num`.
    pub(crate) fn read_page(&self, page_num: u64) -> Result<Page> {
        let mut buf = [0u8; PAGE_LEN];
        self.data.read_exact_at(&mut buf, page_offset(page_num))?;
        Page::decode(&buf, page_num)
    }
}

/// Rejects keys the page format cannot hold. Runs before any I/O.
pub(crate) fn check_key(key: &[u8]) -> Result<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidArgument(format!(
            "key is {} bytes, the maximum is {MAX_KEY_LEN}",
            key.len()
        )));
    }
    Ok(())
}
