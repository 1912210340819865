use anyhow::Result;

use crate::channel::MemChannel;
use crate::{Channel, DiskMap, Error, FreeSpaceMap, METADATA_LEN, PAGE_LEN};

fn trace_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn mem_map(initial_size: u32) -> DiskMap<MemChannel> {
    DiskMap::create_with_channels(MemChannel::new(), MemChannel::new(), initial_size).unwrap()
}

fn reopen(map: DiskMap<MemChannel>) -> DiskMap<MemChannel> {
    let (data, fsm) = map.into_channels();
    DiskMap::open_with_channels(data, fsm).unwrap()
}

/// Chain length of `bucket`, in pages.
fn chain_len(map: &DiskMap<MemChannel>, bucket: u64) -> u64 {
    let mut len = 0;
    let mut next = Some(map.meta.bucket_page_num(bucket));
    while let Some(page_num) = next {
        len += 1;
        next = map.read_page(page_num).unwrap().next_page.map(u64::from);
    }
    len
}

#[test]
fn single_entry_round_trip() -> Result<()> {
    trace_init();
    let mut map = mem_map(1);
    map.put(b"key1", b"value - 1")?;
    map.put(b"key2", b"value - 2")?;

    assert_eq!(map.get(b"key1")?.as_deref(), Some(&b"value - 1"[..]));
    assert_eq!(map.get(b"key2")?.as_deref(), Some(&b"value - 2"[..]));
    assert_eq!(map.get(b"key3")?, None);

    // Both items fit in the single bucket page.
    let (data, _) = map.into_channels();
    assert_eq!(data.len()?, (METADATA_LEN + PAGE_LEN) as u64);
    Ok(())
}

#[test]
fn overflow_chain_growth() -> Result<()> {
    let mut map = mem_map(1);
    for i in 0..20 {
        map.put(format!("key - {i}").as_bytes(), format!("value - {i}").as_bytes())?;
    }

    for i in 0..20 {
        assert_eq!(
            map.get(format!("key - {i}").as_bytes())?,
            Some(format!("value - {i}").into_bytes())
        );
    }

    // One bucket, so the whole file is its chain; each overflow page in the
    // chain holds one FSM bit.
    assert!(map.num_data_pages() >= 2);
    assert_eq!(chain_len(&map, 0), map.num_data_pages());
    assert_eq!(
        map.free_space_map().taken() as u64,
        map.num_data_pages() - 1
    );
    Ok(())
}

#[test]
fn overwrite_displaces_item_that_no_longer_fits() -> Result<()> {
    let mut map = mem_map(1);
    for i in 0..20 {
        map.put(format!("key - {i}").as_bytes(), format!("value - {i}").as_bytes())?;
    }
    let pages_before = map.num_data_pages();

    // The first page of the chain is too full to hold this value next to
    // key - 0's neighbors, so the item is removed and reinserted further
    // down the chain.
    map.put(b"key - 0", b"value - ZZZZZZZ123")?;

    assert_eq!(map.get(b"key - 0")?.as_deref(), Some(&b"value - ZZZZZZZ123"[..]));
    for i in 1..20 {
        assert_eq!(
            map.get(format!("key - {i}").as_bytes())?,
            Some(format!("value - {i}").into_bytes())
        );
    }
    // Room existed later in the chain; no new page was needed.
    assert_eq!(map.num_data_pages(), pages_before);
    Ok(())
}

#[test]
fn remove_middle_of_chains() -> Result<()> {
    let mut map = mem_map(4);
    for i in 0..200 {
        map.put(format!("key#{i}").as_bytes(), format!("value - {i}").as_bytes())?;
    }

    for i in 5..195 {
        map.remove(format!("key#{i}").as_bytes())?;
    }

    for i in 0..200 {
        let got = map.get(format!("key#{i}").as_bytes())?;
        if (5..195).contains(&i) {
            assert_eq!(got, None, "key#{i} should be gone");
        } else {
            assert_eq!(got, Some(format!("value - {i}").into_bytes()));
        }
    }

    // The FSM population equals the overflow pages still linked.
    let linked: u64 = (0..map.num_buckets()).map(|b| chain_len(&map, b) - 1).sum();
    assert_eq!(map.free_space_map().taken() as u64, linked);
    Ok(())
}

#[test]
fn reinsert_after_remove() -> Result<()> {
    let mut map = mem_map(4);
    for i in 0..200 {
        map.put(format!("key#{i}").as_bytes(), format!("value - {i}").as_bytes())?;
    }
    for i in 5..195 {
        map.remove(format!("key#{i}").as_bytes())?;
    }
    for i in 50..=150 {
        map.put(format!("key#{i}").as_bytes(), format!("Restored:{i}").as_bytes())?;
    }

    for i in 0..200 {
        let got = map.get(format!("key#{i}").as_bytes())?;
        let expected = if (50..=150).contains(&i) {
            Some(format!("Restored:{i}").into_bytes())
        } else if (5..195).contains(&i) {
            None
        } else {
            Some(format!("value - {i}").into_bytes())
        };
        assert_eq!(got, expected, "key#{i}");
    }
    Ok(())
}

#[test]
fn fsm_first_fit_and_lazy_growth() -> Result<()> {
    let mut fsm = FreeSpaceMap::load(MemChannel::new())?;

    for expected in 0..16 {
        assert_eq!(fsm.take_free_page()?, expected);
    }

    fsm.free(1)?;
    fsm.free(5)?;
    fsm.free(9)?;
    assert_eq!(fsm.take_free_page()?, 1);
    assert_eq!(fsm.take_free_page()?, 5);
    assert_eq!(fsm.take_free_page()?, 9);

    // Far beyond the allocated FSM pages: the pages in between materialize
    // lazily, zero-filled.
    fsm.take(20_000)?;
    assert!(!fsm.is_free(20_000));
    assert!(fsm.is_free(19_999));

    // Slot 20_000 lives on FSM page 78, so the file holds pages 0..=78.
    let chan = fsm.into_channel();
    assert_eq!(chan.len()?, 79 * 32);
    Ok(())
}

#[test]
fn overwrite_then_remove() -> Result<()> {
    let mut map = mem_map(1);
    map.put(b"k", b"v1")?;
    map.put(b"k", b"v2")?;
    assert_eq!(map.get(b"k")?.as_deref(), Some(&b"v2"[..]));

    map.remove(b"k")?;
    assert_eq!(map.get(b"k")?, None);
    Ok(())
}

#[test]
fn remove_is_idempotent() -> Result<()> {
    let mut map = mem_map(1);
    map.put(b"present", b"x")?;
    map.remove(b"missing")?;
    map.remove(b"present")?;
    map.remove(b"present")?;
    assert_eq!(map.get(b"present")?, None);
    Ok(())
}

#[test]
fn empty_and_binary_keys_round_trip() -> Result<()> {
    let mut map = mem_map(2);
    map.put(b"", b"empty key")?;
    map.put(b"empty value", b"")?;
    map.put(&[0x00, 0x80, 0xff], &[0xde, 0xad, 0xbe, 0xef])?;

    assert_eq!(map.get(b"")?.as_deref(), Some(&b"empty key"[..]));
    assert_eq!(map.get(b"empty value")?.as_deref(), Some(&b""[..]));
    assert_eq!(
        map.get(&[0x00, 0x80, 0xff])?.as_deref(),
        Some(&[0xde, 0xad, 0xbe, 0xef][..])
    );
    Ok(())
}

#[test]
fn reopen_round_trip() -> Result<()> {
    trace_init();
    let mut map = mem_map(2);
    for i in 0..60 {
        map.put(format!("key - {i}").as_bytes(), format!("value - {i}").as_bytes())?;
    }

    let map = reopen(map);
    for i in 0..60 {
        assert_eq!(
            map.get(format!("key - {i}").as_bytes())?,
            Some(format!("value - {i}").into_bytes())
        );
    }
    Ok(())
}

#[test]
fn reopen_after_remove_and_slot_reuse() -> Result<()> {
    let mut map = mem_map(1);
    for i in 0..40 {
        map.put(format!("key - {i}").as_bytes(), format!("value - {i}").as_bytes())?;
    }
    for i in 10..30 {
        map.remove(format!("key - {i}").as_bytes())?;
    }
    let mut map = reopen(map);

    // Reinsertion reuses freed slots; the overflow counters must keep
    // agreeing with the file size across another reopen.
    for i in 10..30 {
        map.put(format!("key - {i}").as_bytes(), format!("back - {i}").as_bytes())?;
    }
    let map = reopen(map);

    for i in 0..40 {
        let expected = if (10..30).contains(&i) {
            format!("back - {i}")
        } else {
            format!("value - {i}")
        };
        assert_eq!(
            map.get(format!("key - {i}").as_bytes())?,
            Some(expected.into_bytes())
        );
    }
    Ok(())
}

#[test]
fn reopen_from_real_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let data_path = dir.path().join("map.data");
    let fsm_path = dir.path().join("map.fsm");

    let mut map = DiskMap::create(&data_path, &fsm_path, 4)?;
    for i in 0..100 {
        map.put(format!("key#{i}").as_bytes(), format!("value - {i}").as_bytes())?;
    }
    map.remove(b"key#13")?;
    map.close()?;

    let map = DiskMap::open(&data_path, &fsm_path)?;
    assert_eq!(map.get(b"key#13")?, None);
    for i in (0..100).filter(|&i| i != 13) {
        assert_eq!(
            map.get(format!("key#{i}").as_bytes())?,
            Some(format!("value - {i}").into_bytes())
        );
    }
    Ok(())
}

#[test]
fn split_redistributes_a_bucket() -> Result<()> {
    trace_init();
    let mut map = mem_map(1);
    for i in 0..50 {
        map.put(format!("key - {i}").as_bytes(), format!("value - {i}").as_bytes())?;
    }

    assert_eq!(map.num_buckets(), 1);
    map.split()?;
    assert_eq!(map.num_buckets(), 2);
    assert_eq!(map.hash_bits(), 2);
    assert_eq!(map.split_index(), 0);

    for i in 0..50 {
        assert_eq!(
            map.get(format!("key - {i}").as_bytes())?,
            Some(format!("value - {i}").into_bytes())
        );
    }
    Ok(())
}

#[test]
fn split_rounds_survive_reopen_and_updates() -> Result<()> {
    let mut map = mem_map(1);
    for i in 0..80 {
        map.put(format!("key - {i}").as_bytes(), format!("value - {i}").as_bytes())?;
    }

    // Two full rounds and the start of a third, reopening between splits to
    // prove the derived file geometry matches what reopen expects.
    for _ in 0..5 {
        map.split()?;
        map = reopen(map);
    }
    assert_eq!(map.num_buckets(), 6);
    assert_eq!(map.hash_bits(), 3);
    assert_eq!(map.split_index(), 2);

    for i in 0..80 {
        assert_eq!(
            map.get(format!("key - {i}").as_bytes())?,
            Some(format!("value - {i}").into_bytes())
        );
    }

    // The map keeps working mid-round: updates, removals, new chains.
    for i in 0..80 {
        map.put(format!("key - {i}").as_bytes(), format!("updated - {i}").as_bytes())?;
    }
    for i in 40..60 {
        map.remove(format!("key - {i}").as_bytes())?;
    }
    let map = reopen(map);
    for i in 0..80 {
        let expected = if (40..60).contains(&i) {
            None
        } else {
            Some(format!("updated - {i}").into_bytes())
        };
        assert_eq!(map.get(format!("key - {i}").as_bytes())?, expected);
    }
    Ok(())
}

#[test]
fn split_stops_at_the_last_hash_bit() {
    let mut map = mem_map(1);
    map.meta.hash_bits = crate::MAX_HASH_BITS;
    assert!(matches!(map.split(), Err(Error::NotSupported(_))));
}

#[test]
fn oversize_arguments_are_rejected_eagerly() {
    let mut map = mem_map(1);

    let long_key = vec![b'k'; 241];
    assert!(matches!(
        map.get(&long_key),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        map.put(&long_key, b""),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        map.remove(&long_key),
        Err(Error::InvalidArgument(_))
    ));

    // 240-byte key with an empty value is exactly the largest item.
    let max_key = vec![b'k'; 240];
    map.put(&max_key, b"").unwrap();
    assert_eq!(map.get(&max_key).unwrap().as_deref(), Some(&b""[..]));

    // One value byte more no longer fits in a page.
    assert!(matches!(
        map.put(&max_key, b"x"),
        Err(Error::InvalidArgument(_))
    ));

    assert!(matches!(
        DiskMap::create_with_channels(MemChannel::new(), MemChannel::new(), 0),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn create_refuses_non_empty_channels() {
    let data = MemChannel::new();
    data.write_all_at(b"leftover", 0).unwrap();
    assert!(matches!(
        DiskMap::create_with_channels(data, MemChannel::new(), 1),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn reopen_rejects_truncated_data_file() {
    let mut map = mem_map(1);
    for i in 0..20 {
        map.put(format!("key - {i}").as_bytes(), b"v").unwrap();
    }
    let (data, fsm) = map.into_channels();

    let len = data.len().unwrap();
    data.set_len(len - PAGE_LEN as u64).unwrap();
    assert!(matches!(
        DiskMap::open_with_channels(data, fsm),
        Err(Error::Corruption(_))
    ));
}

#[test]
fn reopen_rejects_fsm_that_disagrees_with_chains() {
    let mut map = mem_map(1);
    for i in 0..20 {
        map.put(format!("key - {i}").as_bytes(), format!("value - {i}").as_bytes())
            .unwrap();
    }
    assert!(map.free_space_map().taken() >= 2);
    let (data, fsm) = map.into_channels();

    // Clear the first FSM byte: slots still linked by the chain now read free.
    fsm.write_all_at(&[0u8], 0).unwrap();
    assert!(matches!(
        DiskMap::open_with_channels(data, fsm),
        Err(Error::Corruption(_))
    ));
}

#[test]
fn reopen_rejects_garbage_metadata() {
    let map = mem_map(1);
    let (data, fsm) = map.into_channels();

    data.write_all_at(&[0u8; METADATA_LEN], 0).unwrap();
    assert!(matches!(
        DiskMap::open_with_channels(data, fsm),
        Err(Error::Corruption(_))
    ));
}

#[test]
fn values_can_span_page_capacity_boundaries() -> Result<()> {
    let mut map = mem_map(1);

    // Items close to the page capacity force one item per page.
    let big = vec![0xabu8; 200];
    for i in 0..6u8 {
        map.put(&[i], &big)?;
    }
    for i in 0..6u8 {
        assert_eq!(map.get(&[i])?, Some(big.clone()));
    }
    assert_eq!(map.num_data_pages(), 6);

    // Shrink one value; its page gains room for a later insert.
    map.put(&[3], b"small now")?;
    assert_eq!(map.get(&[3])?.as_deref(), Some(&b"small now"[..]));
    Ok(())
}
