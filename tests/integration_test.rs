use anyhow::Result;
use blockdb::access::{BTree, BincodeSerializer, NaturalOrder};
use blockdb::storage::page::BlockId;
use blockdb::storage::wal::TransactionLog;
use blockdb::{RecordManager, StorageError, StoreConfig, TxnState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tempfile::{tempdir, TempDir};

const BLOCK_SIZE: usize = 4096;

fn config() -> StoreConfig {
    StoreConfig::default()
        .block_size(BLOCK_SIZE)
        .sync_on_commit(false)
}

fn create_store() -> Result<(RecordManager, PathBuf, TempDir)> {
    let dir = tempdir()?;
    let path = dir.path().join("store.db");
    let rm = RecordManager::create(&path, config())?;
    Ok((rm, path, dir))
}

/// Block images of the store file, for hand-made log contents.
fn blocks_of(bytes: &[u8]) -> Vec<(BlockId, &[u8])> {
    bytes
        .chunks(BLOCK_SIZE)
        .enumerate()
        .map(|(i, chunk)| (BlockId(i as u64), chunk))
        .collect()
}

fn write_log(store: &Path, images: Vec<(BlockId, &[u8])>) -> Result<()> {
    let mut log = TransactionLog::open(&TransactionLog::path_for(store), true)?;
    log.truncate()?;
    log.write_transaction(images)?;
    Ok(())
}

#[test]
fn test_records_survive_reopen() -> Result<()> {
    let (rm, path, _dir) = create_store()?;
    let mut rng = StdRng::seed_from_u64(7);

    let mut records = Vec::new();
    for _ in 0..300 {
        let len = rng.gen_range(0..12_000);
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let recid = rm.insert(&data)?;
        records.push((recid, data));
    }
    rm.commit()?;
    rm.close()?;

    let rm = RecordManager::open(&path, config())?;
    for (recid, data) in &records {
        assert_eq!(&rm.fetch(*recid)?, data);
    }
    assert!(rm.verify()?.is_ok());
    Ok(())
}

#[test]
fn test_free_space_is_reused() -> Result<()> {
    let (rm, _path, _dir) = create_store()?;
    let sizes: Vec<usize> = (0..200).map(|i| (i * 37) % 3000 + 1).collect();

    let mut blocks = Vec::new();
    let mut free_slots = Vec::new();
    for _ in 0..4 {
        let recids = sizes
            .iter()
            .map(|&len| rm.insert(&vec![0xAB; len]))
            .collect::<Result<Vec<_>, _>>()?;
        rm.commit()?;
        for recid in recids {
            rm.delete(recid)?;
        }
        rm.commit()?;
        let stats = rm.stats()?;
        blocks.push(stats.total_blocks);
        free_slots.push(stats.free_slots);
    }

    // The first round sizes the store; later rounds fit in the same blocks
    // and take every slot back from the registry
    assert_eq!(blocks[1], blocks[2]);
    assert_eq!(blocks[2], blocks[3]);
    assert_eq!(free_slots[1], free_slots[2]);
    assert_eq!(free_slots[2], free_slots[3]);
    assert_eq!(rm.stats()?.live_records, 0);
    assert!(rm.verify()?.is_ok());
    Ok(())
}

#[test]
fn test_record_growth_keeps_recid() -> Result<()> {
    let (rm, path, _dir) = create_store()?;

    let small = vec![1u8; 10_000];
    let recid = rm.insert(&small)?;
    rm.commit()?;

    let large: Vec<u8> = (0..30_000u32).map(|i| (i % 251) as u8).collect();
    rm.update(recid, &large)?;
    rm.commit()?;
    assert_eq!(rm.fetch(recid)?, large);

    rm.update(recid, b"tiny")?;
    rm.commit()?;
    assert_eq!(rm.fetch(recid)?, b"tiny");

    rm.delete(recid)?;
    assert!(matches!(rm.fetch(recid), Err(StorageError::RecordNotFound(_))));
    let again = rm.insert(&large)?;
    assert_eq!(again, recid);
    rm.commit()?;
    rm.close()?;

    let rm = RecordManager::open(&path, config())?;
    assert_eq!(rm.fetch(recid)?, large);
    assert!(rm.verify()?.is_ok());
    Ok(())
}

#[test]
fn test_rollback_leaves_file_untouched() -> Result<()> {
    let (rm, path, _dir) = create_store()?;
    let a = rm.insert(&vec![1u8; 3000])?;
    let b = rm.insert(&vec![2u8; 3000])?;
    let c = rm.insert(&vec![3u8; 3000])?;
    rm.commit()?;
    let before = fs::read(&path)?;

    rm.update(a, &vec![9u8; 3000])?;
    rm.update(b, &vec![9u8; 100])?;
    rm.delete(c)?;
    rm.insert(&vec![4u8; 20_000])?;
    assert_eq!(rm.transaction_state()?, TxnState::Open);

    rm.rollback()?;
    assert_eq!(rm.transaction_state()?, TxnState::Idle);
    rm.rollback()?;

    assert_eq!(fs::read(&path)?, before);
    assert_eq!(rm.fetch(a)?, vec![1u8; 3000]);
    assert_eq!(rm.fetch(b)?, vec![2u8; 3000]);
    assert_eq!(rm.fetch(c)?, vec![3u8; 3000]);
    assert!(rm.verify()?.is_ok());
    Ok(())
}

#[test]
fn test_replays_committed_log() -> Result<()> {
    let (rm, path, _dir) = create_store()?;
    let a = rm.insert(b"first")?;
    rm.commit()?;
    rm.close()?;
    let old = fs::read(&path)?;

    let rm = RecordManager::open(&path, config())?;
    rm.update(a, b"second")?;
    let b = rm.insert(&vec![5u8; 9000])?;
    rm.commit()?;
    rm.close()?;
    let new = fs::read(&path)?;

    // Crash after the log reached disk but before the store did
    fs::write(&path, &old)?;
    write_log(&path, blocks_of(&new))?;

    let rm = RecordManager::open(&path, config())?;
    assert_eq!(rm.fetch(a)?, b"second");
    assert_eq!(rm.fetch(b)?, vec![5u8; 9000]);
    rm.close()?;
    assert_eq!(fs::read(&path)?, new);
    assert_eq!(fs::metadata(TransactionLog::path_for(&path))?.len(), 0);

    // Replaying the same transaction again changes nothing
    write_log(&path, blocks_of(&new))?;
    let rm = RecordManager::open(&path, config())?;
    rm.close()?;
    assert_eq!(fs::read(&path)?, new);
    Ok(())
}

#[test]
fn test_discards_torn_log() -> Result<()> {
    let (rm, path, _dir) = create_store()?;
    let a = rm.insert(b"kept")?;
    rm.commit()?;
    rm.close()?;
    let old = fs::read(&path)?;

    let mut changed = old.clone();
    changed[BLOCK_SIZE..].iter_mut().for_each(|b| *b = 0xEE);
    write_log(&path, blocks_of(&changed))?;

    // Cut the commit marker off
    let log_path = TransactionLog::path_for(&path);
    let len = fs::metadata(&log_path)?.len();
    fs::OpenOptions::new()
        .write(true)
        .open(&log_path)?
        .set_len(len - 3)?;

    let rm = RecordManager::open(&path, config())?;
    assert_eq!(rm.fetch(a)?, b"kept");
    rm.close()?;
    assert_eq!(fs::read(&path)?, old);
    assert_eq!(fs::metadata(&log_path)?.len(), 0);
    Ok(())
}

#[test]
fn test_defrag_compacts_store() -> Result<()> {
    let (rm, path, _dir) = create_store()?;
    let mut recids = Vec::new();
    for i in 0..400u32 {
        recids.push(rm.insert(&vec![(i % 256) as u8; 500 + (i as usize % 7) * 300])?);
    }
    rm.commit()?;
    for recid in recids.iter().step_by(2) {
        rm.delete(*recid)?;
    }
    rm.set_root(3, recids[1].0)?;
    rm.commit()?;

    let summary = rm.defrag()?;
    assert_eq!(summary.records, 200);
    assert!(summary.blocks_after < summary.blocks_before);
    rm.close()?;

    let rm = RecordManager::open(&path, config())?;
    assert_eq!(rm.get_root(3)?, recids[1].0);
    for (i, recid) in recids.iter().enumerate().skip(1).step_by(2) {
        assert_eq!(rm.fetch(*recid)?, vec![(i % 256) as u8; 500 + (i % 7) * 300]);
    }
    assert!(rm.verify()?.is_ok());
    Ok(())
}

#[test]
fn test_btree_insert_delete_scenario() -> Result<()> {
    let (rm, path, _dir) = create_store()?;
    let tree: BTree<u32, String> = BTree::create(&rm, NaturalOrder)?;
    rm.set_named_object("numbers", Some(tree.recid()))?;

    for k in 1..=1000u32 {
        tree.insert(k, k.to_string(), false)?;
        if k % 100 == 0 {
            rm.commit()?;
        }
    }
    assert_eq!(tree.size()?, 1000);
    let keys = tree
        .browse()?
        .map(|entry| entry.map(|(k, _)| k))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(keys, (1..=1000).collect::<Vec<_>>());
    rm.close()?;

    let rm = RecordManager::open(&path, config())?;
    let recid = rm.named_object("numbers")?.expect("tree is registered");
    let tree: BTree<u32, String> = BTree::load(&rm, recid, NaturalOrder)?;
    assert_eq!(tree.find(&777)?, Some("777".to_string()));

    for k in 1..=1000u32 {
        assert_eq!(tree.remove(&k)?, Some(k.to_string()));
        if k % 100 == 0 {
            rm.commit()?;
        }
    }
    assert_eq!(tree.size()?, 0);
    assert_eq!(tree.height()?, 0);
    assert!(tree.browse()?.next().is_none());
    // Tree header and the name directory are all that is left
    assert_eq!(rm.stats()?.live_records, 2);
    assert!(rm.verify()?.is_ok());
    Ok(())
}

#[test]
fn test_store_split_across_files() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("split.db");
    let config = config().max_file_blocks(Some(8));
    let rm = RecordManager::create(&path, config.clone())?;
    let recids = (0..40u8)
        .map(|i| rm.insert(&vec![i; 2000]))
        .collect::<Result<Vec<_>, _>>()?;
    rm.commit()?;
    rm.close()?;
    assert!(dir.path().join("split.db.1").exists());
    assert!(fs::metadata(&path)?.len() <= 8 * BLOCK_SIZE as u64);

    let rm = RecordManager::open(&path, config)?;
    for (i, recid) in recids.iter().enumerate() {
        assert_eq!(rm.fetch(*recid)?, vec![i as u8; 2000]);
    }
    assert!(rm.verify()?.is_ok());
    Ok(())
}

#[test]
fn test_split_store_opens_with_default_config() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("split.db");
    let rm = RecordManager::create(&path, config().max_file_blocks(Some(8)))?;
    let recids = (0..40u8)
        .map(|i| rm.insert(&vec![i; 2000]))
        .collect::<Result<Vec<_>, _>>()?;
    rm.commit()?;
    rm.close()?;

    // Neither the block size nor the split is repeated by the caller
    let plain = StoreConfig::default().sync_on_commit(false);
    let rm = RecordManager::open(&path, plain.clone())?;
    assert_eq!(rm.block_size()?, BLOCK_SIZE);
    for (i, recid) in recids.iter().enumerate() {
        assert_eq!(rm.fetch(*recid)?, vec![i as u8; 2000]);
    }
    rm.update(recids[39], &vec![0xCD; 2000])?;
    rm.commit()?;
    for recid in &recids[..20] {
        rm.delete(*recid)?;
    }
    rm.commit()?;
    rm.defrag()?;
    rm.close()?;

    let rm = RecordManager::open(&path, plain)?;
    assert!(fs::metadata(&path)?.len() <= 8 * BLOCK_SIZE as u64);
    assert!(dir.path().join("split.db.1").exists());
    for (i, recid) in recids.iter().enumerate().take(39).skip(20) {
        assert_eq!(rm.fetch(*recid)?, vec![i as u8; 2000]);
    }
    assert_eq!(rm.fetch(recids[39])?, vec![0xCD; 2000]);
    assert!(rm.verify()?.is_ok());
    Ok(())
}

#[test]
fn test_transactionless_mode_recovers_leftover_log() -> Result<()> {
    let (rm, path, _dir) = create_store()?;
    let a = rm.insert(b"logged")?;
    rm.commit()?;
    rm.close()?;
    let old = fs::read(&path)?;

    let rm = RecordManager::open(&path, config())?;
    rm.update(a, b"replayed")?;
    rm.commit()?;
    rm.close()?;
    let new = fs::read(&path)?;
    fs::write(&path, &old)?;
    write_log(&path, blocks_of(&new))?;

    let plain = config().transactions_enabled(false);
    let rm = RecordManager::open(&path, plain.clone())?;
    assert!(!TransactionLog::path_for(&path).exists());
    assert_eq!(rm.fetch(a)?, b"replayed");

    let b = rm.insert(b"direct")?;
    rm.commit()?;
    rm.close()?;
    assert!(!TransactionLog::path_for(&path).exists());

    let rm = RecordManager::open(&path, plain)?;
    assert_eq!(rm.fetch(b)?, b"direct");
    Ok(())
}

#[test]
fn test_btree_readers_alongside_writer() -> Result<()> {
    let (rm, _path, _dir) = create_store()?;
    let tree: BTree<u32, u64> = BTree::create_with(
        &rm,
        NaturalOrder,
        BincodeSerializer::new(),
        BincodeSerializer::new(),
        8,
    )?;
    for k in 0..500u32 {
        tree.insert(k, k as u64 * 2, false)?;
    }
    rm.commit()?;

    let done = AtomicBool::new(false);
    thread::scope(|scope| -> Result<()> {
        let writer = scope.spawn(|| -> Result<()> {
            for k in 500..1500u32 {
                tree.insert(k, k as u64 * 2, false)?;
                if k % 100 == 99 {
                    rm.commit()?;
                }
            }
            done.store(true, Ordering::SeqCst);
            Ok(())
        });

        let readers: Vec<_> = (0..4u32)
            .map(|seed| {
                let (tree, rm, done) = (&tree, rm.clone(), &done);
                scope.spawn(move || -> Result<u32> {
                    let mut rng = StdRng::seed_from_u64(seed as u64);
                    let mut rounds = 0;
                    while !done.load(Ordering::SeqCst) || rounds < 5 {
                        let k = rng.gen_range(0..500u32);
                        assert_eq!(tree.find(&k)?, Some(k as u64 * 2));
                        let late = rng.gen_range(500..1500u32);
                        if let Some(value) = tree.find(&late)? {
                            assert_eq!(value, late as u64 * 2);
                        }

                        // Only inserts run, so a scan stays ordered even
                        // while leaves split underneath it
                        let mut last = None;
                        for entry in tree.browse()? {
                            let (key, value) = entry?;
                            assert_eq!(value, key as u64 * 2);
                            assert!(last < Some(key));
                            last = Some(key);
                        }
                        assert!(rm.stats()?.live_records > 0);
                        rounds += 1;
                    }
                    Ok(rounds)
                })
            })
            .collect();

        for reader in readers {
            let rounds = reader.join().expect("reader thread panicked")?;
            assert!(rounds >= 5);
        }
        writer.join().expect("writer thread panicked")?;
        Ok(())
    })?;

    rm.commit()?;
    assert_eq!(tree.size()?, 1500);
    let keys = tree
        .browse()?
        .map(|entry| entry.map(|(k, _)| k))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(keys, (0..1500).collect::<Vec<_>>());
    assert!(rm.verify()?.is_ok());
    Ok(())
}
