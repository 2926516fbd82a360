//! Offline-style maintenance on an open store: integrity check, space
//! statistics and defragmentation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use super::{Engine, RecordManager, StoreInner};
use crate::config::StoreConfig;
use crate::storage::alloc::list_blocks;
use crate::storage::buffer::TxnState;
use crate::storage::disk::{extension_path, replace_store_files};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::logical::{free_id_count, LogicalIds, Recid};
use crate::storage::page::{
    expect_type, BlockId, DataPage, FileHeader, IdPage, Location, PageHeader, PageType, SlotPage,
    SlotStatus, TranslationPage, ROOT_SLOTS,
};
use crate::storage::physical::{self, PhysicalRecords};

/// Records copied between intermediate commits while defragmenting.
const DEFRAG_BATCH: usize = 1000;

/// Result of [`RecordManager::verify`]. An empty problem list means the
/// store is consistent.
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub problems: Vec<String>,
    pub pages_checked: u64,
    pub records_checked: usize,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }

    fn problem(&mut self, message: String) {
        debug!("verify: {}", message);
        self.problems.push(message);
    }
}

/// Page and record counts of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub block_size: usize,
    pub total_blocks: u64,
    pub free_pages: usize,
    pub data_pages: usize,
    pub translation_pages: usize,
    pub free_id_pages: usize,
    pub free_slot_pages: usize,
    pub live_records: usize,
    pub free_slots: usize,
    pub free_ids: usize,
    pub high_water: u64,
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block size:        {}", self.block_size)?;
        writeln!(f, "total blocks:      {}", self.total_blocks)?;
        writeln!(f, "data pages:        {}", self.data_pages)?;
        writeln!(f, "translation pages: {}", self.translation_pages)?;
        writeln!(f, "free-id pages:     {}", self.free_id_pages)?;
        writeln!(f, "free-slot pages:   {}", self.free_slot_pages)?;
        writeln!(f, "free pages:        {}", self.free_pages)?;
        writeln!(f, "live records:      {}", self.live_records)?;
        writeln!(f, "free slots:        {}", self.free_slots)?;
        writeln!(f, "free ids:          {}", self.free_ids)?;
        write!(f, "id high-water:     {}", self.high_water)
    }
}

/// Outcome of a defragmentation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefragSummary {
    pub records: usize,
    pub blocks_before: u64,
    pub blocks_after: u64,
}

impl RecordManager {
    /// Check every structural rule of the store and report what is broken.
    /// Only I/O failures are returned as errors.
    pub fn verify(&self) -> StorageResult<VerifyReport> {
        self.read(|engine| engine.verify())
    }

    pub fn stats(&self) -> StorageResult<StoreStats> {
        self.read(|engine| engine.stats())
    }

    /// Rewrite the store compactly. Every record keeps its id. Requires an
    /// idle transaction.
    pub fn defrag(&self) -> StorageResult<DefragSummary> {
        let mut inner = self.inner.write();
        let result = defrag_store(&mut inner);
        inner.observe(result)
    }
}

/// Slot facts gathered from the data pages.
#[derive(Default)]
struct SlotMap {
    heads: HashSet<Location>,
    continuations: HashSet<Location>,
    free: HashMap<Location, u16>,
    next: HashMap<Location, Location>,
}

impl Engine {
    pub(super) fn verify(&self) -> StorageResult<VerifyReport> {
        let mut report = VerifyReport::default();
        let header = self.buf.header()?;
        if let Err(e) = header.validate(self.classes.len()) {
            report.problem(e.to_string());
            return Ok(report);
        }
        let num_blocks = self.buf.num_blocks();

        // Page lists: every non-header block on exactly one list of its type
        let mut owner: HashMap<BlockId, PageType> = HashMap::new();
        let mut lists: HashMap<PageType, Vec<BlockId>> = HashMap::new();
        for page_type in PageType::LISTED {
            let mut blocks = Vec::new();
            let mut prev = BlockId::NONE;
            let mut current = header.list_head(page_type);
            let mut complete = true;
            while !current.is_none() {
                if current.0 >= num_blocks {
                    report.problem(format!(
                        "{} list links to block {} past the end of the store",
                        page_type, current
                    ));
                    complete = false;
                    break;
                }
                if let Some(other) = owner.get(&current) {
                    report.problem(format!(
                        "block {} is reached from the {} list but already belongs to the {} list",
                        current, page_type, other
                    ));
                    complete = false;
                    break;
                }
                let data = self.buf.read(current)?;
                if data.page_type() != Some(page_type) {
                    report.problem(format!(
                        "block {} on the {} list has type tag {}",
                        current,
                        page_type,
                        data.page_type_tag()
                    ));
                }
                if data.prev() != prev {
                    report.problem(format!(
                        "block {} links back to {} instead of {}",
                        current,
                        data.prev(),
                        prev
                    ));
                }
                owner.insert(current, page_type);
                blocks.push(current);
                prev = current;
                current = data.next();
            }
            if complete && header.list_tail(page_type) != prev {
                report.problem(format!(
                    "{} list tail is {} but the list ends at {}",
                    page_type,
                    header.list_tail(page_type),
                    prev
                ));
            }
            lists.insert(page_type, blocks);
        }
        for block in (1..num_blocks).map(BlockId) {
            if !owner.contains_key(&block) {
                report.problem(format!("block {} is on no page list", block));
            }
        }
        report.pages_checked = owner.len() as u64;

        let slots = self.scan_data_pages(lists.get(&PageType::Data), &mut report)?;
        self.check_registry(&header, &owner, &slots, &mut report)?;
        let live = self.check_translations(&slots, header.high_water(), &mut report)?;
        self.check_free_ids(
            lists.get(&PageType::FreeLogicalIds),
            &live,
            header.high_water(),
            &mut report,
        )?;
        Ok(report)
    }

    fn scan_data_pages(
        &self,
        blocks: Option<&Vec<BlockId>>,
        report: &mut VerifyReport,
    ) -> StorageResult<SlotMap> {
        let mut slots = SlotMap::default();
        for &block in blocks.into_iter().flatten() {
            let data = self.buf.read(block)?;
            let page = DataPage::from_data(&*data);
            let offsets = match page.slot_offsets(block) {
                Ok(offsets) => offsets,
                Err(e) => {
                    report.problem(e.to_string());
                    continue;
                }
            };

            let mut live = 0usize;
            for offset in offsets {
                let location = Location::new(block, offset as u16);
                let record = match page.record_header(block, offset) {
                    Ok(record) => record,
                    Err(e) => {
                        report.problem(e.to_string());
                        continue;
                    }
                };
                if self.classes.index_of(record.available as usize).is_none() {
                    report.problem(format!(
                        "slot {} has capacity {} which is not a size class",
                        location, record.available
                    ));
                }
                match record.status {
                    SlotStatus::Free => {
                        slots.free.insert(location, record.available);
                    }
                    SlotStatus::Head => {
                        live += 1;
                        slots.heads.insert(location);
                        slots.next.insert(location, record.next);
                    }
                    SlotStatus::Continuation => {
                        live += 1;
                        slots.continuations.insert(location);
                        slots.next.insert(location, record.next);
                    }
                }
            }
            if live != page.live_count() as usize {
                report.problem(format!(
                    "data page {} counts {} live slots but holds {}",
                    block,
                    page.live_count(),
                    live
                ));
            }
        }
        Ok(slots)
    }

    fn check_registry<B: AsRef<[u8]>>(
        &self,
        header: &FileHeader<B>,
        owner: &HashMap<BlockId, PageType>,
        slots: &SlotMap,
        report: &mut VerifyReport,
    ) -> StorageResult<()> {
        let mut seen = HashSet::new();
        for class_index in 0..self.classes.len() {
            let class_size = self.classes.size(class_index);
            let mut visited = HashSet::new();
            let mut current = header.class_head(class_index);
            while !current.is_none() {
                if !visited.insert(current) {
                    report.problem(format!(
                        "free-slot chain of class {} loops at block {}",
                        class_index, current
                    ));
                    break;
                }
                if owner.get(&current) != Some(&PageType::FreeSlots) {
                    report.problem(format!(
                        "free-slot chain of class {} reaches block {} which is not a free-slot page",
                        class_index, current
                    ));
                    break;
                }
                let data = self.buf.read(current)?;
                let page = SlotPage::from_data(&*data);
                if page.class_index() != class_index {
                    report.problem(format!(
                        "free-slot page {} claims class {} on the chain of class {}",
                        current,
                        page.class_index(),
                        class_index
                    ));
                }
                for location in page.entries() {
                    if !seen.insert(location) {
                        report.problem(format!("free slot {} is registered twice", location));
                        continue;
                    }
                    match slots.free.get(&location) {
                        None => report.problem(format!(
                            "registered slot {} is not a free slot on a data page",
                            location
                        )),
                        Some(&available) if available as usize != class_size => {
                            report.problem(format!(
                                "registered slot {} holds {} bytes but sits in class {} ({} bytes)",
                                location, available, class_index, class_size
                            ))
                        }
                        Some(_) => {}
                    }
                }
                current = page.next_in_class();
            }
        }
        Ok(())
    }

    /// Check that every bound id leads to an intact record chain. Returns
    /// the bound ids.
    fn check_translations(
        &self,
        slots: &SlotMap,
        high_water: u64,
        report: &mut VerifyReport,
    ) -> StorageResult<HashSet<u64>> {
        let mut live = HashSet::new();
        let mut claimed_heads = HashSet::new();
        let mut reached = HashSet::new();

        for (ordinal, &block) in self.map.pages().iter().enumerate() {
            let data = self.buf.read(block)?;
            if let Err(e) = expect_type(block, &data, PageType::Translation) {
                report.problem(e.to_string());
                continue;
            }
            for (slot, location) in TranslationPage::from_data(&*data).used_slots() {
                let recid = self.map.recid(ordinal, slot);
                live.insert(recid.0);
                if recid.0 > high_water {
                    report.problem(format!(
                        "{} is bound but above the high-water mark {}",
                        recid, high_water
                    ));
                }
                if !slots.heads.contains(&location) {
                    report.problem(format!(
                        "{} points at {} which is not a record head",
                        recid, location
                    ));
                    continue;
                }
                if !claimed_heads.insert(location) {
                    report.problem(format!("{} shares record head {}", recid, location));
                    continue;
                }
                report.records_checked += 1;

                let mut current = location;
                let mut chain = HashSet::new();
                chain.insert(current);
                while let Some(&next) = slots.next.get(&current) {
                    if next.is_none() {
                        break;
                    }
                    if !slots.continuations.contains(&next) {
                        report.problem(format!(
                            "record {} continues at {} which is not a continuation slot",
                            recid, next
                        ));
                        break;
                    }
                    if !chain.insert(next) || !reached.insert(next) {
                        report.problem(format!(
                            "record {} reaches continuation {} more than once",
                            recid, next
                        ));
                        break;
                    }
                    current = next;
                }
            }
        }

        for head in slots.heads.difference(&claimed_heads) {
            report.problem(format!("record head {} has no id", head));
        }
        for continuation in slots.continuations.difference(&reached) {
            report.problem(format!(
                "continuation slot {} belongs to no record",
                continuation
            ));
        }
        Ok(live)
    }

    fn check_free_ids(
        &self,
        blocks: Option<&Vec<BlockId>>,
        live: &HashSet<u64>,
        high_water: u64,
        report: &mut VerifyReport,
    ) -> StorageResult<()> {
        let mut seen = HashSet::new();
        for &block in blocks.into_iter().flatten() {
            let data = self.buf.read(block)?;
            let page = IdPage::from_data(&*data);
            if page.count() > IdPage::<&[u8]>::capacity(data.len()) {
                report.problem(format!(
                    "free-id page {} claims {} entries",
                    block,
                    page.count()
                ));
                continue;
            }
            for index in 0..page.count() {
                let id = page.get(index);
                if id == 0 || id > high_water {
                    report.problem(format!(
                        "free id {} on page {} was never handed out",
                        id, block
                    ));
                } else if live.contains(&id) {
                    report.problem(format!("free id {} is still bound", id));
                } else if !seen.insert(id) {
                    report.problem(format!("free id {} is queued twice", id));
                }
            }
        }
        Ok(())
    }

    pub(super) fn stats(&self) -> StorageResult<StoreStats> {
        let header = self.buf.header()?;
        let mut stats = StoreStats {
            block_size: self.buf.block_size(),
            total_blocks: self.buf.num_blocks(),
            high_water: header.high_water(),
            ..StoreStats::default()
        };
        for page_type in PageType::LISTED {
            let blocks = list_blocks(&self.buf, page_type)?;
            let count = blocks.len();
            match page_type {
                PageType::Free => stats.free_pages = count,
                PageType::Data => stats.data_pages = count,
                PageType::Translation => stats.translation_pages = count,
                PageType::FreeLogicalIds => stats.free_id_pages = count,
                PageType::FreeSlots => stats.free_slot_pages = count,
                PageType::Header => {}
            }
        }
        for &block in self.map.pages() {
            let data = self.buf.read(block)?;
            stats.live_records += TranslationPage::from_data(&*data).used_slots().count();
        }
        stats.free_slots = physical::registered_slots(&self.buf)?.len();
        stats.free_ids = free_id_count(&self.buf)?;
        Ok(stats)
    }

    /// Copy every live record into a fresh store at `target_path`, keeping
    /// ids, roots and the named-object directory. Returns the record count.
    fn copy_to(&self, target_path: &Path) -> StorageResult<usize> {
        let target_config = StoreConfig::default()
            .block_size(self.buf.block_size())
            .transactions_enabled(false)
            .sync_on_commit(true)
            .max_file_blocks(self.buf.header()?.max_file_blocks());
        let mut target = Engine::create(target_path, &target_config)?;
        LogicalIds::new(&mut target.buf, &mut target.map).reserve_pages(self.map.pages().len())?;

        let mut live = HashSet::new();
        for (ordinal, &block) in self.map.pages().iter().enumerate() {
            let entries: Vec<(usize, Location)> = {
                let data = self.buf.read(block)?;
                expect_type(block, &data, PageType::Translation)?;
                TranslationPage::from_data(&*data).used_slots().collect()
            };
            for (slot, location) in entries {
                let recid = self.map.recid(ordinal, slot);
                let payload = physical::fetch(&self.buf, location)?;
                let moved = PhysicalRecords::new(&mut target.buf, &target.classes).insert(&payload)?;
                LogicalIds::new(&mut target.buf, &mut target.map).bind(recid, moved)?;
                live.insert(recid.0);
                if live.len() % DEFRAG_BATCH == 0 {
                    target.buf.commit()?;
                }
            }
        }

        let high_water = {
            let header = self.buf.header()?;
            let mut target_header = target.buf.header_mut()?;
            for slot in 0..ROOT_SLOTS {
                target_header.set_root(slot, header.root(slot));
            }
            target_header.set_name_directory(header.name_directory());
            target_header.set_high_water(header.high_water());
            header.high_water()
        };

        // Released in descending order so the lowest id is reused first
        {
            let mut ids = LogicalIds::new(&mut target.buf, &mut target.map);
            for id in (1..=high_water).rev() {
                if !live.contains(&id) {
                    ids.release(Recid(id))?;
                }
            }
        }
        target.buf.commit()?;
        Ok(live.len())
    }
}

fn defrag_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".defrag");
    PathBuf::from(name)
}

fn remove_store_files(path: &Path) -> StorageResult<()> {
    let mut index = 0;
    loop {
        let file = extension_path(path, index);
        if !file.exists() {
            return Ok(());
        }
        fs::remove_file(&file)?;
        index += 1;
    }
}

fn defrag_store(inner: &mut StoreInner) -> StorageResult<DefragSummary> {
    let path = inner.path.clone();
    let config = inner.config.clone();
    let engine = inner.engine_mut()?;
    if engine.buf.state() != TxnState::Idle {
        return Err(StorageError::InvalidArgument(
            "commit or roll back before defragmenting".to_string(),
        ));
    }

    let blocks_before = engine.buf.num_blocks();
    let temp_path = defrag_path(&path);
    remove_store_files(&temp_path)?;
    let records = match engine.copy_to(&temp_path) {
        Ok(records) => records,
        Err(e) => {
            // The original store is untouched; only the partial copy goes
            remove_store_files(&temp_path)?;
            return Err(e);
        }
    };

    inner.engine = None;
    let replaced = replace_store_files(&temp_path, &path);
    let engine = Engine::open(&path, &config)?;
    replaced?;

    let summary = DefragSummary {
        records,
        blocks_before,
        blocks_after: engine.buf.num_blocks(),
    };
    inner.engine = Some(engine);
    info!(
        "defragmented {}: {} records, {} -> {} blocks",
        path.display(),
        summary.records,
        summary.blocks_before,
        summary.blocks_after
    );
    Ok(summary)
}
