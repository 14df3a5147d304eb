//! Mounted filesystem instance.
//!
//! [`Pmfs`] owns the region and every engine working on it. Format lays
//! out an empty filesystem; mount recovers one after a crash:
//!
//! ```text
//! superblock ─▶ journal undo ─▶ inode check ─▶ log scan ─▶ allocator
//!  (fallback     (abort on       (torn → replica,  (extent maps,   (live set
//!   to copy)      bad csum)       orphans evicted)  entry states)   reserved)
//! ```
//!
//! Blocks referenced only by entries past a published tail are never
//! reserved, so a crash mid-write leaks nothing across a remount.

use core::hash::{Hash, Hasher};
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::sync::Arc;

use spin::{Mutex, RwLock};

use crate::alloc::{BlockAllocator, FreeListAllocator};
use crate::core::config::{MountFlags, PmfsConfig};
use crate::core::error::{PmfsError, PmfsResult};
use crate::core::stats::{PmfsStats, PmfsStatsSnapshot};
use crate::core::types::{BlockNr, InodeNr, PmOffset, NULL_OFFSET, ROOT_INO};
use crate::filelog::{log_pages, set_entry_state, ExtentMap, LogWalker};
use crate::inode::{now_secs, FileInode, InodeFlags, InodeTable, PmInode, SlotState, PI_CSUM_WORD_OFFSET, PI_PARENT_OFFSET};
use crate::integrity::IntegrityEngine;
use crate::journal::{JournalTarget, LiteJournal};
use crate::pmem::{Layout, PmemRegion, Superblock};

/// A formatted or mounted HelixPMFS instance.
pub struct Pmfs {
    pub(crate) region: Arc<PmemRegion>,
    pub(crate) layout: Layout,
    pub(crate) config: PmfsConfig,
    pub(crate) stats: Arc<PmfsStats>,
    pub(crate) alloc: FreeListAllocator,
    pub(crate) integrity: IntegrityEngine,
    pub(crate) journal: LiteJournal,
    pub(crate) inodes: InodeTable,
    /// Open inodes
    files: RwLock<BTreeMap<InodeNr, Arc<FileInode>>>,
    /// Serializes inode slot allocation
    ino_lock: Mutex<()>,
    trans_id: AtomicU64,
}

impl core::fmt::Debug for Pmfs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pmfs")
            .field("layout", &self.layout)
            .field("flags", &self.config.flags)
            .field("open_inodes", &self.files.read().len())
            .finish()
    }
}

// ============================================================================
// Format and mount
// ============================================================================

impl Pmfs {
    fn assemble(region: Arc<PmemRegion>, layout: Layout, config: PmfsConfig) -> PmfsResult<Self> {
        let stats = Arc::new(PmfsStats::new());
        let alloc = FreeListAllocator::new(region.clone(), &layout, config.max_alloc_extent)?;
        let integrity = IntegrityEngine::new(region.clone(), layout, config.flags, stats.clone());
        let journal = LiteJournal::new(region.clone(), layout, stats.clone());
        let inodes = InodeTable::new(region.clone(), layout);

        Ok(Self {
            region,
            layout,
            config,
            stats,
            alloc,
            integrity,
            journal,
            inodes,
            files: RwLock::new(BTreeMap::new()),
            ino_lock: Mutex::new(()),
            trans_id: AtomicU64::new(1),
        })
    }

    /// Lay out an empty filesystem holding only the root directory.
    pub fn format(region: Arc<PmemRegion>, config: PmfsConfig) -> PmfsResult<Self> {
        config.validate()?;
        let sb = Superblock::new(&config, region.total_blocks());
        let layout = sb.layout()?;
        region.set_write_protect(config.has(MountFlags::WPROTECT));

        // Superblock, journal, inode tables and integrity metadata.
        let meta_len = (layout.data_start as usize) * crate::BLOCK_SIZE;
        {
            let w = region.unlock(0, meta_len)?;
            w.fill(0, meta_len, 0)?;
            w.persist(0, meta_len);
        }

        let fs = Self::assemble(region, layout, config)?;
        fs.journal.hard_init()?;

        let root = PmInode::new(ROOT_INO, ROOT_INO, InodeFlags::DIR);
        fs.inodes.store_full(ROOT_INO, &root, false)?;
        fs.inodes.store_full(ROOT_INO, &root, true)?;
        fs.files
            .write()
            .insert(ROOT_INO, Arc::new(FileInode::new(ROOT_INO, 0, ExtentMap::new())));

        // A region without a valid superblock never mounts.
        sb.store(&fs.region)?;
        log::info!(
            "pmfs: formatted {} blocks, {} data blocks from {}, {} inodes, {} cpus",
            layout.total_blocks,
            layout.data_blocks(),
            layout.data_start,
            layout.inode_count,
            layout.cpus
        );
        Ok(fs)
    }

    /// Mount an existing filesystem, recovering from any crash.
    ///
    /// Geometry comes from the superblock; `config` supplies the runtime
    /// flags and the allocation cap.
    pub fn mount(region: Arc<PmemRegion>, config: PmfsConfig) -> PmfsResult<Self> {
        let sb = Superblock::load(&region)?;
        if sb.total_blocks > region.total_blocks() {
            log::error!(
                "pmfs: superblock claims {} blocks, region has {}",
                sb.total_blocks,
                region.total_blocks()
            );
            return Err(PmfsError::InvalidArgument);
        }
        let layout = sb.layout()?;
        let config = PmfsConfig {
            cpus: sb.cpus,
            inode_count: sb.inode_count,
            stripe_shift: sb.stripe_shift,
            ..config
        };
        config.validate()?;
        region.set_write_protect(config.has(MountFlags::WPROTECT));

        let fs = Self::assemble(region, layout, config)?;
        let replayed = fs.journal.recover()?;
        fs.rebuild_inodes()?;

        log::info!(
            "pmfs: mounted, {} journal entries rolled back, {} inodes, {} free blocks",
            replayed,
            fs.files.read().len(),
            fs.alloc.free_count()
        );
        Ok(fs)
    }

    /// Check every inode slot and rebuild the DRAM state of live inodes.
    fn rebuild_inodes(&self) -> PmfsResult<()> {
        let mut files = BTreeMap::new();
        let mut max_trans = 0u64;

        for ino in ROOT_INO..self.inodes.count() {
            let Some(pi) = self.check_inode_slot(ino)? else {
                continue;
            };
            if !pi.valid {
                continue;
            }
            if pi.links_count == 0 {
                log::warn!("mount: evicting orphan inode {}", ino);
                self.clear_inode_record(ino)?;
                continue;
            }
            let (file, trans) = self.rebuild_log(ino, &pi)?;
            max_trans = max_trans.max(trans);
            files.insert(ino, Arc::new(file));
        }

        if !files.contains_key(&ROOT_INO) {
            log::error!("mount: root inode missing");
            return Err(PmfsError::CorruptedInode);
        }
        *self.files.write() = files;
        self.trans_id.store(max_trans + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Reconcile the primary and replica records of one slot.
    fn check_inode_slot(&self, ino: InodeNr) -> PmfsResult<Option<PmInode>> {
        let primary = self.inodes.read_raw(ino, false)?;
        let replica = self.inodes.read_raw(ino, true)?;

        match (SlotState::of(&primary), SlotState::of(&replica)) {
            (SlotState::Empty, SlotState::Empty) => Ok(None),
            (SlotState::Empty, _) => {
                self.inodes.update_alter_inode(ino)?;
                Ok(None)
            }
            (SlotState::Valid(pi), _) => {
                if primary != replica {
                    log::debug!("mount: inode {} replica resynced", ino);
                    self.inodes.update_alter_inode(ino)?;
                }
                Ok(Some(pi))
            }
            (SlotState::Torn, SlotState::Valid(_)) => {
                log::warn!("mount: inode {} torn, restored from replica", ino);
                self.inodes.restore_from_replica(ino)?;
                let raw = self.inodes.read_raw(ino, false)?;
                Ok(Some(PmInode::from_bytes(&raw)))
            }
            (SlotState::Torn, _) => {
                log::error!("mount: inode {} and its replica are both invalid", ino);
                Err(PmfsError::CorruptedInode)
            }
        }
    }

    /// Replay one inode log into a fresh extent map.
    ///
    /// Reserves the log pages and every live extent, rewrites entry states
    /// that disagree with the replay and repairs size and block count.
    /// Returns the DRAM inode and the highest transaction id seen.
    fn rebuild_log(&self, ino: InodeNr, pi: &PmInode) -> PmfsResult<(FileInode, u64)> {
        let mut tree = ExtentMap::new();
        let head = pi.log_head;
        let mut tail = pi.log_tail;

        if head == NULL_OFFSET {
            if tail != NULL_OFFSET {
                log::error!("mount: inode {} has a tail {:#x} but no log", ino, tail);
                return Err(PmfsError::CorruptedLog);
            }
            return Ok((FileInode::new(ino, pi.size, tree), 0));
        }

        for blk in log_pages(&self.region, &self.layout, head)? {
            self.reserve_or_corrupt(ino, blk, 1)?;
        }
        if tail == NULL_OFFSET {
            log::warn!("mount: inode {} log tail lost, log reset to empty", ino);
            self.inodes.init_log(ino, head)?;
            tail = head;
        }

        let mut walked = Vec::new();
        let mut states: BTreeMap<PmOffset, (u32, bool)> = BTreeMap::new();
        let mut max_trans = 0u64;
        for item in LogWalker::new(&self.region, head, tail) {
            let (slot, e) = item?;
            let out = if e.is_truncate() {
                tree.truncate_from(e.pgoff)
            } else {
                if e.block % crate::BLOCK_SIZE as u64 != 0
                    || !self.layout.is_data_range(e.blocknr(), e.num_pages as u64)
                {
                    log::error!("mount: inode {} entry {:#x} maps outside the data region", ino, slot);
                    return Err(PmfsError::CorruptedLog);
                }
                tree.assign(slot, &e)
            };
            for u in out.updates {
                states.insert(u.entry, (u.invalid_pages, u.reassigned));
            }
            max_trans = max_trans.max(e.trans_id);
            walked.push((slot, e));
        }

        let mut fixed = 0usize;
        for (slot, e) in &walked {
            let (invalid, reassigned) = states.get(slot).copied().unwrap_or((0, false));
            if e.invalid_pages != invalid || (e.reassigned != 0) != reassigned {
                set_entry_state(&self.region, *slot, invalid, reassigned)?;
                fixed += 1;
            }
        }
        for m in tree.iter() {
            self.reserve_or_corrupt(ino, m.block, m.num_pages)?;
        }

        let size = walked.last().map_or(0, |(_, e)| e.size);
        let blocks = tree.live_pages();
        if size != pi.size || blocks != pi.blocks {
            log::debug!(
                "mount: inode {} size {} -> {}, blocks {} -> {}",
                ino,
                pi.size,
                size,
                pi.blocks,
                blocks
            );
            self.inodes.update(ino, |p| {
                p.size = size;
                p.blocks = blocks;
            })?;
            self.sync_replica(ino);
        }
        log::trace!(
            "mount: inode {} replayed {} entries, {} states rewritten",
            ino,
            walked.len(),
            fixed
        );

        Ok((FileInode::new(ino, size, tree), max_trans))
    }

    fn reserve_or_corrupt(&self, ino: InodeNr, start: BlockNr, count: u64) -> PmfsResult<()> {
        self.alloc.reserve(start, count).map_err(|e| {
            log::error!("mount: inode {} blocks {}+{} not reservable: {}", ino, start, count, e);
            PmfsError::CorruptedLog
        })
    }

    /// Store an unused record in both tables.
    fn clear_inode_record(&self, ino: InodeNr) -> PmfsResult<()> {
        let dead = PmInode {
            ino,
            ..Default::default()
        };
        self.inodes.store_full(ino, &dead, false)?;
        self.inodes.store_full(ino, &dead, true)
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl Pmfs {
    pub(crate) fn file(&self, ino: InodeNr) -> PmfsResult<Arc<FileInode>> {
        self.inodes.check_ino(ino)?;
        self.files.read().get(&ino).cloned().ok_or(PmfsError::NotFound)
    }

    /// Current size of a file
    pub fn file_size(&self, ino: InodeNr) -> PmfsResult<u64> {
        Ok(self.file(ino)?.size())
    }

    /// Persistent record of an inode
    pub fn inode(&self, ino: InodeNr) -> PmfsResult<PmInode> {
        self.inodes.load(ino)
    }

    /// CPU slot of the calling thread.
    pub(crate) fn current_cpu(&self) -> usize {
        let mut h = DefaultHasher::new();
        std::thread::current().id().hash(&mut h);
        (h.finish() % self.layout.cpus as u64) as usize
    }

    pub(crate) fn next_trans_id(&self) -> u64 {
        self.trans_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Bring the replica record in line with the primary.
    pub(crate) fn sync_replica(&self, ino: InodeNr) {
        if !self.config.has(MountFlags::REPLICA_INODE) {
            return;
        }
        if let Err(e) = self.inodes.update_alter_inode(ino) {
            log::warn!("inode {}: replica not updated: {}", ino, e);
        }
    }

    /// Block allocator
    pub fn allocator(&self) -> &FreeListAllocator {
        &self.alloc
    }

    /// Backing region
    pub fn region(&self) -> &PmemRegion {
        &self.region
    }

    /// Region layout
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Effective configuration
    pub fn config(&self) -> &PmfsConfig {
        &self.config
    }

    /// Lite journal
    pub fn journal(&self) -> &LiteJournal {
        &self.journal
    }

    /// Counter snapshot
    pub fn stats(&self) -> PmfsStatsSnapshot {
        self.stats.snapshot()
    }

    /// Free data blocks
    pub fn free_blocks(&self) -> u64 {
        self.alloc.free_count()
    }

    /// Byte image of the region as a crash would leave it.
    pub fn crash_image(&self) -> Vec<u8> {
        self.region.snapshot()
    }

    /// Verify the whole-block checksum of a data block.
    pub fn verify_block(&self, blocknr: BlockNr) -> PmfsResult<bool> {
        self.integrity.verify_block(blocknr)
    }

    /// Rebuild stripe `bad` of a data block from parity.
    pub fn reconstruct_stripe(&self, blocknr: BlockNr, bad: usize) -> PmfsResult<()> {
        self.integrity.reconstruct_stripe(blocknr, bad)
    }
}

// ============================================================================
// Journaled inode operations
// ============================================================================

impl Pmfs {
    /// Run `f` inside a lite journal transaction on `cpu`.
    ///
    /// Replicas of `inos` are synced first since they are the undo source
    /// for inode targets, and again after commit. A failing `f` is rolled
    /// back before its error is returned.
    fn journaled<T, F>(&self, cpu: usize, targets: &[JournalTarget], inos: &[InodeNr], f: F) -> PmfsResult<T>
    where
        F: FnOnce() -> PmfsResult<T>,
    {
        for &ino in inos {
            self.inodes.update_alter_inode(ino)?;
        }

        let mut guard = self.journal.lock(cpu);
        let tail = guard.create_transaction(targets)?;
        let value = match f() {
            Ok(v) => v,
            Err(e) => {
                if let Err(err) = guard.abort_transaction(tail) {
                    log::error!("journal: cpu {} abort failed: {}", guard.cpu(), err);
                }
                return Err(e);
            }
        };
        guard.commit_transaction(tail)?;
        drop(guard);

        for &ino in inos {
            if let Err(e) = self.inodes.update_alter_inode(ino) {
                log::warn!("inode {}: replica not updated after commit: {}", ino, e);
            }
        }
        Ok(value)
    }

    /// Open inodes for `inos`, sorted and deduplicated for lock ordering.
    fn files_ordered(&self, inos: &[InodeNr]) -> PmfsResult<Vec<Arc<FileInode>>> {
        let mut sorted = inos.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        sorted.into_iter().map(|ino| self.file(ino)).collect()
    }

    fn check_dir(&self, ino: InodeNr) -> PmfsResult<PmInode> {
        let pi = self.inodes.load(ino)?;
        if !pi.is_dir() {
            return Err(PmfsError::InvalidArgument);
        }
        Ok(pi)
    }

    /// Create an inode under directory `parent`.
    pub fn create_inode(&self, parent: InodeNr, flags: InodeFlags) -> PmfsResult<InodeNr> {
        let _slots = self.ino_lock.lock();
        let dir = self.file(parent)?;
        let _dir_guard = dir.lock.lock();
        self.check_dir(parent)?;

        let ino = {
            let files = self.files.read();
            (ROOT_INO + 1..self.inodes.count())
                .find(|ino| {
                    !files.contains_key(ino)
                        && self
                            .inodes
                            .read_raw(*ino, false)
                            .map(|raw| match SlotState::of(&raw) {
                                SlotState::Empty => true,
                                SlotState::Valid(pi) => !pi.valid,
                                SlotState::Torn => false,
                            })
                            .unwrap_or(false)
                })
                .ok_or(PmfsError::NoInodes)?
        };

        let cpu = self.current_cpu();
        let targets = [JournalTarget::Inode(parent), JournalTarget::Inode(ino)];
        self.journaled(cpu, &targets, &[parent, ino], || {
            let pi = PmInode::new(ino, parent, flags);
            self.inodes.store_full(ino, &pi, false)?;
            self.inodes.update(parent, |p| {
                p.mtime = pi.mtime;
                p.ctime = pi.ctime;
                if pi.is_dir() {
                    p.links_count += 1;
                }
            })?;
            Ok(())
        })?;

        self.files
            .write()
            .insert(ino, Arc::new(FileInode::new(ino, 0, ExtentMap::new())));
        log::debug!("pmfs: created inode {} under {}", ino, parent);
        Ok(ino)
    }

    /// Add a hard link to `ino` from directory `dir`.
    pub fn link(&self, cpu: usize, dir: InodeNr, ino: InodeNr) -> PmfsResult<()> {
        let files = self.files_ordered(&[dir, ino])?;
        let _guards: Vec<_> = files.iter().map(|f| f.lock.lock()).collect();
        self.check_dir(dir)?;
        let pi = self.inodes.load(ino)?;
        if pi.is_dir() {
            return Err(PmfsError::InvalidArgument);
        }
        let links = pi.links_count.checked_add(1).ok_or(PmfsError::InvalidArgument)?;

        let targets = [JournalTarget::Inode(dir), JournalTarget::Inode(ino)];
        self.journaled(cpu, &targets, &[dir, ino], || {
            let now = now_secs();
            self.inodes.update(ino, |p| {
                p.links_count = links;
                p.ctime = now;
            })?;
            self.inodes.update(dir, |p| {
                p.mtime = now;
                p.ctime = now;
            })?;
            Ok(())
        })
    }

    /// Drop the link to `ino` from directory `dir`, evicting the inode
    /// when it was the last one.
    pub fn unlink(&self, cpu: usize, dir: InodeNr, ino: InodeNr) -> PmfsResult<()> {
        if ino == ROOT_INO {
            return Err(PmfsError::InvalidArgument);
        }
        let files = self.files_ordered(&[dir, ino])?;
        let _guards: Vec<_> = files.iter().map(|f| f.lock.lock()).collect();
        self.check_dir(dir)?;

        let targets = [JournalTarget::Inode(dir), JournalTarget::Inode(ino)];
        let links = self.journaled(cpu, &targets, &[dir, ino], || {
            let now = now_secs();
            let pi = self.inodes.update(ino, |p| {
                p.links_count = p.links_count.saturating_sub(1);
                p.ctime = now;
            })?;
            self.inodes.update(dir, |p| {
                p.mtime = now;
                p.ctime = now;
                if pi.is_dir() {
                    p.links_count = p.links_count.saturating_sub(1);
                }
            })?;
            Ok(pi.links_count)
        })?;

        if links == 0 {
            self.evict_inode(ino)?;
        }
        Ok(())
    }

    /// Move `ino` from `old_dir` to `new_dir`, dropping the link of
    /// `victim` if the move replaces it.
    ///
    /// The parent number is patched in place, so the inode is journaled as
    /// two raw fields rather than a whole record.
    pub fn rename(
        &self,
        cpu: usize,
        ino: InodeNr,
        old_dir: InodeNr,
        new_dir: InodeNr,
        victim: Option<InodeNr>,
    ) -> PmfsResult<()> {
        if ino == ROOT_INO || victim == Some(ino) || victim == Some(ROOT_INO) {
            return Err(PmfsError::InvalidArgument);
        }
        let mut involved = vec![ino, old_dir, new_dir];
        involved.extend(victim);
        let files = self.files_ordered(&involved)?;
        let _guards: Vec<_> = files.iter().map(|f| f.lock.lock()).collect();

        self.check_dir(old_dir)?;
        self.check_dir(new_dir)?;
        let pi = self.inodes.load(ino)?;
        if pi.parent_ino != old_dir {
            return Err(PmfsError::InvalidArgument);
        }

        let base = self.inodes.addr(ino, false);
        let mut targets = vec![
            JournalTarget::Inode(old_dir),
            JournalTarget::Field(base + PI_PARENT_OFFSET),
            JournalTarget::Field(base + PI_CSUM_WORD_OFFSET),
        ];
        if new_dir != old_dir {
            targets.push(JournalTarget::Inode(new_dir));
        }
        targets.extend(victim.map(JournalTarget::Inode));

        let victim_links = self.journaled(cpu, &targets, &involved, || {
            let now = now_secs();
            {
                let addr = base + PI_PARENT_OFFSET;
                let w = self.region.unlock(addr, 8)?;
                w.write_u64(addr, new_dir)?;
                w.persist(addr, 8);
            }
            self.inodes.update_inode_checksum(ino)?;

            self.inodes.update(old_dir, |p| {
                p.mtime = now;
                p.ctime = now;
            })?;
            if new_dir != old_dir {
                self.inodes.update(new_dir, |p| {
                    p.mtime = now;
                    p.ctime = now;
                })?;
            }
            match victim {
                Some(v) => {
                    let vi = self.inodes.update(v, |p| {
                        p.links_count = p.links_count.saturating_sub(1);
                        p.ctime = now;
                    })?;
                    Ok(Some(vi.links_count))
                }
                None => Ok(None),
            }
        })?;

        if let (Some(v), Some(0)) = (victim, victim_links) {
            self.evict_inode(v)?;
        }
        log::debug!("pmfs: inode {} moved {} -> {}", ino, old_dir, new_dir);
        Ok(())
    }

    /// Release every block of an unlinked inode. The caller holds its lock.
    ///
    /// The record is cleared before anything is freed; a crash in between
    /// only leaks blocks until the next mount.
    fn evict_inode(&self, ino: InodeNr) -> PmfsResult<()> {
        let file = self.file(ino)?;
        if file.is_mapped() {
            // Reclaimed as an orphan at the next mount.
            log::debug!("pmfs: inode {} still mapped, eviction deferred", ino);
            return Ok(());
        }

        let head = self.inodes.log_head(ino)?;
        let pages = log_pages(&self.region, &self.layout, head)?;
        self.clear_inode_record(ino)?;

        let extents = file.tree.write().clear();
        file.set_size(0);
        self.files.write().remove(&ino);

        let mut freed = 0u64;
        for r in extents {
            self.alloc.free_data_blocks(r.start, r.count)?;
            freed += r.count;
        }
        for blk in &pages {
            self.alloc.free_data_blocks(*blk, 1)?;
        }
        log::debug!(
            "pmfs: evicted inode {} ({} data blocks, {} log pages)",
            ino,
            freed,
            pages.len()
        );
        Ok(())
    }
}
