//! Copy-on-write file writes.
//!
//! One call runs this state machine, looping over allocation breaks:
//!
//! ```text
//!  ALLOC ─▶ FILL_EDGES ─▶ COPY_PAYLOAD ─▶ PROTECT ─▶ APPEND_LOG ─┐
//!    ▲                                                            │
//!    └────────────────────── more blocks ◀────────────────────────┘
//!                               │ done
//!                               ▼
//!                 PUBLISH ─▶ RESOLVE_OVERLAP ─▶ UPDATE_SIZE
//! ```
//!
//! Nothing is visible after a crash until PUBLISH, a single durable store
//! of the inode's log tail. Entries appended before it sit past the
//! published tail and their blocks are unreachable.

use crate::alloc::BlockAllocator;
use crate::core::error::{PmfsError, PmfsResult};
use crate::core::types::{block_of, blocks_spanned, offset_in_block, BlockRange, InodeNr, PmOffset, NULL_OFFSET};
use crate::filelog::{set_entry_state, FileWriteEntry, LogWalker, LogWriter, ENTRY_SIZE};
use crate::fs::Pmfs;
use crate::inode::{now_secs, FileInode};
use crate::BLOCK_SIZE;

/// Entries appended by one write but not yet published.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    /// First appended slot
    begin: PmOffset,
    /// Private tail cursor
    tail: PmOffset,
    /// Appended entries, in log order
    entries: Vec<(PmOffset, FileWriteEntry)>,
    /// Payload bytes covered by `entries`
    written: usize,
    /// Allocation loop iterations
    breaks: u64,
}

impl Pmfs {
    /// Write `buf` at `pos`.
    ///
    /// Returns the bytes written, which is less than `buf.len()` only when
    /// a media error cut the copy short after some blocks were complete.
    pub fn write(&self, ino: InodeNr, buf: &[u8], pos: u64) -> PmfsResult<usize> {
        self.cow_file_write(ino, buf, Some(pos))
    }

    /// Write `buf` at the current end of file.
    pub fn append(&self, ino: InodeNr, buf: &[u8]) -> PmfsResult<usize> {
        self.cow_file_write(ino, buf, None)
    }

    /// Copy-on-write `buf` into the file at `pos` (end of file if `None`).
    pub fn cow_file_write(&self, ino: InodeNr, buf: &[u8], pos: Option<u64>) -> PmfsResult<usize> {
        let file = self.file(ino)?;
        if buf.is_empty() {
            return Ok(0);
        }
        if file.is_mapped() {
            return Err(PmfsError::AccessConflict);
        }

        let _guard = file.lock.lock();
        // mmap takes the same lock before counting the mapping
        if file.is_mapped() {
            return Err(PmfsError::AccessConflict);
        }

        let pos = pos.unwrap_or_else(|| file.size());
        pos.checked_add(buf.len() as u64).ok_or(PmfsError::InvalidArgument)?;

        let cpu = self.current_cpu();
        let pending = self.cow_write_entries(cpu, &file, buf, pos)?;
        self.publish_write(&file, pos, pending)
    }

    /// ALLOC through APPEND_LOG for every allocation break.
    fn cow_write_entries(
        &self,
        cpu: usize,
        file: &FileInode,
        buf: &[u8],
        pos: u64,
    ) -> PmfsResult<PendingWrite> {
        let ino = file.ino();
        let trans_id = self.next_trans_id();
        let mtime = now_secs();
        let logw = LogWriter::new(&self.region, &self.layout, &self.alloc);

        let mut pending = PendingWrite {
            begin: NULL_OFFSET,
            tail: self.inodes.log_tail(ino)?,
            entries: Vec::new(),
            written: 0,
            breaks: 0,
        };

        let mut p = pos;
        let mut rest = buf;
        let mut num_blocks = blocks_spanned(offset_in_block(pos), buf.len() as u64);

        while num_blocks > 0 {
            let offset = offset_in_block(p) as usize;
            let start_blk = block_of(p);

            let range = match self.alloc.new_data_blocks(cpu, num_blocks, start_blk, false) {
                Ok(r) => r,
                Err(e) => {
                    log::debug!("write: inode {} allocation failed: {}", ino, e);
                    self.cleanup_incomplete_write(None, &pending);
                    return Err(e);
                }
            };
            pending.breaks += 1;

            let bytes = (range.count as usize * BLOCK_SIZE - offset).min(rest.len());
            let copied = match self.write_extent(file, range, offset, start_blk, &rest[..bytes]) {
                Ok(n) => n,
                Err(e) => {
                    self.cleanup_incomplete_write(Some(range), &pending);
                    return Err(e);
                }
            };

            if copied < bytes {
                log::warn!(
                    "write: inode {} short copy at block {} ({} of {} bytes)",
                    ino,
                    range.start,
                    copied,
                    bytes
                );
                if let Err(e) = self.alloc.free_data_blocks(range.start, range.count) {
                    log::error!("write: freeing faulted blocks {}+{}: {}", range.start, range.count, e);
                }
                if pending.entries.is_empty() {
                    return Err(PmfsError::Fault);
                }
                break;
            }

            let end = p + copied as u64;
            let entry = FileWriteEntry::new(
                trans_id,
                start_blk,
                range.count as u32,
                self.layout.block_off(range.start),
                mtime,
                end.max(file.size()),
            );
            let slot = match self.append_entry(&logw, cpu, ino, pending.tail, &entry) {
                Ok(s) => s,
                Err(e) => {
                    self.cleanup_incomplete_write(Some(range), &pending);
                    return Err(e);
                }
            };
            if pending.begin == NULL_OFFSET {
                pending.begin = slot;
            }
            pending.tail = slot + ENTRY_SIZE as u64;
            pending.entries.push((slot, entry));
            pending.written += copied;

            p = end;
            rest = &rest[copied..];
            num_blocks -= range.count;
        }

        Ok(pending)
    }

    /// FILL_EDGES, COPY_PAYLOAD and PROTECT for one allocated extent.
    ///
    /// Returns the payload bytes that reached the media.
    fn write_extent(
        &self,
        file: &FileInode,
        range: BlockRange,
        offset: usize,
        start_blk: u64,
        payload: &[u8],
    ) -> PmfsResult<usize> {
        let n = range.count as usize;
        let base = self.layout.block_off(range.start);
        let end_off = (offset + payload.len()) % BLOCK_SIZE;

        let mut edge_idx = Vec::with_capacity(2);
        if offset != 0 {
            edge_idx.push(0);
        }
        if end_off != 0 && !edge_idx.contains(&(n - 1)) {
            edge_idx.push(n - 1);
        }

        // Edge blocks keep the bytes around the payload from the old
        // mapping. `edges` holds their final contents for PROTECT.
        let mut edges: Vec<(usize, Vec<u8>)> = Vec::with_capacity(edge_idx.len());
        for i in edge_idx {
            let mut img = self.old_block_image(file, start_blk + i as u64)?;
            let a = if i == 0 { offset } else { 0 };
            let b = if i == n - 1 && end_off != 0 { end_off } else { BLOCK_SIZE };
            let blk_off = base + (i * BLOCK_SIZE) as u64;

            let w = self.region.unlock(blk_off, BLOCK_SIZE)?;
            if a > 0 {
                w.write(blk_off, &img[..a])?;
            }
            if b < BLOCK_SIZE {
                w.write(blk_off + b as u64, &img[b..])?;
            }
            w.flush(blk_off, BLOCK_SIZE);

            let src = i * BLOCK_SIZE + a - offset;
            img[a..b].copy_from_slice(&payload[src..src + (b - a)]);
            edges.push((i, img));
        }

        let dst = base + offset as u64;
        let missed = {
            let w = self.region.unlock(dst, payload.len())?;
            let missed = w.memcpy_nocache(dst, payload)?;
            w.flush(dst, payload.len() - missed);
            w.barrier();
            missed
        };
        if missed > 0 {
            return Ok(payload.len() - missed);
        }

        if self.integrity.csum_enabled() {
            let bare = self.integrity.update_cow_csum(range.start, payload, offset);
            if bare > 0 {
                log::warn!("write: {} bytes at block {} left without checksum", bare, range.start);
                self.stats.record_partial_csum(bare as u64);
            }
        }
        for i in 0..n {
            let content: &[u8] = match edges.iter().find(|(j, _)| *j == i) {
                Some((_, img)) => img,
                None => {
                    let s = i * BLOCK_SIZE - offset;
                    &payload[s..s + BLOCK_SIZE]
                }
            };
            let blk = range.start + i as u64;
            if let Err(e) = self.integrity.update_block_csum_parity(blk, content) {
                log::warn!("write: block {} stripe protection not updated: {}", blk, e);
            }
        }

        Ok(payload.len())
    }

    /// Current contents of logical block `pgoff`, zeros for a hole.
    fn old_block_image(&self, file: &FileInode, pgoff: u64) -> PmfsResult<Vec<u8>> {
        let mut img = vec![0u8; BLOCK_SIZE];
        let mapped = file.tree.read().lookup(pgoff);
        if let Some(m) = mapped {
            self.region.read(self.layout.block_off(m.block_at(pgoff)), &mut img)?;
        }
        Ok(img)
    }

    /// Append past `tail`, initializing the log on first use.
    pub(crate) fn append_entry(
        &self,
        logw: &LogWriter<'_>,
        cpu: usize,
        ino: InodeNr,
        tail: PmOffset,
        entry: &FileWriteEntry,
    ) -> PmfsResult<PmOffset> {
        let tail = if tail == NULL_OFFSET {
            let page = logw.new_log_page(cpu)?;
            self.inodes.init_log(ino, page)?;
            page
        } else {
            tail
        };
        logw.append(cpu, tail, entry)
    }

    /// Free the blocks of an unpublished write.
    ///
    /// `current` is the allocation of the failing iteration; every entry
    /// between the begin marker and the private cursor is walked and its
    /// blocks returned. Published state is never touched.
    fn cleanup_incomplete_write(&self, current: Option<BlockRange>, pending: &PendingWrite) {
        if let Some(r) = current {
            if let Err(e) = self.alloc.free_data_blocks(r.start, r.count) {
                log::error!("write: cleanup free {}+{}: {}", r.start, r.count, e);
            }
        }
        if pending.begin == NULL_OFFSET {
            return;
        }
        for item in LogWalker::new(&self.region, pending.begin, pending.tail) {
            match item {
                Ok((_, e)) => {
                    if let Err(err) = self.alloc.free_data_blocks(e.blocknr(), e.num_pages as u64) {
                        log::error!("write: cleanup free {}+{}: {}", e.blocknr(), e.num_pages, err);
                    }
                }
                Err(err) => {
                    log::error!("write: cleanup walk stopped: {}", err);
                    break;
                }
            }
        }
    }

    /// PUBLISH, RESOLVE_OVERLAP and UPDATE_SIZE.
    ///
    /// A failed tail store frees the unpublished blocks and is returned.
    /// Failures after it are logged, not returned: the write is durable
    /// and mount rebuilds reassign state and size from the log.
    fn publish_write(&self, file: &FileInode, pos: u64, pending: PendingWrite) -> PmfsResult<usize> {
        let ino = file.ino();
        let Some(&(_, first)) = pending.entries.first() else {
            return Ok(0);
        };

        if let Err(e) = self.inodes.update_tail(ino, pending.tail) {
            log::error!("write: inode {} tail publish failed: {}", ino, e);
            self.cleanup_incomplete_write(None, &pending);
            return Err(e);
        }

        let blocks = {
            let mut tree = file.tree.write();
            let mut reassigned = 0u64;
            let mut freed = 0u64;
            for (slot, e) in &pending.entries {
                let out = tree.assign(*slot, e);
                for u in &out.updates {
                    if u.reassigned {
                        reassigned += 1;
                    }
                    if let Err(err) = set_entry_state(&self.region, u.entry, u.invalid_pages, u.reassigned) {
                        log::warn!("write: entry {:#x} reassign state not stored: {}", u.entry, err);
                    }
                }
                for r in &out.superseded {
                    match self.alloc.free_data_blocks(r.start, r.count) {
                        Ok(()) => freed += r.count,
                        Err(err) => log::error!("write: reclaim {}+{}: {}", r.start, r.count, err),
                    }
                }
            }
            if reassigned > 0 || freed > 0 {
                self.stats.record_reclaim(reassigned, freed);
            }
            tree.live_pages()
        };

        let new_size = file.size().max(pos + pending.written as u64);
        file.set_size(new_size);
        let res = self.inodes.update(ino, |pi| {
            pi.size = new_size;
            pi.blocks = blocks;
            pi.mtime = first.mtime;
            pi.ctime = first.mtime;
        });
        if let Err(e) = res {
            log::warn!("write: inode {} size not stored: {}", ino, e);
        } else {
            self.sync_replica(ino);
        }

        self.stats.record_write(pending.written as u64, pending.breaks);
        log::trace!(
            "write: inode {} pos {} wrote {} bytes in {} entries",
            ino,
            pos,
            pending.written,
            pending.entries.len()
        );
        Ok(pending.written)
    }
}
