//! Journal format and crash recovery.

use crate::core::error::{PmfsError, PmfsResult};
use crate::core::types::PmOffset;
use crate::{BLOCK_MASK, BLOCK_SIZE, INODE_SIZE};

use super::entry::{next_lite_journal, LiteJournalEntry, LITE_JOURNAL_ENTRY_SIZE, LITE_JOURNAL_SLOTS};
use super::{JournalGuard, LiteJournal};

impl LiteJournal {
    /// Zero every journal page and point head and tail at its start.
    pub fn hard_init(&self) -> PmfsResult<()> {
        for cpu in 0..self.cpus() {
            let page = self.layout.journal_page(cpu);
            let w = self.region.unlock(page, BLOCK_SIZE)?;
            w.fill(page, BLOCK_SIZE, 0)?;
            w.persist(page, BLOCK_SIZE);
            drop(w);

            self.store_ptr(self.head_addr(cpu), page)?;
            self.store_ptr(self.tail_addr(cpu), page)?;
        }
        log::debug!("journal: initialized {} journals", self.cpus());
        Ok(())
    }

    /// Roll back every transaction left open by a crash.
    ///
    /// All entries of every open journal are verified before anything is
    /// replayed; a bad checksum aborts recovery with `JournalCorrupted`.
    /// Returns the number of entries replayed.
    pub fn recover(&self) -> PmfsResult<u64> {
        let mut pending = Vec::new();
        for cpu in 0..self.cpus() {
            let _guard = self.locks[cpu].lock();
            let head = self.head(cpu)?;
            let tail = self.tail(cpu)?;
            self.check_ptr(cpu, head)?;
            self.check_ptr(cpu, tail)?;
            if head == tail {
                continue;
            }
            let entries = self.collect(cpu, head, tail)?;
            pending.push((cpu, head, entries));
        }

        let mut replayed = 0u64;
        for (cpu, head, entries) in pending {
            let _guard = self.locks[cpu].lock();
            for e in &entries {
                self.undo(e)?;
            }
            self.store_ptr(self.tail_addr(cpu), head)?;
            log::warn!("journal: cpu {} rolled back {} entries", cpu, entries.len());
            replayed += entries.len() as u64;
        }

        if replayed > 0 {
            self.stats.record_journal_replay(replayed);
        }
        Ok(replayed)
    }

    fn check_ptr(&self, cpu: usize, p: PmOffset) -> PmfsResult<()> {
        let page = self.layout.journal_page(cpu);
        if p & !BLOCK_MASK != page || p % LITE_JOURNAL_ENTRY_SIZE as u64 != 0 {
            log::error!("journal: cpu {} pointer {:#x} outside its page", cpu, p);
            return Err(PmfsError::JournalCorrupted);
        }
        Ok(())
    }

    fn collect(&self, cpu: usize, head: PmOffset, tail: PmOffset) -> PmfsResult<Vec<LiteJournalEntry>> {
        let mut entries = Vec::new();
        let mut p = head;
        while p != tail {
            if entries.len() >= LITE_JOURNAL_SLOTS {
                return Err(PmfsError::JournalCorrupted);
            }
            let mut raw = [0u8; LITE_JOURNAL_ENTRY_SIZE];
            self.region.read(p, &mut raw).map_err(|_| PmfsError::JournalCorrupted)?;
            let e = LiteJournalEntry::from_bytes(&raw).map_err(|e| {
                log::error!("journal: cpu {} entry {:#x} failed verification", cpu, p);
                e
            })?;
            entries.push(e);
            p = next_lite_journal(p);
        }
        Ok(entries)
    }

    fn undo(&self, e: &LiteJournalEntry) -> PmfsResult<()> {
        match *e {
            LiteJournalEntry::Inode { primary, replica } => {
                let (lo, hi) = self.layout.inode_tables_range();
                let inside = |a: PmOffset| a >= lo && a + INODE_SIZE as u64 <= hi;
                if !inside(primary) || !inside(replica) {
                    return Err(PmfsError::JournalCorrupted);
                }
                let w = self.region.unlock(primary, INODE_SIZE)?;
                w.copy_from_pmem(primary, replica, INODE_SIZE)?;
                w.persist(primary, INODE_SIZE);
            }
            LiteJournalEntry::Field { addr, value } => {
                self.region.check_range(addr, 8).map_err(|_| PmfsError::JournalCorrupted)?;
                self.store_ptr(addr, value)?;
            }
        }
        Ok(())
    }
}

impl JournalGuard<'_> {
    /// Roll the open transaction back in place and close it.
    pub fn abort_transaction(&mut self, tail: PmOffset) -> PmfsResult<()> {
        let j = self.journal;
        let head = j.head(self.cpu)?;
        assert_eq!(
            j.tail(self.cpu)?,
            tail,
            "lite journal: cpu {} abort with stale tail",
            self.cpu
        );
        let entries = j.collect(self.cpu, head, tail)?;
        for e in &entries {
            j.undo(e)?;
        }
        j.store_ptr(j.tail_addr(self.cpu), head)?;
        log::debug!("journal: cpu {} aborted {} entries", self.cpu, entries.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::JournalTarget;
    use super::*;
    use crate::core::stats::PmfsStats;
    use crate::pmem::{Layout, PmemRegion};
    use std::sync::Arc;

    fn setup() -> (Arc<PmemRegion>, Layout, LiteJournal) {
        let region = Arc::new(PmemRegion::new(512 * BLOCK_SIZE).unwrap());
        let layout = Layout::compute(512, 2, 16, 9).unwrap();
        let j = LiteJournal::new(region.clone(), layout, Arc::new(PmfsStats::new()));
        j.hard_init().unwrap();
        (region, layout, j)
    }

    fn store(region: &PmemRegion, addr: PmOffset, bytes: &[u8]) {
        let w = region.unlock(addr, bytes.len()).unwrap();
        w.write(addr, bytes).unwrap();
    }

    #[test]
    fn test_recover_clean_is_noop() {
        let (_region, _layout, j) = setup();
        assert_eq!(j.recover().unwrap(), 0);
    }

    #[test]
    fn test_recover_rolls_back_and_is_idempotent() {
        let (region, layout, j) = setup();
        let primary = layout.inode_addr(2);
        let replica = layout.replica_inode_addr(2);
        store(&region, primary, &[0xAA; INODE_SIZE]);
        store(&region, replica, &[0xAA; INODE_SIZE]);
        let field = layout.inode_addr(3) + 56;
        store(&region, field, &5u64.to_le_bytes());

        {
            let mut g = j.lock(1);
            g.create_transaction(&[JournalTarget::Inode(2), JournalTarget::Field(field)])
                .unwrap();
            // Mutate, then crash before commit.
            store(&region, primary, &[0x55; INODE_SIZE]);
            store(&region, field, &9u64.to_le_bytes());
        }

        let image = region.snapshot();
        assert_eq!(j.recover().unwrap(), 2);
        let mut buf = [0u8; INODE_SIZE];
        region.read(primary, &mut buf).unwrap();
        assert_eq!(buf, [0xAA; INODE_SIZE]);
        assert_eq!(region.read_u64(field).unwrap(), 5);
        assert_eq!(j.head(1).unwrap(), j.tail(1).unwrap());

        // Second pass finds nothing; same end state.
        let after = region.snapshot();
        assert_eq!(j.recover().unwrap(), 0);
        assert_eq!(region.snapshot(), after);

        // Replaying twice from the crash image gives the same state too.
        let again = Arc::new(PmemRegion::from_image(&image).unwrap());
        let j2 = LiteJournal::new(again.clone(), layout, Arc::new(PmfsStats::new()));
        j2.recover().unwrap();
        assert_eq!(again.snapshot(), after);
    }

    #[test]
    fn test_recover_refuses_corrupted_entry() {
        let (region, layout, j) = setup();
        {
            let mut g = j.lock(0);
            g.create_transaction(&[JournalTarget::Inode(2), JournalTarget::Inode(3)])
                .unwrap();
        }
        let before = region.snapshot();
        region.inject_bit_flip(layout.journal_page(0) + 64 + 20, 3).unwrap();
        assert_eq!(j.recover(), Err(PmfsError::JournalCorrupted));
        // Nothing was replayed.
        let mut p = region.snapshot();
        p[(layout.journal_page(0) + 64 + 20) as usize] ^= 1 << 3;
        assert_eq!(p, before);
    }

    #[test]
    fn test_abort_restores_before_images() {
        let (region, layout, j) = setup();
        let field = layout.inode_addr(3) + 56;
        store(&region, field, &7u64.to_le_bytes());

        let mut g = j.lock(0);
        let tail = g.create_transaction(&[JournalTarget::Field(field)]).unwrap();
        store(&region, field, &8u64.to_le_bytes());
        g.abort_transaction(tail).unwrap();
        drop(g);

        assert_eq!(region.read_u64(field).unwrap(), 7);
        assert_eq!(j.head(0).unwrap(), j.tail(0).unwrap());
        assert_eq!(j.recover().unwrap(), 0);
    }

    #[test]
    fn test_recover_rejects_wild_pointer() {
        let (region, layout, j) = setup();
        store(&region, layout.journal_ptr_addr(0) + 8, &0x12345u64.to_le_bytes());
        assert_eq!(j.recover(), Err(PmfsError::JournalCorrupted));
    }
}
