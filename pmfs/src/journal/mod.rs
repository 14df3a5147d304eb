//! Per-CPU lite journal.
//!
//! Metadata operations that touch several inodes record undo
//! before-images here first. Each CPU owns one journal page used as a
//! ring, and a head/tail pointer pair in the journal pointer block.
//!
//! A transaction is open while `head != tail`. Only one may be open per
//! CPU; the per-CPU lock plus the `head == tail` check enforce that.
//!
//! ```text
//!   create_transaction          commit_transaction
//!   head == tail  ──append──▶  head .. tail  ──head = tail──▶ closed
//! ```

pub mod entry;
mod recovery;

pub use entry::{next_lite_journal, LiteJournalEntry, LITE_JOURNAL_ENTRY_SIZE, LITE_JOURNAL_SLOTS};

use std::sync::Arc;

use spin::{Mutex, MutexGuard};

use crate::core::error::{PmfsError, PmfsResult};
use crate::core::stats::PmfsStats;
use crate::core::types::{InodeNr, PmOffset};
use crate::pmem::{Layout, PmemRegion};

/// Something a transaction will modify.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalTarget {
    /// A whole inode record; undo copies the replica over the primary
    Inode(InodeNr),
    /// An aligned 8-byte field; undo writes back its current value
    Field(PmOffset),
}

/// All per-CPU lite journals.
#[derive(Debug)]
pub struct LiteJournal {
    region: Arc<PmemRegion>,
    layout: Layout,
    locks: Vec<Mutex<()>>,
    stats: Arc<PmfsStats>,
}

impl LiteJournal {
    /// Create journal access
    pub fn new(region: Arc<PmemRegion>, layout: Layout, stats: Arc<PmfsStats>) -> Self {
        let locks = (0..layout.cpus).map(|_| Mutex::new(())).collect();
        Self { region, layout, locks, stats }
    }

    /// Number of per-CPU journals
    #[inline]
    pub fn cpus(&self) -> usize {
        self.locks.len()
    }

    #[inline]
    fn head_addr(&self, cpu: usize) -> PmOffset {
        self.layout.journal_ptr_addr(cpu)
    }

    #[inline]
    fn tail_addr(&self, cpu: usize) -> PmOffset {
        self.layout.journal_ptr_addr(cpu) + 8
    }

    /// Persistent head of a CPU journal
    pub fn head(&self, cpu: usize) -> PmfsResult<PmOffset> {
        self.region.read_u64(self.head_addr(cpu))
    }

    /// Persistent tail of a CPU journal
    pub fn tail(&self, cpu: usize) -> PmfsResult<PmOffset> {
        self.region.read_u64(self.tail_addr(cpu))
    }

    fn store_ptr(&self, addr: PmOffset, value: PmOffset) -> PmfsResult<()> {
        let w = self.region.unlock(addr, 8)?;
        w.write_u64(addr, value)?;
        w.persist(addr, 8);
        Ok(())
    }

    /// Take the journal of `cpu`.
    pub fn lock(&self, cpu: usize) -> JournalGuard<'_> {
        let cpu = cpu % self.locks.len();
        JournalGuard {
            journal: self,
            cpu,
            _guard: self.locks[cpu].lock(),
        }
    }

    fn undo_record(&self, target: JournalTarget) -> PmfsResult<LiteJournalEntry> {
        match target {
            JournalTarget::Inode(ino) => {
                if ino == 0 || ino >= self.layout.inode_count {
                    return Err(PmfsError::InvalidInode);
                }
                Ok(LiteJournalEntry::Inode {
                    primary: self.layout.inode_addr(ino),
                    replica: self.layout.replica_inode_addr(ino),
                })
            }
            JournalTarget::Field(addr) => {
                if addr % 8 != 0 {
                    return Err(PmfsError::InvalidArgument);
                }
                let value = self.region.read_u64(addr)?;
                Ok(LiteJournalEntry::Field { addr, value })
            }
        }
    }
}

/// Exclusive access to one CPU journal.
#[derive(Debug)]
pub struct JournalGuard<'a> {
    journal: &'a LiteJournal,
    cpu: usize,
    _guard: MutexGuard<'a, ()>,
}

impl JournalGuard<'_> {
    /// CPU this journal belongs to
    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Record before-images for `targets` and open a transaction.
    ///
    /// Returns the new tail, to be handed to [`Self::commit_transaction`].
    ///
    /// # Panics
    ///
    /// Panics if a transaction is already open on this CPU.
    pub fn create_transaction(&mut self, targets: &[JournalTarget]) -> PmfsResult<PmOffset> {
        let j = self.journal;
        let head = j.head(self.cpu)?;
        let tail = j.tail(self.cpu)?;
        if head != tail {
            panic!(
                "lite journal: cpu {} already has an open transaction (head {:#x}, tail {:#x})",
                self.cpu, head, tail
            );
        }
        if targets.is_empty() || targets.len() >= LITE_JOURNAL_SLOTS {
            return Err(PmfsError::InvalidArgument);
        }

        let records = targets
            .iter()
            .map(|t| j.undo_record(*t))
            .collect::<PmfsResult<Vec<_>>>()?;

        let mut p = tail;
        for rec in &records {
            let w = j.region.unlock(p, LITE_JOURNAL_ENTRY_SIZE)?;
            w.write(p, &rec.to_bytes())?;
            w.flush(p, LITE_JOURNAL_ENTRY_SIZE);
            p = next_lite_journal(p);
        }
        j.region.record_fence();

        j.store_ptr(j.tail_addr(self.cpu), p)?;
        log::trace!("journal: cpu {} opened {} entries, tail {:#x}", self.cpu, records.len(), p);
        Ok(p)
    }

    /// Close the open transaction.
    ///
    /// # Panics
    ///
    /// Panics if `tail` is not the tail returned by the matching
    /// [`Self::create_transaction`].
    pub fn commit_transaction(&mut self, tail: PmOffset) -> PmfsResult<()> {
        let j = self.journal;
        let current = j.tail(self.cpu)?;
        assert_eq!(
            current, tail,
            "lite journal: cpu {} commit with stale tail",
            self.cpu
        );
        j.store_ptr(j.head_addr(self.cpu), tail)?;
        j.stats.record_journal_txn();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;

    fn setup() -> (Arc<PmemRegion>, Layout, LiteJournal) {
        let region = Arc::new(PmemRegion::new(512 * BLOCK_SIZE).unwrap());
        let layout = Layout::compute(512, 2, 16, 9).unwrap();
        let j = LiteJournal::new(region.clone(), layout, Arc::new(PmfsStats::new()));
        j.hard_init().unwrap();
        (region, layout, j)
    }

    #[test]
    fn test_hard_init_pointers() {
        let (_region, layout, j) = setup();
        for cpu in 0..2 {
            assert_eq!(j.head(cpu).unwrap(), layout.journal_page(cpu));
            assert_eq!(j.tail(cpu).unwrap(), layout.journal_page(cpu));
        }
    }

    #[test]
    fn test_create_commit() {
        let (_region, layout, j) = setup();
        let mut g = j.lock(1);
        let tail = g.create_transaction(&[JournalTarget::Inode(2), JournalTarget::Inode(3)]).unwrap();
        assert_eq!(tail, layout.journal_page(1) + 128);
        assert_eq!(j.head(1).unwrap(), layout.journal_page(1));
        g.commit_transaction(tail).unwrap();
        assert_eq!(j.head(1).unwrap(), tail);
        drop(g);

        // Journals are independent.
        assert_eq!(j.tail(0).unwrap(), layout.journal_page(0));
    }

    #[test]
    #[should_panic(expected = "open transaction")]
    fn test_double_create_panics() {
        let (_region, _layout, j) = setup();
        let mut g = j.lock(0);
        g.create_transaction(&[JournalTarget::Inode(2)]).unwrap();
        let _ = g.create_transaction(&[JournalTarget::Inode(3)]);
    }

    #[test]
    fn test_ring_wraps() {
        let (_region, layout, j) = setup();
        let mut g = j.lock(0);
        for _ in 0..40 {
            let t = g
                .create_transaction(&[JournalTarget::Inode(2), JournalTarget::Inode(3)])
                .unwrap();
            g.commit_transaction(t).unwrap();
        }
        // 80 slots used in a 64-slot ring.
        assert_eq!(j.tail(0).unwrap(), layout.journal_page(0) + 16 * 64);
    }

    #[test]
    fn test_rejects_bad_targets() {
        let (_region, _layout, j) = setup();
        let mut g = j.lock(0);
        assert_eq!(g.create_transaction(&[]), Err(PmfsError::InvalidArgument));
        assert_eq!(
            g.create_transaction(&[JournalTarget::Field(0x4003)]),
            Err(PmfsError::InvalidArgument)
        );
        assert_eq!(
            g.create_transaction(&[JournalTarget::Inode(99)]),
            Err(PmfsError::InvalidInode)
        );
    }
}
