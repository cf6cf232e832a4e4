use std::sync::atomic::{AtomicU8, Ordering};

use crate::space_bitmap::ContinuousSpaceBitmap;
use crate::utils::mmap::Mmap;

pub const CARD_SHIFT: usize = 9;
pub const CARD_SIZE: usize = 1 << CARD_SHIFT;

pub const CARD_CLEAN: u8 = 0;
pub const CARD_DIRTY: u8 = 0x70;
/// A dirty card that survived one aging pass.
pub const CARD_AGED: u8 = CARD_DIRTY - 1;

/// Byte-per-card table over a contiguous address range. The write barrier
/// dirties the holder's card; the collector scans dirty cards of the immune
/// spaces to find objects mutated during a cycle.
pub struct CardTable {
    mem: Mmap,
    covered_begin: usize,
    covered_limit: usize,
}

unsafe impl Send for CardTable {}
unsafe impl Sync for CardTable {}

impl CardTable {
    pub fn new(covered_begin: *mut u8, covered_size: usize) -> Self {
        let cards = (covered_size + CARD_SIZE - 1) >> CARD_SHIFT;
        Self {
            mem: Mmap::new(cards.max(1)),
            covered_begin: covered_begin as usize,
            covered_limit: covered_begin as usize + covered_size,
        }
    }

    #[inline]
    pub fn covers(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        addr >= self.covered_begin && addr < self.covered_limit
    }

    #[inline]
    fn card(&self, addr: usize) -> &AtomicU8 {
        debug_assert!(addr >= self.covered_begin && addr < self.covered_limit);
        let index = (addr - self.covered_begin) >> CARD_SHIFT;
        unsafe { &*self.mem.start().add(index).cast::<AtomicU8>() }
    }

    /// Dirty the card holding `addr`. Addresses outside the covered range are
    /// ignored; only the covered spaces need card tracking.
    #[inline]
    pub fn mark_card(&self, addr: *const u8) {
        if self.covers(addr) {
            self.card(addr as usize).store(CARD_DIRTY, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn is_dirty(&self, addr: *const u8) -> bool {
        self.covers(addr) && self.card(addr as usize).load(Ordering::Relaxed) == CARD_DIRTY
    }

    /// Visit objects marked in `bitmap` that lie on cards aged at least
    /// `min_age` within `[scan_begin, scan_end)`. Returns the number of cards
    /// visited. Scanned cards are aged so a second pass sees only newly
    /// dirtied ones.
    pub fn scan(
        &self,
        bitmap: &ContinuousSpaceBitmap,
        scan_begin: *const u8,
        scan_end: *const u8,
        min_age: u8,
        mut visitor: impl FnMut(*mut crate::header::HeapObjectHeader),
    ) -> usize {
        debug_assert!(self.covers(scan_begin));
        let mut cards_scanned = 0;
        let mut card_addr = (scan_begin as usize) & !(CARD_SIZE - 1);
        while card_addr < scan_end as usize {
            let card = self.card(card_addr);
            let value = card.load(Ordering::Relaxed);
            if value >= min_age {
                card.store(CARD_AGED, Ordering::Relaxed);
                let begin = card_addr.max(scan_begin as usize);
                let end = (card_addr + CARD_SIZE).min(scan_end as usize);
                bitmap.visit_marked_range(begin as *const u8, end as *const u8, &mut visitor);
                cards_scanned += 1;
            }
            card_addr += CARD_SIZE;
        }
        cards_scanned
    }

    pub fn clear_card_range(&self, begin: *const u8, end: *const u8) {
        let mut card_addr = (begin as usize) & !(CARD_SIZE - 1);
        while card_addr < end as usize {
            self.card(card_addr).store(CARD_CLEAN, Ordering::Relaxed);
            card_addr += CARD_SIZE;
        }
    }

    pub fn clear_all(&self) {
        unsafe {
            core::ptr::write_bytes(self.mem.start(), CARD_CLEAN, self.mem.size());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_and_scan_dirty_cards() {
        let base = 0x40000000 as *mut u8;
        let size = 64 * 1024;
        let table = CardTable::new(base, size);
        let bitmap = ContinuousSpaceBitmap::create("card-test", base, size);

        let obj = unsafe { base.add(3 * CARD_SIZE + 8) };
        bitmap.set(obj);
        table.mark_card(obj);

        let mut seen = Vec::new();
        let cards = table.scan(&bitmap, base, unsafe { base.add(size) }, CARD_DIRTY, |o| {
            seen.push(o as usize)
        });
        assert_eq!(cards, 1);
        assert_eq!(seen, vec![obj as usize]);

        // Aged by the first scan; a dirty-only rescan skips it.
        let cards = table.scan(&bitmap, base, unsafe { base.add(size) }, CARD_DIRTY, |_| {
            panic!("aged card rescanned")
        });
        assert_eq!(cards, 0);
    }

    #[test]
    fn out_of_range_marks_are_ignored() {
        let base = 0x40000000 as *mut u8;
        let table = CardTable::new(base, 4096);
        table.mark_card(0x1000 as *const u8);
        assert!(!table.is_dirty(0x1000 as *const u8));
    }
}
