use atomic::{Atomic, Ordering};

use crate::object::TAGGED_SIZE;

const BITS_PER_WORD: usize = core::mem::size_of::<usize>() * 8;
const CELLS_PER_WORD: usize = BITS_PER_WORD / 2;
/// Every even bit of a word: the low half of each mark-bit pair, set only
/// when an object advances from Grey to Black.
const LO_MASK: usize = {
    let mut mask = 0usize;
    let mut i = 0;
    while i < CELLS_PER_WORD {
        mask |= 1 << (2 * i);
        i += 1;
    }
    mask
};
/// Every odd bit of a word: the "discovered" half of each pair, set for
/// Grey and Black alike.
const HI_MASK: usize = LO_MASK << 1;

/// Tri-color state of one object. The bit pair encodes White as `00`,
/// Grey as `10` and Black as `11`; `01` cannot be produced by any legal
/// transition and is treated as bitmap corruption.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Color {
    White,
    Grey,
    Black,
}

/// Two bits per tagged word of a page area. Transitions only ever advance
/// (White -> Grey -> Black) within a cycle, so relaxed atomics suffice;
/// publication happens through the worklists.
pub struct MarkBitmap {
    words: Box<[Atomic<usize>]>,
}

impl MarkBitmap {
    pub fn new(area_size: usize) -> MarkBitmap {
        let cells = area_size / TAGGED_SIZE;
        let words = (2 * cells + BITS_PER_WORD - 1) / BITS_PER_WORD;
        MarkBitmap {
            words: (0..words).map(|_| Atomic::new(0usize)).collect(),
        }
    }

    #[inline(always)]
    fn locate(offset: usize) -> (usize, usize) {
        debug_assert!(offset % TAGGED_SIZE == 0);
        let cell = offset / TAGGED_SIZE;
        (cell / CELLS_PER_WORD, 2 * (cell % CELLS_PER_WORD))
    }

    #[inline]
    pub fn color(&self, offset: usize) -> Color {
        let (index, shift) = Self::locate(offset);
        let pair = (self.words[index].load(Ordering::Relaxed) >> shift) & 0b11;
        match pair {
            0b00 => Color::White,
            0b10 => Color::Grey,
            0b11 => Color::Black,
            _ => unreachable!("impossible mark-bit pattern 01"),
        }
    }

    #[inline]
    pub fn is_white(&self, offset: usize) -> bool {
        self.color(offset) == Color::White
    }

    #[inline]
    pub fn is_grey(&self, offset: usize) -> bool {
        self.color(offset) == Color::Grey
    }

    #[inline]
    pub fn is_black(&self, offset: usize) -> bool {
        self.color(offset) == Color::Black
    }

    #[inline]
    pub fn is_black_or_grey(&self, offset: usize) -> bool {
        self.color(offset) != Color::White
    }

    /// Atomically advance White to Grey. Returns false when another worker
    /// got there first (any non-white state counts as lost).
    #[inline]
    pub fn white_to_grey(&self, offset: usize) -> bool {
        let (index, shift) = Self::locate(offset);
        let word = &self.words[index];
        let mut old = word.load(Ordering::Relaxed);
        loop {
            if (old >> shift) & 0b11 != 0 {
                return false;
            }
            match word.compare_exchange_weak(
                old,
                old | (0b10 << shift),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(prev) => old = prev,
            }
        }
    }

    /// Advance Grey to Black. The object is owned by exactly one drain loop
    /// at this point, so a plain read-modify-write is enough.
    #[inline]
    pub fn grey_to_black(&self, offset: usize) -> bool {
        let (index, shift) = Self::locate(offset);
        let word = &self.words[index];
        let mut old = word.load(Ordering::Relaxed);
        loop {
            if (old >> shift) & 0b11 != 0b10 {
                return false;
            }
            match word.compare_exchange_weak(
                old,
                old | (0b11 << shift),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(prev) => old = prev,
            }
        }
    }

    /// Force a cell straight to Black. Used when transferring marks onto a
    /// promoted page and by the allocation-site reprieve.
    #[inline]
    pub fn set_black(&self, offset: usize) {
        let (index, shift) = Self::locate(offset);
        let word = &self.words[index];
        let mut old = word.load(Ordering::Relaxed);
        loop {
            match word.compare_exchange_weak(
                old,
                old | (0b11 << shift),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(prev) => old = prev,
            }
        }
    }

    #[inline]
    pub fn set_grey(&self, offset: usize) {
        let (index, shift) = Self::locate(offset);
        let word = &self.words[index];
        let mut old = word.load(Ordering::Relaxed);
        loop {
            let new = (old & !(0b11 << shift)) | (0b10 << shift);
            match word.compare_exchange_weak(old, new, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(prev) => old = prev,
            }
        }
    }

    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Clear marks for objects whose offsets fall in `[start, end)`.
    pub fn clear_range(&self, start: usize, end: usize) {
        let mut offset = start;
        while offset < end {
            let (index, shift) = Self::locate(offset);
            let word = &self.words[index];
            let mut old = word.load(Ordering::Relaxed);
            loop {
                match word.compare_exchange_weak(
                    old,
                    old & !(0b11 << shift),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(prev) => old = prev,
                }
            }
            offset += TAGGED_SIZE;
        }
    }

    /// Word-at-a-time walk over every non-white cell. The visitor receives
    /// the byte offset and the color observed at visit time.
    pub fn iterate_live(&self, mut visitor: impl FnMut(usize, Color)) {
        for (index, word) in self.words.iter().enumerate() {
            let snapshot = word.load(Ordering::Relaxed);
            let mut live = snapshot & HI_MASK;
            while live != 0 {
                let bit = live.trailing_zeros() as usize;
                live &= live - 1;
                let cell = index * CELLS_PER_WORD + bit / 2;
                let color = if snapshot & (1 << (bit - 1)) != 0 {
                    Color::Black
                } else {
                    Color::Grey
                };
                visitor(cell * TAGGED_SIZE, color);
            }
        }
    }

    /// True when some pair has its low bit set without the high bit: the
    /// structurally impossible `01` pattern.
    pub fn has_corrupt_pattern(&self) -> bool {
        self.words.iter().any(|word| {
            let w = word.load(Ordering::Relaxed);
            w & !(w >> 1) & LO_MASK != 0
        })
    }

    pub fn is_clear(&self) -> bool {
        self.words
            .iter()
            .all(|word| word.load(Ordering::Relaxed) == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_advance_monotonically() {
        let bitmap = MarkBitmap::new(1024);
        assert!(bitmap.is_white(64));
        assert!(bitmap.white_to_grey(64));
        assert!(!bitmap.white_to_grey(64));
        assert!(bitmap.is_grey(64));
        assert!(bitmap.grey_to_black(64));
        assert!(!bitmap.grey_to_black(64));
        assert!(bitmap.is_black(64));
    }

    #[test]
    fn live_iteration_reports_colors() {
        let bitmap = MarkBitmap::new(4096);
        bitmap.white_to_grey(0);
        bitmap.white_to_grey(16);
        bitmap.grey_to_black(16);
        bitmap.white_to_grey(4000);

        let mut seen = Vec::new();
        bitmap.iterate_live(|offset, color| seen.push((offset, color)));
        assert_eq!(
            seen,
            vec![
                (0, Color::Grey),
                (16, Color::Black),
                (4000, Color::Grey)
            ]
        );
    }

    #[test]
    fn clear_range_resets_pairs() {
        let bitmap = MarkBitmap::new(1024);
        bitmap.set_black(8);
        bitmap.set_black(24);
        bitmap.clear_range(0, 16);
        assert!(bitmap.is_white(8));
        assert!(bitmap.is_black(24));
        assert!(!bitmap.has_corrupt_pattern());
    }
}
