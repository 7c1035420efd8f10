//! Dirty-bit mask over the color source grid, one bit per texel packed 32
//! columns to a word.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateBitmap {
    width: u32,
    height: u32,
    pitch: u32,
    words: Vec<u32>,
}

/// A run of up to 32 texels whose word had at least one bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtySpan {
    pub x: u32,
    pub y: u32,
    pub len: u32,
    pub word_index: usize,
}

impl UpdateBitmap {
    /// Creates a mask with every texel marked dirty.
    pub fn new(width: u32, height: u32) -> Self {
        let pitch = width.div_ceil(32);
        let mut bitmap = Self { width, height, pitch, words: vec![0; (pitch * height) as usize] };
        bitmap.mark_all();
        bitmap
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Words per row.
    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    /// Bits of column-word `column` that map to real texels.
    fn valid_mask(&self, column: u32) -> u32 {
        let remaining = self.width - column * 32;
        if remaining >= 32 {
            u32::MAX
        } else {
            (1u32 << remaining) - 1
        }
    }

    /// Marks one texel. Out-of-range coordinates are ignored.
    pub fn mark(&mut self, x: u32, y: u32) {
        if x >= self.width || y >= self.height {
            return;
        }
        self.words[(y * self.pitch + x / 32) as usize] |= 1 << (x % 32);
    }

    pub fn mark_all(&mut self) {
        for y in 0..self.height {
            for column in 0..self.pitch {
                let mask = self.valid_mask(column);
                self.words[(y * self.pitch + column) as usize] = mask;
            }
        }
    }

    pub fn is_set(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.words[(y * self.pitch + x / 32) as usize] & (1 << (x % 32)) != 0
    }

    /// True when every texel is dirty.
    pub fn is_fully_dirty(&self) -> bool {
        (0..self.height).all(|y| {
            (0..self.pitch).all(|column| {
                let mask = self.valid_mask(column);
                self.words[(y * self.pitch + column) as usize] & mask == mask
            })
        })
    }

    pub fn is_clean(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Spans of every non-zero word, row by row.
    pub fn dirty_spans(&self) -> Vec<DirtySpan> {
        self.words
            .iter()
            .enumerate()
            .filter(|(_, &word)| word != 0)
            .map(|(word_index, _)| {
                let y = word_index as u32 / self.pitch;
                let column = word_index as u32 % self.pitch;
                let x = column * 32;
                DirtySpan { x, y, len: (self.width - x).min(32), word_index }
            })
            .collect()
    }

    pub fn clear_span(&mut self, span: &DirtySpan) {
        self.words[span.word_index] = 0;
    }

    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_fully_dirty() {
        let bitmap = UpdateBitmap::new(70, 3);
        assert_eq!(bitmap.pitch(), 3);
        assert!(bitmap.is_fully_dirty());
        assert_eq!(bitmap.count(), 70 * 3);
    }

    #[test]
    fn marking_sets_exactly_one_bit() {
        let mut bitmap = UpdateBitmap::new(100, 10);
        bitmap.clear_all();
        bitmap.mark(37, 4);
        assert_eq!(bitmap.count(), 1);
        assert!(bitmap.is_set(37, 4));
        assert!(!bitmap.is_set(36, 4));
        bitmap.mark(37, 4);
        assert_eq!(bitmap.count(), 1);
        bitmap.mark(100, 4);
        bitmap.mark(0, 10);
        assert_eq!(bitmap.count(), 1);
    }

    #[test]
    fn full_cycle_clears_everything() {
        let mut bitmap = UpdateBitmap::new(64, 64);
        assert!(bitmap.is_fully_dirty());
        bitmap.clear_all();
        assert!(bitmap.is_clean());
        assert!(!bitmap.is_fully_dirty());
    }

    #[test]
    fn partial_cycle_clears_only_processed_words() {
        let mut bitmap = UpdateBitmap::new(80, 4);
        bitmap.clear_all();
        bitmap.mark(5, 0);
        bitmap.mark(70, 2);
        bitmap.mark(71, 2);
        let spans = bitmap.dirty_spans();
        assert_eq!(
            spans,
            vec![
                DirtySpan { x: 0, y: 0, len: 32, word_index: 0 },
                DirtySpan { x: 64, y: 2, len: 16, word_index: 8 },
            ]
        );
        bitmap.clear_span(&spans[0]);
        assert!(!bitmap.is_set(5, 0));
        assert!(bitmap.is_set(70, 2) && bitmap.is_set(71, 2));
        assert_eq!(bitmap.count(), 2);
    }

    #[test]
    fn partial_last_word_counts_as_full() {
        let mut bitmap = UpdateBitmap::new(33, 1);
        bitmap.clear_all();
        bitmap.mark(32, 0);
        for x in 0..32 {
            bitmap.mark(x, 0);
        }
        assert!(bitmap.is_fully_dirty());
    }
}
