// Tape — Creation-ordered schedule of episode nodes
//
// Nodes are appended as they are built. Because a node can only reference
// earlier nodes, creation order is a topological order: forward walks the
// tape front to back, backward walks it back to front.
//
// The tape also remembers how far forward has already run (`cursor`), so
// extending a graph after `forward()` only schedules the new suffix.

/// Creation-ordered list of episode node indices.
#[derive(Debug, Default, Clone)]
pub struct Tape {
    entries: Vec<usize>,
    cursor: usize,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node in construction order.
    pub fn push(&mut self, index: usize) {
        self.entries.push(index);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position of the first entry forward has not visited.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Entries appended since the last completed forward pass.
    pub fn pending(&self) -> &[usize] {
        &self.entries[self.cursor..]
    }

    /// Whether every entry has been visited by forward.
    pub fn is_scheduled(&self) -> bool {
        self.cursor == self.entries.len()
    }

    /// Mark every current entry as visited by forward.
    pub fn advance(&mut self) {
        self.cursor = self.entries.len();
    }

    /// Schedule every entry again (values were invalidated).
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Entries in strict reverse creation order.
    pub fn reverse(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().rev().copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_tracks_extension() {
        let mut tape = Tape::new();
        tape.push(0);
        tape.push(1);
        assert_eq!(tape.pending(), &[0, 1]);
        tape.advance();
        assert!(tape.is_scheduled());
        tape.push(2);
        assert_eq!(tape.pending(), &[2]);
        assert!(!tape.is_scheduled());
    }

    #[test]
    fn test_reverse_order() {
        let mut tape = Tape::new();
        for i in 0..4 {
            tape.push(i);
        }
        let rev: Vec<usize> = tape.reverse().collect();
        assert_eq!(rev, vec![3, 2, 1, 0]);
        tape.clear();
        assert!(tape.is_empty());
        assert_eq!(tape.cursor(), 0);
    }
}
