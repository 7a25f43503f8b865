use crate::error::Error;

use super::DynArray;

/// How many bytes to grow by when none was asked for.
pub const DEFAULT_INCREMENT: usize = 2048;

/// What ends a line when no delimiters are given.
pub const DEFAULT_DELIMITERS: &[u8] = b"\n";

/// A growable byte store used to accumulate text and hand it back line by line.
///
/// Bytes may be appended or inserted at any offset.
/// Lines are found by scanning for a delimiter, a NUL byte always counts as one.
#[derive(Debug, Clone)]
pub struct LineStore {
    bytes: DynArray<u8>,
}

impl Default for LineStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A complete line found in a [`LineStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Line<'a> {
    /// The line without its delimiter.
    pub text: &'a [u8],

    /// The line including its delimiter.
    /// Its length is what to [`LineStore::consume`] to get rid of the line.
    pub raw: &'a [u8],
}

impl<'a> Line<'a> {
    /// How many bytes of the store this line spans, delimiter included.
    pub fn span(&self) -> usize {
        self.raw.len()
    }
}

/// A cursor over the lines of a [`LineStore`].
///
/// As an [`Iterator`] lines are delimited by [`DEFAULT_DELIMITERS`].
#[derive(Debug, Clone)]
pub struct Lines<'a> {
    store: &'a LineStore,
    offset: usize,
}

impl<'a> Lines<'a> {
    /// Find the next line ending in any of `delimiters` (or NUL).
    ///
    /// Returns `None` if what remains holds no delimiter,
    /// i.e. the last line is not complete yet.
    /// The cursor is then left where it was.
    pub fn next_with(&mut self, delimiters: &[u8]) -> Option<Line<'a>> {
        let delimiters = if delimiters.is_empty() {
            DEFAULT_DELIMITERS
        } else {
            delimiters
        };

        let rest = self.remaining();
        let position = rest
            .iter()
            .position(|byte| *byte == 0 || delimiters.contains(byte))?;

        self.offset += position + 1;

        Some(Line {
            text: &rest[..position],
            raw: &rest[..=position],
        })
    }

    /// Where the cursor is, counted from the start of the store.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The bytes after the cursor.
    pub fn remaining(&self) -> &'a [u8] {
        &self.store.as_bytes()[self.offset.min(self.store.len())..]
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = Line<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_with(DEFAULT_DELIMITERS)
    }
}

impl LineStore {
    /// A new store growing by [`DEFAULT_INCREMENT`] bytes at a time.
    pub fn new() -> Self {
        Self::with_increment(DEFAULT_INCREMENT)
    }

    /// A new store growing by `increment` bytes at a time.
    pub fn with_increment(increment: usize) -> Self {
        Self {
            bytes: DynArray::with_increment(increment),
        }
    }

    /// Bytes stored.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes storage has been allocated for.
    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }

    /// Everything stored.
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    /// Insert `value` at offset `at`, or append it if `at` is at or past the end.
    /// Returns how many bytes were stored.
    pub fn store(&mut self, value: &[u8], at: usize) -> Result<usize, Error> {
        let at = at.min(self.bytes.len());
        self.bytes.insert_slice(at, value)
    }

    /// Add `value` to the end.
    pub fn append(&mut self, value: &[u8]) -> Result<usize, Error> {
        self.store(value, usize::MAX)
    }

    /// Add the bytes of `value` to the end.
    pub fn store_str(&mut self, value: &str) -> Result<usize, Error> {
        self.append(value.as_bytes())
    }

    /// A cursor at the start of the store.
    pub fn iter(&self) -> Lines<'_> {
        Lines {
            store: self,
            offset: 0,
        }
    }

    /// The first complete line, if there is one.
    pub fn next_line(&self) -> Option<Line<'_>> {
        self.iter().next()
    }

    /// Drop `count` bytes from the front, moving the rest down.
    /// Dropping at least everything simply empties the store.
    pub fn consume(&mut self, count: usize) {
        if count >= self.bytes.len() {
            self.bytes.clear();
        } else {
            self.bytes.remove_front(count);
        }
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Overwrite every delimiter (and NUL) with NUL, in place.
    /// Returns how many were found, which is the number of terminated segments.
    pub fn split(&mut self, delimiters: &[u8]) -> usize {
        let delimiters = if delimiters.is_empty() {
            DEFAULT_DELIMITERS
        } else {
            delimiters
        };

        let mut count = 0;
        for byte in self.bytes.iter_mut() {
            if *byte == 0 || delimiters.contains(byte) {
                *byte = 0;
                count += 1;
            }
        }

        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORDS: &[&str] = &[
        "This", " ", "", "is", " ", "a", " ", "", "test", " ", "somewhat", " ", "long", " ",
        "list", " ", "of", " ", "words", ".\n",
    ];

    fn fill(store: &mut LineStore, at_least: usize) {
        let start = store.len();
        let mut stored = 0;

        for word in WORDS.iter().cycle() {
            if stored >= at_least {
                break;
            }
            assert_eq!(store.store_str(word).unwrap(), word.len());
            stored += word.len();
            assert_eq!(store.len(), start + stored);
        }
    }

    #[test]
    fn grows_in_increments() {
        let mut store = LineStore::with_increment(128);
        assert_eq!(store.capacity(), 128);

        fill(&mut store, 1);
        assert_eq!(store.len(), 4);
        assert_eq!(store.capacity(), 128);

        fill(&mut store, 128);
        assert_eq!(store.capacity(), 256);

        fill(&mut store, 256);
        assert_eq!(store.capacity(), 512);
    }

    #[test]
    fn lines_reproduce_what_was_stored() {
        let mut store = LineStore::with_increment(128);
        fill(&mut store, 128);

        let sentence = WORDS.concat();
        let mut lines = store.iter();
        let mut count = 0;

        for line in lines.by_ref() {
            assert_eq!(line.raw, sentence.as_bytes());
            assert_eq!(line.text, sentence.trim_end_matches('\n').as_bytes());
            count += 1;
        }

        assert!(count >= 2);
        // The tail has no newline yet
        assert!(!lines.remaining().is_empty());
        assert!(sentence.as_bytes().starts_with(lines.remaining()));
        assert_eq!(lines.offset(), count * sentence.len());
    }

    #[test]
    fn commands_come_out_one_at_a_time() {
        let mut store = LineStore::new();
        store.append(b"cmd1\ncmd2\n").unwrap();

        let lines: Vec<_> = store.iter().map(|line| line.text).collect();
        assert_eq!(lines, vec![&b"cmd1"[..], &b"cmd2"[..]]);

        let first = store.next_line().unwrap().span();
        store.consume(first);
        assert_eq!(store.as_bytes(), b"cmd2\n");
    }

    #[test]
    fn incomplete_line_is_not_returned() {
        let mut store = LineStore::new();
        store.append(b"partial").unwrap();

        let mut lines = store.iter();
        assert!(lines.next().is_none());
        assert_eq!(lines.offset(), 0);

        store.append(b" command\n").unwrap();
        assert_eq!(store.next_line().unwrap().text, b"partial command");
    }

    #[test]
    fn any_delimiter_or_nul_ends_a_line() {
        let mut store = LineStore::new();
        store.append(b"a;b\0c\r").unwrap();

        let mut lines = store.iter();
        assert_eq!(lines.next_with(b";\r").unwrap().text, b"a");
        assert_eq!(lines.next_with(b";\r").unwrap().text, b"b");
        assert_eq!(lines.next_with(b";\r").unwrap().raw, b"c\r");
        assert!(lines.next_with(b";\r").is_none());
    }

    #[test]
    fn store_inserts_in_the_middle() {
        let mut store = LineStore::new();
        store.store_str("hello\n").unwrap();
        store.store(b" world", 5).unwrap();
        store.store(b"!", 1000).unwrap();

        assert_eq!(store.as_bytes(), b"hello world\n!");
    }

    #[test]
    fn split_counts_segments_and_ends_iteration() {
        let mut store = LineStore::with_increment(128);
        fill(&mut store, 128);

        let lines = store.iter().count();
        assert_eq!(store.split(b"\n"), lines);

        // Nothing but NULs and text left, each NUL ends a segment
        assert!(store.as_bytes().iter().all(|byte| *byte != b'\n'));
        assert_eq!(store.split(b"\n"), lines);
    }

    #[test]
    fn consume_compacts() {
        let mut store = LineStore::with_increment(128);
        fill(&mut store, 128);
        let before = store.len();

        store.consume(64);
        assert_eq!(store.len(), before - 64);
        assert_eq!(store.capacity(), 256);

        store.consume(usize::MAX);
        assert!(store.is_empty());

        store.store_str("x").unwrap();
        store.clear();
        assert!(store.is_empty());
    }
}
