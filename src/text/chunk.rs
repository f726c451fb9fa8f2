//! Author-tagged text chunks.
//!
//! A chunk is a sequence of utf-8 codepoints where every position carries
//! the account id of its author, stored as runs of same-author text. All
//! positions and lengths are in codepoints, not bytes.

use serde::{Deserialize, Serialize};

/// A run of consecutive characters by one author.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Segment {
    pub author: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TextChunk {
    segments: Vec<Segment>,
}

impl TextChunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: &str, author: &str) -> Self {
        let mut chunk = TextChunk::new();
        chunk.push(author, text);
        chunk
    }

    /// Length in codepoints.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.text.chars().count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Append a run, coalescing with the last segment when the author
    /// matches.
    pub fn push(&mut self, author: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(last) = self.segments.last_mut() {
            if last.author == author {
                last.text.push_str(text);
                return;
            }
        }
        self.segments.push(Segment {
            author: author.to_string(),
            text: text.to_string(),
        });
    }

    pub fn append(&mut self, other: &TextChunk) {
        for seg in &other.segments {
            self.push(&seg.author, &seg.text);
        }
    }

    /// Split at `pos` codepoints, returning the tail. `pos` must be
    /// `<= len()`.
    pub fn split_off(&mut self, pos: usize) -> TextChunk {
        let mut remaining = pos;
        let mut tail = TextChunk::new();
        let mut head: Vec<Segment> = Vec::new();

        for seg in self.segments.drain(..) {
            if tail.is_empty() {
                let seg_len = seg.text.chars().count();
                if remaining >= seg_len {
                    remaining -= seg_len;
                    head.push(seg);
                    continue;
                }
                let byte_at = seg
                    .text
                    .char_indices()
                    .nth(remaining)
                    .map(|(i, _)| i)
                    .unwrap_or(seg.text.len());
                if byte_at > 0 {
                    head.push(Segment {
                        author: seg.author.clone(),
                        text: seg.text[..byte_at].to_string(),
                    });
                }
                tail.push(&seg.author, &seg.text[byte_at..]);
                remaining = 0;
            } else {
                tail.push(&seg.author, &seg.text);
            }
        }

        self.segments = head;
        tail
    }

    /// Insert `other` at `pos` codepoints. `pos` must be `<= len()`.
    pub fn insert(&mut self, pos: usize, other: &TextChunk) {
        let tail = self.split_off(pos);
        self.append(other);
        self.append(&tail);
    }

    /// Remove `len` codepoints starting at `pos`, returning the removed
    /// content with its author tags.
    pub fn erase(&mut self, pos: usize, len: usize) -> TextChunk {
        let tail = self.split_off(pos + len);
        let removed = self.split_off(pos);
        self.append(&tail);
        removed
    }

    /// Copy of `[pos, pos + len)`.
    pub fn substr(&self, pos: usize, len: usize) -> TextChunk {
        let mut out = TextChunk::new();
        let mut skip = pos;
        let mut take = len;
        for seg in &self.segments {
            if take == 0 {
                break;
            }
            let seg_len = seg.text.chars().count();
            if skip >= seg_len {
                skip -= seg_len;
                continue;
            }
            let start_byte = seg
                .text
                .char_indices()
                .nth(skip)
                .map(|(i, _)| i)
                .unwrap_or(seg.text.len());
            let available = seg_len - skip;
            let taking = take.min(available);
            let end_byte = seg
                .text
                .char_indices()
                .nth(skip + taking)
                .map(|(i, _)| i)
                .unwrap_or(seg.text.len());
            out.push(&seg.author, &seg.text[start_byte..end_byte]);
            take -= taking;
            skip = 0;
        }
        out
    }

    /// The text without author tags.
    pub fn text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    fn char_authors(&self) -> impl Iterator<Item = (char, &str)> {
        self.segments
            .iter()
            .flat_map(|s| s.text.chars().map(move |c| (c, s.author.as_str())))
    }
}

/// Chunks compare by per-character content and author, independent of how
/// the runs happen to be segmented.
impl PartialEq for TextChunk {
    fn eq(&self, other: &Self) -> bool {
        self.char_authors().eq(other.char_authors())
    }
}

impl Eq for TextChunk {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_coalesces_same_author() {
        let mut chunk = TextChunk::new();
        chunk.push("a", "hel");
        chunk.push("a", "lo");
        chunk.push("b", "!");
        assert_eq!(chunk.segments().len(), 2);
        assert_eq!(chunk.text(), "hello!");
        assert_eq!(chunk.len(), 6);
    }

    #[test]
    fn test_insert_splits_segments() {
        let mut chunk = TextChunk::from_text("abcd", "a");
        chunk.insert(2, &TextChunk::from_text("XY", "b"));
        assert_eq!(chunk.text(), "abXYcd");
        assert_eq!(chunk.segments().len(), 3);
    }

    #[test]
    fn test_erase_returns_removed_with_tags() {
        let mut chunk = TextChunk::from_text("ab", "a");
        chunk.append(&TextChunk::from_text("cd", "b"));
        let removed = chunk.erase(1, 2);
        assert_eq!(chunk.text(), "ad");
        assert_eq!(removed.text(), "bc");
        assert_eq!(removed.segments()[0].author, "a");
        assert_eq!(removed.segments()[1].author, "b");
    }

    #[test]
    fn test_equality_ignores_segmentation() {
        let mut a = TextChunk::new();
        a.push("x", "ab");
        let mut b = TextChunk::new();
        b.push("x", "a");
        // Force a second segment with the same author via a detour.
        b.append(&TextChunk::from_text("b", "x"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_substr_multibyte() {
        let chunk = TextChunk::from_text("aöüb", "a");
        let sub = chunk.substr(1, 2);
        assert_eq!(sub.text(), "öü");
        assert_eq!(sub.len(), 2);
    }

    #[test]
    fn test_split_off_at_boundaries() {
        let mut chunk = TextChunk::from_text("abc", "a");
        let tail = chunk.split_off(3);
        assert!(tail.is_empty());
        assert_eq!(chunk.text(), "abc");

        let mut chunk = TextChunk::from_text("abc", "a");
        let tail = chunk.split_off(0);
        assert!(chunk.is_empty());
        assert_eq!(tail.text(), "abc");
    }
}
