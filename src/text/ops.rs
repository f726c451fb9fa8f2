//! Text operations and their transform rules.
//!
//! Two primitive operations exist, insert and delete, plus the split form a
//! delete takes after a concurrent insert lands inside its range. Transform
//! rewrites an operation to apply *after* a concurrent one; both sides of a
//! positional tie must be handed opposite concurrency ids.

use serde::{Deserialize, Serialize};

use crate::ot::{ApplyError, ConcurrencyId, Operation, OperationFlags};
use crate::text::chunk::TextChunk;
use crate::text::TextBuffer;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TextOperation {
    Insert {
        position: usize,
        chunk: TextChunk,
    },
    Delete {
        position: usize,
        chunk: TextChunk,
    },
    /// A delete torn in two by a concurrent insert inside its range. The
    /// second half's position is relative to the buffer after the first
    /// half has been applied.
    Split {
        first: Box<TextOperation>,
        second: Box<TextOperation>,
    },
}

impl TextOperation {
    pub fn insert(position: usize, chunk: TextChunk) -> Self {
        TextOperation::Insert { position, chunk }
    }

    pub fn delete(position: usize, chunk: TextChunk) -> Self {
        TextOperation::Delete { position, chunk }
    }

    /// An operation whose apply is the identity.
    pub fn noop() -> Self {
        TextOperation::Insert {
            position: 0,
            chunk: TextChunk::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        match self {
            TextOperation::Insert { chunk, .. } | TextOperation::Delete { chunk, .. } => {
                chunk.is_empty()
            }
            TextOperation::Split { first, second } => first.is_noop() && second.is_noop(),
        }
    }

    fn transform_insert_insert(
        position: usize,
        chunk: &TextChunk,
        against_pos: usize,
        against_len: usize,
        cid: Option<ConcurrencyId>,
    ) -> TextOperation {
        let shifted = against_pos < position
            || (against_pos == position && cid == Some(ConcurrencyId::Theirs));
        let position = if shifted {
            position + against_len
        } else {
            position
        };
        TextOperation::Insert {
            position,
            chunk: chunk.clone(),
        }
    }

    fn transform_insert_delete(
        position: usize,
        chunk: &TextChunk,
        del_pos: usize,
        del_len: usize,
    ) -> TextOperation {
        let position = if del_pos + del_len <= position {
            position - del_len
        } else if del_pos < position {
            // The insertion point itself was deleted.
            del_pos
        } else {
            position
        };
        TextOperation::Insert {
            position,
            chunk: chunk.clone(),
        }
    }

    fn transform_delete_insert(
        position: usize,
        chunk: &TextChunk,
        ins_pos: usize,
        ins_len: usize,
    ) -> TextOperation {
        let len = chunk.len();
        if ins_pos <= position {
            TextOperation::Delete {
                position: position + ins_len,
                chunk: chunk.clone(),
            }
        } else if ins_pos >= position + len {
            TextOperation::Delete {
                position,
                chunk: chunk.clone(),
            }
        } else {
            // The insertion landed inside the range: split around it.
            let head = ins_pos - position;
            TextOperation::Split {
                first: Box::new(TextOperation::Delete {
                    position,
                    chunk: chunk.substr(0, head),
                }),
                second: Box::new(TextOperation::Delete {
                    position: position + ins_len,
                    chunk: chunk.substr(head, len - head),
                }),
            }
        }
    }

    fn transform_delete_delete(
        position: usize,
        chunk: &TextChunk,
        against_pos: usize,
        against_len: usize,
    ) -> TextOperation {
        let len = chunk.len();
        if against_pos + against_len <= position {
            TextOperation::Delete {
                position: position - against_len,
                chunk: chunk.clone(),
            }
        } else if against_pos >= position + len {
            TextOperation::Delete {
                position,
                chunk: chunk.clone(),
            }
        } else {
            // Overlap: the shared part is already gone.
            let start = against_pos.max(position);
            let end = (against_pos + against_len).min(position + len);
            let mut remaining = chunk.substr(0, start - position);
            remaining.append(&chunk.substr(end - position, position + len - end));
            TextOperation::Delete {
                position: position.min(against_pos),
                chunk: remaining,
            }
        }
    }
}

fn flip(cid: Option<ConcurrencyId>) -> Option<ConcurrencyId> {
    cid.map(|c| match c {
        ConcurrencyId::Mine => ConcurrencyId::Theirs,
        ConcurrencyId::Theirs => ConcurrencyId::Mine,
    })
}

impl Operation for TextOperation {
    type Buffer = TextBuffer;

    fn need_concurrency_id(&self, against: &Self) -> bool {
        match (self, against) {
            (
                TextOperation::Insert { position: a, .. },
                TextOperation::Insert { position: b, .. },
            ) => a == b && self != against,
            _ => false,
        }
    }

    fn transform(&self, against: &Self, cid: Option<ConcurrencyId>) -> Self {
        // Transforming an operation against itself yields the identity;
        // a genuine concurrent tie carries a concurrency id instead.
        if cid.is_none() && self == against {
            return TextOperation::noop();
        }

        match (self, against) {
            // The split components are sequentially composed, so
            // transforming against them one after the other is exact.
            (_, TextOperation::Split { first, second }) => {
                self.transform(first, cid).transform(second, cid)
            }
            (TextOperation::Split { first, second }, _) => {
                let first_out = first.transform(against, cid);
                // Rebase `against` over our first half so the second half
                // meets it in the right coordinate space.
                let against_shifted = against.transform(first, flip(cid));
                let second_out = second.transform(&against_shifted, cid);
                TextOperation::Split {
                    first: Box::new(first_out),
                    second: Box::new(second_out),
                }
            }
            (
                TextOperation::Insert { position, chunk },
                TextOperation::Insert {
                    position: against_pos,
                    chunk: against_chunk,
                },
            ) => Self::transform_insert_insert(
                *position,
                chunk,
                *against_pos,
                against_chunk.len(),
                cid,
            ),
            (
                TextOperation::Insert { position, chunk },
                TextOperation::Delete {
                    position: against_pos,
                    chunk: against_chunk,
                },
            ) => Self::transform_insert_delete(*position, chunk, *against_pos, against_chunk.len()),
            (
                TextOperation::Delete { position, chunk },
                TextOperation::Insert {
                    position: against_pos,
                    chunk: against_chunk,
                },
            ) => Self::transform_delete_insert(*position, chunk, *against_pos, against_chunk.len()),
            (
                TextOperation::Delete { position, chunk },
                TextOperation::Delete {
                    position: against_pos,
                    chunk: against_chunk,
                },
            ) => Self::transform_delete_delete(*position, chunk, *against_pos, against_chunk.len()),
        }
    }

    fn apply(&self, buffer: &mut TextBuffer) -> Result<(), ApplyError> {
        match self {
            TextOperation::Insert { position, chunk } => buffer.insert(*position, chunk),
            TextOperation::Delete { position, chunk } => buffer.erase(*position, chunk),
            TextOperation::Split { first, second } => {
                first.apply(buffer)?;
                second.apply(buffer)
            }
        }
    }

    fn revert(&self) -> Self {
        match self {
            TextOperation::Insert { position, chunk } => TextOperation::Delete {
                position: *position,
                chunk: chunk.clone(),
            },
            TextOperation::Delete { position, chunk } => TextOperation::Insert {
                position: *position,
                chunk: chunk.clone(),
            },
            // Inverses compose in reverse order.
            TextOperation::Split { first, second } => TextOperation::Split {
                first: Box::new(second.revert()),
                second: Box::new(first.revert()),
            },
        }
    }

    fn flags(&self) -> OperationFlags {
        OperationFlags::AFFECTS_BUFFER | OperationFlags::REVERSIBLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, author: &str) -> TextChunk {
        TextChunk::from_text(text, author)
    }

    fn buffer(text: &str) -> TextBuffer {
        TextBuffer::from_chunk(chunk(text, "init"))
    }

    /// Apply a concurrent pair in both orders and require convergence.
    fn converge(initial: &str, a: TextOperation, b: TextOperation) -> String {
        let (cid_a, cid_b) = if a.need_concurrency_id(&b) {
            (Some(ConcurrencyId::Mine), Some(ConcurrencyId::Theirs))
        } else {
            (None, None)
        };

        let mut left = buffer(initial);
        a.apply(&mut left).unwrap();
        b.transform(&a, cid_b).apply(&mut left).unwrap();

        let mut right = buffer(initial);
        b.apply(&mut right).unwrap();
        a.transform(&b, cid_a).apply(&mut right).unwrap();

        assert_eq!(left.text(), right.text());
        left.text()
    }

    #[test]
    fn test_insert_vs_insert_tie_break() {
        let out = converge(
            "abc",
            TextOperation::insert(1, chunk("X", "a")),
            TextOperation::insert(1, chunk("Y", "b")),
        );
        assert_eq!(out, "aXYbc");
    }

    #[test]
    fn test_insert_vs_delete_inside() {
        let out = converge(
            "abcd",
            TextOperation::insert(2, chunk("X", "a")),
            TextOperation::delete(1, chunk("bc", "init")),
        );
        assert_eq!(out, "aXd");
    }

    #[test]
    fn test_delete_vs_insert_splits() {
        let del = TextOperation::delete(1, chunk("bc", "init"));
        let ins = TextOperation::insert(2, chunk("X", "a"));
        let transformed = del.transform(&ins, None);
        match &transformed {
            TextOperation::Split { first, second } => {
                assert_eq!(
                    **first,
                    TextOperation::delete(1, chunk("b", "init"))
                );
                assert_eq!(
                    **second,
                    TextOperation::delete(2, chunk("c", "init"))
                );
            }
            other => panic!("expected split, got {other:?}"),
        }
        converge("abcd", del, ins);
    }

    #[test]
    fn test_delete_vs_delete_overlap() {
        let out = converge(
            "abcd",
            TextOperation::delete(0, chunk("ab", "init")),
            TextOperation::delete(1, chunk("bc", "init")),
        );
        assert_eq!(out, "d");
    }

    #[test]
    fn test_delete_vs_delete_full_cover() {
        let out = converge(
            "abcd",
            TextOperation::delete(0, chunk("abcd", "init")),
            TextOperation::delete(1, chunk("bc", "init")),
        );
        assert_eq!(out, "");
    }

    #[test]
    fn test_insert_at_delete_start_stays_put() {
        let out = converge(
            "ab",
            TextOperation::insert(0, chunk("X", "a")),
            TextOperation::delete(0, chunk("a", "init")),
        );
        assert_eq!(out, "Xb");
    }

    #[test]
    fn test_transform_against_self_is_noop() {
        let op = TextOperation::insert(1, chunk("X", "a"));
        let t = op.transform(&op.clone(), None);
        assert!(t.is_noop());

        let del = TextOperation::delete(0, chunk("a", "init"));
        let t = del.transform(&del.clone(), None);
        assert!(t.is_noop());
        let mut buf = buffer("abc");
        t.apply(&mut buf).unwrap();
        assert_eq!(buf.text(), "abc");
    }

    #[test]
    fn test_insert_then_revert_restores_author_tags() {
        let mut buf = buffer("ab");
        let op = TextOperation::insert(1, chunk("XY", "alice"));
        op.apply(&mut buf).unwrap();
        assert_eq!(buf.text(), "aXYb");
        op.revert().apply(&mut buf).unwrap();
        assert_eq!(buf.text(), "ab");
        assert_eq!(buf.chunk().segments().len(), 1);
        assert_eq!(buf.chunk().segments()[0].author, "init");
    }

    #[test]
    fn test_revert_of_split_reverses_order() {
        let del = TextOperation::delete(1, chunk("bc", "init"));
        let ins = TextOperation::insert(2, chunk("X", "a"));
        let split = del.transform(&ins, None);

        let mut buf = buffer("abcd");
        ins.apply(&mut buf).unwrap();
        split.apply(&mut buf).unwrap();
        assert_eq!(buf.text(), "aXd");
        split.revert().apply(&mut buf).unwrap();
        assert_eq!(buf.text(), "abXcd");
    }

    #[test]
    fn test_wire_round_trip() {
        let op = TextOperation::delete(3, chunk("abc", "alice"));
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "delete");
        let back: TextOperation = serde_json::from_value(value).unwrap();
        assert_eq!(op, back);
    }
}
