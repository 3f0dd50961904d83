//! K-way merge of N sorted streams.
//!
//! A manual min-heap merges N forward-only streams into one sorted
//! sequence. The comparator is a generic type parameter so each
//! instantiation monomorphizes and inlines it in the heap operations; on a
//! billion-record merge that indirection matters. Ties between streams
//! break toward the lower stream index, which keeps the merge stable when
//! the inputs were produced in order.

use std::cmp::Ordering;
use tilepress_core::error::Result;

/// A buffered, forward-only record stream that can be k-way merged.
pub trait MergeSource<R> {
    /// Current record without advancing; `None` when exhausted.
    fn peek(&self) -> Option<&R>;

    /// Advance past the current record, refilling from disk if needed.
    fn advance(&mut self) -> Result<()>;
}

/// Entry in the min-heap: a record plus which stream it came from.
struct HeapEntry<R> {
    record: R,
    stream_idx: usize,
}

/// K-way merge iterator over sorted streams.
pub struct KWayMerge<R, S, F>
where
    R: Copy,
    S: MergeSource<R>,
    F: Fn(&R, &R) -> Ordering,
{
    heap: Vec<HeapEntry<R>>,
    streams: Vec<S>,
    cmp: F,
}

impl<R, S, F> KWayMerge<R, S, F>
where
    R: Copy,
    S: MergeSource<R>,
    F: Fn(&R, &R) -> Ordering,
{
    /// Seed the heap with the first record of each non-empty stream.
    pub fn new(streams: Vec<S>, cmp: F) -> Self {
        let mut heap = Vec::with_capacity(streams.len());
        for (idx, stream) in streams.iter().enumerate() {
            if let Some(rec) = stream.peek() {
                heap.push(HeapEntry {
                    record: *rec,
                    stream_idx: idx,
                });
            }
        }

        let mut me = Self { heap, streams, cmp };
        if me.heap.len() > 1 {
            let last_internal = me.heap.len() / 2 - 1;
            for i in (0..=last_internal).rev() {
                me.sift_down(i);
            }
        }
        me
    }

    #[inline]
    fn heap_less(&self, i: usize, j: usize) -> bool {
        match (self.cmp)(&self.heap[i].record, &self.heap[j].record) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.heap[i].stream_idx < self.heap[j].stream_idx,
        }
    }

    #[inline]
    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && self.heap_less(right, left) {
                smallest = right;
            }
            if !self.heap_less(smallest, pos) {
                break;
            }
            self.heap.swap(pos, smallest);
            pos = smallest;
        }
    }

    #[inline]
    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.heap_less(pos, parent) {
                break;
            }
            self.heap.swap(pos, parent);
            pos = parent;
        }
    }

    /// Pop the next record in merge order.
    pub fn next(&mut self) -> Result<Option<R>> {
        if self.heap.is_empty() {
            return Ok(None);
        }

        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let entry = self.heap.pop().expect("heap non-empty");
        if !self.heap.is_empty() {
            self.sift_down(0);
        }

        let idx = entry.stream_idx;
        self.streams[idx].advance()?;
        if let Some(next) = self.streams[idx].peek() {
            let rec = *next;
            self.heap.push(HeapEntry {
                record: rec,
                stream_idx: idx,
            });
            let pos = self.heap.len() - 1;
            self.sift_up(pos);
        }

        Ok(Some(entry.record))
    }

    pub fn is_exhausted(&self) -> bool {
        self.heap.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSource {
        items: Vec<u64>,
        pos: usize,
    }

    impl MergeSource<u64> for VecSource {
        fn peek(&self) -> Option<&u64> {
            self.items.get(self.pos)
        }
        fn advance(&mut self) -> Result<()> {
            self.pos += 1;
            Ok(())
        }
    }

    fn src(items: Vec<u64>) -> VecSource {
        VecSource { items, pos: 0 }
    }

    #[test]
    fn test_merge_sorted_streams() {
        let streams = vec![src(vec![1, 4, 9]), src(vec![2, 3, 10]), src(vec![]), src(vec![5])];
        let mut merge = KWayMerge::new(streams, |a: &u64, b: &u64| a.cmp(b));
        let mut out = Vec::new();
        while let Some(v) = merge.next().unwrap() {
            out.push(v);
        }
        assert_eq!(out, vec![1, 2, 3, 4, 5, 9, 10]);
        assert!(merge.is_exhausted());
    }

    #[test]
    fn test_equal_records_come_from_lower_stream_first() {
        // Pairs (key, stream-tag); comparator looks only at the key.
        struct Tagged(Vec<(u64, usize)>, usize);
        impl MergeSource<(u64, usize)> for Tagged {
            fn peek(&self) -> Option<&(u64, usize)> {
                self.0.get(self.1)
            }
            fn advance(&mut self) -> Result<()> {
                self.1 += 1;
                Ok(())
            }
        }

        let streams = vec![
            Tagged(vec![(5, 0), (7, 0)], 0),
            Tagged(vec![(5, 1), (6, 1)], 0),
        ];
        let mut merge =
            KWayMerge::new(streams, |a: &(u64, usize), b: &(u64, usize)| a.0.cmp(&b.0));
        let mut out = Vec::new();
        while let Some(v) = merge.next().unwrap() {
            out.push(v);
        }
        assert_eq!(out, vec![(5, 0), (5, 1), (6, 1), (7, 0)]);
    }

    #[test]
    fn test_empty_merge() {
        let mut merge = KWayMerge::new(Vec::<VecSource>::new(), |a: &u64, b: &u64| a.cmp(b));
        assert!(merge.is_exhausted());
        assert_eq!(merge.next().unwrap(), None);
    }
}
