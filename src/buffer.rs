//! In-memory record batch limited by consumed input bytes.

use std::cmp::Ordering;

use rayon;

/// Compares two optional slots. An absent slot is never less than anything, a present record is always less
/// than an absent one, two present records are compared using `compare`.
pub fn slot_less<T, F>(a: Option<&T>, b: Option<&T>, compare: F) -> bool
where
    F: Fn(&T, &T) -> Ordering,
{
    match (a, b) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(a), Some(b)) => compare(a, b) == Ordering::Less,
    }
}

/// Batch of records accumulated before being spilled to a chunk.
///
/// The batch is limited by the total length of the input lines its records were parsed from, not by the
/// in-memory size of the records themselves. The batch is reused between chunks: [`RecordBatch::clear`] keeps
/// the allocated capacity.
pub struct RecordBatch<T> {
    limit: u64,
    current_size: u64,
    inner: Vec<T>,
}

impl<T> RecordBatch<T> {
    pub fn new(limit: u64) -> Self {
        RecordBatch {
            limit,
            current_size: 0,
            inner: Vec::new(),
        }
    }

    /// Adds a record parsed from a line of `line_len` bytes.
    pub fn push(&mut self, item: T, line_len: usize) {
        self.current_size += line_len as u64;
        self.inner.push(item);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Checks if the accumulated line bytes reached the limit.
    pub fn is_full(&self) -> bool {
        self.current_size >= self.limit
    }

    pub fn mem_size(&self) -> u64 {
        self.current_size
    }

    pub fn swap(&mut self, i: usize, j: usize) {
        self.inner.swap(i, j);
    }

    /// Checks whether the record at position `i` is less than the one at `j`. Positions outside of the batch are
    /// treated as absent slots (see [`slot_less`]).
    pub fn less<F>(&self, i: usize, j: usize, compare: F) -> bool
    where
        F: Fn(&T, &T) -> Ordering,
    {
        slot_less(self.inner.get(i), self.inner.get(j), compare)
    }

    pub fn as_slice(&self) -> &[T] {
        self.inner.as_slice()
    }

    /// Drops all records and resets the consumed size. Allocated capacity is kept.
    pub fn clear(&mut self) {
        self.inner.clear();
        self.current_size = 0;
    }
}

impl<T: Send> rayon::slice::ParallelSliceMut<T> for RecordBatch<T> {
    fn as_parallel_slice_mut(&mut self) -> &mut [T] {
        self.inner.as_mut_slice()
    }
}
