//! Order-preserving batch partitioning.

/// Largest batch the export pipeline accepts.
pub const MAX_BATCH_SIZE: usize = 100;

/// An ordered slice of items plus its position in the run.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    /// Zero-based sequence index.
    pub index: usize,
    /// Offset of the first item in the original input.
    pub offset: usize,
    pub items: Vec<T>,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Split `items` into batches of at most `size`, preserving order.
///
/// `size` is clamped to `1..=MAX_BATCH_SIZE`. An empty input yields no
/// batches.
pub fn partition<T>(items: Vec<T>, size: usize) -> Vec<Batch<T>> {
    let size = size.clamp(1, MAX_BATCH_SIZE);
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    let mut offset = 0;
    while iter.peek().is_some() {
        let chunk: Vec<T> = iter.by_ref().take(size).collect();
        let len = chunk.len();
        batches.push(Batch {
            index: batches.len(),
            offset,
            items: chunk,
        });
        offset += len;
    }
    batches
}
