//! Sampler
//!
//! Orderings of an index set for one pass, and the slicing of that ordering into
//! mini-batches.
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::ops::Range;

// A sampler decides the order in which one pass visits an index set.
pub trait Sampler {
    /// Return every element of `index` exactly once, in visiting order.
    fn order(&mut self, rng: &mut StdRng, index: &[usize]) -> Vec<usize>;
}

/// Ascending sample ids.
pub struct SortedSampler;

impl Sampler for SortedSampler {
    fn order(&mut self, _rng: &mut StdRng, index: &[usize]) -> Vec<usize> {
        let mut order = index.to_vec();
        order.sort_unstable();
        order
    }
}

/// A fresh random permutation every pass.
pub struct ShuffleSampler;

impl Sampler for ShuffleSampler {
    fn order(&mut self, rng: &mut StdRng, index: &[usize]) -> Vec<usize> {
        let mut order = index.to_vec();
        order.shuffle(rng);
        order
    }
}

/// Contiguous batch ranges over `n` positions.
///
/// `n / batch_size + 1` slices are cut, the last one shorter. When `n` is an exact
/// multiple of `batch_size` that last slice would be empty and is dropped, so every
/// returned range holds between 1 and `batch_size` positions.
pub fn batch_ranges(n: usize, batch_size: usize) -> Vec<Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..n / batch_size + 1)
        .map(|i| {
            let start = i * batch_size;
            let end = usize::min(batch_size * (i + 1), n);
            start..end
        })
        .filter(|r| !r.is_empty())
        .collect()
}
