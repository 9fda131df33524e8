//! Size-based windows over the dependency-ordered operation list.
//!
//! Chunks bound how much work is in flight per step and give progress its
//! granularity. They carry no dependency awareness.

/// Splits `items` into contiguous chunks of `chunk_size`. Only the last chunk
/// may be shorter. A `chunk_size` of 0 is treated as 1.
pub fn chunks<T>(items: &[T], chunk_size: usize) -> std::slice::Chunks<'_, T> {
    items.chunks(chunk_size.max(1))
}

/// Owned variant of [`chunks`], moving the items into per-chunk vectors.
pub fn into_chunks<T>(items: Vec<T>, chunk_size: usize) -> Vec<Vec<T>> {
    let size = chunk_size.max(1);
    let mut out = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() == size {
            out.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn last_chunk_holds_remainder() {
        let sizes: Vec<usize> = into_chunks((0..23).collect(), 10)
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes, vec![10, 10, 3]);
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(into_chunks(Vec::<u8>::new(), 10).is_empty());
        assert_eq!(chunks(&[] as &[u8], 10).count(), 0);
    }

    #[test]
    fn zero_chunk_size_behaves_as_one() {
        assert_eq!(into_chunks(vec![1, 2, 3], 0).len(), 3);
    }

    proptest! {
        #[test]
        fn chunks_partition_input_in_order(
            items in proptest::collection::vec(any::<u32>(), 0..200),
            size in 1usize..25,
        ) {
            let owned = into_chunks(items.clone(), size);
            let flat: Vec<u32> = owned.iter().flatten().copied().collect();
            prop_assert_eq!(&flat, &items);

            for (i, chunk) in owned.iter().enumerate() {
                prop_assert!(!chunk.is_empty());
                prop_assert!(chunk.len() <= size);
                if i + 1 < owned.len() {
                    prop_assert_eq!(chunk.len(), size);
                }
            }

            let borrowed: Vec<&[u32]> = chunks(&items, size).collect();
            prop_assert_eq!(borrowed.len(), owned.len());
        }
    }
}
