use std::sync::{Mutex, PoisonError};

/// One append-only bucket per thread; merged in thread order once writers are done.
#[derive(Debug)]
pub struct ThreadedVector<T> {
    buckets: Vec<Mutex<Vec<T>>>,
}

impl<T> Default for ThreadedVector<T> {
    fn default() -> Self {
        Self {
            buckets: Vec::new(),
        }
    }
}

impl<T> ThreadedVector<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty every bucket and make sure there is one per thread.
    pub fn clear(&mut self, num_threads: usize) {
        self.buckets.resize_with(num_threads.max(1), || Mutex::new(Vec::new()));
        for bucket in &mut self.buckets {
            bucket.get_mut().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }

    /// Append to the caller's bucket and return the element's index inside it.
    pub fn insert(&self, thread_index: usize, value: T) -> usize {
        let Some(bucket) = self.buckets.get(thread_index).or_else(|| self.buckets.last()) else {
            log::warn!("Dropped insert from thread {} into a threaded vector with no buckets", thread_index);
            return 0;
        };
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.push(value);
        bucket.len() - 1
    }

    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move every element out, bucket by bucket.
    pub fn take_merged(&mut self) -> Vec<T> {
        let mut merged = Vec::new();
        for bucket in &mut self.buckets {
            merged.append(bucket.get_mut().unwrap_or_else(PoisonError::into_inner));
        }
        merged
    }

    pub fn for_each(&mut self, mut f: impl FnMut(usize, usize, &mut T)) {
        for (thread_index, bucket) in self.buckets.iter_mut().enumerate() {
            let bucket = bucket.get_mut().unwrap_or_else(PoisonError::into_inner);
            for (element_index, value) in bucket.iter_mut().enumerate() {
                f(thread_index, element_index, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_returns_per_bucket_index() {
        let mut vector = ThreadedVector::new();
        vector.clear(3);
        assert_eq!(vector.insert(1, 'a'), 0);
        assert_eq!(vector.insert(1, 'b'), 1);
        assert_eq!(vector.insert(0, 'c'), 0);
        assert_eq!(vector.len(), 3);

        let mut seen = Vec::new();
        vector.for_each(|thread, index, value| seen.push((thread, index, *value)));
        assert_eq!(seen, vec![(0, 0, 'c'), (1, 0, 'a'), (1, 1, 'b')]);

        assert_eq!(vector.take_merged(), vec!['c', 'a', 'b']);
        assert!(vector.is_empty());
    }

    #[test]
    fn unsized_vector_drops_inserts() {
        let vector = ThreadedVector::new();
        vector.insert(0, 1u32);
        assert!(vector.is_empty());

        let mut vector = ThreadedVector::new();
        vector.clear(2);
        assert_eq!(vector.insert(5, 1u32), 0);
        assert_eq!(vector.take_merged(), vec![1]);
    }
}
