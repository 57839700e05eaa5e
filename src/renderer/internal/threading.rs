use log::info;

/// Fixed pool of worker threads plus the calling thread.
///
/// Thread index 0 is the caller; workers are `1..num_threads()`.
pub struct WorkQueue {
    pool: rayon::ThreadPool,
    num_workers: usize,
}

impl WorkQueue {
    /// `num_workers == 0` picks one less than the available parallelism.
    pub fn new(num_workers: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let num_workers = if num_workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get().saturating_sub(1))
                .unwrap_or(1)
                .max(1)
        } else {
            num_workers
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|index| format!("scene-worker-{index}"))
            .build()?;
        info!("Created work queue with {} worker threads", num_workers);

        Ok(Self { pool, num_workers })
    }

    pub fn num_threads(&self) -> usize {
        self.num_workers + 1
    }

    pub fn thread_index(&self) -> usize {
        self.pool.current_thread_index().map_or(0, |index| index + 1)
    }

    /// Split `items` into chunks of at least `threshold` and run `f(thread, offset, chunk)`
    /// on each. Small inputs run inline on the caller.
    pub fn for_each_parallel<T, F>(&self, threshold: usize, items: &[T], f: F)
    where
        T: Sync,
        F: Fn(usize, usize, &[T]) + Sync,
    {
        if items.is_empty() {
            return;
        }
        let chunk_size = self.chunk_size(threshold, items.len());
        if items.len() <= chunk_size {
            f(self.thread_index(), 0, items);
            return;
        }

        let f = &f;
        self.pool.scope(|scope| {
            for (chunk_index, chunk) in items.chunks(chunk_size).enumerate() {
                scope.spawn(move |_| f(self.thread_index(), chunk_index * chunk_size, chunk));
            }
        });
    }

    pub fn for_each_parallel_mut<T, F>(&self, threshold: usize, items: &mut [T], f: F)
    where
        T: Send,
        F: Fn(usize, usize, &mut [T]) + Sync,
    {
        if items.is_empty() {
            return;
        }
        let chunk_size = self.chunk_size(threshold, items.len());
        if items.len() <= chunk_size {
            f(self.thread_index(), 0, items);
            return;
        }

        let f = &f;
        self.pool.scope(|scope| {
            for (chunk_index, chunk) in items.chunks_mut(chunk_size).enumerate() {
                scope.spawn(move |_| f(self.thread_index(), chunk_index * chunk_size, chunk));
            }
        });
    }

    /// Order-preserving parallel map.
    pub fn map_parallel<T, U, F>(&self, threshold: usize, items: &[T], f: F) -> Vec<U>
    where
        T: Sync,
        U: Send,
        F: Fn(usize, &T) -> U + Sync,
    {
        let mut output: Vec<Option<U>> = std::iter::repeat_with(|| None).take(items.len()).collect();
        self.for_each_parallel_mut(threshold, &mut output, |thread, offset, chunk| {
            for (slot, item) in chunk.iter_mut().zip(&items[offset..]) {
                *slot = Some(f(thread, item));
            }
        });
        output.into_iter().flatten().collect()
    }

    fn chunk_size(&self, threshold: usize, len: usize) -> usize {
        threshold.max(1).max(len.div_ceil(self.num_threads()))
    }
}

type Task<'a> = Box<dyn FnOnce(usize) + Send + 'a>;

/// Prioritized batch of borrowed tasks, completed as a barrier.
#[derive(Default)]
pub struct TaskQueue<'a> {
    tasks: Vec<(u32, Task<'a>)>,
}

impl<'a> TaskQueue<'a> {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn post(&mut self, priority: u32, task: impl FnOnce(usize) + Send + 'a) {
        self.tasks.push((priority, Box::new(task)));
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Run every task with `priority >= min_priority` and wait for all of them.
    pub fn complete(&mut self, queue: &WorkQueue, min_priority: u32) {
        let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.tasks)
            .into_iter()
            .partition(|(priority, _)| *priority >= min_priority);
        self.tasks = rest;

        match ready.len() {
            0 => {}
            1 => {
                for (_, task) in ready {
                    task(queue.thread_index());
                }
            }
            _ => queue.pool.scope(|scope| {
                for (_, task) in ready {
                    scope.spawn(move |_| task(queue.thread_index()));
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn for_each_parallel_visits_every_item_once() {
        let queue = WorkQueue::new(3).expect("pool");
        let items: Vec<usize> = (0..1000).collect();
        let sum = AtomicUsize::new(0);
        let visited = AtomicUsize::new(0);
        queue.for_each_parallel(16, &items, |thread, offset, chunk| {
            assert!(thread < queue.num_threads());
            assert_eq!(items[offset], chunk[0]);
            visited.fetch_add(chunk.len(), Ordering::Relaxed);
            sum.fetch_add(chunk.iter().sum::<usize>(), Ordering::Relaxed);
        });
        assert_eq!(visited.load(Ordering::Relaxed), 1000);
        assert_eq!(sum.load(Ordering::Relaxed), 999 * 1000 / 2);
    }

    #[test]
    fn map_parallel_preserves_order() {
        let queue = WorkQueue::new(4).expect("pool");
        let items: Vec<u32> = (0..257).collect();
        let doubled = queue.map_parallel(8, &items, |_, value| value * 2);
        assert_eq!(doubled, items.iter().map(|v| v * 2).collect::<Vec<_>>());
    }

    #[test]
    fn task_queue_runs_only_ready_priorities() {
        let queue = WorkQueue::new(2).expect("pool");
        let mut results = vec![0u32; 4];
        {
            let mut tasks = TaskQueue::new();
            for (index, slot) in results.iter_mut().enumerate() {
                tasks.post(index as u32, move |_| *slot = index as u32 + 10);
            }
            tasks.complete(&queue, 2);
            assert_eq!(tasks.pending(), 2);
            tasks.complete(&queue, 0);
            assert_eq!(tasks.pending(), 0);
        }
        assert_eq!(results, vec![10, 11, 12, 13]);
    }
}
