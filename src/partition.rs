use crate::catalog::WorkItem;
use crate::error::BatchError;

/// A contiguous slice of the filtered item sequence owned by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub worker_id: usize,
    pub items: Vec<WorkItem>,
}

impl Partition {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.items.iter().map(|item| item.id).collect()
    }

    /// First and last id, for display.
    pub fn id_span(&self) -> Option<(u64, u64)> {
        Some((self.items.first()?.id, self.items.last()?.id))
    }
}

/// Splits `items` into `worker_count` contiguous runs.
///
/// With `n` items the first `n % worker_count` partitions receive one extra
/// item. Empty input yields `worker_count` empty partitions.
pub fn partition(items: Vec<WorkItem>, worker_count: usize) -> Result<Vec<Partition>, BatchError> {
    if worker_count == 0 {
        return Err(BatchError::Configuration(
            "worker count must be at least 1".into(),
        ));
    }

    let base = items.len() / worker_count;
    let remainder = items.len() % worker_count;

    let mut rest = items.into_iter();
    let partitions = (0..worker_count)
        .map(|worker_id| {
            let size = base + usize::from(worker_id < remainder);
            Partition {
                worker_id,
                items: rest.by_ref().take(size).collect(),
            }
        })
        .collect();

    Ok(partitions)
}
