//! Batch packing and conflict pre-filters for the sink coordinator.
use rustc_hash::FxHashMap;

use crate::context::DispatchContext;
use crate::state::EpochManager;
use crate::Error;

/// One batch handed to a sink, with a mark of how many leading containers
/// are fully emitted once this chunk is committed.
#[derive(Clone, Debug)]
pub struct BatchChunk<T> {
    /// the items in this batch, in container order
    pub items: Vec<T>,
    /// number of leading containers whose sub-items are all emitted at or
    /// before this chunk
    pub containers_completed: usize,
}

/// Packs container sub-items into batches.
///
/// Consecutive sub-items with `grouping(prev, curr) == true` form a group
/// that must stay together; a batch never mixes two groups and never exceeds
/// `max_batch_size`. Groups larger than the maximum are split across batches,
/// giving up atomicity. An absent previous item counts as "same group".
pub fn batch<C, T, A, G>(
    containers: &[C],
    accessor: A,
    grouping: G,
    max_batch_size: usize,
) -> Vec<BatchChunk<T>>
where
    A: Fn(&C) -> Vec<T>,
    G: Fn(Option<&T>, &T) -> bool,
{
    let max_batch_size = max_batch_size.max(1);
    let mut flat: Vec<T> = Vec::new();
    // cumulative sub-item count per container, for completion marks
    let mut container_ends: Vec<usize> = Vec::with_capacity(containers.len());
    for container in containers {
        let items = accessor(container);
        flat.extend(items);
        container_ends.push(flat.len());
    }

    let completed_at = |emitted: usize| container_ends.iter().filter(|end| **end <= emitted).count();

    let mut chunks: Vec<BatchChunk<T>> = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut emitted = 0usize;
    let mut previous: Option<&T> = None;

    // collect boundaries first so items can be moved out afterwards
    let mut boundaries = Vec::with_capacity(flat.len());
    for item in &flat {
        boundaries.push(!grouping(previous, item));
        previous = Some(item);
    }

    for (item, is_boundary) in flat.into_iter().zip(boundaries) {
        if !current.is_empty() && (is_boundary || current.len() >= max_batch_size) {
            emitted += current.len();
            chunks.push(BatchChunk {
                items: std::mem::take(&mut current),
                containers_completed: completed_at(emitted),
            });
        }
        current.push(item);
    }
    if !current.is_empty() {
        emitted += current.len();
        chunks.push(BatchChunk {
            items: current,
            containers_completed: completed_at(emitted),
        });
    }
    chunks
}

/// Result of partitioning contexts into a committable prefix and a failing
/// suffix.
#[derive(Debug, Default)]
pub struct Partition {
    /// contexts that passed the filter, in order
    pub good: Vec<DispatchContext>,
    /// the failing context and everything after it, in order
    pub bad: Vec<DispatchContext>,
    /// the synthetic conflict that split the sequence, if any
    pub conflict: Option<Error>,
}

/// Fails the first context holding a state reference from an epoch older
/// than the manager's current one, along with everything after it.
pub fn filter_by_epoch(contexts: Vec<DispatchContext>, epochs: &EpochManager) -> Partition {
    let mut conflict = None;
    let mut split = contexts.len();
    'scan: for (index, ctx) in contexts.iter().enumerate() {
        for reference in ctx.loaded() {
            if let Some(epoch) = reference.epoch {
                let current = epochs.get(&reference.key);
                if epoch < current {
                    conflict = Some(Error::SequenceConflict {
                        key: reference.key.clone(),
                        expected: current,
                        actual: epoch,
                    });
                    split = index;
                    break 'scan;
                }
            }
        }
    }
    let mut good = contexts;
    let bad = good.split_off(split);
    Partition {
        good,
        bad,
        conflict,
    }
}

/// Fails the first context whose stores branch off an already-consumed state
/// reference, along with everything after it.
///
/// Per key, the filter tracks the sequence number the next store is expected
/// to start at and the input sequence that produced it. Several stores from
/// one handler invocation extend the expectation; a store from a different
/// invocation must start exactly at the expected number, or the sequence is
/// split as a competing branch.
pub fn filter_nonlinear_state_changes(contexts: Vec<DispatchContext>) -> Partition {
    struct Tracked {
        expected_next: u64,
        last_sequence: u64,
    }

    let mut tracked: FxHashMap<String, Tracked> = FxHashMap::default();
    let mut conflict = None;
    let mut split = contexts.len();

    'scan: for (index, ctx) in contexts.iter().enumerate() {
        // group this context's stores by key, keeping first-seen order
        let mut groups: Vec<(&str, u64, u64)> = Vec::new();
        for stored in ctx.stored() {
            match groups.iter_mut().find(|(key, _, _)| *key == stored.state.key) {
                Some((_, _, count)) => *count += 1,
                None => groups.push((&stored.state.key, stored.state.seq_num, 1)),
            }
        }

        for (key, base_sn, count) in groups {
            match tracked.get_mut(key) {
                None => {
                    let _ = tracked.insert(
                        key.to_string(),
                        Tracked {
                            expected_next: base_sn + count,
                            last_sequence: ctx.sequence(),
                        },
                    );
                }
                Some(entry) if entry.last_sequence == ctx.sequence() => {
                    // further stores from the same handler invocation
                    entry.expected_next += count;
                }
                Some(entry) if entry.expected_next == base_sn => {
                    entry.expected_next = base_sn + count;
                    entry.last_sequence = ctx.sequence();
                }
                Some(entry) => {
                    conflict = Some(Error::SequenceConflict {
                        key: key.to_string(),
                        expected: entry.expected_next,
                        actual: base_sn,
                    });
                    split = index;
                    break 'scan;
                }
            }
        }
    }

    let mut good = contexts;
    let bad = good.split_off(split);
    Partition {
        good,
        bad,
        conflict,
    }
}
