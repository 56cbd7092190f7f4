//! Depth ordering for splat instances.
//!
//! The pure counting sort lives in [`sort_splats`]; [`Sorter`] wraps it in a
//! background task that owns the growing matrix array outright, fed through
//! ownership-moving channel messages.

use tokio::sync::mpsc;

use crate::error::SplatError;
use crate::structures::{SortKey, TransformBatch};

/// 16-bit depth discretization for the single-pass counting sort.
const DEPTH_BUCKETS: usize = 256 * 256;

/// A splat is kept when its visibility weight exceeds `THRESHOLD * depth`,
/// discarding near-zero-contribution splats relative to their distance.
const VISIBILITY_THRESHOLD: f32 = -0.0001;

/// Computes a depth-ordered permutation of the visible splat indices.
///
/// `matrices` is the flattened transform stream (16 floats per splat);
/// `view` is dotted with the homogeneous position column, with visible splats
/// at negative depth. Ascending bucket order means most-negative depth first,
/// so the permutation draws farthest-from-camera first (back-to-front).
///
/// With `include_all` every splat is kept, for blending modes that need a
/// stable index set rather than strict ordering.
pub fn sort_splats(matrices: &[f32], view: [f32; 4], include_all: bool) -> Vec<u32> {
    let vertex_count = matrices.len() / 16;

    let mut max_depth = f32::NEG_INFINITY;
    let mut min_depth = f32::INFINITY;
    let mut depths = Vec::with_capacity(vertex_count);
    let mut valid = Vec::with_capacity(vertex_count);

    for i in 0..vertex_count {
        let m = &matrices[i * 16..(i + 1) * 16];
        let depth = view[0] * m[12] + view[1] * m[13] + view[2] * m[14] + view[3];
        // Skip splats behind the camera and small, transparent ones.
        if include_all || (depth < 0.0 && m[15] > VISIBILITY_THRESHOLD * depth) {
            depths.push(depth);
            valid.push(i as u32);
            if depth > max_depth {
                max_depth = depth;
            }
            if depth < min_depth {
                min_depth = depth;
            }
        }
    }
    if valid.is_empty() {
        return Vec::new();
    }

    // Coincident depths collapse into bucket 0 rather than dividing by zero.
    let depth_inv = if max_depth > min_depth {
        (DEPTH_BUCKETS - 1) as f32 / (max_depth - min_depth)
    } else {
        0.0
    };

    let mut counts = vec![0u32; DEPTH_BUCKETS];
    let mut buckets = Vec::with_capacity(valid.len());
    for &depth in &depths {
        let bucket =
            ((((depth - min_depth) * depth_inv).round()) as usize).min(DEPTH_BUCKETS - 1);
        buckets.push(bucket);
        counts[bucket] += 1;
    }

    let mut starts = vec![0u32; DEPTH_BUCKETS];
    for i in 1..DEPTH_BUCKETS {
        starts[i] = starts[i - 1] + counts[i - 1];
    }

    let mut indices = vec![0u32; valid.len()];
    for (j, &bucket) in buckets.iter().enumerate() {
        indices[starts[bucket] as usize] = valid[j];
        starts[bucket] += 1;
    }
    indices
}

#[derive(Debug)]
enum SortCommand {
    Push(TransformBatch),
    Sort {
        key: SortKey,
        view: [f32; 4],
        include_all: bool,
    },
}

/// Result of one sort request, tagged with the key it was computed for.
#[derive(Debug)]
pub struct SortResult {
    pub key: SortKey,
    pub indices: Vec<u32>,
}

/// Handle to the background sort task.
///
/// Appends and sort requests travel over a single FIFO channel, so an index
/// returned by a sort always refers to a matrix the task has already
/// appended. Dropping the handle closes the channel and the task exits;
/// in-flight work is abandoned, not drained.
pub struct Sorter {
    command_tx: mpsc::UnboundedSender<SortCommand>,
    result_rx: mpsc::UnboundedReceiver<SortResult>,
}

impl Sorter {
    /// Spawns the sort task on the current tokio runtime.
    pub fn spawn() -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::worker_loop(command_rx, result_tx));

        Self {
            command_tx,
            result_rx,
        }
    }

    async fn worker_loop(
        mut command_rx: mpsc::UnboundedReceiver<SortCommand>,
        result_tx: mpsc::UnboundedSender<SortResult>,
    ) {
        // Append-only for the lifetime of the source; never compacted.
        let mut matrices: Vec<f32> = Vec::new();

        while let Some(command) = command_rx.recv().await {
            match command {
                SortCommand::Push(batch) => {
                    let mut incoming = batch.into_matrices();
                    if matrices.is_empty() {
                        matrices = incoming;
                    } else {
                        matrices.append(&mut incoming);
                    }
                }
                SortCommand::Sort {
                    key,
                    view,
                    include_all,
                } => {
                    let indices = sort_splats(&matrices, view, include_all);
                    if result_tx.send(SortResult { key, indices }).is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Moves a transform batch into the task's matrix array.
    pub fn push(&self, batch: TransformBatch) -> Result<(), SplatError> {
        self.command_tx
            .send(SortCommand::Push(batch))
            .map_err(|_| SplatError::SorterDisconnected)
    }

    /// Enqueues one sort request for `key`.
    pub fn request_sort(
        &self,
        key: SortKey,
        view: [f32; 4],
        include_all: bool,
    ) -> Result<(), SplatError> {
        self.command_tx
            .send(SortCommand::Sort {
                key,
                view,
                include_all,
            })
            .map_err(|_| SplatError::SorterDisconnected)
    }

    /// Drains completed results without blocking.
    pub fn poll_results(&mut self) -> Vec<SortResult> {
        let mut results = Vec::new();
        while let Ok(result) = self.result_rx.try_recv() {
            results.push(result);
        }
        results
    }
}
