//! Fan-out of outbound batches across the registered links.
//!
//! Every live link registers a bounded outbound queue with the [`Scatterer`].
//! Two distribution modes are supported:
//!
//! - **RoundRobin**: each batch goes to one queue, chosen by smooth weighted
//!   round-robin over the queue weights (equal weights rotate evenly)
//! - **Concurrent**: every queue receives a share of each batch
//!
//! Sends never block. A full queue loses the batch and its share is released.

use crate::buffer::BufferHandle;
use crate::stats::FlowStats;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Distribution policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScatterMode {
    /// One link per batch, rotating by weight
    #[default]
    RoundRobin,
    /// Every link gets every batch
    Concurrent,
}

/// Handle identifying a registered outbound queue.
pub type OutputId = u64;

#[derive(Debug, thiserror::Error)]
pub enum ScatterError {
    #[error("output {0} is not registered")]
    UnknownOutput(OutputId),
}

struct Output {
    id: OutputId,
    tx: mpsc::Sender<BufferHandle>,
    weight: i64,
    current: i64,
}

/// Registered outputs plus the weighted rotation state.
struct Rotation {
    outputs: Vec<Output>,
    next_id: OutputId,
}

impl Rotation {
    /// Smooth weighted round-robin: raise every output by its weight, pick
    /// the highest, then lower the pick by the total weight.
    fn pick(&mut self) -> Option<usize> {
        let total: i64 = self.outputs.iter().map(|o| o.weight).sum();
        let mut best: Option<(usize, i64)> = None;
        for (idx, output) in self.outputs.iter_mut().enumerate() {
            output.current += output.weight;
            if best.map_or(true, |(_, current)| output.current > current) {
                best = Some((idx, output.current));
            }
        }
        let (idx, _) = best?;
        self.outputs[idx].current -= total;
        Some(idx)
    }
}

/// Fan-out distributor feeding the outbound queues of every live link.
pub struct Scatterer {
    mode: ScatterMode,
    rotation: Mutex<Rotation>,
    stats: Arc<FlowStats>,
}

impl Scatterer {
    pub fn new(mode: ScatterMode, stats: Arc<FlowStats>) -> Self {
        Self {
            mode,
            rotation: Mutex::new(Rotation {
                outputs: Vec::new(),
                next_id: 0,
            }),
            stats,
        }
    }

    pub fn mode(&self) -> ScatterMode {
        self.mode
    }

    pub fn stats(&self) -> &Arc<FlowStats> {
        &self.stats
    }

    /// Register a new outbound queue of `capacity` batches.
    ///
    /// The returned receiver is drained by the link's send loop; it sees the
    /// end of the stream once the output is removed.
    pub fn new_output(
        &self,
        capacity: usize,
        weight: u32,
    ) -> (OutputId, mpsc::Receiver<BufferHandle>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut rotation = self.lock();
        let id = rotation.next_id;
        rotation.next_id += 1;
        rotation.outputs.push(Output {
            id,
            tx,
            weight: i64::from(weight.max(1)),
            current: 0,
        });
        tracing::debug!(output = id, weight, "outbound queue registered");
        (id, rx)
    }

    /// Unregister an outbound queue and close it.
    pub fn remove_output(&self, id: OutputId) -> Result<(), ScatterError> {
        let mut rotation = self.lock();
        let idx = rotation
            .outputs
            .iter()
            .position(|o| o.id == id)
            .ok_or(ScatterError::UnknownOutput(id))?;
        rotation.outputs.swap_remove(idx);
        for output in rotation.outputs.iter_mut() {
            output.current = 0;
        }
        tracing::debug!(output = id, "outbound queue removed");
        Ok(())
    }

    pub fn output_count(&self) -> usize {
        self.lock().outputs.len()
    }

    /// Distribute `batch` according to the mode. The caller's reference is
    /// consumed either way.
    pub fn scatter(&self, batch: BufferHandle) {
        self.stats
            .input
            .count(batch.sub_packets().len(), batch.total_size());

        let mut rotation = self.lock();
        if rotation.outputs.is_empty() {
            tracing::trace!("no outbound queues, dropping batch");
            return;
        }

        match self.mode {
            ScatterMode::RoundRobin => {
                if let Some(idx) = rotation.pick() {
                    self.offer(&rotation.outputs[idx], batch);
                }
            }
            ScatterMode::Concurrent => {
                for output in &rotation.outputs {
                    self.offer(output, batch.share());
                }
            }
        }
    }

    fn offer(&self, output: &Output, share: BufferHandle) {
        let (packets, bytes) = (share.sub_packets().len(), share.total_size());
        match output.tx.try_send(share) {
            Ok(()) => self.stats.output.count(packets, bytes),
            Err(TrySendError::Full(dropped)) => {
                tracing::debug!(output = output.id, bytes, "outbound queue full, dropping batch");
                dropped.release();
            }
            Err(TrySendError::Closed(dropped)) => {
                tracing::trace!(output = output.id, "outbound queue closed");
                dropped.release();
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Rotation> {
        self.rotation.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
