// Data-parallel replica coordination.
//
// Every replica holds its own copy of the trainable models. Parameters are
// broadcast from the primary once at start, gradients are mean-reduced once
// per optimizer step, and checkpoint writes are fenced by a barrier so only
// the primary writes and nobody proceeds until the file is complete.
//
// A replica that fails calls `abort`; every peer then gets
// `TrainError::ReplicaAborted` from its current or next collective.

use crate::error::TrainError;
use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    fn is_primary(&self) -> bool {
        self.rank() == 0
    }

    fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }

    /// Block until every replica reaches this point.
    fn barrier(&self) -> Result<(), TrainError>;

    /// Element-wise mean of `values` across replicas. Every replica must
    /// pass the same length.
    fn all_reduce_mean(&self, values: &[f32]) -> Result<Vec<f32>, TrainError>;

    /// The primary's `values`, delivered to every replica.
    fn broadcast(&self, values: &[f32]) -> Result<Vec<f32>, TrainError>;

    /// Release every peer blocked in a collective. Later collectives fail.
    fn abort(&self) {}

    fn all_reduce_mean_scalar(&self, value: f32) -> Result<f32, TrainError> {
        Ok(self.all_reduce_mean(&[value])?[0])
    }
}

// ---------------------------------------------------------------------------
// Single process
// ---------------------------------------------------------------------------

/// The non-distributed case: rank 0 of 1, every collective is the identity.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), TrainError> {
        Ok(())
    }

    fn all_reduce_mean(&self, values: &[f32]) -> Result<Vec<f32>, TrainError> {
        Ok(values.to_vec())
    }

    fn broadcast(&self, values: &[f32]) -> Result<Vec<f32>, TrainError> {
        Ok(values.to_vec())
    }
}

// ---------------------------------------------------------------------------
// In-process replica group (one thread per device)
// ---------------------------------------------------------------------------

// Poisoning only means a peer panicked mid-update; the data is still usable.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct FenceState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// A reusable barrier that can be torn down.
struct Fence {
    world_size: usize,
    state: Mutex<FenceState>,
    cv: Condvar,
}

impl Fence {
    fn new(world_size: usize) -> Self {
        Self { world_size, state: Mutex::new(FenceState::default()), cv: Condvar::new() }
    }

    fn wait(&self) -> Result<(), TrainError> {
        let mut s = lock(&self.state);
        if s.aborted {
            return Err(TrainError::ReplicaAborted);
        }
        let generation = s.generation;
        s.arrived += 1;
        if s.arrived == self.world_size {
            s.arrived = 0;
            s.generation += 1;
            self.cv.notify_all();
            return Ok(());
        }
        while s.generation == generation && !s.aborted {
            s = self.cv.wait(s).unwrap_or_else(|e| e.into_inner());
        }
        if s.generation == generation {
            return Err(TrainError::ReplicaAborted);
        }
        Ok(())
    }

    fn abort(&self) {
        lock(&self.state).aborted = true;
        self.cv.notify_all();
    }
}

struct Rendezvous {
    fence: Fence,
    slot: Mutex<Vec<f32>>,
}

/// One member of a group of replicas that share a process.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Rendezvous>,
}

impl LocalGroup {
    /// Create `world_size` connected members, rank 0 first.
    pub fn create(world_size: usize) -> Vec<LocalGroup> {
        let world_size = world_size.max(1);
        let shared = Arc::new(Rendezvous { fence: Fence::new(world_size), slot: Mutex::new(Vec::new()) });
        (0..world_size)
            .map(|rank| LocalGroup { rank, shared: shared.clone() })
            .collect()
    }

    fn with_slot<R>(&self, f: impl FnOnce(&mut Vec<f32>) -> R) -> R {
        f(&mut lock(&self.shared.slot))
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.fence.world_size
    }

    fn barrier(&self) -> Result<(), TrainError> {
        self.shared.fence.wait()
    }

    fn all_reduce_mean(&self, values: &[f32]) -> Result<Vec<f32>, TrainError> {
        if self.world_size() == 1 {
            return Ok(values.to_vec());
        }
        self.barrier()?;
        if self.is_primary() {
            self.with_slot(|slot| {
                slot.clear();
                slot.resize(values.len(), 0.0);
            });
        }
        self.barrier()?;
        self.with_slot(|slot| {
            for (acc, v) in slot.iter_mut().zip(values) {
                *acc += *v;
            }
        });
        self.barrier()?;
        let scale = 1.0 / self.world_size() as f32;
        let out = self.with_slot(|slot| slot.iter().map(|v| v * scale).collect());
        self.barrier()?;
        Ok(out)
    }

    fn broadcast(&self, values: &[f32]) -> Result<Vec<f32>, TrainError> {
        if self.world_size() == 1 {
            return Ok(values.to_vec());
        }
        self.barrier()?;
        if self.is_primary() {
            self.with_slot(|slot| {
                slot.clear();
                slot.extend_from_slice(values);
            });
        }
        self.barrier()?;
        let out = self.with_slot(|slot| slot.clone());
        self.barrier()?;
        Ok(out)
    }

    fn abort(&self) {
        self.shared.fence.abort();
    }
}

// ---------------------------------------------------------------------------
// Tensor collectives
// ---------------------------------------------------------------------------

/// Replace every gradient in `grads` with its mean across replicas.
/// Variables without a gradient contribute zeros.
pub fn all_reduce_grads(group: &dyn ProcessGroup, vars: &[Var], grads: &mut GradStore) -> Result<()> {
    if !group.is_distributed() {
        return Ok(());
    }
    let mut flat: Vec<f32> = Vec::new();
    let mut sizes = Vec::with_capacity(vars.len());
    for var in vars {
        let n = var.elem_count();
        match grads.get(var.as_tensor()) {
            Some(g) => flat.extend(g.flatten_all()?.to_vec1::<f32>()?),
            None => flat.extend(std::iter::repeat(0f32).take(n)),
        }
        sizes.push(n);
    }
    let reduced = group.all_reduce_mean(&flat)?;
    let mut offset = 0;
    for (var, n) in vars.iter().zip(sizes) {
        let g = Tensor::from_slice(&reduced[offset..offset + n], var.dims(), var.device())?;
        grads.insert(var.as_tensor(), g);
        offset += n;
    }
    Ok(())
}

/// Overwrite every replica's parameters with the primary's.
pub fn broadcast_params(group: &dyn ProcessGroup, vars: &[Var]) -> Result<()> {
    if !group.is_distributed() {
        return Ok(());
    }
    for var in vars {
        let local: Vec<f32> = var.flatten_all()?.to_vec1()?;
        let shared = group.broadcast(&local)?;
        var.set(&Tensor::from_slice(&shared, var.dims(), var.device())?)?;
    }
    Ok(())
}
