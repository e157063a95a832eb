//! Store / restore / accept around each MCMC step.
//!
//! Mutable evaluation state is double-buffered instead of deep-copied:
//!
//! - [`DoubleBuffer`] holds one two-sided slot per node. The first write to a
//!   slot after [`Checkpointed::begin`] flips that slot's active side and
//!   records the slot; rollback flips recorded slots back, commit forgets
//!   them. Cost is proportional to the slots touched since the last store.
//! - [`Swappable`] holds one whole value with a single active selector.
//!
//! [`CheckpointManager`] enforces the sequencing contract: exactly one of
//! accept or restore follows each store, before the next store.

use arbora_core::{ArboraError, Result};

/// Something with state that can be checkpointed.
///
/// Implementations do not check ordering themselves; the owning model pairs
/// them with a [`CheckpointManager`].
pub trait Checkpointed {
    /// Start recording changes against the current state.
    fn begin(&mut self);
    /// Keep the current state and drop the shadow copy.
    fn commit(&mut self);
    /// Return to the state at the last `begin`.
    fn rollback(&mut self);
}

/// Where a model is in its store / accept-or-restore cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// No checkpoint is open.
    #[default]
    Idle,
    /// `store_state` has been called and awaits accept or restore.
    Stored,
}

impl Phase {
    fn describe(self) -> &'static str {
        match self {
            Phase::Idle => "no checkpoint is open",
            Phase::Stored => "a checkpoint is already open",
        }
    }
}

/// Counts of checkpoint operations over the life of a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    pub stores: u64,
    pub accepts: u64,
    pub restores: u64,
}

/// Enforces `store → {accept | restore}` ordering.
#[derive(Debug, Clone, Default)]
pub struct CheckpointManager {
    phase: Phase,
    stats: CheckpointStats,
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True between a store and its accept or restore.
    pub fn is_open(&self) -> bool {
        self.phase == Phase::Stored
    }

    pub fn stats(&self) -> CheckpointStats {
        self.stats
    }

    /// Open a checkpoint. Fails if one is already open.
    pub fn store(&mut self) -> Result<()> {
        self.transition("store_state", Phase::Idle, Phase::Stored)?;
        self.stats.stores += 1;
        Ok(())
    }

    /// Close the open checkpoint, keeping the current state.
    pub fn accept(&mut self) -> Result<()> {
        self.transition("accept_state", Phase::Stored, Phase::Idle)?;
        self.stats.accepts += 1;
        Ok(())
    }

    /// Close the open checkpoint, reverting to the stored state.
    pub fn restore(&mut self) -> Result<()> {
        self.transition("restore_state", Phase::Stored, Phase::Idle)?;
        self.stats.restores += 1;
        Ok(())
    }

    fn transition(&mut self, operation: &'static str, from: Phase, to: Phase) -> Result<()> {
        if self.phase != from {
            return Err(ArboraError::SequencingViolation {
                operation,
                phase: self.phase.describe(),
            });
        }
        self.phase = to;
        Ok(())
    }
}

/// Per-slot double buffer with an undo record.
#[derive(Debug, Clone)]
pub struct DoubleBuffer<T> {
    slots: Vec<[T; 2]>,
    active: Vec<u8>,
    touched: Vec<usize>,
    is_touched: Vec<bool>,
    recording: bool,
}

impl<T: Copy> DoubleBuffer<T> {
    /// A buffer of `len` slots, both sides set to `init`.
    pub fn new(len: usize, init: T) -> Self {
        Self {
            slots: vec![[init; 2]; len],
            active: vec![0; len],
            touched: Vec::new(),
            is_touched: vec![false; len],
            recording: false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The active value of slot `i`.
    pub fn get(&self, i: usize) -> T {
        self.slots[i][self.active[i] as usize]
    }

    /// Overwrite slot `i`.
    pub fn set(&mut self, i: usize, value: T) {
        if self.recording && !self.is_touched[i] {
            self.is_touched[i] = true;
            self.touched.push(i);
            self.active[i] ^= 1;
        }
        self.slots[i][self.active[i] as usize] = value;
    }

    /// Read-modify-write slot `i`.
    pub fn update(&mut self, i: usize, f: impl FnOnce(T) -> T) {
        let old = self.get(i);
        self.set(i, f(old));
    }

    /// Set every slot to `value`.
    pub fn fill(&mut self, value: T) {
        for i in 0..self.slots.len() {
            self.set(i, value);
        }
    }

    /// Reallocate to `len` slots, all set to `init`.
    ///
    /// The undo record is dropped: a rollback after a resize keeps the
    /// freshly initialised slots.
    pub fn resize(&mut self, len: usize, init: T) {
        self.slots = vec![[init; 2]; len];
        self.active = vec![0; len];
        self.is_touched = vec![false; len];
        self.touched.clear();
    }

    /// Number of slots written since the last `begin`.
    pub fn touched_count(&self) -> usize {
        self.touched.len()
    }

    fn forget(&mut self, flip_back: bool) {
        for i in self.touched.drain(..) {
            if flip_back {
                self.active[i] ^= 1;
            }
            self.is_touched[i] = false;
        }
        self.recording = false;
    }
}

impl<T: Copy> Checkpointed for DoubleBuffer<T> {
    fn begin(&mut self) {
        debug_assert!(self.touched.is_empty());
        self.recording = true;
    }

    fn commit(&mut self) {
        self.forget(false);
    }

    fn rollback(&mut self) {
        self.forget(true);
    }
}

/// Two copies of a whole value and a single active selector.
#[derive(Debug, Clone)]
pub struct Swappable<T> {
    sides: [T; 2],
    active: usize,
    touched: bool,
    recording: bool,
}

impl<T: Clone> Swappable<T> {
    pub fn new(value: T) -> Self {
        Self {
            sides: [value.clone(), value],
            active: 0,
            touched: false,
            recording: false,
        }
    }

    /// The active value.
    pub fn get(&self) -> &T {
        &self.sides[self.active]
    }

    /// Mutable access that preserves the current contents.
    ///
    /// The first call after `begin` copies the active side into the shadow
    /// side and switches to it.
    pub fn make_mut(&mut self) -> &mut T {
        if self.flip_if_recording() {
            let (a, b) = self.sides.split_at_mut(1);
            if self.active == 1 {
                b[0].clone_from(&a[0]);
            } else {
                a[0].clone_from(&b[0]);
            }
        }
        &mut self.sides[self.active]
    }

    /// Mutable access for a caller that overwrites the value completely.
    ///
    /// Switches sides without copying, so the returned value may hold stale
    /// contents from an older step.
    pub fn overwrite(&mut self) -> &mut T {
        self.flip_if_recording();
        &mut self.sides[self.active]
    }

    /// Replace the active value.
    pub fn set(&mut self, value: T) {
        *self.overwrite() = value;
    }

    fn flip_if_recording(&mut self) -> bool {
        if self.recording && !self.touched {
            self.touched = true;
            self.active ^= 1;
            return true;
        }
        false
    }
}

impl<T: Clone> Checkpointed for Swappable<T> {
    fn begin(&mut self) {
        self.recording = true;
        self.touched = false;
    }

    fn commit(&mut self) {
        self.recording = false;
        self.touched = false;
    }

    fn rollback(&mut self) {
        if self.touched {
            self.active ^= 1;
        }
        self.recording = false;
        self.touched = false;
    }
}

/// A lazily computed scalar and whether it is current.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedScalar {
    pub value: f64,
    pub known: bool,
}

impl CachedScalar {
    pub const UNKNOWN: CachedScalar = CachedScalar {
        value: 0.0,
        known: false,
    };

    pub fn known(value: f64) -> Self {
        Self { value, known: true }
    }
}

impl Default for CachedScalar {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl Swappable<CachedScalar> {
    /// Mark the scalar stale, keeping its last value around.
    pub fn invalidate(&mut self) {
        if self.get().known {
            let value = self.get().value;
            self.set(CachedScalar {
                value,
                known: false,
            });
        }
    }

    /// The value if it is current.
    pub fn current(&self) -> Option<f64> {
        let s = self.get();
        s.known.then_some(s.value)
    }
}
