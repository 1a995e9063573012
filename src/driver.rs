//! Cooperative optimization runs.
//!
//! A run moves through `Idle → Running ⇄ Paused → Stopped`. The host calls
//! [`Dataset::tick`](crate::Dataset::tick) once per frame; each tick performs
//! at most one engine step, so the host keeps control between steps.
//! Pause and stop requests are plain flags checked at the top of every tick,
//! which lets a [`RunControl`] clone steer the run from another thread.

use crate::dataset::Point;
use crate::engine::OptimizerEngine;
use bon::Builder;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Projection keys written for each output component.
pub const TSNE_KEYS: [&str; 3] = ["tsne-0", "tsne-1", "tsne-2"];

/// Projection family written by optimization runs.
pub const TSNE_PROJECTION: &str = "tsne";

/// Receives the new iteration after every step, and `None` once when the run
/// stops.
pub type StepCallback = Box<dyn FnMut(Option<usize>)>;

/// Parameters of one optimization run.
#[derive(Builder, Clone, Copy, Debug, PartialEq)]
pub struct RunParameters {
    /// Solver perplexity; the neighbor count is `floor(3 * perplexity)`
    #[builder(default = 30.0)]
    pub perplexity: f32,

    /// Solver learning rate
    #[builder(default = 1.0)]
    pub learning_rate: f32,

    /// Output dimensionality, 2 or 3
    #[builder(default = 2)]
    pub dimensions: usize,
}

impl RunParameters {
    /// Neighbors requested per point.
    pub fn neighbor_count(&self) -> usize {
        (3.0 * self.perplexity).floor().max(0.0) as usize
    }
}

/// Lifecycle state of a dataset's optimization run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// No run has been started
    Idle,
    /// Steps advance on every tick
    Running,
    /// Ticks are skipped but the run is kept
    Paused,
    /// The run was torn down
    Stopped,
}

/// What a call to [`Dataset::tick`](crate::Dataset::tick) did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// The engine advanced to this iteration
    Stepped(usize),
    /// The run is paused; call again later
    Paused,
    /// The run is over; stop scheduling ticks
    Stopped,
    /// No run exists
    Idle,
}

/// Shared pause and stop flags of a run.
///
/// Clones refer to the same run and may be moved to other threads.
#[derive(Clone, Debug, Default)]
pub struct RunControl {
    paused: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl RunControl {
    /// Skips steps until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Continues stepping after [`pause`](Self::pause).
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Requests the run to stop at its next tick.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Whether the run is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Whether a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// A live run: the engine, the points it sees and the host callback.
pub(crate) struct EmbeddingRun {
    engine: Box<dyn OptimizerEngine>,
    /// Dataset positions of the sampled points, in engine row order
    sample: Vec<usize>,
    on_step: StepCallback,
    control: RunControl,
    iteration: usize,
}

impl EmbeddingRun {
    pub(crate) fn new(
        engine: Box<dyn OptimizerEngine>,
        sample: Vec<usize>,
        on_step: StepCallback,
        control: RunControl,
    ) -> Self {
        Self {
            engine,
            sample,
            on_step,
            control,
            iteration: 0,
        }
    }

    pub(crate) fn state(&self) -> RunState {
        if self.control.is_stopped() {
            RunState::Stopped
        } else if self.control.is_paused() {
            RunState::Paused
        } else {
            RunState::Running
        }
    }

    pub(crate) fn control(&self) -> &RunControl {
        &self.control
    }

    pub(crate) fn iteration(&self) -> usize {
        self.iteration
    }

    pub(crate) fn sample(&self) -> &[usize] {
        &self.sample
    }

    pub(crate) fn engine_mut(&mut self) -> &mut dyn OptimizerEngine {
        self.engine.as_mut()
    }

    /// Advances the engine, publishes the layout and reports the iteration.
    pub(crate) fn step(&mut self, points: &mut [Point]) -> usize {
        self.engine.step();
        self.publish(points);
        self.iteration += 1;
        (self.on_step)(Some(self.iteration));
        self.iteration
    }

    /// Adjusts the layout out of band and republishes it.
    pub(crate) fn perturb(&mut self, points: &mut [Point]) {
        self.engine.perturb();
        self.publish(points);
    }

    /// Copies the engine solution into the sampled points' projections.
    ///
    /// Rows are `dimensionality()` values apart; at most three are written.
    pub(crate) fn publish(&self, points: &mut [Point]) {
        let stride = self.engine.dimensionality();
        let solution = self.engine.solution();
        if stride == 0 || solution.len() < self.sample.len() * stride {
            warn!(
                "Engine solution has {} values, expected {}",
                solution.len(),
                self.sample.len() * stride
            );
            return;
        }

        for (row, &index) in self.sample.iter().enumerate() {
            let Some(point) = points.get_mut(index) else {
                continue;
            };
            let coords = &solution[row * stride..(row + 1) * stride];
            for (key, &value) in TSNE_KEYS.iter().zip(coords) {
                point.set_projection(key, value);
            }
        }
    }

    /// Tears the run down, telling the host no further iterations follow.
    pub(crate) fn finish(mut self) {
        info!("Stopping run after {} iterations", self.iteration);
        self.control.stop();
        (self.on_step)(None);
    }
}
