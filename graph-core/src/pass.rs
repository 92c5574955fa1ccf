//! The `Pass` trait and `PassPipeline`.

use crate::error::Result;
use crate::subgraph::Subgraph;
use std::fmt;
use std::time::Instant;
use tracing::debug;

/// Whether a pass guarantees the subgraph is left in its last-good state
/// on failure, or may leave it partially mutated. Each pass documents
/// (and preferably guarantees) its transactional behavior via this enum
/// rather than prose comments alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transactionality {
    /// On error, the subgraph is guaranteed unchanged from before `run`.
    Transactional,
    /// On error, the subgraph may have been partially mutated.
    BestEffort,
}

/// A pure transformation on a [`Subgraph`].
pub trait Pass: Send + Sync {
    fn name(&self) -> &str;

    fn transactionality(&self) -> Transactionality {
        Transactionality::BestEffort
    }

    fn run(&self, subgraph: &mut Subgraph) -> Result<()>;
}

/// A boxed pass plus its static name, so the pipeline can report "first
/// offending pass name" without re-deriving it from the trait object
/// after a failure unwinds locals.
struct PipelineStep {
    pass: Box<dyn Pass>,
}

impl fmt::Debug for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PipelineStep({})", self.pass.name())
    }
}

/// A hook invoked before/after each pass when visualization is enabled.
/// Kept abstract here since the concrete renderer (dot/json/etc) is a
/// presentation detail outside the pipeline's concern.
pub trait VisualizeSink: Send + Sync {
    fn snapshot(&self, pass_name: &str, when: VisualizeWhen, subgraph: &Subgraph);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualizeWhen {
    Before,
    After,
}

/// A [`VisualizeSink`] that emits one `tracing` event per snapshot rather
/// than rendering to a file, for callers (like `graph-cli`) that just
/// want the pass-by-pass trace on their existing log stream instead of a
/// dedicated dot/json renderer.
pub struct TracingVisualizeSink;

impl VisualizeSink for TracingVisualizeSink {
    fn snapshot(&self, pass_name: &str, when: VisualizeWhen, subgraph: &Subgraph) {
        tracing::info!(
            pass = pass_name,
            when = ?when,
            op_count = subgraph.op_count(),
            "subgraph snapshot"
        );
    }
}

/// An ordered, named sequence of graph transforms. Applies passes
/// sequentially to a mutable subgraph, halting on the first failure.
pub struct PassPipeline {
    steps: Vec<PipelineStep>,
    visualize_before: bool,
    visualize_after: bool,
    sink: Option<Box<dyn VisualizeSink>>,
}

impl PassPipeline {
    pub fn new() -> Self {
        PassPipeline {
            steps: Vec::new(),
            visualize_before: false,
            visualize_after: false,
            sink: None,
        }
    }

    pub fn with_sink(sink: Box<dyn VisualizeSink>) -> Self {
        PassPipeline {
            steps: Vec::new(),
            visualize_before: false,
            visualize_after: false,
            sink: Some(sink),
        }
    }

    /// Appends a pass. Order is significant: later passes observe the
    /// output of earlier ones.
    pub fn add(&mut self, pass: impl Pass + 'static) -> &mut Self {
        self.steps.push(PipelineStep {
            pass: Box::new(pass),
        });
        self
    }

    /// Toggles pre/post snapshots around each pass.
    pub fn set_visualize(&mut self, before: bool, after: bool) -> &mut Self {
        self.visualize_before = before;
        self.visualize_after = after;
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Applies every pass in order. On the first failure, the pipeline
    /// halts and returns that error; whether the subgraph itself was left
    /// last-good or partially mutated depends on the offending pass's
    /// `transactionality()`.
    pub fn run(&self, subgraph: &mut Subgraph) -> Result<()> {
        let span = tracing::info_span!("pipeline_run", passes = self.steps.len());
        let _enter = span.enter();

        for step in &self.steps {
            let name = step.pass.name();
            if self.visualize_before {
                if let Some(sink) = &self.sink {
                    sink.snapshot(name, VisualizeWhen::Before, subgraph);
                }
            }

            let start = Instant::now();
            let result = step.pass.run(subgraph);
            debug!(pass = name, elapsed_us = start.elapsed().as_micros() as u64, "pass ran");

            result.map_err(|e| {
                tracing::warn!(pass = name, error = %e, "pass failed, halting pipeline");
                e
            })?;

            if self.visualize_after {
                if let Some(sink) = &self.sink {
                    sink.snapshot(name, VisualizeWhen::After, subgraph);
                }
            }
        }
        Ok(())
    }
}

impl Default for PassPipeline {
    fn default() -> Self {
        Self::new()
    }
}
