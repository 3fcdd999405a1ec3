use std::{collections::VecDeque, thread};

use ahash::AHashMap;
use crossbeam::channel;

use crate::{
    dependency_graph::DependencyGraph,
    error::{DslError, DslResult},
    evaluate::EvalContext,
    expressions::{ExprRef, StubId},
    value::Value,
};

/// Dependency bookkeeping shared by both runners: which stubs are ready, and
/// which become ready as results are published.
struct Scheduler<'g> {
    graph: &'g DependencyGraph,
    waiting: AHashMap<StubId, usize>,
    dependents: AHashMap<StubId, Vec<StubId>>,
    ready: VecDeque<StubId>,
}

impl<'g> Scheduler<'g> {
    fn new(graph: &'g DependencyGraph) -> Self {
        let mut waiting = AHashMap::with_capacity(graph.len());
        let mut dependents: AHashMap<StubId, Vec<StubId>> = AHashMap::new();
        for (id, stubbed) in graph.stubbed_exprs() {
            waiting.insert(*id, stubbed.dependencies.len());
            for dependency in &stubbed.dependencies {
                dependents.entry(*dependency).or_default().push(*id);
            }
        }
        Self {
            graph,
            waiting,
            dependents,
            ready: graph.leaf_ids().into(),
        }
    }

    fn pop_ready(&mut self) -> Option<StubId> {
        self.ready.pop_front()
    }

    /// Publishes a result: dependents whose last input this was become ready.
    fn complete(&mut self, id: StubId) {
        if let Some(dependents) = self.dependents.get(&id) {
            for dependent in dependents {
                let count = self
                    .waiting
                    .get_mut(dependent)
                    .expect("dependent missing from waiting table");
                *count -= 1;
                if *count == 0 {
                    self.ready.push_back(*dependent);
                }
            }
        }
    }

    /// The resolved input values one stub needs, ready to dispatch.
    fn gather_inputs(&self, id: StubId, results: &AHashMap<StubId, Value>) -> DslResult<Vec<(StubId, Value)>> {
        let stubbed = &self.graph.stubbed_exprs()[&id];
        stubbed
            .dependencies
            .iter()
            .map(|dependency| {
                results
                    .get(dependency)
                    .cloned()
                    .map(|value| (*dependency, value))
                    .ok_or_else(|| {
                        DslError::runner(format!("stub {id} was dispatched before its dependency {dependency}"))
                    })
            })
            .collect()
    }
}

/// Evaluates a dependency graph in one thread, in deterministic topological
/// order.
pub struct SingleThreadedRunner {
    graph: DependencyGraph,
    /// Number of stub evaluations performed; after a run this equals the
    /// number of stubbed expressions.
    pub call_count: usize,
}

impl SingleThreadedRunner {
    #[must_use]
    pub fn new(graph: DependencyGraph) -> Self {
        Self { graph, call_count: 0 }
    }

    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn evaluate(&mut self, ctx: &EvalContext) -> DslResult<Value> {
        self.graph.validate()?;
        let mut scheduler = Scheduler::new(&self.graph);
        let mut results: AHashMap<StubId, Value> = AHashMap::with_capacity(self.graph.len());

        while let Some(id) = scheduler.pop_ready() {
            let inputs = scheduler.gather_inputs(id, &results)?;
            let job_ctx = ctx.with_stub_results(inputs.into_iter().collect());
            let value = self.graph.stubbed_exprs()[&id].expr.evaluate(&job_ctx)?;
            self.call_count += 1;
            scheduler.complete(id);
            results.insert(id, value);
        }

        results
            .remove(&self.graph.root_id())
            .ok_or_else(|| DslError::runner("root stub was never evaluated"))
    }
}

/// A dispatched unit of work: one stub, its expression, and a snapshot of the
/// resolved values it depends on. Everything in here serialises by value, so
/// the same payload could cross a process boundary.
struct Job {
    stub_id: StubId,
    expr: ExprRef,
    inputs: Vec<(StubId, Value)>,
}

/// Evaluates a dependency graph across a pool of worker threads.
///
/// The coordinator owns the results map and the dependency counts; workers
/// receive ready jobs over one channel and send `(id, result)` back over
/// another. A stub is dispatched only after all its inputs are published.
pub struct WorkerPoolRunner {
    graph: DependencyGraph,
    worker_count: usize,
    /// Number of stub evaluations performed across all workers.
    pub call_count: usize,
}

impl WorkerPoolRunner {
    #[must_use]
    pub fn new(graph: DependencyGraph, worker_count: usize) -> Self {
        Self {
            graph,
            worker_count: worker_count.max(1),
            call_count: 0,
        }
    }

    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn evaluate(&mut self, ctx: &EvalContext) -> DslResult<Value> {
        self.graph.validate()?;

        let (job_tx, job_rx) = channel::unbounded::<Job>();
        let (result_tx, result_rx) = channel::unbounded::<(StubId, DslResult<Value>)>();

        thread::scope(|scope| {
            for _ in 0..self.worker_count {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let base_ctx = ctx.clone();
                scope.spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        let job_ctx = base_ctx.with_stub_results(job.inputs.into_iter().collect());
                        let result = job.expr.evaluate(&job_ctx);
                        if result_tx.send((job.stub_id, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            // only the workers hold senders now, so a dead pool surfaces as
            // a disconnected results channel instead of a hang
            drop(result_tx);

            let mut scheduler = Scheduler::new(&self.graph);
            let mut results: AHashMap<StubId, Value> = AHashMap::with_capacity(self.graph.len());

            loop {
                while let Some(id) = scheduler.pop_ready() {
                    let inputs = scheduler.gather_inputs(id, &results)?;
                    let job = Job {
                        stub_id: id,
                        expr: self.graph.stubbed_exprs()[&id].expr.clone(),
                        inputs,
                    };
                    job_tx
                        .send(job)
                        .map_err(|_| DslError::runner("worker pool shut down unexpectedly"))?;
                }
                if results.len() == self.graph.len() {
                    break;
                }
                let (id, result) = result_rx
                    .recv()
                    .map_err(|_| DslError::runner("a worker died before the graph was finished"))?;
                let value = result?;
                self.call_count += 1;
                scheduler.complete(id);
                results.insert(id, value);
            }

            drop(job_tx);
            results
                .remove(&self.graph.root_id())
                .ok_or_else(|| DslError::runner("root stub was never evaluated"))
        })
    }
}
