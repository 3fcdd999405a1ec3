use indexmap::IndexMap;

use crate::{
    error::{DslError, DslResult},
    expressions::{ExprRef, StubId},
};

/// One stubbed sub-expression: the expression (with `Stub` leaves standing in
/// for other entries) and the ids it depends on.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StubbedExpr {
    pub expr: ExprRef,
    pub dependencies: Vec<StubId>,
}

/// An acyclic graph of stubbed sub-expressions, produced by parallel
/// compilation and consumed by the runners.
///
/// Entries are kept in stub-id order, so iteration (and therefore the
/// single-threaded runner) is deterministic. The dependency list of each
/// entry is exactly the set of stub ids its expression references.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DependencyGraph {
    stubbed_exprs: IndexMap<StubId, StubbedExpr>,
    root_id: StubId,
}

impl DependencyGraph {
    /// Builds a graph from raw stubbed expressions, deriving each entry's
    /// dependency list from the stub references in its expression.
    #[must_use]
    pub fn from_stubbed_exprs(exprs: IndexMap<StubId, ExprRef>, root_id: StubId) -> Self {
        let stubbed_exprs = exprs
            .into_iter()
            .map(|(id, expr)| {
                let dependencies = expr.list_stub_ids();
                (id, StubbedExpr { expr, dependencies })
            })
            .collect();
        Self { stubbed_exprs, root_id }
    }

    /// Number of stubbed expressions in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stubbed_exprs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stubbed_exprs.is_empty()
    }

    /// The stub whose value is the contract value.
    #[must_use]
    pub fn root_id(&self) -> StubId {
        self.root_id
    }

    #[must_use]
    pub fn stubbed_exprs(&self) -> &IndexMap<StubId, StubbedExpr> {
        &self.stubbed_exprs
    }

    /// Stubs whose expressions reference no other stubs.
    #[must_use]
    pub fn leaf_ids(&self) -> Vec<StubId> {
        self.stubbed_exprs
            .iter()
            .filter(|(_, stubbed)| stubbed.dependencies.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Serialises the graph to bytes, for caching a compiled contract or
    /// shipping it to another process.
    pub fn dump(&self) -> DslResult<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| DslError::runner(format!("failed to serialise dependency graph: {e}")))
    }

    /// Deserialises a graph produced by [`dump`](Self::dump).
    pub fn load(bytes: &[u8]) -> DslResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| DslError::runner(format!("failed to deserialise dependency graph: {e}")))
    }

    /// Checks the graph is consistent: the root and every referenced
    /// dependency exist, and the dependencies form no cycle.
    pub fn validate(&self) -> DslResult<()> {
        if !self.stubbed_exprs.contains_key(&self.root_id) {
            return Err(DslError::runner(format!(
                "dependency graph has no entry for its root stub {}",
                self.root_id
            )));
        }
        for (id, stubbed) in &self.stubbed_exprs {
            for dependency in &stubbed.dependencies {
                if !self.stubbed_exprs.contains_key(dependency) {
                    return Err(DslError::runner(format!(
                        "stub {id} depends on missing stub {dependency}"
                    )));
                }
            }
        }

        // Kahn's algorithm: if some stub never becomes ready, there is a cycle
        let mut waiting: IndexMap<StubId, usize> = self
            .stubbed_exprs
            .iter()
            .map(|(id, stubbed)| (*id, stubbed.dependencies.len()))
            .collect();
        let mut ready: Vec<StubId> = self.leaf_ids();
        let mut resolved = 0usize;
        while let Some(id) = ready.pop() {
            resolved += 1;
            for (dependent, stubbed) in &self.stubbed_exprs {
                if stubbed.dependencies.contains(&id) {
                    let count = &mut waiting[dependent];
                    *count -= 1;
                    if *count == 0 {
                        ready.push(*dependent);
                    }
                }
            }
        }
        if resolved != self.len() {
            return Err(DslError::runner("dependency graph contains a cycle"));
        }
        Ok(())
    }
}
