use std::sync::Arc;

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    error::{CodeRange, DslError, DslErrorKind, DslResult},
    expressions::ExprRef,
    function::{FunctionDef, value_to_expr},
    value::Value,
};

/// Compile-time namespace: the module's function definitions plus any value
/// bindings supplied as compile keywords.
///
/// Function parameters are bound per call by the compiler and shadow these
/// lexically; this table only holds the outermost layer.
#[derive(Default)]
pub struct Namespace {
    defs: IndexMap<String, Arc<FunctionDef>>,
    values: IndexMap<String, Value>,
}

impl Namespace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, def: Arc<FunctionDef>) -> DslResult<()> {
        if self.defs.contains_key(&def.name) {
            return Err(DslError::new(
                DslErrorKind::Syntax,
                format!("function '{}' is defined twice", def.name),
            )
            .at(def.position));
        }
        self.defs.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    #[must_use]
    pub fn def(&self, name: &str) -> Option<&Arc<FunctionDef>> {
        self.defs.get(name)
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// The value bindings as literal expressions, ready for substitution.
    #[must_use]
    pub(crate) fn binding_exprs(&self) -> AHashMap<String, ExprRef> {
        self.values
            .iter()
            .map(|(name, value)| (name.clone(), value_to_expr(value, CodeRange::default())))
            .collect()
    }
}
