use std::sync::Arc;

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    dependency_graph::DependencyGraph,
    error::{CodeRange, DslError, DslErrorKind, DslResult},
    evaluate::EvalContext,
    expressions::{Expr, ExprLoc, ExprRef, Module, Statement, StubId, map_children},
    function::{CallArg, CallKey, FunctionDef, value_to_expr},
    namespace::Namespace,
    value::Value,
};

/// Budget for nested call expansion. A contract that recurses without a
/// decidable base case hits this instead of hanging the compiler.
const MAX_CALL_DEPTH: usize = 500;

/// The result of compiling a module.
#[derive(Debug, Clone)]
pub enum Compiled {
    /// Serial mode: one inlined expression with every call expanded.
    Expr(ExprRef),
    /// A module consisting of a single function definition compiles to the
    /// definition itself, ready for [`apply`].
    FunctionDef(Arc<FunctionDef>),
    /// Parallel mode: a dependency graph of stubbed sub-expressions.
    Graph(DependencyGraph),
}

impl Compiled {
    /// The inlined expression, when serial compilation produced one.
    #[must_use]
    pub fn as_expr(&self) -> Option<&ExprRef> {
        match self {
            Self::Expr(expr) => Some(expr),
            _ => None,
        }
    }
}

impl Module {
    /// Compiles this module: binds `kwds` as compile-time values, expands
    /// every function call with per-argument memoisation, and either inlines
    /// the result (serial) or stubs it into a dependency graph (parallel).
    pub fn compile(&self, kwds: &IndexMap<String, Value>, is_parallel: bool) -> DslResult<Compiled> {
        if self.body.is_empty() {
            return Err(DslError::new(DslErrorKind::Syntax, "cannot compile an empty module"));
        }

        let mut namespace = Namespace::new();
        for def in self.function_defs() {
            namespace.define(def.clone())?;
        }
        for (name, value) in kwds {
            namespace.bind(name.clone(), value.clone());
        }

        let Some(expr) = self.trailing_expr() else {
            // a lone function definition is a valid module of its own
            if let [Statement::FunctionDef(def)] = self.body.as_slice() {
                if !is_parallel {
                    return Ok(Compiled::FunctionDef(def.clone()));
                }
            }
            return Err(DslError::new(
                DslErrorKind::Syntax,
                "module has no expression to evaluate",
            ));
        };

        let mut compiler = Compiler::new(namespace, is_parallel);
        let bindings = compiler.namespace.binding_exprs();
        let compiled = compiler.compile_expr(expr, &bindings, 0)?;
        if is_parallel {
            Ok(Compiled::Graph(compiler.finish_graph(compiled)))
        } else {
            Ok(Compiled::Expr(compiled))
        }
    }
}

/// Specialises a function definition for the given argument values.
///
/// This is the compilation entry point for a single definition: the body is
/// substituted, branch tests decidable from the arguments select their
/// branch, nested calls (including recursive ones) expand, and the result is
/// memoised in the definition's call cache. Two applications with equal
/// argument values return the same shared node.
pub fn apply(def: &Arc<FunctionDef>, kwargs: &[(&str, Value)]) -> DslResult<ExprRef> {
    if kwargs.len() != def.call_arg_names.len() {
        return Err(DslError::arity(format!(
            "{}() takes {} arguments ({} given)",
            def.name,
            def.call_arg_names.len(),
            kwargs.len()
        ))
        .at(def.position));
    }
    let mut args = Vec::with_capacity(kwargs.len());
    for name in &def.call_arg_names {
        let value = kwargs
            .iter()
            .find(|(kwarg, _)| kwarg == name)
            .map(|(_, value)| value.clone())
            .ok_or_else(|| {
                DslError::arity(format!("{}() has no argument named '{name}'", def.name)).at(def.position)
            })?;
        args.push(CallArg::Value(value));
    }

    let mut namespace = Namespace::new();
    namespace.define(def.clone())?;
    let mut compiler = Compiler::new(namespace, false);
    compiler.apply_function(def, args, 0, def.position)
}

struct Compiler {
    namespace: Namespace,
    stubbing: bool,
    stubbed: IndexMap<StubId, ExprRef>,
    next_stub_id: StubId,
    /// Context for deciding branch tests and reducing call arguments at
    /// compile time. Anything it cannot evaluate is simply not decidable.
    pure_ctx: EvalContext,
}

impl Compiler {
    fn new(namespace: Namespace, stubbing: bool) -> Self {
        Self {
            namespace,
            stubbing,
            stubbed: IndexMap::new(),
            next_stub_id: 0,
            pure_ctx: EvalContext::new(),
        }
    }

    fn compile_expr(
        &mut self,
        expr: &ExprRef,
        bindings: &AHashMap<String, ExprRef>,
        depth: usize,
    ) -> DslResult<ExprRef> {
        match &expr.expr {
            Expr::Name(name) => Ok(bindings.get(name).cloned().unwrap_or_else(|| expr.clone())),
            Expr::Call { name, args } => {
                let def = self
                    .namespace
                    .def(name)
                    .cloned()
                    .ok_or_else(|| DslError::name(format!("function '{name}' is not defined")).at(expr.position))?;
                if args.len() != def.call_arg_names.len() {
                    return Err(DslError::arity(format!(
                        "{name}() takes {} arguments ({} given)",
                        def.call_arg_names.len(),
                        args.len()
                    ))
                    .at(expr.position));
                }
                let mut call_args = Vec::with_capacity(args.len());
                for arg in args {
                    let compiled = self.compile_expr(arg, bindings, depth)?;
                    // reduce to a value where the argument is deterministic;
                    // path-dependent arguments pass through as expressions
                    match compiled.evaluate(&self.pure_ctx) {
                        Ok(value) => call_args.push(CallArg::Value(value)),
                        Err(_) => call_args.push(CallArg::Expr(compiled)),
                    }
                }
                self.apply_function(&def, call_args, depth, expr.position)
            }
            Expr::IfExp { test, body, or_else } | Expr::If { test, body, or_else } => {
                let test = self.compile_expr(test, bindings, depth)?;
                match test.evaluate(&self.pure_ctx).and_then(|value| value.truthy()) {
                    Ok(true) => self.compile_expr(body, bindings, depth),
                    Ok(false) => self.compile_expr(or_else, bindings, depth),
                    // test undecidable at compile time: keep both branches
                    Err(_) => {
                        let body = self.compile_expr(body, bindings, depth)?;
                        let or_else = self.compile_expr(or_else, bindings, depth)?;
                        Ok(ExprLoc::new(
                            Expr::IfExp { test, body, or_else },
                            expr.position,
                        ))
                    }
                }
            }
            _ => map_children(expr, &mut |child| self.compile_expr(child, bindings, depth)),
        }
    }

    fn apply_function(
        &mut self,
        def: &Arc<FunctionDef>,
        args: Vec<CallArg>,
        depth: usize,
        call_position: CodeRange,
    ) -> DslResult<ExprRef> {
        if depth >= MAX_CALL_DEPTH {
            return Err(DslError::new(
                DslErrorKind::Recursion,
                format!("maximum call depth exceeded while expanding '{}'", def.name),
            )
            .at(call_position));
        }

        let key = CallKey::from_args(&args);
        if let Some(cached) = def.cached(&key) {
            return Ok(cached);
        }

        let mut bindings = AHashMap::with_capacity(args.len());
        for (name, arg) in def.call_arg_names.iter().zip(&args) {
            let bound = match arg {
                CallArg::Value(value) => value_to_expr(value, call_position),
                CallArg::Expr(expr) => expr.clone(),
            };
            bindings.insert(name.clone(), bound);
        }

        let body = self.compile_expr(&def.body, &bindings, depth + 1)?;
        let result = if self.stubbing {
            let id = self.add_stub(body);
            ExprLoc::new(Expr::Stub(id), def.position)
        } else {
            body
        };
        def.cache(key, result.clone());
        Ok(result)
    }

    fn add_stub(&mut self, expr: ExprRef) -> StubId {
        let id = self.next_stub_id;
        self.next_stub_id += 1;
        self.stubbed.insert(id, expr);
        id
    }

    fn finish_graph(mut self, root_expr: ExprRef) -> DependencyGraph {
        let root_id = self.add_stub(root_expr);
        DependencyGraph::from_stubbed_exprs(self.stubbed, root_id)
    }
}
