use std::{fmt, sync::Mutex};

use ahash::AHashMap;

use crate::{
    error::CodeRange,
    expressions::{ExprLoc, ExprRef},
    value::Value,
};

/// A user-defined function: named parameters and an owned body expression.
///
/// The call cache memoises `apply` on the canonical argument tuple. It is
/// filled while a module is being compiled and read-only afterwards; a fresh
/// parse always starts with an empty cache. Cached bodies are shared handles,
/// so two calls with equal argument values return the *same* node.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub call_arg_names: Vec<String>,
    pub body: ExprRef,
    pub position: CodeRange,
    #[serde(skip)]
    call_cache: Mutex<AHashMap<CallKey, ExprRef>>,
}

impl FunctionDef {
    #[must_use]
    pub fn new(name: String, call_arg_names: Vec<String>, body: ExprRef, position: CodeRange) -> Self {
        Self {
            name,
            call_arg_names,
            body,
            position,
            call_cache: Mutex::new(AHashMap::new()),
        }
    }

    #[must_use]
    pub fn call_cache_len(&self) -> usize {
        self.call_cache.lock().expect("call cache poisoned").len()
    }

    pub(crate) fn cached(&self, key: &CallKey) -> Option<ExprRef> {
        self.call_cache.lock().expect("call cache poisoned").get(key).cloned()
    }

    pub(crate) fn cache(&self, key: CallKey, expr: ExprRef) {
        self.call_cache.lock().expect("call cache poisoned").insert(key, expr);
    }
}

impl fmt::Display for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "def {}(", self.name)?;
        for (i, arg_name) in self.call_arg_names.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg_name}")?;
        }
        writeln!(f, "):")?;
        self.body.write_block(f, 1)
    }
}

/// One argument of a call, reduced as far as compilation allows.
///
/// Arguments that evaluate at compile time (counters, dates, steps) become
/// values; anything path-dependent (a `Market`, a stubbed sub-contract) stays
/// an expression and is substituted into the body unevaluated.
#[derive(Debug, Clone)]
pub enum CallArg {
    Value(Value),
    Expr(ExprRef),
}

/// Canonical hashable form of one call argument.
///
/// Numbers are keyed by value, so `f(2)` and `f(2.0)` share a cache entry;
/// dates by instant; timedeltas by microseconds; expression arguments by
/// their canonical printed source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgKey {
    Int(i64),
    /// Bit pattern of a float with no integer representation.
    Float(u64),
    Str(String),
    Date(i64),
    TimeDelta(i64),
    Expr(String),
}

/// Canonical hashable form of a full argument tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey(Vec<ArgKey>);

impl CallKey {
    #[must_use]
    pub fn from_args(args: &[CallArg]) -> Self {
        Self(args.iter().map(ArgKey::from_arg).collect())
    }
}

impl ArgKey {
    fn from_arg(arg: &CallArg) -> Self {
        match arg {
            CallArg::Value(value) => Self::from_value(value),
            CallArg::Expr(expr) => Self::Expr(expr.to_string()),
        }
    }

    fn from_value(value: &Value) -> Self {
        match value {
            Value::Int(n) => Self::Int(*n),
            Value::Bool(b) => Self::Int(i64::from(*b)),
            Value::Float(x) => {
                // unify with ints where possible, like hash(2.0) == hash(2)
                if x.fract() == 0.0 && (i64::MIN as f64..=i64::MAX as f64).contains(x) {
                    Self::Int(*x as i64)
                } else {
                    Self::Float(x.to_bits())
                }
            }
            Value::Str(s) => Self::Str(s.clone()),
            Value::Date(d) => Self::Date(d.timestamp_micros()),
            Value::TimeDelta(t) => Self::TimeDelta(*t),
            Value::Vector(v) => Self::Expr(format!("<vector of {}>", v.len())),
        }
    }
}

/// Converts a compile-time value back into a literal expression so it can be
/// substituted for a parameter name inside a function body.
pub(crate) fn value_to_expr(value: &Value, position: CodeRange) -> ExprRef {
    use crate::expressions::Expr;
    let literal = |e: Expr| ExprLoc::new(e, position);
    match value {
        Value::Int(n) => literal(Expr::Int(*n)),
        Value::Bool(b) => literal(Expr::Int(i64::from(*b))),
        Value::Float(x) => literal(Expr::Float(*x)),
        Value::Str(s) => literal(Expr::Str(s.clone())),
        Value::Date(d) => {
            let text = literal(Expr::Str(d.format("%Y-%m-%d").to_string()));
            literal(Expr::Date(text))
        }
        Value::TimeDelta(t) => {
            let days = t / crate::value::MICROS_PER_DAY;
            let text = literal(Expr::Str(format!("{days}d")));
            literal(Expr::TimeDelta(text))
        }
        Value::Vector(_) => {
            // per-path data cannot appear as a literal; leave a name that
            // fails resolution with a clear message if it is ever evaluated
            literal(Expr::Name("<vector>".to_string()))
        }
    }
}
