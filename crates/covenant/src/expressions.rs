use std::{fmt, sync::Arc};

use smallvec::SmallVec;

use crate::{error::CodeRange, function::FunctionDef, value::float_repr};

/// Identifier of a stubbed sub-expression in a dependency graph.
///
/// Ids are assigned sequentially in compilation order, so compiling the same
/// source twice produces the same graph.
pub type StubId = u64;

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Operator {
    Add,
    Sub,
    Mult,
    Div,
    FloorDiv,
    Pow,
    Mod,
}

impl Operator {
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mult => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Pow => "**",
            Self::Mod => "%",
        }
    }

    const fn precedence(self) -> u8 {
        match self {
            Self::Add | Self::Sub => 6,
            Self::Mult | Self::Div | Self::FloorDiv | Self::Mod => 7,
            Self::Pow => 9,
        }
    }
}

/// Comparison operators. Chains are kept flat so each operand evaluates once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CmpOperator {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
}

impl CmpOperator {
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtE => "<=",
            Self::Gt => ">",
            Self::GtE => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BoolOperator {
    And,
    Or,
}

impl BoolOperator {
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
        }
    }

    const fn precedence(self) -> u8 {
        match self {
            Self::Or => 2,
            Self::And => 3,
        }
    }
}

/// Shared handle to an expression node.
///
/// Trees are immutable after construction; the compiler builds new trees and
/// shares identical specialised sub-expressions through these handles, which
/// is what keeps the inlined form of a recursive contract polynomial.
pub type ExprRef = Arc<ExprLoc>;

/// An expression together with its source span.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExprLoc {
    pub expr: Expr,
    pub position: CodeRange,
}

/// An expression in the semantic tree.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    /// A name to be resolved against the namespace: a function parameter, a
    /// compile-time keyword binding, or (unresolved) an evaluation error.
    Name(String),
    UnarySub(ExprRef),
    Op {
        left: ExprRef,
        op: Operator,
        right: ExprRef,
    },
    /// Chained comparison: `left op1 a op2 b ...`, short-circuiting with each
    /// operand evaluated at most once.
    Compare {
        left: ExprRef,
        comparisons: Vec<(CmpOperator, ExprRef)>,
    },
    BoolOp {
        op: BoolOperator,
        values: Vec<ExprRef>,
    },
    /// `body if test else or_else`.
    IfExp {
        test: ExprRef,
        body: ExprRef,
        or_else: ExprRef,
    },
    /// Statement-form `if/elif/else`. Semantically identical to `IfExp`;
    /// kept distinct so modules print back in block form.
    If {
        test: ExprRef,
        body: ExprRef,
        or_else: ExprRef,
    },
    /// Call of a user-defined function, expanded away by the compiler.
    Call {
        name: String,
        args: SmallVec<[ExprRef; 4]>,
    },
    /// `Date('YYYY-MM-DD')` — a UTC-midnight instant.
    Date(ExprRef),
    /// `TimeDelta('Nd')` — a whole number of days.
    TimeDelta(ExprRef),
    /// Pointwise maximum of two operands.
    Max {
        left: ExprRef,
        right: ExprRef,
    },
    /// Evaluates `body` at the given date without discounting.
    On {
        date: ExprRef,
        body: ExprRef,
    },
    /// Same operation as `On`: shifts the observation date of `body`.
    Fixing {
        date: ExprRef,
        body: ExprRef,
    },
    /// Shifts the observation date of `body` *and* discounts the result back
    /// to the current observation date.
    Wait {
        date: ExprRef,
        body: ExprRef,
    },
    /// Discounts `body` from the given settlement date without shifting the
    /// observation date `body` sees.
    Settlement {
        date: ExprRef,
        body: ExprRef,
    },
    /// Per-path simulated price of the named market at the observation date.
    Market(ExprRef),
    /// Identity wrapper marking the underlying of an option.
    Underlying(ExprRef),
    /// Longstaff-Schwartz choice between exercise and continuation.
    Choice {
        left: ExprRef,
        right: ExprRef,
    },
    /// Placeholder for the result of another stubbed expression.
    Stub(StubId),
}

impl ExprLoc {
    #[must_use]
    pub fn new(expr: Expr, position: CodeRange) -> ExprRef {
        Arc::new(Self { expr, position })
    }

    /// Pre-order walk over this expression and all sub-expressions.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Self)) {
        f(self);
        match &self.expr {
            Expr::Int(_) | Expr::Float(_) | Expr::Str(_) | Expr::Name(_) | Expr::Stub(_) => {}
            Expr::UnarySub(operand)
            | Expr::Date(operand)
            | Expr::TimeDelta(operand)
            | Expr::Market(operand)
            | Expr::Underlying(operand) => operand.visit(f),
            Expr::Op { left, right, .. }
            | Expr::Max { left, right }
            | Expr::Choice { left, right } => {
                left.visit(f);
                right.visit(f);
            }
            Expr::Compare { left, comparisons } => {
                left.visit(f);
                for (_, comparator) in comparisons {
                    comparator.visit(f);
                }
            }
            Expr::BoolOp { values, .. } => {
                for value in values {
                    value.visit(f);
                }
            }
            Expr::IfExp { test, body, or_else } | Expr::If { test, body, or_else } => {
                test.visit(f);
                body.visit(f);
                or_else.visit(f);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.visit(f);
                }
            }
            Expr::On { date, body }
            | Expr::Fixing { date, body }
            | Expr::Wait { date, body }
            | Expr::Settlement { date, body } => {
                date.visit(f);
                body.visit(f);
            }
        }
    }

    /// Stub ids referenced anywhere in this expression, first occurrence first.
    #[must_use]
    pub fn list_stub_ids(&self) -> Vec<StubId> {
        let mut ids = Vec::new();
        self.visit(&mut |node| {
            if let Expr::Stub(id) = node.expr {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        });
        ids
    }

    /// True if no sub-expression references a stub.
    #[must_use]
    pub fn is_stub_free(&self) -> bool {
        let mut found = false;
        self.visit(&mut |node| {
            if matches!(node.expr, Expr::Stub(_)) {
                found = true;
            }
        });
        !found
    }

    fn precedence(&self) -> u8 {
        match &self.expr {
            Expr::IfExp { .. } | Expr::If { .. } => 1,
            Expr::BoolOp { op, .. } => op.precedence(),
            Expr::Compare { .. } => 5,
            Expr::Op { op, .. } => op.precedence(),
            Expr::UnarySub(_) => 8,
            _ => 10,
        }
    }

    fn write_operand(&self, f: &mut fmt::Formatter<'_>, min_precedence: u8) -> fmt::Result {
        if self.precedence() < min_precedence {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }
}

impl fmt::Display for ExprLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let precedence = self.precedence();
        match &self.expr {
            Expr::Int(n) => write!(f, "{n}"),
            Expr::Float(x) => write!(f, "{}", float_repr(*x)),
            Expr::Str(s) => write!(f, "'{s}'"),
            Expr::Name(name) => write!(f, "{name}"),
            Expr::UnarySub(operand) => {
                write!(f, "-")?;
                operand.write_operand(f, precedence)
            }
            Expr::Op { left, op, right } => {
                // ** is right-associative, everything else left-associative
                let (left_min, right_min) = if *op == Operator::Pow {
                    (precedence + 1, precedence)
                } else {
                    (precedence, precedence + 1)
                };
                left.write_operand(f, left_min)?;
                write!(f, " {} ", op.token())?;
                right.write_operand(f, right_min)
            }
            Expr::Compare { left, comparisons } => {
                left.write_operand(f, precedence + 1)?;
                for (op, comparator) in comparisons {
                    write!(f, " {} ", op.token())?;
                    comparator.write_operand(f, precedence + 1)?;
                }
                Ok(())
            }
            Expr::BoolOp { op, values } => {
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", op.token())?;
                    }
                    value.write_operand(f, precedence + 1)?;
                }
                Ok(())
            }
            Expr::IfExp { test, body, or_else } | Expr::If { test, body, or_else } => {
                body.write_operand(f, precedence + 1)?;
                write!(f, " if ")?;
                test.write_operand(f, precedence + 1)?;
                write!(f, " else ")?;
                or_else.write_operand(f, precedence)
            }
            Expr::Call { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Expr::Date(arg) => write!(f, "Date({arg})"),
            Expr::TimeDelta(arg) => write!(f, "TimeDelta({arg})"),
            Expr::Max { left, right } => write!(f, "Max({left}, {right})"),
            Expr::On { date, body } => write!(f, "On({date}, {body})"),
            Expr::Fixing { date, body } => write!(f, "Fixing({date}, {body})"),
            Expr::Wait { date, body } => write!(f, "Wait({date}, {body})"),
            Expr::Settlement { date, body } => write!(f, "Settlement({date}, {body})"),
            Expr::Market(name) => write!(f, "Market({name})"),
            Expr::Underlying(body) => write!(f, "Underlying({body})"),
            Expr::Choice { left, right } => write!(f, "Choice({left}, {right})"),
            Expr::Stub(id) => write!(f, "Stub({id})"),
        }
    }
}

fn write_indent(f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    for _ in 0..indent {
        write!(f, "    ")?;
    }
    Ok(())
}

impl ExprLoc {
    /// Writes this expression in statement position: `if` nodes render as
    /// indented blocks with `elif` chains, everything else renders inline.
    /// No trailing newline.
    pub(crate) fn write_block(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        if let Expr::If { test, body, or_else } = &self.expr {
            write_indent(f, indent)?;
            writeln!(f, "if {test}:")?;
            body.write_block(f, indent + 1)?;
            writeln!(f)?;
            let mut branch = or_else;
            loop {
                match &branch.expr {
                    Expr::If { test, body, or_else } => {
                        write_indent(f, indent)?;
                        writeln!(f, "elif {test}:")?;
                        body.write_block(f, indent + 1)?;
                        writeln!(f)?;
                        branch = or_else;
                    }
                    _ => {
                        write_indent(f, indent)?;
                        writeln!(f, "else:")?;
                        branch.write_block(f, indent + 1)?;
                        return Ok(());
                    }
                }
            }
        }
        write_indent(f, indent)?;
        write!(f, "{self}")
    }
}

/// Rebuilds a node with every direct child passed through `f`.
///
/// When no child changes (pointer-equal results), the original handle is
/// returned, so unaffected subtrees keep their identity and their sharing.
pub(crate) fn map_children<E>(
    expr: &ExprRef,
    f: &mut impl FnMut(&ExprRef) -> Result<ExprRef, E>,
) -> Result<ExprRef, E> {
    let rebuild = |e: Expr| ExprLoc::new(e, expr.position);
    let unchanged = |a: &ExprRef, b: &ExprRef| Arc::ptr_eq(a, b);

    Ok(match &expr.expr {
        Expr::Int(_) | Expr::Float(_) | Expr::Str(_) | Expr::Name(_) | Expr::Stub(_) => expr.clone(),
        Expr::UnarySub(operand) => {
            let new = f(operand)?;
            if unchanged(&new, operand) {
                expr.clone()
            } else {
                rebuild(Expr::UnarySub(new))
            }
        }
        Expr::Date(operand) => {
            let new = f(operand)?;
            if unchanged(&new, operand) {
                expr.clone()
            } else {
                rebuild(Expr::Date(new))
            }
        }
        Expr::TimeDelta(operand) => {
            let new = f(operand)?;
            if unchanged(&new, operand) {
                expr.clone()
            } else {
                rebuild(Expr::TimeDelta(new))
            }
        }
        Expr::Market(operand) => {
            let new = f(operand)?;
            if unchanged(&new, operand) {
                expr.clone()
            } else {
                rebuild(Expr::Market(new))
            }
        }
        Expr::Underlying(operand) => {
            let new = f(operand)?;
            if unchanged(&new, operand) {
                expr.clone()
            } else {
                rebuild(Expr::Underlying(new))
            }
        }
        Expr::Op { left, op, right } => {
            let (l, r) = (f(left)?, f(right)?);
            if unchanged(&l, left) && unchanged(&r, right) {
                expr.clone()
            } else {
                rebuild(Expr::Op { left: l, op: *op, right: r })
            }
        }
        Expr::Max { left, right } => {
            let (l, r) = (f(left)?, f(right)?);
            if unchanged(&l, left) && unchanged(&r, right) {
                expr.clone()
            } else {
                rebuild(Expr::Max { left: l, right: r })
            }
        }
        Expr::Choice { left, right } => {
            let (l, r) = (f(left)?, f(right)?);
            if unchanged(&l, left) && unchanged(&r, right) {
                expr.clone()
            } else {
                rebuild(Expr::Choice { left: l, right: r })
            }
        }
        Expr::Compare { left, comparisons } => {
            let l = f(left)?;
            let new = comparisons
                .iter()
                .map(|(op, comparator)| Ok((*op, f(comparator)?)))
                .collect::<Result<Vec<_>, E>>()?;
            if unchanged(&l, left) && new.iter().zip(comparisons).all(|((_, a), (_, b))| unchanged(a, b)) {
                expr.clone()
            } else {
                rebuild(Expr::Compare { left: l, comparisons: new })
            }
        }
        Expr::BoolOp { op, values } => {
            let new = values.iter().map(&mut *f).collect::<Result<Vec<_>, E>>()?;
            if new.iter().zip(values).all(|(a, b)| unchanged(a, b)) {
                expr.clone()
            } else {
                rebuild(Expr::BoolOp { op: *op, values: new })
            }
        }
        Expr::IfExp { test, body, or_else } => {
            let (t, b, o) = (f(test)?, f(body)?, f(or_else)?);
            if unchanged(&t, test) && unchanged(&b, body) && unchanged(&o, or_else) {
                expr.clone()
            } else {
                rebuild(Expr::IfExp { test: t, body: b, or_else: o })
            }
        }
        Expr::If { test, body, or_else } => {
            let (t, b, o) = (f(test)?, f(body)?, f(or_else)?);
            if unchanged(&t, test) && unchanged(&b, body) && unchanged(&o, or_else) {
                expr.clone()
            } else {
                rebuild(Expr::If { test: t, body: b, or_else: o })
            }
        }
        Expr::Call { name, args } => {
            let new = args.iter().map(&mut *f).collect::<Result<SmallVec<[ExprRef; 4]>, E>>()?;
            if new.iter().zip(args).all(|(a, b)| unchanged(a, b)) {
                expr.clone()
            } else {
                rebuild(Expr::Call { name: name.clone(), args: new })
            }
        }
        Expr::On { date, body } => {
            let (d, b) = (f(date)?, f(body)?);
            if unchanged(&d, date) && unchanged(&b, body) {
                expr.clone()
            } else {
                rebuild(Expr::On { date: d, body: b })
            }
        }
        Expr::Fixing { date, body } => {
            let (d, b) = (f(date)?, f(body)?);
            if unchanged(&d, date) && unchanged(&b, body) {
                expr.clone()
            } else {
                rebuild(Expr::Fixing { date: d, body: b })
            }
        }
        Expr::Wait { date, body } => {
            let (d, b) = (f(date)?, f(body)?);
            if unchanged(&d, date) && unchanged(&b, body) {
                expr.clone()
            } else {
                rebuild(Expr::Wait { date: d, body: b })
            }
        }
        Expr::Settlement { date, body } => {
            let (d, b) = (f(date)?, f(body)?);
            if unchanged(&d, date) && unchanged(&b, body) {
                expr.clone()
            } else {
                rebuild(Expr::Settlement { date: d, body: b })
            }
        }
    })
}

/// Returns a new tree with `Name` leaves replaced by their bindings.
///
/// Pure: the input tree is untouched, and any subtree containing no bound
/// name comes back as the original shared handle.
#[must_use]
pub fn substitute_names(expr: &ExprRef, bindings: &ahash::AHashMap<String, ExprRef>) -> ExprRef {
    if let Expr::Name(name) = &expr.expr {
        return bindings.get(name).cloned().unwrap_or_else(|| expr.clone());
    }
    let result: Result<ExprRef, std::convert::Infallible> =
        map_children(expr, &mut |child| Ok(substitute_names(child, bindings)));
    match result {
        Ok(substituted) => substituted,
        Err(never) => match never {},
    }
}

impl ExprLoc {
    /// Names of every market mentioned with a literal tag in this expression,
    /// first occurrence first.
    #[must_use]
    pub fn market_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        self.visit(&mut |node| {
            if let Expr::Market(tag) = &node.expr {
                if let Expr::Str(name) = &tag.expr {
                    if !names.iter().any(|known| known == name) {
                        names.push(name.clone());
                    }
                }
            }
        });
        names
    }
}

/// A parsed module: function definitions followed by at most one trailing
/// expression statement.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Module {
    pub body: Vec<Statement>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Statement {
    FunctionDef(Arc<FunctionDef>),
    Expr(ExprRef),
}

impl Module {
    /// The trailing expression statement, if the module has one.
    #[must_use]
    pub fn trailing_expr(&self) -> Option<&ExprRef> {
        match self.body.last() {
            Some(Statement::Expr(expr)) => Some(expr),
            _ => None,
        }
    }

    /// All function definitions, in source order.
    pub fn function_defs(&self) -> impl Iterator<Item = &Arc<FunctionDef>> {
        self.body.iter().filter_map(|statement| match statement {
            Statement::FunctionDef(def) => Some(def),
            Statement::Expr(_) => None,
        })
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, statement) in self.body.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            match statement {
                Statement::FunctionDef(def) => write!(f, "{def}")?,
                Statement::Expr(expr) => expr.write_block(f, 0)?,
            }
        }
        Ok(())
    }
}
