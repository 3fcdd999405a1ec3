use std::{borrow::Cow, fmt};

/// A single position in DSL source: 1-based line, 0-based column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CodeLoc {
    pub line: u32,
    pub column: u32,
}

impl CodeLoc {
    #[must_use]
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Source span attached to every semantic node and error.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CodeRange {
    start: CodeLoc,
    end: CodeLoc,
}

impl CodeRange {
    #[must_use]
    pub const fn new(start: CodeLoc, end: CodeLoc) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn start(&self) -> CodeLoc {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> CodeLoc {
        self.end
    }
}

/// Custom Debug implementation to keep dumped trees readable.
impl fmt::Debug for CodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}..{}:{}",
            self.start.line, self.start.column, self.end.line, self.end.column
        )
    }
}

/// The kinds of failure the engine reports.
///
/// Parse-time failures are `Syntax` (and `Arity` for primitives called with
/// the wrong number of arguments); the rest surface during compilation or
/// evaluation. All of them abort the evaluation they occur in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DslErrorKind {
    /// Malformed source or a construct outside the DSL.
    Syntax,
    /// An identifier (name, function, market, fixing date) could not be resolved.
    Name,
    /// Wrong number of arguments to a call or primitive.
    Arity,
    /// Incompatible operand types.
    Type,
    /// Division by zero, non-finite results, singular regression matrices.
    Numeric,
    /// Call expansion exceeded the recursion budget.
    Recursion,
    /// Inconsistent dependency graph or a failed worker.
    Runner,
}

impl DslErrorKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Syntax => "syntax error",
            Self::Name => "name error",
            Self::Arity => "arity error",
            Self::Type => "type error",
            Self::Numeric => "numeric error",
            Self::Recursion => "recursion error",
            Self::Runner => "runner error",
        }
    }
}

/// An error raised while parsing, compiling, or evaluating a contract.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DslError {
    kind: DslErrorKind,
    message: Cow<'static, str>,
    position: Option<CodeRange>,
}

impl DslError {
    #[must_use]
    pub fn new(kind: DslErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            position: None,
        }
    }

    pub(crate) fn syntax(message: impl Into<Cow<'static, str>>, position: CodeRange) -> Self {
        Self::new(DslErrorKind::Syntax, message).at(position)
    }

    pub(crate) fn name(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(DslErrorKind::Name, message)
    }

    pub(crate) fn arity(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(DslErrorKind::Arity, message)
    }

    pub(crate) fn type_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(DslErrorKind::Type, message)
    }

    pub(crate) fn numeric(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(DslErrorKind::Numeric, message)
    }

    pub(crate) fn runner(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(DslErrorKind::Runner, message)
    }

    /// Attaches a source position, keeping an already-present one.
    ///
    /// Errors bubble up through nested `evaluate` calls; the innermost node
    /// that knows its span wins, so outer nodes can call this unconditionally.
    #[must_use]
    pub fn at(mut self, position: CodeRange) -> Self {
        if self.position.is_none() {
            self.position = Some(position);
        }
        self
    }

    #[must_use]
    pub fn kind(&self) -> DslErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn position(&self) -> Option<CodeRange> {
        self.position
    }
}

impl fmt::Display for DslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(range) => write!(
                f,
                "{} at line {}, column {}: {}",
                self.kind.label(),
                range.start().line,
                range.start().column,
                self.message
            ),
            None => write!(f, "{}: {}", self.kind.label(), self.message),
        }
    }
}

impl std::error::Error for DslError {}

pub type DslResult<T> = Result<T, DslError>;
