use std::sync::Arc;

use ruff_python_ast::{self as ast, Expr as AstExpr, Number, Operator as AstOperator, Stmt, UnaryOp};
use ruff_python_parser::parse_module;
use ruff_text_size::{Ranged, TextRange};

use smallvec::SmallVec;

use crate::{
    error::{CodeLoc, CodeRange, DslError, DslResult},
    expressions::{BoolOperator, CmpOperator, Expr, ExprLoc, ExprRef, Module, Operator, Statement},
    function::FunctionDef,
};

/// Maximum nesting depth for expressions during lowering. Deeply nested
/// sources fail with a syntax error instead of blowing the stack.
const MAX_NESTING_DEPTH: u16 = 120;

/// Parses DSL source into a [`Module`].
///
/// The surface syntax is an indentation-sensitive Python subset, so the heavy
/// lifting is done by `ruff_python_parser`; this pass lowers the ruff AST
/// into the semantic tree and rejects everything the DSL does not admit.
pub(crate) fn parse_source(code: &str) -> DslResult<Module> {
    let mut parser = Parser::new(code);
    let parsed =
        parse_module(code).map_err(|e| DslError::syntax(e.to_string(), parser.convert_range(e.range())))?;
    let module = parsed.into_syntax();
    parser.parse_module_statements(module.body)
}

struct Parser {
    /// Byte offset of every newline, used to turn ruff text offsets into
    /// line/column positions.
    line_ends: Vec<usize>,
    depth_remaining: u16,
}

impl Parser {
    fn new(code: &str) -> Self {
        let line_ends = code
            .bytes()
            .enumerate()
            .filter_map(|(i, b)| (b == b'\n').then_some(i))
            .collect();
        Self {
            line_ends,
            depth_remaining: MAX_NESTING_DEPTH,
        }
    }

    fn convert_range(&self, range: TextRange) -> CodeRange {
        CodeRange::new(self.loc_at(range.start().into()), self.loc_at(range.end().into()))
    }

    fn loc_at(&self, index: usize) -> CodeLoc {
        let line = self.line_ends.partition_point(|end| *end < index);
        let line_start = if line == 0 { 0 } else { self.line_ends[line - 1] + 1 };
        CodeLoc::new(u32::try_from(line).unwrap_or(u32::MAX) + 1, (index - line_start) as u32)
    }

    fn parse_module_statements(&mut self, statements: ast::Suite) -> DslResult<Module> {
        let mut body = Vec::new();
        let mut saw_expression = false;
        for statement in statements {
            let position = self.convert_range(statement.range());
            if saw_expression {
                return Err(DslError::syntax(
                    "the trailing expression must be the last statement of the module",
                    position,
                ));
            }
            match statement {
                Stmt::FunctionDef(function) => {
                    body.push(Statement::FunctionDef(Arc::new(self.parse_function_def(function)?)));
                }
                Stmt::Expr(ast::StmtExpr { value, .. }) => {
                    body.push(Statement::Expr(self.parse_expression(*value)?));
                    saw_expression = true;
                }
                Stmt::If(if_statement) => {
                    body.push(Statement::Expr(self.parse_if_statement(if_statement, false)?));
                    saw_expression = true;
                }
                other => return Err(self.reject_statement(&other, false)),
            }
        }
        Ok(Module { body })
    }

    fn parse_function_def(&mut self, function: ast::StmtFunctionDef) -> DslResult<FunctionDef> {
        let position = self.convert_range(function.range());
        if function.is_async {
            return Err(DslError::syntax("async functions are not supported", position));
        }
        if !function.decorator_list.is_empty() {
            return Err(DslError::syntax("decorators are not supported", position));
        }
        if function.type_params.is_some() {
            return Err(DslError::syntax("type parameters are not supported", position));
        }

        let params = &function.parameters;
        if !params.posonlyargs.is_empty()
            || !params.kwonlyargs.is_empty()
            || params.vararg.is_some()
            || params.kwarg.is_some()
        {
            return Err(DslError::syntax(
                "only plain positional parameters are supported",
                position,
            ));
        }
        let mut call_arg_names = Vec::with_capacity(params.args.len());
        for param in &params.args {
            if param.default.is_some() {
                return Err(DslError::syntax("parameter defaults are not supported", position));
            }
            call_arg_names.push(param.parameter.name.id.to_string());
        }

        let body = self.parse_block(function.body, true)?;
        Ok(FunctionDef::new(
            function.name.id.to_string(),
            call_arg_names,
            body,
            position,
        ))
    }

    /// Lowers an indented block to the single expression it denotes.
    fn parse_block(&mut self, statements: ast::Suite, in_function: bool) -> DslResult<ExprRef> {
        let mut exprs = Vec::new();
        for statement in statements {
            let position = self.convert_range(statement.range());
            match statement {
                Stmt::Expr(ast::StmtExpr { value, .. }) => exprs.push(self.parse_expression(*value)?),
                Stmt::Return(ast::StmtReturn { value, .. }) => {
                    if !in_function {
                        return Err(DslError::syntax("'return' outside of a function", position));
                    }
                    let Some(value) = value else {
                        return Err(DslError::syntax("'return' requires a value", position));
                    };
                    exprs.push(self.parse_expression(*value)?);
                }
                Stmt::If(if_statement) => exprs.push(self.parse_if_statement(if_statement, in_function)?),
                Stmt::FunctionDef(_) => {
                    return Err(DslError::syntax("nested function definitions are not supported", position));
                }
                other => return Err(self.reject_statement(&other, in_function)),
            }
        }
        match exprs.len() {
            1 => Ok(exprs.pop().expect("length checked")),
            0 => Err(DslError::new(
                crate::error::DslErrorKind::Syntax,
                "a block must contain an expression",
            )),
            _ => Err(DslError::new(
                crate::error::DslErrorKind::Syntax,
                "a block must be a single expression",
            )),
        }
    }

    fn parse_if_statement(&mut self, if_statement: ast::StmtIf, in_function: bool) -> DslResult<ExprRef> {
        let position = self.convert_range(if_statement.range());
        let test = self.parse_expression(*if_statement.test)?;
        let body = self.parse_block(if_statement.body, in_function)?;

        // fold elif/else clauses from the back, nesting each elif as an
        // inner if statement
        let mut tail: Option<ExprRef> = None;
        for clause in if_statement.elif_else_clauses.into_iter().rev() {
            let clause_position = self.convert_range(clause.range());
            match clause.test {
                Some(clause_test) => {
                    let clause_test = self.parse_expression(clause_test)?;
                    let clause_body = self.parse_block(clause.body, in_function)?;
                    let or_else = tail.take().ok_or_else(|| {
                        DslError::syntax("an if statement requires an else branch", clause_position)
                    })?;
                    tail = Some(ExprLoc::new(
                        Expr::If {
                            test: clause_test,
                            body: clause_body,
                            or_else,
                        },
                        clause_position,
                    ));
                }
                None => tail = Some(self.parse_block(clause.body, in_function)?),
            }
        }
        let or_else =
            tail.ok_or_else(|| DslError::syntax("an if statement requires an else branch", position))?;
        Ok(ExprLoc::new(Expr::If { test, body, or_else }, position))
    }

    fn reject_statement(&self, statement: &Stmt, in_function: bool) -> DslError {
        let position = self.convert_range(statement.range());
        let what = match statement {
            Stmt::Assign(_) | Stmt::AnnAssign(_) => "assignment is not supported",
            Stmt::AugAssign(_) => "augmented assignment is not supported",
            Stmt::For(_) | Stmt::While(_) => "loops are not supported",
            Stmt::Import(_) | Stmt::ImportFrom(_) => "imports are not supported",
            Stmt::ClassDef(_) => "class definitions are not supported",
            Stmt::With(_) => "with statements are not supported",
            Stmt::Try(_) => "try statements are not supported",
            Stmt::Raise(_) => "raise statements are not supported",
            Stmt::Assert(_) => "assert statements are not supported",
            Stmt::Delete(_) => "del statements are not supported",
            Stmt::Global(_) | Stmt::Nonlocal(_) => "scope declarations are not supported",
            Stmt::Match(_) => "match statements are not supported",
            Stmt::TypeAlias(_) => "type aliases are not supported",
            Stmt::Pass(_) => "pass statements are not supported",
            Stmt::Break(_) | Stmt::Continue(_) => "loop control statements are not supported",
            Stmt::Return(_) if !in_function => "'return' outside of a function",
            _ => "this statement is not supported",
        };
        DslError::syntax(what, position)
    }

    fn parse_expressions(&mut self, expressions: Vec<AstExpr>) -> DslResult<Vec<ExprRef>> {
        expressions.into_iter().map(|e| self.parse_expression(e)).collect()
    }

    fn parse_expression(&mut self, expression: AstExpr) -> DslResult<ExprRef> {
        let position = self.convert_range(expression.range());
        if self.depth_remaining == 0 {
            return Err(DslError::syntax("expression nesting too deep", position));
        }
        self.depth_remaining -= 1;
        let result = self.parse_expression_impl(expression, position);
        self.depth_remaining += 1;
        result
    }

    fn parse_expression_impl(&mut self, expression: AstExpr, position: CodeRange) -> DslResult<ExprRef> {
        let node = |expr: Expr| Ok(ExprLoc::new(expr, position));
        match expression {
            AstExpr::NumberLiteral(ast::ExprNumberLiteral { value, .. }) => match value {
                Number::Int(i) => match i.as_i64() {
                    Some(i) => node(Expr::Int(i)),
                    None => Err(DslError::syntax(format!("integer literal too large: {i}"), position)),
                },
                Number::Float(f) => node(Expr::Float(f)),
                Number::Complex { .. } => Err(DslError::syntax("complex literals are not supported", position)),
            },
            AstExpr::StringLiteral(ast::ExprStringLiteral { value, .. }) => node(Expr::Str(value.to_string())),
            AstExpr::Name(ast::ExprName { id, .. }) => node(Expr::Name(id.to_string())),
            AstExpr::UnaryOp(ast::ExprUnaryOp { op, operand, .. }) => match op {
                UnaryOp::USub => node(Expr::UnarySub(self.parse_expression(*operand)?)),
                UnaryOp::UAdd => Err(DslError::syntax("the unary '+' operator is not supported", position)),
                UnaryOp::Not => Err(DslError::syntax("the 'not' operator is not supported", position)),
                UnaryOp::Invert => Err(DslError::syntax("the '~' operator is not supported", position)),
            },
            AstExpr::BinOp(ast::ExprBinOp { left, op, right, .. }) => {
                let op = match op {
                    AstOperator::Add => Operator::Add,
                    AstOperator::Sub => Operator::Sub,
                    AstOperator::Mult => Operator::Mult,
                    AstOperator::Div => Operator::Div,
                    AstOperator::FloorDiv => Operator::FloorDiv,
                    AstOperator::Pow => Operator::Pow,
                    AstOperator::Mod => Operator::Mod,
                    AstOperator::BitAnd => {
                        return Err(DslError::syntax("the '&' operator is not supported", position));
                    }
                    AstOperator::BitOr => {
                        return Err(DslError::syntax("the '|' operator is not supported", position));
                    }
                    AstOperator::BitXor => {
                        return Err(DslError::syntax("the '^' operator is not supported", position));
                    }
                    AstOperator::LShift => {
                        return Err(DslError::syntax("the '<<' operator is not supported", position));
                    }
                    AstOperator::RShift => {
                        return Err(DslError::syntax("the '>>' operator is not supported", position));
                    }
                    AstOperator::MatMult => {
                        return Err(DslError::syntax("the '@' operator is not supported", position));
                    }
                };
                node(Expr::Op {
                    left: self.parse_expression(*left)?,
                    op,
                    right: self.parse_expression(*right)?,
                })
            }
            AstExpr::BoolOp(ast::ExprBoolOp { op, values, .. }) => {
                let op = match op {
                    ast::BoolOp::And => BoolOperator::And,
                    ast::BoolOp::Or => BoolOperator::Or,
                };
                node(Expr::BoolOp {
                    op,
                    values: self.parse_expressions(values)?,
                })
            }
            AstExpr::Compare(ast::ExprCompare {
                left, ops, comparators, ..
            }) => {
                let left = self.parse_expression(*left)?;
                let mut comparisons = Vec::with_capacity(ops.len());
                for (op, comparator) in ops.into_vec().into_iter().zip(comparators.into_vec()) {
                    let op = match op {
                        ast::CmpOp::Eq => CmpOperator::Eq,
                        ast::CmpOp::NotEq => CmpOperator::NotEq,
                        ast::CmpOp::Lt => CmpOperator::Lt,
                        ast::CmpOp::LtE => CmpOperator::LtE,
                        ast::CmpOp::Gt => CmpOperator::Gt,
                        ast::CmpOp::GtE => CmpOperator::GtE,
                        ast::CmpOp::Is | ast::CmpOp::IsNot => {
                            return Err(DslError::syntax("identity comparisons are not supported", position));
                        }
                        ast::CmpOp::In | ast::CmpOp::NotIn => {
                            return Err(DslError::syntax("membership tests are not supported", position));
                        }
                    };
                    comparisons.push((op, self.parse_expression(comparator)?));
                }
                node(Expr::Compare { left, comparisons })
            }
            AstExpr::If(ast::ExprIf { test, body, orelse, .. }) => node(Expr::IfExp {
                test: self.parse_expression(*test)?,
                body: self.parse_expression(*body)?,
                or_else: self.parse_expression(*orelse)?,
            }),
            AstExpr::Call(ast::ExprCall { func, arguments, .. }) => {
                let ast::Arguments { args, keywords, .. } = arguments;
                if !keywords.is_empty() {
                    return Err(DslError::syntax("keyword arguments are not supported", position));
                }
                let AstExpr::Name(ast::ExprName { id, .. }) = *func else {
                    return Err(DslError::syntax("only calls of named functions are supported", position));
                };
                let mut parsed_args = Vec::with_capacity(args.len());
                for arg in args.into_vec() {
                    if matches!(arg, AstExpr::Starred(_)) {
                        return Err(DslError::syntax("argument unpacking is not supported", position));
                    }
                    parsed_args.push(self.parse_expression(arg)?);
                }
                self.lower_call(id.as_str(), parsed_args, position)
            }
            AstExpr::BooleanLiteral(_) | AstExpr::NoneLiteral(_) | AstExpr::EllipsisLiteral(_) => {
                Err(DslError::syntax("this literal is not supported", position))
            }
            AstExpr::BytesLiteral(_) => Err(DslError::syntax("bytes literals are not supported", position)),
            AstExpr::FString(_) | AstExpr::TString(_) => {
                Err(DslError::syntax("f-strings are not supported", position))
            }
            AstExpr::Attribute(_) => Err(DslError::syntax("attribute access is not supported", position)),
            AstExpr::Subscript(_) | AstExpr::Slice(_) => {
                Err(DslError::syntax("subscripts are not supported", position))
            }
            AstExpr::Lambda(_) => Err(DslError::syntax("lambda is not supported", position)),
            AstExpr::List(_) | AstExpr::Tuple(_) | AstExpr::Set(_) | AstExpr::Dict(_) => {
                Err(DslError::syntax("container literals are not supported", position))
            }
            AstExpr::ListComp(_) | AstExpr::SetComp(_) | AstExpr::DictComp(_) | AstExpr::Generator(_) => {
                Err(DslError::syntax("comprehensions are not supported", position))
            }
            AstExpr::Named(_) => Err(DslError::syntax("assignment expressions are not supported", position)),
            AstExpr::Starred(_) => Err(DslError::syntax("argument unpacking is not supported", position)),
            AstExpr::Await(_) | AstExpr::Yield(_) | AstExpr::YieldFrom(_) => {
                Err(DslError::syntax("async and generator expressions are not supported", position))
            }
            _ => Err(DslError::syntax("this expression is not supported", position)),
        }
    }

    /// Distinguishes the pricing primitives from user-defined function calls
    /// by name, checking primitive arity here so mistakes surface with a
    /// source position.
    fn lower_call(&self, name: &str, args: Vec<ExprRef>, position: CodeRange) -> DslResult<ExprRef> {
        let node = |expr: Expr| Ok(ExprLoc::new(expr, position));
        let one = |mut args: Vec<ExprRef>| -> DslResult<ExprRef> {
            if args.len() == 1 {
                Ok(args.pop().expect("length checked"))
            } else {
                Err(DslError::arity(format!("{name} takes exactly 1 argument ({} given)", args.len()))
                    .at(position))
            }
        };
        let two = |mut args: Vec<ExprRef>| -> DslResult<(ExprRef, ExprRef)> {
            if args.len() == 2 {
                let second = args.pop().expect("length checked");
                let first = args.pop().expect("length checked");
                Ok((first, second))
            } else {
                Err(DslError::arity(format!("{name} takes exactly 2 arguments ({} given)", args.len()))
                    .at(position))
            }
        };

        match name {
            "Date" => node(Expr::Date(one(args)?)),
            "TimeDelta" => node(Expr::TimeDelta(one(args)?)),
            "Market" => node(Expr::Market(one(args)?)),
            "Underlying" => node(Expr::Underlying(one(args)?)),
            "Max" => {
                let (left, right) = two(args)?;
                node(Expr::Max { left, right })
            }
            "Choice" => {
                let (left, right) = two(args)?;
                node(Expr::Choice { left, right })
            }
            "On" => {
                let (date, body) = two(args)?;
                node(Expr::On { date, body })
            }
            "Fixing" => {
                let (date, body) = two(args)?;
                node(Expr::Fixing { date, body })
            }
            "Wait" => {
                let (date, body) = two(args)?;
                node(Expr::Wait { date, body })
            }
            "Settlement" => {
                let (date, body) = two(args)?;
                node(Expr::Settlement { date, body })
            }
            _ => node(Expr::Call {
                name: name.to_string(),
                args: SmallVec::from_vec(args),
            }),
        }
    }
}
