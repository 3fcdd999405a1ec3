//! Evaluation tests: arithmetic, dates, comparisons, conditionals, and the
//! memoised specialisation of user-defined functions.

use std::sync::Arc;

use covenant::{
    CompileOptions, Compiled, DslErrorKind, EvalContext, Expr, ExprRef, Value, apply, compile, parse_date,
    parse_timedelta,
};

fn compile_expr(source: &str) -> ExprRef {
    compile_expr_with(source, CompileOptions::new())
}

fn compile_expr_with(source: &str, options: CompileOptions) -> ExprRef {
    match compile(source, &options).unwrap_or_else(|e| panic!("failed to compile {source:?}: {e}")) {
        Compiled::Expr(expr) => expr,
        other => panic!("expected an expression for {source:?}, got {other:?}"),
    }
}

fn compile_def(source: &str) -> Arc<covenant::FunctionDef> {
    match compile(source, &CompileOptions::new()).unwrap() {
        Compiled::FunctionDef(def) => def,
        other => panic!("expected a function definition for {source:?}, got {other:?}"),
    }
}

fn evaluate(source: &str) -> Value {
    compile_expr(source)
        .evaluate(&EvalContext::new())
        .unwrap_or_else(|e| panic!("failed to evaluate {source:?}: {e}"))
}

fn operands(expr: &ExprRef) -> (&ExprRef, &ExprRef) {
    match &expr.expr {
        Expr::Op { left, right, .. } => (left, right),
        other => panic!("expected a binary operation, got {other:?}"),
    }
}

#[test]
fn arithmetic_scenarios() {
    assert_eq!(evaluate("5 + 2"), Value::Int(7));
    assert_eq!(evaluate("5 - 2"), Value::Int(3));
    assert_eq!(evaluate("5 * 2"), Value::Int(10));
    assert_eq!(evaluate("5 / 2"), Value::Float(2.5));
    assert_eq!(evaluate("5.0 / 2"), Value::Float(2.5));
    assert_eq!(evaluate("5 / 2.0"), Value::Float(2.5));
    assert_eq!(evaluate("5 // 2"), Value::Int(2));
    assert_eq!(evaluate("5 ** 2"), Value::Int(25));
    assert_eq!(evaluate("5 % 2"), Value::Int(1));
}

#[test]
fn compile_time_bindings_substitute_names() {
    let expr = compile_expr_with("foo", CompileOptions::new().with_binding("foo", Value::Int(20)));
    assert_eq!(expr.evaluate(&EvalContext::new()).unwrap(), Value::Int(20));

    let expr = compile_expr_with("foo", CompileOptions::new().with_binding("foo", Value::Str("f".into())));
    assert_eq!(expr.evaluate(&EvalContext::new()).unwrap(), Value::Str("f".into()));
}

#[test]
fn unary_minus() {
    let expr = compile_expr_with("-bar", CompileOptions::new().with_binding("bar", Value::Int(5)));
    assert_eq!(expr.evaluate(&EvalContext::new()).unwrap(), Value::Int(-5));

    assert_eq!(evaluate("-Max(1, 3)"), Value::Int(-3));
    assert_eq!(evaluate("-Max(-1, -3)"), Value::Int(1));

    let expr = compile_expr_with("-Max(bar - 4, -9)", CompileOptions::new().with_binding("bar", Value::Int(-4)));
    assert_eq!(expr.evaluate(&EvalContext::new()).unwrap(), Value::Int(8));
}

#[test]
fn comparisons() {
    assert_eq!(evaluate("1 == 1"), Value::Bool(true));
    assert_eq!(evaluate("1 == 2"), Value::Bool(false));
    assert_eq!(evaluate("2 != 1"), Value::Bool(true));
    assert_eq!(evaluate("1 < 2"), Value::Bool(true));
    assert_eq!(evaluate("1 <= 1"), Value::Bool(true));
    assert_eq!(evaluate("1 <= 0"), Value::Bool(false));
    assert_eq!(evaluate("1 > 0"), Value::Bool(true));
    assert_eq!(evaluate("0 >= 1"), Value::Bool(false));
}

#[test]
fn chained_comparisons_short_circuit() {
    assert_eq!(evaluate("1 < 2 < 3"), Value::Bool(true));
    assert_eq!(evaluate("1 <= 2 <= 3"), Value::Bool(true));
    assert_eq!(evaluate("1 <= 2 >= 0"), Value::Bool(true));
    assert_eq!(evaluate("1 <= 2 >= 3"), Value::Bool(false));
}

#[test]
fn conditional_expressions_pick_lazily() {
    let cases = [
        (0, 1, Value::Int(0)),
        (2, 1, Value::Int(2)),
        (4, 1, Value::Int(4)),
        (5, 0, Value::Int(0)),
    ];
    for (foo, bar, expected) in cases {
        let options = CompileOptions::new()
            .with_binding("foo", Value::Int(foo))
            .with_binding("bar", Value::Int(bar));
        let expr = compile_expr_with("foo if bar else 0", options);
        assert_eq!(expr.evaluate(&EvalContext::new()).unwrap(), expected);
    }

    assert_eq!(evaluate("6 if 1 else 7 if 1 else 8"), Value::Int(6));
    assert_eq!(evaluate("6 if 0 else 7 if 1 else 8"), Value::Int(7));
    assert_eq!(evaluate("6 if 0 else 7 if 0 else 8"), Value::Int(8));
}

#[test]
fn if_statements_evaluate_like_conditionals() {
    let source = "if bar:\n    foo\nelif hee:\n    haa\nelse:\n    -1";
    let cases = [
        (0, 1, 1, 3, Value::Int(0)),
        (2, 1, 1, 3, Value::Int(2)),
        (6, 0, 1, 3, Value::Int(3)),
        (6, 0, 0, 3, Value::Int(-1)),
    ];
    for (foo, bar, hee, haa, expected) in cases {
        let options = CompileOptions::new()
            .with_binding("foo", Value::Int(foo))
            .with_binding("bar", Value::Int(bar))
            .with_binding("hee", Value::Int(hee))
            .with_binding("haa", Value::Int(haa));
        let expr = compile_expr_with(source, options);
        assert_eq!(expr.evaluate(&EvalContext::new()).unwrap(), expected);
    }
}

#[test]
fn date_and_timedelta_literals() {
    assert_eq!(
        evaluate("Date('2014-12-31')"),
        Value::Date(parse_date("2014-12-31").unwrap())
    );
    assert_eq!(
        evaluate("TimeDelta('1d')"),
        Value::TimeDelta(parse_timedelta("1d").unwrap())
    );
}

#[test]
fn date_arithmetic() {
    assert_eq!(
        evaluate("Date('2014-12-31') - TimeDelta('1d')"),
        Value::Date(parse_date("2014-12-30").unwrap())
    );
    assert_eq!(
        evaluate("Date('2014-12-29') + TimeDelta('1d')"),
        Value::Date(parse_date("2014-12-30").unwrap())
    );
    assert_eq!(evaluate("2 * TimeDelta('1d')"), Value::timedelta_days(2));
}

#[test]
fn date_comparisons() {
    assert_eq!(evaluate("Date('2014-12-30') < Date('2014-12-31')"), Value::Bool(true));
    assert_eq!(evaluate("Date('2014-12-31') < Date('2014-12-30')"), Value::Bool(false));
    assert_eq!(evaluate("Date('2014-12-31') == Date('2014-12-31')"), Value::Bool(true));
    assert_eq!(evaluate("Date('2014-12-30') != Date('2014-12-31')"), Value::Bool(true));
}

#[test]
fn nested_max_calls() {
    assert_eq!(evaluate("Max(1, 2)"), Value::Int(2));
    assert_eq!(evaluate("Max(Max(1, 2), 3)"), Value::Int(3));
    assert_eq!(evaluate("Max(Max(Max(1, 2), 3), 4)"), Value::Int(4));
    assert_eq!(evaluate("Max(1 + 4, 2)"), Value::Int(5));
}

#[test]
fn on_evaluates_at_the_given_date() {
    assert_eq!(evaluate("On('2012-01-01', 5)"), Value::Int(5));
}

#[test]
fn unresolved_names_fail_with_a_name_error() {
    let expr = compile_expr("foo");
    let err = expr.evaluate(&EvalContext::new()).unwrap_err();
    assert_eq!(err.kind(), DslErrorKind::Name);
    assert!(err.message().contains("foo"), "message should name the identifier: {err}");
}

#[test]
fn incompatible_operands_fail_with_a_type_error() {
    let expr = compile_expr("Date('2014-12-31') * Date('2014-12-31')");
    let err = expr.evaluate(&EvalContext::new()).unwrap_err();
    assert_eq!(err.kind(), DslErrorKind::Type);
}

#[test]
fn division_by_zero_fails_with_a_numeric_error() {
    let expr = compile_expr("1 / 0");
    let err = expr.evaluate(&EvalContext::new()).unwrap_err();
    assert_eq!(err.kind(), DslErrorKind::Numeric);
}

#[test]
fn market_without_an_observation_date_fails() {
    let expr = compile_expr("Market('#1')");
    let err = expr.evaluate(&EvalContext::new()).unwrap_err();
    assert_eq!(err.kind(), DslErrorKind::Type);
}

#[test]
fn market_without_simulated_prices_fails_with_a_name_error() {
    let expr = compile_expr("Market('#1')");
    let ctx = EvalContext::new().with_present_time(parse_date("2011-01-01").unwrap());
    let err = expr.evaluate(&ctx).unwrap_err();
    assert_eq!(err.kind(), DslErrorKind::Name);
}

#[test]
fn a_simple_function_definition_compiles_to_itself() {
    let def = compile_def("def a(): 1");
    assert_eq!(def.name, "a");
    assert!(def.call_arg_names.is_empty());
    assert_eq!(def.call_cache_len(), 0);

    let applied = apply(&def, &[]).unwrap();
    assert!(matches!(applied.expr, Expr::Int(1)));
    assert_eq!(applied.evaluate(&EvalContext::new()).unwrap(), Value::Int(1));
    assert_eq!(def.call_cache_len(), 1);

    // a fresh parse starts with a fresh cache
    let def = compile_def("def a(): 1");
    assert_eq!(def.call_cache_len(), 0);
}

#[test]
fn function_bodies_evaluate_under_explicit_bindings() {
    let def = compile_def("def a(b): return Max(b, 2)");
    assert_eq!(def.name, "a");
    assert_eq!(def.call_arg_names, vec!["b".to_string()]);
    assert!(matches!(def.body.expr, Expr::Max { .. }));

    let ctx = EvalContext::new().with_binding("b", Value::Int(0));
    assert_eq!(def.body.evaluate(&ctx).unwrap(), Value::Int(2));
    let ctx = EvalContext::new().with_binding("b", Value::Int(4));
    assert_eq!(def.body.evaluate(&ctx).unwrap(), Value::Int(4));

    let a0 = apply(&def, &[("b", Value::Int(0))]).unwrap();
    assert_eq!(a0.evaluate(&EvalContext::new()).unwrap(), Value::Int(2));
    let a4 = apply(&def, &[("b", Value::Int(4))]).unwrap();
    assert_eq!(a4.evaluate(&EvalContext::new()).unwrap(), Value::Int(4));

    // the return statement is optional
    let def = compile_def("def a(b): Max(b, 2)");
    assert_eq!(apply(&def, &[("b", Value::Int(0))]).unwrap().evaluate(&EvalContext::new()).unwrap(), Value::Int(2));
    assert_eq!(apply(&def, &[("b", Value::Int(4))]).unwrap().evaluate(&EvalContext::new()).unwrap(), Value::Int(4));
}

#[test]
fn conditional_bodies_specialise_per_argument() {
    let def = compile_def("def a(b): Max(b, 2) if b != 0 else 0");
    assert!(matches!(def.body.expr, Expr::IfExp { .. }));

    let a0 = apply(&def, &[("b", Value::Int(0))]).unwrap();
    assert!(matches!(a0.expr, Expr::Int(0)), "b = 0 selects the else branch");

    let a1 = apply(&def, &[("b", Value::Int(1))]).unwrap();
    let Expr::Max { left, right } = &a1.expr else {
        panic!("b = 1 selects the Max branch, got {a1}");
    };
    assert!(matches!(left.expr, Expr::Int(1)));
    assert!(matches!(right.expr, Expr::Int(2)));
    assert_eq!(a1.evaluate(&EvalContext::new()).unwrap(), Value::Int(2));

    let a3 = apply(&def, &[("b", Value::Int(3))]).unwrap();
    assert_eq!(a3.evaluate(&EvalContext::new()).unwrap(), Value::Int(3));
}

#[test]
fn recursive_definitions_memoise_and_share_subexpressions() {
    let def = compile_def("def fib(n): return fib(n - 1) + fib(n - 2) if n > 2 else n");
    assert_eq!(def.name, "fib");
    assert_eq!(def.call_arg_names, vec!["n".to_string()]);
    assert_eq!(def.call_cache_len(), 0);

    let fib1 = apply(&def, &[("n", Value::Int(1))]).unwrap();
    assert!(matches!(fib1.expr, Expr::Int(1)));
    assert_eq!(def.call_cache_len(), 1);

    let fib2 = apply(&def, &[("n", Value::Int(2))]).unwrap();
    assert!(matches!(fib2.expr, Expr::Int(2)));
    assert_eq!(def.call_cache_len(), 2);

    let fib3 = apply(&def, &[("n", Value::Int(3))]).unwrap();
    assert_eq!(fib3.evaluate(&EvalContext::new()).unwrap(), Value::Int(3));
    assert_eq!(def.call_cache_len(), 3);

    let fib4 = apply(&def, &[("n", Value::Int(4))]).unwrap();
    assert_eq!(fib4.evaluate(&EvalContext::new()).unwrap(), Value::Int(5));
    assert_eq!(def.call_cache_len(), 4);

    let fib5 = apply(&def, &[("n", Value::Int(5))]).unwrap();
    assert_eq!(fib5.evaluate(&EvalContext::new()).unwrap(), Value::Int(8));
    assert_eq!(def.call_cache_len(), 5);

    // repeated sub-problems are the same shared node, not copies
    let (fib4_expr, fib3_expr) = operands(&fib5);
    let (fib3_inner, fib2_in_fib4) = operands(fib4_expr);
    assert!(Arc::ptr_eq(fib3_expr, fib3_inner), "fib(3) must be shared");
    let (fib2_in_fib3, _fib1) = operands(fib3_expr);
    assert!(Arc::ptr_eq(fib2_in_fib4, fib2_in_fib3), "fib(2) must be shared");

    // applying again returns the cached node without growing the cache
    let fib5_again = apply(&def, &[("n", Value::Int(5))]).unwrap();
    assert!(Arc::ptr_eq(&fib5, &fib5_again));
    assert_eq!(def.call_cache_len(), 5);
}

#[test]
fn equal_argument_values_share_one_cache_entry() {
    let def = compile_def("def a(b): Max(b, 2)");
    let from_int = apply(&def, &[("b", Value::Int(2))]).unwrap();
    let from_float = apply(&def, &[("b", Value::Float(2.0))]).unwrap();
    assert!(Arc::ptr_eq(&from_int, &from_float));
    assert_eq!(def.call_cache_len(), 1);
}

#[test]
fn modules_inline_their_function_calls() {
    let source = "def sqr(n):\n    n ** 2\nsqr(3)";
    assert_eq!(evaluate(source), Value::Int(9));

    let source =
        "def add(a, b):\n    a + b\ndef mul(a, b):\n    a if b == 1 else add(a, mul(a, b - 1))\nmul(3, 3)";
    assert_eq!(evaluate(source), Value::Int(9));
}

#[test]
fn calling_an_undefined_function_fails() {
    let err = compile("g(1)", &CompileOptions::new()).unwrap_err();
    assert_eq!(err.kind(), DslErrorKind::Name);
}

#[test]
fn wrong_call_arity_fails() {
    let err = compile("def f(a): a\nf(1, 2)", &CompileOptions::new()).unwrap_err();
    assert_eq!(err.kind(), DslErrorKind::Arity);
}

#[test]
fn duplicate_definitions_fail() {
    let err = compile("def f(a): a\ndef f(b): b\nf(1)", &CompileOptions::new()).unwrap_err();
    assert_eq!(err.kind(), DslErrorKind::Syntax);
}

#[test]
fn unbounded_recursion_is_cut_off() {
    let err = compile("def f(n): f(n + 1)\nf(0)", &CompileOptions::new()).unwrap_err();
    assert_eq!(err.kind(), DslErrorKind::Recursion);
}
