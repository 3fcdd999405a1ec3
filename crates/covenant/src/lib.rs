#![doc = include_str!("../../../README.md")]

mod compile;
mod dependency_graph;
mod error;
mod evaluate;
mod expressions;
mod function;
mod least_squares;
mod namespace;
mod parse;
mod price_process;
mod run;
mod runners;
mod value;

pub use crate::{
    compile::{Compiled, apply},
    dependency_graph::{DependencyGraph, StubbedExpr},
    error::{CodeLoc, CodeRange, DslError, DslErrorKind, DslResult},
    evaluate::EvalContext,
    expressions::{
        BoolOperator, CmpOperator, Expr, ExprLoc, ExprRef, Module, Operator, Statement, StubId,
        substitute_names,
    },
    function::{ArgKey, CallArg, CallKey, FunctionDef},
    least_squares::LeastSquares,
    namespace::Namespace,
    price_process::{AllMarketPrices, BlackScholesPriceProcess, MarketCalibration, PriceProcess},
    run::{CompileOptions, EvalArgs, EvalOutcome, RunnerKind, compile, eval, parse},
    runners::{SingleThreadedRunner, WorkerPoolRunner},
    value::{MICROS_PER_DAY, Value, float_repr, parse_date, parse_timedelta},
};
