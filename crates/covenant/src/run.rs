use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::{
    compile::Compiled,
    error::{DslError, DslErrorKind, DslResult},
    evaluate::EvalContext,
    expressions::{Expr, ExprRef, Module},
    parse::parse_source,
    price_process::{AllMarketPrices, BlackScholesPriceProcess, MarketCalibration, PriceProcess},
    runners::{SingleThreadedRunner, WorkerPoolRunner},
    value::{Value, parse_date},
};

/// Parses DSL source into a [`Module`].
///
/// An empty source parses to an empty module; it is compilation that
/// requires an expression.
pub fn parse(source: &str) -> DslResult<Module> {
    parse_source(source)
}

/// Options for [`compile`].
#[derive(Default)]
pub struct CompileOptions {
    /// Compile-time value bindings, substituted for free names.
    pub bindings: IndexMap<String, Value>,
    /// Produce a dependency graph instead of one inlined expression.
    pub is_parallel: bool,
}

impl CompileOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn parallel() -> Self {
        Self {
            is_parallel: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_binding(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.insert(name.into(), value);
        self
    }
}

/// Parses and compiles DSL source in one step.
pub fn compile(source: &str, options: &CompileOptions) -> DslResult<Compiled> {
    parse(source)?.compile(&options.bindings, options.is_parallel)
}

/// How [`eval`] executes the compiled contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunnerKind {
    /// Serial compilation, direct evaluation of the inlined expression.
    #[default]
    Inline,
    /// Parallel compilation, single-threaded graph runner.
    SingleThreaded,
    /// Parallel compilation, worker-pool graph runner.
    WorkerPool { workers: usize },
}

/// Evaluation-time arguments for [`eval`].
pub struct EvalArgs {
    /// The date valuation is performed from.
    pub observation_time: DateTime<Utc>,
    /// Continuously compounded discount rate, in percent.
    pub interest_rate: f64,
    /// Number of Monte-Carlo paths to simulate.
    pub path_count: usize,
    /// Market calibration used when prices need simulating.
    pub market_calibration: MarketCalibration,
    /// Pre-simulated prices; supplying these skips simulation entirely.
    pub all_market_prices: Option<AllMarketPrices>,
    pub runner: RunnerKind,
    /// Seed for the price-process RNG, so valuations are reproducible.
    pub seed: u64,
}

impl EvalArgs {
    #[must_use]
    pub fn new(observation_time: DateTime<Utc>) -> Self {
        Self {
            observation_time,
            interest_rate: 0.0,
            path_count: 20_000,
            market_calibration: MarketCalibration::new(),
            all_market_prices: None,
            runner: RunnerKind::Inline,
            seed: 1,
        }
    }
}

/// The aggregated result of an evaluation: the mean over all paths.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalOutcome {
    pub mean: f64,
}

/// Parses, compiles, and evaluates a contract: markets and fixing dates are
/// collected from the compiled expression, prices are simulated under the
/// price process (unless supplied), and the result is averaged across paths.
pub fn eval(source: &str, args: &EvalArgs) -> DslResult<EvalOutcome> {
    let options = CompileOptions {
        bindings: IndexMap::new(),
        is_parallel: args.runner != RunnerKind::Inline,
    };
    let compiled = compile(source, &options)?;

    let exprs: Vec<ExprRef> = match &compiled {
        Compiled::Expr(expr) => vec![expr.clone()],
        Compiled::Graph(graph) => graph
            .stubbed_exprs()
            .values()
            .map(|stubbed| stubbed.expr.clone())
            .collect(),
        Compiled::FunctionDef(_) => {
            return Err(DslError::new(
                DslErrorKind::Syntax,
                "module has no expression to evaluate",
            ));
        }
    };

    let markets = collect_market_names(&exprs);
    let process = BlackScholesPriceProcess;
    let market_prices = match &args.all_market_prices {
        Some(prices) => prices.clone(),
        None if markets.is_empty() => AllMarketPrices::new(),
        None => {
            let fixing_dates = collect_fixing_dates(&exprs);
            process.simulate(
                &markets,
                args.observation_time,
                &fixing_dates,
                &args.market_calibration,
                args.path_count,
                args.seed,
            )?
        }
    };

    let ctx = EvalContext {
        present_time: Some(args.observation_time),
        interest_rate: args.interest_rate,
        path_count: args.path_count,
        market_prices: Arc::new(market_prices),
        price_process: Arc::new(process),
        ..EvalContext::new()
    };

    let value = match compiled {
        Compiled::Expr(expr) => expr.evaluate(&ctx)?,
        Compiled::Graph(graph) => match args.runner {
            RunnerKind::SingleThreaded | RunnerKind::Inline => SingleThreadedRunner::new(graph).evaluate(&ctx)?,
            RunnerKind::WorkerPool { workers } => WorkerPoolRunner::new(graph, workers).evaluate(&ctx)?,
        },
        Compiled::FunctionDef(_) => unreachable!("rejected above"),
    };

    let mean = match value {
        Value::Int(n) => n as f64,
        Value::Float(x) => x,
        Value::Bool(b) => f64::from(b),
        Value::Vector(samples) => {
            if samples.is_empty() {
                return Err(DslError::numeric("cannot average an empty vector"));
            }
            samples.iter().sum::<f64>() / samples.len() as f64
        }
        other => {
            return Err(DslError::type_error(format!(
                "cannot aggregate a {} result",
                other.type_name()
            )));
        }
    };
    Ok(EvalOutcome { mean })
}

fn collect_market_names(exprs: &[ExprRef]) -> Vec<String> {
    let mut markets = Vec::new();
    for expr in exprs {
        for market in expr.market_names() {
            if !markets.contains(&market) {
                markets.push(market);
            }
        }
    }
    markets
}

/// Every date that shifts the observation point somewhere in the compiled
/// expressions. Date arguments are literal after compilation; anything that
/// fails to resolve statically is left for evaluation to report.
fn collect_fixing_dates(exprs: &[ExprRef]) -> Vec<DateTime<Utc>> {
    let pure_ctx = EvalContext::new();
    let mut dates = Vec::new();
    for expr in exprs {
        expr.visit(&mut |node| {
            let date_arg = match &node.expr {
                Expr::On { date, .. }
                | Expr::Fixing { date, .. }
                | Expr::Wait { date, .. }
                | Expr::Settlement { date, .. } => date,
                _ => return,
            };
            let resolved = match date_arg.evaluate(&pure_ctx) {
                Ok(Value::Date(date)) => Some(date),
                Ok(Value::Str(text)) => parse_date(&text).ok(),
                _ => None,
            };
            if let Some(date) = resolved {
                if !dates.contains(&date) {
                    dates.push(date);
                }
            }
        });
    }
    dates
}
