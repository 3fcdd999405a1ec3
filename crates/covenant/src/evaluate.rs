use std::sync::Arc;

use ahash::AHashMap;
use chrono::{DateTime, Utc};

use crate::{
    error::{DslError, DslResult},
    expressions::{BoolOperator, Expr, ExprLoc, ExprRef, Operator, StubId},
    least_squares::LeastSquares,
    price_process::{AllMarketPrices, BlackScholesPriceProcess, PriceProcess},
    value::{Value, parse_date, parse_timedelta},
};

/// Everything an expression may consult while evaluating.
///
/// Contexts are cheap to clone: the market table, the price process, and the
/// published stub results are all behind `Arc`, so the runners can hand every
/// worker its own context without copying path vectors.
#[derive(Clone)]
pub struct EvalContext {
    /// Name bindings, normally empty after compilation has substituted them.
    pub bindings: AHashMap<String, Value>,
    /// The date valuation currently observes from. Shifted by `On`/`Fixing`/`Wait`.
    pub present_time: Option<DateTime<Utc>>,
    /// Continuously compounded discount rate, in percent.
    pub interest_rate: f64,
    /// Number of Monte-Carlo paths; used to broadcast scalar continuations.
    pub path_count: usize,
    /// Simulated prices per market and fixing date.
    pub market_prices: Arc<AllMarketPrices>,
    /// Year-fraction measure for discounting.
    pub price_process: Arc<dyn PriceProcess>,
    /// Results already published by a dependency-graph runner.
    pub stub_results: Arc<AHashMap<StubId, Value>>,
}

impl Default for EvalContext {
    fn default() -> Self {
        Self {
            bindings: AHashMap::new(),
            present_time: None,
            interest_rate: 0.0,
            path_count: 0,
            market_prices: Arc::new(AllMarketPrices::new()),
            price_process: Arc::new(BlackScholesPriceProcess),
            stub_results: Arc::new(AHashMap::new()),
        }
    }
}

impl EvalContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_binding(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_present_time(mut self, present_time: DateTime<Utc>) -> Self {
        self.present_time = Some(present_time);
        self
    }

    /// The same context observed from a different date.
    #[must_use]
    pub(crate) fn at_time(&self, present_time: DateTime<Utc>) -> Self {
        let mut shifted = self.clone();
        shifted.present_time = Some(present_time);
        shifted
    }

    #[must_use]
    pub(crate) fn with_stub_results(&self, results: AHashMap<StubId, Value>) -> Self {
        let mut ctx = self.clone();
        ctx.stub_results = Arc::new(results);
        ctx
    }

    fn present_time_or_err(&self, what: &str) -> DslResult<DateTime<Utc>> {
        self.present_time
            .ok_or_else(|| DslError::type_error(format!("{what} requires an observation date")))
    }
}

impl ExprLoc {
    /// Computes the value of this expression under the given context.
    pub fn evaluate(&self, ctx: &EvalContext) -> DslResult<Value> {
        let position = self.position;
        let result = match &self.expr {
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Float(x) => Ok(Value::Float(*x)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Name(name) => ctx
                .bindings
                .get(name)
                .cloned()
                .ok_or_else(|| DslError::name(format!("name '{name}' is not defined"))),
            Expr::UnarySub(operand) => operand.evaluate(ctx)?.neg(),
            Expr::Op { left, op, right } => {
                let left = left.evaluate(ctx)?;
                let right = right.evaluate(ctx)?;
                match op {
                    Operator::Add => left.add(&right),
                    Operator::Sub => left.sub(&right),
                    Operator::Mult => left.mult(&right),
                    Operator::Div => left.div(&right),
                    Operator::FloorDiv => left.floor_div(&right),
                    Operator::Pow => left.pow(&right),
                    Operator::Mod => left.modulo(&right),
                }
            }
            Expr::Compare { left, comparisons } => {
                let mut current = left.evaluate(ctx)?;
                let mut outcome = true;
                for (op, comparator) in comparisons {
                    let next = comparator.evaluate(ctx)?;
                    if !current.compare(*op, &next)? {
                        outcome = false;
                        break;
                    }
                    current = next;
                }
                Ok(Value::Bool(outcome))
            }
            Expr::BoolOp { op, values } => {
                let mut outcome = matches!(op, BoolOperator::And);
                for value in values {
                    let truthy = value.evaluate(ctx)?.truthy()?;
                    match op {
                        BoolOperator::And if !truthy => {
                            outcome = false;
                            break;
                        }
                        BoolOperator::Or if truthy => {
                            outcome = true;
                            break;
                        }
                        BoolOperator::And | BoolOperator::Or => {}
                    }
                }
                Ok(Value::Bool(outcome))
            }
            Expr::IfExp { test, body, or_else } | Expr::If { test, body, or_else } => {
                if test.evaluate(ctx)?.truthy()? {
                    body.evaluate(ctx)
                } else {
                    or_else.evaluate(ctx)
                }
            }
            Expr::Call { name, .. } => Err(DslError::name(format!(
                "function '{name}' must be compiled away before evaluation"
            ))),
            Expr::Date(arg) => match arg.evaluate(ctx)? {
                Value::Str(text) => Ok(Value::Date(parse_date(&text)?)),
                Value::Date(d) => Ok(Value::Date(d)),
                other => Err(DslError::type_error(format!(
                    "Date expects a 'YYYY-MM-DD' string, got {}",
                    other.type_name()
                ))),
            },
            Expr::TimeDelta(arg) => match arg.evaluate(ctx)? {
                Value::Str(text) => Ok(Value::TimeDelta(parse_timedelta(&text)?)),
                Value::TimeDelta(t) => Ok(Value::TimeDelta(t)),
                other => Err(DslError::type_error(format!(
                    "TimeDelta expects a string like '1d', got {}",
                    other.type_name()
                ))),
            },
            Expr::Max { left, right } => {
                let left = left.evaluate(ctx)?;
                let right = right.evaluate(ctx)?;
                left.max_with(&right)
            }
            Expr::On { date, body } | Expr::Fixing { date, body } => {
                let fixing = resolve_date(date, ctx)?;
                body.evaluate(&ctx.at_time(fixing))
            }
            Expr::Wait { date, body } => {
                let fixing = resolve_date(date, ctx)?;
                let value = body.evaluate(&ctx.at_time(fixing))?;
                discount(&value, fixing, ctx)
            }
            Expr::Settlement { date, body } => {
                let settlement = resolve_date(date, ctx)?;
                let value = body.evaluate(ctx)?;
                discount(&value, settlement, ctx)
            }
            Expr::Market(tag) => {
                let name = match tag.evaluate(ctx)? {
                    Value::Str(name) => name,
                    other => {
                        return Err(DslError::type_error(format!(
                            "Market expects a string tag, got {}",
                            other.type_name()
                        ))
                        .at(position));
                    }
                };
                let observed = ctx.present_time_or_err("Market")?;
                market_prices_at(ctx, &name, observed).map(Value::Vector)
            }
            Expr::Underlying(body) => body.evaluate(ctx),
            Expr::Choice { left, right } => evaluate_choice(self, left, right, ctx),
            Expr::Stub(id) => ctx
                .stub_results
                .get(id)
                .cloned()
                .ok_or_else(|| DslError::runner(format!("stub {id} has no published result"))),
        };
        result.map_err(|e| e.at(position))
    }
}

fn resolve_date(date: &ExprRef, ctx: &EvalContext) -> DslResult<DateTime<Utc>> {
    match date.evaluate(ctx)? {
        Value::Date(d) => Ok(d),
        Value::Str(text) => parse_date(&text),
        other => Err(DslError::type_error(format!(
            "expected a date, got {}",
            other.type_name()
        ))
        .at(date.position)),
    }
}

/// Discounts a value from `date` back to the context's observation date by
/// `exp(-r/100 * dt)` under the price process's year-fraction measure.
fn discount(value: &Value, date: DateTime<Utc>, ctx: &EvalContext) -> DslResult<Value> {
    let start = ctx.present_time_or_err("discounting")?;
    let years = ctx.price_process.duration_years(start, date);
    let factor = (-ctx.interest_rate / 100.0 * years).exp();
    value.mult(&Value::Float(factor))
}

fn market_prices_at(ctx: &EvalContext, market: &str, date: DateTime<Utc>) -> DslResult<Arc<Vec<f64>>> {
    let fixings = ctx
        .market_prices
        .get(market)
        .ok_or_else(|| DslError::name(format!("no simulated prices for market '{market}'")))?;
    fixings.get(&date).cloned().ok_or_else(|| {
        DslError::name(format!(
            "no simulated prices for market '{market}' at {}",
            date.format("%Y-%m-%d")
        ))
    })
}

/// Longstaff-Schwartz choice between exercise and continuation.
///
/// The continuation is regressed on the current state (constant, price, and
/// squared price of every market the operands mention) to estimate its
/// conditional expectation. The fit only decides *where* continuation wins;
/// those paths carry the realised continuation value, which keeps the
/// Monte-Carlo estimator unbiased.
fn evaluate_choice(node: &ExprLoc, left: &ExprRef, right: &ExprRef, ctx: &EvalContext) -> DslResult<Value> {
    let exercise = left.evaluate(ctx)?;
    let continuation = right.evaluate(ctx)?;

    let path_count = match (&exercise, &continuation) {
        (Value::Vector(a), _) => a.len(),
        (_, Value::Vector(b)) => b.len(),
        // with two deterministic alternatives the conditional expectation of
        // the continuation is itself, so the choice degenerates to a maximum
        _ => return exercise.max_with(&continuation),
    };

    let exercise_paths = per_path_samples(&exercise, path_count)?;
    let continuation_paths = per_path_samples(&continuation, path_count)?;

    let mut regressors = vec![vec![1.0; path_count]];
    let observed = ctx.present_time_or_err("Choice")?;
    for market in node.market_names() {
        let prices = market_prices_at(ctx, &market, observed)?;
        if prices.len() != path_count {
            return Err(DslError::numeric(format!(
                "market '{market}' has {} paths, expected {path_count}",
                prices.len()
            )));
        }
        regressors.push(prices.to_vec());
        regressors.push(prices.iter().map(|price| price * price).collect());
    }

    let fitted = LeastSquares::new(regressors, continuation_paths.clone())?.fit()?;
    let chosen = exercise_paths
        .iter()
        .zip(&continuation_paths)
        .zip(&fitted)
        .map(|((a, b), estimate)| if *estimate >= *a { *b } else { *a })
        .collect();
    Ok(Value::vector(chosen))
}

fn per_path_samples(value: &Value, path_count: usize) -> DslResult<Vec<f64>> {
    match value {
        Value::Vector(samples) => {
            if samples.len() == path_count {
                Ok(samples.as_ref().clone())
            } else {
                Err(DslError::numeric(format!(
                    "vector length mismatch in Choice: {} vs {path_count}",
                    samples.len()
                )))
            }
        }
        other => {
            let scalar = other.as_f64().ok_or_else(|| {
                DslError::type_error(format!(
                    "Choice operands must be numbers or vectors, got {}",
                    other.type_name()
                ))
            })?;
            Ok(vec![scalar; path_count])
        }
    }
}
