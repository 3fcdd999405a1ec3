//! Monte-Carlo valuation tests: contracts priced end to end under the
//! Black-Scholes price process, checked against closed-form or known values
//! within a sampling tolerance.

use std::sync::Arc;

use covenant::{AllMarketPrices, EvalArgs, MarketCalibration, RunnerKind, eval, parse_date};
use indexmap::IndexMap;

fn calibration() -> MarketCalibration {
    [
        ("#1-LAST-PRICE", 10.0),
        ("#1-ACTUAL-HISTORICAL-VOLATILITY", 50.0),
        ("#2-LAST-PRICE", 10.0),
        ("#2-ACTUAL-HISTORICAL-VOLATILITY", 50.0),
        ("#1-#2-CORRELATION", 0.0),
        ("NBP-LAST-PRICE", 10.0),
        ("NBP-ACTUAL-HISTORICAL-VOLATILITY", 50.0),
        ("TTF-LAST-PRICE", 11.0),
        ("TTF-ACTUAL-HISTORICAL-VOLATILITY", 40.0),
        ("NBP-TTF-CORRELATION", 0.4),
    ]
    .into_iter()
    .collect()
}

fn valuation_args() -> EvalArgs {
    EvalArgs {
        interest_rate: 2.5,
        path_count: 200_000,
        market_calibration: calibration(),
        ..EvalArgs::new(parse_date("2011-01-01").unwrap())
    }
}

fn assert_valuation(source: &str, expected: f64, tolerance: f64) {
    let outcome = eval(source, &valuation_args()).unwrap_or_else(|e| panic!("failed to value {source:?}: {e}"));
    assert!(
        (outcome.mean - expected).abs() <= tolerance,
        "estimated {} not close enough to expected {expected} (tolerance {tolerance}) for {source:?}",
        outcome.mean
    );
}

#[test]
fn market_observes_the_spot() {
    assert_valuation("Market('#1')", 10.0, 0.05);
}

#[test]
fn fixing_observes_the_forward() {
    assert_valuation("Fixing(Date('2012-01-01'), Market('#1'))", 10.0, 0.05);
}

#[test]
fn wait_discounts_the_forward() {
    assert_valuation("Wait(Date('2012-01-01'), Market('#1'))", 9.753, 0.05);
}

#[test]
fn settlement_discounts_without_shifting_observation() {
    assert_valuation("Settlement(Date('2012-01-01'), Market('#1'))", 9.753, 0.05);
}

#[test]
fn undiscounted_call_via_choice() {
    assert_valuation("Fixing(Date('2012-01-01'), Choice(Market('#1') - 9, 0))", 2.416, 0.05);
}

#[test]
fn max_of_two_uncorrelated_markets() {
    assert_valuation(
        "Fixing(Date('2012-01-01'), Max(Market('#1'), Market('#2')))",
        12.766,
        0.1,
    );
}

#[test]
fn addition_and_subtraction_of_markets() {
    assert_valuation("10 + Market('#1')", 20.0, 0.05);
    assert_valuation("10 + Market('#2')", 20.0, 0.05);
    assert_valuation("Market('#1') - 10", 0.0, 0.05);
}

#[test]
fn multiplication_and_division_of_markets() {
    assert_valuation("Market('#1') * Market('#2')", 100.0, 0.1);
    assert_valuation("Market('#1') / 10", 1.0, 0.01);
}

#[test]
fn identical_fixings_cancel_exactly() {
    let source = "Fixing(Date('2012-01-01'), Market('#1')) - Fixing(Date('2012-01-01'), Market('#1'))";
    let outcome = eval(source, &valuation_args()).unwrap();
    assert_eq!(outcome.mean, 0.0, "identical fixings must cancel per path");
}

#[test]
fn brownian_increments_are_stationary() {
    let source = "
Wait(
    Date('2012-03-15'),
    Max(
        Fixing(
            Date('2012-01-01'),
            Market('#1')
        ) /
        Fixing(
            Date('2011-01-01'),
            Market('#1')
        ),
        1.0
    ) -
    Max(
        Fixing(
            Date('2013-01-01'),
            Market('#1')
        ) /
        Fixing(
            Date('2012-01-01'),
            Market('#1')
        ),
        1.0
    )
)";
    assert_valuation(source, 0.0, 0.05);
}

#[test]
fn uncorrelated_markets_price_independently() {
    let source = "
Max(
    Fixing(
        Date('2012-01-01'),
        Market('#1')
    ) *
    Fixing(
        Date('2012-01-01'),
        Market('#2')
    ) / 10.0,
    0.0
) - Max(
    Fixing(
        Date('2013-01-01'),
        Market('#1')
    ), 0
)";
    assert_valuation(source, 0.0, 0.2);
}

#[test]
fn correlated_markets_price_their_covariance() {
    let source = "
Max(
    Fixing(
        Date('2012-01-01'),
        Market('TTF')
    ) *
    Fixing(
        Date('2012-01-01'),
        Market('NBP')
    ) / 10.0,
    0.0
) - Max(
    Fixing(
        Date('2013-01-01'),
        Market('TTF')
    ), 0
)";
    assert_valuation(source, 0.92, 0.15);
}

#[test]
fn discounted_futures_strip() {
    assert_valuation("Wait( Date('2012-01-01'),\n    Market('#1') - 9\n) ", 0.9753, 0.05);
}

#[test]
fn european_call() {
    assert_valuation("Wait(Date('2012-01-01'), Choice(Market('#1') - 9, 0))", 2.356, 0.05);
}

#[test]
fn bermudan_with_two_exercise_dates() {
    let source = "
Fixing( Date('2011-06-01'), Choice( Market('#1') - 9,
    Fixing( Date('2012-01-01'), Choice( Market('#1') - 9, 0))
))
";
    assert_valuation(source, 2.401, 0.06);
}

#[test]
fn summed_contracts_price_linearly() {
    let source = "
Fixing(
    Date('2011-06-01'),
    Choice(
        Market('#1') - 9,
        Fixing(
            Date('2012-01-01'),
            Choice(
                Market('#1') - 9,
                0
            )
        )
    )
) + Fixing(
    Date('2011-06-01'),
    Choice(
        Market('#1') - 9,
        Fixing(
            Date('2012-01-01'),
            Choice(
                Market('#1') - 9,
                0
            )
        )
    )
)
";
    assert_valuation(source, 4.812, 0.09);
}

#[test]
fn payoff_plus_forward_decomposition() {
    let source = "
Fixing( Date('2012-01-01'),
    Max(Market('#1') - 9, 0) + Market('#1') - 9
)
";
    assert_valuation(source, 3.416, 0.07);
}

#[test]
fn swing_contract_with_choice() {
    let source = "
def Swing(starts, ends, underlying, quantity):
    if (quantity != 0) and (starts < ends):
        return Choice(
            Swing(starts + TimeDelta('1d'), ends, underlying, quantity - 1) \\
            + Fixing(starts, underlying),
            Swing(starts + TimeDelta('1d'), ends, underlying, quantity)
        )
    else:
        return 0
Swing(Date('2012-01-01'), Date('2012-01-03'), Market('#1'), 2)
";
    assert_valuation(source, 20.0, 0.15);
}

#[test]
fn option_on_an_underlying_wrapper() {
    let source = "
def Option(date, strike, x, y):
    return Wait(date, Choice(x - strike, y))
Option(Date('2012-01-01'), 9, Underlying(Market('#1')), 0)
";
    assert_valuation(source, 2.356, 0.05);
}

#[test]
fn european_call_from_definitions() {
    let source = "
def Option(date, strike, underlying, alternative):
    return Wait(date, Choice(underlying - strike, alternative))

def European(date, strike, underlying):
    return Option(date, strike, underlying, 0)

European(Date('2012-01-01'), 9, Market('#1'))
";
    assert_valuation(source, 2.356, 0.05);
}

#[test]
fn american_call_from_definitions() {
    let source = "
def Option(date, strike, underlying, alternative):
    return Wait(date, Choice(underlying - strike, alternative))

def American(starts, ends, strike, underlying, step):
    Option(starts, strike, underlying, 0) if starts == ends else \\
    Option(starts, strike, underlying, American(starts + step, ends, strike, underlying, step))

American(Date('2012-01-01'), Date('2012-01-3'), 9, Market('#1'), TimeDelta('1d'))
";
    assert_valuation(source, 2.356, 0.06);
}

#[test]
fn supplied_prices_bypass_simulation() {
    // ten days of flat prices, enough to cover the contract's fixing dates
    let observation = parse_date("2011-01-01").unwrap();
    let mut fixings = IndexMap::new();
    for day in 0..10 {
        let date = observation + chrono::Duration::days(day);
        fixings.insert(date, Arc::new(vec![10.0; 2000]));
    }
    let mut prices = AllMarketPrices::new();
    prices.insert("#1".to_string(), fixings);

    let args = EvalArgs {
        all_market_prices: Some(prices),
        runner: RunnerKind::WorkerPool { workers: 4 },
        ..EvalArgs::new(observation)
    };
    let source = "
def Swing(starts, ends, underlying, quantity):
    if (quantity == 0) or (starts >= ends):
        0
    else:
        Wait(starts, Choice(
            Swing(starts + TimeDelta('1d'), ends, underlying, quantity - 1) + Fixing(starts, Market(underlying)),
            Swing(starts + TimeDelta('1d'), ends, underlying, quantity)
        ))
Swing(Date('2011-01-01'), Date('2011-01-03'), '#1', 50)
";
    let outcome = eval(source, &args).unwrap();
    assert!((outcome.mean - 20.0).abs() < 1e-9, "two fixings of a flat 10: {}", outcome.mean);
}

#[test]
fn runners_agree_on_the_european_call() {
    let source = "Wait(Date('2012-01-01'), Choice(Market('#1') - 9, 0))";
    let inline = eval(source, &valuation_args()).unwrap().mean;

    let mut args = valuation_args();
    args.runner = RunnerKind::SingleThreaded;
    let single = eval(source, &args).unwrap().mean;

    let mut args = valuation_args();
    args.runner = RunnerKind::WorkerPool { workers: 4 };
    let pooled = eval(source, &args).unwrap().mean;

    // same seed, same graph: the estimates are identical, not merely close
    assert!((inline - single).abs() < 1e-9, "inline {inline} vs single-threaded {single}");
    assert!((inline - pooled).abs() < 1e-9, "inline {inline} vs worker pool {pooled}");
}
