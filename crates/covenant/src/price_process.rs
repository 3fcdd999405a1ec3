use std::{collections::BTreeSet, sync::Arc};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use nalgebra::{Cholesky, DMatrix};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::error::{DslError, DslResult};

/// Simulated prices: market name → fixing date → one price per path.
pub type AllMarketPrices = IndexMap<String, IndexMap<DateTime<Utc>, Arc<Vec<f64>>>>;

const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 60.0 * 60.0;

/// Flat calibration table keyed the way market data providers deliver it:
/// `<MARKET>-LAST-PRICE`, `<MARKET>-ACTUAL-HISTORICAL-VOLATILITY` (percent),
/// `<A>-<B>-CORRELATION`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MarketCalibration {
    entries: IndexMap<String, f64>,
}

impl MarketCalibration {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: f64) {
        self.entries.insert(key.into(), value);
    }

    pub fn last_price(&self, market: &str) -> DslResult<f64> {
        self.lookup(&format!("{market}-LAST-PRICE"))
    }

    /// Annualised volatility in percent.
    pub fn volatility(&self, market: &str) -> DslResult<f64> {
        self.lookup(&format!("{market}-ACTUAL-HISTORICAL-VOLATILITY"))
    }

    /// Correlation between two markets, accepting the key in either order and
    /// defaulting to zero when absent.
    #[must_use]
    pub fn correlation(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        self.entries
            .get(&format!("{a}-{b}-CORRELATION"))
            .or_else(|| self.entries.get(&format!("{b}-{a}-CORRELATION")))
            .copied()
            .unwrap_or(0.0)
    }

    fn lookup(&self, key: &str) -> DslResult<f64> {
        self.entries
            .get(key)
            .copied()
            .ok_or_else(|| DslError::name(format!("market calibration has no entry '{key}'")))
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for MarketCalibration {
    fn from_iter<T: IntoIterator<Item = (K, f64)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// The stochastic price model the evaluator collaborates with.
///
/// `duration_years` is also the year-fraction measure used for discounting,
/// so an alternative process can redefine the calendar (trading days, say)
/// consistently for diffusion and discounting.
pub trait PriceProcess: Send + Sync {
    fn duration_years(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> f64;

    fn simulate(
        &self,
        markets: &[String],
        observation: DateTime<Utc>,
        fixing_dates: &[DateTime<Utc>],
        calibration: &MarketCalibration,
        path_count: usize,
        seed: u64,
    ) -> DslResult<AllMarketPrices>;
}

/// Correlated geometric Brownian motion with flat volatilities.
///
/// Paths evolve by sequential increments over the sorted fixing dates:
/// `S_{k+1} = S_k * exp(sigma * sqrt(dt) * e - sigma^2 * dt / 2)` where `e`
/// is a standard normal draw correlated across markets through the Cholesky
/// factor of the calibration's correlation matrix. The drift term makes each
/// path a martingale, so forwards price exactly up to sampling noise.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlackScholesPriceProcess;

impl PriceProcess for BlackScholesPriceProcess {
    fn duration_years(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
        (end - start).num_seconds() as f64 / SECONDS_PER_YEAR
    }

    fn simulate(
        &self,
        markets: &[String],
        observation: DateTime<Utc>,
        fixing_dates: &[DateTime<Utc>],
        calibration: &MarketCalibration,
        path_count: usize,
        seed: u64,
    ) -> DslResult<AllMarketPrices> {
        if markets.is_empty() {
            return Ok(AllMarketPrices::new());
        }
        if path_count == 0 {
            return Err(DslError::numeric("path_count must be positive"));
        }

        // fixing dates before the observation date have nothing to diffuse
        // over; they observe the spot
        let mut dates: BTreeSet<DateTime<Utc>> = fixing_dates.iter().copied().collect();
        dates.insert(observation);

        let market_count = markets.len();
        let sigmas: Vec<f64> = markets
            .iter()
            .map(|market| Ok(calibration.volatility(market)? / 100.0))
            .collect::<DslResult<_>>()?;
        let mut levels: Vec<Vec<f64>> = markets
            .iter()
            .map(|market| Ok(vec![calibration.last_price(market)?; path_count]))
            .collect::<DslResult<_>>()?;

        let correlations = DMatrix::from_fn(market_count, market_count, |i, j| {
            calibration.correlation(&markets[i], &markets[j])
        });
        let lower = Cholesky::new(correlations)
            .ok_or_else(|| DslError::numeric("market correlation matrix is not positive definite"))?
            .unpack();

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut draws = vec![0.0_f64; market_count];
        let mut result: AllMarketPrices = markets
            .iter()
            .map(|market| (market.clone(), IndexMap::new()))
            .collect();

        let mut previous = observation;
        for date in dates {
            let dt = self.duration_years(previous, date).max(0.0);
            if dt > 0.0 {
                let sqrt_dt = dt.sqrt();
                for path in 0..path_count {
                    for draw in &mut draws {
                        *draw = rng.sample(StandardNormal);
                    }
                    for (m, level) in levels.iter_mut().enumerate() {
                        let mut increment = 0.0;
                        for j in 0..=m {
                            increment += lower[(m, j)] * draws[j];
                        }
                        let sigma = sigmas[m];
                        level[path] *= (sigma * sqrt_dt * increment - 0.5 * sigma * sigma * dt).exp();
                    }
                }
                previous = date;
            }
            for (m, market) in markets.iter().enumerate() {
                result[market].insert(date, Arc::new(levels[m].clone()));
            }
        }
        Ok(result)
    }
}
