use std::{fmt, sync::Arc};

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::{
    error::{DslError, DslResult},
    expressions::CmpOperator,
};

pub const MICROS_PER_DAY: i64 = 86_400_000_000;

/// A runtime value of the DSL.
///
/// Scalars stay inline; per-path vectors are reference counted so they can be
/// broadcast to worker threads and substituted into expressions without
/// copying `path_count` floats around.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// A timezone-aware instant. Date literals are UTC midnight.
    Date(DateTime<Utc>),
    /// A duration in microseconds. Timedelta literals are whole days.
    TimeDelta(i64),
    /// One sample per Monte-Carlo path.
    Vector(Arc<Vec<f64>>),
}

impl Value {
    #[must_use]
    pub fn timedelta_days(days: i64) -> Self {
        Self::TimeDelta(days * MICROS_PER_DAY)
    }

    #[must_use]
    pub fn vector(samples: Vec<f64>) -> Self {
        Self::Vector(Arc::new(samples))
    }

    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Str(_) => "string",
            Self::Date(_) => "date",
            Self::TimeDelta(_) => "timedelta",
            Self::Vector(_) => "vector",
        }
    }

    /// Numeric view of a scalar, if this is one.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(x) => Some(*x),
            Self::Bool(b) => Some(f64::from(*b)),
            _ => None,
        }
    }

    /// Boolean coercion: zero and the empty string are false.
    ///
    /// Vectors have no truth value; a conditional on a per-path quantity is
    /// a modelling error, not a branch.
    pub fn truthy(&self) -> DslResult<bool> {
        match self {
            Self::Int(n) => Ok(*n != 0),
            Self::Float(x) => Ok(*x != 0.0),
            Self::Bool(b) => Ok(*b),
            Self::Str(s) => Ok(!s.is_empty()),
            Self::Date(_) | Self::TimeDelta(_) => Ok(true),
            Self::Vector(_) => Err(DslError::type_error("the truth value of a vector is ambiguous")),
        }
    }

    pub fn add(&self, other: &Self) -> DslResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_add(*b)
                .map(Self::Int)
                .ok_or_else(|| DslError::numeric("integer overflow in +")),
            (Self::Date(d), Self::TimeDelta(t)) | (Self::TimeDelta(t), Self::Date(d)) => {
                Ok(Self::Date(*d + Duration::microseconds(*t)))
            }
            (Self::TimeDelta(a), Self::TimeDelta(b)) => Ok(Self::TimeDelta(a + b)),
            _ => self.numeric_binop(other, "+", |a, b| a + b),
        }
    }

    pub fn sub(&self, other: &Self) -> DslResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_sub(*b)
                .map(Self::Int)
                .ok_or_else(|| DslError::numeric("integer overflow in -")),
            (Self::Date(d), Self::TimeDelta(t)) => Ok(Self::Date(*d - Duration::microseconds(*t))),
            (Self::Date(a), Self::Date(b)) => Ok(Self::TimeDelta(
                (*a - *b).num_microseconds().unwrap_or(i64::MAX),
            )),
            (Self::TimeDelta(a), Self::TimeDelta(b)) => Ok(Self::TimeDelta(a - b)),
            _ => self.numeric_binop(other, "-", |a, b| a - b),
        }
    }

    pub fn mult(&self, other: &Self) -> DslResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_mul(*b)
                .map(Self::Int)
                .ok_or_else(|| DslError::numeric("integer overflow in *")),
            (Self::Int(n), Self::TimeDelta(t)) | (Self::TimeDelta(t), Self::Int(n)) => t
                .checked_mul(*n)
                .map(Self::TimeDelta)
                .ok_or_else(|| DslError::numeric("timedelta overflow in *")),
            (Self::Float(x), Self::TimeDelta(t)) | (Self::TimeDelta(t), Self::Float(x)) => {
                Ok(Self::TimeDelta((*t as f64 * x) as i64))
            }
            _ => self.numeric_binop(other, "*", |a, b| a * b),
        }
    }

    /// True division: always real, even between two ints.
    pub fn div(&self, other: &Self) -> DslResult<Self> {
        other.check_nonzero_divisor("division")?;
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Float(*a as f64 / *b as f64)),
            _ => self.numeric_binop(other, "/", |a, b| a / b),
        }
    }

    /// Floor division, rounding toward negative infinity.
    pub fn floor_div(&self, other: &Self) -> DslResult<Self> {
        other.check_nonzero_divisor("division")?;
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => {
                let q = a / b;
                let r = a % b;
                Ok(Self::Int(if r != 0 && (r < 0) != (*b < 0) { q - 1 } else { q }))
            }
            _ => self.numeric_binop(other, "//", |a, b| (a / b).floor()),
        }
    }

    /// Modulo with the sign of the divisor.
    pub fn modulo(&self, other: &Self) -> DslResult<Self> {
        other.check_nonzero_divisor("modulo")?;
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => {
                let r = a % b;
                Ok(Self::Int(if r != 0 && (r < 0) != (*b < 0) { r + b } else { r }))
            }
            _ => {
                self.numeric_binop(other, "%", |a, b| {
                    let r = a % b;
                    if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r }
                })
            }
        }
    }

    fn check_nonzero_divisor(&self, what: &str) -> DslResult<()> {
        let has_zero = match self {
            Self::Vector(v) => v.iter().any(|x| *x == 0.0),
            _ => self.as_f64() == Some(0.0),
        };
        if has_zero {
            Err(DslError::numeric(format!("{what} by zero")))
        } else {
            Ok(())
        }
    }

    pub fn pow(&self, other: &Self) -> DslResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) if *b >= 0 => {
                let exp = u32::try_from(*b).map_err(|_| DslError::numeric("exponent out of range"))?;
                a.checked_pow(exp)
                    .map(Self::Int)
                    .ok_or_else(|| DslError::numeric("integer overflow in **"))
            }
            _ => {
                let result = self.numeric_binop(other, "**", f64::powf)?;
                result.ensure_finite("**")
            }
        }
    }

    pub fn neg(&self) -> DslResult<Self> {
        match self {
            Self::Int(n) => n
                .checked_neg()
                .map(Self::Int)
                .ok_or_else(|| DslError::numeric("integer overflow in unary -")),
            Self::Float(x) => Ok(Self::Float(-x)),
            Self::TimeDelta(t) => Ok(Self::TimeDelta(-t)),
            Self::Vector(v) => Ok(Self::vector(v.iter().map(|x| -x).collect())),
            _ => Err(DslError::type_error(format!(
                "unsupported operand type for unary -: '{}'",
                self.type_name()
            ))),
        }
    }

    /// Pointwise maximum, broadcasting between scalars and vectors.
    pub fn max_with(&self, other: &Self) -> DslResult<Self> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Ok(Self::Int(*a.max(b))),
            (Self::Date(a), Self::Date(b)) => Ok(Self::Date(*a.max(b))),
            (Self::TimeDelta(a), Self::TimeDelta(b)) => Ok(Self::TimeDelta(*a.max(b))),
            _ => self.numeric_binop(other, "Max", f64::max),
        }
    }

    pub fn compare(&self, op: CmpOperator, other: &Self) -> DslResult<bool> {
        match op {
            CmpOperator::Eq => Ok(self.loose_eq(other)),
            CmpOperator::NotEq => Ok(!self.loose_eq(other)),
            CmpOperator::Lt | CmpOperator::LtE | CmpOperator::Gt | CmpOperator::GtE => {
                let ordering = self.partial_cmp_values(other).ok_or_else(|| {
                    DslError::type_error(format!(
                        "'{}' not supported between '{}' and '{}'",
                        op.token(),
                        self.type_name(),
                        other.type_name()
                    ))
                })?;
                Ok(match op {
                    CmpOperator::Lt => ordering.is_lt(),
                    CmpOperator::LtE => ordering.is_le(),
                    CmpOperator::Gt => ordering.is_gt(),
                    CmpOperator::GtE => ordering.is_ge(),
                    CmpOperator::Eq | CmpOperator::NotEq => unreachable!(),
                })
            }
        }
    }

    /// Equality across numeric types; mismatched non-numeric types are unequal.
    fn loose_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::TimeDelta(a), Self::TimeDelta(b)) => a == b,
            (Self::Vector(a), Self::Vector(b)) => a == b,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    fn partial_cmp_values(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
            (Self::TimeDelta(a), Self::TimeDelta(b)) => Some(a.cmp(b)),
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                a.partial_cmp(&b)
            }
        }
    }

    /// Shared kernel for operators that act on reals, with scalar↔vector
    /// broadcast. Int pairs that reach this point intentionally widen.
    fn numeric_binop(&self, other: &Self, token: &str, f: impl Fn(f64, f64) -> f64) -> DslResult<Self> {
        match (self, other) {
            (Self::Vector(a), Self::Vector(b)) => {
                if a.len() != b.len() {
                    return Err(DslError::numeric(format!(
                        "vector length mismatch in {token}: {} vs {}",
                        a.len(),
                        b.len()
                    )));
                }
                Ok(Self::vector(a.iter().zip(b.iter()).map(|(x, y)| f(*x, *y)).collect()))
            }
            (Self::Vector(a), b) => {
                let y = b.scalar_operand(token, other)?;
                Ok(Self::vector(a.iter().map(|x| f(*x, y)).collect()))
            }
            (a, Self::Vector(b)) => {
                let x = a.scalar_operand(token, self)?;
                Ok(Self::vector(b.iter().map(|y| f(x, *y)).collect()))
            }
            _ => {
                let a = self.scalar_operand(token, other)?;
                let b = other.scalar_operand(token, self)?;
                Ok(Self::Float(f(a, b)))
            }
        }
    }

    fn scalar_operand(&self, token: &str, counterpart: &Self) -> DslResult<f64> {
        self.as_f64().ok_or_else(|| {
            DslError::type_error(format!(
                "unsupported operand types for {token}: '{}' and '{}'",
                self.type_name(),
                counterpart.type_name()
            ))
        })
    }

    fn ensure_finite(self, token: &str) -> DslResult<Self> {
        let finite = match &self {
            Self::Float(x) => x.is_finite(),
            Self::Vector(v) => v.iter().all(|x| x.is_finite()),
            _ => true,
        };
        if finite {
            Ok(self)
        } else {
            Err(DslError::numeric(format!("non-finite result in {token}")))
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{}", float_repr(*x)),
            Self::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::TimeDelta(t) => write!(f, "{}d", t / MICROS_PER_DAY),
            Self::Vector(v) => write!(f, "<vector of {}>", v.len()),
        }
    }
}

/// Parses a `YYYY-MM-DD` literal as UTC midnight.
pub fn parse_date(text: &str) -> DslResult<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|_| DslError::type_error(format!("invalid date literal '{text}', expected 'YYYY-MM-DD'")))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| DslError::type_error(format!("invalid date literal '{text}'")))?;
    Ok(DateTime::from_naive_utc_and_offset(midnight, Utc))
}

/// Parses an `Nd` literal as a whole number of days.
pub fn parse_timedelta(text: &str) -> DslResult<i64> {
    let days = text
        .strip_suffix('d')
        .and_then(|digits| digits.parse::<i64>().ok())
        .ok_or_else(|| DslError::type_error(format!("invalid timedelta literal '{text}', expected e.g. '1d'")))?;
    days.checked_mul(MICROS_PER_DAY)
        .ok_or_else(|| DslError::numeric(format!("timedelta literal '{text}' out of range")))
}

/// Returns the shortest decimal representation of a float that survives a
/// round-trip through parsing, always keeping a decimal point or exponent so
/// the literal re-parses as a float.
#[must_use]
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f.is_sign_negative() { "-inf" } else { "inf" }.to_string();
    }

    let mut buffer = ryu::Buffer::new();
    let s = buffer.format(f);

    if let Some(e_pos) = s.find('e') {
        let (mantissa, exp_part) = s.split_at(e_pos);
        let exp = &exp_part[1..];
        if exp.starts_with('-') {
            return s.to_string();
        }
        return format!("{mantissa}e+{exp}");
    }
    if s.contains('.') {
        s.to_string()
    } else {
        format!("{s}.0")
    }
}
