//! Calibratable computer-vision parameters.
//!
//! A `CvParameter` is a single tunable knob of a matching backend: a typed
//! scalar with optional bounds, a current search step (`delta`), a convergence
//! floor (`tolerance`), and flags controlling whether and how the calibrator
//! may move it. Parameters round-trip through a single-line text grammar so
//! that match files can store and restore them losslessly.
//!
//! Invariants:
//! * A numeric value always lies within its declared bounds.
//! * Enumerated parameters carry finite bounds (the values are categorical,
//!   so an open range is meaningless).
//! * Booleans are enumerated over {false, true} with `delta = 0` and
//!   `tolerance = 1`, which keeps them out of numeric hill climbing.
//! * `parse(render(p)) == p` for every parameter, field for field.

use std::fmt;
use std::sync::LazyLock;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("parameter text {0:?} does not match the parameter grammar")]
    Grammar(String),
    #[error("field {field} holds {text:?} which is not a number")]
    NotNumeric { field: &'static str, text: String },
    #[error("value {value} outside of bounds [{min}, {max}]")]
    OutOfBounds { value: f64, min: f64, max: f64 },
    #[error("enumerated parameters must have a finite (usually small) range")]
    UnboundedEnumeration,
}

/// A single parameter value: the supported scalar types plus an explicit null.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

static INT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-?\d+$").expect("static regex"));
static FLOAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+\.\d*$").expect("static regex"));

impl ParamValue {
    /// Parse a grammar token: the literals `None`, `True`, and `False` map to
    /// null and the booleans, digit runs to integers, dotted digit runs to
    /// floats, and anything else stays a string.
    pub fn parse(token: &str) -> ParamValue {
        match token {
            "None" => ParamValue::Null,
            "True" => ParamValue::Bool(true),
            "False" => ParamValue::Bool(false),
            _ if INT_RE.is_match(token) => {
                ParamValue::Int(token.parse().unwrap_or(i64::MAX))
            }
            _ if FLOAT_RE.is_match(token) => {
                ParamValue::Float(token.parse().unwrap_or(f64::MAX))
            }
            _ => ParamValue::Str(token.to_owned()),
        }
    }

    /// Numeric view used for bound checks and calibration arithmetic.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            ParamValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ParamValue::Int(_) | ParamValue::Float(_))
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Null => write!(f, "None"),
            ParamValue::Bool(true) => write!(f, "True"),
            ParamValue::Bool(false) => write!(f, "False"),
            ParamValue::Int(i) => write!(f, "{i}"),
            // Debug formatting keeps a trailing ".0" on integral floats so the
            // token parses back as a float rather than an integer.
            ParamValue::Float(v) => write!(f, "{v:?}"),
            ParamValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_owned())
    }
}

/// A calibratable backend parameter.
///
/// `min_val`/`max_val` keep whatever the caller declared (`Null` meaning the
/// data-type limit); [`CvParameter::range`] substitutes the concrete limits
/// when arithmetic needs them.
#[derive(Debug, Clone, PartialEq)]
pub struct CvParameter {
    pub value: ParamValue,
    pub min_val: ParamValue,
    pub max_val: ParamValue,
    /// Current variation step, doubling as the standard deviation when the
    /// calibrator draws Gaussian restarts.
    pub delta: f64,
    /// Minimal meaningful step: once `delta < tolerance` the parameter is
    /// considered converged.
    pub tolerance: f64,
    /// Excluded from calibration entirely.
    pub fixed: bool,
    /// Values are categorical within the bounds, so distances between them
    /// carry no meaning.
    pub enumerated: bool,
}

impl CvParameter {
    /// Build a parameter from already-parsed fields, validating the bound and
    /// enumeration invariants.
    pub fn try_new(
        value: ParamValue,
        min_val: ParamValue,
        max_val: ParamValue,
        delta: f64,
        tolerance: f64,
        fixed: bool,
        enumerated: bool,
    ) -> Result<CvParameter, ParamError> {
        if let Some(v) = value.as_f64() {
            if value.is_numeric() {
                let min = min_val.as_f64().unwrap_or(f64::MIN);
                let max = max_val.as_f64().unwrap_or(f64::MAX);
                if v < min || v > max {
                    return Err(ParamError::OutOfBounds { value: v, min, max });
                }
            }
        }
        if enumerated && (min_val == ParamValue::Null || max_val == ParamValue::Null) {
            return Err(ParamError::UnboundedEnumeration);
        }
        Ok(CvParameter {
            value,
            min_val,
            max_val,
            delta,
            tolerance,
            fixed,
            enumerated,
        })
    }

    /// Float parameter with the default step of 10.0 and tolerance of 1.0.
    pub fn float(value: f64, min_val: Option<f64>, max_val: Option<f64>) -> CvParameter {
        let p = CvParameter {
            value: ParamValue::Float(value),
            min_val: min_val.map_or(ParamValue::Null, ParamValue::Float),
            max_val: max_val.map_or(ParamValue::Null, ParamValue::Float),
            delta: 10.0,
            tolerance: 1.0,
            fixed: true,
            enumerated: false,
        };
        p.check_bounds();
        p
    }

    /// Integer parameter. Integers step by whole units, so the default delta
    /// is 1 with a tolerance of 0.9: a single failed halving converges them.
    pub fn int(value: i64, min_val: Option<i64>, max_val: Option<i64>) -> CvParameter {
        let p = CvParameter {
            value: ParamValue::Int(value),
            min_val: min_val.map_or(ParamValue::Null, ParamValue::Int),
            max_val: max_val.map_or(ParamValue::Null, ParamValue::Int),
            delta: 1.0,
            tolerance: 0.9,
            fixed: true,
            enumerated: false,
        };
        p.check_bounds();
        p
    }

    /// Enumerated integer parameter (a mode selector).
    pub fn int_enum(value: i64, min_val: i64, max_val: i64) -> CvParameter {
        let mut p = CvParameter::int(value, Some(min_val), Some(max_val));
        p.enumerated = true;
        p
    }

    /// Boolean parameter: enumerated over {false, true} and never subject to
    /// numeric stepping.
    pub fn boolean(value: bool) -> CvParameter {
        CvParameter {
            value: ParamValue::Bool(value),
            min_val: ParamValue::Int(0),
            max_val: ParamValue::Int(1),
            delta: 0.0,
            tolerance: 1.0,
            fixed: true,
            enumerated: true,
        }
    }

    /// Free-form string parameter, not calibratable.
    pub fn string(value: &str) -> CvParameter {
        CvParameter {
            value: ParamValue::Str(value.to_owned()),
            min_val: ParamValue::Null,
            max_val: ParamValue::Null,
            delta: 0.0,
            tolerance: 1.0,
            fixed: true,
            enumerated: false,
        }
    }

    fn check_bounds(&self) {
        let (min, max) = self.range();
        if let Some(v) = self.value.as_f64() {
            assert!(
                v >= min && v <= max,
                "parameter value {v} outside of bounds [{min}, {max}]"
            );
        }
    }

    /// Effective numeric range with data-type limits substituted for open
    /// bounds.
    pub fn range(&self) -> (f64, f64) {
        let min = self.min_val.as_f64().unwrap_or(match self.value {
            ParamValue::Int(_) => i64::MIN as f64,
            _ => f64::MIN,
        });
        let max = self.max_val.as_f64().unwrap_or(match self.value {
            ParamValue::Int(_) => i64::MAX as f64,
            _ => f64::MAX,
        });
        (min, max)
    }

    /// Convenience setter used by builder-style schema tables.
    pub fn with_delta(mut self, delta: f64, tolerance: f64) -> CvParameter {
        self.delta = delta;
        self.tolerance = tolerance;
        self
    }

    pub fn calibratable(mut self) -> CvParameter {
        self.fixed = false;
        self
    }

    /// Draw a random value conforming to the parameter range and type.
    ///
    /// With no mean, or for enumerated parameters, the draw is uniform over
    /// the range. Otherwise it is Gaussian around `mu` truncated to the
    /// bounds, with `sigma` defaulting to one quarter of the range. Booleans
    /// are always drawn uniformly; strings and nulls return the current
    /// value.
    pub fn random_value<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        mu: Option<f64>,
        sigma: Option<f64>,
    ) -> ParamValue {
        let (start, end) = self.range();
        match &self.value {
            ParamValue::Float(_) => {
                let drawn = match mu {
                    None => rng.gen_range(start..=end),
                    Some(_) if self.enumerated => rng.gen_range(start..=end),
                    Some(mean) => {
                        let sd = sigma.unwrap_or((end - start) / 4.0).abs().max(f64::MIN_POSITIVE);
                        match Normal::new(mean, sd) {
                            Ok(normal) => normal.sample(rng).clamp(start, end),
                            Err(_) => mean,
                        }
                    }
                };
                ParamValue::Float(drawn)
            }
            ParamValue::Int(_) => {
                let drawn = match mu {
                    None => rng.gen_range(start as i64..=end as i64) as f64,
                    Some(_) if self.enumerated => rng.gen_range(start as i64..=end as i64) as f64,
                    Some(mean) => {
                        let sd = sigma.unwrap_or((end - start) / 4.0).abs().max(f64::MIN_POSITIVE);
                        match Normal::new(mean, sd) {
                            Ok(normal) => normal.sample(rng).round().clamp(start, end),
                            Err(_) => mean.round(),
                        }
                    }
                };
                ParamValue::Int(drawn as i64)
            }
            ParamValue::Bool(_) => ParamValue::Bool(rng.gen_range(0..=1) == 1),
            other => {
                tracing::warn!(
                    target: "param",
                    "cannot generate random value for parameters other than float, int, and bool"
                );
                other.clone()
            }
        }
    }
}

static PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^<value='(.+)' min='([^']+)' max='([^']+)' delta='([^']+)' tolerance='([^']+)' fixed='(\w+)' enumerated='(\w+)'>$",
    )
    .expect("static regex")
});

impl CvParameter {
    /// Parse a parameter from its text representation.
    pub fn from_string(raw: &str) -> Result<CvParameter, ParamError> {
        let caps = PARAM_RE
            .captures(raw.trim())
            .ok_or_else(|| ParamError::Grammar(raw.to_owned()))?;
        let numeric = |field: &'static str, text: &str| -> Result<f64, ParamError> {
            text.parse::<f64>().map_err(|_| ParamError::NotNumeric {
                field,
                text: text.to_owned(),
            })
        };
        CvParameter::try_new(
            ParamValue::parse(&caps[1]),
            ParamValue::parse(&caps[2]),
            ParamValue::parse(&caps[3]),
            numeric("delta", &caps[4])?,
            numeric("tolerance", &caps[5])?,
            matches!(&caps[6], "True"),
            matches!(&caps[7], "True"),
        )
    }
}

impl fmt::Display for CvParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<value='{}' min='{}' max='{}' delta='{:?}' tolerance='{:?}' fixed='{}' enumerated='{}'>",
            self.value,
            self.min_val,
            self.max_val,
            self.delta,
            self.tolerance,
            ParamValue::Bool(self.fixed),
            ParamValue::Bool(self.enumerated),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn token_parsing_covers_all_types() {
        assert_eq!(ParamValue::parse("None"), ParamValue::Null);
        assert_eq!(ParamValue::parse("True"), ParamValue::Bool(true));
        assert_eq!(ParamValue::parse("False"), ParamValue::Bool(false));
        assert_eq!(ParamValue::parse("42"), ParamValue::Int(42));
        assert_eq!(ParamValue::parse("-3"), ParamValue::Int(-3));
        assert_eq!(ParamValue::parse("0.25"), ParamValue::Float(0.25));
        assert_eq!(ParamValue::parse("eng"), ParamValue::Str("eng".into()));
    }

    #[test]
    fn representation_round_trips() {
        let params = [
            CvParameter::float(0.8, Some(0.0), Some(1.0)),
            CvParameter::float(1000.0, Some(0.0), None).with_delta(500.0, 1.0),
            CvParameter::int(5, Some(1), None).with_delta(100.0, 1.0),
            CvParameter::int_enum(2, 1, 4),
            CvParameter::boolean(true),
            CvParameter::boolean(false),
            CvParameter::string("eng"),
            CvParameter::float(50.0, Some(0.0), Some(200.0))
                .with_delta(50.0, 1.0)
                .calibratable(),
            CvParameter::int(2, Some(-255), Some(255)).with_delta(1.0, 0.9),
        ];
        for param in params {
            let rendered = param.to_string();
            let parsed = CvParameter::from_string(&rendered)
                .unwrap_or_else(|e| panic!("{rendered}: {e}"));
            assert_eq!(parsed, param, "round trip through {rendered}");
        }
    }

    #[test]
    fn value_with_dots_stays_a_string() {
        let raw = "<value='my.file.name' min='None' max='None' delta='0.0' tolerance='1.0' fixed='True' enumerated='False'>";
        let parsed = CvParameter::from_string(raw).unwrap();
        assert_eq!(parsed.value, ParamValue::Str("my.file.name".into()));
        assert_eq!(parsed.to_string(), raw);
    }

    #[test]
    fn malformed_text_is_rejected() {
        assert!(matches!(
            CvParameter::from_string("<value='1'>"),
            Err(ParamError::Grammar(_))
        ));
        let raw = "<value='1' min='None' max='None' delta='x' tolerance='1.0' fixed='True' enumerated='False'>";
        assert!(matches!(
            CvParameter::from_string(raw),
            Err(ParamError::NotNumeric { field: "delta", .. })
        ));
    }

    #[test]
    fn out_of_bounds_values_are_rejected() {
        let err = CvParameter::try_new(
            ParamValue::Int(7),
            ParamValue::Int(0),
            ParamValue::Int(5),
            1.0,
            0.9,
            true,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ParamError::OutOfBounds { .. }));
    }

    #[test]
    fn enumerated_requires_finite_bounds() {
        let err = CvParameter::try_new(
            ParamValue::Int(1),
            ParamValue::Null,
            ParamValue::Int(5),
            1.0,
            0.9,
            true,
            true,
        )
        .unwrap_err();
        assert_eq!(err, ParamError::UnboundedEnumeration);
    }

    #[test]
    fn random_values_respect_bounds() {
        let mut rng = StdRng::seed_from_u64(17);
        let float = CvParameter::float(0.5, Some(0.0), Some(1.0));
        let int = CvParameter::int(3, Some(1), Some(9));
        for _ in 0..200 {
            match float.random_value(&mut rng, None, None) {
                ParamValue::Float(v) => assert!((0.0..=1.0).contains(&v)),
                other => panic!("expected float, got {other:?}"),
            }
            match float.random_value(&mut rng, Some(0.5), Some(0.1)) {
                ParamValue::Float(v) => assert!((0.0..=1.0).contains(&v)),
                other => panic!("expected float, got {other:?}"),
            }
            match int.random_value(&mut rng, Some(3.0), None) {
                ParamValue::Int(v) => assert!((1..=9).contains(&v)),
                other => panic!("expected int, got {other:?}"),
            }
        }
    }

    #[test]
    fn strings_and_nulls_return_current_value() {
        let mut rng = StdRng::seed_from_u64(5);
        let s = CvParameter::string("misc");
        assert_eq!(
            s.random_value(&mut rng, None, None),
            ParamValue::Str("misc".into())
        );
    }
}
