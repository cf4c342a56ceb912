//! The probability resolver.
//!
//! User knobs accept several shapes — `true`, `0.5`, `"randomized"`, a
//! weighted table, or a callable — and every pass resolves them to concrete
//! decisions through the run's seeded RNG, so a seeded run is reproducible
//! bit for bit.

use std::fmt;
use std::sync::Arc;

use rand::{rngs::StdRng, Rng};
use serde::de::{Deserialize, Deserializer};
use umbra_utils::errors::OptionsError;

/// Context handed to user callables when a decision is made.
#[derive(Debug, Default, Clone)]
pub struct DecideContext<'a> {
    /// The name of the function (or other construct) being considered.
    pub name: Option<&'a str>,
}

/// What a user callable decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Apply or skip the transform at this site.
    Apply(bool),
    /// Pick a named mode at this site.
    Mode(String),
}

/// A user-facing probability specification.
#[derive(Clone, Default)]
pub enum ProbabilitySpec {
    /// All or nothing.
    Bool(bool),
    /// Bernoulli trial with the given rate in `[0, 1]`.
    Rate(f64),
    /// A fixed mode string, returned unconditionally.
    Mode(String),
    /// Weighted mode choices; weights need not sum to one.
    Weighted(Vec<(String, f64)>),
    /// A user callable consulted per site.
    Custom(Arc<dyn Fn(&DecideContext<'_>) -> Decision + Send + Sync>),
    /// Disabled.
    #[default]
    Off,
}

impl ProbabilitySpec {
    /// Whether the owning pass should be constructed at all.
    pub fn is_enabled(&self) -> bool {
        match self {
            ProbabilitySpec::Bool(b) => *b,
            ProbabilitySpec::Rate(r) => *r > 0.0,
            ProbabilitySpec::Off => false,
            _ => true,
        }
    }

    /// Resolves an on/off decision for one site.
    pub fn roll(&self, rng: &mut StdRng, cx: &DecideContext<'_>) -> bool {
        match self {
            ProbabilitySpec::Bool(b) => *b,
            ProbabilitySpec::Rate(r) => rng.random::<f64>() < *r,
            ProbabilitySpec::Mode(_) | ProbabilitySpec::Weighted(_) => true,
            ProbabilitySpec::Custom(f) => match f(cx) {
                Decision::Apply(b) => b,
                Decision::Mode(_) => true,
            },
            ProbabilitySpec::Off => false,
        }
    }

    /// Resolves a mode string for one site, when the spec carries modes.
    pub fn mode(&self, rng: &mut StdRng, cx: &DecideContext<'_>) -> Option<String> {
        match self {
            ProbabilitySpec::Mode(s) => Some(s.clone()),
            ProbabilitySpec::Weighted(choices) => {
                let total: f64 = choices.iter().map(|(_, w)| w).sum();
                let mut draw = rng.random::<f64>() * total;
                for (mode, weight) in choices {
                    draw -= weight;
                    if draw < 0.0 {
                        return Some(mode.clone());
                    }
                }
                choices.last().map(|(m, _)| m.clone())
            }
            ProbabilitySpec::Custom(f) => match f(cx) {
                Decision::Mode(s) => Some(s),
                Decision::Apply(_) => None,
            },
            _ => None,
        }
    }

    /// Validates a spec at option-load time; errors name the offending field.
    pub fn validate(&self, field: &'static str) -> Result<(), OptionsError> {
        match self {
            ProbabilitySpec::Rate(r) => {
                if !r.is_finite() || !(0.0..=1.0).contains(r) {
                    return Err(OptionsError::ProbabilityOutOfRange { field, value: *r });
                }
            }
            ProbabilitySpec::Weighted(choices) => {
                let total: f64 = choices.iter().map(|(_, w)| w).sum();
                if choices.is_empty() || !total.is_finite() || total <= 0.0 {
                    return Err(OptionsError::InvalidWeightTable { field });
                }
                if choices.iter().any(|(_, w)| !w.is_finite() || *w < 0.0) {
                    return Err(OptionsError::InvalidWeightTable { field });
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn from_value(value: serde_json::Value) -> Result<Self, String> {
        match value {
            serde_json::Value::Bool(b) => Ok(ProbabilitySpec::Bool(b)),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(ProbabilitySpec::Rate)
                .ok_or_else(|| "probability must be a finite number".to_string()),
            serde_json::Value::String(s) => Ok(ProbabilitySpec::Mode(s)),
            serde_json::Value::Object(map) => {
                let mut choices: Vec<(String, f64)> = Vec::with_capacity(map.len());
                for (k, v) in map {
                    let w = v
                        .as_f64()
                        .ok_or_else(|| format!("weight for `{k}` must be a number"))?;
                    choices.push((k, w));
                }
                // Deterministic resolution order regardless of input order.
                choices.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(ProbabilitySpec::Weighted(choices))
            }
            other => Err(format!(
                "expected bool, number, string or weight table, got {other}"
            )),
        }
    }
}

impl fmt::Debug for ProbabilitySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbabilitySpec::Bool(b) => write!(f, "Bool({b})"),
            ProbabilitySpec::Rate(r) => write!(f, "Rate({r})"),
            ProbabilitySpec::Mode(s) => write!(f, "Mode({s:?})"),
            ProbabilitySpec::Weighted(w) => write!(f, "Weighted({w:?})"),
            ProbabilitySpec::Custom(_) => write!(f, "Custom(<callable>)"),
            ProbabilitySpec::Off => write!(f, "Off"),
        }
    }
}

impl From<bool> for ProbabilitySpec {
    fn from(b: bool) -> Self {
        ProbabilitySpec::Bool(b)
    }
}

impl From<f64> for ProbabilitySpec {
    fn from(r: f64) -> Self {
        ProbabilitySpec::Rate(r)
    }
}

impl From<&str> for ProbabilitySpec {
    fn from(s: &str) -> Self {
        ProbabilitySpec::Mode(s.to_string())
    }
}

impl<'de> Deserialize<'de> for ProbabilitySpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        ProbabilitySpec::from_value(value).map_err(serde::de::Error::custom)
    }
}
