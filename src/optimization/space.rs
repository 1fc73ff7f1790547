//! Hyperparameter search spaces and assignments.
use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ConfigurationError;

/// A single hyperparameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Integer value.
    Int(i64),
    /// Real value.
    Float(f64),
    /// One of a fixed set of labels.
    Categorical(String),
}

impl ParamValue {
    /// Numeric value, converting integers.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(value) => Some(*value),
            ParamValue::Int(value) => Some(*value as f64),
            ParamValue::Categorical(_) => None,
        }
    }

    /// Integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Categorical label.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Categorical(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParamValue::Int(value) => write!(f, "{}", value),
            ParamValue::Float(value) => write!(f, "{}", value),
            ParamValue::Categorical(value) => f.write_str(value),
        }
    }
}

/// Hyperparameter assignment, ordered by name.
pub type Assignment = BTreeMap<String, ParamValue>;

/// The values one hyperparameter may take.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterDomain {
    /// One of `choices`.
    Categorical {
        /// Allowed labels.
        choices: Vec<String>,
    },
    /// Integers in `[low, high]`.
    Int {
        /// Lower bound, inclusive.
        low: i64,
        /// Upper bound, inclusive.
        high: i64,
        /// Sample uniformly in log space.
        #[serde(default)]
        log_scale: bool,
    },
    /// Reals in `[low, high]`.
    Float {
        /// Lower bound, inclusive.
        low: f64,
        /// Upper bound, inclusive.
        high: f64,
        /// Sample uniformly in log space.
        #[serde(default)]
        log_scale: bool,
    },
}

impl ParameterDomain {
    /// Categorical domain.
    pub fn categorical<I, S>(choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ParameterDomain::Categorical {
            choices: choices.into_iter().map(Into::into).collect(),
        }
    }

    /// Uniform integer domain.
    pub fn int(low: i64, high: i64) -> Self {
        ParameterDomain::Int {
            low,
            high,
            log_scale: false,
        }
    }

    /// Log-uniform integer domain.
    pub fn int_log(low: i64, high: i64) -> Self {
        ParameterDomain::Int {
            low,
            high,
            log_scale: true,
        }
    }

    /// Uniform real domain.
    pub fn float(low: f64, high: f64) -> Self {
        ParameterDomain::Float {
            low,
            high,
            log_scale: false,
        }
    }

    /// Log-uniform real domain.
    pub fn float_log(low: f64, high: f64) -> Self {
        ParameterDomain::Float {
            low,
            high,
            log_scale: true,
        }
    }

    /// Check the domain is well formed.
    pub fn validate(&self, name: &str) -> Result<(), ConfigurationError> {
        let invalid = |reason: &str| ConfigurationError::InvalidSearchSpace {
            name: name.to_owned(),
            reason: reason.to_owned(),
        };

        match self {
            ParameterDomain::Categorical { choices } => {
                if choices.is_empty() {
                    return Err(invalid("no choices"));
                }
            }
            ParameterDomain::Int {
                low,
                high,
                log_scale,
            } => {
                if low > high {
                    return Err(invalid("low exceeds high"));
                }
                if *log_scale && *low <= 0 {
                    return Err(invalid("log scale needs positive bounds"));
                }
            }
            ParameterDomain::Float {
                low,
                high,
                log_scale,
            } => {
                if !low.is_finite() || !high.is_finite() {
                    return Err(invalid("bounds must be finite"));
                }
                if low > high {
                    return Err(invalid("low exceeds high"));
                }
                if *log_scale && *low <= 0.0 {
                    return Err(invalid("log scale needs positive bounds"));
                }
            }
        }

        Ok(())
    }

    /// Draw a value uniformly (log-uniformly for log-scale domains).
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamValue {
        match self {
            ParameterDomain::Categorical { choices } => {
                ParamValue::Categorical(choices[rng.gen_range(0..choices.len())].clone())
            }
            ParameterDomain::Int {
                low,
                high,
                log_scale: false,
            } => ParamValue::Int(rng.gen_range(*low..=*high)),
            ParameterDomain::Int { .. } | ParameterDomain::Float { .. } => {
                let (low, high) = self.internal_bounds();
                self.from_internal(low + rng.gen::<f64>() * (high - low))
            }
        }
    }

    /// Whether `value` lies in the domain.
    pub fn contains(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (ParameterDomain::Categorical { choices }, ParamValue::Categorical(choice)) => {
                choices.contains(choice)
            }
            (ParameterDomain::Int { low, high, .. }, ParamValue::Int(value)) => {
                low <= value && value <= high
            }
            (ParameterDomain::Float { low, high, .. }, ParamValue::Float(value)) => {
                low <= value && value <= high
            }
            _ => false,
        }
    }

    /// Numeric bounds of the working space (log space for log-scale
    /// domains). Integer domains widen by half a unit on each side so that
    /// rounding gives every integer an equal share.
    pub(crate) fn internal_bounds(&self) -> (f64, f64) {
        match self {
            ParameterDomain::Categorical { choices } => (0.0, choices.len() as f64),
            ParameterDomain::Int {
                low,
                high,
                log_scale,
            } => {
                if *log_scale {
                    ((*low as f64 - 0.5).max(0.5).ln(), (*high as f64 + 0.5).ln())
                } else {
                    (*low as f64 - 0.5, *high as f64 + 0.5)
                }
            }
            ParameterDomain::Float {
                low,
                high,
                log_scale,
            } => {
                if *log_scale {
                    (low.ln(), high.ln())
                } else {
                    (*low, *high)
                }
            }
        }
    }

    /// Map a value into the working space.
    pub(crate) fn to_internal(&self, value: &ParamValue) -> Option<f64> {
        let log_scale = match self {
            ParameterDomain::Categorical { .. } => return None,
            ParameterDomain::Int { log_scale, .. } | ParameterDomain::Float { log_scale, .. } => {
                *log_scale
            }
        };
        let value = value.as_float()?;

        Some(if log_scale { value.ln() } else { value })
    }

    /// Map a working-space point back into the domain.
    pub(crate) fn from_internal(&self, x: f64) -> ParamValue {
        match self {
            ParameterDomain::Categorical { choices } => {
                let idx = (x.max(0.0) as usize).min(choices.len().saturating_sub(1));
                ParamValue::Categorical(choices[idx].clone())
            }
            ParameterDomain::Int {
                low,
                high,
                log_scale,
            } => {
                let x = if *log_scale { x.exp() } else { x };
                ParamValue::Int((x.round() as i64).clamp(*low, *high))
            }
            ParameterDomain::Float {
                low,
                high,
                log_scale,
            } => {
                let x = if *log_scale { x.exp() } else { x };
                ParamValue::Float(x.clamp(*low, *high))
            }
        }
    }
}

/// Named hyperparameter domains, iterated in name order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchSpace {
    params: BTreeMap<String, ParameterDomain>,
}

impl SearchSpace {
    /// An empty space.
    pub fn new() -> Self {
        SearchSpace::default()
    }

    /// Add a parameter.
    pub fn add(mut self, name: &str, domain: ParameterDomain) -> Self {
        self.params.insert(name.to_owned(), domain);
        self
    }

    /// Domain of `name`.
    pub fn get(&self, name: &str) -> Option<&ParameterDomain> {
        self.params.get(name)
    }

    /// Whether `name` is searched over.
    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the space has no parameters.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameters in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterDomain)> {
        self.params
            .iter()
            .map(|(name, domain)| (name.as_str(), domain))
    }

    /// Validate every domain.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.iter().try_for_each(|(name, domain)| domain.validate(name))
    }

    /// Draw an independent value for every parameter.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Assignment {
        self.iter()
            .map(|(name, domain)| (name.to_owned(), domain.sample(rng)))
            .collect()
    }
}
