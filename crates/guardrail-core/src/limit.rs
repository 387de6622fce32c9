//! Typed limit values and limit definitions.
//!
//! Each limit has a declared [`LimitKind`]; its default and bounds are parsed
//! into the matching [`LimitValue`] variant when the config is loaded, so the
//! rest of the controller never has to guess whether `"30s"` or `65536` is a
//! duration, a byte size, or a plain count.

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::{ConfigError, ConfigResult};

/// Declared type of a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Count,
    Rate,
    Size,
    Duration,
    Bool,
    String,
    Percentage,
}

/// Which protected traffic dimension a limit governs.
///
/// The breaker derives its per-metric thresholds from the limits of each
/// class, and emergency ingestion throttling only touches `Ingestion` limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LimitClass {
    Ingestion,
    Query,
    Series,
    Burst,
    #[default]
    Other,
}

/// A limit value tagged with its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum LimitValue {
    Count(u64),
    Rate(f64),
    /// Bytes.
    Size(u64),
    /// Seconds.
    Duration(u64),
    Bool(bool),
    String(String),
    /// 0–100.
    Percentage(f64),
}

impl LimitValue {
    pub fn kind(&self) -> LimitKind {
        match self {
            Self::Count(_) => LimitKind::Count,
            Self::Rate(_) => LimitKind::Rate,
            Self::Size(_) => LimitKind::Size,
            Self::Duration(_) => LimitKind::Duration,
            Self::Bool(_) => LimitKind::Bool,
            Self::String(_) => LimitKind::String,
            Self::Percentage(_) => LimitKind::Percentage,
        }
    }

    /// Numeric view used for arithmetic. `None` for bool and string limits.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Count(v) | Self::Size(v) | Self::Duration(v) => Some(*v as f64),
            Self::Rate(v) | Self::Percentage(v) => Some(*v),
            Self::Bool(_) | Self::String(_) => None,
        }
    }
}

impl std::fmt::Display for LimitValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Count(v) => write!(f, "{v}"),
            Self::Rate(v) => write!(f, "{v:.2}/s"),
            Self::Size(v) => write!(f, "{v}B"),
            Self::Duration(v) => write!(f, "{v}s"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Percentage(v) => write!(f, "{v:.1}%"),
        }
    }
}

/// A limit value as written in TOML, before it is checked against its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawLimitValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl LimitKind {
    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::Bool | Self::String)
    }

    /// Convert a raw TOML value into a typed value of this kind.
    pub fn parse(self, raw: &RawLimitValue) -> Result<LimitValue, String> {
        let number = || match raw {
            RawLimitValue::Int(v) => Some(*v as f64),
            RawLimitValue::Float(v) => Some(*v),
            _ => None,
        };
        let non_negative = |v: f64| {
            if v.is_finite() && v >= 0.0 {
                Ok(v)
            } else {
                Err(format!("expected a non-negative number, got {v}"))
            }
        };

        match self {
            Self::Count => match raw {
                RawLimitValue::Int(v) if *v >= 0 => Ok(LimitValue::Count(*v as u64)),
                _ => Err(format!("expected a non-negative integer count, got {raw:?}")),
            },
            Self::Rate => number()
                .ok_or_else(|| format!("expected a numeric rate, got {raw:?}"))
                .and_then(non_negative)
                .map(LimitValue::Rate),
            Self::Size => match raw {
                RawLimitValue::Int(v) if *v >= 0 => Ok(LimitValue::Size(*v as u64)),
                RawLimitValue::Text(s) => parse_size(s).map(LimitValue::Size),
                _ => Err(format!("expected a byte size, got {raw:?}")),
            },
            Self::Duration => match raw {
                RawLimitValue::Int(v) if *v >= 0 => Ok(LimitValue::Duration(*v as u64)),
                RawLimitValue::Text(s) => parse_duration(s)
                    .map(|d| LimitValue::Duration(d.as_secs()))
                    .map_err(|e| e.to_string()),
                _ => Err(format!("expected a duration, got {raw:?}")),
            },
            Self::Bool => match raw {
                RawLimitValue::Bool(v) => Ok(LimitValue::Bool(*v)),
                _ => Err(format!("expected a boolean, got {raw:?}")),
            },
            Self::String => match raw {
                RawLimitValue::Text(s) => Ok(LimitValue::String(s.clone())),
                _ => Err(format!("expected a string, got {raw:?}")),
            },
            Self::Percentage => number()
                .filter(|v| (0.0..=100.0).contains(v))
                .map(LimitValue::Percentage)
                .ok_or_else(|| format!("expected a percentage in [0, 100], got {raw:?}")),
        }
    }

    /// Build a typed value from a computed number, rounding to whole units
    /// where the kind requires it. `None` for non-numeric kinds or non-finite
    /// input.
    pub fn from_f64(self, value: f64) -> Option<LimitValue> {
        if !value.is_finite() {
            return None;
        }
        let whole = value.max(0.0).round() as u64;
        match self {
            Self::Count => Some(LimitValue::Count(whole)),
            Self::Rate => Some(LimitValue::Rate(value.max(0.0))),
            Self::Size => Some(LimitValue::Size(whole)),
            Self::Duration => Some(LimitValue::Duration(whole)),
            Self::Percentage => Some(LimitValue::Percentage(value.clamp(0.0, 100.0))),
            Self::Bool | Self::String => None,
        }
    }
}

/// Parse "64MB", "512KiB", "1GB" or a bare number of bytes.
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let idx = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(idx);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size {s:?}"))?;
    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        other => return Err(format!("unknown size unit {other:?} in {s:?}")),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size {s:?} does not fit in 64 bits"))
}

/// A validated limit definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitDefinition {
    pub name: String,
    pub kind: LimitKind,
    pub class: LimitClass,
    pub default: LimitValue,
    /// Lower bound. Present for every numeric kind.
    pub min: Option<LimitValue>,
    /// Upper bound. Present for every numeric kind.
    pub max: Option<LimitValue>,
    /// Headroom added on top of observed usage, in percent.
    pub buffer_factor: f64,
    pub enabled: bool,
    /// Metric name whose samples drive this limit.
    pub metric_source: String,
}

impl LimitDefinition {
    /// Numeric `(min, max)` bounds, `None` for non-numeric kinds.
    pub fn bounds(&self) -> Option<(f64, f64)> {
        let min = self.min.as_ref()?.as_f64()?;
        let max = self.max.as_ref()?.as_f64()?;
        Some((min, max))
    }

    /// Default value as a number, when the kind is numeric.
    pub fn default_f64(&self) -> Option<f64> {
        self.default.as_f64()
    }

    /// Whether `value` lies inside the definition's bounds.
    pub fn contains(&self, value: f64) -> bool {
        match self.bounds() {
            Some((min, max)) => value.is_finite() && value >= min && value <= max,
            None => false,
        }
    }
}

/// A limit definition as written in TOML.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawLimitDefinition {
    #[serde(rename = "type")]
    pub kind: LimitKind,
    #[serde(default)]
    pub class: LimitClass,
    pub default: RawLimitValue,
    pub min: Option<RawLimitValue>,
    pub max: Option<RawLimitValue>,
    #[serde(default = "default_buffer_factor")]
    pub buffer_factor: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub metric_source: Option<String>,
}

fn default_buffer_factor() -> f64 {
    20.0
}

fn default_enabled() -> bool {
    true
}

impl RawLimitDefinition {
    /// Validate and convert into a typed [`LimitDefinition`].
    pub fn validate(self, name: &str) -> ConfigResult<LimitDefinition> {
        let parse = |raw: &RawLimitValue, what: &str| {
            self.kind
                .parse(raw)
                .map_err(|e| ConfigError::limit(name, format!("{what}: {e}")))
        };

        let default = parse(&self.default, "default")?;
        let min = self.min.as_ref().map(|v| parse(v, "min")).transpose()?;
        let max = self.max.as_ref().map(|v| parse(v, "max")).transpose()?;

        if self.kind.is_numeric() {
            let (Some(lo), Some(hi)) = (
                min.as_ref().and_then(LimitValue::as_f64),
                max.as_ref().and_then(LimitValue::as_f64),
            ) else {
                return Err(ConfigError::limit(name, "numeric limits require min and max"));
            };
            if lo > hi {
                return Err(ConfigError::limit(name, format!("min {lo} > max {hi}")));
            }
            let dv = default.as_f64().unwrap_or(lo);
            if dv < lo || dv > hi {
                return Err(ConfigError::limit(
                    name,
                    format!("default {dv} outside [{lo}, {hi}]"),
                ));
            }
            if !self.buffer_factor.is_finite() || self.buffer_factor < 0.0 {
                return Err(ConfigError::limit(
                    name,
                    format!("buffer_factor must be >= 0, got {}", self.buffer_factor),
                ));
            }
        } else if min.is_some() || max.is_some() {
            return Err(ConfigError::limit(name, "bool and string limits take no bounds"));
        }

        let metric_source = match self.metric_source {
            Some(s) if s.trim().is_empty() => {
                return Err(ConfigError::limit(name, "metric_source must not be empty"));
            }
            Some(s) => s,
            None => name.to_string(),
        };

        Ok(LimitDefinition {
            name: name.to_string(),
            kind: self.kind,
            class: self.class,
            default,
            min,
            max,
            buffer_factor: self.buffer_factor,
            enabled: self.enabled,
            metric_source,
        })
    }
}

/// Tier-specific bounds applied after the definition's own bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TierBounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl TierBounds {
    /// Clamp `value` into the tier's bounds.
    pub fn clamp(&self, value: f64) -> f64 {
        let mut v = value;
        if let Some(min) = self.min {
            v = v.max(min);
        }
        if let Some(max) = self.max {
            v = v.min(max);
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(kind: LimitKind, default: RawLimitValue, min: i64, max: i64) -> RawLimitDefinition {
        RawLimitDefinition {
            kind,
            class: LimitClass::Ingestion,
            default,
            min: Some(RawLimitValue::Int(min)),
            max: Some(RawLimitValue::Int(max)),
            buffer_factor: 20.0,
            enabled: true,
            metric_source: None,
        }
    }

    #[test]
    fn parse_values_by_kind() {
        assert_eq!(
            LimitKind::Count.parse(&RawLimitValue::Int(5)).unwrap(),
            LimitValue::Count(5)
        );
        assert_eq!(
            LimitKind::Size.parse(&RawLimitValue::Text("64MB".into())).unwrap(),
            LimitValue::Size(64_000_000)
        );
        assert_eq!(
            LimitKind::Size.parse(&RawLimitValue::Text("2KiB".into())).unwrap(),
            LimitValue::Size(2048)
        );
        assert_eq!(
            LimitKind::Duration.parse(&RawLimitValue::Text("5m".into())).unwrap(),
            LimitValue::Duration(300)
        );
        assert_eq!(
            LimitKind::Rate.parse(&RawLimitValue::Float(12.5)).unwrap(),
            LimitValue::Rate(12.5)
        );
        assert!(LimitKind::Percentage.parse(&RawLimitValue::Int(101)).is_err());
        assert!(LimitKind::Count.parse(&RawLimitValue::Int(-1)).is_err());
        assert!(LimitKind::Bool.parse(&RawLimitValue::Int(1)).is_err());
    }

    #[test]
    fn from_f64_rounds_whole_unit_kinds() {
        assert_eq!(LimitKind::Count.from_f64(10.6), Some(LimitValue::Count(11)));
        assert_eq!(LimitKind::Rate.from_f64(10.6), Some(LimitValue::Rate(10.6)));
        assert_eq!(
            LimitKind::Percentage.from_f64(140.0),
            Some(LimitValue::Percentage(100.0))
        );
        assert_eq!(LimitKind::Bool.from_f64(1.0), None);
        assert_eq!(LimitKind::Count.from_f64(f64::NAN), None);
    }

    #[test]
    fn validate_accepts_well_formed_definition() {
        let def = raw(LimitKind::Rate, RawLimitValue::Int(10_000), 1_000, 100_000)
            .validate("ingestion_rate")
            .unwrap();
        assert_eq!(def.bounds(), Some((1_000.0, 100_000.0)));
        assert_eq!(def.metric_source, "ingestion_rate");
        assert!(def.contains(5_000.0));
        assert!(!def.contains(500.0));
    }

    #[test]
    fn validate_rejects_min_greater_than_max() {
        let err = raw(LimitKind::Count, RawLimitValue::Int(50), 100, 10)
            .validate("max_series")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLimit { .. }));
    }

    #[test]
    fn validate_rejects_default_outside_bounds() {
        assert!(
            raw(LimitKind::Count, RawLimitValue::Int(500), 1, 100)
                .validate("max_series")
                .is_err()
        );
    }

    #[test]
    fn validate_rejects_bounds_on_bool() {
        let mut def = raw(LimitKind::Bool, RawLimitValue::Bool(true), 0, 1);
        def.kind = LimitKind::Bool;
        assert!(def.validate("query_sharding").is_err());
    }

    #[test]
    fn tier_bounds_clamp() {
        let tier = TierBounds {
            min: Some(10.0),
            max: Some(20.0),
        };
        assert_eq!(tier.clamp(5.0), 10.0);
        assert_eq!(tier.clamp(25.0), 20.0);
        assert_eq!(tier.clamp(15.0), 15.0);
    }
}
