//! Ordered `key = value` parameter files, the format read by the Boltzmann
//! solver, the IC generator and the N-body code alike.

use crate::error::{Result, SimError};
use crate::fsutil::atomic_write_bytes;
use serde::Serialize;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
    FloatList(Vec<f64>),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    fn parse(raw: &str) -> ParamValue {
        let raw = raw.trim();
        if let Ok(v) = raw.parse::<i64>() {
            return ParamValue::Int(v);
        }
        if let Ok(v) = raw.parse::<f64>() {
            return ParamValue::Float(v);
        }
        if raw.contains(',') {
            let parts: std::result::Result<Vec<f64>, _> =
                raw.split(',').map(|p| p.trim().parse::<f64>()).collect();
            if let Ok(values) = parts {
                return ParamValue::FloatList(values);
            }
        }
        ParamValue::Str(raw.to_string())
    }
}

/// Shortest round-trip rendering, with `.0` kept on integral values and
/// exponent form for very small or very large magnitudes.
pub fn format_float(x: f64) -> String {
    if !x.is_finite() {
        return x.to_string();
    }
    if x == 0.0 {
        return "0.0".to_string();
    }
    let a = x.abs();
    if a < 1e-4 || a >= 1e16 {
        return format!("{:e}", x);
    }
    let s = x.to_string();
    if s.contains('.') {
        s
    } else {
        format!("{}.0", s)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => f.write_str(&format_float(*v)),
            ParamValue::Str(s) => f.write_str(s),
            ParamValue::FloatList(values) => {
                let parts: Vec<String> = values.iter().map(|v| format_float(*v)).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<Vec<f64>> for ParamValue {
    fn from(v: Vec<f64>) -> Self {
        ParamValue::FloatList(v)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamFile {
    entries: Vec<(String, ParamValue)>,
}

impl ParamFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut out = ParamFile::new();
        for (idx, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let (key, value) = trimmed.split_once('=').ok_or_else(|| {
                SimError::ConsistencyFailure(format!(
                    "line {}: expected `key = value`, found `{}`",
                    idx + 1,
                    trimmed
                ))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(SimError::ConsistencyFailure(format!(
                    "line {}: empty key",
                    idx + 1
                )));
            }
            out.set(key, ParamValue::parse(value));
        }
        Ok(out)
    }

    /// Replaces the value in place when `key` exists, appends otherwise.
    pub fn set(&mut self, key: &str, value: impl Into<ParamValue>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn merge<I, K>(&mut self, overrides: I)
    where
        I: IntoIterator<Item = (K, ParamValue)>,
        K: AsRef<str>,
    {
        for (k, v) in overrides {
            self.set(k.as_ref(), v);
        }
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(ParamValue::as_f64)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Requires `key` to render exactly as `literal`.
    pub fn expect_literal(&self, key: &str, literal: &str) -> Result<()> {
        match self.get(key) {
            Some(v) if v.to_string() == literal => Ok(()),
            Some(v) => Err(SimError::ConsistencyFailure(format!(
                "{} must be {} (found {})",
                key, literal, v
            ))),
            None => Err(SimError::ConsistencyFailure(format!(
                "{} must be {} (key missing)",
                key, literal
            ))),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.entries {
            out.push_str(k);
            out.push_str(" = ");
            out.push_str(&v.to_string());
            out.push('\n');
        }
        out
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        atomic_write_bytes(path, self.render().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_render_like_config_readers_expect() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.288), "0.288");
        assert_eq!(format_float(99.0), "99.0");
        assert_eq!(format_float(2.427e-9), "2.427e-9");
        assert_eq!(format_float(-1.1), "-1.1");
        assert_eq!(format_float(0.0), "0.0");
    }

    #[test]
    fn set_replaces_in_place_and_keeps_order() {
        let mut p = ParamFile::new();
        p.set("Omega0", 0.3);
        p.set("Seed", 7i64);
        p.set("Omega0", 0.288);
        assert_eq!(p.keys().collect::<Vec<_>>(), vec!["Omega0", "Seed"]);
        assert_eq!(p.get_f64("Omega0"), Some(0.288));
        assert_eq!(p.render(), "Omega0 = 0.288\nSeed = 7\n");
    }

    #[test]
    fn parse_types_values_and_skips_comments() {
        let text = "# defaults\nWhichSpectrum = 2\nOmega0 = 0.3\n\nOutputDir = ICS\nOutputList = 0.1,0.5\nextra metric transfer functions = y\n";
        let p = ParamFile::parse(text).expect("parse");
        assert_eq!(p.get("WhichSpectrum"), Some(&ParamValue::Int(2)));
        assert_eq!(p.get("Omega0"), Some(&ParamValue::Float(0.3)));
        assert_eq!(p.get("OutputDir").and_then(|v| v.as_str()), Some("ICS"));
        assert_eq!(p.get("OutputList"), Some(&ParamValue::FloatList(vec![0.1, 0.5])));
        assert_eq!(
            p.get("extra metric transfer functions").and_then(|v| v.as_str()),
            Some("y")
        );
        assert_eq!(p.len(), 5);
    }

    #[test]
    fn parse_reports_line_of_malformed_entry() {
        let err = ParamFile::parse("A = 1\nnot a pair\n").expect_err("malformed");
        assert!(err.to_string().contains("line 2"), "{}", err);
    }

    #[test]
    fn expect_literal_flags_mismatch() {
        let mut p = ParamFile::new();
        p.set("RadiationOn", 1i64);
        assert!(p.expect_literal("RadiationOn", "1").is_ok());
        p.set("RadiationOn", 0i64);
        let err = p.expect_literal("RadiationOn", "1").expect_err("mismatch");
        assert!(matches!(err, SimError::ConsistencyFailure(_)));
        assert!(p.expect_literal("Missing", "1").is_err());
    }

    #[test]
    fn merge_applies_overrides_in_order() {
        let mut p = ParamFile::new();
        p.set("MaxMemSizePerNode", 0.6);
        p.merge(vec![
            ("MaxMemSizePerNode", ParamValue::Float(0.8)),
            ("ShowBacktrace", ParamValue::Int(0)),
        ]);
        assert_eq!(p.get_f64("MaxMemSizePerNode"), Some(0.8));
        assert_eq!(p.get_f64("ShowBacktrace"), Some(0.0));
    }
}
