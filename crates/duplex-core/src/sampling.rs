//! Per-session sampling overrides.
//!
//! Every field is optional: an absent field means "use the engine default".
//! Overrides sent with a `start` are layered over what the session already
//! holds, so a client only needs to send the knobs it wants to change.

use serde::{Deserialize, Serialize};

/// Sampling parameters a client may override for its session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingOverrides {
    /// Softmax temperature, `0.0..=2.0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling mass, `(0.0, 1.0]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Top-k cutoff; `-1` disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    /// Minimum probability relative to the top token, `0.0..=1.0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f64>,
    /// Multiplicative repetition penalty, `> 0.0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f64>,
    /// Additive presence penalty, `-2.0..=2.0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    /// Additive frequency penalty, `-2.0..=2.0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    /// Strip markup and control characters from chat tokens before emission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sanitize_output: Option<bool>,
}

impl SamplingOverrides {
    /// Check every present field against its allowed range.
    ///
    /// Returns a human-readable description of the first offending field.
    pub fn validate(&self) -> Result<(), String> {
        check_range("temperature", self.temperature, 0.0, 2.0)?;
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(format!("top_p must be in (0, 1], got {p}"));
            }
        }
        if let Some(k) = self.top_k {
            if k == 0 || k < -1 {
                return Err(format!("top_k must be -1 or positive, got {k}"));
            }
        }
        check_range("min_p", self.min_p, 0.0, 1.0)?;
        if let Some(r) = self.repetition_penalty {
            if !(r > 0.0 && r.is_finite()) {
                return Err(format!("repetition_penalty must be positive, got {r}"));
            }
        }
        check_range("presence_penalty", self.presence_penalty, -2.0, 2.0)?;
        check_range("frequency_penalty", self.frequency_penalty, -2.0, 2.0)?;
        Ok(())
    }

    /// Overlay `other` on top of `self`; fields present in `other` win.
    pub fn merge(&mut self, other: &Self) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        overlay!(
            temperature,
            top_p,
            top_k,
            min_p,
            repetition_penalty,
            presence_penalty,
            frequency_penalty,
            sanitize_output
        );
    }

    /// Whether chat output should be sanitized (default `false`).
    pub fn sanitize(&self) -> bool {
        self.sanitize_output.unwrap_or(false)
    }
}

fn check_range(name: &str, value: Option<f64>, min: f64, max: f64) -> Result<(), String> {
    match value {
        Some(v) if !(v >= min && v <= max) => {
            Err(format!("{name} must be in [{min}, {max}], got {v}"))
        }
        _ => Ok(()),
    }
}
