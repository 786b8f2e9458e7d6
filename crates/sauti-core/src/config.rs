//! Session configuration: synthesis prosody and VAD tunables.
//!
//! Every field has an enumerated default so that a `create` request with an
//! empty body yields a fully-populated config that round-trips through the
//! control surface field-for-field.

use serde::{Deserialize, Serialize};

/// Synthesis voice identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    #[default]
    Alloy,
    Echo,
    Fable,
    Onyx,
    Nova,
    Shimmer,
}

/// Speaking tone requested from the synthesizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Friendly,
    #[default]
    Professional,
    Formal,
    Casual,
}

/// Speaking pace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pace {
    Slow,
    #[default]
    Normal,
    Fast,
}

/// Vocal energy level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Energy {
    Low,
    #[default]
    Medium,
    High,
}

/// Per-session configuration, fixed at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub voice: Voice,
    pub tone: Tone,
    pub pace: Pace,
    pub energy: Energy,
    /// Apply prosody shaping during synthesis.
    pub prosody: bool,
    pub enable_breaths: bool,
    pub enable_ssml: bool,
    /// Client-facing VAD knob in [0,1]. 0.5 leaves the server threshold
    /// unchanged; higher values make speech detection more eager.
    pub vad_sensitivity: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            voice: Voice::default(),
            tone: Tone::default(),
            pace: Pace::default(),
            energy: Energy::default(),
            prosody: true,
            enable_breaths: true,
            enable_ssml: true,
            vad_sensitivity: 0.5,
        }
    }
}

impl SessionConfig {
    /// Scale a base energy threshold by the session's sensitivity.
    ///
    /// Sensitivity 0.5 maps to the base threshold exactly; 1.0 halves it,
    /// 0.0 doubles it. The result is clamped away from zero so a maxed-out
    /// sensitivity cannot turn every frame into speech.
    pub fn effective_vad_threshold(&self, base_threshold: f32) -> f32 {
        let sensitivity = self.vad_sensitivity.clamp(0.0, 1.0);
        (base_threshold * (1.5 - sensitivity)).max(base_threshold * 0.25)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_enumerated_values() {
        let config = SessionConfig::default();
        assert_eq!(config.voice, Voice::Alloy);
        assert_eq!(config.tone, Tone::Professional);
        assert_eq!(config.pace, Pace::Normal);
        assert_eq!(config.energy, Energy::Medium);
        assert!(config.prosody);
        assert!(config.enable_breaths);
        assert!(config.enable_ssml);
        assert!((config.vad_sensitivity - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn enums_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&Voice::Alloy).unwrap(), "\"alloy\"");
        assert_eq!(serde_json::to_string(&Tone::Casual).unwrap(), "\"casual\"");
        assert_eq!(serde_json::to_string(&Pace::Fast).unwrap(), "\"fast\"");
        assert_eq!(serde_json::to_string(&Energy::High).unwrap(), "\"high\"");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"voice":"nova"}"#).unwrap();
        assert_eq!(config.voice, Voice::Nova);
        assert_eq!(config.tone, Tone::Professional);
        assert!(config.enable_ssml);
    }

    #[test]
    fn sensitivity_scales_threshold() {
        let config = SessionConfig::default();
        assert!((config.effective_vad_threshold(0.01) - 0.01).abs() < 1e-6);

        let eager = SessionConfig {
            vad_sensitivity: 1.0,
            ..Default::default()
        };
        assert!(eager.effective_vad_threshold(0.01) < 0.01);

        let reluctant = SessionConfig {
            vad_sensitivity: 0.0,
            ..Default::default()
        };
        assert!(reluctant.effective_vad_threshold(0.01) > 0.01);
    }
}
