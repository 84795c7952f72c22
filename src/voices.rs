//! Agent voice names as shown in the builder, mapped to provider voices

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct VoiceOption {
    pub display_name: &'static str,
    pub provider_voice: &'static str,
    pub description: &'static str,
}

pub const DEFAULT_VOICE: &str = "Puck";

pub const VOICES: &[VoiceOption] = &[
    VoiceOption {
        display_name: "Friendly",
        provider_voice: "Puck",
        description: "Upbeat and warm",
    },
    VoiceOption {
        display_name: "Professional",
        provider_voice: "Charon",
        description: "Calm and informative",
    },
    VoiceOption {
        display_name: "Confident",
        provider_voice: "Kore",
        description: "Firm and clear",
    },
    VoiceOption {
        display_name: "Energetic",
        provider_voice: "Fenrir",
        description: "Excitable and fast",
    },
    VoiceOption {
        display_name: "Soothing",
        provider_voice: "Aoede",
        description: "Breezy and relaxed",
    },
    VoiceOption {
        display_name: "Bright",
        provider_voice: "Zephyr",
        description: "Light and bright",
    },
];

/// Resolve a voice profile from an agent record.
///
/// Accepts either a display name or a provider voice (any case); anything
/// unknown falls back to the default voice.
pub fn provider_voice(profile: &str) -> &'static str {
    let profile = profile.trim();
    VOICES
        .iter()
        .find(|v| {
            v.display_name.eq_ignore_ascii_case(profile)
                || v.provider_voice.eq_ignore_ascii_case(profile)
        })
        .map(|v| v.provider_voice)
        .unwrap_or_else(|| {
            if !profile.is_empty() {
                tracing::debug!("Unknown voice '{}', using {}", profile, DEFAULT_VOICE);
            }
            DEFAULT_VOICE
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_provider_names_resolve() {
        assert_eq!(provider_voice("Professional"), "Charon");
        assert_eq!(provider_voice("soothing"), "Aoede");
        assert_eq!(provider_voice("KORE"), "Kore");
    }

    #[test]
    fn test_unknown_voice_falls_back() {
        assert_eq!(provider_voice("Robot"), DEFAULT_VOICE);
        assert_eq!(provider_voice(""), DEFAULT_VOICE);
    }
}
