use std::collections::HashMap;

use crate::core::model::{Id, Speaker};

/// Hard fallback when nothing else resolves.
pub const DEFAULT_VOICE: &str = "fr-FR-DeniseNeural";
pub const DEFAULT_FEMALE_VOICE: &str = "fr-FR-DeniseNeural";
pub const DEFAULT_MALE_VOICE: &str = "fr-FR-HenriNeural";
/// Language the registry falls back to when a locale and its language are both
/// absent from the catalog.
const DEFAULT_LANGUAGE: &str = "fr";

const TRAIT_MATCH_BONUS: i32 = 3;

/// One synthesizer voice and the traits it matches against. All trait strings
/// are lowercase.
#[derive(Debug, Clone)]
pub struct VoiceProfile {
    pub voice_id: &'static str,
    pub locale: &'static str,
    pub gender: &'static str,
    pub age_category: &'static str,
    pub tone: &'static str,
    pub voice_quality: &'static str,
    /// 1-10, higher is better.
    pub base_score: i32,
}

const fn profile(
    voice_id: &'static str,
    locale: &'static str,
    gender: &'static str,
    age_category: &'static str,
    tone: &'static str,
    voice_quality: &'static str,
    base_score: i32,
) -> VoiceProfile {
    VoiceProfile {
        voice_id,
        locale,
        gender,
        age_category,
        tone,
        voice_quality,
        base_score,
    }
}

/// Curated Edge voices with matching metadata. French first (the default
/// content language), then English, Spanish, German, Italian.
const CATALOG: &[VoiceProfile] = &[
    profile("fr-FR-DeniseNeural", "fr-FR", "female", "adult", "warm", "calm", 8),
    profile("fr-FR-EloiseNeural", "fr-FR", "female", "young", "soft", "cheerful", 7),
    profile("fr-FR-VivienneMultilingualNeural", "fr-FR", "female", "adult", "professional", "authoritative", 8),
    profile("fr-FR-HenriNeural", "fr-FR", "male", "adult", "deep", "calm", 8),
    profile("fr-FR-AlainNeural", "fr-FR", "male", "adult", "warm", "friendly", 7),
    profile("fr-FR-ClaudeNeural", "fr-FR", "male", "old", "deep", "authoritative", 7),
    profile("fr-FR-JeromeNeural", "fr-FR", "male", "young", "energetic", "enthusiastic", 6),
    profile("fr-FR-MauriceNeural", "fr-FR", "male", "old", "rough", "serious", 6),
    profile("fr-FR-YvesNeural", "fr-FR", "male", "adult", "professional", "calm", 7),
    profile("fr-FR-RemyMultilingualNeural", "fr-FR", "male", "adult", "clear", "professional", 8),
    profile("fr-FR-BrigitteNeural", "fr-FR", "female", "teen", "high", "energetic", 6),
    profile("fr-FR-CelesteNeural", "fr-FR", "female", "teen", "soft", "gentle", 6),
    profile("en-US-JennyNeural", "en-US", "female", "adult", "warm", "friendly", 9),
    profile("en-US-AriaNeural", "en-US", "female", "young", "energetic", "cheerful", 8),
    profile("en-US-SaraNeural", "en-US", "female", "adult", "professional", "calm", 8),
    profile("en-US-NancyNeural", "en-US", "female", "old", "warm", "wise", 7),
    profile("en-US-GuyNeural", "en-US", "male", "adult", "deep", "authoritative", 9),
    profile("en-US-TonyNeural", "en-US", "male", "young", "energetic", "enthusiastic", 8),
    profile("en-US-ChristopherNeural", "en-US", "male", "adult", "professional", "calm", 8),
    profile("en-US-EricNeural", "en-US", "male", "adult", "deep", "serious", 7),
    profile("en-GB-SoniaNeural", "en-GB", "female", "adult", "warm", "professional", 8),
    profile("en-GB-LibbyNeural", "en-GB", "female", "young", "cheerful", "friendly", 8),
    profile("en-GB-MaisieNeural", "en-GB", "female", "child", "high", "enthusiastic", 7),
    profile("en-GB-RyanNeural", "en-GB", "male", "adult", "deep", "authoritative", 8),
    profile("en-GB-ThomasNeural", "en-GB", "male", "young", "energetic", "friendly", 7),
    profile("es-ES-ElviraNeural", "es-ES", "female", "adult", "warm", "calm", 7),
    profile("es-ES-AlvaroNeural", "es-ES", "male", "adult", "deep", "authoritative", 7),
    profile("es-MX-DaliaNeural", "es-MX", "female", "young", "cheerful", "friendly", 7),
    profile("es-MX-JorgeNeural", "es-MX", "male", "adult", "warm", "professional", 7),
    profile("de-DE-KatjaNeural", "de-DE", "female", "adult", "professional", "calm", 7),
    profile("de-DE-ConradNeural", "de-DE", "male", "adult", "deep", "authoritative", 7),
    profile("it-IT-ElsaNeural", "it-IT", "female", "adult", "warm", "expressive", 7),
    profile("it-IT-DiegoNeural", "it-IT", "male", "adult", "deep", "passionate", 7),
];

/// Static voice catalog plus the selection algorithm. Pure: selection depends
/// only on the arguments and the catalog.
#[derive(Debug, Clone)]
pub struct VoiceRegistry {
    voices: &'static [VoiceProfile],
}

impl Default for VoiceRegistry {
    fn default() -> Self {
        Self { voices: CATALOG }
    }
}

impl VoiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn profile(&self, voice_id: &str) -> Option<&VoiceProfile> {
        self.voices.iter().find(|v| v.voice_id == voice_id)
    }

    /// Picks the best voice for a set of character traits.
    ///
    /// Narrowing order: exact locale, else same language, else the default
    /// language; then gender, then age, each only narrowing when the result
    /// stays non-empty. Candidates score their base quality plus a bonus per
    /// requested tone/quality substring match. Equal scores break to the
    /// lexicographically smallest voice id, so selection is reproducible.
    pub fn find_best_match(
        &self,
        gender: Option<&str>,
        age_category: Option<&str>,
        tone: Option<&str>,
        voice_quality: Option<&str>,
        locale: &str,
    ) -> String {
        let mut candidates: Vec<&VoiceProfile> = self
            .voices
            .iter()
            .filter(|v| v.locale.eq_ignore_ascii_case(locale))
            .collect();

        if candidates.is_empty() {
            let language = locale.split('-').next().unwrap_or(locale).to_lowercase();
            candidates = self
                .voices
                .iter()
                .filter(|v| v.locale.to_lowercase().starts_with(&language))
                .collect();
        }

        if candidates.is_empty() {
            candidates = self
                .voices
                .iter()
                .filter(|v| v.locale.starts_with(DEFAULT_LANGUAGE))
                .collect();
        }

        if let Some(gender) = gender {
            let gender = gender.to_lowercase();
            let narrowed: Vec<&VoiceProfile> = candidates
                .iter()
                .copied()
                .filter(|v| v.gender == gender)
                .collect();
            if !narrowed.is_empty() {
                candidates = narrowed;
            }
        }

        if let Some(age) = age_category {
            let age = age.to_lowercase();
            let narrowed: Vec<&VoiceProfile> = candidates
                .iter()
                .copied()
                .filter(|v| v.age_category == age)
                .collect();
            if !narrowed.is_empty() {
                candidates = narrowed;
            }
        }

        let tone = tone.map(str::to_lowercase);
        let quality = voice_quality.map(str::to_lowercase);
        let score = |v: &VoiceProfile| -> i32 {
            let mut score = v.base_score;
            if let Some(t) = &tone {
                if v.tone.contains(t.as_str()) {
                    score += TRAIT_MATCH_BONUS;
                }
            }
            if let Some(q) = &quality {
                if v.voice_quality.contains(q.as_str()) {
                    score += TRAIT_MATCH_BONUS;
                }
            }
            score
        };

        let mut best: Option<(&VoiceProfile, i32)> = None;
        for candidate in candidates {
            let s = score(candidate);
            match best {
                Some((held, held_score))
                    if s < held_score || (s == held_score && candidate.voice_id >= held.voice_id) => {}
                _ => best = Some((candidate, s)),
            }
        }

        match best {
            Some((winner, _)) => winner.voice_id.to_string(),
            None => DEFAULT_VOICE.to_string(),
        }
    }
}

/// What voice resolution needs to know about a character.
#[derive(Debug, Clone)]
pub struct VoiceTraits {
    pub voice_id: Option<String>,
    pub gender: String,
}

/// Resolves the voice for one segment: the speaker's assigned voice, else its
/// gender default, else the narrator's (by the same two rules), else the hard
/// default. Pure; no I/O.
pub fn resolve_segment_voice(
    speaker: Speaker,
    characters: &HashMap<Id, VoiceTraits>,
    narrator_id: Option<Id>,
) -> String {
    let effective = match speaker {
        Speaker::Character(id) => Some(id),
        Speaker::Narrator => narrator_id,
    };

    if let Some(id) = effective {
        if let Some(traits) = characters.get(&id) {
            if let Some(voice_id) = &traits.voice_id {
                return voice_id.clone();
            }
            match traits.gender.to_lowercase().as_str() {
                "female" => return DEFAULT_FEMALE_VOICE.to_string(),
                "male" => return DEFAULT_MALE_VOICE.to_string(),
                _ => {}
            }
        }
    }

    DEFAULT_VOICE.to_string()
}
