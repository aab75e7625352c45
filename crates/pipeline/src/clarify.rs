//! Ambiguity detection and clarification prompts
//!
//! Screens each final user transcript before the language model sees it.
//! When the utterance is ambiguous (hedging keyword, too few words, or low
//! STT confidence), the turn short-circuits to a templated clarification
//! question over the direct-TTS path and the session stays on its current
//! topic instead of generating a reply to input it probably misheard.

use serde::Serialize;

/// Detector tuning
#[derive(Debug, Clone)]
pub struct ClarifyConfig {
    /// Screen user turns at all; off means every final goes to the LLM
    pub enabled: bool,
    /// Hedging phrases that flag the utterance as uncertain
    pub uncertainty_keywords: Vec<String>,
    /// Responses under this many words are treated as ambiguous
    pub short_word_threshold: usize,
    /// Transcripts under this STT confidence are treated as misheard
    pub min_confidence: f32,
}

impl Default for ClarifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            uncertainty_keywords: [
                "maybe",
                "probably",
                "not sure",
                "dunno",
                "i guess",
                "perhaps",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            short_word_threshold: 3,
            min_confidence: 0.7,
        }
    }
}

/// Why an utterance was flagged
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityReason {
    /// A hedging phrase matched
    UncertaintyKeyword(String),
    /// Fewer words than the threshold
    ShortResponse(usize),
    /// STT confidence under the floor
    LowConfidence(f32),
}

impl std::fmt::Display for AmbiguityReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AmbiguityReason::UncertaintyKeyword(word) => {
                write!(f, "uncertainty_keyword: {}", word)
            },
            AmbiguityReason::ShortResponse(words) => write!(f, "short_response: {} words", words),
            AmbiguityReason::LowConfidence(confidence) => {
                write!(f, "low_stt_confidence: {:.2}", confidence)
            },
        }
    }
}

/// One flagged utterance
#[derive(Debug, Clone, PartialEq)]
pub struct Ambiguity {
    pub reason: AmbiguityReason,
    /// How confident the detector is that the utterance was understood
    pub score: f32,
}

/// Screens final transcripts for ambiguity
#[derive(Debug, Clone)]
pub struct AmbiguityDetector {
    config: ClarifyConfig,
}

impl AmbiguityDetector {
    pub fn new(config: ClarifyConfig) -> Self {
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Check one final transcript. Checks run in order: hedging keywords,
    /// word count, then STT confidence; the first hit wins.
    pub fn detect(&self, text: &str, confidence: Option<f32>) -> Option<Ambiguity> {
        if !self.config.enabled {
            return None;
        }
        let lower = text.to_lowercase();
        let lower = lower.trim();

        for keyword in &self.config.uncertainty_keywords {
            if lower.contains(keyword.as_str()) {
                return Some(Ambiguity {
                    reason: AmbiguityReason::UncertaintyKeyword(keyword.clone()),
                    score: 0.4,
                });
            }
        }

        let words = lower.split_whitespace().count();
        if words < self.config.short_word_threshold {
            return Some(Ambiguity {
                reason: AmbiguityReason::ShortResponse(words),
                score: 0.5,
            });
        }

        if let Some(confidence) = confidence {
            if confidence < self.config.min_confidence {
                return Some(Ambiguity {
                    reason: AmbiguityReason::LowConfidence(confidence),
                    score: confidence,
                });
            }
        }

        None
    }
}

/// How much of the heard text is echoed back in a clarification question
const HEARD_SNIPPET_CHARS: usize = 30;

/// Turns a flagged utterance into a spoken clarification question
#[derive(Debug, Clone, Default)]
pub struct Clarifier;

impl Clarifier {
    pub fn new() -> Self {
        Self
    }

    /// Template keyed off the detector's reason: hedging gets a rephrase
    /// request, short answers a repeat request, and low confidence echoes
    /// back what was heard.
    pub fn generate(&self, ambiguity: &Ambiguity, heard: &str) -> String {
        match &ambiguity.reason {
            AmbiguityReason::UncertaintyKeyword(_) => {
                "Sorry, I'm not sure I understood. Could you put that another way?".to_string()
            },
            AmbiguityReason::ShortResponse(_) => {
                "Could you repeat that? I didn't quite catch it.".to_string()
            },
            AmbiguityReason::LowConfidence(_) => {
                let snippet: String = heard.chars().take(HEARD_SNIPPET_CHARS).collect();
                format!("I only heard '{}'. Could you say that again?", snippet.trim())
            },
        }
    }
}
