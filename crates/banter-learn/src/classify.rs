//! Rule-based message value classifier.
//!
//! Labels are advisory: the orchestrator dispatches addressed messages
//! through the reply path regardless of the label assigned here.

use banter_core::types::{InboundMessage, ValueLabel};

/// Value label plus how sure the rules are about it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub label: ValueLabel,
    pub confidence: f64,
}

/// Greetings and acknowledgements that mark a message as low-value.
/// The deployment chats are bilingual, so both English and Ukrainian
/// entries are needed.
const LOW_VALUE_LEXICON: &[&str] = &[
    "hi", "hello", "hey", "yo", "ok", "okay", "thanks", "thank you", "thx", "lol", "lmao",
    "nice", "cool", "good morning", "good night", "gm", "gn", "+1", "same", "this",
    "привіт", "прівєт", "здоров", "дякую", "дяки", "спс", "ок", "окей", "ага", "так",
    "норм", "добре", "круто", "жиза", "базовано",
];

/// Question words that mark an interrogative even without a question mark.
const QUESTION_WORDS: &[&str] = &[
    "what", "why", "how", "when", "where", "who", "which", "can", "could", "should",
    "що", "чому", "чого", "як", "коли", "де", "хто", "який", "яка", "яке", "чи",
];

/// Short function words excluded when counting content tokens.
const STOPWORDS: &[&str] = &[
    "the", "and", "that", "this", "with", "have", "from", "just", "like", "для", "але",
    "щоб", "того", "вона", "його",
];

/// Classify an inbound message.
pub fn classify(msg: &InboundMessage) -> Classification {
    classify_text(&msg.text, msg.addressed, msg.has_user_media)
}

/// Classify from the raw parts — also used when re-labelling stored
/// messages whose envelope is gone.
pub fn classify_text(text: &str, addressed: bool, has_user_media: bool) -> Classification {
    let trimmed = text.trim();

    // No real text: empty, stickers, pure-emoji reactions ("👍", "❤️"),
    // bare punctuation. Only user-authored media rescues such a message
    // from noise.
    if !trimmed.chars().any(char::is_alphanumeric) {
        return if has_user_media {
            Classification {
                label: ValueLabel::Low,
                confidence: 0.6,
            }
        } else {
            Classification {
                label: ValueLabel::Noise,
                confidence: 0.95,
            }
        };
    }

    // Addressed messages are always worth the reply path.
    if addressed {
        return Classification {
            label: ValueLabel::High,
            confidence: 0.95,
        };
    }

    let lower = trimmed.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();

    if LOW_VALUE_LEXICON.contains(&lower.as_str()) {
        return Classification {
            label: ValueLabel::Low,
            confidence: 0.9,
        };
    }
    if words.len() <= 2 && !is_interrogative(&lower, &words) {
        return Classification {
            label: ValueLabel::Low,
            confidence: 0.8,
        };
    }
    if repeated_token_ratio(&words) > 0.6 {
        return Classification {
            label: ValueLabel::Low,
            confidence: 0.7,
        };
    }

    if is_interrogative(&lower, &words) {
        return Classification {
            label: ValueLabel::High,
            confidence: 0.8,
        };
    }
    if words.len() >= 10 && content_token_count(&words) >= 3 {
        return Classification {
            label: ValueLabel::High,
            confidence: 0.7,
        };
    }

    Classification {
        label: ValueLabel::Medium,
        confidence: 0.6,
    }
}

fn is_interrogative(lower: &str, words: &[&str]) -> bool {
    lower.contains('?')
        || words
            .first()
            .is_some_and(|w| QUESTION_WORDS.contains(&trim_punct(w)))
}

/// Fraction of tokens that repeat an earlier token.
fn repeated_token_ratio(words: &[&str]) -> f64 {
    if words.is_empty() {
        return 0.0;
    }
    let mut seen = std::collections::HashSet::new();
    let mut repeats = 0usize;
    for w in words {
        if !seen.insert(*w) {
            repeats += 1;
        }
    }
    repeats as f64 / words.len() as f64
}

/// Distinct tokens longer than three characters that are not stopwords.
fn content_token_count(words: &[&str]) -> usize {
    let mut distinct = std::collections::HashSet::new();
    for w in words {
        let w = trim_punct(w);
        if w.chars().count() > 3 && !STOPWORDS.contains(&w) {
            distinct.insert(w);
        }
    }
    distinct.len()
}

fn trim_punct(w: &str) -> &str {
    w.trim_matches(|c: char| !c.is_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(text: &str) -> ValueLabel {
        classify_text(text, false, false).label
    }

    #[test]
    fn empty_without_media_is_noise() {
        assert_eq!(label(""), ValueLabel::Noise);
        assert_eq!(label("   "), ValueLabel::Noise);
    }

    #[test]
    fn pure_emoji_is_noise() {
        assert_eq!(label("👍"), ValueLabel::Noise);
        assert_eq!(label("❤️❤️❤️"), ValueLabel::Noise);
        assert_eq!(label("🔥 🔥"), ValueLabel::Noise);
        assert_eq!(label("!!!"), ValueLabel::Noise);
        // A single alphanumeric token is still a real (low-value) message.
        assert_eq!(label("Київ ❤️"), ValueLabel::Low);
    }

    #[test]
    fn empty_with_user_media_is_not_noise() {
        let c = classify_text("", false, true);
        assert_eq!(c.label, ValueLabel::Low);
    }

    #[test]
    fn addressed_is_always_high() {
        let c = classify_text("ok", true, false);
        assert_eq!(c.label, ValueLabel::High);
        assert!(c.confidence >= 0.9);
    }

    #[test]
    fn greetings_are_low() {
        assert_eq!(label("hello"), ValueLabel::Low);
        assert_eq!(label("привіт"), ValueLabel::Low);
        assert_eq!(label("дякую"), ValueLabel::Low);
    }

    #[test]
    fn two_words_are_low() {
        assert_eq!(label("sounds good"), ValueLabel::Low);
    }

    #[test]
    fn questions_are_high() {
        assert_eq!(label("when is the release planned?"), ValueLabel::High);
        assert_eq!(label("чому сервер впав"), ValueLabel::High);
        assert_eq!(label("how does the windowing work"), ValueLabel::High);
    }

    #[test]
    fn long_informative_message_is_high() {
        assert_eq!(
            label("yesterday we migrated the billing database to the new cluster and latency dropped"),
            ValueLabel::High
        );
    }

    #[test]
    fn repeated_spam_is_low() {
        assert_eq!(label("go go go go go team"), ValueLabel::Low);
    }

    #[test]
    fn ordinary_chatter_is_medium() {
        assert_eq!(label("I might join the call later today"), ValueLabel::Medium);
    }
}
