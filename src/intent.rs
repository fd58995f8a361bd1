//! Keyword intent classifier for end-of-conversation replies.
//!
//! Two layers, both driven by the versioned [`PhraseTable`]:
//!
//! 1. **User replies** — every completed user turn is scanned for negative,
//!    affirmative and stop-intent phrases ([`analyze`]).
//! 2. **Assistant questions** — assistant text is scanned for an "are you
//!    sure you want to end the conversation" style question
//!    ([`is_end_confirmation_question`]).
//!
//! Negative phrases always win over affirmative ones, so "no, don't end" can
//! never be read as consent.

/// Bumped whenever a phrase list changes meaning.
pub const PHRASE_TABLE_VERSION: u32 = 2;

/// How a phrase is matched against lowercased utterance text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Plain substring containment.
    Substring,
    /// Substring bounded by non-alphanumeric characters (or the text edges).
    Word,
}

/// One entry of a phrase list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phrase {
    pub text: &'static str,
    pub mode: MatchMode,
}

const fn sub(text: &'static str) -> Phrase {
    Phrase {
        text,
        mode: MatchMode::Substring,
    }
}

const fn word(text: &'static str) -> Phrase {
    Phrase {
        text,
        mode: MatchMode::Word,
    }
}

/// Phrase lists per intent tag.
#[derive(Debug, Clone, Copy)]
pub struct PhraseTable {
    pub version: u32,
    pub negative: &'static [Phrase],
    pub stop_intent: &'static [Phrase],
    /// Whole-reply tokens, compared against the normalized reply with spaces removed.
    pub affirmative_short: &'static [&'static str],
    pub affirmative_long: &'static [Phrase],
    pub ask_confirm: &'static [Phrase],
    pub end_synonyms: &'static [Phrase],
    pub session_nouns: &'static [Phrase],
}

/// Longest normalized reply that may match a short affirmative token.
const SHORT_AFFIRMATIVE_MAX_LEN: usize = 4;

/// Built-in phrase table (English plus a small multilingual "no" set).
pub static DEFAULT_PHRASES: PhraseTable = PhraseTable {
    version: PHRASE_TABLE_VERSION,
    negative: &[
        word("no"),
        word("nope"),
        word("nah"),
        sub("not yet"),
        sub("not now"),
        sub("not done"),
        sub("don't end"),
        sub("dont end"),
        sub("do not end"),
        sub("don't stop"),
        sub("dont stop"),
        sub("don't close"),
        sub("don't hang up"),
        sub("keep going"),
        sub("keep talking"),
        word("continue"),
        word("wait"),
        sub("hold on"),
        word("cancel"),
        sub("one more"),
        // negated consent
        word("not sure"),
        word("i'm not"),
        word("i am not"),
        word("not really"),
        sub("don't think so"),
        sub("dont think so"),
        sub("don't want to end"),
        sub("dont want to end"),
        sub("do not want to end"),
        word("absolutely not"),
        word("definitely not"),
        word("of course not"),
        // multilingual "no"
        word("non"),
        word("nein"),
        word("nahi"),
        word("nahin"),
        word("illai"),
        word("nee"),
        word("não"),
        word("nej"),
        word("niet"),
        word("нет"),
    ],
    stop_intent: &[
        word("stop"),
        word("end"),
        word("bye"),
        sub("goodbye"),
        sub("good bye"),
        sub("we are done"),
        sub("we're done"),
        sub("i'm done"),
        sub("i am done"),
        sub("that's all"),
        sub("that is all"),
        word("finish"),
        sub("hang up"),
        sub("wrap up"),
    ],
    affirmative_short: &["s", "y", "ok", "okay"],
    affirmative_long: &[
        word("yes"),
        word("yeah"),
        word("yep"),
        word("yup"),
        word("sure"),
        word("correct"),
        word("absolutely"),
        word("definitely"),
        word("confirm"),
        word("confirmed"),
        word("alright"),
        word("all right"),
        word("go ahead"),
        word("please do"),
        word("do it"),
        word("end it"),
        word("of course"),
        word("sounds good"),
        word("that's right"),
        word("i'm sure"),
        word("i am sure"),
        word("si"),
        word("sí"),
        word("oui"),
        word("ja"),
        word("haan"),
    ],
    ask_confirm: &[
        sub("are you sure"),
        sub("do you want to"),
        sub("would you like to"),
        sub("shall i"),
        sub("should i"),
        sub("ready to"),
        sub("confirm"),
    ],
    end_synonyms: &[
        word("end"),
        word("finish"),
        word("close"),
        word("wrap up"),
    ],
    session_nouns: &[
        word("conversation"),
        word("session"),
        word("call"),
        word("chat"),
    ],
};

/// All intent flags detected in one utterance.
///
/// A single reply can carry several ("yes, bye"); negative always suppresses
/// affirmative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntentReport {
    pub negative: bool,
    pub affirmative: bool,
    pub stop_intent: bool,
}

/// Lowercase, replace every non-letter run with a single space, trim.
#[must_use]
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphabetic() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn boundary_ok(s: &str, start: usize, end: usize) -> bool {
    let before = s[..start].chars().next_back();
    let after = s[end..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}

/// Byte offsets where `phrase` matches in `lower`.
fn phrase_matches<'a>(lower: &'a str, phrase: &'a Phrase) -> impl Iterator<Item = usize> + 'a {
    lower
        .match_indices(phrase.text)
        .map(|(pos, _)| pos)
        .filter(move |&pos| {
            !phrase.text.is_empty()
                && match phrase.mode {
                    MatchMode::Substring => true,
                    MatchMode::Word => boundary_ok(lower, pos, pos + phrase.text.len()),
                }
        })
}

fn matches_phrase(lower: &str, phrase: &Phrase) -> bool {
    phrase_matches(lower, phrase).next().is_some()
}

/// Words that turn a following affirmative into a refusal.
const NEGATORS: &[&str] = &["not", "never", "dont", "cant", "wont", "isnt", "didnt"];

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '\'' || c == '\u{2019}'
}

/// Whether the match at `start..end` is preceded by a negator ("not sure",
/// "don't confirm") or followed by "not" ("absolutely not").
fn negated(lower: &str, start: usize, end: usize) -> bool {
    let before = lower[..start]
        .split(|c: char| !is_word_char(c))
        .rfind(|w| !w.is_empty());
    let after = lower[end..]
        .split(|c: char| !is_word_char(c))
        .find(|w| !w.is_empty());
    before.is_some_and(|w| {
        NEGATORS.contains(&w) || w.ends_with("n't") || w.ends_with("n\u{2019}t")
    }) || after == Some("not")
}

fn any_phrase(lower: &str, phrases: &[Phrase]) -> bool {
    phrases.iter().any(|p| matches_phrase(lower, p))
}

impl PhraseTable {
    #[must_use]
    pub fn is_negative(&self, text: &str) -> bool {
        any_phrase(&text.to_lowercase(), self.negative)
    }

    #[must_use]
    pub fn is_affirmative(&self, text: &str) -> bool {
        if self.is_negative(text) {
            return false;
        }
        let compact: String = normalize(text).split_whitespace().collect();
        if compact.chars().count() <= SHORT_AFFIRMATIVE_MAX_LEN
            && self.affirmative_short.contains(&compact.as_str())
        {
            return true;
        }
        let lower = text.to_lowercase();
        self.affirmative_long.iter().any(|phrase| {
            phrase_matches(&lower, phrase).any(|pos| !negated(&lower, pos, pos + phrase.text.len()))
        })
    }

    #[must_use]
    pub fn is_stop_intent(&self, text: &str) -> bool {
        any_phrase(&text.to_lowercase(), self.stop_intent)
    }

    #[must_use]
    pub fn analyze(&self, text: &str) -> IntentReport {
        IntentReport {
            negative: self.is_negative(text),
            affirmative: self.is_affirmative(text),
            stop_intent: self.is_stop_intent(text),
        }
    }

    /// Whether assistant text asks the user to confirm ending the conversation.
    ///
    /// Requires a confirmation phrase, an end synonym and a session noun together.
    #[must_use]
    pub fn is_end_confirmation_question(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        any_phrase(&lower, self.ask_confirm)
            && any_phrase(&lower, self.end_synonyms)
            && any_phrase(&lower, self.session_nouns)
    }
}

/// [`PhraseTable::is_negative`] on the default table.
#[must_use]
pub fn is_negative(text: &str) -> bool {
    DEFAULT_PHRASES.is_negative(text)
}

/// [`PhraseTable::is_affirmative`] on the default table.
#[must_use]
pub fn is_affirmative(text: &str) -> bool {
    DEFAULT_PHRASES.is_affirmative(text)
}

/// [`PhraseTable::is_stop_intent`] on the default table.
#[must_use]
pub fn is_stop_intent(text: &str) -> bool {
    DEFAULT_PHRASES.is_stop_intent(text)
}

/// [`PhraseTable::analyze`] on the default table.
#[must_use]
pub fn analyze(text: &str) -> IntentReport {
    DEFAULT_PHRASES.analyze(text)
}

/// [`PhraseTable::is_end_confirmation_question`] on the default table.
#[must_use]
pub fn is_end_confirmation_question(text: &str) -> bool {
    DEFAULT_PHRASES.is_end_confirmation_question(text)
}
