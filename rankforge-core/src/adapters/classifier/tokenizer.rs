//! Closed-vocabulary tokenizer for the sequence classifier.
//!
//! Vocabulary layout: five special tokens, then a character alphabet, then a
//! list of frequent words. Known words map to a single id; unknown words are
//! spelled out character by character, and unknown characters map to
//! [`UNK_TOKEN_ID`].

use crate::data::PAD_TOKEN_ID;
use std::collections::HashMap;

pub const UNK_TOKEN_ID: u32 = 1;
/// Begin-of-sequence marker, always the first id of an encoding.
pub const CLS_TOKEN_ID: u32 = 2;
/// End-of-sequence marker, placed before any padding.
pub const SEP_TOKEN_ID: u32 = 3;
pub const MASK_TOKEN_ID: u32 = 4;

const SPECIAL_TOKENS: [&str; 5] = ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]"];

const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz0123456789.,!?;:'\"-()&%$#@/";

const FREQUENT_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "of", "to", "in", "on", "for", "with", "at", "by",
    "from", "as", "is", "are", "was", "were", "be", "been", "has", "have", "had", "it", "its",
    "this", "that", "these", "those", "new", "first", "last", "more", "most", "after", "before",
    "over", "into", "about", "up", "down", "not", "will", "can", "could", "would", "said",
    "says", "year", "years", "today", "week", "people", "world", "country", "government",
    // technology
    "technology", "software", "computer", "data", "internet", "app", "device", "phone", "ai",
    "digital", "chip", "cloud", "code", "network", "online", "startup", "security", "robot",
    // science
    "science", "research", "study", "scientists", "space", "energy", "climate", "species",
    "physics", "discovery", "experiment", "planet", "researchers", "university", "nasa",
    // business
    "business", "market", "company", "stock", "shares", "profit", "revenue", "economy",
    "investors", "bank", "sales", "price", "prices", "trade", "deal", "billion", "million",
    // health
    "health", "patients", "hospital", "doctors", "disease", "vaccine", "medical", "treatment",
    "drug", "cancer", "care", "virus", "diet", "mental", "covid",
    // sports
    "sports", "game", "team", "season", "win", "won", "match", "player", "players", "league",
    "coach", "cup", "championship", "score", "football", "olympic",
    // entertainment
    "entertainment", "film", "movie", "music", "star", "show", "album", "actor", "series",
    "festival", "tv", "award", "song", "concert", "celebrity", "netflix",
];

/// Character and word-level tokenizer over a closed vocabulary.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab: HashMap<String, u32>,
    tokens: Vec<String>,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer {
    pub fn new() -> Self {
        let mut tokenizer = Self {
            vocab: HashMap::new(),
            tokens: Vec::new(),
        };
        for token in SPECIAL_TOKENS {
            tokenizer.insert(token);
        }
        for c in ALPHABET.chars() {
            tokenizer.insert(&c.to_string());
        }
        for word in FREQUENT_WORDS {
            tokenizer.insert(word);
        }
        tokenizer
    }

    fn insert(&mut self, token: &str) {
        if !self.vocab.contains_key(token) {
            self.vocab.insert(token.to_string(), self.tokens.len() as u32);
            self.tokens.push(token.to_string());
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.tokens.len()
    }

    pub fn id(&self, token: &str) -> Option<u32> {
        self.vocab.get(token).copied()
    }

    /// Tokenize without special tokens.
    pub fn tokenize(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        for word in text.split_whitespace() {
            let word = word.to_lowercase();
            let rest = word.trim_start_matches(|c: char| !c.is_alphanumeric());
            let prefix = &word[..word.len() - rest.len()];
            let core = rest.trim_end_matches(|c: char| !c.is_alphanumeric());
            let suffix = &rest[core.len()..];
            match self.vocab.get(core) {
                Some(&id) if !core.is_empty() => {
                    ids.extend(prefix.chars().map(|c| self.char_id(c)));
                    ids.push(id);
                    ids.extend(suffix.chars().map(|c| self.char_id(c)));
                }
                _ => ids.extend(word.chars().map(|c| self.char_id(c))),
            }
        }
        ids
    }

    fn char_id(&self, c: char) -> u32 {
        let mut buf = [0u8; 4];
        self.vocab.get(&*c.encode_utf8(&mut buf)).copied().unwrap_or(UNK_TOKEN_ID)
    }

    /// `[CLS] tokens… [SEP] [PAD]…`, exactly `max_length` ids.
    ///
    /// Over-length input is truncated so the end marker always fits. A
    /// `max_length` below 2 cannot hold both markers and keeps a prefix of them.
    pub fn encode(&self, text: &str, max_length: usize) -> Vec<u32> {
        let mut ids = Vec::with_capacity(max_length.max(2));
        ids.push(CLS_TOKEN_ID);
        let body = self.tokenize(text);
        ids.extend(body.into_iter().take(max_length.saturating_sub(2)));
        ids.push(SEP_TOKEN_ID);
        ids.resize(max_length.max(ids.len()), PAD_TOKEN_ID);
        ids.truncate(max_length);
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vocabulary_layout() {
        let t = Tokenizer::new();
        assert_eq!(t.id("[PAD]"), Some(PAD_TOKEN_ID));
        assert_eq!(t.id("[CLS]"), Some(CLS_TOKEN_ID));
        assert_eq!(t.id("[MASK]"), Some(MASK_TOKEN_ID));
        assert_eq!(t.id("a"), Some(5));
        assert!(t.id("football").unwrap() > t.id("z").unwrap());
        assert_eq!(t.vocab_size(), t.tokens.len());
    }

    #[test]
    fn test_known_words_and_fallbacks() {
        let t = Tokenizer::new();
        assert_eq!(t.tokenize("The market"), vec![t.id("the").unwrap(), t.id("market").unwrap()]);
        let zebra = t.tokenize("zebra");
        assert_eq!(zebra.len(), 5);
        assert_eq!(zebra[0], t.id("z").unwrap());
        assert_eq!(t.tokenize("é"), vec![UNK_TOKEN_ID]);
        assert_eq!(
            t.tokenize("(market)"),
            vec![t.id("(").unwrap(), t.id("market").unwrap(), t.id(")").unwrap()]
        );
    }

    #[test]
    fn test_encode_shape() {
        let t = Tokenizer::new();
        let ids = t.encode("stock market deal", 8);
        assert_eq!(ids.len(), 8);
        assert_eq!(ids[0], CLS_TOKEN_ID);
        assert_eq!(ids[4], SEP_TOKEN_ID);
        assert!(ids[5..].iter().all(|&id| id == PAD_TOKEN_ID));
    }

    #[test]
    fn test_encode_truncates_before_end_marker() {
        let t = Tokenizer::new();
        let ids = t.encode("an extremely long sentence spelled out by characters", 6);
        assert_eq!(ids.len(), 6);
        assert_eq!(ids[0], CLS_TOKEN_ID);
        assert_eq!(ids[5], SEP_TOKEN_ID);
        assert_eq!(t.encode("", 2), vec![CLS_TOKEN_ID, SEP_TOKEN_ID]);
    }
}
