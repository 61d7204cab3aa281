//! Filler-word blacklist
//!
//! Transcripts that are nothing but a filler sound ("嗯", "啊", ...) are
//! shown to the user but never sent to the LLM. Matching is exact after
//! trimming whitespace and punctuation.

use crate::error::VoiceResult;
use dashmap::DashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

const TRIM_CHARS: &[char] = &[
    '。', '，', '、', '；', '：', '？', '！', '"', '“', '”', '\'', '‘', '’', '（', '）', '【', '】',
    '《', '》', ',', '.', '!', '?', ';', ':',
];

const DEFAULT_WORDS: &[&str] = &[
    "嗯", "嗯嗯", "啊", "啊啊", "呃", "呃呃", "额", "额额", "哦", "哦哦", "噢", "呀", "哈", "哈哈",
    "嘿", "喂", "哼", "唉", "哎", "诶", "欸",
];

fn clean(text: &str) -> &str {
    text.trim().trim_matches(TRIM_CHARS).trim()
}

/// Blacklist of filler transcripts with per-word hit counts
pub struct FilterWords {
    words: RwLock<HashSet<String>>,
    counts: DashMap<String, u64>,
    dictionary: Option<PathBuf>,
}

impl Default for FilterWords {
    fn default() -> Self {
        Self::with_words(DEFAULT_WORDS.iter().copied())
    }
}

impl FilterWords {
    pub fn with_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let filter = Self {
            words: RwLock::new(HashSet::new()),
            counts: DashMap::new(),
            dictionary: None,
        };
        filter.replace_words(words);
        filter
    }

    /// Load the blacklist from a dictionary file, one word per line, `#` comments.
    ///
    /// A missing file falls back to the built-in filler words.
    pub fn from_file(path: impl Into<PathBuf>) -> VoiceResult<Self> {
        let mut filter = Self::default();
        filter.dictionary = Some(path.into());
        filter.reload()?;
        Ok(filter)
    }

    /// Re-read the dictionary file, if one was configured.
    pub fn reload(&self) -> VoiceResult<()> {
        let Some(path) = &self.dictionary else {
            return Ok(());
        };

        if !path.exists() {
            warn!(path = %path.display(), "Filter dictionary not found, using built-in words");
            self.replace_words(DEFAULT_WORDS.iter().copied());
            return Ok(());
        }

        let words = read_dictionary(path)?;
        info!(path = %path.display(), count = words.len(), "📖 Filter dictionary loaded");
        self.replace_words(words);
        Ok(())
    }

    fn replace_words<I, S>(&self, words: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = HashSet::new();
        for word in words {
            let word = clean(word.as_ref());
            if word.is_empty() {
                continue;
            }
            set.insert(word.to_string());
            set.insert(word.to_lowercase());
        }
        *self.words.write().unwrap_or_else(|p| p.into_inner()) = set;
    }

    /// Whether `text` consists only of a blacklisted word. Empty text is filtered.
    pub fn is_filtered(&self, text: &str) -> bool {
        let cleaned = clean(text);
        if cleaned.is_empty() {
            return true;
        }
        let words = self.words.read().unwrap_or_else(|p| p.into_inner());
        words.contains(cleaned) || words.contains(&cleaned.to_lowercase())
    }

    pub fn record_filtered(&self, text: &str) {
        let cleaned = clean(text);
        if cleaned.is_empty() {
            return;
        }
        let mut count = self.counts.entry(cleaned.to_string()).or_insert(0);
        *count += 1;
        debug!(word = cleaned, count = *count, "Filtered transcript recorded");
    }

    pub fn filtered_count(&self, text: &str) -> u64 {
        self.counts.get(clean(text)).map(|c| *c).unwrap_or(0)
    }

    pub fn all_counts(&self) -> Vec<(String, u64)> {
        let mut counts: Vec<_> = self
            .counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        counts.sort();
        counts
    }
}

fn read_dictionary(path: &Path) -> VoiceResult<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
