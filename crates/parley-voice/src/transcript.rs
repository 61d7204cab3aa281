//! Text helpers for comparing streaming ASR transcripts.
//!
//! Lengths and edit distances are counted in characters, never bytes, so CJK
//! and Latin transcripts are treated alike.

/// Two normalized transcripts above this similarity are the same utterance.
pub const SIMILARITY_THRESHOLD: f64 = 0.85;

const SENTENCE_TERMINATORS: &[char] = &['。', '！', '？', '.', '!', '?'];

pub fn is_terminator(c: char) -> bool {
    SENTENCE_TERMINATORS.contains(&c)
}

/// Keep only letters, digits and CJK ideographs, then collapse runs of the
/// same character.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = None;
    for c in text.trim().chars().filter(|c| c.is_alphanumeric()) {
        if last != Some(c) {
            out.push(c);
            last = Some(c);
        }
    }
    out
}

/// Character-level edit distance.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j]
            } else {
                1 + prev[j].min(prev[j + 1]).min(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// `1 - levenshtein(a, b) / max(len a, len b)`, in `[0, 1]`.
///
/// Two empty strings are identical; one empty string is dissimilar to
/// anything else.
pub fn similarity(a: &str, b: &str) -> f64 {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return 1.0,
        (true, false) | (false, true) => return 0.0,
        _ => {}
    }
    if a == b {
        return 1.0;
    }
    let max_len = a.chars().count().max(b.chars().count());
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// Similarity of the normalized forms.
pub fn normalized_similarity(a: &str, b: &str) -> f64 {
    similarity(&normalize(a), &normalize(b))
}

/// Whether the trimmed text ends with a sentence terminator.
pub fn is_complete_sentence(text: &str) -> bool {
    text.trim().chars().last().is_some_and(is_terminator)
}

/// The last terminated sentence of `text`, trimmed.
///
/// Text after the final terminator is an unfinished fragment and is ignored.
/// Without any terminator the whole trimmed text is returned.
pub fn extract_last_sentence(text: &str) -> &str {
    split_last_sentence(text).1
}

/// Split `text` into the part before its last sentence and the last sentence.
pub fn split_last_sentence(text: &str) -> (&str, &str) {
    let text = text.trim();
    let Some((end_idx, end_char)) = text.char_indices().rev().find(|(_, c)| is_terminator(*c)) else {
        return ("", text);
    };
    let end = end_idx + end_char.len_utf8();

    let start = text[..end_idx]
        .char_indices()
        .rev()
        .find(|(_, c)| is_terminator(*c))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);

    (text[..start].trim(), text[start..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  你好，今天！！ "), "你好今天");
        assert_eq!(normalize("Hello,  world 42"), "Heloworld42");
        assert_eq!(normalize("好好好的"), "好的");
        assert_eq!(normalize("。，！"), "");
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("x", ""), 0.0);
        assert_eq!(similarity("", "x"), 0.0);
        assert_eq!(similarity("天气", "天气"), 1.0);
        assert_eq!(similarity("abc", "abd"), similarity("abd", "abc"));

        for (a, b) in [("kitten", "sitting"), ("你好", "再见了朋友"), ("a", "bcdefg")] {
            let s = similarity(a, b);
            assert!((0.0..=1.0).contains(&s), "{a} vs {b}: {s}");
        }
    }

    #[test]
    fn test_levenshtein_counts_chars() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("今天天气", "明天天气"), 1);
        assert_eq!(levenshtein("", "你好"), 2);
    }

    #[test]
    fn test_complete_sentence() {
        assert!(is_complete_sentence("你好，今天天气怎么样？ "));
        assert!(is_complete_sentence("Is it raining?"));
        assert!(!is_complete_sentence("你好，"));
        assert!(!is_complete_sentence("好的。然后"));
        assert!(!is_complete_sentence(""));
    }

    #[test]
    fn test_extract_last_sentence() {
        assert_eq!(extract_last_sentence("你好。今天天气怎么样？"), "今天天气怎么样？");
        assert_eq!(extract_last_sentence("Hi there. How are you? I"), "How are you?");
        assert_eq!(extract_last_sentence("单独一句。"), "单独一句。");
        assert_eq!(extract_last_sentence("no terminator"), "no terminator");
        assert_eq!(split_last_sentence("一。二。三。"), ("一。二。", "三。"));
    }
}
