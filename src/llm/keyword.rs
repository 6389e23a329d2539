//! Local keyword extraction.
//!
//! Deterministic fallback used whenever the LLM cannot supply a usable
//! keyword: the model is unreachable, echoes the whole question back, or
//! returns something longer than the keyword column allows. Works on the
//! education-domain vocabulary the chat traffic is about.

/// Domain terms checked first, in priority order.
const LEXICON: &[&str] = &[
    "수강신청",
    "학교폭력",
    "검정고시",
    "임용고시",
    "장학금",
    "증명서",
    "등록금",
    "기숙사",
    "전학",
    "편입",
    "입학",
    "졸업",
    "휴학",
    "복학",
    "성적",
    "평가",
    "시험",
    "교권",
    "수업",
    "강의",
    "과제",
];

/// Particles and fillers that make poor standalone keywords.
const STOP_TOKENS: &[&str] = &[
    "을", "를", "은", "는", "이", "가", "의", "에", "에서", "로", "와", "과", "도", "만", "하는",
    "있는", "없는", "어떻게", "언제", "어디",
];

/// Maximum length of an extracted keyword, in characters. Leaves room for
/// the insert guard to append an ellipsis without breaching the column.
const MAX_KEYWORD_CHARS: usize = 95;

/// Longest keyword taken from a free token before it is cut down.
const MAX_TOKEN_CHARS: usize = 20;

/// Derive a short keyword from an utterance.
///
/// Tries, in order: a lexicon term contained in the text, the first
/// non-particle whitespace token of at least two characters, and finally the
/// leading characters of the utterance itself.
pub fn extract_keyword(text: &str) -> String {
    for term in LEXICON {
        if text.contains(term) {
            return (*term).to_string();
        }
    }

    if let Some(token) = text
        .split_whitespace()
        .find(|token| token.chars().count() >= 2 && !STOP_TOKENS.contains(token))
    {
        return truncate_chars(token, MAX_TOKEN_CHARS);
    }

    let prefix = truncate_chars(text.trim(), MAX_KEYWORD_CHARS);
    if prefix.is_empty() {
        // Blank utterances still need a non-empty keyword for the record.
        "기타".to_string()
    } else {
        prefix
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
