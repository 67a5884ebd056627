//! Answer-letter extraction from free-text model output

use fancy_regex::Regex;
use std::fmt::Display;
use std::sync::LazyLock;

/// Matches the positional answer marker (`答案` or `Answer`).
static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:答案|answer)").unwrap());

/// Matches an isolated choice letter: an A-E not glued to other ASCII
/// alphanumerics, so the `e` in `the` never counts but `是B` does.
static LETTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?<![A-Za-z0-9])[A-Ea-e](?![A-Za-z0-9])").unwrap());

/// The outcome of answer extraction. Extraction never fails; unparseable
/// output degrades to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractedAnswer {
    Letter(char),
    Unknown,
}

impl ExtractedAnswer {
    pub fn matches(&self, answer: char) -> bool {
        matches!(self, ExtractedAnswer::Letter(letter) if *letter == answer.to_ascii_uppercase())
    }
}

impl Display for ExtractedAnswer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractedAnswer::Letter(letter) => write!(f, "{}", letter),
            ExtractedAnswer::Unknown => write!(f, "unknown"),
        }
    }
}

/// Extracts the predicted choice letter from raw model output.
///
/// The letter following the last `答案`/`Answer` marker wins; with no usable
/// marker the earliest isolated recognized letter anywhere in the text wins;
/// with no candidate at all the result is [`ExtractedAnswer::Unknown`].
pub fn extract_answer(text: &str, choices: &[char]) -> ExtractedAnswer {
    let marker_end = MARKER_RE
        .find_iter(text)
        .filter_map(|m| m.ok())
        .last()
        .map(|m| m.end());

    if let Some(end) = marker_end {
        if let Some(letter) = first_recognized_letter(&text[end..], choices) {
            return ExtractedAnswer::Letter(letter);
        }
    }
    match first_recognized_letter(text, choices) {
        Some(letter) => ExtractedAnswer::Letter(letter),
        None => ExtractedAnswer::Unknown,
    }
}

fn first_recognized_letter(text: &str, choices: &[char]) -> Option<char> {
    LETTER_RE
        .find_iter(text)
        .filter_map(|m| m.ok())
        .filter_map(|m| m.as_str().chars().next())
        .map(|c| c.to_ascii_uppercase())
        .find(|c| choices.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[fixture]
    fn choices() -> Vec<char> {
        vec!['A', 'B', 'C', 'D']
    }

    #[rstest]
    #[case("答案：C。\n解释：胸片显示...", 'C')]
    #[case("经过分析，答案是B", 'B')]
    #[case("Answer: D", 'D')]
    #[case("answer is (a)", 'A')]
    fn test_marker_letter_is_preferred(
        choices: Vec<char>,
        #[case] text: &str,
        #[case] expected: char,
    ) {
        assert_eq!(extract_answer(text, &choices), ExtractedAnswer::Letter(expected));
    }

    #[rstest]
    fn test_last_marker_wins(choices: Vec<char>) {
        let text = "答案：A 是错误的。重新考虑后，答案：C";
        assert_eq!(extract_answer(text, &choices), ExtractedAnswer::Letter('C'));
    }

    #[rstest]
    fn test_fallback_to_first_isolated_letter(choices: Vec<char>) {
        assert_eq!(
            extract_answer("我认为B最合适，而不是D", &choices),
            ExtractedAnswer::Letter('B')
        );
    }

    #[rstest]
    fn test_letters_inside_words_do_not_count(choices: Vec<char>) {
        // `answer` matches as a marker but `unclear` contains no isolated letter
        assert_eq!(
            extract_answer("the answer is unclear", &choices),
            ExtractedAnswer::Unknown
        );
    }

    #[rstest]
    fn test_unrecognized_letter_is_filtered(choices: Vec<char>) {
        // E is isolated but not in a four-choice set
        assert_eq!(
            extract_answer("答案：E", &choices),
            ExtractedAnswer::Unknown
        );
        assert_eq!(
            extract_answer("答案：E", &['A', 'B', 'C', 'D', 'E']),
            ExtractedAnswer::Letter('E')
        );
    }

    #[rstest]
    fn test_no_letter_returns_unknown(choices: Vec<char>) {
        assert_eq!(extract_answer("完全不知道。", &choices), ExtractedAnswer::Unknown);
        assert_eq!(extract_answer("", &choices), ExtractedAnswer::Unknown);
    }

    #[rstest]
    fn test_lowercase_is_normalized(choices: Vec<char>) {
        assert_eq!(
            extract_answer("答案：c", &choices),
            ExtractedAnswer::Letter('C')
        );
    }

    #[rstest]
    fn test_display() {
        assert_eq!(ExtractedAnswer::Letter('A').to_string(), "A");
        assert_eq!(ExtractedAnswer::Unknown.to_string(), "unknown");
    }

    #[rstest]
    fn test_matches_is_case_insensitive_on_ground_truth() {
        assert!(ExtractedAnswer::Letter('B').matches('b'));
        assert!(!ExtractedAnswer::Unknown.matches('b'));
    }
}
