//! Heuristic model selection when the caller didn't pin one.

/// Sentinel meaning "let the pipeline choose".
pub const DEFAULT_MODEL_SENTINEL: &str = "default";

const PROGRAMMING_KEYWORDS: &[&str] = &[
    "fn ", "function", "class ", "def ", "import ", "const ", "let ", "var ",
    "println", "console.log", "```", "SELECT ", "impl ", "struct ", "async ",
];

/// Ratio of Hangul syllable/jamo codepoints among all non-whitespace
/// characters in `text`.
fn korean_ratio(text: &str) -> f64 {
    let mut total = 0usize;
    let mut korean = 0usize;
    for ch in text.chars().filter(|c| !c.is_whitespace()) {
        total += 1;
        let code = ch as u32;
        let is_hangul = (0xAC00..=0xD7A3).contains(&code)
            || (0x1100..=0x11FF).contains(&code)
            || (0x3130..=0x318F).contains(&code);
        if is_hangul {
            korean += 1;
        }
    }
    if total == 0 { 0.0 } else { korean as f64 / total as f64 }
}

fn looks_like_code(text: &str) -> bool {
    PROGRAMMING_KEYWORDS.iter().any(|kw| text.contains(kw))
}

/// The three model identifiers the heuristic can pick between. The gateway
/// itself never interprets these beyond substring matching during node
/// selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedModel {
    /// A general multilingual model, preferred for Korean-heavy input.
    Multilingual,
    /// A coding-oriented model, preferred when the message looks like code.
    Coding,
    /// General-purpose default for everything else.
    General,
}

impl SelectedModel {
    pub fn identifier(self) -> &'static str {
        match self {
            SelectedModel::Multilingual => "multilingual-chat",
            SelectedModel::Coding => "coding-assistant",
            SelectedModel::General => "general-chat",
        }
    }
}

/// Resolve a model identifier for `message` when the caller left the model
/// unset or passed the `"default"` sentinel.
pub fn select_model(message: &str) -> &'static str {
    if looks_like_code(message) {
        return SelectedModel::Coding.identifier();
    }
    if korean_ratio(message) > 0.3 {
        return SelectedModel::Multilingual.identifier();
    }
    SelectedModel::General.identifier()
}

/// True when `model` should trigger the heuristic instead of being used
/// verbatim.
pub fn needs_selection(model: Option<&str>) -> bool {
    matches!(model, None | Some(DEFAULT_MODEL_SENTINEL))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_selection_is_true_for_absent_or_sentinel() {
        assert!(needs_selection(None));
        assert!(needs_selection(Some("default")));
        assert!(!needs_selection(Some("llama-70b")));
    }

    #[test]
    fn korean_heavy_message_selects_multilingual() {
        assert_eq!(select_model("안녕하세요 오늘 날씨가 어떤가요"), "multilingual-chat");
    }

    #[test]
    fn code_like_message_selects_coding() {
        assert_eq!(select_model("fn main() { println!(\"hi\"); }"), "coding-assistant");
    }

    #[test]
    fn plain_english_selects_general() {
        assert_eq!(select_model("What's the weather like today?"), "general-chat");
    }

    #[test]
    fn code_keyword_takes_precedence_over_korean_ratio() {
        // Mixed Korean comment plus Rust code: code heuristic wins.
        assert_eq!(select_model("이것은 코드입니다 fn main() {}"), "coding-assistant");
    }
}
