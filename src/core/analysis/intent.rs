use regex::Regex;
use std::sync::LazyLock;

static STYLING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(colou?rs?|title|labels?|legend|rename|axis|axes|chart type|bar|line|pie|scatter|area|table|kpi)\b",
    )
    .expect("valid regex")
});

static ANALYTICAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(total|average|avg|count|sum|filter|compare|trend|top|by|per)\b")
        .expect("valid regex")
});

/// True for requests that only restyle a chart ("make it red", "switch to a
/// pie chart") and ask for no new numbers.
pub fn is_formatting_request(user_prompt: &str) -> bool {
    STYLING.is_match(user_prompt) && !ANALYTICAL.is_match(user_prompt)
}
