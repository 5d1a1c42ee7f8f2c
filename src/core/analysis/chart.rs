use regex::Regex;
use serde_json::{Value, json};
use std::sync::LazyLock;

use super::steps::ChartSpec;
use crate::core::dataset::Row;

static TEMPORAL_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(date|day|week|month|quarter|year|time|period)").expect("valid regex")
});

static SHARE_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(share|proportion|percent(age)?|breakdown|split|distribution)\b")
        .expect("valid regex")
});

static TREND_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(trend|over time|monthly|weekly|daily|yearly|growth)\b")
        .expect("valid regex")
});

const MAX_TITLE_CHARS: usize = 60;
const MAX_PIE_SLICES: usize = 8;

/// Pick a chart from the shape of the result rows.
pub fn infer_chart(user_prompt: &str, rows: &[Row], target_type: Option<&str>) -> ChartSpec {
    let title = title_from_prompt(user_prompt);
    let Some(first) = rows.first() else {
        return finish(title, "table", json!({}), target_type);
    };

    let numeric: Vec<&str> = first
        .iter()
        .filter(|(_, v)| v.is_number())
        .map(|(k, _)| k.as_str())
        .collect();
    let labels: Vec<&str> = first
        .iter()
        .filter(|(_, v)| !v.is_number())
        .map(|(k, _)| k.as_str())
        .collect();

    let (kind, config) = match (labels.first(), numeric.is_empty()) {
        (_, true) => ("table", json!({ "columns": first.keys().collect::<Vec<_>>() })),
        (None, false) if rows.len() == 1 => ("kpi", json!({ "valueKey": numeric[0] })),
        (None, false) => ("table", json!({ "columns": numeric })),
        (Some(x), false) => {
            let kind = if TEMPORAL_COLUMN.is_match(x) || TREND_PROMPT.is_match(user_prompt) {
                "line"
            } else if SHARE_PROMPT.is_match(user_prompt) && rows.len() <= MAX_PIE_SLICES {
                "pie"
            } else {
                "bar"
            };
            (kind, json!({ "xKey": x, "yKeys": numeric }))
        }
    };
    finish(title, kind, config, target_type)
}

fn finish(title: String, kind: &str, config: Value, target_type: Option<&str>) -> ChartSpec {
    ChartSpec {
        title,
        widget_type: target_type.unwrap_or(kind).to_string(),
        config,
    }
}

fn title_from_prompt(prompt: &str) -> String {
    let trimmed = prompt.trim().trim_end_matches(['?', '.', '!']);
    let mut chars = trimmed.chars();
    let mut title: String = match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => return "Analysis".to_string(),
    };
    if title.chars().count() > MAX_TITLE_CHARS {
        title = title.chars().take(MAX_TITLE_CHARS - 3).collect::<String>() + "...";
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(v: Value) -> Vec<Row> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn single_number_is_a_kpi() {
        let spec = infer_chart("show total sales", &rows(json!([{ "total": 552.75 }])), None);
        assert_eq!(spec.widget_type, "kpi");
        assert_eq!(spec.title, "Show total sales");
        assert_eq!(spec.config["valueKey"], "total");
    }

    #[test]
    fn label_and_value_is_a_bar_unless_temporal_or_share() {
        let by_region = rows(json!([
            { "region": "north", "total": 1 },
            { "region": "south", "total": 2 }
        ]));
        assert_eq!(infer_chart("sales by region", &by_region, None).widget_type, "bar");
        assert_eq!(
            infer_chart("share of sales by region", &by_region, None).widget_type,
            "pie"
        );
        let by_month = rows(json!([{ "order_month": "2024-01", "total": 1 }]));
        assert_eq!(infer_chart("sales", &by_month, None).widget_type, "line");
    }

    #[test]
    fn empty_or_textual_results_are_tables_and_target_wins() {
        assert_eq!(infer_chart("x", &[], None).widget_type, "table");
        let names = rows(json!([{ "product": "widget" }]));
        assert_eq!(infer_chart("list products", &names, None).widget_type, "table");
        assert_eq!(infer_chart("list products", &names, Some("bar")).widget_type, "bar");
    }

    #[test]
    fn long_prompts_are_truncated_into_titles() {
        let spec = infer_chart(&"a".repeat(200), &[], None);
        assert_eq!(spec.title.chars().count(), MAX_TITLE_CHARS);
        assert!(spec.title.ends_with("..."));
    }
}
