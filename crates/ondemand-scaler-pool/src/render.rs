//! Compact YAML-like rendering of pool specifications for state dumps.

use std::collections::BTreeMap;
use std::fmt::Write;

use ondemand_scaler_core::Variant;

/// Longest string value rendered before it is abbreviated.
pub const MAX_VALUE_LEN: usize = 30;

/// Render `attributes` one key per line, sorted, with the keys in `last`
/// moved to the end.
#[must_use]
pub fn render_spec(attributes: &BTreeMap<String, Variant>, last: &[&str]) -> String {
    let (tail, head): (Vec<_>, Vec<_>) = attributes
        .iter()
        .partition(|(key, _)| last.contains(&key.as_str()));

    let mut out = String::new();
    for (key, value) in head.into_iter().chain(tail) {
        render_entry(&mut out, 0, key, value);
    }
    out.truncate(out.trim_end().len());
    out
}

/// Shorten `text` to at most `max` characters, marking the cut with `...`.
#[must_use]
pub fn abbreviate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut short: String = text.chars().take(keep).collect();
    short.push_str("...");
    short
}

fn indent(level: usize) -> String {
    "  ".repeat(level)
}

fn scalar(value: &Variant) -> Option<String> {
    match value {
        Variant::Int(v) => Some(v.to_string()),
        Variant::Bool(v) => Some(v.to_string()),
        Variant::Str(v) => Some(abbreviate(v, MAX_VALUE_LEN)),
        Variant::List(_) | Variant::Map(_) => None,
    }
}

fn render_entry(out: &mut String, level: usize, key: &str, value: &Variant) {
    let pad = indent(level);
    match value {
        Variant::List(items) if items.is_empty() => {
            let _ = writeln!(out, "{pad}{key}: []");
        }
        Variant::Map(map) if map.is_empty() => {
            let _ = writeln!(out, "{pad}{key}: {{}}");
        }
        Variant::List(items) => {
            let _ = writeln!(out, "{pad}{key}:");
            for item in items {
                render_item(out, level + 1, item);
            }
        }
        Variant::Map(map) => {
            let _ = writeln!(out, "{pad}{key}:");
            for (k, v) in map {
                render_entry(out, level + 1, k, v);
            }
        }
        other => {
            let _ = writeln!(out, "{pad}{key}: {}", scalar(other).unwrap_or_default());
        }
    }
}

fn render_item(out: &mut String, level: usize, item: &Variant) {
    let pad = indent(level);
    if let Some(text) = scalar(item) {
        let _ = writeln!(out, "{pad}- {text}");
        return;
    }

    let mut nested = String::new();
    match item {
        Variant::Map(map) => {
            for (k, v) in map {
                render_entry(&mut nested, level + 1, k, v);
            }
        }
        Variant::List(items) => {
            for inner in items {
                render_item(&mut nested, level + 1, inner);
            }
        }
        _ => {}
    }

    // The first nested line carries the dash in place of its indentation.
    let inner_pad = indent(level + 1);
    match nested.strip_prefix(inner_pad.as_str()) {
        Some(rest) => {
            let _ = write!(out, "{pad}- {rest}");
        }
        None => {
            let _ = writeln!(out, "{pad}- []");
        }
    }
}
