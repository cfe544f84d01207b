//! Cell marker line grammar.
//!
//! Markers follow the jupytext percent convention:
//!
//! ```text
//! # %% Optional title [markdown] key1="val1" key2=val2
//! ```
//!
//! The `[kind]` bracket may appear anywhere after the `%%`; `markdown`/`md`
//! select a prose cell, any other kind (or none) means code. A title, when
//! present, lands in metadata under `title`; explicit `title=` pairs win on
//! collision. Unknown keys are preserved verbatim.

use std::sync::LazyLock;

use core_cell::{CellKind, Metadata};
use regex::Regex;

pub const MARKER_PREFIX: &str = "# %%";

static KIND_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]*)\]").expect("kind regex"));
static KV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(\w+)=(?:"([^"]*)"|'([^']*)'|(\S+))"#).expect("kv regex")
});
static KV_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\w+=["']?"#).expect("kv start regex"));
static KV_AFTER_WS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\s(\w+=["']?)"#).expect("kv after ws regex"));

/// True when a line's first non-whitespace content is the marker lead.
pub fn is_marker_line(line: &str) -> bool {
    line.trim_start().starts_with(MARKER_PREFIX)
}

/// Parse a marker line into the declared cell kind and metadata.
///
/// Never fails: everything after `# %%` is interpreted best-effort, matching
/// the tolerant posture of the studied format.
pub fn parse_marker(line: &str) -> (CellKind, Metadata) {
    let content = line.trim();
    debug_assert!(content.starts_with(MARKER_PREFIX), "caller checks is_marker_line");
    let mut content = content[MARKER_PREFIX.len()..].trim().to_string();

    let mut kind = CellKind::Code;
    if let Some(found) = KIND_RE.find(&content) {
        let inner = &content[found.start() + 1..found.end() - 1];
        if matches!(inner.to_ascii_lowercase().as_str(), "markdown" | "md") {
            kind = CellKind::Prose;
        }
        let before = content[..found.start()].trim();
        let after = content[found.end()..].trim();
        content = if before.is_empty() || after.is_empty() {
            format!("{before}{after}")
        } else {
            format!("{before} {after}")
        };
    }

    // Split the remainder into a free-form title and key=value pairs: the
    // title runs up to the first whitespace-preceded pair.
    let (title, pairs) = if KV_START_RE.is_match(&content) {
        (String::new(), content.clone())
    } else if let Some(m) = KV_AFTER_WS_RE.find(&content) {
        (
            content[..m.start()].trim().to_string(),
            content[m.start()..].trim().to_string(),
        )
    } else {
        (content.trim().to_string(), String::new())
    };

    let mut metadata = Metadata::new();
    if !title.is_empty() {
        metadata.insert("title".to_string(), title);
    }
    for captures in KV_RE.captures_iter(&pairs) {
        let key = captures[1].to_string();
        let value = captures
            .get(2)
            .or_else(|| captures.get(3))
            .or_else(|| captures.get(4))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        metadata.insert(key, value);
    }
    (kind, metadata)
}

/// Render a marker line for a cell, the inverse of [`parse_marker`] for
/// canonical metadata.
pub fn render_marker(kind: CellKind, metadata: &Metadata) -> String {
    let mut line = MARKER_PREFIX.to_string();
    if let Some(title) = metadata.get("title") {
        line.push(' ');
        line.push_str(title);
    }
    if kind == CellKind::Prose {
        line.push_str(" [markdown]");
    }
    for (key, value) in metadata {
        if key == "title" {
            continue;
        }
        if !value.is_empty() && value.chars().all(|c| c.is_alphanumeric() || c == '_') {
            line.push_str(&format!(" {key}={value}"));
        } else {
            line.push_str(&format!(" {key}=\"{value}\""));
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bare_marker_is_code_with_no_metadata() {
        let (kind, meta) = parse_marker("# %%");
        assert_eq!(kind, CellKind::Code);
        assert!(meta.is_empty());
    }

    #[test]
    fn title_only() {
        let (kind, meta) = parse_marker("# %% Load the data");
        assert_eq!(kind, CellKind::Code);
        assert_eq!(meta.get("title").map(String::as_str), Some("Load the data"));
    }

    #[test]
    fn markdown_kind_selects_prose() {
        let (kind, meta) = parse_marker("# %% Intro [markdown]");
        assert_eq!(kind, CellKind::Prose);
        assert_eq!(meta.get("title").map(String::as_str), Some("Intro"));
        let (kind, _) = parse_marker("# %% [md]");
        assert_eq!(kind, CellKind::Prose);
    }

    #[test]
    fn unknown_kind_means_code() {
        let (kind, _) = parse_marker("# %% [python]");
        assert_eq!(kind, CellKind::Code);
    }

    #[test]
    fn key_value_pairs_with_and_without_quotes() {
        let (_, meta) = parse_marker(r#"# %% Plot [markdown] width="400 px" cache=yes"#);
        assert_eq!(meta.get("title").map(String::as_str), Some("Plot"));
        assert_eq!(meta.get("width").map(String::as_str), Some("400 px"));
        assert_eq!(meta.get("cache").map(String::as_str), Some("yes"));
    }

    #[test]
    fn metadata_without_title() {
        let (_, meta) = parse_marker("# %% cache=yes rerun=always");
        assert!(meta.get("title").is_none());
        assert_eq!(meta.get("rerun").map(String::as_str), Some("always"));
    }

    #[test]
    fn explicit_title_pair_overrides_free_title() {
        let (_, meta) = parse_marker(r#"# %% Free title title="explicit""#);
        assert_eq!(meta.get("title").map(String::as_str), Some("explicit"));
    }

    #[test]
    fn render_round_trips_canonical_markers() {
        for line in [
            "# %% Load the data",
            "# %% Intro [markdown]",
            "# %% cache=yes",
            r#"# %% Plot cache="two words""#,
        ] {
            let (kind, meta) = parse_marker(line);
            let rendered = render_marker(kind, &meta);
            let (kind2, meta2) = parse_marker(&rendered);
            assert_eq!(kind, kind2, "kind for {line}");
            assert_eq!(meta, meta2, "metadata for {line}");
        }
    }
}
