//! Rich display resolution: evaluator values to [`Renderable`] artifacts.
//!
//! Marimo-style method resolution over a capability trait, first match wins:
//!
//! 1. Prepared display — recurse on the wrapped value, bounded at depth 10.
//! 2. MIME form — `(mime, payload)` mapped onto the closed union.
//! 3. Format-specific representations, probed in order: HTML, SVG, PNG,
//!    JPEG, Markdown, LaTeX, JSON.
//! 4. Built-in types: figures as PNG, tabular values as HTML, raster images
//!    as PNG.
//! 5. Fallback: plain-text repr.
//!
//! Capability methods are total: a capability that cannot produce its
//! representation returns `None` and resolution moves to the next rule (the
//! studied original catches exceptions at each step to the same effect).

use core_cell::Renderable;

/// Recursion bound for rule 1. On overflow the conversion yields a fixed
/// text artifact rather than erroring the cell.
pub const MAX_DISPLAY_DEPTH: usize = 10;

/// Display capabilities an evaluator value may expose.
pub trait RichDisplay {
    /// Rule 1: a value that prefers to display as some other value.
    fn prepared_display(&self) -> Option<&dyn RichDisplay> {
        None
    }

    /// Rule 2: an explicit `(mime type, payload)` pair.
    fn mime_form(&self) -> Option<(String, Vec<u8>)> {
        None
    }

    fn html_repr(&self) -> Option<String> {
        None
    }

    fn svg_repr(&self) -> Option<String> {
        None
    }

    fn png_repr(&self) -> Option<Vec<u8>> {
        None
    }

    fn jpeg_repr(&self) -> Option<Vec<u8>> {
        None
    }

    fn markdown_repr(&self) -> Option<String> {
        None
    }

    fn latex_repr(&self) -> Option<String> {
        None
    }

    fn json_repr(&self) -> Option<String> {
        None
    }

    /// Rule 4: plot-like values that rasterize themselves.
    fn figure_png(&self) -> Option<Vec<u8>> {
        None
    }

    /// Rule 4: tabular values rendered as an HTML table.
    fn table_html(&self) -> Option<String> {
        None
    }

    /// Rule 4: raster images.
    fn image_png(&self) -> Option<Vec<u8>> {
        None
    }

    /// Rule 5: the unconditional plain-text representation.
    fn text_repr(&self) -> String;
}

/// Convert a value into its display artifact.
pub fn to_renderable(value: &dyn RichDisplay) -> Renderable {
    convert(value, 0)
}

fn convert(value: &dyn RichDisplay, depth: usize) -> Renderable {
    if depth >= MAX_DISPLAY_DEPTH {
        return Renderable::Text("display recursion exceeded".to_string());
    }

    if let Some(inner) = value.prepared_display() {
        return convert(inner, depth + 1);
    }

    if let Some((mime, payload)) = value.mime_form() {
        return from_mime(&mime, payload);
    }

    if let Some(html) = value.html_repr() {
        return Renderable::Html(html);
    }
    if let Some(svg) = value.svg_repr() {
        return Renderable::Svg(svg);
    }
    if let Some(png) = value.png_repr() {
        return Renderable::Png(png);
    }
    if let Some(jpeg) = value.jpeg_repr() {
        return Renderable::Jpeg(jpeg);
    }
    if let Some(markdown) = value.markdown_repr() {
        return Renderable::Markdown(markdown);
    }
    if let Some(latex) = value.latex_repr() {
        return Renderable::Latex(latex);
    }
    if let Some(json) = value.json_repr() {
        return Renderable::Json(json);
    }

    if let Some(png) = value.figure_png() {
        return Renderable::Png(png);
    }
    if let Some(html) = value.table_html() {
        return Renderable::Html(html);
    }
    if let Some(png) = value.image_png() {
        return Renderable::Png(png);
    }

    Renderable::Text(value.text_repr())
}

fn from_mime(mime: &str, payload: Vec<u8>) -> Renderable {
    let text = || String::from_utf8_lossy(&payload).into_owned();
    match mime.to_ascii_lowercase().as_str() {
        "text/html" => Renderable::Html(text()),
        "image/svg+xml" => Renderable::Svg(text()),
        "image/png" => Renderable::Png(payload),
        "image/jpeg" => Renderable::Jpeg(payload),
        "text/markdown" => Renderable::Markdown(text()),
        "text/latex" => Renderable::Latex(text()),
        "application/json" => Renderable::Json(text()),
        // Unknown MIME types degrade to plain text.
        _ => Renderable::Text(text()),
    }
}
