//! Markdown to HTML for generated sections
//!
//! LLM drafts are CommonMark with GFM tables and strikethrough. Raw HTML in a
//! draft is rendered as escaped text.

use pulldown_cmark::{html, Event, Options, Parser};

fn options() -> Options {
    Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH
}

/// Escape text for HTML element content and attributes
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Convert markdown to HTML without a title
pub fn markdown_to_html(markdown: &str) -> String {
    let events = Parser::new_ext(markdown, options()).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        other => other,
    });

    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, events);
    out.trim_end().to_string()
}

/// Convert an LLM draft to section HTML, adding `<h1>{title}</h1>` unless the
/// draft already opens with a top-level heading
pub fn section_html(markdown: &str, title: &str) -> String {
    let body = markdown_to_html(markdown);
    if body.starts_with("<h1>") || body.starts_with("<h2>") {
        body
    } else if body.is_empty() {
        format!("<h1>{}</h1>", escape_html(title))
    } else {
        format!("<h1>{}</h1>\n{}", escape_html(title), body)
    }
}
