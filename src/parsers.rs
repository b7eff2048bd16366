/// Content parsers: link extraction and in-place link rewriting.
///
/// The HTML side runs on lol_html's streaming rewriter, which passes every
/// byte through untouched unless a handler explicitly mutates it. That is
/// what makes the rewrite contract cheap to honor: parsing a document and
/// writing it back without substitutions reproduces the input byte for
/// byte, entities, quoting style, whitespace and tag soup included.
///
/// CSS gets a small hand-rolled lexer (`@import` and `url()` tokens with
/// the usual quoting and backslash rules); it doubles as the sub-parser
/// for `style` attributes and `<style>` blocks.
use std::cell::RefCell;
use std::rc::Rc;

use lazy_static::lazy_static;
use lol_html::html_content::{ContentType, TextChunk};
use lol_html::{doc_comments, element, text, HtmlRewriter, Settings};
use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::link::LinkOpts;
use crate::urlnorm::has_scheme;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("html rewriting failed: {0}")]
    Html(String),
    #[error("document is not valid utf-8 enough to rewrite")]
    Encoding,
}

/// Replacer callback for rewrites: given an absolutized URL, return the
/// replacement value, or `None` to leave the original bytes alone.
pub type Replacer<'a> = dyn Fn(&str) -> Option<String> + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    Html,
    Css,
}

/// Pick a parser for a response content type. Everything but HTML and CSS
/// is opaque data: stored, never searched for links.
pub fn parser_for(mimetype: &str) -> Option<ParserKind> {
    match mimetype {
        "text/html" | "application/xhtml+xml" => Some(ParserKind::Html),
        "text/css" => Some(ParserKind::Css),
        _ => None,
    }
}

impl ParserKind {
    pub fn extract(&self, data: &[u8], base: &Url) -> Result<Vec<(String, LinkOpts)>, ParseError> {
        match self {
            ParserKind::Html => extract_html(data, base),
            ParserKind::Css => {
                let text = String::from_utf8_lossy(data);
                Ok(extract_css_links(&text, base))
            }
        }
    }

    pub fn rewrite(
        &self,
        data: &[u8],
        base: &Url,
        replacer: &Replacer<'_>,
    ) -> Result<Vec<u8>, ParseError> {
        match self {
            ParserKind::Html => rewrite_html(data, base, replacer),
            ParserKind::Css => {
                let text = std::str::from_utf8(data).map_err(|_| ParseError::Encoding)?;
                Ok(rewrite_css(text, &absolutizing(base, replacer)).into_bytes())
            }
        }
    }
}

// --- URL plumbing ------------------------------------------------------

/// Resolve a raw attribute value against the document base.
///
/// A value that already carries a scheme is passed through untouched;
/// renormalizing it (case folding the host, say) would make the rewrite
/// pass rewrite bytes that did not need to change.
fn absurl(raw: &str, base: &Url) -> Option<String> {
    let decoded = decode_entities(raw);
    let trimmed = decoded.trim();
    if trimmed.is_empty() {
        return None;
    }
    if has_scheme(trimmed) {
        return Some(trimmed.to_string());
    }
    base.join(trimmed).ok().map(|u| u.to_string())
}

/// Wrap a replacer so it sees absolutized URLs while the CSS lexer keeps
/// feeding it raw token values.
fn absolutizing<'a>(
    base: &'a Url,
    replacer: &'a Replacer<'a>,
) -> impl Fn(&str) -> Option<String> + 'a {
    move |raw| absurl(raw, base).and_then(|abs| replacer(&abs))
}

/// Minimal HTML entity decoding for attribute values.
fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let Some(end) = rest.find(';') else {
            out.push_str(rest);
            return out;
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix('#')
                .and_then(|num| {
                    if let Some(hex) = num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                        u32::from_str_radix(hex, 16).ok()
                    } else {
                        num.parse().ok()
                    }
                })
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

// --- HTML --------------------------------------------------------------

/// Tag/attribute pairs that carry URLs, and whether the reference is a
/// page requisite.
const TAG_ATTRS: &[(&str, &str, bool)] = &[
    ("a", "href", false),
    ("img", "href", true),
    ("img", "src", true),
    ("img", "lowsrc", true),
    ("script", "src", true),
    ("applet", "code", true),
    ("bgsound", "src", true),
    ("area", "href", false),
    ("body", "background", true),
    ("embed", "src", true),
    ("fig", "src", true),
    ("frame", "src", true),
    ("iframe", "src", true),
    ("input", "src", true),
    ("layer", "src", true),
    ("object", "data", true),
    ("overlay", "src", true),
    ("table", "background", true),
    ("td", "background", true),
    ("th", "background", true),
];

/// A `<link>` is a requisite when it is a stylesheet ("alternate
/// stylesheet" included) or any flavor of icon.
pub fn is_inline_rel(rel: &str) -> bool {
    rel.split_ascii_whitespace()
        .map(|t| t.to_ascii_lowercase())
        .any(|t| t == "stylesheet" || t.contains("icon"))
}

lazy_static! {
    static ref META_REFRESH: Regex =
        Regex::new(r"(?i)url\s*=\s*(.+)").expect("Invalid meta refresh regex");
}

fn meta_refresh_url(content: &str) -> Option<String> {
    META_REFRESH
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// The inner markup of an IE conditional comment, with its wrapper pieces.
/// `<!--[if lt IE 9]><link ...><![endif]-->` hides real links from any
/// comment-blind parser.
fn conditional_comment_inner(text: &str) -> Option<(usize, usize)> {
    let trimmed_start = text.len() - text.trim_start().len();
    if !text[trimmed_start..].starts_with("[if") {
        return None;
    }
    let open = text.find("]>")? + 2;
    let close = text.rfind("<![endif]")?;
    (open <= close).then_some((open, close))
}

fn extract_html(data: &[u8], base: &Url) -> Result<Vec<(String, LinkOpts)>, ParseError> {
    let links: Rc<RefCell<Vec<(String, LinkOpts)>>> = Rc::new(RefCell::new(Vec::new()));
    let base = Rc::new(RefCell::new(base.clone()));
    let style_buf = Rc::new(RefCell::new(String::new()));

    let mut handlers = Vec::new();

    {
        let base = Rc::clone(&base);
        handlers.push(element!("base[href]", move |el| {
            if let Some(href) = el.get_attribute("href") {
                let current = base.borrow().clone();
                if let Ok(new_base) = current.join(decode_entities(&href).trim()) {
                    *base.borrow_mut() = new_base;
                }
            }
            Ok(())
        }));
    }

    for &(tag, attr, inline) in TAG_ATTRS {
        let links = Rc::clone(&links);
        let base = Rc::clone(&base);
        handlers.push(element!(tag, move |el| {
            if let Some(raw) = el.get_attribute(attr) {
                if let Some(abs) = absurl(&raw, &base.borrow()) {
                    links.borrow_mut().push((
                        abs,
                        LinkOpts {
                            inline,
                            tag: Some(format!("{tag}.{attr}")),
                            ..LinkOpts::default()
                        },
                    ));
                }
            }
            Ok(())
        }));
    }

    {
        let links = Rc::clone(&links);
        let base = Rc::clone(&base);
        handlers.push(element!("link[href]", move |el| {
            if let Some(raw) = el.get_attribute("href") {
                if let Some(abs) = absurl(&raw, &base.borrow()) {
                    let inline = el
                        .get_attribute("rel")
                        .map(|rel| is_inline_rel(&rel))
                        .unwrap_or(false);
                    links.borrow_mut().push((
                        abs,
                        LinkOpts {
                            inline,
                            tag: Some("link.href".to_string()),
                            ..LinkOpts::default()
                        },
                    ));
                }
            }
            Ok(())
        }));
    }

    {
        let links = Rc::clone(&links);
        let base = Rc::clone(&base);
        handlers.push(element!("form[action]", move |el| {
            if let Some(raw) = el.get_attribute("action") {
                if let Some(abs) = absurl(&raw, &base.borrow()) {
                    links.borrow_mut().push((
                        abs,
                        LinkOpts {
                            do_not_follow: true,
                            tag: Some("form.action".to_string()),
                            ..LinkOpts::default()
                        },
                    ));
                }
            }
            Ok(())
        }));
    }

    {
        let links = Rc::clone(&links);
        let base = Rc::clone(&base);
        handlers.push(element!("meta", move |el| {
            let is_refresh = el
                .get_attribute("http-equiv")
                .map(|v| v.eq_ignore_ascii_case("refresh"))
                .unwrap_or(false);
            if is_refresh {
                if let Some(content) = el.get_attribute("content") {
                    if let Some(target) = meta_refresh_url(&decode_entities(&content)) {
                        if let Some(abs) = absurl(&target, &base.borrow()) {
                            links.borrow_mut().push((
                                abs,
                                LinkOpts {
                                    tag: Some("meta.content".to_string()),
                                    ..LinkOpts::default()
                                },
                            ));
                        }
                    }
                }
            }
            Ok(())
        }));
    }

    {
        let links = Rc::clone(&links);
        handlers.push(element!("[style]", move |el| {
            if let Some(style) = el.get_attribute("style") {
                for raw in extract_css(&decode_entities(&style)) {
                    links.borrow_mut().push((raw, css_opts()));
                }
            }
            Ok(())
        }));
    }

    {
        let links = Rc::clone(&links);
        let buf = Rc::clone(&style_buf);
        handlers.push(text!("style", move |t: &mut TextChunk| {
            buf.borrow_mut().push_str(t.as_str());
            if t.last_in_text_node() {
                let css = std::mem::take(&mut *buf.borrow_mut());
                for raw in extract_css(&css) {
                    links.borrow_mut().push((raw, css_opts()));
                }
            }
            Ok(())
        }));
    }

    let comment_links = Rc::clone(&links);
    let comment_base = Rc::clone(&base);
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            document_content_handlers: vec![doc_comments!(move |c| {
                let text = c.text();
                if let Some((open, close)) = conditional_comment_inner(&text) {
                    let inner = extract_html(text[open..close].as_bytes(), &comment_base.borrow())
                        .map_err(box_err)?;
                    comment_links.borrow_mut().extend(inner);
                }
                Ok(())
            })],
            ..Settings::new()
        },
        |_: &[u8]| {},
    );
    rewriter.write(data).map_err(|e| ParseError::Html(e.to_string()))?;
    rewriter.end().map_err(|e| ParseError::Html(e.to_string()))?;

    // CSS URLs were collected raw; resolve them against the final base.
    let base = base.borrow();
    let resolved = links
        .borrow()
        .iter()
        .filter_map(|(raw, opts)| {
            if opts.tag.is_none() {
                Some((absurl(raw, &base)?, opts.clone()))
            } else {
                Some((raw.clone(), opts.clone()))
            }
        })
        .collect();
    Ok(resolved)
}

fn css_opts() -> LinkOpts {
    LinkOpts {
        inline: true,
        ..LinkOpts::default()
    }
}

fn box_err(e: ParseError) -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(e)
}

fn rewrite_html(data: &[u8], base: &Url, replacer: &Replacer<'_>) -> Result<Vec<u8>, ParseError> {
    let base = Rc::new(RefCell::new(base.clone()));
    let style_buf = Rc::new(RefCell::new(String::new()));
    let mut output = Vec::with_capacity(data.len());

    let mut handlers = Vec::new();

    {
        let base = Rc::clone(&base);
        handlers.push(element!("base[href]", move |el| {
            if let Some(href) = el.get_attribute("href") {
                let current = base.borrow().clone();
                if let Ok(new_base) = current.join(decode_entities(&href).trim()) {
                    *base.borrow_mut() = new_base;
                }
            }
            Ok(())
        }));
    }

    // Rewritable tag attributes: the registry, <link> and <form>. A meta
    // refresh URL is never rewritten (known limitation of the format).
    let mut rewritable: Vec<(&str, &str)> =
        TAG_ATTRS.iter().map(|&(tag, attr, _)| (tag, attr)).collect();
    rewritable.push(("link", "href"));
    rewritable.push(("form", "action"));

    for (tag, attr) in rewritable {
        let base = Rc::clone(&base);
        handlers.push(element!(tag, move |el| {
            if let Some(raw) = el.get_attribute(attr) {
                let decoded = decode_entities(&raw);
                if let Some(abs) = absurl(&raw, &base.borrow()) {
                    if let Some(new) = replacer(&abs) {
                        if new != decoded.trim() {
                            el.set_attribute(attr, &new)?;
                        }
                    }
                }
            }
            Ok(())
        }));
    }

    {
        let base = Rc::clone(&base);
        handlers.push(element!("[style]", move |el| {
            if let Some(style) = el.get_attribute("style") {
                let decoded = decode_entities(&style);
                let rewritten = rewrite_css(&decoded, &absolutizing(&base.borrow(), replacer));
                if rewritten != decoded {
                    el.set_attribute("style", &rewritten)?;
                }
            }
            Ok(())
        }));
    }

    {
        let base = Rc::clone(&base);
        let buf = Rc::clone(&style_buf);
        handlers.push(text!("style", move |t: &mut TextChunk| {
            buf.borrow_mut().push_str(t.as_str());
            if t.last_in_text_node() {
                let css = std::mem::take(&mut *buf.borrow_mut());
                let rewritten = rewrite_css(&css, &absolutizing(&base.borrow(), replacer));
                t.replace(&rewritten, ContentType::Html);
            } else {
                t.remove();
            }
            Ok(())
        }));
    }

    let comment_base = Rc::clone(&base);
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            document_content_handlers: vec![doc_comments!(move |c| {
                let text = c.text();
                if let Some((open, close)) = conditional_comment_inner(&text) {
                    let inner = &text[open..close];
                    let rewritten =
                        rewrite_html(inner.as_bytes(), &comment_base.borrow(), replacer)
                            .map_err(box_err)?;
                    let rewritten = String::from_utf8_lossy(&rewritten);
                    if rewritten != inner {
                        let new_text =
                            format!("{}{}{}", &text[..open], rewritten, &text[close..]);
                        c.set_text(&new_text)?;
                    }
                }
                Ok(())
            })],
            ..Settings::new()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );
    rewriter.write(data).map_err(|e| ParseError::Html(e.to_string()))?;
    rewriter.end().map_err(|e| ParseError::Html(e.to_string()))?;

    Ok(output)
}

// --- CSS ---------------------------------------------------------------

enum CssSegment<'a> {
    Raw(&'a str),
    /// `raw` spans the URL token exactly as written, quotes included;
    /// `url` is the unescaped value.
    Url { raw: &'a str, url: String },
}

fn scan_css(data: &str) -> Vec<CssSegment<'_>> {
    let bytes = data.as_bytes();
    let mut segments = Vec::new();
    let mut seg_start = 0;
    let mut i = 0;

    fn starts_ci(bytes: &[u8], at: usize, token: &[u8]) -> bool {
        bytes.len() >= at + token.len()
            && bytes[at..at + token.len()].eq_ignore_ascii_case(token)
    }

    // Read a quoted value starting right after the opening quote.
    // Returns (value, offset one past the closing quote).
    fn read_quoted(bytes: &[u8], mut i: usize, quote: u8) -> (Vec<u8>, usize) {
        let mut value = Vec::new();
        while i < bytes.len() {
            match bytes[i] {
                b'\\' if i + 1 < bytes.len() => {
                    value.push(bytes[i + 1]);
                    i += 2;
                }
                b'\n' => return (value, i),
                c if c == quote => return (value, i + 1),
                c => {
                    value.push(c);
                    i += 1;
                }
            }
        }
        (value, i)
    }

    fn read_bare(bytes: &[u8], mut i: usize) -> (Vec<u8>, usize) {
        let mut value = Vec::new();
        while i < bytes.len() {
            match bytes[i] {
                b'\\' if i + 1 < bytes.len() => {
                    value.push(bytes[i + 1]);
                    i += 2;
                }
                b')' | b'\n' => break,
                c if c.is_ascii_whitespace() => break,
                c => {
                    value.push(c);
                    i += 1;
                }
            }
        }
        (value, i)
    }

    while i < bytes.len() {
        if starts_ci(bytes, i, b"/*") {
            i = data[i + 2..]
                .find("*/")
                .map(|p| i + 2 + p + 2)
                .unwrap_or(bytes.len());
            continue;
        }
        if starts_ci(bytes, i, b"@import") {
            let mut j = i + 7;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            if j < bytes.len() && (bytes[j] == b'"' || bytes[j] == b'\'') {
                let (value, end) = read_quoted(bytes, j + 1, bytes[j]);
                segments.push(CssSegment::Raw(&data[seg_start..j]));
                segments.push(CssSegment::Url {
                    raw: &data[j..end],
                    url: String::from_utf8_lossy(&value).into_owned(),
                });
                seg_start = end;
                i = end;
                continue;
            }
            i = j;
            continue;
        }
        if starts_ci(bytes, i, b"url(") {
            let mut j = i + 4;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            let (value, end) = if j < bytes.len() && (bytes[j] == b'"' || bytes[j] == b'\'') {
                read_quoted(bytes, j + 1, bytes[j])
            } else {
                read_bare(bytes, j)
            };
            if !value.is_empty() || j < end {
                segments.push(CssSegment::Raw(&data[seg_start..j]));
                segments.push(CssSegment::Url {
                    raw: &data[j..end],
                    url: String::from_utf8_lossy(&value).into_owned(),
                });
                seg_start = end;
                i = end;
                continue;
            }
            i = j;
            continue;
        }
        i += 1;
    }
    segments.push(CssSegment::Raw(&data[seg_start..]));
    segments
}

/// Raw URL values referenced by a stylesheet, in document order.
pub fn extract_css(data: &str) -> Vec<String> {
    scan_css(data)
        .into_iter()
        .filter_map(|seg| match seg {
            CssSegment::Url { url, .. } => Some(url),
            CssSegment::Raw(_) => None,
        })
        .collect()
}

fn extract_css_links(data: &str, base: &Url) -> Vec<(String, LinkOpts)> {
    extract_css(data)
        .into_iter()
        .filter_map(|raw| Some((absurl(&raw, base)?, css_opts())))
        .collect()
}

/// Rewrite a stylesheet. Substituted URLs come out double-quoted with
/// embedded quotes escaped; untouched tokens keep their original bytes.
pub fn rewrite_css(data: &str, replacer: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(data.len());
    for segment in scan_css(data) {
        match segment {
            CssSegment::Raw(raw) => out.push_str(raw),
            CssSegment::Url { raw, url } => match replacer(&url) {
                Some(new) if new != url => {
                    out.push('"');
                    out.push_str(&new.replace('"', "\\\""));
                    out.push('"');
                }
                _ => out.push_str(raw),
            },
        }
    }
    out
}

// --- HTTP Link: headers ------------------------------------------------

/// Parse `Link:` header values into the same shape document links take.
pub fn header_links(values: &[String], base: &Url) -> Vec<(String, LinkOpts)> {
    let mut links = Vec::new();
    for value in values {
        for part in split_header_parts(value) {
            let part = part.trim();
            let Some(rest) = part.strip_prefix('<') else { continue };
            let Some(end) = rest.find('>') else { continue };
            let target = &rest[..end];
            let mut inline = false;
            for param in rest[end + 1..].split(';') {
                let mut kv = param.splitn(2, '=');
                let key = kv.next().unwrap_or("").trim().to_ascii_lowercase();
                if key == "rel" {
                    let val = kv.next().unwrap_or("").trim().trim_matches('"');
                    inline = is_inline_rel(val);
                }
            }
            if let Some(abs) = absurl(target, base) {
                links.push((
                    abs,
                    LinkOpts {
                        inline,
                        source: Some("http-header".to_string()),
                        ..LinkOpts::default()
                    },
                ));
            }
        }
    }
    links
}

/// Split a Link header on commas that sit outside `<...>`.
fn split_header_parts(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}
