//! Rich step content: HTML fragments turned into a nested tag tree the
//! clients render natively.
//!
//! Parsing is permissive. Unknown or unbalanced markup never fails; stray end
//! tags are dropped and elements still open at the end of input are closed.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

/// Elements nested deeper than this are unwrapped: their text goes to the
/// deepest kept ancestor. Void elements are still kept as leaves.
pub const MAX_DEPTH: usize = 32;

const IMAGE_TAG: &str = "img";
const PARAGRAPH_TAG: &str = "p";

/// Inline style declarations in source order.
pub type StyleMap = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentNode {
    Text(String),
    Image {
        src: Option<String>,
    },
    Element {
        tag: String,
        style: Option<StyleMap>,
        body: Body,
    },
}

/// An element with child elements keeps its children; one without is
/// flattened to its inner text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Nodes(Vec<ContentNode>),
    Text(String),
}

struct StyleEntries<'a>(&'a [(String, String)]);

impl Serialize for StyleEntries<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl Serialize for ContentNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ContentNode::Text(text) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("text", text)?;
                map.end()
            }
            ContentNode::Image { src } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("tag", IMAGE_TAG)?;
                map.serialize_entry("src", src)?;
                map.end()
            }
            ContentNode::Element { tag, style, body } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("tag", tag)?;
                if let Some(style) = style {
                    map.serialize_entry("style", &StyleEntries(style))?;
                }
                match body {
                    Body::Nodes(nodes) => map.serialize_entry("content", nodes)?,
                    Body::Text(text) => map.serialize_entry("text", text)?,
                }
                map.end()
            }
        }
    }
}

/// Converts an HTML fragment into content nodes, one per top-level element.
/// Bare text between top-level elements is dropped.
pub fn parse(html: &str) -> Vec<ContentNode> {
    build_tree(Tokenizer::new(html))
        .iter()
        .filter_map(|node| match node {
            Dom::Element(el) => Some(convert(el)),
            Dom::Text(_) => None,
        })
        .collect()
}

/// Splits `a: b; c: d` into ordered pairs. Each chunk is split on its first
/// colon; empty chunks and chunks without a colon are ignored. A repeated
/// property keeps its first position and takes the last value.
pub fn parse_style(raw: &str) -> StyleMap {
    let mut out: StyleMap = Vec::new();
    for chunk in raw.split(';') {
        let Some((key, value)) = chunk.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim().to_string();
        match out.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => out.push((key.to_string(), value)),
        }
    }
    out
}

fn convert(el: &ElementNode) -> ContentNode {
    if el.name == IMAGE_TAG {
        return ContentNode::Image {
            src: el.attr("src").map(str::to_string),
        };
    }

    let style = if el.name == PARAGRAPH_TAG {
        el.attr("style")
            .filter(|s| !s.trim().is_empty())
            .map(parse_style)
    } else {
        None
    };

    let has_child_elements = el.children.iter().any(|c| matches!(c, Dom::Element(_)));
    let body = if has_child_elements {
        Body::Nodes(
            el.children
                .iter()
                .filter_map(|child| match child {
                    Dom::Text(t) if t.is_empty() => None,
                    Dom::Text(t) => Some(ContentNode::Text(t.clone())),
                    Dom::Element(inner) => Some(convert(inner)),
                })
                .collect(),
        )
    } else {
        Body::Text(el.inner_text())
    };

    ContentNode::Element {
        tag: el.name.clone(),
        style,
        body,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Dom {
    Text(String),
    Element(ElementNode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ElementNode {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Dom>,
}

impl ElementNode {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn inner_text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            match child {
                Dom::Text(t) => out.push_str(t),
                Dom::Element(el) => out.push_str(&el.inner_text()),
            }
        }
        out
    }

    fn push(&mut self, node: Dom) {
        push_merged(&mut self.children, node);
    }
}

fn push_merged(siblings: &mut Vec<Dom>, node: Dom) {
    if let (Some(Dom::Text(prev)), Dom::Text(next)) = (siblings.last_mut(), &node) {
        prev.push_str(next);
        return;
    }
    siblings.push(node);
}

fn attach(stack: &mut [ElementNode], roots: &mut Vec<Dom>, node: Dom) {
    match stack.last_mut() {
        Some(parent) => parent.push(node),
        None => push_merged(roots, node),
    }
}

fn build_tree(tokens: impl Iterator<Item = Token>) -> Vec<Dom> {
    let mut roots: Vec<Dom> = Vec::new();
    let mut stack: Vec<ElementNode> = Vec::new();
    // Open elements that were unwrapped for depth, innermost last.
    let mut unwrapped: Vec<String> = Vec::new();

    for token in tokens {
        match token {
            Token::Text(text) => {
                if !text.is_empty() {
                    attach(&mut stack, &mut roots, Dom::Text(text));
                }
            }
            Token::Start {
                name,
                attrs,
                self_closing,
            } => {
                let void = self_closing || VOID_ELEMENTS.contains(&name.as_str());
                if stack.len() >= MAX_DEPTH && !void {
                    unwrapped.push(name);
                    continue;
                }
                let el = ElementNode {
                    name,
                    attrs,
                    children: Vec::new(),
                };
                if void {
                    attach(&mut stack, &mut roots, Dom::Element(el));
                } else {
                    stack.push(el);
                }
            }
            Token::End { name } => {
                if let Some(pos) = unwrapped.iter().rposition(|n| *n == name) {
                    unwrapped.truncate(pos);
                    continue;
                }
                let Some(pos) = stack.iter().rposition(|el| el.name == name) else {
                    continue;
                };
                unwrapped.clear();
                while stack.len() > pos {
                    if let Some(el) = stack.pop() {
                        attach(&mut stack, &mut roots, Dom::Element(el));
                    }
                }
            }
        }
    }

    while let Some(el) = stack.pop() {
        attach(&mut stack, &mut roots, Dom::Element(el));
    }
    roots
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Text(String),
    Start {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    End {
        name: String,
    },
}

struct Tokenizer<'a> {
    src: &'a str,
    pos: usize,
    /// Set after a `<script>`/`<style>` start tag: the next token is its raw body.
    raw_text_for: Option<String>,
}

impl<'a> Tokenizer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            raw_text_for: None,
        }
    }

    fn bytes(&self) -> &'a [u8] {
        self.src.as_bytes()
    }

    fn skip_past(&mut self, needle: &str) {
        match self.src[self.pos..].find(needle) {
            Some(i) => self.pos += i + needle.len(),
            None => self.pos = self.src.len(),
        }
    }

    fn skip_whitespace(&mut self) {
        let b = self.bytes();
        while self.pos < b.len() && b[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn scan_until(&mut self, stop: impl Fn(u8) -> bool) -> &'a str {
        let src = self.src;
        let b = self.bytes();
        let start = self.pos;
        while self.pos < b.len() && !stop(b[self.pos]) {
            self.pos += 1;
        }
        &src[start..self.pos]
    }

    fn raw_text(&mut self, name: &str) -> Token {
        let closing = format!("</{name}");
        let rest = &self.src[self.pos..];
        let end = rest
            .to_ascii_lowercase()
            .find(&closing)
            .unwrap_or(rest.len());
        self.pos += end;
        Token::Text(rest[..end].to_string())
    }

    fn end_tag(&mut self) -> Option<Token> {
        // Positioned just after "</".
        let name = self
            .scan_until(|c| c.is_ascii_whitespace() || c == b'>')
            .to_ascii_lowercase();
        self.skip_past(">");
        if name.is_empty() {
            return None;
        }
        Some(Token::End { name })
    }

    fn start_tag(&mut self) -> Token {
        // Positioned on the first letter of the tag name.
        let name = self
            .scan_until(|c| c.is_ascii_whitespace() || c == b'/' || c == b'>')
            .to_ascii_lowercase();
        let mut attrs: Vec<(String, String)> = Vec::new();
        let mut self_closing = false;

        loop {
            self.skip_whitespace();
            let b = self.bytes();
            if self.pos >= b.len() {
                break;
            }
            match b[self.pos] {
                b'>' => {
                    self.pos += 1;
                    break;
                }
                b'/' => {
                    self.pos += 1;
                    if b.get(self.pos) == Some(&b'>') {
                        self.pos += 1;
                        self_closing = true;
                        break;
                    }
                    continue;
                }
                _ => {}
            }

            let attr_start = self.pos;
            self.pos += 1;
            self.scan_until(|c| c.is_ascii_whitespace() || c == b'=' || c == b'>' || c == b'/');
            let attr_name = self.src[attr_start..self.pos].to_ascii_lowercase();

            self.skip_whitespace();
            let mut value = String::new();
            if self.bytes().get(self.pos) == Some(&b'=') {
                self.pos += 1;
                self.skip_whitespace();
                match self.bytes().get(self.pos).copied() {
                    Some(q @ (b'"' | b'\'')) => {
                        self.pos += 1;
                        value = decode_entities(self.scan_until(|c| c == q));
                        if self.pos < self.src.len() {
                            self.pos += 1;
                        }
                    }
                    _ => {
                        value = decode_entities(
                            self.scan_until(|c| c.is_ascii_whitespace() || c == b'>'),
                        );
                    }
                }
            }
            if !attrs.iter().any(|(k, _)| *k == attr_name) {
                attrs.push((attr_name, value));
            }
        }

        if !self_closing && RAW_TEXT_ELEMENTS.contains(&name.as_str()) {
            self.raw_text_for = Some(name.clone());
        }
        Token::Start {
            name,
            attrs,
            self_closing,
        }
    }
}

impl Iterator for Tokenizer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        if let Some(name) = self.raw_text_for.take() {
            let token = self.raw_text(&name);
            if token != Token::Text(String::new()) {
                return Some(token);
            }
        }

        loop {
            if self.pos >= self.src.len() {
                return None;
            }
            let rest = &self.src[self.pos..];
            let Some(lt) = rest.find('<') else {
                self.pos = self.src.len();
                return Some(Token::Text(decode_entities(rest)));
            };
            if lt > 0 {
                self.pos += lt;
                return Some(Token::Text(decode_entities(&rest[..lt])));
            }

            let after = &rest[1..];
            if after.starts_with("!--") {
                self.pos += 4;
                self.skip_past("-->");
                continue;
            }
            if after.starts_with('!') || after.starts_with('?') {
                self.skip_past(">");
                continue;
            }
            if after.starts_with('/') {
                self.pos += 2;
                match self.end_tag() {
                    Some(token) => return Some(token),
                    None => continue,
                }
            }
            if after.starts_with(|c: char| c.is_ascii_alphabetic()) {
                self.pos += 1;
                return Some(self.start_tag());
            }

            // A '<' that opens no tag is literal text.
            self.pos += 1;
            return Some(Token::Text("<".to_string()));
        }
    }
}

fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        match decode_reference(rest) {
            Some((ch, consumed)) => {
                out.push(ch);
                rest = &rest[consumed..];
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

/// Decodes one `&name;` / `&#N;` / `&#xH;` at the start of `s`, returning the
/// character and the number of bytes consumed.
fn decode_reference(s: &str) -> Option<(char, usize)> {
    let (semi, _) = s.char_indices().take(12).find(|(_, c)| *c == ';')?;
    let body = &s[1..semi];
    let ch = match body {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        _ => {
            let num = body.strip_prefix('#')?;
            let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse::<u32>().ok()?,
            };
            char::from_u32(code)?
        }
    };
    Some((ch, semi + 1))
}
