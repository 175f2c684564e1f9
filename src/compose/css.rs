//! CSS rewriting for Kindle output.
//!
//! A minimal stream scanner, not a parser: it tracks comment/string state,
//! block nesting, and at-rule preludes, and applies declaration-level
//! transforms inside declaration blocks. In namespaced mode, `#id`
//! selectors outside declaration blocks are prefixed with the chapter id.
//! Color literals are never touched because `#` inside a declaration block
//! is left alone.

use regex_lite::Regex;

/// Transform a stylesheet without selector namespacing.
pub fn transform_global(css: &str) -> String {
    Scanner::new(css, None).run()
}

/// Transform a stylesheet, prefixing `#id` selectors with `chapter_id`.
pub fn transform_namespaced(css: &str, chapter_id: &str) -> String {
    Scanner::new(css, Some(chapter_id)).run()
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
    chapter: Option<&'a str>,
    out: String,
}

impl<'a> Scanner<'a> {
    fn new(css: &'a str, chapter: Option<&'a str>) -> Self {
        Self {
            bytes: css.as_bytes(),
            pos: 0,
            chapter,
            out: String::with_capacity(css.len()),
        }
    }

    fn run(mut self) -> String {
        self.statements(0);
        self.out
    }

    /// Statement context: selectors, at-rules, comments. `depth` > 0 when
    /// inside an at-rule block.
    fn statements(&mut self, depth: usize) {
        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];
            match b {
                b'}' => {
                    if depth > 0 {
                        return; // caller consumes the brace
                    }
                    // Stray close brace at the top level; keep it
                    self.out.push('}');
                    self.pos += 1;
                }
                b'/' if self.peek(1) == Some(b'*') => self.copy_comment(),
                b'@' => self.at_rule(depth),
                _ if b.is_ascii_whitespace() => {
                    self.out.push(b as char);
                    self.pos += 1;
                }
                _ => self.qualified_rule(),
            }
        }
    }

    /// `@name prelude;` or `@name prelude { ... }`. The prelude is copied
    /// verbatim; `#` tokens inside it are never rewritten.
    fn at_rule(&mut self, depth: usize) {
        let start = self.pos;
        self.pos += 1; // '@'
        let name_start = self.pos;
        while self.pos < self.bytes.len() && is_ident_byte(self.bytes[self.pos]) {
            self.pos += 1;
        }
        let name = String::from_utf8_lossy(&self.bytes[name_start..self.pos]).to_lowercase();

        // Prelude, verbatim
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'/' if self.peek(1) == Some(b'*') => self.skip_comment_raw(),
                b'"' | b'\'' => self.skip_string_raw(),
                b'{' | b';' => break,
                _ => self.pos += 1,
            }
        }
        self.out
            .push_str(&String::from_utf8_lossy(&self.bytes[start..self.pos]));

        if self.pos >= self.bytes.len() {
            return;
        }
        if self.bytes[self.pos] == b';' {
            self.out.push(';');
            self.pos += 1;
            return;
        }

        // Block at-rule
        self.out.push('{');
        self.pos += 1;
        if nested_rule_at_rule(&name) {
            self.statements(depth + 1);
        } else {
            // @font-face, @page and friends hold declarations
            let inner = self.take_block_inner();
            self.out.push_str(&transform_declarations(&inner));
        }
        if self.pos < self.bytes.len() && self.bytes[self.pos] == b'}' {
            self.out.push('}');
            self.pos += 1;
        }
    }

    /// Selector + declaration block.
    fn qualified_rule(&mut self) {
        // Selector text: emitted as-is apart from #id namespacing
        let mut seg_start = self.pos;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'{' | b'}' | b';' => break,
                b'/' if self.peek(1) == Some(b'*') => {
                    self.flush(seg_start);
                    self.copy_comment();
                    seg_start = self.pos;
                }
                b'"' | b'\'' => {
                    self.flush(seg_start);
                    self.copy_string();
                    seg_start = self.pos;
                }
                b'#' => {
                    self.flush(seg_start);
                    self.copy_id_selector();
                    seg_start = self.pos;
                }
                _ => self.pos += 1,
            }
        }
        self.flush(seg_start);
        if self.pos >= self.bytes.len() {
            return;
        }
        match self.bytes[self.pos] {
            b';' | b'}' => {
                // Malformed statement; pass the terminator through
                self.out.push(self.bytes[self.pos] as char);
                self.pos += 1;
            }
            b'{' => {
                self.out.push('{');
                self.pos += 1;
                let inner = self.take_block_inner();
                self.out.push_str(&transform_declarations(&inner));
                if self.pos < self.bytes.len() && self.bytes[self.pos] == b'}' {
                    self.out.push('}');
                    self.pos += 1;
                }
            }
            _ => unreachable!(),
        }
    }

    /// Consume up to (not including) the matching `}` and return the raw
    /// inner text of a declaration block.
    fn take_block_inner(&mut self) -> String {
        let start = self.pos;
        let mut depth = 0usize;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'/' if self.peek(1) == Some(b'*') => self.skip_comment_raw(),
                b'"' | b'\'' => self.skip_string_raw(),
                b'{' => {
                    depth += 1;
                    self.pos += 1;
                }
                b'}' => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                    self.pos += 1;
                }
                _ => self.pos += 1,
            }
        }
        String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned()
    }

    /// `#ident` in selector position; namespaced when in chapter mode.
    fn copy_id_selector(&mut self) {
        self.pos += 1; // '#'
        let start = self.pos;
        if self.pos < self.bytes.len() && is_ident_start(self.bytes[self.pos]) {
            self.pos += 1;
            while self.pos < self.bytes.len() && is_ident_byte(self.bytes[self.pos]) {
                self.pos += 1;
            }
        }
        let ident = String::from_utf8_lossy(&self.bytes[start..self.pos]);
        match (self.chapter, ident.is_empty()) {
            (Some(chapter), false) => {
                self.out.push('#');
                self.out.push_str(chapter);
                self.out.push('-');
                self.out.push_str(&ident);
            }
            _ => {
                self.out.push('#');
                self.out.push_str(&ident);
            }
        }
    }

    /// Emit `bytes[start..pos]` verbatim.
    fn flush(&mut self, start: usize) {
        if start < self.pos {
            self.out
                .push_str(&String::from_utf8_lossy(&self.bytes[start..self.pos]));
        }
    }

    fn copy_comment(&mut self) {
        let start = self.pos;
        self.skip_comment_raw();
        self.out
            .push_str(&String::from_utf8_lossy(&self.bytes[start..self.pos]));
    }

    fn skip_comment_raw(&mut self) {
        self.pos += 2; // '/*'
        while self.pos < self.bytes.len() {
            if self.bytes[self.pos] == b'*' && self.peek(1) == Some(b'/') {
                self.pos += 2;
                return;
            }
            self.pos += 1;
        }
    }

    fn copy_string(&mut self) {
        let start = self.pos;
        self.skip_string_raw();
        self.out
            .push_str(&String::from_utf8_lossy(&self.bytes[start..self.pos]));
    }

    fn skip_string_raw(&mut self) {
        let quote = self.bytes[self.pos];
        self.pos += 1;
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b'\\' => self.pos += 2,
                b if b == quote => {
                    self.pos += 1;
                    return;
                }
                _ => self.pos += 1,
            }
        }
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }
}

/// At-rules whose block contains nested rules rather than declarations.
fn nested_rule_at_rule(name: &str) -> bool {
    matches!(name, "media" | "supports" | "document" | "keyframes")
        || name.ends_with("keyframes")
        || name.ends_with("document")
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// Rewrite the declarations of one block, dropping what Kindle does not
/// honour and converting absolute lengths to em. Output is normalised to
/// `{ prop: value; prop: value }` spacing.
fn transform_declarations(inner: &str) -> String {
    let mut kept: Vec<String> = Vec::new();
    for chunk in split_declarations(inner) {
        let (comments, core) = split_leading_comments(chunk);
        if let Some(comments) = comments {
            kept.push(comments);
        }
        let core = core.trim();
        if core.is_empty() {
            continue;
        }
        let (prop, value) = match core.split_once(':') {
            Some((p, v)) => (p.trim(), v.trim()),
            None => {
                kept.push(core.to_string());
                continue;
            }
        };
        if let Some(decl) = transform_declaration(prop, value) {
            kept.push(decl);
        }
    }
    if kept.is_empty() {
        String::new()
    } else {
        format!(" {} ", kept.join("; "))
    }
}

/// Split block content on `;` outside strings, comments, and parens.
fn split_declarations(inner: &str) -> Vec<&str> {
    let bytes = inner.as_bytes();
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut pos = 0;
    let mut paren = 0usize;
    while pos < bytes.len() {
        match bytes[pos] {
            b'/' if bytes.get(pos + 1) == Some(&b'*') => {
                pos += 2;
                while pos < bytes.len() {
                    if bytes[pos] == b'*' && bytes.get(pos + 1) == Some(&b'/') {
                        pos += 2;
                        break;
                    }
                    pos += 1;
                }
            }
            q @ (b'"' | b'\'') => {
                pos += 1;
                while pos < bytes.len() {
                    match bytes[pos] {
                        b'\\' => pos += 2,
                        b if b == q => {
                            pos += 1;
                            break;
                        }
                        _ => pos += 1,
                    }
                }
            }
            b'(' => {
                paren += 1;
                pos += 1;
            }
            b')' => {
                paren = paren.saturating_sub(1);
                pos += 1;
            }
            b';' if paren == 0 => {
                chunks.push(&inner[start..pos]);
                pos += 1;
                start = pos;
            }
            _ => pos += 1,
        }
    }
    if start < inner.len() {
        chunks.push(&inner[start..]);
    }
    chunks
}

/// Peel `/* ... */` comments off the front of a declaration chunk.
fn split_leading_comments(chunk: &str) -> (Option<String>, &str) {
    let mut rest = chunk.trim_start();
    let mut comments = String::new();
    while rest.starts_with("/*") {
        match rest.find("*/") {
            Some(end) => {
                comments.push_str(&rest[..end + 2]);
                rest = rest[end + 2..].trim_start();
            }
            None => {
                comments.push_str(rest);
                rest = "";
            }
        }
    }
    if comments.is_empty() {
        (None, chunk)
    } else {
        (Some(comments), rest)
    }
}

/// Properties preserved verbatim, vendor prefixes included.
fn is_vertical_or_ruby(base: &str) -> bool {
    base == "writing-mode"
        || base == "text-orientation"
        || base == "text-combine-upright"
        || base.starts_with("text-emphasis")
        || base == "ruby-position"
}

fn transform_declaration(prop: &str, value: &str) -> Option<String> {
    let lower = prop.to_ascii_lowercase();
    let base = lower
        .strip_prefix("-epub-")
        .or_else(|| lower.strip_prefix("-webkit-"))
        .unwrap_or(&lower);

    if is_vertical_or_ruby(base) {
        return Some(format!("{}: {}", prop, value));
    }

    if base == "position" {
        let v = value.to_ascii_lowercase();
        if v == "fixed" || v == "absolute" {
            return None;
        }
        return Some(format!("{}: {}", prop, value));
    }

    if base == "transform"
        || base == "transition"
        || base.starts_with("transition-")
        || base.starts_with("animation")
    {
        return None;
    }

    if (base == "margin" || base.starts_with("margin-")) && has_negative_length(value) {
        return None;
    }

    Some(format!("{}: {}", prop, convert_lengths(value)))
}

fn has_negative_length(value: &str) -> bool {
    let re = Regex::new(r"-(\d+\.?\d*|\.\d+)\s*(px|pt|em|rem|ex|ch|vw|vh|cm|mm|in|pc|%)").unwrap();
    re.is_match(value)
}

/// `Npx` → `(N/16)em`, `Npt` → `(N/12)em`.
fn convert_lengths(value: &str) -> String {
    let re = Regex::new(r"(\d+\.?\d*|\.\d+)(px|pt)\b").unwrap();
    let mut out = String::with_capacity(value.len());
    let mut last = 0;
    for caps in re.captures_iter(value) {
        let whole = caps.get(0).unwrap();
        let number: f64 = caps[1].parse().unwrap_or(0.0);
        let divisor = if &caps[2] == "px" { 16.0 } else { 12.0 };
        out.push_str(&value[last..whole.start()]);
        out.push_str(&format_em(number / divisor));
        out.push_str("em");
        last = whole.end();
    }
    out.push_str(&value[last..]);
    out
}

/// Render an em value, trailing-zero free (`1` not `1.0`).
fn format_em(v: f64) -> String {
    let rounded = (v * 10000.0).round() / 10000.0;
    format!("{}", rounded)
}
