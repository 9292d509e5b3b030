//! Block-style YAML store with comment preservation.
//!
//! This store backs the tree engine. It is intentionally not
//! surface-preserving: it parses a document into a tree of typed scalars,
//! mappings, sequences and comment nodes, and emits canonical block YAML at
//! a configured indent. Anchors, aliases, multi-line scalars and inline
//! comments are outside its grammar; the mangler rewrites those away
//! before input reaches the store.
//!
//! Emitter quirks relied upon by the demangler: bare keys come back as
//! `key: null`, `~` comes back as `null`, numeric-looking strings come
//! back quoted.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, SopsGitError};

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Scalar(Scalar),
    Map(Branch),
    Seq(Vec<Node>),
    /// Comment between sequence items; the string excludes the leading `#`.
    Comment(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// Comment between mapping entries; the string excludes the leading `#`.
    Comment(String),
    Pair { key: String, value: Node },
}

pub type Branch = Vec<Item>;

static RE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9_][A-Za-z0-9_.-]*):(?:[ \t]+|$)").unwrap());
static RE_QKEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^'((?:[^']|'')*)':(?:[ \t]+|$)").unwrap());
static RE_BARE_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").unwrap());
static RE_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?[0-9]+$").unwrap());
static RE_FLOAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?[0-9]*\.[0-9]+([eE][-+]?[0-9]+)?$").unwrap());

fn yaml_err(msg: impl Into<String>) -> SopsGitError {
    SopsGitError::Yaml(msg.into())
}

// ---------------------------------------------------------------------------
// parsing

struct Parser {
    lines: Vec<(usize, String)>,
    pos: usize,
}

/// Parse a document into its top-level branch. The root must be a mapping.
pub fn parse(text: &str) -> Result<Branch> {
    let mut lines = Vec::new();
    for raw in text.lines() {
        let trimmed = raw.trim_end();
        if trimmed.trim().is_empty() {
            continue;
        }
        if trimmed == "---" || trimmed == "..." {
            continue;
        }
        let indent = trimmed.len() - trimmed.trim_start().len();
        lines.push((indent, trimmed.trim_start().to_string()));
    }
    let mut p = Parser { lines, pos: 0 };
    if p.lines.is_empty() {
        return Ok(Vec::new());
    }
    let root_indent = p.lines[0].0;
    let node = p.parse_block(root_indent)?;
    if p.pos < p.lines.len() {
        return Err(yaml_err(format!(
            "unexpected content: {:?}",
            p.lines[p.pos].1
        )));
    }
    match node {
        Node::Map(branch) => Ok(branch),
        _ => Err(yaml_err("top-level node must be a mapping")),
    }
}

impl Parser {
    fn peek(&self) -> Option<&(usize, String)> {
        self.lines.get(self.pos)
    }

    /// Look past comments for the line that decides the container kind.
    fn peek_significant(&self) -> Option<(usize, String)> {
        self.lines[self.pos..]
            .iter()
            .find(|(_, t)| !t.starts_with('#'))
            .cloned()
    }

    fn parse_block(&mut self, indent: usize) -> Result<Node> {
        match self.peek_significant() {
            Some((_, text)) if text == "-" || text.starts_with("- ") => {
                Ok(Node::Seq(self.parse_seq(indent)?))
            }
            _ => Ok(Node::Map(self.parse_map(indent)?)),
        }
    }

    fn parse_map(&mut self, indent: usize) -> Result<Branch> {
        let mut branch = Vec::new();
        while let Some((line_indent, text)) = self.peek().cloned() {
            if line_indent < indent {
                break;
            }
            if line_indent > indent {
                return Err(yaml_err(format!("bad indentation at {text:?}")));
            }
            if let Some(comment) = text.strip_prefix('#') {
                branch.push(Item::Comment(comment.to_string()));
                self.pos += 1;
                continue;
            }
            let (key, rest) = split_key(&text)
                .ok_or_else(|| yaml_err(format!("expected mapping key at {text:?}")))?;
            self.pos += 1;
            let value = if rest.is_empty() {
                self.parse_nested_value(indent)?
            } else {
                parse_flow_or_scalar(&rest)?
            };
            branch.push(Item::Pair { key, value });
        }
        Ok(branch)
    }

    /// Value of a `key:` line with nothing after the colon.
    fn parse_nested_value(&mut self, indent: usize) -> Result<Node> {
        match self.peek_significant() {
            Some((child_indent, _)) if child_indent > indent => self.parse_block(child_indent),
            // a sequence may sit at the same indent as its key
            Some((child_indent, text))
                if child_indent == indent && (text == "-" || text.starts_with("- ")) =>
            {
                Ok(Node::Seq(self.parse_seq(indent)?))
            }
            _ => Ok(Node::Scalar(Scalar::Null)),
        }
    }

    fn parse_seq(&mut self, indent: usize) -> Result<Vec<Node>> {
        let mut items = Vec::new();
        while let Some((line_indent, text)) = self.peek().cloned() {
            if line_indent < indent {
                break;
            }
            if let Some(comment) = text.strip_prefix('#') {
                if line_indent != indent {
                    break;
                }
                items.push(Node::Comment(comment.to_string()));
                self.pos += 1;
                continue;
            }
            if line_indent > indent {
                return Err(yaml_err(format!("bad indentation at {text:?}")));
            }
            if text == "-" {
                self.pos += 1;
                let item = match self.peek_significant() {
                    Some((child_indent, _)) if child_indent > indent => {
                        self.parse_block(child_indent)?
                    }
                    _ => Node::Scalar(Scalar::Null),
                };
                items.push(item);
                continue;
            }
            let Some(rest) = text.strip_prefix("- ") else {
                break;
            };
            let rest = rest.trim_start();
            // re-enter the grammar with the dash stripped; nested content
            // lines already sit two columns deeper
            if rest == "-" || rest.starts_with("- ") || split_key(rest).is_some() {
                self.lines[self.pos] = (line_indent + 2, rest.to_string());
                items.push(self.parse_block(line_indent + 2)?);
            } else {
                self.pos += 1;
                items.push(parse_flow_or_scalar(rest)?);
            }
        }
        Ok(items)
    }
}

fn split_key(text: &str) -> Option<(String, String)> {
    if let Some(caps) = RE_KEY.captures(text) {
        let key = caps[1].to_string();
        let rest = text[caps.get(0).unwrap().end()..].to_string();
        return Some((key, rest));
    }
    if let Some(caps) = RE_QKEY.captures(text) {
        let key = caps[1].replace("''", "'");
        let rest = text[caps.get(0).unwrap().end()..].to_string();
        return Some((key, rest));
    }
    None
}

fn parse_flow_or_scalar(text: &str) -> Result<Node> {
    let text = text.trim();
    if text.starts_with('[') || text.starts_with('{') {
        let chars: Vec<char> = text.chars().collect();
        let mut pos = 0;
        let node = parse_flow(&chars, &mut pos)?;
        // tolerate a trailing comment after the closing bracket
        let tail: String = chars[pos..].iter().collect();
        let tail = tail.trim();
        if !tail.is_empty() && !tail.starts_with('#') {
            return Err(yaml_err(format!("trailing content after flow value: {tail:?}")));
        }
        return Ok(node);
    }
    Ok(Node::Scalar(parse_scalar(text)?))
}

fn parse_scalar(text: &str) -> Result<Scalar> {
    if let Some(stripped) = text.strip_prefix('\'') {
        let (value, used) = read_single_quoted(stripped)?;
        check_scalar_tail(&stripped[used..])?;
        return Ok(Scalar::Str(value));
    }
    if let Some(stripped) = text.strip_prefix('"') {
        let (value, used) = read_double_quoted(stripped)?;
        check_scalar_tail(&stripped[used..])?;
        return Ok(Scalar::Str(value));
    }
    // plain scalar: a ` #` starts a trailing comment
    let mut plain = text;
    if let Some(idx) = plain.find(" #") {
        plain = &plain[..idx];
    }
    let plain = plain.trim();
    Ok(plain_scalar(plain))
}

fn plain_scalar(plain: &str) -> Scalar {
    match plain {
        "" | "null" | "~" => return Scalar::Null,
        "true" => return Scalar::Bool(true),
        "false" => return Scalar::Bool(false),
        _ => {}
    }
    if RE_INT.is_match(plain) && !has_leading_zero(plain) {
        if let Ok(n) = plain.parse::<i64>() {
            return Scalar::Int(n);
        }
    }
    if RE_FLOAT.is_match(plain) {
        if let Ok(f) = plain.parse::<f64>() {
            return Scalar::Float(f);
        }
    }
    Scalar::Str(plain.to_string())
}

fn has_leading_zero(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    digits.len() > 1 && digits.starts_with('0')
}

fn check_scalar_tail(tail: &str) -> Result<()> {
    let tail = tail.trim();
    if tail.is_empty() || tail.starts_with('#') {
        Ok(())
    } else {
        Err(yaml_err(format!("trailing content after scalar: {tail:?}")))
    }
}

/// Read a single-quoted body (after the opening quote); returns the value
/// and the number of chars consumed including the closing quote.
fn read_single_quoted(s: &str) -> Result<(String, usize)> {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\'' {
            if i + 1 < chars.len() && chars[i + 1] == '\'' {
                out.push('\'');
                i += 2;
                continue;
            }
            return Ok((out, byte_len(&chars[..=i])));
        }
        out.push(chars[i]);
        i += 1;
    }
    Err(yaml_err("unterminated single-quoted scalar"))
}

fn read_double_quoted(s: &str) -> Result<(String, usize)> {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '"' => return Ok((out, byte_len(&chars[..=i]))),
            '\\' if i + 1 < chars.len() => {
                out.push(match chars[i + 1] {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    c => c,
                });
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(yaml_err("unterminated double-quoted scalar"))
}

fn byte_len(chars: &[char]) -> usize {
    chars.iter().map(|c| c.len_utf8()).sum()
}

fn parse_flow(chars: &[char], pos: &mut usize) -> Result<Node> {
    skip_spaces(chars, pos);
    match chars.get(*pos) {
        Some('[') => {
            *pos += 1;
            let mut items = Vec::new();
            loop {
                skip_spaces(chars, pos);
                if chars.get(*pos) == Some(&']') {
                    *pos += 1;
                    return Ok(Node::Seq(items));
                }
                items.push(parse_flow(chars, pos)?);
                skip_spaces(chars, pos);
                match chars.get(*pos) {
                    Some(',') => *pos += 1,
                    Some(']') => {}
                    _ => return Err(yaml_err("expected ',' or ']' in flow sequence")),
                }
            }
        }
        Some('{') => {
            *pos += 1;
            let mut branch = Vec::new();
            loop {
                skip_spaces(chars, pos);
                if chars.get(*pos) == Some(&'}') {
                    *pos += 1;
                    return Ok(Node::Map(branch));
                }
                let key = parse_flow_key(chars, pos)?;
                skip_spaces(chars, pos);
                if chars.get(*pos) != Some(&':') {
                    return Err(yaml_err("expected ':' in flow mapping"));
                }
                *pos += 1;
                let value = parse_flow(chars, pos)?;
                branch.push(Item::Pair { key, value });
                skip_spaces(chars, pos);
                match chars.get(*pos) {
                    Some(',') => *pos += 1,
                    Some('}') => {}
                    _ => return Err(yaml_err("expected ',' or '}' in flow mapping")),
                }
            }
        }
        Some('\'') => {
            *pos += 1;
            let rest: String = chars[*pos..].iter().collect();
            let (value, used) = read_single_quoted(&rest)?;
            *pos += rest[..used].chars().count();
            Ok(Node::Scalar(Scalar::Str(value)))
        }
        Some('"') => {
            *pos += 1;
            let rest: String = chars[*pos..].iter().collect();
            let (value, used) = read_double_quoted(&rest)?;
            *pos += rest[..used].chars().count();
            Ok(Node::Scalar(Scalar::Str(value)))
        }
        Some(_) => {
            let start = *pos;
            while let Some(&c) = chars.get(*pos) {
                if c == ',' || c == ']' || c == '}' {
                    break;
                }
                *pos += 1;
            }
            let text: String = chars[start..*pos].iter().collect();
            Ok(Node::Scalar(plain_scalar(text.trim())))
        }
        None => Err(yaml_err("unexpected end of flow value")),
    }
}

fn parse_flow_key(chars: &[char], pos: &mut usize) -> Result<String> {
    skip_spaces(chars, pos);
    if chars.get(*pos) == Some(&'\'') {
        *pos += 1;
        let rest: String = chars[*pos..].iter().collect();
        let (value, used) = read_single_quoted(&rest)?;
        *pos += rest[..used].chars().count();
        return Ok(value);
    }
    let start = *pos;
    while let Some(&c) = chars.get(*pos) {
        if c == ':' || c == ',' || c == '}' {
            break;
        }
        *pos += 1;
    }
    let key: String = chars[start..*pos].iter().collect();
    let key = key.trim().to_string();
    if key.is_empty() {
        return Err(yaml_err("empty key in flow mapping"));
    }
    Ok(key)
}

fn skip_spaces(chars: &[char], pos: &mut usize) {
    while chars.get(*pos).is_some_and(|c| *c == ' ' || *c == '\t') {
        *pos += 1;
    }
}

// ---------------------------------------------------------------------------
// emitting

/// Emit the branch as canonical block YAML.
pub fn emit(branch: &Branch, indent_width: usize) -> String {
    let mut out = String::new();
    emit_map(branch, 0, indent_width, &mut out);
    out
}

fn pad(n: usize) -> String {
    " ".repeat(n)
}

fn emit_map(branch: &Branch, indent: usize, width: usize, out: &mut String) {
    for item in branch {
        match item {
            Item::Comment(text) => {
                out.push_str(&pad(indent));
                out.push('#');
                out.push_str(text);
                out.push('\n');
            }
            Item::Pair { key, value } => {
                let key_str = emit_key(key);
                match value {
                    Node::Scalar(s) => {
                        out.push_str(&format!("{}{}: {}\n", pad(indent), key_str, emit_scalar(s)));
                    }
                    Node::Map(b) if b.is_empty() => {
                        out.push_str(&format!("{}{}: {{}}\n", pad(indent), key_str));
                    }
                    Node::Seq(s) if s.is_empty() => {
                        out.push_str(&format!("{}{}: []\n", pad(indent), key_str));
                    }
                    Node::Map(b) => {
                        out.push_str(&format!("{}{}:\n", pad(indent), key_str));
                        emit_map(b, indent + width, width, out);
                    }
                    Node::Seq(s) => {
                        out.push_str(&format!("{}{}:\n", pad(indent), key_str));
                        emit_seq(s, indent + width, width, out);
                    }
                    Node::Comment(_) => {}
                }
            }
        }
    }
}

fn emit_seq(items: &[Node], indent: usize, width: usize, out: &mut String) {
    for item in items {
        match item {
            Node::Comment(text) => {
                out.push_str(&pad(indent));
                out.push('#');
                out.push_str(text);
                out.push('\n');
            }
            Node::Scalar(s) => {
                out.push_str(&format!("{}- {}\n", pad(indent), emit_scalar(s)));
            }
            Node::Map(b) if b.is_empty() => {
                out.push_str(&format!("{}- {{}}\n", pad(indent)));
            }
            Node::Seq(s) if s.is_empty() => {
                out.push_str(&format!("{}- []\n", pad(indent)));
            }
            container => {
                let mut body = String::new();
                match container {
                    Node::Map(b) => emit_map(b, indent + 2, width, &mut body),
                    Node::Seq(s) => emit_seq(s, indent + 2, width, &mut body),
                    _ => unreachable!(),
                }
                let mut lines = body.lines();
                if let Some(first) = lines.next() {
                    if first.trim_start().starts_with('#') {
                        // keep a leading comment under a bare dash
                        out.push_str(&format!("{}-\n{}", pad(indent), body));
                    } else {
                        out.push_str(&format!("{}- {}\n", pad(indent), first.trim_start()));
                        for line in lines {
                            out.push_str(line);
                            out.push('\n');
                        }
                    }
                }
            }
        }
    }
}

fn emit_key(key: &str) -> String {
    if RE_BARE_KEY.is_match(key) {
        key.to_string()
    } else {
        format!("'{}'", key.replace('\'', "''"))
    }
}

pub fn emit_scalar(s: &Scalar) -> String {
    match s {
        Scalar::Null => "null".to_string(),
        Scalar::Bool(b) => b.to_string(),
        Scalar::Int(n) => n.to_string(),
        Scalar::Float(f) => {
            let text = f.to_string();
            if text.contains('.') || text.contains('e') || text.contains("inf") || text.contains("NaN") {
                text
            } else {
                format!("{text}.0")
            }
        }
        Scalar::Str(s) => quote_string(s),
    }
}

fn quote_string(s: &str) -> String {
    if s.is_empty() {
        return "\"\"".to_string();
    }
    if s.contains('\n') || s.chars().any(|c| c.is_control()) {
        let escaped = s
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('\n', "\\n")
            .replace('\t', "\\t")
            .replace('\r', "\\r");
        return format!("\"{escaped}\"");
    }
    if needs_quoting(s) {
        return format!("'{}'", s.replace('\'', "''"));
    }
    s.to_string()
}

fn needs_quoting(s: &str) -> bool {
    if matches!(s, "null" | "~" | "true" | "false") {
        return true;
    }
    if RE_INT.is_match(s) || RE_FLOAT.is_match(s) {
        return true;
    }
    let first = s.chars().next().unwrap();
    if "&*!|>%@`\"'#[{,".contains(first) {
        return true;
    }
    if s == "-" || s.starts_with("- ") || s.starts_with(": ") || s.ends_with(':') {
        return true;
    }
    if s.contains(": ") || s.contains(" #") {
        return true;
    }
    s.starts_with(' ') || s.ends_with(' ') || s.starts_with('\t') || s.ends_with('\t')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reparse(text: &str) -> String {
        emit(&parse(text).unwrap(), 2)
    }

    #[test]
    fn parses_nested_maps_and_seqs() {
        let doc = "db:\n  host: localhost\n  ports:\n    - 5432\n    - 5433\nname: test\n";
        assert_eq!(reparse(doc), doc);
    }

    #[test]
    fn preserves_comments() {
        let doc = "# head\nkey: value\n# between\nother: 1\n";
        assert_eq!(reparse(doc), doc);
    }

    #[test]
    fn typed_scalars() {
        let branch = parse("a: 1\nb: 1.5\nc: true\nd: null\ne: text\n").unwrap();
        let values: Vec<_> = branch
            .iter()
            .filter_map(|i| match i {
                Item::Pair { value: Node::Scalar(s), .. } => Some(s.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            values,
            vec![
                Scalar::Int(1),
                Scalar::Float(1.5),
                Scalar::Bool(true),
                Scalar::Null,
                Scalar::Str("text".into())
            ]
        );
    }

    #[test]
    fn bare_key_round_trips_as_null() {
        assert_eq!(reparse("key:\n"), "key: null\n");
    }

    #[test]
    fn numeric_strings_stay_quoted() {
        assert_eq!(reparse("a: '0123'\n"), "a: '0123'\n");
        assert_eq!(reparse("b: '42'\n"), "b: '42'\n");
    }

    #[test]
    fn flow_collections_are_normalized() {
        let out = reparse("a: [1, 2]\nb: {x: 1}\n");
        assert_eq!(out, "a:\n  - 1\n  - 2\nb:\n  x: 1\n");
    }

    #[test]
    fn empty_collections_stay_inline() {
        assert_eq!(reparse("a: []\nb: {}\n"), "a: []\nb: {}\n");
    }

    #[test]
    fn seq_of_maps() {
        let doc = "servers:\n  - host: a\n    port: 1\n  - host: b\n    port: 2\n";
        assert_eq!(reparse(doc), doc);
    }

    #[test]
    fn quoted_keys() {
        let doc = "'key,with%chars': value\n";
        assert_eq!(reparse(doc), doc);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("<<<<<<< CURRENT\nkey: 1\n").is_err());
    }

    #[test]
    fn empty_string_double_quoted() {
        assert_eq!(reparse("a: ''\n"), "a: \"\"\n");
    }
}
