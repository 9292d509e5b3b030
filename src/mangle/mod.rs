//! Format-preserving YAML mangling.
//!
//! The tree engine is not surface-preserving: it loses stream markers,
//! blank lines, quoting style, inline comments, anchors and multi-line
//! strings. Before a document goes through the engine, the mangler
//! annotates it with sentinel comments that carry enough information to
//! reconstruct the original lexical form afterwards; the demangler
//! consumes those sentinels on the way out.
//!
//! Each transformation class has a one-character mark embedded in a
//! sentinel comment placed directly above the affected line. Stream
//! markers and blank lines are wrapped in place instead.

mod comments;
mod decode;
mod encode;
mod multiline;

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::trace;

use crate::error::{Result, SopsGitError};

pub const MANGLE_START: &str = "#⋞";
pub const MANGLE_END: &str = "⋟";
pub const MANGLE_BLANK: &str = "#⋞⋟";
pub const MANGLE_NEWLINE: &str = "⋚⋛";
pub const MANGLE_COMMENT: &str = crate::engine::ENCRYPTED_COMMENT_TAG;

pub const MANGLE_ALL: &str = "anchor,astr,bare,blank,incom,inval,pipe,qstr,stream,tilde,znum";
const ALL_MANGLE_KEYS: &str = r#"-_:~"'0@#*|"#;

fn key_to_opt(key: char) -> Option<&'static str> {
    Some(match key {
        '-' => "stream",
        '_' => "blank",
        ':' => "bare",
        '~' => "tilde",
        '"' => "qstr",
        '\'' => "astr",
        '0' => "znum",
        '@' => "inval",
        '#' => "incom",
        '*' => "anchor",
        '|' => "pipe",
        _ => return None,
    })
}

fn opt_to_key(opt: &str) -> Option<char> {
    Some(match opt {
        "stream" | "stream-mark" => '-',
        "blank" | "blank-line" => '_',
        "bare" | "bare-key" => ':',
        "tilde" | "tilde-null" => '~',
        "qstr" | "quoted-string" => '"',
        "astr" | "apos-string" => '\'',
        "znum" | "zero-number" => '0',
        "inval" | "inline-value" => '@',
        "incom" | "inline-comment" => '#',
        "anchor" => '*',
        "pipe" | "multiline-pipe" => '|',
        _ => return None,
    })
}

/// Which mark classes are active, plus the comment-encryption policy.
#[derive(Debug, Clone, Default)]
pub struct MangleOptions {
    flags: BTreeSet<char>,
    pub encrypted_comment_suffix: String,
    pub encrypted_comment_prefix: String,
    pub indent: usize,
}

impl MangleOptions {
    pub fn new(flag_string: &str, comment_suffix: &str, comment_prefix: &str) -> Result<Self> {
        let mut opts = Self {
            flags: BTreeSet::new(),
            encrypted_comment_suffix: comment_suffix.to_string(),
            encrypted_comment_prefix: comment_prefix.to_string(),
            indent: 2,
        };
        let value = match flag_string {
            "all" | "true" => MANGLE_ALL,
            "none" | "false" | "" => return Ok(opts),
            other => other,
        };
        for opt in value.split(',') {
            let opt = opt.trim();
            let name = opt.trim_end_matches('s'); // handle plurals
            let key = if name.chars().count() > 1 {
                opt_to_key(name)
            } else {
                name.chars().next().filter(|c| ALL_MANGLE_KEYS.contains(*c))
            };
            let key = key
                .ok_or_else(|| SopsGitError::Other(format!("invalid styling option {opt:?}")))?;
            opts.flags.insert(key);
        }
        Ok(opts)
    }

    pub fn is_none(&self) -> bool {
        self.flags.is_empty()
    }

    pub(crate) fn flag(&self, key: char) -> bool {
        self.flags.contains(&key)
    }

    /// Canonical flag string for persisting in git config.
    pub fn flag_string(&self) -> String {
        if self.is_none() {
            return "false".to_string();
        }
        let mut options: Vec<&str> = self.flags.iter().filter_map(|k| key_to_opt(*k)).collect();
        options.sort_unstable();
        let value = options.join(",");
        if value == MANGLE_ALL {
            "true".to_string()
        } else if value.is_empty() {
            "false".to_string()
        } else {
            value
        }
    }

    fn should_mangle(&self, path: &str, buf: &[u8]) -> bool {
        if self.is_none() || buf.is_empty() {
            return false;
        }
        is_yaml_path(path)
    }

    /// Annotate a document so the engine round trip becomes reversible.
    pub fn mangle(&self, buf: &[u8], path: &str, encrypting: bool) -> Vec<u8> {
        if !self.should_mangle(path, buf) {
            return buf.to_vec();
        }
        let mut m = Mangler::new(buf, self, encrypting);
        m.trace("source");
        m.collect_indent();
        if self.flag('#') {
            m.split_inline_comments();
        }
        if self.flag('|') {
            m.merge_multiline_pipes();
        }
        m.mark_encrypted_comments();
        let mut sops_block = false;
        for idx in 0..m.lines.len() {
            let special = m.mangle_special_line(idx, sops_block);
            if special || sops_block {
                continue;
            }
            if m.lines[idx] == "sops:" {
                sops_block = true;
                continue;
            }
            m.mark_inline_features(idx);
        }
        m.trace("mangling");
        m.bytes()
    }

    /// Undo the annotations after an engine round trip.
    pub fn demangle(&self, buf: &[u8], path: &str, encrypting: bool) -> Result<Vec<u8>> {
        if !self.should_mangle(path, buf) {
            return Ok(buf.to_vec());
        }
        let text = String::from_utf8_lossy(buf);
        if !text.contains(MANGLE_START) {
            return Ok(buf.to_vec());
        }
        let mut m = Mangler::new(buf, self, encrypting);
        m.trace("demangling");
        m.run_demangle()?;
        m.trace("result");
        Ok(m.bytes())
    }
}

pub fn is_yaml_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".yaml") || lower.ends_with(".yml")
}

// line grammar shared by encode and decode
pub(crate) const PAT_KEY_ONLY: &str =
    r"^(\s*[a-zA-Z0-9_][a-zA-Z0-9_.-]*:|\s*'[a-zA-Z0-9_.,@%$-]+':)";
pub(crate) const PAT_KEY_ITEM: &str =
    r"^(\s*(?:- )*(?:-|[a-zA-Z0-9_][a-zA-Z0-9_.-]*:|'[a-zA-Z0-9_.,@%$-]+':))\s+";
pub(crate) const PAT_ANCHOR: &str = r"([A-Za-z_][A-Za-z_0-9]*)";

macro_rules! line_re {
    ($name:ident, $($pat:expr),+) => {
        pub(crate) static $name: Lazy<Regex> =
            Lazy::new(|| Regex::new(&[$($pat),+].concat()).unwrap());
    };
}

line_re!(RE_KEY_BARE, PAT_KEY_ONLY, r"$");
line_re!(RE_KEY_NULL, PAT_KEY_ONLY, r"\s+null$");
line_re!(RE_KEY_TILDE, PAT_KEY_ONLY, r"\s+~$");
line_re!(RE_QSTRING, PAT_KEY_ITEM, r#""(.*)"$"#);
line_re!(RE_ASTRING, PAT_KEY_ITEM, r"'(.*)'$");
line_re!(RE_PURE_VAL, PAT_KEY_ITEM, r#"([^'"].*[^'"])$"#);
line_re!(RE_ZNUMBER, PAT_KEY_ITEM, r"(0[0-9]+)$");
line_re!(RE_INLINE_VAL, PAT_KEY_ITEM, r"([\[{].*[\]}])$");
line_re!(RE_ANY_VAL, PAT_KEY_ITEM, r"(.*)$");
line_re!(RE_ANCHOR, PAT_KEY_ITEM, r"&", PAT_ANCHOR, r"(\s.*|)$");
line_re!(RE_ALIAS, PAT_KEY_ITEM, r"\*", PAT_ANCHOR, r"$");
pub(crate) static RE_MERGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&[r"^(\s*(?:-\s+)*<<:)\s+\*", PAT_ANCHOR, r"$"].concat()).unwrap());

pub(crate) struct Mangler<'o> {
    pub(crate) lines: Vec<String>,
    pub(crate) indent: Vec<usize>,
    pub(crate) opts: &'o MangleOptions,
    pub(crate) encrypting: bool,
}

impl<'o> Mangler<'o> {
    fn new(buf: &[u8], opts: &'o MangleOptions, encrypting: bool) -> Self {
        let text = String::from_utf8_lossy(buf);
        let text = text.trim_start_matches(['\r', '\n']);
        let text = text.trim_end_matches(['\r', '\n', ' ', '\t']);
        let lines = text.split('\n').map(str::to_string).collect();
        Mangler {
            lines,
            indent: Vec::new(),
            opts,
            encrypting,
        }
    }

    fn trace(&self, message: &str) {
        let action = if self.encrypting { "encrypt" } else { "decrypt" };
        trace!(
            "mangle/{action}/{message}:\n~~~~~~~~\n{}~~~~~~~~",
            String::from_utf8_lossy(&self.bytes())
        );
    }

    pub(crate) fn collect_indent(&mut self) {
        let n = self.lines.len();
        self.indent = vec![0; n];
        let mut last = 0;
        for i in (0..n).rev() {
            match self.lines[i].find(|c| c != ' ' && c != '\t') {
                Some(pos) => {
                    self.indent[i] = pos;
                    last = pos;
                }
                None => self.indent[i] = last,
            }
        }
    }

    pub(crate) fn padding(&self, idx: usize) -> String {
        if self.indent.is_empty() {
            return String::new();
        }
        " ".repeat(self.indent[idx])
    }

    pub(crate) fn this_is_list_item(line: &str) -> bool {
        let trim = line.trim();
        format!("{trim} ").starts_with("- ")
    }

    // very simplistic check that the next line is an inner map item
    pub(crate) fn next_is_inner_map(&self, idx: usize) -> bool {
        let n = self.lines.len();
        let curr_indent = self.indent[idx];
        let mut next_indent = curr_indent;
        let mut next_line = "";
        let mut i = idx + 1;
        while i < n && next_line.is_empty() {
            next_line = self.lines[i].trim();
            next_indent = self.indent[i];
            if next_line.starts_with('#') {
                next_line = "";
            }
            i += 1;
        }
        if !next_line.is_empty() && next_indent > curr_indent {
            return !next_line.starts_with('-');
        }
        false
    }

    pub(crate) fn handle_blank_lines(&mut self) {
        let mut trim: Vec<String> = Vec::with_capacity(self.lines.len());
        for s in self.lines.drain(..) {
            if s.is_empty() {
                continue;
            }
            if s == MANGLE_BLANK {
                trim.push(String::new());
            } else {
                trim.push(s);
            }
        }
        while trim.last().is_some_and(String::is_empty) {
            trim.pop();
        }
        self.lines = trim;
    }

    pub(crate) fn bytes(&self) -> Vec<u8> {
        let mut out = self.lines.join("\n").into_bytes();
        out.push(b'\n');
        out
    }
}

pub(crate) fn string_from_a(s: &str) -> String {
    s.replace("''", "'")
}

pub(crate) fn string_to_a(s: &str) -> String {
    s.replace('\'', "''")
}

pub(crate) fn string_from_q(s: &str) -> String {
    s.replace("\\\"", "\"").replace("\\\\", "\\")
}

pub(crate) fn string_to_q(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
