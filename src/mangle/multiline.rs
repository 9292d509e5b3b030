//! Multi-line quoted template strings (`key: "{{ ... }}"` spanning several
//! physical lines) are collapsed onto one line; the per-line indents travel
//! in the sentinel so the decoder can split them back.

use once_cell::sync::Lazy;
use regex::Regex;

use super::*;

static RE_PIPE_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(&[PAT_KEY_ITEM, r#""\{\{.*[^"]$"#].concat()).unwrap());
static RE_PIPE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r#".*\}\}"$"#).unwrap());
static RE_PIPE_MARK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&[r"^\s*#", MANGLE_START, r"\|([0-9|]+)", MANGLE_END].concat()).unwrap()
});

impl Mangler<'_> {
    pub(crate) fn merge_multiline_pipes(&mut self) {
        let encrypting = self.encrypting;
        let mut new_lines = Vec::with_capacity(self.lines.len());
        let mut new_indent = Vec::with_capacity(self.indent.len());
        let s = &self.lines;
        let p = &self.indent;
        let n = s.len();
        let mut i = 0;
        while i < n {
            if RE_PIPE_START.is_match(&s[i]) {
                let mut end = 0;
                for j in i..n {
                    if j > i && p[j] <= p[i] {
                        break;
                    }
                    if RE_PIPE_END.is_match(&s[j]) {
                        end = j;
                        break;
                    }
                }
                if end > i {
                    let mut comment = format!("{}#{MANGLE_START}", self.padding(i));
                    let mut merged = s[i].clone();
                    for k in i + 1..=end {
                        comment.push_str(&format!("|{}", p[k]));
                        merged.push_str(MANGLE_NEWLINE);
                        merged.push_str(s[k].trim());
                    }
                    comment.push_str(MANGLE_END);
                    if encrypting {
                        comment.push_str(MANGLE_COMMENT);
                    }
                    new_lines.push(comment);
                    new_lines.push(merged);
                    new_indent.push(p[i]);
                    new_indent.push(p[i]);
                    i = end + 1;
                    continue;
                }
            }
            new_lines.push(s[i].clone());
            new_indent.push(p[i]);
            i += 1;
        }
        self.lines = new_lines;
        self.indent = new_indent;
    }

    pub(crate) fn restore_multiline_pipes(&mut self) -> Result<()> {
        let decrypting = !self.encrypting;
        let n = self.lines.len();
        for i in 0..n {
            let mut j = i + 1;
            if j == n {
                continue;
            }
            let mut s = self.lines[i].clone();
            if decrypting {
                if let Some(stripped) = s.strip_suffix(MANGLE_COMMENT) {
                    s = stripped.to_string();
                }
            }
            let Some(m) = RE_PIPE_MARK.captures(&s) else {
                continue;
            };

            // parse the indent list
            let mut indents = Vec::new();
            for tok in m[1].split('|') {
                let p: usize = tok.parse().map_err(|_| {
                    SopsGitError::Mangle(format!("invalid multiline marker {s:?}"))
                })?;
                indents.push(p);
            }

            // find the merged line and validate
            let mut merged = self.lines[j].clone();
            while merged.is_empty() && j < n - 1 {
                j += 1;
                merged = self.lines[j].clone();
            }
            if merged.is_empty() || merged == MANGLE_BLANK {
                continue;
            }
            let cnt = merged.matches(MANGLE_NEWLINE).count();
            if cnt != indents.len() {
                return Err(SopsGitError::Mangle(format!(
                    "wrong newline count {cnt} (must be {}): {merged:?}",
                    indents.len()
                )));
            }

            // restore the original lines
            let base_indent = merged
                .find(|c| c != ' ' && c != '\t')
                .unwrap_or(merged.len());
            for p in indents {
                let p = if p <= base_indent {
                    base_indent + self.opts.indent
                } else {
                    p
                };
                let replacement = format!("\n{}", " ".repeat(p));
                merged = merged.replacen(MANGLE_NEWLINE, &replacement, 1);
            }

            self.lines[i] = String::new(); // removed by the blank-line pass
            self.lines[j] = merged;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "cmd: \"{{ step one\n    step two\n      step three }}\"\nnext: 1\n";

    #[test]
    fn pipes_merge_onto_one_line() {
        let opts = MangleOptions::new("pipe", "", "").unwrap();
        let out = String::from_utf8(opts.mangle(DOC.as_bytes(), "test.yaml", true)).unwrap();
        assert_eq!(
            out,
            "##⋞|4|6⋟∉∌\ncmd: \"{{ step one⋚⋛step two⋚⋛step three }}\"\nnext: 1\n"
        );
    }

    #[test]
    fn pipes_split_back_with_indents() {
        let opts = MangleOptions::new("pipe", "", "").unwrap();
        let mangled = opts.mangle(DOC.as_bytes(), "test.yaml", false);
        let restored = opts.demangle(&mangled, "test.yaml", false).unwrap();
        assert_eq!(String::from_utf8(restored).unwrap(), DOC);
    }

    #[test]
    fn stored_indent_at_or_below_base_is_clamped() {
        // an engine that re-indents can leave the stored indent at or
        // below the merged line; the decoder falls back to base + indent
        let opts = MangleOptions::new("pipe", "", "").unwrap();
        let mangled = "##⋞|0⋟\ncmd: \"{{ a⋚⋛b }}\"\n";
        let restored = opts
            .demangle(mangled.as_bytes(), "test.yaml", false)
            .unwrap();
        assert_eq!(
            String::from_utf8(restored).unwrap(),
            "cmd: \"{{ a\n  b }}\"\n"
        );
    }

    #[test]
    fn wrong_newline_count_is_fatal() {
        let opts = MangleOptions::new("pipe", "", "").unwrap();
        let bad = "##⋞|4|6⋟\ncmd: \"{{ a⋚⋛b }}\"\n";
        assert!(opts.demangle(bad.as_bytes(), "test.yaml", false).is_err());
    }
}
