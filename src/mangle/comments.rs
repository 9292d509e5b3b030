//! Inline comments are split onto their own sentinel line (with the
//! original column recorded) so the engine never sees them; free-standing
//! comments get the encryptable tag appended according to policy.

use once_cell::sync::Lazy;
use regex::Regex;

use super::*;

static RE_IN_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(&[PAT_KEY_ITEM, r"(.*\s)(#.*)$"].concat()).unwrap());
static RE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\s*#)(.*)$").unwrap());

impl Mangler<'_> {
    pub(crate) fn split_inline_comments(&mut self) {
        let encrypting = self.encrypting;
        let mut new_lines = Vec::with_capacity(self.lines.len());
        let mut new_indent = Vec::with_capacity(self.indent.len());
        for (i, s) in self.lines.iter().enumerate() {
            let p = self.indent[i];
            if let Some(m) = RE_IN_COMMENT.captures(s) {
                let (key, val) = (&m[1], &m[2]);
                let com = m[3].trim_end_matches([' ', '\t']);
                // make sure the "comment" is not a string between quotes
                let mut ok = true;
                if let Some(q) = com.chars().last().filter(|c| *c == '\'' || *c == '"') {
                    ok = !val.contains(q) || val.trim().ends_with(q);
                }
                if ok {
                    let pos = s.len() - com.len(); // save the column
                    let mut c = format!("{}{com}{MANGLE_START}{pos}{MANGLE_END}", self.padding(i));
                    if encrypting {
                        c.push_str(MANGLE_COMMENT);
                    }
                    let line = format!("{key} {}", val.trim_end_matches([' ', '\t']));
                    new_lines.push(c);
                    new_lines.push(line);
                    new_indent.push(p);
                    new_indent.push(p);
                    continue;
                }
            }
            new_lines.push(s.clone());
            new_indent.push(p);
        }
        self.lines = new_lines;
        self.indent = new_indent;
    }

    pub(crate) fn merge_inline_comments(&mut self) {
        let decrypting = !self.encrypting;
        let n = self.lines.len();
        let mut new_lines = vec![String::new(); n];
        for i in 0..n {
            let mut s = self.lines[i].clone();
            new_lines[i] = s.clone();
            let mut j = i + 1;
            if j == n {
                continue;
            }
            if decrypting {
                if let Some(stripped) = s.strip_suffix(MANGLE_COMMENT) {
                    s = stripped.to_string();
                }
            }
            if !s.ends_with(MANGLE_END) {
                continue;
            }
            let s = s.trim();
            if !s.starts_with('#') {
                continue;
            }
            let Some(idx) = s.rfind(MANGLE_START) else {
                continue;
            };
            let mark = &s[idx + MANGLE_START.len()..s.len() - MANGLE_END.len()];
            let Ok(pos) = mark.parse::<usize>() else {
                continue;
            };
            let c = s[..idx].to_string();
            let mut target = self.lines[j].clone();
            while target.is_empty() && j < n - 1 {
                j += 1;
                target = self.lines[j].clone();
            }
            if target.is_empty() || target == MANGLE_BLANK {
                continue;
            }
            let pad = pos.saturating_sub(target.len()).max(1);
            new_lines[i] = format!("{target}{}{c}", " ".repeat(pad));
            self.lines[j] = String::new(); // removed by the blank-line pass
        }
        self.lines = new_lines;
    }

    pub(crate) fn mark_encrypted_comments(&mut self) {
        if !self.encrypting {
            return;
        }

        let mut all = false;
        let mut suffixes: Vec<&str> = Vec::new();
        match self.opts.encrypted_comment_suffix.as_str() {
            "none" => return,
            "all" | "" => all = true,
            other => suffixes = other.split(',').collect(),
        }
        let prefixes: Vec<&str> = self.opts.encrypted_comment_prefix.split(',').collect();

        for s in self.lines.iter_mut() {
            let Some(m) = RE_COMMENT.captures(s) else {
                continue;
            };
            let value = m[2].trim_start_matches('#').trim();
            if value.is_empty() {
                continue;
            }
            if value.ends_with(MANGLE_COMMENT) {
                continue; // prevent double-tagging
            }
            let mut encrypt = all;
            if !encrypt {
                encrypt = suffixes
                    .iter()
                    .any(|suffix| !suffix.is_empty() && value.ends_with(suffix));
            }
            if !encrypt {
                encrypt = prefixes
                    .iter()
                    .any(|prefix| !prefix.is_empty() && value.starts_with(prefix));
            }
            if encrypt {
                s.push_str(MANGLE_COMMENT);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &str, flags: &str, suffix: &str, prefix: &str, encrypting: bool) -> String {
        let opts = MangleOptions::new(flags, suffix, prefix).unwrap();
        String::from_utf8(opts.mangle(input.as_bytes(), "test.yaml", encrypting)).unwrap()
    }

    #[test]
    fn inline_comment_is_split_with_column() {
        // "# note" starts at column 9
        let out = run("key: val # note\n", "incom", "all", "", true);
        assert_eq!(out, "# note#⋞9⋟∉∌\nkey: val\n");
    }

    #[test]
    fn quoted_hash_is_not_a_comment() {
        let out = run("key: 'a # b'\n", "incom", "all", "", true);
        assert_eq!(out, "key: 'a # b'\n");
    }

    #[test]
    fn merge_restores_column() {
        let opts = MangleOptions::new("incom", "all", "").unwrap();
        let mangled = opts.mangle(b"key: val # note\n", "test.yaml", false);
        let restored = opts.demangle(&mangled, "test.yaml", false).unwrap();
        assert_eq!(String::from_utf8(restored).unwrap(), "key: val # note\n");
    }

    #[test]
    fn free_comments_tagged_by_default_policy() {
        let out = run("# secret\nkey: val\n", "blank", "all", "", true);
        assert_eq!(out, "# secret∉∌\nkey: val\n");
    }

    #[test]
    fn no_tagging_when_policy_is_none() {
        let out = run("# secret\nkey: val\n", "blank", "none", "", true);
        assert_eq!(out, "# secret\nkey: val\n");
    }

    #[test]
    fn suffix_and_prefix_policies() {
        let out = run(
            "# keep me\n# hide me!\n# SECRET: x\nkey: val\n",
            "blank",
            "!",
            "SECRET",
            true,
        );
        assert_eq!(out, "# keep me\n# hide me!∉∌\n# SECRET: x∉∌\nkey: val\n");
    }

    #[test]
    fn no_tagging_when_decrypting() {
        let out = run("# secret\nkey: val\n", "blank", "all", "", false);
        assert_eq!(out, "# secret\nkey: val\n");
    }
}
