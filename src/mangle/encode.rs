//! Encoding pass: insert sentinel marks ahead of the engine round trip.

use regex::Regex;

use super::*;

fn cap2(re: &Regex, line: &str) -> Option<(String, String)> {
    re.captures(line)
        .map(|m| (m[1].to_string(), m[2].to_string()))
}

fn cap3(re: &Regex, line: &str) -> Option<(String, String, String)> {
    re.captures(line)
        .map(|m| (m[1].to_string(), m[2].to_string(), m[3].to_string()))
}

impl Mangler<'_> {
    // stream markers and blank lines are wrapped in place
    pub(crate) fn mangle_special_line(&mut self, idx: usize, sops_block: bool) -> bool {
        let mut line = self.lines[idx].clone();
        let opts = self.opts;
        let is_special = if line == "---" && opts.flag('-') {
            idx == 0
        } else if line == "..." && opts.flag('-') {
            idx == self.lines.len() - 1
        } else if line.trim().is_empty() && !sops_block && opts.flag('_') {
            line.clear();
            true
        } else {
            false
        };
        if is_special {
            self.lines[idx] = format!("{}{MANGLE_START}{line}{MANGLE_END}", self.padding(idx));
        }
        is_special
    }

    pub(crate) fn mark_inline_features(&mut self, idx: usize) -> bool {
        let mut line = self.lines[idx].clone();
        let opts = self.opts;
        let mut encryptable = true;
        let mut mark = String::new();

        let znum = opts
            .flag('0')
            .then(|| cap2(&RE_ZNUMBER, &line))
            .flatten();
        if RE_KEY_BARE.is_match(&line) && opts.flag(':') {
            encryptable = false;
            mark = ":".into();
        } else if RE_KEY_TILDE.is_match(&line) && opts.flag('~') {
            mark = "~".into();
        } else if RE_QSTRING.is_match(&line) && opts.flag('"') {
            mark = "\"".into();
        } else if RE_ASTRING.is_match(&line) && opts.flag('\'') {
            mark = "'".into();
        } else if let Some((key, val)) = znum {
            line = format!("{key} '{val}'");
            mark = "0".into();
        } else {
            if opts.flag('@') {
                if let Some((key, val)) = cap2(&RE_INLINE_VAL, &line) {
                    if val != "{}" && val != "[]" {
                        line = format!("{key} '{}'", string_to_a(&val));
                        mark = "@".into();
                    }
                }
            }
            if opts.flag('*') {
                if let Some((key, anchor)) = cap2(&RE_ALIAS, &line) {
                    line = format!("{key} {anchor}");
                    mark = "*".into();
                }
                if let Some((key, anchor)) = cap2(&RE_MERGE, &line) {
                    line = format!("{} {anchor}", key.replace("<<:", "___:"));
                    mark = "<".into();
                }
                if let Some((key, anchor, val)) = cap3(&RE_ANCHOR, &line) {
                    line = format!("{key} {val}");
                    if val.is_empty()
                        && Self::this_is_list_item(&line)
                        && self.next_is_inner_map(idx)
                    {
                        // a bare anchor on a list item followed by an inner
                        // map; prepend a dummy pair to prevent the engine
                        // from lifting the map into the item
                        line = format!("{key} ___: ___");
                    }
                    mark = format!("&{anchor}");
                }
            }
        }

        if mark.is_empty() {
            return false;
        }
        let mut comment = format!("{MANGLE_START}{mark}{MANGLE_END}");
        if encryptable && self.encrypting {
            comment.push_str(MANGLE_COMMENT);
        }
        // prepend the sentinel line before the current one
        self.lines[idx] = format!("{}{comment}\n{line}", self.padding(idx));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mangled(input: &str, flags: &str) -> String {
        let opts = MangleOptions::new(flags, "", "").unwrap();
        String::from_utf8(opts.mangle(input.as_bytes(), "test.yaml", true)).unwrap()
    }

    #[test]
    fn bare_key_gets_unencryptable_mark() {
        assert_eq!(mangled("k:\n", "bare"), "#⋞:⋟\nk:\n");
    }

    #[test]
    fn zero_number_is_quoted_and_marked() {
        assert_eq!(mangled("a: 0123\n", "znum"), "#⋞0⋟∉∌\na: '0123'\n");
    }

    #[test]
    fn tilde_and_quoted_strings() {
        assert_eq!(mangled("a: ~\n", "tilde"), "#⋞~⋟∉∌\na: ~\n");
        assert_eq!(mangled("a: \"x\"\n", "qstr"), "#⋞\"⋟∉∌\na: \"x\"\n");
        assert_eq!(mangled("a: 'x'\n", "astr"), "#⋞'⋟∉∌\na: 'x'\n");
    }

    #[test]
    fn stream_markers_and_blanks_wrap_in_place() {
        assert_eq!(
            mangled("---\na: 1\n\nb: 2\n", "stream,blank"),
            "#⋞---⋟\na: 1\n#⋞⋟\nb: 2\n"
        );
    }

    #[test]
    fn bare_anchor_on_list_item_gets_dummy_pair() {
        assert_eq!(
            mangled("- &x\n  k: v\n", "anchor"),
            "#⋞&x⋟∉∌\n- ___: ___\n  k: v\n"
        );
    }

    #[test]
    fn alias_and_merge_keys() {
        assert_eq!(mangled("a: *x\n", "anchor"), "#⋞*⋟∉∌\na: x\n");
        assert_eq!(mangled("<<: *x\n", "anchor"), "#⋞<⋟∉∌\n___: x\n");
    }

    #[test]
    fn inline_collections_flatten_to_quoted_scalars() {
        assert_eq!(mangled("a: [1, 2]\n", "inval"), "#⋞@⋟∉∌\na: '[1, 2]'\n");
        assert_eq!(mangled("a: {}\n", "inval"), "a: {}\n");
    }

    #[test]
    fn sops_block_is_left_alone() {
        let input = "a: 0123\nsops:\n  mac: 0456\n";
        assert_eq!(mangled(input, "znum"), "#⋞0⋟∉∌\na: '0123'\nsops:\n  mac: 0456\n");
    }

    #[test]
    fn indented_marks_align_with_their_line() {
        assert_eq!(
            mangled("top:\n  a: 0123\n", "znum"),
            "top:\n  #⋞0⋟∉∌\n  a: '0123'\n"
        );
    }
}
