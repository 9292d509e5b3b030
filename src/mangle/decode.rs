//! Decoding pass: consume sentinel marks after the engine round trip.

use super::*;

impl Mangler<'_> {
    pub(crate) fn run_demangle(&mut self) -> Result<()> {
        let decrypting = !self.encrypting;
        let mut stream_end = false;
        let mut conv = String::new();
        let mut anchor = String::new();

        for idx in 0..self.lines.len() {
            let mut line = self.lines[idx].clone();
            if decrypting {
                if let Some(stripped) = line.strip_suffix(MANGLE_COMMENT) {
                    line = stripped.to_string();
                }
            }
            if !line.ends_with(MANGLE_END) {
                if !conv.is_empty() {
                    line = demangle_line(&line, &conv)?;
                    conv.clear();
                }
                if !anchor.is_empty() {
                    line = demangle_line(&line, &anchor)?;
                    anchor.clear();
                }
                self.lines[idx] = line;
                continue;
            }
            let mark = line.trim();
            if !mark.starts_with(MANGLE_START) {
                continue;
            }
            let mark = &mark[MANGLE_START.len()..mark.len() - MANGLE_END.len()];
            match mark {
                "" => line = MANGLE_BLANK.to_string(),
                "---" => line = mark.to_string(),
                "..." => {
                    stream_end = true;
                    line = String::new();
                }
                ":" | "~" | "\"" | "'" | "0" | "@" | "*" | "<" => {
                    if conv.starts_with('&') {
                        // anchors can be augmented by another conversion
                        anchor = conv.clone();
                    }
                    let mut mark = mark;
                    if conv == "'" && mark == "\"" {
                        // the engine emits empty strings double-quoted,
                        // which causes superfluous marking
                        mark = "'";
                    }
                    conv = mark.to_string();
                    line = String::new();
                }
                _ if mark.starts_with('&') => {
                    conv = mark.to_string();
                    line = String::new();
                }
                _ => {
                    return Err(SopsGitError::Mangle(format!("invalid line mark {mark:?}")));
                }
            }
            self.lines[idx] = line;
        }

        self.restore_multiline_pipes()?;
        self.merge_inline_comments();
        self.handle_blank_lines();
        if stream_end {
            self.lines.push("...".to_string());
        }
        Ok(())
    }
}

fn demangle_line(line: &str, conv: &str) -> Result<String> {
    let line = line.to_string();
    Ok(match conv {
        // bare key: drop the "null" the engine added
        ":" => match RE_KEY_NULL.captures(&line) {
            Some(m) => m[1].to_string(),
            None => line,
        },
        // tilde value: replace "null" by "~"
        "~" => match RE_KEY_NULL.captures(&line) {
            Some(m) => format!("{} ~", &m[1]),
            None => line,
        },
        // cast into double-quoted string
        "\"" => {
            if let Some(m) = RE_ASTRING.captures(&line) {
                format!("{} \"{}\"", &m[1], string_to_q(&string_from_a(&m[2])))
            } else if let Some(m) = RE_ANY_VAL
                .captures(&line)
                .filter(|_| !RE_QSTRING.is_match(&line))
            {
                format!("{} \"{}\"", &m[1], string_to_q(&m[2]))
            } else {
                line
            }
        }
        // cast into single-quoted string
        "'" => {
            if let Some(m) = RE_QSTRING.captures(&line) {
                format!("{} '{}'", &m[1], string_to_a(&string_from_q(&m[2])))
            } else if let Some(m) = RE_ANY_VAL
                .captures(&line)
                .filter(|_| !RE_ASTRING.is_match(&line))
            {
                format!("{} '{}'", &m[1], string_to_a(&m[2]))
            } else {
                line
            }
        }
        // restore an inline map, list, or leading-zero number
        "0" | "@" => {
            if let Some(m) = RE_ASTRING.captures(&line) {
                format!("{} {}", &m[1], string_from_a(&m[2]))
            } else if let Some(m) = RE_QSTRING.captures(&line) {
                format!("{} {}", &m[1], string_from_q(&m[2]))
            } else {
                return Err(SopsGitError::Mangle(format!("invalid marked line {line:?}")));
            }
        }
        // restore alias
        "*" => match RE_PURE_VAL.captures(&line) {
            Some(m) => format!("{} *{}", &m[1], &m[2]),
            None => {
                return Err(SopsGitError::Mangle(format!("invalid alias line {line:?}")));
            }
        },
        // restore merge key
        "<" => match RE_PURE_VAL.captures(&line) {
            Some(m) => format!("{} *{}", m[1].replace("___:", "<<:"), &m[2]),
            None => {
                return Err(SopsGitError::Mangle(format!("invalid merge line {line:?}")));
            }
        },
        "" => line,
        _ if conv.starts_with('&') => demangle_anchor_line(&line, &conv[1..])?,
        _ => {
            return Err(SopsGitError::Mangle(format!(
                "invalid state {conv:?} at line {line:?}"
            )));
        }
    })
}

fn demangle_anchor_line(line: &str, anchor: &str) -> Result<String> {
    let (mut key, mut val);
    if let Some(m) = RE_ANY_VAL.captures(line) {
        key = m[1].to_string();
        val = m[2].to_string();
    } else if let Some(m) = RE_KEY_BARE.captures(line) {
        key = m[1].to_string();
        val = String::new();
    } else {
        return Err(SopsGitError::Mangle(format!("invalid anchor line {line:?}")));
    }
    if val == "___" {
        // remove the dummy pair prepended by the mangler
        if let Some(stripped) = key.strip_suffix(" ___:") {
            key = stripped.to_string();
        }
        val = String::new();
    }
    let restored = format!("{key} &{anchor} {val}");
    Ok(restored.trim_end_matches(' ').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(flags: &str) -> MangleOptions {
        MangleOptions::new(flags, "", "").unwrap()
    }

    fn demangled(input: &str, flags: &str, encrypting: bool) -> String {
        String::from_utf8(
            opts(flags)
                .demangle(input.as_bytes(), "test.yaml", encrypting)
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn bare_key_null_is_dropped() {
        assert_eq!(demangled("#⋞:⋟\nk: null\n", "bare", false), "k:\n");
    }

    #[test]
    fn tilde_is_restored() {
        assert_eq!(demangled("#⋞~⋟\na: null\n", "tilde", false), "a: ~\n");
    }

    #[test]
    fn zero_number_is_unquoted() {
        assert_eq!(demangled("#⋞0⋟\na: '0123'\n", "znum", false), "a: 0123\n");
    }

    #[test]
    fn quoting_styles_are_restored() {
        assert_eq!(demangled("#⋞\"⋟\na: 'x'\n", "qstr", false), "a: \"x\"\n");
        assert_eq!(demangled("#⋞'⋟\na: \"x\"\n", "astr", false), "a: 'x'\n");
    }

    #[test]
    fn stream_markers_and_blanks_come_back() {
        assert_eq!(
            demangled("#⋞---⋟\na: 1\n#⋞⋟\nb: 2\n", "stream,blank", false),
            "---\na: 1\n\nb: 2\n"
        );
        assert_eq!(
            demangled("a: 1\n#⋞...⋟\n", "stream", false),
            "a: 1\n...\n"
        );
    }

    #[test]
    fn anchor_dummy_pair_is_removed() {
        assert_eq!(
            demangled("#⋞&x⋟\n- ___: ___\n  k: v\n", "anchor", false),
            "- &x\n  k: v\n"
        );
    }

    #[test]
    fn alias_and_merge_are_restored() {
        assert_eq!(demangled("#⋞*⋟\na: base\n", "anchor", false), "a: *base\n");
        assert_eq!(demangled("#⋞<⋟\n___: base\n", "anchor", false), "<<: *base\n");
    }

    #[test]
    fn encrypted_comment_tags_are_stripped_when_decrypting() {
        assert_eq!(demangled("#⋞0⋟∉∌\na: '0123'\n", "znum", false), "a: 0123\n");
    }

    #[test]
    fn invalid_mark_is_fatal() {
        let err = opts("znum")
            .demangle("#⋞?⋟\na: 1\n".as_bytes(), "test.yaml", false)
            .unwrap_err();
        assert!(matches!(err, SopsGitError::Mangle(_)));
    }

    #[test]
    fn anchor_augmented_by_conversion() {
        // an anchored quoted string carries both marks
        assert_eq!(
            demangled("#⋞&x⋟\n#⋞\"⋟\na: 'v'\n", "anchor,qstr", false),
            "a: &x \"v\"\n"
        );
    }

    #[test]
    fn mangle_then_demangle_is_identity_without_engine() {
        // every mark class at once, no engine in between
        let doc = "---\nempty:\ntilde: ~\nq: \"dq\"\na: 'sq'\nz: 0755\ninline: [1, 2]\n\nlist:\n  - &anc\n    k: v\n  - *anc\nmerged:\n  <<: *anc\n...\n";
        let o = MangleOptions::new("true", "", "").unwrap();
        let mangled = o.mangle(doc.as_bytes(), "test.yaml", false);
        let restored = o.demangle(&mangled, "test.yaml", false).unwrap();
        assert_eq!(String::from_utf8(restored).unwrap(), doc);
    }
}
