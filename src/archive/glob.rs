//! Shell-style name patterns for archive exclusions.
//!
//! - `*` any run of characters, `?` one character
//! - `[abc]`, `[a-z]`, `[!a]` character classes
//! - `{a,b}` alternatives

/// True when `name` matches `pattern` in full.
pub fn matches(pattern: &str, name: &str) -> bool {
    let name: Vec<char> = name.chars().collect();
    expand_alternatives(pattern).iter().any(|p| {
        let p: Vec<char> = p.chars().collect();
        match_from(&p, &name)
    })
}

/// True when any of `patterns` matches `name`.
pub fn matches_any(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|p| matches(p, name))
}

fn expand_alternatives(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let Some(close_rel) = pattern[open..].find('}') else {
        return vec![pattern.to_string()];
    };
    let close = open + close_rel;
    let (prefix, body, suffix) = (&pattern[..open], &pattern[open + 1..close], &pattern[close + 1..]);

    body.split(',')
        .flat_map(|alt| expand_alternatives(&format!("{}{}{}", prefix, alt, suffix)))
        .collect()
}

/// Iterative matcher; `*` backtracks to the most recent star only.
fn match_from(pattern: &[char], name: &[char]) -> bool {
    let (mut p, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() {
            match pattern[p] {
                '*' => {
                    star = Some((p, n));
                    p += 1;
                    continue;
                }
                '?' => {
                    p += 1;
                    n += 1;
                    continue;
                }
                '[' => {
                    if let Some((hit, len)) = class_match(&pattern[p..], name[n]) {
                        if hit {
                            p += len;
                            n += 1;
                            continue;
                        }
                    } else if name[n] == '[' {
                        p += 1;
                        n += 1;
                        continue;
                    }
                }
                c if c == name[n] => {
                    p += 1;
                    n += 1;
                    continue;
                }
                _ => {}
            }
        }

        match star {
            Some((sp, sn)) => {
                p = sp + 1;
                n = sn + 1;
                star = Some((sp, sn + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Matches one character against a `[...]` class at the start of
/// `pattern`. Returns the outcome and the class length, or `None` when the
/// bracket is not closed.
fn class_match(pattern: &[char], c: char) -> Option<(bool, usize)> {
    let mut i = 1;
    let negated = matches!(pattern.get(i), Some('!') | Some('^'));
    if negated {
        i += 1;
    }

    let mut hit = false;
    let mut first = true;
    while i < pattern.len() {
        let current = pattern[i];
        if current == ']' && !first {
            return Some((hit != negated, i + 1));
        }
        first = false;
        if pattern.get(i + 1) == Some(&'-') && i + 2 < pattern.len() && pattern[i + 2] != ']' {
            if current <= c && c <= pattern[i + 2] {
                hit = true;
            }
            i += 3;
        } else {
            if current == c {
                hit = true;
            }
            i += 1;
        }
    }
    None
}
