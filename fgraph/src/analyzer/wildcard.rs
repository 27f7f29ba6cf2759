//! Anchored `*` globbing for function names
//!
//! `*` matches any run of characters, including none. Every other character
//! matches itself. The whole name must match.

/// Match `name` against `pattern`
///
/// Greedy two-cursor matcher: on a mismatch it backtracks only to the most
/// recent `*`, so the cost stays linear in practice for any number of stars.
#[must_use]
pub fn matches(pattern: &str, name: &str) -> bool {
    let p = pattern.as_bytes();
    let s = name.as_bytes();
    let (mut pi, mut si) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while si < s.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            pi += 1;
            resume = si;
        } else if pi < p.len() && p[pi] == s[si] {
            pi += 1;
            si += 1;
        } else if let Some(star_at) = star {
            pi = star_at + 1;
            resume += 1;
            si = resume;
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == b'*')
}

/// True if any of `patterns` matches `name`
pub fn matches_any<'a, I>(patterns: I, name: &str) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    patterns.into_iter().any(|pattern| matches(pattern, name))
}
