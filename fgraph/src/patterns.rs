//! Function patterns from the command line
//!
//! ```text
//! main.handler                       trace matching functions
//! main.*                             `*` wildcards
//! main.handler(fd=%rdi:s32, n=%rsi:u64)
//!                                    with fetch args at entry
//! main.handler+24(x=-8(%rbp):u64)    custom probe 24 bytes in
//! !runtime.*                         exclude from the call graph
//! ```

use crate::domain::FetchError;
use crate::fetch::FetchArg;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionPattern {
    /// Wildcard matched against symbol and demangled names
    pub name: String,
    /// Custom probe offset from the function's first byte
    pub offset: Option<u64>,
    pub args: Vec<FetchArg>,
}

/// Parsed command-line patterns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSet {
    pub includes: Vec<FunctionPattern>,
    pub excludes: Vec<String>,
}

impl PatternSet {
    /// # Errors
    /// Returns the first malformed pattern or fetch expression
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Result<Self, FetchError> {
        let mut set = Self::default();
        for pattern in raw {
            let pattern = pattern.as_ref().trim();
            if let Some(excluded) = pattern.strip_prefix('!') {
                if excluded.is_empty() || excluded.contains(['(', ')']) {
                    return Err(FetchError::InvalidPattern(pattern.to_string()));
                }
                set.excludes.push(excluded.to_string());
            } else {
                set.includes.push(parse_pattern(pattern)?);
            }
        }
        Ok(set)
    }

    /// Call-graph roots: every included name, deduplicated in order
    #[must_use]
    pub fn root_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for pattern in &self.includes {
            if !names.contains(&pattern.name) {
                names.push(pattern.name.clone());
            }
        }
        names
    }
}

/// Parse one include pattern
///
/// # Errors
/// Fails on unbalanced parentheses, a `var=expr` item without `=`, an empty
/// name, or an invalid fetch expression
pub fn parse_pattern(raw: &str) -> Result<FunctionPattern, FetchError> {
    let (head, args) = split_args(raw)?;
    let (name, offset) = split_offset(head);
    if name.is_empty() {
        return Err(FetchError::InvalidPattern(raw.to_string()));
    }

    let args = match args {
        Some(list) => parse_arg_list(list)?,
        None => Vec::new(),
    };

    Ok(FunctionPattern { name: name.to_string(), offset, args })
}

/// Split `head(args)` at the parenthesis matching the final `)`
fn split_args(raw: &str) -> Result<(&str, Option<&str>), FetchError> {
    if !raw.ends_with(')') {
        if raw.contains(['(', ')']) {
            return Err(FetchError::UnbalancedParentheses(raw.to_string()));
        }
        return Ok((raw, None));
    }

    let mut depth = 0usize;
    for (i, c) in raw.char_indices().rev() {
        match c {
            ')' => depth += 1,
            '(' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| FetchError::UnbalancedParentheses(raw.to_string()))?;
                if depth == 0 {
                    let head = &raw[..i];
                    if head.contains(['(', ')']) {
                        return Err(FetchError::UnbalancedParentheses(raw.to_string()));
                    }
                    return Ok((head, Some(&raw[i + 1..raw.len() - 1])));
                }
            }
            _ => {}
        }
    }
    Err(FetchError::UnbalancedParentheses(raw.to_string()))
}

/// `name+24` -> (`name`, Some(24))
fn split_offset(head: &str) -> (&str, Option<u64>) {
    if let Some((name, digits)) = head.rsplit_once('+') {
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(offset) = digits.parse() {
                return (name, Some(offset));
            }
        }
    }
    (head, None)
}

fn parse_arg_list(list: &str) -> Result<Vec<FetchArg>, FetchError> {
    list.split(',')
        .filter(|item| !item.trim().is_empty())
        .map(|item| {
            let (var, expression) = item
                .split_once('=')
                .filter(|(var, expression)| !var.trim().is_empty() && !expression.contains('='))
                .ok_or_else(|| FetchError::InvalidStatement(item.trim().to_string()))?;
            FetchArg::parse(var.trim(), expression.trim())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_and_wildcard() {
        let p = parse_pattern("main.*").unwrap();
        assert_eq!(p.name, "main.*");
        assert_eq!(p.offset, None);
        assert!(p.args.is_empty());
    }

    #[test]
    fn test_fetch_list() {
        let p = parse_pattern("handler(fd = %rdi:s32, buf=+0(%rsi):c64)").unwrap();
        assert_eq!(p.name, "handler");
        let names: Vec<_> = p.args.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["fd", "buf"]);
        assert_eq!(p.args[1].expression, "+0(%rsi):c64");
    }

    #[test]
    fn test_offset_with_args() {
        let p = parse_pattern("handler+24(x=-8(%rbp):u64)").unwrap();
        assert_eq!(p.name, "handler");
        assert_eq!(p.offset, Some(24));
        assert_eq!(p.args.len(), 1);
    }

    #[test]
    fn test_plus_in_name_is_not_offset() {
        let p = parse_pattern("operator+").unwrap();
        assert_eq!(p.name, "operator+");
        assert_eq!(p.offset, None);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(parse_pattern("f(x=%rdi:u64"), Err(FetchError::UnbalancedParentheses(_))));
        assert!(matches!(parse_pattern("f(x=%rdi:u64))"), Err(FetchError::UnbalancedParentheses(_))));
        assert!(matches!(parse_pattern("f(x)"), Err(FetchError::InvalidStatement(_))));
        assert!(matches!(parse_pattern("f(x=a=b)"), Err(FetchError::InvalidStatement(_))));
        assert!(matches!(parse_pattern("(x=%rdi:u64)"), Err(FetchError::InvalidPattern(_))));
        assert!(matches!(parse_pattern("f(x=%xyz:u64)"), Err(FetchError::UnsupportedRegister(_))));
    }

    #[test]
    fn test_pattern_set() {
        let set = PatternSet::parse(&["foo(x=%rdi:u64)", "!bar", "foo+8", "baz*"]).unwrap();
        assert_eq!(set.excludes, ["bar"]);
        assert_eq!(set.includes.len(), 3);
        assert_eq!(set.root_names(), ["foo", "baz*"]);
        assert!(PatternSet::parse(&["!"]).is_err());
    }
}
