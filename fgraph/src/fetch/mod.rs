//! # Argument Fetch Expressions
//!
//! A fetch expression names where a value lives at a probe site and how to
//! print it:
//!
//! ```text
//! %rdi:u64            the rdi register
//! +8(%rsp):s32        4 bytes at rsp+8
//! +0(+16(%rdi)):c128  16 bytes at *(rdi+16)
//! ```
//!
//! The chain is read innermost-first. Every intermediate dereference reads a
//! pointer (8 bytes); the outermost one reads the declared width. Widths are
//! in bits: `u`/`s` take 8, 16, 32 or 64 and `c` (raw bytes, printed as text)
//! takes 8 to 512.
//!
//! Parsing produces a [`FetchArg`] whose rules are in evaluation order, so
//! `rules[0]` is always the base register. [`compile`] turns those rules into
//! eBPF bytecode and [`prelude`] wraps the compiled args of one probe into the
//! fragment spliced into the kernel program.

pub mod bpf;
pub mod compile;
pub mod prelude;
pub mod splice;

use crate::domain::FetchError;
use crate::registers::Register;

/// Longest dereference chain a single argument may use
pub const MAX_FETCH_RULES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Unsigned,
    Signed,
    /// Raw bytes rendered as text
    Chars,
}

impl ValueKind {
    fn letter(self) -> char {
        match self {
            Self::Unsigned => 'u',
            Self::Signed => 's',
            Self::Chars => 'c',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchRule {
    /// Copy a register out of `pt_regs`
    ReadRegister(Register),
    /// Read `size` bytes at `offset` from the previous result
    ReadMemory { offset: i32, size: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchArg {
    pub name: String,
    pub expression: String,
    pub kind: ValueKind,
    /// Declared width in bytes
    pub size: usize,
    /// Evaluation order, base register first
    pub rules: Vec<FetchRule>,
}

impl FetchArg {
    /// Parse `expression` into a fetch argument called `name`
    ///
    /// # Errors
    /// Returns a `FetchError` describing the first syntax problem found
    pub fn parse(name: &str, expression: &str) -> Result<Self, FetchError> {
        let (chain, spec) = match expression.split_once(':') {
            Some((chain, spec)) if !spec.contains(':') && !spec.is_empty() => (chain, spec),
            _ => return Err(FetchError::MissingType(expression.to_string())),
        };

        let (kind, size) = parse_type(spec)?;
        let rules = parse_chain(expression, chain, size)?;

        Ok(Self {
            name: name.to_string(),
            expression: expression.to_string(),
            kind,
            size,
            rules,
        })
    }

    /// `u64`, `s32`, `c128`, ...
    #[must_use]
    pub fn type_spec(&self) -> String {
        format!("{}{}", self.kind.letter(), self.size * 8)
    }

    /// Render captured bytes according to the declared type
    ///
    /// Short input is zero-padded. Integers are little-endian; `c` values are
    /// cut at the first NUL and decoded lossily.
    #[must_use]
    pub fn sprint_value(&self, data: &[u8]) -> String {
        let mut buf = vec![0u8; self.size];
        let n = data.len().min(self.size);
        buf[..n].copy_from_slice(&data[..n]);

        match self.kind {
            ValueKind::Unsigned => le_value(&buf).to_string(),
            ValueKind::Signed => {
                let shift = 64 - 8 * self.size as u32;
                #[allow(clippy::cast_possible_wrap)]
                let value = ((le_value(&buf) << shift) as i64) >> shift;
                value.to_string()
            }
            ValueKind::Chars => {
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                String::from_utf8_lossy(&buf[..end]).into_owned()
            }
        }
    }

    /// `name=value`
    #[must_use]
    pub fn sprint(&self, data: &[u8]) -> String {
        format!("{}={}", self.name, self.sprint_value(data))
    }
}

fn le_value(bytes: &[u8]) -> u64 {
    bytes.iter().rev().fold(0, |acc, &b| (acc << 8) | u64::from(b))
}

fn parse_type(spec: &str) -> Result<(ValueKind, usize), FetchError> {
    let mut chars = spec.chars();
    let kind = match chars.next() {
        Some('u') => ValueKind::Unsigned,
        Some('s') => ValueKind::Signed,
        Some('c') => ValueKind::Chars,
        _ => return Err(FetchError::UnsupportedType(spec.to_string())),
    };
    let bits: usize = chars
        .as_str()
        .parse()
        .map_err(|_| FetchError::UnsupportedWidth(spec.to_string()))?;

    let allowed = match kind {
        ValueKind::Unsigned | ValueKind::Signed => matches!(bits, 8 | 16 | 32 | 64),
        ValueKind::Chars => matches!(bits, 8 | 16 | 32 | 64 | 128 | 256 | 512),
    };
    if !allowed {
        return Err(FetchError::UnsupportedWidth(spec.to_string()));
    }
    Ok((kind, bits / 8))
}

fn parse_chain(expression: &str, chain: &str, size: usize) -> Result<Vec<FetchRule>, FetchError> {
    let mut depth = 0usize;
    for c in chain.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| FetchError::UnbalancedParentheses(expression.to_string()))?;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(FetchError::UnbalancedParentheses(expression.to_string()));
    }

    // Terms in textual order: outermost first
    let mut terms = Vec::new();
    let mut term = String::new();
    for c in chain.chars() {
        match c {
            '(' if term.is_empty() => return Err(FetchError::EmptyChain(expression.to_string())),
            '(' | ')' => {
                if !term.is_empty() {
                    terms.push(std::mem::take(&mut term));
                }
            }
            c if c.is_whitespace() => {}
            c => term.push(c),
        }
    }
    if !term.is_empty() {
        terms.push(term);
    }
    if terms.is_empty() {
        return Err(FetchError::EmptyChain(expression.to_string()));
    }
    if terms.len() > MAX_FETCH_RULES {
        return Err(FetchError::ChainTooLong {
            expression: expression.to_string(),
            rules: terms.len(),
            max: MAX_FETCH_RULES,
        });
    }

    let mut rules = terms
        .iter()
        .enumerate()
        .map(|(i, term)| parse_term(term, if i == 0 { size } else { 8 }))
        .collect::<Result<Vec<_>, _>>()?;
    rules.reverse();

    if !matches!(rules.first(), Some(FetchRule::ReadRegister(_))) {
        return Err(FetchError::BaseNotRegister(expression.to_string()));
    }
    Ok(rules)
}

fn parse_term(term: &str, size: usize) -> Result<FetchRule, FetchError> {
    if let Some(name) = term.strip_prefix('%') {
        return Register::from_name(name)
            .map(FetchRule::ReadRegister)
            .ok_or_else(|| FetchError::UnsupportedRegister(name.to_string()));
    }
    let offset: i32 = term
        .parse()
        .map_err(|_| FetchError::InvalidOffset(term.to_string()))?;
    Ok(FetchRule::ReadMemory { offset, size })
}
