//! Line-oriented scanner for Tiny16 assembly.
//!
//! The grammar is one statement per line, so the lexer hands the parser
//! source fragments ([`Tok`]) that remember their offset into the full
//! source for diagnostics.

use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

use crate::symbol::{Register, Span, SrcOffset};

lazy_static! {
    static ref LABEL: Regex = Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*:").unwrap();
    static ref REGISTER: Regex = Regex::new(r"^[rR]([0-7])$").unwrap();
    static ref IDENT: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// A fragment of one source line, carrying its offset into the source.
#[derive(Clone, Copy, Debug)]
pub struct Tok<'a> {
    text: &'a str,
    offs: usize,
}

impl<'a> Tok<'a> {
    pub fn text(&self) -> &'a str {
        self.text
    }

    pub fn span(&self) -> Span {
        Span::new(SrcOffset(self.offs), self.text.len())
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    fn sub(&self, start: usize, end: usize) -> Tok<'a> {
        Tok {
            text: &self.text[start..end],
            offs: self.offs + start,
        }
    }

    pub fn trimmed(&self) -> Tok<'a> {
        let start = self.text.len() - self.text.trim_start().len();
        let end = start + self.text[start..].trim_end().len();
        self.sub(start, end.max(start))
    }

    /// Drop everything from the first `;` onwards.
    pub fn strip_comment(&self) -> Tok<'a> {
        match self.text.find(';') {
            Some(pos) => self.sub(0, pos),
            None => *self,
        }
    }

    /// Split off a leading `name:` label definition.
    pub fn take_label(&self) -> Option<(Tok<'a>, Tok<'a>)> {
        let m = LABEL.captures(self.text)?;
        let name = m.get(1).unwrap();
        let whole = m.get(0).unwrap();
        Some((
            self.sub(name.start(), name.end()),
            self.sub(whole.end(), self.text.len()).trimmed(),
        ))
    }

    /// Split the leading whitespace-delimited word from the rest.
    pub fn split_word(&self) -> (Tok<'a>, Tok<'a>) {
        match self.text.find(char::is_whitespace) {
            Some(pos) => (self.sub(0, pos), self.sub(pos, self.text.len()).trimmed()),
            None => (*self, self.sub(self.text.len(), self.text.len())),
        }
    }

    /// Strip a surrounding `[...]`, returning the trimmed inner fragment.
    pub fn strip_brackets(&self) -> Option<Tok<'a>> {
        if self.text.len() >= 2 && self.text.starts_with('[') && self.text.ends_with(']') {
            Some(self.sub(1, self.text.len() - 1).trimmed())
        } else {
            None
        }
    }

    /// Split at the first `+`, for `[rb+imm]` short memory operands.
    pub fn split_plus(&self) -> Option<(Tok<'a>, Tok<'a>)> {
        let pos = self.text.find('+')?;
        Some((
            self.sub(0, pos).trimmed(),
            self.sub(pos + 1, self.text.len()).trimmed(),
        ))
    }

    /// Split operands on top-level commas. Commas inside `[...]` or `"..."`
    /// do not split.
    pub fn split_operands(&self) -> Vec<Tok<'a>> {
        let mut out = Vec::new();
        let mut depth = 0i32;
        let mut in_str = false;
        let mut start = 0;
        for (i, c) in self.text.char_indices() {
            match c {
                '"' => in_str = !in_str,
                '[' if !in_str => depth += 1,
                ']' if !in_str => depth -= 1,
                ',' if !in_str && depth == 0 => {
                    out.push(self.sub(start, i).trimmed());
                    start = i + 1;
                }
                _ => {}
            }
        }
        let tail = self.sub(start, self.text.len()).trimmed();
        if !tail.is_empty() {
            out.push(tail);
        }
        out
    }
}

/// Split the source into lines, keeping each line's source offset.
pub fn lines(src: &str) -> Vec<Tok<'_>> {
    let mut out = Vec::new();
    let mut offs = 0;
    for text in src.split('\n') {
        out.push(Tok { text, offs });
        offs += text.len() + 1;
    }
    out
}

pub fn is_ident(s: &str) -> bool {
    IDENT.is_match(s)
}

pub fn parse_reg(s: &str) -> Option<Register> {
    let m = REGISTER.captures(s)?;
    Register::from_str(m.get(1).unwrap().as_str()).ok()
}

/// Parse an integer literal: decimal, `0x` hex, an optional leading `#`,
/// or a character literal with `\n`/`\t`/`\0`/`\\` escapes.
pub fn parse_int(s: &str) -> Option<i32> {
    let t = s.strip_prefix('#').unwrap_or(s);

    let chars: Vec<char> = t.chars().collect();
    if chars.len() >= 3 && chars[0] == '\'' && chars[chars.len() - 1] == '\'' {
        if chars.len() == 3 {
            return Some(chars[1] as i32);
        }
        if chars.len() == 4 && chars[1] == '\\' {
            return Some(match chars[2] {
                'n' => '\n' as i32,
                't' => '\t' as i32,
                '0' => 0,
                c => c as i32,
            });
        }
        return None;
    }

    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        return i32::from_str_radix(hex, 16).ok();
    }
    t.parse::<i32>().ok()
}
