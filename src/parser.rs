//! Transforms source lines into AIR.

use std::fmt::Display;
use std::str::FromStr;

use miette::{miette, LabeledSpan, Report, Result, Severity};

use crate::air::{Air, AirStmt, Wide};
use crate::lexer::{self, Tok};
use crate::symbol::{DirKind, Register};

/// Lowers assembly text into an [`Air`] program, one statement per line.
///
/// The source must outlive the produced diagnostics, so it is taken as
/// `&'static str`; the driver leaks the file contents once per run.
pub struct AsmParser {
    src: &'static str,
    air: Air,
}

/// An `LD`/`ST` address operand: either `[rb+imm5]` or `[addr16]`.
enum MemOperand {
    Short { base: Register, offs: i8 },
    Abs(Wide),
}

impl AsmParser {
    pub fn new(src: &'static str) -> Result<Self> {
        Ok(AsmParser {
            src,
            air: Air::new(src),
        })
    }

    /// Create AIR out of the source lines.
    pub fn parse(mut self) -> Result<Air> {
        for line in lexer::lines(self.src) {
            let mut tok = line.strip_comment().trimmed();

            while let Some((label, rest)) = tok.take_label() {
                self.air.add_stmt(
                    AirStmt::Label {
                        name: label.text().to_lowercase(),
                    },
                    label.span(),
                );
                tok = rest;
            }
            if tok.is_empty() {
                continue;
            }

            let stmt = self.parse_stmt(tok)?;
            self.air.add_stmt(stmt, tok.span());
        }
        Ok(self.air)
    }

    fn parse_stmt(&self, tok: Tok) -> Result<AirStmt> {
        let (word, rest) = tok.split_word();
        let mnemonic = word.text().to_lowercase();

        if mnemonic.starts_with('.') {
            let Ok(dir) = DirKind::from_str(&mnemonic) else {
                return Err(self.err(
                    word,
                    "parse::dir",
                    "available directives are .org, .word and .stringz",
                    "invalid directive",
                    format!("Unknown directive `{mnemonic}`"),
                ));
            };
            return self.parse_directive(dir, tok, rest);
        }
        self.parse_instr(&mnemonic, word, rest)
    }

    fn parse_directive(&self, dir: DirKind, line: Tok, rest: Tok) -> Result<AirStmt> {
        match dir {
            DirKind::Org => {
                let parts = self.operands(line, rest, ".org VALUE", 1)?;
                let addr = self.expect_int(parts[0], Bits::Unsigned(16))? as u16;
                Ok(AirStmt::Org { addr })
            }
            DirKind::Word => {
                let parts = rest.split_operands();
                if parts.is_empty() {
                    return Err(self.err(
                        line,
                        "parse::operands",
                        "write it as `.word VALUE, ...` with numbers or labels",
                        "missing values",
                        "Directive .word expects at least one value".into(),
                    ));
                }
                let vals = parts
                    .iter()
                    .map(|part| self.wide_operand(*part))
                    .collect::<Result<Vec<_>>>()?;
                Ok(AirStmt::Word { vals })
            }
            DirKind::Stringz => Ok(AirStmt::Stringz {
                bytes: self.string_literal(rest)?,
            }),
        }
    }

    /// Scan a `"..."` literal into bytes, resolving `\n`, `\t` and `\0`.
    /// Any other escaped character stands for itself.
    fn string_literal(&self, tok: Tok) -> Result<Vec<u8>> {
        let text = tok.text().as_bytes();
        if text.first() != Some(&b'"') {
            return Err(self.err(
                tok,
                "parse::str_lit",
                "write it as `.stringz \"text\"`",
                "not a string literal",
                "Expected a string literal".into(),
            ));
        }

        let mut bytes = Vec::new();
        let mut esc = false;
        for b in &text[1..] {
            if esc {
                bytes.push(match b {
                    b'n' => b'\n',
                    b't' => b'\t',
                    b'0' => 0,
                    other => *other,
                });
                esc = false;
            } else {
                match b {
                    b'\\' => esc = true,
                    b'"' => return Ok(bytes),
                    other => bytes.push(*other),
                }
            }
        }
        Err(self.err(
            tok,
            "parse::str_lit",
            "make sure to close string literals with a \" character",
            "unterminated literal",
            "Unterminated string literal".into(),
        ))
    }

    fn parse_instr(&self, mnemonic: &str, word: Tok, rest: Tok) -> Result<AirStmt> {
        match mnemonic {
            "nop" => {
                self.operands(word, rest, "NOP", 0)?;
                Ok(AirStmt::Nop)
            }
            "halt" => {
                self.operands(word, rest, "HALT", 0)?;
                Ok(AirStmt::Halt)
            }
            "ret" => {
                self.operands(word, rest, "RET", 0)?;
                Ok(AirStmt::Ret)
            }
            "ldi" => {
                let parts = self.operands(word, rest, "LDI rd, imm16", 2)?;
                Ok(AirStmt::Ldi {
                    rd: self.expect_reg(parts[0])?,
                    imm: self.wide_operand(parts[1])?,
                })
            }
            "mov" | "add" | "sub" | "and" | "or" | "xor" | "cmp" => {
                let usage = "rd, rs";
                let parts = self.operands(word, rest, usage, 2)?;
                let rd = self.expect_reg(parts[0])?;
                let rs = self.expect_reg(parts[1])?;
                Ok(match mnemonic {
                    "mov" => AirStmt::Mov { rd, rs },
                    "add" => AirStmt::Add { rd, rs },
                    "sub" => AirStmt::Sub { rd, rs },
                    "and" => AirStmt::And { rd, rs },
                    "or" => AirStmt::Or { rd, rs },
                    "xor" => AirStmt::Xor { rd, rs },
                    _ => AirStmt::Cmp { rd, rs },
                })
            }
            "not" => {
                let parts = self.operands(word, rest, "NOT rd", 1)?;
                Ok(AirStmt::Not {
                    rd: self.expect_reg(parts[0])?,
                })
            }
            "shl" | "shr" => {
                let parts = self.operands(word, rest, "rd, 0..7", 2)?;
                let rd = self.expect_reg(parts[0])?;
                let count = self.expect_int(parts[1], Bits::Unsigned(3))? as u8;
                Ok(if mnemonic == "shl" {
                    AirStmt::Shl { rd, count }
                } else {
                    AirStmt::Shr { rd, count }
                })
            }
            "addi" | "cmpi" => {
                let parts = self.operands(word, rest, "rd, imm8", 2)?;
                let rd = self.expect_reg(parts[0])?;
                let imm = self.expect_int(parts[1], Bits::Signed(8))? as i8;
                Ok(if mnemonic == "addi" {
                    AirStmt::Addi { rd, imm }
                } else {
                    AirStmt::Cmpi { rd, imm }
                })
            }
            "ld" => {
                let parts = self.operands(word, rest, "LD rd, [..]", 2)?;
                let rd = self.expect_reg(parts[0])?;
                Ok(match self.mem_operand(parts[1])? {
                    MemOperand::Short { base, offs } => AirStmt::LdOffs { rd, base, offs },
                    MemOperand::Abs(addr) => AirStmt::Ld { rd, addr },
                })
            }
            "st" => {
                let parts = self.operands(word, rest, "ST rs, [..]", 2)?;
                let rs = self.expect_reg(parts[0])?;
                Ok(match self.mem_operand(parts[1])? {
                    MemOperand::Short { base, offs } => AirStmt::StOffs { rs, base, offs },
                    MemOperand::Abs(addr) => AirStmt::St { rs, addr },
                })
            }
            "ldb" => {
                let parts = self.operands(word, rest, "LDB rd, [addr16]", 2)?;
                Ok(AirStmt::Ldb {
                    rd: self.expect_reg(parts[0])?,
                    addr: self.addr_operand(parts[1])?,
                })
            }
            "stb" => {
                let parts = self.operands(word, rest, "STB rs, [addr16]", 2)?;
                Ok(AirStmt::Stb {
                    rs: self.expect_reg(parts[0])?,
                    addr: self.addr_operand(parts[1])?,
                })
            }
            "jmp" | "jz" | "jnz" | "jc" | "jn" | "call" => {
                let parts = self.operands(word, rest, "addr16", 1)?;
                let target = self.wide_operand(parts[0])?;
                Ok(match mnemonic {
                    "jmp" => AirStmt::Jmp { target },
                    "jz" => AirStmt::Jz { target },
                    "jnz" => AirStmt::Jnz { target },
                    "jc" => AirStmt::Jc { target },
                    "jn" => AirStmt::Jn { target },
                    _ => AirStmt::Call { target },
                })
            }
            "in" => {
                let parts = self.operands(word, rest, "IN rd, [addr16]", 2)?;
                Ok(AirStmt::In {
                    rd: self.expect_reg(parts[0])?,
                    addr: self.addr_operand(parts[1])?,
                })
            }
            "out" => {
                let parts = self.operands(word, rest, "OUT rs, [addr16]", 2)?;
                Ok(AirStmt::Out {
                    rs: self.expect_reg(parts[0])?,
                    addr: self.addr_operand(parts[1])?,
                })
            }
            _ => Err(self.err(
                word,
                "parse::mnemonic",
                "check the instruction list for available mnemonics",
                "unknown mnemonic",
                format!("Unknown mnemonic `{}`", word.text()),
            )),
        }
    }

    /// Split operands and check their count against the mnemonic's arity.
    fn operands<'a>(&self, at: Tok, rest: Tok<'a>, usage: &str, count: usize) -> Result<Vec<Tok<'a>>> {
        let parts = rest.split_operands();
        if parts.len() != count {
            return Err(self.err(
                at,
                "parse::operands",
                &format!("write it as `{usage}`"),
                "wrong operand count",
                format!("Expected {count} operand(s), found {}", parts.len()),
            ));
        }
        Ok(parts)
    }

    fn expect_reg(&self, tok: Tok) -> Result<Register> {
        lexer::parse_reg(tok.text()).ok_or_else(|| {
            self.err(
                tok,
                "parse::register",
                "registers are named r0 through r7",
                "not a register",
                format!("Expected a register, found `{}`", tok.text()),
            )
        })
    }

    fn expect_int(&self, tok: Tok, bits: Bits) -> Result<i32> {
        let Some(val) = lexer::parse_int(tok.text()) else {
            return Err(self.err(
                tok,
                "parse::literal",
                "decimal, 0x hex, #-prefixed and character literals are accepted",
                "not a numeric literal",
                format!("Expected a numeric literal, found `{}`", tok.text()),
            ));
        };
        if !bits.contains(val) {
            return Err(self.err(
                tok,
                "parse::literal_range",
                &format!("this operand must fit in {bits} bits"),
                "out-of-range literal",
                format!("Literal {val} is out of range"),
            ));
        }
        Ok(val)
    }

    /// A 16-bit value or a label reference.
    fn wide_operand(&self, tok: Tok) -> Result<Wide> {
        if let Some(val) = lexer::parse_int(tok.text()) {
            if !Bits::Either(16).contains(val) {
                return Err(self.err(
                    tok,
                    "parse::literal_range",
                    "this operand must fit in 16 bits",
                    "out-of-range literal",
                    format!("Literal {val} is out of range"),
                ));
            }
            return Ok(Wide::Lit(val as u16));
        }
        if lexer::is_ident(tok.text()) {
            return Ok(Wide::Label(tok.text().to_lowercase(), tok.span()));
        }
        Err(self.err(
            tok,
            "parse::operand",
            "expected a 16-bit value or a label name",
            "not a value or label",
            format!("Malformed operand `{}`", tok.text()),
        ))
    }

    /// A bracketed absolute address: `[0x1234]` or `[label]`.
    fn addr_operand(&self, tok: Tok) -> Result<Wide> {
        let Some(inner) = tok.strip_brackets() else {
            return Err(self.err(
                tok,
                "parse::operand",
                "address operands are bracketed, like [0x1234] or [label]",
                "missing brackets",
                format!("Malformed address operand `{}`", tok.text()),
            ));
        };
        self.wide_operand(inner)
    }

    /// An `LD`/`ST` operand; a `+` inside the brackets selects the short
    /// register-offset form.
    fn mem_operand(&self, tok: Tok) -> Result<MemOperand> {
        let Some(inner) = tok.strip_brackets() else {
            return Err(self.err(
                tok,
                "parse::operand",
                "memory operands are bracketed, like [label] or [r1+2]",
                "missing brackets",
                format!("Malformed memory operand `{}`", tok.text()),
            ));
        };
        if inner.text().contains('+') {
            let (base, offs) = inner.split_plus().unwrap();
            return Ok(MemOperand::Short {
                base: self.expect_reg(base)?,
                offs: self.expect_int(offs, Bits::Signed(5))? as i8,
            });
        }
        Ok(MemOperand::Abs(self.wide_operand(inner)?))
    }

    fn err(&self, at: Tok, code: &str, help: &str, label: &str, msg: String) -> Report {
        miette!(
            severity = Severity::Error,
            code = code.to_string(),
            help = help.to_string(),
            labels = vec![LabeledSpan::at(at.span(), label.to_string())],
            "{msg}",
        )
        .with_source_code(self.src)
    }
}

/// Bit widths for literal range checks.
enum Bits {
    Signed(u8),
    Unsigned(u8),
    /// Accepts both signed and unsigned interpretations of the width.
    Either(u8),
}

impl Bits {
    fn contains(&self, val: i32) -> bool {
        match self {
            Bits::Signed(n) => {
                let range = 1i32 << (n - 1);
                (-range..range).contains(&val)
            }
            Bits::Unsigned(n) => (0..1i32 << n).contains(&val),
            Bits::Either(n) => {
                let signed = 1i32 << (n - 1);
                (-signed..1i32 << n).contains(&val)
            }
        }
    }
}

impl Display for Bits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val = match self {
            Bits::Signed(val) | Bits::Unsigned(val) | Bits::Either(val) => val,
        };
        f.write_str(&val.to_string())
    }
}
