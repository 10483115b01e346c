//! Assembly intermediate representation and image emission.
//!
//! The parser lowers source lines into [`AirStmt`]s; [`Air::assemble`] then
//! runs the two passes over them: a sizing pass that assigns every label an
//! address, and an emission pass that produces the byte image, recording a
//! fixup for each label reference and patching them all at the end.

use fxhash::FxHashMap;
use miette::{miette, LabeledSpan, Report, Result, Severity};

use crate::isa::{pack, pack_imm8, Opcode};
use crate::symbol::{Register, Span};

/// A 16-bit operand that is either a resolved value or a label reference
/// to be fixed up after emission.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Wide {
    Lit(u16),
    Label(String, Span),
}

/// Single Tiny16 statement: one instruction, directive, or label binding.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AirStmt {
    /// Bind a name to the current address.
    Label { name: String },
    /// Move the location counter forward.
    Org { addr: u16 },
    /// Emit 16-bit little-endian words.
    Word { vals: Vec<Wide> },
    /// Emit string bytes plus a NUL terminator. Escapes already resolved.
    Stringz { bytes: Vec<u8> },
    Nop,
    Halt,
    Ldi { rd: Register, imm: Wide },
    Mov { rd: Register, rs: Register },
    Add { rd: Register, rs: Register },
    Sub { rd: Register, rs: Register },
    And { rd: Register, rs: Register },
    Or { rd: Register, rs: Register },
    Xor { rd: Register, rs: Register },
    Not { rd: Register },
    Shl { rd: Register, count: u8 },
    Shr { rd: Register, count: u8 },
    Addi { rd: Register, imm: i8 },
    Cmpi { rd: Register, imm: i8 },
    Cmp { rd: Register, rs: Register },
    /// Absolute load; the register offset form is [`AirStmt::LdOffs`].
    Ld { rd: Register, addr: Wide },
    St { rs: Register, addr: Wide },
    Ldb { rd: Register, addr: Wide },
    Stb { rs: Register, addr: Wide },
    LdOffs { rd: Register, base: Register, offs: i8 },
    StOffs { rs: Register, base: Register, offs: i8 },
    Jmp { target: Wide },
    Jz { target: Wide },
    Jnz { target: Wide },
    Jc { target: Wide },
    Jn { target: Wide },
    Call { target: Wide },
    Ret,
    In { rd: Register, addr: Wide },
    Out { rs: Register, addr: Wide },
}

impl AirStmt {
    /// Encoded size in bytes. Wide forms carry a 16-bit operand word.
    pub fn size(&self) -> u32 {
        use AirStmt::*;
        match self {
            Label { .. } | Org { .. } => 0,
            Word { vals } => 2 * vals.len() as u32,
            Stringz { bytes } => bytes.len() as u32 + 1,
            Ldi { .. } | Ld { .. } | St { .. } | Ldb { .. } | Stb { .. } | Jmp { .. }
            | Jz { .. } | Jnz { .. } | Jc { .. } | Jn { .. } | Call { .. } | In { .. }
            | Out { .. } => 4,
            _ => 2,
        }
    }
}

/// A statement with the span of its source text.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AsmLine {
    pub stmt: AirStmt,
    pub span: Span,
}

/// Recorded location of a label reference in the output image, patched
/// with a 16-bit little-endian address once the symbol table is complete.
struct Fixup {
    offset: usize,
    name: String,
    span: Span,
}

struct Emitter {
    bytes: Vec<u8>,
    fixups: Vec<Fixup>,
}

impl Emitter {
    fn new() -> Self {
        Emitter {
            bytes: Vec::new(),
            fixups: Vec::new(),
        }
    }

    fn emit8(&mut self, b: u8) {
        self.bytes.push(b);
    }

    fn emit16(&mut self, w: u16) {
        self.emit8((w & 0xFF) as u8);
        self.emit8((w >> 8) as u8);
    }

    fn emit_wide(&mut self, val: &Wide) {
        match val {
            Wide::Lit(v) => self.emit16(*v),
            Wide::Label(name, span) => {
                self.fixups.push(Fixup {
                    offset: self.bytes.len(),
                    name: name.clone(),
                    span: *span,
                });
                self.emit16(0);
            }
        }
    }
}

/// Parsed program, ready for the sizing and emission passes.
pub struct Air {
    src: &'static str,
    lines: Vec<AsmLine>,
}

impl Air {
    pub fn new(src: &'static str) -> Self {
        Air {
            src,
            lines: Vec::new(),
        }
    }

    pub fn add_stmt(&mut self, stmt: AirStmt, span: Span) {
        self.lines.push(AsmLine { stmt, span });
    }

    pub fn get(&self, idx: usize) -> &AsmLine {
        &self.lines[idx]
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Run both passes and produce the byte image.
    pub fn assemble(&self) -> Result<Vec<u8>> {
        let symbols = self.layout()?;
        let mut out = Emitter::new();

        for line in &self.lines {
            use AirStmt::*;
            match &line.stmt {
                Label { .. } => {}
                Org { addr } => {
                    // Layout already rejected a backwards move.
                    while out.bytes.len() < *addr as usize {
                        out.emit8(0);
                    }
                }
                Word { vals } => {
                    for val in vals {
                        out.emit_wide(val);
                    }
                }
                Stringz { bytes } => {
                    for b in bytes {
                        out.emit8(*b);
                    }
                    out.emit8(0);
                }
                Nop => out.emit16(pack(Opcode::Nop, 0, 0, 0)),
                Halt => out.emit16(pack(Opcode::Halt, 0, 0, 0)),
                Ldi { rd, imm } => {
                    out.emit16(pack(Opcode::Ldi, *rd as u8, 0, 0));
                    out.emit_wide(imm);
                }
                Mov { rd, rs } => out.emit16(pack(Opcode::Mov, *rd as u8, *rs as u8, 0)),
                Add { rd, rs } => out.emit16(pack(Opcode::Add, *rd as u8, *rs as u8, 0)),
                Sub { rd, rs } => out.emit16(pack(Opcode::Sub, *rd as u8, *rs as u8, 0)),
                And { rd, rs } => out.emit16(pack(Opcode::And, *rd as u8, *rs as u8, 0)),
                Or { rd, rs } => out.emit16(pack(Opcode::Or, *rd as u8, *rs as u8, 0)),
                Xor { rd, rs } => out.emit16(pack(Opcode::Xor, *rd as u8, *rs as u8, 0)),
                Not { rd } => out.emit16(pack(Opcode::Not, *rd as u8, 0, 0)),
                Shl { rd, count } => out.emit16(pack(Opcode::Shl, *rd as u8, 0, *count)),
                Shr { rd, count } => out.emit16(pack(Opcode::Shr, *rd as u8, 0, *count)),
                Addi { rd, imm } => out.emit16(pack_imm8(Opcode::Addi, *rd as u8, *imm as u8)),
                Cmpi { rd, imm } => out.emit16(pack_imm8(Opcode::Cmpi, *rd as u8, *imm as u8)),
                Cmp { rd, rs } => out.emit16(pack(Opcode::Cmp, *rd as u8, *rs as u8, 0)),
                Ld { rd, addr } => {
                    out.emit16(pack(Opcode::Ld, *rd as u8, 0, 0));
                    out.emit_wide(addr);
                }
                St { rs, addr } => {
                    out.emit16(pack(Opcode::St, *rs as u8, 0, 0));
                    out.emit_wide(addr);
                }
                Ldb { rd, addr } => {
                    out.emit16(pack(Opcode::Ldb, *rd as u8, 0, 0));
                    out.emit_wide(addr);
                }
                Stb { rs, addr } => {
                    out.emit16(pack(Opcode::Stb, *rs as u8, 0, 0));
                    out.emit_wide(addr);
                }
                LdOffs { rd, base, offs } => {
                    out.emit16(pack(Opcode::LdOffs, *rd as u8, *base as u8, *offs as u8))
                }
                // The base register of a short store occupies the rd field.
                StOffs { rs, base, offs } => {
                    out.emit16(pack(Opcode::StOffs, *base as u8, *rs as u8, *offs as u8))
                }
                Jmp { target } => {
                    out.emit16(pack(Opcode::Jmp, 0, 0, 0));
                    out.emit_wide(target);
                }
                Jz { target } => {
                    out.emit16(pack(Opcode::Jz, 0, 0, 0));
                    out.emit_wide(target);
                }
                Jnz { target } => {
                    out.emit16(pack(Opcode::Jnz, 0, 0, 0));
                    out.emit_wide(target);
                }
                Jc { target } => {
                    out.emit16(pack(Opcode::Jc, 0, 0, 0));
                    out.emit_wide(target);
                }
                Jn { target } => {
                    out.emit16(pack(Opcode::Jn, 0, 0, 0));
                    out.emit_wide(target);
                }
                Call { target } => {
                    out.emit16(pack(Opcode::Call, 0, 0, 0));
                    out.emit_wide(target);
                }
                Ret => out.emit16(pack(Opcode::Ret, 0, 0, 0)),
                In { rd, addr } => {
                    out.emit16(pack(Opcode::In, *rd as u8, 0, 0));
                    out.emit_wide(addr);
                }
                Out { rs, addr } => {
                    out.emit16(pack(Opcode::Out, 0, *rs as u8, 0));
                    out.emit_wide(addr);
                }
            }
        }

        self.patch(&mut out.bytes, &out.fixups, &symbols)?;
        Ok(out.bytes)
    }

    /// Sizing pass: assign an address to every label.
    fn layout(&self) -> Result<FxHashMap<String, u16>> {
        let mut symbols = FxHashMap::default();
        let mut pc: u32 = 0;

        for line in &self.lines {
            match &line.stmt {
                AirStmt::Label { name } => {
                    if symbols.insert(name.clone(), pc as u16).is_some() {
                        return Err(self.err(
                            line.span,
                            "asm::duplicate_label",
                            "each label may be defined once per file",
                            "duplicate label",
                            format!("Label `{name}` is already defined"),
                        ));
                    }
                }
                AirStmt::Org { addr } => {
                    if (*addr as u32) < pc {
                        return Err(self.err(
                            line.span,
                            "asm::org_backwards",
                            ".org may only move the location counter forward",
                            "moves backwards",
                            format!(
                                "Directive .org 0x{addr:04x} is behind the current address 0x{pc:04x}"
                            ),
                        ));
                    }
                    pc = *addr as u32;
                }
                stmt => {
                    pc += stmt.size();
                    if pc > 0x10000 {
                        return Err(self.err(
                            line.span,
                            "asm::image_overflow",
                            "the address space ends at 0xFFFF",
                            "does not fit",
                            "Program does not fit in the 16-bit address space".into(),
                        ));
                    }
                }
            }
        }
        Ok(symbols)
    }

    /// Patch every recorded fixup with its label's address.
    fn patch(
        &self,
        bytes: &mut [u8],
        fixups: &[Fixup],
        symbols: &FxHashMap<String, u16>,
    ) -> Result<()> {
        for fx in fixups {
            let Some(addr) = symbols.get(&fx.name) else {
                return Err(self.err(
                    fx.span,
                    "asm::undefined_label",
                    "labels are case-insensitive and must be defined somewhere in the file",
                    "not defined",
                    format!("Undefined label `{}`", fx.name),
                ));
            };
            bytes[fx.offset] = (addr & 0xFF) as u8;
            bytes[fx.offset + 1] = (addr >> 8) as u8;
        }
        Ok(())
    }

    fn err(&self, span: Span, code: &str, help: &str, label: &str, msg: String) -> Report {
        miette!(
            severity = Severity::Error,
            code = code.to_string(),
            help = help.to_string(),
            labels = vec![LabeledSpan::at(span, label.to_string())],
            "{msg}",
        )
        .with_source_code(self.src)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parser::AsmParser;

    fn assemble(src: &'static str) -> Vec<u8> {
        AsmParser::new(src).unwrap().parse().unwrap().assemble().unwrap()
    }

    #[test]
    fn emit_every_narrow_form() {
        assert_eq!(assemble("NOP"), [0x00, 0x00]);
        assert_eq!(assemble("HALT"), [0x00, 0x08]);
        assert_eq!(assemble("MOV r2, r3"), [0x60, 0x1A]);
        assert_eq!(assemble("ADD r1, r2"), [0x40, 0x21]);
        assert_eq!(assemble("SUB r1, r2"), [0x40, 0x29]);
        assert_eq!(assemble("AND r1, r2"), [0x40, 0x31]);
        assert_eq!(assemble("OR r1, r2"), [0x40, 0x39]);
        assert_eq!(assemble("XOR r1, r2"), [0x40, 0x41]);
        assert_eq!(assemble("NOT r4"), [0x00, 0x4C]);
        assert_eq!(assemble("SHL r1, 3"), [0x03, 0x51]);
        assert_eq!(assemble("SHR r1, 3"), [0x03, 0x59]);
        assert_eq!(assemble("ADDI r2, #-1"), [0xFF, 0x62]);
        assert_eq!(assemble("CMPI r2, 5"), [0x05, 0x6A]);
        assert_eq!(assemble("CMP r1, r2"), [0x40, 0x71]);
        assert_eq!(assemble("RET"), [0x00, 0xD8]);
    }

    #[test]
    fn emit_every_wide_form() {
        assert_eq!(assemble("LDI r1, 0x1234"), [0x00, 0x11, 0x34, 0x12]);
        assert_eq!(assemble("LD r0, [0x2000]"), [0x00, 0x78, 0x00, 0x20]);
        assert_eq!(assemble("ST r1, [0x2000]"), [0x00, 0x81, 0x00, 0x20]);
        assert_eq!(assemble("LDB r1, [0xFF01]"), [0x00, 0x89, 0x01, 0xFF]);
        assert_eq!(assemble("STB r1, [0xFF12]"), [0x00, 0x91, 0x12, 0xFF]);
        assert_eq!(assemble("JMP 0x100"), [0x00, 0xA8, 0x00, 0x01]);
        assert_eq!(assemble("JZ 0x100"), [0x00, 0xB0, 0x00, 0x01]);
        assert_eq!(assemble("JNZ 0x100"), [0x00, 0xB8, 0x00, 0x01]);
        assert_eq!(assemble("JC 0x100"), [0x00, 0xC0, 0x00, 0x01]);
        assert_eq!(assemble("JN 0x100"), [0x00, 0xC8, 0x00, 0x01]);
        assert_eq!(assemble("CALL 0x100"), [0x00, 0xD0, 0x00, 0x01]);
        assert_eq!(assemble("IN r2, [0xFF01]"), [0x00, 0xE2, 0x01, 0xFF]);
        assert_eq!(assemble("OUT r3, [0xFF00]"), [0x60, 0xE8, 0x00, 0xFF]);
    }

    #[test]
    fn emit_short_memory_forms() {
        // Short loads keep the base in the rs1 field; short stores swap it
        // into the rd field.
        assert_eq!(assemble("LD r0, [r1+2]"), [0x22, 0x98]);
        assert_eq!(assemble("ST r0, [r3+0]"), [0x00, 0xA3]);
        assert_eq!(assemble("LD r0, [r1 + -2]"), [0x3E, 0x98]);
    }

    #[test]
    fn short_and_absolute_loads_differ_in_size() {
        assert_eq!(assemble("LD r0, [r1+2]").len(), 2);
        assert_eq!(assemble("LD r0, [0x2000]").len(), 4);
    }

    #[test]
    fn word_directive_emits_little_endian() {
        assert_eq!(assemble(".word 1, 0x0203"), [0x01, 0x00, 0x03, 0x02]);
    }

    #[test]
    fn stringz_terminates() {
        assert_eq!(assemble(".stringz \"Hi\\n\""), [b'H', b'i', b'\n', 0x00]);
    }

    #[test]
    fn org_pads_forward() {
        let bytes = assemble(".org 0x0004\nHALT");
        assert_eq!(bytes, [0, 0, 0, 0, 0x00, 0x08]);
    }

    #[test]
    fn org_backwards_rejected() {
        let air = AsmParser::new("NOP\n.org 0x0000\nNOP").unwrap().parse().unwrap();
        assert!(air.assemble().is_err());
    }

    #[test]
    fn label_fixups_patched() {
        let bytes = assemble("JMP end\nNOP\nend: HALT");
        // JMP occupies 4 bytes, NOP 2, so `end` sits at 0x0006.
        assert_eq!(bytes, [0x00, 0xA8, 0x06, 0x00, 0x00, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn forward_and_backward_references() {
        let bytes = assemble("top: LDI r0, bottom\nJMP top\nbottom: .word top");
        assert_eq!(bytes.len(), 10);
        // LDI's operand points forward to `bottom` at 0x0008.
        assert_eq!(&bytes[2..4], [0x08, 0x00]);
        // JMP's operand points back to `top` at 0x0000.
        assert_eq!(&bytes[6..8], [0x00, 0x00]);
        // .word resolves the same backward reference.
        assert_eq!(&bytes[8..10], [0x00, 0x00]);
    }

    #[test]
    fn unreferenced_label_leaves_no_trace() {
        assert_eq!(assemble("unused: NOP"), assemble("NOP"));
    }

    #[test]
    fn undefined_label_fatal() {
        let air = AsmParser::new("JMP nowhere").unwrap().parse().unwrap();
        assert!(air.assemble().is_err());
    }

    #[test]
    fn duplicate_label_fatal() {
        let air = AsmParser::new("a: NOP\na: NOP").unwrap().parse().unwrap();
        assert!(air.assemble().is_err());
    }

    #[test]
    fn labels_are_case_insensitive() {
        let bytes = assemble("NOP\nBuf: .word 0\nLDI r3, BUF");
        assert_eq!(&bytes[6..8], [0x02, 0x00]);
    }
}
