//! End-to-end scenarios driving the library without the CLI: assemble a
//! program, load it at 0x0000, and run it against a captured UART.

use tiny16::mem::IRQ_FLAG;
use tiny16::runtime::STACK_TOP;
use tiny16::{AsmParser, Memory, RunState, TestIo};

fn run_source(src: &'static str) -> (RunState, TestIo) {
    let image = AsmParser::new(src)
        .unwrap()
        .parse()
        .unwrap()
        .assemble()
        .unwrap();
    let io = TestIo::new();
    let mut mem = Memory::with_io(Box::new(io.clone()));
    mem.load(&image, 0x0000);
    let mut cpu = RunState::new(mem);
    cpu.run();
    (cpu, io)
}

#[test]
fn hello_emits_exactly_fourteen_bytes() {
    let src = r#"
        LDI r0, 'H'
        OUT r0, [0xFF00]
        LDI r0, 'e'
        OUT r0, [0xFF00]
        LDI r0, 'l'
        OUT r0, [0xFF00]
        LDI r0, 'l'
        OUT r0, [0xFF00]
        LDI r0, 'o'
        OUT r0, [0xFF00]
        LDI r0, 44     ; ','
        OUT r0, [0xFF00]
        LDI r0, ' '
        OUT r0, [0xFF00]
        LDI r0, 'W'
        OUT r0, [0xFF00]
        LDI r0, 'o'
        OUT r0, [0xFF00]
        LDI r0, 'r'
        OUT r0, [0xFF00]
        LDI r0, 'l'
        OUT r0, [0xFF00]
        LDI r0, 'd'
        OUT r0, [0xFF00]
        LDI r0, '!'
        OUT r0, [0xFF00]
        LDI r0, '\n'
        OUT r0, [0xFF00]
        HALT
    "#;
    let (cpu, io) = run_source(src);
    assert!(cpu.halted());
    assert_eq!(io.output().len(), 14);
    assert_eq!(io.output(), b"Hello, World!\n");
}

#[test]
fn fibonacci_fills_buffer() {
    let src = r#"
        ; a=0, b=1, ten iterations writing a into the word buffer
        LDI r0, 0
        LDI r1, 1
        LDI r2, 10
        LDI r3, buf
    loop:
        ST  r0, [r3+0]
        ADDI r3, #2
        MOV r4, r1
        ADD r1, r0
        MOV r0, r4
        ADDI r2, #-1
        JNZ loop
        HALT
    buf:
        .word 0, 0, 0, 0, 0, 0, 0, 0, 0, 0
    "#;
    let (mut cpu, _) = run_source(src);
    assert!(cpu.halted());
    assert_eq!(cpu.reg(2), 0);

    // Four LDIs (16 bytes) + six narrow ops (12) + JNZ (4) + HALT (2).
    let buf = 0x0022;
    let expected = [0u16, 1, 1, 2, 3, 5, 8, 13, 21, 34];
    for (i, want) in expected.iter().enumerate() {
        assert_eq!(cpu.mem_mut().read16(buf + 2 * i as u16), *want, "word {i}");
    }
    assert_eq!(cpu.reg(3), buf + 20);
}

#[test]
fn timer_latches_after_five_steps() {
    let src = r#"
        LDI r0, 5
        STB r0, [0xFF12]
        LDI r0, 0
        STB r0, [0xFF13]
        NOP
        NOP
        NOP
        NOP
        NOP
        HALT
    "#;
    let (mut cpu, _) = run_source(src);
    assert!(cpu.mem().irq_pending());

    cpu.mem_mut().write8(IRQ_FLAG, 1);
    assert!(!cpu.mem().irq_pending());
}

#[test]
fn call_returns_past_the_operand() {
    let src = r#"
        CALL routine
        HALT
    routine:
        RET
    "#;
    let (cpu, _) = run_source(src);
    assert!(cpu.halted());
    // CALL is 4 bytes, so RET lands on the HALT at 0x0004; the halted PC
    // sits one control word later.
    assert_eq!(cpu.pc(), 0x0006);
    assert_eq!(cpu.reg(7), STACK_TOP);
}

#[test]
fn unknown_opcode_reports_faulting_address() {
    let mut mem = Memory::with_io(Box::new(TestIo::new()));
    mem.load(&[0xFF, 0xFF], 0x0000);
    let mut cpu = RunState::new(mem);
    cpu.step();
    assert!(cpu.halted());
    let fault = cpu.fault().unwrap();
    assert_eq!(fault.pc, 0x0000);
}

#[test]
fn timer_counts_executed_instructions() {
    let src = r#"
        NOP
        LDI r0, 1
        ADD r0, r0
        HALT
    "#;
    let (cpu, _) = run_source(src);
    assert_eq!(cpu.mem().timer(), 4);
}
