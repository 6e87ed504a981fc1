use ipecc_rs::{assemble, Error, IsaSpec};

// Builds the expected 32-bit word for the default field layout:
// stop(1) barrier(1) class(2) opcode(4) X(1) haspatch(1) patch(6)
// M(1) opa(5) opb(5) opc(5).
fn word(
    stop: u8,
    barrier: u8,
    class: &str,
    opcode: &str,
    x: u8,
    patch: Option<u32>,
    m: u8,
    ops: &str,
) -> String {
    let mut w = format!("{stop}{barrier}{class}{opcode}{x}");
    match patch {
        Some(id) => w.push_str(&format!("1{id:06b}")),
        None => w.push_str("0000000"),
    }
    w.push_str(&format!("{m}{ops}"));
    assert_eq!(w.len(), 32);
    w
}

#[test]
fn nnadd_field_layout() {
    let spec = IsaSpec::default();
    // zero lives at address 31.
    let prog = assemble(&spec, "NNADD zero, zero, zero\n").unwrap();
    assert_eq!(
        prog.words,
        [word(0, 0, "01", "0001", 0, None, 0, "111111111111111")]
    );
}

#[test]
fn options_set_their_bits() {
    let spec = IsaSpec::default();
    let prog = assemble(
        &spec,
        "NNADD,X zero, zero, zero\nNNADD,M zero, zero, zero\nNNADD,p9 zero, zero, zero\n",
    )
    .unwrap();
    let regs = "111111111111111";
    assert_eq!(prog.words[0], word(0, 0, "01", "0001", 1, None, 0, regs));
    assert_eq!(prog.words[1], word(0, 0, "01", "0001", 0, None, 1, regs));
    assert_eq!(prog.words[2], word(0, 0, "01", "0001", 0, Some(9), 0, regs));
}

#[test]
fn branch_immediate_is_right_justified() {
    let spec = IsaSpec::default();
    let text = "\
	NOP
	NOP
	NOP
	NOP
	NOP
.hereL:
	J .hereL
";
    let prog = assemble(&spec, text).unwrap();
    assert_eq!(
        prog.words[5],
        word(0, 0, "10", "0001", 0, None, 0, "000000000000101")
    );
}

#[test]
fn branch_aliases_encode_like_their_targets() {
    let spec = IsaSpec::default();
    let a = assemble(&spec, ".lL:\nB .lL\nBZ .lL\nCALL .lL\n").unwrap();
    let b = assemble(&spec, ".lL:\nJ .lL\nJZ .lL\nJL .lL\n").unwrap();
    assert_eq!(a.words, b.words);
}

#[test]
fn ret_encodes_zero_operand_field() {
    let spec = IsaSpec::default();
    let prog = assemble(&spec, "RET\n").unwrap();
    assert_eq!(
        prog.words,
        [word(0, 0, "10", "1000", 0, None, 0, "000000000000000")]
    );
}

#[test]
fn flags_encode_one_hot() {
    let spec = IsaSpec::default();
    // %par is 0b00100 in the flag slot.
    let prog = assemble(&spec, "TESTPAR zero, %par\n").unwrap();
    assert_eq!(
        prog.words,
        [word(0, 0, "01", "1001", 0, None, 0, "111110000000100")]
    );
}

#[test]
fn stop_and_barrier_bits_attach_to_neighbours() {
    let spec = IsaSpec::default();
    let text = "\
	NOP
	BARRIER
	NNADD zero, zero, zero
	STOP
";
    let prog = assemble(&spec, text).unwrap();
    assert_eq!(prog.words.len(), 2);
    assert_eq!(&prog.words[0][..2], "00");
    // Second word carries both the barrier (from the line before it)
    // and the stop (from the line after it).
    assert_eq!(&prog.words[1][..2], "11");
}

#[test]
fn barrier_survives_an_intervening_stop() {
    let spec = IsaSpec::default();
    let text = "\
	NOP
	BARRIER
	STOP
	NNADD zero, zero, zero
";
    let prog = assemble(&spec, text).unwrap();
    assert_eq!(prog.words.len(), 2);
    // The STOP back-patches the NOP; the pending barrier still lands
    // on the next real instruction.
    assert_eq!(&prog.words[0][..2], "10");
    assert_eq!(&prog.words[1][..2], "01");
}

#[test]
fn arity_mismatch_is_a_syntax_error() {
    let spec = IsaSpec::default();
    assert!(matches!(
        assemble(&spec, "NNADD zero, zero\n"),
        Err(Error::Syntax { line: 1, .. })
    ));
    assert!(matches!(
        assemble(&spec, "RET zero\n"),
        Err(Error::Syntax { .. })
    ));
}

#[test]
fn unknown_operand_points_at_the_line() {
    let spec = IsaSpec::default();
    let err = assemble(&spec, "NOP\nNNADD nosuch, zero, zero\n").unwrap_err();
    match err {
        Error::Syntax { line, .. } => assert_eq!(line, 2),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn exported_labels_survive_into_the_table() {
    let spec = IsaSpec::default();
    let prog = assemble(&spec, ".beginL_export:\nNOP\n.innerL:\nSTOP\n").unwrap();
    assert_eq!(prog.labels[".beginL_export"], 0);
    assert_eq!(prog.labels[".innerL"], 1);
}
