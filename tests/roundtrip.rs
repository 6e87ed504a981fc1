use ipecc_rs::disasm::{disassemble, extract_words, DISASS_HEADER};
use ipecc_rs::{assemble, IsaSpec};

// A program touching every operand class, both option bits, aliases,
// pseudo lines and forward/backward branches.
const KITCHEN_SINK: &str = "\
.startL_export:
	NNCLR dtmp
	BARRIER
	NNADD a, b, dtmp
	NNADD,X a, b, dtmp
	NNSUB,M a, b, dtmp
	NNSRL a, dtmp
	NNSLL a, dtmp
	NNDIV2 a, dtmp
	NNXOR a, b, dtmp
	FPREDC a, b, dtmp
	NNRND dtmp
	NNRNDM dtmp
	NNRNDS 2, dtmp
	NNRNDF 1, dtmp
	NNSRLS dtmp, 2, dtmp
	TESTPAR a, %par
	TESTPARS a, 0, %kap
	JZ .forwardL
	B .startL_export
.forwardL:
	CALL .subL
	NOP
	STOP
.subL:
	NNMOV a, b
	RET
";

#[test]
fn disassembly_reassembles_to_identical_words() {
    let spec = IsaSpec::default();
    let first = assemble(&spec, KITCHEN_SINK).unwrap();
    let text = disassemble(&spec, &first.words).unwrap();
    let second = assemble(&spec, &text).unwrap();
    assert_eq!(first.words, second.words);
}

#[test]
fn disassembly_survives_its_own_header() {
    let spec = IsaSpec::default();
    let first = assemble(&spec, KITCHEN_SINK).unwrap();
    let text = format!("{DISASS_HEADER}{}", disassemble(&spec, &first.words).unwrap());
    let second = assemble(&spec, &text).unwrap();
    assert_eq!(first.words, second.words);
}

#[test]
fn synthesized_labels_land_on_branch_targets() {
    let spec = IsaSpec::default();
    let prog = assemble(&spec, ".topL:\nNOP\nJ .topL\n").unwrap();
    let text = disassemble(&spec, &prog.words).unwrap();
    assert!(text.contains(".Label0L:"));
    assert!(text.contains("J\t.Label0L"));
}

#[test]
fn stop_pair_has_no_intervening_label() {
    let spec = IsaSpec::default();
    let prog = assemble(&spec, "NNADD zero, zero, zero\nSTOP\n").unwrap();
    let text = disassemble(&spec, &prog.words).unwrap();
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    assert!(lines[0].starts_with("NNADD"));
    assert_eq!(lines[1], "STOP");
}

#[test]
fn vhdl_image_feeds_back_into_the_disassembler() {
    let spec = IsaSpec::default();
    let prog = assemble(&spec, "NNADD a, b, dtmp\nSTOP\n").unwrap();
    let image = ipecc_rs::vhdl::render_iram(&prog);
    let words = extract_words(&image, spec.widths.word_bits()).unwrap();
    assert_eq!(words, prog.words);
}
