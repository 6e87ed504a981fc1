use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::isa::{Class, IsaSpec, OperandClass};

/// Comment block written at the top of generated disassembly files.
pub const DISASS_HEADER: &str = "\
\t\t######################################################################################
\t\t# Disassembly automatically generated. For this file to be compiled again, you will  #
\t\t# have to specify the operands disass_r0, disass_r1, ... in your variables CSV file. #
\t\t# These registers are simply the mapped ones at incremental addresses, meaning that  #
\t\t# you should populate your CSV file with lines like:                                 #
\t\t#        disass_r0,0                                                                 #
\t\t#        disass_r1,1                                                                 #
\t\t#        ... and so on                                                               #
\t\t#                                                                                    #
\t\t# Note that the assembler contains these disassembly registers by default, but if    #
\t\t# somehow these have changed (e.g. registers size and so on), an update MUST be      #
\t\t# provided in the variables CSV file for the assembler to properly find them.        #
\t\t#                                                                                    #
\t\t# Also note that instructions with patches could have dummy operands: you will have  #
\t\t# to know what the exact patch is doing to interpret the disassembly.                #
\t\t######################################################################################
";

/// Pulls machine words out of `text`. Lines carrying a double-quoted
/// bitstring (the VHDL memory-image format) contribute the quoted
/// part; a line that is itself a bare bitstring counts too. Anything
/// else is skipped. A width mismatch on an accepted bitstring is
/// fatal.
pub fn extract_words(text: &str, word_bits: usize) -> Result<Vec<String>> {
    let mut words = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = crate::parse::strip_comment(raw);
        if line.is_empty() {
            continue;
        }
        let is_bits = |s: &str| !s.is_empty() && s.bytes().all(|b| b == b'0' || b == b'1');
        let candidate = match (line.find('"'), line.rfind('"')) {
            (Some(a), Some(b)) if a < b && is_bits(&line[a + 1..b]) => &line[a + 1..b],
            _ if is_bits(line) => line,
            _ => continue,
        };
        if candidate.len() != word_bits {
            return Err(Error::syntax(
                line_no,
                raw,
                format!("bitstring is {} bits, expected {word_bits}", candidate.len()),
            ));
        }
        words.push(candidate.to_string());
    }
    Ok(words)
}

/// One decoded word, before label synthesis.
struct DecodedLine {
    addr: u32,
    barrier: bool,
    stop: bool,
    text: String,
    /// Branch target, when the word is a branch.
    target: Option<u32>,
}

fn field(word: &str, range: std::ops::Range<usize>) -> u64 {
    u64::from_str_radix(&word[range], 2).unwrap_or(0)
}

/// Left-to-right bit-field reader over one word.
struct Cursor<'a> {
    word: &'a str,
    at: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> u64 {
        let v = field(self.word, self.at..self.at + n);
        self.at += n;
        v
    }
}

fn decode_word(spec: &IsaSpec, addr: u32, word: &str, line_no: usize) -> Result<DecodedLine> {
    let w = &spec.widths;
    if word.len() != w.word_bits() || !word.bytes().all(|b| b == b'0' || b == b'1') {
        return Err(Error::syntax(
            line_no,
            word,
            format!("expected a {}-bit word", w.word_bits()),
        ));
    }
    let mut cur = Cursor { word, at: 0 };
    let stop = cur.take(1) == 1;
    let barrier = cur.take(1) == 1;
    let class_bits = cur.take(w.class) as u8;
    let opcode = cur.take(w.opcode) as u8;
    let ext_arith = cur.take(1) == 1;
    let has_patch = cur.take(1) == 1;
    let patch = cur.take(w.patch) as u32;
    let masked = cur.take(1) == 1;
    let operand_area = cur.at;
    let opa = cur.take(w.operand);
    let opb = cur.take(w.operand);
    let opc = cur.take(w.operand);

    let matches: Vec<_> = spec
        .descriptors
        .iter()
        .filter(|d| {
            !matches!(d.class, Class::Pseudo | Class::Alias)
                && d.class.code() == Some(class_bits)
                && d.opcode == Some(opcode)
        })
        .collect();
    let desc = match matches.as_slice() {
        [one] => *one,
        [] => {
            return Err(Error::resolution(
                line_no,
                word,
                format!("no instruction with class {class_bits:#04b} and opcode {opcode:#06b}"),
            ))
        }
        _ => {
            return Err(Error::resolution(
                line_no,
                word,
                format!("class {class_bits:#04b} opcode {opcode:#06b} is ambiguous"),
            ))
        }
    };

    let mut text = desc.mnemonic.to_string();
    if masked {
        text.push_str(",M");
    }
    if ext_arith {
        text.push_str(",X");
    }
    if has_patch {
        let _ = write!(text, ",p{patch}");
    }

    let mut target = None;
    if desc.class == Class::Branch {
        // The immediate spans the whole operand area, right-justified.
        let imm = field(word, operand_area..word.len()) as u32;
        if desc.slots[0] == Some(OperandClass::Immediate) {
            let _ = write!(text, "\t.Label{imm}L");
            target = Some(imm);
        }
    } else {
        for (slot, value) in desc.slots.iter().zip([opa, opb, opc]) {
            match slot {
                None => {}
                Some(OperandClass::Register) => {
                    let _ = write!(text, "\tdisass_r{value}");
                }
                Some(OperandClass::Const) => {
                    let _ = write!(text, "\t{value}");
                }
                Some(OperandClass::Flag) => {
                    let name = spec.flag_name(value as u8).ok_or_else(|| {
                        Error::resolution(
                            line_no,
                            word,
                            format!("flag address {value:#07b} matches no known flag"),
                        )
                    })?;
                    let _ = write!(text, "\t{name}");
                }
                Some(OperandClass::Immediate) => unreachable!("immediates are branch-only"),
            }
        }
    }

    Ok(DecodedLine { addr, barrier, stop, text, target })
}

/// Disassembles a word list into source text that the assembler
/// accepts back, reproducing the same words. Branch targets get
/// synthesized `.Label<N>L` labels; BARRIER and STOP bits are
/// re-expanded to their own lines around the owning instruction.
pub fn disassemble(spec: &IsaSpec, words: &[String]) -> Result<String> {
    let mut lines = Vec::with_capacity(words.len());
    let mut targets = BTreeSet::new();
    for (idx, word) in words.iter().enumerate() {
        let line = decode_word(spec, idx as u32, word, idx + 1)?;
        if let Some(t) = line.target {
            targets.insert(t);
        }
        lines.push(line);
    }
    for t in &targets {
        if *t as usize >= lines.len() {
            tracing::warn!(dest = *t, "branch target outside the decoded range");
        }
    }

    let mut out = String::new();
    for line in &lines {
        if targets.contains(&line.addr) {
            let _ = writeln!(out, ".Label{}L:", line.addr);
        }
        if line.barrier {
            out.push_str("\tBARRIER\n");
        }
        let _ = writeln!(out, "\t{}\t# {:#04x}", line.text, line.addr);
        if line.stop {
            out.push_str("\tSTOP\n");
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn extracts_quoted_and_bare_words() {
        let spec = IsaSpec::default();
        let n = spec.widths.word_bits();
        let quoted = format!("\t\t\"{}\", -- 0x0\n{}\n", "0".repeat(n), "1".repeat(n));
        let words = extract_words(&quoted, n).unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[1], "1".repeat(n));
    }

    #[test]
    fn width_mismatch_is_fatal() {
        let err = extract_words("0101\n", 32).unwrap_err();
        assert!(matches!(err, Error::Syntax { line: 1, .. }));
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let spec = IsaSpec::default();
        // ARITH class with opcode 15, which no instruction carries.
        let word = format!("00{}{}{}", "01", "1111", "0".repeat(24));
        let err = disassemble(&spec, &[word]).unwrap_err();
        assert!(matches!(err, Error::Resolution { .. }));
    }

    #[test]
    fn short_word_is_a_syntax_error() {
        let spec = IsaSpec::default();
        let err = disassemble(&spec, &["01000001".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Syntax { line: 1, .. }));
        let err = disassemble(&spec, &["x".repeat(32)]).unwrap_err();
        assert!(matches!(err, Error::Syntax { line: 1, .. }));
    }

    #[test]
    fn stop_and_barrier_are_reexpanded() {
        let spec = IsaSpec::default();
        let prog = crate::asm::assemble(&spec, "BARRIER\nNNADD one, one, dtmp\nSTOP\n").unwrap();
        let text = disassemble(&spec, &prog.words).unwrap();
        let lines: Vec<_> = text.lines().map(str::trim).collect();
        assert_eq!(lines[0], "BARRIER");
        assert!(lines[1].starts_with("NNADD"));
        assert_eq!(lines[2], "STOP");
    }
}
