use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::isa::{AliasSlot, Class, IsaSpec, Mnemonic, OperandClass};
use crate::parse::{self, Line, Options};

/// A resolved operand of an abstract instruction. The emulator consumes
/// these directly; no re-parsing of source text ever happens after
/// pass 2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Operand {
    Register { name: String, addr: u8 },
    Const(u64),
    Flag { name: String, addr: u8 },
    Immediate { label: String, addr: u32 },
}

impl Operand {
    /// The raw value this slot encodes: register or flag address,
    /// constant, or immediate target.
    pub fn value(&self) -> u64 {
        match self {
            Operand::Register { addr, .. } | Operand::Flag { addr, .. } => u64::from(*addr),
            Operand::Const(v) => *v,
            Operand::Immediate { addr, .. } => u64::from(*addr),
        }
    }
}

/// The canonical intermediate form of one source line that survived
/// pass 2, pseudo lines included. Pseudo lines carry the address of the
/// following real instruction (they consume no address themselves).
#[derive(Debug, Clone, Serialize)]
pub struct AbstractInstruction {
    pub addr: u32,
    pub mnemonic: Mnemonic,
    pub options: Options,
    pub operands: [Option<Operand>; 3],
    /// Source text, for diagnostics only.
    pub text: String,
    pub line_no: usize,
}

/// Label name (leading dot kept, colon dropped) -> instruction address.
pub type LabelTable = BTreeMap<String, u32>;

/// Output of a full assembly: the serialized bitstring stream plus the
/// abstract listing the emulator runs.
#[derive(Debug, Clone)]
pub struct Program {
    pub words: Vec<String>,
    pub listing: Vec<AbstractInstruction>,
    pub labels: LabelTable,
    pub word_bits: usize,
}

/// Pass 1: bind labels to addresses. A label binds to the current
/// address counter; only non-pseudo instruction lines advance it
/// (BARRIER/STOP annotate a neighbouring instruction and own no
/// address). Unknown or malformed lines are left for pass 2 to reject.
pub fn resolve_labels(spec: &IsaSpec, text: &str) -> LabelTable {
    let mut labels = LabelTable::new();
    let mut address = 0u32;
    for line in text.lines() {
        if let Some(name) = parse::label_of(line) {
            labels.insert(name.to_string(), address);
        } else if let Some(m) = parse::leading_mnemonic(line) {
            if spec.descriptor(m).class != Class::Pseudo {
                address += 1;
            }
        }
    }
    labels
}

/// One encoded word before final serialization. Keeping records mutable
/// lets a later STOP line set the stop bit of the previous instruction
/// without string surgery.
#[derive(Debug, Clone, Copy)]
struct WordRecord {
    stop: bool,
    barrier: bool,
    /// All fields below the stop/barrier bits, packed msb-first.
    body: u64,
    body_bits: usize,
}

impl WordRecord {
    fn render(&self) -> String {
        let mut out = String::with_capacity(self.body_bits + 2);
        out.push(if self.stop { '1' } else { '0' });
        out.push(if self.barrier { '1' } else { '0' });
        for i in (0..self.body_bits).rev() {
            out.push(if (self.body >> i) & 1 == 1 { '1' } else { '0' });
        }
        out
    }
}

struct FieldPacker {
    acc: u64,
    bits: usize,
}

impl FieldPacker {
    fn new() -> Self {
        Self { acc: 0, bits: 0 }
    }

    fn push(&mut self, nbits: usize, val: u64) {
        debug_assert!(nbits == 64 || val < (1u64 << nbits));
        self.acc = (self.acc << nbits) | val;
        self.bits += nbits;
    }
}

/// Expands an alias invocation into its target mnemonic and operand
/// token list.
fn expand_alias(
    tmpl: &[AliasSlot],
    operands: &[String],
    line_no: usize,
    text: &str,
) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(tmpl.len());
    for slot in tmpl {
        match slot {
            AliasSlot::Input(i) => {
                let op = operands.get(*i).ok_or_else(|| {
                    Error::syntax(line_no, text, format!("alias needs operand {i}"))
                })?;
                out.push(op.clone());
            }
            AliasSlot::Literal(s) => out.push((*s).to_string()),
        }
    }
    Ok(out)
}

fn resolve_operand(
    spec: &IsaSpec,
    class: OperandClass,
    token: &str,
    labels: &LabelTable,
    line_no: usize,
    text: &str,
) -> Result<Operand> {
    let widths = &spec.widths;
    match class {
        OperandClass::Register => match spec.operands.get(token) {
            Some(&addr) => Ok(Operand::Register {
                name: token.to_string(),
                addr,
            }),
            None => Err(Error::syntax(
                line_no,
                text,
                format!("unknown operand `{token}` (is it defined in the variables CSV?)"),
            )),
        },
        OperandClass::Flag => match spec.flags.get(token) {
            Some(&addr) => Ok(Operand::Flag {
                name: token.to_string(),
                addr,
            }),
            None => Err(Error::syntax(
                line_no,
                text,
                format!("unknown flag `{token}`"),
            )),
        },
        OperandClass::Const => {
            let value = parse_value(token).ok_or_else(|| {
                Error::syntax(line_no, text, format!("bad constant `{token}`"))
            })?;
            if value >= (1u64 << widths.constant) {
                return Err(Error::range(
                    line_no,
                    text,
                    format!(
                        "constant {value} exceeds the {} bit size",
                        widths.constant
                    ),
                ));
            }
            Ok(Operand::Const(value))
        }
        OperandClass::Immediate => {
            if !token.starts_with('.') {
                return Err(Error::syntax(
                    line_no,
                    text,
                    format!("branch target `{token}` is not a label (have you defined it?)"),
                ));
            }
            let addr = *labels.get(token).ok_or_else(|| {
                Error::resolution(line_no, text, format!("undefined label `{token}`"))
            })?;
            if u64::from(addr) >= (1u64 << widths.immediate) {
                return Err(Error::range(
                    line_no,
                    text,
                    format!(
                        "label `{token}` at {addr} exceeds the {}-bit immediate",
                        widths.immediate
                    ),
                ));
            }
            Ok(Operand::Immediate {
                label: token.to_string(),
                addr,
            })
        }
    }
}

/// Parses a decimal, `0x` hex or `0b` binary literal.
pub fn parse_value(token: &str) -> Option<u64> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = token.strip_prefix("0b").or_else(|| token.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2).ok()
    } else {
        token.parse::<u64>().ok()
    }
}

/// Pass 2: alias expansion, operand validation and word encoding.
pub fn encode(spec: &IsaSpec, text: &str, labels: &LabelTable) -> Result<Program> {
    let widths = &spec.widths;
    let body_bits = widths.word_bits() - 2;
    let mut records: Vec<WordRecord> = Vec::new();
    let mut listing: Vec<AbstractInstruction> = Vec::new();
    let mut barrier_pending = false;
    let mut current_addr = 0u32;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let (mut mnemonic, options, mut operand_tokens) =
            match parse::parse_line(raw, line_no)? {
                Line::Blank | Line::Label(_) => continue,
                Line::Instr {
                    mnemonic,
                    options,
                    operands,
                } => (mnemonic, options, operands),
            };

        let mut desc = spec.descriptor(mnemonic);
        if desc.class == Class::Alias {
            if operand_tokens.len() != desc.arity() {
                return Err(Error::syntax(
                    line_no,
                    raw,
                    format!(
                        "{} expects {} operand(s), got {}",
                        mnemonic,
                        desc.arity(),
                        operand_tokens.len()
                    ),
                ));
            }
            let (target, tmpl) = desc.alias.unwrap();
            operand_tokens = expand_alias(tmpl, &operand_tokens, line_no, raw)?;
            mnemonic = target;
            desc = spec.descriptor(mnemonic);
        }

        if operand_tokens.len() != desc.arity() {
            return Err(Error::syntax(
                line_no,
                raw,
                format!(
                    "{} expects {} operand(s), got {}",
                    mnemonic,
                    desc.arity(),
                    operand_tokens.len()
                ),
            ));
        }
        if let Some(id) = options.patch {
            if u64::from(id) >= (1u64 << widths.patch) {
                return Err(Error::range(
                    line_no,
                    raw,
                    format!("patch number {id} exceeds {}-bit width", widths.patch),
                ));
            }
        }

        // Resolve operands into slot positions.
        let mut operands: [Option<Operand>; 3] = [None, None, None];
        let mut tok_iter = operand_tokens.iter();
        for (slot_idx, slot) in desc.slots.iter().enumerate() {
            if let Some(class) = slot {
                let token = tok_iter.next().unwrap();
                operands[slot_idx] =
                    Some(resolve_operand(spec, *class, token, labels, line_no, raw)?);
            }
        }

        if desc.class == Class::Pseudo {
            match mnemonic {
                Mnemonic::BARRIER => barrier_pending = true,
                Mnemonic::STOP => {
                    // Back-patch the previously emitted instruction. A
                    // leading STOP with nothing before it is dropped at
                    // serialization (all placeholder bits default 0).
                    if let Some(prev) = records.last_mut() {
                        prev.stop = true;
                    }
                }
                _ => unreachable!(),
            }
        } else {
            let mut pack = FieldPacker::new();
            pack.push(widths.class, u64::from(desc.class.code().unwrap()));
            pack.push(widths.opcode, u64::from(desc.opcode.unwrap()));
            pack.push(1, u64::from(options.ext_arith));
            match options.patch {
                Some(id) => {
                    pack.push(1, 1);
                    pack.push(widths.patch, u64::from(id));
                }
                None => pack.push(1 + widths.patch, 0),
            }
            pack.push(1, u64::from(options.masked));
            match desc.class {
                Class::Branch => {
                    // Single immediate, right-justified in the combined
                    // operand field; RET encodes all zeroes.
                    let imm = operands[0].as_ref().map(|o| o.value()).unwrap_or(0);
                    pack.push(3 * widths.operand, imm);
                }
                _ => {
                    for op in &operands {
                        pack.push(widths.operand, op.as_ref().map(|o| o.value()).unwrap_or(0));
                    }
                }
            }
            debug_assert_eq!(pack.bits, body_bits);
            records.push(WordRecord {
                stop: false,
                barrier: std::mem::take(&mut barrier_pending),
                body: pack.acc,
                body_bits,
            });
        }

        listing.push(AbstractInstruction {
            addr: current_addr,
            mnemonic,
            options,
            operands,
            text: raw.trim().to_string(),
            line_no,
        });
        if desc.class != Class::Pseudo {
            current_addr += 1;
        }
    }

    Ok(Program {
        words: records.iter().map(WordRecord::render).collect(),
        listing,
        labels: labels.clone(),
        word_bits: widths.word_bits(),
    })
}

/// Two-pass assembly of a full source file.
pub fn assemble(spec: &IsaSpec, text: &str) -> Result<Program> {
    let labels = resolve_labels(spec, text);
    encode(spec, text, &labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_lines_do_not_advance_addresses() {
        let spec = IsaSpec::default();
        let text = "\
NNADD, zero, zero, zero
BARRIER
.here:
STOP
NNSUB, zero, zero, zero
";
        let labels = resolve_labels(&spec, text);
        assert_eq!(labels[".here"], 1);
        let prog = encode(&spec, text, &labels).unwrap();
        assert_eq!(prog.words.len(), 2);
        let addrs: Vec<u32> = prog.listing.iter().map(|i| i.addr).collect();
        assert_eq!(addrs, [0, 1, 1, 1]);
    }

    #[test]
    fn stop_backpatches_previous_word() {
        let spec = IsaSpec::default();
        let prog = assemble(&spec, "NNADD, zero, zero, zero\nSTOP\n").unwrap();
        assert_eq!(prog.words.len(), 1);
        assert!(prog.words[0].starts_with('1'));
    }

    #[test]
    fn barrier_flags_the_next_word() {
        let spec = IsaSpec::default();
        let prog = assemble(&spec, "BARRIER\nNNADD, zero, zero, zero\n").unwrap();
        assert_eq!(prog.words.len(), 1);
        assert_eq!(&prog.words[0][..2], "01");
    }

    #[test]
    fn alias_expansion_clear_and_mov() {
        let spec = IsaSpec::default();
        let prog = assemble(&spec, "NNCLR dtmp\nNNMOV a, b\n").unwrap();
        let clr = &prog.listing[0];
        assert_eq!(clr.mnemonic, Mnemonic::NNADD);
        assert_eq!(
            clr.operands[0],
            Some(Operand::Register {
                name: "zero".into(),
                addr: 31
            })
        );
        assert_eq!(
            clr.operands[2],
            Some(Operand::Register {
                name: "dtmp".into(),
                addr: 20
            })
        );
        let mov = &prog.listing[1];
        assert_eq!(mov.mnemonic, Mnemonic::NNADD);
        assert_eq!(
            mov.operands[1],
            Some(Operand::Register {
                name: "zero".into(),
                addr: 31
            })
        );
    }

    #[test]
    fn constant_at_field_limit_rejected() {
        let spec = IsaSpec::default();
        // Constant width is 2 bits: 3 is fine, 4 is out of range.
        assert!(assemble(&spec, "NNRNDS 3, dtmp\n").is_ok());
        assert!(matches!(
            assemble(&spec, "NNRNDS 4, dtmp\n"),
            Err(Error::Range { .. })
        ));
    }

    #[test]
    fn undefined_label_is_resolution_error() {
        let spec = IsaSpec::default();
        assert!(matches!(
            assemble(&spec, "J .nowhere\n"),
            Err(Error::Resolution { .. })
        ));
    }

    #[test]
    fn patch_width_enforced() {
        let spec = IsaSpec::default();
        assert!(assemble(&spec, "NNADD,p63 zero, zero, zero\n").is_ok());
        assert!(matches!(
            assemble(&spec, "NNADD,p64 zero, zero, zero\n"),
            Err(Error::Range { .. })
        ));
    }
}
