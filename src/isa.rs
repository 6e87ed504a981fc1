use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::asm::AbstractInstruction;
use crate::emu::{self, ExecutionContext};
use crate::error::Result;

/// Calibrated bit-width parameters of the instruction encoding and of
/// the bignum datapath. Defaults match the reference hardware; the
/// calibration pass may overwrite any of them.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BitWidths {
    pub bignum: usize,
    pub operand: usize,
    pub patch: usize,
    pub immediate: usize,
    pub constant: usize,
    pub opcode: usize,
    pub class: usize,
}

impl Default for BitWidths {
    fn default() -> Self {
        Self {
            bignum: 528,
            operand: 5,
            patch: 6,
            immediate: 9,
            constant: 2,
            opcode: 4,
            class: 2,
        }
    }
}

impl BitWidths {
    /// Total width of one encoded instruction word:
    /// [stop][barrier][class][opcode][X][has-patch][patch][M][opa][opb][opc].
    pub fn word_bits(&self) -> usize {
        5 + self.class + self.opcode + self.patch + 3 * self.operand
    }
}

/// Encoding class of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Class {
    Nop,
    Arith,
    Branch,
    /// BARRIER/STOP: encoding-time annotations on a neighbouring real
    /// instruction, never independently addressed.
    Pseudo,
    /// Expands to another mnemonic with an operand template.
    Alias,
}

impl Class {
    pub fn code(self) -> Option<u8> {
        match self {
            Class::Nop => Some(0b00),
            Class::Arith => Some(0b01),
            Class::Branch => Some(0b10),
            Class::Pseudo | Class::Alias => None,
        }
    }
}

/// What a descriptor slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperandClass {
    Register,
    Flag,
    Const,
    Immediate,
}

/// One slot of an alias substitution template.
#[derive(Debug, Clone, Copy)]
pub enum AliasSlot {
    /// Take the caller's operand at this position.
    Input(usize),
    /// A literal operand supplied by the alias itself.
    Literal(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Mnemonic {
    NOP,
    NNADD,
    NNSUB,
    NNSRL,
    NNSLL,
    NNRND,
    TESTPARS,
    NNXOR,
    FPREDC,
    TESTPAR,
    NNRNDM,
    NNDIV2,
    NNRNDS,
    NNRNDF,
    NNSRLS,
    J,
    JZ,
    JSN,
    JODD,
    JKAP,
    JL,
    JLSN,
    RET,
    BARRIER,
    STOP,
    NNCLR,
    NNMOV,
    B,
    BZ,
    BSN,
    BODD,
    BKAP,
    CALL,
    CALLSN,
}

impl Mnemonic {
    pub const ALL: [Mnemonic; 34] = [
        Mnemonic::NOP,
        Mnemonic::NNADD,
        Mnemonic::NNSUB,
        Mnemonic::NNSRL,
        Mnemonic::NNSLL,
        Mnemonic::NNRND,
        Mnemonic::TESTPARS,
        Mnemonic::NNXOR,
        Mnemonic::FPREDC,
        Mnemonic::TESTPAR,
        Mnemonic::NNRNDM,
        Mnemonic::NNDIV2,
        Mnemonic::NNRNDS,
        Mnemonic::NNRNDF,
        Mnemonic::NNSRLS,
        Mnemonic::J,
        Mnemonic::JZ,
        Mnemonic::JSN,
        Mnemonic::JODD,
        Mnemonic::JKAP,
        Mnemonic::JL,
        Mnemonic::JLSN,
        Mnemonic::RET,
        Mnemonic::BARRIER,
        Mnemonic::STOP,
        Mnemonic::NNCLR,
        Mnemonic::NNMOV,
        Mnemonic::B,
        Mnemonic::BZ,
        Mnemonic::BSN,
        Mnemonic::BODD,
        Mnemonic::BKAP,
        Mnemonic::CALL,
        Mnemonic::CALLSN,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Mnemonic::NOP => "NOP",
            Mnemonic::NNADD => "NNADD",
            Mnemonic::NNSUB => "NNSUB",
            Mnemonic::NNSRL => "NNSRL",
            Mnemonic::NNSLL => "NNSLL",
            Mnemonic::NNRND => "NNRND",
            Mnemonic::TESTPARS => "TESTPARS",
            Mnemonic::NNXOR => "NNXOR",
            Mnemonic::FPREDC => "FPREDC",
            Mnemonic::TESTPAR => "TESTPAR",
            Mnemonic::NNRNDM => "NNRNDM",
            Mnemonic::NNDIV2 => "NNDIV2",
            Mnemonic::NNRNDS => "NNRNDS",
            Mnemonic::NNRNDF => "NNRNDF",
            Mnemonic::NNSRLS => "NNSRLS",
            Mnemonic::J => "J",
            Mnemonic::JZ => "JZ",
            Mnemonic::JSN => "JSN",
            Mnemonic::JODD => "JODD",
            Mnemonic::JKAP => "JKAP",
            Mnemonic::JL => "JL",
            Mnemonic::JLSN => "JLSN",
            Mnemonic::RET => "RET",
            Mnemonic::BARRIER => "BARRIER",
            Mnemonic::STOP => "STOP",
            Mnemonic::NNCLR => "NNCLR",
            Mnemonic::NNMOV => "NNMOV",
            Mnemonic::B => "B",
            Mnemonic::BZ => "BZ",
            Mnemonic::BSN => "BSN",
            Mnemonic::BODD => "BODD",
            Mnemonic::BKAP => "BKAP",
            Mnemonic::CALL => "CALL",
            Mnemonic::CALLSN => "CALLSN",
        }
    }
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mnemonic {
    type Err = ();

    /// Mnemonics are case-insensitive in assembly text.
    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        let up = s.to_ascii_uppercase();
        Mnemonic::ALL
            .iter()
            .copied()
            .find(|m| m.name() == up)
            .ok_or(())
    }
}

/// Semantic handler invoked by the emulator for one abstract
/// instruction. Absent for aliases (they are expanded away at encode
/// time and never reach the emulator).
pub type Handler = fn(&AbstractInstruction, &mut ExecutionContext) -> Result<()>;

/// Static description of one mnemonic: encoding shape, per-slot operand
/// classes, alias template and emulation handler.
#[derive(Clone)]
pub struct Descriptor {
    pub mnemonic: Mnemonic,
    pub class: Class,
    /// Opcode bit pattern within the class. None for PSEUDO/ALIAS,
    /// which are never encoded.
    pub opcode: Option<u8>,
    /// Suffix of the matching `OPCODE_<CLASS>_<TAG>` VHDL constant,
    /// used by calibration to cross-check opcode values.
    pub hw_tag: Option<&'static str>,
    pub slots: [Option<OperandClass>; 3],
    pub alias: Option<(Mnemonic, &'static [AliasSlot])>,
    pub exec: Option<Handler>,
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("mnemonic", &self.mnemonic)
            .field("class", &self.class)
            .field("opcode", &self.opcode)
            .field("slots", &self.slots)
            .finish()
    }
}

impl Descriptor {
    pub fn arity(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Names of the emulation-only arithmetic flags. These are never
/// encoded in the binary; they only exist in the execution context.
pub const INTERNAL_FLAGS: [&str; 4] = ["%Carith", "%Cshift", "%Z", "%SN"];

/// The complete instruction-set definition: bit widths, descriptor
/// table, operand symbol table and flag symbol table.
///
/// Construct one per engine invocation (or share immutably); calibrate
/// it before handing it to an assembler/disassembler/emulator and do
/// not mutate it afterwards.
#[derive(Debug, Clone)]
pub struct IsaSpec {
    pub widths: BitWidths,
    pub descriptors: Vec<Descriptor>,
    /// Operand name -> register address. Many names deliberately alias
    /// the same address: temporaries of different algorithm phases
    /// share hardware registers.
    pub operands: BTreeMap<String, u8>,
    /// Flag name -> flag address (disjoint from register storage).
    pub flags: BTreeMap<String, u8>,
}

impl Default for IsaSpec {
    fn default() -> Self {
        Self {
            widths: BitWidths::default(),
            descriptors: default_descriptors(),
            operands: DEFAULT_OPERANDS
                .iter()
                .map(|&(n, a)| (n.to_string(), a))
                .collect(),
            flags: DEFAULT_FLAGS
                .iter()
                .map(|&(n, a)| (n.to_string(), a))
                .collect(),
        }
    }
}

impl IsaSpec {
    pub fn descriptor(&self, m: Mnemonic) -> &Descriptor {
        // The table is total over Mnemonic by construction.
        self.descriptors.iter().find(|d| d.mnemonic == m).unwrap()
    }

    pub fn descriptor_mut(&mut self, m: Mnemonic) -> &mut Descriptor {
        self.descriptors
            .iter_mut()
            .find(|d| d.mnemonic == m)
            .unwrap()
    }

    /// Lookup by the hardware opcode tag, as spelled in the VHDL
    /// package constants.
    pub fn descriptor_by_tag(&self, tag: &str) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.hw_tag == Some(tag))
    }

    /// Reverse flag lookup for disassembly.
    pub fn flag_name(&self, addr: u8) -> Option<&str> {
        self.flags
            .iter()
            .find(|&(_, &a)| a == addr)
            .map(|(n, _)| n.as_str())
    }

    /// True if `name` is one of the five encodable flags.
    pub fn is_flag(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }

    /// True if `name` is an emulation-only arithmetic flag.
    pub fn is_internal_flag(name: &str) -> bool {
        INTERNAL_FLAGS.contains(&name)
    }
}

const REG3: [Option<OperandClass>; 3] = [
    Some(OperandClass::Register),
    Some(OperandClass::Register),
    Some(OperandClass::Register),
];
const IMM1: [Option<OperandClass>; 3] = [Some(OperandClass::Immediate), None, None];
const NONE3: [Option<OperandClass>; 3] = [None, None, None];

const OP0: &[AliasSlot] = &[AliasSlot::Input(0)];
const CLR_TMPL: &[AliasSlot] = &[
    AliasSlot::Literal("zero"),
    AliasSlot::Literal("zero"),
    AliasSlot::Input(0),
];
const MOV_TMPL: &[AliasSlot] = &[
    AliasSlot::Input(0),
    AliasSlot::Literal("zero"),
    AliasSlot::Input(1),
];

fn arith(
    mnemonic: Mnemonic,
    opcode: u8,
    hw_tag: &'static str,
    slots: [Option<OperandClass>; 3],
    exec: Handler,
) -> Descriptor {
    Descriptor {
        mnemonic,
        class: Class::Arith,
        opcode: Some(opcode),
        hw_tag: Some(hw_tag),
        slots,
        alias: None,
        exec: Some(exec),
    }
}

fn branch(mnemonic: Mnemonic, opcode: u8, hw_tag: &'static str, exec: Handler) -> Descriptor {
    let slots = if mnemonic == Mnemonic::RET { NONE3 } else { IMM1 };
    Descriptor {
        mnemonic,
        class: Class::Branch,
        opcode: Some(opcode),
        hw_tag: Some(hw_tag),
        slots,
        alias: None,
        exec: Some(exec),
    }
}

fn pseudo(mnemonic: Mnemonic, exec: Handler) -> Descriptor {
    Descriptor {
        mnemonic,
        class: Class::Pseudo,
        opcode: None,
        hw_tag: None,
        slots: NONE3,
        alias: None,
        exec: Some(exec),
    }
}

fn alias(
    mnemonic: Mnemonic,
    target: Mnemonic,
    tmpl: &'static [AliasSlot],
    slots: [Option<OperandClass>; 3],
) -> Descriptor {
    Descriptor {
        mnemonic,
        class: Class::Alias,
        opcode: None,
        hw_tag: None,
        slots,
        alias: Some((target, tmpl)),
        exec: None,
    }
}

/// Built-in descriptor table. Opcode values must match the VHDL
/// `OPCODE_*` constants of the target hardware; the calibration pass
/// cross-checks them.
fn default_descriptors() -> Vec<Descriptor> {
    use Mnemonic::*;
    use OperandClass::*;
    let reg_const_flag = [Some(Register), Some(Const), Some(Flag)];
    let reg_none_flag = [Some(Register), None, Some(Flag)];
    let reg_none_reg = [Some(Register), None, Some(Register)];
    let none_none_reg = [None, None, Some(Register)];
    let none_const_reg = [None, Some(Const), Some(Register)];
    let reg_const_reg = [Some(Register), Some(Const), Some(Register)];
    let reg1 = [Some(Register), None, None];
    let reg2 = [Some(Register), Some(Register), None];

    vec![
        Descriptor {
            mnemonic: NOP,
            class: Class::Nop,
            opcode: Some(0b0000),
            hw_tag: None,
            slots: NONE3,
            alias: None,
            exec: Some(emu::nop),
        },
        arith(NNADD, 0b0001, "ADD", REG3, emu::nnadd),
        arith(NNSUB, 0b0010, "SUB", REG3, emu::nnsub),
        arith(NNSRL, 0b0011, "SRL", reg_none_reg, emu::nnsrl),
        arith(NNSLL, 0b0100, "SLL", reg_none_reg, emu::nnsll),
        arith(NNRND, 0b0101, "RND", none_none_reg, emu::nnrnd),
        arith(TESTPARS, 0b0110, "TSH", reg_const_flag, emu::testpars),
        arith(NNXOR, 0b0111, "XOR", REG3, emu::nnxor),
        arith(FPREDC, 0b1000, "RED", REG3, emu::fpredc),
        arith(TESTPAR, 0b1001, "TST", reg_none_flag, emu::testpar),
        arith(NNRNDM, 0b1010, "RNM", none_none_reg, emu::nnrndm),
        arith(NNDIV2, 0b1011, "DIV", reg_none_reg, emu::nndiv2),
        arith(NNRNDS, 0b1100, "RNH", none_const_reg, emu::nnrnds),
        arith(NNRNDF, 0b1101, "RNF", none_const_reg, emu::nnrndf),
        arith(NNSRLS, 0b1110, "SRH", reg_const_reg, emu::nnsrls),
        branch(J, 0b0001, "B", emu::j),
        branch(JZ, 0b0010, "BZ", emu::jz),
        branch(JSN, 0b0011, "BSN", emu::jsn),
        branch(JODD, 0b0100, "BODD", emu::jodd),
        branch(JKAP, 0b0101, "BKAP", emu::jkap),
        branch(JL, 0b0110, "CALL", emu::jl),
        branch(JLSN, 0b0111, "CALLSN", emu::jlsn),
        branch(RET, 0b1000, "RET", emu::ret),
        pseudo(BARRIER, emu::barrier),
        pseudo(STOP, emu::stop),
        alias(NNCLR, NNADD, CLR_TMPL, reg1),
        alias(NNMOV, NNADD, MOV_TMPL, reg2),
        alias(B, J, OP0, IMM1),
        alias(BZ, JZ, OP0, IMM1),
        alias(BSN, JSN, OP0, IMM1),
        alias(BODD, JODD, OP0, IMM1),
        alias(BKAP, JKAP, OP0, IMM1),
        alias(CALL, JL, OP0, IMM1),
        alias(CALLSN, JLSN, OP0, IMM1),
    ]
}

/// The five externally-visible flags and their one-hot addresses.
pub const DEFAULT_FLAGS: [(&str, u8); 5] = [
    ("%mu0", 0b10000),
    ("%kb0", 0b01000),
    ("%par", 0b00100),
    ("%kap", 0b00010),
    ("%kapP", 0b00001),
];

/// Built-in operand symbol table. Names alias freely: the hardware has
/// 32 wide registers and the curve routines reuse them across phases.
/// The `disass_rN` names give every raw address a stable spelling so
/// that disassembly output can be re-assembled.
pub const DEFAULT_OPERANDS: [(&str, u8); 201] = [
    ("p", 0), ("a", 1), ("b", 2), ("q", 3), ("k", 4), ("XR1", 6),
    ("YR1", 7), ("XR0", 4), ("YR0", 5), ("ZR01", 26), ("one", 30), ("zero", 31),
    ("R", 29), ("kb0", 4), ("kb1", 5), ("phi0", 10), ("phi1", 11), ("kap0", 12),
    ("kap1", 13), ("kapP0", 14), ("kapP1", 15), ("R2modp", 19), ("XPBK", 27), ("YPBK", 28),
    ("ZPBK", 22), ("inverse", 21), ("dtmp", 20), ("XmXU", 8), ("twop", 24), ("red", 22),
    ("dy1", 15), ("dy2", 16), ("dx1", 23), ("dx2", 17), ("du", 25), ("dv", 26),
    ("dx", 27), ("dy", 28), ("r0", 25), ("r1", 26), ("two", 23), ("pmtwo", 17),
    ("idx", 15), ("aX", 15), ("right", 15), ("mustbezero", 21), ("YY", 16), ("left", 16),
    ("XX", 17), ("XXX", 17), ("XR", 17), ("R3modp", 20), ("mu0", 26), ("mu1", 27),
    ("kap0msk", 8), ("kap1msk", 9), ("kapP0msk", 16), ("kapP1msk", 17), ("phi0msk", 20), ("phi1msk", 21),
    ("qsh0", 8), ("qsh1", 9), ("btmp0", 10), ("btmp1", 11), ("alf", 12), ("m0", 10),
    ("m1", 11), ("alfmsk", 15), ("ZZ", 8), ("ZZZZ", 8), ("aZZZZ", 8), ("2YR1", 8),
    ("M", 9), ("MpSmT", 9), ("Q", 9), ("YYYY", 16), ("QQ", 16), ("S", 17),
    ("SmT", 17), ("X1YY", 18), ("lambdasq", 22), ("MM", 22), ("lambda", 21), ("lambdacu", 21),
    ("Y1Z1", 21), ("A", 8), ("BmX", 8), ("W", 8), ("F", 8), ("C", 9),
    ("CmB", 9), ("BpC", 9), ("H", 9), ("J", 9), ("YmY", 16), ("G", 20),
    ("D", 17), ("DmB", 17), ("Xtmp", 20), ("Ytmp", 21), ("XmXC", 21), ("YpY", 20),
    ("B", 23), ("A1", 25), ("CCmB", 25), ("XSUB", 8), ("YSUB", 16), ("XR0tmp", 16),
    ("YR0tmp", 17), ("ZPBKsq", 14), ("ZPBKcu", 14), ("ZR01sq", 21), ("ZR01cu", 21), ("ZR01END", 25),
    ("XR1tmp", 22), ("YR1tmp", 20), ("invsq", 10), ("invcu", 11), ("patchme", 21), ("HH", 10),
    ("tHH", 10), ("Ia", 10), ("I", 12), ("Ja", 9), ("r", 11), ("V", 10),
    ("rsq", 12), ("JpV", 13), ("Jp2V", 13), ("YmJ", 9), ("tYmJ", 9), ("VmX", 10),
    ("rVmX", 10), ("XR0bk", 14), ("YR0bk", 15), ("XR1bk", 28), ("YR1bk", 12), ("XADD", 17),
    ("K", 16), ("YADD", 16), ("Ec", 25), ("BmXC", 8), ("MD", 8), ("Msq", 21),
    ("N", 8), ("Nsq", 8), ("Nsq0", 23), ("E", 9), ("L", 16), ("XpE", 20),
    ("BpL", 17), ("twoB", 21), ("threeB", 23), ("EpN", 25), ("YpZ", 21), ("YpZsq", 21),
    ("twoS", 23), ("Rmodp", 29), ("Qs", 9), ("AZ", 8), ("KK", 16), ("BZ", 23),
    ("BZd", 23), ("Xup", 8), ("Yup", 9), ("Ztmp", 25), ("Yopp", 21), ("Ykeep", 16),
    ("Xkeep", 20), ("disass_r0", 0), ("disass_r1", 1), ("disass_r2", 2), ("disass_r3", 3), ("disass_r4", 4),
    ("disass_r5", 5), ("disass_r6", 6), ("disass_r7", 7), ("disass_r8", 8), ("disass_r9", 9), ("disass_r10", 10),
    ("disass_r11", 11), ("disass_r12", 12), ("disass_r13", 13), ("disass_r14", 14), ("disass_r15", 15), ("disass_r16", 16),
    ("disass_r17", 17), ("disass_r18", 18), ("disass_r19", 19), ("disass_r20", 20), ("disass_r21", 21), ("disass_r22", 22),
    ("disass_r23", 23), ("disass_r24", 24), ("disass_r25", 25), ("disass_r26", 26), ("disass_r27", 27), ("disass_r28", 28),
    ("disass_r29", 29), ("disass_r30", 30), ("disass_r31", 31),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_table_is_total_and_unique() {
        let spec = IsaSpec::default();
        for m in Mnemonic::ALL {
            let n = spec.descriptors.iter().filter(|d| d.mnemonic == m).count();
            assert_eq!(n, 1, "{m} must have exactly one descriptor");
        }
    }

    #[test]
    fn aliases_resolve_to_non_alias() {
        let spec = IsaSpec::default();
        for d in &spec.descriptors {
            if let Some((target, _)) = d.alias {
                assert_ne!(spec.descriptor(target).class, Class::Alias);
                assert!(spec.descriptor(target).exec.is_some());
            }
        }
    }

    #[test]
    fn class_opcode_pairs_unique_for_encodable() {
        let spec = IsaSpec::default();
        let mut seen = std::collections::HashSet::new();
        for d in &spec.descriptors {
            if matches!(d.class, Class::Pseudo | Class::Alias) {
                continue;
            }
            assert!(seen.insert((d.class.code().unwrap(), d.opcode.unwrap())));
        }
    }

    #[test]
    fn mnemonic_parse_is_case_insensitive() {
        assert_eq!("nnadd".parse::<Mnemonic>(), Ok(Mnemonic::NNADD));
        assert_eq!("FpRedC".parse::<Mnemonic>(), Ok(Mnemonic::FPREDC));
        assert!("NNMUL".parse::<Mnemonic>().is_err());
    }

    #[test]
    fn default_word_width_is_32() {
        assert_eq!(BitWidths::default().word_bits(), 32);
    }
}
