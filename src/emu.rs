use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;
use num_bigint::{BigInt, BigUint, RandBigInt};
use num_traits::{One, Signed, Zero};

use crate::asm::{AbstractInstruction, Operand};
use crate::error::{Error, Result};
use crate::isa::{BitWidths, IsaSpec, Mnemonic, DEFAULT_FLAGS, INTERNAL_FLAGS};

bitflags! {
    /// Emulation-only arithmetic flags. Never encoded in the binary;
    /// the hardware keeps them in its ALU, the emulator keeps them
    /// here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ArithFlags: u8 {
        /// Arithmetic carry (`%Carith`).
        const CARITH = 1 << 0;
        /// Shift carry (`%Cshift`).
        const CSHIFT = 1 << 1;
        /// Zero (`%Z`).
        const Z = 1 << 2;
        /// Strictly negative (`%SN`).
        const SN = 1 << 3;
    }
}

impl ArithFlags {
    /// Lookup by the `%`-prefixed spelling used in source text and
    /// initial-state input.
    pub fn by_symbol(name: &str) -> Option<ArithFlags> {
        match name {
            "%Carith" => Some(ArithFlags::CARITH),
            "%Cshift" => Some(ArithFlags::CSHIFT),
            "%Z" => Some(ArithFlags::Z),
            "%SN" => Some(ArithFlags::SN),
            _ => None,
        }
    }
}

/// Caller-supplied initial assignments for an emulation run, parsed
/// from `name=value` text.
#[derive(Debug, Clone, Default)]
pub struct InitialState {
    pub registers: Vec<(u8, BigUint)>,
    pub flags: Vec<(String, u8)>,
    pub ip: Option<u32>,
    pub lrip: Option<u32>,
    pub breakip: Option<u32>,
    pub verbose: u32,
}

/// Parses a decimal, `0x` hex or `0b` binary literal of arbitrary
/// width.
fn parse_big(token: &str) -> Option<BigUint> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        BigUint::parse_bytes(hex.as_bytes(), 16)
    } else if let Some(bin) = token.strip_prefix("0b").or_else(|| token.strip_prefix("0B")) {
        BigUint::parse_bytes(bin.as_bytes(), 2)
    } else {
        BigUint::parse_bytes(token.as_bytes(), 10)
    }
}

/// Parses `name=value` initial-state text: register names from the
/// operand symbol table, `mem[N]` raw addresses, external and internal
/// flags, `ip`, `lrip`, `breakip` and `verbose`. All failures are fatal
/// and line-numbered.
pub fn parse_initial_state(spec: &IsaSpec, text: &str) -> Result<InitialState> {
    let widths = &spec.widths;
    let mut state = InitialState::default();
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = crate::parse::strip_comment(raw);
        if line.is_empty() {
            continue;
        }
        let (lhs, rhs) = line
            .split_once('=')
            .ok_or_else(|| Error::syntax(line_no, raw, "expected name=value"))?;
        let name = lhs.trim();
        let value = rhs.trim();
        let big = parse_big(value)
            .ok_or_else(|| Error::syntax(line_no, raw, format!("bad value `{value}`")))?;

        if let Some(&addr) = spec.operands.get(name) {
            if big.bits() > widths.bignum as u64 {
                return Err(Error::range(
                    line_no,
                    raw,
                    format!("register {name} value exceeds bignum size {}", widths.bignum),
                ));
            }
            state.registers.push((addr, big));
        } else if spec.is_flag(name) || IsaSpec::is_internal_flag(name) {
            if big > BigUint::one() {
                return Err(Error::range(
                    line_no,
                    raw,
                    format!("flag {name}: only a 0/1 binary value is allowed"),
                ));
            }
            state.flags.push((name.to_string(), u8::from(big.is_one())));
        } else if let Some(inner) = name.strip_prefix("mem[").and_then(|s| s.strip_suffix(']')) {
            let addr = crate::asm::parse_value(inner.trim())
                .ok_or_else(|| Error::syntax(line_no, raw, "bad mem[] address"))?;
            if addr >= (1u64 << widths.operand) {
                return Err(Error::range(
                    line_no,
                    raw,
                    format!(
                        "@{addr} exceeds memory capacity of {} (only registers in memory are allowed)",
                        1u64 << widths.operand
                    ),
                ));
            }
            if big.bits() > widths.bignum as u64 {
                return Err(Error::range(
                    line_no,
                    raw,
                    format!("mem[{addr}] value exceeds bignum size {}", widths.bignum),
                ));
            }
            state.registers.push((addr as u8, big));
        } else if matches!(name, "ip" | "lrip" | "breakip") {
            if big.bits() > widths.immediate as u64 {
                return Err(Error::range(
                    line_no,
                    raw,
                    format!(
                        "{name} exceeds instruction bus width ({} bits)",
                        widths.immediate
                    ),
                ));
            }
            let v: u32 = big.try_into().unwrap();
            match name {
                "ip" => state.ip = Some(v),
                "lrip" => state.lrip = Some(v),
                _ => state.breakip = Some(v),
            }
        } else if name == "verbose" {
            state.verbose = big.try_into().unwrap_or(u32::MAX);
        } else {
            return Err(Error::syntax(line_no, raw, format!("unknown token `{name}`")));
        }
    }
    Ok(state)
}

/// Register file, flags, instruction pointer and masking state of one
/// emulation run. Exclusively owned by that run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// One wide register per addressable slot (2^operand-width cells).
    pub regs: Vec<BigUint>,
    /// Externally-visible flags by name.
    pub flags: BTreeMap<String, u8>,
    pub arith: ArithFlags,
    pub ip: u32,
    /// Link register, set by JL/JLSN and consumed by RET.
    pub lr: u32,
    pub breakip: Option<u32>,
    /// Cached random masks for the masked-shift instructions.
    pub masks: [BigUint; 4],
    /// Montgomery modulus: the value of register 0 at context
    /// construction. Later writes to address 0 do not change it.
    pub modulus: BigUint,
    pub widths: BitWidths,
    /// Source text of the last executed instruction, diagnostics only.
    pub last_line: Option<String>,
}

impl ExecutionContext {
    pub fn new(spec: &IsaSpec, init: &InitialState) -> Self {
        let widths = spec.widths;
        let mut regs = vec![BigUint::zero(); 1 << widths.operand];
        for (addr, val) in &init.registers {
            regs[*addr as usize] = val.clone();
        }
        let mut flags: BTreeMap<String, u8> =
            DEFAULT_FLAGS.iter().map(|&(n, _)| (n.to_string(), 0)).collect();
        let mut arith = ArithFlags::empty();
        for (name, val) in &init.flags {
            match ArithFlags::by_symbol(name) {
                Some(f) => arith.set(f, *val == 1),
                None => {
                    flags.insert(name.clone(), *val);
                }
            }
        }
        let modulus = regs[0].clone();
        Self {
            regs,
            flags,
            arith,
            ip: init.ip.unwrap_or(0),
            lr: init.lrip.unwrap_or(0),
            breakip: init.breakip,
            masks: Default::default(),
            modulus,
            widths,
            last_line: None,
        }
    }

    fn mask(&self) -> BigUint {
        (BigUint::one() << self.widths.bignum) - BigUint::one()
    }

    fn msb_set(&self, v: &BigUint) -> bool {
        v.bit(self.widths.bignum as u64 - 1)
    }

    /// Sets the zero flag from `c`, and optionally the strictly
    /// negative flag from its top bit. `c` must already be reduced.
    fn update_flags(&mut self, c: &BigUint, sn: bool) {
        self.arith.set(ArithFlags::Z, c.is_zero());
        if sn {
            let neg = self.msb_set(c);
            self.arith.set(ArithFlags::SN, neg);
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\t============ execution context ============")?;
        write!(f, "\tMemory: [ ")?;
        for (addr, v) in self.regs.iter().enumerate() {
            write!(f, "({addr}, {v:#x}), ")?;
        }
        writeln!(f, " ]")?;
        write!(f, "\tFlags: {{ ")?;
        for (name, v) in &self.flags {
            write!(f, "{name}: {v}, ")?;
        }
        for name in INTERNAL_FLAGS {
            let set = self.arith.contains(ArithFlags::by_symbol(name).unwrap());
            write!(f, "{name}: {}, ", u8::from(set))?;
        }
        writeln!(f, "}}")?;
        writeln!(f, "\tIP={:#x} LRIP={:#x}", self.ip, self.lr)?;
        if let Some(line) = &self.last_line {
            writeln!(f, "\t==> {line}")?;
        }
        Ok(())
    }
}

/// Patch extension hook, invoked before every instruction. Patches are
/// wired into the encoding but their operand-substitution semantics are
/// not implemented: a present patch id aborts the run before any
/// register is touched. Without one this is a no-op.
fn apply_patch(ins: &AbstractInstruction, _ctx: &mut ExecutionContext) -> Result<()> {
    match ins.options.patch {
        Some(id) => Err(Error::Unsupported {
            id,
            text: ins.text.clone(),
        }),
        None => Ok(()),
    }
}

fn reg_addr(ins: &AbstractInstruction, slot: usize) -> Result<usize> {
    match &ins.operands[slot] {
        Some(Operand::Register { addr, .. }) => Ok(*addr as usize),
        other => Err(Error::Emulation(format!(
            "`{}`: slot {slot} is not a register ({other:?})",
            ins.text
        ))),
    }
}

fn const_val(ins: &AbstractInstruction, slot: usize) -> Result<u64> {
    match &ins.operands[slot] {
        Some(Operand::Const(v)) => Ok(*v),
        other => Err(Error::Emulation(format!(
            "`{}`: slot {slot} is not a constant ({other:?})",
            ins.text
        ))),
    }
}

fn flag_name(ins: &AbstractInstruction, slot: usize) -> Result<&str> {
    match &ins.operands[slot] {
        Some(Operand::Flag { name, .. }) => Ok(name),
        other => Err(Error::Emulation(format!(
            "`{}`: slot {slot} is not a flag ({other:?})",
            ins.text
        ))),
    }
}

fn imm_target(ins: &AbstractInstruction) -> Result<u32> {
    match &ins.operands[0] {
        Some(Operand::Immediate { addr, .. }) => Ok(*addr),
        other => Err(Error::Emulation(format!(
            "`{}`: missing branch immediate ({other:?})",
            ins.text
        ))),
    }
}

fn mask_slot(ins: &AbstractInstruction, ctx: &ExecutionContext) -> Result<usize> {
    let s = const_val(ins, 1)? as usize;
    if s >= ctx.masks.len() {
        return Err(Error::Emulation(format!(
            "`{}`: mask slot {s} out of range",
            ins.text
        )));
    }
    Ok(s)
}

pub(crate) fn nop(_ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    ctx.ip += 1;
    Ok(())
}

pub(crate) fn nnadd(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let (opa, opb, opc) = (reg_addr(ins, 0)?, reg_addr(ins, 1)?, reg_addr(ins, 2)?);
    let mut c = &ctx.regs[opa] + &ctx.regs[opb];
    if ins.options.ext_arith && ctx.arith.contains(ArithFlags::CARITH) {
        c += BigUint::one();
    }
    if c.bits() > ctx.widths.bignum as u64 {
        ctx.arith.insert(ArithFlags::CARITH);
    }
    c &= ctx.mask();
    ctx.update_flags(&c, true);
    ctx.regs[opc] = c;
    ctx.ip += 1;
    Ok(())
}

pub(crate) fn nnsub(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let (opa, opb, opc) = (reg_addr(ins, 0)?, reg_addr(ins, 1)?, reg_addr(ins, 2)?);
    let mut c = BigInt::from(ctx.regs[opa].clone()) - BigInt::from(ctx.regs[opb].clone());
    if ins.options.ext_arith && ctx.arith.contains(ArithFlags::CARITH) {
        c += BigInt::one();
    }
    if c.is_negative() {
        ctx.arith.insert(ArithFlags::CARITH);
    }
    // Two's-complement wrap into the bignum width.
    let modulo = BigInt::one() << ctx.widths.bignum;
    let c = ((c % &modulo) + &modulo) % &modulo;
    let c = c.to_biguint().unwrap();
    ctx.update_flags(&c, true);
    ctx.regs[opc] = c;
    ctx.ip += 1;
    Ok(())
}

pub(crate) fn nnsrl(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let (opa, opc) = (reg_addr(ins, 0)?, reg_addr(ins, 2)?);
    let a = ctx.regs[opa].clone();
    let carry_in = ins.options.ext_arith && ctx.arith.contains(ArithFlags::CSHIFT);
    if a.bit(0) {
        ctx.arith.insert(ArithFlags::CSHIFT);
    }
    let mut c = &a >> 1u32;
    if carry_in {
        c |= BigUint::one() << (ctx.widths.bignum - 1);
    }
    ctx.update_flags(&c, false);
    ctx.regs[opc] = c;
    ctx.ip += 1;
    Ok(())
}

pub(crate) fn nnsll(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let (opa, opc) = (reg_addr(ins, 0)?, reg_addr(ins, 2)?);
    let a = ctx.regs[opa].clone();
    let carry_in = ins.options.ext_arith && ctx.arith.contains(ArithFlags::CSHIFT);
    if ctx.msb_set(&a) {
        ctx.arith.insert(ArithFlags::CSHIFT);
    }
    let mut c = (&a << 1u32) & ctx.mask();
    if carry_in {
        c |= BigUint::one();
    }
    ctx.update_flags(&c, false);
    ctx.regs[opc] = c;
    ctx.ip += 1;
    Ok(())
}

pub(crate) fn nnxor(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let (opa, opb, opc) = (reg_addr(ins, 0)?, reg_addr(ins, 1)?, reg_addr(ins, 2)?);
    ctx.regs[opc] = &ctx.regs[opa] ^ &ctx.regs[opb];
    ctx.ip += 1;
    Ok(())
}

/// Extended binary GCD inverse of `a` modulo `m`.
fn modinv(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    let m_int = BigInt::from(m.clone());
    let (mut r0, mut r1) = (m_int.clone(), BigInt::from(a % m));
    let (mut s0, mut s1) = (BigInt::zero(), BigInt::one());
    while !r1.is_zero() {
        let q = &r0 / &r1;
        let r2 = &r0 - &q * &r1;
        r0 = std::mem::replace(&mut r1, r2);
        let s2 = &s0 - &q * &s1;
        s0 = std::mem::replace(&mut s1, s2);
    }
    if !r0.is_one() {
        return None;
    }
    (((s0 % &m_int) + &m_int) % &m_int).to_biguint()
}

/// Montgomery multiply-reduce: (A * B * R^-1) mod p with
/// R = 2^(bignum-width + 4). The 4 extra bits keep R > 4p for the
/// 0 < u, v, w < 2p datapath invariant.
pub(crate) fn fpredc(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let (opa, opb, opc) = (reg_addr(ins, 0)?, reg_addr(ins, 1)?, reg_addr(ins, 2)?);
    let p = ctx.modulus.clone();
    let r = BigUint::one() << (ctx.widths.bignum + 4);
    let rinv = modinv(&r, &p).ok_or_else(|| {
        Error::Emulation(format!(
            "`{}`: Montgomery constant has no inverse modulo p (p must be odd and non-zero)",
            ins.text
        ))
    })?;
    ctx.regs[opc] = (&ctx.regs[opa] * &ctx.regs[opb] * rinv) % &p;
    ctx.ip += 1;
    Ok(())
}

pub(crate) fn testpar(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let opa = reg_addr(ins, 0)?;
    let parity = u8::from(ctx.regs[opa].bit(0));
    let name = flag_name(ins, 2)?.to_string();
    ctx.flags.insert(name, parity);
    ctx.ip += 1;
    Ok(())
}

pub(crate) fn testpars(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    testpar(ins, ctx)
}

fn gen_random(bits: usize) -> BigUint {
    rand::thread_rng().gen_biguint(bits as u64)
}

pub(crate) fn nnrnd(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let opc = reg_addr(ins, 2)?;
    let c = gen_random(ctx.widths.bignum);
    ctx.update_flags(&c, false);
    ctx.regs[opc] = c;
    ctx.ip += 1;
    Ok(())
}

/// Truncated to (bignum-width - 1) bits so the result stays below the
/// modulus.
pub(crate) fn nnrndm(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let opc = reg_addr(ins, 2)?;
    let c = gen_random(ctx.widths.bignum - 1);
    ctx.update_flags(&c, false);
    ctx.regs[opc] = c;
    ctx.ip += 1;
    Ok(())
}

pub(crate) fn nnrnds(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let opc = reg_addr(ins, 2)?;
    let s = mask_slot(ins, ctx)?;
    let c = gen_random(ctx.widths.bignum);
    ctx.masks[s] = c.clone();
    ctx.update_flags(&c, false);
    ctx.regs[opc] = c;
    ctx.ip += 1;
    Ok(())
}

pub(crate) fn nnrndf(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let opc = reg_addr(ins, 2)?;
    let s = mask_slot(ins, ctx)?;
    let c = gen_random(ctx.widths.bignum);
    ctx.masks[s] = c.clone();
    ctx.regs[opc] = c;
    ctx.ip += 1;
    Ok(())
}

/// Masked shift-right: unmask, shift with carry bookkeeping on the
/// unmasked value, shift the cached mask in lockstep, re-mask, store.
pub(crate) fn nnsrls(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let (opa, opc) = (reg_addr(ins, 0)?, reg_addr(ins, 2)?);
    let s = mask_slot(ins, ctx)?;
    let unmasked = &ctx.regs[opa] ^ &ctx.masks[s];
    let carry_in = ins.options.ext_arith && ctx.arith.contains(ArithFlags::CSHIFT);
    if unmasked.bit(0) {
        // The shifted-out bit, reconstructed as masked-lsb XOR
        // mask-lsb; written only when set, as for NNSRL.
        ctx.arith.insert(ArithFlags::CSHIFT);
    }
    let mut c = &unmasked >> 1u32;
    if carry_in {
        c |= BigUint::one() << (ctx.widths.bignum - 1);
    }
    ctx.masks[s] = &ctx.masks[s] >> 1u32;
    let c = c ^ &ctx.masks[s];
    ctx.update_flags(&c, false);
    ctx.regs[opc] = c;
    ctx.ip += 1;
    Ok(())
}

/// Arithmetic (sign-preserving) shift right by 1.
pub(crate) fn nndiv2(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let (opa, opc) = (reg_addr(ins, 0)?, reg_addr(ins, 2)?);
    let a = ctx.regs[opa].clone();
    let sign = ctx.msb_set(&a);
    let mut c = &a >> 1u32;
    if sign {
        c |= BigUint::one() << (ctx.widths.bignum - 1);
    }
    ctx.update_flags(&c, false);
    ctx.regs[opc] = c;
    ctx.ip += 1;
    Ok(())
}

fn jump_if(ins: &AbstractInstruction, ctx: &mut ExecutionContext, cond: bool, link: bool) -> Result<()> {
    if cond {
        let target = imm_target(ins)?;
        if link {
            ctx.lr = ctx.ip + 1;
        }
        ctx.ip = target;
    } else {
        ctx.ip += 1;
    }
    Ok(())
}

pub(crate) fn j(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    jump_if(ins, ctx, true, false)
}

pub(crate) fn jz(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let cond = ctx.arith.contains(ArithFlags::Z);
    jump_if(ins, ctx, cond, false)
}

pub(crate) fn jsn(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let cond = ctx.arith.contains(ArithFlags::SN);
    jump_if(ins, ctx, cond, false)
}

pub(crate) fn jodd(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let cond = ctx.flags.get("%par").copied() == Some(1);
    jump_if(ins, ctx, cond, false)
}

pub(crate) fn jkap(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let cond = ctx.flags.get("%kap").copied() == Some(1);
    jump_if(ins, ctx, cond, false)
}

pub(crate) fn jl(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    jump_if(ins, ctx, true, true)
}

pub(crate) fn jlsn(ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    let cond = ctx.arith.contains(ArithFlags::SN);
    jump_if(ins, ctx, cond, true)
}

pub(crate) fn ret(_ins: &AbstractInstruction, ctx: &mut ExecutionContext) -> Result<()> {
    ctx.ip = ctx.lr;
    Ok(())
}

pub(crate) fn barrier(_ins: &AbstractInstruction, _ctx: &mut ExecutionContext) -> Result<()> {
    // Assembler-level annotation; no register or ip effect.
    Ok(())
}

pub(crate) fn stop(_ins: &AbstractInstruction, _ctx: &mut ExecutionContext) -> Result<()> {
    // The run loop halts on STOP; the handler itself does nothing.
    Ok(())
}

/// Run-loop knobs. A program with no reachable STOP and no breakpoint
/// never terminates on its own; callers are expected to supply a
/// breakpoint or a step budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmuOptions {
    pub verbose: u32,
    pub max_steps: Option<u64>,
}

/// Executes the abstract instruction list until a STOP, the breakpoint,
/// or budget exhaustion. Pseudo lines share the address of the next
/// real instruction, so each address maps to a short run of
/// instructions executed in stream order.
pub fn run(
    spec: &IsaSpec,
    listing: &[AbstractInstruction],
    ctx: &mut ExecutionContext,
    opts: &EmuOptions,
) -> Result<()> {
    let mut by_addr: BTreeMap<u32, Vec<&AbstractInstruction>> = BTreeMap::new();
    for ins in listing {
        by_addr.entry(ins.addr).or_default().push(ins);
    }
    for (what, value) in [("ip", Some(ctx.ip)), ("lrip", Some(ctx.lr)), ("breakip", ctx.breakip)] {
        if let Some(v) = value {
            if v != 0 && !by_addr.contains_key(&v) {
                return Err(Error::Emulation(format!(
                    "bad {what} value {v}: not in the program's address range"
                )));
            }
        }
    }

    let mut steps = 0u64;
    loop {
        let cur = ctx.ip;
        let at = by_addr.get(&cur).ok_or_else(|| {
            Error::Emulation(format!("ip {cur} outside program"))
        })?;
        for ins in at {
            if let Some(budget) = opts.max_steps {
                if steps >= budget {
                    return Err(Error::Emulation(format!(
                        "instruction budget of {budget} exhausted (no STOP or breakpoint reached?)"
                    )));
                }
            }
            steps += 1;
            ctx.last_line = Some(ins.text.clone());
            apply_patch(ins, ctx)?;
            let handler = spec.descriptor(ins.mnemonic).exec.ok_or_else(|| {
                Error::Emulation(format!("`{}`: no handler for {}", ins.text, ins.mnemonic))
            })?;
            handler(ins, ctx)?;
            if opts.verbose > 0 {
                tracing::debug!(addr = ins.addr, %ins.mnemonic, "executed\n{ctx}");
            }
            if ins.mnemonic == Mnemonic::STOP {
                tracing::info!("hitting STOP");
                return Ok(());
            }
        }
        if ctx.breakip == Some(cur) {
            tracing::info!(breakip = cur, "hitting breakpoint");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;

    fn ctx_for(spec: &IsaSpec, init: &str) -> ExecutionContext {
        let state = parse_initial_state(spec, init).unwrap();
        ExecutionContext::new(spec, &state)
    }

    #[test]
    fn initial_state_parses_all_kinds() {
        let spec = IsaSpec::default();
        let state = parse_initial_state(
            &spec,
            "p = 0x23\nzero=0\n%Z = 1\n%kap=0b1\nmem[7]=42\nip=0\nbreakip = 3\nverbose=2\n",
        )
        .unwrap();
        assert_eq!(state.registers.len(), 3);
        assert_eq!(state.breakip, Some(3));
        assert_eq!(state.verbose, 2);
    }

    #[test]
    fn initial_state_rejects_junk() {
        let spec = IsaSpec::default();
        assert!(parse_initial_state(&spec, "noreg=4\n").is_err());
        assert!(parse_initial_state(&spec, "%Z=2\n").is_err());
        assert!(parse_initial_state(&spec, "ip=512\n").is_err());
    }

    #[test]
    fn internal_flags_resolve_by_their_percent_spelling() {
        for &(name, flag) in &[
            ("%Carith", ArithFlags::CARITH),
            ("%Cshift", ArithFlags::CSHIFT),
            ("%Z", ArithFlags::Z),
            ("%SN", ArithFlags::SN),
        ] {
            assert_eq!(ArithFlags::by_symbol(name), Some(flag));
        }
        assert_eq!(ArithFlags::by_symbol("CARITH"), None);
        let ctx = ctx_for(&IsaSpec::default(), "%Cshift=1\n");
        assert!(ctx.arith.contains(ArithFlags::CSHIFT));
    }

    #[test]
    fn modinv_small() {
        let inv = modinv(&BigUint::from(3u8), &BigUint::from(7u8)).unwrap();
        assert_eq!(inv, BigUint::from(5u8));
        assert!(modinv(&BigUint::from(2u8), &BigUint::from(4u8)).is_none());
    }

    #[test]
    fn patch_rejected_before_any_mutation() {
        let spec = IsaSpec::default();
        let prog = assemble(&spec, "NNADD,p3 one, one, dtmp\nSTOP\n").unwrap();
        let mut ctx = ctx_for(&spec, "one=1\n");
        let before = ctx.regs.clone();
        let err = run(&spec, &prog.listing, &mut ctx, &EmuOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Unsupported { id: 3, .. }));
        assert_eq!(ctx.regs, before);
    }
}
