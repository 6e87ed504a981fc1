//! Calibration of the instruction-set tables against the hardware
//! sources. The VHDL package and configuration files are the authority
//! on opcode values and field widths; the CSV operand map is the
//! authority on register addresses. Disagreements with the built-in
//! defaults are logged and the hardware value adopted.

use crate::error::{Error, Result};
use crate::isa::{Class, IsaSpec};

/// Identifier following the `constant` keyword, if any.
fn constant_name(line: &str) -> Option<&str> {
    let mut tokens = line.split_whitespace();
    loop {
        if tokens.next()? == "constant" {
            return Some(tokens.next()?.trim_end_matches(':'));
        }
    }
}

/// Text after `:=`, with trailing `;` and comments stripped.
fn assigned_value(line: &str) -> Option<&str> {
    let (_, rhs) = line.split_once(":=")?;
    let rhs = rhs.split("--").next().unwrap_or(rhs);
    Some(rhs.trim().trim_end_matches(';').trim())
}

/// Extracts a double-quoted bitstring value.
fn quoted_bits(value: &str) -> Option<&str> {
    let inner = value.strip_prefix('"')?.strip_suffix('"')?;
    inner.bytes().all(|b| b == b'0' || b == b'1').then_some(inner)
}

fn class_by_name(name: &str) -> Option<Class> {
    match name {
        "NOP" => Some(Class::Nop),
        "ARITH" => Some(Class::Arith),
        "BRA" | "BRANCH" => Some(Class::Branch),
        _ => None,
    }
}

/// Calibrates opcode values and bit widths from the hardware package
/// file (`ecc_pkg.vhd` style constants).
pub fn calibrate_from_pkg(spec: &mut IsaSpec, pkg: &str) -> Result<()> {
    for line in pkg.lines() {
        let Some(name) = constant_name(line) else {
            continue;
        };
        let Some(value) = assigned_value(line) else {
            continue;
        };
        if let Some(rest) = name.strip_prefix("OPCODE_") {
            let Some(bits) = quoted_bits(value) else {
                continue;
            };
            match rest.split_once('_') {
                // Bare OPCODE_<CLASS>: only the class-field width is
                // taken from it, the codes themselves are fixed.
                None => {
                    if spec.widths.class != bits.len() {
                        tracing::warn!(
                            constant = name,
                            ours = spec.widths.class,
                            theirs = bits.len(),
                            "opcode class bit length mismatches, updating"
                        );
                        spec.widths.class = bits.len();
                    }
                }
                Some((cls, tag)) => {
                    let Some(class) = class_by_name(cls) else {
                        continue;
                    };
                    if bits.len() > 8 {
                        return Err(Error::Calibration(format!(
                            "{name}: opcode field of {} bits is too wide",
                            bits.len()
                        )));
                    }
                    let val = u8::from_str_radix(bits, 2).unwrap_or(0);
                    let Some((mnemonic, ours_class, ours_opcode)) = spec
                        .descriptor_by_tag(tag)
                        .map(|d| (d.mnemonic, d.class, d.opcode))
                    else {
                        continue;
                    };
                    if ours_class != class {
                        tracing::warn!(tag, ?class, ours = ?ours_class, "opcode type mismatches");
                    }
                    if ours_opcode != Some(val) {
                        tracing::warn!(
                            tag,
                            ours = ours_opcode,
                            theirs = val,
                            "opcode value mismatches, updating"
                        );
                        spec.descriptor_mut(mnemonic).opcode = Some(val);
                    }
                    if spec.widths.opcode != bits.len() {
                        tracing::warn!(
                            tag,
                            ours = spec.widths.opcode,
                            theirs = bits.len(),
                            "opcode bit length mismatches, updating"
                        );
                        spec.widths.opcode = bits.len();
                    }
                }
            }
        } else if name == "OP_PATCH_SZ" {
            if let Ok(val) = value.parse::<usize>() {
                if spec.widths.patch != val {
                    tracing::warn!(ours = spec.widths.patch, theirs = val, "patch size mismatches, updating");
                    spec.widths.patch = val;
                }
            }
        } else if name == "OP_SHREG_IMM_SZ" {
            if let Ok(val) = value.parse::<usize>() {
                if spec.widths.constant != val {
                    tracing::warn!(
                        ours = spec.widths.constant,
                        theirs = val,
                        "shift-constant size mismatches, updating"
                    );
                    spec.widths.constant = val;
                }
            }
        } else if name == "OP_BR_IMM_SZ" && value != "IRAM_ADDR_SZ" {
            return Err(Error::Calibration(format!(
                "apparently OP_BR_IMM_SZ = {value}, and not IRAM_ADDR_SZ in the VHDL file"
            )));
        }
    }
    Ok(())
}

/// Calibrates operand, immediate and bignum widths from the hardware
/// configuration file (`ecc_customize.vhd` style constants).
pub fn calibrate_from_conf(spec: &mut IsaSpec, conf: &str) -> Result<()> {
    let mut nblargenb = None;
    let mut nbopcodes = None;
    for line in conf.lines() {
        let Some(name) = constant_name(line) else {
            continue;
        };
        let Some(val) = assigned_value(line).and_then(|v| v.parse::<usize>().ok()) else {
            continue;
        };
        match name {
            "nblargenb" => nblargenb = Some(val),
            "nbopcodes" => nbopcodes = Some(val),
            "nn" => {
                if spec.widths.bignum != val {
                    tracing::warn!(ours = spec.widths.bignum, theirs = val, "bignum size mismatches, updating");
                    spec.widths.bignum = val;
                }
            }
            _ => {}
        }
    }
    let (Some(nblargenb), Some(nbopcodes)) = (nblargenb, nbopcodes) else {
        return Err(Error::Calibration(
            "cannot find nbopcodes or nblargenb in the VHDL conf file".into(),
        ));
    };
    for (what, count, width) in [
        ("nblargenb", nblargenb, &mut spec.widths.operand),
        ("nbopcodes", nbopcodes, &mut spec.widths.immediate),
    ] {
        if !count.is_power_of_two() {
            return Err(Error::Calibration(format!(
                "{what} = {count} is weird (not a power of 2)"
            )));
        }
        let log2 = count.trailing_zeros() as usize;
        if *width != log2 {
            tracing::warn!(what, ours = *width, theirs = log2, "field width mismatches, updating");
            *width = log2;
        }
    }
    Ok(())
}

/// Calibrates the operand symbol table from a `name,address` CSV.
/// Addresses that differ are fixed, unknown names are added, both with
/// a warning.
pub fn calibrate_from_csv(spec: &mut IsaSpec, csv: &str) -> Result<()> {
    for (idx, raw) in csv.lines().enumerate() {
        let line = crate::parse::strip_comment(raw);
        if line.is_empty() {
            continue;
        }
        let Some((name, addr)) = line.split_once(',') else {
            continue;
        };
        let name = name.trim();
        let ok_name = !name.is_empty()
            && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_');
        if !ok_name {
            continue;
        }
        let addr: u64 = addr
            .trim()
            .parse()
            .map_err(|_| Error::Calibration(format!("CSV line {}: bad address in `{raw}`", idx + 1)))?;
        if addr >= (1 << spec.widths.operand) {
            return Err(Error::Calibration(format!(
                "CSV line {}: operand {name} address {addr} exceeds the register file",
                idx + 1
            )));
        }
        let addr = addr as u8;
        match spec.operands.get(name).copied() {
            Some(known) if known != addr => {
                tracing::warn!(operand = name, ours = known, theirs = addr, "CSV address differs, fixing it");
                spec.operands.insert(name.to_string(), addr);
            }
            Some(_) => {}
            None => {
                tracing::warn!(operand = name, addr, "operand from CSV missing, added");
                spec.operands.insert(name.to_string(), addr);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::Mnemonic;

    #[test]
    fn pkg_overrides_opcode_value() {
        let mut spec = IsaSpec::default();
        let pkg = "\tconstant OPCODE_ARITH_ADD : std_logic_vector(3 downto 0) := \"1111\";\n";
        calibrate_from_pkg(&mut spec, pkg).unwrap();
        assert_eq!(spec.descriptor(Mnemonic::NNADD).opcode, Some(0b1111));
    }

    #[test]
    fn pkg_rejects_wrong_branch_immediate_binding() {
        let mut spec = IsaSpec::default();
        let pkg = "\tconstant OP_BR_IMM_SZ : integer := SOMETHING_ELSE;\n";
        assert!(matches!(
            calibrate_from_pkg(&mut spec, pkg),
            Err(Error::Calibration(_))
        ));
    }

    #[test]
    fn conf_requires_power_of_two_counts() {
        let mut spec = IsaSpec::default();
        let conf = "constant nblargenb : positive := 48;\nconstant nbopcodes : positive := 512;\n";
        assert!(calibrate_from_conf(&mut spec, conf).is_err());
    }

    #[test]
    fn conf_adopts_new_widths() {
        let mut spec = IsaSpec::default();
        let conf = "\
constant nblargenb : positive := 64;
constant nbopcodes : positive := 1024;
constant nn : positive := 256;
";
        calibrate_from_conf(&mut spec, conf).unwrap();
        assert_eq!(spec.widths.operand, 6);
        assert_eq!(spec.widths.immediate, 10);
        assert_eq!(spec.widths.bignum, 256);
    }

    #[test]
    fn conf_without_counts_is_fatal() {
        let mut spec = IsaSpec::default();
        assert!(calibrate_from_conf(&mut spec, "constant nn : positive := 256;\n").is_err());
    }

    #[test]
    fn csv_fixes_and_adds_operands() {
        let mut spec = IsaSpec::default();
        calibrate_from_csv(&mut spec, "# map\np,3\nbrandnew,17\n").unwrap();
        assert_eq!(spec.operands["p"], 3);
        assert_eq!(spec.operands["brandnew"], 17);
    }

    #[test]
    fn csv_rejects_out_of_range_address() {
        let mut spec = IsaSpec::default();
        assert!(calibrate_from_csv(&mut spec, "p,200\n").is_err());
    }
}
