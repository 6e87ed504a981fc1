//! Rendering of assembled programs into the two generated VHDL files:
//! the instruction-memory image and the exported-address package.

use std::fmt::Write as _;

use crate::asm::Program;

const ECC_CURVE_IRAM_BEGIN: &str = r#"
-- -------------------------------------------------------
-- This file is automatically generated through scripting
-- -------------------------------------------------------

library ieee;
use ieee.std_logic_1164.all;
use ieee.numeric_std.all;

use work.ecc_customize.all; -- for debug & nbopcodes parameters
use work.ecc_utils.all; -- for function ge_pow_of_2
use work.ecc_pkg.all; -- for IRAM_ADDR_SZ & OPCODE_SZ parameters

-- code below conforms to Xilinx's synthesis recommandations for
-- VHDL coding style of a simple dual-port BRAM with _two_clocks_
-- (see Vivado Design Suite User Guide, Synthesis, UG901, v2014.1,
--  May 1, 2014, pp. 105-106)
-- except that it describes a two-cycle delay on the read data path.
-- Depending on the FPGA vendor/family device target, an extra-layer of
-- register may be present inside the Block-RAM providing such 2-cycle
-- latency, as it leads to better timing performance (at the cost of
-- a small increase in the Block-RAM area).
-- In this case it is best for area performance to ensure that the
-- extra register layer on the read data path is held back inside
-- the Block-RAM by back-end tools
entity ecc_curve_iram is
	generic(
		rdlat : positive range 1 to 2 := 2);
	port(
		-- port A: write-only interface to AXI-lite interface
		clka : in std_logic;
		rea : in std_logic;
		wea : in std_logic;
		addra : in std_logic_vector(IRAM_ADDR_SZ - 1 downto 0);
		dia : in std_logic_vector (OPCODE_SZ - 1 downto 0);
		doa : out std_logic_vector (OPCODE_SZ - 1 downto 0);
		-- port B: read-only interface to ecc_curve
		clkb : in std_logic;
		reb : in std_logic;
		addrb : in std_logic_vector (IRAM_ADDR_SZ - 1 downto 0);
		dob : out std_logic_vector (OPCODE_SZ - 1 downto 0)
	);
end entity ecc_curve_iram;

architecture syn of ecc_curve_iram is

	subtype std_logic_opcode is std_logic_vector(OPCODE_SZ - 1 downto 0);
	type mem_content_type is array(integer range 0 to ge_pow_of_2(nbopcodes) - 1)
		of std_logic_opcode;
	shared variable mem_content : mem_content_type := (
		-- content of static memory automatically written below through scripting
		--
		--    opcode in binary format            address        opcode in hex
		-- <----------------------------->     <--------->      <---------->
"#;

const ECC_CURVE_IRAM_END: &str = r#"
		others => (others => '0')
	);
	signal predoutb : std_logic_opcode;
	signal predouta : std_logic_opcode;

begin

	-- ---------------------------------------------
	-- Port A (R/W) is only present if in debug mode
	-- ---------------------------------------------
	d0: if debug generate -- statically resolved by synthesizer
		process(clka)
		begin
			if (clka'event and clka = '1') then
				if (wea = '1') then
					mem_content(to_integer(unsigned(addra))) := dia;
				end if;
				if (rea = '1') then
					predouta <= mem_content(to_integer(unsigned(addra)));
				end if;
				doa <= predouta;
			end if;
		end process;
	end generate;

	d1: if not debug generate -- statically resolved by synthesizer
		doa <= (others => '1');
	end generate;

	-- --------------------------------------------------------------
	-- Port B (R only) is the nominal port used by ecc_curve to fetch
	-- instructions (which makes ecc_curve_iram a ROM when debug mode
	-- is not activated)
	-- --------------------------------------------------------------
	r1 : if rdlat = 1 generate -- statically resolved by synthesizer
		process(clkb)
		begin
			if (clkb'event and clkb = '1') then
				if (reb = '1') then
					dob <= mem_content(to_integer(unsigned(addrb)));
				end if;
			end if;
		end process;
	end generate;

	r2 : if rdlat = 2 generate -- statically resolved by synthesizer
		process(clkb)
		begin
			if (clkb'event and clkb = '1') then
				if (reb = '1') then
					predoutb <= mem_content(to_integer(unsigned(addrb)));
				end if;
				dob <= predoutb;
			end if;
		end process;
	end generate;

end architecture syn;
"#;

const ECC_ADDR_BEGIN: &str = r#"
-- -------------------------------------------------------
-- This file is automatically generated through scripting
-- -------------------------------------------------------

library ieee;
use ieee.std_logic_1164.all;
use ieee.numeric_std.all;

use work.ecc_pkg.all;

package ecc_addr is

"#;

const ECC_ADDR_END: &str = r#"

end package ecc_addr;
"#;

fn word_value(word: &str) -> u64 {
    u64::from_str_radix(word, 2).unwrap_or(0)
}

/// Renders the instruction-memory entity. Each word becomes one
/// initializer line annotated with its address in hex and decimal and
/// the opcode value in hex, digit widths sized to the program.
pub fn render_iram(program: &Program) -> String {
    let count = program.words.len();
    let dec_digits = count.to_string().len();
    let hex_digits = format!("{count:x}").len();
    let word_hex_digits = program.word_bits.div_ceil(8) * 2;

    let mut out = String::from(ECC_CURVE_IRAM_BEGIN);
    for (addr, word) in program.words.iter().enumerate() {
        let _ = writeln!(
            out,
            "\t\t\"{word}\", -- 0x{addr:0hx$x} ({addr:0d$})\t\t\t(0x{value:0wx$x})",
            hx = hex_digits,
            d = dec_digits,
            wx = word_hex_digits,
            value = word_value(word),
        );
    }
    out.push_str(ECC_CURVE_IRAM_END);
    out
}

/// Renders the `ecc_addr` package: one address constant per label
/// suffixed `L_export`, with the suffix and the leading dot stripped
/// and the name uppercased.
pub fn render_addr(program: &Program, immediate_bits: usize) -> String {
    let mut out = String::from(ECC_ADDR_BEGIN);
    for (label, addr) in &program.labels {
        let Some(base) = label.strip_suffix("L_export") else {
            continue;
        };
        let name = base.trim_start_matches('.').to_uppercase();
        let _ = writeln!(
            out,
            "\tconstant ECC_IRAM_{name}_ADDR : std_logic_vector(IRAM_ADDR_SZ - 1 downto 0) := \"{addr:0width$b}\"; -- {addr:#x}",
            width = immediate_bits,
        );
    }
    out.push_str(ECC_ADDR_END);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;
    use crate::isa::IsaSpec;

    #[test]
    fn iram_lines_carry_their_word() {
        let spec = IsaSpec::default();
        let prog = assemble(&spec, "NOP\nSTOP\n").unwrap();
        let out = render_iram(&prog);
        assert!(out.contains(&format!("\"{}\", -- 0x0 (0)", prog.words[0])));
        assert!(out.contains("others => (others => '0')"));
    }

    #[test]
    fn only_export_labels_are_rendered() {
        let spec = IsaSpec::default();
        let prog = assemble(&spec, ".startL_export:\nNOP\n.local:\nSTOP\n").unwrap();
        let out = render_addr(&prog, spec.widths.immediate);
        assert!(out.contains("constant ECC_IRAM_START_ADDR"));
        assert!(!out.contains("LOCAL"));
        assert!(out.contains("\"000000000\"; -- 0x0"));
    }

    #[test]
    fn exported_address_comment_is_hex() {
        let spec = IsaSpec::default();
        let src = "\tNOP\n".repeat(12) + ".lateL_export:\n\tSTOP\n\tNOP\n";
        let prog = assemble(&spec, &src).unwrap();
        let out = render_addr(&prog, spec.widths.immediate);
        assert!(out.contains("\"000001100\"; -- 0xc"));
    }
}
