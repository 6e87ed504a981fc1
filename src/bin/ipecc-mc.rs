use std::io::Read as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ipecc_rs::{asm, calib, disasm, emu, vhdl, IsaSpec};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Assembler, disassembler and emulator for the IPECC accelerator microcode"
)]
struct Opts {
    /// VHDL package file to calibrate opcode values and field widths
    /// against (ecc_pkg.vhd).
    #[arg(long, global = true, requires = "vhdl_config")]
    vhdl: Option<PathBuf>,

    /// VHDL configuration file giving nn, nblargenb and nbopcodes
    /// (ecc_customize.vhd).
    #[arg(long, global = true, requires = "vhdl")]
    vhdl_config: Option<PathBuf>,

    /// name,address CSV overriding the operand symbol table.
    #[arg(long, global = true)]
    csv: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Assemble a source file into <stem>.vhd and <stem>_addr.vhd
    Assemble {
        #[arg(value_name = "ASMFILE")]
        input: PathBuf,
        /// Also dump the abstract listing as JSON.
        #[arg(long)]
        listing: Option<PathBuf>,
    },
    /// Disassemble a memory image (VHDL or raw bitstrings) into
    /// <stem>_disass.s
    Disassemble {
        #[arg(value_name = "BINFILE")]
        input: PathBuf,
    },
    /// Assemble a source file and run it; initial state comes from
    /// --state or stdin
    Emulate {
        #[arg(value_name = "ASMFILE")]
        input: PathBuf,
        /// name=value initial-state file (defaults to stdin).
        #[arg(long)]
        state: Option<PathBuf>,
        /// Abort after this many executed instructions.
        #[arg(long, default_value_t = 10_000_000)]
        max_steps: u64,
    },
}

fn calibrated_spec(opts: &Opts) -> Result<IsaSpec> {
    let mut spec = IsaSpec::default();
    if let (Some(pkg), Some(conf)) = (&opts.vhdl, &opts.vhdl_config) {
        let pkg_text = std::fs::read_to_string(pkg)
            .with_context(|| format!("reading {}", pkg.display()))?;
        let conf_text = std::fs::read_to_string(conf)
            .with_context(|| format!("reading {}", conf.display()))?;
        calib::calibrate_from_pkg(&mut spec, &pkg_text)?;
        calib::calibrate_from_conf(&mut spec, &conf_text)?;
    }
    if let Some(csv) = &opts.csv {
        let csv_text = std::fs::read_to_string(csv)
            .with_context(|| format!("reading {}", csv.display()))?;
        calib::calibrate_from_csv(&mut spec, &csv_text)?;
    }
    Ok(spec)
}

fn sibling(input: &Path, suffix: &str) -> PathBuf {
    let stem = input.file_stem().unwrap_or(input.as_os_str());
    let mut name = stem.to_os_string();
    name.push(suffix);
    input.with_file_name(name)
}

fn cmd_assemble(spec: &IsaSpec, input: &Path, listing: Option<&Path>) -> Result<()> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("reading {}", input.display()))?;
    let program = asm::assemble(spec, &text)?;

    let iram_file = input.with_extension("vhd");
    std::fs::write(&iram_file, vhdl::render_iram(&program))?;
    tracing::info!(out = %iram_file.display(), words = program.words.len(), "assembled");

    let addr_file = sibling(input, "_addr.vhd");
    std::fs::write(&addr_file, vhdl::render_addr(&program, spec.widths.immediate))?;
    tracing::info!(out = %addr_file.display(), "exported addresses");

    if let Some(path) = listing {
        let json = serde_json::to_string_pretty(&program.listing)?;
        std::fs::write(path, json)?;
        tracing::info!(out = %path.display(), "wrote abstract listing");
    }
    Ok(())
}

fn cmd_disassemble(spec: &IsaSpec, input: &Path) -> Result<()> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("reading {}", input.display()))?;
    let words = disasm::extract_words(&text, spec.widths.word_bits())?;
    let source = disasm::disassemble(spec, &words)?;

    let out_file = sibling(input, "_disass.s");
    std::fs::write(&out_file, format!("{}{source}", disasm::DISASS_HEADER))?;
    tracing::info!(out = %out_file.display(), words = words.len(), "disassembled");
    Ok(())
}

fn cmd_emulate(
    spec: &IsaSpec,
    input: &Path,
    state: Option<&Path>,
    max_steps: u64,
) -> Result<()> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("reading {}", input.display()))?;
    let program = asm::assemble(spec, &text)?;

    let state_text = match state {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let init = emu::parse_initial_state(spec, &state_text)?;
    let opts = emu::EmuOptions {
        verbose: init.verbose,
        max_steps: Some(max_steps),
    };
    let mut ctx = emu::ExecutionContext::new(spec, &init);
    emu::run(spec, &program.listing, &mut ctx, &opts)?;
    println!("{ctx}");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let spec = calibrated_spec(&opts)?;

    match &opts.cmd {
        Cmd::Assemble { input, listing } => cmd_assemble(&spec, input, listing.as_deref()),
        Cmd::Disassemble { input } => cmd_disassemble(&spec, input),
        Cmd::Emulate {
            input,
            state,
            max_steps,
        } => cmd_emulate(&spec, input, state.as_deref(), *max_steps),
    }
}
