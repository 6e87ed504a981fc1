pub mod asm;
pub mod calib;
pub mod disasm;
pub mod emu;
pub mod error;
pub mod isa;
pub mod parse;
pub mod vhdl;

pub use asm::{assemble, Program};
pub use emu::{EmuOptions, ExecutionContext};
pub use error::{Error, Result};
pub use isa::IsaSpec;
