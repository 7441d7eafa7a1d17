//! # loupe
//!
//! A source-level debugger for native executables on Linux/x86-64.
//!
//! loupe forks a child process, makes it traceable with ptrace, and uses the
//! binary's ELF sections and DWARF debug records to translate between source
//! coordinates (file, line, function, variable) and machine coordinates
//! (addresses, registers, stack slots). Execution is driven one instruction
//! or one source line at a time while the operator inspects memory,
//! registers, the stack, backtraces and named variables.
//!
//! The crate root holds the word-sized memory accessor used by everything
//! that touches tracee memory; the submodules contain the rest of the
//! engine:
//!
//! - [`debugger`] — control engine and inspectors
//! - [`debuggee`] — the traced process and its caches
//! - [`breakpoint`] — software breakpoints
//! - [`regs`] — the x86-64 register file
//! - [`dbginfo`] — the DWARF/ELF facade
//! - [`location`] — DWARF location expression evaluation
//! - [`disasm`] — the objdump-backed disassembly index
//! - [`ui`] — operator command parsing

use nix::unistd::Pid;

use crate::addr::Addr;
use crate::errors::Result;

pub mod addr;
pub mod breakpoint;
pub mod consts;
pub mod dbginfo;
pub mod debuggee;
pub mod debugger;
pub mod disasm;
pub mod errors;
pub mod feedback;
pub mod location;
pub mod memorymap;
pub mod regs;
pub mod ui;

/// A machine word of the tracee, as ptrace hands it out
pub type Word = i64;

/// Width of a [`Word`] in bytes
pub const WORD_BYTES: usize = std::mem::size_of::<Word>();

/// Reads one word from the tracee's memory at an absolute address
///
/// # Errors
///
/// Fails when the underlying ptrace peek fails, typically because `addr` is
/// not mapped in the tracee.
pub fn mem_read_word(pid: Pid, addr: Addr) -> Result<Word> {
    Ok(nix::sys::ptrace::read(pid, addr.raw_pointer())?)
}

/// Writes one word into the tracee's memory at an absolute address
///
/// # Errors
///
/// Fails when the underlying ptrace poke fails.
pub fn mem_write_word(pid: Pid, addr: Addr, value: Word) -> Result<()> {
    Ok(nix::sys::ptrace::write(pid, addr.raw_pointer(), value)?)
}
