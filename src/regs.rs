//! # Register File
//!
//! The 27 x86-64 user registers as the kernel exposes them through
//! `PTRACE_GETREGS`, with their DWARF register numbers.
//!
//! [`REGISTER_TABLE`] is the sole source of truth for the three facts about
//! each register: its [`Register`] tag, its position within the kernel's
//! `user_regs_struct` block, and its DWARF number. Reads and writes fetch
//! the whole block and index into it by table position, the same way the
//! kernel lays the struct out.

use nix::libc::user_regs_struct;
use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::errors::{DebuggerError, Result};

/// Number of registers in the kernel's `user_regs_struct`
pub const N_REGISTERS: usize = 27;

// The whole-block read/write below depends on this holding.
const _: () = assert!(
    std::mem::size_of::<user_regs_struct>() == std::mem::size_of::<[u64; N_REGISTERS]>()
);

/// The x86-64 user registers
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    r15,
    r14,
    r13,
    r12,
    rbp,
    rbx,
    r11,
    r10,
    r9,
    r8,
    rax,
    rcx,
    rdx,
    rsi,
    rdi,
    orig_rax,
    rip,
    cs,
    rflags,
    rsp,
    ss,
    fs_base,
    gs_base,
    ds,
    es,
    fs,
    gs,
}

/// One row of the register table
#[derive(Debug, Clone, Copy)]
pub struct RegDescriptor {
    pub reg: Register,
    /// DWARF register number per the System V AMD64 ABI, -1 where the
    /// register has no DWARF mapping
    pub dwarf_r: i32,
    pub name: &'static str,
}

/// The register table, in `user_regs_struct` order. A row's index is the
/// register's position within the kernel block.
pub const REGISTER_TABLE: [RegDescriptor; N_REGISTERS] = [
    RegDescriptor { reg: Register::r15, dwarf_r: 15, name: "r15" },
    RegDescriptor { reg: Register::r14, dwarf_r: 14, name: "r14" },
    RegDescriptor { reg: Register::r13, dwarf_r: 13, name: "r13" },
    RegDescriptor { reg: Register::r12, dwarf_r: 12, name: "r12" },
    RegDescriptor { reg: Register::rbp, dwarf_r: 6, name: "rbp" },
    RegDescriptor { reg: Register::rbx, dwarf_r: 3, name: "rbx" },
    RegDescriptor { reg: Register::r11, dwarf_r: 11, name: "r11" },
    RegDescriptor { reg: Register::r10, dwarf_r: 10, name: "r10" },
    RegDescriptor { reg: Register::r9, dwarf_r: 9, name: "r9" },
    RegDescriptor { reg: Register::r8, dwarf_r: 8, name: "r8" },
    RegDescriptor { reg: Register::rax, dwarf_r: 0, name: "rax" },
    RegDescriptor { reg: Register::rcx, dwarf_r: 2, name: "rcx" },
    RegDescriptor { reg: Register::rdx, dwarf_r: 1, name: "rdx" },
    RegDescriptor { reg: Register::rsi, dwarf_r: 4, name: "rsi" },
    RegDescriptor { reg: Register::rdi, dwarf_r: 5, name: "rdi" },
    RegDescriptor { reg: Register::orig_rax, dwarf_r: -1, name: "orig_rax" },
    RegDescriptor { reg: Register::rip, dwarf_r: -1, name: "rip" },
    RegDescriptor { reg: Register::cs, dwarf_r: 51, name: "cs" },
    RegDescriptor { reg: Register::rflags, dwarf_r: 49, name: "eflags" },
    RegDescriptor { reg: Register::rsp, dwarf_r: 7, name: "rsp" },
    RegDescriptor { reg: Register::ss, dwarf_r: 52, name: "ss" },
    RegDescriptor { reg: Register::fs_base, dwarf_r: 58, name: "fs_base" },
    RegDescriptor { reg: Register::gs_base, dwarf_r: 59, name: "gs_base" },
    RegDescriptor { reg: Register::ds, dwarf_r: 53, name: "ds" },
    RegDescriptor { reg: Register::es, dwarf_r: 50, name: "es" },
    RegDescriptor { reg: Register::fs, dwarf_r: 54, name: "fs" },
    RegDescriptor { reg: Register::gs, dwarf_r: 55, name: "gs" },
];

fn position(r: Register) -> usize {
    REGISTER_TABLE
        .iter()
        .position(|d| d.reg == r)
        .expect("every Register variant has a table row")
}

// user_regs_struct is 27 consecutive unsigned long long fields, so viewing
// it as [u64; 27] is sound and mirrors how the position index is defined.
fn block_to_words(regs: user_regs_struct) -> [u64; N_REGISTERS] {
    unsafe { std::mem::transmute(regs) }
}

fn words_to_block(words: [u64; N_REGISTERS]) -> user_regs_struct {
    unsafe { std::mem::transmute(words) }
}

/// Reads the value of one register from the stopped tracee
///
/// # Errors
///
/// Fails when the tracee cannot be queried with `PTRACE_GETREGS`.
pub fn get_reg(pid: Pid, r: Register) -> Result<u64> {
    let regs = ptrace::getregs(pid)?;
    Ok(block_to_words(regs)[position(r)])
}

/// Writes one register of the stopped tracee, leaving the rest untouched
///
/// # Errors
///
/// Fails when the register block cannot be read back or written.
pub fn set_reg(pid: Pid, r: Register, value: u64) -> Result<()> {
    let regs = ptrace::getregs(pid)?;
    let mut words = block_to_words(regs);
    words[position(r)] = value;
    ptrace::setregs(pid, words_to_block(words))?;
    Ok(())
}

/// Reads a register by its DWARF number
///
/// `rip` and `orig_rax` have no DWARF number and are unreachable here.
///
/// # Errors
///
/// Returns [`DebuggerError::UnknownDwarfRegister`] when no table row
/// carries the requested number.
pub fn get_reg_by_dwarf(pid: Pid, dwarf_r: u16) -> Result<u64> {
    let desc = REGISTER_TABLE
        .iter()
        .find(|d| d.dwarf_r == i32::from(dwarf_r))
        .ok_or(DebuggerError::UnknownDwarfRegister(dwarf_r))?;
    get_reg(pid, desc.reg)
}

/// The display name of a register
pub fn reg_name(r: Register) -> &'static str {
    REGISTER_TABLE[position(r)].name
}

/// Parses a register name as the operator types it
///
/// # Errors
///
/// Returns [`DebuggerError::UnknownRegister`] for names not in the table.
pub fn reg_from_name(name: &str) -> Result<Register> {
    REGISTER_TABLE
        .iter()
        .find(|d| d.name == name)
        .map(|d| d.reg)
        .ok_or_else(|| DebuggerError::UnknownRegister(name.to_string()))
}

/// Reads every register in table order, for the register-dump inspector
///
/// # Errors
///
/// Fails when the tracee cannot be queried with `PTRACE_GETREGS`.
pub fn dump_regs(pid: Pid) -> Result<Vec<(&'static str, u64)>> {
    let words = block_to_words(ptrace::getregs(pid)?);
    Ok(REGISTER_TABLE
        .iter()
        .enumerate()
        .map(|(idx, d)| (d.name, words[idx]))
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_every_register_has_one_row() {
        for (idx, d) in REGISTER_TABLE.iter().enumerate() {
            assert_eq!(position(d.reg), idx);
        }
    }

    #[test]
    fn test_dwarf_numbers_unique() {
        for a in REGISTER_TABLE.iter().filter(|d| d.dwarf_r >= 0) {
            let count = REGISTER_TABLE
                .iter()
                .filter(|b| b.dwarf_r == a.dwarf_r)
                .count();
            assert_eq!(count, 1, "dwarf number {} duplicated", a.dwarf_r);
        }
    }

    #[test]
    fn test_unmapped_registers() {
        assert_eq!(REGISTER_TABLE[position(Register::rip)].dwarf_r, -1);
        assert_eq!(REGISTER_TABLE[position(Register::orig_rax)].dwarf_r, -1);
    }

    #[test]
    fn test_name_round_trip() {
        for d in &REGISTER_TABLE {
            assert_eq!(reg_from_name(d.name).unwrap(), d.reg);
            assert_eq!(reg_name(d.reg), d.name);
        }
        assert!(reg_from_name("xmm0").is_err());
    }

    #[test]
    fn test_block_word_round_trip() {
        let mut words = [0u64; N_REGISTERS];
        for (idx, w) in words.iter_mut().enumerate() {
            *w = idx as u64 * 3 + 1;
        }
        assert_eq!(block_to_words(words_to_block(words)), words);
    }

    #[test]
    fn test_known_positions() {
        // user_regs_struct field order on x86-64
        assert_eq!(position(Register::r15), 0);
        assert_eq!(position(Register::rbp), 4);
        assert_eq!(position(Register::rax), 10);
        assert_eq!(position(Register::rip), 16);
        assert_eq!(position(Register::rsp), 19);
        assert_eq!(position(Register::gs), 26);
    }
}
