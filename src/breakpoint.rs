use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::addr::Addr;
use crate::errors::{DebuggerError, Result};
use crate::Word;

/// The int3 instruction
pub const INT3: Word = 0xcc;
pub const WORD_MASK: Word = 0xff;
pub const WORD_MASK_INV: Word = Word::MAX ^ WORD_MASK;

/// One software breakpoint at an absolute tracee address.
///
/// While enabled, the byte at `addr` is `0xcc` and the original byte lives
/// only in `saved_data`; an enabled record must therefore stay where the
/// breakpoint map put it. `saved_data` doubles as the enabled flag.
#[derive(Debug)]
pub struct Breakpoint {
    addr: Addr,
    pid: Pid,
    saved_data: Option<u8>,
}

impl Breakpoint {
    pub fn new(pid: Pid, addr: Addr) -> Self {
        Self {
            pid,
            addr,
            saved_data: None,
        }
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn is_enabled(&self) -> bool {
        self.saved_data.is_some()
    }

    pub fn saved_data(&self) -> Option<u8> {
        self.saved_data
    }

    /// Plants the int3, stashing the displaced byte.
    ///
    /// # Errors
    ///
    /// Fails on a double enable or when the tracee's memory cannot be
    /// read or written.
    pub fn enable(&mut self) -> Result<()> {
        if self.saved_data.is_some() {
            return Err(DebuggerError::BreakpointIsAlreadyEnabled);
        }

        let data_word: Word = ptrace::read(self.pid, self.addr.raw_pointer())?;
        self.saved_data = Some((data_word & WORD_MASK) as u8);
        let data_word_modified: Word = (data_word & WORD_MASK_INV) | INT3;
        ptrace::write(self.pid, self.addr.raw_pointer(), data_word_modified)?;

        Ok(())
    }

    /// Restores the original byte.
    ///
    /// # Errors
    ///
    /// Fails on a double disable or when the tracee's memory cannot be
    /// read or written.
    pub fn disable(&mut self) -> Result<()> {
        let saved = self
            .saved_data
            .ok_or(DebuggerError::BreakpointIsAlreadyDisabled)?;

        let data_word: Word = ptrace::read(self.pid, self.addr.raw_pointer())?;
        let data_word_restored: Word = (data_word & WORD_MASK_INV) | Word::from(saved);
        ptrace::write(self.pid, self.addr.raw_pointer(), data_word_restored)?;
        self.saved_data = None;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_word_masks() {
        let word: Word = 0x1122334455667788;
        let with_int3 = (word & WORD_MASK_INV) | INT3;
        assert_eq!(with_int3, 0x11223344556677cc_u64 as Word);
        let restored = (with_int3 & WORD_MASK_INV) | (word & WORD_MASK);
        assert_eq!(restored, word);
    }

    #[test]
    fn test_new_breakpoint_is_disabled() {
        let bp = Breakpoint::new(Pid::from_raw(1), Addr::from(0x1000usize));
        assert!(!bp.is_enabled());
        assert!(bp.saved_data().is_none());
        assert_eq!(bp.addr(), Addr::from(0x1000usize));
    }
}
