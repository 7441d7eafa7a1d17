//! What the engine hands back to the operator interface after a command.

use std::fmt::Display;

use crate::addr::Addr;
use crate::dbginfo::Symbol;
use crate::debugger::BacktraceFrame;
use crate::errors::{DebuggerError, Result};
use crate::{Word, WORD_BYTES};

/// Result of one engine operation, ready for display
#[derive(Debug)]
pub enum Feedback {
    Ok,
    /// The tracee is gone; carries its exit code
    Exit(i32),
    Error(DebuggerError),
    Registers(Vec<(&'static str, u64)>),
    /// A decimal-formatted value (register or variable read)
    Value(u64),
    /// A hex-formatted memory word
    Word(Word),
    Symbols(Vec<Symbol>),
    Backtrace(Vec<BacktraceFrame>),
    StackRegion(Vec<(Addr, [u8; WORD_BYTES])>),
    Text(String),
}

impl Display for Feedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Feedback::Ok => write!(f, "Ok")?,
            Feedback::Exit(code) => write!(f, "debuggee exited with code {code}")?,
            Feedback::Error(e) => write!(f, "Error: {e}")?,
            Feedback::Registers(regs) => {
                for (name, value) in regs {
                    writeln!(f, "{name:<8}  {value:#018x}")?;
                }
            }
            Feedback::Value(v) => write!(f, "{v}")?,
            Feedback::Word(w) => write!(f, "{:x}", *w as u64)?,
            Feedback::Symbols(symbols) => {
                for s in symbols {
                    writeln!(f, "{} {} {:#x}", s.name, s.kind, s.addr.usize())?;
                }
            }
            Feedback::Backtrace(frames) => {
                for (idx, frame) in frames.iter().enumerate() {
                    writeln!(f, "#{idx} {} {}", frame.start_addr, frame.name)?;
                }
            }
            Feedback::StackRegion(words) => {
                for (addr, bytes) in words {
                    write!(f, "{addr} ")?;
                    for b in bytes {
                        write!(f, " {b:02x}")?;
                    }
                    writeln!(f)?;
                }
            }
            Feedback::Text(t) => write!(f, "{t}")?,
        }

        Ok(())
    }
}

impl From<Result<Feedback>> for Feedback {
    fn from(value: Result<Feedback>) -> Self {
        match value {
            Ok(feedback) => feedback,
            Err(e) => Feedback::Error(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_value_is_decimal() {
        assert_eq!(format!("{}", Feedback::Value(42)), "42");
    }

    #[test]
    fn test_word_is_hex() {
        assert_eq!(format!("{}", Feedback::Word(0x2a)), "2a");
    }

    #[test]
    fn test_symbol_line_format() {
        let fb = Feedback::Symbols(vec![crate::dbginfo::Symbol {
            kind: crate::dbginfo::SymbolKind::Func,
            name: "main".to_string(),
            addr: Addr::from(0x1129usize),
        }]);
        assert_eq!(format!("{fb}"), "main func 0x1129\n");
    }

    #[test]
    fn test_error_wraps_into_feedback() {
        let res: Result<Feedback> = Err(DebuggerError::TraceeDead);
        assert!(matches!(Feedback::from(res), Feedback::Error(_)));
    }
}
