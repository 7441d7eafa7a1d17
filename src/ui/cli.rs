//! # Command Line Interface
//!
//! Reads one operator line at a time and parses it into a [`Status`] for
//! the engine.
//!
//! Verbs are prefix-matched against [`VERBS`], a static table scanned
//! linearly in declared order: any nonempty prefix of a verb selects it,
//! and when two verbs share a prefix the earlier-listed one wins (`s`
//! resolves to `symbol`, `st` to `step`, `si` to `si`). Parse failures are
//! reported and never reach the engine.

use dialoguer::BasicHistory;
use tracing::{error, info, trace, warn};

use super::{DebuggerUI, Status};
use crate::addr::Addr;
use crate::errors::Result;
use crate::feedback::Feedback;
use crate::Word;

/// The verb table, in resolution order
const VERBS: &[&str] = &[
    "break",
    "continue",
    "register",
    "symbol",
    "memory",
    "si",
    "step",
    "next",
    "finish",
    "backtrace",
    "ls",
    "variable",
    "stack",
    "quit",
];

pub struct CliUi {
    buf: String,
    history: BasicHistory,
}

impl CliUi {
    /// Creates the CLI with an empty input history
    ///
    /// # Errors
    ///
    /// Currently infallible, kept fallible for interface stability.
    pub fn build() -> Result<Self> {
        Ok(CliUi {
            buf: String::new(),
            history: BasicHistory::new(),
        })
    }

    fn get_input(&mut self) -> Result<()> {
        self.buf = dialoguer::Input::with_theme(&dialoguer::theme::ColorfulTheme::default())
            .history_with(&mut self.history)
            .interact_text()?;
        trace!("processing '{}'", self.buf);
        Ok(())
    }
}

impl DebuggerUI for CliUi {
    fn process(&mut self, feedback: Feedback) -> Result<Status> {
        if let Feedback::Error(e) = &feedback {
            warn!("{e}");
        } else {
            info!("{feedback}");
        }

        loop {
            self.get_input()?;
            match parse_command(&self.buf) {
                Ok(status) => return Ok(status),
                Err(msg) => error!("{msg}"),
            }
        }
    }
}

/// Whether `s` is a nonempty prefix of `of`
fn is_prefix(s: &str, of: &str) -> bool {
    !s.is_empty() && of.starts_with(s)
}

/// The first verb in declared order that the typed token is a prefix of
fn resolve_verb(token: &str) -> Option<&'static str> {
    VERBS.iter().copied().find(|verb| is_prefix(token, verb))
}

/// Hex operand as the operator types it, with or without the `0x` prefix
fn parse_hex(raw: &str) -> std::result::Result<u64, String> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16).map_err(|e| format!("not a hex number: {raw} ({e})"))
}

/// Parses one whitespace-separated command line into a [`Status`].
///
/// # Errors
///
/// Returns a diagnostic string for unknown verbs, missing arguments and
/// malformed operands; nothing about the engine changes on failure.
pub fn parse_command(line: &str) -> std::result::Result<Status, String> {
    let args: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = args.first() else {
        return Err("empty command".to_string());
    };
    let arg = |idx: usize, what: &str| -> std::result::Result<&str, String> {
        args.get(idx)
            .copied()
            .ok_or_else(|| format!("missing argument: {what}"))
    };

    match resolve_verb(command) {
        Some("break") => {
            let target = arg(1, "break ADDR|FILE:LINE|FUNCTION")?;
            if let Some(digits) = target.strip_prefix("0x") {
                let addr = u64::from_str_radix(digits, 16)
                    .map_err(|e| format!("not a hex address: {target} ({e})"))?;
                Ok(Status::SetBreakpointAddr(Addr::from(addr)))
            } else if target.contains(':') {
                let (file, line) = target
                    .rsplit_once(':')
                    .ok_or_else(|| format!("malformed location: {target}"))?;
                let line = line
                    .parse::<u64>()
                    .map_err(|e| format!("not a line number: {line} ({e})"))?;
                Ok(Status::SetBreakpointLine(file.to_string(), line))
            } else {
                Ok(Status::SetBreakpointFunction(target.to_string()))
            }
        }
        Some("continue") => Ok(Status::Continue),
        Some("register") => {
            let sub = arg(1, "register dump|read|write")?;
            if is_prefix(sub, "dump") {
                Ok(Status::DumpRegisters)
            } else if is_prefix(sub, "read") {
                Ok(Status::ReadRegister(arg(2, "register read NAME")?.to_string()))
            } else if is_prefix(sub, "write") {
                let name = arg(2, "register write NAME 0xVALUE")?.to_string();
                let value = parse_hex(arg(3, "register write NAME 0xVALUE")?)?;
                Ok(Status::WriteRegister(name, value))
            } else {
                Err(format!("unknown register subcommand: {sub}"))
            }
        }
        Some("symbol") => Ok(Status::Symbol(arg(1, "symbol NAME")?.to_string())),
        Some("memory") => {
            let sub = arg(1, "memory read|write")?;
            let addr = Addr::from(parse_hex(arg(2, "memory read|write 0xADDR")?)?);
            if is_prefix(sub, "read") {
                Ok(Status::ReadMem(addr))
            } else if is_prefix(sub, "write") {
                let value = parse_hex(arg(3, "memory write 0xADDR 0xVALUE")?)?;
                Ok(Status::WriteMem(addr, value as Word))
            } else {
                Err(format!("unknown memory subcommand: {sub}"))
            }
        }
        Some("si") => Ok(Status::SingleStep),
        Some("step") => Ok(Status::StepIn),
        Some("next") => Ok(Status::StepOver),
        Some("finish") => Ok(Status::StepOut),
        Some("backtrace") => Ok(Status::Backtrace),
        Some("ls") => Ok(Status::ListSource),
        Some("variable") => Ok(Status::ReadVariable(arg(1, "variable NAME")?.to_string())),
        Some("stack") => {
            let lo = Addr::from(parse_hex(arg(1, "stack 0xLO 0xHI")?)?);
            let hi = Addr::from(parse_hex(arg(2, "stack 0xLO 0xHI")?)?);
            Ok(Status::StackRegion(lo, hi))
        }
        Some("quit") => Ok(Status::DebuggerQuit),
        Some(_) | None => Err(format!("unknown command: {command}")),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_prefix_resolution_earlier_wins() {
        assert_eq!(resolve_verb("b"), Some("break"));
        assert_eq!(resolve_verb("ba"), Some("backtrace"));
        assert_eq!(resolve_verb("c"), Some("continue"));
        assert_eq!(resolve_verb("r"), Some("register"));
        // symbol is listed before si and step
        assert_eq!(resolve_verb("s"), Some("symbol"));
        assert_eq!(resolve_verb("si"), Some("si"));
        assert_eq!(resolve_verb("st"), Some("step"));
        assert_eq!(resolve_verb("sta"), Some("stack"));
        assert_eq!(resolve_verb("m"), Some("memory"));
        assert_eq!(resolve_verb("n"), Some("next"));
        assert_eq!(resolve_verb("f"), Some("finish"));
        assert_eq!(resolve_verb("l"), Some("ls"));
        assert_eq!(resolve_verb("v"), Some("variable"));
        assert_eq!(resolve_verb("q"), Some("quit"));
    }

    #[test]
    fn test_every_prefix_resolves_to_first_match() {
        for verb in VERBS {
            for end in 1..=verb.len() {
                let prefix = &verb[..end];
                let expected = VERBS
                    .iter()
                    .copied()
                    .find(|v| v.starts_with(prefix))
                    .unwrap();
                assert_eq!(resolve_verb(prefix), Some(expected), "prefix {prefix}");
            }
        }
    }

    #[test]
    fn test_unknown_and_empty() {
        assert_eq!(resolve_verb("x"), None);
        assert_eq!(resolve_verb(""), None);
        assert!(parse_command("").is_err());
        assert!(parse_command("flounder").is_err());
    }

    #[test]
    fn test_break_forms() {
        assert_eq!(
            parse_command("break 0x1129").unwrap(),
            Status::SetBreakpointAddr(Addr::from(0x1129usize))
        );
        assert_eq!(
            parse_command("b prog.c:2").unwrap(),
            Status::SetBreakpointLine("prog.c".to_string(), 2)
        );
        assert_eq!(
            parse_command("break main").unwrap(),
            Status::SetBreakpointFunction("main".to_string())
        );
        assert!(parse_command("break").is_err());
        assert!(parse_command("break 0xzz").is_err());
        assert!(parse_command("break prog.c:two").is_err());
    }

    #[test]
    fn test_register_forms() {
        assert_eq!(parse_command("register dump").unwrap(), Status::DumpRegisters);
        assert_eq!(parse_command("reg d").unwrap(), Status::DumpRegisters);
        assert_eq!(
            parse_command("register read rip").unwrap(),
            Status::ReadRegister("rip".to_string())
        );
        assert_eq!(
            parse_command("register write rax 0x2a").unwrap(),
            Status::WriteRegister("rax".to_string(), 0x2a)
        );
        assert!(parse_command("register poke").is_err());
        assert!(parse_command("register write rax").is_err());
    }

    #[test]
    fn test_memory_forms() {
        assert_eq!(
            parse_command("memory read 0x1000").unwrap(),
            Status::ReadMem(Addr::from(0x1000usize))
        );
        assert_eq!(
            parse_command("mem write 0x1000 0xff").unwrap(),
            Status::WriteMem(Addr::from(0x1000usize), 0xff)
        );
        assert!(parse_command("memory read").is_err());
    }

    #[test]
    fn test_plain_verbs() {
        assert_eq!(parse_command("si").unwrap(), Status::SingleStep);
        assert_eq!(parse_command("step").unwrap(), Status::StepIn);
        assert_eq!(parse_command("next").unwrap(), Status::StepOver);
        assert_eq!(parse_command("finish").unwrap(), Status::StepOut);
        assert_eq!(parse_command("backtrace").unwrap(), Status::Backtrace);
        assert_eq!(parse_command("ls").unwrap(), Status::ListSource);
        assert_eq!(parse_command("quit").unwrap(), Status::DebuggerQuit);
    }

    #[test]
    fn test_supplemental_verbs() {
        assert_eq!(
            parse_command("variable x").unwrap(),
            Status::ReadVariable("x".to_string())
        );
        assert_eq!(
            parse_command("stack 0x7ffe0000 0x7ffe0040").unwrap(),
            Status::StackRegion(Addr::from(0x7ffe0000usize), Addr::from(0x7ffe0040usize))
        );
    }

    #[test]
    fn test_hex_operands_allow_bare_digits() {
        assert_eq!(parse_hex("0x19").unwrap(), 0x19);
        assert_eq!(parse_hex("19").unwrap(), 0x19);
        assert_eq!(parse_hex("00019").unwrap(), 0x19);
        assert!(parse_hex("wat").is_err());
    }
}
