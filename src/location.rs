//! # Location Evaluator
//!
//! Executes DWARF location expressions against the live tracee.
//!
//! A location expression is a small stack program; running it needs live
//! facts that only the tracee can provide. [`ExprContext`] is that
//! capability set: register values by DWARF number, the DWARF-relative
//! program counter, checked memory dereferences and the canonical frame
//! address. [`TraceeContext`] implements it over ptrace; tests substitute
//! a stub.
//!
//! [`evaluate`] drives [`gimli::Evaluation`], resuming it with values from
//! the context until it completes, and reduces the result to the two
//! location kinds the debugger handles: an address or a register.

use gimli::{EvaluationResult, Expression};
use nix::unistd::Pid;

use crate::addr::Addr;
use crate::errors::{DebuggerError, Result};
use crate::{memorymap, regs};

/// Where a variable lives, as far as this debugger understands locations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// A DWARF-relative address
    Address(Addr),
    /// A DWARF register number
    Register(u16),
}

/// Live facts a location expression may ask for
pub trait ExprContext {
    /// Value of the register with the given DWARF number
    fn reg(&self, dwarf_num: u16) -> Result<u64>;
    /// The instruction pointer, DWARF-relative
    fn pc(&self) -> Result<Addr>;
    /// Dereference a DWARF-relative address. Only 8-byte reads are
    /// performed; `size` is accepted for conformance.
    fn deref_size(&self, addr: Addr, size: u8) -> Result<u64>;
    /// The canonical frame address of the current frame
    fn cfa(&self) -> Result<u64>;
}

/// [`ExprContext`] over the live tracee
pub struct TraceeContext {
    pid: Pid,
    load_address: Addr,
}

impl TraceeContext {
    pub fn new(pid: Pid, load_address: Addr) -> Self {
        Self { pid, load_address }
    }
}

impl ExprContext for TraceeContext {
    fn reg(&self, dwarf_num: u16) -> Result<u64> {
        regs::get_reg_by_dwarf(self.pid, dwarf_num)
    }

    fn pc(&self) -> Result<Addr> {
        let rip = Addr::from(regs::get_reg(self.pid, regs::Register::rip)?);
        Ok(rip.to_dwarf(self.load_address))
    }

    fn deref_size(&self, addr: Addr, _size: u8) -> Result<u64> {
        let live = addr.to_live(self.load_address);
        if !memorymap::is_valid_address(self.pid, live)? {
            return Err(DebuggerError::InvalidAddress(live));
        }
        Ok(crate::mem_read_word(self.pid, live)? as u64)
    }

    fn cfa(&self) -> Result<u64> {
        // With the frame pointer saved and rbp established, the canonical
        // frame address sits two words above rbp.
        Ok(regs::get_reg(self.pid, regs::Register::rbp)? + 2 * crate::WORD_BYTES as u64)
    }
}

/// Evaluates a function's `DW_AT_frame_base` expression into a frame base
/// for its variables' location expressions.
///
/// # Errors
///
/// Fails when the function has no frame-base attribute or its expression
/// needs an unsupported capability.
pub fn frame_base<R: gimli::Reader>(
    ctx: &dyn ExprContext,
    expr: Option<Expression<R>>,
    encoding: gimli::Encoding,
) -> Result<u64> {
    let expr = expr.ok_or(DebuggerError::NoFrameBase)?;
    match evaluate(expr, encoding, ctx, None)? {
        Location::Address(addr) => Ok(addr.u64()),
        Location::Register(dwarf_num) => ctx.reg(dwarf_num),
    }
}

/// Runs one location expression to completion.
///
/// # Errors
///
/// Invalid dereferences and register failures surface from the context;
/// any location kind other than a single address or register, and any
/// capability this debugger does not provide, is
/// [`DebuggerError::UnsupportedLocation`].
pub fn evaluate<R: gimli::Reader>(
    expr: Expression<R>,
    encoding: gimli::Encoding,
    ctx: &dyn ExprContext,
    frame_base: Option<u64>,
) -> Result<Location> {
    let mut eval = expr.evaluation(encoding);
    let mut state = eval.evaluate()?;

    loop {
        state = match state {
            EvaluationResult::Complete => break,
            EvaluationResult::RequiresRegister { register, .. } => {
                let value = ctx.reg(register.0)?;
                eval.resume_with_register(gimli::Value::Generic(value))?
            }
            EvaluationResult::RequiresMemory { address, size, .. } => {
                let value = ctx.deref_size(Addr::from(address), size)?;
                eval.resume_with_memory(gimli::Value::Generic(value))?
            }
            EvaluationResult::RequiresFrameBase => {
                let base = frame_base.ok_or(DebuggerError::NoFrameBase)?;
                eval.resume_with_frame_base(base)?
            }
            EvaluationResult::RequiresCallFrameCfa => {
                eval.resume_with_call_frame_cfa(ctx.cfa()?)?
            }
            // Addresses stay DWARF-relative through the whole evaluation;
            // rebasing happens at the read site.
            EvaluationResult::RequiresRelocatedAddress(addr) => {
                eval.resume_with_relocated_address(addr)?
            }
            _ => return Err(DebuggerError::UnsupportedLocation),
        };
    }

    let pieces = eval.result();
    if pieces.len() != 1 {
        return Err(DebuggerError::UnsupportedLocation);
    }

    match pieces[0].location {
        gimli::Location::Address { address } => Ok(Location::Address(Addr::from(address))),
        gimli::Location::Register { register } => Ok(Location::Register(register.0)),
        _ => Err(DebuggerError::UnsupportedLocation),
    }
}

#[cfg(test)]
mod test {
    use gimli::{EndianSlice, LittleEndian};

    use super::*;

    struct StubContext {
        regs: Vec<(u16, u64)>,
        mem: u64,
    }

    impl ExprContext for StubContext {
        fn reg(&self, dwarf_num: u16) -> Result<u64> {
            self.regs
                .iter()
                .find(|(n, _)| *n == dwarf_num)
                .map(|(_, v)| *v)
                .ok_or(DebuggerError::UnknownDwarfRegister(dwarf_num))
        }

        fn pc(&self) -> Result<Addr> {
            Ok(Addr::from(0x1000usize))
        }

        fn deref_size(&self, _addr: Addr, _size: u8) -> Result<u64> {
            Ok(self.mem)
        }

        fn cfa(&self) -> Result<u64> {
            Ok(0x7fff_0010)
        }
    }

    fn encoding() -> gimli::Encoding {
        gimli::Encoding {
            address_size: 8,
            format: gimli::Format::Dwarf32,
            version: 4,
        }
    }

    fn run(bytes: &'static [u8], ctx: &StubContext, frame_base: Option<u64>) -> Result<Location> {
        let expr = Expression(EndianSlice::new(bytes, LittleEndian));
        evaluate(expr, encoding(), ctx, frame_base)
    }

    fn ctx() -> StubContext {
        StubContext {
            regs: vec![(0, 42), (6, 0x7fff_0000), (7, 0x7ffe_0000)],
            mem: 0xdead_beef,
        }
    }

    #[test]
    fn test_op_addr() {
        // DW_OP_addr 0x1000
        let bytes: &[u8] = &[0x03, 0x00, 0x10, 0, 0, 0, 0, 0, 0];
        let loc = run(bytes, &ctx(), None).unwrap();
        assert_eq!(loc, Location::Address(Addr::from(0x1000usize)));
    }

    #[test]
    fn test_op_reg() {
        // DW_OP_reg0
        let bytes: &[u8] = &[0x50];
        let loc = run(bytes, &ctx(), None).unwrap();
        assert_eq!(loc, Location::Register(0));
    }

    #[test]
    fn test_op_fbreg() {
        // DW_OP_fbreg -16 (sleb128 0x70)
        let bytes: &[u8] = &[0x91, 0x70];
        let loc = run(bytes, &ctx(), Some(0x7fff_0100)).unwrap();
        assert_eq!(loc, Location::Address(Addr::from(0x7fff_0100usize - 16)));
    }

    #[test]
    fn test_op_fbreg_without_frame_base() {
        let bytes: &[u8] = &[0x91, 0x70];
        assert!(matches!(
            run(bytes, &ctx(), None),
            Err(DebuggerError::NoFrameBase)
        ));
    }

    #[test]
    fn test_op_breg_reads_live_register() {
        // DW_OP_breg7 +8
        let bytes: &[u8] = &[0x77, 0x08];
        let loc = run(bytes, &ctx(), None).unwrap();
        assert_eq!(loc, Location::Address(Addr::from(0x7ffe_0008usize)));
    }

    #[test]
    fn test_op_deref_uses_context_memory() {
        // DW_OP_addr 0x1000; DW_OP_deref
        let bytes: &[u8] = &[0x03, 0x00, 0x10, 0, 0, 0, 0, 0, 0, 0x06];
        let loc = run(bytes, &ctx(), None).unwrap();
        assert_eq!(loc, Location::Address(Addr::from(0xdead_beefusize)));
    }

    #[test]
    fn test_stack_value_is_unsupported() {
        // DW_OP_lit5; DW_OP_stack_value describes a value, not a location
        let bytes: &[u8] = &[0x35, 0x9f];
        assert!(matches!(
            run(bytes, &ctx(), None),
            Err(DebuggerError::UnsupportedLocation)
        ));
    }

    #[test]
    fn test_unknown_register_error_surfaces() {
        // DW_OP_breg11 +0, register 11 missing from the stub
        let bytes: &[u8] = &[0x7b, 0x00];
        assert!(matches!(
            run(bytes, &ctx(), None),
            Err(DebuggerError::UnknownDwarfRegister(11))
        ));
    }

    #[test]
    fn test_frame_base_from_register_location() {
        // DW_OP_reg6: the frame base lives in rbp
        let bytes: &'static [u8] = &[0x56];
        let expr = Expression(EndianSlice::new(bytes, LittleEndian));
        let base = frame_base(&ctx(), Some(expr), encoding()).unwrap();
        assert_eq!(base, 0x7fff_0000);
    }

    #[test]
    fn test_frame_base_from_cfa() {
        // DW_OP_call_frame_cfa
        let bytes: &'static [u8] = &[0x9c];
        let expr = Expression(EndianSlice::new(bytes, LittleEndian));
        let base = frame_base(&ctx(), Some(expr), encoding()).unwrap();
        assert_eq!(base, 0x7fff_0010);
    }

    #[test]
    fn test_missing_frame_base_expression() {
        let missing: Option<Expression<EndianSlice<'_, LittleEndian>>> = None;
        assert!(matches!(
            frame_base(&ctx(), missing, encoding()),
            Err(DebuggerError::NoFrameBase)
        ));
    }
}
