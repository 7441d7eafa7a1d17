//! # Control Engine
//!
//! Owns the tracee and drives it.
//!
//! The [`Debugger`] launches the child, keeps the breakpoint map
//! transparent, and implements the control primitives: `continue`,
//! raw single-step, step over a planted breakpoint, source-level step
//! in/over/out, plus the read-only inspectors (registers, memory, stack
//! region, backtrace, named variables, source listing).
//!
//! Everything is synchronous: each resume primitive blocks in `waitpid`
//! until the tracee stops again, so every peek and poke observes the state
//! the previous primitive left behind.

use std::ffi::CString;
use std::fmt::Write as _;
use std::path::Path;

use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execv, fork, ForkResult};
use tracing::{debug, error, info, trace, warn};

use crate::addr::Addr;
use crate::breakpoint::Breakpoint;
use crate::consts::{SI_KERNEL, TRAP_BRKPT, TRAP_TRACE};
use crate::debuggee::{Debuggee, TraceeState};
use crate::errors::{DebuggerError, Result};
use crate::feedback::Feedback;
use crate::location::{self, ExprContext, Location, TraceeContext};
use crate::regs::{self, Register};
use crate::ui::{DebuggerUI, Status};
use crate::{mem_read_word, mem_write_word, memorymap, Word, WORD_BYTES};

/// Upper bound on walked stack frames when `main` never shows up
const MAX_BACKTRACE_FRAMES: usize = 64;

/// One frame of a backtrace: function start address and name
#[derive(Debug, Clone)]
pub struct BacktraceFrame {
    pub start_addr: Addr,
    pub name: String,
}

/// The debugger session: one tracee, one operator interface
pub struct Debugger<UI: DebuggerUI> {
    debuggee: Debuggee,
    ui: UI,
}

impl<UI: DebuggerUI> Debugger<UI> {
    /// Forks and execs the program under tracing and waits for the
    /// post-exec stop. The child disables address space randomization and
    /// marks itself traceable before exec.
    ///
    /// # Errors
    ///
    /// Fails when the executable is missing, the fork or exec fails, or
    /// the attach-time caches cannot be built.
    pub fn launch(path: impl AsRef<Path>, ui: UI) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let err = DebuggerError::ExecutableDoesNotExist(path.to_string_lossy().to_string());
            error!("{err}");
            return Err(err);
        }
        if !path.is_file() {
            let err = DebuggerError::ExecutableIsNotAFile(path.to_string_lossy().to_string());
            error!("{err}");
            return Err(err);
        }

        let fork_res = unsafe { fork() };
        match fork_res {
            Err(e) => {
                error!("could not fork for the tracee: {e}");
                Err(e.into())
            }
            Ok(ForkResult::Parent { child }) => {
                info!("start debugging process {child}");
                let debuggee = Debuggee::build(child, path)?;
                let mut dbg = Debugger { debuggee, ui };
                dbg.wait_signal()?; // Launched -> Stopped at the exec trap
                dbg.debuggee.initialise(path)?;
                Ok(dbg)
            }
            Ok(ForkResult::Child) => {
                personality::set(Persona::ADDR_NO_RANDOMIZE)
                    .inspect_err(|e| eprintln!("could not disable aslr: {e}"))?;
                ptrace::traceme().inspect_err(|e| eprintln!("error while doing traceme: {e}"))?;
                let cpath = CString::new(path.to_string_lossy().to_string().as_str())?;
                execv(&cpath, &[cpath.clone()])?;
                unreachable!()
            }
        }
    }

    /// The operator loop: ask the UI for one command, run it, feed the
    /// result back. Ends on quit or when the tracee exits.
    ///
    /// # Errors
    ///
    /// Only UI failures end the loop with an error; engine errors are
    /// reported as [`Feedback::Error`] and the loop continues.
    pub fn run_loop(&mut self, initial: Feedback) -> Result<()> {
        let mut feedback = initial;
        if let Feedback::Exit(code) = feedback {
            info!("debuggee exited with code {code}");
            return Ok(());
        }

        loop {
            let status = match self.ui.process(feedback) {
                Err(e) => {
                    error!("{e}");
                    return Err(e);
                }
                Ok(s) => s,
            };

            feedback = match status {
                Status::DebuggerQuit => break,
                Status::Continue => self.cont(),
                Status::SingleStep => self.single_step(),
                Status::StepIn => self.step_in(),
                Status::StepOver => self.step_over(),
                Status::StepOut => self.step_out(),
                Status::SetBreakpointAddr(addr) => {
                    let live = self.debuggee.offset_dwarf_address(addr);
                    self.set_breakpoint_at_address(live)
                }
                Status::SetBreakpointLine(file, line) => {
                    self.set_breakpoint_at_source_line(&file, line)
                }
                Status::SetBreakpointFunction(name) => self.set_breakpoint_at_function(&name),
                Status::DumpRegisters => self.dump_registers().map(Feedback::Registers),
                Status::ReadRegister(name) => self.read_register_by_name(&name),
                Status::WriteRegister(name, value) => self.write_register_by_name(&name, value),
                Status::ReadMem(addr) => self.read_mem(addr).map(Feedback::Word),
                Status::WriteMem(addr, value) => self.write_mem(addr, value),
                Status::Symbol(name) => {
                    self.debuggee.dbginfo.lookup_symbol(&name).map(Feedback::Symbols)
                }
                Status::Backtrace => self.backtrace().map(Feedback::Backtrace),
                Status::ListSource => self.list_source().map(Feedback::Text),
                Status::ReadVariable(name) => self.read_variable(&name).map(Feedback::Value),
                Status::StackRegion(lo, hi) => {
                    self.read_stack_region(lo, hi).map(Feedback::StackRegion)
                }
            }
            .into();

            if let Feedback::Exit(code) = feedback {
                info!("debuggee exited with code {code}");
                break;
            }
        }

        Ok(())
    }

    /// Kills the tracee if it is still alive
    ///
    /// # Errors
    ///
    /// Fails when the kill request itself fails.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.debuggee.state() != TraceeState::Dead {
            self.debuggee.kill()?;
        }
        Ok(())
    }

    fn ensure_stopped(&self) -> Result<()> {
        if self.debuggee.state() == TraceeState::Dead {
            return Err(DebuggerError::TraceeDead);
        }
        Ok(())
    }

    /// Blocks until the tracee stops or dies, then classifies the signal.
    ///
    /// A SIGTRAP from a planted `0xcc` leaves the PC one past the trap
    /// byte; it is moved back onto the breakpoint's address so a later
    /// resume re-executes the displaced instruction.
    fn wait_signal(&mut self) -> Result<Feedback> {
        let status = waitpid(self.debuggee.pid, None)?;
        match status {
            WaitStatus::Exited(_, exit_code) => {
                self.debuggee.state = TraceeState::Dead;
                Ok(Feedback::Exit(exit_code))
            }
            WaitStatus::Signaled(_, signal, _) => {
                self.debuggee.state = TraceeState::Dead;
                info!("debuggee terminated by signal {}", signal.as_str());
                Ok(Feedback::Exit(-1))
            }
            _ => {
                self.debuggee.state = TraceeState::Stopped;
                let siginfo = ptrace::getsiginfo(self.debuggee.pid)?;
                let signal = Signal::try_from(siginfo.si_signo)?;
                match signal {
                    Signal::SIGTRAP => self.handle_sigtrap(&siginfo)?,
                    Signal::SIGSEGV => {
                        error!("debuggee segfaulted, si_code {}", siginfo.si_code);
                    }
                    other => info!("debuggee received {}", other.as_str()),
                }
                Ok(Feedback::Ok)
            }
        }
    }

    fn handle_sigtrap(&self, siginfo: &nix::libc::siginfo_t) -> Result<()> {
        match siginfo.si_code {
            SI_KERNEL | TRAP_BRKPT => {
                let back_on_trap = self.get_pc()? - 1usize;
                regs::set_reg(self.debuggee.pid, Register::rip, back_on_trap.u64())?;
                trace!("hit breakpoint at {back_on_trap}");
            }
            TRAP_TRACE => trace!("single step trap"),
            code => warn!("strange SIGTRAP code: {code}"),
        }
        Ok(())
    }

    /// One instruction forward, no breakpoint awareness
    fn single_step_raw(&mut self) -> Result<Feedback> {
        ptrace::step(self.debuggee.pid, None)?;
        self.debuggee.state = TraceeState::Running;
        self.wait_signal()
    }

    /// If the PC sits on an enabled breakpoint, executes the displaced
    /// instruction transparently: disable, raw step, re-enable. Otherwise
    /// does nothing. The breakpoint map is identical before and after.
    fn step_over_breakpoint(&mut self) -> Result<Feedback> {
        let pc = self.get_pc()?;
        let Some(bp) = self.debuggee.breakpoints.get_mut(&pc) else {
            return Ok(Feedback::Ok);
        };
        if !bp.is_enabled() {
            return Ok(Feedback::Ok);
        }

        trace!("stepping over breakpoint at {pc}");
        bp.disable()?;
        let feedback = self.single_step_raw()?;
        if self.debuggee.state() == TraceeState::Dead {
            return Ok(feedback);
        }
        if let Some(bp) = self.debuggee.breakpoints.get_mut(&pc) {
            bp.enable()?;
        }
        Ok(feedback)
    }

    /// The atomic "one instruction forward, transparently" primitive
    ///
    /// # Errors
    ///
    /// Fails when the tracee is dead or ptrace refuses.
    pub fn single_step(&mut self) -> Result<Feedback> {
        self.ensure_stopped()?;
        let pc = self.get_pc()?;
        if self.debuggee.breakpoints.contains_key(&pc) {
            self.step_over_breakpoint()
        } else {
            self.single_step_raw()
        }
    }

    /// Resumes the tracee until the next signal or exit
    ///
    /// # Errors
    ///
    /// Fails when the tracee is dead or ptrace refuses.
    pub fn cont(&mut self) -> Result<Feedback> {
        self.ensure_stopped()?;
        let feedback = self.step_over_breakpoint()?;
        if matches!(feedback, Feedback::Exit(_)) {
            return Ok(feedback);
        }
        ptrace::cont(self.debuggee.pid, None)?;
        self.debuggee.state = TraceeState::Running;
        self.wait_signal()
    }

    /// Steps single instructions until the DWARF line changes, naturally
    /// descending into callees
    ///
    /// # Errors
    ///
    /// Fails when the tracee is dead or a step fails.
    pub fn step_in(&mut self) -> Result<Feedback> {
        self.ensure_stopped()?;
        let start_line = self.current_line()?;
        loop {
            let feedback = self.single_step()?;
            if matches!(feedback, Feedback::Exit(_)) {
                return Ok(feedback);
            }
            let current = self.current_line()?;
            // PC ranges without line info (library code, system calls) are
            // stepped through silently
            if current.is_some() && current != start_line {
                return Ok(feedback);
            }
        }
    }

    /// Runs to the line-table entry after the current one, using a
    /// one-shot breakpoint. An operator breakpoint already at that address
    /// is left alone.
    ///
    /// # Errors
    ///
    /// Fails when no line entry covers the PC or resuming fails.
    pub fn step_over(&mut self) -> Result<Feedback> {
        self.ensure_stopped()?;
        let offset_pc = self.get_offset_pc()?;
        let next = self
            .debuggee
            .dbginfo
            .next_line_entry(offset_pc)
            .ok_or(DebuggerError::NoLineEntry(offset_pc))?;
        let target = self.debuggee.offset_dwarf_address(next.addr);

        let ours = !self.debuggee.breakpoints.contains_key(&target);
        if ours {
            self.set_breakpoint_at_address(target)?;
        }
        let feedback = self.cont()?;
        if ours && !matches!(feedback, Feedback::Exit(_)) {
            self.remove_breakpoint(target)?;
        }
        Ok(feedback)
    }

    /// Runs until the current frame returns, via a one-shot breakpoint on
    /// the return address at `[rbp + 8]`
    ///
    /// # Errors
    ///
    /// Refuses to step out of `main`; otherwise fails only when memory or
    /// ptrace access fails.
    pub fn step_out(&mut self) -> Result<Feedback> {
        self.ensure_stopped()?;
        if let Some(fun) = self.debuggee.function_containing(self.get_pc()?) {
            if fun.name == "main" {
                return Err(DebuggerError::StepOutMain);
            }
        }

        let frame_pointer = Addr::from(self.get_reg(Register::rbp)?);
        let return_addr = Addr::from(mem_read_word(self.debuggee.pid, frame_pointer + 8usize)?);
        trace!("step out towards return address {return_addr}");

        let ours = !self.debuggee.breakpoints.contains_key(&return_addr);
        if ours {
            self.set_breakpoint_at_address(return_addr)?;
        }
        let feedback = self.cont()?;
        if ours && !matches!(feedback, Feedback::Exit(_)) {
            self.remove_breakpoint(return_addr)?;
        }
        Ok(feedback)
    }

    /// Plants a breakpoint at a live address and tracks it
    ///
    /// # Errors
    ///
    /// Fails when the tracee is dead or its memory cannot be patched.
    pub fn set_breakpoint_at_address(&mut self, addr: Addr) -> Result<Feedback> {
        self.ensure_stopped()?;
        if self.debuggee.breakpoints.contains_key(&addr) {
            warn!("breakpoint at {addr} already exists");
            return Ok(Feedback::Ok);
        }
        let mut bp = Breakpoint::new(self.debuggee.pid, addr);
        bp.enable()?;
        self.debuggee.breakpoints.insert(addr, bp);
        debug!("breakpoint set at {addr}");
        Ok(Feedback::Ok)
    }

    /// Plants a breakpoint at the first statement of `file:line`
    ///
    /// # Errors
    ///
    /// Fails when no compilation unit matches the file or no statement
    /// row carries the line.
    pub fn set_breakpoint_at_source_line(&mut self, file: &str, line: u64) -> Result<Feedback> {
        self.ensure_stopped()?;
        let basename = file.rsplit('/').next().unwrap_or(file);
        let entry = self
            .debuggee
            .dbginfo
            .line_entry_for_line(basename, line)
            .ok_or_else(|| DebuggerError::SourceLineNotFound(file.to_string(), line))?;
        let live = self.debuggee.offset_dwarf_address(entry.addr);
        info!("breakpoint at {file}:{line} lands on {live}");
        self.set_breakpoint_at_address(live)
    }

    /// Plants a breakpoint one line-table entry past the function's first
    /// source line, skipping the prologue so locals are already
    /// materialized when it hits
    ///
    /// # Errors
    ///
    /// Fails when no DIE carries the name or the function has no usable
    /// line entry.
    pub fn set_breakpoint_at_function(&mut self, name: &str) -> Result<Feedback> {
        self.ensure_stopped()?;
        let fun = self
            .debuggee
            .dbginfo
            .function_by_name(name)
            .ok_or_else(|| DebuggerError::FunctionNotFound(name.to_string()))?;
        let low_pc = fun
            .low_pc
            .ok_or_else(|| DebuggerError::FunctionNotFound(name.to_string()))?;

        let entry = self
            .debuggee
            .dbginfo
            .next_line_entry(low_pc)
            .or_else(|| self.debuggee.dbginfo.line_entry_for_pc(low_pc))
            .ok_or(DebuggerError::NoLineEntry(low_pc))?;
        let live = self.debuggee.offset_dwarf_address(entry.addr);
        info!("breakpoint at function {name} lands on {live}");
        self.set_breakpoint_at_address(live)
    }

    /// Disables and forgets the breakpoint at a live address
    ///
    /// # Errors
    ///
    /// Fails when the displaced byte cannot be restored; the record then
    /// stays in the map so it still describes the tracee's bytes.
    pub fn remove_breakpoint(&mut self, addr: Addr) -> Result<Feedback> {
        match self.debuggee.breakpoints.get_mut(&addr) {
            Some(bp) => {
                if bp.is_enabled() {
                    bp.disable()?;
                }
                self.debuggee.breakpoints.remove(&addr);
                debug!("breakpoint removed at {addr}");
            }
            None => warn!("removed a breakpoint at {addr} that did not exist"),
        }
        Ok(Feedback::Ok)
    }

    /// Reads the named variable of the function containing the PC.
    ///
    /// The variable's location expression decides where the value lives:
    /// an address is rebased and peeked, a register is read by its DWARF
    /// number, anything else is unsupported.
    ///
    /// # Errors
    ///
    /// Distinguishes: not in a function, no such variable, optimized out,
    /// unsupported location kind, invalid address, register failure.
    pub fn read_variable(&self, name: &str) -> Result<u64> {
        self.ensure_stopped()?;
        let ctx = TraceeContext::new(self.debuggee.pid, self.debuggee.load_address());
        let offset_pc = ctx.pc()?;

        let fun = self
            .debuggee
            .dbginfo
            .function_containing_pc(offset_pc)
            .ok_or(DebuggerError::NotInFunction)?;
        let var = fun
            .variables
            .iter()
            .find(|v| v.name.as_deref() == Some(name))
            .ok_or_else(|| DebuggerError::VariableNotFound(name.to_string()))?;

        if !var.has_location {
            return Err(DebuggerError::OptimizedOut(name.to_string()));
        }
        let expr = var
            .location
            .clone()
            .ok_or(DebuggerError::UnsupportedLocation)?;

        let frame_base = location::frame_base(&ctx, fun.frame_base.clone(), fun.encoding).ok();
        match location::evaluate(expr, fun.encoding, &ctx, frame_base)? {
            Location::Address(addr) => {
                let live = self.debuggee.offset_dwarf_address(addr);
                if !memorymap::is_valid_address(self.debuggee.pid, live)? {
                    return Err(DebuggerError::InvalidAddress(live));
                }
                debug!("variable {name} lives at {live}");
                Ok(mem_read_word(self.debuggee.pid, live)? as u64)
            }
            Location::Register(dwarf_num) => regs::get_reg_by_dwarf(self.debuggee.pid, dwarf_num),
        }
    }

    /// Walks the frame-pointer chain upwards, deepest frame first,
    /// stopping at `main` or at the first PC the disassembly index does
    /// not know
    ///
    /// # Errors
    ///
    /// Fails when registers or stack memory cannot be read.
    pub fn backtrace(&self) -> Result<Vec<BacktraceFrame>> {
        self.ensure_stopped()?;
        let mut frames = Vec::new();

        let Some(current) = self.debuggee.function_containing(self.get_pc()?) else {
            return Ok(frames);
        };
        frames.push(BacktraceFrame {
            start_addr: current.start_addr,
            name: current.name.clone(),
        });

        let mut name = current.name.clone();
        let mut frame_pointer = Addr::from(self.get_reg(Register::rbp)?);
        while name != "main" {
            if frames.len() >= MAX_BACKTRACE_FRAMES {
                warn!("backtrace truncated after {MAX_BACKTRACE_FRAMES} frames");
                break;
            }
            let return_addr =
                Addr::from(mem_read_word(self.debuggee.pid, frame_pointer + 8usize)?);
            let Some(fun) = self.debuggee.function_containing(return_addr) else {
                break;
            };
            frames.push(BacktraceFrame {
                start_addr: fun.start_addr,
                name: fun.name.clone(),
            });
            name = fun.name.clone();
            frame_pointer = Addr::from(mem_read_word(self.debuggee.pid, frame_pointer)?);
        }

        Ok(frames)
    }

    /// Peeks `[lo, hi)` word by word, exploded into little-endian bytes
    ///
    /// # Errors
    ///
    /// Fails when any word in the region cannot be read.
    pub fn read_stack_region(
        &self,
        lo: Addr,
        hi: Addr,
    ) -> Result<Vec<(Addr, [u8; WORD_BYTES])>> {
        self.ensure_stopped()?;
        let mut region = Vec::new();
        let mut at = lo;
        while at < hi {
            let word = mem_read_word(self.debuggee.pid, at)?;
            region.push((at, word.to_le_bytes()));
            at += WORD_BYTES;
        }
        Ok(region)
    }

    /// All registers with their names, in table order
    ///
    /// # Errors
    ///
    /// Fails when the tracee cannot be queried.
    pub fn dump_registers(&self) -> Result<Vec<(&'static str, u64)>> {
        self.ensure_stopped()?;
        regs::dump_regs(self.debuggee.pid)
    }

    fn read_register_by_name(&self, name: &str) -> Result<Feedback> {
        self.ensure_stopped()?;
        let reg = regs::reg_from_name(name)?;
        Ok(Feedback::Value(self.get_reg(reg)?))
    }

    fn write_register_by_name(&self, name: &str, value: u64) -> Result<Feedback> {
        self.ensure_stopped()?;
        let reg = regs::reg_from_name(name)?;
        regs::set_reg(self.debuggee.pid, reg, value)?;
        Ok(Feedback::Ok)
    }

    /// Reads one word of tracee memory
    ///
    /// # Errors
    ///
    /// Fails when the address is not mapped.
    pub fn read_mem(&self, addr: Addr) -> Result<Word> {
        self.ensure_stopped()?;
        mem_read_word(self.debuggee.pid, addr)
    }

    fn write_mem(&self, addr: Addr, value: Word) -> Result<Feedback> {
        self.ensure_stopped()?;
        mem_write_word(self.debuggee.pid, addr, value)?;
        Ok(Feedback::Ok)
    }

    pub fn get_reg(&self, r: Register) -> Result<u64> {
        regs::get_reg(self.debuggee.pid, r)
    }

    pub fn get_pc(&self) -> Result<Addr> {
        Ok(Addr::from(self.get_reg(Register::rip)?))
    }

    pub fn get_rbp(&self) -> Result<Addr> {
        Ok(Addr::from(self.get_reg(Register::rbp)?))
    }

    pub fn get_rsp(&self) -> Result<Addr> {
        Ok(Addr::from(self.get_reg(Register::rsp)?))
    }

    fn get_offset_pc(&self) -> Result<Addr> {
        Ok(self.debuggee.offset_load_address(self.get_pc()?))
    }

    /// The source line number of the current PC
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::NoLineEntry`] outside covered code.
    pub fn get_src_line(&self) -> Result<u64> {
        let offset_pc = self.get_offset_pc()?;
        self.current_line()?
            .ok_or(DebuggerError::NoLineEntry(offset_pc))
    }

    fn current_line(&self) -> Result<Option<u64>> {
        let offset_pc = self.get_offset_pc()?;
        Ok(self
            .debuggee
            .dbginfo
            .line_entry_for_pc(offset_pc)
            .map(|e| e.line))
    }

    /// Renders the source table with the current line marked, followed by
    /// the current function's disassembly with the current PC marked
    ///
    /// # Errors
    ///
    /// Fails when the tracee's registers cannot be read.
    pub fn list_source(&self) -> Result<String> {
        self.ensure_stopped()?;
        let current = self.current_line()?.unwrap_or(0);
        let pc = self.get_pc()?;
        let mut out = String::new();

        for (idx, line) in self.debuggee.source().iter().enumerate() {
            let lineno = idx as u64 + 1;
            let marker = if lineno == current { '>' } else { ' ' };
            writeln!(out, "{marker} {lineno:4}  {line}")?;
        }

        if let Some(fun) = self.debuggee.function_containing(pc) {
            writeln!(out, "\n{}:", fun.name)?;
            for instruction in &fun.instructions {
                let marker = if instruction.addr == pc { '>' } else { ' ' };
                writeln!(
                    out,
                    "{marker} {}  {:24}  {}",
                    instruction.addr, instruction.machine_code, instruction.text
                )?;
            }
        }

        Ok(out)
    }
}
