//! # Disassembly Index
//!
//! An in-memory table of the tracee's functions and their instructions,
//! produced by running the system's `objdump` over the binary once at
//! attach time.
//!
//! The objdump output is persisted next to the binary as a `.asm` sidecar
//! and then parsed line by line: a line containing a tab is an instruction,
//! a line without one is a function header, section banners and blank lines
//! are skipped. The table serves display and "which function owns this PC"
//! lookups only; control transfers are never computed from it.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, warn};

use crate::addr::Addr;
use crate::errors::{DebuggerError, Result};

/// One disassembled instruction
#[derive(Debug, Clone, Default)]
pub struct AsmInstruction {
    pub addr: Addr,
    pub machine_code: String,
    pub text: String,
    pub comment: Option<String>,
}

/// One function block of the disassembly listing
#[derive(Debug, Clone, Default)]
pub struct AsmFunction {
    pub start_addr: Addr,
    /// Address of the last instruction in the block, not one past it
    pub end_addr: Addr,
    pub name: String,
    pub instructions: Vec<AsmInstruction>,
}

impl AsmFunction {
    pub fn contains(&self, pc: Addr) -> bool {
        self.start_addr <= pc && pc <= self.end_addr
    }
}

/// The ordered function table of the traced binary
#[derive(Debug, Default)]
pub struct DisasmIndex {
    functions: Vec<AsmFunction>,
}

impl DisasmIndex {
    /// Runs the external disassembler, persists the sidecar, parses it and
    /// rebases every address by `load_address`.
    ///
    /// # Errors
    ///
    /// Fails when objdump cannot be spawned or exits nonzero, or when the
    /// sidecar file cannot be written or read back.
    pub fn build(program: impl AsRef<Path>, load_address: Addr) -> Result<Self> {
        let sidecar = Self::write_sidecar(program.as_ref())?;
        let text = std::fs::read_to_string(&sidecar)?;
        let mut index = Self::parse_listing(&text);
        index.rebase(load_address);
        debug!(
            "disassembly index: {} functions from {}",
            index.functions.len(),
            sidecar.display()
        );
        Ok(index)
    }

    /// `objdump -d <program>`, first three banner lines dropped, persisted
    /// as `<program>.asm`
    fn write_sidecar(program: &Path) -> Result<PathBuf> {
        let output = Command::new("objdump").arg("-d").arg(program).output()?;
        if !output.status.success() {
            return Err(DebuggerError::Disassembler(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        let trimmed: String = listing
            .lines()
            .skip(3)
            .flat_map(|l| [l, "\n"])
            .collect();

        let sidecar = PathBuf::from(format!("{}.asm", program.display()));
        std::fs::write(&sidecar, trimmed)?;
        Ok(sidecar)
    }

    /// Parses the sidecar text into function blocks.
    ///
    /// Unparseable lines are skipped rather than aborting the whole index;
    /// instruction lines with fewer than three fields become empty records.
    pub fn parse_listing(text: &str) -> Self {
        let mut functions: Vec<AsmFunction> = Vec::new();

        for line in text.lines() {
            if line.is_empty() || line.starts_with("Disassembly") {
                continue;
            }

            if line.contains('\t') {
                let Some(current) = functions.last_mut() else {
                    warn!("instruction line before any function header, skipping");
                    continue;
                };
                current.instructions.push(parse_instruction(line));
            } else if let Some(head) = parse_function_header(line) {
                functions.push(head);
            } else {
                warn!("unparseable disassembly line: {line:?}");
            }
        }

        for fun in &mut functions {
            if let Some(last) = fun.instructions.last() {
                fun.end_addr = last.addr;
            }
        }

        Self { functions }
    }

    fn rebase(&mut self, load_address: Addr) {
        for fun in &mut self.functions {
            fun.start_addr += load_address;
            fun.end_addr += load_address;
            for instruction in &mut fun.instructions {
                instruction.addr += load_address;
            }
        }
    }

    /// The first function whose `[start_addr, end_addr]` contains `pc`
    pub fn function_containing(&self, pc: Addr) -> Option<&AsmFunction> {
        self.functions.iter().find(|f| f.contains(pc))
    }

    pub fn functions(&self) -> &[AsmFunction] {
        &self.functions
    }
}

/// `0000000000001129 <main>:` becomes start address plus name
fn parse_function_header(line: &str) -> Option<AsmFunction> {
    let mut parts = line.split_whitespace();
    let addr = usize::from_str_radix(parts.next()?, 16).ok()?;
    let name = parts
        .next()?
        .strip_prefix('<')?
        .strip_suffix(">:")?
        .to_string();

    Some(AsmFunction {
        start_addr: Addr::from(addr),
        name,
        ..Default::default()
    })
}

/// Tab-splits an instruction line into up to four fields: address, machine
/// bytes, mnemonic text, and a trailing `#` comment split off the last
/// field.
fn parse_instruction(line: &str) -> AsmInstruction {
    let mut fields: Vec<String> = line.split('\t').map(String::from).collect();

    if let Some(last) = fields.last() {
        if let Some((text, comment)) = last.split_once('#') {
            let (text, comment) = (text.to_string(), comment.to_string());
            fields.pop();
            fields.push(text);
            fields.push(comment);
        }
    }

    for field in &mut fields {
        *field = field.trim().to_string();
    }

    if fields.len() < 3 {
        return AsmInstruction::default();
    }

    let addr = match usize::from_str_radix(fields[0].trim_end_matches(':'), 16) {
        Ok(a) => Addr::from(a),
        Err(_) => return AsmInstruction::default(),
    };

    AsmInstruction {
        addr,
        machine_code: fields[1].clone(),
        text: fields[2].clone(),
        comment: fields.get(3).cloned(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const LISTING: &str = "Disassembly of section .init:\n\
\n\
0000000000001000 <_init>:\n\
    1000:\tf3 0f 1e fa          \tendbr64\n\
    1004:\t48 83 ec 08          \tsub    $0x8,%rsp\n\
\n\
Disassembly of section .text:\n\
\n\
0000000000001129 <main>:\n\
    1129:\t55                   \tpush   %rbp\n\
    112a:\t48 89 e5             \tmov    %rsp,%rbp\n\
    112d:\tc7 45 f8 03 00 00 00 \tmovl   $0x3,-0x8(%rbp)\n\
    1134:\t48 8d 3d c9 0e 00 00 \tlea    0xec9(%rip),%rdi        # 2004 <_IO_stdin_used+0x4>\n\
    113b:\tc9                   \tleave\n\
    113c:\tc3                   \tret\n";

    #[test]
    fn test_parse_functions() {
        let index = DisasmIndex::parse_listing(LISTING);
        let funs = index.functions();
        assert_eq!(funs.len(), 2);
        assert_eq!(funs[0].name, "_init");
        assert_eq!(funs[1].name, "main");
        assert_eq!(funs[1].start_addr, Addr::from(0x1129usize));
        assert_eq!(funs[1].end_addr, Addr::from(0x113cusize));
        assert_eq!(funs[1].instructions.len(), 6);
    }

    #[test]
    fn test_bounds_invariant() {
        let index = DisasmIndex::parse_listing(LISTING);
        for fun in index.functions() {
            for instruction in &fun.instructions {
                assert!(fun.start_addr <= instruction.addr);
                assert!(instruction.addr <= fun.end_addr);
            }
            assert_eq!(
                fun.end_addr,
                fun.instructions.last().unwrap().addr,
                "end_addr must be the last instruction's address"
            );
        }
    }

    #[test]
    fn test_comment_split() {
        let index = DisasmIndex::parse_listing(LISTING);
        let lea = &index.functions()[1].instructions[3];
        assert_eq!(lea.addr, Addr::from(0x1134usize));
        assert!(lea.text.starts_with("lea"));
        assert_eq!(lea.comment.as_deref(), Some("2004 <_IO_stdin_used+0x4>"));
        let push = &index.functions()[1].instructions[0];
        assert!(push.comment.is_none());
    }

    #[test]
    fn test_short_line_becomes_empty_record() {
        let listing = "0000000000001000 <_init>:\n\t...\n";
        let index = DisasmIndex::parse_listing(listing);
        let instruction = &index.functions()[0].instructions[0];
        assert_eq!(instruction.addr, Addr::NULL);
        assert!(instruction.text.is_empty());
    }

    #[test]
    fn test_rebase() {
        let mut index = DisasmIndex::parse_listing(LISTING);
        let load = Addr::from(0x555555554000usize);
        index.rebase(load);
        let main = &index.functions()[1];
        assert_eq!(main.start_addr, Addr::from(0x555555555129usize));
        assert_eq!(main.instructions[0].addr, Addr::from(0x555555555129usize));
        assert_eq!(main.end_addr, Addr::from(0x55555555513cusize));
    }

    #[test]
    fn test_function_containing() {
        let index = DisasmIndex::parse_listing(LISTING);
        let hit = index.function_containing(Addr::from(0x112dusize)).unwrap();
        assert_eq!(hit.name, "main");
        // end address is inclusive
        assert!(index.function_containing(Addr::from(0x113cusize)).is_some());
        assert!(index.function_containing(Addr::from(0x5000usize)).is_none());
    }
}
