//! # DWARF/ELF Facade
//!
//! Everything the engine wants to know about the traced binary's debug
//! information, read once at attach time through [gimli] and [object].
//!
//! [`DebugInfo::build`] walks the compilation units and flattens what the
//! engine needs into owned, queryable tables: per-unit line rows sorted by
//! address, and a `low_pc`-sorted function index carrying each function's
//! variables and frame-base expression. The interval index answers "which
//! function DIE contains this PC" in `O(log n)` without a detour through
//! the disassembly listing. ELF symbols are parsed from the symbol and
//! dynamic-symbol tables on demand.
//!
//! Every address stored here is DWARF-relative; callers rebase against the
//! load address before touching the tracee.

use std::fmt::Display;
use std::path::PathBuf;
use std::rc::Rc;

use gimli::{Attribute, AttributeValue, Expression, Reader, Unit};
use object::{Object, ObjectKind, ObjectSection, ObjectSymbol};
use tracing::{debug, warn};

use crate::addr::Addr;
use crate::errors::Result;

/// The gimli reader used throughout the facade
pub type GimliReader = gimli::EndianRcSlice<gimli::NativeEndian>;

/// One row of a compilation unit's line table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    /// DWARF-relative instruction address
    pub addr: Addr,
    pub line: u64,
    /// Statement boundary flag
    pub is_stmt: bool,
}

/// A variable or formal parameter DIE of some function
#[derive(Debug, Clone)]
pub struct VariableDie {
    pub name: Option<String>,
    /// The location expression, when the attribute exists and is an
    /// exprloc. `has_location` distinguishes "no attribute at all"
    /// (optimized out) from "attribute of an unsupported form".
    pub location: Option<Expression<GimliReader>>,
    pub has_location: bool,
}

/// A function (subprogram) DIE
#[derive(Debug, Clone)]
pub struct FunctionDie {
    pub name: Option<String>,
    pub low_pc: Option<Addr>,
    pub high_pc: Option<Addr>,
    pub frame_base: Option<Expression<GimliReader>>,
    pub encoding: gimli::Encoding,
    pub variables: Vec<VariableDie>,
}

/// Kind of an ELF symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    NoType,
    Object,
    Func,
    Section,
    File,
}

impl Display for SymbolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SymbolKind::NoType => "notype",
            SymbolKind::Object => "object",
            SymbolKind::Func => "func",
            SymbolKind::Section => "section",
            SymbolKind::File => "file",
        };
        write!(f, "{s}")
    }
}

impl From<object::SymbolKind> for SymbolKind {
    fn from(kind: object::SymbolKind) -> Self {
        match kind {
            object::SymbolKind::Text => SymbolKind::Func,
            object::SymbolKind::Data => SymbolKind::Object,
            object::SymbolKind::Section => SymbolKind::Section,
            object::SymbolKind::File => SymbolKind::File,
            _ => SymbolKind::NoType,
        }
    }
}

/// One ELF symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub name: String,
    pub addr: Addr,
}

/// What the facade keeps of one compilation unit
#[derive(Debug)]
struct UnitInfo {
    name: Option<String>,
    comp_dir: Option<String>,
    /// PC ranges of the unit, `[begin, end)`
    ranges: Vec<(Addr, Addr)>,
    /// Line rows, sorted by address, one row per address
    lines: Vec<LineEntry>,
}

impl UnitInfo {
    fn contains(&self, pc: Addr) -> bool {
        self.ranges.iter().any(|(lo, hi)| *lo <= pc && pc < *hi)
    }

    fn basename(&self) -> Option<&str> {
        self.name
            .as_deref()
            .map(|n| n.rsplit('/').next().unwrap_or(n))
    }
}

/// The debug information of the traced binary
pub struct DebugInfo {
    obj_data: Vec<u8>,
    position_independent: bool,
    units: Vec<UnitInfo>,
    functions: Vec<FunctionDie>,
    /// `(low_pc, high_pc, index into functions)`, sorted by `low_pc`
    by_addr: Vec<(Addr, Addr, usize)>,
}

impl DebugInfo {
    /// Parses the binary's DWARF sections into the facade's tables.
    ///
    /// # Errors
    ///
    /// Fails when the file is not a readable ELF object or its DWARF
    /// sections are malformed.
    pub fn build(obj_data: Vec<u8>) -> Result<Self> {
        let object = object::File::parse(&*obj_data)?;
        let position_independent = matches!(object.kind(), ObjectKind::Dynamic);

        let loader = |section: gimli::SectionId| -> std::result::Result<GimliReader, gimli::Error> {
            let data = object
                .section_by_name(section.name())
                .and_then(|s| s.uncompressed_data().ok())
                .unwrap_or_default();
            Ok(GimliReader::new(Rc::from(data.as_ref()), gimli::NativeEndian))
        };
        let dwarf = gimli::Dwarf::load(loader)?;
        drop(object); // the gimli readers hold their own copies

        let mut units = Vec::new();
        let mut functions = Vec::new();

        let mut iter = dwarf.units();
        while let Some(header) = iter.next()? {
            let unit = dwarf.unit(header)?;
            units.push(Self::process_unit(&dwarf, &unit, &mut functions)?);
        }

        let mut by_addr: Vec<(Addr, Addr, usize)> = functions
            .iter()
            .enumerate()
            .filter_map(|(idx, f)| Some((f.low_pc?, f.high_pc?, idx)))
            .collect();
        by_addr.sort_by_key(|(lo, _, _)| *lo);

        debug!(
            "debug info: {} units, {} functions",
            units.len(),
            functions.len()
        );

        Ok(Self {
            obj_data,
            position_independent,
            units,
            functions,
            by_addr,
        })
    }

    fn process_unit(
        dwarf: &gimli::Dwarf<GimliReader>,
        unit: &Unit<GimliReader>,
        functions: &mut Vec<FunctionDie>,
    ) -> Result<UnitInfo> {
        let mut ranges = Vec::new();
        let mut range_iter = dwarf.unit_ranges(unit)?;
        while let Some(range) = range_iter.next()? {
            ranges.push((Addr::from(range.begin), Addr::from(range.end)));
        }

        let mut lines = Vec::new();
        if let Some(program) = unit.line_program.clone() {
            let mut rows = program.rows();
            while let Some((_, row)) = rows.next_row()? {
                if row.end_sequence() {
                    continue;
                }
                let Some(line) = row.line() else { continue };
                lines.push(LineEntry {
                    addr: Addr::from(row.address()),
                    line: line.get(),
                    is_stmt: row.is_stmt(),
                });
            }
        }
        lines.sort_by_key(|e| e.addr);
        lines.dedup_by_key(|e| e.addr);

        let mut tree = unit.entries_tree(None)?;
        let root = tree.root()?;
        let name = parse_string(dwarf, unit, root.entry().attr(gimli::DW_AT_name)?)?;
        let comp_dir = parse_string(dwarf, unit, root.entry().attr(gimli::DW_AT_comp_dir)?)?;

        let mut children = root.children();
        while let Some(node) = children.next()? {
            if node.entry().tag() != gimli::DW_TAG_subprogram {
                continue;
            }

            let entry = node.entry();
            let fun_name = parse_string(dwarf, unit, entry.attr(gimli::DW_AT_name)?)?;
            let low_pc = parse_addr(dwarf, unit, entry.attr(gimli::DW_AT_low_pc)?)?;
            let high_pc = parse_high_addr(entry.attr(gimli::DW_AT_high_pc)?, low_pc)?;
            let frame_base = parse_exprloc(entry.attr(gimli::DW_AT_frame_base)?);

            let mut fun = FunctionDie {
                name: fun_name,
                low_pc,
                high_pc,
                frame_base,
                encoding: unit.encoding(),
                variables: Vec::new(),
            };
            match Self::collect_variables(dwarf, unit, node, &mut fun.variables) {
                Ok(()) => {}
                Err(e) => warn!("could not parse the variables of a function: {e}"),
            }
            functions.push(fun);
        }

        Ok(UnitInfo {
            name,
            comp_dir,
            ranges,
            lines,
        })
    }

    /// Collects variable and parameter DIEs in the subtree below `node`,
    /// descending through lexical blocks.
    fn collect_variables(
        dwarf: &gimli::Dwarf<GimliReader>,
        unit: &Unit<GimliReader>,
        node: gimli::EntriesTreeNode<'_, '_, '_, GimliReader>,
        out: &mut Vec<VariableDie>,
    ) -> Result<()> {
        let mut children = node.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            let tag = entry.tag();
            if tag == gimli::DW_TAG_variable || tag == gimli::DW_TAG_formal_parameter {
                let location_attr = entry.attr(gimli::DW_AT_location)?;
                out.push(VariableDie {
                    name: parse_string(dwarf, unit, entry.attr(gimli::DW_AT_name)?)?,
                    has_location: location_attr.is_some(),
                    location: parse_exprloc(location_attr),
                });
            }
            Self::collect_variables(dwarf, unit, child, out)?;
        }
        Ok(())
    }

    /// Whether the binary was linked position-independent (`ET_DYN`)
    pub fn is_position_independent(&self) -> bool {
        self.position_independent
    }

    /// The line entry covering a DWARF-relative PC.
    ///
    /// `None` when no compilation unit covers the PC, which happens inside
    /// library code and system calls; callers must treat that as a normal
    /// outcome, not a failure.
    pub fn line_entry_for_pc(&self, pc: Addr) -> Option<LineEntry> {
        let unit = self.units.iter().find(|u| u.contains(pc))?;
        let idx = unit.lines.partition_point(|e| e.addr <= pc);
        if idx == 0 {
            return None;
        }
        Some(unit.lines[idx - 1])
    }

    /// The line entry immediately after the one covering `pc`, in table
    /// order. `None` when `pc`'s entry is the last of its unit.
    pub fn next_line_entry(&self, pc: Addr) -> Option<LineEntry> {
        let unit = self.units.iter().find(|u| u.contains(pc))?;
        let idx = unit.lines.partition_point(|e| e.addr <= pc);
        if idx == 0 {
            return None;
        }
        unit.lines.get(idx).copied()
    }

    /// The first statement entry for `line` in the unit whose root name has
    /// the basename `file`.
    pub fn line_entry_for_line(&self, file: &str, line: u64) -> Option<LineEntry> {
        self.units
            .iter()
            .filter(|u| u.basename() == Some(file))
            .flat_map(|u| u.lines.iter())
            .find(|e| e.is_stmt && e.line == line)
            .copied()
    }

    /// The function DIE whose `[low_pc, high_pc)` contains `pc`
    pub fn function_containing_pc(&self, pc: Addr) -> Option<&FunctionDie> {
        let idx = self.by_addr.partition_point(|(lo, _, _)| *lo <= pc);
        if idx == 0 {
            return None;
        }
        let (_, high, fun_idx) = self.by_addr[idx - 1];
        (pc < high).then(|| &self.functions[fun_idx])
    }

    /// The first function DIE with the given name, across all units
    pub fn function_by_name(&self, name: &str) -> Option<&FunctionDie> {
        self.functions
            .iter()
            .find(|f| f.name.as_deref() == Some(name))
    }

    /// The source path of the compilation unit that contains the entry
    /// point, for the source listing.
    pub fn entry_source_path(&self) -> Option<PathBuf> {
        let unit = self.units.iter().find(|u| u.name.is_some())?;
        let name = unit.name.as_deref()?;
        if name.starts_with('/') {
            return Some(PathBuf::from(name));
        }
        match unit.comp_dir.as_deref() {
            Some(dir) => Some(PathBuf::from(dir).join(name)),
            None => Some(PathBuf::from(name)),
        }
    }

    /// ELF symbols with the given name, from symtab and dynsym,
    /// deduplicated.
    ///
    /// # Errors
    ///
    /// Fails when the object file cannot be re-parsed.
    pub fn lookup_symbol(&self, name: &str) -> Result<Vec<Symbol>> {
        let object = object::File::parse(&*self.obj_data)?;

        let mut found: Vec<Symbol> = Vec::new();
        for sym in object.symbols().chain(object.dynamic_symbols()) {
            let Ok(sym_name) = sym.name() else { continue };
            if sym_name != name {
                continue;
            }
            let symbol = Symbol {
                kind: sym.kind().into(),
                name: sym_name.to_string(),
                addr: Addr::from(sym.address()),
            };
            if !found.contains(&symbol) {
                found.push(symbol);
            }
        }

        Ok(found)
    }
}

fn parse_string(
    dwarf: &gimli::Dwarf<GimliReader>,
    unit: &Unit<GimliReader>,
    attribute: Option<Attribute<GimliReader>>,
) -> Result<Option<String>> {
    Ok(match attribute {
        Some(a) => Some(
            dwarf
                .attr_string(unit, a.value())?
                .to_string_lossy()?
                .to_string(),
        ),
        None => None,
    })
}

fn parse_addr(
    dwarf: &gimli::Dwarf<GimliReader>,
    unit: &Unit<GimliReader>,
    attribute: Option<Attribute<GimliReader>>,
) -> Result<Option<Addr>> {
    Ok(match attribute {
        Some(a) => dwarf.attr_address(unit, a.value())?.map(Addr::from),
        None => None,
    })
}

/// `DW_AT_high_pc` is either an address or an offset from `low_pc`
fn parse_high_addr(
    attribute: Option<Attribute<GimliReader>>,
    low_pc: Option<Addr>,
) -> Result<Option<Addr>> {
    Ok(match attribute {
        Some(a) => match a.value() {
            AttributeValue::Addr(addr) => Some(Addr::from(addr)),
            AttributeValue::Udata(offset) => low_pc.map(|low| low + offset as usize),
            _ => None,
        },
        None => None,
    })
}

fn parse_exprloc(attribute: Option<Attribute<GimliReader>>) -> Option<Expression<GimliReader>> {
    match attribute?.value() {
        AttributeValue::Exprloc(expr) => Some(expr),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn unit_with_lines(lines: Vec<LineEntry>, ranges: Vec<(Addr, Addr)>) -> UnitInfo {
        UnitInfo {
            name: Some("/work/prog.c".to_string()),
            comp_dir: Some("/work".to_string()),
            ranges,
            lines,
        }
    }

    fn info_with_unit(unit: UnitInfo) -> DebugInfo {
        DebugInfo {
            obj_data: Vec::new(),
            position_independent: false,
            units: vec![unit],
            functions: Vec::new(),
            by_addr: Vec::new(),
        }
    }

    fn entry(addr: usize, line: u64, is_stmt: bool) -> LineEntry {
        LineEntry {
            addr: Addr::from(addr),
            line,
            is_stmt,
        }
    }

    #[test]
    fn test_line_entry_for_pc() {
        let unit = unit_with_lines(
            vec![
                entry(0x1129, 1, true),
                entry(0x1131, 2, true),
                entry(0x1138, 3, true),
            ],
            vec![(Addr::from(0x1129usize), Addr::from(0x1140usize))],
        );
        let info = info_with_unit(unit);

        // exact hit and mid-entry hit
        assert_eq!(
            info.line_entry_for_pc(Addr::from(0x1131usize)).unwrap().line,
            2
        );
        assert_eq!(
            info.line_entry_for_pc(Addr::from(0x1135usize)).unwrap().line,
            2
        );
        // outside every unit range
        assert!(info.line_entry_for_pc(Addr::from(0x9000usize)).is_none());
    }

    #[test]
    fn test_next_line_entry() {
        let unit = unit_with_lines(
            vec![
                entry(0x1129, 1, true),
                entry(0x1131, 2, true),
                entry(0x1138, 3, true),
            ],
            vec![(Addr::from(0x1129usize), Addr::from(0x1140usize))],
        );
        let info = info_with_unit(unit);

        let next = info.next_line_entry(Addr::from(0x1131usize)).unwrap();
        assert_eq!(next.line, 3);
        // the last entry has no successor
        assert!(info.next_line_entry(Addr::from(0x1138usize)).is_none());
    }

    #[test]
    fn test_line_entry_for_line_wants_statements() {
        let unit = unit_with_lines(
            vec![
                entry(0x1129, 2, false),
                entry(0x1131, 2, true),
                entry(0x1138, 3, true),
            ],
            vec![(Addr::from(0x1129usize), Addr::from(0x1140usize))],
        );
        let info = info_with_unit(unit);

        // the non-statement row at 0x1129 must be skipped
        let hit = info.line_entry_for_line("prog.c", 2).unwrap();
        assert_eq!(hit.addr, Addr::from(0x1131usize));
        assert!(info.line_entry_for_line("other.c", 2).is_none());
        assert!(info.line_entry_for_line("prog.c", 99).is_none());
    }

    #[test]
    fn test_function_interval_index() {
        let fun = |name: &str, lo: usize, hi: usize| FunctionDie {
            name: Some(name.to_string()),
            low_pc: Some(Addr::from(lo)),
            high_pc: Some(Addr::from(hi)),
            frame_base: None,
            encoding: gimli::Encoding {
                address_size: 8,
                format: gimli::Format::Dwarf32,
                version: 4,
            },
            variables: Vec::new(),
        };
        let functions = vec![fun("a", 0x1129, 0x1150), fun("b", 0x1150, 0x1180)];
        let mut by_addr: Vec<(Addr, Addr, usize)> = functions
            .iter()
            .enumerate()
            .map(|(i, f)| (f.low_pc.unwrap(), f.high_pc.unwrap(), i))
            .collect();
        by_addr.sort_by_key(|(lo, _, _)| *lo);
        let info = DebugInfo {
            obj_data: Vec::new(),
            position_independent: false,
            units: Vec::new(),
            functions,
            by_addr,
        };

        assert_eq!(
            info.function_containing_pc(Addr::from(0x1130usize))
                .unwrap()
                .name
                .as_deref(),
            Some("a")
        );
        // high_pc is exclusive
        assert_eq!(
            info.function_containing_pc(Addr::from(0x1150usize))
                .unwrap()
                .name
                .as_deref(),
            Some("b")
        );
        assert!(info.function_containing_pc(Addr::from(0x1000usize)).is_none());
        assert!(info.function_containing_pc(Addr::from(0x2000usize)).is_none());
        assert_eq!(
            info.function_by_name("b").unwrap().low_pc,
            Some(Addr::from(0x1150usize))
        );
        assert!(info.function_by_name("c").is_none());
    }

    #[test]
    fn test_entry_source_path_joins_comp_dir() {
        let relative = UnitInfo {
            name: Some("prog.c".to_string()),
            comp_dir: Some("/work".to_string()),
            ranges: Vec::new(),
            lines: Vec::new(),
        };
        let info = info_with_unit(relative);
        assert_eq!(info.entry_source_path().unwrap(), PathBuf::from("/work/prog.c"));

        let absolute = unit_with_lines(Vec::new(), Vec::new());
        let info = info_with_unit(absolute);
        assert_eq!(info.entry_source_path().unwrap(), PathBuf::from("/work/prog.c"));
    }

    #[test]
    fn test_unit_basename() {
        let unit = unit_with_lines(Vec::new(), Vec::new());
        assert_eq!(unit.basename(), Some("prog.c"));
    }
}
