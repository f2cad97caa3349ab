//! Memory layout (pass 6)
//!
//! Computes the byte extent of every module-level symbol across the whole
//! batch, packs zero-page symbols under the 112-byte budget, assigns RAM
//! and data-region addresses, and rejects overlapping placements.

use super::symbols::{StorageClass, SymbolKind, SymbolTable};
use super::types::TypeTable;
use crate::diagnostics::{Diagnostic, DiagnosticBag, DiagnosticCode};
use std::collections::HashMap;

/// First zero-page address handed out ($00/$01 belong to the CPU port)
pub const ZP_BASE: u32 = 0x02;
/// Zero-page budget in bytes
pub const ZP_BUDGET: u32 = 112;
/// Base of the static RAM region
pub const RAM_BASE: u32 = 0xC000;
/// Base of the read-only data region
pub const DATA_BASE: u32 = 0xA000;

/// Memory region a symbol was placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Zero page
    ZeroPage,
    /// Main RAM statics
    Ram,
    /// Read-only data
    Data,
    /// Memory-mapped hardware
    Map,
}

/// One placed symbol
#[derive(Debug, Clone)]
pub struct Placement {
    /// Owning module
    pub module: String,
    /// Symbol name
    pub name: String,
    /// Assigned address
    pub address: u32,
    /// Extent in bytes
    pub size: u32,
    /// Region the symbol lives in
    pub region: Region,
}

/// Batch-wide memory layout
#[derive(Debug, Default)]
pub struct MemoryLayout {
    placements: Vec<Placement>,
    index: HashMap<(String, String), usize>,
    /// Zero-page bytes in use
    pub zp_used: u32,
}

impl MemoryLayout {
    /// Computes the layout over every module's symbol table
    pub fn build(
        modules: &[(String, &SymbolTable)],
        types: &TypeTable,
        diags: &mut DiagnosticBag,
    ) -> Self {
        let mut layout = MemoryLayout::default();
        let mut zp_cursor = ZP_BASE;
        let mut ram_cursor = RAM_BASE;
        let mut data_cursor = DATA_BASE;

        for (module, table) in modules {
            for id in table.module_symbols() {
                let symbol = table.symbol(id);
                match symbol.kind {
                    SymbolKind::MappedVariable => {
                        if let Some(mapped) = table.mapped.get(&id) {
                            layout.place(
                                module,
                                &symbol.name,
                                mapped.base,
                                mapped.size.max(1),
                                Region::Map,
                            );
                        }
                    }
                    SymbolKind::Variable => {
                        let size = symbol.ty.map(|t| types.size_of(t)).unwrap_or(0);
                        if size == 0 {
                            continue;
                        }
                        // Scalar constants fold into immediates and need no
                        // storage.
                        if symbol.is_const && symbol.const_value.is_some() && size <= 2 {
                            continue;
                        }
                        match symbol.storage {
                            StorageClass::ZeroPage => {
                                layout.place(module, &symbol.name, zp_cursor, size, Region::ZeroPage);
                                zp_cursor += size;
                                layout.zp_used += size;
                            }
                            StorageClass::Ram => {
                                layout.place(module, &symbol.name, ram_cursor, size, Region::Ram);
                                ram_cursor += size;
                            }
                            StorageClass::Data => {
                                layout.place(module, &symbol.name, data_cursor, size, Region::Data);
                                data_cursor += size;
                            }
                            StorageClass::Map => {}
                        }
                    }
                    _ => {}
                }
            }
        }

        layout.check_zero_page(diags);
        layout.check_overlaps(diags);
        tracing::debug!(
            zp_used = layout.zp_used,
            placements = layout.placements.len(),
            "memory layout computed"
        );
        layout
    }

    fn place(&mut self, module: &str, name: &str, address: u32, size: u32, region: Region) {
        let idx = self.placements.len();
        self.placements.push(Placement {
            module: module.to_string(),
            name: name.to_string(),
            address,
            size,
            region,
        });
        self.index
            .insert((module.to_string(), name.to_string()), idx);
    }

    fn check_zero_page(&self, diags: &mut DiagnosticBag) {
        if self.zp_used > ZP_BUDGET {
            let loc = crate::source::SourceLocation::start_of("<layout>");
            diags.error(
                DiagnosticCode::ZeroPageOverflow,
                format!(
                    "Zero-page variables use {} bytes, exceeding the {}-byte budget",
                    self.zp_used, ZP_BUDGET
                ),
                loc,
            );
        } else if self.zp_used * 100 >= ZP_BUDGET * 80 && self.zp_used > 0 {
            let loc = crate::source::SourceLocation::start_of("<layout>");
            diags.warn(
                DiagnosticCode::ZeroPageNearOverflow,
                format!(
                    "Zero-page variables use {} of {} bytes (over 80% of the budget)",
                    self.zp_used, ZP_BUDGET
                ),
                loc,
            );
        }
    }

    fn check_overlaps(&self, diags: &mut DiagnosticBag) {
        let mut sorted: Vec<&Placement> = self.placements.iter().collect();
        sorted.sort_by_key(|p| p.address);
        for pair in sorted.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.address + a.size > b.address {
                let loc = crate::source::SourceLocation::start_of("<layout>");
                diags.report(Diagnostic::new(
                    DiagnosticCode::MemoryOverlap,
                    format!(
                        "'{}' (${:04X}-${:04X}) overlaps '{}' (${:04X}-${:04X})",
                        a.name,
                        a.address,
                        a.address + a.size - 1,
                        b.name,
                        b.address,
                        b.address + b.size - 1,
                    ),
                    loc,
                ));
            }
        }
    }

    /// Placement of a symbol, if it was placed
    pub fn placement(&self, module: &str, name: &str) -> Option<&Placement> {
        self.index
            .get(&(module.to_string(), name.to_string()))
            .map(|&i| &self.placements[i])
    }

    /// Static address of a symbol, if placed
    pub fn address_of(&self, module: &str, name: &str) -> Option<u32> {
        self.placement(module, name).map(|p| p.address)
    }

    /// All placements in insertion order
    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::builder::SymbolTableBuilder;
    use crate::lexer::Scanner;
    use crate::parser::Parser;
    use crate::sema::resolver::TypeResolver;
    use crate::parser::ast::NodeMetadata;

    fn layout_for(source: &str) -> (MemoryLayout, DiagnosticBag) {
        let mut diags = DiagnosticBag::new();
        let tokens = Scanner::new(source, "t.bl65").scan_tokens(&mut diags);
        let (program, pd) = Parser::new(tokens, "t.bl65").parse();
        diags.absorb(pd);
        let mut types = TypeTable::new();
        let (mut table, map) = SymbolTableBuilder::new(&mut types, &mut diags).build(&program);
        let mut metadata = NodeMetadata::new();
        TypeResolver::new(&mut table, &map, &mut types, &mut metadata, &mut diags)
            .resolve(&program);
        let modules = vec![(program.module_name.clone(), &table)];
        let layout = MemoryLayout::build(&modules, &types, &mut diags);
        (layout, diags)
    }

    #[test]
    fn test_zero_page_packing() {
        let (layout, diags) =
            layout_for("let a: byte @zeropage = 0\nlet b: word @zeropage = 0\n");
        assert!(!diags.has_errors());
        assert_eq!(layout.address_of("global", "a"), Some(ZP_BASE));
        assert_eq!(layout.address_of("global", "b"), Some(ZP_BASE + 1));
        assert_eq!(layout.zp_used, 3);
    }

    #[test]
    fn test_zero_page_overflow() {
        let (_, diags) =
            layout_for("let big: byte[120] @zeropage\nlet other: byte @zeropage = 0\n");
        assert!(diags.find(DiagnosticCode::ZeroPageOverflow).is_some());
    }

    #[test]
    fn test_zero_page_near_overflow_warning() {
        // 100 of 112 bytes: above the 80% threshold, below the budget
        let (_, diags) = layout_for("let big: byte[100] @zeropage\n");
        assert!(diags.find(DiagnosticCode::ZeroPageNearOverflow).is_some());
        assert!(diags.find(DiagnosticCode::ZeroPageOverflow).is_none());
    }

    #[test]
    fn test_map_overlap_detected() {
        let (_, diags) = layout_for(
            "@map a at $d000\n  x: byte[8]\nend map\n@map b at $d004\n  y: byte\nend map\n",
        );
        assert!(diags.find(DiagnosticCode::MemoryOverlap).is_some());
    }

    #[test]
    fn test_scalar_const_not_placed() {
        let (layout, diags) = layout_for("const SPEED: byte = 3\nlet arr: byte[4] @data = [1, 2, 3, 4]\n");
        assert!(!diags.has_errors());
        assert!(layout.placement("global", "SPEED").is_none());
        let arr = layout.placement("global", "arr").unwrap();
        assert_eq!(arr.region, Region::Data);
        assert_eq!(arr.address, DATA_BASE);
        assert_eq!(arr.size, 4);
    }
}
