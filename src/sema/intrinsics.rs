//! Intrinsic function registry
//!
//! Intrinsics are functions whose names the compiler knows: they compile to
//! dedicated IL opcodes or compile-time constants rather than calls. The
//! descriptor table is static data; each compilation session holds its own
//! registry view so no mutable state is ever process-wide.

use lazy_static::lazy_static;
use std::collections::HashMap;

/// Broad grouping of intrinsics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicCategory {
    /// Raw memory access (peek/poke and the volatile forms)
    Memory,
    /// Byte extraction from words
    Bits,
    /// Compile-time queries (length, sizeof)
    Query,
    /// 6502 hardware stack operations
    Stack,
    /// CPU control instructions
    Cpu,
    /// Optimization fences
    Optimization,
}

/// Parameter/return types in intrinsic signatures. `Any` marks arguments
/// the type checker handles specially (type names, arrays, strings).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicType {
    /// 8-bit value
    Byte,
    /// 16-bit value
    Word,
    /// No value
    Void,
    /// Checked specially per intrinsic
    Any,
}

/// Descriptor of one intrinsic function
#[derive(Debug, Clone)]
pub struct IntrinsicDef {
    /// Callable name
    pub name: &'static str,
    /// Parameter types in order
    pub params: &'static [IntrinsicType],
    /// Return type
    pub ret: IntrinsicType,
    /// Grouping
    pub category: IntrinsicCategory,
    /// Evaluated entirely at compile time
    pub compile_time: bool,
    /// Estimated 6502 cycle cost of the lowered form
    pub cycles: u32,
    /// Lowered form must never be reordered or removed
    pub raster_critical: bool,
}

use IntrinsicCategory::*;
use IntrinsicType::*;

lazy_static! {
    /// The fixed intrinsic descriptor table
    static ref INTRINSICS: HashMap<&'static str, IntrinsicDef> = {
        let defs = [
            IntrinsicDef { name: "peek", params: &[Word], ret: Byte, category: Memory, compile_time: false, cycles: 4, raster_critical: false },
            IntrinsicDef { name: "poke", params: &[Word, Byte], ret: Void, category: Memory, compile_time: false, cycles: 4, raster_critical: false },
            IntrinsicDef { name: "peekw", params: &[Word], ret: Word, category: Memory, compile_time: false, cycles: 8, raster_critical: false },
            IntrinsicDef { name: "pokew", params: &[Word, Word], ret: Void, category: Memory, compile_time: false, cycles: 8, raster_critical: false },
            IntrinsicDef { name: "lo", params: &[Word], ret: Byte, category: Bits, compile_time: false, cycles: 3, raster_critical: false },
            IntrinsicDef { name: "hi", params: &[Word], ret: Byte, category: Bits, compile_time: false, cycles: 3, raster_critical: false },
            IntrinsicDef { name: "length", params: &[Any], ret: Word, category: Query, compile_time: true, cycles: 0, raster_critical: false },
            IntrinsicDef { name: "sizeof", params: &[Any], ret: Word, category: Query, compile_time: true, cycles: 0, raster_critical: false },
            IntrinsicDef { name: "pha", params: &[], ret: Void, category: Stack, compile_time: false, cycles: 3, raster_critical: true },
            IntrinsicDef { name: "pla", params: &[], ret: Void, category: Stack, compile_time: false, cycles: 4, raster_critical: true },
            IntrinsicDef { name: "php", params: &[], ret: Void, category: Stack, compile_time: false, cycles: 3, raster_critical: true },
            IntrinsicDef { name: "plp", params: &[], ret: Void, category: Stack, compile_time: false, cycles: 4, raster_critical: true },
            IntrinsicDef { name: "sei", params: &[], ret: Void, category: Cpu, compile_time: false, cycles: 2, raster_critical: true },
            IntrinsicDef { name: "cli", params: &[], ret: Void, category: Cpu, compile_time: false, cycles: 2, raster_critical: true },
            IntrinsicDef { name: "nop", params: &[], ret: Void, category: Cpu, compile_time: false, cycles: 2, raster_critical: true },
            IntrinsicDef { name: "brk", params: &[], ret: Void, category: Cpu, compile_time: false, cycles: 7, raster_critical: true },
            IntrinsicDef { name: "barrier", params: &[], ret: Void, category: Optimization, compile_time: false, cycles: 0, raster_critical: true },
            IntrinsicDef { name: "volatile_read", params: &[Word], ret: Byte, category: Optimization, compile_time: false, cycles: 4, raster_critical: true },
            IntrinsicDef { name: "volatile_write", params: &[Word, Byte], ret: Void, category: Optimization, compile_time: false, cycles: 4, raster_critical: true },
        ];
        let mut m = HashMap::new();
        for def in defs {
            m.insert(def.name, def);
        }
        m
    };
}

/// Source of the built-in `system` pseudo-module. Bodies are empty, which
/// the parser marks as stubs; the analyzer substitutes registry info and
/// the IL generator emits intrinsic opcodes for calls.
pub const SYSTEM_SOURCE: &str = "\
module system

export function peek(addr: word): byte
end function

export function poke(addr: word, value: byte)
end function

export function peekw(addr: word): word
end function

export function pokew(addr: word, value: word)
end function

export function lo(value: word): byte
end function

export function hi(value: word): byte
end function

export function length(value: word): word
end function

export function sizeof(value: word): word
end function

export function pha()
end function

export function pla()
end function

export function php()
end function

export function plp()
end function

export function sei()
end function

export function cli()
end function

export function nop()
end function

export function brk()
end function

export function barrier()
end function

export function volatile_read(addr: word): byte
end function

export function volatile_write(addr: word, value: byte)
end function
";

/// Session-owned view over the intrinsic table
#[derive(Debug, Clone, Default)]
pub struct IntrinsicRegistry;

impl IntrinsicRegistry {
    /// Creates the registry view for one compilation session
    pub fn new() -> Self {
        IntrinsicRegistry
    }

    /// Look up an intrinsic by callable name
    pub fn lookup(&self, name: &str) -> Option<&'static IntrinsicDef> {
        INTRINSICS.get(name)
    }

    /// True when the name belongs to an intrinsic
    pub fn is_intrinsic(&self, name: &str) -> bool {
        INTRINSICS.contains_key(name)
    }

    /// All intrinsic names (deterministic order, for tests and dumps)
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = INTRINSICS.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let reg = IntrinsicRegistry::new();
        let peek = reg.lookup("peek").unwrap();
        assert_eq!(peek.params.len(), 1);
        assert_eq!(peek.ret, IntrinsicType::Byte);
        assert!(!peek.compile_time);

        assert!(reg.lookup("frobnicate").is_none());
    }

    #[test]
    fn test_compile_time_queries() {
        let reg = IntrinsicRegistry::new();
        assert!(reg.lookup("sizeof").unwrap().compile_time);
        assert!(reg.lookup("length").unwrap().compile_time);
    }

    #[test]
    fn test_raster_critical_set() {
        let reg = IntrinsicRegistry::new();
        for name in ["barrier", "volatile_read", "volatile_write", "sei", "brk"] {
            assert!(reg.lookup(name).unwrap().raster_critical, "{}", name);
        }
        assert!(!reg.lookup("peek").unwrap().raster_critical);
    }

    #[test]
    fn test_system_source_covers_registry() {
        let reg = IntrinsicRegistry::new();
        for name in reg.names() {
            assert!(
                SYSTEM_SOURCE.contains(&format!("function {}(", name)),
                "system module is missing a stub for '{}'",
                name
            );
        }
    }
}
