//! IL instructions (typed three-address code)
//!
//! Instructions carry an id, an opcode, an optional result register, a
//! uniform operand list, and metadata the optimizer and code generator
//! rely on (source location, 6502 hints, loop info, raster-critical flag,
//! mapped-struct structure).

use super::value::{BlockId, IlType, Value, VReg};
use crate::parser::ast::CoercionKind;
use crate::source::SourceLocation;
use std::fmt;

/// Instruction id, unique within a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrId(pub u32);

/// Preferred physical register hint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuReg {
    /// Accumulator
    A,
    /// X index register
    X,
    /// Y index register
    Y,
}

/// Addressing-mode hint recorded by the generator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingHint {
    /// Zero-page direct
    ZeroPage,
    /// Absolute
    Absolute,
    /// Absolute indexed by X or Y
    Indexed,
    /// Indirect through a zero-page pointer, Y-indexed
    IndirectY,
    /// Immediate operand
    Immediate,
}

/// Estimated execution frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Frequency {
    /// Inside a hot loop
    Hot,
    /// Straight-line code
    #[default]
    Normal,
    /// Error paths and cold branches
    Cold,
}

/// Structural info for a memory-mapped struct access, kept so the
/// optimizer can see that related hardware accesses are sequential
#[derive(Debug, Clone, PartialEq)]
pub struct MappedAccess {
    /// Struct name (e.g. `vic`)
    pub struct_name: String,
    /// Field name
    pub field: String,
    /// Struct base address
    pub base: u32,
    /// Field offset from the base
    pub offset: u32,
    /// Element count for range (array) fields
    pub range: Option<u32>,
}

/// Per-instruction metadata
#[derive(Debug, Clone, Default)]
pub struct InstrMeta {
    /// Originating source span
    pub loc: Option<SourceLocation>,
    /// Addressing-mode hint for the code generator
    pub addressing: Option<AddressingHint>,
    /// Expression nesting depth that produced the value
    pub complexity: u32,
    /// Register-pressure estimate at this point
    pub reg_pressure: u32,
    /// Coercion this instruction realizes, when it is a conversion
    pub coercion: Option<CoercionKind>,
    /// Preferred 6502 register (A/X/Y)
    pub preferred_reg: Option<CpuReg>,
    /// Zero-page priority score (0-100); higher spills to zero page first
    pub zp_priority: u8,
    /// Loop nesting depth
    pub loop_depth: u32,
    /// Instruction belongs to a loop header block
    pub is_loop_header: bool,
    /// Instruction belongs to a loop latch block
    pub is_loop_latch: bool,
    /// Estimated 6502 cycles of the lowered form
    pub cycles: u32,
    /// Must never be removed or reordered (VIC-II timing)
    pub raster_critical: bool,
    /// Execution frequency estimate
    pub frequency: Frequency,
    /// Mapped-struct access structure
    pub mapped: Option<MappedAccess>,
}

/// IL opcodes. Name payloads identify the accessed entity; everything
/// value-like flows through the operand list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Value / memory
    /// Materialize a constant: operands `[const]`
    Const,
    /// Load a named variable
    LoadVar(String),
    /// Store to a named variable: operands `[value]`
    StoreVar(String),
    /// Load an array element: operands `[index]`
    LoadArray(String),
    /// Store an array element: operands `[index, value]`
    StoreArray(String),
    /// Load a mapped-struct field; structure in `meta.mapped`
    MapLoadField,
    /// Store a mapped-struct field: operands `[value]`
    MapStoreField,
    /// Load from a mapped range: operands `[index]`
    MapLoadRange,
    /// Store to a mapped range: operands `[index, value]`
    MapStoreRange,

    // Arithmetic / bitwise
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division
    Div,
    /// Modulo
    Mod,
    /// Negation
    Neg,
    /// Bitwise AND
    And,
    /// Bitwise OR
    Or,
    /// Bitwise XOR
    Xor,
    /// Bitwise NOT
    Not,
    /// Shift left
    Shl,
    /// Shift right
    Shr,

    // Comparison
    /// Equal
    CmpEq,
    /// Not equal
    CmpNe,
    /// Less than (unsigned)
    CmpLt,
    /// Less or equal (unsigned)
    CmpLe,
    /// Greater than (unsigned)
    CmpGt,
    /// Greater or equal (unsigned)
    CmpGe,

    // Logical (compact forms; short-circuit is lowered to branches)
    /// Logical AND
    LogicalAnd,
    /// Logical OR
    LogicalOr,
    /// Logical NOT
    LogicalNot,

    // Conversions
    /// byte -> word
    ZeroExtend,
    /// word -> byte
    Truncate,
    /// boolean -> byte
    BoolToByte,
    /// byte -> boolean
    ByteToBool,

    // Control flow
    /// Unconditional jump: blocks `[target]`
    Jump,
    /// Conditional branch: operands `[cond]`, blocks `[then, else]`
    Branch,
    /// Return a value: operands `[value]`, blocks `[exit]`
    Return,
    /// Return void: blocks `[exit]`
    ReturnVoid,

    // Calls
    /// Call with a result
    Call(String),
    /// Call without a result
    CallVoid(String),
    /// Call through a callback value: operands `[target, args...]`
    CallIndirect,
    /// Address of a function: produces a `ptr`
    FuncAddr(String),

    // Intrinsics
    /// Read a byte from memory: operands `[addr]`
    Peek,
    /// Write a byte to memory: operands `[addr, value]`
    Poke,
    /// Read a word from memory: operands `[addr]`
    Peekw,
    /// Write a word to memory: operands `[addr, value]`
    Pokew,
    /// Low byte of a word
    Lo,
    /// High byte of a word
    Hi,
    /// Push accumulator
    Pha,
    /// Pull accumulator
    Pla,
    /// Push processor status
    Php,
    /// Pull processor status
    Plp,
    /// Set interrupt disable
    Sei,
    /// Clear interrupt disable
    Cli,
    /// No operation
    NopOp,
    /// Software break
    Brk,
    /// Optimization fence; emits only a comment
    Barrier,
    /// Forced read that optimizations may not merge or move
    VolatileRead,
    /// Forced write that optimizations may not merge or move
    VolatileWrite,

    /// Inline assembly passed through verbatim
    InlineAsm(String),

    /// SSA phi: operands `[v1..vn]`, blocks `[pred1..predn]`
    Phi,
}

impl Opcode {
    /// Mnemonic used in IL dumps
    pub fn name(&self) -> &'static str {
        use Opcode::*;
        match self {
            Const => "const",
            LoadVar(_) => "load_var",
            StoreVar(_) => "store_var",
            LoadArray(_) => "load_array",
            StoreArray(_) => "store_array",
            MapLoadField => "map_load_field",
            MapStoreField => "map_store_field",
            MapLoadRange => "map_load_range",
            MapStoreRange => "map_store_range",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Mod => "mod",
            Neg => "neg",
            And => "and",
            Or => "or",
            Xor => "xor",
            Not => "not",
            Shl => "shl",
            Shr => "shr",
            CmpEq => "cmp_eq",
            CmpNe => "cmp_ne",
            CmpLt => "cmp_lt",
            CmpLe => "cmp_le",
            CmpGt => "cmp_gt",
            CmpGe => "cmp_ge",
            LogicalAnd => "land",
            LogicalOr => "lor",
            LogicalNot => "lnot",
            ZeroExtend => "zext",
            Truncate => "trunc",
            BoolToByte => "b2i",
            ByteToBool => "i2b",
            Jump => "jump",
            Branch => "branch",
            Return => "ret",
            ReturnVoid => "ret_void",
            Call(_) => "call",
            CallVoid(_) => "call_void",
            CallIndirect => "call_ind",
            FuncAddr(_) => "func_addr",
            Peek => "peek",
            Poke => "poke",
            Peekw => "peekw",
            Pokew => "pokew",
            Lo => "lo",
            Hi => "hi",
            Pha => "pha",
            Pla => "pla",
            Php => "php",
            Plp => "plp",
            Sei => "sei",
            Cli => "cli",
            NopOp => "nop",
            Brk => "brk",
            Barrier => "barrier",
            VolatileRead => "volatile_read",
            VolatileWrite => "volatile_write",
            InlineAsm(_) => "asm",
            Phi => "phi",
        }
    }

    /// Terminators end a basic block
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Jump | Opcode::Branch | Opcode::Return | Opcode::ReturnVoid
        )
    }

    /// Instructions with effects beyond their result value; dead-code
    /// elimination must keep them
    pub fn has_side_effects(&self) -> bool {
        use Opcode::*;
        matches!(
            self,
            StoreVar(_)
                | StoreArray(_)
                | MapStoreField
                | MapStoreRange
                | MapLoadField
                | MapLoadRange
                | Jump
                | Branch
                | Return
                | ReturnVoid
                | Call(_)
                | CallVoid(_)
                | CallIndirect
                | Poke
                | Pokew
                | Peek
                | Peekw
                | Pha
                | Pla
                | Php
                | Plp
                | Sei
                | Cli
                | NopOp
                | Brk
                | Barrier
                | VolatileRead
                | VolatileWrite
                | InlineAsm(_)
        )
    }

    /// Pure value computations: safe to fold, propagate, and deduplicate
    pub fn is_pure(&self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Const
                | Add
                | Sub
                | Mul
                | Div
                | Mod
                | Neg
                | And
                | Or
                | Xor
                | Not
                | Shl
                | Shr
                | CmpEq
                | CmpNe
                | CmpLt
                | CmpLe
                | CmpGt
                | CmpGe
                | LogicalAnd
                | LogicalOr
                | LogicalNot
                | ZeroExtend
                | Truncate
                | BoolToByte
                | ByteToBool
                | Lo
                | Hi
                | FuncAddr(_)
        )
    }

    /// Sequence points: nothing may move, merge, or be eliminated across
    /// these
    pub fn is_sequence_point(&self) -> bool {
        matches!(
            self,
            Opcode::Barrier | Opcode::VolatileRead | Opcode::VolatileWrite
        )
    }
}

/// One IL instruction
#[derive(Debug, Clone)]
pub struct Instruction {
    /// Id, unique within the function
    pub id: InstrId,
    /// Opcode
    pub op: Opcode,
    /// Result register, when the instruction produces a value
    pub result: Option<VReg>,
    /// Value operands
    pub operands: Vec<Value>,
    /// Block operands (jump targets, phi predecessor blocks)
    pub blocks: Vec<BlockId>,
    /// Metadata
    pub meta: InstrMeta,
}

impl Instruction {
    /// Registers read by this instruction
    pub fn used_regs(&self) -> impl Iterator<Item = VReg> + '_ {
        self.operands.iter().filter_map(|v| v.as_reg())
    }

    /// Must this instruction stay, regardless of result liveness?
    pub fn must_keep(&self) -> bool {
        self.op.has_side_effects() || self.meta.raster_critical
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = self.result {
            write!(f, "{} = ", result)?;
        }
        write!(f, "{}", self.op.name())?;
        match &self.op {
            Opcode::LoadVar(n) | Opcode::StoreVar(n) | Opcode::LoadArray(n)
            | Opcode::StoreArray(n) | Opcode::Call(n) | Opcode::CallVoid(n)
            | Opcode::FuncAddr(n) => write!(f, " @{}", n)?,
            Opcode::MapLoadField
            | Opcode::MapStoreField
            | Opcode::MapLoadRange
            | Opcode::MapStoreRange => {
                if let Some(mapped) = &self.meta.mapped {
                    write!(
                        f,
                        " @{}.{} (${:04X}+${:02X})",
                        mapped.struct_name, mapped.field, mapped.base, mapped.offset
                    )?;
                }
            }
            _ => {}
        }
        if self.op == Opcode::Phi {
            for (value, block) in self.operands.iter().zip(self.blocks.iter()) {
                write!(f, " [{}, {}]", value, block)?;
            }
            return Ok(());
        }
        for operand in &self.operands {
            write!(f, " {}", operand)?;
        }
        for block in &self.blocks {
            write!(f, " -> {}", block)?;
        }
        if self.meta.raster_critical {
            write!(f, " !raster")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::value::Constant;

    #[test]
    fn test_opcode_classes() {
        assert!(Opcode::Jump.is_terminator());
        assert!(!Opcode::Add.is_terminator());
        assert!(Opcode::Add.is_pure());
        assert!(!Opcode::Poke.is_pure());
        assert!(Opcode::Poke.has_side_effects());
        assert!(Opcode::Barrier.is_sequence_point());
        assert!(!Opcode::Peek.is_sequence_point());
    }

    #[test]
    fn test_display() {
        let instr = Instruction {
            id: InstrId(0),
            op: Opcode::Add,
            result: Some(VReg::new(2, IlType::Byte)),
            operands: vec![
                Value::Const(Constant::byte(2)),
                Value::Const(Constant::byte(3)),
            ],
            blocks: vec![],
            meta: InstrMeta::default(),
        };
        assert_eq!(instr.to_string(), "v2:b8 = add 2:b8 3:b8");
    }

    #[test]
    fn test_must_keep_raster_critical() {
        let mut instr = Instruction {
            id: InstrId(0),
            op: Opcode::Const,
            result: Some(VReg::new(0, IlType::Byte)),
            operands: vec![Value::Const(Constant::byte(0))],
            blocks: vec![],
            meta: InstrMeta::default(),
        };
        assert!(!instr.must_keep());
        instr.meta.raster_critical = true;
        assert!(instr.must_keep());
    }
}
