//! 6502 code generation
//!
//! Consumes optimized IL and emits ACME-syntax assembly for the C64.
//! Virtual registers live in X (by hint) or zero-page scratch slots; the
//! accumulator carries every lowered sequence and Y serves indexed
//! addressing. Phis are lowered to moves on the incoming edges before
//! emission. Every assembly line remembers the source location and symbol
//! it came from, feeding the `--debug` source map.

pub mod asm;
pub mod regalloc;

use crate::config::ExitBehavior;
use crate::error::{Error, Result};
use crate::ir::{
    BlockId, GlobalInit, IlFunction, IlModule, IlType, Instruction, Opcode, VReg, Value,
};
use crate::sema::StorageClass;
use asm::{AsmWriter, SourceMapEntry};
use regalloc::{Allocation, Location, HELPER_BASE, PTR_SCRATCH, X_STASH, Y_STASH};
use std::collections::{HashMap, HashSet};

/// Code generator options
#[derive(Debug, Clone, Default)]
pub struct CodegenOptions {
    /// Behavior after `main` returns
    pub exit_behavior: ExitBehavior,
    /// Emit the source map
    pub debug: bool,
}

/// Generated artifact
#[derive(Debug)]
pub struct CodegenOutput {
    /// ACME assembly text
    pub assembly: String,
    /// Generated-line -> source mapping (empty unless `debug`)
    pub source_map: Vec<SourceMapEntry>,
    /// Number of output lines
    pub lines: usize,
}

/// One known global, resolved to an address expression
#[derive(Debug, Clone)]
struct GlobalInfo {
    label: String,
    addr: Option<u32>,
    ty: IlType,
    size: u32,
    storage: StorageClass,
    init: GlobalInit,
}

impl GlobalInfo {
    /// Address expression with a byte offset
    fn at(&self, offset: u32) -> String {
        match self.addr {
            Some(addr) => format!("${:04x}", addr + offset),
            None if offset == 0 => self.label.clone(),
            None => format!("{}+{}", self.label, offset),
        }
    }

    /// True when the global is an array (or string) rather than a scalar
    fn is_array(&self) -> bool {
        self.size > self.ty.size()
    }
}

/// One known function
#[derive(Debug, Clone)]
struct FnSig {
    label: String,
    params: Vec<IlType>,
}

/// 6502 code generator
pub struct CodeGenerator {
    options: CodegenOptions,
}

impl CodeGenerator {
    /// Creates a generator with the given options
    pub fn new(options: CodegenOptions) -> Self {
        CodeGenerator { options }
    }

    /// Lowers the whole batch into one assembly artifact
    pub fn generate(&self, modules: &[IlModule]) -> Result<CodegenOutput> {
        let mut env: HashMap<String, GlobalInfo> = HashMap::new();
        let mut fns: HashMap<String, FnSig> = HashMap::new();
        let mut address_taken: HashSet<String> = HashSet::new();
        let mut uses_mul = false;
        let mut uses_div = false;
        let mut uses_icall = false;
        let mut main_label: Option<String> = None;

        for module in modules {
            for global in &module.globals {
                env.insert(
                    global.name.clone(),
                    GlobalInfo {
                        label: asm::global_label(&global.name),
                        addr: global.address,
                        ty: global.ty,
                        size: global.size,
                        storage: global.storage,
                        init: global.init.clone(),
                    },
                );
            }
            for func in &module.functions {
                let qualified = format!("{}.{}", module.name, func.name);
                fns.insert(
                    qualified.clone(),
                    FnSig {
                        label: asm::function_label(&qualified),
                        params: func.params.iter().map(|p| p.ty).collect(),
                    },
                );
                if func.name == "main" {
                    main_label = Some(asm::function_label(&qualified));
                }
                for block in &func.blocks {
                    for instr in &block.instructions {
                        match &instr.op {
                            Opcode::FuncAddr(name) => {
                                address_taken.insert(name.clone());
                                uses_icall = true;
                            }
                            Opcode::CallIndirect => uses_icall = true,
                            Opcode::Mul => uses_mul = true,
                            Opcode::Div | Opcode::Mod => uses_div = true,
                            _ => {}
                        }
                    }
                }
            }
        }

        let main_label =
            main_label.ok_or_else(|| Error::internal("code generation without a main"))?;

        let mut w = AsmWriter::new();
        w.comment("Generated by blend65 - ACME syntax");
        w.comment(&format!("target: c64, exit: {:?}", self.options.exit_behavior));
        w.raw("!cpu 6510");
        w.blank();
        w.raw("* = $0801");
        w.raw("!byte $0b,$08,$0a,$00,$9e,$32,$30,$36,$31,$00,$00,$00 ; 10 SYS 2061");
        w.blank();

        let needs_static_init = env.values().any(|g| {
            matches!(g.init, GlobalInit::Bytes(_))
                && matches!(g.storage, StorageClass::ZeroPage | StorageClass::Ram)
                && g.addr.is_some()
        });

        w.label("start");
        if needs_static_init {
            w.instr("jsr __static_init");
        }
        w.instr(format!("jsr {}", main_label));
        match self.options.exit_behavior {
            ExitBehavior::Loop => {
                w.label("__exit_loop");
                w.instr("jmp __exit_loop");
            }
            ExitBehavior::Basic => w.instr_commented("jmp $a474", "BASIC warm start"),
            ExitBehavior::Reset => w.instr_commented("jmp $fce2", "soft reset"),
        }
        w.blank();

        for module in modules {
            for func in &module.functions {
                let qualified = format!("{}.{}", module.name, func.name);
                let mut emitter = FuncEmitter {
                    w: &mut w,
                    func,
                    qualified: qualified.clone(),
                    alloc: regalloc::allocate(func)?,
                    env: &env,
                    fns: &fns,
                    stubs: Vec::new(),
                    overrides: HashMap::new(),
                    uses: count_uses(func),
                };
                emitter.emit()?;
                if address_taken.contains(&qualified) {
                    emit_thunk(&mut w, &qualified, fns[&qualified].params.as_slice());
                }
                w.blank();
            }
        }

        if uses_icall {
            w.label("__icall_vec");
            w.instr_commented("jmp $0000", "patched before every indirect call");
            w.blank();
        }
        if uses_mul {
            emit_mul16(&mut w);
        }
        if uses_div {
            emit_div16(&mut w);
        }
        if needs_static_init {
            emit_static_init(&mut w, &env);
        }

        emit_globals(&mut w, &env, &fns, uses_icall);

        let assembly = w.render();
        let source_map = if self.options.debug {
            w.source_map()
        } else {
            Vec::new()
        };
        let lines = w.len();
        tracing::debug!(lines, "assembly emitted");
        Ok(CodegenOutput {
            assembly,
            source_map,
            lines,
        })
    }
}

/// Use counts per register (drives compare/branch fusion)
fn count_uses(func: &IlFunction) -> HashMap<u32, u32> {
    let mut uses: HashMap<u32, u32> = HashMap::new();
    for block in &func.blocks {
        for instr in &block.instructions {
            for reg in instr.used_regs() {
                *uses.entry(reg.id).or_insert(0) += 1;
            }
        }
    }
    uses
}

/// Pending phi-move trampoline for one CFG edge
struct EdgeStub {
    label: String,
    copies: Vec<(Location, IlType, Value)>,
    target: String,
}

struct FuncEmitter<'a> {
    w: &'a mut AsmWriter,
    func: &'a IlFunction,
    qualified: String,
    alloc: Allocation,
    env: &'a HashMap<String, GlobalInfo>,
    fns: &'a HashMap<String, FnSig>,
    stubs: Vec<EdgeStub>,
    /// Per-instruction location overrides for stashed X/Y operands
    overrides: HashMap<u32, Location>,
    uses: HashMap<u32, u32>,
}

impl<'a> FuncEmitter<'a> {
    fn emit(&mut self) -> Result<()> {
        self.w.current_symbol = Some(self.qualified.clone());
        self.w.current_loc = None;
        self.w.comment(&format!("function {}", self.qualified));
        self.w.label(&asm::function_label(&self.qualified));

        // Prologue: arguments arrive in the static parameter slots
        for (index, param) in self.func.params.iter().enumerate() {
            let slot = asm::param_label(&self.qualified, index);
            self.w.instr(format!("lda {}", slot));
            self.store_a(param.reg, false);
            if param.ty.size() == 2 {
                self.w.instr(format!("lda {}+1", slot));
                self.store_a(param.reg, true);
            }
        }

        let order = self.func.reachable_blocks();
        for (position, &block_id) in order.iter().enumerate() {
            if block_id == self.func.exit {
                continue; // emitted last
            }
            let block = self.func.block(block_id);
            if block.instructions.is_empty() && block_id != self.func.entry {
                continue;
            }
            self.w
                .label(&asm::block_label(&self.qualified, block_id.0));

            let next_block = order.get(position + 1).copied();
            let instrs = &block.instructions;
            let mut index = 0;
            while index < instrs.len() {
                let instr = &instrs[index];
                self.w.current_loc = instr.meta.loc.clone();

                // Compare/branch fusion: a single-use byte comparison
                // feeding the next instruction's branch
                if let Some(next) = instrs.get(index + 1) {
                    if self.can_fuse(instr, next) {
                        self.emit_fused_branch(block_id, instr, next, next_block)?;
                        index += 2;
                        continue;
                    }
                }

                self.emit_instr(block_id, instr, next_block)?;
                index += 1;
            }
        }

        // Exit: single rts every return funnels through
        self.w.current_loc = None;
        self.w.label(&asm::exit_label(&self.qualified));
        self.w.instr("rts");

        // Phi-move trampolines
        let stubs = std::mem::take(&mut self.stubs);
        for stub in stubs {
            self.w.label(&stub.label);
            self.emit_parallel_copies(&stub.copies);
            self.w.instr(format!("jmp {}", stub.target));
        }
        Ok(())
    }

    // =========================================================================
    // VALUE ACCESS
    // =========================================================================

    fn location(&self, reg: VReg) -> Result<Location> {
        if let Some(&over) = self.overrides.get(&reg.id) {
            return Ok(over);
        }
        self.alloc.location(reg).ok_or_else(|| {
            Error::internal(format!(
                "register v{} of {} has no location",
                reg.id, self.qualified
            ))
        })
    }

    /// Spills X/Y-resident operands of one instruction to their stash
    /// bytes so lowering can address them like any zero-page slot
    fn prep_operands(&mut self, instr: &Instruction) -> Result<()> {
        self.overrides.clear();
        for reg in instr.used_regs() {
            match self.alloc.location(reg) {
                Some(Location::RegX) => {
                    self.w.instr(format!("stx ${:02x}", X_STASH));
                    self.overrides.insert(reg.id, Location::Zp(X_STASH));
                }
                Some(Location::RegY) => {
                    self.w.instr(format!("sty ${:02x}", Y_STASH));
                    self.overrides.insert(reg.id, Location::Zp(Y_STASH));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Operand text for the low or high byte of a value
    fn byte_ref(&self, value: Value, hi: bool) -> Result<String> {
        match value {
            Value::Const(c) => {
                let v = c.masked();
                let byte = if hi { v >> 8 } else { v & 0xFF };
                Ok(format!("#${:02x}", byte))
            }
            Value::Reg(reg) => {
                if hi && reg.ty.size() == 1 {
                    return Ok("#$00".to_string());
                }
                match self.location(reg)? {
                    Location::Zp(base) => Ok(format!("${:02x}", base + hi as u8)),
                    Location::RegX | Location::RegY => Err(Error::internal(
                        "index-register operand used without a stash",
                    )),
                }
            }
            Value::Label(_) => Err(Error::internal("label used as a data operand")),
        }
    }

    /// Loads a value byte into A
    fn load_a(&mut self, value: Value, hi: bool) -> Result<()> {
        let operand = self.byte_ref(value, hi)?;
        self.w.instr(format!("lda {}", operand));
        Ok(())
    }

    /// Stores A into a register location
    fn store_a(&mut self, reg: VReg, hi: bool) {
        match self.alloc.location(reg) {
            Some(Location::RegX) => self.w.instr("tax"),
            Some(Location::RegY) => self.w.instr("tay"),
            Some(Location::Zp(base)) => {
                self.w.instr(format!("sta ${:02x}", base + hi as u8))
            }
            None => {}
        }
    }

    /// Stores a whole value into a result register
    fn store_value(&mut self, value: Value, dst: VReg) -> Result<()> {
        self.load_a(value, false)?;
        self.store_a(dst, false);
        if dst.ty.size() == 2 {
            self.load_a(value, true)?;
            self.store_a(dst, true);
        }
        Ok(())
    }

    // =========================================================================
    // INSTRUCTIONS
    // =========================================================================

    fn emit_instr(
        &mut self,
        block_id: BlockId,
        instr: &Instruction,
        next_block: Option<BlockId>,
    ) -> Result<()> {
        match &instr.op {
            Opcode::Phi => Ok(()), // lowered on the incoming edges

            Opcode::Const => {
                self.prep_operands(instr)?;
                let dst = self.result(instr)?;
                let value = instr.operands[0];
                if self.alloc.in_index_reg(dst) {
                    let imm = self.byte_ref(value, false)?;
                    match self.alloc.location(dst) {
                        Some(Location::RegX) => self.w.instr(format!("ldx {}", imm)),
                        _ => self.w.instr(format!("ldy {}", imm)),
                    }
                    return Ok(());
                }
                self.store_value(value, dst)
            }

            Opcode::LoadVar(name) => {
                let dst = self.result(instr)?;
                let global = self.global(name)?;
                if global.is_array() {
                    // Arrays referenced by name produce their address
                    let expr = global.at(0);
                    self.w.instr(format!("lda #<{}", expr));
                    self.store_a(dst, false);
                    self.w.instr(format!("lda #>{}", expr));
                    self.store_a(dst, true);
                    return Ok(());
                }
                self.w.instr(format!("lda {}", global.at(0)));
                self.store_a(dst, false);
                if dst.ty.size() == 2 {
                    self.w.instr(format!("lda {}", global.at(1)));
                    self.store_a(dst, true);
                }
                Ok(())
            }

            Opcode::StoreVar(name) => {
                self.prep_operands(instr)?;
                let global = self.global(name)?.clone();
                let value = instr.operands[0];
                self.load_a(value, false)?;
                self.w.instr(format!("sta {}", global.at(0)));
                if global.ty.size() == 2 {
                    self.load_a(value, true)?;
                    self.w.instr(format!("sta {}", global.at(1)));
                }
                Ok(())
            }

            Opcode::LoadArray(name) => {
                self.prep_operands(instr)?;
                let dst = self.result(instr)?;
                let global = self.global(name)?.clone();
                let index = instr.operands[0];
                self.emit_indexed_load(&global, 0, index, dst)
            }

            Opcode::StoreArray(name) => {
                self.prep_operands(instr)?;
                let global = self.global(name)?.clone();
                let index = instr.operands[0];
                let value = instr.operands[1];
                self.emit_indexed_store(&global, 0, index, value)
            }

            Opcode::MapLoadField | Opcode::MapStoreField => {
                self.prep_operands(instr)?;
                let mapped = instr
                    .meta
                    .mapped
                    .as_ref()
                    .ok_or_else(|| Error::internal("map access without structure"))?;
                let addr = mapped.base + mapped.offset;
                if instr.op == Opcode::MapLoadField {
                    let dst = self.result(instr)?;
                    self.w.instr(format!("lda ${:04x}", addr));
                    self.store_a(dst, false);
                    if dst.ty.size() == 2 {
                        self.w.instr(format!("lda ${:04x}", addr + 1));
                        self.store_a(dst, true);
                    }
                } else {
                    let value = instr.operands[0];
                    self.load_a(value, false)?;
                    self.w.instr(format!("sta ${:04x}", addr));
                    if value.ty().size() == 2 {
                        self.load_a(value, true)?;
                        self.w.instr(format!("sta ${:04x}", addr + 1));
                    }
                }
                Ok(())
            }

            Opcode::MapLoadRange | Opcode::MapStoreRange => {
                self.prep_operands(instr)?;
                let mapped = instr
                    .meta
                    .mapped
                    .as_ref()
                    .ok_or_else(|| Error::internal("map range without structure"))?
                    .clone();
                let fake = GlobalInfo {
                    label: String::new(),
                    addr: Some(mapped.base + mapped.offset),
                    ty: IlType::Byte,
                    size: mapped.range.unwrap_or(1),
                    storage: StorageClass::Map,
                    init: GlobalInit::Zeroed,
                };
                if instr.op == Opcode::MapLoadRange {
                    let dst = self.result(instr)?;
                    let index = instr.operands[0];
                    self.emit_indexed_load(&fake, 0, index, dst)
                } else {
                    let index = instr.operands[0];
                    let value = instr.operands[1];
                    self.emit_indexed_store(&fake, 0, index, value)
                }
            }

            Opcode::Add | Opcode::Sub => {
                self.prep_operands(instr)?;
                let dst = self.result(instr)?;
                let (l, r) = (instr.operands[0], instr.operands[1]);
                let (setup, op) = if instr.op == Opcode::Add {
                    ("clc", "adc")
                } else {
                    ("sec", "sbc")
                };
                self.w.instr(setup);
                self.load_a(l, false)?;
                let rhs = self.byte_ref(r, false)?;
                self.w.instr(format!("{} {}", op, rhs));
                self.store_a(dst, false);
                if dst.ty.size() == 2 {
                    self.load_a(l, true)?;
                    let rhs = self.byte_ref(r, true)?;
                    self.w.instr(format!("{} {}", op, rhs));
                    self.store_a(dst, true);
                }
                Ok(())
            }

            Opcode::And | Opcode::Or | Opcode::Xor => {
                self.prep_operands(instr)?;
                let dst = self.result(instr)?;
                let (l, r) = (instr.operands[0], instr.operands[1]);
                let mnemonic = match instr.op {
                    Opcode::And => "and",
                    Opcode::Or => "ora",
                    _ => "eor",
                };
                for hi in [false, true] {
                    if hi && dst.ty.size() == 1 {
                        break;
                    }
                    self.load_a(l, hi)?;
                    let rhs = self.byte_ref(r, hi)?;
                    self.w.instr(format!("{} {}", mnemonic, rhs));
                    self.store_a(dst, hi);
                }
                Ok(())
            }

            Opcode::LogicalAnd | Opcode::LogicalOr => {
                // Compact logical forms on 0/1 bytes
                self.prep_operands(instr)?;
                let dst = self.result(instr)?;
                let (l, r) = (instr.operands[0], instr.operands[1]);
                let mnemonic = if instr.op == Opcode::LogicalAnd {
                    "and"
                } else {
                    "ora"
                };
                self.load_a(l, false)?;
                let rhs = self.byte_ref(r, false)?;
                self.w.instr(format!("{} {}", mnemonic, rhs));
                self.store_a(dst, false);
                Ok(())
            }

            Opcode::Shl | Opcode::Shr => self.emit_shift(instr),

            Opcode::Neg => {
                self.prep_operands(instr)?;
                let dst = self.result(instr)?;
                let src = instr.operands[0];
                self.w.instr("sec");
                self.w.instr("lda #$00");
                let lo = self.byte_ref(src, false)?;
                self.w.instr(format!("sbc {}", lo));
                self.store_a(dst, false);
                if dst.ty.size() == 2 {
                    self.w.instr("lda #$00");
                    let hi = self.byte_ref(src, true)?;
                    self.w.instr(format!("sbc {}", hi));
                    self.store_a(dst, true);
                }
                Ok(())
            }

            Opcode::Not => {
                self.prep_operands(instr)?;
                let dst = self.result(instr)?;
                let src = instr.operands[0];
                for hi in [false, true] {
                    if hi && dst.ty.size() == 1 {
                        break;
                    }
                    self.load_a(src, hi)?;
                    self.w.instr("eor #$ff");
                    self.store_a(dst, hi);
                }
                Ok(())
            }

            Opcode::LogicalNot | Opcode::ByteToBool => {
                self.prep_operands(instr)?;
                let dst = self.result(instr)?;
                let src = instr.operands[0];
                let invert = instr.op == Opcode::LogicalNot;
                let set = self.w.local_label("ln");
                let done = self.w.local_label("ld");
                self.load_a(src, false)?;
                if src.ty().size() == 2 {
                    let hi = self.byte_ref(src, true)?;
                    self.w.instr(format!("ora {}", hi));
                }
                self.w.instr(format!("beq {}", set));
                self.w
                    .instr(format!("lda #${:02x}", if invert { 0 } else { 1 }));
                self.w.instr(format!("jmp {}", done));
                self.w.label(&set);
                self.w
                    .instr(format!("lda #${:02x}", if invert { 1 } else { 0 }));
                self.w.label(&done);
                self.store_a(dst, false);
                Ok(())
            }

            Opcode::ZeroExtend => {
                self.prep_operands(instr)?;
                let dst = self.result(instr)?;
                let src = instr.operands[0];
                self.load_a(src, false)?;
                self.store_a(dst, false);
                self.w.instr("lda #$00");
                self.store_a(dst, true);
                Ok(())
            }

            Opcode::Truncate | Opcode::BoolToByte | Opcode::Lo => {
                self.prep_operands(instr)?;
                let dst = self.result(instr)?;
                let src = instr.operands[0];
                self.load_a(src, false)?;
                self.store_a(dst, false);
                Ok(())
            }

            Opcode::Hi => {
                self.prep_operands(instr)?;
                let dst = self.result(instr)?;
                let src = instr.operands[0];
                self.load_a(src, true)?;
                self.store_a(dst, false);
                Ok(())
            }

            Opcode::CmpEq
            | Opcode::CmpNe
            | Opcode::CmpLt
            | Opcode::CmpLe
            | Opcode::CmpGt
            | Opcode::CmpGe => {
                self.prep_operands(instr)?;
                self.emit_compare(instr)
            }

            Opcode::Mul | Opcode::Div | Opcode::Mod => self.emit_muldiv(instr),

            Opcode::Jump => {
                let target = instr.blocks[0];
                let copies = self.phi_copies(block_id, target)?;
                self.emit_parallel_copies(&copies);
                // Fall-through preferred when the target is next
                if next_block != Some(target) {
                    self.w
                        .instr(format!("jmp {}", asm::block_label(&self.qualified, target.0)));
                }
                Ok(())
            }

            Opcode::Branch => {
                self.prep_operands(instr)?;
                let cond = instr.operands[0];
                let then_label = self.edge_label(block_id, instr.blocks[0])?;
                let else_label = self.edge_label(block_id, instr.blocks[1])?;
                match cond {
                    Value::Const(c) => {
                        let target = if c.masked() != 0 { then_label } else { else_label };
                        self.w.instr(format!("jmp {}", target));
                    }
                    _ => {
                        let taken = self.w.local_label("bt");
                        self.load_a(cond, false)?;
                        self.w.instr(format!("bne {}", taken));
                        self.w.instr(format!("jmp {}", else_label));
                        self.w.label(&taken);
                        self.w.instr(format!("jmp {}", then_label));
                    }
                }
                Ok(())
            }

            Opcode::Return => {
                self.prep_operands(instr)?;
                let value = instr.operands[0];
                if value.ty().size() == 2 {
                    let hi = self.byte_ref(value, true)?;
                    self.w.instr(format!("ldx {}", hi));
                }
                self.load_a(value, false)?;
                self.w
                    .instr(format!("jmp {}", asm::exit_label(&self.qualified)));
                Ok(())
            }

            Opcode::ReturnVoid => {
                self.w
                    .instr(format!("jmp {}", asm::exit_label(&self.qualified)));
                Ok(())
            }

            Opcode::Call(name) | Opcode::CallVoid(name) => {
                self.prep_operands(instr)?;
                let sig = self
                    .fns
                    .get(name)
                    .ok_or_else(|| Error::internal(format!("call to unknown function '{}'", name)))?
                    .clone();
                for (index, (&arg, &ty)) in
                    instr.operands.iter().zip(sig.params.iter()).enumerate()
                {
                    let slot = asm::param_label(name, index);
                    self.load_a(arg, false)?;
                    self.w.instr(format!("sta {}", slot));
                    if ty.size() == 2 {
                        self.load_a(arg, true)?;
                        self.w.instr(format!("sta {}+1", slot));
                    }
                }
                self.w.instr(format!("jsr {}", sig.label));
                if let Some(dst) = instr.result {
                    self.store_a(dst, false);
                    if dst.ty.size() == 2 {
                        self.w.instr(format!("stx ${:02x}", self.zp_of(dst)? + 1));
                    }
                }
                Ok(())
            }

            Opcode::CallIndirect => {
                self.prep_operands(instr)?;
                let target = instr.operands[0];
                for (index, &arg) in instr.operands.iter().skip(1).enumerate() {
                    let slot = format!("__icall_p{}", index);
                    self.load_a(arg, false)?;
                    self.w.instr(format!("sta {}", slot));
                    self.load_a(arg, true)?;
                    self.w.instr(format!("sta {}+1", slot));
                }
                self.load_a(target, false)?;
                self.w.instr("sta __icall_vec+1");
                self.load_a(target, true)?;
                self.w.instr("sta __icall_vec+2");
                self.w.instr("jsr __icall_vec");
                if let Some(dst) = instr.result {
                    self.store_a(dst, false);
                    if dst.ty.size() == 2 {
                        self.w.instr(format!("stx ${:02x}", self.zp_of(dst)? + 1));
                    }
                }
                Ok(())
            }

            Opcode::FuncAddr(name) => {
                let dst = self.result(instr)?;
                let thunk = asm::thunk_label(name);
                self.w.instr(format!("lda #<{}", thunk));
                self.store_a(dst, false);
                self.w.instr(format!("lda #>{}", thunk));
                self.store_a(dst, true);
                Ok(())
            }

            Opcode::Peek | Opcode::VolatileRead => {
                self.prep_operands(instr)?;
                let dst = self.result(instr)?;
                let addr = instr.operands[0];
                let comment = if instr.op == Opcode::VolatileRead {
                    Some("volatile - do not merge")
                } else {
                    None
                };
                self.emit_memory_read(addr, 0, comment)?;
                self.store_a(dst, false);
                Ok(())
            }

            Opcode::Peekw => {
                self.prep_operands(instr)?;
                let dst = self.result(instr)?;
                let addr = instr.operands[0];
                self.emit_memory_read(addr, 0, None)?;
                self.store_a(dst, false);
                self.emit_memory_read(addr, 1, None)?;
                self.store_a(dst, true);
                Ok(())
            }

            Opcode::Poke | Opcode::VolatileWrite => {
                self.prep_operands(instr)?;
                let addr = instr.operands[0];
                let value = instr.operands[1];
                let comment = if instr.op == Opcode::VolatileWrite {
                    Some("volatile - do not merge")
                } else {
                    None
                };
                self.emit_memory_write(addr, 0, value, false, comment)
            }

            Opcode::Pokew => {
                self.prep_operands(instr)?;
                let addr = instr.operands[0];
                let value = instr.operands[1];
                self.emit_memory_write(addr, 0, value, false, None)?;
                self.emit_memory_write(addr, 1, value, true, None)
            }

            Opcode::Pha => self.simple("pha"),
            Opcode::Pla => self.simple("pla"),
            Opcode::Php => self.simple("php"),
            Opcode::Plp => self.simple("plp"),
            Opcode::Sei => self.simple("sei"),
            Opcode::Cli => self.simple("cli"),
            Opcode::NopOp => self.simple("nop"),
            Opcode::Brk => self.simple("brk"),

            Opcode::Barrier => {
                self.w.comment("--- barrier ---");
                Ok(())
            }

            Opcode::InlineAsm(text) => {
                for line in text.lines() {
                    self.w.raw(line.to_string());
                }
                Ok(())
            }
        }
    }

    fn simple(&mut self, mnemonic: &str) -> Result<()> {
        self.w.instr(mnemonic);
        Ok(())
    }

    fn result(&self, instr: &Instruction) -> Result<VReg> {
        instr
            .result
            .ok_or_else(|| Error::internal(format!("{} without a result", instr.op.name())))
    }

    /// The returned reference borrows the batch environment, not the
    /// emitter, so lowering can keep writing while holding it
    fn global(&self, name: &str) -> Result<&'a GlobalInfo> {
        self.env
            .get(name)
            .ok_or_else(|| Error::internal(format!("unknown global '{}'", name)))
    }

    fn zp_of(&self, reg: VReg) -> Result<u8> {
        match self.alloc.location(reg) {
            Some(Location::Zp(base)) => Ok(base),
            _ => Err(Error::internal(
                "word result must live in a zero-page slot",
            )),
        }
    }

    // =========================================================================
    // MEMORY AND INDEXING
    // =========================================================================

    /// Reads `(addr + offset)` into A; constant addresses use absolute
    /// addressing, computed ones go through the zero-page pointer
    fn emit_memory_read(&mut self, addr: Value, offset: u16, comment: Option<&str>) -> Result<()> {
        match addr {
            Value::Const(c) => {
                let text = format!("lda ${:04x}", c.masked() + offset);
                match comment {
                    Some(comment) => self.w.instr_commented(text, comment),
                    None => self.w.instr(text),
                }
            }
            _ => {
                self.load_ptr_scratch(addr)?;
                self.w.instr(format!("ldy #${:02x}", offset));
                let text = format!("lda (${:02x}),y", PTR_SCRATCH);
                match comment {
                    Some(comment) => self.w.instr_commented(text, comment),
                    None => self.w.instr(text),
                }
            }
        }
        Ok(())
    }

    /// Writes a value byte to `(addr + offset)`
    fn emit_memory_write(
        &mut self,
        addr: Value,
        offset: u16,
        value: Value,
        value_hi: bool,
        comment: Option<&str>,
    ) -> Result<()> {
        match addr {
            Value::Const(c) => {
                self.load_a(value, value_hi)?;
                let text = format!("sta ${:04x}", c.masked() + offset);
                match comment {
                    Some(comment) => self.w.instr_commented(text, comment),
                    None => self.w.instr(text),
                }
            }
            _ => {
                self.load_ptr_scratch(addr)?;
                self.w.instr(format!("ldy #${:02x}", offset));
                self.load_a(value, value_hi)?;
                let text = format!("sta (${:02x}),y", PTR_SCRATCH);
                match comment {
                    Some(comment) => self.w.instr_commented(text, comment),
                    None => self.w.instr(text),
                }
            }
        }
        Ok(())
    }

    fn load_ptr_scratch(&mut self, addr: Value) -> Result<()> {
        self.load_a(addr, false)?;
        self.w.instr(format!("sta ${:02x}", PTR_SCRATCH));
        self.load_a(addr, true)?;
        self.w.instr(format!("sta ${:02x}", PTR_SCRATCH + 1));
        Ok(())
    }

    /// `dst = global[index]`, picking the best addressing mode
    fn emit_indexed_load(
        &mut self,
        global: &GlobalInfo,
        base_offset: u32,
        index: Value,
        dst: VReg,
    ) -> Result<()> {
        let elem = dst.ty.size().max(1);
        match index {
            Value::Const(c) => {
                let offset = base_offset + c.masked() as u32 * elem;
                self.w.instr(format!("lda {}", global.at(offset)));
                self.store_a(dst, false);
                if elem == 2 {
                    self.w.instr(format!("lda {}", global.at(offset + 1)));
                    self.store_a(dst, true);
                }
            }
            Value::Reg(reg) if self.alloc.location(reg) == Some(Location::RegX) && elem == 1 => {
                // The index already sits in X
                self.w.instr(format!("lda {},x", global.at(base_offset)));
                self.store_a(dst, false);
            }
            _ => {
                if elem == 1 {
                    let idx = self.byte_ref(index, false)?;
                    self.w.instr(format!("ldy {}", idx));
                    self.w.instr(format!("lda {},y", global.at(base_offset)));
                    self.store_a(dst, false);
                } else {
                    // Word elements: scale the index by two first
                    self.load_a(index, false)?;
                    self.w.instr("asl");
                    self.w.instr("tay");
                    self.w.instr(format!("lda {},y", global.at(base_offset)));
                    self.store_a(dst, false);
                    self.w.instr("iny");
                    self.w.instr(format!("lda {},y", global.at(base_offset)));
                    self.store_a(dst, true);
                }
            }
        }
        Ok(())
    }

    /// `global[index] = value`
    fn emit_indexed_store(
        &mut self,
        global: &GlobalInfo,
        base_offset: u32,
        index: Value,
        value: Value,
    ) -> Result<()> {
        let elem = value.ty().size().max(1);
        match index {
            Value::Const(c) => {
                let offset = base_offset + c.masked() as u32 * elem;
                self.load_a(value, false)?;
                self.w.instr(format!("sta {}", global.at(offset)));
                if elem == 2 {
                    self.load_a(value, true)?;
                    self.w.instr(format!("sta {}", global.at(offset + 1)));
                }
            }
            Value::Reg(reg) if self.alloc.location(reg) == Some(Location::RegX) && elem == 1 => {
                self.load_a(value, false)?;
                self.w.instr(format!("sta {},x", global.at(base_offset)));
            }
            _ => {
                if elem == 1 {
                    let idx = self.byte_ref(index, false)?;
                    self.w.instr(format!("ldy {}", idx));
                    self.load_a(value, false)?;
                    self.w.instr(format!("sta {},y", global.at(base_offset)));
                } else {
                    self.load_a(index, false)?;
                    self.w.instr("asl");
                    self.w.instr("tay");
                    self.load_a(value, false)?;
                    self.w.instr(format!("sta {},y", global.at(base_offset)));
                    self.w.instr("iny");
                    self.load_a(value, true)?;
                    self.w.instr(format!("sta {},y", global.at(base_offset)));
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // ARITHMETIC HELPERS
    // =========================================================================

    fn emit_shift(&mut self, instr: &Instruction) -> Result<()> {
        self.prep_operands(instr)?;
        let dst = self.result(instr)?;
        let (src, count) = (instr.operands[0], instr.operands[1]);
        let left = instr.op == Opcode::Shl;
        let word = dst.ty.size() == 2;

        // Shift in place on the destination slot
        self.store_value(src, dst)?;
        let base = self.zp_of(dst)?;
        let one_shift = |w: &mut AsmWriter| {
            if word {
                if left {
                    w.instr(format!("asl ${:02x}", base));
                    w.instr(format!("rol ${:02x}", base + 1));
                } else {
                    w.instr(format!("lsr ${:02x}", base + 1));
                    w.instr(format!("ror ${:02x}", base));
                }
            } else if left {
                w.instr(format!("asl ${:02x}", base));
            } else {
                w.instr(format!("lsr ${:02x}", base));
            }
        };

        match count {
            Value::Const(c) => {
                for _ in 0..(c.masked() & 0x0F) {
                    one_shift(self.w);
                }
            }
            _ => {
                let loop_label = self.w.local_label("sh");
                let done = self.w.local_label("sd");
                let counter = self.byte_ref(count, false)?;
                self.w.instr(format!("ldy {}", counter));
                self.w.instr(format!("beq {}", done));
                self.w.label(&loop_label);
                one_shift(self.w);
                self.w.instr("dey");
                self.w.instr(format!("bne {}", loop_label));
                self.w.label(&done);
            }
        }
        Ok(())
    }

    fn emit_muldiv(&mut self, instr: &Instruction) -> Result<()> {
        self.prep_operands(instr)?;
        let dst = self.result(instr)?;
        let (l, r) = (instr.operands[0], instr.operands[1]);

        // Arguments arrive zero-extended in the helper slots
        for (value, slot) in [(l, HELPER_BASE), (r, HELPER_BASE + 2)] {
            self.load_a(value, false)?;
            self.w.instr(format!("sta ${:02x}", slot));
            self.load_a(value, true)?;
            self.w.instr(format!("sta ${:02x}", slot + 1));
        }
        match instr.op {
            Opcode::Mul => self.w.instr("jsr __mul16"),
            _ => self.w.instr("jsr __div16"),
        }
        let result_base = if instr.op == Opcode::Mod {
            HELPER_BASE + 4
        } else {
            HELPER_BASE
        };
        self.w.instr(format!("lda ${:02x}", result_base));
        self.store_a(dst, false);
        if dst.ty.size() == 2 {
            self.w.instr(format!("lda ${:02x}", result_base + 1));
            self.store_a(dst, true);
        }
        Ok(())
    }

    /// Unfused comparison producing 0/1: branches exit to the `no` path,
    /// fall-through means true, and an optional final `eor #$01` realizes
    /// the negated forms
    fn emit_compare(&mut self, instr: &Instruction) -> Result<()> {
        let dst = self.result(instr)?;
        let (l, r) = (instr.operands[0], instr.operands[1]);
        let word = l.ty().size() == 2 || r.ty().size() == 2;

        let yes = self.w.local_label("cy");
        let no = self.w.local_label("cn");
        let done = self.w.local_label("cd");

        if !word {
            self.load_a(l, false)?;
            let rhs = self.byte_ref(r, false)?;
            self.w.instr(format!("cmp {}", rhs));
            match instr.op {
                Opcode::CmpEq => self.w.instr(format!("bne {}", no)),
                Opcode::CmpNe => self.w.instr(format!("beq {}", no)),
                Opcode::CmpLt => self.w.instr(format!("bcs {}", no)),
                Opcode::CmpGe => self.w.instr(format!("bcc {}", no)),
                Opcode::CmpLe => {
                    self.w.instr(format!("beq {}", yes));
                    self.w.instr(format!("bcs {}", no));
                }
                Opcode::CmpGt => {
                    self.w.instr(format!("beq {}", no));
                    self.w.instr(format!("bcc {}", no));
                }
                _ => unreachable!(),
            }
        } else {
            match instr.op {
                Opcode::CmpEq | Opcode::CmpNe => {
                    // Equality core; CmpNe inverts at the end
                    self.load_a(l, false)?;
                    let rlo = self.byte_ref(r, false)?;
                    self.w.instr(format!("cmp {}", rlo));
                    self.w.instr(format!("bne {}", no));
                    self.load_a(l, true)?;
                    let rhi = self.byte_ref(r, true)?;
                    self.w.instr(format!("cmp {}", rhi));
                    self.w.instr(format!("bne {}", no));
                }
                Opcode::CmpLt | Opcode::CmpGe | Opcode::CmpGt | Opcode::CmpLe => {
                    // Less-than core; Gt/Le swap operands, Ge/Le invert
                    let (a, b) = match instr.op {
                        Opcode::CmpLt | Opcode::CmpGe => (l, r),
                        _ => (r, l),
                    };
                    self.load_a(a, true)?;
                    let bhi = self.byte_ref(b, true)?;
                    self.w.instr(format!("cmp {}", bhi));
                    self.w.instr(format!("bcc {}", yes));
                    self.w.instr(format!("bne {}", no));
                    self.load_a(a, false)?;
                    let blo = self.byte_ref(b, false)?;
                    self.w.instr(format!("cmp {}", blo));
                    self.w.instr(format!("bcs {}", no));
                }
                _ => unreachable!(),
            }
        }

        self.w.label(&yes);
        self.w.instr("lda #$01");
        self.w.instr(format!("jmp {}", done));
        self.w.label(&no);
        self.w.instr("lda #$00");
        self.w.label(&done);

        // Negated forms flip the computed core
        let negate = word
            && matches!(instr.op, Opcode::CmpNe | Opcode::CmpGe | Opcode::CmpLe);
        if negate {
            self.w.instr("eor #$01");
        }
        self.store_a(dst, false);
        Ok(())
    }

    // =========================================================================
    // CONTROL FLOW
    // =========================================================================

    fn can_fuse(&self, cmp: &Instruction, branch: &Instruction) -> bool {
        if branch.op != Opcode::Branch {
            return false;
        }
        let Some(result) = cmp.result else { return false };
        if branch.operands.first().and_then(|v| v.as_reg()) != Some(result) {
            return false;
        }
        if self.uses.get(&result.id).copied().unwrap_or(0) != 1 {
            return false;
        }
        matches!(
            cmp.op,
            Opcode::CmpEq
                | Opcode::CmpNe
                | Opcode::CmpLt
                | Opcode::CmpLe
                | Opcode::CmpGt
                | Opcode::CmpGe
        ) && cmp.operands.iter().all(|v| v.ty().size() == 1)
    }

    /// Compare + conditional branch in one sequence
    fn emit_fused_branch(
        &mut self,
        block_id: BlockId,
        cmp: &Instruction,
        branch: &Instruction,
        _next: Option<BlockId>,
    ) -> Result<()> {
        self.prep_operands(cmp)?;
        let (l, r) = (cmp.operands[0], cmp.operands[1]);
        let then_label = self.edge_label(block_id, branch.blocks[0])?;
        let else_label = self.edge_label(block_id, branch.blocks[1])?;

        self.load_a(l, false)?;
        let rhs = self.byte_ref(r, false)?;
        self.w.instr(format!("cmp {}", rhs));

        let taken = self.w.local_label("ft");
        match cmp.op {
            Opcode::CmpEq => self.w.instr(format!("beq {}", taken)),
            Opcode::CmpNe => self.w.instr(format!("bne {}", taken)),
            Opcode::CmpLt => self.w.instr(format!("bcc {}", taken)),
            Opcode::CmpGe => self.w.instr(format!("bcs {}", taken)),
            Opcode::CmpLe => {
                self.w.instr(format!("bcc {}", taken));
                self.w.instr(format!("beq {}", taken));
            }
            Opcode::CmpGt => {
                let skip = self.w.local_label("fs");
                self.w.instr(format!("beq {}", skip));
                self.w.instr(format!("bcs {}", taken));
                self.w.label(&skip);
            }
            _ => unreachable!(),
        }
        self.w.instr(format!("jmp {}", else_label));
        self.w.label(&taken);
        self.w.instr(format!("jmp {}", then_label));
        Ok(())
    }

    /// Label to jump to for an edge; edges into blocks with phis get a
    /// trampoline carrying the parallel copies
    fn edge_label(&mut self, from: BlockId, to: BlockId) -> Result<String> {
        let copies = self.phi_copies(from, to)?;
        if copies.is_empty() {
            return Ok(asm::block_label(&self.qualified, to.0));
        }
        let label = format!(
            "{}__e{}_{}",
            asm::function_label(&self.qualified),
            from.0,
            to.0
        );
        if !self.stubs.iter().any(|s| s.label == label) {
            self.stubs.push(EdgeStub {
                label: label.clone(),
                copies,
                target: asm::block_label(&self.qualified, to.0),
            });
        }
        Ok(label)
    }

    /// Moves required by the phis of `to` along the edge `from -> to`
    fn phi_copies(
        &self,
        from: BlockId,
        to: BlockId,
    ) -> Result<Vec<(Location, IlType, Value)>> {
        let mut copies = Vec::new();
        for phi in self.func.block(to).phis() {
            let Some(result) = phi.result else { continue };
            let Some(slot) = phi.blocks.iter().position(|&p| p == from) else {
                continue;
            };
            let value = phi.operands[slot];
            let dst = self.alloc.location(result).ok_or_else(|| {
                Error::internal(format!("phi result v{} has no location", result.id))
            })?;
            // Skip no-op moves
            if value.as_reg().map(|r| self.alloc.location(r)) == Some(Some(dst)) {
                continue;
            }
            copies.push((dst, result.ty, value));
        }
        Ok(copies)
    }

    /// Emits a set of parallel copies, ordering reads before overwrites
    /// and breaking cycles through the pointer scratch
    fn emit_parallel_copies(&mut self, copies: &[(Location, IlType, Value)]) {
        // Synthetic register id standing for "the parked cycle value"
        const PARKED: u32 = u32::MAX;

        let mut pending: Vec<(Location, IlType, Value)> = copies.to_vec();

        fn reads_loc(
            value: &Value,
            loc: Location,
            alloc: &Allocation,
            overrides: &HashMap<u32, Location>,
        ) -> bool {
            match value {
                Value::Reg(reg) => overrides
                    .get(&reg.id)
                    .copied()
                    .or_else(|| alloc.location(*reg))
                    == Some(loc),
                _ => false,
            }
        }

        while !pending.is_empty() {
            // Emit a copy whose destination nobody still reads
            let safe = pending.iter().position(|(dst, _, _)| {
                !pending
                    .iter()
                    .any(|(_, _, src)| reads_loc(src, *dst, &self.alloc, &self.overrides))
            });
            match safe {
                Some(index) => {
                    let (dst, ty, value) = pending.remove(index);
                    self.emit_copy(dst, ty, value);
                }
                None => {
                    // Cycle: park the value currently held in the first
                    // destination, then redirect its readers to the park
                    let (dst, ty, _) = pending[0];
                    let stash = Location::Zp(PTR_SCRATCH);
                    self.overrides.insert(PARKED - 1, dst);
                    let current = Value::Reg(VReg::new(PARKED - 1, ty));
                    self.emit_copy(stash, ty, current);
                    self.overrides.remove(&(PARKED - 1));
                    self.overrides.insert(PARKED, stash);
                    for (_, sty, src) in pending.iter_mut().skip(1) {
                        if reads_loc(src, dst, &self.alloc, &self.overrides) {
                            *src = Value::Reg(VReg::new(PARKED, *sty));
                        }
                    }
                    // The first destination is now safe to overwrite
                    let (dst, ty, value) = pending.remove(0);
                    self.emit_copy(dst, ty, value);
                }
            }
        }
        self.overrides.remove(&u32::MAX);
    }

    /// One copy into a register location; index-register sources are
    /// staged through their stash byte first
    fn emit_copy(&mut self, dst: Location, ty: IlType, value: Value) {
        if let Value::Reg(reg) = value {
            if !self.overrides.contains_key(&reg.id) {
                match self.alloc.location(reg) {
                    Some(Location::RegX) => {
                        self.w.instr(format!("stx ${:02x}", X_STASH));
                        self.overrides.insert(reg.id, Location::Zp(X_STASH));
                    }
                    Some(Location::RegY) => {
                        self.w.instr(format!("sty ${:02x}", Y_STASH));
                        self.overrides.insert(reg.id, Location::Zp(Y_STASH));
                    }
                    _ => {}
                }
            }
        }
        let lo = self
            .byte_ref(value, false)
            .unwrap_or_else(|_| "#$00".to_string());
        match dst {
            Location::RegX => {
                self.w.instr(format!("ldx {}", lo));
            }
            Location::RegY => {
                self.w.instr(format!("ldy {}", lo));
            }
            Location::Zp(base) => {
                self.w.instr(format!("lda {}", lo));
                self.w.instr(format!("sta ${:02x}", base));
                if ty.size() == 2 {
                    let hi = self
                        .byte_ref(value, true)
                        .unwrap_or_else(|_| "#$00".to_string());
                    self.w.instr(format!("lda {}", hi));
                    self.w.instr(format!("sta ${:02x}", base + 1));
                }
            }
        }
    }
}

// =============================================================================
// RUNTIME SUPPORT
// =============================================================================

/// Thunk for indirect calls: copy the shared argument area into the
/// function's own parameter slots, then fall into the function
fn emit_thunk(w: &mut AsmWriter, qualified: &str, params: &[IlType]) {
    w.label(&asm::thunk_label(qualified));
    for (index, ty) in params.iter().enumerate() {
        let shared = format!("__icall_p{}", index);
        let slot = asm::param_label(qualified, index);
        w.instr(format!("lda {}", shared));
        w.instr(format!("sta {}", slot));
        if ty.size() == 2 {
            w.instr(format!("lda {}+1", shared));
            w.instr(format!("sta {}+1", slot));
        }
    }
    w.instr(format!("jmp {}", asm::function_label(qualified)));
}

/// 16x16 software multiply: $8A/$8B * $8C/$8D -> $8A/$8B
fn emit_mul16(w: &mut AsmWriter) {
    w.comment("16-bit shift-add multiply");
    w.label("__mul16");
    w.instr("lda #$00");
    w.instr("sta $8e");
    w.instr("sta $8f");
    w.instr("ldx #$10");
    w.label("__mul16_loop");
    w.instr("lsr $8d");
    w.instr("ror $8c");
    w.instr("bcc __mul16_skip");
    w.instr("clc");
    w.instr("lda $8e");
    w.instr("adc $8a");
    w.instr("sta $8e");
    w.instr("lda $8f");
    w.instr("adc $8b");
    w.instr("sta $8f");
    w.label("__mul16_skip");
    w.instr("asl $8a");
    w.instr("rol $8b");
    w.instr("dex");
    w.instr("bne __mul16_loop");
    w.instr("lda $8e");
    w.instr("sta $8a");
    w.instr("lda $8f");
    w.instr("sta $8b");
    w.instr("rts");
    w.blank();
}

/// 16/16 restoring divide: $8A/$8B / $8C/$8D -> quotient $8A/$8B,
/// remainder $8E/$8F
fn emit_div16(w: &mut AsmWriter) {
    w.comment("16-bit restoring divide");
    w.label("__div16");
    w.instr("lda #$00");
    w.instr("sta $8e");
    w.instr("sta $8f");
    w.instr("ldx #$10");
    w.label("__div16_loop");
    w.instr("asl $8a");
    w.instr("rol $8b");
    w.instr("rol $8e");
    w.instr("rol $8f");
    w.instr("lda $8e");
    w.instr("sec");
    w.instr("sbc $8c");
    w.instr("tay");
    w.instr("lda $8f");
    w.instr("sbc $8d");
    w.instr("bcc __div16_skip");
    w.instr("sta $8f");
    w.instr("sty $8e");
    w.instr("inc $8a");
    w.label("__div16_skip");
    w.instr("dex");
    w.instr("bne __div16_loop");
    w.instr("rts");
    w.blank();
}

/// Startup copies for zero-page/RAM globals with constant initializers
fn emit_static_init(w: &mut AsmWriter, env: &HashMap<String, GlobalInfo>) {
    w.comment("static initializers (zero page / RAM)");
    w.label("__static_init");
    let mut names: Vec<&String> = env.keys().collect();
    names.sort();
    for name in names {
        let global = &env[name];
        if !matches!(global.storage, StorageClass::ZeroPage | StorageClass::Ram) {
            continue;
        }
        let (Some(addr), GlobalInit::Bytes(bytes)) = (global.addr, &global.init) else {
            continue;
        };
        w.comment(name);
        for (offset, byte) in bytes.iter().enumerate() {
            w.instr(format!("lda #${:02x}", byte));
            w.instr(format!("sta ${:04x}", addr + offset as u32));
        }
    }
    w.instr("rts");
    w.blank();
}

/// Equates, parameter slots, bss labels, and the read-only data section
fn emit_globals(
    w: &mut AsmWriter,
    env: &HashMap<String, GlobalInfo>,
    fns: &HashMap<String, FnSig>,
    uses_icall: bool,
) {
    // Address equates for placed zero-page/RAM/map symbols
    w.comment("symbol addresses");
    let mut names: Vec<&String> = env.keys().collect();
    names.sort();
    for name in &names {
        let global = &env[*name];
        if let (Some(addr), true) = (
            global.addr,
            !matches!(global.storage, StorageClass::Data),
        ) {
            w.raw(format!("{} = ${:04x}", global.label, addr));
        }
    }
    w.blank();

    // Parameter slots and the shared indirect-call area live after the
    // code
    w.comment("call frames");
    let mut fn_names: Vec<&String> = fns.keys().collect();
    fn_names.sort();
    for name in fn_names {
        let sig = &fns[name];
        for (index, ty) in sig.params.iter().enumerate() {
            w.label(&asm::param_label(name, index));
            w.raw(format!("    !fill {}, 0", ty.size().max(1)));
        }
    }
    if uses_icall {
        for index in 0..4 {
            w.label(&format!("__icall_p{}", index));
            w.raw("    !fill 2, 0");
        }
    }

    // Unplaced storage (local arrays)
    let mut unplaced: Vec<&String> = names
        .iter()
        .copied()
        .filter(|n| env[*n].addr.is_none())
        .collect();
    unplaced.sort();
    if !unplaced.is_empty() {
        w.blank();
        w.comment("function-local static storage");
        for name in unplaced {
            let global = &env[name];
            w.label(&global.label);
            match &global.init {
                GlobalInit::Bytes(bytes) => emit_byte_rows(w, bytes),
                GlobalInit::Zeroed => w.raw(format!("    !fill {}, 0", global.size.max(1))),
            }
        }
    }

    // Read-only data region at its layout addresses
    let mut data: Vec<&GlobalInfo> = env
        .values()
        .filter(|g| matches!(g.storage, StorageClass::Data) && g.addr.is_some())
        .collect();
    data.sort_by_key(|g| g.addr);
    if !data.is_empty() {
        w.blank();
        w.comment("read-only data");
        w.raw(format!("* = ${:04x}", data[0].addr.unwrap()));
        for global in data {
            w.label(&global.label);
            match &global.init {
                GlobalInit::Bytes(bytes) => emit_byte_rows(w, bytes),
                GlobalInit::Zeroed => w.raw(format!("    !fill {}, 0", global.size.max(1))),
            }
        }
    }

}

fn emit_byte_rows(w: &mut AsmWriter, bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    for chunk in bytes.chunks(16) {
        let row: Vec<String> = chunk.iter().map(|b| format!("${:02x}", b)).collect();
        w.raw(format!("    !byte {}", row.join(", ")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticBag;
    use crate::ir::IlGenerator;
    use crate::optimizer::Optimizer;
    use crate::sema::analyze_sources;
    use crate::ssa::SsaConstructor;

    fn compile_to_asm(source: &str, exit: ExitBehavior) -> String {
        let analysis = analyze_sources(&[("t.bl65", source)]);
        assert!(
            !analysis.has_errors(),
            "analysis failed: {:?}",
            analysis.diags.diagnostics()
        );
        let mut modules = IlGenerator::new(&analysis).generate().unwrap();
        SsaConstructor::run(&mut modules).unwrap();
        let mut diags = DiagnosticBag::new();
        Optimizer::new(2).optimize(&mut modules, &mut diags).unwrap();
        let output = CodeGenerator::new(CodegenOptions {
            exit_behavior: exit,
            debug: true,
        })
        .generate(&modules)
        .unwrap();
        output.assembly
    }

    #[test]
    fn test_program_shell() {
        let asm = compile_to_asm(
            "export function main()\n  poke($d020, 0)\nend function\n",
            ExitBehavior::Loop,
        );
        assert!(asm.contains("* = $0801"));
        assert!(asm.contains("!cpu 6510"));
        assert!(asm.contains("jsr f_global_main"));
        assert!(asm.contains("jmp __exit_loop"));
        assert!(asm.contains("sta $d020"));
    }

    #[test]
    fn test_exit_behaviors() {
        let basic = compile_to_asm(
            "export function main()\n  nop()\nend function\n",
            ExitBehavior::Basic,
        );
        assert!(basic.contains("jmp $a474"));

        let reset = compile_to_asm(
            "export function main()\n  nop()\nend function\n",
            ExitBehavior::Reset,
        );
        assert!(reset.contains("jmp $fce2"));
    }

    #[test]
    fn test_data_array_bytes() {
        let asm = compile_to_asm(
            "let colors: byte[] @data = [2, 5, 6]\nexport function main()\n  poke($d020, colors[0])\nend function\n",
            ExitBehavior::Loop,
        );
        assert!(asm.contains("!byte $02, $05, $06"), "{}", asm);
    }

    #[test]
    fn test_map_field_absolute_addressing() {
        let asm = compile_to_asm(
            "@map vic at $d000\n  border: byte at $20\nend map\nexport function main()\n  vic.border = 7\nend function\n",
            ExitBehavior::Loop,
        );
        assert!(asm.contains("sta $d020"), "{}", asm);
    }

    #[test]
    fn test_barrier_comment_between_stores() {
        let asm = compile_to_asm(
            "@map vic at $d000\n  border: byte at $20\nend map\nexport function main()\n  vic.border = 0\n  barrier()\n  vic.border = 1\nend function\n",
            ExitBehavior::Loop,
        );
        let first = asm.find("sta $d020").unwrap();
        let barrier = asm.find("--- barrier ---").unwrap();
        let second = asm.rfind("sta $d020").unwrap();
        assert!(first < barrier && barrier < second, "{}", asm);
    }

    #[test]
    fn test_cpu_intrinsics_one_to_one() {
        let asm = compile_to_asm(
            "export function main()\n  sei()\n  pha()\n  pla()\n  cli()\nend function\n",
            ExitBehavior::Loop,
        );
        for mnemonic in ["sei", "pha", "pla", "cli"] {
            assert!(asm.contains(&format!("    {}", mnemonic)), "{}", asm);
        }
    }
}
