//! Instruction builder
//!
//! A thin layer over [`IlFunction`] holding the current insertion block and
//! the running loop context. Emitting a terminator wires the CFG edges; an
//! already-terminated block silently drops further instructions (the
//! generator skips statements after a terminator anyway).

use super::function::IlFunction;
use super::instruction::{InstrId, InstrMeta, Instruction, Opcode};
use super::value::{BlockId, Constant, IlType, Value, VReg};
use crate::source::SourceLocation;

/// Builder for one function's IL
pub struct FunctionBuilder {
    /// The function under construction
    pub func: IlFunction,
    /// Current insertion block
    pub current: BlockId,
    /// Loop nesting depth stamped onto emitted metadata
    pub loop_depth: u32,
    /// Expression nesting depth; doubles as a register-pressure estimate
    pub expr_depth: u32,
    /// Source span stamped onto emitted metadata
    pub current_loc: Option<SourceLocation>,
}

impl FunctionBuilder {
    /// Starts building a function; insertion begins at the entry block
    pub fn new(module: &str, name: &str, ret: IlType, exported: bool) -> Self {
        let func = IlFunction::new(module, name, ret, exported);
        let entry = func.entry;
        FunctionBuilder {
            func,
            current: entry,
            loop_depth: 0,
            expr_depth: 0,
            current_loc: None,
        }
    }

    /// Moves insertion to another block
    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    /// True when the current block already ends in a terminator
    pub fn is_terminated(&self) -> bool {
        self.func.block(self.current).is_terminated()
    }

    /// Base metadata for the next instruction
    fn base_meta(&self) -> InstrMeta {
        InstrMeta {
            loc: self.current_loc.clone(),
            loop_depth: self.loop_depth,
            complexity: self.expr_depth,
            reg_pressure: self.expr_depth,
            frequency: if self.loop_depth > 0 {
                super::instruction::Frequency::Hot
            } else {
                super::instruction::Frequency::Normal
            },
            ..InstrMeta::default()
        }
    }

    /// Emits an instruction into the current block, returning the result
    /// register when `result_ty` is a value type
    pub fn emit(
        &mut self,
        op: Opcode,
        result_ty: Option<IlType>,
        operands: Vec<Value>,
        blocks: Vec<BlockId>,
    ) -> Option<VReg> {
        self.emit_with_meta(op, result_ty, operands, blocks, self.base_meta())
    }

    /// Emits an instruction with explicit metadata
    pub fn emit_with_meta(
        &mut self,
        op: Opcode,
        result_ty: Option<IlType>,
        operands: Vec<Value>,
        blocks: Vec<BlockId>,
        meta: InstrMeta,
    ) -> Option<VReg> {
        if self.is_terminated() {
            return None;
        }

        let result = result_ty
            .filter(|t| *t != IlType::Void)
            .map(|t| self.func.fresh_reg(t));
        let id = InstrId(self.func.next_instr);
        self.func.next_instr += 1;

        let is_terminator = op.is_terminator();
        let edge_targets = blocks.clone();
        let instr = Instruction {
            id,
            op,
            result,
            operands,
            blocks,
            meta,
        };
        let current = self.current;
        self.func.block_mut(current).instructions.push(instr);

        if is_terminator {
            for target in edge_targets {
                self.func.add_edge(current, target);
            }
        }
        result
    }

    /// Materializes a constant through a `Const` instruction
    pub fn emit_const(&mut self, constant: Constant) -> Value {
        match self.emit(
            Opcode::Const,
            Some(constant.ty),
            vec![Value::Const(constant)],
            vec![],
        ) {
            Some(reg) => Value::Reg(reg),
            None => Value::Const(constant),
        }
    }

    /// Unconditional jump
    pub fn jump(&mut self, target: BlockId) {
        self.emit(Opcode::Jump, None, vec![], vec![target]);
    }

    /// Conditional branch
    pub fn branch(&mut self, cond: Value, then_block: BlockId, else_block: BlockId) {
        self.emit(Opcode::Branch, None, vec![cond], vec![then_block, else_block]);
    }

    /// Return a value; control funnels through the exit block
    pub fn ret(&mut self, value: Value) {
        let exit = self.func.exit;
        self.emit(Opcode::Return, None, vec![value], vec![exit]);
    }

    /// Return void
    pub fn ret_void(&mut self) {
        let exit = self.func.exit;
        self.emit(Opcode::ReturnVoid, None, vec![], vec![exit]);
    }

    /// Creates a block without switching to it
    pub fn new_block(&mut self, label: &str) -> BlockId {
        self.func.new_block(label)
    }

    /// Finishes the function: any reachable unterminated block falls
    /// through to a void return, so every block satisfies the terminator
    /// invariant
    pub fn finish(mut self) -> IlFunction {
        let exit = self.func.exit;
        for id in self.func.reachable_blocks() {
            if id == exit {
                continue;
            }
            if !self.func.block(id).is_terminated() {
                self.switch_to(id);
                self.ret_void();
            }
        }
        self.func
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_terminate() {
        let mut b = FunctionBuilder::new("m", "f", IlType::Byte, false);
        let v = b.emit_const(Constant::byte(5));
        assert!(matches!(v, Value::Reg(_)));
        b.ret(v);
        // Emission after a terminator is dropped
        assert!(b.emit_const(Constant::byte(9)).as_const().is_some());
        let func = b.finish();
        assert_eq!(func.block(func.entry).instructions.len(), 2);
        assert!(func.block(func.entry).is_terminated());
        // Return wired the exit edge
        assert_eq!(func.block(func.entry).successors, vec![func.exit]);
    }

    #[test]
    fn test_finish_terminates_open_blocks() {
        let mut b = FunctionBuilder::new("m", "f", IlType::Void, false);
        let next = b.new_block("next");
        b.jump(next);
        b.switch_to(next);
        b.emit_const(Constant::byte(1));
        let func = b.finish();
        assert!(func.block(next).is_terminated());
    }
}
