//! Constant folding and propagation
//!
//! Folding rewrites pure operations whose operands are all constants into
//! `const` instructions; a constant divisor of zero is diagnosed and the
//! operation kept. Propagation replaces register operands whose unique
//! SSA definition is a `const`. Branches on constant conditions collapse
//! to jumps. Raster-critical instructions are never touched.

use crate::diagnostics::{DiagnosticBag, DiagnosticCode};
use crate::ir::{Constant, IlFunction, IlType, Opcode, VReg, Value};
use std::collections::HashMap;

/// Mask a folded value to its IL width
fn mask(value: i64, ty: IlType) -> i64 {
    match ty {
        IlType::Byte | IlType::Bool => value & 0xFF,
        _ => value & 0xFFFF,
    }
}

/// Folds one pure operation over constant operands
fn fold(op: &Opcode, operands: &[Constant], ty: IlType) -> Option<i64> {
    let a = operands.first().map(|c| c.masked() as i64);
    let b = operands.get(1).map(|c| c.masked() as i64);
    let value = match (op, a, b) {
        (Opcode::Add, Some(a), Some(b)) => a + b,
        (Opcode::Sub, Some(a), Some(b)) => a - b,
        (Opcode::Mul, Some(a), Some(b)) => a * b,
        (Opcode::Div, Some(a), Some(b)) if b != 0 => a / b,
        (Opcode::Mod, Some(a), Some(b)) if b != 0 => a % b,
        (Opcode::And, Some(a), Some(b)) => a & b,
        (Opcode::Or, Some(a), Some(b)) => a | b,
        (Opcode::Xor, Some(a), Some(b)) => a ^ b,
        (Opcode::Shl, Some(a), Some(b)) => a << (b & 15),
        (Opcode::Shr, Some(a), Some(b)) => a >> (b & 15),
        (Opcode::CmpEq, Some(a), Some(b)) => (a == b) as i64,
        (Opcode::CmpNe, Some(a), Some(b)) => (a != b) as i64,
        (Opcode::CmpLt, Some(a), Some(b)) => (a < b) as i64,
        (Opcode::CmpLe, Some(a), Some(b)) => (a <= b) as i64,
        (Opcode::CmpGt, Some(a), Some(b)) => (a > b) as i64,
        (Opcode::CmpGe, Some(a), Some(b)) => (a >= b) as i64,
        (Opcode::LogicalAnd, Some(a), Some(b)) => ((a != 0) && (b != 0)) as i64,
        (Opcode::LogicalOr, Some(a), Some(b)) => ((a != 0) || (b != 0)) as i64,
        (Opcode::Neg, Some(a), None) => -a,
        (Opcode::Not, Some(a), None) => !a,
        (Opcode::LogicalNot, Some(a), None) => (a == 0) as i64,
        (Opcode::ZeroExtend, Some(a), None) => a,
        (Opcode::Truncate, Some(a), None) => a & 0xFF,
        (Opcode::BoolToByte, Some(a), None) => a,
        (Opcode::ByteToBool, Some(a), None) => (a != 0) as i64,
        (Opcode::Lo, Some(a), None) => a & 0xFF,
        (Opcode::Hi, Some(a), None) => (a >> 8) & 0xFF,
        _ => return None,
    };
    Some(mask(value, ty))
}

/// Registers whose unique SSA definition is a plain constant
fn known_constants(func: &IlFunction) -> HashMap<VReg, Constant> {
    let mut known = HashMap::new();
    for block in &func.blocks {
        for instr in &block.instructions {
            if instr.op == Opcode::Const && !instr.meta.raster_critical {
                if let (Some(result), Some(value)) =
                    (instr.result, instr.operands.first().and_then(|v| v.as_const()))
                {
                    known.insert(result, value);
                }
            }
        }
    }
    known
}

/// Resolves an operand to a constant, through the known-register map
fn resolve(value: &Value, known: &HashMap<VReg, Constant>) -> Option<Constant> {
    match value {
        Value::Const(c) => Some(*c),
        Value::Reg(reg) => known.get(reg).copied(),
        Value::Label(_) => None,
    }
}

/// Constant folding pass. Registers defined by `const` count as constant
/// operands (their single SSA definition makes the value valid at every
/// dominated use).
pub fn fold_constants(func: &mut IlFunction, diags: &mut DiagnosticBag) -> bool {
    let mut changed = false;
    let known = known_constants(func);

    for block_index in 0..func.blocks.len() {
        for instr_index in 0..func.blocks[block_index].instructions.len() {
            let instr = &func.blocks[block_index].instructions[instr_index];
            if instr.meta.raster_critical || !instr.op.is_pure() || instr.op == Opcode::Const {
                continue;
            }
            let Some(result) = instr.result else { continue };

            let constants: Option<Vec<Constant>> =
                instr.operands.iter().map(|v| resolve(v, &known)).collect();
            let Some(constants) = constants else { continue };

            // A constant zero divisor is a guaranteed runtime fault; say
            // so and leave the operation in place.
            if matches!(instr.op, Opcode::Div | Opcode::Mod)
                && constants.get(1).map(|c| c.masked()) == Some(0)
            {
                if let Some(loc) = instr.meta.loc.clone() {
                    diags.error(DiagnosticCode::DivisionByZero, "Division by zero", loc);
                }
                continue;
            }

            if let Some(folded) = fold(&instr.op, &constants, result.ty) {
                let instr = &mut func.blocks[block_index].instructions[instr_index];
                instr.op = Opcode::Const;
                instr.operands = vec![Value::Const(Constant {
                    value: folded,
                    ty: result.ty,
                })];
                changed = true;
            }
        }
    }

    changed |= fold_branches(func, &known);
    changed
}

/// `branch` on a constant condition becomes `jump`
fn fold_branches(func: &mut IlFunction, known: &HashMap<VReg, Constant>) -> bool {
    let mut changed = false;
    let ids: Vec<_> = func.blocks.iter().map(|b| b.id).collect();

    for id in ids {
        let Some(instr) = func.block(id).instructions.last() else {
            continue;
        };
        if instr.op != Opcode::Branch {
            continue;
        }
        let Some(cond) = instr.operands.first().and_then(|v| resolve(v, known)) else {
            continue;
        };
        let (taken, dead) = if cond.masked() != 0 {
            (instr.blocks[0], instr.blocks[1])
        } else {
            (instr.blocks[1], instr.blocks[0])
        };

        let instr = func.block_mut(id).instructions.last_mut().unwrap();
        instr.op = Opcode::Jump;
        instr.operands.clear();
        instr.blocks = vec![taken];
        if dead != taken {
            func.remove_edge(id, dead);
            // Drop the phi slot for the edge that no longer exists
            let dead_block = func.block_mut(dead);
            for phi in &mut dead_block.instructions {
                if phi.op == Opcode::Phi {
                    if let Some(slot) = phi.blocks.iter().position(|&p| p == id) {
                        phi.blocks.remove(slot);
                        if slot < phi.operands.len() {
                            phi.operands.remove(slot);
                        }
                    }
                }
            }
        }
        changed = true;
    }
    changed
}

/// Constant propagation pass: uses of registers defined by `const`
/// become the constant itself
pub fn propagate_constants(func: &mut IlFunction) -> bool {
    let known = known_constants(func);
    if known.is_empty() {
        return false;
    }

    let mut changed = false;
    for block in &mut func.blocks {
        for instr in &mut block.instructions {
            if instr.op == Opcode::Const {
                continue;
            }
            for operand in &mut instr.operands {
                if let Value::Reg(reg) = operand {
                    if let Some(&constant) = known.get(reg) {
                        *operand = Value::Const(constant);
                        changed = true;
                    }
                }
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Opcode};

    #[test]
    fn test_fold_add() {
        let mut b = FunctionBuilder::new("m", "f", IlType::Byte, false);
        let two = b.emit_const(Constant::byte(2));
        let three = b.emit_const(Constant::byte(3));
        let sum = b
            .emit(Opcode::Add, Some(IlType::Byte), vec![two, three], vec![])
            .map(Value::Reg)
            .unwrap();
        b.ret(sum);
        let mut func = b.finish();
        let mut diags = DiagnosticBag::new();

        // Propagate the const registers into the add, then fold it
        assert!(propagate_constants(&mut func));
        assert!(fold_constants(&mut func, &mut diags));

        let folded = func
            .blocks
            .iter()
            .flat_map(|bl| bl.instructions.iter())
            .find(|i| i.result.map(|r| r.id) == sum.as_reg().map(|r| r.id))
            .unwrap();
        assert_eq!(folded.op, Opcode::Const);
        assert_eq!(folded.operands[0].as_const().unwrap().value, 5);
    }

    #[test]
    fn test_division_by_zero_diagnosed() {
        let mut b = FunctionBuilder::new("m", "f", IlType::Byte, false);
        b.current_loc = Some(crate::source::SourceLocation::start_of("t.bl65"));
        let ten = b.emit_const(Constant::byte(10));
        let zero = b.emit_const(Constant::byte(0));
        let div = b
            .emit(Opcode::Div, Some(IlType::Byte), vec![ten, zero], vec![])
            .map(Value::Reg)
            .unwrap();
        b.ret(div);
        let mut func = b.finish();
        let mut diags = DiagnosticBag::new();

        propagate_constants(&mut func);
        fold_constants(&mut func, &mut diags);

        assert!(diags.find(DiagnosticCode::DivisionByZero).is_some());
        // The division survives
        let still_there = func
            .blocks
            .iter()
            .flat_map(|bl| bl.instructions.iter())
            .any(|i| i.op == Opcode::Div);
        assert!(still_there);
    }

    #[test]
    fn test_branch_on_constant_collapses() {
        let mut b = FunctionBuilder::new("m", "f", IlType::Void, false);
        let cond = b.emit_const(Constant::bool(true));
        let then_block = b.new_block("then");
        let else_block = b.new_block("else");
        b.branch(cond, then_block, else_block);
        b.switch_to(then_block);
        b.ret_void();
        b.switch_to(else_block);
        b.ret_void();
        let mut func = b.finish();
        let mut diags = DiagnosticBag::new();

        propagate_constants(&mut func);
        assert!(fold_constants(&mut func, &mut diags));

        let entry = func.block(func.entry);
        assert_eq!(entry.terminator().unwrap().op, Opcode::Jump);
        assert_eq!(entry.successors, vec![then_block]);
    }
}
