//! Virtual-register allocation
//!
//! Every virtual register is assigned either the X index register (Y when
//! the function never needs an ad-hoc index), or a zero-page scratch slot.
//! The accumulator is the working register of every lowered sequence and
//! is never allocated; Y is reserved for indexed addressing whenever the
//! function performs any.
//!
//! Liveness is an interval approximation over a linearized block order.
//! Registers flowing through phis live across their whole loop, so they
//! are pinned for the whole function rather than an interval. Hinted
//! registers compete for X/Y by zero-page priority; the losers spill to
//! zero-page slots like everything else.

use crate::error::{Error, Result};
use crate::ir::{IlFunction, IlType, Opcode, VReg};
use std::collections::{HashMap, HashSet};

/// First zero-page byte of the scratch window for register slots
pub const SLOT_BASE: u8 = 0x72;
/// Bytes available for register slots ($72-$85)
pub const SLOT_BYTES: u8 = 20;
/// Spill byte for an X-resident operand during lowering
pub const X_STASH: u8 = 0x86;
/// Spill byte for a Y-resident operand during lowering
pub const Y_STASH: u8 = 0x87;
/// Zero-page pointer used for indirect addressing ($88/$89)
pub const PTR_SCRATCH: u8 = 0x88;
/// Runtime helper argument/result area ($8A-$8F)
pub const HELPER_BASE: u8 = 0x8A;

/// Physical location of a virtual register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// X index register (byte values only)
    RegX,
    /// Y index register (byte values only; only when never needed as an
    /// ad-hoc index)
    RegY,
    /// Zero-page slot; words take this byte and the next
    Zp(u8),
}

/// Allocation result for one function
#[derive(Debug, Default)]
pub struct Allocation {
    locations: HashMap<u32, Location>,
    /// Register value types, for slot widths at use sites
    types: HashMap<u32, IlType>,
}

impl Allocation {
    /// Location of a register
    pub fn location(&self, reg: VReg) -> Option<Location> {
        self.locations.get(&reg.id).copied()
    }

    /// True when the register lives in X or Y
    pub fn in_index_reg(&self, reg: VReg) -> bool {
        matches!(
            self.locations.get(&reg.id),
            Some(Location::RegX) | Some(Location::RegY)
        )
    }

    /// Value type of a register
    pub fn ty(&self, reg: VReg) -> IlType {
        self.types.get(&reg.id).copied().unwrap_or(IlType::Byte)
    }
}

struct Interval {
    reg: VReg,
    start: usize,
    end: usize,
    pinned: bool,
    hinted: bool,
    priority: u8,
    crosses_call: bool,
}

/// Computes the allocation for one function
pub fn allocate(func: &IlFunction) -> Result<Allocation> {
    // Linearize reachable blocks and index every instruction
    let order = func.reachable_blocks();
    let mut index_of: HashMap<u32, (usize, usize)> = HashMap::new(); // reg -> (first, last)
    let mut pinned: HashSet<u32> = HashSet::new();
    let mut hints: HashMap<u32, u8> = HashMap::new();
    let mut call_sites: Vec<usize> = Vec::new();
    let mut needs_index = false;
    let mut types: HashMap<u32, IlType> = HashMap::new();

    let mut touch = |map: &mut HashMap<u32, (usize, usize)>, reg: VReg, at: usize| {
        let entry = map.entry(reg.id).or_insert((at, at));
        entry.0 = entry.0.min(at);
        entry.1 = entry.1.max(at);
    };

    let mut position = 0usize;
    for &block_id in &order {
        let block = func.block(block_id);
        for instr in &block.instructions {
            match &instr.op {
                // Calls clobber X/Y, and the software multiply/divide
                // helpers are calls under the hood
                Opcode::Call(_)
                | Opcode::CallVoid(_)
                | Opcode::CallIndirect
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::InlineAsm(_) => {
                    call_sites.push(position);
                }
                Opcode::LoadArray(_)
                | Opcode::StoreArray(_)
                | Opcode::MapLoadRange
                | Opcode::MapStoreRange
                | Opcode::Peek
                | Opcode::Poke
                | Opcode::Peekw
                | Opcode::Pokew
                | Opcode::VolatileRead
                | Opcode::VolatileWrite => {
                    needs_index = true;
                }
                // Variable shift counts loop through Y
                Opcode::Shl | Opcode::Shr => {
                    if instr.operands.get(1).and_then(|v| v.as_const()).is_none() {
                        needs_index = true;
                    }
                }
                _ => {}
            }

            if let Some(result) = instr.result {
                touch(&mut index_of, result, position);
                types.insert(result.id, result.ty);
                if instr.op == Opcode::Phi {
                    pinned.insert(result.id);
                }
                if let Some(_hint) = instr.meta.preferred_reg {
                    if instr.meta.zp_priority > 0 {
                        hints.insert(result.id, instr.meta.zp_priority);
                    } else {
                        hints.insert(result.id, 50);
                    }
                }
            }
            for reg in instr.used_regs() {
                touch(&mut index_of, reg, position);
                types.entry(reg.id).or_insert(reg.ty);
                if instr.op == Opcode::Phi {
                    pinned.insert(reg.id);
                }
                if instr.meta.preferred_reg.is_some() {
                    hints.entry(reg.id).or_insert(instr.meta.zp_priority.max(50));
                }
            }
            position += 1;
        }
    }
    let total = position;

    // Parameters are live from the function start
    for param in &func.params {
        let entry = index_of.entry(param.reg.id).or_insert((0, 0));
        entry.0 = 0;
        types.insert(param.reg.id, param.ty);
    }

    let mut intervals: Vec<Interval> = index_of
        .iter()
        .map(|(&id, &(start, end))| {
            let reg = VReg::new(id, types.get(&id).copied().unwrap_or(IlType::Byte));
            let is_pinned = pinned.contains(&id);
            let (start, end) = if is_pinned { (0, total) } else { (start, end) };
            Interval {
                reg,
                start,
                end,
                pinned: is_pinned,
                hinted: hints.contains_key(&id),
                priority: hints.get(&id).copied().unwrap_or(0),
                crosses_call: call_sites.iter().any(|&c| start <= c && c <= end),
            }
        })
        .collect();
    intervals.sort_by_key(|iv| (iv.start, iv.reg.id));

    let mut allocation = Allocation {
        locations: HashMap::new(),
        types,
    };

    // X (and Y, when free for allocation) go to the best-priority hinted
    // byte registers that never cross a call
    let mut index_candidates: Vec<&Interval> = intervals
        .iter()
        .filter(|iv| {
            iv.hinted
                && !iv.crosses_call
                && matches!(iv.reg.ty, IlType::Byte | IlType::Bool)
        })
        .collect();
    index_candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut x_taken: Vec<(usize, usize)> = Vec::new();
    let mut y_taken: Vec<(usize, usize)> = Vec::new();
    for candidate in index_candidates {
        let overlaps =
            |taken: &[(usize, usize)]| taken.iter().any(|&(s, e)| candidate.start <= e && s <= candidate.end);
        if !overlaps(&x_taken) {
            allocation
                .locations
                .insert(candidate.reg.id, Location::RegX);
            x_taken.push((candidate.start, candidate.end));
        } else if !needs_index && !overlaps(&y_taken) {
            allocation
                .locations
                .insert(candidate.reg.id, Location::RegY);
            y_taken.push((candidate.start, candidate.end));
        }
    }

    // Everything else gets a zero-page slot with interval reuse
    let mut occupied: Vec<Option<usize>> = vec![None; SLOT_BYTES as usize]; // end position
    for interval in &intervals {
        if allocation.locations.contains_key(&interval.reg.id) {
            continue;
        }
        let width = interval.reg.ty.size().max(1) as usize;

        let mut found = None;
        'search: for slot in 0..=(SLOT_BYTES as usize).saturating_sub(width) {
            for offset in 0..width {
                if let Some(end) = occupied[slot + offset] {
                    if end >= interval.start {
                        continue 'search;
                    }
                }
            }
            found = Some(slot);
            break;
        }

        let slot = found.ok_or_else(|| {
            Error::internal(format!(
                "function '{}.{}' exhausts the zero-page register window",
                func.module, func.name
            ))
        })?;
        for offset in 0..width {
            occupied[slot + offset] = Some(if interval.pinned { total } else { interval.end });
        }
        allocation
            .locations
            .insert(interval.reg.id, Location::Zp(SLOT_BASE + slot as u8));
    }

    Ok(allocation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Constant, CpuReg, FunctionBuilder, InstrMeta, Value};

    #[test]
    fn test_basic_slot_assignment() {
        let mut b = FunctionBuilder::new("m", "f", IlType::Void, false);
        let a = b.emit_const(Constant::byte(1));
        let c = b.emit_const(Constant::word(0x1234));
        let addr = b.emit_const(Constant::word(0xD020));
        b.emit(Opcode::Pokew, None, vec![addr, c], vec![]);
        b.emit(
            Opcode::Poke,
            None,
            vec![Value::Const(Constant::word(0xD021)), a],
            vec![],
        );
        b.ret_void();
        let func = b.finish();

        let allocation = allocate(&func).unwrap();
        for reg in [a, c, addr] {
            let reg = reg.as_reg().unwrap();
            assert!(allocation.location(reg).is_some());
        }
        // Word registers get two-byte slots; no two live slots overlap
        let mut used: Vec<(u8, u8)> = Vec::new();
        for reg in [a, c, addr] {
            let reg = reg.as_reg().unwrap();
            if let Some(Location::Zp(base)) = allocation.location(reg) {
                let width = reg.ty.size() as u8;
                for (other, ow) in &used {
                    assert!(
                        base + width <= *other || *other + ow <= base,
                        "slots overlap"
                    );
                }
                used.push((base, width));
            }
        }
    }

    #[test]
    fn test_hinted_register_gets_x() {
        let mut b = FunctionBuilder::new("m", "f", IlType::Void, false);
        let mut meta = InstrMeta::default();
        meta.preferred_reg = Some(CpuReg::X);
        meta.zp_priority = 90;
        let counter = b
            .emit_with_meta(
                Opcode::Const,
                Some(IlType::Byte),
                vec![Value::Const(Constant::byte(0))],
                vec![],
                meta,
            )
            .unwrap();
        b.emit(
            Opcode::Poke,
            None,
            vec![Value::Const(Constant::word(0xD020)), Value::Reg(counter)],
            vec![],
        );
        b.ret_void();
        let func = b.finish();

        let allocation = allocate(&func).unwrap();
        assert_eq!(allocation.location(counter), Some(Location::RegX));
    }

    #[test]
    fn test_call_crossing_register_not_in_x() {
        let mut b = FunctionBuilder::new("m", "f", IlType::Void, false);
        let mut meta = InstrMeta::default();
        meta.preferred_reg = Some(CpuReg::X);
        meta.zp_priority = 90;
        let counter = b
            .emit_with_meta(
                Opcode::Const,
                Some(IlType::Byte),
                vec![Value::Const(Constant::byte(0))],
                vec![],
                meta,
            )
            .unwrap();
        b.emit(Opcode::CallVoid("m.g".to_string()), None, vec![], vec![]);
        b.emit(
            Opcode::Poke,
            None,
            vec![Value::Const(Constant::word(0xD020)), Value::Reg(counter)],
            vec![],
        );
        b.ret_void();
        let func = b.finish();

        let allocation = allocate(&func).unwrap();
        assert!(matches!(allocation.location(counter), Some(Location::Zp(_))));
    }
}
