//! IL generation
//!
//! Walks the annotated AST one function at a time and emits typed
//! three-address IL. All semantic questions were settled earlier: name
//! references carry resolved symbols, expressions carry types and coercion
//! markers, constants are folded into metadata. The generator's job is
//! shape: short-circuit operators and ternaries lower to branches with a
//! phi at the merge, `for` lowers to the canonical while form, `@map`
//! accesses keep their structure in dedicated opcodes, and intrinsic calls
//! dispatch straight to intrinsic opcodes.

use super::builder::FunctionBuilder;
use super::function::{GlobalInit, IlFunction, IlGlobal, IlModule, IlParam};
use super::instruction::{
    CpuReg, InstrId, InstrMeta, Instruction, MappedAccess, Opcode,
};
use super::value::{BlockId, Constant, IlType, Value};
use crate::error::{Error, Result};
use crate::parser::ast::*;
use crate::sema::{
    AnalysisResult, MappedStruct, ModuleAnalysis, StorageClass, SymbolId, SymbolKind, TypeKind,
};

/// Loop context for break/continue
struct LoopCtx {
    break_to: BlockId,
    continue_to: BlockId,
}

/// Resolved assignment/read target
enum TargetRef {
    /// Named variable (local or module-level); payload is the IL name
    Var(String, IlType),
    /// Array element; `global` names the IL global
    ArrayElem {
        name: String,
        elem_ty: IlType,
        index: Value,
    },
    /// Mapped-struct scalar field
    MapField(MappedAccess, IlType),
    /// Mapped-struct range element; the index is evaluated exactly once
    MapRange(MappedAccess, Value, IlType),
    /// Raw pointer target
    Pointer(Value, IlType),
}

/// Generates IL for the whole batch
pub struct IlGenerator<'a> {
    analysis: &'a AnalysisResult,
}

impl<'a> IlGenerator<'a> {
    /// Creates a generator over finished analysis results
    pub fn new(analysis: &'a AnalysisResult) -> Self {
        IlGenerator { analysis }
    }

    /// Generates one [`IlModule`] per analyzed module, in compile order,
    /// then wires module initializer calls into `main`
    pub fn generate(&self) -> Result<Vec<IlModule>> {
        let mut modules = Vec::new();
        let mut init_fns: Vec<String> = Vec::new();

        for &index in &self.analysis.compile_order {
            let analysis = &self.analysis.modules[index];
            let mut gen = ModuleGen {
                batch: self.analysis,
                module: analysis,
            };
            let il = gen.generate()?;
            if il.function("__module_init").is_some() {
                init_fns.push(il.name.clone());
            }
            tracing::debug!(module = %il.name, functions = il.functions.len(), "IL generated");
            modules.push(il);
        }

        self.wire_module_inits(&mut modules, &init_fns);
        Ok(modules)
    }

    /// Prepends `call_void module.__module_init` calls to `main`, in
    /// compile order, after its parameter stores
    fn wire_module_inits(&self, modules: &mut [IlModule], init_fns: &[String]) {
        if init_fns.is_empty() {
            return;
        }
        for module in modules.iter_mut() {
            let Some(func) = module.functions.iter_mut().find(|f| f.name == "main") else {
                continue;
            };
            let at = func.params.len();
            let entry = func.entry;
            for (offset, init_module) in init_fns.iter().enumerate() {
                let id = InstrId(func.next_instr);
                func.next_instr += 1;
                let instr = Instruction {
                    id,
                    op: Opcode::CallVoid(format!("{}.__module_init", init_module)),
                    result: None,
                    operands: vec![],
                    blocks: vec![],
                    meta: InstrMeta::default(),
                };
                func.blocks[entry.0 as usize]
                    .instructions
                    .insert(at + offset, instr);
            }
            return;
        }
    }
}

/// Generator for one module
struct ModuleGen<'a> {
    batch: &'a AnalysisResult,
    module: &'a ModuleAnalysis,
}

impl<'a> ModuleGen<'a> {
    fn generate(&mut self) -> Result<IlModule> {
        let name = self.module.program.module_name.clone();
        let mut il = IlModule::new(&name);

        for import in &self.module.program.imports {
            for imported in &import.names {
                il.imports.push((import.module.clone(), imported.clone()));
            }
        }

        let mut deferred_inits: Vec<&VarDecl> = Vec::new();
        for decl in &self.module.program.decls {
            match decl {
                Decl::Variable(v) => {
                    if let Some(global) = self.build_global(v, &mut deferred_inits) {
                        il.globals.push(global);
                    }
                }
                Decl::MemoryMap(m) => {
                    if let Some((_, mapped)) = self.mapped_struct(m.id) {
                        il.globals.push(IlGlobal {
                            name: format!("{}.{}", name, m.name),
                            ty: IlType::Byte,
                            size: mapped.size,
                            storage: StorageClass::Map,
                            address: Some(mapped.base),
                            init: GlobalInit::Zeroed,
                        });
                    }
                }
                _ => {}
            }
        }

        let mut extra_globals = Vec::new();
        for decl in &self.module.program.decls {
            if let Decl::Function(f) = decl {
                if f.is_stub {
                    continue;
                }
                il.functions.push(self.gen_function(f, &mut extra_globals)?);
                if f.exported || f.name == "main" {
                    il.exports.push(f.name.clone());
                }
            }
        }
        il.globals.append(&mut extra_globals);

        if !deferred_inits.is_empty() {
            il.functions.push(self.gen_module_init(&deferred_inits)?);
        }

        Ok(il)
    }

    // =========================================================================
    // GLOBALS
    // =========================================================================

    /// Builds the IL global for a module-level variable; initializers that
    /// are not compile-time constants are deferred to `__module_init`
    fn build_global<'v>(
        &self,
        v: &'v VarDecl,
        deferred: &mut Vec<&'v VarDecl>,
    ) -> Option<IlGlobal> {
        let &sym_id = self.module.scope_map.decl_symbols.get(&v.id)?;
        let symbol = self.module.symbols.symbol(sym_id);
        let ty_id = symbol.ty?;
        let info = self.batch.types.info(ty_id);
        let size = info.size;

        // Inlined scalar constants need no storage
        if symbol.is_const && symbol.const_value.is_some() && size <= 2 {
            return None;
        }
        if size == 0 && !matches!(info.kind, TypeKind::String) {
            return None;
        }

        let module = &self.module.program.module_name;
        let (ty, size, init) = match info.kind.clone() {
            TypeKind::Array { elem, len } => {
                let elem_ty = self.il_type(elem);
                let elem_size = self.batch.types.size_of(elem);
                let total = elem_size * len.unwrap_or(0);
                let init = match v.init.as_ref().map(|e| &e.kind) {
                    Some(ExprKind::ArrayLiteral(elements)) => {
                        let mut bytes = Vec::new();
                        let mut all_const = true;
                        for element in elements {
                            match self.module.metadata.constant_of(element.id) {
                                Some(value) => {
                                    bytes.push((value & 0xFF) as u8);
                                    if elem_size == 2 {
                                        bytes.push((value >> 8) as u8);
                                    }
                                }
                                None => {
                                    all_const = false;
                                    break;
                                }
                            }
                        }
                        if all_const {
                            GlobalInit::Bytes(bytes)
                        } else {
                            deferred.push(v);
                            GlobalInit::Zeroed
                        }
                    }
                    _ => GlobalInit::Zeroed,
                };
                (elem_ty, total, init)
            }
            TypeKind::String => {
                let bytes = match v.init.as_ref().map(|e| &e.kind) {
                    Some(ExprKind::Str(text)) => text.as_bytes().to_vec(),
                    _ => Vec::new(),
                };
                let len = bytes.len() as u32;
                (IlType::Byte, len, GlobalInit::Bytes(bytes))
            }
            _ => {
                let ty = self.il_type(ty_id);
                let init = match v
                    .init
                    .as_ref()
                    .and_then(|e| self.module.metadata.constant_of(e.id))
                {
                    Some(value) => {
                        let mut bytes = vec![(value & 0xFF) as u8];
                        if size == 2 {
                            bytes.push((value >> 8) as u8);
                        }
                        GlobalInit::Bytes(bytes)
                    }
                    None => {
                        if v.init.is_some() {
                            deferred.push(v);
                        }
                        GlobalInit::Zeroed
                    }
                };
                (ty, size, init)
            }
        };

        Some(IlGlobal {
            name: format!("{}.{}", module, v.name),
            ty,
            size,
            storage: symbol.storage,
            address: self.batch.layout.address_of(module, &v.name),
            init,
        })
    }

    /// Generates `__module_init` holding the deferred initializer stores
    fn gen_module_init(&mut self, deferred: &[&VarDecl]) -> Result<IlFunction> {
        let module = self.module.program.module_name.clone();
        let mut unused = Vec::new();
        let mut ctx = FuncGen {
            batch: self.batch,
            module: self.module,
            b: FunctionBuilder::new(&module, "__module_init", IlType::Void, false),
            loops: Vec::new(),
            extra_globals: &mut unused,
        };

        for v in deferred {
            let Some(init) = &v.init else { continue };
            ctx.b.current_loc = Some(v.loc.clone());
            let global = format!("{}.{}", module, v.name);
            match &init.kind {
                ExprKind::ArrayLiteral(elements) => {
                    for (i, element) in elements.iter().enumerate() {
                        let value = ctx.gen_expr(element)?;
                        let index = Value::Const(Constant::word(i as u16));
                        ctx.b.emit(
                            Opcode::StoreArray(global.clone()),
                            None,
                            vec![index, value],
                            vec![],
                        );
                    }
                }
                _ => {
                    let value = ctx.gen_expr(init)?;
                    ctx.b
                        .emit(Opcode::StoreVar(global.clone()), None, vec![value], vec![]);
                }
            }
        }
        ctx.b.ret_void();
        Ok(ctx.b.finish())
    }

    // =========================================================================
    // FUNCTIONS
    // =========================================================================

    fn gen_function(
        &mut self,
        f: &FunctionDecl,
        extra_globals: &mut Vec<IlGlobal>,
    ) -> Result<IlFunction> {
        let module = self.module.program.module_name.clone();
        let ret = self.function_ret_type(f);
        let mut ctx = FuncGen {
            batch: self.batch,
            module: self.module,
            b: FunctionBuilder::new(&module, &f.name, ret, f.exported),
            loops: Vec::new(),
            extra_globals,
        };

        // Parameters arrive in registers and are stored to their named
        // slots so SSA construction treats them like any other variable.
        for param in &f.params {
            let Some(&sym_id) = self.module.scope_map.decl_symbols.get(&param.id) else {
                continue;
            };
            let symbol = self.module.symbols.symbol(sym_id);
            let ty = symbol
                .ty
                .map(|t| self.il_type(t))
                .unwrap_or(IlType::Byte);
            let name = local_name(&param.name, sym_id);
            let reg = ctx.b.func.fresh_named_reg(ty, &param.name);
            ctx.b.func.params.push(IlParam {
                name: name.clone(),
                ty,
                reg,
            });
            ctx.b
                .emit(Opcode::StoreVar(name), None, vec![Value::Reg(reg)], vec![]);
        }

        ctx.gen_block(&f.body)?;

        if !ctx.b.is_terminated() {
            if ret == IlType::Void {
                ctx.b.ret_void();
            } else {
                // Semantic analysis rejected missing returns already; keep
                // the block well formed regardless.
                let zero = ctx.b.emit_const(Constant { value: 0, ty: ret });
                ctx.b.ret(zero);
            }
        }
        Ok(ctx.b.finish())
    }

    fn function_ret_type(&self, f: &FunctionDecl) -> IlType {
        self.module
            .scope_map
            .decl_symbols
            .get(&f.id)
            .and_then(|&id| self.module.symbols.symbol(id).ty)
            .map(|ty| match &self.batch.types.info(ty).kind {
                TypeKind::Function { ret, .. } => self.il_type(*ret),
                _ => IlType::Void,
            })
            .unwrap_or(IlType::Void)
    }

    fn mapped_struct(&self, decl: NodeId) -> Option<(SymbolId, &MappedStruct)> {
        let &id = self.module.scope_map.decl_symbols.get(&decl)?;
        self.module.symbols.mapped.get(&id).map(|m| (id, m))
    }

    fn il_type(&self, ty: crate::sema::TypeId) -> IlType {
        il_type_of(self.batch, ty)
    }
}

/// Maps a source type to its IL type
fn il_type_of(batch: &AnalysisResult, ty: crate::sema::TypeId) -> IlType {
    match &batch.types.info(ty).kind {
        TypeKind::Byte => IlType::Byte,
        TypeKind::Word => IlType::Word,
        TypeKind::Boolean => IlType::Bool,
        TypeKind::Void => IlType::Void,
        TypeKind::Pointer(_) | TypeKind::Function { .. } => IlType::Ptr,
        TypeKind::Array { .. } | TypeKind::String => IlType::Ptr,
        TypeKind::Unknown => IlType::Byte,
    }
}

/// IL name of a function-local variable; the symbol id keeps shadowed
/// names apart
fn local_name(name: &str, id: SymbolId) -> String {
    format!("{}%{}", name, id.0)
}

/// Generator state for one function body
struct FuncGen<'a> {
    batch: &'a AnalysisResult,
    module: &'a ModuleAnalysis,
    b: FunctionBuilder,
    loops: Vec<LoopCtx>,
    /// Static storage for local arrays, surfaced as module globals
    extra_globals: &'a mut Vec<IlGlobal>,
}

impl<'a> FuncGen<'a> {
    // =========================================================================
    // STATEMENTS
    // =========================================================================

    fn gen_block(&mut self, stmts: &[Stmt]) -> Result<()> {
        for stmt in stmts {
            if self.b.is_terminated() {
                break; // unreachable; semantic analysis already warned
            }
            self.gen_stmt(stmt)?;
        }
        Ok(())
    }

    fn gen_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        self.b.current_loc = Some(stmt.loc.clone());
        match &stmt.kind {
            StmtKind::Let(v) => self.gen_let(v),
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => self.gen_if(cond, then_body, else_body.as_deref()),
            StmtKind::While { cond, body } => self.gen_while(cond, body),
            StmtKind::For {
                var_id,
                from,
                to,
                step,
                body,
                ..
            } => self.gen_for(stmt, *var_id, from, to, step.as_ref(), body),
            StmtKind::Match {
                scrutinee,
                cases,
                default,
            } => self.gen_match(scrutinee, cases, default.as_deref()),
            StmtKind::Break => {
                if let Some(ctx) = self.loops.last() {
                    let target = ctx.break_to;
                    self.b.jump(target);
                }
                Ok(())
            }
            StmtKind::Continue => {
                if let Some(ctx) = self.loops.last() {
                    let target = ctx.continue_to;
                    self.b.jump(target);
                }
                Ok(())
            }
            StmtKind::Return(value) => {
                match value {
                    Some(expr) => {
                        let v = self.gen_expr(expr)?;
                        self.b.ret(v);
                    }
                    None => self.b.ret_void(),
                }
                Ok(())
            }
            StmtKind::Expression(expr) => {
                let _ = self.gen_expr(expr)?;
                Ok(())
            }
            StmtKind::Asm(text) => {
                let mut meta = InstrMeta {
                    raster_critical: true,
                    ..Default::default()
                };
                meta.loc = Some(stmt.loc.clone());
                self.b.emit_with_meta(
                    Opcode::InlineAsm(text.clone()),
                    None,
                    vec![],
                    vec![],
                    meta,
                );
                Ok(())
            }
        }
    }

    fn gen_let(&mut self, v: &VarDecl) -> Result<()> {
        let Some(&sym_id) = self.module.scope_map.decl_symbols.get(&v.id) else {
            return Ok(());
        };
        let symbol = self.module.symbols.symbol(sym_id);
        let ty_id = symbol.ty;
        let is_array = matches!(
            ty_id.map(|t| self.batch.types.info(t).kind.clone()),
            Some(TypeKind::Array { .. })
        );

        if is_array {
            // Local arrays live in static storage. Constant elements bake
            // into the reserved bytes; the rest store at declaration.
            let Some(TypeKind::Array { elem, len }) =
                ty_id.map(|t| self.batch.types.info(t).kind.clone())
            else {
                return Ok(());
            };
            let elem_ty = il_type_of(self.batch, elem);
            let elem_size = self.batch.types.size_of(elem);
            let count = len.unwrap_or(0);
            let name = self.local_array_name(&v.name, sym_id);

            let mut bytes = vec![0u8; (elem_size * count) as usize];
            let mut deferred: Vec<(usize, &Expr)> = Vec::new();
            let mut any_const = false;
            if let Some(init) = &v.init {
                if let ExprKind::ArrayLiteral(elements) = &init.kind {
                    for (i, element) in elements.iter().enumerate() {
                        match self.module.metadata.constant_of(element.id) {
                            Some(value) => {
                                any_const = true;
                                let at = i * elem_size as usize;
                                bytes[at] = (value & 0xFF) as u8;
                                if elem_size == 2 {
                                    bytes[at + 1] = (value >> 8) as u8;
                                }
                            }
                            None => deferred.push((i, element)),
                        }
                    }
                }
            }

            self.extra_globals.push(IlGlobal {
                name: name.clone(),
                ty: elem_ty,
                size: elem_size * count,
                storage: StorageClass::Ram,
                address: None,
                init: if any_const {
                    GlobalInit::Bytes(bytes)
                } else {
                    GlobalInit::Zeroed
                },
            });

            for (i, element) in deferred {
                let value = self.gen_expr(element)?;
                let index = Value::Const(Constant::word(i as u16));
                self.b.emit(
                    Opcode::StoreArray(name.clone()),
                    None,
                    vec![index, value],
                    vec![],
                );
            }
            return Ok(());
        }

        if let Some(init) = &v.init {
            let value = self.gen_expr(init)?;
            let name = local_name(&v.name, sym_id);
            self.b
                .emit(Opcode::StoreVar(name), None, vec![value], vec![]);
        }
        Ok(())
    }

    fn gen_if(
        &mut self,
        cond: &Expr,
        then_body: &[Stmt],
        else_body: Option<&[Stmt]>,
    ) -> Result<()> {
        let cond_v = self.gen_expr(cond)?;
        let then_block = self.b.new_block("then");
        let merge = self.b.new_block("endif");

        match else_body {
            Some(else_body) => {
                let else_block = self.b.new_block("else");
                self.b.branch(cond_v, then_block, else_block);

                self.b.switch_to(then_block);
                self.gen_block(then_body)?;
                if !self.b.is_terminated() {
                    self.b.jump(merge);
                }

                self.b.switch_to(else_block);
                self.gen_block(else_body)?;
                if !self.b.is_terminated() {
                    self.b.jump(merge);
                }
            }
            None => {
                self.b.branch(cond_v, then_block, merge);
                self.b.switch_to(then_block);
                self.gen_block(then_body)?;
                if !self.b.is_terminated() {
                    self.b.jump(merge);
                }
            }
        }

        self.b.switch_to(merge);
        Ok(())
    }

    fn gen_while(&mut self, cond: &Expr, body: &[Stmt]) -> Result<()> {
        let header = self.b.new_block("while_head");
        let body_block = self.b.new_block("while_body");
        let exit = self.b.new_block("while_end");

        self.b.jump(header);
        self.b.switch_to(header);
        self.b.loop_depth += 1;
        let cond_v = self.gen_expr(cond)?;
        self.b.branch(cond_v, body_block, exit);
        self.mark_block(header, true, false);

        self.loops.push(LoopCtx {
            break_to: exit,
            continue_to: header,
        });
        self.b.switch_to(body_block);
        self.gen_block(body)?;
        if !self.b.is_terminated() {
            self.b.jump(header);
        }
        self.loops.pop();
        self.b.loop_depth -= 1;

        self.b.switch_to(exit);
        Ok(())
    }

    /// `for` lowers to the canonical while form: init in the entry,
    /// `i <= end` in the header, the step in a dedicated increment block
    fn gen_for(
        &mut self,
        stmt: &Stmt,
        var_id: NodeId,
        from: &Expr,
        to: &Expr,
        step: Option<&Expr>,
        body: &[Stmt],
    ) -> Result<()> {
        let Some(&sym_id) = self.module.scope_map.decl_symbols.get(&var_id) else {
            return Ok(());
        };
        let symbol = self.module.symbols.symbol(sym_id);
        let induction_ty = symbol
            .ty
            .map(|t| il_type_of(self.batch, t))
            .unwrap_or(IlType::Byte);
        let var = local_name(&symbol.name, sym_id);
        let xy_candidate = matches!(
            self.module
                .metadata
                .get(stmt.id, MetadataKey::LoopRegisterCandidate),
            Some(MetadataValue::Flag(true))
        );

        let init = self.gen_expr(from)?;
        self.b
            .emit(Opcode::StoreVar(var.clone()), None, vec![init], vec![]);

        let header = self.b.new_block("for_head");
        let body_block = self.b.new_block("for_body");
        let increment = self.b.new_block("for_inc");
        let exit = self.b.new_block("for_end");

        self.b.jump(header);
        self.b.switch_to(header);
        self.b.loop_depth += 1;
        let current = self
            .b
            .emit(Opcode::LoadVar(var.clone()), Some(induction_ty), vec![], vec![])
            .map(Value::Reg)
            .unwrap_or(Value::Const(Constant::byte(0)));
        let end = self.gen_expr(to)?;
        let cond = self
            .b
            .emit(Opcode::CmpLe, Some(IlType::Bool), vec![current, end], vec![])
            .map(Value::Reg)
            .unwrap_or(Value::Const(Constant::bool(false)));
        self.b.branch(cond, body_block, exit);
        self.mark_block(header, true, false);

        self.loops.push(LoopCtx {
            break_to: exit,
            continue_to: increment,
        });
        self.b.switch_to(body_block);
        self.gen_block(body)?;
        if !self.b.is_terminated() {
            self.b.jump(increment);
        }
        self.loops.pop();

        self.b.switch_to(increment);
        let value = self
            .b
            .emit(Opcode::LoadVar(var.clone()), Some(induction_ty), vec![], vec![])
            .map(Value::Reg)
            .unwrap_or(Value::Const(Constant::byte(0)));
        let step_v = match step {
            Some(step) => self.gen_expr(step)?,
            None => Value::Const(Constant {
                value: 1,
                ty: induction_ty,
            }),
        };
        let next = self
            .b
            .emit(Opcode::Add, Some(induction_ty), vec![value, step_v], vec![])
            .map(Value::Reg)
            .unwrap_or(value);
        self.b
            .emit(Opcode::StoreVar(var.clone()), None, vec![next], vec![]);
        self.b.jump(header);
        self.mark_block(increment, false, true);
        self.b.loop_depth -= 1;

        // An X/Y-candidate counter prefers an index register and a high
        // zero-page priority if it spills.
        if xy_candidate {
            for block in [header, increment, body_block] {
                for instr in &mut self.b.func.block_mut(block).instructions {
                    if matches!(
                        &instr.op,
                        Opcode::LoadVar(n) | Opcode::StoreVar(n) if *n == var
                    ) {
                        instr.meta.preferred_reg = Some(CpuReg::X);
                        instr.meta.zp_priority = 90;
                    }
                }
            }
        }

        self.b.switch_to(exit);
        Ok(())
    }

    fn gen_match(
        &mut self,
        scrutinee: &Expr,
        cases: &[MatchCase],
        default: Option<&[Stmt]>,
    ) -> Result<()> {
        let scrut = self.gen_expr(scrutinee)?;
        let merge = self.b.new_block("endmatch");

        let mut bodies = Vec::new();
        for _ in cases {
            bodies.push(self.b.new_block("case"));
        }
        let default_block = default.map(|_| self.b.new_block("default"));
        let fallthrough = default_block.unwrap_or(merge);

        // Comparison chain
        for (i, case) in cases.iter().enumerate() {
            let value = self
                .module
                .metadata
                .constant_of(case.value.id)
                .unwrap_or(0);
            let case_const = Value::Const(Constant {
                value: value as i64,
                ty: scrut.ty(),
            });
            let cond = self
                .b
                .emit(Opcode::CmpEq, Some(IlType::Bool), vec![scrut, case_const], vec![])
                .map(Value::Reg)
                .unwrap_or(Value::Const(Constant::bool(false)));
            let next_test = if i + 1 < cases.len() {
                self.b.new_block("case_test")
            } else {
                fallthrough
            };
            self.b.branch(cond, bodies[i], next_test);
            self.b.switch_to(next_test);
        }
        if cases.is_empty() {
            self.b.jump(fallthrough);
        }

        for (case, &block) in cases.iter().zip(bodies.iter()) {
            self.b.switch_to(block);
            self.gen_block(&case.body)?;
            if !self.b.is_terminated() {
                self.b.jump(merge);
            }
        }
        if let (Some(default), Some(block)) = (default, default_block) {
            self.b.switch_to(block);
            self.gen_block(default)?;
            if !self.b.is_terminated() {
                self.b.jump(merge);
            }
        }

        self.b.switch_to(merge);
        Ok(())
    }

    fn mark_block(&mut self, block: BlockId, header: bool, latch: bool) {
        for instr in &mut self.b.func.block_mut(block).instructions {
            instr.meta.is_loop_header |= header;
            instr.meta.is_loop_latch |= latch;
        }
    }

    // =========================================================================
    // EXPRESSIONS
    // =========================================================================

    /// Generates an expression and applies its coercion marker, if any
    fn gen_expr(&mut self, expr: &Expr) -> Result<Value> {
        self.b.expr_depth += 1;
        let raw = self.gen_expr_raw(expr);
        self.b.expr_depth -= 1;
        Ok(self.apply_coercion(expr.id, raw?))
    }

    fn apply_coercion(&mut self, node: NodeId, value: Value) -> Value {
        let Some(kind) = self.module.metadata.coercion_of(node) else {
            return value;
        };
        let (op, ty) = match kind {
            CoercionKind::ZeroExtend => (Opcode::ZeroExtend, IlType::Word),
            CoercionKind::Truncate => (Opcode::Truncate, IlType::Byte),
            CoercionKind::BoolToByte => (Opcode::BoolToByte, IlType::Byte),
            CoercionKind::ByteToBool => (Opcode::ByteToBool, IlType::Bool),
        };
        let mut meta = InstrMeta {
            coercion: Some(kind),
            ..Default::default()
        };
        meta.loc = self.b.current_loc.clone();
        match self.b.emit_with_meta(op, Some(ty), vec![value], vec![], meta) {
            Some(reg) => Value::Reg(reg),
            None => value,
        }
    }

    fn gen_expr_raw(&mut self, expr: &Expr) -> Result<Value> {
        match &expr.kind {
            ExprKind::Number(_) | ExprKind::Bool(_) => {
                let ty = self.expr_type(expr);
                let value = self.module.metadata.constant_of(expr.id).unwrap_or(0);
                Ok(self.b.emit_const(Constant {
                    value: value as i64,
                    ty,
                }))
            }
            ExprKind::Str(_) | ExprKind::ArrayLiteral(_) => {
                // Valid only in initializer and length() positions, both
                // handled elsewhere; keep the IL well formed regardless.
                Ok(Value::Const(Constant::word(0)))
            }
            ExprKind::Identifier(_) => self.gen_identifier(expr),
            ExprKind::Binary { op, lhs, rhs } => self.gen_binary(expr, *op, lhs, rhs),
            ExprKind::Unary { op, operand } => self.gen_unary(expr, *op, operand),
            ExprKind::Assign { op, target, value } => {
                self.gen_assign(expr, *op, target, value)
            }
            ExprKind::Call { callee, args } => self.gen_call(expr, callee, args),
            ExprKind::Index { .. } | ExprKind::Member { .. } => {
                let target = self.resolve_target(expr)?;
                Ok(self.load_target(&target))
            }
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => self.gen_ternary(expr, cond, then_expr, else_expr),
        }
    }

    fn gen_identifier(&mut self, expr: &Expr) -> Result<Value> {
        let Some((sym_id, kind, storage)) = self.expr_symbol(expr) else {
            return Err(Error::internal(format!(
                "unresolved identifier at {}",
                expr.loc
            )));
        };
        let symbol = self.module.symbols.symbol(sym_id);

        // Folded constants (const variables, enum members)
        if let Some(value) = self.module.metadata.constant_of(expr.id) {
            if symbol.is_const || kind == SymbolKind::EnumMember {
                let ty = self.expr_type(expr);
                return Ok(self.b.emit_const(Constant {
                    value: value as i64,
                    ty,
                }));
            }
        }

        match kind {
            SymbolKind::Function => {
                let label = format!("{}.{}", self.module.program.module_name, symbol.name);
                Ok(self
                    .b
                    .emit(Opcode::FuncAddr(label), Some(IlType::Ptr), vec![], vec![])
                    .map(Value::Reg)
                    .unwrap_or(Value::Const(Constant::addr(0))))
            }
            SymbolKind::ImportedSymbol => {
                let origin = symbol.imported_from.clone().unwrap_or_default();
                let name = symbol.name.clone();
                match self.batch.globals.lookup_qualified(&origin, &name) {
                    Some(exported) if exported.kind == SymbolKind::Function => {
                        let label = format!("{}.{}", origin, name);
                        Ok(self
                            .b
                            .emit(Opcode::FuncAddr(label), Some(IlType::Ptr), vec![], vec![])
                            .map(Value::Reg)
                            .unwrap_or(Value::Const(Constant::addr(0))))
                    }
                    _ => {
                        let ty = self.expr_type(expr);
                        let global = format!("{}.{}", origin, name);
                        Ok(self.emit_load_var(global, ty))
                    }
                }
            }
            SymbolKind::MappedVariable => {
                let base = symbol.const_value.unwrap_or(0);
                Ok(self.b.emit_const(Constant::addr(base)))
            }
            _ => {
                let ty = self.expr_type(expr);
                let name = self.value_slot_name(sym_id);
                let _ = storage;
                Ok(self.emit_load_var(name, ty))
            }
        }
    }

    fn emit_load_var(&mut self, name: String, ty: IlType) -> Value {
        self.b
            .emit(Opcode::LoadVar(name), Some(ty), vec![], vec![])
            .map(Value::Reg)
            .unwrap_or(Value::Const(Constant::byte(0)))
    }

    fn gen_binary(&mut self, expr: &Expr, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Value> {
        if op.is_logical() {
            return self.gen_short_circuit(op, lhs, rhs);
        }

        let lhs_v = self.gen_expr(lhs)?;
        let rhs_v = self.gen_expr(rhs)?;
        let opcode = match op {
            BinaryOp::Add => Opcode::Add,
            BinaryOp::Sub => Opcode::Sub,
            BinaryOp::Mul => Opcode::Mul,
            BinaryOp::Div => Opcode::Div,
            BinaryOp::Mod => Opcode::Mod,
            BinaryOp::BitAnd => Opcode::And,
            BinaryOp::BitOr => Opcode::Or,
            BinaryOp::BitXor => Opcode::Xor,
            BinaryOp::Shl => Opcode::Shl,
            BinaryOp::Shr => Opcode::Shr,
            BinaryOp::Eq => Opcode::CmpEq,
            BinaryOp::Ne => Opcode::CmpNe,
            BinaryOp::Lt => Opcode::CmpLt,
            BinaryOp::Le => Opcode::CmpLe,
            BinaryOp::Gt => Opcode::CmpGt,
            BinaryOp::Ge => Opcode::CmpGe,
            BinaryOp::LogicalAnd | BinaryOp::LogicalOr => unreachable!(),
        };
        let ty = if op.is_comparison() {
            IlType::Bool
        } else {
            self.expr_type(expr)
        };
        Ok(self
            .b
            .emit(opcode, Some(ty), vec![lhs_v, rhs_v], vec![])
            .map(Value::Reg)
            .unwrap_or(lhs_v))
    }

    /// `&&` / `||` lower into branches with a phi at the merge so the
    /// right-hand side only evaluates when needed
    fn gen_short_circuit(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Value> {
        let lhs_v = self.gen_expr(lhs)?;
        let rhs_block = self.b.new_block("sc_rhs");
        let merge = self.b.new_block("sc_end");
        let lhs_end = self.b.current;

        let short_value = match op {
            BinaryOp::LogicalAnd => {
                self.b.branch(lhs_v, rhs_block, merge);
                Constant::bool(false)
            }
            _ => {
                self.b.branch(lhs_v, merge, rhs_block);
                Constant::bool(true)
            }
        };

        self.b.switch_to(rhs_block);
        let rhs_v = self.gen_expr(rhs)?;
        let rhs_end = self.b.current;
        self.b.jump(merge);

        self.b.switch_to(merge);
        Ok(self
            .b
            .emit(
                Opcode::Phi,
                Some(IlType::Bool),
                vec![Value::Const(short_value), rhs_v],
                vec![lhs_end, rhs_end],
            )
            .map(Value::Reg)
            .unwrap_or(rhs_v))
    }

    fn gen_ternary(
        &mut self,
        expr: &Expr,
        cond: &Expr,
        then_expr: &Expr,
        else_expr: &Expr,
    ) -> Result<Value> {
        let cond_v = self.gen_expr(cond)?;
        let then_block = self.b.new_block("tern_then");
        let else_block = self.b.new_block("tern_else");
        let merge = self.b.new_block("tern_end");
        self.b.branch(cond_v, then_block, else_block);

        self.b.switch_to(then_block);
        let then_v = self.gen_expr(then_expr)?;
        let then_end = self.b.current;
        self.b.jump(merge);

        self.b.switch_to(else_block);
        let else_v = self.gen_expr(else_expr)?;
        let else_end = self.b.current;
        self.b.jump(merge);

        self.b.switch_to(merge);
        let ty = self.expr_type(expr);
        Ok(self
            .b
            .emit(
                Opcode::Phi,
                Some(ty),
                vec![then_v, else_v],
                vec![then_end, else_end],
            )
            .map(Value::Reg)
            .unwrap_or(then_v))
    }

    fn gen_unary(&mut self, expr: &Expr, op: UnaryOp, operand: &Expr) -> Result<Value> {
        if op == UnaryOp::AddressOf {
            return self.gen_address_of(operand);
        }
        let v = self.gen_expr(operand)?;
        let (opcode, ty) = match op {
            UnaryOp::Neg => (Opcode::Neg, self.expr_type(expr)),
            UnaryOp::BitNot => (Opcode::Not, self.expr_type(expr)),
            UnaryOp::LogicalNot => (Opcode::LogicalNot, IlType::Bool),
            UnaryOp::AddressOf => unreachable!(),
        };
        Ok(self
            .b
            .emit(opcode, Some(ty), vec![v], vec![])
            .map(Value::Reg)
            .unwrap_or(v))
    }

    /// `@x` lowers to a constant holding the operand's static address
    fn gen_address_of(&mut self, operand: &Expr) -> Result<Value> {
        match &operand.kind {
            ExprKind::Identifier(_) => {
                let Some((sym_id, kind, _)) = self.expr_symbol(operand) else {
                    return Err(Error::internal(format!(
                        "address-of unresolved name at {}",
                        operand.loc
                    )));
                };
                let symbol = self.module.symbols.symbol(sym_id);
                match kind {
                    SymbolKind::Function => {
                        let label =
                            format!("{}.{}", self.module.program.module_name, symbol.name);
                        Ok(self
                            .b
                            .emit(Opcode::FuncAddr(label), Some(IlType::Ptr), vec![], vec![])
                            .map(Value::Reg)
                            .unwrap_or(Value::Const(Constant::addr(0))))
                    }
                    SymbolKind::MappedVariable => {
                        Ok(self.b.emit_const(Constant::addr(symbol.const_value.unwrap_or(0))))
                    }
                    _ => {
                        let module = &self.module.program.module_name;
                        match self.batch.layout.address_of(module, &symbol.name) {
                            Some(addr) => Ok(self.b.emit_const(Constant::addr(addr))),
                            None => Err(Error::internal(format!(
                                "address-of operand '{}' has no static address at {}",
                                symbol.name, operand.loc
                            ))),
                        }
                    }
                }
            }
            ExprKind::Member { .. } => {
                let target = self.resolve_target(operand)?;
                match target {
                    TargetRef::MapField(access, _) => {
                        Ok(self.b.emit_const(Constant::addr(access.base + access.offset)))
                    }
                    _ => Err(Error::internal(format!(
                        "address-of non-addressable member at {}",
                        operand.loc
                    ))),
                }
            }
            ExprKind::Index { base, index } => {
                let base_addr = self.gen_address_of(base)?;
                let index_v = self.gen_expr(index)?;
                let elem_size = self.expr_type(operand).size().max(1);
                let scaled = if elem_size > 1 {
                    let factor = Value::Const(Constant::word(elem_size as u16));
                    self.b
                        .emit(Opcode::Mul, Some(IlType::Word), vec![index_v, factor], vec![])
                        .map(Value::Reg)
                        .unwrap_or(index_v)
                } else {
                    index_v
                };
                Ok(self
                    .b
                    .emit(Opcode::Add, Some(IlType::Ptr), vec![base_addr, scaled], vec![])
                    .map(Value::Reg)
                    .unwrap_or(base_addr))
            }
            _ => Err(Error::internal(format!(
                "address-of non-lvalue at {}",
                operand.loc
            ))),
        }
    }

    fn gen_assign(
        &mut self,
        expr: &Expr,
        op: Option<BinaryOp>,
        target: &Expr,
        value: &Expr,
    ) -> Result<Value> {
        let _ = expr;
        let target_ref = self.resolve_target(target)?;

        let stored = match op {
            None => self.gen_expr(value)?,
            Some(op) => {
                // Compound assignment: the target (and any range index) is
                // evaluated exactly once.
                let current = self.load_target(&target_ref);
                let rhs = self.gen_expr(value)?;
                let opcode = match op {
                    BinaryOp::Add => Opcode::Add,
                    BinaryOp::Sub => Opcode::Sub,
                    BinaryOp::Mul => Opcode::Mul,
                    BinaryOp::Div => Opcode::Div,
                    BinaryOp::Mod => Opcode::Mod,
                    BinaryOp::BitAnd => Opcode::And,
                    BinaryOp::BitOr => Opcode::Or,
                    BinaryOp::BitXor => Opcode::Xor,
                    BinaryOp::Shl => Opcode::Shl,
                    BinaryOp::Shr => Opcode::Shr,
                    _ => Opcode::Add,
                };
                let ty = current.ty();
                self.b
                    .emit(opcode, Some(ty), vec![current, rhs], vec![])
                    .map(Value::Reg)
                    .unwrap_or(current)
            }
        };

        self.store_target(&target_ref, stored);
        Ok(stored)
    }

    fn gen_call(&mut self, expr: &Expr, callee: &Expr, args: &[Expr]) -> Result<Value> {
        // Intrinsics dispatch on the registry, bypassing symbols
        if matches!(
            self.module.metadata.get(expr.id, MetadataKey::IntrinsicCall),
            Some(MetadataValue::Flag(true))
        ) {
            if let ExprKind::Identifier(name) = &callee.kind {
                let name = name.clone();
                return self.gen_intrinsic(expr, &name, args);
            }
        }

        // Arguments evaluate left to right
        let mut arg_values = Vec::new();
        for arg in args {
            arg_values.push(self.gen_expr(arg)?);
        }

        let ret = self.expr_type(expr);
        if let ExprKind::Identifier(_) = &callee.kind {
            if let Some((sym_id, kind, _)) = self.expr_symbol(callee) {
                let symbol = self.module.symbols.symbol(sym_id);
                let direct = match kind {
                    SymbolKind::Function => Some(format!(
                        "{}.{}",
                        self.module.program.module_name, symbol.name
                    )),
                    SymbolKind::ImportedSymbol => {
                        let origin = symbol.imported_from.clone().unwrap_or_default();
                        match self.batch.globals.lookup_qualified(&origin, &symbol.name) {
                            Some(exported) if exported.kind == SymbolKind::Function => {
                                Some(format!("{}.{}", origin, symbol.name))
                            }
                            _ => None,
                        }
                    }
                    _ => None,
                };
                if let Some(label) = direct {
                    return Ok(if ret == IlType::Void {
                        self.b
                            .emit(Opcode::CallVoid(label), None, arg_values, vec![]);
                        Value::Const(Constant::byte(0))
                    } else {
                        self.b
                            .emit(Opcode::Call(label), Some(ret), arg_values, vec![])
                            .map(Value::Reg)
                            .unwrap_or(Value::Const(Constant::byte(0)))
                    });
                }
            }
        }

        // Callback value: indirect call through the target address
        let target = self.gen_expr(callee)?;
        let mut operands = vec![target];
        operands.extend(arg_values);
        Ok(if ret == IlType::Void {
            self.b.emit(Opcode::CallIndirect, None, operands, vec![]);
            Value::Const(Constant::byte(0))
        } else {
            self.b
                .emit(Opcode::CallIndirect, Some(ret), operands, vec![])
                .map(Value::Reg)
                .unwrap_or(Value::Const(Constant::byte(0)))
        })
    }

    fn gen_intrinsic(&mut self, expr: &Expr, name: &str, args: &[Expr]) -> Result<Value> {
        // Compile-time queries fold to the constant the checker computed
        if matches!(name, "length" | "sizeof") {
            let value = self.module.metadata.constant_of(expr.id).unwrap_or(0);
            return Ok(self.b.emit_const(Constant::word(value as u16)));
        }

        let mut values = Vec::new();
        for arg in args {
            values.push(self.gen_expr(arg)?);
        }

        let (op, ret, critical) = match name {
            "peek" => (Opcode::Peek, Some(IlType::Byte), false),
            "poke" => (Opcode::Poke, None, false),
            "peekw" => (Opcode::Peekw, Some(IlType::Word), false),
            "pokew" => (Opcode::Pokew, None, false),
            "lo" => (Opcode::Lo, Some(IlType::Byte), false),
            "hi" => (Opcode::Hi, Some(IlType::Byte), false),
            "pha" => (Opcode::Pha, None, true),
            "pla" => (Opcode::Pla, None, true),
            "php" => (Opcode::Php, None, true),
            "plp" => (Opcode::Plp, None, true),
            "sei" => (Opcode::Sei, None, true),
            "cli" => (Opcode::Cli, None, true),
            "nop" => (Opcode::NopOp, None, true),
            "brk" => (Opcode::Brk, None, true),
            "barrier" => (Opcode::Barrier, None, true),
            "volatile_read" => (Opcode::VolatileRead, Some(IlType::Byte), true),
            "volatile_write" => (Opcode::VolatileWrite, None, true),
            other => {
                return Err(Error::internal(format!(
                    "unknown intrinsic '{}' at {}",
                    other, expr.loc
                )))
            }
        };

        let mut meta = InstrMeta {
            raster_critical: critical,
            ..Default::default()
        };
        meta.loc = Some(expr.loc.clone());
        // The registry carries the 6502 cost of the lowered form
        if let Some(def) = crate::sema::IntrinsicRegistry::new().lookup(name) {
            meta.cycles = def.cycles;
        }
        Ok(self
            .b
            .emit_with_meta(op, ret, values, vec![], meta)
            .map(Value::Reg)
            .unwrap_or(Value::Const(Constant::byte(0))))
    }

    // =========================================================================
    // TARGETS (loads and stores share resolution so indices evaluate once)
    // =========================================================================

    fn resolve_target(&mut self, expr: &Expr) -> Result<TargetRef> {
        match &expr.kind {
            ExprKind::Identifier(_) => {
                let Some((sym_id, kind, _)) = self.expr_symbol(expr) else {
                    return Err(Error::internal(format!(
                        "unresolved assignment target at {}",
                        expr.loc
                    )));
                };
                let ty = self.expr_type(expr);
                let _ = kind;
                Ok(TargetRef::Var(self.value_slot_name(sym_id), ty))
            }
            ExprKind::Member { base, member } => {
                let access = self.mapped_access(base, member, None)?;
                let ty = self.expr_type(expr);
                Ok(TargetRef::MapField(access, ty))
            }
            ExprKind::Index { base, index } => {
                match &base.kind {
                    // Mapped range: vic.sprite_x[i]
                    ExprKind::Member {
                        base: map_base,
                        member,
                    } => {
                        let index_v = self.gen_expr(index)?;
                        let access =
                            self.mapped_access(map_base, member, Some(index))?;
                        let ty = self.expr_type(expr);
                        Ok(TargetRef::MapRange(access, index_v, ty))
                    }
                    ExprKind::Identifier(_) => {
                        let Some((sym_id, _, _)) = self.expr_symbol(base) else {
                            return Err(Error::internal(format!(
                                "unresolved array target at {}",
                                base.loc
                            )));
                        };
                        let symbol = self.module.symbols.symbol(sym_id);
                        let base_ty = symbol.ty;
                        let is_pointer = matches!(
                            base_ty.map(|t| self.batch.types.info(t).kind.clone()),
                            Some(TypeKind::Pointer(_))
                        );
                        let elem_ty = self.expr_type(expr);
                        let index_v = self.gen_expr(index)?;
                        if is_pointer {
                            let ptr = self.gen_expr(base)?;
                            let addr = self
                                .b
                                .emit(
                                    Opcode::Add,
                                    Some(IlType::Ptr),
                                    vec![ptr, index_v],
                                    vec![],
                                )
                                .map(Value::Reg)
                                .unwrap_or(ptr);
                            Ok(TargetRef::Pointer(addr, elem_ty))
                        } else {
                            Ok(TargetRef::ArrayElem {
                                name: self.array_slot_name(sym_id),
                                elem_ty,
                                index: index_v,
                            })
                        }
                    }
                    _ => Err(Error::internal(format!(
                        "unsupported index target at {}",
                        expr.loc
                    ))),
                }
            }
            _ => Err(Error::internal(format!(
                "unsupported assignment target at {}",
                expr.loc
            ))),
        }
    }

    fn load_target(&mut self, target: &TargetRef) -> Value {
        match target {
            TargetRef::Var(name, ty) => self.emit_load_var(name.clone(), *ty),
            TargetRef::ArrayElem {
                name,
                elem_ty,
                index,
            } => self
                .b
                .emit(
                    Opcode::LoadArray(name.clone()),
                    Some(*elem_ty),
                    vec![*index],
                    vec![],
                )
                .map(Value::Reg)
                .unwrap_or(Value::Const(Constant::byte(0))),
            TargetRef::MapField(access, ty) => {
                let meta = self.mapped_meta(access.clone());
                self.b
                    .emit_with_meta(Opcode::MapLoadField, Some(*ty), vec![], vec![], meta)
                    .map(Value::Reg)
                    .unwrap_or(Value::Const(Constant::byte(0)))
            }
            TargetRef::MapRange(access, index, ty) => {
                let meta = self.mapped_meta(access.clone());
                self.b
                    .emit_with_meta(Opcode::MapLoadRange, Some(*ty), vec![*index], vec![], meta)
                    .map(Value::Reg)
                    .unwrap_or(Value::Const(Constant::byte(0)))
            }
            TargetRef::Pointer(addr, ty) => {
                let op = if ty.size() == 2 {
                    Opcode::Peekw
                } else {
                    Opcode::Peek
                };
                self.b
                    .emit(op, Some(*ty), vec![*addr], vec![])
                    .map(Value::Reg)
                    .unwrap_or(Value::Const(Constant::byte(0)))
            }
        }
    }

    fn store_target(&mut self, target: &TargetRef, value: Value) {
        match target {
            TargetRef::Var(name, _) => {
                self.b
                    .emit(Opcode::StoreVar(name.clone()), None, vec![value], vec![]);
            }
            TargetRef::ArrayElem { name, index, .. } => {
                self.b.emit(
                    Opcode::StoreArray(name.clone()),
                    None,
                    vec![*index, value],
                    vec![],
                );
            }
            TargetRef::MapField(access, _) => {
                let meta = self.mapped_meta(access.clone());
                self.b
                    .emit_with_meta(Opcode::MapStoreField, None, vec![value], vec![], meta);
            }
            TargetRef::MapRange(access, index, _) => {
                let meta = self.mapped_meta(access.clone());
                self.b.emit_with_meta(
                    Opcode::MapStoreRange,
                    None,
                    vec![*index, value],
                    vec![],
                    meta,
                );
            }
            TargetRef::Pointer(addr, ty) => {
                let op = if ty.size() == 2 {
                    Opcode::Pokew
                } else {
                    Opcode::Poke
                };
                self.b.emit(op, None, vec![*addr, value], vec![]);
            }
        }
    }

    fn mapped_access(
        &mut self,
        base: &Expr,
        member: &str,
        _range_index: Option<&Expr>,
    ) -> Result<MappedAccess> {
        let Some((sym_id, kind, _)) = self.expr_symbol(base) else {
            return Err(Error::internal(format!(
                "unresolved mapped struct at {}",
                base.loc
            )));
        };
        if kind != SymbolKind::MappedVariable {
            return Err(Error::internal(format!(
                "member access on non-mapped symbol at {}",
                base.loc
            )));
        }
        let symbol = self.module.symbols.symbol(sym_id);
        let mapped = self
            .module
            .symbols
            .mapped
            .get(&sym_id)
            .ok_or_else(|| Error::internal("mapped struct without layout"))?;
        let field = mapped
            .field(member)
            .ok_or_else(|| Error::internal(format!("unknown mapped field '{}'", member)))?;
        Ok(MappedAccess {
            struct_name: symbol.name.clone(),
            field: field.name.clone(),
            base: mapped.base,
            offset: field.offset,
            range: field.len,
        })
    }

    fn mapped_meta(&self, mapped: MappedAccess) -> InstrMeta {
        InstrMeta {
            loc: self.b.current_loc.clone(),
            mapped: Some(mapped),
            addressing: Some(super::instruction::AddressingHint::Absolute),
            ..Default::default()
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    /// Symbol behind a name reference (id, kind, storage)
    fn expr_symbol(&self, expr: &Expr) -> Option<(SymbolId, SymbolKind, StorageClass)> {
        let raw = self.module.metadata.symbol_of(expr.id)?;
        let id = SymbolId(raw);
        let symbol = self.module.symbols.symbol(id);
        Some((id, symbol.kind, symbol.storage))
    }

    /// IL slot name for a scalar symbol: module-level symbols use the
    /// global `module.name`, locals a `name%id` slot
    fn value_slot_name(&self, sym_id: SymbolId) -> String {
        let symbol = self.module.symbols.symbol(sym_id);
        if symbol.scope == self.module.symbols.module_scope {
            format!("{}.{}", self.module.program.module_name, symbol.name)
        } else {
            local_name(&symbol.name, sym_id)
        }
    }

    /// IL global name for an array symbol
    fn array_slot_name(&self, sym_id: SymbolId) -> String {
        let symbol = self.module.symbols.symbol(sym_id);
        if symbol.scope == self.module.symbols.module_scope {
            format!("{}.{}", self.module.program.module_name, symbol.name)
        } else {
            self.local_array_name(&symbol.name, sym_id)
        }
    }

    fn local_array_name(&self, name: &str, sym_id: SymbolId) -> String {
        format!(
            "{}.{}.{}%{}",
            self.module.program.module_name, self.b.func.name, name, sym_id.0
        )
    }

    /// IL type of an expression from the checker's annotation
    fn expr_type(&self, expr: &Expr) -> IlType {
        self.module
            .metadata
            .type_of(expr.id)
            .map(|raw| il_type_of(self.batch, crate::sema::TypeId(raw)))
            .unwrap_or(IlType::Byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sema::analyze_sources;

    fn generate(source: &str) -> Vec<IlModule> {
        let analysis = analyze_sources(&[("t.bl65", source)]);
        assert!(
            !analysis.has_errors(),
            "analysis failed: {:?}",
            analysis.diags.diagnostics()
        );
        IlGenerator::new(&analysis).generate().unwrap()
    }

    fn find_ops(func: &IlFunction) -> Vec<&'static str> {
        func.blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .map(|i| i.op.name())
            .collect()
    }

    #[test]
    fn test_byte_arithmetic() {
        let modules = generate(
            "export function main()\n  let x: byte = 2 + 3\n  poke($d020, x)\nend function\n",
        );
        let func = modules[0].function("main").unwrap();
        let ops = find_ops(func);
        assert!(ops.contains(&"const"));
        assert!(ops.contains(&"add"));
        assert!(ops.contains(&"store_var"));
        assert!(ops.contains(&"poke"));
    }

    #[test]
    fn test_short_circuit_lowering() {
        let modules = generate(
            "export function main()\n  let a: boolean = true\n  let b: boolean = false\n  if a && b then\n    poke($d020, 1)\n  end if\nend function\n",
        );
        let func = modules[0].function("main").unwrap();
        let ops = find_ops(func);
        assert!(ops.contains(&"phi"));
        assert!(ops.contains(&"branch"));
    }

    #[test]
    fn test_for_canonical_form() {
        let modules = generate(
            "export function main()\n  for i = 0 to 9\n    poke($d020, i)\n  next\nend function\n",
        );
        let func = modules[0].function("main").unwrap();
        let ops = find_ops(func);
        assert!(ops.contains(&"cmp_le"));
        assert!(ops.contains(&"add"));
        // X/Y candidate hint lands on the induction variable accesses
        let hinted = func
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .any(|i| i.meta.preferred_reg == Some(CpuReg::X));
        assert!(hinted);
    }

    #[test]
    fn test_call_vs_call_void() {
        let modules = generate(
            "function g(): byte\n  return 42\nend function\nfunction h()\n  nop()\nend function\nexport function main()\n  let x: byte = g()\n  h()\n  poke($d020, x)\nend function\n",
        );
        let func = modules[0].function("main").unwrap();
        let ops = find_ops(func);
        assert!(ops.contains(&"call"));
        assert!(ops.contains(&"call_void"));
    }

    #[test]
    fn test_map_store_field_carries_structure() {
        let modules = generate(
            "@map vic at $d000\n  border: byte at $20\nend map\nexport function main()\n  vic.border = 0\nend function\n",
        );
        let func = modules[0].function("main").unwrap();
        let store = func
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .find(|i| i.op == Opcode::MapStoreField)
            .expect("map store missing");
        let mapped = store.meta.mapped.as_ref().unwrap();
        assert_eq!(mapped.base, 0xD000);
        assert_eq!(mapped.offset, 0x20);
        assert_eq!(mapped.struct_name, "vic");
    }

    #[test]
    fn test_barrier_is_raster_critical() {
        let modules = generate(
            "@map vic at $d000\n  border: byte at $20\nend map\nexport function main()\n  vic.border = 0\n  barrier()\n  vic.border = 1\nend function\n",
        );
        let func = modules[0].function("main").unwrap();
        let barrier = func
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .find(|i| i.op == Opcode::Barrier)
            .expect("barrier missing");
        assert!(barrier.meta.raster_critical);
    }

    #[test]
    fn test_length_folds_to_const() {
        let modules = generate(
            "export function main()\n  let n: word = length(\"hello\")\n  pokew($0400, n)\nend function\n",
        );
        let func = modules[0].function("main").unwrap();
        let has_const_5 = func
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .any(|i| {
                i.op == Opcode::Const
                    && i.operands
                        .first()
                        .and_then(|v| v.as_const())
                        .map(|c| c.value == 5)
                        .unwrap_or(false)
            });
        assert!(has_const_5);
    }

    #[test]
    fn test_globals_with_initializers() {
        let modules = generate(
            "let colors: byte[] = [2, 5, 6]\nexport function main()\n  poke($d020, colors[0])\nend function\n",
        );
        let global = modules[0]
            .globals
            .iter()
            .find(|g| g.name == "global.colors")
            .unwrap();
        assert_eq!(global.size, 3);
        assert_eq!(global.init, GlobalInit::Bytes(vec![2, 5, 6]));
        assert!(global.address.is_some());
    }

    #[test]
    fn test_return_funnels_through_exit() {
        let modules = generate(
            "export function main(): byte\n  return 1\nend function\n",
        );
        let func = modules[0].function("main").unwrap();
        let entry = func.block(func.entry);
        assert!(entry.successors.contains(&func.exit));
    }
}
