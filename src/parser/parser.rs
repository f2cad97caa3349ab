//! Parser for Blend65
//!
//! Recursive descent over declarations and statements; expressions use
//! Pratt precedence climbing over 13 levels (assignment at the bottom,
//! postfix call/index/member at the top). Syntax errors are reported into
//! the diagnostic bag and the parser synchronizes to the next statement
//! boundary, so one bad token never hides the rest of the file.

use super::ast::*;
use crate::diagnostics::{DiagnosticBag, DiagnosticCode};
use crate::lexer::{Token, TokenKind};
use crate::source::SourceLocation;

/// Parser over one token stream
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    file: String,
    next_node: u32,
    diags: DiagnosticBag,
}

impl Parser {
    /// Creates a parser for a scanned file
    pub fn new(tokens: Vec<Token>, file: &str) -> Self {
        Parser {
            tokens,
            current: 0,
            file: file.to_string(),
            next_node: 0,
            diags: DiagnosticBag::new(),
        }
    }

    /// Parses the whole file into a [`Program`], returning the accumulated
    /// diagnostics alongside
    pub fn parse(mut self) -> (Program, DiagnosticBag) {
        let start_loc = self.peek_loc();
        let mut module_name = "global".to_string();
        let mut implicit_module = true;

        self.skip_separators();

        // Optional module header, only at file head
        if self.check(&TokenKind::Module) {
            self.advance();
            if let Some(path) = self.parse_module_path() {
                module_name = path;
                implicit_module = false;
            }
            self.end_statement();
        }

        let mut imports = Vec::new();
        let mut decls: Vec<Decl> = Vec::new();

        while !self.is_at_end() {
            self.skip_separators();
            if self.is_at_end() {
                break;
            }

            match self.peek_kind().clone() {
                TokenKind::Module => {
                    let loc = self.peek_loc();
                    self.advance();
                    let code = if implicit_module {
                        DiagnosticCode::ModuleAfterImplicit
                    } else {
                        DiagnosticCode::DuplicateModule
                    };
                    self.diags.error(
                        code,
                        "'module' is only allowed once, at the start of the file",
                        loc,
                    );
                    let _ = self.parse_module_path();
                    self.synchronize();
                }
                TokenKind::Import => {
                    if let Some(import) = self.parse_import() {
                        if !decls.is_empty() {
                            self.diags.error(
                                DiagnosticCode::DeclarationAfterCode,
                                "import declarations must precede other declarations",
                                import.loc.clone(),
                            );
                        }
                        imports.push(import);
                    }
                }
                TokenKind::Export => {
                    self.advance();
                    if self.check(&TokenKind::Import) {
                        let loc = self.peek_loc();
                        self.diags.error(
                            DiagnosticCode::ReexportNotSupported,
                            "re-exporting imports is not supported",
                            loc,
                        );
                        self.advance();
                        self.synchronize();
                        continue;
                    }
                    if let Some(decl) = self.parse_declaration(true) {
                        decls.push(decl);
                    } else {
                        let loc = self.peek_loc();
                        self.diags.error(
                            DiagnosticCode::ExportRequiresDeclaration,
                            "'export' must be followed by a declaration",
                            loc,
                        );
                        self.synchronize();
                    }
                }
                _ => {
                    let before = self.current;
                    if let Some(decl) = self.parse_declaration(false) {
                        decls.push(decl);
                    } else if !self.is_at_end() {
                        // Executable code at module scope is rejected, but
                        // parsed anyway so recovery stays on track.
                        let loc = self.peek_loc();
                        self.diags.error(
                            DiagnosticCode::ExecutableAtModuleScope,
                            "only declarations are allowed at module scope",
                            loc,
                        );
                        if self.parse_statement().is_none() {
                            self.synchronize();
                        }
                    }
                    if self.current == before && !self.is_at_end() {
                        self.advance();
                    }
                }
            }
        }

        let program = Program {
            module_name,
            implicit_module,
            file: self.file.clone(),
            imports,
            decls,
            loc: start_loc,
        };
        (program, self.diags)
    }

    // =========================================================================
    // DECLARATIONS
    // =========================================================================

    /// Parses one declaration, or returns `None` when the next token does
    /// not start a declaration (leaving it unconsumed)
    fn parse_declaration(&mut self, exported: bool) -> Option<Decl> {
        match self.peek_kind().clone() {
            TokenKind::Function => self.parse_function(exported).map(Decl::Function),
            TokenKind::Let | TokenKind::Const => self.parse_var_decl(exported).map(Decl::Variable),
            TokenKind::Type => self.parse_type_alias(exported).map(Decl::TypeAlias),
            TokenKind::Enum => self.parse_enum(exported).map(Decl::Enum),
            TokenKind::At if self.peek_is_map_intro() => {
                self.parse_memory_map(exported).map(Decl::MemoryMap)
            }
            _ => None,
        }
    }

    fn peek_is_map_intro(&self) -> bool {
        matches!(
            self.peek_kind_at(1),
            Some(TokenKind::Identifier(name)) if name == "map"
        )
    }

    fn parse_function(&mut self, exported: bool) -> Option<FunctionDecl> {
        let start = self.peek_loc();
        self.advance(); // function

        let name = self.expect_identifier("function name")?;
        self.expect(&TokenKind::LeftParen, "'('")?;

        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                self.skip_newlines();
                let ploc = self.peek_loc();
                let pname = self.expect_identifier("parameter name")?;
                self.expect(&TokenKind::Colon, "':'")?;
                let pty = self.parse_type_expr()?;
                params.push(Param {
                    id: self.fresh_id(),
                    name: pname,
                    ty: pty,
                    loc: ploc,
                });
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RightParen, "')'")?;

        let ret = if self.match_token(&TokenKind::Colon) {
            Some(self.parse_type_expr()?)
        } else {
            None
        };
        self.end_statement();

        let body = self.parse_block(&[TokenKind::End]);
        self.expect_block_end(TokenKind::Function, "function");

        let is_stub = body.is_empty();
        Some(FunctionDecl {
            id: self.fresh_id(),
            name,
            params,
            ret,
            body,
            exported,
            is_stub,
            loc: start,
        })
    }

    fn parse_var_decl(&mut self, exported: bool) -> Option<VarDecl> {
        let start = self.peek_loc();
        let is_const = self.check(&TokenKind::Const);
        self.advance(); // let | const

        let name = self.expect_identifier("variable name")?;

        let ty = if self.match_token(&TokenKind::Colon) {
            Some(self.parse_type_expr()?)
        } else {
            None
        };

        // Storage attribute: @zeropage / @ram / @data
        let storage = if self.check(&TokenKind::At) {
            self.advance();
            let loc = self.peek_loc();
            match self.expect_identifier("storage class")?.as_str() {
                "zeropage" => Some(StorageAttr::ZeroPage),
                "ram" => Some(StorageAttr::Ram),
                "data" => Some(StorageAttr::Data),
                other => {
                    self.diags.error(
                        DiagnosticCode::UnexpectedToken,
                        format!(
                            "Unknown storage class '@{}' (expected zeropage, ram, or data)",
                            other
                        ),
                        loc,
                    );
                    None
                }
            }
        } else {
            None
        };

        let init = if self.match_token(&TokenKind::Assign) {
            Some(self.parse_expression()?)
        } else {
            None
        };

        if is_const && init.is_none() {
            self.diags.error(
                DiagnosticCode::MissingConstInitializer,
                format!("Constant '{}' must have an initializer", name),
                start.clone(),
            );
        }
        self.end_statement();

        Some(VarDecl {
            id: self.fresh_id(),
            name,
            ty,
            init,
            is_const,
            storage,
            exported,
            loc: start,
        })
    }

    fn parse_type_alias(&mut self, exported: bool) -> Option<TypeAliasDecl> {
        let start = self.peek_loc();
        self.advance(); // type
        let name = self.expect_identifier("type alias name")?;
        self.expect(&TokenKind::Assign, "'='")?;
        let ty = self.parse_type_expr()?;
        self.end_statement();
        Some(TypeAliasDecl {
            id: self.fresh_id(),
            name,
            ty,
            exported,
            loc: start,
        })
    }

    fn parse_enum(&mut self, exported: bool) -> Option<EnumDecl> {
        let start = self.peek_loc();
        self.advance(); // enum
        let name = self.expect_identifier("enum name")?;
        self.end_statement();

        let mut members = Vec::new();
        loop {
            self.skip_separators();
            if self.check(&TokenKind::End) || self.is_at_end() {
                break;
            }
            let mloc = self.peek_loc();
            let Some(mname) = self.expect_identifier("enum member name") else {
                self.synchronize();
                continue;
            };
            let value = if self.match_token(&TokenKind::Assign) {
                match self.peek_kind().clone() {
                    TokenKind::Number(n) => {
                        self.advance();
                        Some(n)
                    }
                    _ => {
                        let loc = self.peek_loc();
                        self.diags.error(
                            DiagnosticCode::ExpectedToken,
                            "Enum member value must be an integer literal",
                            loc,
                        );
                        None
                    }
                }
            } else {
                None
            };
            members.push(EnumMember {
                id: self.fresh_id(),
                name: mname,
                value,
                loc: mloc,
            });
            self.end_statement();
        }
        self.expect_block_end(TokenKind::Enum, "enum");

        Some(EnumDecl {
            id: self.fresh_id(),
            name,
            members,
            exported,
            loc: start,
        })
    }

    fn parse_memory_map(&mut self, exported: bool) -> Option<MemoryMapDecl> {
        let start = self.peek_loc();
        self.advance(); // @
        self.advance(); // map (contextual)

        let name = self.expect_identifier("memory map name")?;
        self.expect_contextual("at")?;

        let base = match self.peek_kind().clone() {
            TokenKind::Number(n) => {
                self.advance();
                n
            }
            _ => {
                let loc = self.peek_loc();
                self.diags.error(
                    DiagnosticCode::InvalidMemoryMapScope,
                    "Memory map base must be a constant address",
                    loc,
                );
                0
            }
        };
        self.end_statement();

        let mut fields = Vec::new();
        loop {
            self.skip_separators();
            if self.check(&TokenKind::End) || self.is_at_end() {
                break;
            }
            let floc = self.peek_loc();
            let Some(fname) = self.expect_identifier("field name") else {
                self.synchronize();
                continue;
            };
            if self.expect(&TokenKind::Colon, "':'").is_none() {
                self.synchronize();
                continue;
            }
            let Some(fty) = self.parse_type_expr() else {
                self.synchronize();
                continue;
            };
            let offset = if self.check_contextual("at") {
                self.advance();
                match self.peek_kind().clone() {
                    TokenKind::Number(n) => {
                        self.advance();
                        Some(n)
                    }
                    _ => {
                        let loc = self.peek_loc();
                        self.diags.error(
                            DiagnosticCode::ExpectedToken,
                            "Field offset must be an integer literal",
                            loc,
                        );
                        None
                    }
                }
            } else {
                None
            };
            fields.push(MapField {
                id: self.fresh_id(),
                name: fname,
                ty: fty,
                offset,
                loc: floc,
            });
            self.end_statement();
        }
        self.expect_block_end_contextual("map");

        Some(MemoryMapDecl {
            id: self.fresh_id(),
            name,
            base,
            fields,
            exported,
            loc: start,
        })
    }

    // =========================================================================
    // TYPES
    // =========================================================================

    fn parse_type_expr(&mut self) -> Option<TypeExpr> {
        let loc = self.peek_loc();
        let mut base = match self.peek_kind().clone() {
            TokenKind::Star => {
                self.advance();
                let inner = self.parse_type_expr()?;
                return Some(TypeExpr {
                    kind: TypeExprKind::Pointer(Box::new(inner)),
                    loc,
                });
            }
            TokenKind::Callback => {
                self.advance();
                self.expect(&TokenKind::LeftParen, "'('")?;
                let mut params = Vec::new();
                if !self.check(&TokenKind::RightParen) {
                    loop {
                        params.push(self.parse_type_expr()?);
                        if !self.match_token(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RightParen, "')'")?;
                let ret = if self.match_token(&TokenKind::Colon) {
                    Some(Box::new(self.parse_type_expr()?))
                } else {
                    None
                };
                TypeExpr {
                    kind: TypeExprKind::Callback(params, ret),
                    loc: loc.clone(),
                }
            }
            TokenKind::Identifier(name) => {
                self.advance();
                TypeExpr {
                    kind: TypeExprKind::Named(name),
                    loc: loc.clone(),
                }
            }
            other => {
                self.diags.error(
                    DiagnosticCode::ExpectedToken,
                    format!("Expected type, got '{}'", other),
                    loc,
                );
                return None;
            }
        };

        // Array suffixes: T[N] or T[] (size inferred)
        while self.check(&TokenKind::LeftBracket) {
            self.advance();
            let size = match self.peek_kind().clone() {
                TokenKind::RightBracket => None,
                TokenKind::Number(n) => {
                    self.advance();
                    Some(n)
                }
                other => {
                    let loc = self.peek_loc();
                    self.diags.error(
                        DiagnosticCode::ExpectedToken,
                        format!("Array size must be an integer literal, got '{}'", other),
                        loc,
                    );
                    None
                }
            };
            self.expect(&TokenKind::RightBracket, "']'")?;
            let arr_loc = base.loc.clone();
            base = TypeExpr {
                kind: TypeExprKind::Array(Box::new(base), size),
                loc: arr_loc,
            };
        }

        Some(base)
    }

    // =========================================================================
    // STATEMENTS
    // =========================================================================

    /// Parses statements until one of `terminators` (or `else`/`case`/
    /// `default`, which callers handle) is at the front
    fn parse_block(&mut self, terminators: &[TokenKind]) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        loop {
            self.skip_separators();
            if self.is_at_end() {
                let loc = self.peek_loc();
                self.diags.error(
                    DiagnosticCode::UnterminatedBlock,
                    "Block is never closed before end of file",
                    loc,
                );
                break;
            }
            let kind = self.peek_kind();
            if terminators.iter().any(|t| t == kind)
                || matches!(
                    kind,
                    TokenKind::Else | TokenKind::Case | TokenKind::Default | TokenKind::Next
                )
            {
                break;
            }
            let before = self.current;
            match self.parse_statement() {
                Some(stmt) => stmts.push(stmt),
                None => {
                    self.synchronize();
                    // Guarantee progress even when the bad token is itself
                    // a synchronization point.
                    if self.current == before && !self.is_at_end() {
                        self.advance();
                    }
                }
            }
        }
        stmts
    }

    fn parse_statement(&mut self) -> Option<Stmt> {
        let loc = self.peek_loc();
        let kind = match self.peek_kind().clone() {
            TokenKind::Let | TokenKind::Const => {
                let decl = self.parse_var_decl(false)?;
                StmtKind::Let(decl)
            }
            TokenKind::If => return self.parse_if(),
            TokenKind::While => return self.parse_while(),
            TokenKind::For => return self.parse_for(),
            TokenKind::Match => return self.parse_match(),
            TokenKind::Break => {
                self.advance();
                self.end_statement();
                StmtKind::Break
            }
            TokenKind::Continue => {
                self.advance();
                self.end_statement();
                StmtKind::Continue
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.at_statement_end() {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.end_statement();
                StmtKind::Return(value)
            }
            TokenKind::Asm => return self.parse_asm(),
            TokenKind::At if self.peek_is_map_intro() => {
                self.diags.error(
                    DiagnosticCode::InvalidMemoryMapScope,
                    "@map declarations are only allowed at module scope",
                    loc.clone(),
                );
                let _ = self.parse_memory_map(false);
                return None;
            }
            _ => {
                let expr = self.parse_expression()?;
                self.end_statement();
                StmtKind::Expression(expr)
            }
        };
        Some(Stmt {
            id: self.fresh_id(),
            kind,
            loc,
        })
    }

    fn parse_if(&mut self) -> Option<Stmt> {
        let loc = self.peek_loc();
        self.advance(); // if
        let cond = self.parse_expression()?;
        self.expect(&TokenKind::Then, "'then'")?;
        self.end_statement();

        let then_body = self.parse_block(&[TokenKind::End]);

        let else_body = if self.check(&TokenKind::Else) {
            self.advance();
            if self.check(&TokenKind::If) {
                // else-if chains nest as a single-statement else body
                let nested = self.parse_if()?;
                return Some(Stmt {
                    id: self.fresh_id(),
                    kind: StmtKind::If {
                        cond,
                        then_body,
                        else_body: Some(vec![nested]),
                    },
                    loc,
                });
            }
            self.end_statement();
            Some(self.parse_block(&[TokenKind::End]))
        } else {
            None
        };

        self.expect_block_end(TokenKind::If, "if");
        Some(Stmt {
            id: self.fresh_id(),
            kind: StmtKind::If {
                cond,
                then_body,
                else_body,
            },
            loc,
        })
    }

    fn parse_while(&mut self) -> Option<Stmt> {
        let loc = self.peek_loc();
        self.advance(); // while
        let cond = self.parse_expression()?;
        self.end_statement();
        let body = self.parse_block(&[TokenKind::End]);
        self.expect_block_end(TokenKind::While, "while");
        Some(Stmt {
            id: self.fresh_id(),
            kind: StmtKind::While { cond, body },
            loc,
        })
    }

    fn parse_for(&mut self) -> Option<Stmt> {
        let loc = self.peek_loc();
        self.advance(); // for
        let var = self.expect_identifier("loop variable")?;
        let var_id = self.fresh_id();
        self.expect(&TokenKind::Assign, "'='")?;
        let from = self.parse_expression()?;
        self.expect(&TokenKind::To, "'to'")?;
        let to = self.parse_expression()?;
        let step = if self.match_token(&TokenKind::Step) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.end_statement();

        let body = self.parse_block(&[TokenKind::Next]);
        if self.check(&TokenKind::Next) {
            self.advance();
            self.end_statement();
        } else {
            let loc = self.peek_loc();
            self.diags.error(
                DiagnosticCode::MissingEndKeyword,
                "Expected 'next' to close for loop",
                loc,
            );
        }

        Some(Stmt {
            id: self.fresh_id(),
            kind: StmtKind::For {
                var,
                var_id,
                from,
                to,
                step,
                body,
            },
            loc,
        })
    }

    fn parse_match(&mut self) -> Option<Stmt> {
        let loc = self.peek_loc();
        self.advance(); // match
        let scrutinee = self.parse_expression()?;
        self.end_statement();

        let mut cases = Vec::new();
        let mut default = None;
        loop {
            self.skip_separators();
            match self.peek_kind().clone() {
                TokenKind::Case => {
                    let cloc = self.peek_loc();
                    self.advance();
                    let value = self.parse_expression()?;
                    self.end_statement();
                    let body = self.parse_block(&[TokenKind::End]);
                    cases.push(MatchCase {
                        value,
                        body,
                        loc: cloc,
                    });
                }
                TokenKind::Default => {
                    self.advance();
                    self.end_statement();
                    default = Some(self.parse_block(&[TokenKind::End]));
                }
                TokenKind::End => break,
                _ => {
                    if self.is_at_end() {
                        let loc = self.peek_loc();
                        self.diags.error(
                            DiagnosticCode::UnterminatedBlock,
                            "match statement is never closed",
                            loc,
                        );
                        break;
                    }
                    let loc = self.peek_loc();
                    self.diags.error(
                        DiagnosticCode::UnexpectedToken,
                        format!("Expected 'case', 'default', or 'end', got '{}'", self.peek_kind()),
                        loc,
                    );
                    self.synchronize();
                }
            }
        }
        self.expect_block_end(TokenKind::Match, "match");

        Some(Stmt {
            id: self.fresh_id(),
            kind: StmtKind::Match {
                scrutinee,
                cases,
                default,
            },
            loc,
        })
    }

    fn parse_asm(&mut self) -> Option<Stmt> {
        let loc = self.peek_loc();
        self.advance(); // asm

        let body = match self.peek_kind().clone() {
            TokenKind::AsmBody(text) => {
                self.advance();
                text
            }
            _ => String::new(),
        };
        self.expect_block_end(TokenKind::Asm, "asm");

        Some(Stmt {
            id: self.fresh_id(),
            kind: StmtKind::Asm(body),
            loc,
        })
    }

    // =========================================================================
    // EXPRESSIONS (Pratt)
    // =========================================================================

    /// Entry point: assignment level (right-associative)
    fn parse_expression(&mut self) -> Option<Expr> {
        let lhs = self.parse_ternary()?;

        let compound = match self.peek_kind() {
            TokenKind::Assign => Some(None),
            TokenKind::PlusAssign => Some(Some(BinaryOp::Add)),
            TokenKind::MinusAssign => Some(Some(BinaryOp::Sub)),
            TokenKind::StarAssign => Some(Some(BinaryOp::Mul)),
            TokenKind::SlashAssign => Some(Some(BinaryOp::Div)),
            TokenKind::PercentAssign => Some(Some(BinaryOp::Mod)),
            TokenKind::AmpAssign => Some(Some(BinaryOp::BitAnd)),
            TokenKind::PipeAssign => Some(Some(BinaryOp::BitOr)),
            TokenKind::CaretAssign => Some(Some(BinaryOp::BitXor)),
            TokenKind::ShlAssign => Some(Some(BinaryOp::Shl)),
            TokenKind::ShrAssign => Some(Some(BinaryOp::Shr)),
            _ => None,
        };

        if let Some(op) = compound {
            let loc = lhs.loc.clone();
            self.advance();
            if !matches!(
                lhs.kind,
                ExprKind::Identifier(_) | ExprKind::Index { .. } | ExprKind::Member { .. }
            ) {
                self.diags.error(
                    DiagnosticCode::UnexpectedToken,
                    "Invalid assignment target",
                    loc.clone(),
                );
            }
            let value = self.parse_expression()?; // right-assoc
            return Some(Expr {
                id: self.fresh_id(),
                kind: ExprKind::Assign {
                    op,
                    target: Box::new(lhs),
                    value: Box::new(value),
                },
                loc,
            });
        }

        Some(lhs)
    }

    fn parse_ternary(&mut self) -> Option<Expr> {
        let cond = self.parse_binary(0)?;
        if self.match_token(&TokenKind::Question) {
            let loc = cond.loc.clone();
            let then_expr = self.parse_ternary()?;
            self.expect(&TokenKind::Colon, "':'")?;
            let else_expr = self.parse_ternary()?;
            return Some(Expr {
                id: self.fresh_id(),
                kind: ExprKind::Ternary {
                    cond: Box::new(cond),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(else_expr),
                },
                loc,
            });
        }
        Some(cond)
    }

    /// Binding power of an infix operator token, or `None`
    fn infix_binding(kind: &TokenKind) -> Option<(u8, BinaryOp)> {
        let entry = match kind {
            TokenKind::PipePipe | TokenKind::Or => (1, BinaryOp::LogicalOr),
            TokenKind::AmpAmp | TokenKind::And => (2, BinaryOp::LogicalAnd),
            TokenKind::Pipe => (3, BinaryOp::BitOr),
            TokenKind::Caret => (4, BinaryOp::BitXor),
            TokenKind::Amp => (5, BinaryOp::BitAnd),
            TokenKind::EqEq => (6, BinaryOp::Eq),
            TokenKind::NotEq => (6, BinaryOp::Ne),
            TokenKind::Lt => (7, BinaryOp::Lt),
            TokenKind::LtEq => (7, BinaryOp::Le),
            TokenKind::Gt => (7, BinaryOp::Gt),
            TokenKind::GtEq => (7, BinaryOp::Ge),
            TokenKind::Shl => (8, BinaryOp::Shl),
            TokenKind::Shr => (8, BinaryOp::Shr),
            TokenKind::Plus => (9, BinaryOp::Add),
            TokenKind::Minus => (9, BinaryOp::Sub),
            TokenKind::Star => (10, BinaryOp::Mul),
            TokenKind::Slash => (10, BinaryOp::Div),
            TokenKind::Percent => (10, BinaryOp::Mod),
            _ => return None,
        };
        Some(entry)
    }

    /// Precedence-climbing over the binary levels; all left-associative
    fn parse_binary(&mut self, min_bp: u8) -> Option<Expr> {
        let mut lhs = self.parse_unary()?;

        while let Some((bp, op)) = Self::infix_binding(self.peek_kind()) {
            if bp < min_bp {
                break;
            }
            self.advance();
            let rhs = self.parse_binary(bp + 1)?;
            let loc = lhs.loc.merge(&rhs.loc);
            lhs = Expr {
                id: self.fresh_id(),
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                loc,
            };
        }
        Some(lhs)
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        let loc = self.peek_loc();
        let op = match self.peek_kind() {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang | TokenKind::Not => Some(UnaryOp::LogicalNot),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            TokenKind::At => Some(UnaryOp::AddressOf),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Some(Expr {
                id: self.fresh_id(),
                kind: ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                loc,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Option<Expr> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.peek_kind() {
                TokenKind::LeftParen => {
                    self.advance();
                    let mut args = Vec::new();
                    self.skip_newlines();
                    if !self.check(&TokenKind::RightParen) {
                        loop {
                            args.push(self.parse_expression()?);
                            self.skip_newlines();
                            if !self.match_token(&TokenKind::Comma) {
                                break;
                            }
                            self.skip_newlines();
                        }
                    }
                    self.expect(&TokenKind::RightParen, "')'")?;
                    let loc = expr.loc.clone();
                    expr = Expr {
                        id: self.fresh_id(),
                        kind: ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        loc,
                    };
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(&TokenKind::RightBracket, "']'")?;
                    let loc = expr.loc.clone();
                    expr = Expr {
                        id: self.fresh_id(),
                        kind: ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                        loc,
                    };
                }
                TokenKind::Dot => {
                    self.advance();
                    let member = self.expect_identifier("member name")?;
                    let loc = expr.loc.clone();
                    expr = Expr {
                        id: self.fresh_id(),
                        kind: ExprKind::Member {
                            base: Box::new(expr),
                            member,
                        },
                        loc,
                    };
                }
                _ => break,
            }
        }
        Some(expr)
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        let loc = self.peek_loc();
        let kind = match self.peek_kind().clone() {
            TokenKind::Number(n) => {
                self.advance();
                ExprKind::Number(n)
            }
            TokenKind::Str(s) => {
                self.advance();
                ExprKind::Str(s)
            }
            TokenKind::True => {
                self.advance();
                ExprKind::Bool(true)
            }
            TokenKind::False => {
                self.advance();
                ExprKind::Bool(false)
            }
            TokenKind::Identifier(name) => {
                self.advance();
                ExprKind::Identifier(name)
            }
            TokenKind::LeftParen => {
                self.advance();
                self.skip_newlines();
                let inner = self.parse_expression()?;
                self.skip_newlines();
                self.expect(&TokenKind::RightParen, "')'")?;
                return Some(inner);
            }
            TokenKind::LeftBracket => {
                self.advance();
                let mut elements = Vec::new();
                self.skip_newlines();
                if !self.check(&TokenKind::RightBracket) {
                    loop {
                        elements.push(self.parse_expression()?);
                        self.skip_newlines();
                        if !self.match_token(&TokenKind::Comma) {
                            break;
                        }
                        self.skip_newlines();
                    }
                }
                self.expect(&TokenKind::RightBracket, "']'")?;
                ExprKind::ArrayLiteral(elements)
            }
            other => {
                self.diags.error(
                    DiagnosticCode::UnexpectedToken,
                    format!("Unexpected token '{}'", other),
                    loc,
                );
                return None;
            }
        };
        Some(Expr {
            id: self.fresh_id(),
            kind,
            loc,
        })
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn parse_module_path(&mut self) -> Option<String> {
        let mut path = self.expect_identifier("module name")?;
        while self.match_token(&TokenKind::Dot) {
            if self.check(&TokenKind::Star) {
                let loc = self.peek_loc();
                self.diags.error(
                    DiagnosticCode::WildcardInPath,
                    "Wildcards are not allowed in module paths",
                    loc,
                );
                self.advance();
                return None;
            }
            let part = self.expect_identifier("module path segment")?;
            path.push('.');
            path.push_str(&part);
        }
        Some(path)
    }

    fn parse_import(&mut self) -> Option<ImportDecl> {
        let loc = self.peek_loc();
        self.advance(); // import

        let mut names = Vec::new();
        if self.check(&TokenKind::Star) {
            let loc = self.peek_loc();
            self.diags.error(
                DiagnosticCode::WildcardInPath,
                "Wildcard imports are not supported",
                loc,
            );
            self.advance();
        } else {
            loop {
                match self.expect_identifier("imported name") {
                    Some(name) => names.push(name),
                    None => {
                        self.diags.error(
                            DiagnosticCode::InvalidImportSyntax,
                            "Expected a comma-separated list of names after 'import'",
                            self.peek_loc(),
                        );
                        self.synchronize();
                        return None;
                    }
                }
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }

        if self.expect_contextual("from").is_none() {
            self.diags.error(
                DiagnosticCode::InvalidImportSyntax,
                "Expected 'from <module>' after imported names",
                self.peek_loc(),
            );
            self.synchronize();
            return None;
        }
        let module = self.parse_module_path()?;
        self.end_statement();

        Some(ImportDecl {
            id: self.fresh_id(),
            names,
            module,
            loc,
        })
    }

    /// Expects `end <keyword>` closing a block
    fn expect_block_end(&mut self, keyword: TokenKind, what: &str) {
        self.skip_separators();
        if !self.check(&TokenKind::End) {
            let loc = self.peek_loc();
            self.diags.error(
                DiagnosticCode::MissingEndKeyword,
                format!("Expected 'end {}' to close the {} block", what, what),
                loc,
            );
            return;
        }
        self.advance();
        if self.check(&keyword) {
            self.advance();
        } else {
            let loc = self.peek_loc();
            self.diags.error(
                DiagnosticCode::ExpectedToken,
                format!("Expected '{}' after 'end'", what),
                loc,
            );
        }
        self.end_statement();
    }

    /// Expects `end <contextual-word>` (used for `end map`)
    fn expect_block_end_contextual(&mut self, word: &str) {
        self.skip_separators();
        if !self.check(&TokenKind::End) {
            let loc = self.peek_loc();
            self.diags.error(
                DiagnosticCode::MissingEndKeyword,
                format!("Expected 'end {}' to close the block", word),
                loc,
            );
            return;
        }
        self.advance();
        if self.check_contextual(word) {
            self.advance();
        } else {
            let loc = self.peek_loc();
            self.diags.error(
                DiagnosticCode::ExpectedToken,
                format!("Expected '{}' after 'end'", word),
                loc,
            );
        }
        self.end_statement();
    }

    /// Panic-mode recovery: skip forward to the next statement boundary
    fn synchronize(&mut self) {
        while !self.is_at_end() {
            match self.peek_kind() {
                TokenKind::Newline | TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                kind if kind.starts_declaration() => return,
                TokenKind::End
                | TokenKind::Else
                | TokenKind::Case
                | TokenKind::Default
                | TokenKind::Next => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::Eof | TokenKind::End
        )
    }

    /// Consumes the statement terminator (newline or `;`) when present
    fn end_statement(&mut self) {
        while matches!(
            self.peek_kind(),
            TokenKind::Semicolon | TokenKind::Newline
        ) {
            self.advance();
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline) {
            self.advance();
        }
    }

    fn skip_separators(&mut self) {
        while matches!(
            self.peek_kind(),
            TokenKind::Newline | TokenKind::Semicolon
        ) {
            self.advance();
        }
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        id
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.tokens[self.current.min(self.tokens.len() - 1)].kind
    }

    fn peek_kind_at(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.current + offset).map(|t| &t.kind)
    }

    fn peek_loc(&self) -> SourceLocation {
        self.tokens[self.current.min(self.tokens.len() - 1)]
            .location
            .clone()
    }

    fn advance(&mut self) -> &Token {
        let idx = self.current.min(self.tokens.len() - 1);
        if self.current < self.tokens.len() - 1 {
            self.current += 1;
        }
        &self.tokens[idx]
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn check_contextual(&self, word: &str) -> bool {
        matches!(self.peek_kind(), TokenKind::Identifier(name) if name == word)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Option<()> {
        if self.check(kind) {
            self.advance();
            Some(())
        } else {
            let loc = self.peek_loc();
            self.diags.error(
                DiagnosticCode::ExpectedToken,
                format!("Expected {}, got '{}'", what, self.peek_kind()),
                loc,
            );
            None
        }
    }

    fn expect_contextual(&mut self, word: &str) -> Option<()> {
        if self.check_contextual(word) {
            self.advance();
            Some(())
        } else {
            let loc = self.peek_loc();
            self.diags.error(
                DiagnosticCode::ExpectedToken,
                format!("Expected '{}', got '{}'", word, self.peek_kind()),
                loc,
            );
            None
        }
    }

    fn expect_identifier(&mut self, what: &str) -> Option<String> {
        match self.peek_kind().clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Some(name)
            }
            other => {
                let loc = self.peek_loc();
                self.diags.error(
                    DiagnosticCode::ExpectedToken,
                    format!("Expected {}, got '{}'", what, other),
                    loc,
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Scanner;

    fn parse_source(source: &str) -> (Program, DiagnosticBag) {
        let mut diags = DiagnosticBag::new();
        let tokens = Scanner::new(source, "test.bl65").scan_tokens(&mut diags);
        let (program, parse_diags) = Parser::new(tokens, "test.bl65").parse();
        diags.absorb(parse_diags);
        (program, diags)
    }

    #[test]
    fn test_implicit_module() {
        let (program, diags) = parse_source("let x: byte = 1\n");
        assert!(!diags.has_errors());
        assert_eq!(program.module_name, "global");
        assert!(program.implicit_module);
    }

    #[test]
    fn test_explicit_module_path() {
        let (program, diags) = parse_source("module game.sprites\nlet x: byte = 1\n");
        assert!(!diags.has_errors());
        assert_eq!(program.module_name, "game.sprites");
        assert!(!program.implicit_module);
    }

    #[test]
    fn test_duplicate_module() {
        let (_, diags) = parse_source("module a\nmodule b\n");
        assert!(diags.find(DiagnosticCode::DuplicateModule).is_some());
    }

    #[test]
    fn test_function_with_params() {
        let source = "function add(a: byte, b: byte): byte\n  return a + b\nend function\n";
        let (program, diags) = parse_source(source);
        assert!(!diags.has_errors(), "{:?}", diags.diagnostics());
        assert_eq!(program.decls.len(), 1);
        match &program.decls[0] {
            Decl::Function(f) => {
                assert_eq!(f.name, "add");
                assert_eq!(f.params.len(), 2);
                assert!(!f.is_stub);
                assert_eq!(f.body.len(), 1);
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_stub_function() {
        let source = "function peek(addr: word): byte\nend function\n";
        let (program, diags) = parse_source(source);
        assert!(!diags.has_errors());
        match &program.decls[0] {
            Decl::Function(f) => assert!(f.is_stub),
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_const_requires_initializer() {
        let (_, diags) = parse_source("const SPEED: byte\n");
        assert!(diags
            .find(DiagnosticCode::MissingConstInitializer)
            .is_some());
    }

    #[test]
    fn test_precedence() {
        let source = "function f(): byte\n  return 1 + 2 * 3\nend function\n";
        let (program, diags) = parse_source(source);
        assert!(!diags.has_errors());
        let f = match &program.decls[0] {
            Decl::Function(f) => f,
            _ => unreachable!(),
        };
        let ret = match &f.body[0].kind {
            StmtKind::Return(Some(e)) => e,
            other => panic!("expected return, got {:?}", other),
        };
        // 1 + (2 * 3)
        match &ret.kind {
            ExprKind::Binary { op, rhs, .. } => {
                assert_eq!(*op, BinaryOp::Add);
                assert!(matches!(
                    rhs.kind,
                    ExprKind::Binary {
                        op: BinaryOp::Mul,
                        ..
                    }
                ));
            }
            other => panic!("expected binary, got {:?}", other),
        }
    }

    #[test]
    fn test_logical_words() {
        let source = "function f(): boolean\n  return not a and b or c\nend function\n";
        let (program, diags) = parse_source(source);
        assert!(!diags.has_errors());
        let f = match &program.decls[0] {
            Decl::Function(f) => f,
            _ => unreachable!(),
        };
        // ((not a) and b) or c
        let ret = match &f.body[0].kind {
            StmtKind::Return(Some(e)) => e,
            _ => unreachable!(),
        };
        assert!(matches!(
            ret.kind,
            ExprKind::Binary {
                op: BinaryOp::LogicalOr,
                ..
            }
        ));
    }

    #[test]
    fn test_for_loop() {
        let source = "function f()\n  for i = 0 to 9\n    poke($d020, i)\n  next\nend function\n";
        let (program, diags) = parse_source(source);
        assert!(!diags.has_errors(), "{:?}", diags.diagnostics());
        let f = match &program.decls[0] {
            Decl::Function(f) => f,
            _ => unreachable!(),
        };
        assert!(matches!(f.body[0].kind, StmtKind::For { .. }));
    }

    #[test]
    fn test_memory_map() {
        let source = "@map vic at $d000\n  sprite0_x: byte\n  border: byte at $20\nend map\n";
        let (program, diags) = parse_source(source);
        assert!(!diags.has_errors(), "{:?}", diags.diagnostics());
        match &program.decls[0] {
            Decl::MemoryMap(m) => {
                assert_eq!(m.name, "vic");
                assert_eq!(m.base, 0xD000);
                assert_eq!(m.fields.len(), 2);
                assert_eq!(m.fields[0].offset, None);
                assert_eq!(m.fields[1].offset, Some(0x20));
            }
            other => panic!("expected memory map, got {:?}", other),
        }
    }

    #[test]
    fn test_map_rejected_in_function() {
        let source = "function f()\n  @map vic at $d000\n  end map\nend function\n";
        let (_, diags) = parse_source(source);
        assert!(diags.find(DiagnosticCode::InvalidMemoryMapScope).is_some());
    }

    #[test]
    fn test_array_literal_with_inferred_size() {
        let source = "let colors: byte[] = [2, 5, 6]\n";
        let (program, diags) = parse_source(source);
        assert!(!diags.has_errors());
        match &program.decls[0] {
            Decl::Variable(v) => {
                assert!(matches!(
                    v.ty.as_ref().unwrap().kind,
                    TypeExprKind::Array(_, None)
                ));
                assert!(matches!(
                    v.init.as_ref().unwrap().kind,
                    ExprKind::ArrayLiteral(ref e) if e.len() == 3
                ));
            }
            other => panic!("expected variable, got {:?}", other),
        }
    }

    #[test]
    fn test_imports() {
        let source = "module main\nimport peek, poke from system\n";
        let (program, diags) = parse_source(source);
        assert!(!diags.has_errors());
        assert_eq!(program.imports.len(), 1);
        assert_eq!(program.imports[0].names, vec!["peek", "poke"]);
        assert_eq!(program.imports[0].module, "system");
    }

    #[test]
    fn test_wildcard_import_rejected() {
        let (_, diags) = parse_source("import * from system\n");
        assert!(diags.find(DiagnosticCode::WildcardInPath).is_some());
    }

    #[test]
    fn test_executable_at_module_scope() {
        let (_, diags) = parse_source("poke($d020, 0)\n");
        assert!(diags
            .find(DiagnosticCode::ExecutableAtModuleScope)
            .is_some());
    }

    #[test]
    fn test_error_recovery_continues() {
        let source = "let = 5\nlet y: byte = 1\n";
        let (program, diags) = parse_source(source);
        assert!(diags.has_errors());
        // The second declaration still parses
        assert!(program.decls.iter().any(|d| d.name() == "y"));
    }

    #[test]
    fn test_ternary_and_assignment() {
        let source = "function f(a: byte): byte\n  let x: byte = a > 5 ? 1 : 0\n  x += 2\n  return x\nend function\n";
        let (program, diags) = parse_source(source);
        assert!(!diags.has_errors(), "{:?}", diags.diagnostics());
        let f = match &program.decls[0] {
            Decl::Function(f) => f,
            _ => unreachable!(),
        };
        assert_eq!(f.body.len(), 3);
        match &f.body[1].kind {
            StmtKind::Expression(e) => {
                assert!(matches!(
                    e.kind,
                    ExprKind::Assign {
                        op: Some(BinaryOp::Add),
                        ..
                    }
                ));
            }
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    #[test]
    fn test_address_of_prefix() {
        let source = "function f(): word\n  return @counter\nend function\n";
        let (program, diags) = parse_source(source);
        assert!(!diags.has_errors());
        let f = match &program.decls[0] {
            Decl::Function(f) => f,
            _ => unreachable!(),
        };
        match &f.body[0].kind {
            StmtKind::Return(Some(e)) => assert!(matches!(
                e.kind,
                ExprKind::Unary {
                    op: UnaryOp::AddressOf,
                    ..
                }
            )),
            other => panic!("expected return, got {:?}", other),
        }
    }

    #[test]
    fn test_match_statement() {
        let source = "function f(x: byte)\n  match x\n  case 1\n    poke($d020, 1)\n  case 2\n    poke($d020, 2)\n  default\n    poke($d020, 0)\n  end match\nend function\n";
        let (program, diags) = parse_source(source);
        assert!(!diags.has_errors(), "{:?}", diags.diagnostics());
        let f = match &program.decls[0] {
            Decl::Function(f) => f,
            _ => unreachable!(),
        };
        match &f.body[0].kind {
            StmtKind::Match { cases, default, .. } => {
                assert_eq!(cases.len(), 2);
                assert!(default.is_some());
            }
            other => panic!("expected match, got {:?}", other),
        }
    }
}
