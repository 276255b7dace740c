use std::collections::BTreeSet;

use crate::analysis::{CodeSection, LabelTable};
use crate::cwriter::CWriter;
use crate::errors::CodegenError;
use crate::lexer::{Token, TokenKind};
use crate::stack::{StackError, Storage};

/// Single-token-lookahead cursor over one instruction's body.
pub struct TokenIterator {
    tokens: std::vec::IntoIter<Token>,
    look_ahead: Option<Token>,
    last_line: u32,
    last_column: u32,
}

impl TokenIterator {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens: tokens.into_iter(),
            look_ahead: None,
            last_line: 1,
            last_column: 1,
        }
    }

    pub fn next(&mut self) -> Option<Token> {
        let tkn = match self.look_ahead.take() {
            Some(tkn) => Some(tkn),
            None => self.tokens.next(),
        };
        if let Some(tkn) = &tkn {
            self.last_line = tkn.line;
            self.last_column = tkn.column;
        }
        tkn
    }

    pub fn take(&mut self) -> Result<Token, CodegenError> {
        self.next().ok_or_else(|| {
            CodegenError::new("unexpected end of input", self.last_line, self.last_column)
        })
    }

    pub fn peek(&mut self) -> Option<&Token> {
        if self.look_ahead.is_none() {
            self.look_ahead = self.tokens.next();
        }
        self.look_ahead.as_ref()
    }

    fn eof_error(&self, message: &str) -> CodegenError {
        CodegenError::new(message, self.last_line, self.last_column)
    }
}

/// The closed set of control directives recognized mid-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    DeoptIf,
    ExitIf,
    ErrorIf,
    ErrorNoPop,
    DecrefInputs,
    Dead,
    InputsDead,
    SyncSp,
    SaveStack,
    ReloadStack,
    CloseSpecialized,
    Steal,
    Dispatch,
    InstructionSize,
    StackPointer,
}

impl Directive {
    fn lookup(text: &str) -> Option<Directive> {
        Some(match text {
            "DEOPT_IF" => Directive::DeoptIf,
            "EXIT_IF" => Directive::ExitIf,
            "ERROR_IF" => Directive::ErrorIf,
            "ERROR_NO_POP" => Directive::ErrorNoPop,
            "DECREF_INPUTS" => Directive::DecrefInputs,
            "DEAD" => Directive::Dead,
            "INPUTS_DEAD" => Directive::InputsDead,
            "SYNC_SP" => Directive::SyncSp,
            "SAVE_STACK" => Directive::SaveStack,
            "RELOAD_STACK" => Directive::ReloadStack,
            "StackRef_CLOSE_SPECIALIZED" => Directive::CloseSpecialized,
            "StackRef_Steal" => Directive::Steal,
            "DISPATCH" => Directive::Dispatch,
            "INSTRUCTION_SIZE" => Directive::InstructionSize,
            "stack_pointer" => Directive::StackPointer,
            _ => return None,
        })
    }
}

fn always_true(tkn: Option<&Token>) -> bool {
    match tkn {
        Some(tkn) => tkn.text == "true" || tkn.text == "1",
        None => false,
    }
}

fn at_token(err: StackError, tkn: &Token) -> CodegenError {
    CodegenError::at(err.0, tkn)
}

/// Re-emits one instruction body token by token, expanding directives
/// and tracking the symbolic operand stack through nested control flow.
pub struct Emitter<'a> {
    out: &'a mut CWriter,
    labels: &'a LabelTable,
    non_escaping_deallocs: &'a BTreeSet<String>,
    trace_stacks: bool,
}

impl<'a> Emitter<'a> {
    pub fn new(
        out: &'a mut CWriter,
        labels: &'a LabelTable,
        non_escaping_deallocs: &'a BTreeSet<String>,
        trace_stacks: bool,
    ) -> Self {
        Self {
            out,
            labels,
            non_escaping_deallocs,
            trace_stacks,
        }
    }

    /// Emit a full instruction body. On a reachable fall-through, the
    /// outputs are promoted into the live input set of the returned
    /// storage; the caller must not emit further stack traffic when the
    /// end of the body is unreachable.
    pub fn emit_tokens(
        &mut self,
        code: &CodeSection,
        storage: Storage,
    ) -> Result<(bool, Storage), CodegenError> {
        let mut it = TokenIterator::new(code.body.clone());
        self.out.start_line();
        let (reachable, rbrace, mut storage) = self.emit_block(&mut it, code, storage, false)?;
        if reachable {
            self.trace_storage(&storage);
            storage.push_outputs().map_err(|e| at_token(e, &rbrace))?;
            self.trace_storage(&storage);
        }
        Ok((reachable, storage))
    }

    /// Emit tokens until `end` at parenthesis depth zero; the end token
    /// is returned unemitted.
    fn emit_to(&mut self, it: &mut TokenIterator, end: TokenKind) -> Result<Token, CodegenError> {
        let mut parens = 0;
        loop {
            let Some(tkn) = it.next() else {
                return Err(it.eof_error("unexpected end of input"));
            };
            if tkn.kind == end && parens == 0 {
                return Ok(tkn);
            }
            if tkn.kind == TokenKind::LParen {
                parens += 1;
            }
            if tkn.kind == TokenKind::RParen {
                parens -= 1;
            }
            self.out.emit_token(&tkn);
        }
    }

    fn trace_storage(&mut self, storage: &Storage) {
        if self.trace_stacks {
            self.out.start_line();
            self.out.emit_str(&storage.as_comment());
            self.out.start_line();
        }
    }

    fn emit_save(&mut self, storage: &mut Storage) -> Result<(), StackError> {
        storage.save(self.out)?;
        self.trace_storage(storage);
        Ok(())
    }

    fn emit_reload(&mut self, storage: &mut Storage) -> Result<(), StackError> {
        storage.reload(self.out)?;
        self.trace_storage(storage);
        Ok(())
    }

    fn goto_label(
        &mut self,
        goto: &Token,
        label: &Token,
        storage: &mut Storage,
    ) -> Result<(), CodegenError> {
        let Some(target) = self.labels.get(&label.text) else {
            return Err(CodegenError::at(
                format!("label '{}' does not exist", label.text),
                label,
            ));
        };
        if target.spilled {
            if !storage.spilled {
                self.emit_save(storage).map_err(|e| at_token(e, goto))?;
            }
        } else if storage.spilled {
            return Err(CodegenError::at(
                format!(
                    "cannot jump to label '{}' without reloading the stack pointer",
                    label.text
                ),
                goto,
            ));
        }
        self.out.start_line();
        self.out.emit_str("JUMP_TO_LABEL(");
        self.out.emit_token(label);
        self.out.emit_str(")");
        Ok(())
    }

    fn goto_error(&mut self, label: &str, storage: &Storage) -> Result<String, StackError> {
        let offset = storage.peek_offset();
        match offset.as_int() {
            Some(0) => Ok(format!("JUMP_TO_LABEL({label});")),
            Some(n) if n > 0 => Ok(format!("JUMP_TO_LABEL(pop_{n}_{label});")),
            _ => {
                // Depth is symbolic (or behind the logical top): sync
                // the real pointer here instead of at the label.
                let mut copy = storage.clone();
                copy.flush(self.out)?;
                Ok(format!("JUMP_TO_LABEL({label});"))
            }
        }
    }

    fn deopt_if(
        &mut self,
        tkn: &Token,
        it: &mut TokenIterator,
        code: &CodeSection,
    ) -> Result<bool, CodegenError> {
        self.out.start_line();
        self.out.emit_str("if (");
        let lparen = it.take()?;
        if lparen.kind != TokenKind::LParen {
            return Err(CodegenError::at("expected '('", &lparen));
        }
        let first = it.peek().cloned();
        self.emit_to(it, TokenKind::RParen)?;
        self.out.emit_str(") {\n");
        it.take()?; // semicolon
        let Some(family) = code.family.as_deref() else {
            return Err(CodegenError::at(
                format!("{} requires an instruction family", tkn.text),
                tkn,
            ));
        };
        self.out.emit_str(&format!("UPDATE_MISS_STATS({family});\n"));
        self.out
            .emit_str(&format!("assert(OPCODE_DEOPT(opcode) == ({family}));\n"));
        self.out.emit_str(&format!("JUMP_TO_PREDICTED({family});\n"));
        self.out.emit_str("}\n");
        Ok(!always_true(first.as_ref()))
    }

    fn error_if(
        &mut self,
        tkn: &Token,
        it: &mut TokenIterator,
        storage: &mut Storage,
    ) -> Result<bool, CodegenError> {
        let lparen = it.take()?;
        if lparen.kind != TokenKind::LParen {
            return Err(CodegenError::at("expected '('", &lparen));
        }
        let unconditional = always_true(it.peek());
        if unconditional {
            it.take()?; // the constant condition
            let comma = it.take()?;
            if comma.kind != TokenKind::Comma {
                return Err(CodegenError::at(
                    format!("expected comma, got '{}'", comma.text),
                    &comma,
                ));
            }
            self.out.start_line();
        } else {
            self.out.start_line();
            self.out.emit_str("if ");
            self.out.emit_token(&lparen);
            self.emit_to(it, TokenKind::Comma)?;
            self.out.emit_str(") {\n");
        }
        let label = it.take()?;
        it.take()?; // right parenthesis
        it.take()?; // semicolon
        storage
            .clear_inputs("at ERROR_IF")
            .map_err(|e| at_token(e, tkn))?;
        let jump = self
            .goto_error(&label.text, storage)
            .map_err(|e| at_token(e, tkn))?;
        self.out.emit_str(&jump);
        self.out.emit_str("\n");
        if !unconditional {
            self.out.emit_str("}\n");
        }
        Ok(!unconditional)
    }

    fn error_no_pop(&mut self, it: &mut TokenIterator) -> Result<bool, CodegenError> {
        it.take()?; // left parenthesis
        it.take()?; // right parenthesis
        it.take()?; // semicolon
        self.out.start_line();
        self.out.emit_str("JUMP_TO_LABEL(error);\n");
        Ok(false)
    }

    /// Ownership-consuming helper calls. When the first argument is a
    /// bare slot name the slot is marked dead; pass-through otherwise.
    fn close_specialized(
        &mut self,
        tkn: &Token,
        it: &mut TokenIterator,
        storage: &mut Storage,
    ) -> Result<bool, CodegenError> {
        self.out.emit_token(tkn);
        let lparen = it.take()?;
        if lparen.kind != TokenKind::LParen {
            return Err(CodegenError::at("expected '('", &lparen));
        }
        self.out.emit_token(&lparen);
        let name = it.take()?;
        self.out.emit_token(&name);
        let comma = it.take()?;
        if comma.kind != TokenKind::Comma {
            return Err(CodegenError::at("expected comma", &comma));
        }
        self.out.emit_token(&comma);
        let dealloc = it.take()?;
        if dealloc.kind != TokenKind::Identifier {
            return Err(CodegenError::at("expected identifier", &dealloc));
        }
        self.out.emit_token(&dealloc);
        if name.kind == TokenKind::Identifier {
            let escapes = !self.non_escaping_deallocs.contains(&dealloc.text);
            storage
                .kill_checked(&name.text, escapes)
                .map_err(|e| at_token(e, &name))?;
            return Ok(true);
        }
        let rparen = self.emit_to(it, TokenKind::RParen)?;
        self.out.emit_token(&rparen);
        Ok(true)
    }

    fn steal(
        &mut self,
        tkn: &Token,
        it: &mut TokenIterator,
        storage: &mut Storage,
    ) -> Result<bool, CodegenError> {
        self.out.emit_token(tkn);
        let lparen = it.take()?;
        if lparen.kind != TokenKind::LParen {
            return Err(CodegenError::at("expected '('", &lparen));
        }
        self.out.emit_token(&lparen);
        let name = it.take()?;
        self.out.emit_token(&name);
        if name.kind == TokenKind::Identifier {
            storage
                .kill_checked(&name.text, false)
                .map_err(|e| at_token(e, &name))?;
            return Ok(true);
        }
        let rparen = self.emit_to(it, TokenKind::RParen)?;
        self.out.emit_token(&rparen);
        Ok(true)
    }

    fn directive(
        &mut self,
        directive: Directive,
        tkn: &Token,
        it: &mut TokenIterator,
        code: &CodeSection,
        storage: &mut Storage,
    ) -> Result<bool, CodegenError> {
        match directive {
            Directive::DeoptIf | Directive::ExitIf => self.deopt_if(tkn, it, code),
            Directive::ErrorIf => self.error_if(tkn, it, storage),
            Directive::ErrorNoPop => self.error_no_pop(it),
            Directive::DecrefInputs => {
                it.take()?;
                it.take()?;
                it.take()?;
                storage.close_inputs(self.out).map_err(|e| at_token(e, tkn))?;
                Ok(true)
            }
            Directive::Dead => {
                it.take()?; // left parenthesis
                let name = it.take()?;
                it.take()?; // right parenthesis
                it.take()?; // semicolon
                storage.kill(&name.text).map_err(|e| at_token(e, &name))?;
                Ok(true)
            }
            Directive::InputsDead => {
                it.take()?;
                it.take()?;
                it.take()?;
                storage.kill_all_inputs();
                Ok(true)
            }
            Directive::SyncSp => {
                it.take()?;
                it.take()?;
                it.take()?;
                storage
                    .clear_inputs("when syncing stack")
                    .map_err(|e| at_token(e, tkn))?;
                storage.flush(self.out).map_err(|e| at_token(e, tkn))?;
                self.trace_storage(storage);
                Ok(true)
            }
            Directive::SaveStack => {
                it.take()?;
                it.take()?;
                it.take()?;
                self.emit_save(storage).map_err(|e| at_token(e, tkn))?;
                Ok(true)
            }
            Directive::ReloadStack => {
                it.take()?;
                it.take()?;
                it.take()?;
                self.emit_reload(storage).map_err(|e| at_token(e, tkn))?;
                Ok(true)
            }
            Directive::CloseSpecialized => self.close_specialized(tkn, it, storage),
            Directive::Steal => self.steal(tkn, it, storage),
            Directive::Dispatch => {
                if storage.spilled {
                    return Err(CodegenError::at(
                        "stack_pointer needs reloading before dispatch",
                        tkn,
                    ));
                }
                self.out.emit_token(tkn);
                Ok(false)
            }
            Directive::InstructionSize => {
                let Some(size) = code.instruction_size else {
                    return Err(CodegenError::at(
                        "INSTRUCTION_SIZE requires a statically known instruction size",
                        tkn,
                    ));
                };
                self.out.emit_str(&format!(" {size} "));
                Ok(true)
            }
            Directive::StackPointer => {
                if storage.spilled {
                    return Err(CodegenError::at(
                        "stack_pointer is invalid when the stack is spilled to memory",
                        tkn,
                    ));
                }
                self.out.emit_token(tkn);
                Ok(true)
            }
        }
    }

    /// Branch handling for an `if`/`else`/`else if` chain. Returns
    /// `(reachable, closing brace, storage)`; the closing brace is left
    /// unemitted so merge compensation lands inside the branch.
    fn emit_if(
        &mut self,
        it: &mut TokenIterator,
        code: &CodeSection,
        storage: Storage,
    ) -> Result<(bool, Token, Storage), CodegenError> {
        let lparen = it.take()?;
        if lparen.kind != TokenKind::LParen {
            return Err(CodegenError::at("expected '('", &lparen));
        }
        self.out.emit_token(&lparen);
        let rparen = self.emit_to(it, TokenKind::RParen)?;
        self.out.emit_token(&rparen);
        let (reachable, rbrace, if_storage) =
            self.emit_block(it, code, storage.clone(), true)?;
        if it.peek().map(|t| t.kind) == Some(TokenKind::Else) {
            self.trace_storage(&storage);
            self.out.emit_token(&rbrace);
            let else_tkn = it.take()?;
            self.out.emit_token(&else_tkn);
            let (else_reachable, rbrace, else_storage) =
                if it.peek().map(|t| t.kind) == Some(TokenKind::If) {
                    // Extra braces around the nested if keep block-local
                    // declarations scoped to their arm.
                    self.out.emit_str(" {\n");
                    let if_tkn = it.take()?;
                    self.out.emit_token(&if_tkn);
                    let result = self.emit_if(it, code, storage)?;
                    self.out.start_line();
                    self.out.emit_str("}\n");
                    result
                } else {
                    self.emit_block(it, code, storage, true)?
                };
            if !reachable {
                // The if-arm cannot fall through; its storage is
                // discarded.
                Ok((else_reachable, rbrace, else_storage))
            } else if !else_reachable {
                Ok((true, rbrace, if_storage))
            } else {
                let mut merged = else_storage;
                merged
                    .merge(&if_storage, self.out)
                    .map_err(|e| at_token(e, &rbrace))?;
                self.trace_storage(&merged);
                Ok((true, rbrace, merged))
            }
        } else if reachable {
            let mut merged = if_storage;
            merged
                .merge(&storage, self.out)
                .map_err(|e| at_token(e, &rbrace))?;
            self.trace_storage(&merged);
            Ok((true, rbrace, merged))
        } else {
            // Unreachable if-arm without an else: its effects are
            // discarded and the pre-branch storage survives.
            Ok((true, rbrace, storage))
        }
    }

    /// Recursive descent over one brace-delimited block. Returns
    /// `(reachable, closing brace, storage)`; the closing brace is not
    /// emitted.
    fn emit_block(
        &mut self,
        it: &mut TokenIterator,
        code: &CodeSection,
        mut storage: Storage,
        emit_first_brace: bool,
    ) -> Result<(bool, Token, Storage), CodegenError> {
        let mut braces = 1u32;
        let mut reload_at: Option<u32> = None;
        let mut reachable = true;
        let tkn = it.take()?;
        if tkn.kind != TokenKind::LBrace {
            return Err(CodegenError::at(
                format!("expected '{{', found: {}", tkn.text),
                &tkn,
            ));
        }
        if emit_first_brace {
            self.out.emit_token(&tkn);
        }
        self.trace_storage(&storage);
        loop {
            let Some(tkn) = it.next() else {
                return Err(it.eof_error("expected closing brace, reached end of input"));
            };
            if let Some(escape) = code.escaping_calls.get(&tkn.index) {
                if let Some(kills) = escape.kills.clone() {
                    if Some(tkn.index) == reload_at {
                        self.emit_reload(&mut storage)
                            .map_err(|e| at_token(e, &tkn))?;
                    }
                    storage
                        .kill_checked(&kills, true)
                        .map_err(|e| at_token(e, &tkn))?;
                    self.emit_save(&mut storage).map_err(|e| at_token(e, &tkn))?;
                } else if Some(tkn.index) != reload_at {
                    self.emit_save(&mut storage).map_err(|e| at_token(e, &tkn))?;
                }
                reload_at = Some(escape.end);
            } else if Some(tkn.index) == reload_at {
                self.emit_reload(&mut storage)
                    .map_err(|e| at_token(e, &tkn))?;
            }
            match tkn.kind {
                TokenKind::LBrace => {
                    self.out.emit_token(&tkn);
                    braces += 1;
                }
                TokenKind::RBrace => {
                    self.trace_storage(&storage);
                    braces -= 1;
                    if braces == 0 {
                        return Ok((reachable, tkn, storage));
                    }
                    self.out.emit_token(&tkn);
                }
                TokenKind::Goto => {
                    let label = it.take()?;
                    self.goto_label(&tkn, &label, &mut storage)?;
                    reachable = false;
                }
                TokenKind::Identifier => {
                    if let Some(directive) = Directive::lookup(&tkn.text) {
                        if !self.directive(directive, &tkn, it, code, &mut storage)? {
                            reachable = false;
                        }
                    } else {
                        if code.output_stores.contains(&tkn.index) {
                            for slot in &mut storage.outputs {
                                if slot.item.name == tkn.text {
                                    slot.defined = true;
                                    slot.in_memory = false;
                                    break;
                                }
                            }
                        }
                        if tkn.text.starts_with("DISPATCH") {
                            self.trace_storage(&storage);
                            reachable = false;
                        }
                        self.out.emit_token(&tkn);
                    }
                }
                TokenKind::If => {
                    self.out.emit_token(&tkn);
                    let (if_reachable, rbrace, if_storage) = self.emit_if(it, code, storage)?;
                    storage = if_storage;
                    if reachable {
                        reachable = if_reachable;
                    }
                    self.out.emit_token(&rbrace);
                }
                _ => self.out.emit_token(&tkn),
            }
        }
    }
}
