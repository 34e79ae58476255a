//! Recursive-descent parser producing [`Program`] trees.
//!
//! Supports the everyday subset of modern JavaScript that solutions are
//! written in. Classes, generators, regular expressions and modules are
//! rejected with a syntax error rather than misinterpreted.

use std::rc::Rc;

use super::ast::*;
use super::lexer::{Keyword, Lexer, SyntaxError, TemplatePart, Token, TokenKind};
use crate::core::value::format_number;

pub fn parse(source: &str) -> Result<Program, SyntaxError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser::new(tokens);
    parser.parse_program()
}

#[derive(Clone, Copy)]
enum Infix {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

fn infix_for(punct: &str) -> Option<(u8, Infix)> {
    let op = match punct {
        "??" => (1, Infix::Logical(LogicalOp::Nullish)),
        "||" => (1, Infix::Logical(LogicalOp::Or)),
        "&&" => (2, Infix::Logical(LogicalOp::And)),
        "|" => (3, Infix::Binary(BinaryOp::BitOr)),
        "^" => (4, Infix::Binary(BinaryOp::BitXor)),
        "&" => (5, Infix::Binary(BinaryOp::BitAnd)),
        "==" => (6, Infix::Binary(BinaryOp::Eq)),
        "!=" => (6, Infix::Binary(BinaryOp::NotEq)),
        "===" => (6, Infix::Binary(BinaryOp::StrictEq)),
        "!==" => (6, Infix::Binary(BinaryOp::StrictNotEq)),
        "<" => (7, Infix::Binary(BinaryOp::Lt)),
        ">" => (7, Infix::Binary(BinaryOp::Gt)),
        "<=" => (7, Infix::Binary(BinaryOp::LtEq)),
        ">=" => (7, Infix::Binary(BinaryOp::GtEq)),
        "<<" => (8, Infix::Binary(BinaryOp::Shl)),
        ">>" => (8, Infix::Binary(BinaryOp::Shr)),
        ">>>" => (8, Infix::Binary(BinaryOp::UShr)),
        "+" => (9, Infix::Binary(BinaryOp::Add)),
        "-" => (9, Infix::Binary(BinaryOp::Sub)),
        "*" => (10, Infix::Binary(BinaryOp::Mul)),
        "/" => (10, Infix::Binary(BinaryOp::Div)),
        "%" => (10, Infix::Binary(BinaryOp::Rem)),
        "**" => (11, Infix::Binary(BinaryOp::Pow)),
        _ => return None,
    };
    Some(op)
}

const POW_PRECEDENCE: u8 = 11;

fn assign_op_for(punct: &str) -> Option<AssignOp> {
    let op = match punct {
        "=" => AssignOp::Assign,
        "+=" => AssignOp::Binary(BinaryOp::Add),
        "-=" => AssignOp::Binary(BinaryOp::Sub),
        "*=" => AssignOp::Binary(BinaryOp::Mul),
        "/=" => AssignOp::Binary(BinaryOp::Div),
        "%=" => AssignOp::Binary(BinaryOp::Rem),
        "**=" => AssignOp::Binary(BinaryOp::Pow),
        "<<=" => AssignOp::Binary(BinaryOp::Shl),
        ">>=" => AssignOp::Binary(BinaryOp::Shr),
        ">>>=" => AssignOp::Binary(BinaryOp::UShr),
        "&=" => AssignOp::Binary(BinaryOp::BitAnd),
        "|=" => AssignOp::Binary(BinaryOp::BitOr),
        "^=" => AssignOp::Binary(BinaryOp::BitXor),
        "&&=" => AssignOp::Logical(LogicalOp::And),
        "||=" => AssignOp::Logical(LogicalOp::Or),
        "??=" => AssignOp::Logical(LogicalOp::Nullish),
        _ => return None,
    };
    Some(op)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    in_async: bool,
    in_function: bool,
    /// Set while parsing a `for` head, where `in` starts a for-in loop.
    no_in: bool,
    /// Whether `arguments` was seen since the enclosing non-arrow function began.
    saw_arguments: bool,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            in_async: false,
            in_function: false,
            no_in: false,
            saw_arguments: false,
        }
    }

    // Token cursor

    fn token_at(&self, offset: usize) -> &Token {
        // The stream always ends with Eof, reads past it stay there.
        let index = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[index]
    }

    fn peek(&self) -> &Token {
        self.token_at(0)
    }

    fn kind_at(&self, offset: usize) -> &TokenKind {
        &self.token_at(offset).kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn is_punct(&self, punct: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Punct(p) if *p == punct)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        let found = self.is_punct(punct);
        if found {
            self.advance();
        }
        found
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), SyntaxError> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn is_keyword(&self, keyword: Keyword) -> bool {
        self.peek().kind == TokenKind::Keyword(keyword)
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> bool {
        let found = self.is_keyword(keyword);
        if found {
            self.advance();
        }
        found
    }

    fn is_ident_named(&self, name: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Ident(n) if n == name)
    }

    fn error_here(&self, message: impl Into<String>) -> SyntaxError {
        let token = self.peek();
        SyntaxError {
            message: message.into(),
            line: token.line,
            col: token.col,
        }
    }

    fn unexpected(&self) -> SyntaxError {
        unexpected_token(self.peek())
    }

    fn with_no_in<T>(
        &mut self,
        no_in: bool,
        parse: impl FnOnce(&mut Self) -> Result<T, SyntaxError>,
    ) -> Result<T, SyntaxError> {
        let saved = std::mem::replace(&mut self.no_in, no_in);
        let result = parse(self);
        self.no_in = saved;
        result
    }

    fn in_function_scope<T>(
        &mut self,
        is_async: bool,
        parse: impl FnOnce(&mut Self) -> Result<T, SyntaxError>,
    ) -> Result<T, SyntaxError> {
        let saved = (self.in_async, self.in_function, self.no_in);
        (self.in_async, self.in_function, self.no_in) = (is_async, true, false);
        let result = parse(self);
        (self.in_async, self.in_function, self.no_in) = saved;
        result
    }

    fn consume_semicolon(&mut self) -> Result<(), SyntaxError> {
        if self.eat_punct(";") || self.is_punct("}") || self.at_eof() || self.peek().newline_before
        {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    // Statements

    fn parse_program(&mut self) -> Result<Program, SyntaxError> {
        let mut body = Vec::new();
        while !self.at_eof() {
            body.push(self.parse_statement()?);
        }
        Ok(Program { body })
    }

    fn parse_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let token = self.peek().clone();
        match &token.kind {
            TokenKind::Punct("{") => Ok(Stmt::Block(self.parse_block()?)),
            TokenKind::Punct(";") => {
                self.advance();
                Ok(Stmt::Empty)
            }
            TokenKind::Keyword(Keyword::Var | Keyword::Let | Keyword::Const) => {
                let kind = self.parse_decl_kind()?;
                let first = self.parse_binding_target()?;
                let decls = self.parse_declarators(kind, first)?;
                self.consume_semicolon()?;
                Ok(Stmt::VarDecl { kind, decls })
            }
            TokenKind::Keyword(Keyword::Function) => {
                self.advance();
                Ok(Stmt::Function(self.parse_function_rest(false, true)?))
            }
            TokenKind::Ident(name)
                if name == "async"
                    && *self.kind_at(1) == TokenKind::Keyword(Keyword::Function)
                    && !self.token_at(1).newline_before =>
            {
                self.advance();
                self.advance();
                Ok(Stmt::Function(self.parse_function_rest(true, true)?))
            }
            TokenKind::Ident(name) if *self.kind_at(1) == TokenKind::Punct(":") => {
                let label = name.clone();
                self.advance();
                self.advance();
                let body = Box::new(self.parse_statement()?);
                Ok(Stmt::Labeled { label, body })
            }
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::For) => self.parse_for(),
            TokenKind::Keyword(Keyword::While) => {
                self.advance();
                let test = self.parse_paren_expression()?;
                let body = Box::new(self.parse_statement()?);
                Ok(Stmt::While { test, body })
            }
            TokenKind::Keyword(Keyword::Do) => {
                self.advance();
                let body = Box::new(self.parse_statement()?);
                if !self.eat_keyword(Keyword::While) {
                    return Err(self.unexpected());
                }
                let test = self.parse_paren_expression()?;
                self.eat_punct(";");
                Ok(Stmt::DoWhile { body, test })
            }
            TokenKind::Keyword(Keyword::Return) => {
                if !self.in_function {
                    return Err(self.error_here("Illegal return statement"));
                }
                self.advance();
                let arg = if self.is_punct(";")
                    || self.is_punct("}")
                    || self.at_eof()
                    || self.peek().newline_before
                {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.consume_semicolon()?;
                Ok(Stmt::Return(arg))
            }
            TokenKind::Keyword(Keyword::Break) => {
                self.advance();
                let label = self.parse_jump_label();
                self.consume_semicolon()?;
                Ok(Stmt::Break(label))
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.advance();
                let label = self.parse_jump_label();
                self.consume_semicolon()?;
                Ok(Stmt::Continue(label))
            }
            TokenKind::Keyword(Keyword::Throw) => {
                self.advance();
                if self.peek().newline_before {
                    return Err(self.error_here("Illegal newline after throw"));
                }
                let arg = self.parse_expression()?;
                self.consume_semicolon()?;
                Ok(Stmt::Throw(arg))
            }
            TokenKind::Keyword(Keyword::Try) => self.parse_try(),
            TokenKind::Keyword(Keyword::Switch) => self.parse_switch(),
            TokenKind::Keyword(Keyword::Class) => {
                Err(self.error_here("Class declarations are not supported"))
            }
            TokenKind::Keyword(Keyword::Import | Keyword::Export) => {
                Err(self.error_here("Cannot use import statement outside a module"))
            }
            _ => {
                let expr = self.parse_expression()?;
                self.consume_semicolon()?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn parse_jump_label(&mut self) -> Option<String> {
        match &self.peek().kind {
            TokenKind::Ident(label) if !self.peek().newline_before => {
                let label = label.clone();
                self.advance();
                Some(label)
            }
            _ => None,
        }
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.eat_punct("}") {
            if self.at_eof() {
                return Err(self.unexpected());
            }
            body.push(self.parse_statement()?);
        }
        Ok(body)
    }

    fn parse_paren_expression(&mut self) -> Result<Expr, SyntaxError> {
        self.expect_punct("(")?;
        let expr = self.with_no_in(false, Self::parse_expression)?;
        self.expect_punct(")")?;
        Ok(expr)
    }

    fn parse_decl_kind(&mut self) -> Result<DeclKind, SyntaxError> {
        let kind = match self.peek().kind {
            TokenKind::Keyword(Keyword::Var) => DeclKind::Var,
            TokenKind::Keyword(Keyword::Let) => DeclKind::Let,
            TokenKind::Keyword(Keyword::Const) => DeclKind::Const,
            _ => return Err(self.unexpected()),
        };
        self.advance();
        Ok(kind)
    }

    fn parse_declarators(
        &mut self,
        kind: DeclKind,
        first: Pattern,
    ) -> Result<Vec<Declarator>, SyntaxError> {
        let mut decls = Vec::new();
        let mut target = first;
        loop {
            let init = if self.eat_punct("=") {
                Some(self.parse_assignment()?)
            } else {
                None
            };
            if init.is_none() {
                if !matches!(target, Pattern::Ident(_)) {
                    return Err(self.error_here("Missing initializer in destructuring declaration"));
                }
                if kind == DeclKind::Const {
                    return Err(self.error_here("Missing initializer in const declaration"));
                }
            }
            decls.push(Declarator { target, init });
            if !self.eat_punct(",") {
                return Ok(decls);
            }
            target = self.parse_binding_target()?;
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, SyntaxError> {
        self.advance();
        let test = self.parse_paren_expression()?;
        let consequent = Box::new(self.parse_statement()?);
        let alternate = if self.eat_keyword(Keyword::Else) {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt::If {
            test,
            consequent,
            alternate,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, SyntaxError> {
        self.advance();
        if self.is_keyword(Keyword::Await) {
            return Err(self.error_here("for await loops are not supported"));
        }
        self.expect_punct("(")?;

        let init = if self.is_punct(";") {
            None
        } else if matches!(
            self.peek().kind,
            TokenKind::Keyword(Keyword::Var | Keyword::Let | Keyword::Const)
        ) {
            let kind = self.parse_decl_kind()?;
            let target = self.parse_binding_target()?;
            if let Some(is_of) = self.eat_for_each_keyword() {
                let head = ForHead {
                    kind: Some(kind),
                    target,
                };
                return self.parse_for_each(head, is_of);
            }
            let decls = self.with_no_in(true, |p| p.parse_declarators(kind, target))?;
            Some(Box::new(ForInit::VarDecl { kind, decls }))
        } else {
            let expr = self.with_no_in(true, Self::parse_expression)?;
            if let Some(is_of) = self.eat_for_each_keyword() {
                let head = ForHead {
                    kind: None,
                    target: self.expr_to_pattern(expr)?,
                };
                return self.parse_for_each(head, is_of);
            }
            Some(Box::new(ForInit::Expr(expr)))
        };

        self.expect_punct(";")?;
        let test = if self.is_punct(";") {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(";")?;
        let update = if self.is_punct(")") {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(")")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::For {
            init,
            test,
            update,
            body,
        })
    }

    /// `Some(true)` after `of`, `Some(false)` after `in`.
    fn eat_for_each_keyword(&mut self) -> Option<bool> {
        if self.is_ident_named("of") {
            self.advance();
            Some(true)
        } else if self.eat_keyword(Keyword::In) {
            Some(false)
        } else {
            None
        }
    }

    fn parse_for_each(&mut self, head: ForHead, is_of: bool) -> Result<Stmt, SyntaxError> {
        let right = if is_of {
            self.parse_assignment()?
        } else {
            self.parse_expression()?
        };
        self.expect_punct(")")?;
        let body = Box::new(self.parse_statement()?);
        Ok(if is_of {
            Stmt::ForOf {
                head,
                iterable: right,
                body,
            }
        } else {
            Stmt::ForIn {
                head,
                object: right,
                body,
            }
        })
    }

    fn parse_try(&mut self) -> Result<Stmt, SyntaxError> {
        self.advance();
        let block = self.parse_block()?;
        let mut param = None;
        let mut handler = None;
        let mut finalizer = None;
        if self.eat_keyword(Keyword::Catch) {
            if self.eat_punct("(") {
                param = Some(self.parse_binding_target()?);
                self.expect_punct(")")?;
            }
            handler = Some(self.parse_block()?);
        }
        if self.eat_keyword(Keyword::Finally) {
            finalizer = Some(self.parse_block()?);
        }
        if handler.is_none() && finalizer.is_none() {
            return Err(self.error_here("Missing catch or finally after try"));
        }
        Ok(Stmt::Try {
            block,
            param,
            handler,
            finalizer,
        })
    }

    fn parse_switch(&mut self) -> Result<Stmt, SyntaxError> {
        self.advance();
        let discriminant = self.parse_paren_expression()?;
        self.expect_punct("{")?;
        let mut cases = Vec::new();
        while !self.eat_punct("}") {
            let test = if self.eat_keyword(Keyword::Case) {
                Some(self.parse_expression()?)
            } else if self.eat_keyword(Keyword::Default) {
                None
            } else {
                return Err(self.unexpected());
            };
            self.expect_punct(":")?;
            let mut body = Vec::new();
            while !self.is_keyword(Keyword::Case)
                && !self.is_keyword(Keyword::Default)
                && !self.is_punct("}")
            {
                if self.at_eof() {
                    return Err(self.unexpected());
                }
                body.push(self.parse_statement()?);
            }
            cases.push(SwitchCase { test, body });
        }
        Ok(Stmt::Switch {
            discriminant,
            cases,
        })
    }

    // Bindings and functions

    fn parse_binding_target(&mut self) -> Result<Pattern, SyntaxError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Ident(name) => Ok(Pattern::Ident(name)),
            TokenKind::Punct("[") => {
                let mut elements = Vec::new();
                let mut rest = None;
                loop {
                    if self.eat_punct("]") {
                        break;
                    }
                    if self.eat_punct(",") {
                        elements.push(None);
                        continue;
                    }
                    if self.eat_punct("...") {
                        rest = Some(Box::new(self.parse_binding_target()?));
                        self.expect_punct("]")?;
                        break;
                    }
                    elements.push(Some(self.parse_binding_element()?));
                    if !self.is_punct("]") {
                        self.expect_punct(",")?;
                    }
                }
                Ok(Pattern::Array { elements, rest })
            }
            TokenKind::Punct("{") => {
                let mut props = Vec::new();
                let mut rest = None;
                loop {
                    if self.eat_punct("}") {
                        break;
                    }
                    if self.eat_punct("...") {
                        rest = Some(Box::new(self.parse_binding_target()?));
                        self.expect_punct("}")?;
                        break;
                    }
                    let key_token = self.peek().clone();
                    let PropKey::Named(key) = self.parse_property_name()? else {
                        return Err(unexpected_token(&key_token));
                    };
                    let value = if self.eat_punct(":") {
                        self.parse_binding_element()?
                    } else {
                        if !matches!(key_token.kind, TokenKind::Ident(_)) {
                            return Err(unexpected_token(&key_token));
                        }
                        let target = Pattern::Ident(key.clone());
                        if self.eat_punct("=") {
                            Pattern::Default {
                                target: Box::new(target),
                                default: Box::new(self.parse_assignment()?),
                            }
                        } else {
                            target
                        }
                    };
                    props.push((key, value));
                    if !self.is_punct("}") {
                        self.expect_punct(",")?;
                    }
                }
                Ok(Pattern::Object { props, rest })
            }
            _ => Err(unexpected_token(&token)),
        }
    }

    fn parse_binding_element(&mut self) -> Result<Pattern, SyntaxError> {
        let target = self.parse_binding_target()?;
        if self.eat_punct("=") {
            Ok(Pattern::Default {
                target: Box::new(target),
                default: Box::new(self.parse_assignment()?),
            })
        } else {
            Ok(target)
        }
    }

    fn parse_params(&mut self) -> Result<(Vec<Pattern>, Option<Pattern>), SyntaxError> {
        self.expect_punct("(")?;
        let mut params = Vec::new();
        let mut rest = None;
        while !self.eat_punct(")") {
            if self.eat_punct("...") {
                rest = Some(self.parse_binding_target()?);
                self.expect_punct(")")?;
                break;
            }
            params.push(self.parse_binding_element()?);
            if !self.is_punct(")") {
                self.expect_punct(",")?;
            }
        }
        Ok((params, rest))
    }

    /// Parses what follows the `function` keyword.
    fn parse_function_rest(
        &mut self,
        is_async: bool,
        require_name: bool,
    ) -> Result<Rc<FunctionDef>, SyntaxError> {
        if self.is_punct("*") {
            return Err(self.error_here("Generator functions are not supported"));
        }
        let name = match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Some(name)
            }
            _ if require_name => return Err(self.unexpected()),
            _ => None,
        };
        let (params, rest, body, uses_arguments) = self.parse_function_parts(is_async)?;
        Ok(Rc::new(FunctionDef {
            name,
            params,
            rest,
            body: FunctionBody::Block(body),
            is_async,
            is_arrow: false,
            uses_arguments,
        }))
    }

    /// Parameters and block body of a non-arrow function.
    fn parse_function_parts(
        &mut self,
        is_async: bool,
    ) -> Result<(Vec<Pattern>, Option<Pattern>, Vec<Stmt>, bool), SyntaxError> {
        let outer = std::mem::replace(&mut self.saw_arguments, false);
        let parsed = self.parse_params().and_then(|(params, rest)| {
            let body = self.in_function_scope(is_async, Self::parse_block)?;
            Ok((params, rest, body))
        });
        let uses_arguments = std::mem::replace(&mut self.saw_arguments, outer);
        let (params, rest, body) = parsed?;
        Ok((params, rest, body, uses_arguments))
    }

    fn matching_paren(&self, open: usize) -> Option<usize> {
        let mut depth = 0usize;
        for (index, token) in self.tokens.iter().enumerate().skip(open) {
            match token.kind {
                TokenKind::Punct("(" | "[" | "{") => depth += 1,
                TokenKind::Punct(")" | "]" | "}") => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Some(index);
                    }
                }
                TokenKind::Eof => return None,
                _ => {}
            }
        }
        None
    }

    fn try_parse_arrow(&mut self) -> Result<Option<Expr>, SyntaxError> {
        let is_async = self.is_ident_named("async")
            && !self.token_at(1).newline_before
            && matches!(self.kind_at(1), TokenKind::Ident(_) | TokenKind::Punct("("));
        let offset = usize::from(is_async);
        let params_end = match self.kind_at(offset) {
            TokenKind::Ident(_) => Some(offset),
            TokenKind::Punct("(") => self
                .matching_paren(self.pos + offset)
                .map(|end| end - self.pos),
            _ => None,
        };
        let Some(end) = params_end else {
            return Ok(None);
        };
        if *self.kind_at(end + 1) != TokenKind::Punct("=>") || self.token_at(end + 1).newline_before
        {
            return Ok(None);
        }

        if is_async {
            self.advance();
        }
        let (params, rest) = match &self.peek().kind {
            TokenKind::Ident(name) => {
                let param = Pattern::Ident(name.clone());
                self.advance();
                (vec![param], None)
            }
            _ => self.parse_params()?,
        };
        self.expect_punct("=>")?;
        let body = if self.is_punct("{") {
            FunctionBody::Block(self.in_function_scope(is_async, Self::parse_block)?)
        } else {
            FunctionBody::Expr(self.in_function_scope(is_async, Self::parse_assignment)?)
        };
        Ok(Some(Expr::Function(Rc::new(FunctionDef {
            name: None,
            params,
            rest,
            body,
            is_async,
            is_arrow: true,
            uses_arguments: false,
        }))))
    }

    // Expressions

    fn parse_expression(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.parse_assignment()?;
        if !self.is_punct(",") {
            return Ok(first);
        }
        let mut exprs = vec![first];
        while self.eat_punct(",") {
            exprs.push(self.parse_assignment()?);
        }
        Ok(Expr::Sequence(exprs))
    }

    fn parse_assignment(&mut self) -> Result<Expr, SyntaxError> {
        if let Some(arrow) = self.try_parse_arrow()? {
            return Ok(arrow);
        }
        let left = self.parse_conditional()?;
        let op = match &self.peek().kind {
            TokenKind::Punct(punct) => assign_op_for(punct),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        let target = match (op, left) {
            (AssignOp::Assign, left) => self.expr_to_pattern(left)?,
            (_, Expr::Ident(name)) => Pattern::Ident(name),
            (_, member @ Expr::Member { .. }) => Pattern::Member(Box::new(member)),
            _ => return Err(self.error_here("Invalid left-hand side in assignment")),
        };
        self.advance();
        let value = self.parse_assignment()?;
        Ok(Expr::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    fn expr_to_pattern(&self, expr: Expr) -> Result<Pattern, SyntaxError> {
        match expr {
            Expr::Ident(name) => Ok(Pattern::Ident(name)),
            member @ Expr::Member { .. } => Ok(Pattern::Member(Box::new(member))),
            Expr::Array(elems) => {
                let count = elems.len();
                let mut elements = Vec::new();
                let mut rest = None;
                for (index, elem) in elems.into_iter().enumerate() {
                    match elem {
                        ArrayElem::Hole => elements.push(None),
                        ArrayElem::Expr(expr) => elements.push(Some(self.expr_to_pattern(expr)?)),
                        ArrayElem::Spread(expr) if index + 1 == count => {
                            rest = Some(Box::new(self.expr_to_pattern(expr)?));
                        }
                        ArrayElem::Spread(_) => {
                            return Err(self.error_here("Rest element must be last element"));
                        }
                    }
                }
                Ok(Pattern::Array { elements, rest })
            }
            Expr::Object(defs) => {
                let count = defs.len();
                let mut props = Vec::new();
                let mut rest = None;
                for (index, def) in defs.into_iter().enumerate() {
                    match def {
                        PropDef::KeyValue(PropKey::Named(key), value) => {
                            props.push((key, self.expr_to_pattern(value)?));
                        }
                        PropDef::Spread(expr) if index + 1 == count => {
                            rest = Some(Box::new(self.expr_to_pattern(expr)?));
                        }
                        _ => {
                            return Err(self.error_here("Invalid destructuring assignment target"));
                        }
                    }
                }
                Ok(Pattern::Object { props, rest })
            }
            Expr::Assign {
                op: AssignOp::Assign,
                target,
                value,
            } => Ok(Pattern::Default {
                target,
                default: value,
            }),
            _ => Err(self.error_here("Invalid left-hand side in assignment")),
        }
    }

    fn parse_conditional(&mut self) -> Result<Expr, SyntaxError> {
        let test = self.parse_binary(1)?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let consequent = self.with_no_in(false, Self::parse_assignment)?;
        self.expect_punct(":")?;
        let alternate = self.parse_assignment()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        })
    }

    fn peek_infix(&self) -> Option<(u8, Infix)> {
        match &self.peek().kind {
            TokenKind::Punct(punct) => infix_for(punct),
            TokenKind::Keyword(Keyword::Instanceof) => {
                Some((7, Infix::Binary(BinaryOp::InstanceOf)))
            }
            TokenKind::Keyword(Keyword::In) if !self.no_in => Some((7, Infix::Binary(BinaryOp::In))),
            _ => None,
        }
    }

    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_unary()?;
        while let Some((precedence, op)) = self.peek_infix() {
            if precedence < min_precedence {
                break;
            }
            self.advance();
            // Exponentiation is right-associative.
            let next = if precedence == POW_PRECEDENCE {
                precedence
            } else {
                precedence + 1
            };
            let right = Box::new(self.parse_binary(next)?);
            let left_box = Box::new(left);
            left = match op {
                Infix::Binary(op) => Expr::Binary {
                    op,
                    left: left_box,
                    right,
                },
                Infix::Logical(op) => Expr::Logical {
                    op,
                    left: left_box,
                    right,
                },
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, SyntaxError> {
        let op = match &self.peek().kind {
            TokenKind::Punct("!") => UnaryOp::Not,
            TokenKind::Punct("-") => UnaryOp::Neg,
            TokenKind::Punct("+") => UnaryOp::Plus,
            TokenKind::Punct("~") => UnaryOp::BitNot,
            TokenKind::Keyword(Keyword::Typeof) => UnaryOp::Typeof,
            TokenKind::Keyword(Keyword::Void) => UnaryOp::Void,
            TokenKind::Keyword(Keyword::Delete) => UnaryOp::Delete,
            TokenKind::Punct(punct @ ("++" | "--")) => {
                let increment = *punct == "++";
                self.advance();
                let target = self.parse_unary()?;
                self.check_update_target(&target)?;
                return Ok(Expr::Update {
                    increment,
                    prefix: true,
                    target: Box::new(target),
                });
            }
            TokenKind::Keyword(Keyword::Await) => {
                if !self.in_async {
                    return Err(self.error_here(
                        "await is only valid in async functions and the top level bodies of modules",
                    ));
                }
                self.advance();
                let arg = self.parse_unary()?;
                return Ok(Expr::Await(Box::new(arg)));
            }
            _ => return self.parse_postfix(),
        };
        self.advance();
        let arg = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            arg: Box::new(arg),
        })
    }

    fn check_update_target(&self, target: &Expr) -> Result<(), SyntaxError> {
        match target {
            Expr::Ident(_) | Expr::Member { .. } => Ok(()),
            _ => Err(self.error_here("Invalid left-hand side expression in update operation")),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, SyntaxError> {
        let expr = self.parse_call_member()?;
        let increment = match &self.peek().kind {
            TokenKind::Punct("++") => true,
            TokenKind::Punct("--") => false,
            _ => return Ok(expr),
        };
        if self.peek().newline_before {
            return Ok(expr);
        }
        self.check_update_target(&expr)?;
        self.advance();
        Ok(Expr::Update {
            increment,
            prefix: false,
            target: Box::new(expr),
        })
    }

    fn parse_member_name(&mut self) -> Result<String, SyntaxError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Ident(name) => Ok(name),
            TokenKind::Keyword(keyword) => Ok(keyword.as_str().to_string()),
            _ => Err(unexpected_token(&token)),
        }
    }

    fn parse_call_member(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = if self.is_keyword(Keyword::New) {
            self.parse_new()?
        } else {
            self.parse_primary()?
        };
        loop {
            if self.eat_punct(".") {
                let name = self.parse_member_name()?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: MemberProp::Named(name),
                    optional: false,
                };
            } else if self.eat_punct("?.") {
                if self.is_punct("(") {
                    let args = self.parse_arguments()?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                        optional: true,
                    };
                } else if self.eat_punct("[") {
                    let property = self.with_no_in(false, Self::parse_expression)?;
                    self.expect_punct("]")?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: MemberProp::Computed(Box::new(property)),
                        optional: true,
                    };
                } else {
                    let name = self.parse_member_name()?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property: MemberProp::Named(name),
                        optional: true,
                    };
                }
            } else if self.eat_punct("[") {
                let property = self.with_no_in(false, Self::parse_expression)?;
                self.expect_punct("]")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: MemberProp::Computed(Box::new(property)),
                    optional: false,
                };
            } else if self.is_punct("(") {
                let args = self.parse_arguments()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    optional: false,
                };
            } else if matches!(self.peek().kind, TokenKind::Template(_))
                && !self.peek().newline_before
            {
                return Err(self.error_here("Tagged templates are not supported"));
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_new(&mut self) -> Result<Expr, SyntaxError> {
        self.advance();
        if self.is_punct(".") {
            return Err(self.error_here("new.target is not supported"));
        }
        let mut callee = if self.is_keyword(Keyword::New) {
            self.parse_new()?
        } else {
            self.parse_primary()?
        };
        loop {
            if self.eat_punct(".") {
                let name = self.parse_member_name()?;
                callee = Expr::Member {
                    object: Box::new(callee),
                    property: MemberProp::Named(name),
                    optional: false,
                };
            } else if self.eat_punct("[") {
                let property = self.with_no_in(false, Self::parse_expression)?;
                self.expect_punct("]")?;
                callee = Expr::Member {
                    object: Box::new(callee),
                    property: MemberProp::Computed(Box::new(property)),
                    optional: false,
                };
            } else {
                break;
            }
        }
        let args = if self.is_punct("(") {
            self.parse_arguments()?
        } else {
            Vec::new()
        };
        Ok(Expr::New {
            callee: Box::new(callee),
            args,
        })
    }

    fn parse_arguments(&mut self) -> Result<Vec<Arg>, SyntaxError> {
        self.expect_punct("(")?;
        self.with_no_in(false, |p| {
            let mut args = Vec::new();
            while !p.eat_punct(")") {
                if p.eat_punct("...") {
                    args.push(Arg::Spread(p.parse_assignment()?));
                } else {
                    args.push(Arg::Expr(p.parse_assignment()?));
                }
                if !p.is_punct(")") {
                    p.expect_punct(",")?;
                }
            }
            Ok(args)
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.advance();
        let expr = match token.kind {
            TokenKind::Number(n) => Expr::Number(n),
            TokenKind::String(s) => Expr::String(s.into()),
            TokenKind::Template(parts) => self.parse_template(parts)?,
            TokenKind::Ident(name) => {
                if name == "async"
                    && self.is_keyword(Keyword::Function)
                    && !self.peek().newline_before
                {
                    self.advance();
                    Expr::Function(self.parse_function_rest(true, false)?)
                } else {
                    if name == "arguments" {
                        self.saw_arguments = true;
                    }
                    Expr::Ident(name)
                }
            }
            TokenKind::Keyword(Keyword::True) => Expr::Bool(true),
            TokenKind::Keyword(Keyword::False) => Expr::Bool(false),
            TokenKind::Keyword(Keyword::Null) => Expr::Null,
            TokenKind::Keyword(Keyword::This) => Expr::This,
            TokenKind::Keyword(Keyword::Function) => {
                Expr::Function(self.parse_function_rest(false, false)?)
            }
            TokenKind::Keyword(Keyword::Class) => {
                return Err(self.error_here("Class expressions are not supported"));
            }
            TokenKind::Punct("(") => {
                let expr = self.with_no_in(false, Self::parse_expression)?;
                self.expect_punct(")")?;
                expr
            }
            TokenKind::Punct("[") => self.with_no_in(false, Self::parse_array_rest)?,
            TokenKind::Punct("{") => self.with_no_in(false, Self::parse_object_rest)?,
            TokenKind::Punct("/" | "/=") => {
                return Err(SyntaxError {
                    message: "Regular expressions are not supported".to_string(),
                    line: token.line,
                    col: token.col,
                });
            }
            _ => return Err(unexpected_token(&token)),
        };
        Ok(expr)
    }

    fn parse_array_rest(&mut self) -> Result<Expr, SyntaxError> {
        let mut elems = Vec::new();
        loop {
            if self.eat_punct("]") {
                return Ok(Expr::Array(elems));
            }
            if self.eat_punct(",") {
                elems.push(ArrayElem::Hole);
                continue;
            }
            let elem = if self.eat_punct("...") {
                ArrayElem::Spread(self.parse_assignment()?)
            } else {
                ArrayElem::Expr(self.parse_assignment()?)
            };
            elems.push(elem);
            if !self.is_punct("]") {
                self.expect_punct(",")?;
            }
        }
    }

    fn parse_property_name(&mut self) -> Result<PropKey, SyntaxError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Ident(name) | TokenKind::String(name) => Ok(PropKey::Named(name)),
            TokenKind::Keyword(keyword) => Ok(PropKey::Named(keyword.as_str().to_string())),
            TokenKind::Number(n) => Ok(PropKey::Named(format_number(n))),
            TokenKind::Punct("[") => {
                let key = self.with_no_in(false, Self::parse_assignment)?;
                self.expect_punct("]")?;
                Ok(PropKey::Computed(key))
            }
            _ => Err(unexpected_token(&token)),
        }
    }

    fn parse_object_rest(&mut self) -> Result<Expr, SyntaxError> {
        let mut defs = Vec::new();
        while !self.eat_punct("}") {
            if self.eat_punct("...") {
                defs.push(PropDef::Spread(self.parse_assignment()?));
            } else {
                defs.push(self.parse_property()?);
            }
            if !self.is_punct("}") {
                self.expect_punct(",")?;
            }
        }
        Ok(Expr::Object(defs))
    }

    fn parse_property(&mut self) -> Result<PropDef, SyntaxError> {
        let starts_name = |kind: &TokenKind| {
            !matches!(
                kind,
                TokenKind::Punct(":" | "(" | "," | "}" | "=") | TokenKind::Eof
            )
        };
        if (self.is_ident_named("get") || self.is_ident_named("set")) && starts_name(self.kind_at(1))
        {
            return Err(self.error_here("Getters and setters are not supported"));
        }
        let is_async = self.is_ident_named("async") && starts_name(self.kind_at(1));
        if is_async {
            self.advance();
        }
        if self.is_punct("*") {
            return Err(self.error_here("Generator methods are not supported"));
        }

        let key_token = self.peek().clone();
        let key = self.parse_property_name()?;
        if self.is_punct("(") {
            let (params, rest, body, uses_arguments) = self.parse_function_parts(is_async)?;
            // Methods do not bind their own name in scope.
            let method = Expr::Function(Rc::new(FunctionDef {
                name: None,
                params,
                rest,
                body: FunctionBody::Block(body),
                is_async,
                is_arrow: false,
                uses_arguments,
            }));
            return Ok(PropDef::KeyValue(key, method));
        }
        if is_async {
            return Err(self.unexpected());
        }
        if self.eat_punct(":") {
            return Ok(PropDef::KeyValue(key, self.parse_assignment()?));
        }
        match key_token.kind {
            TokenKind::Ident(name) => Ok(PropDef::KeyValue(
                PropKey::Named(name.clone()),
                Expr::Ident(name),
            )),
            _ => Err(self.unexpected()),
        }
    }

    fn parse_template(&mut self, parts: Vec<TemplatePart>) -> Result<Expr, SyntaxError> {
        let mut quasis = Vec::new();
        let mut exprs = Vec::new();
        for part in parts {
            match part {
                TemplatePart::Str(text) => quasis.push(text),
                TemplatePart::Expr { source, line, col } => {
                    let tokens = Lexer::starting_at(&source, line, col).tokenize()?;
                    let mut inner = Parser {
                        tokens,
                        pos: 0,
                        in_async: self.in_async,
                        in_function: self.in_function,
                        no_in: false,
                        saw_arguments: false,
                    };
                    let expr = inner.parse_expression()?;
                    if !inner.at_eof() {
                        return Err(inner.unexpected());
                    }
                    self.saw_arguments |= inner.saw_arguments;
                    exprs.push(expr);
                }
            }
        }
        Ok(Expr::Template { quasis, exprs })
    }
}

fn unexpected_token(token: &Token) -> SyntaxError {
    let message = match &token.kind {
        TokenKind::Eof => "Unexpected end of input".to_string(),
        TokenKind::Ident(name) => format!("Unexpected identifier '{name}'"),
        TokenKind::Number(_) => "Unexpected number".to_string(),
        TokenKind::String(_) => "Unexpected string".to_string(),
        TokenKind::Template(_) => "Unexpected template string".to_string(),
        TokenKind::Keyword(keyword) => format!("Unexpected token '{}'", keyword.as_str()),
        TokenKind::Punct(punct) => format!("Unexpected token '{punct}'"),
    };
    SyntaxError {
        message,
        line: token.line,
        col: token.col,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_function(source: &str) -> Rc<FunctionDef> {
        let program = parse(source).unwrap();
        match program.body.as_slice() {
            [Stmt::Function(def)] => def.clone(),
            other => panic!("Expected a single function, got {other:?}"),
        }
    }

    #[test]
    fn test_parses_function_declaration() {
        let def = single_function("function bubbleSort(arr) { return arr; }");
        assert_eq!(def.name.as_deref(), Some("bubbleSort"));
        assert_eq!(def.params.len(), 1);
        assert!(!def.is_async);
    }

    #[test]
    fn test_parses_async_function_with_await() {
        let def = single_function("async function f(x) { const y = await x; return y; }");
        assert!(def.is_async);
    }

    #[test]
    fn test_await_outside_async_is_rejected() {
        let err = parse("function f(x) { return await x; }").unwrap_err();
        assert!(err.message.contains("await is only valid"));
    }

    #[test]
    fn test_arrow_functions() {
        let program = parse("const f = (a, b = 2) => a + b; const g = x => { return x; };").unwrap();
        let Stmt::VarDecl { decls, .. } = &program.body[0] else {
            panic!("Expected declaration");
        };
        let Some(Expr::Function(def)) = &decls[0].init else {
            panic!("Expected arrow function");
        };
        assert!(def.is_arrow);
        assert_eq!(def.params.len(), 2);
        assert!(matches!(def.body, FunctionBody::Expr(_)));
    }

    #[test]
    fn test_parenthesized_expression_is_not_arrow() {
        let program = parse("let x = (1 + 2) * 3;").unwrap();
        let Stmt::VarDecl { decls, .. } = &program.body[0] else {
            panic!("Expected declaration");
        };
        assert!(matches!(
            decls[0].init,
            Some(Expr::Binary {
                op: BinaryOp::Mul,
                ..
            })
        ));
    }

    #[test]
    fn test_destructuring_swap() {
        let program = parse("[a[i], a[j]] = [a[j], a[i]];").unwrap();
        let Stmt::Expr(Expr::Assign { target, .. }) = &program.body[0] else {
            panic!("Expected assignment");
        };
        assert!(matches!(**target, Pattern::Array { ref elements, .. } if elements.len() == 2));
    }

    #[test]
    fn test_return_on_its_own_line_returns_undefined() {
        let def = single_function("function f() {\n  return\n  42;\n}");
        let FunctionBody::Block(body) = &def.body else {
            panic!("Expected block body");
        };
        assert!(matches!(body[0], Stmt::Return(None)));
    }

    #[test]
    fn test_for_of_and_classic_for() {
        let def = single_function(
            "function f(a) { for (const x of a) {} for (let i = 0; i < a.length; i++) {} for (const k in a) {} }",
        );
        let FunctionBody::Block(body) = &def.body else {
            panic!("Expected block body");
        };
        assert!(matches!(body[0], Stmt::ForOf { .. }));
        assert!(matches!(body[1], Stmt::For { .. }));
        assert!(matches!(body[2], Stmt::ForIn { .. }));
    }

    #[test]
    fn test_exponent_is_right_associative() {
        let program = parse("2 ** 3 ** 2;").unwrap();
        let Stmt::Expr(Expr::Binary { left, right, .. }) = &program.body[0] else {
            panic!("Expected binary expression");
        };
        assert!(matches!(**left, Expr::Number(n) if n == 2.0));
        assert!(matches!(**right, Expr::Binary { .. }));
    }

    #[test]
    fn test_template_substitutions_are_parsed() {
        let program = parse("`a${1 + 1}b`;").unwrap();
        let Stmt::Expr(Expr::Template { quasis, exprs }) = &program.body[0] else {
            panic!("Expected template");
        };
        assert_eq!(quasis, &vec!["a".to_string(), "b".to_string()]);
        assert_eq!(exprs.len(), 1);
    }

    #[test]
    fn test_object_literal_forms() {
        let program = parse("const o = { a, b: 1, 'c': 2, [k]: 3, ...rest, m() { return 1; } };")
            .unwrap();
        let Stmt::VarDecl { decls, .. } = &program.body[0] else {
            panic!("Expected declaration");
        };
        let Some(Expr::Object(defs)) = &decls[0].init else {
            panic!("Expected object literal");
        };
        assert_eq!(defs.len(), 6);
    }

    #[test]
    fn test_syntax_error_reports_location() {
        let err = parse("function f() {\n  return 1 +;\n}").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.message, "Unexpected token ';'");
    }

    #[test]
    fn test_unsupported_constructs_are_rejected() {
        assert!(parse("class A {}").is_err());
        assert!(parse("function* g() {}").is_err());
        assert!(parse("const r = /ab+c/;").is_err());
    }

    #[test]
    fn test_missing_closing_brace() {
        let err = parse("function f() { return 1;").unwrap_err();
        assert_eq!(err.message, "Unexpected end of input");
    }

    #[test]
    fn test_labeled_continue() {
        let def = single_function("function f() { outer: for (;;) { continue outer; } }");
        let FunctionBody::Block(body) = &def.body else {
            panic!("Expected block body");
        };
        assert!(matches!(&body[0], Stmt::Labeled { label, .. } if label == "outer"));
    }
}
