//! Recursive-descent parser producing the [`ast`](crate::ast) tree

use crate::ast::{BinOp, Block, Expr, Field, FuncBody, FuncName, Number, Stat, UnOp, UNARY_PRIORITY};
use crate::lexer::{tokenize, SpannedToken, Token};
use crate::{ProtectError, ProtectResult};

/// Nesting limit for blocks and expressions combined
const MAX_DEPTH: usize = 200;

/// Parse a Lua chunk
pub fn parse(source: &str) -> ProtectResult<Block> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let block = parser.block()?;
    if !parser.check(&Token::Eof) {
        return Err(parser.unexpected("'<eof>' expected"));
    }
    Ok(block)
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    depth: usize,
}

impl Parser {
    // ========================================================================
    // Token cursor
    // ========================================================================

    fn current(&self) -> &Token {
        // tokenize always ends with Eof, and the cursor never moves past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn peek_next(&self) -> &Token {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)].token
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.current() == token
    }

    fn accept(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> ProtectResult<()> {
        if self.accept(&token) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{token}' expected {what}")))
        }
    }

    fn expect_name(&mut self) -> ProtectResult<String> {
        match self.advance() {
            Token::Name(name) => Ok(name),
            other => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected(&format!("<name> expected near '{other}'")))
            }
        }
    }

    fn unexpected(&self, message: &str) -> ProtectError {
        ProtectError::parse(self.line(), message)
    }

    /// Run `f` one nesting level deeper
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> ProtectResult<T>) -> ProtectResult<T> {
        if self.depth >= MAX_DEPTH {
            return Err(self.unexpected("chunk has too many syntax levels"));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn block_follows(&self) -> bool {
        matches!(
            self.current(),
            Token::Eof | Token::End | Token::Else | Token::ElseIf | Token::Until
        )
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn block(&mut self) -> ProtectResult<Block> {
        self.nested(Self::block_stats)
    }

    fn block_stats(&mut self) -> ProtectResult<Block> {
        let mut stats = Vec::new();
        while !self.block_follows() {
            if self.check(&Token::Return) {
                stats.push(self.return_stat()?);
                break;
            }
            if let Some(stat) = self.statement()? {
                stats.push(stat);
            }
        }
        Ok(Block { stats })
    }

    fn return_stat(&mut self) -> ProtectResult<Stat> {
        self.advance();
        let exprs = if self.block_follows() || self.check(&Token::Semi) {
            Vec::new()
        } else {
            self.expr_list()?
        };
        self.accept(&Token::Semi);
        if !self.block_follows() {
            return Err(self.unexpected("'<eof>' expected after return"));
        }
        Ok(Stat::Return(exprs))
    }

    fn statement(&mut self) -> ProtectResult<Option<Stat>> {
        let stat = match self.current() {
            Token::Semi => {
                self.advance();
                return Ok(None);
            }
            Token::If => self.if_stat()?,
            Token::While => {
                self.advance();
                let cond = self.expr()?;
                self.expect(Token::Do, "after 'while' condition")?;
                let body = self.block()?;
                self.expect(Token::End, "to close 'while'")?;
                Stat::While { cond, body }
            }
            Token::Do => {
                self.advance();
                let body = self.block()?;
                self.expect(Token::End, "to close 'do'")?;
                Stat::Do(body)
            }
            Token::For => self.for_stat()?,
            Token::Repeat => {
                self.advance();
                let body = self.block()?;
                self.expect(Token::Until, "to close 'repeat'")?;
                let cond = self.expr()?;
                Stat::Repeat { body, cond }
            }
            Token::Function => {
                self.advance();
                let name = self.func_name()?;
                let body = self.func_body(name.method.is_some())?;
                Stat::Function { name, body }
            }
            Token::Local => {
                self.advance();
                if self.accept(&Token::Function) {
                    let name = self.expect_name()?;
                    let body = self.func_body(false)?;
                    Stat::LocalFunction { name, body }
                } else {
                    self.local_stat()?
                }
            }
            Token::DoubleColon => {
                self.advance();
                self.expect_name()?;
                self.expect(Token::DoubleColon, "to close label")?;
                Stat::Unhandled("label")
            }
            Token::Break => {
                self.advance();
                Stat::Break
            }
            Token::Goto => {
                self.advance();
                self.expect_name()?;
                Stat::Unhandled("goto")
            }
            _ => self.expr_stat()?,
        };
        Ok(Some(stat))
    }

    fn if_stat(&mut self) -> ProtectResult<Stat> {
        self.advance();
        let mut clauses = Vec::new();
        let cond = self.expr()?;
        self.expect(Token::Then, "after 'if' condition")?;
        clauses.push((cond, self.block()?));
        let mut else_block = None;
        loop {
            match self.current() {
                Token::ElseIf => {
                    self.advance();
                    let cond = self.expr()?;
                    self.expect(Token::Then, "after 'elseif' condition")?;
                    clauses.push((cond, self.block()?));
                }
                Token::Else => {
                    self.advance();
                    else_block = Some(self.block()?);
                    self.expect(Token::End, "to close 'if'")?;
                    break;
                }
                _ => {
                    self.expect(Token::End, "to close 'if'")?;
                    break;
                }
            }
        }
        Ok(Stat::If {
            clauses,
            else_block,
        })
    }

    fn for_stat(&mut self) -> ProtectResult<Stat> {
        self.advance();
        let first = self.expect_name()?;
        if self.accept(&Token::Assign) {
            let start = self.expr()?;
            self.expect(Token::Comma, "in numeric 'for'")?;
            let limit = self.expr()?;
            let step = if self.accept(&Token::Comma) {
                Some(self.expr()?)
            } else {
                None
            };
            self.expect(Token::Do, "in numeric 'for'")?;
            let body = self.block()?;
            self.expect(Token::End, "to close 'for'")?;
            return Ok(Stat::NumericFor {
                var: first,
                start,
                limit,
                step,
                body,
            });
        }

        let mut vars = vec![first];
        while self.accept(&Token::Comma) {
            vars.push(self.expect_name()?);
        }
        self.expect(Token::In, "in generic 'for'")?;
        let exprs = self.expr_list()?;
        self.expect(Token::Do, "in generic 'for'")?;
        let body = self.block()?;
        self.expect(Token::End, "to close 'for'")?;
        Ok(Stat::GenericFor { vars, exprs, body })
    }

    fn func_name(&mut self) -> ProtectResult<FuncName> {
        let base = self.expect_name()?;
        let mut fields = Vec::new();
        while self.accept(&Token::Dot) {
            fields.push(self.expect_name()?);
        }
        let method = if self.accept(&Token::Colon) {
            Some(self.expect_name()?)
        } else {
            None
        };
        Ok(FuncName {
            base,
            fields,
            method,
        })
    }

    fn func_body(&mut self, is_method: bool) -> ProtectResult<FuncBody> {
        self.expect(Token::LParen, "to open parameter list")?;
        let mut params = Vec::new();
        if is_method {
            params.push("self".to_string());
        }
        let mut is_vararg = false;
        if !self.check(&Token::RParen) {
            loop {
                if self.accept(&Token::DotDotDot) {
                    is_vararg = true;
                    break;
                }
                params.push(self.expect_name()?);
                if !self.accept(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "to close parameter list")?;
        let body = self.block()?;
        self.expect(Token::End, "to close 'function'")?;
        Ok(FuncBody {
            params,
            is_vararg,
            body,
        })
    }

    fn local_stat(&mut self) -> ProtectResult<Stat> {
        let mut names = Vec::new();
        loop {
            names.push(self.expect_name()?);
            // Attributes (<const>, <close>) are accepted and ignored
            if self.accept(&Token::Less) {
                self.expect_name()?;
                self.expect(Token::Greater, "to close attribute")?;
            }
            if !self.accept(&Token::Comma) {
                break;
            }
        }
        let exprs = if self.accept(&Token::Assign) {
            self.expr_list()?
        } else {
            Vec::new()
        };
        Ok(Stat::Local { names, exprs })
    }

    fn expr_stat(&mut self) -> ProtectResult<Stat> {
        let first = self.suffixed_expr()?;
        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut targets = vec![first];
            while self.accept(&Token::Comma) {
                targets.push(self.suffixed_expr()?);
            }
            self.expect(Token::Assign, "in assignment")?;
            for target in &targets {
                if !matches!(target, Expr::Name(_) | Expr::Index { .. }) {
                    return Err(self.unexpected("syntax error: cannot assign to expression"));
                }
            }
            let exprs = self.expr_list()?;
            return Ok(Stat::Assign { targets, exprs });
        }
        if !matches!(first, Expr::Call { .. } | Expr::MethodCall { .. }) {
            return Err(self.unexpected("syntax error: expression is not a statement"));
        }
        Ok(Stat::Call(first))
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn expr_list(&mut self) -> ProtectResult<Vec<Expr>> {
        let mut exprs = vec![self.expr()?];
        while self.accept(&Token::Comma) {
            exprs.push(self.expr()?);
        }
        Ok(exprs)
    }

    fn expr(&mut self) -> ProtectResult<Expr> {
        self.sub_expr(0)
    }

    /// Precedence climbing: parse operators whose left priority exceeds `limit`
    fn sub_expr(&mut self, limit: u8) -> ProtectResult<Expr> {
        self.nested(|p| p.sub_expr_at(limit))
    }

    fn sub_expr_at(&mut self, limit: u8) -> ProtectResult<Expr> {
        let mut lhs = if let Some(op) = unary_op(self.current()) {
            self.advance();
            let operand = self.sub_expr(UNARY_PRIORITY)?;
            Expr::Unary {
                op,
                operand: Box::new(operand),
            }
        } else {
            self.simple_expr()?
        };

        while let Some(op) = binary_op(self.current()) {
            let (left, right) = op.priority();
            if left <= limit {
                break;
            }
            self.advance();
            let rhs = self.sub_expr(right)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn simple_expr(&mut self) -> ProtectResult<Expr> {
        let expr = match self.current() {
            Token::Nil => Expr::Nil,
            Token::True => Expr::True,
            Token::False => Expr::False,
            Token::Integer(i) => Expr::Number(Number::Integer(*i)),
            Token::Float(f) => Expr::Number(Number::Float(*f)),
            Token::String(s) => Expr::String(s.clone()),
            Token::DotDotDot => Expr::Vararg,
            Token::LBrace => return self.table_constructor(),
            Token::Function => {
                self.advance();
                return Ok(Expr::Function(Box::new(self.func_body(false)?)));
            }
            _ => return self.suffixed_expr(),
        };
        self.advance();
        Ok(expr)
    }

    fn primary_expr(&mut self) -> ProtectResult<Expr> {
        match self.current() {
            Token::Name(_) => Ok(Expr::Name(self.expect_name()?)),
            Token::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(Token::RParen, "to close '('")?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            other => Err(self.unexpected(&format!("unexpected symbol near '{other}'"))),
        }
    }

    fn suffixed_expr(&mut self) -> ProtectResult<Expr> {
        let mut expr = self.primary_expr()?;
        loop {
            match self.current() {
                Token::Dot => {
                    self.advance();
                    let name = self.expect_name()?;
                    expr = Expr::Index {
                        obj: Box::new(expr),
                        key: Box::new(Expr::String(name.into_bytes())),
                    };
                }
                Token::LBracket => {
                    self.advance();
                    let key = self.expr()?;
                    self.expect(Token::RBracket, "to close '['")?;
                    expr = Expr::Index {
                        obj: Box::new(expr),
                        key: Box::new(key),
                    };
                }
                Token::Colon => {
                    self.advance();
                    let method = self.expect_name()?;
                    let args = self.call_args()?;
                    expr = Expr::MethodCall {
                        obj: Box::new(expr),
                        method,
                        args,
                    };
                }
                Token::LParen | Token::String(_) | Token::LBrace => {
                    let args = self.call_args()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn call_args(&mut self) -> ProtectResult<Vec<Expr>> {
        match self.current().clone() {
            Token::String(s) => {
                self.advance();
                Ok(vec![Expr::String(s)])
            }
            Token::LBrace => Ok(vec![self.table_constructor()?]),
            Token::LParen => {
                self.advance();
                if self.accept(&Token::RParen) {
                    return Ok(Vec::new());
                }
                let args = self.expr_list()?;
                self.expect(Token::RParen, "to close argument list")?;
                Ok(args)
            }
            other => Err(self.unexpected(&format!("function arguments expected near '{other}'"))),
        }
    }

    fn table_constructor(&mut self) -> ProtectResult<Expr> {
        self.expect(Token::LBrace, "to open table")?;
        let mut fields = Vec::new();
        while !self.check(&Token::RBrace) {
            let field = match (self.current(), self.peek_next()) {
                (Token::LBracket, _) => {
                    self.advance();
                    let key = self.expr()?;
                    self.expect(Token::RBracket, "to close table key")?;
                    self.expect(Token::Assign, "after table key")?;
                    Field::Keyed(key, self.expr()?)
                }
                (Token::Name(_), Token::Assign) => {
                    let name = self.expect_name()?;
                    self.advance();
                    Field::Named(name, self.expr()?)
                }
                _ => Field::Positional(self.expr()?),
            };
            fields.push(field);
            if !self.accept(&Token::Comma) && !self.accept(&Token::Semi) {
                break;
            }
        }
        self.expect(Token::RBrace, "to close table")?;
        Ok(Expr::Table(fields))
    }
}

fn unary_op(token: &Token) -> Option<UnOp> {
    match token {
        Token::Minus => Some(UnOp::Neg),
        Token::Not => Some(UnOp::Not),
        Token::Hash => Some(UnOp::Len),
        Token::Tilde => Some(UnOp::BNot),
        _ => None,
    }
}

fn binary_op(token: &Token) -> Option<BinOp> {
    let op = match token {
        Token::Plus => BinOp::Add,
        Token::Minus => BinOp::Sub,
        Token::Star => BinOp::Mul,
        Token::Slash => BinOp::Div,
        Token::DoubleSlash => BinOp::IDiv,
        Token::Percent => BinOp::Mod,
        Token::Caret => BinOp::Pow,
        Token::DotDot => BinOp::Concat,
        Token::Equal => BinOp::Eq,
        Token::NotEqual => BinOp::Ne,
        Token::Less => BinOp::Lt,
        Token::LessEq => BinOp::Le,
        Token::Greater => BinOp::Gt,
        Token::GreaterEq => BinOp::Ge,
        Token::And => BinOp::And,
        Token::Or => BinOp::Or,
        Token::Ampersand => BinOp::BAnd,
        Token::Pipe => BinOp::BOr,
        Token::Tilde => BinOp::BXor,
        Token::ShiftLeft => BinOp::Shl,
        Token::ShiftRight => BinOp::Shr,
        _ => return None,
    };
    Some(op)
}
