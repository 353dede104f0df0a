//! Recursive-descent parser for the sandbox language, over the token
//! stream produced by `lexer.rs`.
//!
//! Name resolution is enforced here, not at evaluation time: every
//! identifier reference must be one of the bound inputs
//! (`fetched_value`/`config_value`/`expected_value`/`result`), a
//! whitelisted builtin, or a name already assigned earlier in program
//! order (by `=` or a `for` target). A reference to anything else is
//! rejected immediately as a name error (§4.3.1) — the interpreter never
//! sees an unresolvable name.

use std::collections::HashSet;

use super::ast::{BinOp, BoolOp, CmpOp, Expr, Stmt, UnaryOp};
use super::lexer::Token;
use super::SandboxError;

pub const BOUND_NAMES: [&str; 4] = ["fetched_value", "config_value", "expected_value", "result"];

pub const BUILTINS: [&str; 25] = [
    "len", "str", "int", "float", "bool", "list", "dict", "set", "tuple", "any", "all", "max",
    "min", "sum", "sorted", "reversed", "enumerate", "zip", "range", "isinstance", "hasattr",
    "getattr", "abs", "round", "Exception",
];

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    known_names: HashSet<String>,
}

/// Parse sandbox logic text into a list of statements.
///
/// # Errors
///
/// Returns [`SandboxError::Syntax`] for malformed input or
/// [`SandboxError::NameError`] for a reference to a name that is neither a
/// bound input, a whitelisted builtin, nor already assigned earlier in the
/// program.
pub fn parse(tokens: Vec<Token>) -> Result<Vec<Stmt>, SandboxError> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        known_names: BOUND_NAMES.iter().map(|s| (*s).to_owned()).collect(),
    };
    let stmts = parser.block_at_top_level()?;
    parser.expect(&Token::Eof)?;
    Ok(stmts)
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens.get(self.pos).cloned().unwrap_or(Token::Eof);
        self.pos += 1;
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<(), SandboxError> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(SandboxError::Syntax(format!(
                "expected {expected:?}, found {:?}",
                self.peek()
            )))
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Token::Newline) {
            self.advance();
        }
    }

    fn block_at_top_level(&mut self) -> Result<Vec<Stmt>, SandboxError> {
        let mut stmts = Vec::new();
        self.skip_newlines();
        while !matches!(self.peek(), Token::Eof) {
            stmts.push(self.statement()?);
            self.skip_newlines();
        }
        Ok(stmts)
    }

    fn indented_block(&mut self) -> Result<Vec<Stmt>, SandboxError> {
        self.skip_newlines();
        self.expect(&Token::Indent)?;
        let mut stmts = Vec::new();
        self.skip_newlines();
        while !matches!(self.peek(), Token::Dedent | Token::Eof) {
            stmts.push(self.statement()?);
            self.skip_newlines();
        }
        self.expect(&Token::Dedent)?;
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt, SandboxError> {
        match self.peek() {
            Token::If => self.if_statement(),
            Token::For => self.for_statement(),
            Token::Pass => {
                self.advance();
                Ok(Stmt::Pass)
            }
            _ => self.assign_or_expr_statement(),
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, SandboxError> {
        let mut branches = Vec::new();
        self.expect(&Token::If)?;
        let cond = self.expression()?;
        self.expect(&Token::Colon)?;
        let body = self.indented_block()?;
        branches.push((cond, body));

        loop {
            match self.peek() {
                Token::Elif => {
                    self.advance();
                    let cond = self.expression()?;
                    self.expect(&Token::Colon)?;
                    let body = self.indented_block()?;
                    branches.push((cond, body));
                }
                _ => break,
            }
        }

        let else_body = if matches!(self.peek(), Token::Else) {
            self.advance();
            self.expect(&Token::Colon)?;
            self.indented_block()?
        } else {
            Vec::new()
        };

        Ok(Stmt::If(branches, else_body))
    }

    fn for_statement(&mut self) -> Result<Stmt, SandboxError> {
        self.expect(&Token::For)?;
        let target = match self.advance() {
            Token::Ident(name) => name,
            other => return Err(SandboxError::Syntax(format!("expected loop variable, found {other:?}"))),
        };
        self.expect(&Token::In)?;
        let iterable = self.expression()?;
        self.expect(&Token::Colon)?;
        self.known_names.insert(target.clone());
        let body = self.indented_block()?;
        Ok(Stmt::For(target, iterable, body))
    }

    fn assign_or_expr_statement(&mut self) -> Result<Stmt, SandboxError> {
        // Only plain `name = expr` assignment is supported — the sandbox
        // only ever needs to set `result` and intermediate scalars, never
        // attribute/index targets.
        if let Token::Ident(name) = self.peek().clone() {
            if self.tokens.get(self.pos + 1) == Some(&Token::Assign) {
                self.advance();
                self.advance();
                let value = self.expression()?;
                self.known_names.insert(name.clone());
                return Ok(Stmt::Assign(name, value));
            }
        }
        Ok(Stmt::Expr(self.expression()?))
    }

    // ---- expressions, precedence-climbing ----

    fn expression(&mut self) -> Result<Expr, SandboxError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, SandboxError> {
        let mut terms = vec![self.and_expr()?];
        while matches!(self.peek(), Token::Or) {
            self.advance();
            terms.push(self.and_expr()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            Expr::BoolOp(BoolOp::Or, terms)
        })
    }

    fn and_expr(&mut self) -> Result<Expr, SandboxError> {
        let mut terms = vec![self.not_expr()?];
        while matches!(self.peek(), Token::And) {
            self.advance();
            terms.push(self.not_expr()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            Expr::BoolOp(BoolOp::And, terms)
        })
    }

    fn not_expr(&mut self) -> Result<Expr, SandboxError> {
        if matches!(self.peek(), Token::Not) {
            self.advance();
            Ok(Expr::UnaryOp(UnaryOp::Not, Box::new(self.not_expr()?)))
        } else {
            self.comparison()
        }
    }

    fn comparison(&mut self) -> Result<Expr, SandboxError> {
        let left = self.additive()?;
        let mut comparisons = Vec::new();
        loop {
            let op = match self.peek() {
                Token::Eq => CmpOp::Eq,
                Token::NotEq => CmpOp::NotEq,
                Token::Lt => CmpOp::Lt,
                Token::Gt => CmpOp::Gt,
                Token::LtEq => CmpOp::LtEq,
                Token::GtEq => CmpOp::GtEq,
                Token::In => CmpOp::In,
                Token::Not if self.tokens.get(self.pos + 1) == Some(&Token::In) => {
                    self.advance();
                    CmpOp::NotIn
                }
                Token::Is => {
                    self.advance();
                    if matches!(self.peek(), Token::Not) {
                        self.advance();
                        self.expect(&Token::None)?;
                        let right = Expr::None;
                        comparisons.push((CmpOp::NotEq, right));
                        continue;
                    }
                    self.expect(&Token::None)?;
                    comparisons.push((CmpOp::Eq, Expr::None));
                    continue;
                }
                _ => break,
            };
            self.advance();
            let right = self.additive()?;
            comparisons.push((op, right));
        }
        if comparisons.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), comparisons))
        }
    }

    fn additive(&mut self) -> Result<Expr, SandboxError> {
        let mut node = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.multiplicative()?;
            node = Expr::BinOp(op, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn multiplicative(&mut self) -> Result<Expr, SandboxError> {
        let mut node = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.unary()?;
            node = Expr::BinOp(op, Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn unary(&mut self) -> Result<Expr, SandboxError> {
        if matches!(self.peek(), Token::Minus) {
            self.advance();
            Ok(Expr::UnaryOp(UnaryOp::Neg, Box::new(self.unary()?)))
        } else {
            self.postfix()
        }
    }

    fn postfix(&mut self) -> Result<Expr, SandboxError> {
        let mut node = self.atom()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let name = match self.advance() {
                        Token::Ident(n) => n,
                        other => return Err(SandboxError::Syntax(format!("expected attribute name, found {other:?}"))),
                    };
                    if matches!(self.peek(), Token::LParen) {
                        self.advance();
                        let args = self.call_args()?;
                        node = Expr::MethodCall(Box::new(node), name, args);
                    } else {
                        node = Expr::Attr(Box::new(node), name);
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(&Token::RBracket)?;
                    node = Expr::Index(Box::new(node), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn atom(&mut self) -> Result<Expr, SandboxError> {
        match self.advance() {
            Token::Int(n) => Ok(Expr::Int(n)),
            Token::Float(n) => Ok(Expr::Float(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::None => Ok(Expr::None),
            Token::Ident(name) => {
                if matches!(self.peek(), Token::LParen) {
                    self.advance();
                    let args = self.call_args()?;
                    if !BUILTINS.contains(&name.as_str()) {
                        return Err(SandboxError::NameError(name));
                    }
                    return Ok(Expr::Call(name, args));
                }
                if !self.known_names.contains(&name) && !BUILTINS.contains(&name.as_str()) {
                    return Err(SandboxError::NameError(name));
                }
                Ok(Expr::Name(name))
            }
            Token::LParen => {
                if let Some(var) = self.peek_comprehension_target() {
                    let (element, iterable, condition) = self.parse_comprehension_tail(var.clone())?;
                    self.expect(&Token::RParen)?;
                    return Ok(Expr::GeneratorExp(Box::new(element), var, Box::new(iterable), condition.map(Box::new)));
                }
                let first = self.expression()?;
                if matches!(self.peek(), Token::Comma) {
                    let mut items = vec![first];
                    while matches!(self.peek(), Token::Comma) {
                        self.advance();
                        if matches!(self.peek(), Token::RParen) {
                            break;
                        }
                        items.push(self.expression()?);
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Tuple(items))
                } else {
                    self.expect(&Token::RParen)?;
                    Ok(first)
                }
            }
            Token::LBracket => {
                if let Some(var) = self.peek_comprehension_target() {
                    let (element, iterable, condition) = self.parse_comprehension_tail(var.clone())?;
                    self.expect(&Token::RBracket)?;
                    return Ok(Expr::ListComp(Box::new(element), var, Box::new(iterable), condition.map(Box::new)));
                }
                let mut items = Vec::new();
                if !matches!(self.peek(), Token::RBracket) {
                    items.push(self.expression()?);
                    while matches!(self.peek(), Token::Comma) {
                        self.advance();
                        if matches!(self.peek(), Token::RBracket) {
                            break;
                        }
                        items.push(self.expression()?);
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Expr::List(items))
            }
            Token::LBrace => {
                let mut entries = Vec::new();
                if !matches!(self.peek(), Token::RBrace) {
                    loop {
                        let key = self.expression()?;
                        self.expect(&Token::Colon)?;
                        let value = self.expression()?;
                        entries.push((key, value));
                        if matches!(self.peek(), Token::Comma) {
                            self.advance();
                            if matches!(self.peek(), Token::RBrace) {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RBrace)?;
                Ok(Expr::Dict(entries))
            }
            other => Err(SandboxError::Syntax(format!("unexpected token {other:?}"))),
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, SandboxError> {
        let mut args = Vec::new();
        if !matches!(self.peek(), Token::RParen) {
            args.push(self.call_arg()?);
            while matches!(self.peek(), Token::Comma) {
                self.advance();
                if matches!(self.peek(), Token::RParen) {
                    break;
                }
                args.push(self.call_arg()?);
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }

    /// A single call argument, which may be a bare generator expression
    /// (`sum(1 for m in fetched_value if ...)`) — Python only requires the
    /// wrapping parens for a generator expression when it isn't already the
    /// sole argument of a call.
    fn call_arg(&mut self) -> Result<Expr, SandboxError> {
        if let Some(var) = self.peek_comprehension_target() {
            let (element, iterable, condition) = self.parse_comprehension_tail(var.clone())?;
            return Ok(Expr::GeneratorExp(Box::new(element), var, Box::new(iterable), condition.map(Box::new)));
        }
        self.expression()
    }

    /// Look ahead from the current position for a top-level `for NAME in`
    /// clause, without consuming any tokens. Depth-tracks brackets so a
    /// nested call or index (`x.get(y)`) isn't mistaken for the end of the
    /// enclosing expression. Returns the loop variable name if found.
    fn peek_comprehension_target(&self) -> Option<String> {
        let mut depth = 0i32;
        let mut i = self.pos;
        loop {
            let tok = self.tokens.get(i)?;
            match tok {
                Token::LParen | Token::LBracket | Token::LBrace => depth += 1,
                Token::RParen | Token::RBracket | Token::RBrace => {
                    if depth == 0 {
                        return None;
                    }
                    depth -= 1;
                }
                Token::Comma if depth == 0 => return None,
                Token::Newline | Token::Eof => return None,
                Token::For if depth == 0 => {
                    return match (self.tokens.get(i + 1), self.tokens.get(i + 2)) {
                        (Some(Token::Ident(name)), Some(Token::In)) => Some(name.clone()),
                        _ => None,
                    };
                }
                _ => {}
            }
            i += 1;
        }
    }

    /// Parse `ELEMENT for VAR in ITERABLE [if COND]` once
    /// `peek_comprehension_target` has confirmed `VAR` is the loop variable.
    /// `VAR` is registered as a known name before `ELEMENT` is parsed, since
    /// the element expression is written before its binding in source order
    /// (`m.get('role') for m in fetched_value`).
    fn parse_comprehension_tail(&mut self, var: String) -> Result<(Expr, Expr, Option<Expr>), SandboxError> {
        let was_known = self.known_names.contains(&var);
        self.known_names.insert(var.clone());
        let element = self.expression()?;
        self.expect(&Token::For)?;
        match self.advance() {
            Token::Ident(name) if name == var => {}
            other => return Err(SandboxError::Syntax(format!("expected loop variable {var}, found {other:?}"))),
        }
        self.expect(&Token::In)?;
        let iterable = self.expression()?;
        let condition = if matches!(self.peek(), Token::If) {
            self.advance();
            Some(self.expression()?)
        } else {
            None
        };
        if !was_known {
            self.known_names.remove(&var);
        }
        Ok((element, iterable, condition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::lexer::tokenize;

    fn parse_src(src: &str) -> Result<Vec<Stmt>, SandboxError> {
        parse(tokenize(src).unwrap())
    }

    #[test]
    fn test_simple_assignment_parses() {
        let stmts = parse_src("result = fetched_value == expected_value").unwrap();
        assert_eq!(stmts.len(), 1);
        assert!(matches!(stmts[0], Stmt::Assign(_, Expr::Compare(..))));
    }

    #[test]
    fn test_unknown_name_rejected_at_parse_time() {
        let err = parse_src("result = os.system('ls')").unwrap_err();
        assert!(matches!(err, SandboxError::NameError(_)));
    }

    #[test]
    fn test_non_whitelisted_call_rejected() {
        let err = parse_src("result = eval('1')").unwrap_err();
        assert!(matches!(err, SandboxError::NameError(_)));
    }

    #[test]
    fn test_if_else_block_parses() {
        let src = "if fetched_value:\n    result = True\nelse:\n    result = False\n";
        let stmts = parse_src(src).unwrap();
        assert_eq!(stmts.len(), 1);
        assert!(matches!(stmts[0], Stmt::If(..)));
    }

    #[test]
    fn test_for_loop_registers_target_name() {
        let src = "for item in fetched_value:\n    result = item\n";
        let stmts = parse_src(src).unwrap();
        assert!(matches!(stmts[0], Stmt::For(..)));
    }

    #[test]
    fn test_method_call_parses() {
        let stmts = parse_src("result = fetched_value.get('role')").unwrap();
        match &stmts[0] {
            Stmt::Assign(_, Expr::MethodCall(_, name, args)) => {
                assert_eq!(name, "get");
                assert_eq!(args.len(), 1);
            }
            other => panic!("expected method call assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_generator_expression_as_sole_call_arg_parses() {
        let src = "result = any(m.get('role')=='admin' for m in fetched_value)";
        let stmts = parse_src(src).unwrap();
        match &stmts[0] {
            Stmt::Assign(_, Expr::Call(name, args)) => {
                assert_eq!(name, "any");
                assert_eq!(args.len(), 1);
                assert!(matches!(args[0], Expr::GeneratorExp(..)));
            }
            other => panic!("expected any(...) call, got {other:?}"),
        }
    }

    #[test]
    fn test_generator_expression_with_if_clause_parses() {
        let src = "result = sum(1 for member in fetched_value if member.get('role') == 'admin')";
        let stmts = parse_src(src).unwrap();
        match &stmts[0] {
            Stmt::Assign(_, Expr::Call(name, args)) => {
                assert_eq!(name, "sum");
                match &args[0] {
                    Expr::GeneratorExp(_, var, _, condition) => {
                        assert_eq!(var, "member");
                        assert!(condition.is_some());
                    }
                    other => panic!("expected generator expression, got {other:?}"),
                }
            }
            other => panic!("expected sum(...) call, got {other:?}"),
        }
    }

    #[test]
    fn test_list_comprehension_parses() {
        let stmts = parse_src("result = [m.get('role') for m in fetched_value]").unwrap();
        assert!(matches!(stmts[0], Stmt::Assign(_, Expr::ListComp(..))));
    }

    #[test]
    fn test_comprehension_target_does_not_leak_into_outer_scope() {
        let src = "result = any(m for m in fetched_value)\nresult2 = m\n";
        let err = parse_src(src).unwrap_err();
        assert!(matches!(err, SandboxError::NameError(_)));
    }
}
