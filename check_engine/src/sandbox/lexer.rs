//! Indentation-sensitive tokenizer for the custom-predicate sandbox
//! language — a restricted, Python-flavoured expression/statement grammar,
//! since the Check generator's `logic` text is LLM-authored Python-like
//! snippets (see `con_mon_v2/utils/llm/prompts.py`'s generated check
//! bodies). Only the subset of Python syntax §4.3.1 requires is tokenized;
//! anything else falls out as an `Unknown` token, rejected by the parser.

use super::SandboxError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    // Keywords
    If,
    Elif,
    Else,
    For,
    In,
    NotIn,
    And,
    Or,
    Not,
    Is,
    IsNot,
    True,
    False,
    None,
    Pass,
    // Punctuation
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Newline,
    Indent,
    Dedent,
    Eof,
}

struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    indent_stack: Vec<usize>,
    at_line_start: bool,
    source: &'a str,
}

/// Tokenize sandbox logic text into a flat token stream with explicit
/// `Indent`/`Dedent`/`Newline` markers, mirroring CPython's tokenizer
/// closely enough to drive a recursive-descent parser over block
/// statements (`if`/`elif`/`else`, `for`).
pub fn tokenize(source: &str) -> Result<Vec<Token>, SandboxError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        indent_stack: vec![0],
        at_line_start: true,
        source,
    };
    lexer.run()
}

impl<'a> Lexer<'a> {
    fn run(&mut self) -> Result<Vec<Token>, SandboxError> {
        let mut tokens = Vec::new();
        loop {
            if self.at_line_start {
                if !self.handle_indentation(&mut tokens)? {
                    break;
                }
            }
            self.skip_inline_whitespace();
            if self.peek() == Some('#') {
                self.skip_to_eol();
            }
            match self.peek() {
                None => {
                    if matches!(tokens.last(), Some(Token::Newline) | None) {
                        // no trailing blank newline needed
                    } else {
                        tokens.push(Token::Newline);
                    }
                    break;
                }
                Some('\n') => {
                    self.advance();
                    tokens.push(Token::Newline);
                    self.at_line_start = true;
                }
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some(c) if c.is_ascii_digit() => tokens.push(self.lex_number()),
                Some(c) if c.is_alphabetic() || c == '_' => tokens.push(self.lex_ident_or_keyword()),
                Some('\'') | Some('"') => tokens.push(self.lex_string()?),
                Some(_) => tokens.push(self.lex_punct()?),
            }
        }
        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            tokens.push(Token::Dedent);
        }
        tokens.push(Token::Eof);
        Ok(tokens)
    }

    fn handle_indentation(&mut self, tokens: &mut Vec<Token>) -> Result<bool, SandboxError> {
        let start = self.pos;
        let mut width = 0usize;
        while let Some(c) = self.chars.get(self.pos) {
            match c {
                ' ' => {
                    width += 1;
                    self.pos += 1;
                }
                '\t' => {
                    width += 8;
                    self.pos += 1;
                }
                _ => break,
            }
        }
        // Blank line or comment-only line: consume and restart without
        // changing indentation state.
        match self.peek() {
            None => {
                self.pos = start;
                return Ok(false);
            }
            Some('\n') => {
                self.advance();
                return Ok(true);
            }
            Some('#') => {
                self.skip_to_eol();
                return Ok(true);
            }
            _ => {}
        }

        self.at_line_start = false;
        let current = *self.indent_stack.last().unwrap();
        if width > current {
            self.indent_stack.push(width);
            tokens.push(Token::Indent);
        } else {
            while width < *self.indent_stack.last().unwrap() {
                self.indent_stack.pop();
                tokens.push(Token::Dedent);
            }
            if *self.indent_stack.last().unwrap() != width {
                return Err(SandboxError::Syntax("inconsistent indentation".to_owned()));
            }
        }
        Ok(true)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied();
        self.pos += 1;
        c
    }

    fn skip_inline_whitespace(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.pos += 1;
        }
    }

    fn skip_to_eol(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn lex_number(&mut self) -> Token {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        let mut is_float = false;
        if self.peek() == Some('.') && matches!(self.chars.get(self.pos + 1), Some(c) if c.is_ascii_digit()) {
            is_float = true;
            self.pos += 1;
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if is_float {
            Token::Float(text.parse().unwrap_or(0.0))
        } else {
            Token::Int(text.parse().unwrap_or(0))
        }
    }

    fn lex_ident_or_keyword(&mut self) -> Token {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        match text.as_str() {
            "if" => Token::If,
            "elif" => Token::Elif,
            "else" => Token::Else,
            "for" => Token::For,
            "in" => Token::In,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "is" => Token::Is,
            "True" => Token::True,
            "False" => Token::False,
            "None" => Token::None,
            "pass" => Token::Pass,
            _ => Token::Ident(text),
        }
    }

    fn lex_string(&mut self) -> Result<Token, SandboxError> {
        let quote = self.advance().unwrap();
        let mut s = String::new();
        loop {
            match self.advance() {
                None => return Err(SandboxError::Syntax("unterminated string literal".to_owned())),
                Some(c) if c == quote => break,
                Some('\\') => match self.advance() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some(other) => s.push(other),
                    None => return Err(SandboxError::Syntax("unterminated string literal".to_owned())),
                },
                Some(c) => s.push(c),
            }
        }
        Ok(Token::Str(s))
    }

    fn lex_punct(&mut self) -> Result<Token, SandboxError> {
        let c = self.advance().unwrap();
        let token = match c {
            '=' if self.peek() == Some('=') => {
                self.advance();
                Token::Eq
            }
            '=' => Token::Assign,
            '!' if self.peek() == Some('=') => {
                self.advance();
                Token::NotEq
            }
            '<' if self.peek() == Some('=') => {
                self.advance();
                Token::LtEq
            }
            '<' => Token::Lt,
            '>' if self.peek() == Some('=') => {
                self.advance();
                Token::GtEq
            }
            '>' => Token::Gt,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            ':' => Token::Colon,
            '.' => Token::Dot,
            other => {
                return Err(SandboxError::Syntax(format!(
                    "unexpected character '{other}' (context: {:.30})",
                    self.source
                )))
            }
        };
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_assignment() {
        let tokens = tokenize("result = fetched_value == expected_value").unwrap();
        assert!(tokens.contains(&Token::Assign));
        assert!(tokens.contains(&Token::Eq));
        assert_eq!(tokens.last(), Some(&Token::Eof));
    }

    #[test]
    fn test_indent_dedent_tracked() {
        let src = "if fetched_value:\n    result = True\nelse:\n    result = False\n";
        let tokens = tokenize(src).unwrap();
        assert!(tokens.contains(&Token::Indent));
        assert!(tokens.contains(&Token::Dedent));
    }

    #[test]
    fn test_comment_only_line_ignored() {
        let tokens = tokenize("# just a comment\n").unwrap();
        assert_eq!(tokens, vec![Token::Eof]);
    }
}
