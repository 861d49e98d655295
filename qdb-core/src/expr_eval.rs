//! 式評価エンジン
//!
//! ロケーション・条件・ビルトイン引数で使う式をパースし、u64として評価します。
//!
//! - 数値: `0x401000`, `42`
//! - レジスタ: `rax`, `pc`, `eax`, `r8d`
//! - シンボル: `main`, `libc.so.6!malloc`, `` `app::run` ``
//! - 文字列: `"text"`（ビルトイン引数のみ）
//! - 演算子: 単項 `- ! ~`、二項 `* / % + - << >> & ^ | == != < <= > >= && ||`
//! - メモリ読み出し: `poi(x)`, `qword(x)`, `dword(x)`, `word(x)`, `byte(x)`

use crate::inferior::Inferior;
use crate::parse::parse_number;
use crate::Result;
use qdb_target::registers::canonical_name;
use std::fmt;

/// 式の抽象構文木
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Number(u64),
    /// レジスタ名またはシンボル名
    Ident(String),
    /// バッククォートで囲まれたシンボル名
    Symbol(String),
    Str(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    BitAnd,
    BitXor,
    BitOr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    /// 演算子の結合力（大きいほど強い）
    fn binding_power(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::BitOr => 3,
            BinaryOp::BitXor => 4,
            BinaryOp::BitAnd => 5,
            BinaryOp::Eq | BinaryOp::Ne => 6,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 7,
            BinaryOp::Shl | BinaryOp::Shr => 8,
            BinaryOp::Add | BinaryOp::Sub => 9,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 10,
        }
    }

    fn from_symbol(op: &str) -> Option<Self> {
        Some(match op {
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Rem,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "<<" => BinaryOp::Shl,
            ">>" => BinaryOp::Shr,
            "&" => BinaryOp::BitAnd,
            "^" => BinaryOp::BitXor,
            "|" => BinaryOp::BitOr,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "&&" => BinaryOp::And,
            "||" => BinaryOp::Or,
            _ => return None,
        })
    }
}

/// 単項演算子の結合力
const UNARY_BINDING_POWER: u8 = 11;

/// 2文字の演算子（1文字より先に照合する）
const TWO_CHAR_OPS: &[&str] = &["<<", ">>", "<=", ">=", "==", "!=", "&&", "||"];
const ONE_CHAR_OPS: &[&str] = &["*", "/", "%", "+", "-", "&", "^", "|", "<", ">", "!", "~"];

/// メモリ読み出し関数と読み出しサイズ
const MEMORY_READERS: &[(&str, usize)] = &[("poi", 8), ("qword", 8), ("dword", 4), ("word", 2), ("byte", 1)];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Number(u64),
    Ident(String),
    Symbol(String),
    Str(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Ident(s) => f.write_str(s),
            Token::Symbol(s) => write!(f, "`{}`", s),
            Token::Str(s) => write!(f, "{:?}", s),
            Token::Op(op) => f.write_str(op),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Comma => f.write_str(","),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || matches!(c, '_' | '$' | '@' | '.')
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '@' | '.' | ':')
}

/// 字句解析
fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '"' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('"') => break,
                        Some('\\') => {
                            let escaped = match chars.get(i + 1) {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some(c) => *c,
                                None => return Err(anyhow::anyhow!("Unterminated string literal")),
                            };
                            value.push(escaped);
                            i += 2;
                        }
                        Some(c) => {
                            value.push(*c);
                            i += 1;
                        }
                        None => return Err(anyhow::anyhow!("Unterminated string literal")),
                    }
                }
                i += 1;
                tokens.push(Token::Str(value));
            }
            '`' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|c| *c == '`')
                    .ok_or_else(|| anyhow::anyhow!("Unterminated quoted symbol"))?;
                let name: String = chars[i + 1..i + 1 + end].iter().collect();
                if name.is_empty() {
                    return Err(anyhow::anyhow!("Empty quoted symbol"));
                }
                tokens.push(Token::Symbol(name));
                i += end + 2;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_alphanumeric() {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(parse_number(&literal)?));
            }
            c if is_ident_start(c) => {
                let start = i;
                loop {
                    match chars.get(i) {
                        Some(c) if is_ident_char(*c) => i += 1,
                        // module!symbol（`!=` は演算子）
                        Some('!') if chars.get(i + 1).is_some_and(|c| is_ident_start(*c)) => i += 1,
                        _ => break,
                    }
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = TWO_CHAR_OPS
                    .iter()
                    .chain(ONE_CHAR_OPS.iter())
                    .find(|op| rest.starts_with(**op))
                    .ok_or_else(|| anyhow::anyhow!("Unexpected character '{}' in expression", c))?;
                tokens.push(Token::Op(*op));
                i += op.len();
            }
        }
    }

    Ok(tokens)
}

/// Prattパーサ
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(anyhow::anyhow!("Expected '{}' but found '{}'", expected, token)),
            None => Err(anyhow::anyhow!("Expected '{}' but reached end of expression", expected)),
        }
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = self.parse_prefix()?;

        while let Some(Token::Op(symbol)) = self.peek() {
            let Some(op) = BinaryOp::from_symbol(symbol) else {
                break;
            };
            let bp = op.binding_power();
            if bp <= min_bp {
                break;
            }
            self.pos += 1;
            let rhs = self.parse_expr(bp)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }

        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Symbol(s)) => Ok(Expr::Symbol(s)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let args = self.parse_args()?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr(0)?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Op(op)) => {
                let op = match op {
                    "-" => UnaryOp::Neg,
                    "!" => UnaryOp::Not,
                    "~" => UnaryOp::BitNot,
                    other => return Err(anyhow::anyhow!("Unexpected operator '{}'", other)),
                };
                let operand = self.parse_expr(UNARY_BINDING_POWER)?;
                Ok(Expr::Unary {
                    op,
                    operand: Box::new(operand),
                })
            }
            Some(token) => Err(anyhow::anyhow!("Unexpected '{}'", token)),
            None => Err(anyhow::anyhow!("Unexpected end of expression")),
        }
    }

    /// `(` の直後から `)` までの引数リスト
    fn parse_args(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr(0)?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                Some(token) => return Err(anyhow::anyhow!("Expected ',' or ')' but found '{}'", token)),
                None => return Err(anyhow::anyhow!("Unclosed argument list")),
            }
        }
    }
}

/// 式をパースする
pub fn parse_expression(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(anyhow::anyhow!("Empty expression"));
    }

    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr(0)?;
    if let Some(token) = parser.peek() {
        return Err(anyhow::anyhow!("Unexpected '{}' after expression", token));
    }
    Ok(expr)
}

/// 式評価器
pub struct ExpressionEvaluator<'a> {
    inferior: &'a dyn Inferior,
}

impl<'a> ExpressionEvaluator<'a> {
    /// 新しい式評価器を作成する
    pub fn new(inferior: &'a dyn Inferior) -> Self {
        Self { inferior }
    }

    /// 文字列の式をパースして評価する
    pub fn evaluate_str(&self, input: &str) -> Result<u64> {
        let expr = parse_expression(input)?;
        self.evaluate(&expr)
            .map_err(|e| anyhow::anyhow!("Failed to evaluate '{}': {}", input.trim(), e))
    }

    /// 式を評価する
    pub fn evaluate(&self, expr: &Expr) -> Result<u64> {
        match expr {
            Expr::Number(n) => Ok(*n),
            Expr::Ident(name) => self.eval_ident(name),
            Expr::Symbol(name) => self.inferior.resolve_symbol(name),
            Expr::Str(_) => Err(anyhow::anyhow!("String literal is not a numeric value")),
            Expr::Unary { op, operand } => {
                let value = self.evaluate(operand)?;
                Ok(match op {
                    UnaryOp::Neg => value.wrapping_neg(),
                    UnaryOp::Not => (value == 0) as u64,
                    UnaryOp::BitNot => !value,
                })
            }
            Expr::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs),
            Expr::Call { name, args } => self.eval_call(name, args),
        }
    }

    /// 識別子はレジスタ名を優先し、それ以外はシンボルとして解決する
    fn eval_ident(&self, name: &str) -> Result<u64> {
        if canonical_name(name).is_some() {
            self.inferior.register(name)
        } else {
            self.inferior.resolve_symbol(name)
        }
    }

    fn eval_binary(&self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<u64> {
        let l = self.evaluate(lhs)?;

        // 論理演算は短絡評価
        match op {
            BinaryOp::And if l == 0 => return Ok(0),
            BinaryOp::Or if l != 0 => return Ok(1),
            _ => {}
        }

        let r = self.evaluate(rhs)?;
        Ok(match op {
            BinaryOp::Mul => l.wrapping_mul(r),
            BinaryOp::Div => l.checked_div(r).ok_or_else(|| anyhow::anyhow!("Division by zero"))?,
            BinaryOp::Rem => l.checked_rem(r).ok_or_else(|| anyhow::anyhow!("Division by zero"))?,
            BinaryOp::Add => l.wrapping_add(r),
            BinaryOp::Sub => l.wrapping_sub(r),
            BinaryOp::Shl => u32::try_from(r).ok().and_then(|r| l.checked_shl(r)).unwrap_or(0),
            BinaryOp::Shr => u32::try_from(r).ok().and_then(|r| l.checked_shr(r)).unwrap_or(0),
            BinaryOp::BitAnd => l & r,
            BinaryOp::BitXor => l ^ r,
            BinaryOp::BitOr => l | r,
            BinaryOp::Eq => (l == r) as u64,
            BinaryOp::Ne => (l != r) as u64,
            BinaryOp::Lt => (l < r) as u64,
            BinaryOp::Le => (l <= r) as u64,
            BinaryOp::Gt => (l > r) as u64,
            BinaryOp::Ge => (l >= r) as u64,
            BinaryOp::And | BinaryOp::Or => (r != 0) as u64,
        })
    }

    fn eval_call(&self, name: &str, args: &[Expr]) -> Result<u64> {
        let (_, size) = MEMORY_READERS
            .iter()
            .find(|(reader, _)| *reader == name)
            .ok_or_else(|| anyhow::anyhow!("Unknown function '{}'", name))?;

        let [arg] = args else {
            return Err(anyhow::anyhow!("{}() takes exactly one argument", name));
        };
        let addr = self.evaluate(arg)?;
        self.inferior.read_uint(addr, *size)
    }
}
