use crate::expr::{BinaryOp, Expr, Function, TIME_SYMBOL};
use crate::traits::Scalar;
use anyhow::{bail, Result};
use std::collections::HashMap;
use thiserror::Error;

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Scalar` values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a call argument (by index) onto the stack.
    /// Indices follow the argument ordering the function was compiled with.
    LoadArg(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes -a.
    Neg,
    /// Pops top value (a), pushes f(a).
    Call(Function),
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }
}

/// Stack-based Virtual Machine for evaluating equations.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `args`: Argument values in compiled order (read-only).
/// - `stack`: A mutable buffer for intermediate computations.
///
/// Returns the result of the evaluation (the value left on the stack).
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(bytecode: &Bytecode, args: &[T], stack: &mut Vec<T>) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => {
                    stack.push(T::from_f64(*val).unwrap_or_else(T::nan));
                }
                OpCode::LoadArg(idx) => {
                    stack.push(args[*idx]);
                }
                OpCode::Add => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a + b);
                }
                OpCode::Sub => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a - b);
                }
                OpCode::Mul => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a * b);
                }
                OpCode::Div => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a / b);
                }
                OpCode::Pow => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a.powf(b));
                }
                OpCode::Neg => {
                    let a = stack.pop().unwrap_or_else(T::nan);
                    stack.push(-a);
                }
                OpCode::Call(function) => {
                    let a = stack.pop().unwrap_or_else(T::nan);
                    stack.push(function.apply(a));
                }
            }
        }

        // The compiler always leaves exactly one value; NaN flags malformed hand-written bytecode.
        stack.pop().unwrap_or_else(T::nan)
    }
}

fn pop_pair<T: Scalar>(stack: &mut Vec<T>) -> (T, T) {
    let b = stack.pop().unwrap_or_else(T::nan);
    let a = stack.pop().unwrap_or_else(T::nan);
    (a, b)
}

/// Identifies an argument slot by symbol kind and name, so a constant named `t`
/// never resolves to the time argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgKey {
    Time,
    Dynamic(String),
    Constant(String),
}

impl ArgKey {
    pub fn of(expr: &Expr) -> Option<Self> {
        match expr {
            Expr::Time => Some(ArgKey::Time),
            Expr::Dynamic(name) => Some(ArgKey::Dynamic(name.clone())),
            Expr::Constant(name) => Some(ArgKey::Constant(name.clone())),
            _ => None,
        }
    }
}

/// Compiles an `Expr` into `Bytecode`.
/// Resolves symbols to argument indices following the given argument order.
pub struct Compiler {
    pub arg_map: HashMap<ArgKey, usize>,
}

impl Compiler {
    /// `args` must be symbols: time, dynamic or constant.
    pub fn new(args: &[Expr]) -> Result<Self> {
        let mut arg_map = HashMap::new();
        for (i, arg) in args.iter().enumerate() {
            let Some(key) = ArgKey::of(arg) else {
                bail!("Argument {} ({}) is not a symbol.", i, arg);
            };
            if arg_map.insert(key, i).is_some() {
                bail!("Argument {} appears more than once.", arg);
            }
        }
        Ok(Self { arg_map })
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Time | Expr::Dynamic(_) | Expr::Constant(_) => {
                match ArgKey::of(expr).and_then(|key| self.arg_map.get(&key).copied()) {
                    Some(idx) => ops.push(OpCode::LoadArg(idx)),
                    None => bail!("Unknown symbol {} is not among the function arguments.", expr),
                }
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::Pow => OpCode::Pow,
                });
            }
            Expr::Neg(operand) => {
                self.compile_recursive(operand, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Call(function, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(OpCode::Call(*function));
            }
        }
        Ok(())
    }
}

// --- Parser ---

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("Unexpected character '{0}'")]
    UnexpectedCharacter(char),
    #[error("Invalid number literal '{0}'")]
    InvalidNumber(String),
    #[error("Expected ')'")]
    ExpectedClosingParen,
    #[error("Unexpected end of input")]
    UnexpectedEnd,
    #[error("Unexpected token {0}")]
    UnexpectedToken(String),
    #[error("Unknown function '{0}' (dynamic symbols are written as name({TIME_SYMBOL}))")]
    UnknownFunction(String),
}

/// Parses a string expression.
///
/// `t` is the time symbol, `name(t)` is a dynamic symbol, `pi` is the number
/// and every other identifier is a constant symbol.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(ParseError::UnexpectedToken(format!("{token:?}"))),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                let exponent_sign =
                    (d == '+' || d == '-') && matches!(num_str.chars().last(), Some('e' | 'E'));
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| ParseError::InvalidNumber(num_str.clone()))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => return Err(ParseError::UnexpectedCharacter(other)),
            });
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_closing_paren(&mut self) -> Result<(), ParseError> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(ParseError::ExpectedClosingParen),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.consume();
            let right = self.parse_term()?;
            left = Expr::binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(expr)));
        }
        self.parse_power()
    }

    // Right associative, and binds tighter than unary minus: -x^2 == -(x^2).
    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::binary(base, BinaryOp::Pow, exponent));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    if let Some(function) = Function::from_name(&name) {
                        let arg = self.parse_expression()?;
                        self.expect_closing_paren()?;
                        return Ok(Expr::call(function, arg));
                    }
                    match self.consume() {
                        Some(Token::Identifier(arg)) if arg == TIME_SYMBOL => {
                            self.expect_closing_paren()?;
                            Ok(Expr::Dynamic(name))
                        }
                        _ => Err(ParseError::UnknownFunction(name)),
                    }
                } else if name == TIME_SYMBOL {
                    Ok(Expr::Time)
                } else if name == "pi" {
                    Ok(Expr::Number(std::f64::consts::PI))
                } else {
                    Ok(Expr::Constant(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_closing_paren()?;
                Ok(expr)
            }
            Some(token) => Err(ParseError::UnexpectedToken(format!("{token:?}"))),
            None => Err(ParseError::UnexpectedEnd),
        }
    }
}
