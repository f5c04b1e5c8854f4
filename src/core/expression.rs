use std::collections::HashMap;

use indexmap::IndexMap;
use thiserror::Error;

use super::units::parse_value;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("expression cannot be empty")]
    Empty,
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("unknown name '{0}'")]
    UnknownName(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not finite")]
    NotFinite,
}

/// Name lookup used while evaluating an expression.
pub trait VariableContext {
    fn value(&self, name: &str) -> Option<f64>;
}

impl VariableContext for HashMap<String, f64> {
    fn value(&self, name: &str) -> Option<f64> {
        self.get(name).copied()
    }
}

impl VariableContext for IndexMap<String, f64> {
    fn value(&self, name: &str) -> Option<f64> {
        self.get(name).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Sin,
    Cos,
    Tan,
    Sqrt,
    Log,
    Exp,
    Abs,
    Min,
    Max,
    Pow,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "sqrt" => Self::Sqrt,
            "log" => Self::Log,
            "exp" => Self::Exp,
            "abs" => Self::Abs,
            "min" => Self::Min,
            "max" => Self::Max,
            "pow" => Self::Pow,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Self::Min | Self::Max | Self::Pow => 2,
            _ => 1,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Self::Sin => args[0].sin(),
            Self::Cos => args[0].cos(),
            Self::Tan => args[0].tan(),
            Self::Sqrt => args[0].sqrt(),
            Self::Log => args[0].ln(),
            Self::Exp => args[0].exp(),
            Self::Abs => args[0].abs(),
            Self::Min => args[0].min(args[1]),
            Self::Max => args[0].max(args[1]),
            Self::Pow => args[0].powf(args[1]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

/// Compact postfix instruction
#[derive(Debug, Clone, Copy)]
enum OpCode {
    LoadVar(u16),
    LoadConst(u16),
    Neg,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Compare(Comparison),
    Call(Function),
}

/// An arithmetic expression compiled once and evaluated many times.
///
/// The grammar is closed: numbers (SPICE suffixes allowed), names,
/// `V(node)` / `I(node)` references, `+ - * / ^`, comparisons, and a fixed
/// set of functions. Nothing else is reachable from the source text.
#[derive(Clone, Debug)]
pub struct CompiledExpression {
    source: String,
    instructions: Vec<OpCode>,
    constants: Vec<f64>,
    variables: Vec<String>,
}

impl CompiledExpression {
    pub fn compile(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Empty);
        }

        let mut compiler = Compiler {
            tokens: &tokens,
            pos: 0,
            instructions: Vec::with_capacity(tokens.len()),
            constants: Vec::with_capacity(8),
            variables: Vec::new(),
        };
        compiler.parse_comparison()?;
        if let Some(token) = compiler.peek() {
            return Err(ExpressionError::UnexpectedToken(token.to_string()));
        }

        Ok(Self {
            source: source.trim().to_string(),
            instructions: compiler.instructions,
            constants: compiler.constants,
            variables: compiler.variables,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names referenced by the expression, in first-use order.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn evaluate(&self, context: &dyn VariableContext) -> Result<f64, ExpressionError> {
        let values = self
            .variables
            .iter()
            .map(|name| {
                context
                    .value(name)
                    .ok_or_else(|| ExpressionError::UnknownName(name.clone()))
            })
            .collect::<Result<Vec<f64>, _>>()?;

        let mut stack: Vec<f64> = Vec::with_capacity(16);
        for &inst in &self.instructions {
            match inst {
                OpCode::LoadVar(idx) => stack.push(values[idx as usize]),
                OpCode::LoadConst(idx) => stack.push(self.constants[idx as usize]),
                OpCode::Neg => {
                    let a = pop(&mut stack)?;
                    stack.push(-a);
                }
                OpCode::Call(function) => {
                    let arity = function.arity();
                    if stack.len() < arity {
                        return Err(ExpressionError::UnexpectedEnd);
                    }
                    let args = stack.split_off(stack.len() - arity);
                    stack.push(function.apply(&args));
                }
                binary => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    stack.push(match binary {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => {
                            if b == 0.0 {
                                return Err(ExpressionError::DivisionByZero);
                            }
                            a / b
                        }
                        OpCode::Pow => a.powf(b),
                        OpCode::Compare(cmp) => {
                            let holds = match cmp {
                                Comparison::Lt => a < b,
                                Comparison::Le => a <= b,
                                Comparison::Gt => a > b,
                                Comparison::Ge => a >= b,
                                Comparison::Eq => a == b,
                                Comparison::Ne => a != b,
                            };
                            if holds { 1.0 } else { 0.0 }
                        }
                        _ => unreachable!("unary opcodes handled above"),
                    });
                }
            }
        }

        let result = pop(&mut stack)?;
        if !stack.is_empty() {
            return Err(ExpressionError::UnexpectedEnd);
        }
        if !result.is_finite() {
            return Err(ExpressionError::NotFinite);
        }
        Ok(result)
    }
}

#[inline]
fn pop(stack: &mut Vec<f64>) -> Result<f64, ExpressionError> {
    stack.pop().ok_or(ExpressionError::UnexpectedEnd)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Name(String),
    /// Normalized `V(node)` or `I(node)` reference
    Probe(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Name(s) | Token::Probe(s) => write!(f, "{}", s),
            Token::Op(op) => write!(f, "{}", op),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
        }
    }
}

/// Normalize a node probe such as `v( out )` to `V(out)`.
pub fn normalize_probe(text: &str) -> Option<String> {
    let text = text.trim();
    let mut chars = text.chars();
    let prefix = chars.next()?.to_ascii_uppercase();
    if prefix != 'V' && prefix != 'I' {
        return None;
    }
    let rest = chars.as_str().trim_start();
    let inner = rest.strip_prefix('(')?.strip_suffix(')')?.trim();
    if inner.is_empty() || inner.contains(['(', ')']) || inner.contains(char::is_whitespace) {
        return None;
    }
    Some(format!("{}({})", prefix, inner))
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Exponent only when digits follow, so `2e` stays an error and `1meg` a suffix
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                while i < chars.len() && chars[i].is_alphabetic() {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = parse_value(&literal)
                    .map_err(|_| ExpressionError::InvalidNumber(literal.clone()))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();

                let is_probe = matches!(name.as_str(), "V" | "v" | "I" | "i");
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if is_probe && j < chars.len() && chars[j] == '(' {
                    let close = chars[j..]
                        .iter()
                        .position(|&ch| ch == ')')
                        .map(|p| p + j)
                        .ok_or(ExpressionError::UnexpectedEnd)?;
                    let raw: String = chars[start..=close].iter().collect();
                    let probe = normalize_probe(&raw)
                        .ok_or_else(|| ExpressionError::UnexpectedToken(raw.clone()))?;
                    tokens.push(Token::Probe(probe));
                    i = close + 1;
                } else {
                    tokens.push(Token::Name(name));
                }
            }
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
            '+' | '-' | '/' | '^' => {
                tokens.push(Token::Op(match c {
                    '+' => "+",
                    '-' => "-",
                    '/' => "/",
                    _ => "^",
                }));
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::Op("^"));
                    i += 2;
                } else {
                    tokens.push(Token::Op("*"));
                    i += 1;
                }
            }
            '<' | '>' | '=' | '!' => {
                let next_is_eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, next_is_eq) {
                    ('<', true) => "<=",
                    ('<', false) => "<",
                    ('>', true) => ">=",
                    ('>', false) => ">",
                    ('=', true) => "==",
                    ('!', true) => "!=",
                    _ => return Err(ExpressionError::UnexpectedChar(c)),
                };
                tokens.push(Token::Op(op));
                i += if next_is_eq { 2 } else { 1 };
            }
            other => return Err(ExpressionError::UnexpectedChar(other)),
        }
    }

    Ok(tokens)
}

struct Compiler<'a> {
    tokens: &'a [Token],
    pos: usize,
    instructions: Vec<OpCode>,
    constants: Vec<f64>,
    variables: Vec<String>,
}

impl Compiler<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_op(&self) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) => Some(op),
            _ => None,
        }
    }

    fn add_const(&mut self, val: f64) -> u16 {
        // Reuse existing constants
        if let Some(idx) = self.constants.iter().position(|&v| v == val) {
            return idx as u16;
        }
        self.constants.push(val);
        (self.constants.len() - 1) as u16
    }

    fn add_var(&mut self, name: String) -> u16 {
        if let Some(idx) = self.variables.iter().position(|v| *v == name) {
            return idx as u16;
        }
        self.variables.push(name);
        (self.variables.len() - 1) as u16
    }

    fn parse_comparison(&mut self) -> Result<(), ExpressionError> {
        self.parse_additive()?;
        let cmp = match self.peek_op() {
            Some("<") => Comparison::Lt,
            Some("<=") => Comparison::Le,
            Some(">") => Comparison::Gt,
            Some(">=") => Comparison::Ge,
            Some("==") => Comparison::Eq,
            Some("!=") => Comparison::Ne,
            _ => return Ok(()),
        };
        self.pos += 1;
        self.parse_additive()?;
        self.instructions.push(OpCode::Compare(cmp));
        Ok(())
    }

    fn parse_additive(&mut self) -> Result<(), ExpressionError> {
        self.parse_multiplicative()?;
        while let Some(op @ ("+" | "-")) = self.peek_op() {
            self.pos += 1;
            self.parse_multiplicative()?;
            self.instructions
                .push(if op == "+" { OpCode::Add } else { OpCode::Sub });
        }
        Ok(())
    }

    fn parse_multiplicative(&mut self) -> Result<(), ExpressionError> {
        self.parse_unary()?;
        while let Some(op @ ("*" | "/")) = self.peek_op() {
            self.pos += 1;
            self.parse_unary()?;
            self.instructions
                .push(if op == "*" { OpCode::Mul } else { OpCode::Div });
        }
        Ok(())
    }

    fn parse_unary(&mut self) -> Result<(), ExpressionError> {
        match self.peek_op() {
            Some("-") => {
                self.pos += 1;
                self.parse_unary()?;
                self.instructions.push(OpCode::Neg);
                Ok(())
            }
            Some("+") => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<(), ExpressionError> {
        self.parse_atom()?;
        if self.peek_op() == Some("^") {
            self.pos += 1;
            // Right associative, and allows a signed exponent
            self.parse_unary()?;
            self.instructions.push(OpCode::Pow);
        }
        Ok(())
    }

    fn parse_atom(&mut self) -> Result<(), ExpressionError> {
        match self.next().ok_or(ExpressionError::UnexpectedEnd)? {
            Token::Number(value) => {
                let idx = self.add_const(value);
                self.instructions.push(OpCode::LoadConst(idx));
            }
            Token::Probe(name) => {
                let idx = self.add_var(name);
                self.instructions.push(OpCode::LoadVar(idx));
            }
            Token::Name(name) => {
                if self.peek() == Some(&Token::LParen) {
                    return self.parse_call(name);
                }
                let constant = match name.as_str() {
                    "pi" => Some(std::f64::consts::PI),
                    "e" => Some(std::f64::consts::E),
                    _ => None,
                };
                if let Some(value) = constant {
                    let idx = self.add_const(value);
                    self.instructions.push(OpCode::LoadConst(idx));
                } else {
                    let idx = self.add_var(name);
                    self.instructions.push(OpCode::LoadVar(idx));
                }
            }
            Token::LParen => {
                self.parse_comparison()?;
                match self.next() {
                    Some(Token::RParen) => {}
                    Some(other) => return Err(ExpressionError::UnexpectedToken(other.to_string())),
                    None => return Err(ExpressionError::UnexpectedEnd),
                }
            }
            other => return Err(ExpressionError::UnexpectedToken(other.to_string())),
        }
        Ok(())
    }

    fn parse_call(&mut self, name: String) -> Result<(), ExpressionError> {
        let function =
            Function::lookup(&name).ok_or_else(|| ExpressionError::UnknownFunction(name.clone()))?;
        self.pos += 1; // consume '('

        let mut argc = 0;
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
        } else {
            loop {
                self.parse_comparison()?;
                argc += 1;
                match self.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    Some(other) => return Err(ExpressionError::UnexpectedToken(other.to_string())),
                    None => return Err(ExpressionError::UnexpectedEnd),
                }
            }
        }

        if argc != function.arity() {
            return Err(ExpressionError::Arity {
                name,
                expected: function.arity(),
                got: argc,
            });
        }
        self.instructions.push(OpCode::Call(function));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ctx(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn eval(source: &str, pairs: &[(&str, f64)]) -> Result<f64, ExpressionError> {
        CompiledExpression::compile(source)?.evaluate(&ctx(pairs))
    }

    #[test]
    fn test_precedence() {
        assert_eq!(eval("1 + 2 * 3", &[]).unwrap(), 7.0);
        assert_eq!(eval("(1 + 2) * 3", &[]).unwrap(), 9.0);
        assert_eq!(eval("10 - 4 - 3", &[]).unwrap(), 3.0);
        assert_eq!(eval("2 ^ 3 ^ 2", &[]).unwrap(), 512.0);
        assert_eq!(eval("2 ** 3", &[]).unwrap(), 8.0);
        assert_eq!(eval("-2 ^ 2", &[]).unwrap(), -4.0);
        assert_eq!(eval("2 ^ -1", &[]).unwrap(), 0.5);
    }

    #[test]
    fn test_names_and_suffixes() {
        assert_eq!(eval("R2 + 1", &[("R2", 999.0)]).unwrap(), 1000.0);
        assert_eq!(eval("2 * R1 + 1k", &[("R1", 500.0)]).unwrap(), 2000.0);
        assert_relative_eq!(eval("C1 / 10n", &[("C1", 1e-6)]).unwrap(), 100.0, max_relative = 1e-12);
        assert_eq!(eval("1e3 + 1", &[]).unwrap(), 1001.0);
    }

    #[test]
    fn test_functions_and_constants() {
        assert_relative_eq!(eval("sqrt(16) + abs(-2)", &[]).unwrap(), 6.0);
        assert_relative_eq!(eval("max(R1, 2) * min(3, 4)", &[("R1", 1.0)]).unwrap(), 6.0);
        assert_relative_eq!(eval("cos(pi)", &[]).unwrap(), -1.0);
        assert_relative_eq!(eval("log(e)", &[]).unwrap(), 1.0);
        assert_relative_eq!(eval("pow(2, 10)", &[]).unwrap(), 1024.0);
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval("R1 >= 10", &[("R1", 10.0)]).unwrap(), 1.0);
        assert_eq!(eval("R1 < 10", &[("R1", 10.0)]).unwrap(), 0.0);
        assert_eq!(eval("1 != 2", &[]).unwrap(), 1.0);
    }

    #[test]
    fn test_probe_references() {
        let expr = CompiledExpression::compile("v( out ) * 2 + R1").unwrap();
        assert_eq!(expr.variables(), &["V(out)".to_string(), "R1".to_string()]);
        assert_eq!(expr.evaluate(&ctx(&[("V(out)", 1.5), ("R1", 1.0)])).unwrap(), 4.0);
        assert_eq!(normalize_probe("i(vin)"), Some("I(vin)".to_string()));
        assert_eq!(normalize_probe("R1"), None);
        assert_eq!(normalize_probe("V(a b)"), None);
    }

    #[test]
    fn test_errors() {
        assert_eq!(eval("", &[]), Err(ExpressionError::Empty));
        assert!(matches!(eval("1 +", &[]), Err(ExpressionError::UnexpectedEnd)));
        assert!(matches!(eval("(1 + 2", &[]), Err(ExpressionError::UnexpectedEnd)));
        assert!(matches!(eval("1 2", &[]), Err(ExpressionError::UnexpectedToken(_))));
        assert_eq!(eval("R9", &[]), Err(ExpressionError::UnknownName("R9".into())));
        assert!(matches!(eval("open(1)", &[]), Err(ExpressionError::UnknownFunction(_))));
        assert!(matches!(eval("max(1)", &[]), Err(ExpressionError::Arity { .. })));
        assert_eq!(eval("1 / 0", &[]), Err(ExpressionError::DivisionByZero));
        assert!(matches!(eval("R1 = 2", &[]), Err(ExpressionError::UnexpectedChar('='))));
        assert!(matches!(eval("__import__('os')", &[]), Err(ExpressionError::UnexpectedChar('\''))));
        assert!(matches!(eval("1x", &[]), Err(ExpressionError::InvalidNumber(_))));
    }
}
