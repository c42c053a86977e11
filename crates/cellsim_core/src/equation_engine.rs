use crate::traits::Scalar;
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Built-in functions callable from model expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Function {
    Exp,
    Ln,
    Log10,
    Sqrt,
    Abs,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Floor,
    Ceil,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "exp" => Function::Exp,
            "ln" | "log" => Function::Ln,
            "log10" => Function::Log10,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "asin" => Function::Asin,
            "acos" => Function::Acos,
            "atan" => Function::Atan,
            "sinh" => Function::Sinh,
            "cosh" => Function::Cosh,
            "tanh" => Function::Tanh,
            "floor" => Function::Floor,
            "ceil" => Function::Ceil,
            _ => return None,
        })
    }

    fn apply<T: Scalar>(self, a: T) -> T {
        match self {
            Function::Exp => a.exp(),
            Function::Ln => a.ln(),
            Function::Log10 => a.log10(),
            Function::Sqrt => a.sqrt(),
            Function::Abs => a.abs(),
            Function::Sin => a.sin(),
            Function::Cos => a.cos(),
            Function::Tan => a.tan(),
            Function::Asin => a.asin(),
            Function::Acos => a.acos(),
            Function::Atan => a.atan(),
            Function::Sinh => a.sinh(),
            Function::Cosh => a.cosh(),
            Function::Tanh => a.tanh(),
            Function::Floor => a.floor(),
            Function::Ceil => a.ceil(),
        }
    }
}

/// Binary operators, including comparisons and logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    fn apply<T: Scalar>(self, a: T, b: T) -> T {
        let truth = |c: bool| if c { T::one() } else { T::zero() };
        match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            BinOp::Pow => a.powf(b),
            BinOp::Lt => truth(a.value() < b.value()),
            BinOp::Le => truth(a.value() <= b.value()),
            BinOp::Gt => truth(a.value() > b.value()),
            BinOp::Ge => truth(a.value() >= b.value()),
            BinOp::Eq => truth(a.value() == b.value()),
            BinOp::Ne => truth(a.value() != b.value()),
            BinOp::And => truth(a.value() != 0.0 && b.value() != 0.0),
            BinOp::Or => truth(a.value() != 0.0 || b.value() != 0.0),
        }
    }
}

/// OpCodes for the stack-based virtual machine.
/// The VM operates on a stack of `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OpCode {
    /// Pushes a constant onto the stack.
    LoadConst(f64),
    /// Pushes the value of a frame slot (state, input, constant or intermediate).
    LoadSlot(usize),
    /// Pops (b, a), pushes a `op` b.
    Binary(BinOp),
    /// Pops a, pushes -a.
    Neg,
    /// Pops a, pushes 1 if a == 0 else 0.
    Not,
    /// Pops a, pushes f(a).
    Call(Function),
    /// Pops (else, then, cond), pushes then if cond != 0 else else.
    Select,
}

/// A compiled sequence of operations for one expression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Largest slot index this code reads, if any.
    pub fn max_slot(&self) -> Option<usize> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                OpCode::LoadSlot(idx) => Some(*idx),
                _ => None,
            })
            .max()
    }
}

/// Stack-based virtual machine for evaluating equations.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: instructions to run.
/// - `slots`: the evaluation frame (read-only).
/// - `stack`: a mutable buffer for intermediate computations.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(bytecode: &Bytecode, slots: &[T], stack: &mut Vec<T>) -> T {
        stack.clear();
        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(T::constant(val)),
                OpCode::LoadSlot(idx) => stack.push(slots[idx]),
                OpCode::Binary(bin) => {
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(bin.apply(a, b));
                }
                OpCode::Neg => {
                    let a = pop(stack);
                    stack.push(-a);
                }
                OpCode::Not => {
                    let a = pop(stack);
                    stack.push(if a.value() == 0.0 { T::one() } else { T::zero() });
                }
                OpCode::Call(f) => {
                    let a = pop(stack);
                    stack.push(f.apply(a));
                }
                OpCode::Select => {
                    let otherwise = pop(stack);
                    let then = pop(stack);
                    let cond = pop(stack);
                    stack.push(if cond.value() != 0.0 { then } else { otherwise });
                }
            }
        }
        pop(stack)
    }
}

// Compiled code is stack-balanced, so an empty stack only happens for empty
// bytecode, which evaluates to zero.
fn pop<T: Scalar>(stack: &mut Vec<T>) -> T {
    stack.pop().unwrap_or_else(T::zero)
}

// --- AST & Parser ---

/// Abstract syntax tree for model expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, BinOp, Box<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Call(String, Vec<Expr>),
}

impl Expr {
    /// Names of all variables referenced by this expression.
    pub fn references(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_references(&mut names);
        names
    }

    fn collect_references(&self, names: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(name) => {
                names.insert(name.clone());
            }
            Expr::Binary(a, _, b) => {
                a.collect_references(names);
                b.collect_references(names);
            }
            Expr::Neg(a) | Expr::Not(a) => a.collect_references(names),
            Expr::Call(_, args) => {
                for arg in args {
                    arg.collect_references(names);
                }
            }
        }
    }

    /// Returns the value if this expression is a plain number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Expr::Number(n) => Some(*n),
            Expr::Neg(inner) => inner.as_number().map(|n| -n),
            _ => None,
        }
    }
}

/// Compiles an AST into `Bytecode`, resolving names to frame slots.
pub struct Compiler {
    pub slot_map: HashMap<String, usize>,
    pub fold_constants: bool,
}

impl Compiler {
    pub fn new(slot_names: &[String]) -> Self {
        let slot_map = slot_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            slot_map,
            fold_constants: true,
        }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                let idx = self
                    .slot_map
                    .get(name)
                    .ok_or_else(|| anyhow!("Unknown variable: {name}"))?;
                ops.push(OpCode::LoadSlot(*idx));
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(OpCode::Binary(*op));
                self.fold_tail(ops, 2);
            }
            Expr::Neg(operand) => {
                self.compile_recursive(operand, ops)?;
                ops.push(OpCode::Neg);
                self.fold_tail(ops, 1);
            }
            Expr::Not(operand) => {
                self.compile_recursive(operand, ops)?;
                ops.push(OpCode::Not);
                self.fold_tail(ops, 1);
            }
            Expr::Call(func, args) => match func.as_str() {
                "if" => {
                    expect_arity(func, args, 3)?;
                    for arg in args {
                        self.compile_recursive(arg, ops)?;
                    }
                    ops.push(OpCode::Select);
                    self.fold_tail(ops, 3);
                }
                "pow" => {
                    expect_arity(func, args, 2)?;
                    self.compile_recursive(&args[0], ops)?;
                    self.compile_recursive(&args[1], ops)?;
                    ops.push(OpCode::Binary(BinOp::Pow));
                    self.fold_tail(ops, 2);
                }
                _ => {
                    let f = Function::lookup(func)
                        .ok_or_else(|| anyhow!("Unknown function: {func}"))?;
                    expect_arity(func, args, 1)?;
                    self.compile_recursive(&args[0], ops)?;
                    ops.push(OpCode::Call(f));
                    self.fold_tail(ops, 1);
                }
            },
        }
        Ok(())
    }

    /// Collapses the last operation into a constant when all of its
    /// `arity` operands are constants.
    fn fold_tail(&self, ops: &mut Vec<OpCode>, arity: usize) {
        if !self.fold_constants || ops.len() < arity + 1 {
            return;
        }
        let start = ops.len() - arity - 1;
        let all_const = ops[start..ops.len() - 1]
            .iter()
            .all(|op| matches!(op, OpCode::LoadConst(_)));
        if !all_const {
            return;
        }
        let code = Bytecode {
            ops: ops[start..].to_vec(),
        };
        let mut stack = Vec::with_capacity(arity);
        let value = VM::execute::<f64>(&code, &[], &mut stack);
        ops.truncate(start);
        ops.push(OpCode::LoadConst(value));
    }
}

fn expect_arity(func: &str, args: &[Expr], arity: usize) -> Result<()> {
    if args.len() != arity {
        bail!(
            "Function {func} expects {arity} argument(s), got {}",
            args.len()
        );
    }
    Ok(())
}

// --- Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        bail!("Unexpected trailing token {token:?} in \"{input}\"");
    }
    Ok(expr)
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
    Comma,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            // Exponent part: e, E, optionally signed.
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
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| anyhow!("Invalid number literal \"{text}\""))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Identifier(chars[start..i].iter().collect()));
        } else {
            let next = chars.get(i + 1).copied();
            let (token, width) = match (c, next) {
                ('<', Some('=')) => (Token::Le, 2),
                ('>', Some('=')) => (Token::Ge, 2),
                ('=', Some('=')) => (Token::EqEq, 2),
                ('!', Some('=')) => (Token::NotEq, 2),
                ('&', Some('&')) => (Token::AndAnd, 2),
                ('|', Some('|')) => (Token::OrOr, 2),
                ('<', _) => (Token::Lt, 1),
                ('>', _) => (Token::Gt, 1),
                ('!', _) => (Token::Bang, 1),
                ('+', _) => (Token::Plus, 1),
                ('-', _) => (Token::Minus, 1),
                ('*', _) => (Token::Star, 1),
                ('/', _) => (Token::Slash, 1),
                ('^', _) => (Token::Caret, 1),
                ('(', _) => (Token::LParen, 1),
                (')', _) => (Token::RParen, 1),
                (',', _) => (Token::Comma, 1),
                _ => bail!("Unexpected character '{c}' in \"{input}\""),
            };
            tokens.push(token);
            i += width;
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

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.consume() {
            Some(token) if token == expected => Ok(()),
            other => bail!("Expected {expected:?}, found {other:?}"),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while let Some(Token::OrOr) = self.peek() {
            self.consume();
            let right = self.parse_and()?;
            left = Expr::Binary(Box::new(left), BinOp::Or, Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_comparison()?;
        while let Some(Token::AndAnd) = self.peek() {
            self.consume();
            let right = self.parse_comparison()?;
            left = Expr::Binary(Box::new(left), BinOp::And, Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                _ => break,
            };
            self.consume();
            let right = self.parse_term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let mut left = self.parse_factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.consume();
            let right = self.parse_factor()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // Unary minus binds looser than ^, so -x^2 == -(x^2).
    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.consume();
                self.parse_unary()
            }
            Some(Token::Bang) => {
                self.consume();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_power(),
        }
    }

    // Right associative: a^b^c == a^(b^c).
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), BinOp::Pow, Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let mut args = Vec::new();
                    if let Some(Token::RParen) = self.peek() {
                        self.consume();
                        return Ok(Expr::Call(name, args));
                    }
                    loop {
                        args.push(self.parse_or()?);
                        match self.consume() {
                            Some(Token::Comma) => continue,
                            Some(Token::RParen) => break,
                            other => bail!("Expected ',' or ')' in call to {name}, found {other:?}"),
                        }
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(token) => bail!("Unexpected token {token:?}"),
            None => bail!("Unexpected end of expression"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Dual;

    fn eval(src: &str, names: &[&str], values: &[f64]) -> f64 {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let code = Compiler::new(&names).compile(&parse(src).expect("parse")).expect("compile");
        VM::execute(&code, values, &mut Vec::new())
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err:#}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(eval("1 + 2 * 3", &[], &[]), 7.0);
        assert_eq!(eval("-2^2", &[], &[]), -4.0);
        assert_eq!(eval("2^3^2", &[], &[]), 512.0);
        assert_eq!(eval("(1 + 2) * 3", &[], &[]), 9.0);
        assert_eq!(eval("8 / 4 / 2", &[], &[]), 1.0);
    }

    #[test]
    fn scientific_notation_and_dotted_names() {
        assert_eq!(eval("1.5e-3 * 2E3", &[], &[]), 3.0);
        assert_eq!(eval("membrane.V + 1", &["membrane.V"], &[-80.0]), -79.0);
    }

    #[test]
    fn piecewise_select_and_comparisons() {
        let src = "if(x >= 1 && x < 3, 10, 20)";
        assert_eq!(eval(src, &["x"], &[0.5]), 20.0);
        assert_eq!(eval(src, &["x"], &[1.0]), 10.0);
        assert_eq!(eval(src, &["x"], &[3.0]), 20.0);
        assert_eq!(eval("!(x == 2) || 0", &["x"], &[2.0]), 0.0);
    }

    #[test]
    fn constant_folding_collapses_literal_subtrees() {
        let names = vec!["x".to_string()];
        let code = Compiler::new(&names)
            .compile(&parse("x * (2 + 3) + exp(0)").expect("parse"))
            .expect("compile");
        assert!(code.ops.contains(&OpCode::LoadConst(5.0)));
        assert!(code.ops.contains(&OpCode::LoadConst(1.0)));
        assert!(!code.ops.iter().any(|op| matches!(op, OpCode::Call(_))));

        let mut unfolded = Compiler::new(&names);
        unfolded.fold_constants = false;
        let code = unfolded
            .compile(&parse("x * (2 + 3)").expect("parse"))
            .expect("compile");
        assert_eq!(code.ops.len(), 5);
    }

    #[test]
    fn references_are_collected_across_calls() {
        let refs = parse("if(a > b, exp(c), d * 2)").expect("parse").references();
        let names: Vec<&str> = refs.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn errors_name_the_problem() {
        assert_err_contains(parse("1 +"), "Unexpected end");
        assert_err_contains(parse("2 $ 3"), "Unexpected character");
        assert_err_contains(parse("(1"), "Expected RParen");
        let expr = parse("foo(1)").expect("parse");
        assert_err_contains(Compiler::new(&[]).compile(&expr), "Unknown function: foo");
        let expr = parse("y").expect("parse");
        assert_err_contains(Compiler::new(&[]).compile(&expr), "Unknown variable: y");
        let expr = parse("if(1, 2)").expect("parse");
        assert_err_contains(Compiler::new(&[]).compile(&expr), "expects 3");
    }

    #[test]
    fn dual_evaluation_carries_tangent() {
        let names = vec!["x".to_string()];
        let code = Compiler::new(&names)
            .compile(&parse("3 * x^2").expect("parse"))
            .expect("compile");
        let out = VM::execute(&code, &[Dual::new(2.0, 1.0)], &mut Vec::new());
        assert_eq!(out.val, 12.0);
        assert!((out.eps - 12.0).abs() < 1e-12);
    }
}
