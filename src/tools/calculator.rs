//! calculator：算术表达式求值
//!
//! 支持 + - * / % ^（右结合）、括号、一元正负号、函数 sqrt abs ln log exp sin cos tan floor ceil round、
//! 常量 pi e。整数结果不带小数点输出（sqrt(16) -> "4"）。

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::schema::{ParamSpec, ParamTable, ParamType};
use crate::tools::Tool;

/// 括号与一元符号的最大嵌套层数
const MAX_DEPTH: usize = 256;

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression. Supports + - * / % ^, parentheses, \
         sqrt, abs, ln, log, exp, sin, cos, tan, floor, ceil, round, and the constants pi and e."
    }

    fn parameters(&self) -> ParamTable {
        let mut p = ParamTable::new();
        p.insert(
            "expression".into(),
            ParamSpec::required(ParamType::String, "The expression to evaluate, e.g. \"sqrt(16) + 2^3\"."),
        );
        p
    }

    fn output_description(&self) -> &str {
        "The numeric result."
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let expr = args
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or("expression is required")?;
        evaluate(expr).map(format_number)
    }
}

/// 求值表达式
pub fn evaluate(expr: &str) -> Result<f64, String> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expression()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("Unexpected token at position {}", parser.pos));
    }
    if value.is_finite() {
        Ok(value)
    } else {
        Err("Result is not a finite number".to_string())
    }
}

/// 整数值去掉小数部分，其余保留最短表示
pub fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

fn tokenize(s: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = s.chars().collect();
    let mut out = Vec::new();
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
                // 科学计数法 1e3 / 2.5E-2
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
                let lit: String = chars[start..i].iter().collect();
                let n = lit
                    .parse::<f64>()
                    .map_err(|_| format!("Invalid number: {}", lit))?;
                out.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                out.push(Token::Ident(chars[start..i].iter().collect::<String>().to_lowercase()));
            }
            '+' | '-' | '/' | '%' | '^' => {
                out.push(Token::Op(c));
                i += 1;
            }
            '*' => {
                // ** 视为乘方
                if i + 1 < chars.len() && chars[i + 1] == '*' {
                    out.push(Token::Op('^'));
                    i += 2;
                } else {
                    out.push(Token::Op('*'));
                    i += 1;
                }
            }
            '(' => {
                out.push(Token::LParen);
                i += 1;
            }
            ')' => {
                out.push(Token::RParen);
                i += 1;
            }
            ',' => {
                out.push(Token::Comma);
                i += 1;
            }
            other => return Err(format!("Unexpected character: '{}'", other)),
        }
    }
    if out.is_empty() {
        return Err("Empty expression".to_string());
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(t) if t == expected => Ok(()),
            Some(t) => Err(format!("Expected {:?}, found {:?}", expected, t)),
            None => Err(format!("Expected {:?}, found end of expression", expected)),
        }
    }

    // expression := term (('+' | '-') term)*
    fn expression(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    // term := unary (('*' | '/' | '%') unary)*
    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.unary()?;
            value = match op {
                '*' => value * rhs,
                _ if rhs == 0.0 => return Err("Division by zero".to_string()),
                '/' => value / rhs,
                _ => value % rhs,
            };
        }
        Ok(value)
    }

    // 所有递归（括号、函数参数、一元符号、指数）都经过 unary，在此限制深度
    fn unary(&mut self) -> Result<f64, String> {
        if self.depth >= MAX_DEPTH {
            return Err("Expression nested too deeply".to_string());
        }
        self.depth += 1;
        let value = self.signed();
        self.depth -= 1;
        value
    }

    // unary := ('+' | '-') unary | power
    fn signed(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    // power := primary ('^' unary)?
    fn power(&mut self) -> Result<f64, String> {
        let base = self.primary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exp = self.unary()?;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let v = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(v)
            }
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.pos += 1;
                    let arg = self.expression()?;
                    self.expect(Token::RParen)?;
                    apply_function(&name, arg)
                } else {
                    match name.as_str() {
                        "pi" => Ok(std::f64::consts::PI),
                        "e" => Ok(std::f64::consts::E),
                        _ => Err(format!("Unknown constant: {}", name)),
                    }
                }
            }
            Some(t) => Err(format!("Unexpected token: {:?}", t)),
            None => Err("Unexpected end of expression".to_string()),
        }
    }
}

fn apply_function(name: &str, x: f64) -> Result<f64, String> {
    let v = match name {
        "sqrt" => {
            if x < 0.0 {
                return Err("sqrt of a negative number".to_string());
            }
            x.sqrt()
        }
        "abs" => x.abs(),
        "ln" => x.ln(),
        "log" | "log10" => x.log10(),
        "exp" => x.exp(),
        "sin" => x.sin(),
        "cos" => x.cos(),
        "tan" => x.tan(),
        "floor" => x.floor(),
        "ceil" => x.ceil(),
        "round" => x.round(),
        _ => return Err(format!("Unknown function: {}", name)),
    };
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_precedence_and_associativity() {
        assert_eq!(evaluate("1 + 2 * 3").unwrap(), 7.0);
        assert_eq!(evaluate("(1 + 2) * 3").unwrap(), 9.0);
        assert_eq!(evaluate("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(evaluate("-2 ^ 2").unwrap(), -4.0);
        assert_eq!(evaluate("2 ** 10").unwrap(), 1024.0);
        assert_eq!(evaluate("10 % 4").unwrap(), 2.0);
        assert_eq!(evaluate("1.5e2").unwrap(), 150.0);
    }

    #[test]
    fn test_functions_and_constants() {
        assert_eq!(evaluate("sqrt(16)").unwrap(), 4.0);
        assert_eq!(evaluate("abs(-3) + floor(2.7)").unwrap(), 5.0);
        assert!((evaluate("cos(pi)").unwrap() + 1.0).abs() < 1e-12);
        assert!((evaluate("ln(e)").unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_errors() {
        assert!(evaluate("").is_err());
        assert!(evaluate("1 / 0").is_err());
        assert!(evaluate("sqrt(-1)").is_err());
        assert!(evaluate("2 +").is_err());
        assert!(evaluate("(1").is_err());
        assert!(evaluate("foo(1)").is_err());
        assert!(evaluate("1 $ 2").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected_without_overflow() {
        let parens = format!("{}1{}", "(".repeat(1500), ")".repeat(1500));
        assert_eq!(evaluate(&parens).unwrap_err(), "Expression nested too deeply");
        let signs = format!("{}1", "-".repeat(5000));
        assert_eq!(evaluate(&signs).unwrap_err(), "Expression nested too deeply");
        let powers = vec!["2"; 2000].join("^");
        assert_eq!(evaluate(&powers).unwrap_err(), "Expression nested too deeply");

        let moderate = format!("{}7{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(evaluate(&moderate).unwrap(), 7.0);
    }

    #[tokio::test]
    async fn test_deep_nesting_is_a_tool_error() {
        let expr = format!("{}1{}", "sqrt(".repeat(1000), ")".repeat(1000));
        let err = CalculatorTool
            .execute(json!({ "expression": expr }))
            .await
            .unwrap_err();
        assert_eq!(err, "Expression nested too deeply");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(4.0), "4");
        assert_eq!(format_number(-12.0), "-12");
        assert_eq!(format_number(2.5), "2.5");
    }

    #[tokio::test]
    async fn test_tool_execute() {
        let out = CalculatorTool
            .execute(json!({"expression": "sqrt(16)"}))
            .await
            .unwrap();
        assert_eq!(out, "4");
    }
}
