use async_trait::async_trait;
use serde_json::{json, Value};

use super::ToolExecutor;
use crate::errors::{ToolError, ToolResult};
use crate::models::content::Content;
use crate::models::tool::Tool;

/// Arithmetic over + - * / with parentheses and unary minus
#[derive(Debug, Default)]
pub struct CalculatorTool;

#[async_trait]
impl ToolExecutor for CalculatorTool {
    fn tool(&self) -> Tool {
        Tool::new(
            "calculator",
            "Evaluate an arithmetic expression using + - * / and parentheses.",
            json!({
                "type": "object",
                "properties": {
                    "expression": {
                        "type": "string",
                        "description": "The expression to evaluate, e.g. (2 + 3) * 4"
                    }
                },
                "required": ["expression"]
            }),
        )
    }

    async fn execute(&self, arguments: Value) -> ToolResult<Vec<Content>> {
        let expression = arguments
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::validation("expression must be a string"))?;

        let value = evaluate(expression)?;
        Ok(vec![Content::text(format_number(value))])
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

pub fn evaluate(expression: &str) -> ToolResult<f64> {
    let mut parser = Parser {
        chars: expression.chars().filter(|c| !c.is_whitespace()).collect(),
        position: 0,
    };
    let value = parser.expression()?;
    if parser.position != parser.chars.len() {
        return Err(ToolError::execution(format!(
            "unexpected '{}' at position {}",
            parser.chars[parser.position], parser.position
        )));
    }
    if !value.is_finite() {
        return Err(ToolError::execution("result is not a finite number"));
    }
    Ok(value)
}

struct Parser {
    chars: Vec<char>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn expression(&mut self) -> ToolResult<f64> {
        let mut value = self.term()?;
        while let Some(op) = self.peek().filter(|c| *c == '+' || *c == '-') {
            self.position += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> ToolResult<f64> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek().filter(|c| *c == '*' || *c == '/') {
            self.position += 1;
            let rhs = self.factor()?;
            if op == '/' && rhs == 0.0 {
                return Err(ToolError::execution("division by zero"));
            }
            value = if op == '*' { value * rhs } else { value / rhs };
        }
        Ok(value)
    }

    fn factor(&mut self) -> ToolResult<f64> {
        match self.peek() {
            Some('-') => {
                self.position += 1;
                Ok(-self.factor()?)
            }
            Some('(') => {
                self.position += 1;
                let value = self.expression()?;
                if self.peek() != Some(')') {
                    return Err(ToolError::execution("missing closing parenthesis"));
                }
                self.position += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) => Err(ToolError::execution(format!(
                "unexpected '{}' at position {}",
                c, self.position
            ))),
            None => Err(ToolError::execution("unexpected end of expression")),
        }
    }

    fn number(&mut self) -> ToolResult<f64> {
        let start = self.position;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == '.')
        {
            self.position += 1;
        }
        let literal: String = self.chars[start..self.position].iter().collect();
        literal
            .parse()
            .map_err(|_| ToolError::execution(format!("invalid number '{}'", literal)))
    }
}
