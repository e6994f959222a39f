//! Selection expression engine
//!
//! Cut and weight strings use C-like operators (`&&`, `||`, `!`, `==`).
//! They are rewritten to SQL operators, parsed with `sqlparser`, and
//! evaluated column-wise over Arrow record batches.
//!
//! Booleans evaluate to `1.0`/`0.0`; a predicate holds where the value is
//! non-zero.
//!
//! References:
//! - sqlparser-rs: <https://docs.rs/sqlparser>

use crate::storage::column_f64;
use crate::{Error, Result};
use arrow::array::BooleanArray;
use arrow::record_batch::RecordBatch;
use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, UnaryOperator, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;
use std::fmt;

/// Parsed cut or weight expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

/// Intermediate evaluation result
#[derive(Debug, Clone)]
enum Values {
    Scalar(f64),
    Column(Vec<f64>),
}

impl Values {
    fn into_column(self, rows: usize) -> Vec<f64> {
        match self {
            Self::Scalar(v) => vec![v; rows],
            Self::Column(c) => c,
        }
    }

    fn map(self, f: impl Fn(f64) -> f64) -> Self {
        match self {
            Self::Scalar(v) => Self::Scalar(f(v)),
            Self::Column(mut c) => {
                c.iter_mut().for_each(|v| *v = f(*v));
                Self::Column(c)
            }
        }
    }

    fn zip(self, other: Self, f: impl Fn(f64, f64) -> f64) -> Self {
        match (self, other) {
            (Self::Scalar(a), Self::Scalar(b)) => Self::Scalar(f(a, b)),
            (Self::Column(mut a), Self::Scalar(b)) => {
                a.iter_mut().for_each(|v| *v = f(*v, b));
                Self::Column(a)
            }
            (Self::Scalar(a), Self::Column(mut b)) => {
                b.iter_mut().for_each(|v| *v = f(a, *v));
                Self::Column(b)
            }
            (Self::Column(mut a), Self::Column(b)) => {
                a.iter_mut().zip(b).for_each(|(x, y)| *x = f(*x, y));
                Self::Column(a)
            }
        }
    }
}

const fn truth(v: bool) -> f64 {
    if v {
        1.0
    } else {
        0.0
    }
}

/// Rewrite C-style logical operators into their SQL spelling
///
/// `!` binds to the operand right after it, as in C: `!a>0` becomes
/// `(NOT (a))>0`.
#[must_use]
pub fn normalize(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    normalize_chars(&chars)
}

fn normalize_chars(chars: &[char]) -> String {
    let mut out = String::with_capacity(chars.len() + 8);
    let mut i = 0;
    while i < chars.len() {
        match (chars[i], chars.get(i + 1)) {
            ('&', Some('&')) => {
                out.push_str(" AND ");
                i += 2;
            }
            ('|', Some('|')) => {
                out.push_str(" OR ");
                i += 2;
            }
            ('=', Some('=')) => {
                out.push('=');
                i += 2;
            }
            ('!', Some('=')) => {
                out.push_str("!=");
                i += 2;
            }
            ('!', _) => {
                let end = operand_end(chars, i + 1);
                out.push_str(" (NOT (");
                out.push_str(&normalize_chars(&chars[i + 1..end]));
                out.push_str(")) ");
                i = end;
            }
            (c, _) => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// End of the unary operand starting at `start`: a parenthesized group,
/// another unary operand, or a name or number with optional call arguments
fn operand_end(chars: &[char], start: usize) -> usize {
    let mut i = start;
    while chars.get(i).is_some_and(|c| c.is_whitespace()) {
        i += 1;
    }
    match chars.get(i) {
        Some('(') => matching_paren(chars, i),
        Some('!' | '-' | '+') => operand_end(chars, i + 1),
        Some(_) => {
            let token = i;
            while let Some(&c) = chars.get(i) {
                let exponent_sign = matches!(c, '+' | '-')
                    && i > token
                    && matches!(chars[i - 1], 'e' | 'E')
                    && chars[token].is_ascii_digit();
                if c.is_alphanumeric() || matches!(c, '_' | '.') || exponent_sign {
                    i += 1;
                } else {
                    break;
                }
            }
            let mut j = i;
            while chars.get(j).is_some_and(|c| c.is_whitespace()) {
                j += 1;
            }
            if i > token && chars.get(j) == Some(&'(') {
                matching_paren(chars, j)
            } else {
                i
            }
        }
        None => i,
    }
}

/// Index one past the parenthesis closing the one at `open`
fn matching_paren(chars: &[char], open: usize) -> usize {
    let mut depth = 0_usize;
    for (k, &c) in chars.iter().enumerate().skip(open) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return k + 1;
                }
            }
            _ => {}
        }
    }
    chars.len()
}

impl Expression {
    /// Parse an expression
    ///
    /// # Errors
    /// Returns `Expression` error on empty input or invalid syntax
    ///
    /// # Example
    /// ```
    /// use trueno_xfold::expr::Expression;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let cut = Expression::parse("(pt_1>30)&&(iso_1<0.15)")?;
    /// assert_eq!(cut.columns(), vec!["pt_1".to_string(), "iso_1".to_string()]);
    /// # Ok(())
    /// # }
    /// ```
    pub fn parse(source: &str) -> Result<Self> {
        if source.trim().is_empty() {
            return Err(Error::Expression("Empty expression".to_string()));
        }
        let dialect = GenericDialect {};
        let parse_error = |e: ParserError| Error::Expression(format!("Failed to parse '{source}': {e}"));
        let mut parser = Parser::new(&dialect)
            .try_with_sql(&normalize(source))
            .map_err(parse_error)?;
        let ast = parser.parse_expr().map_err(parse_error)?;
        let trailing = parser.peek_token().token;
        if trailing != Token::EOF {
            return Err(Error::Expression(format!(
                "Unexpected trailing token '{trailing}' in '{source}'"
            )));
        }
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    /// Original expression text
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Column names referenced by the expression, in first-use order
    #[must_use]
    pub fn columns(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_columns(&self.ast, &mut names);
        names
    }

    /// Evaluate to one numeric value per row
    ///
    /// # Errors
    /// Returns error if a referenced column is missing or an operator is unsupported
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<Vec<f64>> {
        Ok(eval(&self.ast, batch)?.into_column(batch.num_rows()))
    }

    /// Evaluate as a predicate mask (non-zero is true)
    ///
    /// # Errors
    /// Same as [`Expression::evaluate`]
    pub fn evaluate_mask(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        let values = self.evaluate(batch)?;
        Ok(values.into_iter().map(|v| Some(v != 0.0)).collect())
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn collect_columns(expr: &Expr, names: &mut Vec<String>) {
    match expr {
        Expr::Identifier(ident) => {
            if !names.contains(&ident.value) {
                names.push(ident.value.clone());
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_columns(left, names);
            collect_columns(right, names);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => collect_columns(expr, names),
        Expr::Function(func) => {
            if let FunctionArguments::List(list) = &func.args {
                for arg in &list.args {
                    if let FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) = arg {
                        collect_columns(e, names);
                    }
                }
            }
        }
        _ => {}
    }
}

#[allow(clippy::float_cmp)]
fn eval(expr: &Expr, batch: &RecordBatch) -> Result<Values> {
    match expr {
        Expr::Identifier(ident) => {
            let lowered = ident.value.to_ascii_lowercase();
            // Bare TRUE/FALSE may survive as identifiers depending on quoting
            match lowered.as_str() {
                "true" if batch.column_by_name(&ident.value).is_none() => Ok(Values::Scalar(1.0)),
                "false" if batch.column_by_name(&ident.value).is_none() => {
                    Ok(Values::Scalar(0.0))
                }
                _ => Ok(Values::Column(column_f64(batch, &ident.value)?)),
            }
        }
        Expr::Value(Value::Number(n, _)) => n
            .parse::<f64>()
            .map(Values::Scalar)
            .map_err(|_| Error::Expression(format!("Invalid number: {n}"))),
        Expr::Value(Value::Boolean(b)) => Ok(Values::Scalar(truth(*b))),
        Expr::Nested(inner) => eval(inner, batch),
        Expr::UnaryOp { op, expr } => {
            let v = eval(expr, batch)?;
            match op {
                UnaryOperator::Minus => Ok(v.map(|x| -x)),
                UnaryOperator::Plus => Ok(v),
                UnaryOperator::Not => Ok(v.map(|x| truth(x == 0.0))),
                other => Err(Error::Expression(format!(
                    "Unsupported unary operator: {other}"
                ))),
            }
        }
        Expr::BinaryOp { left, op, right } => {
            let l = eval(left, batch)?;
            let r = eval(right, batch)?;
            let f: fn(f64, f64) -> f64 = match op {
                BinaryOperator::Plus => |a, b| a + b,
                BinaryOperator::Minus => |a, b| a - b,
                BinaryOperator::Multiply => |a, b| a * b,
                BinaryOperator::Divide => |a, b| a / b,
                BinaryOperator::Modulo => |a, b| a % b,
                BinaryOperator::Gt => |a, b| truth(a > b),
                BinaryOperator::Lt => |a, b| truth(a < b),
                BinaryOperator::GtEq => |a, b| truth(a >= b),
                BinaryOperator::LtEq => |a, b| truth(a <= b),
                BinaryOperator::Eq => |a, b| truth(a == b),
                BinaryOperator::NotEq => |a, b| truth(a != b),
                BinaryOperator::And => |a, b| truth(a != 0.0 && b != 0.0),
                BinaryOperator::Or => |a, b| truth(a != 0.0 || b != 0.0),
                other => {
                    return Err(Error::Expression(format!(
                        "Unsupported binary operator: {other}"
                    )))
                }
            };
            Ok(l.zip(r, f))
        }
        Expr::Function(func) => {
            let name = func.name.to_string().to_ascii_lowercase();
            let args = match &func.args {
                FunctionArguments::List(list) => list
                    .args
                    .iter()
                    .map(|arg| match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => eval(e, batch),
                        other => Err(Error::Expression(format!(
                            "Unsupported function argument: {other}"
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?,
                _ => Vec::new(),
            };
            apply_function(&name, args)
        }
        other => Err(Error::Expression(format!(
            "Unsupported expression: {other}"
        ))),
    }
}

fn apply_function(name: &str, mut args: Vec<Values>) -> Result<Values> {
    let arity = match name {
        "abs" | "sqrt" | "exp" | "log" => 1,
        "pow" | "min" | "max" => 2,
        _ => return Err(Error::Expression(format!("Unknown function: {name}"))),
    };
    if args.len() != arity {
        return Err(Error::Expression(format!(
            "{name}() takes {arity} argument(s), got {}",
            args.len()
        )));
    }
    if arity == 1 {
        let a = args.remove(0);
        return Ok(match name {
            "abs" => a.map(f64::abs),
            "sqrt" => a.map(f64::sqrt),
            "exp" => a.map(f64::exp),
            _ => a.map(f64::ln),
        });
    }
    let b = args.remove(1);
    let a = args.remove(0);
    Ok(match name {
        "pow" => a.zip(b, f64::powf),
        "min" => a.zip(b, f64::min),
        _ => a.zip(b, f64::max),
    })
}
