//! Label functions: statement blocks that pick a rank label directly.
//!
//! ```text
//! if security >= 90 and testing >= 90:
//!     return 'S'
//! elif 'critical' in entity.tags and security < 80:
//!     return 'Critical Risk'
//! else:
//!     total = security * 0.5 + testing * 0.5
//!     return 'B' if total >= 60 else 'C'
//! ```
//!
//! Blocks are delimited by indentation. Statements are `if`/`elif`/`else`,
//! `return [expr]`, `name = expr`, `pass` and bare expressions; a header may
//! carry its body on the same line (`if x: return 'A'`). Expressions use the
//! formula language. Lines whose first non-blank character is `#` are
//! ignored.

use std::collections::BTreeSet;

use super::formula::{ENTITY, Env, EvalError, Expr, KEYWORDS, ParseResult, Parser, Token, Value, tokenize};
use crate::constants::{MAX_LABEL_FUNCTION_LENGTH, MAX_LABEL_FUNCTION_STATEMENTS};
use crate::core::BkstgError;

/// One statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `if`/`elif` branches in order, then the `else` body
    If {
        /// Condition and body of each branch
        branches: Vec<(Expr, Vec<Statement>)>,
        /// Body run when no branch matches
        otherwise: Vec<Statement>,
    },
    /// `return [expr]`
    Return(Option<Expr>),
    /// `name = expr`
    Assign {
        /// Local variable
        name: String,
        /// Value
        value: Expr,
    },
    /// Expression evaluated for its failures only
    Expr(Expr),
    /// `pass`
    Pass,
}

/// A compiled label function.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelFunction {
    body: Vec<Statement>,
}

enum Flow {
    Next,
    Return(Option<Value>),
}

impl LabelFunction {
    /// Compiles `source`; `variables` are the score variables it may read.
    pub fn parse(source: &str, variables: &BTreeSet<String>) -> Result<Self, BkstgError> {
        let error = |position: usize, message: String| BkstgError::FormulaParse {
            formula: source.to_string(),
            position,
            message,
        };

        if source.len() > MAX_LABEL_FUNCTION_LENGTH {
            return Err(error(0, format!("label function longer than {MAX_LABEL_FUNCTION_LENGTH} characters")));
        }
        let lines = logical_lines(source);
        let Some(first) = lines.first() else {
            return Err(error(0, "label function has no statements".to_string()));
        };

        let mut compiler = Compiler {
            lines: lines.clone(),
            cursor: 0,
            variables: variables.clone(),
            statements: 0,
        };
        let body = compiler.block(first.indent).map_err(|(pos, msg)| error(pos, msg))?;
        if let Some(line) = compiler.lines.get(compiler.cursor) {
            return Err(error(line.offset, "inconsistent indentation".to_string()));
        }
        Ok(Self {
            body,
        })
    }

    /// Runs the function. `Ok(None)` means it returned no label.
    pub fn run(&self, env: &mut Env<'_>) -> Result<Option<String>, EvalError> {
        Ok(match execute(&self.body, env)? {
            Flow::Return(Some(Value::Null) | None) | Flow::Next => None,
            Flow::Return(Some(value)) => Some(value.to_string()).filter(|label| !label.is_empty()),
        })
    }
}

fn execute(body: &[Statement], env: &mut Env<'_>) -> Result<Flow, EvalError> {
    for statement in body {
        match statement {
            Statement::If { branches, otherwise } => {
                let mut taken = otherwise;
                for (condition, block) in branches {
                    if condition.evaluate(env)?.truthy() {
                        taken = block;
                        break;
                    }
                }
                if let Flow::Return(value) = execute(taken, env)? {
                    return Ok(Flow::Return(value));
                }
            }
            Statement::Return(value) => {
                let value = value.as_ref().map(|expr| expr.evaluate(env)).transpose()?;
                return Ok(Flow::Return(value));
            }
            Statement::Assign { name, value } => {
                let value = value.evaluate(env)?;
                env.bind(name.clone(), value);
            }
            Statement::Expr(expr) => {
                expr.evaluate(env)?;
            }
            Statement::Pass => {}
        }
    }
    Ok(Flow::Next)
}

#[derive(Debug, Clone, Copy)]
struct Line<'s> {
    indent: usize,
    text: &'s str,
    /// Byte offset of `text` in the whole source
    offset: usize,
}

impl Line<'_> {
    fn parser<'v>(self, variables: &'v BTreeSet<String>) -> ParseResult<Parser<'v>> {
        let tokens = tokenize(self.text).map_err(|(pos, msg)| (pos + self.offset, msg))?;
        let tokens = tokens.into_iter().map(|(token, pos)| (token, pos + self.offset)).collect();
        Ok(Parser::new(tokens, variables))
    }
}

fn logical_lines(source: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut offset = 0;
    for raw in source.split_inclusive('\n') {
        let text = raw.trim_end();
        let trimmed = text.trim_start();
        if !trimmed.is_empty() && !trimmed.starts_with('#') {
            let indent = text.len() - trimmed.len();
            lines.push(Line {
                indent,
                text: trimmed,
                offset: offset + indent,
            });
        }
        offset += raw.len();
    }
    lines
}

struct Compiler<'s> {
    lines: Vec<Line<'s>>,
    cursor: usize,
    /// Score variables plus every local assigned so far
    variables: BTreeSet<String>,
    statements: usize,
}

impl Compiler<'_> {
    fn block(&mut self, indent: usize) -> ParseResult<Vec<Statement>> {
        let mut body = Vec::new();
        while let Some(&line) = self.lines.get(self.cursor) {
            if line.indent < indent {
                break;
            }
            if line.indent > indent {
                return Err((line.offset, "unexpected indent".to_string()));
            }
            self.cursor += 1;
            body.push(self.statement(line)?);
        }
        Ok(body)
    }

    fn count(&mut self, offset: usize) -> ParseResult<()> {
        self.statements += 1;
        if self.statements > MAX_LABEL_FUNCTION_STATEMENTS {
            return Err((offset, format!("more than {MAX_LABEL_FUNCTION_STATEMENTS} statements")));
        }
        Ok(())
    }

    fn statement(&mut self, line: Line<'_>) -> ParseResult<Statement> {
        self.count(line.offset)?;
        let variables = self.variables.clone();
        let mut parser = line.parser(&variables)?;

        if parser.is_keyword("elif") || parser.is_keyword("else") {
            return Err((line.offset, "'elif' or 'else' without a matching 'if'".to_string()));
        }
        if !parser.is_keyword("if") {
            return self.simple(&mut parser);
        }

        parser.advance();
        let mut branches = vec![self.branch(&mut parser, line)?];
        let mut otherwise = Vec::new();
        while let Some(&next) = self.lines.get(self.cursor) {
            if next.indent != line.indent {
                break;
            }
            let variables = self.variables.clone();
            let mut parser = next.parser(&variables)?;
            if parser.is_keyword("elif") {
                self.cursor += 1;
                parser.advance();
                branches.push(self.branch(&mut parser, next)?);
            } else if parser.is_keyword("else") {
                self.cursor += 1;
                parser.advance();
                otherwise = self.body(&mut parser, next)?;
                break;
            } else {
                break;
            }
        }
        Ok(Statement::If {
            branches,
            otherwise,
        })
    }

    fn branch(&mut self, parser: &mut Parser<'_>, line: Line<'_>) -> ParseResult<(Expr, Vec<Statement>)> {
        let condition = parser.expression()?;
        Ok((condition, self.body(parser, line)?))
    }

    /// Body after a header's `:`, inline or as an indented block.
    fn body(&mut self, parser: &mut Parser<'_>, header: Line<'_>) -> ParseResult<Vec<Statement>> {
        parser.expect_symbol(":")?;
        if !parser.at_end() {
            self.count(parser.position())?;
            return Ok(vec![self.simple(parser)?]);
        }
        match self.lines.get(self.cursor) {
            Some(next) if next.indent > header.indent => {
                let indent = next.indent;
                self.block(indent)
            }
            _ => Err((parser.position(), "expected an indented block".to_string())),
        }
    }

    fn simple(&mut self, parser: &mut Parser<'_>) -> ParseResult<Statement> {
        let statement = if parser.is_keyword("return") {
            parser.advance();
            Statement::Return(if parser.at_end() { None } else { Some(parser.expression()?) })
        } else if parser.is_keyword("pass") {
            parser.advance();
            Statement::Pass
        } else if let Some(name) = assignment_target(parser)? {
            parser.advance();
            parser.advance();
            let value = parser.expression()?;
            self.variables.insert(name.clone());
            Statement::Assign {
                name,
                value,
            }
        } else {
            Statement::Expr(parser.expression()?)
        };

        if !parser.at_end() {
            return Err((parser.position(), "unexpected trailing input".to_string()));
        }
        Ok(statement)
    }
}

fn assignment_target(parser: &Parser<'_>) -> ParseResult<Option<String>> {
    match (parser.peek(), parser.peek_at(1)) {
        (Token::Ident(name), Token::Symbol("=")) => {
            if KEYWORDS.contains(&name.as_str()) || name == ENTITY {
                Err((parser.position(), format!("cannot assign to '{name}'")))
            } else {
                Ok(Some(name.clone()))
            }
        }
        _ => Ok(None),
    }
}
