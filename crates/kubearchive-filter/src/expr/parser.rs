//! Parses policy expression source into the [`Expr`] AST using pest.

use pest::{Parser, iterators::Pair};
use pest_derive::Parser;
use snafu::Snafu;

use super::ast::{BinaryOp, Expr, Literal, UnaryOp};

#[derive(Parser)]
#[grammar = "expr/grammar.pest"]
struct ExpressionParser;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Syntax error at {line}:{column}: {message}"))]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[snafu(display("Syntax error: integer literal {literal:?} out of range"))]
    IntegerOutOfRange { literal: String },

    #[snafu(display("Syntax error: invalid escape sequence {sequence:?}"))]
    InvalidEscape { sequence: String },

    #[snafu(display("Syntax error: method calls require a name, found call on {found}"))]
    CallOnNonIdent { found: String },
}

impl From<pest::error::Error<Rule>> for Error {
    fn from(error: pest::error::Error<Rule>) -> Self {
        let (line, column) = match error.line_col {
            pest::error::LineColLocation::Pos((line, column))
            | pest::error::LineColLocation::Span((line, column), _) => (line, column),
        };

        Self::Syntax {
            line,
            column,
            message: error.variant.message().into_owned(),
        }
    }
}

/// Parses a complete expression source string.
pub fn parse(source: &str) -> Result<Expr> {
    let mut pairs = ExpressionParser::parse(Rule::program, source)?;

    // program = SOI ~ expr ~ EOI
    let program = pairs.next().unwrap_or_else(|| unreachable!("grammar yields a program"));
    let expr = program
        .into_inner()
        .find(|pair| pair.as_rule() == Rule::expr)
        .unwrap_or_else(|| unreachable!("program contains an expr"));

    parse_expr(expr)
}

/// Left-associative fold of `operand (op operand)*` rules.
fn parse_binary_chain(pair: Pair<Rule>) -> Result<Expr> {
    let mut inner = pair.into_inner();

    let first = inner.next().unwrap_or_else(|| unreachable!("chain has an operand"));
    let mut lhs = parse_expr(first)?;

    while let Some(op_pair) = inner.next() {
        let op = binary_op(&op_pair);
        let rhs_pair = inner.next().unwrap_or_else(|| unreachable!("operator has a rhs"));
        let rhs = parse_expr(rhs_pair)?;
        lhs = Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        };
    }

    Ok(lhs)
}

fn binary_op(pair: &Pair<Rule>) -> BinaryOp {
    match pair.as_rule() {
        Rule::or_op => BinaryOp::Or,
        Rule::and_op => BinaryOp::And,
        Rule::cmp_op => match pair.as_str().trim() {
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<=" => BinaryOp::Le,
            ">=" => BinaryOp::Ge,
            "<" => BinaryOp::Lt,
            ">" => BinaryOp::Gt,
            _ => BinaryOp::In,
        },
        Rule::add_op => match pair.as_str() {
            "+" => BinaryOp::Add,
            _ => BinaryOp::Sub,
        },
        rule => unreachable!("unexpected operator rule {rule:?}"),
    }
}

fn parse_expr(pair: Pair<Rule>) -> Result<Expr> {
    match pair.as_rule() {
        Rule::expr | Rule::and_expr | Rule::cmp_expr | Rule::add_expr => parse_binary_chain(pair),
        Rule::unary_expr => parse_unary(pair),
        Rule::postfix_expr => parse_postfix(pair),
        Rule::primary => parse_primary(pair),
        rule => unreachable!("unexpected expression rule {rule:?}"),
    }
}

fn parse_unary(pair: Pair<Rule>) -> Result<Expr> {
    let mut ops = Vec::new();
    let mut operand = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::not_op => ops.push(UnaryOp::Not),
            Rule::neg_op => ops.push(UnaryOp::Neg),
            _ => operand = Some(parse_expr(inner)?),
        }
    }

    let mut expr = operand.unwrap_or_else(|| unreachable!("unary always wraps an operand"));
    for op in ops.into_iter().rev() {
        expr = Expr::Unary {
            op,
            operand: Box::new(expr),
        };
    }

    Ok(expr)
}

fn parse_postfix(pair: Pair<Rule>) -> Result<Expr> {
    let mut inner = pair.into_inner();

    let primary = inner.next().unwrap_or_else(|| unreachable!("postfix has a primary"));
    let mut expr = parse_primary(primary)?;

    for postfix in inner {
        let postfix = postfix
            .into_inner()
            .next()
            .unwrap_or_else(|| unreachable!("postfix wraps one alternative"));

        expr = match postfix.as_rule() {
            Rule::member => {
                let field = postfix
                    .into_inner()
                    .next()
                    .unwrap_or_else(|| unreachable!("member has an ident"))
                    .as_str()
                    .to_owned();
                Expr::Member {
                    object: Box::new(expr),
                    field,
                }
            }
            Rule::index => {
                let index = postfix
                    .into_inner()
                    .next()
                    .unwrap_or_else(|| unreachable!("index has an expr"));
                Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(parse_expr(index)?),
                }
            }
            Rule::call_args => {
                let args = postfix
                    .into_inner()
                    .map(parse_expr)
                    .collect::<Result<Vec<_>>>()?;

                // A call either targets a bare identifier (free function) or
                // a member access (method on the receiver).
                match expr {
                    Expr::Ident(function) => Expr::Call { function, args },
                    Expr::Member { object, field } => Expr::Method {
                        receiver: object,
                        method: field,
                        args,
                    },
                    other => {
                        return CallOnNonIdentSnafu {
                            found: format!("{other:?}"),
                        }
                        .fail();
                    }
                }
            }
            rule => unreachable!("unexpected postfix rule {rule:?}"),
        };
    }

    Ok(expr)
}

fn parse_primary(pair: Pair<Rule>) -> Result<Expr> {
    let inner = pair
        .into_inner()
        .next()
        .unwrap_or_else(|| unreachable!("primary wraps one alternative"));

    match inner.as_rule() {
        Rule::literal => parse_literal(inner),
        Rule::list => {
            let items = inner.into_inner().map(parse_expr).collect::<Result<Vec<_>>>()?;
            Ok(Expr::List(items))
        }
        Rule::ident => Ok(Expr::Ident(inner.as_str().to_owned())),
        Rule::paren => {
            let expr = inner
                .into_inner()
                .next()
                .unwrap_or_else(|| unreachable!("parens wrap an expr"));
            parse_expr(expr)
        }
        rule => unreachable!("unexpected primary rule {rule:?}"),
    }
}

fn parse_literal(pair: Pair<Rule>) -> Result<Expr> {
    let inner = pair
        .into_inner()
        .next()
        .unwrap_or_else(|| unreachable!("literal wraps one alternative"));

    let literal = match inner.as_rule() {
        Rule::boolean => Literal::Bool(inner.as_str() == "true"),
        Rule::null => Literal::Null,
        Rule::int => {
            let raw = inner.as_str();
            Literal::Int(raw.parse().map_err(|_| Error::IntegerOutOfRange {
                literal: raw.to_owned(),
            })?)
        }
        Rule::float => {
            let raw = inner.as_str();
            Literal::Float(raw.parse().map_err(|_| Error::IntegerOutOfRange {
                literal: raw.to_owned(),
            })?)
        }
        Rule::string => Literal::Str(unescape(inner.as_str())?),
        rule => unreachable!("unexpected literal rule {rule:?}"),
    };

    Ok(Expr::Literal(literal))
}

/// Strips the surrounding quotes and resolves backslash escapes.
fn unescape(quoted: &str) -> Result<String> {
    let body = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }

        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(escaped @ ('\\' | '\'' | '"')) => out.push(escaped),
            other => {
                return InvalidEscapeSnafu {
                    sequence: format!("\\{}", other.map(String::from).unwrap_or_default()),
                }
                .fail();
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn parses_comparison() {
        let expr = parse("status.phase == 'Succeeded'").unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinaryOp::Eq,
                lhs: Box::new(Expr::Member {
                    object: Box::new(Expr::Ident("status".into())),
                    field: "phase".into(),
                }),
                rhs: Box::new(Expr::Literal(Literal::Str("Succeeded".into()))),
            }
        );
    }

    #[test]
    fn precedence_or_binds_weakest() {
        let expr = parse("a.x == 1 || b.y == 2 && c.z == 3").unwrap();
        let Expr::Binary { op: BinaryOp::Or, rhs, .. } = expr else {
            panic!("expected || at the root");
        };
        assert!(matches!(*rhs, Expr::Binary { op: BinaryOp::And, .. }));
    }

    #[test]
    fn method_calls_and_functions() {
        let expr = parse("metadata.name.startsWith('job-') && has(status.phase)").unwrap();
        let Expr::Binary { op: BinaryOp::And, lhs, rhs } = expr else {
            panic!("expected && at the root");
        };
        assert!(matches!(*lhs, Expr::Method { ref method, .. } if method == "startsWith"));
        assert!(matches!(*rhs, Expr::Call { ref function, .. } if function == "has"));
    }

    #[test]
    fn index_access() {
        let expr = parse("metadata.labels['app'] == 'web'").unwrap();
        assert!(matches!(
            expr,
            Expr::Binary { op: BinaryOp::Eq, .. }
        ));
    }

    #[test]
    fn in_operator_with_list() {
        let expr = parse("status.phase in ['Succeeded', 'Failed']").unwrap();
        let Expr::Binary { op: BinaryOp::In, rhs, .. } = expr else {
            panic!("expected in at the root");
        };
        assert!(matches!(*rhs, Expr::List(ref items) if items.len() == 2));
    }

    #[test]
    fn timestamp_arithmetic_parses() {
        parse("now() - timestamp(metadata.creationTimestamp) > duration('12h')").unwrap();
    }

    #[rstest]
    #[case("status.state *^ Completed'")]
    #[case("a ==")]
    #[case("(a == 1")]
    #[case("'unterminated")]
    #[case("")]
    fn syntax_errors(#[case] source: &str) {
        let error = parse(source).unwrap_err();
        assert!(error.to_string().contains("Syntax error"), "{error}");
    }

    #[test]
    fn syntax_error_carries_position() {
        let error = parse("status.state *^ x").unwrap_err();
        let Error::Syntax { line, column, .. } = error else {
            panic!("expected a syntax error");
        };
        assert_eq!(line, 1);
        assert!(column > 1);
    }

    #[test]
    fn negation_stacks() {
        let expr = parse("!!(spec.suspend == true)").unwrap();
        let Expr::Unary { op: UnaryOp::Not, operand } = expr else {
            panic!("expected outer negation");
        };
        assert!(matches!(*operand, Expr::Unary { op: UnaryOp::Not, .. }));
    }

    #[test]
    fn string_escapes() {
        let expr = parse(r"metadata.name == 'it\'s'").unwrap();
        let Expr::Binary { rhs, .. } = expr else {
            panic!("expected comparison");
        };
        assert_eq!(*rhs, Expr::Literal(Literal::Str("it's".into())));
    }
}
