//! Expression parser
//!
//! Turns a JSON string value into a [`TemplateString`]. Strings of the form
//! `[...]` are parsed into an [`Expr`]; everything else is a literal.
//!
//! ```text
//! template-string := '[' ws expr ws ']'
//! expr            := primary (ws accessor)*
//! primary         := string | integer | call | 'true' | 'false' | 'null'
//! call            := ident ('.' ident)? ws '(' args ')'
//! accessor        := '.' ident | '[' expr ']'
//! ```
//!
//! Spans are byte offsets into the full template string so diagnostics can
//! point at the failing call.

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0},
    combinator::{all_consuming, cut, map, opt, recognize},
    error::{context, ContextError, ErrorKind, ParseError as NomParseError, VerboseError, VerboseErrorKind},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

use crate::ast::{Expr, FunctionCall, Span, TemplateString};
use crate::error::ExpressionError;

// ============================================================================
// Public API
// ============================================================================

/// True when `input` must be evaluated rather than used verbatim
pub fn is_expression(input: &str) -> bool {
    input.len() >= 3 && input.starts_with('[') && !input.starts_with("[[") && input.ends_with(']')
}

/// Classify and parse a JSON string value
pub fn parse_template_string(input: &str) -> Result<TemplateString, ExpressionError> {
    if is_expression(input) {
        return parse_expression(input).map(TemplateString::Expression);
    }
    if let Some(rest) = input.strip_prefix('[').filter(|r| r.starts_with('[')) {
        return Ok(TemplateString::Literal(rest.to_string()));
    }
    Ok(TemplateString::Literal(input.to_string()))
}

/// Parse a bracketed expression string such as `[concat('a', 'b')]`
pub fn parse_expression(input: &str) -> Result<Expr, ExpressionError> {
    match all_consuming(|i| bracketed::<VerboseError<&str>>(i, input))(input) {
        Ok((_, expr)) => Ok(expr),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(to_parse_error(input, e)),
        Err(nom::Err::Incomplete(_)) => Err(ExpressionError::Parse {
            position: input.len(),
            message: "incomplete expression".to_string(),
        }),
    }
}

fn to_parse_error(input: &str, e: VerboseError<&str>) -> ExpressionError {
    let position = e
        .errors
        .first()
        .map(|(rest, _)| input.len() - rest.len())
        .unwrap_or(0);

    let expected = e.errors.iter().find_map(|(_, kind)| match kind {
        VerboseErrorKind::Context(ctx) => Some(format!("expected {}", ctx)),
        _ => None,
    });
    let message = expected.unwrap_or_else(|| match e.errors.first() {
        Some((_, VerboseErrorKind::Char(c))) => format!("expected '{}'", c),
        Some((rest, _)) if !rest.is_empty() => {
            let near: String = rest.chars().take(12).collect();
            format!("unexpected input near '{}'", near)
        }
        _ => "unexpected end of expression".to_string(),
    });

    ExpressionError::Parse { position, message }
}

// ============================================================================
// Internal Parsers
// ============================================================================

fn offset(original: &str, rest: &str) -> usize {
    original.len() - rest.len()
}

fn bracketed<'a, E: NomParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
    original: &'a str,
) -> IResult<&'a str, Expr, E> {
    let (input, _) = char('[')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, expr) = cut(context("expression", |i| expression(i, original)))(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = context("closing bracket", cut(char(']')))(input)?;
    Ok((input, expr))
}

enum Accessor {
    Property(String),
    Index(Expr),
}

fn expression<'a, E: NomParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
    original: &'a str,
) -> IResult<&'a str, Expr, E> {
    let start = offset(original, input);
    let (input, primary) = primary(input, original)?;
    let (input, accessors) = many0(|i| accessor(i, original))(input)?;

    let expr = accessors
        .into_iter()
        .fold(primary, |target, (acc, end)| match acc {
            Accessor::Property(name) => Expr::Property {
                target: Box::new(target),
                name,
                span: Span::new(start, end),
            },
            Accessor::Index(index) => Expr::Index {
                target: Box::new(target),
                index: Box::new(index),
                span: Span::new(start, end),
            },
        });
    Ok((input, expr))
}

fn accessor<'a, E: NomParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
    original: &'a str,
) -> IResult<&'a str, (Accessor, usize), E> {
    let (input, _) = multispace0(input)?;
    let (input, acc) = alt((
        map(
            preceded(
                char('.'),
                cut(context("property name", preceded(multispace0, identifier))),
            ),
            |name: &str| Accessor::Property(name.to_string()),
        ),
        map(
            delimited(
                pair(char('['), multispace0),
                cut(|i| expression(i, original)),
                pair(multispace0, context("closing index bracket", cut(char(']')))),
            ),
            Accessor::Index,
        ),
    ))(input)?;
    Ok((input, (acc, offset(original, input))))
}

fn primary<'a, E: NomParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
    original: &'a str,
) -> IResult<&'a str, Expr, E> {
    alt((
        map(string_literal, Expr::String),
        |i| integer_literal(i, original),
        |i| call_or_keyword(i, original),
    ))(input)
}

fn identifier<'a, E: NomParseError<&'a str>>(input: &'a str) -> IResult<&'a str, &'a str, E> {
    recognize(pair(
        alt((alpha1, tag("_"), tag("$"))),
        many0(alt((alphanumeric1, tag("_"), tag("$")))),
    ))(input)
}

// Function calls and the bare keywords true/false/null
fn call_or_keyword<'a, E: NomParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
    original: &'a str,
) -> IResult<&'a str, Expr, E> {
    let start = offset(original, input);
    let (after_first, first) = identifier(input)?;

    // `namespace.function(` for user-defined functions
    let (after_second, second) =
        opt(preceded(char::<&'a str, E>('.'), identifier))(after_first)?;
    let (probe, _) = multispace0(after_second)?;
    let (rest, namespace, name) = match second {
        Some(name) if probe.starts_with('(') => (probe, Some(first), name),
        _ => {
            let (probe, _) = multispace0(after_first)?;
            (probe, None, first)
        }
    };

    if !rest.starts_with('(') {
        return match first.to_ascii_lowercase().as_str() {
            "true" => Ok((after_first, Expr::Bool(true))),
            "false" => Ok((after_first, Expr::Bool(false))),
            "null" => Ok((after_first, Expr::Null)),
            _ => Err(nom::Err::Failure(E::add_context(
                input,
                "function call",
                E::from_error_kind(input, ErrorKind::Tag),
            ))),
        };
    }

    let (rest, _) = char('(')(rest)?;
    let (rest, _) = multispace0(rest)?;
    let (rest, args) = separated_list0(
        tuple((multispace0, char(','), multispace0)),
        |i| expression(i, original),
    )(rest)?;
    let (rest, _) = multispace0(rest)?;
    let (rest, _) = context("closing parenthesis", cut(char(')')))(rest)?;

    Ok((
        rest,
        Expr::Call(FunctionCall {
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
            args,
            span: Span::new(start, offset(original, rest)),
        }),
    ))
}

// 'text' with '' as the escaped quote
fn string_literal<'a, E: NomParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, String, E> {
    let (mut rest, _) = char('\'')(input)?;
    let mut out = String::new();
    loop {
        let Some(pos) = rest.find('\'') else {
            return Err(nom::Err::Failure(E::add_context(
                rest,
                "closing quote",
                E::from_error_kind(rest, ErrorKind::Char),
            )));
        };
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(next) = after.strip_prefix('\'') {
            out.push('\'');
            rest = next;
        } else {
            return Ok((after, out));
        }
    }
}

fn integer_literal<'a, E: NomParseError<&'a str>>(
    input: &'a str,
    original: &'a str,
) -> IResult<&'a str, Expr, E> {
    let start = offset(original, input);
    let (rest, literal) = recognize(pair(opt(char('-')), digit1))(input)?;
    Ok((
        rest,
        Expr::Integer {
            literal: literal.to_string(),
            span: Span::new(start, offset(original, rest)),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(input: &str) -> Expr {
        parse_expression(input).unwrap()
    }

    #[test]
    fn test_literal_strings_pass_through() {
        assert_eq!(
            parse_template_string("plain").unwrap(),
            TemplateString::Literal("plain".into())
        );
        assert_eq!(
            parse_template_string("[]").unwrap(),
            TemplateString::Literal("[]".into())
        );
        assert_eq!(
            parse_template_string("a [b] c").unwrap(),
            TemplateString::Literal("a [b] c".into())
        );
    }

    #[test]
    fn test_double_bracket_escape() {
        assert_eq!(
            parse_template_string("[[variables('x')]").unwrap(),
            TemplateString::Literal("[variables('x')]".into())
        );
    }

    #[test]
    fn test_simple_call() {
        let expr = parse("[concat('a', 'b')]");
        let call = expr.as_call().unwrap();
        assert_eq!(call.name, "concat");
        assert_eq!(call.args, vec![Expr::String("a".into()), Expr::String("b".into())]);
        assert_eq!(call.span, Span::new(1, 17));
    }

    #[test]
    fn test_escaped_quotes_in_string() {
        let expr = parse("[concat('it''s')]");
        assert_eq!(expr.as_call().unwrap().args[0], Expr::String("it's".into()));
    }

    #[test]
    fn test_nested_calls_and_accessors() {
        let expr = parse("[reference(parameters('name')).outputs['x'].value]");
        match expr {
            Expr::Property { target, name, .. } => {
                assert_eq!(name, "value");
                assert!(matches!(*target, Expr::Index { .. }));
            }
            other => panic!("Expected property access, got {:?}", other),
        }
    }

    #[test]
    fn test_bare_keywords() {
        let expr = parse("[if(true, null, false)]");
        let call = expr.as_call().unwrap();
        assert_eq!(call.args, vec![Expr::Bool(true), Expr::Null, Expr::Bool(false)]);
    }

    #[test]
    fn test_integer_literal_keeps_text() {
        let expr = parse("[add(1, -2)]");
        let call = expr.as_call().unwrap();
        assert!(matches!(&call.args[1], Expr::Integer { literal, .. } if literal == "-2"));
    }

    #[test]
    fn test_user_defined_function_call() {
        let expr = parse("[tags.build('x')]");
        let call = expr.as_call().unwrap();
        assert_eq!(call.namespace.as_deref(), Some("tags"));
        assert_eq!(call.name, "build");
    }

    #[test]
    fn test_whitespace_variations() {
        let expr = parse("[ concat( 'a' ,'b' ) ]");
        assert_eq!(expr.as_call().unwrap().args.len(), 2);
    }

    #[test]
    fn test_parse_error_unclosed_paren() {
        let err = parse_expression("[concat('a']").unwrap_err();
        assert!(matches!(err, ExpressionError::Parse { .. }));
    }

    #[test]
    fn test_parse_error_unclosed_string() {
        let err = parse_expression("[concat('a)]").unwrap_err();
        match err {
            ExpressionError::Parse { message, .. } => assert!(message.contains("closing quote")),
            other => panic!("Expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_bare_identifier_is_error() {
        let err = parse_expression("[foo]").unwrap_err();
        match err {
            ExpressionError::Parse { position, .. } => assert_eq!(position, 1),
            other => panic!("Expected parse error, got {:?}", other),
        }
    }
}
