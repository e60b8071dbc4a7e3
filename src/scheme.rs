//! Tokenizer and recursive-descent parser.
//!
//! Program text is first split into [`Token`]s with nom: parentheses are single
//! tokens, every other maximal run of non-whitespace, non-parenthesis characters
//! is an atom, and `;` starts a comment that runs to the end of the line. The
//! tokenizer performs no structural validation and never fails.
//!
//! The parser then turns a token slice into [`Value`]s, building lists out of
//! pairs right to left. Bracketing problems and trailing tokens are reported as
//! [`ParseError`](crate::ParseError)s.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{take_till, take_till1, take_while1},
    character::complete::char,
    combinator::{map, recognize, value},
    multi::many0,
    sequence::pair,
};

use crate::ast::{NumberType, Value};
use crate::{Error, ParseError, ParseErrorKind, STACK_GROW_SIZE, STACK_RED_ZONE};

/// A lexical unit of program text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Open,
    Close,
    Atom(String),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Open => write!(f, "("),
            Token::Close => write!(f, ")"),
            Token::Atom(lexeme) => write!(f, "{lexeme}"),
        }
    }
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | ';')
}

/// `;` up to (not including) the end of the line
fn comment(input: &str) -> IResult<&str, &str> {
    recognize(pair(char(';'), take_till(|c: char| c == '\n'))).parse(input)
}

/// Whitespace and comments between tokens
fn trivia(input: &str) -> IResult<&str, ()> {
    value(
        (),
        many0(alt((take_while1(char::is_whitespace), comment))),
    )
    .parse(input)
}

fn token(input: &str) -> IResult<&str, Token> {
    alt((
        value(Token::Open, char('(')),
        value(Token::Close, char(')')),
        map(take_till1(is_delimiter), |lexeme: &str| {
            Token::Atom(lexeme.to_owned())
        }),
    ))
    .parse(input)
}

/// Split program text into tokens.
pub fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut rest = text;
    while let Ok((after_trivia, ())) = trivia(rest)
        && let Ok((remaining, tok)) = token(after_trivia)
    {
        tokens.push(tok);
        rest = remaining;
    }
    tokens
}

/// Interpret an atom lexeme as a boolean, number or symbol.
fn parse_atom(lexeme: &str) -> Result<Value, Error> {
    match lexeme {
        "#t" => return Ok(Value::Bool(true)),
        "#f" => return Ok(Value::Bool(false)),
        _ => {}
    }

    if lexeme.chars().any(|c| c.is_ascii_digit()) {
        if let Ok(n) = lexeme.parse::<NumberType>() {
            return Ok(Value::Number(n));
        }
        if looks_like_integer(lexeme) {
            return Err(Error::ParseError(ParseError::new(
                ParseErrorKind::InvalidNumber,
                "integer literal out of range",
                Some(lexeme.to_owned()),
            )));
        }
        if let Ok(x) = lexeme.parse::<f64>() {
            return Ok(Value::Float(x));
        }
    }

    Ok(Value::Symbol(lexeme.into()))
}

fn looks_like_integer(lexeme: &str) -> bool {
    let digits = lexeme.strip_prefix(['-', '+']).unwrap_or(lexeme);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// Cursor over a token slice
struct TokenParser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> TokenParser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        TokenParser { tokens, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn parse_expression(&mut self) -> Result<Value, Error> {
        // Deeply nested input recurses once per open list.
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
            self.parse_expression_inner()
        })
    }

    fn parse_expression_inner(&mut self) -> Result<Value, Error> {
        let Some(tok) = self.tokens.get(self.pos) else {
            return Err(Error::parse(
                ParseErrorKind::Unclosed,
                "unexpected end of input",
            ));
        };
        self.pos += 1;

        match tok {
            Token::Atom(lexeme) => parse_atom(lexeme),
            Token::Close => Err(Error::ParseError(ParseError::new(
                ParseErrorKind::UnexpectedClose,
                "unmatched closing parenthesis",
                Some(")".into()),
            ))),
            Token::Open => {
                let mut items = Vec::new();
                loop {
                    match self.tokens.get(self.pos) {
                        None => {
                            return Err(Error::parse(
                                ParseErrorKind::Unclosed,
                                "missing closing parenthesis",
                            ));
                        }
                        Some(Token::Close) => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => items.push(self.parse_expression()?),
                    }
                }
                Ok(Value::from_vec(items))
            }
        }
    }

    fn trailing_error(&self) -> Error {
        match self.tokens.get(self.pos) {
            Some(Token::Close) => Error::ParseError(ParseError::new(
                ParseErrorKind::UnexpectedClose,
                "unmatched closing parenthesis",
                Some(")".into()),
            )),
            found => Error::ParseError(ParseError::new(
                ParseErrorKind::TrailingContent,
                "unexpected tokens after a complete expression",
                found.map(ToString::to_string),
            )),
        }
    }
}

fn empty_input() -> Error {
    Error::parse(ParseErrorKind::Empty, "no expression to parse")
}

/// Parse exactly one expression from a token sequence.
pub fn parse(tokens: &[Token]) -> Result<Value, Error> {
    if tokens.is_empty() {
        return Err(empty_input());
    }
    let mut parser = TokenParser::new(tokens);
    let expr = parser.parse_expression()?;
    if parser.at_end() {
        Ok(expr)
    } else {
        Err(parser.trailing_error())
    }
}

/// Parse every top-level expression in a token sequence, in order.
pub fn parse_program(tokens: &[Token]) -> Result<Vec<Value>, Error> {
    if tokens.is_empty() {
        return Err(empty_input());
    }
    let mut parser = TokenParser::new(tokens);
    let mut program = Vec::new();
    while !parser.at_end() {
        program.push(parser.parse_expression()?);
    }
    Ok(program)
}

/// Tokenize and parse a single expression.
pub fn parse_scheme(text: &str) -> Result<Value, Error> {
    parse(&tokenize(text))
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::{cons, nil, sym, val};

    fn atom(lexeme: &str) -> Token {
        Token::Atom(lexeme.into())
    }

    #[test]
    fn test_tokenize() {
        use Token::{Close, Open};

        let cases: Vec<(&str, Vec<Token>)> = vec![
            ("", vec![]),
            ("   \n\t ", vec![]),
            ("42", vec![atom("42")]),
            ("(+ 1 2)", vec![Open, atom("+"), atom("1"), atom("2"), Close]),
            ("(())", vec![Open, Open, Close, Close]),
            ("((a", vec![Open, Open, atom("a")]),
            (")(", vec![Close, Open]),
            ("a;comment\nb", vec![atom("a"), atom("b")]),
            ("; only a comment", vec![]),
            ("(define x 1) ; trailing", vec![Open, atom("define"), atom("x"), atom("1"), Close]),
            ("set-car! list? <=", vec![atom("set-car!"), atom("list?"), atom("<=")]),
            ("(a\u{a0}b)", vec![Open, atom("a"), atom("b"), Close]),
            ("x\r\ny", vec![atom("x"), atom("y")]),
        ];

        for (i, (input, expected)) in cases.into_iter().enumerate() {
            assert_eq!(tokenize(input), expected, "tokenize case #{} ({input:?})", i + 1);
        }
    }

    #[test]
    fn test_tokens_survive_rejoining() {
        let programs = [
            "(define (f x) (* x x)) ; square\n(f 3)",
            "((lambda (a b) (+ a b)) 1 2.5)",
            "(let ((x 1)) (set! x (+ x 1)) x)",
        ];
        for program in programs {
            let tokens = tokenize(program);
            let rejoined = tokens
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            assert_eq!(tokenize(&rejoined), tokens, "tokens of {program:?}");
        }
    }

    /// Expected outcome of a parse test case
    #[derive(Debug)]
    enum ParseTestResult {
        Success(Value),
        SpecificError(ParseErrorKind),
    }
    use ParseTestResult::*;

    fn success<T: Into<Value>>(value: T) -> ParseTestResult {
        Success(value.into())
    }

    #[test]
    fn test_parser_comprehensive() {
        let test_cases = vec![
            // Numbers
            ("42", success(42)),
            ("-5", success(-5)),
            ("+7", success(7)),
            ("0", success(0)),
            ("3.14", success(3.14)),
            ("-0.5", success(-0.5)),
            ("1e3", success(1000.0)),
            (".5", success(0.5)),
            ("9223372036854775807", success(i64::MAX)),
            ("-9223372036854775808", success(i64::MIN)),
            ("99999999999999999999", SpecificError(ParseErrorKind::InvalidNumber)),
            // Booleans
            ("#t", success(true)),
            ("#f", success(false)),
            // Symbols, including lexemes that merely contain digits
            ("foo", success(sym("foo"))),
            ("+", success(sym("+"))),
            ("-", success(sym("-"))),
            ("set-car!", success(sym("set-car!"))),
            ("x1", success(sym("x1"))),
            ("1+", success(sym("1+"))),
            ("#true", success(sym("#true"))),
            ("nil", success(sym("nil"))),
            // Lists
            ("()", success(nil())),
            ("( )", success(nil())),
            ("(1 2 3)", success([1, 2, 3])),
            (
                "(+ 1 (* 2 3))",
                success(vec![sym("+"), val(1), val(vec![sym("*"), val(2), val(3)])]),
            ),
            ("(() ())", success(vec![nil(), nil()])),
            ("(a ; comment\n b)", success(vec![sym("a"), sym("b")])),
            // Bracketing errors
            ("", SpecificError(ParseErrorKind::Empty)),
            ("; nothing", SpecificError(ParseErrorKind::Empty)),
            ("(", SpecificError(ParseErrorKind::Unclosed)),
            ("(1 (2 3)", SpecificError(ParseErrorKind::Unclosed)),
            (")", SpecificError(ParseErrorKind::UnexpectedClose)),
            ("(1))", SpecificError(ParseErrorKind::UnexpectedClose)),
            ("1 2", SpecificError(ParseErrorKind::TrailingContent)),
            ("(a) (b)", SpecificError(ParseErrorKind::TrailingContent)),
        ];

        for (i, (input, expected)) in test_cases.into_iter().enumerate() {
            let test_id = format!("Parse test #{} ({input:?})", i + 1);
            match (parse_scheme(input), expected) {
                (Ok(actual), Success(expected_val)) => {
                    assert_eq!(actual, expected_val, "{test_id}: value mismatch");

                    // display -> parse -> display is stable
                    let displayed = format!("{actual}");
                    let reparsed = parse_scheme(&displayed).unwrap_or_else(|e| {
                        panic!("{test_id}: round-trip parse failed for '{displayed}': {e:?}")
                    });
                    assert_eq!(displayed, format!("{reparsed}"), "{test_id}: round-trip");
                }
                (Err(Error::ParseError(err)), SpecificError(kind)) => {
                    assert_eq!(err.kind, kind, "{test_id}: wrong error kind");
                }
                (Ok(actual), SpecificError(kind)) => {
                    panic!("{test_id}: expected {kind:?}, got {actual:?}")
                }
                (Err(err), expected) => {
                    panic!("{test_id}: expected {expected:?}, got error {err:?}")
                }
            }
        }
    }

    #[test]
    fn test_parse_builds_pairs() {
        let parsed = parse_scheme("(1 2)").unwrap();
        assert_eq!(parsed, cons(val(1), cons(val(2), nil())));
        assert!(parsed.is_list());
    }

    #[test]
    fn test_parse_program() {
        let tokens = tokenize("(define x 2)\n; comment\n(* x 21)\n7");
        let program = parse_program(&tokens).unwrap();
        assert_eq!(
            program,
            vec![
                val(vec![sym("define"), sym("x"), val(2)]),
                val(vec![sym("*"), sym("x"), val(21)]),
                val(7),
            ]
        );

        assert!(matches!(
            parse_program(&tokenize("(a) (b")),
            Err(Error::ParseError(ParseError {
                kind: ParseErrorKind::Unclosed,
                ..
            }))
        ));
        assert!(matches!(
            parse_program(&[]),
            Err(Error::ParseError(ParseError {
                kind: ParseErrorKind::Empty,
                ..
            }))
        ));
    }

    #[test]
    fn test_parse_errors_are_syntax_class() {
        for input in ["(", ")", "", "a b", "123456789012345678901234"] {
            let err = parse_scheme(input).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Syntax, "{input:?}");
            assert_eq!(err.phase(), crate::ErrorPhase::Parse, "{input:?}");
        }
    }

    #[test]
    fn test_deeply_nested_input() {
        let depth = 50_000;
        let text = format!("{}{}", "(".repeat(depth), ")".repeat(depth));
        let parsed = parse_scheme(&text).unwrap();
        assert!(parsed.is_list());
    }
}
