//! Rule program reader
//!
//! Tokenizes with `nom` and parses with an operator-precedence parser over the
//! standard operator table. Variables of each term are numbered from zero in
//! order of first appearance.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while, take_while1},
    character::complete::{anychar, char, digit1, multispace1, none_of, one_of, satisfy},
    combinator::{map, map_res, opt, recognize, value},
    multi::many0,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

use super::error::{EngineError, Result};
use super::term::{Term, Var};

/// A term read from source, with its named variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadTerm {
    pub term: Term,
    /// Named variables in order of first appearance. `_` is never listed.
    pub variables: Vec<(String, Var)>,
    /// Number of distinct variables, including anonymous ones.
    pub var_count: usize,
}

/// Read every clause in `source`. Each clause must end with `.`.
pub fn read_program(source: &str) -> Result<Vec<ReadTerm>> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(&tokens);
    let mut terms = Vec::new();
    while !parser.at_end() {
        terms.push(parser.read_clause()?);
    }
    Ok(terms)
}

/// Read exactly one term. The terminating `.` is optional.
pub fn read_term(source: &str) -> Result<ReadTerm> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(&tokens);
    if parser.at_end() {
        return Err(EngineError::syntax(1, "empty term"));
    }
    let (term, _) = parser.parse(1200)?;
    if matches!(parser.peek(), Some(Token::End)) {
        parser.pos += 1;
    }
    if let Some(spanned) = parser.tokens.get(parser.pos) {
        return Err(EngineError::syntax(
            spanned.line,
            "unexpected input after term",
        ));
    }
    Ok(parser.finish(term))
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Name(String),
    /// Quoted atom; never treated as an operator.
    Quoted(String),
    Var(String),
    Int(i64),
    Float(f64),
    Open,
    Close,
    OpenList,
    CloseList,
    OpenCurly,
    CloseCurly,
    Comma,
    Bar,
    End,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    layout_before: bool,
    line: usize,
}

const SYMBOL_CHARS: &str = "+-*/\\^<>=~:.?@#&$";

fn is_alnum(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn line_comment(i: &str) -> IResult<&str, &str> {
    recognize(pair(char('%'), take_while(|c| c != '\n')))(i)
}

fn block_comment(i: &str) -> IResult<&str, &str> {
    recognize(tuple((tag("/*"), take_until("*/"), tag("*/"))))(i)
}

fn layout(i: &str) -> IResult<&str, bool> {
    map(
        many0(alt((multispace1, line_comment, block_comment))),
        |skipped| !skipped.is_empty(),
    )(i)
}

fn end(i: &str) -> IResult<&str, Token> {
    let (rest, _) = char('.')(i)?;
    match rest.chars().next() {
        None => Ok((rest, Token::End)),
        Some(c) if c.is_whitespace() || c == '%' => Ok((rest, Token::End)),
        Some(_) => Err(nom::Err::Error(nom::error::Error::new(
            i,
            nom::error::ErrorKind::Char,
        ))),
    }
}

fn escape(i: &str) -> IResult<&str, char> {
    alt((
        value('\n', char('n')),
        value('\t', char('t')),
        value('\r', char('r')),
        value('\\', char('\\')),
        value('\'', char('\'')),
        value('"', char('"')),
        value('`', char('`')),
    ))(i)
}

fn quoted_text(quote: char) -> impl Fn(&str) -> IResult<&str, String> {
    move |i| {
        let doubled: &'static str = if quote == '\'' { "''" } else { "\"\"" };
        let stop: &'static str = if quote == '\'' { "'\\" } else { "\"\\" };
        delimited(
            char(quote),
            map(
                many0(alt((
                    value(quote, tag(doubled)),
                    preceded(char('\\'), escape),
                    none_of(stop),
                ))),
                |chars| chars.into_iter().collect(),
            ),
            char(quote),
        )(i)
    }
}

fn char_code(i: &str) -> IResult<&str, Token> {
    map(
        preceded(tag("0'"), alt((preceded(char('\\'), escape), anychar))),
        |c| Token::Int(c as i64),
    )(i)
}

fn float(i: &str) -> IResult<&str, Token> {
    map_res(
        recognize(tuple((
            digit1,
            char('.'),
            digit1,
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
        |s: &str| s.parse::<f64>().map(Token::Float),
    )(i)
}

fn integer(i: &str) -> IResult<&str, Token> {
    map_res(digit1, |s: &str| s.parse::<i64>().map(Token::Int))(i)
}

fn variable(i: &str) -> IResult<&str, Token> {
    map(
        recognize(pair(
            satisfy(|c| c.is_ascii_uppercase() || c == '_'),
            take_while(is_alnum),
        )),
        |s: &str| Token::Var(s.to_string()),
    )(i)
}

fn name(i: &str) -> IResult<&str, Token> {
    map(
        alt((
            recognize(pair(satisfy(|c| c.is_ascii_lowercase()), take_while(is_alnum))),
            take_while1(|c| SYMBOL_CHARS.contains(c)),
            tag("!"),
            tag(";"),
        )),
        |s: &str| Token::Name(s.to_string()),
    )(i)
}

fn punctuation(i: &str) -> IResult<&str, Token> {
    alt((
        value(Token::Open, char('(')),
        value(Token::Close, char(')')),
        value(Token::OpenList, char('[')),
        value(Token::CloseList, char(']')),
        value(Token::OpenCurly, char('{')),
        value(Token::CloseCurly, char('}')),
        value(Token::Comma, char(',')),
        value(Token::Bar, char('|')),
    ))(i)
}

fn token(i: &str) -> IResult<&str, Token> {
    alt((
        end,
        char_code,
        float,
        integer,
        variable,
        map(quoted_text('\''), Token::Quoted),
        map(quoted_text('"'), Token::Quoted),
        punctuation,
        name,
    ))(i)
}

fn line_at(source: &str, rest: &str) -> usize {
    source[..source.len() - rest.len()].matches('\n').count() + 1
}

fn tokenize(source: &str) -> Result<Vec<Spanned>> {
    let mut tokens = Vec::new();
    let mut rest = source;
    loop {
        let (after, layout_before) =
            layout(rest).map_err(|_| EngineError::syntax(line_at(source, rest), "bad layout"))?;
        rest = after;
        if rest.is_empty() {
            return Ok(tokens);
        }
        let line = line_at(source, rest);
        if rest.starts_with("/*") {
            return Err(EngineError::syntax(line, "unterminated block comment"));
        }
        let (after, token) = token(rest).map_err(|_| {
            let found = rest.chars().next().unwrap_or(' ');
            EngineError::syntax(line, format!("unexpected character {:?}", found))
        })?;
        tokens.push(Spanned {
            token,
            layout_before,
            line,
        });
        rest = after;
    }
}

// ============================================================================
// Operators
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Assoc {
    Xfx,
    Xfy,
    Yfx,
    Fx,
    Fy,
}

fn infix_op(name: &str) -> Option<(u16, Assoc)> {
    let op = match name {
        ":-" | "-->" => (1200, Assoc::Xfx),
        ";" | "|" => (1100, Assoc::Xfy),
        "->" => (1050, Assoc::Xfy),
        "," => (1000, Assoc::Xfy),
        "=" | "\\=" | "==" | "\\==" | "@<" | "@>" | "@=<" | "@>=" | "=.." | "is" | "=:="
        | "=\\=" | "<" | ">" | "=<" | ">=" => (700, Assoc::Xfx),
        "+" | "-" | "/\\" | "\\/" => (500, Assoc::Yfx),
        "*" | "/" | "//" | "mod" | "rem" | "<<" | ">>" => (400, Assoc::Yfx),
        "**" => (200, Assoc::Xfx),
        "^" => (200, Assoc::Xfy),
        ":" => (200, Assoc::Xfy),
        _ => return None,
    };
    Some(op)
}

fn prefix_op(name: &str) -> Option<(u16, Assoc)> {
    let op = match name {
        ":-" | "?-" => (1200, Assoc::Fx),
        "dynamic" | "initialization" => (1150, Assoc::Fx),
        "\\+" => (900, Assoc::Fy),
        "-" | "+" | "\\" => (200, Assoc::Fy),
        _ => return None,
    };
    Some(op)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser<'a> {
    tokens: &'a [Spanned],
    pos: usize,
    variables: Vec<(String, Var)>,
    var_count: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Spanned]) -> Self {
        Self {
            tokens,
            pos: 0,
            variables: Vec::new(),
            var_count: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_spanned(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.line)
            .unwrap_or(1)
    }

    fn error(&self, message: impl Into<String>) -> EngineError {
        EngineError::syntax(self.line(), message)
    }

    fn next(&mut self) -> Result<Spanned> {
        let spanned = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.error("unexpected end of input"))?;
        self.pos += 1;
        Ok(spanned)
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        match self.peek() {
            Some(token) if *token == expected => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.error(format!("expected {}", what))),
        }
    }

    fn finish(&mut self, term: Term) -> ReadTerm {
        let read = ReadTerm {
            term,
            variables: std::mem::take(&mut self.variables),
            var_count: self.var_count,
        };
        self.var_count = 0;
        read
    }

    fn read_clause(&mut self) -> Result<ReadTerm> {
        let (term, _) = self.parse(1200)?;
        self.expect(Token::End, "'.' at end of clause")?;
        Ok(self.finish(term))
    }

    fn variable(&mut self, name: String) -> Term {
        if name != "_" {
            if let Some((_, var)) = self.variables.iter().find(|(n, _)| *n == name) {
                return Term::Var(*var);
            }
        }
        let var = Var(self.var_count);
        self.var_count += 1;
        if name != "_" {
            self.variables.push((name, var));
        }
        Term::Var(var)
    }

    /// Name token of the next infix operator candidate, if any.
    fn peek_infix(&self) -> Option<&str> {
        match self.peek()? {
            Token::Name(name) => Some(name.as_str()),
            Token::Comma => Some(","),
            Token::Bar => Some("|"),
            _ => None,
        }
    }

    /// Whether the next token is an opening parenthesis with no layout before it.
    fn peek_functional(&self) -> bool {
        matches!(
            self.peek_spanned(),
            Some(Spanned { token: Token::Open, layout_before: false, .. })
        )
    }

    fn next_starts_term(&self) -> bool {
        match self.peek() {
            Some(Token::Name(name)) => infix_op(name).is_none() || prefix_op(name).is_some(),
            Some(
                Token::Quoted(_)
                | Token::Var(_)
                | Token::Int(_)
                | Token::Float(_)
                | Token::Open
                | Token::OpenList
                | Token::OpenCurly,
            ) => true,
            _ => false,
        }
    }

    fn parse(&mut self, max: u16) -> Result<(Term, u16)> {
        let (mut left, mut left_prec) = self.parse_primary(max)?;
        while let Some(name) = self.peek_infix() {
            let Some((prec, assoc)) = infix_op(name) else {
                break;
            };
            let (left_max, right_max) = match assoc {
                Assoc::Xfy => (prec - 1, prec),
                Assoc::Yfx => (prec, prec - 1),
                _ => (prec - 1, prec - 1),
            };
            if prec > max || left_prec > left_max {
                break;
            }
            let functor = if name == "|" { ";".to_string() } else { name.to_string() };
            self.pos += 1;
            let (right, _) = self.parse(right_max)?;
            left = Term::compound(functor, vec![left, right]);
            left_prec = prec;
        }
        Ok((left, left_prec))
    }

    fn parse_arguments(&mut self) -> Result<Vec<Term>> {
        self.expect(Token::Open, "'('")?;
        let mut args = Vec::new();
        loop {
            let (arg, _) = self.parse(999)?;
            args.push(arg);
            match self.next()?.token {
                Token::Comma => continue,
                Token::Close => return Ok(args),
                _ => return Err(self.error("expected ',' or ')' in arguments")),
            }
        }
    }

    fn parse_list(&mut self) -> Result<Term> {
        if matches!(self.peek(), Some(Token::CloseList)) {
            self.pos += 1;
            return Ok(Term::nil());
        }
        let mut items = Vec::new();
        loop {
            let (item, _) = self.parse(999)?;
            items.push(item);
            match self.next()?.token {
                Token::Comma => continue,
                Token::Bar => {
                    let (tail, _) = self.parse(999)?;
                    self.expect(Token::CloseList, "']'")?;
                    return Ok(Term::list_with_tail(items, tail));
                }
                Token::CloseList => return Ok(Term::list(items)),
                _ => return Err(self.error("expected ',', '|' or ']' in list")),
            }
        }
    }

    fn parse_name(&mut self, name: String, max: u16) -> Result<(Term, u16)> {
        if self.peek_functional() {
            let args = self.parse_arguments()?;
            return Ok((Term::compound(name, args), 0));
        }

        if name == "-" {
            if let Some(Spanned {
                token,
                layout_before: false,
                ..
            }) = self.peek_spanned()
            {
                let negated = match token {
                    Token::Int(i) => Some(Term::Integer(-i)),
                    Token::Float(x) => Some(Term::Float(-x)),
                    _ => None,
                };
                if let Some(number) = negated {
                    self.pos += 1;
                    return Ok((number, 0));
                }
            }
        }

        if let Some((prec, assoc)) = prefix_op(&name) {
            if prec <= max && self.next_starts_term() {
                let arg_max = if assoc == Assoc::Fy { prec } else { prec - 1 };
                let (arg, _) = self.parse(arg_max)?;
                return Ok((Term::compound(name, vec![arg]), prec));
            }
        }

        Ok((Term::atom(name), 0))
    }

    fn parse_primary(&mut self, max: u16) -> Result<(Term, u16)> {
        let spanned = self.next()?;
        match spanned.token {
            Token::Int(i) => Ok((Term::Integer(i), 0)),
            Token::Float(x) => Ok((Term::Float(x), 0)),
            Token::Var(name) => Ok((self.variable(name), 0)),
            Token::Quoted(name) => {
                if self.peek_functional() {
                    let args = self.parse_arguments()?;
                    Ok((Term::compound(name, args), 0))
                } else {
                    Ok((Term::atom(name), 0))
                }
            }
            Token::Name(name) => self.parse_name(name, max),
            Token::Open => {
                let (term, _) = self.parse(1200)?;
                self.expect(Token::Close, "')'")?;
                Ok((term, 0))
            }
            Token::OpenList => Ok((self.parse_list()?, 0)),
            Token::OpenCurly => {
                if matches!(self.peek(), Some(Token::CloseCurly)) {
                    self.pos += 1;
                    return Ok((Term::atom("{}"), 0));
                }
                let (term, _) = self.parse(1200)?;
                self.expect(Token::CloseCurly, "'}'")?;
                Ok((Term::compound("{}", vec![term]), 0))
            }
            Token::End => Err(self.error("unexpected end of clause")),
            other => Err(self.error(format!("unexpected {}", describe(&other)))),
        }
    }
}

fn describe(token: &Token) -> &'static str {
    match token {
        Token::Close => "')'",
        Token::CloseList => "']'",
        Token::CloseCurly => "'}'",
        Token::Comma => "','",
        Token::Bar => "'|'",
        _ => "token",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(source: &str) -> Term {
        read_term(source).unwrap().term
    }

    #[test]
    fn test_read_clause_with_operators() {
        let clauses = read_program("tunnel(P, F) :- member(proxy(P), F), !.\n").unwrap();
        assert_eq!(clauses.len(), 1);
        let clause = &clauses[0];
        assert_eq!(clause.var_count, 2);
        assert_eq!(clause.variables, vec![("P".to_string(), Var(0)), ("F".to_string(), Var(1))]);
        assert_eq!(
            clause.term,
            Term::compound(
                ":-",
                vec![
                    Term::compound("tunnel", vec![Term::var(0), Term::var(1)]),
                    Term::compound(
                        ",",
                        vec![
                            Term::compound(
                                "member",
                                vec![Term::compound("proxy", vec![Term::var(0)]), Term::var(1)]
                            ),
                            Term::atom("!"),
                        ]
                    ),
                ]
            )
        );
    }

    #[test]
    fn test_read_arithmetic_precedence() {
        assert_eq!(
            read("X is 1 + 2 * 3 - 4"),
            Term::compound(
                "is",
                vec![
                    Term::var(0),
                    Term::compound(
                        "-",
                        vec![
                            Term::compound(
                                "+",
                                vec![
                                    Term::Integer(1),
                                    Term::compound("*", vec![Term::Integer(2), Term::Integer(3)])
                                ]
                            ),
                            Term::Integer(4),
                        ]
                    ),
                ]
            )
        );
    }

    #[test]
    fn test_read_pairs_and_lists() {
        assert_eq!(
            read("[id-foo, port-8080|T]"),
            Term::list_with_tail(
                vec![
                    Term::pair(Term::atom("id"), Term::atom("foo")),
                    Term::pair(Term::atom("port"), Term::Integer(8080)),
                ],
                Term::var(0)
            )
        );
        assert_eq!(read("[]"), Term::nil());
    }

    #[test]
    fn test_read_quoted_atoms_and_strings() {
        assert_eq!(read("'localhost:8080'"), Term::atom("localhost:8080"));
        assert_eq!(read("'It''s'"), Term::atom("It's"));
        assert_eq!(read("'a\\nb'"), Term::atom("a\nb"));
        assert_eq!(read("\"text\""), Term::atom("text"));
        assert_eq!(
            read("'User-Agent'-[proxima]"),
            Term::pair(
                Term::atom("User-Agent"),
                Term::list(vec![Term::atom("proxima")])
            )
        );
    }

    #[test]
    fn test_read_numbers() {
        assert_eq!(read("-1"), Term::Integer(-1));
        assert_eq!(read("2.5"), Term::Float(2.5));
        assert_eq!(read("1.0e3"), Term::Float(1000.0));
        assert_eq!(read("0'a"), Term::Integer(97));
        assert_eq!(
            read("a - 1"),
            Term::compound("-", vec![Term::atom("a"), Term::Integer(1)])
        );
        assert_eq!(read("- a"), Term::compound("-", vec![Term::atom("a")]));
    }

    #[test]
    fn test_read_if_then_else_and_negation() {
        assert_eq!(
            read("(a -> b ; \\+ c)"),
            Term::compound(
                ";",
                vec![
                    Term::compound("->", vec![Term::atom("a"), Term::atom("b")]),
                    Term::compound("\\+", vec![Term::atom("c")]),
                ]
            )
        );
    }

    #[test]
    fn test_read_directive() {
        let clauses = read_program(":- dynamic tunnel/2.").unwrap();
        assert_eq!(
            clauses[0].term,
            Term::compound(
                ":-",
                vec![Term::compound(
                    "dynamic",
                    vec![Term::compound(
                        "/",
                        vec![Term::atom("tunnel"), Term::Integer(2)]
                    )]
                )]
            )
        );
    }

    #[test]
    fn test_read_comments_and_anonymous_variables() {
        let source = "% leading comment\nfoo(_, _, X). /* block */ bar.\n";
        let clauses = read_program(source).unwrap();
        assert_eq!(clauses.len(), 2);
        assert_eq!(clauses[0].var_count, 3);
        assert_eq!(clauses[0].variables.len(), 1);
        assert_eq!(clauses[1].term, Term::atom("bar"));
    }

    #[test]
    fn test_read_errors_report_line() {
        let err = read_program("foo.\nbar(.\n").unwrap_err();
        assert!(matches!(err, EngineError::Syntax { line: 2, .. }));

        assert!(read_program("foo").is_err());
        assert!(read_term("a b").is_err());
        assert!(read_program("/* open").is_err());
    }

    #[test]
    fn test_read_curly_term() {
        assert_eq!(
            read("{a, b}"),
            Term::compound(
                "{}",
                vec![Term::compound(",", vec![Term::atom("a"), Term::atom("b")])]
            )
        );
    }
}
