//! Restricted arithmetic expressions
//!
//! Grammar: `+ - * /`, unary minus, parentheses, decimal numbers and
//! identifiers naming one of the formula's declared sources. Expressions are
//! parsed once when a device is loaded; each pass only evaluates the tree.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// Index into the formula's source list.
    Source(usize),
    Neg(Box<Expr>),
    Binary(Op, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("unexpected character `{0}` at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("invalid number `{0}`")]
    InvalidNumber(String),
    #[error("`{0}` is not one of the formula's sources")]
    UnknownIdentifier(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected `{0}`")]
    UnexpectedToken(String),
    #[error("empty expression")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Open,
    Close,
}

impl Token {
    fn text(&self) -> String {
        match self {
            Token::Number(n) => n.to_string(),
            Token::Ident(name) => name.clone(),
            Token::Plus => "+".into(),
            Token::Minus => "-".into(),
            Token::Star => "*".into(),
            Token::Slash => "/".into(),
            Token::Open => "(".into(),
            Token::Close => ")".into(),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some(&(offset, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '+' | '-' | '*' | '/' | '(' | ')' => {
                chars.next();
                tokens.push(match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '(' => Token::Open,
                    _ => Token::Close,
                });
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut literal = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        literal.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| ParseError::InvalidNumber(literal.clone()))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(ParseError::UnexpectedChar(other, offset)),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    sources: &'a [String],
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    // sum := term (('+' | '-') term)*
    fn sum(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => Op::Add,
                Some(Token::Minus) => Op::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => Op::Mul,
                Some(Token::Slash) => Op::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(name)) => self
                .sources
                .iter()
                .position(|s| *s == name)
                .map(Expr::Source)
                .ok_or(ParseError::UnknownIdentifier(name)),
            Some(Token::Open) => {
                let inner = self.sum()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    Some(other) => Err(ParseError::UnexpectedToken(other.text())),
                    None => Err(ParseError::UnexpectedEnd),
                }
            }
            Some(other) => Err(ParseError::UnexpectedToken(other.text())),
            None => Err(ParseError::UnexpectedEnd),
        }
    }
}

impl Expr {
    /// Parse `text`, resolving identifiers against `sources`.
    pub fn parse(text: &str, sources: &[String]) -> Result<Self, ParseError> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(ParseError::Empty);
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            sources,
        };
        let expr = parser.sum()?;
        match parser.next() {
            None => Ok(expr),
            Some(token) => Err(ParseError::UnexpectedToken(token.text())),
        }
    }

    /// Evaluate with `values[i]` bound to source `i`.
    ///
    /// Returns `None` on division by zero or a non-finite result.
    pub fn eval(&self, values: &[f64]) -> Option<f64> {
        let result = match self {
            Expr::Number(n) => *n,
            Expr::Source(index) => *values.get(*index)?,
            Expr::Neg(inner) => -inner.eval(values)?,
            Expr::Binary(op, lhs, rhs) => {
                let (a, b) = (lhs.eval(values)?, rhs.eval(values)?);
                match op {
                    Op::Add => a + b,
                    Op::Sub => a - b,
                    Op::Mul => a * b,
                    Op::Div if b == 0.0 => return None,
                    Op::Div => a / b,
                }
            }
        };
        result.is_finite().then_some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn eval(text: &str, sources: &[&str], values: &[f64]) -> Option<f64> {
        Expr::parse(text, &names(sources)).unwrap().eval(values)
    }

    #[test]
    fn test_precedence_and_parentheses() {
        assert_eq!(eval("1 + 2 * 3", &[], &[]), Some(7.0));
        assert_eq!(eval("(1 + 2) * 3", &[], &[]), Some(9.0));
        assert_eq!(eval("10 - 4 - 3", &[], &[]), Some(3.0));
        assert_eq!(eval("8 / 4 / 2", &[], &[]), Some(1.0));
        assert_eq!(eval("-2 * -(3 + 1)", &[], &[]), Some(8.0));
    }

    #[test]
    fn test_sources_are_substituted() {
        let value = eval("(pv1_power + pv2_power) / 1000", &["pv1_power", "pv2_power"], &[1500.0, 500.0]);
        assert_eq!(value, Some(2.0));
        assert_eq!(eval("a * 0.5", &["a"], &[3.0]), Some(1.5));
    }

    #[test]
    fn test_division_by_zero_is_none() {
        assert_eq!(eval("a / b", &["a", "b"], &[1.0, 0.0]), None);
        assert_eq!(eval("a / (b - b)", &["a", "b"], &[1.0, 2.0]), None);
    }

    #[test]
    fn test_parse_errors() {
        let sources = names(&["a"]);
        assert_eq!(
            Expr::parse("a + c", &sources),
            Err(ParseError::UnknownIdentifier("c".into()))
        );
        assert_eq!(Expr::parse("a +", &sources), Err(ParseError::UnexpectedEnd));
        assert_eq!(Expr::parse("(a", &sources), Err(ParseError::UnexpectedEnd));
        assert_eq!(Expr::parse("a)", &sources), Err(ParseError::UnexpectedToken(")".into())));
        assert_eq!(Expr::parse("a ^ 2", &sources), Err(ParseError::UnexpectedChar('^', 2)));
        assert_eq!(Expr::parse("1.2.3", &sources), Err(ParseError::InvalidNumber("1.2.3".into())));
        assert_eq!(Expr::parse("   ", &sources), Err(ParseError::Empty));
        assert!(Expr::parse("a a", &sources).is_err());
    }
}
