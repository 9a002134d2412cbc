//! Hand-written recursive-descent parser for the query language.
//!
//! Grammar (informal):
//! ```text
//! query   := (PICK | COUNT) TypeName [IF expr]
//!            [ORDERBY attr (ASC | DESC)] [LIMIT n] [OFFSET n]
//! expr    := and_expr (OR and_expr)*
//! and_expr:= unary (AND unary)*
//! unary   := '!' unary | '(' expr ')' | term
//! term    := path (cmp '?' | INRANGE '?' '?' | TYPED TypeName)
//! path    := ident ('.' ident)*
//! ```

use crate::error::{LoamError, Result};
use crate::nquery::ast::{CmpOp, Direction, Expr, Path, Projection, Query, Term};
use crate::nquery::token::{tokenize, Keyword, Token};

pub fn parse(text: &str) -> Result<Query> {
    let tokens = tokenize(text)?;
    let mut parser = Parser { tokens, pos: 0 };
    let query = parser.query()?;
    if let Some(tok) = parser.peek() {
        return Err(parser.error(format!("trailing input starting at {}", tok.describe())));
    }
    Ok(query)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if self.peek() == Some(&Token::Keyword(kw)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Error carrying the fragment around the current position.
    fn error(&self, message: impl Into<String>) -> LoamError {
        let fragment = self
            .tokens
            .iter()
            .skip(self.pos.saturating_sub(1))
            .take(3)
            .map(Token::describe)
            .collect::<Vec<_>>()
            .join(" ");
        LoamError::QuerySyntax {
            fragment: if fragment.is_empty() {
                "<end of query>".into()
            } else {
                fragment
            },
            message: message.into(),
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            Some(Token::Keyword(_)) => {
                self.pos -= 1;
                Err(self.error(format!("reserved keyword cannot be used as {what}")))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error(format!("expected {what}")))
            }
        }
    }

    fn expect_placeholder(&mut self) -> Result<()> {
        match self.next() {
            Some(Token::Placeholder) => Ok(()),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected '?' argument placeholder"))
            }
        }
    }

    fn query(&mut self) -> Result<Query> {
        let projection = match self.next() {
            Some(Token::Keyword(Keyword::Pick)) => Projection::Pick,
            Some(Token::Keyword(Keyword::Count)) => Projection::Count,
            _ => {
                self.pos = self.pos.saturating_sub(1);
                return Err(self.error("query must start with PICK or COUNT"));
            }
        };
        let type_name = self.expect_ident("a type name")?;

        let predicate = if self.eat_keyword(Keyword::If) {
            Some(self.expr()?)
        } else {
            None
        };

        let order_by = if self.eat_keyword(Keyword::OrderBy) {
            let attr = self.expect_ident("an ordering attribute")?;
            let direction = if self.eat_keyword(Keyword::Asc) {
                Direction::Asc
            } else if self.eat_keyword(Keyword::Desc) {
                Direction::Desc
            } else {
                Direction::Asc
            };
            Some((attr, direction))
        } else {
            None
        };

        let limit = if self.eat_keyword(Keyword::Limit) {
            Some(self.expect_number("LIMIT")?)
        } else {
            None
        };
        let offset = if self.eat_keyword(Keyword::Offset) {
            Some(self.expect_number("OFFSET")?)
        } else {
            None
        };

        Ok(Query {
            projection,
            type_name,
            predicate,
            order_by,
            limit,
            offset,
        })
    }

    fn expect_number(&mut self, clause: &str) -> Result<u64> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error(format!("{clause} expects a number")))
            }
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_keyword(Keyword::Or) {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        while self.eat_keyword(Keyword::And) {
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Bang) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => {
                        self.pos = self.pos.saturating_sub(1);
                        Err(self.error("expected ')'"))
                    }
                }
            }
            _ => Ok(Expr::Term(self.term()?)),
        }
    }

    fn term(&mut self) -> Result<Term> {
        let path = self.path()?;
        match self.next() {
            Some(Token::Eq) => {
                self.expect_placeholder()?;
                Ok(Term::Cmp {
                    path,
                    op: CmpOp::Eq,
                })
            }
            Some(Token::Gt) => {
                self.expect_placeholder()?;
                Ok(Term::Cmp {
                    path,
                    op: CmpOp::Gt,
                })
            }
            Some(Token::Ge) => {
                self.expect_placeholder()?;
                Ok(Term::Cmp {
                    path,
                    op: CmpOp::Ge,
                })
            }
            Some(Token::Lt) => {
                self.expect_placeholder()?;
                Ok(Term::Cmp {
                    path,
                    op: CmpOp::Lt,
                })
            }
            Some(Token::Le) => {
                self.expect_placeholder()?;
                Ok(Term::Cmp {
                    path,
                    op: CmpOp::Le,
                })
            }
            Some(Token::Keyword(Keyword::InRange)) => {
                self.expect_placeholder()?;
                self.expect_placeholder()?;
                Ok(Term::InRange { path })
            }
            Some(Token::Keyword(Keyword::Typed)) => {
                let type_name = self.expect_ident("a type name after TYPED")?;
                Ok(Term::Typed { path, type_name })
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("expected a comparison after the attribute path"))
            }
        }
    }

    fn path(&mut self) -> Result<Path> {
        let mut segments = vec![self.expect_ident("an attribute name")?];
        while self.peek() == Some(&Token::Dot) {
            self.pos += 1;
            segments.push(self.expect_ident("a path segment after '.'")?);
        }
        Ok(Path { segments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_query() {
        let q = parse("PICK Foo").unwrap();
        assert_eq!(q.projection, Projection::Pick);
        assert_eq!(q.type_name, "Foo");
        assert!(q.predicate.is_none());
        assert!(q.order_by.is_none());
    }

    #[test]
    fn parses_full_query() {
        let q = parse(
            "PICK Foo IF ref.Bar.barValue = ? AND (value > ? OR !active = ?) ORDERBY value DESC LIMIT 5 OFFSET 10",
        )
        .unwrap();
        assert_eq!(q.order_by, Some(("value".into(), Direction::Desc)));
        assert_eq!(q.limit, Some(5));
        assert_eq!(q.offset, Some(10));

        let Some(Expr::And(left, right)) = q.predicate else {
            panic!("expected AND at the top")
        };
        let Expr::Term(Term::Cmp { path, op }) = *left else {
            panic!("expected comparison")
        };
        assert_eq!(path.segments, vec!["ref", "Bar", "barValue"]);
        assert_eq!(op, CmpOp::Eq);
        assert!(matches!(*right, Expr::Or(_, _)));
    }

    #[test]
    fn parses_inrange_and_typed() {
        let q = parse("PICK Foo IF amount INRANGE ? ? AND mref TYPED Baz").unwrap();
        let Some(Expr::And(left, right)) = q.predicate else {
            panic!()
        };
        assert!(matches!(*left, Expr::Term(Term::InRange { .. })));
        let Expr::Term(Term::Typed { path, type_name }) = *right else {
            panic!()
        };
        assert_eq!(path.segments, vec!["mref"]);
        assert_eq!(type_name, "Baz");
    }

    #[test]
    fn count_projection() {
        let q = parse("COUNT Foo IF value = ?").unwrap();
        assert_eq!(q.projection, Projection::Count);
    }

    #[test]
    fn reserved_word_is_not_an_attribute_name() {
        let err = parse("PICK Foo IF limit = ?").unwrap_err();
        let LoamError::QuerySyntax { message, .. } = &err else {
            panic!("expected syntax error, got {err:?}")
        };
        assert!(message.contains("reserved keyword"));
    }

    #[test]
    fn syntax_error_carries_fragment() {
        let err = parse("PICK Foo IF value = = ?").unwrap_err();
        let LoamError::QuerySyntax { fragment, .. } = &err else {
            panic!()
        };
        assert!(fragment.contains('='), "fragment was {fragment}");
    }

    #[test]
    fn trailing_input_rejected() {
        let err = parse("PICK Foo IF value = ? garbage garbage").unwrap_err();
        assert!(err.to_string().contains("comparison") || err.to_string().contains("trailing"));
    }

    #[test]
    fn missing_placeholder_rejected() {
        let err = parse("PICK Foo IF value =").unwrap_err();
        assert!(err.to_string().contains("placeholder"));
    }
}
