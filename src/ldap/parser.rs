//! Hand-written recursive-descent parser for the filter grammar:
//!
//! ```text
//! filter     := '(' filtercomp ')'
//! filtercomp := and | or | not | item
//! and        := '&' filter+
//! or         := '|' filter+
//! not        := '!' filter
//! item       := attr op value
//! op         := '=' | '<=' | '>=' | '~='
//! ```

use crate::error::{Result, RuntimeError};

use super::Filter;

pub fn parse(text: &str) -> Result<Filter> {
    let chars: Vec<char> = text.trim().chars().collect();
    let mut p = Parser { chars: &chars, pos: 0 };
    let filter = p.parse_filter()?;
    if p.pos != p.chars.len() {
        return Err(bad(text));
    }
    Ok(filter)
}

struct Parser<'a> {
    chars: &'a [char],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn expect(&mut self, want: char) -> Result<()> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            _ => Err(bad_pos(self.pos)),
        }
    }

    fn parse_filter(&mut self) -> Result<Filter> {
        self.expect('(')?;
        let filter = match self.peek() {
            Some('&') => {
                self.bump();
                Filter::And(self.parse_filter_list()?)
            }
            Some('|') => {
                self.bump();
                Filter::Or(self.parse_filter_list()?)
            }
            Some('!') => {
                self.bump();
                Filter::Not(Box::new(self.parse_filter()?))
            }
            _ => self.parse_item()?,
        };
        self.expect(')')?;
        Ok(filter)
    }

    fn parse_filter_list(&mut self) -> Result<Vec<Filter>> {
        let mut filters = Vec::new();
        while self.peek() == Some('(') {
            filters.push(self.parse_filter()?);
        }
        if filters.is_empty() {
            return Err(bad_pos(self.pos));
        }
        Ok(filters)
    }

    fn parse_item(&mut self) -> Result<Filter> {
        let attr = self.parse_until_operator()?;
        let op = self.parse_operator()?;
        let value = self.parse_value();

        Ok(match op {
            "=" if value == "*" => Filter::Present(attr),
            "=" => Filter::Equal(attr, value),
            "~=" => Filter::Approx(attr, value),
            ">=" => Filter::GreaterEq(attr, value),
            "<=" => Filter::LessEq(attr, value),
            _ => unreachable!("parse_operator only returns known operators"),
        })
    }

    fn parse_until_operator(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '=' || c == '~' || c == '<' || c == '>' {
                break;
            }
            if c == ')' || c == '(' {
                return Err(bad_pos(self.pos));
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(bad_pos(self.pos));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn parse_operator(&mut self) -> Result<&'static str> {
        match self.peek() {
            Some('=') => {
                self.bump();
                Ok("=")
            }
            Some('~') => {
                self.bump();
                self.expect('=')?;
                Ok("~=")
            }
            Some('<') => {
                self.bump();
                self.expect('=')?;
                Ok("<=")
            }
            Some('>') => {
                self.bump();
                self.expect('=')?;
                Ok(">=")
            }
            _ => Err(bad_pos(self.pos)),
        }
    }

    fn parse_value(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == ')' {
                break;
            }
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }
}

fn bad(text: &str) -> RuntimeError {
    RuntimeError::BadFilter(text.to_string())
}

fn bad_pos(pos: usize) -> RuntimeError {
    RuntimeError::BadFilter(format!("unexpected character at position {pos}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unbalanced_filters() {
        assert!(parse("(x=1").is_err());
        assert!(parse("x=1)").is_err());
        assert!(parse("(&(x=1))extra").is_err());
    }

    #[test]
    fn rejects_empty_boolean_group() {
        assert!(parse("(&)").is_err());
    }

    #[test]
    fn parses_nested_groups() {
        let f = parse("(&(x=1)(|(y=2)(y=3)))").unwrap();
        match f {
            Filter::And(children) => assert_eq!(children.len(), 2),
            _ => panic!("expected And"),
        }
    }
}
