//! Routing rule expressions.
//!
//! Grammar:
//!
//! ```text
//! expr      := and | or | not | predicate
//! and       := "&(" expr ("," expr)+ ")"
//! or        := "|(" expr ("," expr)+ ")"
//! not       := "not(" expr ")"
//! predicate := ("equals" | "startswith") "(" attribute "," "'" literal "'" ")"
//! ```
//!
//! Whitespace between tokens is ignored. Function names are matched
//! case-insensitively, attribute names and literals are not.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

use crate::domain::Message;

/// Message attribute a predicate looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageAttribute {
    ServiceName,
    ServiceType,
    Action,
    FromPartyId,
    FromPartyIdType,
    FromPartyRole,
    ToPartyId,
    ToPartyIdType,
    ToPartyRole,
    FinalRecipient,
    OriginalSender,
    ConversationId,
}

impl MessageAttribute {
    pub const ALL: [MessageAttribute; 12] = [
        MessageAttribute::ServiceName,
        MessageAttribute::ServiceType,
        MessageAttribute::Action,
        MessageAttribute::FromPartyId,
        MessageAttribute::FromPartyIdType,
        MessageAttribute::FromPartyRole,
        MessageAttribute::ToPartyId,
        MessageAttribute::ToPartyIdType,
        MessageAttribute::ToPartyRole,
        MessageAttribute::FinalRecipient,
        MessageAttribute::OriginalSender,
        MessageAttribute::ConversationId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageAttribute::ServiceName => "ServiceName",
            MessageAttribute::ServiceType => "ServiceType",
            MessageAttribute::Action => "Action",
            MessageAttribute::FromPartyId => "FromPartyId",
            MessageAttribute::FromPartyIdType => "FromPartyIdType",
            MessageAttribute::FromPartyRole => "FromPartyRole",
            MessageAttribute::ToPartyId => "ToPartyId",
            MessageAttribute::ToPartyIdType => "ToPartyIdType",
            MessageAttribute::ToPartyRole => "ToPartyRole",
            MessageAttribute::FinalRecipient => "FinalRecipient",
            MessageAttribute::OriginalSender => "OriginalSender",
            MessageAttribute::ConversationId => "ConversationId",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        MessageAttribute::ALL.into_iter().find(|a| a.as_str() == s)
    }

    /// Read the attribute from a message. Empty values count as missing.
    pub fn resolve<'a>(&self, message: &'a Message) -> Option<&'a str> {
        let details = &message.details;
        let value = match self {
            MessageAttribute::ServiceName => Some(details.service.name.as_str()),
            MessageAttribute::ServiceType => details.service.service_type.as_deref(),
            MessageAttribute::Action => details.action.as_ref().map(|a| a.as_str()),
            MessageAttribute::FromPartyId => details.from_party.as_ref().map(|p| p.party_id.as_str()),
            MessageAttribute::FromPartyIdType => details
                .from_party
                .as_ref()
                .and_then(|p| p.party_id_type.as_deref()),
            MessageAttribute::FromPartyRole => {
                details.from_party.as_ref().and_then(|p| p.role.as_deref())
            }
            MessageAttribute::ToPartyId => details.to_party.as_ref().map(|p| p.party_id.as_str()),
            MessageAttribute::ToPartyIdType => details
                .to_party
                .as_ref()
                .and_then(|p| p.party_id_type.as_deref()),
            MessageAttribute::ToPartyRole => details.to_party.as_ref().and_then(|p| p.role.as_deref()),
            MessageAttribute::FinalRecipient => details.final_recipient.as_deref(),
            MessageAttribute::OriginalSender => details.original_sender.as_deref(),
            MessageAttribute::ConversationId => details.conversation_id.as_deref(),
        };
        value.filter(|v| !v.is_empty())
    }
}

impl fmt::Display for MessageAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed routing rule expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleExpression {
    Equals(MessageAttribute, String),
    StartsWith(MessageAttribute, String),
    And(Vec<RuleExpression>),
    Or(Vec<RuleExpression>),
    Not(Box<RuleExpression>),
}

impl RuleExpression {
    /// Parse expression text.
    pub fn parse(text: &str) -> Result<RuleExpression, MalformedExpression> {
        Parser::new(text).parse()
    }

    /// Whether `message` matches. Missing attributes never match.
    pub fn evaluate(&self, message: &Message) -> bool {
        match self {
            RuleExpression::Equals(attr, value) => attr.resolve(message) == Some(value.as_str()),
            RuleExpression::StartsWith(attr, prefix) => attr
                .resolve(message)
                .map(|v| v.starts_with(prefix.as_str()))
                .unwrap_or(false),
            RuleExpression::And(children) => children.iter().all(|c| c.evaluate(message)),
            RuleExpression::Or(children) => children.iter().any(|c| c.evaluate(message)),
            RuleExpression::Not(child) => !child.evaluate(message),
        }
    }
}

/// Canonical DSL text, parseable by [`RuleExpression::parse`].
impl fmt::Display for RuleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleExpression::Equals(attr, value) => write!(f, "equals({},'{}')", attr, value),
            RuleExpression::StartsWith(attr, value) => write!(f, "startswith({},'{}')", attr, value),
            RuleExpression::And(children) => write_list(f, '&', children),
            RuleExpression::Or(children) => write_list(f, '|', children),
            RuleExpression::Not(child) => write!(f, "not({})", child),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, op: char, children: &[RuleExpression]) -> fmt::Result {
    write!(f, "{}(", op)?;
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{}", child)?;
    }
    f.write_str(")")
}

impl Serialize for RuleExpression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RuleExpression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        RuleExpression::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// A rule expression that could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed rule expression at column {column}: {kind}")]
pub struct MalformedExpression {
    /// Byte offset of the offending token
    pub column: usize,
    pub kind: ExpressionErrorKind,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpressionErrorKind {
    #[error("expression is empty")]
    Empty,

    #[error("unbalanced parentheses")]
    UnbalancedParentheses,

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("unknown attribute '{0}'")]
    UnknownAttribute(String),

    #[error("unterminated literal")]
    UnterminatedLiteral,

    #[error("illegal character '{0}'")]
    IllegalCharacter(char),

    #[error("expected {expected}, found {found}")]
    Unexpected {
        expected: &'static str,
        found: String,
    },

    #[error("'{0}' needs at least two operands")]
    TooFewOperands(char),

    #[error("trailing input '{0}'")]
    TrailingInput(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    And,
    Or,
    Open,
    Close,
    Comma,
    Ident(&'a str),
    Literal(&'a str),
    End,
}

impl Token<'_> {
    fn describe(&self) -> String {
        match self {
            Token::And => "'&'".to_string(),
            Token::Or => "'|'".to_string(),
            Token::Open => "'('".to_string(),
            Token::Close => "')'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Ident(s) => format!("'{}'", s),
            Token::Literal(s) => format!("literal '{}'", s),
            Token::End => "end of input".to_string(),
        }
    }
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Parser { text, pos: 0 }
    }

    fn parse(mut self) -> Result<RuleExpression, MalformedExpression> {
        let (column, token) = self.peek()?;
        if token == Token::End {
            return Err(error(column, ExpressionErrorKind::Empty));
        }

        let expr = self.expression()?;

        let (column, token) = self.next()?;
        match token {
            Token::End => Ok(expr),
            Token::Close => Err(error(column, ExpressionErrorKind::UnbalancedParentheses)),
            _ => Err(error(
                column,
                ExpressionErrorKind::TrailingInput(self.text[column..].trim_end().to_string()),
            )),
        }
    }

    fn expression(&mut self) -> Result<RuleExpression, MalformedExpression> {
        let (column, token) = self.next()?;
        match token {
            Token::And => self.operands('&').map(RuleExpression::And),
            Token::Or => self.operands('|').map(RuleExpression::Or),
            Token::Ident(name) => match name.to_ascii_lowercase().as_str() {
                "not" => {
                    self.expect_open()?;
                    let child = self.expression()?;
                    self.expect_close()?;
                    Ok(RuleExpression::Not(Box::new(child)))
                }
                "equals" => {
                    let (attr, value) = self.predicate_args()?;
                    Ok(RuleExpression::Equals(attr, value))
                }
                "startswith" => {
                    let (attr, value) = self.predicate_args()?;
                    Ok(RuleExpression::StartsWith(attr, value))
                }
                _ => Err(error(
                    column,
                    ExpressionErrorKind::UnknownFunction(name.to_string()),
                )),
            },
            other => Err(unexpected(column, "expression", &other)),
        }
    }

    fn operands(&mut self, op: char) -> Result<Vec<RuleExpression>, MalformedExpression> {
        let start = self.pos;
        self.expect_open()?;

        let mut children = vec![self.expression()?];
        loop {
            let (column, token) = self.next()?;
            match token {
                Token::Comma => children.push(self.expression()?),
                Token::Close => break,
                Token::End => return Err(error(column, ExpressionErrorKind::UnbalancedParentheses)),
                other => return Err(unexpected(column, "',' or ')'", &other)),
            }
        }

        if children.len() < 2 {
            return Err(error(start.saturating_sub(1), ExpressionErrorKind::TooFewOperands(op)));
        }
        Ok(children)
    }

    fn predicate_args(&mut self) -> Result<(MessageAttribute, String), MalformedExpression> {
        self.expect_open()?;

        let (column, token) = self.next()?;
        let attr = match token {
            Token::Ident(name) => MessageAttribute::from_str(name).ok_or_else(|| {
                error(column, ExpressionErrorKind::UnknownAttribute(name.to_string()))
            })?,
            other => return Err(unexpected(column, "attribute", &other)),
        };

        let (column, token) = self.next()?;
        if token != Token::Comma {
            return Err(unexpected(column, "','", &token));
        }

        let (column, token) = self.next()?;
        let value = match token {
            Token::Literal(value) => value.to_string(),
            other => return Err(unexpected(column, "quoted literal", &other)),
        };

        self.expect_close()?;
        Ok((attr, value))
    }

    fn expect_open(&mut self) -> Result<(), MalformedExpression> {
        let (column, token) = self.next()?;
        match token {
            Token::Open => Ok(()),
            other => Err(unexpected(column, "'('", &other)),
        }
    }

    fn expect_close(&mut self) -> Result<(), MalformedExpression> {
        let (column, token) = self.next()?;
        match token {
            Token::Close => Ok(()),
            Token::End => Err(error(column, ExpressionErrorKind::UnbalancedParentheses)),
            other => Err(unexpected(column, "')'", &other)),
        }
    }

    fn peek(&self) -> Result<(usize, Token<'a>), MalformedExpression> {
        let mut lookahead = Parser {
            text: self.text,
            pos: self.pos,
        };
        lookahead.next()
    }

    /// Read the next token and its starting column.
    fn next(&mut self) -> Result<(usize, Token<'a>), MalformedExpression> {
        let rest = &self.text[self.pos..];
        let trimmed = rest.trim_start();
        self.pos += rest.len() - trimmed.len();

        let start = self.pos;
        let Some(c) = trimmed.chars().next() else {
            return Ok((start, Token::End));
        };

        let token = match c {
            '&' => Token::And,
            '|' => Token::Or,
            '(' => Token::Open,
            ')' => Token::Close,
            ',' => Token::Comma,
            '\'' => {
                let body = &trimmed[1..];
                let Some(end) = body.find('\'') else {
                    return Err(error(start, ExpressionErrorKind::UnterminatedLiteral));
                };
                self.pos += end + 2;
                return Ok((start, Token::Literal(&body[..end])));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let len = trimmed
                    .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                    .unwrap_or(trimmed.len());
                self.pos += len;
                return Ok((start, Token::Ident(&trimmed[..len])));
            }
            other => return Err(error(start, ExpressionErrorKind::IllegalCharacter(other))),
        };

        self.pos += 1;
        Ok((start, token))
    }
}

fn error(column: usize, kind: ExpressionErrorKind) -> MalformedExpression {
    MalformedExpression { column, kind }
}

fn unexpected(column: usize, expected: &'static str, found: &Token<'_>) -> MalformedExpression {
    if *found == Token::End {
        return error(column, ExpressionErrorKind::UnbalancedParentheses);
    }
    error(
        column,
        ExpressionErrorKind::Unexpected {
            expected,
            found: found.describe(),
        },
    )
}
