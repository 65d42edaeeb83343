//! Plain-text request/response messages.
//!
//! Wire form: `<OPERATION> [<PARAM> [<value>]]* CONTENT [<content>]`, tokens
//! separated by single spaces, `CONTENT` last and mandatory.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CommunicationError;

/// Message intent. Names are matched case-sensitively on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Init,
    Select,
    Forward,
    Fetch,
    Exit,
    Shutdown,
    Invalid,
    Success,
}

impl Operation {
    /// Order in which the parser tries operation names.
    pub const ALL: [Operation; 8] = [
        Operation::Init,
        Operation::Select,
        Operation::Forward,
        Operation::Fetch,
        Operation::Exit,
        Operation::Shutdown,
        Operation::Invalid,
        Operation::Success,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Init => "INIT",
            Operation::Select => "SELECT",
            Operation::Forward => "FORWARD",
            Operation::Fetch => "FETCH",
            Operation::Exit => "EXIT",
            Operation::Shutdown => "SHUTDOWN",
            Operation::Invalid => "INVALID",
            Operation::Success => "SUCCESS",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameter key. `Content` sorts last so it is always serialized last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Parameter {
    Info,
    Content,
}

impl Parameter {
    pub const ALL: [Parameter; 2] = [Parameter::Content, Parameter::Info];

    pub fn as_str(&self) -> &'static str {
        match self {
            Parameter::Content => "CONTENT",
            Parameter::Info => "INFO",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation plus its parameters. `CONTENT` is always present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    operation: Operation,
    parameters: BTreeMap<Parameter, Bytes>,
}

impl Message {
    pub fn new(operation: Operation, content: impl Into<Bytes>) -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert(Parameter::Content, content.into());
        Self {
            operation,
            parameters,
        }
    }

    /// Message with empty content.
    pub fn empty(operation: Operation) -> Self {
        Self::new(operation, Bytes::new())
    }

    /// Builds a message from an explicit parameter map, defaulting `CONTENT` to empty.
    pub fn from_parameters(operation: Operation, mut parameters: BTreeMap<Parameter, Bytes>) -> Self {
        parameters.entry(Parameter::Content).or_default();
        Self {
            operation,
            parameters,
        }
    }

    pub fn with_parameter(mut self, parameter: Parameter, value: impl Into<Bytes>) -> Self {
        self.parameters.insert(parameter, value.into());
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn parameters(&self) -> &BTreeMap<Parameter, Bytes> {
        &self.parameters
    }

    pub fn parameter(&self, parameter: Parameter) -> Option<&Bytes> {
        self.parameters.get(&parameter)
    }

    pub fn content(&self) -> &Bytes {
        static EMPTY: Bytes = Bytes::from_static(b"");
        self.parameters.get(&Parameter::Content).unwrap_or(&EMPTY)
    }

    /// Content as text, replacing invalid UTF-8.
    pub fn content_lossy(&self) -> String {
        String::from_utf8_lossy(self.content()).into_owned()
    }

    /// Parses one message from a frame.
    pub fn parse(raw: &[u8]) -> Result<Self, CommunicationError> {
        let fail = |reason: String| CommunicationError::parse(reason, Bytes::copy_from_slice(raw));

        if raw.is_empty() {
            return Err(fail("Cannot parse empty message.".to_string()));
        }

        let operation = Operation::ALL
            .into_iter()
            .find(|op| raw.starts_with(op.as_str().as_bytes()))
            .ok_or_else(|| fail("No operation specified.".to_string()))?;

        let start = operation.as_str().len() + 1;
        let mut parameters = BTreeMap::new();
        let mut previous: Option<(usize, Parameter)> = None;

        for i in start..raw.len() {
            for parameter in Parameter::ALL {
                let name = parameter.as_str().as_bytes();
                if !raw[i..].starts_with(name) {
                    continue;
                }

                let end = i + name.len();
                if raw[i - 1] != b' ' || (end < raw.len() && raw[end] != b' ') {
                    return Err(fail(
                        "Invalid separator(s). Only space separators allowed.".to_string(),
                    ));
                }

                if let Some((at, prev)) = previous {
                    parameters.insert(prev, value_between(raw, at + prev.as_str().len() + 1, i - 1));
                }
                previous = Some((i, parameter));
            }
        }

        let Some((at, last)) = previous else {
            return Err(fail(format!(
                "No parameters specified. There needs to be at least a {} parameter.",
                Parameter::Content
            )));
        };
        if last != Parameter::Content {
            return Err(fail(format!(
                "Last parameter must be {}. It was {last}",
                Parameter::Content
            )));
        }
        parameters.insert(last, value_between(raw, at + last.as_str().len() + 1, raw.len()));

        Ok(Self {
            operation,
            parameters,
        })
    }

    /// Serializes the message. Non-`CONTENT` parameters come first, `CONTENT` last.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_slice(self.operation.as_str().as_bytes());
        for (parameter, value) in &self.parameters {
            out.put_u8(b' ');
            out.put_slice(parameter.as_str().as_bytes());
            if !value.is_empty() {
                out.put_u8(b' ');
                out.put_slice(value);
            }
        }
        out.freeze()
    }
}

fn value_between(raw: &[u8], start: usize, end: usize) -> Bytes {
    if start >= end {
        Bytes::new()
    } else {
        Bytes::copy_from_slice(&raw[start..end])
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Message, CommunicationError> {
        Message::parse(raw.as_bytes())
    }

    #[test]
    fn serializes_content_only() {
        let msg = Message::new(Operation::Select, "test123");
        assert_eq!(msg.to_bytes().as_ref(), b"SELECT CONTENT test123");
    }

    #[test]
    fn serializes_info_before_content() {
        let msg = Message::new(Operation::Select, "test123").with_parameter(Parameter::Info, "TEST123");
        assert_eq!(msg.to_bytes().as_ref(), b"SELECT INFO TEST123 CONTENT test123");

        let msg = Message::new(Operation::Select, "test123").with_parameter(Parameter::Info, "");
        assert_eq!(msg.to_bytes().as_ref(), b"SELECT INFO CONTENT test123");
    }

    #[test]
    fn empty_content_has_no_trailing_space() {
        assert_eq!(Message::empty(Operation::Select).to_bytes().as_ref(), b"SELECT CONTENT");
    }

    #[test]
    fn parses_operation_and_content() {
        let msg = parse("FORWARD CONTENT hello world").unwrap();
        assert_eq!(msg.operation(), Operation::Forward);
        assert_eq!(msg.content().as_ref(), b"hello world");
        assert_eq!(msg.parameters().len(), 1);
    }

    #[test]
    fn parses_info_and_empty_values() {
        let msg = parse("SELECT INFO CONTENT").unwrap();
        assert_eq!(msg.parameter(Parameter::Info).unwrap().as_ref(), b"");
        assert!(msg.content().is_empty());

        let msg = parse("SUCCESS INFO meta data CONTENT x").unwrap();
        assert_eq!(msg.parameter(Parameter::Info).unwrap().as_ref(), b"meta data");
        assert_eq!(msg.content().as_ref(), b"x");
    }

    #[test]
    fn content_may_carry_arbitrary_bytes() {
        let mut raw = b"FORWARD CONTENT ".to_vec();
        raw.extend_from_slice(&[0x00, 0xff, 0x41, 0x0a]);
        let msg = Message::parse(&raw).unwrap();
        assert_eq!(msg.content().as_ref(), &[0x00, 0xff, 0x41, 0x0a]);
    }

    #[test]
    fn rejects_missing_operation() {
        let err = parse("#SELECT CONTENT x").unwrap_err();
        assert_eq!(err.invalid_message().unwrap().as_ref(), b"#SELECT CONTENT x");
        assert!(err.to_string().contains("No operation specified."));
    }

    #[test]
    fn rejects_empty_input() {
        assert!(Message::parse(b"").unwrap_err().is_parse());
    }

    #[test]
    fn rejects_missing_parameters() {
        assert!(parse("SELECT").is_err());
        assert!(parse("SELECT hello").is_err());
    }

    #[test]
    fn rejects_content_not_last() {
        let err = parse("SELECT CONTENT abc INFO def").unwrap_err();
        assert!(err.to_string().contains("Last parameter must be CONTENT"));
    }

    #[test]
    fn rejects_token_glued_to_neighbour() {
        assert!(parse("SELECT CONTENTx").is_err());
        assert!(parse("SELECT xCONTENT").is_err());
        assert!(parse("SELECT CONTENT aINFO").is_err());
    }

    #[test]
    fn case_sensitive_operation() {
        assert!(parse("select CONTENT x").is_err());
    }

    #[test]
    fn round_trip_keeps_every_parameter() {
        let cases = [
            Message::empty(Operation::Shutdown),
            Message::new(Operation::Fetch, ""),
            Message::new(Operation::Fetch, "payload").with_parameter(Parameter::Info, "meta"),
            Message::new(Operation::Exit, "").with_parameter(Parameter::Info, ""),
            Message::new(Operation::Forward, "grüße, 世界 ✓"),
            Message::new(Operation::Success, Bytes::from_static(&[0x00, 0xff, b' ', 0x80, 0x0a, 0x7f])),
        ];
        for msg in cases {
            let back = Message::parse(&msg.to_bytes()).unwrap();
            assert_eq!(back, msg, "round trip of {msg}");
        }
    }
}
