//! Status capsules: protocol bookkeeping wrapped around an optional message.
//!
//! Wire form: `<STATUS>` or `<STATUS> <message-bytes>`.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::message::Message;
use crate::error::CommunicationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Init,
    Content,
    Ack,
    Shutdown,
}

impl Status {
    pub const ALL: [Status; 4] = [Status::Init, Status::Content, Status::Ack, Status::Shutdown];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Init => "INIT",
            Status::Content => "CONTENT",
            Status::Ack => "ACK",
            Status::Shutdown => "SHUTDOWN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capsule {
    status: Status,
    payload: Option<Message>,
}

impl Capsule {
    pub fn new(status: Status, payload: Option<Message>) -> Self {
        Self { status, payload }
    }

    /// Capsule carrying only a status.
    pub fn bare(status: Status) -> Self {
        Self::new(status, None)
    }

    pub fn content(message: Message) -> Self {
        Self::new(Status::Content, Some(message))
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn payload(&self) -> Option<&Message> {
        self.payload.as_ref()
    }

    pub fn into_payload(self) -> Option<Message> {
        self.payload
    }

    /// Parses a capsule. A malformed payload yields a parse error carrying the
    /// payload bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, CommunicationError> {
        let status = Status::ALL
            .into_iter()
            .find(|s| raw.starts_with(s.as_str().as_bytes()))
            .ok_or_else(|| {
                CommunicationError::parse(
                    "Protocol capsule is missing a status code.",
                    Bytes::copy_from_slice(raw),
                )
            })?;

        let rest = &raw[status.as_str().len()..];
        let payload = match rest.split_first() {
            None => None,
            Some((&b' ', body)) if body.is_empty() => None,
            Some((&b' ', body)) => Some(Message::parse(body)?),
            Some(_) => {
                return Err(CommunicationError::parse(
                    "Invalid separator. Only space separators allowed.",
                    Bytes::copy_from_slice(raw),
                ));
            }
        };

        Ok(Self { status, payload })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_slice(self.status.as_str().as_bytes());
        if let Some(payload) = &self.payload {
            out.put_u8(b' ');
            out.put_slice(&payload.to_bytes());
        }
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::message::Operation;

    #[test]
    fn serializes_status_and_payload() {
        let capsule = Capsule::content(Message::new(Operation::Select, "test123"));
        assert_eq!(capsule.to_bytes().as_ref(), b"CONTENT SELECT CONTENT test123");
        assert_eq!(Capsule::bare(Status::Content).to_bytes().as_ref(), b"CONTENT");
    }

    #[test]
    fn parses_bare_status() {
        let capsule = Capsule::parse(b"ACK").unwrap();
        assert_eq!(capsule.status(), Status::Ack);
        assert!(capsule.payload().is_none());

        let capsule = Capsule::parse(b"SHUTDOWN ").unwrap();
        assert_eq!(capsule.status(), Status::Shutdown);
        assert!(capsule.payload().is_none());
    }

    #[test]
    fn parses_wrapped_message() {
        let capsule = Capsule::parse(b"INIT INIT CONTENT USER").unwrap();
        assert_eq!(capsule.status(), Status::Init);
        let payload = capsule.payload().unwrap();
        assert_eq!(payload.operation(), Operation::Init);
        assert_eq!(payload.content().as_ref(), b"USER");
    }

    #[test]
    fn rejects_missing_status() {
        let err = Capsule::parse(b"SELECT CONTENT x").unwrap_err();
        assert!(err.is_parse());
        assert!(Capsule::parse(b"").is_err());
    }

    #[test]
    fn rejects_glued_status() {
        assert!(Capsule::parse(b"CONTENTSELECT CONTENT x").is_err());
        assert!(Capsule::parse(b"CONTENT#SELECT CONTENT x").is_err());
    }

    #[test]
    fn malformed_payload_reports_payload_bytes() {
        let err = Capsule::parse(b"CONTENT #SELECT CONTENT x").unwrap_err();
        assert_eq!(err.invalid_message().unwrap().as_ref(), b"#SELECT CONTENT x");
    }
}
