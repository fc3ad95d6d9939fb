use serde::{Deserialize, Serialize};
use std::fmt;

/// Message id of the first message in every dialogue.
pub const STARTING_MESSAGE_ID: i32 = 1;
/// Target of the first message in every dialogue (it answers nothing).
pub const STARTING_TARGET: i32 = 0;

/// Conversation reference carried by every dialogue message.
///
/// The starter picks `starter`; the responder fills in `responder` on its
/// first reply. A message whose `responder` is empty can only open a dialogue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DialogueReference {
    pub starter: String,
    pub responder: String,
}

impl DialogueReference {
    /// Reference for a dialogue that has not been answered yet.
    pub fn incomplete(starter: impl Into<String>) -> Self {
        Self {
            starter: starter.into(),
            responder: String::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.responder.is_empty()
    }
}

/// Performative kind, used for transition checks and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformativeKind {
    Request,
    Response,
}

impl PerformativeKind {
    /// Performatives allowed to follow `self` within one dialogue.
    pub fn valid_replies(self) -> &'static [PerformativeKind] {
        match self {
            Self::Request => &[Self::Response],
            Self::Response => &[],
        }
    }

    pub fn is_initial(self) -> bool {
        self == Self::Request
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Response
    }
}

impl fmt::Display for PerformativeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => f.write_str("request"),
            Self::Response => f.write_str("response"),
        }
    }
}

/// Typed payload of an http protocol message.
///
/// `headers` is always an encoded header block, see
/// [`headers_to_string`](super::headers::headers_to_string).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "performative", rename_all = "snake_case")]
pub enum Performative {
    Request {
        method: String,
        url: String,
        version: String,
        headers: String,
        body: Vec<u8>,
    },
    Response {
        version: String,
        status_code: u16,
        status_text: String,
        headers: String,
        body: Vec<u8>,
    },
}

impl Performative {
    pub fn kind(&self) -> PerformativeKind {
        match self {
            Self::Request { .. } => PerformativeKind::Request,
            Self::Response { .. } => PerformativeKind::Response,
        }
    }

    pub fn headers(&self) -> &str {
        match self {
            Self::Request { headers, .. } | Self::Response { headers, .. } => headers,
        }
    }

    pub fn body(&self) -> &[u8] {
        match self {
            Self::Request { body, .. } | Self::Response { body, .. } => body,
        }
    }
}

/// One message of the http dialogue protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpMessage {
    pub message_id: i32,
    pub target: i32,
    pub dialogue_reference: DialogueReference,
    pub sender: String,
    pub to: String,
    #[serde(flatten)]
    pub performative: Performative,
}

impl HttpMessage {
    pub fn kind(&self) -> PerformativeKind {
        self.performative.kind()
    }

    pub fn is_request(&self) -> bool {
        self.kind() == PerformativeKind::Request
    }
}

impl fmt::Display for HttpMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HttpMessage(id={}, target={}, reference=({:?}, {:?}), sender={}, to={}, performative={}",
            self.message_id,
            self.target,
            self.dialogue_reference.starter,
            self.dialogue_reference.responder,
            self.sender,
            self.to,
            self.kind(),
        )?;
        match &self.performative {
            Performative::Request { method, url, .. } => write!(f, ", method={method}, url={url}")?,
            Performative::Response {
                status_code,
                status_text,
                ..
            } => write!(f, ", status_code={status_code}, status_text={status_text:?}")?,
        }
        write!(f, ", body_len={})", self.performative.body().len())
    }
}

/// Unit of hand-off on a bridge mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub to: String,
    pub sender: String,
    pub message: HttpMessage,
}

impl Envelope {
    /// Wrap a message, addressing the envelope the same way as the message.
    pub fn new(message: HttpMessage) -> Self {
        Self {
            to: message.to.clone(),
            sender: message.sender.clone(),
            message,
        }
    }
}

impl From<HttpMessage> for Envelope {
    fn from(message: HttpMessage) -> Self {
        Self::new(message)
    }
}
