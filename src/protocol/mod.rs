pub mod dialogue;
pub mod headers;
pub mod message;

pub use dialogue::{
    CorrelationKey, Correlator, Dialogue, DialogueError, Dialogues, Role,
    MAX_OPEN_DIALOGUES_DEFAULT,
};
pub use headers::{header_value, headers_to_string, parse_header_block};
pub use message::{DialogueReference, Envelope, HttpMessage, Performative, PerformativeKind};
