//! Dialogue bookkeeping for the http protocol.
//!
//! A dialogue is one request/response exchange between two addresses. The
//! side that sends the request plays [`Role::Client`], the side that answers
//! plays [`Role::Server`]. Every message is attributed to a dialogue through
//! its addressing triple (self address, counterparty address, conversation
//! reference), which yields a stable [`CorrelationKey`].

use super::message::{
    DialogueReference, HttpMessage, Performative, PerformativeKind, STARTING_MESSAGE_ID,
    STARTING_TARGET,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Fallback cap on retained dialogues when a zero limit is configured.
pub const MAX_OPEN_DIALOGUES_DEFAULT: usize = 10_000;

/// Role played by the owner of a [`Dialogues`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Starts dialogues with a request and waits for the response.
    Client,
    /// Accepts dialogues opened by a counterparty and answers them.
    Server,
}

/// Stable identifier binding a reply to its originating request.
///
/// Derived from the incomplete dialogue label, so both the request and any
/// candidate reply compute the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    fn from_parts(starter_reference: &str, opponent: &str, starter: &str) -> Self {
        Self(format!("{starter_reference}_{opponent}_{starter}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Reasons a message cannot be attributed to a dialogue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DialogueError {
    #[error("message is addressed to `{to}`, expected `{expected}`")]
    WrongRecipient { to: String, expected: String },
    #[error("message must not be sent by its own recipient `{sender}`")]
    SelfAddressed { sender: String },
    #[error("dialogue reference has an empty starter reference")]
    MalformedReference,
    #[error("a {role:?} cannot accept a dialogue opened by its counterparty")]
    RoleMismatch { role: Role },
    #[error("performative `{performative}` cannot open a dialogue")]
    InvalidInitialPerformative { performative: PerformativeKind },
    #[error("dialogue `{key}` already exists")]
    DuplicateDialogue { key: CorrelationKey },
    #[error("dialogue `{key}` has already concluded")]
    AlreadyConcluded { key: CorrelationKey },
    #[error("no open dialogue for `{key}`")]
    UnknownDialogue { key: CorrelationKey },
    #[error("illegal transition {from} -> {to} in dialogue `{key}`")]
    InvalidTransition {
        key: CorrelationKey,
        from: PerformativeKind,
        to: PerformativeKind,
    },
    #[error("message id {message_id} targeting {target} is out of sequence in dialogue `{key}` (last message id {last})")]
    OutOfSequence {
        key: CorrelationKey,
        message_id: i32,
        target: i32,
        last: i32,
    },
    #[error("responder reference `{got}` does not match `{expected}` in dialogue `{key}`")]
    ResponderMismatch {
        key: CorrelationKey,
        expected: String,
        got: String,
    },
    #[error("dialogue `{key}` is waiting for the counterparty, nothing to reply to")]
    NotOurTurn { key: CorrelationKey },
    #[error("{max_open} dialogues are already open")]
    CapacityExhausted { max_open: usize },
    #[error("only the opening request of a dialogue can be refused")]
    NotAnOpening,
}

/// State of one open dialogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialogue {
    key: CorrelationKey,
    reference: DialogueReference,
    opponent: String,
    last_message_id: i32,
    last_sender_is_self: bool,
    last_performative: PerformativeKind,
    expired: bool,
}

impl Dialogue {
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    pub fn reference(&self) -> &DialogueReference {
        &self.reference
    }

    pub fn opponent(&self) -> &str {
        &self.opponent
    }

    pub fn last_performative(&self) -> PerformativeKind {
        self.last_performative
    }

    /// Whether the owner gave up waiting on this dialogue.
    pub fn is_expired(&self) -> bool {
        self.expired
    }
}

/// Attributes internal messages to the exchange they belong to.
pub trait Correlator {
    /// Resolve an incoming message to its correlation key, or `None` when the
    /// message cannot be attributed (protocol violation, malformed reference,
    /// role mismatch). Callers log and drop on `None`.
    fn resolve(&mut self, message: &HttpMessage) -> Option<CorrelationKey>;
}

/// All dialogues maintained on behalf of one address.
///
/// Retention is bounded by `max_open`. A live dialogue is never evicted: once
/// the cap is reached, only dialogues marked with [`Dialogues::expire`] make
/// room (oldest first), and opening another one fails with
/// [`DialogueError::CapacityExhausted`] when none are expired. Concluded keys
/// are remembered in a window of the same size so replays of an answered
/// exchange are rejected.
#[derive(Debug)]
pub struct Dialogues {
    self_address: String,
    role: Role,
    max_open: usize,
    open: HashMap<CorrelationKey, Dialogue>,
    // Expiry order. Entries for dialogues that concluded after expiring are
    // skipped when popped.
    expired_order: VecDeque<CorrelationKey>,
    concluded: HashSet<CorrelationKey>,
    concluded_order: VecDeque<CorrelationKey>,
}

impl Dialogues {
    pub fn new(self_address: impl Into<String>, role: Role) -> Self {
        Self::with_capacity(self_address, role, MAX_OPEN_DIALOGUES_DEFAULT)
    }

    pub fn with_capacity(self_address: impl Into<String>, role: Role, max_open: usize) -> Self {
        let max_open = if max_open == 0 {
            MAX_OPEN_DIALOGUES_DEFAULT
        } else {
            max_open
        };
        Self {
            self_address: self_address.into(),
            role,
            max_open,
            open: HashMap::new(),
            expired_order: VecDeque::new(),
            concluded: HashSet::new(),
            concluded_order: VecDeque::new(),
        }
    }

    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn get(&self, key: &CorrelationKey) -> Option<&Dialogue> {
        self.open.get(key)
    }

    /// Open a dialogue with `counterparty` by sending `performative`.
    ///
    /// Returns the first message of the dialogue and its correlation key.
    pub fn create(
        &mut self,
        counterparty: impl Into<String>,
        performative: Performative,
    ) -> Result<(HttpMessage, CorrelationKey), DialogueError> {
        let counterparty = counterparty.into();
        if self.role != Role::Client {
            return Err(DialogueError::RoleMismatch { role: self.role });
        }
        let kind = performative.kind();
        if !kind.is_initial() {
            return Err(DialogueError::InvalidInitialPerformative { performative: kind });
        }

        let reference = DialogueReference::incomplete(new_reference_nonce());
        let key = CorrelationKey::from_parts(&reference.starter, &counterparty, &self.self_address);
        if self.open.contains_key(&key) {
            return Err(DialogueError::DuplicateDialogue { key });
        }
        self.make_room()?;

        let message = HttpMessage {
            message_id: STARTING_MESSAGE_ID,
            target: STARTING_TARGET,
            dialogue_reference: reference.clone(),
            sender: self.self_address.clone(),
            to: counterparty.clone(),
            performative,
        };

        self.insert_open(Dialogue {
            key: key.clone(),
            reference,
            opponent: counterparty,
            last_message_id: STARTING_MESSAGE_ID,
            last_sender_is_self: true,
            last_performative: kind,
            expired: false,
        });

        Ok((message, key))
    }

    /// Attribute an incoming message to a dialogue and record it.
    ///
    /// A dialogue that reaches a terminal performative is concluded and
    /// removed; its key stays in the concluded window.
    pub fn update(&mut self, message: &HttpMessage) -> Result<CorrelationKey, DialogueError> {
        if message.to != self.self_address {
            return Err(DialogueError::WrongRecipient {
                to: message.to.clone(),
                expected: self.self_address.clone(),
            });
        }
        if message.sender == self.self_address {
            return Err(DialogueError::SelfAddressed {
                sender: message.sender.clone(),
            });
        }
        if message.dialogue_reference.starter.trim().is_empty() {
            return Err(DialogueError::MalformedReference);
        }

        let starter = match self.role {
            Role::Client => self.self_address.as_str(),
            Role::Server => message.sender.as_str(),
        };
        let key = CorrelationKey::from_parts(
            &message.dialogue_reference.starter,
            &message.sender,
            starter,
        );

        let is_opening = message.message_id == STARTING_MESSAGE_ID
            && message.target == STARTING_TARGET
            && !message.dialogue_reference.is_complete();

        if is_opening {
            self.accept_opening(message, key)
        } else {
            self.advance(message, key)
        }
    }

    /// Answer the last message of dialogue `key` with `performative`.
    pub fn reply(
        &mut self,
        key: &CorrelationKey,
        performative: Performative,
    ) -> Result<HttpMessage, DialogueError> {
        let Some(dialogue) = self.open.get_mut(key) else {
            return Err(self.missing(key));
        };
        if dialogue.last_sender_is_self {
            return Err(DialogueError::NotOurTurn { key: key.clone() });
        }
        let kind = performative.kind();
        if !dialogue.last_performative.valid_replies().contains(&kind) {
            return Err(DialogueError::InvalidTransition {
                key: key.clone(),
                from: dialogue.last_performative,
                to: kind,
            });
        }

        let message = HttpMessage {
            message_id: dialogue.last_message_id + 1,
            target: dialogue.last_message_id,
            dialogue_reference: dialogue.reference.clone(),
            sender: self.self_address.clone(),
            to: dialogue.opponent.clone(),
            performative,
        };
        dialogue.last_message_id = message.message_id;
        dialogue.last_sender_is_self = true;
        dialogue.last_performative = kind;

        if kind.is_terminal() {
            self.conclude(key);
        }
        Ok(message)
    }

    fn accept_opening(
        &mut self,
        message: &HttpMessage,
        key: CorrelationKey,
    ) -> Result<CorrelationKey, DialogueError> {
        if self.role != Role::Server {
            return Err(DialogueError::RoleMismatch { role: self.role });
        }
        let kind = message.kind();
        if !kind.is_initial() {
            return Err(DialogueError::InvalidInitialPerformative { performative: kind });
        }
        if self.open.contains_key(&key) {
            return Err(DialogueError::DuplicateDialogue { key });
        }
        if self.concluded.contains(&key) {
            return Err(DialogueError::AlreadyConcluded { key });
        }
        self.make_room()?;

        let reference = DialogueReference {
            starter: message.dialogue_reference.starter.clone(),
            responder: new_reference_nonce(),
        };
        self.insert_open(Dialogue {
            key: key.clone(),
            reference,
            opponent: message.sender.clone(),
            last_message_id: message.message_id,
            last_sender_is_self: false,
            last_performative: kind,
            expired: false,
        });
        Ok(key)
    }

    fn advance(
        &mut self,
        message: &HttpMessage,
        key: CorrelationKey,
    ) -> Result<CorrelationKey, DialogueError> {
        let Some(dialogue) = self.open.get_mut(&key) else {
            return Err(self.missing(&key));
        };

        let kind = message.kind();
        if !dialogue.last_performative.valid_replies().contains(&kind) {
            return Err(DialogueError::InvalidTransition {
                key,
                from: dialogue.last_performative,
                to: kind,
            });
        }
        if !dialogue.last_sender_is_self
            || message.target != dialogue.last_message_id
            || message.message_id != dialogue.last_message_id + 1
        {
            return Err(DialogueError::OutOfSequence {
                key,
                message_id: message.message_id,
                target: message.target,
                last: dialogue.last_message_id,
            });
        }

        let got = &message.dialogue_reference.responder;
        if got.is_empty() || (dialogue.reference.is_complete() && *got != dialogue.reference.responder) {
            return Err(DialogueError::ResponderMismatch {
                key,
                expected: dialogue.reference.responder.clone(),
                got: got.clone(),
            });
        }

        dialogue.reference.responder.clone_from(got);
        dialogue.last_message_id = message.message_id;
        dialogue.last_sender_is_self = false;
        dialogue.last_performative = kind;

        if kind.is_terminal() {
            self.conclude(&key);
        }
        Ok(key)
    }

    fn missing(&self, key: &CorrelationKey) -> DialogueError {
        if self.concluded.contains(key) {
            DialogueError::AlreadyConcluded { key: key.clone() }
        } else {
            DialogueError::UnknownDialogue { key: key.clone() }
        }
    }

    /// Mark an open dialogue as abandoned by its owner.
    ///
    /// The dialogue stays open, so a late message is still attributed to it,
    /// but it becomes the first candidate for eviction once the cap is
    /// reached. Returns `false` when `key` is not open.
    pub fn expire(&mut self, key: &CorrelationKey) -> bool {
        let Some(dialogue) = self.open.get_mut(key) else {
            return false;
        };
        if !dialogue.expired {
            dialogue.expired = true;
            self.expired_order.push_back(key.clone());
            self.compact_expired_order();
        }
        true
    }

    /// Expire every open dialogue. Returns how many were newly expired.
    pub fn expire_all(&mut self) -> usize {
        let mut newly = 0;
        for (key, dialogue) in &mut self.open {
            if !dialogue.expired {
                dialogue.expired = true;
                self.expired_order.push_back(key.clone());
                newly += 1;
            }
        }
        self.compact_expired_order();
        newly
    }

    /// Answer an opening request without admitting its dialogue.
    ///
    /// Used to refuse work when the registry is full: the reply is well formed
    /// for the counterparty, which concludes its side of the dialogue on it.
    pub fn refuse(
        &self,
        request: &HttpMessage,
        performative: Performative,
    ) -> Result<HttpMessage, DialogueError> {
        if self.role != Role::Server {
            return Err(DialogueError::RoleMismatch { role: self.role });
        }
        let opening = request.message_id == STARTING_MESSAGE_ID
            && request.target == STARTING_TARGET
            && !request.dialogue_reference.is_complete()
            && request.kind().is_initial();
        if !opening {
            return Err(DialogueError::NotAnOpening);
        }
        let kind = performative.kind();
        if !request.kind().valid_replies().contains(&kind) {
            return Err(DialogueError::InvalidInitialPerformative { performative: kind });
        }

        Ok(HttpMessage {
            message_id: request.message_id + 1,
            target: request.message_id,
            dialogue_reference: DialogueReference {
                starter: request.dialogue_reference.starter.clone(),
                responder: new_reference_nonce(),
            },
            sender: self.self_address.clone(),
            to: request.sender.clone(),
            performative,
        })
    }

    fn make_room(&mut self) -> Result<(), DialogueError> {
        while self.open.len() >= self.max_open {
            let Some(oldest) = self.expired_order.pop_front() else {
                return Err(DialogueError::CapacityExhausted {
                    max_open: self.max_open,
                });
            };
            if self.open.get(&oldest).is_some_and(|dialogue| dialogue.expired) {
                self.open.remove(&oldest);
                tracing::debug!("Evicting expired dialogue {oldest}");
            }
        }
        Ok(())
    }

    fn compact_expired_order(&mut self) {
        if self.expired_order.len() > self.max_open.saturating_mul(2) {
            let open = &self.open;
            self.expired_order
                .retain(|key| open.get(key).is_some_and(|dialogue| dialogue.expired));
        }
    }

    fn insert_open(&mut self, dialogue: Dialogue) {
        self.open.insert(dialogue.key.clone(), dialogue);
    }

    fn conclude(&mut self, key: &CorrelationKey) {
        if self.open.remove(key).is_none() {
            return;
        }

        if self.concluded.len() >= self.max_open {
            if let Some(oldest) = self.concluded_order.pop_front() {
                self.concluded.remove(&oldest);
            }
        }
        self.concluded.insert(key.clone());
        self.concluded_order.push_back(key.clone());
    }
}

impl Correlator for Dialogues {
    fn resolve(&mut self, message: &HttpMessage) -> Option<CorrelationKey> {
        match self.update(message) {
            Ok(key) => Some(key),
            Err(error) => {
                tracing::debug!("Cannot correlate {message}: {error}");
                None
            }
        }
    }
}

fn new_reference_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BRIDGE: &str = "clawbridge/http_server:0.1.0";
    const SKILL: &str = "skill/pets:0.1.0";

    fn request() -> Performative {
        Performative::Request {
            method: "get".into(),
            url: "http://localhost/pets".into(),
            version: String::new(),
            headers: "\n".into(),
            body: Vec::new(),
        }
    }

    fn response(status_code: u16) -> Performative {
        Performative::Response {
            version: String::new(),
            status_code,
            status_text: "Success".into(),
            headers: "\n".into(),
            body: b"Response body".to_vec(),
        }
    }

    fn pair() -> (Dialogues, Dialogues) {
        (
            Dialogues::new(BRIDGE, Role::Client),
            Dialogues::new(SKILL, Role::Server),
        )
    }

    #[test]
    fn request_and_reply_resolve_to_the_same_key() {
        let (mut bridge, mut skill) = pair();
        let (request, bridge_key) = bridge.create(SKILL, request()).expect("create dialogue");

        let skill_key = skill.update(&request).expect("skill accepts request");
        let reply = skill.reply(&skill_key, response(200)).expect("skill replies");
        assert_eq!(reply.target, request.message_id);
        assert!(reply.dialogue_reference.is_complete());

        let resolved = bridge.resolve(&reply).expect("reply correlates");
        assert_eq!(resolved, bridge_key);
        assert_eq!(bridge.open_count(), 0);
        assert_eq!(skill.open_count(), 0);
    }

    #[test]
    fn second_reply_to_answered_exchange_fails() {
        let (mut bridge, mut skill) = pair();
        let (request, _) = bridge.create(SKILL, request()).unwrap();
        let key = skill.update(&request).unwrap();
        let reply = skill.reply(&key, response(200)).unwrap();

        assert!(bridge.update(&reply).is_ok());
        let error = bridge.update(&reply).expect_err("replay must fail");
        assert!(matches!(error, DialogueError::AlreadyConcluded { .. }));
    }

    #[test]
    fn duplicate_request_is_rejected_while_open_and_after_conclusion() {
        let (mut bridge, mut skill) = pair();
        let (request, _) = bridge.create(SKILL, request()).unwrap();

        let key = skill.update(&request).unwrap();
        assert!(matches!(
            skill.update(&request),
            Err(DialogueError::DuplicateDialogue { .. })
        ));

        skill.reply(&key, response(200)).unwrap();
        assert!(matches!(
            skill.update(&request),
            Err(DialogueError::AlreadyConcluded { .. })
        ));
    }

    #[test]
    fn request_cannot_follow_request() {
        let (mut bridge, mut skill) = pair();
        let (request, _) = bridge.create(SKILL, request()).unwrap();
        let key = skill.update(&request).unwrap();

        let mut bogus = skill.reply(&key, response(200)).unwrap();
        bogus.performative = self::request();
        assert!(matches!(
            bridge.update(&bogus),
            Err(DialogueError::InvalidTransition {
                from: PerformativeKind::Request,
                to: PerformativeKind::Request,
                ..
            })
        ));
        assert!(bridge.resolve(&bogus).is_none());
    }

    #[test]
    fn reply_with_wrong_target_is_out_of_sequence() {
        let (mut bridge, mut skill) = pair();
        let (request, _) = bridge.create(SKILL, request()).unwrap();
        let key = skill.update(&request).unwrap();
        let mut reply = skill.reply(&key, response(200)).unwrap();
        reply.target = 7;

        assert!(matches!(
            bridge.update(&reply),
            Err(DialogueError::OutOfSequence { .. })
        ));
    }

    #[test]
    fn messages_for_someone_else_are_rejected() {
        let (mut bridge, _) = pair();
        let (mut request, _) = bridge.create(SKILL, request()).unwrap();
        request.to = "someone/else:0.1.0".into();
        let mut skill = Dialogues::new(SKILL, Role::Server);
        assert!(matches!(
            skill.update(&request),
            Err(DialogueError::WrongRecipient { .. })
        ));
    }

    #[test]
    fn roles_are_fixed_at_construction() {
        let mut skill = Dialogues::new(SKILL, Role::Server);
        assert!(matches!(
            skill.create(BRIDGE, request()),
            Err(DialogueError::RoleMismatch { role: Role::Server })
        ));

        let (mut bridge, _) = pair();
        let (request, _) = bridge.create(SKILL, request()).unwrap();
        let mut other_client = Dialogues::new(SKILL, Role::Client);
        assert!(matches!(
            other_client.update(&request),
            Err(DialogueError::RoleMismatch { role: Role::Client })
        ));
    }

    #[test]
    fn empty_starter_reference_is_malformed() {
        let (mut bridge, _) = pair();
        let (mut request, _) = bridge.create(SKILL, request()).unwrap();
        request.dialogue_reference.starter = String::new();
        let mut skill = Dialogues::new(SKILL, Role::Server);
        assert_eq!(skill.update(&request), Err(DialogueError::MalformedReference));
    }

    #[test]
    fn server_cannot_reply_twice() {
        let (mut bridge, mut skill) = pair();
        let (request, _) = bridge.create(SKILL, request()).unwrap();
        let key = skill.update(&request).unwrap();
        skill.reply(&key, response(200)).unwrap();
        assert!(matches!(
            skill.reply(&key, response(500)),
            Err(DialogueError::AlreadyConcluded { .. })
        ));
    }

    #[test]
    fn live_dialogues_are_never_evicted() {
        let mut bridge = Dialogues::with_capacity(BRIDGE, Role::Client, 2);
        let (_, first) = bridge.create(SKILL, request()).unwrap();
        bridge.create(SKILL, request()).unwrap();

        assert_eq!(
            bridge.create(SKILL, request()).unwrap_err(),
            DialogueError::CapacityExhausted { max_open: 2 }
        );
        assert_eq!(bridge.open_count(), 2);
        assert!(bridge.get(&first).is_some());
    }

    #[test]
    fn expired_dialogues_make_room_oldest_first() {
        let mut bridge = Dialogues::with_capacity(BRIDGE, Role::Client, 2);
        let (_, first) = bridge.create(SKILL, request()).unwrap();
        let (_, second) = bridge.create(SKILL, request()).unwrap();
        assert!(bridge.expire(&second));
        assert!(bridge.expire(&first));

        let (_, third) = bridge.create(SKILL, request()).unwrap();
        assert!(bridge.get(&second).is_none());
        assert!(bridge.get(&first).is_some_and(Dialogue::is_expired));
        assert!(bridge.get(&third).is_some_and(|dialogue| !dialogue.is_expired()));
    }

    #[test]
    fn expired_dialogue_still_correlates_a_late_reply() {
        let mut bridge = Dialogues::with_capacity(BRIDGE, Role::Client, 1);
        let mut skill = Dialogues::new(SKILL, Role::Server);
        let (request, key) = bridge.create(SKILL, request()).unwrap();
        let skill_key = skill.update(&request).unwrap();
        assert!(bridge.expire(&key));

        let reply = skill.reply(&skill_key, response(200)).unwrap();
        assert_eq!(bridge.update(&reply).unwrap(), key);
        assert_eq!(bridge.open_count(), 0);
        assert!(!bridge.expire(&key));
    }

    #[test]
    fn concluded_after_expiry_is_skipped_on_eviction() {
        let mut bridge = Dialogues::with_capacity(BRIDGE, Role::Client, 1);
        let mut skill = Dialogues::new(SKILL, Role::Server);
        let (opening, key) = bridge.create(SKILL, request()).unwrap();
        let skill_key = skill.update(&opening).unwrap();
        bridge.expire(&key);
        bridge.update(&skill.reply(&skill_key, response(200)).unwrap()).unwrap();

        // The stale expiry entry must not cost the next dialogue its slot.
        let (_, next) = bridge.create(SKILL, request()).unwrap();
        assert!(bridge.get(&next).is_some());
        assert_eq!(
            bridge.create(SKILL, request()).unwrap_err(),
            DialogueError::CapacityExhausted { max_open: 1 }
        );
    }

    #[test]
    fn full_server_refuses_with_a_well_formed_reply() {
        let mut bridge = Dialogues::new(BRIDGE, Role::Client);
        let mut skill = Dialogues::with_capacity(SKILL, Role::Server, 1);
        let (first, _) = bridge.create(SKILL, request()).unwrap();
        let (second, second_key) = bridge.create(SKILL, request()).unwrap();
        skill.update(&first).unwrap();

        assert_eq!(
            skill.update(&second).unwrap_err(),
            DialogueError::CapacityExhausted { max_open: 1 }
        );
        let refusal = skill.refuse(&second, response(600)).unwrap();
        assert_eq!(bridge.update(&refusal).unwrap(), second_key);
        assert_eq!(
            skill.refuse(&refusal, response(600)).unwrap_err(),
            DialogueError::NotAnOpening
        );
    }
}
