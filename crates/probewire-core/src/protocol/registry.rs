//! Command registry: the factory table behind every channel.
//!
//! The registry maps stable numeric type ids to command descriptors, issues
//! sequence numbers, and builds requests and correlated responses. It is an
//! explicitly constructed object passed by reference — one per process, or
//! one per test — never hidden static state, so isolated registries can run
//! in parallel.
//!
//! # Determinism
//!
//! Two registries built from the same catalog map every `type_id` to the
//! same kind, across processes and restarts. That is what lets the control
//! process and the target speak the protocol without negotiating it: the
//! built-in catalog uses fixed ids, and [`CommandRegistry::restore`] is a
//! pure table lookup.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicI32, Ordering};

use tracing::debug;

use super::command::{
    self, Command, CommandKind, CommandPayload, DecodeError, PayloadDecodeFn, RESPONSE_NONE,
    SEQUENCE_BOUND,
};

/// Fixed type ids of the built-in catalog.
///
/// These are wire-stable: renumbering breaks every deployed peer.
pub mod type_ids {
    /// [`CommandKind::Instrument`](super::CommandKind::Instrument)
    pub const INSTRUMENT: i32 = 1;
    /// [`CommandKind::Event`](super::CommandKind::Event)
    pub const EVENT: i32 = 2;
    /// [`CommandKind::Message`](super::CommandKind::Message)
    pub const MESSAGE: i32 = 3;
    /// [`CommandKind::Error`](super::CommandKind::Error)
    pub const ERROR: i32 = 4;
    /// [`CommandKind::Exit`](super::CommandKind::Exit)
    pub const EXIT: i32 = 5;
    /// [`CommandKind::Status`](super::CommandKind::Status)
    pub const STATUS: i32 = 6;
    /// [`CommandKind::Response`](super::CommandKind::Response)
    pub const RESPONSE: i32 = 7;
}

/// First type id handed out to descriptors without a fixed id.
const FIRST_DYNAMIC_TYPE_ID: i32 = 64;

/// The role of the process this registry was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The control process driving the target.
    Control,
    /// The instrumented target process.
    Target,
}

/// Which scope(s) a command kind is registered for.
///
/// Registrations whose audience does not include the registry's scope are
/// ignored, so a single catalog function can seed both ends of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Control process only.
    Control,
    /// Target process only.
    Target,
    /// Both ends.
    Both,
}

impl Audience {
    /// Whether this audience includes the given scope.
    #[must_use]
    pub const fn includes(self, scope: Scope) -> bool {
        matches!(
            (self, scope),
            (Self::Both, _) | (Self::Control, Scope::Control) | (Self::Target, Scope::Target)
        )
    }
}

/// Everything the registry needs to know about one command kind.
#[derive(Clone)]
pub struct CommandDescriptor {
    /// The kind this descriptor registers.
    pub kind: CommandKind,
    /// Fixed type id, or `None` to take the next unused dynamic id.
    pub type_id: Option<i32>,
    /// Which scope(s) the kind is registered for.
    pub audience: Audience,
    /// Whether instances expect a correlated response.
    pub needs_response: bool,
    /// Whether instances may be captured into a speculative buffer.
    pub can_be_speculated: bool,
    /// Payload decode function for wire rehydration.
    pub decode: PayloadDecodeFn,
}

#[derive(Clone)]
struct RegisteredKind {
    kind: CommandKind,
    needs_response: bool,
    can_be_speculated: bool,
    decode: PayloadDecodeFn,
}

/// Factory for commands: type-id table plus sequence counter.
pub struct CommandRegistry {
    scope: Scope,
    by_id: HashMap<i32, RegisteredKind>,
    by_kind: HashMap<CommandKind, i32>,
    next_dynamic_id: i32,
    sequence: AtomicI32,
}

impl CommandRegistry {
    /// Creates an empty registry for the given scope.
    #[must_use]
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            by_id: HashMap::new(),
            by_kind: HashMap::new(),
            next_dynamic_id: FIRST_DYNAMIC_TYPE_ID,
            sequence: AtomicI32::new(0),
        }
    }

    /// Creates a registry seeded with the built-in command catalog.
    #[must_use]
    pub fn catalog(scope: Scope) -> Self {
        let mut registry = Self::new(scope);
        for descriptor in builtin_catalog() {
            registry.register(descriptor);
        }
        registry
    }

    /// The scope this registry was built for.
    #[must_use]
    pub const fn scope(&self) -> Scope {
        self.scope
    }

    /// Registers a command kind.
    ///
    /// Returns `false` without registering when the descriptor's audience
    /// does not include this registry's scope, when the kind is already
    /// registered, or when a fixed type id collides with an existing entry.
    pub fn register(&mut self, descriptor: CommandDescriptor) -> bool {
        if !descriptor.audience.includes(self.scope) {
            debug!(kind = %descriptor.kind, scope = ?self.scope, "registration ignored: audience mismatch");
            return false;
        }
        if self.by_kind.contains_key(&descriptor.kind) {
            debug!(kind = %descriptor.kind, "registration ignored: kind already registered");
            return false;
        }
        let type_id = match descriptor.type_id {
            Some(id) => {
                if self.by_id.contains_key(&id) {
                    debug!(kind = %descriptor.kind, type_id = id, "registration ignored: type id in use");
                    return false;
                }
                id
            }
            None => {
                while self.by_id.contains_key(&self.next_dynamic_id) {
                    self.next_dynamic_id += 1;
                }
                let id = self.next_dynamic_id;
                self.next_dynamic_id += 1;
                id
            }
        };
        self.by_id.insert(
            type_id,
            RegisteredKind {
                kind: descriptor.kind,
                needs_response: descriptor.needs_response,
                can_be_speculated: descriptor.can_be_speculated,
                decode: descriptor.decode,
            },
        );
        self.by_kind.insert(descriptor.kind, type_id);
        true
    }

    /// Returns the type id registered for a kind, if any.
    #[must_use]
    pub fn type_id_of(&self, kind: CommandKind) -> Option<i32> {
        self.by_kind.get(&kind).copied()
    }

    /// Allocates the next sequence number, wrapping at [`SEQUENCE_BOUND`].
    fn next_sequence(&self) -> i32 {
        // fetch_update never returns Err with a total closure.
        self.sequence
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some((n + 1) % SEQUENCE_BOUND)
            })
            .unwrap_or(0)
    }

    /// Builds a fresh command carrying `payload`, with a new sequence number
    /// and no reply correlation.
    ///
    /// Returns `None` when the payload's kind is not registered in this
    /// scope — a local configuration error, never a protocol error.
    #[must_use]
    pub fn create(&self, payload: CommandPayload) -> Option<Command> {
        self.build(payload, RESPONSE_NONE)
    }

    /// Builds a response command replying to the command whose `rx` is `tx`.
    #[must_use]
    pub fn create_response(&self, payload: CommandPayload, tx: i32) -> Option<Command> {
        self.build(payload, tx)
    }

    fn build(&self, payload: CommandPayload, tx: i32) -> Option<Command> {
        let type_id = self.type_id_of(payload.kind())?;
        let registered = self.by_id.get(&type_id)?;
        Some(Command::assemble(
            type_id,
            self.next_sequence(),
            tx,
            registered.needs_response,
            registered.can_be_speculated,
            payload,
        ))
    }

    /// Rehydrates a command from its decoded wire header plus payload bytes.
    ///
    /// An unknown `type_id` is a fatal decode error for the channel: the two
    /// ends were built from different catalogs.
    pub fn restore(
        &self,
        type_id: i32,
        rx: i32,
        tx: i32,
        cur: &mut Cursor<&[u8]>,
    ) -> Result<Command, DecodeError> {
        let registered = self
            .by_id
            .get(&type_id)
            .ok_or(DecodeError::UnknownTypeId(type_id))?;
        let payload = (registered.decode)(cur)?;
        Ok(Command::assemble(
            type_id,
            rx,
            tx,
            registered.needs_response,
            registered.can_be_speculated,
            payload,
        ))
    }
}

/// The built-in command catalog with fixed, wire-stable type ids.
fn builtin_catalog() -> Vec<CommandDescriptor> {
    vec![
        CommandDescriptor {
            kind: CommandKind::Instrument,
            type_id: Some(type_ids::INSTRUMENT),
            audience: Audience::Both,
            needs_response: true,
            can_be_speculated: false,
            decode: command::decode_instrument,
        },
        CommandDescriptor {
            kind: CommandKind::Event,
            type_id: Some(type_ids::EVENT),
            audience: Audience::Both,
            needs_response: false,
            can_be_speculated: true,
            decode: command::decode_event,
        },
        CommandDescriptor {
            kind: CommandKind::Message,
            type_id: Some(type_ids::MESSAGE),
            audience: Audience::Both,
            needs_response: false,
            can_be_speculated: true,
            decode: command::decode_message,
        },
        CommandDescriptor {
            kind: CommandKind::Error,
            type_id: Some(type_ids::ERROR),
            audience: Audience::Both,
            needs_response: false,
            can_be_speculated: false,
            decode: command::decode_error,
        },
        CommandDescriptor {
            kind: CommandKind::Exit,
            type_id: Some(type_ids::EXIT),
            audience: Audience::Both,
            needs_response: true,
            can_be_speculated: false,
            decode: command::decode_exit,
        },
        CommandDescriptor {
            kind: CommandKind::Status,
            type_id: Some(type_ids::STATUS),
            audience: Audience::Both,
            needs_response: true,
            can_be_speculated: false,
            decode: command::decode_status,
        },
        CommandDescriptor {
            kind: CommandKind::Response,
            type_id: Some(type_ids::RESPONSE),
            audience: Audience::Both,
            needs_response: false,
            can_be_speculated: false,
            decode: command::decode_response,
        },
    ]
}
