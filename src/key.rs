//! Canonical identifiers for shared resources.
//!
//! An [`ObjectKey`] is an opaque, equatable, hashable token identifying a
//! shared slot. Two distinct access paths that denote the same underlying
//! slot must produce the same key; two independent slots must produce
//! distinct keys. Equality and hashing are the entire contract — nothing
//! else about an `ObjectKey` is semantically meaningful to the engine.

use serde::{Deserialize, Serialize};

/// A canonicalized subscript or attribute slot inside a container.
///
/// Reconciles the two natural spellings of a subscript (an integer index vs.
/// its string representation) so that code reaching the same slot through
/// different access paths produces the same key, per spec.md §4.3
/// `canonical(k)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SlotKey {
    /// A named attribute or field.
    Name(String),
    /// An integer-indexed subscript (vec/array position).
    Index(u64),
    /// A string-keyed subscript (map key).
    Keyed(String),
    /// The synthetic slot used for whole-container mutator calls
    /// (`push`, `pop`, `insert`, `remove`, `clear`), matching spec.md §4.3's
    /// "Write on the receiver container's key with slot `*`".
    Whole,
}

impl SlotKey {
    /// A named attribute slot, e.g. `obj.x`.
    pub fn name(name: impl Into<String>) -> Self {
        SlotKey::Name(name.into())
    }

    /// An integer-indexed subscript, e.g. `v[3]`.
    pub fn index(i: u64) -> Self {
        SlotKey::Index(i)
    }

    /// A string-keyed subscript, e.g. `m["key"]`.
    pub fn keyed(key: impl Into<String>) -> Self {
        SlotKey::Keyed(key.into())
    }
}

/// A container identity: the `InMemory` variant's first component.
///
/// Backed by a raw `u64` because Rust has no reflective `id(obj)` — callers
/// derive it from `&T as *const T as u64` (see [`crate::observed::Observed`]),
/// which is stable for the lifetime of one execution (ObjectKeys are interned
/// per execution and discarded when it ends, per spec.md §3 "Lifecycles").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub u64);

/// A canonical identifier for a shared resource.
///
/// Equal keys ⇒ potential conflict; distinct keys ⇒ provably independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKey {
    /// A container object (dict, list, instance, class, module-globals) and
    /// a slot inside it.
    InMemory(ContainerId, SlotKey),
    /// A URI-like string synthesised from the external world:
    /// `socket:<host>:<port>`, `file:<absolute-path>`.
    External(String),
    /// A lock or semaphore instance. Used only in sync events, never in
    /// access events.
    Sync(ContainerId),
}

/// Derives a [`ContainerId`] from a live reference's address, stable only for
/// the lifetime of the pointee. Used by [`crate::observed::Observed`] and the
/// `Sched*` primitives in [`crate::scheduler`] since Rust has no `id(obj)`.
pub fn identity<T>(ptr: *const T) -> ContainerId {
    ContainerId(ptr as usize as u64)
}

impl ObjectKey {
    /// Build an in-memory key for a named attribute or global.
    pub fn attr(container: ContainerId, name: impl Into<String>) -> Self {
        ObjectKey::InMemory(container, SlotKey::name(name))
    }

    /// Build an in-memory key for the whole-container mutator slot.
    pub fn whole_container(container: ContainerId) -> Self {
        ObjectKey::InMemory(container, SlotKey::Whole)
    }

    /// Build an external key for a socket resource.
    pub fn socket(host: &str, port: u16) -> Self {
        ObjectKey::External(format!("socket:{host}:{port}"))
    }

    /// Build an external key for a file resource. `path` should be absolute,
    /// matching the wire contract of the I/O bridge.
    pub fn file(path: &str) -> Self {
        ObjectKey::External(format!("file:{path}"))
    }

    /// Build a sync key for a lock instance.
    pub fn lock(container: ContainerId) -> Self {
        ObjectKey::Sync(container)
    }

    /// True if this key denotes an external resource rather than an
    /// in-process slot — used by trace rendering to label bridge-sourced
    /// events distinctly (spec.md §3).
    pub fn is_external(&self) -> bool {
        matches!(self, ObjectKey::External(_))
    }
}
