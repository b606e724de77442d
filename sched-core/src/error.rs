// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Observable failure reason codes and the scheduler's own programmer-error
//! type.

use std::fmt;

/// A reason code captured into a group's error slot on cancellation and
/// propagated at `join`: a small enumerated set of reason codes reused
/// from the surrounding interpreter. The exact ~25-member set is out of
/// scope (it belongs to the interpreter this scheduler is carved out of);
/// the handful below are the ones the core itself can originate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    Interrupt,
    Undefined,
    VmError,
    RangeCheck,
    TypeCheck,
    /// A worker callback returned `false`.
    WorkerFailed,
    /// A resource could not be provisioned or fixed.
    ResourceExhausted,
    /// Used when a task is cancelled because it became unwanted.
    /// MUST NOT propagate to the interpreter's current error context, only
    /// to error contexts belonging to recursive interpreters or
    /// non-interpreter threads — callers of `join` decide whether to
    /// surface or swallow it based on which context they hold.
    NotAnError,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Interrupt => f.write_str("interrupt"),
            Reason::Undefined => f.write_str("undefined"),
            Reason::VmError => f.write_str("vmerror"),
            Reason::RangeCheck => f.write_str("rangecheck"),
            Reason::TypeCheck => f.write_str("typecheck"),
            Reason::WorkerFailed => f.write_str("worker returned false"),
            Reason::ResourceExhausted => f.write_str("resource exhausted"),
            Reason::NotAnError => f.write_str("not an error"),
        }
    }
}

/// Work failures: surfaced as a typed error from the scheduler's public
/// API, distinct from the assertion-grade invariant violations that
/// `debug_assert!` catches in debug builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// `create`/`depend` issued against a group already cancelled or closed.
    GroupCancelled(Reason),
    GroupClosed,
    /// `depend`/`replace` violated the predecessor-walk assertion: `post`
    /// must be constructing or depending on the current task.
    InvalidDependency,
    /// A self-dependency was requested.
    SelfDependency,
    /// `join` was called a second time on the same group.
    AlreadyJoined,
    /// Resource provisioning failed; the reason is the pool/requirement
    /// error translated into a scheduler-level reason code.
    Resource(Reason),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::GroupCancelled(reason) => write!(f, "group cancelled: {reason}"),
            SchedError::GroupClosed => f.write_str("group is closed to outside creators"),
            SchedError::InvalidDependency => f.write_str("invalid dependency edge"),
            SchedError::SelfDependency => f.write_str("self-dependency is not allowed"),
            SchedError::AlreadyJoined => f.write_str("group already joined"),
            SchedError::Resource(reason) => write!(f, "resource provisioning failed: {reason}"),
        }
    }
}

impl std::error::Error for SchedError {}
