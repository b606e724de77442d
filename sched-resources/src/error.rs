// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Typed errors for resource pools and requirement provisioning.
//!
//! Hand-rolled, not `thiserror`-derived.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The requirement node is already provisioning its maximum number of
    /// simultaneous groups.
    ReqLimit,
    /// A resource pool could not satisfy `needed + provided + detached <=
    /// maximum` for one of the group's required resource types.
    PoolExhausted { resource_type: u32 },
    /// No resource type entry exists in this requirement for the type id
    /// requested by a fix call.
    UnknownResourceType { resource_type: u32 },
    /// `fix` was asked for an id this group does not own and the pool could
    /// not produce one (no free entry, no allocation headroom).
    FixFailed { resource_type: u32 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ReqLimit => write!(f, "requirement node at its simultaneous-group maximum"),
            Error::PoolExhausted { resource_type } => {
                write!(f, "resource pool {resource_type} exhausted")
            }
            Error::UnknownResourceType { resource_type } => {
                write!(f, "requirement has no pool for resource type {resource_type}")
            }
            Error::FixFailed { resource_type } => {
                write!(f, "fix failed for resource type {resource_type}")
            }
        }
    }
}

impl std::error::Error for Error {}
