// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Requirement trees: the per-group-type provisioning policy that ties a set
//! of [`Pool`]s together.
//!
//! A requirement owns a tree of nodes. Each node combines two children with
//! an operator, carries per-resource-type min/max arrays, and caps how many
//! groups may be simultaneously provisioned from it. The tree is read-mostly
//! (provisioning walks it top to bottom); mutation is serialized by a single
//! lightly-contended `ReqNodeLock`-ranked mutex per requirement.

use crate::entry::GroupKey;
use crate::error::Error;
use crate::pool::{FixRequest, Pool};
use hashbrown::HashMap;
use sched_sync::{Rank, RankedMutex};
use std::sync::Arc;

/// How a node's two children are combined when computing effective limits.
///
/// `All` requires both children to admit a group; `Any` requires either one:
/// the conjunctive and disjunctive resource policies a requirement tree can
/// express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    All,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(pub u32);

struct Node {
    combinator: Combinator,
    left: Option<NodeId>,
    right: Option<NodeId>,
    /// Per-resource-type bounds, indexed by the same `resource_type` ids the
    /// requirement's pools are keyed by.
    min: HashMap<u32, u32>,
    /// Per-resource-type ceiling a group may grow into via later `fix`
    /// calls; `Pool::fix` enforces the pool-wide maximum, this is reserved
    /// for a future per-node cap on top of it.
    #[allow(dead_code)]
    max: HashMap<u32, u32>,
    /// Recorded for parity with the node's `max_groups` ceiling; provisioning
    /// enforces the ceiling but does not yet refuse to deprovision below it.
    #[allow(dead_code)]
    min_groups: u32,
    max_groups: u32,
    provisioned_groups: u32,
}

impl Node {
    fn leaf(min_groups: u32, max_groups: u32) -> Self {
        Self {
            combinator: Combinator::All,
            left: None,
            right: None,
            min: HashMap::new(),
            max: HashMap::new(),
            min_groups,
            max_groups,
            provisioned_groups: 0,
        }
    }
}

struct Inner {
    nodes: Vec<Node>,
    root: NodeId,
    provisioned_total: u32,
}

/// Owns the node arena and one refcounted [`Pool`] per resource type that
/// groups provisioned from this requirement may draw on.
pub struct Requirement<R> {
    pools: HashMap<u32, Arc<Pool<R>>>,
    tree: RankedMutex<Inner>,
}

impl<R> Requirement<R> {
    /// Builds a requirement with a single leaf node as its root, capped at
    /// `max_groups` simultaneous provisions.
    pub fn new(max_groups: u32) -> Self {
        let root = Node::leaf(0, max_groups);
        let inner = Inner { nodes: vec![root], root: NodeId(0), provisioned_total: 0 };
        Self { pools: HashMap::new(), tree: RankedMutex::new(Rank::ReqNodeLock, inner) }
    }

    /// Registers (or replaces) the pool backing `resource_type`.
    pub fn add_pool(&mut self, resource_type: u32, pool: Arc<Pool<R>>) {
        self.pools.insert(resource_type, pool);
    }

    pub fn pool(&self, resource_type: u32) -> Option<&Arc<Pool<R>>> {
        self.pools.get(&resource_type)
    }

    /// Adds a child node under `parent`, combined with the existing subtree
    /// (if any) via `combinator`. Returns the new node's id.
    pub fn add_child(
        &self,
        parent: NodeId,
        combinator: Combinator,
        min_groups: u32,
        max_groups: u32,
    ) -> NodeId {
        let mut inner = self.tree.lock();
        let child = Node::leaf(min_groups, max_groups);
        let child_id = NodeId(inner.nodes.len() as u32);
        inner.nodes.push(child);
        let parent_node = &mut inner.nodes[parent.0 as usize];
        parent_node.combinator = combinator;
        if parent_node.left.is_none() {
            parent_node.left = Some(child_id);
        } else {
            parent_node.right = Some(child_id);
        }
        child_id
    }

    pub fn root(&self) -> NodeId {
        self.tree.lock().root
    }

    /// Sets the per-resource-type `[min, max]` bounds on a node.
    pub fn set_bounds(&self, node: NodeId, resource_type: u32, min: u32, max: u32) {
        let mut inner = self.tree.lock();
        let n = &mut inner.nodes[node.0 as usize];
        n.min.insert(resource_type, min);
        n.max.insert(resource_type, max);
    }

    /// Total groups currently provisioned anywhere in this requirement.
    pub fn provisioned_total(&self) -> u32 {
        self.tree.lock().provisioned_total
    }

    /// Checks `node`'s simultaneous-group ceiling, then reserves raw
    /// (unfixed) entries for every resource type the node bounds, rolling
    /// back anything already reserved on first failure.
    ///
    /// On success the node's (and requirement's) provisioned-group counters
    /// are incremented and the reserved entry indices are returned, keyed by
    /// resource type, so the caller can later [`Requirement::fix`] them.
    pub fn provision(
        &self,
        node: NodeId,
        group: GroupKey,
    ) -> Result<HashMap<u32, Vec<usize>>, Error> {
        let result = self.provision_node(node, group)?;
        let mut inner = self.tree.lock();
        inner.provisioned_total += 1;
        Ok(result)
    }

    /// Recursive worker for [`Requirement::provision`]: a leaf node reserves
    /// its own per-resource-type bounds directly; an internal node combines
    /// its children per [`Combinator`] — `All` provisions both (rolling both
    /// back if either fails), `Any` tries the left child and falls back to
    /// the right on failure.
    fn provision_node(&self, node: NodeId, group: GroupKey) -> Result<HashMap<u32, Vec<usize>>, Error> {
        let (combinator, left, right, at_ceiling, wants) = {
            let inner = self.tree.lock();
            let n = &inner.nodes[node.0 as usize];
            (
                n.combinator,
                n.left,
                n.right,
                n.provisioned_groups >= n.max_groups,
                n.min.iter().map(|(&rt, &min)| (rt, min)).collect::<Vec<_>>(),
            )
        };
        if at_ceiling {
            return Err(Error::ReqLimit);
        }

        let mut reserved: HashMap<u32, Vec<usize>> = HashMap::new();
        for (resource_type, count) in wants {
            if count == 0 {
                continue;
            }
            let Some(pool) = self.pools.get(&resource_type) else {
                Self::rollback(&self.pools, &reserved, group);
                return Err(Error::UnknownResourceType { resource_type });
            };
            match pool.reserve(group, count) {
                Ok(indices) => {
                    reserved.insert(resource_type, indices);
                }
                Err(e) => {
                    Self::rollback(&self.pools, &reserved, group);
                    return Err(e);
                }
            }
        }

        match (combinator, left, right) {
            (Combinator::All, Some(l), Some(r)) => {
                let left_reserved = self.provision_node(l, group)?;
                let right_reserved = match self.provision_node(r, group) {
                    Ok(r) => r,
                    Err(e) => {
                        Self::rollback(&self.pools, &left_reserved, group);
                        Self::rollback(&self.pools, &reserved, group);
                        return Err(e);
                    }
                };
                merge(&mut reserved, left_reserved);
                merge(&mut reserved, right_reserved);
            }
            (Combinator::Any, Some(l), maybe_r) => match self.provision_node(l, group) {
                Ok(left_reserved) => merge(&mut reserved, left_reserved),
                Err(_) => {
                    if let Some(r) = maybe_r {
                        merge(&mut reserved, self.provision_node(r, group)?);
                    }
                }
            },
            (_, None, Some(r)) => merge(&mut reserved, self.provision_node(r, group)?),
            (_, None, None) => {}
        }

        let mut inner = self.tree.lock();
        inner.nodes[node.0 as usize].provisioned_groups += 1;
        Ok(reserved)
    }

    /// Releases everything reserved so far in a failed [`Requirement::provision`]
    /// call. `release_group` is idempotent on pools holding nothing for
    /// `group`, so it is safe to call across every pool touched, not just
    /// the ones present in `reserved`.
    fn rollback(pools: &HashMap<u32, Arc<Pool<R>>>, reserved: &HashMap<u32, Vec<usize>>, group: GroupKey) {
        for resource_type in reserved.keys() {
            if let Some(pool) = pools.get(resource_type) {
                pool.release_group(group, None);
            }
        }
    }

    /// De-provisions `group` from `node`, releasing every entry it holds
    /// across all pools back to `reparent_to` (or the pool, if `None`), and
    /// decrementing the node's and requirement's provisioned-group counters.
    pub fn deprovision(&self, node: NodeId, group: GroupKey, reparent_to: Option<GroupKey>) {
        for pool in self.pools.values() {
            pool.release_group(group, reparent_to);
        }
        let mut inner = self.tree.lock();
        let n = &mut inner.nodes[node.0 as usize];
        n.provisioned_groups = n.provisioned_groups.saturating_sub(1);
        inner.provisioned_total = inner.provisioned_total.saturating_sub(1);
    }

    /// Fixes a batch of ids against the pool for `resource_type`, running
    /// `fix_fn` outside any requirement or pool lock.
    pub fn fix(
        &self,
        resource_type: u32,
        group: GroupKey,
        requests: &[FixRequest],
        fix_fn: impl Fn(u64) -> Option<R>,
    ) -> Result<Vec<Option<usize>>, Error> {
        let pool = self
            .pools
            .get(&resource_type)
            .ok_or(Error::UnknownResourceType { resource_type })?;
        pool.fix(group, requests, fix_fn)
    }

    pub fn unfix(&self, resource_type: u32, group: GroupKey, entry_index: usize) -> Option<R> {
        self.pools.get(&resource_type)?.unfix(group, entry_index)
    }
}

fn merge(into: &mut HashMap<u32, Vec<usize>>, from: HashMap<u32, Vec<usize>>) {
    for (resource_type, mut indices) in from {
        into.entry(resource_type).or_default().append(&mut indices);
    }
}
