//! Resource pools and requirement trees for provisioning task groups.

mod entry;
mod error;
mod pool;
mod requirement;

pub use entry::{Entry, EntryState, GroupKey, Owner};
pub use error::Error;
pub use pool::{FixRequest, Pool};
pub use requirement::{Combinator, NodeId, Requirement};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reserve_then_release_round_trip() {
        let pool: Pool<u32> = Pool::new(1, 4, false);
        let g = GroupKey(1);
        let idx = pool.reserve(g, 2).unwrap();
        assert_eq!(idx.len(), 2);
        assert_eq!(pool.provided_count(), 2);
        pool.release_group(g, None);
        assert_eq!(pool.provided_count(), 0);
        assert!(pool.check_invariant());
    }

    #[test]
    fn reserve_exhaustion_rolls_back() {
        let pool: Pool<u32> = Pool::new(1, 2, false);
        let g = GroupKey(1);
        assert!(pool.reserve(g, 3).is_err());
        assert_eq!(pool.provided_count(), 0);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn fix_runs_callback_and_caches_by_id() {
        let pool: Pool<u32> = Pool::new(1, 4, true);
        let g = GroupKey(1);
        let calls = std::sync::atomic::AtomicU32::new(0);
        let requests = [FixRequest { id: 42, optional: false }];
        let results = pool
            .fix(g, &requests, |id| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Some(id as u32)
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        let idx = results[0].unwrap();
        pool.with_entry(idx, |e| assert_eq!(e.resource(), Some(&42)));

        pool.unfix(g, idx);
        let results2 = pool.fix(g, &requests, |_| panic!("should reuse cached resource")).unwrap();
        assert_eq!(results2[0], Some(idx));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn optional_request_can_go_unresolved() {
        let pool: Pool<u32> = Pool::new(1, 1, false);
        let g1 = GroupKey(1);
        let g2 = GroupKey(2);
        pool.reserve(g1, 1).unwrap();

        let requests = [FixRequest { id: 99, optional: true }];
        let results = pool.fix(g2, &requests, |id| Some(id as u32)).unwrap();
        assert_eq!(results, vec![None]);
    }

    #[test]
    fn requirement_provision_respects_group_ceiling() {
        let mut req: Requirement<u32> = Requirement::new(1);
        let pool = Arc::new(Pool::new(7, 4, false));
        req.add_pool(7, pool.clone());
        let root = req.root();
        req.set_bounds(root, 7, 2, 2);

        let g1 = GroupKey(1);
        let reserved = req.provision(root, g1).unwrap();
        assert_eq!(reserved.get(&7).map(Vec::len), Some(2));
        assert_eq!(req.provisioned_total(), 1);

        let g2 = GroupKey(2);
        assert!(matches!(req.provision(root, g2), Err(Error::ReqLimit)));

        req.deprovision(root, g1, None);
        assert_eq!(req.provisioned_total(), 0);
        assert_eq!(pool.provided_count(), 0);
    }

    #[test]
    fn requirement_provision_rolls_back_on_pool_exhaustion() {
        let mut req: Requirement<u32> = Requirement::new(4);
        let small_pool = Arc::new(Pool::new(1, 1, false));
        let big_pool = Arc::new(Pool::new(2, 4, false));
        req.add_pool(1, small_pool.clone());
        req.add_pool(2, big_pool.clone());
        let root = req.root();
        req.set_bounds(root, 1, 2, 2);
        req.set_bounds(root, 2, 1, 1);

        let g = GroupKey(1);
        assert!(req.provision(root, g).is_err());
        assert_eq!(big_pool.provided_count(), 0);
        assert_eq!(small_pool.provided_count(), 0);
    }
}
