//! Collection of unreachable client subscriptions.
//!
//! Subscriptions are reference counted by `direct` and `indirect`, but
//! references between resources may form cycles. When a subscription loses
//! its last direct count, the subgraph reachable from it through indirect
//! subscriptions is marked in two passes:
//!
//! 1. Count down a working copy of `indirect` for each reference found
//!    inside the subgraph.
//! 2. Nodes still referenced from outside, and everything below them, are
//!    kept. The rest is disposed.
//!
//! Subscriptions with direct counts are never entered.
//!
//! Kept subscriptions that were sent, but are no longer reachable from a
//! sent direct subscription, have been dropped by the client. They are
//! marked as unsent so the next response referencing them includes them.

use super::connection::Conn;
use super::subscription::ClientSubscription;
use super::subscription::SubState;
use std::collections::{HashMap, HashSet};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum GcState {
    Stop,
    Root,
    None,
    Delete,
    Keep,
}

struct GcRef {
    indirect: isize,
    state: GcState,
}

fn traverse<F>(subs: &HashMap<String, ClientSubscription>, rid: &str, state: GcState, cb: &mut F)
where
    F: FnMut(&str, &ClientSubscription, GcState) -> GcState,
{
    let Some(sub) = subs.get(rid) else {
        return;
    };
    if sub.direct > 0 {
        return;
    }
    let state = cb(rid, sub, state);
    if state == GcState::Stop {
        return;
    }
    for child in sub.refs.keys() {
        traverse(subs, child, state, cb);
    }
}

impl Conn {
    /// Dispose `rid` and its references if nothing outside holds them
    pub(crate) fn try_delete(&mut self, rid: &str) {
        let Some(root) = self.subs.get(rid) else {
            return;
        };
        if root.direct > 0 {
            return;
        }
        let visited = self.collect(rid);
        self.unsend_unreachable(&visited);
    }

    /// Dispose the unreachable part of the subgraph below `rid`, returning
    /// every RID traversed
    fn collect(&mut self, rid: &str) -> Vec<String> {
        let Some(root) = self.subs.get(rid) else {
            return Vec::new();
        };

        let mut refs: HashMap<String, GcRef> = HashMap::new();
        refs.insert(
            rid.to_string(),
            GcRef {
                indirect: root.indirect as isize,
                state: GcState::None,
            },
        );

        traverse(&self.subs, rid, GcState::Root, &mut |r, sub, state| {
            if state == GcState::Root {
                return GcState::None;
            }
            if let Some(gc) = refs.get_mut(r) {
                gc.indirect -= 1;
                return GcState::Stop;
            }
            refs.insert(
                r.to_string(),
                GcRef {
                    indirect: sub.indirect as isize - 1,
                    state: GcState::None,
                },
            );
            GcState::None
        });

        if refs.get(rid).is_some_and(|gc| gc.indirect > 0) {
            return refs.into_keys().collect();
        }

        traverse(&self.subs, rid, GcState::Delete, &mut |r, _, state| {
            let Some(gc) = refs.get_mut(r) else {
                return GcState::Stop;
            };
            if gc.state >= GcState::Keep {
                return GcState::Stop;
            }
            if gc.indirect > 0 || state == GcState::Keep {
                gc.state = GcState::Keep;
                return GcState::Keep;
            }
            if gc.state != GcState::None {
                return GcState::Stop;
            }
            gc.state = GcState::Delete;
            GcState::Delete
        });

        let mut visited = Vec::with_capacity(refs.len());
        for (r, gc) in refs {
            if gc.state == GcState::Delete {
                if let Some(sub) = self.subs.remove(&r) {
                    trace!(cid = %self.cid(), rid = %r, "Disposing subscription");
                    self.dispose_subscription(sub);
                }
            }
            visited.push(r);
        }
        visited
    }

    fn unsend_unreachable(&mut self, rids: &[String]) {
        if !rids.iter().any(|r| self.subs.get(r).is_some_and(|s| s.is_sent())) {
            return;
        }

        // Resources held by the client: sent direct subscriptions and
        // everything sent below them
        let mut held: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = self
            .subs
            .iter()
            .filter(|(_, s)| s.direct > 0 && s.is_sent())
            .map(|(r, _)| r.as_str())
            .collect();
        while let Some(r) = stack.pop() {
            if !held.insert(r) {
                continue;
            }
            if let Some(sub) = self.subs.get(r) {
                stack.extend(
                    sub.refs
                        .keys()
                        .filter(|c| self.subs.get(c.as_str()).is_some_and(|s| s.is_sent()))
                        .map(String::as_str),
                );
            }
        }

        let unsend: Vec<String> = rids
            .iter()
            .filter(|r| !held.contains(r.as_str()))
            .filter(|r| self.subs.get(r.as_str()).is_some_and(|s| s.is_sent()))
            .cloned()
            .collect();
        let cid = self.cid().to_string();
        for r in unsend {
            if let Some(sub) = self.subs.get_mut(&r) {
                trace!(cid = %cid, rid = %r, "Unsending subscription");
                sub.state = SubState::Ready;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnContext;
    use crate::middleware::metrics::GatewayMetrics;
    use crate::rescache::{CacheOptions, ResourceCache};
    use res_bus::MemoryBus;
    use std::sync::Arc;

    fn conn() -> Conn {
        let metrics = Arc::new(GatewayMetrics::new());
        let cache = ResourceCache::new(Arc::new(MemoryBus::new()), CacheOptions::default(), metrics.clone());
        Conn::detached(ConnContext::new(cache, metrics, 256), crate::rpc::version::LATEST)
    }

    /// Add a subscription with counts and references to other RIDs
    fn add(c: &mut Conn, rid: &str, direct: usize, refs: &[&str]) {
        let mut sub = ClientSubscription::new(rid, rid, "");
        sub.direct = direct;
        for r in refs {
            *sub.refs.entry(r.to_string()).or_default() += 1;
        }
        c.subs.insert(rid.to_string(), sub);
    }

    /// Derive indirect counts from the references
    fn link(c: &mut Conn) {
        let counts: Vec<String> = c
            .subs
            .values()
            .flat_map(|s| s.refs.keys().cloned().collect::<Vec<_>>())
            .collect();
        for rid in counts {
            if let Some(sub) = c.subs.get_mut(&rid) {
                sub.indirect += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_chain_is_collected() {
        let mut c = conn();
        add(&mut c, "a", 0, &["b"]);
        add(&mut c, "b", 0, &["c"]);
        add(&mut c, "c", 0, &[]);
        link(&mut c);

        c.try_delete("a");
        assert!(c.subscription_rids().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_is_collected() {
        let mut c = conn();
        add(&mut c, "a", 0, &["b"]);
        add(&mut c, "b", 0, &["a"]);
        link(&mut c);

        c.try_delete("a");
        assert!(c.subscription_rids().is_empty());
    }

    #[tokio::test]
    async fn test_externally_referenced_root_is_kept() {
        let mut c = conn();
        add(&mut c, "x", 1, &["a"]);
        add(&mut c, "a", 0, &["b"]);
        add(&mut c, "b", 0, &["a"]);
        link(&mut c);

        c.try_delete("a");
        assert_eq!(c.subscription_rids(), vec!["a", "b", "x"]);
    }

    #[tokio::test]
    async fn test_shared_child_is_kept() {
        let mut c = conn();
        add(&mut c, "a", 0, &["shared"]);
        add(&mut c, "x", 1, &["shared"]);
        add(&mut c, "shared", 0, &["leaf"]);
        add(&mut c, "leaf", 0, &[]);
        link(&mut c);

        c.try_delete("a");
        assert_eq!(c.subscription_rids(), vec!["leaf", "shared", "x"]);
        assert_eq!(c.subscription_counts("shared"), Some((0, 1)));
    }

    fn sent(c: &mut Conn, rids: &[&str]) {
        for r in rids {
            if let Some(sub) = c.subs.get_mut(*r) {
                sub.state = SubState::Sent;
            }
        }
    }

    fn is_sent(c: &Conn, rid: &str) -> bool {
        c.subs.get(rid).is_some_and(|s| s.is_sent())
    }

    #[tokio::test]
    async fn test_sent_resource_kept_by_unsent_parent_is_unsent() {
        let mut c = conn();
        add(&mut c, "parent", 1, &["model"]);
        add(&mut c, "model", 1, &["leaf"]);
        add(&mut c, "leaf", 0, &[]);
        link(&mut c);
        sent(&mut c, &["model", "leaf"]);

        // The client drops model and leaf, while parent still loads
        c.subs.get_mut("model").unwrap().direct = 0;
        c.try_delete("model");
        assert_eq!(c.subscription_rids(), vec!["leaf", "model", "parent"]);
        assert!(!is_sent(&c, "model"));
        assert!(!is_sent(&c, "leaf"));
        assert!(c.subs["model"].is_ready());
    }

    #[tokio::test]
    async fn test_resource_held_by_sent_parent_stays_sent() {
        let mut c = conn();
        add(&mut c, "parent", 1, &["model"]);
        add(&mut c, "model", 1, &[]);
        link(&mut c);
        sent(&mut c, &["parent", "model"]);

        c.subs.get_mut("model").unwrap().direct = 0;
        c.try_delete("model");
        assert!(is_sent(&c, "model"));
    }

    #[tokio::test]
    async fn test_direct_subscription_never_collected() {
        let mut c = conn();
        add(&mut c, "a", 0, &["b"]);
        add(&mut c, "b", 2, &[]);
        link(&mut c);

        c.try_delete("a");
        assert_eq!(c.subscription_rids(), vec!["b"]);
        assert_eq!(c.subscription_counts("b"), Some((2, 0)));

        c.try_delete("b");
        assert_eq!(c.subscription_rids(), vec!["b"]);
    }
}
