// SPDX-License-Identifier: Apache-2.0

//! The traffic-class tree.
//!
//! Classes live in a slotmap arena and reference each other by key, which
//! keeps the parent/child graph free of ownership cycles and makes removal
//! O(1). Each class carries one of five policies; the scheduler walks the
//! tree from the root, picking one child per level until it reaches a leaf.
//!
//! Blocked-flag discipline: `blocked` is true iff the class cannot contribute
//! work right now (no task, empty subtree, all children blocked, or
//! throttled). Parents learn about downward transitions during
//! [`TcTree::finish_and_account`] and about upward transitions through
//! [`TcTree::unblock_towards_root`]; both stop propagating as soon as a
//! class's flag does not change.

use crate::error::Error;
use crate::heap::{StrideEntry, StrideHeap};
use crate::resource::{MAX_SHARE, QUANTUM, Resource, ResourceArr, STRIDE1, to_work_units};
use crate::wakeup::WakeupQueue;
use slotmap::{SlotMap, new_key_type};
use std::collections::{HashMap, VecDeque};

new_key_type! {
    /// Key of a traffic class inside its tree's arena.
    pub struct TcId;
}

/// Per-class statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcStats {
    /// Accumulated resource usage.
    pub usage: ResourceArr,
    /// Number of times the class was throttled.
    pub cnt_throttled: u64,
}

/// Priority-policy child slot.
#[derive(Debug, Clone, Copy)]
pub struct PriorityChild {
    /// Scheduling priority; higher values dominate.
    pub priority: i32,
    /// The child class.
    pub tc: TcId,
}

/// Strict-priority policy state.
#[derive(Debug, Default)]
pub struct PriorityPolicy {
    /// Children ordered by descending priority.
    pub children: Vec<PriorityChild>,
    /// Index of the most-important non-blocked child.
    pub first_runnable: usize,
}

/// Weighted-fair (stride scheduling) policy state.
#[derive(Debug)]
pub struct WeightedFairPolicy {
    /// The resource consumption is measured in.
    pub resource: Resource,
    /// Runnable children, min-heap by pass.
    pub runnable: StrideHeap<TcId>,
    /// Blocked children parked outside the heap.
    pub blocked_children: Vec<StrideEntry<TcId>>,
}

/// Round-robin policy state.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    /// Runnable children; the front runs next.
    pub runnable: VecDeque<TcId>,
    /// Blocked children parked outside the rotation.
    pub blocked_children: Vec<TcId>,
}

/// Token-bucket rate-limit policy state.
///
/// `limit` and `max_burst` are in work units per cycle / work units; the
/// caller converts from units-per-second before building the class.
#[derive(Debug)]
pub struct RateLimitPolicy {
    /// The limited resource.
    pub resource: Resource,
    /// Work units replenished per cycle; 0 means unlimited.
    pub limit: u64,
    /// Token cap, in work units.
    pub max_burst: u64,
    /// Current tokens, in work units.
    pub tokens: u64,
    /// Pending wakeup TSC while throttled.
    pub wakeup_time: Option<u64>,
    /// The single child.
    pub child: Option<TcId>,
}

/// Leaf policy state: owns at most one task of type `T`.
#[derive(Debug)]
pub struct LeafPolicy<T> {
    /// The task this leaf schedules.
    pub task: Option<T>,
}

/// Policy-specific state, tagged by policy kind.
#[derive(Debug)]
pub enum Policy<T> {
    /// Strict priority between children.
    Priority(PriorityPolicy),
    /// Weighted-fair sharing between children.
    WeightedFair(WeightedFairPolicy),
    /// Round-robin rotation between children.
    RoundRobin(RoundRobinPolicy),
    /// Token-bucket rate limiting of a single child.
    RateLimit(RateLimitPolicy),
    /// Leaf owning a task.
    Leaf(LeafPolicy<T>),
}

/// Policy kind without its state, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// Strict priority.
    Priority,
    /// Weighted fair.
    WeightedFair,
    /// Round robin.
    RoundRobin,
    /// Rate limit.
    RateLimit,
    /// Leaf.
    Leaf,
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PolicyKind::Priority => "priority",
            PolicyKind::WeightedFair => "weighted_fair",
            PolicyKind::RoundRobin => "round_robin",
            PolicyKind::RateLimit => "rate_limit",
            PolicyKind::Leaf => "leaf",
        };
        write!(f, "{label}")
    }
}

/// Parameters for creating a class.
#[derive(Debug, Clone, Copy)]
pub enum PolicyParams {
    /// Strict priority over children.
    Priority,
    /// Weighted-fair over children, measured in `resource`.
    WeightedFair {
        /// Resource consumption is measured in.
        resource: Resource,
    },
    /// Round robin over children.
    RoundRobin,
    /// Token bucket over the sole child. `limit` is in work units per cycle
    /// (0 = unlimited), `max_burst` in work units.
    RateLimit {
        /// The limited resource.
        resource: Resource,
        /// Work units per cycle; 0 = unlimited.
        limit: u64,
        /// Token cap in work units.
        max_burst: u64,
    },
    /// Leaf.
    Leaf,
}

/// How a child hangs off its parent; must match the parent's policy.
#[derive(Debug, Clone, Copy)]
pub enum Attach {
    /// Under a Priority parent, with a sibling-unique priority.
    Priority(i32),
    /// Under a WeightedFair parent, with a share in `[1, MAX_SHARE]`.
    Share(u32),
    /// Under a RoundRobin parent.
    RoundRobin,
    /// As the sole child of a RateLimit parent.
    Sole,
}

/// A node of the traffic-class tree.
#[derive(Debug)]
pub struct TrafficClass<T> {
    name: String,
    parent: Option<TcId>,
    blocked: bool,
    stats: TcStats,
    last_tsc: u64,
    policy: Policy<T>,
}

impl<T> TrafficClass<T> {
    /// Class name, unique within the tree.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent class, if attached.
    #[must_use]
    pub fn parent(&self) -> Option<TcId> {
        self.parent
    }

    /// Whether the class can currently contribute work.
    #[must_use]
    pub fn blocked(&self) -> bool {
        self.blocked
    }

    /// Accumulated statistics.
    #[must_use]
    pub fn stats(&self) -> &TcStats {
        &self.stats
    }

    /// TSC of the last scheduling/accounting touch.
    #[must_use]
    pub fn last_tsc(&self) -> u64 {
        self.last_tsc
    }

    /// The policy state.
    #[must_use]
    pub fn policy(&self) -> &Policy<T> {
        &self.policy
    }

    /// The policy kind.
    #[must_use]
    pub fn kind(&self) -> PolicyKind {
        match self.policy {
            Policy::Priority(_) => PolicyKind::Priority,
            Policy::WeightedFair(_) => PolicyKind::WeightedFair,
            Policy::RoundRobin(_) => PolicyKind::RoundRobin,
            Policy::RateLimit(_) => PolicyKind::RateLimit,
            Policy::Leaf(_) => PolicyKind::Leaf,
        }
    }

    /// Children of this class, in policy-specific order.
    #[must_use]
    pub fn children(&self) -> Vec<TcId> {
        match &self.policy {
            Policy::Priority(p) => p.children.iter().map(|c| c.tc).collect(),
            Policy::WeightedFair(w) => {
                let mut out: Vec<TcId> = w.runnable.iter().map(|e| e.tc).collect();
                out.extend(w.blocked_children.iter().map(|e| e.tc));
                out
            }
            Policy::RoundRobin(r) => {
                let mut out: Vec<TcId> = r.runnable.iter().copied().collect();
                out.extend(r.blocked_children.iter().copied());
                out
            }
            Policy::RateLimit(rl) => rl.child.into_iter().collect(),
            Policy::Leaf(_) => Vec::new(),
        }
    }
}

/// A per-worker tree of traffic classes.
#[derive(Debug)]
pub struct TcTree<T> {
    classes: SlotMap<TcId, TrafficClass<T>>,
    by_name: HashMap<String, TcId>,
    root: TcId,
}

impl<T> TcTree<T> {
    /// Creates a tree whose root is a round-robin class named `root_name`.
    #[must_use]
    pub fn new(root_name: impl Into<String>) -> Self {
        let mut classes = SlotMap::with_key();
        let name = root_name.into();
        let root = classes.insert(TrafficClass {
            name: name.clone(),
            parent: None,
            blocked: true,
            stats: TcStats::default(),
            last_tsc: 0,
            policy: Policy::RoundRobin(RoundRobinPolicy::default()),
        });
        let mut by_name = HashMap::new();
        let _ = by_name.insert(name, root);
        TcTree {
            classes,
            by_name,
            root,
        }
    }

    /// The root class.
    #[must_use]
    pub fn root(&self) -> TcId {
        self.root
    }

    /// Number of classes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns true if the tree holds only the root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.len() == 1
    }

    /// Looks a class up by id.
    #[must_use]
    pub fn get(&self, id: TcId) -> Option<&TrafficClass<T>> {
        self.classes.get(id)
    }

    /// Looks a class up by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<TcId> {
        self.by_name.get(name).copied()
    }

    /// Iterates over all classes.
    pub fn iter(&self) -> impl Iterator<Item = (TcId, &TrafficClass<T>)> {
        self.classes.iter()
    }

    /// Creates a detached class. New classes start blocked.
    pub fn create(&mut self, name: impl Into<String>, params: PolicyParams) -> Result<TcId, Error> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(Error::DuplicateName { name });
        }
        let policy = match params {
            PolicyParams::Priority => Policy::Priority(PriorityPolicy::default()),
            PolicyParams::WeightedFair { resource } => Policy::WeightedFair(WeightedFairPolicy {
                resource,
                runnable: StrideHeap::new(),
                blocked_children: Vec::new(),
            }),
            PolicyParams::RoundRobin => Policy::RoundRobin(RoundRobinPolicy::default()),
            PolicyParams::RateLimit {
                resource,
                limit,
                max_burst,
            } => Policy::RateLimit(RateLimitPolicy {
                resource,
                limit,
                max_burst,
                tokens: 0,
                wakeup_time: None,
                child: None,
            }),
            PolicyParams::Leaf => Policy::Leaf(LeafPolicy { task: None }),
        };
        let id = self.classes.insert(TrafficClass {
            name: name.clone(),
            parent: None,
            blocked: true,
            stats: TcStats::default(),
            last_tsc: 0,
            policy,
        });
        let _ = self.by_name.insert(name, id);
        Ok(id)
    }

    /// Attaches `child` under `parent`. The attach argument must match the
    /// parent's policy; priority values must be sibling-unique and shares in
    /// range. A runnable child unblocks its ancestors.
    pub fn attach(&mut self, parent: TcId, child: TcId, how: Attach, tsc: u64) -> Result<(), Error> {
        if self.classes[child].parent.is_some() {
            return Err(Error::AlreadyAttached {
                class: self.classes[child].name.clone(),
            });
        }
        let child_blocked = self.classes[child].blocked;
        let parent_name = self.classes[parent].name.clone();

        match (&mut self.classes[parent].policy, how) {
            (Policy::Priority(p), Attach::Priority(priority)) => {
                if p.children.iter().any(|c| c.priority == priority) {
                    return Err(Error::DuplicatePriority {
                        parent: parent_name,
                        priority,
                    });
                }
                // Descending by priority: higher values dominate.
                let pos = p
                    .children
                    .iter()
                    .position(|c| c.priority < priority)
                    .unwrap_or(p.children.len());
                p.children.insert(pos, PriorityChild { priority, tc: child });
            }
            (Policy::WeightedFair(w), Attach::Share(share)) => {
                if share == 0 || share > MAX_SHARE {
                    return Err(Error::ShareOutOfRange { share });
                }
                let stride = STRIDE1 / u64::from(share);
                // Start at the current front pass so a new child neither
                // monopolises nor starves.
                let pass = w.runnable.peek().map_or(0, |top| top.pass);
                let entry = StrideEntry {
                    pass,
                    stride,
                    tc: child,
                };
                if child_blocked {
                    w.blocked_children.push(entry);
                } else {
                    w.runnable.push(entry);
                }
            }
            (Policy::RoundRobin(r), Attach::RoundRobin) => {
                if child_blocked {
                    r.blocked_children.push(child);
                } else {
                    r.runnable.push_back(child);
                }
            }
            (Policy::RateLimit(rl), Attach::Sole) => {
                if rl.child.is_some() {
                    return Err(Error::SoleChildOccupied {
                        parent: parent_name,
                    });
                }
                rl.child = Some(child);
            }
            _ => {
                return Err(Error::AttachArgMismatch {
                    parent: parent_name,
                });
            }
        }

        self.classes[child].parent = Some(parent);
        if child_blocked {
            // Indices may have shifted under a priority parent.
            self.refresh_runnable_hint(parent);
        } else {
            self.unblock_towards_root(child, tsc);
        }
        Ok(())
    }

    /// Detaches `child` from its parent, leaving it in the arena.
    pub fn detach(&mut self, child: TcId) -> Result<(), Error> {
        let Some(parent) = self.classes[child].parent else {
            return Err(Error::NotAttached {
                class: self.classes[child].name.clone(),
            });
        };

        match &mut self.classes[parent].policy {
            Policy::Priority(p) => {
                if let Some(idx) = p.children.iter().position(|c| c.tc == child) {
                    let _ = p.children.remove(idx);
                    if p.first_runnable > idx {
                        p.first_runnable -= 1;
                    }
                }
            }
            Policy::WeightedFair(w) => {
                if w.runnable.remove(child).is_none() {
                    w.blocked_children.retain(|e| e.tc != child);
                }
            }
            Policy::RoundRobin(r) => {
                if let Some(idx) = r.runnable.iter().position(|&c| c == child) {
                    let _ = r.runnable.remove(idx);
                } else {
                    r.blocked_children.retain(|&c| c != child);
                }
            }
            Policy::RateLimit(rl) => {
                rl.child = None;
            }
            Policy::Leaf(_) => unreachable!("a leaf cannot be a parent"),
        }

        self.classes[child].parent = None;
        self.block_towards_root(parent);
        Ok(())
    }

    /// Removes a detached, childless class from the arena.
    pub fn destroy(&mut self, id: TcId) -> Result<(), Error> {
        let class = &self.classes[id];
        if class.parent.is_some() {
            return Err(Error::AlreadyAttached {
                class: class.name.clone(),
            });
        }
        if !class.children().is_empty() {
            return Err(Error::HasChildren {
                class: class.name.clone(),
            });
        }
        let name = class.name.clone();
        let _ = self.by_name.remove(&name);
        let _ = self.classes.remove(id);
        Ok(())
    }

    /// Gives a leaf its task and marks it runnable.
    pub fn attach_task(&mut self, leaf: TcId, task: T, tsc: u64) -> Result<(), Error> {
        let name = self.classes[leaf].name.clone();
        match &mut self.classes[leaf].policy {
            Policy::Leaf(l) => {
                if l.task.is_some() {
                    return Err(Error::TaskAlreadyAttached { class: name });
                }
                l.task = Some(task);
            }
            _ => return Err(Error::NotALeaf { class: name }),
        }
        self.unblock_leaf(leaf, tsc);
        Ok(())
    }

    /// Takes the task away from a leaf, blocking it.
    pub fn detach_task(&mut self, leaf: TcId) -> Result<Option<T>, Error> {
        let name = self.classes[leaf].name.clone();
        let task = match &mut self.classes[leaf].policy {
            Policy::Leaf(l) => l.task.take(),
            _ => return Err(Error::NotALeaf { class: name }),
        };
        self.classes[leaf].blocked = true;
        if let Some(parent) = self.classes[leaf].parent {
            self.note_child_blocked(parent, leaf);
            self.block_towards_root(parent);
        }
        Ok(task)
    }

    /// The task owned by a leaf.
    #[must_use]
    pub fn leaf_task(&self, leaf: TcId) -> Option<&T> {
        match &self.classes.get(leaf)?.policy {
            Policy::Leaf(l) => l.task.as_ref(),
            _ => None,
        }
    }

    /// Marks a leaf blocked or runnable after its task ran. Blocking takes
    /// effect in the subsequent [`TcTree::finish_and_account`] walk.
    pub fn set_leaf_blocked(&mut self, leaf: TcId, blocked: bool) {
        debug_assert!(matches!(self.classes[leaf].policy, Policy::Leaf(_)));
        self.classes[leaf].blocked = blocked;
    }

    /// Unblocks a leaf (e.g. new work arrived for its module) and propagates
    /// the transition towards the root.
    pub fn unblock_leaf(&mut self, leaf: TcId, tsc: u64) {
        let class = &self.classes[leaf];
        let has_task = matches!(&class.policy, Policy::Leaf(l) if l.task.is_some());
        if !class.blocked || !has_task {
            return;
        }
        self.classes[leaf].blocked = false;
        self.unblock_towards_root(leaf, tsc);
    }

    /// Pure selection: walks from the root, one child per level, and returns
    /// the leaf to run next, or `None` if the tree has no runnable leaf.
    #[must_use]
    pub fn pick_next(&self) -> Option<TcId> {
        let mut c = self.root;
        if self.classes[c].blocked {
            return None;
        }
        loop {
            c = match &self.classes[c].policy {
                Policy::Leaf(_) => return Some(c),
                Policy::Priority(p) => {
                    if p.first_runnable >= p.children.len() {
                        return None;
                    }
                    p.children[p.first_runnable].tc
                }
                Policy::WeightedFair(w) => w.runnable.peek()?.tc,
                Policy::RoundRobin(r) => *r.runnable.front()?,
                Policy::RateLimit(rl) => {
                    let child = rl.child?;
                    if self.classes[child].blocked {
                        return None;
                    }
                    child
                }
            };
        }
    }

    /// Charges `usage` to `leaf` and every ancestor, updating each parent's
    /// runnable structures and (for rate limits) token buckets. The leaf's
    /// blocked flag must already reflect the task's outcome.
    pub fn finish_and_account(
        &mut self,
        wakeup: &mut WakeupQueue<TcId>,
        leaf: TcId,
        usage: &ResourceArr,
        tsc: u64,
    ) {
        debug_assert!(matches!(self.classes[leaf].policy, Policy::Leaf(_)));
        {
            let class = &mut self.classes[leaf];
            class.stats.usage.accumulate(usage);
            class.last_tsc = tsc;
        }

        let mut child = leaf;
        while let Some(parent) = self.classes[child].parent {
            let child_blocked = self.classes[child].blocked;
            self.account_one(wakeup, parent, child, child_blocked, usage, tsc);
            child = parent;
        }
    }

    /// Applies one parent's share of [`TcTree::finish_and_account`].
    fn account_one(
        &mut self,
        wakeup: &mut WakeupQueue<TcId>,
        parent: TcId,
        child: TcId,
        child_blocked: bool,
        usage: &ResourceArr,
        tsc: u64,
    ) {
        let elapsed_base = self.classes[parent].last_tsc;

        match self.classes[parent].kind() {
            PolicyKind::Priority => {
                if child_blocked {
                    let from = match &self.classes[parent].policy {
                        Policy::Priority(p) => p.first_runnable,
                        _ => unreachable!(),
                    };
                    let fr = self.priority_advance(parent, from);
                    let class = &mut self.classes[parent];
                    let Policy::Priority(p) = &mut class.policy else {
                        unreachable!();
                    };
                    p.first_runnable = fr;
                    class.blocked = fr >= p.children.len();
                }
            }
            PolicyKind::WeightedFair => {
                let class = &mut self.classes[parent];
                let Policy::WeightedFair(w) = &mut class.policy else {
                    unreachable!();
                };
                debug_assert_eq!(w.runnable.peek().map(|e| e.tc), Some(child));
                if child_blocked {
                    if let Some(entry) = w.runnable.pop() {
                        w.blocked_children.push(entry);
                    }
                    class.blocked = w.runnable.is_empty();
                } else {
                    let consumed = usage[w.resource];
                    let _ = w.runnable.update_top(|e| {
                        e.pass = e.pass.wrapping_add(e.stride * consumed / QUANTUM);
                    });
                }
            }
            PolicyKind::RoundRobin => {
                let class = &mut self.classes[parent];
                let Policy::RoundRobin(r) = &mut class.policy else {
                    unreachable!();
                };
                debug_assert_eq!(r.runnable.front(), Some(&child));
                let _ = r.runnable.pop_front();
                if child_blocked {
                    r.blocked_children.push(child);
                    class.blocked = r.runnable.is_empty();
                } else {
                    r.runnable.push_back(child);
                }
            }
            PolicyKind::RateLimit => {
                let class = &mut self.classes[parent];
                let Policy::RateLimit(rl) = &mut class.policy else {
                    unreachable!();
                };
                if rl.limit == 0 {
                    // Unlimited: pure passthrough accounting.
                    class.blocked = child_blocked;
                } else {
                    let elapsed = tsc.wrapping_sub(elapsed_base);
                    let consumed = to_work_units(usage[rl.resource]);
                    let refilled = rl.tokens.saturating_add(rl.limit.saturating_mul(elapsed));
                    if refilled < consumed {
                        rl.tokens = 0;
                        class.blocked = true;
                        class.stats.cnt_throttled += 1;
                        let wait = (consumed - refilled) / rl.limit;
                        let wakeup_time = tsc.saturating_add(wait);
                        rl.wakeup_time = Some(wakeup_time);
                        wakeup.push(wakeup_time, parent);
                    } else {
                        rl.tokens = (refilled - consumed).min(rl.max_burst);
                        class.blocked = child_blocked;
                    }
                }
            }
            PolicyKind::Leaf => unreachable!("a leaf cannot be a parent"),
        }

        let class = &mut self.classes[parent];
        class.stats.usage.accumulate(usage);
        class.last_tsc = tsc;
    }

    /// Propagates an unblock transition from `start` (already runnable)
    /// towards the root, re-admitting children into runnable structures.
    /// Stops as soon as an ancestor's blocked flag does not change.
    pub fn unblock_towards_root(&mut self, start: TcId, tsc: u64) {
        let mut child = start;
        while let Some(parent) = self.classes[child].parent {
            let still_blocked = self.admit_unblocked_children(parent);
            let was_blocked = self.classes[parent].blocked;
            self.classes[parent].blocked = still_blocked;
            self.classes[parent].last_tsc = tsc;
            if still_blocked || !was_blocked {
                return;
            }
            child = parent;
        }
    }

    /// Resets all statistics, tree-wide.
    pub fn reset_stats(&mut self) {
        for (_, class) in self.classes.iter_mut() {
            class.stats = TcStats::default();
        }
    }

    /// Called by the scheduler when a throttled rate-limit class expires.
    /// Returns true if the class became runnable.
    pub(crate) fn unthrottle(&mut self, id: TcId, event_tsc: u64, now: u64) -> bool {
        let child = {
            let Some(class) = self.classes.get_mut(id) else {
                return false; // destroyed while throttled
            };
            let Policy::RateLimit(rl) = &mut class.policy else {
                return false;
            };
            rl.wakeup_time = None;
            class.last_tsc = event_tsc;
            rl.child
        };
        let child_runnable = child.is_some_and(|c| !self.classes[c].blocked);
        if child_runnable {
            self.classes[id].blocked = false;
            self.unblock_towards_root(id, now);
            true
        } else {
            false
        }
    }

    /// Recomputes `first_runnable` after an attach may have shifted indices.
    fn refresh_runnable_hint(&mut self, parent: TcId) {
        if let Policy::Priority(_) = self.classes[parent].policy {
            let fr = self.priority_advance(parent, 0);
            if let Policy::Priority(p) = &mut self.classes[parent].policy {
                p.first_runnable = fr;
            }
        }
    }

    /// First non-blocked child index at or after `from` under a priority
    /// parent.
    fn priority_advance(&self, parent: TcId, from: usize) -> usize {
        let Policy::Priority(p) = &self.classes[parent].policy else {
            unreachable!("priority_advance on non-priority class");
        };
        let mut idx = from;
        while idx < p.children.len() && self.classes[p.children[idx].tc].blocked {
            idx += 1;
        }
        idx
    }

    /// Re-admits every unblocked child of `parent` into its runnable
    /// structure; returns the parent's new blocked state.
    fn admit_unblocked_children(&mut self, parent: TcId) -> bool {
        match self.classes[parent].kind() {
            PolicyKind::Priority => {
                let fr = self.priority_advance(parent, 0);
                let Policy::Priority(p) = &mut self.classes[parent].policy else {
                    unreachable!();
                };
                p.first_runnable = fr;
                fr >= p.children.len()
            }
            PolicyKind::WeightedFair => {
                let parked: Vec<TcId> = match &self.classes[parent].policy {
                    Policy::WeightedFair(w) => w.blocked_children.iter().map(|e| e.tc).collect(),
                    _ => unreachable!(),
                };
                let now_runnable: Vec<TcId> = parked
                    .into_iter()
                    .filter(|&c| !self.classes[c].blocked)
                    .collect();
                let Policy::WeightedFair(w) = &mut self.classes[parent].policy else {
                    unreachable!();
                };
                for tc in now_runnable {
                    if let Some(idx) = w.blocked_children.iter().position(|e| e.tc == tc) {
                        let mut entry = w.blocked_children.swap_remove(idx);
                        // A returning child starts at pass 0 so it catches up
                        // instead of inheriting stale credit.
                        entry.pass = 0;
                        w.runnable.push(entry);
                    }
                }
                w.runnable.is_empty()
            }
            PolicyKind::RoundRobin => {
                let parked: Vec<TcId> = match &self.classes[parent].policy {
                    Policy::RoundRobin(r) => r.blocked_children.clone(),
                    _ => unreachable!(),
                };
                let now_runnable: Vec<TcId> = parked
                    .into_iter()
                    .filter(|&c| !self.classes[c].blocked)
                    .collect();
                let Policy::RoundRobin(r) = &mut self.classes[parent].policy else {
                    unreachable!();
                };
                for tc in now_runnable {
                    r.blocked_children.retain(|&c| c != tc);
                    r.runnable.push_back(tc);
                }
                r.runnable.is_empty()
            }
            PolicyKind::RateLimit => {
                let (throttled, child) = match &self.classes[parent].policy {
                    Policy::RateLimit(rl) => (rl.wakeup_time.is_some(), rl.child),
                    _ => unreachable!(),
                };
                throttled || child.is_none_or(|c| self.classes[c].blocked)
            }
            PolicyKind::Leaf => unreachable!("a leaf cannot be a parent"),
        }
    }

    /// Moves a freshly blocked child out of `parent`'s runnable structure
    /// without touching siblings.
    fn note_child_blocked(&mut self, parent: TcId, child: TcId) {
        match &mut self.classes[parent].policy {
            Policy::Priority(_) => {
                let fr = self.priority_advance(parent, 0);
                if let Policy::Priority(p) = &mut self.classes[parent].policy {
                    p.first_runnable = fr;
                }
            }
            Policy::WeightedFair(w) => {
                if let Some(entry) = w.runnable.remove(child) {
                    w.blocked_children.push(entry);
                }
            }
            Policy::RoundRobin(r) => {
                if let Some(idx) = r.runnable.iter().position(|&c| c == child) {
                    let _ = r.runnable.remove(idx);
                    r.blocked_children.push(child);
                }
            }
            Policy::RateLimit(_) | Policy::Leaf(_) => {}
        }
    }

    /// Propagates a block transition from `start` towards the root. Stops as
    /// soon as an ancestor remains runnable.
    fn block_towards_root(&mut self, start: TcId) {
        let mut c = start;
        loop {
            let blocked = self.recompute_blocked(c);
            let was = self.classes[c].blocked;
            self.classes[c].blocked = blocked;
            if !(blocked && !was) {
                return;
            }
            if let Some(parent) = self.classes[c].parent {
                self.note_child_blocked(parent, c);
                c = parent;
            } else {
                return;
            }
        }
    }

    /// Recomputes a class's blocked flag from its current structure,
    /// parking newly blocked children.
    fn recompute_blocked(&mut self, id: TcId) -> bool {
        match self.classes[id].kind() {
            PolicyKind::Priority => {
                let fr = self.priority_advance(id, 0);
                let Policy::Priority(p) = &mut self.classes[id].policy else {
                    unreachable!();
                };
                p.first_runnable = fr;
                fr >= p.children.len()
            }
            PolicyKind::WeightedFair => {
                let runnable: Vec<TcId> = match &self.classes[id].policy {
                    Policy::WeightedFair(w) => w.runnable.iter().map(|e| e.tc).collect(),
                    _ => unreachable!(),
                };
                let stale: Vec<TcId> = runnable
                    .into_iter()
                    .filter(|&c| self.classes[c].blocked)
                    .collect();
                let Policy::WeightedFair(w) = &mut self.classes[id].policy else {
                    unreachable!();
                };
                for tc in stale {
                    if let Some(entry) = w.runnable.remove(tc) {
                        w.blocked_children.push(entry);
                    }
                }
                w.runnable.is_empty()
            }
            PolicyKind::RoundRobin => {
                let runnable: Vec<TcId> = match &self.classes[id].policy {
                    Policy::RoundRobin(r) => r.runnable.iter().copied().collect(),
                    _ => unreachable!(),
                };
                let stale: Vec<TcId> = runnable
                    .into_iter()
                    .filter(|&c| self.classes[c].blocked)
                    .collect();
                let Policy::RoundRobin(r) = &mut self.classes[id].policy else {
                    unreachable!();
                };
                for tc in stale {
                    if let Some(idx) = r.runnable.iter().position(|&c| c == tc) {
                        let _ = r.runnable.remove(idx);
                        r.blocked_children.push(tc);
                    }
                }
                r.runnable.is_empty()
            }
            PolicyKind::RateLimit => {
                let Policy::RateLimit(rl) = &self.classes[id].policy else {
                    unreachable!();
                };
                rl.wakeup_time.is_some() || rl.child.is_none_or(|c| self.classes[c].blocked)
            }
            PolicyKind::Leaf => {
                let Policy::Leaf(l) = &self.classes[id].policy else {
                    unreachable!();
                };
                l.task.is_none()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(count: u64, cycles: u64, packets: u64, bits: u64) -> ResourceArr {
        ResourceArr::new(count, cycles, packets, bits)
    }

    /// Builds a tree with `n` leaves under the given mid-level class.
    fn leaves_under<T: Default>(
        tree: &mut TcTree<T>,
        parent: TcId,
        n: usize,
        how: impl Fn(usize) -> Attach,
    ) -> Vec<TcId> {
        (0..n)
            .map(|i| {
                let leaf = tree
                    .create(format!("leaf{i}"), PolicyParams::Leaf)
                    .expect("create leaf");
                tree.attach(parent, leaf, how(i), 0).expect("attach leaf");
                tree.attach_task(leaf, T::default(), 0).expect("attach task");
                leaf
            })
            .collect()
    }

    #[test]
    fn empty_tree_has_no_runnable_leaf() {
        let tree: TcTree<()> = TcTree::new("root");
        assert!(tree.pick_next().is_none());
    }

    #[test]
    fn leaf_without_task_is_blocked() {
        let mut tree: TcTree<()> = TcTree::new("root");
        let leaf = tree.create("leaf", PolicyParams::Leaf).expect("create");
        tree.attach(tree.root(), leaf, Attach::RoundRobin, 0)
            .expect("attach");
        assert!(tree.pick_next().is_none());

        tree.attach_task(leaf, (), 0).expect("attach task");
        assert_eq!(tree.pick_next(), Some(leaf));
    }

    #[test]
    fn priority_picks_highest_value() {
        let mut tree: TcTree<()> = TcTree::new("root");
        let prio = tree.create("prio", PolicyParams::Priority).expect("create");
        tree.attach(tree.root(), prio, Attach::RoundRobin, 0)
            .expect("attach");
        let low = tree.create("low", PolicyParams::Leaf).expect("create");
        let high = tree.create("high", PolicyParams::Leaf).expect("create");
        tree.attach(prio, low, Attach::Priority(1), 0).expect("attach");
        tree.attach(prio, high, Attach::Priority(2), 0).expect("attach");
        tree.attach_task(low, (), 0).expect("task");
        tree.attach_task(high, (), 0).expect("task");

        assert_eq!(tree.pick_next(), Some(high));

        // Blocking the dominant child falls through to the lower priority.
        tree.set_leaf_blocked(high, true);
        let mut wq = WakeupQueue::new();
        tree.finish_and_account(&mut wq, high, &usage(1, 10, 0, 0), 10);
        assert_eq!(tree.pick_next(), Some(low));

        // Unblocking it restores dominance.
        tree.unblock_leaf(high, 20);
        assert_eq!(tree.pick_next(), Some(high));
    }

    #[test]
    fn duplicate_priority_is_rejected() {
        let mut tree: TcTree<()> = TcTree::new("root");
        let prio = tree.create("prio", PolicyParams::Priority).expect("create");
        let a = tree.create("a", PolicyParams::Leaf).expect("create");
        let b = tree.create("b", PolicyParams::Leaf).expect("create");
        tree.attach(prio, a, Attach::Priority(3), 0).expect("attach");
        let err = tree.attach(prio, b, Attach::Priority(3), 0).expect_err("dup");
        assert!(matches!(err, Error::DuplicatePriority { priority: 3, .. }));
    }

    #[test]
    fn round_robin_rotates() {
        let mut tree: TcTree<()> = TcTree::new("root");
        let root = tree.root();
        let leaves = leaves_under(&mut tree, root, 3, |_| Attach::RoundRobin);
        let mut wq = WakeupQueue::new();

        let mut order = Vec::new();
        for _ in 0..6 {
            let leaf = tree.pick_next().expect("runnable");
            order.push(leaf);
            tree.finish_and_account(&mut wq, leaf, &usage(1, 1, 0, 0), 0);
        }
        assert_eq!(order[..3], leaves[..]);
        assert_eq!(order[3..], leaves[..]);
    }

    #[test]
    fn weighted_fair_tracks_shares() {
        let mut tree: TcTree<u32> = TcTree::new("root");
        let wfq = tree
            .create(
                "wfq",
                PolicyParams::WeightedFair {
                    resource: Resource::Packets,
                },
            )
            .expect("create");
        tree.attach(tree.root(), wfq, Attach::RoundRobin, 0)
            .expect("attach");
        let a = tree.create("a", PolicyParams::Leaf).expect("create");
        let b = tree.create("b", PolicyParams::Leaf).expect("create");
        tree.attach(wfq, a, Attach::Share(3), 0).expect("attach");
        tree.attach(wfq, b, Attach::Share(1), 0).expect("attach");
        tree.attach_task(a, 0, 0).expect("task");
        tree.attach_task(b, 0, 0).expect("task");

        let mut wq = WakeupQueue::new();
        let mut runs_a = 0u64;
        let mut runs_b = 0u64;
        for _ in 0..4000 {
            let leaf = tree.pick_next().expect("runnable");
            if leaf == a {
                runs_a += 1;
            } else {
                runs_b += 1;
            }
            // Every run consumes 32 packets.
            tree.finish_and_account(&mut wq, leaf, &usage(1, 1, 32, 0), 0);
        }
        let ratio = runs_a as f64 / runs_b as f64;
        assert!((2.85..=3.15).contains(&ratio), "ratio {ratio}");
    }

    #[test]
    fn rate_limit_throttles_and_wakes() {
        let mut tree: TcTree<()> = TcTree::new("root");
        // 1 work unit per cycle on packets.
        let rl = tree
            .create(
                "rl",
                PolicyParams::RateLimit {
                    resource: Resource::Packets,
                    limit: to_work_units(1),
                    max_burst: to_work_units(32),
                },
            )
            .expect("create");
        tree.attach(tree.root(), rl, Attach::RoundRobin, 0)
            .expect("attach");
        let leaf = tree.create("leaf", PolicyParams::Leaf).expect("create");
        tree.attach(rl, leaf, Attach::Sole, 0).expect("attach");
        tree.attach_task(leaf, (), 0).expect("task");

        let mut wq = WakeupQueue::new();
        assert_eq!(tree.pick_next(), Some(leaf));

        // 100 cycles elapse, 32 packets consumed: plenty of tokens, and the
        // bucket refills to its burst cap.
        tree.finish_and_account(&mut wq, leaf, &usage(1, 100, 32, 0), 100);
        assert!(!tree.get(rl).expect("rl").blocked());

        // The burst cap absorbs one more full batch...
        tree.finish_and_account(&mut wq, leaf, &usage(1, 1, 32, 0), 101);
        assert!(!tree.get(rl).expect("rl").blocked());

        // ...but the next one finds the bucket dry: 2 tokens vs 32 consumed,
        // so the class throttles for (32 - 2) / 1 = 30 cycles.
        tree.finish_and_account(&mut wq, leaf, &usage(1, 1, 32, 0), 102);
        let class = tree.get(rl).expect("rl");
        assert!(class.blocked());
        assert_eq!(class.stats().cnt_throttled, 1);
        assert!(tree.pick_next().is_none());
        let wakeup_at = wq.next_wakeup().expect("queued");
        assert_eq!(wakeup_at, 132);

        // Before the wakeup time nothing changes; at it, the class resumes.
        let (event, id) = wq.pop_expired(wakeup_at).expect("expired");
        assert!(tree.unthrottle(id, event, wakeup_at));
        assert_eq!(tree.pick_next(), Some(leaf));
    }

    #[test]
    fn unlimited_rate_limit_never_throttles() {
        let mut tree: TcTree<()> = TcTree::new("root");
        let rl = tree
            .create(
                "rl",
                PolicyParams::RateLimit {
                    resource: Resource::Bits,
                    limit: 0,
                    max_burst: 0,
                },
            )
            .expect("create");
        tree.attach(tree.root(), rl, Attach::RoundRobin, 0)
            .expect("attach");
        let leaf = tree.create("leaf", PolicyParams::Leaf).expect("create");
        tree.attach(rl, leaf, Attach::Sole, 0).expect("attach");
        tree.attach_task(leaf, (), 0).expect("task");

        let mut wq = WakeupQueue::new();
        for tsc in 0..100u64 {
            assert_eq!(tree.pick_next(), Some(leaf));
            tree.finish_and_account(&mut wq, leaf, &usage(1, 1, 32, 1 << 20), tsc);
        }
        assert!(wq.is_empty());
        assert_eq!(tree.get(rl).expect("rl").stats().cnt_throttled, 0);
    }

    #[test]
    fn detach_blocks_empty_parents() {
        let mut tree: TcTree<()> = TcTree::new("root");
        let root = tree.root();
        let leaves = leaves_under(&mut tree, root, 1, |_| Attach::RoundRobin);
        assert!(tree.pick_next().is_some());

        tree.detach(leaves[0]).expect("detach");
        assert!(tree.pick_next().is_none());
        assert!(tree.get(tree.root()).expect("root").blocked());
    }

    #[test]
    fn destroy_refuses_attached_or_parent_classes() {
        let mut tree: TcTree<()> = TcTree::new("root");
        let mid = tree.create("mid", PolicyParams::RoundRobin).expect("create");
        tree.attach(tree.root(), mid, Attach::RoundRobin, 0)
            .expect("attach");
        let leaf = tree.create("leaf", PolicyParams::Leaf).expect("create");
        tree.attach(mid, leaf, Attach::RoundRobin, 0).expect("attach");

        assert!(matches!(
            tree.destroy(mid),
            Err(Error::AlreadyAttached { .. })
        ));
        tree.detach(mid).expect("detach mid");
        assert!(matches!(tree.destroy(mid), Err(Error::HasChildren { .. })));

        tree.detach(leaf).expect("detach leaf");
        tree.destroy(leaf).expect("destroy leaf");
        tree.destroy(mid).expect("destroy mid");
        assert!(tree.find("mid").is_none());
    }

    #[test]
    fn stats_accumulate_up_the_tree() {
        let mut tree: TcTree<()> = TcTree::new("root");
        let root = tree.root();
        let leaves = leaves_under(&mut tree, root, 1, |_| Attach::RoundRobin);
        let mut wq = WakeupQueue::new();
        tree.finish_and_account(&mut wq, leaves[0], &usage(1, 7, 32, 256), 7);

        let leaf_stats = tree.get(leaves[0]).expect("leaf").stats();
        assert_eq!(leaf_stats.usage[Resource::Packets], 32);
        let root_stats = tree.get(tree.root()).expect("root").stats();
        assert_eq!(root_stats.usage[Resource::Packets], 32);
        assert_eq!(root_stats.usage[Resource::Bits], 256);
    }
}
