//! Reconciliation state for one live collection.
//!
//! Pure, synchronous bookkeeping shared by every refresh path:
//!
//! - server snapshots replace the confirmed items wholesale, ordered by the
//!   ticket issued when their fetch started; an older snapshot never
//!   replaces a newer one
//! - local entries hold optimistic creates keyed by idempotency key, first
//!   as `Pending`, then, once the write returns a canonical id, awaiting the
//!   server echo until a snapshot fetched after the confirmation arrives
//! - a fetched row by the same author carrying a pending entry's key is the
//!   echo of that write even before its ack returns; the pending copy is
//!   hidden behind it
//! - the view merges both without duplicate identities
//!
//! Callers keep this behind a lock that is never held across an `.await`.

use std::collections::HashSet;

use lodge_core::{ChangeDetection, CollectionItem, ItemId, OptimisticState, SortOrder, ViewItem};

/// Issued when a fetch starts. Later fetches get larger tickets.
pub type Ticket = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalState {
    /// Write in flight. `echo` is the fetched row that already carries this
    /// write, if any; the pending copy is not shown while it is set.
    Pending { echo: Option<ItemId> },
    /// Confirmed by the writer; `confirmed_after` is the last ticket issued
    /// before confirmation. Any snapshot with a larger ticket is
    /// authoritative for this item.
    AwaitingEcho { confirmed_after: Ticket },
}

#[derive(Debug, Clone)]
struct LocalEntry<I> {
    key: String,
    item: I,
    state: LocalState,
    /// Rows with the same author and key that were on display when the
    /// create started. They belong to earlier writes and are never echoes.
    known: HashSet<ItemId>,
}

impl<I: CollectionItem> LocalEntry<I> {
    fn is_pending(&self) -> bool {
        matches!(self.state, LocalState::Pending { .. })
    }

    fn is_echoed(&self) -> bool {
        matches!(self.state, LocalState::Pending { echo: Some(_) })
    }

    fn is_echo(&self, row: &I) -> bool {
        !self.known.contains(&row.item_id())
            && row.subject_id() == self.item.subject_id()
            && row.logical_key() == self.key
    }
}

/// Result of applying a fetched snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// The view changed.
    Applied,
    /// Same content as before; nothing to publish.
    Unchanged,
    /// A newer snapshot was already applied; this one was dropped.
    Outdated,
}

#[derive(Debug, Clone)]
pub struct Reconciler<I> {
    order: SortOrder,
    detection: ChangeDetection,
    server: Vec<I>,
    local: Vec<LocalEntry<I>>,
    last_issued: Ticket,
    last_applied: Option<Ticket>,
    version: u64,
}

impl<I: CollectionItem> Reconciler<I> {
    pub fn new(order: SortOrder) -> Self {
        Self::with_detection(order, I::change_detection())
    }

    pub fn with_detection(order: SortOrder, detection: ChangeDetection) -> Self {
        Self {
            order,
            detection,
            server: Vec::new(),
            local: Vec::new(),
            last_issued: 0,
            last_applied: None,
            version: 0,
        }
    }

    /// Issue the ticket for a fetch that is about to start.
    pub fn begin_fetch(&mut self) -> Ticket {
        self.last_issued += 1;
        self.last_issued
    }

    /// Apply the result of the fetch that was issued `ticket`.
    pub fn apply_snapshot(&mut self, ticket: Ticket, items: Vec<I>) -> SnapshotOutcome {
        if self.last_applied.is_some_and(|applied| applied >= ticket) {
            return SnapshotOutcome::Outdated;
        }
        let first_load = self.last_applied.is_none();
        self.last_applied = Some(ticket);

        let fetched: HashSet<ItemId> = items.iter().map(I::item_id).collect();
        let before = self.local.len();
        self.local.retain(|entry| match entry.state {
            LocalState::Pending { .. } => true,
            LocalState::AwaitingEcho { confirmed_after } => {
                ticket <= confirmed_after && !fetched.contains(&entry.item.item_id())
            }
        });
        let mut local_changed = self.local.len() != before;

        for entry in self.local.iter_mut().filter(|e| e.is_pending()) {
            let echo = items
                .iter()
                .find(|row| entry.is_echo(row))
                .map(I::item_id);
            let state = LocalState::Pending { echo };
            if entry.state != state {
                entry.state = state;
                local_changed = true;
            }
        }

        if !first_load && !local_changed && self.detection.is_unchanged(&self.server, &items) {
            return SnapshotOutcome::Unchanged;
        }
        self.server = items;
        self.version += 1;
        SnapshotOutcome::Applied
    }

    /// Track a new optimistic item. Returns false if a create with the same
    /// key is already pending.
    pub fn insert_pending(&mut self, key: impl Into<String>, item: I) -> bool {
        let key = key.into();
        if self.pending_entry(&key).is_some() {
            return false;
        }
        let on_display = self.server.iter().chain(
            self.local
                .iter()
                .filter(|e| !e.is_pending())
                .map(|e| &e.item),
        );
        let known = on_display
            .filter(|row| row.subject_id() == item.subject_id() && row.logical_key() == key)
            .map(I::item_id)
            .collect();
        self.local.push(LocalEntry {
            key,
            item,
            state: LocalState::Pending { echo: None },
            known,
        });
        self.version += 1;
        true
    }

    /// Swap the pending item's temporary id for `canonical`, in place.
    pub fn confirm(&mut self, key: &str, canonical: ItemId) -> bool {
        let Some(index) = self.pending_entry(key) else {
            return false;
        };
        if self.server.iter().any(|item| item.item_id() == canonical) {
            // The server copy is already on display.
            let entry = self.local.remove(index);
            if entry.is_echoed() {
                return true;
            }
        } else {
            let entry = &mut self.local[index];
            entry.item = entry.item.clone().with_item_id(canonical);
            entry.state = LocalState::AwaitingEcho {
                confirmed_after: self.last_issued,
            };
        }
        self.version += 1;
        true
    }

    /// Remove the pending item for `key`, returning it marked failed.
    pub fn rollback(&mut self, key: &str) -> Option<ViewItem<I>> {
        let index = self.pending_entry(key)?;
        let entry = self.local.remove(index);
        if !entry.is_echoed() {
            self.version += 1;
        }
        Some(ViewItem {
            item: entry.item,
            state: OptimisticState::Failed,
        })
    }

    fn pending_entry(&self, key: &str) -> Option<usize> {
        self.local
            .iter()
            .position(|e| e.key == key && e.is_pending())
    }

    /// Merged view: server items in fetch order, local items after them
    /// (before them when newest-first). No identity appears twice.
    pub fn view(&self) -> Vec<ViewItem<I>> {
        let mut seen = HashSet::with_capacity(self.server.len() + self.local.len());
        let mut server = Vec::with_capacity(self.server.len());
        for item in &self.server {
            if seen.insert(item.item_id()) {
                server.push(ViewItem::confirmed(item.clone()));
            }
        }
        let local = self
            .local
            .iter()
            .filter_map(|entry| match entry.state {
                LocalState::Pending { echo: None } => Some(ViewItem::pending(entry.item.clone())),
                LocalState::Pending { echo: Some(_) } => None,
                LocalState::AwaitingEcho { .. } => Some(ViewItem::confirmed(entry.item.clone())),
            })
            .filter(|v| seen.insert(v.id()));

        match self.order {
            SortOrder::OldestFirst => server.into_iter().chain(local).collect(),
            SortOrder::NewestFirst => {
                let mut newest: Vec<ViewItem<I>> = local.collect();
                newest.reverse();
                newest.extend(server);
                newest
            }
        }
    }

    pub fn items(&self) -> Vec<I> {
        self.view().into_iter().map(|v| v.item).collect()
    }

    pub fn server_items(&self) -> &[I] {
        &self.server
    }

    /// Writes still waiting for their ack, echoed or not.
    pub fn pending_count(&self) -> usize {
        self.local.iter().filter(|e| e.is_pending()).count()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending_entry(key).is_some()
    }

    /// Increases on every change to the view, never otherwise.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn has_loaded(&self) -> bool {
        self.last_applied.is_some()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use lodge_core::{CollectionId, EntityIdType, Message, SubjectId};
    use lodge_test_utils::fixtures;
    use proptest::prelude::*;

    fn msg(collection: CollectionId, content: &str, minute: u32) -> Message {
        fixtures::message(collection, SubjectId::now_v7(), content, fixtures::at(10, minute))
    }

    fn ids(view: &[ViewItem<Message>]) -> Vec<ItemId> {
        view.iter().map(ViewItem::id).collect()
    }

    #[test]
    fn test_pending_item_is_appended() {
        let cid = CollectionId::now_v7();
        let mut r = Reconciler::<Message>::new(SortOrder::OldestFirst);
        let t = r.begin_fetch();
        let a = msg(cid, "a", 0);
        r.apply_snapshot(t, vec![a.clone()]);

        let temp = msg(cid, "b", 1).with_item_id(ItemId::temporary());
        assert!(r.insert_pending("send:b", temp.clone()));
        let view = r.view();
        assert_eq!(ids(&view), vec![a.id, temp.id]);
        assert!(view[1].is_pending());
    }

    #[test]
    fn test_duplicate_pending_key_is_refused() {
        let cid = CollectionId::now_v7();
        let mut r = Reconciler::<Message>::new(SortOrder::OldestFirst);
        assert!(r.insert_pending("send:x", msg(cid, "x", 0)));
        assert!(!r.insert_pending("send:x", msg(cid, "x", 0)));
        assert_eq!(r.pending_count(), 1);
    }

    #[test]
    fn test_confirm_swaps_identity_in_place() {
        let cid = CollectionId::now_v7();
        let mut r = Reconciler::<Message>::new(SortOrder::OldestFirst);
        let temp = msg(cid, "hi", 0).with_item_id(ItemId::temporary());
        r.insert_pending("k", temp);

        let canonical = ItemId::now_v7();
        assert!(r.confirm("k", canonical));
        let view = r.view();
        assert_eq!(ids(&view), vec![canonical]);
        assert!(!view[0].is_pending());
        assert!(!r.confirm("k", canonical));
    }

    #[test]
    fn test_rollback_removes_item() {
        let cid = CollectionId::now_v7();
        let mut r = Reconciler::<Message>::new(SortOrder::OldestFirst);
        r.insert_pending("k", msg(cid, "oops", 0));
        let failed = r.rollback("k").unwrap();
        assert_eq!(failed.state, OptimisticState::Failed);
        assert!(r.view().is_empty());
        assert!(r.rollback("k").is_none());
    }

    #[test]
    fn test_snapshot_before_confirmation_keeps_confirmed_item() {
        let cid = CollectionId::now_v7();
        let mut r = Reconciler::<Message>::new(SortOrder::OldestFirst);
        let t1 = r.begin_fetch();
        r.insert_pending("k", msg(cid, "hi", 1));
        let canonical = ItemId::now_v7();
        r.confirm("k", canonical);

        // Fetched before the write landed: the item is not there yet.
        r.apply_snapshot(t1, vec![]);
        assert_eq!(ids(&r.view()), vec![canonical]);

        // Fetched after confirmation: authoritative.
        let t2 = r.begin_fetch();
        let echoed = msg(cid, "hi", 1).with_item_id(canonical);
        r.apply_snapshot(t2, vec![echoed]);
        assert_eq!(ids(&r.view()), vec![canonical]);
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_echo_before_ack_shows_one_copy() {
        let cid = CollectionId::now_v7();
        let mut r = Reconciler::<Message>::new(SortOrder::OldestFirst);
        let temp = msg(cid, "hello", 0).with_item_id(ItemId::temporary());
        let key = temp.logical_key();
        assert!(r.insert_pending(key.clone(), temp.clone()));

        // The row is fetched before the write returns.
        let canonical = ItemId::now_v7();
        let t1 = r.begin_fetch();
        r.apply_snapshot(t1, vec![temp.with_item_id(canonical)]);
        let view = r.view();
        assert_eq!(ids(&view), vec![canonical]);
        assert!(!view[0].is_pending());
        assert!(r.is_pending(&key));

        let version = r.version();
        assert!(r.confirm(&key, canonical));
        assert_eq!(ids(&r.view()), vec![canonical]);
        assert_eq!(r.pending_count(), 0);
        assert_eq!(r.version(), version);
    }

    #[test]
    fn test_echo_from_other_author_is_not_matched() {
        let cid = CollectionId::now_v7();
        let mut r = Reconciler::<Message>::new(SortOrder::OldestFirst);
        let temp = msg(cid, "hello", 0).with_item_id(ItemId::temporary());
        r.insert_pending(temp.logical_key(), temp.clone());

        let theirs = msg(cid, "hello", 0);
        let t = r.begin_fetch();
        r.apply_snapshot(t, vec![theirs.clone()]);
        assert_eq!(ids(&r.view()), vec![theirs.id, temp.id]);
    }

    #[test]
    fn test_repeated_text_waits_for_its_own_row() {
        let (cid, me) = (CollectionId::now_v7(), SubjectId::now_v7());
        let mut r = Reconciler::<Message>::new(SortOrder::OldestFirst);
        let first = fixtures::message(cid, me, "ok", fixtures::at(10, 0));
        let t = r.begin_fetch();
        r.apply_snapshot(t, vec![first.clone()]);

        let again = fixtures::message(cid, me, "ok", fixtures::at(10, 1))
            .with_item_id(ItemId::temporary());
        assert!(r.insert_pending(again.logical_key(), again.clone()));
        let t = r.begin_fetch();
        assert_eq!(r.apply_snapshot(t, vec![first.clone()]), SnapshotOutcome::Unchanged);
        assert_eq!(ids(&r.view()), vec![first.id, again.id]);

        let second = again.with_item_id(ItemId::now_v7());
        let t = r.begin_fetch();
        r.apply_snapshot(t, vec![first.clone(), second.clone()]);
        assert_eq!(ids(&r.view()), vec![first.id, second.id]);
    }

    #[test]
    fn test_outdated_snapshot_is_dropped() {
        let cid = CollectionId::now_v7();
        let mut r = Reconciler::<Message>::new(SortOrder::OldestFirst);
        let old = r.begin_fetch();
        let new = r.begin_fetch();
        let a = msg(cid, "a", 0);
        let b = msg(cid, "b", 1);

        assert_eq!(r.apply_snapshot(new, vec![a.clone(), b.clone()]), SnapshotOutcome::Applied);
        assert_eq!(r.apply_snapshot(old, vec![a.clone()]), SnapshotOutcome::Outdated);
        assert_eq!(ids(&r.view()), vec![a.id, b.id]);
    }

    #[test]
    fn test_same_tail_leaves_state_untouched() {
        let cid = CollectionId::now_v7();
        let mut r = Reconciler::<Message>::new(SortOrder::OldestFirst);
        let a = msg(cid, "a", 0);
        let t = r.begin_fetch();
        r.apply_snapshot(t, vec![a.clone()]);
        let version = r.version();

        let t = r.begin_fetch();
        assert_eq!(r.apply_snapshot(t, vec![a]), SnapshotOutcome::Unchanged);
        assert_eq!(r.version(), version);
    }

    #[test]
    fn test_first_empty_snapshot_counts_as_change() {
        let mut r = Reconciler::<Message>::new(SortOrder::OldestFirst);
        let t = r.begin_fetch();
        assert_eq!(r.apply_snapshot(t, vec![]), SnapshotOutcome::Applied);
        assert!(r.has_loaded());
        assert_eq!(r.version(), 1);
    }

    #[test]
    fn test_newest_first_puts_local_items_on_top() {
        let cid = CollectionId::now_v7();
        let mut r = Reconciler::<Message>::new(SortOrder::NewestFirst);
        let t = r.begin_fetch();
        let a = msg(cid, "a", 0);
        r.apply_snapshot(t, vec![a.clone()]);
        let x = msg(cid, "x", 1);
        let y = msg(cid, "y", 2);
        r.insert_pending("x", x.clone());
        r.insert_pending("y", y.clone());
        assert_eq!(ids(&r.view()), vec![y.id, x.id, a.id]);
    }

    // =========================================================================
    // PROPERTY TESTS
    // =========================================================================

    #[derive(Debug, Clone)]
    enum Step {
        Create(usize),
        Confirm(usize),
        Fail(usize),
        Fetch,
        Deliver(usize),
        /// The write reaches the server; its ack is still outstanding.
        Land(usize),
    }

    fn arb_steps() -> impl Strategy<Value = Vec<Step>> {
        proptest::collection::vec(
            prop_oneof![
                (0usize..4).prop_map(Step::Create),
                (0usize..4).prop_map(Step::Confirm),
                (0usize..4).prop_map(Step::Fail),
                Just(Step::Fetch),
                (0usize..8).prop_map(Step::Deliver),
                (0usize..4).prop_map(Step::Land),
            ],
            0..40,
        )
    }

    /// Simulated server: writes land in `rows`, at the latest when they are
    /// acked; fetches capture a snapshot that is delivered later, in any
    /// order.
    struct Sim {
        cid: CollectionId,
        r: Reconciler<Message>,
        rows: Vec<Message>,
        drafts: Vec<Option<Message>>,
        landed: Vec<Option<ItemId>>,
        acked: Vec<ItemId>,
        in_flight: Vec<(Ticket, Vec<Message>)>,
    }

    impl Sim {
        fn new() -> Self {
            Self {
                cid: CollectionId::now_v7(),
                r: Reconciler::new(SortOrder::OldestFirst),
                rows: Vec::new(),
                drafts: vec![None; 4],
                landed: vec![None; 4],
                acked: Vec::new(),
                in_flight: Vec::new(),
            }
        }

        fn step(&mut self, step: &Step) {
            match *step {
                Step::Create(n) => {
                    if self.drafts[n].is_some() {
                        return;
                    }
                    let item = msg(self.cid, &format!("m{}", n), n as u32)
                        .with_item_id(ItemId::temporary());
                    if self.r.insert_pending(item.logical_key(), item.clone()) {
                        self.drafts[n] = Some(item);
                    }
                }
                Step::Land(n) => {
                    if let (Some(item), None) = (&self.drafts[n], self.landed[n]) {
                        let canonical = ItemId::now_v7();
                        self.rows.push(item.clone().with_item_id(canonical));
                        self.landed[n] = Some(canonical);
                    }
                }
                Step::Confirm(n) => {
                    if let Some(item) = self.drafts[n].take() {
                        let key = item.logical_key();
                        let canonical = match self.landed[n].take() {
                            Some(canonical) => canonical,
                            None => {
                                let canonical = ItemId::now_v7();
                                self.rows.push(item.with_item_id(canonical));
                                canonical
                            }
                        };
                        self.r.confirm(&key, canonical);
                        self.acked.push(canonical);
                    }
                }
                Step::Fail(n) => {
                    // A write that already landed cannot fail.
                    if self.landed[n].is_some() {
                        return;
                    }
                    if let Some(item) = self.drafts[n].take() {
                        self.r.rollback(&item.logical_key());
                    }
                }
                Step::Fetch => {
                    let ticket = self.r.begin_fetch();
                    self.in_flight.push((ticket, self.rows.clone()));
                }
                Step::Deliver(i) => {
                    if !self.in_flight.is_empty() {
                        let (ticket, rows) = self.in_flight.remove(i % self.in_flight.len());
                        self.r.apply_snapshot(ticket, rows);
                    }
                }
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_view_never_repeats_an_identity(steps in arb_steps()) {
            let mut sim = Sim::new();
            for step in &steps {
                sim.step(step);
                let view = sim.r.view();
                let unique: HashSet<ItemId> = view.iter().map(ViewItem::id).collect();
                prop_assert_eq!(unique.len(), view.len());
            }
        }

        #[test]
        fn prop_converges_to_server_after_fresh_fetch(steps in arb_steps()) {
            let mut sim = Sim::new();
            for step in &steps {
                sim.step(step);
            }
            // Settle every outstanding write, then fetch once more.
            for n in 0..4 {
                sim.step(&Step::Confirm(n));
            }
            let ticket = sim.r.begin_fetch();
            sim.r.apply_snapshot(ticket, sim.rows.clone());

            let shown: Vec<ItemId> = sim.r.view().iter().map(ViewItem::id).collect();
            let server: Vec<ItemId> = sim.rows.iter().map(|m| m.id).collect();
            prop_assert_eq!(shown, server);
            prop_assert_eq!(sim.r.pending_count(), 0);
        }

        #[test]
        fn prop_confirmed_writes_stay_visible(steps in arb_steps()) {
            let mut sim = Sim::new();
            for step in &steps {
                sim.step(step);
                let shown: HashSet<ItemId> = sim.r.view().iter().map(ViewItem::id).collect();
                // Rows are only ever added, so every acknowledged write is shown.
                for id in &sim.acked {
                    prop_assert!(shown.contains(id));
                }
            }
        }

        /// A write is shown once, whether its row or its ack arrives first.
        #[test]
        fn prop_each_write_shown_once(steps in arb_steps()) {
            let mut sim = Sim::new();
            for step in &steps {
                sim.step(step);
                let view = sim.r.view();
                let writes: HashSet<(SubjectId, &str)> = view
                    .iter()
                    .map(|v| (v.item.author_id, v.item.content.as_str()))
                    .collect();
                prop_assert_eq!(writes.len(), view.len());
            }
        }

        #[test]
        fn prop_version_is_monotonic(steps in arb_steps()) {
            let mut sim = Sim::new();
            let mut last = sim.r.version();
            for step in &steps {
                sim.step(step);
                prop_assert!(sim.r.version() >= last);
                last = sim.r.version();
            }
        }
    }
}
