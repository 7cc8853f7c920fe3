//! Convergent presence member set for one channel.
//!
//! The server streams the full member set in SYNC envelopes while live
//! ENTER/UPDATE/LEAVE events keep arriving. Live events received during a
//! sync are held in a backlog and replayed once the sync completes; members
//! that were not seen during the sync are then removed with a fabricated
//! LEAVE.

use std::collections::BTreeMap;

use crate::auth::now_ms;
use crate::state_machine::{State, StateMachine};
use crate::types::{PresenceAction, PresenceMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncState {
    Initialized,
    SyncStarting,
    SyncNone,
    FinalizingSync,
    InSync,
    Failed,
}

impl State for SyncState {
    fn transitions(self) -> &'static [Self] {
        use SyncState::*;
        match self {
            Initialized => &[SyncStarting, Failed],
            SyncStarting => &[SyncNone, FinalizingSync, Failed],
            SyncNone => &[FinalizingSync, Failed],
            FinalizingSync => &[InSync, Failed],
            InSync => &[SyncStarting, Failed],
            Failed => &[SyncStarting],
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    /// `false` for an absent witness: a LEAVE seen during a sync, kept so a
    /// stale PRESENT for the same member cannot resurrect it.
    present: bool,
    message: PresenceMessage,
    sync_session_id: u64,
}

/// Whether `incoming` supersedes `existing` for the same member.
///
/// Ids assigned by a real publish on the member's own connection carry
/// `msg_serial:index` and are ordered by that pair. Anything else falls back
/// to the server timestamp; only a strictly newer message wins.
pub(crate) fn should_update_member(existing: &PresenceMessage, incoming: &PresenceMessage) -> bool {
    if existing.has_connection_scoped_id()
        && incoming.has_connection_scoped_id()
        && let (Some(old), Some(new)) = (existing.serial_and_index(), incoming.serial_and_index())
    {
        return new > old;
    }
    match (existing.timestamp, incoming.timestamp) {
        (Some(old), Some(new)) => new > old,
        (None, Some(_)) => true,
        (Some(_), None) => false,
        (None, None) => true,
    }
}

pub(crate) struct MembersMap {
    state: StateMachine<SyncState>,
    members: BTreeMap<String, Entry>,
    session_id: u64,
    backlog: Vec<PresenceMessage>,
}

impl Default for MembersMap {
    fn default() -> Self {
        MembersMap {
            state: StateMachine::new("members", SyncState::Initialized),
            members: BTreeMap::new(),
            session_id: 0,
            backlog: Vec::new(),
        }
    }
}

impl MembersMap {
    pub(crate) fn state(&self) -> SyncState {
        self.state.current()
    }

    pub(crate) fn is_in_sync(&self) -> bool {
        self.state.is(&[SyncState::InSync])
    }

    fn is_syncing(&self) -> bool {
        self.state.is(&[SyncState::SyncStarting])
    }

    /// Begin a new sync session. Restarting a sync that is already running
    /// only opens a new session.
    pub(crate) fn start_sync(&mut self) {
        if !self.is_syncing() {
            self.state.transition(SyncState::SyncStarting);
        }
        self.session_id += 1;
        tracing::debug!(session = self.session_id, "Presence sync starting");
    }

    /// Called on ATTACHED. Without the presence flag no SYNC follows, so the
    /// set converges to empty immediately.
    pub(crate) fn on_attached(&mut self, has_presence: bool) -> Vec<PresenceMessage> {
        self.start_sync();
        if has_presence {
            return Vec::new();
        }
        self.state.transition(SyncState::SyncNone);
        self.finalize()
    }

    /// Apply one SYNC envelope. `cursor` is the envelope's channel serial;
    /// returns the events to emit and whether the sync completed.
    pub(crate) fn apply_sync(
        &mut self,
        cursor: Option<&str>,
        items: Vec<PresenceMessage>,
    ) -> (Vec<PresenceMessage>, bool) {
        if !self.is_syncing() {
            // A server-initiated resync without a preceding ATTACHED.
            self.start_sync();
        }
        let mut events: Vec<PresenceMessage> =
            items.into_iter().filter_map(|msg| self.apply(msg)).collect();
        if sync_cursor_complete(cursor) {
            events.extend(self.finalize());
            return (events, true);
        }
        (events, false)
    }

    /// Apply live PRESENCE events. During a sync only PRESENT and ABSENT are
    /// applied; the rest wait for the sync to complete.
    pub(crate) fn apply_live(&mut self, items: Vec<PresenceMessage>) -> Vec<PresenceMessage> {
        let mut events = Vec::new();
        for msg in items {
            if self.is_syncing()
                && matches!(
                    msg.action,
                    PresenceAction::Enter | PresenceAction::Update | PresenceAction::Leave
                )
            {
                self.backlog.push(msg);
                continue;
            }
            events.extend(self.apply(msg));
        }
        events
    }

    /// Drop every member and abandon any sync in progress.
    pub(crate) fn fail(&mut self) {
        if !self.state.is(&[SyncState::Failed]) {
            self.state.transition(SyncState::Failed);
        }
        self.members.clear();
        self.backlog.clear();
    }

    /// Members currently present, ordered by member key.
    pub(crate) fn values(&self) -> Vec<PresenceMessage> {
        self.members
            .values()
            .filter(|e| e.present)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Client ids present on the given connection.
    pub(crate) fn client_ids_for_connection(&self, connection_id: &str) -> Vec<String> {
        self.members
            .values()
            .filter(|e| e.present && e.message.connection_id.as_deref() == Some(connection_id))
            .filter_map(|e| e.message.client_id.clone())
            .collect()
    }

    fn apply(&mut self, msg: PresenceMessage) -> Option<PresenceMessage> {
        match msg.action {
            PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => {
                self.put(msg)
            }
            PresenceAction::Leave | PresenceAction::Absent => self.remove(msg),
        }
    }

    fn put(&mut self, msg: PresenceMessage) -> Option<PresenceMessage> {
        let key = msg.member_key();
        let syncing = self.is_syncing();
        if let Some(existing) = self.members.get_mut(&key)
            && !should_update_member(&existing.message, &msg)
        {
            if syncing {
                // Seen in this sync even though the stored copy is newer.
                existing.sync_session_id = self.session_id;
            }
            return None;
        }
        let mut stored = msg.clone();
        stored.action = PresenceAction::Present;
        self.members.insert(
            key,
            Entry {
                present: true,
                message: stored,
                sync_session_id: self.session_id,
            },
        );
        Some(msg)
    }

    fn remove(&mut self, msg: PresenceMessage) -> Option<PresenceMessage> {
        let key = msg.member_key();
        let was_present = match self.members.get(&key) {
            Some(existing) if !should_update_member(&existing.message, &msg) => return None,
            Some(existing) => existing.present,
            None => false,
        };
        if self.is_syncing() {
            self.members.insert(
                key,
                Entry {
                    present: false,
                    message: msg.clone(),
                    sync_session_id: self.session_id,
                },
            );
        } else {
            self.members.remove(&key);
        }
        if !was_present {
            return None;
        }
        let mut event = msg;
        event.action = PresenceAction::Leave;
        Some(event)
    }

    fn finalize(&mut self) -> Vec<PresenceMessage> {
        let mut events: Vec<PresenceMessage> = std::mem::take(&mut self.backlog)
            .into_iter()
            .filter_map(|msg| self.apply(msg))
            .collect();

        self.state.transition(SyncState::FinalizingSync);
        self.members.retain(|_, e| e.present);

        let session = self.session_id;
        let stale: Vec<String> = self
            .members
            .iter()
            .filter(|(_, e)| e.sync_session_id != session)
            .map(|(k, _)| k.clone())
            .collect();
        let now = now_ms();
        for key in stale {
            if let Some(entry) = self.members.remove(&key) {
                let mut leave = entry.message;
                leave.action = PresenceAction::Leave;
                leave.id = None;
                leave.timestamp = Some(now);
                events.push(leave);
            }
        }

        self.state.transition(SyncState::InSync);
        tracing::debug!(
            session,
            members = self.members.len(),
            "Presence sync complete"
        );
        events
    }
}

/// A cursor is `cursor:part`; a missing cursor or an empty part ends the sync.
fn sync_cursor_complete(cursor: Option<&str>) -> bool {
    match cursor {
        None => true,
        Some(serial) => match serial.split_once(':') {
            Some((_, part)) => part.is_empty(),
            None => true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(
        action: PresenceAction,
        client: &str,
        conn: &str,
        id: &str,
        ts: i64,
    ) -> PresenceMessage {
        PresenceMessage {
            action,
            id: Some(id.to_string()),
            client_id: Some(client.to_string()),
            connection_id: Some(conn.to_string()),
            timestamp: Some(ts),
            ..Default::default()
        }
    }

    fn clients(map: &MembersMap) -> Vec<String> {
        map.values()
            .into_iter()
            .filter_map(|m| m.client_id)
            .collect()
    }

    #[test]
    fn serial_ordering_beats_timestamps_for_connection_ids() {
        let older = presence(PresenceAction::Enter, "a", "X", "X:5:0", 2_000);
        let newer = presence(PresenceAction::Update, "a", "X", "X:6:0", 1_000);
        assert!(should_update_member(&older, &newer));
        assert!(!should_update_member(&newer, &older));

        let same_serial_later_index = presence(PresenceAction::Update, "a", "X", "X:5:1", 0);
        assert!(should_update_member(&older, &same_serial_later_index));
    }

    #[test]
    fn synthesized_ids_fall_back_to_timestamps() {
        let existing = presence(PresenceAction::Present, "a", "X", "srv:1:0", 1_000);
        let later = presence(PresenceAction::Leave, "a", "X", "X:0:0", 2_000);
        let equal = presence(PresenceAction::Leave, "a", "X", "X:0:0", 1_000);
        assert!(should_update_member(&existing, &later));
        assert!(!should_update_member(&existing, &equal));
    }

    #[test]
    fn leave_in_backlog_wins_and_is_emitted_once() {
        let mut map = MembersMap::default();
        map.on_attached(true);

        let (events, done) = map.apply_sync(
            Some("cursor:more"),
            vec![presence(PresenceAction::Present, "A", "X", "X:5:0", 1_000)],
        );
        assert!(!done);
        assert_eq!(events.len(), 1);

        let queued = map.apply_live(vec![presence(PresenceAction::Leave, "A", "X", "X:6:0", 2_000)]);
        assert!(queued.is_empty());

        let (events, done) = map.apply_sync(Some("cursor:"), Vec::new());
        assert!(done);
        assert!(map.is_in_sync());
        let leaves: Vec<_> = events
            .iter()
            .filter(|e| e.action == PresenceAction::Leave)
            .collect();
        assert_eq!(leaves.len(), 1);
        assert!(clients(&map).is_empty());
    }

    #[test]
    fn members_missing_from_sync_get_fabricated_leaves() {
        let mut map = MembersMap::default();
        map.on_attached(false);
        map.apply_live(vec![
            presence(PresenceAction::Enter, "a", "X", "X:0:0", 1),
            presence(PresenceAction::Enter, "b", "Y", "Y:0:0", 1),
        ]);
        assert_eq!(clients(&map), vec!["a", "b"]);

        map.on_attached(true);
        let (events, done) = map.apply_sync(
            Some("c1"),
            vec![presence(PresenceAction::Present, "a", "X", "X:0:0", 1)],
        );
        assert!(done);
        assert_eq!(clients(&map), vec!["a"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, PresenceAction::Leave);
        assert_eq!(events[0].client_id.as_deref(), Some("b"));
    }

    #[test]
    fn attach_without_presence_empties_the_set() {
        let mut map = MembersMap::default();
        map.on_attached(false);
        map.apply_live(vec![presence(PresenceAction::Enter, "a", "X", "X:0:0", 1)]);
        let events = map.on_attached(false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, PresenceAction::Leave);
        assert!(map.values().is_empty());
        assert_eq!(map.state(), SyncState::InSync);
    }

    #[test]
    fn replaying_the_same_sync_is_idempotent() {
        let sync = vec![
            presence(PresenceAction::Present, "a", "X", "X:1:0", 10),
            presence(PresenceAction::Present, "b", "Y", "srv:1:0", 20),
            presence(PresenceAction::Absent, "c", "Z", "srv:2:0", 30),
            presence(PresenceAction::Present, "a", "X", "X:0:0", 5),
        ];
        let mut map = MembersMap::default();
        map.on_attached(true);
        map.apply_sync(Some("s:"), sync.clone());
        let once = map.values();

        map.on_attached(true);
        map.apply_sync(Some("s:"), sync);
        assert_eq!(map.values(), once);
        assert_eq!(once.len(), 2);
    }

    #[test]
    fn stored_members_are_present_and_grouped_by_connection() {
        let mut map = MembersMap::default();
        map.on_attached(false);
        map.apply_live(vec![
            presence(PresenceAction::Enter, "a", "X", "X:0:0", 1),
            presence(PresenceAction::Update, "b", "X", "X:1:0", 1),
            presence(PresenceAction::Enter, "c", "Y", "Y:0:0", 1),
        ]);
        assert!(map.values().iter().all(|m| m.action == PresenceAction::Present));
        let mut on_x = map.client_ids_for_connection("X");
        on_x.sort();
        assert_eq!(on_x, vec!["a", "b"]);

        map.fail();
        assert!(map.values().is_empty());
        assert_eq!(map.state(), SyncState::Failed);
    }

    #[test]
    fn cursor_completion() {
        assert!(sync_cursor_complete(None));
        assert!(sync_cursor_complete(Some("abc")));
        assert!(sync_cursor_complete(Some("abc:")));
        assert!(!sync_cursor_complete(Some("abc:def")));
    }
}
