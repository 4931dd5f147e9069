//! Merges optimistic sends with the authoritative message feed of one thread
//!
//! A send shows up twice: first as a local entry the moment the user hits send,
//! then as the stored row, once through the write acknowledgement and once
//! through the change feed, in either order. Rows pushed by the feed are paired
//! with pending entries by fingerprint (thread + sender + content) inside the
//! dedup window. Entries with the same fingerprint are interchangeable, so the
//! reconciler only tracks how many feed rows have claimed a pending entry of a
//! given fingerprint and hides that many of the oldest ones.
use super::identity::UserId;
use super::listing::TimeStamp;
use super::thread::{ChatMessage, MessageBody};
use super::utils::message_fingerprint;
use chrono::Utc;
use log::{debug, trace};
use std::collections::{HashMap, HashSet};

pub type LocalId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryRef {
    Stored(String),
    Local(LocalId),
}

/// One line of the rendered conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    pub entry: EntryRef,
    pub sender_id: Option<UserId>,
    pub body: MessageBody,
    pub created_at: TimeStamp<Utc>,
}

impl ViewEntry {
    pub fn is_pending(&self) -> bool {
        matches!(self.entry, EntryRef::Local(_))
    }
}

#[derive(Debug, Clone)]
struct Optimistic {
    local_id: LocalId,
    sender_id: UserId,
    body: MessageBody,
    fingerprint: String,
    staged_at: TimeStamp<Utc>,
    seq: u64,
}

#[derive(Debug, Clone)]
struct Stored {
    message: ChatMessage,
    seq: u64,
}

#[derive(Debug)]
pub struct Reconciler {
    thread_id: String,
    window: chrono::Duration,
    stored: HashMap<String, Stored>,
    pending: Vec<Optimistic>,
    // feed rows paired with a pending entry whose acknowledgement has not come back yet
    claims: HashMap<String, Vec<String>>,
    next_local: LocalId,
    next_seq: u64,
}

impl Reconciler {
    pub fn new(thread_id: &str, window: chrono::Duration) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            window,
            stored: HashMap::new(),
            pending: Vec::new(),
            claims: HashMap::new(),
            next_local: 1,
            next_seq: 0,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Replaces the stored rows with a fresh fetch. Pending entries survive.
    pub fn load(&mut self, messages: Vec<ChatMessage>) {
        let fetched: HashSet<String> = messages.iter().map(|m| m.id.clone()).collect();
        for rows in self.claims.values_mut() {
            rows.retain(|id| fetched.contains(id));
        }
        // rows seen before keep their pairing state, only new ones may claim
        let known: HashSet<String> = self.stored.keys().cloned().collect();
        self.stored.clear();
        for message in messages {
            if known.contains(&message.id) {
                self.insert_stored(message);
            } else {
                self.apply_stored(message);
            }
        }
    }

    /// Adds an optimistic entry for a send that is about to be written.
    pub fn stage(&mut self, sender_id: &str, body: MessageBody, staged_at: TimeStamp<Utc>) -> LocalId {
        let local_id = self.next_local;
        self.next_local += 1;
        let seq = self.bump();
        let fingerprint = message_fingerprint(&self.thread_id, sender_id, body.display());
        trace!("thread {}: staged local {local_id}", self.thread_id);
        self.pending.push(Optimistic {
            local_id,
            sender_id: sender_id.to_string(),
            body,
            fingerprint,
            staged_at,
            seq,
        });
        local_id
    }

    /// Write acknowledgement for a staged entry.
    pub fn confirm(&mut self, local_id: LocalId, message: ChatMessage) {
        let removed = self
            .pending
            .iter()
            .position(|p| p.local_id == local_id)
            .map(|pos| self.pending.remove(pos));

        if self.stored.contains_key(&message.id) {
            // the feed got here first; release its claim
            if let Some(fp) = self.fingerprint_of(&message) {
                if let Some(rows) = self.claims.get_mut(&fp) {
                    rows.retain(|id| id != &message.id);
                }
            }
            debug!("thread {}: ack for {} after feed", self.thread_id, message.id);
        } else {
            self.insert_stored(message);
        }
        if let Some(removed) = removed {
            self.trim_claims(&removed.fingerprint);
        }
    }

    /// The write behind a staged entry failed; drop it.
    pub fn discard(&mut self, local_id: LocalId) -> bool {
        let Some(pos) = self.pending.iter().position(|p| p.local_id == local_id) else {
            return false;
        };
        let removed = self.pending.remove(pos);
        self.trim_claims(&removed.fingerprint);
        true
    }

    /// A row pushed by the change feed (or a fresh fetch). Returns false for duplicates.
    pub fn apply_stored(&mut self, message: ChatMessage) -> bool {
        if self.stored.contains_key(&message.id) {
            trace!("thread {}: duplicate row {}", self.thread_id, message.id);
            return false;
        }
        if let Some(fp) = self.fingerprint_of(&message) {
            let claimed = self.claims.get(&fp).map_or(0, Vec::len);
            let candidates = self
                .pending
                .iter()
                .filter(|p| p.fingerprint == fp && self.in_window(&p.staged_at, &message.created_at))
                .count();
            if candidates > claimed {
                debug!("thread {}: row {} replaces an optimistic entry", self.thread_id, message.id);
                self.claims.entry(fp).or_default().push(message.id.clone());
            }
        }
        self.insert_stored(message);
        true
    }

    pub fn remove_stored(&mut self, message_id: &str) -> bool {
        for rows in self.claims.values_mut() {
            rows.retain(|id| id != message_id);
        }
        self.stored.remove(message_id).is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.view().iter().filter(|e| e.is_pending()).count()
    }

    pub fn len(&self) -> usize {
        self.view().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages ordered by timestamp; pending entries sort after stored ones at equal times.
    pub fn view(&self) -> Vec<ViewEntry> {
        let mut hidden: HashMap<&str, usize> = self
            .claims
            .iter()
            .map(|(fp, rows)| (fp.as_str(), rows.len()))
            .collect();

        let mut lines: Vec<(i64, bool, u64, ViewEntry)> = self
            .stored
            .values()
            .map(|s| {
                (
                    s.message.created_at.nanos(),
                    false,
                    s.seq,
                    ViewEntry {
                        entry: EntryRef::Stored(s.message.id.clone()),
                        sender_id: s.message.sender_id.clone(),
                        body: s.message.body.clone(),
                        created_at: s.message.created_at.clone(),
                    },
                )
            })
            .collect();

        // pending is in staging order, so the oldest claimed ones get hidden
        for p in &self.pending {
            if let Some(left) = hidden.get_mut(p.fingerprint.as_str()) {
                if *left > 0 {
                    *left -= 1;
                    continue;
                }
            }
            lines.push((
                p.staged_at.nanos(),
                true,
                p.seq,
                ViewEntry {
                    entry: EntryRef::Local(p.local_id),
                    sender_id: Some(p.sender_id.clone()),
                    body: p.body.clone(),
                    created_at: p.staged_at.clone(),
                },
            ));
        }

        lines.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));
        lines.into_iter().map(|(_, _, _, entry)| entry).collect()
    }

    fn insert_stored(&mut self, message: ChatMessage) {
        let seq = self.bump();
        self.stored.insert(message.id.clone(), Stored { message, seq });
    }

    fn open_pending(&self, fingerprint: &str) -> usize {
        self.pending.iter().filter(|p| p.fingerprint == fingerprint).count()
    }

    // a claim no pending entry can back belonged to somebody else's identical message
    fn trim_claims(&mut self, fingerprint: &str) {
        let open = self.open_pending(fingerprint);
        let emptied = match self.claims.get_mut(fingerprint) {
            Some(rows) => {
                rows.truncate(open);
                rows.is_empty()
            }
            None => false,
        };
        if emptied {
            self.claims.remove(fingerprint);
        }
    }

    fn fingerprint_of(&self, message: &ChatMessage) -> Option<String> {
        let sender = message.sender_id.as_deref()?;
        Some(message_fingerprint(&self.thread_id, sender, message.body.display()))
    }

    fn in_window(&self, staged_at: &TimeStamp<Utc>, created_at: &TimeStamp<Utc>) -> bool {
        let gap = created_at.to_datetime_utc() - staged_at.to_datetime_utc();
        gap.abs() <= self.window
    }

    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}
