//! Property-based tests for message reconciliation
//!
//! Every send produces up to three signals: the optimistic entry, the write
//! acknowledgement and the change feed echo (sometimes twice). They are
//! replayed here in random orders, with identical texts and failed writes
//! mixed in, and the merged view must always hold exactly one line per live send.

use std::collections::HashMap;

use delivery_negotiation::{
    listing::TimeStamp,
    reconcile::{LocalId, Reconciler},
    thread::{ChatMessage, MessageBody},
};
use proptest::prelude::*;

const BASE_NANOS: i64 = 1_736_500_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Ack(usize),
    Feed(usize),
    Fail(usize),
}

#[derive(Debug, Clone)]
struct Outgoing {
    text: &'static str,
    fails: bool,
    echoes: usize,
}

// PROPERTY TEST STRATEGIES

/// A handful of short texts so identical sends are common
fn text_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("ok"), Just("yes"), Just("on my way")]
}

fn send_strategy() -> impl Strategy<Value = Outgoing> {
    (text_strategy(), prop::bool::weighted(0.2), 1usize..=2).prop_map(|(text, fails, echoes)| {
        Outgoing {
            text,
            fails,
            echoes,
        }
    })
}

/// Sends together with a shuffled arrival order of their signals
fn run_strategy() -> impl Strategy<Value = (Vec<Outgoing>, Vec<Signal>)> {
    prop::collection::vec(send_strategy(), 1..8).prop_flat_map(|sends| {
        let mut signals = Vec::new();
        for (i, send) in sends.iter().enumerate() {
            if send.fails {
                signals.push(Signal::Fail(i));
            } else {
                signals.push(Signal::Ack(i));
                signals.extend(std::iter::repeat_n(Signal::Feed(i), send.echoes));
            }
        }
        (Just(sends), Just(signals).prop_shuffle())
    })
}

fn stored(i: usize, text: &str) -> ChatMessage {
    ChatMessage {
        id: format!("msg_{i}"),
        thread_id: "chat_1".into(),
        request_id: "req_1".into(),
        sender_id: Some("user_a".into()),
        body: MessageBody::text(text),
        created_at: TimeStamp::from_nanos(BASE_NANOS + 1_000_000 * (i as i64 + 1)),
    }
}

proptest! {
    #[test]
    fn one_line_per_live_send((sends, signals) in run_strategy()) {
        let mut reconciler = Reconciler::new("chat_1", chrono::Duration::seconds(30));
        let mut locals: HashMap<usize, LocalId> = HashMap::new();
        let mut live = 0usize;

        for signal in signals {
            let i = match signal {
                Signal::Ack(i) | Signal::Feed(i) | Signal::Fail(i) => i,
            };
            // a send is staged before anything about it can arrive
            if let std::collections::hash_map::Entry::Vacant(slot) = locals.entry(i) {
                let staged_at = TimeStamp::from_nanos(BASE_NANOS + 1_000_000 * i as i64);
                slot.insert(reconciler.stage("user_a", MessageBody::text(sends[i].text), staged_at));
                live += 1;
            }
            let local = locals[&i];

            match signal {
                Signal::Ack(i) => reconciler.confirm(local, stored(i, sends[i].text)),
                Signal::Feed(i) => {
                    reconciler.apply_stored(stored(i, sends[i].text));
                }
                Signal::Fail(_) => {
                    prop_assert!(reconciler.discard(local));
                    live -= 1;
                }
            }
            prop_assert_eq!(reconciler.len(), live);
        }

        let view = reconciler.view();
        let succeeded = sends.iter().filter(|s| !s.fails).count();
        prop_assert_eq!(view.len(), succeeded);
        prop_assert!(view.iter().all(|e| !e.is_pending()));

        let times: Vec<i64> = view.iter().map(|e| e.created_at.nanos()).collect();
        let mut sorted = times.clone();
        sorted.sort();
        prop_assert_eq!(times, sorted);
    }

    /// A counterpart's identical text is never swallowed by our pending entry
    #[test]
    fn counterpart_rows_always_append(text in text_strategy(), ours_first in prop::bool::ANY) {
        let mut reconciler = Reconciler::new("chat_1", chrono::Duration::seconds(30));
        let theirs = ChatMessage {
            sender_id: Some("user_b".into()),
            ..stored(7, text)
        };

        if ours_first {
            reconciler.stage("user_a", MessageBody::text(text), TimeStamp::from_nanos(BASE_NANOS));
            reconciler.apply_stored(theirs);
        } else {
            reconciler.apply_stored(theirs);
            reconciler.stage("user_a", MessageBody::text(text), TimeStamp::from_nanos(BASE_NANOS));
        }
        prop_assert_eq!(reconciler.len(), 2);
        prop_assert_eq!(reconciler.pending_len(), 1);
    }
}
