//! Live view of one chat thread
//!
//! A [`ThreadSession`] subscribes to the thread's messages, its request row, its
//! stage log and the thread row itself. Feed events are folded into a
//! [`Reconciler`] together with the optimistic entries of sends issued through
//! the session. Dropping the session drops the subscriptions.
use super::error::NegotiationError;
use super::identity::{ListenerId, SessionEvent, UserId};
use super::listing::TimeStamp;
use super::reconcile::{Reconciler, ViewEntry};
use super::request::{DeliveryRequest, RequestStatus};
use super::service::{NegotiationService, NewState};
use super::stage::{Stage, StageEvent, StageProgress};
use super::store::{ChangeEvent, DurableStore, Subscription, Table, decode_row};
use super::thread::{ChatMessage, ChatThread, MessageBody, thread_prefix};
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// What the thread screen renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadView {
    pub thread_id: String,
    pub request_id: String,
    pub status: RequestStatus,
    pub stage_index: usize,
    pub delivered_at: Option<TimeStamp<Utc>>,
    pub summary: String,
    pub tracking_number: String,
    pub messages: Vec<ViewEntry>,
}

impl ThreadView {
    /// Free text input is only offered once the carrier accepted.
    pub fn can_chat(&self) -> bool {
        self.status == RequestStatus::Accepted
    }
}

struct Feeds {
    messages: Subscription,
    request: Subscription,
    stages: Subscription,
    thread: Subscription,
}

struct State {
    thread: ChatThread,
    request: DeliveryRequest,
    progress: StageProgress,
    reconciler: Reconciler,
    feeds: Feeds,
    deleted: bool,
}

pub struct ThreadSession<S: DurableStore> {
    service: Arc<NegotiationService<S>>,
    thread_id: String,
    viewer: UserId,
    state: Mutex<State>,
    closed: Arc<AtomicBool>,
    listener: ListenerId,
}

impl<S: DurableStore> ThreadSession<S> {
    /// Opens the thread for the signed-in user, who must be one of its parties.
    pub fn open(service: Arc<NegotiationService<S>>, thread_id: &str) -> Result<Self, NegotiationError> {
        let viewer = service
            .identity()
            .current_user()
            .ok_or_else(|| NegotiationError::Unauthorized {
                actor: None,
                entity: thread_id.to_string(),
            })?;

        // authorises the viewer and tells us which request to follow
        let first = service.snapshot(thread_id)?;
        let request_id = first.request.id.clone();

        let store = service.store();
        let lift = |e| NegotiationError::Transient {
            attempts: 1,
            source: e,
        };
        let feeds = Feeds {
            messages: store
                .subscribe(Table::Messages, &thread_prefix(thread_id))
                .map_err(lift)?,
            request: store.subscribe(Table::Requests, &request_id).map_err(lift)?,
            stages: store
                .subscribe(Table::Stages, &format!("{request_id}/"))
                .map_err(lift)?,
            thread: store.subscribe(Table::Threads, thread_id).map_err(lift)?,
        };

        // anything written between the first read and the subscriptions is in this one
        let snapshot = service.snapshot(thread_id)?;
        let mut reconciler = Reconciler::new(thread_id, service.config().dedup_window());
        reconciler.load(snapshot.messages);

        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::downgrade(&closed);
        let who = viewer.clone();
        let listener = service.identity().on_session_change(Box::new(move |event: &SessionEvent| {
            let Some(flag) = flag.upgrade() else {
                return;
            };
            match event {
                SessionEvent::SignedOut => flag.store(true, Ordering::SeqCst),
                SessionEvent::SignedIn(user) if *user != who => flag.store(true, Ordering::SeqCst),
                _ => {}
            }
        }));

        info!("thread {thread_id} opened by {viewer}");
        Ok(Self {
            thread_id: thread_id.to_string(),
            viewer,
            state: Mutex::new(State {
                thread: snapshot.thread,
                request: snapshot.request,
                progress: snapshot.progress,
                reconciler,
                feeds,
                deleted: false,
            }),
            closed,
            listener,
            service,
        })
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn viewer(&self) -> &str {
        &self.viewer
    }

    /// Current view without touching the feeds.
    pub fn view(&self) -> Result<ThreadView, NegotiationError> {
        let state = self.lock()?;
        Ok(render(&state))
    }

    /// Folds every queued feed event in. `Some` when the view changed.
    pub fn poll(&self) -> Result<Option<ThreadView>, NegotiationError> {
        self.ensure_open()?;
        let (request_id, half_written) = {
            let state = self.lock()?;
            let half_written =
                state.progress.is_complete() && state.request.status == RequestStatus::Accepted;
            (state.request.id.clone(), half_written)
        };
        // the status update behind the last stage was lost; the feeds bring the fix back
        if half_written {
            if let Err(e) = self.service.repair_request(&request_id) {
                warn!("request {request_id}: background repair failed: {e}");
            }
        }

        let mut state = self.lock()?;
        let changed = drain(&mut state)?;
        if state.deleted {
            return Err(NegotiationError::not_found("thread", &self.thread_id));
        }
        Ok(changed.then(|| render(&state)))
    }

    /// Blocks until the view changes or `timeout` runs out.
    pub fn wait_for_update(&self, timeout: Duration) -> Result<Option<ThreadView>, NegotiationError> {
        let deadline = Instant::now() + timeout;
        let step = self.service.config().feed_poll().min(Duration::from_millis(10));
        loop {
            if let Some(view) = self.poll()? {
                return Ok(Some(view));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // sleep outside the lock so sends are never held up
            std::thread::sleep(step.min(deadline - now).max(Duration::from_millis(1)));
        }
    }

    /// Re-reads the authoritative state, keeping pending sends.
    pub fn refresh(&self) -> Result<ThreadView, NegotiationError> {
        self.ensure_open()?;
        let snapshot = self.service.snapshot(&self.thread_id)?;
        let mut state = self.lock()?;
        state.thread = snapshot.thread;
        state.request = snapshot.request;
        state.progress = snapshot.progress;
        state.reconciler.load(snapshot.messages);
        Ok(render(&state))
    }

    /// Shows the message at once, writes it, then swaps in the stored row.
    pub fn send_message(&self, text: &str) -> Result<ChatMessage, NegotiationError> {
        self.ensure_open()?;
        let body = MessageBody::text(text);
        let local = {
            let mut state = self.lock()?;
            state
                .reconciler
                .stage(&self.viewer, body.clone(), TimeStamp::new())
        };

        let outcome = self.service.send_message(&self.thread_id, body);

        let mut state = self.lock()?;
        match outcome {
            Ok(NewState {
                message: Some(message),
                ..
            }) => {
                state.reconciler.confirm(local, message.clone());
                Ok(message)
            }
            Ok(_) => {
                state.reconciler.discard(local);
                Err(NegotiationError::Inconsistent {
                    entity: self.thread_id.clone(),
                    reason: "send returned no message".into(),
                })
            }
            Err(e) => {
                state.reconciler.discard(local);
                debug!("thread {}: send failed: {e}", self.thread_id);
                Err(e)
            }
        }
    }

    pub fn accept(&self) -> Result<ThreadView, NegotiationError> {
        let outcome = self.service.accept(&self.thread_id);
        self.settle(outcome)
    }

    pub fn refuse(&self) -> Result<ThreadView, NegotiationError> {
        let outcome = self.service.refuse(&self.thread_id);
        self.settle(outcome)
    }

    pub fn advance_stage(&self, stage: Stage) -> Result<ThreadView, NegotiationError> {
        let request_id = self.lock()?.request.id.clone();
        let outcome = self.service.advance_stage(&request_id, stage);
        self.settle(outcome)
    }

    // accept / refuse / advance confirm completion to the view before it moves on
    fn settle(&self, outcome: Result<NewState, NegotiationError>) -> Result<ThreadView, NegotiationError> {
        match outcome {
            Ok(_) => self.refresh(),
            Err(e @ NegotiationError::Conflict { .. }) => {
                // someone else moved first; show what they left
                if let Err(refresh) = self.refresh() {
                    warn!("thread {}: refresh after conflict failed: {refresh}", self.thread_id);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Unauthorized {
                actor: Some(self.viewer.clone()),
                entity: self.thread_id.clone(),
            });
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, NegotiationError> {
        self.state.lock().map_err(|_| NegotiationError::Inconsistent {
            entity: self.thread_id.clone(),
            reason: "session state poisoned".into(),
        })
    }
}

impl<S: DurableStore> Drop for ThreadSession<S> {
    fn drop(&mut self) {
        self.service.identity().remove_listener(self.listener);
        debug!("thread {} closed, feeds released", self.thread_id);
    }
}

fn render(state: &State) -> ThreadView {
    ThreadView {
        thread_id: state.thread.id.clone(),
        request_id: state.request.id.clone(),
        status: state.request.status,
        stage_index: state.progress.current_index(),
        delivered_at: state.progress.delivered_at().cloned(),
        summary: state.request.summary(),
        tracking_number: state.request.tracking_number.clone(),
        messages: state.reconciler.view(),
    }
}

fn drain(state: &mut State) -> Result<bool, NegotiationError> {
    let mut changed = false;
    let mut first_error = None;

    while let Some(event) = state.feeds.messages.try_next() {
        match event {
            ChangeEvent::Insert { key, row } | ChangeEvent::Update { key, row } => {
                match decode_row::<ChatMessage>(&key, &row) {
                    Ok(message) => changed |= state.reconciler.apply_stored(message),
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            ChangeEvent::Delete { key } => {
                let id = key.rsplit('/').next().unwrap_or(&key);
                changed |= state.reconciler.remove_stored(id);
            }
        }
    }

    while let Some(event) = state.feeds.request.try_next() {
        if let ChangeEvent::Insert { key, row } | ChangeEvent::Update { key, row } = event {
            match decode_row::<DeliveryRequest>(&key, &row) {
                Ok(request) if request.id == state.request.id => {
                    changed |= request != state.request;
                    state.request = request;
                }
                Ok(_) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
    }

    while let Some(event) = state.feeds.stages.try_next() {
        if let ChangeEvent::Insert { key, row } = event {
            match decode_row::<StageEvent>(&key, &row) {
                Ok(stage) => {
                    // our own reads may already hold it
                    if state.progress.events().iter().any(|e| e.stage == stage.stage) {
                        continue;
                    }
                    if let Err(reason) = state.progress.push(stage) {
                        warn!("stage feed out of sequence: {reason}");
                    } else {
                        changed = true;
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
    }

    while let Some(event) = state.feeds.thread.try_next() {
        match event {
            ChangeEvent::Insert { key, row } | ChangeEvent::Update { key, row } => {
                match decode_row::<ChatThread>(&key, &row) {
                    Ok(thread) if thread.id == state.thread.id => {
                        changed |= thread != state.thread;
                        state.thread = thread;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            ChangeEvent::Delete { key } if key == state.thread.id => {
                state.deleted = true;
                changed = true;
            }
            ChangeEvent::Delete { .. } => {}
        }
    }

    match first_error {
        Some(e) => Err(NegotiationError::Inconsistent {
            entity: state.thread.id.clone(),
            reason: e.to_string(),
        }),
        None => Ok(changed),
    }
}
