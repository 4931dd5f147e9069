//! Service layer API for the negotiation workflow
//!
//! Every command resolves the acting identity, checks it against the parties
//! captured on the chat thread, asks [`crate::machine::transition`] for the
//! next status and only then writes. The durable store stays the source of
//! truth; nothing here is cached between calls.
use super::adhesion::{Adhesion, AdhesionDetails};
use super::blob::{BlobStore, TableBlobStore};
use super::config::EngineConfig;
use super::error::{NegotiationError, StoreError, ValidationError};
use super::identity::{IdentityProvider, UserId};
use super::listing::{Listing, ListingDetails, TimeStamp};
use super::machine::{Command, Rejection, transition};
use super::profile::UserProfile;
use super::request::{DeliveryRequest, DeliveryRequestDetails, RequestStatus};
use super::stage::{Stage, StageEvent, StageProgress};
use super::store::{DurableStore, Guard, Table, WriteOp, decode_row, encode_row};
use super::thread::{ChatMessage, ChatThread, MessageBody, Role, thread_prefix};
use super::utils::{new_tracking_number, new_uuid_to_bech32};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// What a command leaves behind, for the issuing view to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewState {
    pub request_id: String,
    pub status: RequestStatus,
    pub stage_index: usize,
    pub message: Option<ChatMessage>,
}

/// Everything a thread screen needs, read in one go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub thread: ChatThread,
    pub request: DeliveryRequest,
    pub progress: StageProgress,
    pub messages: Vec<ChatMessage>,
}

pub struct NegotiationService<S: DurableStore> {
    store: Arc<S>,
    identity: Arc<dyn IdentityProvider>,
    blobs: Arc<dyn BlobStore>,
    config: EngineConfig,
    advancing: Mutex<HashSet<String>>,
}

// Clears the in-flight marker for a request when the advance finishes, whatever the outcome.
struct AdvanceSlot<'a> {
    set: &'a Mutex<HashSet<String>>,
    request_id: String,
}

impl Drop for AdvanceSlot<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.request_id);
        }
    }
}

pub(crate) fn new_record_id(hrp: &str) -> String {
    new_uuid_to_bech32(hrp).expect("record id prefixes are valid bech32 hrps")
}

impl<S: DurableStore + 'static> NegotiationService<S> {
    pub fn new(store: Arc<S>, identity: Arc<dyn IdentityProvider>, config: EngineConfig) -> Self {
        let blobs = Arc::new(TableBlobStore::new(store.clone()));
        Self::with_blob_store(store, identity, blobs, config)
    }
}

impl<S: DurableStore> NegotiationService<S> {
    pub fn with_blob_store(
        store: Arc<S>,
        identity: Arc<dyn IdentityProvider>,
        blobs: Arc<dyn BlobStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            identity,
            blobs,
            config,
            advancing: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ---- listings ----

    /// Publish a listing owned by the signed-in user.
    pub fn publish_listing(&self, details: ListingDetails) -> Result<Listing, NegotiationError> {
        let owner = self.actor("listing")?;
        let listing = details.finalise(new_record_id("annonce_"), owner)?;
        let row = encode_row(&listing).map_err(|e| self.lift(e, &listing.id))?;

        self.with_retry("publish listing", || {
            self.store.insert(Table::Listings, &listing.id, row.clone())
        })
        .map_err(|e| self.lift(e, &listing.id))?;

        info!(
            "listing {} published: {} -> {}",
            listing.id, listing.origin_city, listing.destination_city
        );
        Ok(listing)
    }

    pub fn update_listing(
        &self,
        listing_id: &str,
        details: ListingDetails,
    ) -> Result<Listing, NegotiationError> {
        let (current, raw) = self.load_listing_raw(listing_id)?;
        self.ensure_owner(&current)?;
        self.ensure_listing_editable(&current)?;

        let mut updated = details.finalise(current.id.clone(), current.owner_id.clone())?;
        updated.created_at = current.created_at.clone();
        let row = encode_row(&updated).map_err(|e| self.lift(e, listing_id))?;

        match self.with_retry("update listing", || {
            self.store.update(Table::Listings, listing_id, &raw, row.clone())
        }) {
            Ok(()) => {
                info!("listing {listing_id} updated");
                Ok(updated)
            }
            Err(StoreError::Conflict { .. }) => Err(NegotiationError::Conflict {
                entity: listing_id.to_string(),
                current: "a newer revision".into(),
            }),
            Err(e) => Err(self.lift(e, listing_id)),
        }
    }

    pub fn delete_listing(&self, listing_id: &str) -> Result<(), NegotiationError> {
        let (current, _) = self.load_listing_raw(listing_id)?;
        self.ensure_owner(&current)?;
        self.ensure_listing_editable(&current)?;

        self.with_retry("delete listing", || {
            self.store.delete(Table::Listings, listing_id)
        })
        .map_err(|e| self.lift(e, listing_id))?;
        info!("listing {listing_id} deleted");
        Ok(())
    }

    pub fn get_listing(&self, listing_id: &str) -> Result<Listing, NegotiationError> {
        self.load_listing_raw(listing_id).map(|(listing, _)| listing)
    }

    pub fn list_listings(&self) -> Result<Vec<Listing>, NegotiationError> {
        self.load_all(Table::Listings, "")
    }

    pub fn listings_by_owner(&self, owner_id: &str) -> Result<Vec<Listing>, NegotiationError> {
        let mut listings = self.list_listings()?;
        listings.retain(|l| l.owner_id == owner_id);
        Ok(listings)
    }

    // ---- delivery requests ----

    /// Create a delivery request against a listing together with its chat thread.
    pub fn create_delivery_request(
        &self,
        listing_id: &str,
        details: DeliveryRequestDetails,
    ) -> Result<(DeliveryRequest, ChatThread), NegotiationError> {
        let client = self.actor(listing_id)?;
        let listing = self.get_listing(listing_id)?;
        if listing.owner_id == client {
            return Err(NegotiationError::invalid(
                "listing",
                "a carrier cannot request delivery on their own listing",
            ));
        }
        let (recipient, parcel_name) = details.validate()?;

        let now = TimeStamp::new();
        let request = DeliveryRequest {
            id: new_record_id("req_"),
            listing_id: listing.id.clone(),
            thread_id: new_record_id("chat_"),
            requester_id: client.clone(),
            carrier_id: listing.owner_id.clone(),
            recipient,
            parcel_name,
            tracking_number: new_tracking_number(),
            status: RequestStatus::Pending,
            created_at: now.clone(),
        };
        let thread = ChatThread {
            id: request.thread_id.clone(),
            request_id: request.id.clone(),
            listing_id: listing.id.clone(),
            carrier_id: listing.owner_id,
            client_id: client,
            status: RequestStatus::Pending,
            created_at: now,
        };

        let writes = vec![
            WriteOp::Put {
                table: Table::Requests,
                key: request.id.clone(),
                row: encode_row(&request).map_err(|e| self.lift(e, &request.id))?,
            },
            WriteOp::Put {
                table: Table::Threads,
                key: thread.id.clone(),
                row: encode_row(&thread).map_err(|e| self.lift(e, &thread.id))?,
            },
        ];
        self.with_retry("create request", || self.store.apply(writes.clone()))
            .map_err(|e| self.lift(e, &request.id))?;

        info!(
            "request {} opened on {} with thread {}",
            request.id, listing_id, thread.id
        );
        Ok((request, thread))
    }

    pub fn get_request(&self, request_id: &str) -> Result<DeliveryRequest, NegotiationError> {
        self.load_raw(Table::Requests, "request", request_id)
            .map(|(request, _)| request)
    }

    pub fn requests_for_listing(
        &self,
        listing_id: &str,
    ) -> Result<Vec<DeliveryRequest>, NegotiationError> {
        let mut requests: Vec<DeliveryRequest> = self.load_all(Table::Requests, "")?;
        requests.retain(|r| r.listing_id == listing_id);
        Ok(requests)
    }

    /// Accepted and delivered requests carried by the signed-in user.
    pub fn active_deliveries(&self) -> Result<Vec<DeliveryRequest>, NegotiationError> {
        let carrier = self.actor("deliveries")?;
        let mut requests: Vec<DeliveryRequest> = self.load_all(Table::Requests, "")?;
        requests.retain(|r| r.carrier_id == carrier && r.status.is_committed());
        Ok(requests)
    }

    // ---- threads ----

    pub fn accept(&self, thread_id: &str) -> Result<NewState, NegotiationError> {
        self.answer(thread_id, Command::Accept)
    }

    pub fn refuse(&self, thread_id: &str) -> Result<NewState, NegotiationError> {
        self.answer(thread_id, Command::Refuse)
    }

    fn answer(&self, thread_id: &str, command: Command) -> Result<NewState, NegotiationError> {
        let (thread, _) = self.load_thread_raw(thread_id)?;
        let (actor, role) = self.party(&thread)?;
        let (request, request_raw) = self.load_request_raw(&thread.request_id)?;

        let next = transition(request.status, role, command, &StageProgress::default())
            .map_err(|r| self.reject(&request, r))?;

        let body = match next {
            RequestStatus::Accepted => MessageBody::Confirmation {
                rendered: request.acceptance_notice(),
                tracking_number: Some(request.tracking_number.clone()),
            },
            _ => MessageBody::Confirmation {
                rendered: request.refusal_notice(),
                tracking_number: None,
            },
        };
        let message = ChatMessage {
            id: new_record_id("msg_"),
            thread_id: thread.id.clone(),
            request_id: request.id.clone(),
            sender_id: None,
            body,
            created_at: TimeStamp::new(),
        };

        let updated = request.with_status(next);
        let writes = vec![
            self.put(Table::Requests, &request.id, &updated)?,
            self.put(Table::Threads, &thread.id, &thread.with_status(next))?,
            self.put(Table::Messages, &message.store_key(), &message)?,
        ];
        let guard = Guard {
            table: Table::Requests,
            key: request.id.clone(),
            expected: request_raw,
        };

        match self.with_retry("answer request", || {
            self.store.apply_if(&guard, writes.clone())
        }) {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => return Err(self.conflict(&request.id)),
            Err(e) => return Err(self.lift(e, &request.id)),
        }

        info!("request {} {} by {actor}", request.id, next);
        Ok(NewState {
            request_id: request.id,
            status: next,
            stage_index: 0,
            message: Some(message),
        })
    }

    /// Post a message to a thread. Free text needs an accepted request.
    pub fn send_message(
        &self,
        thread_id: &str,
        body: MessageBody,
    ) -> Result<NewState, NegotiationError> {
        if let MessageBody::Text { text } = &body {
            if text.trim().is_empty() {
                return Err(ValidationError::EmptyMessage.into());
            }
        }
        let (thread, _) = self.load_thread_raw(thread_id)?;
        let (actor, role) = self.party(&thread)?;
        let request = self.get_request(&thread.request_id)?;

        transition(
            request.status,
            role,
            Command::SendMessage {
                free_text: body.is_free_text(),
            },
            &StageProgress::default(),
        )
        .map_err(|r| self.reject(&request, r))?;

        let message = ChatMessage {
            id: new_record_id("msg_"),
            thread_id: thread.id.clone(),
            request_id: request.id.clone(),
            sender_id: Some(actor),
            body,
            created_at: TimeStamp::new(),
        };
        let row = encode_row(&message).map_err(|e| self.lift(e, &message.id))?;
        let key = message.store_key();
        self.with_retry("send message", || {
            self.store.insert(Table::Messages, &key, row.clone())
        })
        .map_err(|e| self.lift(e, thread_id))?;

        debug!("message {} posted to {thread_id}", message.id);
        Ok(NewState {
            request_id: request.id,
            status: request.status,
            stage_index: self.load_progress(&thread.request_id)?.current_index(),
            message: Some(message),
        })
    }

    /// Upload a document and post it to the thread as an attachment.
    pub fn attach_document(
        &self,
        thread_id: &str,
        file_name: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<NewState, NegotiationError> {
        let (thread, _) = self.load_thread_raw(thread_id)?;
        let (_, role) = self.party(&thread)?;
        let request = self.get_request(&thread.request_id)?;
        transition(
            request.status,
            role,
            Command::SendMessage { free_text: false },
            &StageProgress::default(),
        )
        .map_err(|r| self.reject(&request, r))?;

        let path = format!("threads/{thread_id}/{file_name}");
        let url = self
            .with_retry("upload document", || {
                self.blobs.upload(&path, bytes, content_type)
            })
            .map_err(|e| self.lift(e, &path))?;

        self.send_message(
            thread_id,
            MessageBody::Attachment {
                url,
                content_type: content_type.to_string(),
            },
        )
    }

    /// Either party may drop the conversation. The request itself is kept.
    pub fn delete_conversation(&self, thread_id: &str) -> Result<(), NegotiationError> {
        let (thread, _) = self.load_thread_raw(thread_id)?;
        let (actor, _) = self.party(&thread)?;

        let mut writes: Vec<WriteOp> = self
            .with_retry("list messages", || {
                self.store.query(Table::Messages, &thread_prefix(thread_id))
            })
            .map_err(|e| self.lift(e, thread_id))?
            .into_iter()
            .map(|(key, _)| WriteOp::Delete {
                table: Table::Messages,
                key,
            })
            .collect();
        writes.push(WriteOp::Delete {
            table: Table::Threads,
            key: thread_id.to_string(),
        });

        self.with_retry("delete conversation", || self.store.apply(writes.clone()))
            .map_err(|e| self.lift(e, thread_id))?;
        info!("thread {thread_id} deleted by {actor}");
        Ok(())
    }

    /// Threads where the signed-in user is the carrier.
    pub fn carrier_threads(&self) -> Result<Vec<ChatThread>, NegotiationError> {
        let me = self.actor("threads")?;
        let mut threads: Vec<ChatThread> = self.load_all(Table::Threads, "")?;
        threads.retain(|t| t.carrier_id == me);
        Ok(threads)
    }

    /// Threads where the signed-in user is the client.
    pub fn client_threads(&self) -> Result<Vec<ChatThread>, NegotiationError> {
        let me = self.actor("threads")?;
        let mut threads: Vec<ChatThread> = self.load_all(Table::Threads, "")?;
        threads.retain(|t| t.client_id == me);
        Ok(threads)
    }

    /// Authoritative state of a thread for one of its parties.
    ///
    /// Also heals what an interrupted write left behind: a complete stage log
    /// under an `accepted` request, or a thread mirror that lags its request.
    pub fn snapshot(&self, thread_id: &str) -> Result<ThreadSnapshot, NegotiationError> {
        let (mut thread, mut thread_raw) = self.load_thread_raw(thread_id)?;
        self.party(&thread)?;
        let mut request = self.get_request(&thread.request_id)?;
        let progress = self.load_progress(&request.id)?;

        if needs_delivery(&request, &progress) {
            warn!("request {}: stage log complete but request still {}", request.id, request.status);
            self.finish_delivery(&request.id)?;
            request = self.get_request(&request.id)?;
            (thread, thread_raw) = self.load_thread_raw(thread_id)?;
        }

        if thread.status != request.status {
            // the request row wins; bring the mirror back in line
            warn!(
                "thread {} says {} but request {} says {}",
                thread.id, thread.status, request.id, request.status
            );
            let repaired = thread.with_status(request.status);
            match encode_row(&repaired) {
                Ok(row) => {
                    if let Err(e) = self.store.update(Table::Threads, thread_id, &thread_raw, row) {
                        debug!("thread mirror repair skipped: {e}");
                    }
                }
                Err(e) => warn!("thread {thread_id}: mirror repair not encodable: {e}"),
            }
            thread = repaired;
        }

        let messages = self.messages(thread_id)?;
        Ok(ThreadSnapshot {
            thread,
            request,
            progress,
            messages,
        })
    }

    pub(crate) fn messages(&self, thread_id: &str) -> Result<Vec<ChatMessage>, NegotiationError> {
        self.load_all(Table::Messages, &thread_prefix(thread_id))
    }

    // ---- delivery stages ----

    pub fn current_stage_index(&self, request_id: &str) -> Result<usize, NegotiationError> {
        Ok(self.load_progress(request_id)?.current_index())
    }

    pub fn stage_progress(&self, request_id: &str) -> Result<StageProgress, NegotiationError> {
        self.load_progress(request_id)
    }

    pub fn can_advance(&self, request_id: &str, actor: &str) -> Result<bool, NegotiationError> {
        let request = self.get_request(request_id)?;
        let progress = self.load_progress(request_id)?;
        Ok(request.carrier_id == actor
            && request.status == RequestStatus::Accepted
            && progress.current_index() < Stage::SEQUENCE.len())
    }

    /// Record the next delivery stage. `Completed` also marks the request delivered.
    pub fn advance_stage(
        &self,
        request_id: &str,
        stage: Stage,
    ) -> Result<NewState, NegotiationError> {
        let request = self.get_request(request_id)?;
        // the thread may be gone; the parties captured on the request still hold
        let (actor, role) = self.request_party(&request)?;
        let _slot = self.claim_advance(request_id)?;

        let progress = self.load_progress(request_id)?;
        if stage == Stage::Completed
            && progress.is_complete()
            && request.status == RequestStatus::Accepted
            && role == Role::Carrier
        {
            // a previous completion got the event in but not the status
            warn!("request {request_id}: completion already recorded, retrying status");
            self.finish_delivery(request_id)?;
            return Ok(NewState {
                request_id: request_id.to_string(),
                status: RequestStatus::Delivered,
                stage_index: progress.current_index(),
                message: None,
            });
        }

        let next = transition(request.status, role, Command::AdvanceStage(stage), &progress)
            .map_err(|r| self.reject(&request, r))?;

        let event = StageEvent::new(request_id, stage);
        let row = encode_row(&event).map_err(|e| self.lift(e, request_id))?;
        let key = event.store_key();
        match self.with_retry("append stage", || {
            self.store.insert(Table::Stages, &key, row.clone())
        }) {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => {
                let current = self.load_progress(request_id)?;
                return Err(NegotiationError::Conflict {
                    entity: request_id.to_string(),
                    current: format!("stage {}", current.current_index()),
                });
            }
            Err(e) => return Err(self.lift(e, request_id)),
        }
        info!("request {request_id}: stage {stage} recorded by {actor}");

        if stage == Stage::Completed {
            if let Err(e) = self.finish_delivery(request_id) {
                error!("request {request_id}: delivered event stored but status not updated: {e}");
                return Err(NegotiationError::Inconsistent {
                    entity: request_id.to_string(),
                    reason: format!("completion recorded, status update failed: {e}"),
                });
            }
        }

        Ok(NewState {
            request_id: request_id.to_string(),
            status: next,
            stage_index: progress.current_index() + 1,
            message: None,
        })
    }

    /// Bring a request's status in line with its stage log.
    pub fn repair_request(&self, request_id: &str) -> Result<RequestStatus, NegotiationError> {
        let request = self.get_request(request_id)?;
        let progress = self.load_progress(request_id)?;
        if needs_delivery(&request, &progress) {
            self.finish_delivery(request_id)?;
            return Ok(RequestStatus::Delivered);
        }
        Ok(request.status)
    }

    /// Whether the stored stage log is complete while the request still says `accepted`.
    pub fn needs_repair(&self, request_id: &str) -> Result<bool, NegotiationError> {
        let request = self.get_request(request_id)?;
        let progress = self.load_progress(request_id)?;
        Ok(needs_delivery(&request, &progress))
    }

    /// Finds every request left half written by an interrupted completion and repairs it.
    pub fn retry_inconsistent(
        &self,
    ) -> Result<Vec<(String, Result<RequestStatus, NegotiationError>)>, NegotiationError> {
        let accepted: Vec<DeliveryRequest> = self
            .load_all::<DeliveryRequest>(Table::Requests, "")?
            .into_iter()
            .filter(|r| r.status == RequestStatus::Accepted)
            .collect();

        let mut repaired = Vec::new();
        for request in accepted {
            if !self.load_progress(&request.id)?.is_complete() {
                continue;
            }
            let outcome = self.repair_request(&request.id);
            if let Err(e) = &outcome {
                warn!("request {} still inconsistent: {e}", request.id);
            }
            repaired.push((request.id, outcome));
        }
        Ok(repaired)
    }

    fn finish_delivery(&self, request_id: &str) -> Result<(), NegotiationError> {
        for _ in 0..self.config.max_attempts.max(1) {
            let (request, raw) = self.load_request_raw(request_id)?;
            match request.status {
                RequestStatus::Delivered => return Ok(()),
                RequestStatus::Accepted => {}
                other => {
                    return Err(NegotiationError::Inconsistent {
                        entity: request_id.to_string(),
                        reason: format!("stage log complete but request is {other}"),
                    });
                }
            }

            let mut writes = vec![self.put(
                Table::Requests,
                request_id,
                &request.with_status(RequestStatus::Delivered),
            )?];
            let thread_row = self
                .with_retry("load thread", || self.store.get(Table::Threads, &request.thread_id))
                .map_err(|e| self.lift(e, &request.thread_id))?;
            // a deleted conversation has no mirror left to update
            if let Some(row) = thread_row {
                let thread: ChatThread = decode_row(&request.thread_id, &row)
                    .map_err(|e| self.lift(e, &request.thread_id))?;
                writes.push(self.put(
                    Table::Threads,
                    &thread.id,
                    &thread.with_status(RequestStatus::Delivered),
                )?);
            }
            let guard = Guard {
                table: Table::Requests,
                key: request_id.to_string(),
                expected: raw,
            };
            match self.with_retry("mark delivered", || {
                self.store.apply_if(&guard, writes.clone())
            }) {
                Ok(()) => {
                    info!("request {request_id} delivered");
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(self.lift(e, request_id)),
            }
        }
        Err(self.conflict(request_id))
    }

    fn claim_advance(&self, request_id: &str) -> Result<AdvanceSlot<'_>, NegotiationError> {
        let mut set = self.advancing.lock().map_err(|_| NegotiationError::Inconsistent {
            entity: request_id.to_string(),
            reason: "stage lock poisoned".into(),
        })?;
        if !set.insert(request_id.to_string()) {
            return Err(NegotiationError::invalid(
                "accepted",
                "a stage update for this delivery is already in flight",
            ));
        }
        Ok(AdvanceSlot {
            set: &self.advancing,
            request_id: request_id.to_string(),
        })
    }

    // ---- profiles ----

    /// Writes the caller's own profile. Membership validation is an admin decision
    /// and keeps whatever the store already says.
    pub fn save_profile(&self, profile: UserProfile) -> Result<UserProfile, NegotiationError> {
        let me = self.actor("profile")?;
        if profile.user_id != me {
            return Err(NegotiationError::Unauthorized {
                actor: Some(me),
                entity: format!("profile {}", profile.user_id),
            });
        }
        let validated = self
            .get_profile(&me)?
            .is_some_and(|stored| stored.membership_validated);
        if profile.membership_validated != validated {
            warn!("{me} tried to set their own membership flag");
        }
        let profile = UserProfile {
            membership_validated: validated,
            ..profile
        };

        let write = self.put(Table::Profiles, &profile.user_id, &profile)?;
        self.with_retry("save profile", || self.store.apply(vec![write.clone()]))
            .map_err(|e| self.lift(e, &profile.user_id))?;
        Ok(profile)
    }

    pub fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, NegotiationError> {
        match self.load_raw::<UserProfile>(Table::Profiles, "profile", user_id) {
            Ok((profile, _)) => Ok(Some(profile)),
            Err(NegotiationError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ---- membership ----

    /// Upload the applicant's papers and a signed contract, then file the
    /// application for review. One application per user.
    pub fn submit_adhesion(&self, details: AdhesionDetails) -> Result<Adhesion, NegotiationError> {
        let me = self.actor("adhesion")?;
        let application = details.validate()?;
        if self.get_adhesion(&me)?.is_some() {
            return Err(NegotiationError::invalid(
                "submitted",
                "a membership application is already on file",
            ));
        }

        let mut document_urls = Vec::with_capacity(application.documents.len());
        for (path, (_, document)) in application
            .upload_paths(&me)
            .into_iter()
            .zip(&application.documents)
        {
            let url = self
                .with_retry("upload adhesion document", || {
                    self.blobs.upload(&path, &document.bytes, &document.content_type)
                })
                .map_err(|e| self.lift(e, &path))?;
            document_urls.push(url);
        }

        let submitted_at = TimeStamp::new();
        let contract_path = format!("adhesions/{me}/contract_{}.txt", submitted_at.nanos());
        let contract = application.contract(&submitted_at);
        let contract_url = self
            .with_retry("upload contract", || {
                self.blobs.upload(&contract_path, contract.as_bytes(), "text/plain")
            })
            .map_err(|e| self.lift(e, &contract_path))?;

        let adhesion = Adhesion {
            user_id: me.clone(),
            full_name: application.full_name,
            email: application.email,
            document_urls,
            contract_url,
            validated: false,
            submitted_at,
        };
        let row = encode_row(&adhesion).map_err(|e| self.lift(e, &me))?;
        match self.with_retry("file adhesion", || {
            self.store.insert(Table::Adhesions, &me, row.clone())
        }) {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => {
                return Err(NegotiationError::Conflict {
                    entity: format!("adhesion {me}"),
                    current: "submitted".into(),
                });
            }
            Err(e) => return Err(self.lift(e, &me)),
        }

        info!("membership application filed by {me}");
        Ok(adhesion)
    }

    pub fn get_adhesion(&self, user_id: &str) -> Result<Option<Adhesion>, NegotiationError> {
        match self.load_raw::<Adhesion>(Table::Adhesions, "adhesion", user_id) {
            Ok((adhesion, _)) => Ok(Some(adhesion)),
            Err(NegotiationError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ---- helpers ----

    fn actor(&self, entity: &str) -> Result<UserId, NegotiationError> {
        self.identity
            .current_user()
            .ok_or_else(|| NegotiationError::Unauthorized {
                actor: None,
                entity: entity.to_string(),
            })
    }

    fn party(&self, thread: &ChatThread) -> Result<(UserId, Role), NegotiationError> {
        let actor = self.actor(&thread.id)?;
        match thread.role_of(&actor) {
            Some(role) => Ok((actor, role)),
            None => {
                warn!("{actor} tried to act on thread {}", thread.id);
                Err(NegotiationError::Unauthorized {
                    actor: Some(actor),
                    entity: thread.id.clone(),
                })
            }
        }
    }

    fn request_party(&self, request: &DeliveryRequest) -> Result<(UserId, Role), NegotiationError> {
        let actor = self.actor(&request.id)?;
        match request.role_of(&actor) {
            Some(role) => Ok((actor, role)),
            None => {
                warn!("{actor} tried to act on request {}", request.id);
                Err(NegotiationError::Unauthorized {
                    actor: Some(actor),
                    entity: request.id.clone(),
                })
            }
        }
    }

    fn ensure_owner(&self, listing: &Listing) -> Result<(), NegotiationError> {
        let actor = self.actor(&listing.id)?;
        if actor != listing.owner_id {
            return Err(NegotiationError::Unauthorized {
                actor: Some(actor),
                entity: listing.id.clone(),
            });
        }
        Ok(())
    }

    fn ensure_listing_editable(&self, listing: &Listing) -> Result<(), NegotiationError> {
        if let Some(committed) = self
            .requests_for_listing(&listing.id)?
            .into_iter()
            .find(|r| r.status.is_committed())
        {
            return Err(NegotiationError::invalid(
                committed.status,
                format!(
                    "listing {} is locked by delivery request {}",
                    listing.id, committed.id
                ),
            ));
        }
        Ok(())
    }

    fn reject(&self, request: &DeliveryRequest, rejection: Rejection) -> NegotiationError {
        match rejection {
            Rejection::Conflict(current) => {
                debug!("request {} already {current}", request.id);
                NegotiationError::Conflict {
                    entity: request.id.clone(),
                    current: current.to_string(),
                }
            }
            Rejection::Invalid(reason) => NegotiationError::invalid(request.status, reason),
        }
    }

    // re-reads the request so the caller sees what the other writer left
    fn conflict(&self, request_id: &str) -> NegotiationError {
        match self.get_request(request_id) {
            Ok(current) => NegotiationError::Conflict {
                entity: request_id.to_string(),
                current: current.status.to_string(),
            },
            Err(e) => e,
        }
    }

    fn with_retry<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 1;
        loop {
            match op() {
                Err(StoreError::Unavailable(reason)) if attempt < self.config.max_attempts => {
                    let wait = self.config.backoff_for(attempt);
                    warn!("{what}: store unavailable ({reason}), attempt {attempt}, retrying in {wait:?}");
                    std::thread::sleep(wait);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn lift(&self, err: StoreError, entity: &str) -> NegotiationError {
        match err {
            StoreError::Unavailable(_) => NegotiationError::Transient {
                attempts: self.config.max_attempts,
                source: err,
            },
            StoreError::Conflict { .. } => NegotiationError::Conflict {
                entity: entity.to_string(),
                current: "changed".into(),
            },
            StoreError::Corrupt { .. } => NegotiationError::Inconsistent {
                entity: entity.to_string(),
                reason: err.to_string(),
            },
        }
    }

    fn put<T: minicbor::Encode<()>>(
        &self,
        table: Table,
        key: &str,
        row: &T,
    ) -> Result<WriteOp, NegotiationError> {
        Ok(WriteOp::Put {
            table,
            key: key.to_string(),
            row: encode_row(row).map_err(|e| self.lift(e, key))?,
        })
    }

    fn load_raw<T>(
        &self,
        table: Table,
        kind: &'static str,
        key: &str,
    ) -> Result<(T, Vec<u8>), NegotiationError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        let raw = self
            .with_retry("load", || self.store.get(table, key))
            .map_err(|e| self.lift(e, key))?
            .ok_or_else(|| NegotiationError::not_found(kind, key))?;
        let row = decode_row(key, &raw).map_err(|e| self.lift(e, key))?;
        Ok((row, raw))
    }

    fn load_all<T>(&self, table: Table, prefix: &str) -> Result<Vec<T>, NegotiationError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        self.with_retry("query", || self.store.query(table, prefix))
            .map_err(|e| self.lift(e, prefix))?
            .into_iter()
            .map(|(key, raw)| decode_row(&key, &raw).map_err(|e| self.lift(e, &key)))
            .collect()
    }

    fn load_listing_raw(&self, id: &str) -> Result<(Listing, Vec<u8>), NegotiationError> {
        self.load_raw(Table::Listings, "listing", id)
    }

    fn load_thread_raw(&self, id: &str) -> Result<(ChatThread, Vec<u8>), NegotiationError> {
        self.load_raw(Table::Threads, "thread", id)
    }

    fn load_request_raw(&self, id: &str) -> Result<(DeliveryRequest, Vec<u8>), NegotiationError> {
        self.load_raw(Table::Requests, "request", id)
    }

    fn load_progress(&self, request_id: &str) -> Result<StageProgress, NegotiationError> {
        let events: Vec<StageEvent> = self.load_all(Table::Stages, &format!("{request_id}/"))?;
        StageProgress::from_events(events).map_err(|reason| NegotiationError::Inconsistent {
            entity: request_id.to_string(),
            reason,
        })
    }
}

fn needs_delivery(request: &DeliveryRequest, progress: &StageProgress) -> bool {
    progress.is_complete() && request.status == RequestStatus::Accepted
}
