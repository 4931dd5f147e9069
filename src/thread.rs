//! Chat threads and their messages
use super::identity::UserId;
use super::listing::TimeStamp;
use super::request::RequestStatus;
use chrono::Utc;

/// Which side of a thread an identity sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Carrier,
    Client,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ChatThread {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub request_id: String,
    #[n(2)]
    pub listing_id: String,
    #[n(3)]
    pub carrier_id: UserId,
    #[n(4)]
    pub client_id: UserId,
    #[n(5)]
    pub status: RequestStatus, // mirror of the request's status
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
}

impl ChatThread {
    pub fn role_of(&self, user: &str) -> Option<Role> {
        if user == self.carrier_id {
            Some(Role::Carrier)
        } else if user == self.client_id {
            Some(Role::Client)
        } else {
            None
        }
    }

    pub(crate) fn with_status(&self, status: RequestStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    #[n(0)]
    Text {
        #[n(0)]
        text: String,
    },
    #[n(1)]
    Confirmation {
        #[n(0)]
        rendered: String,
        #[n(1)]
        tracking_number: Option<String>,
    },
    #[n(2)]
    Attachment {
        #[n(0)]
        url: String,
        #[n(1)]
        content_type: String,
    },
}

impl MessageBody {
    pub fn text(text: &str) -> Self {
        MessageBody::Text {
            text: text.to_string(),
        }
    }

    /// Plain chat is gated on acceptance, everything else is system authored.
    pub fn is_free_text(&self) -> bool {
        matches!(self, MessageBody::Text { .. })
    }

    pub fn display(&self) -> &str {
        match self {
            MessageBody::Text { text } => text,
            MessageBody::Confirmation { rendered, .. } => rendered,
            MessageBody::Attachment { url, .. } => url,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub thread_id: String,
    #[n(2)]
    pub request_id: String,
    #[n(3)]
    pub sender_id: Option<UserId>, // None for system authored confirmations
    #[n(4)]
    pub body: MessageBody,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
}

impl ChatMessage {
    /// Store key: sorts by creation time inside a thread.
    pub fn store_key(&self) -> String {
        message_key(&self.thread_id, &self.created_at, &self.id)
    }
}

pub(crate) fn message_key(thread_id: &str, created_at: &TimeStamp<Utc>, id: &str) -> String {
    format!("{thread_id}/{:020}/{id}", created_at.nanos().max(0))
}

pub(crate) fn thread_prefix(thread_id: &str) -> String {
    format!("{thread_id}/")
}
