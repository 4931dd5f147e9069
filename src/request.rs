//! Delivery requests: a client's ask to ship a parcel through a listing
use super::error::ValidationError;
use super::identity::UserId;
use super::listing::{TimeStamp, non_empty};
use super::thread::Role;
use chrono::Utc;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Accepted,
    #[n(2)]
    Refused,
    #[n(3)]
    Delivered,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Refused | RequestStatus::Delivered)
    }

    /// Accepted or delivered: the carrier has committed to the parcel.
    pub fn is_committed(&self) -> bool {
        matches!(self, RequestStatus::Accepted | RequestStatus::Delivered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Refused => "refused",
            RequestStatus::Delivered => "delivered",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub address: String,
    #[n(2)]
    pub city: String,
}

// Draft filled in by the client on a listing's detail screen
#[derive(Debug, Default, Clone)]
pub struct DeliveryRequestDetails {
    recipient_name: Option<String>,
    delivery_address: Option<String>,
    destination_city: Option<String>,
    parcel_name: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub listing_id: String,
    #[n(2)]
    pub thread_id: String,
    #[n(3)]
    pub requester_id: UserId,
    #[n(4)]
    pub carrier_id: UserId,
    #[n(5)]
    pub recipient: Recipient,
    #[n(6)]
    pub parcel_name: String,
    #[n(7)]
    pub tracking_number: String,
    #[n(8)]
    pub status: RequestStatus,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
}

impl DeliveryRequestDetails {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_recipient(mut self, name: &str, address: &str, city: &str) -> Self {
        self.recipient_name = Some(name.to_string());
        self.delivery_address = Some(address.to_string());
        self.destination_city = Some(city.to_string());
        self
    }
    pub fn set_parcel_name(mut self, parcel: &str) -> Self {
        self.parcel_name = Some(parcel.to_string());
        self
    }
    pub(crate) fn validate(self) -> Result<(Recipient, String), ValidationError> {
        let recipient = Recipient {
            name: non_empty(self.recipient_name, "Recipient name")?,
            address: non_empty(self.delivery_address, "Delivery address")?,
            city: non_empty(self.destination_city, "Destination city")?,
        };
        let parcel = non_empty(self.parcel_name, "Parcel name")?;
        Ok((recipient, parcel))
    }
}

impl DeliveryRequest {
    pub fn role_of(&self, user: &str) -> Option<Role> {
        if user == self.carrier_id {
            Some(Role::Carrier)
        } else if user == self.requester_id {
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

// Every user-facing sentence the engine produces lives here.
impl DeliveryRequest {
    /// The opening text shown to the carrier above the accept / refuse buttons.
    pub fn summary(&self) -> String {
        format!(
            "{} asks you to deliver \"{}\" to \"{}\" in {}. Do you accept?",
            self.recipient.name, self.parcel_name, self.recipient.address, self.recipient.city
        )
    }

    pub fn acceptance_notice(&self) -> String {
        format!(
            "Your request has been accepted. Your parcel tracking number is: {}",
            self.tracking_number
        )
    }

    pub fn refusal_notice(&self) -> String {
        "Your request has been refused.".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_parcel_name_rejected() {
        let err = DeliveryRequestDetails::new()
            .set_recipient("Awa Diop", "12 rue Carnot", "Dakar")
            .validate()
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField("Parcel name"));
    }

    #[test]
    fn terminal_states() {
        assert!(RequestStatus::Refused.is_terminal());
        assert!(RequestStatus::Delivered.is_terminal());
        assert!(!RequestStatus::Accepted.is_terminal());
        assert!(RequestStatus::Accepted.is_committed());
        assert!(!RequestStatus::Pending.is_committed());
    }

    #[test]
    fn parties_come_from_the_request() {
        let request = DeliveryRequest {
            id: "req_1".into(),
            listing_id: "annonce_1".into(),
            thread_id: "chat_1".into(),
            requester_id: "user_client".into(),
            carrier_id: "user_gp".into(),
            recipient: Recipient {
                name: "Awa Diop".into(),
                address: "12 rue Carnot".into(),
                city: "Dakar".into(),
            },
            parcel_name: "Books".into(),
            tracking_number: "GP-0A1B2C3D-000000000001".into(),
            status: RequestStatus::Accepted,
            created_at: TimeStamp::new(),
        };
        assert_eq!(request.role_of("user_gp"), Some(Role::Carrier));
        assert_eq!(request.role_of("user_client"), Some(Role::Client));
        assert_eq!(request.role_of("user_other"), None);
        assert!(request.acceptance_notice().ends_with("GP-0A1B2C3D-000000000001"));
    }
}
