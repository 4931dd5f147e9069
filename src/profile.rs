use super::identity::UserId;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Language {
    #[default]
    #[n(0)]
    Fr,
    #[n(1)]
    En,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Theme {
    #[default]
    #[n(0)]
    Light,
    #[n(1)]
    Dark,
}

// mirrored from the identity provider's principal
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    #[n(0)]
    pub user_id: UserId,
    #[n(1)]
    pub display_name: String,
    #[n(2)]
    pub phone: Option<String>,
    #[n(3)]
    pub language: Language,
    #[n(4)]
    pub theme: Theme,
    #[n(5)]
    pub avatar_url: Option<String>,
    #[n(6)]
    pub notifications_enabled: bool,
    #[n(7)]
    pub show_messages: bool,
    #[n(8)]
    pub membership_validated: bool, // adhesion approved by an admin
}

impl UserProfile {
    pub fn new(user_id: &str, display_name: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            notifications_enabled: true,
            show_messages: true,
            ..Self::default()
        }
    }
}
