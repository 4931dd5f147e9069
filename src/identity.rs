//! Current principal and session lifecycle
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub type UserId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn(UserId),
    SignedOut,
    TokenRefreshed(UserId),
}

pub type SessionListener = Box<dyn Fn(&SessionEvent) + Send + Sync>;
pub type ListenerId = u64;

/// Supplies the authenticated principal. Everything else about auth lives elsewhere.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<UserId>;
    fn on_session_change(&self, listener: SessionListener) -> ListenerId;
    fn remove_listener(&self, id: ListenerId);
}

/// In-process session holder, created at app start and handed to the engine.
#[derive(Default)]
pub struct SessionIdentity {
    user: RwLock<Option<UserId>>,
    listeners: RwLock<Vec<(ListenerId, SessionListener)>>,
    next_listener: AtomicU64,
}

impl SessionIdentity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signed_in(user: &str) -> Arc<Self> {
        let identity = Self::new();
        identity.sign_in(user);
        identity
    }

    pub fn sign_in(&self, user: &str) {
        if let Ok(mut slot) = self.user.write() {
            *slot = Some(user.to_string());
        }
        info!("session: signed in as {user}");
        self.notify(&SessionEvent::SignedIn(user.to_string()));
    }

    pub fn sign_out(&self) {
        if let Ok(mut slot) = self.user.write() {
            *slot = None;
        }
        info!("session: signed out");
        self.notify(&SessionEvent::SignedOut);
    }

    pub fn refresh_token(&self) {
        if let Some(user) = self.current_user() {
            self.notify(&SessionEvent::TokenRefreshed(user));
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().map_or(0, |listeners| listeners.len())
    }

    fn notify(&self, event: &SessionEvent) {
        if let Ok(listeners) = self.listeners.read() {
            for (_, listener) in listeners.iter() {
                listener(event);
            }
        }
    }
}

impl IdentityProvider for SessionIdentity {
    fn current_user(&self) -> Option<UserId> {
        self.user.read().ok().and_then(|slot| slot.clone())
    }

    fn on_session_change(&self, listener: SessionListener) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push((id, listener));
        }
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.retain(|(registered, _)| *registered != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn listeners_see_every_event() {
        let identity = SessionIdentity::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        identity.on_session_change(Box::new(move |event: &SessionEvent| {
            sink.lock().unwrap().push(event.clone());
        }));

        identity.sign_in("user_a");
        identity.refresh_token();
        identity.sign_out();
        identity.refresh_token();

        assert_eq!(identity.current_user(), None);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SessionEvent::SignedIn("user_a".into()),
                SessionEvent::TokenRefreshed("user_a".into()),
                SessionEvent::SignedOut,
            ]
        );
    }

    #[test]
    fn removed_listener_hears_nothing() {
        let identity = SessionIdentity::signed_in("user_a");
        let heard = Arc::new(Mutex::new(0));
        let counter = heard.clone();
        let id = identity.on_session_change(Box::new(move |_: &SessionEvent| {
            *counter.lock().unwrap() += 1;
        }));

        identity.refresh_token();
        identity.remove_listener(id);
        identity.sign_out();

        assert_eq!(*heard.lock().unwrap(), 1);
        assert_eq!(identity.listener_count(), 0);
    }
}
