pub mod adhesion;
pub mod blob;
pub mod config;
pub mod error;
pub mod identity;
pub mod listing;
pub mod machine;
pub mod profile;
pub mod reconcile;
pub mod request;
pub mod service;
pub mod session;
pub mod stage;
pub mod store;
pub mod thread;
pub mod utils;

pub use error::{ErrorClass, NegotiationError, StoreError, ValidationError};
pub use service::{NegotiationService, NewState, ThreadSnapshot};
pub use session::{ThreadSession, ThreadView};
