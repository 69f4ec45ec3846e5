pub mod activation;
pub mod event;
pub mod session;

pub use activation::{GlobalActivationState, GroupActivationOverride};
pub use event::{EventFilter, EventKind, EventLogEntry, NewEvent};
pub use session::{
    AuthMethod, ChallengeUpdate, NewSession, SessionRecord, SessionStatus, StatusUpdate,
};
