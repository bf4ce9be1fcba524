//! SFU client session core.
//!
//! Owns the join lifecycle, the media socket, and the meeting state kept in
//! sync from server pushes. Pure Rust with no platform dependencies.
//! Consumed by native UI shells via UniFFI bindings.

pub mod breakout;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod events;
pub mod join;
pub mod media;
pub mod meeting_timer;
pub mod messages;
pub mod orchestrator;
pub mod participants;
pub mod polls;
pub mod provisioning;
pub mod recording;
pub mod reducer;
pub mod room;
pub mod signature;
pub mod single_flight;
pub mod socket;
pub mod state;
pub mod timer;
pub mod transport;
pub mod whiteboard;

pub use breakout::{BreakoutAssignment, BreakoutParticipant, BreakoutState};
pub use config::{ConfigStore, SessionConfig, Timings};
pub use credentials::{CredentialResolver, ExplicitCredentials, ResolvedCredentials};
pub use errors::SessionError;
pub use events::{Alert, AlertKind, EventEmitter, SessionEvent, SessionEventListener, StateSlice};
pub use join::{JoinOutcome, JoinProtocol, JoinRequest};
pub use media::{MediaKind, MediaState, MediaTransport, NoopMediaTransport};
pub use meeting_timer::MeetingTimer;
pub use messages::{Message, MessageLog};
pub use orchestrator::{Collaborators, SessionOrchestrator};
pub use participants::{Participant, Request, Roster, WaitingParticipant};
pub use polls::{NewPoll, Poll, PollState};
pub use provisioning::{
    ApiAuth, CreateRoomPayload, HttpProvisioning, JoinRoomPayload, RoomGrant,
    RoomProvisioningService,
};
pub use recording::{RecordingPhase, RecordingTimer, RecordingTimerMachine, RecordingTimerState};
pub use reducer::{Effect, EventReducer};
pub use socket::{LoadingIndicator, SocketAcquisition, SocketKind};
pub use state::{MeetingState, SessionContext, SessionState};
pub use whiteboard::{Shape, ShapeKind, WhiteboardState};
