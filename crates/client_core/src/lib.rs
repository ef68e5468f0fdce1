//! Client side of call signaling: the call session controller and the
//! collaborators it drives (relay connection, REST orchestration, media room).

pub mod call;
pub mod media;
pub mod orchestrator;
pub mod transport;

pub use call::{
    ActiveCall, AllowAllDevices, CallControllerConfig, CallDirection, CallError, CallEvent,
    CallIdentity, CallNotice, CallSessionController, CallSnapshot, CallState, IncomingCall,
    MediaDevices, Ringer, SilentRinger,
};
pub use media::{MediaError, MediaEvent, MediaSession, MissingLiveKitConnector, RemoteTracks};
pub use orchestrator::{
    CallOrchestrator, HttpCallOrchestrator, MissingCallOrchestrator, OrchestratorError,
};
pub use transport::{ConnectionManager, SignalingTransport, TransportError, WsSignalingConnection};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
