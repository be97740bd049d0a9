pub mod policy;
pub mod state;

pub use policy::ReconnectPolicy;
pub use state::{ConnectionState, ConnectionStateMachine, StateTransitionEvent};
