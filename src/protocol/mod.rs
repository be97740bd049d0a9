pub mod client_events;
pub mod gemini;
pub mod models;
pub mod server_events;
