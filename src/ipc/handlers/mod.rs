pub mod academy;
pub mod attendance;
pub mod core;
pub mod roster;
pub mod setup;
