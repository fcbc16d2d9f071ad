pub mod commands;
pub mod store;
pub mod sync_flush;
pub mod timer_session;
