pub mod clock;
pub mod events;
pub mod models;
pub mod timer;
