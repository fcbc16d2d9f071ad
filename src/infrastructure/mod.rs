pub mod background_timer;
pub mod command_log;
pub mod config;
pub mod day_cache;
pub mod dirty_buffer;
pub mod error;
pub mod task_repository;
