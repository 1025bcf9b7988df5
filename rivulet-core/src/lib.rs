pub mod config;
pub mod record;
pub mod stream_log;
pub mod tool;
