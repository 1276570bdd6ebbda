pub mod request_context;
pub mod usage_log;
