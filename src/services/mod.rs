pub mod attempt_api;
pub mod flags;
pub mod payload;
pub mod retry;
pub mod status;
