pub mod progress;
pub mod requests;
pub mod responses;
