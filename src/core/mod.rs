pub mod alert;
pub mod error;
pub mod fingerprint;
pub mod kv;
pub mod store;
pub mod time;
pub mod types;
