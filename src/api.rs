//! Operator HTTP API: channel inspection, publishing and dead-letter repair.

pub mod channel;
pub mod dlq;
