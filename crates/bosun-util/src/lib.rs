//! Plumbing shared by the bosun server, client, and helper binaries.

pub mod fs;
pub mod log;
pub mod sys;
pub mod tls;
