//! Sample domains wired onto the leasehold engine.

pub mod mail;
pub mod thumbnails;
