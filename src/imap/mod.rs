//! IMAP connector: `ImapEngine` implements `ProtocolEngine` over async-imap.

pub mod engine;

pub use engine::ImapEngine;
