//! Credential encryption, storage fan-out, and worker VM injection.

pub mod cipher;
pub mod fanout;
pub mod store;
pub mod transfer;
