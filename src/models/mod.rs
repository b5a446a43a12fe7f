//! Domain model module declarations.

pub mod cleanup;
pub mod credential;
pub mod provider;
pub mod session;
pub mod vm;
