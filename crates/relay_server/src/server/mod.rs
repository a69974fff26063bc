#![forbid(unsafe_code)]

pub mod channel;
pub mod connection;
pub mod directory;
pub mod gateway;
pub mod health;
pub mod liveness;
pub mod router;
pub mod session;
pub mod supervisor;
pub mod timer;
pub mod translate;

#[cfg(test)]
mod test_support;
