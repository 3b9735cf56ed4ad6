pub mod capability;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod tests;
