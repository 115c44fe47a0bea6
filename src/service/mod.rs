//! JSON-lines service surface for the decision engine.
//!
//! Each input line is one [`Command`] and produces exactly one [`Reply`]
//! line, in order.

mod handler;
mod protocol;
mod server;

pub use handler::WardenService;
pub use protocol::{Command, Reply};
pub use server::LineServer;
