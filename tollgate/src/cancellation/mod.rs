//! Cooperative cancellation for runs and steps.

mod token;

pub use token::CancellationToken;
