//! Run-level cancellation.

mod token;

pub use token::CancellationToken;
