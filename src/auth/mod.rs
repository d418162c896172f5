#![forbid(unsafe_code)]

pub mod token;

pub use token::{JoinClaims, TokenError, TokenValidator};
