#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod action;
pub mod auth;
pub mod error;
pub mod resolve;
pub mod util;

pub use error::Error;
pub use error::Result;
