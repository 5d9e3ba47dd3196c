mod action;
mod auth;
mod global;

pub use action::ActionArgs;
pub use auth::AuthArgs;
pub use global::GlobalArgs;
