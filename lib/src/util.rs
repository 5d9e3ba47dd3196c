pub mod dirs;
pub mod mask;
pub mod secret;
