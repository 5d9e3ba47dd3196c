pub mod local;
pub mod ssh;

pub use local::LocalExec;
pub use ssh::RetryPolicy;
pub use ssh::SshClient;
pub use ssh::SshOptions;
