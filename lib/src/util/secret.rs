use std::fmt;

use redact::Secret;
use zeroize::Zeroizing;

/// String that is redacted when printed and zeroed when it goes out of scope.
pub struct SecureString(Zeroizing<Secret<String>>);

impl SecureString {
    /// Borrows the plain text. Keep the borrow short and out of logs.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl<S> From<S> for SecureString
where
    S: AsRef<str>,
{
    fn from(value: S) -> Self {
        SecureString(Zeroizing::new(Secret::new(value.as_ref().into())))
    }
}

impl Clone for SecureString {
    fn clone(&self) -> Self {
        Self::from(self.expose())
    }
}

impl fmt::Debug for SecureString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl PartialEq for SecureString {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for SecureString {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_is_redacted() {
        let secret = SecureString::from("hunter2");
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(secret.expose(), "hunter2");
        assert_eq!(secret.clone(), secret);
    }
}
