//! Command rewriting for sudo mode and chroot.

/// Quotes `text` as a single POSIX shell word.
#[must_use]
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r#"'"'"'"#))
}

/// Escapes `text` for use inside a double-quoted shell string.
fn double_quote_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Wraps `command` for chroot only. Used by executors without sudo support.
#[must_use]
pub fn chrooted(command: &str, chroot: Option<&str>) -> String {
    match chroot {
        None => command.to_owned(),
        Some(path) => format!(
            "chroot {} sh -c {}",
            shell_quote(path),
            shell_quote(&format!("eval {}", shell_quote(command)))
        ),
    }
}

/// Wraps `command` for the given sudo mode and chroot.
///
/// With sudo the password is expected on standard input (`sudo -S`).
#[must_use]
pub fn prepare(command: &str, sudo: bool, chroot: Option<&str>) -> String {
    match (sudo, chroot) {
        (false, chroot) => chrooted(command, chroot),
        (true, Some(path)) => format!(
            "chroot {} sudo -S sh -c {}",
            shell_quote(path),
            shell_quote(&format!("eval {}", shell_quote(command)))
        ),
        (true, None) => format!(
            "sudo -S sh -c \"eval {}\"",
            double_quote_escape(&shell_quote(command))
        ),
    }
}

// Tests ----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::plain("id", false, None, "id")]
    #[case::sudo("id", true, None, r#"sudo -S sh -c "eval 'id'""#)]
    #[case::sudo_variables("echo $HOME", true, None, r#"sudo -S sh -c "eval 'echo \$HOME'""#)]
    #[case::sudo_quotes("echo 'a b'", true, None, r#"sudo -S sh -c "eval 'echo '\"'\"'a b'\"'\"''""#)]
    #[case::chroot("ls /", false, Some("/mnt/root"), r#"chroot '/mnt/root' sh -c 'eval '"'"'ls /'"'"''"#)]
    #[case::sudo_chroot("ls /", true, Some("/mnt"), r#"chroot '/mnt' sudo -S sh -c 'eval '"'"'ls /'"'"''"#)]
    fn rewrites(
        #[case] command: &str,
        #[case] sudo: bool,
        #[case] chroot: Option<&str>,
        #[case] expected: &str,
    ) {
        assert_eq!(prepare(command, sudo, chroot), expected);
    }

    #[rstest]
    #[case::simple("ls", "'ls'")]
    #[case::single_quote("it's", r#"'it'"'"'s'"#)]
    #[case::metacharacters("a; rm -rf /", "'a; rm -rf /'")]
    fn quotes(#[case] text: &str, #[case] expected: &str) {
        assert_eq!(shell_quote(text), expected);
    }

    #[tokio::test]
    async fn chrooted_command_round_trips_through_sh() {
        // Strip the chroot prefix and let sh evaluate the quoted remainder.
        let wrapped = chrooted("printf '%s' \"a b\"; echo", Some("/"));
        let inner = wrapped.strip_prefix("chroot '/' ").unwrap();
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(inner)
            .output()
            .await
            .unwrap();
        assert_eq!(output.stdout, b"a b\n");
    }
}
