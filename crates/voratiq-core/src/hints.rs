//! Log-content hints attached to a failed agent's record to steer the user
//! toward the likely fix.

/// Claude emits a `/login` prompt or an expired-token message to stdout when
/// its staged credentials have gone stale; surface that as a hint rather than
/// a bare non-zero exit code.
pub fn claude_reauth_hint(combined_output: &str) -> Option<&'static str> {
    if combined_output.contains("/login") || combined_output.contains("OAuth token has expired") {
        Some("Claude credentials appear to have expired; run `claude /login` and retry")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_login_prompt() {
        assert!(claude_reauth_hint("please run /login to continue").is_some());
    }

    #[test]
    fn detects_expired_token_message() {
        assert!(claude_reauth_hint("error: OAuth token has expired").is_some());
    }

    #[test]
    fn returns_none_for_unrelated_output() {
        assert!(claude_reauth_hint("build succeeded").is_none());
    }
}
