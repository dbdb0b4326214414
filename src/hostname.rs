use std::env;
use tracing::warn;

/// Resolves the source used for entities sent without one.
///
/// Tries the `HOSTNAME` environment variable, then the system host name, and falls back to
/// `"unknown"`.
pub(crate) fn default_source() -> String {
    if let Ok(hostname) = env::var("HOSTNAME") {
        if !hostname.trim().is_empty() {
            return hostname;
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname) => {
            if let Some(hostname) = hostname.to_str() {
                if !hostname.is_empty() {
                    return hostname.to_string();
                }
            }
        }
        Err(e) => warn!("Unable to resolve local host name: {}", e),
    }

    warn!("Unable to resolve local host name. Source will default to 'unknown'");
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_source_is_never_blank() {
        assert!(!default_source().trim().is_empty());
    }
}
