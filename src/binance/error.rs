// =============================================================================
// Exchange error taxonomy
// =============================================================================
//
// Two real failure families come back from Binance: the network broke, or the
// exchange answered with a negative `code`. Callers match on the variant —
// transport errors are retried by the client, domain errors bubble straight
// up so call sites can decide (e.g. set_leverage ignores "No need to change").
// The -1003 IP ban is a domain error that additionally arms the client's
// circuit breaker; while the breaker is armed every call fails fast with
// `Banned` instead of hitting the wire.

use thiserror::Error;

/// Error returned by [`FuturesClient`](super::client::FuturesClient) calls.
#[derive(Debug, Error)]
pub enum BinanceError {
    /// Connection reset, timeout, protocol break, or read error. The client
    /// already retried 3 times with backoff before surfacing this.
    #[error("network error talking to Binance: {0}")]
    Transport(String),

    /// Exchange answered with a negative error code.
    #[error("Binance API error [{code}]: {msg}")]
    Api { code: i64, msg: String },

    /// The process-wide ban floor is armed; no request was sent.
    #[error("IP banned by Binance, {remaining_secs}s until release")]
    Banned { remaining_secs: i64 },
}

impl BinanceError {
    /// The negative error code, if this is a domain error.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Extract the ban-release timestamp (ms) from a -1003 message such as
/// `"Way too many requests; IP banned until 1700000000000."`.
///
/// Returns `None` when the message carries no timestamp; callers fall back
/// to a conservative short ban.
pub fn parse_ban_until_ms(msg: &str) -> Option<i64> {
    let idx = msg.find("banned until ")?;
    let rest = &msg[idx + "banned until ".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ban_release_timestamp() {
        let msg = "Way too many requests; IP banned until 1700000123456.";
        assert_eq!(parse_ban_until_ms(msg), Some(1_700_000_123_456));
    }

    #[test]
    fn missing_timestamp_returns_none() {
        assert_eq!(parse_ban_until_ms("Too many requests; slow down"), None);
        assert_eq!(parse_ban_until_ms("banned until soon"), None);
    }

    #[test]
    fn api_error_exposes_code() {
        let err = BinanceError::Api {
            code: -1003,
            msg: "banned".into(),
        };
        assert_eq!(err.code(), Some(-1003));
        assert_eq!(BinanceError::Transport("reset".into()).code(), None);
    }
}
