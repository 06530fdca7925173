use anyhow::{anyhow, Context};
use std::time::Duration;
use tracing::warn;

use crate::auth;

pub const SECRET_ENV: &str = "SCHOOLD_JWT_SECRET";
pub const TOKEN_TTL_ENV: &str = "SCHOOLD_TOKEN_TTL";
const DEFAULT_TOKEN_TTL: &str = "24h";
/// Upper bound for any parsed duration: 366 days.
pub const MAX_DURATION_SECS: u64 = 366 * 24 * 60 * 60;

pub struct Config {
    pub jwt_secret: Vec<u8>,
    pub token_ttl: Duration,
}

impl Config {
    /// Environment (after `.env`) first, then the CLI override for the TTL.
    pub fn load(token_ttl_override: Option<&str>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let jwt_secret = match std::env::var(SECRET_ENV) {
            Ok(s) if !s.trim().is_empty() => s.into_bytes(),
            _ => {
                warn!(
                    env = SECRET_ENV,
                    "no token secret configured; using a random one, tokens will not survive a restart"
                );
                auth::random_secret()
            }
        };

        let ttl_raw = match token_ttl_override {
            Some(v) => v.to_string(),
            None => std::env::var(TOKEN_TTL_ENV).unwrap_or_else(|_| DEFAULT_TOKEN_TTL.to_string()),
        };
        let token_ttl =
            parse_duration(&ttl_raw).with_context(|| format!("invalid token ttl {:?}", ttl_raw))?;

        Ok(Self {
            jwt_secret,
            token_ttl,
        })
    }
}

/// `<n>[s|m|h|d]`; a bare number is seconds.
pub fn parse_duration(raw: &str) -> anyhow::Result<Duration> {
    let t = raw.trim();
    let (digits, unit) = match t.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => (&t[..i], c),
        Some(_) => (t, 's'),
        None => return Err(anyhow!("empty duration")),
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| anyhow!("duration must start with a whole number"))?;
    let scale: u64 = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 60 * 60 * 24,
        other => return Err(anyhow!("unknown duration unit {:?}", other)),
    };
    let secs = n
        .checked_mul(scale)
        .filter(|s| *s <= MAX_DURATION_SECS)
        .ok_or_else(|| anyhow!("duration is too large"))?;
    if secs == 0 {
        return Err(anyhow!("duration must be positive"));
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("90m").unwrap(), Duration::from_secs(5_400));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("0h").is_err());
        assert!(parse_duration("3w").is_err());
        assert!(parse_duration("-1h").is_err());
    }

    #[test]
    fn caps_durations_at_a_leap_year() {
        assert_eq!(
            parse_duration("366d").unwrap(),
            Duration::from_secs(MAX_DURATION_SECS)
        );
        assert!(parse_duration("367d").is_err());
        assert!(parse_duration("9223372036854775000").is_err());
        assert!(parse_duration("18446744073709551615d").is_err());
    }
}
