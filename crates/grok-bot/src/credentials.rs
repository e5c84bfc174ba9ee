use crate::config::redacted;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("failed to read credentials {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid credentials file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("credentials field {0} is empty")]
    Missing(&'static str),
    #[error("invalid expires_at timestamp: {0}")]
    Timestamp(String),
}

#[derive(Deserialize)]
struct CredentialsFile {
    sessdata: String,
    bili_jct: String,
    #[serde(default)]
    buvid3: String,
    #[serde(default)]
    dedeuserid: String,
    #[serde(default)]
    expires_at: Option<String>,
}

/// Session cookies for the Bilibili web API, produced by a separate login step.
#[derive(Clone)]
pub struct Credentials {
    pub sessdata: String,
    pub bili_jct: String,
    pub buvid3: String,
    pub dedeuserid: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("sessdata", &redacted(&self.sessdata))
            .field("bili_jct", &redacted(&self.bili_jct))
            .field("dedeuserid", &self.dedeuserid)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn load(path: &Path) -> Result<Self, CredentialsError> {
        let contents = std::fs::read_to_string(path).map_err(|source| CredentialsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, CredentialsError> {
        let file: CredentialsFile = serde_json::from_str(contents)?;
        if file.sessdata.trim().is_empty() {
            return Err(CredentialsError::Missing("sessdata"));
        }
        if file.bili_jct.trim().is_empty() {
            return Err(CredentialsError::Missing("bili_jct"));
        }
        let expires_at = match file.expires_at.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(parse_expiry(raw)?),
        };
        Ok(Self {
            sessdata: file.sessdata,
            bili_jct: file.bili_jct,
            buvid3: file.buvid3,
            dedeuserid: file.dedeuserid,
            expires_at,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Health check that fails once the session cookies have expired.
    pub fn expiry_check(
        &self,
    ) -> impl Fn(DateTime<Utc>) -> Result<(), String> + Send + Sync + 'static {
        let expires_at = self.expires_at;
        move |now| match expires_at {
            Some(expires_at) if now >= expires_at => Err(format!(
                "credentials expired at {}",
                expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)
            )),
            _ => Ok(()),
        }
    }

    pub fn cookie_header(&self) -> String {
        [
            ("SESSDATA", self.sessdata.as_str()),
            ("bili_jct", self.bili_jct.as_str()),
            ("buvid3", self.buvid3.as_str()),
            ("DedeUserID", self.dedeuserid.as_str()),
        ]
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
    }
}

/// Accepts RFC 3339 and offset-less ISO timestamps; the latter are read as UTC.
fn parse_expiry(raw: &str) -> Result<DateTime<Utc>, CredentialsError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| CredentialsError::Timestamp(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn expiry_check_fails_from_the_expiry_instant() {
        let credentials = Credentials::from_json(
            r#"{"sessdata":"s","bili_jct":"j","expires_at":"2026-03-01T08:30:00Z"}"#,
        )
        .expect("credentials");
        let check = credentials.expiry_check();
        let expiry = Utc
            .with_ymd_and_hms(2026, 3, 1, 8, 30, 0)
            .single()
            .expect("valid timestamp");

        assert_eq!(check(expiry - chrono::Duration::seconds(1)), Ok(()));
        assert_eq!(
            check(expiry),
            Err("credentials expired at 2026-03-01T08:30:00Z".to_string())
        );

        let open_ended =
            Credentials::from_json(r#"{"sessdata":"s","bili_jct":"j"}"#).expect("credentials");
        assert_eq!(open_ended.expiry_check()(expiry), Ok(()));
    }

    const SAMPLE: &str = r#"{
        "sessdata": "abc%2C123",
        "bili_jct": "csrf-token",
        "buvid3": "buvid-1",
        "dedeuserid": "2001",
        "expires_at": "2026-03-01T08:30:00.123456"
    }"#;

    #[test]
    fn parses_naive_expiry_as_utc_and_builds_cookie_header() {
        let credentials = Credentials::from_json(SAMPLE).expect("credentials");
        assert_eq!(
            credentials.cookie_header(),
            "SESSDATA=abc%2C123; bili_jct=csrf-token; buvid3=buvid-1; DedeUserID=2001"
        );

        let before = Utc
            .with_ymd_and_hms(2026, 3, 1, 8, 0, 0)
            .single()
            .expect("valid timestamp");
        let after = Utc
            .with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp");
        assert!(!credentials.is_expired(before));
        assert!(credentials.is_expired(after));
    }

    #[test]
    fn rfc3339_expiry_and_missing_expiry() {
        let with_offset = Credentials::from_json(
            r#"{"sessdata":"s","bili_jct":"j","expires_at":"2026-03-01T16:30:00+08:00"}"#,
        )
        .expect("credentials");
        assert_eq!(
            with_offset.expires_at,
            Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).single()
        );

        let no_expiry =
            Credentials::from_json(r#"{"sessdata":"s","bili_jct":"j"}"#).expect("credentials");
        assert!(!no_expiry.is_expired(Utc::now()));
        assert_eq!(no_expiry.cookie_header(), "SESSDATA=s; bili_jct=j");
    }

    #[test]
    fn rejects_empty_session_and_bad_timestamp() {
        assert!(matches!(
            Credentials::from_json(r#"{"sessdata":"","bili_jct":"j"}"#),
            Err(CredentialsError::Missing("sessdata"))
        ));
        assert!(matches!(
            Credentials::from_json(r#"{"sessdata":"s","bili_jct":"j","expires_at":"soon"}"#),
            Err(CredentialsError::Timestamp(_))
        ));
    }

    #[test]
    fn debug_output_hides_cookie_values() {
        let credentials = Credentials::from_json(SAMPLE).expect("credentials");
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("abc%2C123"));
        assert!(!rendered.contains("csrf-token"));
    }
}
