//! Classification of server errors into penalties
//!
//! NNTP servers report most account problems with generic 4xx/5xx codes and
//! a free-form message, so the message text is searched for clues.

use std::time::Duration;

use crate::error::NntpError;

const PENALTY_UNKNOWN: f64 = 3.0;
const PENALTY_502: f64 = 5.0;
const PENALTY_TIMEOUT: f64 = 10.0;
const PENALTY_TOOMANY: f64 = 10.0;
const PENALTY_SHARE: f64 = 10.0;
const PENALTY_PERM: f64 = 10.0;
const PENALTY_VERYSHORT: f64 = 0.1;
const PENALTY_NONE_MODE: f64 = 1.0;

const LOGIN_CLUES: &[&str] = &["username", "password", "invalid", "authen", "access denied"];
const TOO_MANY_CLUES: &[&str] = &["exceed", "connections", "too many", "threads", "limit"];
const SHARE_CLUES: &[&str] = &["simultaneous ip", "multiple ip"];
/// Quota messages that mention a limit without being about connections
const QUOTA_CLUES: &[&str] = &["download limit exceeded", "byte limit exceeded"];
const PAYMENT_CLUES: &[&str] = &["credits", "paym", "expired", "exceeded"];

/// What kind of failure a server produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Timeout, refused connection, dropped socket or unexpected reply
    Transient,
    /// Credentials rejected
    BadLogin,
    /// Connection limit of the account reached
    TooManyConnections,
    /// Account used from several addresses at once
    TooManyIps,
    /// Account out of credit or expired
    Payment,
    /// 502 without a recognised clue
    Generic502,
    /// 400 without a recognised clue (server busy)
    VeryShort,
    /// Anything else during login
    Unknown,
}

impl ErrorClass {
    /// How long the server is blocked for this class
    ///
    /// With `no_penalties` every class collapses to one minute.
    pub fn penalty(self, no_penalties: bool) -> Duration {
        let minutes = if no_penalties {
            PENALTY_NONE_MODE
        } else {
            match self {
                ErrorClass::Transient => PENALTY_TIMEOUT,
                ErrorClass::BadLogin | ErrorClass::Payment => PENALTY_PERM,
                ErrorClass::TooManyConnections => PENALTY_TOOMANY,
                ErrorClass::TooManyIps => PENALTY_SHARE,
                ErrorClass::Generic502 => PENALTY_502,
                ErrorClass::VeryShort => PENALTY_VERYSHORT,
                ErrorClass::Unknown => PENALTY_UNKNOWN,
            }
        };
        Duration::from_secs_f64(minutes * 60.0)
    }

    /// Whether a single occurrence blocks the whole server
    ///
    /// Transient errors only count towards `bad_cons`.
    pub fn blocks_server(self) -> bool {
        !matches!(self, ErrorClass::Transient)
    }
}

fn has_clue(message: &str, clues: &[&str]) -> bool {
    let lower = message.to_lowercase();
    clues.iter().any(|c| lower.contains(c))
}

/// Classify a reply received while connecting or logging in
pub fn classify(code: u16, message: &str) -> ErrorClass {
    if matches!(code, 481 | 482 | 452 | 381) {
        return ErrorClass::BadLogin;
    }
    if has_clue(message, SHARE_CLUES) {
        return ErrorClass::TooManyIps;
    }
    if has_clue(message, TOO_MANY_CLUES) && !has_clue(message, QUOTA_CLUES) {
        return ErrorClass::TooManyConnections;
    }
    if has_clue(message, PAYMENT_CLUES) {
        return ErrorClass::Payment;
    }
    if (500..600).contains(&code) && has_clue(message, LOGIN_CLUES) {
        return ErrorClass::BadLogin;
    }
    match code {
        502 => ErrorClass::Generic502,
        400 => ErrorClass::VeryShort,
        _ => ErrorClass::Unknown,
    }
}

/// Classify an error reported by a connection
pub fn classify_error(error: &NntpError) -> ErrorClass {
    match error {
        NntpError::Auth { code, message } => classify(*code, message),
        NntpError::Response { code, message } => match classify(*code, message) {
            ErrorClass::Unknown => ErrorClass::Transient,
            class => class,
        },
        NntpError::Timeout
        | NntpError::ConnectionClosed
        | NntpError::Connect { .. }
        | NntpError::Tls(_)
        | NntpError::BufferOverflow { .. }
        | NntpError::Io(_) => ErrorClass::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_replies_are_bad_credentials() {
        assert_eq!(classify(481, "Authentication failed"), ErrorClass::BadLogin);
        assert_eq!(classify(502, "Invalid username or password"), ErrorClass::BadLogin);
    }

    #[test]
    fn clues_take_precedence_over_codes() {
        assert_eq!(
            classify(502, "Too many connections for your user"),
            ErrorClass::TooManyConnections
        );
        assert_eq!(
            classify(400, "Simultaneous IP addresses detected"),
            ErrorClass::TooManyIps
        );
        assert_eq!(classify(502, "Account expired, renew payment"), ErrorClass::Payment);
        assert_eq!(classify(502, "Download limit exceeded"), ErrorClass::Payment);
        assert_eq!(classify(502, "Service unavailable"), ErrorClass::Generic502);
        assert_eq!(classify(400, "Server busy"), ErrorClass::VeryShort);
        assert_eq!(classify(503, "what"), ErrorClass::Unknown);
    }

    #[test]
    fn penalties_in_minutes() {
        let minutes = |c: ErrorClass| c.penalty(false).as_secs_f64() / 60.0;
        assert_eq!(minutes(ErrorClass::BadLogin), 10.0);
        assert_eq!(minutes(ErrorClass::Generic502), 5.0);
        assert_eq!(minutes(ErrorClass::Unknown), 3.0);
        assert!((minutes(ErrorClass::VeryShort) - 0.1).abs() < 1e-9);
        assert_eq!(
            ErrorClass::TooManyIps.penalty(true),
            Duration::from_secs(60),
            "no-penalty mode collapses to one minute"
        );
    }

    #[test]
    fn connection_errors_are_transient() {
        assert_eq!(classify_error(&NntpError::Timeout), ErrorClass::Transient);
        assert!(!ErrorClass::Transient.blocks_server());
        assert_eq!(
            classify_error(&NntpError::Auth {
                code: 481,
                message: "no".into()
            }),
            ErrorClass::BadLogin
        );
        assert_eq!(
            classify_error(&NntpError::Response {
                code: 599,
                message: "odd".into()
            }),
            ErrorClass::Transient,
            "unknown replies to article requests do not block the server"
        );
    }
}
