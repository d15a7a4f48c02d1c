//! NNTP status lines

/// Service available, posting allowed
pub const GREETING_POSTING: u16 = 200;
/// Service available, posting prohibited
pub const GREETING_NO_POSTING: u16 = 201;
/// Group selected
pub const GROUP_SELECTED: u16 = 211;
/// Article follows (ARTICLE)
pub const ARTICLE_FOLLOWS: u16 = 220;
/// Headers follow (HEAD)
pub const HEAD_FOLLOWS: u16 = 221;
/// Body follows (BODY)
pub const BODY_FOLLOWS: u16 = 222;
/// Article exists (STAT)
pub const ARTICLE_EXISTS: u16 = 223;
/// Authentication accepted
pub const AUTH_ACCEPTED: u16 = 281;
/// Password required
pub const PASSWORD_REQUIRED: u16 = 381;
/// No such group
pub const NO_SUCH_GROUP: u16 = 411;
/// No article with that number
pub const NO_SUCH_NUMBER: u16 = 423;
/// No article with that message-id
pub const NO_SUCH_ARTICLE: u16 = 430;
/// Authentication required
pub const AUTH_REQUIRED: u16 = 480;
/// Command not recognized
pub const UNKNOWN_COMMAND: u16 = 500;
/// Syntax error in command
pub const SYNTAX_ERROR: u16 = 501;

/// A parsed status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-digit status code
    pub code: u16,
    /// Text after the code
    pub message: String,
}

impl Reply {
    /// Parse a status line; only the first three characters decide the code
    pub fn parse(line: &[u8]) -> Option<Self> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let digits = line.get(..3)?;
        if !digits.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let code = std::str::from_utf8(digits).ok()?.parse().ok()?;
        let message = String::from_utf8_lossy(&line[3..]).trim().to_string();
        Some(Self { code, message })
    }

    /// Article is not available on this server
    pub fn is_missing(&self) -> bool {
        matches!(self.code, NO_SUCH_GROUP | NO_SUCH_NUMBER | NO_SUCH_ARTICLE)
    }

    /// Server does not implement the command
    pub fn is_unsupported(&self) -> bool {
        matches!(self.code, UNKNOWN_COMMAND | SYNTAX_ERROR)
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_comes_from_the_first_three_characters() {
        assert_eq!(
            Reply::parse(b"430 No Such Article\r\n"),
            Some(Reply {
                code: 430,
                message: "No Such Article".into()
            })
        );
        assert_eq!(Reply::parse(b"281\r\n").map(|r| r.code), Some(281));
        assert_eq!(Reply::parse(b"2x0 nope"), None);
        assert_eq!(Reply::parse(b"20"), None, "too short to carry a code");
    }

    #[test]
    fn missing_and_unsupported_codes() {
        for code in [411, 423, 430] {
            let r = Reply { code, message: String::new() };
            assert!(r.is_missing(), "{code} means missing");
        }
        assert!(Reply { code: 500, message: String::new() }.is_unsupported());
        assert!(!Reply { code: 480, message: String::new() }.is_missing());
    }
}
