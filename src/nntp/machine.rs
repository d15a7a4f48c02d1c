//! Sans-I/O session state machine
//!
//! The machine is fed status lines and answers with the next [`Step`]; the
//! connection does the reading and writing. Keeping the transitions pure
//! lets them be tested without sockets.

use super::reply::{self, Reply};
use crate::error::NntpError;

/// How an article is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `BODY`: data only
    Body,
    /// `ARTICLE`: headers and data (server lacks `BODY`)
    Article,
    /// `STAT`: existence only (pre-check)
    Stat,
    /// `HEAD`: existence via headers (pre-check, server lacks `STAT`)
    Head,
}

impl Command {
    fn line(self, message_id: &str) -> String {
        let verb = match self {
            Command::Body => "BODY",
            Command::Article => "ARTICLE",
            Command::Stat => "STAT",
            Command::Head => "HEAD",
        };
        format!("{verb} <{message_id}>")
    }

    /// Whether the reply carries the article data the caller wants
    pub fn wants_data(self) -> bool {
        matches!(self, Command::Body | Command::Article)
    }
}

/// One article request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Message-id without angle brackets
    pub message_id: String,
    /// Group to select first (`send_group`)
    pub group: Option<String>,
    /// Command to use
    pub command: Command,
}

/// A request answered without a data block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// `STAT` confirmed the article
    Present,
    /// 411/423/430
    Missing,
    /// 500/501: the command is not implemented
    Unsupported,
}

/// What the connection must do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Write this command line, then feed the next status line
    Send(String),
    /// The session is ready for requests
    LoggedIn,
    /// A multi-line data block follows; call [`Machine::data_done`] after it
    ReadData,
    /// The request finished without data
    Resolved(Resolution),
    /// The session cannot continue
    Failed(NntpError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Greeting,
    AuthUser,
    AuthPass,
    Ready,
    Group,
    Request,
    Receiving,
    Closed,
}

/// Protocol state of one connection
#[derive(Debug)]
pub struct Machine {
    state: State,
    credentials: Option<(String, String)>,
    group: Option<String>,
    pending: Option<Request>,
}

impl Machine {
    /// Machine waiting for the server greeting
    pub fn new(username: Option<&str>, password: Option<&str>) -> Self {
        let credentials = username
            .filter(|u| !u.is_empty())
            .map(|u| (u.to_string(), password.unwrap_or_default().to_string()));
        Self {
            state: State::Greeting,
            credentials,
            group: None,
            pending: None,
        }
    }

    /// Session can take a request
    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    /// Group currently selected
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Start a request; the session must be ready
    pub fn request(&mut self, request: Request) -> Step {
        if self.state != State::Ready {
            return Step::Failed(NntpError::Io(format!(
                "request issued in state {:?}",
                self.state
            )));
        }
        self.pending = Some(request);
        self.dispatch()
    }

    fn dispatch(&mut self) -> Step {
        let Some(request) = &self.pending else {
            self.state = State::Ready;
            return Step::LoggedIn;
        };
        if let Some(group) = &request.group
            && self.group.as_deref() != Some(group.as_str())
        {
            self.state = State::Group;
            return Step::Send(format!("GROUP {group}"));
        }
        self.state = State::Request;
        Step::Send(request.command.line(&request.message_id))
    }

    fn login(&mut self, reply: &Reply) -> Step {
        match &self.credentials {
            Some((user, _)) => {
                self.state = State::AuthUser;
                Step::Send(format!("AUTHINFO USER {user}"))
            }
            None => self.fail_auth(reply),
        }
    }

    fn send_password(&mut self, reply: &Reply) -> Step {
        match &self.credentials {
            Some((_, password)) => {
                let line = format!("AUTHINFO PASS {password}");
                self.state = State::AuthPass;
                Step::Send(line)
            }
            None => self.fail_auth(reply),
        }
    }

    fn fail_auth(&mut self, reply: &Reply) -> Step {
        self.state = State::Closed;
        Step::Failed(NntpError::Auth {
            code: reply.code,
            message: reply.message.clone(),
        })
    }

    fn fail(&mut self, reply: &Reply) -> Step {
        self.state = State::Closed;
        Step::Failed(NntpError::Response {
            code: reply.code,
            message: reply.message.clone(),
        })
    }

    fn resolve(&mut self, resolution: Resolution) -> Step {
        self.pending = None;
        self.state = State::Ready;
        Step::Resolved(resolution)
    }

    /// Feed a status line
    pub fn on_reply(&mut self, reply: &Reply) -> Step {
        match self.state {
            State::Greeting => match reply.code {
                reply::GREETING_POSTING | reply::GREETING_NO_POSTING => {
                    if self.credentials.is_some() {
                        self.login(reply)
                    } else {
                        self.state = State::Ready;
                        Step::LoggedIn
                    }
                }
                reply::AUTH_REQUIRED => self.login(reply),
                // some servers greet with the login already done or half done
                reply::AUTH_ACCEPTED => self.dispatch(),
                reply::PASSWORD_REQUIRED => self.send_password(reply),
                _ => self.fail(reply),
            },
            State::AuthUser => match reply.code {
                reply::PASSWORD_REQUIRED => self.send_password(reply),
                reply::AUTH_ACCEPTED => self.dispatch(),
                _ => self.fail_auth(reply),
            },
            State::AuthPass => match reply.code {
                reply::AUTH_ACCEPTED => self.dispatch(),
                _ => self.fail_auth(reply),
            },
            State::Group => match reply.code {
                reply::GROUP_SELECTED => {
                    self.group = self.pending.as_ref().and_then(|r| r.group.clone());
                    self.dispatch()
                }
                reply::AUTH_REQUIRED => self.login(reply),
                _ if reply.is_missing() => self.resolve(Resolution::Missing),
                _ => self.fail(reply),
            },
            State::Request => match reply.code {
                reply::BODY_FOLLOWS | reply::ARTICLE_FOLLOWS | reply::HEAD_FOLLOWS => {
                    self.state = State::Receiving;
                    Step::ReadData
                }
                reply::ARTICLE_EXISTS => self.resolve(Resolution::Present),
                reply::AUTH_REQUIRED => self.login(reply),
                _ if reply.is_missing() => self.resolve(Resolution::Missing),
                _ if reply.is_unsupported() => self.resolve(Resolution::Unsupported),
                _ => self.fail(reply),
            },
            State::Ready | State::Receiving | State::Closed => self.fail(reply),
        }
    }

    /// The data block of the current request was read completely
    pub fn data_done(&mut self) {
        self.pending = None;
        self.state = State::Ready;
    }

    /// Close the session; returns `QUIT` when the server expects one
    pub fn quit(&mut self) -> Option<&'static str> {
        let polite = !matches!(self.state, State::Greeting | State::Closed);
        self.state = State::Closed;
        polite.then_some("QUIT")
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn r(code: u16) -> Reply {
        Reply {
            code,
            message: "text".into(),
        }
    }

    fn body(group: Option<&str>) -> Request {
        Request {
            message_id: "a@b".into(),
            group: group.map(str::to_string),
            command: Command::Body,
        }
    }

    #[test]
    fn greeting_without_credentials_is_ready() {
        let mut m = Machine::new(None, None);
        assert_eq!(m.on_reply(&r(200)), Step::LoggedIn);
        assert!(m.is_ready());
    }

    #[test]
    fn login_sends_user_then_pass() {
        let mut m = Machine::new(Some("joe"), Some("secret"));
        assert_eq!(m.on_reply(&r(201)), Step::Send("AUTHINFO USER joe".into()));
        assert_eq!(m.on_reply(&r(381)), Step::Send("AUTHINFO PASS secret".into()));
        assert_eq!(m.on_reply(&r(281)), Step::LoggedIn);
        assert!(m.is_ready());
    }

    #[test]
    fn greeting_may_accept_or_ask_for_the_password() {
        let mut m = Machine::new(Some("joe"), Some("secret"));
        assert_eq!(m.on_reply(&r(281)), Step::LoggedIn);
        assert!(m.is_ready());

        let mut m = Machine::new(Some("joe"), Some("secret"));
        assert_eq!(m.on_reply(&r(381)), Step::Send("AUTHINFO PASS secret".into()));
        assert_eq!(m.on_reply(&r(281)), Step::LoggedIn);

        let mut m = Machine::new(None, None);
        assert!(matches!(
            m.on_reply(&r(381)),
            Step::Failed(NntpError::Auth { code: 381, .. })
        ));
    }

    #[test]
    fn rejected_password_is_an_auth_error() {
        let mut m = Machine::new(Some("joe"), Some("wrong"));
        m.on_reply(&r(200));
        m.on_reply(&r(381));
        match m.on_reply(&r(481)) {
            Step::Failed(NntpError::Auth { code, .. }) => assert_eq!(code, 481),
            other => panic!("expected auth failure, got {other:?}"),
        }
        assert!(!m.is_ready());
    }

    #[test]
    fn auth_demand_without_credentials_fails() {
        let mut m = Machine::new(None, None);
        assert!(matches!(
            m.on_reply(&r(480)),
            Step::Failed(NntpError::Auth { code: 480, .. })
        ));
    }

    #[test]
    fn busy_greeting_is_reported_with_its_code() {
        let mut m = Machine::new(None, None);
        assert!(matches!(
            m.on_reply(&r(502)),
            Step::Failed(NntpError::Response { code: 502, .. })
        ));
        assert_eq!(m.quit(), None, "nothing to say to a server that refused us");
    }

    #[test]
    fn group_is_sent_once_per_group() {
        let mut m = Machine::new(None, None);
        m.on_reply(&r(200));
        assert_eq!(m.request(body(Some("alt.test"))), Step::Send("GROUP alt.test".into()));
        assert_eq!(m.on_reply(&r(211)), Step::Send("BODY <a@b>".into()));
        assert_eq!(m.on_reply(&r(222)), Step::ReadData);
        m.data_done();
        assert_eq!(m.group(), Some("alt.test"));
        assert_eq!(
            m.request(body(Some("alt.test"))),
            Step::Send("BODY <a@b>".into()),
            "group already selected"
        );
    }

    #[test]
    fn request_outcomes() {
        let mut m = Machine::new(None, None);
        m.on_reply(&r(200));
        m.request(body(None));
        assert_eq!(m.on_reply(&r(430)), Step::Resolved(Resolution::Missing));
        m.request(body(None));
        assert_eq!(m.on_reply(&r(500)), Step::Resolved(Resolution::Unsupported));
        m.request(Request {
            command: Command::Stat,
            ..body(None)
        });
        assert_eq!(m.on_reply(&r(223)), Step::Resolved(Resolution::Present));
        assert!(m.is_ready());
    }

    #[test]
    fn mid_session_auth_demand_relogs_and_repeats_the_request() {
        let mut m = Machine::new(Some("joe"), Some("pw"));
        m.on_reply(&r(200));
        m.on_reply(&r(381));
        m.on_reply(&r(281));
        m.request(body(None));
        assert_eq!(m.on_reply(&r(480)), Step::Send("AUTHINFO USER joe".into()));
        assert_eq!(m.on_reply(&r(381)), Step::Send("AUTHINFO PASS pw".into()));
        assert_eq!(
            m.on_reply(&r(281)),
            Step::Send("BODY <a@b>".into()),
            "the interrupted request is sent again"
        );
    }

    #[test]
    fn unexpected_reply_closes_the_session() {
        let mut m = Machine::new(None, None);
        m.on_reply(&r(200));
        m.request(body(None));
        assert!(matches!(
            m.on_reply(&r(403)),
            Step::Failed(NntpError::Response { code: 403, .. })
        ));
        assert!(!m.is_ready());
    }
}
