//! # Live-Notify Session State Machine
//!
//! The session protocol as a plain enum. Per-state data (the session URI and the
//! current continuation token) lives inside the variant that needs it, so
//! "resetting" a session is simply leaving that variant.
//!
//! | State                  | Trigger                             | Next                   |
//! |------------------------|-------------------------------------|------------------------|
//! | Created                | Create                              | AwaitingInitialRequest |
//! | AwaitingInitialRequest | LiveQueryStarted(uri)               | LiveQuery              |
//! | AwaitingInitialRequest | ReceivedUnexpectedInitialResponse   | AwaitingInitialRequest |
//! | LiveQuery              | LiveQuerySucceeded(token)           | LiveQuery              |
//! | LiveQuery              | LiveQueryFailed                     | AwaitingInitialRequest |
//! | any                    | Dispose                             | Disposed               |
//! | Disposed               | anything                            | Disposed (ignored)     |
//!
//! Every other pair is a `StateViolation`. The matches below are exhaustive
//! without wildcards so a new trigger or state has to be placed explicitly.

use std::fmt;

use crate::error::IngestError;

/// Continuation token sent on the first live exchange of a session.
pub const INITIAL_TOKEN: &str = "-1";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Created,
    AwaitingInitialRequest,
    LiveQuery {
        uri: String,
        token: String,
    },
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTrigger {
    Create,
    LiveQueryStarted(String),
    LiveQuerySucceeded(String),
    LiveQueryFailed,
    ReceivedUnexpectedInitialResponse,
    Dispose,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Created => "Created",
            SessionState::AwaitingInitialRequest => "AwaitingInitialRequest",
            SessionState::LiveQuery { .. } => "LiveQuery",
            SessionState::Disposed => "Disposed",
        }
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, SessionState::Disposed)
    }

    /// Computes the state reached by firing `trigger`.
    pub fn on(self, trigger: SessionTrigger) -> Result<SessionState, IngestError> {
        use SessionState as S;
        use SessionTrigger as T;

        let violation = |state: &SessionState, trigger: &SessionTrigger| IngestError::StateViolation {
            state: state.name().to_string(),
            trigger: trigger.name().to_string(),
        };

        match self {
            S::Created => match trigger {
                T::Create => Ok(S::AwaitingInitialRequest),
                T::Dispose => Ok(S::Disposed),
                T::LiveQueryStarted(_)
                | T::LiveQuerySucceeded(_)
                | T::LiveQueryFailed
                | T::ReceivedUnexpectedInitialResponse => Err(violation(&S::Created, &trigger)),
            },
            S::AwaitingInitialRequest => match trigger {
                T::LiveQueryStarted(uri) => Ok(S::LiveQuery {
                    uri,
                    token: INITIAL_TOKEN.to_string(),
                }),
                T::ReceivedUnexpectedInitialResponse => Ok(S::AwaitingInitialRequest),
                T::Dispose => Ok(S::Disposed),
                T::Create | T::LiveQuerySucceeded(_) | T::LiveQueryFailed => {
                    Err(violation(&S::AwaitingInitialRequest, &trigger))
                }
            },
            S::LiveQuery { uri, token } => match trigger {
                T::LiveQuerySucceeded(next) => Ok(S::LiveQuery { uri, token: next }),
                T::LiveQueryFailed => Ok(S::AwaitingInitialRequest),
                T::Dispose => Ok(S::Disposed),
                T::Create | T::LiveQueryStarted(_) | T::ReceivedUnexpectedInitialResponse => {
                    Err(violation(&S::LiveQuery { uri, token }, &trigger))
                }
            },
            S::Disposed => match trigger {
                T::Create
                | T::LiveQueryStarted(_)
                | T::LiveQuerySucceeded(_)
                | T::LiveQueryFailed
                | T::ReceivedUnexpectedInitialResponse
                | T::Dispose => Ok(S::Disposed),
            },
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl SessionTrigger {
    pub fn name(&self) -> &'static str {
        match self {
            SessionTrigger::Create => "Create",
            SessionTrigger::LiveQueryStarted(_) => "LiveQueryStarted",
            SessionTrigger::LiveQuerySucceeded(_) => "LiveQuerySucceeded",
            SessionTrigger::LiveQueryFailed => "LiveQueryFailed",
            SessionTrigger::ReceivedUnexpectedInitialResponse => "ReceivedUnexpectedInitialResponse",
            SessionTrigger::Dispose => "Dispose",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState as S;
    use SessionTrigger as T;

    fn live(uri: &str, token: &str) -> SessionState {
        S::LiveQuery {
            uri: uri.into(),
            token: token.into(),
        }
    }

    #[test]
    fn test_happy_path() {
        let s = S::Created.on(T::Create).unwrap();
        assert_eq!(s, S::AwaitingInitialRequest);

        let s = s.on(T::LiveQueryStarted("https://x/live/1".into())).unwrap();
        assert_eq!(s, live("https://x/live/1", INITIAL_TOKEN));

        let s = s.on(T::LiveQuerySucceeded("42".into())).unwrap();
        assert_eq!(s, live("https://x/live/1", "42"));

        let s = s.on(T::LiveQueryFailed).unwrap();
        assert_eq!(s, S::AwaitingInitialRequest);
    }

    #[test]
    fn test_unexpected_initial_response_stays_put() {
        let s = S::AwaitingInitialRequest.on(T::ReceivedUnexpectedInitialResponse).unwrap();
        assert_eq!(s, S::AwaitingInitialRequest);
    }

    #[test]
    fn test_dispose_from_every_state() {
        for state in [S::Created, S::AwaitingInitialRequest, live("u", "t"), S::Disposed] {
            assert_eq!(state.on(T::Dispose).unwrap(), S::Disposed);
        }
    }

    #[test]
    fn test_disposed_absorbs_everything() {
        for trigger in [
            T::Create,
            T::LiveQueryStarted("u".into()),
            T::LiveQuerySucceeded("t".into()),
            T::LiveQueryFailed,
            T::ReceivedUnexpectedInitialResponse,
        ] {
            assert_eq!(S::Disposed.on(trigger).unwrap(), S::Disposed);
        }
    }

    #[test]
    fn test_unhandled_trigger_is_violation() {
        let err = S::Created.on(T::LiveQueryFailed).unwrap_err();
        assert_eq!(
            err,
            IngestError::StateViolation {
                state: "Created".into(),
                trigger: "LiveQueryFailed".into()
            }
        );

        assert!(S::AwaitingInitialRequest.on(T::LiveQueryFailed).is_err());
        assert!(live("u", "t").on(T::Create).is_err());
        assert!(live("u", "t").on(T::ReceivedUnexpectedInitialResponse).is_err());
    }
}
