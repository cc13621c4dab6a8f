//! Wire protocol for the local authentication socket.
//!
//! One request or reply per line, ASCII, newline-terminated. This crate owns
//! parsing client request lines and rendering coordinator replies back into
//! wire form; it knows nothing about sockets, privilege, or the coordinator's
//! state machine.

use std::fmt;

/// Maximum length of a single protocol line, in bytes, not counting the
/// terminator.
pub const MAX_LINE_LEN: usize = 256;

// ---------------------------------------------------------------------------
// Client -> server requests
// ---------------------------------------------------------------------------

/// A parsed client request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// `WAITAUTH <user> <secs>`
    WaitAuth { user: String, wait_secs: f64 },
    /// `ADDUSER <user> <secs>`
    AddUser { user: String, wait_secs: f64 },
    /// `DELUSER <user> <secs>` — negative `wait_secs` means delete-all.
    DelUser { user: String, wait_secs: f64 },
    /// `WATCHNBUIDS`
    WatchCount,
    /// `WATCHUIDS`
    WatchUids,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("line exceeds {MAX_LINE_LEN} bytes")]
    TooLong,
    #[error("line is not printable ASCII")]
    NotAscii,
    #[error("empty line")]
    Empty,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("wrong number of arguments for {0}")]
    WrongArity(&'static str),
    #[error("invalid wait seconds {0:?}")]
    InvalidWaitSecs(String),
}

/// Parse one client request line (terminator already stripped).
///
/// Rejects lines over [`MAX_LINE_LEN`] bytes or containing non-printable
/// characters; unparsed commands and malformed arguments are reported as
/// errors so the caller can decide whether to ignore the line and keep the
/// session alive (the session handler's policy) or reject it outright.
pub fn parse_request_line(line: &str) -> Result<ClientRequest, ParseError> {
    if line.len() > MAX_LINE_LEN {
        return Err(ParseError::TooLong);
    }
    if !line.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        return Err(ParseError::NotAscii);
    }
    let mut parts = line.split_whitespace();
    let cmd = parts.next().ok_or(ParseError::Empty)?;
    match cmd {
        "WAITAUTH" | "ADDUSER" | "DELUSER" => {
            let user = parts
                .next()
                .ok_or(ParseError::WrongArity(cmd))?
                .to_owned();
            let secs_str = parts.next().ok_or(ParseError::WrongArity(cmd))?;
            if parts.next().is_some() {
                return Err(ParseError::WrongArity(cmd));
            }
            let wait_secs: f64 = secs_str
                .parse()
                .map_err(|_| ParseError::InvalidWaitSecs(secs_str.to_owned()))?;
            if !wait_secs.is_finite() {
                return Err(ParseError::InvalidWaitSecs(secs_str.to_owned()));
            }
            Ok(match cmd {
                "WAITAUTH" => ClientRequest::WaitAuth { user, wait_secs },
                "ADDUSER" => ClientRequest::AddUser { user, wait_secs },
                _ => ClientRequest::DelUser { user, wait_secs },
            })
        }
        "WATCHNBUIDS" => {
            if parts.next().is_some() {
                return Err(ParseError::WrongArity(cmd));
            }
            Ok(ClientRequest::WatchCount)
        }
        "WATCHUIDS" => {
            if parts.next().is_some() {
                return Err(ParseError::WrongArity(cmd));
            }
            Ok(ClientRequest::WatchUids)
        }
        other => Err(ParseError::UnknownCommand(other.to_owned())),
    }
}

// ---------------------------------------------------------------------------
// Server -> client replies
// ---------------------------------------------------------------------------

/// A reply the session handler renders directly onto the wire, one line per
/// variant. `EncrUpdate` is intentionally absent here: persisting it to the
/// credential file and choosing between `OK`/`WRITEERR` is the session
/// handler's job, not this crate's (see `CoordinatorReply` in the daemon
/// crate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireReply {
    AuthOk(Vec<String>),
    NoAuth,
    NbUids { count: usize, delta: i64 },
    Uids(Vec<String>),
    Ok,
    Exists,
    None,
    WriteErr,
    Timeout,
}

impl fmt::Display for WireReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireReply::AuthOk(uids) => {
                write!(f, "AUTHOK")?;
                for uid in uids {
                    write!(f, " {uid}")?;
                }
                Ok(())
            }
            WireReply::NoAuth => write!(f, "NOAUTH"),
            WireReply::NbUids { count, delta } => write!(f, "NBUIDS {count} {delta}"),
            WireReply::Uids(uids) => {
                write!(f, "UIDS")?;
                for uid in uids {
                    write!(f, " {uid}")?;
                }
                Ok(())
            }
            WireReply::Ok => write!(f, "OK"),
            WireReply::Exists => write!(f, "EXISTS"),
            WireReply::None => write!(f, "NONE"),
            WireReply::WriteErr => write!(f, "WRITEERR"),
            WireReply::Timeout => write!(f, "TIMEOUT"),
        }
    }
}
