//! Codec for TLCP server lines
//!
//! The server speaks a line-oriented text protocol: every notification is one
//! line of comma-separated fields whose first field is a literal tag
//! (`CONOK`, `LOOP`, `U`, `REQERR`, ...). This module turns a single line into
//! a typed [`ServerMessage`] and holds the helpers shared with the request
//! encoder for percent-encoding.
//!
//! # Dispatch
//!
//! Lines are split on their first comma and the tag is matched exactly, so
//! there is no prefix ambiguity between tags such as `CONOK` and `CONERR` or
//! `MPNOK` and `MPNDEL`. Field counts are enforced per tag; a line with the
//! wrong number of fields, a non-numeric number or an unknown tag is a
//! [`Error::Parse`], which the session layer reports as protocol error `61`.
//!
//! # Update fields
//!
//! The last field of a `U` line is a `|`-separated list decoded left to right
//! by [`decode_update_fields`]:
//!
//! | segment | meaning                                   |
//! |---------|-------------------------------------------|
//! | (empty) | field unchanged                           |
//! | `#`     | null                                      |
//! | `$`     | empty string                              |
//! | `^N`    | the next `N` fields are unchanged         |
//! | other   | percent-encoded UTF-8 value               |
//!
//! # Examples
//!
//! ```rust
//! use tlcp_core::codec::{parse_line, ServerMessage};
//! use tlcp_core::FieldValue;
//!
//! let msg = parse_line("CONOK,S1a2b,50000000,5000,*").unwrap();
//! assert!(matches!(msg, ServerMessage::ConOk { ref control_link, .. } if control_link.is_none()));
//!
//! let msg = parse_line("U,1,1,hello|^2|#").unwrap();
//! if let ServerMessage::Update { fields, .. } = msg {
//!     assert_eq!(fields.len(), 4);
//!     assert_eq!(fields[3], FieldValue::Null);
//! }
//! ```

use crate::error::{Error, Result};
use crate::types::{parse_decimal, Bandwidth, FieldValue};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::borrow::Cow;

/// Sequence name the server uses for `*` and the client uses for unordered
/// messages
pub const UNORDERED_MESSAGES: &str = "UNORDERED_MESSAGES";

/// Characters that must be escaped inside a request parameter value
const PARAM_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'=')
    .add(b'?')
    .add(b'<')
    .add(b'>');

/// A parsed server notification
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// `CONOK,<session>,<request limit>,<keepalive>,<control link|*>`
    ConOk {
        /// Server-assigned session id
        session_id: String,
        /// Maximum body length of a control request
        request_limit: u64,
        /// Keepalive the server will honour, in milliseconds
        keepalive_ms: u64,
        /// Address control requests must go to, `None` for `*`
        control_link: Option<String>,
    },
    /// `CONERR,<code>,<message>`
    ConErr { code: i32, message: String },
    /// `END,<code>,<message>`
    End { code: i32, message: String },
    /// `LOOP,<pause>`
    Loop { pause_ms: u64 },
    /// `REQOK` or `REQOK,<reqId>`
    ReqOk { req_id: Option<u64> },
    /// `REQERR,<reqId>,<code>,<message>`
    ReqErr {
        req_id: u64,
        code: i32,
        message: String,
    },
    /// `ERROR,<code>,<message>`
    Error { code: i32, message: String },
    /// `U,<subId>,<item>,<fields>`
    Update {
        sub_id: u32,
        item: u32,
        fields: Vec<FieldValue>,
    },
    /// `SUBOK,<subId>,<items>,<fields>`
    SubOk { sub_id: u32, items: u32, fields: u32 },
    /// `SUBCMD,<subId>,<items>,<fields>,<key pos>,<command pos>`
    SubCmd {
        sub_id: u32,
        items: u32,
        fields: u32,
        key_pos: u32,
        command_pos: u32,
    },
    /// `UNSUB,<subId>`
    Unsub { sub_id: u32 },
    /// `CONS,<bandwidth>`
    Cons { bandwidth: Bandwidth },
    /// `SYNC,<seconds since session start>`
    Sync { seconds: u64 },
    /// `CS,<subId>,<item>`
    ClearSnapshot { sub_id: u32, item: u32 },
    /// `EOS,<subId>,<item>`
    EndOfSnapshot { sub_id: u32, item: u32 },
    /// `OV,<subId>,<item>,<lost>`
    Overflow { sub_id: u32, item: u32, lost: u64 },
    /// `CONF,<subId>,<frequency|unlimited>,<filtered|unfiltered>`
    Conf {
        sub_id: u32,
        /// Updates per second, `None` when unlimited
        max_frequency: Option<f64>,
        filtered: bool,
    },
    /// `SERVNAME,<name>`
    ServName { name: String },
    /// `CLIENTIP,<ip>`
    ClientIp { ip: String },
    /// `MSGDONE,<sequence>,<prog>,<response>`
    MsgDone {
        sequence: String,
        prog: u64,
        response: Option<String>,
    },
    /// `MSGFAIL,<sequence>,<prog>,<code>,<message>`
    MsgFail {
        sequence: String,
        prog: u64,
        code: i32,
        message: String,
    },
    /// `MPNREG,<device id>,<adapter name>`
    MpnReg {
        device_id: String,
        adapter_name: String,
    },
    /// `MPNOK,<subId>,<mpn subscription id>`
    MpnOk { sub_id: u32, mpn_sub_id: String },
    /// `MPNDEL,<mpn subscription id>`
    MpnDel { mpn_sub_id: String },
    /// `MPNZERO,<device id>`
    MpnZero { device_id: String },
    /// `PROG,<prog>`
    Prog { prog: u64 },
    /// `NOOP,...`
    Noop,
    /// `PROBE`
    Probe,
    /// `WSOK`
    WsOk,
}

impl ServerMessage {
    /// Whether the notification is counted by the prog counter
    ///
    /// Countable notifications are the ones the server replays on recovery.
    pub fn is_countable(&self) -> bool {
        matches!(
            self,
            ServerMessage::Update { .. }
                | ServerMessage::SubOk { .. }
                | ServerMessage::SubCmd { .. }
                | ServerMessage::Unsub { .. }
                | ServerMessage::ClearSnapshot { .. }
                | ServerMessage::EndOfSnapshot { .. }
                | ServerMessage::Overflow { .. }
                | ServerMessage::Conf { .. }
                | ServerMessage::MsgDone { .. }
                | ServerMessage::MsgFail { .. }
                | ServerMessage::MpnReg { .. }
                | ServerMessage::MpnOk { .. }
                | ServerMessage::MpnDel { .. }
                | ServerMessage::MpnZero { .. }
        )
    }

    /// Literal tag, for logging
    pub fn tag(&self) -> &'static str {
        match self {
            ServerMessage::ConOk { .. } => "CONOK",
            ServerMessage::ConErr { .. } => "CONERR",
            ServerMessage::End { .. } => "END",
            ServerMessage::Loop { .. } => "LOOP",
            ServerMessage::ReqOk { .. } => "REQOK",
            ServerMessage::ReqErr { .. } => "REQERR",
            ServerMessage::Error { .. } => "ERROR",
            ServerMessage::Update { .. } => "U",
            ServerMessage::SubOk { .. } => "SUBOK",
            ServerMessage::SubCmd { .. } => "SUBCMD",
            ServerMessage::Unsub { .. } => "UNSUB",
            ServerMessage::Cons { .. } => "CONS",
            ServerMessage::Sync { .. } => "SYNC",
            ServerMessage::ClearSnapshot { .. } => "CS",
            ServerMessage::EndOfSnapshot { .. } => "EOS",
            ServerMessage::Overflow { .. } => "OV",
            ServerMessage::Conf { .. } => "CONF",
            ServerMessage::ServName { .. } => "SERVNAME",
            ServerMessage::ClientIp { .. } => "CLIENTIP",
            ServerMessage::MsgDone { .. } => "MSGDONE",
            ServerMessage::MsgFail { .. } => "MSGFAIL",
            ServerMessage::MpnReg { .. } => "MPNREG",
            ServerMessage::MpnOk { .. } => "MPNOK",
            ServerMessage::MpnDel { .. } => "MPNDEL",
            ServerMessage::MpnZero { .. } => "MPNZERO",
            ServerMessage::Prog { .. } => "PROG",
            ServerMessage::Noop => "NOOP",
            ServerMessage::Probe => "PROBE",
            ServerMessage::WsOk => "WSOK",
        }
    }
}

/// Parse one server line (without its line terminator)
///
/// # Errors
///
/// Returns [`Error::Parse`] for unknown tags, wrong field counts and
/// malformed numbers or update fields.
pub fn parse_line(line: &str) -> Result<ServerMessage> {
    let (tag, rest) = match line.split_once(',') {
        Some((tag, rest)) => (tag, Some(rest)),
        None => (line, None),
    };
    let mut args = Args { line, rest };

    let msg = match tag {
        "CONOK" => {
            let f = args.exact(4)?;
            ServerMessage::ConOk {
                session_id: non_empty(line, f[0])?.to_string(),
                request_limit: uint(line, f[1])?,
                keepalive_ms: uint(line, f[2])?,
                control_link: match f[3] {
                    "*" => None,
                    link => Some(decode_percent(line, link)?),
                },
            }
        }
        "CONERR" => {
            let (code, message) = args.code_message()?;
            ServerMessage::ConErr { code, message }
        }
        "END" => {
            let (code, message) = args.code_message()?;
            ServerMessage::End { code, message }
        }
        "ERROR" => {
            let (code, message) = args.code_message()?;
            ServerMessage::Error { code, message }
        }
        "LOOP" => {
            let f = args.exact(1)?;
            ServerMessage::Loop {
                pause_ms: uint(line, f[0])?,
            }
        }
        "REQOK" => match rest {
            None => ServerMessage::ReqOk { req_id: None },
            Some(_) => {
                let f = args.exact(1)?;
                ServerMessage::ReqOk {
                    req_id: Some(uint(line, f[0])?),
                }
            }
        },
        "REQERR" => {
            let f = args.tail(3)?;
            ServerMessage::ReqErr {
                req_id: uint(line, f[0])?,
                code: int(line, f[1])?,
                message: decode_percent(line, f[2])?,
            }
        }
        "U" => {
            let f = args.tail(3)?;
            ServerMessage::Update {
                sub_id: uint(line, f[0])?,
                item: uint(line, f[1])?,
                fields: decode_update_fields(f[2])
                    .map_err(|e| Error::parse(line, reason_of(e)))?,
            }
        }
        "SUBOK" => {
            let f = args.exact(3)?;
            ServerMessage::SubOk {
                sub_id: uint(line, f[0])?,
                items: uint(line, f[1])?,
                fields: uint(line, f[2])?,
            }
        }
        "SUBCMD" => {
            let f = args.exact(5)?;
            ServerMessage::SubCmd {
                sub_id: uint(line, f[0])?,
                items: uint(line, f[1])?,
                fields: uint(line, f[2])?,
                key_pos: uint(line, f[3])?,
                command_pos: uint(line, f[4])?,
            }
        }
        "UNSUB" => {
            let f = args.exact(1)?;
            ServerMessage::Unsub {
                sub_id: uint(line, f[0])?,
            }
        }
        "CONS" => {
            let f = args.exact(1)?;
            ServerMessage::Cons {
                bandwidth: f[0]
                    .parse()
                    .map_err(|_| Error::parse(line, "invalid bandwidth"))?,
            }
        }
        "SYNC" => {
            let f = args.exact(1)?;
            ServerMessage::Sync {
                seconds: uint(line, f[0])?,
            }
        }
        "CS" => {
            let f = args.exact(2)?;
            ServerMessage::ClearSnapshot {
                sub_id: uint(line, f[0])?,
                item: uint(line, f[1])?,
            }
        }
        "EOS" => {
            let f = args.exact(2)?;
            ServerMessage::EndOfSnapshot {
                sub_id: uint(line, f[0])?,
                item: uint(line, f[1])?,
            }
        }
        "OV" => {
            let f = args.exact(3)?;
            ServerMessage::Overflow {
                sub_id: uint(line, f[0])?,
                item: uint(line, f[1])?,
                lost: uint(line, f[2])?,
            }
        }
        "CONF" => {
            let f = args.exact(3)?;
            let max_frequency = match f[1] {
                "unlimited" => None,
                freq => Some(
                    parse_decimal(freq).ok_or_else(|| Error::parse(line, "invalid frequency"))?,
                ),
            };
            let filtered = match f[2] {
                "filtered" => true,
                "unfiltered" => false,
                _ => return Err(Error::parse(line, "invalid filtering flag")),
            };
            ServerMessage::Conf {
                sub_id: uint(line, f[0])?,
                max_frequency,
                filtered,
            }
        }
        "SERVNAME" => {
            let f = args.tail(1)?;
            ServerMessage::ServName {
                name: decode_percent(line, f[0])?,
            }
        }
        "CLIENTIP" => {
            let f = args.exact(1)?;
            ServerMessage::ClientIp {
                ip: non_empty(line, f[0])?.to_string(),
            }
        }
        "MSGDONE" => {
            let f = args.tail(3)?;
            ServerMessage::MsgDone {
                sequence: sequence_name(line, f[0])?,
                prog: uint(line, f[1])?,
                response: match f[2] {
                    "" => None,
                    response => Some(decode_percent(line, response)?),
                },
            }
        }
        "MSGFAIL" => {
            let f = args.tail(4)?;
            ServerMessage::MsgFail {
                sequence: sequence_name(line, f[0])?,
                prog: uint(line, f[1])?,
                code: int(line, f[2])?,
                message: decode_percent(line, f[3])?,
            }
        }
        "MPNREG" => {
            let f = args.exact(2)?;
            ServerMessage::MpnReg {
                device_id: non_empty(line, f[0])?.to_string(),
                adapter_name: decode_percent(line, f[1])?,
            }
        }
        "MPNOK" => {
            let f = args.exact(2)?;
            ServerMessage::MpnOk {
                sub_id: uint(line, f[0])?,
                mpn_sub_id: non_empty(line, f[1])?.to_string(),
            }
        }
        "MPNDEL" => {
            let f = args.exact(1)?;
            ServerMessage::MpnDel {
                mpn_sub_id: non_empty(line, f[0])?.to_string(),
            }
        }
        "MPNZERO" => {
            let f = args.exact(1)?;
            ServerMessage::MpnZero {
                device_id: non_empty(line, f[0])?.to_string(),
            }
        }
        "PROG" => {
            let f = args.exact(1)?;
            ServerMessage::Prog {
                prog: uint(line, f[0])?,
            }
        }
        "NOOP" => ServerMessage::Noop,
        "PROBE" if rest.is_none() => ServerMessage::Probe,
        "WSOK" if rest.is_none() => ServerMessage::WsOk,
        _ => return Err(Error::parse(line, "unknown message")),
    };
    Ok(msg)
}

/// Decode the `|`-separated field list of a `U` line
///
/// # Errors
///
/// Fails on `#` or `$` followed by other characters, on a `^` not followed
/// by a decimal count, and on percent-escapes that are not valid UTF-8.
pub fn decode_update_fields(raw: &str) -> Result<Vec<FieldValue>> {
    let mut values = Vec::new();
    for segment in raw.split('|') {
        match segment.as_bytes().first() {
            None => values.push(FieldValue::Unchanged),
            Some(b'#') if segment.len() == 1 => values.push(FieldValue::Null),
            Some(b'$') if segment.len() == 1 => values.push(FieldValue::Value(String::new())),
            Some(b'#') | Some(b'$') => {
                return Err(Error::parse(raw, format!("invalid field '{segment}'")));
            }
            Some(b'^') => {
                let count = &segment[1..];
                if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(Error::parse(raw, format!("invalid skip '{segment}'")));
                }
                let count: usize = count
                    .parse()
                    .map_err(|_| Error::parse(raw, format!("invalid skip '{segment}'")))?;
                values.extend(std::iter::repeat(FieldValue::Unchanged).take(count));
            }
            Some(_) => values.push(FieldValue::Value(decode_percent(raw, segment)?)),
        }
    }
    Ok(values)
}

/// Percent-encode a request parameter value
pub fn encode_value(value: &str) -> Cow<'_, str> {
    utf8_percent_encode(value, PARAM_VALUE).into()
}

fn decode_percent(line: &str, raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(Cow::into_owned)
        .map_err(|_| Error::parse(line, "invalid UTF-8 in percent-encoded field"))
}

fn reason_of(error: Error) -> String {
    match error {
        Error::Parse { reason, .. } => reason,
        other => other.to_string(),
    }
}

fn sequence_name(line: &str, raw: &str) -> Result<String> {
    match raw {
        "*" => Ok(UNORDERED_MESSAGES.to_string()),
        other => Ok(non_empty(line, other)?.to_string()),
    }
}

fn non_empty<'a>(line: &str, raw: &'a str) -> Result<&'a str> {
    if raw.is_empty() {
        Err(Error::parse(line, "empty field"))
    } else {
        Ok(raw)
    }
}

fn uint<T: std::str::FromStr>(line: &str, raw: &str) -> Result<T> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::parse(line, format!("invalid number '{raw}'")));
    }
    raw.parse()
        .map_err(|_| Error::parse(line, format!("number out of range '{raw}'")))
}

fn int(line: &str, raw: &str) -> Result<i32> {
    let value = match raw.strip_prefix('-') {
        Some(digits) => -uint::<i64>(line, digits)?,
        None => uint::<i64>(line, raw)?,
    };
    i32::try_from(value).map_err(|_| Error::parse(line, format!("number out of range '{raw}'")))
}

struct Args<'a> {
    line: &'a str,
    rest: Option<&'a str>,
}

impl<'a> Args<'a> {
    /// Exactly `n` fields, none of which may contain a comma
    fn exact(&mut self, n: usize) -> Result<Vec<&'a str>> {
        let rest = self.rest.unwrap_or_default();
        let fields: Vec<&str> = if self.rest.is_some() {
            rest.split(',').collect()
        } else {
            Vec::new()
        };
        if fields.len() != n {
            return Err(Error::parse(
                self.line,
                format!("expected {n} fields, found {}", fields.len()),
            ));
        }
        Ok(fields)
    }

    /// `n` fields, the last of which takes the rest of the line
    fn tail(&mut self, n: usize) -> Result<Vec<&'a str>> {
        let fields: Vec<&str> = match self.rest {
            Some(rest) => rest.splitn(n, ',').collect(),
            None => Vec::new(),
        };
        if fields.len() != n {
            return Err(Error::parse(
                self.line,
                format!("expected {n} fields, found {}", fields.len()),
            ));
        }
        Ok(fields)
    }

    fn code_message(&mut self) -> Result<(i32, String)> {
        let f = self.tail(2)?;
        Ok((int(self.line, f[0])?, decode_percent(self.line, f[1])?))
    }
}
