//! FTP control channel (RFC 959) formatting and reply parsing.
//!
//! Only what a single passive-mode `STOR` needs: commands, reply lines
//! (including multi-line replies) and the `227` passive address.

use std::net::Ipv4Addr;

/// Service ready for new user
pub const READY: u16 = 220;
/// User logged in
pub const LOGGED_IN: u16 = 230;
/// User name okay, need password
pub const NEED_PASSWORD: u16 = 331;
/// Command okay
pub const OK: u16 = 200;
/// Requested file action okay
pub const FILE_ACTION_OK: u16 = 250;
/// Entering passive mode
pub const PASSIVE: u16 = 227;
/// Data connection already open; transfer starting
pub const TRANSFER_STARTING: u16 = 125;
/// File status okay; about to open data connection
pub const OPENING_DATA: u16 = 150;
/// Closing data connection, transfer complete
pub const TRANSFER_COMPLETE: u16 = 226;
/// Service closing control connection
pub const CLOSING: u16 = 221;
/// Requested file action pending further information
pub const PENDING: u16 = 350;

/// Format a control command with its `\r\n` terminator
pub fn format_command(verb: &str, argument: Option<&str>) -> String {
    match argument {
        Some(arg) => format!("{} {}\r\n", verb, arg),
        None => format!("{}\r\n", verb),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpReply {
    pub code: u16,
    pub text: String,
}

/// Parse the leading reply code of a line and whether it ends the reply.
///
/// `"220 ready"` → `(220, true)`, `"220-welcome"` → `(220, false)`.
pub fn parse_reply_line(line: &str) -> Option<(u16, bool)> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code = line[..3].parse().ok()?;
    match bytes.get(3) {
        None | Some(b' ') => Some((code, true)),
        Some(b'-') => Some((code, false)),
        _ => None,
    }
}

/// Collects the lines of one reply.
///
/// Lines of a multi-line reply that do not start with the reply code are
/// accepted as text. Lines arriving before any reply started are ignored.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    code: Option<u16>,
    text: Vec<String>,
}

impl ReplyAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one line (without terminator). Returns the reply once complete.
    pub fn push(&mut self, line: &str) -> Option<FtpReply> {
        let line = line.trim_end_matches(['\r', '\n']);
        match (self.code, parse_reply_line(line)) {
            (None, Some((code, last))) => {
                self.text.push(reply_text(line));
                if last {
                    return Some(self.finish(code));
                }
                self.code = Some(code);
            }
            (None, None) => {}
            (Some(code), Some((c, true))) if c == code => {
                self.text.push(reply_text(line));
                return Some(self.finish(code));
            }
            (Some(_), _) => self.text.push(line.to_string()),
        }
        None
    }

    fn finish(&mut self, code: u16) -> FtpReply {
        self.code = None;
        FtpReply {
            code,
            text: std::mem::take(&mut self.text).join("\n"),
        }
    }
}

fn reply_text(line: &str) -> String {
    line.get(4..).unwrap_or("").to_string()
}

/// Parse the data address of a `227` reply.
///
/// Text: `Entering Passive Mode (h1,h2,h3,h4,p1,p2)`; port is `p1 * 256 + p2`.
pub fn parse_passive(text: &str) -> Option<(Ipv4Addr, u16)> {
    let start = text.find('(')?;
    let end = start + text[start..].find(')')?;
    let fields: Vec<u8> = text[start + 1..end]
        .split(',')
        .map(|f| f.trim().parse::<u8>())
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() != 6 {
        return None;
    }
    let address = Ipv4Addr::new(fields[0], fields[1], fields[2], fields[3]);
    let port = ((fields[4] as u16) << 8) | fields[5] as u16;
    Some((address, port))
}
