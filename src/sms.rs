//! SMS in text mode: send, list, read, delete.
//!
//! Sending is a prompt handshake: `AT+CMGS="<number>"`, wait for the `>`
//! byte, push the body, terminate with Ctrl-Z. Non-ASCII content switches
//! the TE charset to UCS2, where both the number and the body go out as
//! uppercase hex of their UTF-16 BE encoding. Inbound messages arrive the
//! same way, so every CMGL/CMGR body line runs through a UCS-2 sniffing
//! decoder.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error};

use crate::at::{raise_if_error, AtChannel};
use crate::error::{Error, Result};

/// How long to wait for the `>` prompt after `AT+CMGS`.
const PROMPT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default deadline for the send result after Ctrl-Z.
const SEND_TIMEOUT: Duration = Duration::from_secs(60);

const CMGL_PREFIX: &str = "+CMGL: ";
const CMGR_PREFIX: &str = "+CMGR: ";

/// A stored SMS message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmsMessage {
    pub index: u32,
    /// Status tag: `REC UNREAD`, `REC READ`, `STO SENT`, ...
    pub status: String,
    pub sender: String,
    pub timestamp: String,
    /// Message body, UCS-2 hex already decoded to Unicode.
    pub text: String,
}

/// SMS service over an AT channel.
pub struct Sms<'a> {
    at: &'a AtChannel,
}

impl<'a> Sms<'a> {
    #[must_use]
    pub fn new(at: &'a AtChannel) -> Self {
        Self { at }
    }

    fn text_mode(&self) -> Result<()> {
        self.at.command("AT+CMGF=1", Duration::from_secs(5))?;
        Ok(())
    }

    fn set_charset(&self, charset: &str) -> Result<()> {
        self.at
            .command(&format!("AT+CSCS=\"{charset}\""), Duration::from_secs(5))?;
        Ok(())
    }

    /// Configure the new-message URC: `AT+CNMI=<mode>,<mt>,0,0,0`. The
    /// default `(2, 1)` produces a `+CMTI` line on arrival.
    pub fn set_new_message_indication(&self, mode: u8, mt: u8) -> Result<()> {
        self.at
            .command(&format!("AT+CNMI={mode},{mt},0,0,0"), Duration::from_secs(5))?;
        Ok(())
    }

    /// Block until a `+CMTI` new-message URC arrives (see
    /// [`set_new_message_indication`](Self::set_new_message_indication)),
    /// returning the storage index it announces.
    pub fn wait_for_new_message(&self, timeout: Duration) -> Result<u32> {
        // +CMTI: "SM",3
        let line = self.at.wait_for_urc("+CMTI:", timeout)?;
        line.rsplit(',')
            .next()
            .and_then(|p| p.trim().parse().ok())
            .ok_or_else(|| Error::Sms(format!("could not parse {line:?}")))
    }

    /// Send a message in text mode.
    ///
    /// Fire-and-forget contract: any failure is logged and reported as
    /// `false` rather than raised.
    #[must_use]
    pub fn send(&self, number: &str, text: &str) -> bool {
        self.send_with_timeout(number, text, SEND_TIMEOUT)
    }

    /// [`send`](Self::send) with an explicit deadline for the final
    /// `OK`/`ERROR`.
    #[must_use]
    pub fn send_with_timeout(&self, number: &str, text: &str, timeout: Duration) -> bool {
        match self.send_inner(number, text, timeout) {
            Ok(()) => true,
            Err(e) => {
                error!("SMS send failed: {e}");
                false
            }
        }
    }

    fn send_inner(&self, number: &str, text: &str, timeout: Duration) -> Result<()> {
        self.text_mode()?;

        // UCS2 text mode is how SIM800 does Unicode SMS.
        let use_ucs2 = needs_ucs2(text) || needs_ucs2(number);
        let (number_field, body) = if use_ucs2 {
            self.set_charset("UCS2")?;
            (ucs2_hex(number), ucs2_hex(text).into_bytes())
        } else {
            self.set_charset("GSM")?;
            (number.to_string(), text.as_bytes().to_vec())
        };

        self.at.exclusive(|io| {
            io.wake()?;

            debug!("AT >> AT+CMGS ({} byte body)", body.len());
            io.write_raw(format!("AT+CMGS=\"{number_field}\"\r\n").as_bytes())?;

            let deadline = Instant::now() + PROMPT_TIMEOUT;
            let pos = io
                .read_until_contains(b">", 0, deadline, "CMGS prompt")
                .map_err(|e| match e {
                    Error::Timeout(_) => Error::Sms("no '>' prompt from AT+CMGS".into()),
                    other => other,
                })?;
            io.take(pos + 1);

            io.write_raw(&body)?;
            io.write_raw(&[0x1A])?; // Ctrl-Z terminates the body

            let resp = io.read_until_terminal(timeout, None)?;
            raise_if_error("AT+CMGS", &resp)
        })
    }

    /// All stored messages, keyed by index. Failures are logged and
    /// yield an empty map.
    #[must_use]
    pub fn read_all(&self) -> BTreeMap<u32, SmsMessage> {
        match self.list("ALL") {
            Ok(messages) => messages.into_iter().map(|m| (m.index, m)).collect(),
            Err(e) => {
                error!("SMS read_all failed: {e}");
                BTreeMap::new()
            }
        }
    }

    /// Messages matching a CMGL status filter: `ALL`, `REC UNREAD`,
    /// `REC READ`, `STO UNSENT`, `STO SENT`.
    pub fn list(&self, status: &str) -> Result<Vec<SmsMessage>> {
        self.text_mode()?;
        let resp = self
            .at
            .command(&format!("AT+CMGL=\"{status}\""), Duration::from_secs(20))?;
        Ok(parse_cmgl(&String::from_utf8_lossy(&resp.raw)))
    }

    /// Read one message by index.
    pub fn read(&self, index: u32) -> Result<SmsMessage> {
        self.text_mode()?;
        let resp = self
            .at
            .command(&format!("AT+CMGR={index}"), Duration::from_secs(10))?;
        parse_cmgr(&resp.lines, index)
            .ok_or_else(|| Error::Sms(format!("no SMS at index {index}")))
    }

    /// Delete by index. `flag` 0 deletes that index only; 1 deletes all
    /// read messages; 2–4 widen the scope per the CMGD flag table.
    pub fn delete(&self, index: u32, flag: u8) -> Result<()> {
        self.text_mode()?;
        self.at
            .command(&format!("AT+CMGD={index},{flag}"), Duration::from_secs(10))?;
        Ok(())
    }

    /// Delete all read messages, leaving unread and outgoing ones alone.
    /// CMGD needs some valid index, so one is fetched first. Best-effort.
    pub fn delete_all_read(&self) {
        let messages = self.read_all();
        let Some(&index) = messages.keys().next() else {
            return;
        };
        if let Err(e) = self
            .at
            .command(&format!("AT+CMGD={index},1"), Duration::from_secs(10))
        {
            error!("SMS delete_all_read failed: {e}");
        }
    }
}

/// True when `s` cannot travel as GSM-7 (rough heuristic: any codepoint
/// above 127).
fn needs_ucs2(s: &str) -> bool {
    s.chars().any(|c| c as u32 > 127)
}

/// Uppercase hex of the UTF-16 BE encoding, e.g. `"AÄ"` → `"004100C4"`.
pub(crate) fn ucs2_hex(s: &str) -> String {
    use std::fmt::Write;
    s.encode_utf16().fold(String::new(), |mut out, unit| {
        let _ = write!(out, "{unit:04X}");
        out
    })
}

/// Decode a line that looks like UCS-2 hex; anything else passes through
/// verbatim. "Looks like": length divisible by 4, all hex digits.
fn try_decode_ucs2(line: &str) -> String {
    let t = line.trim();
    if t.is_empty() || t.len() % 4 != 0 || !t.bytes().all(|b| b.is_ascii_hexdigit()) {
        return line.to_string();
    }
    let units: Vec<u16> = (0..t.len() / 4)
        .filter_map(|i| u16::from_str_radix(&t[i * 4..i * 4 + 4], 16).ok())
        .collect();
    match String::from_utf16(&units) {
        Ok(decoded) => decoded,
        Err(_) => line.to_string(),
    }
}

/// Parse an `AT+CMGL` response.
///
/// Grammar: an entry starts with a headline
/// `+CMGL: <index>,"<stat>","<number>","","<datetime>"` — split on `,"`
/// into exactly five fields — followed by body lines until the next
/// headline or the terminating `OK`.
fn parse_cmgl(text: &str) -> Vec<SmsMessage> {
    let mut out: Vec<SmsMessage> = Vec::new();
    let mut current: Option<SmsMessage> = None;
    let mut body: Vec<String> = Vec::new();

    let flush = |current: &mut Option<SmsMessage>, body: &mut Vec<String>, out: &mut Vec<SmsMessage>| {
        if let Some(mut msg) = current.take() {
            msg.text = body.join("\n");
            out.push(msg);
        }
        body.clear();
    };

    let normalized = text.replace('\r', "\n");
    for line in normalized.split('\n') {
        if line.starts_with(CMGL_PREFIX) {
            flush(&mut current, &mut body, &mut out);

            let fields: Vec<&str> = line.split(",\"").collect();
            if fields.len() != 5 {
                continue;
            }
            let fields: Vec<&str> = fields.iter().map(|f| f.trim_matches('"')).collect();
            let Ok(index) = fields[0][CMGL_PREFIX.len()..].trim().parse() else {
                continue;
            };
            current = Some(SmsMessage {
                index,
                status: fields[1].to_string(),
                sender: fields[2].to_string(),
                timestamp: fields[4].to_string(),
                text: String::new(),
            });
        } else {
            if current.is_none() {
                continue;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.eq_ignore_ascii_case("ok") {
                break;
            }
            body.push(try_decode_ucs2(line));
        }
    }

    flush(&mut current, &mut body, &mut out);
    out
}

/// Parse an `AT+CMGR` response: `+CMGR: "<stat>","<oa>",,"<scts>"`.
/// Field extraction goes by quoted substrings, which tolerates both the
/// `,,` and `,"",` renderings of the empty alpha field.
fn parse_cmgr(lines: &[String], index: u32) -> Option<SmsMessage> {
    let headline = lines.iter().find(|l| l.starts_with(CMGR_PREFIX))?;

    let quoted = quoted_fields(headline);
    let status = *quoted.first()?;
    let sender = quoted.get(1).copied().unwrap_or("");
    let timestamp = if quoted.len() > 2 {
        *quoted.last().unwrap_or(&"")
    } else {
        ""
    };

    let body: Vec<String> = lines
        .iter()
        .filter(|l| {
            !l.starts_with(CMGR_PREFIX)
                && !l.starts_with('+')
                && l.as_str() != "OK"
                && l.as_str() != "ERROR"
        })
        .map(|l| try_decode_ucs2(l))
        .collect();

    Some(SmsMessage {
        index,
        status: status.to_string(),
        sender: sender.to_string(),
        timestamp: timestamp.to_string(),
        text: body.join("\n"),
    })
}

/// All double-quoted substrings of a line, in order.
fn quoted_fields(line: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = line;
    while let Some(start) = rest.find('"') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('"') else { break };
        out.push(&after[..end]);
        rest = &after[end + 1..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::test_channel;

    #[test]
    fn test_ucs2_hex_encoding() {
        assert_eq!(ucs2_hex("AÄ"), "004100C4");
        assert_eq!(ucs2_hex("AB"), "00410042");
        // Astral chars become a surrogate pair.
        assert_eq!(ucs2_hex("😀"), "D83DDE00");
    }

    #[test]
    fn test_ucs2_decode_roundtrip_lines() {
        assert_eq!(try_decode_ucs2("0041004200C4"), "AB\u{C4}");
        assert_eq!(try_decode_ucs2("hello"), "hello");
        assert_eq!(try_decode_ucs2("00480065006C006C006F"), "Hello");
        // Not a multiple of four hex digits — verbatim.
        assert_eq!(try_decode_ucs2("0041004"), "0041004");
        // Mixed case still decodes.
        assert_eq!(try_decode_ucs2("00c400e9"), "Äé");
    }

    #[test]
    fn test_send_ascii_uses_gsm_charset() {
        let (chan, state) = test_channel(&[
            b"OK\r\n", // CMGF
            b"OK\r\n", // CSCS
            b"> ",
            b"+CMGS: 4\r\nOK\r\n",
        ]);
        assert!(Sms::new(&chan).send("+12025550123", "hi there"));

        let written = state.lock().unwrap().written.clone();
        let text = String::from_utf8_lossy(&written).to_string();
        assert!(text.contains("AT+CSCS=\"GSM\"\r\n"));
        assert!(text.contains("AT+CMGS=\"+12025550123\"\r\n"));
        // Body followed by Ctrl-Z.
        let body_at = text.find("hi there").unwrap();
        assert_eq!(written[body_at + "hi there".len()], 0x1A);
    }

    #[test]
    fn test_send_non_ascii_switches_to_ucs2() {
        let (chan, state) = test_channel(&[
            b"OK\r\n",
            b"OK\r\n",
            b"> ",
            b"+CMGS: 5\r\nOK\r\n",
        ]);
        assert!(Sms::new(&chan).send("+12025550123", "grüß"));

        let written = state.lock().unwrap().written.clone();
        let text = String::from_utf8_lossy(&written).to_string();
        assert!(text.contains("AT+CSCS=\"UCS2\"\r\n"));
        // Number and body both travel as uppercase UTF-16 BE hex.
        assert!(text.contains(&format!("AT+CMGS=\"{}\"\r\n", ucs2_hex("+12025550123"))));
        assert!(text.contains(&ucs2_hex("grüß")));
    }

    #[test]
    fn test_send_failure_reports_false() {
        // Modem rejects the body after the prompt; the fire-and-forget
        // contract turns the CMS error into false.
        let (chan, _) = test_channel(&[
            b"OK\r\n",
            b"OK\r\n",
            b"> ",
            b"+CMS ERROR: 500\r\n",
        ]);
        assert!(!Sms::new(&chan).send("+12025550123", "x"));
    }

    #[test]
    fn test_cmgl_parse_multiple_entries() {
        let wire = "+CMGL: 1,\"REC UNREAD\",\"+12025550123\",\"\",\"21/07/15,10:00:00+08\"\n\
                    first message\n\
                    +CMGL: 2,\"REC READ\",\"+443300\",\"\",\"21/07/16,11:30:00+08\"\n\
                    0041004200C4\n\
                    OK\n";
        let msgs = parse_cmgl(wire);
        assert_eq!(msgs.len(), 2);

        assert_eq!(msgs[0].index, 1);
        assert_eq!(msgs[0].status, "REC UNREAD");
        assert_eq!(msgs[0].sender, "+12025550123");
        assert_eq!(msgs[0].timestamp, "21/07/15,10:00:00+08");
        assert_eq!(msgs[0].text, "first message");

        assert_eq!(msgs[1].index, 2);
        assert_eq!(msgs[1].text, "AB\u{C4}");
    }

    #[test]
    fn test_cmgl_parse_multiline_body() {
        let wire = "+CMGL: 7,\"REC READ\",\"+1\",\"\",\"ts\"\nline one\nline two\nOK\n";
        let msgs = parse_cmgl(wire);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text, "line one\nline two");
    }

    #[test]
    fn test_cmgl_parse_skips_malformed_headlines() {
        // A bare `,,` rendering of the alpha field does not split into
        // five fields and is skipped, as is a non-numeric index.
        let wire = "+CMGL: 9,\"REC READ\",\"+2\",,\"ts\"\nnot captured\n\
                    +CMGL: 3,\"REC READ\",\"+1\",\"\",\"ts\"\nbody\nOK\n";
        let msgs = parse_cmgl(wire);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].index, 3);
    }

    /// Canonical serializer echoing the CMGL wire grammar, used to check
    /// that parsing is a fixpoint.
    fn serialize_cmgl(messages: &[SmsMessage]) -> String {
        let mut wire = String::new();
        for m in messages {
            wire.push_str(&format!(
                "+CMGL: {},\"{}\",\"{}\",\"\",\"{}\"\n{}\n",
                m.index, m.status, m.sender, m.timestamp, m.text
            ));
        }
        wire.push_str("OK\n");
        wire
    }

    #[test]
    fn test_cmgl_parse_is_idempotent() {
        let wire = "+CMGL: 1,\"REC UNREAD\",\"+12025550123\",\"\",\"21/07/15,10:00:00+08\"\n\
                    0041004200C4\n\
                    +CMGL: 2,\"REC READ\",\"+4433\",\"\",\"21/07/16,11:30:00+08\"\n\
                    plain body\n\
                    OK\n";
        let once = parse_cmgl(wire);
        let twice = parse_cmgl(&serialize_cmgl(&once));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_read_all_keys_by_index() {
        let (chan, _) = test_channel(&[
            b"OK\r\n", // CMGF
            b"+CMGL: 4,\"REC READ\",\"+1\",\"\",\"ts\"\r\nhello\r\nOK\r\n",
        ]);
        let map = Sms::new(&chan).read_all();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&4].text, "hello");
    }

    #[test]
    fn test_read_all_swallows_errors() {
        let (chan, _) = test_channel(&[b"ERROR\r\n"]);
        assert!(Sms::new(&chan).read_all().is_empty());
    }

    #[test]
    fn test_cmgr_parse() {
        let lines = vec![
            "+CMGR: \"REC READ\",\"+12025550123\",,\"21/07/15,10:00:00+08\"".to_string(),
            "00480065006C006C006F".to_string(),
            "OK".to_string(),
        ];
        let msg = parse_cmgr(&lines, 9).unwrap();
        assert_eq!(msg.index, 9);
        assert_eq!(msg.status, "REC READ");
        assert_eq!(msg.sender, "+12025550123");
        assert_eq!(msg.text, "Hello");
    }

    #[test]
    fn test_delete_flags() {
        let (chan, state) = test_channel(&[b"OK\r\n", b"OK\r\n"]);
        Sms::new(&chan).delete(3, 0).unwrap();
        let written = state.lock().unwrap().written.clone();
        assert!(String::from_utf8_lossy(&written).contains("AT+CMGD=3,0\r\n"));
    }

    #[test]
    fn test_delete_all_read_uses_first_index() {
        let (chan, state) = test_channel(&[
            b"OK\r\n", // CMGF
            b"+CMGL: 6,\"REC READ\",\"+1\",\"\",\"ts\"\r\nx\r\nOK\r\n",
            b"OK\r\n", // CMGD
        ]);
        Sms::new(&chan).delete_all_read();
        let written = state.lock().unwrap().written.clone();
        assert!(String::from_utf8_lossy(&written).contains("AT+CMGD=6,1\r\n"));
    }

    #[test]
    fn test_wait_for_new_message_parses_index() {
        let (chan, _) = test_channel(&[b"+CMTI: \"SM\",3\r\n"]);
        let index = Sms::new(&chan)
            .wait_for_new_message(Duration::from_millis(200))
            .unwrap();
        assert_eq!(index, 3);
    }

    #[test]
    fn test_new_message_indication() {
        let (chan, state) = test_channel(&[b"OK\r\n"]);
        Sms::new(&chan).set_new_message_indication(2, 1).unwrap();
        let written = state.lock().unwrap().written.clone();
        assert!(String::from_utf8_lossy(&written).contains("AT+CNMI=2,1,0,0,0\r\n"));
    }
}
