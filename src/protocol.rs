//! The line-oriented wire grammar shared by the submitter and receiver
//! state machines: verb formatting, input-chunk-to-command formatting,
//! and the handful of helpers both sides need (nonce generation, escape
//! rules, the Unix timestamp used in `[<now>]` prefixes).
//!
//! Parsing of a concrete line into "what does this mean in the state
//! we're in" stays in the two state machines (`submitter`, `receiver`):
//! the accepted verb set differs per state, so a single generic line
//! parser would just be reimplemented by both callers anyway.

use crate::error::Error;
use base64::STANDARD_NO_PAD;
use rand::RngCore;

/// Every atomic pipe write up to this many bytes is guaranteed by POSIX
/// not to interleave with a concurrent writer. Matches
/// `examples/original_source/src/server/fifo.c`'s `#ifndef PIPE_BUF /
/// #define PIPE_BUF 512`: that fallback only kicks in when `<limits.h>`
/// doesn't define a real value for the target, so here too we defer to
/// the platform's own `<limits.h>` constant via `libc::PIPE_BUF` (4096 on
/// Linux, 512 on most BSDs/macOS) instead of hardcoding the POSIX floor.
pub const PIPE_BUF: usize = libc::PIPE_BUF as usize;

/// Maximum accepted length of a single protocol line, in bytes, not
/// counting its terminator.
pub const MAX_LINE_LENGTH: usize = 2048;

/// Number of random bytes in the client-generated session nonce.
const NONCE_BYTES: usize = 6;

/// Splits an ASCII protocol line into whitespace-separated tokens.
pub fn tokenize(line: &[u8]) -> Result<Vec<String>, Error> {
    let s = std::str::from_utf8(line)?;
    Ok(s.split_whitespace().map(str::to_string).collect())
}

/// Case-insensitive verb comparison, matching the receiver's tolerance
/// for `push`, `Push`, `PUSH`, etc.
pub fn verb_is(token: &str, verb: &str) -> bool {
    token.eq_ignore_ascii_case(verb)
}

/// Generates a fresh 6-byte session nonce, base64-encoded without
/// padding or embedded newlines, suitable for inclusion in a `MOIN`
/// line and as the connection's logging label.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::encode_config(bytes, STANDARD_NO_PAD)
}

pub fn format_moin(nonce: &str) -> String {
    format!("MOIN 1 {}", nonce)
}

pub fn format_moin1() -> String {
    "MOIN 1".to_string()
}

pub fn format_pong1() -> String {
    "PONG 1".to_string()
}

pub fn format_ping() -> String {
    "PING".to_string()
}

pub fn format_push(n: usize) -> String {
    format!("PUSH {}", n)
}

pub fn format_okay() -> String {
    "OKAY".to_string()
}

pub fn format_noop() -> String {
    "NOOP".to_string()
}

pub fn format_quit() -> String {
    "QUIT".to_string()
}

pub fn format_fail(reason: &str) -> String {
    format!("FAIL {}", reason)
}

pub fn format_bail(reason: &str) -> String {
    format!("BAIL {}", reason)
}

/// Seconds since the Unix epoch, used as the `[<now>]` prefix on every
/// command handed to the sink.
pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Escapes backslashes and embedded newlines so the resulting field can
/// never introduce a second line into a command payload.
fn escape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

/// Formats one `CHECK_RESULT`-mode input chunk (tab-delimited by
/// default) into a `PROCESS_HOST_CHECK_RESULT` or
/// `PROCESS_SERVICE_CHECK_RESULT` command, terminated by a single `\n`.
///
/// Three fields (`host`, `status`, `output`) produce a host check;
/// four (`host`, `service`, `status`, `output`) produce a service
/// check. Any other field count is a fatal input-format error.
pub fn format_check_result(chunk: &[u8], delimiter: u8) -> Result<Vec<u8>, Error> {
    let text = std::str::from_utf8(chunk)?;
    let fields: Vec<&str> = text.split(delimiter as char).collect();
    let now = now_unix();
    let body = match fields.as_slice() {
        [host, status, output] => format!(
            "[{}] PROCESS_HOST_CHECK_RESULT;{};{};{}",
            now,
            host,
            status,
            escape_field(output)
        ),
        [host, service, status, output] => format!(
            "[{}] PROCESS_SERVICE_CHECK_RESULT;{};{};{};{}",
            now,
            host,
            service,
            status,
            escape_field(output)
        ),
        _ => return Err(Error::Protocol("Input format incorrect".to_string())),
    };
    let mut out = body.into_bytes();
    out.push(b'\n');
    Ok(out)
}

/// Formats one `COMMAND`-mode input chunk: used verbatim if it already
/// begins with `[`, otherwise prefixed with `[<now>] `. Always
/// terminated by a single `\n`.
pub fn format_raw_command(chunk: &[u8]) -> Result<Vec<u8>, Error> {
    let text = std::str::from_utf8(chunk)?;
    let mut body = if text.starts_with('[') {
        text.to_string()
    } else {
        format!("[{}] {}", now_unix(), text)
    };
    body.push('\n');
    Ok(body.into_bytes())
}

/// Synthesizes the follow-up command the sink feeds back through its
/// own write path after successfully dumping an oversized batch to a
/// temp file.
pub fn format_process_file(path: &str) -> Vec<u8> {
    format!("[{}] PROCESS_FILE;{};1\n", now_unix(), path).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_check_three_fields() {
        let out = format_check_result(b"h1\t0\tOK", b'\t').unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.starts_with('['));
        assert!(s.contains("] PROCESS_HOST_CHECK_RESULT;h1;0;OK"));
        assert!(s.ends_with('\n'));
    }

    #[test]
    fn service_check_four_fields() {
        let out = format_check_result(b"h1\tdisk\t2\tCRITICAL - 97%%", b'\t').unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("] PROCESS_SERVICE_CHECK_RESULT;h1;disk;2;CRITICAL - 97%%"));
    }

    #[test]
    fn escapes_backslash_and_newline_in_output_only() {
        let out = format_check_result(b"h1\tdisk\t0\tline1\nline2", b'\t').unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("PROCESS_SERVICE_CHECK_RESULT;h1;disk;0;line1\\nline2\n"));
        assert!(!s.contains("line1\nline2"));
    }

    #[test]
    fn bad_field_count_is_fatal() {
        let err = format_check_result(b"only-one-field", b'\t').unwrap_err();
        match err {
            Error::Protocol(_) => {}
            other => panic!("expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn raw_command_prepends_timestamp_unless_bracketed() {
        let out = format_raw_command(b"PROCESS_FILE;/tmp/x;1").unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.starts_with('['));
        assert!(s.ends_with("PROCESS_FILE;/tmp/x;1\n"));

        let out = format_raw_command(b"[123] ALREADY_TAGGED").unwrap();
        assert_eq!(out, b"[123] ALREADY_TAGGED\n");
    }

    #[test]
    fn nonce_has_no_newline_and_right_length() {
        let nonce = generate_nonce();
        assert!(!nonce.contains('\n'));
        // 6 bytes base64-encoded without padding is 8 characters.
        assert_eq!(nonce.len(), 8);
    }

    #[test]
    fn tokenize_splits_on_whitespace() {
        let tokens = tokenize(b"MOIN 1 abc123").unwrap();
        assert_eq!(tokens, vec!["MOIN", "1", "abc123"]);
    }
}
