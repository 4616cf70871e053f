//! Identity-keyed authorization table: PSK lookup plus compiled regex
//! policies deciding which commands an authenticated identity may push.
//!
//! Grounded on the original receiver's `hash_insert`/`hash_lookup`/
//! `check_psk`/`is_authorized` quartet: a plain identity-to-record map
//! (no custom hashing strategy, as the distilled spec leaves that detail
//! out-of-scope) with `*` as the fallback identity for both the PSK
//! lookup and the authorization check.

use crate::error::Error;
use regex::Regex;
use std::collections::HashMap;

/// Fallback identity consulted when no exact match exists.
const WILDCARD_IDENTITY: &str = "*";

/// One identity's password and the three pattern categories that
/// together decide which commands it may submit.
pub struct AuthEntry {
    identity: String,
    password: String,
    commands: Vec<Regex>,
    hosts: Vec<Regex>,
    services: Vec<Regex>,
}

impl AuthEntry {
    /// Compiles the configured pattern lists for one `authorize`
    /// block. `hosts` patterns are wrapped to match a
    /// `PROCESS_HOST_CHECK_RESULT` command for the given host; `services`
    /// patterns accept an optional `<service>@<host>` syntax and are
    /// wrapped to match the corresponding `PROCESS_SERVICE_CHECK_RESULT`
    /// command. All three are anchored so a trailing `\n` is optional
    /// but nothing may follow it.
    pub fn compile(
        identity: String,
        password: String,
        commands: &[String],
        hosts: &[String],
        services: &[String],
    ) -> Result<Self, Error> {
        let commands = commands
            .iter()
            .map(|pat| Regex::new(&format!("^{}\n?$", pat)))
            .collect::<Result<Vec<_>, _>>()?;

        let hosts = hosts
            .iter()
            .map(|pat| Regex::new(&format!("^PROCESS_HOST_CHECK_RESULT;{};.+\n?$", pat)))
            .collect::<Result<Vec<_>, _>>()?;

        let services = services
            .iter()
            .map(|pat| {
                let (host_pat, service_pat) = match pat.rfind('@') {
                    Some(at) => (&pat[at + 1..], &pat[..at]),
                    None => ("[^;]+", pat.as_str()),
                };
                Regex::new(&format!(
                    "^PROCESS_SERVICE_CHECK_RESULT;{};{};.+;.+\n?$",
                    host_pat, service_pat
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AuthEntry {
            identity,
            password,
            commands,
            hosts,
            services,
        })
    }
}

/// The full set of configured identities, queried by the PSK callback
/// and by the per-command authorization check.
#[derive(Default)]
pub struct AuthTable {
    entries: HashMap<String, AuthEntry>,
}

impl AuthTable {
    pub fn new() -> Self {
        AuthTable::default()
    }

    /// Registers an identity. Duplicate identities are a configuration
    /// error caught at load time, matching the documented
    /// undefined-on-duplicate-insert semantics of the original hash
    /// table.
    pub fn insert(&mut self, entry: AuthEntry) -> Result<(), Error> {
        if self.entries.contains_key(&entry.identity) {
            return Err(Error::Config(format!(
                "duplicate authorize identity '{}'",
                entry.identity
            )));
        }
        self.entries.insert(entry.identity.clone(), entry);
        Ok(())
    }

    /// Password to present for `check_psk`, falling back to the `*`
    /// entry when `identity` was not configured explicitly.
    pub fn password_for(&self, identity: &str) -> Option<&str> {
        self.entries
            .get(identity)
            .or_else(|| self.entries.get(WILDCARD_IDENTITY))
            .map(|e| e.password.as_str())
    }

    /// Validates a complete, newline-terminated command payload against
    /// the authenticated identity's patterns (falling back to `*`).
    ///
    /// Requirements, in order: the payload ends with exactly one `\n`
    /// and has no interior newline; it contains a `]` closing the
    /// leading `[<timestamp>]` block; the whitespace-stripped text
    /// after that `]` matches at least one compiled `commands`,
    /// `hosts`, or `services` pattern for the resolved identity.
    pub fn is_authorized(&self, identity: &str, command: &[u8]) -> bool {
        if command.last() != Some(&b'\n') {
            return false;
        }
        if command[..command.len() - 1].contains(&b'\n') {
            return false;
        }
        let bracket = match command.iter().position(|&b| b == b']') {
            Some(p) => p,
            None => return false,
        };
        let mut rest = &command[bracket + 1..];
        while matches!(rest.first(), Some(b' ') | Some(b'\t')) {
            rest = &rest[1..];
        }
        let body = match std::str::from_utf8(rest) {
            Ok(s) => s,
            Err(_) => return false,
        };

        let entry = match self
            .entries
            .get(identity)
            .or_else(|| self.entries.get(WILDCARD_IDENTITY))
        {
            Some(e) => e,
            None => return false,
        };

        entry.commands.iter().any(|re| re.is_match(body))
            || entry.hosts.iter().any(|re| re.is_match(body))
            || entry.services.iter().any(|re| re.is_match(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(identity: &str, hosts: &[&str], services: &[&str]) -> AuthTable {
        let mut table = AuthTable::new();
        let entry = AuthEntry::compile(
            identity.to_string(),
            "forty-two".to_string(),
            &[],
            &hosts.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &services.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
        .unwrap();
        table.insert(entry).unwrap();
        table
    }

    #[test]
    fn host_check_matches_configured_host_pattern() {
        let table = table_with("tester", &["h1"], &[]);
        let cmd = b"[1690000000] PROCESS_HOST_CHECK_RESULT;h1;0;OK\n";
        assert!(table.is_authorized("tester", cmd));
    }

    #[test]
    fn unauthorized_host_is_rejected() {
        let table = table_with("tester", &["h1"], &[]);
        let cmd = b"[1690000000] PROCESS_HOST_CHECK_RESULT;h2;0;OK\n";
        assert!(!table.is_authorized("tester", cmd));
    }

    #[test]
    fn service_at_host_syntax_scopes_the_match() {
        let table = table_with("tester", &[], &["disk@h1"]);
        let authorized = b"[1690000000] PROCESS_SERVICE_CHECK_RESULT;h1;disk;0;OK\n";
        let wrong_host = b"[1690000000] PROCESS_SERVICE_CHECK_RESULT;h2;disk;0;OK\n";
        assert!(table.is_authorized("tester", authorized));
        assert!(!table.is_authorized("tester", wrong_host));
    }

    #[test]
    fn rejects_interior_newline() {
        let table = table_with("tester", &["h1"], &[]);
        let cmd = b"[1690000000] PROCESS_HOST_CHECK_RESULT;h1;0;one\\nembedded\nextra\n";
        assert!(!table.is_authorized("tester", cmd));
    }

    #[test]
    fn wildcard_identity_is_fallback() {
        let mut table = AuthTable::new();
        let entry = AuthEntry::compile(
            "*".to_string(),
            "anonymous".to_string(),
            &[],
            &["h1".to_string()],
            &[],
        )
        .unwrap();
        table.insert(entry).unwrap();
        let cmd = b"[1690000000] PROCESS_HOST_CHECK_RESULT;h1;0;OK\n";
        assert!(table.is_authorized("someone-else", cmd));
        assert_eq!(table.password_for("someone-else"), Some("anonymous"));
    }

    #[test]
    fn duplicate_identity_is_rejected_at_load() {
        let mut table = AuthTable::new();
        let entry1 = AuthEntry::compile("tester".to_string(), "a".to_string(), &[], &[], &[]).unwrap();
        let entry2 = AuthEntry::compile("tester".to_string(), "b".to_string(), &[], &[], &[]).unwrap();
        table.insert(entry1).unwrap();
        assert!(table.insert(entry2).is_err());
    }
}
