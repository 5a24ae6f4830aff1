//! Command vocabulary for the two line protocols.
//!
//! Subscriber sessions speak `new`/`del`/`v`/`providers`; providers announce
//! with `provider`, declare keys with `add`, and update them with bare
//! `key=value` lines or `unset`. Keywords are case-sensitive and matched on
//! the first whitespace-delimited token. Parsing failures carry the reason
//! echoed back as an `error:` line on the offending connection.
//!
//! The response renderers live here too so the wire shapes (`<Key> =
//! <Type>:<value>` pushes, `value:` replies, `providers:` replies) have a
//! single home.

use contextd_core::value::{is_valid_key, render_opt, ContextType, ContextValue};

use super::error::{ProtocolError, ProtocolResult};

// ============================================================================
// Commands
// ============================================================================

/// A parsed subscriber-plane command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberCommand {
    /// `new <Key>`: subscribe; the current value is pushed immediately.
    Subscribe {
        /// Property key to watch.
        key: String,
    },
    /// `del <Key>` / `delete <Key>`: drop one subscription.
    Unsubscribe {
        /// Property key to stop watching.
        key: String,
    },
    /// `v <Key>` / `value <Key>`: one-shot read, no subscription.
    Query {
        /// Property key to read.
        key: String,
    },
    /// `providers <Key>`: report who currently serves the key.
    Providers {
        /// Property key to look up.
        key: String,
    },
}

/// A parsed provider-plane command.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCommand {
    /// `provider <id>`: announce identity; must precede everything else.
    Announce {
        /// Provider identifier, reported in `providers:` replies.
        id: String,
    },
    /// `add <type> <key> <value>`: declare a key and take ownership.
    ///
    /// The initial value is parsed against the declared type at the protocol
    /// layer, so a `Declare` always carries a well-typed value.
    Declare {
        /// Property key being declared.
        key: String,
        /// Initial value; its type locks the key.
        value: ContextValue,
    },
    /// `<key>=<value>`: update a declared key.
    ///
    /// The raw text after `=` is kept verbatim; it is parsed against the
    /// declared type once the owner and type lock are known.
    Set {
        /// Property key being updated.
        key: String,
        /// Unparsed value text.
        value: String,
    },
    /// `unset <key>`: transition the key to undefined, keeping ownership.
    Unset {
        /// Property key to undefine.
        key: String,
    },
}

// ============================================================================
// Parsing
// ============================================================================

/// Parses one subscriber line.
///
/// # Errors
///
/// [`ProtocolError::InvalidCommand`] for unknown keywords, missing or
/// malformed keys.
pub fn parse_subscriber_line(line: &str) -> ProtocolResult<SubscriberCommand> {
    let (keyword, rest) = split_word(line);
    match keyword {
        "new" => Ok(SubscriberCommand::Subscribe {
            key: parse_key(rest)?,
        }),
        "del" | "delete" => Ok(SubscriberCommand::Unsubscribe {
            key: parse_key(rest)?,
        }),
        "v" | "value" => Ok(SubscriberCommand::Query {
            key: parse_key(rest)?,
        }),
        "providers" => Ok(SubscriberCommand::Providers {
            key: parse_key(rest)?,
        }),
        other => Err(ProtocolError::invalid_command(format!(
            "unknown command {other:?}"
        ))),
    }
}

/// Parses one provider line.
///
/// Keyword commands are tried first; anything else must be a bare
/// `<key>=<value>` update.
///
/// # Errors
///
/// [`ProtocolError::InvalidCommand`] for unknown keywords, unknown types,
/// malformed keys, or an `add` value that does not parse as its type.
pub fn parse_provider_line(line: &str) -> ProtocolResult<ProviderCommand> {
    let (keyword, rest) = split_word(line);
    match keyword {
        "provider" => {
            let id = rest.trim();
            if id.is_empty() {
                return Err(ProtocolError::invalid_command("missing provider id"));
            }
            if id.contains(char::is_whitespace) {
                return Err(ProtocolError::invalid_command(format!(
                    "invalid provider id {id:?}"
                )));
            }
            Ok(ProviderCommand::Announce { id: id.to_string() })
        },
        "add" => {
            let (type_word, rest) = split_word(rest);
            let Some(key_type) = ContextType::parse_wire_name(type_word) else {
                return Err(ProtocolError::invalid_command(format!(
                    "unknown type {type_word:?}"
                )));
            };
            let (key_word, raw_value) = split_word(rest);
            let key = parse_key(key_word)?;
            let value = ContextValue::parse_typed(key_type, raw_value)
                .map_err(|err| ProtocolError::invalid_command(err.to_string()))?;
            Ok(ProviderCommand::Declare { key, value })
        },
        "unset" => Ok(ProviderCommand::Unset {
            key: parse_key(rest)?,
        }),
        _ => match line.split_once('=') {
            Some((key, value)) => Ok(ProviderCommand::Set {
                key: parse_key(key)?,
                value: value.to_string(),
            }),
            None => Err(ProtocolError::invalid_command(format!(
                "unknown command {keyword:?}"
            ))),
        },
    }
}

/// Splits off the first whitespace-delimited word.
fn split_word(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (line, ""),
    }
}

fn parse_key(text: &str) -> ProtocolResult<String> {
    let key = text.trim();
    if key.is_empty() {
        return Err(ProtocolError::invalid_command("missing property key"));
    }
    if !is_valid_key(key) {
        return Err(ProtocolError::invalid_command(format!(
            "invalid property key {key:?}"
        )));
    }
    Ok(key.to_string())
}

// ============================================================================
// Response rendering
// ============================================================================

/// Renders an asynchronous change push, e.g. `Session.State = QString:"normal"`.
#[must_use]
pub fn push_line(key: &str, value: Option<&ContextValue>) -> String {
    format!("{key} = {}", render_opt(value))
}

/// Renders a one-shot query reply, e.g. `value: QString:"normal"`.
#[must_use]
pub fn value_reply(value: Option<&ContextValue>) -> String {
    format!("value: {}", render_opt(value))
}

/// Renders a `providers` reply; an unowned key yields the bare prefix.
#[must_use]
pub fn providers_reply(key: &str, owner: Option<&str>) -> String {
    match owner {
        Some(owner) => format!("providers: {key}@/{owner}"),
        None => "providers: ".to_string(),
    }
}

/// Renders an error reply for the offending connection.
#[must_use]
pub fn error_line(reason: &str) -> String {
    format!("error: {reason}")
}
