//! Fuzz harness for the subscriber and provider line parsers.
//!
//! Both parsers sit directly behind the sockets and see raw client input,
//! so they must never panic: every line yields either a command or an
//! `InvalidCommand` error whose message renders cleanly into an `error:`
//! reply line.

#![no_main]
use contextd_daemon::protocol::{
    error_line, parse_provider_line, parse_subscriber_line, push_line, value_reply,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The connection tasks only hand complete UTF-8 lines to the parsers.
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    let line = line.trim_end_matches('\r');

    match parse_subscriber_line(line) {
        Ok(_) => {},
        Err(err) => {
            let _ = error_line(&err.to_string());
        },
    }

    match parse_provider_line(line) {
        // A parsed declaration must render back to valid wire text.
        Ok(contextd_daemon::protocol::ProviderCommand::Declare { key, value }) => {
            let _ = push_line(&key, Some(&value));
            let _ = value_reply(Some(&value));
        },
        Ok(_) => {},
        Err(err) => {
            let _ = error_line(&err.to_string());
        },
    }
});
