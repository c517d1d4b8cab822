//! Fuzz target: `protocol::parse_command`
//!
//! Feeds arbitrary broker payloads into the command decoder and checks that
//! every decoded field respects its wire limit and that an acknowledgement
//! can always be built for whatever id came out.
//!
//! cargo fuzz run fuzz_command_parser

#![no_main]

use gatelink::protocol::{self, error_code};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(cmd) = protocol::parse_command(data) else {
        return;
    };

    assert!(cmd.request_id.len() <= 36);
    assert!(cmd.command.len() <= 15);
    assert!(cmd.user_id.len() <= 63);

    let ack = protocol::create_ack(&cmd.request_id, false, Some(error_code::COOLDOWN))
        .expect("ack for a decoded id must encode");
    assert!(!ack.is_empty());
});
