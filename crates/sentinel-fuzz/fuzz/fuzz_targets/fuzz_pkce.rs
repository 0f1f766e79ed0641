#![no_main]

use libfuzzer_sys::fuzz_target;
use slack_mcp_oauth::server::oauth::pkce::{challenge_s256, verify_s256};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let (verifier, challenge) = text.split_once('\n').unwrap_or((text, ""));

    assert!(verify_s256(verifier, &challenge_s256(verifier)));
    if challenge != challenge_s256(verifier) {
        assert!(!verify_s256(verifier, challenge));
    }
});
