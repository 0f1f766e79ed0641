#![no_main]

use libfuzzer_sys::fuzz_target;
use slack_mcp_oauth::server::oauth::handlers::RegisterRequest;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<RegisterRequest>(data);
});
