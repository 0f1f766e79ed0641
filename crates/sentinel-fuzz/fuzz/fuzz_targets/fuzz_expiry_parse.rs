#![no_main]

use libfuzzer_sys::fuzz_target;
use slack_mcp_oauth::backup::BackupRecord;
use slack_mcp_oauth::server::oauth::expiry::normalize_expiry;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = normalize_expiry(text);
        if let Ok(secs) = text.trim().parse::<f64>() {
            let _ = normalize_expiry(secs);
        }
    }
    // Backup objects carry expiries in whatever shape the writer used
    let _ = serde_json::from_slice::<BackupRecord>(data);
});
