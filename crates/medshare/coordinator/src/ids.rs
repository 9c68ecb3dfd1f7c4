//! Record id generation.

use chrono::{DateTime, Utc};
use rand::Rng;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 9;

/// `{prefix}_{millis}_{9 base36 chars}`, e.g. `auth_req_1717228800000_k3j9x0q2a`
pub fn generate_id(prefix: &str, now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}_{}_{}", prefix, now.timestamp_millis(), suffix)
}
