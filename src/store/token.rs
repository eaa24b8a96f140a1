use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;

pub const TRACKING_TOKEN_BYTES: usize = 24;
pub const UNSUBSCRIBE_TOKEN_BYTES: usize = 32;

/// URL-safe random token of `len` bytes of entropy.
pub fn random_token(len: usize) -> String {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}
