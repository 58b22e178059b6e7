//! Provisioned proxy instances
//!
//! An [`Instance`] is the durable configuration of one proxy endpoint: the
//! port it owns and everything needed to rebuild its command line. Process
//! handles are tracked separately by the supervisor and never serialized.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// At most this many digits end up in a generated passphrase
const MAX_PASSPHRASE_DIGITS: usize = 6;

const DIGITS: &[u8] = b"0123456789";
const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Configuration of one proxy endpoint.
///
/// Serialized field names match the snapshot format written by earlier
/// deployments, so existing state files keep loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub port: u16,
    #[serde(rename = "password")]
    pub passphrase: String,
    #[serde(rename = "addr")]
    pub bind_address: String,
    #[serde(rename = "method", default)]
    pub cipher_method: String,
    #[serde(rename = "backend", default)]
    pub backend_program: String,
    #[serde(rename = "plugin", default)]
    pub plugin_id: String,
}

impl Instance {
    /// Connection descriptor: `<scheme>://base64(method:passphrase@host:port)`
    pub fn connect_url(&self, scheme: &str, host: &str) -> String {
        let userinfo = format!(
            "{}:{}@{}:{}",
            self.cipher_method, self.passphrase, host, self.port
        );
        format!("{}://{}", scheme, STANDARD_NO_PAD.encode(userinfo))
    }
}

/// Lifecycle of an occupied port. Removed instances have no slot at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Port reserved, backend not started yet
    Provisioning,
    /// Backend spawned (or awaiting restart after an unexpected exit)
    Running,
    /// Delete in progress, waiting for the backend to exit
    Terminating,
}

/// Generate a random alphanumeric passphrase.
///
/// A random number of digits (0 to 6) is mixed with upper and lower case
/// letters; no character appears twice. `length` must not exceed the number
/// of available letters (52).
pub fn generate_passphrase(length: usize) -> String {
    let mut rng = rand::thread_rng();
    let digits = rng.gen_range(0..=MAX_PASSPHRASE_DIGITS.min(length));

    let mut chars: Vec<u8> = DIGITS.choose_multiple(&mut rng, digits).copied().collect();
    chars.extend(LETTERS.choose_multiple(&mut rng, length - digits));
    chars.shuffle(&mut rng);

    chars.into_iter().map(char::from).collect()
}
