//! WireGuard key material generation

use std::io::Write;
use std::process::{Command, Stdio};

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of the generated routing-protocol secret
pub const BGP_PASSWORD_LEN: usize = 16;

/// WireGuard key pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgKeyPair {
    pub private_key: String, // Base64
    pub public_key: String,  // Base64
}

/// Source of WireGuard keys.
///
/// `None` means the key could not be produced; callers turn that into a
/// provisioning error and store nothing.
pub trait KeyGenerator: Send + Sync {
    fn private_key(&self) -> Option<String>;

    fn public_key(&self, private_key: &str) -> Option<String>;

    fn preshared_key(&self) -> Option<String>;

    fn keypair(&self) -> Option<WgKeyPair> {
        let private_key = self.private_key()?;
        let public_key = self.public_key(&private_key)?;
        Some(WgKeyPair {
            private_key,
            public_key,
        })
    }

    fn bgp_password(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(BGP_PASSWORD_LEN)
            .map(char::from)
            .collect()
    }
}

/// Generates keys with the `wg` command line tool
#[derive(Debug, Clone)]
pub struct WgTool {
    binary: String,
}

impl Default for WgTool {
    fn default() -> Self {
        Self {
            binary: "wg".to_string(),
        }
    }
}

impl WgTool {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Runs `wg <subcommand>`; any stderr output, a non-zero exit or empty stdout yields `None`
    fn run(&self, subcommand: &str, input: Option<&str>) -> Option<String> {
        let mut child = Command::new(&self.binary)
            .arg(subcommand)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| error!("Failed to run {} {}: {}", self.binary, subcommand, e))
            .ok()?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .map_err(|e| error!("Failed to feed {} {}: {}", self.binary, subcommand, e))
                .ok()?;
        }

        let output = child.wait_with_output().ok()?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || !stderr.trim().is_empty() {
            error!("{} {} failed: {}", self.binary, subcommand, stderr.trim());
            return None;
        }
        let out = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if out.is_empty() {
            debug!("{} {} produced no output", self.binary, subcommand);
            return None;
        }
        Some(out)
    }
}

impl KeyGenerator for WgTool {
    fn private_key(&self) -> Option<String> {
        self.run("genkey", None)
    }

    fn public_key(&self, private_key: &str) -> Option<String> {
        self.run("pubkey", Some(private_key))
    }

    fn preshared_key(&self) -> Option<String> {
        self.run("genpsk", None)
    }
}

/// Generates keys in-process with x25519
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeKeyGenerator;

impl NativeKeyGenerator {
    fn random_key() -> [u8; 32] {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes
    }
}

impl KeyGenerator for NativeKeyGenerator {
    fn private_key(&self) -> Option<String> {
        let mut private_key_bytes = Self::random_key();

        // WireGuard key clamping
        private_key_bytes[0] &= 248;
        private_key_bytes[31] &= 127;
        private_key_bytes[31] |= 64;

        Some(STANDARD.encode(private_key_bytes))
    }

    fn public_key(&self, private_key: &str) -> Option<String> {
        let bytes: [u8; 32] = STANDARD.decode(private_key.trim()).ok()?.try_into().ok()?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Some(STANDARD.encode(public.as_bytes()))
    }

    fn preshared_key(&self) -> Option<String> {
        Some(STANDARD.encode(Self::random_key()))
    }
}
