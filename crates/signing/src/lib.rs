#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Streaming signature verification for update payloads
//!
//! Payloads ship with a detached minisign signature over the compressed
//! bytes. Because a payload is never buffered whole, verification is
//! incremental: compressed bytes are fed into a [`StreamingVerifier`] as
//! they pass through the pipeline and the verdict is computed exactly
//! once at end-of-stream. Signatures must be prehashed (`minisign -H`);
//! anything else fails closed.
//!
//! The public key is loaded once at process start and treated as
//! immutable for the process lifetime.

use minisign_verify::{PublicKey, Signature};
use sprout_errors::{Error, SigningError};
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use tracing::{debug, warn};

/// Result of verifying one update payload
///
/// `Undetermined` (malformed signature, key mismatch, non-prehashed
/// signature) is treated identically to `Invalid` by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Valid,
    Invalid,
    Undetermined(String),
}

impl VerificationOutcome {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Incremental payload verifier
///
/// `update` feeds payload bytes as shipped (compressed); `finalize`
/// yields the outcome and must be called exactly once, at end-of-stream.
pub trait StreamingVerifier: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize(&mut self) -> VerificationOutcome;
}

/// Creates a [`StreamingVerifier`] for one update attempt from the
/// shipped detached signature. Never fails: unusable signatures produce
/// a verifier whose outcome is `Undetermined` (fail closed).
pub trait VerifierFactory: Send + Sync {
    fn open(&self, signature_text: &str) -> Box<dyn StreamingVerifier>;
}

/// A minisign public key fixed at process start
///
/// Holds the validated base64 encoding; each verification attempt parses
/// its own `PublicKey` so the verifier worker can own it outright.
pub struct MinisignKey {
    encoded: String,
}

impl MinisignKey {
    /// Parse a key from its base64 representation.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::InvalidKey`] for malformed input.
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let encoded = encoded.trim();
        PublicKey::from_base64(encoded).map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        Ok(Self {
            encoded: encoded.to_string(),
        })
    }

    /// Load a key from a minisign `.pub` file, ignoring comment lines.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::KeyFileUnreadable`] if the file cannot be
    /// read and [`SigningError::InvalidKey`] if no usable key line exists.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content =
            std::fs::read_to_string(path).map_err(|e| SigningError::KeyFileUnreadable {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        let encoded = content
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with("untrusted comment:"))
            .ok_or_else(|| SigningError::InvalidKey("no key line in file".to_string()))?;
        Self::from_base64(encoded)
    }
}

impl VerifierFactory for MinisignKey {
    fn open(&self, signature_text: &str) -> Box<dyn StreamingVerifier> {
        let signature = match Signature::decode(signature_text.trim()) {
            Ok(signature) => signature,
            Err(e) => {
                warn!(error = %e, "detached signature does not decode");
                return Box::new(UndeterminedVerifier {
                    reason: format!("invalid signature format: {e}"),
                });
            }
        };
        let key = match PublicKey::from_base64(&self.encoded) {
            Ok(key) => key,
            // The encoding was validated at construction; fail closed anyway.
            Err(e) => {
                return Box::new(UndeterminedVerifier {
                    reason: format!("public key unusable: {e}"),
                })
            }
        };
        Box::new(MinisignStreamVerifier::spawn(key, signature))
    }
}

enum WorkerVerdict {
    Valid,
    Invalid(String),
    Unusable(String),
}

/// The library's incremental verifier borrows the key and signature it was
/// opened from, so that state lives on a dedicated worker thread that owns
/// both. Payload chunks reach it over a channel; closing the channel is the
/// end-of-stream signal and the verdict comes back through the join handle.
struct MinisignStreamVerifier {
    chunks: Option<mpsc::Sender<Vec<u8>>>,
    worker: Option<thread::JoinHandle<WorkerVerdict>>,
}

impl MinisignStreamVerifier {
    fn spawn(key: PublicKey, signature: Signature) -> Self {
        let (chunks, feed) = mpsc::channel::<Vec<u8>>();
        let worker = thread::spawn(move || {
            let mut verifier = match key.verify_stream(&signature) {
                Ok(verifier) => verifier,
                // Key mismatch or a signature that was not prehashed; either
                // way the payload digest can never be checked against it.
                Err(e) => {
                    return WorkerVerdict::Unusable(format!(
                        "signature unusable for streaming verification: {e}"
                    ))
                }
            };
            for chunk in feed {
                verifier.update(&chunk);
            }
            match verifier.finalize() {
                Ok(()) => WorkerVerdict::Valid,
                Err(e) => WorkerVerdict::Invalid(e.to_string()),
            }
        });
        Self {
            chunks: Some(chunks),
            worker: Some(worker),
        }
    }
}

impl StreamingVerifier for MinisignStreamVerifier {
    fn update(&mut self, data: &[u8]) {
        if let Some(chunks) = &self.chunks {
            // A send fails only when the worker bailed out early; finalize
            // reports why.
            let _ = chunks.send(data.to_vec());
        }
    }

    fn finalize(&mut self) -> VerificationOutcome {
        self.chunks.take();
        let Some(worker) = self.worker.take() else {
            return VerificationOutcome::Undetermined("verifier already finalized".to_string());
        };
        match worker.join() {
            Ok(WorkerVerdict::Valid) => {
                debug!("payload signature verified");
                VerificationOutcome::Valid
            }
            Ok(WorkerVerdict::Invalid(e)) => {
                warn!(error = %e, "payload signature verification failed");
                VerificationOutcome::Invalid
            }
            Ok(WorkerVerdict::Unusable(reason)) => {
                warn!(%reason, "cannot verify payload signature");
                VerificationOutcome::Undetermined(reason)
            }
            Err(_) => VerificationOutcome::Undetermined("verification worker panicked".to_string()),
        }
    }
}

struct UndeterminedVerifier {
    reason: String,
}

impl StreamingVerifier for UndeterminedVerifier {
    fn update(&mut self, _data: &[u8]) {}

    fn finalize(&mut self) -> VerificationOutcome {
        VerificationOutcome::Undetermined(self.reason.clone())
    }
}
