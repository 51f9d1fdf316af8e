//! Pairing-PIN enrollment: a new device proves possession of an
//! operator-displayed PIN, then receives its pre-shared key XOR'd with a
//! PIN-derived one-time pad.

use meshhub_core::crypto::{derive_enrollment_key, verify_pin_proof, xor32};
use meshhub_core::envelope::{Envelope, MsgType};
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const DEFAULT_PIN_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

struct PendingPin {
    pin: String,
    salt: [u8; 16],
    created_at: Instant,
    attempts: u32,
    used: bool,
}

impl PendingPin {
    fn active(&self, pin_timeout: Duration, max_attempts: u32) -> bool {
        !self.used && self.created_at.elapsed() <= pin_timeout && self.attempts < max_attempts
    }
}

/// Outcome of handling one `ENROLL_REQUEST`. `envelope` is always the
/// `ENROLL_RESPONSE` to send back; `psk` is set only when enrollment
/// succeeded and the caller should persist it to the keystore.
pub struct EnrollOutcome {
    pub envelope: Envelope,
    pub psk: Option<[u8; 32]>,
}

/// Tracks in-flight enrollments and issues device PSKs once the pairing PIN
/// checks out. At most one pending PIN per node; starting a new one
/// replaces any previous pending or already-used entry.
pub struct EnrollmentService {
    pending: RwLock<HashMap<String, PendingPin>>,
    pin_timeout: Duration,
    max_attempts: u32,
}

impl EnrollmentService {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_PIN_TIMEOUT, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_limits(pin_timeout: Duration, max_attempts: u32) -> Self {
        Self { pending: RwLock::new(HashMap::new()), pin_timeout, max_attempts }
    }

    /// Operator-initiated: generate and display a 6-digit PIN for `node_id`.
    pub fn begin(&self, node_id: &str) -> String {
        let pin = format!("{:06}", rand::thread_rng().next_u32() % 1_000_000);
        let mut salt = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        self.pending.write().insert(
            node_id.to_string(),
            PendingPin { pin: pin.clone(), salt, created_at: Instant::now(), attempts: 0, used: false },
        );
        pin
    }

    /// Handle an inbound `ENROLL_REQUEST` carrying `pin_proof`. Always
    /// produces a reply envelope; `psk` on the outcome is `Some` only on
    /// success, letting the caller decide what PSK to wrap and persist.
    pub fn handle_request(&self, node_id: &str, pin_proof: &str, psk: &[u8; 32]) -> EnrollOutcome {
        let mut pending = self.pending.write();

        let Some(entry) = pending.get_mut(node_id) else {
            return Self::error_outcome(node_id, "no_active_enrollment");
        };

        if entry.used {
            return Self::error_outcome(node_id, "already_used");
        }
        if entry.created_at.elapsed() > self.pin_timeout {
            return Self::error_outcome(node_id, "expired");
        }
        if entry.attempts >= self.max_attempts {
            return Self::error_outcome(node_id, "locked");
        }

        if !verify_pin_proof(&entry.pin, node_id, pin_proof) {
            entry.attempts += 1;
            let reason = if entry.attempts >= self.max_attempts { "locked" } else { "invalid_pin" };
            return Self::error_outcome(node_id, reason);
        }

        entry.used = true;
        let salt = entry.salt;
        let otp = derive_enrollment_key(&entry.pin, &salt);
        let encrypted_psk = xor32(psk, &otp);

        let payload = serde_json::json!({
            "status": "ok",
            "encrypted_psk": hex::encode(encrypted_psk),
            "salt": hex::encode(salt),
        });
        let envelope = Envelope::new(MsgType::EnrollResponse, "hub", node_id).with_payload(payload);
        EnrollOutcome { envelope, psk: Some(*psk) }
    }

    fn error_outcome(node_id: &str, reason: &'static str) -> EnrollOutcome {
        let payload = serde_json::json!({ "status": "error", "reason": reason });
        let envelope = Envelope::new(MsgType::EnrollResponse, "hub", node_id).with_payload(payload);
        EnrollOutcome { envelope, psk: None }
    }

    /// True iff `node_id` has a pending, not-yet-consumed PIN that hasn't
    /// expired or locked out.
    pub fn has_active_pin(&self, node_id: &str) -> bool {
        self.pending
            .read()
            .get(node_id)
            .is_some_and(|entry| entry.active(self.pin_timeout, self.max_attempts))
    }

    pub fn cancel(&self, node_id: &str) {
        self.pending.write().remove(node_id);
    }
}

impl Default for EnrollmentService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::KeyStore;
    use meshhub_core::crypto::{compute_pin_proof, derive_enrollment_key, xor32};

    /// End-to-end pairing: a hub-displayed PIN, a device's proof-of-PIN,
    /// the resulting PSK handoff, and the keystore record it lands in.
    #[test]
    fn enrollment_hands_a_usable_psk_to_the_keystore() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = KeyStore::new(dir.path().join("keys.json")).unwrap();
        let service = EnrollmentService::new();

        let pin = service.begin("esp32-01");
        let pin_proof = compute_pin_proof(&pin, "esp32-01");

        let mut psk = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut psk);
        let outcome = service.handle_request("esp32-01", &pin_proof, &psk);

        assert_eq!(outcome.envelope.payload.get("status").unwrap(), "ok");
        let encrypted_psk = outcome.envelope.payload.get("encrypted_psk").unwrap().as_str().unwrap();
        let salt_hex = outcome.envelope.payload.get("salt").unwrap().as_str().unwrap();
        assert_eq!(encrypted_psk.len(), 64);
        assert_eq!(salt_hex.len(), 32);

        let salt: [u8; 16] = hex::decode(salt_hex).unwrap().try_into().unwrap();
        let otp = derive_enrollment_key(&pin, &salt);
        let recovered = xor32(&hex::decode(encrypted_psk).unwrap().try_into().unwrap(), &otp);
        assert_eq!(recovered, psk);

        keystore.insert("esp32-01", outcome.psk.unwrap().to_vec(), "2026-01-01T00:00:00Z").unwrap();
        assert_eq!(keystore.psk("esp32-01").unwrap().len(), 32);

        // Same PIN again is rejected: it was already consumed.
        let replay_proof = compute_pin_proof(&pin, "esp32-01");
        let replay = service.handle_request("esp32-01", &replay_proof, &psk);
        assert_eq!(replay.envelope.payload.get("reason").unwrap(), "already_used");
    }

    #[test]
    fn bad_proof_is_rejected() {
        let service = EnrollmentService::new();
        service.begin("esp32-01");
        let outcome = service.handle_request("esp32-01", "not-a-real-proof", &[1u8; 32]);
        assert_eq!(outcome.envelope.payload.get("reason").unwrap(), "invalid_pin");
        assert!(outcome.psk.is_none());
    }

    #[test]
    fn unknown_node_is_rejected() {
        let service = EnrollmentService::new();
        let outcome = service.handle_request("ghost", "anything", &[1u8; 32]);
        assert_eq!(outcome.envelope.payload.get("reason").unwrap(), "no_active_enrollment");
    }

    #[test]
    fn correct_proof_succeeds_and_wraps_psk() {
        let service = EnrollmentService::new();
        let pin = service.begin("esp32-01");
        let proof = compute_pin_proof(&pin, "esp32-01");
        let psk = [9u8; 32];
        let outcome = service.handle_request("esp32-01", &proof, &psk);
        assert_eq!(outcome.envelope.payload.get("status").unwrap(), "ok");
        assert_eq!(outcome.psk, Some(psk));
    }

    #[test]
    fn reusing_a_consumed_pin_is_already_used() {
        let service = EnrollmentService::new();
        let pin = service.begin("esp32-01");
        let proof = compute_pin_proof(&pin, "esp32-01");
        let _ = service.handle_request("esp32-01", &proof, &[9u8; 32]);
        let second = service.handle_request("esp32-01", &proof, &[9u8; 32]);
        assert_eq!(second.envelope.payload.get("reason").unwrap(), "already_used");
    }

    #[test]
    fn max_attempts_locks_the_pin() {
        let service = EnrollmentService::with_limits(DEFAULT_PIN_TIMEOUT, 3);
        service.begin("esp32-01");
        for _ in 0..2 {
            let outcome = service.handle_request("esp32-01", "wrong", &[1u8; 32]);
            assert_eq!(outcome.envelope.payload.get("reason").unwrap(), "invalid_pin");
        }
        let locked = service.handle_request("esp32-01", "wrong", &[1u8; 32]);
        assert_eq!(locked.envelope.payload.get("reason").unwrap(), "locked");
        let still_locked = service.handle_request("esp32-01", "wrong", &[1u8; 32]);
        assert_eq!(still_locked.envelope.payload.get("reason").unwrap(), "locked");
    }
}
