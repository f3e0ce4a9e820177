//! Synthesis fingerprints: content addressing for the cache.
//!
//! A fingerprint is SHA-256 over (voice id, fixed-point tuning, language,
//! text). Tuning floats are quantized before hashing so equal parameters
//! always hash equally.

use sha2::{Digest, Sha256};

use voxgate_core::VoiceTuning;

pub fn fingerprint(voice_id: &str, tuning: &VoiceTuning, language: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(voice_id.as_bytes());
    hasher.update([0u8]);
    for quantized in tuning.encode() {
        hasher.update(quantized.to_be_bytes());
    }
    hasher.update([0u8]);
    hasher.update(language.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_hash_equally() {
        let tuning = VoiceTuning::default();
        let a = fingerprint("voice-1", &tuning, "en", "Hello, Acme.");
        let b = fingerprint("voice-1", &tuning, "en", "Hello, Acme.");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn any_differing_input_changes_the_hash() {
        let tuning = VoiceTuning::default();
        let base = fingerprint("voice-1", &tuning, "en", "Hello");
        assert_ne!(base, fingerprint("voice-2", &tuning, "en", "Hello"));
        assert_ne!(base, fingerprint("voice-1", &tuning, "de", "Hello"));
        assert_ne!(base, fingerprint("voice-1", &tuning, "en", "Hello!"));
        let other_tuning = VoiceTuning {
            stability: 0.9,
            ..tuning
        };
        assert_ne!(base, fingerprint("voice-1", &other_tuning, "en", "Hello"));
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let tuning = VoiceTuning::default();
        // "ab" + "c" must not collide with "a" + "bc".
        assert_ne!(
            fingerprint("ab", &tuning, "c", "x"),
            fingerprint("a", &tuning, "bc", "x")
        );
    }
}
