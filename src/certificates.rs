use crate::{
    race::{Participant, Race, DNF_POSITION},
    storage::{CertificateRecord, PersistentStorage},
};
use chrono::Utc;
use clap::Parser;
use eyre::{ensure, Result};
use k256::{
    ecdsa::{
        signature::{Signer, Verifier},
        Signature as EcdsaSignature, SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[group(skip)]
pub struct Options {
    /// Hex-encoded 32-byte secp256k1 seed for certificate signing. The
    /// default is a fixed development key; production deployments must
    /// override it.
    #[clap(
        long,
        env,
        default_value = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
    )]
    pub certificate_signing_key: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Signature(String);

impl Signature {
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("couldn't sign the certificate")]
    SignatureCreation,
    #[error("signature is not a valid hex string")]
    InvalidToken,
    #[error("couldn't create signature from string")]
    InvalidSignature,
}

pub struct Keys {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl Keys {
    pub fn new(options: &Options) -> Result<Self> {
        let seed = hex::decode(&options.certificate_signing_key)?;
        ensure!(seed.len() == 32, "signing seed must be 32 bytes");
        let signing = SigningKey::from_bytes(&seed)?;
        let verifying = signing.verifying_key();
        Ok(Self { signing, verifying })
    }

    pub fn sign(&self, message: &str) -> Result<Signature, SignatureError> {
        let signature: EcdsaSignature = self.signing.sign(message.as_bytes());
        Ok(Signature(hex::encode(signature.to_der().as_bytes())))
    }

    pub fn verify(&self, message: &str, signature: &Signature) -> Result<(), SignatureError> {
        let bytes = hex::decode(&signature.0).map_err(|_| SignatureError::InvalidToken)?;
        let signature =
            EcdsaSignature::from_der(&bytes).map_err(|_| SignatureError::InvalidSignature)?;
        self.verifying
            .verify(message.as_bytes(), &signature)
            .map_err(|_| SignatureError::InvalidToken)
    }

    #[must_use]
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying.to_encoded_point(true).as_bytes())
    }
}

/// Signed certificate metadata. The canonical form is this struct's JSON
/// serialization; the same string is signed and persisted, so verification
/// after a round trip through storage checks the exact signed bytes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateMetadata {
    pub verification_id: String,
    pub user_id: String,
    pub race_id: i64,
    pub username: String,
    pub wpm: i64,
    pub accuracy: f64,
    pub consistency: f64,
    pub duration_seconds: i64,
    pub finish_position: i64,
    pub issued_at: i64,
}

impl CertificateMetadata {
    pub fn canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Consistency mirrors the client heuristic: accuracy degraded by the error
/// density of the final snapshot.
#[must_use]
pub fn consistency_score(accuracy: f64, progress: i64, errors: i64) -> f64 {
    let density = errors as f64 / progress.max(1) as f64;
    ((accuracy * (1.0 - density)) * 100.0).round() / 100.0
}

#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub verification_id: String,
    pub signature: String,
}

/// Issues certificates for every human account-holding finisher. A failure
/// for one participant skips that participant; a storage failure propagates
/// so the caller can fall back to an empty map.
pub async fn issue_certificates(
    storage: &PersistentStorage,
    keys: &Keys,
    race: &Race,
    finishers: &[Participant],
    duration_seconds: i64,
) -> Result<HashMap<i64, IssuedCertificate>> {
    let mut issued = HashMap::new();
    for participant in finishers {
        let Some(user_id) = participant.user_id.as_deref() else { continue };
        if participant.is_bot || participant.finish_position == Some(DNF_POSITION) {
            continue;
        }
        let metadata = CertificateMetadata {
            verification_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            race_id: race.id,
            username: participant.username.clone(),
            wpm: participant.wpm,
            accuracy: participant.accuracy,
            consistency: consistency_score(
                participant.accuracy,
                participant.progress,
                participant.errors,
            ),
            duration_seconds,
            finish_position: participant.finish_position.unwrap_or(DNF_POSITION),
            issued_at: Utc::now().timestamp_millis(),
        };
        let canonical = metadata.canonical_json()?;
        let signature = match keys.sign(&canonical) {
            Ok(signature) => signature,
            Err(error) => {
                warn!(%error, participant_id = participant.id, "certificate signing failed");
                continue;
            }
        };
        storage
            .create_certificate(&CertificateRecord {
                verification_id: metadata.verification_id.clone(),
                user_id: metadata.user_id.clone(),
                race_id: metadata.race_id,
                wpm: metadata.wpm,
                accuracy: metadata.accuracy,
                consistency: metadata.consistency,
                duration_seconds: metadata.duration_seconds,
                metadata: canonical,
                signature: signature.as_hex().to_owned(),
            })
            .await?;
        issued.insert(participant.id, IssuedCertificate {
            verification_id: metadata.verification_id,
            signature: signature.as_hex().to_owned(),
        });
    }
    Ok(issued)
}

/// Re-verifies a persisted certificate against the exact stored metadata.
pub async fn verify_certificate(
    storage: &PersistentStorage,
    keys: &Keys,
    verification_id: &str,
) -> Result<bool> {
    let Some(record) = storage.get_certificate(verification_id).await? else {
        return Ok(false);
    };
    let signature = Signature(record.signature);
    Ok(keys.verify(&record.metadata, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::race::{RaceStatus, RaceType};
    use crate::storage::test_storage_client;

    fn test_keys() -> Keys {
        Keys::new(&Options {
            certificate_signing_key:
                "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318".into(),
        })
        .unwrap()
    }

    #[test]
    fn sign_and_verify() {
        let keys = test_keys();
        let metadata = CertificateMetadata {
            verification_id: "v1".into(),
            user_id: "u1".into(),
            race_id: 1,
            username: "alice".into(),
            wpm: 86,
            accuracy: 98.5,
            consistency: 96.1,
            duration_seconds: 42,
            finish_position: 1,
            issued_at: 1_700_000_000_000,
        };
        let message = metadata.canonical_json().unwrap();
        let signature = keys.sign(&message).unwrap();
        assert!(keys.verify(&message, &signature).is_ok());

        // Any mutation of the canonical form must fail verification.
        let tampered = message.replace("86", "186");
        assert!(keys.verify(&tampered, &signature).is_err());
    }

    #[test]
    fn consistency_heuristic() {
        assert_eq!(consistency_score(100.0, 100, 0), 100.0);
        assert_eq!(consistency_score(96.67, 60, 2), 93.45);
        assert_eq!(consistency_score(100.0, 0, 0), 100.0);
    }

    #[tokio::test]
    async fn certificate_round_trips_through_persistence() {
        let db = test_storage_client().await;
        let keys = test_keys();
        let race = Race {
            id: 1,
            room_code: "AAAAAA".into(),
            status: RaceStatus::Finished,
            paragraph_content: "abc def ghi".into(),
            paragraph_id: None,
            max_players: 5,
            is_private: false,
            race_type: RaceType::Standard,
            time_limit_seconds: None,
            creator_participant_id: None,
            started_at: None,
            finished_at: None,
        };
        let finisher = Participant {
            id: 11,
            race_id: 1,
            username: "alice".into(),
            user_id: Some("u1".into()),
            guest_name: None,
            avatar_color: None,
            is_bot: false,
            progress: 11,
            wpm: 26,
            accuracy: 100.0,
            errors: 0,
            is_finished: true,
            finish_position: Some(1),
            join_token: crate::util::Secret::from("tok".to_owned()),
            deleted: false,
        };
        let bot = Participant {
            id: 12,
            username: "bot".into(),
            user_id: None,
            is_bot: true,
            ..finisher.clone()
        };

        let issued = issue_certificates(&db, &keys, &race, &[finisher, bot], 5)
            .await
            .unwrap();
        assert_eq!(issued.len(), 1);
        let certificate = &issued[&11];
        assert!(verify_certificate(&db, &keys, &certificate.verification_id)
            .await
            .unwrap());
        assert!(!verify_certificate(&db, &keys, "missing").await.unwrap());
    }
}
