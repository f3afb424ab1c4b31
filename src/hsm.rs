// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The SPM secure element: a session-pooled HSM handle and the provisioning
//! operations built on it.
//!
//! Every operation follows the same skeleton: borrow a session from the
//! pool, resolve key labels, issue primitive token calls, and let the
//! session guard return the session on every control path. Operations are
//! reentrant across sessions and leave no shared state behind besides the
//! pool itself.

use std::collections::HashMap;

use der::Decode;
use sha3::digest::ExtendableOutput;
use sha3::digest::Update;
use sha3::CShake128;
use sha3::CShake128Core;
use tracing::instrument;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::Certificate;

use crate::cert;
use crate::cert::assembler;
use crate::cert::CertTemplate;
use crate::config::HsmConfig;
use crate::error::SpmError;
use crate::error::SpmErrorMapper;
use crate::error::SpmResult;
use crate::pk11;
use crate::pk11::ExportedKey;
use crate::pk11::KeyClass;
use crate::pk11::KeyOptions;
use crate::pk11::UserType;
use crate::session::SessionQueue;
use crate::types::CertInfo;
use crate::types::EndorseCertParams;
use crate::types::KeyParams;
use crate::types::SigningParams;
use crate::types::SymmetricKeyType;
use crate::types::SymmetricKeygenParams;

/// Label of the global wrapping key.
pub const KEY_LABEL_KG: &str = "KG";

/// Label of the transport static key.
pub const KEY_LABEL_KT: &str = "KT";

/// Label of the certificate authority private key.
pub const KEY_LABEL_KCA_PRIV: &str = "KCAPriv";

/// Label of the high-security KDF seed.
pub const KEY_LABEL_HIGH_SEC_KDF_SEED: &str = "HighSecKdfSeed";

/// Label of the low-security KDF seed.
pub const KEY_LABEL_LOW_SEC_KDF_SEED: &str = "LowSecKdfSeed";

/// The label used for expanding the transport secret.
const TRANSPORT_KEY_INFO: &[u8] = b"transport key";

/// A session-pooled HSM handle conforming to the SPM interface.
///
/// Created once at startup via [`Hsm::new`]; safe to share across
/// request-serving threads for the life of the process.
pub struct Hsm {
    /// UIDs of long-lived symmetric key objects, by label.
    symmetric_keys: HashMap<String, Vec<u8>>,

    /// UIDs of long-lived private key objects, by label.
    private_keys: HashMap<String, Vec<u8>>,

    /// The pool of authenticated token sessions.
    sessions: SessionQueue,
}

impl std::fmt::Debug for Hsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hsm")
            .field("symmetric_keys", &self.symmetric_keys)
            .field("private_keys", &self.private_keys)
            .finish_non_exhaustive()
    }
}

/// Opens `cfg.num_sessions` sessions on the configured slot, logs each in as
/// Crypto User and enqueues each.
fn open_sessions(cfg: &HsmConfig) -> SpmResult<SessionQueue> {
    let module = pk11::load(cfg.hsm_type, &cfg.so_path)
        .map_spm_err(SpmError::config("failed to load PKCS#11 module"))?;
    let tokens = module
        .tokens()
        .map_spm_err(SpmError::config("failed to open tokens"))?;
    if cfg.slot_id >= tokens.len() {
        return Err(SpmError::config(format!(
            "slot {} out of range: module has {} slots",
            cfg.slot_id,
            tokens.len()
        )));
    }

    let sessions = SessionQueue::new(cfg.num_sessions, cfg.acquire_timeout);
    for _ in 0..cfg.num_sessions {
        let session = tokens[cfg.slot_id]
            .open_session()
            .map_spm_err(SpmError::resource("failed to open session to HSM"))?;
        session
            .login(UserType::NormalUser, &cfg.hsm_password)
            .map_spm_err(SpmError::resource("failed to login into the HSM"))?;
        sessions.insert(session)?;
    }
    Ok(sessions)
}

/// Returns the object UID for a given label.
fn find_key_uid_by_label(
    session: &dyn pk11::Session,
    class: KeyClass,
    label: &str,
) -> SpmResult<Vec<u8>> {
    let object = session
        .find_key_by_label(class, label)
        .map_spm_err(SpmError::lookup(format!(
            "failed to find key with label {label:?}"
        )))?;
    let uid = session
        .object_uid(object)
        .map_spm_err(SpmError::lookup(format!(
            "failed to read UID of key {label:?}"
        )))?;
    uid.ok_or_else(|| SpmError::lookup(format!("key {label:?} has no ID attribute")))
}

impl Hsm {
    /// Creates a new HSM handle with a dedicated session pool and key
    /// registry.
    ///
    /// Opens and authenticates `cfg.num_sessions` sessions, then resolves
    /// every configured key label to its object UID. Any failure is fatal
    /// to construction; the registry is read-only afterwards.
    #[instrument(skip_all, fields(slot_id = cfg.slot_id, num_sessions = cfg.num_sessions))]
    pub fn new(cfg: &HsmConfig) -> SpmResult<Self> {
        let sessions = open_sessions(cfg)?;
        let mut hsm = Hsm {
            symmetric_keys: HashMap::new(),
            private_keys: HashMap::new(),
            sessions,
        };

        let session = hsm.sessions.acquire()?;
        for label in &cfg.symmetric_keys {
            let uid = find_key_uid_by_label(&*session, KeyClass::SecretKey, label)
                .map_err(|err| SpmError::config(format!("symmetric key {label:?}: {err}")))?;
            hsm.symmetric_keys.insert(label.clone(), uid);
        }
        for label in &cfg.private_keys {
            let uid = find_key_uid_by_label(&*session, KeyClass::PrivateKey, label)
                .map_err(|err| SpmError::config(format!("private key {label:?}: {err}")))?;
            hsm.private_keys.insert(label.clone(), uid);
        }
        drop(session);

        Ok(hsm)
    }

    fn symmetric_key_uid(&self, label: &str) -> SpmResult<&[u8]> {
        self.symmetric_keys
            .get(label)
            .map(Vec::as_slice)
            .ok_or_else(|| SpmError::lookup(format!("failed to find {label} key UID")))
    }

    fn private_key_uid(&self, label: &str) -> SpmResult<&[u8]> {
        self.private_keys
            .get(label)
            .map(Vec::as_slice)
            .ok_or_else(|| SpmError::lookup(format!("failed to find {label} key UID")))
    }

    /// Derives the transport secret for the device with the given ID and
    /// returns a handle to it.
    fn derive_transport_secret(
        &self,
        session: &dyn pk11::Session,
        device_id: &[u8],
    ) -> SpmResult<pk11::ObjectHandle> {
        let kt = self.symmetric_key_uid(KEY_LABEL_KT)?;
        let transport_static = session
            .find_secret_key(kt)
            .map_spm_err(SpmError::lookup("failed to find KT key object"))?;
        session
            .hkdf_derive_aes(
                transport_static,
                pk11::HashAlgo::Sha256,
                device_id,
                TRANSPORT_KEY_INFO,
                128,
                &KeyOptions { extractable: true },
            )
            .map_spm_err(SpmError::crypto("failed to derive transport secret"))
    }

    /// Derives a fresh secret for the device with the given ID, wrapping it
    /// with the global secret `KG`.
    ///
    /// Only the wrap ciphertext is returned; the wrap IV is discarded by
    /// convention and recovered on the device side.
    #[instrument(skip_all)]
    pub fn derive_and_wrap_transport_secret(&self, device_id: &[u8]) -> SpmResult<Vec<u8>> {
        let session = self.sessions.acquire()?;

        let kg = self.symmetric_key_uid(KEY_LABEL_KG)?;
        let global = session
            .find_secret_key(kg)
            .map_spm_err(SpmError::lookup("failed to find KG key object"))?;

        let transport = self.derive_transport_secret(&*session, device_id)?;

        let wrapped = session
            .wrap_aes(global, transport)
            .map_spm_err(SpmError::crypto("failed to wrap transport secret"))?;
        Ok(wrapped.ciphertext)
    }

    /// Verifies that a session to the HSM is usable by asserting that the
    /// CA private key is findable; used as a liveness probe.
    #[instrument(skip_all)]
    pub fn verify_session(&self) -> SpmResult<()> {
        let session = self.sessions.acquire()?;
        let kca = self.private_key_uid(KEY_LABEL_KCA_PRIV)?;
        session
            .find_private_key(kca)
            .map_spm_err(SpmError::lookup("failed to verify session"))?;
        Ok(())
    }

    /// Returns `length` bytes of random data extracted from the HSM.
    pub fn generate_random(&self, length: usize) -> SpmResult<Vec<u8>> {
        let session = self.sessions.acquire()?;
        session
            .generate_random(length)
            .map_spm_err(SpmError::crypto("failed to generate random data"))
    }

    /// Runs `cmd` against a pooled session; release is guaranteed.
    pub fn with_session<R>(
        &self,
        cmd: impl FnOnce(&dyn pk11::Session) -> SpmResult<R>,
    ) -> SpmResult<R> {
        let session = self.sessions.acquire()?;
        cmd(&*session)
    }

    /// Derives symmetric keys from the configured KDF seeds.
    ///
    /// Output ordering matches input ordering.
    #[instrument(skip_all, fields(count = params.len()))]
    pub fn generate_symmetric_keys(
        &self,
        params: &[SymmetricKeygenParams],
    ) -> SpmResult<Vec<Vec<u8>>> {
        let session = self.sessions.acquire()?;
        let mut symmetric_keys = Vec::with_capacity(params.len());

        for p in params {
            // Select the seed asset to use (high or low security seed).
            let seed_label = if p.use_high_security_seed {
                KEY_LABEL_HIGH_SEC_KDF_SEED
            } else {
                KEY_LABEL_LOW_SEC_KDF_SEED
            };
            let seed_uid = self.symmetric_key_uid(seed_label)?;
            let seed = session
                .find_secret_key(seed_uid)
                .map_spm_err(SpmError::lookup(format!(
                    "failed to get {seed_label} key object"
                )))?;

            let derived = session
                .hkdf_derive_aes(
                    seed,
                    pk11::HashAlgo::Sha256,
                    p.sku.as_bytes(),
                    &p.diversifier,
                    p.size_in_bits,
                    &KeyOptions { extractable: true },
                )
                .map_spm_err(SpmError::crypto("failed HKDF derivation"))?;

            let exported = session
                .export_key(derived)
                .map_spm_err(SpmError::crypto("failed to extract symmetric key"))?;
            let mut key_bytes = match exported {
                ExportedKey::Aes(bytes) => bytes,
                other => {
                    return Err(SpmError::exported_type(format!(
                        "expected an AES key, got a {}",
                        other.variant_name()
                    )))
                }
            };

            if p.key_type == SymmetricKeyType::HashedOtLcToken {
                // Lifecycle tokens are stored in OTP in hashed form, using
                // cSHAKE128 with the "LC_CTRL" customization string. The
                // digest is read back over the key buffer: output length
                // equals input length.
                let mut hasher = CShake128::from_core(CShake128Core::new(b"LC_CTRL"));
                hasher.update(&key_bytes);
                hasher.finalize_xof_into(&mut key_bytes);
            }

            symmetric_keys.push(key_bytes);
        }

        Ok(symmetric_keys)
    }

    /// Generates key pairs and issues a certificate for each, signed by the
    /// CA private key `KCAPriv`.
    ///
    /// Each generated pair is destroyed on the HSM before this returns; the
    /// private half survives only wrapped under `KG` in the result.
    #[instrument(skip_all, fields(count = params.len()))]
    pub fn generate_key_pair_and_cert(
        &self,
        ca_cert: &[u8],
        params: &[SigningParams],
    ) -> SpmResult<Vec<CertInfo>> {
        let ca = Certificate::from_der(ca_cert)
            .map_err(|err| SpmError::invalid_input(format!("failed to parse CA certificate: {err}")))?;
        let (hash, oid) = cert::ca_signature_params(&ca)?;
        let signature_algorithm = AlgorithmIdentifierOwned {
            oid,
            parameters: None,
        };

        let session = self.sessions.acquire()?;

        let kca = self.private_key_uid(KEY_LABEL_KCA_PRIV)?;
        let ca_key = session
            .find_private_key(kca)
            .map_spm_err(SpmError::lookup("failed to find Kca key object"))?;
        let kg = self.symmetric_key_uid(KEY_LABEL_KG)?;
        let wrapping_key = session
            .find_secret_key(kg)
            .map_spm_err(SpmError::lookup("failed to get KG key object"))?;

        let mut certs = Vec::with_capacity(params.len());
        for p in params {
            let key_pair = match p.key_params {
                KeyParams::Rsa { mod_bits, exponent } => session
                    .generate_rsa(mod_bits, exponent, &KeyOptions { extractable: true })
                    .map_spm_err(SpmError::crypto("failed to generate RSA key pair"))?,
                KeyParams::Ec { curve } => session
                    .generate_ecdsa(curve, &KeyOptions { extractable: true })
                    .map_spm_err(SpmError::crypto("failed to generate ECDSA key pair"))?,
            };

            let issued = issue_cert(
                &*session,
                &ca,
                &signature_algorithm,
                hash,
                ca_key,
                wrapping_key,
                &key_pair,
                &p.template,
            );

            // The ephemeral pair must not outlive the operation, also when
            // issuance fails.
            if let Err(err) = session.destroy_key_pair(&key_pair) {
                tracing::error!("failed to destroy ephemeral key pair: {err}");
            }

            certs.push(issued?);
        }

        Ok(certs)
    }

    /// Signs a caller-supplied TBS certificate with the CA key named by
    /// `params.key_label` and assembles the complete DER certificate.
    ///
    /// The TBS bytes are embedded in the output verbatim. The key label is
    /// resolved per request, so endorsement keys beyond the preloaded
    /// registry can be used.
    #[instrument(skip_all, fields(key_label = %params.key_label))]
    pub fn endorse_cert(&self, tbs: &[u8], params: &EndorseCertParams) -> SpmResult<Vec<u8>> {
        // The algorithm gate runs first so unsupported algorithms are
        // rejected without touching the HSM.
        let hash = assembler::signature_hash(params.signature_algorithm)?;
        let oid = assembler::signature_oid(params.signature_algorithm)?;

        let session = self.sessions.acquire()?;

        let key_uid = find_key_uid_by_label(&*session, KeyClass::PrivateKey, &params.key_label)?;
        let key = session
            .find_private_key(&key_uid)
            .map_spm_err(SpmError::lookup(format!(
                "failed to find key object for {:?}",
                params.key_label
            )))?;

        let signature = session
            .sign_ecdsa(key, hash, tbs)
            .map_spm_err(SpmError::crypto("failed to sign"))?;
        let signature = assembler::encode_ecdsa_signature(&signature.r, &signature.s)?;

        assembler::assemble_certificate(tbs, oid, &signature)
    }
}

/// Issues one certificate for a freshly generated key pair: export the
/// public key, wrap the private key, build the TBS from the template, sign
/// it with the CA key and assemble the result.
#[allow(clippy::too_many_arguments)]
fn issue_cert(
    session: &dyn pk11::Session,
    ca: &Certificate,
    signature_algorithm: &AlgorithmIdentifierOwned,
    hash: pk11::HashAlgo,
    ca_key: pk11::ObjectHandle,
    wrapping_key: pk11::ObjectHandle,
    key_pair: &pk11::KeyPair,
    template: &CertTemplate,
) -> SpmResult<CertInfo> {
    let public = session
        .export_key(key_pair.public_key)
        .map_spm_err(SpmError::crypto("failed to export generated public key"))?;
    let spki = match public {
        ExportedKey::SubjectPublicKeyInfo(der) => der,
        other => {
            return Err(SpmError::exported_type(format!(
                "expected a public key, got an {}",
                other.variant_name()
            )))
        }
    };

    let wrapped = session
        .wrap_aes(wrapping_key, key_pair.private_key)
        .map_spm_err(SpmError::crypto("failed to wrap generated private key"))?;

    let tbs = cert::build_tbs_certificate(
        template,
        &ca.tbs_certificate.subject,
        &spki,
        signature_algorithm,
    )?;
    let signature = session
        .sign_ecdsa(ca_key, hash, &tbs)
        .map_spm_err(SpmError::crypto("failed to sign certificate"))?;
    let signature = assembler::encode_ecdsa_signature(&signature.r, &signature.s)?;
    let cert = assembler::assemble_certificate(&tbs, signature_algorithm.oid, &signature)?;

    Ok(CertInfo {
        cert,
        wrapped_key: wrapped.ciphertext,
        iv: wrapped.iv,
    })
}
