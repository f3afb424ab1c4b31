// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Capability-level interface to a PKCS#11-style cryptographic token.
//!
//! The SPM consumes tokens exclusively through the object-safe traits in
//! this module: a [`Module`] enumerates [`Token`]s, a token opens
//! [`Session`]s, and sessions expose the handle-based primitive operations
//! the SPM composes into its provisioning flows.
//!
//! Concrete backends register themselves in a process-global module
//! registry and are resolved by [`load`]. The in-tree software token
//! ([`soft`]) serves [`HsmType::SoftHsm`]; a hardware-backed PKCS#11 FFI
//! binding registers its own [`Module`] from the deployment glue without
//! any change to the SPM.

pub mod soft;

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;

/// Errors reported by token backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pk11Error {
    /// No backend is registered for the requested module path.
    ModuleNotFound(String),

    /// The referenced object handle is stale or unknown to the token.
    InvalidHandle,

    /// No object matched the search.
    NotFound(String),

    /// The session is not authenticated for the requested operation.
    NotLoggedIn,

    /// The supplied PIN was rejected.
    AuthFailed,

    /// The token cannot perform the requested operation.
    Unsupported(String),

    /// The token reported an operation failure.
    FunctionFailed(String),
}

impl Display for Pk11Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pk11Error::ModuleNotFound(msg) => write!(f, "module not found: {msg}"),
            Pk11Error::InvalidHandle => write!(f, "invalid object handle"),
            Pk11Error::NotFound(msg) => write!(f, "object not found: {msg}"),
            Pk11Error::NotLoggedIn => write!(f, "session is not logged in"),
            Pk11Error::AuthFailed => write!(f, "authentication failed"),
            Pk11Error::Unsupported(msg) => write!(f, "unsupported operation: {msg}"),
            Pk11Error::FunctionFailed(msg) => write!(f, "token function failed: {msg}"),
        }
    }
}

impl Error for Pk11Error {}

/// Result alias for token operations.
pub type Pk11Result<T> = Result<T, Pk11Error>;

/// The type of HSM behind a PKCS#11 module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HsmType {
    /// In-process software token.
    SoftHsm,

    /// Network-attached hardware HSM.
    NetworkHsm,
}

/// Token user types for [`Session::login`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserType {
    /// The Crypto User (PKCS#11 "normal user").
    NormalUser,

    /// The Security Officer.
    SecurityOfficer,
}

/// Object class used in label searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    /// Symmetric secret key.
    SecretKey,

    /// Private half of an asymmetric key pair.
    PrivateKey,

    /// Public half of an asymmetric key pair.
    PublicKey,
}

/// Hash algorithms supported for HKDF and ECDSA operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    /// SHA-256.
    Sha256,

    /// SHA-384.
    Sha384,

    /// SHA-512.
    Sha512,
}

/// NIST curves supported for key pair generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcCurve {
    /// NIST P-256 (secp256r1).
    P256,

    /// NIST P-384 (secp384r1).
    P384,

    /// NIST P-521 (secp521r1).
    P521,
}

impl EcCurve {
    /// Size in bytes of one field element or scalar on this curve.
    pub fn component_size(&self) -> usize {
        match self {
            EcCurve::P256 => 32,
            EcCurve::P384 => 48,
            EcCurve::P521 => 66,
        }
    }
}

/// Attributes applied to keys created on the token.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyOptions {
    /// Whether the key may be exported or wrapped off the token.
    pub extractable: bool,
}

/// Opaque handle to an object held by a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub(crate) u64);

/// Handles to a generated public/private key pair.
#[derive(Debug, Clone, Copy)]
pub struct KeyPair {
    /// Public half.
    pub public_key: ObjectHandle,

    /// Private half.
    pub private_key: ObjectHandle,
}

/// Key material exported off the token.
///
/// The concrete variant must match the caller's expectation; callers fail
/// on mismatch rather than coercing.
#[derive(Debug, Clone)]
pub enum ExportedKey {
    /// Raw AES key bytes.
    Aes(Vec<u8>),

    /// DER-encoded SubjectPublicKeyInfo of a public key.
    SubjectPublicKeyInfo(Vec<u8>),
}

impl ExportedKey {
    /// Short name of the concrete variant, for diagnostics.
    pub fn variant_name(&self) -> &'static str {
        match self {
            ExportedKey::Aes(_) => "AES key",
            ExportedKey::SubjectPublicKeyInfo(_) => "public key",
        }
    }
}

/// Ciphertext and IV produced by an AES key wrap.
#[derive(Debug, Clone)]
pub struct WrappedKey {
    /// RFC 3394 wrap ciphertext.
    pub ciphertext: Vec<u8>,

    /// Initial value used by the wrap.
    pub iv: Vec<u8>,
}

/// Raw ECDSA signature halves, big-endian.
#[derive(Debug, Clone)]
pub struct EcdsaSignature {
    /// The `r` component.
    pub r: Vec<u8>,

    /// The `s` component.
    pub s: Vec<u8>,
}

/// A loaded PKCS#11 module.
pub trait Module: Send + Sync {
    /// Enumerates the tokens presented by the module, in slot order.
    fn tokens(&self) -> Pk11Result<Vec<Arc<dyn Token>>>;
}

/// A token in a module slot.
pub trait Token: Send + Sync {
    /// Opens a new session on the token.
    fn open_session(&self) -> Pk11Result<Box<dyn Session>>;
}

/// An open token session.
///
/// Sessions are not thread-safe; the SPM serializes access to each session
/// through its pool. Objects created in a session (derived keys, generated
/// key pairs) live on the token until destroyed or the session closes.
pub trait Session: Send {
    /// Authenticates the session.
    fn login(&self, user: UserType, pin: &str) -> Pk11Result<()>;

    /// Finds an object of `class` by its label attribute.
    fn find_key_by_label(&self, class: KeyClass, label: &str) -> Pk11Result<ObjectHandle>;

    /// Reads the UID (ID attribute) of an object, if it carries one.
    fn object_uid(&self, object: ObjectHandle) -> Pk11Result<Option<Vec<u8>>>;

    /// Finds a secret key by UID.
    fn find_secret_key(&self, uid: &[u8]) -> Pk11Result<ObjectHandle>;

    /// Finds a private key by UID.
    fn find_private_key(&self, uid: &[u8]) -> Pk11Result<ObjectHandle>;

    /// HKDF-derives an AES key of `bits` from `ikm` on the token.
    fn hkdf_derive_aes(
        &self,
        ikm: ObjectHandle,
        hash: HashAlgo,
        salt: &[u8],
        info: &[u8],
        bits: usize,
        opts: &KeyOptions,
    ) -> Pk11Result<ObjectHandle>;

    /// AES-wraps `target` under `wrapping_key` (RFC 3394).
    fn wrap_aes(&self, wrapping_key: ObjectHandle, target: ObjectHandle)
        -> Pk11Result<WrappedKey>;

    /// Exports key material off the token.
    fn export_key(&self, key: ObjectHandle) -> Pk11Result<ExportedKey>;

    /// Generates an RSA key pair.
    fn generate_rsa(
        &self,
        mod_bits: u32,
        public_exponent: u32,
        opts: &KeyOptions,
    ) -> Pk11Result<KeyPair>;

    /// Generates an ECDSA key pair on `curve`.
    fn generate_ecdsa(&self, curve: EcCurve, opts: &KeyOptions) -> Pk11Result<KeyPair>;

    /// Destroys both halves of a generated key pair.
    fn destroy_key_pair(&self, key_pair: &KeyPair) -> Pk11Result<()>;

    /// Signs `data` with ECDSA after hashing it with `hash`.
    fn sign_ecdsa(&self, key: ObjectHandle, hash: HashAlgo, data: &[u8])
        -> Pk11Result<EcdsaSignature>;

    /// Returns `len` bytes from the token RNG.
    fn generate_random(&self, len: usize) -> Pk11Result<Vec<u8>>;
}

lazy_static! {
    static ref MODULES: Mutex<HashMap<String, Arc<dyn Module>>> = Mutex::new(HashMap::new());
}

/// Registers a module backend under `so_path`.
///
/// Subsequent [`load`] calls for the same path resolve to `module`. The
/// software token registers itself on creation; hardware bindings are
/// registered by the embedding application.
pub fn register_module(so_path: &str, module: Arc<dyn Module>) {
    MODULES.lock().insert(so_path.to_owned(), module);
}

/// Resolves the module backend registered under `so_path`.
pub fn load(hsm_type: HsmType, so_path: &str) -> Pk11Result<Arc<dyn Module>> {
    match MODULES.lock().get(so_path) {
        Some(module) => Ok(module.clone()),
        None => Err(Pk11Error::ModuleNotFound(format!(
            "no {hsm_type:?} module registered at {so_path:?}"
        ))),
    }
}
