// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process software token.
//!
//! Backend for [`HsmType::SoftHsm`]: an in-memory token that implements the
//! capability traits over OpenSSL primitives. Objects are UID-addressed and
//! private operations require a logged-in session, so the token behaves
//! close enough to a networked HSM for integration testing. Sign traffic is
//! instrumented (in-flight high-water mark, total count, optional delay) so
//! tests can observe pool-bounded concurrency.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use openssl::aes;
use openssl::aes::AesKey;
use openssl::bn::BigNum;
use openssl::ec::EcGroup;
use openssl::ec::EcKey;
use openssl::ecdsa::EcdsaSig;
use openssl::error::ErrorStack;
use openssl::hash::hash;
use openssl::hash::MessageDigest;
use openssl::md::Md;
use openssl::nid::Nid;
use openssl::pkey::Id;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::pkey::Public;
use openssl::pkey_ctx::PkeyCtx;
use openssl::rand::rand_bytes;
use openssl::rsa::Rsa;
use parking_lot::RwLock;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::*;

/// RFC 3394 default initial value.
const WRAP_IV: [u8; 8] = [0xA6; 8];

fn ssl_err(err: ErrorStack) -> Pk11Error {
    Pk11Error::FunctionFailed(err.to_string())
}

fn message_digest(hash: HashAlgo) -> MessageDigest {
    match hash {
        HashAlgo::Sha256 => MessageDigest::sha256(),
        HashAlgo::Sha384 => MessageDigest::sha384(),
        HashAlgo::Sha512 => MessageDigest::sha512(),
    }
}

enum KeyMaterial {
    Aes(Zeroizing<Vec<u8>>),
    EcPrivate(EcKey<Private>),
    RsaPrivate(Rsa<Private>),
    Public(PKey<Public>),
}

struct SoftObject {
    label: Option<String>,
    uid: Option<Vec<u8>>,
    class: KeyClass,
    extractable: bool,
    material: KeyMaterial,
}

struct SoftTokenInner {
    pin: String,
    next_handle: AtomicU64,
    objects: RwLock<HashMap<u64, SoftObject>>,
    sign_delay: RwLock<Option<Duration>>,
    signs_in_flight: AtomicUsize,
    sign_high_water: AtomicUsize,
    sign_count: AtomicUsize,
}

/// A single in-memory token (one slot).
#[derive(Clone)]
pub struct SoftToken {
    inner: Arc<SoftTokenInner>,
}

impl SoftToken {
    fn new(pin: &str) -> Self {
        SoftToken {
            inner: Arc::new(SoftTokenInner {
                pin: pin.to_owned(),
                next_handle: AtomicU64::new(1),
                objects: RwLock::new(HashMap::new()),
                sign_delay: RwLock::new(None),
                signs_in_flight: AtomicUsize::new(0),
                sign_high_water: AtomicUsize::new(0),
                sign_count: AtomicUsize::new(0),
            }),
        }
    }

    fn insert_object(&self, object: SoftObject) -> ObjectHandle {
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        self.inner.objects.write().insert(handle, object);
        ObjectHandle(handle)
    }

    /// Provisions a long-lived AES key under `label`; returns its UID.
    pub fn import_aes_key(&self, label: &str, material: &[u8]) -> Pk11Result<Vec<u8>> {
        if !matches!(material.len(), 16 | 24 | 32) {
            return Err(Pk11Error::Unsupported(format!(
                "AES key length {}",
                material.len()
            )));
        }
        let uid = Uuid::new_v4().as_bytes().to_vec();
        self.insert_object(SoftObject {
            label: Some(label.to_owned()),
            uid: Some(uid.clone()),
            class: KeyClass::SecretKey,
            extractable: false,
            material: KeyMaterial::Aes(Zeroizing::new(material.to_vec())),
        });
        Ok(uid)
    }

    /// Provisions a long-lived EC private key under `label`; returns its UID.
    pub fn import_ec_private_key(&self, label: &str, key: EcKey<Private>) -> Pk11Result<Vec<u8>> {
        let uid = Uuid::new_v4().as_bytes().to_vec();
        self.insert_object(SoftObject {
            label: Some(label.to_owned()),
            uid: Some(uid.clone()),
            class: KeyClass::PrivateKey,
            extractable: false,
            material: KeyMaterial::EcPrivate(key),
        });
        Ok(uid)
    }

    /// Number of objects currently held by the token.
    pub fn object_count(&self) -> usize {
        self.inner.objects.read().len()
    }

    /// Total number of ECDSA sign operations served.
    pub fn sign_count(&self) -> usize {
        self.inner.sign_count.load(Ordering::SeqCst)
    }

    /// Number of ECDSA sign operations currently in flight.
    pub fn signs_in_flight(&self) -> usize {
        self.inner.signs_in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of ECDSA sign operations observed in flight at once.
    pub fn sign_high_water(&self) -> usize {
        self.inner.sign_high_water.load(Ordering::SeqCst)
    }

    /// Artificially delays each sign operation; `None` disables the delay.
    pub fn set_sign_delay(&self, delay: Option<Duration>) {
        *self.inner.sign_delay.write() = delay;
    }
}

impl Token for SoftToken {
    fn open_session(&self) -> Pk11Result<Box<dyn Session>> {
        Ok(Box::new(SoftSession {
            token: self.clone(),
            logged_in: AtomicBool::new(false),
        }))
    }
}

/// A software PKCS#11 module holding one or more tokens.
pub struct SoftModule {
    tokens: RwLock<Vec<SoftToken>>,
}

impl SoftModule {
    /// Creates a module with a single token protected by `pin` and registers
    /// it in the process-global registry under `so_path`.
    pub fn create(so_path: &str, pin: &str) -> Arc<SoftModule> {
        let module = Arc::new(SoftModule {
            tokens: RwLock::new(vec![SoftToken::new(pin)]),
        });
        super::register_module(so_path, module.clone());
        module
    }

    /// Returns a handle to the token in `slot`.
    pub fn token(&self, slot: usize) -> Option<SoftToken> {
        self.tokens.read().get(slot).cloned()
    }

    /// Adds another token (slot) to the module.
    pub fn add_token(&self, pin: &str) -> SoftToken {
        let token = SoftToken::new(pin);
        self.tokens.write().push(token.clone());
        token
    }
}

impl Module for SoftModule {
    fn tokens(&self) -> Pk11Result<Vec<Arc<dyn Token>>> {
        Ok(self
            .tokens
            .read()
            .iter()
            .map(|token| Arc::new(token.clone()) as Arc<dyn Token>)
            .collect())
    }
}

struct SoftSession {
    token: SoftToken,
    logged_in: AtomicBool,
}

impl SoftSession {
    fn require_login(&self) -> Pk11Result<()> {
        if self.logged_in.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Pk11Error::NotLoggedIn)
        }
    }

    fn find_by_uid(&self, class: KeyClass, uid: &[u8]) -> Pk11Result<ObjectHandle> {
        self.require_login()?;
        let objects = self.token.inner.objects.read();
        objects
            .iter()
            .find(|(_, obj)| obj.class == class && obj.uid.as_deref() == Some(uid))
            .map(|(&handle, _)| ObjectHandle(handle))
            .ok_or_else(|| Pk11Error::NotFound(format!("no {class:?} object with UID {uid:02x?}")))
    }

    fn hkdf(hash: HashAlgo, ikm: &[u8], salt: &[u8], info: &[u8], out: &mut [u8]) -> Pk11Result<()> {
        let md = match hash {
            HashAlgo::Sha256 => Md::sha256(),
            HashAlgo::Sha384 => Md::sha384(),
            HashAlgo::Sha512 => Md::sha512(),
        };
        let mut ctx = PkeyCtx::new_id(Id::HKDF).map_err(ssl_err)?;
        ctx.derive_init().map_err(ssl_err)?;
        ctx.set_hkdf_md(md).map_err(ssl_err)?;
        ctx.set_hkdf_key(ikm).map_err(ssl_err)?;
        ctx.set_hkdf_salt(salt).map_err(ssl_err)?;
        ctx.add_hkdf_info(info).map_err(ssl_err)?;
        ctx.derive(Some(out)).map_err(ssl_err)?;
        Ok(())
    }

    fn wrap_plaintext(object: &SoftObject) -> Pk11Result<Zeroizing<Vec<u8>>> {
        if !object.extractable {
            return Err(Pk11Error::Unsupported("key is not extractable".into()));
        }
        match &object.material {
            KeyMaterial::Aes(bytes) => Ok(Zeroizing::new(bytes.to_vec())),
            KeyMaterial::EcPrivate(key) => {
                let len = (key.group().degree() as usize + 7) / 8;
                let mut scalar = key
                    .private_key()
                    .to_vec_padded(len as i32)
                    .map_err(ssl_err)?;
                // RFC 3394 operates on 64-bit blocks; leading zeros keep the
                // scalar value intact.
                while scalar.len() % 8 != 0 {
                    scalar.insert(0, 0);
                }
                Ok(Zeroizing::new(scalar))
            }
            KeyMaterial::RsaPrivate(rsa) => {
                let pkey = PKey::from_rsa(rsa.clone()).map_err(ssl_err)?;
                let mut der = pkey.private_key_to_pkcs8().map_err(ssl_err)?;
                while der.len() % 8 != 0 {
                    der.push(0);
                }
                Ok(Zeroizing::new(der))
            }
            KeyMaterial::Public(_) => Err(Pk11Error::Unsupported("wrapping a public key".into())),
        }
    }
}

impl Session for SoftSession {
    fn login(&self, user: UserType, pin: &str) -> Pk11Result<()> {
        if user != UserType::NormalUser {
            return Err(Pk11Error::Unsupported(
                "only Crypto User login is supported".into(),
            ));
        }
        if pin != self.token.inner.pin {
            return Err(Pk11Error::AuthFailed);
        }
        self.logged_in.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn find_key_by_label(&self, class: KeyClass, label: &str) -> Pk11Result<ObjectHandle> {
        self.require_login()?;
        let objects = self.token.inner.objects.read();
        objects
            .iter()
            .find(|(_, obj)| obj.class == class && obj.label.as_deref() == Some(label))
            .map(|(&handle, _)| ObjectHandle(handle))
            .ok_or_else(|| {
                Pk11Error::NotFound(format!("no {class:?} object labelled {label:?}"))
            })
    }

    fn object_uid(&self, object: ObjectHandle) -> Pk11Result<Option<Vec<u8>>> {
        let objects = self.token.inner.objects.read();
        let obj = objects.get(&object.0).ok_or(Pk11Error::InvalidHandle)?;
        Ok(obj.uid.clone())
    }

    fn find_secret_key(&self, uid: &[u8]) -> Pk11Result<ObjectHandle> {
        self.find_by_uid(KeyClass::SecretKey, uid)
    }

    fn find_private_key(&self, uid: &[u8]) -> Pk11Result<ObjectHandle> {
        self.find_by_uid(KeyClass::PrivateKey, uid)
    }

    fn hkdf_derive_aes(
        &self,
        ikm: ObjectHandle,
        hash: HashAlgo,
        salt: &[u8],
        info: &[u8],
        bits: usize,
        opts: &KeyOptions,
    ) -> Pk11Result<ObjectHandle> {
        self.require_login()?;
        if !matches!(bits, 128 | 192 | 256) {
            return Err(Pk11Error::Unsupported(format!("AES key size {bits}")));
        }
        let ikm = {
            let objects = self.token.inner.objects.read();
            let obj = objects.get(&ikm.0).ok_or(Pk11Error::InvalidHandle)?;
            match &obj.material {
                KeyMaterial::Aes(bytes) => Zeroizing::new(bytes.to_vec()),
                _ => {
                    return Err(Pk11Error::Unsupported(
                        "HKDF base key must be a secret key".into(),
                    ))
                }
            }
        };
        let mut derived = Zeroizing::new(vec![0u8; bits / 8]);
        Self::hkdf(hash, &ikm, salt, info, &mut derived)?;
        Ok(self.insert_derived(derived, opts))
    }

    fn wrap_aes(
        &self,
        wrapping_key: ObjectHandle,
        target: ObjectHandle,
    ) -> Pk11Result<WrappedKey> {
        self.require_login()?;
        let objects = self.token.inner.objects.read();
        let kek = objects
            .get(&wrapping_key.0)
            .ok_or(Pk11Error::InvalidHandle)?;
        let kek = match &kek.material {
            KeyMaterial::Aes(bytes) => AesKey::new_encrypt(bytes)
                .map_err(|err| Pk11Error::FunctionFailed(format!("{err:?}")))?,
            _ => {
                return Err(Pk11Error::Unsupported(
                    "wrapping key must be an AES key".into(),
                ))
            }
        };
        let target = objects.get(&target.0).ok_or(Pk11Error::InvalidHandle)?;
        let plaintext = Self::wrap_plaintext(target)?;
        let mut ciphertext = vec![0u8; plaintext.len() + 8];
        let written = aes::wrap_key(&kek, None, &mut ciphertext, &plaintext)
            .map_err(|err| Pk11Error::FunctionFailed(format!("{err:?}")))?;
        ciphertext.truncate(written);
        Ok(WrappedKey {
            ciphertext,
            iv: WRAP_IV.to_vec(),
        })
    }

    fn export_key(&self, key: ObjectHandle) -> Pk11Result<ExportedKey> {
        self.require_login()?;
        let objects = self.token.inner.objects.read();
        let obj = objects.get(&key.0).ok_or(Pk11Error::InvalidHandle)?;
        match &obj.material {
            KeyMaterial::Public(pkey) => Ok(ExportedKey::SubjectPublicKeyInfo(
                pkey.public_key_to_der().map_err(ssl_err)?,
            )),
            KeyMaterial::Aes(bytes) => {
                if !obj.extractable {
                    return Err(Pk11Error::Unsupported("key is not extractable".into()));
                }
                Ok(ExportedKey::Aes(bytes.to_vec()))
            }
            _ => Err(Pk11Error::Unsupported("private key export".into())),
        }
    }

    fn generate_rsa(
        &self,
        mod_bits: u32,
        public_exponent: u32,
        opts: &KeyOptions,
    ) -> Pk11Result<KeyPair> {
        self.require_login()?;
        let exponent = BigNum::from_u32(public_exponent).map_err(ssl_err)?;
        let rsa = Rsa::generate_with_e(mod_bits, &exponent).map_err(ssl_err)?;
        let public = Rsa::from_public_components(
            rsa.n().to_owned().map_err(ssl_err)?,
            rsa.e().to_owned().map_err(ssl_err)?,
        )
        .map_err(ssl_err)?;
        let public = PKey::from_rsa(public).map_err(ssl_err)?;
        Ok(KeyPair {
            public_key: self.insert_public(public),
            private_key: self.insert_object_with(
                KeyClass::PrivateKey,
                opts.extractable,
                KeyMaterial::RsaPrivate(rsa),
            ),
        })
    }

    fn generate_ecdsa(&self, curve: EcCurve, opts: &KeyOptions) -> Pk11Result<KeyPair> {
        self.require_login()?;
        let nid = match curve {
            EcCurve::P256 => Nid::X9_62_PRIME256V1,
            EcCurve::P384 => Nid::SECP384R1,
            EcCurve::P521 => Nid::SECP521R1,
        };
        let group = EcGroup::from_curve_name(nid).map_err(ssl_err)?;
        let key = EcKey::generate(&group).map_err(ssl_err)?;
        let public = EcKey::from_public_key(&group, key.public_key()).map_err(ssl_err)?;
        let public = PKey::from_ec_key(public).map_err(ssl_err)?;
        Ok(KeyPair {
            public_key: self.insert_public(public),
            private_key: self.insert_object_with(
                KeyClass::PrivateKey,
                opts.extractable,
                KeyMaterial::EcPrivate(key),
            ),
        })
    }

    fn destroy_key_pair(&self, key_pair: &KeyPair) -> Pk11Result<()> {
        self.require_login()?;
        let mut objects = self.token.inner.objects.write();
        if !objects.contains_key(&key_pair.public_key.0)
            || !objects.contains_key(&key_pair.private_key.0)
        {
            return Err(Pk11Error::InvalidHandle);
        }
        objects.remove(&key_pair.public_key.0);
        objects.remove(&key_pair.private_key.0);
        Ok(())
    }

    fn sign_ecdsa(
        &self,
        key: ObjectHandle,
        hash_algo: HashAlgo,
        data: &[u8],
    ) -> Pk11Result<EcdsaSignature> {
        self.require_login()?;
        let key = {
            let objects = self.token.inner.objects.read();
            let obj = objects.get(&key.0).ok_or(Pk11Error::InvalidHandle)?;
            match &obj.material {
                KeyMaterial::EcPrivate(key) => key.clone(),
                _ => {
                    return Err(Pk11Error::Unsupported(
                        "ECDSA sign requires an EC private key".into(),
                    ))
                }
            }
        };
        let inner = &self.token.inner;
        let in_flight = inner.signs_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.sign_high_water.fetch_max(in_flight, Ordering::SeqCst);
        if let Some(delay) = *inner.sign_delay.read() {
            thread::sleep(delay);
        }
        let result = hash(message_digest(hash_algo), data)
            .and_then(|digest| EcdsaSig::sign(&digest, &key))
            .map_err(ssl_err);
        inner.signs_in_flight.fetch_sub(1, Ordering::SeqCst);
        inner.sign_count.fetch_add(1, Ordering::SeqCst);
        let sig = result?;
        Ok(EcdsaSignature {
            r: sig.r().to_vec(),
            s: sig.s().to_vec(),
        })
    }

    fn generate_random(&self, len: usize) -> Pk11Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        rand_bytes(&mut buf).map_err(ssl_err)?;
        Ok(buf)
    }
}

impl SoftSession {
    fn insert_derived(&self, material: Zeroizing<Vec<u8>>, opts: &KeyOptions) -> ObjectHandle {
        self.insert_object_with(
            KeyClass::SecretKey,
            opts.extractable,
            KeyMaterial::Aes(material),
        )
    }

    fn insert_public(&self, key: PKey<Public>) -> ObjectHandle {
        self.insert_object_with(KeyClass::PublicKey, true, KeyMaterial::Public(key))
    }

    fn insert_object_with(
        &self,
        class: KeyClass,
        extractable: bool,
        material: KeyMaterial,
    ) -> ObjectHandle {
        self.token.insert_object(SoftObject {
            label: None,
            uid: None,
            class,
            extractable,
            material,
        })
    }
}
