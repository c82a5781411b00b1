//! Криптографические примитивы командного канала
//!
//! Этот модуль предоставляет обёртки над криптографическими операциями:
//! - NIST P-256 (ECDH): обмен ключами Диффи-Хеллмана
//! - AES-128-GCM: AEAD шифрование команд
//! - HKDF-SHA256: деривация сессионных ключей
//! - ECDSA P-256: подписи конвертов до установления сессии
//! - HMAC-SHA256: аутентификация управляющих уведомлений
//!
//! Автомобиль фиксирует набор алгоритмов, клиент обязан совпадать с ним
//! бит в бит. Все секретные данные зануляются при удалении (Zeroize).

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes128Gcm, Nonce,
};
use hkdf::Hkdf;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, PublicKey, SecretKey};
use rand::{CryptoRng, RngCore};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::{CryptoError, Result};

/// Размер публичного ключа P-256 в несжатой форме (0x04 || X || Y)
pub const PUBLIC_KEY_SIZE: usize = 65;

/// Размер приватного скаляра P-256 (32 байта, big-endian)
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Размер идентификатора ключа (первые 4 байта SHA-1 от публичного ключа)
pub const KEY_ID_SIZE: usize = 4;

/// Размер эпохи счётчика (16 байт, выдаётся автомобилем)
pub const EPOCH_SIZE: usize = 16;

/// Размер сессионного ключа AES-128-GCM
pub const SESSION_KEY_SIZE: usize = 16;

/// Размер nonce для AES-GCM (12 байт)
pub const GCM_NONCE_SIZE: usize = 12;

/// Размер auth tag GCM (16 байт)
pub const GCM_TAG_SIZE: usize = 16;

/// Размер подписи ECDSA P-256 (64 байта, r || s)
pub const ECDSA_SIGNATURE_SIZE: usize = 64;

/// Размер HMAC-SHA256 тега
pub const HMAC_TAG_SIZE: usize = 32;

/// Размер случайного challenge в запросе сессии
pub const CHALLENGE_SIZE: usize = 4;

/// Контекст HKDF для ключа шифрования
const HKDF_INFO_ENCRYPTION: &[u8] = b"authenticated command";

/// Контекст HKDF для ключа аутентификации
const HKDF_INFO_AUTHENTICATION: &[u8] = b"authenticated command hmac";

// Теги AAD (tag-length-value строка протокола автомобиля)
const AAD_TAG_DOMAIN: u8 = 0x01;
const AAD_TAG_EPOCH: u8 = 0x03;
const AAD_TAG_COUNTER: u8 = 0x05;

/// Ключевая пара P-256 клиента
///
/// Приватный скаляр живёт внутри `p256::SecretKey`, который зануляет
/// себя при удалении.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: [u8; PUBLIC_KEY_SIZE],
}

impl KeyPair {
    /// Генерация новой ключевой пары P-256
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = SecretKey::random(rng);
        let public = encode_public(&secret.public_key());
        Self { secret, public }
    }

    /// Создать из существующего приватного скаляра (32 байта big-endian)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PRIVATE_KEY_SIZE {
            return Err(CryptoError::InvalidKeySize {
                expected: PRIVATE_KEY_SIZE,
                actual: bytes.len(),
            }
            .into());
        }

        let secret = SecretKey::from_slice(bytes)
            .map_err(|_| CryptoError::InvalidKeySize {
                expected: PRIVATE_KEY_SIZE,
                actual: bytes.len(),
            })?;
        let public = encode_public(&secret.public_key());

        Ok(Self { secret, public })
    }

    /// Получить байты публичного ключа (несжатая форма)
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public
    }

    /// Получить байты приватного скаляра
    pub fn private_bytes(&self) -> zeroize::Zeroizing<[u8; PRIVATE_KEY_SIZE]> {
        let mut out = [0u8; PRIVATE_KEY_SIZE];
        out.copy_from_slice(&self.secret.to_bytes());
        zeroize::Zeroizing::new(out)
    }

    /// Идентификатор локального ключа
    pub fn key_id(&self) -> [u8; KEY_ID_SIZE] {
        derive_key_id(&self.public)
    }

    /// Выполнить обмен ключами Диффи-Хеллмана с публичным ключом автомобиля
    ///
    /// Точка проверяется на принадлежность кривой; нейтральный элемент и
    /// мусорные кодировки отклоняются как `InvalidPeerKey`.
    pub fn diffie_hellman(&self, peer_public: &[u8]) -> Result<SharedSecret> {
        let peer = parse_public_key(peer_public)?;

        let shared = p256::ecdh::diffie_hellman(
            self.secret.to_nonzero_scalar(),
            peer.as_affine(),
        );

        let mut bytes = [0u8; PRIVATE_KEY_SIZE];
        bytes.copy_from_slice(shared.raw_secret_bytes().as_slice());

        Ok(SharedSecret { bytes })
    }

    /// Подписать сообщение приватным ключом (ECDSA P-256)
    pub fn sign(&self, message: &[u8]) -> [u8; ECDSA_SIGNATURE_SIZE] {
        let signing_key = SigningKey::from(&self.secret);
        let signature: Signature = signing_key.sign(message);

        let mut out = [0u8; ECDSA_SIGNATURE_SIZE];
        out.copy_from_slice(&signature.to_bytes());
        out
    }
}

/// Общий секрет после обмена ключами (автоматически зануляется)
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; PRIVATE_KEY_SIZE],
}

impl SharedSecret {
    /// Получить байты общего секрета
    pub fn as_bytes(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.bytes
    }

    /// Деривация пары сессионных ключей через HKDF-SHA256
    ///
    /// Соль связывает ключи с эпохой и с обеими сторонами:
    /// `epoch || local_key_id || vehicle_key_id`.
    pub fn derive_session_keys(
        &self,
        epoch: &[u8; EPOCH_SIZE],
        local_key_id: &[u8; KEY_ID_SIZE],
        vehicle_key_id: &[u8; KEY_ID_SIZE],
    ) -> Result<SessionKeys> {
        let mut salt = Vec::with_capacity(EPOCH_SIZE + KEY_ID_SIZE * 2);
        salt.extend_from_slice(epoch);
        salt.extend_from_slice(local_key_id);
        salt.extend_from_slice(vehicle_key_id);

        let encryption = self.expand(&salt, HKDF_INFO_ENCRYPTION)?;
        let authentication = self.expand(&salt, HKDF_INFO_AUTHENTICATION)?;

        Ok(SessionKeys {
            encryption,
            authentication,
        })
    }

    fn expand(&self, salt: &[u8], info: &[u8]) -> Result<[u8; SESSION_KEY_SIZE]> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), &self.bytes);

        let mut okm = [0u8; SESSION_KEY_SIZE];
        hkdf.expand(info, &mut okm)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        Ok(okm)
    }
}

/// Пара сессионных ключей одного домена (автоматически зануляется)
#[derive(Clone, ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Ключ AES-128-GCM для команд
    encryption: [u8; SESSION_KEY_SIZE],
    /// Ключ HMAC для управляющих уведомлений
    authentication: [u8; SESSION_KEY_SIZE],
}

impl SessionKeys {
    /// Ключ шифрования
    pub fn encryption(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.encryption
    }

    /// Ключ аутентификации
    pub fn authentication(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.authentication
    }

    /// Собрать из готовых байтов (для тестирования)
    #[cfg(test)]
    pub fn from_bytes(
        encryption: [u8; SESSION_KEY_SIZE],
        authentication: [u8; SESSION_KEY_SIZE],
    ) -> Self {
        Self {
            encryption,
            authentication,
        }
    }
}

/// Построить детерминированный nonce из домена и счётчика
///
/// Формат: `domain (4 BE) || 0x00000000 || counter (4 BE)`. Ключи
/// деривируются заново на каждую эпоху, поэтому пара (domain, counter)
/// не повторяется под одним ключом.
pub fn build_nonce(domain: u32, counter: u32) -> [u8; GCM_NONCE_SIZE] {
    let mut nonce = [0u8; GCM_NONCE_SIZE];
    nonce[0..4].copy_from_slice(&domain.to_be_bytes());
    nonce[8..12].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Построить AAD для шифрования/расшифровки
///
/// AAD = TagDomain + Domain + TagCounter + Counter + TagEpoch + Epoch
pub fn build_aad(domain: u32, counter: u32, epoch: &[u8; EPOCH_SIZE]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + 4 + 1 + 4 + 1 + EPOCH_SIZE);

    aad.push(AAD_TAG_DOMAIN);
    aad.extend_from_slice(&domain.to_be_bytes());

    aad.push(AAD_TAG_COUNTER);
    aad.extend_from_slice(&counter.to_be_bytes());

    aad.push(AAD_TAG_EPOCH);
    aad.extend_from_slice(epoch);

    aad
}

/// Зашифровать payload сессионным ключом
///
/// Возвращает (ciphertext, auth_tag).
pub fn seal(
    key: &[u8; SESSION_KEY_SIZE],
    nonce: &[u8; GCM_NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; GCM_TAG_SIZE])> {
    let cipher = Aes128Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKeySize {
            expected: SESSION_KEY_SIZE,
            actual: key.len(),
        })?;

    let payload = Payload {
        msg: plaintext,
        aad,
    };

    let mut ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce), payload)
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    let tag_start = ciphertext.len() - GCM_TAG_SIZE;
    let mut tag = [0u8; GCM_TAG_SIZE];
    tag.copy_from_slice(&ciphertext[tag_start..]);
    ciphertext.truncate(tag_start);

    Ok((ciphertext, tag))
}

/// Расшифровать и верифицировать payload
pub fn open(
    key: &[u8; SESSION_KEY_SIZE],
    nonce: &[u8; GCM_NONCE_SIZE],
    ciphertext: &[u8],
    tag: &[u8; GCM_TAG_SIZE],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes128Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKeySize {
            expected: SESSION_KEY_SIZE,
            actual: key.len(),
        })?;

    let mut combined = Vec::with_capacity(ciphertext.len() + GCM_TAG_SIZE);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    let payload = Payload {
        msg: &combined,
        aad,
    };

    cipher
        .decrypt(Nonce::from_slice(nonce), payload)
        .map_err(|_| CryptoError::AuthenticationFailed.into())
}

/// Верификация подписи ECDSA P-256
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    if signature.len() != ECDSA_SIGNATURE_SIZE {
        return Err(CryptoError::SignatureVerification.into());
    }

    let peer = parse_public_key(public_key)?;
    let verifying_key = VerifyingKey::from(&peer);

    let sig = Signature::from_slice(signature)
        .map_err(|_| CryptoError::SignatureVerification)?;

    verifying_key
        .verify(message, &sig)
        .map_err(|_| CryptoError::SignatureVerification)?;

    Ok(())
}

/// Идентификатор ключа: первые 4 байта SHA-1 от публичного ключа
pub fn derive_key_id(public_key: &[u8]) -> [u8; KEY_ID_SIZE] {
    let digest = Sha1::digest(public_key);
    let mut id = [0u8; KEY_ID_SIZE];
    id.copy_from_slice(&digest[..KEY_ID_SIZE]);
    id
}

/// HMAC-SHA256 для аутентификации управляющих уведомлений
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; HMAC_TAG_SIZE] {
    use ring::hmac;

    let signing_key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let signature = hmac::sign(&signing_key, data);
    let mut result = [0u8; HMAC_TAG_SIZE];
    result.copy_from_slice(signature.as_ref());
    result
}

/// Верификация HMAC-SHA256
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], expected_tag: &[u8]) -> bool {
    use ring::hmac;

    let signing_key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::verify(&signing_key, data, expected_tag).is_ok()
}

/// Генерация случайного массива фиксированного размера
pub fn random_array<R: RngCore + CryptoRng, const N: usize>(rng: &mut R) -> [u8; N] {
    let mut bytes = [0u8; N];
    rng.fill_bytes(&mut bytes);
    bytes
}

/// Проверить и распарсить публичный ключ партнёра
fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    if bytes.len() != PUBLIC_KEY_SIZE {
        return Err(CryptoError::InvalidKeySize {
            expected: PUBLIC_KEY_SIZE,
            actual: bytes.len(),
        }
        .into());
    }

    // Принимаем только несжатую форму
    if bytes[0] != 0x04 {
        return Err(CryptoError::InvalidPeerKey.into());
    }

    let encoded = EncodedPoint::from_bytes(bytes)
        .map_err(|_| CryptoError::InvalidPeerKey)?;

    Option::<PublicKey>::from(PublicKey::from_encoded_point(&encoded))
        .ok_or_else(|| CryptoError::InvalidPeerKey.into())
}

fn encode_public(public: &PublicKey) -> [u8; PUBLIC_KEY_SIZE] {
    let encoded = public.to_encoded_point(false);
    let mut out = [0u8; PUBLIC_KEY_SIZE];
    out.copy_from_slice(encoded.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_key_pair_generation() {
        let mut rng = OsRng;
        let key = KeyPair::generate(&mut rng);

        let public = key.public_bytes();
        assert_eq!(public.len(), PUBLIC_KEY_SIZE);
        assert_eq!(public[0], 0x04);
    }

    #[test]
    fn test_key_pair_roundtrip() {
        let mut rng = OsRng;
        let key = KeyPair::generate(&mut rng);

        let restored = KeyPair::from_bytes(&key.private_bytes()[..]).unwrap();
        assert_eq!(key.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn test_invalid_private_key_size() {
        let result = KeyPair::from_bytes(&[0x42u8; 16]);
        assert!(result.is_err());
    }

    #[test]
    fn test_ecdh_commutativity() {
        let mut rng = OsRng;

        let client_key = KeyPair::generate(&mut rng);
        let vehicle_key = KeyPair::generate(&mut rng);

        let client_shared = client_key
            .diffie_hellman(&vehicle_key.public_bytes())
            .unwrap();
        let vehicle_shared = vehicle_key
            .diffie_hellman(&client_key.public_bytes())
            .unwrap();

        assert_eq!(client_shared.as_bytes(), vehicle_shared.as_bytes());
    }

    #[test]
    fn test_ecdh_rejects_invalid_point() {
        let mut rng = OsRng;
        let key = KeyPair::generate(&mut rng);

        // Неверная длина
        assert!(key.diffie_hellman(&[0x04u8; 33]).is_err());

        // Сжатая форма
        let mut compressed = [0x02u8; PUBLIC_KEY_SIZE];
        compressed[0] = 0x02;
        assert!(key.diffie_hellman(&compressed).is_err());

        // Точка вне кривой
        let garbage = [0x04u8; PUBLIC_KEY_SIZE];
        assert!(key.diffie_hellman(&garbage).is_err());
    }

    #[test]
    fn test_session_key_derivation_deterministic() {
        let mut rng = OsRng;

        let client_key = KeyPair::generate(&mut rng);
        let vehicle_key = KeyPair::generate(&mut rng);

        let epoch = [0x11u8; EPOCH_SIZE];
        let local_id = client_key.key_id();
        let vehicle_id = derive_key_id(&vehicle_key.public_bytes());

        let shared = client_key
            .diffie_hellman(&vehicle_key.public_bytes())
            .unwrap();

        let keys1 = shared
            .derive_session_keys(&epoch, &local_id, &vehicle_id)
            .unwrap();
        let keys2 = shared
            .derive_session_keys(&epoch, &local_id, &vehicle_id)
            .unwrap();

        assert_eq!(keys1.encryption(), keys2.encryption());
        assert_eq!(keys1.authentication(), keys2.authentication());
        assert_ne!(keys1.encryption(), keys1.authentication());
    }

    #[test]
    fn test_both_sides_derive_same_keys() {
        let mut rng = OsRng;

        let client_key = KeyPair::generate(&mut rng);
        let vehicle_key = KeyPair::generate(&mut rng);

        let epoch = [0xA5u8; EPOCH_SIZE];
        let client_id = client_key.key_id();
        let vehicle_id = vehicle_key.key_id();

        let client_keys = client_key
            .diffie_hellman(&vehicle_key.public_bytes())
            .unwrap()
            .derive_session_keys(&epoch, &client_id, &vehicle_id)
            .unwrap();

        let vehicle_keys = vehicle_key
            .diffie_hellman(&client_key.public_bytes())
            .unwrap()
            .derive_session_keys(&epoch, &client_id, &vehicle_id)
            .unwrap();

        assert_eq!(client_keys.encryption(), vehicle_keys.encryption());
    }

    #[test]
    fn test_hkdf_reference_vector() {
        // RFC 5869, Test Case 1 (SHA-256)
        let ikm = [0x0bu8; 22];
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();

        let hkdf = Hkdf::<Sha256>::new(Some(&salt), &ikm);
        let mut okm = [0u8; 42];
        hkdf.expand(&info, &mut okm).unwrap();

        let expected = hex::decode(
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865",
        )
        .unwrap();
        assert_eq!(&okm[..], &expected[..]);
    }

    #[test]
    fn test_nonce_construction() {
        let nonce = build_nonce(2, 0x01020304);
        assert_eq!(&nonce[0..4], &[0, 0, 0, 2]);
        assert_eq!(&nonce[4..8], &[0, 0, 0, 0]);
        assert_eq!(&nonce[8..12], &[1, 2, 3, 4]);

        // Разные счётчики — разные nonce
        assert_ne!(build_nonce(2, 1), build_nonce(2, 2));
        // Разные домены — разные nonce
        assert_ne!(build_nonce(2, 1), build_nonce(3, 1));
    }

    #[test]
    fn test_aad_layout() {
        let epoch = [0xEEu8; EPOCH_SIZE];
        let aad = build_aad(3, 7, &epoch);

        assert_eq!(aad.len(), 1 + 4 + 1 + 4 + 1 + EPOCH_SIZE);
        assert_eq!(aad[0], 0x01);
        assert_eq!(&aad[1..5], &[0, 0, 0, 3]);
        assert_eq!(aad[5], 0x05);
        assert_eq!(&aad[6..10], &[0, 0, 0, 7]);
        assert_eq!(aad[10], 0x03);
        assert_eq!(&aad[11..], &epoch[..]);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [0x42u8; SESSION_KEY_SIZE];
        let nonce = build_nonce(2, 6);
        let epoch = [0x01u8; EPOCH_SIZE];
        let aad = build_aad(2, 6, &epoch);

        let plaintext = b"unlock";
        let (ciphertext, tag) = seal(&key, &nonce, plaintext, &aad).unwrap();
        assert_ne!(&ciphertext[..], &plaintext[..]);

        let decrypted = open(&key, &nonce, &ciphertext, &tag, &aad).unwrap();
        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn test_open_wrong_aad() {
        let key = [0x42u8; SESSION_KEY_SIZE];
        let nonce = build_nonce(2, 6);
        let epoch = [0x01u8; EPOCH_SIZE];

        let (ciphertext, tag) =
            seal(&key, &nonce, b"lock", &build_aad(2, 6, &epoch)).unwrap();

        let result = open(&key, &nonce, &ciphertext, &tag, &build_aad(2, 7, &epoch));
        assert!(result.is_err());
    }

    #[test]
    fn test_open_wrong_key() {
        let key1 = [0x42u8; SESSION_KEY_SIZE];
        let key2 = [0x43u8; SESSION_KEY_SIZE];
        let nonce = build_nonce(2, 1);
        let epoch = [0u8; EPOCH_SIZE];
        let aad = build_aad(2, 1, &epoch);

        let (ciphertext, tag) = seal(&key1, &nonce, b"wake", &aad).unwrap();
        assert!(open(&key2, &nonce, &ciphertext, &tag, &aad).is_err());
    }

    #[test]
    fn test_ecdsa_signature() {
        let mut rng = OsRng;
        let key = KeyPair::generate(&mut rng);

        let message = b"session info request";
        let signature = key.sign(message);

        assert_eq!(signature.len(), ECDSA_SIGNATURE_SIZE);
        assert!(verify_signature(&key.public_bytes(), message, &signature).is_ok());
        assert!(
            verify_signature(&key.public_bytes(), b"other message", &signature).is_err()
        );
    }

    #[test]
    fn test_key_id() {
        let mut rng = OsRng;
        let key = KeyPair::generate(&mut rng);

        let id1 = key.key_id();
        let id2 = derive_key_id(&key.public_bytes());

        assert_eq!(id1, id2);
        assert_eq!(id1.len(), KEY_ID_SIZE);
    }

    #[test]
    fn test_hmac_sha256() {
        let key = b"authentication key";
        let data = b"epoch change";

        let tag = hmac_sha256(key, data);
        assert_eq!(tag.len(), HMAC_TAG_SIZE);

        assert!(verify_hmac_sha256(key, data, &tag));
        assert!(!verify_hmac_sha256(key, b"wrong data", &tag));
        assert!(!verify_hmac_sha256(b"wrong key", data, &tag));
    }

    #[test]
    fn test_random_array() {
        let mut rng = OsRng;
        let a: [u8; 32] = random_array(&mut rng);
        let b: [u8; 32] = random_array(&mut rng);
        assert_ne!(a, b);
    }
}
