//! Сообщения установления сессии и авторизации ключа
//!
//! Handshake с автомобилем двухэтапный, по одному на домен:
//!
//! 1. Client → Vehicle: SESSION_INFO_REQUEST
//!    - публичный ключ клиента (P-256, несжатый)
//!    - случайный challenge (4 байта)
//!    - конверт подписан ECDSA ключом клиента
//!
//! 2. Vehicle → Client: SESSION_INFO
//!    - статус, текущий счётчик, эпоха
//!    - публичный ключ автомобиля + эхо challenge
//!    - конверт подписан ключом автомобиля
//!
//! После этого обе стороны выводят сессионные ключи через ECDH + HKDF.
//! Отдельно определены сообщения whitelist-процедуры (добавление нового
//! ключа с физическим подтверждением) и уведомление о смене эпохи.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::{CryptoRng, RngCore};

use crate::crypto::{
    self, KeyPair, CHALLENGE_SIZE, EPOCH_SIZE, HMAC_TAG_SIZE, PUBLIC_KEY_SIZE,
    SESSION_KEY_SIZE,
};
use crate::envelope::Domain;
use crate::error::{ProtocolError, Result};

/// Статус в ответе SESSION_INFO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionInfoStatus {
    /// Сессия установлена
    Ok = 0,
    /// Ключ клиента не в whitelist, требуется pairing
    KeyNotWhitelisted = 1,
    /// Внутренняя ошибка автомобиля
    Fault = 2,
}

impl SessionInfoStatus {
    /// Преобразование из u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SessionInfoStatus::Ok),
            1 => Some(SessionInfoStatus::KeyNotWhitelisted),
            2 => Some(SessionInfoStatus::Fault),
            _ => None,
        }
    }
}

/// Роль запрашиваемого ключа
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyRole {
    /// Водитель (полный набор команд)
    Driver = 1,
}

/// Форм-фактор ключа
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyFormFactor {
    /// Облачный ключ (интеграция без физического носителя)
    CloudKey = 6,
}

/// Вердикт автомобиля по whitelist-запросу
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WhitelistDecision {
    /// Ожидается физическое подтверждение пользователем
    Pending = 0,
    /// Ключ принят
    Approved = 1,
    /// Ключ отклонён пользователем
    Denied = 2,
}

impl WhitelistDecision {
    /// Преобразование из u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(WhitelistDecision::Pending),
            1 => Some(WhitelistDecision::Approved),
            2 => Some(WhitelistDecision::Denied),
            _ => None,
        }
    }
}

/// Запрос параметров сессии
#[derive(Debug, Clone)]
pub struct SessionInfoRequest {
    /// Публичный ключ клиента
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Случайный challenge клиента
    pub challenge: [u8; CHALLENGE_SIZE],
}

impl SessionInfoRequest {
    /// Создать новый запрос
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R, key: &KeyPair) -> Self {
        Self {
            public_key: key.public_bytes(),
            challenge: crypto::random_array(rng),
        }
    }

    /// Сериализовать в байты
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PUBLIC_KEY_SIZE + CHALLENGE_SIZE);
        buf.put(&self.public_key[..]);
        buf.put(&self.challenge[..]);
        buf.freeze()
    }

    /// Десериализовать из байтов
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() != PUBLIC_KEY_SIZE + CHALLENGE_SIZE {
            return Err(ProtocolError::MalformedPayload(
                "некорректный размер запроса сессии".to_string(),
            )
            .into());
        }

        let mut cursor = data;
        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        cursor.copy_to_slice(&mut public_key);

        let mut challenge = [0u8; CHALLENGE_SIZE];
        cursor.copy_to_slice(&mut challenge);

        Ok(Self {
            public_key,
            challenge,
        })
    }
}

/// Параметры сессии от автомобиля
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Статус
    pub status: SessionInfoStatus,
    /// Текущий счётчик автомобиля
    pub counter: u32,
    /// Эпоха счётчика
    pub epoch: [u8; EPOCH_SIZE],
    /// Публичный ключ автомобиля
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Эхо challenge из запроса
    pub challenge_echo: [u8; CHALLENGE_SIZE],
}

impl SessionInfo {
    const SIZE: usize = 1 + 4 + EPOCH_SIZE + PUBLIC_KEY_SIZE + CHALLENGE_SIZE;

    /// Сериализовать в байты
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(self.status as u8);
        buf.put_u32(self.counter);
        buf.put(&self.epoch[..]);
        buf.put(&self.public_key[..]);
        buf.put(&self.challenge_echo[..]);
        buf.freeze()
    }

    /// Десериализовать из байтов
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::MalformedPayload(
                "некорректный размер параметров сессии".to_string(),
            )
            .into());
        }

        let mut cursor = data;
        let status_raw = cursor.get_u8();
        let status = SessionInfoStatus::from_u8(status_raw).ok_or_else(|| {
            ProtocolError::MalformedPayload(format!(
                "неизвестный статус сессии: {}",
                status_raw
            ))
        })?;

        let counter = cursor.get_u32();

        let mut epoch = [0u8; EPOCH_SIZE];
        cursor.copy_to_slice(&mut epoch);

        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        cursor.copy_to_slice(&mut public_key);

        let mut challenge_echo = [0u8; CHALLENGE_SIZE];
        cursor.copy_to_slice(&mut challenge_echo);

        Ok(Self {
            status,
            counter,
            epoch,
            public_key,
            challenge_echo,
        })
    }
}

/// Запрос на добавление ключа клиента в whitelist автомобиля
#[derive(Debug, Clone)]
pub struct WhitelistRequest {
    /// Публичный ключ клиента
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Запрашиваемая роль
    pub role: KeyRole,
    /// Форм-фактор ключа
    pub form_factor: KeyFormFactor,
}

impl WhitelistRequest {
    const SIZE: usize = PUBLIC_KEY_SIZE + 2;

    /// Создать новый запрос с ролью водителя
    pub fn new(key: &KeyPair) -> Self {
        Self {
            public_key: key.public_bytes(),
            role: KeyRole::Driver,
            form_factor: KeyFormFactor::CloudKey,
        }
    }

    /// Сериализовать в байты
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put(&self.public_key[..]);
        buf.put_u8(self.role as u8);
        buf.put_u8(self.form_factor as u8);
        buf.freeze()
    }

    /// Десериализовать из байтов
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::MalformedPayload(
                "некорректный размер whitelist-запроса".to_string(),
            )
            .into());
        }

        let mut cursor = data;
        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        cursor.copy_to_slice(&mut public_key);

        let role = match cursor.get_u8() {
            1 => KeyRole::Driver,
            other => {
                return Err(ProtocolError::MalformedPayload(format!(
                    "неизвестная роль ключа: {}",
                    other
                ))
                .into())
            }
        };

        let form_factor = match cursor.get_u8() {
            6 => KeyFormFactor::CloudKey,
            other => {
                return Err(ProtocolError::MalformedPayload(format!(
                    "неизвестный форм-фактор ключа: {}",
                    other
                ))
                .into())
            }
        };

        Ok(Self {
            public_key,
            role,
            form_factor,
        })
    }
}

/// Статус авторизации ключа от автомобиля
#[derive(Debug, Clone, Copy)]
pub struct WhitelistStatus {
    /// Вердикт
    pub decision: WhitelistDecision,
}

impl WhitelistStatus {
    /// Сериализовать в байты
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1);
        buf.put_u8(self.decision as u8);
        buf.freeze()
    }

    /// Десериализовать из байтов
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() != 1 {
            return Err(ProtocolError::MalformedPayload(
                "некорректный размер whitelist-статуса".to_string(),
            )
            .into());
        }

        let decision = WhitelistDecision::from_u8(data[0]).ok_or_else(|| {
            ProtocolError::MalformedPayload(format!(
                "неизвестный whitelist-вердикт: {}",
                data[0]
            ))
        })?;

        Ok(Self { decision })
    }
}

/// Уведомление о смене эпохи счётчика
///
/// Новая эпоха принимается только если HMAC проверяется ключом
/// аутентификации *текущей* сессии. Неаутентифицированная смена эпохи
/// позволила бы replay со сброшенным счётчиком.
#[derive(Debug, Clone)]
pub struct EpochChange {
    /// Новая эпоха
    pub epoch: [u8; EPOCH_SIZE],
    /// Начальное значение счётчика новой эпохи
    pub counter: u32,
    /// HMAC-SHA256 под ключом аутентификации текущей сессии
    pub tag: [u8; HMAC_TAG_SIZE],
}

impl EpochChange {
    const SIZE: usize = EPOCH_SIZE + 4 + HMAC_TAG_SIZE;

    /// Создать уведомление с вычисленным HMAC (сторона автомобиля)
    pub fn new(
        domain: Domain,
        epoch: [u8; EPOCH_SIZE],
        counter: u32,
        authentication_key: &[u8; SESSION_KEY_SIZE],
    ) -> Self {
        let tag = crypto::hmac_sha256(
            authentication_key,
            &Self::authenticated_bytes(domain, &epoch, counter),
        );
        Self {
            epoch,
            counter,
            tag,
        }
    }

    /// Проверить HMAC уведомления
    pub fn verify(
        &self,
        domain: Domain,
        authentication_key: &[u8; SESSION_KEY_SIZE],
    ) -> bool {
        crypto::verify_hmac_sha256(
            authentication_key,
            &Self::authenticated_bytes(domain, &self.epoch, self.counter),
            &self.tag,
        )
    }

    fn authenticated_bytes(
        domain: Domain,
        epoch: &[u8; EPOCH_SIZE],
        counter: u32,
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + EPOCH_SIZE + 4);
        data.extend_from_slice(&domain.as_u32().to_be_bytes());
        data.extend_from_slice(epoch);
        data.extend_from_slice(&counter.to_be_bytes());
        data
    }

    /// Сериализовать в байты
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put(&self.epoch[..]);
        buf.put_u32(self.counter);
        buf.put(&self.tag[..]);
        buf.freeze()
    }

    /// Десериализовать из байтов
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::MalformedPayload(
                "некорректный размер уведомления о смене эпохи".to_string(),
            )
            .into());
        }

        let mut cursor = data;
        let mut epoch = [0u8; EPOCH_SIZE];
        cursor.copy_to_slice(&mut epoch);

        let counter = cursor.get_u32();

        let mut tag = [0u8; HMAC_TAG_SIZE];
        cursor.copy_to_slice(&mut tag);

        Ok(Self {
            epoch,
            counter,
            tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_session_info_request_roundtrip() {
        let mut rng = OsRng;
        let key = KeyPair::generate(&mut rng);
        let request = SessionInfoRequest::new(&mut rng, &key);

        let serialized = request.serialize();
        let restored = SessionInfoRequest::deserialize(&serialized).unwrap();

        assert_eq!(restored.public_key, request.public_key);
        assert_eq!(restored.challenge, request.challenge);
    }

    #[test]
    fn test_session_info_roundtrip() {
        let mut rng = OsRng;
        let key = KeyPair::generate(&mut rng);

        let info = SessionInfo {
            status: SessionInfoStatus::Ok,
            counter: 5,
            epoch: [0x21u8; EPOCH_SIZE],
            public_key: key.public_bytes(),
            challenge_echo: [1, 2, 3, 4],
        };

        let serialized = info.serialize();
        let restored = SessionInfo::deserialize(&serialized).unwrap();

        assert_eq!(restored.status, SessionInfoStatus::Ok);
        assert_eq!(restored.counter, 5);
        assert_eq!(restored.epoch, info.epoch);
        assert_eq!(restored.public_key, info.public_key);
        assert_eq!(restored.challenge_echo, info.challenge_echo);
    }

    #[test]
    fn test_session_info_unknown_status() {
        let mut rng = OsRng;
        let key = KeyPair::generate(&mut rng);

        let info = SessionInfo {
            status: SessionInfoStatus::Ok,
            counter: 0,
            epoch: [0u8; EPOCH_SIZE],
            public_key: key.public_bytes(),
            challenge_echo: [0u8; CHALLENGE_SIZE],
        };

        let mut data = info.serialize().to_vec();
        data[0] = 42;
        assert!(SessionInfo::deserialize(&data).is_err());
    }

    #[test]
    fn test_whitelist_request_roundtrip() {
        let mut rng = OsRng;
        let key = KeyPair::generate(&mut rng);
        let request = WhitelistRequest::new(&key);

        let serialized = request.serialize();
        let restored = WhitelistRequest::deserialize(&serialized).unwrap();

        assert_eq!(restored.public_key, request.public_key);
        assert_eq!(restored.role, KeyRole::Driver);
        assert_eq!(restored.form_factor, KeyFormFactor::CloudKey);
    }

    #[test]
    fn test_whitelist_status_roundtrip() {
        for decision in [
            WhitelistDecision::Pending,
            WhitelistDecision::Approved,
            WhitelistDecision::Denied,
        ] {
            let status = WhitelistStatus { decision };
            let restored = WhitelistStatus::deserialize(&status.serialize()).unwrap();
            assert_eq!(restored.decision, decision);
        }

        assert!(WhitelistStatus::deserialize(&[7]).is_err());
        assert!(WhitelistStatus::deserialize(&[]).is_err());
    }

    #[test]
    fn test_epoch_change_hmac() {
        let auth_key = [0x33u8; SESSION_KEY_SIZE];
        let change = EpochChange::new(
            Domain::VehicleSecurity,
            [0x44u8; EPOCH_SIZE],
            0,
            &auth_key,
        );

        assert!(change.verify(Domain::VehicleSecurity, &auth_key));

        // Чужой домен и чужой ключ не проходят
        assert!(!change.verify(Domain::Infotainment, &auth_key));
        assert!(!change.verify(Domain::VehicleSecurity, &[0x55u8; SESSION_KEY_SIZE]));
    }

    #[test]
    fn test_epoch_change_roundtrip() {
        let auth_key = [0x33u8; SESSION_KEY_SIZE];
        let change =
            EpochChange::new(Domain::Infotainment, [0x01u8; EPOCH_SIZE], 100, &auth_key);

        let serialized = change.serialize();
        let restored = EpochChange::deserialize(&serialized).unwrap();

        assert_eq!(restored.epoch, change.epoch);
        assert_eq!(restored.counter, 100);
        assert!(restored.verify(Domain::Infotainment, &auth_key));
    }

    #[test]
    fn test_truncated_messages() {
        assert!(SessionInfoRequest::deserialize(&[0u8; 10]).is_err());
        assert!(SessionInfo::deserialize(&[0u8; 10]).is_err());
        assert!(WhitelistRequest::deserialize(&[0u8; 10]).is_err());
        assert!(EpochChange::deserialize(&[0u8; 10]).is_err());
    }
}
