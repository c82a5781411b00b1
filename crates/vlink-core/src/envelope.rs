//! Формат конверта командного канала
//!
//! Этот модуль определяет внешнюю рамку всех сообщений между клиентом
//! и автомобилем: метаданные маршрутизации и либо подписанный открытый
//! payload (до установления сессии), либо AEAD-шифрованный payload.
//!
//! Формат конверта:
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────┐
//! │ Version (8)  │   Kind (8)   │  Domain (8)  │  Flags (8)   │
//! ├──────────────┴──────────────┴──────────────┴──────────────┤
//! │                       Request ID (32)                     │
//! ├───────────────────────────────────────────────────────────┤
//! │                        Counter (32)                       │
//! ├─────────────────────────────┬─────────────────────────────┤
//! │     Payload Length (16)     │         Epoch (128)         │
//! ├─────────────────────────────┴─────────────────────────────┤
//! │                    Payload (variable)                     │
//! ├───────────────────────────────────────────────────────────┤
//! │ SIGNED:    подпись ECDSA (64 байта)                       │
//! │ ENCRYPTED: Nonce (12) + GCM Tag (16)                      │
//! └───────────────────────────────────────────────────────────┘
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::crypto::{
    self, KeyPair, ECDSA_SIGNATURE_SIZE, EPOCH_SIZE, GCM_NONCE_SIZE, GCM_TAG_SIZE,
};
use crate::error::{ProtocolError, Result};

/// Текущая версия протокола конвертов
pub const PROTOCOL_VERSION: u8 = 1;

/// Размер заголовка конверта
pub const HEADER_SIZE: usize = 30; // 1 + 1 + 1 + 1 + 4 + 4 + 2 + 16

/// Максимальный размер payload одного конверта
pub const MAX_PAYLOAD_SIZE: usize = 8192;

bitflags! {
    /// Флаги конверта
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EnvelopeFlags: u8 {
        /// Открытый payload с подписью ECDSA в трейлере
        const SIGNED    = 0b0000_0001;
        /// AEAD-шифрованный payload, nonce + tag в трейлере
        const ENCRYPTED = 0b0000_0010;
        /// Незапрошенное сообщение от автомобиля (request_id = 0)
        const PUSH      = 0b0000_0100;
    }
}

impl fmt::Display for EnvelopeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flags = Vec::new();
        if self.contains(EnvelopeFlags::SIGNED) {
            flags.push("SIGNED");
        }
        if self.contains(EnvelopeFlags::ENCRYPTED) {
            flags.push("ENCRYPTED");
        }
        if self.contains(EnvelopeFlags::PUSH) {
            flags.push("PUSH");
        }
        write!(f, "{}", flags.join("|"))
    }
}

/// Логический канал команд автомобиля
///
/// Каждый домен — независимая state machine со своим handshake,
/// счётчиком и эпохой. Значения совпадают со слоем маршрутизации
/// прошивки автомобиля.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Domain {
    /// Широковещательный канал (handshake, pairing)
    Broadcast = 0,
    /// Безопасность и доступ (замки, багажник, пробуждение)
    VehicleSecurity = 2,
    /// Информационно-развлекательная система (климат, зарядка)
    Infotainment = 3,
}

impl Domain {
    /// Преобразование из u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Domain::Broadcast),
            2 => Some(Domain::VehicleSecurity),
            3 => Some(Domain::Infotainment),
            _ => None,
        }
    }

    /// Преобразование в u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Значение домена для AAD и nonce
    pub fn as_u32(self) -> u32 {
        self as u8 as u32
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Broadcast => write!(f, "broadcast"),
            Domain::VehicleSecurity => write!(f, "vehicle-security"),
            Domain::Infotainment => write!(f, "infotainment"),
        }
    }
}

/// Тип конверта
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Запрос параметров сессии (клиент → автомобиль)
    SessionInfoRequest = 1,
    /// Параметры сессии (автомобиль → клиент)
    SessionInfo = 2,
    /// Зашифрованная команда
    Command = 3,
    /// Зашифрованный ответ или push
    Response = 4,
    /// Запрос на добавление ключа в whitelist
    WhitelistRequest = 5,
    /// Статус авторизации ключа
    WhitelistStatus = 6,
    /// Уведомление о смене эпохи счётчика
    EpochChange = 7,
}

impl EnvelopeKind {
    /// Преобразование из u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(EnvelopeKind::SessionInfoRequest),
            2 => Some(EnvelopeKind::SessionInfo),
            3 => Some(EnvelopeKind::Command),
            4 => Some(EnvelopeKind::Response),
            5 => Some(EnvelopeKind::WhitelistRequest),
            6 => Some(EnvelopeKind::WhitelistStatus),
            7 => Some(EnvelopeKind::EpochChange),
            _ => None,
        }
    }
}

/// Заголовок конверта
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Версия протокола
    pub version: u8,
    /// Тип конверта
    pub kind: EnvelopeKind,
    /// Домен
    pub domain: Domain,
    /// Флаги
    pub flags: EnvelopeFlags,
    /// Идентификатор запроса (0 для push)
    pub request_id: u32,
    /// Счётчик anti-replay (0 для открытых конвертов)
    pub counter: u32,
    /// Длина payload
    pub payload_length: u16,
    /// Эпоха счётчика (нули для открытых конвертов)
    pub epoch: [u8; EPOCH_SIZE],
}

impl EnvelopeHeader {
    /// Создать новый заголовок
    pub fn new(kind: EnvelopeKind, domain: Domain, request_id: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            domain,
            flags: EnvelopeFlags::empty(),
            request_id,
            counter: 0,
            payload_length: 0,
            epoch: [0u8; EPOCH_SIZE],
        }
    }

    /// Сериализовать заголовок в байты
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.domain.to_u8());
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.request_id);
        buf.put_u32(self.counter);
        buf.put_u16(self.payload_length);
        buf.put(&self.epoch[..]);
    }

    /// Десериализовать заголовок из байтов
    pub fn deserialize(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < HEADER_SIZE {
            return Err(ProtocolError::InsufficientData {
                required: HEADER_SIZE,
                available: buf.remaining(),
            }
            .into());
        }

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version).into());
        }

        let kind_raw = buf.get_u8();
        let kind = EnvelopeKind::from_u8(kind_raw)
            .ok_or(ProtocolError::UnknownKind(kind_raw))?;

        let domain_raw = buf.get_u8();
        let domain = Domain::from_u8(domain_raw)
            .ok_or(ProtocolError::UnknownDomain(domain_raw))?;

        let flags_bits = buf.get_u8();
        let flags = EnvelopeFlags::from_bits(flags_bits)
            .ok_or(ProtocolError::InvalidFlags(flags_bits))?;

        // SIGNED и ENCRYPTED взаимно исключают друг друга
        if flags.contains(EnvelopeFlags::SIGNED | EnvelopeFlags::ENCRYPTED) {
            return Err(ProtocolError::InvalidFlags(flags_bits).into());
        }

        let request_id = buf.get_u32();
        let counter = buf.get_u32();
        let payload_length = buf.get_u16();
        if payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_length as usize,
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }

        let mut epoch = [0u8; EPOCH_SIZE];
        buf.copy_to_slice(&mut epoch);

        Ok(Self {
            version,
            kind,
            domain,
            flags,
            request_id,
            counter,
            payload_length,
            epoch,
        })
    }
}

/// Трейлер конверта
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeTrailer {
    /// Без трейлера (только WhitelistStatus)
    None,
    /// Подпись ECDSA над заголовком и payload
    Signature([u8; ECDSA_SIGNATURE_SIZE]),
    /// Параметры AEAD
    Aead {
        /// Nonce GCM
        nonce: [u8; GCM_NONCE_SIZE],
        /// Auth tag GCM
        tag: [u8; GCM_TAG_SIZE],
    },
}

/// Конверт командного канала
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Заголовок
    pub header: EnvelopeHeader,
    /// Payload (открытый или шифротекст, в зависимости от флагов)
    pub payload: Bytes,
    /// Трейлер
    pub trailer: EnvelopeTrailer,
}

impl Envelope {
    /// Создать открытый конверт без трейлера
    pub fn plaintext(
        kind: EnvelopeKind,
        domain: Domain,
        request_id: u32,
        payload: Bytes,
    ) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }

        let mut header = EnvelopeHeader::new(kind, domain, request_id);
        header.payload_length = payload.len() as u16;

        Ok(Self {
            header,
            payload,
            trailer: EnvelopeTrailer::None,
        })
    }

    /// Подписать конверт локальным ключом
    ///
    /// Подпись покрывает заголовок (с выставленным флагом SIGNED) и payload.
    pub fn sign(&mut self, key: &KeyPair) {
        self.header.flags.insert(EnvelopeFlags::SIGNED);
        let message = self.signed_portion();
        self.trailer = EnvelopeTrailer::Signature(key.sign(&message));
    }

    /// Верифицировать подпись конверта
    pub fn verify_signature(&self, public_key: &[u8]) -> Result<()> {
        let signature = match &self.trailer {
            EnvelopeTrailer::Signature(sig) => sig,
            _ => return Err(crate::error::CryptoError::SignatureVerification.into()),
        };

        let message = self.signed_portion();
        crypto::verify_signature(public_key, &message, signature)
    }

    /// Байты, покрываемые подписью: заголовок + payload
    fn signed_portion(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.header.serialize(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.to_vec()
    }

    /// Общий размер сериализованного конверта
    pub fn total_size(&self) -> usize {
        let trailer = match &self.trailer {
            EnvelopeTrailer::None => 0,
            EnvelopeTrailer::Signature(_) => ECDSA_SIGNATURE_SIZE,
            EnvelopeTrailer::Aead { .. } => GCM_NONCE_SIZE + GCM_TAG_SIZE,
        };
        HEADER_SIZE + self.payload.len() + trailer
    }

    /// Сериализовать конверт в байты
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.total_size());

        let mut header = self.header.clone();
        header.payload_length = self.payload.len() as u16;
        header.serialize(&mut buf);

        buf.put(self.payload.clone());

        match &self.trailer {
            EnvelopeTrailer::None => {}
            EnvelopeTrailer::Signature(sig) => buf.put(&sig[..]),
            EnvelopeTrailer::Aead { nonce, tag } => {
                buf.put(&nonce[..]);
                buf.put(&tag[..]);
            }
        }

        Ok(buf.freeze())
    }

    /// Десериализовать конверт из байтов
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(data);
        let mut cursor = buf.clone();

        let header = EnvelopeHeader::deserialize(&mut cursor)?;

        let trailer_size = if header.flags.contains(EnvelopeFlags::SIGNED) {
            ECDSA_SIGNATURE_SIZE
        } else if header.flags.contains(EnvelopeFlags::ENCRYPTED) {
            GCM_NONCE_SIZE + GCM_TAG_SIZE
        } else {
            0
        };

        let expected = HEADER_SIZE + header.payload_length as usize + trailer_size;
        if data.len() != expected {
            return Err(ProtocolError::InsufficientData {
                required: expected,
                available: data.len(),
            }
            .into());
        }

        buf.advance(HEADER_SIZE);
        let payload = buf.split_to(header.payload_length as usize);

        let trailer = if header.flags.contains(EnvelopeFlags::SIGNED) {
            let mut sig = [0u8; ECDSA_SIGNATURE_SIZE];
            sig.copy_from_slice(&buf[..ECDSA_SIGNATURE_SIZE]);
            EnvelopeTrailer::Signature(sig)
        } else if header.flags.contains(EnvelopeFlags::ENCRYPTED) {
            let mut nonce = [0u8; GCM_NONCE_SIZE];
            nonce.copy_from_slice(&buf[..GCM_NONCE_SIZE]);
            let mut tag = [0u8; GCM_TAG_SIZE];
            tag.copy_from_slice(&buf[GCM_NONCE_SIZE..GCM_NONCE_SIZE + GCM_TAG_SIZE]);
            EnvelopeTrailer::Aead { nonce, tag }
        } else {
            EnvelopeTrailer::None
        };

        Ok(Self {
            header,
            payload,
            trailer,
        })
    }

    /// Проверить, зашифрован ли конверт
    pub fn is_encrypted(&self) -> bool {
        self.header.flags.contains(EnvelopeFlags::ENCRYPTED)
    }

    /// Проверить, подписан ли конверт
    pub fn is_signed(&self) -> bool {
        self.header.flags.contains(EnvelopeFlags::SIGNED)
    }

    /// Проверить, является ли конверт незапрошенным push
    pub fn is_push(&self) -> bool {
        self.header.flags.contains(EnvelopeFlags::PUSH) || self.header.request_id == 0
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope {{ kind: {:?}, domain: {}, request: {}, counter: {}, flags: [{}], payload: {} байт }}",
            self.header.kind,
            self.header.domain,
            self.header.request_id,
            self.header.counter,
            self.header.flags,
            self.payload.len(),
        )
    }
}
