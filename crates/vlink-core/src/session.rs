//! Состояние криптографической сессии одного домена
//!
//! Каждый домен автомобиля (безопасность, инфотейнмент) ведёт
//! независимую state machine:
//!
//! ```text
//! Uninitialized → AwaitingSessionInfo → Authenticated
//!        ↑                                   │
//!        └────────── invalidate ─────────────┤
//!                                         Faulted (поглощающее)
//! ```
//!
//! Инварианты:
//! - счётчик строго растёт при каждой отправке в пределах эпохи и
//!   никогда не откатывается, даже при неудачной отправке;
//! - входящий счётчик обязан быть строго больше последнего принятого,
//!   иначе сообщение отбрасывается без изменения состояния;
//! - смена эпохи принимается только из верифицированного SESSION_INFO
//!   или из EPOCH_CHANGE с корректным HMAC под текущим ключом;
//! - ошибка auth tag переводит сессию в Faulted, восстановление — только
//!   полный новый handshake.

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::crypto::{
    self, KeyPair, SessionKeys, SharedSecret, EPOCH_SIZE, KEY_ID_SIZE,
    PUBLIC_KEY_SIZE,
};
use crate::envelope::{
    Domain, Envelope, EnvelopeFlags, EnvelopeKind, EnvelopeTrailer,
};
use crate::error::{CryptoError, Result, SessionError};
use crate::handshake::{EpochChange, SessionInfo, SessionInfoStatus};

/// Фаза сессии домена
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Сессии нет, handshake не начат
    Uninitialized,
    /// Отправлен запрос сессии, ожидается ответ автомобиля
    AwaitingSessionInfo,
    /// Сессия установлена, команды шифруются
    Authenticated,
    /// Невосстановимая ошибка, требуется полный новый handshake
    Faulted,
}

/// Сессия одного домена автомобиля
pub struct DomainSession {
    domain: Domain,
    phase: SessionPhase,
    /// Последний использованный/принятый счётчик текущей эпохи
    counter: u32,
    epoch: [u8; EPOCH_SIZE],
    /// Общий секрет ECDH; живёт только внутри сессии
    shared: Option<SharedSecret>,
    keys: Option<SessionKeys>,
    /// Закреплённый публичный ключ автомобиля
    vehicle_public_key: Option<[u8; PUBLIC_KEY_SIZE]>,
    local_key_id: Option<[u8; KEY_ID_SIZE]>,
    vehicle_key_id: Option<[u8; KEY_ID_SIZE]>,
    /// Challenge активного handshake
    pending_challenge: Option<[u8; crypto::CHALLENGE_SIZE]>,
}

impl DomainSession {
    /// Создать сессию без известного ключа автомобиля
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            phase: SessionPhase::Uninitialized,
            counter: 0,
            epoch: [0u8; EPOCH_SIZE],
            shared: None,
            keys: None,
            vehicle_public_key: None,
            local_key_id: None,
            vehicle_key_id: None,
            pending_challenge: None,
        }
    }

    /// Создать сессию с закреплённым ключом автомобиля
    pub fn with_pinned_peer(domain: Domain, vehicle_public_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        let mut session = Self::new(domain);
        session.vehicle_public_key = Some(vehicle_public_key);
        session
    }

    /// Домен сессии
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Текущая фаза
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Установлена ли сессия
    pub fn is_authenticated(&self) -> bool {
        self.phase == SessionPhase::Authenticated && self.keys.is_some()
    }

    /// Последний использованный счётчик
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Текущая эпоха
    pub fn epoch(&self) -> [u8; EPOCH_SIZE] {
        self.epoch
    }

    /// Закреплённый ключ автомобиля (если известен)
    pub fn vehicle_public_key(&self) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        self.vehicle_public_key
    }

    /// Сессионные ключи (для аутентификации управляющих уведомлений)
    pub fn keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    /// Начать handshake: зафиксировать challenge и перейти в ожидание
    pub fn begin_handshake(&mut self, challenge: [u8; crypto::CHALLENGE_SIZE]) {
        self.pending_challenge = Some(challenge);
        self.phase = SessionPhase::AwaitingSessionInfo;
    }

    /// Сбросить сессию в начальное состояние
    ///
    /// Закреплённый ключ автомобиля сохраняется: он — часть идентичности,
    /// а не сессии.
    pub fn invalidate(&mut self) {
        info!("Сброс сессии домена {}", self.domain);
        self.phase = SessionPhase::Uninitialized;
        self.counter = 0;
        self.epoch = [0u8; EPOCH_SIZE];
        self.shared = None;
        self.keys = None;
        self.pending_challenge = None;
    }

    /// Перевести сессию в аварийное состояние
    pub fn fault(&mut self) {
        warn!("Сессия домена {} переведена в Faulted", self.domain);
        self.phase = SessionPhase::Faulted;
        self.shared = None;
        self.keys = None;
        self.pending_challenge = None;
    }

    /// Применить верифицированный SESSION_INFO и установить сессию
    ///
    /// Подпись конверта должна быть проверена вызывающей стороной до
    /// вызова; здесь проверяются эхо challenge, закреплённый ключ и
    /// выводятся сессионные ключи.
    pub fn apply_session_info(
        &mut self,
        local_key: &KeyPair,
        info: &SessionInfo,
    ) -> Result<()> {
        if self.phase != SessionPhase::AwaitingSessionInfo {
            return Err(SessionError::NotAuthenticated {
                domain: self.domain,
            }
            .into());
        }

        match self.pending_challenge {
            Some(challenge) if challenge == info.challenge_echo => {}
            _ => {
                return Err(SessionError::ChallengeMismatch {
                    domain: self.domain,
                }
                .into())
            }
        }

        if info.status != SessionInfoStatus::Ok {
            self.invalidate();
            return Err(SessionError::RejectedByVehicle {
                domain: self.domain,
                status: info.status as u8,
            }
            .into());
        }

        // Ключ автомобиля неизменен после первого handshake
        if let Some(pinned) = self.vehicle_public_key {
            if pinned != info.public_key {
                self.fault();
                return Err(SessionError::PeerKeyMismatch.into());
            }
        }

        let shared = local_key.diffie_hellman(&info.public_key)?;

        let local_id = local_key.key_id();
        let vehicle_id = crypto::derive_key_id(&info.public_key);
        let keys = shared.derive_session_keys(&info.epoch, &local_id, &vehicle_id)?;

        self.vehicle_public_key = Some(info.public_key);
        self.local_key_id = Some(local_id);
        self.vehicle_key_id = Some(vehicle_id);
        self.shared = Some(shared);
        self.keys = Some(keys);
        self.counter = info.counter;
        self.epoch = info.epoch;
        self.pending_challenge = None;
        self.phase = SessionPhase::Authenticated;

        info!(
            "Сессия домена {} установлена, счётчик {}",
            self.domain, self.counter
        );

        Ok(())
    }

    /// Зашифровать payload в конверт
    ///
    /// Счётчик инкрементируется до шифрования и не откатывается при
    /// ошибке: представления клиента и автомобиля обязаны оставаться
    /// монотонно согласованными даже через неудачные попытки.
    pub fn seal_envelope(
        &mut self,
        kind: EnvelopeKind,
        request_id: u32,
        plaintext: &[u8],
    ) -> Result<Envelope> {
        let keys = match (&self.phase, &self.keys) {
            (SessionPhase::Authenticated, Some(keys)) => keys.clone(),
            (SessionPhase::Faulted, _) => {
                return Err(SessionError::Faulted {
                    domain: self.domain,
                }
                .into())
            }
            _ => {
                return Err(SessionError::NotAuthenticated {
                    domain: self.domain,
                }
                .into())
            }
        };

        self.counter = match self.counter.checked_add(1) {
            Some(counter) => counter,
            None => {
                self.fault();
                return Err(CryptoError::CounterExhausted.into());
            }
        };

        let nonce = crypto::build_nonce(self.domain.as_u32(), self.counter);
        let aad = crypto::build_aad(self.domain.as_u32(), self.counter, &self.epoch);
        let (ciphertext, tag) = crypto::seal(keys.encryption(), &nonce, plaintext, &aad)?;

        let mut envelope = Envelope::plaintext(
            kind,
            self.domain,
            request_id,
            Bytes::from(ciphertext),
        )?;
        envelope.header.flags = EnvelopeFlags::ENCRYPTED;
        envelope.header.counter = self.counter;
        envelope.header.epoch = self.epoch;
        envelope.trailer = EnvelopeTrailer::Aead { nonce, tag };

        debug!(
            "Зашифрован конверт домена {}, счётчик {}",
            self.domain, self.counter
        );

        Ok(envelope)
    }

    /// Расшифровать и верифицировать входящий конверт
    ///
    /// Счётчик не больше последнего принятого отклоняется как replay без
    /// изменения состояния. Ошибка auth tag переводит сессию в Faulted.
    pub fn open_envelope(&mut self, envelope: &Envelope) -> Result<Bytes> {
        let keys = match (&self.phase, &self.keys) {
            (SessionPhase::Authenticated, Some(keys)) => keys.clone(),
            (SessionPhase::Faulted, _) => {
                return Err(SessionError::Faulted {
                    domain: self.domain,
                }
                .into())
            }
            _ => {
                return Err(SessionError::NotAuthenticated {
                    domain: self.domain,
                }
                .into())
            }
        };

        let (nonce, tag) = match &envelope.trailer {
            EnvelopeTrailer::Aead { nonce, tag } => (nonce, tag),
            _ => {
                return Err(crate::error::ProtocolError::MalformedPayload(
                    "зашифрованный конверт без AEAD трейлера".to_string(),
                )
                .into())
            }
        };

        // Смена эпохи допустима только через аутентифицированный путь
        if envelope.header.epoch != self.epoch {
            self.fault();
            return Err(SessionError::EpochRejected {
                domain: self.domain,
            }
            .into());
        }

        // Anti-replay: строго больше последнего принятого
        if envelope.header.counter <= self.counter {
            return Err(CryptoError::ReplayRejected {
                received: envelope.header.counter,
                last: self.counter,
            }
            .into());
        }

        let aad = crypto::build_aad(
            self.domain.as_u32(),
            envelope.header.counter,
            &self.epoch,
        );

        let plaintext = match crypto::open(
            keys.encryption(),
            nonce,
            &envelope.payload,
            tag,
            &aad,
        ) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                self.fault();
                return Err(err);
            }
        };

        self.counter = self.counter.max(envelope.header.counter);

        Ok(Bytes::from(plaintext))
    }

    /// Применить уведомление о смене эпохи
    ///
    /// HMAC обязан сходиться под ключом аутентификации текущей сессии,
    /// иначе сессия переводится в Faulted: неаутентифицированный сброс
    /// счётчика открыл бы replay-атаку.
    pub fn apply_epoch_change(&mut self, change: &EpochChange) -> Result<()> {
        let verified = match (&self.phase, &self.keys) {
            (SessionPhase::Authenticated, Some(keys)) => {
                change.verify(self.domain, keys.authentication())
            }
            _ => {
                return Err(SessionError::NotAuthenticated {
                    domain: self.domain,
                }
                .into())
            }
        };

        if !verified {
            self.fault();
            return Err(SessionError::EpochRejected {
                domain: self.domain,
            }
            .into());
        }

        let keys = match (&self.shared, &self.local_key_id, &self.vehicle_key_id) {
            (Some(shared), Some(local_id), Some(vehicle_id)) => {
                shared.derive_session_keys(&change.epoch, local_id, vehicle_id)?
            }
            _ => {
                return Err(SessionError::NotAuthenticated {
                    domain: self.domain,
                }
                .into())
            }
        };

        self.keys = Some(keys);
        self.epoch = change.epoch;
        self.counter = change.counter;

        info!(
            "Эпоха домена {} обновлена, счётчик сброшен на {}",
            self.domain, self.counter
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::SessionInfoStatus;
    use rand::rngs::OsRng;

    fn establish(
        session: &mut DomainSession,
        local: &KeyPair,
        vehicle: &KeyPair,
        counter: u32,
        epoch: [u8; EPOCH_SIZE],
    ) {
        let challenge = [9, 9, 9, 9];
        session.begin_handshake(challenge);

        let info = SessionInfo {
            status: SessionInfoStatus::Ok,
            counter,
            epoch,
            public_key: vehicle.public_bytes(),
            challenge_echo: challenge,
        };
        session.apply_session_info(local, &info).unwrap();
    }

    /// Сессионные ключи со стороны автомобиля
    fn vehicle_keys(
        local: &KeyPair,
        vehicle: &KeyPair,
        epoch: &[u8; EPOCH_SIZE],
    ) -> SessionKeys {
        vehicle
            .diffie_hellman(&local.public_bytes())
            .unwrap()
            .derive_session_keys(
                epoch,
                &local.key_id(),
                &vehicle.key_id(),
            )
            .unwrap()
    }

    /// Зашифровать конверт со стороны автомобиля
    fn vehicle_envelope(
        keys: &SessionKeys,
        domain: Domain,
        counter: u32,
        epoch: [u8; EPOCH_SIZE],
        plaintext: &[u8],
    ) -> Envelope {
        let nonce = crypto::build_nonce(domain.as_u32(), counter);
        let aad = crypto::build_aad(domain.as_u32(), counter, &epoch);
        let (ciphertext, tag) =
            crypto::seal(keys.encryption(), &nonce, plaintext, &aad).unwrap();

        let mut envelope = Envelope::plaintext(
            EnvelopeKind::Response,
            domain,
            0,
            Bytes::from(ciphertext),
        )
        .unwrap();
        envelope.header.flags = EnvelopeFlags::ENCRYPTED | EnvelopeFlags::PUSH;
        envelope.header.counter = counter;
        envelope.header.epoch = epoch;
        envelope.trailer = EnvelopeTrailer::Aead { nonce, tag };
        envelope
    }

    #[test]
    fn test_handshake_establishes_session() {
        let mut rng = OsRng;
        let local = KeyPair::generate(&mut rng);
        let vehicle = KeyPair::generate(&mut rng);

        let mut session = DomainSession::new(Domain::VehicleSecurity);
        assert_eq!(session.phase(), SessionPhase::Uninitialized);

        establish(&mut session, &local, &vehicle, 5, [0x10u8; EPOCH_SIZE]);

        assert!(session.is_authenticated());
        assert_eq!(session.counter(), 5);
    }

    #[test]
    fn test_challenge_echo_mismatch() {
        let mut rng = OsRng;
        let local = KeyPair::generate(&mut rng);
        let vehicle = KeyPair::generate(&mut rng);

        let mut session = DomainSession::new(Domain::VehicleSecurity);
        session.begin_handshake([1, 2, 3, 4]);

        let info = SessionInfo {
            status: SessionInfoStatus::Ok,
            counter: 0,
            epoch: [0u8; EPOCH_SIZE],
            public_key: vehicle.public_bytes(),
            challenge_echo: [4, 3, 2, 1],
        };

        assert!(session.apply_session_info(&local, &info).is_err());
        assert!(!session.is_authenticated());
    }

    #[test]
    fn test_key_not_whitelisted() {
        let mut rng = OsRng;
        let local = KeyPair::generate(&mut rng);
        let vehicle = KeyPair::generate(&mut rng);

        let mut session = DomainSession::new(Domain::VehicleSecurity);
        let challenge = [1, 1, 1, 1];
        session.begin_handshake(challenge);

        let info = SessionInfo {
            status: SessionInfoStatus::KeyNotWhitelisted,
            counter: 0,
            epoch: [0u8; EPOCH_SIZE],
            public_key: vehicle.public_bytes(),
            challenge_echo: challenge,
        };

        let err = session.apply_session_info(&local, &info);
        assert!(err.is_err());
        assert_eq!(session.phase(), SessionPhase::Uninitialized);
    }

    #[test]
    fn test_pinned_peer_mismatch_faults() {
        let mut rng = OsRng;
        let local = KeyPair::generate(&mut rng);
        let vehicle = KeyPair::generate(&mut rng);
        let impostor = KeyPair::generate(&mut rng);

        let mut session = DomainSession::with_pinned_peer(
            Domain::VehicleSecurity,
            vehicle.public_bytes(),
        );
        let challenge = [2, 2, 2, 2];
        session.begin_handshake(challenge);

        let info = SessionInfo {
            status: SessionInfoStatus::Ok,
            counter: 0,
            epoch: [0u8; EPOCH_SIZE],
            public_key: impostor.public_bytes(),
            challenge_echo: challenge,
        };

        assert!(session.apply_session_info(&local, &info).is_err());
        assert_eq!(session.phase(), SessionPhase::Faulted);
    }

    #[test]
    fn test_counter_monotonic_across_sends() {
        let mut rng = OsRng;
        let local = KeyPair::generate(&mut rng);
        let vehicle = KeyPair::generate(&mut rng);

        let mut session = DomainSession::new(Domain::VehicleSecurity);
        establish(&mut session, &local, &vehicle, 5, [0x10u8; EPOCH_SIZE]);

        let envelope1 = session
            .seal_envelope(EnvelopeKind::Command, 1, b"wake")
            .unwrap();
        assert_eq!(envelope1.header.counter, 6);

        let envelope2 = session
            .seal_envelope(EnvelopeKind::Command, 2, b"unlock")
            .unwrap();
        assert_eq!(envelope2.header.counter, 7);
    }

    #[test]
    fn test_roundtrip_with_vehicle_keys() {
        let mut rng = OsRng;
        let local = KeyPair::generate(&mut rng);
        let vehicle = KeyPair::generate(&mut rng);
        let epoch = [0x42u8; EPOCH_SIZE];

        let mut session = DomainSession::new(Domain::Infotainment);
        establish(&mut session, &local, &vehicle, 0, epoch);

        let keys = vehicle_keys(&local, &vehicle, &epoch);

        // Автомобиль присылает сообщение со счётчиком 1
        let envelope =
            vehicle_envelope(&keys, Domain::Infotainment, 1, epoch, b"charge state");
        let plaintext = session.open_envelope(&envelope).unwrap();
        assert_eq!(&plaintext[..], b"charge state");
        assert_eq!(session.counter(), 1);
    }

    #[test]
    fn test_replay_rejected_without_mutation() {
        let mut rng = OsRng;
        let local = KeyPair::generate(&mut rng);
        let vehicle = KeyPair::generate(&mut rng);
        let epoch = [0x42u8; EPOCH_SIZE];

        let mut session = DomainSession::new(Domain::VehicleSecurity);
        establish(&mut session, &local, &vehicle, 6, epoch);

        let keys = vehicle_keys(&local, &vehicle, &epoch);

        // Счётчик 4 меньше последнего принятого 6
        let stale =
            vehicle_envelope(&keys, Domain::VehicleSecurity, 4, epoch, b"stale");
        let err = session.open_envelope(&stale).unwrap_err();
        assert!(matches!(
            err,
            crate::error::VlinkError::Crypto(CryptoError::ReplayRejected {
                received: 4,
                last: 6
            })
        ));

        // Состояние не изменилось, сессия жива
        assert_eq!(session.counter(), 6);
        assert!(session.is_authenticated());

        // Счётчик 7 принимается
        let fresh =
            vehicle_envelope(&keys, Domain::VehicleSecurity, 7, epoch, b"fresh");
        assert!(session.open_envelope(&fresh).is_ok());
        assert_eq!(session.counter(), 7);
    }

    #[test]
    fn test_bad_tag_faults_session() {
        let mut rng = OsRng;
        let local = KeyPair::generate(&mut rng);
        let vehicle = KeyPair::generate(&mut rng);
        let epoch = [0x42u8; EPOCH_SIZE];

        let mut session = DomainSession::new(Domain::VehicleSecurity);
        establish(&mut session, &local, &vehicle, 0, epoch);

        let keys = vehicle_keys(&local, &vehicle, &epoch);
        let mut envelope =
            vehicle_envelope(&keys, Domain::VehicleSecurity, 1, epoch, b"data");

        // Портим tag
        if let EnvelopeTrailer::Aead { nonce, mut tag } = envelope.trailer {
            tag[0] ^= 0xFF;
            envelope.trailer = EnvelopeTrailer::Aead { nonce, tag };
        }

        assert!(session.open_envelope(&envelope).is_err());
        assert_eq!(session.phase(), SessionPhase::Faulted);

        // Faulted сессия не шифрует
        assert!(session
            .seal_envelope(EnvelopeKind::Command, 1, b"cmd")
            .is_err());
    }

    #[test]
    fn test_unauthenticated_epoch_change_faults() {
        let mut rng = OsRng;
        let local = KeyPair::generate(&mut rng);
        let vehicle = KeyPair::generate(&mut rng);
        let epoch = [0x42u8; EPOCH_SIZE];

        let mut session = DomainSession::new(Domain::VehicleSecurity);
        establish(&mut session, &local, &vehicle, 3, epoch);

        // Уведомление под чужим ключом
        let change = EpochChange::new(
            Domain::VehicleSecurity,
            [0x99u8; EPOCH_SIZE],
            0,
            &[0xAAu8; crypto::SESSION_KEY_SIZE],
        );

        assert!(session.apply_epoch_change(&change).is_err());
        assert_eq!(session.phase(), SessionPhase::Faulted);
    }

    #[test]
    fn test_authenticated_epoch_change_resets_counter() {
        let mut rng = OsRng;
        let local = KeyPair::generate(&mut rng);
        let vehicle = KeyPair::generate(&mut rng);
        let epoch = [0x42u8; EPOCH_SIZE];

        let mut session = DomainSession::new(Domain::VehicleSecurity);
        establish(&mut session, &local, &vehicle, 100, epoch);

        let keys = vehicle_keys(&local, &vehicle, &epoch);
        let new_epoch = [0x43u8; EPOCH_SIZE];
        let change = EpochChange::new(
            Domain::VehicleSecurity,
            new_epoch,
            0,
            keys.authentication(),
        );

        session.apply_epoch_change(&change).unwrap();
        assert_eq!(session.counter(), 0);
        assert_eq!(session.epoch(), new_epoch);
        assert!(session.is_authenticated());

        // Новая эпоха — новые ключи
        let new_keys = vehicle_keys(&local, &vehicle, &new_epoch);
        let envelope =
            vehicle_envelope(&new_keys, Domain::VehicleSecurity, 1, new_epoch, b"ok");
        assert!(session.open_envelope(&envelope).is_ok());
    }

    #[test]
    fn test_mismatched_epoch_on_message_faults() {
        let mut rng = OsRng;
        let local = KeyPair::generate(&mut rng);
        let vehicle = KeyPair::generate(&mut rng);
        let epoch = [0x42u8; EPOCH_SIZE];

        let mut session = DomainSession::new(Domain::VehicleSecurity);
        establish(&mut session, &local, &vehicle, 0, epoch);

        let other_epoch = [0x43u8; EPOCH_SIZE];
        let keys = vehicle_keys(&local, &vehicle, &other_epoch);
        let envelope =
            vehicle_envelope(&keys, Domain::VehicleSecurity, 1, other_epoch, b"data");

        assert!(session.open_envelope(&envelope).is_err());
        assert_eq!(session.phase(), SessionPhase::Faulted);
    }

    #[test]
    fn test_invalidate_keeps_pinned_peer() {
        let mut rng = OsRng;
        let local = KeyPair::generate(&mut rng);
        let vehicle = KeyPair::generate(&mut rng);

        let mut session = DomainSession::new(Domain::VehicleSecurity);
        establish(&mut session, &local, &vehicle, 0, [0x01u8; EPOCH_SIZE]);

        session.invalidate();
        assert_eq!(session.phase(), SessionPhase::Uninitialized);
        assert_eq!(
            session.vehicle_public_key(),
            Some(vehicle.public_bytes())
        );
    }

    #[test]
    fn test_seal_requires_authentication() {
        let mut session = DomainSession::new(Domain::VehicleSecurity);
        assert!(session
            .seal_envelope(EnvelopeKind::Command, 1, b"cmd")
            .is_err());
    }
}
