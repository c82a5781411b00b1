//! Типы ошибок для VLink
//!
//! Этот модуль содержит все возможные типы ошибок, которые могут возникнуть
//! при работе с командным каналом автомобиля.

use thiserror::Error;

use crate::envelope::Domain;

/// Основной тип ошибок VLink
#[derive(Error, Debug)]
pub enum VlinkError {
    /// Ошибка криптографических операций
    #[error("Криптографическая ошибка: {0}")]
    Crypto(#[from] CryptoError),

    /// Ошибка разбора/сборки протокольных сообщений
    #[error("Протокольная ошибка: {0}")]
    Protocol(#[from] ProtocolError),

    /// Ошибка состояния сессии
    #[error("Ошибка сессии: {0}")]
    Session(#[from] SessionError),

    /// Ошибка транспортного соединения
    #[error("Ошибка соединения: {0}")]
    Connection(#[from] ConnectionError),

    /// Ошибка процедуры добавления ключа (pairing)
    #[error("Ошибка авторизации ключа: {0}")]
    Pairing(#[from] PairingError),

    /// Ошибка ввода-вывода
    #[error("Ошибка I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Общая ошибка
    #[error("Общая ошибка: {0}")]
    Other(String),
}

/// Ошибки криптографических операций
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Сбой источника энтропии при генерации ключа (фатально)
    #[error("Сбой генерации ключевой пары: {0}")]
    EntropyFailure(String),

    /// Некорректный размер ключа
    #[error("Некорректный размер ключа: ожидается {expected}, получено {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    /// Публичная точка не лежит на кривой или является нейтральным элементом
    #[error("Недопустимый публичный ключ партнёра (точка вне кривой)")]
    InvalidPeerKey,

    /// Ошибка деривации ключа (HKDF)
    #[error("Ошибка деривации ключа HKDF: {0}")]
    KeyDerivation(String),

    /// Ошибка аутентификации (неверный GCM tag)
    #[error("Ошибка аутентификации: неверный auth tag")]
    AuthenticationFailed,

    /// Счётчик не больше последнего принятого (replay)
    #[error("Replay отклонён: счётчик {received} не больше последнего принятого {last}")]
    ReplayRejected { received: u32, last: u32 },

    /// Ошибка создания подписи ECDSA
    #[error("Ошибка создания подписи ECDSA")]
    Signature,

    /// Подпись недействительна
    #[error("Ошибка верификации подписи: подпись недействительна")]
    SignatureVerification,

    /// Переполнение счётчика (требуется новый handshake)
    #[error("Переполнение счётчика сообщений: требуется новый handshake")]
    CounterExhausted,
}

/// Ошибки разбора и сборки конвертов
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Неподдерживаемая версия протокола
    #[error("Неподдерживаемая версия протокола: {0}")]
    UnsupportedVersion(u8),

    /// Неизвестный тип конверта
    #[error("Неизвестный тип конверта: {0}")]
    UnknownKind(u8),

    /// Неизвестный домен
    #[error("Неизвестный домен: {0}")]
    UnknownDomain(u8),

    /// Некорректные флаги конверта
    #[error("Некорректные флаги конверта: {0:08b}")]
    InvalidFlags(u8),

    /// Недостаточно данных для парсинга
    #[error("Недостаточно данных: требуется {required}, доступно {available}")]
    InsufficientData { required: usize, available: usize },

    /// Превышен максимальный размер payload
    #[error("Превышен максимальный размер payload: {size} > {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Сообщение не собрано до истечения тайм-аута реассемблирования
    #[error("Неполное сообщение: собрано {received} фрагментов, финальный не получен")]
    IncompleteMessage { received: usize },

    /// Превышены границы буфера реассемблирования
    #[error("Переполнение буфера реассемблирования: {size} > {max}")]
    ReassemblyOverflow { size: usize, max: usize },

    /// Некорректная последовательность фрагментов
    #[error("Некорректная последовательность фрагментов: индекс {index}")]
    InvalidFragmentSequence { index: u16 },

    /// Некорректное содержимое типизированного payload
    #[error("Некорректный payload: {0}")]
    MalformedPayload(String),
}

/// Ошибки управления сессией
#[derive(Error, Debug)]
pub enum SessionError {
    /// Операция требует аутентифицированной сессии
    #[error("Сессия домена {domain} не аутентифицирована")]
    NotAuthenticated { domain: Domain },

    /// Сессия в аварийном состоянии и должна быть пересоздана
    #[error("Сессия домена {domain} в состоянии Faulted, требуется новый handshake")]
    Faulted { domain: Domain },

    /// Исчерпаны попытки handshake
    #[error("Тайм-аут handshake для домена {domain}: исчерпано {attempts} попыток")]
    HandshakeTimeout { domain: Domain, attempts: u32 },

    /// Публичный ключ автомобиля не совпадает с закреплённым
    #[error("Публичный ключ автомобиля не совпадает с сохранённым")]
    PeerKeyMismatch,

    /// Смена эпохи без аутентифицированного подтверждения
    #[error("Смена эпохи для домена {domain} отклонена: нет аутентифицированного подтверждения")]
    EpochRejected { domain: Domain },

    /// Автомобиль сообщил об ошибке сессии
    #[error("Автомобиль отклонил запрос сессии для домена {domain}: статус {status}")]
    RejectedByVehicle { domain: Domain, status: u8 },

    /// Эхо challenge в ответе не совпало с отправленным
    #[error("Эхо challenge для домена {domain} не совпало с отправленным")]
    ChallengeMismatch { domain: Domain },
}

/// Ошибки транспортного соединения
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Не удалось установить соединение
    #[error("Не удалось подключиться к {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    /// Соединение потеряно, ожидающие запросы завершены досрочно
    #[error("Соединение с автомобилем потеряно")]
    ConnectionLost,

    /// Ошибка записи в характеристику
    #[error("Ошибка записи в транспорт: {0}")]
    WriteFailed(String),

    /// Запрос не получил ответа в отведённое время
    #[error("Тайм-аут запроса: {timeout_ms} мс")]
    Timeout { timeout_ms: u64 },

    /// Операция отменена (остановка интеграции)
    #[error("Операция отменена")]
    Cancelled,

    /// Нет активного соединения
    #[error("Нет активного соединения")]
    NotConnected,
}

/// Ошибки процедуры авторизации нового ключа
#[derive(Error, Debug)]
pub enum PairingError {
    /// Автомобиль ещё не подтвердил ключ (ожидается физическое подтверждение)
    #[error("Ожидается подтверждение ключа на автомобиле")]
    AuthorizationPending,

    /// Пользователь отклонил ключ
    #[error("Ключ отклонён пользователем автомобиля")]
    AuthorizationDenied,
}

/// Псевдоним для Result с ошибкой VLink
pub type Result<T> = std::result::Result<T, VlinkError>;

impl From<&str> for VlinkError {
    fn from(s: &str) -> Self {
        VlinkError::Other(s.to_string())
    }
}

impl From<String> for VlinkError {
    fn from(s: String) -> Self {
        VlinkError::Other(s)
    }
}
