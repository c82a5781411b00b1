//! # VLink Core (vlink-core)
//!
//! Ядро защищённого командного канала с автомобилем поверх ненадёжного
//! BLE-линка.
//!
//! ## Возможности
//!
//! - **Криптография**: NIST P-256 (обмен ключами и подписи), AES-128-GCM
//!   (шифрование команд), HKDF-SHA256 (деривация ключей), HMAC-SHA256
//!   (управляющие уведомления)
//! - **Сессии**: независимая state machine на каждый домен автомобиля,
//!   монотонные anti-replay счётчики, эпохи с аутентифицированной сменой
//! - **Конверты**: бинарный формат с подписанным либо шифрованным payload
//!   и фрагментацией под MTU транспорта
//! - **Надёжность**: зачистка зависших соединений, переподключение с
//!   backoff и джиттером, сериализация записей, keep-alive политика
//! - **Безопасность**: Zeroize для ключевого материала; мусор с линка —
//!   всегда восстановимая ошибка, не паника
//!
//! ## Структура
//!
//! - [`crypto`]: криптографические примитивы
//! - [`envelope`]: формат конверта и домены
//! - [`fragment`]: фрагментация и реассемблирование
//! - [`handshake`]: сообщения установления сессии и pairing
//! - [`command`]: словарь команд и ответов автомобиля
//! - [`session`]: криптографическое состояние домена
//! - [`manager`]: оркестрация сессий и мультиплексирование запросов
//! - [`supervisor`]: надёжность транспортного соединения
//! - [`transport`]: абстракция транспорта
//! - [`error`]: типы ошибок
//!
//! ## Пример использования
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vlink_core::{
//!     crypto::KeyPair,
//!     command::VehicleCommand,
//!     manager::{SessionConfig, VehicleSession},
//!     supervisor::SupervisorConfig,
//!     transport::Transport,
//! };
//!
//! # async fn example(transport: Arc<dyn Transport>) -> vlink_core::Result<()> {
//! let mut rng = rand::rngs::OsRng;
//! let key = KeyPair::generate(&mut rng);
//!
//! let session = VehicleSession::new(
//!     transport,
//!     key,
//!     None,
//!     SessionConfig::default(),
//!     SupervisorConfig::default(),
//! );
//!
//! session.start().await?;
//! let _response = session
//!     .send(VehicleCommand::Unlock, Duration::from_secs(30))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod fragment;
pub mod handshake;
pub mod manager;
pub mod session;
pub mod supervisor;
pub mod transport;

// Re-экспорт основных типов для удобства
pub use command::{CommandResult, VehicleCommand, VehicleMessage};
pub use envelope::{Domain, Envelope, EnvelopeKind};
pub use error::{Result, VlinkError};
pub use manager::{SessionConfig, VehicleSession};
pub use supervisor::{ConnectionState, KeepAlivePolicy, SupervisorConfig};
pub use transport::Transport;

/// Версия библиотеки
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Версия протокола конвертов
pub const PROTOCOL_VERSION: u8 = envelope::PROTOCOL_VERSION;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VERSION, 1);
    }
}
