//! Конфигурация клиента VLink
//!
//! Этот модуль отвечает за загрузку и валидацию конфигурации клиента.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use vlink_core::fragment::ReassemblyLimits;
use vlink_core::manager::SessionConfig;
use vlink_core::supervisor::{KeepAlivePolicy, SupervisorConfig};

/// Конфигурация клиента VLink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Настройки автомобиля
    pub vehicle: VehicleConfig,

    /// Настройки соединения
    pub connection: ConnectionConfig,

    /// Настройки сессионного слоя
    pub session: SessionSettings,

    /// Настройки логирования
    pub logging: LoggingConfig,
}

/// Настройки автомобиля
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleConfig {
    /// BLE адрес автомобиля
    pub address: String,

    /// Человекочитаемое имя (опционально)
    pub name: Option<String>,

    /// Каталог с ключами клиента
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,
}

/// Настройки соединения
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Тайм-аут одной попытки подключения (секунды)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Попытки подключения
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Базовая задержка backoff (миллисекунды)
    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,

    /// Потолок backoff (секунды)
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Политика удержания: "persistent" или "on_demand"
    #[serde(default = "default_keep_alive")]
    pub keep_alive: String,

    /// Пауза неактивности до закрытия on-demand соединения (секунды)
    #[serde(default = "default_idle_grace")]
    pub idle_grace_secs: u64,

    /// Период проверки keep-alive (секунды)
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_secs: u64,
}

/// Настройки сессионного слоя
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Тайм-аут команды (секунды)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Тайм-аут одной попытки handshake (секунды)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Попытки handshake
    #[serde(default = "default_handshake_attempts")]
    pub handshake_attempts: u32,

    /// Тайм-аут реассемблирования фрагментов (секунды)
    #[serde(default = "default_reassembly_timeout")]
    pub reassembly_timeout_secs: u64,
}

/// Настройки логирования
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Уровень логирования (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Значения по умолчанию
fn default_keys_dir() -> PathBuf {
    PathBuf::from("keys")
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_base_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30
}

fn default_keep_alive() -> String {
    "persistent".to_string()
}

fn default_idle_grace() -> u64 {
    60
}

fn default_keep_alive_interval() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
    5
}

fn default_handshake_attempts() -> u32 {
    3
}

fn default_reassembly_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            vehicle: VehicleConfig::default(),
            connection: ConnectionConfig::default(),
            session: SessionSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            name: None,
            keys_dir: default_keys_dir(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            connect_attempts: default_connect_attempts(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_secs: default_max_backoff(),
            keep_alive: default_keep_alive(),
            idle_grace_secs: default_idle_grace(),
            keep_alive_interval_secs: default_keep_alive_interval(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            handshake_attempts: default_handshake_attempts(),
            reassembly_timeout_secs: default_reassembly_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// Загрузить конфигурацию из TOML файла
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Сохранить конфигурацию в TOML файл
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Валидация конфигурации
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.vehicle.address.is_empty() {
            anyhow::bail!("Адрес автомобиля не может быть пустым");
        }

        if self.connection.connect_attempts == 0 {
            anyhow::bail!("Число попыток подключения должно быть больше нуля");
        }

        if self.session.handshake_attempts == 0 {
            anyhow::bail!("Число попыток handshake должно быть больше нуля");
        }

        self.parse_keep_alive()?;

        Ok(())
    }

    /// Парсинг политики удержания соединения
    pub fn parse_keep_alive(&self) -> Result<KeepAlivePolicy, anyhow::Error> {
        match self.connection.keep_alive.as_str() {
            "persistent" => Ok(KeepAlivePolicy::Persistent),
            "on_demand" => Ok(KeepAlivePolicy::OnDemand {
                grace: Duration::from_secs(self.connection.idle_grace_secs),
            }),
            unknown => anyhow::bail!("Неизвестная политика keep-alive: {}", unknown),
        }
    }

    /// Конфигурация супервизора соединения
    pub fn supervisor_config(&self) -> Result<SupervisorConfig, anyhow::Error> {
        Ok(SupervisorConfig {
            address: self.vehicle.address.clone(),
            connect_timeout: Duration::from_secs(self.connection.connect_timeout_secs),
            max_connect_attempts: self.connection.connect_attempts,
            base_backoff: Duration::from_millis(self.connection.base_backoff_ms),
            max_backoff: Duration::from_secs(self.connection.max_backoff_secs),
            keep_alive: self.parse_keep_alive()?,
            keep_alive_interval: Duration::from_secs(
                self.connection.keep_alive_interval_secs,
            ),
        })
    }

    /// Конфигурация сессионного слоя
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            command_timeout: Duration::from_secs(self.session.command_timeout_secs),
            handshake_timeout: Duration::from_secs(self.session.handshake_timeout_secs),
            handshake_attempts: self.session.handshake_attempts,
            reassembly: ReassemblyLimits {
                timeout: Duration::from_secs(self.session.reassembly_timeout_secs),
                ..ReassemblyLimits::default()
            },
        }
    }

    /// Тайм-аут команды
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.session.command_timeout_secs)
    }
}
