//! Надёжность транспортного соединения
//!
//! Этот модуль отвечает за:
//! - Зачистку зависших соединений перед каждой попыткой подключения
//! - Подключение с ограниченными повторами, экспоненциальным backoff
//!   и джиттером (чтобы несколько автомобилей не долбили стек синхронно)
//! - Глобальную сериализацию записей: у BLE-линка нет мультиплексирования,
//!   записи идут строго по одной
//! - Политику удержания соединения (persistent / on-demand)
//! - Быстрый перевод в Reconnecting при неожиданном разрыве, чтобы
//!   ожидающие запросы завершались `ConnectionLost`, а не висели

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, Result};
use crate::fragment;
use crate::transport::Transport;

/// Состояние соединения
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Соединения нет
    Disconnected,
    /// Идёт подключение
    Connecting,
    /// Соединение активно
    Connected,
    /// Неожиданный разрыв, идёт переподключение
    Reconnecting,
}

/// Политика удержания соединения
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlivePolicy {
    /// Держать соединение открытым постоянно, переподключать при простое
    Persistent,
    /// Открывать по требованию, закрывать после паузы неактивности
    OnDemand {
        /// Пауза неактивности до закрытия
        grace: Duration,
    },
}

/// Конфигурация супервизора соединения
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Адрес автомобиля
    pub address: String,
    /// Тайм-аут одной попытки подключения
    pub connect_timeout: Duration,
    /// Максимум попыток подключения
    pub max_connect_attempts: u32,
    /// Базовая задержка backoff
    pub base_backoff: Duration,
    /// Потолок backoff
    pub max_backoff: Duration,
    /// Политика удержания соединения
    pub keep_alive: KeepAlivePolicy,
    /// Период проверки keep-alive
    pub keep_alive_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            connect_timeout: Duration::from_secs(10),
            max_connect_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            keep_alive: KeepAlivePolicy::Persistent,
            keep_alive_interval: Duration::from_secs(5),
        }
    }
}

/// Супервизор транспортного соединения
pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    config: SupervisorConfig,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    /// Единственная точка сериализации записей в линк
    write_lock: Mutex<()>,
    /// Момент последней записи (для on-demand политики)
    last_activity: Mutex<tokio::time::Instant>,
}

impl ConnectionSupervisor {
    /// Создать супервизор
    pub fn new(transport: Arc<dyn Transport>, config: SupervisorConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            transport,
            config,
            state_tx,
            shutdown_tx,
            write_lock: Mutex::new(()),
            last_activity: Mutex::new(tokio::time::Instant::now()),
        })
    }

    /// Текущее состояние соединения
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Подписка на изменения состояния
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Транспорт супервизора
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Подключиться с повторами и backoff
    ///
    /// Перед первой попыткой выполняется зачистка зависших соединений.
    /// Отменяется сигналом `shutdown`.
    pub async fn connect(&self) -> Result<()> {
        if self.transport.is_connected() {
            self.set_state(ConnectionState::Connected);
            return Ok(());
        }

        if self.state() != ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Connecting);
        }

        // Нижележащий стек может держать полумёртвый handle и отвечать
        // "busy" на новое подключение
        if let Err(e) = self.transport.close_stale(&self.config.address).await {
            debug!("Зачистка зависших соединений не удалась: {}", e);
        }

        let mut shutdown = self.shutdown_tx.subscribe();

        for attempt in 0..self.config.max_connect_attempts {
            if *shutdown.borrow() {
                self.set_state(ConnectionState::Disconnected);
                return Err(ConnectionError::Cancelled.into());
            }

            debug!(
                "Попытка подключения #{} к {}",
                attempt + 1,
                self.config.address
            );

            let result = tokio::time::timeout(
                self.config.connect_timeout,
                self.transport.connect(&self.config.address),
            )
            .await;

            match result {
                Ok(Ok(())) => {
                    info!("Соединение с {} установлено", self.config.address);
                    *self.last_activity.lock().await = tokio::time::Instant::now();
                    self.set_state(ConnectionState::Connected);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!("Подключение не удалось: {}", e);
                }
                Err(_) => {
                    warn!(
                        "Тайм-аут подключения ({} мс)",
                        self.config.connect_timeout.as_millis()
                    );
                }
            }

            // Последняя попытка — без задержки после неё
            if attempt + 1 == self.config.max_connect_attempts {
                break;
            }

            let delay = self.backoff_delay(attempt);
            debug!("Backoff {} мс перед следующей попыткой", delay.as_millis());

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(ConnectionError::Cancelled.into());
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        Err(ConnectionError::ConnectFailed {
            address: self.config.address.clone(),
            reason: format!(
                "исчерпано {} попыток",
                self.config.max_connect_attempts
            ),
        }
        .into())
    }

    /// Записать сериализованный конверт в линк
    ///
    /// Конверт режется на чанки под MTU транспорта; чанки уходят строго
    /// последовательно под общим замком записи.
    pub async fn write_envelope(&self, data: &[u8]) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected.into());
        }

        let chunks = fragment::split(data, self.transport.max_payload())?;

        let _guard = self.write_lock.lock().await;
        for chunk in &chunks {
            self.transport
                .write(chunk)
                .await
                .map_err(|e| ConnectionError::WriteFailed(e.to_string()))?;
        }

        *self.last_activity.lock().await = tokio::time::Instant::now();

        debug!(
            "Записан конверт: {} байт в {} чанков",
            data.len(),
            chunks.len()
        );

        Ok(())
    }

    /// Штатно разорвать соединение
    pub async fn disconnect(&self) {
        let _ = self.transport.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Остановить супервизор: отменяет backoff и фоновые циклы
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Запустить фоновый цикл наблюдения за соединением
    ///
    /// Реагирует на неожиданные разрывы немедленным переводом в
    /// `Reconnecting` и переподключением; для persistent политики также
    /// поднимает упавшее соединение по таймеру, для on-demand — закрывает
    /// простаивающее.
    pub fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);

        tokio::spawn(async move {
            let mut disconnects = supervisor.transport.disconnect_events();
            let mut shutdown = supervisor.shutdown_tx.subscribe();
            let mut tick = tokio::time::interval(supervisor.config.keep_alive_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        debug!("Watchdog остановлен");
                        break;
                    }
                    event = disconnects.recv() => {
                        if event.is_err() {
                            break;
                        }
                        warn!("Неожиданный разрыв соединения с {}", supervisor.config.address);
                        supervisor.set_state(ConnectionState::Reconnecting);

                        if let Err(e) = supervisor.connect().await {
                            warn!("Переподключение не удалось: {}", e);
                        }
                    }
                    _ = tick.tick() => {
                        supervisor.keep_alive_tick().await;
                    }
                }
            }
        })
    }

    async fn keep_alive_tick(&self) {
        match self.config.keep_alive {
            KeepAlivePolicy::Persistent => {
                if self.state() == ConnectionState::Connected
                    && !self.transport.is_connected()
                {
                    // Разрыв без уведомления: поднимаем соединение
                    self.set_state(ConnectionState::Reconnecting);
                    if let Err(e) = self.connect().await {
                        warn!("Keep-alive переподключение не удалось: {}", e);
                    }
                }
            }
            KeepAlivePolicy::OnDemand { grace } => {
                if self.state() == ConnectionState::Connected {
                    let idle = self.last_activity.lock().await.elapsed();
                    if idle > grace {
                        info!(
                            "Закрытие простаивающего соединения ({} мс без активности)",
                            idle.as_millis()
                        );
                        self.disconnect().await;
                    }
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_backoff.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let capped = exp.min(self.config.max_backoff.as_millis() as u64);

        // Джиттер до половины базовой задержки
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(capped + jitter)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current != state {
                debug!("Состояние соединения: {:?} → {:?}", current, state);
                *current = state;
                true
            } else {
                false
            }
        });
    }
}
