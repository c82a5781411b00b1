//! Абстракция транспорта командного канала
//!
//! Ядро не зависит от конкретного BLE-стека: ему достаточно адресуемого
//! транспорта с характеристиками, ограниченным размером записи и
//! асинхронной доставкой уведомлений. Конкретные реализации (нативный
//! BLE-клиент, прокси) подключаются через этот трейт.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::Result;

/// Транспорт до автомобиля
#[async_trait]
pub trait Transport: Send + Sync {
    /// Установить соединение с адресом
    async fn connect(&self, address: &str) -> Result<()>;

    /// Разорвать соединение
    async fn disconnect(&self) -> Result<()>;

    /// Активно ли соединение
    fn is_connected(&self) -> bool;

    /// Записать один чанк в характеристику (не больше `max_payload`)
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Согласованный максимальный размер одной записи
    fn max_payload(&self) -> usize;

    /// Подписка на уведомления от автомобиля
    fn notifications(&self) -> broadcast::Receiver<Bytes>;

    /// Подписка на события неожиданного разрыва соединения
    fn disconnect_events(&self) -> broadcast::Receiver<()>;

    /// Зачистить зависшие соединения с адресом
    ///
    /// Вызывается до каждой попытки подключения: нижележащий стек может
    /// держать полумёртвый handle и отвечать "busy" на новое соединение.
    async fn close_stale(&self, _address: &str) -> Result<()> {
        Ok(())
    }
}

/// Мок-транспорт для тестов ядра
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Управляемый транспорт: записи наблюдаемы, уведомления и разрывы
    /// инъецируются тестом.
    pub struct MockTransport {
        connected: AtomicBool,
        /// Сколько первых попыток подключения должно провалиться
        fail_connects: AtomicUsize,
        pub connect_attempts: AtomicUsize,
        pub stale_cleanups: AtomicUsize,
        max_payload: usize,
        notify_tx: broadcast::Sender<Bytes>,
        disconnect_tx: broadcast::Sender<()>,
        written_tx: broadcast::Sender<Bytes>,
        written_log: Mutex<Vec<Bytes>>,
    }

    impl MockTransport {
        pub fn new(max_payload: usize) -> Self {
            let (notify_tx, _) = broadcast::channel(64);
            let (disconnect_tx, _) = broadcast::channel(8);
            let (written_tx, _) = broadcast::channel(64);
            Self {
                connected: AtomicBool::new(false),
                fail_connects: AtomicUsize::new(0),
                connect_attempts: AtomicUsize::new(0),
                stale_cleanups: AtomicUsize::new(0),
                max_payload,
                notify_tx,
                disconnect_tx,
                written_tx,
                written_log: Mutex::new(Vec::new()),
            }
        }

        /// Проваливать первые `count` попыток подключения
        pub fn fail_next_connects(&self, count: usize) {
            self.fail_connects.store(count, Ordering::SeqCst);
        }

        /// Инъецировать уведомление от "автомобиля"
        pub fn inject_notification(&self, data: Bytes) {
            let _ = self.notify_tx.send(data);
        }

        /// Симулировать неожиданный разрыв соединения
        pub fn trigger_disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
            let _ = self.disconnect_tx.send(());
        }

        /// Поток записанных чанков
        pub fn written_stream(&self) -> broadcast::Receiver<Bytes> {
            self.written_tx.subscribe()
        }

        /// Снимок журнала записей
        pub fn written(&self) -> Vec<Bytes> {
            self.written_log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(&self, _address: &str) -> Result<()> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);

            let remaining = self.fail_connects.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_connects.store(remaining - 1, Ordering::SeqCst);
                return Err(crate::error::ConnectionError::ConnectFailed {
                    address: "mock".to_string(),
                    reason: "искусственный отказ".to_string(),
                }
                .into());
            }

            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn write(&self, data: &[u8]) -> Result<()> {
            if !self.is_connected() {
                return Err(crate::error::ConnectionError::NotConnected.into());
            }
            if data.len() > self.max_payload {
                return Err(crate::error::ConnectionError::WriteFailed(format!(
                    "чанк {} больше MTU {}",
                    data.len(),
                    self.max_payload
                ))
                .into());
            }

            let bytes = Bytes::copy_from_slice(data);
            self.written_log.lock().unwrap().push(bytes.clone());
            let _ = self.written_tx.send(bytes);
            Ok(())
        }

        fn max_payload(&self) -> usize {
            self.max_payload
        }

        fn notifications(&self) -> broadcast::Receiver<Bytes> {
            self.notify_tx.subscribe()
        }

        fn disconnect_events(&self) -> broadcast::Receiver<()> {
            self.disconnect_tx.subscribe()
        }

        async fn close_stale(&self, _address: &str) -> Result<()> {
            self.stale_cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
