//! BLE транспорт на btleplug
//!
//! Реализация [`Transport`] поверх GATT-сервиса автомобиля: запись команд
//! в одну характеристику, приём уведомлений из другой. Ядро не знает о
//! btleplug — весь стек спрятан за трейтом.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vlink_core::error::{ConnectionError, Result, VlinkError};
use vlink_core::transport::Transport;

/// GATT-сервис командного канала автомобиля
pub const VEHICLE_SERVICE_UUID: &str = "00000211-b2d1-43f0-9b88-960cebf8b91e";

/// Характеристика записи команд
pub const WRITE_CHAR_UUID: &str = "00000212-b2d1-43f0-9b88-960cebf8b91e";

/// Характеристика уведомлений
pub const NOTIFY_CHAR_UUID: &str = "00000213-b2d1-43f0-9b88-960cebf8b91e";

/// Максимальный размер одной записи по умолчанию
pub const DEFAULT_MAX_PAYLOAD: usize = 185;

/// Длительность сканирования при поиске автомобиля
const SCAN_DURATION: Duration = Duration::from_secs(3);

/// Обнаруженный автомобиль
#[derive(Debug, Clone)]
pub struct DiscoveredVehicle {
    /// Рекламируемое имя
    pub name: String,
    /// BLE адрес
    pub address: String,
    /// Уровень сигнала
    pub rssi: Option<i16>,
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).expect("некорректный UUID в константах")
}

/// Совпадает ли рекламируемое имя с шаблоном автомобиля: S<16 hex>C
pub fn is_vehicle_name(name: &str) -> bool {
    name.len() == 18
        && name.starts_with('S')
        && name.ends_with('C')
        && name[1..17].chars().all(|c| c.is_ascii_hexdigit())
}

/// Активное подключение к автомобилю
struct ActiveConnection {
    peripheral: Peripheral,
    write_char: Characteristic,
    tasks: Vec<JoinHandle<()>>,
}

/// BLE транспорт до автомобиля
pub struct BleTransport {
    adapter: Adapter,
    max_payload: usize,
    connected: AtomicBool,
    notify_tx: broadcast::Sender<Bytes>,
    disconnect_tx: broadcast::Sender<()>,
    active: Mutex<Option<ActiveConnection>>,
}

impl BleTransport {
    /// Создать транспорт на первом доступном Bluetooth адаптере
    pub async fn new() -> anyhow::Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Bluetooth адаптер не найден"))?;

        let (notify_tx, _) = broadcast::channel(64);
        let (disconnect_tx, _) = broadcast::channel(8);

        Ok(Self {
            adapter,
            max_payload: DEFAULT_MAX_PAYLOAD,
            connected: AtomicBool::new(false),
            notify_tx,
            disconnect_tx,
            active: Mutex::new(None),
        })
    }

    /// Просканировать эфир и вернуть похожие на автомобиль устройства
    ///
    /// Устройство считается автомобилем по сервисному UUID или по
    /// рекламируемому имени вида `S<16 hex>C`.
    pub async fn scan(&self) -> anyhow::Result<Vec<DiscoveredVehicle>> {
        let service_uuid = parse_uuid(VEHICLE_SERVICE_UUID);

        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(SCAN_DURATION).await;
        self.adapter.stop_scan().await?;

        let mut vehicles = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };

            let name = props.local_name.unwrap_or_default();
            let by_service = props.services.contains(&service_uuid);
            let by_name = is_vehicle_name(&name);

            if by_service || by_name {
                vehicles.push(DiscoveredVehicle {
                    name,
                    address: peripheral.address().to_string(),
                    rssi: props.rssi,
                });
            }
        }

        Ok(vehicles)
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral> {
        // Сначала среди уже известных, затем короткое сканирование
        if let Some(peripheral) = self.lookup(address).await? {
            return Ok(peripheral);
        }

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| connect_failed(address, &e))?;
        tokio::time::sleep(SCAN_DURATION).await;
        let _ = self.adapter.stop_scan().await;

        self.lookup(address).await?.ok_or_else(|| {
            ConnectionError::ConnectFailed {
                address: address.to_string(),
                reason: "устройство не найдено в эфире".to_string(),
            }
            .into()
        })
    }

    async fn lookup(&self, address: &str) -> Result<Option<Peripheral>> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| connect_failed(address, &e))?;

        for peripheral in peripherals {
            if peripheral
                .address()
                .to_string()
                .eq_ignore_ascii_case(address)
            {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        uuid: Uuid,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| {
                ConnectionError::ConnectFailed {
                    address: peripheral.address().to_string(),
                    reason: format!("характеристика {} не найдена", uuid),
                }
                .into()
            })
    }

    async fn teardown(&self, active: &mut Option<ActiveConnection>) {
        if let Some(connection) = active.take() {
            for task in connection.tasks {
                task.abort();
            }
            let _ = connection.peripheral.disconnect().await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

fn connect_failed(address: &str, error: &dyn std::fmt::Display) -> VlinkError {
    ConnectionError::ConnectFailed {
        address: address.to_string(),
        reason: error.to_string(),
    }
    .into()
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&self, address: &str) -> Result<()> {
        let mut active = self.active.lock().await;

        if let Some(connection) = active.as_ref() {
            if connection.peripheral.is_connected().await.unwrap_or(false) {
                return Ok(());
            }
        }
        self.teardown(&mut active).await;

        let peripheral = self.find_peripheral(address).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| connect_failed(address, &e))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| connect_failed(address, &e))?;

        let write_char =
            Self::find_characteristic(&peripheral, parse_uuid(WRITE_CHAR_UUID))?;
        let notify_char =
            Self::find_characteristic(&peripheral, parse_uuid(NOTIFY_CHAR_UUID))?;

        peripheral
            .subscribe(&notify_char)
            .await
            .map_err(|e| connect_failed(address, &e))?;

        // Пересылка уведомлений в ядро
        let notify_uuid = notify_char.uuid;
        let notify_tx = self.notify_tx.clone();
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| connect_failed(address, &e))?;
        let notify_task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == notify_uuid {
                    let _ = notify_tx.send(Bytes::from(notification.value));
                }
            }
        });

        // Наблюдение за неожиданным разрывом
        let peripheral_id = peripheral.id();
        let disconnect_tx = self.disconnect_tx.clone();
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| connect_failed(address, &e))?;
        let event_task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        warn!("BLE соединение разорвано");
                        let _ = disconnect_tx.send(());
                        break;
                    }
                }
            }
        });

        info!("BLE соединение с {} установлено", address);

        *active = Some(ActiveConnection {
            peripheral,
            write_char,
            tasks: vec![notify_task, event_task],
        });
        self.connected.store(true, Ordering::SeqCst);

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        self.teardown(&mut active).await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let active = self.active.lock().await;
        let connection = active
            .as_ref()
            .ok_or(ConnectionError::NotConnected)?;

        connection
            .peripheral
            .write(&connection.write_char, data, WriteType::WithResponse)
            .await
            .map_err(|e| ConnectionError::WriteFailed(e.to_string()))?;

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

    /// Зачистка зависших соединений с адресом
    ///
    /// BLE стек может держать полумёртвый handle после аварийного
    /// завершения и отвечать "busy" на новое подключение.
    async fn close_stale(&self, address: &str) -> Result<()> {
        {
            let mut active = self.active.lock().await;
            if active.is_some() {
                debug!("Зачистка собственного подключения к {}", address);
                self.teardown(&mut active).await;
            }
        }

        if let Ok(Some(peripheral)) = self.lookup(address).await {
            if peripheral.is_connected().await.unwrap_or(false) {
                debug!("Обнаружено зависшее соединение с {}, разрываем", address);
                let _ = peripheral.disconnect().await;
            }
        }

        Ok(())
    }
}
