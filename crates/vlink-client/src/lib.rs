//! # VLink Client Library
//!
//! Клиентская библиотека командного канала автомобиля.
//!
//! Предоставляет API для:
//! - Подключения к автомобилю по BLE
//! - Авторизации ключа (pairing) и отправки команд
//! - Хранения ключевого материала между запусками

pub mod ble;
pub mod config;
pub mod identity;

pub use ble::{BleTransport, DiscoveredVehicle};
pub use config::ClientConfig;
pub use identity::IdentityStore;

use std::sync::Arc;
use tracing::info;

use vlink_core::manager::VehicleSession;

/// Собрать сессию автомобиля из конфигурации
///
/// Загружает (или генерирует) ключевую пару, поднимает BLE транспорт,
/// передаёт ядру закреплённый ключ автомобиля, если он уже известен.
pub async fn build_session(
    config: &ClientConfig,
) -> anyhow::Result<(Arc<VehicleSession>, IdentityStore)> {
    let store = IdentityStore::open(&config.vehicle.keys_dir)?;
    let key = store.load_or_generate_key_pair()?;
    let vehicle_key = store.load_vehicle_key();

    if vehicle_key.is_some() {
        info!("Ключ автомобиля загружен из хранилища");
    }

    let transport = Arc::new(BleTransport::new().await?);

    let session = VehicleSession::new(
        transport,
        key,
        vehicle_key,
        config.session_config(),
        config.supervisor_config()?,
    );

    Ok((session, store))
}

/// Сохранить изученный ключ автомобиля после успешной сессии
pub async fn persist_vehicle_key(
    session: &VehicleSession,
    store: &IdentityStore,
) -> anyhow::Result<()> {
    if let Some(key) = session.vehicle_public_key().await {
        store.store_vehicle_key(&key)?;
    }
    Ok(())
}
