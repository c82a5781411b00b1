//! Хранение ключевого материала интеграции
//!
//! Ядро не владеет постоянным состоянием: локальная ключевая пара и
//! изученный публичный ключ автомобиля хранятся здесь, в hex-файлах
//! каталога ключей. Счётчики и эпохи сессий намеренно не сохраняются:
//! после перезапуска процесса авторитетом по счётчику является
//! автомобиль, и свежий процесс обязан пройти handshake заново.

use anyhow::Context;
use std::path::{Path, PathBuf};

use vlink_core::crypto::{KeyPair, PUBLIC_KEY_SIZE};

/// Имя файла приватного ключа
const PRIVATE_KEY_FILE: &str = "private_key.hex";

/// Имя файла публичного ключа автомобиля
const VEHICLE_KEY_FILE: &str = "vehicle_key.hex";

/// Хранилище ключей в каталоге интеграции
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    /// Открыть хранилище в каталоге (создаётся при необходимости)
    pub fn open<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("не удалось создать каталог ключей {:?}", dir))?;
        Ok(Self { dir })
    }

    /// Загрузить ключевую пару или сгенерировать новую
    ///
    /// Пара генерируется один раз при первом запуске и далее переживает
    /// перезапуски процесса.
    pub fn load_or_generate_key_pair(&self) -> anyhow::Result<KeyPair> {
        let path = self.dir.join(PRIVATE_KEY_FILE);

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("не удалось прочитать {:?}", path))?;
            let bytes = hex::decode(content.trim())
                .context("приватный ключ повреждён: не hex")?;
            let key = KeyPair::from_bytes(&bytes)
                .map_err(|e| anyhow::anyhow!("приватный ключ повреждён: {}", e))?;
            return Ok(key);
        }

        tracing::info!("Генерация новой ключевой пары клиента");
        let mut rng = rand::rngs::OsRng;
        let key = KeyPair::generate(&mut rng);

        std::fs::write(&path, hex::encode(&key.private_bytes()[..]))
            .with_context(|| format!("не удалось записать {:?}", path))?;

        Ok(key)
    }

    /// Загрузить сохранённый публичный ключ автомобиля
    pub fn load_vehicle_key(&self) -> Option<[u8; PUBLIC_KEY_SIZE]> {
        let path = self.dir.join(VEHICLE_KEY_FILE);
        let content = std::fs::read_to_string(path).ok()?;
        let bytes = hex::decode(content.trim()).ok()?;

        if bytes.len() != PUBLIC_KEY_SIZE {
            tracing::warn!("Сохранённый ключ автомобиля повреждён, игнорируется");
            return None;
        }

        let mut key = [0u8; PUBLIC_KEY_SIZE];
        key.copy_from_slice(&bytes);
        Some(key)
    }

    /// Сохранить изученный публичный ключ автомобиля
    pub fn store_vehicle_key(&self, key: &[u8; PUBLIC_KEY_SIZE]) -> anyhow::Result<()> {
        let path = self.dir.join(VEHICLE_KEY_FILE);
        std::fs::write(&path, hex::encode(key))
            .with_context(|| format!("не удалось записать {:?}", path))?;
        Ok(())
    }
}
