//! Фрагментация конвертов под ограничение транспорта
//!
//! BLE-характеристика принимает записи ограниченного размера, поэтому
//! сериализованный конверт режется на чанки. Каждый чанк несёт индекс
//! последовательности и флаг финального чанка:
//!
//! ```text
//! chunk := flags (8) || index (16 BE) || data
//! ```
//!
//! Реассемблер собирает чанки по индексам, терпит перестановку порядка,
//! ограничен по числу чанков и объёму, и сбрасывает недособранный буфер
//! по тайм-ауту.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::{ProtocolError, Result};

/// Размер заголовка чанка
pub const CHUNK_HEADER_SIZE: usize = 3; // 1 + 2

/// Флаг финального чанка
const CHUNK_FLAG_LAST: u8 = 0b0000_0001;

/// Тайм-аут реассемблирования по умолчанию
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Максимальное число чанков одного сообщения по умолчанию
pub const DEFAULT_MAX_CHUNKS: usize = 64;

/// Максимальный размер собираемого сообщения по умолчанию
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16384;

/// Разрезать сериализованный конверт на чанки
///
/// `max_chunk_size` — максимальный размер одной записи в транспорт,
/// включая заголовок чанка.
pub fn split(data: &[u8], max_chunk_size: usize) -> Result<Vec<Bytes>> {
    if max_chunk_size <= CHUNK_HEADER_SIZE {
        return Err(ProtocolError::MalformedPayload(format!(
            "размер чанка {} не вмещает заголовок",
            max_chunk_size
        ))
        .into());
    }
    if data.is_empty() {
        return Err(ProtocolError::MalformedPayload(
            "пустое сообщение".to_string(),
        )
        .into());
    }

    let payload_per_chunk = max_chunk_size - CHUNK_HEADER_SIZE;
    let chunk_count = data.len().div_ceil(payload_per_chunk);

    if chunk_count > u16::MAX as usize + 1 {
        return Err(ProtocolError::PayloadTooLarge {
            size: data.len(),
            max: payload_per_chunk * (u16::MAX as usize + 1),
        }
        .into());
    }

    let mut chunks = Vec::with_capacity(chunk_count);
    for (index, piece) in data.chunks(payload_per_chunk).enumerate() {
        let is_last = index == chunk_count - 1;

        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + piece.len());
        buf.put_u8(if is_last { CHUNK_FLAG_LAST } else { 0 });
        buf.put_u16(index as u16);
        buf.put(piece);
        chunks.push(buf.freeze());
    }

    Ok(chunks)
}

/// Границы буфера реассемблирования
#[derive(Debug, Clone)]
pub struct ReassemblyLimits {
    /// Максимальное число чанков
    pub max_chunks: usize,
    /// Максимальный суммарный размер сообщения
    pub max_message_size: usize,
    /// Тайм-аут сборки неполного сообщения
    pub timeout: Duration,
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            max_chunks: DEFAULT_MAX_CHUNKS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            timeout: DEFAULT_REASSEMBLY_TIMEOUT,
        }
    }
}

/// Реассемблер входящих чанков
pub struct Reassembler {
    chunks: BTreeMap<u16, Bytes>,
    last_index: Option<u16>,
    total_bytes: usize,
    started_at: Option<Instant>,
    limits: ReassemblyLimits,
}

impl Reassembler {
    /// Создать новый реассемблер
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self {
            chunks: BTreeMap::new(),
            last_index: None,
            total_bytes: 0,
            started_at: None,
            limits,
        }
    }

    /// Обработать входящий чанк
    ///
    /// Возвращает `Ok(Some(..))` с собранным сообщением, когда получен
    /// финальный чанк и все предшествующие индексы на месте. Дубликаты
    /// поглощаются молча. Превышение границ сбрасывает буфер и
    /// возвращает ошибку.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Bytes>> {
        if chunk.len() < CHUNK_HEADER_SIZE + 1 {
            return Err(ProtocolError::InsufficientData {
                required: CHUNK_HEADER_SIZE + 1,
                available: chunk.len(),
            }
            .into());
        }

        // Просроченный буфер освобождаем до обработки нового чанка
        if self.is_expired() {
            let received = self.chunks.len();
            self.reset();
            tracing::warn!(
                "Сброшен недособранный буфер из {} фрагментов по тайм-ауту",
                received
            );
        }

        let mut cursor = chunk;
        let flags = cursor.get_u8();
        let index = cursor.get_u16();
        let data = Bytes::copy_from_slice(cursor);

        if self.chunks.contains_key(&index) {
            // Дубликат: поглощаем без изменения состояния
            return Ok(None);
        }

        if let Some(last) = self.last_index {
            if index > last {
                self.reset();
                return Err(ProtocolError::InvalidFragmentSequence { index }.into());
            }
        }

        if flags & CHUNK_FLAG_LAST != 0 {
            // Финальный индекс не может противоречить уже полученным
            if self.chunks.keys().any(|&i| i > index) {
                self.reset();
                return Err(ProtocolError::InvalidFragmentSequence { index }.into());
            }
            self.last_index = Some(index);
        }

        if self.chunks.len() + 1 > self.limits.max_chunks {
            let size = self.chunks.len() + 1;
            self.reset();
            return Err(ProtocolError::ReassemblyOverflow {
                size,
                max: self.limits.max_chunks,
            }
            .into());
        }

        if self.total_bytes + data.len() > self.limits.max_message_size {
            let size = self.total_bytes + data.len();
            self.reset();
            return Err(ProtocolError::ReassemblyOverflow {
                size,
                max: self.limits.max_message_size,
            }
            .into());
        }

        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }

        self.total_bytes += data.len();
        self.chunks.insert(index, data);

        self.try_complete()
    }

    /// Проверить тайм-аут сборки
    ///
    /// Возвращает ошибку `IncompleteMessage` и освобождает буфер, если
    /// неполное сообщение висит дольше настроенного тайм-аута.
    pub fn check_timeout(&mut self) -> Result<()> {
        if self.is_expired() {
            let received = self.chunks.len();
            self.reset();
            return Err(ProtocolError::IncompleteMessage { received }.into());
        }
        Ok(())
    }

    /// Число чанков в незавершённом буфере
    pub fn pending_chunks(&self) -> usize {
        self.chunks.len()
    }

    fn is_expired(&self) -> bool {
        match self.started_at {
            Some(started) => started.elapsed() > self.limits.timeout,
            None => false,
        }
    }

    fn try_complete(&mut self) -> Result<Option<Bytes>> {
        let last = match self.last_index {
            Some(last) => last,
            None => return Ok(None),
        };

        if self.chunks.len() != last as usize + 1 {
            return Ok(None);
        }

        // BTreeMap упорядочен; непрерывность проверяется подсчётом выше,
        // но контролируем индексы на случай дыр с дубликатами старших
        for (expected, &actual) in self.chunks.keys().enumerate() {
            if expected as u16 != actual {
                self.reset();
                return Err(
                    ProtocolError::InvalidFragmentSequence { index: actual }.into()
                );
            }
        }

        let mut message = BytesMut::with_capacity(self.total_bytes);
        for data in self.chunks.values() {
            message.put(data.clone());
        }

        self.reset();
        Ok(Some(message.freeze()))
    }

    fn reset(&mut self) {
        self.chunks.clear();
        self.last_index = None;
        self.total_bytes = 0;
        self.started_at = None;
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(ReassemblyLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(size: usize, max_chunk: usize) {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let chunks = split(&data, max_chunk).unwrap();

        let mut reassembler = Reassembler::default();
        let mut result = None;
        for chunk in &chunks {
            result = reassembler.push(chunk).unwrap();
        }

        assert_eq!(result.unwrap().as_ref(), &data[..]);
        assert_eq!(reassembler.pending_chunks(), 0);
    }

    #[test]
    fn test_roundtrip_sizes() {
        roundtrip(1, 20);
        roundtrip(17, 20);
        roundtrip(18, 21); // ровно один чанк
        roundtrip(19, 21); // чанк и один байт
        roundtrip(4096, 185);
    }

    #[test]
    fn test_single_chunk_has_last_flag() {
        let chunks = split(b"hi", 20).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0][0] & CHUNK_FLAG_LAST, CHUNK_FLAG_LAST);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut chunks = split(&data, 43).unwrap();
        chunks.reverse();

        let mut reassembler = Reassembler::default();
        let mut result = None;
        for chunk in &chunks {
            result = reassembler.push(chunk).unwrap();
        }

        assert_eq!(result.unwrap().as_ref(), &data[..]);
    }

    #[test]
    fn test_duplicate_chunk_absorbed() {
        let data: Vec<u8> = (0..100u8).collect();
        let chunks = split(&data, 43).unwrap();

        let mut reassembler = Reassembler::default();
        assert!(reassembler.push(&chunks[0]).unwrap().is_none());
        assert!(reassembler.push(&chunks[0]).unwrap().is_none());
        assert!(reassembler.push(&chunks[1]).unwrap().is_none());
        let result = reassembler.push(&chunks[2]).unwrap();
        assert_eq!(result.unwrap().as_ref(), &data[..]);
    }

    #[test]
    fn test_missing_final_chunk_times_out() {
        let data: Vec<u8> = (0..100u8).collect();
        let chunks = split(&data, 43).unwrap();

        let mut reassembler = Reassembler::new(ReassemblyLimits {
            timeout: Duration::from_millis(10),
            ..ReassemblyLimits::default()
        });

        reassembler.push(&chunks[0]).unwrap();
        reassembler.push(&chunks[1]).unwrap();

        std::thread::sleep(Duration::from_millis(25));

        let err = reassembler.check_timeout().unwrap_err();
        assert!(matches!(
            err,
            crate::error::VlinkError::Protocol(ProtocolError::IncompleteMessage {
                received: 2
            })
        ));
        // Буфер освобождён
        assert_eq!(reassembler.pending_chunks(), 0);
        assert!(reassembler.check_timeout().is_ok());
    }

    #[test]
    fn test_chunk_after_last_rejected() {
        let data: Vec<u8> = (0..100u8).collect();
        let chunks = split(&data, 43).unwrap();
        assert_eq!(chunks.len(), 3);

        let mut reassembler = Reassembler::default();

        // Финальный чанк (индекс 2) получен, затем приходит индекс 3
        reassembler.push(&chunks[2]).unwrap();

        let mut rogue = BytesMut::new();
        rogue.put_u8(0);
        rogue.put_u16(3);
        rogue.put(&b"tail"[..]);

        assert!(reassembler.push(&rogue).is_err());
        assert_eq!(reassembler.pending_chunks(), 0);
    }

    #[test]
    fn test_chunk_count_bound() {
        let mut reassembler = Reassembler::new(ReassemblyLimits {
            max_chunks: 2,
            ..ReassemblyLimits::default()
        });

        let make_chunk = |index: u16| {
            let mut buf = BytesMut::new();
            buf.put_u8(0);
            buf.put_u16(index);
            buf.put(&[0u8; 8][..]);
            buf.freeze()
        };

        reassembler.push(&make_chunk(0)).unwrap();
        reassembler.push(&make_chunk(1)).unwrap();
        let err = reassembler.push(&make_chunk(2));
        assert!(err.is_err());
        assert_eq!(reassembler.pending_chunks(), 0);
    }

    #[test]
    fn test_message_size_bound() {
        let mut reassembler = Reassembler::new(ReassemblyLimits {
            max_message_size: 16,
            ..ReassemblyLimits::default()
        });

        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u16(0);
        buf.put(&[0u8; 32][..]);

        assert!(reassembler.push(&buf).is_err());
    }

    #[test]
    fn test_short_chunk_rejected() {
        let mut reassembler = Reassembler::default();
        assert!(reassembler.push(&[0u8, 0u8]).is_err());
    }

    #[test]
    fn test_split_rejects_tiny_chunk_size() {
        assert!(split(b"data", CHUNK_HEADER_SIZE).is_err());
        assert!(split(b"", 20).is_err());
    }
}
