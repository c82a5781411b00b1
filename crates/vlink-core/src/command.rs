//! Команды автомобиля и типизированные ответы
//!
//! Этот модуль определяет прикладной словарь поверх шифрованного канала:
//! команды домена безопасности (замки, багажник, пробуждение) и домена
//! инфотейнмента (климат, зарядка), а также разбор ответов и push-статусов.
//!
//! Кодировка компактная: `opcode (8) || аргументы`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::envelope::Domain;
use crate::error::{ProtocolError, Result};

/// Минимальный допустимый предел заряда, %
pub const MIN_CHARGE_LIMIT: u8 = 50;

/// Максимальный допустимый предел заряда, %
pub const MAX_CHARGE_LIMIT: u8 = 100;

// Опкоды команд
const OP_WAKE: u8 = 0x01;
const OP_LOCK: u8 = 0x02;
const OP_UNLOCK: u8 = 0x03;
const OP_OPEN_TRUNK: u8 = 0x04;
const OP_CLOSE_TRUNK: u8 = 0x05;
const OP_OPEN_FRUNK: u8 = 0x06;
const OP_OPEN_CHARGE_PORT: u8 = 0x07;
const OP_CLOSE_CHARGE_PORT: u8 = 0x08;
const OP_SECURITY_STATUS: u8 = 0x09;
const OP_CLIMATE_ON: u8 = 0x20;
const OP_CLIMATE_OFF: u8 = 0x21;
const OP_CHARGE_START: u8 = 0x22;
const OP_CHARGE_STOP: u8 = 0x23;
const OP_SET_CHARGE_LIMIT: u8 = 0x24;
const OP_SET_CHARGING_AMPS: u8 = 0x25;
const OP_DATA_POLL: u8 = 0x26;

// Опкоды ответов
const OP_ACK: u8 = 0x80;
const OP_SECURITY_STATE: u8 = 0x81;
const OP_CHARGE_STATE: u8 = 0x82;
const OP_CLIMATE_STATE: u8 = 0x83;

/// Команда автомобилю
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleCommand {
    /// Разбудить автомобиль
    Wake,
    /// Закрыть замки
    Lock,
    /// Открыть замки
    Unlock,
    /// Открыть задний багажник
    OpenTrunk,
    /// Закрыть задний багажник
    CloseTrunk,
    /// Открыть передний багажник
    OpenFrunk,
    /// Открыть лючок зарядного порта
    OpenChargePort,
    /// Закрыть лючок зарядного порта
    CloseChargePort,
    /// Запросить статус безопасности
    SecurityStatus,
    /// Включить климат
    ClimateOn,
    /// Выключить климат
    ClimateOff,
    /// Начать зарядку
    ChargeStart,
    /// Остановить зарядку
    ChargeStop,
    /// Установить предел заряда, %
    SetChargeLimit(u8),
    /// Установить ток зарядки, А
    SetChargingAmps(u16),
    /// Запросить данные инфотейнмента (заряд, климат)
    DataPoll,
}

impl VehicleCommand {
    /// Домен, которому адресована команда
    pub fn domain(&self) -> Domain {
        match self {
            VehicleCommand::Wake
            | VehicleCommand::Lock
            | VehicleCommand::Unlock
            | VehicleCommand::OpenTrunk
            | VehicleCommand::CloseTrunk
            | VehicleCommand::OpenFrunk
            | VehicleCommand::OpenChargePort
            | VehicleCommand::CloseChargePort
            | VehicleCommand::SecurityStatus => Domain::VehicleSecurity,
            VehicleCommand::ClimateOn
            | VehicleCommand::ClimateOff
            | VehicleCommand::ChargeStart
            | VehicleCommand::ChargeStop
            | VehicleCommand::SetChargeLimit(_)
            | VehicleCommand::SetChargingAmps(_)
            | VehicleCommand::DataPoll => Domain::Infotainment,
        }
    }

    /// Закодировать команду в байты
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(4);

        match self {
            VehicleCommand::Wake => buf.put_u8(OP_WAKE),
            VehicleCommand::Lock => buf.put_u8(OP_LOCK),
            VehicleCommand::Unlock => buf.put_u8(OP_UNLOCK),
            VehicleCommand::OpenTrunk => buf.put_u8(OP_OPEN_TRUNK),
            VehicleCommand::CloseTrunk => buf.put_u8(OP_CLOSE_TRUNK),
            VehicleCommand::OpenFrunk => buf.put_u8(OP_OPEN_FRUNK),
            VehicleCommand::OpenChargePort => buf.put_u8(OP_OPEN_CHARGE_PORT),
            VehicleCommand::CloseChargePort => buf.put_u8(OP_CLOSE_CHARGE_PORT),
            VehicleCommand::SecurityStatus => buf.put_u8(OP_SECURITY_STATUS),
            VehicleCommand::ClimateOn => buf.put_u8(OP_CLIMATE_ON),
            VehicleCommand::ClimateOff => buf.put_u8(OP_CLIMATE_OFF),
            VehicleCommand::ChargeStart => buf.put_u8(OP_CHARGE_START),
            VehicleCommand::ChargeStop => buf.put_u8(OP_CHARGE_STOP),
            VehicleCommand::SetChargeLimit(percent) => {
                if !(MIN_CHARGE_LIMIT..=MAX_CHARGE_LIMIT).contains(percent) {
                    return Err(ProtocolError::MalformedPayload(format!(
                        "предел заряда {} вне диапазона {}-{}",
                        percent, MIN_CHARGE_LIMIT, MAX_CHARGE_LIMIT
                    ))
                    .into());
                }
                buf.put_u8(OP_SET_CHARGE_LIMIT);
                buf.put_u8(*percent);
            }
            VehicleCommand::SetChargingAmps(amps) => {
                buf.put_u8(OP_SET_CHARGING_AMPS);
                buf.put_u16(*amps);
            }
            VehicleCommand::DataPoll => buf.put_u8(OP_DATA_POLL),
        }

        Ok(buf.freeze())
    }

    /// Раскодировать команду из байтов (сторона автомобиля, тесты)
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(ProtocolError::InsufficientData {
                required: 1,
                available: 0,
            }
            .into());
        }

        let mut cursor = data;
        let opcode = cursor.get_u8();

        let command = match opcode {
            OP_WAKE => VehicleCommand::Wake,
            OP_LOCK => VehicleCommand::Lock,
            OP_UNLOCK => VehicleCommand::Unlock,
            OP_OPEN_TRUNK => VehicleCommand::OpenTrunk,
            OP_CLOSE_TRUNK => VehicleCommand::CloseTrunk,
            OP_OPEN_FRUNK => VehicleCommand::OpenFrunk,
            OP_OPEN_CHARGE_PORT => VehicleCommand::OpenChargePort,
            OP_CLOSE_CHARGE_PORT => VehicleCommand::CloseChargePort,
            OP_SECURITY_STATUS => VehicleCommand::SecurityStatus,
            OP_CLIMATE_ON => VehicleCommand::ClimateOn,
            OP_CLIMATE_OFF => VehicleCommand::ClimateOff,
            OP_CHARGE_START => VehicleCommand::ChargeStart,
            OP_CHARGE_STOP => VehicleCommand::ChargeStop,
            OP_SET_CHARGE_LIMIT => {
                if cursor.remaining() < 1 {
                    return Err(ProtocolError::InsufficientData {
                        required: 2,
                        available: data.len(),
                    }
                    .into());
                }
                VehicleCommand::SetChargeLimit(cursor.get_u8())
            }
            OP_SET_CHARGING_AMPS => {
                if cursor.remaining() < 2 {
                    return Err(ProtocolError::InsufficientData {
                        required: 3,
                        available: data.len(),
                    }
                    .into());
                }
                VehicleCommand::SetChargingAmps(cursor.get_u16())
            }
            OP_DATA_POLL => VehicleCommand::DataPoll,
            other => {
                return Err(ProtocolError::MalformedPayload(format!(
                    "неизвестный опкод команды: {:#04x}",
                    other
                ))
                .into())
            }
        };

        Ok(command)
    }
}

impl fmt::Display for VehicleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Результат выполнения команды
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    /// Команда принята
    Ok,
    /// Команда отклонена с кодом причины
    Rejected(u8),
}

/// Типизированное сообщение от автомобиля (ответ или push)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VehicleMessage {
    /// Подтверждение команды
    Ack(CommandResult),
    /// Состояние безопасности
    SecurityState {
        /// Замки закрыты
        locked: bool,
        /// Пользователь рядом с автомобилем
        user_present: bool,
    },
    /// Состояние зарядки
    ChargeState {
        /// Уровень заряда, %
        battery_level: u8,
        /// Идёт зарядка
        charging: bool,
        /// Лючок порта открыт
        charge_port_open: bool,
        /// Предел заряда, %
        charge_limit: u8,
        /// Мощность зарядки, кВт
        charger_power_kw: u16,
        /// Остаток пробега, км
        range_km: u16,
    },
    /// Состояние климата
    ClimateState {
        /// Климат включён
        on: bool,
        /// Температура в салоне, °C
        interior_celsius: i8,
    },
}

impl VehicleMessage {
    /// Закодировать сообщение в байты (сторона автомобиля, тесты)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);

        match self {
            VehicleMessage::Ack(result) => {
                buf.put_u8(OP_ACK);
                match result {
                    CommandResult::Ok => buf.put_u8(0),
                    CommandResult::Rejected(reason) => buf.put_u8(*reason),
                }
            }
            VehicleMessage::SecurityState {
                locked,
                user_present,
            } => {
                buf.put_u8(OP_SECURITY_STATE);
                let mut bits = 0u8;
                if *locked {
                    bits |= 0b01;
                }
                if *user_present {
                    bits |= 0b10;
                }
                buf.put_u8(bits);
            }
            VehicleMessage::ChargeState {
                battery_level,
                charging,
                charge_port_open,
                charge_limit,
                charger_power_kw,
                range_km,
            } => {
                buf.put_u8(OP_CHARGE_STATE);
                buf.put_u8(*battery_level);
                let mut bits = 0u8;
                if *charging {
                    bits |= 0b01;
                }
                if *charge_port_open {
                    bits |= 0b10;
                }
                buf.put_u8(bits);
                buf.put_u8(*charge_limit);
                buf.put_u16(*charger_power_kw);
                buf.put_u16(*range_km);
            }
            VehicleMessage::ClimateState {
                on,
                interior_celsius,
            } => {
                buf.put_u8(OP_CLIMATE_STATE);
                buf.put_u8(u8::from(*on));
                buf.put_i8(*interior_celsius);
            }
        }

        buf.freeze()
    }

    /// Раскодировать сообщение из байтов
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(ProtocolError::InsufficientData {
                required: 1,
                available: 0,
            }
            .into());
        }

        let mut cursor = data;
        let opcode = cursor.get_u8();

        let message = match opcode {
            OP_ACK => {
                if cursor.remaining() < 1 {
                    return Err(malformed("усечённый Ack"));
                }
                let status = cursor.get_u8();
                let result = if status == 0 {
                    CommandResult::Ok
                } else {
                    CommandResult::Rejected(status)
                };
                VehicleMessage::Ack(result)
            }
            OP_SECURITY_STATE => {
                if cursor.remaining() < 1 {
                    return Err(malformed("усечённый SecurityState"));
                }
                let bits = cursor.get_u8();
                VehicleMessage::SecurityState {
                    locked: bits & 0b01 != 0,
                    user_present: bits & 0b10 != 0,
                }
            }
            OP_CHARGE_STATE => {
                if cursor.remaining() < 7 {
                    return Err(malformed("усечённый ChargeState"));
                }
                let battery_level = cursor.get_u8();
                let bits = cursor.get_u8();
                let charge_limit = cursor.get_u8();
                let charger_power_kw = cursor.get_u16();
                let range_km = cursor.get_u16();

                if battery_level > 100 || charge_limit > 100 {
                    return Err(malformed("процент заряда вне диапазона"));
                }

                VehicleMessage::ChargeState {
                    battery_level,
                    charging: bits & 0b01 != 0,
                    charge_port_open: bits & 0b10 != 0,
                    charge_limit,
                    charger_power_kw,
                    range_km,
                }
            }
            OP_CLIMATE_STATE => {
                if cursor.remaining() < 2 {
                    return Err(malformed("усечённый ClimateState"));
                }
                let on = cursor.get_u8() != 0;
                let interior_celsius = cursor.get_i8();
                VehicleMessage::ClimateState {
                    on,
                    interior_celsius,
                }
            }
            other => {
                return Err(ProtocolError::MalformedPayload(format!(
                    "неизвестный опкод сообщения: {:#04x}",
                    other
                ))
                .into())
            }
        };

        Ok(message)
    }
}

fn malformed(reason: &str) -> crate::error::VlinkError {
    ProtocolError::MalformedPayload(reason.to_string()).into()
}
