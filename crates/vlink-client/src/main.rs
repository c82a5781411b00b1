//! VLink Client CLI
//!
//! Командный канал автомобиля: pairing, замки, климат, зарядка.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use vlink_client::{build_session, persist_vehicle_key, BleTransport, ClientConfig};
use vlink_core::command::VehicleCommand;

/// Аргументы командной строки
#[derive(Parser, Debug)]
#[command(name = "vlink-client")]
#[command(about = "VLink Vehicle Command Channel", long_about = None)]
struct Args {
    /// Путь к конфигурационному файлу
    #[arg(short, long, default_value = "vlink.toml")]
    config: PathBuf,

    /// Уровень логирования (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Подкоманды
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Генерация примера конфигурации
    GenerateConfig {
        /// Путь для сохранения
        #[arg(short, long, default_value = "vlink.toml")]
        output: PathBuf,
    },

    /// Просканировать эфир на автомобили
    Scan,

    /// Авторизовать ключ клиента на автомобиле
    Pair,

    /// Показать состояние автомобиля
    Status,

    /// Разбудить автомобиль
    Wake,

    /// Закрыть замки
    Lock,

    /// Открыть замки
    Unlock,

    /// Управление климатом
    Climate {
        /// Включить или выключить
        #[arg(value_enum)]
        mode: ClimateMode,
    },

    /// Установить предел заряда
    ChargeLimit {
        /// Процент (50-100)
        percent: u8,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ClimateMode {
    On,
    Off,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Подкоманды, не требующие конфигурации с адресом
    if let Commands::GenerateConfig { output } = &args.command {
        if let Err(e) = ClientConfig::default().to_file(output) {
            eprintln!("Ошибка генерации конфигурации: {}", e);
            std::process::exit(1);
        }
        println!("Конфигурация сохранена в: {}", output.display());
        println!("Укажите BLE адрес автомобиля в секции [vehicle]");
        return;
    }

    // Загрузка конфигурации
    let config = match ClientConfig::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            if !args.config.exists() {
                eprintln!("Конфигурационный файл не найден: {}", args.config.display());
                eprintln!("Создайте его командой: vlink-client generate-config");
            } else {
                eprintln!("Ошибка загрузки конфигурации: {}", e);
            }
            std::process::exit(1);
        }
    };

    // Инициализация логирования
    let log_level = args
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .parse::<Level>()
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Не удалось установить global subscriber");

    if let Err(e) = run(args, config).await {
        error!("Критическая ошибка: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args, config: ClientConfig) -> anyhow::Result<()> {
    // Сканирование не требует сессии
    if matches!(args.command, Commands::Scan) {
        let transport = BleTransport::new().await?;
        let vehicles = transport.scan().await?;

        if vehicles.is_empty() {
            println!("Автомобили не найдены");
        }
        for vehicle in vehicles {
            println!(
                "{}  {}  rssi: {}",
                vehicle.address,
                vehicle.name,
                vehicle
                    .rssi
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "—".to_string())
            );
        }
        return Ok(());
    }

    let (session, store) = build_session(&config).await?;

    info!("Подключение к автомобилю {}", config.vehicle.address);
    session.start().await?;

    let timeout = config.command_timeout();
    let result = match args.command {
        Commands::Pair => {
            println!("Подтвердите новый ключ на экране автомобиля...");
            session
                .request_whitelisting(Duration::from_secs(120))
                .await?;
            println!("✓ Ключ авторизован");
            Ok(())
        }
        Commands::Status => {
            let security = session
                .send(VehicleCommand::SecurityStatus, timeout)
                .await?;
            println!("Безопасность: {:?}", security);

            let data = session.send(VehicleCommand::DataPoll, timeout).await?;
            println!("Инфотейнмент: {:?}", data);
            Ok(())
        }
        Commands::Wake => execute(&session, VehicleCommand::Wake, timeout).await,
        Commands::Lock => execute(&session, VehicleCommand::Lock, timeout).await,
        Commands::Unlock => execute(&session, VehicleCommand::Unlock, timeout).await,
        Commands::Climate { mode } => {
            let command = match mode {
                ClimateMode::On => VehicleCommand::ClimateOn,
                ClimateMode::Off => VehicleCommand::ClimateOff,
            };
            execute(&session, command, timeout).await
        }
        Commands::ChargeLimit { percent } => {
            execute(&session, VehicleCommand::SetChargeLimit(percent), timeout).await
        }
        Commands::GenerateConfig { .. } | Commands::Scan => unreachable!(),
    };

    // Изученный ключ автомобиля сохраняется для следующих запусков
    if let Err(e) = persist_vehicle_key(&session, &store).await {
        error!("Не удалось сохранить ключ автомобиля: {}", e);
    }

    session.shutdown().await;
    result
}

async fn execute(
    session: &vlink_core::manager::VehicleSession,
    command: VehicleCommand,
    timeout: Duration,
) -> anyhow::Result<()> {
    info!("Отправка команды: {}", command);
    let response = session.send(command, timeout).await?;
    println!("✓ {:?}", response);
    Ok(())
}
