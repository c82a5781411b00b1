//! Оркестрация сессий и мультиплексирование запросов
//!
//! `VehicleSession` — единственный владелец криптографического состояния
//! обоих доменов и таблицы ожидающих запросов. Он:
//! - ведёт handshake state machine каждого домена с ограниченными
//!   повторами;
//! - сериализует отправки внутри домена (один запрос в полёте), домены
//!   работают независимо и параллельно;
//! - шифрует команды и расшифровывает ответы через `DomainSession`;
//! - сопоставляет ответы ожидающим запросам по request_id, незапрошенные
//!   push-сообщения раздаёт подписчикам;
//! - при потере соединения завершает ожидающие запросы `ConnectionLost`
//!   немедленно, не дожидаясь тайм-аутов;
//! - выполняет whitelist-процедуру добавления ключа с наблюдаемым
//!   статусом «ожидает физического подтверждения».

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::OsRng;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{VehicleCommand, VehicleMessage};
use crate::crypto::KeyPair;
use crate::envelope::{Domain, Envelope, EnvelopeKind};
use crate::error::{
    ConnectionError, PairingError, Result, SessionError, VlinkError,
};
use crate::fragment::{ReassemblyLimits, Reassembler};
use crate::handshake::{
    SessionInfo, SessionInfoRequest, WhitelistDecision, WhitelistRequest,
    WhitelistStatus,
};
use crate::session::{DomainSession, SessionPhase};
use crate::supervisor::{ConnectionState, ConnectionSupervisor, SupervisorConfig};
use crate::transport::Transport;

/// Конфигурация сессионного слоя
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Тайм-аут команды по умолчанию
    pub command_timeout: Duration,
    /// Тайм-аут одной попытки handshake
    pub handshake_timeout: Duration,
    /// Максимум попыток handshake
    pub handshake_attempts: u32,
    /// Границы реассемблирования входящих фрагментов
    pub reassembly: ReassemblyLimits,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            handshake_attempts: 3,
            reassembly: ReassemblyLimits::default(),
        }
    }
}

/// Состояние домена с замком сериализации отправок
struct DomainRuntime {
    state: Mutex<DomainSession>,
    /// Один запрос в полёте на домен
    send_lock: Mutex<()>,
    events: broadcast::Sender<VehicleMessage>,
}

/// Ожидающий запрос; разрешается ровно один раз
struct PendingRequest {
    domain: Domain,
    tx: oneshot::Sender<Result<Bytes>>,
}

/// Аутентифицированная сессия с автомобилем
pub struct VehicleSession {
    local_key: KeyPair,
    config: SessionConfig,
    supervisor: Arc<ConnectionSupervisor>,
    domains: HashMap<Domain, Arc<DomainRuntime>>,
    pending: Mutex<HashMap<u32, PendingRequest>>,
    next_request_id: AtomicU32,
    pairing: Mutex<Option<watch::Sender<WhitelistDecision>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VehicleSession {
    /// Создать сессию
    ///
    /// `vehicle_public_key` — закреплённый ключ автомобиля из хранилища
    /// интеграции, если он уже известен. Счётчики и эпохи никогда не
    /// передаются снаружи: свежий процесс обязан пройти handshake заново.
    pub fn new(
        transport: Arc<dyn Transport>,
        local_key: KeyPair,
        vehicle_public_key: Option<[u8; crate::crypto::PUBLIC_KEY_SIZE]>,
        config: SessionConfig,
        supervisor_config: SupervisorConfig,
    ) -> Arc<Self> {
        let supervisor = ConnectionSupervisor::new(transport, supervisor_config);

        let mut domains = HashMap::new();
        for domain in [Domain::VehicleSecurity, Domain::Infotainment] {
            let state = match vehicle_public_key {
                Some(key) => DomainSession::with_pinned_peer(domain, key),
                None => DomainSession::new(domain),
            };
            let (events, _) = broadcast::channel(32);
            domains.insert(
                domain,
                Arc::new(DomainRuntime {
                    state: Mutex::new(state),
                    send_lock: Mutex::new(()),
                    events,
                }),
            );
        }

        Arc::new(Self {
            local_key,
            config,
            supervisor,
            domains,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU32::new(1),
            pairing: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Запустить сессию: подключиться и поднять фоновые циклы
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        // Приёмный цикл поднимается до подключения, чтобы не потерять
        // первые уведомления
        let pump = self.spawn_notification_pump();
        let watcher = self.spawn_state_watcher();

        {
            let mut tasks = self.tasks.lock().await;
            tasks.push(pump);
            tasks.push(watcher);
        }

        self.supervisor.connect().await?;

        let watchdog = self.supervisor.spawn_watchdog();
        self.tasks.lock().await.push(watchdog);

        Ok(())
    }

    /// Остановить сессию и отменить фоновые циклы
    ///
    /// Висящие переподключения и backoff отменяются, ожидающие запросы
    /// завершаются `Cancelled`.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown();
        self.supervisor.disconnect().await;

        self.fail_pending(|| ConnectionError::Cancelled.into()).await;

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Текущее состояние соединения (для отчёта о доступности)
    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Подписка на незапрошенные сообщения домена
    pub fn subscribe(&self, domain: Domain) -> broadcast::Receiver<VehicleMessage> {
        self.runtime(domain).events.subscribe()
    }

    /// Отправить команду и дождаться ответа
    ///
    /// Отправки внутри домена сериализованы; независимые домены работают
    /// параллельно. Счётчик продвигается до записи и не откатывается при
    /// тайм-ауте или ошибке.
    pub async fn send(
        &self,
        command: VehicleCommand,
        timeout: Duration,
    ) -> Result<VehicleMessage> {
        let domain = command.domain();
        let runtime = self.runtime(domain);

        let _send_guard = runtime.send_lock.lock().await;

        self.ensure_session(domain, &runtime).await?;

        let payload = command.encode()?;
        let request_id = self.allocate_request_id();

        let envelope = {
            let mut state = runtime.state.lock().await;
            state.seal_envelope(EnvelopeKind::Command, request_id, &payload)?
        };

        let response = self
            .write_and_wait(domain, request_id, &envelope, timeout)
            .await?;

        VehicleMessage::decode(&response)
    }

    /// Отправить команду с тайм-аутом по умолчанию
    pub async fn send_default(&self, command: VehicleCommand) -> Result<VehicleMessage> {
        self.send(command, self.config.command_timeout).await
    }

    /// Запустить whitelist-процедуру добавления локального ключа
    ///
    /// Возвращает наблюдаемый статус: `Pending` сразу после отправки,
    /// затем `Approved`/`Denied` по вердикту автомобиля.
    pub async fn start_pairing(&self) -> Result<watch::Receiver<WhitelistDecision>> {
        let request = WhitelistRequest::new(&self.local_key);
        let request_id = self.allocate_request_id();

        let mut envelope = Envelope::plaintext(
            EnvelopeKind::WhitelistRequest,
            Domain::VehicleSecurity,
            request_id,
            request.serialize(),
        )?;
        envelope.sign(&self.local_key);

        let (tx, rx) = watch::channel(WhitelistDecision::Pending);
        *self.pairing.lock().await = Some(tx);

        self.supervisor
            .write_envelope(&envelope.serialize()?)
            .await?;

        info!("Отправлен whitelist-запрос, ожидается подтверждение на автомобиле");

        Ok(rx)
    }

    /// Добавить локальный ключ в whitelist и дождаться вердикта
    ///
    /// Промежуточный статус «ожидает физического подтверждения» доступен
    /// через [`VehicleSession::start_pairing`].
    pub async fn request_whitelisting(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.start_pairing().await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match *rx.borrow() {
                WhitelistDecision::Approved => return Ok(()),
                WhitelistDecision::Denied => {
                    return Err(PairingError::AuthorizationDenied.into())
                }
                WhitelistDecision::Pending => {}
            }

            if tokio::time::timeout_at(deadline, rx.changed())
                .await
                .is_err()
            {
                return Err(PairingError::AuthorizationPending.into());
            }
        }
    }

    /// Фаза сессии домена (для диагностики)
    pub async fn session_phase(&self, domain: Domain) -> SessionPhase {
        self.runtime(domain).state.lock().await.phase()
    }

    /// Изученный публичный ключ автомобиля (для сохранения интеграцией)
    pub async fn vehicle_public_key(
        &self,
    ) -> Option<[u8; crate::crypto::PUBLIC_KEY_SIZE]> {
        self.runtime(Domain::VehicleSecurity)
            .state
            .lock()
            .await
            .vehicle_public_key()
    }

    // --- ВНУТРЕННЕЕ ---

    fn runtime(&self, domain: Domain) -> Arc<DomainRuntime> {
        Arc::clone(
            self.domains
                .get(&domain)
                .expect("домены фиксированы при создании"),
        )
    }

    fn allocate_request_id(&self) -> u32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            // request_id 0 зарезервирован за push-сообщениями
            if id != 0 {
                return id;
            }
        }
    }

    /// Убедиться, что сессия домена установлена; при необходимости
    /// выполнить handshake с ограниченными повторами
    async fn ensure_session(
        &self,
        domain: Domain,
        runtime: &Arc<DomainRuntime>,
    ) -> Result<()> {
        {
            let mut state = runtime.state.lock().await;
            match state.phase() {
                SessionPhase::Authenticated => return Ok(()),
                // Faulted никогда не переиспользуется: полный сброс и
                // новый handshake
                SessionPhase::Faulted => state.invalidate(),
                _ => {}
            }
        }

        let attempts = self.config.handshake_attempts;
        for attempt in 1..=attempts {
            debug!("Handshake домена {}, попытка {}/{}", domain, attempt, attempts);

            match self.handshake_once(domain, runtime).await {
                Ok(()) => return Ok(()),
                Err(VlinkError::Connection(ConnectionError::Timeout { .. })) => {
                    warn!(
                        "Попытка handshake {}/{} для домена {} истекла",
                        attempt, attempts, domain
                    );
                }
                Err(e) => return Err(e),
            }
        }

        {
            let mut state = runtime.state.lock().await;
            state.invalidate();
        }

        Err(SessionError::HandshakeTimeout { domain, attempts }.into())
    }

    async fn handshake_once(
        &self,
        domain: Domain,
        runtime: &Arc<DomainRuntime>,
    ) -> Result<()> {
        let mut rng = OsRng;
        let request = SessionInfoRequest::new(&mut rng, &self.local_key);
        let request_id = self.allocate_request_id();

        {
            let mut state = runtime.state.lock().await;
            state.begin_handshake(request.challenge);
        }

        let mut envelope = Envelope::plaintext(
            EnvelopeKind::SessionInfoRequest,
            domain,
            request_id,
            request.serialize(),
        )?;
        envelope.sign(&self.local_key);

        self.write_and_wait(domain, request_id, &envelope, self.config.handshake_timeout)
            .await?;

        Ok(())
    }

    /// Зарегистрировать ожидание, записать конверт и дождаться ответа
    async fn write_and_wait(
        &self,
        domain: Domain,
        request_id: u32,
        envelope: &Envelope,
        timeout: Duration,
    ) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(request_id, PendingRequest { domain, tx });

        let serialized = envelope.serialize()?;
        if let Err(e) = self.supervisor.write_envelope(&serialized).await {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Отправитель уничтожен — сессия остановлена
            Ok(Err(_)) => Err(ConnectionError::Cancelled.into()),
            Err(_) => {
                // Счётчик не откатывается: представления клиента и
                // автомобиля остаются монотонно согласованными
                self.pending.lock().await.remove(&request_id);
                Err(ConnectionError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    /// Завершить все ожидающие запросы указанной ошибкой
    async fn fail_pending(&self, make_error: impl Fn() -> VlinkError) {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return;
        }

        warn!("Досрочное завершение {} ожидающих запросов", pending.len());
        for (id, request) in pending.drain() {
            debug!("Запрос {} домена {} завершён досрочно", id, request.domain);
            let _ = request.tx.send(Err(make_error()));
        }
    }

    /// Приёмный цикл: чанки → реассемблер → конверты → диспетчеризация
    fn spawn_notification_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);

        tokio::spawn(async move {
            let mut notifications = session.supervisor.transport().notifications();
            let mut reassembler = Reassembler::new(session.config.reassembly.clone());
            let mut tick = tokio::time::interval(session.config.reassembly.timeout);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    chunk = notifications.recv() => {
                        let chunk = match chunk {
                            Ok(chunk) => chunk,
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!("Приёмный цикл отстал на {} уведомлений", missed);
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        };

                        match reassembler.push(&chunk) {
                            Ok(Some(message)) => {
                                session.dispatch_raw(&message).await;
                            }
                            Ok(None) => {}
                            Err(e) => warn!("Фрагмент отброшен: {}", e),
                        }
                    }
                    _ = tick.tick() => {
                        if let Err(e) = reassembler.check_timeout() {
                            warn!("{}", e);
                        }
                    }
                }
            }
        })
    }

    /// Наблюдатель состояния соединения: потеря линка быстро завершает
    /// ожидающие запросы
    fn spawn_state_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);

        tokio::spawn(async move {
            let mut state = session.supervisor.watch_state();

            while state.changed().await.is_ok() {
                let current = *state.borrow();
                if matches!(
                    current,
                    ConnectionState::Reconnecting | ConnectionState::Disconnected
                ) {
                    session
                        .fail_pending(|| ConnectionError::ConnectionLost.into())
                        .await;
                }
            }
        })
    }

    /// Разобрать и обработать собранное сообщение
    ///
    /// Мусор с линка — всегда восстановимая протокольная ошибка, никогда
    /// не паника.
    async fn dispatch_raw(&self, message: &[u8]) {
        let envelope = match Envelope::deserialize(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Некорректный конверт отброшен: {}", e);
                return;
            }
        };

        debug!("Принят {}", envelope);
        self.dispatch(envelope).await;
    }

    async fn dispatch(&self, envelope: Envelope) {
        match envelope.header.kind {
            EnvelopeKind::SessionInfo => self.handle_session_info(envelope).await,
            EnvelopeKind::Response => self.handle_response(envelope).await,
            EnvelopeKind::EpochChange => self.handle_epoch_change(envelope).await,
            EnvelopeKind::WhitelistStatus => self.handle_whitelist_status(envelope).await,
            other => {
                warn!("Неожиданный тип конверта от автомобиля: {:?}", other);
            }
        }
    }

    async fn handle_session_info(&self, envelope: Envelope) {
        let domain = envelope.header.domain;
        let request_id = envelope.header.request_id;

        let result = self.apply_session_info(&envelope).await;

        if let Err(e) = &result {
            warn!("Handshake домена {} не удался: {}", domain, e);
        }

        if let Some(request) = self.take_pending(request_id).await {
            let _ = request.tx.send(result.map(|_| Bytes::new()));
        }
    }

    async fn apply_session_info(&self, envelope: &Envelope) -> Result<()> {
        let info = SessionInfo::deserialize(&envelope.payload)?;

        // Подпись доказывает владение заявленным ключом; соответствие
        // закреплённому ключу проверяет DomainSession
        envelope.verify_signature(&info.public_key)?;

        let runtime = self.runtime(envelope.header.domain);
        let mut state = runtime.state.lock().await;
        state.apply_session_info(&self.local_key, &info)
    }

    async fn handle_response(&self, envelope: Envelope) {
        let domain = envelope.header.domain;
        let request_id = envelope.header.request_id;
        let runtime = self.runtime(domain);

        let plaintext = {
            let mut state = runtime.state.lock().await;
            state.open_envelope(&envelope)
        };

        match plaintext {
            Ok(plaintext) => {
                if let Some(request) = self.take_pending(request_id).await {
                    let _ = request.tx.send(Ok(plaintext));
                    return;
                }

                // Незапрошенное сообщение — подписчикам домена
                match VehicleMessage::decode(&plaintext) {
                    Ok(message) => {
                        debug!("Push от домена {}: {:?}", domain, message);
                        let _ = runtime.events.send(message);
                    }
                    Err(e) => warn!("Некорректный push отброшен: {}", e),
                }
            }
            Err(VlinkError::Crypto(crate::error::CryptoError::ReplayRejected {
                received,
                last,
            })) => {
                // Дубликаты и переупорядоченные кадры поглощаются без
                // рассинхронизации легитимного потока
                warn!(
                    "Replay отброшен для домена {}: счётчик {} ≤ {}",
                    domain, received, last
                );
            }
            Err(e) => {
                warn!("Расшифровка от домена {} не удалась: {}", domain, e);
                if let Some(request) = self.take_pending(request_id).await {
                    let _ = request.tx.send(Err(e));
                }
            }
        }
    }

    async fn handle_epoch_change(&self, envelope: Envelope) {
        let domain = envelope.header.domain;

        let change = match crate::handshake::EpochChange::deserialize(&envelope.payload)
        {
            Ok(change) => change,
            Err(e) => {
                warn!("Некорректное уведомление о смене эпохи: {}", e);
                return;
            }
        };

        let runtime = self.runtime(domain);
        let mut state = runtime.state.lock().await;
        match state.apply_epoch_change(&change) {
            Ok(()) => info!("Эпоха домена {} обновлена", domain),
            Err(e) => warn!("Смена эпохи домена {} отклонена: {}", domain, e),
        }
    }

    async fn handle_whitelist_status(&self, envelope: Envelope) {
        let status = match WhitelistStatus::deserialize(&envelope.payload) {
            Ok(status) => status,
            Err(e) => {
                warn!("Некорректный whitelist-статус: {}", e);
                return;
            }
        };

        info!("Whitelist-статус от автомобиля: {:?}", status.decision);

        let pairing = self.pairing.lock().await;
        if let Some(tx) = pairing.as_ref() {
            let _ = tx.send(status.decision);
        }
    }

    async fn take_pending(&self, request_id: u32) -> Option<PendingRequest> {
        if request_id == 0 {
            return None;
        }
        self.pending.lock().await.remove(&request_id)
    }
}
