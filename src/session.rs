//! Connection session for one locomotive.
//!
//! [`LocomotiveSession`] is a cheap, cloneable handle. Every state transition
//! happens on one background task that owns the link, the dispatch queue and
//! the tracked locomotive state; handles talk to it over a channel.
//!
//! ```text
//! Disconnected -> Connecting -> Discovering -> Ready -> Disconnecting -> Disconnected
//!                                                |
//!                                  link lost     v
//!                                           Reconnecting -> Connecting ...
//! ```

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use std::{
    collections::{HashSet, VecDeque},
    future::{pending, Future},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{Instant, Sleep},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    command::Command,
    error::{LionChiefError, Result},
    identity,
    protocol::{self, CommandFrame, NotificationEvent},
    status::{StatusEvent, StatusObserver, StatusPublisher},
    transport::{ConnectionHandle, Transport},
    types::{
        Announcement, DeviceAddress, DeviceIdentity, Direction, LocomotiveState, ReconnectPolicy,
        SessionConfig, SessionFault, SessionPhase, SoundSource, StatusSnapshot, Telemetry,
    },
};

/// Handle to a running locomotive session
///
/// # Examples
///
/// ```no_run
/// use lionchief::{BleTransport, Command, LocomotiveSession, SessionConfig};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = SessionConfig::new("FC:1F:C3:9F:A5:4A");
///     let transport = Arc::new(BleTransport::new(config.scan_timeout_ms).await?);
///     let session = LocomotiveSession::spawn(config, transport)?;
///
///     session.connect().await?;
///     session.issue_command(Command::SetLights(false)).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct LocomotiveSession {
    requests: mpsc::UnboundedSender<Request>,
    status: Arc<StatusPublisher>,
    address: DeviceAddress,
}

impl LocomotiveSession {
    /// Validate `config` and start the session task, initially disconnected
    ///
    /// Must be called from within a Tokio runtime. The task stops once every
    /// handle has been dropped, closing the link if one is open.
    ///
    /// # Errors
    ///
    /// Returns [`LionChiefError::Config`] if the configuration is invalid.
    pub fn spawn(config: SessionConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let address = config.address()?;
        let status = Arc::new(StatusPublisher::new());
        let (requests, inbox) = mpsc::unbounded_channel();

        let actor = SessionActor::new(
            &config,
            address.clone(),
            transport,
            Arc::clone(&status),
            inbox,
        );
        tokio::spawn(actor.run());

        info!("Session created for {address}");
        Ok(Self {
            requests,
            status,
            address,
        })
    }

    /// Address this session controls
    #[must_use]
    pub const fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Connect, discover services, subscribe and read identity
    ///
    /// A no-op when already connected. Failures are not retried.
    ///
    /// # Errors
    ///
    /// Returns [`LionChiefError::ConnectFailed`], [`LionChiefError::ServiceDiscoveryFailed`]
    /// or [`LionChiefError::SubscribeFailed`]; the session is left disconnected.
    pub async fn connect(&self) -> Result<()> {
        self.request(Request::Connect).await?
    }

    /// Tear the session down
    ///
    /// Cancels any pending reconnect and fails queued and in-flight commands
    /// with [`LionChiefError::SessionClosed`]. Always succeeds while the task runs.
    ///
    /// # Errors
    ///
    /// Returns [`LionChiefError::SessionClosed`] if the session task is gone.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Request::Disconnect).await?
    }

    /// Re-read the Device Information Service
    ///
    /// # Errors
    ///
    /// Returns [`LionChiefError::SessionClosed`] unless the session is connected.
    pub async fn request_identity_refresh(&self) -> Result<DeviceIdentity> {
        self.request(Request::RefreshIdentity).await?
    }

    /// Queue a command without waiting for it to be written
    ///
    /// The returned [`PendingCommand`] resolves once the frame is written or
    /// the command fails. Dropping it does not cancel the command.
    ///
    /// # Errors
    ///
    /// Returns [`LionChiefError::InvalidParameter`] for out-of-range values and
    /// [`LionChiefError::SessionClosed`] if the session task is gone.
    pub fn submit(&self, command: Command) -> Result<PendingCommand> {
        let frame = command.to_frame()?;
        let (reply, outcome) = oneshot::channel();
        self.requests
            .send(Request::Command {
                command,
                frame,
                reply,
            })
            .map_err(|_| LionChiefError::SessionClosed)?;
        Ok(PendingCommand { command, outcome })
    }

    /// Queue a command and wait until its frame has been written
    ///
    /// # Errors
    ///
    /// Returns [`LionChiefError::InvalidParameter`] without queueing anything,
    /// [`LionChiefError::SessionClosed`] when not connected or torn down while
    /// pending, [`LionChiefError::WriteFailed`] or [`LionChiefError::ReconnectExhausted`].
    pub async fn issue_command(&self, command: Command) -> Result<()> {
        self.submit(command)?.await
    }

    /// Set the throttle, 0-100 percent
    ///
    /// # Errors
    ///
    /// See [`Self::issue_command`].
    pub async fn set_speed(&self, percent: u8) -> Result<()> {
        self.issue_command(Command::SetSpeed(percent)).await
    }

    /// Set the travel direction
    ///
    /// # Errors
    ///
    /// See [`Self::issue_command`].
    pub async fn set_direction(&self, direction: Direction) -> Result<()> {
        self.issue_command(Command::SetDirection(direction)).await
    }

    /// Switch the headlight
    ///
    /// # Errors
    ///
    /// See [`Self::issue_command`].
    pub async fn set_lights(&self, on: bool) -> Result<()> {
        self.issue_command(Command::SetLights(on)).await
    }

    /// Sound or silence the horn
    ///
    /// # Errors
    ///
    /// See [`Self::issue_command`].
    pub async fn set_horn(&self, on: bool) -> Result<()> {
        self.issue_command(Command::SetHorn(on)).await
    }

    /// Ring or silence the bell
    ///
    /// # Errors
    ///
    /// See [`Self::issue_command`].
    pub async fn set_bell(&self, on: bool) -> Result<()> {
        self.issue_command(Command::SetBell(on)).await
    }

    /// Stop ahead of every command still waiting to be written
    ///
    /// # Errors
    ///
    /// See [`Self::issue_command`].
    pub async fn emergency_stop(&self) -> Result<()> {
        warn!("Emergency stop requested for {}", self.address);
        self.issue_command(Command::EmergencyStop).await
    }

    /// Play a conductor announcement
    ///
    /// # Errors
    ///
    /// See [`Self::issue_command`].
    pub async fn play_announcement(&self, announcement: Announcement) -> Result<()> {
        self.issue_command(Command::PlayAnnouncement(announcement)).await
    }

    /// Set volume (0-7) and pitch (-2..=2) for one sound source
    ///
    /// # Errors
    ///
    /// See [`Self::issue_command`].
    pub async fn set_sound_volume(&self, source: SoundSource, volume: u8, pitch: i8) -> Result<()> {
        self.issue_command(Command::SetSoundVolume {
            source,
            volume,
            pitch,
        })
        .await
    }

    /// Latest published snapshot
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Latest-value receiver for the snapshot
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.watch()
    }

    /// Stream of status and identity changes
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.events()
    }

    /// Register an observer for status and identity changes
    pub fn add_observer(&self, observer: Arc<dyn StatusObserver>) {
        self.status.add_observer(observer);
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(make(reply))
            .map_err(|_| LionChiefError::SessionClosed)?;
        response.await.map_err(|_| LionChiefError::SessionClosed)
    }
}

/// Outcome of a command queued with [`LocomotiveSession::submit`]
#[derive(Debug)]
pub struct PendingCommand {
    command: Command,
    outcome: oneshot::Receiver<Result<()>>,
}

impl PendingCommand {
    /// The queued command
    #[must_use]
    pub const fn command(&self) -> Command {
        self.command
    }
}

impl Future for PendingCommand {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(LionChiefError::SessionClosed)))
    }
}

enum Request {
    Command {
        command: Command,
        frame: CommandFrame,
        reply: oneshot::Sender<Result<()>>,
    },
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<Result<()>>),
    RefreshIdentity(oneshot::Sender<Result<DeviceIdentity>>),
}

enum Event {
    Request(Request),
    WriteDone(Result<()>),
    Connected(Result<ConnectionHandle>),
    Established(Result<Established>),
    Notification(Bytes),
    NotificationsClosed,
    LinkLost,
    ReconnectDue,
}

#[derive(Debug, Clone, Copy)]
struct LinkTargets {
    service: Uuid,
    write: Uuid,
    notify: Uuid,
    device_info: Uuid,
}

struct Link {
    handle: ConnectionHandle,
    write_characteristic: Uuid,
    notifications: Option<mpsc::UnboundedReceiver<Bytes>>,
    lost: oneshot::Receiver<()>,
    device_info: HashSet<Uuid>,
}

struct Established {
    link: Link,
    identity: DeviceIdentity,
}

struct Attempt {
    automatic: bool,
    deadline: Instant,
    stage: AttemptStage,
}

enum AttemptStage {
    Connecting(BoxFuture<'static, Result<ConnectionHandle>>),
    Discovering {
        handle: ConnectionHandle,
        task: BoxFuture<'static, Result<Established>>,
    },
}

struct Pending {
    command: Command,
    frame: CommandFrame,
    reply: oneshot::Sender<Result<()>>,
}

struct InFlight {
    command: Command,
    reply: oneshot::Sender<Result<()>>,
    write: BoxFuture<'static, Result<()>>,
}

struct SessionActor {
    transport: Arc<dyn Transport>,
    address: DeviceAddress,
    targets: LinkTargets,
    connect_timeout: Duration,
    policy: ReconnectPolicy,
    status: Arc<StatusPublisher>,
    inbox: mpsc::UnboundedReceiver<Request>,

    phase: SessionPhase,
    link: Option<Link>,
    attempt: Option<Attempt>,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    queue: VecDeque<Pending>,
    in_flight: Option<InFlight>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    reconnect_attempt: u32,

    identity: DeviceIdentity,
    locomotive: LocomotiveState,
    telemetry: Telemetry,
    last_fault: Option<SessionFault>,
}

impl SessionActor {
    fn new(
        config: &SessionConfig,
        address: DeviceAddress,
        transport: Arc<dyn Transport>,
        status: Arc<StatusPublisher>,
        inbox: mpsc::UnboundedReceiver<Request>,
    ) -> Self {
        let targets = LinkTargets {
            service: address.service_uuid(),
            write: config.write_characteristic_uuid,
            notify: config.notify_characteristic_uuid,
            device_info: config.device_info_service_uuid,
        };

        Self {
            transport,
            address,
            targets,
            connect_timeout: config.connect_timeout(),
            policy: config.reconnect.clone(),
            status,
            inbox,
            phase: SessionPhase::Disconnected,
            link: None,
            attempt: None,
            connect_waiters: Vec::new(),
            queue: VecDeque::new(),
            in_flight: None,
            reconnect_timer: None,
            reconnect_attempt: 0,
            identity: DeviceIdentity::default(),
            locomotive: LocomotiveState::default(),
            telemetry: Telemetry::default(),
            last_fault: None,
        }
    }

    async fn run(mut self) {
        loop {
            self.dispatch_next();

            let event = tokio::select! {
                request = self.inbox.recv() => match request {
                    Some(request) => Event::Request(request),
                    None => break,
                },
                result = write_done(&mut self.in_flight) => Event::WriteDone(result),
                event = attempt_progress(&mut self.attempt) => event,
                event = link_event(&mut self.link) => event,
                () = reconnect_due(&mut self.reconnect_timer) => Event::ReconnectDue,
            };

            self.handle(event).await;
        }

        debug!("All handles for {} dropped, stopping session", self.address);
        self.close().await;
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Request(request) => self.handle_request(request).await,
            Event::WriteDone(result) => self.finish_write(result).await,
            Event::Connected(result) => self.on_connected(result).await,
            Event::Established(result) => self.on_established(result).await,
            Event::Notification(payload) => self.on_notification(&payload),
            Event::NotificationsClosed => {
                if let Some(link) = self.link.as_mut() {
                    link.notifications = None;
                }
            }
            Event::LinkLost => self.on_link_lost().await,
            Event::ReconnectDue => {
                self.reconnect_timer = None;
                self.start_attempt(true);
            }
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Command {
                command,
                frame,
                reply,
            } => self.enqueue(Pending {
                command,
                frame,
                reply,
            }),
            Request::Connect(reply) => self.connect(reply),
            Request::Disconnect(reply) => {
                self.close().await;
                let _ = reply.send(Ok(()));
            }
            Request::RefreshIdentity(reply) => {
                let result = self.refresh_identity().await;
                let _ = reply.send(result);
            }
        }
    }

    fn enqueue(&mut self, pending: Pending) {
        match self.phase {
            SessionPhase::Disconnected | SessionPhase::Disconnecting => {
                debug!("Rejecting {}: session not connected", pending.command);
                let _ = pending.reply.send(Err(LionChiefError::SessionClosed));
            }
            _ if pending.command.is_priority() => {
                // behind earlier priority commands, ahead of everything else
                let position = self
                    .queue
                    .iter()
                    .position(|queued| !queued.command.is_priority())
                    .unwrap_or(self.queue.len());
                debug!(
                    "{} placed ahead of {} queued command(s)",
                    pending.command,
                    self.queue.len() - position
                );
                self.queue.insert(position, pending);
            }
            _ => self.queue.push_back(pending),
        }
    }

    fn dispatch_next(&mut self) {
        if self.phase != SessionPhase::Ready || self.in_flight.is_some() {
            return;
        }
        let Some(link) = self.link.as_ref() else {
            return;
        };
        let Some(pending) = self.queue.pop_front() else {
            return;
        };

        let transport = Arc::clone(&self.transport);
        let handle = link.handle;
        let characteristic = link.write_characteristic;
        let bytes = pending.frame.to_bytes();
        debug!("Sending {}: {:02X?}", pending.command, &bytes[..]);

        let write = async move {
            transport
                .write_characteristic(handle, characteristic, &bytes)
                .await
        }
        .boxed();

        self.in_flight = Some(InFlight {
            command: pending.command,
            reply: pending.reply,
            write,
        });
    }

    async fn finish_write(&mut self, result: Result<()>) {
        let Some(op) = self.in_flight.take() else {
            return;
        };

        match result {
            Ok(()) => {
                op.command.apply_to(&mut self.locomotive);
                if op.command == Command::Disconnect {
                    info!("Disconnect frame sent to {}", self.address);
                    self.close().await;
                } else {
                    self.publish();
                }
                let _ = op.reply.send(Ok(()));
            }
            Err(e) if e.is_link_level() => {
                warn!("Link lost while writing {}: {}", op.command, e);
                let _ = op.reply.send(Err(e));
                if let Some(link) = self.link.take() {
                    self.enter_reconnecting();
                    self.transport.disconnect(link.handle).await;
                }
            }
            Err(e) => {
                warn!("Failed to write {}: {}", op.command, e);
                let _ = op.reply.send(Err(e));
            }
        }
    }

    fn connect(&mut self, reply: oneshot::Sender<Result<()>>) {
        match self.phase {
            SessionPhase::Ready => {
                let _ = reply.send(Ok(()));
            }
            SessionPhase::Connecting | SessionPhase::Discovering => {
                self.connect_waiters.push(reply);
            }
            SessionPhase::Reconnecting => {
                // skip the remaining backoff
                self.connect_waiters.push(reply);
                self.reconnect_timer = None;
                self.start_attempt(true);
            }
            SessionPhase::Disconnected | SessionPhase::Disconnecting => {
                self.connect_waiters.push(reply);
                self.start_attempt(false);
            }
        }
    }

    fn start_attempt(&mut self, automatic: bool) {
        if automatic {
            info!(
                "Reconnecting to {} (attempt {}/{})",
                self.address, self.reconnect_attempt, self.policy.max_attempts
            );
        } else {
            info!("Connecting to {}", self.address);
        }

        let deadline = Instant::now() + self.connect_timeout;
        let transport = Arc::clone(&self.transport);
        let address = self.address.clone();
        let task = bounded(deadline, async move {
            transport.connect(&address).await.map_err(|e| match e {
                LionChiefError::ConnectFailed(_) => e,
                other => LionChiefError::ConnectFailed(other.to_string()),
            })
        });

        self.attempt = Some(Attempt {
            automatic,
            deadline,
            stage: AttemptStage::Connecting(task),
        });
        self.phase = SessionPhase::Connecting;
        self.publish();
    }

    async fn on_connected(&mut self, result: Result<ConnectionHandle>) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };

        match result {
            Ok(handle) => {
                debug!("Link {handle} open, discovering services");
                let task = bounded(
                    attempt.deadline,
                    discover(Arc::clone(&self.transport), handle, self.targets),
                );
                attempt.stage = AttemptStage::Discovering { handle, task };
                self.phase = SessionPhase::Discovering;
                self.publish();
            }
            Err(e) => self.attempt_failed(e).await,
        }
    }

    async fn on_established(&mut self, result: Result<Established>) {
        match result {
            Ok(Established { link, identity }) => {
                self.attempt = None;
                info!(
                    "Connected to {} ({} by {})",
                    self.address,
                    identity.model_or_default(),
                    identity.manufacturer_or_default()
                );

                self.link = Some(link);
                self.identity = identity;
                self.phase = SessionPhase::Ready;
                self.reconnect_attempt = 0;
                self.last_fault = None;
                self.publish();
                self.status.publish_identity(&self.identity);

                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) => self.attempt_failed(e).await,
        }
    }

    async fn attempt_failed(&mut self, error: LionChiefError) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        if let AttemptStage::Discovering { handle, .. } = attempt.stage {
            self.transport.disconnect(handle).await;
        }

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.duplicate()));
        }

        if attempt.automatic {
            warn!(
                "Reconnect attempt {} to {} failed: {}",
                self.reconnect_attempt, self.address, error
            );
            self.phase = SessionPhase::Reconnecting;
            self.schedule_reconnect();
        } else {
            error!("Failed to connect to {}: {}", self.address, error);
            self.phase = SessionPhase::Disconnected;
            self.last_fault = Some(SessionFault::from_error(&error));
            self.fail_queue(|| LionChiefError::SessionClosed);
        }
        self.publish();
    }

    async fn on_link_lost(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        warn!("Link to {} lost", self.address);
        let handle = link.handle;
        drop(link);

        if self.phase == SessionPhase::Ready {
            self.enter_reconnecting();
        }
        self.transport.disconnect(handle).await;
    }

    /// Called with the link already taken; publishes before any teardown
    fn enter_reconnecting(&mut self) {
        if let Some(op) = self.in_flight.take() {
            let _ = op.reply.send(Err(LionChiefError::WriteFailed {
                reason: "link lost".to_string(),
                link_lost: true,
            }));
        }

        self.identity = DeviceIdentity::default();
        self.phase = SessionPhase::Reconnecting;
        self.last_fault = Some(SessionFault::LinkLost);
        self.reconnect_attempt = 0;
        self.schedule_reconnect();
        self.publish();
    }

    /// Arm the timer for the next attempt, or give up; the caller publishes
    fn schedule_reconnect(&mut self) {
        let next = self.reconnect_attempt + 1;
        if next > self.policy.max_attempts {
            let attempts = self.reconnect_attempt;
            error!(
                "Giving up on {} after {} reconnect attempt(s)",
                self.address, attempts
            );
            self.phase = SessionPhase::Disconnected;
            self.reconnect_attempt = 0;
            self.reconnect_timer = None;
            self.last_fault = Some(SessionFault::ReconnectExhausted);
            self.fail_queue(|| LionChiefError::ReconnectExhausted { attempts });
            return;
        }

        let delay = self.policy.delay_for(next);
        debug!("Next reconnect to {} in {:?}", self.address, delay);
        self.reconnect_attempt = next;
        self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
    }

    async fn close(&mut self) {
        self.reconnect_timer = None;
        if let Some(attempt) = self.attempt.take() {
            if let AttemptStage::Discovering { handle, .. } = attempt.stage {
                self.transport.disconnect(handle).await;
            }
        }
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(LionChiefError::SessionClosed));
        }
        if let Some(op) = self.in_flight.take() {
            let _ = op.reply.send(Err(LionChiefError::SessionClosed));
        }
        self.fail_queue(|| LionChiefError::SessionClosed);

        if self.phase == SessionPhase::Disconnected {
            return;
        }

        self.phase = SessionPhase::Disconnecting;
        self.publish();

        if let Some(link) = self.link.take() {
            self.transport.disconnect(link.handle).await;
        }

        info!("Disconnected from {}", self.address);
        self.identity = DeviceIdentity::default();
        self.reconnect_attempt = 0;
        self.phase = SessionPhase::Disconnected;
        self.publish();
    }

    async fn refresh_identity(&mut self) -> Result<DeviceIdentity> {
        let (handle, available) = match self.link.as_ref() {
            Some(link) if self.phase == SessionPhase::Ready => {
                (link.handle, link.device_info.clone())
            }
            _ => return Err(LionChiefError::SessionClosed),
        };

        debug!("Refreshing identity of {}", self.address);
        let identity = identity::read_identity(self.transport.as_ref(), handle, &available).await;
        self.identity = identity.clone();
        self.publish();
        self.status.publish_identity(&identity);
        Ok(identity)
    }

    fn on_notification(&mut self, payload: &[u8]) {
        match protocol::decode(payload) {
            Ok(event) => {
                self.apply_notification(event);
                self.publish();
            }
            Err(e) => warn!("Dropping notification {:02X?}: {}", payload, e),
        }
    }

    fn apply_notification(&mut self, event: NotificationEvent) {
        match event {
            NotificationEvent::LocomotiveStatus {
                speed_percent,
                direction,
                lights_on,
                bell_on,
                ..
            } => {
                self.locomotive.speed_percent = speed_percent;
                self.locomotive.direction = direction;
                self.locomotive.lights_on = lights_on;
                self.locomotive.bell_on = bell_on;
            }
            NotificationEvent::Battery { percent } => {
                self.telemetry.battery_percent = Some(percent);
            }
            NotificationEvent::Temperature { celsius } => {
                self.telemetry.temperature_celsius = Some(celsius);
            }
            NotificationEvent::Voltage { volts } => {
                self.telemetry.voltage = Some(volts);
            }
        }
    }

    fn fail_queue(&mut self, error: impl Fn() -> LionChiefError) {
        for pending in self.queue.drain(..) {
            debug!("Dropping queued {}", pending.command);
            let _ = pending.reply.send(Err(error()));
        }
    }

    fn publish(&self) {
        self.status.publish(StatusSnapshot {
            connection: self.phase.connection_state(),
            phase: self.phase,
            identity: self.identity.clone(),
            locomotive: self.locomotive,
            telemetry: self.telemetry,
            reconnect_attempt: self.reconnect_attempt,
            last_fault: self.last_fault,
        });
    }
}

/// Bound a connect-path step by the attempt deadline
fn bounded<T: Send + 'static>(
    deadline: Instant,
    task: impl Future<Output = Result<T>> + Send + 'static,
) -> BoxFuture<'static, Result<T>> {
    async move {
        tokio::time::timeout_at(deadline, task)
            .await
            .unwrap_or_else(|_| {
                Err(LionChiefError::ConnectFailed(
                    "connect attempt timed out".to_string(),
                ))
            })
    }
    .boxed()
}

async fn discover(
    transport: Arc<dyn Transport>,
    handle: ConnectionHandle,
    targets: LinkTargets,
) -> Result<Established> {
    let services = transport
        .discover_services(handle)
        .await
        .map_err(|e| match e {
            LionChiefError::ServiceDiscoveryFailed(_) => e,
            other => LionChiefError::ServiceDiscoveryFailed(other.to_string()),
        })?;

    let characteristics = services.get(&targets.service).ok_or_else(|| {
        LionChiefError::ServiceDiscoveryFailed(format!("Service {} not found", targets.service))
    })?;
    for (uuid, role) in [(targets.write, "Write"), (targets.notify, "Notify")] {
        if !characteristics.contains(&uuid) {
            return Err(LionChiefError::ServiceDiscoveryFailed(format!(
                "{role} characteristic {uuid} not found"
            )));
        }
    }

    let (sink, notifications) = mpsc::unbounded_channel();
    transport
        .subscribe_notify(handle, targets.notify, sink)
        .await
        .map_err(|e| match e {
            LionChiefError::SubscribeFailed(_) => e,
            other => LionChiefError::SubscribeFailed(other.to_string()),
        })?;

    let (lost_tx, lost) = oneshot::channel();
    transport.on_disconnected(
        handle,
        Box::new(move || {
            let _ = lost_tx.send(());
        }),
    );

    let device_info = services
        .get(&targets.device_info)
        .cloned()
        .unwrap_or_default();
    if device_info.is_empty() {
        debug!("No Device Information Service on {handle}, identity left empty");
    }
    let identity = identity::read_identity(transport.as_ref(), handle, &device_info).await;

    Ok(Established {
        link: Link {
            handle,
            write_characteristic: targets.write,
            notifications: Some(notifications),
            lost,
            device_info,
        },
        identity,
    })
}

async fn write_done(in_flight: &mut Option<InFlight>) -> Result<()> {
    match in_flight {
        Some(op) => op.write.as_mut().await,
        None => pending().await,
    }
}

async fn attempt_progress(attempt: &mut Option<Attempt>) -> Event {
    match attempt.as_mut().map(|a| &mut a.stage) {
        Some(AttemptStage::Connecting(task)) => Event::Connected(task.as_mut().await),
        Some(AttemptStage::Discovering { task, .. }) => Event::Established(task.as_mut().await),
        None => pending().await,
    }
}

async fn link_event(link: &mut Option<Link>) -> Event {
    let Some(Link {
        notifications,
        lost,
        ..
    }) = link
    else {
        return pending().await;
    };

    let next_payload = async {
        match notifications.as_mut() {
            Some(rx) => rx.recv().await,
            None => pending().await,
        }
    };

    tokio::select! {
        payload = next_payload => match payload {
            Some(payload) => Event::Notification(payload),
            None => Event::NotificationsClosed,
        },
        _ = lost => Event::LinkLost,
    }
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}
