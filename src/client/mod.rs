//! Client entry point and configuration
//!
//! A [`Client`] attaches to a running driver through three files in the
//! driver's control directory:
//!
//! - `to-driver.rb` — many-to-one command ring, client to driver
//! - `to-clients.bc` — broadcast channel, driver to every client
//! - `counters.dat` — flat counter values, driver heartbeat at id 0
//!
//! Connecting spawns a conductor thread that services driver events, sends
//! keepalives and watches liveness. Blocking `add_*` calls service the
//! conductor themselves while waiting for their correlated response, so
//! they make progress even when the conductor thread is starved of the
//! lock.

pub mod conductor;
pub mod exclusive_publication;
pub mod image;
pub mod proxy;
pub mod publication;
pub mod subscription;

use crate::broadcast::CopyBroadcastReceiver;
use crate::buffer::mapped::MappedFile;
use crate::client::conductor::{ClientConductor, Registration, SubscriptionLink};
use crate::client::exclusive_publication::ExclusivePublication;
use crate::client::image::Image;
use crate::client::proxy::DriverProxy;
use crate::client::publication::Publication;
use crate::client::subscription::{ImageList, Subscription};
use crate::counters::CountersReader;
use crate::error::{ClientError, Result};
use crate::idle::{BackoffIdleStrategy, IdleStrategy, SleepingIdleStrategy};
use crate::ringbuffer::ManyToOneRingBuffer;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Command ring file within the control directory.
pub const CMD_FILE: &str = "to-driver.rb";
/// Broadcast channel file within the control directory.
pub const BROADCAST_FILE: &str = "to-clients.bc";
/// Counter values file within the control directory.
pub const COUNTERS_FILE: &str = "counters.dat";

/// Callback invoked on the conductor thread when the client faults.
pub type ErrorHandler = Box<dyn Fn(&ClientError) + Send>;
/// Callback invoked when an image joins a subscription.
pub type AvailableImageHandler = Box<dyn Fn(&Image) + Send>;
/// Callback invoked when an image leaves a subscription.
pub type UnavailableImageHandler = Box<dyn Fn(&Image) + Send>;

/// Milliseconds since the Unix epoch, the driver's clock domain.
pub fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Connection configuration.
pub struct Context {
    dir: PathBuf,
    driver_timeout: Duration,
    keepalive_interval: Duration,
    resource_linger: Duration,
    conductor_idle_interval: Duration,
    error_handler: Option<ErrorHandler>,
    on_available_image: Option<AvailableImageHandler>,
    on_unavailable_image: Option<UnavailableImageHandler>,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("termbus"),
            driver_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_millis(500),
            resource_linger: Duration::from_secs(3),
            conductor_idle_interval: Duration::from_millis(4),
            error_handler: None,
            on_available_image: None,
            on_unavailable_image: None,
        }
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver control directory.
    pub fn dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.dir = dir.as_ref().to_path_buf();
        self
    }

    /// Deadline for correlated responses and driver heartbeat staleness.
    pub fn driver_timeout(mut self, timeout: Duration) -> Self {
        self.driver_timeout = timeout;
        self
    }

    /// Interval between client keepalive commands.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// How long unmapped log buffers linger before release.
    pub fn resource_linger(mut self, linger: Duration) -> Self {
        self.resource_linger = linger;
        self
    }

    /// Sleep interval of the conductor thread between unproductive ticks.
    pub fn conductor_idle_interval(mut self, interval: Duration) -> Self {
        self.conductor_idle_interval = interval;
        self
    }

    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn on_available_image(mut self, handler: AvailableImageHandler) -> Self {
        self.on_available_image = Some(handler);
        self
    }

    pub fn on_unavailable_image(mut self, handler: UnavailableImageHandler) -> Self {
        self.on_unavailable_image = Some(handler);
        self
    }
}

pub(crate) struct ClientCore {
    pub(crate) conductor: Mutex<ClientConductor>,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) in_callback: Arc<AtomicBool>,
}

/// A counter allocated through the driver.
pub struct Counter {
    registration_id: i64,
    counter_id: i32,
    reader: CountersReader,
}

impl Counter {
    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn id(&self) -> i32 {
        self.counter_id
    }

    pub fn value(&self) -> i64 {
        self.reader.counter_value(self.counter_id)
    }
}

/// Handle to a connected client.
///
/// Dropping the client performs an orderly close: the driver is notified
/// and the conductor thread is joined.
pub struct Client {
    core: Arc<ClientCore>,
    conductor_thread: Option<std::thread::JoinHandle<()>>,
    driver_timeout: Duration,
}

impl Client {
    /// Attach to the driver whose control directory is named in `context`
    /// and start the conductor thread.
    pub fn connect(mut context: Context) -> Result<Self> {
        let command_file = MappedFile::map_existing(context.dir.join(CMD_FILE))?;
        let broadcast_file = MappedFile::map_existing(context.dir.join(BROADCAST_FILE))?;
        let counters_file = MappedFile::map_existing(context.dir.join(COUNTERS_FILE))?;

        let proxy = DriverProxy::new(ManyToOneRingBuffer::new(command_file.buffer())?);
        let receiver = CopyBroadcastReceiver::new(broadcast_file.buffer())?;
        let counters = CountersReader::new(counters_file.buffer());

        let running = Arc::new(AtomicBool::new(true));
        let in_callback = Arc::new(AtomicBool::new(false));
        let driver_timeout = context.driver_timeout;
        let idle_interval = context.conductor_idle_interval;

        let conductor = ClientConductor::new(
            proxy,
            receiver,
            counters,
            command_file,
            broadcast_file,
            counters_file,
            &mut context,
            Arc::clone(&in_callback),
            Arc::clone(&running),
        );

        let core = Arc::new(ClientCore {
            conductor: Mutex::new(conductor),
            running: Arc::clone(&running),
            in_callback,
        });

        let thread_core = Arc::clone(&core);
        let conductor_thread = std::thread::Builder::new()
            .name("termbus-client-conductor".to_string())
            .spawn(move || run_conductor(thread_core, idle_interval))
            .map_err(ClientError::Io)?;

        Ok(Self {
            core,
            conductor_thread: Some(conductor_thread),
            driver_timeout,
        })
    }

    /// Identity of this client toward the driver.
    pub fn client_id(&self) -> i64 {
        self.core.conductor.lock().client_id()
    }

    /// Reader over the driver's counter values.
    pub fn counters(&self) -> CountersReader {
        self.core.conductor.lock().counters()
    }

    fn check_entry(&self) -> Result<()> {
        if self.core.in_callback.load(Ordering::Acquire) {
            return Err(ClientError::Reentrancy);
        }
        if !self.core.running.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    /// Add a concurrent publication, blocking until the driver responds.
    pub fn add_publication(&self, channel: &str, stream_id: i32) -> Result<Publication> {
        let correlation_id = self.add_publication_async(channel, stream_id)?;
        match self.await_registration(correlation_id)? {
            Registration::ReadyPublication(event) => {
                self.core.conductor.lock().new_publication(channel, event)
            }
            other => Err(Self::unexpected(other)),
        }
    }

    /// Issue an add-publication command without waiting; pair with
    /// [`find_publication`](Client::find_publication).
    pub fn add_publication_async(&self, channel: &str, stream_id: i32) -> Result<i64> {
        self.check_entry()?;
        let mut conductor = self.core.conductor.lock();
        let correlation_id = conductor.proxy().add_publication(channel, stream_id)?;
        conductor.register_pending_publication(correlation_id, channel);
        Ok(correlation_id)
    }

    /// Complete an async add-publication. `Ok(None)` while still pending.
    pub fn find_publication(&self, correlation_id: i64) -> Result<Option<Publication>> {
        self.check_entry()?;
        let mut conductor = self.core.conductor.lock();
        conductor.service_events()?;
        match conductor.take_registration(correlation_id) {
            None => Ok(None),
            Some(registration) => {
                let channel = conductor
                    .take_pending_channel(correlation_id)
                    .unwrap_or_default();
                match registration {
                    Registration::ReadyPublication(event) => {
                        Ok(Some(conductor.new_publication(&channel, event)?))
                    }
                    other => Err(Self::unexpected(other)),
                }
            }
        }
    }

    /// Add an exclusive publication, blocking until the driver responds.
    pub fn add_exclusive_publication(
        &self,
        channel: &str,
        stream_id: i32,
    ) -> Result<ExclusivePublication> {
        self.check_entry()?;
        let correlation_id = {
            let mut conductor = self.core.conductor.lock();
            let id = conductor
                .proxy()
                .add_exclusive_publication(channel, stream_id)?;
            conductor.register_pending(id);
            id
        };

        match self.await_registration(correlation_id)? {
            Registration::ReadyExclusivePublication(event) => {
                let mut conductor = self.core.conductor.lock();
                let log = conductor.map_log_buffers(&event.log_file_name)?;
                let closed = Arc::new(AtomicBool::new(false));
                conductor.track_publication_flag(event.registration_id, Arc::clone(&closed));
                Ok(ExclusivePublication::new(
                    log,
                    &conductor.counters(),
                    event.position_limit_counter_id,
                    channel.to_string(),
                    event.stream_id,
                    event.session_id,
                    event.registration_id,
                    closed,
                ))
            }
            other => Err(Self::unexpected(other)),
        }
    }

    /// Add a subscription, blocking until the driver responds. Images may
    /// attach at any point afterwards (or already during the wait).
    pub fn add_subscription(&self, channel: &str, stream_id: i32) -> Result<Subscription> {
        self.check_entry()?;
        let images: ImageList = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let correlation_id = {
            let mut conductor = self.core.conductor.lock();
            let id = conductor.proxy().add_subscription(channel, stream_id)?;
            conductor.register_pending(id);
            // Linked before the response so image events are never dropped.
            conductor.register_subscription_link(
                id,
                SubscriptionLink {
                    images: Arc::clone(&images),
                    closed: Arc::clone(&closed),
                },
            );
            id
        };

        match self.await_registration(correlation_id) {
            Ok(Registration::ReadySubscription(event)) => Ok(Subscription::new(
                channel.to_string(),
                stream_id,
                correlation_id,
                event.channel_status_id,
                images,
                closed,
            )),
            Ok(other) => {
                self.core
                    .conductor
                    .lock()
                    .remove_subscription_link(correlation_id);
                Err(Self::unexpected(other))
            }
            Err(e) => {
                self.core
                    .conductor
                    .lock()
                    .remove_subscription_link(correlation_id);
                Err(e)
            }
        }
    }

    /// Allocate a counter, blocking until the driver responds.
    pub fn add_counter(&self, type_id: i32, label: &str) -> Result<Counter> {
        self.check_entry()?;
        let correlation_id = {
            let mut conductor = self.core.conductor.lock();
            let id = conductor.proxy().add_counter(type_id, label)?;
            conductor.register_pending(id);
            id
        };

        match self.await_registration(correlation_id)? {
            Registration::ReadyCounter { counter_id } => Ok(Counter {
                registration_id: correlation_id,
                counter_id,
                reader: self.core.conductor.lock().counters(),
            }),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Free a counter.
    pub fn remove_counter(&self, counter: Counter) -> Result<()> {
        self.check_entry()?;
        self.core
            .conductor
            .lock()
            .proxy()
            .remove_counter(counter.registration_id)?;
        Ok(())
    }

    /// Add a destination to an existing resource, blocking on completion.
    pub fn add_destination(&self, registration_id: i64, channel: &str) -> Result<()> {
        self.destination_command(registration_id, channel, true)
    }

    /// Remove a destination from an existing resource, blocking on
    /// completion.
    pub fn remove_destination(&self, registration_id: i64, channel: &str) -> Result<()> {
        self.destination_command(registration_id, channel, false)
    }

    fn destination_command(&self, registration_id: i64, channel: &str, add: bool) -> Result<()> {
        self.check_entry()?;
        let correlation_id = {
            let mut conductor = self.core.conductor.lock();
            let id = if add {
                conductor.proxy().add_destination(registration_id, channel)?
            } else {
                conductor
                    .proxy()
                    .remove_destination(registration_id, channel)?
            };
            conductor.register_pending(id);
            id
        };

        match self.await_registration(correlation_id)? {
            Registration::Done => Ok(()),
            other => Err(Self::unexpected(other)),
        }
    }

    /// Close a publication, releasing its mapping after the linger period.
    pub fn close_publication(&self, publication: Publication) -> Result<()> {
        self.check_entry()?;
        self.core
            .conductor
            .lock()
            .close_publication(publication.registration_id(), publication.log_buffers())
    }

    /// Close an exclusive publication.
    pub fn close_exclusive_publication(&self, publication: ExclusivePublication) -> Result<()> {
        self.check_entry()?;
        self.core
            .conductor
            .lock()
            .close_publication(publication.registration_id(), publication.log_buffers())
    }

    /// Close a subscription and all of its images.
    pub fn close_subscription(&self, subscription: Subscription) -> Result<()> {
        self.check_entry()?;
        self.core
            .conductor
            .lock()
            .close_subscription(subscription.registration_id())
    }

    /// Orderly shutdown; also performed on drop.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.conductor_thread.take() {
            self.core.conductor.lock().close();
            let _ = handle.join();
        }
    }

    fn await_registration(&self, correlation_id: i64) -> Result<Registration> {
        let deadline = Instant::now() + self.driver_timeout;
        let mut idle = BackoffIdleStrategy::default();

        loop {
            {
                let mut conductor = self.core.conductor.lock();
                conductor.service_events()?;
                if let Some(registration) = conductor.take_registration(correlation_id) {
                    conductor.take_pending_channel(correlation_id);
                    if let Registration::Errored { code, message } = registration {
                        return Err(ClientError::Registration { code, message });
                    }
                    return Ok(registration);
                }
            }

            if Instant::now() >= deadline {
                self.core.conductor.lock().cancel_pending(correlation_id);
                return Err(ClientError::DriverTimeout(format!(
                    "no response for correlation {} within {:?}",
                    correlation_id, self.driver_timeout
                )));
            }
            idle.idle(0);
        }
    }

    fn unexpected(registration: Registration) -> ClientError {
        match registration {
            Registration::Errored { code, message } => ClientError::Registration { code, message },
            _ => ClientError::Registration {
                code: -1,
                message: "unexpected response type for command".to_string(),
            },
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_conductor(core: Arc<ClientCore>, idle_interval: Duration) {
    let mut idle = SleepingIdleStrategy::new(idle_interval);
    while core.running.load(Ordering::Acquire) {
        let work = {
            let mut conductor = core.conductor.lock();
            match conductor.do_work() {
                Ok(work) => work,
                // do_work force-closed already; nothing left to service.
                Err(_) => break,
            }
        };
        idle.idle(work);
    }
}
