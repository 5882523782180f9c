//! Client conductor: the control-plane state machine
//!
//! All control-plane state lives behind one advisory lock: the conductor
//! thread takes it to service driver events and liveness duties, and
//! blocking registration calls take it to poll for their correlated
//! response. Data-path handles (publications, images) never touch the lock.
//!
//! Liveness faults are fatal to the whole client: a stale driver heartbeat,
//! an overrun service interval, or a driver-issued client timeout all
//! force-close every resource before the fault is reported.

use crate::broadcast::CopyBroadcastReceiver;
use crate::buffer::mapped::{LogBuffers, MappedFile};
use crate::client::image::Image;
use crate::client::proxy::DriverProxy;
use crate::client::publication::Publication;
use crate::client::subscription::ImageList;
use crate::client::{
    epoch_ms, AvailableImageHandler, Context, ErrorHandler, UnavailableImageHandler,
};
use crate::command::{
    self, AvailableImageEvent, ClientTimeoutEvent, CounterUpdateEvent, ErrorEvent,
    OperationSuccessEvent, PublicationReadyEvent, SubscriptionReadyEvent, UnavailableImageEvent,
};
use crate::counters::CountersReader;
use crate::error::{ClientError, Result};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

const EVENTS_PER_SERVICE: usize = 10;

/// Clears the reentrancy flag when a callback scope ends, panic or not.
struct CallbackGuard<'a>(&'a AtomicBool);

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Terminal or pending state of one correlated command.
pub(crate) enum Registration {
    Pending,
    ReadyPublication(PublicationReadyEvent),
    ReadyExclusivePublication(PublicationReadyEvent),
    ReadySubscription(SubscriptionReadyEvent),
    ReadyCounter { counter_id: i32 },
    Done,
    Errored { code: i32, message: String },
}

/// Conductor-side record of a subscription, shared with its handle.
pub(crate) struct SubscriptionLink {
    pub(crate) images: ImageList,
    pub(crate) closed: Arc<AtomicBool>,
}

pub struct ClientConductor {
    proxy: DriverProxy,
    receiver: CopyBroadcastReceiver,
    counters: CountersReader,
    // Mappings stay alive as long as the conductor does.
    _command_file: MappedFile,
    _broadcast_file: MappedFile,
    _counters_file: MappedFile,
    registrations: HashMap<i64, Registration>,
    subscriptions: HashMap<i64, SubscriptionLink>,
    publication_flags: HashMap<i64, Arc<AtomicBool>>,
    // Channels of in-flight add-publication commands, for the async path.
    pending_channels: HashMap<i64, String>,
    log_cache: HashMap<String, Weak<LogBuffers>>,
    lingering: Vec<(Instant, Arc<LogBuffers>)>,
    driver_timeout: Duration,
    keepalive_interval: Duration,
    resource_linger: Duration,
    last_keepalive: Instant,
    last_service: Instant,
    error_handler: Option<ErrorHandler>,
    on_available_image: Option<AvailableImageHandler>,
    on_unavailable_image: Option<UnavailableImageHandler>,
    in_callback: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    closed: bool,
}

impl ClientConductor {
    pub(crate) fn new(
        proxy: DriverProxy,
        receiver: CopyBroadcastReceiver,
        counters: CountersReader,
        command_file: MappedFile,
        broadcast_file: MappedFile,
        counters_file: MappedFile,
        context: &mut Context,
        in_callback: Arc<AtomicBool>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let now = Instant::now();
        Self {
            proxy,
            receiver,
            counters,
            _command_file: command_file,
            _broadcast_file: broadcast_file,
            _counters_file: counters_file,
            registrations: HashMap::new(),
            subscriptions: HashMap::new(),
            publication_flags: HashMap::new(),
            pending_channels: HashMap::new(),
            log_cache: HashMap::new(),
            lingering: Vec::new(),
            driver_timeout: context.driver_timeout,
            keepalive_interval: context.keepalive_interval,
            resource_linger: context.resource_linger,
            last_keepalive: now,
            last_service: now,
            error_handler: context.error_handler.take(),
            on_available_image: context.on_available_image.take(),
            on_unavailable_image: context.on_unavailable_image.take(),
            in_callback,
            running,
            closed: false,
        }
    }

    pub fn client_id(&self) -> i64 {
        self.proxy.client_id()
    }

    pub(crate) fn proxy(&self) -> &DriverProxy {
        &self.proxy
    }

    pub(crate) fn counters(&self) -> CountersReader {
        self.counters
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn register_pending(&mut self, correlation_id: i64) {
        self.registrations.insert(correlation_id, Registration::Pending);
    }

    /// Register a pending add-publication, keeping its channel so the
    /// handle can be built with it once the response arrives.
    pub(crate) fn register_pending_publication(&mut self, correlation_id: i64, channel: &str) {
        self.registrations.insert(correlation_id, Registration::Pending);
        self.pending_channels
            .insert(correlation_id, channel.to_string());
    }

    pub(crate) fn take_pending_channel(&mut self, correlation_id: i64) -> Option<String> {
        self.pending_channels.remove(&correlation_id)
    }

    pub(crate) fn cancel_pending(&mut self, correlation_id: i64) {
        self.registrations.remove(&correlation_id);
        self.pending_channels.remove(&correlation_id);
    }

    /// Remove and return a completed registration; pending entries stay.
    pub(crate) fn take_registration(&mut self, correlation_id: i64) -> Option<Registration> {
        if matches!(
            self.registrations.get(&correlation_id),
            Some(Registration::Pending) | None
        ) {
            return None;
        }
        self.registrations.remove(&correlation_id)
    }

    pub(crate) fn register_subscription_link(
        &mut self,
        registration_id: i64,
        link: SubscriptionLink,
    ) {
        self.subscriptions.insert(registration_id, link);
    }

    pub(crate) fn remove_subscription_link(&mut self, registration_id: i64) {
        self.subscriptions.remove(&registration_id);
    }

    /// Map a log buffer file, sharing an existing mapping when one is live.
    pub(crate) fn map_log_buffers(&mut self, file_name: &str) -> Result<Arc<LogBuffers>> {
        if let Some(existing) = self.log_cache.get(file_name).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let log = Arc::new(LogBuffers::map(file_name)?);
        self.log_cache
            .insert(file_name.to_string(), Arc::downgrade(&log));
        Ok(log)
    }

    /// Build the handle for a ready publication.
    pub(crate) fn new_publication(
        &mut self,
        channel: &str,
        event: PublicationReadyEvent,
    ) -> Result<Publication> {
        let log = self.map_log_buffers(&event.log_file_name)?;
        let closed = Arc::new(AtomicBool::new(false));
        self.publication_flags
            .insert(event.registration_id, Arc::clone(&closed));
        Ok(Publication::new(
            log,
            &self.counters,
            event.position_limit_counter_id,
            channel.to_string(),
            event.stream_id,
            event.session_id,
            event.registration_id,
            closed,
        ))
    }

    pub(crate) fn track_publication_flag(
        &mut self,
        registration_id: i64,
        closed: Arc<AtomicBool>,
    ) {
        self.publication_flags.insert(registration_id, closed);
    }

    /// Close a publication: mark its handle closed, release the mapping
    /// after the linger period and tell the driver.
    pub(crate) fn close_publication(
        &mut self,
        registration_id: i64,
        log: Arc<LogBuffers>,
    ) -> Result<()> {
        if let Some(flag) = self.publication_flags.remove(&registration_id) {
            flag.store(true, Ordering::Release);
        }
        self.linger(log);
        self.proxy.remove_publication(registration_id)?;
        Ok(())
    }

    /// Close a subscription and every image under it.
    pub(crate) fn close_subscription(&mut self, registration_id: i64) -> Result<()> {
        if let Some(link) = self.subscriptions.remove(&registration_id) {
            link.closed.store(true, Ordering::Release);
            let images = std::mem::take(&mut *link.images.lock());
            for image in images {
                image.close();
                let log = image.log_buffers();
                self.linger(log);
            }
        }
        self.proxy.remove_subscription(registration_id)?;
        Ok(())
    }

    fn linger(&mut self, log: Arc<LogBuffers>) {
        self.lingering
            .push((Instant::now() + self.resource_linger, log));
    }

    /// One conductor tick: events, keepalive, liveness, linger sweep.
    pub(crate) fn do_work(&mut self) -> Result<usize> {
        if self.closed {
            return Ok(0);
        }

        let now = Instant::now();
        if now.duration_since(self.last_service) > self.keepalive_interval + self.driver_timeout {
            return Err(self.fatal(ClientError::ConductorServiceTimeout(format!(
                "{:?} since last service",
                now.duration_since(self.last_service)
            ))));
        }

        let work = self.service_events()?;

        if now.duration_since(self.last_keepalive) >= self.keepalive_interval {
            let heartbeat = self.counters.driver_heartbeat_ms();
            if heartbeat != 0 && epoch_ms() - heartbeat > self.driver_timeout.as_millis() as i64 {
                return Err(self.fatal(ClientError::DriverTimeout(format!(
                    "driver heartbeat stale by {} ms",
                    epoch_ms() - heartbeat
                ))));
            }
            if let Err(e) = self.proxy.keepalive() {
                return Err(self.fatal(e));
            }
            self.last_keepalive = now;
        }

        self.lingering.retain(|(deadline, _)| *deadline > now);

        Ok(work)
    }

    /// Drain and dispatch pending driver events.
    pub(crate) fn service_events(&mut self) -> Result<usize> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        self.last_service = Instant::now();

        let mut work = 0;
        for _ in 0..EVENTS_PER_SERVICE {
            // Copy out so dispatch can borrow the conductor mutably.
            let event = match self.receiver.receive() {
                Ok(Some((type_id, payload))) => (type_id, payload.to_vec()),
                Ok(None) => break,
                Err(e) => return Err(self.fatal(e)),
            };
            if let Err(e) = self.dispatch(event.0, &event.1) {
                return Err(self.fatal(e));
            }
            work += 1;
        }
        Ok(work)
    }

    fn dispatch(&mut self, type_id: i32, payload: &[u8]) -> Result<()> {
        match type_id {
            command::ON_PUBLICATION_READY => {
                let event = PublicationReadyEvent::decode(payload)?;
                self.complete(event.correlation_id, Registration::ReadyPublication(event));
            }
            command::ON_EXCLUSIVE_PUBLICATION_READY => {
                let event = PublicationReadyEvent::decode(payload)?;
                self.complete(
                    event.correlation_id,
                    Registration::ReadyExclusivePublication(event),
                );
            }
            command::ON_SUBSCRIPTION_READY => {
                let event = SubscriptionReadyEvent::decode(payload)?;
                self.complete(event.correlation_id, Registration::ReadySubscription(event));
            }
            command::ON_OPERATION_SUCCESS => {
                let event = OperationSuccessEvent::decode(payload)?;
                self.complete(event.correlation_id, Registration::Done);
            }
            command::ON_COUNTER_READY => {
                let event = CounterUpdateEvent::decode(payload)?;
                self.complete(
                    event.correlation_id,
                    Registration::ReadyCounter {
                        counter_id: event.counter_id,
                    },
                );
            }
            command::ON_UNAVAILABLE_COUNTER => {
                let event = CounterUpdateEvent::decode(payload)?;
                debug!("counter {} unavailable", event.counter_id);
            }
            command::ON_ERROR => {
                let event = ErrorEvent::decode(payload)?;
                self.complete(
                    event.offending_correlation_id,
                    Registration::Errored {
                        code: event.error_code,
                        message: event.message,
                    },
                );
            }
            command::ON_AVAILABLE_IMAGE => {
                let event = AvailableImageEvent::decode(payload)?;
                self.on_image_available(event)?;
            }
            command::ON_UNAVAILABLE_IMAGE => {
                let event = UnavailableImageEvent::decode(payload)?;
                self.on_image_unavailable(event);
            }
            command::ON_CLIENT_TIMEOUT => {
                let event = ClientTimeoutEvent::decode(payload)?;
                if event.client_id == self.proxy.client_id() {
                    return Err(ClientError::ClientTimeout);
                }
            }
            unknown => {
                warn!("ignoring unknown driver event type {:#x}", unknown);
            }
        }
        Ok(())
    }

    /// Record a completion only for commands this client issued; the
    /// broadcast channel carries every client's responses.
    fn complete(&mut self, correlation_id: i64, result: Registration) {
        if let std::collections::hash_map::Entry::Occupied(mut entry) =
            self.registrations.entry(correlation_id)
        {
            entry.insert(result);
        }
    }

    fn on_image_available(&mut self, event: AvailableImageEvent) -> Result<()> {
        let (images, closed) = match self.subscriptions.get(&event.subscription_registration_id) {
            Some(link) => (Arc::clone(&link.images), Arc::clone(&link.closed)),
            None => return Ok(()),
        };
        if closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let log = self.map_log_buffers(&event.log_file_name)?;
        let image = Arc::new(Image::new(
            log,
            &self.counters,
            event.subscriber_position_id,
            event.session_id,
            event.correlation_id,
            event.source_identity,
        ));
        images.lock().push(Arc::clone(&image));

        if let Some(handler) = &self.on_available_image {
            self.run_handler(|| handler(&image));
        }
        Ok(())
    }

    fn on_image_unavailable(&mut self, event: UnavailableImageEvent) {
        let images = match self.subscriptions.get(&event.subscription_registration_id) {
            Some(link) => Arc::clone(&link.images),
            None => return,
        };

        let removed = {
            let mut images = images.lock();
            match images
                .iter()
                .position(|image| image.correlation_id() == event.correlation_id)
            {
                Some(index) => Some(images.remove(index)),
                None => None,
            }
        };

        if let Some(image) = removed {
            image.close();
            let log = image.log_buffers();
            self.linger(log);

            if let Some(handler) = &self.on_unavailable_image {
                self.run_handler(|| handler(&image));
            }
        }
    }

    /// Run a user callback with the reentrancy flag held for its duration.
    /// The flag is cleared even when the handler panics, and the panic is
    /// contained and reported instead of unwinding into the conductor.
    fn run_handler(&self, body: impl FnOnce()) {
        let outcome = {
            self.in_callback.store(true, Ordering::Release);
            let _guard = CallbackGuard(&self.in_callback);
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(body))
        };
        if let Err(payload) = outcome {
            let error = ClientError::HandlerPanic(panic_message(payload.as_ref()));
            error!("{}", error);
            self.report_error(&error);
        }
    }

    /// Report through the error handler, containing any panic it raises.
    fn report_error(&self, error: &ClientError) {
        if let Some(handler) = &self.error_handler {
            self.in_callback.store(true, Ordering::Release);
            let _guard = CallbackGuard(&self.in_callback);
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(error))).is_err() {
                error!("error handler panicked while reporting: {}", error);
            }
        }
    }

    /// Force-close every resource and report `error`; returns it for
    /// propagation. Terminal: the client is unusable afterwards.
    fn fatal(&mut self, error: ClientError) -> ClientError {
        error!("client force-closed: {}", error);
        self.close_all_resources();
        self.fail_pending(&error);
        self.report_error(&error);
        error
    }

    /// Orderly shutdown: notify the driver, then close everything.
    pub(crate) fn close(&mut self) {
        if self.closed {
            return;
        }
        debug!("closing client {}", self.proxy.client_id());
        if let Err(e) = self.proxy.client_close() {
            warn!("client close notification failed: {}", e);
        }
        self.close_all_resources();
        self.fail_pending(&ClientError::Closed);
    }

    fn close_all_resources(&mut self) {
        self.closed = true;
        self.running.store(false, Ordering::Release);

        for flag in self.publication_flags.values() {
            flag.store(true, Ordering::Release);
        }
        self.publication_flags.clear();

        for link in self.subscriptions.values() {
            link.closed.store(true, Ordering::Release);
            for image in link.images.lock().iter() {
                image.close();
            }
        }
        self.subscriptions.clear();
        self.lingering.clear();
    }

    fn fail_pending(&mut self, error: &ClientError) {
        for registration in self.registrations.values_mut() {
            if matches!(registration, Registration::Pending) {
                *registration = Registration::Errored {
                    code: -1,
                    message: error.to_string(),
                };
            }
        }
    }
}
