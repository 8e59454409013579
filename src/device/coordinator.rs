use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::commands::{ClientCommand, ServerMessage};
use crate::profile::ProfileStore;
use crate::serial::{Connector, DeviceLink};
use crate::session::SessionRegistry;
use super::{ConnectionState, Defaults, DeviceError, LinkStatus, Result};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub profiles_path: PathBuf,
    pub poll_interval: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            profiles_path: PathBuf::from("profiles.txt"),
            poll_interval: Duration::from_millis(10),
            reconnect_backoff: Duration::from_secs(1),
        }
    }
}

/// Read-only view of the coordinator shared with the HTTP handlers
#[derive(Clone)]
pub struct BridgeState {
    registry: Arc<SessionRegistry>,
    defaults: watch::Receiver<Option<Defaults>>,
    status: watch::Receiver<LinkStatus>,
}

impl BridgeState {
    /// Profiles and thresholds of the synced device, `None` while it is unavailable
    pub fn defaults(&self) -> Option<Defaults> {
        self.defaults.borrow().clone()
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn is_available(&self) -> bool {
        self.defaults.borrow().is_some()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn subscribe_defaults(&self) -> watch::Receiver<Option<Defaults>> {
        self.defaults.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.status.clone()
    }
}

/// Owns the device link and the profile store, and is the only task that
/// touches either. Connects, syncs profile thresholds onto the device,
/// then serves polls and client commands until the link fails, at which
/// point every client is dropped and the cycle starts over.
pub struct Coordinator {
    connector: Arc<dyn Connector>,
    registry: Arc<SessionRegistry>,
    config: CoordinatorConfig,
    defaults_tx: watch::Sender<Option<Defaults>>,
    status_tx: watch::Sender<LinkStatus>,
}

impl Coordinator {
    pub fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<SessionRegistry>,
        config: CoordinatorConfig,
    ) -> (Self, BridgeState) {
        let (defaults_tx, defaults_rx) = watch::channel(None);
        let (status_tx, status_rx) = watch::channel(LinkStatus::new(connector.describe()));

        let state = BridgeState {
            registry: registry.clone(),
            defaults: defaults_rx,
            status: status_rx,
        };
        let coordinator = Self {
            connector,
            registry,
            config,
            defaults_tx,
            status_tx,
        };
        (coordinator, state)
    }

    /// Run until `shutdown` becomes true (or its sender goes away).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        log::info!("Coordinator starting on {}", self.connector.describe());

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let mut link = match DeviceLink::open(self.connector.as_ref()).await {
                Ok(link) => link,
                Err(e) => {
                    log::error!("Failed to open {}: {}", self.connector.describe(), e);
                    self.set_state(ConnectionState::Disconnected);
                    if self.backoff(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(ConnectionState::Syncing);
            let outcome = match self.sync(&mut link).await {
                Ok(mut store) => self.run_steady(&mut link, &mut store, &mut shutdown).await,
                Err(e) => Err(e),
            };

            self.teardown(Some(link)).await;
            match outcome {
                Ok(()) => break,
                Err(e) => log::error!("Device link lost: {}", e),
            }

            if self.backoff(&mut shutdown).await {
                break;
            }
        }

        self.teardown(None).await;
        log::info!("Coordinator stopped");
    }

    /// Learn the sensor count, load profiles for it and push the current
    /// profile onto the device. The device's echo is what gets stored.
    async fn sync(&self, link: &mut DeviceLink) -> Result<ProfileStore> {
        let device_thresholds = link.get_thresholds().await?;
        let sensor_count = link
            .sensor_count()
            .filter(|count| *count > 0)
            .ok_or(DeviceError::NoSensors)?;
        log::info!("Device thresholds on connect: {:?}", device_thresholds);
        self.status_tx.send_modify(|status| status.sensor_count = Some(sensor_count));

        let mut store = ProfileStore::new(&self.config.profiles_path, sensor_count);
        match store.load() {
            Ok(count) => log::info!("Loaded {} profiles from {}", count, store.path().display()),
            Err(e) => log::error!(
                "Failed to load profiles from {}, changes will not be saved: {}",
                store.path().display(),
                e
            ),
        }

        let echo = link.update_thresholds(store.current_thresholds()).await?;
        fold_echo(&mut store, &echo);

        // Nothing queued before the device was ready refers to this store.
        self.registry.discard_pending().await;
        self.publish_defaults(&store);
        self.set_state(ConnectionState::Steady);
        log::info!(
            "Device on {} ready with profile {:?}",
            link.port_name(),
            store.current_profile()
        );

        self.registry.broadcast(ServerMessage::Thresholds(echo)).await;
        self.registry
            .broadcast(ServerMessage::CurrentProfile(store.current_profile().to_string()))
            .await;
        Ok(store)
    }

    async fn run_steady(
        &self,
        link: &mut DeviceLink,
        store: &mut ProfileStore,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_requested(shutdown) => return Ok(()),
                command = self.registry.receive_next() => match command {
                    Some(command) => self.handle_command(link, store, command).await?,
                    None => return Ok(()),
                },
                _ = poll.tick() => {
                    if self.registry.has_clients().await {
                        let values = link.get_values().await?;
                        self.registry.broadcast(ServerMessage::Values(values)).await;
                    }
                }
            }
        }
    }

    /// Apply one client command. Bad arguments are logged and skipped; only
    /// link failures come back as errors.
    async fn handle_command(
        &self,
        link: &mut DeviceLink,
        store: &mut ProfileStore,
        command: ClientCommand,
    ) -> Result<()> {
        log::debug!("Handling {:?}", command);

        match command {
            ClientCommand::UpdateThreshold { values, index } => {
                let Some(&value) = values.get(index) else {
                    log::warn!("Ignoring update_threshold: index {} outside {:?}", index, values);
                    return Ok(());
                };
                if index >= store.sensor_count() {
                    log::warn!(
                        "Ignoring update_threshold: index {} but device has {} sensors",
                        index,
                        store.sensor_count()
                    );
                    return Ok(());
                }

                let echo = link.update_threshold(index, value).await?;
                fold_echo(store, &echo);
                self.registry.broadcast(ServerMessage::Thresholds(echo)).await;
            }
            ClientCommand::AddProfile { name, thresholds } => {
                match store.add_profile(&name, thresholds) {
                    Ok(()) => log::info!("Added profile {:?}", name),
                    Err(e) if e.is_persistence() => {
                        log::error!("Profile {:?} added but not saved: {}", name, e)
                    }
                    Err(e) => {
                        log::warn!("Ignoring add_profile {:?}: {}", name, e);
                        return Ok(());
                    }
                }
                self.apply_current(link, store).await?;
                self.broadcast_profiles(store).await;
            }
            ClientCommand::RemoveProfile { name } => {
                match store.remove_profile(&name) {
                    Ok(true) => {}
                    Ok(false) => {
                        log::warn!("Ignoring remove_profile: no profile named {:?}", name);
                        return Ok(());
                    }
                    Err(e) => log::error!("Profile {:?} removed but not saved: {}", name, e),
                }
                self.apply_current(link, store).await?;
                self.broadcast_profiles(store).await;
            }
            ClientCommand::ChangeProfile { name } => {
                if !store.change_profile(&name) {
                    log::warn!("Ignoring change_profile: no profile named {:?}", name);
                    return Ok(());
                }
                let echo = self.apply_current(link, store).await?;
                self.registry
                    .broadcast(ServerMessage::CurrentProfile(store.current_profile().to_string()))
                    .await;
                self.registry.broadcast(ServerMessage::Thresholds(echo)).await;
            }
        }

        self.publish_defaults(store);
        Ok(())
    }

    /// Push the current profile's thresholds onto the device and keep its echo
    async fn apply_current(&self, link: &mut DeviceLink, store: &mut ProfileStore) -> Result<Vec<i32>> {
        let echo = link.update_thresholds(store.current_thresholds()).await?;
        fold_echo(store, &echo);
        Ok(echo)
    }

    async fn broadcast_profiles(&self, store: &ProfileStore) {
        self.registry.broadcast(ServerMessage::Profiles(store.profile_names())).await;
        self.registry
            .broadcast(ServerMessage::CurrentProfile(store.current_profile().to_string()))
            .await;
        self.registry
            .broadcast(ServerMessage::Thresholds(store.current_thresholds().to_vec()))
            .await;
    }

    fn publish_defaults(&self, store: &ProfileStore) {
        self.defaults_tx.send_replace(Some(Defaults::from_store(store)));
    }

    fn set_state(&self, state: ConnectionState) {
        self.status_tx.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            log::info!("Device link {:?} -> {:?}", status.state, state);
            status.transition(state);
            true
        });
    }

    /// Close the link, mark the device unavailable and drop every client.
    async fn teardown(&self, link: Option<DeviceLink>) {
        if let Some(link) = link {
            link.close().await;
        }
        self.defaults_tx.send_replace(None);
        self.set_state(ConnectionState::Disconnected);
        self.registry.disconnect_all().await;
    }

    /// Wait out the reconnect backoff. Returns true if shutdown was requested.
    async fn backoff(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.reconnect_backoff) => false,
            _ = shutdown_requested(shutdown) => true,
        }
    }
}

/// Resolves once the shutdown flag is set or its sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// The device clamps what it is sent; whatever it echoes becomes the profile.
fn fold_echo(store: &mut ProfileStore, echo: &[i32]) {
    if store.current_thresholds() != echo {
        log::info!(
            "Device adjusted thresholds {:?} -> {:?}",
            store.current_thresholds(),
            echo
        );
    }
    if let Err(e) = store.update_thresholds(echo) {
        log::error!("Failed to store device thresholds: {}", e);
    }
}
