use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use fsr_bridge_lib::commands::{ClientCommand, ServerMessage};
use fsr_bridge_lib::device::{BridgeState, ConnectionState, Coordinator, CoordinatorConfig, Defaults};
use fsr_bridge_lib::serial::{EmulatorConnector, EmulatorHandle};
use fsr_bridge_lib::session::{Session, SessionRegistry};

struct Bridge {
    handle: EmulatorHandle,
    state: BridgeState,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    dir: TempDir,
}

impl Bridge {
    fn start(handle: EmulatorHandle, profiles: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let profiles_path = dir.path().join("profiles.txt");
        if let Some(contents) = profiles {
            fs::write(&profiles_path, contents).unwrap();
        }

        let connector = Arc::new(EmulatorConnector::new(handle.clone(), Duration::from_millis(20)));
        let config = CoordinatorConfig {
            profiles_path,
            poll_interval: Duration::from_millis(20),
            reconnect_backoff: Duration::from_millis(20),
        };
        let (coordinator, state) = Coordinator::new(connector, Arc::new(SessionRegistry::new()), config);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(coordinator.run(shutdown_rx));

        Self { handle, state, shutdown, task, dir }
    }

    fn profiles_file(&self) -> String {
        fs::read_to_string(self.dir.path().join("profiles.txt")).unwrap()
    }

    async fn synced(&self) -> Defaults {
        wait_until("device sync", || self.state.defaults().is_some()).await;
        self.state.defaults().unwrap()
    }

    async fn submit(&self, command: ClientCommand) {
        assert!(self.state.registry().submit(command).await);
    }

    async fn stop(self) {
        self.shutdown.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("coordinator did not stop")
            .unwrap();
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Next message other than a sensor value update
async fn next_event(session: &mut Session) -> Option<ServerMessage> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), session.outbound.recv())
            .await
            .expect("no message from bridge");
        match message {
            Some(ServerMessage::Values(_)) => continue,
            other => return other,
        }
    }
}

#[tokio::test]
async fn test_add_profile_persists_applies_and_broadcasts() {
    let bridge = Bridge::start(EmulatorHandle::new(4), None);
    let defaults = bridge.synced().await;
    assert_eq!(defaults.cur_profile, "");
    assert!(defaults.profiles.is_empty());

    let mut session = bridge.state.registry().register().await;
    let writes_before = bridge.handle.threshold_writes();

    bridge
        .submit(ClientCommand::AddProfile {
            name: "fast".into(),
            thresholds: vec![100, 200, 150, 175],
        })
        .await;

    assert_eq!(next_event(&mut session).await, Some(ServerMessage::Profiles(vec!["fast".into()])));
    assert_eq!(next_event(&mut session).await, Some(ServerMessage::CurrentProfile("fast".into())));
    assert_eq!(
        next_event(&mut session).await,
        Some(ServerMessage::Thresholds(vec![100, 200, 150, 175]))
    );

    assert_eq!(bridge.handle.threshold_writes(), writes_before + 4);
    assert_eq!(bridge.handle.thresholds(), vec![100, 200, 150, 175]);
    assert_eq!(bridge.profiles_file(), "fast 100 200 150 175\n");
    wait_until("defaults update", || {
        bridge.state.defaults().map(|d| d.cur_profile == "fast").unwrap_or(false)
    })
    .await;

    bridge.stop().await;
}

#[tokio::test]
async fn test_device_clamping_wins_on_sync() {
    let bridge = Bridge::start(EmulatorHandle::new(4), Some("p1 100 2000 100 100\n"));
    let defaults = bridge.synced().await;

    assert_eq!(defaults.cur_profile, "p1");
    assert_eq!(defaults.profiles, vec!["p1"]);
    assert_eq!(defaults.thresholds, vec![100, 1023, 100, 100]);
    assert_eq!(bridge.handle.thresholds(), vec![100, 1023, 100, 100]);
    assert_eq!(bridge.profiles_file(), "p1 100 1023 100 100\n");
    assert_eq!(bridge.state.status().sensor_count, Some(4));

    bridge.stop().await;
}

#[tokio::test]
async fn test_sync_keeps_profiles_around_non_utf8_line() {
    let handle = EmulatorHandle::new(4);
    let dir = tempfile::tempdir().unwrap();
    let profiles_path = dir.path().join("profiles.txt");
    fs::write(
        &profiles_path,
        b"fast 100 200 150 175\nslow 400 400 400 400\ncaf\xe9 1 2 3 4\n",
    )
    .unwrap();

    let connector = Arc::new(EmulatorConnector::new(handle.clone(), Duration::from_millis(20)));
    let config = CoordinatorConfig {
        profiles_path: profiles_path.clone(),
        poll_interval: Duration::from_millis(20),
        reconnect_backoff: Duration::from_millis(20),
    };
    let (coordinator, state) = Coordinator::new(connector, Arc::new(SessionRegistry::new()), config);
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(coordinator.run(shutdown_rx));

    wait_until("device sync", || state.defaults().is_some()).await;
    let defaults = state.defaults().unwrap();
    assert_eq!(defaults.profiles, vec!["fast", "slow"]);
    assert_eq!(defaults.cur_profile, "fast");
    assert_eq!(defaults.thresholds, vec![100, 200, 150, 175]);
    assert_eq!(handle.thresholds(), vec![100, 200, 150, 175]);
    assert_eq!(
        fs::read_to_string(&profiles_path).unwrap(),
        "fast 100 200 150 175\nslow 400 400 400 400\n"
    );

    shutdown.send_replace(true);
    task.await.unwrap();
}

#[tokio::test]
async fn test_sync_with_unreadable_profile_file_does_not_clobber_it() {
    let handle = EmulatorHandle::new(2);
    let dir = tempfile::tempdir().unwrap();
    // A directory in place of the profile file: it exists but can't be read.
    let profiles_path = dir.path().join("profiles.txt");
    fs::create_dir(&profiles_path).unwrap();

    let connector = Arc::new(EmulatorConnector::new(handle.clone(), Duration::from_millis(20)));
    let config = CoordinatorConfig {
        profiles_path: profiles_path.clone(),
        poll_interval: Duration::from_millis(20),
        reconnect_backoff: Duration::from_millis(20),
    };
    let (coordinator, state) = Coordinator::new(connector, Arc::new(SessionRegistry::new()), config);
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(coordinator.run(shutdown_rx));

    wait_until("device sync", || state.defaults().is_some()).await;
    assert!(state
        .registry()
        .submit(ClientCommand::AddProfile { name: "p".into(), thresholds: vec![7, 8] })
        .await);
    wait_until("profile added in memory", || {
        state.defaults().map(|d| d.cur_profile == "p").unwrap_or(false)
    })
    .await;
    assert_eq!(handle.thresholds(), vec![7, 8]);
    assert!(profiles_path.is_dir());

    shutdown.send_replace(true);
    task.await.unwrap();
}

#[tokio::test]
async fn test_update_threshold_and_invalid_commands() {
    let bridge = Bridge::start(EmulatorHandle::new(4), Some("a 1 2 3 4\n"));
    bridge.synced().await;
    let mut session = bridge.state.registry().register().await;

    // Each of these is skipped without touching the device.
    bridge
        .submit(ClientCommand::UpdateThreshold { values: vec![1, 2], index: 5 })
        .await;
    bridge
        .submit(ClientCommand::UpdateThreshold { values: vec![0; 6], index: 5 })
        .await;
    bridge.submit(ClientCommand::ChangeProfile { name: "missing".into() }).await;
    bridge.submit(ClientCommand::RemoveProfile { name: "missing".into() }).await;
    bridge
        .submit(ClientCommand::AddProfile { name: "short".into(), thresholds: vec![1] })
        .await;

    bridge
        .submit(ClientCommand::UpdateThreshold { values: vec![1, 2, 555, 4], index: 2 })
        .await;
    assert_eq!(
        next_event(&mut session).await,
        Some(ServerMessage::Thresholds(vec![1, 2, 555, 4]))
    );
    assert_eq!(bridge.profiles_file(), "a 1 2 555 4\n");

    bridge.stop().await;
}

#[tokio::test]
async fn test_change_and_remove_profile() {
    let bridge = Bridge::start(EmulatorHandle::new(2), Some("a 10 20\nb 30 40\n"));
    assert_eq!(bridge.synced().await.cur_profile, "a");
    let mut session = bridge.state.registry().register().await;

    bridge.submit(ClientCommand::ChangeProfile { name: "b".into() }).await;
    assert_eq!(next_event(&mut session).await, Some(ServerMessage::CurrentProfile("b".into())));
    assert_eq!(next_event(&mut session).await, Some(ServerMessage::Thresholds(vec![30, 40])));
    assert_eq!(bridge.handle.thresholds(), vec![30, 40]);

    bridge.submit(ClientCommand::RemoveProfile { name: "b".into() }).await;
    assert_eq!(next_event(&mut session).await, Some(ServerMessage::Profiles(vec!["a".into()])));
    assert_eq!(next_event(&mut session).await, Some(ServerMessage::CurrentProfile("".into())));
    assert_eq!(next_event(&mut session).await, Some(ServerMessage::Thresholds(vec![0, 0])));
    assert_eq!(bridge.profiles_file(), "a 10 20\n");

    bridge.stop().await;
}

#[tokio::test]
async fn test_values_are_polled_for_clients() {
    let handle = EmulatorHandle::new(3);
    handle.set_values(vec![5, 500, 1000]);
    let bridge = Bridge::start(handle, None);
    bridge.synced().await;

    let mut session = bridge.state.registry().register().await;
    let message = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(ServerMessage::Values(values)) = session.outbound.recv().await {
                return values;
            }
        }
    })
    .await
    .expect("no values broadcast");
    assert_eq!(message, vec![5, 500, 1000]);

    bridge.stop().await;
}

#[tokio::test]
async fn test_unplug_drops_clients_and_recovers() {
    let bridge = Bridge::start(EmulatorHandle::new(4), Some("p 300 300 300 300\n"));
    bridge.synced().await;
    let mut session = bridge.state.registry().register().await;

    bridge.handle.unplug();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while session.outbound.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "session was not closed");
    wait_until("defaults cleared", || bridge.state.defaults().is_none()).await;
    assert!(!bridge.state.registry().has_clients().await);
    assert_ne!(bridge.state.status().state, ConnectionState::Steady);

    bridge.handle.replug();
    let defaults = bridge.synced().await;
    assert_eq!(defaults.cur_profile, "p");
    assert_eq!(defaults.thresholds, bridge.handle.thresholds());
    assert!(bridge.handle.opens() >= 2);
    assert_eq!(bridge.state.status().state, ConnectionState::Steady);

    bridge.stop().await;
}

#[tokio::test]
async fn test_silent_device_triggers_reconnect() {
    let bridge = Bridge::start(EmulatorHandle::new(2), None);
    bridge.synced().await;
    let _session = bridge.state.registry().register().await;
    let opens = bridge.handle.opens();

    bridge.handle.set_silent(true);
    wait_until("device marked unavailable", || bridge.state.defaults().is_none()).await;

    bridge.handle.set_silent(false);
    bridge.synced().await;
    assert!(bridge.handle.opens() > opens);

    bridge.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let bridge = Bridge::start(EmulatorHandle::new(2), None);
    bridge.synced().await;
    let mut session = bridge.state.registry().register().await;
    let state = bridge.state.clone();

    bridge.stop().await;
    while session.outbound.recv().await.is_some() {}
    assert!(state.defaults().is_none());
    assert_eq!(state.status().state, ConnectionState::Disconnected);
}
