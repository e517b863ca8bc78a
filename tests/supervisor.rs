//! End-to-end supervisor scenarios against the in-process fake hypervisor.
//!
//! Timer-driven scenarios run on a paused clock so the 2 s startup polls,
//! 30 s shutdown waits and 3 s restart delays finish instantly. Scenarios
//! that push bytes through real loopback sockets use the real clock with
//! quiet probes instead.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use common::{Call, Fixture, FakeHypervisor, GuestScript, free_port};
use dockhand::config::PortMapping;
use dockhand::error::SupervisorError;
use dockhand::state_machine::VmState;
use dockhand::vm::lifecycle::SupervisorStatus;
use dockhand::vm::persist::{SessionRecord, StateStore};
use dockhand::vm::{Supervisor, SupervisorEvent};

fn supervisor(fixture: &Fixture, hv: &Arc<FakeHypervisor>) -> Supervisor {
    Supervisor::new(fixture.config.clone(), Arc::clone(hv)).expect("valid config")
}

fn states_seen(events: &mut broadcast::Receiver<SupervisorEvent>) -> Vec<VmState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::StateChanged(change) = event {
            states.push(change.to);
        }
    }
    states
}

async fn wait_for_status(
    supervisor: &Supervisor,
    within: Duration,
    pred: impl FnMut(&SupervisorStatus) -> bool,
) -> SupervisorStatus {
    let mut watch = supervisor.watch();
    tokio::time::timeout(within, watch.wait_for(pred))
        .await
        .expect("status not reached in time")
        .expect("supervisor alive")
        .clone()
}

#[tokio::test(start_paused = true)]
async fn first_launch_polls_until_healthy_then_forwards() {
    let port = free_port();
    let fixture = Fixture::new(vec![PortMapping::new(port, 80)]);
    let hv = FakeHypervisor::new(GuestScript::default().with_health(&[false, false, true]));
    let supervisor = supervisor(&fixture, &hv);
    let mut events = supervisor.subscribe();

    supervisor.start().await.expect("start");

    assert_eq!(
        states_seen(&mut events),
        vec![
            VmState::ValidatingHost,
            VmState::PreparingFirstLaunch,
            VmState::Starting,
            VmState::AwaitingHealth,
            VmState::Running,
        ]
    );

    let snapshot = supervisor.snapshot().await.unwrap();
    assert_eq!(snapshot.state, VmState::Running);
    assert_eq!(snapshot.active_probes, 2);
    assert_eq!(snapshot.forwarding.len(), 1);
    assert_eq!(snapshot.forwarding[0].port(), port);

    let commands = hv.commands();
    let health_polls = commands.iter().filter(|c| *c == "HEALTH").count();
    assert_eq!(health_polls, 3);
    let forward_at = commands
        .iter()
        .position(|c| c == "FORWARD:10080:80")
        .expect("FORWARD sent");
    assert!(commands[..forward_at].iter().all(|c| c == "HEALTH"));

    assert!(fixture.config.disks.root_image.exists());
    assert!(fixture.config.disks.data_image.exists());
    let vm = hv.last_vm().unwrap();
    assert_eq!(vm.channel_ports, vec![1024, 10_080]);

    supervisor.stop().await.expect("stop");
    assert_eq!(supervisor.state(), VmState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn second_launch_skips_first_launch_preparation() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    let hv = FakeHypervisor::new(GuestScript::default());
    let supervisor = supervisor(&fixture, &hv);

    supervisor.start().await.unwrap();
    supervisor.stop().await.unwrap();

    let mut events = supervisor.subscribe();
    supervisor.start().await.unwrap();
    assert_eq!(
        states_seen(&mut events),
        vec![
            VmState::ValidatingHost,
            VmState::Starting,
            VmState::AwaitingHealth,
            VmState::Running,
        ]
    );
    supervisor.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_escalates_to_power_button_when_guest_ignores_shutdown() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    let hv = FakeHypervisor::new(GuestScript {
        halt_on_shutdown: false,
        ..GuestScript::default()
    });
    let supervisor = supervisor(&fixture, &hv);
    supervisor.start().await.unwrap();

    let started = tokio::time::Instant::now();
    supervisor.stop().await.expect("stop");

    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(supervisor.state(), VmState::Stopped);
    assert_eq!(hv.count(Call::PowerButton), 1);
    assert_eq!(hv.count(Call::Stop), 0);
    assert!(hv.commands().contains(&"SHUTDOWN".to_string()));
}

#[tokio::test(start_paused = true)]
async fn stop_force_terminates_when_nothing_else_works() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    let hv = FakeHypervisor::new(GuestScript {
        ack_shutdown: false,
        halt_on_power_button: false,
        ..GuestScript::default()
    });
    let supervisor = supervisor(&fixture, &hv);
    supervisor.start().await.unwrap();

    supervisor.stop().await.expect("stop");

    assert_eq!(supervisor.state(), VmState::Stopped);
    assert_eq!(hv.count(Call::PowerButton), 1);
    assert_eq!(hv.count(Call::Stop), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    let hv = FakeHypervisor::new(GuestScript::default());
    let supervisor = supervisor(&fixture, &hv);

    supervisor.stop().await.unwrap();
    supervisor.start().await.unwrap();
    supervisor.stop().await.unwrap();
    supervisor.stop().await.unwrap();

    assert_eq!(supervisor.state(), VmState::Stopped);
    assert_eq!(hv.commands().iter().filter(|c| *c == "SHUTDOWN").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn sustained_health_failures_exhaust_the_restart_budget() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    // Each session: healthy at startup, then three failed steady checks.
    let session = [true, false, false, false];
    let script: Vec<bool> = session.iter().copied().cycle().take(session.len() * 4).collect();
    let hv = FakeHypervisor::new(GuestScript::default().with_health(&script));
    let supervisor = supervisor(&fixture, &hv);

    supervisor.start().await.unwrap();

    let status = wait_for_status(&supervisor, Duration::from_secs(3600), |s| {
        s.state == VmState::Error
            && s.reason
                .as_deref()
                .is_some_and(|r| !r.starts_with("restarting"))
    })
    .await;
    let reason = status.reason.unwrap();
    assert!(
        reason.starts_with(&SupervisorError::RestartBudgetExhausted.to_string()),
        "{reason}"
    );

    let snapshot = supervisor.snapshot().await.unwrap();
    assert_eq!(snapshot.restart_count, 3);
    assert!(!snapshot.auto_restart);
    assert_eq!(snapshot.active_probes, 0);
    assert_eq!(hv.count(Call::Create), 4);

    // A user start resets the budget.
    supervisor.start().await.expect("manual start");
    let snapshot = supervisor.snapshot().await.unwrap();
    assert_eq!(snapshot.restart_count, 0);
    assert!(snapshot.auto_restart);
    supervisor.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unexpected_halt_without_auto_restart_reports_the_halt() {
    let mut fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    fixture.config.settings.auto_restart = false;
    let hv = FakeHypervisor::new(GuestScript::default());
    let supervisor = supervisor(&fixture, &hv);
    supervisor.start().await.unwrap();

    hv.crash();

    let status = wait_for_status(&supervisor, Duration::from_secs(60), |s| {
        s.state == VmState::Error
    })
    .await;
    assert_eq!(status.reason.as_deref(), Some("guest halted unexpectedly"));
    assert_eq!(hv.count(Call::Create), 1);
}

#[tokio::test(start_paused = true)]
async fn unexpected_halt_triggers_automatic_restart() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    let hv = FakeHypervisor::new(GuestScript::default());
    let supervisor = supervisor(&fixture, &hv);
    supervisor.start().await.unwrap();

    let mut events = supervisor.subscribe();
    hv.crash();

    wait_for_status(&supervisor, Duration::from_secs(60), |s| {
        s.state == VmState::Error
    })
    .await;
    wait_for_status(&supervisor, Duration::from_secs(60), |s| {
        s.state == VmState::Running
    })
    .await;

    let states = states_seen(&mut events);
    assert_eq!(states.first(), Some(&VmState::Error));
    assert!(states.contains(&VmState::Stopping));
    assert!(states.contains(&VmState::Stopped));
    assert_eq!(states.last(), Some(&VmState::Running));

    let snapshot = supervisor.snapshot().await.unwrap();
    assert_eq!(snapshot.restart_count, 1);
    assert_eq!(hv.count(Call::Create), 2);
    supervisor.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn startup_timeout_tears_the_guest_down() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    let hv = FakeHypervisor::new(GuestScript {
        health_default: false,
        ..GuestScript::default()
    });
    let supervisor = supervisor(&fixture, &hv);

    let err = supervisor.start().await.unwrap_err();
    assert_eq!(err, SupervisorError::StartupTimeout(Duration::from_secs(120)));
    assert_eq!(supervisor.state(), VmState::Error);
    assert_eq!(hv.count(Call::Stop), 1);
    assert!(!hv.commands().iter().any(|c| c.starts_with("FORWARD")));

    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(), VmState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn stop_during_startup_cancels_the_start() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    let hv = FakeHypervisor::new(GuestScript {
        health_default: false,
        ..GuestScript::default()
    });
    let supervisor = supervisor(&fixture, &hv);

    let starter = supervisor.clone();
    let start = tokio::spawn(async move { starter.start().await });
    wait_for_status(&supervisor, Duration::from_secs(60), |s| {
        s.state == VmState::AwaitingHealth
    })
    .await;

    supervisor.stop().await.expect("stop");

    assert_eq!(start.await.unwrap(), Err(SupervisorError::Cancelled));
    assert_eq!(supervisor.state(), VmState::Stopped);
    let snapshot = supervisor.snapshot().await.unwrap();
    assert_eq!(snapshot.active_probes, 0);
    assert!(snapshot.forwarding.is_empty());
}

#[tokio::test(start_paused = true)]
async fn port_in_use_fails_before_the_guest_is_created() {
    let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = held.local_addr().unwrap().port();
    let fixture = Fixture::new(vec![PortMapping::new(port, 80)]);
    let hv = FakeHypervisor::new(GuestScript::default());
    let supervisor = supervisor(&fixture, &hv);

    let err = supervisor.start().await.unwrap_err();

    assert_eq!(err, SupervisorError::PortInUse { port });
    assert!(err.remediation().is_some());
    assert!(hv.calls().is_empty());
    let status = supervisor.status();
    assert_eq!(status.state, VmState::Error);
    assert!(status.reason.unwrap().contains(&port.to_string()));

    supervisor.stop().await.unwrap();
    assert_eq!(supervisor.state(), VmState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn unsupported_host_is_reported_without_touching_disks() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    let hv = FakeHypervisor::new(GuestScript {
        host_unsupported: Some("virtualization is not available".into()),
        ..GuestScript::default()
    });
    let supervisor = supervisor(&fixture, &hv);

    let err = supervisor.start().await.unwrap_err();

    assert!(matches!(err, SupervisorError::UnsupportedHost(_)));
    assert!(!fixture.config.disks.root_image.exists());
    assert!(!fixture.config.disks.data_image.exists());
    assert!(hv.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_boot_is_reported_as_error() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    let hv = FakeHypervisor::new(GuestScript {
        fail_start: true,
        ..GuestScript::default()
    });
    let supervisor = supervisor(&fixture, &hv);

    let err = supervisor.start().await.unwrap_err();

    assert!(matches!(err, SupervisorError::Boot(_)));
    assert_eq!(supervisor.state(), VmState::Error);
    assert_eq!(hv.calls(), vec![Call::Create, Call::Start, Call::Stop]);
}

#[tokio::test(start_paused = true)]
async fn rejected_forwarding_fails_the_start() {
    let fixture = Fixture::new(vec![
        PortMapping::new(free_port(), 80),
        PortMapping::new(free_port(), 5432),
    ]);
    let hv = FakeHypervisor::new(GuestScript::default());
    hv.script(|s| {
        s.rejected_guest_ports
            .insert(5432, "nothing listening".into());
    });
    let supervisor = supervisor(&fixture, &hv);

    let err = supervisor.start().await.unwrap_err();

    assert_eq!(err, SupervisorError::ForwardingRejected { port: 5432 });
    assert_eq!(supervisor.state(), VmState::Error);
    assert_eq!(hv.count(Call::Stop), 1);
    for mapping in &fixture.config.manifest.ports {
        dockhand::vm::forwarder::probe_host_port(mapping.host_port).expect("port released");
    }
}

#[tokio::test(start_paused = true)]
async fn destroy_removes_disks_and_the_session_record() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    let hv = FakeHypervisor::new(GuestScript::default());
    let supervisor = supervisor(&fixture, &hv);

    supervisor.start().await.unwrap();
    assert!(fixture.config.state_file.exists());

    let mut events = supervisor.subscribe();
    supervisor.destroy().await.expect("destroy");

    assert_eq!(supervisor.state(), VmState::Stopped);
    assert!(!fixture.config.disks.root_image.exists());
    assert!(!fixture.config.disks.data_image.exists());
    assert!(!fixture.config.state_file.exists());
    assert!(fixture.config.disks.root_archive.exists());
    assert_eq!(
        states_seen(&mut events),
        vec![
            VmState::Stopping,
            VmState::Stopped,
            VmState::Destroying,
            VmState::Stopped,
        ]
    );
}

#[tokio::test]
async fn session_owned_by_another_live_process_is_left_alone() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    let data = fixture.config.disks.data_image.clone();
    std::fs::create_dir_all(data.parent().unwrap()).unwrap();
    std::fs::write(&data, b"guest data").unwrap();

    let mut owner = std::process::Command::new("sleep")
        .arg("60")
        .spawn()
        .expect("spawn owner process");
    let store = StateStore::new(&fixture.config.state_file);
    let record = SessionRecord {
        pid: owner.id(),
        ..SessionRecord::current(VmState::Running)
    };
    store.save(&record).unwrap();

    let hv = FakeHypervisor::new(GuestScript::default());
    let supervisor = supervisor(&fixture, &hv);

    let owned = SupervisorError::SessionOwned { pid: owner.id() };
    assert_eq!(supervisor.destroy().await, Err(owned.clone()));
    assert_eq!(supervisor.start().await, Err(owned.clone()));
    assert_eq!(supervisor.restart().await, Err(owned));

    assert!(data.exists());
    assert_eq!(store.load().unwrap(), Some(record));
    assert_eq!(supervisor.state(), VmState::Stopped);
    assert!(hv.calls().is_empty());

    owner.kill().unwrap();
    owner.wait().unwrap();

    supervisor.destroy().await.expect("owner has exited");
    assert!(!data.exists());
}

#[tokio::test(start_paused = true)]
async fn session_record_follows_the_state() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    let hv = FakeHypervisor::new(GuestScript::default());
    let supervisor = supervisor(&fixture, &hv);
    let store = dockhand::vm::persist::StateStore::new(&fixture.config.state_file);

    supervisor.start().await.unwrap();
    // Writes go through a background task; the snapshot round trip orders us
    // after the transition, the short sleep after the write itself.
    supervisor.snapshot().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let record = store.load().unwrap().expect("record written");
    assert_eq!(record.state, VmState::Running);
    assert_eq!(record.pid, std::process::id());

    supervisor.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.load().unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn suspend_is_ignored_unless_running() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    let hv = FakeHypervisor::new(GuestScript::default());
    let supervisor = supervisor(&fixture, &hv);

    assert!(matches!(
        supervisor.suspend().await,
        Err(SupervisorError::InvalidState { .. })
    ));
    assert!(matches!(
        supervisor.resume().await,
        Err(SupervisorError::InvalidState { .. })
    ));
    assert!(hv.calls().is_empty());
    assert_eq!(supervisor.state(), VmState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn disk_pressure_is_published_on_every_check() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    let hv = FakeHypervisor::new(GuestScript {
        disk: (950, 1000),
        ..GuestScript::default()
    });
    let supervisor = supervisor(&fixture, &hv);
    let mut events = supervisor.subscribe();
    supervisor.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(200)).await;

    let mut warnings = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::DiskWarning { used_mb, total_mb } = event {
            warnings.push((used_mb, total_mb));
        }
    }
    // Checks land at 60 s, 120 s and 180 s.
    assert_eq!(warnings, vec![(950, 1000); 3]);

    hv.script(|s| s.disk = (100, 1000));
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(events.try_recv().is_err());
    supervisor.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn guest_logs_come_from_the_control_channel() {
    let fixture = Fixture::new(vec![PortMapping::new(free_port(), 80)]);
    let hv = FakeHypervisor::new(GuestScript {
        logs: "web_1 | listening on :80\n".into(),
        ..GuestScript::default()
    });
    let supervisor = supervisor(&fixture, &hv);

    assert_eq!(supervisor.guest_logs(50).await, None);

    supervisor.start().await.unwrap();
    assert_eq!(
        supervisor.guest_logs(50).await.as_deref(),
        Some("web_1 | listening on :80\n")
    );
    assert!(hv.commands().contains(&"LOGS:50".to_string()));
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn suspend_and_resume_rebuild_connections_once() {
    let port = free_port();
    let fixture = Fixture::new(vec![PortMapping::new(port, 80)]).quiet_probes();
    let hv = FakeHypervisor::new(GuestScript::default());
    let supervisor = supervisor(&fixture, &hv);
    supervisor.start().await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(supervisor.snapshot().await.unwrap().live_bridges, 1);

    let mut events = supervisor.subscribe();
    supervisor.suspend().await.expect("suspend");
    assert_eq!(supervisor.state(), VmState::Paused);
    assert_eq!(supervisor.snapshot().await.unwrap().active_probes, 0);

    supervisor.resume().await.expect("resume");
    assert_eq!(supervisor.state(), VmState::Running);

    let snapshot = supervisor.snapshot().await.unwrap();
    assert_eq!(snapshot.connection_rebuilds, 1);
    assert_eq!(snapshot.live_bridges, 0);
    assert_eq!(snapshot.active_probes, 2);
    assert_eq!(snapshot.forwarding.len(), 1);

    let rebuilt: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, SupervisorEvent::ConnectionsRebuilt { .. }))
        .collect();
    assert_eq!(rebuilt, vec![SupervisorEvent::ConnectionsRebuilt { cancelled: 1 }]);

    // The old connection is gone; a new one works through the same listener.
    let mut rest = Vec::new();
    let old = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .expect("old connection closed");
    assert!(old.is_err() || rest.is_empty());

    let mut fresh = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    fresh.write_all(b"pong").await.unwrap();
    fresh.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    assert_eq!(hv.count(Call::Pause), 1);
    assert_eq!(hv.count(Call::Resume), 1);
    drop(fresh);
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn stop_closes_forwarded_ports() {
    let port = free_port();
    let fixture = Fixture::new(vec![PortMapping::new(port, 80)]).quiet_probes();
    let hv = FakeHypervisor::new(GuestScript::default());
    let supervisor = supervisor(&fixture, &hv);

    supervisor.start().await.unwrap();
    assert!(dockhand::vm::forwarder::probe_host_port(port).is_err());

    supervisor.stop().await.unwrap();
    dockhand::vm::forwarder::probe_host_port(port).expect("listener released");
    assert!(common::eventually(Duration::from_secs(2), || {
        hv.commands().contains(&"FORWARD-STOP".to_string())
    })
    .await);
}
