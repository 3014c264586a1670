//! End-to-end session lifecycle against the mock telemetry device and mock inputs.
//!
//! Every test runs a real `AcquisitionSession` writing to a temporary data directory.

use oshiwasp_daq::data::record::{ActivityEvent, Transition};
use oshiwasp_daq::data::store::LogStore;
use oshiwasp_daq::hardware::mock::{MockDeviceHandle, MockDigitalInput, MockTelemetryDevice};
use oshiwasp_daq::session::orchestrator::{DiscreteChannel, ProducerSettings};
use oshiwasp_daq::session::state::{SessionEvent, SessionState};
use oshiwasp_daq::session::{AcquisitionSession, ChannelFlags, SessionConfig, SessionHardware};
use oshiwasp_daq::DaqError;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

const ENABLE: u8 = b'n';
const DISABLE: u8 = b'f';

struct Rig {
    session: AcquisitionSession,
    device: MockDeviceHandle,
    gate: Arc<MockDigitalInput>,
    _dir: TempDir,
}

/// Session with telemetry at 2 ms and one discrete channel `A`.
async fn rig(name: &str) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let (transport, device) = MockTelemetryDevice::new(Duration::from_millis(2)).spawn();
    let gate = Arc::new(MockDigitalInput::new(false));
    let hardware = SessionHardware {
        transport,
        channels: vec![DiscreteChannel::new("A", gate.clone())],
    };
    let settings = ProducerSettings {
        poll_interval: Duration::from_micros(200),
        ..ProducerSettings::default()
    };

    let session = AcquisitionSession::configure(
        SessionConfig::new(name, ChannelFlags::all(["A"])),
        hardware,
        settings,
        LogStore::new(dir.path(), ".csv"),
    )
    .await
    .unwrap();

    Rig {
        session,
        device,
        gate,
        _dir: dir,
    }
}

async fn wait_for_records(session: &AcquisitionSession, at_least: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.status().records_written < at_least {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("records did not arrive in time");
}

/// Wait until the monitor reports `expected` on any channel.
async fn wait_for_edge(activity: &mut broadcast::Receiver<ActivityEvent>, expected: Transition) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match activity.recv().await {
                Ok(ActivityEvent::Edge { transition, .. }) if transition == expected => break,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("activity channel closed"),
            }
        }
    })
    .await
    .expect("edge was not observed in time");
}

async fn wait_for_state(session: &AcquisitionSession, state: SessionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.current_state() != state {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("state was not reached in time");
}

fn data_lines(contents: &str) -> Vec<&str> {
    contents
        .lines()
        .filter(|line| line.starts_with('['))
        .collect()
}

fn host_time(line: &str) -> u64 {
    line.split(", ").nth(1).unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_undefined_transitions_are_rejected_without_side_effects() {
    let mut rig = rig("table").await;

    // New accepts only start and reconfigure.
    for result in [
        rig.session.pause().await,
        rig.session.resume().await,
        rig.session.stop().await,
    ] {
        assert!(matches!(
            result,
            Err(DaqError::InvalidTransition {
                state: SessionState::New,
                ..
            })
        ));
    }
    assert_eq!(rig.session.current_state(), SessionState::New);
    assert!(rig.device.commands().is_empty());

    rig.session.start().await.unwrap();
    let err = rig.session.start().await.unwrap_err();
    assert!(matches!(
        err,
        DaqError::InvalidTransition {
            state: SessionState::Running,
            event: SessionEvent::Start
        }
    ));
    assert!(matches!(
        rig.session.resume().await,
        Err(DaqError::InvalidTransition { .. })
    ));
    assert_eq!(rig.session.current_state(), SessionState::Running);

    rig.session.pause().await.unwrap();
    assert!(matches!(
        rig.session.pause().await,
        Err(DaqError::InvalidTransition { .. })
    ));
    assert!(matches!(
        rig.session.start().await,
        Err(DaqError::InvalidTransition { .. })
    ));
    assert_eq!(rig.session.current_state(), SessionState::Paused);

    rig.session.stop().await.unwrap();
    for result in [rig.session.pause().await, rig.session.resume().await] {
        assert!(matches!(result, Err(DaqError::InvalidTransition { .. })));
    }
    assert_eq!(rig.session.current_state(), SessionState::Stopped);
}

#[tokio::test]
async fn test_remote_commands_follow_the_lifecycle() {
    let mut rig = rig("commands").await;

    rig.session.start().await.unwrap();
    rig.session.pause().await.unwrap();
    rig.session.resume().await.unwrap();
    rig.session.stop().await.unwrap();
    rig.session.start().await.unwrap();
    rig.session
        .reconfigure(SessionConfig::new("commands", ChannelFlags::all(["A"])))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while rig.device.commands().len() < 6 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        rig.device.commands(),
        vec![ENABLE, DISABLE, ENABLE, DISABLE, ENABLE, DISABLE]
    );
    assert!(!rig.device.is_streaming());
}

#[tokio::test]
async fn test_time_zero_survives_pause_and_restart() {
    let mut rig = rig("timing").await;
    assert!(rig.session.time_zero().is_none());

    rig.session.start().await.unwrap();
    let t0 = rig.session.time_zero().unwrap();

    rig.session.pause().await.unwrap();
    rig.session.resume().await.unwrap();
    assert_eq!(rig.session.time_zero(), Some(t0));

    rig.session.stop().await.unwrap();
    assert_eq!(rig.session.time_zero(), Some(t0));
    rig.session.start().await.unwrap();
    assert_eq!(rig.session.time_zero(), Some(t0));
    rig.session.stop().await.unwrap();

    let first_log = rig.session.log_path().to_path_buf();
    rig.session
        .reconfigure(SessionConfig::new("timing", ChannelFlags::all(["A"])))
        .await
        .unwrap();
    assert_eq!(rig.session.current_state(), SessionState::New);
    assert!(rig.session.time_zero().is_none());
    assert_ne!(rig.session.log_path(), first_log);

    rig.session.start().await.unwrap();
    assert_ne!(rig.session.time_zero(), Some(t0));
    rig.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_log_contains_telemetry_and_edges_in_order() {
    let mut rig = rig("merge").await;
    let mut activity = rig.session.subscribe_activity();

    rig.session.start().await.unwrap();
    wait_for_records(&rig.session, 3).await;
    rig.gate.set_level(true).await;
    wait_for_edge(&mut activity, Transition::Rising).await;
    rig.gate.set_level(false).await;
    wait_for_edge(&mut activity, Transition::Falling).await;
    rig.gate.set_level(true).await;
    wait_for_edge(&mut activity, Transition::Rising).await;
    // The edge is announced just before it is submitted.
    tokio::time::sleep(Duration::from_millis(20)).await;
    rig.session.stop().await.unwrap();

    let contents = std::fs::read_to_string(rig.session.log_path()).unwrap();
    assert!(contents.starts_with("### "));
    assert!(contents.contains("merge"));

    let lines = data_lines(&contents);
    let telemetry: Vec<_> = lines.iter().filter(|l| l.starts_with("[Ard]")).collect();
    let edges: Vec<_> = lines.iter().filter(|l| l.starts_with("[A]")).collect();
    assert!(telemetry.len() >= 3);
    // Only rising edges are logged by default.
    assert_eq!(edges.len(), 2);
    assert!(edges.iter().all(|l| l.ends_with(", 1")));

    // Each line is complete.
    assert!(telemetry.iter().all(|l| l.split(", ").count() == 11));

    // Per-producer host timestamps never go backwards.
    let times: Vec<u64> = telemetry.iter().map(|l| host_time(l)).collect();
    assert!(times.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_pause_suppresses_logging() {
    let mut rig = rig("pause").await;

    rig.session.start().await.unwrap();
    wait_for_records(&rig.session, 3).await;
    rig.session.pause().await.unwrap();
    assert_eq!(rig.session.current_state(), SessionState::Paused);

    // Let any submission that raced the pause land.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let paused_count = rig.session.status().records_written;

    rig.device.inject(vec![b'x'; 3]);
    rig.gate.set_level(true).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.session.status().records_written, paused_count);

    rig.session.resume().await.unwrap();
    wait_for_records(&rig.session, paused_count + 3).await;
    rig.session.stop().await.unwrap();

    // The edge seen while paused is not replayed after resume.
    let contents = std::fs::read_to_string(rig.session.log_path()).unwrap();
    assert_eq!(
        data_lines(&contents)
            .iter()
            .filter(|l| l.starts_with("[A]"))
            .count(),
        0
    );
}

#[tokio::test]
async fn test_transport_loss_moves_session_to_error() {
    let mut rig = rig("hangup").await;

    rig.session.start().await.unwrap();
    wait_for_records(&rig.session, 2).await;
    rig.device.disconnect().await;

    let fault = tokio::time::timeout(Duration::from_secs(5), rig.session.next_fault())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(fault, DaqError::TransportClosed));
    let fault = rig.session.apply_fault(fault).await;
    assert!(fault.is_fatal());

    assert_eq!(rig.session.current_state(), SessionState::Error);
    let status = rig.session.status();
    assert!(status.last_fault.is_some());

    // Only reconfigure leaves Error.
    assert!(matches!(
        rig.session.start().await,
        Err(DaqError::InvalidTransition {
            state: SessionState::Error,
            ..
        })
    ));
    rig.session
        .reconfigure(SessionConfig::new("recovered", ChannelFlags::all(["A"])))
        .await
        .unwrap();
    assert_eq!(rig.session.current_state(), SessionState::New);
    assert!(rig.session.status().last_fault.is_none());
}

#[tokio::test]
async fn test_transport_loss_halts_edge_logging_immediately() {
    let mut rig = rig("halted").await;

    rig.session.start().await.unwrap();
    wait_for_records(&rig.session, 2).await;
    rig.device.disconnect().await;

    // No control operation runs; the session still reports the fault.
    wait_for_state(&rig.session, SessionState::Error).await;
    let status = rig.session.status();
    assert_eq!(status.state, SessionState::Error);
    assert!(status.last_fault.is_some());
    let written = status.records_written;

    for _ in 0..3 {
        rig.gate.set_level(true).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        rig.gate.set_level(false).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(rig.session.status().records_written, written);

    let contents = std::fs::read_to_string(rig.session.log_path()).unwrap();
    assert!(!data_lines(&contents).iter().any(|l| l.starts_with("[A]")));

    let fault = tokio::time::timeout(Duration::from_secs(1), rig.session.next_fault())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(fault, DaqError::TransportClosed));
    rig.session.apply_fault(fault).await;
    assert_eq!(rig.session.current_state(), SessionState::Error);
    assert!(rig.session.status().last_fault.is_some());
}

#[tokio::test]
async fn test_failed_enable_command_moves_session_to_error() {
    let mut rig = rig("no-link").await;
    rig.device.disconnect().await;

    let err = rig.session.start().await.unwrap_err();
    assert!(matches!(err, DaqError::Transport(_)));
    assert_eq!(rig.session.current_state(), SessionState::Error);
    assert!(rig.session.status().last_fault.is_some());

    rig.session
        .reconfigure(SessionConfig::new("no-link", ChannelFlags::all(["A"])))
        .await
        .unwrap();
    assert_eq!(rig.session.current_state(), SessionState::New);
    assert!(rig.session.status().last_fault.is_none());
}

#[tokio::test]
async fn test_unwritable_log_moves_session_to_error() {
    let mut rig = rig("blocked").await;

    rig.session.start().await.unwrap();
    wait_for_records(&rig.session, 2).await;
    rig.session.stop().await.unwrap();

    // A directory where the log used to be cannot be reopened for appending.
    let path = rig.session.log_path().to_path_buf();
    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir(&path).unwrap();

    let err = rig.session.start().await.unwrap_err();
    assert!(matches!(err, DaqError::LogIo(_)));
    assert_eq!(rig.session.current_state(), SessionState::Error);
    assert!(rig.session.status().last_fault.is_some());

    rig.session
        .reconfigure(SessionConfig::new("unblocked", ChannelFlags::all(["A"])))
        .await
        .unwrap();
    assert_eq!(rig.session.current_state(), SessionState::New);
    assert!(rig.session.status().last_fault.is_none());
    rig.session.start().await.unwrap();
    wait_for_records(&rig.session, 2).await;
    rig.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_pending_capability_fault_is_applied_by_next_control_op() {
    let mut rig = rig("broken-line").await;

    rig.session.start().await.unwrap();
    rig.gate.set_failing(true).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let err = rig.session.pause().await.unwrap_err();
    assert!(matches!(err, DaqError::Capability { ref channel, .. } if channel == "A"));
    assert_eq!(rig.session.current_state(), SessionState::Error);

    // Telemetry was switched off on the way into Error.
    tokio::time::timeout(Duration::from_secs(1), async {
        while rig.device.commands() != [ENABLE, DISABLE] {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_channel_report_and_purge_are_refused_while_running() {
    let mut rig = rig("busy").await;

    let report = rig.session.channel_report().await.unwrap();
    assert_eq!(report.len(), 2);

    rig.session.start().await.unwrap();
    assert!(matches!(
        rig.session.channel_report().await,
        Err(DaqError::SessionBusy(SessionState::Running))
    ));
    assert!(matches!(
        rig.session.purge_logs().await,
        Err(DaqError::SessionBusy(SessionState::Running))
    ));
    rig.session.stop().await.unwrap();

    assert_eq!(rig.session.list_logs().await.unwrap(), vec!["busy.csv"]);
    assert_eq!(rig.session.purge_logs().await.unwrap(), 1);
    assert!(rig.session.list_logs().await.unwrap().is_empty());

    // The next start recreates the log in place.
    rig.session.start().await.unwrap();
    wait_for_records(&rig.session, 2).await;
    rig.session.stop().await.unwrap();
    assert!(rig.session.log_path().exists());
}
