//! Test-run coordination: log capture, driver checks, independent boards.

mod common;

use benchwarden_core::fakes::{
    fake_board, Call, FakeConsole, FakeLogMonitor, FakeNetwork, FakePower, FakeVerifier, Journal,
};
use benchwarden_core::{ConsoleLog, RecoveryOutcome, TestRunCoordinator, Verification};
use common::{ip, orchestrator};

fn monitors(journal: &Journal) -> Vec<Box<dyn ConsoleLog>> {
    vec![
        Box::new(FakeLogMonitor::new(journal, "netconsole-uboot")),
        Box::new(FakeLogMonitor::new(journal, "netconsole-kernel")),
    ]
}

fn is_start_log(call: &Call) -> bool {
    matches!(call, Call::StartLog(_))
}

fn is_stop_log(call: &Call) -> bool {
    matches!(call, Call::StopLog(_))
}

#[tokio::test(start_paused = true)]
async fn test_logs_wrap_recovery_and_driver_checks() {
    let journal = Journal::new();
    let board_ip = ip("10.0.0.1");
    let mut board = fake_board(
        Some(board_ip),
        FakeConsole::new(&journal).with_ip(board_ip),
        FakeNetwork::new(&journal),
        FakePower::new(&journal),
    );
    let verifier = FakeVerifier::new(&journal, true);
    let mut monitors = monitors(&journal);

    let report = TestRunCoordinator::new(orchestrator())
        .run(&mut board, &mut monitors, Some(&verifier), None)
        .await;

    assert!(report.passed());
    assert_eq!(report.verification, Verification::Passed);
    assert_eq!(report.recovery.driver_uri.as_deref(), Some("ip:10.0.0.1"));

    let calls = journal.calls();
    assert_eq!(calls.first(), Some(&Call::StartLog("uart".into())));
    assert_eq!(calls.last(), Some(&Call::StopLog("uart".into())));
    assert_eq!(journal.count(is_start_log), 3);
    assert_eq!(journal.count(is_stop_log), 3);

    let checks = journal
        .first(|c| *c == Call::DriverChecks("ip:10.0.0.1".into()))
        .unwrap();
    let reboot = journal.first(|c| *c == Call::Reboot(board_ip)).unwrap();
    let first_stop = journal.first(is_stop_log).unwrap();
    assert!(reboot < checks && checks < first_stop);
}

#[tokio::test(start_paused = true)]
async fn test_failed_recovery_skips_checks_but_stops_logs() {
    let journal = Journal::new();
    let board_ip = ip("10.0.0.1");
    let mut board = fake_board(
        Some(board_ip),
        FakeConsole::new(&journal).with_ip(board_ip),
        FakeNetwork::new(&journal).failing_reboot().booted(false),
        FakePower::new(&journal),
    );
    let verifier = FakeVerifier::new(&journal, true);
    let mut monitors = monitors(&journal);

    let report = TestRunCoordinator::new(orchestrator())
        .run(&mut board, &mut monitors, Some(&verifier), None)
        .await;

    assert!(!report.passed());
    assert_eq!(report.verification, Verification::Skipped);
    assert_eq!(journal.count(|c| matches!(c, Call::DriverChecks(_))), 0);
    assert_eq!(journal.count(is_stop_log), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failing_driver_checks_fail_the_run() {
    let journal = Journal::new();
    let board_ip = ip("10.0.0.1");
    let mut board = fake_board(
        Some(board_ip),
        FakeConsole::new(&journal).with_ip(board_ip),
        FakeNetwork::new(&journal),
        FakePower::new(&journal),
    );
    let verifier = FakeVerifier::new(&journal, false);

    let report = TestRunCoordinator::new(orchestrator())
        .run(&mut board, &mut [], Some(&verifier), None)
        .await;

    assert!(report.outcome.is_success());
    assert!(matches!(
        report.verification,
        Verification::Failed { ref reason } if reason.contains("no iio devices")
    ));
    assert!(!report.passed());
}

#[tokio::test(start_paused = true)]
async fn test_log_stop_error_keeps_recovery_result() {
    let journal = Journal::new();
    let board_ip = ip("10.0.0.1");
    let mut board = fake_board(
        Some(board_ip),
        FakeConsole::new(&journal)
            .with_ip(board_ip)
            .failing_log_stop(),
        FakeNetwork::new(&journal),
        FakePower::new(&journal),
    );

    let report = TestRunCoordinator::new(orchestrator())
        .run(&mut board, &mut [], None, None)
        .await;

    assert!(matches!(report.outcome, RecoveryOutcome::Recovered { .. }));
    assert_eq!(report.verification, Verification::Skipped);
    assert!(report.passed());
}

#[tokio::test(start_paused = true)]
async fn test_two_boards_recover_independently() {
    let journal_a = Journal::new();
    let journal_b = Journal::new();
    let ip_a = ip("10.0.1.10");
    let ip_b = ip("10.0.2.20");
    let mut board_a = fake_board(
        Some(ip_a),
        FakeConsole::new(&journal_a).with_ip(ip_a),
        FakeNetwork::new(&journal_a),
        FakePower::new(&journal_a),
    );
    let mut board_b = fake_board(
        Some(ip_b),
        FakeConsole::new(&journal_b).with_ip(ip_b),
        FakeNetwork::new(&journal_b).failing_reboot(),
        FakePower::new(&journal_b),
    );
    let orchestrator = orchestrator();

    let (a, b) = tokio::join!(
        orchestrator.recover(&mut board_a),
        orchestrator.recover(&mut board_b)
    );

    assert!(matches!(a, RecoveryOutcome::Recovered { ip } if ip == ip_a));
    assert!(matches!(b, RecoveryOutcome::RecoveredDegraded { ip, .. } if ip == ip_b));
    assert_eq!(journal_a.count(|c| c.target() == Some(ip_b)), 0);
    assert_eq!(journal_b.count(|c| c.target() == Some(ip_a)), 0);
    assert_eq!(journal_a.count(|c| matches!(c, Call::PowerCycle(_))), 0);
    assert_eq!(journal_b.count(|c| matches!(c, Call::PowerCycle(_))), 1);
}
