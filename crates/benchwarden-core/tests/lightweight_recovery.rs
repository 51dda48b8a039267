//! Lightweight path: SSH reboot, then at most two power-cycle tiers.

mod common;

use std::time::Duration;

use benchwarden_core::fakes::{fake_board, Call, FakeConsole, FakeNetwork, FakePower, Journal};
use benchwarden_core::{
    ChannelError, LoadStrategy, RecoveryError, RecoveryOrchestrator, RecoveryOutcome,
    RecoveryTimings, Stage,
};
use common::{ip, is_check_booted, is_power_cycle, is_ssh_check, is_write_raw, orchestrator};

#[tokio::test(start_paused = true)]
async fn test_ssh_reboot_success_needs_no_ssh_check() {
    let journal = Journal::new();
    let board_ip = ip("10.0.0.1");
    let mut board = fake_board(
        Some(board_ip),
        FakeConsole::new(&journal).with_ip(board_ip),
        // A broken SSH check must not matter on this path.
        FakeNetwork::new(&journal).ssh_working(false),
        FakePower::new(&journal),
    );

    let (outcome, report) = orchestrator().recover_reported(&mut board, None).await;

    assert!(matches!(outcome, RecoveryOutcome::Recovered { ip } if ip == board_ip));
    assert_eq!(journal.count(is_ssh_check), 0);
    assert_eq!(journal.count(is_power_cycle), 0);
    assert_eq!(journal.count(|c| *c == Call::Reboot(board_ip)), 1);
    assert_eq!(report.stages, vec![Stage::SshRebootAttempt]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_reboot_recovers_after_one_power_cycle() {
    let journal = Journal::new();
    let board_ip = ip("10.0.0.1");
    let mut board = fake_board(
        Some(board_ip),
        FakeConsole::new(&journal).with_ip(board_ip),
        FakeNetwork::new(&journal).failing_reboot(),
        FakePower::new(&journal),
    );

    let (outcome, report) = orchestrator().recover_reported(&mut board, None).await;

    match &outcome {
        RecoveryOutcome::RecoveredDegraded { ip, notes } => {
            assert_eq!(*ip, board_ip);
            assert_eq!(notes.len(), 1);
            assert!(notes[0].starts_with("ssh reboot failed"));
        }
        other => panic!("expected degraded recovery, got {other:?}"),
    }
    assert_eq!(journal.count(is_power_cycle), 1);
    assert_eq!(journal.count(is_write_raw), 0);
    assert_eq!(
        report.stages,
        vec![Stage::SshRebootAttempt, Stage::PowerCycle1, Stage::BootCheck]
    );
}

#[tokio::test(start_paused = true)]
async fn test_reboot_accepted_but_not_booted_escalates() {
    let journal = Journal::new();
    let board_ip = ip("10.0.0.1");
    let mut board = fake_board(
        Some(board_ip),
        FakeConsole::new(&journal).with_ip(board_ip),
        FakeNetwork::new(&journal).boot_results([false]),
        FakePower::new(&journal),
    );

    let outcome = orchestrator().recover(&mut board).await;

    assert!(matches!(outcome, RecoveryOutcome::RecoveredDegraded { .. }));
    assert_eq!(journal.count(is_power_cycle), 1);
    assert_eq!(journal.count(is_check_booted), 2);
}

#[tokio::test(start_paused = true)]
async fn test_second_power_cycle_wakes_console_before_boot_check() {
    let journal = Journal::new();
    let board_ip = ip("10.0.0.1");
    let mut board = fake_board(
        Some(board_ip),
        FakeConsole::new(&journal).with_ip(board_ip),
        FakeNetwork::new(&journal)
            .failing_reboot()
            .boot_results([false]),
        FakePower::new(&journal),
    );
    let orchestrator = orchestrator();
    let keystrokes = orchestrator.timings().wake_keystrokes as usize;

    let (outcome, report) = orchestrator.recover_reported(&mut board, None).await;

    match &outcome {
        RecoveryOutcome::RecoveredDegraded { notes, .. } => assert_eq!(notes.len(), 2),
        other => panic!("expected degraded recovery, got {other:?}"),
    }
    assert_eq!(journal.count(is_power_cycle), 2);
    assert_eq!(journal.count(is_write_raw), keystrokes);

    let second_cycle = journal.last(is_power_cycle).unwrap();
    let first_wake = journal.first(is_write_raw).unwrap();
    let last_wake = journal.last(is_write_raw).unwrap();
    let boot = journal.first(|c| *c == Call::BootDefault).unwrap();
    let final_check = journal.last(is_check_booted).unwrap();
    assert!(second_cycle < first_wake);
    assert!(last_wake < boot && boot < final_check);

    assert_eq!(report.stages.last(), Some(&Stage::BootCheck2));
    assert_eq!(report.power_cycles, 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_after_exactly_two_power_cycles() {
    let journal = Journal::new();
    let board_ip = ip("10.0.0.1");
    let mut board = fake_board(
        Some(board_ip),
        FakeConsole::new(&journal).with_ip(board_ip),
        FakeNetwork::new(&journal).failing_reboot().booted(false),
        FakePower::new(&journal),
    );

    let (outcome, report) = orchestrator().recover_reported(&mut board, None).await;

    assert!(matches!(
        outcome.error(),
        Some(RecoveryError::RecoveryExhausted {
            last: ChannelError::NotBooted(_)
        })
    ));
    assert_eq!(journal.count(is_power_cycle), 2);
    assert_eq!(journal.count(is_check_booted), 2);
    assert_eq!(report.error_kind.as_deref(), Some("recovery_exhausted"));
    assert_eq!(report.notes.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failing_pdu_still_stops_at_two_cycles() {
    let journal = Journal::new();
    let board_ip = ip("10.0.0.1");
    let mut board = fake_board(
        Some(board_ip),
        FakeConsole::new(&journal).with_ip(board_ip),
        FakeNetwork::new(&journal).failing_reboot(),
        FakePower::new(&journal).failing(),
    );

    let (outcome, report) = orchestrator().recover_reported(&mut board, None).await;

    assert!(matches!(
        outcome.error(),
        Some(RecoveryError::RecoveryExhausted {
            last: ChannelError::Transport(_)
        })
    ));
    assert_eq!(journal.count(is_power_cycle), 2);
    assert_eq!(journal.count(|c| *c == Call::PowerOn), 0);
    assert_eq!(journal.count(is_write_raw), 0);
    assert_eq!(report.power_cycles, 2);
    assert_eq!(
        report
            .notes
            .iter()
            .filter(|n| n.starts_with("power cycle failed"))
            .count(),
        2
    );
    assert!(report.notes.iter().all(|n| !n.contains("power cycled")));
}

#[tokio::test(start_paused = true)]
async fn test_slow_pdu_finishes_power_cycle() {
    let journal = Journal::new();
    let board_ip = ip("10.0.0.1");
    let mut board = fake_board(
        Some(board_ip),
        FakeConsole::new(&journal).with_ip(board_ip),
        FakeNetwork::new(&journal).failing_reboot(),
        // Each outlet request outlasts a console command but not its own bound.
        FakePower::new(&journal).with_request_delay(Duration::from_millis(900)),
    );
    let timings = RecoveryTimings {
        command_timeout_ms: 300,
        ..RecoveryTimings::quick()
    };

    let outcome = RecoveryOrchestrator::new(timings, LoadStrategy::Console)
        .recover(&mut board)
        .await;

    assert!(matches!(outcome, RecoveryOutcome::RecoveredDegraded { ip, .. } if ip == board_ip));
    assert_eq!(journal.count(is_power_cycle), 1);
    assert_eq!(journal.count(|c| *c == Call::PowerOn), 1);
    let on = journal.first(|c| *c == Call::PowerOn).unwrap();
    let check = journal.first(is_check_booted).unwrap();
    assert!(on < check);
}

#[tokio::test(start_paused = true)]
async fn test_boot_check_follows_new_address() {
    let journal = Journal::new();
    let old_ip = ip("10.0.0.1");
    let new_ip = ip("10.0.0.9");
    let mut board = fake_board(
        Some(old_ip),
        FakeConsole::new(&journal).with_ip(new_ip),
        FakeNetwork::new(&journal).failing_reboot(),
        FakePower::new(&journal),
    );

    let outcome = orchestrator().recover(&mut board).await;

    assert_eq!(outcome.ip(), Some(new_ip));
    assert_eq!(journal.count(|c| *c == Call::CheckBooted(new_ip)), 1);
    assert_eq!(journal.count(|c| *c == Call::CheckBooted(old_ip)), 0);
    assert_eq!(board.identity().driver_uri(), Some("ip:10.0.0.9"));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_address_skips_ssh_reboot() {
    let journal = Journal::new();
    let found = ip("10.0.0.3");
    let mut board = fake_board(
        None,
        FakeConsole::new(&journal).with_ip(found),
        FakeNetwork::new(&journal),
        FakePower::new(&journal),
    );

    let outcome = orchestrator().recover(&mut board).await;

    assert!(matches!(outcome, RecoveryOutcome::RecoveredDegraded { ip, .. } if ip == found));
    assert_eq!(journal.count(|c| matches!(c, Call::Reboot(_))), 0);
    assert_eq!(journal.count(is_power_cycle), 1);
}
