//! Shared fixtures for recovery integration tests.

#![allow(dead_code)]

use std::net::IpAddr;
use std::path::Path;

use benchwarden_core::fakes::Call;
use benchwarden_core::{BootAssetPaths, LoadStrategy, RecoveryOrchestrator, RecoveryTimings};

pub fn ip(raw: &str) -> IpAddr {
    raw.parse().unwrap()
}

/// Write four small boot assets into `dir`.
pub fn write_assets(dir: &Path) -> BootAssetPaths {
    let write = |name: &str, bytes: &[u8]| {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    };
    BootAssetPaths {
        system_top_bit: write("system_top.bit", &[0xAA; 256]),
        boot_bin: write("BOOT.BIN", &[0x55; 128]),
        kernel_image: write("uImage", b"kernel image bytes"),
        devicetree: write("devicetree.dtb", b"\xd0\x0d\xfe\xed"),
    }
}

pub fn orchestrator() -> RecoveryOrchestrator {
    RecoveryOrchestrator::new(RecoveryTimings::quick(), LoadStrategy::Console)
}

pub fn is_power_cycle(call: &Call) -> bool {
    matches!(call, Call::PowerCycle(_))
}

pub fn is_write_raw(call: &Call) -> bool {
    matches!(call, Call::WriteRaw(_))
}

pub fn is_check_booted(call: &Call) -> bool {
    matches!(call, Call::CheckBooted(_))
}

pub fn is_ssh_check(call: &Call) -> bool {
    matches!(call, Call::SshCheck(_))
}
