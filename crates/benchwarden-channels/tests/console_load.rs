//! Forced console load against a scripted boot loader.

use std::time::Duration;

use benchwarden_channels::xmodem::{crc16_xmodem, BLOCK_SIZE};
use benchwarden_channels::ConsoleSession;
use benchwarden_core::config::ConsoleConfig;
use benchwarden_core::{BootAssetPaths, BootAssetSet, ConsoleChannel};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const SOH: u8 = 0x01;
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;

async fn read_line(board: &mut DuplexStream) -> String {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        board.read_exact(&mut byte).await.unwrap();
        if byte[0] == b'\n' {
            return String::from_utf8(line).unwrap();
        }
        line.push(byte[0]);
    }
}

/// Receive one XMODEM-CRC upload after the loader asked for it.
async fn receive(board: &mut DuplexStream) -> Vec<u8> {
    let mut data = Vec::new();
    loop {
        let mut head = [0u8; 1];
        board.read_exact(&mut head).await.unwrap();
        if head[0] == EOT {
            board.write_all(&[ACK]).await.unwrap();
            return data;
        }
        assert_eq!(head[0], SOH);
        let mut rest = [0u8; BLOCK_SIZE + 4];
        board.read_exact(&mut rest).await.unwrap();
        let payload = &rest[2..2 + BLOCK_SIZE];
        let crc = u16::from_be_bytes([rest[2 + BLOCK_SIZE], rest[3 + BLOCK_SIZE]]);
        assert_eq!(crc, crc16_xmodem(payload));
        data.extend_from_slice(payload);
        board.write_all(&[ACK]).await.unwrap();
    }
}

/// Plays the boot loader: three `loadx` uploads, `fpga loadb`, `bootm`.
async fn boot_loader(mut board: DuplexStream) -> (Vec<String>, Vec<Vec<u8>>) {
    let mut commands = Vec::new();
    let mut uploads = Vec::new();
    for _ in 0..3 {
        let line = read_line(&mut board).await;
        assert!(line.starts_with("loadx "), "unexpected command {line}");
        let address = line.trim_start_matches("loadx ").to_string();
        commands.push(line);
        // The CRC request arrives in the same chunk as the banner.
        let banner = format!(
            "## Ready for binary (xmodem) download to {address} at 115200 bps...\r\nC"
        );
        board.write_all(banner.as_bytes()).await.unwrap();
        uploads.push(receive(&mut board).await);
        board
            .write_all(b"\r\n## Total Size      = 0x00000100 = 256 Bytes\r\nZynq> ")
            .await
            .unwrap();
    }

    let line = read_line(&mut board).await;
    commands.push(line);
    board.write_all(b"\r\nZynq> ").await.unwrap();

    let line = read_line(&mut board).await;
    commands.push(line);
    board
        .write_all(b"## Booting kernel from Legacy Image at 03000000 ...\r\nStarting kernel ...\r\n")
        .await
        .unwrap();

    (commands, uploads)
}

#[tokio::test]
async fn test_console_load_uploads_each_asset_then_boots() {
    let dir = tempfile::tempdir().unwrap();
    let write = |name: &str, bytes: Vec<u8>| {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    };
    let bitstream: Vec<u8> = (0..300u32).map(|i| (i * 7 % 256) as u8).collect();
    let kernel = b"uImage payload".to_vec();
    let dtb = vec![0xd0, 0x0d, 0xfe, 0xed];
    let paths = BootAssetPaths {
        system_top_bit: write("system_top.bit", bitstream.clone()),
        boot_bin: write("BOOT.BIN", vec![0u8; 16]),
        kernel_image: write("uImage", kernel.clone()),
        devicetree: write("devicetree.dtb", dtb.clone()),
    };
    let assets = BootAssetSet::validate(&paths).unwrap();

    let (host, board) = tokio::io::duplex(8192);
    let loader = tokio::spawn(boot_loader(board));
    let mut console = ConsoleSession::new(host, ConsoleConfig::default());

    console
        .load_boot_assets(&assets, Duration::from_secs(30))
        .await
        .unwrap();

    let (commands, uploads) = loader.await.unwrap();
    assert_eq!(
        commands,
        vec![
            "loadx 0x1000000",
            "loadx 0x3000000",
            "loadx 0x2a00000",
            "fpga loadb 0 0x1000000 0x12c",
            "bootm 0x3000000 - 0x2a00000",
        ]
    );
    assert_eq!(&uploads[0][..bitstream.len()], &bitstream[..]);
    assert_eq!(&uploads[1][..kernel.len()], &kernel[..]);
    assert_eq!(&uploads[2][..dtb.len()], &dtb[..]);
    assert_eq!(uploads[0].len(), 3 * BLOCK_SIZE);
}

#[tokio::test]
async fn test_tcp_console_connects_to_console_server() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = sock.read(&mut buf).await.unwrap();
        let line = String::from_utf8_lossy(&buf[..n]).to_string();
        sock.write_all(b"\r\n__BW_END__\r\n# ").await.unwrap();
        line
    });

    let config = ConsoleConfig {
        host: "127.0.0.1".into(),
        port,
        ..ConsoleConfig::default()
    };
    let mut console = benchwarden_channels::TcpConsole::connect(config, Duration::from_secs(5))
        .await
        .unwrap();
    console
        .request_dhcp(Duration::from_secs(5))
        .await
        .unwrap();

    let line = server.await.unwrap();
    assert!(line.starts_with("udhcpc -i eth0 -n -q;"));
}
