use opam_publish_core::archive::{file_checksum, Checksum, HttpFetcher};
use opam_publish_core::contract::{FetchOutcome, Fetcher};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_fetch_downloads_and_checksums() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/releases/pkg-1.2.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tarball".to_vec()))
        .mount(&server)
        .await;

    let dest = tempdir().unwrap();
    let fetcher = HttpFetcher::new();
    let outcome = fetcher
        .fetch(
            vec![format!("{}/releases/pkg-1.2.tar.gz", server.uri())],
            dest.path(),
        )
        .await;

    match outcome {
        FetchOutcome::Fetched { path, checksums } => {
            assert_eq!(path, dest.path().join("pkg-1.2.tar.gz"));
            assert_eq!(std::fs::read(&path).unwrap(), b"tarball");
            assert_eq!(checksums, vec![file_checksum(&path).unwrap()]);
        }
        other => panic!("expected a download, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fetch_falls_back_to_next_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.tar.gz"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/mirror/pkg.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"mirrored".to_vec()))
        .mount(&server)
        .await;

    let dest = tempdir().unwrap();
    let outcome = HttpFetcher::new()
        .fetch(
            vec![
                format!("{}/missing.tar.gz", server.uri()),
                format!("{}/mirror/pkg.tar.gz", server.uri()),
            ],
            dest.path(),
        )
        .await;
    assert!(matches!(outcome, FetchOutcome::Fetched { ref path, .. } if path.ends_with("pkg.tar.gz")));
}

#[tokio::test]
async fn test_fetch_failure_is_not_available() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dest = tempdir().unwrap();
    let outcome = HttpFetcher::new()
        .fetch(vec![format!("{}/pkg.tar.gz", server.uri())], dest.path())
        .await;
    match outcome {
        FetchOutcome::NotAvailable { reason } => assert!(reason.contains("500"), "{}", reason),
        other => panic!("expected NotAvailable, got {:?}", other),
    }
}

#[test]
fn test_checksum_parsing() {
    let hex = "a".repeat(64);
    let parsed: Checksum = format!("sha256={}", hex).parse().unwrap();
    assert_eq!(parsed, Checksum::sha256(hex.clone()));
    assert_eq!(parsed.to_string(), format!("sha256={}", hex));
    assert_eq!(hex.parse::<Checksum>().unwrap(), parsed);
    assert!("md5=d41d8cd98f00b204e9800998ecf8427e".parse::<Checksum>().is_err());
    assert!("sha256=xyz".parse::<Checksum>().is_err());
}

fn reply(writer: &mut TcpStream, line: &str) {
    writer.write_all(format!("{}\r\n", line).as_bytes()).unwrap();
}

/// Single-session passive-mode FTP responder serving `payload` for any RETR. Returns the port and
/// a handle yielding the commands it received.
fn ftp_responder(payload: Vec<u8>) -> (u16, thread::JoinHandle<Vec<String>>) {
    let control = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = control.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = control.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;
        let mut commands = Vec::new();
        let mut data: Option<thread::JoinHandle<()>> = None;
        reply(&mut writer, "220 ready");
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap() == 0 {
                break;
            }
            let line = line.trim_end().to_string();
            let verb = line.split(' ').next().unwrap_or("").to_ascii_uppercase();
            commands.push(line);
            match verb.as_str() {
                "USER" => reply(&mut writer, "331 password required"),
                "PASS" => reply(&mut writer, "230 logged in"),
                "TYPE" => reply(&mut writer, "200 type set"),
                "PASV" => {
                    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
                    let data_port = listener.local_addr().unwrap().port();
                    let payload = payload.clone();
                    data = Some(thread::spawn(move || {
                        let (mut conn, _) = listener.accept().unwrap();
                        conn.write_all(&payload).unwrap();
                    }));
                    reply(
                        &mut writer,
                        &format!(
                            "227 Entering Passive Mode (127,0,0,1,{},{})",
                            data_port >> 8,
                            data_port & 0xff
                        ),
                    );
                }
                "RETR" => {
                    reply(&mut writer, "150 opening data connection");
                    if let Some(transfer) = data.take() {
                        transfer.join().unwrap();
                    }
                    reply(&mut writer, "226 transfer complete");
                }
                "QUIT" => {
                    reply(&mut writer, "221 bye");
                    break;
                }
                _ => reply(&mut writer, "502 not implemented"),
            }
        }
        commands
    });
    (port, handle)
}

#[tokio::test]
async fn test_fetch_ftp_address() {
    let (port, server) = ftp_responder(b"ftp tarball".to_vec());
    let dest = tempdir().unwrap();

    let outcome = HttpFetcher::new()
        .fetch(
            vec![format!("ftp://127.0.0.1:{}/pub/pkg-1.2.tar.gz", port)],
            dest.path(),
        )
        .await;

    match outcome {
        FetchOutcome::Fetched { path, checksums } => {
            assert_eq!(path, dest.path().join("pkg-1.2.tar.gz"));
            assert_eq!(std::fs::read(&path).unwrap(), b"ftp tarball");
            assert_eq!(checksums, vec![file_checksum(&path).unwrap()]);
        }
        other => panic!("expected an ftp download, got {:?}", other),
    }
    let commands = server.join().unwrap();
    assert!(commands.contains(&"USER anonymous".to_string()), "{:?}", commands);
    assert!(commands.contains(&"TYPE I".to_string()), "{:?}", commands);
    assert!(
        commands.contains(&"RETR /pub/pkg-1.2.tar.gz".to_string()),
        "{:?}",
        commands
    );
}

#[tokio::test]
async fn test_unreachable_ftp_address_is_not_available() {
    // Nothing listens on a freshly released port.
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let dest = tempdir().unwrap();

    let outcome = HttpFetcher::new()
        .fetch(
            vec![format!("ftp://127.0.0.1:{}/pkg-1.2.tar.gz", port)],
            dest.path(),
        )
        .await;
    match outcome {
        FetchOutcome::NotAvailable { reason } => {
            assert!(reason.contains("FTP connect"), "{}", reason)
        }
        other => panic!("expected NotAvailable, got {:?}", other),
    }
}
