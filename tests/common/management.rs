//! Fake OpenVPN management interface.
//!
//! Greets every connection with a banner, reads one command, answers from
//! the configured script and closes. Received commands are recorded.

use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

pub const BANNER: &str = ">INFO:OpenVPN Management Interface Version 3 -- type 'help' for more info\r\n";

/// A status report with alice connected.
pub const ALICE_CONNECTED: &str = "OpenVPN CLIENT LIST\r\n\
Updated,Thu Jun 18 08:12:15 2015\r\n\
Common Name,Real Address,Bytes Received,Bytes Sent,Connected Since\r\n\
alice,10.0.0.5:51234,100,200,Mon Jan 2 15:04:05 2024\r\n\
ROUTING TABLE\r\n\
Virtual Address,Common Name,Real Address,Last Ref\r\n\
172.16.100.10,alice,10.0.0.5:51234,Mon Jan 2 15:05:00 2024\r\n\
GLOBAL STATS\r\n\
Max bcast/mcast queue length,0\r\n\
END\r\n";

/// How the fake daemon answers.
#[derive(Debug, Clone)]
pub enum MgmtScript {
    /// Reply to `status` with this report, to `kill` with SUCCESS.
    Report(String),
    /// Send the banner and never answer.
    Silent,
    /// Reply to anything with this many bytes of filler.
    Flood(usize),
    /// Like `Report`, but hold the first connection's reply back.
    SlowFirst(String, std::time::Duration),
}

pub struct FakeManagement {
    pub address: String,
    commands: Arc<Mutex<Vec<String>>>,
}

impl FakeManagement {
    pub async fn start(script: MgmtScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let commands = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&commands);
        tokio::spawn(async move {
            let mut accepted = 0usize;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                accepted += 1;
                let first = accepted == 1;
                let script = script.clone();
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut reader = BufReader::new(read_half);
                    if write_half.write_all(BANNER.as_bytes()).await.is_err() {
                        return;
                    }

                    let mut command = String::new();
                    if reader.read_line(&mut command).await.is_err() {
                        return;
                    }
                    let command = command.trim().to_string();
                    recorded.lock().unwrap().push(command.clone());

                    let reply = match &script {
                        MgmtScript::Report(report) if command == "status" => report.clone(),
                        MgmtScript::Report(_) => match command.strip_prefix("kill ") {
                            Some(cn) => format!("SUCCESS: common name '{}' found, 1 client(s) killed\r\n", cn),
                            None => "ERROR: unknown command\r\n".to_string(),
                        },
                        MgmtScript::Silent => {
                            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                            return;
                        }
                        MgmtScript::Flood(n) => "x".repeat(*n) + "\r\n",
                        MgmtScript::SlowFirst(report, delay) => {
                            if first {
                                tokio::time::sleep(*delay).await;
                            }
                            report.clone()
                        }
                    };
                    let _ = write_half.write_all(reply.as_bytes()).await;
                    let _ = write_half.shutdown().await;
                });
            }
        });

        Self { address, commands }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

/// Serve one raw HTTP response on a std listener thread.
///
/// Returns the base URL and a handle yielding the request head as received.
pub fn serve_http_once(status_line: &str, body: &[u8]) -> (String, std::thread::JoinHandle<String>) {
    use std::io::{Read, Write};

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let response = [
        format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status_line,
            body.len()
        )
        .into_bytes(),
        body.to_vec(),
    ]
    .concat();

    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        stream.write_all(&response).unwrap();
        String::from_utf8_lossy(&head).into_owned()
    });

    (url, handle)
}
